//! Address import command

use anyhow::Result;
use zeroize::Zeroizing;

use crate::session::DEFAULT_SAVE_ATTEMPTS;

use super::{print_success, prompt_password, Context};

/// Import an address, watch-only unless `with_key` asks for its private key
pub async fn run(ctx: &Context, address: &str, label: Option<&str>, with_key: bool) -> Result<()> {
    let session = ctx.unlock()?;

    let wif = if with_key {
        Some(Zeroizing::new(prompt_password("Private key (WIF): ")?))
    } else {
        None
    };

    let selector = session
        .save_with(DEFAULT_SAVE_ATTEMPTS, |registry| {
            registry.import_address(address, wif.as_ref().map(|w| w.as_str()), label)
        })
        .await?;

    let kind = if with_key { "spendable" } else { "watch-only" };
    print_success(&format!("Imported {} as {} ({})", address, selector, kind));
    Ok(())
}
