//! Pull the latest wallet from the remote store

use anyhow::Result;

use super::{print_success, Context};

/// Run the pull command
pub async fn run(ctx: &Context) -> Result<()> {
    let session = ctx.unlock()?;
    let before = session.registry().save_version()?;

    println!("Pulling wallet...");
    let version = session.pull().await?;

    if version == before {
        print_success(&format!("Already up to date (version {})", version));
    } else {
        print_success(&format!("Updated from version {} to {}", before, version));
    }
    Ok(())
}
