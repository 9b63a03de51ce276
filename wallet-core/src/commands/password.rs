//! Change the wallet password

use anyhow::Result;

use super::init::prompt_new_password;
use super::{print_error, print_success, prompt_password, Context};

/// Run the password command
pub async fn run(ctx: &Context) -> Result<()> {
    let session = ctx.unlock()?;

    let current = prompt_password("Confirm current password: ")?;
    println!();
    let new_password = prompt_new_password()?;

    match session.change_password(&current, &new_password).await {
        Ok(version) => {
            print_success(&format!("Password changed (version {})", version));
            Ok(())
        }
        Err(e) => {
            print_error(&e.to_string());
            Err(e.into())
        }
    }
}
