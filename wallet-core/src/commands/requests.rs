//! Payment request (facilitated transaction) commands

use anyhow::Result;

use crate::balance::Denomination;
use crate::fctx::Prompt;
use crate::registry::Selector;

use super::{print_success, print_warning, prompt_confirm, Context};

/// List open and past requests with what each one is waiting on
pub async fn list(ctx: &Context) -> Result<()> {
    let session = ctx.unlock()?;
    let facilitated = session.facilitated();
    let denomination = session.display().denomination;

    let mut entries = facilitated.for_selector(Selector::All)?;
    if entries.is_empty() {
        println!();
        println!("No payment requests.");
        return Ok(());
    }
    entries.sort_by(|a, b| b.updated.cmp(&a.updated));

    println!();
    for fctx in entries {
        let side = if fctx.is_payer() { "pay" } else { "receive" };
        println!(
            "{}  {:<18} {:<8} {:<16} with {}",
            fctx.id,
            fctx.state,
            side,
            denomination.format(fctx.amount),
            fctx.contact
        );
        if let Some(note) = &fctx.note {
            println!("    note: {}", note);
        }
        println!("    {}", describe(&facilitated.prompt(&fctx.id)?, denomination));
    }
    println!();

    Ok(())
}

/// Answer a request for an address with an account's receive address
pub async fn choose_account(ctx: &Context, id: &str, position: usize) -> Result<()> {
    let session = ctx.unlock()?;
    session.pull().await?;

    let fctx = session.facilitated().on_account_chosen(position, id).await?;
    session.save().await?;

    print_success(&format!(
        "Sent {} to {}",
        fctx.address.as_deref().unwrap_or_default(),
        fctx.contact
    ));
    Ok(())
}

/// Two-step delete: show the confirmation, then delete
pub async fn delete(ctx: &Context, id: &str, yes: bool) -> Result<()> {
    let session = ctx.unlock()?;
    session.pull().await?;

    let facilitated = session.facilitated();
    if let Prompt::ConfirmDelete { id } = facilitated.request_delete(id)? {
        if !yes && !prompt_confirm(&format!("Delete request {}?", id))? {
            println!("Aborted.");
            return Ok(());
        }
        facilitated.confirm_delete(&id).await?;
    }

    if let Err(e) = session.save().await {
        print_warning(&format!("Deleted locally but could not save: {}", e));
        return Err(e.into());
    }
    print_success(&format!("Deleted {}", id));
    Ok(())
}

fn describe(prompt: &Prompt, denomination: Denomination) -> String {
    match prompt {
        Prompt::ChooseAccount { id, accounts } => {
            let choices: Vec<String> = accounts
                .iter()
                .enumerate()
                .map(|(i, label)| format!("{}={}", i, label))
                .collect();
            format!(
                "choose a receiving account: wallet-core requests choose-account {} <{}>",
                id,
                choices.join(", ")
            )
        }
        Prompt::ConfirmSendAddress { id, account } => format!(
            "send the address of {}: wallet-core requests choose-account {} 0",
            account, id
        ),
        Prompt::WaitingForAddress => "waiting for the contact's address".to_string(),
        Prompt::Pay { address, amount, .. } => {
            format!("pay {} to {}", denomination.format(*amount), address)
        }
        Prompt::WaitingForPayment => "waiting for payment".to_string(),
        Prompt::ConfirmDelete { id } => format!("confirm deletion: wallet-core requests delete {}", id),
        Prompt::Nothing => "nothing to do".to_string(),
    }
}
