//! Account management commands

use anyhow::Result;

use crate::registry::Selector;
use crate::session::DEFAULT_SAVE_ATTEMPTS;

use super::{parse_selector, print_success, Context};

/// List accounts in selection order
pub async fn list(ctx: &Context, all: bool) -> Result<()> {
    let session = ctx.unlock()?;
    let registry = session.registry();

    println!();
    println!("{:<4} {:<14} {:<24} {:<36} {}", "Pos", "Id", "Label", "Receive address", "Balance");
    println!("{}", "-".repeat(96));

    for (position, selector) in registry.selectors()?.into_iter().enumerate() {
        let address = match selector {
            Selector::All => String::new(),
            other => registry.receive_address(other)?,
        };
        let balance = session.balance_of(selector).await?;
        let mut label = registry.label(selector)?;
        if registry.is_watch_only(selector)? {
            label.push_str(" (watch-only)");
        }
        println!(
            "{:<4} {:<14} {:<24} {:<36} {}",
            position,
            selector.to_string(),
            label,
            address,
            balance.display
        );
    }

    if all {
        let archived = registry.view(|w| {
            let mut archived: Vec<(Selector, String)> = w
                .accounts
                .iter()
                .filter(|a| a.archived)
                .map(|a| (Selector::Hd(a.index), a.label.clone()))
                .collect();
            archived.extend(
                w.imported
                    .iter()
                    .enumerate()
                    .filter(|(_, a)| a.archived)
                    .map(|(i, a)| (Selector::Imported(i), a.label.clone())),
            );
            archived
        })?;
        for (selector, label) in archived {
            println!("{:<4} {:<14} {:<24} (archived)", "-", selector.to_string(), label);
        }
    }

    println!();
    println!(
        "{:<4} {:<14} {:<24} {}",
        "-",
        Selector::Secondary.to_string(),
        registry.label(Selector::Secondary)?,
        registry.secondary_address()?
    );
    println!();

    Ok(())
}

/// Derive and save a new HD account
pub async fn add(ctx: &Context, label: &str) -> Result<()> {
    let session = ctx.unlock()?;
    let gap_limit = ctx.config.gap_limit;

    let selector = session
        .save_with(DEFAULT_SAVE_ATTEMPTS, |registry| registry.add_account(label, gap_limit))
        .await?;

    print_success(&format!("Added account {} ({})", label, selector));
    println!("Receive address: {}", session.registry().receive_address(selector)?);
    Ok(())
}

pub async fn label(ctx: &Context, account: &str, label: &str) -> Result<()> {
    let selector = parse_selector(account)?;
    let session = ctx.unlock()?;

    session
        .save_with(DEFAULT_SAVE_ATTEMPTS, |registry| registry.set_label(selector, label))
        .await?;

    print_success(&format!("Renamed {} to {}", selector, label));
    Ok(())
}

pub async fn archive(ctx: &Context, account: &str, restore: bool) -> Result<()> {
    let selector = parse_selector(account)?;
    let session = ctx.unlock()?;

    session
        .save_with(DEFAULT_SAVE_ATTEMPTS, |registry| {
            registry.set_archived(selector, !restore)
        })
        .await?;

    if restore {
        print_success(&format!("Restored {}", selector));
    } else {
        print_success(&format!("Archived {}", selector));
    }
    Ok(())
}
