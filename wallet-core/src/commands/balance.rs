//! Balance check command

use anyhow::Result;

use crate::balance::DisplayMode;
use crate::registry::Selector;

use super::{print_success, print_warning, Context};

/// Run the balance command
pub async fn run(ctx: &Context, fiat: bool) -> Result<()> {
    let session = ctx.unlock()?;
    if fiat {
        session.update_preferences(|p| p.display.mode = DisplayMode::Fiat)?;
    }

    println!();
    println!("Fetching balances...");

    // One batched lookup over every address refreshes all cached balances
    session.select(Selector::All)?;
    let total = match session.refresh_balance().await? {
        Some(view) => view,
        None => session.balance_of(Selector::All).await?,
    };

    println!();
    print_success(&format!("Balance: {}", total.display));
    if total.stale {
        print_warning("Could not reach the network, showing cached balances");
    }

    let registry = session.registry();
    let selectors = registry.selectors()?;
    if selectors.len() > 2 {
        println!();
        for selector in selectors.into_iter().skip(1) {
            let view = session.balance_of(selector).await?;
            println!("  {:<24} {}", registry.label(selector)?, view.display);
        }
    }

    match session.refresh_secondary_balance().await {
        Ok(balance) => {
            println!();
            println!(
                "  {:<24} {} (smallest unit)",
                registry.label(Selector::Secondary)?,
                balance
            );
        }
        Err(e) => print_warning(&format!("Secondary balance unavailable: {}", e)),
    }

    Ok(())
}
