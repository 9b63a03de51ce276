//! Transaction history command

use anyhow::Result;
use chrono::{TimeZone, Utc};

use crate::history::{FeedEntry, TransactionRow};
use crate::registry::Selector;
use crate::wallet::Direction;

use super::{parse_selector, print_success, print_warning, Context};

/// Run the history command
pub async fn run(ctx: &Context, account: Option<&str>, limit: usize) -> Result<()> {
    let session = ctx.unlock()?;
    let selector = account.map(parse_selector).transpose()?.unwrap_or(Selector::All);
    session.select(selector)?;

    let feed = match session.refresh_feed().await? {
        Some(feed) => feed,
        None => session.feed(),
    };

    if feed.is_empty() {
        println!();
        println!("No transactions found.");
        return Ok(());
    }

    let denomination = session.display().denomination;

    println!();
    print_success(&format!(
        "Transaction History for {} ({} entries)",
        session.registry().label(selector)?,
        feed.len()
    ));
    if feed.stale {
        print_warning("Could not reach the network, showing cached transactions");
    }
    println!();
    println!(
        "{:<17} {:<12} {:<20} {:<6} {}",
        "Date", "Type", "Amount", "Conf", "Details"
    );
    println!("{}", "-".repeat(80));

    for entry in feed.iter().take(limit) {
        let date = format_time(entry.timestamp());
        match entry {
            FeedEntry::Transaction(row) => {
                println!(
                    "{:<17} {:<12} {:<20} {:<6} {}",
                    date,
                    direction_label(row),
                    denomination.format(row.tx.amount),
                    row.tx.confirmations,
                    counterparties(row)
                );
            }
            FeedEntry::Facilitated { fctx, settled_by } => {
                let confirmations = settled_by
                    .as_ref()
                    .map(|r| r.tx.confirmations.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<17} {:<12} {:<20} {:<6} {} with {} [{}]",
                    date,
                    "Request",
                    denomination.format(fctx.amount),
                    confirmations,
                    fctx.state,
                    fctx.contact,
                    fctx.id
                );
            }
        }
    }
    println!();

    Ok(())
}

fn direction_label(row: &TransactionRow) -> &'static str {
    match row.tx.direction {
        Direction::Received if row.coinbase => "Mined",
        Direction::Received => "Received",
        Direction::Sent => "Sent",
        Direction::Transferred => "Moved",
    }
}

fn counterparties(row: &TransactionRow) -> String {
    let parties = match row.tx.direction {
        Direction::Received => &row.from,
        Direction::Sent | Direction::Transferred => &row.to,
    };
    if row.coinbase {
        return "newly generated coins".to_string();
    }
    parties
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn format_time(timestamp: i64) -> String {
    Utc.timestamp_opt(timestamp, 0)
        .single()
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "pending".to_string())
}
