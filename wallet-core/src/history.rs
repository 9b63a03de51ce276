//! Transaction Feed
//!
//! Chain transactions for a selection are related to the wallet (direction,
//! net amount, labelled parties) and merged with facilitated transactions
//! into one feed, newest first. A facilitated transaction whose hash matches
//! a confirmed chain transaction replaces that row and shows as completed.
//!
//! The feed is rebuilt from scratch on every refresh.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

use crate::chain::ChainTransaction;
use crate::error::{Result, WalletError};
use crate::fctx::{FacilitatedTransaction, FctxState};
use crate::refresh::{ChainFetcher, RefreshKind, Selection, Ticket};
use crate::registry::{AccountRegistry, OwnedAddress, Selector};
use crate::wallet::{Direction, Transaction, TxParty};

/// One side of a transaction, with the wallet's label when we own it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartyLabel {
    pub address: String,
    pub label: Option<String>,
    pub value: u64,
}

impl PartyLabel {
    pub fn display(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.address)
    }
}

/// A chain transaction as it relates to a selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRow {
    pub tx: Transaction,
    pub from: Vec<PartyLabel>,
    /// Recipients, without change returned to the sending account
    pub to: Vec<PartyLabel>,
    /// Newly generated coins
    pub coinbase: bool,
}

/// Relate a chain transaction to the addresses in `own`. `None` when it
/// does not touch them.
pub fn relate(
    chain_tx: &ChainTransaction,
    selector: Selector,
    own: &HashSet<String>,
    book: &HashMap<String, OwnedAddress>,
) -> Option<TransactionRow> {
    let sum_own = |parties: &[TxParty]| -> u64 {
        parties
            .iter()
            .filter(|p| own.contains(&p.address))
            .map(|p| p.value)
            .sum()
    };
    let in_own = sum_own(&chain_tx.inputs);
    let out_own = sum_own(&chain_tx.outputs);
    if in_own == 0 && out_own == 0 && !chain_tx.touches(own) {
        return None;
    }

    let funding: HashSet<Selector> = chain_tx
        .inputs
        .iter()
        .filter(|p| own.contains(&p.address))
        .filter_map(|p| book.get(&p.address).map(|o| o.owner))
        .collect();
    let is_change = |p: &TxParty| {
        book.get(&p.address)
            .is_some_and(|o| o.change && funding.contains(&o.owner))
    };

    let (direction, amount) = if in_own == 0 {
        (Direction::Received, out_own)
    } else if chain_tx.outputs.iter().all(|p| own.contains(&p.address)) {
        let moved: u64 = chain_tx
            .outputs
            .iter()
            .filter(|p| !is_change(p))
            .map(|p| p.value)
            .sum();
        (Direction::Transferred, if moved == 0 { out_own } else { moved })
    } else {
        (
            Direction::Sent,
            in_own.saturating_sub(out_own).saturating_sub(chain_tx.fee),
        )
    };

    let label = |p: &TxParty| PartyLabel {
        address: p.address.clone(),
        label: book.get(&p.address).map(|o| o.label.clone()),
        value: p.value,
    };

    Some(TransactionRow {
        tx: Transaction {
            hash: chain_tx.hash.clone(),
            direction,
            amount,
            fee: chain_tx.fee,
            confirmations: chain_tx.confirmations,
            timestamp: chain_tx.time,
            account: selector,
            inputs: chain_tx.inputs.clone(),
            outputs: chain_tx.outputs.clone(),
        },
        from: merge_parties(chain_tx.inputs.iter().map(label)),
        to: chain_tx
            .outputs
            .iter()
            .filter(|p| !is_change(p))
            .map(label)
            .collect(),
        coinbase: chain_tx.is_coinbase(),
    })
}

/// One entry per address, values summed
fn merge_parties(parties: impl Iterator<Item = PartyLabel>) -> Vec<PartyLabel> {
    let mut merged: Vec<PartyLabel> = Vec::new();
    for party in parties {
        match merged.iter_mut().find(|p| p.address == party.address) {
            Some(existing) => existing.value += party.value,
            None => merged.push(party),
        }
    }
    merged
}

/// Collapse repeated hashes, keeping the most confirmed entry
pub fn dedupe(rows: Vec<TransactionRow>) -> Vec<TransactionRow> {
    let mut by_hash: HashMap<String, TransactionRow> = HashMap::with_capacity(rows.len());
    for row in rows {
        match by_hash.get(&row.tx.hash) {
            Some(existing) if existing.tx.confirmations >= row.tx.confirmations => {}
            _ => {
                by_hash.insert(row.tx.hash.clone(), row);
            }
        }
    }
    by_hash.into_values().collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEntry {
    Transaction(TransactionRow),
    Facilitated {
        fctx: FacilitatedTransaction,
        /// The confirmed chain transaction that settled it
        settled_by: Option<TransactionRow>,
    },
}

impl FeedEntry {
    pub fn timestamp(&self) -> i64 {
        match self {
            Self::Transaction(row) => row.tx.timestamp,
            Self::Facilitated {
                settled_by: Some(row),
                ..
            } => row.tx.timestamp,
            Self::Facilitated { fctx, .. } => fctx.updated,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Transaction(row) => &row.tx.hash,
            Self::Facilitated { fctx, .. } => &fctx.id,
        }
    }
}

/// A merged, restartable feed
#[derive(Debug, Clone, Default)]
pub struct Feed {
    entries: Arc<Vec<FeedEntry>>,
    pub stale: bool,
}

impl Feed {
    pub fn iter(&self) -> std::slice::Iter<'_, FeedEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&FeedEntry> {
        self.entries.get(index)
    }

    /// Whether rendering `previous` again would show something different
    pub fn differs_from(&self, previous: &Feed) -> bool {
        self.entries != previous.entries
    }
}

impl<'a> IntoIterator for &'a Feed {
    type Item = &'a FeedEntry;
    type IntoIter = std::slice::Iter<'a, FeedEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Merge chain rows with facilitated transactions, newest first
pub fn merge(rows: Vec<TransactionRow>, facilitated: Vec<FacilitatedTransaction>, stale: bool) -> Feed {
    let rows = dedupe(rows);
    let mut confirmed: HashMap<String, TransactionRow> = rows
        .iter()
        .filter(|r| r.tx.is_confirmed())
        .map(|r| (r.tx.hash.clone(), r.clone()))
        .collect();
    let mut settled = HashSet::new();

    let mut entries: Vec<FeedEntry> = facilitated
        .into_iter()
        .filter(|f| f.state != FctxState::Deleted)
        .map(|mut fctx| {
            let settled_by = fctx.tx_hash.as_ref().and_then(|h| confirmed.remove(h));
            if let Some(row) = &settled_by {
                settled.insert(row.tx.hash.clone());
                if matches!(fctx.state, FctxState::PaymentBroadcast) {
                    fctx.state = FctxState::Completed;
                }
            }
            FeedEntry::Facilitated { fctx, settled_by }
        })
        .collect();

    entries.extend(
        rows.into_iter()
            .filter(|r| !settled.contains(&r.tx.hash))
            .map(FeedEntry::Transaction),
    );
    entries.sort_by(|a, b| {
        b.timestamp()
            .cmp(&a.timestamp())
            .then_with(|| a.id().cmp(b.id()))
    });

    Feed {
        entries: Arc::new(entries),
        stale,
    }
}

/// Chain rows for a selection, refreshed with stale fallback
pub struct TransactionMerger {
    registry: AccountRegistry,
    fetcher: Arc<ChainFetcher>,
    selection: Selection,
    last: Mutex<HashMap<Selector, Vec<TransactionRow>>>,
}

impl TransactionMerger {
    pub fn new(fetcher: Arc<ChainFetcher>, selection: Selection) -> Self {
        Self {
            registry: fetcher.registry().clone(),
            fetcher,
            selection,
            last: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch and relate chain transactions for `selector`.
    ///
    /// `Ok(None)` when the result was superseded while in flight. On a
    /// network failure the previous rows are returned, flagged stale.
    pub async fn transactions(&self, selector: Selector) -> Result<Option<(Vec<TransactionRow>, bool)>> {
        let ticket = Ticket::issue(&self.selection, &self.registry)?;

        match self.fetcher.fetch(selector, RefreshKind::Transactions).await {
            Ok(lookup) => {
                if !ticket.is_current(&self.selection, &self.registry) {
                    debug!("Discarding superseded transaction refresh for {}", selector);
                    return Ok(None);
                }
                let own: HashSet<String> = self.registry.addresses(selector)?.into_iter().collect();
                let book = self.registry.address_book()?;
                let rows = dedupe(
                    lookup
                        .txs
                        .iter()
                        .filter_map(|t| relate(t, selector, &own, &book))
                        .collect(),
                );
                self.last
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(selector, rows.clone());
                Ok(Some((rows, false)))
            }
            Err(e @ WalletError::Network { .. }) => {
                warn!("Transaction refresh for {} failed, showing previous list: {}", selector, e);
                let previous = self
                    .last
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get(&selector)
                    .cloned()
                    .unwrap_or_default();
                Ok(Some((previous, true)))
            }
            Err(e) => Err(e),
        }
    }
}

/// Hashes of confirmed rows
pub fn confirmed_hashes(rows: &[TransactionRow]) -> HashSet<String> {
    rows.iter()
        .filter(|r| r.tx.is_confirmed())
        .map(|r| r.tx.hash.clone())
        .collect()
}
