//! Bitcoin Chain Backend
//!
//! Balance and transaction lookups are always batched: one `multiaddr` call
//! covers every address of a selection and returns both per-address
//! summaries and the transactions touching them.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

use crate::error::{Result, WalletError};
use crate::wallet::TxParty;

/// Activity summary for one address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressSummary {
    pub address: String,
    /// Unspent balance in satoshis
    pub final_balance: u64,
    pub n_tx: u64,
}

/// A transaction as reported by the chain, before it is related to the
/// wallet's accounts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainTransaction {
    pub hash: String,
    /// Unix seconds
    pub time: i64,
    pub fee: u64,
    pub confirmations: u32,
    /// Inputs with a known address. Non-standard scripts are left out.
    pub inputs: Vec<TxParty>,
    pub outputs: Vec<TxParty>,
    /// Newly generated coins: no input spends a previous output
    #[serde(default)]
    pub coinbase: bool,
}

impl ChainTransaction {
    pub fn is_coinbase(&self) -> bool {
        self.coinbase
    }

    pub fn touches(&self, addresses: &HashSet<String>) -> bool {
        self.inputs
            .iter()
            .chain(self.outputs.iter())
            .any(|p| addresses.contains(&p.address))
    }
}

/// Result of one batched lookup
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MultiAddress {
    pub addresses: Vec<AddressSummary>,
    pub txs: Vec<ChainTransaction>,
}

#[async_trait]
pub trait ChainBackend: Send + Sync {
    /// Summaries and transactions for all `addresses` in a single request
    async fn multiaddr(&self, addresses: &[String]) -> Result<MultiAddress>;
}

// Wire format of the multiaddr endpoint

#[derive(Debug, Deserialize)]
struct RawMultiAddress {
    #[serde(default)]
    addresses: Vec<AddressSummary>,
    #[serde(default)]
    txs: Vec<RawTransaction>,
    info: RawInfo,
}

#[derive(Debug, Deserialize)]
struct RawInfo {
    latest_block: RawBlock,
}

#[derive(Debug, Deserialize)]
struct RawBlock {
    height: u64,
}

#[derive(Debug, Deserialize)]
struct RawTransaction {
    hash: String,
    time: i64,
    #[serde(default)]
    fee: u64,
    block_height: Option<u64>,
    #[serde(default)]
    inputs: Vec<RawInput>,
    #[serde(default)]
    out: Vec<RawOutput>,
}

#[derive(Debug, Deserialize)]
struct RawInput {
    prev_out: Option<RawOutput>,
}

#[derive(Debug, Deserialize)]
struct RawOutput {
    addr: Option<String>,
    value: u64,
}

impl RawTransaction {
    fn into_chain(self, tip: u64) -> ChainTransaction {
        let confirmations = match self.block_height {
            Some(height) if height <= tip => u32::try_from(tip - height + 1).unwrap_or(u32::MAX),
            _ => 0,
        };
        let coinbase = !self.inputs.is_empty() && self.inputs.iter().all(|i| i.prev_out.is_none());
        let party = |o: RawOutput| {
            o.addr.map(|address| TxParty {
                address,
                value: o.value,
            })
        };

        ChainTransaction {
            hash: self.hash,
            time: self.time,
            fee: self.fee,
            confirmations,
            inputs: self
                .inputs
                .into_iter()
                .filter_map(|i| i.prev_out)
                .filter_map(party)
                .collect(),
            outputs: self.out.into_iter().filter_map(party).collect(),
            coinbase,
        }
    }
}

/// HTTP chain backend (`GET {base}/multiaddr?active=a|b|c`)
pub struct HttpChainBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpChainBackend {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| WalletError::network_fatal(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ChainBackend for HttpChainBackend {
    async fn multiaddr(&self, addresses: &[String]) -> Result<MultiAddress> {
        if addresses.is_empty() {
            return Ok(MultiAddress::default());
        }

        debug!("multiaddr lookup for {} addresses", addresses.len());
        let response = self
            .client
            .get(format!("{}/multiaddr", self.base_url))
            .query(&[("active", addresses.join("|"))])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(WalletError::Network {
                message: format!("multiaddr returned HTTP {}", status),
                transient: status.is_server_error(),
            });
        }

        let raw: RawMultiAddress = response.json().await?;
        let tip = raw.info.latest_block.height;
        Ok(MultiAddress {
            addresses: raw.addresses,
            txs: raw.txs.into_iter().map(|t| t.into_chain(tip)).collect(),
        })
    }
}

#[derive(Default)]
struct MemoryChainState {
    summaries: HashMap<String, AddressSummary>,
    txs: Vec<ChainTransaction>,
    failures: Vec<WalletError>,
    latency: Duration,
}

/// In-memory chain for tests and offline use
#[derive(Default)]
pub struct MemoryChainBackend {
    state: Mutex<MemoryChainState>,
    calls: AtomicUsize,
}

impl MemoryChainBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_balance(&self, address: &str, final_balance: u64, n_tx: u64) {
        self.state().summaries.insert(
            address.to_string(),
            AddressSummary {
                address: address.to_string(),
                final_balance,
                n_tx,
            },
        );
    }

    pub fn add_transaction(&self, tx: ChainTransaction) {
        let mut state = self.state();
        state.txs.retain(|t| t.hash != tx.hash);
        state.txs.push(tx);
    }

    /// Fail the next lookup with `error`
    pub fn fail_next(&self, error: WalletError) {
        self.state().failures.push(error);
    }

    /// Delay every lookup
    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = latency;
    }

    /// Number of `multiaddr` calls served
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryChainState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ChainBackend for MemoryChainBackend {
    async fn multiaddr(&self, addresses: &[String]) -> Result<MultiAddress> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let latency = self.state().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state();
        if let Some(error) = state.failures.pop() {
            return Err(error);
        }

        let wanted: HashSet<String> = addresses.iter().cloned().collect();
        Ok(MultiAddress {
            addresses: addresses
                .iter()
                .map(|a| {
                    state.summaries.get(a).cloned().unwrap_or(AddressSummary {
                        address: a.clone(),
                        final_balance: 0,
                        n_tx: 0,
                    })
                })
                .collect(),
            txs: state
                .txs
                .iter()
                .filter(|t| t.touches(&wanted))
                .cloned()
                .collect(),
        })
    }
}
