//! Secondary-Currency Client
//!
//! Balance lookups and raw transaction broadcast against the secondary
//! currency's own API. A broadcast the remote has already seen comes back
//! as `Rejected { reason: Duplicate }`, which callers treat as success.

use async_trait::async_trait;
use serde::Deserialize;
use sha3::{Digest, Keccak256};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{RejectionReason, Result, WalletError};
use crate::registry::AccountRegistry;

#[async_trait]
pub trait SecondaryChain: Send + Sync {
    /// Balance for each address, in the currency's smallest unit
    async fn get_balances(&self, addresses: &[String]) -> Result<HashMap<String, u128>>;

    /// Broadcast a signed transaction (hex), returning its id
    async fn push_transaction(&self, raw_tx_hex: &str) -> Result<String>;
}

/// Broadcast through `client` and advance the account nonce on acceptance.
///
/// A duplicate submission leaves the nonce alone: the first submission
/// already advanced it.
pub async fn broadcast(
    client: &dyn SecondaryChain,
    registry: &AccountRegistry,
    raw_tx_hex: &str,
) -> Result<String> {
    match client.push_transaction(raw_tx_hex).await {
        Ok(tx_id) => {
            let nonce = registry.bump_secondary_nonce()?;
            info!("Broadcast secondary transaction {} (next nonce {})", tx_id, nonce);
            Ok(tx_id)
        }
        Err(e) if e.is_benign_duplicate() => {
            warn!("Secondary transaction already submitted");
            Err(e)
        }
        Err(e) => Err(e),
    }
}

/// Refresh the cached secondary balance
pub async fn refresh_balance(client: &dyn SecondaryChain, registry: &AccountRegistry) -> Result<u128> {
    let address = registry.secondary_address()?;
    let balances = client.get_balances(std::slice::from_ref(&address)).await?;
    let balance = balances
        .iter()
        .find(|(a, _)| a.eq_ignore_ascii_case(&address))
        .map(|(_, b)| *b)
        .unwrap_or(0);
    registry.set_secondary_balance(balance)?;
    Ok(balance)
}

#[derive(Debug, Deserialize)]
struct AccountResponse {
    /// Decimal string; balances overflow JSON numbers
    balance: String,
}

#[derive(Debug, Deserialize)]
struct PushTxResponse {
    #[serde(rename = "txHash")]
    tx_hash: Option<String>,
    message: Option<String>,
}

/// Balances keyed by the requested spelling of each address. Addresses the
/// remote left out have no balance yet.
fn parse_balances(
    addresses: &[String],
    body: HashMap<String, AccountResponse>,
) -> Result<HashMap<String, u128>> {
    let by_lower: HashMap<String, AccountResponse> = body
        .into_iter()
        .map(|(address, account)| (address.to_ascii_lowercase(), account))
        .collect();

    addresses
        .iter()
        .map(|address| {
            let balance = match by_lower.get(&address.to_ascii_lowercase()) {
                Some(account) => account.balance.parse::<u128>().map_err(|_| {
                    WalletError::network_fatal(format!("invalid balance {:?}", account.balance))
                })?,
                None => 0,
            };
            Ok((address.clone(), balance))
        })
        .collect()
}

/// HTTP client (`GET {base}/balances?addresses=a,b`, `POST {base}/pushtx`)
pub struct HttpSecondaryChain {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSecondaryChain {
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
impl SecondaryChain for HttpSecondaryChain {
    async fn get_balances(&self, addresses: &[String]) -> Result<HashMap<String, u128>> {
        if addresses.is_empty() {
            return Ok(HashMap::new());
        }

        let response = self
            .client
            .get(format!("{}/balances", self.base_url))
            .query(&[("addresses", addresses.join(","))])
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(WalletError::Network {
                message: format!("balance lookup returned HTTP {}", status),
                transient: status.is_server_error(),
            });
        }

        let body: HashMap<String, AccountResponse> = response.json().await?;
        debug!("Secondary balances for {} addresses", addresses.len());
        parse_balances(addresses, body)
    }

    async fn push_transaction(&self, raw_tx_hex: &str) -> Result<String> {
        debug!("Pushing secondary transaction ({} hex chars)", raw_tx_hex.len());
        let response = self
            .client
            .post(format!("{}/pushtx", self.base_url))
            .json(&serde_json::json!({ "rawTx": raw_tx_hex }))
            .send()
            .await?;

        let status = response.status();
        if status.is_server_error() {
            return Err(WalletError::network(format!("pushtx returned HTTP {}", status)));
        }

        let body: PushTxResponse = response.json().await?;
        if status.is_success() {
            if let Some(hash) = body.tx_hash {
                return Ok(hash);
            }
        }

        let message = body
            .message
            .unwrap_or_else(|| format!("pushtx returned HTTP {}", status));
        Err(WalletError::Rejected {
            reason: RejectionReason::from_message(&message),
        })
    }
}

#[derive(Default)]
struct MemorySecondaryState {
    balances: HashMap<String, u128>,
    submitted: HashSet<String>,
}

/// In-memory secondary chain. Rejects resubmission of a transaction it has
/// already accepted, and payloads that are not hex.
#[derive(Default)]
pub struct MemorySecondaryChain {
    state: Mutex<MemorySecondaryState>,
}

impl MemorySecondaryChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_balance(&self, address: &str, balance: u128) {
        self.state()
            .balances
            .insert(address.to_ascii_lowercase(), balance);
    }

    pub fn submitted_count(&self) -> usize {
        self.state().submitted.len()
    }

    fn state(&self) -> MutexGuard<'_, MemorySecondaryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl SecondaryChain for MemorySecondaryChain {
    async fn get_balances(&self, addresses: &[String]) -> Result<HashMap<String, u128>> {
        let state = self.state();
        Ok(addresses
            .iter()
            .map(|a| {
                let balance = state
                    .balances
                    .get(&a.to_ascii_lowercase())
                    .copied()
                    .unwrap_or(0);
                (a.clone(), balance)
            })
            .collect())
    }

    async fn push_transaction(&self, raw_tx_hex: &str) -> Result<String> {
        let raw = hex::decode(raw_tx_hex.trim_start_matches("0x")).map_err(|_| {
            WalletError::Rejected {
                reason: RejectionReason::Malformed("rlp: expected hex payload".into()),
            }
        })?;
        let tx_id = format!("0x{}", hex::encode(Keccak256::digest(&raw)));

        if !self.state().submitted.insert(tx_id.clone()) {
            return Err(WalletError::Rejected {
                reason: RejectionReason::from_message("Transaction already imported"),
            });
        }
        Ok(tx_id)
    }
}
