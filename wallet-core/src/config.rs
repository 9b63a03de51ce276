//! Wallet Configuration
//!
//! Loaded from a TOML file; every field has a default so an empty or missing
//! file yields a working configuration.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, WalletError};

/// Default number of consecutive unused addresses scanned before discovery
/// stops.
pub const DEFAULT_GAP_LIMIT: u32 = 20;

/// Argon2id parameters (tuned for security vs. usability)
const ARGON2_MEMORY_KIB: u32 = 65536; // 64 MB
const ARGON2_ITERATIONS: u32 = 3;
const ARGON2_PARALLELISM: u32 = 4;

/// Largest parameters a payload may ask to be decoded with
const MAX_KDF_MEMORY_KIB: u32 = 1024 * 1024; // 1 GB
const MAX_KDF_ITERATIONS: u32 = 64;
const MAX_KDF_PARALLELISM: u32 = 16;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WalletConfig {
    /// Base URL of the encrypted payload store
    pub payload_url: String,

    /// Base URL of the Bitcoin balance/transaction API
    pub chain_url: String,

    /// Base URL of the secondary-currency API
    pub secondary_url: String,

    /// Base URL of the exchange rate ticker
    pub rates_url: String,

    /// Base URL of the contact message relay
    pub contacts_url: String,

    /// Consecutive unused addresses before discovery stops
    pub gap_limit: u32,

    /// HTTP request timeout in seconds
    pub request_timeout_secs: u64,

    /// Seconds an exchange rate snapshot stays fresh
    pub rates_ttl_secs: u64,

    pub retry: RetryPolicy,

    pub kdf: KdfParams,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            payload_url: "https://wallet.example.com".to_string(),
            chain_url: "https://chain.example.com".to_string(),
            secondary_url: "https://secondary.example.com".to_string(),
            rates_url: "https://chain.example.com".to_string(),
            contacts_url: "https://wallet.example.com".to_string(),
            gap_limit: DEFAULT_GAP_LIMIT,
            request_timeout_secs: 30,
            rates_ttl_secs: 60,
            retry: RetryPolicy::default(),
            kdf: KdfParams::default(),
        }
    }
}

impl WalletConfig {
    /// Load a configuration file, falling back to defaults when it does not
    /// exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let text = fs::read_to_string(path)?;
        toml::from_str(&text)
            .map_err(|e| WalletError::Validation(format!("invalid config file: {}", e)))
    }

    /// Default data directory (`~/.wallet-core`)
    pub fn default_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".wallet-core")
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn rates_ttl(&self) -> Duration {
        Duration::from_secs(self.rates_ttl_secs)
    }
}

/// Bounded retry with exponential backoff for transient network failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff_ms: 250,
            max_backoff_ms: 4_000,
        }
    }
}

impl RetryPolicy {
    /// No retries, no sleeping.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
        }
    }

    /// Backoff before attempt `attempt` (1-based; the first attempt never
    /// waits).
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = 1u64 << (attempt - 2).min(16);
        Duration::from_millis(
            self.initial_backoff_ms
                .saturating_mul(factor)
                .min(self.max_backoff_ms),
        )
    }
}

/// Password stretching parameters. Stored inside every payload envelope so
/// that decoding always uses the parameters the payload was written with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: ARGON2_MEMORY_KIB,
            iterations: ARGON2_ITERATIONS,
            parallelism: ARGON2_PARALLELISM,
        }
    }
}

impl KdfParams {
    /// Parameters read from a payload, before any memory is committed to them
    pub fn check_bounds(&self) -> Result<()> {
        if self.memory_kib > MAX_KDF_MEMORY_KIB
            || self.iterations > MAX_KDF_ITERATIONS
            || self.parallelism > MAX_KDF_PARALLELISM
        {
            return Err(WalletError::Corruption(format!(
                "KDF parameters out of range (memory {} KiB, {} iterations, parallelism {})",
                self.memory_kib, self.iterations, self.parallelism
            )));
        }
        Ok(())
    }

    /// Minimal cost. Only for tests.
    pub fn insecure_for_tests() -> Self {
        Self {
            memory_kib: 64,
            iterations: 1,
            parallelism: 1,
        }
    }
}
