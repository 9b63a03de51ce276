//! Exchange Rates
//!
//! Fiat prices for BTC, fetched from a ticker and cached with a TTL. A
//! snapshot is immutable once fetched; refreshing replaces it wholesale.
//!
//! When a refresh fails the last snapshot is still served, flagged stale.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{Result, WalletError};

/// Default TTL for a cached snapshot (60 seconds).
pub const DEFAULT_RATES_TTL: Duration = Duration::from_secs(60);

/// Currency code → price of one BTC
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeRateSnapshot {
    rates: HashMap<String, f64>,
    pub fetched_at: DateTime<Utc>,
}

impl ExchangeRateSnapshot {
    pub fn new(rates: impl IntoIterator<Item = (String, f64)>) -> Self {
        Self {
            rates: rates
                .into_iter()
                .map(|(code, price)| (code.to_ascii_uppercase(), price))
                .collect(),
            fetched_at: Utc::now(),
        }
    }

    pub fn price(&self, currency: &str) -> Option<f64> {
        self.rates.get(&currency.to_ascii_uppercase()).copied()
    }

    pub fn currencies(&self) -> Vec<&str> {
        let mut codes: Vec<&str> = self.rates.keys().map(String::as_str).collect();
        codes.sort_unstable();
        codes
    }
}

/// Where snapshots come from
#[async_trait]
pub trait RateSource: Send + Sync {
    async fn fetch(&self) -> Result<ExchangeRateSnapshot>;
}

#[derive(Debug, Deserialize)]
struct TickerEntry {
    last: f64,
}

/// Ticker endpoint returning `{"USD": {"last": 43000.0, ...}, ...}`
pub struct HttpRateSource {
    client: reqwest::Client,
    url: String,
}

impl HttpRateSource {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| WalletError::network_fatal(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: format!("{}/ticker", base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl RateSource for HttpRateSource {
    async fn fetch(&self) -> Result<ExchangeRateSnapshot> {
        debug!("Fetching exchange rates from {}", self.url);
        let response = self.client.get(&self.url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(WalletError::Network {
                message: format!("ticker returned HTTP {}", status),
                transient: status.is_server_error(),
            });
        }

        let ticker: HashMap<String, TickerEntry> = response.json().await?;
        Ok(ExchangeRateSnapshot::new(
            ticker.into_iter().map(|(code, entry)| (code, entry.last)),
        ))
    }
}

/// Fixed rates, for offline use and tests
pub struct StaticRateSource {
    rates: Vec<(String, f64)>,
    fetches: AtomicUsize,
}

impl StaticRateSource {
    pub fn new(rates: &[(&str, f64)]) -> Self {
        Self {
            rates: rates.iter().map(|(c, p)| (c.to_string(), *p)).collect(),
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RateSource for StaticRateSource {
    async fn fetch(&self) -> Result<ExchangeRateSnapshot> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(ExchangeRateSnapshot::new(self.rates.clone()))
    }
}

/// Snapshot with TTL-based expiration.
#[derive(Debug, Clone)]
pub struct CachedRates {
    snapshot: Option<Arc<ExchangeRateSnapshot>>,
    last_updated: Option<Instant>,
    ttl: Duration,
}

impl Default for CachedRates {
    fn default() -> Self {
        Self::with_ttl(DEFAULT_RATES_TTL)
    }
}

impl CachedRates {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            snapshot: None,
            last_updated: None,
            ttl,
        }
    }

    pub fn update(&mut self, snapshot: ExchangeRateSnapshot) {
        self.snapshot = Some(Arc::new(snapshot));
        self.last_updated = Some(Instant::now());
    }

    /// The snapshot if it has not expired
    pub fn fresh(&self) -> Option<Arc<ExchangeRateSnapshot>> {
        self.last_updated
            .filter(|t| t.elapsed() < self.ttl)
            .and(self.snapshot.clone())
    }

    /// The snapshot regardless of age
    pub fn latest(&self) -> Option<Arc<ExchangeRateSnapshot>> {
        self.snapshot.clone()
    }

    pub fn needs_refresh(&self) -> bool {
        self.fresh().is_none()
    }

    pub fn time_until_expiry(&self) -> Option<Duration> {
        self.last_updated
            .and_then(|t| self.ttl.checked_sub(t.elapsed()))
    }
}

/// Rates served from cache, refreshed from a source when expired
pub struct ExchangeRates {
    source: Arc<dyn RateSource>,
    cache: Mutex<CachedRates>,
}

impl ExchangeRates {
    pub fn new(source: Arc<dyn RateSource>, ttl: Duration) -> Self {
        Self {
            source,
            cache: Mutex::new(CachedRates::with_ttl(ttl)),
        }
    }

    /// Current snapshot and whether it is stale
    pub async fn snapshot(&self) -> Result<(Arc<ExchangeRateSnapshot>, bool)> {
        let mut cache = self.cache.lock().await;
        if let Some(snapshot) = cache.fresh() {
            return Ok((snapshot, false));
        }

        match self.source.fetch().await {
            Ok(snapshot) => {
                cache.update(snapshot);
                let snapshot = cache
                    .latest()
                    .ok_or_else(|| WalletError::network("rate cache empty after update"))?;
                Ok((snapshot, false))
            }
            Err(e) => match cache.latest() {
                Some(previous) => {
                    warn!("Exchange rate refresh failed, using stale rates: {}", e);
                    Ok((previous, true))
                }
                None => Err(e),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingSource;

    #[async_trait]
    impl RateSource for FailingSource {
        async fn fetch(&self) -> Result<ExchangeRateSnapshot> {
            Err(WalletError::network("ticker down"))
        }
    }

    #[test]
    fn test_currency_lookup_is_case_insensitive() {
        let snapshot = ExchangeRateSnapshot::new(vec![("usd".to_string(), 43000.0)]);
        assert_eq!(snapshot.price("USD"), Some(43000.0));
        assert_eq!(snapshot.price("usd"), Some(43000.0));
        assert_eq!(snapshot.price("EUR"), None);
    }

    #[test]
    fn test_cache_expiry() {
        let mut cache = CachedRates::with_ttl(Duration::from_secs(60));
        assert!(cache.needs_refresh());

        cache.update(ExchangeRateSnapshot::new(vec![("USD".to_string(), 1.0)]));
        assert!(!cache.needs_refresh());
        assert!(cache.time_until_expiry().unwrap() <= Duration::from_secs(60));

        let mut expired = CachedRates::with_ttl(Duration::ZERO);
        expired.update(ExchangeRateSnapshot::new(vec![("USD".to_string(), 1.0)]));
        assert!(expired.fresh().is_none());
        assert!(expired.latest().is_some());
    }

    #[tokio::test]
    async fn test_fresh_snapshot_is_reused() {
        let source = Arc::new(StaticRateSource::new(&[("USD", 43000.0)]));
        let rates = ExchangeRates::new(source.clone(), Duration::from_secs(60));

        rates.snapshot().await.unwrap();
        let (snapshot, stale) = rates.snapshot().await.unwrap();

        assert_eq!(source.fetch_count(), 1);
        assert!(!stale);
        assert_eq!(snapshot.price("USD"), Some(43000.0));
    }

    #[tokio::test]
    async fn test_failure_without_cache() {
        let rates = ExchangeRates::new(Arc::new(FailingSource), Duration::from_secs(60));
        assert!(rates.snapshot().await.is_err());
    }
}
