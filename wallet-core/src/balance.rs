//! Balance Aggregation
//!
//! Balances for a selection come from one batched chain lookup over all of
//! its addresses. The result is written back into the registry as cached
//! per-address balances and then summed, so `All` is always exactly the sum
//! of the active accounts.
//!
//! A failed lookup is not an error for the caller: the cached balance is
//! returned with `stale` set.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{Result, WalletError};
use crate::exchange::ExchangeRates;
use crate::refresh::{ChainFetcher, RefreshKind, Selection, Ticket};
use crate::registry::{AccountRegistry, Selector};

pub const SATOSHIS_PER_BTC: u64 = 100_000_000;

/// Unit BTC amounts are shown in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Denomination {
    #[default]
    Btc,
    #[serde(rename = "mbtc")]
    MilliBtc,
    Bits,
    Satoshi,
}

impl Denomination {
    /// Satoshis per unit and decimal places
    fn unit(self) -> (u64, usize) {
        match self {
            Self::Btc => (SATOSHIS_PER_BTC, 8),
            Self::MilliBtc => (100_000, 5),
            Self::Bits => (100, 2),
            Self::Satoshi => (1, 0),
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Self::Btc => "BTC",
            Self::MilliBtc => "mBTC",
            Self::Bits => "bits",
            Self::Satoshi => "sat",
        }
    }

    /// Exact decimal rendering, trailing zeros dropped
    pub fn format(self, satoshis: u64) -> String {
        let (unit, decimals) = self.unit();
        let whole = satoshis / unit;
        let fraction = satoshis % unit;
        if fraction == 0 {
            return format!("{} {}", whole, self.symbol());
        }

        let digits = format!("{:0width$}", fraction, width = decimals);
        format!("{}.{} {}", whole, digits.trim_end_matches('0'), self.symbol())
    }
}

impl std::str::FromStr for Denomination {
    type Err = WalletError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "btc" => Ok(Self::Btc),
            "mbtc" => Ok(Self::MilliBtc),
            "bits" => Ok(Self::Bits),
            "sat" | "sats" | "satoshi" => Ok(Self::Satoshi),
            other => Err(WalletError::Validation(format!("unknown denomination {}", other))),
        }
    }
}

/// Native units or fiat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayMode {
    #[default]
    Native,
    Fiat,
}

/// How balances are rendered
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplaySettings {
    pub mode: DisplayMode,
    pub denomination: Denomination,
    pub currency: String,
}

impl Default for DisplaySettings {
    fn default() -> Self {
        Self {
            mode: DisplayMode::Native,
            denomination: Denomination::Btc,
            currency: "USD".to_string(),
        }
    }
}

/// Fiat value of `satoshis` to two decimals
pub fn format_fiat(satoshis: u64, price: f64, currency: &str) -> String {
    let value = satoshis as f64 / SATOSHIS_PER_BTC as f64 * price;
    format!("{:.2} {}", value, currency.to_ascii_uppercase())
}

/// A rendered balance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceView {
    pub selector: Selector,
    pub satoshis: u64,
    pub display: String,
    /// Shown from cache because a refresh failed
    pub stale: bool,
}

pub struct BalanceAggregator {
    registry: AccountRegistry,
    fetcher: Arc<ChainFetcher>,
    rates: Arc<ExchangeRates>,
    selection: Selection,
}

impl BalanceAggregator {
    pub fn new(fetcher: Arc<ChainFetcher>, rates: Arc<ExchangeRates>, selection: Selection) -> Self {
        Self {
            registry: fetcher.registry().clone(),
            fetcher,
            rates,
            selection,
        }
    }

    /// Refresh and render the balance of `selector`.
    ///
    /// Returns `None` when the selection or the wallet changed while the
    /// lookup was in flight; the result is then dropped without touching the
    /// registry.
    pub async fn refresh(
        &self,
        selector: Selector,
        display: &DisplaySettings,
    ) -> Result<Option<BalanceView>> {
        let ticket = Ticket::issue(&self.selection, &self.registry)?;

        let stale = match self.fetcher.fetch(selector, RefreshKind::Balance).await {
            Ok(lookup) => {
                if !ticket.is_current(&self.selection, &self.registry) {
                    debug!("Discarding superseded balance refresh for {}", selector);
                    return Ok(None);
                }
                self.registry.record_activity(&lookup.addresses)?;
                false
            }
            Err(e @ WalletError::Network { .. }) => {
                warn!("Balance refresh for {} failed, showing cached balance: {}", selector, e);
                true
            }
            Err(e) => return Err(e),
        };

        self.view(selector, display, stale).await.map(Some)
    }

    /// Render the cached balance without a lookup
    pub async fn view(
        &self,
        selector: Selector,
        display: &DisplaySettings,
        stale: bool,
    ) -> Result<BalanceView> {
        let satoshis = self.registry.cached_balance(selector)?;
        let native = display.denomination.format(satoshis);

        let (text, stale) = match display.mode {
            DisplayMode::Native => (native, stale),
            DisplayMode::Fiat => match self.rates.snapshot().await {
                Ok((snapshot, rates_stale)) => match snapshot.price(&display.currency) {
                    Some(price) => (
                        format_fiat(satoshis, price, &display.currency),
                        stale || rates_stale,
                    ),
                    None => {
                        let currency = &display.currency;
                        warn!("No exchange rate for {}", currency);
                        (native, true)
                    }
                },
                Err(e) => {
                    warn!("Exchange rates unavailable: {}", e);
                    (native, true)
                }
            },
        };

        Ok(BalanceView {
            selector,
            satoshis,
            display: text,
            stale,
        })
    }

    /// Sum over every active account
    pub fn aggregate(&self) -> Result<u64> {
        self.registry.cached_balance(Selector::All)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MemoryChainBackend;
    use crate::config::RetryPolicy;
    use crate::exchange::StaticRateSource;
    use crate::keys::WalletKeys;
    use crate::wallet::Wallet;
    use std::time::Duration;

    const TEST_MNEMONIC: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";
    const IMPORTED: &str = "1BgGZ9tcN4rm9KBzDn7KprQz87SZ26SAMH";

    struct Fixture {
        registry: AccountRegistry,
        backend: Arc<MemoryChainBackend>,
        selection: Selection,
        aggregator: BalanceAggregator,
    }

    fn fixture() -> Fixture {
        let keys = WalletKeys::from_mnemonic(TEST_MNEMONIC).unwrap();
        let registry = AccountRegistry::with_wallet(Wallet::create(&keys, "My Wallet", 2).unwrap());
        registry.import_address(IMPORTED, None, None).unwrap();

        let backend = Arc::new(MemoryChainBackend::new());
        let fetcher = Arc::new(ChainFetcher::new(
            registry.clone(),
            backend.clone(),
            RetryPolicy::none(),
        ));
        let rates = Arc::new(ExchangeRates::new(
            Arc::new(StaticRateSource::new(&[("USD", 40_000.0)])),
            Duration::from_secs(60),
        ));
        let selection = Selection::default();
        let aggregator = BalanceAggregator::new(fetcher, rates, selection.clone());

        Fixture {
            registry,
            backend,
            selection,
            aggregator,
        }
    }

    #[test]
    fn test_denominations() {
        assert_eq!(Denomination::Btc.format(150_000_000), "1.5 BTC");
        assert_eq!(Denomination::Btc.format(8), "0.00000008 BTC");
        assert_eq!(Denomination::Btc.format(0), "0 BTC");
        assert_eq!(Denomination::MilliBtc.format(123_456), "1.23456 mBTC");
        assert_eq!(Denomination::Bits.format(1_050), "10.5 bits");
        assert_eq!(Denomination::Satoshi.format(42), "42 sat");
        assert_eq!("mBTC".parse::<Denomination>().unwrap(), Denomination::MilliBtc);
        assert!("doge".parse::<Denomination>().is_err());
    }

    #[test]
    fn test_fiat_formatting() {
        assert_eq!(format_fiat(50_000_000, 40_000.0, "usd"), "20000.00 USD");
        assert_eq!(format_fiat(1, 40_000.0, "EUR"), "0.00 EUR");
    }

    #[tokio::test]
    async fn test_all_is_sum_of_accounts() {
        let f = fixture();
        let addresses = f.registry.addresses(Selector::Hd(0)).unwrap();
        f.backend.set_balance(&addresses[0], 0, 1);
        f.backend.set_balance(&addresses[1], 5, 1);
        f.backend.set_balance(IMPORTED, 3, 1);

        let display = DisplaySettings {
            denomination: Denomination::Satoshi,
            ..Default::default()
        };
        let all = f
            .aggregator
            .refresh(Selector::All, &display)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(all.satoshis, 8);
        assert_eq!(all.display, "8 sat");
        assert!(!all.stale);

        let imported = f
            .aggregator
            .refresh(Selector::Imported(0), &display)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(imported.satoshis, 3);
        assert_eq!(f.aggregator.aggregate().unwrap(), 8);
    }

    #[tokio::test]
    async fn test_one_lookup_per_refresh() {
        let f = fixture();
        f.aggregator
            .refresh(Selector::All, &DisplaySettings::default())
            .await
            .unwrap();
        assert_eq!(f.backend.call_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_refreshes_coalesce() {
        let f = fixture();
        f.backend.set_latency(Duration::from_millis(30));
        let display = DisplaySettings::default();

        let (a, b) = tokio::join!(
            f.aggregator.refresh(Selector::All, &display),
            f.aggregator.refresh(Selector::All, &display)
        );

        assert!(a.unwrap().is_some());
        assert!(b.unwrap().is_some());
        assert_eq!(f.backend.call_count(), 1);
    }

    #[tokio::test]
    async fn test_network_failure_shows_stale_cache() {
        let f = fixture();
        f.backend.set_balance(IMPORTED, 3, 1);
        let display = DisplaySettings::default();
        f.aggregator.refresh(Selector::All, &display).await.unwrap();

        f.backend.fail_next(WalletError::network("timeout"));
        let view = f
            .aggregator
            .refresh(Selector::All, &display)
            .await
            .unwrap()
            .unwrap();
        assert!(view.stale);
        assert_eq!(view.satoshis, 3);
    }

    #[tokio::test]
    async fn test_superseded_refresh_is_discarded() {
        let f = fixture();
        f.backend.set_balance(IMPORTED, 3, 1);
        f.backend.set_latency(Duration::from_millis(50));
        let display = DisplaySettings::default();

        let (result, _) = tokio::join!(f.aggregator.refresh(Selector::All, &display), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            f.selection.select(Selector::Hd(0));
        });

        assert_eq!(result.unwrap(), None);
        assert_eq!(f.registry.cached_balance(Selector::Imported(0)).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_fiat_display() {
        let f = fixture();
        f.backend.set_balance(IMPORTED, 50_000_000, 1);
        let display = DisplaySettings {
            mode: DisplayMode::Fiat,
            ..Default::default()
        };

        let view = f
            .aggregator
            .refresh(Selector::All, &display)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(view.display, "20000.00 USD");
        assert!(!view.stale);

        let missing = DisplaySettings {
            mode: DisplayMode::Fiat,
            currency: "JPY".into(),
            ..Default::default()
        };
        let view = f.aggregator.view(Selector::All, &missing, false).await.unwrap();
        assert!(view.stale);
        assert_eq!(view.display, "0.5 BTC");
    }
}
