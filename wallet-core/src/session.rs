//! Wallet Session
//!
//! Wires the engine together for one unlocked wallet: the registry, the
//! payload codec with its local cache and remote store, the refresh
//! pipeline (balances and the transaction feed), the facilitated
//! transaction protocol and the secondary chain.
//!
//! ## Saving
//!
//! Saves are strictly serialized through one async mutex. A push that hits a
//! version conflict marks the session as needing a pull; until a pull
//! succeeds every further save fails fast with `VersionConflict` instead of
//! reaching the remote. [`WalletSession::save_with`] does the
//! pull-and-reapply loop for a mutation.
//!
//! ## Refresh
//!
//! Refreshes are requested with [`RefreshRequest`] messages, either directly
//! or through the worker spawned by [`WalletSession::spawn_refresh_worker`].
//! Results are announced as [`SessionEvent`]s on a broadcast channel.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex as AsyncMutex};
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::balance::{BalanceAggregator, BalanceView, DisplaySettings};
use crate::chain::{ChainBackend, HttpChainBackend};
use crate::config::WalletConfig;
use crate::error::{Result, WalletError};
use crate::exchange::{ExchangeRates, HttpRateSource, RateSource};
use crate::fctx::{ContactChannel, FacilitatedTransactions, HttpContactChannel};
use crate::history::{self, Feed, TransactionMerger};
use crate::keys::{AccountKeys, Chain, GapLimitScan, WalletKeys};
use crate::payload::{Envelope, PayloadCodec};
use crate::prefs::Preferences;
use crate::refresh::{ChainFetcher, Selection};
use crate::registry::{AccountRegistry, Selector};
use crate::remote::{with_retry, HttpPayloadStore, PayloadStore, RemoteSyncClient};
use crate::secondary::{self, HttpSecondaryChain, SecondaryChain};
use crate::storage::{write_private, LocalCache};
use crate::wallet::Wallet;

/// Longest lockout after repeated wrong passwords
const MAX_LOCKOUT_SECS: u64 = 300;

/// Attempts `save_with` makes before giving up on a busy remote
pub const DEFAULT_SAVE_ATTEMPTS: u32 = 3;

const LIMITER_FILE: &str = "unlock_limit.json";

const EVENT_CHANNEL_SIZE: usize = 64;
const REQUEST_CHANNEL_SIZE: usize = 32;

/// The remote collaborators a session talks to
#[derive(Clone)]
pub struct Remotes {
    pub payload: Arc<dyn PayloadStore>,
    pub chain: Arc<dyn ChainBackend>,
    pub secondary: Arc<dyn SecondaryChain>,
    pub rates: Arc<dyn RateSource>,
    pub contacts: Arc<dyn ContactChannel>,
}

impl Remotes {
    /// HTTP clients for every remote named in `config`
    pub fn http(config: &WalletConfig) -> Result<Self> {
        let timeout = config.request_timeout();
        Ok(Self {
            payload: Arc::new(HttpPayloadStore::new(&config.payload_url, timeout)?),
            chain: Arc::new(HttpChainBackend::new(&config.chain_url, timeout)?),
            secondary: Arc::new(HttpSecondaryChain::new(&config.secondary_url, timeout)?),
            rates: Arc::new(HttpRateSource::new(&config.rates_url, timeout)?),
            contacts: Arc::new(HttpContactChannel::new(&config.contacts_url, timeout)?),
        })
    }
}

/// Work for the refresh worker. Always applies to the current selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshRequest {
    Balance,
    Transactions,
    /// Pull the payload first, then refresh both
    Full,
}

/// Notifications for whoever presents the wallet
#[derive(Debug, Clone)]
pub enum SessionEvent {
    BalanceUpdated(BalanceView),
    FeedUpdated(Feed),
    SelectionChanged(Selector),
    /// A pull installed this remote version
    Pulled(u64),
    /// A save was pushed as this version
    Saved(u64),
}

/// Exponential lockout after failed unlocks: 1s, 2s, 4s ... capped at
/// five minutes. Persisted so the lockout survives restarts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlockRateLimiter {
    failures: u32,
    /// Unix seconds
    locked_until: Option<i64>,
}

impl UnlockRateLimiter {
    pub fn path_in(dir: &Path) -> PathBuf {
        dir.join(LIMITER_FILE)
    }

    /// Unreadable state starts over rather than locking the user out
    pub fn load(path: &Path) -> Self {
        fs::read_to_string(path)
            .ok()
            .and_then(|json| serde_json::from_str(&json).ok())
            .unwrap_or_default()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string(self)
            .map_err(|e| WalletError::Io(format!("cannot serialize unlock state: {}", e)))?;
        write_private(path, json.as_bytes())
    }

    pub fn check(&self, now: i64) -> Result<()> {
        match self.locked_until {
            Some(until) if until > now => Err(WalletError::RateLimited {
                retry_after_secs: (until - now) as u64,
            }),
            _ => Ok(()),
        }
    }

    pub fn record_failure(&mut self, now: i64) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let lockout = Self::lockout(self.failures);
        self.locked_until = Some(now + lockout.as_secs() as i64);
        warn!(
            "Failed unlock attempt {}, locked for {:?}",
            self.failures, lockout
        );
        lockout
    }

    pub fn reset(&mut self) {
        self.failures = 0;
        self.locked_until = None;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    fn lockout(failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        Duration::from_secs((1u64 << exponent).min(MAX_LOCKOUT_SECS))
    }
}

#[derive(Debug, Default)]
struct SaveState {
    needs_pull: bool,
}

/// One unlocked (or about to be unlocked) wallet and everything around it
pub struct WalletSession {
    config: WalletConfig,
    registry: AccountRegistry,
    codec: PayloadCodec,
    cache: LocalCache,
    prefs_path: PathBuf,
    prefs: Mutex<Preferences>,
    sync: RemoteSyncClient,
    chain: Arc<dyn ChainBackend>,
    secondary: Arc<dyn SecondaryChain>,
    selection: Selection,
    balances: BalanceAggregator,
    history: TransactionMerger,
    facilitated: FacilitatedTransactions,
    password: Mutex<Option<Zeroizing<String>>>,
    save_state: AsyncMutex<SaveState>,
    limiter_path: PathBuf,
    limiter: Mutex<UnlockRateLimiter>,
    last_feed: Mutex<Feed>,
    events: broadcast::Sender<SessionEvent>,
}

impl WalletSession {
    /// A locked session keeping its cache and preferences in `data_dir`
    pub fn new(config: WalletConfig, data_dir: &Path, remotes: Remotes) -> Result<Self> {
        let prefs_path = Preferences::path_in(data_dir);
        let prefs = Preferences::load(&prefs_path)?;
        let limiter_path = UnlockRateLimiter::path_in(data_dir);
        let limiter = UnlockRateLimiter::load(&limiter_path);

        let registry = AccountRegistry::with_gap_limit(config.gap_limit);
        let selection = Selection::default();
        let fetcher = Arc::new(ChainFetcher::new(
            registry.clone(),
            Arc::clone(&remotes.chain),
            config.retry.clone(),
        ));
        let rates = Arc::new(ExchangeRates::new(remotes.rates, config.rates_ttl()));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);

        Ok(Self {
            codec: PayloadCodec::new(config.kdf),
            cache: LocalCache::in_dir(data_dir),
            prefs_path,
            prefs: Mutex::new(prefs),
            sync: RemoteSyncClient::new(remotes.payload, config.retry.clone()),
            chain: remotes.chain,
            secondary: remotes.secondary,
            balances: BalanceAggregator::new(Arc::clone(&fetcher), rates, selection.clone()),
            history: TransactionMerger::new(fetcher, selection.clone()),
            facilitated: FacilitatedTransactions::new(registry.clone(), remotes.contacts),
            registry,
            selection,
            password: Mutex::new(None),
            save_state: AsyncMutex::new(SaveState::default()),
            limiter_path,
            limiter: Mutex::new(limiter),
            last_feed: Mutex::new(Feed::default()),
            events,
            config,
        })
    }

    pub fn registry(&self) -> &AccountRegistry {
        &self.registry
    }

    pub fn facilitated(&self) -> &FacilitatedTransactions {
        &self.facilitated
    }

    pub fn config(&self) -> &WalletConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn has_cached_wallet(&self) -> bool {
        self.cache.exists()
    }

    pub fn preferences(&self) -> Preferences {
        lock(&self.prefs).clone()
    }

    /// Change preferences and persist them
    pub fn update_preferences(&self, f: impl FnOnce(&mut Preferences)) -> Result<()> {
        let mut prefs = lock(&self.prefs);
        f(&mut prefs);
        prefs.save(&self.prefs_path)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Create a wallet from `keys`, push it as the first remote version and
    /// cache it. With `discover` set, both chains of the first account are
    /// rescanned against the chain first (recovery from a mnemonic).
    pub async fn create(
        &self,
        keys: &WalletKeys,
        password: &str,
        first_label: &str,
        discover: bool,
    ) -> Result<Uuid> {
        if password.is_empty() {
            return Err(WalletError::Validation("password must not be empty".into()));
        }

        let wallet = Wallet::create(keys, first_label, self.config.gap_limit)?;
        let guid = wallet.guid;
        self.registry.install(wallet);
        *lock(&self.password) = Some(Zeroizing::new(password.to_string()));

        let pending = lock(&self.prefs).take_pending_label();
        if self.registry.apply_pending_label(pending)? {
            self.update_preferences(|_| {})?;
        }
        if discover {
            self.discover_addresses(0).await?;
        }

        let version = self.save().await?;
        info!("Created wallet {} at version {}", guid, version);
        Ok(guid)
    }

    /// Unlock from the local cache
    pub fn unlock(&self, password: &str) -> Result<Uuid> {
        let cached = self
            .cache
            .load()?
            .ok_or_else(|| WalletError::Validation("no wallet cached on this device".into()))?;
        self.unlock_envelope(&cached.envelope, cached.version, password)
    }

    /// Unlock straight from the remote store
    pub async fn unlock_remote(&self, guid: &Uuid, password: &str) -> Result<Uuid> {
        lock(&self.limiter).check(Utc::now().timestamp())?;
        let remote = self.sync.pull(guid).await?;
        let envelope = Envelope::from_json(&remote.payload)?;
        let guid = self.unlock_envelope(&envelope, remote.version, password)?;
        self.cache.save(&envelope, remote.version)?;
        Ok(guid)
    }

    fn unlock_envelope(&self, envelope: &Envelope, version: u64, password: &str) -> Result<Uuid> {
        let mut limiter = lock(&self.limiter);
        let now = Utc::now().timestamp();
        limiter.check(now)?;

        let mut wallet = match PayloadCodec::decode(envelope, password) {
            Ok(wallet) => wallet,
            Err(e @ WalletError::Authentication) => {
                limiter.record_failure(now);
                if let Err(save_err) = limiter.save(&self.limiter_path) {
                    warn!("Failed to save unlock state: {}", save_err);
                }
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        if limiter.failures() > 0 {
            limiter.reset();
            limiter.save(&self.limiter_path)?;
        }
        drop(limiter);

        wallet.save_version = version;
        let guid = wallet.guid;
        self.registry.install(wallet);
        *lock(&self.password) = Some(Zeroizing::new(password.to_string()));
        self.update_preferences(|p| p.last_known_version = Some(version))?;
        info!("Unlocked wallet {} at version {}", guid, version);
        Ok(guid)
    }

    /// Drop the wallet and the password from memory
    pub fn lock(&self) {
        self.registry.lock();
        *lock(&self.password) = None;
        *lock(&self.last_feed) = Feed::default();
    }

    /// Re-encrypt the wallet under `new_password` and push it. The old
    /// password stays in effect if the save fails.
    pub async fn change_password(&self, old_password: &str, new_password: &str) -> Result<u64> {
        if new_password.is_empty() {
            return Err(WalletError::Validation("password must not be empty".into()));
        }
        let mut state = self.save_state.lock().await;
        let previous = {
            let mut password = lock(&self.password);
            match password.as_ref() {
                Some(current) if current.as_str() == old_password => {
                    password.replace(Zeroizing::new(new_password.to_string()))
                }
                Some(_) => return Err(WalletError::Authentication),
                None => return Err(WalletError::Locked),
            }
        };

        match self.save_locked(&mut state).await {
            Ok(version) => {
                info!("Password changed at version {}", version);
                Ok(version)
            }
            Err(e) => {
                *lock(&self.password) = previous;
                Err(e)
            }
        }
    }

    // ========================================================================
    // Sync
    // ========================================================================

    /// Replace the local wallet with the remote's latest version
    pub async fn pull(&self) -> Result<u64> {
        let mut state = self.save_state.lock().await;
        self.pull_locked(&mut state).await
    }

    async fn pull_locked(&self, state: &mut SaveState) -> Result<u64> {
        let guid = self.registry.view(|w| w.guid)?;
        let password = self.password()?;

        let remote = self.sync.pull(&guid).await?;
        let envelope = Envelope::from_json(&remote.payload)?;
        let mut wallet = PayloadCodec::decode(&envelope, &password)?;
        if wallet.guid != guid {
            return Err(WalletError::Corruption(format!(
                "remote returned wallet {} for {}",
                wallet.guid, guid
            )));
        }

        wallet.save_version = remote.version;
        self.registry.install(wallet);
        self.cache.save(&envelope, remote.version)?;
        self.update_preferences(|p| p.last_known_version = Some(remote.version))?;
        state.needs_pull = false;

        info!("Pulled wallet {} at version {}", guid, remote.version);
        let _ = self.events.send(SessionEvent::Pulled(remote.version));
        Ok(remote.version)
    }

    /// Encrypt a snapshot and push it. Fails fast after an unresolved
    /// conflict.
    pub async fn save(&self) -> Result<u64> {
        let mut state = self.save_state.lock().await;
        self.save_locked(&mut state).await
    }

    async fn save_locked(&self, state: &mut SaveState) -> Result<u64> {
        let snapshot = self.registry.snapshot()?;
        if state.needs_pull {
            debug!("Refusing save of {} until the next pull", snapshot.guid);
            return Err(WalletError::VersionConflict {
                expected: snapshot.save_version,
                actual: None,
            });
        }

        let password = self.password()?;
        let envelope = self.codec.encode(&snapshot, &password)?;
        let payload = envelope.to_json()?;
        let checksum = envelope.checksum()?;

        match self
            .sync
            .push(&snapshot.guid, &payload, &checksum, snapshot.save_version)
            .await
        {
            Ok(version) => {
                self.registry.set_save_version(version)?;
                self.cache.save(&envelope, version)?;
                self.update_preferences(|p| p.last_known_version = Some(version))?;
                let _ = self.events.send(SessionEvent::Saved(version));
                Ok(version)
            }
            Err(e) => {
                if e.is_conflict() {
                    state.needs_pull = true;
                }
                Err(e)
            }
        }
    }

    /// Apply `mutation` and save it. On a version conflict the remote is
    /// pulled and the mutation re-applied to the pulled wallet, up to
    /// `max_attempts` times.
    pub async fn save_with<R, F>(&self, max_attempts: u32, mut mutation: F) -> Result<R>
    where
        F: FnMut(&AccountRegistry) -> Result<R>,
    {
        let mut state = self.save_state.lock().await;
        if state.needs_pull {
            self.pull_locked(&mut state).await?;
        }

        let mut attempt = 1;
        loop {
            let result = mutation(&self.registry)?;
            match self.save_locked(&mut state).await {
                Ok(_) => return Ok(result),
                Err(e) if e.is_conflict() && attempt < max_attempts => {
                    attempt += 1;
                    warn!("Save conflicted, pulling and re-applying (attempt {}/{})", attempt, max_attempts);
                    self.pull_locked(&mut state).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    // ========================================================================
    // Selection & refresh
    // ========================================================================

    pub fn selection(&self) -> Selector {
        self.selection.current()
    }

    /// Select an account. In-flight refreshes for the old selection are
    /// discarded when they finish.
    pub fn select(&self, selector: Selector) -> Result<bool> {
        self.registry.label(selector)?;
        let changed = self.selection.select(selector);
        if changed {
            let _ = self.events.send(SessionEvent::SelectionChanged(selector));
        }
        Ok(changed)
    }

    /// Select by presentation position; out of range falls back to "all"
    pub fn select_position(&self, position: usize) -> Result<Selector> {
        let selector = self.registry.selector_at(position)?;
        self.select(selector)?;
        Ok(selector)
    }

    pub fn display(&self) -> DisplaySettings {
        lock(&self.prefs).display.clone()
    }

    pub async fn refresh_balance(&self) -> Result<Option<BalanceView>> {
        let selector = self.selection.current();
        let view = self.balances.refresh(selector, &self.display()).await?;
        if let Some(view) = &view {
            let _ = self.events.send(SessionEvent::BalanceUpdated(view.clone()));
        }
        Ok(view)
    }

    /// Cached balance of any selector, without a lookup
    pub async fn balance_of(&self, selector: Selector) -> Result<BalanceView> {
        self.balances.view(selector, &self.display(), false).await
    }

    /// Rebuild the feed for the current selection. Facilitated transactions
    /// settled by a newly confirmed transaction are completed on the way.
    pub async fn refresh_feed(&self) -> Result<Option<Feed>> {
        let selector = self.selection.current();
        let (rows, stale) = match self.history.transactions(selector).await? {
            Some(result) => result,
            None => return Ok(None),
        };

        let completed = self
            .facilitated
            .observe_confirmations(&history::confirmed_hashes(&rows))?;
        if !completed.is_empty() {
            if let Err(e) = self.save().await {
                warn!("Could not save {} completed requests: {}", completed.len(), e);
            }
        }

        let feed = history::merge(rows, self.facilitated.for_selector(selector)?, stale);
        let changed = {
            let mut last = lock(&self.last_feed);
            let changed = feed.differs_from(&last) || feed.stale != last.stale;
            *last = feed.clone();
            changed
        };
        if changed {
            let _ = self.events.send(SessionEvent::FeedUpdated(feed.clone()));
        }
        Ok(Some(feed))
    }

    /// The last feed built, without a lookup
    pub fn feed(&self) -> Feed {
        lock(&self.last_feed).clone()
    }

    pub async fn handle(&self, request: RefreshRequest) -> Result<()> {
        debug!("Handling {:?} for {}", request, self.selection.current());
        match request {
            RefreshRequest::Balance => {
                self.refresh_balance().await?;
            }
            RefreshRequest::Transactions => {
                self.refresh_feed().await?;
            }
            RefreshRequest::Full => {
                match self.pull().await {
                    Ok(_) => {}
                    Err(e @ WalletError::Network { .. }) => {
                        warn!("Pull failed, refreshing local wallet: {}", e)
                    }
                    Err(e) => return Err(e),
                }
                self.refresh_balance().await?;
                self.refresh_feed().await?;
            }
        }
        Ok(())
    }

    /// Spawn a task serving refresh requests until every sender is dropped
    pub fn spawn_refresh_worker(self: &Arc<Self>) -> mpsc::Sender<RefreshRequest> {
        let (tx, mut rx) = mpsc::channel(REQUEST_CHANNEL_SIZE);
        let session = Arc::clone(self);

        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                if let Err(e) = session.handle(request).await {
                    warn!("Refresh {:?} failed: {}", request, e);
                }
            }
            debug!("Refresh worker stopped");
        });

        tx
    }

    // ========================================================================
    // Accounts
    // ========================================================================

    /// Rescan both chains of an HD account with the gap limit, one batched
    /// lookup per window.
    pub async fn discover_addresses(&self, account: u32) -> Result<usize> {
        let xpub = self
            .registry
            .view(|w| w.hd_account(account).map(|a| a.xpub.clone()))?
            .ok_or_else(|| WalletError::Validation(format!("unknown account {}", account)))?;
        let keys = AccountKeys::from_xpub(account, &xpub)?;

        let mut found = 0;
        let mut activity = Vec::new();
        for chain in [Chain::Receive, Chain::Change] {
            let mut scan = GapLimitScan::new(chain, self.config.gap_limit)?;
            while !scan.is_complete() {
                let window = scan.next_window(&keys)?;
                let addresses: Vec<String> = window.iter().map(|a| a.address.clone()).collect();
                let lookup = with_retry(&self.config.retry, "address discovery", || {
                    self.chain.multiaddr(&addresses)
                })
                .await?;

                scan.record(window, |derived| {
                    lookup
                        .addresses
                        .iter()
                        .any(|s| s.address == derived.address && s.n_tx > 0)
                });
                activity.extend(lookup.addresses.iter().cloned());
            }

            let addresses = scan.finish();
            found += addresses.iter().filter(|a| a.used).count();
            debug!("Discovered {} {:?} addresses for account {}", addresses.len(), chain, account);
            self.registry.replace_chain(account, chain, addresses)?;
        }
        self.registry.record_activity(&activity)?;

        info!("Account {} has {} used addresses", account, found);
        Ok(found)
    }

    // ========================================================================
    // Secondary currency
    // ========================================================================

    /// Broadcast a signed secondary transaction and persist the new nonce
    pub async fn broadcast_secondary(&self, raw_tx_hex: &str) -> Result<String> {
        let tx_id = secondary::broadcast(self.secondary.as_ref(), &self.registry, raw_tx_hex).await?;
        if let Err(e) = self.save().await {
            warn!("Broadcast {} succeeded but saving the nonce failed: {}", tx_id, e);
        }
        Ok(tx_id)
    }

    pub async fn refresh_secondary_balance(&self) -> Result<u128> {
        secondary::refresh_balance(self.secondary.as_ref(), &self.registry).await
    }

    fn password(&self) -> Result<Zeroizing<String>> {
        lock(&self.password).clone().ok_or(WalletError::Locked)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
