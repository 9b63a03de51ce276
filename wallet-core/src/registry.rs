//! Account Registry
//!
//! Sole owner of the unlocked [`Wallet`]. Every other component reads and
//! mutates accounts through an `AccountRegistry` handle; the handle is cheap
//! to clone and all clones share the same wallet.
//!
//! Presentation lists are position based: position 0 is the synthetic
//! "all accounts" entry, followed by active HD accounts in creation order,
//! followed by active imported addresses. The secondary-currency account is
//! not part of that list. Internally everything is addressed by [`Selector`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

use crate::chain::AddressSummary;
use crate::config::DEFAULT_GAP_LIMIT;
use crate::error::{Result, WalletError};
use crate::keys::{self, AccountKeys, Chain, WalletKeys};
use crate::wallet::{DerivedAddress, HdAccount, ImportedAddress, Secret, Wallet};

/// Account selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "index", rename_all = "lowercase")]
pub enum Selector {
    /// Every active HD account and imported address
    All,
    /// HD account by derivation index
    Hd(u32),
    /// Imported address by position in the wallet's import list
    Imported(usize),
    /// The secondary-currency account
    Secondary,
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "all"),
            Self::Hd(i) => write!(f, "hd:{}", i),
            Self::Imported(i) => write!(f, "imported:{}", i),
            Self::Secondary => write!(f, "secondary"),
        }
    }
}

/// Owner of an address in the wallet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedAddress {
    pub owner: Selector,
    pub label: String,
    /// On an HD account's change chain
    pub change: bool,
}

/// Shared handle to the unlocked wallet
#[derive(Clone)]
pub struct AccountRegistry {
    inner: Arc<RwLock<Option<Wallet>>>,
    /// Unused addresses kept derived past the last used one on each chain
    gap_limit: u32,
}

impl Default for AccountRegistry {
    fn default() -> Self {
        Self::with_gap_limit(DEFAULT_GAP_LIMIT)
    }
}

impl AccountRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_gap_limit(gap_limit: u32) -> Self {
        Self {
            inner: Arc::new(RwLock::new(None)),
            gap_limit,
        }
    }

    /// Registry already holding an unlocked wallet
    pub fn with_wallet(wallet: Wallet) -> Self {
        let registry = Self::new();
        registry.install(wallet);
        registry
    }

    /// Replace the current wallet (unlock or pull)
    pub fn install(&self, wallet: Wallet) {
        debug!(
            "Installing wallet {} at save version {}",
            wallet.guid, wallet.save_version
        );
        *self.write() = Some(wallet);
    }

    /// Drop the wallet. Secrets are zeroized as the wallet is dropped.
    pub fn lock(&self) {
        if self.write().take().is_some() {
            info!("Wallet locked");
        }
    }

    pub fn is_unlocked(&self) -> bool {
        self.read().is_some()
    }

    /// Run `f` against the wallet
    pub fn view<R>(&self, f: impl FnOnce(&Wallet) -> R) -> Result<R> {
        let guard = self.read();
        let wallet = guard.as_ref().ok_or(WalletError::Locked)?;
        Ok(f(wallet))
    }

    /// Run a mutation against the wallet. Mutations are serialized; a
    /// failing mutation must leave the wallet untouched.
    pub fn update<R>(&self, f: impl FnOnce(&mut Wallet) -> Result<R>) -> Result<R> {
        let mut guard = self.write();
        let wallet = guard.as_mut().ok_or(WalletError::Locked)?;
        f(wallet)
    }

    /// Owned copy for encoding
    pub fn snapshot(&self) -> Result<Wallet> {
        self.view(Wallet::clone)
    }

    pub fn save_version(&self) -> Result<u64> {
        self.view(|w| w.save_version)
    }

    pub fn set_save_version(&self, version: u64) -> Result<()> {
        self.update(|w| {
            w.save_version = version;
            Ok(())
        })
    }

    // ========================================================================
    // Selection
    // ========================================================================

    /// Selectable positions: `All`, active HD accounts, active imports
    pub fn selectors(&self) -> Result<Vec<Selector>> {
        self.view(|w| {
            let mut selectors = vec![Selector::All];
            selectors.extend(
                w.accounts
                    .iter()
                    .filter(|a| !a.archived)
                    .map(|a| Selector::Hd(a.index)),
            );
            selectors.extend(
                w.imported
                    .iter()
                    .enumerate()
                    .filter(|(_, i)| !i.archived)
                    .map(|(pos, _)| Selector::Imported(pos)),
            );
            selectors
        })
    }

    /// Number of active (non-archived) HD accounts and imported addresses
    pub fn active_account_count(&self) -> Result<usize> {
        Ok(self.selectors()?.len() - 1)
    }

    /// Selector at a list position. Positions past the end fall back to
    /// `All`.
    pub fn selector_at(&self, position: usize) -> Result<Selector> {
        let selectors = self.selectors()?;
        match selectors.get(position) {
            Some(selector) => Ok(*selector),
            None => {
                warn!(
                    "Selector position {} out of range ({} entries), using all accounts",
                    position,
                    selectors.len()
                );
                Ok(Selector::All)
            }
        }
    }

    /// Strict variant of [`selector_at`](Self::selector_at)
    pub fn try_selector_at(&self, position: usize) -> Result<Selector> {
        let selectors = self.selectors()?;
        selectors.get(position).copied().ok_or_else(|| {
            WalletError::Validation(format!(
                "account position {} out of range ({} entries)",
                position,
                selectors.len()
            ))
        })
    }

    pub fn position_of(&self, selector: Selector) -> Result<Option<usize>> {
        Ok(self.selectors()?.iter().position(|s| *s == selector))
    }

    /// Label shown for a selection
    pub fn label(&self, selector: Selector) -> Result<String> {
        self.view(|w| match selector {
            Selector::All => Ok("All Accounts".to_string()),
            Selector::Hd(i) => w
                .hd_account(i)
                .map(|a| a.label.clone())
                .ok_or_else(|| unknown(selector)),
            Selector::Imported(i) => w
                .imported
                .get(i)
                .map(|a| a.label.clone())
                .ok_or_else(|| unknown(selector)),
            Selector::Secondary => w
                .secondary
                .as_ref()
                .map(|s| s.label.clone())
                .ok_or_else(|| unknown(selector)),
        })?
    }

    /// An imported address without its private key. HD and secondary
    /// accounts always hold keys.
    pub fn is_watch_only(&self, selector: Selector) -> Result<bool> {
        self.view(|w| match selector {
            Selector::Imported(i) => w
                .imported
                .get(i)
                .map(ImportedAddress::is_watch_only)
                .ok_or_else(|| unknown(selector)),
            _ => Ok(false),
        })?
    }

    /// Bitcoin addresses covered by a selection
    pub fn addresses(&self, selector: Selector) -> Result<Vec<String>> {
        self.view(|w| match selector {
            Selector::All => Ok(w
                .accounts
                .iter()
                .filter(|a| !a.archived)
                .flat_map(|a| a.address_strings())
                .chain(
                    w.imported
                        .iter()
                        .filter(|i| !i.archived)
                        .map(|i| i.address.clone()),
                )
                .collect()),
            Selector::Hd(i) => w
                .hd_account(i)
                .map(|a| a.address_strings())
                .ok_or_else(|| unknown(selector)),
            Selector::Imported(i) => w
                .imported
                .get(i)
                .map(|a| vec![a.address.clone()])
                .ok_or_else(|| unknown(selector)),
            Selector::Secondary => Err(WalletError::Validation(
                "secondary account has no bitcoin addresses".into(),
            )),
        })?
    }

    /// Cached balance for a selection in satoshis
    pub fn cached_balance(&self, selector: Selector) -> Result<u64> {
        self.view(|w| match selector {
            Selector::All => Ok(w
                .accounts
                .iter()
                .filter(|a| !a.archived)
                .map(|a| a.balance)
                .chain(w.imported.iter().filter(|i| !i.archived).map(|i| i.balance))
                .sum()),
            Selector::Hd(i) => w
                .hd_account(i)
                .map(|a| a.balance)
                .ok_or_else(|| unknown(selector)),
            Selector::Imported(i) => w
                .imported
                .get(i)
                .map(|a| a.balance)
                .ok_or_else(|| unknown(selector)),
            Selector::Secondary => Err(WalletError::Validation(
                "secondary balance is not denominated in satoshis".into(),
            )),
        })?
    }

    /// Address to hand out for receiving into a selection
    pub fn receive_address(&self, selector: Selector) -> Result<String> {
        self.view(|w| match selector {
            Selector::Hd(i) => {
                let account = w.hd_account(i).ok_or_else(|| unknown(selector))?;
                account
                    .first_unused_receive()
                    .map(|a| a.address.clone())
                    .ok_or_else(|| {
                        WalletError::Derivation(format!(
                            "account {} has no unused receive address",
                            i
                        ))
                    })
            }
            Selector::Imported(i) => w
                .imported
                .get(i)
                .map(|a| a.address.clone())
                .ok_or_else(|| unknown(selector)),
            Selector::Secondary => w
                .secondary
                .as_ref()
                .map(|s| s.address.clone())
                .ok_or_else(|| unknown(selector)),
            Selector::All => Err(WalletError::Validation(
                "choose a single account to receive into".into(),
            )),
        })?
    }

    /// Label for an address owned by the wallet
    pub fn address_label(&self, address: &str) -> Result<Option<String>> {
        self.view(|w| w.address_label(address).map(str::to_string))
    }

    /// Every Bitcoin address the wallet owns, archived ones included
    pub fn address_book(&self) -> Result<HashMap<String, OwnedAddress>> {
        self.view(|w| {
            let mut book = HashMap::new();
            for account in &w.accounts {
                for address in account.addresses() {
                    book.insert(
                        address.address.clone(),
                        OwnedAddress {
                            owner: Selector::Hd(account.index),
                            label: account.label.clone(),
                            change: address.chain == Chain::Change,
                        },
                    );
                }
            }
            for (position, imported) in w.imported.iter().enumerate() {
                book.insert(
                    imported.address.clone(),
                    OwnedAddress {
                        owner: Selector::Imported(position),
                        label: imported.label.clone(),
                        change: false,
                    },
                );
            }
            book
        })
    }

    // ========================================================================
    // Mutation
    // ========================================================================

    pub fn set_label(&self, selector: Selector, label: &str) -> Result<()> {
        let label = label.trim();
        if label.is_empty() {
            return Err(WalletError::Validation("label must not be empty".into()));
        }

        self.update(|w| {
            let slot = match selector {
                Selector::Hd(i) => w.hd_account_mut(i).map(|a| &mut a.label),
                Selector::Imported(i) => w.imported.get_mut(i).map(|a| &mut a.label),
                Selector::Secondary => w.secondary.as_mut().map(|s| &mut s.label),
                Selector::All => None,
            };
            let slot = slot.ok_or_else(|| unknown(selector))?;
            *slot = label.to_string();
            debug!("Relabelled {}", selector);
            Ok(())
        })
    }

    /// Apply the one-shot label chosen during first run to the first account
    pub fn apply_pending_label(&self, pending: Option<String>) -> Result<bool> {
        match pending {
            Some(label) => {
                self.set_label(Selector::Hd(0), &label)?;
                info!("Applied pending label to first account");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Derive and append the next HD account
    pub fn add_account(&self, label: &str, gap_limit: u32) -> Result<Selector> {
        let label = label.trim();
        if label.is_empty() {
            return Err(WalletError::Validation("label must not be empty".into()));
        }

        self.update(|w| {
            let index = u32::try_from(w.accounts.len())
                .map_err(|_| WalletError::Derivation("too many accounts".into()))?;
            let keys = WalletKeys::from_mnemonic(w.mnemonic.expose())?;
            let account = keys.account(index)?.new_account(label, gap_limit)?;
            w.accounts.push(account);
            info!("Added HD account {}", index);
            Ok(Selector::Hd(index))
        })
    }

    pub fn set_archived(&self, selector: Selector, archived: bool) -> Result<()> {
        self.update(|w| {
            match selector {
                Selector::Hd(i) => {
                    if archived && i == w.options.default_account_index {
                        return Err(WalletError::Validation(
                            "the default account cannot be archived".into(),
                        ));
                    }
                    w.hd_account_mut(i).ok_or_else(|| unknown(selector))?.archived = archived;
                }
                Selector::Imported(i) => {
                    w.imported.get_mut(i).ok_or_else(|| unknown(selector))?.archived = archived;
                }
                Selector::All | Selector::Secondary => {
                    return Err(WalletError::Validation(format!(
                        "{} cannot be archived",
                        selector
                    )));
                }
            }
            debug!("Set archived={} on {}", archived, selector);
            Ok(())
        })
    }

    /// Import a standalone address, watch-only when `wif` is `None`
    pub fn import_address(
        &self,
        address: &str,
        wif: Option<&str>,
        label: Option<&str>,
    ) -> Result<Selector> {
        let address = address.trim();
        keys::validate_address(address)?;
        if let Some(wif) = wif {
            if keys::address_from_wif(wif)? != address {
                return Err(WalletError::Validation(
                    "private key does not control this address".into(),
                ));
            }
        }

        self.update(|w| {
            if w.imported.iter().any(|i| i.address == address)
                || w.accounts.iter().any(|a| a.owns(address))
            {
                return Err(WalletError::Validation(format!(
                    "address {} is already in this wallet",
                    address
                )));
            }

            w.imported.push(ImportedAddress {
                address: address.to_string(),
                private_key: wif.map(Secret::new),
                label: label.unwrap_or(address).to_string(),
                archived: false,
                balance: 0,
            });
            let position = w.imported.len() - 1;
            info!("Imported address {} (watch-only: {})", address, wif.is_none());
            Ok(Selector::Imported(position))
        })
    }

    /// Replace one chain of an HD account with freshly scanned addresses
    pub fn replace_chain(
        &self,
        account: u32,
        chain: Chain,
        addresses: Vec<DerivedAddress>,
    ) -> Result<()> {
        self.update(|w| {
            let hd = w
                .hd_account_mut(account)
                .ok_or_else(|| unknown(Selector::Hd(account)))?;
            match chain {
                Chain::Receive => hd.receive = addresses,
                Chain::Change => hd.change = addresses,
            }
            Ok(())
        })
    }

    /// Refresh cached balances and usage flags from a batched lookup.
    ///
    /// Each chain is then topped up from the account xpub so that it again
    /// ends in `gap_limit` unused addresses.
    pub fn record_activity(&self, summaries: &[AddressSummary]) -> Result<()> {
        let by_address: HashMap<&str, &AddressSummary> =
            summaries.iter().map(|s| (s.address.as_str(), s)).collect();
        let gap_limit = self.gap_limit;

        self.update(|w| {
            let mut accounts = w.accounts.clone();
            for account in &mut accounts {
                for address in account.addresses_mut() {
                    if let Some(summary) = by_address.get(address.address.as_str()) {
                        address.balance = summary.final_balance;
                        address.used |= summary.n_tx > 0;
                    }
                }
                account.balance = account.addresses().map(|a| a.balance).sum();

                let added = extend_look_ahead(account, gap_limit)?;
                if added > 0 {
                    debug!("Derived {} more addresses for account {}", added, account.index);
                }
            }
            w.accounts = accounts;
            for imported in &mut w.imported {
                if let Some(summary) = by_address.get(imported.address.as_str()) {
                    imported.balance = summary.final_balance;
                }
            }
            Ok(())
        })
    }

    pub fn secondary_address(&self) -> Result<String> {
        self.receive_address(Selector::Secondary)
    }

    pub fn set_secondary_balance(&self, balance: u128) -> Result<()> {
        self.update(|w| {
            let secondary = w
                .secondary
                .as_mut()
                .ok_or_else(|| unknown(Selector::Secondary))?;
            secondary.balance = balance;
            Ok(())
        })
    }

    /// Nonce to sign the next secondary transaction with
    pub fn secondary_nonce(&self) -> Result<u64> {
        self.view(|w| w.secondary.as_ref().map(|s| s.nonce))?
            .ok_or_else(|| unknown(Selector::Secondary))
    }

    /// Advance the nonce after a broadcast the remote accepted
    pub fn bump_secondary_nonce(&self) -> Result<u64> {
        self.update(|w| {
            let secondary = w
                .secondary
                .as_mut()
                .ok_or_else(|| unknown(Selector::Secondary))?;
            secondary.nonce += 1;
            Ok(secondary.nonce)
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, Option<Wallet>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Option<Wallet>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Derive past the end of each chain until it ends in `gap_limit` unused
/// addresses. Returns how many addresses were added.
fn extend_look_ahead(account: &mut HdAccount, gap_limit: u32) -> Result<usize> {
    let shortfall = |addresses: &[DerivedAddress]| {
        let unused_tail = addresses.iter().rev().take_while(|a| !a.used).count();
        (gap_limit as usize).saturating_sub(unused_tail)
    };
    let receive_missing = shortfall(&account.receive);
    let change_missing = shortfall(&account.change);
    if receive_missing == 0 && change_missing == 0 {
        return Ok(0);
    }

    let keys = AccountKeys::from_xpub(account.index, &account.xpub)?;
    for (addresses, chain, missing) in [
        (&mut account.receive, Chain::Receive, receive_missing),
        (&mut account.change, Chain::Change, change_missing),
    ] {
        if missing == 0 {
            continue;
        }
        let next = addresses.last().map_or(0, |a| a.index + 1);
        let count = u32::try_from(missing)
            .map_err(|_| WalletError::Derivation("look-ahead window too large".into()))?;
        addresses.extend(keys.derive_range(chain, next, count)?);
    }
    Ok(receive_missing + change_missing)
}

fn unknown(selector: Selector) -> WalletError {
    WalletError::Validation(format!("no such account: {}", selector))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_MNEMONIC: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";
    const OTHER_ADDRESS: &str = "1BgGZ9tcN4rm9KBzDn7KprQz87SZ26SAMH";

    fn registry() -> AccountRegistry {
        let keys = WalletKeys::from_mnemonic(TEST_MNEMONIC).unwrap();
        AccountRegistry::with_wallet(Wallet::create(&keys, "My Wallet", 2).unwrap())
    }

    #[test]
    fn test_selector_ordering() {
        let registry = registry();
        registry.add_account("Savings", 2).unwrap();
        registry.import_address(OTHER_ADDRESS, None, None).unwrap();

        assert_eq!(
            registry.selectors().unwrap(),
            vec![
                Selector::All,
                Selector::Hd(0),
                Selector::Hd(1),
                Selector::Imported(0)
            ]
        );
        assert_eq!(registry.active_account_count().unwrap(), 3);
        assert_eq!(registry.position_of(Selector::Hd(1)).unwrap(), Some(2));
    }

    #[test]
    fn test_out_of_range_position() {
        let registry = registry();

        assert_eq!(registry.selector_at(1).unwrap(), Selector::Hd(0));
        assert_eq!(registry.selector_at(42).unwrap(), Selector::All);
        assert!(matches!(
            registry.try_selector_at(42),
            Err(WalletError::Validation(_))
        ));
    }

    #[test]
    fn test_archived_accounts_leave_selection() {
        let registry = registry();
        registry.add_account("Old", 2).unwrap();
        registry.set_archived(Selector::Hd(1), true).unwrap();

        assert_eq!(registry.active_account_count().unwrap(), 1);
        assert!(registry.set_archived(Selector::Hd(0), true).is_err());
        assert!(registry.set_archived(Selector::All, true).is_err());

        registry.set_archived(Selector::Hd(1), false).unwrap();
        assert_eq!(registry.active_account_count().unwrap(), 2);
    }

    #[test]
    fn test_accounts_keep_indices() {
        let registry = registry();
        assert_eq!(registry.add_account("Second", 2).unwrap(), Selector::Hd(1));
        registry.set_archived(Selector::Hd(1), true).unwrap();
        assert_eq!(registry.add_account("Third", 2).unwrap(), Selector::Hd(2));
    }

    #[test]
    fn test_label_mutation() {
        let registry = registry();
        assert!(registry.apply_pending_label(Some("Daily".into())).unwrap());
        assert!(!registry.apply_pending_label(None).unwrap());
        assert_eq!(registry.label(Selector::Hd(0)).unwrap(), "Daily");
        assert!(registry.set_label(Selector::Hd(0), "  ").is_err());
        assert!(registry.set_label(Selector::All, "x").is_err());
    }

    #[test]
    fn test_import_rejects_duplicates() {
        let registry = registry();
        registry
            .import_address(OTHER_ADDRESS, None, Some("Paper"))
            .unwrap();

        assert!(matches!(
            registry.import_address(OTHER_ADDRESS, None, None),
            Err(WalletError::Validation(_))
        ));

        // Already owned by HD account 0
        let own = registry.receive_address(Selector::Hd(0)).unwrap();
        assert!(registry.import_address(&own, None, None).is_err());
    }

    #[test]
    fn test_watch_only_imports() {
        let registry = registry();
        let watched = registry.import_address(OTHER_ADDRESS, None, None).unwrap();
        assert!(registry.is_watch_only(watched).unwrap());
        assert!(!registry.is_watch_only(Selector::Hd(0)).unwrap());
        assert!(registry.is_watch_only(Selector::Imported(5)).is_err());

        let registry = self::registry();
        let spendable = registry
            .import_address(
                OTHER_ADDRESS,
                Some("KwDiBf89QgGbjEhKnhXJuH7LrciVrZi3qYjgd9M7rFU73sVHnoWn"),
                None,
            )
            .unwrap();
        assert!(!registry.is_watch_only(spendable).unwrap());
    }

    #[test]
    fn test_import_with_mismatched_key() {
        let registry = registry();
        let own = registry.receive_address(Selector::Hd(0)).unwrap();
        let result = registry.import_address(
            &own,
            Some("KwDiBf89QgGbjEhKnhXJuH7LrciVrZi3qYjgd9M7rFU73sVHnoWn"),
            None,
        );
        assert!(matches!(result, Err(WalletError::Validation(_))));
    }

    #[test]
    fn test_address_labels() {
        let registry = registry();
        let own = registry.receive_address(Selector::Hd(0)).unwrap();
        registry
            .import_address(OTHER_ADDRESS, None, Some("Paper"))
            .unwrap();

        assert_eq!(
            registry.address_label(&own).unwrap().as_deref(),
            Some("My Wallet")
        );
        assert_eq!(
            registry.address_label(OTHER_ADDRESS).unwrap().as_deref(),
            Some("Paper")
        );
        assert_eq!(registry.address_label("1nobody").unwrap(), None);
    }

    #[test]
    fn test_record_activity_updates_balances() {
        let registry = registry();
        registry.import_address(OTHER_ADDRESS, None, None).unwrap();
        let addresses = registry.addresses(Selector::Hd(0)).unwrap();

        registry
            .record_activity(&[
                AddressSummary {
                    address: addresses[0].clone(),
                    final_balance: 0,
                    n_tx: 2,
                },
                AddressSummary {
                    address: addresses[2].clone(),
                    final_balance: 5,
                    n_tx: 1,
                },
                AddressSummary {
                    address: OTHER_ADDRESS.to_string(),
                    final_balance: 3,
                    n_tx: 1,
                },
            ])
            .unwrap();

        assert_eq!(registry.cached_balance(Selector::Hd(0)).unwrap(), 5);
        assert_eq!(registry.cached_balance(Selector::Imported(0)).unwrap(), 3);
        assert_eq!(registry.cached_balance(Selector::All).unwrap(), 8);
        // First receive address is now used
        assert_eq!(registry.receive_address(Selector::Hd(0)).unwrap(), addresses[1]);
    }

    #[test]
    fn test_used_addresses_extend_the_window() {
        let keys = WalletKeys::from_mnemonic(TEST_MNEMONIC).unwrap();
        let registry = AccountRegistry::with_gap_limit(2);
        registry.install(Wallet::create(&keys, "My Wallet", 2).unwrap());

        let receive: Vec<String> = registry
            .view(|w| w.accounts[0].receive.iter().map(|a| a.address.clone()).collect())
            .unwrap();
        let summaries: Vec<AddressSummary> = receive
            .iter()
            .map(|address| AddressSummary {
                address: address.clone(),
                final_balance: 1_000,
                n_tx: 1,
            })
            .collect();
        registry.record_activity(&summaries).unwrap();

        let (window, unused) = registry
            .view(|w| {
                let chain = &w.accounts[0].receive;
                (chain.len(), chain.iter().filter(|a| !a.used).count())
            })
            .unwrap();
        assert_eq!(window, 4);
        assert_eq!(unused, 2);

        // Next address continues the derivation sequence
        let expected = keys
            .account(0)
            .unwrap()
            .derive_address(Chain::Receive, 2)
            .unwrap();
        assert_eq!(
            registry.receive_address(Selector::Hd(0)).unwrap(),
            expected.address
        );

        // Change chain saw no activity and keeps its window
        assert_eq!(registry.view(|w| w.accounts[0].change.len()).unwrap(), 2);
        // Balances of the old window are still counted
        assert_eq!(registry.cached_balance(Selector::Hd(0)).unwrap(), 2_000);
    }

    #[test]
    fn test_secondary_nonce() {
        let registry = registry();
        assert_eq!(registry.secondary_nonce().unwrap(), 0);
        assert_eq!(registry.bump_secondary_nonce().unwrap(), 1);
        assert_eq!(registry.secondary_nonce().unwrap(), 1);
    }

    #[test]
    fn test_lock() {
        let registry = registry();
        let clone = registry.clone();
        registry.lock();

        assert!(!clone.is_unlocked());
        assert!(matches!(clone.selectors(), Err(WalletError::Locked)));
    }
}
