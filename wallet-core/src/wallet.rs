//! Wallet Data Model
//!
//! The decrypted contents of a payload. A [`Wallet`] is owned by exactly one
//! [`AccountRegistry`](crate::registry::AccountRegistry) while unlocked and is
//! dropped (and its secrets zeroized) on lock.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::error::Result;
use crate::fctx::FacilitatedTransaction;
use crate::keys::{Chain, WalletKeys};
use crate::registry::Selector;

/// Payload schema version written by this crate
pub const PAYLOAD_SCHEMA_VERSION: u32 = 4;

/// Secret string material (mnemonics, private keys).
///
/// Zeroized on drop and redacted from `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(Zeroizing<String>);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(Zeroizing::new(value.into()))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret([redacted])")
    }
}

impl Serialize for Secret {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.expose())
    }
}

impl<'de> Deserialize<'de> for Secret {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Zeroizing::new(String::deserialize(deserializer)?);
        Ok(Self::new(value.as_str()))
    }
}

/// A derived address. Immutable once derived; only `used` and `balance` are
/// refreshed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedAddress {
    pub chain: Chain,
    pub index: u32,
    /// Full derivation path, e.g. `m/44'/0'/0'/0/3`
    pub path: String,
    /// Compressed public key (hex)
    pub public_key: String,
    pub address: String,
    #[serde(default)]
    pub used: bool,
    /// Cached balance in satoshis
    #[serde(default)]
    pub balance: u64,
}

/// Hierarchical-deterministic account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HdAccount {
    /// Derivation index. Contiguous from 0 and never reassigned.
    pub index: u32,
    pub label: String,
    #[serde(default)]
    pub archived: bool,
    /// Account-level extended public key
    pub xpub: String,
    pub receive: Vec<DerivedAddress>,
    pub change: Vec<DerivedAddress>,
    /// Cached balance in satoshis
    #[serde(default)]
    pub balance: u64,
}

impl HdAccount {
    pub fn addresses(&self) -> impl Iterator<Item = &DerivedAddress> {
        self.receive.iter().chain(self.change.iter())
    }

    pub fn addresses_mut(&mut self) -> impl Iterator<Item = &mut DerivedAddress> {
        self.receive.iter_mut().chain(self.change.iter_mut())
    }

    pub fn address_strings(&self) -> Vec<String> {
        self.addresses().map(|a| a.address.clone()).collect()
    }

    pub fn owns(&self, address: &str) -> bool {
        self.addresses().any(|a| a.address == address)
    }

    /// First receive address without on-chain activity
    pub fn first_unused_receive(&self) -> Option<&DerivedAddress> {
        self.receive.iter().find(|a| !a.used)
    }
}

/// Standalone address imported into the wallet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportedAddress {
    pub address: String,
    /// WIF private key. `None` for watch-only addresses.
    #[serde(default)]
    pub private_key: Option<Secret>,
    pub label: String,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub balance: u64,
}

impl ImportedAddress {
    pub fn is_watch_only(&self) -> bool {
        self.private_key.is_none()
    }
}

/// Single-address account for the secondary currency
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecondaryAccount {
    pub label: String,
    pub address: String,
    pub path: String,
    /// Cached balance in the currency's smallest unit
    #[serde(default)]
    pub balance: u128,
    /// Next nonce for outgoing transactions
    #[serde(default)]
    pub nonce: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WalletOptions {
    pub default_account_index: u32,
}

/// Root aggregate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    pub guid: Uuid,
    pub schema_version: u32,
    /// Remote save version this wallet was last pulled at or pushed as
    pub save_version: u64,
    pub mnemonic: Secret,
    pub accounts: Vec<HdAccount>,
    #[serde(default)]
    pub imported: Vec<ImportedAddress>,
    #[serde(default)]
    pub secondary: Option<SecondaryAccount>,
    #[serde(default)]
    pub facilitated: Vec<FacilitatedTransaction>,
    #[serde(default)]
    pub options: WalletOptions,
}

impl Wallet {
    /// Build a fresh wallet from keys with a single HD account and the
    /// secondary-currency account.
    pub fn create(keys: &WalletKeys, first_label: &str, gap_limit: u32) -> Result<Self> {
        let first = keys.account(0)?.new_account(first_label, gap_limit)?;
        let secondary = keys.secondary_account("Secondary")?;

        Ok(Self {
            guid: Uuid::new_v4(),
            schema_version: PAYLOAD_SCHEMA_VERSION,
            save_version: 0,
            mnemonic: Secret::new(keys.mnemonic_phrase()),
            accounts: vec![first],
            imported: Vec::new(),
            secondary: Some(secondary),
            facilitated: Vec::new(),
            options: WalletOptions::default(),
        })
    }

    pub fn hd_account(&self, index: u32) -> Option<&HdAccount> {
        self.accounts.iter().find(|a| a.index == index)
    }

    pub fn hd_account_mut(&mut self, index: u32) -> Option<&mut HdAccount> {
        self.accounts.iter_mut().find(|a| a.index == index)
    }

    /// Label for an address owned by this wallet, if any
    pub fn address_label(&self, address: &str) -> Option<&str> {
        if let Some(account) = self.accounts.iter().find(|a| a.owns(address)) {
            return Some(&account.label);
        }
        if let Some(imported) = self.imported.iter().find(|i| i.address == address) {
            return Some(&imported.label);
        }
        match &self.secondary {
            Some(secondary) if secondary.address.eq_ignore_ascii_case(address) => {
                Some(&secondary.label)
            }
            _ => None,
        }
    }
}

/// Direction of an on-chain transaction relative to the owning account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Received,
    Sent,
    /// Between addresses of the same wallet
    Transferred,
}

/// One input or output of a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxParty {
    pub address: String,
    pub value: u64,
}

/// On-chain transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub hash: String,
    pub direction: Direction,
    /// Net amount in satoshis
    pub amount: u64,
    pub fee: u64,
    pub confirmations: u32,
    /// Unix seconds
    pub timestamp: i64,
    pub account: Selector,
    #[serde(default)]
    pub inputs: Vec<TxParty>,
    #[serde(default)]
    pub outputs: Vec<TxParty>,
}

impl Transaction {
    pub fn is_confirmed(&self) -> bool {
        self.confirmations > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_debug_is_redacted() {
        let secret = Secret::new("abandon abandon art");
        let debug = format!("{:?}", secret);
        assert!(!debug.contains("abandon"));
    }

    #[test]
    fn test_secret_serde_roundtrip() {
        let secret = Secret::new("L1aW4aubDFB7yfras2S1mN3bqg9nwySY8nkoLmJebSLD5BWv3ENZ");
        let json = serde_json::to_string(&secret).unwrap();
        let back: Secret = serde_json::from_str(&json).unwrap();
        assert_eq!(back, secret);
    }

    #[test]
    fn test_confirmed() {
        let mut tx = Transaction {
            hash: "aa".into(),
            direction: Direction::Received,
            amount: 1,
            fee: 0,
            confirmations: 0,
            timestamp: 0,
            account: Selector::Hd(0),
            inputs: vec![],
            outputs: vec![],
        };
        assert!(!tx.is_confirmed());
        tx.confirmations = 3;
        assert!(tx.is_confirmed());
    }
}
