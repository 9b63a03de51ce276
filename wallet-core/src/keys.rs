//! Key Management
//!
//! Handles BIP39 mnemonic generation and BIP32 key derivation for HD
//! accounts (`m/44'/0'/{account}'`), their receive (`/0/i`) and change
//! (`/1/i`) chains, and the secondary-currency key (`m/44'/60'/0'/0/0`).
//!
//! Everything here is a pure function of the mnemonic and the path. The
//! mnemonic lives in a `Zeroizing<String>`; nothing in this module logs or
//! serializes private key material.

use bip39::{Language, Mnemonic, MnemonicType, Seed};
use bitcoin::bip32::{ChildNumber, DerivationPath, Xpriv, Xpub};
use bitcoin::secp256k1::{All, Secp256k1};
use bitcoin::{Address, Network, PrivateKey, PublicKey};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use std::str::FromStr;
use zeroize::Zeroizing;

use crate::error::{Result, WalletError};
use crate::wallet::{DerivedAddress, HdAccount, SecondaryAccount};

/// BIP44 purpose
const PURPOSE: u32 = 44;

/// SLIP-44 coin types
const COIN_BITCOIN: u32 = 0;
const COIN_SECONDARY: u32 = 60;

/// Accepted mnemonic lengths
const MNEMONIC_WORD_COUNTS: &[usize] = &[12, 24];

/// Address chain within an HD account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    Receive,
    Change,
}

impl Chain {
    pub fn index(self) -> u32 {
        match self {
            Self::Receive => 0,
            Self::Change => 1,
        }
    }
}

/// Master keys derived from a BIP39 mnemonic.
///
/// Security: the mnemonic phrase is stored in a `Zeroizing<String>` so the
/// recovery phrase is overwritten when the keys are dropped.
#[derive(Clone)]
pub struct WalletKeys {
    mnemonic_phrase: Zeroizing<String>,
    master: Xpriv,
    secp: Secp256k1<All>,
}

impl WalletKeys {
    /// Generate a new wallet with a random 12-word mnemonic
    pub fn generate() -> Result<Self> {
        let mnemonic = Mnemonic::new(MnemonicType::Words12, Language::English);
        Self::from_mnemonic_internal(mnemonic, "")
    }

    /// Restore from a mnemonic phrase
    pub fn from_mnemonic(phrase: &str) -> Result<Self> {
        Self::from_mnemonic_with_passphrase(phrase, "")
    }

    /// Restore from a mnemonic phrase protected by a BIP39 passphrase
    pub fn from_mnemonic_with_passphrase(phrase: &str, passphrase: &str) -> Result<Self> {
        validate_mnemonic(phrase)?;
        let mnemonic = Mnemonic::from_phrase(phrase, Language::English)
            .map_err(|e| WalletError::Derivation(format!("invalid mnemonic phrase: {}", e)))?;
        Self::from_mnemonic_internal(mnemonic, passphrase)
    }

    fn from_mnemonic_internal(mnemonic: Mnemonic, passphrase: &str) -> Result<Self> {
        let phrase = Zeroizing::new(mnemonic.phrase().to_string());
        let seed = Seed::new(&mnemonic, passphrase);

        let master = Xpriv::new_master(Network::Bitcoin, seed.as_bytes())
            .map_err(|e| WalletError::Derivation(e.to_string()))?;

        Ok(Self {
            mnemonic_phrase: phrase,
            master,
            secp: Secp256k1::new(),
        })
    }

    pub fn mnemonic_phrase(&self) -> &str {
        &self.mnemonic_phrase
    }

    pub fn mnemonic_words(&self) -> Vec<&str> {
        self.mnemonic_phrase.split_whitespace().collect()
    }

    /// Account-level keys for `m/44'/0'/{index}'`
    pub fn account(&self, index: u32) -> Result<AccountKeys> {
        let path = DerivationPath::from(vec![
            hardened(PURPOSE)?,
            hardened(COIN_BITCOIN)?,
            hardened(index)?,
        ]);
        let account_xpriv = self
            .master
            .derive_priv(&self.secp, &path)
            .map_err(|e| WalletError::Derivation(e.to_string()))?;

        Ok(AccountKeys {
            index,
            xpub: Xpub::from_priv(&self.secp, &account_xpriv),
            secp: self.secp.clone(),
        })
    }

    /// Secondary-currency account at `m/44'/60'/0'/0/0`
    pub fn secondary_account(&self, label: &str) -> Result<SecondaryAccount> {
        let path_str = format!("m/{}'/{}'/0'/0/0", PURPOSE, COIN_SECONDARY);
        let path = DerivationPath::from_str(&path_str)
            .map_err(|e| WalletError::Derivation(e.to_string()))?;
        let xpriv = self
            .master
            .derive_priv(&self.secp, &path)
            .map_err(|e| WalletError::Derivation(e.to_string()))?;
        let public_key = Xpub::from_priv(&self.secp, &xpriv).public_key;

        Ok(SecondaryAccount {
            label: label.to_string(),
            address: secondary_address(&public_key.serialize_uncompressed()),
            path: path_str,
            balance: 0,
            nonce: 0,
        })
    }
}

/// Public derivation for one HD account
#[derive(Clone)]
pub struct AccountKeys {
    index: u32,
    xpub: Xpub,
    secp: Secp256k1<All>,
}

impl AccountKeys {
    /// Rebuild account keys from a stored xpub (no seed needed to derive
    /// further addresses).
    pub fn from_xpub(index: u32, xpub: &str) -> Result<Self> {
        let xpub = Xpub::from_str(xpub).map_err(|e| WalletError::Derivation(e.to_string()))?;
        Ok(Self {
            index,
            xpub,
            secp: Secp256k1::new(),
        })
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn xpub_string(&self) -> String {
        self.xpub.to_string()
    }

    /// Derive the address at `chain/index`
    pub fn derive_address(&self, chain: Chain, index: u32) -> Result<DerivedAddress> {
        let child = [normal(chain.index())?, normal(index)?];
        let derived = self
            .xpub
            .derive_pub(&self.secp, &child)
            .map_err(|e| WalletError::Derivation(e.to_string()))?;
        let public_key = PublicKey::new(derived.public_key);

        Ok(DerivedAddress {
            chain,
            index,
            path: format!(
                "m/{}'/{}'/{}'/{}/{}",
                PURPOSE,
                COIN_BITCOIN,
                self.index,
                chain.index(),
                index
            ),
            public_key: public_key.to_string(),
            address: Address::p2pkh(public_key.pubkey_hash(), Network::Bitcoin).to_string(),
            used: false,
            balance: 0,
        })
    }

    /// Derive `count` consecutive addresses starting at `start`
    pub fn derive_range(&self, chain: Chain, start: u32, count: u32) -> Result<Vec<DerivedAddress>> {
        let end = start
            .checked_add(count)
            .ok_or_else(|| WalletError::Derivation("address index overflow".into()))?;
        (start..end).map(|i| self.derive_address(chain, i)).collect()
    }

    /// A brand-new account: no activity anywhere, so both chains hold exactly
    /// one gap-limit window.
    pub fn new_account(&self, label: &str, gap_limit: u32) -> Result<HdAccount> {
        Ok(HdAccount {
            index: self.index,
            label: label.to_string(),
            archived: false,
            xpub: self.xpub_string(),
            receive: self.derive_range(Chain::Receive, 0, gap_limit)?,
            change: self.derive_range(Chain::Change, 0, gap_limit)?,
            balance: 0,
        })
    }
}

/// Incremental gap-limit scanner.
///
/// Callers derive a window with [`next_window`](Self::next_window), look up
/// activity for the whole window in one batch, and feed the answer back
/// through [`record`](Self::record). Scanning is complete after exactly
/// `gap_limit` consecutive unused addresses.
#[derive(Debug)]
pub struct GapLimitScan {
    chain: Chain,
    gap_limit: u32,
    next_index: u32,
    unused_run: u32,
    addresses: Vec<DerivedAddress>,
}

impl GapLimitScan {
    pub fn new(chain: Chain, gap_limit: u32) -> Result<Self> {
        if gap_limit == 0 {
            return Err(WalletError::Validation("gap limit must be positive".into()));
        }
        Ok(Self {
            chain,
            gap_limit,
            next_index: 0,
            unused_run: 0,
            addresses: Vec::new(),
        })
    }

    pub fn is_complete(&self) -> bool {
        self.unused_run >= self.gap_limit
    }

    /// Addresses to check next; just enough to complete the scan if none of
    /// them turn out to be used.
    pub fn next_window(&self, keys: &AccountKeys) -> Result<Vec<DerivedAddress>> {
        if self.is_complete() {
            return Ok(Vec::new());
        }
        keys.derive_range(self.chain, self.next_index, self.gap_limit - self.unused_run)
    }

    /// Record activity for a window returned by `next_window`.
    pub fn record<F>(&mut self, window: Vec<DerivedAddress>, mut is_used: F)
    where
        F: FnMut(&DerivedAddress) -> bool,
    {
        for mut address in window {
            if self.is_complete() || address.index != self.next_index {
                break;
            }
            address.used = is_used(&address);
            if address.used {
                self.unused_run = 0;
            } else {
                self.unused_run += 1;
            }
            self.next_index += 1;
            self.addresses.push(address);
        }
    }

    pub fn finish(self) -> Vec<DerivedAddress> {
        self.addresses
    }
}

/// Synchronous gap-limit scan driven by a per-address activity check
pub fn scan_with_gap_limit<F>(
    keys: &AccountKeys,
    chain: Chain,
    gap_limit: u32,
    mut is_used: F,
) -> Result<Vec<DerivedAddress>>
where
    F: FnMut(&DerivedAddress) -> bool,
{
    let mut scan = GapLimitScan::new(chain, gap_limit)?;
    while !scan.is_complete() {
        let window = scan.next_window(keys)?;
        scan.record(window, &mut is_used);
    }
    Ok(scan.finish())
}

/// Validate a mnemonic phrase without creating keys
pub fn validate_mnemonic(phrase: &str) -> Result<()> {
    let word_count = phrase.split_whitespace().count();
    if !MNEMONIC_WORD_COUNTS.contains(&word_count) {
        return Err(WalletError::Validation(format!(
            "expected 12 or 24 words, got {}",
            word_count
        )));
    }

    Mnemonic::from_phrase(phrase, Language::English)
        .map_err(|e| WalletError::Validation(format!("invalid mnemonic: {}", e)))?;

    Ok(())
}

/// Check that a string is a mainnet Bitcoin address
pub fn validate_address(address: &str) -> Result<()> {
    Address::from_str(address)
        .map_err(|e| WalletError::Validation(format!("invalid address {}: {}", address, e)))?
        .require_network(Network::Bitcoin)
        .map_err(|e| WalletError::Validation(format!("invalid address {}: {}", address, e)))?;
    Ok(())
}

/// P2PKH address controlled by a WIF private key
pub fn address_from_wif(wif: &str) -> Result<String> {
    let key = PrivateKey::from_wif(wif)
        .map_err(|_| WalletError::Validation("invalid WIF private key".into()))?;
    let secp = Secp256k1::signing_only();
    let public_key = key.public_key(&secp);
    Ok(Address::p2pkh(public_key.pubkey_hash(), Network::Bitcoin).to_string())
}

/// `0x`-prefixed last 20 bytes of Keccak-256 over the uncompressed key
/// (without its 0x04 tag).
fn secondary_address(uncompressed: &[u8; 65]) -> String {
    let hash = Keccak256::digest(&uncompressed[1..]);
    format!("0x{}", hex::encode(&hash[12..]))
}

fn hardened(index: u32) -> Result<ChildNumber> {
    ChildNumber::from_hardened_idx(index)
        .map_err(|_| WalletError::Derivation(format!("index {} out of range", index)))
}

fn normal(index: u32) -> Result<ChildNumber> {
    ChildNumber::from_normal_idx(index)
        .map_err(|_| WalletError::Derivation(format!("index {} out of range", index)))
}
