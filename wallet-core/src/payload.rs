//! Encrypted Wallet Payload
//!
//! Wallets are exchanged with the remote store and cached on disk as an
//! [`Envelope`]:
//! - Argon2id stretches the password into 64 bytes: the first half is the
//!   ChaCha20-Poly1305 key, the second half keys an HMAC-SHA256 password
//!   verifier
//! - the plaintext is `sha256(wallet_json) || wallet_json`
//!
//! The verifier lets a wrong password (`Authentication`) be told apart from
//! a damaged payload (`Corruption`).

use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;
use zeroize::Zeroizing;

use crate::config::KdfParams;
use crate::error::{Result, WalletError};
use crate::wallet::{Wallet, PAYLOAD_SCHEMA_VERSION};

type HmacSha256 = Hmac<Sha256>;

/// Current envelope format version
const ENVELOPE_VERSION: u32 = 2;

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const CHECKSUM_LEN: usize = 32;

const VERIFIER_LABEL: &[u8] = b"wallet-core/password-verifier";

/// Serialized, encrypted wallet container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Envelope format version
    pub version: u32,

    /// Parameters the key was stretched with
    pub kdf: KdfParams,

    /// Argon2 salt (hex)
    salt: String,

    /// HMAC-SHA256 password verifier (hex)
    verifier: String,

    /// ChaCha20-Poly1305 nonce (hex)
    nonce: String,

    /// Encrypted checksum and wallet JSON (hex)
    ciphertext: String,
}

impl Envelope {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| WalletError::Corruption(format!("cannot serialize envelope: {}", e)))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| WalletError::Corruption(format!("unreadable envelope: {}", e)))
    }

    /// SHA-256 of the serialized envelope (hex), sent alongside pushes
    pub fn checksum(&self) -> Result<String> {
        Ok(hex::encode(Sha256::digest(self.to_json()?.as_bytes())))
    }
}

/// Encrypts and decrypts wallets
#[derive(Debug, Clone, Copy)]
pub struct PayloadCodec {
    kdf: KdfParams,
}

impl PayloadCodec {
    pub fn new(kdf: KdfParams) -> Self {
        Self { kdf }
    }

    /// Encrypt a wallet snapshot. Salt and nonce are fresh on every call.
    pub fn encode(&self, wallet: &Wallet, password: &str) -> Result<Envelope> {
        let json = Zeroizing::new(
            serde_json::to_vec(wallet)
                .map_err(|e| WalletError::Validation(format!("cannot serialize wallet: {}", e)))?,
        );

        let mut plaintext = Zeroizing::new(Vec::with_capacity(CHECKSUM_LEN + json.len()));
        plaintext.extend_from_slice(&Sha256::digest(json.as_slice()));
        plaintext.extend_from_slice(&json);

        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let stretched = stretch(password, &salt, &self.kdf)
            .map_err(|e| WalletError::Validation(format!("invalid KDF parameters: {}", e)))?;
        let (key, mac_key) = stretched.split_at(32);

        let cipher = ChaCha20Poly1305::new_from_slice(key)
            .map_err(|_| WalletError::Validation("invalid cipher key".into()))?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_slice())
            .map_err(|_| WalletError::Validation("encryption failed".into()))?;

        debug!(
            "Encoded wallet {} ({} bytes of ciphertext)",
            wallet.guid,
            ciphertext.len()
        );

        Ok(Envelope {
            version: ENVELOPE_VERSION,
            kdf: self.kdf,
            salt: hex::encode(salt),
            verifier: hex::encode(verifier(mac_key)?),
            nonce: hex::encode(nonce_bytes),
            ciphertext: hex::encode(ciphertext),
        })
    }

    /// Decrypt an envelope with the parameters it was written with
    pub fn decode(envelope: &Envelope, password: &str) -> Result<Wallet> {
        if envelope.version != ENVELOPE_VERSION {
            return Err(WalletError::Corruption(format!(
                "unsupported envelope version {} (expected {})",
                envelope.version, ENVELOPE_VERSION
            )));
        }

        let salt = decode_hex(&envelope.salt, "salt")?;
        let expected_verifier = decode_hex(&envelope.verifier, "verifier")?;
        let nonce_bytes = decode_hex(&envelope.nonce, "nonce")?;
        let ciphertext = decode_hex(&envelope.ciphertext, "ciphertext")?;
        if nonce_bytes.len() != NONCE_LEN {
            return Err(WalletError::Corruption("invalid nonce length".into()));
        }
        envelope.kdf.check_bounds()?;

        let stretched = stretch(password, &salt, &envelope.kdf)
            .map_err(|e| WalletError::Corruption(format!("invalid KDF parameters: {}", e)))?;
        let (key, mac_key) = stretched.split_at(32);

        let mut mac = <HmacSha256 as Mac>::new_from_slice(mac_key)
            .map_err(|_| WalletError::Corruption("invalid verifier key".into()))?;
        mac.update(VERIFIER_LABEL);
        if mac.verify_slice(&expected_verifier).is_err() {
            return Err(WalletError::Authentication);
        }

        let cipher = ChaCha20Poly1305::new_from_slice(key)
            .map_err(|_| WalletError::Corruption("invalid cipher key".into()))?;
        let plaintext = Zeroizing::new(
            cipher
                .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_slice())
                .map_err(|_| WalletError::Corruption("authentication tag mismatch".into()))?,
        );

        if plaintext.len() < CHECKSUM_LEN {
            return Err(WalletError::Corruption("payload too short".into()));
        }
        let (checksum, json) = plaintext.split_at(CHECKSUM_LEN);
        if Sha256::digest(json).as_slice() != checksum {
            return Err(WalletError::Corruption("checksum mismatch".into()));
        }

        let wallet: Wallet = serde_json::from_slice(json)
            .map_err(|e| WalletError::Corruption(format!("invalid wallet data: {}", e)))?;
        if wallet.schema_version > PAYLOAD_SCHEMA_VERSION {
            return Err(WalletError::Corruption(format!(
                "wallet schema {} is newer than supported {}",
                wallet.schema_version, PAYLOAD_SCHEMA_VERSION
            )));
        }

        debug!("Decoded wallet {}", wallet.guid);
        Ok(wallet)
    }
}

/// Argon2id into 64 bytes: cipher key || verifier key
fn stretch(
    password: &str,
    salt: &[u8],
    kdf: &KdfParams,
) -> std::result::Result<Zeroizing<[u8; 64]>, argon2::Error> {
    let params = Params::new(kdf.memory_kib, kdf.iterations, kdf.parallelism, Some(64))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut output = Zeroizing::new([0u8; 64]);
    argon2.hash_password_into(password.as_bytes(), salt, output.as_mut())?;
    Ok(output)
}

fn verifier(mac_key: &[u8]) -> Result<Vec<u8>> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(mac_key)
        .map_err(|_| WalletError::Validation("invalid verifier key".into()))?;
    mac.update(VERIFIER_LABEL);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn decode_hex(value: &str, field: &str) -> Result<Vec<u8>> {
    hex::decode(value).map_err(|_| WalletError::Corruption(format!("invalid {} encoding", field)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::WalletKeys;

    const TEST_MNEMONIC: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";
    const TEST_PASSWORD: &str = "test-password-123";

    fn codec() -> PayloadCodec {
        PayloadCodec::new(KdfParams::insecure_for_tests())
    }

    fn wallet() -> Wallet {
        let keys = WalletKeys::from_mnemonic(TEST_MNEMONIC).unwrap();
        Wallet::create(&keys, "My Wallet", 3).unwrap()
    }

    #[test]
    fn test_encode_decode() {
        let wallet = wallet();
        let envelope = codec().encode(&wallet, TEST_PASSWORD).unwrap();
        let decoded = PayloadCodec::decode(&envelope, TEST_PASSWORD).unwrap();
        assert_eq!(decoded, wallet);
    }

    #[test]
    fn test_wrong_password_is_authentication_error() {
        let envelope = codec().encode(&wallet(), TEST_PASSWORD).unwrap();
        assert!(matches!(
            PayloadCodec::decode(&envelope, "wrong-password"),
            Err(WalletError::Authentication)
        ));
    }

    #[test]
    fn test_tampered_ciphertext_is_corruption() {
        let mut envelope = codec().encode(&wallet(), TEST_PASSWORD).unwrap();
        let mut bytes = hex::decode(&envelope.ciphertext).unwrap();
        bytes[10] ^= 0x01;
        envelope.ciphertext = hex::encode(bytes);

        assert!(matches!(
            PayloadCodec::decode(&envelope, TEST_PASSWORD),
            Err(WalletError::Corruption(_))
        ));
    }

    #[test]
    fn test_unknown_version_is_corruption() {
        let mut envelope = codec().encode(&wallet(), TEST_PASSWORD).unwrap();
        envelope.version = 99;
        assert!(matches!(
            PayloadCodec::decode(&envelope, TEST_PASSWORD),
            Err(WalletError::Corruption(_))
        ));
    }

    #[test]
    fn test_oversized_kdf_is_rejected_before_stretching() {
        let mut envelope = codec().encode(&wallet(), TEST_PASSWORD).unwrap();
        envelope.kdf.memory_kib = 4_000_000_000;

        assert!(matches!(
            PayloadCodec::decode(&envelope, TEST_PASSWORD),
            Err(WalletError::Corruption(_))
        ));

        let mut envelope = codec().encode(&wallet(), TEST_PASSWORD).unwrap();
        envelope.kdf.iterations = u32::MAX;
        assert!(matches!(
            PayloadCodec::decode(&envelope, TEST_PASSWORD),
            Err(WalletError::Corruption(_))
        ));
    }

    #[test]
    fn test_garbage_json_is_corruption() {
        assert!(matches!(
            Envelope::from_json("{not json"),
            Err(WalletError::Corruption(_))
        ));
    }

    #[test]
    fn test_salt_and_nonce_are_fresh() {
        let wallet = wallet();
        let a = codec().encode(&wallet, TEST_PASSWORD).unwrap();
        let b = codec().encode(&wallet, TEST_PASSWORD).unwrap();
        assert_ne!(a.salt, b.salt);
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_json_roundtrip() {
        let envelope = codec().encode(&wallet(), TEST_PASSWORD).unwrap();
        let json = envelope.to_json().unwrap();
        assert!(!json.contains("abandon"));
        assert_eq!(Envelope::from_json(&json).unwrap(), envelope);
        assert_eq!(envelope.checksum().unwrap().len(), 64);
    }
}
