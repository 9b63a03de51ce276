//! Wallet Error Taxonomy
//!
//! Every fallible library operation returns [`WalletError`]. The variants map
//! one-to-one onto the recovery policy the caller has to apply:
//!
//! | Variant           | Recovery                                         |
//! |-------------------|--------------------------------------------------|
//! | `Authentication`  | re-enter password, never retried                 |
//! | `Corruption`      | restore from backup                              |
//! | `VersionConflict` | pull, re-apply local changes, push again         |
//! | `Network`         | retried with backoff when transient, then shown  |
//! | `Derivation`      | abort the requested operation only               |
//! | `Validation`      | abort the requested operation only               |
//! | `ProtocolState`   | rejected, facilitated transaction unchanged      |
//! | `Rejected`        | duplicate is success-equivalent, rest surfaced   |

use std::fmt;

use thiserror::Error;

pub type Result<T, E = WalletError> = std::result::Result<T, E>;

/// Why the secondary-currency API refused a broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectionReason {
    /// The transaction was already submitted or imported.
    Duplicate,
    /// The payload could not be decoded by the remote.
    Malformed(String),
    /// Any other refusal, with the remote's message.
    Other(String),
}

impl RejectionReason {
    /// Classify a raw rejection message from the remote.
    pub fn from_message(message: &str) -> Self {
        let lower = message.to_ascii_lowercase();
        if lower.contains("already imported")
            || lower.contains("already known")
            || lower.contains("already submitted")
            || lower.contains("known transaction")
        {
            Self::Duplicate
        } else if lower.contains("malformed")
            || lower.contains("invalid")
            || lower.contains("rlp")
            || lower.contains("decode")
        {
            Self::Malformed(message.to_string())
        } else {
            Self::Other(message.to_string())
        }
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Duplicate => write!(f, "transaction already submitted"),
            Self::Malformed(msg) => write!(f, "malformed transaction: {}", msg),
            Self::Other(msg) => write!(f, "{}", msg),
        }
    }
}

/// Errors produced by the wallet engine.
///
/// `Clone` so that a single coalesced remote call can hand the same outcome
/// to every waiter.
#[derive(Debug, Clone, Error)]
pub enum WalletError {
    #[error("wrong password")]
    Authentication,

    #[error("wallet payload is corrupted: {0}")]
    Corruption(String),

    #[error("remote payload changed (expected version {expected}, remote has {actual:?})")]
    VersionConflict { expected: u64, actual: Option<u64> },

    #[error("network error: {message}")]
    Network { message: String, transient: bool },

    #[error("key derivation failed: {0}")]
    Derivation(String),

    #[error("invalid input: {0}")]
    Validation(String),

    #[error("facilitated transaction {id} cannot {action} while {state}")]
    ProtocolState {
        id: String,
        state: String,
        action: String,
    },

    #[error("broadcast rejected: {reason}")]
    Rejected { reason: RejectionReason },

    #[error("wallet is locked")]
    Locked,

    #[error("too many failed unlock attempts, retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("i/o error: {0}")]
    Io(String),
}

impl WalletError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            transient: true,
        }
    }

    pub fn network_fatal(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            transient: false,
        }
    }

    /// Timeouts and 5xx responses. Authentication and validation failures
    /// are never retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network { transient: true, .. })
    }

    /// A broadcast the remote has already seen.
    pub fn is_benign_duplicate(&self) -> bool {
        matches!(
            self,
            Self::Rejected {
                reason: RejectionReason::Duplicate
            }
        )
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }
}

impl From<std::io::Error> for WalletError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<reqwest::Error> for WalletError {
    fn from(e: reqwest::Error) -> Self {
        // Decode failures are never transient.
        let transient = e.is_timeout() || e.is_connect() || e.is_request();
        Self::Network {
            message: e.to_string(),
            transient: transient && !e.is_decode(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_classification() {
        assert_eq!(
            RejectionReason::from_message("Transaction already imported"),
            RejectionReason::Duplicate
        );
        assert_eq!(
            RejectionReason::from_message("already known"),
            RejectionReason::Duplicate
        );
        assert!(matches!(
            RejectionReason::from_message("rlp: invalid payload"),
            RejectionReason::Malformed(_)
        ));
        assert!(matches!(
            RejectionReason::from_message("insufficient funds for gas"),
            RejectionReason::Other(_)
        ));
    }

    #[test]
    fn test_transient_classification() {
        assert!(WalletError::network("timeout").is_transient());
        assert!(!WalletError::network_fatal("HTTP 400").is_transient());
        assert!(!WalletError::Authentication.is_transient());
        assert!(!WalletError::Validation("bad".into()).is_transient());
    }

    #[test]
    fn test_benign_duplicate() {
        let dup = WalletError::Rejected {
            reason: RejectionReason::Duplicate,
        };
        assert!(dup.is_benign_duplicate());

        let bad = WalletError::Rejected {
            reason: RejectionReason::Malformed("x".into()),
        };
        assert!(!bad.is_benign_duplicate());
    }
}
