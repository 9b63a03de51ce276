//! Wallet Core
//!
//! A self-custodial wallet engine: an encrypted, versioned multi-account
//! wallet (HD Bitcoin accounts, imported addresses and a secondary-currency
//! account), balance and transaction aggregation, synchronization with a
//! remote payload store, and contact-to-contact payment requests.
//!
//! ## Security Model
//!
//! - Keys are derived and held locally; the remote only ever sees the
//!   encrypted payload
//! - The payload is encrypted under a password-stretched key; a wrong
//!   password and a damaged payload are reported differently
//! - Remote saves use optimistic concurrency and never overwrite a newer
//!   version
//! - Secrets are zeroized when the wallet is locked

pub mod balance;
pub mod chain;
pub mod config;
pub mod error;
pub mod exchange;
pub mod fctx;
pub mod history;
pub mod keys;
pub mod payload;
pub mod prefs;
pub mod refresh;
pub mod registry;
pub mod remote;
pub mod secondary;
pub mod session;
pub mod storage;
pub mod wallet;

pub mod commands;

pub use balance::{BalanceAggregator, BalanceView, Denomination, DisplayMode, DisplaySettings};
pub use config::WalletConfig;
pub use error::{RejectionReason, Result, WalletError};
pub use fctx::{FacilitatedTransaction, FacilitatedTransactions, FctxState, Prompt};
pub use history::{Feed, FeedEntry, TransactionMerger};
pub use keys::WalletKeys;
pub use payload::PayloadCodec;
pub use registry::{AccountRegistry, Selector};
pub use remote::RemoteSyncClient;
pub use session::{RefreshRequest, Remotes, SessionEvent, WalletSession};
pub use wallet::Wallet;
