//! Integration tests for wallet-core
//!
//! These tests drive the engine end to end over the in-memory remotes:
//! - Payload encryption and the local cache
//! - Key derivation and gap-limit scanning
//! - Balance aggregation across accounts
//! - Facilitated transactions between two wallets
//! - Secondary-currency broadcasts
//! - Optimistic concurrency against the payload store

use std::collections::HashSet;
use std::sync::Arc;

use tempfile::TempDir;
use wallet_core::{
    chain::{ChainTransaction, MemoryChainBackend},
    config::{KdfParams, RetryPolicy, WalletConfig},
    error::WalletError,
    exchange::StaticRateSource,
    fctx::{ContactMessage, FctxState, MemoryContactChannel, Prompt},
    history::FeedEntry,
    keys::{scan_with_gap_limit, validate_mnemonic, Chain, WalletKeys},
    payload::{Envelope, PayloadCodec},
    registry::Selector,
    remote::{MemoryPayloadStore, PayloadStore, RemoteSyncClient},
    secondary::MemorySecondaryChain,
    session::{Remotes, WalletSession},
    storage::LocalCache,
    wallet::{TxParty, Wallet},
};

const TEST_MNEMONIC: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";
const TEST_PASSWORD: &str = "secure-test-password-123!";
const FIRST_ADDRESS: &str = "1LqBGSKuX5yYUonjxT5qGfpUsXKYYWeabA";
const IMPORTED_ADDRESS: &str = "1BgGZ9tcN4rm9KBzDn7KprQz87SZ26SAMH";

fn test_config(gap_limit: u32) -> WalletConfig {
    WalletConfig {
        gap_limit,
        retry: RetryPolicy::none(),
        kdf: KdfParams::insecure_for_tests(),
        ..Default::default()
    }
}

fn test_wallet(gap_limit: u32) -> Wallet {
    let keys = WalletKeys::from_mnemonic(TEST_MNEMONIC).unwrap();
    Wallet::create(&keys, "My Bitcoin Wallet", gap_limit).unwrap()
}

/// A session over in-memory remotes, with handles to drive them
struct Harness {
    _dir: TempDir,
    session: Arc<WalletSession>,
    store: Arc<MemoryPayloadStore>,
    chain: Arc<MemoryChainBackend>,
    secondary: Arc<MemorySecondaryChain>,
    contacts: Arc<MemoryContactChannel>,
}

impl Harness {
    async fn create(gap_limit: u32) -> Self {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryPayloadStore::new());
        let chain = Arc::new(MemoryChainBackend::new());
        let secondary = Arc::new(MemorySecondaryChain::new());
        let contacts = Arc::new(MemoryContactChannel::new());

        let remotes = Remotes {
            payload: store.clone(),
            chain: chain.clone(),
            secondary: secondary.clone(),
            rates: Arc::new(StaticRateSource::new(&[("USD", 40_000.0)])),
            contacts: contacts.clone(),
        };
        let session = Arc::new(WalletSession::new(test_config(gap_limit), dir.path(), remotes).unwrap());

        let keys = WalletKeys::from_mnemonic(TEST_MNEMONIC).unwrap();
        session
            .create(&keys, TEST_PASSWORD, "My Bitcoin Wallet", false)
            .await
            .unwrap();

        Self {
            _dir: dir,
            session,
            store,
            chain,
            secondary,
            contacts,
        }
    }

    fn receive_address(&self, index: usize) -> String {
        self.session
            .registry()
            .view(|w| w.accounts[0].receive[index].address.clone())
            .unwrap()
    }
}

// ============================================================================
// Payload Tests
// ============================================================================

mod payload {
    use super::*;

    #[test]
    fn test_round_trip_preserves_wallet() {
        let mut wallet = test_wallet(3);
        wallet.save_version = 12;
        wallet.accounts[0].label = "Daily".into();

        let codec = PayloadCodec::new(KdfParams::insecure_for_tests());
        let envelope = codec.encode(&wallet, TEST_PASSWORD).unwrap();
        let decoded = PayloadCodec::decode(&envelope, TEST_PASSWORD).unwrap();

        assert_eq!(decoded, wallet);
    }

    #[test]
    fn test_wrong_password_and_corruption_are_distinct() {
        let codec = PayloadCodec::new(KdfParams::insecure_for_tests());
        let mut envelope = codec.encode(&test_wallet(1), TEST_PASSWORD).unwrap();

        assert!(matches!(
            PayloadCodec::decode(&envelope, "not-the-password"),
            Err(WalletError::Authentication)
        ));

        let mut json: serde_json::Value =
            serde_json::from_str(&envelope.to_json().unwrap()).unwrap();
        let mut bytes = hex::decode(json["ciphertext"].as_str().unwrap()).unwrap();
        bytes[0] ^= 0xff;
        json["ciphertext"] = serde_json::Value::String(hex::encode(bytes));
        envelope = Envelope::from_json(&json.to_string()).unwrap();
        assert!(matches!(
            PayloadCodec::decode(&envelope, TEST_PASSWORD),
            Err(WalletError::Corruption(_))
        ));
    }

    #[test]
    fn test_cache_survives_reload() {
        let temp_dir = TempDir::new().unwrap();
        let cache = LocalCache::in_dir(temp_dir.path());
        let codec = PayloadCodec::new(KdfParams::insecure_for_tests());
        let wallet = test_wallet(1);

        cache.save(&codec.encode(&wallet, TEST_PASSWORD).unwrap(), 4).unwrap();
        let cached = LocalCache::in_dir(temp_dir.path()).load().unwrap().unwrap();

        assert_eq!(cached.version, 4);
        assert_eq!(PayloadCodec::decode(&cached.envelope, TEST_PASSWORD).unwrap(), wallet);
    }
}

// ============================================================================
// Key Derivation Tests
// ============================================================================

mod derivation {
    use super::*;

    #[test]
    fn test_derivation_is_deterministic() {
        let a = WalletKeys::from_mnemonic(TEST_MNEMONIC).unwrap();
        let b = WalletKeys::from_mnemonic(TEST_MNEMONIC).unwrap();

        for account in 0..3 {
            let ka = a.account(account).unwrap();
            let kb = b.account(account).unwrap();
            assert_eq!(ka.xpub_string(), kb.xpub_string());
            for chain in [Chain::Receive, Chain::Change] {
                assert_eq!(
                    ka.derive_range(chain, 0, 5).unwrap(),
                    kb.derive_range(chain, 0, 5).unwrap()
                );
            }
        }
        assert_eq!(
            a.account(0).unwrap().derive_address(Chain::Receive, 0).unwrap().address,
            FIRST_ADDRESS
        );
    }

    #[test]
    fn test_gap_limit_halts_after_n_unused() {
        let keys = WalletKeys::from_mnemonic(TEST_MNEMONIC).unwrap().account(0).unwrap();
        let used: HashSet<u32> = [0, 4].into_iter().collect();

        let scanned = scan_with_gap_limit(&keys, Chain::Receive, 20, |a| used.contains(&a.index)).unwrap();

        assert_eq!(scanned.len(), 25);
        assert!(scanned[5..].iter().all(|a| !a.used));
    }

    #[test]
    fn test_mnemonic_validation() {
        assert!(validate_mnemonic(TEST_MNEMONIC).is_ok());
        assert!(validate_mnemonic("abandon abandon").is_err());
        assert!(validate_mnemonic(&TEST_MNEMONIC.replace("about", "abandon")).is_err());
    }
}

// ============================================================================
// Balance Tests
// ============================================================================

mod balances {
    use super::*;

    #[tokio::test]
    async fn test_all_is_sum_of_accounts() {
        let harness = Harness::create(2).await;
        let registry = harness.session.registry();
        registry.import_address(IMPORTED_ADDRESS, None, Some("Paper")).unwrap();

        harness.chain.set_balance(&harness.receive_address(0), 0, 0);
        harness.chain.set_balance(&harness.receive_address(1), 5, 1);
        harness.chain.set_balance(IMPORTED_ADDRESS, 3, 1);

        let all = harness.session.refresh_balance().await.unwrap().unwrap();
        assert_eq!(all.satoshis, 8);
        assert!(!all.stale);

        harness.session.select(Selector::Imported(0)).unwrap();
        let imported = harness.session.refresh_balance().await.unwrap().unwrap();
        assert_eq!(imported.satoshis, 3);

        harness.session.select(Selector::Hd(0)).unwrap();
        let hd = harness.session.refresh_balance().await.unwrap().unwrap();
        assert_eq!(hd.satoshis, 5);
    }

    #[tokio::test]
    async fn test_network_failure_shows_cached_balance() {
        let harness = Harness::create(2).await;
        harness.chain.set_balance(FIRST_ADDRESS, 7, 1);
        harness.session.refresh_balance().await.unwrap();

        harness.chain.fail_next(WalletError::network("timeout"));
        let view = harness.session.refresh_balance().await.unwrap().unwrap();

        assert!(view.stale);
        assert_eq!(view.satoshis, 7);
    }

    #[tokio::test]
    async fn test_receive_addresses_never_run_out() {
        let harness = Harness::create(1).await;
        let registry = harness.session.registry();

        for round in 0..3 {
            let address = registry.receive_address(Selector::Hd(0)).unwrap();
            assert_eq!(address, harness.receive_address(round));
            harness.chain.set_balance(&address, 100, 1);
            harness.session.refresh_balance().await.unwrap();
        }

        let next = registry.receive_address(Selector::Hd(0)).unwrap();
        assert_eq!(next, harness.receive_address(3));
        assert_eq!(registry.cached_balance(Selector::Hd(0)).unwrap(), 300);
    }

    #[tokio::test]
    async fn test_archived_accounts_leave_the_aggregate() {
        let harness = Harness::create(1).await;
        let registry = harness.session.registry();
        registry.import_address(IMPORTED_ADDRESS, None, None).unwrap();
        harness.chain.set_balance(FIRST_ADDRESS, 10, 1);
        harness.chain.set_balance(IMPORTED_ADDRESS, 3, 1);

        harness.session.refresh_balance().await.unwrap();
        registry.set_archived(Selector::Imported(0), true).unwrap();

        assert_eq!(registry.cached_balance(Selector::All).unwrap(), 10);
        assert_eq!(registry.active_account_count().unwrap(), 1);
    }
}

// ============================================================================
// Facilitated Transaction Tests
// ============================================================================

mod facilitated {
    use super::*;

    #[tokio::test]
    async fn test_responder_chooses_first_account() {
        let harness = Harness::create(2).await;
        let facilitated = harness.session.facilitated();

        let fctx = facilitated
            .handle_message(
                "alice",
                ContactMessage::RequestForAddress {
                    id: "req-1".into(),
                    amount: 25_000,
                    note: Some("lunch".into()),
                },
            )
            .await
            .unwrap();
        assert_eq!(fctx.state, FctxState::AwaitingAddress);
        assert!(matches!(
            facilitated.prompt("req-1").unwrap(),
            Prompt::ConfirmSendAddress { .. }
        ));

        let fctx = facilitated.on_account_chosen(0, "req-1").await.unwrap();
        assert_eq!(fctx.state, FctxState::AwaitingPayment);
        assert_eq!(fctx.address.as_deref(), Some(FIRST_ADDRESS));
        assert_eq!(
            harness.contacts.sent(),
            vec![(
                "alice".to_string(),
                ContactMessage::AddressSupplied {
                    id: "req-1".into(),
                    address: FIRST_ADDRESS.into(),
                }
            )]
        );
    }

    #[tokio::test]
    async fn test_invalid_transition_leaves_state() {
        let harness = Harness::create(1).await;
        let facilitated = harness.session.facilitated();
        let fctx = facilitated
            .initiate_payment("bob", 1_000, None, None)
            .await
            .unwrap();

        let err = facilitated
            .mark_broadcast(&fctx.id, "deadbeef", Selector::Hd(0))
            .await
            .unwrap_err();
        assert!(matches!(err, WalletError::ProtocolState { .. }));
        assert_eq!(facilitated.get(&fctx.id).unwrap().state, FctxState::AwaitingAddress);
    }

    #[tokio::test]
    async fn test_confirmed_payment_completes_in_feed() {
        let harness = Harness::create(2).await;
        let facilitated = harness.session.facilitated();

        facilitated
            .handle_message(
                "alice",
                ContactMessage::RequestForAddress {
                    id: "req-2".into(),
                    amount: 5_000,
                    note: None,
                },
            )
            .await
            .unwrap();
        facilitated.on_account_chosen(0, "req-2").await.unwrap();
        facilitated
            .handle_message(
                "alice",
                ContactMessage::PaymentBroadcast {
                    id: "req-2".into(),
                    tx_hash: "cafe".into(),
                },
            )
            .await
            .unwrap();

        harness.chain.add_transaction(ChainTransaction {
            hash: "cafe".into(),
            time: 1_700_000_000,
            fee: 200,
            confirmations: 1,
            inputs: vec![TxParty {
                address: IMPORTED_ADDRESS.into(),
                value: 5_200,
            }],
            outputs: vec![TxParty {
                address: FIRST_ADDRESS.into(),
                value: 5_000,
            }],
            coinbase: false,
        });

        let feed = harness.session.refresh_feed().await.unwrap().unwrap();
        assert_eq!(feed.len(), 1);
        match feed.get(0).unwrap() {
            FeedEntry::Facilitated { fctx, settled_by } => {
                assert_eq!(fctx.state, FctxState::Completed);
                assert_eq!(settled_by.as_ref().unwrap().tx.amount, 5_000);
            }
            other => panic!("expected a facilitated entry, got {:?}", other),
        }
        assert_eq!(facilitated.get("req-2").unwrap().state, FctxState::Completed);
    }
}

// ============================================================================
// Secondary Currency Tests
// ============================================================================

mod secondary_currency {
    use super::*;

    #[tokio::test]
    async fn test_duplicate_push_is_not_fatal() {
        let harness = Harness::create(1).await;

        let tx_id = harness.session.broadcast_secondary("f86b0185").await.unwrap();
        assert!(tx_id.starts_with("0x"));

        let err = harness.session.broadcast_secondary("f86b0185").await.unwrap_err();
        assert!(err.is_benign_duplicate());
        assert_eq!(harness.secondary.submitted_count(), 1);
        assert_eq!(harness.session.registry().secondary_nonce().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_malformed_push_is_surfaced() {
        let harness = Harness::create(1).await;
        let err = harness.session.broadcast_secondary("not hex").await.unwrap_err();
        assert!(matches!(err, WalletError::Rejected { .. }));
        assert!(!err.is_benign_duplicate());
    }

    #[tokio::test]
    async fn test_balance_refresh() {
        let harness = Harness::create(1).await;
        let address = harness.session.registry().secondary_address().unwrap();
        harness.secondary.set_balance(&address, 1_500_000_000_000_000_000);

        let balance = harness.session.refresh_secondary_balance().await.unwrap();
        assert_eq!(balance, 1_500_000_000_000_000_000);
    }
}

// ============================================================================
// Sync Tests
// ============================================================================

mod sync {
    use super::*;

    #[tokio::test]
    async fn test_stale_push_never_overwrites() {
        let store = Arc::new(MemoryPayloadStore::new());
        let client = RemoteSyncClient::new(store.clone(), RetryPolicy::none());
        let codec = PayloadCodec::new(KdfParams::insecure_for_tests());
        let wallet = test_wallet(1);

        let envelope = codec.encode(&wallet, TEST_PASSWORD).unwrap();
        let payload = envelope.to_json().unwrap();
        let checksum = envelope.checksum().unwrap();
        assert_eq!(client.push(&wallet.guid, &payload, &checksum, 0).await.unwrap(), 1);
        assert_eq!(client.push(&wallet.guid, &payload, &checksum, 1).await.unwrap(), 2);

        let other = codec.encode(&test_wallet(2), TEST_PASSWORD).unwrap();
        let err = client
            .push(&wallet.guid, &other.to_json().unwrap(), &other.checksum().unwrap(), 1)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            WalletError::VersionConflict {
                expected: 1,
                actual: Some(2)
            }
        ));
        let stored = store.pull(&wallet.guid).await.unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(stored.payload, payload);
    }

    #[tokio::test]
    async fn test_conflict_forces_pull_before_next_save() {
        let harness = Harness::create(1).await;
        let guid = harness.session.registry().view(|w| w.guid).unwrap();

        // Another device saves version 2
        let mut remote = harness.session.registry().snapshot().unwrap();
        remote.accounts[0].label = "Renamed elsewhere".into();
        let codec = PayloadCodec::new(KdfParams::insecure_for_tests());
        let envelope = codec.encode(&remote, TEST_PASSWORD).unwrap();
        harness
            .store
            .push(&guid, &envelope.to_json().unwrap(), &envelope.checksum().unwrap(), 1)
            .await
            .unwrap();

        harness.session.registry().add_account("Savings", 1).unwrap();
        assert!(harness.session.save().await.unwrap_err().is_conflict());
        assert!(harness.session.save().await.unwrap_err().is_conflict());

        harness.session.pull().await.unwrap();
        let registry = harness.session.registry();
        assert_eq!(registry.label(Selector::Hd(0)).unwrap(), "Renamed elsewhere");
        assert!(registry.label(Selector::Hd(1)).is_err());
        assert_eq!(harness.session.save().await.unwrap(), 3);
    }
}
