//! Facilitated Transactions
//!
//! Contact-to-contact payment requests. Each one is a small state machine:
//!
//! ```text
//! AWAITING_ADDRESS -> AWAITING_PAYMENT -> PAYMENT_BROADCAST -> COMPLETED
//!        \                  \                   \
//!         +------------------+-------------------+--> CANCELLED | DELETED
//! ```
//!
//! Every transition goes through [`transition`]; anything not listed there
//! fails with `ProtocolState` and leaves the entry unchanged. Entries live in
//! the wallet payload so they sync with it.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, WalletError};
use crate::registry::{AccountRegistry, Selector};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FctxState {
    AwaitingAddress,
    AwaitingPayment,
    PaymentBroadcast,
    Completed,
    Cancelled,
    Deleted,
}

impl FctxState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Deleted)
    }
}

impl fmt::Display for FctxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AwaitingAddress => "AWAITING_ADDRESS",
            Self::AwaitingPayment => "AWAITING_PAYMENT",
            Self::PaymentBroadcast => "PAYMENT_BROADCAST",
            Self::Completed => "COMPLETED",
            Self::Cancelled => "CANCELLED",
            Self::Deleted => "DELETED",
        };
        f.write_str(name)
    }
}

/// Who started the exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Initiator,
    Responder,
}

/// What the initiator wants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    /// The initiator sends money
    Payment,
    /// The initiator asks to be paid
    Request,
}

/// Protocol events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    AddressSupplied,
    PaymentBroadcast,
    Confirmed,
    Cancel,
    Delete,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AddressSupplied => "accept an address",
            Self::PaymentBroadcast => "record a broadcast",
            Self::Confirmed => "complete",
            Self::Cancel => "cancel",
            Self::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// The complete transition table
pub fn transition(state: FctxState, event: Event) -> Option<FctxState> {
    use FctxState::*;

    match (state, event) {
        (AwaitingAddress, Event::AddressSupplied) => Some(AwaitingPayment),
        (AwaitingPayment, Event::PaymentBroadcast) => Some(PaymentBroadcast),
        (PaymentBroadcast, Event::Confirmed) => Some(Completed),
        (AwaitingAddress | AwaitingPayment | PaymentBroadcast, Event::Cancel) => Some(Cancelled),
        (AwaitingAddress | AwaitingPayment | PaymentBroadcast, Event::Delete) => Some(Deleted),
        (AwaitingAddress, Event::PaymentBroadcast | Event::Confirmed)
        | (AwaitingPayment, Event::AddressSupplied | Event::Confirmed)
        | (PaymentBroadcast, Event::AddressSupplied | Event::PaymentBroadcast)
        | (Completed | Cancelled | Deleted, _) => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacilitatedTransaction {
    pub id: String,
    /// Counterparty contact id
    pub contact: String,
    pub role: Role,
    pub intent: Intent,
    pub state: FctxState,
    /// Requested amount in satoshis
    pub amount: u64,
    #[serde(default)]
    pub note: Option<String>,
    /// Receiving address once known
    #[serde(default)]
    pub address: Option<String>,
    /// Our account involved, once known
    #[serde(default)]
    pub account: Option<Selector>,
    #[serde(default)]
    pub tx_hash: Option<String>,
    #[serde(default)]
    pub delete_requested: bool,
    /// Unix seconds
    pub created: i64,
    pub updated: i64,
}

impl FacilitatedTransaction {
    /// We send the money
    pub fn is_payer(&self) -> bool {
        matches!(
            (self.role, self.intent),
            (Role::Initiator, Intent::Payment) | (Role::Responder, Intent::Request)
        )
    }

    pub fn is_payee(&self) -> bool {
        !self.is_payer()
    }

    fn apply(&mut self, event: Event) -> Result<()> {
        let next = transition(self.state, event).ok_or_else(|| WalletError::ProtocolState {
            id: self.id.clone(),
            state: self.state.to_string(),
            action: event.to_string(),
        })?;
        debug!("Facilitated transaction {}: {} -> {}", self.id, self.state, next);
        self.state = next;
        self.updated = Utc::now().timestamp();
        Ok(())
    }

    fn check(&self, event: Event) -> Result<()> {
        self.clone().apply(event)
    }
}

/// Messages exchanged with a contact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContactMessage {
    /// The sender wants to pay and needs an address
    RequestForAddress {
        id: String,
        amount: u64,
        note: Option<String>,
    },
    /// The sender asks to be paid at `address`
    PaymentRequest {
        id: String,
        amount: u64,
        note: Option<String>,
        address: String,
    },
    /// Answer to `RequestForAddress`
    AddressSupplied { id: String, address: String },
    PaymentBroadcast { id: String, tx_hash: String },
    Cancelled { id: String },
}

/// Delivery of contact messages
#[async_trait]
pub trait ContactChannel: Send + Sync {
    async fn send(&self, contact: &str, message: &ContactMessage) -> Result<()>;
}

/// Records outbound messages instead of delivering them
#[derive(Default)]
pub struct MemoryContactChannel {
    sent: Mutex<Vec<(String, ContactMessage)>>,
    failures: Mutex<Vec<WalletError>>,
}

impl MemoryContactChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(String, ContactMessage)> {
        lock(&self.sent).clone()
    }

    pub fn fail_next(&self, error: WalletError) {
        lock(&self.failures).push(error);
    }
}

#[async_trait]
impl ContactChannel for MemoryContactChannel {
    async fn send(&self, contact: &str, message: &ContactMessage) -> Result<()> {
        if let Some(error) = lock(&self.failures).pop() {
            return Err(error);
        }
        lock(&self.sent).push((contact.to_string(), message.clone()));
        Ok(())
    }
}

/// HTTP delivery (`POST {base}/contacts/{contact}/messages`)
pub struct HttpContactChannel {
    client: reqwest::Client,
    base_url: String,
}

impl HttpContactChannel {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| WalletError::network_fatal(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ContactChannel for HttpContactChannel {
    async fn send(&self, contact: &str, message: &ContactMessage) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/contacts/{}/messages", self.base_url, contact))
            .json(message)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            debug!("Delivered message to {}", contact);
            return Ok(());
        }
        if status.as_u16() == 404 {
            return Err(WalletError::Validation(format!("unknown contact {}", contact)));
        }
        Err(WalletError::Network {
            message: format!("contact message returned HTTP {}", status),
            transient: status.is_server_error(),
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What to put in front of the user for an entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prompt {
    /// Pick which account receives the payment
    ChooseAccount { id: String, accounts: Vec<String> },
    /// Only one account: confirm sending its address
    ConfirmSendAddress { id: String, account: String },
    WaitingForAddress,
    /// Pay `amount` to `address`
    Pay {
        id: String,
        address: String,
        amount: u64,
    },
    WaitingForPayment,
    ConfirmDelete { id: String },
    Nothing,
}

/// The protocol engine over the wallet's facilitated transactions
pub struct FacilitatedTransactions {
    registry: AccountRegistry,
    channel: Arc<dyn ContactChannel>,
    ops: AsyncMutex<()>,
}

impl FacilitatedTransactions {
    pub fn new(registry: AccountRegistry, channel: Arc<dyn ContactChannel>) -> Self {
        Self {
            registry,
            channel,
            ops: AsyncMutex::new(()),
        }
    }

    pub fn get(&self, id: &str) -> Result<FacilitatedTransaction> {
        self.registry
            .view(|w| w.facilitated.iter().find(|f| f.id == id).cloned())?
            .ok_or_else(|| WalletError::Validation(format!("unknown facilitated transaction {}", id)))
    }

    /// Entries visible for a selection (deleted ones never are)
    pub fn for_selector(&self, selector: Selector) -> Result<Vec<FacilitatedTransaction>> {
        self.registry.view(|w| {
            w.facilitated
                .iter()
                .filter(|f| f.state != FctxState::Deleted)
                .filter(|f| selector == Selector::All || f.account == Some(selector))
                .cloned()
                .collect()
        })
    }

    // ========================================================================
    // Initiating
    // ========================================================================

    /// Offer to pay a contact. Without a known address the contact is asked
    /// for one first.
    pub async fn initiate_payment(
        &self,
        contact: &str,
        amount: u64,
        note: Option<String>,
        known_address: Option<String>,
    ) -> Result<FacilitatedTransaction> {
        validate_amount(amount)?;
        let _guard = self.ops.lock().await;

        let state = match &known_address {
            Some(address) => {
                crate::keys::validate_address(address)?;
                FctxState::AwaitingPayment
            }
            None => FctxState::AwaitingAddress,
        };
        let fctx = new_entry(
            contact,
            Role::Initiator,
            Intent::Payment,
            state,
            amount,
            note,
            known_address,
        );

        if fctx.state == FctxState::AwaitingAddress {
            self.channel
                .send(
                    contact,
                    &ContactMessage::RequestForAddress {
                        id: fctx.id.clone(),
                        amount,
                        note: fctx.note.clone(),
                    },
                )
                .await?;
        }
        self.insert(fctx.clone())?;
        info!("Initiated payment {} to {} ({})", fctx.id, contact, fctx.state);
        Ok(fctx)
    }

    /// Ask a contact to pay into `account`
    pub async fn initiate_request(
        &self,
        contact: &str,
        amount: u64,
        note: Option<String>,
        account: Selector,
    ) -> Result<FacilitatedTransaction> {
        validate_amount(amount)?;
        let _guard = self.ops.lock().await;

        let address = self.registry.receive_address(account)?;
        let mut fctx = new_entry(
            contact,
            Role::Initiator,
            Intent::Request,
            FctxState::AwaitingPayment,
            amount,
            note,
            Some(address.clone()),
        );
        fctx.account = Some(account);

        self.channel
            .send(
                contact,
                &ContactMessage::PaymentRequest {
                    id: fctx.id.clone(),
                    amount,
                    note: fctx.note.clone(),
                    address,
                },
            )
            .await?;
        self.insert(fctx.clone())?;
        info!("Requested payment {} from {}", fctx.id, contact);
        Ok(fctx)
    }

    // ========================================================================
    // Local decisions
    // ========================================================================

    /// The payee picked a receiving account: `position` indexes the active
    /// accounts (without the "all" entry). The account's first unused
    /// receive address is published to the contact.
    pub async fn on_account_chosen(&self, position: usize, id: &str) -> Result<FacilitatedTransaction> {
        let _guard = self.ops.lock().await;
        let fctx = self.get(id)?;
        fctx.check(Event::AddressSupplied)?;
        if !fctx.is_payee() {
            return Err(protocol_error(&fctx, "choose a receiving account as payer"));
        }

        let position = position
            .checked_add(1)
            .ok_or_else(|| WalletError::Validation(format!("account position {} out of range", position)))?;
        let account = self.registry.try_selector_at(position)?;
        let address = self.registry.receive_address(account)?;

        self.channel
            .send(
                &fctx.contact,
                &ContactMessage::AddressSupplied {
                    id: fctx.id.clone(),
                    address: address.clone(),
                },
            )
            .await?;

        self.modify(id, |f| {
            f.apply(Event::AddressSupplied)?;
            f.address = Some(address);
            f.account = Some(account);
            Ok(())
        })
    }

    /// The payer broadcast the funding transaction from account `funding`
    pub async fn mark_broadcast(
        &self,
        id: &str,
        tx_hash: &str,
        funding: Selector,
    ) -> Result<FacilitatedTransaction> {
        let _guard = self.ops.lock().await;
        let fctx = self.get(id)?;
        fctx.check(Event::PaymentBroadcast)?;
        if !fctx.is_payer() {
            return Err(protocol_error(&fctx, "record a broadcast as payee"));
        }
        match funding {
            Selector::Hd(_) | Selector::Imported(_) => {
                self.registry.label(funding)?;
            }
            Selector::All | Selector::Secondary => {
                return Err(WalletError::Validation(format!(
                    "{} cannot fund a bitcoin payment",
                    funding
                )));
            }
        }

        self.channel
            .send(
                &fctx.contact,
                &ContactMessage::PaymentBroadcast {
                    id: fctx.id.clone(),
                    tx_hash: tx_hash.to_string(),
                },
            )
            .await?;

        self.modify(id, |f| {
            f.apply(Event::PaymentBroadcast)?;
            f.tx_hash = Some(tx_hash.to_string());
            f.account = Some(funding);
            Ok(())
        })
    }

    pub async fn cancel(&self, id: &str) -> Result<FacilitatedTransaction> {
        let _guard = self.ops.lock().await;
        let fctx = self.get(id)?;
        fctx.check(Event::Cancel)?;

        self.channel
            .send(&fctx.contact, &ContactMessage::Cancelled { id: fctx.id.clone() })
            .await?;
        self.modify(id, |f| f.apply(Event::Cancel))
    }

    /// First step of deletion: returns the confirmation prompt
    pub fn request_delete(&self, id: &str) -> Result<Prompt> {
        self.modify(id, |f| {
            f.check(Event::Delete)?;
            f.delete_requested = true;
            Ok(())
        })?;
        Ok(Prompt::ConfirmDelete { id: id.to_string() })
    }

    /// Second step of deletion
    pub async fn confirm_delete(&self, id: &str) -> Result<FacilitatedTransaction> {
        let _guard = self.ops.lock().await;
        let fctx = self.get(id)?;
        if !fctx.delete_requested {
            return Err(protocol_error(&fctx, "delete without confirmation"));
        }
        fctx.check(Event::Delete)?;

        let deleted = self.modify(id, |f| f.apply(Event::Delete))?;
        let notice = ContactMessage::Cancelled { id: id.to_string() };
        if let Err(e) = self.channel.send(&deleted.contact, &notice).await {
            warn!("Could not notify {} of deletion: {}", deleted.contact, e);
        }
        Ok(deleted)
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    pub async fn handle_message(
        &self,
        contact: &str,
        message: ContactMessage,
    ) -> Result<FacilitatedTransaction> {
        let _guard = self.ops.lock().await;
        debug!("Contact message from {}: {:?}", contact, message);

        match message {
            ContactMessage::RequestForAddress { id, amount, note } => {
                validate_amount(amount)?;
                let mut fctx = new_entry(
                    contact,
                    Role::Responder,
                    Intent::Payment,
                    FctxState::AwaitingAddress,
                    amount,
                    note,
                    None,
                );
                fctx.id = id;
                self.insert(fctx.clone())?;
                Ok(fctx)
            }
            ContactMessage::PaymentRequest {
                id,
                amount,
                note,
                address,
            } => {
                validate_amount(amount)?;
                crate::keys::validate_address(&address)?;
                let mut fctx = new_entry(
                    contact,
                    Role::Responder,
                    Intent::Request,
                    FctxState::AwaitingPayment,
                    amount,
                    note,
                    Some(address),
                );
                fctx.id = id;
                self.insert(fctx.clone())?;
                Ok(fctx)
            }
            ContactMessage::AddressSupplied { id, address } => {
                crate::keys::validate_address(&address)?;
                self.modify_from(contact, &id, |f| {
                    f.apply(Event::AddressSupplied)?;
                    f.address = Some(address);
                    Ok(())
                })
            }
            ContactMessage::PaymentBroadcast { id, tx_hash } => {
                self.modify_from(contact, &id, |f| {
                    f.apply(Event::PaymentBroadcast)?;
                    f.tx_hash = Some(tx_hash);
                    Ok(())
                })
            }
            ContactMessage::Cancelled { id } => {
                self.modify_from(contact, &id, |f| f.apply(Event::Cancel))
            }
        }
    }

    /// Complete broadcasts whose transaction is now confirmed. Returns the
    /// ids that completed.
    pub fn observe_confirmations(&self, confirmed: &HashSet<String>) -> Result<Vec<String>> {
        self.registry.update(|w| {
            let mut completed = Vec::new();
            for fctx in &mut w.facilitated {
                let matches = fctx
                    .tx_hash
                    .as_ref()
                    .is_some_and(|hash| confirmed.contains(hash));
                if fctx.state == FctxState::PaymentBroadcast && matches {
                    fctx.apply(Event::Confirmed)?;
                    info!("Facilitated transaction {} completed", fctx.id);
                    completed.push(fctx.id.clone());
                }
            }
            Ok(completed)
        })
    }

    /// The prompt for an entry, by state and side
    pub fn prompt(&self, id: &str) -> Result<Prompt> {
        let fctx = self.get(id)?;
        if fctx.delete_requested && !fctx.state.is_terminal() {
            return Ok(Prompt::ConfirmDelete { id: fctx.id });
        }

        let prompt = match (fctx.state, fctx.is_payer()) {
            (FctxState::AwaitingAddress, true) => Prompt::WaitingForAddress,
            (FctxState::AwaitingAddress, false) => {
                let mut accounts = Vec::new();
                for selector in self.registry.selectors()?.into_iter().skip(1) {
                    accounts.push(self.registry.label(selector)?);
                }
                if accounts.len() == 1 {
                    Prompt::ConfirmSendAddress {
                        id: fctx.id,
                        account: accounts.remove(0),
                    }
                } else {
                    Prompt::ChooseAccount {
                        id: fctx.id,
                        accounts,
                    }
                }
            }
            (FctxState::AwaitingPayment, true) => match fctx.address {
                Some(address) => Prompt::Pay {
                    id: fctx.id,
                    address,
                    amount: fctx.amount,
                },
                None => Prompt::WaitingForAddress,
            },
            (FctxState::AwaitingPayment | FctxState::PaymentBroadcast, false) => {
                Prompt::WaitingForPayment
            }
            (FctxState::PaymentBroadcast, true)
            | (FctxState::Completed | FctxState::Cancelled | FctxState::Deleted, _) => {
                Prompt::Nothing
            }
        };
        Ok(prompt)
    }

    fn insert(&self, fctx: FacilitatedTransaction) -> Result<()> {
        self.registry.update(|w| {
            if w.facilitated.iter().any(|f| f.id == fctx.id) {
                return Err(WalletError::Validation(format!(
                    "facilitated transaction {} already exists",
                    fctx.id
                )));
            }
            w.facilitated.push(fctx);
            Ok(())
        })
    }

    /// Apply `f` to a copy and store it only if `f` succeeds
    fn modify<F>(&self, id: &str, f: F) -> Result<FacilitatedTransaction>
    where
        F: FnOnce(&mut FacilitatedTransaction) -> Result<()>,
    {
        self.registry.update(|w| {
            let slot = w
                .facilitated
                .iter_mut()
                .find(|e| e.id == id)
                .ok_or_else(|| WalletError::Validation(format!("unknown facilitated transaction {}", id)))?;
            let mut updated = slot.clone();
            f(&mut updated)?;
            *slot = updated.clone();
            Ok(updated)
        })
    }

    fn modify_from<F>(&self, contact: &str, id: &str, f: F) -> Result<FacilitatedTransaction>
    where
        F: FnOnce(&mut FacilitatedTransaction) -> Result<()>,
    {
        let fctx = self.get(id)?;
        if fctx.contact != contact {
            return Err(WalletError::Validation(format!(
                "contact {} is not party to {}",
                contact, id
            )));
        }
        self.modify(id, f)
    }
}

fn new_entry(
    contact: &str,
    role: Role,
    intent: Intent,
    state: FctxState,
    amount: u64,
    note: Option<String>,
    address: Option<String>,
) -> FacilitatedTransaction {
    let now = Utc::now().timestamp();
    FacilitatedTransaction {
        id: Uuid::new_v4().to_string(),
        contact: contact.to_string(),
        role,
        intent,
        state,
        amount,
        note,
        address,
        account: None,
        tx_hash: None,
        delete_requested: false,
        created: now,
        updated: now,
    }
}

fn validate_amount(amount: u64) -> Result<()> {
    if amount == 0 {
        return Err(WalletError::Validation("amount must be positive".into()));
    }
    Ok(())
}

fn protocol_error(fctx: &FacilitatedTransaction, action: &str) -> WalletError {
    WalletError::ProtocolState {
        id: fctx.id.clone(),
        state: fctx.state.to_string(),
        action: action.to_string(),
    }
}
