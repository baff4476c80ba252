//! Reconciliation Core Types
//!
//! Ledger transactions, funding pots and the inbound provider event shape.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Amount in minor currency units (e.g. kobo, cents)
pub type MinorAmount = i64;

/// Transaction kind - selects routing and compensation rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    /// Wallet-to-wallet transfer between two users
    PeerTransfer,
    /// User moving funds out to their own bank account
    Withdrawal,
    /// Payout from a shared pot to one claimant
    PotClaim,
    /// Platform fee sweep
    FeeCollection,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::PeerTransfer => "peer_transfer",
            TransactionKind::Withdrawal => "withdrawal",
            TransactionKind::PotClaim => "pot_claim",
            TransactionKind::FeeCollection => "fee_collection",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "peer_transfer" => Some(TransactionKind::PeerTransfer),
            "withdrawal" => Some(TransactionKind::Withdrawal),
            "pot_claim" => Some(TransactionKind::PotClaim),
            "fee_collection" => Some(TransactionKind::FeeCollection),
            _ => None,
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transaction status
///
/// `Completed` is a one-way gate: nothing may move a completed transaction
/// back to `Failed` or `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Processing => "processing",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TransactionStatus::Pending),
            "processing" => Some(TransactionStatus::Processing),
            "completed" => Some(TransactionStatus::Completed),
            "failed" => Some(TransactionStatus::Failed),
            _ => None,
        }
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Completed | TransactionStatus::Failed
        )
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rail used by the provider to move the funds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferType {
    /// Provider-internal ledger move
    Book,
    /// Interbank rail
    External,
}

impl TransferType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferType::Book => "book",
            TransferType::External => "external",
        }
    }

    /// Strict parse of the stored value
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "book" => Some(TransferType::Book),
            "external" => Some(TransferType::External),
            _ => None,
        }
    }

    /// Lenient parse of provider wording
    pub fn normalize(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "book" | "book_transfer" | "booktransfer" | "internal" | "intra" => {
                Some(TransferType::Book)
            }
            "external" | "nip" | "nibss" | "interbank" | "bank_transfer" | "nip_transfer" => {
                Some(TransferType::External)
            }
            _ => None,
        }
    }
}

/// Ledger movement record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub id: Uuid,
    pub sender_id: Uuid,
    pub recipient_id: Option<Uuid>,
    /// Provider account the funds leave from
    pub source_account_ref: Option<String>,
    /// Provider account or beneficiary the funds go to
    pub destination_account_ref: Option<String>,
    pub amount: MinorAmount,
    pub fee: MinorAmount,
    pub kind: TransactionKind,
    pub status: TransactionStatus,
    pub external_transfer_id: Option<String>,
    pub transfer_type: Option<TransferType>,
    pub failure_reason: Option<String>,
    /// Machine-readable reconciliation state (pot claims only)
    pub state_token: Option<String>,
    /// Last raw status string reported by the provider
    pub provider_status: Option<String>,
    pub session_id: Option<String>,
    pub payment_request_id: Option<Uuid>,
    /// Fee already swept to the platform revenue account
    pub fee_forwarded: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    #[inline]
    pub fn is_claim(&self) -> bool {
        self.kind == TransactionKind::PotClaim
    }

    /// Full amount debited from the sender
    #[inline]
    pub fn debited_total(&self) -> MinorAmount {
        self.amount.saturating_add(self.fee)
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Transaction[{}] kind={} status={} amount={} fee={}",
            self.id, self.kind, self.status, self.amount, self.fee
        )
    }
}

/// Pot lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PotStatus {
    Active,
    Completed,
}

impl PotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PotStatus::Active => "active",
            PotStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(PotStatus::Active),
            "completed" => Some(PotStatus::Completed),
            _ => None,
        }
    }
}

/// Marker left on a pot by the close/refund routine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalizationMarker {
    /// Refund transfer is about to be (or is being) issued
    RefundInFlight,
    /// Part of the outstanding balance was refunded; a later close resumes
    RetryPending,
    /// Provider paid out but the refunded amount was not recorded
    RefundPersistenceFailed,
}

impl FinalizationMarker {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinalizationMarker::RefundInFlight => "refund_in_flight",
            FinalizationMarker::RetryPending => "retry_pending",
            FinalizationMarker::RefundPersistenceFailed => "refund_persistence_failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "refund_in_flight" => Some(FinalizationMarker::RefundInFlight),
            "retry_pending" => Some(FinalizationMarker::RetryPending),
            "refund_persistence_failed" => Some(FinalizationMarker::RefundPersistenceFailed),
            _ => None,
        }
    }
}

/// Pooled-payout funding source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pot {
    pub id: Uuid,
    pub creator_id: Uuid,
    /// Provider account holding the pot's funds
    pub provider_account_ref: String,
    /// Where leftover funds are refunded to
    pub creator_account_ref: String,
    pub amount_per_claim: MinorAmount,
    pub total_slots: i32,
    pub claims_made_count: i32,
    pub total_amount: MinorAmount,
    pub refunded_amount: MinorAmount,
    pub status: PotStatus,
    pub expires_at: DateTime<Utc>,
    /// Finalization lock held
    pub finalizing: bool,
    pub finalization_marker: Option<FinalizationMarker>,
}

impl Pot {
    /// Funds still owed back to the creator, floored at zero
    pub fn outstanding_balance(&self) -> MinorAmount {
        let claimed = self
            .amount_per_claim
            .saturating_mul(i64::from(self.claims_made_count));
        self.total_amount
            .saturating_sub(claimed)
            .saturating_sub(self.refunded_amount)
            .max(0)
    }

    #[inline]
    pub fn is_exhausted(&self) -> bool {
        self.claims_made_count >= self.total_slots
    }

    #[inline]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Stuck claim eligible for the reconciliation sweep
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciliationCandidate {
    pub transaction_id: Uuid,
    pub pot_id: Option<Uuid>,
    pub source_account_ref: String,
    pub destination_account_ref: String,
    pub amount: MinorAmount,
    pub state_token: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Status callback delivered by the provider through the queue
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InboundStatusEvent {
    /// Provider-assigned transfer id
    pub transfer_id: String,
    pub status: String,
    pub transfer_type: String,
    pub reason: String,
    /// Provider account the funds left from
    pub account_id: String,
    /// Provider account or beneficiary on the receiving side
    pub counterparty_id: String,
    pub amount: Option<MinorAmount>,
    pub event_type: String,
    pub event_id: String,
    pub session_id: String,
}

impl InboundStatusEvent {
    /// `None` for empty strings, trimmed otherwise
    pub fn non_empty(value: &str) -> Option<&str> {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then_some(trimmed)
    }
}

/// Status after normalisation of the provider's wording
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormalizedStatus {
    Completed,
    Failed,
    /// Pending-ish or unrecognised: record references, change nothing
    Ignore,
}

impl NormalizedStatus {
    /// Normalise the provider status, falling back to the event type suffix
    /// (`transfer.failed` → `failed`) when the status field is empty.
    pub fn from_event(event: &InboundStatusEvent) -> Self {
        let raw = match InboundStatusEvent::non_empty(&event.status) {
            Some(status) => status.to_string(),
            None => event
                .event_type
                .rsplit('.')
                .next()
                .unwrap_or_default()
                .to_string(),
        };

        match raw.trim().to_ascii_lowercase().as_str() {
            "completed" | "complete" | "success" | "successful" | "settled" => {
                NormalizedStatus::Completed
            }
            "failed" | "failure" | "rejected" | "declined" | "reversed" | "cancelled"
            | "canceled" | "returned" => NormalizedStatus::Failed,
            _ => NormalizedStatus::Ignore,
        }
    }
}
