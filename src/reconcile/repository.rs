//! Storage Repository
//!
//! Every state change that can race goes through a conditional update
//! ("update only if the row still looks like what I read") and reports
//! whether a row changed. `Ok(false)` means another actor got there first; it
//! is never an error.

use async_trait::async_trait;
use chrono::Duration;
use uuid::Uuid;

use super::error::ReconcileError;
use super::types::{
    FinalizationMarker, MinorAmount, Pot, ReconciliationCandidate, Transaction, TransferType,
};

/// Field patch for conditional updates
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Patch<T> {
    #[default]
    Keep,
    Clear,
    Set(T),
}

impl<T> From<Option<T>> for Patch<T> {
    /// `None` clears the field
    fn from(value: Option<T>) -> Self {
        match value {
            Some(value) => Patch::Set(value),
            None => Patch::Clear,
        }
    }
}

/// Reference data copied from a provider callback
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferenceMetadata {
    pub provider_status: Option<String>,
    /// Written only while the column is still empty
    pub external_transfer_id: Option<String>,
    pub transfer_type: Option<TransferType>,
    pub failure_reason: Option<String>,
    pub session_id: Option<String>,
}

/// Token compare-and-set on a pending claim
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimStateUpdate {
    pub transaction_id: Uuid,
    /// Raw token the caller read; `None` matches an empty field
    pub expected_token: Option<String>,
    pub new_token: String,
    pub external_transfer_id: Patch<String>,
    pub failure_reason: Patch<String>,
}

/// Compensating write for a failed generic transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureCompensation {
    pub transaction_id: Uuid,
    pub reason: String,
    /// Wallet credited with principal + fee
    pub sender_id: Uuid,
    pub credit_amount: MinorAmount,
    /// Fee to pull back from platform revenue, if it was forwarded
    pub fee_reversal: Option<MinorAmount>,
    /// Payment request to move from `processing` back to `pending`
    pub release_payment_request: Option<Uuid>,
}

/// Explicit-rejection revert of a claim
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimRevert {
    pub transaction_id: Uuid,
    pub pot_id: Uuid,
    pub expected_token: Option<String>,
    pub new_token: String,
    pub reason: String,
}

/// Claim to insert when a pot slot is reserved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewClaim {
    pub transaction_id: Uuid,
    pub pot_id: Uuid,
    pub claimant_id: Uuid,
    pub destination_account_ref: String,
    pub state_token: String,
}

/// Result of a finalization lock attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockAcquisition {
    pub acquired: bool,
    /// Pot status was `active` when the lock was taken
    pub was_active: bool,
}

#[async_trait]
pub trait ReconcileRepository: Send + Sync {
    // === Transaction lookup ===

    async fn get_transaction(&self, id: Uuid) -> Result<Option<Transaction>, ReconcileError>;

    async fn find_by_external_id(
        &self,
        external_transfer_id: &str,
    ) -> Result<Option<Transaction>, ReconcileError>;

    /// Oldest pending pot claim matching both accounts and the amount that
    /// has no transfer anchored yet
    async fn find_pending_claim_by_participants(
        &self,
        source_account_ref: &str,
        destination_account_ref: &str,
        amount: MinorAmount,
    ) -> Result<Option<Transaction>, ReconcileError>;

    async fn find_pot_id_for_claim(
        &self,
        transaction_id: Uuid,
    ) -> Result<Option<Uuid>, ReconcileError>;

    // === Transaction writes ===

    /// Never touches `status` or `state_token`
    async fn update_reference_metadata(
        &self,
        transaction_id: Uuid,
        metadata: &ReferenceMetadata,
    ) -> Result<(), ReconcileError>;

    /// Mark completed unless already completed; fulfils the payment request
    /// in the same atomic write.
    async fn complete_transaction(
        &self,
        transaction_id: Uuid,
        external_transfer_id: &str,
        payment_request_id: Option<Uuid>,
    ) -> Result<bool, ReconcileError>;

    /// Mark failed and apply the compensation atomically; only from a
    /// non-terminal status.
    async fn fail_with_compensation(
        &self,
        compensation: &FailureCompensation,
    ) -> Result<bool, ReconcileError>;

    /// Mark failed without any compensation; only from a non-terminal status
    async fn mark_failed(&self, transaction_id: Uuid, reason: &str)
    -> Result<bool, ReconcileError>;

    /// Token CAS on a claim that is still `pending`
    async fn update_claim_state(&self, update: &ClaimStateUpdate) -> Result<bool, ReconcileError>;

    /// Set the external id only if none is recorded
    async fn record_external_id(
        &self,
        transaction_id: Uuid,
        external_transfer_id: &str,
    ) -> Result<bool, ReconcileError>;

    /// Fail the claim and hand its slot back to the pot, atomically
    async fn revert_claim(&self, revert: &ClaimRevert) -> Result<bool, ReconcileError>;

    /// Pending claims with no external id older than `min_age`, oldest first
    async fn list_reconciliation_candidates(
        &self,
        min_age: Duration,
        limit: i64,
    ) -> Result<Vec<ReconciliationCandidate>, ReconcileError>;

    // === Pots ===

    async fn get_pot(&self, pot_id: Uuid) -> Result<Option<Pot>, ReconcileError>;

    /// Increment `claims_made_count` against slot, expiry, status and lock
    /// checks and insert the claim. `None` when the pot cannot take a claim.
    async fn reserve_claim(&self, claim: &NewClaim) -> Result<Option<Transaction>, ReconcileError>;

    async fn acquire_finalization_lock(
        &self,
        pot_id: Uuid,
    ) -> Result<LockAcquisition, ReconcileError>;

    /// Drop the lock, apply `marker` and re-activate the pot if `restore_active`
    async fn release_finalization_lock(
        &self,
        pot_id: Uuid,
        restore_active: bool,
        marker: Patch<FinalizationMarker>,
    ) -> Result<(), ReconcileError>;

    async fn set_finalization_marker(
        &self,
        pot_id: Uuid,
        marker: FinalizationMarker,
    ) -> Result<(), ReconcileError>;

    /// Add to `refunded_amount`, complete the pot, release the lock and leave
    /// `marker` (if any) for a later close.
    async fn record_refund(
        &self,
        pot_id: Uuid,
        amount: MinorAmount,
        marker: Option<FinalizationMarker>,
    ) -> Result<(), ReconcileError>;

    /// Complete the pot keeping the lock held, flagged for manual follow-up
    async fn mark_refund_persistence_failed(&self, pot_id: Uuid) -> Result<(), ReconcileError>;
}
