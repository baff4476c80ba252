//! In-memory repository for testing
//!
//! Mirrors the conditional-update semantics of the PostgreSQL repository and
//! supports scripted failures per operation.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use uuid::Uuid;

use super::error::ReconcileError;
use super::repository::{
    ClaimRevert, ClaimStateUpdate, FailureCompensation, LockAcquisition, NewClaim, Patch,
    ReconcileRepository, ReferenceMetadata,
};
use super::state::{ClaimState, StateToken};
use super::types::{
    FinalizationMarker, MinorAmount, Pot, PotStatus, ReconciliationCandidate, Transaction,
    TransactionKind, TransactionStatus,
};

/// Repository operations that can be scripted to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RepoOp {
    GetTransaction,
    UpdateMetadata,
    CompleteTransaction,
    FailWithCompensation,
    MarkFailed,
    UpdateClaimState,
    RecordExternalId,
    RevertClaim,
    ListCandidates,
    ReserveClaim,
    SetFinalizationMarker,
    RecordRefund,
    MarkRefundPersistenceFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentRequestStatus {
    Pending,
    Processing,
    Fulfilled,
}

#[derive(Default)]
struct MemoryState {
    transactions: HashMap<Uuid, Transaction>,
    claim_pots: HashMap<Uuid, Uuid>,
    pots: HashMap<Uuid, Pot>,
    payment_requests: HashMap<Uuid, PaymentRequestStatus>,
    wallet_credits: Vec<(Uuid, MinorAmount)>,
    fee_reversals: Vec<(Uuid, MinorAmount)>,
    metadata_writes: usize,
}

#[derive(Default)]
pub struct MemoryRepository {
    state: Mutex<MemoryState>,
    /// Scripted outcomes per operation; `None` lets one call through
    failures: Mutex<HashMap<RepoOp, VecDeque<Option<ReconcileError>>>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next call of `op` fail with `err`
    pub fn fail_next(&self, op: RepoOp, err: ReconcileError) {
        self.failures
            .lock()
            .unwrap()
            .entry(op)
            .or_default()
            .push_back(Some(err));
    }

    /// Let the next call of `op` through before any scripted failure
    pub fn pass_next(&self, op: RepoOp) {
        self.failures
            .lock()
            .unwrap()
            .entry(op)
            .or_default()
            .push_back(None);
    }

    fn take_failure(&self, op: RepoOp) -> Result<(), ReconcileError> {
        match self
            .failures
            .lock()
            .unwrap()
            .get_mut(&op)
            .and_then(VecDeque::pop_front)
        {
            Some(Some(err)) => Err(err),
            _ => Ok(()),
        }
    }

    pub fn insert_transaction(&self, tx: Transaction) {
        self.state.lock().unwrap().transactions.insert(tx.id, tx);
    }

    pub fn insert_pot(&self, pot: Pot) {
        self.state.lock().unwrap().pots.insert(pot.id, pot);
    }

    pub fn link_claim(&self, transaction_id: Uuid, pot_id: Uuid) {
        self.state
            .lock()
            .unwrap()
            .claim_pots
            .insert(transaction_id, pot_id);
    }

    pub fn insert_payment_request(&self, id: Uuid, status: PaymentRequestStatus) {
        self.state
            .lock()
            .unwrap()
            .payment_requests
            .insert(id, status);
    }

    pub fn transaction(&self, id: Uuid) -> Transaction {
        self.state.lock().unwrap().transactions[&id].clone()
    }

    pub fn pot(&self, id: Uuid) -> Pot {
        self.state.lock().unwrap().pots[&id].clone()
    }

    pub fn payment_request(&self, id: Uuid) -> Option<PaymentRequestStatus> {
        self.state.lock().unwrap().payment_requests.get(&id).copied()
    }

    pub fn wallet_credits(&self) -> Vec<(Uuid, MinorAmount)> {
        self.state.lock().unwrap().wallet_credits.clone()
    }

    pub fn fee_reversals(&self) -> Vec<(Uuid, MinorAmount)> {
        self.state.lock().unwrap().fee_reversals.clone()
    }

    pub fn metadata_writes(&self) -> usize {
        self.state.lock().unwrap().metadata_writes
    }

    /// Age a transaction so it passes the sweep eligibility window
    pub fn backdate(&self, id: Uuid, by: Duration) {
        let mut state = self.state.lock().unwrap();
        if let Some(tx) = state.transactions.get_mut(&id) {
            tx.created_at -= by;
        }
    }
}

fn apply_patch(field: &mut Option<String>, patch: &Patch<String>) {
    match patch {
        Patch::Keep => {}
        Patch::Clear => *field = None,
        Patch::Set(value) => *field = Some(value.clone()),
    }
}

#[async_trait]
impl ReconcileRepository for MemoryRepository {
    async fn get_transaction(&self, id: Uuid) -> Result<Option<Transaction>, ReconcileError> {
        self.take_failure(RepoOp::GetTransaction)?;
        Ok(self.state.lock().unwrap().transactions.get(&id).cloned())
    }

    async fn find_by_external_id(
        &self,
        external_transfer_id: &str,
    ) -> Result<Option<Transaction>, ReconcileError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .transactions
            .values()
            .find(|tx| tx.external_transfer_id.as_deref() == Some(external_transfer_id))
            .cloned())
    }

    async fn find_pending_claim_by_participants(
        &self,
        source_account_ref: &str,
        destination_account_ref: &str,
        amount: MinorAmount,
    ) -> Result<Option<Transaction>, ReconcileError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .transactions
            .values()
            .filter(|tx| {
                tx.kind == TransactionKind::PotClaim
                    && tx.status == TransactionStatus::Pending
                    && tx.external_transfer_id.is_none()
                    && tx.source_account_ref.as_deref() == Some(source_account_ref)
                    && tx.destination_account_ref.as_deref() == Some(destination_account_ref)
                    && tx.amount == amount
            })
            .min_by_key(|tx| tx.created_at)
            .cloned())
    }

    async fn find_pot_id_for_claim(
        &self,
        transaction_id: Uuid,
    ) -> Result<Option<Uuid>, ReconcileError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .claim_pots
            .get(&transaction_id)
            .copied())
    }

    async fn update_reference_metadata(
        &self,
        transaction_id: Uuid,
        metadata: &ReferenceMetadata,
    ) -> Result<(), ReconcileError> {
        self.take_failure(RepoOp::UpdateMetadata)?;
        let mut state = self.state.lock().unwrap();
        state.metadata_writes += 1;
        let tx = state
            .transactions
            .get_mut(&transaction_id)
            .ok_or_else(|| ReconcileError::NotFound(transaction_id.to_string()))?;

        if metadata.provider_status.is_some() {
            tx.provider_status = metadata.provider_status.clone();
        }
        if tx.external_transfer_id.is_none() {
            tx.external_transfer_id = metadata.external_transfer_id.clone();
        }
        if metadata.transfer_type.is_some() {
            tx.transfer_type = metadata.transfer_type;
        }
        if metadata.failure_reason.is_some() {
            tx.failure_reason = metadata.failure_reason.clone();
        }
        if metadata.session_id.is_some() {
            tx.session_id = metadata.session_id.clone();
        }
        tx.updated_at = Utc::now();
        Ok(())
    }

    async fn complete_transaction(
        &self,
        transaction_id: Uuid,
        external_transfer_id: &str,
        payment_request_id: Option<Uuid>,
    ) -> Result<bool, ReconcileError> {
        self.take_failure(RepoOp::CompleteTransaction)?;
        let mut state = self.state.lock().unwrap();
        let Some(tx) = state.transactions.get_mut(&transaction_id) else {
            return Ok(false);
        };
        if tx.status == TransactionStatus::Completed {
            return Ok(false);
        }
        tx.status = TransactionStatus::Completed;
        if tx.external_transfer_id.is_none() {
            tx.external_transfer_id = Some(external_transfer_id.to_string());
        }
        tx.updated_at = Utc::now();

        if let Some(request_id) = payment_request_id
            && let Some(request) = state.payment_requests.get_mut(&request_id)
        {
            *request = PaymentRequestStatus::Fulfilled;
        }
        Ok(true)
    }

    async fn fail_with_compensation(
        &self,
        compensation: &FailureCompensation,
    ) -> Result<bool, ReconcileError> {
        self.take_failure(RepoOp::FailWithCompensation)?;
        let mut state = self.state.lock().unwrap();
        let Some(tx) = state.transactions.get_mut(&compensation.transaction_id) else {
            return Ok(false);
        };
        if tx.status.is_terminal() {
            return Ok(false);
        }
        tx.status = TransactionStatus::Failed;
        tx.failure_reason = Some(compensation.reason.clone());
        tx.updated_at = Utc::now();

        state
            .wallet_credits
            .push((compensation.sender_id, compensation.credit_amount));
        if let Some(fee) = compensation.fee_reversal {
            state.fee_reversals.push((compensation.transaction_id, fee));
        }
        if let Some(request_id) = compensation.release_payment_request
            && let Some(request) = state.payment_requests.get_mut(&request_id)
            && *request == PaymentRequestStatus::Processing
        {
            *request = PaymentRequestStatus::Pending;
        }
        Ok(true)
    }

    async fn mark_failed(
        &self,
        transaction_id: Uuid,
        reason: &str,
    ) -> Result<bool, ReconcileError> {
        self.take_failure(RepoOp::MarkFailed)?;
        let mut state = self.state.lock().unwrap();
        let Some(tx) = state.transactions.get_mut(&transaction_id) else {
            return Ok(false);
        };
        if tx.status.is_terminal() {
            return Ok(false);
        }
        tx.status = TransactionStatus::Failed;
        tx.failure_reason = Some(reason.to_string());
        tx.updated_at = Utc::now();
        Ok(true)
    }

    async fn update_claim_state(&self, update: &ClaimStateUpdate) -> Result<bool, ReconcileError> {
        self.take_failure(RepoOp::UpdateClaimState)?;
        let mut state = self.state.lock().unwrap();
        let Some(tx) = state.transactions.get_mut(&update.transaction_id) else {
            return Ok(false);
        };
        if tx.kind != TransactionKind::PotClaim
            || tx.status != TransactionStatus::Pending
            || tx.state_token != update.expected_token
        {
            return Ok(false);
        }
        tx.state_token = Some(update.new_token.clone());
        apply_patch(&mut tx.external_transfer_id, &update.external_transfer_id);
        apply_patch(&mut tx.failure_reason, &update.failure_reason);
        tx.updated_at = Utc::now();
        Ok(true)
    }

    async fn record_external_id(
        &self,
        transaction_id: Uuid,
        external_transfer_id: &str,
    ) -> Result<bool, ReconcileError> {
        self.take_failure(RepoOp::RecordExternalId)?;
        let mut state = self.state.lock().unwrap();
        match state.transactions.get_mut(&transaction_id) {
            Some(tx) if tx.external_transfer_id.is_none() => {
                tx.external_transfer_id = Some(external_transfer_id.to_string());
                tx.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn revert_claim(&self, revert: &ClaimRevert) -> Result<bool, ReconcileError> {
        self.take_failure(RepoOp::RevertClaim)?;
        let mut state = self.state.lock().unwrap();
        let Some(tx) = state.transactions.get_mut(&revert.transaction_id) else {
            return Ok(false);
        };
        if tx.status != TransactionStatus::Pending || tx.state_token != revert.expected_token {
            return Ok(false);
        }
        tx.status = TransactionStatus::Failed;
        tx.state_token = Some(revert.new_token.clone());
        tx.failure_reason = Some(revert.reason.clone());
        tx.updated_at = Utc::now();

        if let Some(pot) = state.pots.get_mut(&revert.pot_id) {
            pot.claims_made_count = (pot.claims_made_count - 1).max(0);
        }
        Ok(true)
    }

    async fn list_reconciliation_candidates(
        &self,
        min_age: Duration,
        limit: i64,
    ) -> Result<Vec<ReconciliationCandidate>, ReconcileError> {
        self.take_failure(RepoOp::ListCandidates)?;
        let state = self.state.lock().unwrap();
        let cutoff = Utc::now() - min_age;

        let mut candidates: Vec<ReconciliationCandidate> = state
            .transactions
            .values()
            .filter(|tx| {
                tx.kind == TransactionKind::PotClaim
                    && tx.status == TransactionStatus::Pending
                    && tx.external_transfer_id.is_none()
                    && tx.created_at <= cutoff
            })
            .map(|tx| ReconciliationCandidate {
                transaction_id: tx.id,
                pot_id: state.claim_pots.get(&tx.id).copied().or_else(|| {
                    StateToken::decode_opt(tx.state_token.as_deref()).and_then(|t| t.pot_id())
                }),
                source_account_ref: tx.source_account_ref.clone().unwrap_or_default(),
                destination_account_ref: tx.destination_account_ref.clone().unwrap_or_default(),
                amount: tx.amount,
                state_token: tx.state_token.clone(),
                created_at: tx.created_at,
            })
            .collect();

        candidates.sort_by_key(|c| c.created_at);
        candidates.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(candidates)
    }

    async fn get_pot(&self, pot_id: Uuid) -> Result<Option<Pot>, ReconcileError> {
        Ok(self.state.lock().unwrap().pots.get(&pot_id).cloned())
    }

    async fn reserve_claim(&self, claim: &NewClaim) -> Result<Option<Transaction>, ReconcileError> {
        self.take_failure(RepoOp::ReserveClaim)?;
        let mut state = self.state.lock().unwrap();
        let now = Utc::now();
        let Some(pot) = state.pots.get_mut(&claim.pot_id) else {
            return Ok(None);
        };
        if pot.status != PotStatus::Active
            || pot.finalizing
            || pot.is_exhausted()
            || pot.is_expired(now)
        {
            return Ok(None);
        }
        pot.claims_made_count += 1;

        let tx = Transaction {
            id: claim.transaction_id,
            sender_id: pot.creator_id,
            recipient_id: Some(claim.claimant_id),
            source_account_ref: Some(pot.provider_account_ref.clone()),
            destination_account_ref: Some(claim.destination_account_ref.clone()),
            amount: pot.amount_per_claim,
            fee: 0,
            kind: TransactionKind::PotClaim,
            status: TransactionStatus::Pending,
            external_transfer_id: None,
            transfer_type: None,
            failure_reason: None,
            state_token: Some(claim.state_token.clone()),
            provider_status: None,
            session_id: None,
            payment_request_id: None,
            fee_forwarded: false,
            created_at: now,
            updated_at: now,
        };
        state.transactions.insert(tx.id, tx.clone());
        state.claim_pots.insert(tx.id, claim.pot_id);
        Ok(Some(tx))
    }

    async fn acquire_finalization_lock(
        &self,
        pot_id: Uuid,
    ) -> Result<LockAcquisition, ReconcileError> {
        let mut state = self.state.lock().unwrap();
        let Some(pot) = state.pots.get_mut(&pot_id) else {
            return Err(ReconcileError::PotNotFound(pot_id.to_string()));
        };
        let reopenable = matches!(
            pot.finalization_marker,
            None | Some(FinalizationMarker::RetryPending)
        );
        if pot.finalizing || !reopenable {
            return Ok(LockAcquisition {
                acquired: false,
                was_active: pot.status == PotStatus::Active,
            });
        }
        pot.finalizing = true;
        Ok(LockAcquisition {
            acquired: true,
            was_active: pot.status == PotStatus::Active,
        })
    }

    async fn release_finalization_lock(
        &self,
        pot_id: Uuid,
        restore_active: bool,
        marker: Patch<FinalizationMarker>,
    ) -> Result<(), ReconcileError> {
        let mut state = self.state.lock().unwrap();
        if let Some(pot) = state.pots.get_mut(&pot_id) {
            pot.finalizing = false;
            match marker {
                Patch::Keep => {}
                Patch::Clear => pot.finalization_marker = None,
                Patch::Set(marker) => pot.finalization_marker = Some(marker),
            }
            if restore_active {
                pot.status = PotStatus::Active;
            }
        }
        Ok(())
    }

    async fn set_finalization_marker(
        &self,
        pot_id: Uuid,
        marker: FinalizationMarker,
    ) -> Result<(), ReconcileError> {
        self.take_failure(RepoOp::SetFinalizationMarker)?;
        let mut state = self.state.lock().unwrap();
        if let Some(pot) = state.pots.get_mut(&pot_id) {
            pot.finalization_marker = Some(marker);
        }
        Ok(())
    }

    async fn record_refund(
        &self,
        pot_id: Uuid,
        amount: MinorAmount,
        marker: Option<FinalizationMarker>,
    ) -> Result<(), ReconcileError> {
        self.take_failure(RepoOp::RecordRefund)?;
        let mut state = self.state.lock().unwrap();
        if let Some(pot) = state.pots.get_mut(&pot_id) {
            pot.refunded_amount += amount;
            pot.status = PotStatus::Completed;
            pot.finalizing = false;
            pot.finalization_marker = marker;
        }
        Ok(())
    }

    async fn mark_refund_persistence_failed(&self, pot_id: Uuid) -> Result<(), ReconcileError> {
        self.take_failure(RepoOp::MarkRefundPersistenceFailed)?;
        let mut state = self.state.lock().unwrap();
        if let Some(pot) = state.pots.get_mut(&pot_id) {
            pot.status = PotStatus::Completed;
            pot.finalizing = true;
            pot.finalization_marker = Some(FinalizationMarker::RefundPersistenceFailed);
        }
        Ok(())
    }
}

// === Fixtures ===

pub fn pot_fixture() -> Pot {
    Pot {
        id: Uuid::new_v4(),
        creator_id: Uuid::new_v4(),
        provider_account_ref: "acct_pot".to_string(),
        creator_account_ref: "acct_creator".to_string(),
        amount_per_claim: 10_000,
        total_slots: 10,
        claims_made_count: 0,
        total_amount: 100_000,
        refunded_amount: 0,
        status: PotStatus::Active,
        expires_at: Utc::now() + Duration::hours(24),
        finalizing: false,
        finalization_marker: None,
    }
}

pub fn generic_fixture(kind: TransactionKind) -> Transaction {
    let now = Utc::now();
    Transaction {
        id: Uuid::new_v4(),
        sender_id: Uuid::new_v4(),
        recipient_id: Some(Uuid::new_v4()),
        source_account_ref: Some("acct_sender".to_string()),
        destination_account_ref: Some("acct_recipient".to_string()),
        amount: 50_000,
        fee: 100,
        kind,
        status: TransactionStatus::Pending,
        external_transfer_id: None,
        transfer_type: None,
        failure_reason: None,
        state_token: None,
        provider_status: None,
        session_id: None,
        payment_request_id: None,
        fee_forwarded: false,
        created_at: now,
        updated_at: now,
    }
}

/// Pending claim against `pot` in the given reconciliation state
pub fn claim_fixture(pot: &Pot, state: Option<ClaimState>) -> Transaction {
    let mut tx = generic_fixture(TransactionKind::PotClaim);
    tx.sender_id = pot.creator_id;
    tx.source_account_ref = Some(pot.provider_account_ref.clone());
    tx.destination_account_ref = Some(format!("acct_claimant_{}", &tx.id.simple().to_string()[..8]));
    tx.amount = pot.amount_per_claim;
    tx.fee = 0;
    tx.state_token = state.map(|s| StateToken::new(Some(pot.id), s).encode());
    tx
}
