//! Reconciliation Sweep Job
//!
//! Re-drives pot claims that were confirmed for retry
//! (`reconcile_retry_requested`) and never got a live callback.
//!
//! # Per-candidate flow
//!
//! ```text
//! re-read → eligible? → CAS token to reconcile_retry_inflight → provider call
//!   success           → reconcile_retry_initiated + external id
//!   explicit reject   → revert claim (slot returned) → reconcile_retry_rejected
//!                       revert hit transient error → requeue reconcile_retry_requested
//!   ambiguous failure → reconcile_retry_unknown, claim stays pending
//! ```
//!
//! The in-flight mark is the optimistic lock that keeps two sweeps from
//! paying the same claim. It has no lease: a sweep cut off between the mark
//! and the provider answer leaves the claim in-flight for manual review.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::error::ReconcileError;
use super::repository::{ClaimRevert, ClaimStateUpdate, Patch, ReconcileRepository};
use super::resolver::reason_with_reference;
use super::state::{ClaimState, StateToken, is_auto_retry_eligible};
use super::types::{ReconciliationCandidate, Transaction, TransactionStatus};
use crate::config::SweepConfig;
use crate::provider::{ProviderError, TransferProvider};

/// Immediate attempts to put a claim back to `reconcile_retry_requested`
const REQUEUE_ATTEMPTS: usize = 3;

const RETRY_TRANSFER_LABEL: &str = "Pot claim payout";

/// Counters for one sweep run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub processed: usize,
    /// Provider accepted the retry transfer
    pub retried: usize,
    /// Provider call failed (explicit + ambiguous)
    pub retry_failed: usize,
    pub explicit_rejects: usize,
    pub ambiguous_failures: usize,
    /// Revert failed transiently; claim back to `reconcile_retry_requested`
    pub requeued: usize,
    pub manual_review: usize,
    pub skipped: usize,
}

pub struct ReconciliationSweep {
    repo: Arc<dyn ReconcileRepository>,
    provider: Arc<dyn TransferProvider>,
    min_age: chrono::Duration,
}

impl ReconciliationSweep {
    pub fn new(
        repo: Arc<dyn ReconcileRepository>,
        provider: Arc<dyn TransferProvider>,
        min_age: Duration,
    ) -> Self {
        Self {
            repo,
            provider,
            min_age: chrono::Duration::from_std(min_age).unwrap_or(chrono::Duration::zero()),
        }
    }

    /// Run one sweep over at most `limit` candidates
    pub async fn sweep(&self, limit: i64) -> Result<SweepReport, ReconcileError> {
        let candidates = self
            .repo
            .list_reconciliation_candidates(self.min_age, limit)
            .await?;
        let mut report = SweepReport::default();

        if candidates.is_empty() {
            debug!("No claims awaiting reconciliation");
            return Ok(report);
        }

        for candidate in &candidates {
            report.processed += 1;
            if let Err(e) = self.reconcile_candidate(candidate, &mut report).await {
                error!(
                    tx_id = %candidate.transaction_id,
                    code = e.code(),
                    error = %e,
                    "Claim reconciliation failed"
                );
            }
        }

        Ok(report)
    }

    async fn reconcile_candidate(
        &self,
        candidate: &ReconciliationCandidate,
        report: &mut SweepReport,
    ) -> Result<(), ReconcileError> {
        // Re-read: the claim may have settled since the candidate query
        let Some(tx) = self.repo.get_transaction(candidate.transaction_id).await? else {
            report.skipped += 1;
            return Ok(());
        };
        if tx.status != TransactionStatus::Pending || tx.external_transfer_id.is_some() {
            debug!(tx_id = %tx.id, status = %tx.status, "Claim settled since query");
            report.skipped += 1;
            return Ok(());
        }

        if !is_auto_retry_eligible(tx.state_token.as_deref()) {
            report.skipped += 1;
            return Ok(());
        }

        let Some(pot_id) = self.resolve_pot_id(&tx, candidate).await? else {
            warn!(tx_id = %tx.id, "Retry-requested claim has no resolvable pot");
            report.skipped += 1;
            return Ok(());
        };

        let inflight = StateToken::new(Some(pot_id), ClaimState::RetryInflight).encode();
        let marked = self
            .repo
            .update_claim_state(&ClaimStateUpdate {
                transaction_id: tx.id,
                expected_token: tx.state_token.clone(),
                new_token: inflight.clone(),
                external_transfer_id: Patch::Keep,
                failure_reason: Patch::Keep,
            })
            .await?;
        if !marked {
            debug!(tx_id = %tx.id, "Claim taken by another sweep");
            report.skipped += 1;
            return Ok(());
        }

        let source = tx
            .source_account_ref
            .as_deref()
            .unwrap_or(&candidate.source_account_ref);
        let destination = tx
            .destination_account_ref
            .as_deref()
            .unwrap_or(&candidate.destination_account_ref);
        let reason = reason_with_reference(RETRY_TRANSFER_LABEL, tx.id);

        match self
            .provider
            .initiate_transfer(source, destination, &reason, tx.amount)
            .await
        {
            Ok(external_id) => {
                report.retried += 1;
                self.on_retry_initiated(&tx, pot_id, &inflight, &external_id, report)
                    .await;
            }
            Err(e) if e.is_explicit_rejection() => {
                report.retry_failed += 1;
                report.explicit_rejects += 1;
                self.on_explicit_rejection(&tx, pot_id, &inflight, &e, report)
                    .await;
            }
            Err(e) => {
                report.retry_failed += 1;
                report.ambiguous_failures += 1;
                self.on_ambiguous_failure(&tx, pot_id, &inflight, &e).await?;
            }
        }
        Ok(())
    }

    async fn resolve_pot_id(
        &self,
        tx: &Transaction,
        candidate: &ReconciliationCandidate,
    ) -> Result<Option<Uuid>, ReconcileError> {
        let from_token = StateToken::decode_opt(tx.state_token.as_deref()).and_then(|t| t.pot_id());
        if let Some(pot_id) = from_token.or(candidate.pot_id) {
            return Ok(Some(pot_id));
        }
        self.repo.find_pot_id_for_claim(tx.id).await
    }

    async fn on_retry_initiated(
        &self,
        tx: &Transaction,
        pot_id: Uuid,
        inflight: &str,
        external_id: &str,
        report: &mut SweepReport,
    ) {
        let update = ClaimStateUpdate {
            transaction_id: tx.id,
            expected_token: Some(inflight.to_string()),
            new_token: StateToken::new(Some(pot_id), ClaimState::RetryInitiated).encode(),
            external_transfer_id: Patch::Set(external_id.to_string()),
            failure_reason: Patch::Clear,
        };

        match self.repo.update_claim_state(&update).await {
            Ok(true) => {
                info!(
                    tx_id = %tx.id,
                    pot_id = %pot_id,
                    external_transfer_id = external_id,
                    "Claim payout retry initiated"
                );
                return;
            }
            Ok(false) => warn!(tx_id = %tx.id, "Claim changed during retry, recording reference only"),
            Err(e) => warn!(tx_id = %tx.id, error = %e, "Retry metadata write failed, recording reference only"),
        }

        // Never leave an initiated transfer without its reference
        let failure = match self.repo.record_external_id(tx.id, external_id).await {
            Ok(true) => return,
            // Another transfer already anchors the claim, typically a late completion
            Ok(false) => "claim already anchored to another transfer".to_string(),
            Err(e) => e.to_string(),
        };
        error!(
            tx_id = %tx.id,
            external_transfer_id = external_id,
            error = %failure,
            "CRITICAL: retry transfer initiated but reference not recorded - duplicate payout risk"
        );
        report.manual_review += 1;
    }

    async fn on_explicit_rejection(
        &self,
        tx: &Transaction,
        pot_id: Uuid,
        inflight: &str,
        cause: &ProviderError,
        report: &mut SweepReport,
    ) {
        let reason = format!("retry rejected by provider: {}", cause);
        let revert = ClaimRevert {
            transaction_id: tx.id,
            pot_id,
            expected_token: Some(inflight.to_string()),
            new_token: StateToken::new(Some(pot_id), ClaimState::RetryRejected).encode(),
            reason: reason.clone(),
        };

        match self.repo.revert_claim(&revert).await {
            Ok(true) => {
                info!(tx_id = %tx.id, pot_id = %pot_id, code = cause.code(), "Claim reverted, slot returned");
            }
            Ok(false) => {
                debug!(tx_id = %tx.id, "Claim changed before revert");
            }
            Err(e) if e.is_retryable() => {
                warn!(tx_id = %tx.id, error = %e, "Revert hit transient error, requeueing claim");
                if self.requeue(tx, pot_id, inflight, &reason).await {
                    report.requeued += 1;
                } else {
                    error!(
                        tx_id = %tx.id,
                        "Claim stuck in-flight after rejected retry - manual reconciliation required"
                    );
                    report.manual_review += 1;
                }
            }
            Err(e) => {
                error!(
                    tx_id = %tx.id,
                    pot_id = %pot_id,
                    error = %e,
                    "Revert failed - marking claim failed without revert, manual reconciliation required"
                );
                if let Err(e) = self.repo.mark_failed(tx.id, &reason).await {
                    error!(tx_id = %tx.id, error = %e, "Fallback mark-failed also failed");
                }
                report.manual_review += 1;
            }
        }
    }

    async fn requeue(&self, tx: &Transaction, pot_id: Uuid, inflight: &str, reason: &str) -> bool {
        let update = ClaimStateUpdate {
            transaction_id: tx.id,
            expected_token: Some(inflight.to_string()),
            new_token: StateToken::new(Some(pot_id), ClaimState::RetryRequested).encode(),
            external_transfer_id: Patch::Keep,
            failure_reason: Patch::Set(reason.to_string()),
        };

        for attempt in 1..=REQUEUE_ATTEMPTS {
            match self.repo.update_claim_state(&update).await {
                Ok(true) => return true,
                Ok(false) => {
                    debug!(tx_id = %tx.id, "Claim changed before requeue");
                    return false;
                }
                Err(e) => {
                    warn!(tx_id = %tx.id, attempt = attempt, error = %e, "Requeue attempt failed");
                }
            }
        }
        false
    }

    async fn on_ambiguous_failure(
        &self,
        tx: &Transaction,
        pot_id: Uuid,
        inflight: &str,
        cause: &ProviderError,
    ) -> Result<(), ReconcileError> {
        warn!(
            tx_id = %tx.id,
            pot_id = %pot_id,
            error = %cause,
            "Retry outcome unknown - claim left pending, no revert"
        );
        let update = ClaimStateUpdate {
            transaction_id: tx.id,
            expected_token: Some(inflight.to_string()),
            new_token: StateToken::new(Some(pot_id), ClaimState::RetryUnknown).encode(),
            external_transfer_id: Patch::Keep,
            failure_reason: Patch::Set(format!("retry outcome unknown: {}", cause)),
        };
        self.repo.update_claim_state(&update).await?;
        Ok(())
    }
}

/// Periodic driver for [`ReconciliationSweep`]
pub struct SweepWorker {
    sweep: Arc<ReconciliationSweep>,
    config: SweepConfig,
}

impl SweepWorker {
    pub fn new(sweep: Arc<ReconciliationSweep>, config: SweepConfig) -> Self {
        Self { sweep, config }
    }

    pub async fn run(&self) -> ! {
        info!(
            interval_secs = self.config.interval_secs,
            min_age_secs = self.config.min_age_secs,
            batch_size = self.config.batch_size,
            "Starting reconciliation sweep worker"
        );

        loop {
            self.run_once().await;
            tokio::time::sleep(Duration::from_secs(self.config.interval_secs)).await;
        }
    }

    /// One sweep bounded by `max_duration_secs`
    pub async fn run_once(&self) -> Option<SweepReport> {
        let max_duration = Duration::from_secs(self.config.max_duration_secs);
        match tokio::time::timeout(max_duration, self.sweep.sweep(self.config.batch_size)).await {
            Ok(Ok(report)) => {
                if report.processed > 0 {
                    info!(
                        processed = report.processed,
                        retried = report.retried,
                        retry_failed = report.retry_failed,
                        explicit_rejects = report.explicit_rejects,
                        ambiguous_failures = report.ambiguous_failures,
                        requeued = report.requeued,
                        manual_review = report.manual_review,
                        skipped = report.skipped,
                        "Reconciliation sweep finished"
                    );
                }
                Some(report)
            }
            Ok(Err(e)) => {
                error!(error = %e, "Reconciliation sweep failed");
                None
            }
            Err(_) => {
                warn!(
                    max_duration_secs = self.config.max_duration_secs,
                    "Reconciliation sweep exceeded max duration, cut short"
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MockProvider;
    use crate::reconcile::mock::{MemoryRepository, RepoOp, claim_fixture, pot_fixture};
    use crate::reconcile::state::PotRef;
    use crate::reconcile::types::Pot;

    struct Harness {
        repo: Arc<MemoryRepository>,
        provider: Arc<MockProvider>,
        sweep: ReconciliationSweep,
        pot: Pot,
    }

    fn harness() -> Harness {
        let repo = Arc::new(MemoryRepository::new());
        let provider = Arc::new(MockProvider::new());
        let sweep = ReconciliationSweep::new(repo.clone(), provider.clone(), Duration::from_secs(300));
        let mut pot = pot_fixture();
        pot.claims_made_count = 3;
        repo.insert_pot(pot.clone());
        Harness {
            repo,
            provider,
            sweep,
            pot,
        }
    }

    /// Insert a claim old enough for the sweep
    fn stuck_claim(h: &Harness, state: Option<ClaimState>) -> Transaction {
        let claim = claim_fixture(&h.pot, state);
        h.repo.insert_transaction(claim.clone());
        h.repo.link_claim(claim.id, h.pot.id);
        h.repo.backdate(claim.id, chrono::Duration::minutes(10));
        h.repo.transaction(claim.id)
    }

    fn token(h: &Harness, state: ClaimState) -> Option<String> {
        Some(StateToken::new(Some(h.pot.id), state).encode())
    }

    #[tokio::test]
    async fn test_retry_success_records_reference() {
        let h = harness();
        let claim = stuck_claim(&h, Some(ClaimState::RetryRequested));

        let report = h.sweep.sweep(10).await.unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(report.retried, 1);

        let stored = h.repo.transaction(claim.id);
        assert_eq!(stored.state_token, token(&h, ClaimState::RetryInitiated));
        assert_eq!(stored.external_transfer_id.as_deref(), Some("trf_mock_1"));
        assert!(stored.failure_reason.is_none());

        let calls = h.provider.calls();
        assert_eq!(calls[0].reason, reason_with_reference(RETRY_TRANSFER_LABEL, claim.id));
        assert_eq!(calls[0].amount, 10_000);
        assert_eq!(calls[0].source, "acct_pot");
    }

    #[tokio::test]
    async fn test_second_sweep_does_not_pay_again() {
        let h = harness();
        stuck_claim(&h, Some(ClaimState::RetryRequested));

        h.sweep.sweep(10).await.unwrap();
        let report = h.sweep.sweep(10).await.unwrap();
        assert_eq!(report.retried, 0);
        assert_eq!(h.provider.transfer_count(), 1);
    }

    #[tokio::test]
    async fn test_ineligible_tokens_skipped() {
        let h = harness();
        for state in [
            None,
            Some(ClaimState::Created),
            Some(ClaimState::TransferInitiated),
            Some(ClaimState::RetryInflight),
            Some(ClaimState::RetryUnknown),
        ] {
            stuck_claim(&h, state);
        }

        let report = h.sweep.sweep(10).await.unwrap();
        assert_eq!(report.processed, 5);
        assert_eq!(report.skipped, 5);
        assert_eq!(h.provider.transfer_count(), 0);
    }

    #[tokio::test]
    async fn test_young_claims_not_candidates() {
        let h = harness();
        let claim = claim_fixture(&h.pot, Some(ClaimState::RetryRequested));
        h.repo.insert_transaction(claim);

        let report = h.sweep.sweep(10).await.unwrap();
        assert_eq!(report, SweepReport::default());
    }

    #[tokio::test]
    async fn test_explicit_rejection_reverts_claim_once() {
        let h = harness();
        let claim = stuck_claim(&h, Some(ClaimState::RetryRequested));
        h.provider.reject_next("INSUFFICIENT_FUNDS");

        let report = h.sweep.sweep(10).await.unwrap();
        assert_eq!(report.retry_failed, 1);
        assert_eq!(report.explicit_rejects, 1);

        let stored = h.repo.transaction(claim.id);
        assert_eq!(stored.status, TransactionStatus::Failed);
        assert_eq!(stored.state_token, token(&h, ClaimState::RetryRejected));
        assert_eq!(h.repo.pot(h.pot.id).claims_made_count, 2);

        // Nothing left to revert on the next run
        h.sweep.sweep(10).await.unwrap();
        assert_eq!(h.repo.pot(h.pot.id).claims_made_count, 2);
        assert_eq!(h.provider.transfer_count(), 1);
    }

    #[tokio::test]
    async fn test_revert_transient_error_requeues() {
        let h = harness();
        let claim = stuck_claim(&h, Some(ClaimState::RetryRequested));
        h.provider.reject_next("INVALID_ACCOUNT");
        h.repo.fail_next(
            RepoOp::RevertClaim,
            ReconcileError::Conflict("could not serialize access".into()),
        );

        let report = h.sweep.sweep(10).await.unwrap();
        assert_eq!(report.explicit_rejects, 1);
        assert_eq!(report.requeued, 1);

        let stored = h.repo.transaction(claim.id);
        assert_eq!(stored.status, TransactionStatus::Pending);
        assert_eq!(stored.state_token, token(&h, ClaimState::RetryRequested));
        assert_eq!(h.repo.pot(h.pot.id).claims_made_count, 3);
    }

    #[tokio::test]
    async fn test_requeue_retries_transient_write_failures() {
        let h = harness();
        let claim = stuck_claim(&h, Some(ClaimState::RetryRequested));
        h.provider.reject_next("INVALID_ACCOUNT");
        h.repo
            .fail_next(RepoOp::RevertClaim, ReconcileError::Timeout("pool".into()));
        // In-flight mark passes, first two requeue writes fail
        h.repo.pass_next(RepoOp::UpdateClaimState);
        h.repo
            .fail_next(RepoOp::UpdateClaimState, ReconcileError::Timeout("pool".into()));
        h.repo
            .fail_next(RepoOp::UpdateClaimState, ReconcileError::Timeout("pool".into()));

        let report = h.sweep.sweep(10).await.unwrap();
        assert_eq!(report.requeued, 1);
        assert_eq!(
            h.repo.transaction(claim.id).state_token,
            token(&h, ClaimState::RetryRequested)
        );
    }

    #[tokio::test]
    async fn test_revert_permanent_error_marks_failed_for_review() {
        let h = harness();
        let claim = stuck_claim(&h, Some(ClaimState::RetryRequested));
        h.provider.reject_next("INVALID_ACCOUNT");
        h.repo.fail_next(
            RepoOp::RevertClaim,
            ReconcileError::Database("foreign key violation".into()),
        );

        let report = h.sweep.sweep(10).await.unwrap();
        assert_eq!(report.manual_review, 1);
        assert_eq!(h.repo.transaction(claim.id).status, TransactionStatus::Failed);
        // Slot not returned
        assert_eq!(h.repo.pot(h.pot.id).claims_made_count, 3);
    }

    #[tokio::test]
    async fn test_ambiguous_failure_never_reverts() {
        let h = harness();
        let claim = stuck_claim(&h, Some(ClaimState::RetryRequested));
        h.provider.timeout_next();

        let report = h.sweep.sweep(10).await.unwrap();
        assert_eq!(report.ambiguous_failures, 1);
        assert_eq!(report.explicit_rejects, 0);

        let stored = h.repo.transaction(claim.id);
        assert_eq!(stored.status, TransactionStatus::Pending);
        assert_eq!(stored.state_token, token(&h, ClaimState::RetryUnknown));
        assert_eq!(h.repo.pot(h.pot.id).claims_made_count, 3);

        // Unknown is not auto-retried
        h.sweep.sweep(10).await.unwrap();
        assert_eq!(h.provider.transfer_count(), 1);
    }

    #[tokio::test]
    async fn test_metadata_write_failure_falls_back_to_reference() {
        let h = harness();
        let claim = stuck_claim(&h, Some(ClaimState::RetryRequested));
        h.repo.pass_next(RepoOp::UpdateClaimState);
        h.repo.fail_next(
            RepoOp::UpdateClaimState,
            ReconcileError::Database("disk full".into()),
        );

        let report = h.sweep.sweep(10).await.unwrap();
        assert_eq!(report.retried, 1);

        let stored = h.repo.transaction(claim.id);
        assert_eq!(stored.external_transfer_id.as_deref(), Some("trf_mock_1"));

        // Anchored by the reference: no longer a candidate
        h.sweep.sweep(10).await.unwrap();
        assert_eq!(h.provider.transfer_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_completed_during_retry_flagged_for_review() {
        let h = harness();
        let claim = stuck_claim(&h, Some(ClaimState::RetryRequested));
        h.provider.set_delay(Duration::from_secs(10));

        // Completion for the original transfer lands while the retry call is out
        let (report, completed) = tokio::join!(h.sweep.sweep(10), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            h.repo.complete_transaction(claim.id, "trf_original", None).await
        });
        assert!(completed.unwrap());

        let report = report.unwrap();
        assert_eq!(report.retried, 1);
        assert_eq!(report.manual_review, 1);

        let stored = h.repo.transaction(claim.id);
        assert_eq!(stored.status, TransactionStatus::Completed);
        assert_eq!(stored.external_transfer_id.as_deref(), Some("trf_original"));
    }

    #[tokio::test]
    async fn test_pot_id_from_storage_when_token_has_none() {
        let h = harness();
        let mut claim = claim_fixture(&h.pot, None);
        claim.state_token = Some(StateToken::new(PotRef::Unknown, ClaimState::RetryRequested).encode());
        h.repo.insert_transaction(claim.clone());
        h.repo.link_claim(claim.id, h.pot.id);
        h.repo.backdate(claim.id, chrono::Duration::minutes(10));

        let report = h.sweep.sweep(10).await.unwrap();
        assert_eq!(report.retried, 1);
        assert_eq!(
            h.repo.transaction(claim.id).state_token,
            token(&h, ClaimState::RetryInitiated)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_bounds_sweep_duration() {
        let h = harness();
        stuck_claim(&h, Some(ClaimState::RetryRequested));
        h.provider.set_delay(Duration::from_secs(600));

        let worker = SweepWorker::new(
            Arc::new(h.sweep),
            SweepConfig {
                max_duration_secs: 5,
                ..SweepConfig::default()
            },
        );
        assert!(worker.run_once().await.is_none());

        // Cut-off claim stays in-flight; no lease expiry
        let claims = h.repo.list_reconciliation_candidates(chrono::Duration::zero(), 10).await.unwrap();
        assert_eq!(claims[0].state_token, token_for(&h.pot, ClaimState::RetryInflight));
    }

    fn token_for(pot: &Pot, state: ClaimState) -> Option<String> {
        Some(StateToken::new(Some(pot.id), state).encode())
    }
}
