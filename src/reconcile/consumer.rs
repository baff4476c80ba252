//! Event Consumer
//!
//! Entry point for provider status callbacks. `handle_message` returns the
//! ack decision for the transport:
//!
//! | Situation                                   | Ack  |
//! |---------------------------------------------|------|
//! | malformed JSON / no transfer id             | yes  |
//! | processed (incl. idempotent no-op)          | yes  |
//! | transaction not found, attempts remaining   | no   |
//! | transaction not found, attempts exhausted   | yes  |
//! | fee-collection echo with no transaction     | yes  |
//! | retryable infrastructure error              | no   |
//! | non-retryable processing error              | yes  |

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, error, info, warn};

use super::error::ReconcileError;
use super::repository::{ReconcileRepository, ReferenceMetadata};
use super::resolver::TransactionResolver;
use super::transition::{StateTransitionHandler, TransitionOutcome, superseding_transfer};
use super::types::{InboundStatusEvent, NormalizedStatus, TransactionStatus, TransferType};
use crate::config::ConsumerConfig;
use crate::notify::NotificationSink;

const DEFAULT_FAILURE_REASON: &str = "provider reported failure";

pub struct EventConsumer {
    repo: Arc<dyn ReconcileRepository>,
    resolver: TransactionResolver,
    transitions: StateTransitionHandler,
    config: ConsumerConfig,
    /// Missing-transaction attempts per external transfer id (process-local)
    missing_attempts: DashMap<String, u32>,
}

impl EventConsumer {
    pub fn new(
        repo: Arc<dyn ReconcileRepository>,
        notifier: Arc<dyn NotificationSink>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            resolver: TransactionResolver::new(repo.clone()),
            transitions: StateTransitionHandler::new(repo.clone(), notifier),
            repo,
            config,
            missing_attempts: DashMap::new(),
        }
    }

    /// Handle one raw queue message. Returns `true` to acknowledge.
    pub async fn handle_message(&self, raw: &[u8]) -> bool {
        let event: InboundStatusEvent = match serde_json::from_slice(raw) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Dropping malformed status callback");
                return true;
            }
        };

        let Some(external_id) = InboundStatusEvent::non_empty(&event.transfer_id) else {
            warn!(event_id = %event.event_id, "Dropping status callback without transfer id");
            return true;
        };

        match self.process(&event).await {
            Ok(_) => {
                self.missing_attempts.remove(external_id);
                true
            }
            Err(e) if e.is_not_found() => self.on_missing(external_id, &event).await,
            Err(e) if e.is_retryable() => {
                warn!(
                    transfer_id = external_id,
                    error = %e,
                    "Transient error processing callback, requeueing"
                );
                false
            }
            Err(e) => {
                error!(
                    transfer_id = external_id,
                    code = e.code(),
                    error = %e,
                    "Callback processing failed permanently, dropping"
                );
                true
            }
        }
    }

    /// Resolve, record and apply one event.
    ///
    /// Returns `None` when nothing beyond reference metadata was applied.
    pub async fn process(
        &self,
        event: &InboundStatusEvent,
    ) -> Result<Option<TransitionOutcome>, ReconcileError> {
        let status = NormalizedStatus::from_event(event);
        let external_id = event.transfer_id.trim();
        let (tx, resolved_by) = self.resolver.resolve_with_strategy(event).await?;
        debug!(
            tx_id = %tx.id,
            transfer_id = external_id,
            resolved_by = ?resolved_by,
            status = ?status,
            "Callback resolved"
        );

        // Late or duplicated failure for something already settled
        if tx.status == TransactionStatus::Completed && status == NormalizedStatus::Failed {
            warn!(
                tx_id = %tx.id,
                kind = %tx.kind,
                transfer_id = external_id,
                "Failure callback for completed transaction ignored"
            );
            return Ok(None);
        }

        // Failure of a transfer the claim has since moved past
        if tx.is_claim()
            && status == NormalizedStatus::Failed
            && let Some(anchored) = superseding_transfer(&tx, external_id)
        {
            warn!(
                tx_id = %tx.id,
                transfer_id = external_id,
                anchored_transfer = anchored,
                "Failure callback for superseded claim transfer ignored"
            );
            return Ok(None);
        }

        let reason = InboundStatusEvent::non_empty(&event.reason).unwrap_or(DEFAULT_FAILURE_REASON);
        let metadata = ReferenceMetadata {
            provider_status: InboundStatusEvent::non_empty(&event.status).map(str::to_string),
            // A failed claim transfer id must not anchor the claim; the retry gets a new one
            external_transfer_id: (!tx.is_claim() || status == NormalizedStatus::Completed)
                .then(|| external_id.to_string()),
            transfer_type: TransferType::normalize(&event.transfer_type),
            failure_reason: (status == NormalizedStatus::Failed).then(|| reason.to_string()),
            session_id: InboundStatusEvent::non_empty(&event.session_id).map(str::to_string),
        };
        self.repo.update_reference_metadata(tx.id, &metadata).await?;

        let outcome = match status {
            NormalizedStatus::Completed => {
                self.transitions.handle_completed(&tx, external_id).await?
            }
            NormalizedStatus::Failed => self.transitions.handle_failed(&tx, external_id, reason).await?,
            NormalizedStatus::Ignore => {
                debug!(tx_id = %tx.id, raw_status = %event.status, "Non-terminal status recorded");
                return Ok(None);
            }
        };
        Ok(Some(outcome))
    }

    async fn on_missing(&self, external_id: &str, event: &InboundStatusEvent) -> bool {
        if is_fee_echo(event) {
            debug!(transfer_id = external_id, "Fee collection echo without transaction, acking");
            self.missing_attempts.remove(external_id);
            return true;
        }

        let attempt = {
            let mut entry = self
                .missing_attempts
                .entry(external_id.to_string())
                .or_insert(0);
            *entry += 1;
            *entry
        };

        if attempt > self.config.max_missing_attempts {
            error!(
                transfer_id = external_id,
                attempts = attempt - 1,
                status = %event.status,
                "No transaction matched callback after max attempts, dropping"
            );
            self.missing_attempts.remove(external_id);
            return true;
        }

        let delay = self.config.missing_backoff(attempt);
        info!(
            transfer_id = external_id,
            attempt = attempt,
            delay_ms = delay.as_millis() as u64,
            "No transaction matched callback yet, requeueing"
        );
        tokio::time::sleep(delay).await;
        false
    }

    #[cfg(test)]
    pub(crate) fn missing_attempts(&self, external_id: &str) -> u32 {
        self.missing_attempts
            .get(external_id)
            .map(|entry| *entry)
            .unwrap_or(0)
    }
}

/// Best-effort detection of pot fee-collection echoes
fn is_fee_echo(event: &InboundStatusEvent) -> bool {
    event.reason.to_ascii_lowercase().contains("fee")
        || event.event_type.to_ascii_lowercase().contains("fee")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::recording::RecordingNotifier;
    use crate::reconcile::mock::{
        MemoryRepository, RepoOp, claim_fixture, generic_fixture, pot_fixture,
    };
    use crate::reconcile::state::{ClaimState, StateToken};
    use crate::reconcile::types::{TransactionKind, TransferType};

    fn consumer_with(max_missing_attempts: u32) -> (Arc<MemoryRepository>, EventConsumer) {
        let repo = Arc::new(MemoryRepository::new());
        let config = ConsumerConfig {
            max_missing_attempts,
            ..ConsumerConfig::default()
        };
        let consumer = EventConsumer::new(repo.clone(), Arc::new(RecordingNotifier::new()), config);
        (repo, consumer)
    }

    fn payload(value: serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&value).unwrap()
    }

    #[tokio::test]
    async fn test_malformed_and_missing_id_are_acked() {
        let (repo, consumer) = consumer_with(20);
        assert!(consumer.handle_message(b"{not json").await);
        assert!(
            consumer
                .handle_message(&payload(serde_json::json!({"status": "completed"})))
                .await
        );
        assert_eq!(repo.metadata_writes(), 0);
    }

    #[tokio::test]
    async fn test_completed_generic_transfer() {
        let (repo, consumer) = consumer_with(20);
        let mut tx = generic_fixture(TransactionKind::Withdrawal);
        tx.external_transfer_id = Some("trf_1".to_string());
        repo.insert_transaction(tx.clone());

        let ack = consumer
            .handle_message(&payload(serde_json::json!({
                "transfer_id": "trf_1",
                "status": "SUCCESSFUL",
                "transfer_type": "NIP",
                "session_id": "0000123"
            })))
            .await;
        assert!(ack);

        let stored = repo.transaction(tx.id);
        assert_eq!(stored.status, TransactionStatus::Completed);
        assert_eq!(stored.transfer_type, Some(TransferType::External));
        assert_eq!(stored.session_id.as_deref(), Some("0000123"));
        assert_eq!(stored.provider_status.as_deref(), Some("SUCCESSFUL"));
    }

    #[tokio::test]
    async fn test_duplicate_callbacks_refund_once() {
        let (repo, consumer) = consumer_with(20);
        let mut tx = generic_fixture(TransactionKind::PeerTransfer);
        tx.external_transfer_id = Some("trf_2".to_string());
        repo.insert_transaction(tx.clone());

        let msg = payload(serde_json::json!({
            "transfer_id": "trf_2",
            "status": "failed",
            "reason": "account closed"
        }));
        assert!(consumer.handle_message(&msg).await);
        assert!(consumer.handle_message(&msg).await);

        assert_eq!(repo.wallet_credits(), vec![(tx.sender_id, 50_100)]);
        assert_eq!(
            repo.transaction(tx.id).failure_reason.as_deref(),
            Some("account closed")
        );
    }

    #[tokio::test]
    async fn test_unknown_status_only_records_metadata() {
        let (repo, consumer) = consumer_with(20);
        let mut tx = generic_fixture(TransactionKind::PeerTransfer);
        tx.external_transfer_id = Some("trf_3".to_string());
        repo.insert_transaction(tx.clone());

        let event = InboundStatusEvent {
            transfer_id: "trf_3".to_string(),
            status: "awaiting_settlement".to_string(),
            ..Default::default()
        };
        assert_eq!(consumer.process(&event).await.unwrap(), None);

        let stored = repo.transaction(tx.id);
        assert_eq!(stored.status, TransactionStatus::Pending);
        assert_eq!(stored.provider_status.as_deref(), Some("awaiting_settlement"));
    }

    #[tokio::test]
    async fn test_failure_for_completed_claim_writes_nothing() {
        let (repo, consumer) = consumer_with(20);
        let pot = pot_fixture();
        let mut claim = claim_fixture(&pot, Some(ClaimState::TransferInitiated));
        claim.status = TransactionStatus::Completed;
        claim.external_transfer_id = Some("trf_4".to_string());
        repo.insert_transaction(claim.clone());

        let ack = consumer
            .handle_message(&payload(serde_json::json!({
                "transfer_id": "trf_4",
                "status": "failed"
            })))
            .await;
        assert!(ack);
        assert_eq!(repo.metadata_writes(), 0);
        assert_eq!(repo.transaction(claim.id), claim);
    }

    #[tokio::test]
    async fn test_claim_failure_does_not_anchor_external_id_or_touch_token() {
        let (repo, consumer) = consumer_with(20);
        let pot = pot_fixture();
        let claim = claim_fixture(&pot, Some(ClaimState::Created));
        repo.insert_transaction(claim.clone());

        let event = InboundStatusEvent {
            transfer_id: "trf_orphan".to_string(),
            status: "failed".to_string(),
            reason: "state:reconcile_retry_requested".to_string(),
            account_id: "acct_pot".to_string(),
            counterparty_id: claim.destination_account_ref.clone().unwrap(),
            amount: Some(claim.amount),
            ..Default::default()
        };
        let outcome = consumer.process(&event).await.unwrap();
        assert_eq!(outcome, Some(TransitionOutcome::AwaitingOperator));

        let stored = repo.transaction(claim.id);
        assert!(stored.external_transfer_id.is_none());
        assert_eq!(
            stored.state_token,
            Some(StateToken::new(Some(pot.id), ClaimState::Created).encode())
        );
    }

    #[tokio::test]
    async fn test_claim_completion_by_participants_records_external_id() {
        let (repo, consumer) = consumer_with(20);
        let pot = pot_fixture();
        let claim = claim_fixture(&pot, Some(ClaimState::Created));
        repo.insert_transaction(claim.clone());

        let event = InboundStatusEvent {
            transfer_id: "trf_lost_response".to_string(),
            status: "completed".to_string(),
            account_id: "acct_pot".to_string(),
            counterparty_id: claim.destination_account_ref.clone().unwrap(),
            amount: Some(claim.amount),
            ..Default::default()
        };
        assert_eq!(
            consumer.process(&event).await.unwrap(),
            Some(TransitionOutcome::Completed)
        );
        let stored = repo.transaction(claim.id);
        assert_eq!(stored.status, TransactionStatus::Completed);
        assert_eq!(
            stored.external_transfer_id.as_deref(),
            Some("trf_lost_response")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_transaction_bounded_retry() {
        let (_repo, consumer) = consumer_with(3);
        let msg = payload(serde_json::json!({
            "transfer_id": "trf_ghost",
            "status": "completed"
        }));

        for attempt in 1..=3 {
            assert!(!consumer.handle_message(&msg).await);
            assert_eq!(consumer.missing_attempts("trf_ghost"), attempt);
        }
        assert!(consumer.handle_message(&msg).await);
        assert_eq!(consumer.missing_attempts("trf_ghost"), 0);
    }

    #[tokio::test]
    async fn test_fee_echo_acked_immediately() {
        let (_repo, consumer) = consumer_with(20);
        let msg = payload(serde_json::json!({
            "transfer_id": "trf_fee",
            "status": "completed",
            "reason": "Pot Fee Collection"
        }));
        assert!(consumer.handle_message(&msg).await);
        assert_eq!(consumer.missing_attempts("trf_fee"), 0);
    }

    #[tokio::test]
    async fn test_transient_error_nacks() {
        let (repo, consumer) = consumer_with(20);
        let mut tx = generic_fixture(TransactionKind::PeerTransfer);
        tx.external_transfer_id = Some("trf_5".to_string());
        repo.insert_transaction(tx.clone());
        repo.fail_next(
            RepoOp::UpdateMetadata,
            ReconcileError::Conflict("could not serialize access".into()),
        );

        let msg = payload(serde_json::json!({"transfer_id": "trf_5", "status": "completed"}));
        assert!(!consumer.handle_message(&msg).await);
        assert_eq!(repo.transaction(tx.id).status, TransactionStatus::Pending);

        // Redelivery succeeds
        assert!(consumer.handle_message(&msg).await);
        assert_eq!(repo.transaction(tx.id).status, TransactionStatus::Completed);
    }

    #[tokio::test]
    async fn test_permanent_error_acks() {
        let (repo, consumer) = consumer_with(20);
        let mut tx = generic_fixture(TransactionKind::PeerTransfer);
        tx.external_transfer_id = Some("trf_6".to_string());
        repo.insert_transaction(tx.clone());
        repo.fail_next(
            RepoOp::CompleteTransaction,
            ReconcileError::Database("value too long".into()),
        );

        let msg = payload(serde_json::json!({"transfer_id": "trf_6", "status": "completed"}));
        assert!(consumer.handle_message(&msg).await);
    }
}
