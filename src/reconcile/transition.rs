//! State Transition Handler
//!
//! Applies provider outcomes to resolved transactions.
//!
//! # Compensation rules
//!
//! - Generic transfers: the sender was debited, so a failure credits the
//!   sender back (principal + fee) and reverses any forwarded fee.
//! - Pot claims: the payout comes from a shared pot whose slot is already
//!   taken. Crediting the claimant's "sender" would double count, so a failure
//!   only queues the claim for a safe retry or leaves it for an operator.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::error::ReconcileError;
use super::repository::{ClaimStateUpdate, FailureCompensation, Patch, ReconcileRepository};
use super::state::{ClaimState, StateToken};
use super::types::{InboundStatusEvent, Transaction, TransactionKind, TransactionStatus};
use crate::notify::{self, Notification, NotificationSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Completed,
    /// Generic transfer failed and compensated
    Failed,
    /// Claim queued for the reconciliation sweep
    RetryRequested,
    /// Claim failed without compensation; needs manual reconciliation
    HardFailed,
    /// Claim outcome unknown locally; operator must confirm before any retry
    AwaitingOperator,
    /// Completion refused because the transaction was already compensated
    Refused,
    /// Idempotent no-op
    Skipped,
}

pub struct StateTransitionHandler {
    repo: Arc<dyn ReconcileRepository>,
    notifier: Arc<dyn NotificationSink>,
}

impl StateTransitionHandler {
    pub fn new(repo: Arc<dyn ReconcileRepository>, notifier: Arc<dyn NotificationSink>) -> Self {
        Self { repo, notifier }
    }

    pub async fn handle_completed(
        &self,
        tx: &Transaction,
        external_transfer_id: &str,
    ) -> Result<TransitionOutcome, ReconcileError> {
        if tx.status == TransactionStatus::Completed {
            debug!(tx_id = %tx.id, "Already completed");
            return Ok(TransitionOutcome::Skipped);
        }

        if let Some(refusal) = compensated_reason(tx) {
            error!(
                tx_id = %tx.id,
                external_transfer_id = external_transfer_id,
                "CRITICAL: provider reports success for a {} - manual reconciliation required",
                refusal
            );
            return Ok(TransitionOutcome::Refused);
        }

        if !self
            .repo
            .complete_transaction(tx.id, external_transfer_id, tx.payment_request_id)
            .await?
        {
            debug!(tx_id = %tx.id, "Completion lost CAS (already completed)");
            return Ok(TransitionOutcome::Skipped);
        }

        info!(
            tx_id = %tx.id,
            kind = %tx.kind,
            external_transfer_id = external_transfer_id,
            "Transaction completed"
        );
        self.notify_completed(tx).await;
        Ok(TransitionOutcome::Completed)
    }

    /// `failed_transfer_id` is the provider transfer the failure reports on
    pub async fn handle_failed(
        &self,
        tx: &Transaction,
        failed_transfer_id: &str,
        reason: &str,
    ) -> Result<TransitionOutcome, ReconcileError> {
        match tx.kind {
            TransactionKind::PotClaim => {
                self.handle_claim_failed(tx, failed_transfer_id, reason)
                    .await
            }
            TransactionKind::FeeCollection => self.handle_fee_collection_failed(tx, reason).await,
            TransactionKind::PeerTransfer | TransactionKind::Withdrawal => {
                self.handle_transfer_failed(tx, reason).await
            }
        }
    }

    async fn handle_transfer_failed(
        &self,
        tx: &Transaction,
        reason: &str,
    ) -> Result<TransitionOutcome, ReconcileError> {
        if tx.status.is_terminal() {
            debug!(tx_id = %tx.id, status = %tx.status, "Failure for terminal transfer ignored");
            return Ok(TransitionOutcome::Skipped);
        }

        let compensation = FailureCompensation {
            transaction_id: tx.id,
            reason: reason.to_string(),
            sender_id: tx.sender_id,
            credit_amount: tx.debited_total(),
            fee_reversal: (tx.fee_forwarded && tx.fee > 0).then_some(tx.fee),
            release_payment_request: tx.payment_request_id,
        };

        if !self.repo.fail_with_compensation(&compensation).await? {
            debug!(tx_id = %tx.id, "Failure lost CAS (already terminal)");
            return Ok(TransitionOutcome::Skipped);
        }

        info!(
            tx_id = %tx.id,
            refunded = compensation.credit_amount,
            fee_reversed = compensation.fee_reversal.unwrap_or(0),
            reason = reason,
            "Transfer failed, sender refunded"
        );
        notify::emit(
            self.notifier.as_ref(),
            Notification::TransferFailed {
                user_id: tx.sender_id,
                transaction_id: tx.id,
                amount: tx.amount,
                reason: reason.to_string(),
            },
        )
        .await;
        Ok(TransitionOutcome::Failed)
    }

    /// Fee sweeps move platform money only; no user wallet to credit.
    async fn handle_fee_collection_failed(
        &self,
        tx: &Transaction,
        reason: &str,
    ) -> Result<TransitionOutcome, ReconcileError> {
        if tx.status.is_terminal() {
            return Ok(TransitionOutcome::Skipped);
        }
        if self.repo.mark_failed(tx.id, reason).await? {
            warn!(tx_id = %tx.id, reason = reason, "Fee collection failed");
            Ok(TransitionOutcome::Failed)
        } else {
            Ok(TransitionOutcome::Skipped)
        }
    }

    async fn handle_claim_failed(
        &self,
        tx: &Transaction,
        failed_transfer_id: &str,
        reason: &str,
    ) -> Result<TransitionOutcome, ReconcileError> {
        if tx.status.is_terminal() {
            debug!(tx_id = %tx.id, status = %tx.status, "Failure for settled claim ignored");
            return Ok(TransitionOutcome::Skipped);
        }
        if let Some(anchored) = superseding_transfer(tx, failed_transfer_id) {
            warn!(
                tx_id = %tx.id,
                failed_transfer = failed_transfer_id,
                anchored_transfer = anchored,
                "Failure for superseded claim transfer ignored"
            );
            return Ok(TransitionOutcome::Skipped);
        }

        let token = StateToken::decode_opt(tx.state_token.as_deref());
        let token = match token {
            Some(token) if token.state.can_request_retry() => token,
            None
            | Some(StateToken {
                state: ClaimState::Created,
                ..
            }) => {
                warn!(
                    tx_id = %tx.id,
                    token = tx.state_token.as_deref().unwrap_or(""),
                    reason = reason,
                    "Claim failure with no confirmed initiation - awaiting operator confirmation"
                );
                return Ok(TransitionOutcome::AwaitingOperator);
            }
            Some(token) => {
                debug!(tx_id = %tx.id, state = %token.state, "Claim already under reconciliation");
                return Ok(TransitionOutcome::Skipped);
            }
        };

        let pot_id = match token.pot_id() {
            Some(id) => Some(id),
            None => self.repo.find_pot_id_for_claim(tx.id).await?,
        };

        let failed_transfer = tx
            .external_transfer_id
            .as_deref()
            .or(InboundStatusEvent::non_empty(failed_transfer_id))
            .unwrap_or("unknown");
        let update = ClaimStateUpdate {
            transaction_id: tx.id,
            expected_token: tx.state_token.clone(),
            new_token: StateToken::new(pot_id, ClaimState::RetryRequested).encode(),
            external_transfer_id: Patch::Clear,
            failure_reason: Patch::Set(format!("{} (transfer {})", reason, failed_transfer)),
        };

        match self.repo.update_claim_state(&update).await {
            Ok(true) => {
                info!(
                    tx_id = %tx.id,
                    pot_id = ?pot_id,
                    failed_transfer = failed_transfer,
                    "Claim payout failed at provider - retry requested"
                );
                Ok(TransitionOutcome::RetryRequested)
            }
            Ok(false) => {
                info!(tx_id = %tx.id, "Claim changed concurrently - retry request skipped");
                Ok(TransitionOutcome::Skipped)
            }
            Err(e) if e.is_retryable() => {
                warn!(tx_id = %tx.id, error = %e, "Retry request hit transient error");
                Err(e)
            }
            Err(e) => {
                error!(
                    tx_id = %tx.id,
                    error = %e,
                    "Retry request failed - marking claim failed WITHOUT compensation, manual intervention required"
                );
                self.repo.mark_failed(tx.id, reason).await?;
                Ok(TransitionOutcome::HardFailed)
            }
        }
    }

    async fn notify_completed(&self, tx: &Transaction) {
        let sink = self.notifier.as_ref();
        if tx.is_claim() {
            if let Some(claimant) = tx.recipient_id {
                notify::emit(
                    sink,
                    Notification::ClaimPaid {
                        user_id: claimant,
                        transaction_id: tx.id,
                        amount: tx.amount,
                    },
                )
                .await;
            }
            return;
        }

        notify::emit(
            sink,
            Notification::TransferCompleted {
                user_id: tx.sender_id,
                transaction_id: tx.id,
                amount: tx.amount,
                incoming: false,
            },
        )
        .await;
        if let Some(recipient) = tx.recipient_id {
            notify::emit(
                sink,
                Notification::TransferCompleted {
                    user_id: recipient,
                    transaction_id: tx.id,
                    amount: tx.amount,
                    incoming: true,
                },
            )
            .await;
        }
    }
}

/// Why a transaction must not be completed any more, if it was compensated
/// Transfer id the claim is anchored to, when it differs from the failed one.
/// A failure for an older transfer says nothing about the live payout.
pub(crate) fn superseding_transfer<'a>(
    tx: &'a Transaction,
    failed_transfer_id: &str,
) -> Option<&'a str> {
    let anchored = tx.external_transfer_id.as_deref()?;
    (anchored != failed_transfer_id.trim()).then_some(anchored)
}

fn compensated_reason(tx: &Transaction) -> Option<&'static str> {
    if tx.is_claim() {
        StateToken::decode_opt(tx.state_token.as_deref())
            .filter(|token| token.state.is_reverted())
            .map(|_| "reverted claim")
    } else if tx.status == TransactionStatus::Failed && tx.kind != TransactionKind::FeeCollection {
        Some("refunded transfer")
    } else {
        None
    }
}
