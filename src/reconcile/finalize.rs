//! Pot finalization (close and refund)
//!
//! The finalization lock (`pots.finalizing`) serialises close/refund with
//! itself and stops new claims while held. The refund transfer is the source
//! of truth once the provider accepts it:
//!
//! - marker write fails before the call → release, nothing moved
//! - provider explicitly rejects → release, nothing moved
//! - provider outcome unknown → lock stays held with `refund_in_flight`
//! - refund paid, recording fails → lock stays held with
//!   `refund_persistence_failed`
//! - refund paid for less than owed → `retry_pending`, a later close resumes
//!   from the cumulative refunded amount

use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::error::ReconcileError;
use super::repository::{Patch, ReconcileRepository};
use super::types::{FinalizationMarker, MinorAmount, PotStatus};
use crate::provider::TransferProvider;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseOutcome {
    /// Nothing left to refund; pot completed
    Closed,
    Refunded {
        amount: MinorAmount,
        /// Still owed after this refund (provider balance was short)
        remaining: MinorAmount,
        external_transfer_id: String,
    },
    /// Refund paid but not recorded; pot locked for manual follow-up
    RefundUnrecorded {
        amount: MinorAmount,
        external_transfer_id: String,
    },
}

pub struct PotFinalizer {
    repo: Arc<dyn ReconcileRepository>,
    provider: Arc<dyn TransferProvider>,
}

impl PotFinalizer {
    pub fn new(repo: Arc<dyn ReconcileRepository>, provider: Arc<dyn TransferProvider>) -> Self {
        Self { repo, provider }
    }

    /// Close a pot and refund the outstanding balance to its creator
    pub async fn close_pot(
        &self,
        pot_id: Uuid,
        requester_id: Uuid,
    ) -> Result<CloseOutcome, ReconcileError> {
        let lock = self.repo.acquire_finalization_lock(pot_id).await?;
        if !lock.acquired {
            return Err(ReconcileError::FinalizationInProgress);
        }
        let restore = lock.was_active;

        // Re-validate under the lock
        let pot = match self.repo.get_pot(pot_id).await {
            Ok(Some(pot)) => pot,
            Ok(None) => {
                self.release(pot_id, restore, Patch::Keep).await;
                return Err(ReconcileError::PotNotFound(pot_id.to_string()));
            }
            Err(e) => {
                self.release(pot_id, restore, Patch::Keep).await;
                return Err(e);
            }
        };
        // Marker a previous short refund left; survives any release below
        let prior_marker = Patch::from(pot.finalization_marker);
        if pot.creator_id != requester_id {
            self.release(pot_id, restore, prior_marker).await;
            return Err(ReconcileError::Forbidden);
        }
        if pot.status == PotStatus::Active && !pot.is_exhausted() && !pot.is_expired(Utc::now()) {
            self.release(pot_id, restore, prior_marker).await;
            return Err(ReconcileError::PotStillOpen);
        }

        let outstanding = pot.outstanding_balance();
        if outstanding == 0 {
            if let Err(e) = self.repo.record_refund(pot_id, 0, None).await {
                warn!(pot_id = %pot_id, error = %e, "Pot close not recorded, lock released");
                self.release(pot_id, restore, prior_marker).await;
                return Err(e);
            }
            info!(pot_id = %pot_id, "Pot closed, nothing to refund");
            return Ok(CloseOutcome::Closed);
        }

        let available = match self.provider.get_balance(&pot.provider_account_ref).await {
            Ok(balance) => balance.max(0),
            Err(e) => {
                self.release(pot_id, restore, prior_marker).await;
                return Err(e.into());
            }
        };
        let amount = outstanding.min(available);
        if amount == 0 {
            warn!(
                pot_id = %pot_id,
                outstanding = outstanding,
                "Pot account has no available balance, refund deferred"
            );
            self.release(pot_id, restore, prior_marker).await;
            return Err(ReconcileError::Internal(format!(
                "pot {} owes {} but its account is empty",
                pot_id, outstanding
            )));
        }

        if let Err(e) = self
            .repo
            .set_finalization_marker(pot_id, FinalizationMarker::RefundInFlight)
            .await
        {
            warn!(pot_id = %pot_id, error = %e, "Refund marker not written, no transfer attempted");
            self.release(pot_id, restore, prior_marker).await;
            return Err(e);
        }

        let reason = format!("Pot refund {}", pot_id);
        let external_id = match self
            .provider
            .initiate_transfer(
                &pot.provider_account_ref,
                &pot.creator_account_ref,
                &reason,
                amount,
            )
            .await
        {
            Ok(id) => id,
            Err(e) if e.is_explicit_rejection() => {
                warn!(pot_id = %pot_id, code = e.code(), "Refund rejected by provider");
                self.release(pot_id, restore, prior_marker).await;
                return Err(e.into());
            }
            Err(e) => {
                error!(
                    pot_id = %pot_id,
                    amount = amount,
                    error = %e,
                    "Refund outcome unknown - pot locked with refund_in_flight for manual review"
                );
                return Err(e.into());
            }
        };

        let remaining = outstanding - amount;
        let marker = (remaining > 0).then_some(FinalizationMarker::RetryPending);
        if let Err(e) = self.repo.record_refund(pot_id, amount, marker).await {
            error!(
                pot_id = %pot_id,
                amount = amount,
                external_transfer_id = %external_id,
                error = %e,
                "CRITICAL: refund paid but not recorded - pot locked for manual follow-up"
            );
            if let Err(e) = self.repo.mark_refund_persistence_failed(pot_id).await {
                error!(pot_id = %pot_id, error = %e, "Refund persistence marker not written");
            }
            return Ok(CloseOutcome::RefundUnrecorded {
                amount,
                external_transfer_id: external_id,
            });
        }

        info!(
            pot_id = %pot_id,
            amount = amount,
            remaining = remaining,
            external_transfer_id = %external_id,
            "Pot refunded"
        );
        Ok(CloseOutcome::Refunded {
            amount,
            remaining,
            external_transfer_id: external_id,
        })
    }

    async fn release(
        &self,
        pot_id: Uuid,
        restore_active: bool,
        marker: Patch<FinalizationMarker>,
    ) {
        if let Err(e) = self
            .repo
            .release_finalization_lock(pot_id, restore_active, marker)
            .await
        {
            error!(pot_id = %pot_id, error = %e, "Finalization lock not released");
        }
    }
}
