//! Pot claim submission and operator retry confirmation
//!
//! A claim reserves a pot slot first, then asks the provider to pay out.
//! The transfer reason carries a `tx-ref:<uuid>` token so the callback can be
//! matched even if the provider's response never reaches us.
//!
//! Only an explicit provider rejection returns the slot here. Any other
//! failure leaves the claim `created`: the provider may have paid, and only
//! an operator can confirm it did not (see [`ClaimService::confirm_retry`]).

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use uuid::Uuid;

use super::error::ReconcileError;
use super::repository::{ClaimRevert, ClaimStateUpdate, NewClaim, Patch, ReconcileRepository};
use super::resolver::reason_with_reference;
use super::state::{ClaimState, StateToken};
use super::types::{MinorAmount, TransactionStatus};
use crate::config::RateLimitConfig;
use crate::provider::TransferProvider;
use crate::ratelimit::RateLimiter;

const CLAIM_RATE_SCOPE: &str = "pot_claim";
const CLAIM_TRANSFER_LABEL: &str = "Pot claim payout";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimRequest {
    pub pot_id: Uuid,
    pub claimant_id: Uuid,
    /// Claimant's provider account or beneficiary
    pub destination_account_ref: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimReceipt {
    pub transaction_id: Uuid,
    pub amount: MinorAmount,
    pub state: ClaimState,
    pub external_transfer_id: Option<String>,
}

pub struct ClaimService {
    repo: Arc<dyn ReconcileRepository>,
    provider: Arc<dyn TransferProvider>,
    limiter: Arc<RateLimiter>,
    limits: RateLimitConfig,
}

impl ClaimService {
    pub fn new(
        repo: Arc<dyn ReconcileRepository>,
        provider: Arc<dyn TransferProvider>,
        limiter: Arc<RateLimiter>,
        limits: RateLimitConfig,
    ) -> Self {
        Self {
            repo,
            provider,
            limiter,
            limits,
        }
    }

    pub async fn submit_claim(&self, request: &ClaimRequest) -> Result<ClaimReceipt, ReconcileError> {
        let consumption = self
            .limiter
            .consume(
                CLAIM_RATE_SCOPE,
                &request.claimant_id.to_string(),
                self.limits.claim_limit,
                Duration::from_millis(self.limits.claim_window_ms),
            )
            .await?;
        if consumption.exceeds(self.limits.claim_limit) {
            info!(
                claimant_id = %request.claimant_id,
                count = consumption.count,
                retry_after_secs = consumption.retry_after_secs,
                "Claim rate limited"
            );
            return Err(ReconcileError::RateLimited {
                retry_after_secs: consumption.retry_after_secs,
            });
        }

        let pot = self
            .repo
            .get_pot(request.pot_id)
            .await?
            .ok_or_else(|| ReconcileError::PotNotFound(request.pot_id.to_string()))?;

        let created = StateToken::new(Some(pot.id), ClaimState::Created).encode();
        let claim = NewClaim {
            transaction_id: Uuid::new_v4(),
            pot_id: pot.id,
            claimant_id: request.claimant_id,
            destination_account_ref: request.destination_account_ref.clone(),
            state_token: created.clone(),
        };
        let Some(tx) = self.repo.reserve_claim(&claim).await? else {
            return Err(ReconcileError::PotUnavailable);
        };

        let reason = reason_with_reference(CLAIM_TRANSFER_LABEL, tx.id);
        let mut receipt = ClaimReceipt {
            transaction_id: tx.id,
            amount: tx.amount,
            state: ClaimState::Created,
            external_transfer_id: None,
        };

        match self
            .provider
            .initiate_transfer(
                &pot.provider_account_ref,
                &request.destination_account_ref,
                &reason,
                tx.amount,
            )
            .await
        {
            Ok(external_id) => {
                let update = ClaimStateUpdate {
                    transaction_id: tx.id,
                    expected_token: Some(created),
                    new_token: StateToken::new(Some(pot.id), ClaimState::TransferInitiated)
                        .encode(),
                    external_transfer_id: Patch::Set(external_id.clone()),
                    failure_reason: Patch::Keep,
                };
                match self.repo.update_claim_state(&update).await {
                    Ok(true) => {}
                    // Callback already settled it, or the write failed: keep the reference
                    Ok(false) | Err(_) => {
                        if let Err(e) = self.repo.record_external_id(tx.id, &external_id).await {
                            error!(
                                tx_id = %tx.id,
                                external_transfer_id = %external_id,
                                error = %e,
                                "Claim transfer initiated but reference not recorded"
                            );
                        }
                    }
                }
                info!(
                    tx_id = %tx.id,
                    pot_id = %pot.id,
                    external_transfer_id = %external_id,
                    "Claim payout initiated"
                );
                receipt.state = ClaimState::TransferInitiated;
                receipt.external_transfer_id = Some(external_id);
                Ok(receipt)
            }
            Err(e) if e.is_explicit_rejection() => {
                let revert = ClaimRevert {
                    transaction_id: tx.id,
                    pot_id: pot.id,
                    expected_token: Some(created),
                    new_token: StateToken::new(Some(pot.id), ClaimState::RetryRejected).encode(),
                    reason: format!("payout rejected by provider: {}", e),
                };
                if let Err(revert_err) = self.repo.revert_claim(&revert).await {
                    error!(
                        tx_id = %tx.id,
                        error = %revert_err,
                        "Rejected claim not reverted - slot held, manual reconciliation required"
                    );
                }
                warn!(tx_id = %tx.id, code = e.code(), "Claim payout rejected by provider");
                Err(ReconcileError::Provider(e))
            }
            Err(e) => {
                warn!(
                    tx_id = %tx.id,
                    error = %e,
                    "Claim payout outcome unknown - awaiting callback or operator confirmation"
                );
                Ok(receipt)
            }
        }
    }

    /// Operator action: the provider confirmed it did not pay this claim, so
    /// the sweep may retry it.
    ///
    /// Returns `Ok(false)` if the claim is already queued or changed
    /// concurrently.
    pub async fn confirm_retry(
        &self,
        transaction_id: Uuid,
        operator: &str,
    ) -> Result<bool, ReconcileError> {
        let tx = self
            .repo
            .get_transaction(transaction_id)
            .await?
            .ok_or_else(|| ReconcileError::NotFound(transaction_id.to_string()))?;

        if !tx.is_claim() {
            return Err(ReconcileError::InvalidStateTransition(format!(
                "{} is not a pot claim",
                tx.id
            )));
        }
        if tx.status != TransactionStatus::Pending || tx.external_transfer_id.is_some() {
            return Err(ReconcileError::InvalidStateTransition(format!(
                "claim {} is {} with reference {:?}",
                tx.id, tx.status, tx.external_transfer_id
            )));
        }

        let token = StateToken::decode_opt(tx.state_token.as_deref());
        match token.map(|t| t.state) {
            Some(ClaimState::RetryRequested) => return Ok(false),
            Some(ClaimState::RetryRejected) => {
                return Err(ReconcileError::InvalidStateTransition(format!(
                    "claim {} was already reverted",
                    tx.id
                )));
            }
            _ => {}
        }

        let pot_id = match token.and_then(|t| t.pot_id()) {
            Some(id) => Some(id),
            None => self.repo.find_pot_id_for_claim(tx.id).await?,
        };
        let confirmed = self
            .repo
            .update_claim_state(&ClaimStateUpdate {
                transaction_id: tx.id,
                expected_token: tx.state_token.clone(),
                new_token: StateToken::new(pot_id, ClaimState::RetryRequested).encode(),
                external_transfer_id: Patch::Keep,
                failure_reason: Patch::Set(format!("retry confirmed by {}", operator)),
            })
            .await?;

        if confirmed {
            info!(
                tx_id = %tx.id,
                operator = operator,
                previous = tx.state_token.as_deref().unwrap_or(""),
                "Claim confirmed for retry"
            );
        }
        Ok(confirmed)
    }
}
