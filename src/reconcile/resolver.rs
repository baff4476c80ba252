//! Transaction Resolver
//!
//! Matches an inbound provider event to a local transaction. Strategies run
//! from strictest to loosest; the first match wins:
//!
//! 1. exact external transfer id
//! 2. `tx-ref:<uuid>` token embedded in the reason at request time
//! 3. oldest pending claim with the same accounts and amount (only when the
//!    event carries no token)
//!
//! Strategy 1 alone is not enough: the provider may have executed a claim
//! whose transfer id never made it into the local record.

use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use super::error::ReconcileError;
use super::repository::ReconcileRepository;
use super::types::{InboundStatusEvent, Transaction};

/// Prefix of the resolver token placed in transfer reasons
pub const REFERENCE_TOKEN_PREFIX: &str = "tx-ref:";

/// Reason text for a provider transfer, carrying the resolver token
pub fn reason_with_reference(label: &str, transaction_id: Uuid) -> String {
    format!("{} {}{}", label, REFERENCE_TOKEN_PREFIX, transaction_id)
}

/// Extract the transaction id from a `tx-ref:<uuid>` token, if present.
///
/// Returns `Some(None)` when a token prefix is present but malformed, so the
/// caller can tell "no token" from "bad token".
pub fn extract_reference_token(reason: &str) -> Option<Option<Uuid>> {
    let start = reason.find(REFERENCE_TOKEN_PREFIX)?;
    let candidate: String = reason[start + REFERENCE_TOKEN_PREFIX.len()..]
        .chars()
        .take_while(|c| c.is_ascii_hexdigit() || *c == '-')
        .collect();
    Some(Uuid::parse_str(&candidate).ok())
}

/// Which strategy matched, for logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedBy {
    ExternalId,
    ReferenceToken,
    Participants,
}

pub struct TransactionResolver {
    repo: Arc<dyn ReconcileRepository>,
}

impl TransactionResolver {
    pub fn new(repo: Arc<dyn ReconcileRepository>) -> Self {
        Self { repo }
    }

    pub async fn resolve(&self, event: &InboundStatusEvent) -> Result<Transaction, ReconcileError> {
        self.resolve_with_strategy(event).await.map(|(tx, _)| tx)
    }

    pub async fn resolve_with_strategy(
        &self,
        event: &InboundStatusEvent,
    ) -> Result<(Transaction, ResolvedBy), ReconcileError> {
        if let Some(external_id) = InboundStatusEvent::non_empty(&event.transfer_id)
            && let Some(tx) = self.repo.find_by_external_id(external_id).await?
        {
            return Ok((tx, ResolvedBy::ExternalId));
        }

        match extract_reference_token(&event.reason) {
            Some(Some(tx_id)) => {
                if let Some(tx) = self.by_reference(tx_id, event).await? {
                    return Ok((tx, ResolvedBy::ReferenceToken));
                }
            }
            Some(None) => {
                debug!(transfer_id = %event.transfer_id, "Malformed reference token in reason");
            }
            None => {
                if let Some(tx) = self.by_participants(event).await? {
                    return Ok((tx, ResolvedBy::Participants));
                }
            }
        }

        Err(ReconcileError::NotFound(event.transfer_id.clone()))
    }

    /// Any status is accepted: a replayed callback may point at a claim that
    /// was already resolved.
    async fn by_reference(
        &self,
        tx_id: Uuid,
        event: &InboundStatusEvent,
    ) -> Result<Option<Transaction>, ReconcileError> {
        let Some(tx) = self.repo.get_transaction(tx_id).await? else {
            return Ok(None);
        };

        if !tx.is_claim() || tx.external_transfer_id.is_some() {
            debug!(tx_id = %tx_id, "Reference token points at a non-claim or an anchored claim");
            return Ok(None);
        }
        if let Some(amount) = event.amount
            && amount != tx.amount
        {
            debug!(
                tx_id = %tx_id,
                event_amount = amount,
                tx_amount = tx.amount,
                "Reference token amount mismatch"
            );
            return Ok(None);
        }
        Ok(Some(tx))
    }

    async fn by_participants(
        &self,
        event: &InboundStatusEvent,
    ) -> Result<Option<Transaction>, ReconcileError> {
        let (Some(source), Some(destination), Some(amount)) = (
            InboundStatusEvent::non_empty(&event.account_id),
            InboundStatusEvent::non_empty(&event.counterparty_id),
            event.amount,
        ) else {
            return Ok(None);
        };

        self.repo
            .find_pending_claim_by_participants(source, destination, amount)
            .await
    }
}
