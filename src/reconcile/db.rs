//! Reconciliation Database Layer
//!
//! PostgreSQL implementation of [`ReconcileRepository`]. Every racing write
//! is a single conditional UPDATE (CAS) and reports `rows_affected() > 0`;
//! multi-row effects (compensation, revert, slot reservation) run in one
//! database transaction.

use async_trait::async_trait;
use chrono::Duration;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::error::ReconcileError;
use super::repository::{
    ClaimRevert, ClaimStateUpdate, FailureCompensation, LockAcquisition, NewClaim, Patch,
    ReconcileRepository, ReferenceMetadata,
};
use super::types::{
    FinalizationMarker, MinorAmount, Pot, PotStatus, ReconciliationCandidate, Transaction,
    TransactionKind, TransactionStatus, TransferType,
};

const TRANSACTION_COLUMNS: &str = r#"
    id, sender_id, recipient_id, source_account_ref, destination_account_ref,
    amount, fee, kind, status, external_transfer_id, transfer_type, failure_reason,
    state_token, provider_status, session_id, payment_request_id, fee_forwarded,
    created_at, updated_at
"#;

const POT_COLUMNS: &str = r#"
    id, creator_id, provider_account_ref, creator_account_ref, amount_per_claim,
    total_slots, claims_made_count, total_amount, refunded_amount, status,
    expires_at, finalizing, finalization_marker
"#;

pub struct PgReconcileRepository {
    pool: PgPool,
}

impl PgReconcileRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_transaction(
        &self,
        filter: &str,
        bind: impl FnOnce(
            sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
        ) -> sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<Option<Transaction>, ReconcileError> {
        let sql = format!("SELECT {} FROM transactions_tb WHERE {}", TRANSACTION_COLUMNS, filter);
        let row = bind(sqlx::query(&sql)).fetch_optional(&self.pool).await?;
        row.as_ref().map(row_to_transaction).transpose()
    }
}

/// Patch as (mode, value) for `CASE` binds
fn patch_parts(patch: &Patch<String>) -> (&'static str, Option<&str>) {
    match patch {
        Patch::Keep => ("keep", None),
        Patch::Clear => ("clear", None),
        Patch::Set(value) => ("set", Some(value.as_str())),
    }
}

fn corrupt(column: &str, value: &str) -> ReconcileError {
    ReconcileError::Internal(format!("Invalid {} in database: {}", column, value))
}

fn row_to_transaction(row: &PgRow) -> Result<Transaction, ReconcileError> {
    let kind: String = row.get("kind");
    let status: String = row.get("status");
    let transfer_type: Option<String> = row.get("transfer_type");

    Ok(Transaction {
        id: row.get("id"),
        sender_id: row.get("sender_id"),
        recipient_id: row.get("recipient_id"),
        source_account_ref: row.get("source_account_ref"),
        destination_account_ref: row.get("destination_account_ref"),
        amount: row.get("amount"),
        fee: row.get("fee"),
        kind: TransactionKind::parse(&kind).ok_or_else(|| corrupt("kind", &kind))?,
        status: TransactionStatus::parse(&status).ok_or_else(|| corrupt("status", &status))?,
        external_transfer_id: row.get("external_transfer_id"),
        transfer_type: match transfer_type {
            Some(raw) => Some(TransferType::parse(&raw).ok_or_else(|| corrupt("transfer_type", &raw))?),
            None => None,
        },
        failure_reason: row.get("failure_reason"),
        state_token: row.get("state_token"),
        provider_status: row.get("provider_status"),
        session_id: row.get("session_id"),
        payment_request_id: row.get("payment_request_id"),
        fee_forwarded: row.get("fee_forwarded"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn row_to_pot(row: &PgRow) -> Result<Pot, ReconcileError> {
    let status: String = row.get("status");
    let marker: Option<String> = row.get("finalization_marker");

    Ok(Pot {
        id: row.get("id"),
        creator_id: row.get("creator_id"),
        provider_account_ref: row.get("provider_account_ref"),
        creator_account_ref: row.get("creator_account_ref"),
        amount_per_claim: row.get("amount_per_claim"),
        total_slots: row.get("total_slots"),
        claims_made_count: row.get("claims_made_count"),
        total_amount: row.get("total_amount"),
        refunded_amount: row.get("refunded_amount"),
        status: PotStatus::parse(&status).ok_or_else(|| corrupt("pot status", &status))?,
        expires_at: row.get("expires_at"),
        finalizing: row.get("finalizing"),
        finalization_marker: match marker {
            Some(raw) => Some(
                FinalizationMarker::parse(&raw).ok_or_else(|| corrupt("finalization_marker", &raw))?,
            ),
            None => None,
        },
    })
}

#[async_trait]
impl ReconcileRepository for PgReconcileRepository {
    async fn get_transaction(&self, id: Uuid) -> Result<Option<Transaction>, ReconcileError> {
        self.fetch_transaction("id = $1", |q| q.bind(id)).await
    }

    async fn find_by_external_id(
        &self,
        external_transfer_id: &str,
    ) -> Result<Option<Transaction>, ReconcileError> {
        let external_transfer_id = external_transfer_id.to_string();
        self.fetch_transaction("external_transfer_id = $1", |q| q.bind(external_transfer_id))
            .await
    }

    async fn find_pending_claim_by_participants(
        &self,
        source_account_ref: &str,
        destination_account_ref: &str,
        amount: MinorAmount,
    ) -> Result<Option<Transaction>, ReconcileError> {
        let (source, destination) = (
            source_account_ref.to_string(),
            destination_account_ref.to_string(),
        );
        self.fetch_transaction(
            r#"kind = 'pot_claim' AND status = 'pending' AND external_transfer_id IS NULL
               AND source_account_ref = $1 AND destination_account_ref = $2 AND amount = $3
               ORDER BY created_at ASC LIMIT 1"#,
            |q| q.bind(source).bind(destination).bind(amount),
        )
        .await
    }

    async fn find_pot_id_for_claim(
        &self,
        transaction_id: Uuid,
    ) -> Result<Option<Uuid>, ReconcileError> {
        let pot_id = sqlx::query_scalar::<_, Option<Uuid>>(
            "SELECT pot_id FROM transactions_tb WHERE id = $1",
        )
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(pot_id.flatten())
    }

    async fn update_reference_metadata(
        &self,
        transaction_id: Uuid,
        metadata: &ReferenceMetadata,
    ) -> Result<(), ReconcileError> {
        let result = sqlx::query(
            r#"
            UPDATE transactions_tb
            SET provider_status = COALESCE($2, provider_status),
                external_transfer_id = COALESCE(external_transfer_id, $3),
                transfer_type = COALESCE($4, transfer_type),
                failure_reason = COALESCE($5, failure_reason),
                session_id = COALESCE($6, session_id),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(transaction_id)
        .bind(&metadata.provider_status)
        .bind(&metadata.external_transfer_id)
        .bind(metadata.transfer_type.map(|t| t.as_str()))
        .bind(&metadata.failure_reason)
        .bind(&metadata.session_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ReconcileError::NotFound(transaction_id.to_string()));
        }
        Ok(())
    }

    async fn complete_transaction(
        &self,
        transaction_id: Uuid,
        external_transfer_id: &str,
        payment_request_id: Option<Uuid>,
    ) -> Result<bool, ReconcileError> {
        let mut dbtx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE transactions_tb
            SET status = 'completed',
                external_transfer_id = COALESCE(external_transfer_id, $2),
                updated_at = NOW()
            WHERE id = $1 AND status <> 'completed'
            "#,
        )
        .bind(transaction_id)
        .bind(external_transfer_id)
        .execute(&mut *dbtx)
        .await?;

        if result.rows_affected() == 0 {
            dbtx.rollback().await?;
            return Ok(false);
        }

        if let Some(request_id) = payment_request_id {
            sqlx::query(
                "UPDATE payment_requests_tb SET status = 'fulfilled', updated_at = NOW() WHERE id = $1",
            )
            .bind(request_id)
            .execute(&mut *dbtx)
            .await?;
        }

        dbtx.commit().await?;
        Ok(true)
    }

    async fn fail_with_compensation(
        &self,
        compensation: &FailureCompensation,
    ) -> Result<bool, ReconcileError> {
        let mut dbtx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE transactions_tb
            SET status = 'failed', failure_reason = $2, fee_forwarded = FALSE, updated_at = NOW()
            WHERE id = $1 AND status NOT IN ('completed', 'failed')
            "#,
        )
        .bind(compensation.transaction_id)
        .bind(&compensation.reason)
        .execute(&mut *dbtx)
        .await?;

        if result.rows_affected() == 0 {
            dbtx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO wallets_tb (user_id, balance, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (user_id)
            DO UPDATE SET balance = wallets_tb.balance + EXCLUDED.balance, updated_at = NOW()
            "#,
        )
        .bind(compensation.sender_id)
        .bind(compensation.credit_amount)
        .execute(&mut *dbtx)
        .await?;

        if let Some(fee) = compensation.fee_reversal {
            sqlx::query(
                r#"
                INSERT INTO platform_fee_reversals_tb (transaction_id, amount)
                VALUES ($1, $2)
                ON CONFLICT (transaction_id) DO NOTHING
                "#,
            )
            .bind(compensation.transaction_id)
            .bind(fee)
            .execute(&mut *dbtx)
            .await?;
        }

        if let Some(request_id) = compensation.release_payment_request {
            sqlx::query(
                r#"
                UPDATE payment_requests_tb SET status = 'pending', updated_at = NOW()
                WHERE id = $1 AND status = 'processing'
                "#,
            )
            .bind(request_id)
            .execute(&mut *dbtx)
            .await?;
        }

        dbtx.commit().await?;
        Ok(true)
    }

    async fn mark_failed(
        &self,
        transaction_id: Uuid,
        reason: &str,
    ) -> Result<bool, ReconcileError> {
        let result = sqlx::query(
            r#"
            UPDATE transactions_tb
            SET status = 'failed', failure_reason = $2, updated_at = NOW()
            WHERE id = $1 AND status NOT IN ('completed', 'failed')
            "#,
        )
        .bind(transaction_id)
        .bind(reason)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_claim_state(&self, update: &ClaimStateUpdate) -> Result<bool, ReconcileError> {
        let (external_mode, external_value) = patch_parts(&update.external_transfer_id);
        let (reason_mode, reason_value) = patch_parts(&update.failure_reason);

        let result = sqlx::query(
            r#"
            UPDATE transactions_tb
            SET state_token = $2,
                external_transfer_id = CASE $3::text
                    WHEN 'keep' THEN external_transfer_id
                    WHEN 'clear' THEN NULL
                    ELSE $4 END,
                failure_reason = CASE $5::text
                    WHEN 'keep' THEN failure_reason
                    WHEN 'clear' THEN NULL
                    ELSE $6 END,
                updated_at = NOW()
            WHERE id = $1
              AND kind = 'pot_claim'
              AND status = 'pending'
              AND state_token IS NOT DISTINCT FROM $7
            "#,
        )
        .bind(update.transaction_id)
        .bind(&update.new_token)
        .bind(external_mode)
        .bind(external_value)
        .bind(reason_mode)
        .bind(reason_value)
        .bind(&update.expected_token)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn record_external_id(
        &self,
        transaction_id: Uuid,
        external_transfer_id: &str,
    ) -> Result<bool, ReconcileError> {
        let result = sqlx::query(
            r#"
            UPDATE transactions_tb
            SET external_transfer_id = $2, updated_at = NOW()
            WHERE id = $1 AND external_transfer_id IS NULL
            "#,
        )
        .bind(transaction_id)
        .bind(external_transfer_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn revert_claim(&self, revert: &ClaimRevert) -> Result<bool, ReconcileError> {
        let mut dbtx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE transactions_tb
            SET status = 'failed', state_token = $2, failure_reason = $3, updated_at = NOW()
            WHERE id = $1
              AND kind = 'pot_claim'
              AND status = 'pending'
              AND state_token IS NOT DISTINCT FROM $4
            "#,
        )
        .bind(revert.transaction_id)
        .bind(&revert.new_token)
        .bind(&revert.reason)
        .bind(&revert.expected_token)
        .execute(&mut *dbtx)
        .await?;

        if result.rows_affected() == 0 {
            dbtx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            UPDATE pots_tb
            SET claims_made_count = GREATEST(claims_made_count - 1, 0), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(revert.pot_id)
        .execute(&mut *dbtx)
        .await?;

        dbtx.commit().await?;
        Ok(true)
    }

    async fn list_reconciliation_candidates(
        &self,
        min_age: Duration,
        limit: i64,
    ) -> Result<Vec<ReconciliationCandidate>, ReconcileError> {
        let rows = sqlx::query(
            r#"
            SELECT id, pot_id, source_account_ref, destination_account_ref, amount,
                   state_token, created_at
            FROM transactions_tb
            WHERE kind = 'pot_claim'
              AND status = 'pending'
              AND external_transfer_id IS NULL
              AND created_at <= NOW() - INTERVAL '1 millisecond' * $1
            ORDER BY created_at ASC
            LIMIT $2
            "#,
        )
        .bind(min_age.num_milliseconds())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| ReconciliationCandidate {
                transaction_id: row.get("id"),
                pot_id: row.get("pot_id"),
                source_account_ref: row
                    .get::<Option<String>, _>("source_account_ref")
                    .unwrap_or_default(),
                destination_account_ref: row
                    .get::<Option<String>, _>("destination_account_ref")
                    .unwrap_or_default(),
                amount: row.get("amount"),
                state_token: row.get("state_token"),
                created_at: row.get("created_at"),
            })
            .collect())
    }

    async fn get_pot(&self, pot_id: Uuid) -> Result<Option<Pot>, ReconcileError> {
        let sql = format!("SELECT {} FROM pots_tb WHERE id = $1", POT_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(pot_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_pot).transpose()
    }

    async fn reserve_claim(&self, claim: &NewClaim) -> Result<Option<Transaction>, ReconcileError> {
        let mut dbtx = self.pool.begin().await?;

        let reserved = sqlx::query(
            r#"
            UPDATE pots_tb
            SET claims_made_count = claims_made_count + 1, updated_at = NOW()
            WHERE id = $1
              AND status = 'active'
              AND NOT finalizing
              AND claims_made_count < total_slots
              AND expires_at > NOW()
            RETURNING creator_id, provider_account_ref, amount_per_claim
            "#,
        )
        .bind(claim.pot_id)
        .fetch_optional(&mut *dbtx)
        .await?;

        let Some(pot) = reserved else {
            dbtx.rollback().await?;
            return Ok(None);
        };
        let creator_id: Uuid = pot.get("creator_id");
        let provider_account_ref: String = pot.get("provider_account_ref");
        let amount: MinorAmount = pot.get("amount_per_claim");

        let sql = format!(
            r#"
            INSERT INTO transactions_tb
                (id, sender_id, recipient_id, source_account_ref, destination_account_ref,
                 amount, fee, kind, status, state_token, pot_id, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, 0, 'pot_claim', 'pending', $7, $8, NOW(), NOW())
            RETURNING {}
            "#,
            TRANSACTION_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(claim.transaction_id)
            .bind(creator_id)
            .bind(claim.claimant_id)
            .bind(provider_account_ref)
            .bind(&claim.destination_account_ref)
            .bind(amount)
            .bind(&claim.state_token)
            .bind(claim.pot_id)
            .fetch_one(&mut *dbtx)
            .await?;
        let tx = row_to_transaction(&row)?;

        dbtx.commit().await?;
        Ok(Some(tx))
    }

    async fn acquire_finalization_lock(
        &self,
        pot_id: Uuid,
    ) -> Result<LockAcquisition, ReconcileError> {
        let acquired = sqlx::query_scalar::<_, String>(
            r#"
            UPDATE pots_tb
            SET finalizing = TRUE, updated_at = NOW()
            WHERE id = $1
              AND NOT finalizing
              AND (finalization_marker IS NULL OR finalization_marker = 'retry_pending')
            RETURNING status
            "#,
        )
        .bind(pot_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(status) = acquired {
            return Ok(LockAcquisition {
                acquired: true,
                was_active: status == PotStatus::Active.as_str(),
            });
        }

        let status = sqlx::query_scalar::<_, String>("SELECT status FROM pots_tb WHERE id = $1")
            .bind(pot_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ReconcileError::PotNotFound(pot_id.to_string()))?;

        Ok(LockAcquisition {
            acquired: false,
            was_active: status == PotStatus::Active.as_str(),
        })
    }

    async fn release_finalization_lock(
        &self,
        pot_id: Uuid,
        restore_active: bool,
        marker: Patch<FinalizationMarker>,
    ) -> Result<(), ReconcileError> {
        let (marker_mode, marker_value) = match marker {
            Patch::Keep => ("keep", None),
            Patch::Clear => ("clear", None),
            Patch::Set(marker) => ("set", Some(marker.as_str())),
        };
        sqlx::query(
            r#"
            UPDATE pots_tb
            SET finalizing = FALSE,
                finalization_marker = CASE $3::text
                    WHEN 'keep' THEN finalization_marker
                    WHEN 'clear' THEN NULL
                    ELSE $4 END,
                status = CASE WHEN $2 THEN 'active' ELSE status END,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(pot_id)
        .bind(restore_active)
        .bind(marker_mode)
        .bind(marker_value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_finalization_marker(
        &self,
        pot_id: Uuid,
        marker: FinalizationMarker,
    ) -> Result<(), ReconcileError> {
        sqlx::query(
            "UPDATE pots_tb SET finalization_marker = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(pot_id)
        .bind(marker.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_refund(
        &self,
        pot_id: Uuid,
        amount: MinorAmount,
        marker: Option<FinalizationMarker>,
    ) -> Result<(), ReconcileError> {
        sqlx::query(
            r#"
            UPDATE pots_tb
            SET refunded_amount = refunded_amount + $2,
                status = 'completed',
                finalizing = FALSE,
                finalization_marker = $3,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(pot_id)
        .bind(amount)
        .bind(marker.map(|m| m.as_str()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_refund_persistence_failed(&self, pot_id: Uuid) -> Result<(), ReconcileError> {
        sqlx::query(
            r#"
            UPDATE pots_tb
            SET status = 'completed',
                finalizing = TRUE,
                finalization_marker = 'refund_persistence_failed',
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(pot_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
