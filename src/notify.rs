//! User-facing notifications
//!
//! Fire-and-forget: a failed notification is logged and never fails the
//! reconciliation step that produced it.

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::reconcile::types::MinorAmount;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    TransferCompleted {
        user_id: Uuid,
        transaction_id: Uuid,
        amount: MinorAmount,
        /// Receiving side of the transfer
        incoming: bool,
    },
    TransferFailed {
        user_id: Uuid,
        transaction_id: Uuid,
        amount: MinorAmount,
        reason: String,
    },
    ClaimPaid {
        user_id: Uuid,
        transaction_id: Uuid,
        amount: MinorAmount,
    },
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, notification: Notification) -> Result<(), String>;
}

/// Emit and swallow the error
pub async fn emit(sink: &dyn NotificationSink, notification: Notification) {
    if let Err(e) = sink.notify(notification).await {
        warn!(error = %e, "Notification dropped");
    }
}

/// Publishes notifications as JSON on a Redis pub/sub channel
pub struct RedisNotifier {
    conn: redis::aio::ConnectionManager,
    channel: String,
}

impl RedisNotifier {
    pub fn new(conn: redis::aio::ConnectionManager, channel: impl Into<String>) -> Self {
        Self {
            conn,
            channel: channel.into(),
        }
    }
}

#[async_trait]
impl NotificationSink for RedisNotifier {
    async fn notify(&self, notification: Notification) -> Result<(), String> {
        let payload = serde_json::to_string(&notification).map_err(|e| e.to_string())?;
        let mut conn = self.conn.clone();
        let _receivers: i64 = redis::cmd("PUBLISH")
            .arg(&self.channel)
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| e.to_string())?;
        Ok(())
    }
}

/// Writes notifications to the log only
pub struct LogNotifier;

#[async_trait]
impl NotificationSink for LogNotifier {
    async fn notify(&self, notification: Notification) -> Result<(), String> {
        info!(?notification, "Notification");
        Ok(())
    }
}
