//! Callback queue transport
//!
//! Reliable Redis list queue: a delivery is moved atomically from the ready
//! list to a processing list, and only leaves the processing list on ack.
//! A nack puts it back at the tail of the ready list for redelivery.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info};

use crate::reconcile::{EventConsumer, ReconcileError};

/// One message taken off the queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub payload: Vec<u8>,
}

#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Wait up to `timeout` for a message
    async fn receive(&self, timeout: Duration) -> Result<Option<Delivery>, ReconcileError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), ReconcileError>;

    /// Return the message for redelivery
    async fn nack(&self, delivery: &Delivery) -> Result<(), ReconcileError>;
}

pub struct RedisListQueue {
    conn: redis::aio::ConnectionManager,
    ready_key: String,
    processing_key: String,
}

impl RedisListQueue {
    /// Open a queue on its own connection; BLMOVE blocks the connection it runs on
    pub async fn connect(
        client: &redis::Client,
        ready_key: impl Into<String>,
        processing_key: impl Into<String>,
    ) -> Result<Self, ReconcileError> {
        let conn = client.get_connection_manager().await?;
        Ok(Self {
            conn,
            ready_key: ready_key.into(),
            processing_key: processing_key.into(),
        })
    }

    /// Move everything left in the processing list back to ready.
    ///
    /// Only safe before any worker on this queue starts.
    pub async fn recover_processing(&self) -> Result<usize, ReconcileError> {
        let mut conn = self.conn.clone();
        let mut moved = 0;
        loop {
            let item: Option<Vec<u8>> = redis::cmd("LMOVE")
                .arg(&self.processing_key)
                .arg(&self.ready_key)
                .arg("LEFT")
                .arg("RIGHT")
                .query_async(&mut conn)
                .await?;
            if item.is_none() {
                break;
            }
            moved += 1;
        }
        if moved > 0 {
            info!(count = moved, queue = %self.ready_key, "Recovered unacknowledged callbacks");
        }
        Ok(moved)
    }
}

#[async_trait]
impl MessageQueue for RedisListQueue {
    async fn receive(&self, timeout: Duration) -> Result<Option<Delivery>, ReconcileError> {
        let mut conn = self.conn.clone();
        let payload: Option<Vec<u8>> = redis::cmd("BLMOVE")
            .arg(&self.ready_key)
            .arg(&self.processing_key)
            .arg("LEFT")
            .arg("RIGHT")
            .arg(timeout.as_secs_f64())
            .query_async(&mut conn)
            .await?;
        Ok(payload.map(|payload| Delivery { payload }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), ReconcileError> {
        let mut conn = self.conn.clone();
        let _removed: i64 = redis::cmd("LREM")
            .arg(&self.processing_key)
            .arg(1)
            .arg(&delivery.payload)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery) -> Result<(), ReconcileError> {
        let mut conn = self.conn.clone();
        let (_removed, _len): (i64, i64) = redis::pipe()
            .atomic()
            .cmd("LREM")
            .arg(&self.processing_key)
            .arg(1)
            .arg(&delivery.payload)
            .cmd("RPUSH")
            .arg(&self.ready_key)
            .arg(&delivery.payload)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

/// Receive one message and settle it. Returns whether a message was handled.
pub async fn consume_one(
    queue: &dyn MessageQueue,
    consumer: &EventConsumer,
    receive_timeout: Duration,
) -> Result<bool, ReconcileError> {
    let Some(delivery) = queue.receive(receive_timeout).await? else {
        return Ok(false);
    };

    if consumer.handle_message(&delivery.payload).await {
        queue.ack(&delivery).await?;
    } else {
        debug!("Callback negatively acknowledged");
        queue.nack(&delivery).await?;
    }
    Ok(true)
}

/// Consumer worker loop
pub async fn run_consumer(
    worker_id: usize,
    queue: Arc<dyn MessageQueue>,
    consumer: Arc<EventConsumer>,
    receive_timeout: Duration,
) -> ! {
    info!(worker_id = worker_id, "Starting callback consumer");

    loop {
        if let Err(e) = consume_one(queue.as_ref(), &consumer, receive_timeout).await {
            error!(worker_id = worker_id, error = %e, "Callback queue error");
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }
}
