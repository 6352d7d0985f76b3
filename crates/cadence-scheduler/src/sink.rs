use async_trait::async_trait;
use cadence_core::types::ExecutionId;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

/// Failure reported by a [`DispatchSink`].
#[derive(Debug, Error)]
pub enum SinkError {
    /// The queue could not be reached or is not accepting work right now.
    #[error("Sink unavailable: {0}")]
    Unavailable(String),

    /// The queue refused this payload.
    #[error("Sink rejected payload: {0}")]
    Rejected(String),
}

impl SinkError {
    pub fn code(&self) -> &'static str {
        match self {
            SinkError::Unavailable(_) => "SINK_UNAVAILABLE",
            SinkError::Rejected(_) => "SINK_REJECTED",
        }
    }
}

/// Per-job dispatch outcome as seen by the scheduler loop.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Sink(#[from] SinkError),

    /// The sink did not answer within the enqueue timeout.
    #[error("Enqueue timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl DispatchError {
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::Sink(e) => e.code(),
            DispatchError::Timeout(_) => "SINK_TIMEOUT",
        }
    }
}

/// The work queue that executes job payloads once the scheduler hands them off.
///
/// Implementations must be `Send + Sync`; the scheduler calls `enqueue`
/// from several tasks at once.
#[async_trait]
pub trait DispatchSink: Send + Sync {
    /// Hand one occurrence's payload to the queue and return its execution handle.
    async fn enqueue(
        &self,
        payload: &[u8],
        scheduled_for: DateTime<Utc>,
    ) -> Result<ExecutionId, SinkError>;
}

/// Message delivered by [`ChannelSink`] to its consumer.
#[derive(Debug, Clone)]
pub struct Enqueued {
    pub execution_id: ExecutionId,
    pub payload: Vec<u8>,
    pub scheduled_for: DateTime<Utc>,
}

/// In-process sink that forwards payloads over a bounded mpsc channel.
///
/// `try_send` never blocks the scheduler: a full channel or a dropped
/// receiver is reported as [`SinkError::Unavailable`].
pub struct ChannelSink {
    tx: mpsc::Sender<Enqueued>,
    max_payload_bytes: usize,
}

impl ChannelSink {
    /// Create a sink and the receiving end its consumer drains.
    pub fn new(capacity: usize, max_payload_bytes: usize) -> (Self, mpsc::Receiver<Enqueued>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                max_payload_bytes,
            },
            rx,
        )
    }
}

#[async_trait]
impl DispatchSink for ChannelSink {
    async fn enqueue(
        &self,
        payload: &[u8],
        scheduled_for: DateTime<Utc>,
    ) -> Result<ExecutionId, SinkError> {
        if payload.len() > self.max_payload_bytes {
            return Err(SinkError::Rejected(format!(
                "payload of {} bytes exceeds the {} byte limit",
                payload.len(),
                self.max_payload_bytes
            )));
        }

        let execution_id = ExecutionId::new();
        let msg = Enqueued {
            execution_id: execution_id.clone(),
            payload: payload.to_vec(),
            scheduled_for,
        };
        self.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SinkError::Unavailable("queue full".into()),
            mpsc::error::TrySendError::Closed(_) => SinkError::Unavailable("queue closed".into()),
        })?;

        debug!(%execution_id, "payload enqueued");
        Ok(execution_id)
    }
}
