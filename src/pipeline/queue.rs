//! Bounded message queue between ingestion and the worker pool.
//!
//! Ingestion never blocks: when the queue is full the message is shed and
//! counted.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{Mutex, mpsc};
use tracing::warn;

use crate::error::PipelineError;
use crate::pipeline::types::NormalizedMessage;

/// Receiving half, shared by all workers.
pub type QueueReceiver = Arc<Mutex<mpsc::Receiver<NormalizedMessage>>>;

/// Result of offering a message to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue {
    Queued,
    /// The queue was full; the message was dropped.
    Shed,
}

/// Sending half of the bounded queue.
#[derive(Clone)]
pub struct MessageQueue {
    tx: mpsc::Sender<NormalizedMessage>,
    shed: Arc<AtomicU64>,
}

impl MessageQueue {
    /// Create a queue holding at most `capacity` messages.
    pub fn bounded(capacity: usize) -> (Self, QueueReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let queue = Self {
            tx,
            shed: Arc::new(AtomicU64::new(0)),
        };
        (queue, Arc::new(Mutex::new(rx)))
    }

    /// Enqueue without waiting. A full queue sheds the message.
    pub fn offer(&self, msg: NormalizedMessage) -> Result<Enqueue, PipelineError> {
        match self.tx.try_send(msg) {
            Ok(()) => Ok(Enqueue::Queued),
            Err(mpsc::error::TrySendError::Full(msg)) => {
                let total = self.shed.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    event = "queue_full",
                    chat_id = msg.raw.chat_id,
                    message_id = msg.raw.message_id,
                    shed_total = total,
                    "Queue full, shedding message"
                );
                Ok(Enqueue::Shed)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(PipelineError::QueueClosed),
        }
    }

    /// Messages shed since start.
    pub fn shed_count(&self) -> u64 {
        self.shed.load(Ordering::Relaxed)
    }

    /// Messages currently waiting.
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
