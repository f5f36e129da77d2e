//! Worker pool — N tasks draining the shared queue.
//!
//! Each message runs in its own spawned task, so a panic while handling one
//! message is logged and the worker moves on to the next.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::ConfigError;
use crate::pipeline::queue::QueueReceiver;
use crate::pipeline::types::NormalizedMessage;

/// What happens to queued messages on shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Stop intake, finish everything already queued.
    Drain,
    /// Stop intake, finish in-flight messages, drop the rest.
    Abandon,
}

impl FromStr for ShutdownMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "drain" => Ok(Self::Drain),
            "abandon" => Ok(Self::Abandon),
            other => Err(ConfigError::InvalidValue {
                key: "SHUTDOWN_MODE".into(),
                message: format!("'{other}' is not one of drain, abandon"),
            }),
        }
    }
}

impl fmt::Display for ShutdownMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Drain => f.write_str("drain"),
            Self::Abandon => f.write_str("abandon"),
        }
    }
}

/// Per-message work executed by the pool.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, msg: NormalizedMessage);
}

/// Counters reported when the pool stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub processed: u64,
    pub panicked: u64,
    pub abandoned: u64,
}

#[derive(Default)]
struct PoolStats {
    processed: AtomicU64,
    panicked: AtomicU64,
}

/// Running worker pool.
pub struct WorkerPool {
    receiver: QueueReceiver,
    handles: Vec<JoinHandle<()>>,
    abandon: Arc<AtomicBool>,
    stats: Arc<PoolStats>,
}

impl WorkerPool {
    /// Spawn `count` workers pulling from `receiver`.
    ///
    /// Idle workers wake every `poll_timeout` to check for shutdown.
    pub fn start<H: MessageHandler>(
        count: usize,
        receiver: QueueReceiver,
        handler: Arc<H>,
        poll_timeout: Duration,
    ) -> Self {
        let abandon = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(PoolStats::default());
        let count = count.max(1);

        let handles = (0..count)
            .map(|worker_id| {
                tokio::spawn(worker_loop(
                    worker_id,
                    Arc::clone(&receiver),
                    Arc::clone(&handler),
                    Arc::clone(&abandon),
                    Arc::clone(&stats),
                    poll_timeout,
                ))
            })
            .collect();

        info!(workers = count, "Worker pool started");
        Self {
            receiver,
            handles,
            abandon,
            stats,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    /// Close intake and stop the workers according to `mode`.
    pub async fn shutdown(self, mode: ShutdownMode) -> ShutdownReport {
        if mode == ShutdownMode::Abandon {
            self.abandon.store(true, Ordering::SeqCst);
        }
        self.receiver.lock().await.close();

        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task failed");
            }
        }

        let mut abandoned = 0u64;
        {
            let mut rx = self.receiver.lock().await;
            while rx.try_recv().is_ok() {
                abandoned += 1;
            }
        }

        let report = ShutdownReport {
            processed: self.stats.processed.load(Ordering::Relaxed),
            panicked: self.stats.panicked.load(Ordering::Relaxed),
            abandoned,
        };
        info!(
            mode = %mode,
            processed = report.processed,
            panicked = report.panicked,
            abandoned = report.abandoned,
            "Worker pool stopped"
        );
        report
    }
}

async fn worker_loop<H: MessageHandler>(
    worker_id: usize,
    receiver: QueueReceiver,
    handler: Arc<H>,
    abandon: Arc<AtomicBool>,
    stats: Arc<PoolStats>,
    poll_timeout: Duration,
) {
    debug!(worker_id, "Worker started");
    loop {
        if abandon.load(Ordering::SeqCst) {
            break;
        }

        let next = {
            let mut rx = receiver.lock().await;
            tokio::time::timeout(poll_timeout, rx.recv()).await
        };

        let msg = match next {
            Ok(Some(msg)) => msg,
            // Closed and fully drained.
            Ok(None) => break,
            Err(_elapsed) => continue,
        };

        let chat_id = msg.raw.chat_id;
        let message_id = msg.raw.message_id;
        let handler = Arc::clone(&handler);
        match tokio::spawn(async move { handler.handle(msg).await }).await {
            Ok(()) => {
                stats.processed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                stats.panicked.fetch_add(1, Ordering::Relaxed);
                warn!(
                    worker_id,
                    chat_id,
                    message_id,
                    error = %e,
                    "Message handler panicked, continuing"
                );
            }
        }
    }
    debug!(worker_id, "Worker stopped");
}
