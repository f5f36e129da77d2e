//! Order relay pipeline.
//!
//! Every inbound message flows through:
//! 1. `Ingestor::ingest()` — validate, normalize, fast filter, enqueue
//! 2. `WorkerPool` — bounded queue drained by N workers
//! 3. `MessageProcessor::process()` — decide, fingerprint, dedup, rate gate
//! 4. `ActionExecutor` — publish or edit the post, then commit the record
//!
//! A message is published at most once per fingerprint; later edits update
//! the same post.

pub mod executor;
pub mod filter;
pub mod fingerprint;
pub mod ingest;
pub mod processor;
pub mod queue;
pub mod rate_limit;
pub mod resolver;
pub mod rules;
pub mod types;
pub mod workers;

pub use executor::{ActionExecutor, ExecutorSettings, format_publish_message};
pub use fingerprint::{OrderFingerprint, content_hash};
pub use ingest::{IngestOutcome, IngestSummary, Ingestor};
pub use processor::{MessageProcessor, ProcessOutcome};
pub use queue::{Enqueue, MessageQueue, QueueReceiver};
pub use rate_limit::{
    CooldownManager, InMemoryWindowLimiter, LimitRequest, RateDecision, Scope,
    StoreWindowLimiter, WindowLimiter,
};
pub use resolver::{DedupResolver, PublishIntent};
pub use types::{ChannelPublisher, Decision, NormalizedMessage, PostRef, RawMessage, Verdict};
pub use workers::{MessageHandler, ShutdownMode, ShutdownReport, WorkerPool};
