//! Ingestor — validates, normalizes and pre-screens raw messages, then
//! hands survivors to the bounded queue.

use std::future::Future;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use tracing::{debug, info};

use crate::config::RuntimeConfigService;
use crate::error::PipelineError;
use crate::pipeline::filter::{Screen, screen};
use crate::pipeline::queue::{Enqueue, MessageQueue};
use crate::pipeline::types::{NormalizedMessage, RawMessage};
use crate::rules::KeywordService;
use crate::text::preview;

/// What happened to one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Queued,
    Shed,
    Filtered(&'static str),
}

/// Totals for one ingestion run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub received: u64,
    pub queued: u64,
    pub shed: u64,
    pub filtered: u64,
}

impl IngestSummary {
    fn record(&mut self, outcome: IngestOutcome) {
        self.received += 1;
        match outcome {
            IngestOutcome::Queued => self.queued += 1,
            IngestOutcome::Shed => self.shed += 1,
            IngestOutcome::Filtered(_) => self.filtered += 1,
        }
    }
}

/// Front of the pipeline.
pub struct Ingestor {
    queue: MessageQueue,
    keywords: Arc<KeywordService>,
    config: Arc<RuntimeConfigService>,
}

impl Ingestor {
    pub fn new(
        queue: MessageQueue,
        keywords: Arc<KeywordService>,
        config: Arc<RuntimeConfigService>,
    ) -> Self {
        Self {
            queue,
            keywords,
            config,
        }
    }

    /// Process one raw message. Never blocks on a full queue.
    pub fn ingest(&self, raw: RawMessage) -> Result<IngestOutcome, PipelineError> {
        debug!(
            event = "message_received",
            chat = %raw.chat_ref(),
            chat_id = raw.chat_id,
            message_id = raw.message_id,
            is_edit = raw.is_edit,
            preview = %preview(&raw.text, 80),
            "Message received"
        );

        if raw.message_id <= 0 {
            return Ok(filtered(&raw, "invalid_message_id"));
        }
        if raw.text.trim().is_empty() {
            return Ok(filtered(&raw, "empty_text"));
        }

        let msg = NormalizedMessage::new(raw);
        let rules = self.keywords.snapshot();
        let config = self.config.snapshot();
        if let Screen::Drop(reason) = screen(&msg.canonical, &rules, &config) {
            return Ok(filtered(&msg.raw, reason));
        }

        let (chat_id, message_id) = (msg.raw.chat_id, msg.raw.message_id);
        match self.queue.offer(msg)? {
            Enqueue::Queued => {
                debug!(event = "message_queued", chat_id, message_id, "Message queued");
                Ok(IngestOutcome::Queued)
            }
            Enqueue::Shed => Ok(IngestOutcome::Shed),
        }
    }

    /// Feed `source` through [`ingest`](Self::ingest) until it ends, the
    /// queue closes, or `shutdown` resolves.
    pub async fn run<S, F>(&self, source: S, shutdown: F) -> IngestSummary
    where
        S: Stream<Item = RawMessage> + Send,
        F: Future<Output = ()> + Send,
    {
        let mut summary = IngestSummary::default();
        let mut source = std::pin::pin!(source);
        let mut shutdown = std::pin::pin!(shutdown);

        loop {
            let raw = tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, stopping ingestion");
                    break;
                }
                next = source.next() => match next {
                    Some(raw) => raw,
                    None => {
                        info!("Message source ended");
                        break;
                    }
                },
            };

            match self.ingest(raw) {
                Ok(outcome) => summary.record(outcome),
                Err(e) => {
                    info!(error = %e, "Queue closed, stopping ingestion");
                    break;
                }
            }
        }

        info!(
            received = summary.received,
            queued = summary.queued,
            shed = summary.shed,
            filtered = summary.filtered,
            "Ingestion finished"
        );
        summary
    }
}

fn filtered(raw: &RawMessage, reason: &'static str) -> IngestOutcome {
    debug!(
        event = "message_filtered",
        chat_id = raw.chat_id,
        message_id = raw.message_id,
        reason,
        "Message filtered"
    );
    IngestOutcome::Filtered(reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::store::LibSqlBackend;

    async fn setup(capacity: usize) -> (Ingestor, crate::pipeline::queue::QueueReceiver) {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let keywords = KeywordService::new(store.clone());
        let config = RuntimeConfigService::new(store, RuntimeConfig::default());
        let (queue, rx) = MessageQueue::bounded(capacity);
        (Ingestor::new(queue, keywords, config), rx)
    }

    #[tokio::test]
    async fn order_is_normalized_and_queued() {
        let (ingestor, rx) = setup(8).await;
        let outcome = ingestor
            .ingest(RawMessage::new(-100, 5, "TAXI kerak Toshkentdan Samarqandga"))
            .unwrap();
        assert_eq!(outcome, IngestOutcome::Queued);

        let queued = rx.lock().await.recv().await.unwrap();
        assert_eq!(queued.canonical, "taxi kerak toshkentdan samarqandga");
        assert_eq!(queued.raw.message_id, 5);
    }

    #[tokio::test]
    async fn invalid_and_empty_messages_are_filtered() {
        let (ingestor, _rx) = setup(8).await;
        assert_eq!(
            ingestor.ingest(RawMessage::new(-100, 0, "taxi kerak")).unwrap(),
            IngestOutcome::Filtered("invalid_message_id")
        );
        assert_eq!(
            ingestor.ingest(RawMessage::new(-100, 1, "   ")).unwrap(),
            IngestOutcome::Filtered("empty_text")
        );
        assert_eq!(
            ingestor.ingest(RawMessage::new(-100, 2, "\u{1F695}\u{1F695}")).unwrap(),
            IngestOutcome::Filtered("empty_text")
        );
        assert_eq!(
            ingestor.ingest(RawMessage::new(-100, 3, "Reklama: kanalga obuna bo'ling!")).unwrap(),
            IngestOutcome::Filtered("exclude_keyword")
        );
    }

    #[tokio::test]
    async fn run_consumes_stream_and_summarizes() {
        let (ingestor, _rx) = setup(1).await;
        let source = futures::stream::iter(vec![
            RawMessage::new(-100, 1, "taxi kerak"),
            RawMessage::new(-100, 2, "2 kishi bor"),
            RawMessage::new(-100, 3, "salom"),
        ]);
        let summary = ingestor.run(source, std::future::pending()).await;
        assert_eq!(
            summary,
            IngestSummary {
                received: 3,
                queued: 1,
                shed: 1,
                filtered: 1,
            }
        );
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let (ingestor, _rx) = setup(8).await;
        let summary = ingestor
            .run(futures::stream::pending::<RawMessage>(), async {})
            .await;
        assert_eq!(summary.received, 0);
    }
}
