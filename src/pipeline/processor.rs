//! Message processor — per-message orchestration on a worker.
//!
//! Flow:
//! 1. Snapshot rules and runtime config once
//! 2. Decision engine → skip or forward
//! 3. Fingerprint + dedup resolver → new, update, skip (waits out an
//!    in-flight publish of the same order)
//! 4. Rate gate
//! 5. Executor publishes or edits, then commits

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::config::RuntimeConfigService;
use crate::geo::region_tag;
use crate::pipeline::executor::ActionExecutor;
use crate::pipeline::fingerprint::{OrderFingerprint, content_hash};
use crate::pipeline::rate_limit::{CooldownManager, RateDecision};
use crate::pipeline::resolver::{DedupResolver, PublishIntent};
use crate::pipeline::rules::decide;
use crate::pipeline::types::{NormalizedMessage, PostRef};
use crate::pipeline::workers::MessageHandler;
use crate::rules::KeywordService;

/// Terminal state of one processed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The decision engine rejected it.
    Rejected(&'static str),
    /// Duplicate of an already published order, or one being published.
    Skipped,
    /// Storage was unavailable; nothing was published.
    Deferred,
    RateLimited,
    Published(PostRef),
    Edited(PostRef),
    Failed,
}

impl ProcessOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Rejected(_) => "rejected",
            Self::Skipped => "skipped",
            Self::Deferred => "deferred",
            Self::RateLimited => "rate_limited",
            Self::Published(_) => "published",
            Self::Edited(_) => "edited",
            Self::Failed => "failed",
        }
    }
}

pub struct MessageProcessor {
    keywords: Arc<KeywordService>,
    config: Arc<RuntimeConfigService>,
    resolver: Arc<DedupResolver>,
    cooldown: Arc<CooldownManager>,
    executor: Arc<ActionExecutor>,
}

impl MessageProcessor {
    pub fn new(
        keywords: Arc<KeywordService>,
        config: Arc<RuntimeConfigService>,
        resolver: Arc<DedupResolver>,
        cooldown: Arc<CooldownManager>,
        executor: Arc<ActionExecutor>,
    ) -> Self {
        Self {
            keywords,
            config,
            resolver,
            cooldown,
            executor,
        }
    }

    /// Run one message through the pipeline.
    pub async fn process(&self, msg: &NormalizedMessage) -> ProcessOutcome {
        let rules = self.keywords.snapshot();
        let config = self.config.snapshot();
        let (chat_id, message_id) = (msg.raw.chat_id, msg.raw.message_id);

        let decision = decide(msg, &rules, &config);
        if !decision.is_accepted() {
            info!(
                event = "decision_skip",
                chat_id,
                message_id,
                verdict = decision.verdict.label(),
                reason = decision.reason,
                rules_version = rules.version(),
                "Message not forwarded"
            );
            return ProcessOutcome::Rejected(decision.reason);
        }

        let region = region_tag(&msg.canonical, &config.default_region_tag);
        info!(
            event = "decision_forward",
            chat_id,
            message_id,
            reason = decision.reason,
            region,
            is_edit = msg.raw.is_edit,
            rules_version = rules.version(),
            config_version = config.version,
            "Order accepted"
        );

        let author = msg.raw.sender_id.unwrap_or(chat_id);
        let fingerprint = OrderFingerprint::compute(author, &msg.canonical);
        let hash = content_hash(&msg.canonical);

        let intent = match self.resolver.resolve_waiting(&fingerprint, &hash).await {
            Ok(intent) => intent,
            Err(e) => {
                warn!(
                    event = "dedup_deferred",
                    chat_id,
                    message_id,
                    fingerprint = %fingerprint,
                    error = %e,
                    "Dedup store unavailable, not publishing"
                );
                return ProcessOutcome::Deferred;
            }
        };

        let in_flight = matches!(intent, PublishIntent::Blocked);
        let record = match intent {
            PublishIntent::Skip(_) | PublishIntent::Blocked => {
                info!(
                    event = "dedup_skip",
                    chat_id,
                    message_id,
                    fingerprint = %fingerprint,
                    in_flight,
                    "Duplicate order skipped"
                );
                return ProcessOutcome::Skipped;
            }
            PublishIntent::New => None,
            PublishIntent::Update(record) => Some(record),
        };

        match self.cooldown.allow_publish(chat_id, &config).await {
            Ok(RateDecision::Allowed) => {}
            Ok(RateDecision::Denied { .. }) => {
                if record.is_none() {
                    self.release(&fingerprint).await;
                }
                return ProcessOutcome::RateLimited;
            }
            Err(e) => {
                warn!(
                    event = "dedup_deferred",
                    chat_id,
                    message_id,
                    error = %e,
                    "Rate limiter unavailable, not publishing"
                );
                if record.is_none() {
                    self.release(&fingerprint).await;
                }
                return ProcessOutcome::Deferred;
            }
        }

        match record {
            None => match self
                .executor
                .publish_new(msg, &fingerprint, &hash, region, &config)
                .await
            {
                Ok(post) => {
                    self.executor.maybe_reply(msg, &config).await;
                    ProcessOutcome::Published(post)
                }
                Err(_) => ProcessOutcome::Failed,
            },
            Some(record) => match self
                .executor
                .publish_update(msg, &record, &hash, region, &config)
                .await
            {
                Ok(post) => ProcessOutcome::Edited(post),
                Err(_) => ProcessOutcome::Failed,
            },
        }
    }

    async fn release(&self, fingerprint: &OrderFingerprint) {
        if let Err(e) = self.resolver.release(fingerprint).await {
            warn!(fingerprint = %fingerprint, error = %e, "Failed to release reservation");
        }
    }
}

#[async_trait]
impl MessageHandler for MessageProcessor {
    async fn handle(&self, msg: NormalizedMessage) {
        let outcome = self.process(&msg).await;
        tracing::debug!(
            chat_id = msg.raw.chat_id,
            message_id = msg.raw.message_id,
            outcome = outcome.label(),
            "Message processed"
        );
    }
}
