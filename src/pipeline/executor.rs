//! Action executor — publishes or edits the outbound post and commits the
//! result to the store.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::config::{RuntimeConfig, Settings};
use crate::error::{PipelineError, PublishError};
use crate::pipeline::fingerprint::OrderFingerprint;
use crate::pipeline::rate_limit::CooldownManager;
use crate::pipeline::resolver::DedupResolver;
use crate::pipeline::types::{ChannelPublisher, NormalizedMessage, PostRef};
use crate::store::{
    ActionStatus, ActionType, OrderStatus, OrderStore, PublishedOrderRecord, with_timeout,
};

/// Hard cap on the outbound post length.
pub const MAX_POST_CHARS: usize = 3900;

/// Confirmation sent back to the source group.
pub const REPLY_TEXT: &str = "Buyurtma qabul qilindi.";

const EMPTY_BODY: &str = "(matn topilmadi)";

/// Render the outbound post.
///
/// Over-long bodies are cut so the region, status and source lines always
/// survive.
pub fn format_publish_message(
    raw_text: &str,
    source_link: Option<&str>,
    region_tag: &str,
    status: OrderStatus,
) -> String {
    let body = match raw_text.trim() {
        "" => EMPTY_BODY,
        text => text,
    };
    let status_label = match status {
        OrderStatus::New => "Yangi",
        OrderStatus::Updated => "Yangilandi",
    };
    let source = source_link.unwrap_or("private chat");
    let tail = format!("\n\n{region_tag}\n\nStatus: {status_label}\n\nManba: {source}");

    let message = format!("Taxi buyurtma:\n\n{body}{tail}");
    if message.chars().count() <= MAX_POST_CHARS {
        return message;
    }

    let head_limit = MAX_POST_CHARS
        .saturating_sub(tail.chars().count() + 24)
        .max(120);
    let compact: String = body.chars().take(head_limit).collect();
    format!("Taxi buyurtma:\n\n{compact}...{tail}")
}

/// Retry and timeout policy for outbound calls.
#[derive(Debug, Clone, Copy)]
pub struct ExecutorSettings {
    pub publish_timeout: Duration,
    pub max_attempts: u32,
    pub backoff: Duration,
    pub store_timeout: Duration,
}

impl From<&Settings> for ExecutorSettings {
    fn from(settings: &Settings) -> Self {
        Self {
            publish_timeout: settings.publish_timeout,
            max_attempts: settings.publish_max_attempts,
            backoff: settings.publish_backoff,
            store_timeout: settings.store_timeout,
        }
    }
}

pub struct ActionExecutor {
    publisher: Arc<dyn ChannelPublisher>,
    store: Arc<dyn OrderStore>,
    resolver: Arc<DedupResolver>,
    cooldown: Arc<CooldownManager>,
    settings: ExecutorSettings,
}

impl ActionExecutor {
    pub fn new(
        publisher: Arc<dyn ChannelPublisher>,
        store: Arc<dyn OrderStore>,
        resolver: Arc<DedupResolver>,
        cooldown: Arc<CooldownManager>,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            publisher,
            store,
            resolver,
            cooldown,
            settings,
        }
    }

    /// Publish a first-seen order. The caller holds the reservation for
    /// `fingerprint`; it is released here whatever the outcome.
    pub async fn publish_new(
        &self,
        msg: &NormalizedMessage,
        fingerprint: &OrderFingerprint,
        content_hash: &str,
        region_tag: &str,
        config: &RuntimeConfig,
    ) -> Result<PostRef, PipelineError> {
        let raw = &msg.raw;
        let text = format_publish_message(
            &raw.text,
            raw.source_link().as_deref(),
            region_tag,
            OrderStatus::New,
        );

        tokio::time::sleep(config.human_delay()).await;
        let target = config.forward_target.as_str();
        let result = self
            .with_retries("publish", || self.publisher.publish_new(target, &text))
            .await;

        let post = match result {
            Ok(post) => post,
            Err((attempts, e)) => {
                self.release(fingerprint).await;
                self.log_action(raw.chat_id, raw.message_id, ActionType::Publish, ActionStatus::Error)
                    .await;
                error!(
                    event = "publish_failed",
                    chat_id = raw.chat_id,
                    message_id = raw.message_id,
                    fingerprint = %fingerprint,
                    attempts,
                    kind = e.kind(),
                    error = %e,
                    "Publish failed"
                );
                return Err(PipelineError::Publish {
                    attempts,
                    source: e,
                });
            }
        };

        self.log_action(raw.chat_id, raw.message_id, ActionType::Publish, ActionStatus::Ok)
            .await;

        let now = Utc::now();
        let record = PublishedOrderRecord {
            fingerprint: fingerprint.as_str().to_string(),
            source_chat_id: raw.chat_id,
            source_message_id: raw.message_id,
            post_ref: post.clone(),
            status: OrderStatus::New,
            content_hash: content_hash.to_string(),
            created_at: now,
            updated_at: now,
        };
        if let Err(e) =
            with_timeout(self.settings.store_timeout, self.store.upsert_record(&record)).await
        {
            // The reservation is left to expire so a repost within its TTL
            // is still blocked.
            error!(
                fingerprint = %fingerprint,
                post_chat = %post.chat,
                post_id = post.message_id,
                error = %e,
                "Published but failed to record order"
            );
            return Err(PipelineError::Persist(e));
        }
        self.release(fingerprint).await;

        info!(
            event = "publish",
            chat_id = raw.chat_id,
            message_id = raw.message_id,
            fingerprint = %fingerprint,
            post_chat = %post.chat,
            post_id = post.message_id,
            region = region_tag,
            "Order published"
        );
        Ok(post)
    }

    /// Edit the post behind `record` with the new content. The record only
    /// advances when the edit succeeds.
    pub async fn publish_update(
        &self,
        msg: &NormalizedMessage,
        record: &PublishedOrderRecord,
        content_hash: &str,
        region_tag: &str,
        config: &RuntimeConfig,
    ) -> Result<PostRef, PipelineError> {
        let raw = &msg.raw;
        let text = format_publish_message(
            &raw.text,
            raw.source_link().as_deref(),
            region_tag,
            OrderStatus::Updated,
        );

        tokio::time::sleep(config.human_delay()).await;
        let post = &record.post_ref;
        let result = self
            .with_retries("publish_edit", || self.publisher.edit_existing(post, &text))
            .await;

        if let Err((attempts, e)) = result {
            self.log_action(
                raw.chat_id,
                raw.message_id,
                ActionType::PublishEdit,
                ActionStatus::Error,
            )
            .await;
            error!(
                event = "publish_failed",
                chat_id = raw.chat_id,
                message_id = raw.message_id,
                fingerprint = %record.fingerprint,
                attempts,
                kind = e.kind(),
                error = %e,
                "Post edit failed"
            );
            return Err(PipelineError::Publish {
                attempts,
                source: e,
            });
        }

        self.log_action(
            raw.chat_id,
            raw.message_id,
            ActionType::PublishEdit,
            ActionStatus::Ok,
        )
        .await;

        let updated = PublishedOrderRecord {
            status: OrderStatus::Updated,
            content_hash: content_hash.to_string(),
            updated_at: Utc::now(),
            ..record.clone()
        };
        with_timeout(self.settings.store_timeout, self.store.upsert_record(&updated))
            .await
            .map_err(PipelineError::Persist)?;

        info!(
            event = "publish_edit",
            chat_id = raw.chat_id,
            message_id = raw.message_id,
            fingerprint = %record.fingerprint,
            post_chat = %post.chat,
            post_id = post.message_id,
            "Order post updated"
        );
        Ok(post.clone())
    }

    /// Send the confirmation reply when enabled and within the reply cap.
    /// Returns whether a reply went out.
    pub async fn maybe_reply(&self, msg: &NormalizedMessage, config: &RuntimeConfig) -> bool {
        if !config.reply_enabled {
            return false;
        }
        let raw = &msg.raw;
        match self.cooldown.allow_reply(raw.chat_id, config).await {
            Ok(decision) if decision.is_allowed() => {}
            Ok(_) => return false,
            Err(e) => {
                warn!(chat_id = raw.chat_id, error = %e, "Reply rate check failed, not replying");
                return false;
            }
        }

        tokio::time::sleep(config.human_delay()).await;
        let sent = tokio::time::timeout(
            self.settings.publish_timeout,
            self.publisher.reply(raw.chat_id, raw.message_id, REPLY_TEXT),
        )
        .await
        .unwrap_or(Err(PublishError::Timeout(self.settings.publish_timeout)));

        match sent {
            Ok(()) => {
                self.log_action(raw.chat_id, raw.message_id, ActionType::Reply, ActionStatus::Ok)
                    .await;
                true
            }
            Err(e) => {
                warn!(chat_id = raw.chat_id, message_id = raw.message_id, error = %e, "Reply failed");
                self.log_action(raw.chat_id, raw.message_id, ActionType::Reply, ActionStatus::Error)
                    .await;
                false
            }
        }
    }

    /// Run `call` with a per-attempt timeout, retrying transient failures
    /// with exponential backoff. Errors carry the number of attempts made.
    async fn with_retries<T, F, Fut>(&self, op: &str, mut call: F) -> Result<T, (u32, PublishError)>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PublishError>>,
    {
        let max_attempts = self.settings.max_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = tokio::time::timeout(self.settings.publish_timeout, call())
                .await
                .unwrap_or(Err(PublishError::Timeout(self.settings.publish_timeout)));

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let backoff = self
                        .settings
                        .backoff
                        .saturating_mul(1u32 << (attempt - 1).min(10));
                    let delay = match &e {
                        PublishError::Transient {
                            retry_after: Some(wait),
                            ..
                        } => (*wait).max(backoff),
                        _ => backoff,
                    };
                    warn!(
                        op,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient publish failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err((attempt, e)),
            }
        }
    }

    async fn release(&self, fingerprint: &OrderFingerprint) {
        if let Err(e) = self.resolver.release(fingerprint).await {
            warn!(fingerprint = %fingerprint, error = %e, "Failed to release reservation");
        }
    }

    async fn log_action(
        &self,
        chat_id: i64,
        message_id: i64,
        action: ActionType,
        status: ActionStatus,
    ) {
        let write = self.store.insert_action(chat_id, message_id, action, status);
        if let Err(e) = with_timeout(self.settings.store_timeout, write).await {
            warn!(
                chat_id,
                message_id,
                action = action.as_str(),
                error = %e,
                "Failed to write action log"
            );
        }
    }
}
