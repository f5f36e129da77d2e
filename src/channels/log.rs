//! Log-only publisher used when no bot token is configured.

use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;

use crate::error::PublishError;
use crate::pipeline::types::{ChannelPublisher, PostRef};
use crate::text::preview;

/// Writes would-be posts to the log and hands out sequential post ids.
#[derive(Default)]
pub struct LogPublisher {
    next_id: AtomicI64,
}

impl LogPublisher {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChannelPublisher for LogPublisher {
    fn name(&self) -> &str {
        "log"
    }

    async fn publish_new(&self, target: &str, text: &str) -> Result<PostRef, PublishError> {
        let message_id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::info!(target_chat = target, message_id, text = %preview(text, 200), "Post (log only)");
        Ok(PostRef {
            chat: target.to_string(),
            message_id,
        })
    }

    async fn edit_existing(&self, post: &PostRef, text: &str) -> Result<(), PublishError> {
        tracing::info!(
            target_chat = %post.chat,
            message_id = post.message_id,
            text = %preview(text, 200),
            "Edit (log only)"
        );
        Ok(())
    }

    async fn reply(&self, chat_id: i64, message_id: i64, text: &str) -> Result<(), PublishError> {
        tracing::info!(chat_id, message_id, text, "Reply (log only)");
        Ok(())
    }
}
