//! Shared types for the order relay pipeline.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PublishError;
use crate::text::normalize;

// ── Inbound message ─────────────────────────────────────────────────

/// A chat message as delivered by the ingestion collaborator.
///
/// Delivery is at-least-once: the same `(chat_id, message_id)` recurs when
/// the author edits the message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawMessage {
    /// Source group/channel identifier.
    pub chat_id: i64,
    /// Message identifier within the source chat.
    pub message_id: i64,
    /// Author, when the transport exposes it.
    #[serde(default)]
    pub sender_id: Option<i64>,
    /// Raw message text.
    #[serde(default)]
    pub text: String,
    /// When the message was sent (or edited).
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    /// True when this delivery is an edit of an earlier message.
    #[serde(default)]
    pub is_edit: bool,
    /// Public @username of the source chat, if any.
    #[serde(default)]
    pub chat_username: Option<String>,
    /// Display title of the source chat, if any.
    #[serde(default)]
    pub chat_title: Option<String>,
}

impl RawMessage {
    /// Create a message with only the fields the pipeline requires.
    pub fn new(chat_id: i64, message_id: i64, text: &str) -> Self {
        Self {
            chat_id,
            message_id,
            sender_id: None,
            text: text.to_string(),
            timestamp: Utc::now(),
            is_edit: false,
            chat_username: None,
            chat_title: None,
        }
    }

    pub fn with_sender(mut self, sender_id: i64) -> Self {
        self.sender_id = Some(sender_id);
        self
    }

    pub fn with_chat_username(mut self, username: &str) -> Self {
        self.chat_username = Some(username.to_string());
        self
    }

    /// Mark this delivery as an edit with new text.
    pub fn edited(mut self, text: &str) -> Self {
        self.text = text.to_string();
        self.is_edit = true;
        self.timestamp = Utc::now();
        self
    }

    fn clean_username(&self) -> Option<&str> {
        self.chat_username
            .as_deref()
            .map(|u| u.trim().trim_start_matches('@'))
            .filter(|u| !u.is_empty())
    }

    /// Human-readable reference to the source chat for logs.
    pub fn chat_ref(&self) -> String {
        if let Some(username) = self.clean_username() {
            return format!("@{username}");
        }
        match self.chat_title.as_deref().map(str::trim) {
            Some(title) if !title.is_empty() => title.to_string(),
            _ => self.chat_id.to_string(),
        }
    }

    /// Public `t.me` link to the source message, when one can be built.
    ///
    /// Public chats link by username; private supergroups (`-100…` ids)
    /// link through `t.me/c/`.
    pub fn source_link(&self) -> Option<String> {
        if let Some(username) = self.clean_username() {
            return Some(format!("https://t.me/{username}/{}", self.message_id));
        }
        let abs = self.chat_id.unsigned_abs().to_string();
        abs.strip_prefix("100")
            .filter(|rest| !rest.is_empty())
            .map(|rest| format!("https://t.me/c/{rest}/{}", self.message_id))
    }
}

/// A raw message paired with its canonical text.
#[derive(Debug, Clone)]
pub struct NormalizedMessage {
    pub raw: RawMessage,
    pub canonical: String,
}

impl NormalizedMessage {
    pub fn new(raw: RawMessage) -> Self {
        let canonical = normalize(&raw.text);
        Self { raw, canonical }
    }
}

// ── Decision ────────────────────────────────────────────────────────

/// Terminal classification of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Accepted,
    RejectedOffer,
    RejectedSpam,
    RejectedTooShort,
    RejectedNoPattern,
    RejectedOther,
}

impl Verdict {
    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::RejectedOffer => "rejected_offer",
            Self::RejectedSpam => "rejected_spam",
            Self::RejectedTooShort => "rejected_too_short",
            Self::RejectedNoPattern => "rejected_no_pattern",
            Self::RejectedOther => "rejected_other",
        }
    }
}

/// Decision engine output: a verdict plus the reason code that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub verdict: Verdict,
    pub reason: &'static str,
}

impl Decision {
    pub fn new(verdict: Verdict, reason: &'static str) -> Self {
        Self { verdict, reason }
    }

    pub fn is_accepted(&self) -> bool {
        self.verdict == Verdict::Accepted
    }
}

// ── Outbound ────────────────────────────────────────────────────────

/// Reference to a post in the destination channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostRef {
    /// Destination chat (`@channel` or numeric id as text).
    pub chat: String,
    /// Message id of the published post.
    pub message_id: i64,
}

/// Outbound action collaborator — pure I/O, no business logic.
///
/// Dedup, rate limiting and retries live in the pipeline; implementations
/// only translate calls to the chat API and classify failures.
#[async_trait]
pub trait ChannelPublisher: Send + Sync {
    /// Publisher name for logs (e.g. "telegram").
    fn name(&self) -> &str;

    /// Publish a new post to `target`, returning its reference.
    async fn publish_new(&self, target: &str, text: &str) -> Result<PostRef, PublishError>;

    /// Replace the text of an existing post.
    async fn edit_existing(&self, post: &PostRef, text: &str) -> Result<(), PublishError>;

    /// Reply to a message in its source chat.
    async fn reply(&self, chat_id: i64, message_id: i64, text: &str) -> Result<(), PublishError>;
}
