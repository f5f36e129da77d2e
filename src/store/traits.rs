//! `OrderStore` trait — the single async interface for relay persistence.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DatabaseError;
use crate::pipeline::types::PostRef;
use crate::rules::RuleKind;

/// Lifecycle status of a published order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    /// Published once, never edited.
    New,
    /// The destination post was edited after a source edit or repost.
    Updated,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Updated => "updated",
        }
    }

    /// Parse a stored status; unknown values read as `New`.
    pub fn parse(s: &str) -> Self {
        match s {
            "updated" => Self::Updated,
            _ => Self::New,
        }
    }
}

/// One row per logical order that reached the destination channel.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedOrderRecord {
    pub fingerprint: String,
    pub source_chat_id: i64,
    pub source_message_id: i64,
    pub post_ref: PostRef,
    pub status: OrderStatus,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Result of an atomic fixed-window increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCheck {
    /// Whether the increment fit under the limit (it is refunded when not).
    pub allowed: bool,
    /// Count in the current window after the operation.
    pub count: i64,
    /// Time until the current window resets.
    pub retry_after: Duration,
    /// Unix seconds at which the current window opened.
    pub window_start: i64,
}

/// Kind of outbound action recorded in the action log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionType {
    Publish,
    PublishEdit,
    Reply,
    Join,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Publish => "publish",
            Self::PublishEdit => "publish_edit",
            Self::Reply => "reply",
            Self::Join => "join",
        }
    }
}

/// Outcome recorded with each action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionStatus {
    Ok,
    Error,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
        }
    }
}

/// Aggregate counters over the action log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActionStats {
    pub published_1h: i64,
    pub published_24h: i64,
    pub edited_24h: i64,
    pub errors_24h: i64,
}

/// Backend-agnostic persistence for dedup records, rate windows, the action
/// log, keyword rules and runtime configuration.
#[async_trait]
pub trait OrderStore: Send + Sync {
    // ── Dedup ───────────────────────────────────────────────────────

    /// Atomically claim `fingerprint` for `ttl`.
    ///
    /// Returns `false` when another live reservation already holds it.
    async fn reserve_fingerprint(
        &self,
        fingerprint: &str,
        ttl: Duration,
    ) -> Result<bool, DatabaseError>;

    /// Drop a reservation. Releasing an unknown fingerprint is a no-op.
    async fn release_fingerprint(&self, fingerprint: &str) -> Result<(), DatabaseError>;

    /// Fetch the published record for a fingerprint.
    async fn get_record(
        &self,
        fingerprint: &str,
    ) -> Result<Option<PublishedOrderRecord>, DatabaseError>;

    /// Insert or replace the published record for `record.fingerprint`.
    async fn upsert_record(&self, record: &PublishedOrderRecord) -> Result<(), DatabaseError>;

    // ── Rate windows ────────────────────────────────────────────────

    /// Atomically increment the fixed window for `key`, resetting it when
    /// `window` has elapsed. An increment that would exceed `limit` is
    /// undone and reported as not allowed.
    async fn increment_and_check(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
    ) -> Result<WindowCheck, DatabaseError>;

    /// Refund one unit from the window for `key`, but only while the window
    /// that opened at `window_start` is still the current one.
    async fn decrement_window(&self, key: &str, window_start: i64) -> Result<(), DatabaseError>;

    // ── Action log ──────────────────────────────────────────────────

    /// Append an action log entry.
    async fn insert_action(
        &self,
        chat_id: i64,
        message_id: i64,
        action: ActionType,
        status: ActionStatus,
    ) -> Result<(), DatabaseError>;

    /// Publish/edit/error counters for the last hour and day.
    async fn action_stats(&self) -> Result<ActionStats, DatabaseError>;

    // ── Keyword rules ───────────────────────────────────────────────

    /// All stored keyword rules. Rows with an unknown kind are skipped.
    async fn fetch_keyword_rules(&self) -> Result<Vec<(RuleKind, String)>, DatabaseError>;

    /// Insert a keyword rule. Returns `false` when it already existed.
    async fn upsert_keyword_rule(&self, kind: RuleKind, value: &str)
    -> Result<bool, DatabaseError>;

    /// Delete a keyword rule. Returns `false` when it did not exist.
    async fn delete_keyword_rule(&self, kind: RuleKind, value: &str)
    -> Result<bool, DatabaseError>;

    /// Number of stored keyword rules.
    async fn count_keyword_rules(&self) -> Result<i64, DatabaseError>;

    // ── Runtime config ──────────────────────────────────────────────

    /// All stored runtime config overrides as raw `(key, value)` pairs.
    async fn fetch_runtime_config(&self) -> Result<Vec<(String, String)>, DatabaseError>;

    /// Persist a runtime config override.
    async fn upsert_runtime_config(&self, key: &str, value: &str) -> Result<(), DatabaseError>;
}

/// Bound a store call by `limit`, mapping elapsed time to
/// [`DatabaseError::Timeout`].
pub async fn with_timeout<T, F>(limit: Duration, fut: F) -> Result<T, DatabaseError>
where
    F: Future<Output = Result<T, DatabaseError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(DatabaseError::Timeout(limit)),
    }
}
