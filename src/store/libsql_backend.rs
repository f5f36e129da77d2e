//! libSQL backend — async `OrderStore` implementation.
//!
//! Supports local file and in-memory databases. Every mutation the pipeline
//! relies on for correctness (reservation, window increment) is a single
//! statement so concurrent workers never interleave inside it.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::pipeline::types::PostRef;
use crate::rules::RuleKind;
use crate::store::migrations;
use crate::store::traits::{
    ActionStats, ActionStatus, ActionType, OrderStatus, OrderStore, PublishedOrderRecord,
    WindowCheck,
};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests and dry runs).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    /// Run all pending schema migrations.
    pub async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp write format. Fixed width, so text comparison
/// orders chronologically.
fn to_db_time(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn duration_secs(d: Duration) -> i64 {
    i64::try_from(d.as_secs()).unwrap_or(i64::MAX)
}

fn row_to_record(row: &libsql::Row) -> Result<PublishedOrderRecord, libsql::Error> {
    let status_str: String = row.get(5)?;
    let created_str: String = row.get(7)?;
    let updated_str: String = row.get(8)?;

    Ok(PublishedOrderRecord {
        fingerprint: row.get(0)?,
        source_chat_id: row.get(1)?,
        source_message_id: row.get(2)?,
        post_ref: PostRef {
            chat: row.get(3)?,
            message_id: row.get(4)?,
        },
        status: OrderStatus::parse(&status_str),
        content_hash: row.get(6)?,
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

// ── Trait implementation ────────────────────────────────────────────

const RECORD_COLUMNS: &str = "fingerprint, source_chat_id, source_message_id, post_chat, post_message_id, status, content_hash, created_at, updated_at";

#[async_trait]
impl OrderStore for LibSqlBackend {
    // ── Dedup ───────────────────────────────────────────────────────

    async fn reserve_fingerprint(
        &self,
        fingerprint: &str,
        ttl: Duration,
    ) -> Result<bool, DatabaseError> {
        let now = Utc::now().timestamp();
        let expires_at = now.saturating_add(duration_secs(ttl));

        // Insert, or take over a reservation whose TTL has lapsed.
        let changed = self
            .conn()
            .execute(
                "INSERT INTO fingerprint_reservations (fingerprint, expires_at)
                 VALUES (?1, ?2)
                 ON CONFLICT(fingerprint) DO UPDATE SET expires_at = excluded.expires_at
                 WHERE fingerprint_reservations.expires_at <= ?3",
                params![fingerprint, expires_at, now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("reserve_fingerprint: {e}")))?;

        debug!(fingerprint, reserved = changed > 0, "Fingerprint reservation");
        Ok(changed > 0)
    }

    async fn release_fingerprint(&self, fingerprint: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "DELETE FROM fingerprint_reservations WHERE fingerprint = ?1",
                params![fingerprint],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("release_fingerprint: {e}")))?;
        Ok(())
    }

    async fn get_record(
        &self,
        fingerprint: &str,
    ) -> Result<Option<PublishedOrderRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {RECORD_COLUMNS} FROM published_orders WHERE fingerprint = ?1"),
                params![fingerprint],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_record: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let record = row_to_record(&row)
                    .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
                Ok(Some(record))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_record: {e}"))),
        }
    }

    async fn upsert_record(&self, record: &PublishedOrderRecord) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO published_orders (fingerprint, source_chat_id, source_message_id,
                    post_chat, post_message_id, status, content_hash, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(fingerprint) DO UPDATE SET
                    source_chat_id = excluded.source_chat_id,
                    source_message_id = excluded.source_message_id,
                    post_chat = excluded.post_chat,
                    post_message_id = excluded.post_message_id,
                    status = excluded.status,
                    content_hash = excluded.content_hash,
                    created_at = excluded.created_at,
                    updated_at = excluded.updated_at",
                params![
                    record.fingerprint.as_str(),
                    record.source_chat_id,
                    record.source_message_id,
                    record.post_ref.chat.as_str(),
                    record.post_ref.message_id,
                    record.status.as_str(),
                    record.content_hash.as_str(),
                    to_db_time(record.created_at),
                    to_db_time(record.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_record: {e}")))?;

        debug!(
            fingerprint = %record.fingerprint,
            status = record.status.as_str(),
            "Published record stored"
        );
        Ok(())
    }

    // ── Rate windows ────────────────────────────────────────────────

    async fn increment_and_check(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
    ) -> Result<WindowCheck, DatabaseError> {
        let now = Utc::now().timestamp();
        let window_secs = duration_secs(window).max(1);

        // SET expressions all read the pre-update row.
        let mut rows = self
            .conn()
            .query(
                "INSERT INTO rate_windows (key, window_start, count) VALUES (?1, ?2, 1)
                 ON CONFLICT(key) DO UPDATE SET
                    count = CASE WHEN rate_windows.window_start + ?3 <= ?2
                                 THEN 1 ELSE rate_windows.count + 1 END,
                    window_start = CASE WHEN rate_windows.window_start + ?3 <= ?2
                                        THEN ?2 ELSE rate_windows.window_start END
                 RETURNING count, window_start",
                params![key, now, window_secs],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("increment_and_check: {e}")))?;

        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("increment_and_check: {e}")))?
            .ok_or_else(|| DatabaseError::Query("increment_and_check: no row returned".into()))?;
        let count: i64 = row
            .get(0)
            .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
        let window_start: i64 = row
            .get(1)
            .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
        drop(rows);

        let remaining = (window_start + window_secs - now).max(0);
        let retry_after = Duration::from_secs(remaining.unsigned_abs());

        if count > i64::from(limit) {
            self.decrement_window(key, window_start).await?;
            return Ok(WindowCheck {
                allowed: false,
                count: count - 1,
                retry_after,
                window_start,
            });
        }

        Ok(WindowCheck {
            allowed: true,
            count,
            retry_after,
            window_start,
        })
    }

    async fn decrement_window(&self, key: &str, window_start: i64) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE rate_windows SET count = MAX(count - 1, 0)
                 WHERE key = ?1 AND window_start = ?2",
                params![key, window_start],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("decrement_window: {e}")))?;
        Ok(())
    }

    // ── Action log ──────────────────────────────────────────────────

    async fn insert_action(
        &self,
        chat_id: i64,
        message_id: i64,
        action: ActionType,
        status: ActionStatus,
    ) -> Result<(), DatabaseError> {
        let id = Uuid::new_v4().to_string();
        self.conn()
            .execute(
                "INSERT INTO action_log (id, chat_id, message_id, action_type, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id,
                    chat_id,
                    message_id,
                    action.as_str(),
                    status.as_str(),
                    to_db_time(Utc::now()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_action: {e}")))?;
        Ok(())
    }

    async fn action_stats(&self) -> Result<ActionStats, DatabaseError> {
        let now = Utc::now();
        let hour_ago = to_db_time(now - chrono::Duration::hours(1));
        let day_ago = to_db_time(now - chrono::Duration::hours(24));

        let mut rows = self
            .conn()
            .query(
                "SELECT
                    COALESCE(SUM(CASE WHEN action_type = 'publish' AND status = 'ok'
                                       AND created_at >= ?1 THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN action_type = 'publish' AND status = 'ok'
                                      THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN action_type = 'publish_edit' AND status = 'ok'
                                      THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN status = 'error' THEN 1 ELSE 0 END), 0)
                 FROM action_log WHERE created_at >= ?2",
                params![hour_ago, day_ago],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("action_stats: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let get = |i: i32| {
                    row.get::<i64>(i)
                        .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))
                };
                Ok(ActionStats {
                    published_1h: get(0)?,
                    published_24h: get(1)?,
                    edited_24h: get(2)?,
                    errors_24h: get(3)?,
                })
            }
            Ok(None) => Ok(ActionStats::default()),
            Err(e) => Err(DatabaseError::Query(format!("action_stats: {e}"))),
        }
    }

    // ── Keyword rules ───────────────────────────────────────────────

    async fn fetch_keyword_rules(&self) -> Result<Vec<(RuleKind, String)>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT kind, value FROM keyword_rules ORDER BY kind, value",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("fetch_keyword_rules: {e}")))?;

        let mut rules = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("fetch_keyword_rules: {e}")))?
        {
            let kind: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
            let value: String = row
                .get(1)
                .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
            match kind.parse::<RuleKind>() {
                Ok(kind) => rules.push((kind, value)),
                Err(_) => warn!(kind = %kind, value = %value, "Skipping keyword rule with unknown kind"),
            }
        }
        Ok(rules)
    }

    async fn upsert_keyword_rule(
        &self,
        kind: RuleKind,
        value: &str,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO keyword_rules (kind, value, created_at) VALUES (?1, ?2, ?3)",
                params![kind.as_str(), value, to_db_time(Utc::now())],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_keyword_rule: {e}")))?;
        Ok(changed > 0)
    }

    async fn delete_keyword_rule(
        &self,
        kind: RuleKind,
        value: &str,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "DELETE FROM keyword_rules WHERE kind = ?1 AND value = ?2",
                params![kind.as_str(), value],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_keyword_rule: {e}")))?;
        Ok(changed > 0)
    }

    async fn count_keyword_rules(&self) -> Result<i64, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT COUNT(*) FROM keyword_rules", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("count_keyword_rules: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row
                .get::<i64>(0)
                .map_err(|e| DatabaseError::Query(format!("row parse: {e}"))),
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("count_keyword_rules: {e}"))),
        }
    }

    // ── Runtime config ──────────────────────────────────────────────

    async fn fetch_runtime_config(&self) -> Result<Vec<(String, String)>, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT key, value FROM runtime_config ORDER BY key", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("fetch_runtime_config: {e}")))?;

        let mut pairs = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("fetch_runtime_config: {e}")))?
        {
            let key: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
            let value: String = row
                .get(1)
                .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
            pairs.push((key, value));
        }
        Ok(pairs)
    }

    async fn upsert_runtime_config(&self, key: &str, value: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO runtime_config (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value,
                    updated_at = excluded.updated_at",
                params![key, value, to_db_time(Utc::now())],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_runtime_config: {e}")))?;
        Ok(())
    }
}
