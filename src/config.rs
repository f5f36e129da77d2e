//! Configuration types.
//!
//! [`Settings`] is read once from the environment at startup. [`RuntimeConfig`]
//! holds the operator-tunable knobs; it is persisted and swapped as an
//! immutable snapshot by [`RuntimeConfigService`].

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::{info, warn};

use crate::error::{ConfigError, Error};
use crate::pipeline::workers::ShutdownMode;
use crate::store::OrderStore;

/// Process settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Path of the libSQL database file.
    pub db_path: PathBuf,
    /// Bot API token for the destination channel. Without one, posts are
    /// only logged.
    pub telegram_bot_token: Option<secrecy::SecretString>,
    /// Number of worker tasks.
    pub worker_count: usize,
    /// Capacity of the bounded ingestion queue.
    pub queue_max_size: usize,
    /// How long an idle worker waits for a message before re-checking for
    /// shutdown.
    pub worker_poll_timeout: Duration,
    /// What happens to queued messages on shutdown.
    pub shutdown_mode: ShutdownMode,
    /// Keyword rule reload interval.
    pub rules_refresh: Duration,
    /// Per-attempt timeout for outbound calls.
    pub publish_timeout: Duration,
    /// Attempts per outbound action, including the first.
    pub publish_max_attempts: u32,
    /// Base delay for exponential backoff between attempts.
    pub publish_backoff: Duration,
    /// Lifetime of a fingerprint reservation.
    pub reservation_ttl: Duration,
    /// How long a published order stays eligible for edit/dedup.
    pub dedup_window: Duration,
    /// Upper bound for any single store call on the hot path.
    pub store_timeout: Duration,
    /// Seed values for the runtime config before stored overrides apply.
    pub runtime: RuntimeConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/taxi-relay.db"),
            telegram_bot_token: None,
            worker_count: 4,
            queue_max_size: 2000,
            worker_poll_timeout: Duration::from_millis(1000),
            shutdown_mode: ShutdownMode::Drain,
            rules_refresh: Duration::from_secs(300),
            publish_timeout: Duration::from_secs(15),
            publish_max_attempts: 3,
            publish_backoff: Duration::from_millis(500),
            reservation_ttl: Duration::from_secs(120),
            dedup_window: Duration::from_secs(24 * 3600),
            store_timeout: Duration::from_secs(5),
            runtime: RuntimeConfig::default(),
        }
    }
}

impl Settings {
    /// Read settings from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut settings = Self::default();

        if let Some(path) = get("TAXI_RELAY_DB_PATH") {
            settings.db_path = PathBuf::from(path);
        }
        settings.telegram_bot_token = get("TELEGRAM_BOT_TOKEN").map(secrecy::SecretString::from);

        if let Some(raw) = get("WORKER_COUNT") {
            settings.worker_count = parse_ranged("WORKER_COUNT", &raw, 1, 256)?;
        }
        if let Some(raw) = get("QUEUE_MAX_SIZE") {
            settings.queue_max_size = parse_ranged("QUEUE_MAX_SIZE", &raw, 1, 1_000_000)?;
        }
        if let Some(raw) = get("WORKER_POLL_TIMEOUT_MS") {
            settings.worker_poll_timeout =
                Duration::from_millis(parse_ranged("WORKER_POLL_TIMEOUT_MS", &raw, 10, 60_000)?);
        }
        if let Some(raw) = get("SHUTDOWN_MODE") {
            settings.shutdown_mode = raw.parse()?;
        }
        if let Some(raw) = get("RULES_REFRESH_SECS") {
            settings.rules_refresh =
                Duration::from_secs(parse_ranged("RULES_REFRESH_SECS", &raw, 1, 86_400)?);
        }
        if let Some(raw) = get("PUBLISH_TIMEOUT_SECS") {
            settings.publish_timeout =
                Duration::from_secs(parse_ranged("PUBLISH_TIMEOUT_SECS", &raw, 1, 300)?);
        }
        if let Some(raw) = get("PUBLISH_MAX_ATTEMPTS") {
            settings.publish_max_attempts = parse_ranged("PUBLISH_MAX_ATTEMPTS", &raw, 1, 10)?;
        }
        if let Some(raw) = get("PUBLISH_BACKOFF_MS") {
            settings.publish_backoff =
                Duration::from_millis(parse_ranged("PUBLISH_BACKOFF_MS", &raw, 0, 60_000)?);
        }
        if let Some(raw) = get("RESERVATION_TTL_SECS") {
            settings.reservation_ttl =
                Duration::from_secs(parse_ranged("RESERVATION_TTL_SECS", &raw, 1, 3600)?);
        }
        if let Some(raw) = get("DEDUP_WINDOW_HOURS") {
            let hours: u64 = parse_ranged("DEDUP_WINDOW_HOURS", &raw, 1, 24 * 30)?;
            settings.dedup_window = Duration::from_secs(hours * 3600);
        }
        if let Some(raw) = get("STORE_TIMEOUT_MS") {
            settings.store_timeout =
                Duration::from_millis(parse_ranged("STORE_TIMEOUT_MS", &raw, 10, 60_000)?);
        }

        for key in RUNTIME_CONFIG_KEYS {
            if let Some(raw) = get(&key.to_ascii_uppercase()) {
                settings.runtime.apply(key, &raw)?;
            }
        }
        settings.runtime.check_delays()?;

        Ok(settings)
    }
}

fn parse_ranged<T>(key: &str, raw: &str, min: T, max: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr + PartialOrd + std::fmt::Display + Copy,
{
    let value: T = raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("'{raw}' is not a number"),
    })?;
    if value < min || value > max {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{value} is outside {min}..={max}"),
        });
    }
    Ok(value)
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("'{raw}' is not a boolean"),
        }),
    }
}

// ── Runtime config ──────────────────────────────────────────────────

/// Keys accepted by [`RuntimeConfig::apply`] and the `runtime_config` table.
pub const RUNTIME_CONFIG_KEYS: &[&str] = &[
    "forward_target",
    "min_text_length",
    "per_group_actions_hour",
    "per_group_replies_10m",
    "join_limit_day",
    "global_actions_minute",
    "min_human_delay_ms",
    "max_human_delay_ms",
    "require_contact",
    "offer_override",
    "reply_enabled",
    "default_region_tag",
];

/// Operator-tunable configuration, read by every stage as one snapshot.
///
/// Rate caps of 0 mean unlimited.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    pub version: u64,
    /// Destination channel (`@channel`, numeric id, or `me`).
    pub forward_target: String,
    /// Minimum canonical length for messages without a strong request pattern.
    pub min_text_length: usize,
    pub per_group_actions_hour: u32,
    pub per_group_replies_10m: u32,
    pub join_limit_day: u32,
    pub global_actions_minute: u32,
    pub min_human_delay_ms: u64,
    pub max_human_delay_ms: u64,
    /// Reject accepted-by-keyword messages that carry no phone or @handle.
    pub require_contact: bool,
    /// Reject "I am going/driving" phrasing before any accept branch.
    pub offer_override: bool,
    /// Send a confirmation reply in the source group after publishing.
    pub reply_enabled: bool,
    /// Hashtag used when no region is detected.
    pub default_region_tag: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            version: 0,
            forward_target: "me".to_string(),
            min_text_length: 18,
            per_group_actions_hour: 15,
            per_group_replies_10m: 3,
            join_limit_day: 2,
            global_actions_minute: 25,
            min_human_delay_ms: 1800,
            max_human_delay_ms: 6200,
            require_contact: false,
            offer_override: true,
            reply_enabled: false,
            default_region_tag: "#Uzbekiston".to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Parse and assign one key. Does not check cross-field constraints.
    pub fn apply(&mut self, key: &str, raw: &str) -> Result<(), ConfigError> {
        let raw = raw.trim();
        match key {
            "forward_target" => {
                if raw.is_empty() || raw.len() > 120 {
                    return Err(ConfigError::InvalidValue {
                        key: key.to_string(),
                        message: "must be 1..=120 characters".into(),
                    });
                }
                self.forward_target = raw.to_string();
            }
            "min_text_length" => self.min_text_length = parse_ranged(key, raw, 4, 300)?,
            "per_group_actions_hour" => self.per_group_actions_hour = parse_ranged(key, raw, 0, 1000)?,
            "per_group_replies_10m" => self.per_group_replies_10m = parse_ranged(key, raw, 0, 30)?,
            "join_limit_day" => self.join_limit_day = parse_ranged(key, raw, 0, 20)?,
            "global_actions_minute" => self.global_actions_minute = parse_ranged(key, raw, 0, 1000)?,
            "min_human_delay_ms" => self.min_human_delay_ms = parse_ranged(key, raw, 0, 60_000)?,
            "max_human_delay_ms" => self.max_human_delay_ms = parse_ranged(key, raw, 0, 60_000)?,
            "require_contact" => self.require_contact = parse_bool(key, raw)?,
            "offer_override" => self.offer_override = parse_bool(key, raw)?,
            "reply_enabled" => self.reply_enabled = parse_bool(key, raw)?,
            "default_region_tag" => {
                if !raw.starts_with('#') || raw.len() < 2 || raw.contains(char::is_whitespace) {
                    return Err(ConfigError::InvalidValue {
                        key: key.to_string(),
                        message: "must be a single #hashtag".into(),
                    });
                }
                self.default_region_tag = raw.to_string();
            }
            other => return Err(ConfigError::UnknownKey(other.to_string())),
        }
        Ok(())
    }

    fn check_delays(&self) -> Result<(), ConfigError> {
        if self.max_human_delay_ms < self.min_human_delay_ms {
            return Err(ConfigError::InvalidValue {
                key: "max_human_delay_ms".into(),
                message: "must be >= min_human_delay_ms".into(),
            });
        }
        Ok(())
    }

    /// Canonical text form of a key's current value, as stored.
    pub fn value_of(&self, key: &str) -> Option<String> {
        let value = match key {
            "forward_target" => self.forward_target.clone(),
            "min_text_length" => self.min_text_length.to_string(),
            "per_group_actions_hour" => self.per_group_actions_hour.to_string(),
            "per_group_replies_10m" => self.per_group_replies_10m.to_string(),
            "join_limit_day" => self.join_limit_day.to_string(),
            "global_actions_minute" => self.global_actions_minute.to_string(),
            "min_human_delay_ms" => self.min_human_delay_ms.to_string(),
            "max_human_delay_ms" => self.max_human_delay_ms.to_string(),
            "require_contact" => self.require_contact.to_string(),
            "offer_override" => self.offer_override.to_string(),
            "reply_enabled" => self.reply_enabled.to_string(),
            "default_region_tag" => self.default_region_tag.clone(),
            _ => return None,
        };
        Some(value)
    }

    /// Random pause before an outbound action, within the configured range.
    pub fn human_delay(&self) -> Duration {
        use rand::Rng;
        let (lo, hi) = (self.min_human_delay_ms, self.max_human_delay_ms);
        let ms = if hi > lo {
            rand::thread_rng().gen_range(lo..=hi)
        } else {
            lo
        };
        Duration::from_millis(ms)
    }
}

/// Owns the live [`RuntimeConfig`] snapshot and persists changes.
pub struct RuntimeConfigService {
    store: Arc<dyn OrderStore>,
    current: RwLock<Arc<RuntimeConfig>>,
    write_lock: tokio::sync::Mutex<()>,
}

impl RuntimeConfigService {
    /// Create a service serving `seed` until [`initialize`](Self::initialize).
    pub fn new(store: Arc<dyn OrderStore>, seed: RuntimeConfig) -> Arc<Self> {
        Arc::new(Self {
            store,
            current: RwLock::new(Arc::new(seed)),
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Layer stored overrides on top of the seed. Unknown keys and invalid
    /// values are skipped with a warning.
    pub async fn initialize(&self) -> Result<Arc<RuntimeConfig>, Error> {
        let _guard = self.write_lock.lock().await;
        let mut next = (*self.snapshot()).clone();

        for (key, raw) in self.store.fetch_runtime_config().await? {
            let mut candidate = next.clone();
            match candidate.apply(&key, &raw).and_then(|()| candidate.check_delays()) {
                Ok(()) => next = candidate,
                Err(e) => warn!(key = %key, value = %raw, error = %e, "Skipping stored runtime config value"),
            }
        }

        next.version += 1;
        let next = Arc::new(next);
        self.swap(Arc::clone(&next));
        info!(version = next.version, "Runtime config loaded");
        Ok(next)
    }

    /// Current snapshot. Cheap: clones an `Arc`.
    pub fn snapshot(&self) -> Arc<RuntimeConfig> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    fn swap(&self, next: Arc<RuntimeConfig>) {
        match self.current.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }

    /// Validate, persist and publish a new value for `key`.
    pub async fn set_value(&self, key: &str, raw: &str) -> Result<Arc<RuntimeConfig>, Error> {
        let _guard = self.write_lock.lock().await;
        let mut next = (*self.snapshot()).clone();
        next.apply(key, raw)?;
        next.check_delays()?;

        let stored = next.value_of(key).unwrap_or_else(|| raw.trim().to_string());
        self.store.upsert_runtime_config(key, &stored).await?;

        next.version += 1;
        let next = Arc::new(next);
        self.swap(Arc::clone(&next));
        info!(key, value = %stored, version = next.version, "Runtime config updated");
        Ok(next)
    }

    /// All keys with their current values.
    pub fn list(&self) -> BTreeMap<&'static str, String> {
        let snapshot = self.snapshot();
        RUNTIME_CONFIG_KEYS
            .iter()
            .filter_map(|key| snapshot.value_of(key).map(|v| (*key, v)))
            .collect()
    }
}
