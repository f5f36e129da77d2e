//! Rate and cooldown limits for outbound actions.
//!
//! Every scope is a window with a capacity taken from the runtime config.
//! A capacity of zero disables the scope. Multi-scope checks are
//! all-or-nothing: either every scope records the action or none does.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::RuntimeConfig;
use crate::error::{DatabaseError, PipelineError};
use crate::store::{OrderStore, with_timeout};

/// A rate-limited resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Publishes/edits attributed to one source group, per hour.
    GroupAction(i64),
    /// All publishes/edits, per minute.
    Global,
    /// Confirmation replies into one source group, per 10 minutes.
    GroupReply(i64),
    /// Group joins by the account, per day.
    AccountJoin,
}

impl Scope {
    pub fn window(&self) -> Duration {
        match self {
            Self::GroupAction(_) => Duration::from_secs(3600),
            Self::Global => Duration::from_secs(60),
            Self::GroupReply(_) => Duration::from_secs(600),
            Self::AccountJoin => Duration::from_secs(24 * 3600),
        }
    }

    /// Storage key for the window counter.
    pub fn key(&self) -> String {
        match self {
            Self::GroupAction(chat) => format!("chat:{chat}:action:publish"),
            Self::Global => "global:action:publish".to_string(),
            Self::GroupReply(chat) => format!("chat:{chat}:action:reply"),
            Self::AccountJoin => "account:join".to_string(),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// One scope to charge, with its capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitRequest {
    pub scope: Scope,
    pub capacity: u32,
}

impl LimitRequest {
    pub fn new(scope: Scope, capacity: u32) -> Self {
        Self { scope, capacity }
    }

    fn unlimited(&self) -> bool {
        self.capacity == 0
    }
}

/// Outcome of an acquire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Denied { scope: Scope, retry_after: Duration },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Window counter backend.
#[async_trait]
pub trait WindowLimiter: Send + Sync {
    /// Charge one unit to every requested scope, or to none of them.
    async fn acquire(&self, requests: &[LimitRequest]) -> Result<RateDecision, DatabaseError>;
}

// ── In-memory rolling window ────────────────────────────────────────

/// Rolling windows kept in process memory. Suitable for a single instance.
#[derive(Default)]
pub struct InMemoryWindowLimiter {
    windows: Mutex<HashMap<Scope, VecDeque<Instant>>>,
}

impl InMemoryWindowLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of scopes currently holding at least one charge.
    pub fn tracked_scopes(&self) -> usize {
        match self.windows.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

fn prune(entries: &mut VecDeque<Instant>, window: Duration, now: Instant) {
    // Early after boot the cutoff can underflow; keep everything then.
    if let Some(cutoff) = now.checked_sub(window) {
        while entries.front().is_some_and(|t| *t <= cutoff) {
            entries.pop_front();
        }
    }
}

#[async_trait]
impl WindowLimiter for InMemoryWindowLimiter {
    async fn acquire(&self, requests: &[LimitRequest]) -> Result<RateDecision, DatabaseError> {
        let now = Instant::now();
        let mut windows = match self.windows.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        // Drop every scope whose window has fully drained.
        windows.retain(|scope, entries| {
            prune(entries, scope.window(), now);
            !entries.is_empty()
        });

        for request in requests.iter().filter(|r| !r.unlimited()) {
            let window = request.scope.window();
            let Some(entries) = windows.get(&request.scope) else {
                continue;
            };

            if entries.len() >= request.capacity as usize {
                let retry_after = entries
                    .front()
                    .map(|oldest| (*oldest + window).saturating_duration_since(now))
                    .unwrap_or(window);
                return Ok(RateDecision::Denied {
                    scope: request.scope,
                    retry_after,
                });
            }
        }

        for request in requests.iter().filter(|r| !r.unlimited()) {
            windows.entry(request.scope).or_default().push_back(now);
        }
        Ok(RateDecision::Allowed)
    }
}

// ── Store-backed fixed window ───────────────────────────────────────

/// Fixed windows kept in the shared store, so limits hold across instances.
pub struct StoreWindowLimiter {
    store: Arc<dyn OrderStore>,
    store_timeout: Duration,
}

impl StoreWindowLimiter {
    pub fn new(store: Arc<dyn OrderStore>, store_timeout: Duration) -> Self {
        Self {
            store,
            store_timeout,
        }
    }

    async fn refund(&self, granted: &[(&LimitRequest, i64)]) {
        for (request, window_start) in granted {
            let key = request.scope.key();
            if let Err(e) = with_timeout(
                self.store_timeout,
                self.store.decrement_window(&key, *window_start),
            )
            .await
            {
                warn!(key = %key, error = %e, "Failed to refund rate window");
            }
        }
    }
}

#[async_trait]
impl WindowLimiter for StoreWindowLimiter {
    async fn acquire(&self, requests: &[LimitRequest]) -> Result<RateDecision, DatabaseError> {
        let mut granted: Vec<(&LimitRequest, i64)> = Vec::new();

        for request in requests.iter().filter(|r| !r.unlimited()) {
            let check = with_timeout(
                self.store_timeout,
                self.store.increment_and_check(
                    &request.scope.key(),
                    request.capacity,
                    request.scope.window(),
                ),
            )
            .await;

            match check {
                Ok(check) if check.allowed => granted.push((request, check.window_start)),
                Ok(check) => {
                    self.refund(&granted).await;
                    return Ok(RateDecision::Denied {
                        scope: request.scope,
                        retry_after: check.retry_after,
                    });
                }
                Err(e) => {
                    self.refund(&granted).await;
                    return Err(e);
                }
            }
        }
        Ok(RateDecision::Allowed)
    }
}

// ── Cooldown manager ────────────────────────────────────────────────

/// Maps pipeline actions onto limiter scopes.
pub struct CooldownManager {
    limiter: Arc<dyn WindowLimiter>,
}

impl CooldownManager {
    pub fn new(limiter: Arc<dyn WindowLimiter>) -> Self {
        Self { limiter }
    }

    /// Charge `requests` for `intent`. A denial is logged, not an error.
    pub async fn allow(
        &self,
        requests: &[LimitRequest],
        intent: &str,
    ) -> Result<RateDecision, PipelineError> {
        let decision = self
            .limiter
            .acquire(requests)
            .await
            .map_err(PipelineError::RateLimiter)?;

        match decision {
            RateDecision::Allowed => debug!(intent, "Rate check passed"),
            RateDecision::Denied { scope, retry_after } => warn!(
                event = "rate_denied",
                intent,
                scope = %scope,
                retry_after_secs = retry_after.as_secs(),
                "Rate limit reached"
            ),
        }
        Ok(decision)
    }

    /// Publish or edit on behalf of `chat_id`: per-group and global caps.
    pub async fn allow_publish(
        &self,
        chat_id: i64,
        config: &RuntimeConfig,
    ) -> Result<RateDecision, PipelineError> {
        let requests = [
            LimitRequest::new(Scope::GroupAction(chat_id), config.per_group_actions_hour),
            LimitRequest::new(Scope::Global, config.global_actions_minute),
        ];
        self.allow(&requests, "publish").await
    }

    /// Confirmation reply into `chat_id`.
    pub async fn allow_reply(
        &self,
        chat_id: i64,
        config: &RuntimeConfig,
    ) -> Result<RateDecision, PipelineError> {
        let requests = [LimitRequest::new(
            Scope::GroupReply(chat_id),
            config.per_group_replies_10m,
        )];
        self.allow(&requests, "reply").await
    }

    /// Joining a new source group.
    pub async fn allow_join(&self, config: &RuntimeConfig) -> Result<RateDecision, PipelineError> {
        let requests = [LimitRequest::new(Scope::AccountJoin, config.join_limit_day)];
        self.allow(&requests, "join").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlBackend;

    async fn store_limiter() -> (StoreWindowLimiter, Arc<LibSqlBackend>) {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        (
            StoreWindowLimiter::new(store.clone(), Duration::from_secs(5)),
            store,
        )
    }

    #[test]
    fn scope_keys_and_windows() {
        assert_eq!(Scope::GroupAction(-100).key(), "chat:-100:action:publish");
        assert_eq!(Scope::GroupReply(5).key(), "chat:5:action:reply");
        assert_eq!(Scope::Global.window(), Duration::from_secs(60));
        assert_eq!(Scope::AccountJoin.window(), Duration::from_secs(86400));
    }

    #[tokio::test]
    async fn in_memory_denies_past_capacity() {
        let limiter = InMemoryWindowLimiter::new();
        let request = [LimitRequest::new(Scope::GroupAction(1), 3)];
        for _ in 0..3 {
            assert!(limiter.acquire(&request).await.unwrap().is_allowed());
        }
        match limiter.acquire(&request).await.unwrap() {
            RateDecision::Denied { scope, retry_after } => {
                assert_eq!(scope, Scope::GroupAction(1));
                assert!(retry_after <= Duration::from_secs(3600));
                assert!(retry_after > Duration::from_secs(3500));
            }
            RateDecision::Allowed => panic!("fourth action should be denied"),
        }
        // Other groups are unaffected.
        assert!(
            limiter
                .acquire(&[LimitRequest::new(Scope::GroupAction(2), 3)])
                .await
                .unwrap()
                .is_allowed()
        );
    }

    #[tokio::test]
    async fn zero_capacity_is_unlimited() {
        let limiter = InMemoryWindowLimiter::new();
        let request = [LimitRequest::new(Scope::Global, 0)];
        for _ in 0..100 {
            assert!(limiter.acquire(&request).await.unwrap().is_allowed());
        }

        let (limiter, _) = store_limiter().await;
        for _ in 0..50 {
            assert!(limiter.acquire(&request).await.unwrap().is_allowed());
        }
    }

    #[tokio::test]
    async fn in_memory_is_all_or_nothing() {
        let limiter = InMemoryWindowLimiter::new();
        let global = LimitRequest::new(Scope::Global, 1);
        let group = LimitRequest::new(Scope::GroupAction(1), 5);

        assert!(limiter.acquire(&[group, global]).await.unwrap().is_allowed());
        assert!(!limiter.acquire(&[group, global]).await.unwrap().is_allowed());

        // The denied attempt did not charge the group window.
        let windows = limiter.windows.lock().unwrap();
        assert_eq!(windows[&Scope::GroupAction(1)].len(), 1);
    }

    #[tokio::test]
    async fn in_memory_forgets_drained_scopes() {
        let limiter = InMemoryWindowLimiter::new();
        for chat in 0..50 {
            let request = [LimitRequest::new(Scope::GroupReply(chat), 3)];
            assert!(limiter.acquire(&request).await.unwrap().is_allowed());
        }
        assert_eq!(limiter.tracked_scopes(), 50);

        // Backdate every charge past its window.
        {
            let mut windows = limiter.windows.lock().unwrap();
            for (scope, entries) in windows.iter_mut() {
                let stale = Instant::now()
                    .checked_sub(scope.window() + Duration::from_secs(1))
                    .unwrap();
                for at in entries.iter_mut() {
                    *at = stale;
                }
            }
        }

        let request = [LimitRequest::new(Scope::Global, 10)];
        assert!(limiter.acquire(&request).await.unwrap().is_allowed());
        assert_eq!(limiter.tracked_scopes(), 1);
    }

    #[tokio::test]
    async fn store_limiter_refunds_partial_grants() {
        let (limiter, store) = store_limiter().await;
        let group = LimitRequest::new(Scope::GroupAction(1), 5);
        let global = LimitRequest::new(Scope::Global, 1);

        assert!(limiter.acquire(&[group, global]).await.unwrap().is_allowed());
        assert!(matches!(
            limiter.acquire(&[group, global]).await.unwrap(),
            RateDecision::Denied {
                scope: Scope::Global,
                ..
            }
        ));

        // Group window still holds only the first grant: 4 more fit.
        let group_only = [group];
        for _ in 0..4 {
            assert!(limiter.acquire(&group_only).await.unwrap().is_allowed());
        }
        assert!(!limiter.acquire(&group_only).await.unwrap().is_allowed());

        let check = store
            .increment_and_check(&Scope::GroupAction(1).key(), 5, Scope::GroupAction(1).window())
            .await
            .unwrap();
        assert!(!check.allowed);
        assert_eq!(check.count, 5);
    }

    #[tokio::test]
    async fn cooldown_manager_uses_config_caps() {
        let manager = CooldownManager::new(Arc::new(InMemoryWindowLimiter::new()));
        let config = RuntimeConfig::default();

        for _ in 0..config.per_group_replies_10m {
            assert!(manager.allow_reply(-100, &config).await.unwrap().is_allowed());
        }
        assert!(!manager.allow_reply(-100, &config).await.unwrap().is_allowed());

        for _ in 0..config.join_limit_day {
            assert!(manager.allow_join(&config).await.unwrap().is_allowed());
        }
        assert!(!manager.allow_join(&config).await.unwrap().is_allowed());

        for _ in 0..config.per_group_actions_hour {
            assert!(manager.allow_publish(-200, &config).await.unwrap().is_allowed());
        }
        assert!(matches!(
            manager.allow_publish(-200, &config).await.unwrap(),
            RateDecision::Denied {
                scope: Scope::GroupAction(-200),
                ..
            }
        ));
    }
}
