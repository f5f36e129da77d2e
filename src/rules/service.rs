//! Keyword service — owns the live rule snapshot and swaps it on reload.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::{error, info, warn};

use crate::error::DatabaseError;
use crate::rules::keywords::{RuleKind, RuleSnapshot, default_rule_pairs};
use crate::store::OrderStore;
use crate::text::{normalize, tokenize};

/// Holds the current [`RuleSnapshot`] and reloads it from storage.
pub struct KeywordService {
    store: Arc<dyn OrderStore>,
    current: RwLock<Arc<RuleSnapshot>>,
    reload_lock: tokio::sync::Mutex<()>,
}

impl KeywordService {
    /// Create a service serving the built-in defaults until the first reload.
    pub fn new(store: Arc<dyn OrderStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            current: RwLock::new(Arc::new(RuleSnapshot::defaults())),
            reload_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Seed the default rules when storage has none, then load.
    pub async fn initialize(&self) -> Result<Arc<RuleSnapshot>, DatabaseError> {
        if self.store.count_keyword_rules().await? == 0 {
            let mut seeded = 0usize;
            for (kind, value) in default_rule_pairs() {
                if self.store.upsert_keyword_rule(kind, value).await? {
                    seeded += 1;
                }
            }
            info!(seeded, "Seeded default keyword rules");
        }
        self.reload().await
    }

    /// Current snapshot. Cheap: clones an `Arc`.
    pub fn snapshot(&self) -> Arc<RuleSnapshot> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Rebuild the snapshot from storage.
    ///
    /// On a store error or an empty rule set the previous snapshot stays
    /// active and the error is returned.
    pub async fn reload(&self) -> Result<Arc<RuleSnapshot>, DatabaseError> {
        let _guard = self.reload_lock.lock().await;
        let previous = self.snapshot();

        let rules = match self.store.fetch_keyword_rules().await {
            Ok(rules) => rules,
            Err(e) => {
                warn!(
                    event = "rules_reload_failed",
                    version = previous.version(),
                    error = %e,
                    "Keeping previous keyword rules"
                );
                return Err(e);
            }
        };

        if rules.is_empty() {
            warn!(
                event = "rules_reload_failed",
                version = previous.version(),
                "Stored keyword rules are empty, keeping previous rules"
            );
            return Err(DatabaseError::Query("keyword_rules is empty".into()));
        }

        let next = Arc::new(RuleSnapshot::from_rules(previous.version() + 1, rules));
        self.swap(Arc::clone(&next));
        info!(
            event = "rules_reloaded",
            version = next.version(),
            rules = next.len(),
            "Keyword rules reloaded"
        );
        Ok(next)
    }

    fn swap(&self, next: Arc<RuleSnapshot>) {
        match self.current.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }

    /// Normalize `value`, store each resulting token under `kind` and reload.
    /// Returns the tokens that were stored.
    pub async fn add_keyword(
        &self,
        kind: RuleKind,
        value: &str,
    ) -> Result<Vec<String>, DatabaseError> {
        let tokens = normalized_tokens(value);
        if tokens.is_empty() {
            return Ok(tokens);
        }
        for token in &tokens {
            self.store.upsert_keyword_rule(kind, token).await?;
        }
        self.reload().await?;
        Ok(tokens)
    }

    /// Normalize `value`, delete each resulting token under `kind` and reload.
    /// Returns the tokens that actually existed.
    pub async fn delete_keyword(
        &self,
        kind: RuleKind,
        value: &str,
    ) -> Result<Vec<String>, DatabaseError> {
        let mut deleted = Vec::new();
        for token in normalized_tokens(value) {
            if self.store.delete_keyword_rule(kind, &token).await? {
                deleted.push(token);
            }
        }
        if !deleted.is_empty() {
            self.reload().await?;
        }
        Ok(deleted)
    }

    /// Sorted keyword values per kind from the current snapshot.
    pub fn list_keywords(&self) -> BTreeMap<RuleKind, Vec<String>> {
        self.snapshot().list()
    }
}

fn normalized_tokens(value: &str) -> Vec<String> {
    let normalized = normalize(value);
    tokenize(&normalized).into_iter().map(str::to_string).collect()
}

/// Periodically reload keyword rules. Failures keep the previous snapshot.
pub fn spawn_refresh_task(
    service: Arc<KeywordService>,
    every: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        // The first tick fires immediately; startup already loaded.
        interval.tick().await;
        loop {
            interval.tick().await;
            if let Err(e) = service.reload().await {
                error!(error = %e, "Scheduled keyword reload failed");
            }
        }
    })
}
