//! End-to-end pipeline tests against an in-memory store and a recording
//! publisher.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use taxi_relay::config::{RuntimeConfig, RuntimeConfigService};
use taxi_relay::error::{DatabaseError, PublishError};
use taxi_relay::pipeline::{
    ActionExecutor, ChannelPublisher, CooldownManager, DedupResolver, ExecutorSettings, Ingestor,
    MessageProcessor, MessageQueue, NormalizedMessage, OrderFingerprint, PostRef, ProcessOutcome,
    PublishIntent, RawMessage, ShutdownMode, StoreWindowLimiter, WorkerPool,
};
use taxi_relay::rules::{KeywordService, RuleKind};
use taxi_relay::store::{
    ActionStats, ActionStatus, ActionType, LibSqlBackend, OrderStatus, OrderStore,
    PublishedOrderRecord, WindowCheck,
};

// ── Test doubles ────────────────────────────────────────────────────

/// Records every outbound call. Optionally fails or stalls publishes.
#[derive(Default)]
struct RecordingPublisher {
    next_id: AtomicI64,
    fail: AtomicBool,
    delay_ms: AtomicI64,
    posts: Mutex<Vec<String>>,
    edits: Mutex<Vec<(PostRef, String)>>,
}

#[async_trait]
impl ChannelPublisher for RecordingPublisher {
    fn name(&self) -> &str {
        "recording"
    }

    async fn publish_new(&self, target: &str, text: &str) -> Result<PostRef, PublishError> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(PublishError::Permanent {
                reason: "bot is not a member of the channel chat".into(),
            });
        }
        self.posts.lock().unwrap().push(text.to_string());
        Ok(PostRef {
            chat: target.to_string(),
            message_id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
        })
    }

    async fn edit_existing(&self, post: &PostRef, text: &str) -> Result<(), PublishError> {
        self.edits
            .lock()
            .unwrap()
            .push((post.clone(), text.to_string()));
        Ok(())
    }

    async fn reply(&self, _chat_id: i64, _message_id: i64, _text: &str) -> Result<(), PublishError> {
        Ok(())
    }
}

/// Delegates to libSQL but can make dedup lookups fail, or commit another
/// worker's record right after a lookup has read the table.
struct FlakyStore {
    inner: LibSqlBackend,
    fail_lookups: AtomicBool,
    commit_after_lookup: Mutex<Option<PublishedOrderRecord>>,
}

#[async_trait]
impl OrderStore for FlakyStore {
    async fn reserve_fingerprint(&self, fp: &str, ttl: Duration) -> Result<bool, DatabaseError> {
        self.inner.reserve_fingerprint(fp, ttl).await
    }

    async fn release_fingerprint(&self, fp: &str) -> Result<(), DatabaseError> {
        self.inner.release_fingerprint(fp).await
    }

    async fn get_record(&self, fp: &str) -> Result<Option<PublishedOrderRecord>, DatabaseError> {
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err(DatabaseError::Query("get_record: connection reset".into()));
        }
        let found = self.inner.get_record(fp).await?;
        let pending = self.commit_after_lookup.lock().unwrap().take();
        if let Some(record) = pending {
            self.inner.upsert_record(&record).await?;
            self.inner.release_fingerprint(fp).await?;
        }
        Ok(found)
    }

    async fn upsert_record(&self, record: &PublishedOrderRecord) -> Result<(), DatabaseError> {
        self.inner.upsert_record(record).await
    }

    async fn increment_and_check(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
    ) -> Result<WindowCheck, DatabaseError> {
        self.inner.increment_and_check(key, limit, window).await
    }

    async fn decrement_window(&self, key: &str, window_start: i64) -> Result<(), DatabaseError> {
        self.inner.decrement_window(key, window_start).await
    }

    async fn insert_action(
        &self,
        chat_id: i64,
        message_id: i64,
        action: ActionType,
        status: ActionStatus,
    ) -> Result<(), DatabaseError> {
        self.inner
            .insert_action(chat_id, message_id, action, status)
            .await
    }

    async fn action_stats(&self) -> Result<ActionStats, DatabaseError> {
        self.inner.action_stats().await
    }

    async fn fetch_keyword_rules(&self) -> Result<Vec<(RuleKind, String)>, DatabaseError> {
        self.inner.fetch_keyword_rules().await
    }

    async fn upsert_keyword_rule(&self, kind: RuleKind, value: &str) -> Result<bool, DatabaseError> {
        self.inner.upsert_keyword_rule(kind, value).await
    }

    async fn delete_keyword_rule(&self, kind: RuleKind, value: &str) -> Result<bool, DatabaseError> {
        self.inner.delete_keyword_rule(kind, value).await
    }

    async fn count_keyword_rules(&self) -> Result<i64, DatabaseError> {
        self.inner.count_keyword_rules().await
    }

    async fn fetch_runtime_config(&self) -> Result<Vec<(String, String)>, DatabaseError> {
        self.inner.fetch_runtime_config().await
    }

    async fn upsert_runtime_config(&self, key: &str, value: &str) -> Result<(), DatabaseError> {
        self.inner.upsert_runtime_config(key, value).await
    }
}

// ── Harness ─────────────────────────────────────────────────────────

struct Relay {
    processor: Arc<MessageProcessor>,
    publisher: Arc<RecordingPublisher>,
    store: Arc<FlakyStore>,
    keywords: Arc<KeywordService>,
    config: Arc<RuntimeConfigService>,
}

async fn relay() -> Relay {
    let store = Arc::new(FlakyStore {
        inner: LibSqlBackend::new_memory().await.unwrap(),
        fail_lookups: AtomicBool::new(false),
        commit_after_lookup: Mutex::new(None),
    });
    let dyn_store: Arc<dyn OrderStore> = store.clone();
    let publisher = Arc::new(RecordingPublisher::default());

    let keywords = KeywordService::new(Arc::clone(&dyn_store));
    keywords.initialize().await.unwrap();
    let config = RuntimeConfigService::new(
        Arc::clone(&dyn_store),
        RuntimeConfig {
            min_human_delay_ms: 0,
            max_human_delay_ms: 0,
            ..RuntimeConfig::default()
        },
    );
    config.initialize().await.unwrap();

    let store_timeout = Duration::from_secs(5);
    let resolver = Arc::new(DedupResolver::new(
        Arc::clone(&dyn_store),
        Duration::from_secs(60),
        Duration::from_secs(24 * 3600),
        store_timeout,
    ));
    let cooldown = Arc::new(CooldownManager::new(Arc::new(StoreWindowLimiter::new(
        Arc::clone(&dyn_store),
        store_timeout,
    ))));
    let executor = Arc::new(ActionExecutor::new(
        publisher.clone(),
        Arc::clone(&dyn_store),
        Arc::clone(&resolver),
        Arc::clone(&cooldown),
        ExecutorSettings {
            publish_timeout: Duration::from_secs(2),
            max_attempts: 2,
            backoff: Duration::from_millis(1),
            store_timeout,
        },
    ));
    let processor = Arc::new(MessageProcessor::new(
        Arc::clone(&keywords),
        Arc::clone(&config),
        resolver,
        cooldown,
        executor,
    ));

    Relay {
        processor,
        publisher,
        store,
        keywords,
        config,
    }
}

fn order(chat_id: i64, message_id: i64, sender: i64, text: &str) -> NormalizedMessage {
    NormalizedMessage::new(
        RawMessage::new(chat_id, message_id, text)
            .with_sender(sender)
            .with_chat_username("toshkent_taxi"),
    )
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test]
async fn edit_updates_the_original_post() {
    let relay = relay().await;
    let first = order(-1001, 10, 42, "Toshkentdan Samarqandga 2 kishi bor, tel +998901234567");

    let post = match relay.processor.process(&first).await {
        ProcessOutcome::Published(post) => post,
        other => panic!("expected publish, got {other:?}"),
    };
    assert!(relay.publisher.posts.lock().unwrap()[0].contains("Status: Yangi"));
    assert!(
        relay.publisher.posts.lock().unwrap()[0]
            .contains("Manba: https://t.me/toshkent_taxi/10")
    );

    let edited = NormalizedMessage::new(
        first
            .raw
            .clone()
            .edited("Toshkentdan Samarqandga 2 kishi bor, ertaga soat 8 da"),
    );
    assert_eq!(
        relay.processor.process(&edited).await,
        ProcessOutcome::Edited(post.clone())
    );

    let edits = relay.publisher.edits.lock().unwrap().clone();
    assert_eq!(edits.len(), 1);
    assert_eq!(edits[0].0, post);
    assert!(edits[0].1.contains("Status: Yangilandi"));
    assert_eq!(relay.publisher.posts.lock().unwrap().len(), 1);

    let fp = OrderFingerprint::compute(42, &edited.canonical);
    let record = relay.store.get_record(fp.as_str()).await.unwrap().unwrap();
    assert_eq!(record.status, OrderStatus::Updated);
    assert_eq!(record.post_ref, post);
}

#[tokio::test]
async fn identical_resubmit_is_skipped() {
    let relay = relay().await;
    let msg = order(-1001, 11, 7, "Buxorodan Navoiyga 3 kishi bor");

    assert!(matches!(
        relay.processor.process(&msg).await,
        ProcessOutcome::Published(_)
    ));
    assert_eq!(relay.processor.process(&msg).await, ProcessOutcome::Skipped);

    // Same trip reposted as a new message by the same author.
    let repost = order(-1001, 12, 7, "Buxorodan Navoiyga 3 kishi bor");
    assert_eq!(relay.processor.process(&repost).await, ProcessOutcome::Skipped);
    assert_eq!(relay.publisher.posts.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn rejected_messages_never_publish() {
    let relay = relay().await;
    let cases = [
        ("Samarqandga yuramiz, 3 ta joy bor", "driver_going"),
        ("Vakansiya: haydovchi kerak, oylik yaxshi", "excluded_category"),
        ("Salom", "too_short"),
    ];
    for (i, (text, reason)) in cases.iter().enumerate() {
        let msg = order(-1001, 100 + i as i64, 1, text);
        assert_eq!(
            relay.processor.process(&msg).await,
            ProcessOutcome::Rejected(*reason),
            "{text}"
        );
    }
    assert!(relay.publisher.posts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn group_cap_limits_publishes_until_raised() {
    let relay = relay().await;
    assert_eq!(relay.config.snapshot().per_group_actions_hour, 15);

    for sender in 1..=15 {
        let msg = order(-2002, sender, sender, "Toshkentdan Andijonga 1 kishi bor");
        assert!(
            matches!(relay.processor.process(&msg).await, ProcessOutcome::Published(_)),
            "publish {sender} should pass"
        );
    }
    let sixteenth = order(-2002, 16, 16, "Toshkentdan Andijonga 1 kishi bor");
    assert_eq!(
        relay.processor.process(&sixteenth).await,
        ProcessOutcome::RateLimited
    );

    // Another group is unaffected.
    let other = order(-3003, 1, 99, "Toshkentdan Andijonga 1 kishi bor");
    assert!(matches!(
        relay.processor.process(&other).await,
        ProcessOutcome::Published(_)
    ));

    // The denied order kept no reservation; a cap of 0 lifts the limit.
    relay
        .config
        .set_value("per_group_actions_hour", "0")
        .await
        .unwrap();
    assert!(matches!(
        relay.processor.process(&sixteenth).await,
        ProcessOutcome::Published(_)
    ));
}

#[tokio::test]
async fn concurrent_duplicates_publish_once() {
    let relay = relay().await;
    relay.publisher.delay_ms.store(50, Ordering::SeqCst);
    let msg = order(-1001, 20, 5, "Namangandan Toshkentga 4 kishi bor");

    let mut tasks = Vec::new();
    for _ in 0..6 {
        let processor = Arc::clone(&relay.processor);
        let msg = msg.clone();
        tasks.push(tokio::spawn(async move { processor.process(&msg).await }));
    }

    let outcomes: Vec<ProcessOutcome> = futures::future::join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();
    let published = outcomes
        .iter()
        .filter(|o| matches!(o, ProcessOutcome::Published(_)))
        .count();
    assert_eq!(published, 1, "{outcomes:?}");
    assert!(
        outcomes
            .iter()
            .all(|o| matches!(o, ProcessOutcome::Published(_) | ProcessOutcome::Skipped))
    );
    assert_eq!(relay.publisher.posts.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn failed_publish_leaves_no_record_and_can_retry() {
    let relay = relay().await;
    let msg = order(-1001, 30, 8, "Qarshidan Toshkentga 2 kishi bor");

    relay.publisher.fail.store(true, Ordering::SeqCst);
    assert_eq!(relay.processor.process(&msg).await, ProcessOutcome::Failed);
    let fp = OrderFingerprint::compute(8, &msg.canonical);
    assert!(relay.store.get_record(fp.as_str()).await.unwrap().is_none());

    relay.publisher.fail.store(false, Ordering::SeqCst);
    assert!(matches!(
        relay.processor.process(&msg).await,
        ProcessOutcome::Published(_)
    ));
    assert_eq!(relay.store.action_stats().await.unwrap().errors_24h, 1);
}

#[tokio::test]
async fn store_outage_defers_instead_of_publishing() {
    let relay = relay().await;
    let msg = order(-1001, 40, 9, "Jizzaxdan Toshkentga 2 kishi bor");

    relay.store.fail_lookups.store(true, Ordering::SeqCst);
    assert_eq!(relay.processor.process(&msg).await, ProcessOutcome::Deferred);
    assert!(relay.publisher.posts.lock().unwrap().is_empty());

    relay.store.fail_lookups.store(false, Ordering::SeqCst);
    assert!(matches!(
        relay.processor.process(&msg).await,
        ProcessOutcome::Published(_)
    ));
}

#[tokio::test]
async fn keyword_changes_apply_after_reload() {
    let relay = relay().await;
    let msg = order(-1001, 50, 3, "Ertaga ertalab kamaz bilan yuk tashish rejasi, yordam bering");
    assert!(matches!(
        relay.processor.process(&msg).await,
        ProcessOutcome::Rejected(_)
    ));

    relay
        .keywords
        .add_keyword(RuleKind::Transport, "kamaz")
        .await
        .unwrap();
    relay.keywords.reload().await.unwrap();
    assert!(matches!(
        relay.processor.process(&msg).await,
        ProcessOutcome::Published(_)
    ));
}

#[tokio::test]
async fn ingest_through_worker_pool() {
    let relay = relay().await;
    let (queue, receiver) = MessageQueue::bounded(32);
    let pool = WorkerPool::start(
        3,
        receiver,
        Arc::clone(&relay.processor),
        Duration::from_millis(20),
    );
    let ingestor = Ingestor::new(queue, Arc::clone(&relay.keywords), Arc::clone(&relay.config));

    let source = futures::stream::iter(vec![
        RawMessage::new(-1001, 1, "Toshkentdan Guliston 2 kishi bor").with_sender(1),
        RawMessage::new(-1001, 2, "Salom hammaga").with_sender(2),
        RawMessage::new(-1001, 3, "Nukusdan Urganchga taxi kerak").with_sender(3),
        RawMessage::new(-1001, 0, "Nukusdan Urganchga taxi kerak").with_sender(4),
    ]);
    let summary = ingestor.run(source, std::future::pending()).await;
    assert_eq!(summary.received, 4);
    assert_eq!(summary.queued, 2);

    let report = pool.shutdown(ShutdownMode::Drain).await;
    assert_eq!(report.processed, 2);
    assert_eq!(relay.publisher.posts.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn region_tagged_order_then_contact_edit() {
    let relay = relay().await;
    let msg = order(-1001, 60, 11, "Samarqanddan Toshkentga 2 kishi bor, ertaga ertalab");

    let post = match relay.processor.process(&msg).await {
        ProcessOutcome::Published(post) => post,
        other => panic!("expected publish, got {other:?}"),
    };
    let text = relay.publisher.posts.lock().unwrap()[0].clone();
    assert!(text.contains("\n\n#SamarqandViloyati\n\n"), "{text}");
    assert!(text.contains("Status: Yangi"));

    let edited = NormalizedMessage::new(msg.raw.clone().edited(
        "Samarqanddan Toshkentga 2 kishi bor, ertaga ertalab, tel +998901234567",
    ));
    assert_eq!(
        relay.processor.process(&edited).await,
        ProcessOutcome::Edited(post)
    );
    let edits = relay.publisher.edits.lock().unwrap().clone();
    assert!(edits[0].1.contains("+998901234567"));
}

#[tokio::test]
async fn commit_landing_before_reserve_yields_update() {
    let relay = relay().await;
    let dyn_store: Arc<dyn OrderStore> = relay.store.clone();
    let resolver = DedupResolver::new(
        dyn_store,
        Duration::from_secs(60),
        Duration::from_secs(24 * 3600),
        Duration::from_secs(5),
    );
    let fp = OrderFingerprint::compute(12, "andijondan toshkentga 3 kishi bor");

    // Another worker holds the reservation and commits right after our lookup.
    assert!(
        relay
            .store
            .reserve_fingerprint(fp.as_str(), Duration::from_secs(60))
            .await
            .unwrap()
    );
    let now = chrono::Utc::now();
    *relay.store.commit_after_lookup.lock().unwrap() = Some(PublishedOrderRecord {
        fingerprint: fp.as_str().to_string(),
        source_chat_id: -1001,
        source_message_id: 70,
        post_ref: PostRef {
            chat: "@taxi_orders".into(),
            message_id: 501,
        },
        status: OrderStatus::New,
        content_hash: "h1".into(),
        created_at: now,
        updated_at: now,
    });

    match resolver.resolve(&fp, "h2").await.unwrap() {
        PublishIntent::Update(existing) => assert_eq!(existing.post_ref.message_id, 501),
        other => panic!("expected update, got {other:?}"),
    }

    // The reservation taken on the way was handed back.
    assert!(
        relay
            .store
            .reserve_fingerprint(fp.as_str(), Duration::from_secs(60))
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn edit_during_slow_publish_is_applied() {
    let relay = relay().await;
    relay.publisher.delay_ms.store(300, Ordering::SeqCst);
    let first = order(-1001, 80, 14, "Toshkentdan Samarqandga 2 kishi bor, tel +998901234567");
    let edited = NormalizedMessage::new(
        first
            .raw
            .clone()
            .edited("Toshkentdan Samarqandga 2 kishi bor, ertaga soat 8 da"),
    );

    let original = {
        let processor = Arc::clone(&relay.processor);
        let first = first.clone();
        tokio::spawn(async move { processor.process(&first).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let edit_outcome = relay.processor.process(&edited).await;
    let post = match original.await.unwrap() {
        ProcessOutcome::Published(post) => post,
        other => panic!("expected publish, got {other:?}"),
    };
    assert_eq!(edit_outcome, ProcessOutcome::Edited(post.clone()));

    assert_eq!(relay.publisher.posts.lock().unwrap().len(), 1);
    let edits = relay.publisher.edits.lock().unwrap().clone();
    assert_eq!(edits.len(), 1);
    assert_eq!(edits[0].0, post);
    assert!(edits[0].1.contains("ertaga soat 8 da"));
}
