use std::sync::Arc;

use taxi_relay::channels::{LogPublisher, StdinSource, TelegramPublisher};
use taxi_relay::config::{RuntimeConfigService, Settings};
use taxi_relay::pipeline::{
    ActionExecutor, ChannelPublisher, CooldownManager, DedupResolver, ExecutorSettings, Ingestor,
    MessageProcessor, MessageQueue, StoreWindowLimiter, WorkerPool,
};
use taxi_relay::rules::{KeywordService, spawn_refresh_task};
use taxi_relay::store::{LibSqlBackend, OrderStore};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let settings = Settings::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        std::process::exit(1);
    });

    eprintln!("🚕 Taxi Relay v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Workers: {}", settings.worker_count);
    eprintln!("   Queue: {}", settings.queue_max_size);
    eprintln!("   Shutdown: {}", settings.shutdown_mode);

    // ── Database ─────────────────────────────────────────────────────────
    let store: Arc<dyn OrderStore> = Arc::new(
        LibSqlBackend::new_local(&settings.db_path)
            .await
            .unwrap_or_else(|e| {
                eprintln!(
                    "Error: Failed to open database at {}: {}",
                    settings.db_path.display(),
                    e
                );
                std::process::exit(1);
            }),
    );
    eprintln!("   Database: {}", settings.db_path.display());

    // ── Rules + runtime config ──────────────────────────────────────────
    let keywords = KeywordService::new(Arc::clone(&store));
    let rules = keywords.initialize().await?;
    eprintln!("   Keyword rules: {} (v{})", rules.len(), rules.version());
    let _refresh_handle = spawn_refresh_task(Arc::clone(&keywords), settings.rules_refresh);

    let runtime = RuntimeConfigService::new(Arc::clone(&store), settings.runtime.clone());
    let config = runtime.initialize().await?;
    eprintln!("   Forward target: {}", config.forward_target);

    // ── Publisher ───────────────────────────────────────────────────────
    let publisher: Arc<dyn ChannelPublisher> = match &settings.telegram_bot_token {
        Some(token) => Arc::new(TelegramPublisher::new(token.clone())),
        None => {
            eprintln!("   TELEGRAM_BOT_TOKEN not set, posts are only logged");
            Arc::new(LogPublisher::new())
        }
    };
    eprintln!("   Publisher: {}", publisher.name());

    // ── Pipeline ────────────────────────────────────────────────────────
    let resolver = Arc::new(DedupResolver::new(
        Arc::clone(&store),
        settings.reservation_ttl,
        settings.dedup_window,
        settings.store_timeout,
    ));
    let cooldown = Arc::new(CooldownManager::new(Arc::new(StoreWindowLimiter::new(
        Arc::clone(&store),
        settings.store_timeout,
    ))));
    let executor = Arc::new(ActionExecutor::new(
        publisher,
        Arc::clone(&store),
        Arc::clone(&resolver),
        Arc::clone(&cooldown),
        ExecutorSettings::from(&settings),
    ));
    let processor = Arc::new(MessageProcessor::new(
        Arc::clone(&keywords),
        Arc::clone(&runtime),
        resolver,
        cooldown,
        executor,
    ));

    let (queue, receiver) = MessageQueue::bounded(settings.queue_max_size);
    let pool = WorkerPool::start(
        settings.worker_count,
        receiver,
        processor,
        settings.worker_poll_timeout,
    );

    eprintln!("   Reading JSON lines from stdin. Ctrl-C to stop.\n");

    let ingestor = Ingestor::new(queue.clone(), keywords, runtime);
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };
    ingestor.run(StdinSource::start(), shutdown).await;

    let report = pool.shutdown(settings.shutdown_mode).await;
    eprintln!(
        "   Processed: {}, abandoned: {}, shed: {}",
        report.processed,
        report.abandoned,
        queue.shed_count()
    );

    match store.action_stats().await {
        Ok(stats) => tracing::info!(
            published_1h = stats.published_1h,
            published_24h = stats.published_24h,
            edited_24h = stats.edited_24h,
            errors_24h = stats.errors_24h,
            "Action stats"
        ),
        Err(e) => tracing::warn!(error = %e, "Failed to read action stats"),
    }

    Ok(())
}
