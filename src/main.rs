use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tracing::info;

use snaplink::cache::LayeredCache;
use snaplink::config::get_config;
use snaplink::fast::{FastStore, RedisFastStore};
use snaplink::logging::init_logging;
use snaplink::reconciler::Reconciler;
use snaplink::scheduler::Scheduler;
use snaplink::services::{AnalyticsService, LinkService};
use snaplink::services::analytics_service::AnalyticsTtls;
use snaplink::storage::DurableStorage;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = get_config();
    let _log_guard = init_logging(&config.logging);

    let storage = Arc::new(
        DurableStorage::new(
            &config.database.url,
            config.database.pool_size,
            Duration::from_secs(config.database.acquire_timeout_secs),
        )
        .await?,
    );
    info!("Durable store ready ({})", storage.backend_name());

    let fast: Arc<dyn FastStore> =
        Arc::new(RedisFastStore::new(&config.redis.url, &config.redis.key_prefix)?);
    let cache = Arc::new(LayeredCache::new(fast.clone()));

    // The transport layer (not part of this binary) takes these handles;
    // constructing them here validates the wiring at startup.
    let _links = Arc::new(LinkService::new(
        fast.clone(),
        storage.clone(),
        config.cache.link_ttl_secs,
    ));
    let _analytics = Arc::new(AnalyticsService::new(
        fast.clone(),
        storage.clone(),
        cache,
        AnalyticsTtls {
            counter_secs: config.cache.counter_ttl_secs,
            aggregate_secs: config.cache.aggregate_ttl_secs,
            snapshot_secs: config.cache.snapshot_ttl_secs,
        },
    ));

    let reconciler = Arc::new(Reconciler::new(
        fast,
        storage,
        config.scheduler.batch_size,
        config.cache.link_ttl_secs,
        config.cache.counter_ttl_secs,
    ));

    let mut scheduler = Scheduler::new();
    let reconcile_interval =
        Duration::from_secs(config.scheduler.effective_reconcile_interval_secs());

    let job = reconciler.clone();
    scheduler.register("pending-links", reconcile_interval, move || {
        let job = job.clone();
        async move {
            job.process_pending_links().await?;
            Ok(())
        }
        .boxed()
    });

    let job = reconciler.clone();
    scheduler.register("pending-visits", reconcile_interval, move || {
        let job = job.clone();
        async move {
            job.process_pending_visits().await?;
            Ok(())
        }
        .boxed()
    });

    let job = reconciler.clone();
    scheduler.register(
        "counter-reconcile",
        Duration::from_secs(config.scheduler.counter_interval_secs),
        move || {
            let job = job.clone();
            async move {
                job.reconcile_counters().await?;
                Ok(())
            }
            .boxed()
        },
    );

    let job = reconciler.clone();
    scheduler.register(
        "cleanup",
        Duration::from_secs(config.scheduler.cleanup_interval_secs),
        move || {
            let job = job.clone();
            async move {
                job.cleanup_expired().await?;
                Ok(())
            }
            .boxed()
        },
    );

    info!("SnapLink core running, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;

    scheduler.shutdown().await;
    info!("Shutdown complete");
    Ok(())
}
