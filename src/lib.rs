pub mod cache;
pub mod core;
pub(crate) mod db;
pub mod publish;
pub mod queue;
pub(crate) mod repositories;
pub mod services;

use std::sync::Arc;

use crate::cache::TieredCache;
use crate::core::{config::Settings, redis::RedisHandle, state::AppState, telemetry};
use crate::publish::BulkPublisher;
use crate::queue::{JobStore, QueueRegistry, RedisJobStore};
use crate::services::notifications::LogNotificationDispatcher;
use crate::services::postgres::{PgExamReader, PgResultWriter, PgSubmissionMarker};

pub async fn run_worker() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = Settings::load()?;
    telemetry::init_tracing(&settings)?;
    core::metrics::init(&settings)?;

    let db_pool = db::init_pool(&settings).await?;
    db::run_migrations(&db_pool).await?;

    let redis = RedisHandle::new(settings.redis().redis_url());
    if let Err(err) = redis.connect().await {
        tracing::error!(error = %err, "Failed to connect to Redis; continuing on the local cache tier");
    } else {
        tracing::info!("Redis connected successfully");
    }

    let cache = TieredCache::new(settings.cache(), redis.clone());
    let store = Arc::new(RedisJobStore::new(redis.clone(), settings.queue()));
    let registry = QueueRegistry::new(
        store as Arc<dyn JobStore>,
        cache.clone(),
        settings.instance().server_id.clone(),
        settings.queue().clone(),
    );
    let state = AppState::new(settings, db_pool, redis, cache, registry);

    let reader = Arc::new(PgExamReader::new(state.db().clone()));
    publish::register_workers(
        state.registry(),
        state.cache(),
        reader.clone(),
        Arc::new(PgResultWriter::new(state.db().clone())),
        Arc::new(PgSubmissionMarker::new(state.db().clone())),
        Arc::new(LogNotificationDispatcher),
        state.settings().publish(),
        &state.settings().instance().server_id,
    );

    let publisher = BulkPublisher::new(
        reader,
        state.cache().clone(),
        state.registry().clone(),
        state.settings().publish().clone(),
        state.settings().instance().server_id.clone(),
    );
    let health = publisher.health_check().await;
    tracing::info!(
        healthy = health.healthy,
        broker_reachable = health.queues.broker_reachable,
        cache_l2_reachable = health.cache.l2_reachable,
        "Publish engine health at startup"
    );

    tracing::info!(
        server_id = %state.settings().instance().server_id,
        environment = %state.settings().runtime().environment.as_str(),
        "Gradecast worker ready"
    );

    core::shutdown::shutdown_signal().await;

    state.registry().close().await;
    state.redis().disconnect().await;
    tracing::info!("Redis disconnected");

    Ok(())
}
