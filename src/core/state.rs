use std::sync::Arc;

use sqlx::PgPool;

use crate::cache::TieredCache;
use crate::core::{config::Settings, redis::RedisHandle};
use crate::queue::QueueRegistry;

/// Shared handles for the worker process. Every component receives its
/// collaborators through this state instead of reaching for globals.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<InnerState>,
}

struct InnerState {
    settings: Settings,
    db: PgPool,
    redis: RedisHandle,
    cache: TieredCache,
    registry: QueueRegistry,
}

impl AppState {
    pub fn new(
        settings: Settings,
        db: PgPool,
        redis: RedisHandle,
        cache: TieredCache,
        registry: QueueRegistry,
    ) -> Self {
        Self { inner: Arc::new(InnerState { settings, db, redis, cache, registry }) }
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub fn db(&self) -> &PgPool {
        &self.inner.db
    }

    pub fn redis(&self) -> &RedisHandle {
        &self.inner.redis
    }

    pub fn cache(&self) -> &TieredCache {
        &self.inner.cache
    }

    pub fn registry(&self) -> &QueueRegistry {
        &self.inner.registry
    }
}
