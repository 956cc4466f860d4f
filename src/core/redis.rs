use std::sync::Arc;

use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::{cmd, Client, RedisError};
use tokio::sync::RwLock;

/// Shared handle to the Redis connection. The manager is optional so the
/// process keeps running when Redis is unreachable; callers that get `None`
/// degrade to local-only behavior.
#[derive(Clone)]
pub struct RedisHandle {
    url: String,
    manager: Arc<RwLock<Option<ConnectionManager>>>,
}

#[derive(Debug, Clone)]
pub enum RedisHealth {
    Healthy,
    Disconnected,
    Unhealthy(String),
}

impl RedisHandle {
    pub fn new(url: String) -> Self {
        Self { url, manager: Arc::new(RwLock::new(None)) }
    }

    pub async fn connect(&self) -> Result<(), RedisError> {
        let client = Client::open(self.url.clone())?;
        let manager = ConnectionManager::new(client).await?;
        let mut guard = self.manager.write().await;
        *guard = Some(manager);
        Ok(())
    }

    pub async fn disconnect(&self) {
        let mut guard = self.manager.write().await;
        *guard = None;
    }

    /// Clone of the shared multiplexed connection, if connected.
    pub async fn manager(&self) -> Option<ConnectionManager> {
        self.manager.read().await.clone()
    }

    /// Fresh connection for blocking commands (BLPOP). Blocking on the shared
    /// multiplexed connection would stall every other caller.
    pub async fn blocking_connection(&self) -> Result<MultiplexedConnection, RedisError> {
        let client = Client::open(self.url.clone())?;
        client.get_multiplexed_async_connection().await
    }

    pub async fn health(&self) -> RedisHealth {
        let manager = { self.manager.read().await.clone() };
        let Some(mut manager) = manager else {
            return RedisHealth::Disconnected;
        };

        match cmd("PING").query_async::<_, String>(&mut manager).await {
            Ok(_) => RedisHealth::Healthy,
            Err(err) => RedisHealth::Unhealthy(err.to_string()),
        }
    }

    pub async fn is_reachable(&self) -> bool {
        matches!(self.health().await, RedisHealth::Healthy)
    }
}
