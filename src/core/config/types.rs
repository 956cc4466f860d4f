use thiserror::Error;

#[derive(Debug, Clone)]
pub struct Settings {
    pub(super) instance: InstanceSettings,
    pub(super) runtime: RuntimeSettings,
    pub(super) database: DatabaseSettings,
    pub(super) redis: RedisSettings,
    pub(super) cache: CacheSettings,
    pub(super) queue: QueueSettings,
    pub(super) publish: PublishSettings,
    pub(super) telemetry: TelemetrySettings,
}

/// Identity of this process within the worker fleet. Chunk and aggregation
/// records carry the server id that produced them.
#[derive(Debug, Clone)]
pub struct InstanceSettings {
    pub server_id: String,
}

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub environment: Environment,
    pub strict_config: bool,
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub postgres_server: String,
    pub postgres_port: u16,
    pub postgres_user: String,
    pub postgres_password: String,
    pub postgres_db: String,
    pub database_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RedisSettings {
    pub host: String,
    pub port: u16,
    pub db: u16,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub l1_max_entries: usize,
    pub default_ttl_seconds: u64,
    pub warm_batch_size: usize,
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub completed_retention: usize,
    pub failed_retention: usize,
    pub lease_seconds: u64,
    pub maintenance_interval_seconds: u64,
    pub poll_interval_ms: u64,
    pub poll_jitter_ms: u64,
    pub drain_timeout_seconds: u64,
    pub job_status_ttl_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct PublishSettings {
    pub chunk_size: usize,
    pub max_concurrency: usize,
    pub stagger_delay_ms: u64,
    pub aggregation_wait_seconds: u64,
    pub progress_ttl_seconds: u64,
    pub estimate_seconds_per_chunk: u64,
    pub progress_url_base: String,
    pub chunk_workers: usize,
    pub aggregation_workers: usize,
    pub notification_workers: usize,
}

#[derive(Debug, Clone)]
pub struct TelemetrySettings {
    pub log_level: String,
    pub json: bool,
    pub prometheus_enabled: bool,
    pub prometheus_port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Staging,
    Test,
}

impl Environment {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Staging => "staging",
            Self::Test => "test",
        }
    }

    pub(super) fn is_production(self) -> bool {
        matches!(self, Self::Production)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {field}: {value}")]
    InvalidValue { field: &'static str, value: String },
    #[error("missing required secret for {0}")]
    MissingSecret(&'static str),
}

impl DatabaseSettings {
    pub fn database_url(&self) -> String {
        if let Some(url) = &self.database_url {
            return url.clone();
        }

        format!(
            "postgresql://{}:{}@{}:{}/{}",
            self.postgres_user,
            self.postgres_password,
            self.postgres_server,
            self.postgres_port,
            self.postgres_db
        )
    }
}

impl RedisSettings {
    pub fn redis_url(&self) -> String {
        if self.password.is_empty() {
            format!("redis://{}:{}/{}", self.host, self.port, self.db)
        } else {
            format!("redis://:{}@{}:{}/{}", self.password, self.host, self.port, self.db)
        }
    }
}
