use super::parsing::{
    default_server_id, env_optional, env_or_default, parse_bool, parse_environment, parse_u16,
    parse_u32, parse_u64, parse_usize,
};
use super::types::{
    CacheSettings, ConfigError, DatabaseSettings, InstanceSettings, PublishSettings, QueueSettings,
    RedisSettings, RuntimeSettings, Settings, TelemetrySettings,
};

impl Settings {
    pub fn load() -> Result<Self, ConfigError> {
        let environment =
            parse_environment(env_optional("GRADECAST_ENV").or_else(|| env_optional("ENVIRONMENT")));
        let strict_config =
            env_optional("GRADECAST_STRICT_CONFIG").map(|value| parse_bool(&value)).unwrap_or(false)
                || environment.is_production();

        let server_id =
            env_optional("GRADECAST_SERVER_ID").unwrap_or_else(default_server_id);

        let postgres_server = env_or_default("POSTGRES_SERVER", "localhost");
        let postgres_port = parse_u16("POSTGRES_PORT", env_or_default("POSTGRES_PORT", "5432"))?;
        let postgres_user = env_or_default("POSTGRES_USER", "gradecast");
        let postgres_password = env_or_default("POSTGRES_PASSWORD", "");
        let postgres_db = env_or_default("POSTGRES_DB", "gradecast_db");
        let database_url = env_optional("DATABASE_URL");

        let redis_host = env_or_default("REDIS_HOST", "localhost");
        let redis_port = parse_u16("REDIS_PORT", env_or_default("REDIS_PORT", "6379"))?;
        let redis_db = parse_u16("REDIS_DB", env_or_default("REDIS_DB", "0"))?;
        let redis_password = env_or_default("REDIS_PASSWORD", "");

        let l1_max_entries =
            parse_usize("CACHE_L1_MAX_ENTRIES", env_or_default("CACHE_L1_MAX_ENTRIES", "1000"))?;
        let default_ttl_seconds = parse_u64(
            "CACHE_DEFAULT_TTL_SECONDS",
            env_or_default("CACHE_DEFAULT_TTL_SECONDS", "300"),
        )?;
        let warm_batch_size =
            parse_usize("CACHE_WARM_BATCH_SIZE", env_or_default("CACHE_WARM_BATCH_SIZE", "100"))?;

        let max_attempts =
            parse_u32("QUEUE_MAX_ATTEMPTS", env_or_default("QUEUE_MAX_ATTEMPTS", "3"))?;
        let backoff_base_ms =
            parse_u64("QUEUE_BACKOFF_BASE_MS", env_or_default("QUEUE_BACKOFF_BASE_MS", "1000"))?;
        let completed_retention = parse_usize(
            "QUEUE_COMPLETED_RETENTION",
            env_or_default("QUEUE_COMPLETED_RETENTION", "100"),
        )?;
        let failed_retention =
            parse_usize("QUEUE_FAILED_RETENTION", env_or_default("QUEUE_FAILED_RETENTION", "500"))?;
        let lease_seconds =
            parse_u64("QUEUE_LEASE_SECONDS", env_or_default("QUEUE_LEASE_SECONDS", "60"))?;
        let maintenance_interval_seconds = parse_u64(
            "QUEUE_MAINTENANCE_INTERVAL_SECONDS",
            env_or_default("QUEUE_MAINTENANCE_INTERVAL_SECONDS", "15"),
        )?;
        let poll_interval_ms =
            parse_u64("QUEUE_POLL_INTERVAL_MS", env_or_default("QUEUE_POLL_INTERVAL_MS", "500"))?;
        let poll_jitter_ms =
            parse_u64("QUEUE_POLL_JITTER_MS", env_or_default("QUEUE_POLL_JITTER_MS", "200"))?;
        let drain_timeout_seconds = parse_u64(
            "QUEUE_DRAIN_TIMEOUT_SECONDS",
            env_or_default("QUEUE_DRAIN_TIMEOUT_SECONDS", "30"),
        )?;
        let job_status_ttl_seconds = parse_u64(
            "QUEUE_JOB_STATUS_TTL_SECONDS",
            env_or_default("QUEUE_JOB_STATUS_TTL_SECONDS", "86400"),
        )?;

        let chunk_size =
            parse_usize("PUBLISH_CHUNK_SIZE", env_or_default("PUBLISH_CHUNK_SIZE", "500"))?;
        let max_concurrency = parse_usize(
            "PUBLISH_MAX_CONCURRENCY",
            env_or_default("PUBLISH_MAX_CONCURRENCY", "20"),
        )?;
        let stagger_delay_ms = parse_u64(
            "PUBLISH_STAGGER_DELAY_MS",
            env_or_default("PUBLISH_STAGGER_DELAY_MS", "200"),
        )?;
        let aggregation_wait_seconds = parse_u64(
            "PUBLISH_AGGREGATION_WAIT_SECONDS",
            env_or_default("PUBLISH_AGGREGATION_WAIT_SECONDS", "300"),
        )?;
        let progress_ttl_seconds = parse_u64(
            "PUBLISH_PROGRESS_TTL_SECONDS",
            env_or_default("PUBLISH_PROGRESS_TTL_SECONDS", "3600"),
        )?;
        let estimate_seconds_per_chunk = parse_u64(
            "PUBLISH_ESTIMATE_SECONDS_PER_CHUNK",
            env_or_default("PUBLISH_ESTIMATE_SECONDS_PER_CHUNK", "30"),
        )?;
        let progress_url_base = env_or_default("PUBLISH_PROGRESS_URL_BASE", "/api/v1");
        let chunk_workers =
            parse_usize("PUBLISH_CHUNK_WORKERS", env_or_default("PUBLISH_CHUNK_WORKERS", "5"))?;
        let aggregation_workers = parse_usize(
            "PUBLISH_AGGREGATION_WORKERS",
            env_or_default("PUBLISH_AGGREGATION_WORKERS", "3"),
        )?;
        let notification_workers = parse_usize(
            "PUBLISH_NOTIFICATION_WORKERS",
            env_or_default("PUBLISH_NOTIFICATION_WORKERS", "10"),
        )?;

        let log_level = env_or_default("GRADECAST_LOG_LEVEL", "info");
        let json = env_optional("GRADECAST_LOG_JSON")
            .map(|value| parse_bool(&value))
            .unwrap_or(false);
        let prometheus_enabled = env_optional("PROMETHEUS_ENABLED")
            .map(|value| parse_bool(&value))
            .unwrap_or(false);
        let prometheus_port =
            parse_u16("PROMETHEUS_PORT", env_or_default("PROMETHEUS_PORT", "9000"))?;

        let settings = Self {
            instance: InstanceSettings { server_id },
            runtime: RuntimeSettings { environment, strict_config },
            database: DatabaseSettings {
                postgres_server,
                postgres_port,
                postgres_user,
                postgres_password,
                postgres_db,
                database_url,
            },
            redis: RedisSettings {
                host: redis_host,
                port: redis_port,
                db: redis_db,
                password: redis_password,
            },
            cache: CacheSettings { l1_max_entries, default_ttl_seconds, warm_batch_size },
            queue: QueueSettings {
                max_attempts,
                backoff_base_ms,
                completed_retention,
                failed_retention,
                lease_seconds,
                maintenance_interval_seconds,
                poll_interval_ms,
                poll_jitter_ms,
                drain_timeout_seconds,
                job_status_ttl_seconds,
            },
            publish: PublishSettings {
                chunk_size,
                max_concurrency,
                stagger_delay_ms,
                aggregation_wait_seconds,
                progress_ttl_seconds,
                estimate_seconds_per_chunk,
                progress_url_base,
                chunk_workers,
                aggregation_workers,
                notification_workers,
            },
            telemetry: TelemetrySettings { log_level, json, prometheus_enabled, prometheus_port },
        };

        settings.validate()?;
        Ok(settings)
    }

    pub fn instance(&self) -> &InstanceSettings {
        &self.instance
    }

    pub fn runtime(&self) -> &RuntimeSettings {
        &self.runtime
    }

    pub fn database(&self) -> &DatabaseSettings {
        &self.database
    }

    pub fn redis(&self) -> &RedisSettings {
        &self.redis
    }

    pub fn cache(&self) -> &CacheSettings {
        &self.cache
    }

    pub fn queue(&self) -> &QueueSettings {
        &self.queue
    }

    pub fn publish(&self) -> &PublishSettings {
        &self.publish
    }

    pub fn telemetry(&self) -> &TelemetrySettings {
        &self.telemetry
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.cache.l1_max_entries == 0 {
            return Err(ConfigError::InvalidValue {
                field: "CACHE_L1_MAX_ENTRIES",
                value: "0".to_string(),
            });
        }

        if self.cache.warm_batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "CACHE_WARM_BATCH_SIZE",
                value: "0".to_string(),
            });
        }

        if self.queue.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "QUEUE_MAX_ATTEMPTS",
                value: "0".to_string(),
            });
        }

        if self.queue.lease_seconds == 0 {
            return Err(ConfigError::InvalidValue {
                field: "QUEUE_LEASE_SECONDS",
                value: "0".to_string(),
            });
        }

        if self.publish.chunk_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "PUBLISH_CHUNK_SIZE",
                value: "0".to_string(),
            });
        }

        if self.publish.max_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                field: "PUBLISH_MAX_CONCURRENCY",
                value: "0".to_string(),
            });
        }

        if self.publish.aggregation_wait_seconds == 0 {
            return Err(ConfigError::InvalidValue {
                field: "PUBLISH_AGGREGATION_WAIT_SECONDS",
                value: "0".to_string(),
            });
        }

        if self.instance.server_id.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "GRADECAST_SERVER_ID",
                value: String::from("<empty>"),
            });
        }

        if !(self.runtime.strict_config || self.runtime.environment.is_production()) {
            return Ok(());
        }

        if self.database.database_url.is_none() && self.database.postgres_password.is_empty() {
            return Err(ConfigError::MissingSecret("POSTGRES_PASSWORD"));
        }

        Ok(())
    }
}
