mod parsing;
mod settings;
mod types;

pub use types::{
    CacheSettings, ConfigError, DatabaseSettings, Environment, InstanceSettings, PublishSettings,
    QueueSettings, RedisSettings, RuntimeSettings, Settings, TelemetrySettings,
};
