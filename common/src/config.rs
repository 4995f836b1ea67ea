// Configuration management with layered configuration (file, env)

use crate::aggregator::AggregatorConfig;
use crate::notify::NatsConfig;
use crate::polling::PollingConfig;
use crate::registry::RegistryConfig;
use crate::tracker::TrackerConfig;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub nats: NatsConfig,
    pub feeds: FeedsConfig,
    pub scheduler: SchedulerConfig,
    pub writer: WriterConfig,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
    pub pool_size: u32,
}

/// Where feed files live on disk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedsConfig {
    pub root_dir: String,
}

/// Backend used to serialize mutations of one schedule record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockBackend {
    Local,
    Redis,
}

/// Backend holding schedule records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub aggregation_initial_delay_seconds: u64,
    pub aggregation_interval_seconds: u64,
    pub polling_interval_seconds: u64,
    pub lock_ttl_seconds: u64,
    pub lock_backend: LockBackend,
    pub store_backend: StoreBackend,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriterConfig {
    pub writer_id: u32,
    pub heartbeat_interval_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub metrics_port: u16,
    pub tracing_endpoint: Option<String>,
}

impl Settings {
    /// Load configuration with layered precedence: defaults → file → env
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config")
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            // Start with default configuration
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Add local configuration (not committed to git)
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            // Add environment-specific configuration
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), String> {
        if self.scheduler.store_backend == StoreBackend::Postgres {
            if self.database.url.is_empty() {
                return Err("Database URL cannot be empty".to_string());
            }
            if self.database.max_connections == 0 {
                return Err("Database max_connections must be greater than 0".to_string());
            }
        }

        if self.scheduler.lock_backend == LockBackend::Redis && self.redis.url.is_empty() {
            return Err("Redis URL cannot be empty".to_string());
        }

        if self.nats.url.is_empty() {
            return Err("NATS URL cannot be empty".to_string());
        }
        if self.nats.launch_stream.is_empty() {
            return Err("NATS launch_stream cannot be empty".to_string());
        }

        if self.feeds.root_dir.is_empty() {
            return Err("Feeds root_dir cannot be empty".to_string());
        }

        if self.scheduler.aggregation_interval_seconds == 0 {
            return Err("Scheduler aggregation_interval_seconds must be greater than 0".to_string());
        }
        if self.scheduler.polling_interval_seconds == 0 {
            return Err("Scheduler polling_interval_seconds must be greater than 0".to_string());
        }
        if self.scheduler.lock_ttl_seconds == 0 {
            return Err("Scheduler lock_ttl_seconds must be greater than 0".to_string());
        }

        if self.writer.heartbeat_interval_seconds == 0 {
            return Err("Writer heartbeat_interval_seconds must be greater than 0".to_string());
        }

        Ok(())
    }

    pub fn tracker_config(&self) -> TrackerConfig {
        TrackerConfig {
            writer_id: self.writer.writer_id,
            heartbeat_interval: Duration::from_secs(self.writer.heartbeat_interval_seconds),
        }
    }

    pub fn aggregator_config(&self) -> AggregatorConfig {
        AggregatorConfig {
            initial_delay: Duration::from_secs(self.scheduler.aggregation_initial_delay_seconds),
            interval: Duration::from_secs(self.scheduler.aggregation_interval_seconds),
        }
    }

    pub fn polling_config(&self) -> PollingConfig {
        PollingConfig {
            interval: Duration::from_secs(self.scheduler.polling_interval_seconds),
        }
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            lock_ttl: Duration::from_secs(self.scheduler.lock_ttl_seconds),
            aggregation: self.aggregator_config(),
            polling: self.polling_config(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "postgresql://localhost/volume_scheduler".to_string(),
                max_connections: 10,
                min_connections: 2,
                connect_timeout_seconds: 30,
            },
            redis: RedisConfig {
                url: "redis://localhost:6379".to_string(),
                pool_size: 10,
            },
            nats: NatsConfig::default(),
            feeds: FeedsConfig {
                root_dir: "./data/feeds".to_string(),
            },
            scheduler: SchedulerConfig {
                aggregation_initial_delay_seconds: 5,
                aggregation_interval_seconds: 5,
                polling_interval_seconds: 60,
                lock_ttl_seconds: 30,
                lock_backend: LockBackend::Local,
                store_backend: StoreBackend::Postgres,
            },
            writer: WriterConfig {
                writer_id: 0,
                heartbeat_interval_seconds: 2,
            },
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                metrics_port: 9090,
                tracing_endpoint: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_validation_catches_zero_polling_interval() {
        let mut settings = Settings::default();
        settings.scheduler.polling_interval_seconds = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validation_catches_empty_feed_root() {
        let mut settings = Settings::default();
        settings.feeds.root_dir = String::new();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_database_url_only_required_for_postgres_store() {
        let mut settings = Settings::default();
        settings.database.url = String::new();
        assert!(settings.validate().is_err());

        settings.scheduler.store_backend = StoreBackend::Memory;
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_redis_url_required_for_redis_locks() {
        let mut settings = Settings::default();
        settings.redis.url = String::new();
        assert!(settings.validate().is_ok());

        settings.scheduler.lock_backend = LockBackend::Redis;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_component_configs_follow_settings() {
        let mut settings = Settings::default();
        settings.scheduler.aggregation_interval_seconds = 7;
        settings.scheduler.polling_interval_seconds = 11;
        settings.writer.writer_id = 4;

        assert_eq!(settings.aggregator_config().interval, Duration::from_secs(7));
        assert_eq!(settings.polling_config().interval, Duration::from_secs(11));
        assert_eq!(settings.tracker_config().writer_id, 4);
        let registry = settings.registry_config();
        assert_eq!(registry.lock_ttl, Duration::from_secs(30));
        assert_eq!(registry.polling.interval, Duration::from_secs(11));
    }
}
