use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::models::EntityKind;

pub const DEFAULT_CONFIG_FILE: &str = "config/flashsale.yaml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub log_level: String,
    pub log_to_file: bool,
    pub log_file: String,
    /// 7-bit machine id for admission tokens and order ids
    pub machine_id: u8,
    pub redis: RedisConfig,
    pub scylla: ScyllaDbConfig,
    pub cache: CacheConfig,
    pub filters: FiltersConfig,
    pub seckill: SeckillConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
    pub connection_retries: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScyllaDbConfig {
    pub hosts: Vec<String>,
    pub keyspace: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub shop_ttl_secs: u64,
    pub null_ttl_secs: u64,
    /// Renewed while a reload runs; must exceed `reload_timeout_ms`
    pub lock_ttl_ms: u64,
    pub lock_backoff_ms: u64,
    pub reload_timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FilterSettings {
    pub capacity: usize,
    pub error_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FiltersConfig {
    pub shop: FilterSettings,
    pub user: FilterSettings,
    pub coupon: FilterSettings,
    /// 0 disables periodic rebuilds
    pub rebuild_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeckillConfig {
    pub order_stream: String,
    pub consumer_group: String,
    pub dead_letter_stream: String,
    /// How long buyer sets and stock keys outlive the coupon window
    pub dedup_retention_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub workers: usize,
    pub consumer_prefix: String,
    pub batch_size: usize,
    pub block_ms: u64,
    pub claim_idle_ms: u64,
    pub retry_backoff_ms: u64,
    /// Consecutive failures after which a worker logs at error level
    pub alert_threshold: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_to_file: false,
            log_file: "log/flashsale.log".to_string(),
            machine_id: 1,
            redis: RedisConfig::default(),
            scylla: ScyllaDbConfig::default(),
            cache: CacheConfig::default(),
            filters: FiltersConfig::default(),
            seckill: SeckillConfig::default(),
            pipeline: PipelineConfig::default(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self { url: "redis://127.0.0.1:6379/".to_string(), connection_retries: 6 }
    }
}

impl Default for ScyllaDbConfig {
    fn default() -> Self {
        Self { hosts: vec!["127.0.0.1:9042".to_string()], keyspace: "flashsale".to_string() }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            shop_ttl_secs: 3600,
            null_ttl_secs: 60,
            lock_ttl_ms: 10_000,
            lock_backoff_ms: 50,
            reload_timeout_ms: 2_000,
        }
    }
}

impl CacheConfig {
    pub fn shop_ttl(&self) -> Duration {
        Duration::from_secs(self.shop_ttl_secs)
    }

    pub fn null_ttl(&self) -> Duration {
        Duration::from_secs(self.null_ttl_secs)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }

    pub fn lock_backoff(&self) -> Duration {
        Duration::from_millis(self.lock_backoff_ms)
    }

    pub fn reload_timeout(&self) -> Duration {
        Duration::from_millis(self.reload_timeout_ms)
    }
}

impl Default for FiltersConfig {
    fn default() -> Self {
        Self {
            shop: FilterSettings { capacity: 100_000, error_rate: 0.01 },
            user: FilterSettings { capacity: 1_000_000, error_rate: 0.001 },
            coupon: FilterSettings { capacity: 50_000, error_rate: 0.01 },
            rebuild_interval_secs: 3600,
        }
    }
}

impl FiltersConfig {
    pub fn settings(&self, kind: EntityKind) -> FilterSettings {
        match kind {
            EntityKind::Shop => self.shop,
            EntityKind::User => self.user,
            EntityKind::Coupon => self.coupon,
        }
    }

    pub fn rebuild_interval(&self) -> Option<Duration> {
        match self.rebuild_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

impl Default for SeckillConfig {
    fn default() -> Self {
        Self {
            order_stream: "stream:orders".to_string(),
            consumer_group: "order-workers".to_string(),
            dead_letter_stream: "stream:orders:dlq".to_string(),
            dedup_retention_secs: 86_400,
        }
    }
}

impl SeckillConfig {
    pub fn dedup_retention(&self) -> Duration {
        Duration::from_secs(self.dedup_retention_secs)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            consumer_prefix: "worker".to_string(),
            batch_size: 10,
            block_ms: 2_000,
            claim_idle_ms: 30_000,
            retry_backoff_ms: 500,
            alert_threshold: 10,
        }
    }
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pipeline.workers == 0 {
            return Err(ConfigError::Message("pipeline.workers must be at least 1".to_string()));
        }
        if self.pipeline.batch_size == 0 {
            return Err(ConfigError::Message("pipeline.batch_size must be at least 1".to_string()));
        }
        if self.machine_id > 0x7F {
            return Err(ConfigError::Message("machine_id must fit in 7 bits".to_string()));
        }
        for kind in EntityKind::ALL {
            let settings = self.filters.settings(kind);
            if settings.capacity == 0 {
                return Err(ConfigError::Message(format!("filters.{}.capacity must be positive", kind)));
            }
            if !(settings.error_rate > 0.0 && settings.error_rate < 1.0) {
                return Err(ConfigError::Message(format!(
                    "filters.{}.error_rate must be within (0, 1)",
                    kind
                )));
            }
        }
        if self.cache.lock_ttl_ms == 0 || self.cache.shop_ttl_secs == 0 {
            return Err(ConfigError::Message("cache TTLs must be positive".to_string()));
        }
        if self.cache.reload_timeout_ms >= self.cache.lock_ttl_ms {
            return Err(ConfigError::Message(
                "cache.reload_timeout_ms must be below cache.lock_ttl_ms".to_string(),
            ));
        }
        Ok(())
    }
}

/// Defaults, then the optional config file, then `APP_*` environment
/// variables (`APP_PIPELINE__WORKERS=8` sets `pipeline.workers`).
pub fn load_config(path: Option<&str>) -> Result<AppConfig, ConfigError> {
    let s = Config::builder()
        // Set defaults
        .add_source(Config::try_from(&AppConfig::default())?)
        // Add configuration from a file
        .add_source(File::with_name(path.unwrap_or(DEFAULT_CONFIG_FILE)).required(path.is_some()))
        // Add configuration from environment variables
        .add_source(
            Environment::with_prefix("APP")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("scylla.hosts")
                .try_parsing(true),
        )
        .build()?;

    let config: AppConfig = s.try_deserialize()?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.filters.settings(EntityKind::User).error_rate, 0.001);
        assert_eq!(config.cache.lock_backoff(), Duration::from_millis(50));
        assert_eq!(config.filters.rebuild_interval(), Some(Duration::from_secs(3600)));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.pipeline.workers = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.filters.shop.error_rate = 1.5;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.filters.coupon.capacity = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.cache.lock_ttl_ms = 1_000;
        config.cache.reload_timeout_ms = 1_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = load_config(None).unwrap();
        assert_eq!(config.seckill.order_stream, "stream:orders");
        assert_eq!(config.seckill.dead_letter_stream, "stream:orders:dlq");
    }
}
