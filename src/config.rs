use std::env;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
    /// Bounded pool: exhaustion surfaces as an acquire timeout, not a queue
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
    #[serde(default = "default_redis_key_prefix")]
    pub key_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// TTL of the fast-store link payload written on create/resolve
    #[serde(default = "default_link_ttl")]
    pub link_ttl_secs: u64,
    /// Process-local tier TTL of the layered cache
    #[serde(default = "default_memory_ttl")]
    pub memory_ttl_secs: u64,
    /// Fast-store tier TTL of the layered cache
    #[serde(default = "default_fast_ttl")]
    pub fast_ttl_secs: u64,
    /// TTL of per-code counters and sketches
    #[serde(default = "default_counter_ttl")]
    pub counter_ttl_secs: u64,
    /// TTL of cached topic/owner rollups
    #[serde(default = "default_aggregate_ttl")]
    pub aggregate_ttl_secs: u64,
    /// TTL of the JSON aggregate snapshots behind the rollups
    #[serde(default = "default_snapshot_ttl")]
    pub snapshot_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between pending-link / pending-visit drains.
    /// 0 = pick by environment (10s development, 30s production).
    #[serde(default)]
    pub reconcile_interval_secs: u64,
    #[serde(default = "default_counter_interval")]
    pub counter_interval_secs: u64,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_environment")]
    pub environment: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub file: Option<String>,
}

fn default_database_url() -> String {
    "sqlite://snaplink.db".to_string()
}

fn default_pool_size() -> u32 {
    20
}

fn default_acquire_timeout_secs() -> u64 {
    2
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/".to_string()
}

fn default_redis_key_prefix() -> String {
    "snaplink:".to_string()
}

fn default_link_ttl() -> u64 {
    24 * 60 * 60
}

fn default_memory_ttl() -> u64 {
    300
}

fn default_fast_ttl() -> u64 {
    24 * 60 * 60
}

fn default_counter_ttl() -> u64 {
    24 * 60 * 60
}

fn default_aggregate_ttl() -> u64 {
    300
}

fn default_snapshot_ttl() -> u64 {
    3600
}

fn default_counter_interval() -> u64 {
    3600
}

fn default_cleanup_interval() -> u64 {
    24 * 60 * 60
}

fn default_batch_size() -> usize {
    100
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            redis: RedisConfig::default(),
            cache: CacheConfig::default(),
            scheduler: SchedulerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            pool_size: default_pool_size(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            key_prefix: default_redis_key_prefix(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            link_ttl_secs: default_link_ttl(),
            memory_ttl_secs: default_memory_ttl(),
            fast_ttl_secs: default_fast_ttl(),
            counter_ttl_secs: default_counter_ttl(),
            aggregate_ttl_secs: default_aggregate_ttl(),
            snapshot_ttl_secs: default_snapshot_ttl(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: 0,
            counter_interval_secs: default_counter_interval(),
            cleanup_interval_secs: default_cleanup_interval(),
            batch_size: default_batch_size(),
            environment: default_environment(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

impl SchedulerConfig {
    /// Effective drain interval: explicit value wins, otherwise 10s in
    /// development and 30s in production.
    pub fn effective_reconcile_interval_secs(&self) -> u64 {
        if self.reconcile_interval_secs > 0 {
            return self.reconcile_interval_secs;
        }
        if self.environment == "production" { 30 } else { 10 }
    }
}

impl Config {
    /// Load configuration from TOML file with environment variable fallback
    pub fn load() -> Self {
        let mut config = Self::load_from_file();
        config.override_with_env();
        config
    }

    fn load_from_file() -> Self {
        let config_paths = [
            "config.toml",
            "snaplink.toml",
            "config/config.toml",
            "/etc/snaplink/config.toml",
        ];

        for path in &config_paths {
            if Path::new(path).exists() {
                debug!("Loading config from: {}", path);
                match fs::read_to_string(path) {
                    Ok(content) => match toml::from_str::<Config>(&content) {
                        Ok(config) => {
                            debug!("Successfully loaded config from: {}", path);
                            return config;
                        }
                        Err(e) => {
                            warn!("Failed to parse config file {}: {}", path, e);
                        }
                    },
                    Err(e) => {
                        warn!("Failed to read config file {}: {}", path, e);
                    }
                }
            }
        }

        debug!("No config file found, using defaults");
        Self::default()
    }

    fn override_with_env(&mut self) {
        if let Ok(url) = env::var("DATABASE_URL") {
            self.database.url = url;
        }
        if let Ok(size) = env::var("DATABASE_POOL_SIZE")
            && let Ok(size) = size.parse()
        {
            self.database.pool_size = size;
        }
        if let Ok(url) = env::var("REDIS_URL") {
            self.redis.url = url;
        }
        if let Ok(prefix) = env::var("REDIS_KEY_PREFIX") {
            self.redis.key_prefix = prefix;
        }
        if let Ok(ttl) = env::var("LINK_TTL_SECS")
            && let Ok(ttl) = ttl.parse()
        {
            self.cache.link_ttl_secs = ttl;
        }
        if let Ok(env_name) = env::var("SNAPLINK_ENV") {
            self.scheduler.environment = env_name;
        }
        if let Ok(interval) = env::var("RECONCILE_INTERVAL_SECS")
            && let Ok(interval) = interval.parse()
        {
            self.scheduler.reconcile_interval_secs = interval;
        }
        if let Ok(level) = env::var("RUST_LOG") {
            self.logging.level = level;
        }
        if let Ok(file) = env::var("LOG_FILE") {
            self.logging.file = Some(file);
        }
    }
}

// Global configuration instance, used by the binary only. Library components
// receive plain values at construction so tests never touch this.
use std::sync::OnceLock;
static CONFIG: OnceLock<Config> = OnceLock::new();

pub fn get_config() -> &'static Config {
    CONFIG.get_or_init(Config::load)
}
