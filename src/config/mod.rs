use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_CONFIG_PATH: &str = "./config/config.yaml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub kv: KvConfig,
    pub cache: CacheConfig,
    pub auth: AuthConfig,
    pub billing: BillingConfig,
    pub redirect_logger: RedirectLoggerConfig,
    pub persister: PersisterConfig,
    #[serde(default)]
    pub analytics: AnalyticsConfig,
    #[serde(default)]
    pub frontend: FrontendConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Base used when rendering short links, e.g. `http://sho.rt`.
    /// Falls back to the request's Host header when unset.
    #[serde(default)]
    pub public_base_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub backend: DatabaseBackend,
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseBackend {
    Sqlite,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvConfig {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub kind: CacheKind,
    #[serde(default)]
    pub memcached: MemcachedConfig,
    /// Stream every stored link into the cache on start
    pub warm_up: bool,
    pub miss_ttl_secs: u64,
    pub miss_capacity: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheKind {
    Memory,
    Redb,
    Memcached,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemcachedConfig {
    #[serde(default)]
    pub servers: Vec<String>,
    #[serde(default = "MemcachedConfig::default_timeout_ms")]
    pub timeout_ms: u64,
}

impl MemcachedConfig {
    const fn default_timeout_ms() -> u64 {
        500
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub secret: String,
    pub token_ttl_secs: u64,
    pub permission_cache_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingConfig {
    pub default_plan: String,
    pub reconcile_interval_ms: u64,
    pub max_concurrency: usize,
    #[serde(default)]
    pub payment: Option<PaymentConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentConfig {
    pub endpoint: String,
    pub api_key: String,
    #[serde(default = "PaymentConfig::default_timeout_secs")]
    pub timeout_secs: u64,
}

impl PaymentConfig {
    const fn default_timeout_secs() -> u64 {
        5
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedirectLoggerConfig {
    pub mode: LoggerMode,
    pub queue: String,
    pub buffer_size: usize,
    pub max_attempts: i64,
    pub visibility_timeout_secs: i64,
    /// Run a persister inside the server process instead of a separate `logsaver`
    pub consume_in_process: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoggerMode {
    Queue,
    Sync,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersisterConfig {
    pub batch_size: usize,
    pub idle_timeout_ms: u64,
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalyticsConfig {
    /// Path to a MaxMind Country/City .mmdb file
    #[serde(default)]
    pub geoip_db_path: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FrontendConfig {
    /// Path to directory containing static frontend files
    /// If None, uses the embedded landing page
    #[serde(default)]
    pub static_dir: Option<String>,
}

impl Config {
    /// Load the YAML file at `path` (optional), then `SHORTLY__SECTION__KEY`
    /// environment overrides, then `DATABASE_URL`.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let path = path.as_ref();
        let settings = config::Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 5000)?
            .set_default("database.backend", "sqlite")?
            .set_default("database.url", "sqlite://./shortly.db?mode=rwc")?
            .set_default("database.max_connections", 10)?
            .set_default("kv.path", "./shortly.redb")?
            .set_default("cache.kind", "memory")?
            .set_default("cache.warm_up", true)?
            .set_default("cache.miss_ttl_secs", 30)?
            .set_default("cache.miss_capacity", 100_000)?
            .set_default("auth.secret", "change-me")?
            .set_default("auth.token_ttl_secs", 86_400)?
            .set_default("auth.permission_cache_ttl_secs", 60)?
            .set_default("billing.default_plan", "free")?
            .set_default("billing.reconcile_interval_ms", 1000)?
            .set_default("billing.max_concurrency", 16)?
            .set_default("redirect_logger.mode", "queue")?
            .set_default("redirect_logger.queue", "redirects")?
            .set_default("redirect_logger.buffer_size", 10_000)?
            .set_default("redirect_logger.max_attempts", 5)?
            .set_default("redirect_logger.visibility_timeout_secs", 30)?
            .set_default("redirect_logger.consume_in_process", false)?
            .set_default("persister.batch_size", 10)?
            .set_default("persister.idle_timeout_ms", 1000)?
            .set_default("persister.shutdown_grace_secs", 10)?
            .add_source(config::File::from(path).required(false))
            .add_source(
                config::Environment::with_prefix("SHORTLY")
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("cache.memcached.servers")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("failed to read configuration from {}", path.display()))?;

        let mut config: Config = settings
            .try_deserialize()
            .context("invalid configuration")?;

        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database.url = url;
        }

        if config.cache.kind == CacheKind::Memcached && config.cache.memcached.servers.is_empty() {
            anyhow::bail!("cache.kind=memcached requires at least one cache.memcached.servers entry");
        }

        Ok(config)
    }
}
