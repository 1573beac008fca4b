use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub proxy: ProxyConfig,
    pub upstream: UpstreamConfig,
    pub cache: CacheConfig,
    #[serde(default)]
    pub events: EventsConfig,
}

// ---------------------------------------------------------------------------
// Proxy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Socket address for the HTTP listener (e.g. `0.0.0.0:8080`).
    pub http_listen: String,
}

// ---------------------------------------------------------------------------
// Upstream (backing file store)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Base URL of the backing file store; objects are fetched from
    /// `{base_url}/{uid}`.
    pub base_url: String,
    /// Connect timeout for upstream requests, in seconds.  Body streaming
    /// is not bounded here since large objects take as long as they take.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_connect_timeout() -> u64 {
    10
}

// ---------------------------------------------------------------------------
// Cache tiers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Directory holding the disk tier, one flat file per cache key.
    pub path: String,
    /// Memory-tier budget in bytes.
    #[serde(default = "default_precache_capacity")]
    pub precache_capacity: u64,
    /// Disk-tier budget in bytes.
    #[serde(default = "default_disk_capacity")]
    pub disk_capacity: u64,
    /// Largest single object admitted to the cache, in bytes.
    #[serde(default = "default_disk_max_file_size")]
    pub disk_max_file_size: u64,
    /// Staleness horizon: entries older than this are invalidated lazily
    /// on the next lookup.
    #[serde(default = "default_ttl_ms")]
    pub ttl_ms: u64,
    /// How long a lookup will wait for an in-flight fill before reporting
    /// a miss.
    #[serde(default = "default_pending_wait_ms")]
    pub pending_wait_ms: u64,
}

fn default_precache_capacity() -> u64 {
    128 * 1024 * 1024
}

fn default_disk_capacity() -> u64 {
    1024 * 1024 * 1024
}

fn default_disk_max_file_size() -> u64 {
    4 * 1024 * 1024
}

fn default_ttl_ms() -> u64 {
    5_000
}

fn default_pending_wait_ms() -> u64 {
    2_000
}

// ---------------------------------------------------------------------------
// Events (write-hash feed)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct EventsConfig {
    /// Name of the environment variable holding the shared secret for
    /// write-hash webhook signatures.  When the variable is unset the feed
    /// is accepted unsigned.
    #[serde(default = "default_webhook_secret_env")]
    pub webhook_secret_env: String,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            webhook_secret_env: default_webhook_secret_env(),
        }
    }
}

fn default_webhook_secret_env() -> String {
    "BLOBCACHE_WEBHOOK_SECRET".to_string()
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    validate_config(&config)?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(
        config.cache.precache_capacity > 0,
        "precache_capacity must be positive"
    );
    anyhow::ensure!(
        config.cache.disk_capacity > 0,
        "disk_capacity must be positive"
    );
    anyhow::ensure!(
        config.cache.disk_max_file_size > 0,
        "disk_max_file_size must be positive"
    );
    anyhow::ensure!(
        config.cache.disk_max_file_size <= config.cache.disk_capacity,
        "disk_max_file_size must not exceed disk_capacity"
    );
    anyhow::ensure!(config.cache.ttl_ms > 0, "ttl_ms must be positive");
    anyhow::ensure!(
        !config.upstream.base_url.is_empty(),
        "upstream base_url must not be empty"
    );
    Ok(())
}
