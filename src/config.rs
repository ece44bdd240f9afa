//! Configuration management

use anyhow::Result;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub listener: ListenerConfig,
    #[serde(default)]
    pub geo: GeoConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub feed: FeedConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    /// Monitored TCP port set, bound atomically at startup. Changing the
    /// set requires a restart.
    #[serde(default = "default_ports")]
    pub ports: Vec<u16>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeoConfig {
    #[serde(default = "default_provider_url")]
    pub provider_url: String,
    #[serde(default = "default_lookup_timeout_secs")]
    pub lookup_timeout_secs: u64,
    /// Outbound lookups admitted per minute (ip-api.com free tier allows
    /// 1000). Zero disables outbound lookups entirely.
    #[serde(default = "default_rate_limit_per_min")]
    pub rate_limit_per_min: u32,
    /// Lookups allowed to wait for a token before being rejected.
    #[serde(default = "default_rate_limit_queue")]
    pub rate_limit_queue: usize,
    #[serde(default = "default_cache_ttl_hours")]
    pub cache_ttl_hours: u64,
    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_url")]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Listener-to-coordinator channel capacity. Acceptors drop events
    /// rather than block when it fills.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "default_store_retries")]
    pub store_retries: u32,
    #[serde(default = "default_store_backoff_ms")]
    pub store_backoff_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_feed_port")]
    pub port: u16,
    /// Per-subscriber queue bound. On overflow the oldest queued message
    /// is dropped.
    #[serde(default = "default_queue_bound")]
    pub queue_bound: usize,
    /// Recent attacks replayed to a subscriber on connect.
    #[serde(default = "default_recent_history")]
    pub recent_history: i64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_ports() -> Vec<u16> {
    vec![22, 23, 80, 443, 3389, 3306, 5432]
}

fn default_provider_url() -> String {
    "http://ip-api.com/json".to_string()
}

fn default_lookup_timeout_secs() -> u64 {
    5
}

fn default_rate_limit_per_min() -> u32 {
    1000
}

fn default_rate_limit_queue() -> usize {
    256
}

fn default_cache_ttl_hours() -> u64 {
    24
}

fn default_cache_max_entries() -> usize {
    10_000
}

fn default_store_url() -> String {
    "attacks.db".to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_workers() -> usize {
    8
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_store_retries() -> u32 {
    3
}

fn default_store_backoff_ms() -> u64 {
    100
}

fn default_feed_port() -> u16 {
    8000
}

fn default_queue_bound() -> usize {
    64
}

fn default_recent_history() -> i64 {
    50
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            ports: default_ports(),
        }
    }
}

impl Default for GeoConfig {
    fn default() -> Self {
        Self {
            provider_url: default_provider_url(),
            lookup_timeout_secs: default_lookup_timeout_secs(),
            rate_limit_per_min: default_rate_limit_per_min(),
            rate_limit_queue: default_rate_limit_queue(),
            cache_ttl_hours: default_cache_ttl_hours(),
            cache_max_entries: default_cache_max_entries(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_store_url(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            channel_capacity: default_channel_capacity(),
            store_retries: default_store_retries(),
            store_backoff_ms: default_store_backoff_ms(),
        }
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_feed_port(),
            queue_bound: default_queue_bound(),
            recent_history: default_recent_history(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name("config.toml").required(false))
            .add_source(
                config::Environment::with_prefix("ATTACKMAP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("listener.ports"),
            );

        let settings = builder.build()?;
        let config: Config = settings.try_deserialize()?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.listener.ports.is_empty() {
            anyhow::bail!("Monitored port set cannot be empty");
        }
        if self.listener.host.is_empty() {
            anyhow::bail!("Listener host cannot be empty");
        }
        if self.geo.lookup_timeout_secs == 0 {
            anyhow::bail!("Geo lookup timeout must be at least 1 second");
        }
        if self.geo.cache_max_entries == 0 {
            anyhow::bail!("Geo cache size must be at least 1 entry");
        }
        if self.store.url.is_empty() {
            anyhow::bail!("Store URL cannot be empty");
        }
        if self.ingest.workers == 0 {
            anyhow::bail!("Ingestion worker count must be at least 1");
        }
        if self.ingest.channel_capacity == 0 {
            anyhow::bail!("Ingestion channel capacity must be at least 1");
        }
        if self.feed.queue_bound == 0 {
            anyhow::bail!("Subscriber queue bound must be at least 1");
        }
        Ok(())
    }
}
