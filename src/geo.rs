//! Geo enrichment: resolve source IPs to location metadata
//!
//! Lookup order: private-address short circuit, TTL/LRU cache, then a
//! rate-limited outbound call to the provider. Concurrent lookups for the
//! same uncached IP are coalesced into a single outbound call.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use cached::{Cached, TimedSizedCache};
use chrono::Utc;
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::config::GeoConfig;
use crate::error::GeoError;
use crate::model::{ConnectionEvent, EnrichedAttack, Geo, GeoRecord};

/// Outbound IP-geolocation lookup.
#[async_trait]
pub trait GeoProvider: Send + Sync {
    async fn resolve(&self, ip: IpAddr) -> Result<GeoRecord, GeoError>;
}

/// ip-api.com client. Free tier, no API key, 1000 lookups per minute.
pub struct IpApi {
    client: reqwest::Client,
    base_url: String,
}

impl IpApi {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct IpApiResponse {
    status: String,
    #[serde(default)]
    country: Option<String>,
    #[serde(default, rename = "regionName")]
    region_name: Option<String>,
    #[serde(default)]
    city: Option<String>,
    #[serde(default)]
    lat: Option<f64>,
    #[serde(default)]
    lon: Option<f64>,
    #[serde(default)]
    timezone: Option<String>,
    #[serde(default)]
    isp: Option<String>,
}

#[async_trait]
impl GeoProvider for IpApi {
    async fn resolve(&self, ip: IpAddr) -> Result<GeoRecord, GeoError> {
        let url = format!("{}/{}", self.base_url, ip);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(GeoError::from_reqwest)?;

        if !response.status().is_success() {
            return Err(GeoError::Provider(format!("HTTP {}", response.status())));
        }

        let body: IpApiResponse = response
            .json()
            .await
            .map_err(|e| GeoError::Malformed(e.to_string()))?;

        if body.status != "success" {
            return Err(GeoError::Provider(format!(
                "lookup status '{}' for {}",
                body.status, ip
            )));
        }

        let now = Utc::now();
        Ok(GeoRecord {
            ip,
            country: body.country.unwrap_or_else(|| "Unknown".to_string()),
            city: body.city.unwrap_or_else(|| "Unknown".to_string()),
            region: body.region_name.unwrap_or_else(|| "Unknown".to_string()),
            latitude: body.lat.unwrap_or(0.0),
            longitude: body.lon.unwrap_or(0.0),
            timezone: body.timezone.unwrap_or_else(|| "UTC".to_string()),
            isp: body.isp.unwrap_or_else(|| "Unknown".to_string()),
            resolved_at: now,
            ttl_expires_at: now,
        })
    }
}

struct TokenBucket {
    tokens: f64,
    max_tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(max_tokens: f64, refill_per_sec: f64) -> Self {
        Self {
            tokens: max_tokens,
            max_tokens,
            refill_per_sec,
            last_refill: Instant::now(),
        }
    }

    fn try_consume(&mut self, tokens: f64) -> bool {
        self.refill();
        if self.tokens >= tokens {
            self.tokens -= tokens;
            true
        } else {
            false
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.max_tokens);
        self.last_refill = now;
    }
}

/// Token-bucket admission for outbound lookups, shared across workers.
/// Callers past the waiting bound are rejected instead of queued.
pub struct RateLimiter {
    bucket: Mutex<TokenBucket>,
    waiting: AtomicUsize,
    max_waiting: usize,
}

struct WaitGuard<'a>(&'a AtomicUsize);

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl RateLimiter {
    pub fn new(per_minute: u32, max_waiting: usize) -> Self {
        Self::with_rate(per_minute as f64, per_minute as f64 / 60.0, max_waiting)
    }

    pub fn with_rate(max_tokens: f64, refill_per_sec: f64, max_waiting: usize) -> Self {
        Self {
            bucket: Mutex::new(TokenBucket::new(max_tokens, refill_per_sec)),
            waiting: AtomicUsize::new(0),
            max_waiting,
        }
    }

    /// Admit one outbound lookup, waiting for a token if the bucket is
    /// empty. Waiting is unbounded in time (callers cancel via their own
    /// timeout) but bounded in occupancy.
    pub async fn acquire(&self) -> Result<(), GeoError> {
        if self.try_consume() {
            return Ok(());
        }
        if self.waiting.fetch_add(1, Ordering::SeqCst) >= self.max_waiting {
            self.waiting.fetch_sub(1, Ordering::SeqCst);
            return Err(GeoError::RateLimited);
        }
        let _guard = WaitGuard(&self.waiting);
        loop {
            tokio::time::sleep(self.time_to_next_token()).await;
            if self.try_consume() {
                return Ok(());
            }
        }
    }

    fn try_consume(&self) -> bool {
        self.bucket.lock().unwrap().try_consume(1.0)
    }

    fn time_to_next_token(&self) -> Duration {
        let bucket = self.bucket.lock().unwrap();
        if bucket.refill_per_sec <= f64::EPSILON {
            return Duration::from_millis(50);
        }
        let deficit = (1.0 - bucket.tokens).max(0.0);
        Duration::from_secs_f64((deficit / bucket.refill_per_sec).clamp(0.01, 1.0))
    }
}

enum LookupRole {
    Leader,
    Follower(broadcast::Receiver<Geo>),
}

/// Resolves source IPs to geo metadata with caching, rate limiting and
/// per-IP coalescing of concurrent lookups. Never fails: every resolution
/// problem degrades to `Geo::Unknown`.
pub struct GeoEnricher {
    provider: Arc<dyn GeoProvider>,
    cache: Mutex<TimedSizedCache<IpAddr, GeoRecord>>,
    inflight: Mutex<HashMap<IpAddr, broadcast::Sender<Geo>>>,
    limiter: RateLimiter,
    lookup_timeout: Duration,
    cache_ttl: chrono::Duration,
}

impl GeoEnricher {
    pub fn new(cfg: &GeoConfig, provider: Arc<dyn GeoProvider>) -> Self {
        Self {
            provider,
            cache: Mutex::new(TimedSizedCache::with_size_and_lifespan(
                cfg.cache_max_entries,
                cfg.cache_ttl_hours * 3600,
            )),
            inflight: Mutex::new(HashMap::new()),
            limiter: RateLimiter::new(cfg.rate_limit_per_min, cfg.rate_limit_queue),
            lookup_timeout: Duration::from_secs(cfg.lookup_timeout_secs),
            cache_ttl: chrono::Duration::hours(cfg.cache_ttl_hours as i64),
        }
    }

    /// Merge a connection event with geo metadata.
    pub async fn enrich(&self, event: ConnectionEvent) -> EnrichedAttack {
        let geo = self.lookup(event.source_address).await;
        EnrichedAttack::from_event(&event, geo)
    }

    pub async fn lookup(&self, ip: IpAddr) -> Geo {
        if is_private_ip(&ip) {
            return Geo::Known(self.private_record(ip));
        }
        if let Some(record) = self.cache_get(ip) {
            return Geo::Known(record);
        }

        // Singleflight: the first caller for an IP becomes the leader and
        // performs the outbound call; everyone else awaits its result.
        let role = {
            let mut inflight = self.inflight.lock().unwrap();
            // Re-check under the lock: a leader that just finished has
            // populated the cache before releasing its entry.
            if let Some(record) = self.cache_get(ip) {
                return Geo::Known(record);
            }
            match inflight.get(&ip) {
                Some(tx) => LookupRole::Follower(tx.subscribe()),
                None => {
                    let (tx, _) = broadcast::channel(1);
                    inflight.insert(ip, tx);
                    LookupRole::Leader
                }
            }
        };

        match role {
            LookupRole::Follower(mut rx) => {
                // The leader always completes within its own timeout; allow
                // slack so followers do not give up first.
                match tokio::time::timeout(self.lookup_timeout * 2, rx.recv()).await {
                    Ok(Ok(geo)) => geo,
                    _ => Geo::Unknown,
                }
            }
            LookupRole::Leader => {
                let geo = match tokio::time::timeout(self.lookup_timeout, self.resolve(ip)).await {
                    Ok(Ok(mut record)) => {
                        record.ttl_expires_at = record.resolved_at + self.cache_ttl;
                        self.cache_set(ip, record.clone());
                        Geo::Known(record)
                    }
                    Ok(Err(e)) => {
                        debug!(ip = %ip, "geo lookup failed: {e}");
                        Geo::Unknown
                    }
                    Err(_) => {
                        debug!(ip = %ip, "geo lookup timed out");
                        Geo::Unknown
                    }
                };
                // Cache is populated before the entry is removed, so a
                // late arrival either joins this flight or hits the cache.
                let tx = self.inflight.lock().unwrap().remove(&ip);
                if let Some(tx) = tx {
                    let _ = tx.send(geo.clone());
                }
                geo
            }
        }
    }

    async fn resolve(&self, ip: IpAddr) -> Result<GeoRecord, GeoError> {
        self.limiter.acquire().await?;
        self.provider.resolve(ip).await
    }

    fn cache_get(&self, ip: IpAddr) -> Option<GeoRecord> {
        self.cache.lock().unwrap().cache_get(&ip).cloned()
    }

    fn cache_set(&self, ip: IpAddr, record: GeoRecord) {
        self.cache.lock().unwrap().cache_set(ip, record);
    }

    fn private_record(&self, ip: IpAddr) -> GeoRecord {
        let now = Utc::now();
        GeoRecord {
            ip,
            country: "Private".to_string(),
            city: "Local Network".to_string(),
            region: "Private".to_string(),
            latitude: 0.0,
            longitude: 0.0,
            timezone: "UTC".to_string(),
            isp: "Private".to_string(),
            resolved_at: now,
            ttl_expires_at: now + self.cache_ttl,
        }
    }
}

/// Check if an IP address is private/local
fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => {
            ipv4.is_private()
                || ipv4.is_loopback()
                || ipv4.is_link_local()
                || ipv4.is_broadcast()
                || ipv4.is_documentation()
                || ipv4.is_unspecified()
        }
        IpAddr::V6(ipv6) => ipv6.is_loopback() || ipv6.is_unspecified(),
    }
}
