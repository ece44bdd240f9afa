//! Shared test doubles for the pipeline seams

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, Semaphore};
use uuid::Uuid;

use crate::broadcast::FeedTransport;
use crate::error::{GeoError, StoreError, TransportError};
use crate::geo::GeoProvider;
use crate::model::{EnrichedAttack, Geo, GeoRecord};
use crate::store::EventStore;

pub fn known_geo(ip: &str) -> Geo {
    let now = Utc::now();
    Geo::Known(GeoRecord {
        ip: ip.parse().unwrap(),
        country: "Testland".to_string(),
        city: "Springfield".to_string(),
        region: "TS".to_string(),
        latitude: 1.5,
        longitude: 2.5,
        timezone: "UTC".to_string(),
        isp: "TestNet".to_string(),
        resolved_at: now,
        ttl_expires_at: now,
    })
}

pub fn sample_attack(ip: &str, port: u16, geo: Geo) -> EnrichedAttack {
    EnrichedAttack {
        id: None,
        correlation_key: Uuid::new_v4(),
        source_address: ip.parse().unwrap(),
        destination_port: port,
        protocol: "tcp".to_string(),
        geo,
        observed_at: Utc::now(),
        additional_data: None,
    }
}

pub fn sample_attack_with_id(id: i64, ip: &str, port: u16, geo: Geo) -> EnrichedAttack {
    let mut attack = sample_attack(ip, port, geo);
    attack.id = Some(id);
    attack
}

/// Geo provider double returning a fixed record, with configurable latency
/// and per-IP simulated outages.
pub struct MockProvider {
    calls: AtomicUsize,
    delay: Duration,
    fail_ips: Mutex<HashSet<IpAddr>>,
}

impl MockProvider {
    pub fn new() -> Arc<Self> {
        Self::with_delay(Duration::ZERO)
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            delay,
            fail_ips: Mutex::new(HashSet::new()),
        })
    }

    pub fn fail_for(&self, ip: IpAddr) {
        self.fail_ips.lock().unwrap().insert(ip);
    }

    pub fn recover(&self, ip: IpAddr) {
        self.fail_ips.lock().unwrap().remove(&ip);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GeoProvider for MockProvider {
    async fn resolve(&self, ip: IpAddr) -> Result<GeoRecord, GeoError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail_ips.lock().unwrap().contains(&ip) {
            return Err(GeoError::Provider("simulated outage".to_string()));
        }
        let now = Utc::now();
        Ok(GeoRecord {
            ip,
            country: "Testland".to_string(),
            city: "Springfield".to_string(),
            region: "TS".to_string(),
            latitude: 1.5,
            longitude: 2.5,
            timezone: "UTC".to_string(),
            isp: "TestNet".to_string(),
            resolved_at: now,
            ttl_expires_at: now,
        })
    }
}

/// In-memory event store with scriptable failures.
pub struct MemoryStore {
    rows: Mutex<Vec<EnrichedAttack>>,
    by_key: Mutex<HashMap<Uuid, i64>>,
    attempts: AtomicUsize,
    transient_failures: AtomicU32,
    permanent: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            rows: Mutex::new(Vec::new()),
            by_key: Mutex::new(HashMap::new()),
            attempts: AtomicUsize::new(0),
            transient_failures: AtomicU32::new(0),
            permanent: AtomicBool::new(false),
        })
    }

    /// The next `n` appends fail with a transient error.
    pub fn fail_transient(&self, n: u32) {
        self.transient_failures.store(n, Ordering::SeqCst);
    }

    pub fn fail_permanently(&self) {
        self.permanent.store(true, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    pub fn append_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn append(&self, attack: &EnrichedAttack) -> Result<i64, StoreError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.permanent.load(Ordering::SeqCst) {
            return Err(StoreError::Permanent("simulated write failure".to_string()));
        }
        if self.transient_failures.load(Ordering::SeqCst) > 0 {
            self.transient_failures.fetch_sub(1, Ordering::SeqCst);
            return Err(StoreError::Transient("simulated busy".to_string()));
        }

        let mut by_key = self.by_key.lock().unwrap();
        if let Some(id) = by_key.get(&attack.correlation_key) {
            return Ok(*id);
        }
        let mut rows = self.rows.lock().unwrap();
        let id = rows.len() as i64 + 1;
        let mut stored = attack.clone();
        stored.id = Some(id);
        rows.push(stored);
        by_key.insert(attack.correlation_key, id);
        Ok(id)
    }

    async fn get_recent(&self, limit: i64) -> Result<Vec<EnrichedAttack>, StoreError> {
        let rows = self.rows.lock().unwrap();
        let skip = rows.len().saturating_sub(limit.max(0) as usize);
        Ok(rows[skip..].to_vec())
    }
}

/// Feed transport double backed by an unbounded channel, with optional
/// gating (slow consumer) and scripted failures.
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<String>,
    gate: Option<Arc<Semaphore>>,
    fail_after: Option<usize>,
    sent: usize,
}

impl ChannelTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                gate: None,
                fail_after: None,
                sent: 0,
            },
            rx,
        )
    }

    /// Each send waits for one permit from the gate.
    pub fn gated(gate: Arc<Semaphore>) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (mut transport, rx) = Self::new();
        transport.gate = Some(gate);
        (transport, rx)
    }

    /// Fails on the first send.
    pub fn failing() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (mut transport, rx) = Self::new();
        transport.fail_after = Some(0);
        (transport, rx)
    }
}

#[async_trait]
impl FeedTransport for ChannelTransport {
    async fn send(&mut self, payload: &str) -> Result<(), TransportError> {
        if let Some(gate) = &self.gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|_| TransportError::Closed("gate closed".to_string()))?;
            permit.forget();
        }
        if matches!(self.fail_after, Some(n) if self.sent >= n) {
            return Err(TransportError::Closed("simulated disconnect".to_string()));
        }
        self.sent += 1;
        self.tx
            .send(payload.to_string())
            .map_err(|_| TransportError::Closed("receiver dropped".to_string()))
    }
}
