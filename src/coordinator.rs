//! Ingestion coordinator: wires listener → enricher → store → broadcaster
//!
//! A pool of workers consumes connection events concurrently, so temporal
//! ordering across events is best-effort. Failures are contained per
//! event: a storage failure after retries drops only that event.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use rand::Rng;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::broadcast::Broadcaster;
use crate::config::IngestConfig;
use crate::geo::GeoEnricher;
use crate::model::{ConnectionEvent, EnrichedAttack};
use crate::store::EventStore;

#[derive(Debug, Default)]
pub struct IngestMetrics {
    pub ingested: AtomicU64,
    pub geo_unknown: AtomicU64,
    /// Events dropped after exhausting store retries.
    pub store_failures: AtomicU64,
    /// Events dropped by acceptors because the ingest channel was full.
    pub dropped_events: AtomicU64,
}

pub struct IngestionCoordinator {
    enricher: Arc<GeoEnricher>,
    store: Arc<dyn EventStore>,
    broadcaster: Arc<Broadcaster>,
    workers: usize,
    store_retries: u32,
    store_backoff: Duration,
    metrics: Arc<IngestMetrics>,
}

impl IngestionCoordinator {
    pub fn new(
        cfg: &IngestConfig,
        enricher: Arc<GeoEnricher>,
        store: Arc<dyn EventStore>,
        broadcaster: Arc<Broadcaster>,
    ) -> Self {
        Self {
            enricher,
            store,
            broadcaster,
            workers: cfg.workers,
            store_retries: cfg.store_retries,
            store_backoff: Duration::from_millis(cfg.store_backoff_ms),
            metrics: Arc::new(IngestMetrics::default()),
        }
    }

    pub fn metrics(&self) -> Arc<IngestMetrics> {
        self.metrics.clone()
    }

    /// Consume connection events until the channel closes and drains, then
    /// close every subscriber channel. Worker count bounds concurrent
    /// enrichments.
    pub async fn run(self: Arc<Self>, rx: mpsc::Receiver<ConnectionEvent>) {
        let rx = Arc::new(Mutex::new(rx));
        let mut handles = Vec::with_capacity(self.workers);
        for worker in 0..self.workers {
            let coordinator = self.clone();
            let rx = rx.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let event = { rx.lock().await.recv().await };
                    match event {
                        Some(event) => coordinator.process(event).await,
                        None => break,
                    }
                }
                debug!(worker, "ingestion worker finished");
            }));
        }
        join_all(handles).await;
        info!("ingestion drained, closing subscriber channels");
        self.broadcaster.close_all();
    }

    async fn process(&self, event: ConnectionEvent) {
        debug!(
            ip = %event.source_address,
            source_port = event.source_port,
            port = event.destination_port,
            "processing connection event"
        );
        let mut attack = self.enricher.enrich(event).await;
        if attack.geo.is_unknown() {
            self.metrics.geo_unknown.fetch_add(1, Ordering::Relaxed);
        }

        match self.append_with_retry(&attack).await {
            Some(id) => {
                attack.id = Some(id);
                self.broadcaster.publish(&attack);
                self.metrics.ingested.fetch_add(1, Ordering::Relaxed);
                info!(
                    ip = %attack.source_address,
                    port = attack.destination_port,
                    country = attack.geo.country(),
                    "attack recorded"
                );
            }
            None => {
                self.metrics.store_failures.fetch_add(1, Ordering::Relaxed);
                error!(
                    ip = %attack.source_address,
                    port = attack.destination_port,
                    "dropping attack after exhausting store retries"
                );
            }
        }
    }

    /// At-least-once append: retries reuse the attack's correlation key,
    /// so an ambiguous response cannot produce duplicate rows.
    async fn append_with_retry(&self, attack: &EnrichedAttack) -> Option<i64> {
        let mut delay = self.store_backoff;
        for attempt in 0..=self.store_retries {
            match self.store.append(attack).await {
                Ok(id) => return Some(id),
                Err(e) if e.is_transient() && attempt < self.store_retries => {
                    warn!(attempt, "transient store failure, retrying: {e}");
                    tokio::time::sleep(with_jitter(delay)).await;
                    delay *= 2;
                }
                Err(e) => {
                    warn!("store append failed: {e}");
                    return None;
                }
            }
        }
        None
    }
}

fn with_jitter(delay: Duration) -> Duration {
    let millis = delay.as_millis() as u64;
    let jitter = rand::thread_rng().gen_range(0..=millis / 2 + 1);
    Duration::from_millis(millis + jitter)
}
