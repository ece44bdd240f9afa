//! attack-map - honeypot that captures TCP connection attempts and streams
//! geo-enriched attacks to live viewers
//!
//! Pipeline: port listeners accept and immediately close connections,
//! ingestion workers enrich each event with geo metadata, persist it, and
//! broadcast it to every live-feed subscriber.

mod broadcast;
mod config;
mod coordinator;
mod error;
mod geo;
mod listener;
mod model;
mod store;
#[cfg(test)]
mod testutil;
mod web;

use anyhow::Result;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{info, Level};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (before any other initialization)
    let _ = dotenvy::dotenv();

    // Initialize logging based on LOG_FORMAT env var
    // Use LOG_FORMAT=gcp for structured GCP Cloud Logging
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "gcp" {
        tracing_subscriber::registry()
            .with(tracing_subscriber::filter::LevelFilter::INFO)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(Level::INFO)
            .init();
    }

    info!("Starting attack-map...");

    let config = config::Config::load()?;
    info!("Configuration loaded");

    let store = Arc::new(store::SqliteStore::connect(&config.store).await?);
    store.run_migrations().await?;
    info!(
        "Event store initialized ({} attacks recorded)",
        store.total_count().await?
    );

    let provider = Arc::new(geo::IpApi::new(
        &config.geo.provider_url,
        Duration::from_secs(config.geo.lookup_timeout_secs),
    )?);
    let enricher = Arc::new(geo::GeoEnricher::new(&config.geo, provider));

    let broadcaster = broadcast::Broadcaster::new(config.feed.queue_bound);

    let (event_tx, event_rx) = mpsc::channel(config.ingest.channel_capacity);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let coordinator = Arc::new(coordinator::IngestionCoordinator::new(
        &config.ingest,
        enricher,
        store.clone(),
        broadcaster.clone(),
    ));
    let metrics = coordinator.metrics();

    let port_listener =
        listener::PortListener::bind(&config.listener.host, &config.listener.ports).await?;
    info!("Capturing connections on ports {:?}", port_listener.ports());
    port_listener.run(event_tx, shutdown_rx.clone(), metrics.clone());

    let ingest = tokio::spawn(coordinator.run(event_rx));

    let feed_state = Arc::new(web::FeedState {
        broadcaster: broadcaster.clone(),
        store,
        recent_history: config.feed.recent_history,
    });
    let feed_config = config.feed.clone();
    let feed_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        if let Err(e) = web::start_server(&feed_config, feed_state, feed_shutdown).await {
            tracing::error!("Live-feed server failed: {e}");
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested, stopping listeners...");
    let _ = shutdown_tx.send(true);

    // Acceptors stop, the event channel drains, workers finish, then the
    // broadcaster closes every subscriber channel.
    ingest.await?;
    info!(
        ingested = metrics.ingested.load(Ordering::Relaxed),
        geo_unknown = metrics.geo_unknown.load(Ordering::Relaxed),
        store_failures = metrics.store_failures.load(Ordering::Relaxed),
        dropped_events = metrics.dropped_events.load(Ordering::Relaxed),
        published = broadcaster.published_count(),
        "Shutdown complete"
    );

    Ok(())
}
