//! Multi-port TCP capture listener
//!
//! Binds the whole monitored port set atomically, then runs one acceptor
//! task per port. Connections are closed as soon as the peer address is
//! known: no banner, no reads, no interaction with the source.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::coordinator::IngestMetrics;
use crate::error::ListenerError;
use crate::model::ConnectionEvent;

const ACCEPT_BACKOFF_INITIAL: Duration = Duration::from_millis(100);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(5);
const MAX_CONSECUTIVE_ACCEPT_ERRORS: u32 = 10;

#[derive(Debug)]
pub struct PortListener {
    sockets: Vec<(u16, TcpListener)>,
}

impl PortListener {
    /// Bind every monitored port, or none: the first failure drops all
    /// sockets bound so far and reports the offending port.
    pub async fn bind(host: &str, ports: &[u16]) -> Result<Self, ListenerError> {
        let mut sockets = Vec::with_capacity(ports.len());
        for &port in ports {
            let listener = TcpListener::bind((host, port))
                .await
                .map_err(|source| ListenerError::Bind { port, source })?;
            let bound = listener
                .local_addr()
                .map_err(|source| ListenerError::Bind { port, source })?
                .port();
            sockets.push((bound, listener));
        }
        Ok(Self { sockets })
    }

    /// Ports actually bound (resolves port 0 requests).
    pub fn ports(&self) -> Vec<u16> {
        self.sockets.iter().map(|(port, _)| *port).collect()
    }

    /// Start one acceptor task per port. Acceptors hand events off with
    /// `try_send` and never wait on downstream processing.
    pub fn run(
        self,
        tx: mpsc::Sender<ConnectionEvent>,
        shutdown: watch::Receiver<bool>,
        metrics: Arc<IngestMetrics>,
    ) {
        for (port, listener) in self.sockets {
            tokio::spawn(accept_loop(
                port,
                listener,
                tx.clone(),
                shutdown.clone(),
                metrics.clone(),
            ));
        }
    }
}

async fn accept_loop(
    port: u16,
    listener: TcpListener,
    tx: mpsc::Sender<ConnectionEvent>,
    mut shutdown: watch::Receiver<bool>,
    metrics: Arc<IngestMetrics>,
) {
    info!(port, "capture listener started");
    let mut backoff = ACCEPT_BACKOFF_INITIAL;
    let mut consecutive_errors = 0u32;

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!(port, "capture listener stopping");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    // Terminate immediately, before any data exchange.
                    drop(stream);
                    consecutive_errors = 0;
                    backoff = ACCEPT_BACKOFF_INITIAL;

                    let event = ConnectionEvent::tcp(peer.ip(), peer.port(), port);
                    if tx.try_send(event).is_err() {
                        metrics.dropped_events.fetch_add(1, Ordering::Relaxed);
                        warn!(port, "ingest channel full, dropping connection event");
                    }
                }
                Err(e) => {
                    consecutive_errors += 1;
                    if consecutive_errors >= MAX_CONSECUTIVE_ACCEPT_ERRORS {
                        // Fatal for this port only; the other listeners
                        // keep running.
                        error!(port, "persistent accept failure, stopping this port: {e}");
                        break;
                    }
                    warn!(port, "accept error (retrying in {:?}): {e}", backoff);
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(ACCEPT_BACKOFF_MAX);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpStream;

    fn metrics() -> Arc<IngestMetrics> {
        Arc::new(IngestMetrics::default())
    }

    #[tokio::test]
    async fn accepted_connection_emits_exactly_one_event() {
        let listener = PortListener::bind("127.0.0.1", &[0]).await.unwrap();
        let port = listener.ports()[0];
        let (tx, mut rx) = mpsc::channel(16);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        listener.run(tx, shutdown_rx, metrics());

        let _conn = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.destination_port, port);
        assert_eq!(event.protocol, "tcp");
        assert!(event.source_address.is_loopback());

        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn each_port_reports_its_own_events() {
        let listener = PortListener::bind("127.0.0.1", &[0, 0]).await.unwrap();
        let ports = listener.ports();
        let (tx, mut rx) = mpsc::channel(16);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        listener.run(tx, shutdown_rx, metrics());

        let _a = TcpStream::connect(("127.0.0.1", ports[0])).await.unwrap();
        let _b = TcpStream::connect(("127.0.0.1", ports[1])).await.unwrap();

        let mut seen = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
        seen.sort_by_key(|e| e.destination_port);
        let mut expected = ports.clone();
        expected.sort_unstable();
        assert_eq!(seen[0].destination_port, expected[0]);
        assert_eq!(seen[1].destination_port, expected[1]);
    }

    #[tokio::test]
    async fn full_channel_drops_and_counts_the_event() {
        let listener = PortListener::bind("127.0.0.1", &[0]).await.unwrap();
        let port = listener.ports()[0];
        let (tx, mut rx) = mpsc::channel(1);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = metrics();
        listener.run(tx, shutdown_rx, stats.clone());

        let _a = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let _b = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while stats.dropped_events.load(Ordering::Relaxed) == 0 {
            assert!(
                tokio::time::Instant::now() < deadline,
                "acceptor never reported the dropped event"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(rx.recv().await.unwrap().destination_port, port);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn bind_is_all_or_nothing() {
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let taken = occupied.local_addr().unwrap().port();

        let err = PortListener::bind("127.0.0.1", &[0, taken])
            .await
            .unwrap_err();
        let ListenerError::Bind { port, .. } = err;
        assert_eq!(port, taken);
    }

    #[tokio::test]
    async fn shutdown_stops_accepting() {
        let listener = PortListener::bind("127.0.0.1", &[0]).await.unwrap();
        let port = listener.ports()[0];
        let (tx, mut rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        listener.run(tx, shutdown_rx, metrics());

        shutdown_tx.send(true).unwrap();
        // All senders drop once the acceptor exits.
        assert!(rx.recv().await.is_none());
        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
    }
}
