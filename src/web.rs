//! Live-feed web server
//!
//! One WebSocket per subscriber: on connect the client is warm-started
//! with recent history, then handed to the broadcaster as a transport.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::broadcast::{Broadcaster, FeedTransport};
use crate::config::FeedConfig;
use crate::error::TransportError;
use crate::model::FeedMessage;
use crate::store::EventStore;

pub struct FeedState {
    pub broadcaster: Arc<Broadcaster>,
    pub store: Arc<dyn EventStore>,
    pub recent_history: i64,
}

struct WsTransport {
    sink: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl FeedTransport for WsTransport {
    async fn send(&mut self, payload: &str) -> Result<(), TransportError> {
        self.sink
            .send(Message::Text(payload.to_string()))
            .await
            .map_err(|e| TransportError::Closed(e.to_string()))
    }
}

fn is_disconnect(frame: &Message) -> bool {
    matches!(frame, Message::Close(_))
}

async fn root() -> impl IntoResponse {
    Json(json!({
        "service": "attack-map",
        "live_feed": "/ws",
    }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<FeedState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Replay recent attacks to the new subscriber, then register its socket
/// as a broadcaster transport. Attacks published between the history read
/// and registration are not replayed; the live feed is best-effort.
async fn handle_socket(socket: WebSocket, state: Arc<FeedState>) {
    let (mut sink, mut stream) = socket.split();
    match state.store.get_recent(state.recent_history).await {
        Ok(recent) => {
            for attack in &recent {
                let message = FeedMessage::from_attack(attack);
                match serde_json::to_string(&message) {
                    Ok(json) => {
                        if sink.send(Message::Text(json)).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => warn!("failed to serialize history message: {e}"),
                }
            }
        }
        Err(e) => warn!("failed to load recent attacks for warm start: {e}"),
    }
    let id = state.broadcaster.register(Box::new(WsTransport { sink }));

    // Drain client frames so a Close (or a dead socket) unregisters the
    // subscriber without waiting for the next publish.
    let broadcaster = state.broadcaster.clone();
    tokio::spawn(async move {
        loop {
            match stream.next().await {
                Some(Ok(frame)) if !is_disconnect(&frame) => continue,
                _ => break,
            }
        }
        debug!(subscriber = id, "live-feed client disconnected");
        broadcaster.unregister(id);
    });
}

pub async fn start_server(
    cfg: &FeedConfig,
    state: Arc<FeedState>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let app = Router::new()
        .route("/", get(root))
        .route("/ws", get(ws_handler))
        .with_state(state);

    let addr = format!("{}:{}", cfg.host, cfg.port);
    info!("live-feed server listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;

    Ok(())
}
