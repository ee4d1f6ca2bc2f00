use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, RwLock};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::{config::RelayConfig, ratelimit::RateLimiter};

/// Longest accepted topic name.
const MAX_TOPIC_LEN: usize = 200;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RelayConfig>,
    pub hub: Arc<RelayHub>,
    pub rate_limiter: Arc<RateLimiter>,
}

impl AppState {
    pub fn new(config: RelayConfig) -> Self {
        let hub = Arc::new(RelayHub::new(config.topic_capacity));
        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
        Self {
            config: Arc::new(config),
            hub,
            rate_limiter,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/topics", get(list_topics))
        .route("/ws/topic/{topic}", get(ws_topic))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(config: RelayConfig) -> Result<()> {
    let listener = TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "textogether-relay listening");
    serve_on(listener, AppState::new(config)).await
}

/// Serve on an already bound listener.
pub async fn serve_on(listener: TcpListener, state: AppState) -> Result<()> {
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn list_topics(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.hub.summaries().await)
}

fn valid_topic(topic: &str) -> bool {
    !topic.is_empty()
        && topic.len() <= MAX_TOPIC_LEN
        && topic
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

async fn ws_topic(
    Path(topic): Path<String>,
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    if !valid_topic(&topic) {
        return (StatusCode::BAD_REQUEST, "invalid topic name").into_response();
    }

    ws.max_message_size(state.config.max_frame_bytes)
        .on_upgrade(move |socket| async move {
            handle_ws(socket, topic, state).await;
        })
        .into_response()
}

// ─────────────────────────────────────────────────────────────────────────────
// Topic fan-out
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct RelayFrame {
    sender: u64,
    message: WsMessage,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TopicSummary {
    pub topic: String,
    pub subscribers: usize,
}

pub struct TopicRoom {
    tx: broadcast::Sender<RelayFrame>,
    subscribers: AtomicUsize,
}

impl TopicRoom {
    fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            subscribers: AtomicUsize::new(0),
        }
    }

    fn publish(&self, frame: RelayFrame) {
        let _ = self.tx.send(frame);
    }
}

/// Live topics and their subscribers.
pub struct RelayHub {
    topics: RwLock<HashMap<String, Arc<TopicRoom>>>,
    capacity: usize,
    next_connection: AtomicU64,
}

impl RelayHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            next_connection: AtomicU64::new(1),
        }
    }

    async fn join(&self, topic: &str) -> (u64, Arc<TopicRoom>, broadcast::Receiver<RelayFrame>) {
        let connection = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let mut topics = self.topics.write().await;
        let room = topics
            .entry(topic.to_string())
            .or_insert_with(|| Arc::new(TopicRoom::new(self.capacity)))
            .clone();
        room.subscribers.fetch_add(1, Ordering::SeqCst);
        let rx = room.tx.subscribe();
        (connection, room, rx)
    }

    async fn leave(&self, topic: &str, room: &TopicRoom) {
        let mut topics = self.topics.write().await;
        if room.subscribers.fetch_sub(1, Ordering::SeqCst) == 1 {
            topics.remove(topic);
        }
    }

    pub async fn summaries(&self) -> Vec<TopicSummary> {
        let topics = self.topics.read().await;
        let mut out: Vec<_> = topics
            .iter()
            .map(|(topic, room)| TopicSummary {
                topic: topic.clone(),
                subscribers: room.subscribers.load(Ordering::SeqCst),
            })
            .collect();
        out.sort_by(|a, b| a.topic.cmp(&b.topic));
        out
    }
}

async fn handle_ws(mut socket: WebSocket, topic: String, state: AppState) {
    let (connection, room, mut broadcast_rx) = state.hub.join(&topic).await;
    info!(%topic, connection, "subscriber joined");

    loop {
        tokio::select! {
            // Frames from other subscribers
            recv = broadcast_rx.recv() => {
                match recv {
                    Ok(frame) if frame.sender == connection => {}
                    Ok(frame) => {
                        if socket.send(frame.message).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        // Dropping the socket makes the client reconnect and resync.
                        warn!(%topic, connection, missed, "subscriber lagged, disconnecting");
                        break;
                    }
                }
            }
            // Frames from this subscriber
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(message @ (WsMessage::Text(_) | WsMessage::Binary(_)))) => {
                        if let Err(retry_after) = state.rate_limiter.check(connection).await {
                            warn!(%topic, connection, ?retry_after, "publisher over rate limit, disconnecting");
                            break;
                        }
                        room.publish(RelayFrame { sender: connection, message });
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        debug!(%topic, connection, %err, "websocket read failed");
                        break;
                    }
                }
            }
        }
    }

    state.hub.leave(&topic, &room).await;
    state.rate_limiter.forget(connection).await;
    info!(%topic, connection, "subscriber left");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_names() {
        assert!(valid_topic("document-textogether-abc"));
        assert!(valid_topic("a.b_c-1"));
        assert!(!valid_topic(""));
        assert!(!valid_topic("a/b"));
        assert!(!valid_topic(&"x".repeat(MAX_TOPIC_LEN + 1)));
    }

    #[tokio::test]
    async fn test_hub_tracks_subscribers() {
        let hub = RelayHub::new(8);
        let (first, room_a, _rx_a) = hub.join("t").await;
        let (second, room_b, _rx_b) = hub.join("t").await;
        assert_ne!(first, second);
        assert!(Arc::ptr_eq(&room_a, &room_b));
        assert_eq!(
            hub.summaries().await,
            vec![TopicSummary {
                topic: "t".into(),
                subscribers: 2
            }]
        );

        hub.leave("t", &room_a).await;
        hub.leave("t", &room_b).await;
        assert!(hub.summaries().await.is_empty());
    }
}
