//! WebSocket client for the textogether relay.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use textogether_types::Topic;

use super::{Connection, Transport, FRAME_BUFFER};
use crate::error::{Result, SyncError};

/// Joins topics on a relay at `{base_url}/ws/topic/{topic}`.
#[derive(Debug, Clone)]
pub struct WsTransport {
    base_url: String,
}

impl WsTransport {
    /// `base_url` is the relay root, e.g. `ws://localhost:8787`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    pub fn topic_url(&self, topic: &Topic) -> String {
        format!("{}/ws/topic/{}", self.base_url.trim_end_matches('/'), topic)
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self, topic: &Topic) -> Result<Connection> {
        let url = self.topic_url(topic);
        let (stream, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| SyncError::Transport(format!("connect to {url} failed: {e}")))?;
        info!(%url, "connected to relay");

        let (mut write, mut read) = stream.split();
        let (in_tx, in_rx) = mpsc::channel(FRAME_BUFFER);
        let (out_tx, mut out_rx) = mpsc::channel::<String>(FRAME_BUFFER);

        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(e) = write.send(Message::text(frame)).await {
                    warn!(error = %e, "relay write failed");
                    return;
                }
            }
            let _ = write.send(Message::Close(None)).await;
        });

        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                let frame = match msg {
                    Ok(Message::Text(text)) => text.as_str().to_owned(),
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => text,
                        Err(_) => {
                            warn!(len = bytes.len(), "discarding non-utf8 relay frame");
                            continue;
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!(error = %e, "relay read failed");
                        break;
                    }
                };
                if in_tx.send(frame).await.is_err() {
                    break;
                }
            }
            debug!("relay reader finished");
        });

        Ok(Connection {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
