//! Broadcast transports.
//!
//! A transport joins a [`Topic`] and relays opaque text frames to every
//! *other* member of it. Delivery is best effort: frames sent while a member
//! is offline are lost, which the bridge compensates for with its full-state
//! handshake on every (re)connect.

mod memory;
mod ws;

pub use memory::{HubFrame, MemoryHub, MemoryTransport};
pub use ws::WsTransport;

use async_trait::async_trait;
use tokio::sync::mpsc;

use textogether_types::Topic;

use crate::error::Result;

/// Frames buffered per direction before senders wait.
pub const FRAME_BUFFER: usize = 1024;

/// One live membership in a topic.
///
/// Dropping the connection leaves the topic. The transport closes `inbound`
/// when the membership is lost.
#[derive(Debug)]
pub struct Connection {
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<String>,
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Join `topic`. Self-delivery is excluded by the transport.
    async fn connect(&self, topic: &Topic) -> Result<Connection>;
}
