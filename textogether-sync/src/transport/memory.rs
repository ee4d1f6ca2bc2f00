//! In-process hub used by tests and single-process setups.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use textogether_types::Topic;

use super::{Connection, Transport, FRAME_BUFFER};
use crate::error::{Result, SyncError};

/// A frame as seen by the hub, with the transport that sent it.
#[derive(Debug, Clone)]
pub struct HubFrame {
    pub sender: u64,
    pub frame: String,
}

struct Member {
    transport: u64,
    connection: u64,
    tx: mpsc::Sender<String>,
}

#[derive(Default)]
struct HubState {
    topics: HashMap<Topic, Vec<Member>>,
    history: HashMap<Topic, Vec<HubFrame>>,
}

/// Broadcast hub delivering every frame to all other members of its topic.
#[derive(Clone, Default)]
pub struct MemoryHub {
    state: Arc<Mutex<HubState>>,
    record_history: bool,
    next_id: Arc<AtomicU64>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep a copy of every delivered frame, readable through [`history`](Self::history).
    pub fn with_history() -> Self {
        Self {
            record_history: true,
            ..Self::default()
        }
    }

    /// A transport for one client, initially online.
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            hub: self.clone(),
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            online: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn history(&self, topic: &Topic) -> Vec<HubFrame> {
        self.state
            .lock()
            .history
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    pub fn member_count(&self, topic: &Topic) -> usize {
        self.state.lock().topics.get(topic).map_or(0, Vec::len)
    }

    fn join(&self, topic: &Topic, transport: u64, tx: mpsc::Sender<String>) -> u64 {
        let connection = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.state
            .lock()
            .topics
            .entry(topic.clone())
            .or_default()
            .push(Member {
                transport,
                connection,
                tx,
            });
        debug!(%topic, transport, connection, "joined memory topic");
        connection
    }

    fn leave(&self, topic: &Topic, connection: u64) {
        let mut state = self.state.lock();
        if let Some(members) = state.topics.get_mut(topic) {
            members.retain(|m| m.connection != connection);
            if members.is_empty() {
                state.topics.remove(topic);
            }
        }
    }

    /// Drop every membership of `transport`, closing their inbound streams.
    fn sever(&self, transport: u64) {
        let mut state = self.state.lock();
        for members in state.topics.values_mut() {
            members.retain(|m| m.transport != transport);
        }
        state.topics.retain(|_, members| !members.is_empty());
    }

    /// Recipients of a frame, or `None` if the sender is no longer a member.
    fn route(&self, topic: &Topic, connection: u64, frame: &str) -> Option<Vec<mpsc::Sender<String>>> {
        let mut state = self.state.lock();
        let members = state.topics.get(topic)?;
        let sender = members.iter().find(|m| m.connection == connection)?.transport;
        let targets = members
            .iter()
            .filter(|m| m.connection != connection)
            .map(|m| m.tx.clone())
            .collect();
        if self.record_history {
            state
                .history
                .entry(topic.clone())
                .or_default()
                .push(HubFrame {
                    sender,
                    frame: frame.to_string(),
                });
        }
        Some(targets)
    }
}

/// One client's handle on a [`MemoryHub`].
#[derive(Clone)]
pub struct MemoryTransport {
    hub: MemoryHub,
    id: u64,
    online: Arc<AtomicBool>,
}

impl MemoryTransport {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Simulate losing or regaining the network.
    ///
    /// Going offline severs every live connection of this transport and makes
    /// further connects fail until it is back online.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
        if !online {
            self.hub.sever(self.id);
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, topic: &Topic) -> Result<Connection> {
        if !self.is_online() {
            return Err(SyncError::Transport("network unavailable".to_string()));
        }

        let (in_tx, in_rx) = mpsc::channel(FRAME_BUFFER);
        let (out_tx, mut out_rx) = mpsc::channel::<String>(FRAME_BUFFER);
        let connection = self.hub.join(topic, self.id, in_tx);

        let hub = self.hub.clone();
        let topic = topic.clone();
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let Some(targets) = hub.route(&topic, connection, &frame) else {
                    trace!(%topic, connection, "dropping frame from severed connection");
                    continue;
                };
                for tx in targets {
                    let _ = tx.send(frame.clone()).await;
                }
            }
            hub.leave(&topic, connection);
        });

        Ok(Connection {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topic(name: &str) -> Topic {
        Topic::from_raw(name)
    }

    #[tokio::test]
    async fn test_frames_reach_others_but_not_sender() {
        let hub = MemoryHub::with_history();
        let a = hub.transport();
        let b = hub.transport();
        let mut ca = a.connect(&topic("t")).await.unwrap();
        let mut cb = b.connect(&topic("t")).await.unwrap();

        ca.outbound.send("hello".into()).await.unwrap();
        assert_eq!(cb.inbound.recv().await.unwrap(), "hello");
        assert!(ca.inbound.try_recv().is_err());

        let history = hub.history(&topic("t"));
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].sender, a.id());
    }

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let hub = MemoryHub::new();
        let a = hub.transport().connect(&topic("one")).await.unwrap();
        let mut b = hub.transport().connect(&topic("two")).await.unwrap();

        a.outbound.send("x".into()).await.unwrap();
        tokio::task::yield_now().await;
        assert!(b.inbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_offline_severs_and_blocks() {
        let hub = MemoryHub::new();
        let a = hub.transport();
        let mut conn = a.connect(&topic("t")).await.unwrap();

        a.set_online(false);
        assert!(conn.inbound.recv().await.is_none());
        assert!(matches!(
            a.connect(&topic("t")).await,
            Err(SyncError::Transport(_))
        ));

        a.set_online(true);
        assert!(a.connect(&topic("t")).await.is_ok());
    }
}
