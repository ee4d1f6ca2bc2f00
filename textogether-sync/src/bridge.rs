//! Bridge between one replica and the broadcast topic of its document.
//!
//! The bridge owns a single task that keeps at most one [`Connection`] alive:
//!
//! ```text
//! Disconnected -> Connecting -> Subscribed { synced: false } -> Subscribed { synced: true }
//!       ^              |                          |                           |
//!       +--- backoff --+--------------------------+---------------------------+
//! ```
//!
//! On every connect the full document state is broadcast once, so peers pick
//! up whatever was edited offline. After that each local commit goes out as
//! its own delta. Remote updates are only imported; an import never produces
//! a local update, so nothing received is ever sent back.
//!
//! Presence rides along: local awareness changes are broadcast, remote ones
//! are only applied. A fresh awareness client id is taken for every session
//! after the first. Peers that see a new client join answer with their full
//! state, which is how a reconnecting replica catches up on edits it missed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use textogether_types::{ClientId, Envelope, Topic};

use crate::awareness::{Awareness, AwarenessChange, AwarenessOrigin, DEFAULT_TIMEOUT};
use crate::doc::{DocUpdate, SharedText};
use crate::error::{Result, SyncError};
use crate::transport::{Connection, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Subscribed { synced: bool },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Subscribed { .. })
    }

    pub fn is_synced(&self) -> bool {
        matches!(self, ConnectionState::Subscribed { synced: true })
    }

    /// Status line shown next to the editor.
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::Subscribed { .. } => "Connected",
            _ => "Connecting...",
        }
    }
}

/// Reconnect and presence timing.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// How often awareness timeouts are checked.
    pub awareness_tick: Duration,
}

impl BridgeConfig {
    /// Timing suited to an awareness store with the given inactivity timeout.
    pub fn for_timeout(timeout: Duration) -> Self {
        Self {
            awareness_tick: (timeout / 10).max(Duration::from_millis(10)),
            ..Self::default()
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(2500),
            awareness_tick: DEFAULT_TIMEOUT / 10,
        }
    }
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}

/// Handle on a running bridge task.
pub struct SyncBridge {
    topic: Topic,
    state: watch::Receiver<ConnectionState>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncBridge {
    /// Start syncing `doc` and `awareness` over `transport`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        topic: Topic,
        doc: Arc<SharedText>,
        awareness: Arc<Awareness>,
        transport: Arc<dyn Transport>,
        config: BridgeConfig,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let worker = Worker {
            topic: topic.clone(),
            updates: doc.subscribe_updates(),
            presence: awareness.subscribe(),
            doc,
            awareness,
            transport,
            config,
            state: state_tx,
            sessions: 0,
        };
        let task = tokio::spawn(worker.run(shutdown_rx));

        Self {
            topic,
            state: state_rx,
            shutdown: shutdown_tx,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Wait until the current session has completed its handshake.
    pub async fn wait_synced(&self) -> Result<()> {
        let mut state = self.state.clone();
        state
            .wait_for(ConnectionState::is_synced)
            .await
            .map(|_| ())
            .map_err(|_| SyncError::Closed)
    }

    /// Announce departure if connected, drop the connection and stop the task.
    ///
    /// Calling it again is a no-op.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(topic = %self.topic, error = %e, "bridge task ended abnormally");
            }
        }
    }
}

impl Drop for SyncBridge {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

enum SessionEnd {
    Lost,
    Shutdown,
}

struct Worker {
    topic: Topic,
    doc: Arc<SharedText>,
    awareness: Arc<Awareness>,
    transport: Arc<dyn Transport>,
    config: BridgeConfig,
    state: watch::Sender<ConnectionState>,
    updates: broadcast::Receiver<DocUpdate>,
    presence: broadcast::Receiver<AwarenessChange>,
    sessions: u64,
}

impl Worker {
    fn set_state(&self, next: ConnectionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            debug!(topic = %self.topic, ?prev, ?next, "bridge state changed");
        }
    }

    fn check_timeouts(&self) {
        let expired = self.awareness.check_timeouts(Instant::now());
        if !expired.is_empty() {
            debug!(topic = %self.topic, clients = ?expired.removed, "expired silent peers");
        }
    }

    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(self.config.awareness_tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut backoff = self.config.initial_backoff;

        'outer: loop {
            if *shutdown.borrow() {
                break;
            }
            self.set_state(ConnectionState::Connecting);

            let transport = self.transport.clone();
            let connected = tokio::select! {
                res = transport.connect(&self.topic) => res,
                _ = shutdown.changed() => break,
            };

            match connected {
                Ok(conn) => {
                    backoff = self.config.initial_backoff;
                    info!(topic = %self.topic, "subscribed");
                    match self.session(conn, &mut tick, &mut shutdown).await {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Lost => info!(topic = %self.topic, "connection lost"),
                    }
                }
                Err(e) => warn!(topic = %self.topic, error = %e, "connect failed"),
            }

            self.set_state(ConnectionState::Disconnected);
            debug!(topic = %self.topic, ?backoff, "reconnecting after backoff");
            let wait = tokio::time::sleep(backoff);
            tokio::pin!(wait);
            loop {
                tokio::select! {
                    _ = &mut wait => break,
                    _ = tick.tick() => self.check_timeouts(),
                    _ = shutdown.changed() => break 'outer,
                }
            }
            backoff = next_backoff(backoff, self.config.max_backoff);
        }

        // Stopping while offline still ends our presence locally.
        self.awareness.remove_local_state();
        self.set_state(ConnectionState::Disconnected);
        debug!(topic = %self.topic, "bridge stopped");
    }

    async fn session(
        &mut self,
        conn: Connection,
        tick: &mut tokio::time::Interval,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        let Connection {
            outbound,
            mut inbound,
        } = conn;

        self.sessions += 1;
        let mut announce = vec![self.awareness.client_id()];
        if self.sessions > 1 {
            announce.push(self.awareness.renew_client_id());
        }
        // Anything queued while offline is covered by the handshake.
        self.updates = self.updates.resubscribe();
        self.presence = self.presence.resubscribe();

        self.set_state(ConnectionState::Subscribed { synced: false });
        if let Err(e) = self.send_full_state(&outbound).await {
            warn!(topic = %self.topic, error = %e, "handshake failed");
            return SessionEnd::Lost;
        }
        self.set_state(ConnectionState::Subscribed { synced: true });

        if self.awareness.local_state().is_some() {
            if let Err(e) = self.send_awareness(&outbound, &announce).await {
                warn!(topic = %self.topic, error = %e, "presence announce failed");
                return SessionEnd::Lost;
            }
        }

        loop {
            let step = tokio::select! {
                frame = inbound.recv() => match frame {
                    Some(frame) => self.handle_frame(&frame, &outbound).await,
                    None => return SessionEnd::Lost,
                },
                update = self.updates.recv() => match update {
                    Ok(update) if update.is_local() => {
                        let envelope = Envelope::DocumentUpdate { update: update.bytes.to_vec() };
                        send(&outbound, &envelope).await
                    }
                    Ok(_) => Ok(()),
                    Err(RecvError::Lagged(missed)) => {
                        warn!(topic = %self.topic, missed, "fell behind local updates, resending full state");
                        self.send_full_state(&outbound).await
                    }
                    Err(RecvError::Closed) => return SessionEnd::Shutdown,
                },
                change = self.presence.recv() => match change {
                    Ok(change) if change.origin == AwarenessOrigin::Local => {
                        self.send_awareness(&outbound, &change.clients()).await
                    }
                    Ok(_) => Ok(()),
                    Err(RecvError::Lagged(_)) => {
                        let local = [self.awareness.client_id()];
                        self.send_awareness(&outbound, &local).await
                    }
                    Err(RecvError::Closed) => return SessionEnd::Shutdown,
                },
                _ = tick.tick() => {
                    self.check_timeouts();
                    Ok(())
                }
                _ = shutdown.changed() => {
                    self.depart(&outbound).await;
                    return SessionEnd::Shutdown;
                }
            };

            if let Err(e) = step {
                warn!(topic = %self.topic, error = %e, "send failed");
                return SessionEnd::Lost;
            }
        }
    }

    /// Apply one inbound frame. Only send failures are returned.
    async fn handle_frame(&self, frame: &str, outbound: &mpsc::Sender<String>) -> Result<()> {
        let envelope = match Envelope::from_frame(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(topic = %self.topic, error = %e, len = frame.len(), "discarding malformed frame");
                return Ok(());
            }
        };

        match envelope {
            Envelope::DocumentUpdate { update } => {
                if let Err(e) = self.doc.apply_update(&update) {
                    warn!(topic = %self.topic, error = %e, "discarding undecodable document update");
                }
                Ok(())
            }
            Envelope::AwarenessUpdate { update } => {
                let change = match self.awareness.apply_update(&update) {
                    Ok(change) => change,
                    Err(e) => {
                        warn!(topic = %self.topic, error = %e, "discarding invalid awareness update");
                        return Ok(());
                    }
                };
                if change.added.is_empty() {
                    return Ok(());
                }
                debug!(topic = %self.topic, peers = ?change.added, "welcoming new peers");
                self.send_full_state(outbound).await?;
                if self.awareness.local_state().is_some() {
                    let local = [self.awareness.client_id()];
                    self.send_awareness(outbound, &local).await?;
                }
                Ok(())
            }
        }
    }

    async fn send_full_state(&self, outbound: &mpsc::Sender<String>) -> Result<()> {
        let update = self.doc.encode_state_as_update()?;
        send(outbound, &Envelope::DocumentUpdate { update }).await
    }

    async fn send_awareness(
        &self,
        outbound: &mpsc::Sender<String>,
        clients: &[ClientId],
    ) -> Result<()> {
        let update = self.awareness.encode_update(clients)?;
        send(outbound, &Envelope::AwarenessUpdate { update }).await
    }

    /// Best-effort goodbye so peers drop our cursor without waiting for the timeout.
    async fn depart(&self, outbound: &mpsc::Sender<String>) {
        if !self.awareness.remove_local_state() {
            return;
        }
        let local = [self.awareness.client_id()];
        if let Err(e) = self.send_awareness(outbound, &local).await {
            debug!(topic = %self.topic, error = %e, "departure not delivered");
        }
    }
}

async fn send(outbound: &mpsc::Sender<String>, envelope: &Envelope) -> Result<()> {
    let frame = envelope.to_frame()?;
    outbound
        .send(frame)
        .await
        .map_err(|_| SyncError::Transport("connection closed".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = BridgeConfig::default();
        let mut delay = config.initial_backoff;
        let mut seen = vec![delay];
        for _ in 0..6 {
            delay = next_backoff(delay, config.max_backoff);
            seen.push(delay);
        }
        let millis: Vec<u128> = seen.iter().map(Duration::as_millis).collect();
        assert_eq!(millis, vec![100, 200, 400, 800, 1600, 2500, 2500]);
    }

    #[test]
    fn test_state_labels() {
        assert_eq!(ConnectionState::Disconnected.label(), "Connecting...");
        assert_eq!(ConnectionState::Connecting.label(), "Connecting...");
        assert_eq!(
            ConnectionState::Subscribed { synced: false }.label(),
            "Connected"
        );
        assert!(!ConnectionState::Subscribed { synced: false }.is_synced());
        assert!(ConnectionState::Subscribed { synced: true }.is_synced());
    }

    #[test]
    fn test_config_for_timeout() {
        let config = BridgeConfig::for_timeout(Duration::from_secs(1));
        assert_eq!(config.awareness_tick, Duration::from_millis(100));
        assert_eq!(config.initial_backoff, Duration::from_millis(100));
    }
}
