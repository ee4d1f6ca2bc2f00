//! Ephemeral presence shared between the replicas of one document.
//!
//! Every client owns one entry, keyed by a random [`ClientId`] and guarded by
//! a logical clock. Entries are never persisted. Since the transport does not
//! report departures, a remote entry is dropped once it has not been
//! refreshed for the inactivity timeout, and the local entry is re-announced
//! every half timeout to stay alive on the other side.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, trace};

use textogether_types::{ClientId, Identity};

use crate::error::{Result, SyncError};

/// Schema version of [`PresenceState`].
pub const PRESENCE_VERSION: u32 = 1;

/// Schema version of the awareness wire payload.
pub const WIRE_VERSION: u32 = 1;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const CHANNEL_CAPACITY: usize = 256;

/// Selection of one client, as absolute character offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CursorRange {
    pub anchor: usize,
    pub head: usize,
}

impl CursorRange {
    pub fn caret(at: usize) -> Self {
        Self {
            anchor: at,
            head: at,
        }
    }

    pub fn start(&self) -> usize {
        self.anchor.min(self.head)
    }

    pub fn end(&self) -> usize {
        self.anchor.max(self.head)
    }
}

/// Presence record of one client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PresenceState {
    pub version: u32,
    pub user_id: String,
    pub display_name: String,
    /// `#rrggbb`
    pub color: String,
    #[serde(default)]
    pub cursor: Option<CursorRange>,
    #[serde(default)]
    pub extensions: BTreeMap<String, serde_json::Value>,
}

impl PresenceState {
    pub fn for_identity(identity: &Identity) -> Self {
        Self {
            version: PRESENCE_VERSION,
            user_id: identity.user_id.clone(),
            display_name: identity.display_name.clone(),
            color: random_color(),
            cursor: None,
            extensions: BTreeMap::new(),
        }
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if self.version != PRESENCE_VERSION {
            return Err(format!("unsupported presence version {}", self.version));
        }
        if self.display_name.trim().is_empty() {
            return Err("empty display name".to_string());
        }
        if !is_hex_color(&self.color) {
            return Err(format!("invalid color {:?}", self.color));
        }
        Ok(())
    }
}

fn is_hex_color(color: &str) -> bool {
    color.len() == 7
        && color.starts_with('#')
        && color[1..].chars().all(|c| c.is_ascii_hexdigit())
}

/// Random `#rrggbb` color for a new participant.
pub fn random_color() -> String {
    let bits = uuid::Uuid::new_v4().as_u128() as u32;
    format!("#{:06x}", bits & 0x00ff_ffff)
}

/// Partial change to the local presence. Unset fields keep their value.
#[derive(Debug, Clone, Default)]
pub struct PresenceUpdate {
    user_id: Option<String>,
    display_name: Option<String>,
    color: Option<String>,
    cursor: Option<Option<CursorRange>>,
    extensions: BTreeMap<String, serde_json::Value>,
}

impl PresenceUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn identity(mut self, identity: &Identity) -> Self {
        self.user_id = Some(identity.user_id.clone());
        self.display_name = Some(identity.display_name.clone());
        self
    }

    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn color(mut self, color: impl Into<String>) -> Self {
        self.color = Some(color.into());
        self
    }

    pub fn cursor(mut self, cursor: Option<CursorRange>) -> Self {
        self.cursor = Some(cursor);
        self
    }

    pub fn extension(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extensions.insert(key.into(), value);
        self
    }

    fn apply_to(self, state: &mut PresenceState) {
        if let Some(user_id) = self.user_id {
            state.user_id = user_id;
        }
        if let Some(name) = self.display_name {
            state.display_name = name;
        }
        if let Some(color) = self.color {
            state.color = color;
        }
        if let Some(cursor) = self.cursor {
            state.cursor = cursor;
        }
        state.extensions.extend(self.extensions);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwarenessOrigin {
    Local,
    Remote,
    Timeout,
}

/// Summary of one awareness mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwarenessChange {
    pub added: Vec<ClientId>,
    pub updated: Vec<ClientId>,
    pub removed: Vec<ClientId>,
    pub origin: AwarenessOrigin,
}

impl AwarenessChange {
    fn new(origin: AwarenessOrigin) -> Self {
        Self {
            added: Vec::new(),
            updated: Vec::new(),
            removed: Vec::new(),
            origin,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// Every client touched by this change.
    pub fn clients(&self) -> Vec<ClientId> {
        self.added
            .iter()
            .chain(&self.updated)
            .chain(&self.removed)
            .copied()
            .collect()
    }
}

#[derive(Debug, Clone)]
struct Entry {
    state: Option<PresenceState>,
    clock: u64,
    last_seen: Instant,
}

#[derive(Serialize, Deserialize)]
struct WireUpdate {
    version: u32,
    entries: Vec<WireEntry>,
}

#[derive(Serialize, Deserialize)]
struct WireEntry {
    client_id: ClientId,
    clock: u64,
    state: Option<PresenceState>,
}

struct Inner {
    client_id: ClientId,
    entries: HashMap<ClientId, Entry>,
}

/// Presence store for one document.
pub struct Awareness {
    inner: Mutex<Inner>,
    timeout: Duration,
    changes: broadcast::Sender<AwarenessChange>,
}

impl Awareness {
    pub fn new(client_id: ClientId, timeout: Duration) -> Self {
        let (changes, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            inner: Mutex::new(Inner {
                client_id,
                entries: HashMap::new(),
            }),
            timeout,
            changes,
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.inner.lock().client_id
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AwarenessChange> {
        self.changes.subscribe()
    }

    fn emit(&self, change: AwarenessChange) -> AwarenessChange {
        if !change.is_empty() {
            let _ = self.changes.send(change.clone());
        }
        change
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Local entry
    // ─────────────────────────────────────────────────────────────────────────

    /// Merge `update` into the local entry, creating it from defaults if absent.
    pub fn set_local_state(&self, update: PresenceUpdate) -> PresenceState {
        let mut change = AwarenessChange::new(AwarenessOrigin::Local);
        let state = {
            let mut inner = self.inner.lock();
            let local = inner.client_id;
            let entry = inner.entries.entry(local).or_insert_with(|| Entry {
                state: None,
                clock: 0,
                last_seen: Instant::now(),
            });

            let mut state = match entry.state.take() {
                Some(state) => {
                    change.updated.push(local);
                    state
                }
                None => {
                    change.added.push(local);
                    PresenceState::for_identity(&Identity::anonymous())
                }
            };
            update.apply_to(&mut state);
            entry.state = Some(state.clone());
            entry.clock += 1;
            entry.last_seen = Instant::now();
            state
        };
        self.emit(change);
        state
    }

    pub fn local_state(&self) -> Option<PresenceState> {
        let inner = self.inner.lock();
        inner
            .entries
            .get(&inner.client_id)
            .and_then(|e| e.state.clone())
    }

    /// Mark the local client as gone. Returns `false` if it had no state.
    pub fn remove_local_state(&self) -> bool {
        let removed = {
            let mut inner = self.inner.lock();
            let local = inner.client_id;
            match inner.entries.get_mut(&local) {
                Some(entry) if entry.state.is_some() => {
                    entry.state = None;
                    entry.clock += 1;
                    entry.last_seen = Instant::now();
                    true
                }
                _ => false,
            }
        };
        if removed {
            let mut change = AwarenessChange::new(AwarenessOrigin::Local);
            change.removed.push(self.client_id());
            self.emit(change);
        }
        removed
    }

    /// Move the local entry to a fresh client id and tombstone the old one.
    ///
    /// Peers see the old id leave and a new participant join, which makes
    /// them send their full document state to the new id.
    pub fn renew_client_id(&self) -> ClientId {
        let mut change = AwarenessChange::new(AwarenessOrigin::Local);
        let new_id = {
            let mut inner = self.inner.lock();
            let old_id = inner.client_id;
            let new_id = ClientId::random();
            inner.client_id = new_id;

            if let Some(entry) = inner.entries.get_mut(&old_id) {
                if let Some(state) = entry.state.take() {
                    entry.clock += 1;
                    entry.last_seen = Instant::now();
                    change.removed.push(old_id);
                    change.added.push(new_id);
                    let fresh = Entry {
                        state: Some(state),
                        clock: 1,
                        last_seen: Instant::now(),
                    };
                    inner.entries.insert(new_id, fresh);
                }
            }
            debug!(%old_id, %new_id, "renewed awareness client id");
            new_id
        };
        self.emit(change);
        new_id
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    /// Every present client, local included.
    pub fn get_states(&self) -> HashMap<ClientId, PresenceState> {
        self.inner
            .lock()
            .entries
            .iter()
            .filter_map(|(id, e)| e.state.clone().map(|s| (*id, s)))
            .collect()
    }

    pub fn clock_of(&self, client: ClientId) -> Option<u64> {
        self.inner.lock().entries.get(&client).map(|e| e.clock)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Wire encoding
    // ─────────────────────────────────────────────────────────────────────────

    /// Encode the known entries of `clients`, departed ones as `null`.
    pub fn encode_update(&self, clients: &[ClientId]) -> Result<Vec<u8>> {
        let entries = {
            let inner = self.inner.lock();
            clients
                .iter()
                .filter_map(|id| {
                    inner.entries.get(id).map(|e| WireEntry {
                        client_id: *id,
                        clock: e.clock,
                        state: e.state.clone(),
                    })
                })
                .collect()
        };
        let payload = WireUpdate {
            version: WIRE_VERSION,
            entries,
        };
        serde_json::to_vec(&payload)
            .map_err(|e| SyncError::Decode(format!("failed to encode awareness update: {e}")))
    }

    pub fn encode_local_update(&self) -> Result<Vec<u8>> {
        let local = self.client_id();
        self.encode_update(&[local])
    }

    /// Merge a remote payload.
    ///
    /// The whole payload is rejected if any record fails validation.
    pub fn apply_update(&self, bytes: &[u8]) -> Result<AwarenessChange> {
        let payload: WireUpdate = serde_json::from_slice(bytes)
            .map_err(|e| SyncError::Decode(format!("malformed awareness update: {e}")))?;
        if payload.version != WIRE_VERSION {
            return Err(SyncError::Decode(format!(
                "unsupported awareness version {}",
                payload.version
            )));
        }
        for entry in &payload.entries {
            if let Some(state) = &entry.state {
                state.validate().map_err(|reason| {
                    SyncError::Decode(format!("invalid presence for {}: {reason}", entry.client_id))
                })?;
            }
        }

        let now = Instant::now();
        let mut change = AwarenessChange::new(AwarenessOrigin::Remote);
        let mut reannounce = None;
        {
            let mut inner = self.inner.lock();
            let local = inner.client_id;
            for WireEntry {
                client_id,
                clock,
                state,
            } in payload.entries
            {
                let (newer, prev_clock) = match inner.entries.get(&client_id) {
                    None => (clock > 0 || state.is_some(), 0),
                    Some(e) => (
                        clock > e.clock
                            || (clock == e.clock && state.is_none() && e.state.is_some()),
                        e.clock,
                    ),
                };
                if !newer {
                    trace!(%client_id, clock, prev_clock, "ignoring stale awareness entry");
                    continue;
                }

                if client_id == local {
                    // Another peer claims to know better about us; outbid it.
                    if let Some(entry) = inner.entries.get_mut(&local) {
                        if entry.state.is_some() {
                            entry.clock = clock + 1;
                            entry.last_seen = now;
                            reannounce = Some(local);
                        }
                    }
                    continue;
                }

                let entry = inner.entries.entry(client_id).or_insert_with(|| Entry {
                    state: None,
                    clock: 0,
                    last_seen: now,
                });
                match (&entry.state, &state) {
                    (None, Some(_)) => change.added.push(client_id),
                    (Some(old), Some(new)) if old != new => change.updated.push(client_id),
                    (Some(_), None) => change.removed.push(client_id),
                    _ => {}
                }
                entry.state = state;
                entry.clock = clock;
                entry.last_seen = now;
            }
        }

        if let Some(local) = reannounce {
            let mut local_change = AwarenessChange::new(AwarenessOrigin::Local);
            local_change.updated.push(local);
            self.emit(local_change);
        }
        Ok(self.emit(change))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Expiry
    // ─────────────────────────────────────────────────────────────────────────

    /// Drop silent remote entries, prune old tombstones and renew the local
    /// entry when due.
    ///
    /// Returns the removals; a local heartbeat is only announced on the
    /// change stream.
    pub fn check_timeouts(&self, now: Instant) -> AwarenessChange {
        let mut expired = AwarenessChange::new(AwarenessOrigin::Timeout);
        let mut heartbeat = AwarenessChange::new(AwarenessOrigin::Local);
        {
            let mut inner = self.inner.lock();
            let local = inner.client_id;
            let timeout = self.timeout;
            // Departed entries are forgotten one timeout after they left.
            inner.entries.retain(|id, entry| {
                *id == local
                    || entry.state.is_some()
                    || now.saturating_duration_since(entry.last_seen) < timeout
            });
            for (id, entry) in inner.entries.iter_mut() {
                if entry.state.is_none() {
                    continue;
                }
                let silent = now.saturating_duration_since(entry.last_seen);
                if *id == local {
                    if silent >= self.timeout / 2 {
                        entry.clock += 1;
                        entry.last_seen = now;
                        heartbeat.updated.push(*id);
                    }
                } else if silent >= self.timeout {
                    entry.state = None;
                    entry.last_seen = now;
                    expired.removed.push(*id);
                }
            }
        }

        if !expired.removed.is_empty() {
            debug!(clients = ?expired.removed, "awareness entries timed out");
        }
        self.emit(heartbeat);
        self.emit(expired)
    }

    /// Remove remote entries known to be gone. The local entry is untouched.
    pub fn remove_states(&self, clients: &[ClientId], origin: AwarenessOrigin) -> AwarenessChange {
        let mut change = AwarenessChange::new(origin);
        {
            let mut inner = self.inner.lock();
            let local = inner.client_id;
            for id in clients.iter().filter(|id| **id != local) {
                if let Some(entry) = inner.entries.get_mut(id) {
                    if entry.state.take().is_some() {
                        change.removed.push(*id);
                    }
                }
            }
        }
        self.emit(change)
    }
}
