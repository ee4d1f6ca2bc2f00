//! Loro-backed replica of a document's text.
//!
//! A [`SharedText`] holds one `LoroDoc` with a single text container. Loro's
//! Fugue sequence gives every inserted character a `(peer, counter)` id and
//! keeps tombstones for deleted ones, so merging the same set of updates in
//! any order, any number of times, converges to the same text.
//!
//! Two notification streams are exposed:
//! - [`TextChange`]: positional edits for the editor binding, tagged with the
//!   origin of the commit so a binding can skip its own changes.
//! - [`DocUpdate`]: encoded deltas for the sync bridge; only local commits are
//!   marked [`UpdateOrigin::Local`], imports never are.

use std::sync::Arc;

use loro::event::{Diff, DiffEvent};
use loro::{
    CommitOptions, ContainerTrait, EventTriggerKind, ExportMode, LoroDoc, LoroText, TextDelta,
    VersionVector,
};
use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use textogether_types::PersistenceKey;

use crate::cache::{self, CachedState, LocalCache};
use crate::error::{Result, SyncError};

/// Name of the text container holding the document body.
pub const TEXT_CONTAINER: &str = "latex";

const CHANNEL_CAPACITY: usize = 1024;

/// One positional edit: delete `delete` chars at `index`, then insert `insert` there.
///
/// Positions count Unicode scalar values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextEdit {
    pub index: usize,
    pub delete: usize,
    pub insert: String,
}

impl TextEdit {
    pub fn insert(index: usize, text: impl Into<String>) -> Self {
        Self {
            index,
            delete: 0,
            insert: text.into(),
        }
    }

    pub fn delete(index: usize, len: usize) -> Self {
        Self {
            index,
            delete: len,
            insert: String::new(),
        }
    }

    pub fn is_noop(&self) -> bool {
        self.delete == 0 && self.insert.is_empty()
    }
}

/// Who produced a change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// A commit on this replica, with the tag it was committed under.
    Local { tag: Option<String> },
    /// An imported remote update.
    Remote,
}

/// Change notification for editor bindings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChange {
    pub origin: ChangeOrigin,
    /// Applied in order; each index is valid after the previous edits.
    pub edits: Vec<TextEdit>,
}

impl TextChange {
    pub fn is_tagged(&self, tag: &str) -> bool {
        matches!(&self.origin, ChangeOrigin::Local { tag: Some(t) } if t == tag)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOrigin {
    Local,
    Remote,
}

/// Encoded delta produced by a local commit or accepted from a peer.
#[derive(Debug, Clone)]
pub struct DocUpdate {
    pub bytes: Arc<Vec<u8>>,
    pub origin: UpdateOrigin,
}

impl DocUpdate {
    pub fn is_local(&self) -> bool {
        self.origin == UpdateOrigin::Local
    }
}

struct CacheBinding {
    cache: LocalCache,
    key: PersistenceKey,
}

/// State shared with the callbacks registered on the Loro document.
struct Hooks {
    updates: broadcast::Sender<DocUpdate>,
    changes: broadcast::Sender<TextChange>,
    cache: RwLock<Option<CacheBinding>>,
    storage_warning: Mutex<Option<String>>,
}

impl Hooks {
    /// Append to the cache, falling back to memory-only mode on failure.
    fn persist(&self, bytes: &[u8]) {
        let failed = {
            let guard = self.cache.read();
            let Some(binding) = guard.as_ref() else {
                return;
            };
            match binding.cache.persist(&binding.key, bytes) {
                Ok(()) => None,
                Err(err) => Some((binding.key.clone(), err)),
            }
        };

        if let Some((key, err)) = failed {
            warn!(%key, %err, "local cache unavailable, continuing in memory only");
            *self.storage_warning.lock() = Some(err.to_string());
            *self.cache.write() = None;
        }
    }
}

/// Replica of one document's text.
pub struct SharedText {
    doc: LoroDoc,
    text: LoroText,
    hooks: Arc<Hooks>,
    /// Serializes local edits against imports.
    edits: ReentrantMutex<()>,
    /// Raw updates Loro is holding back for missing dependencies.
    pending: Mutex<Vec<Vec<u8>>>,
}

impl SharedText {
    pub fn new() -> Self {
        let doc = LoroDoc::new();
        let text = doc.get_text(TEXT_CONTAINER);
        let (updates, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (changes, _) = broadcast::channel(CHANNEL_CAPACITY);
        let hooks = Arc::new(Hooks {
            updates,
            changes,
            cache: RwLock::new(None),
            storage_warning: Mutex::new(None),
        });

        let local_hooks = hooks.clone();
        doc.subscribe_local_update(Box::new(move |bytes: &Vec<u8>| {
            local_hooks.persist(bytes);
            let _ = local_hooks.updates.send(DocUpdate {
                bytes: Arc::new(bytes.clone()),
                origin: UpdateOrigin::Local,
            });
            true
        }))
        .detach();

        let event_hooks = hooks.clone();
        let text_id = text.id();
        doc.subscribe_root(Arc::new(move |event: DiffEvent<'_>| {
            let origin = match event.triggered_by {
                EventTriggerKind::Local => ChangeOrigin::Local {
                    tag: (!event.origin.is_empty()).then(|| event.origin.to_string()),
                },
                EventTriggerKind::Import => ChangeOrigin::Remote,
                EventTriggerKind::Checkout => return,
            };
            let mut edits = Vec::new();
            for container in &event.events {
                if *container.target != text_id {
                    continue;
                }
                if let Diff::Text(delta) = &container.diff {
                    edits.extend(edits_from_delta(delta));
                }
            }
            if !edits.is_empty() {
                let _ = event_hooks.changes.send(TextChange { origin, edits });
            }
        }))
        .detach();

        Self {
            doc,
            text,
            hooks,
            edits: ReentrantMutex::new(()),
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Build a replica from a previously encoded full state.
    pub fn from_state(state: &[u8]) -> Result<Self> {
        let this = Self::new();
        this.doc
            .import(state)
            .map_err(|e| SyncError::Decode(format!("invalid stored state: {e}")))?;
        Ok(this)
    }

    /// Build a replica from what the local cache loaded.
    ///
    /// Updates still missing their dependencies stay pending here as well, and
    /// keep being carried through compactions until they apply.
    pub fn from_cached(cached: &CachedState) -> Result<Self> {
        let this = Self::from_state(&cached.snapshot)?;
        {
            let mut pending = this.pending.lock();
            for record in &cached.pending {
                let status = this
                    .doc
                    .import(record)
                    .map_err(|e| SyncError::Decode(format!("invalid stored update: {e}")))?;
                if status.pending.is_some() {
                    pending.push(record.clone());
                }
            }
        }
        this.settle_pending();
        Ok(this)
    }

    pub fn peer_id(&self) -> u64 {
        self.doc.peer_id()
    }

    pub fn text(&self) -> String {
        self.text.to_string()
    }

    /// Length in Unicode scalar values.
    pub fn len(&self) -> usize {
        self.text.len_unicode()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Local mutations
    // ─────────────────────────────────────────────────────────────────────────

    /// Hold off imports until the guard is dropped.
    ///
    /// Editors keeping their own copy of the text take this around "apply
    /// what arrived, then make a local edit" so no remote change can slip in
    /// between. Local edits on the same thread may still be made while held.
    pub fn lock_edits(&self) -> ReentrantMutexGuard<'_, ()> {
        self.edits.lock()
    }

    pub fn insert(&self, index: usize, text: &str) -> Result<()> {
        self.insert_inner(index, text, None)
    }

    pub fn delete(&self, index: usize, len: usize) -> Result<()> {
        self.delete_inner(index, len, None)
    }

    /// Insert, tagging the commit so change listeners can recognise it.
    pub fn insert_with_origin(&self, index: usize, text: &str, origin: &str) -> Result<()> {
        self.insert_inner(index, text, Some(origin))
    }

    pub fn delete_with_origin(&self, index: usize, len: usize, origin: &str) -> Result<()> {
        self.delete_inner(index, len, Some(origin))
    }

    fn insert_inner(&self, index: usize, text: &str, origin: Option<&str>) -> Result<()> {
        let _edits = self.edits.lock();
        let doc_len = self.len();
        if index > doc_len {
            return Err(SyncError::InvalidRange {
                index,
                len: 0,
                doc_len,
            });
        }
        if text.is_empty() {
            return Ok(());
        }
        self.text.insert(index, text)?;
        self.commit(origin);
        Ok(())
    }

    fn delete_inner(&self, index: usize, len: usize, origin: Option<&str>) -> Result<()> {
        let _edits = self.edits.lock();
        let doc_len = self.len();
        if index > doc_len || len > doc_len - index {
            return Err(SyncError::InvalidRange {
                index,
                len,
                doc_len,
            });
        }
        if len == 0 {
            return Ok(());
        }
        self.text.delete(index, len)?;
        self.commit(origin);
        Ok(())
    }

    fn commit(&self, origin: Option<&str>) {
        match origin {
            Some(origin) => self.doc.commit_with(CommitOptions::new().origin(origin)),
            None => self.doc.commit(),
        }
        self.maybe_compact();
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Sync
    // ─────────────────────────────────────────────────────────────────────────

    /// Merge a remote delta.
    ///
    /// Returns `false` when the update was already known. Updates whose
    /// dependencies are missing are held by Loro until those arrive.
    pub fn apply_update(&self, update: &[u8]) -> Result<bool> {
        let _edits = self.edits.lock();
        let before = self.doc.oplog_vv();
        let status = self
            .doc
            .import(update)
            .map_err(|e| SyncError::Decode(e.to_string()))?;
        let after = self.doc.oplog_vv();

        let advanced = before != after;
        if !advanced && status.pending.is_none() {
            trace!(bytes = update.len(), "ignoring duplicate update");
            return Ok(false);
        }

        self.hooks.persist(update);
        if status.pending.is_some() {
            let mut pending = self.pending.lock();
            if !pending.iter().any(|held| held.as_slice() == update) {
                pending.push(update.to_vec());
            }
        }
        if advanced {
            self.settle_pending();
            let _ = self.hooks.updates.send(DocUpdate {
                bytes: Arc::new(update.to_vec()),
                origin: UpdateOrigin::Remote,
            });
        }
        self.maybe_compact();
        debug!(bytes = update.len(), advanced, "applied remote update");
        Ok(advanced)
    }

    /// Full state, used for the handshake with (re)joining peers.
    pub fn encode_state_as_update(&self) -> Result<Vec<u8>> {
        self.doc
            .export(ExportMode::Snapshot)
            .map_err(|e| SyncError::Crdt(format!("export failed: {e}")))
    }

    pub fn encode_state_vector(&self) -> Vec<u8> {
        self.doc.oplog_vv().encode()
    }

    /// Delta containing everything a peer at `state_vector` is missing.
    pub fn encode_update_since(&self, state_vector: &[u8]) -> Result<Vec<u8>> {
        let from = VersionVector::decode(state_vector)
            .map_err(|e| SyncError::Decode(format!("invalid state vector: {e}")))?;
        self.doc
            .export(ExportMode::updates(&from))
            .map_err(|e| SyncError::Crdt(format!("export failed: {e}")))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Notifications and cache
    // ─────────────────────────────────────────────────────────────────────────

    pub fn subscribe_changes(&self) -> broadcast::Receiver<TextChange> {
        self.hooks.changes.subscribe()
    }

    pub fn subscribe_updates(&self) -> broadcast::Receiver<DocUpdate> {
        self.hooks.updates.subscribe()
    }

    /// Persist every later update under `key`.
    pub fn attach_cache(&self, cache: LocalCache, key: PersistenceKey) {
        *self.hooks.cache.write() = Some(CacheBinding { cache, key });
    }

    pub fn detach_cache(&self) {
        *self.hooks.cache.write() = None;
    }

    pub fn is_cached(&self) -> bool {
        self.hooks.cache.read().is_some()
    }

    /// Reason the replica fell back to memory-only mode, if it did.
    pub fn storage_warning(&self) -> Option<String> {
        self.hooks.storage_warning.lock().clone()
    }

    /// Forget held-back updates whose changes have all been applied.
    fn settle_pending(&self) {
        let mut pending = self.pending.lock();
        if pending.is_empty() {
            return;
        }
        pending.retain(|record| cache::is_pending(&self.doc, record));
        trace!(still_pending = pending.len(), "settled pending updates");
    }

    /// Number of received updates still waiting for their dependencies.
    pub fn pending_updates(&self) -> usize {
        self.pending.lock().len()
    }

    fn maybe_compact(&self) {
        let target = {
            let guard = self.hooks.cache.read();
            guard
                .as_ref()
                .filter(|b| b.cache.needs_compaction(&b.key))
                .map(|b| (b.cache.clone(), b.key.clone()))
        };
        let Some((cache, key)) = target else {
            return;
        };
        match self.encode_state_as_update() {
            Ok(state) => {
                let pending = self.pending.lock().clone();
                if let Err(err) = cache.compact(&key, &state, &pending) {
                    warn!(%key, %err, "failed to compact update log");
                }
            }
            Err(err) => warn!(%key, %err, "failed to export state for compaction"),
        }
    }
}

impl Default for SharedText {
    fn default() -> Self {
        Self::new()
    }
}

/// Translate a Loro text delta into positional edits.
fn edits_from_delta(delta: &[TextDelta]) -> Vec<TextEdit> {
    let mut edits = Vec::new();
    let mut index = 0;
    for item in delta {
        match item {
            TextDelta::Retain { retain, .. } => index += *retain,
            TextDelta::Insert { insert, .. } => {
                edits.push(TextEdit::insert(index, insert.clone()));
                index += insert.chars().count();
            }
            TextDelta::Delete { delete } => edits.push(TextEdit::delete(index, *delete)),
        }
    }
    edits
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::TryRecvError;

    fn sync_pair(a: &SharedText, b: &SharedText) {
        b.apply_update(&a.encode_state_as_update().unwrap()).unwrap();
        a.apply_update(&b.encode_state_as_update().unwrap()).unwrap();
    }

    #[test]
    fn test_basic_operations() {
        let doc = SharedText::new();
        doc.insert(0, "Hello").unwrap();
        doc.insert(5, " World").unwrap();
        assert_eq!(doc.text(), "Hello World");

        doc.delete(5, 1).unwrap();
        assert_eq!(doc.text(), "HelloWorld");
        assert_eq!(doc.len(), 10);
    }

    #[test]
    fn test_invalid_range_is_not_applied() {
        let doc = SharedText::new();
        doc.insert(0, "abc").unwrap();

        assert!(matches!(
            doc.insert(4, "x"),
            Err(SyncError::InvalidRange { index: 4, doc_len: 3, .. })
        ));
        assert!(matches!(
            doc.delete(2, 5),
            Err(SyncError::InvalidRange { .. })
        ));
        assert!(matches!(
            doc.delete(usize::MAX, 1),
            Err(SyncError::InvalidRange { .. })
        ));
        assert_eq!(doc.text(), "abc");
    }

    #[test]
    fn test_unicode_positions() {
        let doc = SharedText::new();
        doc.insert(0, "α🌍β").unwrap();
        assert_eq!(doc.len(), 3);
        doc.insert(2, "!").unwrap();
        assert_eq!(doc.text(), "α🌍!β");
        doc.delete(1, 1).unwrap();
        assert_eq!(doc.text(), "α!β");
    }

    #[test]
    fn test_duplicate_update_is_noop() {
        let a = SharedText::new();
        a.insert(0, "\\begin{document}").unwrap();
        let update = a.encode_state_as_update().unwrap();

        let b = SharedText::new();
        assert!(b.apply_update(&update).unwrap());
        let once = b.text();
        assert!(!b.apply_update(&update).unwrap());
        assert_eq!(b.text(), once);
        assert_eq!(b.encode_state_vector(), a.encode_state_vector());
    }

    #[test]
    fn test_malformed_update_is_decode_error() {
        let doc = SharedText::new();
        assert!(matches!(
            doc.apply_update(&[0xde, 0xad, 0xbe, 0xef]),
            Err(SyncError::Decode(_))
        ));
    }

    #[test]
    fn test_concurrent_inserts_converge() {
        let a = SharedText::new();
        let b = SharedText::new();
        a.insert(0, "hello").unwrap();
        b.insert(0, "world").unwrap();

        sync_pair(&a, &b);

        assert_eq!(a.text(), b.text());
        assert!(a.text().contains("hello"));
        assert!(a.text().contains("world"));
    }

    #[test]
    fn test_update_since_state_vector() {
        let a = SharedText::new();
        a.insert(0, "base").unwrap();
        let b = SharedText::from_state(&a.encode_state_as_update().unwrap()).unwrap();
        let vector = b.encode_state_vector();

        a.insert(4, " more").unwrap();
        let delta = a.encode_update_since(&vector).unwrap();
        b.apply_update(&delta).unwrap();
        assert_eq!(b.text(), "base more");
    }

    #[test]
    fn test_local_updates_are_emitted_once_per_commit() {
        let doc = SharedText::new();
        let mut updates = doc.subscribe_updates();

        doc.insert(0, "a").unwrap();
        doc.insert(1, "b").unwrap();
        doc.delete(0, 1).unwrap();
        doc.insert(0, "").unwrap();

        let mut count = 0;
        while let Ok(update) = updates.try_recv() {
            assert!(update.is_local());
            count += 1;
        }
        assert_eq!(count, 3);
    }

    #[test]
    fn test_imports_are_never_local_updates() {
        let a = SharedText::new();
        a.insert(0, "remote").unwrap();

        let b = SharedText::new();
        let mut updates = b.subscribe_updates();
        b.apply_update(&a.encode_state_as_update().unwrap()).unwrap();

        let update = updates.try_recv().unwrap();
        assert_eq!(update.origin, UpdateOrigin::Remote);
        assert!(matches!(updates.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn test_change_events_carry_origin_and_edits() {
        let doc = SharedText::new();
        let mut changes = doc.subscribe_changes();

        doc.insert_with_origin(0, "abc", "binding-1").unwrap();
        let change = changes.try_recv().unwrap();
        assert!(change.is_tagged("binding-1"));
        assert_eq!(change.edits, vec![TextEdit::insert(0, "abc")]);

        doc.delete(1, 1).unwrap();
        let change = changes.try_recv().unwrap();
        assert_eq!(change.origin, ChangeOrigin::Local { tag: None });
        assert_eq!(change.edits, vec![TextEdit::delete(1, 1)]);

        let other = SharedText::new();
        other.apply_update(&doc.encode_state_as_update().unwrap()).unwrap();
        let mut other_changes = other.subscribe_changes();
        doc.insert(2, "Z").unwrap();
        other
            .apply_update(&doc.encode_update_since(&other.encode_state_vector()).unwrap())
            .unwrap();
        let change = other_changes.try_recv().unwrap();
        assert_eq!(change.origin, ChangeOrigin::Remote);
        assert_eq!(change.edits, vec![TextEdit::insert(2, "Z")]);
    }

    #[test]
    fn test_edits_from_delta() {
        let delta = vec![
            TextDelta::Retain {
                retain: 2,
                attributes: None,
            },
            TextDelta::Delete { delete: 3 },
            TextDelta::Insert {
                insert: "xy".to_string(),
                attributes: None,
            },
            TextDelta::Retain {
                retain: 1,
                attributes: None,
            },
            TextDelta::Insert {
                insert: "z".to_string(),
                attributes: None,
            },
        ];
        assert_eq!(
            edits_from_delta(&delta),
            vec![
                TextEdit::delete(2, 3),
                TextEdit::insert(2, "xy"),
                TextEdit::insert(5, "z"),
            ]
        );
    }

    #[tokio::test]
    async fn test_every_mutation_reaches_cache() {
        let cache = LocalCache::memory();
        let key = PersistenceKey::for_document(
            &textogether_types::DocumentId::parse("cached").unwrap(),
        );
        let doc = SharedText::new();
        doc.attach_cache(cache.clone(), key.clone());

        doc.insert(0, "offline edit").unwrap();
        let peer = SharedText::new();
        peer.insert(0, "peer ").unwrap();
        doc.apply_update(&peer.encode_state_as_update().unwrap()).unwrap();

        let state = cache.load_initial_state(&key).await.unwrap().unwrap();
        let reloaded = SharedText::from_cached(&state).unwrap();
        assert_eq!(reloaded.text(), doc.text());
    }

    /// An update followed by one that builds on it.
    fn dependent_updates() -> (Vec<u8>, Vec<u8>) {
        let author = SharedText::new();
        author.insert(0, "AAA").unwrap();
        let first = author.encode_state_as_update().unwrap();
        let seen = author.encode_state_vector();
        author.insert(3, "BBB").unwrap();
        let second = author.encode_update_since(&seen).unwrap();
        (first, second)
    }

    #[tokio::test]
    async fn test_held_back_update_survives_reload() {
        let cache = LocalCache::memory();
        let key = PersistenceKey::for_document(
            &textogether_types::DocumentId::parse("reordered").unwrap(),
        );
        let (first, second) = dependent_updates();

        let live = SharedText::new();
        live.attach_cache(cache.clone(), key.clone());
        live.apply_update(&second).unwrap();
        assert_eq!(live.pending_updates(), 1);
        assert_eq!(live.text(), "");

        let state = cache.load_initial_state(&key).await.unwrap().unwrap();
        let reloaded = SharedText::from_cached(&state).unwrap();
        assert_eq!(reloaded.pending_updates(), 1);
        reloaded.attach_cache(cache.clone(), key.clone());

        live.apply_update(&first).unwrap();
        reloaded.apply_update(&first).unwrap();
        assert_eq!(live.text(), "AAABBB");
        assert_eq!(reloaded.text(), "AAABBB");
        assert_eq!(live.pending_updates(), 0);
        assert_eq!(reloaded.pending_updates(), 0);

        let state = cache.load_initial_state(&key).await.unwrap().unwrap();
        assert!(state.pending.is_empty());
        assert_eq!(SharedText::from_cached(&state).unwrap().text(), "AAABBB");
    }

    #[tokio::test]
    async fn test_compaction_carries_held_back_updates() {
        let cache = LocalCache::memory().with_trim_threshold(2);
        let key = PersistenceKey::for_document(
            &textogether_types::DocumentId::parse("busy").unwrap(),
        );
        let (first, second) = dependent_updates();

        let doc = SharedText::new();
        doc.attach_cache(cache.clone(), key.clone());
        doc.apply_update(&second).unwrap();
        doc.insert(0, "x").unwrap();
        doc.insert(1, "y").unwrap();

        let state = cache.load_initial_state(&key).await.unwrap().unwrap();
        assert_eq!(state.pending, vec![second]);

        let reloaded = SharedText::from_cached(&state).unwrap();
        reloaded.apply_update(&first).unwrap();
        assert!(reloaded.text().starts_with("xy") || reloaded.text().ends_with("xy"));
        assert!(reloaded.text().contains("AAABBB"));
    }

    /// A store whose quota is always exhausted.
    struct FullStore;

    impl crate::cache::UpdateStore for FullStore {
        fn append(&self, _: &PersistenceKey, _: &[u8]) -> Result<()> {
            Err(SyncError::Storage("quota exceeded".to_string()))
        }

        fn replace(&self, _: &PersistenceKey, _: &[Vec<u8>]) -> Result<()> {
            Err(SyncError::Storage("quota exceeded".to_string()))
        }

        fn read_all(&self, _: &PersistenceKey) -> Result<Vec<Vec<u8>>> {
            Ok(Vec::new())
        }

        fn remove(&self, _: &PersistenceKey) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_storage_failure_degrades_to_memory() {
        let key = PersistenceKey::for_document(
            &textogether_types::DocumentId::parse("full").unwrap(),
        );
        let doc = SharedText::new();
        doc.attach_cache(LocalCache::with_store(Arc::new(FullStore)), key);

        doc.insert(0, "still editable").unwrap();
        assert_eq!(doc.text(), "still editable");
        assert!(!doc.is_cached());
        assert!(doc.storage_warning().unwrap().contains("quota exceeded"));

        doc.insert(0, "> ").unwrap();
        assert_eq!(doc.text(), "> still editable");
    }
}
