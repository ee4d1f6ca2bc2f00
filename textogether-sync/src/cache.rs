//! Local durable cache for CRDT updates.
//!
//! Every update a replica produces or accepts is appended to a per-document
//! log, so a reload (or a fully offline session) never loses edits. The log is
//! compacted into a full-state record once it grows past [`TRIM_THRESHOLD`]
//! records, and again whenever it is loaded. Records Loro still holds back for
//! missing dependencies cannot be folded into a snapshot, so they are kept
//! verbatim after it until those dependencies show up.

use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use loro::{ExportMode, LoroDoc};
use parking_lot::Mutex;
use tracing::{debug, warn};

use textogether_types::PersistenceKey;

use crate::error::{Result, SyncError};

/// Number of appended records after which the log should be compacted.
pub const TRIM_THRESHOLD: usize = 500;

const LOG_EXTENSION: &str = "updates";

/// Storage backend for per-document update logs.
pub trait UpdateStore: Send + Sync {
    /// Append one record to the log of `key`.
    fn append(&self, key: &PersistenceKey, update: &[u8]) -> Result<()>;

    /// Replace the whole log of `key` with `records`.
    fn replace(&self, key: &PersistenceKey, records: &[Vec<u8>]) -> Result<()>;

    /// Read every record of `key`, oldest first. Missing logs are empty.
    fn read_all(&self, key: &PersistenceKey) -> Result<Vec<Vec<u8>>>;

    /// Delete the log of `key`.
    fn remove(&self, key: &PersistenceKey) -> Result<()>;
}

/// Update logs stored as length-prefixed records in `<dir>/<key>.updates`.
pub struct DiskStore {
    dir: PathBuf,
}

impl DiskStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn log_path(&self, key: &PersistenceKey) -> PathBuf {
        self.dir.join(format!("{key}.{LOG_EXTENSION}"))
    }
}

fn frame(record: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + record.len());
    buf.extend_from_slice(&(record.len() as u32).to_le_bytes());
    buf.extend_from_slice(record);
    buf
}

impl UpdateStore for DiskStore {
    fn append(&self, key: &PersistenceKey, update: &[u8]) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(key))?;
        file.write_all(&frame(update))?;
        Ok(())
    }

    fn replace(&self, key: &PersistenceKey, records: &[Vec<u8>]) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.log_path(key);
        let tmp = path.with_extension(format!("{LOG_EXTENSION}.tmp"));
        let data: Vec<u8> = records.iter().flat_map(|r| frame(r)).collect();
        fs::write(&tmp, data)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn read_all(&self, key: &PersistenceKey) -> Result<Vec<Vec<u8>>> {
        let path = self.log_path(key);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        let mut rest = data.as_slice();
        while !rest.is_empty() {
            if rest.len() < 4 {
                warn!(path = %path.display(), "ignoring truncated record header in update log");
                break;
            }
            let (header, body) = rest.split_at(4);
            let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
            if body.len() < len {
                warn!(path = %path.display(), "ignoring truncated record in update log");
                break;
            }
            records.push(body[..len].to_vec());
            rest = &body[len..];
        }
        Ok(records)
    }

    fn remove(&self, key: &PersistenceKey) -> Result<()> {
        match fs::remove_file(self.log_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-process update logs, lost with the process.
#[derive(Default)]
pub struct MemoryStore {
    logs: Mutex<HashMap<PersistenceKey, Vec<Vec<u8>>>>,
}

impl UpdateStore for MemoryStore {
    fn append(&self, key: &PersistenceKey, update: &[u8]) -> Result<()> {
        self.logs
            .lock()
            .entry(key.clone())
            .or_default()
            .push(update.to_vec());
        Ok(())
    }

    fn replace(&self, key: &PersistenceKey, records: &[Vec<u8>]) -> Result<()> {
        self.logs.lock().insert(key.clone(), records.to_vec());
        Ok(())
    }

    fn read_all(&self, key: &PersistenceKey) -> Result<Vec<Vec<u8>>> {
        Ok(self.logs.lock().get(key).cloned().unwrap_or_default())
    }

    fn remove(&self, key: &PersistenceKey) -> Result<()> {
        self.logs.lock().remove(key);
        Ok(())
    }
}

/// What a document log merges into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedState {
    /// Everything that could be applied, as one Loro snapshot.
    pub snapshot: Vec<u8>,
    /// Raw updates still waiting for their dependencies, oldest first.
    pub pending: Vec<Vec<u8>>,
}

impl CachedState {
    fn records(&self) -> Vec<Vec<u8>> {
        std::iter::once(self.snapshot.clone())
            .chain(self.pending.iter().cloned())
            .collect()
    }
}

/// Whether `doc` still lacks some of the changes carried by `record`.
pub(crate) fn is_pending(doc: &LoroDoc, record: &[u8]) -> bool {
    match LoroDoc::decode_import_blob_meta(record, false) {
        Ok(meta) => !doc.oplog_vv().includes_vv(&meta.partial_end_vv),
        Err(_) => false,
    }
}

/// Handle to the durable cache shared by every open document.
#[derive(Clone)]
pub struct LocalCache {
    store: Arc<dyn UpdateStore>,
    /// Records appended per key since the last compaction
    appended: Arc<Mutex<HashMap<PersistenceKey, usize>>>,
    trim_threshold: usize,
}

impl LocalCache {
    /// Open a disk-backed cache rooted at `dir`, creating it if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| {
            SyncError::Storage(format!("cache dir {} unavailable: {e}", dir.display()))
        })?;
        Ok(Self::with_store(Arc::new(DiskStore::new(dir))))
    }

    pub fn memory() -> Self {
        Self::with_store(Arc::new(MemoryStore::default()))
    }

    pub fn with_store(store: Arc<dyn UpdateStore>) -> Self {
        Self {
            store,
            appended: Arc::new(Mutex::new(HashMap::new())),
            trim_threshold: TRIM_THRESHOLD,
        }
    }

    pub fn with_trim_threshold(mut self, threshold: usize) -> Self {
        self.trim_threshold = threshold.max(1);
        self
    }

    /// Append one update to the log of `key`.
    pub fn persist(&self, key: &PersistenceKey, update: &[u8]) -> Result<()> {
        self.store.append(key, update)?;
        *self.appended.lock().entry(key.clone()).or_insert(0) += 1;
        Ok(())
    }

    pub fn needs_compaction(&self, key: &PersistenceKey) -> bool {
        self.appended
            .lock()
            .get(key)
            .is_some_and(|count| *count >= self.trim_threshold)
    }

    /// Replace the log of `key` with a full-state record followed by the
    /// updates that are still pending.
    pub fn compact(&self, key: &PersistenceKey, full_state: &[u8], pending: &[Vec<u8>]) -> Result<()> {
        let state = CachedState {
            snapshot: full_state.to_vec(),
            pending: pending.to_vec(),
        };
        self.store.replace(key, &state.records())?;
        self.appended.lock().insert(key.clone(), 0);
        debug!(%key, bytes = full_state.len(), pending = pending.len(), "compacted update log");
        Ok(())
    }

    /// Merge every stored record of `key`.
    ///
    /// Returns `None` when nothing usable is stored.
    pub async fn load_initial_state(&self, key: &PersistenceKey) -> Result<Option<CachedState>> {
        let store = self.store.clone();
        let owned_key = key.clone();
        let (records, merged) = tokio::task::spawn_blocking(move || {
            let records = store.read_all(&owned_key)?;
            let merged = merge_records(&owned_key, &records)?;
            Ok::<_, SyncError>((records.len(), merged))
        })
        .await
        .map_err(|e| SyncError::Storage(format!("cache load task failed: {e}")))??;

        let mut appended = records;
        if let Some(state) = merged.as_ref().filter(|m| records > 1 + m.pending.len()) {
            match self.store.replace(key, &state.records()) {
                Ok(()) => appended = 0,
                Err(err) => warn!(%key, %err, "could not compact update log after load"),
            }
        }
        self.appended.lock().insert(key.clone(), appended);

        Ok(merged)
    }

    pub fn clear(&self, key: &PersistenceKey) -> Result<()> {
        self.store.remove(key)?;
        self.appended.lock().remove(key);
        Ok(())
    }
}

fn merge_records(key: &PersistenceKey, records: &[Vec<u8>]) -> Result<Option<CachedState>> {
    if records.is_empty() {
        return Ok(None);
    }

    let doc = LoroDoc::new();
    let mut applied = 0usize;
    let mut held = Vec::new();
    for (index, record) in records.iter().enumerate() {
        match doc.import(record) {
            Ok(status) => {
                applied += 1;
                if status.pending.is_some() {
                    held.push(record);
                }
            }
            Err(err) => warn!(%key, index, %err, "skipping unreadable cached update"),
        }
    }
    if applied == 0 {
        return Ok(None);
    }

    let snapshot = doc
        .export(ExportMode::Snapshot)
        .map_err(|e| SyncError::Storage(format!("failed to merge cached updates: {e}")))?;
    let pending: Vec<Vec<u8>> = held
        .into_iter()
        .filter(|record| is_pending(&doc, record))
        .cloned()
        .collect();
    if !pending.is_empty() {
        debug!(%key, pending = pending.len(), "cached updates still missing dependencies");
    }
    Ok(Some(CachedState { snapshot, pending }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: &str) -> PersistenceKey {
        PersistenceKey::for_document(&textogether_types::DocumentId::parse(id).unwrap())
    }

    fn update_with(text: &str) -> Vec<u8> {
        let doc = LoroDoc::new();
        doc.get_text("latex").insert(0, text).unwrap();
        doc.commit();
        doc.export(ExportMode::all_updates()).unwrap()
    }

    fn text_of(state: &[u8]) -> String {
        let doc = LoroDoc::new();
        doc.import(state).unwrap();
        doc.get_text("latex").to_string()
    }

    #[tokio::test]
    async fn test_disk_roundtrip_and_compaction_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::open(dir.path()).unwrap();
        let k = key("paper");

        assert!(cache.load_initial_state(&k).await.unwrap().is_none());

        cache.persist(&k, &update_with("\\section{A}")).unwrap();
        cache.persist(&k, &update_with("x")).unwrap();

        let state = cache.load_initial_state(&k).await.unwrap().unwrap();
        assert!(state.pending.is_empty());
        let text = text_of(&state.snapshot);
        assert!(text.contains("\\section{A}"));
        assert!(text.contains('x'));

        let store = DiskStore::new(dir.path());
        assert_eq!(store.read_all(&k).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_keys_do_not_collide() {
        let cache = LocalCache::memory();
        cache.persist(&key("a"), &update_with("first")).unwrap();
        cache.persist(&key("b"), &update_with("second")).unwrap();

        let a = cache.load_initial_state(&key("a")).await.unwrap().unwrap();
        let b = cache.load_initial_state(&key("b")).await.unwrap().unwrap();
        assert_eq!(text_of(&a.snapshot), "first");
        assert_eq!(text_of(&b.snapshot), "second");
    }

    #[tokio::test]
    async fn test_truncated_tail_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::open(dir.path()).unwrap();
        let k = key("crashy");
        cache.persist(&k, &update_with("kept")).unwrap();

        let path = dir.path().join(format!("{k}.updates"));
        let mut file = fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[200, 0, 0, 0, 1, 2]).unwrap();

        let state = cache.load_initial_state(&k).await.unwrap().unwrap();
        assert_eq!(text_of(&state.snapshot), "kept");
    }

    #[test]
    fn test_compaction_threshold() {
        let cache = LocalCache::memory().with_trim_threshold(3);
        let k = key("busy");
        for _ in 0..2 {
            cache.persist(&k, &[1]).unwrap();
        }
        assert!(!cache.needs_compaction(&k));
        cache.persist(&k, &[1]).unwrap();
        assert!(cache.needs_compaction(&k));

        cache.compact(&k, &[9], &[]).unwrap();
        assert!(!cache.needs_compaction(&k));
    }

    /// Two updates from one peer, the second depending on the first.
    fn dependent_pair() -> (Vec<u8>, Vec<u8>) {
        let doc = LoroDoc::new();
        let text = doc.get_text("latex");
        text.insert(0, "AAA").unwrap();
        doc.commit();
        let first = doc.export(ExportMode::all_updates()).unwrap();
        let seen = doc.oplog_vv();
        text.insert(3, "BBB").unwrap();
        doc.commit();
        let second = doc.export(ExportMode::updates(&seen)).unwrap();
        (first, second)
    }

    #[tokio::test]
    async fn test_out_of_order_records_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        let k = key("late");
        let (first, second) = dependent_pair();

        let cache = LocalCache::open(dir.path()).unwrap();
        cache.persist(&k, &update_with("x")).unwrap();
        cache.persist(&k, &update_with("y")).unwrap();
        cache.persist(&k, &second).unwrap();

        let state = cache.load_initial_state(&k).await.unwrap().unwrap();
        assert_eq!(state.pending, vec![second.clone()]);
        assert_eq!(text_of(&state.snapshot).len(), 2);

        // Compacted on load, the held-back update rides behind the snapshot.
        let log = DiskStore::new(dir.path()).read_all(&k).unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1], second);

        let reopened = LocalCache::open(dir.path()).unwrap();
        reopened.persist(&k, &first).unwrap();
        let state = reopened.load_initial_state(&k).await.unwrap().unwrap();
        assert!(state.pending.is_empty());
        let text = text_of(&state.snapshot);
        assert!(text.contains("AAABBB"));
        assert!(text.contains('x') && text.contains('y'));
    }

    #[tokio::test]
    async fn test_compaction_keeps_pending_records() {
        let cache = LocalCache::memory();
        let k = key("compacted");
        let (first, second) = dependent_pair();

        cache.compact(&k, &update_with("base"), &[second]).unwrap();
        cache.persist(&k, &first).unwrap();

        let state = cache.load_initial_state(&k).await.unwrap().unwrap();
        assert!(state.pending.is_empty());
        let text = text_of(&state.snapshot);
        assert!(text.contains("AAABBB"));
        assert!(text.contains("base"));
    }

    #[test]
    fn test_open_fails_on_unusable_dir() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("not-a-dir");
        fs::write(&file, b"x").unwrap();
        assert!(matches!(
            LocalCache::open(file.join("cache")),
            Err(SyncError::Storage(_))
        ));
    }
}
