//! Registry of open documents.
//!
//! [`Collaboration`] is owned by the application and passed where needed.
//! Opening a document loads its cached state, seeds presence from the
//! user's identity and starts the sync bridge. Opening it again returns the
//! same session, so one process never runs two bridges for one document.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use textogether_types::{ClientId, DocumentId, Identity, PersistenceKey, Topic};

use crate::awareness::{Awareness, PresenceUpdate, DEFAULT_TIMEOUT};
use crate::binding::{EditorBinding, EditorSurface};
use crate::bridge::{BridgeConfig, SyncBridge};
use crate::cache::LocalCache;
use crate::doc::SharedText;
use crate::error::Result;
use crate::transport::Transport;

/// Tunables for every session of a [`Collaboration`].
#[derive(Debug, Clone)]
pub struct CollabConfig {
    pub awareness_timeout: Duration,
    pub bridge: BridgeConfig,
}

impl CollabConfig {
    pub fn with_awareness_timeout(timeout: Duration) -> Self {
        Self {
            awareness_timeout: timeout,
            bridge: BridgeConfig::for_timeout(timeout),
        }
    }
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self::with_awareness_timeout(DEFAULT_TIMEOUT)
    }
}

pub struct Collaboration {
    config: CollabConfig,
    transport: Arc<dyn Transport>,
    cache: Option<LocalCache>,
    sessions: Mutex<HashMap<DocumentId, Arc<DocumentSession>>>,
}

impl Collaboration {
    /// Without a cache, documents live in memory only.
    pub fn new(config: CollabConfig, transport: Arc<dyn Transport>, cache: Option<LocalCache>) -> Self {
        Self {
            config,
            transport,
            cache,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Open `document_id`, or return the session already open for it.
    ///
    /// An empty or malformed id is the only error; cache and transport
    /// problems degrade the session instead.
    pub async fn open(&self, document_id: &str, identity: &Identity) -> Result<Arc<DocumentSession>> {
        let id = DocumentId::parse(document_id)?;

        let mut sessions = self.sessions.lock().await;
        if let Some(existing) = sessions.get(&id) {
            if !existing.is_closed() {
                debug!(document = %id, "reusing open session");
                return Ok(existing.clone());
            }
        }

        let key = PersistenceKey::for_document(&id);
        let (doc, load_warning) = self.load_doc(&key).await;
        let doc = Arc::new(doc);
        if load_warning.is_none() {
            if let Some(cache) = &self.cache {
                doc.attach_cache(cache.clone(), key);
            }
        }

        let awareness = Arc::new(Awareness::new(
            ClientId::random(),
            self.config.awareness_timeout,
        ));
        awareness.set_local_state(PresenceUpdate::new().identity(identity));

        let bridge = SyncBridge::spawn(
            Topic::for_document(&id),
            doc.clone(),
            awareness.clone(),
            self.transport.clone(),
            self.config.bridge.clone(),
        );

        info!(document = %id, chars = doc.len(), "opened document");
        let session = Arc::new(DocumentSession {
            id: id.clone(),
            doc,
            awareness,
            bridge,
            load_warning,
            closed: AtomicBool::new(false),
        });
        sessions.insert(id, session.clone());
        Ok(session)
    }

    async fn load_doc(&self, key: &PersistenceKey) -> (SharedText, Option<String>) {
        let Some(cache) = &self.cache else {
            return (SharedText::new(), None);
        };
        match cache.load_initial_state(key).await {
            Ok(None) => (SharedText::new(), None),
            Ok(Some(state)) => match SharedText::from_cached(&state) {
                Ok(doc) => (doc, None),
                Err(e) => {
                    warn!(%key, error = %e, "cached state unreadable, starting empty");
                    (SharedText::new(), Some(e.to_string()))
                }
            },
            Err(e) => {
                warn!(%key, error = %e, "local cache unavailable, continuing in memory only");
                (SharedText::new(), Some(e.to_string()))
            }
        }
    }

    /// Close and forget a document. Returns `false` if it was not open.
    pub async fn close(&self, document_id: &str) -> Result<bool> {
        let id = DocumentId::parse(document_id)?;
        let session = self.sessions.lock().await.remove(&id);
        match session {
            Some(session) => {
                session.close().await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn open_documents(&self) -> Vec<DocumentId> {
        let sessions = self.sessions.lock().await;
        let mut ids: Vec<_> = sessions
            .iter()
            .filter(|(_, s)| !s.is_closed())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub async fn close_all(&self) {
        let sessions: Vec<_> = self.sessions.lock().await.drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.close().await;
        }
    }
}

/// One open document: replica, presence and bridge.
pub struct DocumentSession {
    id: DocumentId,
    doc: Arc<SharedText>,
    awareness: Arc<Awareness>,
    bridge: SyncBridge,
    load_warning: Option<String>,
    closed: AtomicBool,
}

impl DocumentSession {
    pub fn id(&self) -> &DocumentId {
        &self.id
    }

    pub fn doc(&self) -> &Arc<SharedText> {
        &self.doc
    }

    pub fn awareness(&self) -> &Arc<Awareness> {
        &self.awareness
    }

    pub fn bridge(&self) -> &SyncBridge {
        &self.bridge
    }

    /// Why edits are not being persisted locally, if they are not.
    pub fn storage_warning(&self) -> Option<String> {
        self.load_warning
            .clone()
            .or_else(|| self.doc.storage_warning())
    }

    pub fn binding<S: EditorSurface>(&self, surface: S) -> EditorBinding<S> {
        EditorBinding::new(self.doc.clone(), self.awareness.clone(), surface)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop syncing and detach the cache. Closing twice is a no-op.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.bridge.shutdown().await;
        self.doc.detach_cache();
        info!(document = %self.id, "closed document");
    }
}
