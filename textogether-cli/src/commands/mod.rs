//! CLI command implementations.

mod append;
mod cat;
mod tail;

pub use append::append;
pub use cat::cat;
pub use tail::tail;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use textogether_sync::{
    CollabConfig, Collaboration, DocumentSession, LocalCache, WsTransport,
};
use textogether_types::{DocumentId, Identity, PersistenceKey};

/// Settings shared by every command.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub relay: String,
    pub cache_dir: Option<PathBuf>,
    pub identity: Identity,
    pub connect_timeout: Duration,
    pub settle: Duration,
}

impl ClientOptions {
    fn cache(&self) -> Option<LocalCache> {
        let dir = self.cache_dir.as_ref()?;
        match LocalCache::open(dir) {
            Ok(cache) => Some(cache),
            Err(err) => {
                warn!(dir = %dir.display(), %err, "cache unavailable, continuing in memory only");
                None
            }
        }
    }

    pub fn collaboration(&self) -> Collaboration {
        Collaboration::new(
            CollabConfig::default(),
            Arc::new(WsTransport::new(self.relay.clone())),
            self.cache(),
        )
    }

    /// Open `document` and give the relay a chance to catch it up.
    ///
    /// Returns whether the session synced before the connect timeout.
    pub async fn open(
        &self,
        collab: &Collaboration,
        document: &str,
    ) -> Result<(Arc<DocumentSession>, bool)> {
        let session = collab
            .open(document, &self.identity)
            .await
            .with_context(|| format!("failed to open document {document:?}"))?;

        let synced = tokio::time::timeout(self.connect_timeout, session.bridge().wait_synced())
            .await
            .is_ok_and(|r| r.is_ok());
        if synced {
            tokio::time::sleep(self.settle).await;
        } else {
            warn!(relay = %self.relay, "relay unreachable, working offline");
        }
        if let Some(reason) = session.storage_warning() {
            warn!(%reason, "edits are not being saved locally");
        }
        Ok((session, synced))
    }
}

pub fn clear_cache(options: &ClientOptions, document: &str) -> Result<()> {
    let id = DocumentId::parse(document)?;
    let Some(cache) = options.cache() else {
        println!("No cache configured");
        return Ok(());
    };
    cache.clear(&PersistenceKey::for_document(&id))?;
    debug!(document = %id, "cleared cache");
    println!("Cleared cached updates for {id}");
    Ok(())
}
