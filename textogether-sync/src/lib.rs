//! Real-time synchronization engine for textogether
//!
//! Keeps replicas of a LaTeX document convergent across clients:
//!
//! - [`doc`]: the CRDT replica of the document text (Loro)
//! - [`cache`]: durable per-document update log for offline editing
//! - [`awareness`]: ephemeral presence and cursors
//! - [`transport`]: broadcast topics (in-process hub, WebSocket relay client)
//! - [`bridge`]: connection state machine and handshake
//! - [`binding`]: editor surface glue
//! - [`session`]: registry of open documents

pub mod awareness;
pub mod binding;
pub mod bridge;
pub mod cache;
pub mod doc;
pub mod error;
pub mod session;
pub mod transport;

pub use awareness::{
    Awareness, AwarenessChange, AwarenessOrigin, CursorRange, PresenceState, PresenceUpdate,
};
pub use binding::{EditorBinding, EditorSurface, PlainTextSurface, RemoteCursor};
pub use bridge::{BridgeConfig, ConnectionState, SyncBridge};
pub use cache::{CachedState, LocalCache, TRIM_THRESHOLD};
pub use doc::{ChangeOrigin, DocUpdate, SharedText, TextChange, TextEdit};
pub use error::{Result, SyncError};
pub use session::{CollabConfig, Collaboration, DocumentSession};
pub use transport::{Connection, MemoryHub, MemoryTransport, Transport, WsTransport};

pub use textogether_types::{ClientId, DocumentId, Identity, PersistenceKey, Topic};
