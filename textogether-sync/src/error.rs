//! Error types for the sync engine.

use thiserror::Error;

use textogether_types::{EnvelopeError, IdError};

/// Errors raised by the replica, awareness store, cache and transports.
///
/// Only `InvalidRange` and `MissingDocumentId` ever reach an editor; the
/// bridge and session absorb transport and storage failures.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum SyncError {
    /// Connection to the broadcast transport failed or dropped.
    #[error("transport error: {0}")]
    Transport(String),

    /// An incoming payload could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// The local durable cache is unavailable.
    #[error("storage error: {0}")]
    Storage(String),

    /// A local mutation addressed positions outside the document.
    #[error("invalid range: index {index} len {len} on document of length {doc_len}")]
    InvalidRange {
        index: usize,
        len: usize,
        doc_len: usize,
    },

    /// The document id was empty or malformed.
    #[error("missing or invalid document id: {0}")]
    MissingDocumentId(#[from] IdError),

    /// The session was already closed.
    #[error("document session is closed")]
    Closed,

    /// The CRDT engine rejected an operation.
    #[error("crdt error: {0}")]
    Crdt(String),
}

impl From<loro::LoroError> for SyncError {
    fn from(e: loro::LoroError) -> Self {
        SyncError::Crdt(e.to_string())
    }
}

impl From<EnvelopeError> for SyncError {
    fn from(e: EnvelopeError) -> Self {
        SyncError::Decode(e.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(e: std::io::Error) -> Self {
        SyncError::Storage(e.to_string())
    }
}

impl SyncError {
    /// Whether the error only affects this connection attempt.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SyncError::Transport(_) | SyncError::Decode(_) | SyncError::Storage(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
