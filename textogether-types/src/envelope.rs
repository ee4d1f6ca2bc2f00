//! Broadcast message envelope.
//!
//! Frames on the wire are JSON text:
//! `{ "event": "document-update", "update": [..bytes..] }` or
//! `{ "event": "awareness-update", "update": [..bytes..] }`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("envelope carries an empty update")]
    EmptyUpdate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum Envelope {
    /// Binary CRDT delta (or full state during a handshake)
    DocumentUpdate { update: Vec<u8> },
    /// Encoded awareness entries
    AwarenessUpdate { update: Vec<u8> },
}

impl Envelope {
    pub fn event(&self) -> &'static str {
        match self {
            Envelope::DocumentUpdate { .. } => "document-update",
            Envelope::AwarenessUpdate { .. } => "awareness-update",
        }
    }

    pub fn update(&self) -> &[u8] {
        match self {
            Envelope::DocumentUpdate { update } | Envelope::AwarenessUpdate { update } => update,
        }
    }

    pub fn to_frame(&self) -> Result<String, EnvelopeError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_frame(frame: &str) -> Result<Self, EnvelopeError> {
        let envelope: Envelope = serde_json::from_str(frame)?;
        if envelope.update().is_empty() {
            return Err(EnvelopeError::EmptyUpdate);
        }
        Ok(envelope)
    }
}
