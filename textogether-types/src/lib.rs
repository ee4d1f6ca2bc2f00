//! Shared types for textogether
//!
//! This crate provides the identifiers and wire format shared by the sync
//! engine, the relay and the CLI: document and client identifiers, the
//! deterministic names derived from a document id, and the broadcast envelope.

mod envelope;

pub use envelope::{Envelope, EnvelopeError};

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Prefix shared by every name derived from a document id.
const NAMESPACE: &str = "textogether";

/// Longest accepted document id, in bytes.
pub const MAX_DOCUMENT_ID_LEN: usize = 128;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("document id is missing")]
    Missing,

    #[error("document id is longer than {max} bytes", max = MAX_DOCUMENT_ID_LEN)]
    TooLong,

    #[error("document id contains invalid character {0:?}")]
    InvalidChar(char),
}

/// Document identifier
///
/// Restricted to ASCII alphanumerics plus `-`, `_` and `.` so that every
/// derived topic, URL path segment and cache file name is used verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DocumentId(String);

impl DocumentId {
    pub fn parse(id: impl AsRef<str>) -> Result<Self, IdError> {
        let id = id.as_ref().trim();
        if id.is_empty() {
            return Err(IdError::Missing);
        }
        if id.len() > MAX_DOCUMENT_ID_LEN {
            return Err(IdError::TooLong);
        }
        if let Some(bad) = id
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
        {
            return Err(IdError::InvalidChar(bad));
        }
        Ok(Self(id.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for DocumentId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<DocumentId> for String {
    fn from(id: DocumentId) -> Self {
        id.0
    }
}

/// Ephemeral identifier of one client session in the awareness layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(pub u64);

impl ClientId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Fresh random id, regenerated for every connection.
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().as_u64_pair().0)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl From<u64> for ClientId {
    fn from(id: u64) -> Self {
        ClientId(id)
    }
}

/// Name of the broadcast channel every replica of one document joins.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic(String);

impl Topic {
    pub fn for_document(id: &DocumentId) -> Self {
        Self(format!("document-{NAMESPACE}-{id}"))
    }

    /// Wrap a raw topic name, e.g. one taken from a relay URL.
    pub fn from_raw(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Namespace of one document inside the local durable cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PersistenceKey(String);

impl PersistenceKey {
    pub fn for_document(id: &DocumentId) -> Self {
        Self(format!("{NAMESPACE}-{id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PersistenceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity supplied by the authentication layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub display_name: String,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
        }
    }

    /// Identity used when the user never signed in.
    pub fn anonymous() -> Self {
        Self {
            user_id: uuid::Uuid::new_v4().simple().to_string(),
            display_name: "Anonymous".to_string(),
        }
    }
}
