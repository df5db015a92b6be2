//! Value types shared by every storage implementation and wrapper.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a blob within a storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobId(String);

impl BlobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.0.starts_with(prefix)
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BlobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for BlobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Write-once-read-many retention mode applied to protected blobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RetentionMode {
    /// Privileged principals may still shorten or remove the retention
    Governance,
    /// Nobody can remove the object before the period elapses
    Compliance,
}

impl RetentionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetentionMode::Governance => "GOVERNANCE",
            RetentionMode::Compliance => "COMPLIANCE",
        }
    }
}

/// Options accompanying a put call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PutOptions {
    pub retention_mode: Option<RetentionMode>,
    pub retention_period: Option<Duration>,
}

impl PutOptions {
    pub fn has_retention(&self) -> bool {
        self.retention_mode.is_some() && self.retention_period.is_some_and(|p| !p.is_zero())
    }
}

/// Metadata about a listed blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobMetadata {
    pub id: BlobId,
    pub length: u64,
    pub timestamp: DateTime<Utc>,
}

/// Describes how a storage was connected. `config` is the serialized
/// backend configuration, including any advertised throttling limits.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    #[serde(rename = "type")]
    pub kind: String,
    pub config: serde_json::Value,
}

/// Storage operations that wrappers may observe or gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Put,
    Get,
    List,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Put => "PutBlob",
            Operation::Get => "GetBlob",
            Operation::List => "ListBlobs",
            Operation::Delete => "DeleteBlob",
        }
    }

    pub fn is_mutating(&self) -> bool {
        matches!(self, Operation::Put | Operation::Delete)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
