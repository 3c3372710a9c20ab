//! Artifact cache abstraction.
//!
//! Keys are opaque strings. Workflow isolation is a naming convention:
//! callers embed the WorkflowId in the key, and two workflows that build
//! the same literal key will see each other's entries. The engine never
//! enforces a boundary here.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::Result;

/// A named blob inside a cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Name, usually the relative path the blob was collected from.
    pub name: String,
    #[serde(with = "bytes_serde")]
    pub data: Bytes,
}

impl Artifact {
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }
}

/// The artifact set stored under one cache key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactSet {
    pub artifacts: Vec<Artifact>,
}

impl ArtifactSet {
    pub fn new(artifacts: Vec<Artifact>) -> Self {
        Self { artifacts }
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Artifact> {
        self.artifacts.iter().find(|a| a.name == name)
    }
}

/// Result of a restore. A miss is an ordinary answer, not an error, and is
/// always distinguishable from a hit so callers can branch on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Restored {
    Hit(ArtifactSet),
    Miss,
}

impl Restored {
    pub fn is_hit(&self) -> bool {
        matches!(self, Restored::Hit(_))
    }
}

/// Trait for artifact cache backends. Implementations must be safe under
/// concurrent access from unrelated workflows without a global lock.
#[async_trait]
pub trait ArtifactCache: Send + Sync {
    /// Store an artifact set under a key, overwriting any existing entry.
    /// Idempotent.
    async fn store(&self, key: &str, artifacts: ArtifactSet) -> Result<()>;

    /// Retrieve the artifact set for a key, or an explicit miss.
    async fn restore(&self, key: &str) -> Result<Restored>;

    /// Remove a key. Deleting a missing key is a no-op. Idempotent.
    async fn delete(&self, key: &str) -> Result<()>;
}

mod bytes_serde {
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(data)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let raw = Vec::<u8>::deserialize(deserializer)?;
        Ok(Bytes::from(raw))
    }
}
