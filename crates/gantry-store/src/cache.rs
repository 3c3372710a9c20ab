//! Artifact cache backends.
//!
//! `MemoryCache` keeps entries in process memory and is the default for
//! tests and single-shot CLI runs. `FsCache` persists entries under a root
//! directory so cached artifacts survive across engine restarts.

use async_trait::async_trait;
use bytes::Bytes;
use gantry_core::cache::{Artifact, ArtifactCache, ArtifactSet, Restored};
use gantry_core::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::warn;

/// In-memory artifact cache.
///
/// Thread-safe via `RwLock`. Entries do not survive process restart.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, ArtifactSet>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArtifactCache for MemoryCache {
    async fn store(&self, key: &str, artifacts: ArtifactSet) -> Result<()> {
        self.entries.write().await.insert(key.to_string(), artifacts);
        Ok(())
    }

    async fn restore(&self, key: &str) -> Result<Restored> {
        match self.entries.read().await.get(key) {
            Some(set) => Ok(Restored::Hit(set.clone())),
            None => Ok(Restored::Miss),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

/// Filesystem-backed artifact cache.
///
/// Each key maps to a directory named by the hex SHA-256 of the key; the
/// directory holds one blob file per artifact plus a `manifest.json`
/// describing them. The manifest is written last with a rename so a
/// partially written entry reads as a miss, never as a corrupt hit.
#[derive(Debug, Clone)]
pub struct FsCache {
    root: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    key: String,
    entries: Vec<ManifestEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ManifestEntry {
    name: String,
    file: String,
    sha256: String,
    size: u64,
}

impl FsCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_dir(&self, key: &str) -> PathBuf {
        self.root.join(hex_digest(key.as_bytes()))
    }
}

fn hex_digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

#[async_trait]
impl ArtifactCache for FsCache {
    async fn store(&self, key: &str, artifacts: ArtifactSet) -> Result<()> {
        let dir = self.entry_dir(key);

        // Overwrite semantics: drop any previous entry wholesale.
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::Io(e)),
        }
        tokio::fs::create_dir_all(&dir).await?;

        let mut entries = Vec::with_capacity(artifacts.len());
        for (index, artifact) in artifacts.artifacts.iter().enumerate() {
            let file = format!("artifact-{index}.bin");
            tokio::fs::write(dir.join(&file), &artifact.data).await?;
            entries.push(ManifestEntry {
                name: artifact.name.clone(),
                file,
                sha256: hex_digest(&artifact.data),
                size: artifact.data.len() as u64,
            });
        }

        let manifest = Manifest {
            key: key.to_string(),
            entries,
        };
        let json = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| Error::Internal(format!("serialize cache manifest: {e}")))?;

        // Manifest lands last: tmp write then rename.
        let tmp = dir.join("manifest.json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, dir.join("manifest.json")).await?;
        Ok(())
    }

    async fn restore(&self, key: &str) -> Result<Restored> {
        let dir = self.entry_dir(key);

        let raw = match tokio::fs::read(dir.join("manifest.json")).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Restored::Miss),
            Err(e) => return Err(Error::Io(e)),
        };

        let manifest: Manifest = match serde_json::from_slice(&raw) {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!(key, error = %e, "unreadable cache manifest, treating as miss");
                return Ok(Restored::Miss);
            }
        };

        let mut artifacts = Vec::with_capacity(manifest.entries.len());
        for entry in &manifest.entries {
            let data = match tokio::fs::read(dir.join(&entry.file)).await {
                Ok(data) => data,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    warn!(key, file = %entry.file, "cache blob missing, treating as miss");
                    return Ok(Restored::Miss);
                }
                Err(e) => return Err(Error::Io(e)),
            };
            if hex_digest(&data) != entry.sha256 {
                warn!(key, file = %entry.file, "cache blob checksum mismatch, treating as miss");
                return Ok(Restored::Miss);
            }
            artifacts.push(Artifact::new(entry.name.clone(), Bytes::from(data)));
        }

        Ok(Restored::Hit(ArtifactSet::new(artifacts)))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_dir_all(self.entry_dir(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_set() -> ArtifactSet {
        ArtifactSet::new(vec![
            Artifact::new("app.tar", &b"tar contents"[..]),
            Artifact::new("digest.txt", &b"sha256:abc"[..]),
        ])
    }

    #[tokio::test]
    async fn test_memory_store_and_restore() {
        let cache = MemoryCache::new();
        cache.store("wf-1/build", sample_set()).await.unwrap();

        match cache.restore("wf-1/build").await.unwrap() {
            Restored::Hit(set) => {
                assert_eq!(set.len(), 2);
                assert_eq!(set.get("app.tar").unwrap().data.as_ref(), b"tar contents");
            }
            Restored::Miss => panic!("expected hit"),
        }
    }

    #[tokio::test]
    async fn test_memory_miss_is_not_an_error() {
        let cache = MemoryCache::new();
        assert_eq!(cache.restore("absent").await.unwrap(), Restored::Miss);
    }

    #[tokio::test]
    async fn test_memory_store_overwrites() {
        let cache = MemoryCache::new();
        cache.store("k", sample_set()).await.unwrap();
        cache
            .store("k", ArtifactSet::new(vec![Artifact::new("only", &b"x"[..])]))
            .await
            .unwrap();

        match cache.restore("k").await.unwrap() {
            Restored::Hit(set) => {
                assert_eq!(set.len(), 1);
                assert!(set.get("app.tar").is_none());
            }
            Restored::Miss => panic!("expected hit"),
        }
    }

    #[tokio::test]
    async fn test_memory_delete_is_idempotent() {
        let cache = MemoryCache::new();
        cache.store("k", sample_set()).await.unwrap();
        cache.delete("k").await.unwrap();
        cache.delete("k").await.unwrap();
        assert_eq!(cache.restore("k").await.unwrap(), Restored::Miss);
    }

    #[tokio::test]
    async fn test_memory_distinct_keys_do_not_collide() {
        let cache = MemoryCache::new();
        cache.store("wf-1/deps", sample_set()).await.unwrap();

        assert!(cache.restore("wf-1/deps").await.unwrap().is_hit());
        assert_eq!(cache.restore("wf-2/deps").await.unwrap(), Restored::Miss);
    }

    fn scratch_dir() -> PathBuf {
        std::env::temp_dir().join(format!("gantry-cache-test-{}", uuid::Uuid::now_v7()))
    }

    #[tokio::test]
    async fn test_fs_store_and_restore() {
        let root = scratch_dir();
        let cache = FsCache::new(&root);

        cache.store("wf-1/build", sample_set()).await.unwrap();
        match cache.restore("wf-1/build").await.unwrap() {
            Restored::Hit(set) => {
                assert_eq!(set.len(), 2);
                assert_eq!(
                    set.get("digest.txt").unwrap().data.as_ref(),
                    b"sha256:abc"
                );
            }
            Restored::Miss => panic!("expected hit"),
        }

        tokio::fs::remove_dir_all(&root).await.ok();
    }

    #[tokio::test]
    async fn test_fs_miss_on_unknown_key() {
        let root = scratch_dir();
        let cache = FsCache::new(&root);

        assert_eq!(cache.restore("never-stored").await.unwrap(), Restored::Miss);

        tokio::fs::remove_dir_all(&root).await.ok();
    }

    #[tokio::test]
    async fn test_fs_store_overwrites_previous_entry() {
        let root = scratch_dir();
        let cache = FsCache::new(&root);

        cache.store("k", sample_set()).await.unwrap();
        cache
            .store("k", ArtifactSet::new(vec![Artifact::new("new", &b"fresh"[..])]))
            .await
            .unwrap();

        match cache.restore("k").await.unwrap() {
            Restored::Hit(set) => {
                assert_eq!(set.len(), 1);
                assert_eq!(set.get("new").unwrap().data.as_ref(), b"fresh");
            }
            Restored::Miss => panic!("expected hit"),
        }

        tokio::fs::remove_dir_all(&root).await.ok();
    }

    #[tokio::test]
    async fn test_fs_delete_is_idempotent() {
        let root = scratch_dir();
        let cache = FsCache::new(&root);

        cache.store("k", sample_set()).await.unwrap();
        cache.delete("k").await.unwrap();
        cache.delete("k").await.unwrap();
        assert_eq!(cache.restore("k").await.unwrap(), Restored::Miss);

        tokio::fs::remove_dir_all(&root).await.ok();
    }

    #[tokio::test]
    async fn test_fs_corrupted_blob_reads_as_miss() {
        let root = scratch_dir();
        let cache = FsCache::new(&root);

        cache.store("k", sample_set()).await.unwrap();

        // Flip the first blob on disk; the checksum no longer matches.
        let dir = cache.entry_dir("k");
        tokio::fs::write(dir.join("artifact-0.bin"), b"tampered")
            .await
            .unwrap();

        assert_eq!(cache.restore("k").await.unwrap(), Restored::Miss);

        tokio::fs::remove_dir_all(&root).await.ok();
    }

    #[tokio::test]
    async fn test_fs_corrupted_manifest_reads_as_miss() {
        let root = scratch_dir();
        let cache = FsCache::new(&root);

        cache.store("k", sample_set()).await.unwrap();
        let dir = cache.entry_dir("k");
        tokio::fs::write(dir.join("manifest.json"), b"{ not json")
            .await
            .unwrap();

        assert_eq!(cache.restore("k").await.unwrap(), Restored::Miss);

        tokio::fs::remove_dir_all(&root).await.ok();
    }
}
