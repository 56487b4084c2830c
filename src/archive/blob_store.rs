//! Content-addressed blob store for page bodies and captured resources.
//!
//! Blobs are addressed by the SHA-256 of their uncompressed content and
//! live under `sha256/<aa>/<bb>/<hash>.<ext>`, zstd-compressed unless the
//! content is already a compressed format. Writes go through a temp file,
//! fsync, rename so a crash never leaves a torn blob.

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Result of storing bytes.
#[derive(Debug, Clone)]
pub struct StoredBlob {
    /// SHA-256 hex of the uncompressed content.
    pub hash: String,
    /// Store-relative path, `sha256/<aa>/<bb>/<hash>.<ext>`.
    pub blob_ref: String,
    /// True when identical content was already stored.
    pub deduplicated: bool,
    pub compressed_size: u64,
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobStoreStats {
    pub total_blobs: u64,
    pub total_bytes_compressed: u64,
    pub deduplication_hits: u64,
}

impl BlobStoreStats {
    #[must_use]
    pub fn dedup_rate(&self) -> f64 {
        let attempts = self.total_blobs + self.deduplication_hits;
        if attempts == 0 {
            return 0.0;
        }
        self.deduplication_hits as f64 / attempts as f64
    }
}

pub struct BlobStore {
    root: PathBuf,
    zstd_level: i32,
    known: DashMap<String, String>,
    /// Serializes the check-then-write sequence per hash; everything else
    /// is lock-free.
    hash_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    total_blobs: AtomicU64,
    total_bytes_compressed: AtomicU64,
    dedup_hits: AtomicU64,
}

impl BlobStore {
    /// Open (or create) a store rooted at `root`. Existing blobs from an
    /// interrupted crawl are indexed so resume keeps deduplicating.
    pub async fn open(root: PathBuf, zstd_level: i32) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(root.join("sha256")).await?;
        let store = Self {
            root,
            zstd_level,
            known: DashMap::new(),
            hash_locks: DashMap::new(),
            total_blobs: AtomicU64::new(0),
            total_bytes_compressed: AtomicU64::new(0),
            dedup_hits: AtomicU64::new(0),
        };
        store.index_existing().await?;
        Ok(store)
    }

    #[must_use]
    pub fn hash_bytes(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    /// Store content, compressing with zstd. Identical content is stored
    /// once; repeated stores return `deduplicated=true`.
    pub async fn store(&self, bytes: Vec<u8>) -> anyhow::Result<StoredBlob> {
        self.store_with_ext(bytes, "zst", true).await
    }

    /// Store already-compressed content (screenshots, media) verbatim under
    /// its own extension.
    pub async fn store_raw(&self, bytes: Vec<u8>, ext: &str) -> anyhow::Result<StoredBlob> {
        self.store_with_ext(bytes, ext, false).await
    }

    async fn store_with_ext(
        &self,
        bytes: Vec<u8>,
        ext: &str,
        compress: bool,
    ) -> anyhow::Result<StoredBlob> {
        let hash = Self::hash_bytes(&bytes);
        let blob_ref = blob_rel_path(&hash, ext);

        let lock = self
            .hash_locks
            .entry(hash.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        if let Some(existing) = self.known.get(&hash) {
            self.dedup_hits.fetch_add(1, Ordering::Relaxed);
            debug!(%hash, "blob dedup hit");
            return Ok(StoredBlob {
                hash,
                blob_ref: existing.clone(),
                deduplicated: true,
                compressed_size: 0,
            });
        }

        let path = self.root.join(&blob_ref);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let level = self.zstd_level;
        let root = self.root.clone();
        let target = path.clone();
        let compressed_size = tokio::task::spawn_blocking(move || -> anyhow::Result<u64> {
            let payload = if compress {
                zstd::bulk::compress(&bytes, level)?
            } else {
                bytes
            };
            let mut temp = tempfile::NamedTempFile::new_in(&root)?;
            temp.write_all(&payload)?;
            temp.as_file().sync_all()?;
            temp.persist(&target)?;
            Ok(payload.len() as u64)
        })
        .await??;

        self.known.insert(hash.clone(), blob_ref.clone());
        self.total_blobs.fetch_add(1, Ordering::Relaxed);
        self.total_bytes_compressed.fetch_add(compressed_size, Ordering::Relaxed);

        Ok(StoredBlob { hash, blob_ref, deduplicated: false, compressed_size })
    }

    /// Load a blob back to its uncompressed bytes.
    pub async fn load(&self, blob_ref: &str) -> anyhow::Result<Vec<u8>> {
        let path = self.root.join(blob_ref);
        let raw = tokio::fs::read(&path).await?;
        if blob_ref.ends_with(".zst") {
            let decoded =
                tokio::task::spawn_blocking(move || zstd::stream::decode_all(raw.as_slice()))
                    .await??;
            Ok(decoded)
        } else {
            Ok(raw)
        }
    }

    #[must_use]
    pub fn has(&self, hash: &str) -> bool {
        self.known.contains_key(hash)
    }

    #[must_use]
    pub fn blob_ref_for(&self, hash: &str) -> Option<String> {
        self.known.get(hash).map(|r| r.clone())
    }

    #[must_use]
    pub fn stats(&self) -> BlobStoreStats {
        BlobStoreStats {
            total_blobs: self.total_blobs.load(Ordering::Relaxed),
            total_bytes_compressed: self.total_bytes_compressed.load(Ordering::Relaxed),
            deduplication_hits: self.dedup_hits.load(Ordering::Relaxed),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Rebuild the in-memory hash index from disk (resume path).
    async fn index_existing(&self) -> anyhow::Result<()> {
        let root = self.root.join("sha256");
        let found = tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<(String, String)>> {
            let mut found = Vec::new();
            for shard_a in read_dirs(&root)? {
                for shard_b in read_dirs(&shard_a)? {
                    for entry in std::fs::read_dir(&shard_b)? {
                        let path = entry?.path();
                        if !path.is_file() {
                            continue;
                        }
                        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                            continue;
                        };
                        if stem.len() == 64 {
                            let Ok(rel) = path.strip_prefix(root.parent().unwrap_or(&root)) else {
                                continue;
                            };
                            found.push((
                                stem.to_string(),
                                rel.to_string_lossy().replace('\\', "/"),
                            ));
                        }
                    }
                }
            }
            Ok(found)
        })
        .await??;

        let count = found.len() as u64;
        for (hash, rel) in found {
            self.known.insert(hash, rel);
        }
        if count > 0 {
            self.total_blobs.store(count, Ordering::Relaxed);
            debug!(blobs = count, "indexed existing blobs for resume");
        }
        Ok(())
    }
}

fn read_dirs(path: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    if !path.exists() {
        return Ok(dirs);
    }
    for entry in std::fs::read_dir(path)? {
        let p = entry?.path();
        if p.is_dir() {
            dirs.push(p);
        }
    }
    Ok(dirs)
}

#[must_use]
pub fn blob_rel_path(hash: &str, ext: &str) -> String {
    format!("sha256/{}/{}/{hash}.{ext}", &hash[..2], &hash[2..4])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn store_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path().to_path_buf(), 3).await.unwrap();
        let content = b"<html><body>hello</body></html>".to_vec();
        let stored = store.store(content.clone()).await.unwrap();
        assert!(!stored.deduplicated);
        assert_eq!(stored.hash.len(), 64);
        let loaded = store.load(&stored.blob_ref).await.unwrap();
        assert_eq!(loaded, content);
    }

    #[tokio::test]
    async fn identical_content_is_stored_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path().to_path_buf(), 3).await.unwrap();
        let content = b"same bytes".to_vec();
        let first = store.store(content.clone()).await.unwrap();
        let second = store.store(content).await.unwrap();
        assert!(second.deduplicated);
        assert_eq!(first.blob_ref, second.blob_ref);
        let stats = store.stats();
        assert_eq!(stats.total_blobs, 1);
        assert_eq!(stats.deduplication_hits, 1);
    }

    #[tokio::test]
    async fn reopen_indexes_existing_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let hash;
        {
            let store = BlobStore::open(dir.path().to_path_buf(), 3).await.unwrap();
            hash = store.store(b"persisted".to_vec()).await.unwrap().hash;
        }
        let reopened = BlobStore::open(dir.path().to_path_buf(), 3).await.unwrap();
        assert!(reopened.has(&hash));
        let again = reopened.store(b"persisted".to_vec()).await.unwrap();
        assert!(again.deduplicated);
    }

    #[test]
    fn blob_paths_are_sharded() {
        let hash = "ab".repeat(32);
        assert_eq!(
            blob_rel_path(&hash, "zst"),
            format!("sha256/ab/ab/{hash}.zst")
        );
    }
}
