//! Persistent disk cache of CDN content.
//!
//! Files live at `<cache>/<product>/<kind>/<xx>/<yy>/<hex>` where `xx`
//! and `yy` are the first two byte pairs of the hex name; indices use a
//! flat `<cache>/<product>/<hash>.index` layout shared with locally
//! built group indices. Every write goes to a temporary file in the
//! destination directory followed by a rename, so a partially written
//! file is never observable at its real path. Concurrent writers of the
//! same path serialise on a per-path mutex.

use dashmap::DashMap;
use reqwest::Response;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::Result;

/// Cache (and CDN path) kind of a blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKind {
    /// Configuration files.
    Config,
    /// Data blobs and archives.
    Data,
    /// Archive/file/group indices.
    Index,
}

/// Disk cache rooted at `<cache>/<product>`.
#[derive(Debug)]
pub struct DiskCache {
    root: PathBuf,
    locks: DashMap<PathBuf, Arc<Mutex<()>>>,
}

impl DiskCache {
    /// Create a cache for one product under `cache_root`.
    pub fn new(cache_root: &Path, product: &str) -> Self {
        Self {
            root: cache_root.join(product),
            locks: DashMap::new(),
        }
    }

    /// The cache's root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Cache path of a blob.
    pub fn entry_path(&self, kind: CacheKind, hex: &str) -> PathBuf {
        match kind {
            CacheKind::Config => self.fanned(hex, "config", ""),
            CacheKind::Data => self.fanned(hex, "data", ""),
            CacheKind::Index => self.root.join(format!("{hex}.index")),
        }
    }

    /// Remote path of a blob relative to a mirror's base URL.
    pub fn remote_path(kind: CacheKind, hex: &str) -> String {
        match kind {
            CacheKind::Config => format!("config/{}/{}/{hex}", &hex[..2], &hex[2..4]),
            CacheKind::Data => format!("data/{}/{}/{hex}", &hex[..2], &hex[2..4]),
            CacheKind::Index => format!("data/{}/{}/{hex}.index", &hex[..2], &hex[2..4]),
        }
    }

    fn fanned(&self, hex: &str, kind: &str, suffix: &str) -> PathBuf {
        let mut path = self.root.join(kind);
        if hex.len() >= 4 {
            path.push(&hex[..2]);
            path.push(&hex[2..4]);
        }
        path.push(format!("{hex}{suffix}"));
        path
    }

    /// `true` if the file exists with a plausible size. A file whose
    /// size contradicts `expected_len` is stale and deleted here.
    pub async fn check(&self, path: &Path, expected_len: u64) -> Result<bool> {
        match tokio::fs::metadata(path).await {
            Ok(meta) => {
                if expected_len == 0 || meta.len() == expected_len {
                    Ok(true)
                } else {
                    warn!(
                        "stale cache file {path:?}: {} bytes, expected {expected_len}",
                        meta.len()
                    );
                    self.remove(path).await;
                    Ok(false)
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a cache file, ignoring a concurrent disappearance.
    pub async fn remove(&self, path: &Path) {
        if let Err(e) = tokio::fs::remove_file(path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to remove {path:?}: {e}");
            }
        }
    }

    /// The mutex guarding one cache path. Holding it makes the caller
    /// the only writer (and downloader) for that path.
    pub fn lock_for(&self, path: &Path) -> Arc<Mutex<()>> {
        self.locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Stream a response body into the cache atomically. The temporary
    /// file is created next to the destination and renamed over it only
    /// once the body is complete; on any error the temporary is
    /// discarded.
    pub async fn write_response(&self, path: &Path, mut response: Response) -> Result<u64> {
        let parent = path.parent().expect("cache paths always have a parent");
        tokio::fs::create_dir_all(parent).await?;

        let tmp = NamedTempFile::new_in(parent)?;
        let mut file = tokio::fs::File::from_std(tmp.reopen()?);

        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        drop(file);

        tmp.persist(path).map_err(|e| e.error)?;
        debug!("cached {written} bytes at {path:?}");
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn entry_paths_fan_out() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::new(dir.path(), "wow");

        let path = cache.entry_path(CacheKind::Data, "abcdef0123");
        assert!(path.ends_with("wow/data/ab/cd/abcdef0123"));

        let path = cache.entry_path(CacheKind::Config, "deadbeef");
        assert!(path.ends_with("wow/config/de/ad/deadbeef"));

        let path = cache.entry_path(CacheKind::Index, "feedface");
        assert!(path.ends_with("wow/feedface.index"));
    }

    #[test]
    fn remote_paths_match_cdn_layout() {
        assert_eq!(
            DiskCache::remote_path(CacheKind::Data, "abcdef"),
            "data/ab/cd/abcdef"
        );
        assert_eq!(
            DiskCache::remote_path(CacheKind::Config, "abcdef"),
            "config/ab/cd/abcdef"
        );
        assert_eq!(
            DiskCache::remote_path(CacheKind::Index, "abcdef"),
            "data/ab/cd/abcdef.index"
        );
    }

    #[tokio::test]
    async fn check_deletes_stale_files() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::new(dir.path(), "wow");
        let path = cache.entry_path(CacheKind::Data, "abcdef");

        tokio::fs::create_dir_all(path.parent().unwrap())
            .await
            .unwrap();
        tokio::fs::write(&path, b"12345").await.unwrap();

        assert!(cache.check(&path, 5).await.unwrap());
        assert!(cache.check(&path, 0).await.unwrap());

        // Wrong expected size: stale, deleted.
        assert!(!cache.check(&path, 9).await.unwrap());
        assert!(!path.exists());
        assert!(!cache.check(&path, 9).await.unwrap());
    }

    #[tokio::test]
    async fn lock_is_shared_per_path() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::new(dir.path(), "wow");
        let path = cache.entry_path(CacheKind::Data, "abcdef");

        let a = cache.lock_for(&path);
        let b = cache.lock_for(&path);
        assert!(Arc::ptr_eq(&a, &b));

        let other = cache.lock_for(&cache.entry_path(CacheKind::Data, "ffffff"));
        assert!(!Arc::ptr_eq(&a, &other));
    }
}
