//! Resource resolution: local storage, then disk cache, then mirrors.
//!
//! A [`Resource`] is a handle to a byte range, possibly inside a larger
//! archive file. It does not own its backing file; the memory map used
//! to read it lives only for the duration of a single [`Resource::read`].

use memmap2::Mmap;
use std::fs::File;
use std::path::PathBuf;
use tracing::{debug, warn};

use crate::cache::{CacheKind, DiskCache};
use crate::cancel::CancelSignal;
use crate::casc::LocalCasc;
use crate::mirrors::MirrorPool;
use crate::{Error, Result};
use tephra_formats::EKey;

/// A handle to resolved bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    /// Backing file.
    pub path: PathBuf,
    /// Offset of the resource inside the file.
    pub offset: u64,
    /// Length of the resource; 0 means "to end of file".
    pub length: u64,
    /// Whether the resource exists. Empty resources are legal and mean
    /// "missing"; `exists` always reports truthfully.
    pub exists: bool,
}

impl Resource {
    /// The canonical missing resource.
    pub fn missing() -> Self {
        Self {
            path: PathBuf::new(),
            offset: 0,
            length: 0,
            exists: false,
        }
    }

    /// A resource spanning a whole file.
    pub fn whole_file(path: PathBuf) -> Self {
        Self {
            path,
            offset: 0,
            length: 0,
            exists: true,
        }
    }

    /// A resource spanning `length` bytes at `offset` inside a file.
    pub fn span(path: PathBuf, offset: u64, length: u64) -> Self {
        Self {
            path,
            offset,
            length,
            exists: true,
        }
    }

    /// Read the resource's bytes. The backing file is mapped read-only
    /// for the duration of this call only.
    pub fn read(&self) -> Result<Vec<u8>> {
        if !self.exists {
            return Err(Error::NotFound {
                what: "empty resource".to_string(),
            });
        }

        let file = File::open(&self.path)?;
        let map = unsafe { Mmap::map(&file)? };

        let start = self.offset as usize;
        let end = if self.length == 0 {
            map.len()
        } else {
            start + self.length as usize
        };
        if start > end || end > map.len() {
            return Err(Error::NotFound {
                what: format!(
                    "range {start}..{end} outside {} byte file {:?}",
                    map.len(),
                    self.path
                ),
            });
        }

        Ok(map[start..end].to_vec())
    }
}

/// Resolves content-addressed resources through the fixed precedence
/// chain: local game storage, disk cache, remote mirrors.
#[derive(Debug)]
pub struct Resolver {
    pool: MirrorPool,
    cache: DiskCache,
    casc: Option<LocalCasc>,
}

impl Resolver {
    /// Build a resolver. `casc` is the optional locally installed game.
    pub fn new(pool: MirrorPool, cache: DiskCache, casc: Option<LocalCasc>) -> Self {
        Self { pool, cache, casc }
    }

    /// The disk cache this resolver writes into.
    pub fn cache(&self) -> &DiskCache {
        &self.cache
    }

    /// Resolve a configuration file by hash.
    pub async fn fetch_config(&self, hex: &str, cancel: &CancelSignal) -> Result<Resource> {
        if let Some(casc) = &self.casc {
            let path = casc.config_path(hex);
            if path.is_file() {
                debug!("config {hex} found in local storage");
                return Ok(Resource::whole_file(path));
            }
        }
        self.fetch_cached(CacheKind::Config, hex, 0, false, cancel)
            .await
    }

    /// Resolve an index file by hash.
    pub async fn fetch_index(&self, hex: &str, cancel: &CancelSignal) -> Result<Resource> {
        if let Some(casc) = &self.casc {
            let path = casc.index_path(hex);
            if path.is_file() {
                debug!("index {hex} found in local storage");
                return Ok(Resource::whole_file(path));
            }
        }
        self.fetch_cached(CacheKind::Index, hex, 0, false, cancel)
            .await
    }

    /// Resolve a whole data blob by encoding key.
    ///
    /// `expected_len` (0 = unknown) gates cache reuse and the remote
    /// HEAD check; `validate` additionally requires the resolved bytes
    /// to hash to the encoding key.
    pub async fn fetch_data(
        &self,
        ekey: &EKey,
        expected_len: u64,
        validate: bool,
        cancel: &CancelSignal,
    ) -> Result<Resource> {
        if let Some(resource) = self.lookup_casc(ekey) {
            return Ok(resource);
        }
        self.fetch_cached(
            CacheKind::Data,
            &ekey.to_string(),
            expected_len,
            validate,
            cancel,
        )
        .await
    }

    /// Resolve `length` bytes at `offset` inside the archive named
    /// `archive_hex`, caching the span under the blob's own encoding
    /// key.
    pub async fn fetch_archive_span(
        &self,
        archive_hex: &str,
        ekey: &EKey,
        offset: u64,
        length: u64,
        validate: bool,
        cancel: &CancelSignal,
    ) -> Result<Resource> {
        if let Some(resource) = self.lookup_casc(ekey) {
            return Ok(resource);
        }

        let cache_path = self.cache.entry_path(CacheKind::Data, &ekey.to_string());
        let remote_path = DiskCache::remote_path(CacheKind::Data, archive_hex);
        self.resolve_remote(
            cache_path,
            &remote_path,
            length,
            Some((offset, length)),
            validate.then(|| *ekey),
            cancel,
        )
        .await
    }

    /// Local storage lookup; data requests consult it first.
    fn lookup_casc(&self, ekey: &EKey) -> Option<Resource> {
        let casc = self.casc.as_ref()?;
        let (path, location) = casc.lookup(ekey)?;
        debug!("{ekey} found in local storage archive {}", location.archive);
        Some(Resource::span(
            path,
            location.offset,
            u64::from(location.size),
        ))
    }

    async fn fetch_cached(
        &self,
        kind: CacheKind,
        hex: &str,
        expected_len: u64,
        validate: bool,
        cancel: &CancelSignal,
    ) -> Result<Resource> {
        let cache_path = self.cache.entry_path(kind, hex);
        let remote_path = DiskCache::remote_path(kind, hex);
        let digest = if validate {
            Some(EKey::from_hex(hex)?)
        } else {
            None
        };
        self.resolve_remote(cache_path, &remote_path, expected_len, None, digest, cancel)
            .await
    }

    /// Disk-cache-then-remote tail of every resolution.
    ///
    /// The per-path mutex is held for the whole check-download-rename
    /// sequence, so concurrent requests for one path perform at most one
    /// network fetch; the later arrival finds the completed file. A
    /// cached or downloaded file failing digest validation is deleted
    /// and re-downloaded exactly once before the corruption surfaces.
    /// A fired `cancel` aborts with [`Error::Cancelled`]; the in-flight
    /// download is dropped along with its temporary file, so no partial
    /// write is ever observable at the cache path.
    async fn resolve_remote(
        &self,
        cache_path: PathBuf,
        remote_path: &str,
        expected_len: u64,
        range: Option<(u64, u64)>,
        digest: Option<EKey>,
        cancel: &CancelSignal,
    ) -> Result<Resource> {
        let lock = self.cache.lock_for(&cache_path);
        let _guard = lock.lock().await;

        if self.cache.check(&cache_path, expected_len).await? {
            match check_digest(&cache_path, digest.as_ref()) {
                Ok(()) => return Ok(Resource::whole_file(cache_path)),
                Err(_) => {
                    warn!("cached {cache_path:?} fails validation, re-downloading");
                    self.cache.remove(&cache_path).await;
                }
            }
        }

        let mut attempts_left = if digest.is_some() { 2 } else { 1 };
        loop {
            let download = async {
                match self.pool.fetch(remote_path, expected_len, range, cancel).await? {
                    Some(response) => {
                        self.cache.write_response(&cache_path, response).await?;
                        Ok(true)
                    }
                    None => Ok(false),
                }
            };
            let fetched: Result<bool> = tokio::select! {
                () = cancel.cancelled() => {
                    // Dropping the download discards its temporary file.
                    return Err(Error::Cancelled {
                        what: remote_path.to_string(),
                    });
                }
                fetched = download => fetched,
            };
            if !fetched? {
                return Ok(Resource::missing());
            }

            match check_digest(&cache_path, digest.as_ref()) {
                Ok(()) => return Ok(Resource::whole_file(cache_path)),
                Err(actual) => {
                    self.cache.remove(&cache_path).await;
                    attempts_left -= 1;
                    if attempts_left == 0 {
                        return Err(Error::ChecksumMismatch {
                            name: remote_path.to_string(),
                            expected: digest.map(|d| d.to_string()).unwrap_or_default(),
                            actual,
                        });
                    }
                    warn!("downloaded {remote_path} fails validation, retrying once");
                }
            }
        }
    }
}

/// `Ok` if no digest is expected or the file's MD5 matches it;
/// otherwise the hex of the digest actually observed.
fn check_digest(
    path: &std::path::Path,
    expected: Option<&EKey>,
) -> std::result::Result<(), String> {
    let Some(expected) = expected else {
        return Ok(());
    };
    match std::fs::read(path) {
        Ok(bytes) => {
            let actual = md5::compute(&bytes).0;
            if actual == *expected.as_bytes() {
                Ok(())
            } else {
                Err(hex::encode(actual))
            }
        }
        Err(e) => Err(format!("unreadable: {e}")),
    }
}
