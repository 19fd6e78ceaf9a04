//! Opening a build and extracting files from it.
//!
//! `BuildSession::open` follows the fixed bring-up order: group index
//! (resolved, or built locally from the per-archive indices), file
//! index, encoding table, root manifest, install manifest. Every later
//! extraction walks root → encoding → index chain and decodes the
//! fetched blob.

use reqwest::Client;
use std::path::PathBuf;
use tracing::{debug, info};

use tephra_blte::KeyRing;
use tephra_cdn::{CancelSignal, DiskCache, LocalCasc, MirrorPool, PatchService, Resolver};
use tephra_formats::config::{BuildConfig, CdnConfig};
use tephra_formats::encoding::EncodingFile;
use tephra_formats::group::build_group_index;
use tephra_formats::index::IndexFile;
use tephra_formats::install::InstallManifest;
use tephra_formats::jenkins3::hash_path;
use tephra_formats::root::{LocaleFlags, RootFile};
use tephra_formats::{CKey, EKey};

use crate::{Error, Result};

/// Configuration for opening a build session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Product code, e.g. `wow`.
    pub product: String,
    /// Service region, e.g. `us`.
    pub region: String,
    /// Locale whose root pages are kept.
    pub locale: LocaleFlags,
    /// Disk cache root.
    pub cache_dir: PathBuf,
    /// Base directory of a local installation, if any.
    pub base_dir: Option<PathBuf>,
    /// Build configuration hash; fetched from the versions service when
    /// absent.
    pub build_config: Option<String>,
    /// CDN configuration hash; fetched alongside `build_config`.
    pub cdn_config: Option<String>,
    /// Host-supplied encryption keys.
    pub keys: KeyRing,
    /// Override for the patch service base URL.
    pub patch_base: Option<String>,
    /// Mirror hosts to use instead of service discovery.
    pub mirror_hosts: Option<Vec<String>>,
    /// CDN path stem to pair with `mirror_hosts`.
    pub cdn_stem: Option<String>,
    /// Cancellation signal observed by every network fetch the session
    /// makes. Defaults to a signal that never fires.
    pub cancel: CancelSignal,
}

impl SessionConfig {
    /// A default configuration for one product.
    pub fn new(product: impl Into<String>) -> Self {
        Self {
            product: product.into(),
            region: "us".to_string(),
            locale: LocaleFlags::named("enUS").expect("enUS is a known locale"),
            cache_dir: PathBuf::from("cache"),
            base_dir: None,
            build_config: None,
            cdn_config: None,
            keys: KeyRing::new(),
            patch_base: None,
            mirror_hosts: None,
            cdn_stem: None,
            cancel: CancelSignal::none(),
        }
    }
}

/// An opened build: every table needed to turn a file identifier into
/// bytes.
#[derive(Debug)]
pub struct BuildSession {
    resolver: Resolver,
    keys: KeyRing,
    cancel: CancelSignal,
    archives: Vec<String>,
    group_index: IndexFile,
    file_index: IndexFile,
    encoding: EncodingFile,
    root: RootFile,
    install: InstallManifest,
}

impl BuildSession {
    /// Open a build, failing fast on the first unavailable component.
    pub async fn open(config: SessionConfig) -> Result<Self> {
        let client = Client::new();
        let patch = match &config.patch_base {
            Some(base) => PatchService::with_base_url(client.clone(), &config.region, base),
            None => PatchService::new(client.clone(), &config.region),
        };

        let (build_hash, cdn_hash) = match (&config.build_config, &config.cdn_config) {
            (Some(build), Some(cdn)) => (build.clone(), cdn.clone()),
            _ => {
                let version = patch.version_for_region(&config.product).await?;
                info!(
                    "versions: build {} cdn {} ({})",
                    version.build_config,
                    version.cdn_config,
                    version.versions_name.as_deref().unwrap_or("unnamed")
                );
                (version.build_config, version.cdn_config)
            }
        };

        let pool = match &config.mirror_hosts {
            Some(hosts) => {
                let refs: Vec<&str> = hosts.iter().map(String::as_str).collect();
                let stem = config
                    .cdn_stem
                    .clone()
                    .unwrap_or_else(|| format!("tpr/{}", config.product));
                MirrorPool::from_hosts(client.clone(), &refs, &stem)
            }
            None => MirrorPool::discover(client.clone(), &patch, &config.product).await?,
        };

        let cache = DiskCache::new(&config.cache_dir, &config.product);
        let casc = config.base_dir.clone().map(LocalCasc::new);
        let resolver = Resolver::new(pool, cache, casc);

        let cancel = &config.cancel;
        let build =
            BuildConfig::parse(&read_text(&resolver.fetch_config(&build_hash, cancel).await?)?);
        let cdn = CdnConfig::parse(&read_text(&resolver.fetch_config(&cdn_hash, cancel).await?)?);
        let archives: Vec<String> = cdn.archives().into_iter().map(str::to_string).collect();

        let group_index = Self::open_group_index(&resolver, &cdn, &archives, cancel).await?;
        let file_index = Self::open_plain_index(&resolver, cdn.file_index()?, cancel).await?;

        let fetcher = Fetcher {
            resolver: &resolver,
            group_index: &group_index,
            file_index: &file_index,
            archives: &archives,
            cancel,
        };

        // Encoding decodes with the size the build config promises.
        let encoded = fetcher
            .fetch_raw(
                &build.encoding_ekey()?,
                build.encoding_encoded_size().unwrap_or(0),
                false,
            )
            .await?;
        let decoded =
            tephra_blte::decode(&encoded, build.encoding_decoded_size()?, Some(&config.keys))?;
        let encoding = EncodingFile::parse(decoded)?;
        debug!("opened encoding table");

        let root_bytes =
            Self::fetch_manifest(&fetcher, &encoding, &build.root()?, &config.keys).await?;
        let root = RootFile::parse(&root_bytes, config.locale)?;
        info!("opened root: {} records", root.record_count());

        let install_bytes =
            Self::fetch_manifest(&fetcher, &encoding, &build.install()?, &config.keys).await?;
        let install = InstallManifest::parse(&String::from_utf8_lossy(&install_bytes))?;
        debug!("opened install manifest: {} entries", install.entries().len());

        Ok(Self {
            resolver,
            keys: config.keys,
            cancel: config.cancel,
            archives,
            group_index,
            file_index,
            encoding,
            root,
            install,
        })
    }

    /// Resolve the published group index, or build one locally from the
    /// per-archive indices.
    async fn open_group_index(
        resolver: &Resolver,
        cdn: &CdnConfig,
        archives: &[String],
        cancel: &CancelSignal,
    ) -> Result<IndexFile> {
        if let Some(hash) = cdn.archive_group() {
            let resource = resolver.fetch_index(hash, cancel).await?;
            if resource.exists {
                return Ok(IndexFile::open(&resource.path)?);
            }
            debug!("published group index {hash} unavailable, building locally");
            return Self::build_group_index(resolver, archives, Some(hash), cancel).await;
        }
        Self::build_group_index(resolver, archives, None, cancel).await
    }

    async fn build_group_index(
        resolver: &Resolver,
        archives: &[String],
        expected: Option<&str>,
        cancel: &CancelSignal,
    ) -> Result<IndexFile> {
        let mut indices = Vec::with_capacity(archives.len());
        for hash in archives {
            indices.push(Self::open_plain_index(resolver, hash, cancel).await?);
        }
        let built = build_group_index(&indices, expected, resolver.cache().root())?;
        info!(
            "built group index {} ({} entries)",
            built.name, built.num_elements
        );
        Ok(IndexFile::open(&built.path)?)
    }

    async fn open_plain_index(
        resolver: &Resolver,
        hash: &str,
        cancel: &CancelSignal,
    ) -> Result<IndexFile> {
        let resource = resolver.fetch_index(hash, cancel).await?;
        if !resource.exists {
            return Err(Error::FileNotFound {
                what: format!("index {hash}"),
            });
        }
        Ok(IndexFile::open(&resource.path)?)
    }

    /// Fetch and decode a manifest (root, install) named by content key.
    /// Manifests are high-value, so the fetch validates the digest.
    async fn fetch_manifest(
        fetcher: &Fetcher<'_>,
        encoding: &EncodingFile,
        ckey: &CKey,
        keys: &KeyRing,
    ) -> Result<Vec<u8>> {
        let entry = encoding
            .find_by_ckey(ckey)
            .ok_or_else(|| Error::FileNotFound {
                what: format!("encoding entry for {ckey}"),
            })?;
        let ekey = entry.ekeys.first().ok_or_else(|| Error::FileNotFound {
            what: format!("encoding keys for {ckey}"),
        })?;
        let encoded = fetcher.fetch_raw(ekey, 0, true).await?;
        Ok(tephra_blte::decode(&encoded, entry.decoded_size, Some(keys))?)
    }

    fn fetcher(&self) -> Fetcher<'_> {
        Fetcher {
            resolver: &self.resolver,
            group_index: &self.group_index,
            file_index: &self.file_index,
            archives: &self.archives,
            cancel: &self.cancel,
        }
    }

    /// The parsed root manifest.
    pub fn root(&self) -> &RootFile {
        &self.root
    }

    /// The parsed encoding table.
    pub fn encoding(&self) -> &EncodingFile {
        &self.encoding
    }

    /// The parsed install manifest.
    pub fn install(&self) -> &InstallManifest {
        &self.install
    }

    /// Fetch the raw (still encoded) bytes behind an encoding key.
    pub async fn fetch_by_ekey(&self, ekey: &EKey, expected_len: u64) -> Result<Vec<u8>> {
        self.fetcher().fetch_raw(ekey, expected_len, false).await
    }

    /// Extract a file's decoded bytes by content key.
    ///
    /// Alternate encodings are tried in order; an encoding that needs an
    /// encryption key the host did not supply is skipped.
    pub async fn extract_by_ckey(&self, ckey: &CKey) -> Result<Vec<u8>> {
        let entry = self
            .encoding
            .find_by_ckey(ckey)
            .ok_or_else(|| Error::FileNotFound {
                what: format!("encoding entry for {ckey}"),
            })?;

        for ekey in &entry.ekeys {
            let encoded = match self.fetcher().fetch_raw(ekey, 0, false).await {
                Ok(bytes) => bytes,
                Err(Error::FileNotFound { .. }) => continue,
                Err(e) => return Err(e),
            };
            match tephra_blte::decode(&encoded, entry.decoded_size, Some(&self.keys)) {
                Ok(decoded) => return Ok(decoded),
                Err(e) if e.is_missing_key() => {
                    debug!("{ekey} needs a missing key, trying next encoding");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(Error::NoDecodableEncoding {
            ckey: ckey.to_string(),
        })
    }

    /// Extract a file's decoded bytes by file data ID.
    pub async fn extract_by_fdid(&self, fdid: u32) -> Result<Vec<u8>> {
        let record = self
            .root
            .find_file_data_id(fdid)
            .ok_or_else(|| Error::FileNotFound {
                what: format!("file data ID {fdid}"),
            })?;
        self.extract_by_ckey(&record.content_key).await
    }

    /// Extract a file's decoded bytes by virtual path, consulting the
    /// root name hashes first and the install manifest second.
    pub async fn extract_by_name(&self, name: &str) -> Result<Vec<u8>> {
        if let Some(record) = self.root.find_name_hash(hash_path(name)) {
            return self.extract_by_ckey(&record.content_key).await;
        }
        if let Some(entry) = self.install.find(name) {
            return self.extract_by_ckey(&entry.content_key).await;
        }
        Err(Error::FileNotFound {
            what: format!("name {name:?}"),
        })
    }
}

/// Index-chain fetch shared by session bring-up and later extraction.
struct Fetcher<'a> {
    resolver: &'a Resolver,
    group_index: &'a IndexFile,
    file_index: &'a IndexFile,
    archives: &'a [String],
    cancel: &'a CancelSignal,
}

impl Fetcher<'_> {
    /// Fetch a blob's raw bytes by encoding key: group index (archive
    /// span), then file index (standalone whole file), then a direct
    /// whole-file fetch by key alone.
    async fn fetch_raw(&self, ekey: &EKey, expected_len: u64, validate: bool) -> Result<Vec<u8>> {
        if let Some(location) = self.group_index.lookup(ekey.as_bytes()) {
            let archive = location
                .archive_index
                .and_then(|i| self.archives.get(usize::from(i)));
            if let Some(archive) = archive {
                let resource = self
                    .resolver
                    .fetch_archive_span(
                        archive,
                        ekey,
                        location.offset,
                        location.size,
                        validate,
                        self.cancel,
                    )
                    .await?;
                if resource.exists {
                    return Ok(resource.read()?);
                }
            }
        }

        if let Some(location) = self.file_index.lookup(ekey.as_bytes()) {
            let resource = self
                .resolver
                .fetch_data(ekey, location.size, validate, self.cancel)
                .await?;
            if resource.exists {
                return Ok(resource.read()?);
            }
        }

        let resource = self
            .resolver
            .fetch_data(ekey, expected_len, validate, self.cancel)
            .await?;
        if resource.exists {
            return Ok(resource.read()?);
        }
        Err(Error::FileNotFound {
            what: format!("blob {ekey}"),
        })
    }
}

fn read_text(resource: &tephra_cdn::Resource) -> Result<String> {
    if !resource.exists {
        return Err(Error::FileNotFound {
            what: format!("{:?}", resource.path),
        });
    }
    Ok(String::from_utf8_lossy(&resource.read()?).into_owned())
}
