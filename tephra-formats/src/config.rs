//! Build and CDN configuration files.
//!
//! Both are plain key/value text: one assignment per line, either
//! `key = v1 v2 ...` or `key v1 v2 ...`, with `#` starting a comment
//! line. Values are whitespace-separated lists.

use std::collections::HashMap;
use tracing::{debug, trace};

use crate::{CKey, EKey, Error, Result};

/// A parsed key/value configuration blob.
#[derive(Debug, Clone, Default)]
pub struct ConfigFile {
    values: HashMap<String, Vec<String>>,
}

impl ConfigFile {
    /// Parse a configuration blob from text.
    pub fn parse(text: &str) -> Self {
        let mut values = HashMap::new();

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let mut tokens = line.split_whitespace();
            let Some(key) = tokens.next() else { continue };
            let key = key.trim_end_matches('=');
            if key.is_empty() {
                continue;
            }

            let fields: Vec<String> = tokens
                .filter(|t| *t != "=")
                .map(str::to_string)
                .collect();
            trace!("config entry: {key} = {fields:?}");
            values.insert(key.to_string(), fields);
        }

        debug!("parsed config with {} entries", values.len());
        Self { values }
    }

    /// All values for `key`, if present.
    pub fn get(&self, key: &str) -> Option<&[String]> {
        self.values.get(key).map(Vec::as_slice)
    }

    /// The first value for `key`, if present.
    pub fn first(&self, key: &str) -> Option<&str> {
        self.get(key)?.first().map(String::as_str)
    }

    /// The `index`-th value for `key`, or a missing-key error.
    fn require(&self, key: &'static str, index: usize) -> Result<&str> {
        self.get(key)
            .and_then(|v| v.get(index))
            .map(String::as_str)
            .ok_or(Error::MissingConfigKey(key))
    }

    /// `true` if the key is present.
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }
}

/// Build configuration: names the root, encoding, and install manifests
/// of one build.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    config: ConfigFile,
}

impl BuildConfig {
    /// Parse a build configuration.
    pub fn parse(text: &str) -> Self {
        Self {
            config: ConfigFile::parse(text),
        }
    }

    /// The underlying key/value table.
    pub fn raw(&self) -> &ConfigFile {
        &self.config
    }

    /// Content key of the root manifest.
    pub fn root(&self) -> Result<CKey> {
        CKey::from_hex(self.config.require("root", 0)?)
    }

    /// Content key of the install manifest.
    pub fn install(&self) -> Result<CKey> {
        CKey::from_hex(self.config.require("install", 0)?)
    }

    /// Encoding key of the encoding table (`encoding[1]`; `encoding[0]`
    /// is its content key).
    pub fn encoding_ekey(&self) -> Result<EKey> {
        EKey::from_hex(self.config.require("encoding", 1)?)
    }

    /// Content key of the encoding table.
    pub fn encoding_ckey(&self) -> Result<CKey> {
        CKey::from_hex(self.config.require("encoding", 0)?)
    }

    /// Decoded size of the encoding table (`encoding-size[0]`).
    pub fn encoding_decoded_size(&self) -> Result<u64> {
        self.config
            .require("encoding-size", 0)?
            .parse()
            .map_err(|_| Error::MissingConfigKey("encoding-size"))
    }

    /// Encoded size of the encoding table (`encoding-size[1]`).
    pub fn encoding_encoded_size(&self) -> Result<u64> {
        self.config
            .require("encoding-size", 1)?
            .parse()
            .map_err(|_| Error::MissingConfigKey("encoding-size"))
    }
}

/// CDN configuration: names the archives and indices of one build.
#[derive(Debug, Clone)]
pub struct CdnConfig {
    config: ConfigFile,
}

impl CdnConfig {
    /// Parse a CDN configuration.
    pub fn parse(text: &str) -> Self {
        Self {
            config: ConfigFile::parse(text),
        }
    }

    /// The underlying key/value table.
    pub fn raw(&self) -> &ConfigFile {
        &self.config
    }

    /// Archive hashes, in order. The position of a hash in this list is
    /// its archive index.
    pub fn archives(&self) -> Vec<&str> {
        self.config
            .get("archives")
            .map(|v| v.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Hash of the prebuilt group index, if the CDN publishes one.
    pub fn archive_group(&self) -> Option<&str> {
        self.config.first("archive-group")
    }

    /// Hash of the index of standalone (non-archived) blobs.
    pub fn file_index(&self) -> Result<&str> {
        self.config.require("file-index", 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_both_assignment_styles() {
        let text = "\
# Build configuration
root = 00112233445566778899aabbccddeeff
install 00112233445566778899aabbccddee00
encoding = aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb
encoding-size = 1234 999
empty-value =
";
        let config = ConfigFile::parse(text);
        assert_eq!(
            config.first("root"),
            Some("00112233445566778899aabbccddeeff")
        );
        assert_eq!(
            config.first("install"),
            Some("00112233445566778899aabbccddee00")
        );
        assert_eq!(config.get("encoding").unwrap().len(), 2);
        assert_eq!(config.get("empty-value"), Some(&[] as &[String]));
        assert!(!config.contains("missing"));
    }

    #[test]
    fn build_config_accessors() {
        let build = BuildConfig::parse(
            "root = 00112233445566778899aabbccddeeff\n\
             install = 00112233445566778899aabbccddee00\n\
             encoding = aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb\n\
             encoding-size = 1234 999\n",
        );

        assert_eq!(
            build.root().unwrap().to_string(),
            "00112233445566778899aabbccddeeff"
        );
        assert_eq!(
            build.encoding_ekey().unwrap().to_string(),
            "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb"
        );
        assert_eq!(build.encoding_decoded_size().unwrap(), 1234);
        assert_eq!(build.encoding_encoded_size().unwrap(), 999);
    }

    #[test]
    fn missing_keys_error() {
        let build = BuildConfig::parse("root = 00112233445566778899aabbccddeeff\n");
        assert!(matches!(
            build.encoding_ekey(),
            Err(Error::MissingConfigKey("encoding"))
        ));
    }

    #[test]
    fn cdn_config_accessors() {
        let cdn = CdnConfig::parse(
            "archives = aaa bbb ccc\n\
             archive-group = ddd\n\
             file-index = eee\n",
        );
        assert_eq!(cdn.archives(), vec!["aaa", "bbb", "ccc"]);
        assert_eq!(cdn.archive_group(), Some("ddd"));
        assert_eq!(cdn.file_index().unwrap(), "eee");

        let cdn = CdnConfig::parse("archives = aaa\nfile-index = eee\n");
        assert_eq!(cdn.archive_group(), None);
    }
}
