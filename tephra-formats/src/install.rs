//! Install manifest: a tab-separated listing of the files a fresh
//! installation materialises on disk, keyed by file name.

use std::collections::HashMap;
use tracing::debug;

use crate::{CKey, Error, Result};

/// One install manifest entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallEntry {
    /// Virtual file name.
    pub name: String,
    /// Content key of the file.
    pub content_key: CKey,
    /// Decoded file size.
    pub size: u64,
}

/// Parsed install manifest.
#[derive(Debug, Default)]
pub struct InstallManifest {
    entries: Vec<InstallEntry>,
    by_name: HashMap<String, usize>,
}

impl InstallManifest {
    /// Parse `name<TAB>ckey-hex<TAB>size` lines. Blank lines and lines
    /// starting with `#` are skipped.
    pub fn parse(text: &str) -> Result<Self> {
        let mut entries = Vec::new();
        let mut by_name = HashMap::new();

        for (line_no, line) in text.lines().enumerate() {
            let line = line.trim_end();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let mut fields = line.split('\t');
            let (Some(name), Some(ckey), Some(size)) =
                (fields.next(), fields.next(), fields.next())
            else {
                return Err(Error::InvalidInstallLine {
                    line: line_no + 1,
                    reason: "expected three tab-separated fields".to_string(),
                });
            };

            let content_key = CKey::from_hex(ckey).map_err(|_| Error::InvalidInstallLine {
                line: line_no + 1,
                reason: format!("bad content key {ckey:?}"),
            })?;
            let size = size.parse().map_err(|_| Error::InvalidInstallLine {
                line: line_no + 1,
                reason: format!("bad size {size:?}"),
            })?;

            by_name.entry(name.to_string()).or_insert(entries.len());
            entries.push(InstallEntry {
                name: name.to_string(),
                content_key,
                size,
            });
        }

        debug!("parsed install manifest with {} entries", entries.len());
        Ok(Self { entries, by_name })
    }

    /// Look up an entry by exact file name.
    pub fn find(&self, name: &str) -> Option<&InstallEntry> {
        self.by_name.get(name).map(|&i| &self.entries[i])
    }

    /// All entries, in manifest order.
    pub fn entries(&self) -> &[InstallEntry] {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_finds() {
        let text = "# install manifest\n\
                    Wow.exe\t000102030405060708090a0b0c0d0e0f\t1048576\n\
                    Data/config.wtf\taabbccddaabbccddaabbccddaabbccdd\t512\n";
        let manifest = InstallManifest::parse(text).unwrap();
        assert_eq!(manifest.entries().len(), 2);

        let entry = manifest.find("Wow.exe").unwrap();
        assert_eq!(entry.size, 1048576);
        assert_eq!(
            entry.content_key.to_string(),
            "000102030405060708090a0b0c0d0e0f"
        );
        assert!(manifest.find("missing").is_none());
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(matches!(
            InstallManifest::parse("only-one-field\n"),
            Err(Error::InvalidInstallLine { line: 1, .. })
        ));
        assert!(matches!(
            InstallManifest::parse("a\tnothex\t12\n"),
            Err(Error::InvalidInstallLine { .. })
        ));
        assert!(matches!(
            InstallManifest::parse("a\t000102030405060708090a0b0c0d0e0f\tbig\n"),
            Err(Error::InvalidInstallLine { .. })
        ));
    }
}
