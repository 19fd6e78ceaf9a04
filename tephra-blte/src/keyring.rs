//! Host-supplied encryption key registry.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

use crate::{Error, Result};

/// Registry of named 16-byte encryption keys.
///
/// The codec never ships keys of its own; the host loads whichever keys it
/// has and chunks naming an absent key fail softly with
/// [`Error::MissingKey`].
#[derive(Debug, Default, Clone)]
pub struct KeyRing {
    keys: HashMap<u64, [u8; 16]>,
}

impl KeyRing {
    /// Create an empty key ring.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a key by its 64-bit name.
    pub fn get(&self, key_name: u64) -> Option<&[u8; 16]> {
        self.keys.get(&key_name)
    }

    /// Register a key.
    pub fn insert(&mut self, key_name: u64, key: [u8; 16]) {
        self.keys.insert(key_name, key);
    }

    /// Number of registered keys.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// `true` if no keys are registered.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Load keys from a text file of `keyname keyhex` lines.
    ///
    /// Fields may be separated by whitespace or a comma. Blank lines and
    /// lines starting with `#` are skipped; unparseable lines are logged
    /// and skipped. Returns the number of keys loaded.
    pub fn load_file(&mut self, path: &Path) -> Result<usize> {
        let content = fs::read_to_string(path)?;
        let mut loaded = 0;

        for (line_no, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let mut fields = line
                .split(|c: char| c == ',' || c.is_whitespace())
                .filter(|s| !s.is_empty());
            let (Some(name), Some(value)) = (fields.next(), fields.next()) else {
                warn!("skipping malformed key line {}: {line}", line_no + 1);
                continue;
            };

            match (parse_key_name(name), parse_key_hex(value)) {
                (Some(key_name), Some(key)) => {
                    self.insert(key_name, key);
                    loaded += 1;
                }
                _ => warn!("skipping unparseable key line {}: {line}", line_no + 1),
            }
        }

        debug!("loaded {loaded} encryption keys from {path:?}");
        Ok(loaded)
    }
}

/// Parse a 16-hex-digit key name into its numeric form.
fn parse_key_name(s: &str) -> Option<u64> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    if s.len() != 16 {
        return None;
    }
    u64::from_str_radix(s, 16).ok()
}

/// Parse a 32-hex-digit key value.
fn parse_key_hex(s: &str) -> Option<[u8; 16]> {
    let bytes = hex::decode(s).ok()?;
    bytes.try_into().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn insert_and_get() {
        let mut ring = KeyRing::new();
        assert!(ring.is_empty());
        ring.insert(0xFA505078126ACB3E, [0x11; 16]);
        assert_eq!(ring.get(0xFA505078126ACB3E), Some(&[0x11; 16]));
        assert_eq!(ring.get(1), None);
    }

    #[test]
    fn load_file_skips_garbage() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# comment").unwrap();
        writeln!(file, "fa505078126acb3e bdc51862abed79b2de48c8e7e66c6200").unwrap();
        writeln!(file, "ff813f7d062ac0bc,aa0b5c77f088ccc2d39049bd267f066d").unwrap();
        writeln!(file, "not a key").unwrap();
        file.flush().unwrap();

        let mut ring = KeyRing::new();
        let loaded = ring.load_file(file.path()).unwrap();
        assert_eq!(loaded, 2);
        assert!(ring.get(0xFA505078126ACB3E).is_some());
        assert!(ring.get(0xFF813F7D062AC0BC).is_some());
    }
}
