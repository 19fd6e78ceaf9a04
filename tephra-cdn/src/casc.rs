//! Read-only access to a locally installed game's storage.
//!
//! Local storage shards its index by a bucket byte derived from the
//! encoding key: XOR-fold the first nine key bytes, then fold the two
//! nibbles. Each bucket's `.idx` file maps nine-byte truncated keys to
//! an (archive number, offset, size) triple inside the `data.NNN`
//! archive files.

use byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace};

use crate::{Error, Result};
use tephra_formats::EKey;

/// Location of a blob inside local storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CascLocation {
    /// Archive number (`data.NNN`).
    pub archive: u16,
    /// Offset inside the archive.
    pub offset: u64,
    /// Stored size of the blob.
    pub size: u32,
}

/// One bucket's parsed index.
#[derive(Debug)]
struct CascIndex {
    entries: BTreeMap<[u8; EKey::BUCKET_FOLD_LEN], CascLocation>,
}

impl CascIndex {
    /// Parse a bucket index file.
    ///
    /// Layout: a hashed header block, a block table, 16-byte alignment
    /// padding, then a hashed run of fixed 18-byte entries (9-byte key,
    /// 5-byte packed location, 4-byte size).
    fn parse<R: Read + Seek>(reader: &mut R) -> Result<Self> {
        let header_size = reader.read_u32::<LittleEndian>()?;
        let _header_hash = reader.read_u32::<LittleEndian>()?;

        let _version = reader.read_u16::<LittleEndian>()?;
        let bucket = reader.read_u8()?;
        let _unused = reader.read_u8()?;
        let length_bytes = reader.read_u8()?;
        let location_bytes = reader.read_u8()?;
        let key_bytes = reader.read_u8()?;
        let segment_bits = reader.read_u8()?;

        if key_bytes != 9 || location_bytes != 5 || length_bytes != 4 {
            return Err(Error::InvalidLocalIndex(format!(
                "field widths key={key_bytes} location={location_bytes} length={length_bytes}, expected 9/5/4"
            )));
        }

        trace!(
            "local index bucket {bucket:02x}: segment_bits={segment_bits}, header {header_size} bytes"
        );

        // Skip the block table the header size accounts for.
        let block_count = header_size.saturating_sub(8) / 8;
        for _ in 0..block_count {
            let _start = reader.read_u32::<BigEndian>()?;
            let _end = reader.read_u32::<BigEndian>()?;
        }

        // Entries start at the next 16-byte boundary.
        let position = reader.stream_position()?;
        let padding = (16 - (position % 16)) % 16;
        if padding > 0 {
            reader.seek(SeekFrom::Current(padding as i64))?;
        }

        let entries_size = reader.read_u32::<LittleEndian>()?;
        let _entries_hash = reader.read_u32::<LittleEndian>()?;
        let entry_count = entries_size / 18;

        let mut entries = BTreeMap::new();
        for _ in 0..entry_count {
            let mut key = [0u8; EKey::BUCKET_FOLD_LEN];
            reader.read_exact(&mut key)?;

            // The packed location is one high byte plus a big-endian
            // word: archive number in the top ten bits, offset in the
            // bottom thirty.
            let high = reader.read_u8()?;
            let low = reader.read_u32::<BigEndian>()?;
            let archive = (u16::from(high) << 2) | (low >> 30) as u16;
            let offset = u64::from(low & 0x3FFF_FFFF);

            let size = reader.read_u32::<LittleEndian>()?;

            entries.insert(
                key,
                CascLocation {
                    archive,
                    offset,
                    size,
                },
            );
        }

        debug!("parsed local index bucket {bucket:02x}: {} entries", entries.len());
        Ok(Self { entries })
    }
}

/// A locally installed game's read-only storage.
#[derive(Debug)]
pub struct LocalCasc {
    base: PathBuf,
    /// Lazily opened bucket indices; `None` records a missing file.
    indices: Mutex<HashMap<u8, Option<Arc<CascIndex>>>>,
}

impl LocalCasc {
    /// Open local storage rooted at the game's base directory.
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            indices: Mutex::new(HashMap::new()),
        }
    }

    /// The game base directory.
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Path of an archive file.
    pub fn archive_path(&self, archive: u16) -> PathBuf {
        self.base
            .join("Data")
            .join("data")
            .join(format!("data.{archive:03}"))
    }

    /// Path of a locally installed configuration file.
    pub fn config_path(&self, hex: &str) -> PathBuf {
        let mut path = self.base.join("Data").join("config");
        if hex.len() >= 4 {
            path.push(&hex[..2]);
            path.push(&hex[2..4]);
        }
        path.push(hex);
        path
    }

    /// Path of a fetched index stored alongside the installation.
    pub fn index_path(&self, hex: &str) -> PathBuf {
        self.base
            .join("Data")
            .join("indices")
            .join(format!("{hex}.index"))
    }

    /// Look up an encoding key in the bucket index it hashes to.
    pub fn lookup(&self, ekey: &EKey) -> Option<(PathBuf, CascLocation)> {
        let bucket = ekey.bucket();
        let index = self.bucket_index(bucket)?;
        let location = *index.entries.get(&ekey.truncated())?;
        Some((self.archive_path(location.archive), location))
    }

    fn bucket_index(&self, bucket: u8) -> Option<Arc<CascIndex>> {
        let mut indices = self.indices.lock();
        indices
            .entry(bucket)
            .or_insert_with(|| {
                let path = self
                    .base
                    .join("Data")
                    .join("data")
                    .join(format!("{bucket:02x}.idx"));
                match File::open(&path) {
                    Ok(file) => match CascIndex::parse(&mut BufReader::new(file)) {
                        Ok(index) => Some(Arc::new(index)),
                        Err(e) => {
                            tracing::warn!("unreadable local index {path:?}: {e}");
                            None
                        }
                    },
                    Err(_) => None,
                }
            })
            .clone()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Serialise a bucket index in the standard 9/5/4 layout.
    pub fn build_idx(entries: &[([u8; 9], CascLocation)]) -> Vec<u8> {
        let mut data = Vec::new();
        // Header: size covers version through segment_bits plus the
        // (empty) block table.
        data.extend_from_slice(&8u32.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes()); // header hash, unchecked
        data.extend_from_slice(&7u16.to_le_bytes()); // version
        data.push(0); // bucket
        data.push(0); // unused
        data.push(4); // length bytes
        data.push(5); // location bytes
        data.push(9); // key bytes
        data.push(30); // segment bits

        while data.len() % 16 != 0 {
            data.push(0);
        }

        data.extend_from_slice(&(entries.len() as u32 * 18).to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes()); // entries hash, unchecked
        for (key, location) in entries {
            data.extend_from_slice(key);
            data.push((location.archive >> 2) as u8);
            let low =
                (u32::from(location.archive & 0x3) << 30) | (location.offset as u32 & 0x3FFF_FFFF);
            data.extend_from_slice(&low.to_be_bytes());
            data.extend_from_slice(&location.size.to_le_bytes());
        }
        data
    }

    /// Lay a minimal local installation on disk: one bucket index and
    /// one archive file.
    pub fn install_blob(base: &Path, ekey: &EKey, archive: u16, blob: &[u8], lead_in: &[u8]) {
        let data_dir = base.join("Data").join("data");
        std::fs::create_dir_all(&data_dir).unwrap();

        let location = CascLocation {
            archive,
            offset: lead_in.len() as u64,
            size: blob.len() as u32,
        };
        let idx = build_idx(&[(ekey.truncated(), location)]);
        std::fs::write(data_dir.join(format!("{:02x}.idx", ekey.bucket())), idx).unwrap();

        let mut archive_bytes = lead_in.to_vec();
        archive_bytes.extend_from_slice(blob);
        std::fs::write(data_dir.join(format!("data.{archive:03}")), archive_bytes).unwrap();
    }
}
