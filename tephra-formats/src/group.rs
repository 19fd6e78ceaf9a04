//! Group-index builder: merges every per-archive index of a build into a
//! single searchable index keyed by encoding key.
//!
//! The output is a standard index file of the group flavor
//! (`offset_bytes == 6`): each entry carries the archive number it was
//! found in plus the offset inside that archive. Its name is the
//! lowercase hex MD5 of its own footer, which makes the build
//! verifiable against the hash a CDN configuration advertises.

use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::thread;
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::index::{FOOTER_LEN, INDEX_HASH_BYTES, IndexFile, IndexFooter};
use crate::{Error, Result};

/// Footer parameters every emitted group index uses.
const GROUP_BLOCK_SIZE_KB: u8 = 4;
const GROUP_KEY_BYTES: u8 = 16;
const GROUP_SIZE_BYTES: u8 = 4;
const GROUP_OFFSET_BYTES: u8 = 6;

/// A group index emitted into the cache.
#[derive(Debug, Clone)]
pub struct BuiltGroupIndex {
    /// Lowercase hex MD5 of the footer; the index's content-addressed
    /// name.
    pub name: String,
    /// Where the index was written (`<out_dir>/<name>.index`).
    pub path: PathBuf,
    /// Total number of merged entries.
    pub num_elements: u32,
}

/// Merge per-archive indices into a group index and write it atomically
/// into `out_dir`.
///
/// `indices` must be ordered as the CDN configuration's `archives` list;
/// an entry's position is its archive number. If `expected_name` is
/// given and the built index hashes differently, the build fails with a
/// checksum mismatch.
pub fn build_group_index(
    indices: &[IndexFile],
    expected_name: Option<&str>,
    out_dir: &Path,
) -> Result<BuiltGroupIndex> {
    for index in indices {
        if index.footer().key_bytes != GROUP_KEY_BYTES {
            return Err(Error::InvalidLayout {
                format: "group-index input",
                reason: format!(
                    "archive index key width {}, expected 16",
                    index.footer().key_bytes
                ),
            });
        }
    }

    // Fan parsing out across archives; workers push their private
    // vectors into the shared accumulator as they finish.
    let merged: Mutex<Vec<(u16, Vec<Vec<u8>>)>> = Mutex::new(Vec::with_capacity(indices.len()));
    thread::scope(|scope| {
        for (archive, index) in indices.iter().enumerate() {
            let merged = &merged;
            scope.spawn(move || {
                let archive = archive as u16;
                let records: Vec<Vec<u8>> = index
                    .iter()
                    .map(|entry| {
                        let mut record = Vec::with_capacity(26);
                        record.extend_from_slice(&entry.key);
                        record.extend_from_slice(&(entry.location.size as u32).to_be_bytes());
                        record.extend_from_slice(&archive.to_be_bytes());
                        record.extend_from_slice(&(entry.location.offset as u32).to_be_bytes());
                        record
                    })
                    .collect();
                merged.lock().push((archive, records));
            });
        }
    });

    let mut per_archive = merged.into_inner();
    // Threads finish in any order; restore archive order before the
    // stable key sort so equal keys keep a deterministic tiebreak.
    per_archive.sort_by_key(|(archive, _)| *archive);
    let mut records: Vec<Vec<u8>> = per_archive
        .into_iter()
        .flat_map(|(_, records)| records)
        .collect();
    records.sort_by(|a, b| a[..16].cmp(&b[..16]));

    debug!(
        "merged {} entries from {} archive indices",
        records.len(),
        indices.len()
    );

    let (bytes, name) = assemble_index(
        &records,
        GROUP_KEY_BYTES,
        GROUP_SIZE_BYTES,
        GROUP_OFFSET_BYTES,
        GROUP_BLOCK_SIZE_KB,
    );

    if let Some(expected) = expected_name {
        if !expected.eq_ignore_ascii_case(&name) {
            return Err(Error::GroupChecksumMismatch {
                expected: expected.to_ascii_lowercase(),
                actual: name,
            });
        }
    }

    std::fs::create_dir_all(out_dir)?;
    let path = out_dir.join(format!("{name}.index"));
    let mut tmp = NamedTempFile::new_in(out_dir)?;
    std::io::Write::write_all(&mut tmp, &bytes)?;
    tmp.persist(&path).map_err(|e| Error::Io(e.error))?;

    info!("built group index {name} with {} entries", records.len());
    Ok(BuiltGroupIndex {
        name,
        path,
        num_elements: records.len() as u32,
    })
}

/// Serialise sorted fixed-stride records into a complete index file:
/// zero-padded data blocks, TOC keys, truncated block MD5s, and the
/// self-checksummed footer. Returns the file bytes and the index name
/// (lowercase hex MD5 of the footer).
pub fn assemble_index(
    records: &[Vec<u8>],
    key_bytes: u8,
    size_bytes: u8,
    offset_bytes: u8,
    block_size_kb: u8,
) -> (Vec<u8>, String) {
    let block_size = usize::from(block_size_kb) << 10;
    let stride = usize::from(key_bytes) + usize::from(size_bytes) + usize::from(offset_bytes);
    let per_block = block_size / stride;

    let mut bytes = Vec::new();
    let mut toc_keys = Vec::new();
    let mut block_hashes = Vec::new();

    for chunk in records.chunks(per_block) {
        let block_start = bytes.len();
        for record in chunk {
            debug_assert_eq!(record.len(), stride);
            bytes.extend_from_slice(record);
        }
        bytes.resize(block_start + block_size, 0);

        let last = &chunk[chunk.len() - 1];
        toc_keys.extend_from_slice(&last[..usize::from(key_bytes)]);
        block_hashes
            .extend_from_slice(&md5::compute(&bytes[block_start..]).0[..INDEX_HASH_BYTES]);
    }

    let toc_start = bytes.len();
    bytes.extend_from_slice(&toc_keys);
    bytes.extend_from_slice(&block_hashes);
    let toc_hash: [u8; INDEX_HASH_BYTES] = md5::compute(&bytes[toc_start..]).0
        [..INDEX_HASH_BYTES]
        .try_into()
        .unwrap();

    let footer = IndexFooter {
        toc_hash,
        format_revision: 1,
        flags0: 0,
        flags1: 0,
        block_size_kb,
        offset_bytes,
        size_bytes,
        key_bytes,
        hash_bytes: INDEX_HASH_BYTES as u8,
        num_elements: records.len() as u32,
        footer_hash: [0; INDEX_HASH_BYTES],
    };
    let footer_bytes: [u8; FOOTER_LEN] = footer.to_bytes();
    let name = hex::encode(md5::compute(footer_bytes).0);
    bytes.extend_from_slice(&footer_bytes);

    (bytes, name)
}

/// Synthetic-index construction for tests and fixtures.
#[doc(hidden)]
pub mod test_support {
    use super::assemble_index;
    use std::path::Path;

    /// Encode `(key, size, offset)` entries at the given field widths and
    /// write a complete index file. Entries must be pre-sorted by key.
    /// For the group flavor pass
    /// `offset = (archive_number << 32) | archive_offset`.
    pub fn write_index(
        path: &Path,
        entries: &[(Vec<u8>, u64, u64)],
        block_size_kb: u8,
        key_bytes: u8,
        size_bytes: u8,
        offset_bytes: u8,
    ) -> String {
        let records: Vec<Vec<u8>> = entries
            .iter()
            .map(|(key, size, offset)| {
                let mut record = Vec::new();
                record.extend_from_slice(&key[..usize::from(key_bytes)]);
                record.extend_from_slice(
                    &size.to_be_bytes()[8 - usize::from(size_bytes)..],
                );
                if offset_bytes > 0 {
                    record.extend_from_slice(
                        &offset.to_be_bytes()[8 - usize::from(offset_bytes)..],
                    );
                }
                record
            })
            .collect();

        let (bytes, name) =
            assemble_index(&records, key_bytes, size_bytes, offset_bytes, block_size_kb);
        std::fs::write(path, bytes).unwrap();
        name
    }
}
