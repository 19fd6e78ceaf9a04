//! Archive index files: ordered, block-paged lookup tables that locate
//! encoding-keyed blobs inside archives.
//!
//! An index is a run of fixed-size data blocks, a table of contents
//! replicating each block's last key, truncated per-block MD5s, and a
//! self-checksummed footer. Lookup binary-searches the TOC for the
//! candidate block, then the block itself at the entry stride; neither
//! step touches the rest of the file, which stays memory-mapped.

use memmap2::Mmap;
use std::fs::File;
use std::ops::Range;
use std::path::Path;
use tracing::debug;

use crate::ioutils::{lower_bound, lower_bound_by, read_uint_be};
use crate::{Error, Result};

/// Size of the fixed-form footer in bytes.
pub const FOOTER_LEN: usize = 28;

/// Width of the truncated MD5s in the TOC and footer.
pub const INDEX_HASH_BYTES: usize = 8;

/// Index flavor, derived from the footer's `offset_bytes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    /// No offsets: each entry is a standalone file spanning a whole blob.
    File,
    /// Offset field packs an archive number and an offset.
    Group,
    /// Plain offsets into the archive the index belongs to.
    Archive,
}

/// Parsed and validated index footer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexFooter {
    /// Truncated MD5 of the TOC region (keys then block hashes).
    pub toc_hash: [u8; INDEX_HASH_BYTES],
    /// Format revision, always 1.
    pub format_revision: u8,
    pub flags0: u8,
    pub flags1: u8,
    /// Data block size in KiB.
    pub block_size_kb: u8,
    /// Width of the per-entry offset field; selects the flavor.
    pub offset_bytes: u8,
    /// Width of the per-entry size field.
    pub size_bytes: u8,
    /// Width of the per-entry key field.
    pub key_bytes: u8,
    /// Width of the truncated hashes, always 8 in this revision.
    pub hash_bytes: u8,
    /// Total number of entries in the index.
    pub num_elements: u32,
    /// Truncated MD5 of the footer's 20 leading bytes.
    pub footer_hash: [u8; INDEX_HASH_BYTES],
}

impl IndexFooter {
    /// Parse and self-validate a footer.
    pub fn parse(bytes: &[u8; FOOTER_LEN]) -> Result<Self> {
        let footer = Self {
            toc_hash: bytes[0..8].try_into().unwrap(),
            format_revision: bytes[8],
            flags0: bytes[9],
            flags1: bytes[10],
            block_size_kb: bytes[11],
            offset_bytes: bytes[12],
            size_bytes: bytes[13],
            key_bytes: bytes[14],
            hash_bytes: bytes[15],
            num_elements: u32::from_le_bytes(bytes[16..20].try_into().unwrap()),
            footer_hash: bytes[20..28].try_into().unwrap(),
        };

        if footer.format_revision != 1 {
            return Err(Error::UnsupportedVersion {
                format: "index footer",
                version: footer.format_revision.into(),
            });
        }
        if footer.hash_bytes as usize != INDEX_HASH_BYTES {
            return Err(Error::InvalidLayout {
                format: "index footer",
                reason: format!("hash_bytes {}, expected 8", footer.hash_bytes),
            });
        }
        if footer.block_size_kb == 0
            || footer.key_bytes == 0
            || footer.key_bytes > 16
            || footer.size_bytes == 0
            || footer.size_bytes > 8
            || footer.offset_bytes > 8
        {
            return Err(Error::InvalidLayout {
                format: "index footer",
                reason: format!(
                    "field widths key={} size={} offset={} block={}KiB",
                    footer.key_bytes,
                    footer.size_bytes,
                    footer.offset_bytes,
                    footer.block_size_kb
                ),
            });
        }

        let expected = &md5::compute(&bytes[..20]).0[..INDEX_HASH_BYTES];
        if expected != footer.footer_hash {
            return Err(Error::ChecksumMismatch {
                what: "index footer",
                expected: hex::encode(footer.footer_hash),
                actual: hex::encode(expected),
            });
        }

        Ok(footer)
    }

    /// Serialise, recomputing the footer self-hash.
    pub fn to_bytes(&self) -> [u8; FOOTER_LEN] {
        let mut out = [0u8; FOOTER_LEN];
        out[0..8].copy_from_slice(&self.toc_hash);
        out[8] = self.format_revision;
        out[9] = self.flags0;
        out[10] = self.flags1;
        out[11] = self.block_size_kb;
        out[12] = self.offset_bytes;
        out[13] = self.size_bytes;
        out[14] = self.key_bytes;
        out[15] = self.hash_bytes;
        out[16..20].copy_from_slice(&self.num_elements.to_le_bytes());
        let footer_hash = md5::compute(&out[..20]).0;
        out[20..28].copy_from_slice(&footer_hash[..INDEX_HASH_BYTES]);
        out
    }

    /// The flavor this footer declares.
    pub fn kind(&self) -> IndexKind {
        match self.offset_bytes {
            0 => IndexKind::File,
            6 => IndexKind::Group,
            _ => IndexKind::Archive,
        }
    }

    /// Data block size in bytes.
    pub fn block_size(&self) -> usize {
        usize::from(self.block_size_kb) << 10
    }

    /// Bytes per entry.
    pub fn entry_stride(&self) -> usize {
        usize::from(self.key_bytes) + usize::from(self.size_bytes) + usize::from(self.offset_bytes)
    }
}

/// Where an entry's bytes live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexLocation {
    /// Offset inside the archive; 0 for file-index entries.
    pub offset: u64,
    /// Encoded size of the blob.
    pub size: u64,
    /// Archive number for group-index entries; `None` when the archive is
    /// implied by the index itself.
    pub archive_index: Option<u16>,
}

/// One entry yielded by [`IndexFile::iter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    /// The entry key (`key_bytes` long).
    pub key: Vec<u8>,
    /// Decoded location fields.
    pub location: IndexLocation,
}

/// A memory-mapped, read-only archive index.
#[derive(Debug)]
pub struct IndexFile {
    map: Mmap,
    footer: IndexFooter,
    num_blocks: usize,
    toc_keys: Range<usize>,
}

impl IndexFile {
    /// Open and validate an index file.
    ///
    /// The footer self-hash and the TOC hash are verified here; block
    /// hashes are the writer's concern and are not rechecked on every
    /// open.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        // Read-only map; the file is content-addressed and never mutated.
        let map = unsafe { Mmap::map(&file)? };

        if map.len() < FOOTER_LEN {
            return Err(Error::Truncated {
                format: "index",
                expected: FOOTER_LEN,
                actual: map.len(),
            });
        }
        let footer_bytes: [u8; FOOTER_LEN] =
            map[map.len() - FOOTER_LEN..].try_into().unwrap();
        let footer = IndexFooter::parse(&footer_bytes)?;

        let per_block = footer.block_size()
            + usize::from(footer.key_bytes)
            + usize::from(footer.hash_bytes);
        let body = map.len() - FOOTER_LEN;
        if body % per_block != 0 {
            return Err(Error::InvalidLayout {
                format: "index",
                reason: format!("{body} body bytes is not a whole number of blocks"),
            });
        }
        let num_blocks = body / per_block;

        let toc_start = num_blocks * footer.block_size();
        let toc_keys = toc_start..toc_start + num_blocks * usize::from(footer.key_bytes);
        let toc_end = toc_keys.end + num_blocks * usize::from(footer.hash_bytes);

        let toc_digest = &md5::compute(&map[toc_start..toc_end]).0[..INDEX_HASH_BYTES];
        if toc_digest != footer.toc_hash {
            return Err(Error::ChecksumMismatch {
                what: "index TOC",
                expected: hex::encode(footer.toc_hash),
                actual: hex::encode(toc_digest),
            });
        }

        debug!(
            "opened index {:?}: {} blocks, {} elements, kind {:?}",
            path,
            num_blocks,
            footer.num_elements,
            footer.kind()
        );

        Ok(Self {
            map,
            footer,
            num_blocks,
            toc_keys,
        })
    }

    /// The validated footer.
    pub fn footer(&self) -> &IndexFooter {
        &self.footer
    }

    /// Look up an entry by key. `key` must be at least `key_bytes` long;
    /// only the leading `key_bytes` participate.
    pub fn lookup(&self, key: &[u8]) -> Option<IndexLocation> {
        if self.num_blocks == 0 {
            return None;
        }
        let key_bytes = usize::from(self.footer.key_bytes);
        let key = &key[..key_bytes];

        // TOC keys replicate each block's last key: the first TOC key not
        // below the target names the only block that can hold it.
        let toc = &self.map[self.toc_keys.clone()];
        let block = lower_bound(toc, key_bytes, key);
        if block == self.num_blocks {
            return None;
        }

        let stride = self.footer.entry_stride();
        let size_bytes = usize::from(self.footer.size_bytes);
        let block_data = self.block(block);

        // Zero padding at the block tail has a zero size field; treating
        // it as greater than any key keeps the block totally ordered.
        let pos = lower_bound_by(block_data, stride, |record| {
            if read_uint_be(&record[key_bytes..], size_bytes) == 0 {
                std::cmp::Ordering::Greater
            } else {
                record[..key_bytes].cmp(key)
            }
        });

        let start = pos * stride;
        if start + stride > block_data.len() {
            return None;
        }
        let record = &block_data[start..start + stride];
        if read_uint_be(&record[key_bytes..], size_bytes) == 0 || &record[..key_bytes] != key {
            return None;
        }

        Some(self.decode_location(record))
    }

    /// Iterate every non-padding entry in file order.
    pub fn iter(&self) -> Entries<'_> {
        Entries {
            index: self,
            block: 0,
            pos: 0,
        }
    }

    fn block(&self, block: usize) -> &[u8] {
        let size = self.footer.block_size();
        &self.map[block * size..(block + 1) * size]
    }

    fn decode_location(&self, record: &[u8]) -> IndexLocation {
        let key_bytes = usize::from(self.footer.key_bytes);
        let size_bytes = usize::from(self.footer.size_bytes);
        let size = read_uint_be(&record[key_bytes..], size_bytes);
        let tail = &record[key_bytes + size_bytes..];

        match self.footer.kind() {
            IndexKind::File => IndexLocation {
                offset: 0,
                size,
                archive_index: None,
            },
            IndexKind::Group => IndexLocation {
                offset: read_uint_be(&tail[2..], 4),
                size,
                archive_index: Some(read_uint_be(tail, 2) as u16),
            },
            IndexKind::Archive => IndexLocation {
                offset: read_uint_be(tail, usize::from(self.footer.offset_bytes)),
                size,
                archive_index: None,
            },
        }
    }
}

/// Restartable forward iterator over an index's entries.
pub struct Entries<'a> {
    index: &'a IndexFile,
    block: usize,
    pos: usize,
}

impl Iterator for Entries<'_> {
    type Item = IndexEntry;

    fn next(&mut self) -> Option<Self::Item> {
        let footer = &self.index.footer;
        let stride = footer.entry_stride();
        let key_bytes = usize::from(footer.key_bytes);
        let size_bytes = usize::from(footer.size_bytes);
        let per_block = footer.block_size() / stride;

        while self.block < self.index.num_blocks {
            if self.pos < per_block {
                let block = self.index.block(self.block);
                let start = self.pos * stride;
                let record = &block[start..start + stride];

                if read_uint_be(&record[key_bytes..], size_bytes) != 0 {
                    self.pos += 1;
                    return Some(IndexEntry {
                        key: record[..key_bytes].to_vec(),
                        location: self.index.decode_location(record),
                    });
                }
                // First padded entry ends the block.
            }
            self.block += 1;
            self.pos = 0;
        }

        None
    }
}
