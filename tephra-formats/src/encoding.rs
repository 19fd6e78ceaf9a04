//! Encoding table: content key → encoding keys, encoding key → ESpec.
//!
//! The table is a paged binary blob searched in two levels: a sorted page
//! directory locates the page that could hold the key, then the page is
//! scanned. Pages stay in their on-disk form; this type is an immutable
//! view over the decoded blob and never materialises the entries.
//!
//! All multi-byte header and entry fields are big-endian.

use byteorder::{BigEndian, ReadBytesExt};
use parking_lot::Mutex;
use std::io::{Cursor, Read};
use std::ops::Range;
use std::sync::Arc;
use tracing::debug;

use crate::ioutils::{lower_bound_by, parse_cstr_table, read_uint_be};
use crate::{CKey, EKey, Error, KEY_LENGTH, Result};

/// Magic bytes of the encoding table.
const ENCODING_MAGIC: [u8; 2] = *b"EN";

/// Fixed header size in bytes.
const HEADER_LEN: usize = 22;

/// Parsed encoding table header.
#[derive(Debug, Clone)]
pub struct EncodingHeader {
    /// Format version, always 1.
    pub version: u8,
    /// Content key width; this parser requires 16.
    pub ckey_size: u8,
    /// Encoding key width; this parser requires 16.
    pub ekey_size: u8,
    /// Size of each cKey page in KiB.
    pub ckey_page_size_kb: u16,
    /// Size of each eSpec page in KiB.
    pub espec_page_size_kb: u16,
    /// Number of cKey pages.
    pub ckey_page_count: u32,
    /// Number of eSpec pages.
    pub espec_page_count: u32,
    /// Size of the ESpec string table in bytes.
    pub espec_block_size: u32,
}

/// One entry of the cKey table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodingEntry {
    /// The content key.
    pub ckey: CKey,
    /// Known encodings of the content, never empty.
    pub ekeys: Vec<EKey>,
    /// Size of the decoded file.
    pub decoded_size: u64,
}

/// One entry of the eSpec table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EspecEntry {
    /// The encoding key.
    pub ekey: EKey,
    /// Compression-recipe literal.
    pub espec: String,
    /// Size of the encoded blob.
    pub encoded_size: u64,
}

/// Immutable view over a decoded encoding table.
#[derive(Debug)]
pub struct EncodingFile {
    data: Vec<u8>,
    header: EncodingHeader,
    espec_block: Range<usize>,
    ckey_directory: Range<usize>,
    ckey_pages: Range<usize>,
    espec_directory: Range<usize>,
    espec_pages: Range<usize>,
    /// Lazily parsed ESpec string table. The mutex serialises the single
    /// parse; afterwards callers clone the `Arc`.
    espec_strings: Mutex<Option<Arc<Vec<String>>>>,
}

impl EncodingFile {
    /// Take ownership of a decoded encoding blob and index its regions.
    pub fn parse(data: Vec<u8>) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(Error::Truncated {
                format: "encoding",
                expected: HEADER_LEN,
                actual: data.len(),
            });
        }

        let mut cursor = Cursor::new(&data);
        let mut magic = [0u8; 2];
        cursor.read_exact(&mut magic)?;
        if magic != ENCODING_MAGIC {
            return Err(Error::BadMagic {
                format: "encoding",
                actual: magic.to_vec(),
            });
        }

        let version = cursor.read_u8()?;
        if version != 1 {
            return Err(Error::UnsupportedVersion {
                format: "encoding",
                version: version.into(),
            });
        }

        let ckey_size = cursor.read_u8()?;
        let ekey_size = cursor.read_u8()?;
        if ckey_size as usize != KEY_LENGTH || ekey_size as usize != KEY_LENGTH {
            return Err(Error::InvalidLayout {
                format: "encoding",
                reason: format!("key sizes {ckey_size}/{ekey_size}, expected 16/16"),
            });
        }

        let header = EncodingHeader {
            version,
            ckey_size,
            ekey_size,
            ckey_page_size_kb: cursor.read_u16::<BigEndian>()?,
            espec_page_size_kb: cursor.read_u16::<BigEndian>()?,
            ckey_page_count: cursor.read_u32::<BigEndian>()?,
            espec_page_count: cursor.read_u32::<BigEndian>()?,
            espec_block_size: {
                let _reserved = cursor.read_u8()?;
                cursor.read_u32::<BigEndian>()?
            },
        };

        debug!(
            "encoding header: {} cKey pages of {} KiB, {} eSpec pages of {} KiB, {} byte string table",
            header.ckey_page_count,
            header.ckey_page_size_kb,
            header.espec_page_count,
            header.espec_page_size_kb,
            header.espec_block_size
        );

        // Directory records pair a first-key with a page MD5.
        let ckey_dir_stride = KEY_LENGTH + KEY_LENGTH;
        let espec_dir_stride = KEY_LENGTH + KEY_LENGTH;

        let espec_block_start = HEADER_LEN;
        let espec_block_end = espec_block_start + header.espec_block_size as usize;
        let ckey_dir_end =
            espec_block_end + header.ckey_page_count as usize * ckey_dir_stride;
        let ckey_pages_end = ckey_dir_end
            + header.ckey_page_count as usize * header.ckey_page_size_kb as usize * 1024;
        let espec_dir_end =
            ckey_pages_end + header.espec_page_count as usize * espec_dir_stride;
        let espec_pages_end = espec_dir_end
            + header.espec_page_count as usize * header.espec_page_size_kb as usize * 1024;

        if data.len() < espec_pages_end {
            return Err(Error::Truncated {
                format: "encoding",
                expected: espec_pages_end,
                actual: data.len(),
            });
        }

        Ok(Self {
            header,
            espec_block: espec_block_start..espec_block_end,
            ckey_directory: espec_block_end..ckey_dir_end,
            ckey_pages: ckey_dir_end..ckey_pages_end,
            espec_directory: ckey_pages_end..espec_dir_end,
            espec_pages: espec_dir_end..espec_pages_end,
            espec_strings: Mutex::new(None),
            data,
        })
    }

    /// The parsed header.
    pub fn header(&self) -> &EncodingHeader {
        &self.header
    }

    /// Look up the encoding keys and decoded size for a content key.
    pub fn find_by_ckey(&self, target: &CKey) -> Option<EncodingEntry> {
        let page = self.locate_page(
            &self.data[self.ckey_directory.clone()],
            self.ckey_pages.clone(),
            self.header.ckey_page_size_kb,
            self.header.ckey_page_count,
            target.as_bytes(),
        )?;

        // Entries are variable-length, so the page is walked linearly.
        let mut offset = 0usize;
        while offset + 1 + 5 + KEY_LENGTH <= page.len() {
            let key_count = page[offset] as usize;
            if key_count == 0 {
                // Zero padding marks the end of the page's entries.
                break;
            }
            let decoded_size = read_uint_be(&page[offset + 1..], 5);
            let ckey_bytes = &page[offset + 6..offset + 6 + KEY_LENGTH];
            let entry_len = 1 + 5 + KEY_LENGTH + key_count * KEY_LENGTH;
            if offset + entry_len > page.len() {
                break;
            }

            match ckey_bytes.cmp(target.as_bytes()) {
                std::cmp::Ordering::Less => {}
                std::cmp::Ordering::Equal => {
                    let ekeys = page[offset + 6 + KEY_LENGTH..offset + entry_len]
                        .chunks_exact(KEY_LENGTH)
                        .filter_map(EKey::from_slice)
                        .collect();
                    return Some(EncodingEntry {
                        ckey: *target,
                        ekeys,
                        decoded_size,
                    });
                }
                // Entries are sorted; past the target means a miss.
                std::cmp::Ordering::Greater => return None,
            }

            offset += entry_len;
        }

        None
    }

    /// Look up the compression recipe and encoded size for an encoding
    /// key.
    pub fn find_espec(&self, target: &EKey) -> Option<EspecEntry> {
        let page = self.locate_page(
            &self.data[self.espec_directory.clone()],
            self.espec_pages.clone(),
            self.header.espec_page_size_kb,
            self.header.espec_page_count,
            target.as_bytes(),
        )?;

        let strings = self.espec_strings();
        let stride = KEY_LENGTH + 4 + 5;
        let mut offset = 0usize;
        while offset + stride <= page.len() {
            let ekey_bytes = &page[offset..offset + KEY_LENGTH];
            if ekey_bytes.iter().all(|&b| b == 0) {
                break;
            }

            match ekey_bytes.cmp(target.as_bytes()) {
                std::cmp::Ordering::Less => {}
                std::cmp::Ordering::Equal => {
                    let espec_index =
                        read_uint_be(&page[offset + KEY_LENGTH..], 4) as usize;
                    let encoded_size =
                        read_uint_be(&page[offset + KEY_LENGTH + 4..], 5);
                    return Some(EspecEntry {
                        ekey: *target,
                        espec: strings.get(espec_index).cloned()?,
                        encoded_size,
                    });
                }
                std::cmp::Ordering::Greater => return None,
            }

            offset += stride;
        }

        None
    }

    /// The ESpec string table, parsed on first use.
    pub fn espec_strings(&self) -> Arc<Vec<String>> {
        let mut guard = self.espec_strings.lock();
        match &*guard {
            Some(strings) => Arc::clone(strings),
            None => {
                let strings =
                    Arc::new(parse_cstr_table(&self.data[self.espec_block.clone()]));
                debug!("parsed {} ESpec strings", strings.len());
                *guard = Some(Arc::clone(&strings));
                strings
            }
        }
    }

    /// Binary-search a page directory for the page that could contain
    /// `target`: the one with the greatest first-key not above it.
    fn locate_page(
        &self,
        directory: &[u8],
        pages: Range<usize>,
        page_size_kb: u16,
        page_count: u32,
        target: &[u8],
    ) -> Option<&[u8]> {
        if page_count == 0 {
            return None;
        }

        let stride = KEY_LENGTH + KEY_LENGTH;
        // Count of directory records with first_key <= target.
        let upper = lower_bound_by(directory, stride, |record| {
            if record[..KEY_LENGTH] <= *target {
                std::cmp::Ordering::Less
            } else {
                std::cmp::Ordering::Greater
            }
        });
        if upper == 0 {
            return None;
        }

        let page_size = page_size_kb as usize * 1024;
        let start = pages.start + (upper - 1) * page_size;
        Some(&self.data[start..start + page_size])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a one-page-per-table encoding blob.
    pub(crate) fn synthetic_encoding(
        entries: &[(CKey, Vec<EKey>, u64)],
        especs: &[(EKey, u32, u64)],
        espec_strings: &[&str],
    ) -> Vec<u8> {
        let page_size_kb = 1u16;
        let mut espec_block = Vec::new();
        for s in espec_strings {
            espec_block.extend_from_slice(s.as_bytes());
            espec_block.push(0);
        }

        let mut data = Vec::new();
        data.extend_from_slice(b"EN");
        data.push(1); // version
        data.push(16);
        data.push(16);
        data.extend_from_slice(&page_size_kb.to_be_bytes());
        data.extend_from_slice(&page_size_kb.to_be_bytes());
        data.extend_from_slice(&1u32.to_be_bytes()); // cKey pages
        data.extend_from_slice(&1u32.to_be_bytes()); // eSpec pages
        data.push(0);
        data.extend_from_slice(&(espec_block.len() as u32).to_be_bytes());
        data.extend_from_slice(&espec_block);

        let mut ckey_page = Vec::new();
        for (ckey, ekeys, size) in entries {
            ckey_page.push(ekeys.len() as u8);
            ckey_page.extend_from_slice(&size.to_be_bytes()[3..]);
            ckey_page.extend_from_slice(ckey.as_bytes());
            for ekey in ekeys {
                ckey_page.extend_from_slice(ekey.as_bytes());
            }
        }
        ckey_page.resize(page_size_kb as usize * 1024, 0);

        let mut espec_page = Vec::new();
        for (ekey, index, size) in especs {
            espec_page.extend_from_slice(ekey.as_bytes());
            espec_page.extend_from_slice(&index.to_be_bytes());
            espec_page.extend_from_slice(&size.to_be_bytes()[3..]);
        }
        espec_page.resize(page_size_kb as usize * 1024, 0);

        // cKey directory: first key + page MD5.
        data.extend_from_slice(entries[0].0.as_bytes());
        data.extend_from_slice(&md5::compute(&ckey_page).0);
        data.extend_from_slice(&ckey_page);

        data.extend_from_slice(especs[0].0.as_bytes());
        data.extend_from_slice(&md5::compute(&espec_page).0);
        data.extend_from_slice(&espec_page);

        data
    }

    fn key_seq(start: u8) -> [u8; 16] {
        let mut bytes = [0u8; 16];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = start.wrapping_add(i as u8);
        }
        bytes
    }

    #[test]
    fn find_by_ckey_hit_and_miss() {
        let ckey = CKey::new(key_seq(0x00));
        let ekey = EKey::new(key_seq(0x10));
        let data = synthetic_encoding(
            &[(ckey, vec![ekey], 42)],
            &[(ekey, 0, 40)],
            &["b:{16K*=z}"],
        );

        let encoding = EncodingFile::parse(data).unwrap();
        let entry = encoding.find_by_ckey(&ckey).unwrap();
        assert_eq!(entry.decoded_size, 42);
        assert_eq!(entry.ekeys, vec![ekey]);

        let missing = CKey::new([0xFF; 16]);
        assert!(encoding.find_by_ckey(&missing).is_none());
    }

    #[test]
    fn miss_below_first_page() {
        let ckey = CKey::new(key_seq(0x40));
        let ekey = EKey::new(key_seq(0x50));
        let data = synthetic_encoding(&[(ckey, vec![ekey], 1)], &[(ekey, 0, 1)], &["z"]);

        let encoding = EncodingFile::parse(data).unwrap();
        // Below every directory first-key: no candidate page at all.
        assert!(encoding.find_by_ckey(&CKey::new([0u8; 16])).is_none());
    }

    #[test]
    fn multi_ekey_entry() {
        let ckey = CKey::new(key_seq(0x00));
        let e1 = EKey::new(key_seq(0x10));
        let e2 = EKey::new(key_seq(0x30));
        let data = synthetic_encoding(
            &[(ckey, vec![e1, e2], 7)],
            &[(e1, 0, 5)],
            &["n"],
        );

        let encoding = EncodingFile::parse(data).unwrap();
        let entry = encoding.find_by_ckey(&ckey).unwrap();
        assert_eq!(entry.ekeys, vec![e1, e2]);
    }

    #[test]
    fn find_espec_resolves_string() {
        let ckey = CKey::new(key_seq(0x00));
        let ekey = EKey::new(key_seq(0x10));
        let data = synthetic_encoding(
            &[(ckey, vec![ekey], 42)],
            &[(ekey, 1, 40)],
            &["z", "b:{16K*=z}"],
        );

        let encoding = EncodingFile::parse(data).unwrap();
        let entry = encoding.find_espec(&ekey).unwrap();
        assert_eq!(entry.espec, "b:{16K*=z}");
        assert_eq!(entry.encoded_size, 40);

        assert!(encoding.find_espec(&EKey::new([0xEE; 16])).is_none());
    }

    #[test]
    fn espec_strings_parse_once() {
        let ckey = CKey::new(key_seq(0x00));
        let ekey = EKey::new(key_seq(0x10));
        let data =
            synthetic_encoding(&[(ckey, vec![ekey], 1)], &[(ekey, 0, 1)], &["z", "n"]);

        let encoding = EncodingFile::parse(data).unwrap();
        let first = encoding.espec_strings();
        let second = encoding.espec_strings();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(*first, vec!["z".to_string(), "n".to_string()]);
    }

    #[test]
    fn rejects_bad_magic_and_version() {
        let err = EncodingFile::parse(b"XX\x01".to_vec()).unwrap_err();
        assert!(matches!(err, Error::Truncated { .. }));

        let mut data = vec![0u8; 22];
        data[0] = b'X';
        data[1] = b'X';
        assert!(matches!(
            EncodingFile::parse(data),
            Err(Error::BadMagic { .. })
        ));

        let ckey = CKey::new(key_seq(0));
        let ekey = EKey::new(key_seq(0x10));
        let mut data =
            synthetic_encoding(&[(ckey, vec![ekey], 1)], &[(ekey, 0, 1)], &["z"]);
        data[2] = 9;
        assert!(matches!(
            EncodingFile::parse(data),
            Err(Error::UnsupportedVersion { .. })
        ));
    }
}
