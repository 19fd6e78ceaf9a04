//! Root manifest: maps game-assigned file IDs (and optional path hashes)
//! to content keys, respecting locale and content flags.
//!
//! The body is a sequence of pages. Each page shares one
//! (content flags, locale flags) pair and stores its file IDs as a
//! delta-plus-one coded ascending sequence. Pages that do not match the
//! configured locale, or that carry the low-violence flag, are dropped
//! wholesale at load time and never participate in lookups.

use byteorder::{LittleEndian, ReadBytesExt};
use modular_bitfield::{bitfield, prelude::*};
use std::collections::HashMap;
use std::io::{Cursor, ErrorKind, Read};
use std::ops::BitAnd;
use tracing::{debug, trace};

use crate::{CKey, Error, KEY_LENGTH, Result};

/// Modern root magic. Both byte orders appear in the wild.
const ROOT_MAGIC: [u8; 4] = *b"MFST";
const ROOT_MAGIC_SWAPPED: [u8; 4] = *b"TSFM";

/// Header sizes above this are actually a file count from the older
/// pre-counted header form.
const MAX_PLAUSIBLE_HEADER_SIZE: u32 = 1000;

/// Bitmask of locales a page applies to.
#[bitfield(bytes = 4)]
#[derive(PartialEq, Eq, Debug, Copy, Clone, Hash)]
#[repr(u32)]
pub struct LocaleFlags {
    #[skip]
    __: B1,
    pub en_us: bool, // 0x2
    pub ko_kr: bool, // 0x4
    #[skip]
    __: B1,
    pub fr_fr: bool, // 0x10
    pub de_de: bool, // 0x20
    pub zh_cn: bool, // 0x40
    pub es_es: bool, // 0x80

    pub zh_tw: bool, // 0x100
    pub en_gb: bool, // 0x200
    pub en_cn: bool, // 0x400
    pub en_tw: bool, // 0x800

    pub es_mx: bool, // 0x1000
    pub ru_ru: bool, // 0x2000
    pub pt_br: bool, // 0x4000
    pub it_it: bool, // 0x8000

    pub pt_pt: bool, // 0x10000
    #[skip]
    __: B15,
}

impl LocaleFlags {
    /// Union of every shipped game language.
    pub fn all_locales() -> Self {
        Self::from(0x1FFF6)
    }

    /// `true` if at least one locale bit is set.
    pub fn any(&self) -> bool {
        u32::from(*self) != 0
    }

    /// `true` if this mask shares a bit with `other`.
    pub fn overlaps(&self, other: Self) -> bool {
        (*self & other).any()
    }

    /// Parse a locale name like `enUS` or `deDE`.
    pub fn named(name: &str) -> Option<Self> {
        let flags = Self::new();
        Some(match name {
            "enUS" => flags.with_en_us(true),
            "koKR" => flags.with_ko_kr(true),
            "frFR" => flags.with_fr_fr(true),
            "deDE" => flags.with_de_de(true),
            "zhCN" => flags.with_zh_cn(true),
            "esES" => flags.with_es_es(true),
            "zhTW" => flags.with_zh_tw(true),
            "enGB" => flags.with_en_gb(true),
            "enCN" => flags.with_en_cn(true),
            "enTW" => flags.with_en_tw(true),
            "esMX" => flags.with_es_mx(true),
            "ruRU" => flags.with_ru_ru(true),
            "ptBR" => flags.with_pt_br(true),
            "itIT" => flags.with_it_it(true),
            "ptPT" => flags.with_pt_pt(true),
            _ => return None,
        })
    }
}

impl BitAnd for LocaleFlags {
    type Output = LocaleFlags;

    fn bitand(self, rhs: Self) -> Self::Output {
        Self::from(u32::from(self) & u32::from(rhs))
    }
}

/// Content flags on a root page.
#[bitfield(bytes = 4)]
#[derive(PartialEq, Eq, Debug, Copy, Clone, Hash)]
#[repr(u32)]
pub struct ContentFlags {
    #[skip]
    __: B3,
    pub load_on_windows: bool, // 0x8

    pub load_on_macos: bool, // 0x10
    #[skip]
    __: B2,
    pub low_violence: bool, // 0x80

    pub do_not_load: bool, // 0x100
    #[skip]
    __: B2,
    pub update_plugin: bool, // 0x800

    #[skip]
    __: B15,
    pub encrypted: bool, // 0x8000000

    pub no_names: bool,            // 0x10000000
    pub uncommon_resolution: bool, // 0x20000000
    pub bundle: bool,              // 0x40000000
    pub no_compression: bool,      // 0x80000000
}

/// One record of the root manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootRecord {
    /// Game-assigned file data ID.
    pub file_data_id: u32,
    /// Content key of the file's decoded bytes.
    pub content_key: CKey,
    /// Path hash, or 0 when the page carries no names.
    pub name_hash: u64,
    /// Flags of the page the record came from.
    pub content_flags: ContentFlags,
    pub locale_flags: LocaleFlags,
}

/// One kept page.
#[derive(Debug)]
struct RootPage {
    content_flags: ContentFlags,
    locale_flags: LocaleFlags,
    /// Strictly ascending.
    file_data_ids: Vec<u32>,
    content_keys: Vec<CKey>,
    name_hashes: Option<Vec<u64>>,
}

/// Parsed header of a modern root blob.
#[derive(Debug)]
struct RootHeader {
    legacy: bool,
    version: u32,
    total_file_count: u32,
    named_file_count: u32,
}

impl RootHeader {
    fn allow_unnamed(&self) -> bool {
        !self.legacy && self.total_file_count != self.named_file_count
    }
}

/// Parsed root manifest, filtered to one locale.
#[derive(Debug)]
pub struct RootFile {
    pages: Vec<RootPage>,
    /// Path hash → (page, index). Built eagerly at load time.
    name_map: HashMap<u64, (usize, usize)>,
}

impl RootFile {
    /// Parse a root blob, keeping only pages relevant to `locale`.
    pub fn parse(data: &[u8], locale: LocaleFlags) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        let header = Self::parse_header(&mut cursor, data.len())?;
        debug!(
            "root header: version={}, total={}, named={}, legacy={}",
            header.version, header.total_file_count, header.named_file_count, header.legacy
        );

        let mut pages = Vec::new();
        loop {
            match Self::parse_page(&mut cursor, &header, locale) {
                Ok(Some(page)) => pages.push(page),
                Ok(None) => {}
                Err(Error::Io(e)) if e.kind() == ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
            if cursor.position() as usize >= data.len() {
                break;
            }
        }

        let mut name_map = HashMap::new();
        for (page_index, page) in pages.iter().enumerate() {
            if let Some(hashes) = &page.name_hashes {
                for (record_index, &hash) in hashes.iter().enumerate() {
                    name_map.entry(hash).or_insert((page_index, record_index));
                }
            }
        }

        debug!(
            "root: kept {} pages, {} named records",
            pages.len(),
            name_map.len()
        );
        Ok(Self { pages, name_map })
    }

    fn parse_header(cursor: &mut Cursor<&[u8]>, blob_len: usize) -> Result<RootHeader> {
        let mut magic = [0u8; 4];
        if cursor.read_exact(&mut magic).is_err()
            || (magic != ROOT_MAGIC && magic != ROOT_MAGIC_SWAPPED)
        {
            // Legacy blob: no header at all, pages start immediately.
            cursor.set_position(0);
            return Ok(RootHeader {
                legacy: true,
                version: 0,
                total_file_count: 0,
                named_file_count: 0,
            });
        }

        let header_size = cursor.read_u32::<LittleEndian>()?;
        let version = cursor.read_u32::<LittleEndian>()?;

        if header_size > MAX_PLAUSIBLE_HEADER_SIZE {
            // Pre-counted form: the two values already read are the file
            // counts and there is nothing else to skip.
            return Ok(RootHeader {
                legacy: false,
                version: 0,
                total_file_count: header_size,
                named_file_count: version,
            });
        }

        let total_file_count = cursor.read_u32::<LittleEndian>()?;
        let named_file_count = cursor.read_u32::<LittleEndian>()?;
        if header_size as usize > blob_len {
            return Err(Error::Truncated {
                format: "root",
                expected: header_size as usize,
                actual: blob_len,
            });
        }
        cursor.set_position(u64::from(header_size));

        Ok(RootHeader {
            legacy: false,
            version,
            total_file_count,
            named_file_count,
        })
    }

    /// Parse one page. Returns `Ok(None)` for empty and dropped pages.
    fn parse_page(
        cursor: &mut Cursor<&[u8]>,
        header: &RootHeader,
        only_locale: LocaleFlags,
    ) -> Result<Option<RootPage>> {
        let record_count = cursor.read_u32::<LittleEndian>()? as usize;

        let (content_flags, locale_flags) = if header.version >= 2 {
            let locale = LocaleFlags::from(cursor.read_u32::<LittleEndian>()?);
            let unk1 = cursor.read_u32::<LittleEndian>()?;
            let unk2 = cursor.read_u32::<LittleEndian>()?;
            let unk3 = cursor.read_u8()?;
            let content = ContentFlags::from(unk1 | unk2 | (u32::from(unk3) << 17));
            (content, locale)
        } else {
            let content = ContentFlags::from(cursor.read_u32::<LittleEndian>()?);
            let locale = LocaleFlags::from(cursor.read_u32::<LittleEndian>()?);
            let _reserved = cursor.read_u32::<LittleEndian>()?;
            let _reserved = cursor.read_u32::<LittleEndian>()?;
            (content, locale)
        };

        if record_count == 0 {
            return Ok(None);
        }

        let has_names = !header.allow_unnamed() || !content_flags.no_names();

        // Locale-mismatched pages are skipped unless they fall outside the
        // shipped-language mask entirely; those are format sentinels and
        // always kept. Low-violence pages are never kept.
        let keep = !content_flags.low_violence()
            && (locale_flags.overlaps(only_locale)
                || !locale_flags.overlaps(LocaleFlags::all_locales()));
        if !keep {
            trace!(
                "skipping page: {record_count} records, locale {:#x}, content {:#x}",
                u32::from(locale_flags),
                u32::from(content_flags)
            );
            let record_len = 4 + KEY_LENGTH + if has_names { 8 } else { 0 };
            let skip = (record_count * record_len) as i64;
            cursor.set_position(cursor.position().saturating_add_signed(skip));
            return Ok(None);
        }

        // Deltas decode to a strictly ascending file ID sequence.
        let mut file_data_ids = Vec::with_capacity(record_count);
        let mut previous = 0u32;
        for i in 0..record_count {
            let delta = cursor.read_u32::<LittleEndian>()?;
            let id = if i == 0 {
                delta
            } else {
                previous
                    .checked_add(delta)
                    .and_then(|v| v.checked_add(1))
                    .ok_or(Error::FileIdOverflow)?
            };
            file_data_ids.push(id);
            previous = id;
        }

        let mut content_keys = Vec::with_capacity(record_count);
        for _ in 0..record_count {
            let mut key = [0u8; KEY_LENGTH];
            cursor.read_exact(&mut key)?;
            content_keys.push(CKey::new(key));
        }

        let name_hashes = if has_names {
            let mut hashes = Vec::with_capacity(record_count);
            for _ in 0..record_count {
                hashes.push(cursor.read_u64::<LittleEndian>()?);
            }
            Some(hashes)
        } else {
            None
        };

        Ok(Some(RootPage {
            content_flags,
            locale_flags,
            file_data_ids,
            content_keys,
            name_hashes,
        }))
    }

    /// Look up a record by file data ID. Pages are searched in file
    /// order; within a page the IDs are strictly ascending, so each page
    /// is binary-searched.
    pub fn find_file_data_id(&self, file_data_id: u32) -> Option<RootRecord> {
        for (page_index, page) in self.pages.iter().enumerate() {
            if let Ok(record_index) = page.file_data_ids.binary_search(&file_data_id) {
                return Some(self.record(page_index, record_index));
            }
        }
        None
    }

    /// Look up a record by path hash in O(1).
    pub fn find_name_hash(&self, name_hash: u64) -> Option<RootRecord> {
        let &(page_index, record_index) = self.name_map.get(&name_hash)?;
        Some(self.record(page_index, record_index))
    }

    /// Total number of kept records.
    pub fn record_count(&self) -> usize {
        self.pages.iter().map(|p| p.file_data_ids.len()).sum()
    }

    fn record(&self, page_index: usize, record_index: usize) -> RootRecord {
        let page = &self.pages[page_index];
        RootRecord {
            file_data_id: page.file_data_ids[record_index],
            content_key: page.content_keys[record_index],
            name_hash: page
                .name_hashes
                .as_ref()
                .map(|h| h[record_index])
                .unwrap_or(0),
            content_flags: page.content_flags,
            locale_flags: page.locale_flags,
        }
    }
}
