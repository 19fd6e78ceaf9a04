//! Byte-level utilities shared by the table parsers: big-endian reads
//! of odd widths out of slices, lower-bound search over fixed-stride
//! record arrays, and null-delimited string tables.
//!
//! Stream-oriented reads go through `byteorder` at the call sites; the
//! helpers here cover what it does not: variable-width fields addressed
//! by offset inside an already-sliced record or page.

/// Read a big-endian unsigned integer of `width` bytes (at most 8) from
/// the front of a slice.
///
/// The 40-bit sizes in the encoding table and the packed offset fields
/// of archive indices all decode through this; every byte participates,
/// so `width == 5` yields `(b0<<32)|(b1<<24)|(b2<<16)|(b3<<8)|b4`.
pub fn read_uint_be(data: &[u8], width: usize) -> u64 {
    debug_assert!(width <= 8 && data.len() >= width);
    data[..width].iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b))
}

/// Index of the first record in a fixed-stride array for which `cmp`
/// returns `Ordering::Greater` or `Ordering::Equal`.
///
/// `records` must be a whole number of `stride`-byte records. The
/// comparator sees the full record so callers can treat zero padding as
/// greater-than-everything.
pub fn lower_bound_by<F>(records: &[u8], stride: usize, mut cmp: F) -> usize
where
    F: FnMut(&[u8]) -> std::cmp::Ordering,
{
    use std::cmp::Ordering;

    let count = records.len() / stride;
    let mut lo = 0usize;
    let mut hi = count;
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        let record = &records[mid * stride..(mid + 1) * stride];
        match cmp(record) {
            Ordering::Less => lo = mid + 1,
            _ => hi = mid,
        }
    }
    lo
}

/// Lower bound over fixed-stride records compared by their leading
/// `key.len()` bytes.
pub fn lower_bound(records: &[u8], stride: usize, key: &[u8]) -> usize {
    lower_bound_by(records, stride, |record| record[..key.len()].cmp(key))
}

/// Split a null-delimited string table into its entries.
///
/// Trailing bytes after the last terminator are ignored, matching how
/// the tables are zero-padded on disk.
pub fn parse_cstr_table(data: &[u8]) -> Vec<String> {
    let mut entries: Vec<String> = data
        .split(|&b| b == 0)
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect();
    while entries.last().is_some_and(|s| s.is_empty()) {
        entries.pop();
    }
    entries
}
