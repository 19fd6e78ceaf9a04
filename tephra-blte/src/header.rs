//! BLTE header and chunk table parsing.

use byteorder::{BigEndian, ReadBytesExt};
use std::io::{Cursor, Read};
use tracing::trace;

use crate::{BLTE_MAGIC, Error, MD5_LENGTH, Md5, Result};

/// Flags byte that introduces a chunk table.
const TABLE_FLAGS: u8 = 0x0F;

/// Size of one chunk table entry: two u32 sizes plus an MD5.
const CHUNK_ENTRY_LEN: u32 = 4 + 4 + MD5_LENGTH as u32;

/// One entry of the chunk table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkInfo {
    /// Encoded size of the chunk, including its mode byte.
    pub encoded_size: u32,
    /// Decoded size of the chunk.
    pub decoded_size: u32,
    /// MD5 over the encoded chunk bytes (mode byte included), if framed.
    pub checksum: Option<Md5>,
    /// Offset of the encoded chunk from the start of the blob.
    pub offset: usize,
}

/// Parsed BLTE header: either a framed chunk table or a single unframed
/// chunk spanning the rest of the blob.
#[derive(Debug, Clone)]
pub struct ChunkTable {
    chunks: Vec<ChunkInfo>,
    framed: bool,
}

impl ChunkTable {
    /// Parse the header of `data`, which must be a complete BLTE blob.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 8 {
            return Err(Error::Truncated {
                expected: 8,
                actual: data.len(),
            });
        }

        let mut cursor = Cursor::new(data);
        let mut magic = [0u8; 4];
        cursor.read_exact(&mut magic)?;
        if magic != BLTE_MAGIC {
            return Err(Error::InvalidMagic(magic));
        }

        let header_size = cursor.read_u32::<BigEndian>()?;
        if header_size == 0 {
            // Unframed: one chunk, decoded size supplied by the caller.
            return Ok(Self {
                chunks: vec![ChunkInfo {
                    encoded_size: (data.len() - 8) as u32,
                    decoded_size: 0,
                    checksum: None,
                    offset: 8,
                }],
                framed: false,
            });
        }

        let flags = cursor.read_u8()?;
        if flags != TABLE_FLAGS {
            return Err(Error::InvalidTableFlags(flags));
        }
        let chunk_count = cursor.read_u24::<BigEndian>()?;
        trace!("chunk table: {chunk_count} chunks, header {header_size} bytes");

        // The declared header must exactly hold the table.
        if header_size != 8 + 4 + chunk_count * CHUNK_ENTRY_LEN {
            return Err(Error::InvalidHeaderSize {
                header_size,
                chunk_count,
            });
        }
        if data.len() < header_size as usize {
            return Err(Error::Truncated {
                expected: header_size as usize,
                actual: data.len(),
            });
        }

        let mut chunks = Vec::with_capacity(chunk_count as usize);
        let mut offset = header_size as usize;
        for _ in 0..chunk_count {
            let encoded_size = cursor.read_u32::<BigEndian>()?;
            let decoded_size = cursor.read_u32::<BigEndian>()?;
            let mut checksum = [0u8; MD5_LENGTH];
            cursor.read_exact(&mut checksum)?;

            chunks.push(ChunkInfo {
                encoded_size,
                decoded_size,
                checksum: Some(checksum),
                offset,
            });
            offset = offset
                .checked_add(encoded_size as usize)
                .ok_or(Error::Truncated {
                    expected: usize::MAX,
                    actual: data.len(),
                })?;
        }

        if offset > data.len() {
            return Err(Error::Truncated {
                expected: offset,
                actual: data.len(),
            });
        }

        Ok(Self {
            chunks,
            framed: true,
        })
    }

    /// All chunks, in blob order.
    pub fn chunks(&self) -> &[ChunkInfo] {
        &self.chunks
    }

    /// `true` if the blob carried a chunk table with checksums.
    pub fn is_framed(&self) -> bool {
        self.framed
    }

    /// Sum of the declared decoded sizes. Zero for unframed blobs.
    pub fn total_decoded_size(&self) -> u64 {
        self.chunks.iter().map(|c| u64::from(c.decoded_size)).sum()
    }
}
