//! Error types for BLTE parsing and decoding.

use thiserror::Error;

/// Result type for BLTE operations.
pub type Result<T> = std::result::Result<T, Error>;

/// BLTE error types.
#[derive(Error, Debug)]
pub enum Error {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid BLTE magic bytes.
    #[error("invalid BLTE magic: {0:02x?}")]
    InvalidMagic([u8; 4]),

    /// Chunk table flags byte was not the expected `0x0F`.
    #[error("invalid chunk table flags: {0:#04x}")]
    InvalidTableFlags(u8),

    /// Header size does not match the declared chunk count.
    #[error("invalid header size {header_size} for {chunk_count} chunks")]
    InvalidHeaderSize {
        header_size: u32,
        chunk_count: u32,
    },

    /// Data ended before the structure it declares.
    #[error("truncated data: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    /// A chunk's MD5 did not match its table entry.
    #[error("corrupt chunk {index}: expected {expected}, got {actual}")]
    CorruptChunk {
        index: usize,
        expected: String,
        actual: String,
    },

    /// The concatenated output did not have the caller-supplied size.
    #[error("decoded size mismatch: expected {expected} bytes, got {actual}")]
    DecodedSizeMismatch { expected: u64, actual: u64 },

    /// Unknown chunk mode byte.
    #[error("unknown chunk mode: {0:#04x}")]
    UnknownMode(u8),

    /// Zlib inflation failed.
    #[error("zlib inflate failed: {0}")]
    Inflate(String),

    /// Malformed encrypted chunk structure.
    #[error("invalid encrypted chunk: {0}")]
    InvalidEncryptedChunk(String),

    /// The named encryption key was not supplied by the host.
    ///
    /// Callers treat this as a soft failure and try another encoding key.
    #[error("missing encryption key: {0:#018x}")]
    MissingKey(u64),

    /// Encryption type byte other than Salsa20 or ARC4.
    #[error("unsupported encryption type: {0:#04x}")]
    UnsupportedEncryptionType(u8),
}

impl Error {
    /// `true` if decoding failed only because the host did not supply the
    /// named encryption key.
    pub fn is_missing_key(&self) -> bool {
        matches!(self, Error::MissingKey(_))
    }
}
