//! Error types for format parsing.

use thiserror::Error;

/// Result type for format operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Format error types.
#[derive(Error, Debug)]
pub enum Error {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Magic bytes did not match the expected format tag.
    #[error("bad magic for {format}: {actual:02x?}")]
    BadMagic {
        format: &'static str,
        actual: Vec<u8>,
    },

    /// The format declares a version this parser does not understand.
    #[error("unsupported {format} version: {version}")]
    UnsupportedVersion { format: &'static str, version: u32 },

    /// A declared field width is outside what the format allows.
    #[error("invalid {format} layout: {reason}")]
    InvalidLayout { format: &'static str, reason: String },

    /// Data ended before the structure it declares.
    #[error("truncated {format}: expected {expected} bytes, got {actual}")]
    Truncated {
        format: &'static str,
        expected: usize,
        actual: usize,
    },

    /// A stored checksum did not match the recomputed one.
    #[error("{what} checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        what: &'static str,
        expected: String,
        actual: String,
    },

    /// The built group index does not hash to the name the configuration
    /// promised.
    #[error("group-index checksum mismatch: expected {expected}, got {actual}")]
    GroupChecksumMismatch { expected: String, actual: String },

    /// A file ID delta sequence overflowed `u32`.
    #[error("file ID delta overflow")]
    FileIdOverflow,

    /// A required configuration key is absent or malformed.
    #[error("missing or malformed config key: {0}")]
    MissingConfigKey(&'static str),

    /// A hex string could not be decoded into a key.
    #[error("invalid hex key: {0}")]
    InvalidHexKey(String),

    /// An install manifest line could not be parsed.
    #[error("invalid install manifest line {line}: {reason}")]
    InvalidInstallLine { line: usize, reason: String },
}
