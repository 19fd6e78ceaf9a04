//! Error types for CDN and resolver operations.

use thiserror::Error;

/// Result type for CDN operations.
pub type Result<T> = std::result::Result<T, Error>;

/// CDN error types.
#[derive(Error, Debug)]
pub enum Error {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP request failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Format-layer failure while reading a fetched structure.
    #[error(transparent)]
    Format(#[from] tephra_formats::Error),

    /// The requested resource does not exist in any consulted source.
    #[error("not found: {what}")]
    NotFound {
        /// What was being looked up.
        what: String,
    },

    /// Every mirror failed or rejected the request.
    #[error("all mirrors exhausted for {resource}")]
    MirrorsExhausted {
        /// Resource path that could not be fetched.
        resource: String,
    },

    /// A fetched or cached file did not hash to the digest that names
    /// it, even after one re-download.
    #[error("checksum mismatch for {name}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    /// A pipe-delimited service table could not be parsed.
    #[error("invalid manifest at line {line}: {reason}")]
    InvalidManifest { line: usize, reason: String },

    /// The versions/cdns table has no row for the requested region.
    #[error("no entry for region {region}")]
    RegionNotFound { region: String },

    /// A local storage index has an unexpected layout.
    #[error("invalid local storage index: {0}")]
    InvalidLocalIndex(String),

    /// The operation was abandoned: its cancellation signal fired,
    /// either at a deadline or from the caller.
    #[error("cancelled: {what}")]
    Cancelled { what: String },
}
