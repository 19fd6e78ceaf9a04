//! Error types for the client.

use thiserror::Error;

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Client error types.
#[derive(Error, Debug)]
pub enum Error {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// BLTE decoding failure.
    #[error(transparent)]
    Blte(#[from] tephra_blte::Error),

    /// Format parsing failure.
    #[error(transparent)]
    Formats(#[from] tephra_formats::Error),

    /// CDN or resolver failure.
    #[error(transparent)]
    Cdn(#[from] tephra_cdn::Error),

    /// The requested file is absent from every consulted table.
    #[error("file not found: {what}")]
    FileNotFound {
        /// What was being looked up.
        what: String,
    },

    /// Every encoding of the content needs a key the host does not
    /// have.
    #[error("no decodable encoding for {ckey}: all candidates need missing keys")]
    NoDecodableEncoding {
        /// Content key whose encodings were exhausted.
        ckey: String,
    },
}
