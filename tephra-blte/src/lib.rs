//! BLTE block-compressed container codec.
//!
//! Every data blob served by the content pipeline is wrapped in a BLTE
//! envelope: an optional chunk table followed by one or more chunks, each
//! carrying a one-byte mode that selects how its payload is decoded.
//! [`decode`] unwraps a complete blob back into the original bytes.

mod crypt;
mod decode;
mod error;
mod header;
mod keyring;

pub use decode::{decode, decode_chunk};
pub use error::{Error, Result};
pub use header::{ChunkInfo, ChunkTable};
pub use keyring::KeyRing;

/// Magic bytes at the start of every BLTE blob.
pub const BLTE_MAGIC: [u8; 4] = *b"BLTE";

/// Length of an MD5 digest in bytes.
pub const MD5_LENGTH: usize = 16;

/// An MD5 digest.
pub type Md5 = [u8; MD5_LENGTH];
