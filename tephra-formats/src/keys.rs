//! Content and encoding key newtypes.
//!
//! Both key families are 16-byte MD5 digests: a content key hashes a
//! file's decoded bytes, an encoding key hashes the encoded (BLTE) blob.

use std::fmt;

use crate::{Error, Result};

/// Length of a key in bytes.
pub const KEY_LENGTH: usize = 16;

/// An MD5 digest.
pub type Md5 = [u8; KEY_LENGTH];

macro_rules! key_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(Md5);

        impl $name {
            /// Wrap a raw 16-byte digest.
            pub const fn new(bytes: Md5) -> Self {
                Self(bytes)
            }

            /// Copy a key out of a byte slice of exactly [`KEY_LENGTH`]
            /// bytes.
            pub fn from_slice(bytes: &[u8]) -> Option<Self> {
                let bytes: Md5 = bytes.try_into().ok()?;
                Some(Self(bytes))
            }

            /// Parse a 32-digit lowercase or uppercase hex string.
            pub fn from_hex(s: &str) -> Result<Self> {
                let bytes =
                    hex::decode(s).map_err(|_| Error::InvalidHexKey(s.to_string()))?;
                Self::from_slice(&bytes).ok_or_else(|| Error::InvalidHexKey(s.to_string()))
            }

            /// The raw digest bytes.
            pub const fn as_bytes(&self) -> &Md5 {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self)
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }
    };
}

key_type! {
    /// Digest of a logical file's decoded bytes.
    CKey
}

key_type! {
    /// Digest of a blob's encoded (BLTE-wrapped) bytes.
    EKey
}

impl EKey {
    /// Number of leading key bytes that participate in local storage
    /// bucketing and truncated local index keys.
    pub const BUCKET_FOLD_LEN: usize = 9;

    /// Local storage bucket for this key: XOR-fold the first nine bytes,
    /// then fold the two nibbles.
    pub fn bucket(&self) -> u8 {
        let b = self.0[..Self::BUCKET_FOLD_LEN]
            .iter()
            .fold(0u8, |acc, &x| acc ^ x);
        (b & 0x0F) ^ (b >> 4)
    }

    /// The nine-byte truncated form used by local storage indices.
    pub fn truncated(&self) -> [u8; Self::BUCKET_FOLD_LEN] {
        let mut out = [0u8; Self::BUCKET_FOLD_LEN];
        out.copy_from_slice(&self.0[..Self::BUCKET_FOLD_LEN]);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trip() {
        let hex = "000102030405060708090a0b0c0d0e0f";
        let key = CKey::from_hex(hex).unwrap();
        assert_eq!(key.to_string(), hex);
        assert_eq!(key.as_bytes()[0], 0);
        assert_eq!(key.as_bytes()[15], 0x0F);
    }

    #[test]
    fn rejects_bad_hex() {
        assert!(CKey::from_hex("xyz").is_err());
        assert!(CKey::from_hex("0011").is_err());
        assert!(EKey::from_hex("").is_err());
    }

    #[test]
    fn bucket_folds_first_nine_bytes() {
        // XOR of 0x10..=0x18 is 0x18 ^ ... compute directly.
        let mut bytes = [0u8; 16];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = 0x10 + i as u8;
        }
        let key = EKey::new(bytes);
        let folded = (0x10u8..=0x18).fold(0, |a, b| a ^ b);
        assert_eq!(key.bucket(), (folded & 0x0F) ^ (folded >> 4));

        // Trailing bytes do not affect the bucket.
        let mut other = bytes;
        other[15] = 0xFF;
        assert_eq!(EKey::new(other).bucket(), key.bucket());
    }
}
