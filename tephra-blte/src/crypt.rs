//! Stream-cipher helpers for encrypted BLTE chunks.

use cipher::{KeyInit, KeyIvInit, StreamCipher};
use rc4::Rc4;
use salsa20::Salsa20;

use crate::{Error, Result};

/// Build the effective 64-bit IV for a chunk: the stored IV bytes,
/// zero-extended to 8, XORed in the low bytes with the chunk's
/// zero-based index as little-endian.
pub fn chunk_iv(iv: &[u8], chunk_index: usize) -> [u8; 8] {
    let mut full = [0u8; 8];
    full[..iv.len()].copy_from_slice(iv);
    for (b, i) in full.iter_mut().zip((chunk_index as u64).to_le_bytes()) {
        *b ^= i;
    }
    full
}

/// Apply the Salsa20 keystream in place.
///
/// The 16-byte key is extended to Salsa20's 32 bytes by duplication.
pub fn apply_salsa20(data: &mut [u8], key: &[u8; 16], iv: &[u8; 8]) {
    let mut extended = [0u8; 32];
    extended[..16].copy_from_slice(key);
    extended[16..].copy_from_slice(key);

    let mut cipher = Salsa20::new(&extended.into(), iv.into());
    cipher.apply_keystream(data);
}

/// Apply the ARC4 keystream in place.
///
/// The RC4 key is the 16-byte base key followed by the 8-byte chunk IV.
pub fn apply_arc4(data: &mut [u8], key: &[u8; 16], iv: &[u8; 8]) -> Result<()> {
    let mut rc4_key = [0u8; 24];
    rc4_key[..16].copy_from_slice(key);
    rc4_key[16..].copy_from_slice(iv);

    let mut cipher = Rc4::<rc4::consts::U24>::new_from_slice(&rc4_key)
        .map_err(|_| Error::InvalidEncryptedChunk("bad ARC4 key length".to_string()))?;
    cipher.apply_keystream(data);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_iv_xors_index() {
        let iv = [0x10, 0x20, 0x30, 0x40];
        assert_eq!(chunk_iv(&iv, 0), [0x10, 0x20, 0x30, 0x40, 0, 0, 0, 0]);
        assert_eq!(chunk_iv(&iv, 1), [0x11, 0x20, 0x30, 0x40, 0, 0, 0, 0]);
        assert_eq!(
            chunk_iv(&iv, 0x0102),
            [0x12, 0x21, 0x30, 0x40, 0, 0, 0, 0]
        );
    }

    #[test]
    fn salsa20_round_trips() {
        let key = [7u8; 16];
        let iv = chunk_iv(&[1, 2, 3, 4], 5);
        let plain = b"attack at dawn".to_vec();

        let mut buf = plain.clone();
        apply_salsa20(&mut buf, &key, &iv);
        assert_ne!(buf, plain);
        apply_salsa20(&mut buf, &key, &iv);
        assert_eq!(buf, plain);
    }

    #[test]
    fn arc4_round_trips() {
        let key = [9u8; 16];
        let iv = chunk_iv(&[4, 3, 2, 1], 2);
        let plain = b"attack at dusk".to_vec();

        let mut buf = plain.clone();
        apply_arc4(&mut buf, &key, &iv).unwrap();
        assert_ne!(buf, plain);
        apply_arc4(&mut buf, &key, &iv).unwrap();
        assert_eq!(buf, plain);
    }

    #[test]
    fn salsa20_differs_by_chunk_index() {
        let key = [7u8; 16];
        let plain = b"same bytes".to_vec();

        let mut a = plain.clone();
        apply_salsa20(&mut a, &key, &chunk_iv(&[1, 2, 3, 4], 0));
        let mut b = plain.clone();
        apply_salsa20(&mut b, &key, &chunk_iv(&[1, 2, 3, 4], 1));
        assert_ne!(a, b);
    }
}
