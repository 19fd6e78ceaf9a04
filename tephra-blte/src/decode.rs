//! BLTE decoding: chunk-table verification and per-chunk mode dispatch.

use flate2::read::ZlibDecoder;
use std::io::{Cursor, Read};
use tracing::{debug, trace};

use crate::crypt::{apply_arc4, apply_salsa20, chunk_iv};
use crate::header::ChunkTable;
use crate::{Error, KeyRing, Result};

/// Chunk mode bytes.
const MODE_RAW: u8 = b'N';
const MODE_ZLIB: u8 = b'Z';
const MODE_FRAME: u8 = b'F';
const MODE_ENCRYPTED: u8 = b'E';

/// Encryption type bytes inside a mode-`E` chunk.
const ENC_SALSA20: u8 = b'S';
const ENC_ARC4: u8 = b'A';

/// Decode a complete BLTE blob into the original bytes.
///
/// `expected_decoded_size` is the caller-known decoded length; pass 0 when
/// unknown (required for unframed blobs whose table carries no sizes).
/// For framed blobs every chunk's MD5 is verified over the encoded chunk
/// bytes, mode byte included.
pub fn decode(data: &[u8], expected_decoded_size: u64, keys: Option<&KeyRing>) -> Result<Vec<u8>> {
    let table = ChunkTable::parse(data)?;
    debug!(
        "decoding BLTE blob: {} chunks, {} bytes",
        table.chunks().len(),
        data.len()
    );

    let mut out = Vec::with_capacity(expected_decoded_size as usize);
    for (index, chunk) in table.chunks().iter().enumerate() {
        let end = chunk.offset + chunk.encoded_size as usize;
        if end > data.len() {
            return Err(Error::Truncated {
                expected: end,
                actual: data.len(),
            });
        }
        let encoded = &data[chunk.offset..end];

        if let Some(expected) = &chunk.checksum {
            let actual = md5::compute(encoded).0;
            if &actual != expected {
                return Err(Error::CorruptChunk {
                    index,
                    expected: hex::encode(expected),
                    actual: hex::encode(actual),
                });
            }
        }

        let decoded = decode_chunk(encoded, index, keys)?;
        out.extend_from_slice(&decoded);
    }

    if expected_decoded_size != 0 && out.len() as u64 != expected_decoded_size {
        return Err(Error::DecodedSizeMismatch {
            expected: expected_decoded_size,
            actual: out.len() as u64,
        });
    }

    Ok(out)
}

/// Decode a single encoded chunk (mode byte plus payload).
///
/// `chunk_index` is the chunk's zero-based position in the enclosing blob;
/// encrypted chunks fold it into their IV.
pub fn decode_chunk(data: &[u8], chunk_index: usize, keys: Option<&KeyRing>) -> Result<Vec<u8>> {
    let Some((&mode, payload)) = data.split_first() else {
        return Err(Error::Truncated {
            expected: 1,
            actual: 0,
        });
    };

    trace!("chunk {chunk_index}: mode {:?}", mode as char);
    match mode {
        MODE_RAW => Ok(payload.to_vec()),
        MODE_ZLIB => inflate(payload),
        MODE_FRAME => decode(payload, 0, keys),
        MODE_ENCRYPTED => decrypt_chunk(payload, chunk_index, keys),
        other => Err(Error::UnknownMode(other)),
    }
}

fn inflate(payload: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(payload);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| Error::Inflate(e.to_string()))?;
    Ok(out)
}

/// Decrypt a mode-`E` payload and decode the plaintext it wraps.
///
/// Layout: key name length (must be 8), 8-byte key name, IV length (at
/// most 8), IV bytes, encryption type, ciphertext.
fn decrypt_chunk(payload: &[u8], chunk_index: usize, keys: Option<&KeyRing>) -> Result<Vec<u8>> {
    let mut cursor = Cursor::new(payload);

    let mut byte = [0u8; 1];
    cursor.read_exact(&mut byte)?;
    let key_name_len = byte[0] as usize;
    if key_name_len != 8 {
        return Err(Error::InvalidEncryptedChunk(format!(
            "key name length {key_name_len}, expected 8"
        )));
    }
    let mut key_name_bytes = [0u8; 8];
    cursor.read_exact(&mut key_name_bytes)?;
    let key_name = u64::from_le_bytes(key_name_bytes);

    cursor.read_exact(&mut byte)?;
    let iv_len = byte[0] as usize;
    if iv_len > 8 {
        return Err(Error::InvalidEncryptedChunk(format!(
            "IV length {iv_len}, expected at most 8"
        )));
    }
    let mut iv = [0u8; 8];
    cursor.read_exact(&mut iv[..iv_len])?;

    cursor.read_exact(&mut byte)?;
    let enc_type = byte[0];

    let key = keys
        .and_then(|k| k.get(key_name))
        .ok_or(Error::MissingKey(key_name))?;

    let mut plain = payload[cursor.position() as usize..].to_vec();
    let iv = chunk_iv(&iv[..iv_len], chunk_index);
    match enc_type {
        ENC_SALSA20 => apply_salsa20(&mut plain, key, &iv),
        ENC_ARC4 => apply_arc4(&mut plain, key, &iv)?,
        other => return Err(Error::UnsupportedEncryptionType(other)),
    }

    // The plaintext is itself a mode-prefixed chunk.
    match plain.first() {
        Some(&m) if m != MODE_ENCRYPTED && is_known_mode(m) => {
            decode_chunk(&plain, chunk_index, keys)
        }
        _ => Ok(plain),
    }
}

fn is_known_mode(mode: u8) -> bool {
    matches!(mode, MODE_RAW | MODE_ZLIB | MODE_FRAME | MODE_ENCRYPTED)
}
