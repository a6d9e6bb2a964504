//! Column codecs
//!
//! Compression for the two physical column classes. Both codecs report
//! statistics (item count, has-nulls, min, max) alongside the payload;
//! decoding requires those statistics and the exact payload bytes.

pub mod bitpack;
pub mod int_codec;
pub mod str_codec;

pub use int_codec::{EncodedInts, IntStats};
pub use str_codec::{EncodedStrs, StrStats};

use crate::{Result, TesseraError};

/// LEB128 encoding of `v`
pub(crate) fn write_varint(mut v: u64, out: &mut Vec<u8>) {
    while v >= 0x80 {
        out.push((v as u8) | 0x80);
        v >>= 7;
    }
    out.push(v as u8);
}

pub(crate) fn varint_len(v: u64) -> usize {
    (bitpack::bits_required(v).max(1) as usize + 6) / 7
}

pub(crate) fn read_varint(bytes: &[u8], pos: &mut usize) -> Result<u64> {
    let mut result = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = *bytes
            .get(*pos)
            .ok_or_else(|| TesseraError::Corrupt("varint runs past end of payload".to_string()))?;
        *pos += 1;
        if shift >= 64 {
            return Err(TesseraError::Corrupt("varint too long".to_string()));
        }
        result |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
    }
}
