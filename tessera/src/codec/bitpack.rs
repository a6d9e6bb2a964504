//! Fixed-width bit packing of unsigned integers

use crate::{Result, TesseraError};

/// Bits needed to represent every value in `0..=range`
#[inline]
pub fn bits_required(range: u64) -> u8 {
    (64 - range.leading_zeros()) as u8
}

/// Bytes occupied by `count` values packed at `width` bits
#[inline]
pub fn packed_len(count: usize, width: u8) -> usize {
    (count * width as usize + 7) / 8
}

/// Append `values` to `out`, each truncated to `width` bits, LSB-first.
pub fn pack(values: impl IntoIterator<Item = u64>, width: u8, out: &mut Vec<u8>) {
    if width == 0 {
        return;
    }
    let mut acc: u128 = 0;
    let mut bits: u32 = 0;
    for v in values {
        acc |= ((v & mask(width)) as u128) << bits;
        bits += width as u32;
        while bits >= 8 {
            out.push(acc as u8);
            acc >>= 8;
            bits -= 8;
        }
    }
    if bits > 0 {
        out.push(acc as u8);
    }
}

/// Read `count` values of `width` bits. `bytes` must be exactly
/// `packed_len(count, width)` long.
pub fn unpack(bytes: &[u8], count: usize, width: u8) -> Result<Vec<u64>> {
    let expected = packed_len(count, width);
    if bytes.len() != expected {
        return Err(TesseraError::Corrupt(format!(
            "bit-packed run of {} x {} bits needs {} bytes, found {}",
            count,
            width,
            expected,
            bytes.len()
        )));
    }
    if width == 0 {
        return Ok(vec![0; count]);
    }

    let mut out = Vec::with_capacity(count);
    let mut acc: u128 = 0;
    let mut bits: u32 = 0;
    let mut input = bytes.iter();
    for _ in 0..count {
        while bits < width as u32 {
            // length checked above
            let byte = input.next().copied().unwrap_or(0);
            acc |= (byte as u128) << bits;
            bits += 8;
        }
        out.push((acc as u64) & mask(width));
        acc >>= width;
        bits -= width as u32;
    }
    Ok(out)
}

#[inline]
fn mask(width: u8) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bits_required() {
        assert_eq!(bits_required(0), 0);
        assert_eq!(bits_required(1), 1);
        assert_eq!(bits_required(255), 8);
        assert_eq!(bits_required(256), 9);
        assert_eq!(bits_required(u64::MAX), 64);
    }

    #[test]
    fn test_pack_odd_widths() {
        for width in [1u8, 3, 7, 13, 33, 64] {
            let values: Vec<u64> = (0..37u64).map(|i| (i * 2654435761) & mask(width)).collect();
            let mut out = Vec::new();
            pack(values.iter().copied(), width, &mut out);
            assert_eq!(out.len(), packed_len(values.len(), width));
            assert_eq!(unpack(&out, values.len(), width).unwrap(), values);
        }
    }

    #[test]
    fn test_unpack_rejects_wrong_length() {
        assert!(matches!(unpack(&[0u8; 3], 10, 3), Err(TesseraError::Corrupt(_))));
    }
}
