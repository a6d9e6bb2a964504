//! Integer column codec
//!
//! Values are stored as offsets from the column minimum, bit-packed at the
//! width of `max - min`. Statistics travel next to the payload, so the
//! degenerate regimes cost no payload at all:
//!
//! ```text
//!   all null            -> []
//!   no nulls            -> [packed offsets]
//!   mixed nulls         -> [validity bitmap][packed offsets of non-null values]
//!   constant, no nulls  -> []            (width 0)
//! ```

use super::bitpack;
use crate::data::BitVec;
use crate::{Result, TesseraError};

/// Statistics needed to decode an integer payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntStats {
    pub item_count: usize,
    pub has_nulls: bool,
    /// None when every value is null
    pub min: Option<i64>,
    pub max: Option<i64>,
}

impl IntStats {
    pub fn compute(values: &[Option<i64>]) -> Self {
        let mut min = None::<i64>;
        let mut max = None::<i64>;
        let mut has_nulls = false;
        for v in values {
            match v {
                Some(v) => {
                    min = Some(min.map_or(*v, |m| m.min(*v)));
                    max = Some(max.map_or(*v, |m| m.max(*v)));
                }
                None => has_nulls = true,
            }
        }
        Self {
            item_count: values.len(),
            has_nulls,
            min,
            max,
        }
    }

    fn width(&self) -> u8 {
        match (self.min, self.max) {
            (Some(min), Some(max)) => bitpack::bits_required(offset(max, min)),
            _ => 0,
        }
    }
}

/// Encoded integer column
#[derive(Debug, Clone)]
pub struct EncodedInts {
    pub payload: Vec<u8>,
    pub stats: IntStats,
}

#[inline]
fn offset(v: i64, min: i64) -> u64 {
    (v as i128 - min as i128) as u64
}

pub fn compress(values: &[Option<i64>]) -> EncodedInts {
    let stats = IntStats::compute(values);
    let mut payload = Vec::new();
    let Some(min) = stats.min else {
        return EncodedInts { payload, stats };
    };

    if stats.has_nulls {
        let mut validity = BitVec::with_capacity(values.len());
        for v in values {
            validity.push(v.is_some());
        }
        payload.extend_from_slice(&validity.to_bytes(values.len()));
    }
    bitpack::pack(
        values.iter().flatten().map(|v| offset(*v, min)),
        stats.width(),
        &mut payload,
    );
    EncodedInts { payload, stats }
}

/// Exact payload size `compress` would produce, without encoding
pub fn compressed_len(stats: &IntStats, non_null: usize) -> usize {
    if stats.min.is_none() {
        return 0;
    }
    let bitmap = if stats.has_nulls {
        (stats.item_count + 7) / 8
    } else {
        0
    };
    bitmap + bitpack::packed_len(non_null, stats.width())
}

pub fn decompress(stats: &IntStats, payload: &[u8]) -> Result<Vec<Option<i64>>> {
    let n = stats.item_count;
    let Some(min) = stats.min else {
        if !payload.is_empty() {
            return Err(TesseraError::Corrupt(format!(
                "all-null integer column carries {} payload bytes",
                payload.len()
            )));
        }
        return Ok(vec![None; n]);
    };

    let (validity, packed) = if stats.has_nulls {
        let bitmap_len = (n + 7) / 8;
        if payload.len() < bitmap_len {
            return Err(TesseraError::Corrupt(format!(
                "integer payload of {} bytes is shorter than its {}-byte validity bitmap",
                payload.len(),
                bitmap_len
            )));
        }
        let validity = BitVec::from_bytes(&payload[..bitmap_len], n);
        (Some(validity), &payload[bitmap_len..])
    } else {
        (None, payload)
    };

    let present = validity.as_ref().map_or(n, |v| v.count_ones());
    let offsets = bitpack::unpack(packed, present, stats.width())?;
    let decode = |off: u64| (min as i128 + off as i128) as i64;

    let mut out = Vec::with_capacity(n);
    match validity {
        None => out.extend(offsets.into_iter().map(|off| Some(decode(off)))),
        Some(validity) => {
            let mut offsets = offsets.into_iter();
            for i in 0..n {
                if validity.get(i) {
                    out.push(offsets.next().map(decode));
                } else {
                    out.push(None);
                }
            }
        }
    }
    Ok(out)
}
