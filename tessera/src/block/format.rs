//! Serialized block layout
//!
//! ```text
//! +----------------------+------------------------+-----------+-----+-----------+
//! | has-nulls bitmap     | payload lengths        | payload 0 | ... | payload n |
//! | ceil(ncols / 8) B    | ncols x u16 LE         |           |     |           |
//! +----------------------+------------------------+-----------+-----+-----------+
//! ```
//!
//! Columns appear in schema order: user columns, then the record id.
//! Item count and per-column min/max are not part of the bytes; they travel
//! in the metadata row describing the block.

use std::io::{Cursor, Write};
use std::ops::Range;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::column::ColumnMeta;
use crate::data::{BitVec, Value};
use crate::{Result, TesseraError};

/// Size of the fixed part preceding the column payloads
pub fn header_len(ncols: usize) -> usize {
    (ncols + 7) / 8 + 2 * ncols
}

/// A block ready to be written to a block store
#[derive(Debug, Clone)]
pub struct SerializedBlock {
    pub bytes: Vec<u8>,
    pub item_count: usize,
    pub columns: Vec<ColumnMeta>,
}

impl SerializedBlock {
    pub fn byte_size(&self) -> usize {
        self.bytes.len()
    }

    /// Per-column (min, max) bounds, in schema order
    pub fn bounds(&self) -> Vec<(Value, Value)> {
        self.columns
            .iter()
            .map(|m| (m.min.clone(), m.max.clone()))
            .collect()
    }
}

/// Assemble encoded column payloads into block bytes
pub fn write_block(item_count: usize, columns: Vec<(Vec<u8>, ColumnMeta)>) -> Result<SerializedBlock> {
    let ncols = columns.len();
    let mut has_nulls = BitVec::with_capacity(ncols);
    let mut total = header_len(ncols);
    for (payload, meta) in &columns {
        if payload.len() > u16::MAX as usize {
            return Err(TesseraError::BlockOverflow(payload.len()));
        }
        has_nulls.push(meta.has_nulls);
        total += payload.len();
    }

    let mut bytes = Vec::with_capacity(total);
    bytes.write_all(&has_nulls.to_bytes(ncols))?;
    for (payload, _) in &columns {
        bytes.write_u16::<LittleEndian>(payload.len() as u16)?;
    }
    let mut metas = Vec::with_capacity(ncols);
    for (payload, meta) in columns {
        bytes.write_all(&payload)?;
        metas.push(meta);
    }
    Ok(SerializedBlock {
        bytes,
        item_count,
        columns: metas,
    })
}

/// Parsed header: has-nulls flags and the byte range of each payload
#[derive(Debug, Clone)]
pub struct BlockLayout {
    pub has_nulls: BitVec,
    pub payloads: Vec<Range<usize>>,
}

pub fn read_layout(ncols: usize, bytes: &[u8]) -> Result<BlockLayout> {
    let bitmap_len = (ncols + 7) / 8;
    if bytes.len() < header_len(ncols) {
        return Err(TesseraError::Corrupt(format!(
            "block of {} bytes is shorter than its {}-column header",
            bytes.len(),
            ncols
        )));
    }
    let has_nulls = BitVec::from_bytes(&bytes[..bitmap_len], ncols);
    let mut cursor = Cursor::new(&bytes[bitmap_len..header_len(ncols)]);
    let mut offset = header_len(ncols);
    let mut payloads = Vec::with_capacity(ncols);
    for _ in 0..ncols {
        let len = cursor.read_u16::<LittleEndian>()? as usize;
        payloads.push(offset..offset + len);
        offset += len;
    }
    if offset != bytes.len() {
        return Err(TesseraError::Corrupt(format!(
            "block payload lengths sum to {} bytes, block has {}",
            offset,
            bytes.len()
        )));
    }
    Ok(BlockLayout { has_nulls, payloads })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(has_nulls: bool) -> ColumnMeta {
        ColumnMeta {
            has_nulls,
            min: Value::Null,
            max: Value::Null,
        }
    }

    #[test]
    fn test_layout_round_trip() {
        let block = write_block(
            3,
            vec![(vec![1, 2, 3], meta(true)), (vec![], meta(false)), (vec![9], meta(false))],
        )
        .unwrap();
        assert_eq!(block.byte_size(), header_len(3) + 4);

        let layout = read_layout(3, &block.bytes).unwrap();
        assert!(layout.has_nulls.get(0));
        assert!(!layout.has_nulls.get(1));
        assert_eq!(&block.bytes[layout.payloads[0].clone()], &[1, 2, 3]);
        assert!(layout.payloads[1].is_empty());
        assert_eq!(&block.bytes[layout.payloads[2].clone()], &[9]);
    }

    #[test]
    fn test_overflow_and_truncation() {
        let big = vec![0u8; u16::MAX as usize + 1];
        assert!(matches!(
            write_block(1, vec![(big, meta(false))]),
            Err(TesseraError::BlockOverflow(_))
        ));

        let block = write_block(1, vec![(vec![1, 2], meta(false))]).unwrap();
        assert!(read_layout(1, &block.bytes[..block.bytes.len() - 1]).is_err());
        assert!(read_layout(4, &block.bytes[..2]).is_err());
    }
}
