//! String column codec
//!
//! The minimum and maximum strings travel in the statistics, so they are
//! never repeated in the payload. Layouts by number of distinct values:
//!
//! ```text
//!   0 (all null)           -> []
//!   1, no nulls            -> []
//!   1, with nulls          -> [int payload of indexes, width 0 = bitmap only]
//!   2                      -> [MODE_PAIR][int payload of 0 = min, 1 = max]
//!   3+ dictionary cheaper  -> [MODE_DICT][varint k][k interior strings][int payload]
//!   3+ plain cheaper       -> [MODE_PLAIN][validity bitmap?][strings]
//! ```
//!
//! Strings are written as varint length + UTF-8 bytes.

use super::int_codec::{self, IntStats};
use super::{read_varint, varint_len, write_varint};
use crate::data::BitVec;
use crate::{Result, TesseraError};

const MODE_PAIR: u8 = 0;
const MODE_DICT: u8 = 1;
const MODE_PLAIN: u8 = 2;

/// Statistics needed to decode a string payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrStats {
    pub item_count: usize,
    pub has_nulls: bool,
    pub min: Option<String>,
    pub max: Option<String>,
}

/// Encoded string column
#[derive(Debug, Clone)]
pub struct EncodedStrs {
    pub payload: Vec<u8>,
    pub stats: StrStats,
}

pub fn compress<S: AsRef<str>>(values: &[Option<S>]) -> EncodedStrs {
    let mut distinct: Vec<&str> = values.iter().flatten().map(|s| s.as_ref()).collect();
    distinct.sort_unstable();
    distinct.dedup();

    let has_nulls = values.iter().any(|v| v.is_none());
    let stats = StrStats {
        item_count: values.len(),
        has_nulls,
        min: distinct.first().map(|s| s.to_string()),
        max: distinct.last().map(|s| s.to_string()),
    };

    let mut payload = Vec::new();
    match distinct.len() {
        0 => {}
        1 => {
            if has_nulls {
                let indexes: Vec<Option<i64>> = values.iter().map(|v| v.as_ref().map(|_| 0)).collect();
                payload = int_codec::compress(&indexes).payload;
            }
        }
        2 => {
            let indexes = index_values(values, &distinct);
            payload.push(MODE_PAIR);
            payload.extend_from_slice(&int_codec::compress(&indexes).payload);
        }
        _ => {
            let indexes = index_values(values, &distinct);
            let encoded_indexes = int_codec::compress(&indexes).payload;
            let interior = &distinct[1..distinct.len() - 1];
            let dict_len = varint_len(interior.len() as u64)
                + interior.iter().map(|s| string_len(s)).sum::<usize>()
                + encoded_indexes.len();
            let plain_len = if has_nulls { (values.len() + 7) / 8 } else { 0 }
                + values.iter().flatten().map(|s| string_len(s.as_ref())).sum::<usize>();

            if dict_len <= plain_len {
                payload.reserve(dict_len + 1);
                payload.push(MODE_DICT);
                write_varint(interior.len() as u64, &mut payload);
                for s in interior {
                    write_string(s, &mut payload);
                }
                payload.extend_from_slice(&encoded_indexes);
            } else {
                payload.reserve(plain_len + 1);
                payload.push(MODE_PLAIN);
                if has_nulls {
                    let mut validity = BitVec::with_capacity(values.len());
                    for v in values {
                        validity.push(v.is_some());
                    }
                    payload.extend_from_slice(&validity.to_bytes(values.len()));
                }
                for s in values.iter().flatten() {
                    write_string(s.as_ref(), &mut payload);
                }
            }
        }
    }
    EncodedStrs { payload, stats }
}

pub fn decompress(stats: &StrStats, payload: &[u8]) -> Result<Vec<Option<String>>> {
    let n = stats.item_count;
    let (min, max) = match (&stats.min, &stats.max) {
        (Some(min), Some(max)) => (min, max),
        _ => {
            expect_empty(payload)?;
            return Ok(vec![None; n]);
        }
    };

    if min == max {
        if !stats.has_nulls {
            expect_empty(payload)?;
            return Ok(vec![Some(min.clone()); n]);
        }
        let indexes = decode_indexes(stats, 0, payload)?;
        return Ok(indexes.into_iter().map(|i| i.map(|_| min.clone())).collect());
    }

    let (&mode, body) = payload
        .split_first()
        .ok_or_else(|| TesseraError::Corrupt("string payload missing its mode byte".to_string()))?;
    match mode {
        MODE_PAIR => {
            let dictionary = [min.as_str(), max.as_str()];
            let indexes = decode_indexes(stats, 1, body)?;
            lookup(&indexes, &dictionary)
        }
        MODE_DICT => {
            let mut pos = 0;
            let k = read_varint(body, &mut pos)? as usize;
            if k > body.len() {
                return Err(TesseraError::Corrupt(format!(
                    "dictionary claims {} entries in {} bytes",
                    k,
                    body.len()
                )));
            }
            let mut dictionary = Vec::with_capacity(k + 2);
            dictionary.push(min.clone());
            for _ in 0..k {
                dictionary.push(read_string(body, &mut pos)?);
            }
            dictionary.push(max.clone());
            let indexes = decode_indexes(stats, dictionary.len() - 1, &body[pos..])?;
            let refs: Vec<&str> = dictionary.iter().map(|s| s.as_str()).collect();
            lookup(&indexes, &refs)
        }
        MODE_PLAIN => {
            let mut pos = 0;
            let validity = if stats.has_nulls {
                let bitmap_len = (n + 7) / 8;
                if body.len() < bitmap_len {
                    return Err(TesseraError::Corrupt(
                        "plain string payload truncated in validity bitmap".to_string(),
                    ));
                }
                pos = bitmap_len;
                Some(BitVec::from_bytes(&body[..bitmap_len], n))
            } else {
                None
            };
            let mut out = Vec::with_capacity(n);
            for i in 0..n {
                if validity.as_ref().map_or(true, |v| v.get(i)) {
                    out.push(Some(read_string(body, &mut pos)?));
                } else {
                    out.push(None);
                }
            }
            if pos != body.len() {
                return Err(TesseraError::Corrupt(format!(
                    "{} trailing bytes after plain strings",
                    body.len() - pos
                )));
            }
            Ok(out)
        }
        other => Err(TesseraError::Corrupt(format!("unknown string payload mode {}", other))),
    }
}

fn index_values<S: AsRef<str>>(values: &[Option<S>], distinct: &[&str]) -> Vec<Option<i64>> {
    values
        .iter()
        .map(|v| {
            v.as_ref()
                .and_then(|s| distinct.binary_search(&s.as_ref()).ok())
                .map(|i| i as i64)
        })
        .collect()
}

fn decode_indexes(stats: &StrStats, max_index: usize, payload: &[u8]) -> Result<Vec<Option<i64>>> {
    let index_stats = IntStats {
        item_count: stats.item_count,
        has_nulls: stats.has_nulls,
        min: Some(0),
        max: Some(max_index as i64),
    };
    int_codec::decompress(&index_stats, payload)
}

fn lookup<S: AsRef<str>>(indexes: &[Option<i64>], dictionary: &[S]) -> Result<Vec<Option<String>>> {
    indexes
        .iter()
        .map(|idx| match idx {
            None => Ok(None),
            Some(i) => dictionary
                .get(*i as usize)
                .map(|s| Some(s.as_ref().to_string()))
                .ok_or_else(|| TesseraError::Corrupt(format!("dictionary index {} out of range", i))),
        })
        .collect()
}

fn expect_empty(payload: &[u8]) -> Result<()> {
    if payload.is_empty() {
        Ok(())
    } else {
        Err(TesseraError::Corrupt(format!(
            "degenerate string column carries {} payload bytes",
            payload.len()
        )))
    }
}

fn string_len(s: &str) -> usize {
    varint_len(s.len() as u64) + s.len()
}

fn write_string(s: &str, out: &mut Vec<u8>) {
    write_varint(s.len() as u64, out);
    out.extend_from_slice(s.as_bytes());
}

fn read_string(bytes: &[u8], pos: &mut usize) -> Result<String> {
    let len = read_varint(bytes, pos)? as usize;
    let end = pos
        .checked_add(len)
        .filter(|end| *end <= bytes.len())
        .ok_or_else(|| TesseraError::Corrupt("string runs past end of payload".to_string()))?;
    let s = std::str::from_utf8(&bytes[*pos..end])
        .map_err(|e| TesseraError::Corrupt(format!("invalid UTF-8 in string payload: {}", e)))?
        .to_string();
    *pos = end;
    Ok(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owned(values: &[Option<&str>]) -> Vec<Option<String>> {
        values.iter().map(|v| v.map(String::from)).collect()
    }

    fn round_trip(values: &[Option<&str>]) -> EncodedStrs {
        let encoded = compress(values);
        assert_eq!(decompress(&encoded.stats, &encoded.payload).unwrap(), owned(values));
        encoded
    }

    #[test]
    fn test_single_value_without_nulls_is_empty() {
        let encoded = round_trip(&[Some("x"); 100]);
        assert!(encoded.payload.is_empty());
        assert_eq!(encoded.stats.min.as_deref(), Some("x"));
        assert_eq!(encoded.stats.max.as_deref(), Some("x"));
        assert!(!encoded.stats.has_nulls);
    }

    #[test]
    fn test_all_null_is_empty() {
        let encoded = round_trip(&[None, None]);
        assert!(encoded.payload.is_empty());
        assert!(encoded.stats.min.is_none());
    }

    #[test]
    fn test_single_value_with_nulls_is_bitmap_only() {
        let encoded = round_trip(&[Some("a"), None, Some("a"), None, Some("a")]);
        assert_eq!(encoded.payload.len(), 1);
    }

    #[test]
    fn test_pair_is_index_only() {
        let values: Vec<Option<&str>> = (0..64).map(|i| Some(if i % 2 == 0 { "no" } else { "yes" })).collect();
        let encoded = round_trip(&values);
        // mode byte + 64 one-bit indexes
        assert_eq!(encoded.payload.len(), 1 + 8);
    }

    #[test]
    fn test_dictionary_beats_plain_for_repeats() {
        let values: Vec<Option<&str>> = (0..200)
            .map(|i| match i % 4 {
                0 => Some("alpha-long-value"),
                1 => Some("beta-long-value"),
                2 => None,
                _ => Some("gamma-long-value"),
            })
            .collect();
        let encoded = round_trip(&values);
        assert_eq!(encoded.payload[0], MODE_DICT);
    }

    #[test]
    fn test_plain_for_unique_values() {
        let strings: Vec<String> = (0..50).map(|i| format!("v{}", i)).collect();
        let values: Vec<Option<&str>> = strings.iter().map(|s| Some(s.as_str())).collect();
        let encoded = round_trip(&values);
        assert_eq!(encoded.payload[0], MODE_PLAIN);
    }

    #[test]
    fn test_corrupt_payloads() {
        let encoded = compress(&[Some("a"), Some("b"), Some("c")]);
        let mut bad = encoded.payload.clone();
        bad.push(1);
        assert!(decompress(&encoded.stats, &bad).is_err());
        assert!(decompress(&encoded.stats, &[9]).is_err());
        assert!(decompress(&encoded.stats, &[]).is_err());
    }
}
