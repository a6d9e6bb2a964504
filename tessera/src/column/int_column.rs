//! Physical integer column

use ahash::AHashSet;
use rayon::prelude::*;

use super::{shrink_sparse, PARALLEL_THRESHOLD};
use crate::codec::{int_codec, EncodedInts, IntStats};
use crate::data::BitVec;
use crate::query::CompareOp;
use crate::Result;

/// How an integer column represents nulls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NullRepr {
    /// Column never holds nulls
    None,
    /// Separate validity bitmap (bit set = value present)
    Bitmap,
    /// A reserved value stands for null
    Sentinel(i64),
}

/// Contiguous i64 values plus the null representation
#[derive(Debug, Clone)]
pub struct IntColumn {
    values: Vec<i64>,
    validity: BitVec,
    repr: NullRepr,
}

impl IntColumn {
    pub fn new(repr: NullRepr) -> Self {
        Self {
            values: Vec::new(),
            validity: BitVec::new(),
            repr,
        }
    }

    pub fn from_options(values: Vec<Option<i64>>, repr: NullRepr) -> Self {
        let mut col = Self::new(repr);
        col.values.reserve(values.len());
        for v in values {
            col.push(v);
        }
        col
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn repr(&self) -> NullRepr {
        self.repr
    }

    #[inline]
    pub fn is_null(&self, row: usize) -> bool {
        match self.repr {
            NullRepr::None => false,
            NullRepr::Bitmap => !self.validity.get(row),
            NullRepr::Sentinel(s) => self.values[row] == s,
        }
    }

    #[inline]
    pub fn get(&self, row: usize) -> Option<i64> {
        if self.is_null(row) {
            None
        } else {
            Some(self.values[row])
        }
    }

    /// Append a value. A null pushed into a column without a null
    /// representation is stored as 0; callers validate nullability first.
    pub fn push(&mut self, value: Option<i64>) {
        match (self.repr, value) {
            (NullRepr::Bitmap, v) => {
                self.validity.push(v.is_some());
                self.values.push(v.unwrap_or(0));
            }
            (NullRepr::Sentinel(s), None) => self.values.push(s),
            (_, v) => self.values.push(v.unwrap_or(0)),
        }
    }

    /// Remove the rows at ascending, unique positions
    pub fn delete_sorted(&mut self, rows: &[usize]) {
        if rows.is_empty() {
            return;
        }
        let mut drop = rows.iter().peekable();
        let mut i = 0usize;
        self.values.retain(|_| {
            let keep = drop.peek() != Some(&&i);
            if !keep {
                drop.next();
            }
            i += 1;
            keep
        });
        if self.repr == NullRepr::Bitmap {
            self.validity.remove_sorted(rows);
        }
        shrink_sparse(&mut self.values);
    }

    /// New column holding `rows` in the given order
    pub fn select(&self, rows: &[usize]) -> Self {
        let mut out = Self::new(self.repr);
        out.extend_rows(self, rows);
        out
    }

    pub fn extend_rows(&mut self, other: &IntColumn, rows: &[usize]) {
        self.values.reserve(rows.len());
        for &row in rows {
            self.push(other.get(row));
        }
    }

    pub fn extend(&mut self, other: &IntColumn) {
        if self.repr == other.repr && self.repr != NullRepr::Bitmap {
            self.values.extend_from_slice(&other.values);
            return;
        }
        for row in 0..other.len() {
            self.push(other.get(row));
        }
    }

    /// Rows whose value satisfies `op target`. A `None` target tests for
    /// null (Equal) or not-null (NotEqual).
    pub fn filter(&self, op: CompareOp, target: Option<i64>) -> Vec<usize> {
        let test = |row: usize| match target {
            None => match op {
                CompareOp::Equal => self.is_null(row),
                CompareOp::NotEqual => !self.is_null(row),
                _ => false,
            },
            Some(t) => !self.is_null(row) && op.matches(self.values[row].cmp(&t)),
        };
        if self.len() >= PARALLEL_THRESHOLD {
            (0..self.len()).into_par_iter().filter(|r| test(*r)).collect()
        } else {
            (0..self.len()).filter(|r| test(*r)).collect()
        }
    }

    pub fn filter_in(&self, targets: &AHashSet<i64>, include_nulls: bool) -> Vec<usize> {
        (0..self.len())
            .filter(|&row| match self.get(row) {
                Some(v) => targets.contains(&v),
                None => include_nulls,
            })
            .collect()
    }

    /// Physical values of the first `n` rows as codec input. Sentinel
    /// columns hand the sentinel through as an ordinary value.
    fn codec_input(&self, n: usize) -> Vec<Option<i64>> {
        match self.repr {
            NullRepr::Bitmap => (0..n).map(|row| self.get(row)).collect(),
            _ => self.values[..n].iter().map(|v| Some(*v)).collect(),
        }
    }

    pub fn encode(&self, n: usize) -> EncodedInts {
        int_codec::compress(&self.codec_input(n))
    }

    /// (has nulls, min, max) over the non-null values of the first `n` rows
    pub fn logical_stats(&self, n: usize) -> (bool, Option<i64>, Option<i64>) {
        let mut has_nulls = false;
        let mut min = None::<i64>;
        let mut max = None::<i64>;
        for row in 0..n {
            match self.get(row) {
                Some(v) => {
                    min = Some(min.map_or(v, |m| m.min(v)));
                    max = Some(max.map_or(v, |m| m.max(v)));
                }
                None => has_nulls = true,
            }
        }
        (has_nulls, min, max)
    }

    pub fn encoded_len(&self, n: usize) -> usize {
        let input = self.codec_input(n);
        let stats = IntStats::compute(&input);
        let non_null = input.iter().filter(|v| v.is_some()).count();
        int_codec::compressed_len(&stats, non_null)
    }

    pub fn decode(stats: &IntStats, payload: &[u8], repr: NullRepr) -> Result<Self> {
        let values = int_codec::decompress(stats, payload)?;
        let mut col = Self::new(repr);
        col.values.reserve(values.len());
        for v in values {
            match (repr, v) {
                (NullRepr::Sentinel(_), Some(v)) => col.values.push(v),
                (_, v) => col.push(v),
            }
        }
        Ok(col)
    }
}
