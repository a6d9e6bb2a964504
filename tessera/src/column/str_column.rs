//! Physical string column

use ahash::AHashSet;
use rayon::prelude::*;

use super::{shrink_sparse, PARALLEL_THRESHOLD};
use crate::codec::{str_codec, EncodedStrs, StrStats};
use crate::query::CompareOp;
use crate::Result;

#[derive(Debug, Clone, Default)]
pub struct StrColumn {
    values: Vec<Option<String>>,
}

impl StrColumn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_options(values: Vec<Option<String>>) -> Self {
        Self { values }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    #[inline]
    pub fn get(&self, row: usize) -> Option<&str> {
        self.values[row].as_deref()
    }

    pub fn push(&mut self, value: Option<String>) {
        self.values.push(value);
    }

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
        shrink_sparse(&mut self.values);
    }

    pub fn select(&self, rows: &[usize]) -> Self {
        Self {
            values: rows.iter().map(|&r| self.values[r].clone()).collect(),
        }
    }

    pub fn extend_rows(&mut self, other: &StrColumn, rows: &[usize]) {
        self.values.extend(rows.iter().map(|&r| other.values[r].clone()));
    }

    pub fn extend(&mut self, other: &StrColumn) {
        self.values.extend_from_slice(&other.values);
    }

    pub fn filter(&self, op: CompareOp, target: Option<&str>) -> Vec<usize> {
        let test = |row: usize| match (target, self.values[row].as_deref()) {
            (None, v) => match op {
                CompareOp::Equal => v.is_none(),
                CompareOp::NotEqual => v.is_some(),
                _ => false,
            },
            (Some(_), None) => false,
            (Some(t), Some(v)) => op.matches(v.cmp(t)),
        };
        if self.len() >= PARALLEL_THRESHOLD {
            (0..self.len()).into_par_iter().filter(|r| test(*r)).collect()
        } else {
            (0..self.len()).filter(|r| test(*r)).collect()
        }
    }

    pub fn filter_in(&self, targets: &AHashSet<&str>, include_nulls: bool) -> Vec<usize> {
        (0..self.len())
            .filter(|&row| match self.get(row) {
                Some(v) => targets.contains(v),
                None => include_nulls,
            })
            .collect()
    }

    pub fn encode(&self, n: usize) -> EncodedStrs {
        str_codec::compress(&self.values[..n])
    }

    pub fn encoded_len(&self, n: usize) -> usize {
        self.encode(n).payload.len()
    }

    pub fn decode(stats: &StrStats, payload: &[u8]) -> Result<Self> {
        Ok(Self {
            values: str_codec::decompress(stats, payload)?,
        })
    }
}
