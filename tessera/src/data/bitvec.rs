//! Packed bit vector used for validity bitmaps

/// Growable bit vector, 64 bits per word, LSB-first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BitVec {
    words: Vec<u64>,
    len: usize,
}

impl BitVec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(bits: usize) -> Self {
        Self {
            words: Vec::with_capacity((bits + 63) / 64),
            len: 0,
        }
    }

    /// `len` bits, all set to `value`
    pub fn filled(len: usize, value: bool) -> Self {
        let fill = if value { u64::MAX } else { 0 };
        let mut bits = Self {
            words: vec![fill; (len + 63) / 64],
            len,
        };
        bits.clear_tail();
        bits
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn push(&mut self, value: bool) {
        let word = self.len / 64;
        if word >= self.words.len() {
            self.words.push(0);
        }
        if value {
            self.words[word] |= 1u64 << (self.len % 64);
        }
        self.len += 1;
    }

    #[inline]
    pub fn get(&self, index: usize) -> bool {
        index < self.len && (self.words[index / 64] >> (index % 64)) & 1 == 1
    }

    #[inline]
    pub fn set(&mut self, index: usize, value: bool) {
        debug_assert!(index < self.len);
        let mask = 1u64 << (index % 64);
        if value {
            self.words[index / 64] |= mask;
        } else {
            self.words[index / 64] &= !mask;
        }
    }

    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn all(&self) -> bool {
        self.count_ones() == self.len
    }

    /// Keep only the bits at `rows`, in that order
    pub fn select(&self, rows: &[usize]) -> Self {
        let mut out = Self::with_capacity(rows.len());
        for &row in rows {
            out.push(self.get(row));
        }
        out
    }

    /// Drop the bits at the given ascending positions
    pub fn remove_sorted(&mut self, positions: &[usize]) {
        let mut drop = positions.iter().peekable();
        let mut out = Self::with_capacity(self.len.saturating_sub(positions.len()));
        for i in 0..self.len {
            if drop.peek() == Some(&&i) {
                drop.next();
                continue;
            }
            out.push(self.get(i));
        }
        *self = out;
    }

    pub fn extend(&mut self, other: &BitVec) {
        for i in 0..other.len {
            self.push(other.get(i));
        }
    }

    /// LSB-first byte image of the first `len` bits
    pub fn to_bytes(&self, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; (len + 7) / 8];
        for i in 0..len.min(self.len) {
            if self.get(i) {
                out[i / 8] |= 1 << (i % 8);
            }
        }
        out
    }

    pub fn from_bytes(bytes: &[u8], len: usize) -> Self {
        let mut bits = Self::with_capacity(len);
        for i in 0..len {
            bits.push(bytes.get(i / 8).map_or(false, |b| (b >> (i % 8)) & 1 == 1));
        }
        bits
    }

    pub fn shrink_to_fit(&mut self) {
        self.words.shrink_to_fit();
    }

    fn clear_tail(&mut self) {
        let rem = self.len % 64;
        if rem != 0 {
            if let Some(last) = self.words.last_mut() {
                *last &= (1u64 << rem) - 1;
            }
        }
    }
}
