//! Growable stream buffer used once per connection direction.
//!
//! A [`StreamBuffer`] models a logically infinite byte sequence.  Two
//! absolute cursors describe it:
//!
//! ```text
//!   consumed          base                    next
//!  ──────────────────────┼───── buffered ───────┼──────────▶ stream index
//! ```
//!
//! - `base`: index of the first byte not yet consumed.
//! - `next`: index of the first byte not yet written.
//!
//! [`append`](StreamBuffer::append) extends at `next`;
//! [`copy_out`](StreamBuffer::copy_out) followed by
//! [`advance`](StreamBuffer::advance) consumes from `base`.  Only the bytes in
//! `[base, next)` are held in memory.  `base <= next` always.

use std::collections::VecDeque;

#[derive(Debug, Default)]
pub struct StreamBuffer {
    /// Absolute index of `data[0]`.
    base: u64,
    data: VecDeque<u8>,
}

impl StreamBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of the first unconsumed byte.
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Index of the first unwritten byte.
    pub fn next(&self) -> u64 {
        self.base + self.data.len() as u64
    }

    /// Number of buffered (produced but not consumed) bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// `true` when `base == next`.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Append `bytes` at `next`.
    pub fn append(&mut self, bytes: &[u8]) {
        self.data.extend(bytes.iter().copied());
    }

    /// Copy up to `dst.len()` bytes starting at absolute index `from` into
    /// `dst` without consuming them.  Returns the number of bytes copied.
    ///
    /// Copying starts no earlier than `base`; an index past `next` copies
    /// nothing.
    pub fn copy_out(&self, dst: &mut [u8], from: u64) -> usize {
        let start = from.saturating_sub(self.base) as usize;
        if start >= self.data.len() {
            return 0;
        }
        let n = dst.len().min(self.data.len() - start);
        let (head, tail) = self.data.as_slices();
        for (i, slot) in dst[..n].iter_mut().enumerate() {
            let idx = start + i;
            *slot = if idx < head.len() {
                head[idx]
            } else {
                tail[idx - head.len()]
            };
        }
        n
    }

    /// Consume `n` bytes from `base`.  Clamped to the buffered length.
    pub fn advance(&mut self, n: usize) -> usize {
        let n = n.min(self.data.len());
        self.data.drain(..n);
        self.base += n as u64;
        n
    }

    /// [`copy_out`](Self::copy_out) at `base` followed by
    /// [`advance`](Self::advance).
    pub fn read_into(&mut self, dst: &mut [u8]) -> usize {
        let n = self.copy_out(dst, self.base);
        self.advance(n)
    }

    /// Remove and return up to `max` bytes from `base`.
    pub fn take(&mut self, max: usize) -> Vec<u8> {
        let n = max.min(self.data.len());
        self.base += n as u64;
        self.data.drain(..n).collect()
    }
}
