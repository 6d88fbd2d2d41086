//! Mark bitmap covering the whole heap.
//!
//! One bit per heap word: the bit for an object is the bit of its first word.
//! Marking is an atomic `fetch_or`, so concurrent markers never need a lock
//! and setting a bit is idempotent.

use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::entry::{ObjRef, WORD_SIZE};

const BITS: usize = u64::BITS as usize;

/// Concurrent mark bitmap over `[base, base + size)`.
///
/// # Example
///
/// ```
/// use conmark::{MarkBitmap, ObjRef};
///
/// let bitmap = MarkBitmap::new(0x1000, 4096);
/// let obj = ObjRef::new(0x1010).unwrap();
/// assert!(bitmap.par_mark(obj));
/// assert!(!bitmap.par_mark(obj));
/// assert!(bitmap.is_marked(obj));
/// ```
#[derive(Debug)]
pub struct MarkBitmap {
    base: usize,
    size: usize,
    bitmap: Box<[AtomicU64]>,
}

impl MarkBitmap {
    /// Create a cleared bitmap for the heap range starting at `base`.
    ///
    /// # Panics
    ///
    /// Panics if `base` or `size` is not word aligned.
    #[must_use]
    pub fn new(base: usize, size: usize) -> Self {
        assert!(
            base % WORD_SIZE == 0 && size % WORD_SIZE == 0,
            "MarkBitmap range must be word aligned"
        );
        let words = (size / WORD_SIZE).div_ceil(BITS);
        Self {
            base,
            size,
            bitmap: (0..words).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    /// The covered address range.
    #[must_use]
    pub const fn covered(&self) -> Range<usize> {
        self.base..self.base + self.size
    }

    #[inline]
    fn bit_index(&self, addr: usize) -> usize {
        debug_assert!(
            addr >= self.base && addr < self.base + self.size,
            "address {addr:#x} outside of the marked heap"
        );
        (addr - self.base) / WORD_SIZE
    }

    #[inline]
    const fn addr_of(&self, bit: usize) -> usize {
        self.base + bit * WORD_SIZE
    }

    /// Mark `obj` if it is unmarked. Returns `true` if this call set the bit.
    #[inline]
    pub fn par_mark(&self, obj: ObjRef) -> bool {
        let bit = self.bit_index(obj.addr());
        let mask = 1u64 << (bit % BITS);
        let prev = self.bitmap[bit / BITS].fetch_or(mask, Ordering::AcqRel);
        prev & mask == 0
    }

    /// Whether `obj` is marked.
    #[inline]
    #[must_use]
    pub fn is_marked(&self, obj: ObjRef) -> bool {
        self.is_marked_addr(obj.addr())
    }

    /// Whether the word at `addr` is marked.
    #[inline]
    #[must_use]
    pub fn is_marked_addr(&self, addr: usize) -> bool {
        let bit = self.bit_index(addr);
        (self.bitmap[bit / BITS].load(Ordering::Acquire) >> (bit % BITS)) & 1 != 0
    }

    /// Address of the first marked word in `[from, limit)`.
    #[must_use]
    pub fn next_marked(&self, from: usize, limit: usize) -> Option<usize> {
        if from >= limit {
            return None;
        }
        let mut bit = self.bit_index(from);
        let end = (limit - self.base).div_ceil(WORD_SIZE).min(self.size / WORD_SIZE);
        while bit < end {
            let word = self.bitmap[bit / BITS].load(Ordering::Acquire) >> (bit % BITS);
            if word == 0 {
                bit = (bit / BITS + 1) * BITS;
                continue;
            }
            let found = bit + word.trailing_zeros() as usize;
            return (found < end).then(|| self.addr_of(found));
        }
        None
    }

    /// Visit every marked address in `range` in ascending order. Stops and
    /// returns `false` as soon as `f` returns `false`.
    pub fn iterate<F>(&self, range: Range<usize>, mut f: F) -> bool
    where
        F: FnMut(usize) -> bool,
    {
        let mut cur = range.start;
        while let Some(addr) = self.next_marked(cur, range.end) {
            if !f(addr) {
                return false;
            }
            cur = addr + WORD_SIZE;
        }
        true
    }

    /// Clear all marks in `range`.
    pub fn clear_range(&self, range: Range<usize>) {
        if range.start >= range.end {
            return;
        }
        let start = self.bit_index(range.start);
        let end = (range.end - self.base).div_ceil(WORD_SIZE).min(self.size / WORD_SIZE);
        let mut bit = start;
        while bit < end {
            let offset = bit % BITS;
            let span = (BITS - offset).min(end - bit);
            let word = &self.bitmap[bit / BITS];
            if span == BITS {
                word.store(0, Ordering::Release);
            } else {
                let mask = ((1u64 << span) - 1) << offset;
                word.fetch_and(!mask, Ordering::AcqRel);
            }
            bit += span;
        }
    }

    /// Clear the whole bitmap.
    pub fn clear_all(&self) {
        for word in &*self.bitmap {
            word.store(0, Ordering::Release);
        }
    }

    /// Number of marked words in `range`.
    #[must_use]
    pub fn count_marked(&self, range: Range<usize>) -> usize {
        let mut count = 0;
        self.iterate(range, |_| {
            count += 1;
            true
        });
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    const BASE: usize = 0x10_0000;

    fn obj(word: usize) -> ObjRef {
        ObjRef::new(BASE + word * WORD_SIZE).unwrap()
    }

    #[test]
    fn test_mark_is_idempotent() {
        let bitmap = MarkBitmap::new(BASE, 512 * WORD_SIZE);
        assert!(bitmap.par_mark(obj(3)));
        assert!(!bitmap.par_mark(obj(3)));
        assert!(bitmap.is_marked(obj(3)));
        assert!(!bitmap.is_marked(obj(4)));
    }

    #[test]
    fn test_concurrent_mark_sets_each_bit_once() {
        let bitmap = Arc::new(MarkBitmap::new(BASE, 512 * WORD_SIZE));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let bitmap = Arc::clone(&bitmap);
                thread::spawn(move || (0..512).filter(|&w| bitmap.par_mark(obj(w))).count())
            })
            .collect();
        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 512);
        assert_eq!(bitmap.count_marked(bitmap.covered()), 512);
    }

    #[test]
    fn test_next_marked_crosses_words() {
        let bitmap = MarkBitmap::new(BASE, 512 * WORD_SIZE);
        bitmap.par_mark(obj(1));
        bitmap.par_mark(obj(130));
        let end = BASE + 512 * WORD_SIZE;
        assert_eq!(bitmap.next_marked(BASE, end), Some(obj(1).addr()));
        assert_eq!(bitmap.next_marked(obj(2).addr(), end), Some(obj(130).addr()));
        assert_eq!(bitmap.next_marked(obj(2).addr(), obj(130).addr()), None);
        assert_eq!(bitmap.next_marked(obj(131).addr(), end), None);
    }

    #[test]
    fn test_iterate_stops_early() {
        let bitmap = MarkBitmap::new(BASE, 512 * WORD_SIZE);
        for w in [5, 70, 200, 300] {
            bitmap.par_mark(obj(w));
        }
        let mut seen = Vec::new();
        let finished = bitmap.iterate(bitmap.covered(), |addr| {
            seen.push(addr);
            seen.len() < 2
        });
        assert!(!finished);
        assert_eq!(seen, vec![obj(5).addr(), obj(70).addr()]);
    }

    #[test]
    fn test_clear_range_partial_words() {
        let bitmap = MarkBitmap::new(BASE, 512 * WORD_SIZE);
        for w in 0..512 {
            bitmap.par_mark(obj(w));
        }
        bitmap.clear_range(obj(10).addr()..obj(200).addr());
        assert!(bitmap.is_marked(obj(9)));
        assert!(!bitmap.is_marked(obj(10)));
        assert!(!bitmap.is_marked(obj(64)));
        assert!(!bitmap.is_marked(obj(199)));
        assert!(bitmap.is_marked(obj(200)));
        assert_eq!(bitmap.count_marked(bitmap.covered()), 512 - 190);

        bitmap.clear_all();
        assert_eq!(bitmap.count_marked(bitmap.covered()), 0);
    }
}
