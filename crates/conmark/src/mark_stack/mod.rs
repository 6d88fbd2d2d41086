//! Global overflow mark stack.
//!
//! Work moves between tasks and this stack a chunk at a time. The stack keeps
//! two lock-free singly linked lists of chunks: `chunk_list` holds filled
//! chunks, `free_list` holds drained chunks ready for reuse. A chunk is either
//! on exactly one list or owned by the one thread filling or draining it.
//!
//! List heads pack a 32-bit version tag next to the chunk link so a pop cannot
//! succeed against a head that was popped and pushed back in between (ABA).

/// Chunk storage.
pub mod chunk;

use std::ptr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crossbeam::utils::CachePadded;

use crate::entry::TaskEntry;
use crate::error::MarkError;
pub use chunk::ChunkAllocator;
use chunk::ChunkId;

#[inline]
const fn pack(tag: u32, link: u32) -> u64 {
    ((tag as u64) << 32) | link as u64
}

#[inline]
#[allow(clippy::cast_possible_truncation)]
const fn unpack(head: u64) -> (u32, u32) {
    ((head >> 32) as u32, head as u32)
}

/// A Treiber stack of chunks.
struct ChunkList {
    head: CachePadded<AtomicU64>,
}

impl ChunkList {
    fn new() -> Self {
        Self {
            head: CachePadded::new(AtomicU64::new(0)),
        }
    }

    fn push(&self, alloc: &ChunkAllocator, id: ChunkId) {
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            let (tag, link) = unpack(head);
            alloc.set_next_link(id, link);
            let new = pack(tag.wrapping_add(1), id.to_link());
            match self
                .head
                .compare_exchange_weak(head, new, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(current) => head = current,
            }
        }
    }

    fn pop(&self, alloc: &ChunkAllocator) -> Option<ChunkId> {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            let (tag, link) = unpack(head);
            let id = ChunkId::from_link(link)?;
            let next = alloc.next_link(id);
            let new = pack(tag.wrapping_add(1), next);
            match self
                .head
                .compare_exchange_weak(head, new, Ordering::Acquire, Ordering::Acquire)
            {
                Ok(_) => return Some(id),
                Err(current) => head = current,
            }
        }
    }

    fn is_empty(&self) -> bool {
        unpack(self.head.load(Ordering::Acquire)).1 == 0
    }

    fn clear(&self) {
        let (tag, _) = unpack(self.head.load(Ordering::Relaxed));
        self.head.store(pack(tag.wrapping_add(1), 0), Ordering::Release);
    }
}

/// The global mark stack shared by all marking tasks.
pub struct MarkStack {
    allocator: ChunkAllocator,
    chunk_list: ChunkList,
    free_list: ChunkList,
    chunks_in_chunk_list: CachePadded<AtomicUsize>,
}

impl MarkStack {
    /// Create a stack of chunks holding `entries_per_chunk` entries each,
    /// starting at `min_chunks` chunks and growing up to `max_chunks`.
    ///
    /// # Errors
    ///
    /// See [`ChunkAllocator::new`].
    pub fn new(
        min_chunks: usize,
        max_chunks: usize,
        entries_per_chunk: usize,
    ) -> Result<Self, MarkError> {
        Ok(Self {
            allocator: ChunkAllocator::new(min_chunks, max_chunks, entries_per_chunk)?,
            chunk_list: ChunkList::new(),
            free_list: ChunkList::new(),
            chunks_in_chunk_list: CachePadded::new(AtomicUsize::new(0)),
        })
    }

    /// Entries per chunk.
    #[inline]
    #[must_use]
    pub const fn entries_per_chunk(&self) -> usize {
        self.allocator.entries_per_chunk()
    }

    /// The backing allocator.
    #[must_use]
    pub const fn allocator(&self) -> &ChunkAllocator {
        &self.allocator
    }

    /// Push up to `entries_per_chunk` entries as one chunk. Copying stops at
    /// the first `Null` entry.
    ///
    /// Returns `false` if no chunk could be obtained; the caller must then
    /// raise the overflow flag.
    pub fn par_push_chunk(&self, entries: &[TaskEntry]) -> bool {
        let epc = self.entries_per_chunk();
        debug_assert!(entries.len() <= epc, "too many entries for one chunk");

        let Some(id) = self
            .free_list
            .pop(&self.allocator)
            .or_else(|| self.allocator.allocate_new_chunk())
        else {
            return false;
        };

        let len = entries
            .iter()
            .position(|e| e.is_null())
            .unwrap_or(entries.len())
            .min(epc);
        let dst = self.allocator.entries(id);
        // SAFETY: the chunk is exclusively ours until it is linked below, and
        // it has room for `epc` entries.
        unsafe {
            ptr::copy_nonoverlapping(entries.as_ptr(), dst, len);
            if len < epc {
                dst.add(len).write(TaskEntry::Null);
            }
        }

        self.chunk_list.push(&self.allocator, id);
        self.chunks_in_chunk_list.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Pop one chunk into `out`, which must hold at least `entries_per_chunk`
    /// entries. A partially filled chunk is followed by a `Null` in `out`.
    ///
    /// Returns `false` if the stack is empty.
    pub fn par_pop_chunk(&self, out: &mut [TaskEntry]) -> bool {
        let epc = self.entries_per_chunk();
        debug_assert!(out.len() >= epc, "output buffer smaller than a chunk");

        let Some(id) = self.chunk_list.pop(&self.allocator) else {
            return false;
        };
        self.chunks_in_chunk_list.fetch_sub(1, Ordering::Relaxed);

        let src = self.allocator.entries(id);
        let mut len = 0;
        while len < epc {
            // SAFETY: slots up to the first Null (or all of them) were
            // written by the push that published this chunk.
            let entry = unsafe { src.add(len).read() };
            if entry.is_null() {
                break;
            }
            out[len] = entry;
            len += 1;
        }
        if len < out.len() {
            out[len] = TaskEntry::Null;
        }

        self.free_list.push(&self.allocator, id);
        true
    }

    /// Racy emptiness check, only good as a heuristic.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chunk_list.is_empty()
    }

    /// Racy number of chunks on the data list.
    #[must_use]
    pub fn size(&self) -> usize {
        self.chunks_in_chunk_list.load(Ordering::Relaxed)
    }

    /// Capacity in entries.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.allocator.capacity() * self.entries_per_chunk()
    }

    /// Capacity in chunks.
    #[must_use]
    pub fn capacity_chunks(&self) -> usize {
        self.allocator.capacity()
    }

    /// Drop every chunk and forget the allocator's high-water mark.
    ///
    /// Only valid while no task touches the stack.
    pub fn set_empty(&self) {
        self.chunks_in_chunk_list.store(0, Ordering::Relaxed);
        self.chunk_list.clear();
        self.free_list.clear();
        self.allocator.reset();
    }

    /// Double the capacity. The stack must be empty.
    ///
    /// # Errors
    ///
    /// See [`ChunkAllocator::try_expand`].
    pub fn expand(&self) -> Result<(), MarkError> {
        debug_assert!(self.is_empty(), "only an empty mark stack may expand");
        self.allocator.try_expand()
    }

    /// Switch allocation failure from "signal overflow" to "grow".
    pub fn set_should_grow(&self, grow: bool) {
        self.allocator.set_should_grow(grow);
    }
}

impl std::fmt::Debug for MarkStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarkStack")
            .field("allocator", &self.allocator)
            .field("chunks", &self.size())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::ObjRef;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::thread;

    fn obj(i: usize) -> TaskEntry {
        TaskEntry::from_obj(ObjRef::new(0x1000 + i * 8).unwrap())
    }

    #[test]
    fn test_partial_chunk_round_trip() {
        let stack = MarkStack::new(4, 4, 8).unwrap();
        let pushed: Vec<_> = (0..7).map(obj).collect();
        assert!(stack.par_push_chunk(&pushed));
        assert_eq!(stack.size(), 1);

        let mut out = vec![TaskEntry::Null; 8];
        assert!(stack.par_pop_chunk(&mut out));
        let popped: Vec<_> = out.iter().copied().take_while(|e| !e.is_null()).collect();
        assert_eq!(popped, pushed);
        assert!(out[7].is_null());
        assert!(stack.is_empty());
    }

    #[test]
    fn test_full_chunk_has_no_terminator() {
        let stack = MarkStack::new(2, 2, 4).unwrap();
        let pushed: Vec<_> = (0..4).map(obj).collect();
        assert!(stack.par_push_chunk(&pushed));
        let mut out = vec![TaskEntry::Null; 4];
        assert!(stack.par_pop_chunk(&mut out));
        assert_eq!(out, pushed);
    }

    #[test]
    fn test_push_stops_at_null() {
        let stack = MarkStack::new(2, 2, 4).unwrap();
        assert!(stack.par_push_chunk(&[obj(1), TaskEntry::Null, obj(2)]));
        let mut out = vec![TaskEntry::Null; 4];
        assert!(stack.par_pop_chunk(&mut out));
        assert_eq!(out[0], obj(1));
        assert!(out[1].is_null());
    }

    #[test]
    fn test_lifo_order_of_chunks() {
        let stack = MarkStack::new(4, 4, 2).unwrap();
        assert!(stack.par_push_chunk(&[obj(1)]));
        assert!(stack.par_push_chunk(&[obj(2)]));
        let mut out = vec![TaskEntry::Null; 2];
        assert!(stack.par_pop_chunk(&mut out));
        assert_eq!(out[0], obj(2));
        assert!(stack.par_pop_chunk(&mut out));
        assert_eq!(out[0], obj(1));
        assert!(!stack.par_pop_chunk(&mut out));
    }

    #[test]
    fn test_overflow_and_free_list_reuse() {
        let stack = MarkStack::new(2, 2, 2).unwrap();
        assert!(stack.par_push_chunk(&[obj(1)]));
        assert!(stack.par_push_chunk(&[obj(2)]));
        assert!(!stack.par_push_chunk(&[obj(3)]), "third chunk must overflow");

        let mut out = vec![TaskEntry::Null; 2];
        assert!(stack.par_pop_chunk(&mut out));
        // The drained chunk is reused without touching the allocator.
        assert!(stack.par_push_chunk(&[obj(4)]));
        assert_eq!(stack.size(), 2);
    }

    #[test]
    fn test_set_empty_and_expand() {
        let stack = MarkStack::new(2, 8, 2).unwrap();
        assert!(stack.par_push_chunk(&[obj(1)]));
        assert!(stack.par_push_chunk(&[obj(2)]));
        assert!(!stack.par_push_chunk(&[obj(3)]));

        stack.set_empty();
        assert!(stack.is_empty());
        assert_eq!(stack.size(), 0);
        stack.expand().unwrap();
        assert_eq!(stack.capacity_chunks(), 4);
        for i in 0..4 {
            assert!(stack.par_push_chunk(&[obj(i)]));
        }
        assert!(!stack.par_push_chunk(&[obj(9)]));
    }

    #[test]
    fn test_should_grow_avoids_overflow() {
        let stack = MarkStack::new(1, 4, 2).unwrap();
        stack.set_should_grow(true);
        for i in 0..4 {
            assert!(stack.par_push_chunk(&[obj(i)]));
        }
        assert!(!stack.par_push_chunk(&[obj(5)]));
        assert_eq!(stack.capacity_chunks(), 4);
    }

    #[test]
    fn test_concurrent_push_pop_preserves_entries() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 200;
        let stack = Arc::new(MarkStack::new(2048, 2048, 4).unwrap());

        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let stack = Arc::clone(&stack);
                thread::spawn(move || {
                    let mut popped = Vec::new();
                    let mut out = vec![TaskEntry::Null; 4];
                    for i in 0..PER_THREAD {
                        let base = (t * PER_THREAD + i) * 3;
                        assert!(stack.par_push_chunk(&[obj(base), obj(base + 1), obj(base + 2)]));
                        if i % 2 == 0 && stack.par_pop_chunk(&mut out) {
                            popped.extend(out.iter().copied().take_while(|e| !e.is_null()));
                        }
                    }
                    popped
                })
            })
            .collect();

        let mut counts: HashMap<TaskEntry, usize> = HashMap::new();
        for h in handles {
            for e in h.join().unwrap() {
                *counts.entry(e).or_default() += 1;
            }
        }
        let mut out = vec![TaskEntry::Null; 4];
        while stack.par_pop_chunk(&mut out) {
            for e in out.iter().copied().take_while(|e| !e.is_null()) {
                *counts.entry(e).or_default() += 1;
            }
        }

        assert_eq!(counts.len(), THREADS * PER_THREAD * 3);
        assert!(counts.values().all(|&c| c == 1));
    }
}
