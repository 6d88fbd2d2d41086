//! Growable array-of-arrays chunk allocator.
//!
//! Bucket 0 holds `min_capacity` chunks; every later bucket doubles the total,
//! so bucket `k > 0` holds `min_capacity << (k - 1)` chunks. Growing appends a
//! bucket and never relocates an existing one, which keeps every issued chunk
//! valid across expansion.
//!
//! ```text
//! index:   0 .. m-1 | m .. 2m-1 | 2m .. 4m-1 | 4m .. 8m-1 | ...
//! bucket:      0    |     1     |     2      |     3      | ...
//! ```

use std::mem::size_of;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

use parking_lot::Mutex;
use sys_alloc::Reservation;

use crate::entry::TaskEntry;
use crate::error::MarkError;

/// Chunks are addressed by a 32-bit index so list heads can carry a version tag.
pub const MAX_CHUNKS: usize = u32::MAX as usize - 1;

/// Index of a chunk within the allocator.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub(crate) struct ChunkId(u32);

impl ChunkId {
    #[inline]
    pub(crate) const fn index(self) -> usize {
        self.0 as usize
    }

    /// Link encoding: 0 means "no chunk".
    #[inline]
    pub(crate) const fn to_link(self) -> u32 {
        self.0 + 1
    }

    #[inline]
    pub(crate) const fn from_link(link: u32) -> Option<Self> {
        if link == 0 {
            None
        } else {
            Some(Self(link - 1))
        }
    }
}

/// First slot of every chunk. It has the size of one entry, so a chunk of
/// `n` entries occupies `n + 1` entry slots.
#[repr(C)]
pub(crate) struct ChunkHeader {
    next: AtomicUsize,
    _reserved: usize,
}

const _: () = assert!(size_of::<ChunkHeader>() == size_of::<TaskEntry>());

/// Map a chunk index to `(bucket, offset within bucket)`.
///
/// `min_log2` is `log2(min_capacity)`.
#[inline]
#[must_use]
pub const fn bucket_for_index(min_log2: u32, index: usize) -> (usize, usize) {
    let min = 1usize << min_log2;
    if index < min {
        return (0, index);
    }
    let bucket = (index >> min_log2).ilog2() as usize + 1;
    (bucket, index - (min << (bucket - 1)))
}

/// Number of chunks held by `bucket`.
#[inline]
#[must_use]
pub const fn bucket_capacity(min_log2: u32, bucket: usize) -> usize {
    if bucket == 0 {
        1 << min_log2
    } else {
        1 << (min_log2 as usize + bucket - 1)
    }
}

/// Lock-free chunk allocator backing the global mark stack.
pub struct ChunkAllocator {
    entries_per_chunk: usize,
    chunk_bytes: usize,
    min_log2: u32,
    max_capacity: usize,
    /// Chunks addressable through reserved buckets.
    capacity: AtomicUsize,
    /// High-water mark of issued chunk indices. May run past `capacity`
    /// on failed allocations; `reset` brings it back to zero.
    size: AtomicUsize,
    should_grow: AtomicBool,
    buckets: Box<[AtomicPtr<u8>]>,
    /// Owns the bucket memory; only touched while expanding and on drop.
    reservations: Mutex<Vec<Reservation>>,
    #[cfg(test)]
    refuse_reservations: AtomicBool,
}

impl ChunkAllocator {
    /// Initialize an allocator for chunks of `entries_per_chunk` entries.
    ///
    /// `min_capacity` is rounded up to a power of two and `max_capacity` up
    /// to the next power-of-two multiple of it. Bucket 0 is reserved eagerly.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` for zero sizes or more than [`MAX_CHUNKS`] chunks, and
    /// `Reservation` if bucket 0 cannot be reserved.
    pub fn new(
        min_capacity: usize,
        max_capacity: usize,
        entries_per_chunk: usize,
    ) -> Result<Self, MarkError> {
        if min_capacity == 0 || entries_per_chunk == 0 {
            return Err(MarkError::InvalidConfig("chunk allocator sizes must be non-zero"));
        }
        let min = min_capacity
            .checked_next_power_of_two()
            .ok_or(MarkError::InvalidConfig("mark stack minimum capacity too large"))?;
        let max = max_capacity
            .max(min)
            .div_ceil(min)
            .checked_next_power_of_two()
            .and_then(|factor| factor.checked_mul(min))
            .filter(|&m| m <= MAX_CHUNKS)
            .ok_or(MarkError::InvalidConfig("mark stack maximum capacity too large"))?;
        let chunk_bytes = (entries_per_chunk + 1)
            .checked_mul(size_of::<TaskEntry>())
            .ok_or(MarkError::InvalidConfig("chunk size too large"))?;

        let min_log2 = min.ilog2();
        let num_buckets = (max / min).ilog2() as usize + 1;
        let buckets = (0..num_buckets)
            .map(|_| AtomicPtr::new(std::ptr::null_mut()))
            .collect();

        let allocator = Self {
            entries_per_chunk,
            chunk_bytes,
            min_log2,
            max_capacity: max,
            capacity: AtomicUsize::new(0),
            size: AtomicUsize::new(0),
            should_grow: AtomicBool::new(false),
            buckets,
            reservations: Mutex::new(Vec::with_capacity(num_buckets)),
            #[cfg(test)]
            refuse_reservations: AtomicBool::new(false),
        };
        allocator.try_expand()?;
        Ok(allocator)
    }

    /// Entries per chunk, excluding the link slot.
    #[inline]
    #[must_use]
    pub const fn entries_per_chunk(&self) -> usize {
        self.entries_per_chunk
    }

    /// Chunks addressable without further expansion.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    /// Capacity the allocator never grows past, rounded as in [`new`](Self::new).
    #[inline]
    #[must_use]
    pub const fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    /// Capacity of bucket 0, a power of two.
    #[inline]
    #[must_use]
    pub const fn min_capacity(&self) -> usize {
        1 << self.min_log2
    }

    /// Chunks handed out since the last reset.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed).min(self.capacity())
    }

    /// Reserved bytes across all buckets.
    #[must_use]
    pub fn reserved_bytes(&self) -> usize {
        self.capacity() * self.chunk_bytes
    }

    /// Allow `allocate_new_chunk` to grow instead of failing at capacity.
    pub fn set_should_grow(&self, grow: bool) {
        self.should_grow.store(grow, Ordering::Relaxed);
    }

    /// Whether allocation may grow past the current capacity.
    #[must_use]
    pub fn should_grow(&self) -> bool {
        self.should_grow.load(Ordering::Relaxed)
    }

    /// Forget all issued chunks. Buckets stay reserved for the next cycle.
    ///
    /// Only valid while no chunk is in use.
    pub fn reset(&self) {
        self.size.store(0, Ordering::Relaxed);
    }

    /// Issue a fresh chunk, or `None` if capacity is exhausted.
    ///
    /// Past `capacity` this grows only when `should_grow` is set; it never
    /// grows past `max_capacity`.
    pub(crate) fn allocate_new_chunk(&self) -> Option<ChunkId> {
        if self.size.load(Ordering::Relaxed) >= self.max_capacity {
            return None;
        }
        let index = self.size.fetch_add(1, Ordering::Relaxed);
        if index >= self.max_capacity {
            return None;
        }
        if index >= self.capacity() {
            if !self.should_grow() {
                return None;
            }
            self.grow_to_cover(index).ok()?;
        }

        #[allow(clippy::cast_possible_truncation)]
        let id = ChunkId(index as u32);
        // SAFETY: the index is below capacity, so its bucket is reserved,
        // and the fetch_add above made this chunk ours alone.
        unsafe { self.header(id).as_ref() }
            .next
            .store(0, Ordering::Relaxed);
        Some(id)
    }

    fn grow_to_cover(&self, index: usize) -> Result<(), MarkError> {
        while index >= self.capacity() {
            self.try_expand()?;
        }
        Ok(())
    }

    /// Double the capacity by reserving the next bucket.
    ///
    /// Growth while other threads issue chunks is serialized by an internal
    /// lock; callers outside of `should_grow` mode only expand an empty stack.
    ///
    /// # Errors
    ///
    /// `MarkStackExhausted` at `max_capacity`; `Reservation` if the OS refuses.
    pub fn try_expand(&self) -> Result<(), MarkError> {
        let mut reservations = self.reservations.lock();
        let capacity = self.capacity.load(Ordering::Relaxed);
        if capacity >= self.max_capacity {
            return Err(MarkError::MarkStackExhausted {
                max_chunks: self.max_capacity,
            });
        }

        let (bucket, offset) = bucket_for_index(self.min_log2, capacity);
        debug_assert_eq!(offset, 0, "capacity must end on a bucket boundary");
        let chunks = bucket_capacity(self.min_log2, bucket);
        let bytes = chunks * self.chunk_bytes;
        #[cfg(test)]
        if self.refuse_reservations.load(Ordering::Relaxed) {
            return Err(MarkError::Reservation {
                bytes,
                source: std::io::ErrorKind::OutOfMemory.into(),
            });
        }
        let reservation =
            Reservation::new(bytes).map_err(|source| MarkError::Reservation { bytes, source })?;

        self.buckets[bucket].store(reservation.as_ptr(), Ordering::Release);
        reservations.push(reservation);
        self.capacity.store(capacity + chunks, Ordering::Release);

        #[cfg(feature = "tracing")]
        crate::tracing::log_mark_stack_expanded(capacity, capacity + chunks);
        Ok(())
    }

    /// Make every later expansion fail as if the OS refused the memory.
    #[cfg(test)]
    pub(crate) fn refuse_reservations(&self) {
        self.refuse_reservations.store(true, Ordering::Relaxed);
    }

    /// Header of chunk `id`.
    ///
    /// The caller must only pass ids below `capacity`.
    #[inline]
    pub(crate) fn header(&self, id: ChunkId) -> NonNull<ChunkHeader> {
        let (bucket, offset) = bucket_for_index(self.min_log2, id.index());
        let base = self.buckets[bucket].load(Ordering::Acquire);
        debug_assert!(!base.is_null(), "chunk {id:?} lives in an unreserved bucket");
        // SAFETY: offset < bucket_capacity(bucket) and the bucket spans
        // bucket_capacity * chunk_bytes bytes.
        unsafe { NonNull::new_unchecked(base.add(offset * self.chunk_bytes).cast()) }
    }

    /// Entry slots of chunk `id`, `entries_per_chunk` long.
    #[inline]
    pub(crate) fn entries(&self, id: ChunkId) -> *mut TaskEntry {
        // SAFETY: the entries start one slot past the header.
        unsafe { self.header(id).as_ptr().cast::<TaskEntry>().add(1) }
    }

    #[inline]
    pub(crate) fn next_link(&self, id: ChunkId) -> u32 {
        // SAFETY: headers of issued chunks stay mapped for the allocator's lifetime.
        let link = unsafe { self.header(id).as_ref() }.next.load(Ordering::Relaxed);
        #[allow(clippy::cast_possible_truncation)]
        {
            link as u32
        }
    }

    #[inline]
    pub(crate) fn set_next_link(&self, id: ChunkId, link: u32) {
        // SAFETY: see `next_link`.
        unsafe { self.header(id).as_ref() }
            .next
            .store(link as usize, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for ChunkAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkAllocator")
            .field("entries_per_chunk", &self.entries_per_chunk)
            .field("capacity", &self.capacity())
            .field("max_capacity", &self.max_capacity)
            .field("size", &self.size())
            .finish_non_exhaustive()
    }
}
