//! Collaborator contracts: the heap being marked and the worker pool.

use std::num::NonZeroUsize;
use std::ops::Range;

use crate::entry::ObjRef;
use crate::root_regions::MemRegion;

/// Index of a heap region.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct RegionIdx(usize);

impl RegionIdx {
    /// Region number `index`.
    #[inline]
    #[must_use]
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    /// Position of the region in the heap.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

/// The region-based heap the engine marks.
///
/// The heap is a contiguous reservation split into equally sized regions.
/// The engine never interprets object memory itself; everything it needs to
/// know about an object goes through this trait. Implementations must be
/// safe to query from all marking threads at once.
pub trait MarkHeap: Sync {
    /// The reserved heap range. Both ends are region aligned.
    fn reserved(&self) -> MemRegion;

    /// Size of one region in bytes. A power of two.
    fn region_size(&self) -> usize;

    /// Number of regions in the reserved range.
    fn num_regions(&self) -> usize {
        self.reserved().byte_size() / self.region_size()
    }

    /// The region containing `addr`.
    fn region_index(&self, addr: usize) -> RegionIdx {
        RegionIdx((addr - self.reserved().start()) / self.region_size())
    }

    /// First address of region `idx`.
    fn region_bottom(&self, idx: RegionIdx) -> usize {
        self.reserved().start() + idx.0 * self.region_size()
    }

    /// End of region `idx`.
    fn region_end(&self, idx: RegionIdx) -> usize {
        self.region_bottom(idx) + self.region_size()
    }

    /// The region's allocation top when the current cycle started. Objects
    /// at or above it are live by definition and are never marked.
    fn top_at_mark_start(&self, idx: RegionIdx) -> usize;

    /// Current allocation top of region `idx`. Everything between TAMS and
    /// top was allocated during the cycle.
    fn region_top(&self, idx: RegionIdx) -> usize {
        self.top_at_mark_start(idx)
    }

    /// Size of `obj` in words.
    fn object_size(&self, obj: ObjRef) -> usize;

    /// Visit every non-null reference field of `obj`.
    ///
    /// For objects reported by [`ref_array_len`](Self::ref_array_len) this
    /// visits the non-array fields only.
    fn for_each_reference(&self, obj: ObjRef, f: &mut impl FnMut(ObjRef));

    /// Element count if `obj` is a reference array that may be scanned in
    /// slices.
    fn ref_array_len(&self, _obj: ObjRef) -> Option<usize> {
        None
    }

    /// Visit the non-null elements of array `obj` with indices in `range`.
    fn for_each_array_element(
        &self,
        _obj: ObjRef,
        _range: Range<usize>,
        _f: &mut impl FnMut(ObjRef),
    ) {
    }

    /// Address of element `index` of array `obj`. Used as the continuation
    /// of a partially scanned array; must be word aligned and inside `obj`.
    fn array_element_addr(&self, obj: ObjRef, index: usize) -> NonZeroUsize;

    /// Map an address produced by [`array_element_addr`](Self::array_element_addr)
    /// back to its array and element index.
    fn resolve_array_element(&self, addr: usize) -> (ObjRef, usize);

    /// Visit every object starting in `[range.start(), range.end())`, in
    /// address order. Used to scan root regions.
    fn for_each_object(&self, range: MemRegion, f: &mut impl FnMut(ObjRef));

    /// Concurrent precleaning of discovered references. `keep_alive` greys a
    /// referent that must survive; the call should return early once
    /// `should_yield` reports `true`.
    fn preclean_discovered_references(
        &self,
        _keep_alive: &mut impl FnMut(ObjRef),
        _should_yield: &impl Fn() -> bool,
    ) {
    }

    /// Reference processing at remark. `is_alive` reports marked (or
    /// implicitly live) objects; `keep_alive` greys objects that must be
    /// resurrected.
    fn process_discovered_references(
        &self,
        _is_alive: &impl Fn(ObjRef) -> bool,
        _keep_alive: &mut impl FnMut(ObjRef),
    ) {
    }
}

/// Runs a parallel task body on a number of workers.
pub trait WorkerPool: Sync {
    /// Most workers a single [`run_task`](Self::run_task) may use.
    fn max_workers(&self) -> usize;

    /// Run `body(worker_id)` for every id in `0..num_workers` concurrently and
    /// return when all have finished.
    fn run_task(&self, num_workers: usize, body: &(dyn Fn(usize) + Sync));
}

/// A [`WorkerPool`] spawning scoped OS threads per task.
///
/// Worker 0 runs on the calling thread.
#[derive(Debug, Clone, Copy)]
pub struct ScopedWorkerPool {
    max_workers: usize,
}

impl ScopedWorkerPool {
    /// A pool running at most `max_workers` workers, at least one.
    #[must_use]
    pub fn new(max_workers: usize) -> Self {
        Self {
            max_workers: max_workers.max(1),
        }
    }
}

impl WorkerPool for ScopedWorkerPool {
    fn max_workers(&self) -> usize {
        self.max_workers
    }

    fn run_task(&self, num_workers: usize, body: &(dyn Fn(usize) + Sync)) {
        let num_workers = num_workers.clamp(1, self.max_workers);
        std::thread::scope(|scope| {
            for worker_id in 1..num_workers {
                scope.spawn(move || body(worker_id));
            }
            body(0);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_scoped_pool_runs_every_worker_once() {
        let pool = ScopedWorkerPool::new(4);
        let seen: Vec<AtomicUsize> = (0..4).map(|_| AtomicUsize::new(0)).collect();
        pool.run_task(4, &|id| {
            seen[id].fetch_add(1, Ordering::Relaxed);
        });
        assert!(seen.iter().all(|c| c.load(Ordering::Relaxed) == 1));
    }

    #[test]
    fn test_scoped_pool_clamps_workers() {
        let pool = ScopedWorkerPool::new(2);
        let count = AtomicUsize::new(0);
        pool.run_task(8, &|_| {
            count.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(count.load(Ordering::Relaxed), 2);
    }
}
