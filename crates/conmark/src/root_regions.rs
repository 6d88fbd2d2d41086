//! Root regions scanned before concurrent marking proper.
//!
//! Spans that must be fully scanned before marking starts (for example the
//! survivors of the pause that started the cycle). The objects in them are
//! not marked; only the objects they refer to are.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::{Condvar, Mutex};

/// An immutable `[start, end)` address span.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct MemRegion {
    start: usize,
    end: usize,
}

impl MemRegion {
    /// Create a span. `end` must not be below `start`.
    #[must_use]
    pub fn new(start: usize, end: usize) -> Self {
        debug_assert!(start <= end, "inverted region {start:#x}..{end:#x}");
        Self { start, end }
    }

    /// First address.
    #[must_use]
    pub const fn start(&self) -> usize {
        self.start
    }

    /// Exclusive end address.
    #[must_use]
    pub const fn end(&self) -> usize {
        self.end
    }

    /// Whether the span covers no bytes.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Length in bytes.
    #[must_use]
    pub const fn byte_size(&self) -> usize {
        self.end - self.start
    }

    /// Whether `addr` lies in `[start, end)`.
    #[must_use]
    pub const fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// A slot of the fixed root-region array.
#[derive(Default)]
struct Slot {
    start: AtomicUsize,
    end: AtomicUsize,
}

/// Fixed-capacity set of root regions, claimed through an atomic cursor.
pub struct RootRegions {
    slots: Box<[Slot]>,
    num_regions: AtomicUsize,
    claimed: AtomicUsize,
    should_abort: AtomicBool,
    scan_in_progress: AtomicBool,
    // Waiters block on this flag; it mirrors `scan_in_progress`.
    scan_lock: Mutex<bool>,
    scan_done: Condvar,
}

impl RootRegions {
    /// Create a tracker for at most `max_regions` regions.
    #[must_use]
    pub fn new(max_regions: usize) -> Self {
        Self {
            slots: (0..max_regions).map(|_| Slot::default()).collect(),
            num_regions: AtomicUsize::new(0),
            claimed: AtomicUsize::new(0),
            should_abort: AtomicBool::new(false),
            scan_in_progress: AtomicBool::new(false),
            scan_lock: Mutex::new(false),
            scan_done: Condvar::new(),
        }
    }

    /// Append a root region. Only valid during single-threaded setup, before
    /// [`prepare_for_scan`](Self::prepare_for_scan). Returns `false` if the
    /// tracker is full.
    pub fn add(&self, region: MemRegion) -> bool {
        debug_assert!(
            !self.scan_in_progress(),
            "root regions added while a scan is in progress"
        );
        let idx = self.num_regions.load(Ordering::Relaxed);
        let Some(slot) = self.slots.get(idx) else {
            return false;
        };
        slot.start.store(region.start, Ordering::Relaxed);
        slot.end.store(region.end, Ordering::Relaxed);
        self.num_regions.store(idx + 1, Ordering::Release);
        true
    }

    /// Number of regions added since the last reset.
    #[must_use]
    pub fn num_root_regions(&self) -> usize {
        self.num_regions.load(Ordering::Acquire)
    }

    /// Whether a region with exactly these bounds was added.
    #[must_use]
    pub fn contains(&self, region: MemRegion) -> bool {
        (0..self.num_root_regions()).any(|i| self.region_at(i) == region)
    }

    fn region_at(&self, idx: usize) -> MemRegion {
        let slot = &self.slots[idx];
        MemRegion {
            start: slot.start.load(Ordering::Relaxed),
            end: slot.end.load(Ordering::Relaxed),
        }
    }

    /// Forget all regions.
    pub fn reset(&self) {
        self.num_regions.store(0, Ordering::Release);
        self.claimed.store(0, Ordering::Release);
    }

    /// Reset the claim cursor and flag the scan as in progress.
    pub fn prepare_for_scan(&self) {
        debug_assert!(!self.scan_in_progress(), "root region scan already running");
        self.claimed.store(0, Ordering::Release);
        self.should_abort.store(false, Ordering::Release);
        let mut in_progress = self.scan_lock.lock();
        *in_progress = self.num_root_regions() > 0;
        self.scan_in_progress.store(*in_progress, Ordering::Release);
    }

    /// Claim the next unscanned region. Returns `None` once every region has
    /// been claimed, or immediately after [`abort`](Self::abort).
    pub fn claim_next(&self) -> Option<MemRegion> {
        if self.should_abort.load(Ordering::Acquire) {
            return None;
        }
        let num = self.num_root_regions();
        if self.claimed.load(Ordering::Relaxed) >= num {
            return None;
        }
        let idx = self.claimed.fetch_add(1, Ordering::AcqRel);
        (idx < num).then(|| self.region_at(idx))
    }

    /// Make every later claim fail.
    pub fn abort(&self) {
        self.should_abort.store(true, Ordering::Release);
    }

    /// Whether [`abort`](Self::abort) was called since the last reset.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.should_abort.load(Ordering::Acquire)
    }

    /// Whether a scan is prepared and not yet finished or cancelled.
    #[must_use]
    pub fn scan_in_progress(&self) -> bool {
        self.scan_in_progress.load(Ordering::Acquire)
    }

    /// Mark the scan finished and wake waiters. Clears the region set.
    pub fn scan_finished(&self) {
        debug_assert!(
            self.is_aborted() || self.claimed.load(Ordering::Acquire) >= self.num_root_regions(),
            "root region scan finished with unclaimed regions"
        );
        self.num_regions.store(0, Ordering::Release);
        self.notify_scan_done();
    }

    /// Wake waiters without clearing the region set.
    pub fn cancel_scan(&self) {
        self.notify_scan_done();
    }

    fn notify_scan_done(&self) {
        let mut in_progress = self.scan_lock.lock();
        *in_progress = false;
        self.scan_in_progress.store(false, Ordering::Release);
        self.scan_done.notify_all();
    }

    /// Block until the scan is finished or cancelled. Returns whether the
    /// caller had to wait.
    pub fn wait_until_scan_finished(&self) -> bool {
        if !self.scan_in_progress() {
            return false;
        }
        let mut in_progress = self.scan_lock.lock();
        while *in_progress {
            self.scan_done.wait(&mut in_progress);
        }
        true
    }
}

impl std::fmt::Debug for RootRegions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootRegions")
            .field("max_regions", &self.slots.len())
            .field("num_regions", &self.num_root_regions())
            .field("claimed", &self.claimed.load(Ordering::Relaxed))
            .field("scan_in_progress", &self.scan_in_progress())
            .field("should_abort", &self.is_aborted())
            .finish()
    }
}
