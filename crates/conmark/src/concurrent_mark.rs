//! Marking cycle coordinator.
//!
//! [`ConcurrentMark`] drives one cycle at a time through its phases:
//!
//! ```text
//! Idle ─start─> ScanRootRegions ─> ConcurrentMark ─> Remark ─> Cleanup ─end─> Idle
//!                                        ^              │
//!                                        └── overflow ──┘
//! ```
//!
//! Marking threads share a [`MarkShared`]: the bitmap, the global mark stack,
//! one task queue per worker, the global finger and the flags the abort
//! protocol polls. Each worker drives its own `MarkingTask` through steps.
//!
//! Every phase operation serializes on an operation lock. Only
//! [`ConcurrentMark::concurrent_cycle_abort`] and
//! [`ConcurrentMark::abort_marking_threads`] bypass it so they can interrupt a
//! running phase.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use crossbeam::utils::CachePadded;
use parking_lot::Mutex;

use crate::bitmap::MarkBitmap;
use crate::config::MarkConfig;
use crate::entry::{ObjRef, TaskEntry, WORD_SIZE};
use crate::error::MarkError;
use crate::heap::{MarkHeap, RegionIdx, ScopedWorkerPool, WorkerPool};
use crate::mark_stack::MarkStack;
use crate::root_regions::{MemRegion, RootRegions};
use crate::satb::SatbQueueSet;
use crate::stats::{MarkMetrics, MarkMetricsSnapshot, RegionMarkStats, RegionStatsCache};
use crate::sync::{OverflowBarrier, TaskTerminator};
use crate::task::{MarkingTask, StealSeed, UNBOUNDED_STEP};
use crate::worklist::TaskQueue;

/// References kept alive by reference processing between two drains.
const REF_DRAIN_INTERVAL: usize = 1000;

/// Phase of the marking cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MarkPhase {
    /// No cycle in progress.
    #[default]
    Idle,
    /// Root regions are being scanned.
    ScanRootRegions,
    /// Concurrent marking, including precleaning.
    ConcurrentMark,
    /// The remark pause.
    Remark,
    /// The cleanup pause.
    Cleanup,
}

/// Result of a remark pause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemarkOutcome {
    /// Marking is complete.
    Completed,
    /// The global mark stack overflowed during remark. Marking state was
    /// reset and the cycle is back in [`MarkPhase::ConcurrentMark`]; run
    /// marking again before the next remark.
    RestartForOverflow,
}

/// State shared by all marking tasks of a [`ConcurrentMark`].
pub struct MarkShared<H> {
    heap: H,
    config: MarkConfig,
    heap_start: usize,
    heap_end: usize,

    bitmap: MarkBitmap,
    mark_stack: MarkStack,
    queues: Box<[TaskQueue<TaskEntry>]>,
    root_regions: RootRegions,
    satb: SatbQueueSet,
    region_stats: RegionMarkStats,
    metrics: MarkMetrics,

    finger: CachePadded<AtomicUsize>,
    has_overflown: CachePadded<AtomicBool>,
    has_aborted: AtomicBool,
    concurrent: AtomicBool,
    exhausted: AtomicBool,
    active_tasks: AtomicUsize,

    terminator: TaskTerminator,
    first_overflow_barrier: OverflowBarrier,
    second_overflow_barrier: OverflowBarrier,
}

impl<H: MarkHeap> MarkShared<H> {
    fn new(heap: H, config: MarkConfig) -> Result<Self, MarkError> {
        let reserved = heap.reserved();
        let region_size = heap.region_size();
        if !region_size.is_power_of_two() || region_size < WORD_SIZE {
            return Err(MarkError::InvalidConfig("region size must be a power of two"));
        }
        if reserved.is_empty()
            || reserved.start() % region_size != 0
            || reserved.byte_size() % region_size != 0
        {
            return Err(MarkError::InvalidConfig(
                "reserved heap range must be non-empty and region aligned",
            ));
        }
        let num_regions = heap.num_regions();
        let mark_stack = MarkStack::new(
            config.mark_stack_min_chunks,
            config.mark_stack_max_chunks,
            config.entries_per_chunk,
        )?;
        let n = config.num_workers;

        Ok(Self {
            config,
            heap_start: reserved.start(),
            heap_end: reserved.end(),
            bitmap: MarkBitmap::new(reserved.start(), reserved.byte_size()),
            mark_stack,
            queues: (0..n)
                .map(|_| TaskQueue::new(config.task_queue_capacity))
                .collect(),
            root_regions: RootRegions::new(num_regions),
            satb: SatbQueueSet::new(),
            region_stats: RegionMarkStats::new(num_regions),
            metrics: MarkMetrics::new(),
            finger: CachePadded::new(AtomicUsize::new(reserved.start())),
            has_overflown: CachePadded::new(AtomicBool::new(false)),
            has_aborted: AtomicBool::new(false),
            concurrent: AtomicBool::new(false),
            exhausted: AtomicBool::new(false),
            active_tasks: AtomicUsize::new(n),
            terminator: TaskTerminator::new(n),
            first_overflow_barrier: OverflowBarrier::new(n),
            second_overflow_barrier: OverflowBarrier::new(n),
            heap,
        })
    }

    /// The marked heap.
    #[inline]
    pub const fn heap(&self) -> &H {
        &self.heap
    }

    /// Configuration the engine was built with.
    #[inline]
    pub const fn config(&self) -> &MarkConfig {
        &self.config
    }

    /// The mark bitmap covering the reserved heap range.
    #[inline]
    pub const fn bitmap(&self) -> &MarkBitmap {
        &self.bitmap
    }

    /// The global mark stack.
    #[inline]
    pub const fn mark_stack(&self) -> &MarkStack {
        &self.mark_stack
    }

    /// Root regions of the current cycle.
    #[inline]
    pub const fn root_regions(&self) -> &RootRegions {
        &self.root_regions
    }

    /// Completed SATB buffers waiting to be drained by marking tasks.
    #[inline]
    pub const fn satb(&self) -> &SatbQueueSet {
        &self.satb
    }

    /// Per-region liveness found so far.
    #[inline]
    pub const fn region_stats(&self) -> &RegionMarkStats {
        &self.region_stats
    }

    /// Engine counters.
    #[inline]
    pub const fn metrics(&self) -> &MarkMetrics {
        &self.metrics
    }

    /// The global finger: every region below it has been claimed.
    #[inline]
    pub fn finger(&self) -> usize {
        self.finger.load(Ordering::Acquire)
    }

    /// Whether every region has been claimed.
    #[inline]
    pub fn out_of_regions(&self) -> bool {
        self.finger() >= self.heap_end
    }

    /// Whether a push failed since the last restart.
    #[inline]
    pub fn has_overflown(&self) -> bool {
        self.has_overflown.load(Ordering::Acquire)
    }

    /// Whether the cycle has been aborted.
    #[inline]
    pub fn has_aborted(&self) -> bool {
        self.has_aborted.load(Ordering::Acquire)
    }

    /// Whether tasks currently run concurrently with the mutator.
    #[inline]
    pub fn concurrent(&self) -> bool {
        self.concurrent.load(Ordering::Acquire)
    }

    /// Tasks taking part in the current phase.
    #[inline]
    pub fn active_tasks(&self) -> usize {
        self.active_tasks.load(Ordering::Acquire)
    }

    /// Whether `obj` is marked in the current cycle.
    pub fn is_marked(&self, obj: ObjRef) -> bool {
        self.in_heap(obj.addr()) && self.bitmap.is_marked(obj)
    }

    /// Whether `obj` is marked or was allocated at or above its region's TAMS.
    pub fn is_live(&self, obj: ObjRef) -> bool {
        let Some(region) = self.region_of(obj.addr()) else {
            return false;
        };
        obj.addr() >= self.heap.top_at_mark_start(region) || self.bitmap.is_marked(obj)
    }

    #[inline]
    const fn in_heap(&self, addr: usize) -> bool {
        addr >= self.heap_start && addr < self.heap_end
    }

    /// Region of `addr`, or `None` outside the reserved range.
    pub(crate) fn region_of(&self, addr: usize) -> Option<RegionIdx> {
        self.in_heap(addr).then(|| self.heap.region_index(addr))
    }

    pub(crate) fn queue(&self, worker_id: usize) -> &TaskQueue<TaskEntry> {
        &self.queues[worker_id]
    }

    pub(crate) fn queues(&self) -> &[TaskQueue<TaskEntry>] {
        &self.queues[..self.active_tasks().min(self.queues.len())]
    }

    pub(crate) const fn terminator(&self) -> &TaskTerminator {
        &self.terminator
    }

    /// Claim the next region by advancing the global finger past it.
    ///
    /// Returns `None` when the claimed region has nothing below TAMS, or when
    /// all regions are taken; callers tell them apart with
    /// [`out_of_regions`](Self::out_of_regions).
    pub(crate) fn claim_region(&self) -> Option<RegionIdx> {
        let mut finger = self.finger();
        while finger < self.heap_end {
            let region = self.heap.region_index(finger);
            let end = self.heap.region_end(region);
            match self
                .finger
                .compare_exchange_weak(finger, end, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    let bottom = self.heap.region_bottom(region);
                    return (self.heap.top_at_mark_start(region) > bottom).then_some(region);
                }
                Err(current) => finger = current,
            }
        }
        None
    }

    /// Set the mark bit of `obj`. Returns its region and size if this call
    /// marked it.
    fn try_mark(&self, obj: ObjRef) -> Option<(RegionIdx, usize)> {
        let region = self.region_of(obj.addr())?;
        if obj.addr() >= self.heap.top_at_mark_start(region) {
            return None;
        }
        self.bitmap
            .par_mark(obj)
            .then(|| (region, self.heap.object_size(obj)))
    }

    /// Mark `obj`, accounting its size through a task's stats cache.
    pub(crate) fn mark_in_bitmap(&self, cache: &mut RegionStatsCache, obj: ObjRef) -> bool {
        match self.try_mark(obj) {
            Some((region, words)) => {
                cache.add_live_words(&self.region_stats, region, words);
                true
            }
            None => false,
        }
    }

    /// Mark `obj`, accounting its size directly in the global statistics.
    pub(crate) fn mark_root(&self, obj: ObjRef) -> bool {
        match self.try_mark(obj) {
            Some((region, words)) => {
                self.region_stats.add(region, words, 0);
                true
            }
            None => false,
        }
    }

    /// Push a chunk to the global stack, raising the overflow flag if it is
    /// full.
    pub(crate) fn mark_stack_push(&self, entries: &[TaskEntry]) -> bool {
        if self.mark_stack.par_push_chunk(entries) {
            return true;
        }
        self.has_overflown.store(true, Ordering::Release);
        false
    }

    pub(crate) fn mark_stack_pop(&self, out: &mut [TaskEntry]) -> bool {
        self.mark_stack.par_pop_chunk(out)
    }

    pub(crate) fn mark_stack_empty(&self) -> bool {
        self.mark_stack.is_empty()
    }

    /// Steal one entry from another active task's queue.
    pub(crate) fn try_stealing(&self, worker_id: usize, seed: &mut StealSeed) -> Option<TaskEntry> {
        let n = self.active_tasks().min(self.queues.len());
        if n <= 1 {
            return None;
        }
        for _ in 0..2 * n {
            let victim = seed.next(n);
            if victim == worker_id {
                continue;
            }
            if let Some(entry) = self.queues[victim].steal() {
                return Some(entry);
            }
        }
        // Random probes can miss the last non-empty queue.
        (1..n)
            .map(|k| (worker_id + k) % n)
            .find_map(|victim| self.queues[victim].steal())
    }

    pub(crate) fn enter_first_sync_barrier(&self) -> bool {
        self.first_overflow_barrier.enter()
    }

    pub(crate) fn enter_second_sync_barrier(&self) {
        self.second_overflow_barrier.enter();
    }

    /// Reset the traversal after a mark stack overflow: empty every queue and
    /// the global stack, grow the stack if possible and move the finger back
    /// to the heap start. Marks already set are kept.
    pub(crate) fn reset_marking_for_restart(&self) {
        self.mark_stack.set_empty();
        let mut expansion_failed = false;
        if self.has_overflown() {
            if let Err(err @ MarkError::Reservation { .. }) = self.mark_stack.expand() {
                self.metrics.record_expansion_failure();
                #[cfg(feature = "tracing")]
                crate::tracing::log_mark_stack_expansion_failed(&err);
                drop(err);
                expansion_failed = true;
            }
            self.region_stats.clear_during_overflow();
        }
        let restarts = self.metrics.record_overflow_restart();
        if let Some(limit) = self.config.max_overflow_restarts {
            let cannot_grow = expansion_failed
                || self.mark_stack.capacity_chunks() >= self.mark_stack.allocator().max_capacity();
            if restarts > limit && cannot_grow {
                self.exhausted.store(true, Ordering::Release);
                self.has_aborted.store(true, Ordering::Release);
            }
        }
        for queue in &self.queues {
            queue.set_empty();
        }
        self.finger.store(self.heap_start, Ordering::Release);
        self.has_overflown.store(false, Ordering::Release);

        #[cfg(feature = "tracing")]
        crate::tracing::log_overflow_restart(restarts, self.mark_stack.capacity_chunks());
    }

    fn set_concurrency_and_phase(&self, active_tasks: usize, concurrent: bool) {
        self.active_tasks.store(active_tasks, Ordering::Release);
        self.terminator.reset_for_reuse(active_tasks);
        self.first_overflow_barrier.set_n_workers(active_tasks);
        self.second_overflow_barrier.set_n_workers(active_tasks);
        self.concurrent.store(concurrent, Ordering::Release);
    }

    fn reset_for_cycle(&self) {
        self.has_overflown.store(false, Ordering::Release);
        self.has_aborted.store(false, Ordering::Release);
        self.exhausted.store(false, Ordering::Release);
        self.finger.store(self.heap_start, Ordering::Release);
        self.mark_stack.set_empty();
        self.mark_stack.set_should_grow(false);
        for queue in &self.queues {
            queue.set_empty();
        }
        self.region_stats.clear_all();
        self.root_regions.reset();
        self.satb.abandon_completed_buffers();
    }

    fn exhausted(&self) -> bool {
        self.exhausted.load(Ordering::Acquire)
    }

    fn exhausted_error(&self) -> MarkError {
        MarkError::MarkStackExhausted {
            max_chunks: self.mark_stack.allocator().max_capacity(),
        }
    }

    /// Error for a phase cut short, if any.
    fn interruption(&self) -> Option<MarkError> {
        if self.exhausted() {
            Some(self.exhausted_error())
        } else if self.has_aborted() {
            Some(MarkError::CycleAborted)
        } else {
            None
        }
    }

    fn for_each_field(&self, obj: ObjRef, f: &mut impl FnMut(ObjRef)) {
        self.heap.for_each_reference(obj, f);
        if let Some(len) = self.heap.ref_array_len(obj) {
            self.heap.for_each_array_element(obj, 0..len, f);
        }
    }

    /// Mark everything referenced from objects in `region`.
    fn scan_root_region(&self, region: MemRegion, cache: &mut RegionStatsCache) {
        self.heap.for_each_object(region, &mut |obj| {
            if self.root_regions.is_aborted() {
                return;
            }
            self.for_each_field(obj, &mut |child| {
                self.mark_in_bitmap(cache, child);
            });
        });
    }
}

impl<H> std::fmt::Debug for MarkShared<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarkShared")
            .field("heap_start", &format_args!("{:#x}", self.heap_start))
            .field("heap_end", &format_args!("{:#x}", self.heap_end))
            .field("finger", &format_args!("{:#x}", self.finger.load(Ordering::Relaxed)))
            .field("has_overflown", &self.has_overflown.load(Ordering::Relaxed))
            .field("has_aborted", &self.has_aborted.load(Ordering::Relaxed))
            .field("mark_stack", &self.mark_stack)
            .finish_non_exhaustive()
    }
}

/// Run steps until the task finishes without an abort, or an overflow or
/// cycle abort makes further steps pointless.
fn drain_serially<H: MarkHeap>(
    shared: &MarkShared<H>,
    task: &mut MarkingTask,
    time_target: std::time::Duration,
    do_termination: bool,
) {
    loop {
        task.do_marking_step(shared, time_target, do_termination, true);
        if !task.has_aborted() || shared.has_overflown() || shared.has_aborted() {
            break;
        }
    }
}

/// Concurrent marking engine for one heap.
///
/// # Example
///
/// ```
/// use conmark::{ConcurrentMark, MarkConfig, ModelHeap};
///
/// let heap = ModelHeap::new(4, 64 * 1024);
/// let leaf = heap.alloc(0, 2, &[]);
/// let root = heap.alloc(1, 2, &[leaf]);
/// let garbage = heap.alloc(2, 2, &[]);
/// heap.snapshot_tams();
///
/// let cm = ConcurrentMark::new(heap, MarkConfig::new(2)).unwrap();
/// cm.concurrent_cycle_start().unwrap();
/// cm.mark_root(root);
/// cm.run_cycle().unwrap();
///
/// assert!(cm.is_marked(leaf));
/// assert!(!cm.is_marked(garbage));
/// ```
pub struct ConcurrentMark<H: MarkHeap, P: WorkerPool = ScopedWorkerPool> {
    shared: MarkShared<H>,
    tasks: Box<[Mutex<MarkingTask>]>,
    pool: P,
    phase: Mutex<MarkPhase>,
    op_lock: Mutex<()>,
    cycle: AtomicU64,
    bitmap_dirty: AtomicBool,
    restart_for_overflow: AtomicBool,
}

impl<H: MarkHeap> ConcurrentMark<H> {
    /// Create an engine running its tasks on scoped threads.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if `config` or the heap geometry is invalid, and
    /// `Reservation` if the global mark stack cannot be reserved.
    pub fn new(heap: H, config: MarkConfig) -> Result<Self, MarkError> {
        Self::with_pool(heap, config, ScopedWorkerPool::new(config.num_workers))
    }
}

impl<H: MarkHeap, P: WorkerPool> ConcurrentMark<H, P> {
    /// Create an engine running its tasks on `pool`.
    ///
    /// # Errors
    ///
    /// See [`ConcurrentMark::new`].
    pub fn with_pool(heap: H, config: MarkConfig, pool: P) -> Result<Self, MarkError> {
        config.validate()?;
        let shared = MarkShared::new(heap, config)?;
        let tasks = (0..config.num_workers)
            .map(|id| {
                Mutex::new(MarkingTask::new(
                    id,
                    config.entries_per_chunk,
                    config.stats_cache_entries,
                ))
            })
            .collect();
        Ok(Self {
            shared,
            tasks,
            pool,
            phase: Mutex::new(MarkPhase::Idle),
            op_lock: Mutex::new(()),
            cycle: AtomicU64::new(0),
            bitmap_dirty: AtomicBool::new(false),
            restart_for_overflow: AtomicBool::new(false),
        })
    }

    /// The heap being marked.
    #[inline]
    pub const fn heap(&self) -> &H {
        self.shared.heap()
    }

    #[inline]
    pub const fn config(&self) -> &MarkConfig {
        self.shared.config()
    }

    /// State shared by the marking tasks.
    #[inline]
    pub const fn shared(&self) -> &MarkShared<H> {
        &self.shared
    }

    /// The mark bitmap.
    #[inline]
    pub const fn bitmap(&self) -> &MarkBitmap {
        self.shared.bitmap()
    }

    #[inline]
    pub const fn mark_stack(&self) -> &MarkStack {
        self.shared.mark_stack()
    }

    /// The SATB queue set the mutator's write barrier feeds.
    #[inline]
    pub const fn satb(&self) -> &SatbQueueSet {
        self.shared.satb()
    }

    #[inline]
    pub const fn root_regions(&self) -> &RootRegions {
        self.shared.root_regions()
    }

    /// Current cycle phase.
    pub fn phase(&self) -> MarkPhase {
        *self.phase.lock()
    }

    /// Number of cycles started so far.
    pub fn cycle(&self) -> u64 {
        self.cycle.load(Ordering::Acquire)
    }

    /// Whether the last remark found an overflow and restarted marking.
    pub fn restart_for_overflow(&self) -> bool {
        self.restart_for_overflow.load(Ordering::Acquire)
    }

    /// A snapshot of the engine counters and the reserved mark stack size.
    pub fn metrics(&self) -> MarkMetricsSnapshot {
        let mut snapshot = self.shared.metrics().snapshot();
        snapshot.mark_stack_reserved_bytes = self.shared.mark_stack.allocator().reserved_bytes();
        snapshot
    }

    fn active_workers(&self) -> usize {
        self.tasks.len().min(self.pool.max_workers()).max(1)
    }

    fn check_phase(&self, expected: MarkPhase) -> Result<(), MarkError> {
        let actual = self.phase();
        if actual == expected {
            Ok(())
        } else {
            Err(MarkError::InvalidPhase { expected, actual })
        }
    }

    fn transition(&self, from: MarkPhase, to: MarkPhase) -> Result<(), MarkError> {
        let mut phase = self.phase.lock();
        if *phase != from {
            return Err(MarkError::InvalidPhase {
                expected: from,
                actual: *phase,
            });
        }
        *phase = to;
        drop(phase);
        #[cfg(feature = "tracing")]
        crate::tracing::log_phase_transition(from, to);
        Ok(())
    }

    /// Run `body` on `n` workers, each holding its own task.
    fn run_tasks<F>(&self, n: usize, body: F)
    where
        F: Fn(&MarkShared<H>, &mut MarkingTask) + Sync,
    {
        self.pool.run_task(n, &|worker_id| {
            let mut task = self.tasks[worker_id].lock();
            body(&self.shared, &mut task);
        });
    }

    /// Start a cycle: clear the bitmap if a previous cycle left marks, reset
    /// all marking state and activate SATB recording.
    ///
    /// # Errors
    ///
    /// `InvalidPhase` unless idle, and `CycleAborted` if the bitmap clear
    /// was aborted.
    pub fn concurrent_cycle_start(&self) -> Result<(), MarkError> {
        let _op = self.op_lock.lock();
        self.check_phase(MarkPhase::Idle)?;
        self.shared.has_aborted.store(false, Ordering::Release);
        if self.bitmap_dirty.load(Ordering::Acquire) {
            self.clear_bitmap_locked()?;
        }
        self.shared.reset_for_cycle();
        for task in &*self.tasks {
            task.lock().reset();
        }
        self.restart_for_overflow.store(false, Ordering::Release);
        self.shared.satb.set_active(true);
        self.cycle.fetch_add(1, Ordering::AcqRel);
        self.bitmap_dirty.store(true, Ordering::Release);
        self.transition(MarkPhase::Idle, MarkPhase::ScanRootRegions)
    }

    /// Record a region whose objects' referents must be marked before
    /// concurrent marking starts.
    ///
    /// # Errors
    ///
    /// `InvalidPhase` outside [`MarkPhase::ScanRootRegions`], and
    /// `InvalidConfig` if more regions are added than the heap has.
    pub fn add_root_region(&self, region: MemRegion) -> Result<(), MarkError> {
        self.check_phase(MarkPhase::ScanRootRegions)?;
        if self.shared.root_regions.add(region) {
            Ok(())
        } else {
            Err(MarkError::InvalidConfig("too many root regions"))
        }
    }

    /// Mark a root object. Valid until marking starts; objects at or above
    /// TAMS are ignored. Returns whether this call marked it.
    pub fn mark_root(&self, obj: ObjRef) -> bool {
        self.shared.mark_root(obj)
    }

    /// Scan all root regions in parallel, marking what they reference.
    ///
    /// # Errors
    ///
    /// `InvalidPhase` outside [`MarkPhase::ScanRootRegions`], and
    /// `CycleAborted` if the scan was aborted.
    pub fn scan_root_regions(&self) -> Result<(), MarkError> {
        let _op = self.op_lock.lock();
        self.check_phase(MarkPhase::ScanRootRegions)?;
        #[cfg(feature = "tracing")]
        let _span = crate::tracing::span_phase(MarkPhase::ScanRootRegions, self.cycle()).entered();
        let start = Instant::now();

        let root_regions = &self.shared.root_regions;
        root_regions.prepare_for_scan();
        let num_regions = root_regions.num_root_regions();
        if num_regions > 0 {
            let n = self.active_workers().min(num_regions);
            self.run_tasks(n, |shared, task| {
                while let Some(region) = shared.root_regions.claim_next() {
                    shared.scan_root_region(region, task.stats_cache());
                }
                task.flush_stats_cache(shared);
                task.flush_counts(shared.metrics());
            });
        }

        let aborted = root_regions.is_aborted() || self.shared.has_aborted();
        if aborted {
            root_regions.cancel_scan();
        } else {
            root_regions.scan_finished();
        }
        self.shared
            .metrics
            .record_phase(MarkPhase::ScanRootRegions, start.elapsed());
        #[cfg(feature = "tracing")]
        crate::tracing::log_root_region_scan_done(num_regions, aborted);

        if aborted {
            return Err(MarkError::CycleAborted);
        }
        self.transition(MarkPhase::ScanRootRegions, MarkPhase::ConcurrentMark)
    }

    /// Block until a running root-region scan is finished or cancelled.
    /// Returns whether the caller had to wait.
    pub fn wait_until_root_region_scan_finished(&self) -> bool {
        self.shared.root_regions.wait_until_scan_finished()
    }

    /// Concurrent marking on all workers, until the traversal is complete.
    /// Overflows are handled internally by restarting.
    ///
    /// # Errors
    ///
    /// `InvalidPhase` outside [`MarkPhase::ConcurrentMark`], `CycleAborted`
    /// on abort, and `MarkStackExhausted` once the restart budget is spent.
    pub fn mark_from_roots(&self) -> Result<(), MarkError> {
        let _op = self.op_lock.lock();
        self.check_phase(MarkPhase::ConcurrentMark)?;
        #[cfg(feature = "tracing")]
        let _span = crate::tracing::span_phase(MarkPhase::ConcurrentMark, self.cycle()).entered();
        let start = Instant::now();

        self.restart_for_overflow.store(false, Ordering::Release);
        let n = self.active_workers();
        self.shared.set_concurrency_and_phase(n, true);
        let step = self.shared.config.step_duration;
        self.run_tasks(n, |shared, task| loop {
            task.do_marking_step(shared, step, true, false);
            if shared.has_aborted() || !task.has_aborted() {
                break;
            }
            std::thread::yield_now();
        });

        self.shared
            .metrics
            .record_phase(MarkPhase::ConcurrentMark, start.elapsed());
        self.shared.interruption().map_or(Ok(()), Err)
    }

    /// Concurrently preclean discovered references on a single task.
    ///
    /// # Errors
    ///
    /// As [`mark_from_roots`](Self::mark_from_roots).
    pub fn preclean(&self) -> Result<(), MarkError> {
        let _op = self.op_lock.lock();
        self.check_phase(MarkPhase::ConcurrentMark)?;
        let start = Instant::now();

        let shared = &self.shared;
        shared.set_concurrency_and_phase(1, true);
        let step = shared.config.step_duration;
        let mut task = self.tasks[0].lock();
        let mut since_drain = 0;
        shared.heap.preclean_discovered_references(
            &mut |obj| {
                task.deal_with_reference(shared, obj);
                since_drain += 1;
                if since_drain >= REF_DRAIN_INTERVAL {
                    since_drain = 0;
                    drain_serially(shared, &mut task, step, false);
                }
            },
            &|| shared.has_aborted(),
        );
        drain_serially(shared, &mut task, UNBOUNDED_STEP, true);
        drop(task);

        shared
            .metrics
            .record_phase(MarkPhase::ConcurrentMark, start.elapsed());
        shared.interruption().map_or(Ok(()), Err)
    }

    /// The remark pause: finish marking with the mutator stopped, then
    /// process discovered references and deactivate SATB.
    ///
    /// On overflow the marking state is reset and the cycle returns to
    /// [`MarkPhase::ConcurrentMark`].
    ///
    /// # Errors
    ///
    /// `InvalidPhase` outside [`MarkPhase::ConcurrentMark`], `CycleAborted` on
    /// abort, and `MarkStackExhausted` if reference processing overflows the
    /// stack at its maximum size or the restart budget is spent.
    pub fn remark(&self) -> Result<RemarkOutcome, MarkError> {
        let _op = self.op_lock.lock();
        self.transition(MarkPhase::ConcurrentMark, MarkPhase::Remark)?;
        #[cfg(feature = "tracing")]
        let _span = crate::tracing::span_phase(MarkPhase::Remark, self.cycle()).entered();
        let start = Instant::now();

        let result = self.remark_locked();
        self.shared
            .metrics
            .record_phase(MarkPhase::Remark, start.elapsed());
        result
    }

    fn remark_locked(&self) -> Result<RemarkOutcome, MarkError> {
        let shared = &self.shared;
        let n = self.active_workers();
        shared.set_concurrency_and_phase(n, false);
        self.run_tasks(n, |shared, task| loop {
            task.do_marking_step(shared, UNBOUNDED_STEP, true, false);
            if !task.has_aborted() || shared.has_overflown() || shared.has_aborted() {
                break;
            }
        });
        if let Some(err) = shared.interruption() {
            return Err(err);
        }

        if shared.has_overflown() {
            self.restart_for_overflow.store(true, Ordering::Release);
            shared.reset_marking_for_restart();
            #[cfg(feature = "tracing")]
            crate::tracing::log_remark_restart(shared.metrics.overflow_restarts());
            if let Some(err) = shared.interruption() {
                return Err(err);
            }
            self.transition(MarkPhase::Remark, MarkPhase::ConcurrentMark)?;
            return Ok(RemarkOutcome::RestartForOverflow);
        }

        self.weak_refs_work()?;
        shared.satb.set_active(false);
        shared.satb.abandon_completed_buffers();
        Ok(RemarkOutcome::Completed)
    }

    /// Reference processing with the mark stack allowed to grow to its
    /// maximum. An overflow here cannot be recovered by restarting.
    fn weak_refs_work(&self) -> Result<(), MarkError> {
        let shared = &self.shared;
        shared.mark_stack.set_should_grow(true);
        shared.set_concurrency_and_phase(1, false);

        let mut task = self.tasks[0].lock();
        let mut since_drain = 0;
        shared.heap.process_discovered_references(
            &|obj| shared.is_live(obj),
            &mut |obj| {
                task.deal_with_reference(shared, obj);
                since_drain += 1;
                if since_drain >= REF_DRAIN_INTERVAL {
                    since_drain = 0;
                    drain_serially(shared, &mut task, UNBOUNDED_STEP, false);
                }
            },
        );
        drain_serially(shared, &mut task, UNBOUNDED_STEP, true);
        drop(task);
        shared.mark_stack.set_should_grow(false);

        if shared.has_overflown() {
            shared.mark_stack.set_empty();
            shared.has_overflown.store(false, Ordering::Release);
            return Err(shared.exhausted_error());
        }
        Ok(())
    }

    /// The cleanup pause. Returns the regions without live objects.
    ///
    /// # Errors
    ///
    /// `InvalidPhase` unless the last remark completed.
    pub fn cleanup(&self) -> Result<Vec<RegionIdx>, MarkError> {
        let _op = self.op_lock.lock();
        self.transition(MarkPhase::Remark, MarkPhase::Cleanup)?;
        #[cfg(feature = "tracing")]
        let _span = crate::tracing::span_phase(MarkPhase::Cleanup, self.cycle()).entered();
        let start = Instant::now();

        let empty = (0..self.heap().num_regions())
            .map(RegionIdx::new)
            .filter(|&region| !self.contains_live_object(region))
            .collect();

        self.shared
            .metrics
            .record_phase(MarkPhase::Cleanup, start.elapsed());
        Ok(empty)
    }

    /// End the cycle after cleanup.
    ///
    /// # Errors
    ///
    /// `InvalidPhase` outside [`MarkPhase::Cleanup`].
    pub fn concurrent_cycle_end(&self) -> Result<(), MarkError> {
        let _op = self.op_lock.lock();
        self.transition(MarkPhase::Cleanup, MarkPhase::Idle)?;
        self.shared.concurrent.store(false, Ordering::Release);
        self.shared.metrics.record_cycle_completed();
        #[cfg(feature = "tracing")]
        crate::tracing::log_cycle_end(self.cycle(), false, self.shared.metrics.overflow_restarts());
        Ok(())
    }

    /// Abort the running cycle from any thread. Marking threads stop at
    /// their next poll, the running operation returns `CycleAborted`, SATB
    /// recording stops and the cycle goes back to idle. Marks stay in the
    /// bitmap until the next cycle start clears them.
    ///
    /// Returns `false` if no cycle was running.
    pub fn concurrent_cycle_abort(&self) -> bool {
        let previous = std::mem::replace(&mut *self.phase.lock(), MarkPhase::Idle);
        if previous == MarkPhase::Idle {
            return false;
        }
        self.abort_marking_threads();
        self.shared.root_regions.cancel_scan();
        self.shared.satb.set_active(false);
        self.shared.satb.abandon_completed_buffers();
        #[cfg(feature = "tracing")]
        crate::tracing::log_cycle_end(self.cycle(), true, self.shared.metrics.overflow_restarts());
        true
    }

    /// Tell all marking threads to stop as soon as possible, releasing any
    /// task waiting in an overflow barrier.
    pub fn abort_marking_threads(&self) {
        self.shared.has_aborted.store(true, Ordering::Release);
        self.shared.first_overflow_barrier.abort();
        self.shared.second_overflow_barrier.abort();
        self.shared.root_regions.abort();
    }

    /// Clear the mark bitmap in parallel, region by region. Aborting marking
    /// threads interrupts it.
    ///
    /// # Errors
    ///
    /// `InvalidPhase` unless idle, and `CycleAborted` if interrupted.
    pub fn clear_bitmap(&self) -> Result<(), MarkError> {
        let _op = self.op_lock.lock();
        self.check_phase(MarkPhase::Idle)?;
        self.shared.has_aborted.store(false, Ordering::Release);
        self.clear_bitmap_locked()
    }

    fn clear_bitmap_locked(&self) -> Result<(), MarkError> {
        let shared = &self.shared;
        let num_regions = shared.heap.num_regions();
        let next = AtomicUsize::new(0);
        let n = self.active_workers().min(num_regions);
        self.pool.run_task(n, &|_| {
            while !shared.has_aborted() {
                let index = next.fetch_add(1, Ordering::Relaxed);
                if index >= num_regions {
                    break;
                }
                let region = RegionIdx::new(index);
                shared
                    .bitmap
                    .clear_range(shared.heap.region_bottom(region)..shared.heap.region_end(region));
            }
        });
        if shared.has_aborted() {
            return Err(MarkError::CycleAborted);
        }
        self.bitmap_dirty.store(false, Ordering::Release);
        Ok(())
    }

    /// Drive a started cycle to its end: root regions, concurrent marking
    /// with precleaning and remark until remark completes, then cleanup.
    ///
    /// If the mark stack is exhausted the cycle is aborted back to idle
    /// before the error is returned. Returns the regions without live
    /// objects.
    ///
    /// # Errors
    ///
    /// Any error of the individual phase operations.
    pub fn run_cycle(&self) -> Result<Vec<RegionIdx>, MarkError> {
        let result = self.run_cycle_phases();
        if matches!(result, Err(MarkError::MarkStackExhausted { .. })) {
            self.concurrent_cycle_abort();
        }
        result
    }

    fn run_cycle_phases(&self) -> Result<Vec<RegionIdx>, MarkError> {
        self.scan_root_regions()?;
        loop {
            self.mark_from_roots()?;
            self.preclean()?;
            if self.remark()? == RemarkOutcome::Completed {
                break;
            }
        }
        let empty = self.cleanup()?;
        self.concurrent_cycle_end()?;
        Ok(empty)
    }

    /// Whether `obj` is marked in the current cycle.
    pub fn is_marked(&self, obj: ObjRef) -> bool {
        self.shared.is_marked(obj)
    }

    /// Whether `obj` is marked or implicitly live.
    pub fn is_live(&self, obj: ObjRef) -> bool {
        self.shared.is_live(obj)
    }

    /// Bytes of objects marked below TAMS in `region`.
    pub fn marked_bytes(&self, region: RegionIdx) -> usize {
        self.shared.region_stats.live_words(region) * WORD_SIZE
    }

    /// Marked bytes plus everything allocated above TAMS.
    pub fn live_bytes(&self, region: RegionIdx) -> usize {
        let heap = self.heap();
        let allocated = heap
            .region_top(region)
            .saturating_sub(heap.top_at_mark_start(region));
        self.marked_bytes(region) + allocated
    }

    /// Whether `region` holds anything marked or allocated since TAMS.
    pub fn contains_live_object(&self, region: RegionIdx) -> bool {
        self.live_bytes(region) > 0
    }

    /// References into `region` from other regions reached by marking.
    pub fn incoming_refs(&self, region: RegionIdx) -> usize {
        self.shared.region_stats.incoming_refs(region)
    }
}

impl<H: MarkHeap, P: WorkerPool> std::fmt::Debug for ConcurrentMark<H, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrentMark")
            .field("phase", &self.phase())
            .field("cycle", &self.cycle())
            .field("workers", &self.tasks.len())
            .field("shared", &self.shared)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelHeap;
    use std::time::Duration;

    fn started(heap: ModelHeap, workers: usize) -> ConcurrentMark<ModelHeap> {
        let cm = ConcurrentMark::new(heap, MarkConfig::new(workers)).unwrap();
        cm.concurrent_cycle_start().unwrap();
        cm
    }

    #[test]
    fn test_claim_region_skips_regions_without_objects_below_tams() {
        let heap = ModelHeap::new(4, 4096);
        heap.alloc(1, 2, &[]);
        heap.alloc(3, 2, &[]);
        heap.snapshot_tams();
        let cm = started(heap, 1);

        let shared = cm.shared();
        let mut claimed = Vec::new();
        while !shared.out_of_regions() {
            if let Some(region) = shared.claim_region() {
                claimed.push(region.index());
            }
        }
        assert_eq!(claimed, vec![1, 3]);
        assert!(shared.claim_region().is_none());
    }

    #[test]
    fn test_objects_above_tams_are_never_marked() {
        let heap = ModelHeap::new(2, 4096);
        let old = heap.alloc(0, 2, &[]);
        heap.snapshot_tams();
        let young = heap.alloc(0, 2, &[]);
        let cm = started(heap, 1);

        assert!(cm.mark_root(old));
        assert!(!cm.mark_root(old));
        assert!(!cm.mark_root(young));
        assert!(!cm.is_marked(young));
        assert!(cm.is_live(young));
        assert_eq!(cm.marked_bytes(RegionIdx::new(0)), 2 * WORD_SIZE);
        assert_eq!(cm.live_bytes(RegionIdx::new(0)), 4 * WORD_SIZE);
    }

    #[test]
    fn test_idle_task_steals_from_sibling() {
        // Region 0 holds one object, region 1 is empty.
        let heap = ModelHeap::new(2, 4096);
        let leaf = heap.alloc(0, 1, &[]);
        let obj = heap.alloc(0, 2, &[leaf]);
        heap.snapshot_tams();
        let cm = started(heap, 2);
        cm.scan_root_regions().unwrap();
        let shared = cm.shared();
        shared.set_concurrency_and_phase(2, true);

        // Task 0 claims region 0 and greys its object; nothing is left for
        // task 1 to claim.
        let mut owner = cm.tasks[0].lock();
        assert_eq!(shared.claim_region(), Some(RegionIdx::new(0)));
        owner.make_reference_grey(shared, obj);
        assert_eq!(shared.queue(0).len(), 1);
        assert_eq!(shared.claim_region(), None);
        assert!(shared.out_of_regions());

        std::thread::scope(|s| {
            let thief = s.spawn(|| {
                let mut task = cm.tasks[1].lock();
                task.do_marking_step(shared, Duration::from_secs(10), true, false);
                !task.has_aborted()
            });
            // Task 1 steals before it offers termination.
            while shared.terminator().offered_termination() == 0 {
                std::thread::yield_now();
            }
            assert!(shared.queue(0).is_empty());
            owner.do_marking_step(shared, Duration::from_secs(10), true, false);
            assert!(!owner.has_aborted());
            assert!(thief.join().unwrap());
        });

        assert!(shared.is_marked(obj));
        assert!(shared.is_marked(leaf));
        let metrics = cm.metrics();
        assert!(metrics.steal_successes >= 1);
        assert!(metrics.objects_scanned >= 2);
    }

    #[test]
    fn test_refused_expansion_spends_restart_budget() {
        let heap = ModelHeap::new(2, 64 * 1024);
        let children: Vec<ObjRef> = (0..2000).map(|_| heap.alloc(0, 1, &[])).collect();
        let root = heap.alloc(1, 2, &children);
        heap.snapshot_tams();

        let mut config = MarkConfig::new(1);
        config.set_entries_per_chunk(4);
        config.set_task_queue_capacity(8);
        config.set_mark_stack_chunks(2, 64);
        config.set_max_overflow_restarts(Some(0));
        let cm = ConcurrentMark::new(heap, config).unwrap();
        cm.mark_stack().allocator().refuse_reservations();
        cm.concurrent_cycle_start().unwrap();
        cm.mark_root(root);

        let err = cm.run_cycle().unwrap_err();
        assert!(matches!(err, MarkError::MarkStackExhausted { max_chunks: 64 }));
        assert_eq!(cm.phase(), MarkPhase::Idle);
        let metrics = cm.metrics();
        assert_eq!(metrics.mark_stack_expansion_failures, 1);
        assert_eq!(cm.mark_stack().capacity_chunks(), 2);
        assert_eq!(
            metrics.mark_stack_reserved_bytes,
            cm.mark_stack().allocator().reserved_bytes()
        );
    }

    #[test]
    fn test_phase_order_is_enforced() {
        let heap = ModelHeap::new(1, 4096);
        heap.snapshot_tams();
        let cm = ConcurrentMark::new(heap, MarkConfig::new(1)).unwrap();

        assert!(matches!(
            cm.remark(),
            Err(MarkError::InvalidPhase {
                expected: MarkPhase::ConcurrentMark,
                actual: MarkPhase::Idle,
            })
        ));
        cm.concurrent_cycle_start().unwrap();
        assert!(cm.concurrent_cycle_start().is_err());
        assert!(cm.mark_from_roots().is_err());
        cm.scan_root_regions().unwrap();
        assert_eq!(cm.phase(), MarkPhase::ConcurrentMark);
    }

    #[test]
    fn test_serial_overflow_is_left_for_remark() {
        let heap = ModelHeap::new(1, 4096);
        heap.snapshot_tams();
        let cm = started(heap, 1);
        cm.scan_root_regions().unwrap();

        let shared = cm.shared();
        shared.has_overflown.store(true, Ordering::Release);
        shared.set_concurrency_and_phase(1, true);
        let mut task = cm.tasks[0].lock();
        task.do_marking_step(shared, UNBOUNDED_STEP, true, true);
        assert!(task.has_aborted());
        drop(task);

        assert_eq!(cm.remark().unwrap(), RemarkOutcome::RestartForOverflow);
        assert!(cm.restart_for_overflow());
        assert_eq!(cm.phase(), MarkPhase::ConcurrentMark);
        assert_eq!(cm.metrics().overflow_restarts, 1);
    }
}
