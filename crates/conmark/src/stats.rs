//! Marking statistics: per-region liveness and engine counters.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::concurrent_mark::MarkPhase;
use crate::heap::RegionIdx;

/// Liveness of every region, as found by the current cycle.
///
/// Live words count each object marked below TAMS once. Incoming references
/// count references reached from another region.
#[derive(Debug)]
pub struct RegionMarkStats {
    live_words: Box<[AtomicUsize]>,
    incoming_refs: Box<[AtomicUsize]>,
}

impl RegionMarkStats {
    /// A zeroed table for `num_regions` regions.
    #[must_use]
    pub fn new(num_regions: usize) -> Self {
        Self {
            live_words: (0..num_regions).map(|_| AtomicUsize::new(0)).collect(),
            incoming_refs: (0..num_regions).map(|_| AtomicUsize::new(0)).collect(),
        }
    }

    /// Number of regions tracked.
    #[must_use]
    pub fn num_regions(&self) -> usize {
        self.live_words.len()
    }

    /// Add counts flushed from a task cache.
    pub fn add(&self, region: RegionIdx, live_words: usize, incoming_refs: usize) {
        let i = region.index();
        if live_words > 0 {
            self.live_words[i].fetch_add(live_words, Ordering::Relaxed);
        }
        if incoming_refs > 0 {
            self.incoming_refs[i].fetch_add(incoming_refs, Ordering::Relaxed);
        }
    }

    /// Words marked live in `region`.
    #[must_use]
    pub fn live_words(&self, region: RegionIdx) -> usize {
        self.live_words[region.index()].load(Ordering::Relaxed)
    }

    /// References into `region` from other regions.
    #[must_use]
    pub fn incoming_refs(&self, region: RegionIdx) -> usize {
        self.incoming_refs[region.index()].load(Ordering::Relaxed)
    }

    /// Drop incoming reference counts before an overflow restart rescans
    /// every marked object. Live words stay: marks survive the restart.
    pub fn clear_during_overflow(&self) {
        for incoming in &*self.incoming_refs {
            incoming.store(0, Ordering::Relaxed);
        }
    }

    /// Zero every region, at cycle start.
    pub fn clear_all(&self) {
        for (live, incoming) in self.live_words.iter().zip(&*self.incoming_refs) {
            live.store(0, Ordering::Relaxed);
            incoming.store(0, Ordering::Relaxed);
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct CacheEntry {
    region: Option<RegionIdx>,
    live_words: usize,
    incoming_refs: usize,
}

/// A task-local, direct-mapped cache in front of [`RegionMarkStats`].
///
/// Entries are written back when evicted by a conflicting region and when
/// the task flushes the whole cache.
#[derive(Debug)]
pub struct RegionStatsCache {
    entries: Box<[CacheEntry]>,
    mask: usize,
    hits: usize,
    misses: usize,
}

impl RegionStatsCache {
    /// # Panics
    ///
    /// Panics if `num_entries` is not a power of two.
    #[must_use]
    pub fn new(num_entries: usize) -> Self {
        assert!(
            num_entries.is_power_of_two(),
            "stats cache size must be a power of two"
        );
        Self {
            entries: vec![CacheEntry::default(); num_entries].into_boxed_slice(),
            mask: num_entries - 1,
            hits: 0,
            misses: 0,
        }
    }

    fn entry(&mut self, global: &RegionMarkStats, region: RegionIdx) -> &mut CacheEntry {
        let slot = region.index() & self.mask;
        let entry = &mut self.entries[slot];
        if entry.region == Some(region) {
            self.hits += 1;
        } else {
            self.misses += 1;
            if let Some(old) = entry.region {
                global.add(old, entry.live_words, entry.incoming_refs);
            }
            *entry = CacheEntry {
                region: Some(region),
                ..CacheEntry::default()
            };
        }
        entry
    }

    /// Count `words` newly marked in `region`.
    pub fn add_live_words(&mut self, global: &RegionMarkStats, region: RegionIdx, words: usize) {
        self.entry(global, region).live_words += words;
    }

    /// Count one reference into `region` from elsewhere.
    pub fn add_incoming_ref(&mut self, global: &RegionMarkStats, region: RegionIdx) {
        self.entry(global, region).incoming_refs += 1;
    }

    /// Write back and drop every entry. Returns `(hits, misses)` since the
    /// last flush.
    pub fn evict_all(&mut self, global: &RegionMarkStats) -> (usize, usize) {
        for entry in &mut *self.entries {
            if let Some(region) = entry.region.take() {
                global.add(region, entry.live_words, entry.incoming_refs);
            }
        }
        let counts = (self.hits, self.misses);
        self.hits = 0;
        self.misses = 0;
        counts
    }

    /// Drop every entry without writing it back.
    pub fn reset(&mut self) {
        self.entries.fill(CacheEntry::default());
        self.hits = 0;
        self.misses = 0;
    }
}

/// Accumulated time spent in each cycle phase.
///
/// ```
/// use conmark::{MarkPhase, PhaseTimer};
///
/// let mut timer = PhaseTimer::new();
/// timer.start();
/// // ... remark work ...
/// timer.end(MarkPhase::Remark);
/// assert!(timer.cleanup.is_zero());
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct PhaseTimer {
    /// Root-region scanning.
    pub root_scan: Duration,
    /// Concurrent marking, over all restarts.
    pub concurrent_mark: Duration,
    /// Remark pauses.
    pub remark: Duration,
    /// Cleanup pauses.
    pub cleanup: Duration,
    current_start: Option<Instant>,
}

impl PhaseTimer {
    /// All phases at zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            root_scan: Duration::ZERO,
            concurrent_mark: Duration::ZERO,
            remark: Duration::ZERO,
            cleanup: Duration::ZERO,
            current_start: None,
        }
    }

    /// Start timing a phase.
    pub fn start(&mut self) {
        self.current_start = Some(Instant::now());
    }

    /// Stop timing and add the elapsed time to `phase`.
    pub fn end(&mut self, phase: MarkPhase) {
        if let Some(start) = self.current_start.take() {
            self.add(phase, start.elapsed());
        }
    }

    /// Add `elapsed` to `phase`. `Idle` is not timed.
    pub fn add(&mut self, phase: MarkPhase, elapsed: Duration) {
        match phase {
            MarkPhase::ScanRootRegions => self.root_scan += elapsed,
            MarkPhase::ConcurrentMark => self.concurrent_mark += elapsed,
            MarkPhase::Remark => self.remark += elapsed,
            MarkPhase::Cleanup => self.cleanup += elapsed,
            MarkPhase::Idle => {}
        }
    }

    /// Time across all phases.
    #[must_use]
    pub fn total(&self) -> Duration {
        self.root_scan + self.concurrent_mark + self.remark + self.cleanup
    }
}

/// A point-in-time copy of [`MarkMetrics`].
#[derive(Debug, Clone, Copy, Default)]
pub struct MarkMetricsSnapshot {
    /// Overflow restarts of the marking traversal.
    pub overflow_restarts: usize,
    /// Marking steps that ended on their time budget.
    pub step_timeouts: usize,
    /// Steal attempts on sibling queues.
    pub steal_attempts: usize,
    /// Successful steals.
    pub steal_successes: usize,
    /// SATB buffers processed.
    pub satb_buffers_drained: usize,
    /// Chunks moved to the global mark stack.
    pub chunks_pushed: usize,
    /// Chunks moved off the global mark stack.
    pub chunks_popped: usize,
    /// Objects whose fields were scanned.
    pub objects_scanned: usize,
    /// Words of objects scanned.
    pub words_scanned: usize,
    /// References visited.
    pub refs_reached: usize,
    /// Completed marking cycles.
    pub cycles_completed: usize,
    /// Region stats cache lookups that found their region.
    pub stats_cache_hits: usize,
    /// Region stats cache lookups that evicted or filled an entry.
    pub stats_cache_misses: usize,
    /// Overflow restarts that could not grow the mark stack because the OS
    /// refused the memory.
    pub mark_stack_expansion_failures: usize,
    /// Memory currently reserved for the global mark stack.
    pub mark_stack_reserved_bytes: usize,
    /// Time spent per phase.
    pub phases: PhaseTimer,
}

/// Engine counters, shared by all tasks.
#[derive(Debug, Default)]
pub struct MarkMetrics {
    overflow_restarts: AtomicUsize,
    step_timeouts: AtomicUsize,
    steal_attempts: AtomicUsize,
    steal_successes: AtomicUsize,
    satb_buffers_drained: AtomicUsize,
    chunks_pushed: AtomicUsize,
    chunks_popped: AtomicUsize,
    objects_scanned: AtomicUsize,
    words_scanned: AtomicUsize,
    refs_reached: AtomicUsize,
    cycles_completed: AtomicUsize,
    stats_cache_hits: AtomicUsize,
    stats_cache_misses: AtomicUsize,
    expansion_failures: AtomicUsize,
    phases: Mutex<PhaseTimer>,
}

/// Per-step totals a task folds into [`MarkMetrics`] in one go.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct StepCounts {
    pub steal_attempts: usize,
    pub steal_successes: usize,
    pub satb_buffers_drained: usize,
    pub chunks_pushed: usize,
    pub chunks_popped: usize,
    pub objects_scanned: usize,
    pub words_scanned: usize,
    pub refs_reached: usize,
    pub stats_cache_hits: usize,
    pub stats_cache_misses: usize,
}

impl MarkMetrics {
    /// All counters at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Overflow restarts so far.
    #[inline]
    #[must_use]
    pub fn overflow_restarts(&self) -> usize {
        self.overflow_restarts.load(Ordering::Relaxed)
    }

    pub(crate) fn record_overflow_restart(&self) -> usize {
        self.overflow_restarts.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn record_step_timeout(&self) {
        self.step_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_expansion_failure(&self) {
        self.expansion_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cycle_completed(&self) {
        self.cycles_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_phase(&self, phase: MarkPhase, elapsed: Duration) {
        self.phases.lock().add(phase, elapsed);
    }

    pub(crate) fn fold(&self, counts: &StepCounts) {
        let add = |counter: &AtomicUsize, n: usize| {
            if n > 0 {
                counter.fetch_add(n, Ordering::Relaxed);
            }
        };
        add(&self.steal_attempts, counts.steal_attempts);
        add(&self.steal_successes, counts.steal_successes);
        add(&self.satb_buffers_drained, counts.satb_buffers_drained);
        add(&self.chunks_pushed, counts.chunks_pushed);
        add(&self.chunks_popped, counts.chunks_popped);
        add(&self.objects_scanned, counts.objects_scanned);
        add(&self.words_scanned, counts.words_scanned);
        add(&self.refs_reached, counts.refs_reached);
        add(&self.stats_cache_hits, counts.stats_cache_hits);
        add(&self.stats_cache_misses, counts.stats_cache_misses);
    }

    /// Copy the counters. `mark_stack_reserved_bytes` is left at zero; the
    /// coordinator fills it in.
    #[must_use]
    pub fn snapshot(&self) -> MarkMetricsSnapshot {
        let get = |counter: &AtomicUsize| counter.load(Ordering::Relaxed);
        MarkMetricsSnapshot {
            overflow_restarts: get(&self.overflow_restarts),
            step_timeouts: get(&self.step_timeouts),
            steal_attempts: get(&self.steal_attempts),
            steal_successes: get(&self.steal_successes),
            satb_buffers_drained: get(&self.satb_buffers_drained),
            chunks_pushed: get(&self.chunks_pushed),
            chunks_popped: get(&self.chunks_popped),
            objects_scanned: get(&self.objects_scanned),
            words_scanned: get(&self.words_scanned),
            refs_reached: get(&self.refs_reached),
            cycles_completed: get(&self.cycles_completed),
            stats_cache_hits: get(&self.stats_cache_hits),
            stats_cache_misses: get(&self.stats_cache_misses),
            mark_stack_expansion_failures: get(&self.expansion_failures),
            mark_stack_reserved_bytes: 0,
            phases: *self.phases.lock(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_writes_back_on_conflict() {
        let global = RegionMarkStats::new(8);
        let mut cache = RegionStatsCache::new(2);
        cache.add_live_words(&global, RegionIdx::new(1), 10);
        cache.add_incoming_ref(&global, RegionIdx::new(1));
        assert_eq!(global.live_words(RegionIdx::new(1)), 0);

        // Region 3 maps to the same slot as region 1.
        cache.add_live_words(&global, RegionIdx::new(3), 4);
        assert_eq!(global.live_words(RegionIdx::new(1)), 10);
        assert_eq!(global.incoming_refs(RegionIdx::new(1)), 1);

        let (hits, misses) = cache.evict_all(&global);
        assert_eq!((hits, misses), (1, 2));
        assert_eq!(global.live_words(RegionIdx::new(3)), 4);
    }

    #[test]
    fn test_cache_reset_discards() {
        let global = RegionMarkStats::new(4);
        let mut cache = RegionStatsCache::new(4);
        cache.add_live_words(&global, RegionIdx::new(2), 7);
        cache.reset();
        cache.evict_all(&global);
        assert_eq!(global.live_words(RegionIdx::new(2)), 0);
    }

    #[test]
    fn test_phase_timer_accumulates() {
        let mut timer = PhaseTimer::new();
        timer.add(MarkPhase::ConcurrentMark, Duration::from_millis(3));
        timer.add(MarkPhase::ConcurrentMark, Duration::from_millis(2));
        timer.add(MarkPhase::Idle, Duration::from_millis(100));
        assert_eq!(timer.concurrent_mark, Duration::from_millis(5));
        assert_eq!(timer.total(), Duration::from_millis(5));
    }

    #[test]
    fn test_metrics_snapshot() {
        let metrics = MarkMetrics::new();
        assert_eq!(metrics.record_overflow_restart(), 1);
        metrics.fold(&StepCounts {
            steal_successes: 2,
            words_scanned: 40,
            stats_cache_misses: 3,
            ..StepCounts::default()
        });
        metrics.record_expansion_failure();
        let snap = metrics.snapshot();
        assert_eq!(snap.overflow_restarts, 1);
        assert_eq!(snap.steal_successes, 2);
        assert_eq!(snap.words_scanned, 40);
        assert_eq!(snap.chunks_pushed, 0);
        assert_eq!(snap.stats_cache_misses, 3);
        assert_eq!(snap.mark_stack_expansion_failures, 1);
    }
}
