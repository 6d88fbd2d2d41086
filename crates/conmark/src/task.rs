//! Per-worker marking task.
//!
//! A `MarkingTask` is owned by one worker at a time and only ever touches
//! shared state through the [`MarkShared`] view it is handed on each call.
//!
//! One marking step:
//!
//! 1. drain completed SATB buffers,
//! 2. partially drain the local queue and the global stack,
//! 3. claim regions and walk their marked objects below TAMS, moving the local
//!    finger along and partially draining after every object,
//! 4. drain SATB buffers again, then drain both queues completely,
//! 5. steal from siblings until nothing is left,
//! 6. offer termination.
//!
//! Work is interruptible: the regular clock runs every time the words scanned
//! or references reached cross their limits, and checks for overflow, cycle
//! abort, the step's time budget and pending SATB buffers. On overflow every
//! task meets at the first barrier, worker 0 resets global state, and all
//! tasks leave through the second barrier and start over.

use std::time::{Duration, Instant};

use crate::concurrent_mark::MarkShared;
use crate::entry::{ObjRef, TaskEntry, WORD_SIZE};
use crate::heap::{MarkHeap, RegionIdx};
use crate::stats::{MarkMetrics, RegionStatsCache, StepCounts};
use crate::sync::TerminatorTerminator;

/// Words scanned between two regular clock calls.
const WORDS_SCANNED_PERIOD: usize = 12 * 1024;
/// References reached between two regular clock calls.
const REFS_REACHED_PERIOD: usize = 1024;
/// Upper bound of the local queue size left by a partial drain.
const DRAIN_STACK_TARGET: usize = 64;
/// Weight of the newest sample in the step overshoot average.
const DIFF_DECAY: f64 = 0.3;

/// Step time target used in pauses.
pub(crate) const UNBOUNDED_STEP: Duration = Duration::MAX;

/// Exponentially decayed average of how far steps overshoot their target.
#[derive(Debug, Default, Clone, Copy)]
struct StepDiff {
    avg_secs: Option<f64>,
}

impl StepDiff {
    fn add(&mut self, sample: Duration) {
        let x = sample.as_secs_f64();
        self.avg_secs = Some(match self.avg_secs {
            Some(avg) => avg.mul_add(1.0 - DIFF_DECAY, x * DIFF_DECAY),
            None => x,
        });
    }

    fn predict(&self) -> Duration {
        self.avg_secs
            .map_or(Duration::ZERO, |s| Duration::from_secs_f64(s.max(0.0)))
    }
}

/// Small xorshift generator choosing steal victims.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StealSeed(u32);

impl StealSeed {
    #[allow(clippy::cast_possible_truncation)]
    const fn new(worker_id: usize) -> Self {
        Self((worker_id as u32).wrapping_mul(0x9E37_79B9) | 1)
    }

    pub(crate) fn next(&mut self, bound: usize) -> usize {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.0 = x;
        x as usize % bound
    }
}

pub(crate) struct MarkingTask {
    worker_id: usize,

    curr_region: Option<RegionIdx>,
    finger: Option<usize>,
    region_limit: usize,

    words_scanned: usize,
    words_scanned_limit: usize,
    real_words_scanned_limit: usize,
    refs_reached: usize,
    refs_reached_limit: usize,
    real_refs_reached_limit: usize,

    has_aborted: bool,
    has_timed_out: bool,
    draining_satb_buffers: bool,
    concurrent: bool,

    start_time: Instant,
    time_target: Duration,
    step_diff: StepDiff,
    calls: usize,

    stats_cache: RegionStatsCache,
    counts: StepCounts,
    seed: StealSeed,
    // Chunk-sized transfer buffer for the global stack.
    buffer: Box<[TaskEntry]>,
}

impl MarkingTask {
    pub(crate) fn new(worker_id: usize, entries_per_chunk: usize, stats_cache_entries: usize) -> Self {
        Self {
            worker_id,
            curr_region: None,
            finger: None,
            region_limit: 0,
            words_scanned: 0,
            words_scanned_limit: 0,
            real_words_scanned_limit: 0,
            refs_reached: 0,
            refs_reached_limit: 0,
            real_refs_reached_limit: 0,
            has_aborted: false,
            has_timed_out: false,
            draining_satb_buffers: false,
            concurrent: false,
            start_time: Instant::now(),
            time_target: UNBOUNDED_STEP,
            step_diff: StepDiff::default(),
            calls: 0,
            stats_cache: RegionStatsCache::new(stats_cache_entries),
            counts: StepCounts::default(),
            seed: StealSeed::new(worker_id),
            buffer: vec![TaskEntry::Null; entries_per_chunk].into_boxed_slice(),
        }
    }

    #[inline]
    pub(crate) const fn has_aborted(&self) -> bool {
        self.has_aborted
    }

    #[cfg(test)]
    pub(crate) const fn curr_region(&self) -> Option<RegionIdx> {
        self.curr_region
    }

    pub(crate) fn stats_cache(&mut self) -> &mut RegionStatsCache {
        &mut self.stats_cache
    }

    /// Forget everything from a previous cycle.
    pub(crate) fn reset(&mut self) {
        self.clear_region_fields();
        self.calls = 0;
        self.step_diff = StepDiff::default();
        self.has_aborted = false;
        self.has_timed_out = false;
        self.stats_cache.reset();
        self.counts = StepCounts::default();
    }

    fn clear_region_fields(&mut self) {
        self.curr_region = None;
        self.finger = None;
        self.region_limit = 0;
    }

    fn setup_for_region<H: MarkHeap>(&mut self, shared: &MarkShared<H>, region: RegionIdx) {
        let heap = shared.heap();
        self.curr_region = Some(region);
        self.finger = Some(heap.region_bottom(region));
        self.region_limit = heap.top_at_mark_start(region);
    }

    fn giveup_current_region<H: MarkHeap>(&mut self, shared: &MarkShared<H>) {
        debug_assert!(self.curr_region.is_some(), "no region to give up");
        self.flush_stats_cache(shared);
        self.clear_region_fields();
    }

    /// Write the stats cache back to the global table.
    pub(crate) fn flush_stats_cache<H: MarkHeap>(&mut self, shared: &MarkShared<H>) {
        let (hits, misses) = self.stats_cache.evict_all(shared.region_stats());
        self.counts.stats_cache_hits += hits;
        self.counts.stats_cache_misses += misses;
    }

    fn move_finger_to(&mut self, addr: usize) {
        debug_assert!(addr < self.region_limit, "finger moved past the region limit");
        self.finger = Some(addr);
    }

    fn recalculate_limits(&mut self) {
        self.real_words_scanned_limit = self.words_scanned + WORDS_SCANNED_PERIOD;
        self.words_scanned_limit = self.real_words_scanned_limit;
        self.real_refs_reached_limit = self.refs_reached + REFS_REACHED_PERIOD;
        self.refs_reached_limit = self.real_refs_reached_limit;
    }

    /// Pull the clock forward after an expensive operation.
    fn decrease_limits(&mut self) {
        self.words_scanned_limit = self
            .real_words_scanned_limit
            .saturating_sub(3 * WORDS_SCANNED_PERIOD / 4);
        self.refs_reached_limit = self
            .real_refs_reached_limit
            .saturating_sub(3 * REFS_REACHED_PERIOD / 4);
    }

    #[inline]
    fn check_limits<H: MarkHeap>(&mut self, shared: &MarkShared<H>) {
        if self.words_scanned >= self.words_scanned_limit
            || self.refs_reached >= self.refs_reached_limit
        {
            self.regular_clock_call(shared);
        }
    }

    /// Poll point of the cooperative abort protocol.
    fn regular_clock_call<H: MarkHeap>(&mut self, shared: &MarkShared<H>) {
        if self.has_aborted {
            return;
        }
        self.recalculate_limits();

        if shared.has_overflown() {
            self.has_aborted = true;
            return;
        }
        // Pauses only stop for overflow.
        if !self.concurrent {
            return;
        }
        if shared.has_aborted() {
            self.has_aborted = true;
            return;
        }
        if self.start_time.elapsed() > self.time_target {
            self.has_timed_out = true;
            self.has_aborted = true;
            return;
        }
        if !self.draining_satb_buffers && shared.satb().process_completed_buffers() {
            self.drain_satb_buffers(shared);
        }
    }

    fn drain_satb_buffers<H: MarkHeap>(&mut self, shared: &MarkShared<H>) {
        self.draining_satb_buffers = true;
        while !self.has_aborted
            && shared
                .satb()
                .apply_to_completed_buffer(|obj| self.make_reference_grey(shared, obj))
        {
            self.counts.satb_buffers_drained += 1;
            self.regular_clock_call(shared);
        }
        self.draining_satb_buffers = false;
        self.decrease_limits();
    }

    /// Whether `obj`, which this task just marked, has to be pushed: objects
    /// ahead of both fingers are found later by the bitmap walk.
    fn is_below_finger(&self, obj: ObjRef, global_finger: usize) -> bool {
        let addr = obj.addr();
        if let Some(finger) = self.finger {
            debug_assert!(self.region_limit <= global_finger, "region limit past global finger");
            if addr < finger {
                return true;
            }
            if addr < self.region_limit {
                return false;
            }
        }
        addr < global_finger
    }

    /// Mark `obj` and push it if the bitmap walk will not find it.
    pub(crate) fn make_reference_grey<H: MarkHeap>(&mut self, shared: &MarkShared<H>, obj: ObjRef) {
        if !shared.mark_in_bitmap(&mut self.stats_cache, obj) {
            return;
        }
        let global_finger = shared.finger();
        if self.is_below_finger(obj, global_finger) {
            self.push(shared, TaskEntry::from_obj(obj));
        }
    }

    /// Greys the target of a visited reference.
    pub(crate) fn deal_with_reference<H: MarkHeap>(&mut self, shared: &MarkShared<H>, obj: ObjRef) {
        self.refs_reached += 1;
        self.make_reference_grey(shared, obj);
    }

    fn deal_with_field<H: MarkHeap>(
        &mut self,
        shared: &MarkShared<H>,
        from: Option<RegionIdx>,
        obj: ObjRef,
    ) {
        if let Some(to) = shared.region_of(obj.addr()) {
            if from != Some(to) {
                self.stats_cache.add_incoming_ref(shared.region_stats(), to);
            }
        }
        self.deal_with_reference(shared, obj);
    }

    fn push<H: MarkHeap>(&mut self, shared: &MarkShared<H>, entry: TaskEntry) {
        debug_assert!(!entry.is_null(), "pushing a null entry");
        let queue = shared.queue(self.worker_id);
        if !queue.push(entry) {
            self.move_entries_to_global_stack(shared);
            let pushed = queue.push(entry);
            debug_assert!(pushed, "local queue still full after moving a chunk out");
        }
    }

    /// Move one chunk's worth of local entries to the global stack. If the
    /// stack overflows the entries are dropped; the restart rescans them.
    fn move_entries_to_global_stack<H: MarkHeap>(&mut self, shared: &MarkShared<H>) {
        let queue = shared.queue(self.worker_id);
        let mut buffer = std::mem::take(&mut self.buffer);
        let mut n = 0;
        while n < buffer.len() {
            let Some(entry) = queue.pop() else { break };
            buffer[n] = entry;
            n += 1;
        }
        if n < buffer.len() {
            buffer[n] = TaskEntry::Null;
        }
        if n > 0 {
            if shared.mark_stack_push(&buffer[..n]) {
                self.counts.chunks_pushed += 1;
            } else {
                self.has_aborted = true;
            }
        }
        self.buffer = buffer;
        self.decrease_limits();
    }

    fn get_entries_from_global_stack<H: MarkHeap>(&mut self, shared: &MarkShared<H>) -> bool {
        let mut buffer = std::mem::take(&mut self.buffer);
        let popped = shared.mark_stack_pop(&mut buffer);
        if popped {
            self.counts.chunks_popped += 1;
            for &entry in buffer.iter().take_while(|e| !e.is_null()) {
                self.push(shared, entry);
            }
        }
        self.buffer = buffer;
        if popped {
            self.decrease_limits();
        }
        popped
    }

    fn drain_local_queue<H: MarkHeap>(&mut self, shared: &MarkShared<H>, partially: bool) {
        if self.has_aborted {
            return;
        }
        let queue = shared.queue(self.worker_id);
        let target = if partially {
            (queue.capacity() / 3).min(DRAIN_STACK_TARGET)
        } else {
            0
        };
        if queue.len() <= target {
            return;
        }
        while let Some(entry) = queue.pop() {
            self.scan_task_entry(shared, entry);
            if queue.len() <= target || self.has_aborted {
                break;
            }
        }
    }

    fn drain_global_stack<H: MarkHeap>(&mut self, shared: &MarkShared<H>, partially: bool) {
        if self.has_aborted {
            return;
        }
        let stack = shared.mark_stack();
        let target = if partially {
            stack.capacity_chunks() / 3
        } else {
            0
        };
        while !self.has_aborted && stack.size() > target {
            if !self.get_entries_from_global_stack(shared) {
                break;
            }
            self.drain_local_queue(shared, partially);
        }
    }

    fn scan_task_entry<H: MarkHeap>(&mut self, shared: &MarkShared<H>, entry: TaskEntry) {
        match entry {
            TaskEntry::Obj(obj) => self.scan_object(shared, obj),
            TaskEntry::ArraySlice(addr) => {
                let (array, index) = shared.heap().resolve_array_element(addr.get());
                self.scan_array_slice(shared, array, index);
            }
            TaskEntry::Null => debug_assert!(false, "scanning a null entry"),
        }
        self.check_limits(shared);
    }

    fn scan_object<H: MarkHeap>(&mut self, shared: &MarkShared<H>, obj: ObjRef) {
        let heap = shared.heap();
        let from = shared.region_of(obj.addr());
        self.counts.objects_scanned += 1;
        heap.for_each_reference(obj, &mut |child| self.deal_with_field(shared, from, child));

        let stride = shared.config().array_slice_stride;
        match heap.ref_array_len(obj) {
            Some(len) if len >= 2 * stride => {
                self.words_scanned += heap.object_size(obj).saturating_sub(len);
                self.scan_array_slice(shared, obj, 0);
            }
            Some(len) => {
                heap.for_each_array_element(obj, 0..len, &mut |child| {
                    self.deal_with_field(shared, from, child);
                });
                self.words_scanned += heap.object_size(obj);
            }
            None => self.words_scanned += heap.object_size(obj),
        }
    }

    /// Scan one stride of `array` from `from`, pushing the rest as a
    /// continuation first so siblings can steal it.
    fn scan_array_slice<H: MarkHeap>(&mut self, shared: &MarkShared<H>, array: ObjRef, from: usize) {
        let heap = shared.heap();
        let len = heap.ref_array_len(array).unwrap_or(0);
        let end = from
            .saturating_add(shared.config().array_slice_stride)
            .min(len);
        if end < len {
            let next = heap.array_element_addr(array, end);
            self.push(shared, TaskEntry::from_slice(next.get()));
        }
        let region = shared.region_of(array.addr());
        heap.for_each_array_element(array, from..end, &mut |child| {
            self.deal_with_field(shared, region, child);
        });
        self.words_scanned += end.saturating_sub(from);
    }

    /// Walk the marked objects of the current region from the local finger
    /// up to the region limit.
    fn scan_current_region<H: MarkHeap>(&mut self, shared: &MarkShared<H>) {
        let (Some(_), Some(finger)) = (self.curr_region, self.finger) else {
            return;
        };
        let limit = self.region_limit;
        if finger >= limit {
            self.giveup_current_region(shared);
            self.regular_clock_call(shared);
            return;
        }

        let completed = shared.bitmap().iterate(finger..limit, |addr| {
            self.move_finger_to(addr);
            match ObjRef::new(addr) {
                Some(obj) => self.scan_task_entry(shared, TaskEntry::from_obj(obj)),
                None => unreachable!("heap addresses are never zero"),
            }
            self.drain_local_queue(shared, true);
            self.drain_global_stack(shared, true);
            !self.has_aborted
        });

        if completed {
            self.giveup_current_region(shared);
            self.regular_clock_call(shared);
            return;
        }

        debug_assert!(self.has_aborted, "bitmap walk stopped without an abort");
        // The finger is on the last object scanned; step past it so the next
        // step does not scan it again.
        let Some(last) = self.finger.and_then(ObjRef::new) else {
            return;
        };
        let next = last.addr() + shared.heap().object_size(last) * WORD_SIZE;
        if next >= self.region_limit {
            self.giveup_current_region(shared);
        } else {
            self.move_finger_to(next);
        }
    }

    /// Run one marking step.
    ///
    /// `time_target` bounds concurrent steps; `do_termination` enters the
    /// termination protocol once all work is gone; `is_serial` marks a single
    /// task running without siblings, which skips stealing, termination and
    /// the overflow barriers.
    pub(crate) fn do_marking_step<H: MarkHeap>(
        &mut self,
        shared: &MarkShared<H>,
        time_target: Duration,
        do_termination: bool,
        is_serial: bool,
    ) {
        self.start_time = Instant::now();
        self.concurrent = shared.concurrent();
        self.time_target = time_target.saturating_sub(self.step_diff.predict());

        self.words_scanned = 0;
        self.refs_reached = 0;
        self.recalculate_limits();

        // An overflow left over from a serial step must not be terminated on.
        self.has_aborted = shared.has_overflown();
        self.has_timed_out = false;
        self.draining_satb_buffers = false;
        self.calls += 1;

        self.drain_satb_buffers(shared);
        self.drain_local_queue(shared, true);
        self.drain_global_stack(shared, true);

        loop {
            if !self.has_aborted && self.curr_region.is_some() {
                self.scan_current_region(shared);
            }
            self.drain_local_queue(shared, true);
            self.drain_global_stack(shared, true);

            // `claim_region` may come back empty-handed for a region with
            // nothing below TAMS while more regions remain.
            while !self.has_aborted && self.curr_region.is_none() && !shared.out_of_regions() {
                if let Some(region) = shared.claim_region() {
                    self.setup_for_region(shared, region);
                }
                self.regular_clock_call(shared);
            }
            if self.curr_region.is_none() || self.has_aborted {
                break;
            }
        }

        if !self.has_aborted {
            debug_assert!(shared.out_of_regions(), "regions left after the claim loop");
            self.drain_satb_buffers(shared);
        }

        self.drain_local_queue(shared, false);
        self.drain_global_stack(shared, false);

        if do_termination && !is_serial {
            while !self.has_aborted {
                self.counts.steal_attempts += 1;
                let Some(entry) = shared.try_stealing(self.worker_id, &mut self.seed) else {
                    break;
                };
                self.counts.steal_successes += 1;
                self.scan_task_entry(shared, entry);
                self.drain_local_queue(shared, false);
                self.drain_global_stack(shared, false);
            }
        }

        if do_termination && !self.has_aborted {
            // The step deadline does not apply here: a task with no work
            // waits for its siblings, however short the step.
            let finished = is_serial || {
                let probe = TerminationProbe { shared };
                shared.terminator().offer_termination(Some(&probe))
            };
            if finished {
                debug_assert!(shared.out_of_regions(), "terminated with regions left");
                debug_assert!(shared.queue(self.worker_id).is_empty(), "terminated with local work");
                debug_assert!(!shared.has_overflown(), "terminated with overflow pending");
            } else {
                self.has_aborted = true;
            }
        }

        let elapsed = self.start_time.elapsed();
        if self.has_aborted {
            if self.has_timed_out {
                self.step_diff.add(elapsed.saturating_sub(self.time_target));
                shared.metrics().record_step_timeout();
                #[cfg(feature = "tracing")]
                crate::tracing::log_step_timeout(
                    self.worker_id,
                    elapsed.as_secs_f64() * 1e3,
                    self.time_target.as_secs_f64() * 1e3,
                );
            }
            if shared.has_overflown() {
                self.handle_overflow(shared, is_serial);
            }
        }
        self.flush_stats_cache(shared);
        self.flush_counts(shared.metrics());
    }

    /// The two-barrier restart. Returns with the task's region cleared and,
    /// in concurrent parallel marking, with global state reset by worker 0.
    fn handle_overflow<H: MarkHeap>(&mut self, shared: &MarkShared<H>, is_serial: bool) {
        self.flush_stats_cache(shared);
        if !is_serial && !shared.enter_first_sync_barrier() {
            return;
        }
        self.clear_region_fields();
        if !is_serial {
            // In remark the pause itself resets after reference processing.
            if shared.concurrent() && self.worker_id == 0 {
                shared.reset_marking_for_restart();
            }
            shared.enter_second_sync_barrier();
        }
    }

    pub(crate) fn flush_counts(&mut self, metrics: &MarkMetrics) {
        self.counts.words_scanned += self.words_scanned;
        self.counts.refs_reached += self.refs_reached;
        self.words_scanned = 0;
        self.refs_reached = 0;
        metrics.fold(&self.counts);
        self.counts = StepCounts::default();
    }
}

impl std::fmt::Debug for MarkingTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarkingTask")
            .field("worker_id", &self.worker_id)
            .field("curr_region", &self.curr_region)
            .field("finger", &self.finger)
            .field("has_aborted", &self.has_aborted)
            .field("calls", &self.calls)
            .finish_non_exhaustive()
    }
}

/// Decides when a task waiting for termination has to go back to work.
struct TerminationProbe<'a, H: MarkHeap> {
    shared: &'a MarkShared<H>,
}

impl<H: MarkHeap> TerminatorTerminator for TerminationProbe<'_, H> {
    fn should_exit_termination(&self) -> bool {
        let shared = self.shared;
        shared.has_overflown()
            || !shared.mark_stack_empty()
            || shared.queues().iter().any(|q| !q.is_empty())
            || (shared.concurrent()
                && (shared.has_aborted() || shared.satb().process_completed_buffers()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrent_mark::ConcurrentMark;
    use crate::config::MarkConfig;
    use crate::model::ModelHeap;

    #[test]
    fn test_step_diff_decays() {
        let mut diff = StepDiff::default();
        assert_eq!(diff.predict(), Duration::ZERO);
        diff.add(Duration::from_millis(10));
        assert_eq!(diff.predict(), Duration::from_millis(10));
        diff.add(Duration::ZERO);
        let p = diff.predict();
        assert!(p > Duration::from_millis(6) && p < Duration::from_millis(8));
    }

    #[test]
    fn test_steal_seed_in_bounds() {
        let mut seed = StealSeed::new(3);
        for _ in 0..1000 {
            assert!(seed.next(5) < 5);
        }
    }

    #[test]
    fn test_giving_up_a_region_flushes_its_stats() {
        let heap = ModelHeap::new(2, 4096);
        let obj = heap.alloc(1, 3, &[]);
        heap.snapshot_tams();
        let cm = ConcurrentMark::new(heap, MarkConfig::new(1)).unwrap();
        cm.concurrent_cycle_start().unwrap();
        let shared = cm.shared();

        // Region 0 has nothing below TAMS.
        assert_eq!(shared.claim_region(), None);
        let region = shared.claim_region().unwrap();
        let mut task = MarkingTask::new(0, 4, 4);
        task.setup_for_region(shared, region);
        task.make_reference_grey(shared, obj);
        assert_eq!(shared.region_stats().live_words(region), 0);

        task.giveup_current_region(shared);
        assert_eq!(shared.region_stats().live_words(region), 3);
        assert!(task.curr_region().is_none());
        assert!(shared.queue(0).is_empty());
    }

    #[test]
    fn test_limits_shrink_after_expensive_work() {
        let mut task = MarkingTask::new(0, 4, 4);
        task.recalculate_limits();
        assert_eq!(task.words_scanned_limit, WORDS_SCANNED_PERIOD);
        task.decrease_limits();
        assert_eq!(task.words_scanned_limit, WORDS_SCANNED_PERIOD / 4);
        assert_eq!(task.refs_reached_limit, REFS_REACHED_PERIOD / 4);
    }
}
