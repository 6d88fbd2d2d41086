//! Engine configuration.

use std::num::NonZeroUsize;
use std::time::Duration;

use crate::error::MarkError;

/// Tuning parameters of a [`ConcurrentMark`](crate::ConcurrentMark).
///
/// ```
/// use conmark::MarkConfig;
///
/// let mut config = MarkConfig::default();
/// config.set_num_workers(2);
/// config.set_mark_stack_chunks(4, 64);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MarkConfig {
    /// Marking threads per phase.
    pub num_workers: usize,
    /// Entries in one mark stack chunk.
    pub entries_per_chunk: usize,
    /// Initial chunk capacity of the global mark stack.
    pub mark_stack_min_chunks: usize,
    /// Chunk capacity the global mark stack may grow to.
    pub mark_stack_max_chunks: usize,
    /// Capacity of each task's local queue. A power of two.
    pub task_queue_capacity: usize,
    /// Time budget of one concurrent marking step.
    pub step_duration: Duration,
    /// Elements scanned per slice of a large reference array.
    pub array_slice_stride: usize,
    /// Entries of each task's region statistics cache. A power of two.
    pub stats_cache_entries: usize,
    /// Restarts after which overflow at maximum stack capacity becomes
    /// [`MarkError::MarkStackExhausted`]. `None` restarts indefinitely.
    pub max_overflow_restarts: Option<usize>,
}

impl Default for MarkConfig {
    fn default() -> Self {
        Self {
            num_workers: default_workers(),
            entries_per_chunk: 1023,
            mark_stack_min_chunks: 32,
            mark_stack_max_chunks: 4096,
            task_queue_capacity: 16 * 1024,
            step_duration: Duration::from_millis(10),
            array_slice_stride: 2048,
            stats_cache_entries: 1024,
            max_overflow_restarts: None,
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism().map_or(1, NonZeroUsize::get).min(4)
}

impl MarkConfig {
    /// Default configuration with `num_workers` workers.
    #[must_use]
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers: num_workers.max(1),
            ..Default::default()
        }
    }

    /// Set the worker count, at least one.
    pub const fn set_num_workers(&mut self, workers: usize) {
        self.num_workers = if workers < 1 { 1 } else { workers };
    }

    /// Entries per global mark stack chunk.
    pub const fn set_entries_per_chunk(&mut self, entries: usize) {
        self.entries_per_chunk = entries;
    }

    /// Initial and maximum size of the global mark stack, in chunks.
    pub const fn set_mark_stack_chunks(&mut self, min_chunks: usize, max_chunks: usize) {
        self.mark_stack_min_chunks = min_chunks;
        self.mark_stack_max_chunks = max_chunks;
    }

    /// Must be a power of two holding at least two chunks.
    pub const fn set_task_queue_capacity(&mut self, capacity: usize) {
        self.task_queue_capacity = capacity;
    }

    /// Set the time budget of one concurrent marking step.
    pub const fn set_step_duration(&mut self, duration: Duration) {
        self.step_duration = duration;
    }

    /// Elements scanned per array slice.
    pub const fn set_array_slice_stride(&mut self, stride: usize) {
        self.array_slice_stride = stride;
    }

    /// Entries of each task's region stats cache, a power of two.
    pub const fn set_stats_cache_entries(&mut self, entries: usize) {
        self.stats_cache_entries = entries;
    }

    /// `None` restarts without limit.
    pub const fn set_max_overflow_restarts(&mut self, restarts: Option<usize>) {
        self.max_overflow_restarts = restarts;
    }

    /// Check that the sizes are usable together.
    ///
    /// # Errors
    ///
    /// Returns [`MarkError::InvalidConfig`] naming the first bad value.
    pub fn validate(&self) -> Result<(), MarkError> {
        if self.num_workers == 0 {
            return Err(MarkError::InvalidConfig("num_workers must be at least 1"));
        }
        if self.entries_per_chunk == 0 {
            return Err(MarkError::InvalidConfig("entries_per_chunk must be at least 1"));
        }
        if self.mark_stack_min_chunks == 0 || self.mark_stack_max_chunks < self.mark_stack_min_chunks {
            return Err(MarkError::InvalidConfig(
                "mark stack chunk limits must satisfy 0 < min <= max",
            ));
        }
        if !self.task_queue_capacity.is_power_of_two() {
            return Err(MarkError::InvalidConfig(
                "task_queue_capacity must be a power of two",
            ));
        }
        if self.task_queue_capacity < 2 * self.entries_per_chunk {
            return Err(MarkError::InvalidConfig(
                "task_queue_capacity must hold at least two chunks",
            ));
        }
        if self.array_slice_stride == 0 {
            return Err(MarkError::InvalidConfig("array_slice_stride must be at least 1"));
        }
        if !self.stats_cache_entries.is_power_of_two() {
            return Err(MarkError::InvalidConfig(
                "stats_cache_entries must be a power of two",
            ));
        }
        if self.step_duration.is_zero() {
            return Err(MarkError::InvalidConfig("step_duration must be positive"));
        }
        Ok(())
    }
}
