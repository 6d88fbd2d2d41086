//! Snapshot-at-the-beginning buffers.
//!
//! Mutators log the old value of every reference they overwrite while marking
//! is active. Full buffers are handed to the [`SatbQueueSet`], and marking
//! tasks drain them at clock points so that everything reachable when the
//! cycle started gets marked.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam_queue::SegQueue;

use crate::entry::ObjRef;

/// Entries per mutator buffer.
pub const DEFAULT_BUFFER_CAPACITY: usize = 256;

/// A mutator's local log of overwritten references.
#[derive(Debug)]
pub struct SatbBuffer {
    entries: Vec<ObjRef>,
    capacity: usize,
}

impl SatbBuffer {
    /// A thread-local buffer that hands itself off after `capacity` records.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Log `old`. When the buffer fills up it is handed to `set`.
    ///
    /// Does nothing while `set` is inactive.
    pub fn record(&mut self, set: &SatbQueueSet, old: ObjRef) {
        if !set.is_active() {
            return;
        }
        self.entries.push(old);
        if self.entries.len() >= self.capacity {
            self.flush(set);
        }
    }

    /// Hand a non-empty buffer to `set` for processing.
    pub fn flush(&mut self, set: &SatbQueueSet) {
        if self.entries.is_empty() {
            return;
        }
        let full = std::mem::replace(&mut self.entries, Vec::with_capacity(self.capacity));
        set.enqueue_completed_buffer(full);
    }

    /// Records not yet handed off.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for SatbBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_CAPACITY)
    }
}

/// The set of completed SATB buffers awaiting marking.
#[derive(Debug, Default)]
pub struct SatbQueueSet {
    completed: SegQueue<Vec<ObjRef>>,
    num_completed: AtomicUsize,
    active: AtomicBool,
    // Tasks only detour into SATB processing above this many buffers.
    process_threshold: usize,
}

impl SatbQueueSet {
    /// An inactive set that reports any completed buffer as work.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A set whose [`process_completed_buffers`](Self::process_completed_buffers)
    /// only reports work once more than `threshold` buffers are queued.
    #[must_use]
    pub fn with_threshold(threshold: usize) -> Self {
        Self {
            process_threshold: threshold,
            ..Self::default()
        }
    }

    /// Switch logging on or off. Turned on for the duration of marking.
    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    /// Whether write barriers should record.
    #[inline]
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Queue a completed buffer.
    pub fn enqueue_completed_buffer(&self, buffer: Vec<ObjRef>) {
        if buffer.is_empty() {
            return;
        }
        self.completed.push(buffer);
        self.num_completed.fetch_add(1, Ordering::Release);
    }

    /// Queue a single reference, outside of any mutator buffer.
    pub fn enqueue(&self, obj: ObjRef) {
        self.enqueue_completed_buffer(vec![obj]);
    }

    /// Completed buffers waiting to be drained.
    #[must_use]
    pub fn completed_buffers_num(&self) -> usize {
        self.num_completed.load(Ordering::Acquire)
    }

    /// Whether enough buffers are queued to be worth a detour.
    #[must_use]
    pub fn process_completed_buffers(&self) -> bool {
        self.completed_buffers_num() > self.process_threshold
    }

    /// Pop one completed buffer and apply `f` to each entry. Returns `false`
    /// if no buffer was available.
    pub fn apply_to_completed_buffer<F>(&self, mut f: F) -> bool
    where
        F: FnMut(ObjRef),
    {
        let Some(buffer) = self.completed.pop() else {
            return false;
        };
        self.num_completed.fetch_sub(1, Ordering::AcqRel);
        for obj in buffer {
            f(obj);
        }
        true
    }

    /// Drop every queued buffer. Used when the cycle is abandoned.
    pub fn abandon_completed_buffers(&self) {
        while self.completed.pop().is_some() {
            self.num_completed.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(i: usize) -> ObjRef {
        ObjRef::new(0x1000 + i * 8).unwrap()
    }

    #[test]
    fn test_inactive_set_ignores_records() {
        let set = SatbQueueSet::new();
        let mut buf = SatbBuffer::new(2);
        buf.record(&set, obj(0));
        assert!(buf.is_empty());
        assert_eq!(set.completed_buffers_num(), 0);
    }

    #[test]
    fn test_full_buffer_is_enqueued() {
        let set = SatbQueueSet::new();
        set.set_active(true);
        let mut buf = SatbBuffer::new(2);
        buf.record(&set, obj(0));
        assert_eq!(set.completed_buffers_num(), 0);
        buf.record(&set, obj(1));
        assert_eq!(set.completed_buffers_num(), 1);
        assert!(buf.is_empty());

        let mut seen = Vec::new();
        assert!(set.apply_to_completed_buffer(|o| seen.push(o)));
        assert_eq!(seen, vec![obj(0), obj(1)]);
        assert!(!set.apply_to_completed_buffer(|_| {}));
    }

    #[test]
    fn test_threshold() {
        let set = SatbQueueSet::with_threshold(1);
        set.enqueue(obj(0));
        assert!(!set.process_completed_buffers());
        set.enqueue(obj(1));
        assert!(set.process_completed_buffers());
        set.abandon_completed_buffers();
        assert_eq!(set.completed_buffers_num(), 0);
    }

    #[test]
    fn test_partial_flush() {
        let set = SatbQueueSet::new();
        set.set_active(true);
        let mut buf = SatbBuffer::default();
        buf.record(&set, obj(3));
        buf.flush(&set);
        buf.flush(&set);
        assert_eq!(set.completed_buffers_num(), 1);
    }
}
