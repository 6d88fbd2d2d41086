//! Per-task work-stealing queues.
//!
//! Bounded Chase-Lev deques: the owning task pushes and pops at the bottom
//! (LIFO), siblings steal from the top (FIFO).
//!
//! Based on: "Simple and Efficient Work-Stealing Queues for Parallel Programming"
//! by Chase and Lev (2005), with the fences from "Correct and Efficient
//! Work-Stealing for Weak Memory Models" (Lê et al., 2013).

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{fence, AtomicUsize, Ordering};

use crossbeam::utils::CachePadded;

/// Lock-free bounded work-stealing queue.
///
/// # Invariants
///
/// - capacity is a power of 2 and `mask = capacity - 1`
/// - empty when `bottom == top`, full when `bottom - top == capacity`
/// - only the owner calls `push`/`pop`; anyone may `steal`
#[derive(Debug)]
pub struct TaskQueue<T: Copy> {
    buffer: Box<[UnsafeCell<MaybeUninit<T>>]>,
    bottom: CachePadded<AtomicUsize>,
    top: CachePadded<AtomicUsize>,
    mask: usize,
}

impl<T: Copy> TaskQueue<T> {
    /// Create a queue holding up to `capacity` items.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is not a power of 2.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(
            capacity.is_power_of_two(),
            "TaskQueue capacity must be a power of 2"
        );
        Self {
            buffer: (0..capacity)
                .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
                .collect(),
            bottom: CachePadded::new(AtomicUsize::new(0)),
            top: CachePadded::new(AtomicUsize::new(0)),
            mask: capacity - 1,
        }
    }

    /// Maximum number of entries.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Push at the owner's end. Returns `false` if the queue is full.
    pub fn push(&self, item: T) -> bool {
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Acquire);

        if b.wrapping_sub(t) > self.mask {
            return false;
        }

        // SAFETY: slot `b` is outside [top, bottom), so no stealer reads it.
        unsafe {
            (*self.buffer[b & self.mask].get()).write(item);
        }

        // Publish the slot before the new bottom becomes visible to stealers.
        self.bottom.store(b.wrapping_add(1), Ordering::Release);
        true
    }

    /// Pop at the owner's end.
    pub fn pop(&self) -> Option<T> {
        let b = self.bottom.load(Ordering::Relaxed);
        if b == self.top.load(Ordering::Relaxed) {
            return None;
        }

        let new_b = b.wrapping_sub(1);
        self.bottom.store(new_b, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        let t = self.top.load(Ordering::Relaxed);

        if new_b.wrapping_sub(t) as isize > 0 {
            // More than one item left: no stealer can reach this slot.
            // SAFETY: slot `new_b` was written by a previous push.
            return Some(unsafe { (*self.buffer[new_b & self.mask].get()).assume_init_read() });
        }

        if new_b == t {
            // Last item: race stealers for it through `top`.
            // SAFETY: as above; the CAS decides whether we keep the copy.
            let item = unsafe { (*self.buffer[new_b & self.mask].get()).assume_init_read() };
            let won = self
                .top
                .compare_exchange(t, t.wrapping_add(1), Ordering::SeqCst, Ordering::Relaxed)
                .is_ok();
            self.bottom.store(b, Ordering::Relaxed);
            return won.then_some(item);
        }

        // A stealer emptied the queue first.
        self.bottom.store(b, Ordering::Relaxed);
        None
    }

    /// Steal from the far end. May be called from any thread.
    pub fn steal(&self) -> Option<T> {
        let t = self.top.load(Ordering::Acquire);
        fence(Ordering::SeqCst);
        let b = self.bottom.load(Ordering::Acquire);

        if b.wrapping_sub(t) as isize <= 0 {
            return None;
        }

        // Read before claiming: once `top` moves the owner may reuse the slot.
        // SAFETY: slot `t` lies in [top, bottom) and was published by push.
        let item = unsafe { (*self.buffer[t & self.mask].get()).assume_init_read() };

        self.top
            .compare_exchange(t, t.wrapping_add(1), Ordering::SeqCst, Ordering::Relaxed)
            .ok()
            .map(|_| item)
    }

    /// Racy number of queued items.
    #[must_use]
    pub fn len(&self) -> usize {
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Acquire);
        let len = b.wrapping_sub(t) as isize;
        usize::try_from(len).unwrap_or(0)
    }

    /// Racy emptiness check.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Discard every item. Only valid while no thread uses the queue.
    pub fn set_empty(&self) {
        let b = self.bottom.load(Ordering::Relaxed);
        self.top.store(b, Ordering::Release);
    }
}

// SAFETY: slots are handed between threads only through the bottom/top
// protocol above; items are `Copy + Send`.
unsafe impl<T: Copy + Send> Send for TaskQueue<T> {}

// SAFETY: see `Send`.
unsafe impl<T: Copy + Send> Sync for TaskQueue<T> {}
