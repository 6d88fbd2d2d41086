//! Blocking coordination between marking tasks.
//!
//! # Lock Ordering
//!
//! | Lock | Held while |
//! |------|------------|
//! | `OverflowBarrier::state` | counting arrivals |
//! | `TaskTerminator::offered` | counting offers |
//! | `RootRegions::scan_lock` | flipping the scan flag |
//!
//! No lock in this crate is held while another is acquired, and none is held
//! while heap memory is scanned.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crossbeam::utils::Backoff;
use parking_lot::{Condvar, Mutex};

#[derive(Debug)]
struct BarrierState {
    n_workers: usize,
    n_completed: usize,
    generation: u64,
    aborted: bool,
}

/// A reusable barrier that can be aborted.
///
/// Used twice in a row by the overflow protocol: every task enters the first
/// barrier before global state is reset and the second one after.
#[derive(Debug)]
pub struct OverflowBarrier {
    state: Mutex<BarrierState>,
    cvar: Condvar,
}

impl OverflowBarrier {
    /// A barrier for `n_workers` tasks.
    #[must_use]
    pub fn new(n_workers: usize) -> Self {
        Self {
            state: Mutex::new(BarrierState {
                n_workers,
                n_completed: 0,
                generation: 0,
                aborted: false,
            }),
            cvar: Condvar::new(),
        }
    }

    /// Set the party size and clear any abort. Only valid while no task is
    /// waiting.
    pub fn set_n_workers(&self, n_workers: usize) {
        let mut state = self.state.lock();
        state.n_workers = n_workers;
        state.n_completed = 0;
        state.aborted = false;
    }

    /// Wait until all workers have entered. Returns `false` if the barrier
    /// was aborted before that happened.
    pub fn enter(&self) -> bool {
        let mut state = self.state.lock();
        if state.aborted {
            return false;
        }
        state.n_completed += 1;
        if state.n_completed >= state.n_workers {
            state.n_completed = 0;
            state.generation = state.generation.wrapping_add(1);
            self.cvar.notify_all();
            return true;
        }
        let generation = state.generation;
        while state.generation == generation && !state.aborted {
            self.cvar.wait(&mut state);
        }
        state.generation != generation
    }

    /// Release every waiter; later entries fail until
    /// [`set_n_workers`](Self::set_n_workers).
    pub fn abort(&self) {
        let mut state = self.state.lock();
        state.aborted = true;
        self.cvar.notify_all();
    }

    /// Whether the barrier was aborted since the last resize.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.state.lock().aborted
    }
}

/// Lets a task leave an otherwise converging termination attempt.
pub trait TerminatorTerminator {
    /// Checked while waiting; `true` makes `offer_termination` return
    /// `false`.
    fn should_exit_termination(&self) -> bool;
}

/// Offer/rejoin termination for a fixed group of tasks.
///
/// A task with no work offers termination and waits. It leaves the attempt
/// when its [`TerminatorTerminator`] reports new work or an abort, and the
/// attempt succeeds for everyone once all tasks are offering at the same
/// time.
#[derive(Debug)]
pub struct TaskTerminator {
    n_threads: AtomicUsize,
    offered: Mutex<usize>,
    blocker: Condvar,
}

const WAIT_SLICE: Duration = Duration::from_millis(1);

impl TaskTerminator {
    /// A terminator for `n_threads` tasks, at least one.
    #[must_use]
    pub fn new(n_threads: usize) -> Self {
        Self {
            n_threads: AtomicUsize::new(n_threads.max(1)),
            offered: Mutex::new(0),
            blocker: Condvar::new(),
        }
    }

    /// Tasks that must all offer before termination succeeds.
    #[must_use]
    pub fn n_threads(&self) -> usize {
        self.n_threads.load(Ordering::Acquire)
    }

    /// Number of tasks currently offering.
    #[must_use]
    pub fn offered_termination(&self) -> usize {
        *self.offered.lock()
    }

    /// Prepare for a new round with `n_threads` tasks. Only valid while no
    /// task is inside [`offer_termination`](Self::offer_termination).
    pub fn reset_for_reuse(&self, n_threads: usize) {
        let mut offered = self.offered.lock();
        debug_assert!(
            *offered == 0 || *offered == self.n_threads(),
            "terminator reset during a termination attempt"
        );
        *offered = 0;
        self.n_threads.store(n_threads.max(1), Ordering::Release);
    }

    /// Offer to terminate. Returns `true` when every task has offered, and
    /// `false` if `terminator` asked to leave first.
    pub fn offer_termination(&self, terminator: Option<&dyn TerminatorTerminator>) -> bool {
        let n_threads = self.n_threads();
        {
            let mut offered = self.offered.lock();
            *offered += 1;
            if *offered >= n_threads {
                self.blocker.notify_all();
                return true;
            }
        }

        let backoff = Backoff::new();
        loop {
            if backoff.is_completed() {
                let mut offered = self.offered.lock();
                if *offered < n_threads {
                    self.blocker.wait_for(&mut offered, WAIT_SLICE);
                }
            } else {
                backoff.snooze();
            }

            let exit = terminator.is_some_and(|t| t.should_exit_termination());
            let mut offered = self.offered.lock();
            if *offered >= n_threads {
                return true;
            }
            if exit {
                *offered -= 1;
                return false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_barrier_releases_all() {
        let barrier = Arc::new(OverflowBarrier::new(4));
        let passed = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                let passed = Arc::clone(&passed);
                thread::spawn(move || {
                    for _ in 0..3 {
                        if barrier.enter() {
                            passed.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(passed.load(Ordering::Relaxed), 12);
    }

    #[test]
    fn test_barrier_abort_releases_waiter() {
        let barrier = Arc::new(OverflowBarrier::new(2));
        let waiter = {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || barrier.enter())
        };
        thread::sleep(Duration::from_millis(10));
        barrier.abort();
        assert!(!waiter.join().unwrap());
        assert!(!barrier.enter());

        barrier.set_n_workers(1);
        assert!(barrier.enter());
    }

    #[test]
    fn test_single_task_terminates_immediately() {
        let terminator = TaskTerminator::new(1);
        assert!(terminator.offer_termination(None));
    }

    #[test]
    fn test_all_tasks_terminate() {
        let terminator = Arc::new(TaskTerminator::new(4));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let terminator = Arc::clone(&terminator);
                thread::spawn(move || terminator.offer_termination(None))
            })
            .collect();
        for h in handles {
            assert!(h.join().unwrap());
        }
    }

    struct Flag(AtomicBool);

    impl TerminatorTerminator for Flag {
        fn should_exit_termination(&self) -> bool {
            self.0.load(Ordering::Acquire)
        }
    }

    #[test]
    fn test_exit_hook_breaks_out() {
        let terminator = Arc::new(TaskTerminator::new(2));
        let flag = Arc::new(Flag(AtomicBool::new(false)));
        let offerer = {
            let terminator = Arc::clone(&terminator);
            let flag = Arc::clone(&flag);
            thread::spawn(move || terminator.offer_termination(Some(&*flag)))
        };
        thread::sleep(Duration::from_millis(10));
        flag.0.store(true, Ordering::Release);
        assert!(!offerer.join().unwrap());
        assert_eq!(terminator.offered_termination(), 0);

        terminator.reset_for_reuse(1);
        assert!(terminator.offer_termination(None));
    }
}
