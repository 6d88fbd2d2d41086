//! Concurrent liveness marking for region-based garbage collectors.
//!
//! `conmark` traces the object graph of a managed heap while mutator threads
//! keep running and records reachable objects in a mark bitmap. It is the
//! marking half of a snapshot-at-the-beginning collector: everything
//! reachable when a cycle starts, or allocated during it, ends up live.
//!
//! # Features
//!
//! - **Chunked global mark stack**: lock-free chunk lists over a doubling
//!   allocator whose chunks never move.
//! - **Work stealing**: one bounded Chase-Lev queue per worker, spilling whole
//!   chunks to the global stack.
//! - **Overflow recovery**: a full global stack restarts the traversal through
//!   two barriers instead of failing.
//! - **Interruptible steps**: tasks poll time budgets, overflow, SATB buffers
//!   and abort requests at clock points.
//! - **Per-region liveness**: live words and incoming references, accumulated
//!   through per-task caches.
//!
//! # Cycle
//!
//! ```
//! use conmark::{ConcurrentMark, MarkConfig, ModelHeap, RemarkOutcome};
//!
//! let heap = ModelHeap::new(4, 64 * 1024);
//! let leaf = heap.alloc(0, 2, &[]);
//! let root = heap.alloc(1, 2, &[leaf]);
//! heap.snapshot_tams();
//!
//! let cm = ConcurrentMark::new(heap, MarkConfig::new(2)).unwrap();
//! cm.concurrent_cycle_start().unwrap();
//! cm.mark_root(root);
//! cm.scan_root_regions().unwrap();
//! loop {
//!     cm.mark_from_roots().unwrap();
//!     cm.preclean().unwrap();
//!     if cm.remark().unwrap() == RemarkOutcome::Completed {
//!         break;
//!     }
//! }
//! let empty = cm.cleanup().unwrap();
//! cm.concurrent_cycle_end().unwrap();
//!
//! assert!(cm.is_marked(leaf));
//! assert_eq!(empty.len(), 2);
//! ```
//!
//! # Heap
//!
//! The engine never reads object memory. Implement [`MarkHeap`] to describe
//! regions, TAMS and object layout; [`ModelHeap`] is a complete in-memory
//! implementation.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod bitmap;
mod concurrent_mark;
mod config;
mod entry;
mod error;
mod heap;
mod model;
mod root_regions;
mod satb;
mod stats;
mod sync;
mod task;
#[cfg(feature = "tracing")]
mod tracing;
mod worklist;

/// Global mark stack and its chunk allocator.
///
/// This module is public for testing and benchmarking.
pub mod mark_stack;

pub use bitmap::MarkBitmap;
pub use concurrent_mark::{ConcurrentMark, MarkPhase, MarkShared, RemarkOutcome};
pub use config::MarkConfig;
pub use entry::{ObjRef, TaskEntry, WORD_SIZE};
pub use error::MarkError;
pub use heap::{MarkHeap, RegionIdx, ScopedWorkerPool, WorkerPool};
pub use mark_stack::{ChunkAllocator, MarkStack};
pub use model::{ModelHeap, ARRAY_HEADER_WORDS};
pub use root_regions::{MemRegion, RootRegions};
pub use satb::{SatbBuffer, SatbQueueSet, DEFAULT_BUFFER_CAPACITY};
pub use stats::{
    MarkMetrics, MarkMetricsSnapshot, PhaseTimer, RegionMarkStats, RegionStatsCache,
};
pub use sync::{OverflowBarrier, TaskTerminator, TerminatorTerminator};
pub use worklist::TaskQueue;
