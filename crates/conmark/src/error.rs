//! Error type for marking-cycle operations.
//!
//! Transient mark-stack overflow and step timeouts are recovered internally
//! and never show up here; what remains is what the cycle driver has to act on.

use std::io;

use crate::concurrent_mark::MarkPhase;

/// Errors reported by the marking engine.
#[derive(Debug, thiserror::Error)]
pub enum MarkError {
    /// Reserving memory for a chunk bucket failed.
    #[error("failed to reserve {bytes} bytes for the global mark stack")]
    Reservation {
        /// Size of the failed reservation.
        bytes: usize,
        /// Error reported by the OS.
        #[source]
        source: io::Error,
    },

    /// The global mark stack cannot grow past its configured maximum and the
    /// situation is not recoverable by restarting. The collector must fall
    /// back to a full, non-concurrent collection.
    #[error("global mark stack exhausted at its maximum of {max_chunks} chunks")]
    MarkStackExhausted {
        /// Maximum capacity of the stack, in chunks.
        max_chunks: usize,
    },

    /// A configuration value is out of range or inconsistent.
    #[error("invalid marking configuration: {0}")]
    InvalidConfig(&'static str),

    /// The operation was cut short by a cycle abort.
    #[error("concurrent marking cycle aborted")]
    CycleAborted,

    /// A cycle operation was invoked in the wrong phase.
    #[error("expected marking phase {expected:?}, found {actual:?}")]
    InvalidPhase {
        /// Phase the operation requires.
        expected: MarkPhase,
        /// Phase the coordinator was in.
        actual: MarkPhase,
    },
}
