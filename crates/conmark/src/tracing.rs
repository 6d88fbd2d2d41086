//! Structured tracing spans and events for marking cycles.
//!
//! Compiled only with the `tracing` feature.

use ::tracing::Span;

use crate::concurrent_mark::MarkPhase;
use crate::error::MarkError;

/// Create a span covering one cycle phase.
pub fn span_phase(phase: MarkPhase, cycle: u64) -> Span {
    ::tracing::debug_span!("conmark_phase", phase = ?phase, cycle = cycle)
}

/// Log a phase transition of the coordinator.
pub fn log_phase_transition(from: MarkPhase, to: MarkPhase) {
    ::tracing::debug!(from = ?from, to = ?to, "phase_transition");
}

/// Log an overflow restart of the marking traversal.
pub fn log_overflow_restart(restarts: usize, stack_capacity: usize) {
    ::tracing::debug!(
        restarts = restarts,
        stack_capacity = stack_capacity,
        "overflow_restart"
    );
}

/// Log a marking step that ran out of time.
pub fn log_step_timeout(worker_id: usize, elapsed_ms: f64, target_ms: f64) {
    ::tracing::debug!(
        worker_id = worker_id,
        elapsed_ms = elapsed_ms,
        target_ms = target_ms,
        "step_timeout"
    );
}

/// Log a mark stack expansion.
pub fn log_mark_stack_expanded(old_chunks: usize, new_chunks: usize) {
    ::tracing::debug!(
        old_chunks = old_chunks,
        new_chunks = new_chunks,
        "mark_stack_expanded"
    );
}

/// Log an overflow restart that could not grow the mark stack.
pub fn log_mark_stack_expansion_failed(error: &MarkError) {
    ::tracing::warn!(error = %error, "mark_stack_expansion_failed");
}

/// Log the end of root-region scanning.
pub fn log_root_region_scan_done(regions: usize, aborted: bool) {
    ::tracing::debug!(regions = regions, aborted = aborted, "root_region_scan_done");
}

/// Log that remark overflowed and marking has to run again.
pub fn log_remark_restart(restarts: usize) {
    ::tracing::debug!(restarts = restarts, "remark_restart");
}

/// Log the end of a cycle.
pub fn log_cycle_end(cycle: u64, aborted: bool, overflow_restarts: usize) {
    ::tracing::debug!(
        cycle = cycle,
        aborted = aborted,
        overflow_restarts = overflow_restarts,
        "cycle_end"
    );
}
