//! Debug-build diagnostics: rejection-site backtraces and live node tracking.
//!
//! Nodes are pooled and never observed by a garbage collector, so "was this promise ever
//! awaited or forgotten" cannot be detected at finalization time. Instead, debug builds count
//! every node handed out for a new operation and every node returned to a pool. A test harness
//! can assert that the difference returns to its starting value once all work has completed.

#[cfg(debug_assertions)]
use std::backtrace::Backtrace;
#[cfg(debug_assertions)]
use std::mem;
#[cfg(debug_assertions)]
use std::sync::atomic::{AtomicIsize, Ordering};

/// The call site that created a rejection.
///
/// Debug builds record a backtrace, resolved only if `RUST_BACKTRACE=1` or
/// `RUST_LIB_BACKTRACE=1` is set. Release builds record nothing.
pub(crate) struct RejectionSite {
    #[cfg(debug_assertions)]
    backtrace: Backtrace,
}

impl RejectionSite {
    pub(crate) fn here() -> Self {
        Self {
            #[cfg(debug_assertions)]
            backtrace: Backtrace::capture(),
        }
    }

    /// Moves the recorded site out, leaving an empty one behind.
    pub(crate) fn take(&mut self) -> Self {
        Self {
            #[cfg(debug_assertions)]
            backtrace: mem::replace(&mut self.backtrace, Backtrace::disabled()),
        }
    }

    #[cfg(debug_assertions)]
    pub(crate) fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }
}

#[cfg(debug_assertions)]
static LIVE_NODES: AtomicIsize = AtomicIsize::new(0);

/// Records that a node was handed out for a new operation.
pub(crate) fn node_acquired() {
    #[cfg(debug_assertions)]
    LIVE_NODES.fetch_add(1, Ordering::Relaxed);
}

/// Records that a node finished its operation and was disposed.
pub(crate) fn node_disposed() {
    #[cfg(debug_assertions)]
    LIVE_NODES.fetch_sub(1, Ordering::Relaxed);
}

/// The number of promise nodes that have been handed out for an operation and not yet disposed.
///
/// A node stays live until its promise has been settled and consumed (awaited, forgotten or
/// dropped), so a steady increase of this number indicates promises that are never settled or
/// awaiters that are never driven to completion.
///
/// Only available in debug builds (`cfg(debug_assertions)`). The count is process-wide, so it
/// is only meaningful when no unrelated promise work is running concurrently.
#[cfg(debug_assertions)]
#[must_use]
pub fn live_nodes() -> isize {
    LIVE_NODES.load(Ordering::Relaxed)
}
