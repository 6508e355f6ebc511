//! Atomic status flags shared between a backend's tasks.

use std::sync::atomic::{AtomicBool, Ordering};

/// The independently-updated, atomically-readable flags of one backend.
///
/// Flags are advisory signals between tasks (worker, prober, rewriter,
/// flush jobs) - none of them guards memory, so relaxed ordering is
/// sufficient throughout.
#[derive(Debug)]
pub struct BackendState {
    /// Cleared once on shutdown; everything winds down after.
    running: AtomicBool,
    /// Last health-probe verdict.
    active: AtomicBool,
    /// A rewriter task is currently draining the spool.
    rewriting: AtomicBool,
    /// The backend is receiving an external data transfer.
    transfer_in: AtomicBool,
    /// Configured to accept writes but never serve queries.
    write_only: bool,
}

impl BackendState {
    /// New state for a backend that is running and presumed healthy.
    pub fn new(write_only: bool) -> Self {
        Self {
            running: AtomicBool::new(true),
            active: AtomicBool::new(true),
            rewriting: AtomicBool::new(false),
            transfer_in: AtomicBool::new(false),
            write_only,
        }
    }

    /// Is the backend accepting work?
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub(crate) fn set_running(&self, v: bool) {
        self.running.store(v, Ordering::Relaxed);
    }

    /// Did the last probe (or write) find the upstream reachable?
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub(crate) fn set_active(&self, v: bool) {
        self.active.store(v, Ordering::Relaxed);
    }

    /// Is a rewriter draining the spool right now?
    pub fn is_rewriting(&self) -> bool {
        self.rewriting.load(Ordering::Relaxed)
    }

    pub(crate) fn set_rewriting(&self, v: bool) {
        self.rewriting.store(v, Ordering::Relaxed);
    }

    /// Exclude this backend from read dispatch?
    ///
    /// True for permanently write-only members and for members currently
    /// receiving a transfer.
    pub fn is_write_only(&self) -> bool {
        self.write_only || self.transfer_in.load(Ordering::Relaxed)
    }

    /// Flag an external transfer into this backend.
    pub fn set_transfer_in(&self, v: bool) {
        self.transfer_in.store(v, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_state() {
        let s = BackendState::new(false);
        assert!(s.is_running());
        assert!(s.is_active());
        assert!(!s.is_rewriting());
        assert!(!s.is_write_only());
    }

    #[test]
    fn write_only_includes_transfer_in() {
        let s = BackendState::new(false);
        assert!(!s.is_write_only());
        s.set_transfer_in(true);
        assert!(s.is_write_only());
        s.set_transfer_in(false);
        assert!(!s.is_write_only());

        let s = BackendState::new(true);
        assert!(s.is_write_only());
        s.set_transfer_in(false);
        assert!(s.is_write_only());
    }
}
