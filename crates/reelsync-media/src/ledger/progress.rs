//! Lock-free progress snapshot published by the ledger owner.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};

/// Counters the ledger's single writer publishes after every `fix`.
///
/// Other threads read these instead of touching the ledger itself.
#[derive(Debug, Default)]
pub struct LedgerProgress {
    appended: AtomicUsize,
    fixed: AtomicUsize,
    finalized: AtomicBool,
    fixed_span: AtomicI64,
}

/// A consistent-enough copy of [`LedgerProgress`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProgressSnapshot {
    /// Records appended so far.
    pub appended: usize,
    /// Records fixed so far.
    pub fixed: usize,
    /// Whether the ledger has been finalized.
    pub finalized: bool,
    /// Presentation span of the fixed records, in video timebase ticks.
    pub fixed_span: i64,
}

impl LedgerProgress {
    pub(crate) fn publish(&self, snapshot: ProgressSnapshot) {
        self.appended.store(snapshot.appended, Ordering::Relaxed);
        self.fixed.store(snapshot.fixed, Ordering::Relaxed);
        self.fixed_span.store(snapshot.fixed_span, Ordering::Relaxed);
        self.finalized.store(snapshot.finalized, Ordering::Release);
    }

    /// Read the latest published values.
    pub fn snapshot(&self) -> ProgressSnapshot {
        let finalized = self.finalized.load(Ordering::Acquire);
        ProgressSnapshot {
            appended: self.appended.load(Ordering::Relaxed),
            fixed: self.fixed.load(Ordering::Relaxed),
            finalized,
            fixed_span: self.fixed_span.load(Ordering::Relaxed),
        }
    }
}
