//! Progress reporting and checkpoint cancellation for long operations.
//!
//! Cancellation is cooperative: an operation checks the flag only at
//! its checkpoints, which sit between flash writes. A write already
//! handed to the token always completes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    flag: Arc<AtomicBool>,
}

impl CancelFlag {
    /// A fresh, un-cancelled flag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation at the next checkpoint.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// Receiver of percent-complete updates.
pub trait ProgressSink {
    /// Called with values in 0..=100, non-decreasing.
    fn report(&self, percent: u8);
}

impl<F: Fn(u8)> ProgressSink for F {
    fn report(&self, percent: u8) {
        self(percent);
    }
}

/// Sink that drops every update.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _percent: u8) {}
}

/// Fraction `done / total` as a percent clamped to 0..=100.
#[must_use]
pub fn percent_of(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    let pct = done.saturating_mul(100).checked_div(total).unwrap_or(100);
    u8::try_from(pct.min(100)).unwrap_or(100)
}
