//! Capability context (`Cx`) threaded through every VFS operation.
//!
//! A `Cx` carries two pieces of per-caller state:
//! - a deterministic clock override for tests (no ambient time in tests);
//! - the *pending error* slot, the engine's "last error" register. A backend
//!   that fails records a diagnostic here; `Vfs::last_error` reads it back.
//!
//! Clones share state, so a context handed to pluggable code observes (and
//! may clobber) the caller's pending error. Code that calls out while an
//! unrelated error is pending uses [`Cx::preserving_pending_error`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

/// Unix epoch expressed in Julian days.
const UNIX_EPOCH_JULIAN_DAY: f64 = 2_440_587.5;

/// A diagnostic left behind by a failed operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingError {
    /// Engine result code (or OS errno for backend failures).
    pub code: i32,
    /// Human readable detail.
    pub message: String,
}

impl PendingError {
    #[must_use]
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Default)]
struct CxInner {
    /// Fixed unix time in milliseconds; zero means "use the system clock".
    unix_millis: AtomicU64,
    pending_error: Mutex<Option<PendingError>>,
}

/// Per-caller context for VFS operations.
#[derive(Debug, Clone, Default)]
pub struct Cx {
    inner: Arc<CxInner>,
}

impl Cx {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a deterministic unix time for tests.
    pub fn set_unix_millis_for_testing(&self, millis: u64) {
        self.inner.unix_millis.store(millis, Ordering::Release);
    }

    /// Current unix time in milliseconds.
    #[must_use]
    pub fn unix_millis(&self) -> u64 {
        match self.inner.unix_millis.load(Ordering::Acquire) {
            0 => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            fixed => fixed,
        }
    }

    /// Return current time as a Julian day.
    #[must_use]
    pub fn current_time_julian_day(&self) -> f64 {
        #[allow(clippy::cast_precision_loss)]
        let secs = (self.unix_millis() as f64) / 1000.0;
        UNIX_EPOCH_JULIAN_DAY + (secs / 86_400.0)
    }

    // -----------------------------------------------------------------------
    // Pending error slot
    // -----------------------------------------------------------------------

    /// Record a pending error, replacing any previous one.
    pub fn set_pending_error(&self, error: PendingError) {
        *self.inner.pending_error.lock() = Some(error);
    }

    /// The currently pending error, if any.
    #[must_use]
    pub fn pending_error(&self) -> Option<PendingError> {
        self.inner.pending_error.lock().clone()
    }

    /// Remove and return the pending error.
    pub fn take_pending_error(&self) -> Option<PendingError> {
        self.inner.pending_error.lock().take()
    }

    /// Put back a previously taken pending error (or clear the slot).
    pub fn restore_pending_error(&self, saved: Option<PendingError>) {
        *self.inner.pending_error.lock() = saved;
    }

    /// Run `body` with the pending error slot cleared, then restore whatever
    /// was pending before, discarding anything `body` left behind.
    pub fn preserving_pending_error<R>(&self, body: impl FnOnce() -> R) -> R {
        let saved = self.take_pending_error();
        let result = body();
        self.restore_pending_error(saved);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_time() {
        let cx = Cx::new();
        cx.set_unix_millis_for_testing(86_400_000);
        assert_eq!(cx.unix_millis(), 86_400_000);
        let day = cx.current_time_julian_day();
        assert!((day - (UNIX_EPOCH_JULIAN_DAY + 1.0)).abs() < 1e-9);
    }

    #[test]
    fn system_time_when_not_fixed() {
        let cx = Cx::new();
        assert!(cx.unix_millis() > 1_600_000_000_000);
    }

    #[test]
    fn pending_error_take_and_restore() {
        let cx = Cx::new();
        assert_eq!(cx.pending_error(), None);

        cx.set_pending_error(PendingError::new(5, "busy"));
        let taken = cx.take_pending_error();
        assert_eq!(taken, Some(PendingError::new(5, "busy")));
        assert_eq!(cx.pending_error(), None);

        cx.restore_pending_error(taken);
        assert_eq!(cx.pending_error().map(|e| e.code), Some(5));
    }

    #[test]
    fn preserving_pending_error_discards_inner_changes() {
        let cx = Cx::new();
        cx.set_pending_error(PendingError::new(1, "outer failure"));

        let seen = cx.preserving_pending_error(|| {
            let seen = cx.pending_error();
            cx.set_pending_error(PendingError::new(2058, "inner failure"));
            seen
        });

        assert_eq!(seen, None, "body runs with a clean slot");
        assert_eq!(
            cx.pending_error(),
            Some(PendingError::new(1, "outer failure"))
        );
    }

    #[test]
    fn clones_share_state() {
        let cx = Cx::new();
        let other = cx.clone();
        other.set_pending_error(PendingError::new(10, "io"));
        assert_eq!(cx.pending_error().map(|e| e.code), Some(10));
    }
}
