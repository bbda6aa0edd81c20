//! A fair shared/exclusive lock arbiter for database threads in one process.
//!
//! The engine's own file locks are non-blocking: a connection that loses a
//! race retries, and a busy writer can starve everyone else. [`FairArbiter`]
//! sits in front of the real lock and makes requests wait their turn in
//! arrival order, per database file. It still takes the real lock for every
//! grant so other processes stay protected.

mod file_lock;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::{Duration, Instant};

use fairlock_types::LockLevel;
use fairlock_types::cx::Cx;
use fairlock_vfs::{Arbiter, ArbiterError, ConnectionId, LockForward};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::file_lock::{Admission, FileLock, Signal};

/// Levels the real lock is taken at, in order.
const STEPS: [LockLevel; 3] = [LockLevel::Shared, LockLevel::Reserved, LockLevel::Exclusive];

/// Tuning for [`FairArbiter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FairArbiterConfig {
    /// How long a request may wait before it is reported as a deadlock.
    /// `None` waits forever.
    pub timeout: Option<Duration>,
}

impl Default for FairArbiterConfig {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_secs(5)),
        }
    }
}

/// Snapshot of what the arbiter is tracking.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ArbiterStats {
    /// Number of holders at each level, across all files.
    pub holders: BTreeMap<LockLevel, usize>,
    pub blocked: usize,
    pub files: usize,
}

#[derive(Debug, Default)]
struct ArbiterState {
    files: HashMap<String, FileLock>,
}

impl ArbiterState {
    fn forget_if_idle(&mut self, filename: &str) {
        if self.files.get(filename).is_some_and(FileLock::is_idle) {
            self.files.remove(filename);
        }
    }
}

/// Fair arbiter keyed by filename.
///
/// SHARED requests queue behind a PENDING or EXCLUSIVE holder and behind
/// anything already queued. A writer waiting for readers to drain holds
/// PENDING, which keeps new readers out. Upgrades that can never succeed
/// (a second RESERVED, or EXCLUSIVE against another writer, from a
/// connection that already holds a lock) fail with
/// [`ArbiterError::Deadlock`] instead of waiting.
#[derive(Debug, Default)]
pub struct FairArbiter {
    state: Mutex<ArbiterState>,
    config: FairArbiterConfig,
}

impl FairArbiter {
    #[must_use]
    pub fn new(config: FairArbiterConfig) -> Self {
        Self {
            state: Mutex::default(),
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> FairArbiterConfig {
        self.config
    }

    /// True when no file has holders or waiters.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.state.lock().files.is_empty()
    }

    /// The level `connection` holds on `filename` in the arbiter's books.
    #[must_use]
    pub fn level_of(&self, filename: &str, connection: ConnectionId) -> LockLevel {
        self.state
            .lock()
            .files
            .get(filename)
            .map_or(LockLevel::None, |file| file.level_of(connection))
    }

    #[must_use]
    pub fn stats(&self) -> ArbiterStats {
        let state = self.state.lock();
        let mut stats = ArbiterStats {
            files: state.files.len(),
            ..ArbiterStats::default()
        };
        for file in state.files.values() {
            file.count_levels(&mut stats.holders);
            stats.blocked += file.blocked();
        }
        stats
    }

    /// Raise `connection` to `level` in the books, blocking as needed.
    /// Returns the level held before.
    fn acquire(
        &self,
        filename: &str,
        level: LockLevel,
        connection: ConnectionId,
    ) -> Result<LockLevel, ArbiterError> {
        let mut state = self.state.lock();
        let file = state.files.entry(filename.to_owned()).or_default();
        let old = file.level_of(connection);
        if level <= old {
            return Ok(old);
        }

        let outcome = match file.admit(connection, old, level) {
            Admission::Granted => Ok(old),
            Admission::Deadlock => {
                debug!(file = filename, %connection, %old, %level, "upgrade would deadlock");
                Err(ArbiterError::Deadlock)
            }
            Admission::Wait { front } => {
                let signal = file.enqueue(connection, level, front);
                debug!(file = filename, %connection, %level, "lock request blocked");
                if self.wait_for_grant(&mut state, &signal) {
                    Ok(old)
                } else {
                    if let Some(file) = state.files.get_mut(filename) {
                        file.cancel(&signal, connection, old);
                    }
                    warn!(
                        file = filename,
                        %connection,
                        %level,
                        timeout = ?self.config.timeout,
                        "lock wait timed out"
                    );
                    Err(ArbiterError::Deadlock)
                }
            }
        };
        state.forget_if_idle(filename);
        outcome
    }

    /// Block until `signal` is granted or the timeout passes. Returns
    /// whether it was granted.
    fn wait_for_grant(&self, state: &mut MutexGuard<'_, ArbiterState>, signal: &Signal) -> bool {
        let deadline = self
            .config
            .timeout
            .and_then(|timeout| Instant::now().checked_add(timeout));
        while !signal.is_granted() {
            match deadline {
                Some(deadline) => {
                    if signal.cv.wait_until(state, deadline).timed_out() {
                        return signal.is_granted();
                    }
                }
                None => signal.cv.wait(state),
            }
        }
        true
    }

    fn release(&self, filename: &str, level: LockLevel, connection: ConnectionId) {
        let mut state = self.state.lock();
        let Some(file) = state.files.get_mut(filename) else {
            return;
        };
        if file.lower(connection, level) {
            debug!(file = filename, %connection, %level, "arbiter lock lowered");
        }
        state.forget_if_idle(filename);
    }
}

impl Arbiter for FairArbiter {
    fn lock(
        &self,
        _cx: &Cx,
        forward: &mut LockForward<'_>,
        filename: &str,
        level: LockLevel,
        connection: ConnectionId,
    ) -> Result<(), ArbiterError> {
        if !STEPS.contains(&level) {
            return Err(ArbiterError::Failed(format!(
                "{level} cannot be requested directly"
            )));
        }
        let old = self.acquire(filename, level, connection)?;
        for step in STEPS.into_iter().filter(|s| *s > old && *s <= level) {
            if let Err(err) = forward(step) {
                debug!(file = filename, %connection, %step, error = %err, "real lock refused");
                self.release(filename, old, connection);
                return Err(ArbiterError::Coded(err.error_code()));
            }
        }
        Ok(())
    }

    fn unlock(
        &self,
        _cx: &Cx,
        filename: &str,
        level: LockLevel,
        connection: ConnectionId,
    ) -> Result<(), ArbiterError> {
        self.release(filename, level, connection);
        Ok(())
    }
}

impl fmt::Display for FairArbiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.stats();
        f.write_str("FairArbiter{")?;
        if stats.holders.is_empty() {
            f.write_str("IDLE")?;
        } else {
            for (i, (level, count)) in stats.holders.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{level}: {count}")?;
            }
        }
        write!(f, ", {} blocked}}", stats.blocked)
    }
}
