//! Lock and unlock protocol between a file shim, its arbiter and the real
//! lock primitive.
//!
//! Lock: raise the request to the connection's floor, let the arbiter decide
//! (it takes the real lock through a forwarding callback), translate the
//! arbiter's outcome into an engine status, then re-check the originally
//! requested level against the real primitive. An arbiter that reports
//! success without holding the real lock is caught by that re-check.
//!
//! Unlock: release the real lock first, then tell the arbiter.
//!
//! A panic inside the arbiter is caught here and reported like any other
//! arbiter defect.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};

use fairlock_error::{ErrorCode, FairlockError, Result};
use fairlock_types::LockLevel;
use fairlock_types::cx::Cx;
use tracing::{debug, error};

use crate::arbiter::{Arbiter, ArbiterError};
use crate::connection::{ConnectionId, ConnectionRegistry};
use crate::traits::VfsFile;

/// Everything a lock decision needs besides the real file.
#[derive(Clone, Copy)]
pub struct LockTarget<'a> {
    pub filename: &'a str,
    pub connection: ConnectionId,
    pub connections: &'a ConnectionRegistry,
    pub arbiter: &'a dyn Arbiter,
}

/// The level the arbiter is asked for: `requested`, raised to the
/// connection's floor when the connection is still live.
#[must_use]
pub fn effective_level(target: &LockTarget<'_>, requested: LockLevel) -> LockLevel {
    match target.connections.minimum_lock_level(target.connection) {
        Some(floor) if floor > requested => {
            debug!(
                file = target.filename,
                connection = %target.connection,
                requested = %requested,
                floor = %floor,
                "raising lock request to connection floor"
            );
            floor
        }
        Some(_) => requested,
        None => {
            debug!(
                file = target.filename,
                connection = %target.connection,
                "connection gone; locking without a floor"
            );
            requested
        }
    }
}

fn panic_detail(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_owned())
}

/// Run an arbiter call, turning a panic into [`ArbiterError::Failed`].
fn guarded<T>(
    call: impl FnOnce() -> std::result::Result<T, ArbiterError>,
) -> std::result::Result<T, ArbiterError> {
    catch_unwind(AssertUnwindSafe(call)).unwrap_or_else(|payload| {
        Err(ArbiterError::Failed(format!(
            "arbiter panicked: {}",
            panic_detail(payload.as_ref())
        )))
    })
}

/// Acquire `requested` on `root` under the arbiter's policy.
///
/// The arbiter's [`lock_result`](Arbiter::lock_result) hook hears the final
/// status, whatever it is.
pub fn coordinate_lock(
    cx: &Cx,
    root: &mut dyn VfsFile,
    target: &LockTarget<'_>,
    requested: LockLevel,
) -> Result<()> {
    let level = effective_level(target, requested);
    let result = arbitrate_lock(cx, root, target, level, requested);

    let status = match &result {
        Ok(()) => ErrorCode::Ok,
        Err(err) => err.error_code(),
    };
    let reported = guarded(|| {
        target
            .arbiter
            .lock_result(cx, target.filename, level, target.connection, status);
        Ok(())
    });
    if let Err(err) = reported {
        error!(
            file = target.filename,
            level = %level,
            error = %err,
            "arbiter lock_result hook failed"
        );
    }
    result
}

fn arbitrate_lock(
    cx: &Cx,
    root: &mut dyn VfsFile,
    target: &LockTarget<'_>,
    level: LockLevel,
    requested: LockLevel,
) -> Result<()> {
    let outcome = {
        let mut forward = |l: LockLevel| root.lock(cx, l);
        guarded(|| {
            target
                .arbiter
                .lock(cx, &mut forward, target.filename, level, target.connection)
        })
    };

    match outcome {
        Ok(()) => {}
        Err(ArbiterError::Deadlock) => {
            debug!(
                file = target.filename,
                level = %level,
                "arbiter reported deadlock; returning busy"
            );
            return Err(FairlockError::Busy);
        }
        Err(ArbiterError::Coded(ErrorCode::Ok)) => {
            error!(
                file = target.filename,
                level = %level,
                "arbiter failed the lock with a success status"
            );
            return Err(FairlockError::lock_io(
                target.filename,
                "arbiter failed the lock with a success status",
            ));
        }
        Err(ArbiterError::Coded(code)) => return Err(FairlockError::Status(code)),
        Err(ArbiterError::Failed(detail)) => {
            error!(
                file = target.filename,
                level = %level,
                connection = %target.connection,
                detail = %detail,
                "lock arbiter failed"
            );
            return Err(FairlockError::lock_io(target.filename, detail));
        }
    }

    if let Err(err) = root.lock(cx, requested) {
        error!(
            file = target.filename,
            level = %requested,
            error = %err,
            "lock arbiter failed to lock file '{}' at level {}",
            target.filename,
            requested
        );
        return Err(FairlockError::ArbiterContract {
            path: target.filename.to_owned(),
            level: requested.name(),
        });
    }
    Ok(())
}

/// Lower `root` to `level`, then notify the arbiter.
///
/// A failed real unlock is returned untouched and the arbiter is not told.
/// The caller's pending error survives the arbiter call.
pub fn coordinate_unlock(
    cx: &Cx,
    root: &mut dyn VfsFile,
    target: &LockTarget<'_>,
    level: LockLevel,
) -> Result<()> {
    root.unlock(cx, level)?;

    let notified = cx.preserving_pending_error(|| {
        guarded(|| {
            target
                .arbiter
                .unlock(cx, target.filename, level, target.connection)
        })
    });
    if let Err(err) = notified {
        error!(
            file = target.filename,
            level = %level,
            connection = %target.connection,
            error = %err,
            "arbiter unlock notification failed after the real unlock"
        );
        return Err(FairlockError::unlock_io(target.filename, err.to_string()));
    }
    Ok(())
}
