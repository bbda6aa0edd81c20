//! Scripted VFS, file and arbiters for exercising the shim layer.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fairlock_error::{ErrorCode, FairlockError, Result};
use fairlock_types::LockLevel;
use fairlock_types::cx::{Cx, PendingError};
use fairlock_types::flags::{AccessFlags, SyncFlags, VfsOpenFlags};
use parking_lot::Mutex;

use crate::arbiter::{Arbiter, ArbiterError, LockForward};
use crate::connection::ConnectionId;
use crate::shm::ShmRegion;
use crate::traits::{Vfs, VfsFile};

type ArbiterResult = std::result::Result<(), ArbiterError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    RootOpen(String),
    RealLock(LockLevel),
    RealUnlock(LockLevel),
    RealClose,
    ArbiterLock(String, LockLevel),
    ArbiterUnlock(String, LockLevel),
}

/// Ordered record shared by scripted files and arbiters.
#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<Event>>>);

impl EventLog {
    pub fn push(&self, event: Event) {
        self.0.lock().push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.0.lock().clone()
    }

    pub fn clear(&self) {
        self.0.lock().clear();
    }
}

/// A one-shot result for the next call of a scripted operation.
#[derive(Debug, Clone, Copy)]
pub enum ScriptedOutcome {
    Fail(ErrorCode),
}

#[derive(Debug, Default)]
struct FileScript {
    level: LockLevel,
    lock: VecDeque<ScriptedOutcome>,
    unlock: VecDeque<ScriptedOutcome>,
    close: VecDeque<ScriptedOutcome>,
    closes: u32,
}

fn take(queue: &mut VecDeque<ScriptedOutcome>) -> Result<()> {
    match queue.pop_front() {
        Some(ScriptedOutcome::Fail(code)) => Err(FairlockError::Status(code)),
        None => Ok(()),
    }
}

/// Root file whose lock primitive is idempotent and scriptable. Clones share
/// state, so a test keeps a handle after giving the file to a shim.
#[derive(Debug, Clone)]
pub struct ScriptedFile {
    log: EventLog,
    io_version: u32,
    script: Arc<Mutex<FileScript>>,
}

impl ScriptedFile {
    pub fn new(log: EventLog, io_version: u32) -> Self {
        Self {
            log,
            io_version,
            script: Arc::default(),
        }
    }

    pub fn level(&self) -> LockLevel {
        self.script.lock().level
    }

    pub fn closes(&self) -> u32 {
        self.script.lock().closes
    }

    pub fn script_lock(&self, outcome: ScriptedOutcome) {
        self.script.lock().lock.push_back(outcome);
    }

    pub fn script_unlock(&self, outcome: ScriptedOutcome) {
        self.script.lock().unlock.push_back(outcome);
    }

    pub fn script_close(&self, outcome: ScriptedOutcome) {
        self.script.lock().close.push_back(outcome);
    }
}

impl VfsFile for ScriptedFile {
    fn io_version(&self) -> u32 {
        self.io_version
    }

    fn close(&mut self, _cx: &Cx) -> Result<()> {
        self.log.push(Event::RealClose);
        let mut script = self.script.lock();
        take(&mut script.close)?;
        script.closes += 1;
        Ok(())
    }

    fn read(&mut self, _cx: &Cx, buf: &mut [u8], _offset: u64) -> Result<usize> {
        buf.fill(0);
        Ok(0)
    }

    fn write(&mut self, _cx: &Cx, _buf: &[u8], _offset: u64) -> Result<()> {
        Ok(())
    }

    fn truncate(&mut self, _cx: &Cx, _size: u64) -> Result<()> {
        Ok(())
    }

    fn sync(&mut self, _cx: &Cx, _flags: SyncFlags) -> Result<()> {
        Ok(())
    }

    fn file_size(&self, _cx: &Cx) -> Result<u64> {
        Ok(0)
    }

    fn lock(&mut self, _cx: &Cx, level: LockLevel) -> Result<()> {
        self.log.push(Event::RealLock(level));
        let mut script = self.script.lock();
        take(&mut script.lock)?;
        script.level = script.level.max(level);
        Ok(())
    }

    fn unlock(&mut self, _cx: &Cx, level: LockLevel) -> Result<()> {
        self.log.push(Event::RealUnlock(level));
        let mut script = self.script.lock();
        take(&mut script.unlock)?;
        script.level = script.level.min(level);
        Ok(())
    }

    fn check_reserved_lock(&self, _cx: &Cx) -> Result<bool> {
        Ok(self.script.lock().level > LockLevel::Shared)
    }

    fn shm_map(&mut self, _cx: &Cx, _region: u32, size: u32, _extend: bool) -> Result<ShmRegion> {
        Ok(ShmRegion::new(size as usize))
    }

    fn shm_lock(&mut self, _cx: &Cx, _offset: u32, _n: u32, _flags: u32) -> Result<()> {
        Ok(())
    }

    fn shm_barrier(&self) {}

    fn shm_unmap(&mut self, _cx: &Cx, _delete: bool) -> Result<()> {
        Ok(())
    }
}

/// Root VFS producing [`ScriptedFile`]s.
#[derive(Debug)]
pub struct ScriptedVfs {
    name: String,
    version: u32,
    io_version: u32,
    log: EventLog,
    opened: Mutex<Vec<ScriptedFile>>,
}

impl ScriptedVfs {
    pub fn new(name: &str, version: u32, io_version: u32, log: EventLog) -> Self {
        Self {
            name: name.to_owned(),
            version,
            io_version,
            log,
            opened: Mutex::default(),
        }
    }

    /// The most recently opened file.
    pub fn last_opened(&self) -> Option<ScriptedFile> {
        self.opened.lock().last().cloned()
    }
}

impl Vfs for ScriptedVfs {
    type File = ScriptedFile;

    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> u32 {
        self.version
    }

    fn open(
        &self,
        _cx: &Cx,
        path: Option<&Path>,
        flags: VfsOpenFlags,
    ) -> Result<(Self::File, VfsOpenFlags)> {
        let name = path.map(|p| p.display().to_string()).unwrap_or_default();
        self.log.push(Event::RootOpen(name));
        let file = ScriptedFile::new(self.log.clone(), self.io_version);
        self.opened.lock().push(file.clone());
        Ok((file, flags))
    }

    fn delete(&self, _cx: &Cx, _path: &Path, _sync_dir: bool) -> Result<()> {
        Ok(())
    }

    fn access(&self, _cx: &Cx, _path: &Path, _flags: AccessFlags) -> Result<bool> {
        Ok(true)
    }

    fn full_pathname(&self, _cx: &Cx, path: &Path) -> Result<PathBuf> {
        Ok(Path::new("/scripted").join(path))
    }

    fn current_time(&self, _cx: &Cx) -> f64 {
        2_460_000.5
    }

    fn current_time_i64(&self, _cx: &Cx) -> i64 {
        42
    }

    fn next_system_call(&self, after: Option<&str>) -> Option<&'static str> {
        after.is_none().then_some("open")
    }
}

/// Records calls and takes the real lock exactly as asked.
#[derive(Debug, Clone)]
pub struct ForwardingArbiter {
    log: EventLog,
    results: Arc<Mutex<Vec<(LockLevel, ErrorCode)>>>,
}

impl ForwardingArbiter {
    pub fn new(log: EventLog) -> Self {
        Self {
            log,
            results: Arc::default(),
        }
    }

    /// Statuses reported through `lock_result`, oldest first.
    pub fn results(&self) -> Vec<(LockLevel, ErrorCode)> {
        self.results.lock().clone()
    }
}

impl Arbiter for ForwardingArbiter {
    fn lock(
        &self,
        _cx: &Cx,
        forward: &mut LockForward<'_>,
        filename: &str,
        level: LockLevel,
        _connection: ConnectionId,
    ) -> ArbiterResult {
        self.log
            .push(Event::ArbiterLock(filename.to_owned(), level));
        forward(level)?;
        Ok(())
    }

    fn unlock(
        &self,
        _cx: &Cx,
        filename: &str,
        level: LockLevel,
        _connection: ConnectionId,
    ) -> ArbiterResult {
        self.log
            .push(Event::ArbiterUnlock(filename.to_owned(), level));
        Ok(())
    }

    fn lock_result(
        &self,
        _cx: &Cx,
        _filename: &str,
        level: LockLevel,
        _connection: ConnectionId,
        status: ErrorCode,
    ) {
        self.results.lock().push((level, status));
    }
}

/// Fails lock or unlock with a fixed error; otherwise forwards.
#[derive(Debug, Clone, Default)]
pub struct FailingArbiter {
    lock: Option<ArbiterError>,
    unlock: Option<ArbiterError>,
}

impl FailingArbiter {
    pub fn lock_error(err: ArbiterError) -> Self {
        Self {
            lock: Some(err),
            unlock: None,
        }
    }

    pub fn unlock_error(err: ArbiterError) -> Self {
        Self {
            lock: None,
            unlock: Some(err),
        }
    }
}

impl Arbiter for FailingArbiter {
    fn lock(
        &self,
        _cx: &Cx,
        forward: &mut LockForward<'_>,
        _filename: &str,
        level: LockLevel,
        _connection: ConnectionId,
    ) -> ArbiterResult {
        if let Some(err) = &self.lock {
            return Err(err.clone());
        }
        forward(level)?;
        Ok(())
    }

    fn unlock(
        &self,
        _cx: &Cx,
        _filename: &str,
        _level: LockLevel,
        _connection: ConnectionId,
    ) -> ArbiterResult {
        self.unlock.clone().map_or(Ok(()), Err)
    }
}

/// Claims every lock without taking the real one.
#[derive(Debug, Clone, Copy)]
pub struct LyingArbiter;

impl Arbiter for LyingArbiter {
    fn lock(
        &self,
        _cx: &Cx,
        _forward: &mut LockForward<'_>,
        _filename: &str,
        _level: LockLevel,
        _connection: ConnectionId,
    ) -> ArbiterResult {
        Ok(())
    }

    fn unlock(
        &self,
        _cx: &Cx,
        _filename: &str,
        _level: LockLevel,
        _connection: ConnectionId,
    ) -> ArbiterResult {
        Ok(())
    }
}

/// Overwrites the caller's pending error while handling unlock.
#[derive(Debug, Clone, Copy)]
pub struct ClobberingArbiter;

impl Arbiter for ClobberingArbiter {
    fn lock(
        &self,
        _cx: &Cx,
        forward: &mut LockForward<'_>,
        _filename: &str,
        level: LockLevel,
        _connection: ConnectionId,
    ) -> ArbiterResult {
        forward(level)?;
        Ok(())
    }

    fn unlock(
        &self,
        cx: &Cx,
        _filename: &str,
        _level: LockLevel,
        _connection: ConnectionId,
    ) -> ArbiterResult {
        cx.set_pending_error(PendingError::new(1, "arbiter scratch error"));
        Ok(())
    }
}

/// Panics on every call.
#[derive(Debug, Clone, Copy)]
pub struct PanickingArbiter;

impl Arbiter for PanickingArbiter {
    fn lock(
        &self,
        _cx: &Cx,
        _forward: &mut LockForward<'_>,
        filename: &str,
        _level: LockLevel,
        _connection: ConnectionId,
    ) -> ArbiterResult {
        panic!("lock table corrupted for {filename}");
    }

    fn unlock(
        &self,
        _cx: &Cx,
        filename: &str,
        _level: LockLevel,
        _connection: ConnectionId,
    ) -> ArbiterResult {
        panic!("lock table corrupted for {filename}");
    }
}
