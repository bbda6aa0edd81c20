//! End-to-end lock coordination over the in-memory backend.

use std::path::Path;
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use fairlock::types::cx::Cx;
use fairlock::types::flags::VfsOpenFlags;
use fairlock::vfs::{
    Arbiter, ArbiterError, ConnectionId, FileControl, FileControlReply, LockForward, MemoryVfs,
    ShimFile, Vfs, VfsFile,
};
use fairlock::{Environment, ErrorCode, FairlockConfig, FairlockError, LockLevel};

const DB: &str = "main.db";
/// How the memory VFS names `DB` in full.
const DB_FULL: &str = "/main.db";

fn environment(fair_locking: bool) -> Environment {
    let config = FairlockConfig {
        fair_locking,
        lock_timeout_ms: None,
        ..FairlockConfig::default()
    };
    Environment::with_root_vfs(config, Arc::new(MemoryVfs::new())).unwrap()
}

fn real_level(file: &mut ShimFile) -> LockLevel {
    match file.file_control(&Cx::new(), FileControl::LockState).unwrap() {
        FileControlReply::LockState(level) => level,
        FileControlReply::Done => panic!("lock state not reported"),
    }
}

fn wait_for(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached");
        thread::sleep(Duration::from_millis(5));
    }
}

#[derive(Default)]
struct Recorder {
    calls: Mutex<Vec<(String, LockLevel, ConnectionId, bool)>>,
}

impl Arbiter for Recorder {
    fn lock(
        &self,
        _cx: &Cx,
        forward: &mut LockForward<'_>,
        filename: &str,
        level: LockLevel,
        connection: ConnectionId,
    ) -> Result<(), ArbiterError> {
        self.calls
            .lock()
            .unwrap()
            .push((filename.to_owned(), level, connection, true));
        forward(level)?;
        Ok(())
    }

    fn unlock(
        &self,
        _cx: &Cx,
        filename: &str,
        level: LockLevel,
        connection: ConnectionId,
    ) -> Result<(), ArbiterError> {
        self.calls
            .lock()
            .unwrap()
            .push((filename.to_owned(), level, connection, false));
        Ok(())
    }
}

#[test]
fn writer_waits_for_reader_then_gets_exclusive() {
    let env = environment(true);
    let arbiter = Arc::clone(env.fair_arbiter().unwrap());
    let reader = env.connect("reader").unwrap();
    let writer = env.connect("writer").unwrap();
    let cx = Cx::new();

    let mut read_file = reader.open_main(&cx, Path::new(DB)).unwrap();
    let mut write_file = writer.open_main(&cx, Path::new(DB)).unwrap();
    assert!(read_file.is_coordinated());
    read_file.lock(&cx, LockLevel::Shared).unwrap();

    let (tx, rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        let cx = Cx::new();
        for level in [LockLevel::Shared, LockLevel::Reserved, LockLevel::Exclusive] {
            write_file.lock(&cx, level).unwrap();
        }
        tx.send(()).unwrap();
        write_file
    });

    wait_for(|| arbiter.level_of(DB_FULL, writer.id()) == LockLevel::Pending);
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

    read_file.unlock(&cx, LockLevel::None).unwrap();
    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let mut write_file = handle.join().unwrap();

    assert_eq!(real_level(&mut write_file), LockLevel::Exclusive);
    assert_eq!(real_level(&mut read_file), LockLevel::None);
    assert_eq!(arbiter.level_of(DB_FULL, writer.id()), LockLevel::Exclusive);

    write_file.unlock(&cx, LockLevel::None).unwrap();
    assert!(arbiter.is_idle());
}

#[test]
fn conflicting_upgrade_reports_busy() {
    let env = environment(true);
    let a = env.connect("a").unwrap();
    let b = env.connect("b").unwrap();
    let cx = Cx::new();
    let mut fa = a.open_main(&cx, Path::new(DB)).unwrap();
    let mut fb = b.open_main(&cx, Path::new(DB)).unwrap();

    fa.lock(&cx, LockLevel::Shared).unwrap();
    fa.lock(&cx, LockLevel::Reserved).unwrap();
    fb.lock(&cx, LockLevel::Shared).unwrap();

    let err = fb.lock(&cx, LockLevel::Reserved).unwrap_err();
    assert!(matches!(err, FairlockError::Busy));
    assert!(err.is_transient());
    assert_eq!(real_level(&mut fb), LockLevel::Shared);
}

#[test]
fn minimum_level_raises_requests() {
    let env = environment(true);
    let conn = env.connect("floor").unwrap();
    let cx = Cx::new();
    conn.set_minimum_lock_level(LockLevel::Reserved).unwrap();
    assert_eq!(conn.minimum_lock_level(), LockLevel::Reserved);

    let mut file = conn.open_main(&cx, Path::new(DB)).unwrap();
    file.lock(&cx, LockLevel::Shared).unwrap();
    assert_eq!(real_level(&mut file), LockLevel::Reserved);
    assert_eq!(
        env.fair_arbiter().unwrap().level_of(DB_FULL, conn.id()),
        LockLevel::Reserved
    );
}

#[test]
fn installed_arbiter_sees_filename_and_connection() {
    let env = environment(false);
    let recorder = Arc::new(Recorder::default());
    env.install_arbiter(Arc::clone(&recorder) as Arc<dyn Arbiter>);
    let conn = env.connect("recorded").unwrap();
    let cx = Cx::new();

    let mut file = conn.open_main(&cx, Path::new(DB)).unwrap();
    file.lock(&cx, LockLevel::Shared).unwrap();
    file.unlock(&cx, LockLevel::None).unwrap();

    let journal = VfsOpenFlags::MAIN_JOURNAL | VfsOpenFlags::CREATE | VfsOpenFlags::READWRITE;
    let (mut side, _) = conn
        .vfs()
        .open(&cx, Some(Path::new("main.db-journal")), journal)
        .unwrap();
    side.lock(&cx, LockLevel::Shared).unwrap();

    let calls = recorder.calls.lock().unwrap().clone();
    assert_eq!(
        calls,
        vec![
            (DB_FULL.to_owned(), LockLevel::Shared, conn.id(), true),
            (DB_FULL.to_owned(), LockLevel::None, conn.id(), false),
        ]
    );
}

#[test]
fn coordination_is_off_by_default() {
    let env = environment(false);
    assert!(env.fair_arbiter().is_none());
    let conn = env.connect("plain").unwrap();
    let cx = Cx::new();
    let mut file = conn.open_main(&cx, Path::new(DB)).unwrap();
    assert!(!file.is_coordinated());
    file.lock(&cx, LockLevel::Exclusive).unwrap();
    assert_eq!(real_level(&mut file), LockLevel::Exclusive);
}

#[test]
fn missing_arbiter_fails_the_open() {
    let env = environment(true);
    let conn = env.connect("orphan").unwrap();
    env.arbiters().remove(&env.config().arbiter_name);
    let err = conn.open_main(&Cx::new(), Path::new(DB)).unwrap_err();
    assert!(matches!(err, FairlockError::ArbiterNotFound { .. }));
    assert_eq!(err.error_code(), ErrorCode::Error);
}

#[test]
fn closing_a_connection_unregisters_everything() {
    let env = environment(true);
    let conn = env.connect("short-lived").unwrap();
    let id = conn.id();
    let name = conn.vfs_name().to_owned();
    assert!(env.vfs_registry().find(Some(&name)).is_some());
    assert_eq!(env.vfs_registry().find(None).unwrap().name(), "memory");

    conn.close();
    assert!(env.vfs_registry().find(Some(&name)).is_none());
    assert!(!env.connections().contains(id));
    assert!(env.connections().is_empty());

    {
        let _dropped = env.connect("dropped").unwrap();
        assert_eq!(env.connections().len(), 1);
    }
    assert!(env.connections().is_empty());
    assert_eq!(env.vfs_registry().names(), ["memory"]);
}

#[test]
fn unknown_root_vfs_rejects_connect() {
    let config = FairlockConfig {
        root_vfs: Some("nowhere".to_owned()),
        ..FairlockConfig::default()
    };
    let env = Environment::with_root_vfs(config, Arc::new(MemoryVfs::new())).unwrap();
    let err = env.connect("lost").unwrap_err();
    assert!(matches!(err, FairlockError::VfsNotFound { .. }));
    assert!(env.connections().is_empty());
}

#[test]
fn connection_vfs_reports_root_capabilities() {
    let env = environment(true);
    let conn = env.connect("caps").unwrap();
    let vfs = conn.vfs();
    assert_eq!(vfs.version(), 2);
    assert_eq!(vfs.root_name(), "memory");
    assert_eq!(vfs.next_system_call(None), None);
}

#[test]
fn path_spellings_share_one_lock_record() {
    let env = environment(true);
    let arbiter = Arc::clone(env.fair_arbiter().unwrap());
    let a = env.connect("plain").unwrap();
    let b = env.connect("dotted").unwrap();
    let cx = Cx::new();

    let mut fa = a.open_main(&cx, Path::new(DB)).unwrap();
    let mut fb = b.open_main(&cx, Path::new("./tmp/../main.db")).unwrap();
    fa.lock(&cx, LockLevel::Shared).unwrap();
    fb.lock(&cx, LockLevel::Shared).unwrap();
    assert_eq!(arbiter.stats().files, 1);

    let (tx, rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        let cx = Cx::new();
        fb.lock(&cx, LockLevel::Reserved).unwrap();
        fb.lock(&cx, LockLevel::Exclusive).unwrap();
        tx.send(()).unwrap();
        fb
    });

    wait_for(|| arbiter.level_of(DB_FULL, b.id()) == LockLevel::Pending);
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

    fa.unlock(&cx, LockLevel::None).unwrap();
    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let mut fb = handle.join().unwrap();
    assert_eq!(real_level(&mut fb), LockLevel::Exclusive);
    fb.unlock(&cx, LockLevel::None).unwrap();
    assert!(arbiter.is_idle());
}
