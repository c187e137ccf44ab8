//! In-memory fakes for the capability traits.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use nfsvol_common::{DriverError, DriverResult, RawOptions};
use parking_lot::Mutex;
use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::invoker::{InvokeError, InvokeResult, Invoker};
use crate::mountchecker::MountChecker;
use crate::mounter::Mounter;
use crate::os::{Clock, FileStat, FileSystem};
use crate::resolver::{IdResolver, Identity};

/// Canned outcome for one invocation.
#[derive(Debug, Clone)]
pub struct Scripted {
    pub result: Result<(), InvokeError>,
    pub stdout: String,
}

impl Scripted {
    pub fn ok() -> Self {
        Self {
            result: Ok(()),
            stdout: String::new(),
        }
    }

    pub fn failing(err: InvokeError) -> Self {
        Self {
            result: Err(err),
            stdout: String::new(),
        }
    }
}

/// A recorded invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub marker: Option<String>,
}

/// [`Invoker`] that records calls and replays scripted outcomes per program.
///
/// Programs without a script succeed.
#[derive(Default)]
pub struct FakeInvoker {
    calls: Arc<Mutex<Vec<Invocation>>>,
    scripts: Mutex<HashMap<String, VecDeque<Scripted>>>,
    sticky: Mutex<HashMap<String, Scripted>>,
}

impl FakeInvoker {
    /// Queue an outcome for `program`. The last queued outcome repeats.
    pub fn script(&self, program: &str, outcome: Scripted) {
        self.scripts
            .lock()
            .entry(program.to_string())
            .or_default()
            .push_back(outcome.clone());
        self.sticky.lock().insert(program.to_string(), outcome);
    }

    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().clone()
    }

    fn next(&self, program: &str) -> Scripted {
        if let Some(outcome) = self
            .scripts
            .lock()
            .get_mut(program)
            .and_then(VecDeque::pop_front)
        {
            return outcome;
        }
        self.sticky
            .lock()
            .get(program)
            .cloned()
            .unwrap_or_else(Scripted::ok)
    }
}

impl Invoker for FakeInvoker {
    fn invoke(
        &self,
        _ctx: &CancellationToken,
        program: &str,
        args: &[String],
        _env: &[String],
    ) -> Box<dyn InvokeResult> {
        let index = {
            let mut calls = self.calls.lock();
            calls.push(Invocation {
                program: program.to_string(),
                args: args.to_vec(),
                marker: None,
            });
            calls.len() - 1
        };
        Box::new(FakeResult {
            outcome: self.next(program),
            calls: Arc::clone(&self.calls),
            index,
        })
    }
}

struct FakeResult {
    outcome: Scripted,
    calls: Arc<Mutex<Vec<Invocation>>>,
    index: usize,
}

#[async_trait]
impl InvokeResult for FakeResult {
    fn stdout(&self) -> String {
        self.outcome.stdout.clone()
    }

    fn stderr(&self) -> String {
        String::new()
    }

    async fn wait(&self) -> Result<(), InvokeError> {
        self.outcome.result.clone()
    }

    async fn wait_for(&self, marker: &str, _timeout: Duration) -> Result<(), InvokeError> {
        if let Some(call) = self.calls.lock().get_mut(self.index) {
            call.marker = Some(marker.to_string());
        }
        self.outcome.result.clone()
    }
}

/// [`FileSystem`] held in memory. Every path is absolute as given.
#[derive(Default)]
pub struct MemoryFileSystem {
    dirs: Mutex<BTreeMap<PathBuf, Option<FileStat>>>,
    files: Mutex<BTreeMap<PathBuf, Vec<u8>>>,
    removals: Mutex<Vec<PathBuf>>,
}

impl MemoryFileSystem {
    pub fn contains(&self, path: &Path) -> bool {
        self.dirs.lock().contains_key(path) || self.files.lock().contains_key(path)
    }

    /// Create `path` with the given ownership.
    pub fn set_stat(&self, path: &Path, stat: FileStat) {
        self.dirs.lock().insert(path.to_path_buf(), Some(stat));
    }

    /// Every path passed to `remove`, successful or not.
    pub fn removals(&self) -> Vec<PathBuf> {
        self.removals.lock().clone()
    }
}

impl FileSystem for MemoryFileSystem {
    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        let mut dirs = self.dirs.lock();
        for ancestor in path.ancestors() {
            dirs.entry(ancestor.to_path_buf()).or_insert(None);
        }
        Ok(())
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        self.removals.lock().push(path.to_path_buf());
        let removed_dir = self.dirs.lock().remove(path).is_some();
        let removed_file = self.files.lock().remove(path).is_some();
        if removed_dir || removed_file {
            Ok(())
        } else {
            Err(io::Error::new(io::ErrorKind::NotFound, "no such file"))
        }
    }

    fn exists(&self, path: &Path) -> io::Result<bool> {
        Ok(self.contains(path))
    }

    fn stat(&self, path: &Path) -> io::Result<FileStat> {
        match self.dirs.lock().get(path) {
            Some(Some(stat)) => Ok(*stat),
            Some(None) => Err(io::Error::new(io::ErrorKind::PermissionDenied, "stat denied")),
            None => Err(io::Error::new(io::ErrorKind::NotFound, "no such file")),
        }
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        self.files
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such file"))
    }

    fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        self.files
            .lock()
            .insert(path.to_path_buf(), contents.to_vec());
        Ok(())
    }

    fn absolute(&self, path: &Path) -> io::Result<PathBuf> {
        Ok(Path::new("/").join(path))
    }
}

/// [`MountChecker`] over an editable list of mount points.
#[derive(Default)]
pub struct FakeMountChecker {
    mounts: Mutex<Vec<String>>,
}

impl FakeMountChecker {
    pub fn add(&self, path: &str) {
        self.mounts.lock().push(path.to_string());
    }

    pub fn remove(&self, path: &str) {
        self.mounts.lock().retain(|m| m != path);
    }
}

impl MountChecker for FakeMountChecker {
    fn exists(&self, path: &Path) -> io::Result<bool> {
        let wanted = path.to_string_lossy();
        Ok(self.mounts.lock().iter().any(|m| *m == wanted))
    }

    fn list(&self, pattern: &Regex) -> io::Result<Vec<String>> {
        Ok(self
            .mounts
            .lock()
            .iter()
            .filter(|m| pattern.is_match(m))
            .cloned()
            .collect())
    }
}

/// [`IdResolver`] returning a fixed outcome.
pub struct FakeResolver {
    outcome: Mutex<Option<DriverResult<Identity>>>,
    calls: Mutex<Vec<(String, String)>>,
}

impl FakeResolver {
    pub fn returning(outcome: DriverResult<Identity>) -> Self {
        Self {
            outcome: Mutex::new(Some(outcome)),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl IdResolver for FakeResolver {
    async fn resolve(
        &self,
        _ctx: &CancellationToken,
        username: &str,
        password: &str,
    ) -> DriverResult<Identity> {
        self.calls
            .lock()
            .push((username.to_string(), password.to_string()));
        match self.outcome.lock().as_ref() {
            Some(Ok(identity)) => Ok(identity.clone()),
            Some(Err(e)) => Err(DriverError::safe(e.to_string())),
            None => Err(DriverError::safe("no identity scripted")),
        }
    }
}

/// [`Clock`] advanced by hand.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Instant>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self {
            now: Mutex::new(Instant::now()),
        }
    }
}

impl ManualClock {
    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock()
    }
}

/// [`Mounter`] that tracks calls and mirrors mounts into a [`FakeMountChecker`].
pub struct FakeMounter {
    checker: Arc<FakeMountChecker>,
    mounts: AtomicUsize,
    unmounts: AtomicUsize,
    checks: AtomicUsize,
    live: AtomicBool,
    mount_error: Mutex<Option<String>>,
    unmount_error: Mutex<Option<String>>,
    opaque_mount_error: AtomicBool,
    slow: Mutex<Option<(Arc<ManualClock>, Duration)>>,
    purged: Mutex<Vec<PathBuf>>,
}

impl FakeMounter {
    pub fn new(checker: Arc<FakeMountChecker>) -> Self {
        Self {
            checker,
            mounts: AtomicUsize::new(0),
            unmounts: AtomicUsize::new(0),
            checks: AtomicUsize::new(0),
            live: AtomicBool::new(true),
            mount_error: Mutex::new(None),
            unmount_error: Mutex::new(None),
            opaque_mount_error: AtomicBool::new(false),
            slow: Mutex::new(None),
            purged: Mutex::new(Vec::new()),
        }
    }

    pub fn mounts(&self) -> usize {
        self.mounts.load(Ordering::SeqCst)
    }

    pub fn unmounts(&self) -> usize {
        self.unmounts.load(Ordering::SeqCst)
    }

    pub fn checks(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }

    pub fn purged(&self) -> Vec<PathBuf> {
        self.purged.lock().clone()
    }

    pub fn set_live(&self, live: bool) {
        self.live.store(live, Ordering::SeqCst);
    }

    /// Make every following mount fail with `err`, keeping its class.
    pub fn fail_mounts(&self, err: DriverError) {
        self.opaque_mount_error
            .store(!err.is_safe(), Ordering::SeqCst);
        *self.mount_error.lock() = Some(err.to_string());
    }

    pub fn fail_unmounts(&self, err: DriverError) {
        *self.unmount_error.lock() = Some(err.to_string());
    }

    pub fn advance_on_mount(&self, clock: Arc<ManualClock>, by: Duration) {
        *self.slow.lock() = Some((clock, by));
    }
}

#[async_trait]
impl Mounter for FakeMounter {
    async fn mount(
        &self,
        _ctx: &CancellationToken,
        _share: &str,
        target: &Path,
        _opts: &RawOptions,
    ) -> DriverResult<()> {
        self.mounts.fetch_add(1, Ordering::SeqCst);
        if let Some((clock, by)) = self.slow.lock().as_ref() {
            clock.advance(*by);
        }
        if let Some(message) = self.mount_error.lock().clone() {
            return if self.opaque_mount_error.load(Ordering::SeqCst) {
                Err(DriverError::Directory { message })
            } else {
                Err(DriverError::safe(message))
            };
        }
        self.checker.add(&target.to_string_lossy());
        self.live.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn unmount(&self, _ctx: &CancellationToken, target: &Path) -> DriverResult<()> {
        self.unmounts.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = self.unmount_error.lock().clone() {
            return Err(DriverError::safe(message));
        }
        self.checker.remove(&target.to_string_lossy());
        Ok(())
    }

    async fn check(&self, _ctx: &CancellationToken, _name: &str, _mountpoint: &Path) -> bool {
        self.checks.fetch_add(1, Ordering::SeqCst);
        self.live.load(Ordering::SeqCst)
    }

    async fn purge(&self, _ctx: &CancellationToken, root: &Path) {
        self.purged.lock().push(root.to_path_buf());
    }
}

/// Formatted log lines emitted while a capture is installed on this thread.
#[derive(Clone, Default)]
pub struct LogCapture {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl LogCapture {
    /// Route this thread's events into the capture until the guard drops.
    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let capture = self.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || capture.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    /// Everything captured so far.
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buf.lock()).into_owned()
    }
}

impl io::Write for LogCapture {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.lock().extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
