//! Cache-root locks and per-bucket mutexes.
//!
//! Writers (content staging, index appends, compaction) hold the root lock
//! shared; verify holds it exclusively. Neither side ever blocks: both poll
//! until a timeout and then fail with `ELOCKED`.

use crate::error::{Error, Result};
use fs2::FileExt;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};

/// Interval between attempts while waiting for a contended lock.
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// How long a writer waits for a running verify before giving up.
pub(crate) const WRITER_TIMEOUT: Duration = Duration::from_secs(60);

/// Lock file guarding a cache root.
pub(crate) fn root_lock_path(root: &Path) -> PathBuf {
    root.join("_verify.lock")
}

/// Take the root lock shared, as every writer does.
pub(crate) fn share_root(root: &Path) -> Result<CacheLock> {
    CacheLock::acquire_shared(&root_lock_path(root), WRITER_TIMEOUT)
}

/// How a [`CacheLock`] is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Any number of holders at once.
    Shared,
    /// A single holder, excluding shared ones.
    Exclusive,
}

/// Holders of one lock path within this process.
#[derive(Debug, Default)]
struct Holders {
    shared: usize,
    exclusive: bool,
}

impl Holders {
    fn try_enter(&mut self, mode: LockMode) -> bool {
        match mode {
            LockMode::Shared if !self.exclusive => self.shared += 1,
            LockMode::Exclusive if !self.exclusive && self.shared == 0 => self.exclusive = true,
            _ => return false,
        }
        true
    }

    fn leave(&mut self, mode: LockMode) {
        match mode {
            LockMode::Shared => self.shared = self.shared.saturating_sub(1),
            LockMode::Exclusive => self.exclusive = false,
        }
    }
}

fn holders(lock: &Mutex<Holders>) -> MutexGuard<'_, Holders> {
    lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A filesystem-backed lock shared across processes.
///
/// `fs2` locks are per open file, so a per-path holder count orders threads
/// of this process first. Both are released on drop.
#[derive(Debug)]
pub struct CacheLock {
    file: File,
    path: PathBuf,
    mode: LockMode,
    holders: &'static Mutex<Holders>,
}

impl CacheLock {
    /// Acquire the lock exclusively, polling for at most `timeout`.
    ///
    /// A zero timeout makes a single attempt. Fails with
    /// [`Error::Locked`] once the deadline passes.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self> {
        Self::acquire_mode(path, LockMode::Exclusive, timeout)
    }

    /// Acquire the lock shared, polling for at most `timeout`.
    pub fn acquire_shared(path: &Path, timeout: Duration) -> Result<Self> {
        Self::acquire_mode(path, LockMode::Shared, timeout)
    }

    fn acquire_mode(path: &Path, mode: LockMode, timeout: Duration) -> Result<Self> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(lock) = Self::try_acquire_mode(path, mode)? {
                return Ok(lock);
            }
            if Instant::now() >= deadline {
                return Err(Error::locked(path));
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Make one exclusive attempt; `Ok(None)` when someone else holds the lock.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>> {
        Self::try_acquire_mode(path, LockMode::Exclusive)
    }

    /// Make one shared attempt; `Ok(None)` while an exclusive holder exists.
    pub fn try_acquire_shared(path: &Path) -> Result<Option<Self>> {
        Self::try_acquire_mode(path, LockMode::Shared)
    }

    fn try_acquire_mode(path: &Path, mode: LockMode) -> Result<Option<Self>> {
        let process = process_holders_for_path(path);
        if !holders(process).try_enter(mode) {
            return Ok(None);
        }
        let entered = Entered {
            mode,
            holders: process,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;
        let attempt = match mode {
            LockMode::Shared => FileExt::try_lock_shared(&file),
            LockMode::Exclusive => FileExt::try_lock_exclusive(&file),
        };
        match attempt {
            Ok(()) => Ok(Some(Self {
                file,
                path: path.to_path_buf(),
                mode,
                holders: entered.keep(),
            })),
            Err(err) if is_contended(&err) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// How this lock is held.
    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            tracing::warn!(path = %self.path.display(), error = %err, "failed to release cache lock");
        }
        holders(self.holders).leave(self.mode);
    }
}

/// In-process hold taken before the file lock; released again if the file
/// lock cannot be had.
struct Entered {
    mode: LockMode,
    holders: &'static Mutex<Holders>,
}

impl Entered {
    fn keep(self) -> &'static Mutex<Holders> {
        let holders = self.holders;
        std::mem::forget(self);
        holders
    }
}

impl Drop for Entered {
    fn drop(&mut self) {
        holders(self.holders).leave(self.mode);
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

type LeakedMap<T> = OnceLock<Mutex<HashMap<PathBuf, &'static T>>>;

/// One leaked `T` per path, shared by every thread in the process.
fn leaked_for_path<T: Default + Sync + 'static>(
    map: &'static LeakedMap<T>,
    path: &Path,
) -> &'static T {
    let locks = map.get_or_init(|| Mutex::new(HashMap::new()));
    let mut map = locks
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(&existing) = map.get(path) {
        return existing;
    }

    let lock: &'static T = Box::leak(Box::<T>::default());
    map.insert(path.to_path_buf(), lock);
    lock
}

fn process_holders_for_path(path: &Path) -> &'static Mutex<Holders> {
    static PROCESS_HOLDERS: LeakedMap<Mutex<Holders>> = OnceLock::new();
    leaked_for_path(&PROCESS_HOLDERS, path)
}

/// One leaked mutex per bucket path, serializing rewrites in this process.
pub(crate) fn process_lock_for_path(path: &Path) -> &'static Mutex<()> {
    static PROCESS_LOCKS: LeakedMap<Mutex<()>> = OnceLock::new();
    leaked_for_path(&PROCESS_LOCKS, path)
}
