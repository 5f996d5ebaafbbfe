//! Advisory file locking for the persistent value file.
//!
//! The default lock takes OS-level shared/exclusive locks on a `.lock`
//! sidecar file next to the protected path. Filesystems without working
//! advisory locks (some network mounts) can use [`FileLock::directory`]
//! instead: an atomically created lock directory, polled at a fixed interval
//! until a configured timeout.

use crate::error::{KilnError, Result};
use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    thread,
    time::Duration,
};

#[cfg(any(unix, windows))]
use std::fs::File;

const LOCK_SUFFIX: &str = ".lock";

/// Retry interval of the directory-based fallback lock.
pub const DEFAULT_LOCK_INTERVAL: Duration = Duration::from_millis(250);
/// Total time the directory-based fallback waits before giving up.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// A scoped advisory lock on a path.
///
/// Acquisition returns a guard; all exit paths release the lock when the
/// guard drops.
pub struct FileLock {
    inner: Inner,
}

enum Inner {
    #[cfg(any(unix, windows))]
    Os(fd_lock::RwLock<File>),
    Dir(DirLock),
}

impl FileLock {
    /// Locks via an OS advisory lock on `<path>.lock`.
    ///
    /// On platforms without OS advisory locks this transparently becomes a
    /// directory lock with the default interval and timeout.
    #[cfg(any(unix, windows))]
    pub fn sidecar(path: impl AsRef<Path>) -> Result<Self> {
        let lock_path = sidecar_path(path.as_ref());
        crate::utils::create_parent_dir_all(&lock_path)?;
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&lock_path)
            .map_err(|err| KilnError::io(err, &lock_path))?;
        Ok(Self { inner: Inner::Os(fd_lock::RwLock::new(file)) })
    }

    #[cfg(not(any(unix, windows)))]
    pub fn sidecar(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::directory(path, DEFAULT_LOCK_INTERVAL, DEFAULT_LOCK_TIMEOUT))
    }

    /// Locks via atomic creation of the `<path>.lock` directory.
    pub fn directory(path: impl AsRef<Path>, interval: Duration, timeout: Duration) -> Self {
        let retries = (timeout.as_millis() / interval.as_millis().max(1)) as u32;
        Self {
            inner: Inner::Dir(DirLock { path: sidecar_path(path.as_ref()), interval, retries }),
        }
    }

    /// Acquires a shared lock; blocks until available.
    pub fn read(&mut self) -> Result<FileLockGuard<'_>> {
        match &mut self.inner {
            #[cfg(any(unix, windows))]
            Inner::Os(lock) => {
                let guard = lock.read().map_err(|err| KilnError::io(err, "lock file"))?;
                Ok(FileLockGuard::Read(guard))
            }
            // the directory lock cannot distinguish readers from writers
            Inner::Dir(lock) => lock.acquire().map(FileLockGuard::Dir),
        }
    }

    /// Acquires an exclusive lock; blocks until available.
    pub fn write(&mut self) -> Result<FileLockGuard<'_>> {
        match &mut self.inner {
            #[cfg(any(unix, windows))]
            Inner::Os(lock) => {
                let guard = lock.write().map_err(|err| KilnError::io(err, "lock file"))?;
                Ok(FileLockGuard::Write(guard))
            }
            Inner::Dir(lock) => lock.acquire().map(FileLockGuard::Dir),
        }
    }
}

impl std::fmt::Debug for FileLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.inner {
            #[cfg(any(unix, windows))]
            Inner::Os(_) => f.debug_struct("FileLock").field("kind", &"os").finish(),
            Inner::Dir(lock) => {
                f.debug_struct("FileLock").field("kind", &"dir").field("path", &lock.path).finish()
            }
        }
    }
}

fn sidecar_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(LOCK_SUFFIX);
    path.with_file_name(name)
}

/// Guard returned by [`FileLock::read`] / [`FileLock::write`]; releases on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub enum FileLockGuard<'a> {
    #[cfg(any(unix, windows))]
    Read(fd_lock::RwLockReadGuard<'a, File>),
    #[cfg(any(unix, windows))]
    Write(fd_lock::RwLockWriteGuard<'a, File>),
    Dir(DirLockGuard<'a>),
}

/// Fallback lock: `mkdir` is atomic on every filesystem worth supporting.
#[derive(Debug)]
struct DirLock {
    path: PathBuf,
    interval: Duration,
    retries: u32,
}

impl DirLock {
    fn acquire(&self) -> Result<DirLockGuard<'_>> {
        let mut attempts = self.retries;
        loop {
            match fs::create_dir(&self.path) {
                Ok(()) => return Ok(DirLockGuard { path: &self.path }),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    if attempts == 0 {
                        return Err(KilnError::LockTimeout(self.path.clone()));
                    }
                    attempts -= 1;
                }
                Err(err) => {
                    if let Some(parent) = self.path.parent() {
                        // first contact with a missing cache dir
                        if !parent.exists() {
                            fs::create_dir_all(parent)
                                .map_err(|err| KilnError::io(err, parent))?;
                            continue;
                        }
                    }
                    return Err(KilnError::io(err, &self.path));
                }
            }
            thread::sleep(self.interval);
        }
    }
}

pub struct DirLockGuard<'a> {
    path: &'a Path,
}

impl Drop for DirLockGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_dir(self.path) {
            if err.kind() != ErrorKind::NotFound {
                warn!(path = %self.path.display(), %err, "failed to release directory lock");
            }
        }
    }
}
