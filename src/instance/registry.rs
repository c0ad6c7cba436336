//! Durable instance registry.
//!
//! The whole registry lives in one JSON file that is replaced wholesale on
//! every write: the new content goes to a temp file in the same directory and
//! is renamed over the target, so readers see either the old or the new file.
//!
//! Every read-modify-write runs inside [`InstanceRegistry::update`], which
//! holds an in-process mutex plus an exclusive `flock` on `<state>.lock` for
//! the whole sequence. Concurrent requests can therefore never drop each
//! other's writes.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::Registry;
use crate::error::{KeeperError, KeeperResult};

const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct InstanceRegistry {
    path: PathBuf,
    lock_path: PathBuf,
    writer: Mutex<()>,
}

impl InstanceRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut lock_name = path.file_name().unwrap_or_default().to_os_string();
        lock_name.push(".lock");
        let lock_path = path.with_file_name(lock_name);
        Self {
            path,
            lock_path,
            writer: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the current registry. A missing file is an empty registry; a file
    /// that exists but does not parse is [`KeeperError::CorruptState`].
    pub fn load(&self) -> KeeperResult<Registry> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Registry::new()),
            Err(e) => {
                return Err(KeeperError::io(
                    format!("reading registry {}", self.path.display()),
                    e,
                ));
            }
        };
        serde_json::from_str(&text).map_err(|source| KeeperError::CorruptState {
            path: self.path.clone(),
            source,
        })
    }

    /// Replace the registry file with `registry`, creating its directory.
    pub fn save(&self, registry: &Registry) -> KeeperResult<()> {
        let _writer = self.lock_writer();
        let _file_lock = self.lock_file()?;
        self.write_atomically(registry)
    }

    /// Load, apply `f`, and save only if `f` changed the registry.
    ///
    /// An error from `f` aborts without writing. The lock is held from the
    /// load through the save.
    pub fn update<T>(
        &self,
        f: impl FnOnce(&mut Registry) -> KeeperResult<T>,
    ) -> KeeperResult<T> {
        let _writer = self.lock_writer();
        let _file_lock = self.lock_file()?;

        let before = self.load()?;
        let mut after = before.clone();
        let value = f(&mut after)?;

        if after != before {
            self.write_atomically(&after)?;
        } else {
            debug!(path = %self.path.display(), "registry unchanged, skipping write");
        }
        Ok(value)
    }

    fn lock_writer(&self) -> MutexGuard<'_, ()> {
        match self.writer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("registry writer mutex poisoned; recovering");
                poisoned.into_inner()
            }
        }
    }

    fn lock_file(&self) -> KeeperResult<FileLock> {
        self.ensure_parent()?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)
            .map_err(|e| {
                KeeperError::io(format!("opening lock file {}", self.lock_path.display()), e)
            })?;
        FileLock::acquire(file, LOCK_TIMEOUT).map_err(|e| {
            KeeperError::io(format!("locking {}", self.lock_path.display()), e)
        })
    }

    fn ensure_parent(&self) -> KeeperResult<()> {
        match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => fs::create_dir_all(dir)
                .map_err(|e| KeeperError::io(format!("creating {}", dir.display()), e)),
            _ => Ok(()),
        }
    }

    fn write_atomically(&self, registry: &Registry) -> KeeperResult<()> {
        self.ensure_parent()?;
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let tmp = tempfile::NamedTempFile::new_in(&dir)
            .map_err(|e| KeeperError::io(format!("creating temp file in {}", dir.display()), e))?;
        {
            let mut writer = BufWriter::new(tmp.as_file());
            serde_json::to_writer_pretty(&mut writer, registry)
                .map_err(|e| KeeperError::io("serializing registry", e.into()))?;
            writer
                .flush()
                .map_err(|e| KeeperError::io("writing registry", e))?;
        }
        tmp.as_file()
            .sync_all()
            .map_err(|e| KeeperError::io("syncing registry", e))?;
        tmp.as_file()
            .set_permissions(fs::Permissions::from_mode(0o600))
            .map_err(|e| KeeperError::io("restricting registry permissions", e))?;

        tmp.persist(&self.path).map_err(|e| {
            KeeperError::io(format!("replacing registry {}", self.path.display()), e.error)
        })?;

        debug!(path = %self.path.display(), instances = registry.len(), "registry saved");
        Ok(())
    }
}

/// Exclusive advisory lock, released when dropped (the fd closes).
struct FileLock {
    _file: File,
}

impl FileLock {
    fn acquire(file: File, timeout: Duration) -> io::Result<Self> {
        let start = Instant::now();
        let mut backoff = Duration::from_millis(5);
        loop {
            // SAFETY: the fd is owned by `file` and stays open for the call.
            let res = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
            if res == 0 {
                return Ok(Self { _file: file });
            }

            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EWOULDBLOCK) {
                return Err(err);
            }
            if start.elapsed() > timeout {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("lock not acquired within {} s", timeout.as_secs()),
                ));
            }

            std::thread::sleep(backoff);
            backoff = (backoff * 2).min(Duration::from_millis(100));
        }
    }
}
