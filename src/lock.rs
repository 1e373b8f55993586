//! Exclusive, non-blocking advisory lock guarding mutating lifecycle commands.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    /// Another lifecycle command holds the lock.
    #[error("another shepherd command is in progress{} (lock {})", holder_suffix(.holder), .path.display())]
    Busy { path: PathBuf, holder: Option<u32> },
    #[error("failed to lock {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn holder_suffix(holder: &Option<u32>) -> String {
    holder
        .map(|pid| format!(" (held by pid {})", pid))
        .unwrap_or_default()
}

/// Held lock; released on drop and by the kernel when the process exits.
#[derive(Debug)]
pub struct LockHandle {
    file: File,
    path: PathBuf,
}

impl LockHandle {
    /// Try to take the lock once. Never waits: contention is `LockError::Busy`.
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        let io_err = |source| LockError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        // std opens with O_CLOEXEC, so spawned children never inherit the lock.
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(io_err)?;

        match try_lock_exclusive(&file) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                return Err(LockError::Busy {
                    path: path.to_path_buf(),
                    holder: read_holder(path),
                });
            }
            Err(err) => return Err(io_err(err)),
        }

        let handle = Self {
            file,
            path: path.to_path_buf(),
        };
        handle.record_holder();
        Ok(handle)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn record_holder(&self) {
        let _ = self.file.set_len(0);
        let mut writer = &self.file;
        let _ = write!(writer, "pid={}", std::process::id());
        let _ = writer.flush();
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        let _ = self.file.set_len(0);
        unlock(&self.file);
    }
}

fn read_holder(path: &Path) -> Option<u32> {
    let raw = fs::read_to_string(path).ok()?;
    raw.lines()
        .find_map(|line| line.trim().strip_prefix("pid="))
        .and_then(|value| value.trim().parse().ok())
}

#[cfg(unix)]
fn try_lock_exclusive(file: &File) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;
    let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if result == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(unix)]
fn unlock(file: &File) {
    use std::os::unix::io::AsRawFd;
    unsafe {
        libc::flock(file.as_raw_fd(), libc::LOCK_UN);
    }
}

#[cfg(not(unix))]
fn try_lock_exclusive(_file: &File) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "advisory locks are only supported on unix platforms",
    ))
}

#[cfg(not(unix))]
fn unlock(_file: &File) {}
