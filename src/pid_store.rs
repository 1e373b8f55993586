//! Persisted identity of the running supervisor.

use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::inspector::ProcessInspector;

/// What the PID file holds while a supervisor runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisorState {
    /// Process ID of the supervising loop
    pub pid: u32,
    /// Timestamp when the supervisor was started (ms since epoch)
    pub started_at: u128,
}

#[derive(Debug, Clone)]
pub struct PidStore {
    path: PathBuf,
}

impl PidStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically record `pid` as the live supervisor (write to temp, then rename).
    pub fn write(&self, pid: u32) -> Result<SupervisorState> {
        let state = SupervisorState {
            pid,
            started_at: now_ms(),
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let temp_path = self
            .path
            .with_extension(format!("pid.tmp.{}", std::process::id()));
        let contents = serde_json::to_string(&state)?;
        let written = write_then_rename(&temp_path, &self.path, contents.as_bytes());
        if written.is_err() {
            let _ = fs::remove_file(&temp_path);
        }
        written?;
        Ok(state)
    }

    /// Read the record. Accepts the JSON form and a bare pid.
    pub fn read(&self) -> Result<Option<SupervisorState>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        Ok(parse_state(&contents))
    }

    /// The pid of a live supervisor, if any.
    ///
    /// A record whose process is gone (or which cannot be parsed) is stale and is
    /// removed here, so later reads report "not running". A file that exists but
    /// cannot be read is an error: nobody can tell whether a supervisor runs.
    pub fn live(&self, inspector: &dyn ProcessInspector) -> Result<Option<SupervisorState>> {
        let Some(state) = self.read()? else {
            if self.path.exists() {
                debug!(path = %self.path.display(), "cleaned unparsable pid file");
                self.clear()?;
            }
            return Ok(None);
        };
        if inspector.is_alive(state.pid) {
            return Ok(Some(state));
        }
        debug!(pid = state.pid, "cleaned stale pid");
        self.clear()?;
        Ok(None)
    }

    pub fn is_live(&self, inspector: &dyn ProcessInspector) -> Result<bool> {
        Ok(self.live(inspector)?.is_some())
    }

    pub fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(err).with_context(|| format!("failed to remove {}", self.path.display()))
            }
        }
    }
}

fn write_then_rename(temp_path: &Path, path: &Path, contents: &[u8]) -> Result<()> {
    let mut file = fs::File::create(temp_path)
        .with_context(|| format!("failed to create {}", temp_path.display()))?;
    file.write_all(contents)
        .with_context(|| format!("failed to write {}", temp_path.display()))?;
    file.sync_all()
        .with_context(|| format!("failed to sync {}", temp_path.display()))?;
    fs::rename(temp_path, path).with_context(|| {
        format!(
            "failed to replace {} from {}",
            path.display(),
            temp_path.display()
        )
    })
}

fn parse_state(contents: &str) -> Option<SupervisorState> {
    let trimmed = contents.trim();
    if let Ok(state) = serde_json::from_str::<SupervisorState>(trimmed) {
        return (state.pid != 0).then_some(state);
    }
    let pid: u32 = trimmed.parse().ok()?;
    (pid != 0).then_some(SupervisorState { pid, started_at: 0 })
}

/// Get current timestamp in milliseconds
pub fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inspector::fake::FakeInspector;
    use tempfile::TempDir;

    #[test]
    fn write_then_read_roundtrips_pid() {
        let dir = TempDir::new().expect("tempdir");
        let store = PidStore::new(dir.path().join("shepherd.pid"));
        assert_eq!(store.read().expect("read empty"), None);

        let written = store.write(4242).expect("write");
        let read = store.read().expect("read").expect("state present");
        assert_eq!(read, written);
        assert!(read.started_at > 0);
    }

    #[test]
    fn is_live_follows_process_table() {
        let dir = TempDir::new().expect("tempdir");
        let store = PidStore::new(dir.path().join("shepherd.pid"));
        let inspector = FakeInspector::default();
        inspector.spawn(500, 1, "shepherd supervise");

        store.write(500).expect("write");
        assert!(store.is_live(&inspector).expect("live"));
        assert!(store.path().exists());

        store.clear().expect("clear");
        assert!(!store.is_live(&inspector).expect("live"));
        assert_eq!(store.read().expect("read"), None);
    }

    #[test]
    fn stale_pid_is_removed_on_check() {
        let dir = TempDir::new().expect("tempdir");
        let store = PidStore::new(dir.path().join("shepherd.pid"));
        let inspector = FakeInspector::default();

        store.write(777).expect("write");
        assert!(!store.is_live(&inspector).expect("live"));
        assert!(!store.path().exists());
    }

    #[test]
    fn garbage_pid_file_is_treated_as_stale() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("shepherd.pid");
        fs::write(&path, "not a pid\n").expect("write");
        let store = PidStore::new(&path);
        assert!(!store.is_live(&FakeInspector::default()).expect("live"));
        assert!(!path.exists());
    }

    #[test]
    fn unreadable_pid_file_is_an_error_not_absence() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("shepherd.pid");
        fs::create_dir(&path).expect("occupy pid path");
        let store = PidStore::new(&path);
        assert!(store.live(&FakeInspector::default()).is_err());
        assert!(path.exists());
    }

    #[test]
    fn failed_write_leaves_no_temp_file() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("shepherd.pid");
        fs::create_dir(&path).expect("occupy pid path");
        fs::write(path.join("keep"), "x").expect("make dir non-empty");

        let store = PidStore::new(&path);
        assert!(store.write(4242).is_err());

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .expect("read dir")
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| name.contains(".tmp."))
            .collect();
        assert!(leftovers.is_empty(), "temp files left: {:?}", leftovers);
    }

    #[test]
    fn accepts_bare_pid() {
        assert_eq!(
            parse_state("123\n"),
            Some(SupervisorState {
                pid: 123,
                started_at: 0
            })
        );
        assert_eq!(parse_state("0"), None);
    }

    #[test]
    fn clear_is_idempotent() {
        let dir = TempDir::new().expect("tempdir");
        let store = PidStore::new(dir.path().join("shepherd.pid"));
        store.clear().expect("clear missing");
        store.write(1).expect("write");
        store.clear().expect("clear");
        store.clear().expect("clear again");
    }
}
