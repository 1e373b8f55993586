//! Size-triggered, single-generation log rotation.

use std::{
    fs::{self, File, OpenOptions},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};

/// `<path>.1`, the only retained generation.
pub fn rotated_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".1");
    PathBuf::from(name)
}

/// Rename `path` to `<path>.1` once it reaches `max_bytes`.
///
/// Any previous `.1` is replaced. Writers still holding the old file keep
/// appending to the backup. A `max_bytes` of zero disables rotation.
pub fn rotate_if_needed(path: &Path, max_bytes: u64) -> Result<bool> {
    if max_bytes == 0 {
        return Ok(false);
    }
    let len = match fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to stat {}", path.display()));
        }
    };
    if len < max_bytes {
        return Ok(false);
    }

    let backup = rotated_path(path);
    fs::rename(path, &backup).with_context(|| {
        format!(
            "failed to rotate {} to {}",
            path.display(),
            backup.display()
        )
    })?;
    tracing::debug!(path = %path.display(), bytes = len, "rotated log");
    Ok(true)
}

/// Open the current log for appending, creating it (and its directory) if needed.
pub fn open_append(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn small_file_is_left_alone() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("shepherd.log");
        fs::write(&path, b"short").expect("write");
        assert!(!rotate_if_needed(&path, 1024).expect("rotate"));
        assert!(!rotated_path(&path).exists());
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let dir = TempDir::new().expect("tempdir");
        assert!(!rotate_if_needed(&dir.path().join("none.log"), 1).expect("rotate"));
    }

    #[test]
    fn crossing_threshold_keeps_one_backup_and_loses_nothing() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("shepherd.log");
        let backup = rotated_path(&path);
        fs::write(&backup, b"ancient generation").expect("seed old backup");

        let first = vec![b'a'; 80];
        open_append(&path).expect("open").write_all(&first).expect("write");
        let second = vec![b'b'; 40];
        open_append(&path).expect("open").write_all(&second).expect("write");

        assert!(rotate_if_needed(&path, 100).expect("rotate"));
        assert!(!path.exists());

        let tail = b"after rotation\n";
        open_append(&path).expect("reopen").write_all(tail).expect("write");

        let backup_bytes = fs::read(&backup).expect("read backup");
        let current_bytes = fs::read(&path).expect("read current");
        assert_eq!(backup_bytes.len(), first.len() + second.len());
        assert_eq!(&backup_bytes[..80], first.as_slice());
        assert_eq!(current_bytes, tail);
        assert!(current_bytes.len() < backup_bytes.len());

        let generations = fs::read_dir(dir.path())
            .expect("read dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("shepherd.log."))
            .count();
        assert_eq!(generations, 1);
    }

    #[test]
    fn open_writer_keeps_writing_into_backup() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("shepherd.log");
        let mut writer = open_append(&path).expect("open");
        writer.write_all(&[b'x'; 10]).expect("write");

        assert!(rotate_if_needed(&path, 10).expect("rotate"));
        writer.write_all(b"late").expect("late write");

        let backup = fs::read(rotated_path(&path)).expect("read backup");
        assert!(backup.ends_with(b"late"));
    }

    #[test]
    fn zero_threshold_disables_rotation() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("shepherd.log");
        fs::write(&path, b"anything").expect("write");
        assert!(!rotate_if_needed(&path, 0).expect("rotate"));
    }
}
