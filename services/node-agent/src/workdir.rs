//! Per-node work directory owned exclusively by the agent.
//!
//! Layout under the root:
//!
//! ```text
//! Settings.xml                                 live settings
//! Data/CopyOfSettings.xml                      last validated copy
//! Data/TempCopyOfSettings.xml                  staging copy during updates
//! Data/TimerCheckPoint.txt                     scheduling checkpoint
//! Data/LastUpdateOperationStartTimeStampFile.txt
//! Data/ExecutorDataForNtService.txt            approved-timestamp snapshot
//! TempDir/                                     write-then-rename staging
//! logs/                                        trimmed to a disk quota
//! ```
//!
//! Every persisted file is written to a random temp file first and renamed
//! over the target; stragglers from interrupted writes are swept on use.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// Errors from work-directory operations.
#[derive(Debug, Error)]
pub enum WorkDirError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn io_err(path: &Path, source: std::io::Error) -> WorkDirError {
    WorkDirError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// The agent's work directory.
#[derive(Debug, Clone)]
pub struct WorkDir {
    root: PathBuf,
}

impl WorkDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the directory layout if missing.
    pub fn ensure_layout(&self) -> Result<(), WorkDirError> {
        for dir in [self.root.clone(), self.data_dir(), self.temp_dir(), self.logs_dir()] {
            fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn settings_file(&self) -> PathBuf {
        self.root.join("Settings.xml")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root.join("Data")
    }

    pub fn copy_of_settings(&self) -> PathBuf {
        self.data_dir().join("CopyOfSettings.xml")
    }

    pub fn temp_copy_of_settings(&self) -> PathBuf {
        self.data_dir().join("TempCopyOfSettings.xml")
    }

    pub fn checkpoint_file(&self) -> PathBuf {
        self.data_dir().join("TimerCheckPoint.txt")
    }

    pub fn start_timestamp_file(&self) -> PathBuf {
        self.data_dir().join("LastUpdateOperationStartTimeStampFile.txt")
    }

    pub fn executor_data_file(&self) -> PathBuf {
        self.data_dir().join("ExecutorDataForNtService.txt")
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.root.join("TempDir")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Remove everything inside the temp staging directory.
    pub fn clear_temp_dir(&self) -> Result<(), WorkDirError> {
        let temp = self.temp_dir();
        if !temp.exists() {
            return Ok(());
        }
        let entries = fs::read_dir(&temp).map_err(|e| io_err(&temp, e))?;
        for entry in entries.flatten() {
            let path = entry.path();
            let removed = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            if let Err(e) = removed {
                warn!(path = %path.display(), error = %e, "Failed to remove temp entry");
            }
        }
        Ok(())
    }

    /// Write a file atomically: random temp file in `TempDir/`, then rename.
    pub fn write_atomic(&self, target: &Path, contents: &str) -> Result<(), WorkDirError> {
        let staging = self.temp_dir().join(format!("stage-{}", Uuid::new_v4()));
        {
            let mut file = fs::File::create(&staging).map_err(|e| io_err(&staging, e))?;
            file.write_all(contents.as_bytes())
                .map_err(|e| io_err(&staging, e))?;
            file.sync_all().map_err(|e| io_err(&staging, e))?;
        }
        fs::rename(&staging, target).map_err(|e| io_err(target, e))?;
        debug!(target = %target.display(), "Atomic write complete");
        Ok(())
    }

    /// Content hash of a file, `None` when it does not exist.
    pub fn file_hash(&self, path: &Path) -> Result<Option<String>, WorkDirError> {
        let contents = match fs::read(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_err(path, e)),
        };
        let mut hasher = Sha256::new();
        hasher.update(&contents);
        Ok(Some(hex::encode(hasher.finalize())))
    }

    /// Trim the logs directory to the quota, removing oldest-modified first.
    pub fn trim_logs(&self, quota_bytes: u64) -> Result<usize, WorkDirError> {
        let logs = self.logs_dir();
        if !logs.exists() {
            return Ok(0);
        }

        let mut files: Vec<(PathBuf, u64, std::time::SystemTime)> = Vec::new();
        let entries = fs::read_dir(&logs).map_err(|e| io_err(&logs, e))?;
        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(meta) = entry.metadata() else { continue };
            if !meta.is_file() {
                continue;
            }
            let mtime = meta.modified().unwrap_or(std::time::SystemTime::UNIX_EPOCH);
            files.push((path, meta.len(), mtime));
        }

        let total: u64 = files.iter().map(|(_, len, _)| len).sum();
        if total <= quota_bytes {
            return Ok(0);
        }

        files.sort_by_key(|(_, _, mtime)| *mtime);
        let mut freed = 0u64;
        let mut removed = 0usize;
        for (path, len, _) in files {
            if total - freed <= quota_bytes {
                break;
            }
            match fs::remove_file(&path) {
                Ok(()) => {
                    freed += len;
                    removed += 1;
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to trim log file"),
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_and_atomic_write() {
        let dir = tempfile::tempdir().unwrap();
        let workdir = WorkDir::new(dir.path());
        workdir.ensure_layout().unwrap();

        assert!(workdir.data_dir().is_dir());
        assert!(workdir.temp_dir().is_dir());
        assert!(workdir.logs_dir().is_dir());

        let target = workdir.checkpoint_file();
        workdir.write_atomic(&target, "line one").unwrap();
        assert_eq!(fs::read_to_string(&target).unwrap(), "line one");

        // Overwrite in place.
        workdir.write_atomic(&target, "line two").unwrap();
        assert_eq!(fs::read_to_string(&target).unwrap(), "line two");
    }

    #[test]
    fn test_clear_temp_dir() {
        let dir = tempfile::tempdir().unwrap();
        let workdir = WorkDir::new(dir.path());
        workdir.ensure_layout().unwrap();

        fs::write(workdir.temp_dir().join("leftover"), "x").unwrap();
        fs::create_dir(workdir.temp_dir().join("nested")).unwrap();

        workdir.clear_temp_dir().unwrap();
        assert_eq!(fs::read_dir(workdir.temp_dir()).unwrap().count(), 0);
    }

    #[test]
    fn test_file_hash_change_detection() {
        let dir = tempfile::tempdir().unwrap();
        let workdir = WorkDir::new(dir.path());
        workdir.ensure_layout().unwrap();

        assert_eq!(workdir.file_hash(&workdir.settings_file()).unwrap(), None);

        fs::write(workdir.settings_file(), "<Settings/>").unwrap();
        let first = workdir.file_hash(&workdir.settings_file()).unwrap().unwrap();

        fs::write(workdir.settings_file(), "<Settings></Settings>").unwrap();
        let second = workdir.file_hash(&workdir.settings_file()).unwrap().unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_trim_logs_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        let workdir = WorkDir::new(dir.path());
        workdir.ensure_layout().unwrap();

        for (name, age_secs) in [("old.log", 300), ("mid.log", 200), ("new.log", 100)] {
            let path = workdir.logs_dir().join(name);
            fs::write(&path, vec![b'x'; 100]).unwrap();
            let mtime = std::time::SystemTime::now() - std::time::Duration::from_secs(age_secs);
            let file = fs::File::open(&path).unwrap();
            file.set_modified(mtime).unwrap();
        }

        // Quota admits two files.
        let removed = workdir.trim_logs(200).unwrap();
        assert_eq!(removed, 1);
        assert!(!workdir.logs_dir().join("old.log").exists());
        assert!(workdir.logs_dir().join("new.log").exists());
    }
}
