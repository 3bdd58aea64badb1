//! On-disk checkpoint state: scheduling checkpoint, operation start
//! timestamp, and the executor-data snapshot.
//!
//! All writes go through the work directory's write-then-rename path. A file
//! that fails to parse is deleted and treated as fresh; forward progress is
//! recomputed from settings and coordinator state, never lost.

use std::fs;

use chrono::{DateTime, Utc};
use pos_model::ExecutorDataForNtService;
use pos_schedule::{format_compact, parse_compact, CheckpointData};
use tracing::warn;

use crate::workdir::{WorkDir, WorkDirError};

/// Reader/writer for the agent's checkpoint files.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    workdir: WorkDir,
}

impl CheckpointStore {
    pub fn new(workdir: WorkDir) -> Self {
        Self { workdir }
    }

    /// Load the scheduling checkpoint. Missing or corrupt files come back as
    /// the default; a corrupt file is removed on the way.
    pub fn load(&self) -> CheckpointData {
        let path = self.workdir.checkpoint_file();
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return CheckpointData::default(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Checkpoint unreadable, starting fresh");
                return CheckpointData::default();
            }
        };

        match CheckpointData::from_line(raw.trim()) {
            Ok(data) => data,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Checkpoint corrupt, deleting");
                if let Err(e) = fs::remove_file(&path) {
                    warn!(path = %path.display(), error = %e, "Failed to delete corrupt checkpoint");
                }
                CheckpointData::default()
            }
        }
    }

    /// Persist the scheduling checkpoint.
    pub fn save(&self, data: &CheckpointData) -> Result<(), WorkDirError> {
        self.workdir
            .write_atomic(&self.workdir.checkpoint_file(), &data.to_line())
    }

    /// When the in-flight operation started, if recorded.
    pub fn load_start_timestamp(&self) -> Option<DateTime<Utc>> {
        let raw = fs::read_to_string(self.workdir.start_timestamp_file()).ok()?;
        parse_compact(raw.trim())
    }

    pub fn save_start_timestamp(&self, at: DateTime<Utc>) -> Result<(), WorkDirError> {
        self.workdir
            .write_atomic(&self.workdir.start_timestamp_file(), &format_compact(at))
    }

    /// Approved-timestamp snapshot persisted after coordinator reads.
    pub fn load_executor_snapshot(&self) -> Option<ExecutorDataForNtService> {
        let raw = fs::read_to_string(self.workdir.executor_data_file()).ok()?;
        serde_json::from_str(&raw).ok()
    }

    pub fn save_executor_snapshot(
        &self,
        data: &ExecutorDataForNtService,
    ) -> Result<(), WorkDirError> {
        let json = serde_json::to_string(data).unwrap_or_default();
        self.workdir
            .write_atomic(&self.workdir.executor_data_file(), &json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Timelike};

    fn store() -> (tempfile::TempDir, CheckpointStore) {
        let dir = tempfile::tempdir().unwrap();
        let workdir = WorkDir::new(dir.path());
        workdir.ensure_layout().unwrap();
        (dir, CheckpointStore::new(workdir))
    }

    #[test]
    fn test_missing_checkpoint_is_default() {
        let (_dir, store) = store();
        assert_eq!(store.load(), CheckpointData::default());
    }

    #[test]
    fn test_save_load_roundtrip() {
        let (_dir, store) = store();
        let data = CheckpointData {
            scheduling_time: Some(Utc::now().with_nanosecond(0).unwrap() + Duration::hours(1)),
            reschedule_count: 3,
            reschedule_needed: true,
            last_attempted: Some(Utc::now().with_nanosecond(0).unwrap()),
        };
        store.save(&data).unwrap();
        assert_eq!(store.load(), data);
    }

    #[test]
    fn test_corrupt_checkpoint_deleted_and_fresh() {
        let (_dir, store) = store();
        fs::write(store.workdir.checkpoint_file(), "definitely not a checkpoint").unwrap();

        assert_eq!(store.load(), CheckpointData::default());
        assert!(!store.workdir.checkpoint_file().exists());
    }

    #[test]
    fn test_start_timestamp_roundtrip() {
        let (_dir, store) = store();
        assert!(store.load_start_timestamp().is_none());

        let at = Utc::now().with_nanosecond(0).unwrap();
        store.save_start_timestamp(at).unwrap();
        assert_eq!(store.load_start_timestamp(), Some(at));
    }

    #[test]
    fn test_executor_snapshot_roundtrip() {
        let (_dir, store) = store();
        assert!(store.load_executor_snapshot().is_none());

        let snapshot = ExecutorDataForNtService {
            approved_at: Some(Utc::now()),
            executor_timeout_minutes: 90,
        };
        store.save_executor_snapshot(&snapshot).unwrap();
        let loaded = store.load_executor_snapshot().unwrap();
        assert_eq!(loaded.executor_timeout_minutes, 90);
        assert!(loaded.approved_at.is_some());
    }
}
