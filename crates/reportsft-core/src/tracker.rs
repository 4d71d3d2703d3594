//! Per-report progress checkpoint.
//!
//! The tracker file is a JSON object keyed by PDF file name:
//!
//! ```json
//! {
//!   "annual_report_2023.pdf": { "paragraph_index": 40, "completed": false }
//! }
//! ```
//!
//! `paragraph_index` is the first paragraph that has not been processed yet.
//! Callers must flush the dataset before advancing it (see
//! [`crate::pipeline`]).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::persist::{StateError, read_json, write_json_atomic};

/// Progress of a single report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStatus {
    pub paragraph_index: usize,
    pub completed: bool,
}

#[derive(Debug)]
pub struct Tracker {
    path: PathBuf,
    data: BTreeMap<String, FileStatus>,
}

impl Tracker {
    /// Load the tracker at `path`. A missing file is an empty tracker.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, StateError> {
        let path = path.into();
        let data = read_json(&path)?.unwrap_or_default();
        Ok(Self { path, data })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stored status for `filename`, or a fresh status if it was never seen.
    pub fn file_status(&self, filename: &str) -> FileStatus {
        self.data.get(filename).copied().unwrap_or_default()
    }

    /// Replace the status for `filename` and save immediately.
    pub fn update_file_status(
        &mut self,
        filename: &str,
        paragraph_index: usize,
        completed: bool,
    ) -> Result<(), StateError> {
        self.data.insert(
            filename.to_string(),
            FileStatus {
                paragraph_index,
                completed,
            },
        );
        self.save()
    }

    /// Forget `filename` so the next run processes it from the start.
    /// Returns whether an entry existed.
    pub fn remove(&mut self, filename: &str) -> Result<bool, StateError> {
        let existed = self.data.remove(filename).is_some();
        if existed {
            self.save()?;
        }
        Ok(existed)
    }

    pub fn save(&self) -> Result<(), StateError> {
        write_json_atomic(&self.path, &self.data)
    }

    /// All tracked reports in file-name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &FileStatus)> {
        self.data.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_file_starts_at_zero() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = Tracker::load(dir.path().join("tracker.json")).unwrap();
        assert_eq!(tracker.file_status("a.pdf"), FileStatus::default());
        assert!(tracker.is_empty());
    }

    #[test]
    fn update_persists_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tracker.json");

        let mut tracker = Tracker::load(&path).unwrap();
        tracker.update_file_status("a.pdf", 6, false).unwrap();
        tracker.update_file_status("b.pdf", 12, true).unwrap();

        let reloaded = Tracker::load(&path).unwrap();
        assert_eq!(
            reloaded.file_status("a.pdf"),
            FileStatus {
                paragraph_index: 6,
                completed: false
            }
        );
        assert!(reloaded.file_status("b.pdf").completed);
        assert_eq!(reloaded.len(), 2);
    }

    #[test]
    fn reads_existing_tracker_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tracker.json");
        std::fs::write(
            &path,
            r#"{
  "RBI_2022.pdf": {
    "paragraph_index": 31,
    "completed": false
  }
}"#,
        )
        .unwrap();
        let tracker = Tracker::load(&path).unwrap();
        assert_eq!(tracker.file_status("RBI_2022.pdf").paragraph_index, 31);
    }

    #[test]
    fn corrupt_tracker_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tracker.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            Tracker::load(&path),
            Err(StateError::Corrupt { .. })
        ));
    }

    #[test]
    fn remove_forgets_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tracker.json");
        let mut tracker = Tracker::load(&path).unwrap();
        tracker.update_file_status("a.pdf", 3, true).unwrap();
        assert!(tracker.remove("a.pdf").unwrap());
        assert!(!tracker.remove("a.pdf").unwrap());
        assert!(Tracker::load(&path).unwrap().is_empty());
    }
}
