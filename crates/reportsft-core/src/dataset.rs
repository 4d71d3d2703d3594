//! Append-only store of generated Q&A entries, persisted as a JSON array.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::persist::{StateError, read_json, write_json_atomic};

/// One generated Q&A pair, tagged with the paragraph it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetEntry {
    pub file: String,
    pub paragraph_index: usize,
    pub question: String,
    pub answer: String,
}

/// In-memory view of the dataset file.
///
/// Entries are unique per `(file, paragraph_index)`: re-running a paragraph
/// whose entry already reached disk does not duplicate it.
#[derive(Debug)]
pub struct DatasetStore {
    path: PathBuf,
    entries: Vec<DatasetEntry>,
    seen: HashSet<(String, usize)>,
    last_index: HashMap<String, usize>,
    dirty: bool,
}

impl DatasetStore {
    /// Load the dataset at `path`. Missing or blank files are empty datasets;
    /// malformed JSON is an error so the file is never silently overwritten.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, StateError> {
        let path = path.into();
        let loaded: Vec<DatasetEntry> = read_json(&path)?.unwrap_or_default();
        let mut store = Self {
            path,
            entries: Vec::with_capacity(loaded.len()),
            seen: HashSet::new(),
            last_index: HashMap::new(),
            dirty: false,
        };
        for entry in loaded {
            store.insert(entry);
        }
        store.dirty = false;
        Ok(store)
    }

    /// Append `entry` unless the same paragraph is already stored.
    /// Returns `true` if the entry was added.
    pub fn push(&mut self, entry: DatasetEntry) -> bool {
        self.insert(entry)
    }

    fn insert(&mut self, entry: DatasetEntry) -> bool {
        let key = (entry.file.clone(), entry.paragraph_index);
        if !self.seen.insert(key) {
            return false;
        }
        let last = self.last_index.entry(entry.file.clone()).or_insert(0);
        *last = (*last).max(entry.paragraph_index);
        self.entries.push(entry);
        self.dirty = true;
        true
    }

    /// Highest paragraph index stored for `file`, if any.
    pub fn last_index_for(&self, file: &str) -> Option<usize> {
        self.last_index.get(file).copied()
    }

    /// Write the whole array to disk.
    pub fn save(&mut self) -> Result<(), StateError> {
        write_json_atomic(&self.path, &self.entries)?;
        self.dirty = false;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> &[DatasetEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether entries were added since the last load or save.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Drop every entry generated from `file`. Returns how many were removed.
    pub fn remove_file(&mut self, file: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| e.file != file);
        let removed = before - self.entries.len();
        if removed > 0 {
            self.seen.retain(|(f, _)| f != file);
            self.last_index.remove(file);
            self.dirty = true;
        }
        removed
    }

    /// Number of stored entries per source file.
    pub fn counts_by_file(&self) -> HashMap<&str, usize> {
        let mut counts = HashMap::new();
        for e in &self.entries {
            *counts.entry(e.file.as_str()).or_insert(0) += 1;
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(file: &str, idx: usize) -> DatasetEntry {
        DatasetEntry {
            file: file.into(),
            paragraph_index: idx,
            question: format!("Q{idx}?"),
            answer: format!("A{idx}."),
        }
    }

    #[test]
    fn push_rejects_duplicate_paragraph() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = DatasetStore::load(dir.path().join("dataset.json")).unwrap();
        assert!(store.push(entry("a.pdf", 3)));
        assert!(!store.push(entry("a.pdf", 3)));
        assert!(store.push(entry("b.pdf", 3)));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn last_index_tracks_maximum() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = DatasetStore::load(dir.path().join("dataset.json")).unwrap();
        assert_eq!(store.last_index_for("a.pdf"), None);
        store.push(entry("a.pdf", 7));
        store.push(entry("a.pdf", 2));
        assert_eq!(store.last_index_for("a.pdf"), Some(7));
    }

    #[test]
    fn save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dataset.json");
        let mut store = DatasetStore::load(&path).unwrap();
        store.push(entry("a.pdf", 0));
        store.push(entry("a.pdf", 4));
        assert!(store.is_dirty());
        store.save().unwrap();
        assert!(!store.is_dirty());

        let reloaded = DatasetStore::load(&path).unwrap();
        assert_eq!(reloaded.entries(), store.entries());
        assert!(!reloaded.is_dirty());
        assert_eq!(reloaded.last_index_for("a.pdf"), Some(4));
    }

    #[test]
    fn reads_existing_dataset_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dataset.json");
        std::fs::write(
            &path,
            r#"[
  {
    "file": "RBI_2022.pdf",
    "paragraph_index": 5,
    "question": "What did the RBI change?",
    "answer": "It revised the limits."
  }
]"#,
        )
        .unwrap();
        let store = DatasetStore::load(&path).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.counts_by_file().get("RBI_2022.pdf"), Some(&1));
    }

    #[test]
    fn remove_file_forgets_its_paragraphs() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = DatasetStore::load(dir.path().join("dataset.json")).unwrap();
        store.push(entry("a.pdf", 0));
        store.push(entry("a.pdf", 1));
        store.push(entry("b.pdf", 0));
        store.save().unwrap();

        assert_eq!(store.remove_file("a.pdf"), 2);
        assert!(store.is_dirty());
        assert_eq!(store.last_index_for("a.pdf"), None);
        assert_eq!(store.len(), 1);
        // The paragraph can be stored again once removed.
        assert!(store.push(entry("a.pdf", 0)));
        assert_eq!(store.remove_file("missing.pdf"), 0);
    }

    #[test]
    fn corrupt_dataset_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dataset.json");
        std::fs::write(&path, "[{\"file\": ").unwrap();
        assert!(DatasetStore::load(&path).is_err());
    }
}
