//! Atomic JSON persistence for the tracker and dataset files.
//!
//! Writes go to a temp file in the target's directory, are fsynced, then
//! renamed over the target. A crash mid-write leaves the previous file intact.

use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Failure reading or writing a persisted state file.
#[derive(Error, Debug)]
pub enum StateError {
    #[error("failed to access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{} is not valid JSON: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl StateError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        StateError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Read and parse a JSON file. Returns `Ok(None)` if the file does not exist
/// or is blank.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StateError> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StateError::io(path, e)),
    };
    if content.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|source| StateError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
}

/// Serialize `value` as pretty JSON (2-space indent) and atomically replace `path`.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StateError> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).map_err(|e| StateError::io(dir, e))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| StateError::io(dir, e))?;
    {
        let mut writer = BufWriter::new(tmp.as_file_mut());
        serde_json::to_writer_pretty(&mut writer, value)
            .map_err(|e| StateError::io(path, e.into()))?;
        writer
            .write_all(b"\n")
            .and_then(|_| writer.flush())
            .map_err(|e| StateError::io(path, e))?;
    }
    tmp.as_file()
        .sync_all()
        .map_err(|e| StateError::io(path, e))?;
    tmp.persist(path).map_err(|e| StateError::io(path, e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn missing_file_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let got: Option<Vec<u32>> = read_json(&dir.path().join("nope.json")).unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn blank_file_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.json");
        std::fs::write(&path, "  \n").unwrap();
        let got: Option<Vec<u32>> = read_json(&path).unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn write_creates_parent_and_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        let mut map = BTreeMap::new();
        map.insert("a".to_string(), 1u32);
        write_json_atomic(&path, &map).unwrap();
        map.insert("b".to_string(), 2);
        write_json_atomic(&path, &map).unwrap();

        let back: BTreeMap<String, u32> = read_json(&path).unwrap().unwrap();
        assert_eq!(back, map);
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\n  \"a\": 1"), "expected 2-space indent: {raw}");
    }

    #[test]
    fn malformed_json_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "[{]").unwrap();
        let err = read_json::<Vec<u32>>(&path).unwrap_err();
        assert!(matches!(err, StateError::Corrupt { .. }));
    }
}
