//! Atomic JSON persistence for host-owned state files.
//!
//! Writes go to a temp file in the target directory and are renamed into
//! place. Rename-over-existing can fail on Windows; one remove-and-retry
//! covers that. Atomicity within a single host process is sufficient.

use crate::error::{Error, Result};
use serde_json::Value;
use std::io::Write as _;
use std::path::Path;
use tempfile::NamedTempFile;

/// Load a JSON file, returning `None` when it does not exist.
pub(crate) fn load_json(path: &Path) -> Result<Option<Value>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(Error::io(format!(
                "failed to read {}: {err}",
                path.display()
            )));
        }
    };
    let value = serde_json::from_str(&raw)
        .map_err(|err| Error::io(format!("corrupt JSON in {}: {err}", path.display())))?;
    Ok(Some(value))
}

/// Write a JSON file atomically (write-to-temp-then-rename).
pub(crate) fn store_json(path: &Path, value: &Value) -> Result<()> {
    let parent = path.parent().ok_or_else(|| {
        Error::io(format!("cannot persist to rootless path {}", path.display()))
    })?;
    std::fs::create_dir_all(parent)?;

    let mut tmp = NamedTempFile::new_in(parent)?;
    serde_json::to_writer_pretty(&mut tmp, value)?;
    tmp.write_all(b"\n")?;
    tmp.flush()?;

    match tmp.persist(path) {
        Ok(_) => Ok(()),
        Err(err) => {
            // Windows refuses rename-over-existing under contention; retry
            // once after removing the target.
            let tmp = err.file;
            let _ = std::fs::remove_file(path);
            tmp.persist(path).map_err(|err| {
                Error::io(format!("failed to persist {}: {}", path.display(), err.error))
            })?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trips_and_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        assert!(load_json(&path).unwrap().is_none());

        store_json(&path, &json!({"a": 1})).unwrap();
        assert_eq!(load_json(&path).unwrap().unwrap(), json!({"a": 1}));

        store_json(&path, &json!({"a": 2})).unwrap();
        assert_eq!(load_json(&path).unwrap().unwrap(), json!({"a": 2}));
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(load_json(&path).is_err());
    }
}
