//! On-disk index snapshot (`index.json`)
//!
//! ```json
//! { "version": 1, "entries": { "<crs>": "<absolute path>" } }
//! ```
//!
//! Writes go through a temporary file in the same directory followed by a
//! rename, so readers in other processes never see a torn snapshot.
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::CacheError;

pub const INDEX_FILE: &str = "index.json";
const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    entries: BTreeMap<String, PathBuf>,
}

/// Read the snapshot; a missing file is an empty index.
pub fn load(path: &Path) -> Result<BTreeMap<String, PathBuf>, CacheError> {
    let content = match fs::read(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => {
            return Err(CacheError::IndexCorrupt {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
        }
    };

    let snapshot: Snapshot =
        serde_json::from_slice(&content).map_err(|e| CacheError::IndexCorrupt {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

    if snapshot.version != SNAPSHOT_VERSION {
        return Err(CacheError::IndexCorrupt {
            path: path.to_path_buf(),
            reason: format!("unsupported snapshot version {}", snapshot.version),
        });
    }

    Ok(snapshot.entries)
}

/// Atomically replace the snapshot at `path`.
pub fn persist(path: &Path, entries: &BTreeMap<String, PathBuf>) -> Result<(), CacheError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(|e| CacheError::io(dir, e))?;

    let snapshot = Snapshot {
        version: SNAPSHOT_VERSION,
        entries: entries.clone(),
    };
    let json = serde_json::to_vec_pretty(&snapshot).map_err(|e| CacheError::IndexCorrupt {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    let mut temp = tempfile::NamedTempFile::new_in(dir).map_err(|e| CacheError::io(dir, e))?;
    temp.write_all(&json).map_err(|e| CacheError::io(temp.path(), e))?;
    temp.flush().map_err(|e| CacheError::io(temp.path(), e))?;
    temp.persist(path)
        .map_err(|e| CacheError::io(path, e.error))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_snapshot_is_empty() {
        let temp = TempDir::new().unwrap();
        let entries = load(&temp.path().join(INDEX_FILE)).unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn test_persist_and_load() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(INDEX_FILE);

        let mut entries = BTreeMap::new();
        entries.insert("mean(ds(variable='tas',period='1980'))".to_string(), temp.path().join("ab/cd/x.nc"));
        persist(&path, &entries).unwrap();

        assert_eq!(load(&path).unwrap(), entries);

        let raw: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["version"], 1);
    }

    #[test]
    fn test_corrupt_snapshot() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(INDEX_FILE);
        fs::write(&path, b"{ not json").unwrap();

        assert!(matches!(load(&path), Err(CacheError::IndexCorrupt { .. })));
    }

    #[test]
    fn test_unknown_version_is_corrupt() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(INDEX_FILE);
        fs::write(&path, br#"{"version": 9, "entries": {}}"#).unwrap();

        assert!(matches!(load(&path), Err(CacheError::IndexCorrupt { .. })));
    }
}
