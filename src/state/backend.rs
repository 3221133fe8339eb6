use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde_json::Value;
use tempfile::NamedTempFile;

use super::StateBackend;
use crate::error::{Error, Result};

/// One JSON file per key under a state directory.
#[derive(Debug, Clone)]
pub struct FileStateBackend {
    dir: PathBuf,
}

impl FileStateBackend {
    /// Uses `dir`, creating it if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.dir.join(format!("{key}.json")))
    }
}

impl StateBackend for FileStateBackend {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        let path = self.path_for(key)?;
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&path)?;
        let value = serde_json::from_str(&contents).map_err(|e| Error::State {
            key: key.to_string(),
            reason: format!("corrupt state file {}: {e}", path.display()),
        })?;
        Ok(Some(value))
    }

    fn save(&self, key: &str, value: &Value) -> Result<()> {
        let path = self.path_for(key)?;
        // Each save gets its own temp file in the same directory, so
        // concurrent writers of one key never share a staging file.
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(&serde_json::to_vec_pretty(value)?)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(())
    }
}

/// Keys become file names, so only a conservative character set is allowed.
fn validate_key(key: &str) -> Result<()> {
    let valid = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !key.starts_with('.');
    if valid {
        Ok(())
    } else {
        Err(Error::State {
            key: key.to_string(),
            reason: "state keys may only contain letters, digits, '-', '_' and '.'".to_string(),
        })
    }
}

/// In-process backend, mostly for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStateBackend {
    records: Mutex<HashMap<String, Value>>,
}

impl MemoryStateBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateBackend for MemoryStateBackend {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        Ok(records.get(key).cloned())
    }

    fn save(&self, key: &str, value: &Value) -> Result<()> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.insert(key.to_string(), value.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn file_backend_roundtrip_and_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileStateBackend::new(dir.path().join("state")).unwrap();

        assert!(backend.get("SpecCpuState").unwrap().is_none());

        backend.save("SpecCpuState", &json!({"SpecCpuInitialized": false})).unwrap();
        backend.save("SpecCpuState", &json!({"SpecCpuInitialized": true})).unwrap();

        let value = backend.get("SpecCpuState").unwrap().unwrap();
        assert_eq!(value, json!({"SpecCpuInitialized": true}));
        let names: Vec<_> = fs::read_dir(dir.path().join("state"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec!["SpecCpuState.json"]);
    }

    #[test]
    fn concurrent_saves_of_one_key_stay_consistent() {
        let dir = tempfile::tempdir().unwrap();
        let backend = std::sync::Arc::new(FileStateBackend::new(dir.path()).unwrap());

        let writers: Vec<_> = (0..8)
            .map(|i| {
                let backend = backend.clone();
                std::thread::spawn(move || {
                    for round in 0..20 {
                        backend
                            .save("SysbenchOLTPState", &json!({"writer": i, "round": round}))
                            .unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let value = backend.get("SysbenchOLTPState").unwrap().unwrap();
        assert!(value["writer"].is_u64() && value["round"].is_u64());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn file_backend_rejects_path_like_keys() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileStateBackend::new(dir.path()).unwrap();
        assert!(backend.get("../escape").is_err());
        assert!(backend.save("a/b", &json!({})).is_err());
        assert!(backend.get("").is_err());
    }

    #[test]
    fn file_backend_reports_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileStateBackend::new(dir.path()).unwrap();
        fs::write(dir.path().join("Broken.json"), "{not json").unwrap();

        let err = backend.get("Broken").unwrap_err();
        assert!(matches!(err, Error::State { ref key, .. } if key == "Broken"));
    }

    #[test]
    fn memory_backend_roundtrip() {
        let backend = MemoryStateBackend::new();
        assert!(backend.get("k").unwrap().is_none());
        backend.save("k", &json!({"a": 1})).unwrap();
        assert_eq!(backend.get("k").unwrap(), Some(json!({"a": 1})));
    }
}
