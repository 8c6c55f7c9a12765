use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::db::write_atomic;
use crate::{AppError, AppResult};

/// Epoch millis of the last successful archiving pass; 0 or absent means never.
pub const LAST_ARCHIVE_RUN_KEY: &str = "lastArchiveRunTime";

/// Process-wide key/value state that outlives a single run.
pub trait PreferenceStore: Send + Sync {
    fn get_i64(&self, key: &str) -> AppResult<Option<i64>>;
    fn set_i64(&self, key: &str, value: i64) -> AppResult<()>;
}

/// Preferences kept as a flat JSON object in one file.
#[derive(Debug)]
pub struct JsonPreferenceStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonPreferenceStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_map(&self) -> AppResult<BTreeMap<String, serde_json::Value>> {
        match std::fs::read(&self.path) {
            Ok(bytes) if bytes.is_empty() => Ok(BTreeMap::new()),
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|err| {
                AppError::from(err)
                    .with_context("operation", "read_preferences")
                    .with_context("path", self.path.display().to_string())
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(err) => Err(AppError::from(err)
                .with_context("operation", "read_preferences")
                .with_context("path", self.path.display().to_string())),
        }
    }
}

impl PreferenceStore for JsonPreferenceStore {
    fn get_i64(&self, key: &str) -> AppResult<Option<i64>> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        Ok(self.read_map()?.get(key).and_then(|value| value.as_i64()))
    }

    fn set_i64(&self, key: &str, value: i64) -> AppResult<()> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut map = self.read_map()?;
        map.insert(key.to_string(), serde_json::Value::from(value));
        let payload = serde_json::to_vec_pretty(&map)?;
        write_atomic(&self.path, &payload)
            .map_err(|err| err.with_context("operation", "write_preferences"))
    }
}

#[derive(Debug, Default)]
pub struct MemoryPreferenceStore {
    values: Mutex<BTreeMap<String, i64>>,
}

impl MemoryPreferenceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PreferenceStore for MemoryPreferenceStore {
    fn get_i64(&self, key: &str) -> AppResult<Option<i64>> {
        let values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        Ok(values.get(key).copied())
    }

    fn set_i64(&self, key: &str, value: i64) -> AppResult<()> {
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.insert(key.to_string(), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn json_store_round_trips_and_keeps_other_keys() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("prefs.json");
        std::fs::write(&path, br#"{"theme":"dark"}"#).unwrap();

        let prefs = JsonPreferenceStore::new(&path);
        assert_eq!(prefs.get_i64(LAST_ARCHIVE_RUN_KEY).unwrap(), None);
        prefs.set_i64(LAST_ARCHIVE_RUN_KEY, 1_700_000_000_000).unwrap();

        let reopened = JsonPreferenceStore::new(&path);
        assert_eq!(
            reopened.get_i64(LAST_ARCHIVE_RUN_KEY).unwrap(),
            Some(1_700_000_000_000)
        );
        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["theme"], "dark");
    }

    #[test]
    fn missing_file_reads_as_empty() {
        let dir = tempdir().unwrap();
        let prefs = JsonPreferenceStore::new(dir.path().join("absent.json"));
        assert_eq!(prefs.get_i64(LAST_ARCHIVE_RUN_KEY).unwrap(), None);
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("prefs.json");
        std::fs::write(&path, b"{not json").unwrap();
        let err = JsonPreferenceStore::new(&path)
            .get_i64(LAST_ARCHIVE_RUN_KEY)
            .expect_err("corrupt prefs");
        assert_eq!(err.code(), "JSON/SYNTAX");
    }

    #[test]
    fn memory_store_is_independent() {
        let prefs = MemoryPreferenceStore::new();
        prefs.set_i64("a", 1).unwrap();
        assert_eq!(prefs.get_i64("a").unwrap(), Some(1));
        assert_eq!(prefs.get_i64("b").unwrap(), None);
    }
}
