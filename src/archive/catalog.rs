use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::config::Passphrase;
use crate::db::swap::remove_store_files;
use crate::db::{EncryptedStore, StoreSchema};
use crate::error::codes;
use crate::logging::LOG_TARGET;
use crate::time::PeriodKey;
use crate::{AppError, AppResult};

const SHARD_EXTENSION: &str = "db";

static SHARD_FILE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<prefix>[A-Za-z0-9-]+(?:_[A-Za-z0-9-]+)*)_(?P<year>\d{4})\.db$")
        .expect("valid shard file regex")
});

/// A shard file found on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardInfo {
    pub period: PeriodKey,
    pub name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub formatted_size: String,
    pub modified_at: DateTime<Utc>,
}

/// Owns the per-period archive shards and their open handles.
pub struct ArchiveCatalog {
    dir: PathBuf,
    prefix: String,
    passphrase: Passphrase,
    open: Mutex<HashMap<PeriodKey, Arc<EncryptedStore>>>,
}

impl ArchiveCatalog {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>, passphrase: Passphrase) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
            passphrase,
            open: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `<prefix>_<period>`, also the store name used in logs.
    pub fn shard_name(&self, period: PeriodKey) -> String {
        format!("{}_{period}", self.prefix)
    }

    pub fn shard_path(&self, period: PeriodKey) -> PathBuf {
        self.dir
            .join(format!("{}.{SHARD_EXTENSION}", self.shard_name(period)))
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PeriodKey, Arc<EncryptedStore>>> {
        self.open.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Cached handle for `period`, opening and creating the shard if needed.
    pub fn shard_for(&self, period: PeriodKey) -> AppResult<Arc<EncryptedStore>> {
        let mut open = self.lock();
        if let Some(store) = open.get(&period) {
            if !store.is_closed() {
                return Ok(store.clone());
            }
        }

        fs::create_dir_all(&self.dir).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "create_archives_dir")
                .with_context("path", self.dir.display().to_string())
        })?;
        let store = Arc::new(EncryptedStore::open(
            self.shard_name(period),
            &self.shard_path(period),
            &self.passphrase,
            StoreSchema::Archive,
        )?);
        tracing::info!(
            target: LOG_TARGET,
            event = "shard_opened",
            period = %period,
            path = %store.path().display()
        );
        open.insert(period, store.clone());
        Ok(store)
    }

    /// Like [`shard_for`](Self::shard_for) but never creates a missing shard.
    pub fn open_existing(&self, period: PeriodKey) -> AppResult<Arc<EncryptedStore>> {
        if !self.shard_path(period).exists() {
            return Err(
                AppError::new(codes::SHARD_NOT_FOUND, "No archive exists for this period")
                    .with_context("period", period.to_string()),
            );
        }
        self.shard_for(period)
    }

    pub fn cached_periods(&self) -> Vec<PeriodKey> {
        let mut periods: Vec<PeriodKey> = self
            .lock()
            .iter()
            .filter(|(_, store)| !store.is_closed())
            .map(|(period, _)| *period)
            .collect();
        periods.sort();
        periods
    }

    /// Every shard file in the archive directory, newest period first.
    pub fn list_shards(&self) -> AppResult<Vec<ShardInfo>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(AppError::from(err)
                    .with_context("operation", "read_archives_dir")
                    .with_context("path", self.dir.display().to_string()))
            }
        };

        let mut shards = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            let Some(period) = self.period_of(file_name) else {
                continue;
            };
            let meta = match entry.metadata() {
                Ok(meta) if meta.is_file() => meta,
                Ok(_) => continue,
                Err(err) => {
                    tracing::warn!(
                        target: LOG_TARGET,
                        event = "shard_metadata_failed",
                        path = %path.display(),
                        error = %err
                    );
                    continue;
                }
            };
            let modified_at = meta
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            shards.push(ShardInfo {
                period,
                name: self.shard_name(period),
                path,
                size_bytes: meta.len(),
                formatted_size: format_bytes(meta.len()),
                modified_at,
            });
        }
        shards.sort_by(|a, b| b.period.cmp(&a.period));
        Ok(shards)
    }

    fn period_of(&self, file_name: &str) -> Option<PeriodKey> {
        let caps = SHARD_FILE_PATTERN.captures(file_name)?;
        if &caps["prefix"] != self.prefix {
            return None;
        }
        caps["year"].parse().ok()
    }

    /// Close, remove and forget the shard. `false` when it did not exist.
    pub fn delete_shard(&self, period: PeriodKey) -> AppResult<bool> {
        let mut open = self.lock();
        if let Some(store) = open.remove(&period) {
            store.close()?;
        }
        let removed = remove_store_files(&self.shard_path(period))?;
        if removed {
            tracing::info!(target: LOG_TARGET, event = "shard_deleted", period = %period);
        }
        Ok(removed)
    }

    /// Close every cached handle. Safe to call repeatedly.
    pub fn close_all(&self) -> AppResult<()> {
        let drained: Vec<(PeriodKey, Arc<EncryptedStore>)> = self.lock().drain().collect();
        let mut first_error = None;
        for (period, store) in drained {
            if let Err(err) = store.close() {
                tracing::warn!(
                    target: LOG_TARGET,
                    event = "shard_close_failed",
                    period = %period,
                    error = %err
                );
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for ArchiveCatalog {
    fn drop(&mut self) {
        let _ = self.close_all();
    }
}

fn format_bytes(bytes: u64) -> String {
    if bytes == 0 {
        return "0 MB".to_string();
    }
    let mb = (bytes as f64) / 1_000_000.0;
    if mb < 1.0 {
        "1 MB".to_string()
    } else {
        format!("{:.0} MB", mb.ceil())
    }
}
