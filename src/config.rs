use std::env;
use std::fmt;
use std::path::{Path, PathBuf};

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::codes;
use crate::{AppError, AppResult};

pub const LIVE_DB_FILE_NAME: &str = "ledgerkeep.sqlite3";
pub const BACKUP_DIR_NAME: &str = "backups";
pub const ARCHIVE_DIR_NAME: &str = "archives";
pub const PREFS_FILE_NAME: &str = "prefs.json";
pub const LOG_DIR_NAME: &str = "logs";
pub const DEFAULT_ARCHIVE_PREFIX: &str = "archive";

pub const DEFAULT_RETENTION_COUNT: usize = 5;
const HARD_MAX_RETENTION_COUNT: usize = 50;
pub const DEFAULT_ARCHIVE_THRESHOLD_MONTHS: u32 = 12;
const HARD_MAX_ARCHIVE_THRESHOLD_MONTHS: u32 = 120;
pub const DEFAULT_ARCHIVE_INTERVAL_DAYS: u32 = 90;
const HARD_MAX_ARCHIVE_INTERVAL_DAYS: u32 = 3650;

const DATA_DIR_ENV: &str = "LEDGERKEEP_DATA_DIR";
const LIVE_KEY_ENV: &str = "LEDGERKEEP_DB_KEY";
const ARCHIVE_KEY_ENV: &str = "LEDGERKEEP_ARCHIVE_KEY";

/// On-disk layout and tunables for one ledger data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerConfig {
    pub data_dir: PathBuf,
    pub live_db_path: PathBuf,
    pub backups_dir: PathBuf,
    pub archives_dir: PathBuf,
    pub prefs_path: PathBuf,
    pub archive_prefix: String,
    pub retention_count: usize,
    pub archive_threshold_months: u32,
    pub archive_interval_days: u32,
}

impl LedgerConfig {
    /// Default layout rooted at `data_dir`, ignoring the environment.
    pub fn for_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            live_db_path: data_dir.join(LIVE_DB_FILE_NAME),
            backups_dir: data_dir.join(BACKUP_DIR_NAME),
            archives_dir: data_dir.join(ARCHIVE_DIR_NAME),
            prefs_path: data_dir.join(PREFS_FILE_NAME),
            archive_prefix: DEFAULT_ARCHIVE_PREFIX.to_string(),
            retention_count: DEFAULT_RETENTION_COUNT,
            archive_threshold_months: DEFAULT_ARCHIVE_THRESHOLD_MONTHS,
            archive_interval_days: DEFAULT_ARCHIVE_INTERVAL_DAYS,
            data_dir,
        }
    }

    /// Layout rooted at `data_dir` with environment overrides applied.
    pub fn load(data_dir: impl Into<PathBuf>) -> Self {
        let mut config = Self::for_data_dir(data_dir);
        config.retention_count = env_clamped(
            "LEDGERKEEP_BACKUP_KEEP",
            DEFAULT_RETENTION_COUNT,
            HARD_MAX_RETENTION_COUNT,
        );
        config.archive_threshold_months = env_clamped(
            "LEDGERKEEP_ARCHIVE_MONTHS",
            DEFAULT_ARCHIVE_THRESHOLD_MONTHS,
            HARD_MAX_ARCHIVE_THRESHOLD_MONTHS,
        );
        config.archive_interval_days = env_clamped(
            "LEDGERKEEP_ARCHIVE_INTERVAL_DAYS",
            DEFAULT_ARCHIVE_INTERVAL_DAYS,
            HARD_MAX_ARCHIVE_INTERVAL_DAYS,
        );
        config
    }

    pub fn ensure_dirs(&self) -> AppResult<()> {
        for dir in [&self.data_dir, &self.backups_dir, &self.archives_dir] {
            std::fs::create_dir_all(dir).map_err(|err| {
                AppError::from(err)
                    .with_context("operation", "create_data_dir")
                    .with_context("path", dir.display().to_string())
            })?;
        }
        Ok(())
    }
}

fn env_clamped<T>(key: &str, default: T, max: T) -> T
where
    T: std::str::FromStr + PartialOrd + Copy + Default,
{
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<T>().ok())
        .filter(|value| *value > T::default())
        .map(|value| if value > max { max } else { value })
        .unwrap_or(default)
}

/// Resolve the data directory: `LEDGERKEEP_DATA_DIR`, else the platform data dir.
pub fn default_data_dir() -> AppResult<PathBuf> {
    if let Ok(dir) = env::var(DATA_DIR_ENV) {
        if !dir.trim().is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }
    let base = dirs::data_dir()
        .or_else(|| env::current_dir().ok())
        .ok_or_else(|| {
            AppError::new(
                "CONFIG/NO_DATA_DIR",
                "Failed to resolve application data directory",
            )
        })?;
    Ok(base.join("ledgerkeep"))
}

/// Store passphrase. Wiped from memory on drop and never printed.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Passphrase(String);

impl Passphrase {
    pub fn new(value: impl Into<String>) -> Self {
        Passphrase(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Passphrase(<redacted>)")
    }
}

/// Source of store passphrases. Archives use their own passphrase,
/// distinct from the live store's.
pub trait PassphraseProvider: Send + Sync {
    fn live_passphrase(&self) -> AppResult<Passphrase>;
    fn archive_passphrase(&self) -> AppResult<Passphrase>;
}

#[derive(Debug, Clone)]
pub struct StaticPassphrases {
    live: Passphrase,
    archive: Passphrase,
}

impl StaticPassphrases {
    pub fn new(live: impl Into<String>, archive: impl Into<String>) -> Self {
        Self {
            live: Passphrase::new(live),
            archive: Passphrase::new(archive),
        }
    }
}

impl PassphraseProvider for StaticPassphrases {
    fn live_passphrase(&self) -> AppResult<Passphrase> {
        Ok(self.live.clone())
    }

    fn archive_passphrase(&self) -> AppResult<Passphrase> {
        Ok(self.archive.clone())
    }
}

/// Reads `LEDGERKEEP_DB_KEY` and `LEDGERKEEP_ARCHIVE_KEY` on every call.
#[derive(Debug, Clone, Default)]
pub struct EnvPassphrases;

impl EnvPassphrases {
    fn read(key: &str) -> AppResult<Passphrase> {
        match env::var(key) {
            Ok(value) if !value.is_empty() => Ok(Passphrase::new(value)),
            _ => Err(AppError::new(
                codes::MISSING_PASSPHRASE,
                "Store passphrase is not configured",
            )
            .with_context("env", key.to_string())),
        }
    }
}

impl PassphraseProvider for EnvPassphrases {
    fn live_passphrase(&self) -> AppResult<Passphrase> {
        Self::read(LIVE_KEY_ENV)
    }

    fn archive_passphrase(&self) -> AppResult<Passphrase> {
        Self::read(ARCHIVE_KEY_ENV)
    }
}

/// `<path><suffix>` without touching the extension.
pub(crate) fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(suffix);
    PathBuf::from(os)
}
