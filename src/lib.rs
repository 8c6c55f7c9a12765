pub mod archive;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod model;
pub mod prefs;
pub mod repo;
pub mod time;

pub use error::{AppError, AppResult};

use std::sync::Arc;

use archive::{ArchiveCatalog, ArchiveManager, ArchivePolicy};
use config::{LedgerConfig, PassphraseProvider};
use db::backup::BackupManager;
use db::recovery::RecoveryManager;
use db::LiveStore;
use prefs::{JsonPreferenceStore, PreferenceStore};

/// Every lifecycle component wired to one data directory.
///
/// All managers share the same [`LiveStore`] slot.
pub struct Ledger {
    pub config: LedgerConfig,
    pub live: LiveStore,
    pub archive: ArchiveManager,
    pub backups: BackupManager,
    pub recovery: RecoveryManager,
}

impl Ledger {
    pub fn open(config: LedgerConfig, keys: &dyn PassphraseProvider) -> AppResult<Self> {
        config.ensure_dirs()?;
        let live = LiveStore::new(config.live_db_path.clone(), keys.live_passphrase()?);
        let catalog = Arc::new(ArchiveCatalog::new(
            config.archives_dir.clone(),
            config.archive_prefix.clone(),
            keys.archive_passphrase()?,
        ));
        let prefs: Arc<dyn PreferenceStore> =
            Arc::new(JsonPreferenceStore::new(config.prefs_path.clone()));
        let archive = ArchiveManager::new(
            live.clone(),
            catalog,
            prefs,
            ArchivePolicy::from(&config),
        );
        let backups = BackupManager::new(
            live.clone(),
            config.backups_dir.clone(),
            config.retention_count,
        );
        let recovery = RecoveryManager::new(live.clone(), backups.clone());
        Ok(Self {
            config,
            live,
            archive,
            backups,
            recovery,
        })
    }

    /// Release the live store and every open shard.
    pub fn close(&self) -> AppResult<()> {
        self.archive.catalog().close_all()?;
        self.live.close()
    }
}
