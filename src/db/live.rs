use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use super::schema::StoreSchema;
use super::store::EncryptedStore;
use crate::config::Passphrase;
use crate::AppResult;

pub const LIVE_STORE_NAME: &str = "live";

/// Shared slot holding the live store handle.
///
/// Opened lazily on first use. Recovery closes and reopens it so every
/// component sharing the slot sees the rebuilt store.
#[derive(Clone)]
pub struct LiveStore {
    path: Arc<PathBuf>,
    passphrase: Arc<Passphrase>,
    slot: Arc<RwLock<Option<Arc<EncryptedStore>>>>,
}

impl LiveStore {
    pub fn new(path: impl Into<PathBuf>, passphrase: Passphrase) -> Self {
        Self {
            path: Arc::new(path.into()),
            passphrase: Arc::new(passphrase),
            slot: Arc::new(RwLock::new(None)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn passphrase(&self) -> &Passphrase {
        &self.passphrase
    }

    /// Current handle, opening the store if it is not open yet.
    pub fn get(&self) -> AppResult<Arc<EncryptedStore>> {
        if let Some(store) = self.slot.read().unwrap_or_else(|e| e.into_inner()).as_ref() {
            if !store.is_closed() {
                return Ok(store.clone());
            }
        }

        let mut guard = self.slot.write().unwrap_or_else(|e| e.into_inner());
        if let Some(store) = guard.as_ref() {
            if !store.is_closed() {
                return Ok(store.clone());
            }
        }
        let store = Arc::new(EncryptedStore::open(
            LIVE_STORE_NAME,
            &self.path,
            &self.passphrase,
            StoreSchema::Live,
        )?);
        *guard = Some(store.clone());
        Ok(store)
    }

    pub fn is_open(&self) -> bool {
        self.slot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|store| !store.is_closed())
            .unwrap_or(false)
    }

    /// Close the handle and clear the slot. Idempotent.
    pub fn close(&self) -> AppResult<()> {
        let taken = self
            .slot
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match taken {
            Some(store) => store.close(),
            None => Ok(()),
        }
    }
}
