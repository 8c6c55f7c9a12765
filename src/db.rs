use std::io::Write;
use std::path::Path;

use crate::{AppError, AppResult};

pub mod backup;
pub mod health;
pub mod live;
pub mod recovery;
pub mod repair;
pub mod schema;
pub mod snapshot;
pub mod store;
pub mod swap;

pub use live::LiveStore;
pub use schema::StoreSchema;
pub use store::EncryptedStore;

/// Write `bytes` to `path` via a temp file in the same directory and a rename.
///
/// The parent directory must already exist. On failure any previous file at
/// `path` is left untouched.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> AppResult<()> {
    let parent = path.parent().ok_or_else(|| {
        AppError::new("IO/NO_PARENT", "Target path has no parent directory")
            .with_context("path", path.display().to_string())
    })?;
    if !parent.is_dir() {
        return Err(
            AppError::new("IO/NotFound", "Target directory does not exist")
                .with_context("path", parent.display().to_string()),
        );
    }

    let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "create_temp_file")
            .with_context("path", parent.display().to_string())
    })?;
    tmp.write_all(bytes)
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|err| {
            AppError::from(err)
                .with_context("operation", "write_temp_file")
                .with_context("path", tmp.path().display().to_string())
        })?;
    tmp.persist(path).map_err(|err| {
        AppError::from(err.error)
            .with_context("operation", "persist_temp_file")
            .with_context("path", path.display().to_string())
    })?;

    if let Ok(dir) = std::fs::File::open(parent) {
        let _ = dir.sync_all();
    }
    Ok(())
}
