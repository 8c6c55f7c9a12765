use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::config::with_suffix;
use crate::{AppError, AppResult};

const SIDECARS: [&str; 3] = ["-wal", "-shm", "-journal"];

fn ensure_same_parent(live: &Path, other: &Path, role: &str) -> AppResult<()> {
    let live_parent = live.parent().ok_or_else(|| {
        AppError::new(
            "DB_SWAP/NO_PARENT",
            "Database path does not have a parent directory",
        )
        .with_context("path", live.display().to_string())
    })?;

    let other_parent = other.parent().ok_or_else(|| {
        AppError::new(
            "DB_SWAP/NO_PARENT",
            format!("{role} path does not have a parent directory"),
        )
        .with_context("path", other.display().to_string())
    })?;

    if live_parent != other_parent {
        return Err(AppError::new(
            "DB_SWAP/DIFFERENT_PARENT",
            "Swap paths must share the same parent directory",
        )
        .with_context("live", live.display().to_string())
        .with_context(role, other.display().to_string()));
    }

    Ok(())
}

fn sync_file(path: &Path) -> io::Result<()> {
    File::open(path)?.sync_all()
}

fn sync_dir(path: &Path) -> io::Result<()> {
    File::open(path)?.sync_all()
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

/// Remove the `-wal`, `-shm` and `-journal` files that belong to `db_path`.
pub fn remove_sidecars(db_path: &Path) -> io::Result<()> {
    for suffix in SIDECARS {
        remove_if_present(&with_suffix(db_path, suffix))?;
    }
    Ok(())
}

/// Sidecar files of `db_path` that currently exist.
pub fn existing_sidecars(db_path: &Path) -> Vec<PathBuf> {
    SIDECARS
        .iter()
        .map(|suffix| with_suffix(db_path, suffix))
        .filter(|path| path.exists())
        .collect()
}

/// Delete a store file and its side files. Returns whether the main file existed.
pub fn remove_store_files(db_path: &Path) -> AppResult<bool> {
    let existed = db_path.exists();
    remove_if_present(db_path).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "remove_store_file")
            .with_context("path", db_path.display().to_string())
    })?;
    remove_sidecars(db_path).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "remove_store_sidecars")
            .with_context("path", db_path.display().to_string())
    })?;
    Ok(existed)
}

/// Copies kept per tag (`backup`, `corrupt`) next to a store.
pub const SIDE_COPY_KEEP: usize = 3;

/// Delete all but the newest `keep` copies named `<db>.<tag>-<stamp>[-NN]`,
/// together with their side files. Returns the removed copies, oldest last.
pub fn prune_side_copies(db_path: &Path, tag: &str, keep: usize) -> AppResult<Vec<PathBuf>> {
    let (Some(parent), Some(db_name)) = (db_path.parent(), db_path.file_name()) else {
        return Ok(Vec::new());
    };
    let prefix = format!("{}.{tag}-", db_name.to_string_lossy());
    let entries = fs::read_dir(parent).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "list_side_copies")
            .with_context("path", parent.display().to_string())
    })?;

    let mut copies: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|kind| kind.is_file()).unwrap_or(false))
        .map(|entry| entry.path())
        .filter(|path| {
            let name = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            name.starts_with(&prefix) && !SIDECARS.iter().any(|suffix| name.ends_with(suffix))
        })
        .collect();
    // Stamps are fixed width and a collision suffix sorts after its base name.
    copies.sort_by(|a, b| b.file_name().cmp(&a.file_name()));

    let stale = copies.split_off(keep.min(copies.len()));
    for path in &stale {
        remove_store_files(path)?;
    }
    Ok(stale)
}

/// Move an unreadable store aside as `<name>.corrupt-<timestamp>` and drop
/// its side files. Returns `None` when there was no file to move.
pub fn quarantine_database(db_path: &Path, at: DateTime<Utc>) -> AppResult<Option<PathBuf>> {
    if !db_path.exists() {
        remove_sidecars(db_path).map_err(AppError::from)?;
        return Ok(None);
    }

    let stamp = at.format("%Y%m%d-%H%M%S").to_string();
    let mut target = with_suffix(db_path, &format!(".corrupt-{stamp}"));
    let mut attempt = 1;
    while target.exists() {
        target = with_suffix(db_path, &format!(".corrupt-{stamp}-{attempt:02}"));
        attempt += 1;
    }

    fs::rename(db_path, &target).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "quarantine_db")
            .with_context("from", db_path.display().to_string())
            .with_context("to", target.display().to_string())
    })?;
    remove_sidecars(db_path).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "remove_quarantined_sidecars")
            .with_context("path", db_path.display().to_string())
    })?;
    if let Some(parent) = db_path.parent() {
        sync_dir(parent).ok();
    }
    Ok(Some(target))
}

/// Atomically replace the live database file with a newly rebuilt copy while
/// preserving the original database under the provided archive path.
///
/// The caller is responsible for ensuring the new database has been fully
/// validated and that no connection to the live file is open.
pub fn swap_database(live_path: &Path, new_db: &Path, archive_path: &Path) -> AppResult<()> {
    ensure_same_parent(live_path, new_db, "new")?;
    ensure_same_parent(live_path, archive_path, "archive")?;

    let parent = live_path.parent().ok_or_else(|| {
        AppError::new(
            "DB_SWAP/NO_PARENT",
            "Database path does not have a parent directory",
        )
        .with_context("path", live_path.display().to_string())
    })?;

    sync_file(new_db).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "sync_new_db")
            .with_context("path", new_db.display().to_string())
    })?;

    if archive_path.exists() {
        fs::remove_file(archive_path).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "remove_existing_archive")
                .with_context("path", archive_path.display().to_string())
        })?;
    }

    fs::rename(live_path, archive_path).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "archive_live_db")
            .with_context("from", live_path.display().to_string())
            .with_context("to", archive_path.display().to_string())
    })?;

    remove_sidecars(live_path).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "remove_live_sidecars")
            .with_context("path", live_path.display().to_string())
    })?;

    match fs::rename(new_db, live_path) {
        Ok(()) => {
            sync_file(live_path).map_err(|err| {
                AppError::from(err)
                    .with_context("operation", "sync_live_db")
                    .with_context("path", live_path.display().to_string())
            })?;
            sync_dir(parent).map_err(|err| {
                AppError::from(err)
                    .with_context("operation", "sync_parent_dir")
                    .with_context("path", parent.display().to_string())
            })?;
            Ok(())
        }
        Err(err) => {
            let _ = fs::rename(archive_path, live_path);
            Err(AppError::from(err)
                .with_context("operation", "promote_new_db")
                .with_context("from", new_db.display().to_string())
                .with_context("to", live_path.display().to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn write_file(path: &Path, contents: &[u8]) {
        fs::write(path, contents).expect("write file");
    }

    #[test]
    fn swap_promotes_new_db_and_archives_old() {
        let dir = tempdir().unwrap();
        let live = dir.path().join("ledgerkeep.sqlite3");
        let new = dir.path().join("rebuilt.sqlite3");
        let archive = dir.path().join("ledgerkeep.sqlite3.pre-repair");

        write_file(&live, b"old");
        write_file(&with_suffix(&live, "-wal"), b"stale wal");
        write_file(&new, b"new");

        swap_database(&live, &new, &archive).expect("swap succeeds");

        assert_eq!(fs::read(&live).unwrap(), b"new".as_slice());
        assert_eq!(fs::read(&archive).unwrap(), b"old".as_slice());
        assert!(!new.exists());
        assert!(existing_sidecars(&live).is_empty());
    }

    #[test]
    fn swap_rejects_different_parents() {
        let dir = tempdir().unwrap();
        let other = tempdir().unwrap();
        let live = dir.path().join("ledgerkeep.sqlite3");
        let new = other.path().join("rebuilt.sqlite3");
        let archive = dir.path().join("ledgerkeep.sqlite3.pre-repair");

        write_file(&live, b"old");
        write_file(&new, b"new");

        let err = swap_database(&live, &new, &archive).expect_err("different parents rejected");
        assert_eq!(err.code(), "DB_SWAP/DIFFERENT_PARENT");
    }

    #[test]
    fn quarantine_moves_file_and_drops_sidecars() {
        let dir = tempdir().unwrap();
        let live = dir.path().join("ledgerkeep.sqlite3");
        write_file(&live, b"garbage");
        write_file(&with_suffix(&live, "-wal"), b"wal");
        write_file(&with_suffix(&live, "-journal"), b"journal");

        let at = Utc.with_ymd_and_hms(2024, 5, 1, 8, 30, 0).unwrap();
        let moved = quarantine_database(&live, at).unwrap().expect("file moved");

        assert!(!live.exists());
        assert!(existing_sidecars(&live).is_empty());
        assert_eq!(
            moved.file_name().unwrap().to_string_lossy(),
            "ledgerkeep.sqlite3.corrupt-20240501-083000"
        );
        assert_eq!(fs::read(&moved).unwrap(), b"garbage".as_slice());

        write_file(&live, b"again");
        let second = quarantine_database(&live, at).unwrap().expect("file moved");
        assert_ne!(second, moved);
    }

    #[test]
    fn quarantine_of_missing_file_is_none() {
        let dir = tempdir().unwrap();
        let live = dir.path().join("ledgerkeep.sqlite3");
        assert!(quarantine_database(&live, Utc::now()).unwrap().is_none());
    }

    #[test]
    fn prune_side_copies_keeps_newest_per_tag() {
        let dir = tempdir().unwrap();
        let live = dir.path().join("ledgerkeep.sqlite3");
        write_file(&live, b"live");
        let stamps = [
            "20240101-000000",
            "20240102-000000",
            "20240103-000000",
            "20240103-000000-01",
            "20240104-000000",
        ];
        for stamp in stamps {
            write_file(&with_suffix(&live, &format!(".backup-{stamp}")), b"copy");
        }
        write_file(&with_suffix(&live, ".backup-20240101-000000-wal"), b"wal");
        write_file(&with_suffix(&live, ".corrupt-20230101-000000"), b"bad");

        let removed = prune_side_copies(&live, "backup", 3).unwrap();
        let names: Vec<String> = removed
            .iter()
            .map(|path| path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            names,
            vec![
                "ledgerkeep.sqlite3.backup-20240102-000000",
                "ledgerkeep.sqlite3.backup-20240101-000000",
            ]
        );
        assert!(!with_suffix(&live, ".backup-20240101-000000-wal").exists());
        assert!(with_suffix(&live, ".backup-20240103-000000-01").exists());
        assert!(with_suffix(&live, ".backup-20240104-000000").exists());
        assert!(with_suffix(&live, ".corrupt-20230101-000000").exists());
        assert!(live.exists());

        assert!(prune_side_copies(&live, "backup", 3).unwrap().is_empty());
    }

    #[test]
    fn remove_store_files_reports_existence() {
        let dir = tempdir().unwrap();
        let shard = dir.path().join("archive_2023.db");
        write_file(&shard, b"db");
        write_file(&with_suffix(&shard, "-shm"), b"shm");

        assert!(remove_store_files(&shard).unwrap());
        assert!(!shard.exists());
        assert!(existing_sidecars(&shard).is_empty());
        assert!(!remove_store_files(&shard).unwrap());
    }
}
