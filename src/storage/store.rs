//! The Registry Store
//!
//! Owns the writer and reader connections and the rolling backup.
//! - Reads run in a deferred transaction on the reader, so a listing is one
//!   consistent snapshot even while a write is in flight.
//! - Writes run in an IMMEDIATE transaction on the writer and bump the
//!   registry version exactly once per batch.
//! - `snapshot_and_backup` copies the committed state aside before batch
//!   mutations (reconciliation, eviction).

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, TransactionBehavior};
use serde::Serialize;
use crate::error::{Result, MediaError};
use crate::storage::connection::{self, install_file, temp_path_for};
use crate::storage::{Repository, SqlPath};

pub struct Store {
    primary_path: PathBuf,
    backup_path: PathBuf,
    // Field order is drop order: the writer closes last and checkpoints the WAL.
    reader: Mutex<Connection>,
    writer: Mutex<Connection>,
}

/// Result of a snapshot-and-backup step.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub registry_version: u64,
    pub taken_at: DateTime<Utc>,
    pub backup_path: PathBuf,
}

/// How the primary was brought up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOutcome {
    Clean,
    RestoredFromBackup,
}

impl Store {
    /// Open the primary registry, falling back to the backup if the primary
    /// is unreadable.
    pub fn open(primary_path: &Path, backup_path: &Path) -> Result<(Self, OpenOutcome)> {
        let (writer, outcome) = match connection::open_writer(primary_path) {
            Ok(conn) => (conn, OpenOutcome::Clean),
            Err(MediaError::StoreCorruption(reason)) => {
                tracing::error!("[Repository] Primary registry {} is corrupt: {}", primary_path.display(), reason);
                if !backup_path.exists() {
                    tracing::error!("[Repository] No backup at {}; refusing to start", backup_path.display());
                    return Err(MediaError::StoreCorruption(reason));
                }
                tracing::error!("[Repository] Restoring registry from backup {}", backup_path.display());
                connection::restore_backup(backup_path, primary_path)?;
                (connection::open_writer(primary_path)?, OpenOutcome::RestoredFromBackup)
            }
            Err(e) => return Err(e),
        };
        let reader = connection::open_reader(primary_path)?;

        Ok((
            Self {
                primary_path: primary_path.to_path_buf(),
                backup_path: backup_path.to_path_buf(),
                writer: Mutex::new(writer),
                reader: Mutex::new(reader),
            },
            outcome,
        ))
    }

    pub fn primary_path(&self) -> &Path {
        &self.primary_path
    }

    pub fn backup_path(&self) -> &Path {
        &self.backup_path
    }

    /// Run `f` against one consistent read snapshot.
    pub fn read<T>(&self, f: impl FnOnce(&Repository<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.reader.lock().map_err(|_| MediaError::poisoned())?;
        let tx = conn.transaction()?;
        let repo = Repository::new(&tx);
        f(&repo)
    }

    /// Run `f` inside one atomic write batch. Nothing is persisted unless `f`
    /// succeeds; the commit is flushed before this returns.
    pub fn write<T>(&self, f: impl FnOnce(&Repository<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.writer.lock().map_err(|_| MediaError::poisoned())?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = {
            let repo = Repository::new(&tx);
            let value = f(&repo)?;
            repo.bump_registry_version()?;
            value
        };
        tx.commit()?;
        Ok(value)
    }

    /// Bookkeeping write (timestamps in `system_config`) that leaves the
    /// registry version alone.
    pub fn write_meta<T>(&self, f: impl FnOnce(&Repository<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.writer.lock().map_err(|_| MediaError::poisoned())?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&Repository::new(&tx))?;
        tx.commit()?;
        Ok(value)
    }

    pub fn registry_version(&self) -> Result<u64> {
        self.read(|repo| repo.registry_version())
    }

    /// Write a consistent copy of the committed registry to the backup path.
    ///
    /// The copy goes to a temp file first and is renamed into place, so a
    /// crash leaves either the previous backup or the new one.
    pub fn snapshot_and_backup(&self) -> Result<Snapshot> {
        let conn = self.writer.lock().map_err(|_| MediaError::poisoned())?;
        let registry_version = Repository::new(&conn).registry_version()?;

        let tmp = temp_path_for(&self.backup_path);
        if let Some(parent) = tmp.parent() {
            fs::create_dir_all(parent)?;
        }
        if tmp.exists() {
            fs::remove_file(&tmp)?;
        }
        conn.execute("VACUUM INTO ?1", rusqlite::params![SqlPath(&tmp)])?;
        install_file(&tmp, &self.backup_path)?;

        tracing::debug!("[Repository] Backup written at version {} -> {}",
            registry_version, self.backup_path.display());

        Ok(Snapshot {
            registry_version,
            taken_at: Utc::now(),
            backup_path: self.backup_path.clone(),
        })
    }

    /// Full integrity check of the live primary.
    pub fn check_integrity(&self) -> Result<()> {
        let conn = self.writer.lock().map_err(|_| MediaError::poisoned())?;
        connection::validate(&conn)
    }

    /// Swap the primary for the backup while the engine is running.
    ///
    /// The backup is copied and validated before the live handles are
    /// closed. If it is unusable the store keeps serving from the current
    /// primary and the error is reported as corruption.
    pub fn restore_from_backup(&self) -> Result<()> {
        let staged = connection::stage_backup(&self.backup_path, &self.primary_path).map_err(|e| {
            MediaError::StoreCorruption(format!("backup {} is unusable: {}", self.backup_path.display(), e))
        })?;

        let mut writer = self.writer.lock().map_err(|_| MediaError::poisoned())?;
        let mut reader = self.reader.lock().map_err(|_| MediaError::poisoned())?;

        tracing::error!("[Repository] Restoring {} from backup {}",
            self.primary_path.display(), self.backup_path.display());

        // Close the live handles before the file underneath them is replaced.
        drop(std::mem::replace(&mut *reader, Connection::open_in_memory()?));
        drop(std::mem::replace(&mut *writer, Connection::open_in_memory()?));

        let reopened = connection::install_staged(&staged, &self.primary_path).and_then(|()| {
            Ok((connection::open_writer(&self.primary_path)?, connection::open_reader(&self.primary_path)?))
        });
        match reopened {
            Ok((w, r)) => {
                *writer = w;
                *reader = r;
                Ok(())
            }
            Err(e) => {
                tracing::error!("[Repository] Restore failed: {}", e);
                // Reattach to whatever is at the primary path now.
                if let Ok(w) = connection::open_writer(&self.primary_path) {
                    *writer = w;
                }
                if let Ok(r) = connection::open_reader(&self.primary_path) {
                    *reader = r;
                }
                Err(e)
            }
        }
    }
}
