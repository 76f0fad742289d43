//! Database connection management
//!
//! Opens the registry file, applies pragmas, creates the schema on first use
//! and validates that an existing file is a readable registry snapshot.
//! Also owns the file-level plumbing for the rolling backup: every file put
//! in place here goes through a temp file and an atomic rename.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::Duration;
use rusqlite::{Connection, OpenFlags, OptionalExtension};
use crate::error::{Result, MediaError};

/// Format tag stored in `system_config`. Makes every registry file self-describing.
pub const REGISTRY_FORMAT: &str = "mediavault-registry";
pub const SCHEMA_VERSION: u32 = 1;

pub const KEY_FORMAT: &str = "format";
pub const KEY_SCHEMA_VERSION: &str = "schema_version";
pub const KEY_REGISTRY_VERSION: &str = "registry_version";
pub const KEY_LAST_RECONCILED_AT: &str = "last_reconciled_at";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open the writer connection, creating the schema if the file is new.
///
/// An existing file that does not validate as a registry snapshot is
/// reported as `StoreCorruption`; the caller decides whether a backup exists.
pub fn open_writer(db_path: &Path) -> Result<Connection> {
    let db_dir = db_path.parent()
        .ok_or_else(|| MediaError::InvalidPath(format!("Invalid registry path: {}", db_path.display())))?;
    fs::create_dir_all(db_dir)?;

    let is_new = fs::metadata(db_path).map(|m| m.len() == 0).unwrap_or(true);

    let conn = Connection::open(db_path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;

    // Journal mode is the first statement that touches the file, so a
    // garbage primary surfaces here as NotADatabase.
    conn.pragma_update(None, "journal_mode", WAL)?;
    conn.pragma_update(None, "foreign_keys", ON)?;
    // Every commit is flushed before the caller gets an answer.
    conn.pragma_update(None, "synchronous", FULL)?;

    if is_new {
        create_tables(&conn)?;
        tracing::info!("[Repository] Initialized new registry at {}", db_path.display());
    } else {
        validate(&conn)?;
        tracing::info!("[Repository] Loaded existing registry at {}", db_path.display());
    }

    Ok(conn)
}

/// Open a read-only connection next to the writer. WAL lets it read while a
/// write transaction is open.
pub fn open_reader(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open_with_flags(
        db_path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(conn)
}

/// Create all required tables in the database
pub fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(r#"
        CREATE TABLE IF NOT EXISTS system_config (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
        );

        CREATE TABLE IF NOT EXISTS file_records (
            file_id INTEGER PRIMARY KEY AUTOINCREMENT,
            original_name TEXT NOT NULL,
            storage_path TEXT NOT NULL, -- raw bytes (BLOB) when the path is not UTF-8
            size_bytes INTEGER NOT NULL DEFAULT 0,
            checksum TEXT NOT NULL,
            kind TEXT NOT NULL CHECK (kind IN ('source', 'generated')),
            metadata TEXT NOT NULL DEFAULT '{}',
            producing_operation_id INTEGER REFERENCES operation_records(operation_id),
            status TEXT NOT NULL CHECK (status IN ('present', 'missing', 'evicted')),
            mtime_ns INTEGER NOT NULL DEFAULT 0,
            registered_at TEXT NOT NULL,
            last_verified_at TEXT NOT NULL,
            version INTEGER NOT NULL DEFAULT 1
        );

        -- At most one present record may claim a path.
        CREATE UNIQUE INDEX IF NOT EXISTS idx_file_records_present_path
            ON file_records(storage_path) WHERE status = 'present';
        CREATE INDEX IF NOT EXISTS idx_file_records_status
            ON file_records(status);

        CREATE TABLE IF NOT EXISTS operation_records (
            operation_id INTEGER PRIMARY KEY AUTOINCREMENT,
            operation_type TEXT NOT NULL,
            output_file_id INTEGER NOT NULL UNIQUE REFERENCES file_records(file_id),
            parameters TEXT NOT NULL DEFAULT '{}',
            started_at TEXT NOT NULL,
            succeeded INTEGER NOT NULL DEFAULT 1,
            invalidated INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS operation_inputs (
            operation_id INTEGER NOT NULL REFERENCES operation_records(operation_id),
            position INTEGER NOT NULL,
            file_id INTEGER NOT NULL REFERENCES file_records(file_id),
            PRIMARY KEY (operation_id, position)
        );
        CREATE INDEX IF NOT EXISTS idx_operation_inputs_file
            ON operation_inputs(file_id);
    "#)?;

    conn.execute(
        "INSERT OR IGNORE INTO system_config (key, value) VALUES (?1, ?2), (?3, ?4), (?5, '0')",
        rusqlite::params![
            KEY_FORMAT, REGISTRY_FORMAT,
            KEY_SCHEMA_VERSION, SCHEMA_VERSION.to_string(),
            KEY_REGISTRY_VERSION,
        ],
    )?;
    tracing::debug!("[Repository] Created registry tables");
    Ok(())
}

/// Check that an opened file is an intact registry snapshot this build understands.
pub fn validate(conn: &Connection) -> Result<()> {
    let check: String = conn.query_row("PRAGMA quick_check", [], |r| r.get(0))?;
    if check != "ok" {
        return Err(MediaError::StoreCorruption(format!("integrity check failed: {}", check)));
    }

    let has_config: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='system_config'",
        [],
        |r| r.get(0),
    )?;
    if has_config == 0 {
        return Err(MediaError::StoreCorruption("missing system_config table".into()));
    }

    let read = |key: &str| -> Result<Option<String>> {
        Ok(conn
            .query_row("SELECT value FROM system_config WHERE key = ?1", [key], |r| r.get(0))
            .optional()?)
    };

    match read(KEY_FORMAT)? {
        Some(format) if format == REGISTRY_FORMAT => {}
        other => {
            return Err(MediaError::StoreCorruption(format!("unexpected format tag {:?}", other)));
        }
    }

    let schema = read(KEY_SCHEMA_VERSION)?
        .and_then(|v| v.parse::<u32>().ok())
        .ok_or_else(|| MediaError::StoreCorruption("unreadable schema version".into()))?;
    if schema > SCHEMA_VERSION {
        return Err(MediaError::StoreCorruption(format!(
            "schema version {} is newer than supported {}", schema, SCHEMA_VERSION
        )));
    }

    if read(KEY_REGISTRY_VERSION)?.and_then(|v| v.parse::<u64>().ok()).is_none() {
        return Err(MediaError::StoreCorruption("unreadable registry version".into()));
    }
    Ok(())
}

/// Validate a file on disk without keeping it open.
pub fn validate_file(db_path: &Path) -> Result<()> {
    if !db_path.exists() {
        return Err(MediaError::NotFound(format!("registry file {}", db_path.display())));
    }
    let conn = Connection::open(db_path)?;
    validate(&conn)
}

pub fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Move a fully written temp file over `dest`.
pub fn install_file(tmp: &Path, dest: &Path) -> Result<()> {
    File::open(tmp)?.sync_all()?;
    fs::rename(tmp, dest)?;
    if let Some(parent) = dest.parent() {
        fsync_dir(parent).ok();
    }
    Ok(())
}

/// Copy the backup next to the primary and validate the copy. Nothing live
/// is touched, so an unusable backup leaves the current primary as it was.
pub fn stage_backup(backup: &Path, primary: &Path) -> Result<PathBuf> {
    validate_file(backup)?;

    let tmp = temp_path_for(primary);
    if tmp.exists() {
        let _ = fs::remove_file(&tmp);
    }
    fs::copy(backup, &tmp)?;
    if let Err(e) = validate_file(&tmp) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(tmp)
}

/// Move a staged copy over the primary.
pub fn install_staged(staged: &Path, primary: &Path) -> Result<()> {
    // Stale WAL frames belong to the corrupt primary and must not be replayed.
    for suffix in ["-wal", "-shm"] {
        let mut side = primary.as_os_str().to_os_string();
        side.push(suffix);
        match fs::remove_file(PathBuf::from(side)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    install_file(staged, primary)
}

/// Replace the primary registry with a copy of the backup.
pub fn restore_backup(backup: &Path, primary: &Path) -> Result<()> {
    let staged = stage_backup(backup, primary)?;
    install_staged(&staged, primary)
}

fn fsync_dir(dir: &Path) -> Result<()> {
    let file = File::open(dir)?;
    file.sync_all()?;
    Ok(())
}

// SQL pragma constants
const WAL: &str = "WAL";
const ON: &str = "ON";
const FULL: &str = "FULL";

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn fresh_registry_validates() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("registry.db");
        let conn = open_writer(&path)?;
        validate(&conn)?;
        drop(conn);
        validate_file(&path)?;
        Ok(())
    }

    #[test]
    fn garbage_file_is_store_corruption() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("registry.db");
        fs::write(&path, vec![0xAB_u8; 8192])?;
        match open_writer(&path) {
            Err(MediaError::StoreCorruption(_)) => Ok(()),
            other => panic!("expected StoreCorruption, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn foreign_sqlite_file_is_rejected() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("other.db");
        {
            let conn = Connection::open(&path)?;
            conn.execute_batch("CREATE TABLE notes (body TEXT);")?;
        }
        assert!(matches!(validate_file(&path), Err(MediaError::StoreCorruption(_))));
        Ok(())
    }

    #[test]
    fn temp_path_keeps_directory() {
        let tmp = temp_path_for(Path::new("/var/lib/mv/registry.db"));
        assert_eq!(tmp, PathBuf::from("/var/lib/mv/registry.db.tmp"));
    }
}
