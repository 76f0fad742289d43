// FILE: src/storage/repository.rs
use std::collections::HashMap;
use std::path::Path;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;
use crate::error::{Result, MediaError};
use crate::storage::connection::{KEY_LAST_RECONCILED_AT, KEY_REGISTRY_VERSION};
use crate::storage::{
    FileId, FileRecord, FileStatus, NewFileRecord, NewOperationRecord, OperationId,
    OperationRecord, RecordFilter, SqlPath, StoredPath,
};

const FILE_COLUMNS: &str = "file_id, original_name, storage_path, size_bytes, checksum, kind, \
    metadata, producing_operation_id, status, mtime_ns, registered_at, last_verified_at, version";

const OPERATION_COLUMNS: &str =
    "operation_id, operation_type, output_file_id, parameters, started_at, succeeded, invalidated";

/// SQL access to the registry tables.
///
/// Works on a plain connection for reads and on a `Transaction` (which derefs
/// to `Connection`) for batched writes.
pub struct Repository<'a> {
    conn: &'a Connection,
}

/// Per-status totals used by the health report.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StatusCounts {
    pub present: u64,
    pub missing: u64,
    pub evicted: u64,
    pub present_bytes: u64,
    pub operations: u64,
    pub invalidated_operations: u64,
}

impl<'a> Repository<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    // ---- file records -------------------------------------------------

    pub fn get_file(&self, id: FileId) -> Result<Option<FileRecord>> {
        let sql = format!("SELECT {} FROM file_records WHERE file_id = ?1", FILE_COLUMNS);
        Ok(self.conn.query_row(&sql, params![id], file_from_row).optional()?)
    }

    /// The present record currently claiming `path`, if any.
    pub fn present_file_at(&self, path: &Path) -> Result<Option<FileRecord>> {
        let sql = format!(
            "SELECT {} FROM file_records WHERE storage_path = ?1 AND status = 'present'",
            FILE_COLUMNS
        );
        Ok(self.conn.query_row(&sql, params![SqlPath(path)], file_from_row).optional()?)
    }

    pub fn list_files(&self, filter: &RecordFilter) -> Result<Vec<FileRecord>> {
        let sql = format!("SELECT {} FROM file_records ORDER BY file_id", FILE_COLUMNS);
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], file_from_row)?;

        let mut records = Vec::new();
        for r in rows {
            let record = r?;
            if filter.matches(&record) {
                records.push(record);
            }
        }
        Ok(records)
    }

    pub fn insert_file(&self, record: &NewFileRecord) -> Result<FileId> {
        let mut stmt = self.conn.prepare(
            "INSERT INTO file_records (original_name, storage_path, size_bytes, checksum, kind,
                 metadata, status, mtime_ns, registered_at, last_verified_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
             RETURNING file_id"
        )?;
        let result = stmt.query_row(
            params![
                record.original_name,
                SqlPath(&record.storage_path),
                record.size_bytes,
                record.checksum,
                record.kind,
                record.metadata,
                record.status,
                record.mtime_ns,
                record.registered_at,
            ],
            |row| row.get::<_, FileId>(0),
        );
        match result {
            Ok(id) => Ok(id),
            Err(e) if is_unique_violation(&e) => Err(MediaError::Conflict(format!(
                "{} is already registered to a present record",
                record.storage_path.display()
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Optimistic update: succeeds only if the stored version still equals
    /// `record.version`. Returns the new version.
    pub fn put_file(&self, record: &FileRecord) -> Result<u64> {
        let result = self.conn.execute(
            "UPDATE file_records
             SET original_name = ?1, storage_path = ?2, size_bytes = ?3, checksum = ?4,
                 metadata = ?5, status = ?6, mtime_ns = ?7, last_verified_at = ?8,
                 version = version + 1
             WHERE file_id = ?9 AND version = ?10",
            params![
                record.original_name,
                SqlPath(&record.storage_path),
                record.size_bytes,
                record.checksum,
                record.metadata,
                record.status,
                record.mtime_ns,
                record.last_verified_at,
                record.id,
                record.version,
            ],
        );

        let rows = match result {
            Ok(rows) => rows,
            Err(e) if is_unique_violation(&e) => {
                return Err(MediaError::Conflict(format!(
                    "{} is already claimed by another present record",
                    record.storage_path.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };

        if rows == 0 {
            return match self.file_version(record.id)? {
                Some(found) => Err(MediaError::Conflict(format!(
                    "{} was modified concurrently (expected version {}, found {})",
                    record.id, record.version, found
                ))),
                None => Err(MediaError::NotFound(record.id.to_string())),
            };
        }
        Ok(record.version + 1)
    }

    pub fn file_version(&self, id: FileId) -> Result<Option<u64>> {
        Ok(self.conn
            .query_row("SELECT version FROM file_records WHERE file_id = ?1", params![id], |r| r.get(0))
            .optional()?)
    }

    pub fn set_producing_operation(&self, file: FileId, op: OperationId) -> Result<()> {
        self.conn.execute(
            "UPDATE file_records SET producing_operation_id = ?1 WHERE file_id = ?2",
            params![op, file],
        )?;
        Ok(())
    }

    /// Mark records evicted in one statement. Returns the ids actually changed.
    pub fn mark_evicted(&self, ids: &[FileId], at: DateTime<Utc>) -> Result<Vec<FileId>> {
        let mut stmt = self.conn.prepare(
            "UPDATE file_records
             SET status = 'evicted', last_verified_at = ?1, version = version + 1
             WHERE file_id = ?2 AND status != 'evicted'"
        )?;
        let mut changed = Vec::new();
        for id in ids {
            if stmt.execute(params![at, id])? > 0 {
                changed.push(*id);
            }
        }
        Ok(changed)
    }

    pub fn status_counts(&self) -> Result<StatusCounts> {
        let mut counts = StatusCounts::default();
        let mut stmt = self.conn.prepare(
            "SELECT status, COUNT(*), COALESCE(SUM(size_bytes), 0) FROM file_records GROUP BY status"
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, FileStatus>(0)?, row.get::<_, u64>(1)?, row.get::<_, u64>(2)?))
        })?;
        for r in rows {
            let (status, count, bytes) = r?;
            match status {
                FileStatus::Present => {
                    counts.present = count;
                    counts.present_bytes = bytes;
                }
                FileStatus::Missing => counts.missing = count,
                FileStatus::Evicted => counts.evicted = count,
            }
        }

        let (ops, invalidated): (u64, u64) = self.conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(invalidated), 0) FROM operation_records",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        counts.operations = ops;
        counts.invalidated_operations = invalidated;
        Ok(counts)
    }

    // ---- operation records --------------------------------------------

    /// Append-only: an output can have exactly one producing operation.
    pub fn append_operation(&self, op: &NewOperationRecord) -> Result<OperationId> {
        if let Some(existing) = self.operation_for_output(op.output_file_id)? {
            return Err(MediaError::Conflict(format!(
                "{} already has producing operation {}",
                op.output_file_id, existing
            )));
        }

        let op_id: OperationId = self.conn.query_row(
            "INSERT INTO operation_records
                 (operation_type, output_file_id, parameters, started_at, succeeded, invalidated)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             RETURNING operation_id",
            params![
                op.operation_type,
                op.output_file_id,
                op.parameters,
                op.started_at,
                op.succeeded,
                op.invalidated,
            ],
            |row| row.get(0),
        )?;

        let mut stmt = self.conn.prepare(
            "INSERT INTO operation_inputs (operation_id, position, file_id) VALUES (?1, ?2, ?3)"
        )?;
        for (position, input) in op.input_file_ids.iter().enumerate() {
            stmt.execute(params![op_id, position as i64, input])?;
        }
        Ok(op_id)
    }

    pub fn operation_for_output(&self, output: FileId) -> Result<Option<OperationId>> {
        Ok(self.conn
            .query_row(
                "SELECT operation_id FROM operation_records WHERE output_file_id = ?1",
                params![output],
                |r| r.get(0),
            )
            .optional()?)
    }

    pub fn get_operation(&self, id: OperationId) -> Result<Option<OperationRecord>> {
        let sql = format!("SELECT {} FROM operation_records WHERE operation_id = ?1", OPERATION_COLUMNS);
        let Some(mut op) = self.conn.query_row(&sql, params![id], operation_from_row).optional()? else {
            return Ok(None);
        };

        let mut stmt = self.conn.prepare(
            "SELECT file_id FROM operation_inputs WHERE operation_id = ?1 ORDER BY position"
        )?;
        let rows = stmt.query_map(params![id], |r| r.get::<_, FileId>(0))?;
        for r in rows {
            op.input_file_ids.push(r?);
        }
        Ok(Some(op))
    }

    pub fn list_operations(&self) -> Result<Vec<OperationRecord>> {
        let sql = format!("SELECT {} FROM operation_records ORDER BY operation_id", OPERATION_COLUMNS);
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], operation_from_row)?;
        let mut ops = Vec::new();
        for r in rows {
            ops.push(r?);
        }

        let mut inputs: HashMap<OperationId, Vec<FileId>> = HashMap::new();
        let mut stmt = self.conn.prepare(
            "SELECT operation_id, file_id FROM operation_inputs ORDER BY operation_id, position"
        )?;
        let rows = stmt.query_map([], |r| Ok((r.get::<_, OperationId>(0)?, r.get::<_, FileId>(1)?)))?;
        for r in rows {
            let (op, file) = r?;
            inputs.entry(op).or_default().push(file);
        }

        for op in &mut ops {
            op.input_file_ids = inputs.remove(&op.id).unwrap_or_default();
        }
        Ok(ops)
    }

    /// Operations that list `file` among their inputs.
    pub fn operations_consuming(&self, file: FileId) -> Result<Vec<OperationId>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT operation_id FROM operation_inputs WHERE file_id = ?1 ORDER BY operation_id"
        )?;
        let rows = stmt.query_map(params![file], |r| r.get(0))?;
        let mut ops = Vec::new();
        for r in rows {
            ops.push(r?);
        }
        Ok(ops)
    }

    /// One-way flip. Returns false if the operation was already invalidated.
    pub fn invalidate_operation(&self, id: OperationId) -> Result<bool> {
        let rows = self.conn.execute(
            "UPDATE operation_records SET invalidated = 1 WHERE operation_id = ?1 AND invalidated = 0",
            params![id],
        )?;
        Ok(rows > 0)
    }

    // ---- system config --------------------------------------------------

    pub fn get_config(&self, key: &str) -> Result<Option<String>> {
        Ok(self.conn
            .query_row("SELECT value FROM system_config WHERE key = ?1", params![key], |r| r.get(0))
            .optional()?)
    }

    pub fn set_config(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO system_config (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn registry_version(&self) -> Result<u64> {
        let raw = self.get_config(KEY_REGISTRY_VERSION)?
            .ok_or_else(|| MediaError::StoreCorruption("registry version missing".into()))?;
        raw.parse()
            .map_err(|_| MediaError::StoreCorruption(format!("unreadable registry version '{}'", raw)))
    }

    /// Bump the registry-wide counter. Call once per committed write batch.
    pub fn bump_registry_version(&self) -> Result<u64> {
        let next = self.registry_version()? + 1;
        self.set_config(KEY_REGISTRY_VERSION, &next.to_string())?;
        Ok(next)
    }

    pub fn last_reconciled_at(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.get_config(KEY_LAST_RECONCILED_AT)?
            .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
            .map(|t| t.with_timezone(&Utc)))
    }

    pub fn set_last_reconciled_at(&self, at: DateTime<Utc>) -> Result<()> {
        self.set_config(KEY_LAST_RECONCILED_AT, &at.to_rfc3339())
    }
}

fn file_from_row(row: &Row<'_>) -> rusqlite::Result<FileRecord> {
    Ok(FileRecord {
        id: row.get(0)?,
        original_name: row.get(1)?,
        storage_path: row.get::<_, StoredPath>(2)?.0,
        size_bytes: row.get(3)?,
        checksum: row.get(4)?,
        kind: row.get(5)?,
        metadata: row.get(6)?,
        producing_operation_id: row.get(7)?,
        status: row.get(8)?,
        mtime_ns: row.get(9)?,
        registered_at: row.get(10)?,
        last_verified_at: row.get(11)?,
        version: row.get(12)?,
    })
}

fn operation_from_row(row: &Row<'_>) -> rusqlite::Result<OperationRecord> {
    Ok(OperationRecord {
        id: row.get(0)?,
        operation_type: row.get(1)?,
        input_file_ids: Vec::new(),
        output_file_id: row.get(2)?,
        parameters: row.get(3)?,
        started_at: row.get(4)?,
        succeeded: row.get(5)?,
        invalidated: row.get(6)?,
    })
}

/// Only the one-present-record-per-path index is an identity conflict.
/// NOT NULL, CHECK and foreign key failures stay database errors.
fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(err, rusqlite::Error::SqliteFailure(e, _)
        if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::connection::create_tables;
    use crate::storage::FileKind;

    fn memory_repo() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        create_tables(&conn).unwrap();
        conn
    }

    fn draft(path: &str, status: FileStatus) -> NewFileRecord {
        NewFileRecord {
            original_name: path.rsplit('/').next().unwrap().to_string(),
            storage_path: path.into(),
            size_bytes: 10,
            checksum: "sha256:00".into(),
            kind: FileKind::Source,
            metadata: serde_json::json!({"format": "mp4"}),
            status,
            mtime_ns: 1,
            registered_at: Utc::now(),
        }
    }

    #[test]
    fn ids_are_never_reused() {
        let conn = memory_repo();
        let repo = Repository::new(&conn);
        let a = repo.insert_file(&draft("/m/a.mp4", FileStatus::Present)).unwrap();
        let b = repo.insert_file(&draft("/m/b.mp4", FileStatus::Present)).unwrap();
        assert!(b > a);
        let fetched = repo.get_file(a).unwrap().unwrap();
        assert_eq!(fetched.metadata["format"], "mp4");
        assert_eq!(fetched.version, 1);
    }

    #[test]
    fn only_one_present_record_per_path() {
        let conn = memory_repo();
        let repo = Repository::new(&conn);
        repo.insert_file(&draft("/m/a.mp4", FileStatus::Missing)).unwrap();
        repo.insert_file(&draft("/m/a.mp4", FileStatus::Present)).unwrap();
        let err = repo.insert_file(&draft("/m/a.mp4", FileStatus::Present)).unwrap_err();
        assert!(matches!(err, MediaError::Conflict(_)));
    }

    #[test]
    fn not_null_failure_is_not_a_path_conflict() {
        let conn = memory_repo();
        let repo = Repository::new(&conn);
        let mut record = draft("/m/a.mp4", FileStatus::Present);
        record.metadata = serde_json::Value::Null;
        let err = repo.insert_file(&record).unwrap_err();
        assert!(matches!(err, MediaError::Database(_)), "got {:?}", err);
    }

    #[cfg(unix)]
    #[test]
    fn non_utf8_paths_round_trip_exactly() {
        use std::os::unix::ffi::OsStrExt;
        let conn = memory_repo();
        let repo = Repository::new(&conn);
        let path = std::path::PathBuf::from(std::ffi::OsStr::from_bytes(b"/m/clip\xff.mp4"));

        let mut record = draft("/m/placeholder.mp4", FileStatus::Present);
        record.storage_path = path.clone();
        let id = repo.insert_file(&record).unwrap();

        assert_eq!(repo.get_file(id).unwrap().unwrap().storage_path, path);
        assert_eq!(repo.present_file_at(&path).unwrap().unwrap().id, id);
        assert!(matches!(repo.insert_file(&record), Err(MediaError::Conflict(_))));
    }

    #[test]
    fn stale_put_is_rejected() {
        let conn = memory_repo();
        let repo = Repository::new(&conn);
        let id = repo.insert_file(&draft("/m/a.mp4", FileStatus::Present)).unwrap();
        let mut record = repo.get_file(id).unwrap().unwrap();
        let stale = record.clone();

        record.status = FileStatus::Missing;
        assert_eq!(repo.put_file(&record).unwrap(), 2);

        let err = repo.put_file(&stale).unwrap_err();
        assert!(matches!(err, MediaError::Conflict(_)));
    }

    #[test]
    fn operation_inputs_keep_declared_order() {
        let conn = memory_repo();
        let repo = Repository::new(&conn);
        let a = repo.insert_file(&draft("/m/a.mp4", FileStatus::Present)).unwrap();
        let b = repo.insert_file(&draft("/m/b.mp4", FileStatus::Present)).unwrap();
        let out = repo.insert_file(&draft("/m/out.mp4", FileStatus::Present)).unwrap();

        let new_op = NewOperationRecord {
            operation_type: "concatenate".into(),
            input_file_ids: vec![b, a],
            output_file_id: out,
            parameters: serde_json::json!({}),
            started_at: Utc::now(),
            succeeded: true,
            invalidated: false,
        };
        let op = repo.append_operation(&new_op).unwrap();
        assert_eq!(repo.get_operation(op).unwrap().unwrap().input_file_ids, vec![b, a]);
        assert_eq!(repo.list_operations().unwrap()[0].input_file_ids, vec![b, a]);
        assert_eq!(repo.operations_consuming(a).unwrap(), vec![op]);

        let err = repo.append_operation(&new_op).unwrap_err();
        assert!(matches!(err, MediaError::Conflict(_)));
    }

    #[test]
    fn registry_version_is_monotonic() {
        let conn = memory_repo();
        let repo = Repository::new(&conn);
        assert_eq!(repo.registry_version().unwrap(), 0);
        assert_eq!(repo.bump_registry_version().unwrap(), 1);
        assert_eq!(repo.bump_registry_version().unwrap(), 2);
    }
}
