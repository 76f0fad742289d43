pub mod connection;
pub mod repository;
pub mod store;

// Common exports
pub use repository::{Repository, StatusCounts};
pub use store::{OpenOutcome, Snapshot, Store};

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Opaque identifier of a registered artifact. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(pub u64);

/// Identifier of a provenance step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(pub u64);

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "f-{}", self.0)
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op-{}", self.0)
    }
}

impl FromStr for FileId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim_start_matches("f-").parse().map(FileId)
    }
}

impl FromStr for OperationId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim_start_matches("op-").parse().map(OperationId)
    }
}

macro_rules! sql_id {
    ($ty:ident) => {
        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                self.0.to_sql()
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                u64::column_result(value).map($ty)
            }
        }
    };
}

sql_id!(FileId);
sql_id!(OperationId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Source,
    Generated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Present,
    Missing,
    Evicted,
}

impl FileKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileKind::Source => "source",
            FileKind::Generated => "generated",
        }
    }
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Present => "present",
            FileStatus::Missing => "missing",
            FileStatus::Evicted => "evicted",
        }
    }

    /// Evicted records are terminal and no longer take part in reconciliation.
    pub fn is_tracked(&self) -> bool {
        !matches!(self, FileStatus::Evicted)
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql for FileKind {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for FileKind {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            "source" => Ok(FileKind::Source),
            "generated" => Ok(FileKind::Generated),
            other => Err(FromSqlError::Other(format!("unknown file kind '{}'", other).into())),
        }
    }
}

impl ToSql for FileStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for FileStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            "present" => Ok(FileStatus::Present),
            "missing" => Ok(FileStatus::Missing),
            "evicted" => Ok(FileStatus::Evicted),
            other => Err(FromSqlError::Other(format!("unknown file status '{}'", other).into())),
        }
    }
}

/// Record representing one registered artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: FileId,
    pub original_name: String,
    pub storage_path: PathBuf,
    pub size_bytes: u64,
    pub checksum: String,
    pub kind: FileKind,
    pub metadata: serde_json::Value,
    pub producing_operation_id: Option<OperationId>,
    pub status: FileStatus,
    pub registered_at: DateTime<Utc>,
    pub last_verified_at: DateTime<Utc>,
    /// Modification time (unix nanoseconds) observed at the last verification.
    pub mtime_ns: i64,
    pub version: u64,
}

impl FileRecord {
    pub fn file_name(&self) -> Option<&str> {
        self.storage_path.file_name().and_then(|n| n.to_str())
    }
}

impl fmt::Display for FileRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({}, {}, size: {})",
            self.id, self.storage_path.display(), self.kind, self.status, self.size_bytes)
    }
}

/// A file record that has not been assigned an id yet.
#[derive(Debug, Clone)]
pub struct NewFileRecord {
    pub original_name: String,
    pub storage_path: PathBuf,
    pub size_bytes: u64,
    pub checksum: String,
    pub kind: FileKind,
    pub metadata: serde_json::Value,
    pub status: FileStatus,
    pub mtime_ns: i64,
    pub registered_at: DateTime<Utc>,
}

/// Provenance of one derived file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub id: OperationId,
    pub operation_type: String,
    /// Inputs in the order they were declared at registration.
    pub input_file_ids: Vec<FileId>,
    pub output_file_id: FileId,
    pub parameters: serde_json::Value,
    pub started_at: DateTime<Utc>,
    pub succeeded: bool,
    pub invalidated: bool,
}

impl fmt::Display for OperationRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} -> {}", self.id, self.operation_type, self.output_file_id)?;
        if self.invalidated {
            f.write_str(" (invalidated)")?;
        }
        Ok(())
    }
}

/// An operation about to be appended for an output record.
#[derive(Debug, Clone)]
pub struct NewOperationRecord {
    pub operation_type: String,
    pub input_file_ids: Vec<FileId>,
    pub output_file_id: FileId,
    pub parameters: serde_json::Value,
    pub started_at: DateTime<Utc>,
    pub succeeded: bool,
    pub invalidated: bool,
}

/// Filter for snapshot listings. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub statuses: BTreeSet<FileStatus>,
    pub kind: Option<FileKind>,
    pub path_prefix: Option<PathBuf>,
}

impl RecordFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_status(statuses: &[FileStatus]) -> Self {
        Self {
            statuses: statuses.iter().copied().collect(),
            ..Self::default()
        }
    }

    /// Present and missing records, i.e. everything reconciliation looks at.
    pub fn tracked() -> Self {
        Self::with_status(&[FileStatus::Present, FileStatus::Missing])
    }

    pub fn kind(mut self, kind: FileKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn under(mut self, prefix: impl AsRef<Path>) -> Self {
        self.path_prefix = Some(prefix.as_ref().to_path_buf());
        self
    }

    pub fn matches(&self, record: &FileRecord) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&record.status))
            && self.kind.map_or(true, |k| k == record.kind)
            && self
                .path_prefix
                .as_ref()
                .map_or(true, |p| record.storage_path.starts_with(p))
    }
}

/// Binds a path exactly: UTF-8 paths as TEXT, anything else as the raw
/// OS bytes in a BLOB. The same path always binds to the same value, so
/// equality lookups and the per-path unique index keep working.
pub(crate) struct SqlPath<'a>(pub &'a Path);

impl ToSql for SqlPath<'_> {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        match (self.0.to_str(), raw_path_bytes(self.0)) {
            (Some(text), _) => Ok(ToSqlOutput::from(text)),
            (None, Some(bytes)) => Ok(ToSqlOutput::Borrowed(ValueRef::Blob(bytes))),
            (None, None) => Ok(ToSqlOutput::from(self.0.to_string_lossy().into_owned())),
        }
    }
}

/// Column reader matching `SqlPath`.
pub(crate) struct StoredPath(pub PathBuf);

impl FromSql for StoredPath {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value {
            ValueRef::Text(_) => value.as_str().map(|s| StoredPath(PathBuf::from(s))),
            ValueRef::Blob(bytes) => path_from_raw_bytes(bytes).map(StoredPath).ok_or(FromSqlError::InvalidType),
            _ => Err(FromSqlError::InvalidType),
        }
    }
}

#[cfg(unix)]
fn raw_path_bytes(path: &Path) -> Option<&[u8]> {
    use std::os::unix::ffi::OsStrExt;
    Some(path.as_os_str().as_bytes())
}

#[cfg(not(unix))]
fn raw_path_bytes(_path: &Path) -> Option<&[u8]> {
    None
}

#[cfg(unix)]
fn path_from_raw_bytes(bytes: &[u8]) -> Option<PathBuf> {
    use std::os::unix::ffi::OsStrExt;
    Some(PathBuf::from(std::ffi::OsStr::from_bytes(bytes)))
}

#[cfg(not(unix))]
fn path_from_raw_bytes(_bytes: &[u8]) -> Option<PathBuf> {
    None
}
