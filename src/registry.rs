//! The Registry: the one handle collaborators hold.
//!
//! Wraps the store, scanner and runtime state. Reads are served from
//! consistent snapshots; registration is a single atomic batch; maintenance
//! passes (reconciliation, eviction) are serialized on the engine state.

use crate::config::{EngineConfig, EvictionPolicy};
use crate::error::{MediaError, Result};
use crate::incinerator::{EvictionReport, Incinerator};
use crate::reconciler::{cascade_missing, ReconciliationReport, Reconciler};
use crate::scanner::{checksum_file, is_managed_path, is_walkable, mtime_ns, Scanner};
use crate::state::{EngineState, SystemState};
use crate::storage::{
    FileId, FileKind, FileRecord, FileStatus, NewFileRecord, NewOperationRecord, OpenOutcome,
    OperationId, OperationRecord, RecordFilter, StatusCounts, Store,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

/// Provenance supplied with a generated file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationDraft {
    pub operation_type: String,
    pub input_file_ids: Vec<FileId>,
    #[serde(default = "empty_object")]
    pub parameters: serde_json::Value,
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default = "succeeded_by_default")]
    pub succeeded: bool,
}

fn succeeded_by_default() -> bool {
    true
}

fn empty_object() -> serde_json::Value {
    serde_json::json!({})
}

/// Both JSON columns are NOT NULL; an absent value is stored as `{}`.
fn or_empty(value: &serde_json::Value) -> serde_json::Value {
    if value.is_null() { empty_object() } else { value.clone() }
}

impl OperationDraft {
    pub fn new(operation_type: impl Into<String>, input_file_ids: Vec<FileId>) -> Self {
        Self {
            operation_type: operation_type.into(),
            input_file_ids,
            parameters: empty_object(),
            started_at: None,
            succeeded: true,
        }
    }

    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.parameters = parameters;
        self
    }
}

/// A file a collaborator has placed in a managed directory and wants tracked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub kind: FileKind,
    pub path: PathBuf,
    /// Defaults to the file name.
    pub original_name: Option<String>,
    #[serde(default = "empty_object")]
    pub metadata: serde_json::Value,
    /// When given, registration fails unless the bytes on disk match.
    pub expected_size: Option<u64>,
    pub expected_checksum: Option<String>,
    pub operation: Option<OperationDraft>,
}

impl RegisterRequest {
    pub fn source(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: FileKind::Source,
            path: path.into(),
            original_name: None,
            metadata: empty_object(),
            expected_size: None,
            expected_checksum: None,
            operation: None,
        }
    }

    pub fn generated(path: impl Into<PathBuf>, operation: OperationDraft) -> Self {
        Self {
            kind: FileKind::Generated,
            operation: Some(operation),
            ..Self::source(path)
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn expecting(mut self, size: u64, checksum: impl Into<String>) -> Self {
        self.expected_size = Some(size);
        self.expected_checksum = Some(checksum.into());
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    pub file_id: FileId,
    pub status: FileStatus,
    pub intact: bool,
    pub newly_missing: Vec<FileId>,
    pub invalidated_operations: Vec<OperationId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManagedDirHealth {
    pub path: PathBuf,
    pub accessible: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub state: SystemState,
    pub write_fenced: bool,
    pub uptime_secs: u64,
    pub registry_version: Option<u64>,
    pub integrity_error: Option<String>,
    pub counts: Option<StatusCounts>,
    pub last_reconciled_at: Option<DateTime<Utc>>,
    pub primary_path: PathBuf,
    pub backup_path: PathBuf,
    pub backup_present: bool,
    pub managed_dirs: Vec<ManagedDirHealth>,
}

pub struct Registry {
    config: EngineConfig,
    store: Store,
    scanner: Scanner,
    state: EngineState,
}

impl Registry {
    /// Open (or create) the registry described by `config`.
    ///
    /// A primary that had to be restored from backup comes up write-fenced
    /// and is reconciled immediately; the fence lifts once a pass commits.
    pub fn open(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let (store, outcome) = Store::open(&config.registry_path, &config.backup_path())?;
        let scanner = Scanner::new(config.scan_cache_capacity, config.always_rehash);
        let registry = Self { config, store, scanner, state: EngineState::new() };

        if outcome == OpenOutcome::RestoredFromBackup {
            registry.state.fence_writes();
            // Reads are served either way; writes stay fenced until a pass
            // commits (the Librarian or the next request retries).
            if let Err(e) = registry.request_reconciliation() {
                tracing::error!("[Registry] Reconciliation after restore failed, writes stay fenced: {}", e);
            }
        } else if registry.config.reconcile_on_startup {
            if let Err(e) = registry.request_reconciliation() {
                tracing::error!("[Registry] Startup reconciliation failed: {}", e);
            }
        }

        registry.state.set_system_state(SystemState::Idle);
        tracing::info!("[Registry] Open at version {} ({} managed dirs)",
            registry.store.registry_version()?, registry.config.managed_dirs.len());
        Ok(registry)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    // ---- queries ---------------------------------------------------------

    pub fn resolve(&self, id: FileId) -> Result<FileRecord> {
        self.guard(self.store.read(|repo| repo.get_file(id)))?
            .ok_or_else(|| MediaError::NotFound(id.to_string()))
    }

    pub fn list(&self, filter: &RecordFilter) -> Result<Vec<FileRecord>> {
        self.guard(self.store.read(|repo| repo.list_files(filter)))
    }

    /// All records matching `predicate`, from one consistent snapshot.
    pub fn search(&self, predicate: impl Fn(&FileRecord) -> bool) -> Result<Vec<FileRecord>> {
        let records = self.list(&RecordFilter::all())?;
        Ok(records.into_iter().filter(|r| predicate(r)).collect())
    }

    pub fn operation(&self, id: OperationId) -> Result<OperationRecord> {
        self.guard(self.store.read(|repo| repo.get_operation(id)))?
            .ok_or_else(|| MediaError::NotFound(id.to_string()))
    }

    pub fn operations(&self) -> Result<Vec<OperationRecord>> {
        self.guard(self.store.read(|repo| repo.list_operations()))
    }

    /// Every operation in the ancestry of `id`: its producing operation
    /// first, then ancestors depth-first in declared input order. Each
    /// operation appears once. A source file has no history.
    pub fn history(&self, id: FileId) -> Result<Vec<OperationRecord>> {
        self.guard(self.store.read(|repo| {
            if repo.get_file(id)?.is_none() {
                return Err(MediaError::NotFound(id.to_string()));
            }

            let mut ordered = Vec::new();
            let mut seen: HashSet<OperationId> = HashSet::new();
            let mut stack = vec![id];
            while let Some(file) = stack.pop() {
                let Some(op_id) = repo.operation_for_output(file)? else { continue };
                if !seen.insert(op_id) {
                    continue;
                }
                let op = repo
                    .get_operation(op_id)?
                    .ok_or_else(|| MediaError::StoreCorruption(format!("{} vanished", op_id)))?;
                stack.extend(op.input_file_ids.iter().rev().copied());
                ordered.push(op);
            }
            Ok(ordered)
        }))
    }

    // ---- registration ----------------------------------------------------

    pub fn register(&self, request: RegisterRequest) -> Result<FileRecord> {
        self.state.ensure_writable()?;

        let path = &request.path;
        if !path.is_absolute() {
            return Err(MediaError::InvalidPath(format!("{} is not absolute", path.display())));
        }
        if !is_managed_path(&self.config.managed_dirs, path) {
            return Err(MediaError::InvalidPath(format!(
                "{} is not inside a managed directory (or is ignored there)", path.display()
            )));
        }
        if !is_walkable(&self.config.managed_dirs, path) {
            return Err(MediaError::InvalidPath(format!(
                "{} is reached through a symlinked directory", path.display()
            )));
        }
        match (&request.kind, &request.operation) {
            (FileKind::Generated, None) => {
                return Err(MediaError::InvalidRequest("a generated file needs a producing operation".into()));
            }
            (FileKind::Source, Some(_)) => {
                return Err(MediaError::InvalidRequest("a source file cannot have a producing operation".into()));
            }
            _ => {}
        }

        let fp = match self.scanner.fingerprint(path) {
            Ok(fp) => fp,
            Err(MediaError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(MediaError::InvalidPath(format!("{} does not exist", path.display())));
            }
            Err(e) => return Err(e),
        };
        if let Some(expected) = &request.expected_checksum {
            if *expected != fp.checksum {
                return Err(MediaError::ChecksumMismatch {
                    path: path.clone(),
                    expected: expected.clone(),
                    actual: fp.checksum,
                });
            }
        }
        if let Some(expected) = request.expected_size {
            if expected != fp.size {
                return Err(MediaError::ChecksumMismatch {
                    path: path.clone(),
                    expected: format!("{} bytes", expected),
                    actual: format!("{} bytes", fp.size),
                });
            }
        }

        let now = Utc::now();
        let original_name = request
            .original_name
            .clone()
            .unwrap_or_else(|| fp.display_name());

        let record = self.guard(self.store.write(|repo| {
            if let Some(existing) = repo.present_file_at(path)? {
                return Err(MediaError::Conflict(format!(
                    "{} is already registered as {}", path.display(), existing.id
                )));
            }

            // Inputs must exist. A missing input still lets the output be
            // recorded, but as missing and with its operation invalidated.
            let mut inputs_missing = false;
            if let Some(draft) = &request.operation {
                if draft.input_file_ids.is_empty() {
                    return Err(MediaError::InvalidRequest("an operation needs at least one input".into()));
                }
                for input in &draft.input_file_ids {
                    let record = repo
                        .get_file(*input)?
                        .ok_or_else(|| MediaError::NotFound(format!("input {}", input)))?;
                    inputs_missing |= record.status == FileStatus::Missing;
                }
            }

            let id = repo.insert_file(&NewFileRecord {
                original_name: original_name.clone(),
                storage_path: path.clone(),
                size_bytes: fp.size,
                checksum: fp.checksum.clone(),
                kind: request.kind,
                metadata: or_empty(&request.metadata),
                status: if inputs_missing { FileStatus::Missing } else { FileStatus::Present },
                mtime_ns: fp.mtime_ns,
                registered_at: now,
            })?;

            if let Some(draft) = &request.operation {
                let op_id = repo.append_operation(&NewOperationRecord {
                    operation_type: draft.operation_type.clone(),
                    input_file_ids: draft.input_file_ids.clone(),
                    output_file_id: id,
                    parameters: or_empty(&draft.parameters),
                    started_at: draft.started_at.unwrap_or(now),
                    succeeded: draft.succeeded,
                    invalidated: inputs_missing,
                })?;
                repo.set_producing_operation(id, op_id)?;
                if inputs_missing {
                    tracing::warn!("[Registry] {} registered with missing inputs; {} invalidated", id, op_id);
                }
            }

            repo.get_file(id)?.ok_or_else(|| MediaError::NotFound(id.to_string()))
        }))?;

        tracing::info!("[Registry] Registered {}", record);
        Ok(record)
    }

    /// Re-hash one record now. A record whose bytes no longer match is marked
    /// missing and the loss is cascaded through its dependents.
    pub fn verify(&self, id: FileId) -> Result<VerifyReport> {
        let record = self.resolve(id)?;
        let mut report = VerifyReport {
            file_id: id,
            status: record.status,
            intact: false,
            newly_missing: Vec::new(),
            invalidated_operations: Vec::new(),
        };
        if record.status == FileStatus::Evicted {
            return Ok(report);
        }

        // A symlink now standing at the path is not the registered file.
        let observed = fs::symlink_metadata(&record.storage_path).and_then(|meta| {
            if !meta.is_file() {
                return Ok((0, 0, String::new()));
            }
            Ok((meta.len(), mtime_ns(&meta), checksum_file(&record.storage_path)?))
        });
        let (size, mtime, checksum) = match observed {
            Ok(found) => found,
            Err(e) if matches!(e.kind(), std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied) => {
                (0, 0, String::new())
            }
            Err(e) => return Err(e.into()),
        };
        report.intact = size == record.size_bytes && checksum == record.checksum;

        if report.intact && record.status == FileStatus::Missing {
            // Coming back is reconciliation's call: it checks the inputs too.
            return Ok(report);
        }

        self.state.ensure_writable()?;
        let now = Utc::now();
        self.guard(self.store.write(|repo| {
            let mut current = repo.get_file(id)?.ok_or_else(|| MediaError::NotFound(id.to_string()))?;
            if current.version != record.version {
                return Err(MediaError::Conflict(format!("{} changed while it was being verified", id)));
            }
            if report.intact {
                current.mtime_ns = mtime;
                current.last_verified_at = now;
                repo.put_file(&current)?;
            } else {
                let (missing, invalidated) = cascade_missing(repo, id, now)?;
                report.newly_missing = missing;
                report.invalidated_operations = invalidated;
            }
            Ok(())
        }))?;

        if !report.intact {
            report.status = FileStatus::Missing;
            tracing::warn!("[Registry] {} failed verification; {} records now missing",
                id, report.newly_missing.len());
        }
        Ok(report)
    }

    // ---- maintenance -----------------------------------------------------

    pub fn request_reconciliation(&self) -> Result<ReconciliationReport> {
        self.request_reconciliation_with(&CancellationToken::new())
    }

    pub fn request_reconciliation_with(&self, cancel: &CancellationToken) -> Result<ReconciliationReport> {
        let _maintenance = self.state.begin_maintenance(SystemState::Reconciling)?;

        if self.state.is_write_fenced() {
            if let Err(e) = self.store.check_integrity() {
                tracing::error!("[Registry] Primary failed integrity check: {}", e);
                self.store.restore_from_backup()?;
            }
        }

        let report = self.guard(Reconciler::new(&self.store, &self.scanner, &self.config).run(cancel))?;
        self.state.lift_fence();
        Ok(report)
    }

    /// Evict with the configured policy.
    pub fn run_eviction(&self) -> Result<EvictionReport> {
        self.run_eviction_with(&self.config.eviction, &CancellationToken::new())
    }

    pub fn run_eviction_with(&self, policy: &EvictionPolicy, cancel: &CancellationToken) -> Result<EvictionReport> {
        self.state.ensure_writable()?;
        let _maintenance = self.state.begin_maintenance(SystemState::Evicting)?;
        self.guard(Incinerator::new(&self.store, self.config.retry).run(policy, cancel))
    }

    pub fn health_check(&self) -> Result<HealthReport> {
        let integrity_error = self.store.check_integrity().err().map(|e| e.to_string());
        let view = self.store.read(|repo| {
            Ok((repo.registry_version()?, repo.status_counts()?, repo.last_reconciled_at()?))
        });
        let (registry_version, counts, last_reconciled_at) = match view {
            Ok((v, c, l)) => (Some(v), Some(c), l),
            Err(_) => (None, None, None),
        };

        let managed_dirs: Vec<ManagedDirHealth> = self
            .config
            .managed_dirs
            .iter()
            .map(|dir| ManagedDirHealth { path: dir.clone(), accessible: fs::read_dir(dir).is_ok() })
            .collect();

        let write_fenced = self.state.is_write_fenced();
        let healthy = integrity_error.is_none()
            && registry_version.is_some()
            && !write_fenced
            && managed_dirs.iter().all(|d| d.accessible);

        Ok(HealthReport {
            healthy,
            state: self.state.system_state(),
            write_fenced,
            uptime_secs: self.state.start_time.elapsed().map(|d| d.as_secs()).unwrap_or(0),
            registry_version,
            integrity_error,
            counts,
            last_reconciled_at,
            primary_path: self.store.primary_path().to_path_buf(),
            backup_path: self.store.backup_path().to_path_buf(),
            backup_present: self.store.backup_path().exists(),
            managed_dirs,
        })
    }

    /// Fence writes as soon as any path reports the store corrupt.
    fn guard<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(MediaError::StoreCorruption(_)) = &result {
            self.state.fence_writes();
        }
        result
    }
}
