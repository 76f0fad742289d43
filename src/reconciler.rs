//! The Reconciler: compares what the registry believes with what is on disk.
//!
//! A pass is snapshot -> scan -> plan -> commit. Everything expensive
//! (hashing, orphan matching) happens before the commit, and the commit is a
//! single store batch, so a pass that fails or is cancelled before the commit
//! leaves the registry exactly as it was.
//!
//! Records are visited in ascending id order. Inputs are always registered
//! before their outputs, so that order is a topological order of the
//! provenance graph and one sweep settles every cascade.

use crate::config::EngineConfig;
use crate::error::{MediaError, Result};
use crate::retry::with_backoff;
use crate::scanner::{Fingerprint, ScanOutput, Scanner};
use crate::storage::{
    FileId, FileKind, FileRecord, FileStatus, NewFileRecord, OperationId, OperationRecord,
    RecordFilter, Repository, Store,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How an orphan found its way back into the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "origin", rename_all = "snake_case")]
pub enum RecoveryOrigin {
    /// A missing operation output turned up at a new path.
    Relinked { operation_id: OperationId, previous_path: PathBuf },
    /// Nothing matched; registered as a new source.
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveredFile {
    pub file_id: FileId,
    pub path: PathBuf,
    #[serde(flatten)]
    pub origin: RecoveryOrigin,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconciliationSummary {
    pub scanned_files: usize,
    pub hashed_files: usize,
    pub newly_missing: usize,
    pub restored: usize,
    pub recovered: usize,
    pub invalidated_operations: usize,
    pub refreshed: usize,
    pub deferred: usize,
    pub unreadable: usize,
}

/// Outcome of one reconciliation pass. Logged and returned, never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub registry_version: u64,
    pub newly_missing: Vec<FileId>,
    /// Missing records whose bytes came back at their own path.
    pub restored: Vec<FileId>,
    pub recovered: Vec<RecoveredFile>,
    pub invalidated_operations: Vec<OperationId>,
    /// Present records whose bytes are unchanged but whose mtime moved.
    pub refreshed: Vec<FileId>,
    /// Orphans left for a later pass (too fresh, or their provenance is broken).
    pub deferred: Vec<PathBuf>,
    pub unreadable: Vec<PathBuf>,
    pub summary: ReconciliationSummary,
}

impl ReconciliationReport {
    /// True when the pass changed nothing in the registry.
    pub fn is_empty(&self) -> bool {
        self.newly_missing.is_empty()
            && self.restored.is_empty()
            && self.recovered.is_empty()
            && self.invalidated_operations.is_empty()
            && self.refreshed.is_empty()
    }
}

/// Changes computed from one snapshot + scan, not yet applied.
#[derive(Debug, Default)]
pub(crate) struct Plan {
    /// Updated copies of records, still carrying their snapshot version.
    pub updates: Vec<FileRecord>,
    pub invalidate: Vec<OperationId>,
    pub new_orphans: Vec<Fingerprint>,
    pub newly_missing: Vec<FileId>,
    pub restored: Vec<FileId>,
    pub relinked: Vec<RecoveredFile>,
    pub refreshed: Vec<FileId>,
    pub deferred: Vec<PathBuf>,
    pub unreadable: Vec<PathBuf>,
}

impl Plan {
    fn has_changes(&self) -> bool {
        !(self.updates.is_empty() && self.invalidate.is_empty() && self.new_orphans.is_empty())
    }
}

enum Bytes<'a> {
    Intact(&'a Fingerprint),
    Gone,
}

/// Compute the repair for one snapshot of records/operations against one scan.
pub(crate) fn plan(
    records: &[FileRecord],
    operations: &[OperationRecord],
    scan: &ScanOutput,
    now: DateTime<Utc>,
    orphan_grace: Duration,
) -> Plan {
    let mut plan = Plan {
        unreadable: scan.unreadable.keys().cloned().collect(),
        ..Plan::default()
    };

    let mut ordered: Vec<&FileRecord> = records.iter().filter(|r| r.status.is_tracked()).collect();
    ordered.sort_by_key(|r| r.id);
    let ops: HashMap<OperationId, &OperationRecord> = operations.iter().map(|op| (op.id, op)).collect();
    // A record holds its path only while the bytes there are still its own;
    // foreign bytes at a drifted record's path are an orphan like any other.
    let claimed: HashSet<&Path> = ordered
        .iter()
        .filter(|r| matches!(bytes_of(scan, r), Bytes::Intact(_)))
        .map(|r| r.storage_path.as_path())
        .collect();

    // ---- orphans ---------------------------------------------------------
    let grace_ns = i64::try_from(orphan_grace.as_nanos()).unwrap_or(i64::MAX);
    let now_ns = now.timestamp_nanos_opt().unwrap_or(i64::MAX);
    let mut orphans: Vec<&Fingerprint> = Vec::new();
    for fp in scan.fingerprints.values() {
        if claimed.contains(fp.path.as_path()) {
            continue;
        }
        if now_ns.saturating_sub(fp.mtime_ns) < grace_ns {
            tracing::debug!("[Reconciler] Orphan {} is still fresh, deferring", fp.path.display());
            plan.deferred.push(fp.path.clone());
        } else {
            orphans.push(fp);
        }
    }

    // Heuristic match against missing operation outputs: same size and the
    // same file name or the same checksum. Only one-to-one matches count.
    let lost_outputs: Vec<&FileRecord> = ordered
        .iter()
        .copied()
        .filter(|r| r.kind == FileKind::Generated && r.producing_operation_id.is_some())
        .filter(|r| matches!(bytes_of(scan, r), Bytes::Gone))
        .collect();

    let mut candidates_of: HashMap<&Path, Vec<FileId>> = HashMap::new();
    let mut claims_on: HashMap<FileId, usize> = HashMap::new();
    for &fp in &orphans {
        let cands: Vec<FileId> = lost_outputs
            .iter()
            .filter(|r| r.size_bytes == fp.size && r.storage_path != fp.path)
            .filter(|r| r.checksum == fp.checksum || (r.file_name().is_some() && r.file_name() == fp.file_name()))
            .map(|r| r.id)
            .collect();
        for id in &cands {
            *claims_on.entry(*id).or_default() += 1;
        }
        candidates_of.insert(fp.path.as_path(), cands);
    }

    let mut relink: HashMap<FileId, &Fingerprint> = HashMap::new();
    let mut matched_orphans: HashSet<&Path> = HashSet::new();
    for &fp in &orphans {
        match candidates_of.get(fp.path.as_path()).map(Vec::as_slice) {
            Some([only]) if claims_on.get(only) == Some(&1) => {
                relink.insert(*only, fp);
                matched_orphans.insert(fp.path.as_path());
            }
            Some(cands) if cands.len() > 1 => {
                tracing::info!("[Reconciler] Orphan {} matches {} operation outputs; not guessing",
                    fp.path.display(), cands.len());
            }
            _ => {}
        }
    }

    // ---- sweep in provenance order --------------------------------------
    let mut final_missing: HashSet<FileId> = HashSet::new();
    for r in &ordered {
        let inputs_missing = r
            .producing_operation_id
            .and_then(|op| ops.get(&op))
            .map_or(false, |op| op.input_file_ids.iter().any(|i| final_missing.contains(i)));

        let bytes = bytes_of(scan, r);
        let relinked_to = match (inputs_missing, r.producing_operation_id) {
            (false, Some(op)) => relink.get(&r.id).map(|fp| (*fp, op)),
            _ => None,
        };

        match (&bytes, relinked_to) {
            (Bytes::Intact(fp), _) if !inputs_missing => {
                if r.status == FileStatus::Missing {
                    let mut updated = (*r).clone();
                    updated.status = FileStatus::Present;
                    updated.mtime_ns = fp.mtime_ns;
                    updated.last_verified_at = now;
                    plan.restored.push(r.id);
                    plan.updates.push(updated);
                } else if fp.mtime_ns != r.mtime_ns {
                    let mut updated = (*r).clone();
                    updated.mtime_ns = fp.mtime_ns;
                    updated.last_verified_at = now;
                    plan.refreshed.push(r.id);
                    plan.updates.push(updated);
                }
            }
            (Bytes::Gone, Some((fp, operation_id))) => {
                let mut updated = (*r).clone();
                updated.storage_path = fp.path.clone();
                updated.size_bytes = fp.size;
                updated.checksum = fp.checksum.clone();
                updated.mtime_ns = fp.mtime_ns;
                updated.status = FileStatus::Present;
                updated.last_verified_at = now;
                plan.relinked.push(RecoveredFile {
                    file_id: r.id,
                    path: fp.path.clone(),
                    origin: RecoveryOrigin::Relinked {
                        operation_id,
                        previous_path: r.storage_path.clone(),
                    },
                });
                plan.updates.push(updated);
            }
            _ => {
                final_missing.insert(r.id);
                if r.status == FileStatus::Present {
                    let mut updated = (*r).clone();
                    updated.status = FileStatus::Missing;
                    updated.last_verified_at = now;
                    plan.newly_missing.push(r.id);
                    plan.updates.push(updated);
                }
                if let Some(fp) = relink.get(&r.id) {
                    // Its output turned up but its inputs are gone; wait.
                    plan.deferred.push(fp.path.clone());
                }
            }
        }
    }

    for op in operations {
        if !op.invalidated && op.input_file_ids.iter().any(|i| final_missing.contains(i)) {
            plan.invalidate.push(op.id);
        }
    }

    let relinked_paths: HashSet<&Path> = plan.relinked.iter().map(|r| r.path.as_path()).collect();
    let deferred_paths: HashSet<&Path> = plan.deferred.iter().map(PathBuf::as_path).collect();
    plan.new_orphans = orphans
        .iter()
        .filter(|fp| !relinked_paths.contains(fp.path.as_path()))
        .filter(|fp| !(matched_orphans.contains(fp.path.as_path()) && deferred_paths.contains(fp.path.as_path())))
        .map(|fp| (*fp).clone())
        .collect();

    plan
}

/// Content drift is treated exactly like loss; unreadable bytes are not trusted either.
fn bytes_of<'s>(scan: &'s ScanOutput, r: &FileRecord) -> Bytes<'s> {
    match scan.fingerprints.get(&r.storage_path) {
        Some(fp) if fp.size == r.size_bytes && fp.checksum == r.checksum => Bytes::Intact(fp),
        _ => Bytes::Gone,
    }
}

/// Mark `start` missing and walk the provenance graph forward: consuming
/// operations are invalidated and their outputs marked missing.
///
/// Returns the records that changed status and the operations invalidated.
pub(crate) fn cascade_missing(
    repo: &Repository<'_>,
    start: FileId,
    now: DateTime<Utc>,
) -> Result<(Vec<FileId>, Vec<OperationId>)> {
    let mut missing = Vec::new();
    let mut invalidated = Vec::new();
    let mut queue = VecDeque::from([start]);
    let mut seen = HashSet::new();

    while let Some(id) = queue.pop_front() {
        if !seen.insert(id) {
            continue;
        }
        let record = repo.get_file(id)?.ok_or_else(|| MediaError::NotFound(id.to_string()))?;
        if record.status == FileStatus::Present {
            let mut updated = record.clone();
            updated.status = FileStatus::Missing;
            updated.last_verified_at = now;
            repo.put_file(&updated)?;
            missing.push(id);
        }
        for op_id in repo.operations_consuming(id)? {
            if repo.invalidate_operation(op_id)? {
                invalidated.push(op_id);
            }
            if let Some(op) = repo.get_operation(op_id)? {
                queue.push_back(op.output_file_id);
            }
        }
    }
    Ok((missing, invalidated))
}

pub struct Reconciler<'a> {
    store: &'a Store,
    scanner: &'a Scanner,
    config: &'a EngineConfig,
}

impl<'a> Reconciler<'a> {
    pub fn new(store: &'a Store, scanner: &'a Scanner, config: &'a EngineConfig) -> Self {
        Self { store, scanner, config }
    }

    /// Run one full pass. Interference from concurrent writers is retried
    /// with backoff; a pass that still cannot commit is reported as a conflict.
    pub fn run(&self, cancel: &CancellationToken) -> Result<ReconciliationReport> {
        let attempts = self.config.retry.attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.run_once(cancel) {
                Err(MediaError::Conflict(reason)) if attempt < attempts => {
                    let delay = self.config.retry.delay(attempt);
                    tracing::warn!("[Reconciler] Commit interfered with ({}); retrying in {:?}", reason, delay);
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    fn run_once(&self, cancel: &CancellationToken) -> Result<ReconciliationReport> {
        let started_at = Utc::now();
        if self.config.managed_dirs.is_empty() {
            // With nothing to scan every record would look lost.
            return Err(MediaError::InvalidRequest("no managed directories configured".into()));
        }

        // 1. Snapshot
        let snapshot = self.store.snapshot_and_backup()?;
        check_cancelled(cancel)?;

        // 2. Registry view
        let (records, operations) = self.store.read(|repo| {
            Ok((repo.list_files(&RecordFilter::tracked())?, repo.list_operations()?))
        })?;
        self.scanner.prime(
            records
                .iter()
                .filter(|r| r.status == FileStatus::Present)
                .map(|r| Fingerprint {
                    path: r.storage_path.clone(),
                    size: r.size_bytes,
                    mtime_ns: r.mtime_ns,
                    checksum: r.checksum.clone(),
                }),
        )?;

        // 3. Scan
        let scan = with_backoff(&self.config.retry, "[Reconciler] Scan", cancel, || {
            self.scanner.scan(&self.config.managed_dirs, cancel)
        })?;
        check_cancelled(cancel)?;

        // 4-6. Plan
        let now = Utc::now();
        let plan = plan(&records, &operations, &scan, now, self.config.orphan_grace());
        check_cancelled(cancel)?;

        // 7. Commit
        let known_ops: HashSet<OperationId> = operations.iter().map(|op| op.id).collect();
        let (registry_version, unknown) = if plan.has_changes() {
            self.store.write(|repo| commit(repo, &plan, &known_ops, now))?
        } else {
            self.store.write_meta(|repo| repo.set_last_reconciled_at(now))?;
            (snapshot.registry_version, Vec::new())
        };

        let mut recovered = plan.relinked.clone();
        recovered.extend(unknown);

        let summary = ReconciliationSummary {
            scanned_files: scan.fingerprints.len(),
            hashed_files: scan.hashed,
            newly_missing: plan.newly_missing.len(),
            restored: plan.restored.len(),
            recovered: recovered.len(),
            invalidated_operations: plan.invalidate.len(),
            refreshed: plan.refreshed.len(),
            deferred: plan.deferred.len(),
            unreadable: plan.unreadable.len(),
        };

        let report = ReconciliationReport {
            started_at,
            finished_at: Utc::now(),
            registry_version,
            newly_missing: plan.newly_missing,
            restored: plan.restored,
            recovered,
            invalidated_operations: plan.invalidate,
            refreshed: plan.refreshed,
            deferred: plan.deferred,
            unreadable: plan.unreadable,
            summary,
        };

        if report.is_empty() {
            tracing::info!("[Reconciler] Registry consistent ({} files scanned)", report.summary.scanned_files);
        } else {
            tracing::info!(
                "[Reconciler] Pass committed at version {}: {} missing, {} restored, {} recovered, {} operations invalidated",
                report.registry_version,
                report.summary.newly_missing,
                report.summary.restored,
                report.summary.recovered,
                report.summary.invalidated_operations,
            );
        }
        Ok(report)
    }
}

fn commit(
    repo: &Repository<'_>,
    plan: &Plan,
    known_ops: &HashSet<OperationId>,
    now: DateTime<Utc>,
) -> Result<(u64, Vec<RecoveredFile>)> {
    for record in &plan.updates {
        repo.put_file(record)?;
    }

    // An operation registered after our snapshot may consume a record we are
    // about to declare missing; its cascade was not planned.
    for id in &plan.newly_missing {
        for op in repo.operations_consuming(*id)? {
            if !known_ops.contains(&op) {
                return Err(MediaError::Conflict(format!(
                    "{} was registered during reconciliation and consumes {}", op, id
                )));
            }
        }
    }

    for op in &plan.invalidate {
        repo.invalidate_operation(*op)?;
    }

    let mut unknown = Vec::new();
    for fp in &plan.new_orphans {
        if let Some(existing) = repo.present_file_at(&fp.path)? {
            tracing::debug!("[Reconciler] {} was registered concurrently as {}", fp.path.display(), existing.id);
            continue;
        }
        let name = fp.display_name();
        let extension = fp.path.extension().and_then(|e| e.to_str()).map(str::to_lowercase);
        let id = repo.insert_file(&NewFileRecord {
            original_name: name,
            storage_path: fp.path.clone(),
            size_bytes: fp.size,
            checksum: fp.checksum.clone(),
            kind: FileKind::Source,
            metadata: serde_json::json!({
                "recovered": true,
                "reason": "unknown recovered file",
                "discovered_at": now.to_rfc3339(),
                "extension": extension,
            }),
            status: FileStatus::Present,
            mtime_ns: fp.mtime_ns,
            registered_at: now,
        })?;
        tracing::warn!("[Reconciler] Unknown recovered file {} registered as {}", fp.path.display(), id);
        unknown.push(RecoveredFile { file_id: id, path: fp.path.clone(), origin: RecoveryOrigin::Unknown });
    }

    repo.set_last_reconciled_at(now)?;
    // store.write bumps once more on commit
    Ok((repo.registry_version()? + 1, unknown))
}

fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        tracing::info!("[Reconciler] Pass cancelled before commit; registry untouched");
        return Err(MediaError::Cancelled);
    }
    Ok(())
}
