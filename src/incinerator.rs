//! The Incinerator: cache eviction.
//!
//! Removes the bytes of present records that are not protected and marks them
//! evicted. A record is protected while it is an input of an operation whose
//! output has not itself been evicted. Protection is recomputed every round,
//! so evicting a leaf can release its inputs in the next round.

use crate::config::{EvictionPolicy, RetryPolicy};
use crate::error::{MediaError, Result};
use crate::storage::{FileId, FileRecord, FileStatus, OperationRecord, RecordFilter, Repository, Store};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::thread;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionReason {
    Age,
    MaxEntries,
    MaxTotalBytes,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvictedFile {
    pub file_id: FileId,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub reason: EvictionReason,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvictionFailure {
    pub file_id: FileId,
    pub path: PathBuf,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvictionReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub rounds: usize,
    pub evicted: Vec<EvictedFile>,
    pub failed: Vec<EvictionFailure>,
    pub freed_bytes: u64,
    /// Present records/bytes left after the pass.
    pub remaining_entries: usize,
    pub remaining_bytes: u64,
    /// True if a bound is still exceeded because only protected records remain.
    pub over_bound: bool,
}

/// Records that must not be evicted in this round.
pub(crate) fn protected_ids(records: &HashMap<FileId, &FileRecord>, operations: &[OperationRecord]) -> HashSet<FileId> {
    operations
        .iter()
        .filter(|op| {
            records
                .get(&op.output_file_id)
                .map_or(false, |out| out.status != FileStatus::Evicted)
        })
        .flat_map(|op| op.input_file_ids.iter().copied())
        .collect()
}

/// Pick the records to evict in one round, oldest-verified first.
pub(crate) fn select_victims(
    records: &[FileRecord],
    operations: &[OperationRecord],
    policy: &EvictionPolicy,
    now: DateTime<Utc>,
) -> Vec<(FileRecord, EvictionReason)> {
    let by_id: HashMap<FileId, &FileRecord> = records.iter().map(|r| (r.id, r)).collect();
    let protected = protected_ids(&by_id, operations);

    let present: Vec<&FileRecord> = records.iter().filter(|r| r.status == FileStatus::Present).collect();
    let mut candidates: Vec<&FileRecord> = present.iter().copied().filter(|r| !protected.contains(&r.id)).collect();
    candidates.sort_by(|a, b| a.last_verified_at.cmp(&b.last_verified_at).then(a.id.cmp(&b.id)));

    let mut chosen: Vec<(FileRecord, EvictionReason)> = Vec::new();
    let mut taken: HashSet<FileId> = HashSet::new();

    if let Some(max_age) = policy.max_entry_age_secs {
        let max_age = ChronoDuration::seconds(i64::try_from(max_age).unwrap_or(i64::MAX));
        for r in &candidates {
            if now.signed_duration_since(r.registered_at) > max_age {
                taken.insert(r.id);
                chosen.push(((*r).clone(), EvictionReason::Age));
            }
        }
    }

    let mut remaining_entries = present.len() - taken.len();
    let mut remaining_bytes: u64 = present
        .iter()
        .filter(|r| !taken.contains(&r.id))
        .map(|r| r.size_bytes)
        .sum();

    for r in &candidates {
        if taken.contains(&r.id) {
            continue;
        }
        let reason = if policy.max_entries.map_or(false, |max| remaining_entries > max) {
            EvictionReason::MaxEntries
        } else if policy.max_total_bytes.map_or(false, |max| remaining_bytes > max) {
            EvictionReason::MaxTotalBytes
        } else {
            break;
        };
        taken.insert(r.id);
        remaining_entries -= 1;
        remaining_bytes = remaining_bytes.saturating_sub(r.size_bytes);
        chosen.push(((*r).clone(), reason));
    }

    chosen
}

/// Outcome of one write batch.
#[derive(Default)]
struct Burned {
    burned: Vec<EvictedFile>,
    failed: Vec<EvictionFailure>,
    retry: Vec<(FileRecord, EvictionReason, String)>,
}

pub struct Incinerator<'a> {
    store: &'a Store,
    retry: RetryPolicy,
}

impl<'a> Incinerator<'a> {
    pub fn new(store: &'a Store, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    pub fn run(&self, policy: &EvictionPolicy, cancel: &CancellationToken) -> Result<EvictionReport> {
        let started_at = Utc::now();
        let mut evicted = Vec::new();
        let mut failed = Vec::new();
        let mut rounds = 0;

        if policy.is_unbounded() {
            tracing::debug!("[Incinerator] No eviction bounds configured");
        } else {
            self.store.snapshot_and_backup()?;
        }

        while !policy.is_unbounded() {
            if cancel.is_cancelled() {
                return Err(MediaError::Cancelled);
            }
            let (records, operations) = self.store.read(|repo| {
                Ok((repo.list_files(&RecordFilter::all())?, repo.list_operations()?))
            })?;
            let already_failed: HashSet<FileId> = failed.iter().map(|f: &EvictionFailure| f.file_id).collect();
            let victims: Vec<_> = select_victims(&records, &operations, policy, Utc::now())
                .into_iter()
                .filter(|(r, _)| !already_failed.contains(&r.id))
                .collect();
            if victims.is_empty() {
                break;
            }
            rounds += 1;
            tracing::info!("[Incinerator] Round {}: {} candidates", rounds, victims.len());

            let mut pending = victims;
            let mut progressed = false;
            for attempt in 1..=self.retry.attempts.max(1) {
                let batch = self.store.write(|repo| self.burn(repo, &pending))?;
                progressed |= !batch.burned.is_empty();
                evicted.extend(batch.burned);
                failed.extend(batch.failed);
                if batch.retry.is_empty() {
                    break;
                }
                if attempt == self.retry.attempts.max(1) || cancel.is_cancelled() {
                    failed.extend(batch.retry.into_iter().map(|(r, _, error)| EvictionFailure {
                        file_id: r.id,
                        path: r.storage_path,
                        error,
                    }));
                    break;
                }
                // Back off with the writer released; the next batch re-checks
                // each victim before trying again.
                let delay = self.retry.delay(attempt);
                tracing::warn!("[Incinerator] {} deletes failed (attempt {}), retrying in {:?}",
                    batch.retry.len(), attempt, delay);
                thread::sleep(delay);
                pending = batch.retry.into_iter().map(|(r, reason, _)| (r, reason)).collect();
            }
            if !progressed {
                break;
            }
        }

        let (remaining_entries, remaining_bytes, over_bound) = self.store.read(|repo| {
            let counts = repo.status_counts()?;
            let over = policy.max_entries.map_or(false, |m| counts.present as usize > m)
                || policy.max_total_bytes.map_or(false, |m| counts.present_bytes > m);
            Ok((counts.present as usize, counts.present_bytes, over))
        })?;
        if over_bound {
            tracing::warn!("[Incinerator] Still over bound: only protected records remain ({} entries, {} bytes)",
                remaining_entries, remaining_bytes);
        }

        let freed_bytes: u64 = evicted.iter().map(|e: &EvictedFile| e.size_bytes).sum();
        if !evicted.is_empty() {
            tracing::info!("[Incinerator] Eviction complete: {} files, {} bytes freed", evicted.len(), freed_bytes);
        }

        Ok(EvictionReport {
            started_at,
            finished_at: Utc::now(),
            rounds,
            evicted,
            failed,
            freed_bytes,
            remaining_entries,
            remaining_bytes,
            over_bound,
        })
    }

    /// Delete and mark victims inside a single write batch. The batch holds
    /// the writer, so no registration can start consuming a victim between
    /// the protection re-check and the delete. Each file gets one delete
    /// attempt here; transient failures come back for a later batch.
    fn burn(&self, repo: &Repository<'_>, victims: &[(FileRecord, EvictionReason)]) -> Result<Burned> {
        let mut out = Burned::default();
        let mut confirmed = Vec::new();

        for (record, reason) in victims {
            let Some(current) = repo.get_file(record.id)? else { continue };
            if current.status != FileStatus::Present || current.version != record.version {
                tracing::debug!("[Incinerator] {} changed since selection, skipping", record.id);
                continue;
            }
            if self.is_protected_now(repo, record.id)? {
                tracing::debug!("[Incinerator] {} became protected, skipping", record.id);
                continue;
            }

            tracing::info!("[Incinerator] Burning {} ({}, {} bytes)", record.id, record.storage_path.display(), record.size_bytes);
            match remove_bytes(&record.storage_path) {
                Ok(()) => {
                    confirmed.push(record.id);
                    out.burned.push(EvictedFile {
                        file_id: record.id,
                        path: record.storage_path.clone(),
                        size_bytes: record.size_bytes,
                        reason: *reason,
                    });
                }
                Err(e) if e.is_transient() => {
                    out.retry.push((record.clone(), *reason, e.to_string()));
                }
                Err(e) => {
                    tracing::error!("[Incinerator] Failed to delete {}: {}", record.storage_path.display(), e);
                    out.failed.push(EvictionFailure {
                        file_id: record.id,
                        path: record.storage_path.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        repo.mark_evicted(&confirmed, Utc::now())?;
        Ok(out)
    }

    fn is_protected_now(&self, repo: &Repository<'_>, id: FileId) -> Result<bool> {
        for op_id in repo.operations_consuming(id)? {
            let Some(op) = repo.get_operation(op_id)? else { continue };
            let output_live = repo
                .get_file(op.output_file_id)?
                .map_or(false, |out| out.status != FileStatus::Evicted);
            if output_live {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// Remove a file and confirm it is gone. Already-absent bytes count as removed.
fn remove_bytes(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {
            tracing::warn!("[Incinerator] Physical file already gone: {}", path.display());
        }
        Err(e) => return Err(e.into()),
    }

    match fs::symlink_metadata(path) {
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
        Ok(_) => Err(MediaError::State(format!("{} still exists after delete", path.display()))),
    }
}
