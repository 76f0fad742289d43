//! Reconciliation passes against a real managed directory.

mod common;

use common::Sandbox;
use mediavault::{
    FileStatus, MediaError, OperationDraft, RecordFilter, RecoveryOrigin, RegisterRequest,
};
use std::fs;
use tokio_util::sync::CancellationToken;

#[test]
fn deleted_source_cascades_to_derived_output() {
    let sb = Sandbox::new();
    let a = sb.write("a.mp4", b"source footage");
    let b = sb.write("renders/b.mp4", b"trimmed footage");
    let registry = sb.open();

    let ra = registry.register(RegisterRequest::source(&a)).unwrap();
    let rb = registry
        .register(RegisterRequest::generated(&b, OperationDraft::new("trim", vec![ra.id])))
        .unwrap();
    let op = rb.producing_operation_id.unwrap();

    fs::remove_file(&a).unwrap();
    let report = registry.request_reconciliation().unwrap();

    assert_eq!(report.newly_missing, vec![ra.id, rb.id]);
    assert_eq!(report.invalidated_operations, vec![op]);
    assert!(report.recovered.is_empty());

    assert_eq!(registry.resolve(ra.id).unwrap().status, FileStatus::Missing);
    assert_eq!(registry.resolve(rb.id).unwrap().status, FileStatus::Missing);
    assert!(registry.operation(op).unwrap().invalidated);
}

#[test]
fn identical_unexpected_files_become_distinct_sources() {
    let sb = Sandbox::new();
    let x = sb.write("inbox/x/take.wav", b"same bytes");
    let y = sb.write("inbox/y/take.wav", b"same bytes");
    let registry = sb.open();

    let report = registry.request_reconciliation().unwrap();
    assert_eq!(report.recovered.len(), 2);
    assert!(report.recovered.iter().all(|r| r.origin == RecoveryOrigin::Unknown));
    assert_ne!(report.recovered[0].file_id, report.recovered[1].file_id);

    let paths: Vec<_> = report.recovered.iter().map(|r| r.path.clone()).collect();
    assert!(paths.contains(&x) && paths.contains(&y));

    for recovered in &report.recovered {
        let record = registry.resolve(recovered.file_id).unwrap();
        assert_eq!(record.status, FileStatus::Present);
        assert_eq!(record.metadata["recovered"], true);
        assert_eq!(record.metadata["reason"], "unknown recovered file");
    }
}

#[test]
fn back_to_back_passes_are_idempotent() {
    let sb = Sandbox::new();
    let a = sb.write("a.mp4", b"aaaa");
    let b = sb.write("b.mp4", b"bbbb");
    sb.write("stray.mov", b"nobody registered me");
    let registry = sb.open();

    let ra = registry.register(RegisterRequest::source(&a)).unwrap();
    registry
        .register(RegisterRequest::generated(&b, OperationDraft::new("encode", vec![ra.id])))
        .unwrap();
    fs::remove_file(&a).unwrap();

    let first = registry.request_reconciliation().unwrap();
    assert!(!first.is_empty());

    let records = registry.list(&RecordFilter::all()).unwrap();
    let operations = registry.operations().unwrap();
    let version = registry.health_check().unwrap().registry_version;

    let second = registry.request_reconciliation().unwrap();
    assert!(second.is_empty(), "second pass changed something: {:?}", second);
    assert_eq!(registry.list(&RecordFilter::all()).unwrap(), records);
    assert_eq!(registry.operations().unwrap(), operations);
    assert_eq!(registry.health_check().unwrap().registry_version, version);
}

#[test]
fn moved_output_is_relinked_to_its_operation() {
    let sb = Sandbox::new();
    let a = sb.write("a.mp4", b"source");
    let b = sb.write("renders/b.mp4", b"derived");
    let registry = sb.open();

    let ra = registry.register(RegisterRequest::source(&a)).unwrap();
    let rb = registry
        .register(RegisterRequest::generated(&b, OperationDraft::new("trim", vec![ra.id])))
        .unwrap();

    let moved = sb.media.join("archive/b.mp4");
    fs::create_dir_all(moved.parent().unwrap()).unwrap();
    fs::rename(&b, &moved).unwrap();

    let report = registry.request_reconciliation().unwrap();
    assert!(report.newly_missing.is_empty());
    assert_eq!(report.recovered.len(), 1);
    assert_eq!(report.recovered[0].file_id, rb.id);
    assert!(matches!(report.recovered[0].origin, RecoveryOrigin::Relinked { .. }));

    let record = registry.resolve(rb.id).unwrap();
    assert_eq!(record.status, FileStatus::Present);
    assert_eq!(record.storage_path, moved);
    assert_eq!(record.producing_operation_id, rb.producing_operation_id);
}

#[test]
fn returning_bytes_restore_a_missing_record() {
    let sb = Sandbox::new();
    let a = sb.write("a.mp4", b"keep me");
    let registry = sb.open();
    let ra = registry.register(RegisterRequest::source(&a)).unwrap();

    fs::remove_file(&a).unwrap();
    registry.request_reconciliation().unwrap();
    assert_eq!(registry.resolve(ra.id).unwrap().status, FileStatus::Missing);

    sb.write("a.mp4", b"keep me");
    let report = registry.request_reconciliation().unwrap();
    assert_eq!(report.restored, vec![ra.id]);
    assert_eq!(registry.resolve(ra.id).unwrap().status, FileStatus::Present);
}

#[test]
fn changed_bytes_are_treated_as_loss() {
    let sb = Sandbox::new();
    let a = sb.write("a.mp4", b"original");
    let registry = sb.open();
    let ra = registry.register(RegisterRequest::source(&a)).unwrap();

    sb.write("a.mp4", b"overwritten by someone else");
    let report = registry.request_reconciliation().unwrap();
    assert_eq!(report.newly_missing, vec![ra.id]);

    // The foreign bytes are tracked on their own, not hidden behind the lost record.
    assert_eq!(report.recovered.len(), 1);
    let adopted = &report.recovered[0];
    assert_eq!(adopted.path, a);
    assert!(matches!(adopted.origin, RecoveryOrigin::Unknown));
    assert_eq!(registry.resolve(adopted.file_id).unwrap().status, FileStatus::Present);
    assert_eq!(registry.resolve(ra.id).unwrap().status, FileStatus::Missing);

    assert!(registry.request_reconciliation().unwrap().is_empty());
}

#[test]
fn drifted_output_is_not_relinked_to_its_own_path() {
    let sb = Sandbox::new();
    let registry = sb.open();
    let ra = registry.register(RegisterRequest::source(sb.write("a.mp4", b"aaaa"))).unwrap();
    let b = sb.write("b.mp4", b"render-1");
    let rb = registry
        .register(RegisterRequest::generated(&b, OperationDraft::new("trim", vec![ra.id])))
        .unwrap();

    // Same name, same size, different bytes.
    sb.write("b.mp4", b"render-2");
    let report = registry.request_reconciliation().unwrap();
    assert_eq!(report.newly_missing, vec![rb.id]);
    assert_eq!(report.recovered.len(), 1);
    assert!(matches!(report.recovered[0].origin, RecoveryOrigin::Unknown));
    assert_ne!(report.recovered[0].file_id, rb.id);
}

#[cfg(unix)]
#[test]
fn non_utf8_names_reconcile_idempotently() {
    use std::os::unix::ffi::OsStrExt;
    let sb = Sandbox::new();
    let path = sb.media.join(std::ffi::OsStr::from_bytes(b"clip\xff.mp4"));
    fs::write(&path, b"odd name").unwrap();
    let registry = sb.open();

    let first = registry.request_reconciliation().unwrap();
    assert_eq!(first.recovered.len(), 1);
    assert_eq!(registry.resolve(first.recovered[0].file_id).unwrap().storage_path, path);

    for _ in 0..2 {
        assert!(registry.request_reconciliation().unwrap().is_empty());
    }
    assert_eq!(registry.list(&RecordFilter::all()).unwrap().len(), 1);
}

#[test]
fn cancelled_pass_leaves_registry_untouched() {
    let sb = Sandbox::new();
    let a = sb.write("a.mp4", b"aaaa");
    let registry = sb.open();
    let ra = registry.register(RegisterRequest::source(&a)).unwrap();
    fs::remove_file(&a).unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = registry.request_reconciliation_with(&cancel);
    assert!(matches!(result, Err(MediaError::Cancelled)));
    assert_eq!(registry.resolve(ra.id).unwrap().status, FileStatus::Present);
}

#[test]
fn unreadable_managed_dir_fails_without_mutation() {
    let sb = Sandbox::new();
    let a = sb.write("a.mp4", b"aaaa");
    let registry = sb.open();
    let ra = registry.register(RegisterRequest::source(&a)).unwrap();
    let version = registry.health_check().unwrap().registry_version;

    fs::remove_dir_all(&sb.media).unwrap();
    let result = registry.request_reconciliation();
    assert!(matches!(result, Err(MediaError::Scan { .. })));
    assert_eq!(registry.resolve(ra.id).unwrap().status, FileStatus::Present);
    assert_eq!(registry.health_check().unwrap().registry_version, version);
}

#[test]
fn ignored_files_are_never_adopted() {
    let sb = Sandbox::new();
    sb.write("render.mp4.part", b"still writing");
    sb.write(".DS_Store", b"finder");
    sb.write("scratch/tmp.mp4", b"scratch");
    sb.write(".mediavaultignore", b"scratch\n");
    let registry = sb.open();

    let report = registry.request_reconciliation().unwrap();
    assert!(report.recovered.is_empty());
    assert!(registry.list(&RecordFilter::all()).unwrap().is_empty());
}
