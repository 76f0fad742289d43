//! The collaborator-facing API: registration, lookup, provenance.

mod common;

use common::Sandbox;
use mediavault::scanner::checksum_file;
use mediavault::{
    FileId, FileKind, FileStatus, MediaError, OperationDraft, RecordFilter, RegisterRequest,
};
use std::fs;
use std::sync::Arc;
use std::thread;

#[test]
fn registration_round_trips() {
    let sb = Sandbox::new();
    let path = sb.write("clips/intro.mp4", b"intro bytes");
    let registry = sb.open();

    let checksum = checksum_file(&path).unwrap();
    let record = registry
        .register(
            RegisterRequest::source(&path)
                .with_metadata(serde_json::json!({"format": "mp4", "duration_ms": 1200}))
                .expecting(11, checksum.clone()),
        )
        .unwrap();

    let resolved = registry.resolve(record.id).unwrap();
    assert_eq!(resolved, record);
    assert_eq!(resolved.storage_path, path);
    assert_eq!(resolved.size_bytes, 11);
    assert_eq!(resolved.checksum, checksum);
    assert_eq!(resolved.kind, FileKind::Source);
    assert_eq!(resolved.status, FileStatus::Present);
    assert_eq!(resolved.original_name, "intro.mp4");
    assert_eq!(resolved.metadata["duration_ms"], 1200);
}

#[test]
fn bare_requests_store_empty_metadata_and_parameters() {
    let sb = Sandbox::new();
    let registry = sb.open();

    let a = registry.register(RegisterRequest::source(sb.write("a.mp4", b"aaaa"))).unwrap();
    assert_eq!(a.metadata, serde_json::json!({}));

    let mut explicit_null = RegisterRequest::generated(sb.write("b.mp4", b"bbbb"), OperationDraft::new("trim", vec![a.id]));
    explicit_null.metadata = serde_json::Value::Null;
    let b = registry.register(explicit_null).unwrap();
    assert_eq!(b.metadata, serde_json::json!({}));
    let op = registry.operation(b.producing_operation_id.unwrap()).unwrap();
    assert_eq!(op.parameters, serde_json::json!({}));

    let parsed: RegisterRequest =
        serde_json::from_value(serde_json::json!({"kind": "source", "path": sb.media.join("c.mp4")})).unwrap();
    assert_eq!(parsed.metadata, serde_json::json!({}));
}

#[test]
fn unknown_id_is_not_found() {
    let sb = Sandbox::new();
    let registry = sb.open();
    assert!(matches!(registry.resolve(FileId(42)), Err(MediaError::NotFound(_))));
    assert!(matches!(registry.history(FileId(42)), Err(MediaError::NotFound(_))));
}

#[test]
fn second_registration_of_a_path_conflicts() {
    let sb = Sandbox::new();
    let path = sb.write("a.mp4", b"aaaa");
    let registry = sb.open();

    registry.register(RegisterRequest::source(&path)).unwrap();
    let err = registry.register(RegisterRequest::source(&path)).unwrap_err();
    assert!(matches!(err, MediaError::Conflict(_)));
}

#[test]
fn declared_checksum_must_match() {
    let sb = Sandbox::new();
    let path = sb.write("a.mp4", b"aaaa");
    let registry = sb.open();

    let err = registry
        .register(RegisterRequest::source(&path).expecting(4, "sha256:0000"))
        .unwrap_err();
    assert!(matches!(err, MediaError::ChecksumMismatch { .. }));
    assert!(registry.list(&RecordFilter::all()).unwrap().is_empty());
}

#[test]
fn malformed_requests_are_rejected() {
    let sb = Sandbox::new();
    let a = sb.write("a.mp4", b"aaaa");
    let registry = sb.open();
    let ra = registry.register(RegisterRequest::source(&a)).unwrap();

    let b = sb.write("b.mp4", b"bbbb");
    let mut sourced_with_op = RegisterRequest::source(&b);
    sourced_with_op.operation = Some(OperationDraft::new("trim", vec![ra.id]));
    assert!(matches!(registry.register(sourced_with_op), Err(MediaError::InvalidRequest(_))));

    let mut generated_without_op = RegisterRequest::source(&b);
    generated_without_op.kind = FileKind::Generated;
    assert!(matches!(registry.register(generated_without_op), Err(MediaError::InvalidRequest(_))));

    let dangling = RegisterRequest::generated(&b, OperationDraft::new("trim", vec![FileId(999)]));
    assert!(matches!(registry.register(dangling), Err(MediaError::NotFound(_))));

    let outside = sb.state.join("elsewhere.mp4");
    fs::create_dir_all(&sb.state).unwrap();
    fs::write(&outside, b"outside").unwrap();
    assert!(matches!(registry.register(RegisterRequest::source(&outside)), Err(MediaError::InvalidPath(_))));

    let absent = sb.media.join("never-written.mp4");
    assert!(matches!(registry.register(RegisterRequest::source(&absent)), Err(MediaError::InvalidPath(_))));
}

#[test]
fn output_of_missing_input_is_recorded_missing() {
    let sb = Sandbox::new();
    let a = sb.write("a.mp4", b"aaaa");
    let registry = sb.open();
    let ra = registry.register(RegisterRequest::source(&a)).unwrap();
    fs::remove_file(&a).unwrap();
    registry.request_reconciliation().unwrap();

    let c = sb.write("c.mp4", b"cccc");
    let rc = registry
        .register(RegisterRequest::generated(&c, OperationDraft::new("filter", vec![ra.id])))
        .unwrap();
    assert_eq!(rc.status, FileStatus::Missing);
    assert!(registry.operation(rc.producing_operation_id.unwrap()).unwrap().invalidated);
}

#[test]
fn history_walks_ancestors_in_declared_order() {
    let sb = Sandbox::new();
    let registry = sb.open();
    let a = registry.register(RegisterRequest::source(sb.write("a.wav", b"a"))).unwrap();
    let b = registry.register(RegisterRequest::source(sb.write("b.wav", b"b"))).unwrap();

    let c = registry
        .register(RegisterRequest::generated(
            sb.write("c.wav", b"c"),
            OperationDraft::new("concatenate", vec![b.id, a.id])
                .with_parameters(serde_json::json!({"crossfade_ms": 200})),
        ))
        .unwrap();
    let d = registry
        .register(RegisterRequest::generated(sb.write("d.wav", b"d"), OperationDraft::new("normalize", vec![c.id])))
        .unwrap();
    let e = registry
        .register(RegisterRequest::generated(sb.write("e.wav", b"e"), OperationDraft::new("mix", vec![c.id, d.id])))
        .unwrap();

    let chain = registry.history(e.id).unwrap();
    let types: Vec<_> = chain.iter().map(|op| op.operation_type.as_str()).collect();
    assert_eq!(types, vec!["mix", "concatenate", "normalize"]);
    assert_eq!(chain[1].input_file_ids, vec![b.id, a.id]);
    assert_eq!(chain[1].parameters["crossfade_ms"], 200);

    assert_eq!(registry.history(d.id).unwrap().len(), 2);
    assert!(registry.history(a.id).unwrap().is_empty());
}

#[test]
fn search_and_list_filter_records() {
    let sb = Sandbox::new();
    let registry = sb.open();
    let a = registry.register(RegisterRequest::source(sb.write("raw/a.mp4", b"aaaa"))).unwrap();
    registry
        .register(RegisterRequest::generated(sb.write("out/b.mp4", b"bb"), OperationDraft::new("trim", vec![a.id])))
        .unwrap();

    let generated = registry.list(&RecordFilter::all().kind(FileKind::Generated)).unwrap();
    assert_eq!(generated.len(), 1);
    let under_raw = registry.list(&RecordFilter::all().under(sb.media.join("raw"))).unwrap();
    assert_eq!(under_raw[0].id, a.id);

    let big = registry.search(|r| r.size_bytes > 3).unwrap();
    assert_eq!(big.len(), 1);
    assert_eq!(big[0].id, a.id);
}

#[test]
fn verify_cascades_when_bytes_changed() {
    let sb = Sandbox::new();
    let a = sb.write("a.mp4", b"original");
    let registry = sb.open();
    let ra = registry.register(RegisterRequest::source(&a)).unwrap();
    let rb = registry
        .register(RegisterRequest::generated(sb.write("b.mp4", b"derived"), OperationDraft::new("trim", vec![ra.id])))
        .unwrap();

    let ok = registry.verify(rb.id).unwrap();
    assert!(ok.intact);
    assert!(ok.newly_missing.is_empty());

    fs::write(&a, b"tampered").unwrap();
    let report = registry.verify(ra.id).unwrap();
    assert!(!report.intact);
    assert_eq!(report.newly_missing, vec![ra.id, rb.id]);
    assert_eq!(report.invalidated_operations, vec![rb.producing_operation_id.unwrap()]);
    assert_eq!(registry.resolve(rb.id).unwrap().status, FileStatus::Missing);
}

#[test]
fn concurrent_registrations_get_distinct_ids() {
    let sb = Sandbox::new();
    let paths: Vec<_> = (0..8).map(|i| sb.write(&format!("batch/{}.mp4", i), format!("clip {}", i).as_bytes())).collect();
    let registry = Arc::new(sb.open());

    let handles: Vec<_> = paths
        .into_iter()
        .map(|path| {
            let registry = Arc::clone(&registry);
            thread::spawn(move || registry.register(RegisterRequest::source(path)).unwrap().id)
        })
        .collect();
    let mut ids: Vec<FileId> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 8);

    for id in ids {
        assert_eq!(registry.resolve(id).unwrap().status, FileStatus::Present);
    }
}

#[test]
fn racing_registrations_of_one_path_admit_one() {
    let sb = Sandbox::new();
    let path = sb.write("contended.mp4", b"contended");
    let registry = Arc::new(sb.open());

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let registry = Arc::clone(&registry);
            let path = path.clone();
            thread::spawn(move || registry.register(RegisterRequest::source(path)))
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| matches!(e, MediaError::Conflict(_))));
}

#[cfg(unix)]
#[test]
fn symlinks_cannot_be_registered() {
    let sb = Sandbox::new();
    fs::create_dir_all(&sb.state).unwrap();
    let outside = sb.state.join("outside.mp4");
    fs::write(&outside, b"outside").unwrap();
    let link = sb.media.join("link.mp4");
    std::os::unix::fs::symlink(&outside, &link).unwrap();
    std::os::unix::fs::symlink(&sb.state, sb.media.join("state_link")).unwrap();

    let registry = sb.open();
    assert!(matches!(registry.register(RegisterRequest::source(&link)), Err(MediaError::InvalidPath(_))));
    let through_dir = sb.media.join("state_link/outside.mp4");
    assert!(matches!(registry.register(RegisterRequest::source(&through_dir)), Err(MediaError::InvalidPath(_))));

    // A registered regular file survives a pass that also sees the links.
    let real = registry.register(RegisterRequest::source(sb.write("real.mp4", b"real"))).unwrap();
    let report = registry.request_reconciliation().unwrap();
    assert!(report.newly_missing.is_empty());
    assert!(report.recovered.is_empty());
    assert_eq!(registry.resolve(real.id).unwrap().status, FileStatus::Present);
}
