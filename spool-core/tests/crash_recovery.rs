//! A session interrupted mid-upload is resumed from the on-disk snapshot and spool.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use spool_core::config::SpoolConfig;
use spool_core::queue::task::ChunkData;
use spool_core::recovery::{RecoveryOutcome, RecoveryValidator};
use spool_core::remote::StartRequest;
use spool_core::remote::memory::{FaultPlan, InMemoryRemote};
use spool_core::session::capture::ScriptedCapture;
use spool_core::session::controller::RecordingController;
use spool_core::session::status::RecordingStatus;
use spool_core::storage_factory::{StorageBackend, open_storage};

fn controller(dir: &Path, remote: &Arc<InMemoryRemote>) -> RecordingController<InMemoryRemote> {
    let config = SpoolConfig::default();
    let storage = open_storage(StorageBackend::Dir(dir.to_path_buf()), &config.snapshot).unwrap();
    RecordingController::new(remote.clone(), storage, &config)
}

fn segment(index: u32) -> ChunkData {
    ChunkData::from(vec![index as u8; 32])
}

/// Record three chunks where 1 and 2 cannot reach the remote, then "crash".
async fn record_and_crash(dir: &Path, remote: &Arc<InMemoryRemote>) -> String {
    let first = controller(dir, remote);
    let session_id = first
        .start(&ScriptedCapture::granted(), StartRequest {
            title: "quarterly reconciliation".into(),
            ..StartRequest::default()
        })
        .await
        .unwrap();
    for i in 0..3 {
        first.on_chunk_ready(segment(i)).unwrap();
    }
    // Chunk 0 lands; 1 and 2 fail once and sit in backoff.
    tokio::time::sleep(Duration::from_millis(100)).await;
    first.queue().cancel_all();
    drop(first);
    session_id
}

#[tokio::test(start_paused = true)]
async fn interrupted_session_is_restored_and_finished() {
    let dir = tempfile::tempdir().unwrap();
    let remote = Arc::new(InMemoryRemote::with_faults(FaultPlan {
        always_fail: [1, 2].into_iter().collect(),
        ..FaultPlan::default()
    }));
    let session_id = record_and_crash(dir.path(), &remote).await;
    assert_eq!(remote.stored_indices(&session_id), vec![0]);

    // The remote comes back; a fresh process picks the session up.
    remote.set_faults(FaultPlan::default());
    let second = controller(dir.path(), &remote);
    let snap = second.snapshots().get().unwrap();
    assert_eq!(snap.status, RecordingStatus::Recording);
    assert_eq!(snap.chunk_count, 3);
    assert_eq!(snap.pending_chunks, vec![1, 2]);
    assert_eq!(second.spool().indices(&session_id), vec![1, 2]);

    let validator = RecoveryValidator::new(second.clone());
    let RecoveryOutcome::Restored(report) = validator.run(false).await.unwrap() else {
        panic!("expected the session to be restored");
    };
    assert_eq!(report.session_id, session_id);
    assert_eq!(report.status, RecordingStatus::Paused);
    assert_eq!(report.requeued, vec![1, 2]);
    assert!(report.lost.is_empty());

    let summary = second.stop(&ScriptedCapture::granted()).await.unwrap();
    assert_eq!(summary.status, RecordingStatus::Completed);
    assert_eq!(summary.chunk_count, 3);
    assert_eq!(remote.stored_indices(&session_id), vec![0, 1, 2]);

    let report = remote.session(&session_id).unwrap().report.unwrap();
    assert_eq!(report.chunk_count, 3);
    assert_eq!(report.total_bytes, 96);

    assert!(second.snapshots().get().is_none());
    assert!(second.spool().indices(&session_id).is_empty());
    assert!(!dir.path().join("active-session.json").exists());
}

#[tokio::test(start_paused = true)]
async fn session_gone_remotely_is_discarded() {
    let dir = tempfile::tempdir().unwrap();
    let remote = Arc::new(InMemoryRemote::with_faults(FaultPlan {
        always_fail: [1, 2].into_iter().collect(),
        ..FaultPlan::default()
    }));
    let session_id = record_and_crash(dir.path(), &remote).await;
    remote.forget(&session_id);

    let second = controller(dir.path(), &remote);
    let outcome = RecoveryValidator::new(second.clone()).run(false).await.unwrap();
    assert!(
        matches!(outcome, RecoveryOutcome::Discarded { session_id: ref id, .. } if *id == session_id)
    );
    assert!(second.snapshots().get().is_none());
    assert!(second.spool().indices(&session_id).is_empty());
    assert_eq!(second.status(), RecordingStatus::Idle);
}

#[tokio::test(start_paused = true)]
async fn corrupted_snapshot_means_nothing_to_recover() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("active-session.json"), b"{\"sessionId\":").unwrap();

    let remote = Arc::new(InMemoryRemote::new());
    let ctl = controller(dir.path(), &remote);
    let outcome = RecoveryValidator::new(ctl).run(true).await.unwrap();
    assert_eq!(outcome, RecoveryOutcome::NothingToRecover);
    assert!(!dir.path().join("active-session.json").exists());
}

#[tokio::test(start_paused = true)]
async fn chunk_spooled_but_not_snapshotted_keeps_its_index() {
    let dir = tempfile::tempdir().unwrap();
    let remote = Arc::new(InMemoryRemote::with_faults(FaultPlan {
        always_fail: [1, 2].into_iter().collect(),
        ..FaultPlan::default()
    }));
    let session_id = record_and_crash(dir.path(), &remote).await;
    remote.set_faults(FaultPlan::default());

    // The crash hit after chunk 3 reached the spool but before the snapshot
    // recorded it.
    let second = controller(dir.path(), &remote);
    second.spool().put(&session_id, 3, b"ORIGINAL-3").unwrap();
    let snap = second.snapshots().get().unwrap();
    assert_eq!(snap.chunk_count, 3);
    assert_eq!(snap.last_chunk_index, Some(2));

    let RecoveryOutcome::Restored(report) =
        RecoveryValidator::new(second.clone()).run(false).await.unwrap()
    else {
        panic!("expected the session to be restored");
    };
    assert_eq!(report.requeued, vec![1, 2, 3]);

    second.resume().unwrap();
    let next = second.on_chunk_ready(ChunkData::from(&b"NEW-SEGMENT"[..])).unwrap();
    assert_eq!(next, 4);

    let summary = second.stop(&ScriptedCapture::granted()).await.unwrap();
    assert_eq!(summary.status, RecordingStatus::Completed);
    assert_eq!(summary.chunk_count, 5);
    assert_eq!(summary.total_bytes, 96 + 10 + 11);

    let stored = remote.session(&session_id).unwrap();
    assert_eq!(stored.chunks.keys().copied().collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);
    assert_eq!(&stored.chunks[&3][..], b"ORIGINAL-3");
    assert_eq!(&stored.chunks[&4][..], b"NEW-SEGMENT");
    assert_eq!(stored.report.unwrap().chunk_count, 5);
}
