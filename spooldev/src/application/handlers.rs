use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use spool_core::clock::elapsed_between;
use spool_core::config::SpoolConfig;
use spool_core::domain::SessionSummary;
use spool_core::error::Result;
use spool_core::queue::events::{QueueEvent, QueueEventKind};
use spool_core::queue::task::ChunkData;
use spool_core::recovery::{RecoveryOutcome, RecoveryValidator};
use spool_core::remote::StartRequest;
use spool_core::remote::memory::{FaultPlan, InMemoryRemote};
use spool_core::session::capture::ScriptedCapture;
use spool_core::session::controller::RecordingController;
use spool_core::session::status::RecordingStatus;
use spool_core::storage_factory::{StorageBackend, open_storage};

/// Simulated network delay per upload, and the gap between segments.
const UPLOAD_LATENCY: Duration = Duration::from_millis(40);
const SEGMENT_INTERVAL: Duration = Duration::from_millis(25);

pub struct SimulationPlan {
    pub chunks: u32,
    pub chunk_size: usize,
    pub flaky: Vec<(u32, u32)>,
    pub broken: Vec<u32>,
    pub crash_after: Option<u32>,
    pub recover: bool,
}

/// Deterministic segment content so re-uploads are byte-identical.
fn segment(index: u32, size: usize) -> ChunkData {
    (0..size)
        .map(|i| (i as u32).wrapping_mul(31).wrapping_add(index) as u8)
        .collect::<Vec<u8>>()
        .into()
}

fn controller_for(
    config: &SpoolConfig,
    dir: &Path,
    remote: &Arc<InMemoryRemote>,
) -> Result<RecordingController<InMemoryRemote>> {
    let storage = open_storage(StorageBackend::Dir(dir.to_path_buf()), &config.snapshot)?;
    let controller = RecordingController::new(Arc::clone(remote), storage, config);
    let queue = controller.queue();
    queue.add_event_listener(QueueEventKind::ChunkCompleted, |ev| {
        if let QueueEvent::ChunkCompleted {
            chunk_index,
            attempts,
            ..
        } = ev
        {
            eprintln!("  chunk {chunk_index:>3} uploaded (attempts={attempts})");
        }
    });
    queue.add_event_listener(QueueEventKind::ChunkFailed, |ev| {
        if let QueueEvent::ChunkFailed {
            chunk_index, error, ..
        } = ev
        {
            eprintln!("  chunk {chunk_index:>3} FAILED: {error}");
        }
    });
    Ok(controller)
}

fn print_summary(label: &str, s: &SessionSummary) {
    eprintln!(
        "{label}: status={} chunks={} bytes={} uploaded={}/{} failed={} ({:.0}%)",
        s.status,
        s.chunk_count,
        s.total_bytes,
        s.progress.completed_chunks,
        s.progress.total_chunks,
        s.progress.failed_chunks,
        s.progress.percentage,
    );
    if let Some(err) = &s.last_error {
        eprintln!("{label}: last error: {err}");
    }
}

pub async fn handle_simulate(config: &SpoolConfig, dir: PathBuf, plan: SimulationPlan) -> Result<()> {
    let faults = FaultPlan {
        fail_first: plan.flaky.iter().copied().collect(),
        always_fail: plan.broken.iter().copied().collect(),
        latency: UPLOAD_LATENCY,
        ..FaultPlan::default()
    };
    let remote = Arc::new(InMemoryRemote::with_faults(faults));
    let controller = controller_for(config, &dir, &remote)?;

    let capture = ScriptedCapture::granted()
        .with_final_segment(segment(plan.chunks, plan.chunk_size / 2).to_vec());
    let request = StartRequest {
        title: "spooldev simulation".into(),
        ..StartRequest::default()
    };
    let session_id = controller.start(&capture, request).await?;
    eprintln!("session {session_id} recording into {}", dir.display());

    for index in 0..plan.chunks {
        if plan.crash_after == Some(index) {
            break;
        }
        controller.on_chunk_ready(segment(index, plan.chunk_size))?;
        tokio::time::sleep(SEGMENT_INTERVAL).await;
    }

    if plan.crash_after.is_none_or(|n| n >= plan.chunks) {
        let result = controller.stop(&capture).await;
        print_summary("done", &controller.summary());
        return result.map(|_| ());
    }

    // Simulated crash: in-flight uploads are abandoned and the controller is
    // dropped without stopping, so only the snapshot and spool survive.
    controller.queue().cancel_all();
    print_summary("crashed", &controller.summary());
    drop(controller);
    eprintln!("snapshot left in {}", dir.display());

    if !plan.recover {
        return Ok(());
    }

    let controller = controller_for(config, &dir, &remote)?;
    let validator = RecoveryValidator::new(controller.clone());
    match validator.run(true).await? {
        RecoveryOutcome::Restored(report) => {
            eprintln!(
                "recovered {}: resumed {} with {} chunk(s) re-armed, {} lost",
                report.session_id,
                report.status,
                report.requeued.len(),
                report.lost.len()
            );
            let result = if report.status == RecordingStatus::Paused {
                controller.stop(&ScriptedCapture::granted()).await
            } else {
                controller.finish_upload().await
            };
            print_summary("recovered", &controller.summary());
            result.map(|_| ())
        }
        other => {
            eprintln!("recovery: {other:?}");
            Ok(())
        }
    }
}

pub fn handle_snapshot_show(config: &SpoolConfig, dir: PathBuf) -> Result<()> {
    let storage = open_storage(StorageBackend::Dir(dir), &config.snapshot)?;
    let Some(state) = storage.snapshots.get() else {
        eprintln!("no persisted session");
        return Ok(());
    };
    let age = elapsed_between(state.persisted_at, storage.snapshots.now());
    println!("{}", serde_json::to_string_pretty(&state)?);
    eprintln!(
        "age={}s resumable={} auto_recover={} spooled={:?}",
        age.as_secs(),
        state.status.is_resumable(),
        age < config.snapshot.auto_recovery_threshold(),
        storage.spool.indices(&state.session_id)
    );
    Ok(())
}

pub fn handle_snapshot_clear(config: &SpoolConfig, dir: PathBuf) -> Result<()> {
    let storage = open_storage(StorageBackend::Dir(dir), &config.snapshot)?;
    match storage.snapshots.get() {
        Some(state) => {
            storage.spool.remove_session(&state.session_id)?;
            storage.snapshots.clear()?;
            eprintln!("cleared session {}", state.session_id);
        }
        None => {
            storage.snapshots.clear()?;
            eprintln!("no persisted session");
        }
    }
    Ok(())
}

pub fn handle_backoff(config: &SpoolConfig, retries: Option<u32>) -> Result<()> {
    let mut policy = config.queue.retry.clone();
    if let Some(r) = retries {
        policy.max_retries = r;
    }
    let mut total = Duration::ZERO;
    for (i, delay) in policy.schedule().into_iter().enumerate() {
        total += delay;
        println!("retry {:>2}: wait {:>6} ms", i + 1, delay.as_millis());
    }
    println!(
        "{} attempt(s) per chunk, worst case {} ms of backoff",
        policy.max_retries + 1,
        total.as_millis()
    );
    if policy.jitter {
        println!("jitter enabled: up to {} ms extra per retry", policy.base_delay_ms / 2);
    }
    Ok(())
}
