//! Recording session state machine.
//!
//! The controller owns the session identity and counters, spools each segment
//! before handing it to the upload queue, and keeps the snapshot slot in step
//! with every transition so an interrupted session can be picked up again.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use time::OffsetDateTime;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{ControllerConfig, SpoolConfig};
use crate::domain::{RecordingSettings, SessionSummary};
use crate::error::{Result, SpoolError};
use crate::queue::events::{QueueEvent, QueueEventKind};
use crate::queue::progress::UploadProgress;
use crate::queue::task::ChunkData;
use crate::queue::UploadQueue;
use crate::remote::{CompletionReport, RecordingRemote, StartRequest};
use crate::session::capture::{CaptureError, CaptureSource};
use crate::session::status::RecordingStatus;
use crate::storage::snapshot::{
    PersistedRecordingState, RecoverableSession, SnapshotPatch, SnapshotStore,
};
use crate::storage::spool::ChunkSpool;
use crate::storage_factory::Storage;

/// What `rehydrate` put back in motion.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RestoreReport {
    pub session_id: String,
    /// Status the controller resumed in.
    pub status: RecordingStatus,
    /// Chunks re-armed in the upload queue.
    pub requeued: Vec<u32>,
    /// Unconfirmed chunks whose payload was no longer spooled.
    pub lost: Vec<u32>,
}

struct SessionState {
    status: RecordingStatus,
    session_id: Option<String>,
    title: String,
    settings: RecordingSettings,
    metadata: BTreeMap<String, serde_json::Value>,
    start_time: Option<OffsetDateTime>,
    /// Recorded time not counting the current running stretch.
    elapsed: Duration,
    running_since: Option<Instant>,
    next_chunk_index: u32,
    chunk_count: u32,
    total_bytes: u64,
    last_error: Option<String>,
    last_snapshot_at: Option<Instant>,
}

impl SessionState {
    fn idle() -> Self {
        Self {
            status: RecordingStatus::Idle,
            session_id: None,
            title: String::new(),
            settings: RecordingSettings::default(),
            metadata: BTreeMap::new(),
            start_time: None,
            elapsed: Duration::ZERO,
            running_since: None,
            next_chunk_index: 0,
            chunk_count: 0,
            total_bytes: 0,
            last_error: None,
            last_snapshot_at: None,
        }
    }

    fn duration(&self) -> Duration {
        self.elapsed + self.running_since.map_or(Duration::ZERO, |at| at.elapsed())
    }

    /// Fold the running stretch into `elapsed`.
    fn freeze_clock(&mut self) {
        if let Some(at) = self.running_since.take() {
            self.elapsed += at.elapsed();
        }
    }

    fn transition(&mut self, to: RecordingStatus) -> Result<RecordingStatus> {
        if !self.status.can_transition_to(to) {
            return Err(SpoolError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        let from = std::mem::replace(&mut self.status, to);
        info!(session_id = ?self.session_id, %from, %to, "recording status changed");
        Ok(from)
    }

    fn patch(&self) -> SnapshotPatch {
        SnapshotPatch {
            status: Some(self.status),
            duration_seconds: Some(self.duration().as_secs()),
            chunk_count: Some(self.chunk_count),
            total_bytes: Some(self.total_bytes),
            last_chunk_index: self.next_chunk_index.checked_sub(1),
            ..SnapshotPatch::default()
        }
    }

    fn persisted(&self, session_id: &str, start_time: OffsetDateTime) -> PersistedRecordingState {
        let mut state = PersistedRecordingState::new(session_id, &self.title, start_time);
        state.status = self.status;
        state.duration_seconds = self.duration().as_secs();
        state.chunk_count = self.chunk_count;
        state.total_bytes = self.total_bytes;
        state.last_chunk_index = self.next_chunk_index.checked_sub(1);
        state.settings = self.settings.clone();
        state.metadata = self.metadata.clone();
        state
    }
}

struct ControllerInner<R: RecordingRemote> {
    remote: Arc<R>,
    queue: UploadQueue<R>,
    snapshots: SnapshotStore,
    spool: Arc<dyn ChunkSpool>,
    config: ControllerConfig,
    state: Mutex<SessionState>,
}

pub struct RecordingController<R: RecordingRemote> {
    inner: Arc<ControllerInner<R>>,
}

impl<R: RecordingRemote> Clone for RecordingController<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: RecordingRemote> RecordingController<R> {
    /// Must be called from within a tokio runtime.
    pub fn new(remote: Arc<R>, storage: Storage, config: &SpoolConfig) -> Self {
        let queue = UploadQueue::new(Arc::clone(&remote), config.queue.clone());
        let inner = Arc::new(ControllerInner {
            remote,
            queue,
            snapshots: storage.snapshots,
            spool: storage.spool,
            config: config.controller.clone(),
            state: Mutex::new(SessionState::idle()),
        });

        let weak: Weak<ControllerInner<R>> = Arc::downgrade(&inner);
        inner
            .queue
            .add_event_listener(QueueEventKind::ChunkCompleted, move |ev| {
                if let (Some(inner), QueueEvent::ChunkCompleted { session_id, chunk_index, .. }) =
                    (weak.upgrade(), ev)
                {
                    inner.chunk_confirmed(session_id, *chunk_index);
                }
            });
        let weak: Weak<ControllerInner<R>> = Arc::downgrade(&inner);
        inner
            .queue
            .add_event_listener(QueueEventKind::Progress, move |ev| {
                if let (Some(inner), QueueEvent::Progress(progress)) = (weak.upgrade(), ev) {
                    inner.progress_tick(progress);
                }
            });

        Self { inner }
    }

    pub fn queue(&self) -> &UploadQueue<R> {
        &self.inner.queue
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.inner.snapshots
    }

    pub fn spool(&self) -> &Arc<dyn ChunkSpool> {
        &self.inner.spool
    }

    pub fn remote(&self) -> &Arc<R> {
        &self.inner.remote
    }

    pub fn status(&self) -> RecordingStatus {
        self.inner.lock().status
    }

    pub fn session_id(&self) -> Option<String> {
        self.inner.lock().session_id.clone()
    }

    pub fn summary(&self) -> SessionSummary {
        let (session_id, mut summary) = {
            let st = self.inner.lock();
            (
                st.session_id.clone(),
                SessionSummary {
                    session_id: st.session_id.clone(),
                    status: st.status,
                    duration_seconds: st.duration().as_secs(),
                    chunk_count: st.chunk_count,
                    total_bytes: st.total_bytes,
                    progress: UploadProgress::default(),
                    last_error: st.last_error.clone(),
                },
            )
        };
        if let Some(id) = session_id {
            summary.progress = self.inner.queue.progress_for(&id);
        }
        summary
    }

    /// Ask for capture permission, open a remote session and start recording.
    ///
    /// A denied permission leaves the controller `failed` and does not touch a
    /// previously persisted snapshot.
    pub async fn start<C: CaptureSource>(&self, capture: &C, request: StartRequest) -> Result<String> {
        let previous = {
            let mut st = self.inner.lock();
            st.transition(RecordingStatus::RequestingPermission)?;
            st.last_error = None;
            st.session_id.take()
        };
        if let Some(previous) = previous {
            self.inner.queue.cancel_all();
            if let Err(e) = self.inner.spool.remove_session(&previous) {
                warn!(session_id = %previous, error = %e, "failed to drop previous spool");
            }
        }

        if let Err(e) = capture.request_permission().await {
            let err = match e {
                CaptureError::PermissionDenied(reason) => SpoolError::PermissionDenied(reason),
                other => SpoolError::Capture(other),
            };
            self.inner.fail_with(&err.to_string());
            return Err(err);
        }

        let session_id = match self.inner.remote.start_session(&request).await {
            Ok(id) => id,
            Err(e) => {
                let err = SpoolError::Remote(e);
                self.inner.fail_with(&err.to_string());
                return Err(err);
            }
        };

        let start_time = self.inner.snapshots.now();
        let persisted = {
            let mut st = self.inner.lock();
            st.transition(RecordingStatus::Recording)?;
            *st = SessionState {
                status: RecordingStatus::Recording,
                session_id: Some(session_id.clone()),
                title: request.title.clone(),
                settings: request.settings.clone(),
                metadata: request.metadata.clone(),
                start_time: Some(start_time),
                running_since: Some(Instant::now()),
                last_snapshot_at: Some(Instant::now()),
                ..SessionState::idle()
            };
            st.persisted(&session_id, start_time)
        };
        if let Err(e) = self.inner.snapshots.save(&persisted) {
            warn!(session_id = %session_id, error = %e, "initial snapshot not saved");
        }
        info!(session_id = %session_id, title = %request.title, "recording started");
        Ok(session_id)
    }

    /// Accept the next finished segment. Returns the index it was given.
    pub fn on_chunk_ready(&self, data: ChunkData) -> Result<u32> {
        let (session_id, chunk_index) = {
            let mut st = self.inner.lock();
            if !matches!(st.status, RecordingStatus::Recording | RecordingStatus::Stopping) {
                return Err(SpoolError::NotAccepting(st.status));
            }
            let session_id = st.session_id.clone().ok_or(SpoolError::NoActiveSession)?;
            let chunk_index = st.next_chunk_index;
            st.next_chunk_index += 1;
            st.chunk_count += 1;
            st.total_bytes += data.len() as u64;
            (session_id, chunk_index)
        };

        if let Err(e) = self.inner.spool.put(&session_id, chunk_index, &data) {
            warn!(session_id = %session_id, chunk_index, error = %e, "chunk not spooled; upload continues without a durable copy");
        }
        self.inner.queue.add_chunk(&session_id, chunk_index, data);
        debug!(session_id = %session_id, chunk_index, "chunk handed to queue");

        self.inner.persist(SnapshotPatch::default());
        Ok(chunk_index)
    }

    pub fn pause(&self) -> Result<()> {
        {
            let mut st = self.inner.lock();
            st.transition(RecordingStatus::Paused)?;
            st.freeze_clock();
        }
        self.inner.persist(SnapshotPatch::default());
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        {
            let mut st = self.inner.lock();
            st.transition(RecordingStatus::Recording)?;
            st.running_since = Some(Instant::now());
        }
        self.inner.persist(SnapshotPatch::default());
        Ok(())
    }

    /// Stop capture, flush its final segment and wait for the upload to finish.
    pub async fn stop<C: CaptureSource>(&self, capture: &C) -> Result<SessionSummary> {
        {
            let mut st = self.inner.lock();
            st.transition(RecordingStatus::Stopping)?;
            st.freeze_clock();
        }
        self.inner.persist(SnapshotPatch::default());

        match capture.finish().await {
            Ok(Some(segment)) if !segment.is_empty() => {
                self.on_chunk_ready(ChunkData::from(segment))?;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "capture did not flush its final segment");
                self.inner.lock().last_error = Some(e.to_string());
            }
        }

        self.inner.lock().transition(RecordingStatus::Uploading)?;
        self.inner.persist(SnapshotPatch::default());
        self.finish_upload().await
    }

    /// Wait for the queue to settle and close out the remote session.
    ///
    /// The snapshot is cleared once `complete_session` succeeds. When chunks
    /// failed, completion is still attempted with what arrived, the controller
    /// ends `failed`, and the failed payloads stay spooled for
    /// [`retry_failed_uploads`](Self::retry_failed_uploads).
    pub async fn finish_upload(&self) -> Result<SessionSummary> {
        let session_id = {
            let st = self.inner.lock();
            if st.status != RecordingStatus::Uploading {
                return Err(SpoolError::InvalidTransition {
                    from: st.status,
                    to: RecordingStatus::Completed,
                });
            }
            st.session_id.clone().ok_or(SpoolError::NoActiveSession)?
        };

        self.inner.queue.wait_drained().await;

        let queue = &self.inner.queue;
        let failed = queue.failed_indices(&session_id);
        let unconfirmed = queue.unconfirmed_indices(&session_id);
        if unconfirmed.len() > failed.len() {
            // The queue was cancelled underneath us.
            return Err(SpoolError::Cancelled);
        }

        let progress = queue.progress_for(&session_id);
        let report = {
            let st = self.inner.lock();
            CompletionReport {
                duration_seconds: st.duration().as_secs(),
                total_bytes: st.total_bytes,
                chunk_count: st.chunk_count,
                uploaded_chunks: progress.completed_chunks,
                failed_chunks: failed.clone(),
                metadata: st.metadata.clone(),
            }
        };
        // Final pre-completion snapshot.
        self.inner.persist(SnapshotPatch {
            upload_progress: Some(progress),
            ..SnapshotPatch::default()
        });

        let completed = self.inner.remote.complete_session(&session_id, &report).await;
        match &completed {
            Ok(()) => {
                if let Err(e) = self.inner.snapshots.clear() {
                    warn!(session_id = %session_id, error = %e, "snapshot not cleared after completion");
                }
                if failed.is_empty() {
                    if let Err(e) = self.inner.spool.remove_session(&session_id) {
                        warn!(session_id = %session_id, error = %e, "spool not removed after completion");
                    }
                }
            }
            Err(e) => warn!(session_id = %session_id, error = %e, "remote session not completed; snapshot kept"),
        }

        if failed.is_empty() {
            match completed {
                Ok(()) => {
                    self.inner.lock().transition(RecordingStatus::Completed)?;
                    info!(session_id = %session_id, chunks = report.chunk_count, bytes = report.total_bytes, "recording completed");
                    Ok(self.summary())
                }
                Err(e) => {
                    let err = SpoolError::Remote(e);
                    self.inner.fail_with(&err.to_string());
                    Err(err)
                }
            }
        } else {
            self.inner
                .fail_with(&format!("{} chunk(s) failed to upload", failed.len()));
            Err(SpoolError::UploadIncomplete { failed })
        }
    }

    /// Re-arm the failed chunks of a `failed` session and wait for them.
    ///
    /// When every chunk arrived but `complete_session` itself failed, the
    /// snapshot is still held as `uploading` and only completion is retried.
    pub async fn retry_failed_uploads(&self) -> Result<SessionSummary> {
        let session_id = self.session_id().ok_or(SpoolError::NoActiveSession)?;
        let failed = self.inner.queue.failed_indices(&session_id);
        let completion_pending = failed.is_empty()
            && self.inner.snapshots.get().is_some_and(|s| {
                s.session_id == session_id && s.status == RecordingStatus::Uploading
            });
        let persisted = {
            let mut st = self.inner.lock();
            let start_time = st.start_time.ok_or(SpoolError::NoActiveSession)?;
            let retryable = st.session_id.as_deref() == Some(session_id.as_str())
                && (!failed.is_empty() || completion_pending);
            if !retryable {
                return Err(SpoolError::InvalidTransition {
                    from: st.status,
                    to: RecordingStatus::Uploading,
                });
            }
            st.transition(RecordingStatus::Uploading)?;
            st.last_error = None;
            let mut persisted = st.persisted(&session_id, start_time);
            persisted.pending_chunks = self.inner.queue.unconfirmed_indices(&session_id);
            persisted
        };
        // Completion may already have cleared the slot, so write it whole.
        if let Err(e) = self.inner.snapshots.save(&persisted) {
            warn!(session_id = %persisted.session_id, error = %e, "retry snapshot not saved");
        }
        if failed.is_empty() {
            info!(session_id = %session_id, "retrying session completion");
        } else {
            let reset = self.inner.queue.retry_failed();
            info!(session_id = %session_id, reset, "manual retry of failed chunks");
        }
        self.finish_upload().await
    }

    /// Mark the session unrecoverable: uploads stop and local state is dropped.
    pub fn fail(&self, message: &str) -> Result<()> {
        let session_id = {
            let mut st = self.inner.lock();
            st.transition(RecordingStatus::Failed)?;
            st.freeze_clock();
            st.last_error = Some(message.to_string());
            st.session_id.clone()
        };
        warn!(session_id = ?session_id, message, "recording failed");
        self.inner.queue.cancel_all();
        self.inner.drop_local(session_id.as_deref());
        Ok(())
    }

    /// Throw away the current session, or the persisted one when idle, and
    /// return to `idle`.
    pub fn dismiss(&self) {
        let current = std::mem::replace(&mut *self.inner.lock(), SessionState::idle()).session_id;
        let persisted = self.inner.snapshots.get().map(|s| s.session_id);
        self.inner.queue.cancel_all();
        self.inner.drop_local(current.as_deref());
        if persisted != current {
            self.inner.drop_local(persisted.as_deref());
        }
        info!(session_id = ?current.or(persisted), "session dismissed");
    }

    /// Take over a validated snapshot. Interrupted recordings resume `paused`;
    /// interrupted uploads resume `uploading` and should be followed by
    /// [`finish_upload`](Self::finish_upload).
    pub fn rehydrate(&self, recovered: &RecoverableSession) -> Result<RestoreReport> {
        let snap = &recovered.state;
        let status = match snap.status {
            RecordingStatus::Recording | RecordingStatus::Paused => RecordingStatus::Paused,
            RecordingStatus::Stopping | RecordingStatus::Uploading => RecordingStatus::Uploading,
            other => {
                return Err(SpoolError::InvalidTransition {
                    from: other,
                    to: RecordingStatus::Uploading,
                });
            }
        };

        let current = self.status();
        if current != RecordingStatus::Idle {
            return Err(SpoolError::InvalidTransition { from: current, to: status });
        }

        let candidates: BTreeSet<u32> = self
            .inner
            .spool
            .indices(&snap.session_id)
            .into_iter()
            .chain(snap.pending_chunks.iter().copied())
            .collect();
        let mut payloads = Vec::new();
        let mut lost = Vec::new();
        for index in candidates {
            match self.inner.spool.get(&snap.session_id, index) {
                Some(data) => payloads.push((index, data)),
                None => {
                    warn!(session_id = %snap.session_id, chunk_index = index, "unconfirmed chunk has no spooled payload");
                    lost.push(index);
                }
            }
        }

        // A crash between spooling a chunk and recording it in the snapshot
        // leaves chunks past the snapshot's counters. Count them, and never
        // hand out an index that is already spooled or pending.
        let recorded_next = snap
            .last_chunk_index
            .map_or(snap.chunk_count, |i| (i + 1).max(snap.chunk_count));
        let mut chunk_count = snap.chunk_count;
        let mut total_bytes = snap.total_bytes;
        for (index, data) in &payloads {
            if *index >= recorded_next {
                chunk_count += 1;
                total_bytes += data.len() as u64;
            }
        }
        let next_chunk_index = payloads
            .iter()
            .map(|(index, _)| index + 1)
            .chain(lost.iter().map(|index| index + 1))
            .fold(recorded_next, u32::max);
        if next_chunk_index > recorded_next {
            info!(
                session_id = %snap.session_id,
                recorded_next,
                next_chunk_index,
                "spool holds chunks the snapshot never recorded"
            );
        }

        {
            let mut st = self.inner.lock();
            if st.status != RecordingStatus::Idle {
                return Err(SpoolError::InvalidTransition { from: st.status, to: status });
            }
            *st = SessionState {
                status,
                session_id: Some(snap.session_id.clone()),
                title: snap.title.clone(),
                settings: snap.settings.clone(),
                metadata: snap.metadata.clone(),
                start_time: Some(snap.start_time),
                elapsed: Duration::from_secs(snap.duration_seconds),
                next_chunk_index,
                chunk_count,
                total_bytes,
                last_snapshot_at: Some(Instant::now()),
                ..SessionState::idle()
            };
        }

        let mut requeued = Vec::with_capacity(payloads.len());
        for (index, data) in payloads {
            self.inner.queue.add_chunk(&snap.session_id, index, data);
            requeued.push(index);
        }

        let persisted = {
            let mut persisted = self.inner.lock().persisted(&snap.session_id, snap.start_time);
            persisted.pending_chunks = self.inner.queue.unconfirmed_indices(&snap.session_id);
            persisted
        };
        if let Err(e) = self.inner.snapshots.save(&persisted) {
            warn!(session_id = %snap.session_id, error = %e, "rehydrated snapshot not saved");
        }
        info!(
            session_id = %snap.session_id,
            %status,
            requeued = requeued.len(),
            lost = lost.len(),
            "session rehydrated"
        );
        Ok(RestoreReport {
            session_id: snap.session_id.clone(),
            status,
            requeued,
            lost,
        })
    }
}

impl<R: RecordingRemote> ControllerInner<R> {
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Write the live session view over the persisted one, then `extra`.
    /// Counters and the pending set are read while the slot is held, so a
    /// writer on another thread cannot land an older view over a newer one.
    fn persist(&self, extra: SnapshotPatch) {
        let Some(session_id) = self.lock().session_id.clone() else {
            return;
        };
        let result = self.snapshots.update_with(|state| {
            self.lock().patch().apply(state);
            state.pending_chunks = self.queue.unconfirmed_indices(&session_id);
            extra.apply(state);
        });
        if let Err(e) = result {
            warn!(session_id = %session_id, error = %e, "snapshot update failed");
        }
    }

    /// Move to `failed` if the current status allows it, recording `message`.
    fn fail_with(&self, message: &str) {
        let mut st = self.lock();
        if st.status.can_transition_to(RecordingStatus::Failed) {
            let _ = st.transition(RecordingStatus::Failed);
            st.freeze_clock();
        }
        st.last_error = Some(message.to_string());
    }

    fn drop_local(&self, session_id: Option<&str>) {
        if let Err(e) = self.snapshots.clear() {
            warn!(error = %e, "snapshot not cleared");
        }
        if let Some(id) = session_id {
            if let Err(e) = self.spool.remove_session(id) {
                warn!(session_id = %id, error = %e, "spool not removed");
            }
        }
    }

    /// The remote has a chunk: record that, then let go of the local copy.
    fn chunk_confirmed(&self, session_id: &str, chunk_index: u32) {
        let current = self.lock().session_id.as_deref() == Some(session_id);
        if current {
            self.persist(SnapshotPatch::default());
        }
        if let Err(e) = self.spool.remove(session_id, chunk_index) {
            warn!(session_id, chunk_index, error = %e, "confirmed chunk left in spool");
        }
    }

    fn progress_tick(&self, progress: &UploadProgress) {
        let patch = {
            let mut st = self.lock();
            if !st.status.is_resumable() {
                return;
            }
            let due = st
                .last_snapshot_at
                .is_none_or(|at| at.elapsed() >= self.config.snapshot_interval());
            if !due {
                return;
            }
            st.last_snapshot_at = Some(Instant::now());
            SnapshotPatch {
                upload_progress: Some(progress.clone()),
                ..SnapshotPatch::default()
            }
        };
        self.persist(patch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::memory::{FaultPlan, InMemoryRemote};
    use crate::session::capture::ScriptedCapture;
    use crate::storage_factory::{StorageBackend, open_storage};

    fn controller(remote: InMemoryRemote) -> RecordingController<InMemoryRemote> {
        let config = SpoolConfig::default();
        let storage = open_storage(StorageBackend::Memory, &config.snapshot).unwrap();
        RecordingController::new(Arc::new(remote), storage, &config)
    }

    fn request(title: &str) -> StartRequest {
        StartRequest {
            title: title.into(),
            ..StartRequest::default()
        }
    }

    fn chunk(byte: u8, n: usize) -> ChunkData {
        ChunkData::from(vec![byte; n])
    }

    #[tokio::test(start_paused = true)]
    async fn happy_path_completes_and_clears_snapshot() {
        let ctl = controller(InMemoryRemote::new());
        let capture = ScriptedCapture::granted().with_final_segment(vec![9; 4]);
        let id = ctl.start(&capture, request("Month-end close")).await.unwrap();
        assert_eq!(ctl.status(), RecordingStatus::Recording);
        assert_eq!(ctl.snapshots().get().unwrap().session_id, id);

        assert_eq!(ctl.on_chunk_ready(chunk(1, 10)).unwrap(), 0);
        assert_eq!(ctl.on_chunk_ready(chunk(2, 10)).unwrap(), 1);

        let summary = ctl.stop(&capture).await.unwrap();
        assert_eq!(summary.status, RecordingStatus::Completed);
        assert_eq!(summary.chunk_count, 3);
        assert_eq!(summary.total_bytes, 24);
        assert_eq!(summary.progress.completed_chunks, 3);

        assert!(ctl.snapshots().get().is_none());
        assert!(ctl.spool().indices(&id).is_empty());
        let stored = ctl.remote().session(&id).unwrap();
        let report = stored.report.unwrap();
        assert_eq!(report.chunk_count, 3);
        assert_eq!(report.uploaded_chunks, 3);
        assert!(report.failed_chunks.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn no_chunks_accepted_while_paused() {
        let ctl = controller(InMemoryRemote::new());
        let capture = ScriptedCapture::granted();
        ctl.start(&capture, request("t")).await.unwrap();
        ctl.pause().unwrap();
        assert!(matches!(
            ctl.on_chunk_ready(chunk(0, 1)),
            Err(SpoolError::NotAccepting(RecordingStatus::Paused))
        ));
        assert_eq!(
            ctl.snapshots().get().unwrap().status,
            RecordingStatus::Paused
        );
        ctl.resume().unwrap();
        assert_eq!(ctl.on_chunk_ready(chunk(0, 1)).unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn paused_time_is_not_counted() {
        let ctl = controller(InMemoryRemote::new());
        let capture = ScriptedCapture::granted();
        ctl.start(&capture, request("t")).await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        ctl.pause().unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        ctl.resume().unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(ctl.summary().duration_seconds, 15);
    }

    #[tokio::test(start_paused = true)]
    async fn permission_denied_keeps_prior_snapshot() {
        let ctl = controller(InMemoryRemote::new());
        let prior = PersistedRecordingState::new("older", "earlier attempt", ctl.snapshots().now());
        ctl.snapshots().save(&prior).unwrap();

        let err = ctl
            .start(&ScriptedCapture::denied("user said no"), request("t"))
            .await
            .unwrap_err();
        assert!(matches!(err, SpoolError::PermissionDenied(_)));
        assert_eq!(ctl.status(), RecordingStatus::Failed);
        assert!(ctl.summary().last_error.unwrap().contains("user said no"));
        assert_eq!(ctl.snapshots().get().unwrap().session_id, "older");
    }

    #[tokio::test(start_paused = true)]
    async fn partial_failure_completes_remote_then_retries() {
        let mut faults = FaultPlan::default();
        faults.always_fail.insert(1);
        let ctl = controller(InMemoryRemote::with_faults(faults));
        let capture = ScriptedCapture::granted();
        let id = ctl.start(&capture, request("t")).await.unwrap();
        for i in 0..3 {
            ctl.on_chunk_ready(chunk(i, 5)).unwrap();
        }

        let err = ctl.stop(&capture).await.unwrap_err();
        assert!(matches!(err, SpoolError::UploadIncomplete { ref failed } if failed == &vec![1]));
        assert_eq!(ctl.status(), RecordingStatus::Failed);
        let report = ctl.remote().session(&id).unwrap().report.unwrap();
        assert_eq!(report.failed_chunks, vec![1]);
        assert_eq!(report.uploaded_chunks, 2);
        // Only the failed payload is still spooled.
        assert_eq!(ctl.spool().indices(&id), vec![1]);

        ctl.remote().set_faults(FaultPlan::default());
        let summary = ctl.retry_failed_uploads().await.unwrap();
        assert_eq!(summary.status, RecordingStatus::Completed);
        assert_eq!(ctl.remote().stored_indices(&id), vec![0, 1, 2]);
        assert!(ctl.spool().indices(&id).is_empty());
        assert!(ctl.snapshots().get().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_complete_keeps_snapshot() {
        let faults = FaultPlan {
            complete_unavailable: true,
            ..FaultPlan::default()
        };
        let ctl = controller(InMemoryRemote::with_faults(faults));
        let capture = ScriptedCapture::granted();
        let id = ctl.start(&capture, request("t")).await.unwrap();
        ctl.on_chunk_ready(chunk(1, 3)).unwrap();

        assert!(matches!(ctl.stop(&capture).await, Err(SpoolError::Remote(_))));
        let snap = ctl.snapshots().get().unwrap();
        assert_eq!(snap.session_id, id);
        assert_eq!(snap.status, RecordingStatus::Uploading);
        assert!(snap.pending_chunks.is_empty());

        ctl.remote().set_faults(FaultPlan::default());
        let summary = ctl.retry_failed_uploads().await.unwrap();
        assert_eq!(summary.status, RecordingStatus::Completed);
        assert!(ctl.remote().session(&id).unwrap().report.is_some());
        assert!(ctl.snapshots().get().is_none());
        assert!(ctl.spool().indices(&id).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn retry_without_anything_pending_is_rejected() {
        let ctl = controller(InMemoryRemote::new());
        let capture = ScriptedCapture::granted();
        ctl.start(&capture, request("t")).await.unwrap();
        ctl.pause().unwrap();
        ctl.fail("disk full").unwrap();
        assert!(matches!(
            ctl.retry_failed_uploads().await,
            Err(SpoolError::InvalidTransition {
                from: RecordingStatus::Failed,
                to: RecordingStatus::Uploading
            })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn snapshot_keeps_up_with_writers_on_other_threads() {
        let ctl = controller(InMemoryRemote::new());
        let capture = ScriptedCapture::granted();
        let id = ctl.start(&capture, request("t")).await.unwrap();

        let mut writers = tokio::task::JoinSet::new();
        for w in 0..4u8 {
            let ctl = ctl.clone();
            writers.spawn(async move {
                for _ in 0..10 {
                    ctl.on_chunk_ready(chunk(w, 8)).unwrap();
                    tokio::task::yield_now().await;
                }
            });
        }
        while let Some(joined) = writers.join_next().await {
            joined.unwrap();
        }
        ctl.queue().wait_drained().await;

        let snap = ctl.snapshots().get().unwrap();
        assert_eq!(snap.chunk_count, 40);
        assert_eq!(snap.total_bytes, 320);
        assert_eq!(snap.last_chunk_index, Some(39));
        assert!(snap.pending_chunks.is_empty());
        assert_eq!(ctl.remote().stored_indices(&id).len(), 40);
    }

    #[tokio::test(start_paused = true)]
    async fn new_session_after_completion_resets() {
        let ctl = controller(InMemoryRemote::new());
        let capture = ScriptedCapture::granted();
        let first = ctl.start(&capture, request("one")).await.unwrap();
        ctl.on_chunk_ready(chunk(1, 1)).unwrap();
        ctl.stop(&capture).await.unwrap();

        let second = ctl.start(&capture, request("two")).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(ctl.on_chunk_ready(chunk(1, 1)).unwrap(), 0);
        let summary = ctl.stop(&capture).await.unwrap();
        assert_eq!(summary.chunk_count, 1);
        assert_eq!(summary.status, RecordingStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_transitions_are_rejected() {
        let ctl = controller(InMemoryRemote::new());
        assert!(matches!(
            ctl.pause(),
            Err(SpoolError::InvalidTransition {
                from: RecordingStatus::Idle,
                to: RecordingStatus::Paused
            })
        ));
        assert!(ctl.finish_upload().await.is_err());
        assert!(ctl.fail("boom").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn fail_drops_local_state() {
        let ctl = controller(InMemoryRemote::new());
        let capture = ScriptedCapture::granted();
        let id = ctl.start(&capture, request("t")).await.unwrap();
        ctl.pause().unwrap();
        ctl.fail("disk full").unwrap();
        assert_eq!(ctl.status(), RecordingStatus::Failed);
        assert!(ctl.snapshots().get().is_none());
        assert!(ctl.spool().indices(&id).is_empty());
    }
}
