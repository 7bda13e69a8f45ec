//! Bounded-concurrency chunk upload queue.
//!
//! One scheduler task per processing run (guarded by `is_processing`) selects
//! eligible chunks, keeps at most `concurrency` attempts in a `JoinSet`, and
//! applies the retry policy when an attempt fails or times out. New chunks and
//! retries re-enter the same run through `wake` instead of starting a second
//! scheduler.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::{Notify, watch};
use tokio::task::{AbortHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::QueueConfig;
use crate::remote::{ChunkUploader, UploadError};

pub mod events;
pub mod progress;
pub mod task;

use events::{Listeners, ListenerId, QueueEvent, QueueEventKind, dispatch};
use progress::{ThroughputWindow, UploadProgress, summarize};
use task::{ChunkData, ChunkUploadTask, TaskId, TaskStatus, TaskView};

/// How a processing run ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueueOutcome {
    Completed,
    Failed { failed: Vec<TaskId> },
    Cancelled,
}

#[derive(Clone, Debug)]
struct DrainState {
    running: bool,
    outcome: QueueOutcome,
}

type TaskKey = (String, u32);

struct QueueState {
    tasks: BTreeMap<TaskKey, ChunkUploadTask>,
    active: HashSet<TaskKey>,
    is_processing: bool,
    /// Bumped by `cancel_all`; stale scheduler runs stop when it changes.
    generation: u64,
    worker: Option<AbortHandle>,
    throughput: ThroughputWindow,
}

struct Shared<U> {
    uploader: Arc<U>,
    config: QueueConfig,
    state: Mutex<QueueState>,
    listeners: Mutex<Listeners>,
    wake: Notify,
    drained: watch::Sender<DrainState>,
}

struct Job {
    key: TaskKey,
    session_id: String,
    chunk_index: u32,
    data: ChunkData,
}

struct AttemptResult {
    key: TaskKey,
    result: Result<(), UploadError>,
    took: Duration,
}

enum Step {
    Stop,
    Finished(Vec<QueueEvent>),
    Continue {
        jobs: Vec<Job>,
        next_retry: Option<Instant>,
    },
}

pub struct UploadQueue<U: ChunkUploader> {
    shared: Arc<Shared<U>>,
}

impl<U: ChunkUploader> Clone for UploadQueue<U> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<U: ChunkUploader> UploadQueue<U> {
    pub fn new(uploader: Arc<U>, mut config: QueueConfig) -> Self {
        config.concurrency = config.concurrency.max(1);
        let (drained, _) = watch::channel(DrainState {
            running: false,
            outcome: QueueOutcome::Completed,
        });
        let state = QueueState {
            tasks: BTreeMap::new(),
            active: HashSet::new(),
            is_processing: false,
            generation: 0,
            worker: None,
            throughput: ThroughputWindow::new(config.throughput_window),
        };
        Self {
            shared: Arc::new(Shared {
                uploader,
                config,
                state: Mutex::new(state),
                listeners: Mutex::new(Listeners::default()),
                wake: Notify::new(),
                drained,
            }),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.shared.config
    }

    /// Enqueue a chunk and start processing if the queue is idle. Re-adding a
    /// known `(session_id, chunk_index)` is a no-op returning the existing id.
    ///
    /// Must be called from within a tokio runtime.
    pub fn add_chunk(&self, session_id: &str, chunk_index: u32, chunk_data: ChunkData) -> TaskId {
        let key = (session_id.to_string(), chunk_index);
        let mut st = self.shared.lock_state();
        if let Some(existing) = st.tasks.get(&key) {
            debug!(task_id = %existing.id, status = ?existing.status, "chunk already queued");
            return existing.id.clone();
        }

        let task = ChunkUploadTask::new(session_id, chunk_index, chunk_data);
        let id = task.id.clone();
        debug!(task_id = %id, bytes = task.size(), "chunk enqueued");
        st.tasks.insert(key, task);
        self.shared.kick(&mut st);
        id
    }

    pub fn get_progress(&self) -> UploadProgress {
        let st = self.shared.lock_state();
        summarize(st.tasks.values(), &st.throughput)
    }

    pub fn progress_for(&self, session_id: &str) -> UploadProgress {
        let st = self.shared.lock_state();
        summarize(
            st.tasks.values().filter(|t| t.session_id == session_id),
            &st.throughput,
        )
    }

    pub fn tasks(&self) -> Vec<TaskView> {
        let st = self.shared.lock_state();
        st.tasks.values().map(ChunkUploadTask::view).collect()
    }

    /// Indices of the session's chunks that have not been confirmed uploaded.
    pub fn unconfirmed_indices(&self, session_id: &str) -> Vec<u32> {
        self.indices_where(session_id, |s| s != TaskStatus::Completed)
    }

    pub fn failed_indices(&self, session_id: &str) -> Vec<u32> {
        self.indices_where(session_id, |s| s == TaskStatus::Failed)
    }

    fn indices_where(&self, session_id: &str, pred: impl Fn(TaskStatus) -> bool) -> Vec<u32> {
        let st = self.shared.lock_state();
        st.tasks
            .values()
            .filter(|t| t.session_id == session_id && pred(t.status))
            .map(|t| t.chunk_index)
            .collect()
    }

    pub fn is_processing(&self) -> bool {
        self.shared.lock_state().is_processing
    }

    /// Reset every failed chunk to pending with a fresh retry budget and
    /// restart processing. Returns how many chunks were reset.
    pub fn retry_failed(&self) -> usize {
        let mut guard = self.shared.lock_state();
        let st = &mut *guard;
        let mut reset = 0;
        for t in st.tasks.values_mut().filter(|t| t.status == TaskStatus::Failed) {
            t.status = TaskStatus::Pending;
            t.retry_count = 0;
            t.retry_at = None;
            reset += 1;
        }
        if reset > 0 {
            info!(reset, "retrying failed chunks");
            self.shared.kick(st);
        }
        reset
    }

    /// Drop completed tasks. Pending, uploading and failed tasks are kept.
    pub fn prune_completed(&self) -> usize {
        let mut st = self.shared.lock_state();
        let before = st.tasks.len();
        st.tasks.retain(|_, t| t.status != TaskStatus::Completed);
        before - st.tasks.len()
    }

    /// Clear everything immediately. In-flight uploads are abandoned, not awaited.
    pub fn cancel_all(&self) {
        let mut st = self.shared.lock_state();
        st.generation += 1;
        if let Some(worker) = st.worker.take() {
            worker.abort();
        }
        let dropped = st.tasks.len();
        st.tasks.clear();
        st.active.clear();
        st.throughput.clear();
        st.is_processing = false;
        self.shared.drained.send_replace(DrainState {
            running: false,
            outcome: QueueOutcome::Cancelled,
        });
        info!(dropped, "upload queue cancelled");
    }

    pub fn add_event_listener<F>(&self, kind: QueueEventKind, listener: F) -> ListenerId
    where
        F: Fn(&QueueEvent) + Send + Sync + 'static,
    {
        self.shared
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .add(kind, Arc::new(listener))
    }

    pub fn remove_event_listener(&self, id: ListenerId) -> bool {
        self.shared
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
    }

    /// Wait until the current processing run reaches its terminal signal
    /// (the same point `queue_completed` / `queue_failed` is emitted).
    /// Returns immediately when the queue is idle.
    pub async fn wait_drained(&self) -> QueueOutcome {
        let mut rx = self.shared.drained.subscribe();
        match rx.wait_for(|d| !d.running).await {
            Ok(d) => d.outcome.clone(),
            Err(_) => QueueOutcome::Cancelled,
        }
    }
}

impl<U: ChunkUploader> Shared<U> {
    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start a scheduler run, or nudge the one already running.
    fn kick(self: &Arc<Self>, st: &mut QueueState) {
        if st.is_processing {
            self.wake.notify_one();
            return;
        }
        st.is_processing = true;
        self.drained.send_modify(|d| d.running = true);
        let handle = tokio::spawn(Arc::clone(self).run(st.generation));
        st.worker = Some(handle.abort_handle());
    }

    async fn run(self: Arc<Self>, generation: u64) {
        let mut in_flight: JoinSet<AttemptResult> = JoinSet::new();
        let mut running: HashMap<tokio::task::Id, TaskKey> = HashMap::new();
        let timeout = self.config.task_timeout();

        loop {
            let (jobs, next_retry) = match self.plan(generation) {
                Step::Stop => return,
                Step::Finished(events) => {
                    dispatch(&self.listeners, events);
                    return;
                }
                Step::Continue { jobs, next_retry } => (jobs, next_retry),
            };

            for job in jobs {
                let key = job.key.clone();
                let handle = in_flight.spawn(attempt(Arc::clone(&self.uploader), job, timeout));
                running.insert(handle.id(), key);
            }

            let deadline = next_retry.unwrap_or_else(|| Instant::now() + timeout);
            let mut events = tokio::select! {
                Some(joined) = in_flight.join_next_with_id() => match joined {
                    Ok((id, outcome)) => {
                        running.remove(&id);
                        self.settle(generation, outcome)
                    }
                    Err(err) => match running.remove(&err.id()) {
                        Some(key) => {
                            warn!(error = %err, "upload attempt panicked");
                            let outcome = AttemptResult {
                                key,
                                result: Err(UploadError::Aborted(err.to_string())),
                                took: Duration::ZERO,
                            };
                            self.settle(generation, outcome)
                        }
                        None => Vec::new(),
                    },
                },
                _ = self.wake.notified() => Vec::new(),
                _ = tokio::time::sleep_until(deadline), if next_retry.is_some() => Vec::new(),
            };

            match self.progress_if_current(generation) {
                Some(progress) => events.push(QueueEvent::Progress(progress)),
                None => return,
            }
            dispatch(&self.listeners, events);
        }
    }

    /// Pick the next attempts to start, or detect that the run is over.
    fn plan(&self, generation: u64) -> Step {
        let mut guard = self.lock_state();
        let st = &mut *guard;
        if st.generation != generation {
            return Step::Stop;
        }

        let now = Instant::now();
        let slots = self.config.concurrency.saturating_sub(st.active.len());
        let (fresh, retries): (Vec<&ChunkUploadTask>, Vec<&ChunkUploadTask>) = st
            .tasks
            .values()
            .filter(|t| t.is_ready(now))
            .partition(|t| t.retry_count == 0);
        let picked: Vec<TaskKey> = fresh
            .into_iter()
            .chain(retries)
            .take(slots)
            .map(|t| (t.session_id.clone(), t.chunk_index))
            .collect();

        let started_at = OffsetDateTime::now_utc();
        let mut jobs = Vec::with_capacity(picked.len());
        for key in picked {
            if let Some(t) = st.tasks.get_mut(&key) {
                t.status = TaskStatus::Uploading;
                t.started_at = Some(started_at);
                t.attempts += 1;
                t.retry_at = None;
                t.upload_progress_percent = 0;
                debug!(task_id = %t.id, attempt = t.attempts, "starting upload");
                jobs.push(Job {
                    key: key.clone(),
                    session_id: t.session_id.clone(),
                    chunk_index: t.chunk_index,
                    data: Arc::clone(&t.chunk_data),
                });
                st.active.insert(key);
            }
        }

        let any_pending = st.tasks.values().any(|t| t.status == TaskStatus::Pending);
        if jobs.is_empty() && st.active.is_empty() && !any_pending {
            st.is_processing = false;
            st.worker = None;
            let failed: Vec<TaskId> = st
                .tasks
                .values()
                .filter(|t| t.status == TaskStatus::Failed)
                .map(|t| t.id.clone())
                .collect();
            let progress = summarize(st.tasks.values(), &st.throughput);
            let (outcome, event) = if failed.is_empty() {
                info!(chunks = progress.total_chunks, bytes = progress.uploaded_bytes, "upload queue drained");
                (QueueOutcome::Completed, QueueEvent::QueueCompleted(progress))
            } else {
                warn!(failed = failed.len(), chunks = progress.total_chunks, "upload queue drained with failures");
                (
                    QueueOutcome::Failed {
                        failed: failed.clone(),
                    },
                    QueueEvent::QueueFailed { failed, progress },
                )
            };
            self.drained.send_replace(DrainState {
                running: false,
                outcome,
            });
            return Step::Finished(vec![event]);
        }

        let next_retry = st
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .filter_map(|t| t.retry_at)
            .filter(|at| *at > now)
            .min();
        Step::Continue { jobs, next_retry }
    }

    /// Apply one finished attempt to its task.
    fn settle(&self, generation: u64, outcome: AttemptResult) -> Vec<QueueEvent> {
        let mut guard = self.lock_state();
        let st = &mut *guard;
        if st.generation != generation {
            return Vec::new();
        }
        st.active.remove(&outcome.key);
        let Some(task) = st.tasks.get_mut(&outcome.key) else {
            return Vec::new();
        };

        match outcome.result {
            Ok(()) => {
                task.status = TaskStatus::Completed;
                task.completed_at = Some(OffsetDateTime::now_utc());
                task.upload_progress_percent = 100;
                task.last_error = None;
                st.throughput.record(task.size(), outcome.took);
                debug!(task_id = %task.id, attempts = task.attempts, "chunk uploaded");
                vec![QueueEvent::ChunkCompleted {
                    task_id: task.id.clone(),
                    session_id: task.session_id.clone(),
                    chunk_index: task.chunk_index,
                    attempts: task.attempts,
                }]
            }
            Err(err) => {
                task.last_error = Some(err.to_string());
                if task.retry_count >= self.config.retry.max_retries {
                    task.status = TaskStatus::Failed;
                    warn!(
                        task_id = %task.id,
                        attempts = task.attempts,
                        error = %err,
                        "chunk upload failed; retries exhausted"
                    );
                    vec![QueueEvent::ChunkFailed {
                        task_id: task.id.clone(),
                        session_id: task.session_id.clone(),
                        chunk_index: task.chunk_index,
                        retry_count: task.retry_count,
                        error: err.to_string(),
                    }]
                } else {
                    task.retry_count += 1;
                    let delay = self.config.retry.backoff(task.retry_count);
                    task.status = TaskStatus::Pending;
                    task.retry_at = Some(Instant::now() + delay);
                    warn!(
                        task_id = %task.id,
                        retry_count = task.retry_count,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "chunk upload failed; retrying"
                    );
                    Vec::new()
                }
            }
        }
    }

    fn progress_if_current(&self, generation: u64) -> Option<UploadProgress> {
        let st = self.lock_state();
        (st.generation == generation).then(|| summarize(st.tasks.values(), &st.throughput))
    }
}

async fn attempt<U: ChunkUploader>(uploader: Arc<U>, job: Job, timeout: Duration) -> AttemptResult {
    let started = Instant::now();
    let upload = uploader.upload_chunk(&job.session_id, job.data, job.chunk_index);
    let result = match tokio::time::timeout(timeout, upload).await {
        Ok(r) => r,
        Err(_) => Err(UploadError::Timeout(timeout)),
    };
    AttemptResult {
        key: job.key,
        result,
        took: started.elapsed(),
    }
}
