//! In-process remote used by tests and the `spooldev simulate` command.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tracing::debug;
use uuid::Uuid;

use super::{
    ChunkUploader, CompletionReport, RecordingRemote, RemoteError, RemoteSessionStatus,
    StartRequest, UploadError,
};
use crate::queue::task::ChunkData;

/// Failures to inject, keyed by chunk index.
#[derive(Clone, Debug, Default)]
pub struct FaultPlan {
    /// Index -> number of attempts that fail before one succeeds.
    pub fail_first: HashMap<u32, u32>,
    /// Indices whose uploads never succeed.
    pub always_fail: HashSet<u32>,
    /// Delay applied to every upload.
    pub latency: Duration,
    /// `check_session` answers with a network error.
    pub check_unavailable: bool,
    /// `complete_session` answers with a network error.
    pub complete_unavailable: bool,
}

#[derive(Clone, Debug)]
pub struct StoredSession {
    pub request: StartRequest,
    pub chunks: BTreeMap<u32, ChunkData>,
    pub report: Option<CompletionReport>,
}

#[derive(Default)]
pub struct InMemoryRemote {
    faults: Mutex<FaultPlan>,
    sessions: Mutex<HashMap<String, StoredSession>>,
    attempts: Mutex<HashMap<(String, u32), u32>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_faults(faults: FaultPlan) -> Self {
        Self {
            faults: Mutex::new(faults),
            ..Self::default()
        }
    }

    pub fn set_faults(&self, faults: FaultPlan) {
        *lock(&self.faults) = faults;
    }

    /// Upload attempts seen for one chunk, successful or not.
    pub fn attempts(&self, session_id: &str, chunk_index: u32) -> u32 {
        lock(&self.attempts)
            .get(&(session_id.to_string(), chunk_index))
            .copied()
            .unwrap_or(0)
    }

    pub fn stored_indices(&self, session_id: &str) -> Vec<u32> {
        lock(&self.sessions)
            .get(session_id)
            .map(|s| s.chunks.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn session(&self, session_id: &str) -> Option<StoredSession> {
        lock(&self.sessions).get(session_id).cloned()
    }

    /// Highest number of uploads observed running at the same time.
    pub fn peak_concurrency(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Drop a session server-side, as an expiry job would.
    pub fn forget(&self, session_id: &str) {
        lock(&self.sessions).remove(session_id);
    }

    fn should_fail(&self, chunk_index: u32, attempt: u32) -> bool {
        let faults = lock(&self.faults);
        if faults.always_fail.contains(&chunk_index) {
            return true;
        }
        faults
            .fail_first
            .get(&chunk_index)
            .is_some_and(|&k| attempt <= k)
    }
}

impl ChunkUploader for InMemoryRemote {
    async fn upload_chunk(
        &self,
        session_id: &str,
        chunk: ChunkData,
        chunk_index: u32,
    ) -> Result<(), UploadError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        let attempt = {
            let mut attempts = lock(&self.attempts);
            let n = attempts.entry((session_id.to_string(), chunk_index)).or_insert(0);
            *n += 1;
            *n
        };

        let latency = lock(&self.faults).latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if self.should_fail(chunk_index, attempt) {
            debug!(session_id, chunk_index, attempt, "injected upload failure");
            return Err(UploadError::Network(format!(
                "injected failure for chunk {chunk_index}"
            )));
        }

        let mut sessions = lock(&self.sessions);
        let Some(session) = sessions.get_mut(session_id) else {
            return Err(UploadError::Rejected(format!("unknown session {session_id}")));
        };
        session.chunks.insert(chunk_index, chunk);
        Ok(())
    }
}

impl RecordingRemote for InMemoryRemote {
    async fn start_session(&self, request: &StartRequest) -> Result<String, RemoteError> {
        let id = Uuid::new_v4().to_string();
        lock(&self.sessions).insert(
            id.clone(),
            StoredSession {
                request: request.clone(),
                chunks: BTreeMap::new(),
                report: None,
            },
        );
        debug!(session_id = %id, title = %request.title, "remote session started");
        Ok(id)
    }

    async fn complete_session(
        &self,
        session_id: &str,
        report: &CompletionReport,
    ) -> Result<(), RemoteError> {
        if lock(&self.faults).complete_unavailable {
            return Err(RemoteError::Network("complete endpoint unavailable".into()));
        }
        let mut sessions = lock(&self.sessions);
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| RemoteError::NotFound(session_id.to_string()))?;
        session.report = Some(report.clone());
        Ok(())
    }

    async fn check_session(&self, session_id: &str) -> Result<RemoteSessionStatus, RemoteError> {
        if lock(&self.faults).check_unavailable {
            return Err(RemoteError::Network("status endpoint unavailable".into()));
        }
        Ok(match lock(&self.sessions).get(session_id) {
            None => RemoteSessionStatus::Missing,
            Some(s) if s.report.is_some() => RemoteSessionStatus::Finalized,
            Some(_) => RemoteSessionStatus::Active,
        })
    }
}
