use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::time::Instant;

/// Immutable chunk payload, shared between the queue, attempts and the spool.
pub type ChunkData = Arc<[u8]>;

/// `<session_id>-<chunk_index>`; unique per chunk.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(session_id: &str, chunk_index: u32) -> Self {
        TaskId(format!("{session_id}-{chunk_index}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Uploading,
    Completed,
    Failed,
}

#[derive(Clone, Debug)]
pub struct ChunkUploadTask {
    pub id: TaskId,
    pub session_id: String,
    pub chunk_index: u32,
    pub chunk_data: ChunkData,
    pub digest: [u8; 32],
    pub status: TaskStatus,
    /// Retries scheduled so far; never exceeds the policy's `max_retries`.
    pub retry_count: u32,
    /// Attempts actually started, including the first.
    pub attempts: u32,
    pub last_error: Option<String>,
    pub started_at: Option<OffsetDateTime>,
    pub completed_at: Option<OffsetDateTime>,
    pub upload_progress_percent: u8,
    /// Not eligible before this instant (backoff after a failed attempt).
    pub(crate) retry_at: Option<Instant>,
}

impl ChunkUploadTask {
    pub fn new(session_id: &str, chunk_index: u32, chunk_data: ChunkData) -> Self {
        let digest = *blake3::hash(&chunk_data).as_bytes();
        Self {
            id: TaskId::new(session_id, chunk_index),
            session_id: session_id.to_string(),
            chunk_index,
            chunk_data,
            digest,
            status: TaskStatus::Pending,
            retry_count: 0,
            attempts: 0,
            last_error: None,
            started_at: None,
            completed_at: None,
            upload_progress_percent: 0,
            retry_at: None,
        }
    }

    pub fn size(&self) -> u64 {
        self.chunk_data.len() as u64
    }

    pub(crate) fn is_ready(&self, now: Instant) -> bool {
        self.status == TaskStatus::Pending && self.retry_at.is_none_or(|at| at <= now)
    }

    pub fn view(&self) -> TaskView {
        TaskView {
            id: self.id.clone(),
            session_id: self.session_id.clone(),
            chunk_index: self.chunk_index,
            size: self.size(),
            digest_hex: hex::encode(&self.digest[..8]),
            status: self.status,
            retry_count: self.retry_count,
            attempts: self.attempts,
            last_error: self.last_error.clone(),
            started_at: self.started_at,
            completed_at: self.completed_at,
            upload_progress_percent: self.upload_progress_percent,
        }
    }
}

/// Read-only copy of a task without its payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskView {
    pub id: TaskId,
    pub session_id: String,
    pub chunk_index: u32,
    pub size: u64,
    pub digest_hex: String,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub started_at: Option<OffsetDateTime>,
    pub completed_at: Option<OffsetDateTime>,
    pub upload_progress_percent: u8,
}
