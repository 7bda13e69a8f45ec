use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::RecordingSettings;
use crate::queue::task::ChunkData;

pub mod memory;

/// What a single upload attempt may fail with. All variants are retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UploadError {
    #[error("network error: {0}")]
    Network(String),

    #[error("upload timed out after {0:?}")]
    Timeout(Duration),

    #[error("rejected by remote: {0}")]
    Rejected(String),

    #[error("upload task aborted: {0}")]
    Aborted(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("network error: {0}")]
    Network(String),

    #[error("session not found: {0}")]
    NotFound(String),

    #[error("session already finalized: {0}")]
    Finalized(String),

    #[error("remote rejected request: {0}")]
    Rejected(String),
}

/// Server-side view of a session, used to validate a local snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RemoteSessionStatus {
    Active,
    Finalized,
    Missing,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    pub title: String,
    #[serde(default)]
    pub settings: RecordingSettings,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// Final numbers sent when a session is closed out.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionReport {
    pub duration_seconds: u64,
    pub total_bytes: u64,
    pub chunk_count: u32,
    pub uploaded_chunks: u32,
    pub failed_chunks: Vec<u32>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// Uploads one chunk. Must be idempotent per `(session_id, chunk_index)`:
/// retries may resend a chunk the remote already stored.
pub trait ChunkUploader: Send + Sync + 'static {
    fn upload_chunk(
        &self,
        session_id: &str,
        chunk: ChunkData,
        chunk_index: u32,
    ) -> impl Future<Output = Result<(), UploadError>> + Send;
}

/// Session lifecycle calls on top of chunk upload.
pub trait RecordingRemote: ChunkUploader {
    /// Returns the new session id.
    fn start_session(
        &self,
        request: &StartRequest,
    ) -> impl Future<Output = Result<String, RemoteError>> + Send;

    fn complete_session(
        &self,
        session_id: &str,
        report: &CompletionReport,
    ) -> impl Future<Output = Result<(), RemoteError>> + Send;

    /// Does the session still exist, and is it unfinished?
    fn check_session(
        &self,
        session_id: &str,
    ) -> impl Future<Output = Result<RemoteSessionStatus, RemoteError>> + Send;
}

/// Adapts a closure into a [`ChunkUploader`].
pub struct FnUploader<F>(pub F);

impl<F, Fut> ChunkUploader for FnUploader<F>
where
    F: Fn(String, ChunkData, u32) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), UploadError>> + Send + 'static,
{
    fn upload_chunk(
        &self,
        session_id: &str,
        chunk: ChunkData,
        chunk_index: u32,
    ) -> impl Future<Output = Result<(), UploadError>> + Send {
        (self.0)(session_id.to_string(), chunk, chunk_index)
    }
}
