use std::future::Future;
use std::sync::Mutex;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("capture failed: {0}")]
    Failed(String),
}

/// The thing producing segments. Segments themselves arrive through
/// `RecordingController::on_chunk_ready`; the controller only drives the
/// start and end of capture.
pub trait CaptureSource: Send + Sync {
    fn request_permission(&self) -> impl Future<Output = Result<(), CaptureError>> + Send;

    /// Stop capturing and hand back the last partial segment, if any.
    fn finish(&self) -> impl Future<Output = Result<Option<Vec<u8>>, CaptureError>> + Send;
}

/// A capture source with a fixed answer, for simulations and tests.
#[derive(Debug, Default)]
pub struct ScriptedCapture {
    deny: Option<String>,
    final_segment: Mutex<Option<Vec<u8>>>,
}

impl ScriptedCapture {
    pub fn granted() -> Self {
        Self::default()
    }

    pub fn denied(reason: &str) -> Self {
        Self {
            deny: Some(reason.to_string()),
            ..Self::default()
        }
    }

    pub fn with_final_segment(self, segment: Vec<u8>) -> Self {
        *self.final_segment.lock().unwrap_or_else(|e| e.into_inner()) = Some(segment);
        self
    }
}

impl CaptureSource for ScriptedCapture {
    async fn request_permission(&self) -> Result<(), CaptureError> {
        match &self.deny {
            Some(reason) => Err(CaptureError::PermissionDenied(reason.clone())),
            None => Ok(()),
        }
    }

    async fn finish(&self) -> Result<Option<Vec<u8>>, CaptureError> {
        Ok(self
            .final_segment
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take())
    }
}
