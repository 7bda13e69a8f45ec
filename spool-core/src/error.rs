use thiserror::Error;

use crate::remote::RemoteError;
use crate::session::capture::CaptureError;
use crate::session::status::RecordingStatus;

#[derive(Error, Debug)]
pub enum SpoolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Format error: {0}")]
    Format(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("capture permission denied: {0}")]
    PermissionDenied(String),

    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition {
        from: RecordingStatus,
        to: RecordingStatus,
    },

    #[error("no active session")]
    NoActiveSession,

    #[error("chunks are not accepted while {0}")]
    NotAccepting(RecordingStatus),

    #[error("upload incomplete: {} chunk(s) failed", failed.len())]
    UploadIncomplete { failed: Vec<u32> },

    #[error("upload cancelled")]
    Cancelled,
}

impl From<serde_json::Error> for SpoolError {
    fn from(e: serde_json::Error) -> Self {
        SpoolError::Format(e.to_string())
    }
}

// Convenient crate-wide result type
pub type Result<T> = std::result::Result<T, SpoolError>;
