#![forbid(unsafe_code)]

pub mod clock;
pub mod config;
pub mod domain;
pub mod error;
pub mod retry;

pub mod queue;

pub mod remote;

pub mod session;

pub mod storage;
pub mod storage_factory;

pub mod recovery;

// Re-exports: stable API surface
pub use config::SpoolConfig;
pub use error::{Result, SpoolError};
pub use queue::{QueueOutcome, UploadQueue};
pub use recovery::{RecoveryOutcome, RecoveryValidator};
pub use remote::{ChunkUploader, RecordingRemote};
pub use retry::RetryPolicy;
pub use session::controller::{RecordingController, RestoreReport};
pub use session::status::RecordingStatus;
pub use storage_factory::{StorageBackend, open_storage};
