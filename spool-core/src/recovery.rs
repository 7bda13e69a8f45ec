use tracing::{info, warn};

use crate::error::Result;
use crate::remote::{RecordingRemote, RemoteSessionStatus};
use crate::session::controller::{RecordingController, RestoreReport};
use crate::storage::snapshot::RecoverableSession;

#[derive(Clone, Debug, PartialEq)]
pub enum RecoveryOutcome {
    NothingToRecover,
    /// Too old to restore silently; ask the user, then call `run(true)`.
    AwaitingConfirmation(RecoverableSession),
    /// The remote no longer accepts the session; local state was dropped.
    Discarded { session_id: String, reason: String },
    /// The remote could not be asked. The snapshot is kept for a later attempt.
    Unverified { session_id: String, reason: String },
    Restored(RestoreReport),
}

/// Startup check that a persisted session is still worth resuming.
pub struct RecoveryValidator<R: RecordingRemote> {
    controller: RecordingController<R>,
}

impl<R: RecordingRemote> RecoveryValidator<R> {
    pub fn new(controller: RecordingController<R>) -> Self {
        Self { controller }
    }

    pub fn check(&self) -> Option<RecoverableSession> {
        self.controller.snapshots().check_recovery()
    }

    /// Validate and restore the persisted session. Sessions past the
    /// auto-recovery threshold are only restored when `confirmed`.
    pub async fn run(&self, confirmed: bool) -> Result<RecoveryOutcome> {
        let Some(candidate) = self.check() else {
            return Ok(RecoveryOutcome::NothingToRecover);
        };
        if !candidate.should_auto_recover && !confirmed {
            info!(
                session_id = %candidate.state.session_id,
                elapsed_secs = candidate.time_elapsed.as_secs(),
                "interrupted session needs confirmation"
            );
            return Ok(RecoveryOutcome::AwaitingConfirmation(candidate));
        }
        self.restore(&candidate).await
    }

    pub async fn restore(&self, candidate: &RecoverableSession) -> Result<RecoveryOutcome> {
        let session_id = candidate.state.session_id.clone();
        let remote_status = match self.controller.remote().check_session(&session_id).await {
            Ok(status) => status,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "could not validate interrupted session");
                return Ok(RecoveryOutcome::Unverified {
                    session_id,
                    reason: e.to_string(),
                });
            }
        };

        if remote_status != RemoteSessionStatus::Active {
            let reason = match remote_status {
                RemoteSessionStatus::Finalized => "session already finalized remotely",
                _ => "session no longer exists remotely",
            };
            info!(session_id = %session_id, reason, "discarding interrupted session");
            self.controller.dismiss();
            return Ok(RecoveryOutcome::Discarded {
                session_id,
                reason: reason.to_string(),
            });
        }

        let report = self.controller.rehydrate(candidate)?;
        Ok(RecoveryOutcome::Restored(report))
    }

    /// Drop the persisted session without asking the remote.
    pub fn discard(&self) {
        self.controller.dismiss();
    }
}
