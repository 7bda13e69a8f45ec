use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecordingStatus {
    Idle,
    RequestingPermission,
    Recording,
    Paused,
    Stopping,
    Uploading,
    Completed,
    Failed,
}

impl RecordingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordingStatus::Idle => "idle",
            RecordingStatus::RequestingPermission => "requesting-permission",
            RecordingStatus::Recording => "recording",
            RecordingStatus::Paused => "paused",
            RecordingStatus::Stopping => "stopping",
            RecordingStatus::Uploading => "uploading",
            RecordingStatus::Completed => "completed",
            RecordingStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RecordingStatus::Completed | RecordingStatus::Failed)
    }

    /// Statuses a persisted snapshot may be resumed from.
    pub fn is_resumable(self) -> bool {
        matches!(
            self,
            RecordingStatus::Recording
                | RecordingStatus::Paused
                | RecordingStatus::Stopping
                | RecordingStatus::Uploading
        )
    }

    /// Edges of the session state machine. `Failed -> Uploading` is the manual
    /// retry of failed chunks.
    pub fn can_transition_to(self, next: RecordingStatus) -> bool {
        use RecordingStatus::*;
        match (self, next) {
            (Idle | Completed | Failed, RequestingPermission) => true,
            (RequestingPermission, Recording) => true,
            (Recording, Paused) | (Paused, Recording) => true,
            (Recording | Paused, Stopping) => true,
            (Stopping, Uploading) => true,
            (Uploading, Completed) => true,
            (Failed, Uploading) => true,
            (from, Failed) => !from.is_terminal() && from != Idle,
            _ => false,
        }
    }
}

impl fmt::Display for RecordingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::RecordingStatus::*;
    use super::*;

    #[test]
    fn happy_path_edges() {
        let path = [
            Idle,
            RequestingPermission,
            Recording,
            Paused,
            Recording,
            Stopping,
            Uploading,
            Completed,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn terminal_states_do_not_fail_again() {
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Failed));
        assert!(!Idle.can_transition_to(Failed));
        for s in [RequestingPermission, Recording, Paused, Stopping, Uploading] {
            assert!(s.can_transition_to(Failed), "{s}");
        }
    }

    #[test]
    fn cannot_skip_upload_phase() {
        assert!(!Recording.can_transition_to(Completed));
        assert!(!Stopping.can_transition_to(Completed));
        assert!(!Paused.can_transition_to(Uploading));
    }

    #[test]
    fn serializes_kebab_case() {
        let s = serde_json::to_string(&RequestingPermission).unwrap();
        assert_eq!(s, "\"requesting-permission\"");
        let back: RecordingStatus = serde_json::from_str("\"uploading\"").unwrap();
        assert_eq!(back, Uploading);
    }

    #[test]
    fn only_active_statuses_resume() {
        let resumable: Vec<_> = [
            Idle,
            RequestingPermission,
            Recording,
            Paused,
            Stopping,
            Uploading,
            Completed,
            Failed,
        ]
        .into_iter()
        .filter(|s| s.is_resumable())
        .collect();
        assert_eq!(resumable, vec![Recording, Paused, Stopping, Uploading]);
    }
}
