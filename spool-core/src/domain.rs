// spool_core/src/domain.rs
use serde::{Deserialize, Serialize};

use crate::queue::progress::UploadProgress;
use crate::session::status::RecordingStatus;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PrivacySettings {
    pub blur_passwords: bool,
    pub exclude_personal_info: bool,
    pub custom_exclusions: Vec<String>,
}

impl Default for PrivacySettings {
    fn default() -> Self {
        Self {
            blur_passwords: true,
            exclude_personal_info: false,
            custom_exclusions: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecordingSettings {
    pub description: Option<String>,
    pub workflow_type: Option<String>,
    pub chunk_duration_secs: u32,
    pub privacy: PrivacySettings,
}

impl Default for RecordingSettings {
    fn default() -> Self {
        Self {
            description: None,
            workflow_type: None,
            chunk_duration_secs: 5,
            privacy: PrivacySettings::default(),
        }
    }
}

/// Point-in-time view of the controller's session.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionSummary {
    pub session_id: Option<String>,
    pub status: RecordingStatus,
    pub duration_seconds: u64,
    pub chunk_count: u32,
    pub total_bytes: u64,
    pub progress: UploadProgress,
    pub last_error: Option<String>,
}
