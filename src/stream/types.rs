//! Camera stream state types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of one camera's outbound stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    /// No upstream process
    Idle,
    /// Upstream process is being started
    Starting,
    /// Upstream is running and publishing to the relay
    Live,
    /// Upstream is running but reports intermittent failure
    Degraded,
    /// Upstream is being torn down
    Stopping,
    /// Upstream could not be started (or died) and is waiting for a retry
    Failed,
}

impl StreamState {
    /// States in which the camera is expected to deliver (or soon deliver) media
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            StreamState::Starting | StreamState::Live | StreamState::Degraded
        )
    }

    /// States in which an upstream process handle exists
    pub fn has_upstream(&self) -> bool {
        matches!(
            self,
            StreamState::Live | StreamState::Degraded | StreamState::Stopping
        )
    }
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StreamState::Idle => "idle",
            StreamState::Starting => "starting",
            StreamState::Live => "live",
            StreamState::Degraded => "degraded",
            StreamState::Stopping => "stopping",
            StreamState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Why the stream last failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Transcoder reported a start error
    StartFailed,
    /// Transcoder did not start within the start timeout
    StartTimeout,
    /// Upstream process exited while live
    ProcessExited,
    /// Transcoder stop failed (the camera was forced to Idle)
    StopFailed,
}

/// Structured record of the last stream error
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamFailure {
    pub kind: FailureKind,
    pub message: String,
    /// Start attempt within the current cycle (0 when not start related)
    pub attempt: u32,
    pub at: DateTime<Utc>,
}

impl StreamFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>, attempt: u32) -> Self {
        Self {
            kind,
            message: message.into(),
            attempt,
            at: Utc::now(),
        }
    }
}

/// Snapshot of a camera stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraStreamInfo {
    pub camera_id: String,
    pub state: StreamState,
    pub last_transition: DateTime<Utc>,
    pub viewer_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<StreamFailure>,
    /// Failed start attempts in the current start cycle
    pub start_attempts: u32,
    /// When the current upstream went live
    #[serde(skip_serializing_if = "Option::is_none")]
    pub live_since: Option<DateTime<Utc>>,
    /// Whether an idle teardown countdown is running
    pub idle_countdown: bool,
    /// Description of the upstream handle, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream: Option<String>,
}

/// Aggregate controller statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct ControllerStats {
    pub cameras: usize,
    pub live: usize,
    pub degraded: usize,
    pub starting: usize,
    pub failed: usize,
    pub viewers: usize,
    /// Transcoder start invocations since process start
    pub starts_total: u64,
    /// Transcoder stop invocations since process start
    pub stops_total: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display_and_serde() {
        assert_eq!(StreamState::Live.to_string(), "live");
        assert_eq!(
            serde_json::to_string(&StreamState::Degraded).unwrap(),
            "\"degraded\""
        );
        assert!(StreamState::Starting.is_active());
        assert!(!StreamState::Failed.is_active());
        assert!(StreamState::Stopping.has_upstream());
        assert!(!StreamState::Idle.has_upstream());
    }
}
