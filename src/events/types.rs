//! System event types
//!
//! Defines all event types that can be broadcast through the event bus.

use serde::{Deserialize, Serialize};

use crate::session::SessionState;
use crate::stream::{CameraStreamInfo, StreamState};

/// System event enumeration
///
/// All events are tagged with their event name for serialization.
/// The `serde(tag = "event", content = "data")` attribute creates a
/// JSON structure like:
/// ```json
/// {
///   "event": "stream.state_changed",
///   "data": { "camera_id": "cam1", "state": "live", "previous": "starting" }
/// }
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum SystemEvent {
    // ============================================================================
    // Camera Stream Events
    // ============================================================================
    /// Camera stream lifecycle transition
    #[serde(rename = "stream.state_changed")]
    StreamStateChanged {
        camera_id: String,
        /// New state
        state: StreamState,
        /// State before the transition
        previous: StreamState,
        /// Why the transition happened (degraded reason, error message)
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// Number of viewers attached to a camera changed
    #[serde(rename = "stream.viewer_count_changed")]
    ViewerCountChanged { camera_id: String, viewers: usize },

    /// Upstream start failed (or the upstream died)
    ///
    /// `terminal` is set once the start retry budget of the cycle is spent;
    /// operators should look at the camera.
    #[serde(rename = "stream.failed")]
    StreamFailed {
        camera_id: String,
        reason: String,
        attempt: u32,
        terminal: bool,
    },

    /// Snapshot of every configured camera (sent to WebSocket clients on subscribe)
    #[serde(rename = "stream.snapshot")]
    StreamsSnapshot { streams: Vec<CameraStreamInfo> },

    // ============================================================================
    // Viewer Session Events
    // ============================================================================
    /// Viewer session negotiation state changed
    #[serde(rename = "session.state_changed")]
    SessionStateChanged {
        session_id: String,
        camera_id: String,
        state: SessionState,
        retry_count: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// Reconnection gave up; the viewer must be shown "unable to connect"
    #[serde(rename = "session.retry_exhausted")]
    SessionRetryExhausted {
        session_id: String,
        camera_id: String,
        attempts: u32,
    },

    /// Generic error notification (e.g. subscriber lagged)
    #[serde(rename = "error")]
    Error { message: String },
}

impl SystemEvent {
    /// Get the event name (for filtering/routing)
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::StreamStateChanged { .. } => "stream.state_changed",
            Self::ViewerCountChanged { .. } => "stream.viewer_count_changed",
            Self::StreamFailed { .. } => "stream.failed",
            Self::StreamsSnapshot { .. } => "stream.snapshot",
            Self::SessionStateChanged { .. } => "session.state_changed",
            Self::SessionRetryExhausted { .. } => "session.retry_exhausted",
            Self::Error { .. } => "error",
        }
    }

    /// Camera the event refers to, if any
    pub fn camera_id(&self) -> Option<&str> {
        match self {
            Self::StreamStateChanged { camera_id, .. }
            | Self::ViewerCountChanged { camera_id, .. }
            | Self::StreamFailed { camera_id, .. }
            | Self::SessionStateChanged { camera_id, .. }
            | Self::SessionRetryExhausted { camera_id, .. } => Some(camera_id),
            Self::StreamsSnapshot { .. } | Self::Error { .. } => None,
        }
    }

    /// Check if event name matches a topic pattern
    ///
    /// Supports wildcards:
    /// - `*` matches all events
    /// - `stream.*` matches all stream events
    /// - `stream.state_changed` matches exact event
    pub fn matches_topic(&self, topic: &str) -> bool {
        if topic == "*" {
            return true;
        }

        let event_name = self.event_name();

        if topic.ends_with(".*") {
            let prefix = topic.trim_end_matches(".*");
            event_name.starts_with(prefix)
        } else {
            event_name == topic
        }
    }
}
