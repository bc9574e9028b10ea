//! Viewer session types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::stream::StreamState;

/// Negotiation state of one viewer session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Waiting for the first offer/answer to succeed
    Negotiating,
    /// Offer/answer succeeded; media flows out of band
    Connected,
    /// Connection dropped; a reconnection is pending
    Reconnecting,
    /// Session is gone and holds no resources
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Negotiating => "negotiating",
            SessionState::Connected => "connected",
            SessionState::Reconnecting => "reconnecting",
            SessionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Why a session was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Viewer stopped playback
    ViewerLeft,
    /// Reconnection gave up
    RetryBudgetExhausted,
    /// Session made no progress for too long
    Stale,
    /// Server shutdown
    Shutdown,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CloseReason::ViewerLeft => "viewer_left",
            CloseReason::RetryBudgetExhausted => "retry_budget_exhausted",
            CloseReason::Stale => "stale",
            CloseReason::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// Registry record of one viewer
pub(crate) struct ViewerSession {
    pub(crate) session_id: String,
    pub(crate) camera_id: String,
    pub(crate) state: SessionState,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) last_activity: DateTime<Utc>,
    pub(crate) retry_count: u32,
    /// Cancelled when the session closes; guards pending reconnect timers
    pub(crate) cancel: CancellationToken,
}

impl ViewerSession {
    pub(crate) fn new(session_id: String, camera_id: String) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            camera_id,
            state: SessionState::Negotiating,
            created_at: now,
            last_activity: now,
            retry_count: 0,
            cancel: CancellationToken::new(),
        }
    }

    pub(crate) fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    pub(crate) fn info(&self) -> ViewerSessionInfo {
        ViewerSessionInfo {
            session_id: self.session_id.clone(),
            camera_id: self.camera_id.clone(),
            state: self.state,
            created_at: self.created_at,
            last_activity: self.last_activity,
            retry_count: self.retry_count,
        }
    }
}

/// Snapshot of a viewer session
#[derive(Debug, Clone, Serialize)]
pub struct ViewerSessionInfo {
    pub session_id: String,
    pub camera_id: String,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub retry_count: u32,
}

/// Result of registering a viewer
#[derive(Debug, Clone, Serialize)]
pub struct Registration {
    pub session_id: String,
    pub camera_id: String,
    /// Stream state observed right after the start request
    pub stream_state: StreamState,
    pub viewer_count: usize,
}
