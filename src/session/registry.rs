//! Viewer session registry
//!
//! Single source of truth for which viewers watch which camera. Viewer
//! counts are kept by the controller under the camera's slot lock; the
//! registry is the only caller that changes them, so a session is counted
//! exactly once between `register_viewer` and its removal.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::types::{CloseReason, Registration, SessionState, ViewerSession, ViewerSessionInfo};
use crate::config::{AppConfig, SessionConfig};
use crate::error::{AppError, Result};
use crate::events::{EventBus, SystemEvent};
use crate::stream::StreamLifecycleController;

#[derive(Debug, Clone, Default)]
struct RegistrySettings {
    sessions: SessionConfig,
    idle_grace: Duration,
}

/// Viewer sessions keyed by session id
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, ViewerSession>>,
    controller: Arc<StreamLifecycleController>,
    events: Arc<EventBus>,
    settings: RwLock<RegistrySettings>,
}

impl SessionRegistry {
    pub fn new(
        config: &AppConfig,
        controller: Arc<StreamLifecycleController>,
        events: Arc<EventBus>,
    ) -> Arc<Self> {
        let registry = Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            controller,
            events,
            settings: RwLock::new(RegistrySettings::default()),
        });
        registry.set_config(config);
        registry
    }

    pub fn set_config(&self, config: &AppConfig) {
        *self.settings.write() = RegistrySettings {
            sessions: config.sessions.clone(),
            idle_grace: config.lifecycle.idle_grace(),
        };
    }

    fn publish_state(&self, session: &ViewerSession, reason: Option<String>) {
        self.events.publish(SystemEvent::SessionStateChanged {
            session_id: session.session_id.clone(),
            camera_id: session.camera_id.clone(),
            state: session.state,
            retry_count: session.retry_count,
            reason,
        });
    }

    /// Create a viewer session and make sure the camera is started
    pub async fn register_viewer(&self, camera_id: &str) -> Result<Registration> {
        let limit = self.settings.read().sessions.max_viewers_per_camera as usize;
        let viewer_count = self.controller.attach_viewer(camera_id, limit).await?;

        let session_id = uuid::Uuid::new_v4().to_string();
        {
            let session = ViewerSession::new(session_id.clone(), camera_id.to_string());
            self.publish_state(&session, None);
            self.sessions.write().insert(session_id.clone(), session);
        }
        info!(
            session_id = %session_id,
            camera_id = %camera_id,
            viewers = viewer_count,
            "Viewer registered"
        );

        let stream_state = match self.controller.ensure_started(camera_id).await {
            Ok(state) => state,
            Err(e) => {
                let _ = self.close_session(&session_id, CloseReason::Shutdown).await;
                return Err(e);
            }
        };

        Ok(Registration {
            session_id,
            camera_id: camera_id.to_string(),
            stream_state,
            viewer_count,
        })
    }

    /// Viewer left
    pub async fn unregister_viewer(&self, session_id: &str) -> Result<ViewerSessionInfo> {
        self.close_session(session_id, CloseReason::ViewerLeft).await
    }

    /// Remove a session, cancel its pending work and release its viewer slot
    pub async fn close_session(
        &self,
        session_id: &str,
        reason: CloseReason,
    ) -> Result<ViewerSessionInfo> {
        let mut session = self
            .sessions
            .write()
            .remove(session_id)
            .ok_or_else(|| AppError::NotFound(format!("session {}", session_id)))?;

        session.cancel.cancel();
        session.state = SessionState::Closed;
        session.touch();
        self.publish_state(&session, Some(reason.to_string()));
        info!(
            session_id = %session_id,
            camera_id = %session.camera_id,
            reason = %reason,
            "Viewer session closed"
        );

        let remaining = self.controller.detach_viewer(&session.camera_id).await;
        if remaining == 0 {
            let grace = self.settings.read().idle_grace;
            self.controller
                .ensure_stopped_after_idle(&session.camera_id, grace)
                .await;
        }
        Ok(session.info())
    }

    /// Negotiation succeeded; resets the retry count
    pub fn mark_connected(&self, session_id: &str) -> Result<ViewerSessionInfo> {
        let mut sessions = self.sessions.write();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| AppError::NotFound(format!("session {}", session_id)))?;
        session.state = SessionState::Connected;
        session.retry_count = 0;
        session.touch();
        self.publish_state(session, None);
        debug!(session_id = %session_id, "Viewer session connected");
        Ok(session.info())
    }

    /// Connection dropped; returns the new retry count
    pub fn mark_reconnecting(&self, session_id: &str) -> Result<u32> {
        let mut sessions = self.sessions.write();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| AppError::NotFound(format!("session {}", session_id)))?;
        session.state = SessionState::Reconnecting;
        session.retry_count += 1;
        session.touch();
        self.publish_state(session, None);
        debug!(
            session_id = %session_id,
            retry = session.retry_count,
            "Viewer session reconnecting"
        );
        Ok(session.retry_count)
    }

    /// Cancellation token of a session (cancelled when the session closes)
    pub fn session_token(&self, session_id: &str) -> Option<CancellationToken> {
        self.sessions
            .read()
            .get(session_id)
            .map(|s| s.cancel.clone())
    }

    pub fn camera_of(&self, session_id: &str) -> Result<String> {
        self.sessions
            .read()
            .get(session_id)
            .map(|s| s.camera_id.clone())
            .ok_or_else(|| AppError::NotFound(format!("session {}", session_id)))
    }

    pub fn get_session(&self, session_id: &str) -> Option<ViewerSessionInfo> {
        self.sessions.read().get(session_id).map(|s| s.info())
    }

    /// All sessions, optionally restricted to one camera, oldest first
    pub fn list_sessions(&self, camera_id: Option<&str>) -> Vec<ViewerSessionInfo> {
        let mut list: Vec<ViewerSessionInfo> = self
            .sessions
            .read()
            .values()
            .filter(|s| camera_id.map_or(true, |id| s.camera_id == id))
            .map(|s| s.info())
            .collect();
        list.sort_by_key(|s| s.created_at);
        list
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    pub async fn viewer_count(&self, camera_id: &str) -> usize {
        self.controller.viewer_count(camera_id).await
    }

    /// Close sessions stuck negotiating or reconnecting; returns how many
    pub async fn cleanup_stale_sessions(&self) -> usize {
        let timeout_secs = self.settings.read().sessions.stale_session_timeout_secs;
        let timeout = chrono::Duration::seconds(timeout_secs as i64);
        let now = Utc::now();

        let stale: Vec<String> = self
            .sessions
            .read()
            .values()
            .filter(|s| {
                matches!(s.state, SessionState::Negotiating | SessionState::Reconnecting)
                    && now - s.last_activity >= timeout
            })
            .map(|s| s.session_id.clone())
            .collect();

        let mut closed = 0;
        for session_id in stale {
            if self.close_session(&session_id, CloseReason::Stale).await.is_ok() {
                closed += 1;
            }
        }
        if closed > 0 {
            info!("Closed {} stale viewer session(s)", closed);
        }
        closed
    }

    /// Close every session (server shutdown)
    pub async fn close_all(&self) {
        let ids: Vec<String> = self.sessions.read().keys().cloned().collect();
        for session_id in ids {
            let _ = self.close_session(&session_id, CloseReason::Shutdown).await;
        }
    }
}
