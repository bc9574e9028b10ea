//! Single offer/answer exchange against the media relay
//!
//! Exactly one relay call per attempt, no retries here: retrying belongs to
//! the reconnection supervisor.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{debug, warn};

use super::sdp::{SdpAnswer, SdpOffer};
use crate::config::AppConfig;
use crate::error::{AppError, Result};
use crate::relay::MediaRelay;
use crate::session::SessionRegistry;
use crate::stream::{StreamLifecycleController, StreamState};

#[derive(Debug, Clone, Copy)]
struct ExchangeTimeouts {
    negotiation: Duration,
    /// How long to wait for a starting camera to settle
    settle: Duration,
}

pub struct SignalingExchange {
    relay: Arc<dyn MediaRelay>,
    controller: Arc<StreamLifecycleController>,
    registry: Arc<SessionRegistry>,
    timeouts: RwLock<ExchangeTimeouts>,
}

impl SignalingExchange {
    pub fn new(
        config: &AppConfig,
        relay: Arc<dyn MediaRelay>,
        controller: Arc<StreamLifecycleController>,
        registry: Arc<SessionRegistry>,
    ) -> Arc<Self> {
        let exchange = Arc::new(Self {
            relay,
            controller,
            registry,
            timeouts: RwLock::new(ExchangeTimeouts {
                negotiation: Duration::ZERO,
                settle: Duration::ZERO,
            }),
        });
        exchange.set_config(config);
        exchange
    }

    pub fn set_config(&self, config: &AppConfig) {
        *self.timeouts.write() = ExchangeTimeouts {
            negotiation: config.relay.negotiation_timeout(),
            settle: config.lifecycle.start_timeout(),
        };
    }

    /// Negotiate for a registered session; marks it Connected on success
    pub async fn negotiate(&self, session_id: &str, offer: &SdpOffer) -> Result<SdpAnswer> {
        let answer = self.negotiate_session(session_id, offer).await?;
        // Fails if the session was closed while the relay answered
        self.registry.mark_connected(session_id)?;
        Ok(answer)
    }

    /// Negotiate for a registered session without touching its state
    ///
    /// The caller marks the session Connected once the answer is in use.
    pub async fn negotiate_session(&self, session_id: &str, offer: &SdpOffer) -> Result<SdpAnswer> {
        let camera_id = self.registry.camera_of(session_id)?;
        self.negotiate_camera(&camera_id, offer).await
    }

    /// One offer/answer for a camera
    ///
    /// Cameras without an active stream fail with `CameraUnavailable`
    /// before the relay is contacted.
    pub async fn negotiate_camera(&self, camera_id: &str, offer: &SdpOffer) -> Result<SdpAnswer> {
        offer.validate()?;
        if !self.controller.knows(camera_id) {
            return Err(AppError::CameraUnavailable(format!(
                "camera {} is not configured",
                camera_id
            )));
        }

        let timeouts = *self.timeouts.read();
        let mut state = self.controller.state(camera_id);
        if state == StreamState::Starting {
            state = self
                .controller
                .wait_until_settled(camera_id, timeouts.settle)
                .await;
        }
        if !matches!(state, StreamState::Live | StreamState::Degraded) {
            return Err(AppError::CameraUnavailable(format!(
                "camera {} is {}",
                camera_id, state
            )));
        }

        let path = self.controller.relay_path(camera_id);
        let started = Instant::now();
        match tokio::time::timeout(timeouts.negotiation, self.relay.negotiate(&path, offer)).await
        {
            Ok(Ok(answer)) => {
                debug!(
                    camera_id = %camera_id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Negotiation succeeded"
                );
                Ok(answer)
            }
            Ok(Err(e)) => {
                warn!(camera_id = %camera_id, "Negotiation failed: {}", e);
                Err(e)
            }
            Err(_) => {
                warn!(
                    camera_id = %camera_id,
                    "Relay did not answer within {:?}", timeouts.negotiation
                );
                Err(AppError::NegotiationTimeout {
                    timeout_ms: timeouts.negotiation.as_millis() as u64,
                })
            }
        }
    }
}
