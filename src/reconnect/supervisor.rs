use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::error::{AppError, Result};
use crate::events::{EventBus, SystemEvent};
use crate::session::{CloseReason, SessionRegistry};
use crate::signaling::{SdpAnswer, SdpOffer, SignalingExchange};
use crate::utils::BackoffPolicy;

/// Client side of a viewer connection
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Resolves when the connection drops
    async fn wait_for_drop(&self);

    /// Fresh local offer for a new attempt
    async fn create_offer(&self) -> Result<SdpOffer>;

    /// Install the relay's answer
    async fn apply_answer(&self, answer: SdpAnswer) -> Result<()>;
}

/// When and how the next reconnection attempt happens
#[derive(Debug, Clone, Serialize)]
pub struct ReconnectPlan {
    pub session_id: String,
    /// 1-based attempt number (consecutive failures so far)
    pub attempt: u32,
    pub delay_ms: u64,
}

impl ReconnectPlan {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    backoff: BackoffPolicy,
    max_retries: u32,
}

struct Supervision {
    id: u64,
    token: CancellationToken,
}

pub struct ReconnectionSupervisor {
    registry: Arc<SessionRegistry>,
    exchange: Arc<SignalingExchange>,
    events: Arc<EventBus>,
    policy: RwLock<RetryPolicy>,
    supervisions: Mutex<HashMap<String, Supervision>>,
    next_id: AtomicU64,
}

impl ReconnectionSupervisor {
    pub fn new(
        config: &AppConfig,
        registry: Arc<SessionRegistry>,
        exchange: Arc<SignalingExchange>,
        events: Arc<EventBus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            exchange,
            events,
            policy: RwLock::new(policy_from(config)),
            supervisions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn set_config(&self, config: &AppConfig) {
        *self.policy.write() = policy_from(config);
    }

    /// Record a dropped connection and plan the next attempt
    ///
    /// Once the retry budget is spent the session is closed and
    /// `RetryBudgetExhausted` is returned.
    pub async fn on_drop(&self, session_id: &str) -> Result<ReconnectPlan> {
        let policy = *self.policy.read();
        let camera_id = self.registry.camera_of(session_id)?;
        let attempt = self.registry.mark_reconnecting(session_id)?;

        if attempt > policy.max_retries {
            warn!(
                session_id = %session_id,
                camera_id = %camera_id,
                attempts = attempt,
                "Reconnection gave up"
            );
            self.registry
                .close_session(session_id, CloseReason::RetryBudgetExhausted)
                .await?;
            self.events.publish(SystemEvent::SessionRetryExhausted {
                session_id: session_id.to_string(),
                camera_id,
                attempts: attempt,
            });
            return Err(AppError::RetryBudgetExhausted {
                session_id: session_id.to_string(),
                attempts: attempt,
            });
        }

        let delay = policy.backoff.delay(attempt);
        debug!(
            session_id = %session_id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Reconnection planned"
        );
        Ok(ReconnectPlan {
            session_id: session_id.to_string(),
            attempt,
            delay_ms: delay.as_millis() as u64,
        })
    }

    /// Drive reconnection for a session in the background
    ///
    /// Replaces an earlier supervision of the same session.
    pub fn supervise(
        self: &Arc<Self>,
        session_id: &str,
        transport: Arc<dyn PeerTransport>,
    ) -> Result<()> {
        let session_token = self
            .registry
            .session_token(session_id)
            .ok_or_else(|| AppError::NotFound(format!("session {}", session_id)))?;
        let token = session_token.child_token();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        if let Some(previous) = self.supervisions.lock().insert(
            session_id.to_string(),
            Supervision {
                id,
                token: token.clone(),
            },
        ) {
            previous.token.cancel();
        }

        let this = self.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            this.run(&session_id, transport, token).await;
            let mut supervisions = this.supervisions.lock();
            if supervisions.get(&session_id).is_some_and(|s| s.id == id) {
                supervisions.remove(&session_id);
            }
        });
        Ok(())
    }

    async fn run(&self, session_id: &str, transport: Arc<dyn PeerTransport>, token: CancellationToken) {
        'session: loop {
            tokio::select! {
                _ = token.cancelled() => break 'session,
                _ = transport.wait_for_drop() => {}
            }
            info!(session_id = %session_id, "Viewer connection dropped");

            loop {
                let plan = match self.on_drop(session_id).await {
                    Ok(plan) => plan,
                    Err(e) => {
                        debug!(session_id = %session_id, "Supervision ends: {}", e);
                        break 'session;
                    }
                };

                tokio::select! {
                    _ = token.cancelled() => break 'session,
                    _ = tokio::time::sleep(plan.delay()) => {}
                }

                // Only an applied answer ends the run of consecutive failures
                let attempt = async {
                    let offer = transport.create_offer().await?;
                    let answer = self.exchange.negotiate_session(session_id, &offer).await?;
                    transport.apply_answer(answer).await?;
                    self.registry.mark_connected(session_id).map(|_| ())
                };
                let result = tokio::select! {
                    _ = token.cancelled() => break 'session,
                    result = attempt => result,
                };

                match result {
                    Ok(()) => {
                        info!(session_id = %session_id, attempt = plan.attempt, "Viewer reconnected");
                        break;
                    }
                    Err(e) => {
                        debug!(
                            session_id = %session_id,
                            attempt = plan.attempt,
                            "Reconnection attempt failed: {}", e
                        );
                    }
                }
            }
        }
    }

    /// Stop supervising a session (pending attempts are abandoned)
    pub fn cancel(&self, session_id: &str) -> bool {
        match self.supervisions.lock().remove(session_id) {
            Some(supervision) => {
                supervision.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Sessions currently supervised
    pub fn active_supervisions(&self) -> usize {
        self.supervisions
            .lock()
            .values()
            .filter(|s| !s.token.is_cancelled())
            .count()
    }
}

fn policy_from(config: &AppConfig) -> RetryPolicy {
    RetryPolicy {
        backoff: BackoffPolicy::for_reconnect(&config.reconnect),
        max_retries: config.reconnect.max_retries,
    }
}
