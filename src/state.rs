use std::sync::Arc;
use tokio::sync::broadcast;

use crate::config::{AppConfig, ConfigStore};
use crate::events::{EventBus, SystemEvent};
use crate::reconnect::ReconnectionSupervisor;
use crate::relay::MediaRelay;
use crate::session::SessionRegistry;
use crate::signaling::SignalingExchange;
use crate::stream::StreamLifecycleController;
use crate::transcode::Transcoder;

/// Application-wide state shared across handlers
///
/// Components are wired leaf first: the controller drives the transcoder,
/// the registry counts viewers through the controller, the exchange talks to
/// the relay and the supervisor retries through the exchange.
pub struct AppState {
    /// Configuration store
    pub config: ConfigStore,
    /// Event bus for real-time notifications
    pub events: Arc<EventBus>,
    /// Per-camera upstream lifecycle
    pub controller: Arc<StreamLifecycleController>,
    /// Viewer sessions
    pub registry: Arc<SessionRegistry>,
    /// Offer/answer against the relay
    pub exchange: Arc<SignalingExchange>,
    /// Viewer reconnection
    pub supervisor: Arc<ReconnectionSupervisor>,
    /// Media relay client (path listing, health)
    pub relay: Arc<dyn MediaRelay>,
    /// Shutdown signal sender
    pub shutdown_tx: broadcast::Sender<()>,
}

impl AppState {
    /// Create new application state
    pub fn new(
        config: ConfigStore,
        events: Arc<EventBus>,
        transcoder: Arc<dyn Transcoder>,
        relay: Arc<dyn MediaRelay>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Arc<Self> {
        let snapshot = config.get();
        let controller = StreamLifecycleController::new(&snapshot, transcoder, events.clone());
        let registry = SessionRegistry::new(&snapshot, controller.clone(), events.clone());
        let exchange =
            SignalingExchange::new(&snapshot, relay.clone(), controller.clone(), registry.clone());
        let supervisor =
            ReconnectionSupervisor::new(&snapshot, registry.clone(), exchange.clone(), events.clone());

        Arc::new(Self {
            config,
            events,
            controller,
            registry,
            exchange,
            supervisor,
            relay,
            shutdown_tx,
        })
    }

    /// Push a new configuration into every component
    pub async fn apply_config(&self, config: &AppConfig) {
        self.registry.set_config(config);
        self.exchange.set_config(config);
        self.supervisor.set_config(config);
        self.controller.apply_config(config).await;
    }

    /// Subscribe to shutdown signal
    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Snapshot of every configured camera for WebSocket clients
    pub async fn streams_snapshot(&self) -> SystemEvent {
        SystemEvent::StreamsSnapshot {
            streams: self.controller.list_streams().await,
        }
    }

    /// Close all sessions and stop every upstream
    pub async fn shutdown(&self) {
        self.registry.close_all().await;
        self.controller.stop_all().await;
    }
}
