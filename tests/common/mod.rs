//! Shared fixtures: in-memory transcoder, relay and viewer transport

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch, Notify};

use sentinel_live::config::{AppConfig, CameraConfig};
use sentinel_live::events::{EventBus, SystemEvent};
use sentinel_live::reconnect::{PeerTransport, ReconnectionSupervisor};
use sentinel_live::relay::{MediaRelay, RelayPath};
use sentinel_live::session::SessionRegistry;
use sentinel_live::signaling::{SdpAnswer, SdpOffer, SignalingExchange};
use sentinel_live::stream::StreamLifecycleController;
use sentinel_live::transcode::{Liveness, TranscodeHandle, TranscodeRequest, Transcoder};
use sentinel_live::{AppError, Result};

pub const OFFER: &str = "v=0\r\no=- 4611731400430051336 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\na=recvonly\r\n";
pub const ANSWER: &str = "v=0\r\no=- 1 1 IN IP4 10.0.0.1\r\ns=-\r\nt=0 0\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\na=sendonly\r\n";

pub fn offer() -> SdpOffer {
    SdpOffer::new(OFFER)
}

/// Two cameras, 10 s idle grace, 5 s negotiation window, no reconnect jitter
pub fn config() -> AppConfig {
    let mut config = AppConfig::default();
    for id in ["cam1", "cam2"] {
        config.cameras.push(CameraConfig {
            id: id.to_string(),
            name: format!("Camera {}", id),
            url: format!("rtsp://10.0.0.5/{}", id),
            ..Default::default()
        });
    }
    config.lifecycle.idle_grace_secs = 10;
    config.relay.negotiation_timeout_ms = 5_000;
    config.reconnect.jitter_ratio = 0.0;
    config
}

// ============================================================================
// Transcoder
// ============================================================================

#[derive(Default)]
pub struct MockTranscoder {
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub start_delay_ms: AtomicU64,
    /// Fail every start while set
    pub fail: AtomicBool,
    liveness: Mutex<Vec<watch::Sender<Liveness>>>,
}

impl MockTranscoder {
    pub fn with_delay(ms: u64) -> Arc<Self> {
        let transcoder = Self::default();
        transcoder.start_delay_ms.store(ms, Ordering::SeqCst);
        Arc::new(transcoder)
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    /// Report liveness for the n-th started process
    pub fn report(&self, index: usize, liveness: Liveness) {
        self.liveness.lock()[index].send_replace(liveness);
    }
}

#[async_trait]
impl Transcoder for MockTranscoder {
    async fn start(&self, request: &TranscodeRequest) -> Result<TranscodeHandle> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let delay = self.start_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(AppError::UpstreamStartFailed {
                camera_id: request.camera_id.clone(),
                reason: "rtsp source unreachable".to_string(),
            });
        }
        let (tx, rx) = watch::channel(Liveness::Running);
        self.liveness.lock().push(tx);
        Ok(TranscodeHandle::new(
            request.camera_id.clone(),
            format!("mock {}", request.output_url),
            rx,
        ))
    }

    async fn stop(&self, _handle: TranscodeHandle) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// Relay
// ============================================================================

#[derive(Default)]
pub struct MockRelay {
    pub calls: AtomicUsize,
    pub delay_ms: AtomicU64,
    /// Non-zero: answer every offer with this HTTP status
    pub reject_status: AtomicU64,
    pub paths: Mutex<Vec<String>>,
}

impl MockRelay {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaRelay for MockRelay {
    async fn negotiate(&self, path: &str, _offer: &SdpOffer) -> Result<SdpAnswer> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.paths.lock().push(path.to_string());
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        match self.reject_status.load(Ordering::SeqCst) {
            0 => Ok(SdpAnswer::new(ANSWER)
                .with_resource(Some(format!("http://relay/{}/whep/res", path)))),
            status => Err(AppError::RelayRejected {
                status: status as u16,
                reason: "no stream is available on path".to_string(),
            }),
        }
    }

    async fn list_paths(&self) -> Result<Vec<RelayPath>> {
        Ok(Vec::new())
    }
}

// ============================================================================
// Viewer transport
// ============================================================================

#[derive(Default)]
pub struct MockTransport {
    dropped: Notify,
    pub offers: AtomicUsize,
    pub answers: AtomicUsize,
    /// Fail `apply_answer` while set
    pub reject_answers: AtomicBool,
}

impl MockTransport {
    /// Simulate the peer connection going away
    pub fn drop_connection(&self) {
        self.dropped.notify_one();
    }

    pub fn answers(&self) -> usize {
        self.answers.load(Ordering::SeqCst)
    }

    pub fn offers(&self) -> usize {
        self.offers.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerTransport for MockTransport {
    async fn wait_for_drop(&self) {
        self.dropped.notified().await;
    }

    async fn create_offer(&self) -> Result<SdpOffer> {
        self.offers.fetch_add(1, Ordering::SeqCst);
        Ok(offer())
    }

    async fn apply_answer(&self, _answer: SdpAnswer) -> Result<()> {
        if self.reject_answers.load(Ordering::SeqCst) {
            return Err(AppError::Internal("ICE failed".to_string()));
        }
        self.answers.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// Wiring
// ============================================================================

pub struct Harness {
    pub events: Arc<EventBus>,
    pub transcoder: Arc<MockTranscoder>,
    pub relay: Arc<MockRelay>,
    pub controller: Arc<StreamLifecycleController>,
    pub registry: Arc<SessionRegistry>,
    pub exchange: Arc<SignalingExchange>,
    pub supervisor: Arc<ReconnectionSupervisor>,
}

impl Harness {
    pub fn new(config: &AppConfig, transcoder: Arc<MockTranscoder>) -> Self {
        let events = Arc::new(EventBus::new());
        let relay = Arc::new(MockRelay::default());
        let controller =
            StreamLifecycleController::new(config, transcoder.clone(), events.clone());
        let registry = SessionRegistry::new(config, controller.clone(), events.clone());
        let exchange =
            SignalingExchange::new(config, relay.clone(), controller.clone(), registry.clone());
        let supervisor =
            ReconnectionSupervisor::new(config, registry.clone(), exchange.clone(), events.clone());
        Self {
            events,
            transcoder,
            relay,
            controller,
            registry,
            exchange,
            supervisor,
        }
    }
}

pub async fn advance(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

pub fn drain(rx: &mut broadcast::Receiver<SystemEvent>) -> Vec<SystemEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
