//! Stream lifecycle controller
//!
//! Owns the per-camera state machine and the upstream transcode handles.
//!
//! ```text
//! Idle -> Starting -> Live <-> Degraded
//!            |          \        /
//!            v           Stopping -> Idle
//!          Failed -> (retry) Starting
//!                 -> Idle
//! ```
//!
//! Every camera has its own slot guarded by an async mutex. Transcoder calls
//! run with the slot unlocked; state written before the call (`Starting`,
//! `Stopping`) keeps concurrent callers from starting or stopping twice.
//! Timers (idle teardown, start retry, failure hold) are cancellable tasks
//! that re-validate the slot under the lock before they act.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::RwLock;
use tokio::sync::{watch, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::types::{
    CameraStreamInfo, ControllerStats, FailureKind, StreamFailure, StreamState,
};
use crate::config::{AppConfig, CameraConfig, LifecycleConfig, RelayConfig, TranscodeConfig};
use crate::error::{AppError, Result};
use crate::events::{EventBus, SystemEvent};
use crate::transcode::{Liveness, TranscodeHandle, TranscodeRequest, Transcoder};
use crate::utils::{BackoffPolicy, LogThrottler};
use crate::warn_throttled;

/// Settings the controller reads on every decision
#[derive(Debug, Clone, Default)]
struct ControllerSettings {
    lifecycle: LifecycleConfig,
    relay: RelayConfig,
    transcode: TranscodeConfig,
}

/// A pending cancellable timer
struct Timer {
    id: u64,
    token: CancellationToken,
}

impl Timer {
    fn cancel(self) {
        self.token.cancel();
    }
}

struct CameraEntry {
    state: StreamState,
    last_transition: DateTime<Utc>,
    viewers: usize,
    last_error: Option<StreamFailure>,
    /// Failed start attempts in the current cycle
    start_attempts: u32,
    live_since: Option<DateTime<Utc>>,
    handle: Option<TranscodeHandle>,
    /// Bumped by shutdown/removal; an in-flight start from an older epoch is discarded
    epoch: u64,
    idle_timer: Option<Timer>,
    retry_timer: Option<Timer>,
    /// Removed from the table; lookups must fetch a fresh slot
    evicted: bool,
}

impl CameraEntry {
    fn new() -> Self {
        Self {
            state: StreamState::Idle,
            last_transition: Utc::now(),
            viewers: 0,
            last_error: None,
            start_attempts: 0,
            live_since: None,
            handle: None,
            epoch: 0,
            idle_timer: None,
            retry_timer: None,
            evicted: false,
        }
    }

    fn cancel_timers(&mut self) {
        if let Some(timer) = self.idle_timer.take() {
            timer.cancel();
        }
        if let Some(timer) = self.retry_timer.take() {
            timer.cancel();
        }
    }

    fn owns_handle(&self, handle_id: &str) -> bool {
        self.handle.as_ref().is_some_and(|h| h.id() == handle_id)
    }
}

struct CameraSlot {
    camera_id: String,
    entry: Mutex<CameraEntry>,
    state_tx: watch::Sender<StreamState>,
}

impl CameraSlot {
    fn new(camera_id: &str, last_error: Option<StreamFailure>) -> Self {
        let (state_tx, _) = watch::channel(StreamState::Idle);
        let mut entry = CameraEntry::new();
        entry.last_error = last_error;
        Self {
            camera_id: camera_id.to_string(),
            entry: Mutex::new(entry),
            state_tx,
        }
    }
}

/// Per-camera upstream lifecycle
pub struct StreamLifecycleController {
    slots: RwLock<HashMap<String, Arc<CameraSlot>>>,
    cameras: RwLock<HashMap<String, CameraConfig>>,
    /// Last failure of cameras whose slot was evicted
    retired_errors: RwLock<HashMap<String, StreamFailure>>,
    settings: RwLock<ControllerSettings>,
    transcoder: Arc<dyn Transcoder>,
    events: Arc<EventBus>,
    timer_seq: AtomicU64,
    starts_total: AtomicU64,
    stops_total: AtomicU64,
    shutting_down: AtomicBool,
    throttler: LogThrottler,
}

impl StreamLifecycleController {
    pub fn new(
        config: &AppConfig,
        transcoder: Arc<dyn Transcoder>,
        events: Arc<EventBus>,
    ) -> Arc<Self> {
        let controller = Arc::new(Self {
            slots: RwLock::new(HashMap::new()),
            cameras: RwLock::new(HashMap::new()),
            retired_errors: RwLock::new(HashMap::new()),
            settings: RwLock::new(ControllerSettings::default()),
            transcoder,
            events,
            timer_seq: AtomicU64::new(1),
            starts_total: AtomicU64::new(0),
            stops_total: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
            throttler: LogThrottler::with_secs(30),
        });
        controller.apply_settings(config);
        *controller.cameras.write() = camera_map(&config.cameras);
        controller
    }

    // ========================================================================
    // Configuration
    // ========================================================================

    fn apply_settings(&self, config: &AppConfig) {
        *self.settings.write() = ControllerSettings {
            lifecycle: config.lifecycle.clone(),
            relay: config.relay.clone(),
            transcode: config.transcode.clone(),
        };
    }

    fn lifecycle(&self) -> LifecycleConfig {
        self.settings.read().lifecycle.clone()
    }

    /// Apply a new configuration
    ///
    /// Cameras that were removed or disabled have their upstream stopped.
    pub async fn apply_config(self: &Arc<Self>, config: &AppConfig) {
        self.apply_settings(config);

        let removed: Vec<Arc<CameraSlot>> = {
            let new_cameras = camera_map(&config.cameras);
            let slots = self.slots.read();
            let removed = slots
                .values()
                .filter(|slot| {
                    new_cameras
                        .get(&slot.camera_id)
                        .map_or(true, |camera| !camera.enabled)
                })
                .cloned()
                .collect();
            self.retired_errors
                .write()
                .retain(|camera_id, _| new_cameras.contains_key(camera_id));
            *self.cameras.write() = new_cameras;
            removed
        };

        for slot in removed {
            info!(camera_id = %slot.camera_id, "Camera removed or disabled, stopping stream");
            self.shutdown_slot(&slot).await;
        }
    }

    /// Whether the camera is configured
    pub fn knows(&self, camera_id: &str) -> bool {
        self.cameras.read().contains_key(camera_id)
    }

    /// Relay path for a camera
    pub fn relay_path(&self, camera_id: &str) -> String {
        self.settings.read().relay.path_for(camera_id)
    }

    fn check_available(&self, camera_id: &str) -> Result<()> {
        match self.cameras.read().get(camera_id) {
            None => Err(AppError::NotFound(format!("camera {}", camera_id))),
            Some(camera) if !camera.enabled => Err(AppError::CameraUnavailable(format!(
                "camera {} is disabled",
                camera_id
            ))),
            Some(_) => Ok(()),
        }
    }

    fn transcode_request(&self, camera_id: &str) -> Result<TranscodeRequest> {
        let cameras = self.cameras.read();
        let camera = cameras
            .get(camera_id)
            .ok_or_else(|| AppError::NotFound(format!("camera {}", camera_id)))?;
        let settings = self.settings.read();
        Ok(TranscodeRequest::for_camera(
            camera,
            &settings.relay,
            &settings.transcode,
        ))
    }

    // ========================================================================
    // Slot table
    // ========================================================================

    fn slot(&self, camera_id: &str) -> Option<Arc<CameraSlot>> {
        self.slots.read().get(camera_id).cloned()
    }

    fn slot_or_create(&self, camera_id: &str) -> Arc<CameraSlot> {
        if let Some(slot) = self.slot(camera_id) {
            return slot;
        }
        self.slots
            .write()
            .entry(camera_id.to_string())
            .or_insert_with(|| {
                let last_error = self.retired_errors.write().remove(camera_id);
                Arc::new(CameraSlot::new(camera_id, last_error))
            })
            .clone()
    }

    /// Drop the slot from the table when it has nothing left to track
    fn try_evict(&self, slot: &Arc<CameraSlot>) {
        let mut slots = self.slots.write();
        match slots.get(&slot.camera_id) {
            Some(current) if Arc::ptr_eq(current, slot) => {}
            _ => return,
        }
        let Ok(mut entry) = slot.entry.try_lock() else {
            return;
        };
        if entry.viewers == 0
            && entry.state == StreamState::Idle
            && entry.idle_timer.is_none()
            && entry.retry_timer.is_none()
        {
            entry.evicted = true;
            if let Some(failure) = entry.last_error.take() {
                self.retired_errors
                    .write()
                    .insert(slot.camera_id.clone(), failure);
            }
            slots.remove(&slot.camera_id);
            debug!(camera_id = %slot.camera_id, "Evicted idle camera slot");
        }
    }

    fn next_timer(&self) -> Timer {
        Timer {
            id: self.timer_seq.fetch_add(1, Ordering::Relaxed),
            token: CancellationToken::new(),
        }
    }

    // ========================================================================
    // Transitions
    // ========================================================================

    fn transition(
        &self,
        slot: &CameraSlot,
        entry: &mut CameraEntry,
        to: StreamState,
        reason: Option<String>,
    ) {
        let previous = entry.state;
        if previous == to {
            return;
        }
        entry.state = to;
        entry.last_transition = Utc::now();
        slot.state_tx.send_replace(to);

        info!(
            camera_id = %slot.camera_id,
            from = %previous,
            to = %to,
            reason = reason.as_deref().unwrap_or(""),
            "Stream state changed"
        );
        self.events.publish(SystemEvent::StreamStateChanged {
            camera_id: slot.camera_id.clone(),
            state: to,
            previous,
            reason,
        });
    }

    fn publish_viewers(&self, camera_id: &str, viewers: usize) {
        self.events.publish(SystemEvent::ViewerCountChanged {
            camera_id: camera_id.to_string(),
            viewers,
        });
    }

    // ========================================================================
    // Start
    // ========================================================================

    /// Make sure the camera's upstream is running or being started
    ///
    /// Idle cameras are started and this call waits for the outcome of that
    /// first attempt. A start failure is not an error for the caller: the
    /// camera reports `Failed` while a retry is scheduled.
    pub async fn ensure_started(self: &Arc<Self>, camera_id: &str) -> Result<StreamState> {
        self.check_available(camera_id)?;

        loop {
            if self.shutting_down.load(Ordering::SeqCst) {
                return Err(AppError::ServiceUnavailable("shutting down".to_string()));
            }

            let slot = self.slot_or_create(camera_id);
            let entry = slot.entry.lock().await;
            if entry.evicted {
                continue;
            }

            match entry.state {
                StreamState::Idle => return self.run_start(&slot, entry).await,
                StreamState::Stopping => {
                    let mut rx = slot.state_tx.subscribe();
                    drop(entry);
                    let wait = self.lifecycle().stop_timeout() * 2;
                    if tokio::time::timeout(
                        wait,
                        rx.wait_for(|s| *s != StreamState::Stopping),
                    )
                    .await
                    .is_err()
                    {
                        return Err(AppError::ServiceUnavailable(format!(
                            "camera {} is still stopping",
                            camera_id
                        )));
                    }
                }
                state => return Ok(state),
            }
        }
    }

    /// Run one start attempt; `entry` must be Idle or Failed
    async fn run_start(
        self: &Arc<Self>,
        slot: &Arc<CameraSlot>,
        mut entry: MutexGuard<'_, CameraEntry>,
    ) -> Result<StreamState> {
        let attempt = entry.start_attempts + 1;
        let epoch = entry.epoch;
        let request = match self.transcode_request(&slot.camera_id) {
            Ok(request) => request,
            Err(e) => {
                self.transition(slot, &mut entry, StreamState::Idle, Some(e.to_string()));
                return Err(e);
            }
        };

        self.transition(slot, &mut entry, StreamState::Starting, None);
        drop(entry);

        let timeout = self.lifecycle().start_timeout();
        self.starts_total.fetch_add(1, Ordering::Relaxed);
        debug!(camera_id = %slot.camera_id, attempt, "Starting upstream");
        let result = tokio::time::timeout(timeout, self.transcoder.start(&request)).await;

        let mut entry = slot.entry.lock().await;

        if entry.epoch != epoch || self.shutting_down.load(Ordering::SeqCst) {
            // Shut down while starting: discard the new upstream
            match result {
                Ok(Ok(handle)) => {
                    entry.handle = Some(handle);
                    self.stop_locked(slot, entry).await;
                }
                _ => {
                    self.transition(slot, &mut entry, StreamState::Idle, None);
                    if entry.viewers == 0 {
                        drop(entry);
                        self.try_evict(slot);
                    }
                }
            }
            return Err(AppError::CameraUnavailable(format!(
                "camera {} was stopped while starting",
                slot.camera_id
            )));
        }

        match result {
            Ok(Ok(handle)) => {
                let handle_id = handle.id().to_string();
                let liveness = handle.liveness();
                info!(
                    camera_id = %slot.camera_id,
                    upstream = %handle.description(),
                    "Upstream started"
                );
                entry.handle = Some(handle);
                entry.start_attempts = 0;
                entry.live_since = Some(Utc::now());
                self.throttler.clear(&format!("{}:start", slot.camera_id));
                self.transition(slot, &mut entry, StreamState::Live, None);

                tokio::spawn(
                    self.clone()
                        .watch_liveness(slot.clone(), handle_id, liveness),
                );

                if entry.viewers == 0 {
                    // Every viewer left while the start was in flight
                    self.arm_idle_timer(slot, &mut entry, self.lifecycle().idle_grace());
                }
                Ok(StreamState::Live)
            }
            Ok(Err(e)) => {
                let failure = StreamFailure::new(FailureKind::StartFailed, e.to_string(), attempt);
                self.fail(slot, &mut entry, failure);
                Ok(self.release_after_failure(slot, entry))
            }
            Err(_) => {
                let failure = StreamFailure::new(
                    FailureKind::StartTimeout,
                    format!("start timed out after {}ms", timeout.as_millis()),
                    attempt,
                );
                self.fail(slot, &mut entry, failure);
                Ok(self.release_after_failure(slot, entry))
            }
        }
    }

    /// Unlock after `fail`; a slot that went straight to Idle is evicted
    fn release_after_failure(
        &self,
        slot: &Arc<CameraSlot>,
        entry: MutexGuard<'_, CameraEntry>,
    ) -> StreamState {
        let state = entry.state;
        drop(entry);
        if state == StreamState::Idle {
            self.try_evict(slot);
        }
        state
    }

    /// Record a failure and decide between retry, hold and Idle
    fn fail(self: &Arc<Self>, slot: &Arc<CameraSlot>, entry: &mut CameraEntry, failure: StreamFailure) {
        let lifecycle = self.lifecycle();
        let attempt = failure.attempt.max(1);
        let terminal = attempt >= lifecycle.max_start_attempts;

        warn_throttled!(
            self.throttler,
            &format!("{}:start", slot.camera_id),
            "Camera {} stream failed (attempt {}/{}): {}",
            slot.camera_id,
            attempt,
            lifecycle.max_start_attempts,
            failure.message
        );

        entry.start_attempts = attempt;
        entry.live_since = None;
        let message = failure.message.clone();
        entry.last_error = Some(failure);
        self.transition(slot, entry, StreamState::Failed, Some(message.clone()));
        self.events.publish(SystemEvent::StreamFailed {
            camera_id: slot.camera_id.clone(),
            reason: message,
            attempt,
            terminal,
        });

        if entry.viewers == 0 {
            entry.start_attempts = 0;
            self.transition(slot, entry, StreamState::Idle, None);
            return;
        }

        let delay = if terminal {
            lifecycle.failure_hold()
        } else {
            BackoffPolicy::for_start_retry(&lifecycle).delay(attempt)
        };
        self.schedule_retry(slot, entry, delay, terminal);
    }

    fn schedule_retry(
        self: &Arc<Self>,
        slot: &Arc<CameraSlot>,
        entry: &mut CameraEntry,
        delay: Duration,
        terminal: bool,
    ) {
        if let Some(timer) = entry.retry_timer.take() {
            timer.cancel();
        }
        let timer = self.next_timer();
        debug!(
            camera_id = %slot.camera_id,
            delay_ms = delay.as_millis() as u64,
            terminal,
            "Scheduled stream restart"
        );
        tokio::spawn(self.clone().retry_fired(
            slot.clone(),
            timer.id,
            timer.token.clone(),
            delay,
            terminal,
        ));
        entry.retry_timer = Some(timer);
    }

    fn retry_fired(
        self: Arc<Self>,
        slot: Arc<CameraSlot>,
        timer_id: u64,
        token: CancellationToken,
        delay: Duration,
        terminal: bool,
    ) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            let mut entry = slot.entry.lock().await;
            if !matches!(&entry.retry_timer, Some(t) if t.id == timer_id) {
                return;
            }
            entry.retry_timer = None;
            if entry.state != StreamState::Failed || self.shutting_down.load(Ordering::SeqCst) {
                return;
            }

            if terminal {
                // Hold elapsed: a fresh start cycle begins
                entry.start_attempts = 0;
            }
            if entry.viewers == 0 {
                entry.start_attempts = 0;
                self.transition(&slot, &mut entry, StreamState::Idle, None);
                drop(entry);
                self.try_evict(&slot);
                return;
            }
            if terminal {
                self.transition(&slot, &mut entry, StreamState::Idle, None);
            }
            let _ = self.run_start(&slot, entry).await;
        })
    }

    // ========================================================================
    // Liveness
    // ========================================================================

    async fn watch_liveness(
        self: Arc<Self>,
        slot: Arc<CameraSlot>,
        handle_id: String,
        mut rx: watch::Receiver<Liveness>,
    ) {
        loop {
            let liveness = rx.borrow_and_update().clone();
            let exited = match liveness {
                Liveness::Exited(code) => Some(code),
                other => {
                    if !self.apply_liveness(&slot, &handle_id, other).await {
                        return;
                    }
                    None
                }
            };
            if let Some(code) = exited {
                self.on_upstream_exit(&slot, &handle_id, code).await;
                return;
            }
            if rx.changed().await.is_err() {
                self.on_upstream_exit(&slot, &handle_id, None).await;
                return;
            }
        }
    }

    /// Returns false once the handle is no longer the slot's upstream
    async fn apply_liveness(&self, slot: &CameraSlot, handle_id: &str, liveness: Liveness) -> bool {
        let mut entry = slot.entry.lock().await;
        if !entry.owns_handle(handle_id) {
            return false;
        }
        match liveness {
            Liveness::Stalled(reason) if entry.state == StreamState::Live => {
                self.transition(slot, &mut entry, StreamState::Degraded, Some(reason));
            }
            Liveness::Running if entry.state == StreamState::Degraded => {
                self.transition(slot, &mut entry, StreamState::Live, None);
            }
            _ => {}
        }
        true
    }

    async fn on_upstream_exit(self: &Arc<Self>, slot: &Arc<CameraSlot>, handle_id: &str, code: Option<i32>) {
        let mut entry = slot.entry.lock().await;
        if !entry.owns_handle(handle_id)
            || !matches!(entry.state, StreamState::Live | StreamState::Degraded)
        {
            return;
        }
        let handle = entry.handle.take();
        entry.start_attempts = 0;
        let failure = StreamFailure::new(
            FailureKind::ProcessExited,
            format!("upstream exited (code {:?})", code),
            1,
        );
        self.fail(slot, &mut entry, failure);
        let evict = entry.state == StreamState::Idle;
        drop(entry);

        if let Some(handle) = handle {
            // Release transcoder bookkeeping for the dead process
            self.stops_total.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = self.transcoder.stop(handle).await {
                debug!(camera_id = %slot.camera_id, "Releasing exited upstream failed: {}", e);
            }
        }
        if evict {
            self.try_evict(slot);
        }
    }

    /// Live -> Degraded; other states are left alone
    pub async fn mark_degraded(&self, camera_id: &str, reason: &str) -> Result<StreamState> {
        if !self.knows(camera_id) {
            return Err(AppError::NotFound(format!("camera {}", camera_id)));
        }
        let Some(slot) = self.slot(camera_id) else {
            return Ok(StreamState::Idle);
        };
        let mut entry = slot.entry.lock().await;
        if entry.state == StreamState::Live {
            self.transition(&slot, &mut entry, StreamState::Degraded, Some(reason.to_string()));
        }
        Ok(entry.state)
    }

    /// Degraded -> Live; other states are left alone
    pub async fn mark_recovered(&self, camera_id: &str) -> Result<StreamState> {
        if !self.knows(camera_id) {
            return Err(AppError::NotFound(format!("camera {}", camera_id)));
        }
        let Some(slot) = self.slot(camera_id) else {
            return Ok(StreamState::Idle);
        };
        let mut entry = slot.entry.lock().await;
        if entry.state == StreamState::Degraded {
            self.transition(&slot, &mut entry, StreamState::Live, None);
        }
        Ok(entry.state)
    }

    // ========================================================================
    // Stop
    // ========================================================================

    /// Arm the idle teardown countdown when no viewer is attached
    pub async fn ensure_stopped_after_idle(self: &Arc<Self>, camera_id: &str, grace: Duration) {
        let Some(slot) = self.slot(camera_id) else {
            return;
        };
        let mut entry = slot.entry.lock().await;
        if entry.viewers > 0 || entry.evicted {
            return;
        }
        match entry.state {
            StreamState::Failed => {
                if let Some(timer) = entry.retry_timer.take() {
                    timer.cancel();
                }
                entry.start_attempts = 0;
                self.transition(&slot, &mut entry, StreamState::Idle, None);
                drop(entry);
                self.try_evict(&slot);
            }
            StreamState::Starting | StreamState::Live | StreamState::Degraded => {
                self.arm_idle_timer(&slot, &mut entry, grace);
            }
            StreamState::Idle | StreamState::Stopping => {}
        }
    }

    fn arm_idle_timer(self: &Arc<Self>, slot: &Arc<CameraSlot>, entry: &mut CameraEntry, grace: Duration) {
        if let Some(timer) = entry.idle_timer.take() {
            timer.cancel();
        }
        let timer = self.next_timer();
        debug!(
            camera_id = %slot.camera_id,
            grace_ms = grace.as_millis() as u64,
            "Idle countdown started"
        );
        tokio::spawn(self.clone().idle_fired(
            slot.clone(),
            timer.id,
            timer.token.clone(),
            grace,
        ));
        entry.idle_timer = Some(timer);
    }

    async fn idle_fired(
        self: Arc<Self>,
        slot: Arc<CameraSlot>,
        timer_id: u64,
        token: CancellationToken,
        grace: Duration,
    ) {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(grace) => {}
        }

        let mut entry = slot.entry.lock().await;
        if !matches!(&entry.idle_timer, Some(t) if t.id == timer_id) {
            return;
        }
        entry.idle_timer = None;
        if entry.viewers > 0 {
            return;
        }

        match entry.state {
            StreamState::Live | StreamState::Degraded => {
                info!(camera_id = %slot.camera_id, "No viewers for {:?}, stopping stream", grace);
                self.stop_locked(&slot, entry).await;
            }
            StreamState::Failed => {
                entry.start_attempts = 0;
                if let Some(timer) = entry.retry_timer.take() {
                    timer.cancel();
                }
                self.transition(&slot, &mut entry, StreamState::Idle, None);
                drop(entry);
                self.try_evict(&slot);
            }
            // Starting re-arms the countdown when the start commits
            _ => {}
        }
    }

    /// Stopping -> transcoder stop -> Idle; the lock is released during the stop
    async fn stop_locked(&self, slot: &Arc<CameraSlot>, mut entry: MutexGuard<'_, CameraEntry>) {
        let handle = entry.handle.take();
        if let Some(timer) = entry.idle_timer.take() {
            timer.cancel();
        }
        self.transition(slot, &mut entry, StreamState::Stopping, None);
        drop(entry);

        let mut stop_error = None;
        if let Some(handle) = handle {
            let timeout = self.lifecycle().stop_timeout();
            self.stops_total.fetch_add(1, Ordering::Relaxed);
            match tokio::time::timeout(timeout, self.transcoder.stop(handle)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(camera_id = %slot.camera_id, "Upstream stop failed, forcing Idle: {}", e);
                    stop_error = Some(e.to_string());
                }
                Err(_) => {
                    warn!(
                        camera_id = %slot.camera_id,
                        "Upstream stop timed out after {:?}, forcing Idle", timeout
                    );
                    stop_error = Some(format!("stop timed out after {}ms", timeout.as_millis()));
                }
            }
        }

        let mut entry = slot.entry.lock().await;
        if let Some(message) = stop_error {
            entry.last_error = Some(StreamFailure::new(FailureKind::StopFailed, message, 0));
        }
        entry.live_since = None;
        entry.start_attempts = 0;
        self.transition(slot, &mut entry, StreamState::Idle, None);
        let evict = entry.viewers == 0;
        drop(entry);
        if evict {
            self.try_evict(slot);
        }
    }

    /// Cancel timers and stop the upstream of one slot
    async fn shutdown_slot(&self, slot: &Arc<CameraSlot>) {
        let mut entry = slot.entry.lock().await;
        entry.cancel_timers();
        entry.epoch += 1;
        match entry.state {
            StreamState::Live | StreamState::Degraded => self.stop_locked(slot, entry).await,
            StreamState::Failed => {
                entry.start_attempts = 0;
                self.transition(slot, &mut entry, StreamState::Idle, None);
                let evict = entry.viewers == 0;
                drop(entry);
                if evict {
                    self.try_evict(slot);
                }
            }
            // In-flight starts observe the epoch change when they commit
            _ => {}
        }
    }

    /// Stop every upstream; no new start is accepted afterwards
    pub async fn stop_all(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let slots: Vec<Arc<CameraSlot>> = self.slots.read().values().cloned().collect();
        info!("Stopping {} camera stream(s)", slots.len());
        futures::future::join_all(slots.iter().map(|slot| self.shutdown_slot(slot))).await;
    }

    // ========================================================================
    // Viewers (driven by the session registry)
    // ========================================================================

    /// Count a new viewer; cancels a pending idle teardown
    pub(crate) async fn attach_viewer(&self, camera_id: &str, limit: usize) -> Result<usize> {
        self.check_available(camera_id)?;
        loop {
            let slot = self.slot_or_create(camera_id);
            let mut entry = slot.entry.lock().await;
            if entry.evicted {
                continue;
            }
            if limit > 0 && entry.viewers >= limit {
                return Err(AppError::ServiceUnavailable(format!(
                    "camera {} already has {} viewers",
                    camera_id, entry.viewers
                )));
            }
            if let Some(timer) = entry.idle_timer.take() {
                debug!(camera_id = %camera_id, "Idle countdown cancelled by new viewer");
                timer.cancel();
            }
            entry.viewers += 1;
            self.publish_viewers(camera_id, entry.viewers);
            return Ok(entry.viewers);
        }
    }

    /// Uncount a viewer; returns the remaining count
    pub(crate) async fn detach_viewer(&self, camera_id: &str) -> usize {
        let Some(slot) = self.slot(camera_id) else {
            return 0;
        };
        let mut entry = slot.entry.lock().await;
        if entry.viewers == 0 {
            return 0;
        }
        entry.viewers -= 1;
        self.publish_viewers(camera_id, entry.viewers);
        entry.viewers
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Wait until the camera is no longer Starting
    pub async fn wait_until_settled(&self, camera_id: &str, timeout: Duration) -> StreamState {
        let Some(slot) = self.slot(camera_id) else {
            return StreamState::Idle;
        };
        let mut rx = slot.state_tx.subscribe();
        let _ = tokio::time::timeout(timeout, rx.wait_for(|s| *s != StreamState::Starting)).await;
        let state = *rx.borrow();
        state
    }

    /// Current state without waiting for the slot lock
    pub fn state(&self, camera_id: &str) -> StreamState {
        self.slot(camera_id)
            .map(|slot| *slot.state_tx.borrow())
            .unwrap_or(StreamState::Idle)
    }

    pub async fn viewer_count(&self, camera_id: &str) -> usize {
        match self.slot(camera_id) {
            Some(slot) => slot.entry.lock().await.viewers,
            None => 0,
        }
    }

    pub async fn stream_info(&self, camera_id: &str) -> Result<CameraStreamInfo> {
        if !self.knows(camera_id) {
            return Err(AppError::NotFound(format!("camera {}", camera_id)));
        }
        Ok(match self.slot(camera_id) {
            Some(slot) => {
                let entry = slot.entry.lock().await;
                snapshot(camera_id, &entry)
            }
            None => self.idle_snapshot(camera_id),
        })
    }

    /// Snapshot of every configured camera, sorted by id
    pub async fn list_streams(&self) -> Vec<CameraStreamInfo> {
        let mut ids: Vec<String> = self.cameras.read().keys().cloned().collect();
        ids.sort();
        let mut streams = Vec::with_capacity(ids.len());
        for id in ids {
            match self.slot(&id) {
                Some(slot) => {
                    let entry = slot.entry.lock().await;
                    streams.push(snapshot(&id, &entry));
                }
                None => streams.push(self.idle_snapshot(&id)),
            }
        }
        streams
    }

    fn idle_snapshot(&self, camera_id: &str) -> CameraStreamInfo {
        let mut entry = CameraEntry::new();
        entry.last_error = self.retired_errors.read().get(camera_id).cloned();
        snapshot(camera_id, &entry)
    }

    pub async fn stats(&self) -> ControllerStats {
        let mut stats = ControllerStats {
            cameras: self.cameras.read().len(),
            starts_total: self.starts_total.load(Ordering::Relaxed),
            stops_total: self.stops_total.load(Ordering::Relaxed),
            ..Default::default()
        };
        let slots: Vec<Arc<CameraSlot>> = self.slots.read().values().cloned().collect();
        for slot in slots {
            let entry = slot.entry.lock().await;
            stats.viewers += entry.viewers;
            match entry.state {
                StreamState::Live => stats.live += 1,
                StreamState::Degraded => stats.degraded += 1,
                StreamState::Starting => stats.starting += 1,
                StreamState::Failed => stats.failed += 1,
                _ => {}
            }
        }
        stats
    }
}

fn camera_map(cameras: &[CameraConfig]) -> HashMap<String, CameraConfig> {
    cameras.iter().map(|c| (c.id.clone(), c.clone())).collect()
}

fn snapshot(camera_id: &str, entry: &CameraEntry) -> CameraStreamInfo {
    CameraStreamInfo {
        camera_id: camera_id.to_string(),
        state: entry.state,
        last_transition: entry.last_transition,
        viewer_count: entry.viewers,
        last_error: entry.last_error.clone(),
        start_attempts: entry.start_attempts,
        live_since: entry.live_since,
        idle_countdown: entry.idle_timer.is_some(),
        upstream: entry.handle.as_ref().map(|h| h.description().to_string()),
    }
}
