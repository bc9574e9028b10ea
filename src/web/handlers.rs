use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::error::{AppError, Result};
use crate::reconnect::ReconnectPlan;
use crate::relay::RelayPath;
use crate::session::{CloseReason, Registration, ViewerSessionInfo};
use crate::signaling::SdpOffer;
use crate::state::AppState;
use crate::stream::{CameraStreamInfo, ControllerStats, StreamState};

/// Relay reachability probe bound for the health endpoint
const RELAY_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Generic success response
#[derive(Serialize)]
pub struct SuccessResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl SuccessResponse {
    fn ok(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: true,
            message: Some(message.into()),
        })
    }
}

/// `{"success": true, ...data}`
#[derive(Serialize)]
pub struct DataResponse<T: Serialize> {
    pub success: bool,
    #[serde(flatten)]
    pub data: T,
}

fn data<T: Serialize>(data: T) -> Json<DataResponse<T>> {
    Json(DataResponse {
        success: true,
        data,
    })
}

// ============================================================================
// Health & Stats
// ============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub relay_reachable: bool,
    pub cameras: usize,
    pub sessions: usize,
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let relay_reachable = matches!(
        tokio::time::timeout(RELAY_PROBE_TIMEOUT, state.relay.list_paths()).await,
        Ok(Ok(_))
    );
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        relay_reachable,
        cameras: state.config.get().cameras.len(),
        sessions: state.registry.session_count(),
    })
}

#[derive(Serialize)]
pub struct StatsResponse {
    pub streams: ControllerStats,
    pub sessions: usize,
    pub reconnecting_supervisions: usize,
    pub event_subscribers: usize,
}

pub async fn stats(State(state): State<Arc<AppState>>) -> Json<DataResponse<StatsResponse>> {
    data(StatsResponse {
        streams: state.controller.stats().await,
        sessions: state.registry.session_count(),
        reconnecting_supervisions: state.supervisor.active_supervisions(),
        event_subscribers: state.events.subscriber_count(),
    })
}

// ============================================================================
// Cameras
// ============================================================================

#[derive(Serialize)]
pub struct StreamList {
    pub streams: Vec<CameraStreamInfo>,
}

pub async fn list_cameras(State(state): State<Arc<AppState>>) -> Json<DataResponse<StreamList>> {
    data(StreamList {
        streams: state.controller.list_streams().await,
    })
}

pub async fn get_camera(
    State(state): State<Arc<AppState>>,
    Path(camera_id): Path<String>,
) -> Result<Json<DataResponse<CameraStreamInfo>>> {
    Ok(data(state.controller.stream_info(&camera_id).await?))
}

pub async fn register_viewer(
    State(state): State<Arc<AppState>>,
    Path(camera_id): Path<String>,
) -> Result<Json<DataResponse<Registration>>> {
    Ok(data(state.registry.register_viewer(&camera_id).await?))
}

#[derive(Deserialize)]
pub struct DegradedRequest {
    pub reason: String,
    /// `true` reports recovery instead
    #[serde(default)]
    pub recovered: bool,
}

#[derive(Serialize)]
pub struct StateResponse {
    pub state: StreamState,
}

pub async fn mark_degraded(
    State(state): State<Arc<AppState>>,
    Path(camera_id): Path<String>,
    Json(req): Json<DegradedRequest>,
) -> Result<Json<DataResponse<StateResponse>>> {
    let new_state = if req.recovered {
        state.controller.mark_recovered(&camera_id).await?
    } else {
        state.controller.mark_degraded(&camera_id, &req.reason).await?
    };
    Ok(data(StateResponse { state: new_state }))
}

/// WHEP endpoint: raw SDP offer in, raw SDP answer out
///
/// Registers a viewer, negotiates once and answers `201 Created` with the
/// session resource in `Location`. The session is released again when the
/// negotiation fails.
pub async fn whep(
    State(state): State<Arc<AppState>>,
    Path(camera_id): Path<String>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/sdp");
    if !content_type.starts_with("application/sdp") {
        return whep_error(AppError::BadRequest(format!(
            "unsupported content type {}",
            content_type
        )));
    }

    let offer = SdpOffer::new(body);
    if let Err(e) = offer.validate() {
        return whep_error(e);
    }

    let registration = match state.registry.register_viewer(&camera_id).await {
        Ok(registration) => registration,
        Err(e) => return whep_error(e),
    };
    let session_id = registration.session_id;

    match state.exchange.negotiate(&session_id, &offer).await {
        Ok(answer) => {
            info!(camera_id = %camera_id, session_id = %session_id, "WHEP session established");
            let mut response = (StatusCode::CREATED, answer.sdp).into_response();
            let headers = response.headers_mut();
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/sdp"),
            );
            if let Ok(location) = HeaderValue::from_str(&format!("/api/sessions/{}", session_id)) {
                headers.insert(header::LOCATION, location);
            }
            response
        }
        Err(e) => {
            let _ = state
                .registry
                .close_session(&session_id, CloseReason::ViewerLeft)
                .await;
            whep_error(e)
        }
    }
}

fn whep_error(e: AppError) -> Response {
    warn!(error_kind = e.kind(), "WHEP request failed: {}", e);
    (e.http_status(), e.to_string()).into_response()
}

// ============================================================================
// Sessions
// ============================================================================

#[derive(Deserialize)]
pub struct SessionQuery {
    pub camera_id: Option<String>,
}

#[derive(Serialize)]
pub struct SessionList {
    pub sessions: Vec<ViewerSessionInfo>,
}

pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SessionQuery>,
) -> Json<DataResponse<SessionList>> {
    data(SessionList {
        sessions: state.registry.list_sessions(query.camera_id.as_deref()),
    })
}

pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<DataResponse<ViewerSessionInfo>>> {
    state
        .registry
        .get_session(&session_id)
        .map(data)
        .ok_or_else(|| AppError::NotFound(format!("session {}", session_id)))
}

#[derive(Deserialize)]
pub struct OfferRequest {
    pub sdp: String,
}

#[derive(Serialize)]
pub struct AnswerResponse {
    pub session_id: String,
    pub sdp: String,
}

pub async fn session_offer(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(req): Json<OfferRequest>,
) -> Result<Json<DataResponse<AnswerResponse>>> {
    let answer = state
        .exchange
        .negotiate(&session_id, &SdpOffer::new(req.sdp))
        .await?;
    Ok(data(AnswerResponse {
        session_id,
        sdp: answer.sdp,
    }))
}

/// Browser reported a dropped connection; answers with the retry plan
pub async fn session_drop(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<DataResponse<ReconnectPlan>>> {
    Ok(data(state.supervisor.on_drop(&session_id).await?))
}

pub async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<SuccessResponse>> {
    state.supervisor.cancel(&session_id);
    state.registry.unregister_viewer(&session_id).await?;
    Ok(SuccessResponse::ok(format!("Session {} closed", session_id)))
}

// ============================================================================
// Relay
// ============================================================================

#[derive(Serialize)]
pub struct RelayPathList {
    pub paths: Vec<RelayPath>,
}

pub async fn relay_paths(
    State(state): State<Arc<AppState>>,
) -> Result<Json<DataResponse<RelayPathList>>> {
    Ok(data(RelayPathList {
        paths: state.relay.list_paths().await?,
    }))
}

// ============================================================================
// Configuration
// ============================================================================

pub async fn get_config(State(state): State<Arc<AppState>>) -> Json<DataResponse<AppConfig>> {
    data((*state.config.get()).clone())
}

#[derive(Deserialize)]
pub struct UpdateConfigRequest {
    #[serde(flatten)]
    pub updates: serde_json::Value,
}

/// Merge a partial configuration into the current one and store it
pub async fn update_config(
    State(state): State<Arc<AppState>>,
    Json(req): Json<UpdateConfigRequest>,
) -> Result<Json<SuccessResponse>> {
    let current = serde_json::to_value(&*state.config.get())?;
    let merged = merge_json(current, req.updates);
    let new_config: AppConfig = serde_json::from_value(merged)
        .map_err(|e| AppError::BadRequest(format!("Invalid config format: {}", e)))?;

    state.config.set(new_config).await?;
    info!("Config updated");
    Ok(SuccessResponse::ok("Configuration updated"))
}

fn merge_json(base: serde_json::Value, updates: serde_json::Value) -> serde_json::Value {
    match (base, updates) {
        (serde_json::Value::Object(mut base), serde_json::Value::Object(updates)) => {
            for (key, value) in updates {
                let merged = match base.remove(&key) {
                    Some(base_value) => merge_json(base_value, value),
                    None => value,
                };
                base.insert(key, merged);
            }
            serde_json::Value::Object(base)
        }
        (_, updates) => updates,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_json_nested() {
        let base = json!({"lifecycle": {"idle_grace_secs": 10, "start_timeout_ms": 10000}, "cameras": []});
        let updates = json!({"lifecycle": {"idle_grace_secs": 3}, "cameras": [{"id": "cam1"}]});

        let merged = merge_json(base, updates);
        assert_eq!(merged["lifecycle"]["idle_grace_secs"], 3);
        assert_eq!(merged["lifecycle"]["start_timeout_ms"], 10000);
        assert_eq!(merged["cameras"][0]["id"], "cam1");
    }

    #[test]
    fn test_data_response_flattens() {
        let json = serde_json::to_value(DataResponse {
            success: true,
            data: StateResponse {
                state: StreamState::Live,
            },
        })
        .unwrap();
        assert_eq!(json, json!({"success": true, "state": "live"}));
    }
}
