//! Transcode process boundary
//!
//! The controller owns one [`TranscodeHandle`] per live camera and talks to
//! the process only through the [`Transcoder`] trait, so tests can swap the
//! FFmpeg implementation for an in-memory one.

pub mod ffmpeg;

pub use ffmpeg::FfmpegTranscoder;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::watch;

use crate::config::{CameraConfig, RelayConfig, TranscodeConfig};
use crate::error::Result;

/// Health reported by a running upstream process
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum Liveness {
    /// Producing output
    Running,
    /// Alive but not producing output
    Stalled(String),
    /// Process is gone (exit code when known)
    Exited(Option<i32>),
}

/// Everything needed to start one camera's upstream
#[derive(Debug, Clone, PartialEq)]
pub struct TranscodeRequest {
    pub camera_id: String,
    /// RTSP source, credentials included
    pub source_url: String,
    /// Relay publish URL
    pub output_url: String,
    pub fps: u32,
    pub bitrate: String,
    pub resolution: Option<String>,
}

impl TranscodeRequest {
    /// Build the request for a configured camera
    pub fn for_camera(
        camera: &CameraConfig,
        relay: &RelayConfig,
        transcode: &TranscodeConfig,
    ) -> Self {
        Self {
            camera_id: camera.id.clone(),
            source_url: camera.source_url(),
            output_url: format!(
                "{}/{}",
                transcode.rtsp_publish_base.trim_end_matches('/'),
                relay.path_for(&camera.id)
            ),
            fps: camera.fps.unwrap_or(transcode.fps),
            bitrate: camera
                .bitrate
                .clone()
                .unwrap_or_else(|| transcode.bitrate.clone()),
            resolution: camera.resolution.clone().filter(|r| !r.is_empty()),
        }
    }
}

/// Opaque handle to a started upstream process
#[derive(Debug)]
pub struct TranscodeHandle {
    id: String,
    camera_id: String,
    description: String,
    liveness: watch::Receiver<Liveness>,
}

impl TranscodeHandle {
    pub fn new(
        camera_id: impl Into<String>,
        description: impl Into<String>,
        liveness: watch::Receiver<Liveness>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            camera_id: camera_id.into(),
            description: description.into(),
            liveness,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    /// Human readable description (e.g. "ffmpeg pid 1234 (libx264)")
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Subscribe to liveness updates of this process
    pub fn liveness(&self) -> watch::Receiver<Liveness> {
        self.liveness.clone()
    }
}

/// Starts and stops upstream transcode processes
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Start the upstream for a camera; returns once it is publishing
    async fn start(&self, request: &TranscodeRequest) -> Result<TranscodeHandle>;

    /// Stop a previously started upstream
    async fn stop(&self, handle: TranscodeHandle) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_uses_camera_overrides() {
        let camera = CameraConfig {
            id: "front".into(),
            url: "rtsp://10.0.0.2/s1".into(),
            fps: Some(15),
            resolution: Some("1280x720".into()),
            ..Default::default()
        };
        let relay = RelayConfig {
            path_suffix: "_hd".into(),
            ..Default::default()
        };
        let transcode = TranscodeConfig::default();

        let request = TranscodeRequest::for_camera(&camera, &relay, &transcode);
        assert_eq!(request.output_url, "rtsp://127.0.0.1:8554/front_hd");
        assert_eq!(request.fps, 15);
        assert_eq!(request.bitrate, "2M");
        assert_eq!(request.resolution.as_deref(), Some("1280x720"));
    }
}
