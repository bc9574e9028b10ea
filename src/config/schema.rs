use serde::{Deserialize, Serialize};
use std::time::Duration;
use typeshare::typeshare;

/// Main application configuration
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Cameras that viewers may request
    pub cameras: Vec<CameraConfig>,
    /// Stream lifecycle (start/stop/idle) settings
    pub lifecycle: LifecycleConfig,
    /// Viewer reconnection policy
    pub reconnect: ReconnectConfig,
    /// Media relay (WHEP) settings
    pub relay: RelayConfig,
    /// FFmpeg transcode settings
    pub transcode: TranscodeConfig,
    /// Viewer session limits
    pub sessions: SessionConfig,
    /// Status event fan-out settings
    pub events: EventsConfig,
    /// Web server settings
    pub web: WebConfig,
}

impl AppConfig {
    /// Look up a camera by id
    pub fn camera(&self, camera_id: &str) -> Option<&CameraConfig> {
        self.cameras.iter().find(|c| c.id == camera_id)
    }

    /// Validate cross-field constraints before the config is stored
    pub fn validate(&self) -> std::result::Result<(), String> {
        let mut seen = std::collections::HashSet::new();
        for camera in &self.cameras {
            if camera.id.trim().is_empty() {
                return Err("camera id must not be empty".to_string());
            }
            if !camera.id.chars().all(is_path_safe) {
                return Err(format!(
                    "camera id '{}' may only contain letters, digits, '_', '.' and '-'",
                    camera.id
                ));
            }
            if !seen.insert(camera.id.as_str()) {
                return Err(format!("duplicate camera id '{}'", camera.id));
            }
            if !camera.url.starts_with("rtsp://") && !camera.url.starts_with("rtsps://") {
                return Err(format!("camera '{}' url must be an rtsp:// url", camera.id));
            }
        }
        if self.reconnect.jitter_ratio < 0.0 || self.reconnect.jitter_ratio > 1.0 {
            return Err("reconnect.jitter_ratio must be within [0, 1]".to_string());
        }
        if self.lifecycle.max_start_attempts == 0 {
            return Err("lifecycle.max_start_attempts must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Camera ids are used verbatim as relay URL path segments
fn is_path_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')
}

/// One camera's upstream source
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CameraConfig {
    /// Unique camera identifier, also the relay path segment
    pub id: String,
    /// Display name
    pub name: String,
    /// RTSP source URL (credentials may be embedded or given separately)
    pub url: String,
    /// RTSP username, injected into the URL when it carries none
    pub username: Option<String>,
    /// RTSP password
    pub password: Option<String>,
    /// Whether viewers may request this camera
    pub enabled: bool,
    /// Output frame rate (None = transcode default)
    pub fps: Option<u32>,
    /// Output bitrate, e.g. "2M" (None = transcode default)
    pub bitrate: Option<String>,
    /// Output resolution, e.g. "1280x720" (None = source resolution)
    pub resolution: Option<String>,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            url: String::new(),
            username: None,
            password: None,
            enabled: true,
            fps: None,
            bitrate: None,
            resolution: None,
        }
    }
}

impl CameraConfig {
    /// Source URL with credentials injected when the URL has none
    pub fn source_url(&self) -> String {
        let (Some(user), Some(pass)) = (self.username.as_deref(), self.password.as_deref()) else {
            return self.url.clone();
        };
        if user.is_empty() || self.url.contains('@') {
            return self.url.clone();
        }
        match reqwest::Url::parse(&self.url) {
            Ok(mut url) => {
                if url.set_username(user).is_err() || url.set_password(Some(pass)).is_err() {
                    return self.url.clone();
                }
                url.to_string()
            }
            Err(_) => self.url.clone(),
        }
    }

    /// Source URL with credentials removed, safe for logs and API output
    pub fn redacted_url(&self) -> String {
        match reqwest::Url::parse(&self.url) {
            Ok(mut url) => {
                let _ = url.set_username("");
                let _ = url.set_password(None);
                url.to_string()
            }
            Err(_) => "<invalid url>".to_string(),
        }
    }
}

/// Stream lifecycle configuration
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Delay between last viewer leaving and upstream teardown
    pub idle_grace_secs: u64,
    /// Upper bound for one transcoder start call
    pub start_timeout_ms: u64,
    /// Upper bound for one transcoder stop call
    pub stop_timeout_ms: u64,
    /// Start attempts per start cycle before the camera stays Failed
    pub max_start_attempts: u32,
    /// First start retry delay
    pub start_retry_base_ms: u64,
    /// Start retry delay cap
    pub start_retry_max_ms: u64,
    /// How long an exhausted camera stays Failed before returning to Idle
    pub failure_hold_secs: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            idle_grace_secs: 10,
            start_timeout_ms: 10_000,
            stop_timeout_ms: 5_000,
            max_start_attempts: 3,
            start_retry_base_ms: 1_000,
            start_retry_max_ms: 8_000,
            failure_hold_secs: 30,
        }
    }
}

impl LifecycleConfig {
    pub fn idle_grace(&self) -> Duration {
        Duration::from_secs(self.idle_grace_secs)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn failure_hold(&self) -> Duration {
        Duration::from_secs(self.failure_hold_secs)
    }
}

/// Viewer reconnection policy
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt
    pub base_delay_ms: u64,
    /// Reconnection delay cap
    pub max_delay_ms: u64,
    /// Consecutive failures tolerated before the session is closed
    pub max_retries: u32,
    /// Random extra delay as a fraction of the computed delay (0..=1)
    pub jitter_ratio: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            max_delay_ms: 8_000,
            max_retries: 5,
            jitter_ratio: 0.2,
        }
    }
}

/// Media relay configuration (MediaMTX or any WHEP server)
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    /// Base URL of the WHEP server; offers go to `{base}/{path}/whep`
    pub whep_base_url: String,
    /// Base URL of the relay control API (path listing)
    pub api_base_url: String,
    /// Appended to the camera id to form the relay path
    pub path_suffix: String,
    /// Local bound on one offer/answer exchange
    pub negotiation_timeout_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            whep_base_url: "http://127.0.0.1:8889".to_string(),
            api_base_url: "http://127.0.0.1:9997".to_string(),
            path_suffix: String::new(),
            negotiation_timeout_ms: 5_000,
        }
    }
}

impl RelayConfig {
    /// Relay path name for a camera
    pub fn path_for(&self, camera_id: &str) -> String {
        format!("{}{}", camera_id, self.path_suffix)
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }
}

/// FFmpeg transcode configuration
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TranscodeConfig {
    /// FFmpeg binary
    pub ffmpeg_path: String,
    /// H.264 encoder name, or "auto" to probe hardware encoders
    pub encoder: String,
    /// RTSP publish base of the relay; output goes to `{base}/{path}`
    pub rtsp_publish_base: String,
    /// Default output frame rate
    pub fps: u32,
    /// Default output bitrate
    pub bitrate: String,
    /// Process must still be alive after this long to count as started
    pub startup_probe_ms: u64,
    /// Time between `q` on stdin and a hard kill
    pub stop_grace_ms: u64,
    /// No progress output for this long marks the stream stalled
    pub stall_timeout_secs: u64,
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            encoder: "auto".to_string(),
            rtsp_publish_base: "rtsp://127.0.0.1:8554".to_string(),
            fps: 25,
            bitrate: "2M".to_string(),
            startup_probe_ms: 1_000,
            stop_grace_ms: 500,
            stall_timeout_secs: 10,
        }
    }
}

/// Viewer session configuration
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Concurrent viewers allowed per camera
    pub max_viewers_per_camera: u32,
    /// Sessions stuck negotiating/reconnecting longer than this are closed
    pub stale_session_timeout_secs: u64,
    /// Interval of the stale session sweep
    pub cleanup_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_viewers_per_camera: 32,
            stale_session_timeout_secs: 120,
            cleanup_interval_secs: 30,
        }
    }
}

/// Status event configuration
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EventsConfig {
    /// Per-subscriber queue length; the oldest events are dropped beyond it
    pub channel_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
        }
    }
}

/// Web server configuration
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WebConfig {
    /// HTTP port
    pub http_port: u16,
    /// HTTPS port
    pub https_port: u16,
    /// Bind address
    pub bind_address: String,
    /// Additional bind addresses (takes precedence over bind_address when set)
    pub bind_addresses: Vec<String>,
    /// Enable HTTPS
    pub https_enabled: bool,
    /// Custom SSL certificate path
    pub ssl_cert_path: Option<String>,
    /// Custom SSL key path
    pub ssl_key_path: Option<String>,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            https_port: 8443,
            bind_address: "0.0.0.0".to_string(),
            bind_addresses: Vec::new(),
            https_enabled: false,
            ssl_cert_path: None,
            ssl_key_path: None,
        }
    }
}
