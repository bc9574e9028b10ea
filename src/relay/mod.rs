//! Media relay client
//!
//! The relay (MediaMTX in production) receives the transcoded RTSP feed and
//! serves it to browsers over WebRTC. Viewers negotiate with it over WHEP:
//! one HTTP POST carrying the SDP offer, answered with the SDP answer.

use std::time::Instant;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::header::{CONTENT_TYPE, LOCATION};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::RelayConfig;
use crate::error::{AppError, Result};
use crate::signaling::{SdpAnswer, SdpOffer};

const SDP_CONTENT_TYPE: &str = "application/sdp";

/// Longest relay error body echoed back to callers
const MAX_REASON_LEN: usize = 200;

/// One path published on the relay
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelayPath {
    pub name: String,
    /// Whether a publisher is attached
    pub ready: bool,
    /// Number of connected readers
    pub readers: usize,
}

/// Media relay operations used by the coordinator
#[async_trait]
pub trait MediaRelay: Send + Sync {
    /// Exchange an offer for an answer on `path`; exactly one attempt
    async fn negotiate(&self, path: &str, offer: &SdpOffer) -> Result<SdpAnswer>;

    /// Paths currently known to the relay
    async fn list_paths(&self) -> Result<Vec<RelayPath>>;
}

#[derive(Deserialize)]
struct PathList {
    #[serde(default)]
    items: Vec<PathItem>,
}

#[derive(Deserialize)]
struct PathItem {
    name: String,
    #[serde(default)]
    ready: bool,
    #[serde(default)]
    readers: Vec<serde_json::Value>,
}

/// WHEP client for MediaMTX
pub struct WhepRelay {
    client: reqwest::Client,
    config: RwLock<RelayConfig>,
}

impl WhepRelay {
    pub fn new(config: RelayConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("sentinel-live/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            config: RwLock::new(config),
        })
    }

    pub fn set_config(&self, config: RelayConfig) {
        *self.config.write() = config;
    }

    fn whep_url(&self, path: &str) -> String {
        let base = self.config.read().whep_base_url.clone();
        format!("{}/{}/whep", base.trim_end_matches('/'), path)
    }

    fn paths_url(&self) -> String {
        let base = self.config.read().api_base_url.clone();
        format!("{}/v3/paths/list", base.trim_end_matches('/'))
    }
}

#[async_trait]
impl MediaRelay for WhepRelay {
    async fn negotiate(&self, path: &str, offer: &SdpOffer) -> Result<SdpAnswer> {
        let url = self.whep_url(path);
        let started = Instant::now();

        let response = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, SDP_CONTENT_TYPE)
            .body(offer.sdp.clone())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let mut reason = body.trim().to_string();
            if reason.is_empty() {
                reason = status.canonical_reason().unwrap_or("unknown").to_string();
            }
            if reason.len() > MAX_REASON_LEN {
                let mut cut = MAX_REASON_LEN;
                while !reason.is_char_boundary(cut) {
                    cut -= 1;
                }
                reason.truncate(cut);
            }
            debug!(path = %path, status = status.as_u16(), "Relay rejected offer");
            return Err(AppError::RelayRejected {
                status: status.as_u16(),
                reason,
            });
        }

        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|loc| response.url().join(loc).ok())
            .map(|u| u.to_string());
        let sdp = response.text().await?;

        debug!(
            path = %path,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Relay answered offer"
        );
        Ok(SdpAnswer::new(sdp).with_resource(location))
    }

    async fn list_paths(&self) -> Result<Vec<RelayPath>> {
        let list: PathList = self
            .client
            .get(self.paths_url())
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(list
            .items
            .into_iter()
            .map(|item| RelayPath {
                name: item.name,
                ready: item.ready,
                readers: item.readers.len(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Bytes,
        extract::Path,
        http::{HeaderMap, StatusCode},
        response::IntoResponse,
        routing::{get, post},
        Json, Router,
    };

    const OFFER: &str = "v=0\r\ns=-\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\n";

    async fn whep(Path(path): Path<String>, headers: HeaderMap, body: Bytes) -> impl IntoResponse {
        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if content_type != SDP_CONTENT_TYPE {
            return (StatusCode::UNSUPPORTED_MEDIA_TYPE, HeaderMap::new(), String::new());
        }
        if path != "cam1" {
            return (StatusCode::NOT_FOUND, HeaderMap::new(), "no stream is available on path".to_string());
        }
        assert!(body.starts_with(b"v=0"));
        let mut out = HeaderMap::new();
        out.insert(LOCATION, "/cam1/whep/abc".parse().unwrap());
        (StatusCode::CREATED, out, "v=0\r\nanswer".to_string())
    }

    async fn paths() -> Json<serde_json::Value> {
        Json(serde_json::json!({
            "itemCount": 1,
            "items": [{"name": "cam1", "ready": true, "readers": [{"type": "webRTCSession"}]}]
        }))
    }

    async fn relay() -> WhepRelay {
        let app = Router::new()
            .route("/:path/whep", post(whep))
            .route("/v3/paths/list", get(paths));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        WhepRelay::new(RelayConfig {
            whep_base_url: format!("http://{}/", addr),
            api_base_url: format!("http://{}", addr),
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_negotiate_posts_sdp() {
        let relay = relay().await;
        let answer = relay.negotiate("cam1", &SdpOffer::new(OFFER)).await.unwrap();

        assert_eq!(answer.sdp, "v=0\r\nanswer");
        assert!(answer
            .resource_url
            .as_deref()
            .is_some_and(|u| u.ends_with("/cam1/whep/abc")));
    }

    #[tokio::test]
    async fn test_negotiate_maps_rejection() {
        let relay = relay().await;
        let err = relay
            .negotiate("missing", &SdpOffer::new(OFFER))
            .await
            .unwrap_err();

        match err {
            AppError::RelayRejected { status, reason } => {
                assert_eq!(status, 404);
                assert_eq!(reason, "no stream is available on path");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_list_paths() {
        let relay = relay().await;
        let paths = relay.list_paths().await.unwrap();
        assert_eq!(
            paths,
            vec![RelayPath {
                name: "cam1".into(),
                ready: true,
                readers: 1
            }]
        );
    }
}
