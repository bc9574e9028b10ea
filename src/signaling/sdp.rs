//! SDP offer/answer types

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// SDP offer produced by the viewer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdpOffer {
    /// SDP content
    pub sdp: String,
}

impl SdpOffer {
    pub fn new(sdp: impl Into<String>) -> Self {
        Self { sdp: sdp.into() }
    }

    /// Reject offers the relay could never accept
    ///
    /// The offer must be a session description (`v=0` first) with at least
    /// one media section.
    pub fn validate(&self) -> Result<()> {
        let sdp = self.sdp.trim_start();
        if sdp.is_empty() {
            return Err(AppError::BadRequest("empty SDP offer".to_string()));
        }
        if !sdp.starts_with("v=0") {
            return Err(AppError::BadRequest(
                "SDP offer must start with v=0".to_string(),
            ));
        }
        if !sdp.lines().any(|line| line.starts_with("m=")) {
            return Err(AppError::BadRequest(
                "SDP offer has no media description".to_string(),
            ));
        }
        Ok(())
    }
}

/// SDP answer returned by the relay
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdpAnswer {
    /// SDP content, verbatim from the relay
    pub sdp: String,
    /// WHEP resource URL (`Location` header), if the relay sent one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_url: Option<String>,
}

impl SdpAnswer {
    pub fn new(sdp: impl Into<String>) -> Self {
        Self {
            sdp: sdp.into(),
            resource_url: None,
        }
    }

    pub fn with_resource(mut self, resource_url: Option<String>) -> Self {
        self.resource_url = resource_url;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFER: &str = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\n";

    #[test]
    fn test_valid_offer() {
        tokio_test::assert_ok!(SdpOffer::new(OFFER).validate());
        // Leading whitespace from form posts is tolerated
        tokio_test::assert_ok!(SdpOffer::new(format!("\r\n{}", OFFER)).validate());
    }

    #[test]
    fn test_invalid_offers() {
        for sdp in ["", "   ", "o=- 0 0 IN IP4 127.0.0.1\r\nm=video 9", "v=0\r\ns=-\r\n"] {
            let err = SdpOffer::new(sdp).validate().unwrap_err();
            assert!(matches!(err, AppError::BadRequest(_)), "{:?}", sdp);
        }
    }
}
