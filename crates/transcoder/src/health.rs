//! HLS manifest health probe.

use std::time::Duration;

use reqwest::Client;
use reqwest::header::{ACCEPT, CONTENT_TYPE, ORIGIN, REFERER, USER_AGENT};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::error::HealthCheckError;
use crate::request::RequestHeaders;
use crate::{Error, Result};

/// Leading marker of every HLS manifest.
pub const MANIFEST_MARKER: &[u8] = b"#EXTM3U";

/// Bytes of body inspected for the manifest marker.
const PREFIX_LEN: usize = 256;

const HLS_ACCEPT: &str = "application/vnd.apple.mpegurl,application/x-mpegURL,*/*";

const HLS_CONTENT_TYPES: &[&str] = &[
    "application/vnd.apple.mpegurl",
    "application/x-mpegurl",
    "text/plain",
];

fn default_user_agent() -> String {
    "FFmpeg/media_transcoder".to_string()
}

fn default_true() -> bool {
    true
}

/// Stream probing settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthConfig {
    /// User-Agent sent when the request does not carry one.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Probe HLS sources before the first engine launch.
    #[serde(default = "default_true")]
    pub preflight: bool,
    /// Re-probe HLS sources before every retried launch.
    #[serde(default = "default_true")]
    pub verify_before_retry: bool,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            preflight: true,
            verify_before_retry: true,
        }
    }
}

/// Bounded GET probe against an HLS manifest.
///
/// Cheap to clone; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct StreamHealthChecker {
    client: Client,
    user_agent: String,
}

impl StreamHealthChecker {
    pub fn new(config: &HealthConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self::with_client(client, config.user_agent.clone()))
    }

    pub fn with_client(client: Client, user_agent: impl Into<String>) -> Self {
        Self {
            client,
            user_agent: user_agent.into(),
        }
    }

    /// Probe `url` once within `timeout`.
    ///
    /// Succeeds when the server answers 2xx and the body starts with
    /// `#EXTM3U`. An unexpected content type only logs a warning.
    pub async fn check(
        &self,
        url: &str,
        headers: &RequestHeaders,
        timeout: Duration,
    ) -> std::result::Result<(), HealthCheckError> {
        let url = url.trim();
        let parsed = Url::parse(url).map_err(|e| HealthCheckError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        let mut request = self
            .client
            .get(parsed)
            .timeout(timeout)
            .header(USER_AGENT, headers.user_agent().unwrap_or(self.user_agent.as_str()))
            .header(ACCEPT, HLS_ACCEPT);
        if let Some(origin) = headers.origin() {
            request = request.header(ORIGIN, origin);
        }
        if let Some(referer) = headers.referer() {
            request = request.header(REFERER, referer);
        }

        let mut response = request
            .send()
            .await
            .map_err(|source| HealthCheckError::Unreachable { source })?;

        let status = response.status();
        if !status.is_success() {
            return Err(HealthCheckError::BadStatus { status });
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_lowercase();
        if !HLS_CONTENT_TYPES.iter().any(|t| content_type.contains(t)) {
            warn!(url, content_type = %content_type, "Unexpected content type for HLS stream");
        }

        let mut prefix = Vec::with_capacity(PREFIX_LEN);
        while prefix.len() < PREFIX_LEN {
            let Some(chunk) = response
                .chunk()
                .await
                .map_err(|source| HealthCheckError::Unreachable { source })?
            else {
                break;
            };
            let take = chunk.len().min(PREFIX_LEN - prefix.len());
            prefix.extend_from_slice(&chunk[..take]);
        }

        if !prefix.starts_with(MANIFEST_MARKER) {
            return Err(HealthCheckError::BadFormat);
        }

        debug!(url, "HLS stream health check passed");
        Ok(())
    }
}
