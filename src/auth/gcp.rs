//! GCP access tokens for Secret Manager and BigQuery.
//!
//! On Cloud Run the metadata server hands out short-lived tokens for the
//! attached service account. `GOOGLE_OAUTH_ACCESS_TOKEN` overrides that for
//! local runs (e.g. `gcloud auth print-access-token`).

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// Refresh cached tokens this long before they expire.
const REFRESH_MARGIN_SECS: i64 = 60;

#[derive(Error, Debug)]
pub enum GcpAuthError {
    #[error("Metadata server request failed: {0}")]
    Network(String),
    #[error("Metadata server returned {status}: {body}")]
    Http { status: u16, body: String },
    #[error("Malformed metadata token response: {0}")]
    Malformed(String),
}

#[derive(Debug, Deserialize)]
struct MetadataToken {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    3600
}

pub struct GcpAuth {
    http: Client,
    token_url: String,
    static_token: Option<String>,
    cached: Mutex<Option<(String, DateTime<Utc>)>>,
}

impl GcpAuth {
    pub fn new(timeout: Duration) -> Result<Self, GcpAuthError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GcpAuthError::Network(e.to_string()))?;
        Ok(Self {
            http,
            token_url: METADATA_TOKEN_URL.to_string(),
            static_token: None,
            cached: Mutex::new(None),
        })
    }

    /// Metadata server auth, unless `GOOGLE_OAUTH_ACCESS_TOKEN` is set.
    pub fn from_env(timeout: Duration) -> Result<Self, GcpAuthError> {
        let mut auth = Self::new(timeout)?;
        auth.static_token = std::env::var("GOOGLE_OAUTH_ACCESS_TOKEN")
            .ok()
            .filter(|t| !t.is_empty());
        Ok(auth)
    }

    /// Always hand out `token`; never contacts the metadata server.
    pub fn with_static_token(timeout: Duration, token: &str) -> Result<Self, GcpAuthError> {
        let mut auth = Self::new(timeout)?;
        auth.static_token = Some(token.to_string());
        Ok(auth)
    }

    pub async fn access_token(&self) -> Result<String, GcpAuthError> {
        if let Some(token) = &self.static_token {
            return Ok(token.clone());
        }

        let mut cached = self.cached.lock().await;
        if let Some((token, expires_at)) = cached.as_ref() {
            if *expires_at - Utc::now() > ChronoDuration::seconds(REFRESH_MARGIN_SECS) {
                return Ok(token.clone());
            }
        }

        debug!("Fetching GCP access token from metadata server");
        let response = self
            .http
            .get(&self.token_url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|e| GcpAuthError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GcpAuthError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let token: MetadataToken = response
            .json()
            .await
            .map_err(|e| GcpAuthError::Malformed(e.to_string()))?;
        let expires_at = Utc::now() + ChronoDuration::seconds(token.expires_in);
        *cached = Some((token.access_token.clone(), expires_at));
        Ok(token.access_token)
    }
}
