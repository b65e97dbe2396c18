//! Secret store adapter.
//!
//! The four advertising API credentials live in a durable secret store. Only
//! the refresh token is ever written back, as a new secret version, when the
//! token endpoint rotates it.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::Client;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

use super::gcp::GcpAuth;

pub const CLIENT_ID: &str = "amazon_client_id";
pub const CLIENT_SECRET: &str = "amazon_client_secret";
pub const REFRESH_TOKEN: &str = "amazon_refresh_token";
pub const PROFILE_ID: &str = "amazon_profile_id";

#[derive(Error, Debug)]
pub enum SecretStoreError {
    #[error("Secret not found: {0}")]
    NotFound(String),
    #[error("Secret backend error: {0}")]
    Backend(String),
    #[error("Secret payload could not be decoded: {0}")]
    Decode(String),
}

#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Latest version of the named secret.
    async fn get(&self, name: &str) -> Result<String, SecretStoreError>;

    /// Store `value` as a new version of the named secret. Failures are
    /// logged by the implementation and reported as `false`.
    async fn put_new_version(&self, name: &str, value: &str) -> bool;
}

/// Advertising API credential set.
#[derive(Clone)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
    pub profile_id: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("profile_id", &self.profile_id)
            .finish()
    }
}

/// Fetch all four well-known credentials.
pub async fn load_credentials(store: &dyn SecretStore) -> Result<Credentials, SecretStoreError> {
    let credentials = Credentials {
        client_id: store.get(CLIENT_ID).await?,
        client_secret: store.get(CLIENT_SECRET).await?,
        refresh_token: store.get(REFRESH_TOKEN).await?,
        profile_id: store.get(PROFILE_ID).await?,
    };
    info!(profile_id = %credentials.profile_id, "Credentials loaded");
    Ok(credentials)
}

// =============================================================================
// GCP Secret Manager
// =============================================================================

const SECRET_MANAGER_URL: &str = "https://secretmanager.googleapis.com/v1";

pub struct GcpSecretManager {
    http: Client,
    auth: Arc<GcpAuth>,
    project_id: String,
    base_url: String,
}

impl GcpSecretManager {
    pub fn new(auth: Arc<GcpAuth>, project_id: &str, timeout: Duration) -> Result<Self, SecretStoreError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SecretStoreError::Backend(e.to_string()))?;
        Ok(Self {
            http,
            auth,
            project_id: project_id.to_string(),
            base_url: SECRET_MANAGER_URL.to_string(),
        })
    }

    async fn bearer(&self) -> Result<String, SecretStoreError> {
        self.auth
            .access_token()
            .await
            .map_err(|e| SecretStoreError::Backend(e.to_string()))
    }
}

#[async_trait]
impl SecretStore for GcpSecretManager {
    async fn get(&self, name: &str) -> Result<String, SecretStoreError> {
        let url = format!(
            "{}/projects/{}/secrets/{}/versions/latest:access",
            self.base_url, self.project_id, name
        );
        let token = self.bearer().await?;
        let response = self
            .http
            .get(&url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| SecretStoreError::Backend(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 404 {
            return Err(SecretStoreError::NotFound(name.to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(secret = name, status = status.as_u16(), "Secret fetch failed");
            return Err(SecretStoreError::Backend(format!("{status}: {body}")));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| SecretStoreError::Decode(e.to_string()))?;
        let encoded = json
            .pointer("/payload/data")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SecretStoreError::Decode("missing payload.data".to_string()))?;
        let bytes = BASE64
            .decode(encoded)
            .map_err(|e| SecretStoreError::Decode(e.to_string()))?;
        let value = String::from_utf8(bytes).map_err(|e| SecretStoreError::Decode(e.to_string()))?;

        info!(secret = name, "Retrieved secret");
        Ok(value)
    }

    async fn put_new_version(&self, name: &str, value: &str) -> bool {
        let url = format!(
            "{}/projects/{}/secrets/{}:addVersion",
            self.base_url, self.project_id, name
        );
        let token = match self.bearer().await {
            Ok(t) => t,
            Err(e) => {
                error!(secret = name, error = %e, "Secret write skipped, no GCP credentials");
                return false;
            }
        };
        let body = serde_json::json!({ "payload": { "data": BASE64.encode(value) } });

        match self.http.post(&url).bearer_auth(token).json(&body).send().await {
            Ok(response) if response.status().is_success() => {
                let version = response
                    .json::<serde_json::Value>()
                    .await
                    .ok()
                    .and_then(|v| v.get("name").and_then(|n| n.as_str()).map(str::to_string))
                    .unwrap_or_default();
                info!(secret = name, version = %version, "Stored new secret version");
                true
            }
            Ok(response) => {
                let status = response.status().as_u16();
                let body = response.text().await.unwrap_or_default();
                error!(secret = name, status, body = %body, "Secret write rejected");
                false
            }
            Err(e) => {
                error!(secret = name, error = %e, "Secret write failed");
                false
            }
        }
    }
}

// =============================================================================
// Environment-backed store (local runs)
// =============================================================================

/// Reads `AMAZON_CLIENT_ID`-style variables. Written versions only live for
/// the current process.
#[derive(Default)]
pub struct EnvSecretStore {
    written: Mutex<HashMap<String, String>>,
}

impl EnvSecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn env_key(name: &str) -> String {
        name.to_uppercase()
    }
}

#[async_trait]
impl SecretStore for EnvSecretStore {
    async fn get(&self, name: &str) -> Result<String, SecretStoreError> {
        if let Some(v) = self.written.lock().ok().and_then(|w| w.get(name).cloned()) {
            return Ok(v);
        }
        std::env::var(Self::env_key(name))
            .ok()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| SecretStoreError::NotFound(Self::env_key(name)))
    }

    async fn put_new_version(&self, name: &str, value: &str) -> bool {
        warn!(
            secret = name,
            "Env secret store cannot persist rotated values; update {} before the next run",
            Self::env_key(name)
        );
        match self.written.lock() {
            Ok(mut w) => {
                w.insert(name.to_string(), value.to_string());
                true
            }
            Err(_) => false,
        }
    }
}

// =============================================================================
// In-memory store
// =============================================================================

/// Volatile store that records every write; used by tests and dry runs
/// wired up in-process.
#[derive(Default)]
pub struct MemorySecretStore {
    values: Mutex<HashMap<String, String>>,
    writes: Mutex<Vec<(String, String)>>,
    fail_writes: bool,
}

impl MemorySecretStore {
    pub fn new(values: &[(&str, &str)]) -> Self {
        Self {
            values: Mutex::new(
                values
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Self::default()
        }
    }

    /// A store whose writes always fail.
    pub fn read_only(values: &[(&str, &str)]) -> Self {
        Self {
            fail_writes: true,
            ..Self::new(values)
        }
    }

    /// Every `put_new_version` call received so far, in order.
    pub fn writes(&self) -> Vec<(String, String)> {
        self.writes.lock().map(|w| w.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get(&self, name: &str) -> Result<String, SecretStoreError> {
        self.values
            .lock()
            .map_err(|e| SecretStoreError::Backend(e.to_string()))?
            .get(name)
            .cloned()
            .ok_or_else(|| SecretStoreError::NotFound(name.to_string()))
    }

    async fn put_new_version(&self, name: &str, value: &str) -> bool {
        if let Ok(mut w) = self.writes.lock() {
            w.push((name.to_string(), value.to_string()));
        }
        if self.fail_writes {
            return false;
        }
        match self.values.lock() {
            Ok(mut v) => {
                v.insert(name.to_string(), value.to_string());
                true
            }
            Err(_) => false,
        }
    }
}
