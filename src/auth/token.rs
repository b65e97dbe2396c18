//! OAuth access-token lifecycle for the advertising API.
//!
//! The manager holds the credential set and the current access token, and
//! refreshes the token whenever it is missing or within
//! [`EXPIRY_BUFFER_SECS`] of expiry. The token endpoint may rotate the
//! refresh token; a rotated value is written back to the secret store as a
//! new version before the refresh returns.
//!
//! State lives behind an async mutex that is held across the refresh, so
//! concurrent callers observe one refresh, not N.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use super::secrets::{Credentials, SecretStore, REFRESH_TOKEN};

/// Never hand out a token that expires within this many seconds.
pub const EXPIRY_BUFFER_SECS: i64 = 300;

/// Assumed lifetime when the endpoint omits `expires_in`.
const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

/// Longest lifetime accepted from the token endpoint (one day).
const MAX_EXPIRES_IN_SECS: i64 = 86_400;

#[derive(Error, Debug)]
pub enum TokenError {
    #[error("Token endpoint request failed: {0}")]
    Network(String),
    #[error("Token endpoint returned {status}: {body}")]
    Http { status: u16, body: String },
    #[error("Malformed token response: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenPhase {
    Uninitialized,
    Valid,
    Expiring,
    Refreshing,
    Failed,
}

/// Diagnostic snapshot of the token state.
#[derive(Debug, Clone)]
pub struct TokenStatus {
    pub phase: TokenPhase,
    pub has_access_token: bool,
    pub has_refresh_token: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub seconds_until_expiry: Option<i64>,
    pub is_valid: bool,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<i64>,
    refresh_token: Option<String>,
}

struct TokenState {
    access_token: Option<String>,
    expires_at: Option<DateTime<Utc>>,
    refresh_token: String,
    phase: TokenPhase,
}

impl TokenState {
    fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        match (&self.access_token, self.expires_at) {
            (Some(_), Some(expires_at)) => {
                (expires_at - now).num_seconds() < EXPIRY_BUFFER_SECS
            }
            _ => true,
        }
    }
}

pub struct TokenManager {
    http: Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    secrets: Arc<dyn SecretStore>,
    state: Mutex<TokenState>,
}

impl TokenManager {
    pub fn new(
        credentials: &Credentials,
        secrets: Arc<dyn SecretStore>,
        token_url: &str,
        timeout: Duration,
    ) -> Result<Self, TokenError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TokenError::Network(e.to_string()))?;

        Ok(Self {
            http,
            token_url: token_url.to_string(),
            client_id: credentials.client_id.clone(),
            client_secret: credentials.client_secret.clone(),
            secrets,
            state: Mutex::new(TokenState {
                access_token: None,
                expires_at: None,
                refresh_token: credentials.refresh_token.clone(),
                phase: TokenPhase::Uninitialized,
            }),
        })
    }

    /// Return an access token valid for at least [`EXPIRY_BUFFER_SECS`],
    /// refreshing first if needed.
    pub async fn get_valid_access_token(&self) -> Result<String, TokenError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();

        if state.needs_refresh(now) {
            if let Some(expires_at) = state.expires_at {
                state.phase = TokenPhase::Expiring;
                info!(
                    seconds_until_expiry = (expires_at - now).num_seconds(),
                    "Access token expiring, refreshing"
                );
            } else {
                info!("No access token yet, refreshing");
            }
            return self.refresh_locked(&mut state).await;
        }

        match &state.access_token {
            Some(token) => Ok(token.clone()),
            None => self.refresh_locked(&mut state).await,
        }
    }

    /// Refresh now, regardless of the current token's expiry.
    pub async fn refresh(&self) -> Result<String, TokenError> {
        let mut state = self.state.lock().await;
        self.refresh_locked(&mut state).await
    }

    /// Discard the current access token and refresh (e.g. after a 401).
    pub async fn force_refresh(&self) -> Result<String, TokenError> {
        let mut state = self.state.lock().await;
        warn!("Forcing access token refresh");
        state.access_token = None;
        state.expires_at = None;
        self.refresh_locked(&mut state).await
    }

    pub async fn status(&self) -> TokenStatus {
        let state = self.state.lock().await;
        let now = Utc::now();
        let seconds_until_expiry = state.expires_at.map(|e| (e - now).num_seconds());
        let is_valid = state.access_token.is_some() && !state.needs_refresh(now);

        let phase = match state.phase {
            TokenPhase::Valid if !is_valid => TokenPhase::Expiring,
            other => other,
        };

        TokenStatus {
            phase,
            has_access_token: state.access_token.is_some(),
            has_refresh_token: !state.refresh_token.is_empty(),
            expires_at: state.expires_at,
            seconds_until_expiry,
            is_valid,
        }
    }

    async fn refresh_locked(&self, state: &mut TokenState) -> Result<String, TokenError> {
        state.phase = TokenPhase::Refreshing;
        info!(token_url = %self.token_url, "Requesting new access token");

        let response = match self.exchange(&state.refresh_token).await {
            Ok(r) => r,
            Err(e) => {
                state.phase = TokenPhase::Failed;
                error!(error = %e, "Token refresh failed");
                return Err(e);
            }
        };

        // A rotated refresh token is stored even if the access token is
        // rejected below.
        if let Some(rotated) = response
            .refresh_token
            .filter(|rt| !rt.is_empty() && *rt != state.refresh_token)
        {
            info!("Refresh token rotated, storing new secret version");
            state.refresh_token = rotated.clone();
            if !self.secrets.put_new_version(REFRESH_TOKEN, &rotated).await {
                // The in-memory token keeps this process working; the next
                // process will start from the stale stored version.
                error!(
                    secret = REFRESH_TOKEN,
                    "Failed to store rotated refresh token"
                );
            }
        }

        let expires_in = response.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS);
        let expires_at = match expiry_from(Utc::now(), expires_in) {
            Ok(at) => at,
            Err(e) => {
                state.access_token = None;
                state.expires_at = None;
                state.phase = TokenPhase::Failed;
                error!(expires_in, error = %e, "Token refresh returned an unusable lifetime");
                return Err(e);
            }
        };

        state.access_token = Some(response.access_token.clone());
        state.expires_at = Some(expires_at);
        state.phase = TokenPhase::Valid;
        info!(expires_in, "Access token refreshed");

        Ok(response.access_token)
    }

    async fn exchange(&self, refresh_token: &str) -> Result<TokenResponse, TokenError> {
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];

        let response = self
            .http
            .post(&self.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| TokenError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TokenError::Http {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| TokenError::Malformed(e.to_string()))
    }
}

/// Expiry instant for a token issued at `now`. Lifetimes inside the expiry
/// buffer or beyond [`MAX_EXPIRES_IN_SECS`] are rejected.
fn expiry_from(now: DateTime<Utc>, expires_in: i64) -> Result<DateTime<Utc>, TokenError> {
    if expires_in <= EXPIRY_BUFFER_SECS || expires_in > MAX_EXPIRES_IN_SECS {
        return Err(TokenError::Malformed(format!(
            "expires_in {expires_in}s not in ({EXPIRY_BUFFER_SECS}, {MAX_EXPIRES_IN_SECS}]"
        )));
    }
    now.checked_add_signed(ChronoDuration::seconds(expires_in))
        .ok_or_else(|| TokenError::Malformed(format!("expires_in {expires_in}s overflows")))
}

impl std::fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenManager")
            .field("token_url", &self.token_url)
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}
