//! Async REST client for the sponsored-products advertising API.
//!
//! Features:
//! - Bearer auth from [`TokenManager`], re-resolved before every attempt
//! - Rate limiting (configurable, default 10 req/sec)
//! - Retries with exponential backoff on transient failures
//! - One forced token refresh on 401
//! - Dry-run short-circuit with the same return contract as a real call
//!
//! Mutations return `bool` rather than `Result` so a batch can carry on past
//! a single bad keyword; the failure is logged here.

use governor::{Quota, RateLimiter};
use reqwest::{Client, Method};
use rust_decimal::Decimal;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::auth::token::TokenManager;
use crate::data::models::{EntityId, MatchType, NegativeMatchType};
use crate::scoring::round_bid;

use super::errors::ApiError;
use super::models::{
    BatchOutcome, BidUpdate, KeywordBidUpdate, KeywordState, NewKeyword, NewNegativeKeyword,
};
use super::retry::RetryPolicy;

const KEYWORDS_PATH: &str = "/v2/sp/keywords";
const NEGATIVE_KEYWORDS_PATH: &str = "/v2/sp/campaignNegativeKeywords";

#[derive(Debug, Clone)]
pub struct AdsClientConfig {
    pub base_url: String,
    pub client_id: String,
    pub profile_id: String,
    pub dry_run: bool,
    pub retry: RetryPolicy,
    pub timeout: Duration,
    pub rate_limit: u32,
}

type DirectRateLimiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

pub struct AdsClient {
    tokens: Arc<TokenManager>,
    http: Client,
    base_url: String,
    client_id: String,
    profile_id: String,
    dry_run: bool,
    retry: RetryPolicy,
    rate_limiter: DirectRateLimiter,
}

impl AdsClient {
    pub fn new(tokens: Arc<TokenManager>, config: AdsClientConfig) -> Result<Self, ApiError> {
        let http = Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(4)
            .tcp_keepalive(Duration::from_secs(30))
            .build()
            .map_err(|e| ApiError::Network(e.to_string()))?;

        let quota = Quota::per_second(NonZeroU32::new(config.rate_limit).unwrap_or(NonZeroU32::MIN));

        Ok(Self {
            tokens,
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client_id: config.client_id,
            profile_id: config.profile_id,
            dry_run: config.dry_run,
            retry: config.retry,
            rate_limiter: RateLimiter::direct(quota),
        })
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    // =========================================================================
    // Keyword mutations
    // =========================================================================

    /// Set a keyword's bid. The bid is rounded to cents before sending.
    pub async fn update_keyword_bid(&self, keyword_id: impl Into<EntityId>, new_bid: Decimal) -> bool {
        let keyword_id = keyword_id.into();
        let bid = round_bid(new_bid);

        if self.dry_run {
            info!(keyword_id = %keyword_id, bid = %bid, "[DRY RUN] Would update keyword bid");
            return true;
        }

        let payload = vec![KeywordBidUpdate {
            keyword_id: keyword_id.clone(),
            bid,
            state: KeywordState::Enabled,
        }];

        match self.mutate(Method::PUT, KEYWORDS_PATH, &payload).await {
            Ok(_) => {
                info!(keyword_id = %keyword_id, bid = %bid, "Keyword bid updated");
                true
            }
            Err(e) => {
                error!(keyword_id = %keyword_id, bid = %bid, error = %e, "Keyword bid update failed");
                false
            }
        }
    }

    pub async fn create_keyword(
        &self,
        campaign_id: impl Into<EntityId>,
        ad_group_id: impl Into<EntityId>,
        keyword_text: &str,
        match_type: MatchType,
        bid: Decimal,
    ) -> bool {
        let campaign_id = campaign_id.into();
        let ad_group_id = ad_group_id.into();
        let bid = round_bid(bid);

        if self.dry_run {
            info!(
                campaign_id = %campaign_id,
                ad_group_id = %ad_group_id,
                keyword_text,
                match_type = %match_type,
                bid = %bid,
                "[DRY RUN] Would create keyword"
            );
            return true;
        }

        let payload = vec![NewKeyword {
            campaign_id: campaign_id.clone(),
            ad_group_id: ad_group_id.clone(),
            keyword_text: keyword_text.to_string(),
            match_type,
            state: KeywordState::Enabled,
            bid,
        }];

        match self.mutate(Method::POST, KEYWORDS_PATH, &payload).await {
            Ok(_) => {
                info!(campaign_id = %campaign_id, ad_group_id = %ad_group_id, keyword_text, "Keyword created");
                true
            }
            Err(e) => {
                error!(
                    campaign_id = %campaign_id,
                    ad_group_id = %ad_group_id,
                    keyword_text,
                    error = %e,
                    "Keyword creation failed"
                );
                false
            }
        }
    }

    pub async fn create_negative_keyword(
        &self,
        campaign_id: impl Into<EntityId>,
        keyword_text: &str,
        match_type: NegativeMatchType,
    ) -> bool {
        let campaign_id = campaign_id.into();

        if self.dry_run {
            info!(
                campaign_id = %campaign_id,
                keyword_text,
                match_type = ?match_type,
                "[DRY RUN] Would add negative keyword"
            );
            return true;
        }

        let payload = vec![NewNegativeKeyword {
            campaign_id: campaign_id.clone(),
            keyword_text: keyword_text.to_string(),
            match_type,
            state: KeywordState::Enabled,
        }];

        match self.mutate(Method::POST, NEGATIVE_KEYWORDS_PATH, &payload).await {
            Ok(_) => {
                info!(campaign_id = %campaign_id, keyword_text, "Negative keyword added");
                true
            }
            Err(e) => {
                error!(campaign_id = %campaign_id, keyword_text, error = %e, "Negative keyword failed");
                false
            }
        }
    }

    /// Apply updates one by one; a failed item does not stop the rest.
    pub async fn batch_update_keyword_bids(&self, updates: &[BidUpdate]) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for update in updates {
            if self.update_keyword_bid(update.keyword_id.clone(), update.bid).await {
                outcome.success += 1;
            } else {
                outcome.failed += 1;
            }
        }
        outcome
    }

    // =========================================================================
    // Core request method
    // =========================================================================

    async fn mutate<B: serde::Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: &B,
    ) -> Result<serde_json::Value, ApiError> {
        let url = format!("{}{}", self.base_url, path);
        let body = serde_json::to_value(body).map_err(|e| ApiError::Deserialization(e.to_string()))?;
        debug!(method = %method, path, payload = %body, "API mutation");

        self.retry
            .run(path, |attempt| {
                let method = method.clone();
                let url = url.as_str();
                let body = &body;
                async move {
                    self.rate_limiter.until_ready().await;

                    // Resolved per attempt so a long batch never sends a stale token.
                    let token = self.tokens.get_valid_access_token().await?;
                    debug!(method = %method, url, attempt, "API request");

                    match self.send_once(method.clone(), url, body, &token).await {
                        Err(ApiError::Unauthorized(_)) => {
                            warn!(url, "Got 401, forcing token refresh and re-sending once");
                            let token = self.tokens.force_refresh().await?;
                            self.send_once(method, url, body, &token).await
                        }
                        other => other,
                    }
                }
            })
            .await
    }

    async fn send_once(
        &self,
        method: Method,
        url: &str,
        body: &serde_json::Value,
        token: &str,
    ) -> Result<serde_json::Value, ApiError> {
        let response = self
            .http
            .request(method, url)
            .bearer_auth(token)
            .header("Amazon-Advertising-API-ClientId", &self.client_id)
            .header("Amazon-Advertising-API-Scope", &self.profile_id)
            .json(body)
            .send()
            .await
            .map_err(ApiError::from_reqwest)?;

        let status = response.status();

        if status.is_success() {
            let text = response.text().await.map_err(ApiError::from_reqwest)?;
            if text.trim().is_empty() {
                return Ok(serde_json::Value::Null);
            }
            let json: serde_json::Value = serde_json::from_str(&text)
                .map_err(|e| ApiError::Deserialization(e.to_string()))?;
            check_item_codes(&json)?;
            return Ok(json);
        }

        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(1);
            warn!(retry_after, url, "Rate limited");
            return Err(ApiError::RateLimited { retry_after });
        }

        let body_text = response.text().await.unwrap_or_default();
        if status.is_server_error() {
            warn!(status_code = status.as_u16(), url, "Server error");
        }
        Err(ApiError::from_response(status.as_u16(), &body_text))
    }
}

/// Batch endpoints answer 2xx with one result per item; any item whose
/// `code` is not `SUCCESS` rejects the call.
fn check_item_codes(json: &serde_json::Value) -> Result<(), ApiError> {
    let Some(items) = json.as_array() else {
        return Ok(());
    };
    for item in items {
        if let Some(code) = item.get("code").and_then(|c| c.as_str()) {
            if code != "SUCCESS" {
                let details = item
                    .get("details")
                    .and_then(|d| d.as_str())
                    .unwrap_or_default()
                    .to_string();
                return Err(ApiError::Rejected {
                    code: code.to_string(),
                    details,
                });
            }
        }
    }
    Ok(())
}

impl std::fmt::Debug for AdsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdsClient")
            .field("base_url", &self.base_url)
            .field("profile_id", &self.profile_id)
            .field("dry_run", &self.dry_run)
            .finish_non_exhaustive()
    }
}
