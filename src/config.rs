//! Configuration management.
//!
//! Loads settings from environment variables and .env file. Every option has
//! a default; the environment is the only override channel.

use chrono_tz::Tz;
use rust_decimal::Decimal;
use std::str::FromStr;
use std::time::Duration;

use crate::api::retry::RetryPolicy;
use crate::scoring::BidRules;

/// Upper bound for either retry delay.
const MAX_RETRY_DELAY_SECS: f64 = 300.0;

/// Application configuration loaded from environment.
#[derive(Debug, Clone)]
pub struct Settings {
    // Analytical store
    pub project_id: String,
    pub dataset_id: String,
    pub region: String,

    // Behavior
    pub dry_run: bool,
    pub timezone: String,

    // Bid rules
    pub min_bid: Decimal,
    pub max_bid: Decimal,
    pub default_target_acos: Decimal,
    pub default_aov: Decimal,

    // Advertising API
    pub ads_base_url: String,
    pub token_url: String,
    pub http_timeout_secs: u64,
    pub ads_rate_limit: u32,
    pub retry_max_attempts: u32,
    pub retry_base_delay_secs: f64,
    pub retry_max_delay_secs: f64,

    // Collaborators
    /// Raw `SECRET_BACKEND`; see [`Settings::secret_backend`].
    pub secret_backend: String,
    pub audit_log_path: Option<String>,
    pub attribution_lag_days: u32,

    // Bid optimizer
    pub optimizer_lookback_days: u32,
    pub optimizer_min_clicks: u32,

    // Budget monitor thresholds
    pub budget_critical_threshold: Decimal,
    pub budget_warning_threshold: Decimal,
    pub budget_checkpoint_hour: u32,
    pub budget_exhausted_pct: Decimal,

    // Harvest settings
    pub harvest_days_lookback: u32,
    pub harvest_min_clicks: u32,
    pub harvest_min_orders: u32,
    pub harvest_max_acos: Decimal,
    pub negative_min_clicks: u32,

    // Logging
    pub log_level: String,
    pub log_json: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretBackend {
    /// GCP Secret Manager over REST.
    Gcp,
    /// Process environment, for local runs.
    Env,
}

impl FromStr for SecretBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "gcp" => Ok(Self::Gcp),
            "env" => Ok(Self::Env),
            _ => Err(format!("Invalid secret backend: {s}")),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            project_id: "amazon-ppc-474902".to_string(),
            dataset_id: "amazon_ppc".to_string(),
            region: "US".to_string(),

            dry_run: false,
            timezone: "America/New_York".to_string(),

            min_bid: Decimal::new(20, 2),
            max_bid: Decimal::new(500, 2),
            default_target_acos: Decimal::new(30, 2),
            default_aov: Decimal::new(35, 0),

            ads_base_url: "https://advertising-api.amazon.com".to_string(),
            token_url: "https://api.amazon.com/auth/o2/token".to_string(),
            http_timeout_secs: 30,
            ads_rate_limit: 10,
            retry_max_attempts: 3,
            retry_base_delay_secs: 4.0,
            retry_max_delay_secs: 10.0,

            secret_backend: "gcp".to_string(),
            audit_log_path: None,
            attribution_lag_days: 3,

            optimizer_lookback_days: 14,
            optimizer_min_clicks: 5,

            budget_critical_threshold: Decimal::new(75, 2),
            budget_warning_threshold: Decimal::new(65, 2),
            budget_checkpoint_hour: 15,
            budget_exhausted_pct: Decimal::new(95, 2),

            harvest_days_lookback: 30,
            harvest_min_clicks: 10,
            harvest_min_orders: 2,
            harvest_max_acos: Decimal::new(35, 2),
            negative_min_clicks: 30,

            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

impl Settings {
    /// Load settings from environment variables (and .env file).
    pub fn from_env() -> Self {
        // Try to load .env file (ignore if not found).
        let _ = dotenvy::dotenv();
        let d = Self::default();

        Self {
            project_id: env_str("GCP_PROJECT", &d.project_id),
            dataset_id: env_str("BQ_DATASET", &d.dataset_id),
            region: env_str("GCP_REGION", &d.region),

            dry_run: env_bool("DRY_RUN", d.dry_run),
            timezone: env_str("TIMEZONE", &d.timezone),

            min_bid: env_decimal("MIN_BID", d.min_bid),
            max_bid: env_decimal("MAX_BID", d.max_bid),
            default_target_acos: env_decimal("DEFAULT_TARGET_ACOS", d.default_target_acos),
            default_aov: env_decimal("DEFAULT_AOV", d.default_aov),

            ads_base_url: env_str("ADS_API_BASE_URL", &d.ads_base_url),
            token_url: env_str("ADS_TOKEN_URL", &d.token_url),
            http_timeout_secs: env_u64("HTTP_TIMEOUT_SECONDS", d.http_timeout_secs),
            ads_rate_limit: env_u32("ADS_RATE_LIMIT_PER_SECOND", d.ads_rate_limit),
            retry_max_attempts: env_u32("RETRY_MAX_ATTEMPTS", d.retry_max_attempts),
            retry_base_delay_secs: env_f64("RETRY_BASE_DELAY_SECONDS", d.retry_base_delay_secs),
            retry_max_delay_secs: env_f64("RETRY_MAX_DELAY_SECONDS", d.retry_max_delay_secs),

            secret_backend: env_str("SECRET_BACKEND", &d.secret_backend),
            audit_log_path: std::env::var("AUDIT_LOG_PATH")
                .ok()
                .filter(|p| !p.trim().is_empty()),
            attribution_lag_days: env_u32("ATTRIBUTION_LAG_DAYS", d.attribution_lag_days),

            optimizer_lookback_days: env_u32("OPTIMIZER_LOOKBACK_DAYS", d.optimizer_lookback_days),
            optimizer_min_clicks: env_u32("OPTIMIZER_MIN_CLICKS", d.optimizer_min_clicks),

            budget_critical_threshold: env_decimal("BUDGET_CRIT_3PM", d.budget_critical_threshold),
            budget_warning_threshold: env_decimal("BUDGET_WARN_3PM", d.budget_warning_threshold),
            budget_checkpoint_hour: env_u32("BUDGET_CHECKPOINT_HOUR", d.budget_checkpoint_hour),
            budget_exhausted_pct: env_decimal("BUDGET_EXHAUSTED_PCT", d.budget_exhausted_pct),

            harvest_days_lookback: env_u32("HARVEST_DAYS", d.harvest_days_lookback),
            harvest_min_clicks: env_u32("HARVEST_MIN_CLICKS", d.harvest_min_clicks),
            harvest_min_orders: env_u32("HARVEST_MIN_ORDERS", d.harvest_min_orders),
            harvest_max_acos: env_decimal("HARVEST_MAX_ACOS", d.harvest_max_acos),
            negative_min_clicks: env_u32("NEGATIVE_MIN_CLICKS", d.negative_min_clicks),

            log_level: env_str("LOG_LEVEL", &d.log_level),
            log_json: env_bool("LOG_JSON", d.log_json),
        }
    }

    /// Validate configuration for critical requirements.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.min_bid <= Decimal::ZERO || self.min_bid >= self.max_bid {
            errors.push("MIN_BID must be positive and below MAX_BID".to_string());
        }

        if self.default_target_acos <= Decimal::ZERO || self.default_target_acos >= Decimal::ONE {
            errors.push("DEFAULT_TARGET_ACOS must be in (0, 1)".to_string());
        }

        if self.default_aov <= Decimal::ZERO {
            errors.push("DEFAULT_AOV must be positive".to_string());
        }

        if self.timezone.parse::<Tz>().is_err() {
            errors.push(format!("TIMEZONE is not a valid IANA zone: {}", self.timezone));
        }

        if self.retry_max_attempts == 0 {
            errors.push("RETRY_MAX_ATTEMPTS must be at least 1".to_string());
        }

        let delays = [self.retry_base_delay_secs, self.retry_max_delay_secs];
        if delays.iter().any(|d| !d.is_finite() || *d > MAX_RETRY_DELAY_SECS) {
            errors.push(format!("RETRY_*_DELAY_SECONDS must be finite and at most {MAX_RETRY_DELAY_SECS}"));
        } else if self.retry_base_delay_secs < 0.0 || self.retry_max_delay_secs < self.retry_base_delay_secs {
            errors.push("RETRY_MAX_DELAY_SECONDS must be >= RETRY_BASE_DELAY_SECONDS >= 0".to_string());
        }

        if let Err(e) = self.secret_backend() {
            errors.push(e);
        }

        if self.budget_warning_threshold >= self.budget_critical_threshold {
            errors.push("BUDGET_WARN_3PM must be below BUDGET_CRIT_3PM".to_string());
        }

        if self.budget_checkpoint_hour > 23 {
            errors.push("BUDGET_CHECKPOINT_HOUR must be in 0..=23".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Account timezone. Falls back to UTC when unparseable; `validate`
    /// reports that case before any job runs.
    pub fn tz(&self) -> Tz {
        self.timezone.parse().unwrap_or(Tz::UTC)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn bid_rules(&self) -> BidRules {
        BidRules {
            min_bid: self.min_bid,
            max_bid: self.max_bid,
            target_acos: self.default_target_acos,
        }
    }

    pub fn secret_backend(&self) -> Result<SecretBackend, String> {
        self.secret_backend.parse()
    }

    /// Retry policy from the delay settings. Values `validate` would reject
    /// become a zero delay.
    pub fn retry_policy(&self) -> RetryPolicy {
        let delay = |secs: f64| Duration::try_from_secs_f64(secs).unwrap_or_default();
        RetryPolicy::new(
            self.retry_max_attempts,
            delay(self.retry_base_delay_secs),
            delay(self.retry_max_delay_secs),
        )
    }
}

// =============================================================================
// Environment helpers
// =============================================================================

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(default)
}

fn env_decimal(key: &str, default: Decimal) -> Decimal {
    std::env::var(key)
        .ok()
        .and_then(|v| Decimal::from_str(v.trim()).ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
