//! Sponsored-products bid automation.
//!
//! One process per scheduled trigger; each subcommand runs a single job to
//! completion and exits.
//!
//! Architecture:
//! - Token manager keeps the OAuth access token fresh and writes rotated
//!   refresh tokens back to the secret store
//! - Resilient API client with retries, rate limiting and dry-run
//! - Deterministic bid scoring from warehouse performance data
//! - Append-only audit trail (BigQuery table or local JSONL file)

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::{error, info};

use ppc_autopilot::api::client::{AdsClient, AdsClientConfig};
use ppc_autopilot::audit::{AuditSink, BigQueryAuditLog, JsonlAuditLog};
use ppc_autopilot::auth::gcp::GcpAuth;
use ppc_autopilot::auth::secrets::{load_credentials, EnvSecretStore, GcpSecretManager, SecretStore};
use ppc_autopilot::auth::token::TokenManager;
use ppc_autopilot::config::{SecretBackend, Settings};
use ppc_autopilot::data::bigquery::{BigQueryClient, BigQueryRepository};
use ppc_autopilot::jobs::{BidOptimizer, BudgetMonitor, JobContext, KeywordHarvester};

#[derive(Parser, Debug)]
#[command(name = "ppc-autopilot", version, about = "Sponsored-products bid automation")]
struct Cli {
    /// Simulate every mutation (overrides DRY_RUN=false).
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Recompute and apply keyword bids.
    OptimizeBids,
    /// Check daily budget pacing and cut bids when spend runs ahead.
    MonitorBudget,
    /// Promote converting search terms and negate bleeders.
    HarvestKeywords,
    /// Refresh the access token and print its status.
    TokenStatus,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration.
    let mut settings = Settings::from_env();
    if cli.dry_run {
        settings.dry_run = true;
    }

    // Initialize logging.
    init_logging(&settings);

    info!(
        command = ?cli.command,
        dry_run = settings.dry_run,
        project_id = %settings.project_id,
        dataset_id = %settings.dataset_id,
        timezone = %settings.timezone,
        "Configuration loaded"
    );

    // Validate settings.
    if let Err(errors) = settings.validate() {
        for e in &errors {
            error!(error = %e, "Configuration error");
        }
        anyhow::bail!("Configuration validation failed");
    }

    let timeout = settings.http_timeout();
    let gcp_auth = Arc::new(GcpAuth::from_env(timeout)?);

    // Credentials.
    let backend = settings.secret_backend().map_err(anyhow::Error::msg)?;
    let secrets: Arc<dyn SecretStore> = match backend {
        SecretBackend::Gcp => Arc::new(GcpSecretManager::new(gcp_auth.clone(), &settings.project_id, timeout)?),
        SecretBackend::Env => Arc::new(EnvSecretStore::new()),
    };
    let credentials = load_credentials(secrets.as_ref())
        .await
        .context("Loading advertising API credentials")?;
    let tokens = Arc::new(TokenManager::new(&credentials, secrets, &settings.token_url, timeout)?);

    if cli.command == Command::TokenStatus {
        tokens.get_valid_access_token().await?;
        let status = tokens.status().await;
        info!(
            phase = ?status.phase,
            is_valid = status.is_valid,
            has_refresh_token = status.has_refresh_token,
            expires_at = ?status.expires_at,
            seconds_until_expiry = ?status.seconds_until_expiry,
            "Token status"
        );
        return Ok(());
    }

    let client = AdsClient::new(
        tokens.clone(),
        AdsClientConfig {
            base_url: settings.ads_base_url.clone(),
            client_id: credentials.client_id.clone(),
            profile_id: credentials.profile_id.clone(),
            dry_run: settings.dry_run,
            retry: settings.retry_policy(),
            timeout,
            rate_limit: settings.ads_rate_limit,
        },
    )?;

    // Warehouse and audit trail.
    let bigquery = Arc::new(BigQueryClient::new(
        gcp_auth,
        &settings.project_id,
        &settings.dataset_id,
        &settings.region,
        timeout,
    )?);
    let repository = Arc::new(BigQueryRepository::new(
        bigquery.clone(),
        &settings.timezone,
        settings.attribution_lag_days,
    ));
    let audit: Arc<dyn AuditSink> = match &settings.audit_log_path {
        Some(path) => {
            info!(path = %path, "Audit trail: JSONL file");
            Arc::new(JsonlAuditLog::new(path))
        }
        None => Arc::new(BigQueryAuditLog::new(bigquery)),
    };

    let ctx = JobContext {
        settings: Arc::new(settings),
        tokens,
        client: Arc::new(client),
        repository,
        audit,
    };

    let result = match cli.command {
        Command::OptimizeBids => BidOptimizer::new(ctx).run().await.map(|_| ()),
        Command::MonitorBudget => BudgetMonitor::new(ctx).run().await.map(|_| ()),
        Command::HarvestKeywords => KeywordHarvester::new(ctx).run().await.map(|_| ()),
        Command::TokenStatus => Ok(()),
    };

    match result {
        Ok(()) => {
            info!(command = ?cli.command, "Job completed");
            Ok(())
        }
        Err(e) => {
            error!(command = ?cli.command, error = %e, "Job failed");
            Err(e.into())
        }
    }
}

/// Initialize the tracing subscriber.
fn init_logging(settings: &Settings) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.log_level));

    if settings.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .with_current_span(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .init();
    }
}
