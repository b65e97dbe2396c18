//! Scheduled jobs: bid optimization, budget pacing and keyword harvesting.
//!
//! A run is strictly sequential. Identity and data-load failures abort it
//! (the binary exits non-zero); a single item's API failure never does.

pub mod bid_optimizer;
pub mod budget_monitor;
pub mod keyword_harvester;

use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::api::client::AdsClient;
use crate::audit::{AuditRecord, AuditSink};
use crate::auth::token::{TokenError, TokenManager};
use crate::config::Settings;
use crate::data::repository::{MetricsRepository, RepositoryError};

pub use bid_optimizer::{BidOptimizer, OptimizerSummary};
pub use budget_monitor::{BudgetMonitor, MonitorSummary};
pub use keyword_harvester::{HarvestSummary, KeywordHarvester};

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Identity failure: {0}")]
    Identity(#[from] TokenError),

    #[error("Data load failed: {0}")]
    DataLoad(#[from] RepositoryError),
}

/// Collaborators shared by every job in a process.
#[derive(Clone)]
pub struct JobContext {
    pub settings: Arc<Settings>,
    pub tokens: Arc<TokenManager>,
    pub client: Arc<AdsClient>,
    pub repository: Arc<dyn MetricsRepository>,
    pub audit: Arc<dyn AuditSink>,
}

impl JobContext {
    pub fn dry_run(&self) -> bool {
        self.client.is_dry_run()
    }

    /// Acquire an access token before touching any data, so an identity
    /// failure ends the run before it does partial work.
    pub async fn preflight(&self) -> Result<(), JobError> {
        match self.tokens.get_valid_access_token().await {
            Ok(_) => {
                info!("Token preflight OK");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Token preflight failed, aborting run");
                Err(JobError::Identity(e))
            }
        }
    }

    /// Audit failures are logged; the change itself still goes ahead.
    pub async fn audit(&self, record: &AuditRecord) {
        if let Err(e) = self.audit.record(record).await {
            warn!(
                change_id = %record.change_id,
                keyword_id = %record.keyword_id,
                error = %e,
                "Audit write failed"
            );
        }
    }

    fn banner(&self, job: &str, hour: u32) {
        info!("============================================================");
        info!(
            job,
            dry_run = self.dry_run(),
            timestamp = %Utc::now().with_timezone(&self.settings.tz()).to_rfc3339(),
            hour,
            "Starting job"
        );
        info!("============================================================");
    }
}
