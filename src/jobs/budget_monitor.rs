//! Budget pacing monitor.
//!
//! At the checkpoint hour a campaign that has already burned too much of its
//! daily budget gets its keyword bids cut, so spend lasts into the evening
//! peak. Near-exhaustion is flagged at any hour.

use rust_decimal::Decimal;
use serde::Serialize;
use std::fmt;
use tracing::{error, info, warn};

use crate::audit::{AuditAction, AuditRecord};
use crate::data::models::{CampaignBudgetStatus, EntityId};
use crate::scoring::{current_hour, round_bid};

use super::{JobContext, JobError};

pub const CHANGED_BY: &str = "budget_monitor";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Warning => f.write_str("WARNING"),
            Self::Critical => f.write_str("CRITICAL"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetAlert {
    pub severity: Severity,
    pub campaign_id: EntityId,
    pub campaign_name: String,
    pub spend_pct: Decimal,
    pub message: String,
}

#[derive(Debug, Clone, Copy)]
pub struct PacingThresholds {
    pub checkpoint_hour: u32,
    pub critical: Decimal,
    pub warning: Decimal,
    pub exhausted: Decimal,
}

impl PacingThresholds {
    pub const CRITICAL_REDUCTION: Decimal = Decimal::from_parts(25, 0, 0, false, 2);
    pub const WARNING_REDUCTION: Decimal = Decimal::from_parts(15, 0, 0, false, 2);
}

/// Outcome of checking one campaign.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PacingAssessment {
    pub alerts: Vec<BudgetAlert>,
    /// Fraction to cut bids by, e.g. 0.25.
    pub reduction: Option<Decimal>,
}

pub fn assess_pacing(
    campaign: &CampaignBudgetStatus,
    hour: u32,
    thresholds: &PacingThresholds,
) -> PacingAssessment {
    let spend_pct = campaign.spend_pct();
    let mut assessment = PacingAssessment::default();
    let alert = |severity, message: String| BudgetAlert {
        severity,
        campaign_id: campaign.campaign_id.clone(),
        campaign_name: campaign.campaign_name.clone(),
        spend_pct,
        message,
    };

    if hour == thresholds.checkpoint_hour {
        if spend_pct > thresholds.critical {
            assessment.alerts.push(alert(
                Severity::Critical,
                format!("Over {}% at {}:00", pct(thresholds.critical), hour),
            ));
            assessment.reduction = Some(PacingThresholds::CRITICAL_REDUCTION);
        } else if spend_pct > thresholds.warning {
            assessment.alerts.push(alert(
                Severity::Warning,
                format!("Over {}% at {}:00", pct(thresholds.warning), hour),
            ));
            assessment.reduction = Some(PacingThresholds::WARNING_REDUCTION);
        }
    }

    if spend_pct >= thresholds.exhausted {
        assessment
            .alerts
            .push(alert(Severity::Critical, "Budget nearly exhausted".to_string()));
    }

    assessment
}

/// `max(min_bid, round2(bid * (1 - reduction)))`.
pub fn reduced_bid(bid: Decimal, reduction: Decimal, min_bid: Decimal) -> Decimal {
    round_bid(bid * (Decimal::ONE - reduction)).max(min_bid)
}

fn pct(ratio: Decimal) -> Decimal {
    (ratio * Decimal::ONE_HUNDRED).round_dp(1).normalize()
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MonitorSummary {
    pub campaigns: usize,
    pub healthy: usize,
    pub alerts: Vec<BudgetAlert>,
    pub keywords_reduced: usize,
    pub keywords_failed: usize,
}

impl MonitorSummary {
    fn log(&self) {
        let critical = self.alerts.iter().filter(|a| a.severity == Severity::Critical).count();
        info!("============================================================");
        info!(
            campaigns = self.campaigns,
            healthy = self.healthy,
            alerts = self.alerts.len(),
            critical,
            warnings = self.alerts.len() - critical,
            keywords_reduced = self.keywords_reduced,
            keywords_failed = self.keywords_failed,
            "Budget monitor summary"
        );
        for alert in &self.alerts {
            info!(
                severity = %alert.severity,
                campaign = %alert.campaign_name,
                spend_pct = %pct(alert.spend_pct),
                message = %alert.message,
                "Alert"
            );
        }
        info!("============================================================");
    }
}

pub struct BudgetMonitor {
    ctx: JobContext,
    thresholds: PacingThresholds,
}

impl BudgetMonitor {
    pub fn new(ctx: JobContext) -> Self {
        let settings = &ctx.settings;
        let thresholds = PacingThresholds {
            checkpoint_hour: settings.budget_checkpoint_hour,
            critical: settings.budget_critical_threshold,
            warning: settings.budget_warning_threshold,
            exhausted: settings.budget_exhausted_pct,
        };
        Self { ctx, thresholds }
    }

    pub async fn run(&self) -> Result<MonitorSummary, JobError> {
        self.run_at_hour(current_hour(self.ctx.settings.tz())).await
    }

    pub async fn run_at_hour(&self, hour: u32) -> Result<MonitorSummary, JobError> {
        let ctx = &self.ctx;
        ctx.banner("budget_monitor", hour);
        ctx.preflight().await?;

        let campaigns = ctx.repository.campaign_budget_status().await?;
        let mut summary = MonitorSummary {
            campaigns: campaigns.len(),
            ..MonitorSummary::default()
        };
        if campaigns.is_empty() {
            warn!("No active daily-budget campaigns found");
            summary.log();
            return Ok(summary);
        }
        info!(campaigns = campaigns.len(), "Monitoring campaigns");

        for campaign in &campaigns {
            let assessment = assess_pacing(campaign, hour, &self.thresholds);

            for alert in &assessment.alerts {
                match alert.severity {
                    Severity::Critical => error!(
                        campaign = %campaign.campaign_name,
                        spend_pct = %pct(alert.spend_pct),
                        spend = %campaign.spend_today,
                        budget = %campaign.budget,
                        message = %alert.message,
                        "CRITICAL budget alert"
                    ),
                    Severity::Warning => warn!(
                        campaign = %campaign.campaign_name,
                        spend_pct = %pct(alert.spend_pct),
                        spend = %campaign.spend_today,
                        budget = %campaign.budget,
                        message = %alert.message,
                        "WARNING budget alert"
                    ),
                }
            }
            if assessment.alerts.is_empty() {
                summary.healthy += 1;
                info!(
                    campaign = %campaign.campaign_name,
                    spend_pct = %pct(campaign.spend_pct()),
                    "Budget pacing healthy"
                );
            }

            if let Some(reduction) = assessment.reduction {
                self.reduce_bids(campaign, reduction, &mut summary).await;
            }
            summary.alerts.extend(assessment.alerts);
        }

        summary.log();
        Ok(summary)
    }

    async fn reduce_bids(&self, campaign: &CampaignBudgetStatus, reduction: Decimal, summary: &mut MonitorSummary) {
        let ctx = &self.ctx;
        let min_bid = ctx.settings.min_bid;
        warn!(
            campaign = %campaign.campaign_name,
            reduction_pct = %pct(reduction),
            "Applying emergency bid reduction"
        );

        let keywords = match ctx.repository.campaign_keyword_bids(&campaign.campaign_id, min_bid).await {
            Ok(keywords) => keywords,
            Err(e) => {
                error!(campaign_id = %campaign.campaign_id, error = %e, "Could not load campaign keywords");
                return;
            }
        };
        info!(campaign_id = %campaign.campaign_id, keywords = keywords.len(), "Reducing keyword bids");

        let reason = format!("budget_pacing_cut_{}pct", pct(reduction));
        for keyword in keywords {
            let new_bid = reduced_bid(keyword.current_bid, reduction, min_bid);
            if new_bid == keyword.current_bid {
                continue;
            }

            let record = AuditRecord::new(
                AuditAction::BudgetReduction,
                keyword.keyword_id.clone(),
                keyword.current_bid,
                new_bid,
                reason.clone(),
                CHANGED_BY,
                ctx.dry_run(),
            )
            .with_keyword_text(&keyword.keyword_text);
            ctx.audit(&record).await;

            if ctx.client.update_keyword_bid(keyword.keyword_id, new_bid).await {
                summary.keywords_reduced += 1;
            } else {
                summary.keywords_failed += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::models::KeywordBid;
    use crate::data::repository::MemoryRepository;
    use crate::jobs::testing::{context, mount_token};
    use rust_decimal_macros::dec;
    use std::sync::Arc;
    use wiremock::MockServer;

    fn thresholds() -> PacingThresholds {
        PacingThresholds {
            checkpoint_hour: 15,
            critical: dec!(0.75),
            warning: dec!(0.65),
            exhausted: dec!(0.95),
        }
    }

    fn campaign(id: &str, budget: Decimal, spend: Decimal) -> CampaignBudgetStatus {
        CampaignBudgetStatus {
            campaign_id: id.into(),
            campaign_name: format!("Campaign {id}"),
            budget,
            budget_type: "DAILY".into(),
            spend_today: spend,
        }
    }

    #[test]
    fn test_checkpoint_critical() {
        let a = assess_pacing(&campaign("1", dec!(100), dec!(80)), 15, &thresholds());
        assert_eq!(a.reduction, Some(dec!(0.25)));
        assert_eq!(a.alerts.len(), 1);
        assert_eq!(a.alerts[0].severity, Severity::Critical);
        assert_eq!(a.alerts[0].message, "Over 75% at 15:00");
    }

    #[test]
    fn test_checkpoint_warning() {
        let a = assess_pacing(&campaign("1", dec!(100), dec!(70)), 15, &thresholds());
        assert_eq!(a.reduction, Some(dec!(0.15)));
        assert_eq!(a.alerts[0].severity, Severity::Warning);
    }

    #[test]
    fn test_healthy_and_off_checkpoint() {
        assert_eq!(
            assess_pacing(&campaign("1", dec!(100), dec!(60)), 15, &thresholds()),
            PacingAssessment::default()
        );
        // Over critical but not at the checkpoint hour.
        assert_eq!(
            assess_pacing(&campaign("1", dec!(100), dec!(80)), 14, &thresholds()),
            PacingAssessment::default()
        );
    }

    #[test]
    fn test_exhaustion_any_hour() {
        let a = assess_pacing(&campaign("1", dec!(50), dec!(48)), 9, &thresholds());
        assert_eq!(a.reduction, None);
        assert_eq!(a.alerts[0].message, "Budget nearly exhausted");

        // At the checkpoint both fire.
        let a = assess_pacing(&campaign("1", dec!(50), dec!(48)), 15, &thresholds());
        assert_eq!(a.alerts.len(), 2);
        assert_eq!(a.reduction, Some(dec!(0.25)));
    }

    #[test]
    fn test_zero_budget_is_zero_pct() {
        let a = assess_pacing(&campaign("1", dec!(0), dec!(10)), 15, &thresholds());
        assert!(a.alerts.is_empty());
    }

    #[test]
    fn test_reduced_bid() {
        assert_eq!(reduced_bid(dec!(1.00), dec!(0.25), dec!(0.20)), dec!(0.75));
        assert_eq!(reduced_bid(dec!(0.87), dec!(0.15), dec!(0.20)), dec!(0.74));
        assert_eq!(reduced_bid(dec!(0.22), dec!(0.25), dec!(0.20)), dec!(0.20));
    }

    #[tokio::test]
    async fn test_run_reduces_bids_at_checkpoint() {
        let server = MockServer::start().await;
        mount_token(&server).await;
        let repo = MemoryRepository::new()
            .with_campaigns(vec![
                campaign("hot", dec!(100), dec!(80)),
                campaign("calm", dec!(100), dec!(30)),
            ])
            .with_campaign_keywords(
                "hot",
                vec![
                    KeywordBid { keyword_id: "k1".into(), keyword_text: "a".into(), current_bid: dec!(1.00) },
                    KeywordBid { keyword_id: "k2".into(), keyword_text: "b".into(), current_bid: dec!(0.20) },
                ],
            );

        let (ctx, audit) = context(&server, Arc::new(repo), true);
        let summary = BudgetMonitor::new(ctx).run_at_hour(15).await.unwrap();

        assert_eq!(summary.campaigns, 2);
        assert_eq!(summary.healthy, 1);
        assert_eq!(summary.keywords_reduced, 1);

        let records = audit.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].action, AuditAction::BudgetReduction);
        assert_eq!(records[0].new_bid, dec!(0.75));
        assert_eq!(records[0].reason, "budget_pacing_cut_25pct");
    }

    #[tokio::test]
    async fn test_budget_load_failure_aborts() {
        let server = MockServer::start().await;
        mount_token(&server).await;
        let repo = MemoryRepository::new();
        repo.fail_query("campaign_budget_status");

        let (ctx, _) = context(&server, Arc::new(repo), true);
        assert!(matches!(
            BudgetMonitor::new(ctx).run_at_hour(15).await,
            Err(JobError::DataLoad(_))
        ));
    }
}
