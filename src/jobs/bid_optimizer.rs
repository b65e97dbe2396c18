//! Hourly bid optimization.
//!
//! Steps: token preflight, AOV windows, keyword load, score each keyword,
//! then audit and apply every decision that clears the stability gate.

use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::audit::AuditRecord;
use crate::data::aov::{default_sources, AovResolver};
use crate::scoring::{current_hour, BidScorer};

use super::{JobContext, JobError};

pub const CHANGED_BY: &str = "bid_optimizer";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OptimizerSummary {
    pub evaluated: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub total_increase: Decimal,
    pub total_decrease: Decimal,
}

impl OptimizerSummary {
    pub fn net_change(&self) -> Decimal {
        self.total_increase - self.total_decrease
    }

    fn log(&self) {
        info!("============================================================");
        info!(
            evaluated = self.evaluated,
            updated = self.updated,
            unchanged = self.unchanged,
            failed = self.failed,
            total_increase = %self.total_increase,
            total_decrease = %self.total_decrease,
            net_change = %self.net_change(),
            "Bid optimization summary"
        );
        info!("============================================================");
    }
}

pub struct BidOptimizer {
    ctx: JobContext,
    scorer: BidScorer,
}

impl BidOptimizer {
    pub fn new(ctx: JobContext) -> Self {
        let scorer = BidScorer::new(ctx.settings.bid_rules());
        Self { ctx, scorer }
    }

    pub async fn run(&self) -> Result<OptimizerSummary, JobError> {
        self.run_at_hour(current_hour(self.ctx.settings.tz())).await
    }

    /// Run with a fixed local hour for dayparting.
    pub async fn run_at_hour(&self, hour: u32) -> Result<OptimizerSummary, JobError> {
        let ctx = &self.ctx;
        let settings = &ctx.settings;
        ctx.banner("bid_optimizer", hour);
        ctx.preflight().await?;

        info!("Step 1: loading AOV windows");
        let aov = AovResolver::load(ctx.repository.as_ref(), &default_sources(), settings.default_aov).await;

        info!("Step 2: loading keywords");
        let keywords = ctx
            .repository
            .keywords_for_optimization(
                settings.optimizer_lookback_days,
                u64::from(settings.optimizer_min_clicks),
            )
            .await?;
        info!(keywords = keywords.len(), "Keywords to evaluate");

        let mut summary = OptimizerSummary::default();
        if keywords.is_empty() {
            warn!("No keywords to optimize");
            summary.log();
            return Ok(summary);
        }

        info!(hour, "Step 3: scoring and applying");
        for keyword in &keywords {
            summary.evaluated += 1;

            let asin_aov = aov.resolve(keyword.asin.as_deref());
            let decision = self.scorer.decide(keyword, asin_aov.aov, hour);

            if !decision.should_update {
                debug!(
                    keyword_id = %decision.keyword_id,
                    current_bid = %decision.old_bid,
                    optimal_bid = %decision.new_bid,
                    tier = %decision.tier,
                    "Holding bid"
                );
                summary.unchanged += 1;
                continue;
            }

            let record = AuditRecord::from_decision(&decision, CHANGED_BY, ctx.dry_run())
                .with_keyword_text(&keyword.keyword_text);
            ctx.audit(&record).await;

            info!(
                keyword = %keyword.keyword_text,
                keyword_id = %decision.keyword_id,
                old_bid = %decision.old_bid,
                new_bid = %decision.new_bid,
                tier = %decision.tier,
                reason = %decision.reason,
                aov = %asin_aov.aov,
                aov_source = %asin_aov.source,
                "Bid change"
            );

            if ctx
                .client
                .update_keyword_bid(decision.keyword_id.clone(), decision.new_bid)
                .await
            {
                summary.updated += 1;
                let change = decision.new_bid - decision.old_bid;
                if change > Decimal::ZERO {
                    summary.total_increase += change;
                } else {
                    summary.total_decrease += change.abs();
                }
            } else {
                summary.failed += 1;
            }
        }

        summary.log();
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditAction;
    use crate::data::models::{AovConfidence, AsinAov, KeywordPerformance};
    use crate::data::repository::MemoryRepository;
    use crate::jobs::testing::{context, mount_token};
    use rust_decimal_macros::dec;
    use std::sync::Arc;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn keyword(id: &str, asin: &str, current_bid: Decimal) -> KeywordPerformance {
        KeywordPerformance {
            keyword_id: id.into(),
            campaign_id: "c1".into(),
            ad_group_id: "ag1".into(),
            keyword_text: format!("kw {id}"),
            match_type: "exact".into(),
            current_bid,
            clicks: 10,
            conversions: 2,
            spend: dec!(8),
            sales: dec!(40),
            cvr: Some(dec!(0.20)),
            acos: Some(dec!(0.20)),
            asin: Some(asin.into()),
        }
    }

    fn repo() -> MemoryRepository {
        MemoryRepository::new()
            .with_aov_window(
                14,
                vec![AsinAov {
                    asin: "B0MID".into(),
                    aov: dec!(40),
                    orders: 8,
                    confidence: AovConfidence::Medium,
                    source: "14d".into(),
                }],
            )
            .with_keywords(vec![
                keyword("1", "B0MID", dec!(1.00)),
                // Already at the scored bid.
                keyword("2", "B0MID", dec!(2.02)),
            ])
    }

    #[tokio::test]
    async fn test_dry_run_audits_without_mutation() {
        let server = MockServer::start().await;
        mount_token(&server).await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let (ctx, audit) = context(&server, Arc::new(repo()), true);
        let summary = BidOptimizer::new(ctx).run_at_hour(19).await.unwrap();

        assert_eq!(summary.evaluated, 2);
        assert_eq!(summary.updated, 1);
        assert_eq!(summary.unchanged, 1);
        assert_eq!(summary.total_increase, dec!(1.02));
        assert_eq!(summary.net_change(), dec!(1.02));

        let records = audit.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].action, AuditAction::BidUpdate);
        assert_eq!(records[0].new_bid, dec!(2.02));
        assert_eq!(records[0].reason, "time_boost_h19");
        assert!(records[0].dry_run);
    }

    #[tokio::test]
    async fn test_live_run_tolerates_single_failure() {
        let server = MockServer::start().await;
        mount_token(&server).await;
        Mock::given(method("PUT"))
            .and(path("/v2/sp/keywords"))
            .and(body_partial_json(serde_json::json!([{ "keywordId": "bad" }])))
            .respond_with(ResponseTemplate::new(400))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/v2/sp/keywords"))
            .respond_with(ResponseTemplate::new(207).set_body_json(serde_json::json!([{ "code": "SUCCESS" }])))
            .mount(&server)
            .await;

        let repo = repo().with_keywords(vec![
            keyword("bad", "B0MID", dec!(1.00)),
            keyword("good", "B0MID", dec!(1.00)),
        ]);
        let (ctx, audit) = context(&server, Arc::new(repo), false);
        let summary = BidOptimizer::new(ctx).run_at_hour(19).await.unwrap();

        assert_eq!(summary.updated, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(audit.records().len(), 2);
    }

    #[tokio::test]
    async fn test_keyword_load_failure_aborts() {
        let server = MockServer::start().await;
        mount_token(&server).await;
        let repo = repo();
        repo.fail_query("keywords_for_optimization");

        let (ctx, _) = context(&server, Arc::new(repo), true);
        let result = BidOptimizer::new(ctx).run_at_hour(12).await;
        assert!(matches!(result, Err(JobError::DataLoad(_))));
    }

    #[tokio::test]
    async fn test_token_failure_aborts_before_loading() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/o2/token"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid_grant"))
            .mount(&server)
            .await;

        let (ctx, audit) = context(&server, Arc::new(repo()), true);
        let result = BidOptimizer::new(ctx).run_at_hour(12).await;
        assert!(matches!(result, Err(JobError::Identity(_))));
        assert!(audit.records().is_empty());
    }

    #[tokio::test]
    async fn test_aov_failure_degrades_to_default() {
        let server = MockServer::start().await;
        mount_token(&server).await;
        let repo = repo();
        repo.fail_query("asin_aov");

        let (ctx, audit) = context(&server, Arc::new(repo), true);
        let summary = BidOptimizer::new(ctx).run_at_hour(19).await.unwrap();

        // Default AOV 35 lands in the same ceiling band as 40.
        assert_eq!(summary.evaluated, 2);
        assert_eq!(audit.records()[0].new_bid, dec!(2.02));
    }

    #[tokio::test]
    async fn test_no_keywords_is_success() {
        let server = MockServer::start().await;
        mount_token(&server).await;
        let (ctx, _) = context(&server, Arc::new(MemoryRepository::new()), true);
        let summary = BidOptimizer::new(ctx).run_at_hour(3).await.unwrap();
        assert_eq!(summary, OptimizerSummary::default());
    }
}
