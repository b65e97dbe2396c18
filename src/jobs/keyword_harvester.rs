//! Keyword harvesting from customer search terms.
//!
//! Converting search terms become EXACT keywords in the ad group they came
//! from; search terms that burn clicks without orders become campaign-level
//! negative EXACT keywords.

use rust_decimal::Decimal;
use std::collections::HashSet;
use tracing::{debug, info, warn};

use crate::audit::{AuditAction, AuditRecord};
use crate::data::aov::{default_sources, AovResolver};
use crate::data::models::{EntityId, MatchType, NegativeMatchType, SearchTermCandidate};
use crate::scoring::{current_hour, BidScorer};

use super::{JobContext, JobError};

pub const CHANGED_BY: &str = "keyword_harvester";

#[derive(Debug, Clone, Copy)]
pub struct HarvestRules {
    pub min_clicks: u64,
    pub min_orders: u64,
    pub max_acos: Decimal,
    pub negative_min_clicks: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarvestAction {
    Promote,
    Negate,
    Skip,
}

pub fn classify_term(term: &SearchTermCandidate, rules: &HarvestRules) -> HarvestAction {
    let acos = term.acos.unwrap_or(Decimal::ZERO);
    if term.clicks >= rules.min_clicks && term.orders >= rules.min_orders && acos <= rules.max_acos {
        HarvestAction::Promote
    } else if term.clicks >= rules.negative_min_clicks && term.orders == 0 {
        HarvestAction::Negate
    } else {
        HarvestAction::Skip
    }
}

/// Resolve per-row classifications into at most one action per target.
///
/// A term is promoted once per ad group and negated once per campaign. A term
/// promoted anywhere in a campaign is never negated in that campaign.
pub fn plan_harvest<'a>(
    terms: &'a [SearchTermCandidate],
    rules: &HarvestRules,
) -> Vec<(&'a SearchTermCandidate, HarvestAction)> {
    let classified: Vec<_> = terms.iter().map(|t| (t, classify_term(t, rules))).collect();

    let promoted_in_campaign: HashSet<(EntityId, String)> = classified
        .iter()
        .filter(|(_, action)| *action == HarvestAction::Promote)
        .map(|(t, _)| (t.campaign_id.clone(), t.search_term.to_lowercase()))
        .collect();

    let mut promoted: HashSet<(EntityId, EntityId, String)> = HashSet::new();
    let mut negated: HashSet<(EntityId, String)> = HashSet::new();

    classified
        .into_iter()
        .map(|(t, action)| {
            let text = t.search_term.to_lowercase();
            let action = match action {
                HarvestAction::Promote => {
                    let key = (t.campaign_id.clone(), t.ad_group_id.clone(), text);
                    if promoted.insert(key) {
                        HarvestAction::Promote
                    } else {
                        debug!(term = %t.search_term, ad_group_id = %t.ad_group_id, "Already promoted in ad group");
                        HarvestAction::Skip
                    }
                }
                HarvestAction::Negate => {
                    let key = (t.campaign_id.clone(), text);
                    if promoted_in_campaign.contains(&key) {
                        debug!(term = %t.search_term, campaign_id = %t.campaign_id, "Promoted in campaign, not negating");
                        HarvestAction::Skip
                    } else if negated.insert(key) {
                        HarvestAction::Negate
                    } else {
                        HarvestAction::Skip
                    }
                }
                HarvestAction::Skip => HarvestAction::Skip,
            };
            (t, action)
        })
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HarvestSummary {
    pub candidates: usize,
    pub harvested: usize,
    pub negated: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl HarvestSummary {
    fn log(&self) {
        info!("============================================================");
        info!(
            candidates = self.candidates,
            harvested = self.harvested,
            negated = self.negated,
            skipped = self.skipped,
            failed = self.failed,
            "Keyword harvest summary"
        );
        info!("============================================================");
    }
}

pub struct KeywordHarvester {
    ctx: JobContext,
    scorer: BidScorer,
    rules: HarvestRules,
}

impl KeywordHarvester {
    pub fn new(ctx: JobContext) -> Self {
        let settings = &ctx.settings;
        let rules = HarvestRules {
            min_clicks: u64::from(settings.harvest_min_clicks),
            min_orders: u64::from(settings.harvest_min_orders),
            max_acos: settings.harvest_max_acos,
            negative_min_clicks: u64::from(settings.negative_min_clicks),
        };
        let scorer = BidScorer::new(settings.bid_rules());
        Self { ctx, scorer, rules }
    }

    pub async fn run(&self) -> Result<HarvestSummary, JobError> {
        let ctx = &self.ctx;
        let hour = current_hour(ctx.settings.tz());
        ctx.banner("keyword_harvester", hour);
        ctx.preflight().await?;

        let aov = AovResolver::load(ctx.repository.as_ref(), &default_sources(), ctx.settings.default_aov).await;

        let min_clicks = self.rules.min_clicks.min(self.rules.negative_min_clicks);
        let terms = ctx
            .repository
            .search_term_candidates(ctx.settings.harvest_days_lookback, min_clicks)
            .await?;

        let mut summary = HarvestSummary {
            candidates: terms.len(),
            ..HarvestSummary::default()
        };
        if terms.is_empty() {
            warn!("No search term candidates");
            summary.log();
            return Ok(summary);
        }

        for (term, action) in plan_harvest(&terms, &self.rules) {
            match action {
                HarvestAction::Promote => {
                    let asin_aov = aov.resolve(term.asin.as_deref());
                    let bid = self.scorer.harvest_bid(asin_aov.aov, term.cvr);
                    self.promote(term, bid, &mut summary).await;
                }
                HarvestAction::Negate => self.negate(term, &mut summary).await,
                HarvestAction::Skip => {
                    debug!(term = %term.search_term, clicks = term.clicks, orders = term.orders, "Skipping term");
                    summary.skipped += 1;
                }
            }
        }

        summary.log();
        Ok(summary)
    }

    async fn promote(&self, term: &SearchTermCandidate, bid: Decimal, summary: &mut HarvestSummary) {
        let ctx = &self.ctx;
        let record = AuditRecord::new(
            AuditAction::Harvest,
            term.source_keyword_id.clone(),
            Decimal::ZERO,
            bid,
            format!("harvest_{}_orders_{}_clicks", term.orders, term.clicks),
            CHANGED_BY,
            ctx.dry_run(),
        )
        .with_keyword_text(&term.search_term);
        ctx.audit(&record).await;

        info!(
            term = %term.search_term,
            ad_group_id = %term.ad_group_id,
            orders = term.orders,
            acos = ?term.acos,
            bid = %bid,
            "Harvesting search term as EXACT keyword"
        );

        if ctx
            .client
            .create_keyword(
                term.campaign_id.clone(),
                term.ad_group_id.clone(),
                &term.search_term,
                MatchType::Exact,
                bid,
            )
            .await
        {
            summary.harvested += 1;
        } else {
            summary.failed += 1;
        }
    }

    async fn negate(&self, term: &SearchTermCandidate, summary: &mut HarvestSummary) {
        let ctx = &self.ctx;
        let record = AuditRecord::new(
            AuditAction::Negative,
            term.source_keyword_id.clone(),
            Decimal::ZERO,
            Decimal::ZERO,
            format!("negative_{}_clicks_no_orders", term.clicks),
            CHANGED_BY,
            ctx.dry_run(),
        )
        .with_keyword_text(&term.search_term);
        ctx.audit(&record).await;

        info!(
            term = %term.search_term,
            campaign_id = %term.campaign_id,
            clicks = term.clicks,
            spend = %term.spend,
            "Adding negative EXACT keyword"
        );

        if ctx
            .client
            .create_negative_keyword(term.campaign_id.clone(), &term.search_term, NegativeMatchType::NegativeExact)
            .await
        {
            summary.negated += 1;
        } else {
            summary.failed += 1;
        }
    }
}
