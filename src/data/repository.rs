//! Read access to the analytical store.
//!
//! Jobs only talk to [`MetricsRepository`]; the BigQuery adapter lives in
//! [`super::bigquery`] and [`MemoryRepository`] backs tests and local runs.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

use super::models::{
    AsinAov, CampaignBudgetStatus, EntityId, KeywordBid, KeywordPerformance, SearchTermCandidate,
};

#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("Query failed: {0}")]
    Query(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Auth error: {0}")]
    Auth(String),

    #[error("Row decode error: {0}")]
    Decode(String),
}

#[async_trait]
pub trait MetricsRepository: Send + Sync {
    /// Per-ASIN average order value over the last `window_days`, keyed by ASIN.
    /// ASINs with fewer than `min_orders` orders are omitted.
    async fn asin_aov(
        &self,
        window_days: u32,
        min_orders: u64,
    ) -> Result<HashMap<String, AsinAov>, RepositoryError>;

    /// Enabled keywords with at least `min_clicks` clicks or any conversion,
    /// aggregated over the lookback window, highest spend first.
    async fn keywords_for_optimization(
        &self,
        lookback_days: u32,
        min_clicks: u64,
    ) -> Result<Vec<KeywordPerformance>, RepositoryError>;

    /// Today's spend for every enabled daily-budget campaign.
    async fn campaign_budget_status(&self) -> Result<Vec<CampaignBudgetStatus>, RepositoryError>;

    /// Enabled keywords of a campaign bidding strictly above `above_bid`.
    async fn campaign_keyword_bids(
        &self,
        campaign_id: &EntityId,
        above_bid: Decimal,
    ) -> Result<Vec<KeywordBid>, RepositoryError>;

    /// Search terms with at least `min_clicks` clicks that are not yet
    /// managed as keywords.
    async fn search_term_candidates(
        &self,
        lookback_days: u32,
        min_clicks: u64,
    ) -> Result<Vec<SearchTermCandidate>, RepositoryError>;
}

// =============================================================================
// In-memory repository
// =============================================================================

/// Fixed data set held in memory. Filtering mirrors the warehouse queries.
#[derive(Default)]
pub struct MemoryRepository {
    aov_windows: HashMap<u32, Vec<AsinAov>>,
    keywords: Vec<KeywordPerformance>,
    campaigns: Vec<CampaignBudgetStatus>,
    campaign_keywords: HashMap<EntityId, Vec<KeywordBid>>,
    search_terms: Vec<SearchTermCandidate>,
    failing: Mutex<Vec<&'static str>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_aov_window(mut self, window_days: u32, rows: Vec<AsinAov>) -> Self {
        self.aov_windows.insert(window_days, rows);
        self
    }

    pub fn with_keywords(mut self, keywords: Vec<KeywordPerformance>) -> Self {
        self.keywords = keywords;
        self
    }

    pub fn with_campaigns(mut self, campaigns: Vec<CampaignBudgetStatus>) -> Self {
        self.campaigns = campaigns;
        self
    }

    pub fn with_campaign_keywords(mut self, campaign_id: impl Into<EntityId>, bids: Vec<KeywordBid>) -> Self {
        self.campaign_keywords.insert(campaign_id.into(), bids);
        self
    }

    pub fn with_search_terms(mut self, terms: Vec<SearchTermCandidate>) -> Self {
        self.search_terms = terms;
        self
    }

    /// Make the named query (`"asin_aov"`, `"keywords_for_optimization"`, ...)
    /// fail from now on.
    pub fn fail_query(&self, query: &'static str) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.push(query);
        }
    }

    fn check(&self, query: &'static str) -> Result<(), RepositoryError> {
        let failing = self
            .failing
            .lock()
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        if failing.contains(&query) {
            return Err(RepositoryError::Query(format!("{query} unavailable")));
        }
        Ok(())
    }
}

#[async_trait]
impl MetricsRepository for MemoryRepository {
    async fn asin_aov(
        &self,
        window_days: u32,
        min_orders: u64,
    ) -> Result<HashMap<String, AsinAov>, RepositoryError> {
        self.check("asin_aov")?;
        Ok(self
            .aov_windows
            .get(&window_days)
            .into_iter()
            .flatten()
            .filter(|row| row.orders >= min_orders)
            .map(|row| (row.asin.clone(), row.clone()))
            .collect())
    }

    async fn keywords_for_optimization(
        &self,
        _lookback_days: u32,
        min_clicks: u64,
    ) -> Result<Vec<KeywordPerformance>, RepositoryError> {
        self.check("keywords_for_optimization")?;
        let mut rows: Vec<_> = self
            .keywords
            .iter()
            .filter(|k| k.clicks >= min_clicks || k.conversions > 0)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.spend.cmp(&a.spend));
        Ok(rows)
    }

    async fn campaign_budget_status(&self) -> Result<Vec<CampaignBudgetStatus>, RepositoryError> {
        self.check("campaign_budget_status")?;
        Ok(self.campaigns.clone())
    }

    async fn campaign_keyword_bids(
        &self,
        campaign_id: &EntityId,
        above_bid: Decimal,
    ) -> Result<Vec<KeywordBid>, RepositoryError> {
        self.check("campaign_keyword_bids")?;
        Ok(self
            .campaign_keywords
            .get(campaign_id)
            .into_iter()
            .flatten()
            .filter(|k| k.current_bid > above_bid)
            .cloned()
            .collect())
    }

    async fn search_term_candidates(
        &self,
        _lookback_days: u32,
        min_clicks: u64,
    ) -> Result<Vec<SearchTermCandidate>, RepositoryError> {
        self.check("search_term_candidates")?;
        Ok(self
            .search_terms
            .iter()
            .filter(|t| t.clicks >= min_clicks)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::models::AovConfidence;
    use rust_decimal_macros::dec;

    fn keyword(id: &str, clicks: u64, conversions: u64, spend: Decimal) -> KeywordPerformance {
        KeywordPerformance {
            keyword_id: id.into(),
            campaign_id: "c1".into(),
            ad_group_id: "ag1".into(),
            keyword_text: format!("kw {id}"),
            match_type: "EXACT".into(),
            current_bid: dec!(1.00),
            clicks,
            conversions,
            spend,
            sales: Decimal::ZERO,
            cvr: None,
            acos: None,
            asin: None,
        }
    }

    #[tokio::test]
    async fn test_keyword_filter_and_order() {
        let repo = MemoryRepository::new().with_keywords(vec![
            keyword("low-clicks", 2, 0, dec!(9)),
            keyword("converter", 1, 1, dec!(3)),
            keyword("busy", 12, 0, dec!(20)),
        ]);

        let rows = repo.keywords_for_optimization(14, 5).await.unwrap();
        let ids: Vec<_> = rows.iter().map(|k| k.keyword_id.as_str()).collect();
        assert_eq!(ids, vec!["busy", "converter"]);
    }

    #[tokio::test]
    async fn test_aov_min_orders() {
        let repo = MemoryRepository::new().with_aov_window(
            14,
            vec![
                AsinAov {
                    asin: "B0A".into(),
                    aov: dec!(40),
                    orders: 1,
                    confidence: AovConfidence::Low,
                    source: "14d".into(),
                },
                AsinAov {
                    asin: "B0B".into(),
                    aov: dec!(55),
                    orders: 6,
                    confidence: AovConfidence::Medium,
                    source: "14d".into(),
                },
            ],
        );

        let map = repo.asin_aov(14, 2).await.unwrap();
        assert_eq!(map.len(), 1);
        assert!(map.contains_key("B0B"));
        assert!(repo.asin_aov(30, 2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failing_query() {
        let repo = MemoryRepository::new();
        repo.fail_query("campaign_budget_status");
        assert!(repo.campaign_budget_status().await.is_err());
        assert!(repo.search_term_candidates(30, 10).await.is_ok());
    }
}
