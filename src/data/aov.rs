//! Per-ASIN average order value with window fallback.
//!
//! Sources are consulted in order (14d, then 30d); the first window that has
//! the ASIN wins, otherwise the configured default applies.

use rust_decimal::Decimal;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use super::models::{AovConfidence, AsinAov};
use super::repository::MetricsRepository;

pub const DEFAULT_SOURCE: &str = "default";
pub const AOV_MIN_ORDERS: u64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AovSource {
    pub window_days: u32,
    /// Older windows never report `high` confidence.
    pub stale: bool,
}

impl AovSource {
    pub fn label(&self) -> String {
        format!("{}d", self.window_days)
    }
}

pub fn default_sources() -> Vec<AovSource> {
    vec![
        AovSource { window_days: 14, stale: false },
        AovSource { window_days: 30, stale: true },
    ]
}

#[derive(Debug, Clone)]
pub struct AovResolver {
    layers: Vec<(AovSource, HashMap<String, AsinAov>)>,
    default_aov: Decimal,
}

impl AovResolver {
    pub fn new(default_aov: Decimal) -> Self {
        Self {
            layers: Vec::new(),
            default_aov,
        }
    }

    /// Add a window on top of the ones already present (consulted after them).
    pub fn with_layer(mut self, source: AovSource, rows: HashMap<String, AsinAov>) -> Self {
        self.layers.push((source, rows));
        self
    }

    /// Query every source once. A failed source is logged and treated as empty.
    pub async fn load(
        repo: &dyn MetricsRepository,
        sources: &[AovSource],
        default_aov: Decimal,
    ) -> Self {
        let mut resolver = Self::new(default_aov);

        for source in sources {
            let rows = match repo.asin_aov(source.window_days, AOV_MIN_ORDERS).await {
                Ok(rows) => rows,
                Err(e) => {
                    warn!(
                        window_days = source.window_days,
                        error = %e,
                        "AOV query failed, continuing without this window"
                    );
                    HashMap::new()
                }
            };
            info!(window = %source.label(), asins = rows.len(), "Loaded AOV window");
            resolver = resolver.with_layer(*source, rows);
        }

        info!(
            known_asins = resolver.known_asins(),
            default_aov = %resolver.default_aov(),
            "AOV resolver ready"
        );
        resolver
    }

    pub fn default_aov(&self) -> Decimal {
        self.default_aov
    }

    /// Number of distinct ASINs with a non-default value.
    pub fn known_asins(&self) -> usize {
        let mut seen: Vec<&String> = self.layers.iter().flat_map(|(_, rows)| rows.keys()).collect();
        seen.sort();
        seen.dedup();
        seen.len()
    }

    pub fn resolve(&self, asin: Option<&str>) -> AsinAov {
        if let Some(asin) = asin {
            for (source, rows) in &self.layers {
                if let Some(hit) = rows.get(asin) {
                    let mut hit = hit.clone();
                    hit.source = source.label();
                    if source.stale && hit.confidence == AovConfidence::High {
                        hit.confidence = AovConfidence::Medium;
                    }
                    return hit;
                }
            }
            debug!(asin, "Using default AOV");
        }

        AsinAov {
            asin: asin.unwrap_or_default().to_string(),
            aov: self.default_aov,
            orders: 0,
            confidence: AovConfidence::Default,
            source: DEFAULT_SOURCE.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::repository::MemoryRepository;
    use rust_decimal_macros::dec;

    fn row(asin: &str, aov: Decimal, orders: u64, confidence: AovConfidence) -> AsinAov {
        AsinAov {
            asin: asin.into(),
            aov,
            orders,
            confidence,
            source: String::new(),
        }
    }

    fn repo() -> MemoryRepository {
        MemoryRepository::new()
            .with_aov_window(14, vec![row("B0RECENT", dec!(52), 12, AovConfidence::High)])
            .with_aov_window(
                30,
                vec![
                    row("B0RECENT", dec!(48), 20, AovConfidence::High),
                    row("B0OLDER", dec!(28), 15, AovConfidence::High),
                ],
            )
    }

    #[tokio::test]
    async fn test_recent_window_wins() {
        let resolver = AovResolver::load(&repo(), &default_sources(), dec!(35)).await;
        let hit = resolver.resolve(Some("B0RECENT"));
        assert_eq!(hit.aov, dec!(52));
        assert_eq!(hit.source, "14d");
        assert_eq!(hit.confidence, AovConfidence::High);
        assert_eq!(resolver.known_asins(), 2);
    }

    #[tokio::test]
    async fn test_stale_window_downgrades_confidence() {
        let resolver = AovResolver::load(&repo(), &default_sources(), dec!(35)).await;
        let hit = resolver.resolve(Some("B0OLDER"));
        assert_eq!(hit.aov, dec!(28));
        assert_eq!(hit.source, "30d");
        assert_eq!(hit.confidence, AovConfidence::Medium);
    }

    #[tokio::test]
    async fn test_default_fallback() {
        let resolver = AovResolver::load(&repo(), &default_sources(), dec!(35)).await;
        assert_eq!(resolver.default_aov(), dec!(35));
        for asin in [Some("B0UNKNOWN"), None] {
            let hit = resolver.resolve(asin);
            assert_eq!(hit.aov, dec!(35));
            assert_eq!(hit.confidence, AovConfidence::Default);
            assert_eq!(hit.source, DEFAULT_SOURCE);
        }
    }

    #[tokio::test]
    async fn test_failed_source_degrades_to_default() {
        let repo = repo();
        repo.fail_query("asin_aov");
        let resolver = AovResolver::load(&repo, &default_sources(), dec!(35)).await;
        assert_eq!(resolver.known_asins(), 0);
        assert_eq!(resolver.resolve(Some("B0RECENT")).aov, dec!(35));
    }
}
