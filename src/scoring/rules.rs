//! Bid scoring rules.
//!
//! `optimal = aov_ceiling * tier_mult * match_mult * hour_mult`, clamped to
//! `[min_bid, max_bid]` and rounded to cents. A change smaller than
//! [`STABILITY_THRESHOLD`] is held to avoid oscillating on noise.
//!
//! Scoring is a pure function of its inputs and the hour passed in; callers
//! resolve the hour once per run with [`super::current_hour`].

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::data::models::{EntityId, KeywordPerformance, MatchType};

use super::round_bid;

/// Minimum absolute bid change ($0.05) worth sending.
pub const STABILITY_THRESHOLD: Decimal = Decimal::from_parts(5, 0, 0, false, 2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tier {
    /// Strong winner.
    A,
    /// Solid.
    B,
    /// Insufficient data / testing.
    C,
    /// Clicks without sales.
    D,
    /// Heavy bleeder.
    E,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::A => "A",
            Self::B => "B",
            Self::C => "C",
            Self::D => "D",
            Self::E => "E",
        };
        f.write_str(s)
    }
}

impl Tier {
    pub fn multiplier(&self) -> Decimal {
        match self {
            Self::A => Decimal::new(120, 2),
            Self::B => Decimal::ONE,
            Self::C => Decimal::new(75, 2),
            Self::D => Decimal::new(40, 2),
            Self::E => Decimal::new(15, 2),
        }
    }
}

/// Bid bounds and harvest target.
#[derive(Debug, Clone, Copy)]
pub struct BidRules {
    pub min_bid: Decimal,
    pub max_bid: Decimal,
    pub target_acos: Decimal,
}

impl Default for BidRules {
    fn default() -> Self {
        Self {
            min_bid: Decimal::new(20, 2),
            max_bid: Decimal::new(500, 2),
            target_acos: Decimal::new(30, 2),
        }
    }
}

/// Performance facts for one keyword. Missing ratios count as zero.
#[derive(Debug, Clone)]
pub struct PerformanceFacts {
    pub aov: Decimal,
    pub current_bid: Decimal,
    pub conversions: u64,
    pub clicks: u64,
    pub acos: Option<Decimal>,
    pub cvr: Option<Decimal>,
    pub match_type: String,
}

impl PerformanceFacts {
    pub fn from_record(record: &KeywordPerformance, aov: Decimal) -> Self {
        Self {
            aov,
            current_bid: record.current_bid,
            conversions: record.conversions,
            clicks: record.clicks,
            acos: record.acos,
            cvr: record.cvr,
            match_type: record.match_type.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BidComponents {
    pub aov_ceiling: Decimal,
    pub tier_mult: Decimal,
    pub match_mult: Decimal,
    pub hour_mult: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BidScore {
    pub optimal_bid: Decimal,
    pub tier: Tier,
    pub reason: String,
    pub should_update: bool,
    pub components: BidComponents,
}

/// A scored keyword, ready for the audit log and the API client.
#[derive(Debug, Clone, PartialEq)]
pub struct BidDecision {
    pub keyword_id: EntityId,
    pub old_bid: Decimal,
    pub new_bid: Decimal,
    pub tier: Tier,
    pub reason: String,
    pub should_update: bool,
    pub components: BidComponents,
}

#[derive(Debug, Clone, Default)]
pub struct BidScorer {
    rules: BidRules,
}

impl BidScorer {
    pub fn new(rules: BidRules) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &BidRules {
        &self.rules
    }

    pub fn score(&self, facts: &PerformanceFacts, hour: u32) -> BidScore {
        let acos = facts.acos.unwrap_or(Decimal::ZERO);
        let cvr = facts.cvr.unwrap_or(Decimal::ZERO);
        let tier = classify_tier(facts.conversions, facts.clicks, acos, cvr);

        let components = BidComponents {
            aov_ceiling: aov_ceiling(facts.aov),
            tier_mult: tier.multiplier(),
            match_mult: match_type_multiplier(&facts.match_type),
            hour_mult: hour_multiplier(hour),
        };

        let mut optimal = components.aov_ceiling
            * components.tier_mult
            * components.match_mult
            * components.hour_mult;

        // Winners are scaled, never cut.
        if tier == Tier::A && optimal < facts.current_bid {
            optimal = facts.current_bid * Decimal::new(110, 2);
        }

        let optimal_bid = round_bid(self.clamp(optimal));
        let should_update = (optimal_bid - facts.current_bid).abs() >= STABILITY_THRESHOLD;

        BidScore {
            optimal_bid,
            tier,
            reason: reason_code(should_update, tier, components.hour_mult, hour),
            should_update,
            components,
        }
    }

    pub fn decide(&self, record: &KeywordPerformance, aov: Decimal, hour: u32) -> BidDecision {
        let score = self.score(&PerformanceFacts::from_record(record, aov), hour);
        BidDecision {
            keyword_id: record.keyword_id.clone(),
            old_bid: record.current_bid,
            new_bid: score.optimal_bid,
            tier: score.tier,
            reason: score.reason,
            should_update: score.should_update,
            components: score.components,
        }
    }

    /// Starting bid for a newly harvested search term: 85% of the break-even
    /// bid `aov * target_acos * cvr`, kept within the bid bounds.
    pub fn harvest_bid(&self, aov: Decimal, cvr: Option<Decimal>) -> Decimal {
        let break_even = aov * self.rules.target_acos * cvr.unwrap_or(Decimal::ZERO);
        let discounted = break_even * Decimal::new(85, 2);
        round_bid(self.clamp(discounted))
    }

    fn clamp(&self, bid: Decimal) -> Decimal {
        bid.max(self.rules.min_bid).min(self.rules.max_bid)
    }
}

/// Base bid ceiling by average order value.
pub fn aov_ceiling(aov: Decimal) -> Decimal {
    if aov < Decimal::new(30, 0) {
        Decimal::new(105, 2)
    } else if aov < Decimal::new(46, 0) {
        Decimal::new(140, 2)
    } else if aov < Decimal::new(70, 0) {
        Decimal::new(195, 2)
    } else {
        Decimal::new(250, 2)
    }
}

/// First match wins: A, B, E, D, then C.
pub fn classify_tier(conversions: u64, clicks: u64, acos: Decimal, cvr: Decimal) -> Tier {
    if conversions >= 2 && cvr >= Decimal::new(18, 2) && acos <= Decimal::new(25, 2) {
        Tier::A
    } else if conversions >= 1
        && cvr >= Decimal::new(10, 2)
        && cvr < Decimal::new(18, 2)
        && acos <= Decimal::new(40, 2)
    {
        Tier::B
    } else if clicks >= 30 && conversions == 0 {
        Tier::E
    } else if clicks >= 15 && conversions == 0 {
        Tier::D
    } else {
        Tier::C
    }
}

pub fn match_type_multiplier(match_type: &str) -> Decimal {
    match MatchType::parse_lenient(match_type) {
        MatchType::Exact => Decimal::ONE,
        MatchType::Phrase => Decimal::new(80, 2),
        MatchType::Broad => Decimal::new(60, 2),
    }
}

/// Dayparting in account-local hours: evening peak boosted, overnight cut.
pub fn hour_multiplier(hour: u32) -> Decimal {
    match hour {
        18..=21 => Decimal::new(120, 2),
        7..=9 => Decimal::new(95, 2),
        0..=5 => Decimal::new(70, 2),
        _ => Decimal::ONE,
    }
}

fn reason_code(should_update: bool, tier: Tier, hour_mult: Decimal, hour: u32) -> String {
    if !should_update {
        "hold".to_string()
    } else if hour_mult > Decimal::new(110, 2) {
        format!("time_boost_h{hour}")
    } else if hour_mult < Decimal::new(90, 2) {
        format!("time_cut_h{hour}")
    } else {
        format!("tier_{tier}_opt")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn facts(current_bid: Decimal, conversions: u64, clicks: u64, acos: Decimal, cvr: Decimal) -> PerformanceFacts {
        PerformanceFacts {
            aov: dec!(40),
            current_bid,
            conversions,
            clicks,
            acos: Some(acos),
            cvr: Some(cvr),
            match_type: "EXACT".to_string(),
        }
    }

    #[test]
    fn test_aov_ceiling_bands() {
        assert_eq!(aov_ceiling(dec!(12)), dec!(1.05));
        assert_eq!(aov_ceiling(dec!(29.99)), dec!(1.05));
        assert_eq!(aov_ceiling(dec!(30)), dec!(1.40));
        assert_eq!(aov_ceiling(dec!(45.99)), dec!(1.40));
        assert_eq!(aov_ceiling(dec!(46)), dec!(1.95));
        assert_eq!(aov_ceiling(dec!(70)), dec!(2.50));
    }

    #[test]
    fn test_tier_thresholds() {
        assert_eq!(classify_tier(3, 50, dec!(0.20), dec!(0.20)), Tier::A);
        assert_eq!(classify_tier(1, 30, dec!(0.35), dec!(0.12)), Tier::B);
        assert_eq!(classify_tier(0, 14, dec!(0), dec!(0)), Tier::C);
        assert_eq!(classify_tier(0, 15, dec!(0), dec!(0)), Tier::D);
        assert_eq!(classify_tier(0, 29, dec!(0), dec!(0)), Tier::D);
        assert_eq!(classify_tier(0, 30, dec!(0), dec!(0)), Tier::E);
        // cvr at the A/B boundary with poor acos falls through to C.
        assert_eq!(classify_tier(2, 10, dec!(0.50), dec!(0.18)), Tier::C);
    }

    #[test]
    fn test_match_type_multiplier() {
        assert_eq!(match_type_multiplier("EXACT"), dec!(1.00));
        assert_eq!(match_type_multiplier("phrase"), dec!(0.80));
        assert_eq!(match_type_multiplier("Broad"), dec!(0.60));
        assert_eq!(match_type_multiplier("AUTO"), dec!(0.60));
        assert_eq!(match_type_multiplier(""), dec!(0.60));
    }

    #[test]
    fn test_hour_multiplier() {
        assert_eq!(hour_multiplier(19), dec!(1.20));
        assert_eq!(hour_multiplier(22), dec!(1.00));
        assert_eq!(hour_multiplier(8), dec!(0.95));
        assert_eq!(hour_multiplier(12), dec!(1.00));
        assert_eq!(hour_multiplier(3), dec!(0.70));
        assert_eq!(hour_multiplier(6), dec!(1.00));
    }

    #[test]
    fn test_evening_winner_scenario() {
        // 1.40 * 1.20 * 1.00 * 1.20 = 2.016 -> 2.02
        let scorer = BidScorer::default();
        let score = scorer.score(&facts(dec!(1.00), 2, 10, dec!(0.20), dec!(0.20)), 19);
        assert_eq!(score.tier, Tier::A);
        assert_eq!(score.components.aov_ceiling, dec!(1.40));
        assert_eq!(score.components.tier_mult, dec!(1.20));
        assert_eq!(score.components.hour_mult, dec!(1.20));
        assert_eq!(score.optimal_bid, dec!(2.02));
        assert!(score.should_update);
        assert_eq!(score.reason, "time_boost_h19");
    }

    #[test]
    fn test_tier_a_never_cut() {
        // 1.40 * 1.20 * 0.70 = 1.176 < 3.00, so scale to 3.30.
        let scorer = BidScorer::default();
        let score = scorer.score(&facts(dec!(3.00), 4, 12, dec!(0.10), dec!(0.33)), 3);
        assert_eq!(score.tier, Tier::A);
        assert_eq!(score.optimal_bid, dec!(3.30));
        assert_eq!(score.reason, "time_cut_h3");
    }

    #[test]
    fn test_clamped_to_max_bid() {
        let scorer = BidScorer::default();
        let score = scorer.score(&facts(dec!(4.90), 4, 12, dec!(0.10), dec!(0.33)), 12);
        assert_eq!(score.optimal_bid, dec!(5.00));
        assert!(score.should_update);
    }

    #[test]
    fn test_bleeder_clamped_to_min_bid() {
        // 1.40 * 0.15 * 0.60 * 1.00 = 0.126 -> min 0.20
        let scorer = BidScorer::default();
        let mut f = facts(dec!(0.80), 0, 45, dec!(0), dec!(0));
        f.match_type = "broad".into();
        let score = scorer.score(&f, 14);
        assert_eq!(score.tier, Tier::E);
        assert_eq!(score.optimal_bid, dec!(0.20));
        assert_eq!(score.reason, "tier_E_opt");
    }

    #[test]
    fn test_stability_gate() {
        // Tier B, exact, midday: 1.40 * 1.00 = 1.40
        let scorer = BidScorer::default();
        let near = scorer.score(&facts(dec!(1.37), 1, 8, dec!(0.30), dec!(0.12)), 12);
        assert_eq!(near.optimal_bid, dec!(1.40));
        assert!(!near.should_update);
        assert_eq!(near.reason, "hold");

        let far = scorer.score(&facts(dec!(1.35), 1, 8, dec!(0.30), dec!(0.12)), 12);
        assert!(far.should_update);
        assert_eq!(far.reason, "tier_B_opt");
    }

    #[test]
    fn test_missing_ratios_treated_as_zero() {
        let scorer = BidScorer::default();
        let f = PerformanceFacts {
            aov: dec!(25),
            current_bid: dec!(0.50),
            conversions: 0,
            clicks: 3,
            acos: None,
            cvr: None,
            match_type: "PHRASE".into(),
        };
        // Tier C: 1.05 * 0.75 * 0.80 * 1.00 = 0.63
        let score = scorer.score(&f, 12);
        assert_eq!(score.tier, Tier::C);
        assert_eq!(score.optimal_bid, dec!(0.63));
    }

    #[test]
    fn test_harvest_bid() {
        let scorer = BidScorer::default();
        // 40 * 0.30 * 0.20 = 2.40 -> * 0.85 = 2.04
        assert_eq!(scorer.harvest_bid(dec!(40), Some(dec!(0.20))), dec!(2.04));
        // Tiny cvr stays at the floor.
        assert_eq!(scorer.harvest_bid(dec!(40), Some(dec!(0.01))), dec!(0.20));
        assert_eq!(scorer.harvest_bid(dec!(40), None), dec!(0.20));
        // Huge AOV is capped.
        assert_eq!(scorer.harvest_bid(dec!(500), Some(dec!(0.50))), dec!(5.00));
    }

    #[test]
    fn test_decide_carries_identity() {
        let record = KeywordPerformance {
            keyword_id: EntityId::from(555u64),
            campaign_id: "1".into(),
            ad_group_id: "2".into(),
            keyword_text: "yoga mat".into(),
            match_type: "exact".into(),
            current_bid: dec!(1.00),
            clicks: 10,
            conversions: 2,
            spend: dec!(4),
            sales: dec!(20),
            cvr: Some(dec!(0.20)),
            acos: Some(dec!(0.20)),
            asin: Some("B000TEST".into()),
        };
        let decision = BidScorer::default().decide(&record, dec!(40), 19);
        assert_eq!(decision.keyword_id.as_str(), "555");
        assert_eq!(decision.old_bid, dec!(1.00));
        assert_eq!(decision.new_bid, dec!(2.02));
    }
}
