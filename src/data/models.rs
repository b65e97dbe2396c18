//! Core data models shared by the repository, scoring engine, API client
//! and jobs.
//!
//! Rows arrive from the analytical store as immutable snapshots; money and
//! ratios are `Decimal` throughout.

use rust_decimal::Decimal;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

// =============================================================================
// Identifiers
// =============================================================================

/// Campaign, ad-group or keyword identifier.
///
/// The advertising API rejects numeric identifiers, so an `EntityId` accepts
/// either representation on input and always serializes as a JSON string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for EntityId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<u64> for EntityId {
    fn from(n: u64) -> Self {
        Self(n.to_string())
    }
}

impl From<i64> for EntityId {
    fn from(n: i64) -> Self {
        Self(n.to_string())
    }
}

impl Serialize for EntityId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for EntityId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Str(String),
            Unsigned(u64),
            Signed(i64),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Str(s) if s.trim().is_empty() => Err(de::Error::custom("empty identifier")),
            Raw::Str(s) => Ok(Self(s.trim().to_string())),
            Raw::Unsigned(n) => Ok(Self(n.to_string())),
            Raw::Signed(n) => Ok(Self(n.to_string())),
        }
    }
}

// =============================================================================
// Enums
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchType {
    Exact,
    Phrase,
    Broad,
}

impl MatchType {
    /// Case-insensitive parse; anything unrecognized is treated as the
    /// broadest (most conservative) match type.
    pub fn parse_lenient(s: &str) -> Self {
        s.parse().unwrap_or(Self::Broad)
    }
}

impl FromStr for MatchType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "EXACT" => Ok(Self::Exact),
            "PHRASE" => Ok(Self::Phrase),
            "BROAD" => Ok(Self::Broad),
            _ => Err(format!("Unknown match type: {s}")),
        }
    }
}

impl fmt::Display for MatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact => write!(f, "EXACT"),
            Self::Phrase => write!(f, "PHRASE"),
            Self::Broad => write!(f, "BROAD"),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NegativeMatchType {
    #[default]
    NegativeExact,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AovConfidence {
    High,
    Medium,
    Low,
    Default,
}

// =============================================================================
// Analytical store rows
// =============================================================================

/// Aggregated keyword performance over the optimizer lookback window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeywordPerformance {
    pub keyword_id: EntityId,
    pub campaign_id: EntityId,
    pub ad_group_id: EntityId,
    pub keyword_text: String,
    /// Raw match type as stored; scoring parses it leniently.
    pub match_type: String,
    pub current_bid: Decimal,
    pub clicks: u64,
    pub conversions: u64,
    pub spend: Decimal,
    pub sales: Decimal,
    pub cvr: Option<Decimal>,
    pub acos: Option<Decimal>,
    pub asin: Option<String>,
}

/// Today's spend against the daily budget of one enabled campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignBudgetStatus {
    pub campaign_id: EntityId,
    pub campaign_name: String,
    pub budget: Decimal,
    pub budget_type: String,
    pub spend_today: Decimal,
}

impl CampaignBudgetStatus {
    /// Fraction of the daily budget spent; zero for a zero budget.
    pub fn spend_pct(&self) -> Decimal {
        if self.budget > Decimal::ZERO {
            self.spend_today / self.budget
        } else {
            Decimal::ZERO
        }
    }
}

/// A customer search term not yet managed as a keyword.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchTermCandidate {
    pub search_term: String,
    pub campaign_id: EntityId,
    pub ad_group_id: EntityId,
    /// Keyword or target that matched the search term.
    pub source_keyword_id: EntityId,
    pub clicks: u64,
    pub orders: u64,
    pub spend: Decimal,
    pub sales: Decimal,
    pub acos: Option<Decimal>,
    pub cvr: Option<Decimal>,
    pub asin: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeywordBid {
    pub keyword_id: EntityId,
    pub keyword_text: String,
    pub current_bid: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsinAov {
    pub asin: String,
    pub aov: Decimal,
    pub orders: u64,
    pub confidence: AovConfidence,
    /// Which lookup produced the value: "14d", "30d" or "default".
    pub source: String,
}

impl AsinAov {
    /// Confidence from order volume and how many distinct days had sales.
    pub fn confidence_for(orders: u64, active_days: u64) -> AovConfidence {
        if orders >= 10 && active_days >= 7 {
            AovConfidence::High
        } else if orders >= 5 {
            AovConfidence::Medium
        } else {
            AovConfidence::Low
        }
    }
}
