//! Bid scoring engine: performance facts in, bid decision out.

pub mod rules;

use chrono::{Timelike, Utc};
use chrono_tz::Tz;
use rust_decimal::{Decimal, RoundingStrategy};

pub use rules::{BidDecision, BidRules, BidScore, BidScorer, PerformanceFacts, Tier};

/// Round to whole cents, halves away from zero.
pub fn round_bid(bid: Decimal) -> Decimal {
    bid.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Current hour (0-23) in the account timezone.
pub fn current_hour(tz: Tz) -> u32 {
    Utc::now().with_timezone(&tz).hour()
}
