//! Wire payloads for the sponsored-products keyword endpoints.
//!
//! Every mutating endpoint takes a JSON array. Identifiers are always
//! strings on the wire (see [`EntityId`]); bids are numbers.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::data::models::{EntityId, MatchType, NegativeMatchType};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeywordState {
    #[default]
    Enabled,
}

/// `PUT /v2/sp/keywords` item.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeywordBidUpdate {
    pub keyword_id: EntityId,
    #[serde(with = "rust_decimal::serde::float")]
    pub bid: Decimal,
    pub state: KeywordState,
}

/// `POST /v2/sp/keywords` item.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewKeyword {
    pub campaign_id: EntityId,
    pub ad_group_id: EntityId,
    pub keyword_text: String,
    pub match_type: MatchType,
    pub state: KeywordState,
    #[serde(with = "rust_decimal::serde::float")]
    pub bid: Decimal,
}

/// `POST /v2/sp/campaignNegativeKeywords` item.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewNegativeKeyword {
    pub campaign_id: EntityId,
    pub keyword_text: String,
    pub match_type: NegativeMatchType,
    pub state: KeywordState,
}

/// One entry of a batch bid update.
#[derive(Debug, Clone, PartialEq)]
pub struct BidUpdate {
    pub keyword_id: EntityId,
    pub bid: Decimal,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchOutcome {
    pub success: usize,
    pub failed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_bid_update_wire_shape() {
        let item = KeywordBidUpdate {
            keyword_id: EntityId::from(281_474_976_710_655u64),
            bid: dec!(1.25),
            state: KeywordState::Enabled,
        };
        let json = serde_json::to_value(vec![item]).unwrap();
        assert_eq!(
            json,
            serde_json::json!([{ "keywordId": "281474976710655", "bid": 1.25, "state": "ENABLED" }])
        );
    }

    #[test]
    fn test_negative_keyword_wire_shape() {
        let item = NewNegativeKeyword {
            campaign_id: EntityId::from(77i64),
            keyword_text: "free".into(),
            match_type: NegativeMatchType::default(),
            state: KeywordState::Enabled,
        };
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["campaignId"], "77");
        assert_eq!(json["matchType"], "NEGATIVE_EXACT");
    }
}
