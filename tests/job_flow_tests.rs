//! End-to-end job runs against mocked HTTP collaborators.
//!
//! The warehouse is an in-memory repository; the token endpoint and the
//! advertising API are wiremock servers; the audit trail is a JSONL file.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_partial_json, body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use ppc_autopilot::api::client::{AdsClient, AdsClientConfig};
use ppc_autopilot::api::retry::RetryPolicy;
use ppc_autopilot::audit::{AuditAction, AuditRecord, JsonlAuditLog};
use ppc_autopilot::auth::secrets::{load_credentials, MemorySecretStore, REFRESH_TOKEN};
use ppc_autopilot::auth::token::TokenManager;
use ppc_autopilot::config::Settings;
use ppc_autopilot::data::models::{AovConfidence, AsinAov, KeywordPerformance};
use ppc_autopilot::data::repository::MemoryRepository;
use ppc_autopilot::jobs::{BidOptimizer, JobContext, JobError};

// =============================================================================
// Helpers
// =============================================================================

fn secret_store() -> Arc<MemorySecretStore> {
    Arc::new(MemorySecretStore::new(&[
        ("amazon_client_id", "amzn1.client"),
        ("amazon_client_secret", "s3cret"),
        ("amazon_refresh_token", "Atzr|old"),
        ("amazon_profile_id", "4242"),
    ]))
}

fn keyword(id: &str, match_type: &str, clicks: u64, conversions: u64, acos: Option<Decimal>, cvr: Option<Decimal>) -> KeywordPerformance {
    KeywordPerformance {
        keyword_id: id.into(),
        campaign_id: "777".into(),
        ad_group_id: "888".into(),
        keyword_text: format!("keyword {id}"),
        match_type: match_type.to_string(),
        current_bid: dec!(1.00),
        clicks,
        conversions,
        spend: Decimal::from(clicks),
        sales: dec!(50),
        cvr,
        acos,
        asin: Some("B0SHOE".to_string()),
    }
}

fn repository() -> MemoryRepository {
    MemoryRepository::new()
        .with_aov_window(
            30,
            vec![AsinAov {
                asin: "B0SHOE".into(),
                aov: dec!(60),
                orders: 25,
                confidence: AovConfidence::High,
                source: "30d".into(),
            }],
        )
        .with_keywords(vec![
            // AOV 60 -> 1.95; A 1.20; EXACT; 19h 1.20 -> 2.808 -> 2.81
            keyword("1001", "EXACT", 10, 2, Some(dec!(0.20)), Some(dec!(0.20))),
            // 1.95 * 0.15 * 0.80 * 1.20 = 0.2808 -> 0.28
            keyword("1002", "PHRASE", 40, 0, None, None),
            // 1.95 * 0.75 * 0.60 * 1.20 = 1.053 -> 1.05, held against 1.02
            KeywordPerformance {
                current_bid: dec!(1.02),
                ..keyword("1003", "BROAD", 6, 0, None, None)
            },
        ])
}

async fn context(server: &MockServer, store: Arc<MemorySecretStore>, audit_path: &std::path::Path) -> JobContext {
    let settings = Settings::default();
    let credentials = load_credentials(store.as_ref()).await.unwrap();
    let tokens = Arc::new(
        TokenManager::new(
            &credentials,
            store.clone(),
            &format!("{}/auth/o2/token", server.uri()),
            Duration::from_secs(5),
        )
        .unwrap(),
    );
    let client = AdsClient::new(
        tokens.clone(),
        AdsClientConfig {
            base_url: server.uri(),
            client_id: credentials.client_id.clone(),
            profile_id: credentials.profile_id.clone(),
            dry_run: false,
            retry: RetryPolicy::new(3, Duration::from_millis(5), Duration::from_millis(10)),
            timeout: Duration::from_secs(5),
            rate_limit: 50,
        },
    )
    .unwrap();

    JobContext {
        settings: Arc::new(settings),
        tokens,
        client: Arc::new(client),
        repository: Arc::new(repository()),
        audit: Arc::new(JsonlAuditLog::new(audit_path)),
    }
}

// =============================================================================
// Flows
// =============================================================================

#[tokio::test]
async fn optimizer_run_rotates_token_applies_and_audits() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/o2/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "Atza|fresh",
            "refresh_token": "Atzr|rotated",
            "expires_in": 3600,
            "token_type": "bearer"
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/v2/sp/keywords"))
        .and(header("Authorization", "Bearer Atza|fresh"))
        .and(header("Amazon-Advertising-API-ClientId", "amzn1.client"))
        .and(header("Amazon-Advertising-API-Scope", "4242"))
        .respond_with(ResponseTemplate::new(207).set_body_json(serde_json::json!([{ "code": "SUCCESS" }])))
        .expect(2)
        .mount(&server)
        .await;

    let store = secret_store();
    let dir = tempfile::tempdir().unwrap();
    let audit_path = dir.path().join("changes.jsonl");
    let ctx = context(&server, store.clone(), &audit_path).await;

    let summary = BidOptimizer::new(ctx).run_at_hour(19).await.unwrap();

    assert_eq!(summary.evaluated, 3);
    assert_eq!(summary.updated, 2);
    assert_eq!(summary.unchanged, 1);
    assert_eq!(summary.failed, 0);
    // +1.81 and -0.72
    assert_eq!(summary.total_increase, dec!(1.81));
    assert_eq!(summary.total_decrease, dec!(0.72));
    assert_eq!(summary.net_change(), dec!(1.09));

    // Rotated refresh token written back exactly once.
    assert_eq!(
        store.writes(),
        vec![(REFRESH_TOKEN.to_string(), "Atzr|rotated".to_string())]
    );

    let content = tokio::fs::read_to_string(&audit_path).await.unwrap();
    let records: Vec<AuditRecord> = content
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.action == AuditAction::BidUpdate && !r.dry_run));
    assert_eq!(records[0].keyword_id.as_str(), "1002");
    assert_eq!(records[0].new_bid, dec!(0.28));
    assert_eq!(records[1].new_bid, dec!(2.81));
    // 30d window hit: high confidence downgraded, value still used.
    assert!(records[1].components.as_deref().unwrap_or_default().contains("1.95"));
}

#[tokio::test]
async fn optimizer_continues_past_rejected_keyword() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/o2/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "Atza|fresh",
            "expires_in": 3600
        })))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(body_partial_json(serde_json::json!([{ "keywordId": "1002" }])))
        .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
            "code": "INVALID_ARGUMENT",
            "details": "Keyword is archived"
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(207).set_body_json(serde_json::json!([{ "code": "SUCCESS" }])))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let ctx = context(&server, secret_store(), &dir.path().join("a.jsonl")).await;
    let summary = BidOptimizer::new(ctx).run_at_hour(19).await.unwrap();

    assert_eq!(summary.updated, 1);
    assert_eq!(summary.failed, 1);
}

#[tokio::test]
async fn optimizer_aborts_on_identity_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/o2/token"))
        .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
            "error": "invalid_grant"
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let audit_path = dir.path().join("a.jsonl");
    let ctx = context(&server, secret_store(), &audit_path).await;
    let result = BidOptimizer::new(ctx).run_at_hour(19).await;

    assert!(matches!(result, Err(JobError::Identity(_))));
    assert!(!audit_path.exists());
}
