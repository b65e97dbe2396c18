//! Append-only record of every change the jobs decide on.
//!
//! Records are written before the API call, so a dry run leaves the same
//! trail as a live one (flagged with `dry_run`).

pub mod bigquery;
pub mod jsonl;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use thiserror::Error;
use uuid::Uuid;

use crate::data::models::EntityId;
use crate::scoring::BidDecision;

pub use bigquery::BigQueryAuditLog;
pub use jsonl::JsonlAuditLog;

#[derive(Error, Debug)]
pub enum AuditError {
    #[error("Audit write failed: {0}")]
    Write(String),

    #[error("Audit encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    BidUpdate,
    Harvest,
    Negative,
    BudgetReduction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub change_id: String,
    pub action: AuditAction,
    pub keyword_id: EntityId,
    pub keyword_text: Option<String>,
    #[serde(with = "rust_decimal::serde::float")]
    pub old_bid: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub new_bid: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub bid_change: Decimal,
    pub reason: String,
    pub changed_by: String,
    /// JSON-encoded scoring components, when the change came from scoring.
    pub components: Option<String>,
    pub changed_at: DateTime<Utc>,
    pub dry_run: bool,
}

impl AuditRecord {
    pub fn new(
        action: AuditAction,
        keyword_id: EntityId,
        old_bid: Decimal,
        new_bid: Decimal,
        reason: impl Into<String>,
        changed_by: &str,
        dry_run: bool,
    ) -> Self {
        Self {
            change_id: Uuid::new_v4().to_string(),
            action,
            keyword_id,
            keyword_text: None,
            old_bid,
            new_bid,
            bid_change: new_bid - old_bid,
            reason: reason.into(),
            changed_by: changed_by.to_string(),
            components: None,
            changed_at: Utc::now(),
            dry_run,
        }
    }

    pub fn from_decision(decision: &BidDecision, changed_by: &str, dry_run: bool) -> Self {
        let mut record = Self::new(
            AuditAction::BidUpdate,
            decision.keyword_id.clone(),
            decision.old_bid,
            decision.new_bid,
            decision.reason.clone(),
            changed_by,
            dry_run,
        );
        record.components = serde_json::to_string(&decision.components).ok();
        record
    }

    pub fn with_keyword_text(mut self, text: &str) -> Self {
        self.keyword_text = Some(text.to_string());
        self
    }
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: &AuditRecord) -> Result<(), AuditError>;
}

/// Keeps records in memory; for tests and local inspection.
#[derive(Default)]
pub struct MemoryAuditLog {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditLog {
    async fn record(&self, record: &AuditRecord) -> Result<(), AuditError> {
        self.records
            .lock()
            .map_err(|e| AuditError::Write(e.to_string()))?
            .push(record.clone());
        Ok(())
    }
}
