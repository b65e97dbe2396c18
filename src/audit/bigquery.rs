//! Audit records streamed into the `bid_change_log` warehouse table.

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::data::bigquery::BigQueryClient;

use super::{AuditError, AuditRecord, AuditSink};

pub const BID_CHANGE_TABLE: &str = "bid_change_log";

pub struct BigQueryAuditLog {
    client: Arc<BigQueryClient>,
    table: String,
    table_ready: OnceCell<()>,
}

impl BigQueryAuditLog {
    pub fn new(client: Arc<BigQueryClient>) -> Self {
        Self {
            client,
            table: BID_CHANGE_TABLE.to_string(),
            table_ready: OnceCell::new(),
        }
    }

    fn schema() -> serde_json::Value {
        json!([
            { "name": "change_id", "type": "STRING", "mode": "REQUIRED" },
            { "name": "action", "type": "STRING" },
            { "name": "keyword_id", "type": "STRING" },
            { "name": "keyword_text", "type": "STRING" },
            { "name": "old_bid", "type": "FLOAT64" },
            { "name": "new_bid", "type": "FLOAT64" },
            { "name": "bid_change", "type": "FLOAT64" },
            { "name": "reason", "type": "STRING" },
            { "name": "changed_by", "type": "STRING" },
            { "name": "components", "type": "STRING" },
            { "name": "changed_at", "type": "TIMESTAMP" },
            { "name": "dry_run", "type": "BOOL" }
        ])
    }

    /// Table creation is attempted once per process; failure only warns,
    /// the insert that follows reports the real problem.
    async fn ensure_table(&self) {
        self.table_ready
            .get_or_init(|| async {
                if let Err(e) = self.client.ensure_table(&self.table, Self::schema()).await {
                    warn!(table = %self.table, error = %e, "Could not create audit table");
                }
            })
            .await;
    }
}

#[async_trait]
impl AuditSink for BigQueryAuditLog {
    async fn record(&self, record: &AuditRecord) -> Result<(), AuditError> {
        self.ensure_table().await;

        let row = serde_json::to_value(record)?;
        self.client
            .insert_all(&self.table, vec![(record.change_id.clone(), row)])
            .await
            .map_err(|e| AuditError::Write(e.to_string()))?;

        info!(
            keyword_id = %record.keyword_id,
            old_bid = %record.old_bid,
            new_bid = %record.new_bid,
            "Logged change"
        );
        Ok(())
    }
}
