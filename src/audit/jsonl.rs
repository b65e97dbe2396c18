//! Audit records as JSON lines in a local file.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{AuditError, AuditRecord, AuditSink};

pub struct JsonlAuditLog {
    path: PathBuf,
    // Serializes appends from concurrent callers.
    write_lock: Mutex<()>,
}

impl JsonlAuditLog {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl AuditSink for JsonlAuditLog {
    async fn record(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| AuditError::Write(format!("{}: {e}", self.path.display())))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| AuditError::Write(e.to_string()))?;
        file.flush().await.map_err(|e| AuditError::Write(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditAction;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_appends_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let log = JsonlAuditLog::new(dir.path().join("audit.jsonl"));

        let first = AuditRecord::new(AuditAction::BidUpdate, "1".into(), dec!(1.00), dec!(1.20), "tier_B_opt", "t", false);
        let second = AuditRecord::new(AuditAction::Negative, "2".into(), dec!(0), dec!(0), "bleeder", "t", true);
        log.record(&first).await.unwrap();
        log.record(&second).await.unwrap();

        let content = tokio::fs::read_to_string(log.path()).await.unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let parsed: AuditRecord = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(parsed.change_id, second.change_id);
        assert_eq!(parsed.action, AuditAction::Negative);
        assert!(parsed.dry_run);
    }

    #[tokio::test]
    async fn test_unwritable_path_errors() {
        let dir = tempfile::tempdir().unwrap();
        let log = JsonlAuditLog::new(dir.path().join("missing").join("audit.jsonl"));
        let record = AuditRecord::new(AuditAction::BidUpdate, "1".into(), dec!(1), dec!(1.1), "r", "t", false);
        assert!(matches!(log.record(&record).await, Err(AuditError::Write(_))));
    }
}
