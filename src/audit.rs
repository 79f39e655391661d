//! Append-only JSONL audit log at `<configDir>/tool-calls.jsonl`.
//! Grounded on the teacher's `cache.rs` atomic write-via-temp-file-then-
//! rename pattern, but only for the *rotation* boundary — ordinary
//! appends are plain buffered line writes, not full rewrites.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: i64,
    pub tool_name: String,
    pub original_tool_name: String,
    pub server_name: Option<String>,
    pub arguments: Option<serde_json::Value>,
    pub result: Option<serde_json::Value>,
    pub success: bool,
    pub duration_ms: u64,
    pub error: Option<String>,
}

/// Milliseconds since the Unix epoch. Callers outside tests should use
/// this rather than `SystemTime::now()` directly so audit timestamps are
/// consistently shaped.
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

struct State {
    records: Vec<AuditRecord>,
}

pub struct AuditLog {
    path: PathBuf,
    max_records: usize,
    state: Mutex<State>,
}

impl AuditLog {
    pub async fn open(path: PathBuf, max_records: usize) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let records = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents
                .lines()
                .filter_map(|line| serde_json::from_str(line).ok())
                .collect(),
            Err(_) => Vec::new(),
        };

        Ok(Self {
            path,
            max_records,
            state: Mutex::new(State { records }),
        })
    }

    /// Append one record, rotating (atomic rewrite dropping the oldest
    /// records) when `max_records` is hit.
    pub async fn record(&self, record: AuditRecord) {
        let mut state = self.state.lock().await;
        state.records.push(record.clone());

        if state.records.len() > self.max_records {
            let overflow = state.records.len() - self.max_records;
            state.records.drain(0..overflow);
            if let Err(e) = self.rewrite(&state.records).await {
                error!(error = %e, "audit log rotation failed");
            }
            return;
        }

        if let Err(e) = self.append_line(&record).await {
            error!(error = %e, "audit log append failed");
        }
    }

    async fn append_line(&self, record: &AuditRecord) -> anyhow::Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }

    async fn rewrite(&self, records: &[AuditRecord]) -> anyhow::Result<()> {
        let tmp_path = self.path.with_extension("jsonl.tmp");
        let mut buffer = String::new();
        for record in records {
            buffer.push_str(&serde_json::to_string(record)?);
            buffer.push('\n');
        }
        tokio::fs::write(&tmp_path, buffer).await?;
        tokio::fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }

    pub async fn recent(&self, limit: usize) -> Vec<AuditRecord> {
        let state = self.state.lock().await;
        state
            .records
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn appends_and_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::open(dir.path().join("tool-calls.jsonl"), 100)
            .await
            .unwrap();

        log.record(AuditRecord {
            timestamp: 1,
            tool_name: "x_xzcli_y".into(),
            original_tool_name: "y".into(),
            server_name: Some("x".into()),
            arguments: None,
            result: None,
            success: true,
            duration_ms: 5,
            error: None,
        })
        .await;

        assert_eq!(log.recent(10).await.len(), 1);
    }

    #[tokio::test]
    async fn rotation_keeps_only_max_records() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::open(dir.path().join("tool-calls.jsonl"), 2)
            .await
            .unwrap();

        for i in 0..5 {
            log.record(AuditRecord {
                timestamp: i,
                tool_name: "t".into(),
                original_tool_name: "t".into(),
                server_name: None,
                arguments: None,
                result: None,
                success: true,
                duration_ms: 1,
                error: None,
            })
            .await;
        }

        assert_eq!(log.recent(10).await.len(), 2);
    }
}
