//! Append-only JSON-lines record of finished sessions.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use companion_core::history::SessionHistory;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub companion_id: String,
    pub ended_at: DateTime<Utc>,
}

pub struct JsonlHistory {
    path: PathBuf,
    // Keeps concurrently finishing sessions from interleaving their lines.
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonlHistory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, record: &SessionRecord) -> Result<()> {
        let mut line = serde_json::to_string(record).context("Failed to encode session record")?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("Failed to open history file: {}", self.path.display()))?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// All records in the file. A missing file has no records; malformed lines are skipped.
    pub async fn records(&self) -> Result<Vec<SessionRecord>> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("Failed to read history file: {}", self.path.display())
                });
            }
        };

        Ok(contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str(line) {
                Ok(record) => Some(record),
                Err(err) => {
                    tracing::warn!(error = %err, "Skipping malformed history line.");
                    None
                }
            })
            .collect())
    }
}

#[async_trait]
impl SessionHistory for JsonlHistory {
    async fn session_ended(&self, companion_id: &str) -> Result<()> {
        let record = SessionRecord {
            companion_id: companion_id.to_string(),
            ended_at: Utc::now(),
        };
        self.append(&record).await?;
        tracing::info!(companion_id, path = %self.path.display(), "Session recorded in history.");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn appends_one_line_per_finished_session() -> Result<()> {
        let dir = tempdir()?;
        let history = JsonlHistory::new(dir.path().join("nested").join("history.jsonl"));

        history.session_ended("companion-1").await?;
        history.session_ended("companion-2").await?;

        let raw = std::fs::read_to_string(history.path())?;
        assert_eq!(raw.lines().count(), 2);
        let first: serde_json::Value = serde_json::from_str(raw.lines().next().unwrap())?;
        assert_eq!(first["companion_id"], "companion-1");
        assert!(first["ended_at"].is_string());

        let records = history.records().await?;
        let ids: Vec<_> = records.iter().map(|record| record.companion_id.as_str()).collect();
        assert_eq!(ids, ["companion-1", "companion-2"]);
        assert!(records[0].ended_at <= records[1].ended_at);
        Ok(())
    }

    #[tokio::test]
    async fn missing_file_has_no_records() -> Result<()> {
        let dir = tempdir()?;
        let history = JsonlHistory::new(dir.path().join("absent.jsonl"));
        assert!(history.records().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("history.jsonl");
        std::fs::write(
            &path,
            "not json\n{\"companion_id\":\"c-9\",\"ended_at\":\"2026-01-02T03:04:05Z\"}\n\n",
        )?;

        let records = JsonlHistory::new(&path).records().await?;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].companion_id, "c-9");
        Ok(())
    }
}
