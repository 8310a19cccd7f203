//! Dead-letter queue: durable, categorized record of payloads the pipeline
//! could not process, with inspection and replay support.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, warn};

use crate::config::DlqConfig;

/// Failure categories for DLQ entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DlqCategory {
    JsonParseError,
    UnicodeDecodeError,
    ValidationError,
    TransformError,
    WriteError,
    UnknownError,
}

impl DlqCategory {
    pub const ALL: [DlqCategory; 6] = [
        DlqCategory::JsonParseError,
        DlqCategory::UnicodeDecodeError,
        DlqCategory::ValidationError,
        DlqCategory::TransformError,
        DlqCategory::WriteError,
        DlqCategory::UnknownError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DlqCategory::JsonParseError => "json_parse_error",
            DlqCategory::UnicodeDecodeError => "unicode_decode_error",
            DlqCategory::ValidationError => "validation_error",
            DlqCategory::TransformError => "transform_error",
            DlqCategory::WriteError => "write_error",
            DlqCategory::UnknownError => "unknown_error",
        }
    }
}

impl fmt::Display for DlqCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DlqCategory {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "json_parse_error" => Ok(DlqCategory::JsonParseError),
            "unicode_decode_error" => Ok(DlqCategory::UnicodeDecodeError),
            "validation_error" => Ok(DlqCategory::ValidationError),
            "transform_error" => Ok(DlqCategory::TransformError),
            "write_error" => Ok(DlqCategory::WriteError),
            "unknown_error" => Ok(DlqCategory::UnknownError),
            other => Err(format!("unknown DLQ category: {}", other)),
        }
    }
}

/// A dead-letter queue entry with its payload already decompressed.
#[derive(Debug, Clone)]
pub struct DlqEntry {
    pub id: String,
    pub category: DlqCategory,
    pub topic: String,
    pub payload: Vec<u8>,
    pub error_message: String,
    pub error_detail: Option<String>,
    pub archive_id: Option<String>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub last_retry_at: Option<DateTime<Utc>>,
}

impl DlqEntry {
    /// Summary form for listings; the payload itself is reported by size only.
    pub fn to_summary(&self) -> Value {
        serde_json::json!({
            "id": self.id,
            "category": self.category.as_str(),
            "topic": self.topic,
            "payload_size": self.payload.len(),
            "error_message": self.error_message,
            "archive_id": self.archive_id,
            "retry_count": self.retry_count,
            "created_at": self.created_at.to_rfc3339_opts(SecondsFormat::Micros, true),
            "last_retry_at": self.last_retry_at.map(|t| t.to_rfc3339_opts(SecondsFormat::Micros, true)),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DlqStats {
    pub total_entries: u64,
    pub max_entries: u32,
    pub by_category: HashMap<String, u64>,
    pub avg_retry_count: f64,
    pub total_enqueued: u64,
    pub total_replayed: u64,
    pub total_failed_replays: u64,
    pub retention_days: u32,
    pub db_path: String,
}

/// Stores failed payloads in SQLite for inspection and replay.
pub struct DeadLetterQueue {
    pool: SqlitePool,
    db_path: PathBuf,
    max_entries: u32,
    retention_days: u32,
    max_retries: u32,
    total_enqueued: AtomicU64,
    total_replayed: AtomicU64,
    total_failed_replays: AtomicU64,
}

fn timestamp_string(ts: DateTime<Utc>) -> String {
    // Fixed-width form so lexicographic comparison in SQL matches time order.
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn compress_payload(payload: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(payload)?;
    Ok(encoder.finish()?)
}

/// Decompress a stored payload, falling back to raw bytes for rows written
/// before compression was introduced.
fn decompress_payload(data: &[u8]) -> Vec<u8> {
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::new();
    match decoder.read_to_end(&mut out) {
        Ok(_) => out,
        Err(_) => data.to_vec(),
    }
}

impl DeadLetterQueue {
    /// Open (and initialize) the DLQ database. Failure here is fatal to
    /// startup: the process must not run without its durability tier.
    pub async fn open(config: &DlqConfig) -> Result<Self> {
        if let Some(parent) = config.db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create DLQ dir {}", parent.display()))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(&config.db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open DLQ database {}", config.db_path.display()))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS dlq_entries (
                id TEXT PRIMARY KEY,
                category TEXT NOT NULL,
                topic TEXT NOT NULL,
                payload BLOB NOT NULL,
                error_message TEXT NOT NULL,
                error_traceback TEXT,
                archive_id TEXT,
                retry_count INTEGER DEFAULT 0,
                created_at TEXT NOT NULL,
                last_retry_at TEXT
            )",
        )
        .execute(&pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_dlq_category ON dlq_entries(category)")
            .execute(&pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_dlq_created_at ON dlq_entries(created_at)")
            .execute(&pool)
            .await?;

        debug!(path = %config.db_path.display(), "dlq initialized");
        Ok(Self {
            pool,
            db_path: config.db_path.clone(),
            max_entries: config.max_entries,
            retention_days: config.retention_days,
            max_retries: config.max_retries,
            total_enqueued: AtomicU64::new(0),
            total_replayed: AtomicU64::new(0),
            total_failed_replays: AtomicU64::new(0),
        })
    }

    /// Add a failed payload. Triggers a best-effort cleanup pass (retention
    /// and capacity eviction). Returns the 16-hex entry id.
    pub async fn enqueue(
        &self,
        category: DlqCategory,
        topic: &str,
        payload: &[u8],
        error_message: &str,
        error_detail: Option<&str>,
        archive_id: Option<&str>,
    ) -> Result<String> {
        let entry_id = uuid::Uuid::new_v4().simple().to_string()[..16].to_string();
        let compressed = compress_payload(payload)?;

        sqlx::query(
            "INSERT INTO dlq_entries (
                id, category, topic, payload, error_message,
                error_traceback, archive_id, retry_count, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?)",
        )
        .bind(&entry_id)
        .bind(category.as_str())
        .bind(topic)
        .bind(&compressed)
        .bind(error_message)
        .bind(error_detail)
        .bind(archive_id)
        .bind(timestamp_string(Utc::now()))
        .execute(&self.pool)
        .await?;

        self.total_enqueued.fetch_add(1, Ordering::Relaxed);
        warn!(
            entry_id = %entry_id,
            category = %category,
            topic,
            error = error_message,
            archive_id = archive_id.unwrap_or("-"),
            "dlq enqueued"
        );

        if let Err(e) = self.cleanup().await {
            warn!(error = %e, "dlq cleanup failed");
        }

        Ok(entry_id)
    }

    pub async fn get_entry(&self, entry_id: &str) -> Result<Option<DlqEntry>> {
        let row = sqlx::query(
            "SELECT id, category, topic, payload, error_message,
                    error_traceback, archive_id, retry_count, created_at, last_retry_at
             FROM dlq_entries WHERE id = ?",
        )
        .bind(entry_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Self::entry_from_row))
    }

    /// Paged read, newest first, optionally filtered by category.
    pub async fn get_entries(
        &self,
        category: Option<DlqCategory>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<DlqEntry>> {
        let rows = match category {
            Some(cat) => {
                sqlx::query(
                    "SELECT id, category, topic, payload, error_message,
                            error_traceback, archive_id, retry_count, created_at, last_retry_at
                     FROM dlq_entries WHERE category = ?
                     ORDER BY created_at DESC LIMIT ? OFFSET ?",
                )
                .bind(cat.as_str())
                .bind(limit as i64)
                .bind(offset as i64)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT id, category, topic, payload, error_message,
                            error_traceback, archive_id, retry_count, created_at, last_retry_at
                     FROM dlq_entries
                     ORDER BY created_at DESC LIMIT ? OFFSET ?",
                )
                .bind(limit as i64)
                .bind(offset as i64)
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(rows.into_iter().map(Self::entry_from_row).collect())
    }

    /// Attempt to replay one entry through the supplied callback.
    ///
    /// Refuses entries that have exhausted `max_retries`. On callback success
    /// the entry is deleted and `true` returned; on any failure the retry
    /// count is bumped and `false` returned.
    pub async fn replay_entry<F, Fut>(&self, entry_id: &str, mut callback: F) -> Result<bool>
    where
        F: FnMut(String, Value) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let Some(entry) = self.get_entry(entry_id).await? else {
            warn!(entry_id, "dlq entry not found");
            return Ok(false);
        };

        if entry.retry_count >= self.max_retries {
            warn!(entry_id, retry_count = entry.retry_count, "dlq max retries exceeded");
            return Ok(false);
        }

        let parsed: std::result::Result<Value, _> = std::str::from_utf8(&entry.payload)
            .map_err(anyhow::Error::from)
            .and_then(|s| serde_json::from_str(s).map_err(anyhow::Error::from));

        let outcome = match parsed {
            Ok(payload) => callback(entry.topic.clone(), payload).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => {
                self.delete_entry(entry_id).await?;
                self.total_replayed.fetch_add(1, Ordering::Relaxed);
                info!(entry_id, "dlq replay success");
                Ok(true)
            }
            Err(e) => {
                self.total_failed_replays.fetch_add(1, Ordering::Relaxed);
                self.increment_retry(entry_id).await?;
                warn!(entry_id, retry_count = entry.retry_count + 1, error = %e, "dlq replay failed");
                Ok(false)
            }
        }
    }

    /// Replay the newest `limit` entries in a category.
    /// Returns `(success_count, failure_count)`.
    pub async fn replay_category<F, Fut>(
        &self,
        category: DlqCategory,
        mut callback: F,
        limit: u32,
    ) -> Result<(u64, u64)>
    where
        F: FnMut(String, Value) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let entries = self.get_entries(Some(category), limit, 0).await?;

        let mut success = 0u64;
        let mut failure = 0u64;
        for entry in entries {
            if self.replay_entry(&entry.id, &mut callback).await? {
                success += 1;
            } else {
                failure += 1;
            }
        }

        info!(category = %category, success, failure, "dlq category replay complete");
        Ok((success, failure))
    }

    pub async fn delete_entry(&self, entry_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM dlq_entries WHERE id = ?")
            .bind(entry_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete everything. Returns the number of entries removed.
    pub async fn clear(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM dlq_entries").execute(&self.pool).await?;
        let count = result.rows_affected();
        info!(count, "dlq cleared");
        Ok(count)
    }

    pub async fn stats(&self) -> Result<DlqStats> {
        let total: i64 = sqlx::query("SELECT COUNT(*) FROM dlq_entries")
            .fetch_one(&self.pool)
            .await?
            .get(0);

        let rows = sqlx::query("SELECT category, COUNT(*) FROM dlq_entries GROUP BY category")
            .fetch_all(&self.pool)
            .await?;
        let by_category = rows
            .into_iter()
            .map(|row| (row.get::<String, _>(0), row.get::<i64, _>(1) as u64))
            .collect();

        let avg_retries: Option<f64> = sqlx::query("SELECT AVG(retry_count) FROM dlq_entries")
            .fetch_one(&self.pool)
            .await?
            .get(0);

        Ok(DlqStats {
            total_entries: total as u64,
            max_entries: self.max_entries,
            by_category,
            avg_retry_count: (avg_retries.unwrap_or(0.0) * 100.0).round() / 100.0,
            total_enqueued: self.total_enqueued.load(Ordering::Relaxed),
            total_replayed: self.total_replayed.load(Ordering::Relaxed),
            total_failed_replays: self.total_failed_replays.load(Ordering::Relaxed),
            retention_days: self.retention_days,
            db_path: self.db_path.display().to_string(),
        })
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    fn entry_from_row(row: sqlx::sqlite::SqliteRow) -> DlqEntry {
        let category: String = row.get("category");
        let payload: Vec<u8> = row.get("payload");
        let created_at: String = row.get("created_at");
        let last_retry_at: Option<String> = row.get("last_retry_at");

        DlqEntry {
            id: row.get("id"),
            category: category.parse().unwrap_or(DlqCategory::UnknownError),
            topic: row.get("topic"),
            payload: decompress_payload(&payload),
            error_message: row.get("error_message"),
            error_detail: row.get("error_traceback"),
            archive_id: row.get("archive_id"),
            retry_count: row.get::<i64, _>("retry_count") as u32,
            created_at: parse_timestamp(&created_at),
            last_retry_at: last_retry_at.as_deref().map(parse_timestamp),
        }
    }

    async fn increment_retry(&self, entry_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE dlq_entries SET retry_count = retry_count + 1, last_retry_at = ? WHERE id = ?",
        )
        .bind(timestamp_string(Utc::now()))
        .bind(entry_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Drop entries past retention, then evict the oldest beyond capacity.
    async fn cleanup(&self) -> Result<()> {
        let cutoff = timestamp_string(Utc::now() - chrono::Duration::days(self.retention_days as i64));
        let aged_out = sqlx::query("DELETE FROM dlq_entries WHERE created_at < ?")
            .bind(&cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();

        let count: i64 = sqlx::query("SELECT COUNT(*) FROM dlq_entries")
            .fetch_one(&self.pool)
            .await?
            .get(0);

        let mut evicted = 0u64;
        if count > self.max_entries as i64 {
            let excess = count - self.max_entries as i64;
            evicted = sqlx::query(
                "DELETE FROM dlq_entries WHERE id IN (
                    SELECT id FROM dlq_entries ORDER BY created_at ASC LIMIT ?
                )",
            )
            .bind(excess)
            .execute(&self.pool)
            .await?
            .rows_affected();
        }

        if aged_out > 0 || evicted > 0 {
            info!(aged_out, evicted, "dlq cleanup");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_config(dir: &std::path::Path) -> DlqConfig {
        DlqConfig {
            enabled: true,
            db_path: dir.join("dlq.db"),
            max_entries: 100,
            retention_days: 30,
            max_retries: 3,
        }
    }

    #[tokio::test]
    async fn enqueue_and_get_roundtrip_with_compression() {
        let dir = tempdir().unwrap();
        let dlq = DeadLetterQueue::open(&test_config(dir.path())).await.unwrap();

        let payload = br#"{"name": "heart_rate", "qty": 72}"#;
        let id = dlq
            .enqueue(
                DlqCategory::TransformError,
                "http/ingest",
                payload,
                "boom",
                Some("transform stage failed"),
                Some("abcdef0123456789"),
            )
            .await
            .unwrap();
        assert_eq!(id.len(), 16);

        let entry = dlq.get_entry(&id).await.unwrap().unwrap();
        assert_eq!(entry.category, DlqCategory::TransformError);
        assert_eq!(entry.topic, "http/ingest");
        assert_eq!(entry.payload, payload);
        assert_eq!(entry.error_message, "boom");
        assert_eq!(entry.archive_id.as_deref(), Some("abcdef0123456789"));
        assert_eq!(entry.retry_count, 0);

        // Stored blob is compressed, not the raw payload.
        let raw: Vec<u8> = sqlx::query("SELECT payload FROM dlq_entries WHERE id = ?")
            .bind(&id)
            .fetch_one(&dlq.pool)
            .await
            .unwrap()
            .get(0);
        assert_ne!(raw, payload.to_vec());
        assert_eq!(decompress_payload(&raw), payload.to_vec());
    }

    #[tokio::test]
    async fn legacy_uncompressed_rows_are_readable() {
        let dir = tempdir().unwrap();
        let dlq = DeadLetterQueue::open(&test_config(dir.path())).await.unwrap();

        sqlx::query(
            "INSERT INTO dlq_entries (id, category, topic, payload, error_message, retry_count, created_at)
             VALUES ('legacy0000000000', 'write_error', 't', ?, 'old', 0, ?)",
        )
        .bind(br#"{"raw": true}"#.to_vec())
        .bind(timestamp_string(Utc::now()))
        .execute(&dlq.pool)
        .await
        .unwrap();

        let entry = dlq.get_entry("legacy0000000000").await.unwrap().unwrap();
        assert_eq!(entry.payload, br#"{"raw": true}"#);
    }

    #[tokio::test]
    async fn replay_success_deletes_entry() {
        let dir = tempdir().unwrap();
        let dlq = DeadLetterQueue::open(&test_config(dir.path())).await.unwrap();
        let id = dlq
            .enqueue(DlqCategory::WriteError, "t", br#"{"x": 1}"#, "err", None, None)
            .await
            .unwrap();

        let replayed = dlq
            .replay_entry(&id, |topic, payload| async move {
                assert_eq!(topic, "t");
                assert_eq!(payload["x"], 1);
                Ok(())
            })
            .await
            .unwrap();

        assert!(replayed);
        assert!(dlq.get_entry(&id).await.unwrap().is_none());
        assert_eq!(dlq.stats().await.unwrap().total_replayed, 1);
    }

    #[tokio::test]
    async fn replay_failure_bumps_retry_count() {
        let dir = tempdir().unwrap();
        let dlq = DeadLetterQueue::open(&test_config(dir.path())).await.unwrap();
        let id = dlq
            .enqueue(DlqCategory::WriteError, "t", br#"{"x": 1}"#, "err", None, None)
            .await
            .unwrap();

        let replayed = dlq
            .replay_entry(&id, |_, _| async { anyhow::bail!("still broken") })
            .await
            .unwrap();

        assert!(!replayed);
        let entry = dlq.get_entry(&id).await.unwrap().unwrap();
        assert_eq!(entry.retry_count, 1);
        assert!(entry.last_retry_at.is_some());
    }

    #[tokio::test]
    async fn retry_cap_is_sticky_and_skips_callback() {
        let dir = tempdir().unwrap();
        let dlq = DeadLetterQueue::open(&test_config(dir.path())).await.unwrap();
        let id = dlq
            .enqueue(DlqCategory::WriteError, "t", br#"{"x": 1}"#, "err", None, None)
            .await
            .unwrap();

        for _ in 0..3 {
            let ok = dlq
                .replay_entry(&id, |_, _| async { anyhow::bail!("nope") })
                .await
                .unwrap();
            assert!(!ok);
        }

        // Exhausted: callback must not run, count must not move.
        let mut called = false;
        let ok = dlq
            .replay_entry(&id, |_, _| {
                called = true;
                async { Ok(()) }
            })
            .await
            .unwrap();
        assert!(!ok);
        assert!(!called);
        assert_eq!(dlq.get_entry(&id).await.unwrap().unwrap().retry_count, 3);
    }

    #[tokio::test]
    async fn non_json_payload_counts_as_failed_replay() {
        let dir = tempdir().unwrap();
        let dlq = DeadLetterQueue::open(&test_config(dir.path())).await.unwrap();
        let id = dlq
            .enqueue(DlqCategory::UnicodeDecodeError, "t", &[0xff, 0xfe], "bad", None, None)
            .await
            .unwrap();

        let ok = dlq.replay_entry(&id, |_, _| async { Ok(()) }).await.unwrap();
        assert!(!ok);
        assert_eq!(dlq.get_entry(&id).await.unwrap().unwrap().retry_count, 1);
    }

    #[tokio::test]
    async fn replay_category_reports_success_and_failure_counts() {
        let dir = tempdir().unwrap();
        let dlq = DeadLetterQueue::open(&test_config(dir.path())).await.unwrap();
        dlq.enqueue(DlqCategory::JsonParseError, "t", br#"{"ok": 1}"#, "e", None, None)
            .await
            .unwrap();
        dlq.enqueue(DlqCategory::JsonParseError, "t", br#"{"ok": 0}"#, "e", None, None)
            .await
            .unwrap();

        let (success, failure) = dlq
            .replay_category(
                DlqCategory::JsonParseError,
                |_, payload| async move {
                    if payload["ok"] == 1 {
                        Ok(())
                    } else {
                        anyhow::bail!("callback rejected")
                    }
                },
                100,
            )
            .await
            .unwrap();

        assert_eq!(success, 1);
        assert_eq!(failure, 1);
    }

    #[tokio::test]
    async fn retention_cleanup_runs_on_enqueue() {
        let dir = tempdir().unwrap();
        let dlq = DeadLetterQueue::open(&test_config(dir.path())).await.unwrap();

        // Plant an entry well past retention.
        sqlx::query(
            "INSERT INTO dlq_entries (id, category, topic, payload, error_message, retry_count, created_at)
             VALUES ('old0000000000000', 'write_error', 't', X'00', 'old', 0, ?)",
        )
        .bind(timestamp_string(Utc::now() - chrono::Duration::days(60)))
        .execute(&dlq.pool)
        .await
        .unwrap();

        dlq.enqueue(DlqCategory::WriteError, "t", b"{}", "new", None, None)
            .await
            .unwrap();

        assert!(dlq.get_entry("old0000000000000").await.unwrap().is_none());
        assert_eq!(dlq.stats().await.unwrap().total_entries, 1);
    }

    #[tokio::test]
    async fn capacity_eviction_drops_oldest() {
        let dir = tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.max_entries = 100;
        let dlq = DeadLetterQueue::open(&config).await.unwrap();

        let mut first_id = None;
        for i in 0..103 {
            let id = dlq
                .enqueue(
                    DlqCategory::UnknownError,
                    "t",
                    format!("{{\"n\": {}}}", i).as_bytes(),
                    "e",
                    None,
                    None,
                )
                .await
                .unwrap();
            if i == 0 {
                first_id = Some(id);
            }
        }

        let stats = dlq.stats().await.unwrap();
        assert!(stats.total_entries <= 100);
        assert!(dlq.get_entry(&first_id.unwrap()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stats_aggregate_by_category() {
        let dir = tempdir().unwrap();
        let dlq = DeadLetterQueue::open(&test_config(dir.path())).await.unwrap();
        dlq.enqueue(DlqCategory::JsonParseError, "t", b"{}", "e", None, None)
            .await
            .unwrap();
        dlq.enqueue(DlqCategory::JsonParseError, "t", b"{}", "e", None, None)
            .await
            .unwrap();
        dlq.enqueue(DlqCategory::WriteError, "t", b"{}", "e", None, None)
            .await
            .unwrap();

        let stats = dlq.stats().await.unwrap();
        assert_eq!(stats.total_entries, 3);
        assert_eq!(stats.by_category.get("json_parse_error"), Some(&2));
        assert_eq!(stats.by_category.get("write_error"), Some(&1));
        assert_eq!(stats.total_enqueued, 3);
    }

    #[tokio::test]
    async fn clear_removes_everything() {
        let dir = tempdir().unwrap();
        let dlq = DeadLetterQueue::open(&test_config(dir.path())).await.unwrap();
        dlq.enqueue(DlqCategory::UnknownError, "t", b"{}", "e", None, None)
            .await
            .unwrap();

        assert_eq!(dlq.clear().await.unwrap(), 1);
        assert_eq!(dlq.stats().await.unwrap().total_entries, 0);
    }
}
