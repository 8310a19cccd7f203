//! Raw payload archive: append-only JSONL files with rotation, compression,
//! and retention sweeps.
//!
//! The archive is the first durability tier: every accepted payload lands
//! here before any processing, so a crashed pipeline can always be replayed
//! from disk.

use std::fs::{self, File, OpenOptions};
use std::future::Future;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::config::{ArchiveConfig, Rotation};

/// One JSONL record in an archive file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveRecord {
    pub id: String,
    pub topic: String,
    pub ts: DateTime<Utc>,
    pub payload: Value,
}

/// Archive statistics for health and stats endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveStats {
    pub jsonl_files: u64,
    pub compressed_files: u64,
    pub total_size_bytes: u64,
    pub write_count: u64,
    pub archive_dir: String,
}

struct ArchiveInner {
    dir: PathBuf,
    rotation: Rotation,
    max_age_days: u32,
    compress_after_days: u32,
    fsync: bool,
    write_lock: Mutex<()>,
    write_count: AtomicU64,
}

/// Persists raw payloads to JSONL files before processing.
#[derive(Clone)]
pub struct ArchiveStore {
    inner: Arc<ArchiveInner>,
}

impl ArchiveStore {
    /// Open the archive directory, creating it if missing. Fails if the path
    /// exists and is not a directory.
    pub fn open(config: &ArchiveConfig) -> Result<Self> {
        if config.dir.exists() && !config.dir.is_dir() {
            bail!("archive dir is not a directory: {}", config.dir.display());
        }
        fs::create_dir_all(&config.dir)
            .with_context(|| format!("failed to create archive dir {}", config.dir.display()))?;

        Ok(Self {
            inner: Arc::new(ArchiveInner {
                dir: config.dir.clone(),
                rotation: config.rotation,
                max_age_days: config.max_age_days,
                compress_after_days: config.compress_after_days,
                fsync: config.fsync,
                write_lock: Mutex::new(()),
                write_count: AtomicU64::new(0),
            }),
        })
    }

    /// Append a payload to the archive file selected by the rotation key.
    /// Returns the 16-hex archive id used for downstream correlation.
    pub async fn store(
        &self,
        topic: &str,
        payload: &[u8],
        received_at: DateTime<Utc>,
    ) -> Result<String> {
        let inner = Arc::clone(&self.inner);
        let topic = topic.to_string();
        let payload = payload.to_vec();
        tokio::task::spawn_blocking(move || inner.store_sync(&topic, &payload, received_at))
            .await
            .context("archive store task failed")?
    }

    /// Synchronous variant of [`store`](Self::store); used directly by tests
    /// and callers already on a blocking thread.
    pub fn store_sync(
        &self,
        topic: &str,
        payload: &[u8],
        received_at: DateTime<Utc>,
    ) -> Result<String> {
        self.inner.store_sync(topic, payload, received_at)
    }

    /// Replay records whose rotation key falls in the inclusive date range,
    /// in on-disk order. The callback receives `(topic, payload, archive_id)`;
    /// callback errors are logged and do not abort the replay. Returns the
    /// number of records successfully replayed.
    pub async fn replay<F, Fut>(
        &self,
        start_date: NaiveDate,
        end_date: NaiveDate,
        mut callback: F,
    ) -> Result<u64>
    where
        F: FnMut(String, Value, String) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut count = 0u64;
        let mut current = start_date;

        while current <= end_date {
            for record in self.read_day(current).await? {
                match callback(record.topic, record.payload, record.id.clone()).await {
                    Ok(()) => count += 1,
                    Err(e) => {
                        error!(archive_id = %record.id, error = %e, "replay callback error");
                    }
                }
            }
            current += Duration::days(1);
        }

        info!(count, "archive replay complete");
        Ok(count)
    }

    async fn read_day(&self, day: NaiveDate) -> Result<Vec<ArchiveRecord>> {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || inner.read_day(day))
            .await
            .context("archive read task failed")?
    }

    /// Compress `*.jsonl` files older than `compress_after_days`. Per-file
    /// failures are logged and skipped. Returns the number compressed.
    pub async fn compress_old_files(&self) -> Result<u64> {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || inner.compress_old_files())
            .await
            .context("archive compress task failed")?
    }

    /// Delete archive files (either form) older than `max_age_days`.
    pub async fn cleanup_old_files(&self) -> Result<u64> {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || inner.cleanup_old_files())
            .await
            .context("archive cleanup task failed")?
    }

    pub async fn stats(&self) -> Result<ArchiveStats> {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || inner.stats())
            .await
            .context("archive stats task failed")
    }
}

impl ArchiveInner {
    fn file_path(&self, ts: DateTime<Utc>) -> PathBuf {
        let filename = match self.rotation {
            Rotation::Hourly => ts.format("%Y-%m-%d_%H.jsonl").to_string(),
            Rotation::Daily => ts.format("%Y-%m-%d.jsonl").to_string(),
        };
        self.dir.join(filename)
    }

    fn generate_id() -> String {
        uuid::Uuid::new_v4().simple().to_string()[..16].to_string()
    }

    /// Decode a payload as JSON, falling back to a base64 envelope for
    /// binary or non-JSON bytes.
    fn decode_payload(payload: &[u8]) -> Value {
        match serde_json::from_slice(payload) {
            Ok(value) => value,
            Err(_) => serde_json::json!({ "_binary": base64::encode(payload) }),
        }
    }

    fn store_sync(&self, topic: &str, payload: &[u8], received_at: DateTime<Utc>) -> Result<String> {
        let archive_id = Self::generate_id();
        let file_path = self.file_path(received_at);

        let record = ArchiveRecord {
            id: archive_id.clone(),
            topic: topic.to_string(),
            ts: received_at,
            payload: Self::decode_payload(payload),
        };
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        {
            let _guard = self.write_lock.lock().expect("archive write lock poisoned");
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&file_path)
                .with_context(|| format!("failed to open {}", file_path.display()))?;
            file.write_all(line.as_bytes())
                .with_context(|| format!("failed to append to {}", file_path.display()))?;
            if self.fsync {
                file.sync_all()?;
            }
            self.write_count.fetch_add(1, Ordering::Relaxed);
        }

        debug!(archive_id = %archive_id, topic, "payload archived");
        Ok(archive_id)
    }

    fn read_day(&self, day: NaiveDate) -> Result<Vec<ArchiveRecord>> {
        let base_name = day.format("%Y-%m-%d").to_string();
        let mut records = Vec::new();

        self.read_rotation_unit(&base_name, &mut records)?;

        if self.rotation == Rotation::Hourly {
            for hour in 0..24 {
                let hourly_name = format!("{}_{:02}", base_name, hour);
                self.read_rotation_unit(&hourly_name, &mut records)?;
            }
        }

        Ok(records)
    }

    /// Read one rotation unit, preferring the uncompressed file.
    fn read_rotation_unit(&self, name: &str, out: &mut Vec<ArchiveRecord>) -> Result<()> {
        let jsonl = self.dir.join(format!("{}.jsonl", name));
        let gz = self.dir.join(format!("{}.jsonl.gz", name));

        if jsonl.exists() {
            self.read_jsonl(&jsonl, File::open(&jsonl)?, out);
        } else if gz.exists() {
            self.read_jsonl(&gz, GzDecoder::new(File::open(&gz)?), out);
        }
        Ok(())
    }

    fn read_jsonl<R: Read>(&self, path: &Path, reader: R, out: &mut Vec<ArchiveRecord>) {
        let reader = BufReader::new(reader);
        for line in reader.lines() {
            let line = match line {
                Ok(l) => l,
                Err(e) => {
                    error!(path = %path.display(), error = %e, "archive stream error");
                    return;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ArchiveRecord>(&line) {
                Ok(record) => out.push(record),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "archive parse error");
                }
            }
        }
    }

    /// Parse the rotation date out of an archive file name like
    /// `2024-01-15.jsonl`, `2024-01-15_08.jsonl`, or their `.gz` forms.
    fn file_date(path: &Path) -> Option<NaiveDate> {
        let name = path.file_name()?.to_str()?;
        let stem = name.split('.').next()?;
        let date_part = stem.split('_').next()?;
        NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()
    }

    fn list_files(&self, suffix: &str) -> Vec<PathBuf> {
        let mut files = Vec::new();
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                error!(dir = %self.dir.display(), error = %e, "failed to list archive dir");
                return files;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(suffix))
            {
                files.push(path);
            }
        }
        files.sort();
        files
    }

    fn compress_old_files(&self) -> Result<u64> {
        let cutoff = Utc::now().date_naive() - Duration::days(self.compress_after_days as i64);
        let mut compressed = 0u64;

        for path in self.list_files(".jsonl") {
            let Some(file_date) = Self::file_date(&path) else {
                continue;
            };
            if file_date >= cutoff {
                continue;
            }

            let gz_path = path.with_extension("jsonl.gz");
            let result = (|| -> Result<()> {
                let mut input = File::open(&path)?;
                let mut encoder = GzEncoder::new(File::create(&gz_path)?, Compression::default());
                std::io::copy(&mut input, &mut encoder)?;
                encoder.finish()?;
                fs::remove_file(&path)?;
                Ok(())
            })();

            match result {
                Ok(()) => {
                    compressed += 1;
                    info!(path = %path.display(), "archive compressed");
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "compress failed");
                }
            }
        }

        Ok(compressed)
    }

    fn cleanup_old_files(&self) -> Result<u64> {
        let cutoff = Utc::now().date_naive() - Duration::days(self.max_age_days as i64);
        let mut deleted = 0u64;

        for suffix in [".jsonl", ".jsonl.gz"] {
            for path in self.list_files(suffix) {
                let Some(file_date) = Self::file_date(&path) else {
                    continue;
                };
                if file_date >= cutoff {
                    continue;
                }
                match fs::remove_file(&path) {
                    Ok(()) => {
                        deleted += 1;
                        info!(path = %path.display(), "archive deleted");
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "cleanup failed");
                    }
                }
            }
        }

        Ok(deleted)
    }

    fn stats(&self) -> ArchiveStats {
        let mut jsonl_files = 0u64;
        let mut compressed_files = 0u64;
        let mut total_size = 0u64;

        for path in self.list_files(".jsonl") {
            jsonl_files += 1;
            total_size += path.metadata().map(|m| m.len()).unwrap_or(0);
        }
        for path in self.list_files(".jsonl.gz") {
            compressed_files += 1;
            total_size += path.metadata().map(|m| m.len()).unwrap_or(0);
        }

        ArchiveStats {
            jsonl_files,
            compressed_files,
            total_size_bytes: total_size,
            write_count: self.write_count.load(Ordering::Relaxed),
            archive_dir: self.dir.display().to_string(),
        }
    }
}
