//! Batched, retrying, circuit-broken writer for the measurements database.
//!
//! Points are buffered in memory and shipped as line-protocol batches. A
//! point either reaches the remote at least once, is counted in
//! `dropped_points`, or is still in the buffer; there is no silent loss.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::breaker::{BreakerStats, CircuitBreaker};
use crate::config::TsdbConfig;
use crate::point::Point;

/// Hard ceiling on buffered points to bound memory under persistent failure.
pub const MAX_BUFFER_SIZE: usize = 10_000;

const BREAKER_FAILURE_THRESHOLD: u32 = 5;
const BREAKER_RECOVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Classified write failures. Auth and non-retryable errors drop the batch;
/// retryable errors go through bounded backoff.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("authentication rejected by measurements DB: {0}")]
    Auth(String),
    #[error("non-retryable write failure: {0}")]
    NonRetryable(String),
    #[error("retryable write failure: {0}")]
    Retryable(String),
}

/// Seam over the remote measurements DB.
#[async_trait]
pub trait TsClient: Send + Sync {
    /// Liveness probe; never errors, just reports reachability.
    async fn ping(&self) -> bool;
    /// Ship one line-protocol batch.
    async fn write_lines(&self, lines: &str) -> Result<(), WriteError>;
}

/// InfluxDB-v2-compatible client over HTTP.
pub struct HttpTsClient {
    client: reqwest::Client,
    url: String,
    token: String,
    org: String,
    bucket: String,
}

impl HttpTsClient {
    pub fn new(config: &TsdbConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: config.url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            org: config.org.clone(),
            bucket: config.bucket.clone(),
        }
    }
}

#[async_trait]
impl TsClient for HttpTsClient {
    async fn ping(&self) -> bool {
        let url = format!("{}/ping", self.url);
        match self.client.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    async fn write_lines(&self, lines: &str) -> Result<(), WriteError> {
        let url = format!("{}/api/v2/write", self.url);
        let response = self
            .client
            .post(&url)
            .query(&[
                ("org", self.org.as_str()),
                ("bucket", self.bucket.as_str()),
                ("precision", "ns"),
            ])
            .header("Authorization", format!("Token {}", self.token))
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(lines.to_string())
            .send()
            .await
            .map_err(|e| WriteError::Retryable(format!("request failed: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        match status.as_u16() {
            401 | 403 => Err(WriteError::Auth(format!("status {}: {}", status, body))),
            400 | 422 => Err(WriteError::NonRetryable(format!("status {}: {}", status, body))),
            _ => Err(WriteError::Retryable(format!("status {}: {}", status, body))),
        }
    }
}

/// Writer health snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct WriterHealth {
    pub healthy: bool,
    pub connected: bool,
    pub buffer_size: usize,
    pub max_buffer_size: usize,
    pub written_points: u64,
    pub dropped_points: u64,
    pub breaker: BreakerStats,
}

/// Buffering writer in front of a [`TsClient`].
pub struct TsWriter {
    client: Arc<dyn TsClient>,
    batch_size: usize,
    max_retries: u32,
    retry_delay: Duration,
    max_buffer_size: usize,
    buffer: Mutex<Vec<Point>>,
    connected: AtomicBool,
    written_points: AtomicU64,
    dropped_points: AtomicU64,
    breaker: CircuitBreaker,
}

impl TsWriter {
    pub fn new(config: &TsdbConfig, client: Arc<dyn TsClient>) -> Self {
        Self {
            client,
            batch_size: config.batch_size,
            max_retries: config.max_retries.max(1),
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            max_buffer_size: MAX_BUFFER_SIZE,
            buffer: Mutex::new(Vec::new()),
            connected: AtomicBool::new(false),
            written_points: AtomicU64::new(0),
            dropped_points: AtomicU64::new(0),
            breaker: CircuitBreaker::new(
                "tsdb_writer",
                BREAKER_FAILURE_THRESHOLD,
                BREAKER_RECOVERY_TIMEOUT,
            ),
        }
    }

    #[cfg(test)]
    fn with_max_buffer_size(mut self, size: usize) -> Self {
        self.max_buffer_size = size;
        self
    }

    /// Probe the remote. Connection failure is reported but not fatal; the
    /// breaker and retry machinery cover later recovery.
    pub async fn connect(&self) -> Result<(), WriteError> {
        if self.client.ping().await {
            self.connected.store(true, Ordering::Relaxed);
            info!("measurements DB connected");
            Ok(())
        } else {
            self.connected.store(false, Ordering::Relaxed);
            Err(WriteError::Retryable("measurements DB is not ready".to_string()))
        }
    }

    /// Buffer points for writing. Fails fast when the circuit breaker is
    /// open, so callers can release dedup reservations and dead-letter the
    /// unit of work instead of silently queueing into an outage.
    pub async fn write(&self, points: Vec<Point>) -> Result<(), WriteError> {
        if points.is_empty() {
            return Ok(());
        }
        if self.breaker.is_open() {
            return Err(WriteError::Retryable("circuit breaker open".to_string()));
        }

        let buffer_size = {
            let mut buffer = self.buffer.lock().expect("writer buffer lock poisoned");
            buffer.extend(points);
            buffer.len()
        };
        debug!(buffer_size, "points buffered");

        if buffer_size >= self.batch_size {
            // Flush outcome is absorbed here: failed batches are requeued or
            // counted as dropped, never surfaced to the ingest worker.
            let _ = self.flush().await;
        }
        Ok(())
    }

    /// Swap out the buffer and attempt to ship it.
    pub async fn flush(&self) -> Result<(), WriteError> {
        let batch = {
            let mut buffer = self.buffer.lock().expect("writer buffer lock poisoned");
            if buffer.is_empty() {
                return Ok(());
            }
            std::mem::take(&mut *buffer)
        };
        self.flush_batch(batch).await
    }

    async fn flush_batch(&self, batch: Vec<Point>) -> Result<(), WriteError> {
        let lines = batch
            .iter()
            .map(Point::to_line_protocol)
            .collect::<Vec<_>>()
            .join("\n");

        let mut last_error = WriteError::Retryable("no attempt made".to_string());
        for attempt in 1..=self.max_retries {
            if self.breaker.is_open() {
                warn!(attempt, "flush skipped, circuit breaker open");
                last_error = WriteError::Retryable("circuit breaker open".to_string());
            } else {
                match self.client.write_lines(&lines).await {
                    Ok(()) => {
                        self.breaker.record_success();
                        self.written_points.fetch_add(batch.len() as u64, Ordering::Relaxed);
                        info!(count = batch.len(), "points written");
                        return Ok(());
                    }
                    Err(e @ WriteError::Auth(_)) | Err(e @ WriteError::NonRetryable(_)) => {
                        // Permanent failure: drop the batch, do not requeue.
                        self.breaker.record_failure();
                        self.dropped_points.fetch_add(batch.len() as u64, Ordering::Relaxed);
                        error!(count = batch.len(), error = %e, "write failed permanently, batch dropped");
                        return Err(e);
                    }
                    Err(e) => {
                        self.breaker.record_failure();
                        warn!(attempt, max_retries = self.max_retries, error = %e, "write failed");
                        last_error = e;
                    }
                }
            }
            if attempt < self.max_retries {
                tokio::time::sleep(self.retry_delay * attempt).await;
            }
        }

        self.requeue(batch);
        Err(last_error)
    }

    /// Prepend a failed batch back into the buffer, dropping the oldest
    /// points when the cap would be exceeded.
    fn requeue(&self, batch: Vec<Point>) {
        let requeued = batch.len();
        let mut buffer = self.buffer.lock().expect("writer buffer lock poisoned");
        let mut combined = batch;
        combined.append(&mut buffer);

        if combined.len() > self.max_buffer_size {
            let overflow = combined.len() - self.max_buffer_size;
            self.dropped_points.fetch_add(overflow as u64, Ordering::Relaxed);
            combined.drain(..overflow);
            error!(
                dropped = overflow,
                buffer_size = self.max_buffer_size,
                total_dropped = self.dropped_points.load(Ordering::Relaxed),
                "buffer overflow"
            );
        }

        *buffer = combined;
        warn!(count = requeued, buffer_size = buffer.len(), "points requeued");
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer.lock().expect("writer buffer lock poisoned").len()
    }

    pub fn written_points(&self) -> u64 {
        self.written_points.load(Ordering::Relaxed)
    }

    pub fn dropped_points(&self) -> u64 {
        self.dropped_points.load(Ordering::Relaxed)
    }

    pub fn breaker_stats(&self) -> BreakerStats {
        self.breaker.stats()
    }

    /// Full health check including a liveness ping.
    pub async fn health_check(&self) -> WriterHealth {
        let healthy = self.client.ping().await;
        WriterHealth {
            healthy,
            connected: self.connected.load(Ordering::Relaxed),
            buffer_size: self.buffer_size(),
            max_buffer_size: self.max_buffer_size,
            written_points: self.written_points(),
            dropped_points: self.dropped_points(),
            breaker: self.breaker.stats(),
        }
    }
}
