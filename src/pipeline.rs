//! Pipeline orchestrator: bounded ingest queue, worker pool, and the named
//! background tasks (checkpoints, cleanups, sweeps, periodic flush).
//!
//! Worker flow per event: transform -> reserve -> write -> commit, with
//! failures classified into DLQ categories and reservations released on
//! write failure.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::archive::ArchiveStore;
use crate::config::Config;
use crate::dedup::DedupCache;
use crate::dlq::{DeadLetterQueue, DlqCategory};
use crate::transform::TransformerRegistry;
use crate::writer::TsWriter;

const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// Unit of work flowing through the ingest queue. Owned exclusively by the
/// queue and consumed by exactly one worker.
#[derive(Debug)]
pub struct IngestionEvent {
    pub topic: String,
    pub payload: Value,
    pub raw: Vec<u8>,
    pub archive_id: Option<String>,
    pub enqueued_at: DateTime<Utc>,
}

impl IngestionEvent {
    pub fn new(topic: &str, payload: Value, raw: Vec<u8>, archive_id: Option<String>) -> Self {
        Self {
            topic: topic.to_string(),
            payload,
            raw,
            archive_id,
            enqueued_at: Utc::now(),
        }
    }
}

#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error("ingest queue is full")]
    Full,
    #[error("pipeline is not running")]
    NotReady,
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    empty_payloads: AtomicU64,
    duplicates_skipped: AtomicU64,
    transform_failures: AtomicU64,
    write_failures: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub processed: u64,
    pub empty_payloads: u64,
    pub duplicates_skipped: u64,
    pub transform_failures: u64,
    pub write_failures: u64,
    pub queue_size: usize,
    pub queue_capacity: usize,
}

/// Cloneable handle for producers (the HTTP ingest handler) and for
/// observability endpoints.
#[derive(Clone)]
pub struct PipelineHandle {
    tx: mpsc::Sender<IngestionEvent>,
    counters: Arc<Counters>,
}

impl PipelineHandle {
    pub fn try_enqueue(&self, event: IngestionEvent) -> Result<(), EnqueueError> {
        self.tx.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => EnqueueError::Full,
            mpsc::error::TrySendError::Closed(_) => EnqueueError::NotReady,
        })
    }

    pub fn is_ready(&self) -> bool {
        !self.tx.is_closed()
    }

    pub fn queue_size(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn queue_capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            processed: self.counters.processed.load(Ordering::Relaxed),
            empty_payloads: self.counters.empty_payloads.load(Ordering::Relaxed),
            duplicates_skipped: self.counters.duplicates_skipped.load(Ordering::Relaxed),
            transform_failures: self.counters.transform_failures.load(Ordering::Relaxed),
            write_failures: self.counters.write_failures.load(Ordering::Relaxed),
            queue_size: self.queue_size(),
            queue_capacity: self.queue_capacity(),
        }
    }
}

#[derive(Clone)]
struct WorkerContext {
    registry: Arc<TransformerRegistry>,
    dedup: Option<Arc<DedupCache>>,
    dlq: Option<Arc<DeadLetterQueue>>,
    writer: Arc<TsWriter>,
    counters: Arc<Counters>,
}

/// The running pipeline: worker pool plus background tasks, with a graceful
/// shutdown path that drains in-flight work under a deadline.
pub struct Pipeline {
    handle: PipelineHandle,
    tx: mpsc::Sender<IngestionEvent>,
    shutdown_tx: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
    background: Vec<JoinHandle<()>>,
    writer: Arc<TsWriter>,
    dedup: Option<Arc<DedupCache>>,
    shutdown_deadline: Duration,
}

impl Pipeline {
    pub fn start(
        config: &Config,
        registry: Arc<TransformerRegistry>,
        dedup: Option<Arc<DedupCache>>,
        dlq: Option<Arc<DeadLetterQueue>>,
        writer: Arc<TsWriter>,
        archive: Option<ArchiveStore>,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<IngestionEvent>(config.app.queue_capacity);
        let (shutdown_tx, _) = watch::channel(false);
        let counters = Arc::new(Counters::default());

        let ctx = WorkerContext {
            registry,
            dedup: dedup.clone(),
            dlq,
            writer: Arc::clone(&writer),
            counters: Arc::clone(&counters),
        };

        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let mut workers = Vec::with_capacity(config.app.workers);
        for worker_id in 0..config.app.workers {
            workers.push(spawn_worker(
                worker_id,
                Arc::clone(&rx),
                ctx.clone(),
                shutdown_tx.subscribe(),
            ));
        }

        let mut background = Vec::new();

        {
            let writer = Arc::clone(&writer);
            background.push(spawn_periodic(
                "writer_flush",
                Duration::from_millis(config.tsdb.flush_interval_ms),
                shutdown_tx.subscribe(),
                move || {
                    let writer = Arc::clone(&writer);
                    async move {
                        if let Err(e) = writer.flush().await {
                            debug!(error = %e, "periodic flush incomplete");
                        }
                    }
                },
            ));
        }

        if let Some(dedup) = dedup.clone() {
            if config.dedup.persist_enabled {
                let checkpoint_dedup = Arc::clone(&dedup);
                background.push(spawn_periodic(
                    "dedup_checkpoint",
                    Duration::from_secs(config.dedup.checkpoint_interval_sec.max(1)),
                    shutdown_tx.subscribe(),
                    move || {
                        let dedup = Arc::clone(&checkpoint_dedup);
                        async move {
                            if let Err(e) = dedup.checkpoint().await {
                                error!(error = %e, "dedup checkpoint failed");
                            }
                        }
                    },
                ));
            }

            background.push(spawn_periodic(
                "dedup_cleanup",
                SWEEP_INTERVAL,
                shutdown_tx.subscribe(),
                move || {
                    let dedup = Arc::clone(&dedup);
                    async move {
                        dedup.cleanup_expired();
                    }
                },
            ));
        }

        if let Some(archive) = archive {
            let compress_archive = archive.clone();
            background.push(spawn_periodic(
                "archive_compress",
                SWEEP_INTERVAL,
                shutdown_tx.subscribe(),
                move || {
                    let archive = compress_archive.clone();
                    async move {
                        if let Err(e) = archive.compress_old_files().await {
                            error!(error = %e, "archive compression sweep failed");
                        }
                    }
                },
            ));
            background.push(spawn_periodic(
                "archive_retention",
                SWEEP_INTERVAL,
                shutdown_tx.subscribe(),
                move || {
                    let archive = archive.clone();
                    async move {
                        if let Err(e) = archive.cleanup_old_files().await {
                            error!(error = %e, "archive retention sweep failed");
                        }
                    }
                },
            ));
        }

        info!(
            workers = config.app.workers,
            queue_capacity = config.app.queue_capacity,
            "pipeline started"
        );

        Self {
            handle: PipelineHandle {
                tx: tx.clone(),
                counters,
            },
            tx,
            shutdown_tx,
            workers,
            background,
            writer,
            dedup,
            shutdown_deadline: Duration::from_secs(config.app.shutdown_deadline_secs),
        }
    }

    pub fn handle(&self) -> PipelineHandle {
        self.handle.clone()
    }

    /// Graceful shutdown: stop intake, drain workers under the deadline,
    /// then run the final writer flush and dedup checkpoint.
    pub async fn shutdown(self) {
        info!("pipeline shutting down");
        let _ = self.shutdown_tx.send(true);
        drop(self.tx);
        drop(self.handle);

        let deadline = tokio::time::Instant::now() + self.shutdown_deadline;
        for handle in self.workers {
            let abort = handle.abort_handle();
            if tokio::time::timeout_at(deadline, handle).await.is_err() {
                warn!("worker did not drain before deadline, aborting");
                abort.abort();
            }
        }
        for handle in self.background {
            let abort = handle.abort_handle();
            if tokio::time::timeout_at(deadline, handle).await.is_err() {
                abort.abort();
            }
        }

        if let Err(e) = self.writer.flush().await {
            warn!(error = %e, "final flush incomplete");
        }
        if let Some(dedup) = &self.dedup {
            if let Err(e) = dedup.checkpoint().await {
                error!(error = %e, "final dedup checkpoint failed");
            }
        }
        info!("pipeline stopped");
    }
}

fn spawn_worker(
    worker_id: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<IngestionEvent>>>,
    ctx: WorkerContext,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = {
                let mut guard = rx.lock().await;
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => None,
                    event = guard.recv() => event,
                }
            };
            match event {
                Some(event) => process_event(&ctx, event).await,
                None => break,
            }
        }

        // Drain whatever is already queued before exiting.
        loop {
            let next = rx.lock().await.try_recv();
            match next {
                Ok(event) => process_event(&ctx, event).await,
                Err(_) => break,
            }
        }
        debug!(worker_id, "worker exited");
    })
}

async fn process_event(ctx: &WorkerContext, event: IngestionEvent) {
    let points = match ctx.registry.transform(&event.payload) {
        Ok(points) => points,
        Err(e) => {
            ctx.counters.transform_failures.fetch_add(1, Ordering::Relaxed);
            warn!(topic = %event.topic, error = %e, "transform failed");
            dead_letter(ctx, &event, DlqCategory::TransformError, &e.to_string()).await;
            return;
        }
    };

    if points.is_empty() {
        ctx.counters.empty_payloads.fetch_add(1, Ordering::Relaxed);
        ctx.counters.processed.fetch_add(1, Ordering::Relaxed);
        debug!(topic = %event.topic, "no points generated");
        return;
    }

    let total = points.len();
    let (to_write, reservation_keys) = match &ctx.dedup {
        Some(dedup) => dedup.reserve_batch(points),
        None => (points, Vec::new()),
    };
    let skipped = total - to_write.len();
    if skipped > 0 {
        ctx.counters.duplicates_skipped.fetch_add(skipped as u64, Ordering::Relaxed);
    }

    if to_write.is_empty() {
        ctx.counters.processed.fetch_add(1, Ordering::Relaxed);
        debug!(topic = %event.topic, skipped, "all points were duplicates");
        return;
    }

    match ctx.writer.write(to_write).await {
        Ok(()) => {
            if let Some(dedup) = &ctx.dedup {
                dedup.commit_batch(&reservation_keys);
            }
            ctx.counters.processed.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            if let Some(dedup) = &ctx.dedup {
                dedup.release_batch(&reservation_keys);
            }
            ctx.counters.write_failures.fetch_add(1, Ordering::Relaxed);
            warn!(topic = %event.topic, error = %e, "write failed");
            dead_letter(ctx, &event, DlqCategory::WriteError, &e.to_string()).await;
        }
    }
}

async fn dead_letter(ctx: &WorkerContext, event: &IngestionEvent, category: DlqCategory, error: &str) {
    let Some(dlq) = &ctx.dlq else {
        return;
    };
    if let Err(e) = dlq
        .enqueue(
            category,
            &event.topic,
            &event.raw,
            error,
            None,
            event.archive_id.as_deref(),
        )
        .await
    {
        error!(error = %e, "failed to enqueue DLQ entry");
    }
}

fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
    task: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so the task runs on its
        // interval rather than at startup.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = interval.tick() => task().await,
            }
        }
        debug!(task = name, "background task stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, DedupConfig, DlqConfig};
    use crate::writer::{TsClient, WriteError};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex;
    use tempfile::tempdir;

    struct RecordingClient {
        fail: AtomicBool,
        batches: Mutex<Vec<String>>,
    }

    impl RecordingClient {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                fail: AtomicBool::new(false),
                batches: Mutex::new(Vec::new()),
            })
        }

        fn lines(&self) -> Vec<String> {
            self.batches
                .lock()
                .unwrap()
                .iter()
                .flat_map(|b| b.lines().map(|l| l.to_string()).collect::<Vec<_>>())
                .collect()
        }
    }

    #[async_trait]
    impl TsClient for RecordingClient {
        async fn ping(&self) -> bool {
            true
        }

        async fn write_lines(&self, lines: &str) -> Result<(), WriteError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(WriteError::Retryable("down".to_string()));
            }
            self.batches.lock().unwrap().push(lines.to_string());
            Ok(())
        }
    }

    fn test_config(dir: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.app.workers = 2;
        config.app.queue_capacity = 16;
        config.app.shutdown_deadline_secs = 5;
        // Small batches so every event flushes immediately.
        config.tsdb.batch_size = 1;
        config.tsdb.retry_delay_ms = 1;
        config.dedup = DedupConfig {
            enabled: true,
            max_size: 1000,
            ttl_hours: 24,
            persist_enabled: false,
            persist_path: dir.join("dedup.db"),
            checkpoint_interval_sec: 300,
        };
        config.dlq = DlqConfig {
            enabled: true,
            db_path: dir.join("dlq.db"),
            max_entries: 100,
            retention_days: 30,
            max_retries: 3,
        };
        config
    }

    async fn build_pipeline(
        config: &Config,
        client: Arc<RecordingClient>,
    ) -> (Pipeline, Arc<DeadLetterQueue>, Arc<TsWriter>) {
        let registry = Arc::new(TransformerRegistry::new("health_auto_export"));
        let dedup = Arc::new(DedupCache::new(&config.dedup));
        let dlq = Arc::new(DeadLetterQueue::open(&config.dlq).await.unwrap());
        let writer = Arc::new(TsWriter::new(&config.tsdb, client as Arc<dyn TsClient>));
        let pipeline = Pipeline::start(
            config,
            registry,
            Some(dedup),
            Some(Arc::clone(&dlq)),
            Arc::clone(&writer),
            None,
        );
        (pipeline, dlq, writer)
    }

    fn heart_event() -> IngestionEvent {
        let payload = json!({
            "data": [
                {"name": "heart_rate", "date": "2024-01-15T10:00:00+00:00", "qty": 72, "source": "Apple Watch"}
            ]
        });
        IngestionEvent::new(
            "http/ingest",
            payload.clone(),
            serde_json::to_vec(&payload).unwrap(),
            Some("abcdef0123456789".to_string()),
        )
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn happy_path_writes_point_and_counts_processed() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let client = RecordingClient::new();
        let (pipeline, _dlq, writer) = build_pipeline(&config, client.clone()).await;
        let handle = pipeline.handle();

        handle.try_enqueue(heart_event()).unwrap();
        wait_until(|| handle.stats().processed == 1).await;

        let lines = client.lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("heart,source=Apple_Watch "));
        assert_eq!(writer.written_points(), 1);

        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn identical_payload_produces_no_new_points() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let client = RecordingClient::new();
        let (pipeline, _dlq, writer) = build_pipeline(&config, client.clone()).await;
        let handle = pipeline.handle();

        handle.try_enqueue(heart_event()).unwrap();
        wait_until(|| handle.stats().processed == 1).await;
        handle.try_enqueue(heart_event()).unwrap();
        wait_until(|| handle.stats().processed == 2).await;

        assert_eq!(writer.written_points(), 1);
        assert_eq!(handle.stats().duplicates_skipped, 1);

        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn unsupported_payload_is_dead_lettered_as_transform_error() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let client = RecordingClient::new();
        let (pipeline, dlq, _writer) = build_pipeline(&config, client).await;
        let handle = pipeline.handle();

        let payload = json!("just a string");
        handle
            .try_enqueue(IngestionEvent::new(
                "http/ingest",
                payload.clone(),
                serde_json::to_vec(&payload).unwrap(),
                Some("1111111111111111".to_string()),
            ))
            .unwrap();

        wait_until(|| handle.stats().transform_failures == 1).await;

        let entries = dlq.get_entries(Some(DlqCategory::TransformError), 10, 0).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].archive_id.as_deref(), Some("1111111111111111"));

        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn write_failure_releases_reservations_and_dead_letters() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let client = RecordingClient::new();
        client.fail.store(true, Ordering::SeqCst);
        let (pipeline, dlq, writer) = build_pipeline(&config, client.clone()).await;
        let handle = pipeline.handle();

        // Each failing event burns three attempts; two distinct events trip
        // the breaker (threshold 5), after which the synchronous write_error
        // path kicks in for the third.
        let event = |bpm: u32| {
            let payload = json!({
                "data": [
                    {"name": "heart_rate", "date": "2024-01-15T10:00:00+00:00", "qty": bpm}
                ]
            });
            IngestionEvent::new(
                "http/ingest",
                payload.clone(),
                serde_json::to_vec(&payload).unwrap(),
                None,
            )
        };

        handle.try_enqueue(event(70)).unwrap();
        wait_until(|| writer.breaker_stats().failure_count >= 3).await;
        handle.try_enqueue(event(80)).unwrap();
        wait_until(|| {
            writer.breaker_stats().state == crate::breaker::CircuitState::Open
        })
        .await;
        handle.try_enqueue(event(90)).unwrap();
        wait_until(|| handle.stats().write_failures >= 1).await;

        let entries = dlq.get_entries(Some(DlqCategory::WriteError), 10, 0).await.unwrap();
        assert!(!entries.is_empty());

        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn empty_payload_is_processed_without_error() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let client = RecordingClient::new();
        let (pipeline, dlq, _writer) = build_pipeline(&config, client).await;
        let handle = pipeline.handle();

        // Valid JSON object with nothing interpretable.
        let payload = json!({"data": []});
        handle
            .try_enqueue(IngestionEvent::new(
                "http/ingest",
                payload.clone(),
                serde_json::to_vec(&payload).unwrap(),
                None,
            ))
            .unwrap();

        wait_until(|| handle.stats().processed == 1).await;
        assert_eq!(handle.stats().empty_payloads, 1);
        assert_eq!(dlq.stats().await.unwrap().total_entries, 0);

        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn full_queue_rejects_enqueue() {
        let dir = tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.app.workers = 1;
        config.app.queue_capacity = 1;

        // A pipeline with a blocked worker: fill the queue while the single
        // worker is busy with the first event.
        let client = RecordingClient::new();
        let (pipeline, _dlq, _writer) = build_pipeline(&config, client).await;
        let handle = pipeline.handle();

        let mut saw_full = false;
        for _ in 0..50 {
            if matches!(handle.try_enqueue(heart_event()), Err(EnqueueError::Full)) {
                saw_full = true;
                break;
            }
        }
        assert!(saw_full);

        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_drains_queued_events() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let client = RecordingClient::new();
        let (pipeline, _dlq, writer) = build_pipeline(&config, client).await;
        let handle = pipeline.handle();

        for _ in 0..5 {
            handle.try_enqueue(heart_event()).unwrap();
        }
        pipeline.shutdown().await;

        // One unique point written; the rest were duplicates, but every
        // event was consumed before shutdown completed.
        assert_eq!(handle.stats().processed, 5);
        assert_eq!(writer.written_points(), 1);
    }
}
