//! Content-hash deduplication cache with reservation semantics.
//!
//! Guarantees at-most-once processing of a point within the TTL window, even
//! across restarts (via SQLite persistence) and across concurrent workers
//! (via short-lived reservations).

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use lru::LruCache;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use crate::config::DedupConfig;
use crate::point::Point;

/// Reservation TTL is kept well below the committed TTL so a dead worker
/// cannot block a fingerprint for long.
const RESERVATION_TTL_MIN_SECS: f64 = 60.0;
const RESERVATION_TTL_MAX_SECS: f64 = 300.0;

#[derive(Debug, Clone, Serialize)]
pub struct DedupStats {
    pub size: usize,
    pub max_size: usize,
    pub pending_size: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate_pct: f64,
    pub evictions: u64,
    pub ttl_hours: f64,
    pub persist_enabled: bool,
}

struct DedupInner {
    /// Committed fingerprints: key -> last-seen epoch seconds, LRU-ordered.
    committed: LruCache<String, f64>,
    /// In-flight reservations: key -> reservation epoch seconds.
    pending: HashMap<String, f64>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

/// Prevents duplicate time-series writes using content-based hashing.
pub struct DedupCache {
    inner: Mutex<DedupInner>,
    max_size: usize,
    ttl_seconds: f64,
    reservation_ttl_seconds: f64,
    persist_path: Option<PathBuf>,
}

fn now_epoch() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

impl DedupCache {
    pub fn new(config: &DedupConfig) -> Self {
        let ttl_seconds = config.ttl_hours as f64 * 3600.0;
        Self {
            inner: Mutex::new(DedupInner {
                committed: LruCache::new(
                    NonZeroUsize::new(config.max_size.max(1)).expect("max_size is non-zero"),
                ),
                pending: HashMap::new(),
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
            max_size: config.max_size,
            ttl_seconds,
            reservation_ttl_seconds: ttl_seconds
                .clamp(RESERVATION_TTL_MIN_SECS, RESERVATION_TTL_MAX_SECS),
            persist_path: config
                .persist_enabled
                .then(|| config.persist_path.clone()),
        }
    }

    #[cfg(test)]
    fn with_reservation_ttl(mut self, secs: f64) -> Self {
        self.reservation_ttl_seconds = secs;
        self
    }

    /// Atomically reserve the non-duplicate points of a batch for processing.
    ///
    /// A point is skipped when its fingerprint is already committed (and
    /// unexpired), already reserved by another worker, or repeated earlier in
    /// the same batch. Returns the points to process and their reservation
    /// keys, to be resolved by [`commit_batch`](Self::commit_batch) or
    /// [`release_batch`](Self::release_batch).
    pub fn reserve_batch(&self, points: Vec<Point>) -> (Vec<Point>, Vec<String>) {
        let now = now_epoch();
        let mut selected = Vec::new();
        let mut reservation_keys = Vec::new();
        let mut seen_batch = std::collections::HashSet::new();

        let mut inner = self.inner.lock().expect("dedup lock poisoned");
        self.cleanup_pending_locked(&mut inner, now);

        for point in points {
            let key = point.fingerprint();

            if !seen_batch.insert(key.clone()) {
                inner.hits += 1;
                continue;
            }

            if let Some(&ts) = inner.committed.get(&key) {
                if now - ts < self.ttl_seconds {
                    inner.hits += 1;
                    continue;
                }
                inner.committed.pop(&key);
            }

            if inner.pending.contains_key(&key) {
                inner.hits += 1;
                continue;
            }

            inner.pending.insert(key.clone(), now);
            inner.misses += 1;
            selected.push(point);
            reservation_keys.push(key);
        }

        (selected, reservation_keys)
    }

    /// Promote reservations into the committed cache after a successful write.
    pub fn commit_batch(&self, reservation_keys: &[String]) {
        let now = now_epoch();
        let mut inner = self.inner.lock().expect("dedup lock poisoned");
        for key in reservation_keys {
            inner.pending.remove(key);
            if let Some((evicted, _)) = inner.committed.push(key.clone(), now) {
                if &evicted != key {
                    inner.evictions += 1;
                }
            }
        }
    }

    /// Drop reservations after a failed processing attempt, making the
    /// fingerprints eligible for reservation again.
    pub fn release_batch(&self, reservation_keys: &[String]) {
        if reservation_keys.is_empty() {
            return;
        }
        let mut inner = self.inner.lock().expect("dedup lock poisoned");
        for key in reservation_keys {
            inner.pending.remove(key);
        }
    }

    /// Non-reserving filter: drops points already committed and duplicates
    /// within the input list. Used by replay paths that bypass reservations.
    pub fn filter_duplicates(&self, points: Vec<Point>) -> Vec<Point> {
        let now = now_epoch();
        let mut result = Vec::new();
        let mut seen = std::collections::HashSet::new();

        let mut inner = self.inner.lock().expect("dedup lock poisoned");
        self.cleanup_pending_locked(&mut inner, now);

        for point in points {
            let key = point.fingerprint();
            if seen.contains(&key) {
                continue;
            }

            if let Some(&ts) = inner.committed.get(&key) {
                if now - ts < self.ttl_seconds {
                    inner.hits += 1;
                    continue;
                }
                inner.committed.pop(&key);
            }

            if inner.pending.contains_key(&key) {
                inner.hits += 1;
                continue;
            }

            inner.misses += 1;
            seen.insert(key);
            result.push(point);
        }

        result
    }

    /// Remove entries older than the TTL from both tables.
    pub fn cleanup_expired(&self) -> usize {
        let now = now_epoch();
        let mut inner = self.inner.lock().expect("dedup lock poisoned");

        let expired: Vec<String> = inner
            .committed
            .iter()
            .filter(|(_, &ts)| now - ts >= self.ttl_seconds)
            .map(|(k, _)| k.clone())
            .collect();
        let removed_cache = expired.len();
        for key in expired {
            inner.committed.pop(&key);
        }

        let removed_pending = self.cleanup_pending_locked(&mut inner, now);
        let removed = removed_cache + removed_pending;
        if removed > 0 {
            debug!(removed_cache, removed_pending, "dedup cleanup");
        }
        removed
    }

    /// Snapshot the committed cache into the persistence table,
    /// replacing its previous contents in one transaction.
    pub async fn checkpoint(&self) -> Result<()> {
        let Some(path) = &self.persist_path else {
            return Ok(());
        };

        // Snapshot under lock (map ops only), then write outside it.
        let entries: Vec<(String, f64)> = {
            let inner = self.inner.lock().expect("dedup lock poisoned");
            inner
                .committed
                .iter()
                .map(|(k, &ts)| (k.clone(), ts))
                .collect()
        };

        let pool = open_pool(path, true).await?;
        ensure_schema(&pool).await?;

        let mut tx = pool.begin().await?;
        sqlx::query("DELETE FROM dedup_cache").execute(&mut *tx).await?;
        for (key, ts) in &entries {
            sqlx::query("INSERT INTO dedup_cache (key, timestamp) VALUES (?, ?)")
                .bind(key)
                .bind(ts)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        pool.close().await;

        debug!(entries = entries.len(), "dedup checkpoint complete");
        Ok(())
    }

    /// Load up to `max_size` most-recent, unexpired entries from persistence.
    /// A missing database is treated as an empty cache.
    pub async fn restore(&self) -> Result<usize> {
        let Some(path) = &self.persist_path else {
            return Ok(0);
        };
        if !path.exists() {
            return Ok(0);
        }

        let pool = open_pool(path, false).await?;
        ensure_schema(&pool).await?;
        let rows = sqlx::query(
            "SELECT key, timestamp FROM dedup_cache ORDER BY timestamp DESC LIMIT ?",
        )
        .bind(self.max_size as i64)
        .fetch_all(&pool)
        .await?;
        pool.close().await;

        let now = now_epoch();
        let mut restored = 0;
        let mut inner = self.inner.lock().expect("dedup lock poisoned");
        // Insert oldest-first so LRU order matches recency.
        for row in rows.iter().rev() {
            let key: String = row.get(0);
            let ts: f64 = row.get(1);
            if now - ts < self.ttl_seconds {
                inner.committed.push(key, ts);
                restored += 1;
            }
        }

        info!(entries = restored, "dedup cache restored");
        Ok(restored)
    }

    pub fn stats(&self) -> DedupStats {
        let inner = self.inner.lock().expect("dedup lock poisoned");
        let total = inner.hits + inner.misses;
        let hit_rate = if total > 0 {
            inner.hits as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        DedupStats {
            size: inner.committed.len(),
            max_size: self.max_size,
            pending_size: inner.pending.len(),
            hits: inner.hits,
            misses: inner.misses,
            hit_rate_pct: (hit_rate * 100.0).round() / 100.0,
            evictions: inner.evictions,
            ttl_hours: self.ttl_seconds / 3600.0,
            persist_enabled: self.persist_path.is_some(),
        }
    }

    /// Drop all entries from both tables.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("dedup lock poisoned");
        inner.committed.clear();
        inner.pending.clear();
        info!("dedup cache cleared");
    }

    fn cleanup_pending_locked(&self, inner: &mut DedupInner, now: f64) -> usize {
        let before = inner.pending.len();
        let ttl = self.reservation_ttl_seconds;
        inner.pending.retain(|_, &mut ts| now - ts < ttl);
        before - inner.pending.len()
    }
}

async fn open_pool(path: &PathBuf, create: bool) -> Result<SqlitePool> {
    if create {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }
    }
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(create);
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .with_context(|| format!("failed to open dedup persistence at {}", path.display()))
}

async fn ensure_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS dedup_cache (
            key TEXT PRIMARY KEY,
            timestamp REAL
        )",
    )
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;

    fn test_config() -> DedupConfig {
        DedupConfig {
            enabled: true,
            max_size: 100,
            ttl_hours: 24,
            persist_enabled: false,
            persist_path: PathBuf::from("unused.db"),
            checkpoint_interval_sec: 300,
        }
    }

    fn point(n: u32) -> Point {
        Point::new("heart")
            .tag("source", "watch")
            .field("bpm", n as f64)
            .timestamp(Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap())
    }

    #[test]
    fn reserve_then_commit_then_reserve_yields_nothing() {
        let cache = DedupCache::new(&test_config());
        let batch = vec![point(1), point(2), point(3)];

        let (to_process, keys) = cache.reserve_batch(batch.clone());
        assert_eq!(to_process.len(), 3);
        cache.commit_batch(&keys);

        let (again, keys) = cache.reserve_batch(batch);
        assert!(again.is_empty());
        assert!(keys.is_empty());
    }

    #[test]
    fn duplicates_within_batch_are_reserved_once() {
        let cache = DedupCache::new(&test_config());
        let (to_process, keys) = cache.reserve_batch(vec![point(1), point(1), point(2)]);
        assert_eq!(to_process.len(), 2);
        assert_eq!(keys.len(), 2);
    }

    #[test]
    fn reserved_fingerprint_blocks_second_reservation() {
        let cache = DedupCache::new(&test_config());
        let (first, keys) = cache.reserve_batch(vec![point(1)]);
        assert_eq!(first.len(), 1);

        // A second worker attempting the same point gets nothing.
        let (second, _) = cache.reserve_batch(vec![point(1)]);
        assert!(second.is_empty());

        // Until the first releases, at which point it becomes available.
        cache.release_batch(&keys);
        let (third, _) = cache.reserve_batch(vec![point(1)]);
        assert_eq!(third.len(), 1);
    }

    #[test]
    fn concurrent_reservations_partition_overlapping_batches() {
        use std::sync::Arc;
        let cache = Arc::new(DedupCache::new(&test_config()));
        let batch: Vec<Point> = (0..50).map(point).collect();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let batch = batch.clone();
                std::thread::spawn(move || cache.reserve_batch(batch).1)
            })
            .collect();

        let mut all_keys = Vec::new();
        for handle in handles {
            all_keys.extend(handle.join().unwrap());
        }

        // Every fingerprint went to exactly one worker.
        let unique: std::collections::HashSet<_> = all_keys.iter().collect();
        assert_eq!(all_keys.len(), 50);
        assert_eq!(unique.len(), 50);
    }

    #[test]
    fn expired_reservation_is_reservable_again() {
        let cache = DedupCache::new(&test_config()).with_reservation_ttl(0.0);
        let (first, _keys) = cache.reserve_batch(vec![point(1)]);
        assert_eq!(first.len(), 1);

        // TTL of zero: the reservation is already stale on the next call.
        let (second, _) = cache.reserve_batch(vec![point(1)]);
        assert_eq!(second.len(), 1);
    }

    #[test]
    fn commit_evicts_oldest_beyond_max_size() {
        let mut config = test_config();
        config.max_size = 100;
        let cache = DedupCache::new(&config);

        let points: Vec<Point> = (0..150).map(point).collect();
        let (_, keys) = cache.reserve_batch(points);
        cache.commit_batch(&keys);

        let stats = cache.stats();
        assert_eq!(stats.size, 100);
        assert_eq!(stats.evictions, 50);
    }

    #[test]
    fn filter_duplicates_dedupes_input_and_cache() {
        let cache = DedupCache::new(&test_config());
        let (_, keys) = cache.reserve_batch(vec![point(1)]);
        cache.commit_batch(&keys);

        let filtered = cache.filter_duplicates(vec![point(1), point(2), point(2), point(3)]);
        assert_eq!(filtered.len(), 2);
    }

    #[test]
    fn stats_track_hits_and_misses() {
        let cache = DedupCache::new(&test_config());
        let (_, keys) = cache.reserve_batch(vec![point(1), point(2)]);
        cache.commit_batch(&keys);
        cache.reserve_batch(vec![point(1), point(2)]);

        let stats = cache.stats();
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.hit_rate_pct, 50.0);
    }

    #[test]
    fn clear_empties_both_tables() {
        let cache = DedupCache::new(&test_config());
        cache.reserve_batch(vec![point(1)]);
        let (_, keys) = cache.reserve_batch(vec![point(2)]);
        cache.commit_batch(&keys);

        cache.clear();
        let stats = cache.stats();
        assert_eq!(stats.size, 0);
        assert_eq!(stats.pending_size, 0);
    }

    #[tokio::test]
    async fn checkpoint_and_restore_roundtrip() {
        let dir = tempdir().unwrap();
        let mut config = test_config();
        config.persist_enabled = true;
        config.persist_path = dir.path().join("dedup/cache.db");

        let cache = DedupCache::new(&config);
        let (_, keys) = cache.reserve_batch(vec![point(1), point(2), point(3)]);
        cache.commit_batch(&keys);
        cache.checkpoint().await.unwrap();

        let restored_cache = DedupCache::new(&config);
        let restored = restored_cache.restore().await.unwrap();
        assert_eq!(restored, 3);

        // Restored fingerprints are duplicates now.
        let (to_process, _) = restored_cache.reserve_batch(vec![point(1), point(2), point(3)]);
        assert!(to_process.is_empty());
    }

    #[tokio::test]
    async fn restore_from_missing_file_is_empty_cache() {
        let dir = tempdir().unwrap();
        let mut config = test_config();
        config.persist_enabled = true;
        config.persist_path = dir.path().join("nope.db");

        let cache = DedupCache::new(&config);
        assert_eq!(cache.restore().await.unwrap(), 0);
    }
}
