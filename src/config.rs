//! Configuration loading and validation.
//!
//! Settings come from a TOML file plus hard defaults; every component
//! receives its config struct at construction (no global settings object).

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Default config file probed when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "vitalsink.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub app: AppConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub dlq: DlqConfig,
    #[serde(default)]
    pub tsdb: TsdbConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Default `source` tag applied when a sample does not carry one.
    #[serde(default = "default_source")]
    pub default_source: String,
    /// Number of pipeline worker tasks.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Bound of the ingest channel; full channel surfaces as HTTP 429.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Seconds allowed for graceful shutdown before in-flight work is abandoned.
    #[serde(default = "default_shutdown_deadline_secs")]
    pub shutdown_deadline_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bearer token; empty disables authentication.
    #[serde(default)]
    pub auth_token: String,
    #[serde(default = "default_max_request_size")]
    pub max_request_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rotation {
    Daily,
    Hourly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_archive_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_rotation")]
    pub rotation: Rotation,
    #[serde(default = "default_max_age_days")]
    pub max_age_days: u32,
    #[serde(default = "default_compress_after_days")]
    pub compress_after_days: u32,
    /// Fsync each append before acknowledging the write.
    #[serde(default)]
    pub fsync: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_dedup_max_size")]
    pub max_size: usize,
    #[serde(default = "default_ttl_hours")]
    pub ttl_hours: u32,
    #[serde(default = "default_true")]
    pub persist_enabled: bool,
    #[serde(default = "default_dedup_persist_path")]
    pub persist_path: PathBuf,
    #[serde(default = "default_checkpoint_interval_sec")]
    pub checkpoint_interval_sec: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_dlq_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_dlq_max_entries")]
    pub max_entries: u32,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default = "default_dlq_max_retries")]
    pub max_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TsdbConfig {
    #[serde(default = "default_tsdb_url")]
    pub url: String,
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_org")]
    pub org: String,
    #[serde(default = "default_bucket")]
    pub bucket: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_write_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            default_source: default_source(),
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            shutdown_deadline_secs: default_shutdown_deadline_secs(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_host(),
            port: default_port(),
            auth_token: String::new(),
            max_request_size: default_max_request_size(),
        }
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: default_archive_dir(),
            rotation: default_rotation(),
            max_age_days: default_max_age_days(),
            compress_after_days: default_compress_after_days(),
            fsync: false,
        }
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: default_dedup_max_size(),
            ttl_hours: default_ttl_hours(),
            persist_enabled: true,
            persist_path: default_dedup_persist_path(),
            checkpoint_interval_sec: default_checkpoint_interval_sec(),
        }
    }
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            db_path: default_dlq_db_path(),
            max_entries: default_dlq_max_entries(),
            retention_days: default_retention_days(),
            max_retries: default_dlq_max_retries(),
        }
    }
}

impl Default for TsdbConfig {
    fn default() -> Self {
        Self {
            url: default_tsdb_url(),
            token: String::new(),
            org: default_org(),
            bucket: default_bucket(),
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
            max_retries: default_write_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl Config {
    /// Load configuration from an explicit path, or from the default file if
    /// present, or fall back to built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(p) => Self::from_file(p)?,
            None => {
                let default = Path::new(DEFAULT_CONFIG_FILE);
                if default.exists() {
                    Self::from_file(default)?
                } else {
                    Self::default()
                }
            }
        };
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    /// Enforce the documented ranges; errors name the offending setting.
    pub fn validate(&self) -> Result<()> {
        if self.http.port == 0 {
            bail!("http.port must be between 1 and 65535");
        }
        if self.http.max_request_size < 1024 {
            bail!(
                "http.max_request_size must be at least 1024 bytes, got {}",
                self.http.max_request_size
            );
        }
        if self.http.max_request_size > 104_857_600 {
            bail!(
                "http.max_request_size too large (max 100MB), got {}",
                self.http.max_request_size
            );
        }
        if self.archive.max_age_days < 1 {
            bail!("archive.max_age_days must be at least 1");
        }
        if self.archive.compress_after_days < 1 {
            bail!("archive.compress_after_days must be at least 1");
        }
        if self.dedup.max_size < 100 {
            bail!("dedup.max_size must be at least 100, got {}", self.dedup.max_size);
        }
        if self.dedup.max_size > 10_000_000 {
            bail!("dedup.max_size too large (max 10M), got {}", self.dedup.max_size);
        }
        if self.dedup.ttl_hours < 1 {
            bail!("dedup.ttl_hours must be at least 1");
        }
        if self.dlq.max_entries < 100 {
            bail!("dlq.max_entries must be at least 100, got {}", self.dlq.max_entries);
        }
        if self.dlq.retention_days < 1 {
            bail!("dlq.retention_days must be at least 1");
        }
        if self.dlq.max_retries < 1 || self.dlq.max_retries > 10 {
            bail!("dlq.max_retries must be in 1..=10, got {}", self.dlq.max_retries);
        }
        if self.tsdb.batch_size < 1 || self.tsdb.batch_size > 50_000 {
            bail!("tsdb.batch_size must be in 1..=50000, got {}", self.tsdb.batch_size);
        }
        if self.tsdb.flush_interval_ms < 100 {
            bail!(
                "tsdb.flush_interval_ms must be at least 100, got {}",
                self.tsdb.flush_interval_ms
            );
        }
        if self.app.workers == 0 {
            bail!("app.workers must be at least 1");
        }
        if self.app.queue_capacity == 0 {
            bail!("app.queue_capacity must be at least 1");
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_source() -> String {
    "health_auto_export".to_string()
}

fn default_workers() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    1000
}

fn default_shutdown_deadline_secs() -> u64 {
    30
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_max_request_size() -> usize {
    10_485_760
}

fn default_archive_dir() -> PathBuf {
    PathBuf::from("data/archive")
}

fn default_rotation() -> Rotation {
    Rotation::Daily
}

fn default_max_age_days() -> u32 {
    30
}

fn default_compress_after_days() -> u32 {
    7
}

fn default_dedup_max_size() -> usize {
    100_000
}

fn default_ttl_hours() -> u32 {
    24
}

fn default_dedup_persist_path() -> PathBuf {
    PathBuf::from("data/dedup/cache.db")
}

fn default_checkpoint_interval_sec() -> u64 {
    300
}

fn default_dlq_db_path() -> PathBuf {
    PathBuf::from("data/dlq/dlq.db")
}

fn default_dlq_max_entries() -> u32 {
    10_000
}

fn default_retention_days() -> u32 {
    30
}

fn default_dlq_max_retries() -> u32 {
    3
}

fn default_tsdb_url() -> String {
    "http://localhost:8086".to_string()
}

fn default_org() -> String {
    "health".to_string()
}

fn default_bucket() -> String {
    "health_metrics".to_string()
}

fn default_batch_size() -> usize {
    1000
}

fn default_flush_interval_ms() -> u64 {
    30_000
}

fn default_write_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn parses_partial_toml_with_defaults() {
        let config: Config = toml::from_str(
            r#"
            [http]
            port = 9000
            auth_token = "secret"

            [archive]
            rotation = "hourly"

            [tsdb]
            url = "http://influx:8086"
            token = "t0k3n"
            "#,
        )
        .unwrap();

        assert_eq!(config.http.port, 9000);
        assert_eq!(config.http.auth_token, "secret");
        assert_eq!(config.archive.rotation, Rotation::Hourly);
        assert_eq!(config.tsdb.url, "http://influx:8086");
        // Untouched sections keep their defaults.
        assert_eq!(config.dedup.max_size, 100_000);
        assert_eq!(config.dlq.max_retries, 3);
        config.validate().unwrap();
    }

    #[test]
    fn rejects_out_of_range_values() {
        let mut config = Config::default();
        config.dedup.max_size = 10;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.dlq.max_retries = 11;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.tsdb.flush_interval_ms = 50;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.http.max_request_size = 100;
        assert!(config.validate().is_err());
    }
}
