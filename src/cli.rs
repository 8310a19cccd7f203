//! Operator CLI: serve, archive replay, and DLQ inspection/replay.
//!
//! Exit codes: 0 success, 1 invalid arguments, 2 operational error.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Context;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::warn;

use crate::app::Application;
use crate::archive::ArchiveStore;
use crate::config::Config;
use crate::dedup::DedupCache;
use crate::dlq::{DeadLetterQueue, DlqCategory};
use crate::transform::TransformerRegistry;
use crate::writer::{HttpTsClient, TsWriter};

#[derive(Parser)]
#[command(
    name = "vitalsink",
    version,
    about = "Durable ingestion and processing pipeline for personal health telemetry"
)]
pub struct Cli {
    /// Path to the TOML config file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the ingestion service until SIGINT/SIGTERM.
    Serve,
    /// Raw payload archive operations.
    Archive {
        #[command(subcommand)]
        command: ArchiveCommand,
    },
    /// Dead-letter queue operations.
    Dlq {
        #[command(subcommand)]
        command: DlqCommand,
    },
}

#[derive(Subcommand)]
pub enum ArchiveCommand {
    /// Replay archived payloads through the transformer pipeline.
    Replay {
        /// Start date (YYYY-MM-DD, inclusive).
        #[arg(long)]
        start: NaiveDate,
        /// End date (YYYY-MM-DD, inclusive).
        #[arg(long)]
        end: NaiveDate,
        /// Archive directory (defaults to the configured one).
        #[arg(long)]
        dir: Option<PathBuf>,
        /// Enumerate without processing.
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Subcommand)]
pub enum DlqCommand {
    /// List entries, newest first.
    List {
        /// Filter by category.
        #[arg(long)]
        category: Option<String>,
        #[arg(long, default_value_t = 100)]
        limit: u32,
        /// Emit JSON instead of the human-readable listing.
        #[arg(long)]
        json: bool,
        /// Include stored error detail.
        #[arg(long)]
        detail: bool,
    },
    /// Replay entries through the transformer pipeline.
    Replay {
        /// Replay a single entry by id.
        #[arg(long, conflicts_with_all = ["category", "all"])]
        id: Option<String>,
        /// Replay the newest entries of one category.
        #[arg(long, conflicts_with = "all")]
        category: Option<String>,
        /// Replay across all categories.
        #[arg(long)]
        all: bool,
        /// Per-category cap.
        #[arg(long, default_value_t = 100)]
        limit: u32,
    },
    /// Show queue statistics.
    Stats,
    /// Delete a single entry.
    Delete {
        #[arg(long)]
        id: String,
    },
    /// Delete every entry.
    Clear {
        /// Confirm the deletion.
        #[arg(long)]
        yes: bool,
    },
}

/// Command failures, split by the exit code they map to.
pub enum CliError {
    /// Invalid arguments: exit code 1.
    Usage(String),
    /// Operational failure: exit code 2.
    Operational(anyhow::Error),
}

impl From<anyhow::Error> for CliError {
    fn from(e: anyhow::Error) -> Self {
        CliError::Operational(e)
    }
}

pub async fn execute(cli: Cli) -> Result<(), CliError> {
    let config = Config::load(cli.config.as_deref()).map_err(|e| CliError::Usage(format!("{:#}", e)))?;

    match cli.command {
        Command::Serve => {
            let app = Application::build(config).await?;
            app.run().await?;
            Ok(())
        }
        Command::Archive { command } => match command {
            ArchiveCommand::Replay {
                start,
                end,
                dir,
                dry_run,
            } => replay_archive(config, start, end, dir, dry_run).await,
        },
        Command::Dlq { command } => run_dlq_command(config, command).await,
    }
}

fn parse_category(value: Option<String>) -> Result<Option<DlqCategory>, CliError> {
    match value {
        None => Ok(None),
        Some(s) => s.parse().map(Some).map_err(CliError::Usage),
    }
}

/// Replay sink shared by archive and DLQ replay: transformer registry, a
/// non-reserving dedup filter, and the writer. The DLQ itself is bypassed.
struct ReplaySink {
    registry: TransformerRegistry,
    dedup: Option<DedupCache>,
    writer: Arc<TsWriter>,
    processed: AtomicU64,
    errors: AtomicU64,
}

impl ReplaySink {
    async fn build(config: &Config) -> Result<Self, CliError> {
        let dedup = if config.dedup.enabled {
            let cache = DedupCache::new(&config.dedup);
            if let Err(e) = cache.restore().await {
                warn!(error = %e, "dedup restore failed, replay may re-write points");
            }
            Some(cache)
        } else {
            None
        };

        let writer = Arc::new(TsWriter::new(
            &config.tsdb,
            Arc::new(HttpTsClient::new(&config.tsdb)),
        ));
        if let Err(e) = writer.connect().await {
            warn!(error = %e, "measurements DB not reachable, writes will be retried");
        }

        Ok(Self {
            registry: TransformerRegistry::new(&config.app.default_source),
            dedup,
            writer,
            processed: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        })
    }

    /// Process one replayed payload, counting the outcome either way.
    async fn process(&self, payload: &Value) -> anyhow::Result<()> {
        let points = match self.registry.transform(payload) {
            Ok(points) => points,
            Err(e) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                eprintln!("transform error: {}", e);
                return Err(e.into());
            }
        };

        let points = match &self.dedup {
            Some(dedup) => dedup.filter_duplicates(points),
            None => points,
        };

        if !points.is_empty() {
            if let Err(e) = self.writer.write(points).await {
                self.errors.fetch_add(1, Ordering::Relaxed);
                eprintln!("write error: {}", e);
                return Err(e.into());
            }
        }
        self.processed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn finish(&self) {
        if let Err(e) = self.writer.flush().await {
            eprintln!("final flush incomplete: {}", e);
        }
        if let Some(dedup) = &self.dedup {
            if let Err(e) = dedup.checkpoint().await {
                eprintln!("dedup checkpoint failed: {}", e);
            }
        }
    }
}

async fn replay_archive(
    config: Config,
    start: NaiveDate,
    end: NaiveDate,
    dir: Option<PathBuf>,
    dry_run: bool,
) -> Result<(), CliError> {
    if start > end {
        return Err(CliError::Usage(
            "start date must be before or equal to end date".to_string(),
        ));
    }

    let mut archive_config = config.archive.clone();
    if let Some(dir) = dir {
        archive_config.dir = dir;
    }
    if !archive_config.dir.is_dir() {
        return Err(CliError::Operational(anyhow::anyhow!(
            "archive dir does not exist: {}",
            archive_config.dir.display()
        )));
    }
    let archive = ArchiveStore::open(&archive_config).context("failed to open archive")?;

    if dry_run {
        let count = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&count);
        archive
            .replay(start, end, move |topic, payload, id| {
                let n = counter.fetch_add(1, Ordering::Relaxed) + 1;
                if n <= 10 {
                    println!("  [{}] {}: {} bytes", id, topic, payload.to_string().len());
                }
                async { Ok(()) }
            })
            .await
            .context("archive replay failed")?;
        println!("\nDry run: {} messages would be replayed", count.load(Ordering::Relaxed));
        return Ok(());
    }

    let sink = Arc::new(ReplaySink::build(&config).await?);
    let replay_sink = Arc::clone(&sink);
    let total = archive
        .replay(start, end, move |_topic, payload, _id| {
            let sink = Arc::clone(&replay_sink);
            async move {
                // Outcomes are tallied by the sink; the walk never aborts.
                let _ = sink.process(&payload).await;
                Ok(())
            }
        })
        .await
        .context("archive replay failed")?;
    sink.finish().await;

    println!(
        "\nReplayed {} messages: {} processed, {} errors",
        total,
        sink.processed.load(Ordering::Relaxed),
        sink.errors.load(Ordering::Relaxed)
    );
    Ok(())
}

async fn run_dlq_command(config: Config, command: DlqCommand) -> Result<(), CliError> {
    let dlq = DeadLetterQueue::open(&config.dlq)
        .await
        .context("failed to open dead-letter queue")?;

    match command {
        DlqCommand::List {
            category,
            limit,
            json,
            detail,
        } => {
            let category = parse_category(category)?;
            let entries = dlq
                .get_entries(category, limit, 0)
                .await
                .context("failed to read DLQ entries")?;

            if json {
                let output: Vec<Value> = entries.iter().map(|e| e.to_summary()).collect();
                println!("{}", serde_json::to_string_pretty(&output).unwrap_or_default());
                return Ok(());
            }

            if entries.is_empty() {
                println!("No DLQ entries found");
                return Ok(());
            }

            println!("Found {} entries:\n", entries.len());
            for entry in entries {
                println!("ID: {}", entry.id);
                println!("  Category:   {}", entry.category);
                println!("  Topic:      {}", entry.topic);
                let message: String = entry.error_message.chars().take(100).collect();
                println!("  Error:      {}", message);
                println!("  Created:    {}", entry.created_at);
                println!("  Retries:    {}", entry.retry_count);
                if let Some(archive_id) = &entry.archive_id {
                    println!("  Archive ID: {}", archive_id);
                }
                if detail {
                    if let Some(detail) = &entry.error_detail {
                        println!("  Detail:     {}", detail);
                    }
                }
                println!();
            }
            Ok(())
        }
        DlqCommand::Replay {
            id,
            category,
            all,
            limit,
        } => {
            let sink = Arc::new(ReplaySink::build(&config).await?);
            // Failures propagate so the entry's retry count advances.
            let callback = |sink: Arc<ReplaySink>| {
                move |_topic: String, payload: Value| {
                    let sink = Arc::clone(&sink);
                    async move { sink.process(&payload).await }
                }
            };

            if let Some(id) = id {
                let replayed = dlq
                    .replay_entry(&id, callback(Arc::clone(&sink)))
                    .await
                    .context("DLQ replay failed")?;
                sink.finish().await;
                println!("{}", if replayed { "replayed" } else { "not replayed" });
                Ok(())
            } else if let Some(category) = parse_category(category)? {
                let (success, failure) = dlq
                    .replay_category(category, callback(Arc::clone(&sink)), limit)
                    .await
                    .context("DLQ replay failed")?;
                sink.finish().await;
                println!("Replayed {}: {} succeeded, {} failed", category, success, failure);
                Ok(())
            } else if all {
                let mut total_success = 0u64;
                let mut total_failure = 0u64;
                for category in DlqCategory::ALL {
                    let (success, failure) = dlq
                        .replay_category(category, callback(Arc::clone(&sink)), limit)
                        .await
                        .context("DLQ replay failed")?;
                    total_success += success;
                    total_failure += failure;
                }
                sink.finish().await;
                println!("Replayed all categories: {} succeeded, {} failed", total_success, total_failure);
                Ok(())
            } else {
                Err(CliError::Usage(
                    "one of --id, --category, or --all is required".to_string(),
                ))
            }
        }
        DlqCommand::Stats => {
            let stats = dlq.stats().await.context("failed to read DLQ stats")?;
            println!("{}", serde_json::to_string_pretty(&stats).unwrap_or_default());
            Ok(())
        }
        DlqCommand::Delete { id } => {
            let deleted = dlq.delete_entry(&id).await.context("failed to delete DLQ entry")?;
            if deleted {
                println!("deleted {}", id);
                Ok(())
            } else {
                Err(CliError::Operational(anyhow::anyhow!("entry not found: {}", id)))
            }
        }
        DlqCommand::Clear { yes } => {
            if !yes {
                return Err(CliError::Usage(
                    "refusing to clear the DLQ without --yes".to_string(),
                ));
            }
            let count = dlq.clear().await.context("failed to clear DLQ")?;
            println!("deleted {} entries", count);
            Ok(())
        }
    }
}
