//! Application composition: constructs every component from its config and
//! wires them together. No global state; each component receives its
//! dependencies explicitly at build time.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::archive::ArchiveStore;
use crate::config::Config;
use crate::dedup::DedupCache;
use crate::dlq::DeadLetterQueue;
use crate::http::{self, HttpState};
use crate::pipeline::Pipeline;
use crate::transform::TransformerRegistry;
use crate::writer::{HttpTsClient, TsWriter};

/// The composed service: archive, dedup cache, DLQ, transformer registry,
/// writer, pipeline, and the HTTP ingest surface.
pub struct Application {
    config: Config,
    pipeline: Pipeline,
    http_state: Arc<HttpState>,
}

impl Application {
    /// Build every component. Archive and DLQ initialization failures are
    /// fatal: the process must not run without its durability tiers.
    pub async fn build(config: Config) -> Result<Self> {
        let archive = if config.archive.enabled {
            Some(ArchiveStore::open(&config.archive).context("archive initialization failed")?)
        } else {
            warn!("archive disabled; raw payloads will not be recoverable");
            None
        };

        let dlq = if config.dlq.enabled {
            Some(Arc::new(
                DeadLetterQueue::open(&config.dlq)
                    .await
                    .context("dead-letter queue initialization failed")?,
            ))
        } else {
            warn!("dead-letter queue disabled; failed payloads will be lost");
            None
        };

        let dedup = if config.dedup.enabled {
            let cache = DedupCache::new(&config.dedup);
            match cache.restore().await {
                Ok(restored) if restored > 0 => info!(restored, "dedup cache restored"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "dedup restore failed, starting empty"),
            }
            Some(Arc::new(cache))
        } else {
            None
        };

        let registry = Arc::new(TransformerRegistry::new(&config.app.default_source));
        let writer = Arc::new(TsWriter::new(
            &config.tsdb,
            Arc::new(HttpTsClient::new(&config.tsdb)),
        ));
        if let Err(e) = writer.connect().await {
            warn!(error = %e, "measurements DB not reachable at startup");
        }

        let pipeline = Pipeline::start(
            &config,
            registry,
            dedup.clone(),
            dlq.clone(),
            Arc::clone(&writer),
            archive.clone(),
        );

        let http_state = Arc::new(HttpState {
            auth_token: (!config.http.auth_token.is_empty())
                .then(|| config.http.auth_token.clone()),
            max_request_size: config.http.max_request_size,
            archive,
            dlq,
            dedup,
            writer,
            pipeline: pipeline.handle(),
        });

        Ok(Self {
            config,
            pipeline,
            http_state,
        })
    }

    /// Run until SIGINT/SIGTERM, then shut down gracefully: stop accepting
    /// HTTP, drain the pipeline, flush the writer, checkpoint the dedup cache.
    pub async fn run(self) -> Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut http_task = if self.config.http.enabled {
            let state = Arc::clone(&self.http_state);
            let host = self.config.http.host.clone();
            let port = self.config.http.port;
            Some(tokio::spawn(async move {
                http::serve(state, &host, port, shutdown_rx).await
            }))
        } else {
            warn!("http ingest disabled");
            None
        };

        info!("service started");
        let http_finished = match http_task.as_mut() {
            Some(task) => {
                tokio::select! {
                    _ = wait_for_shutdown_signal() => {
                        info!("shutdown signal received");
                        false
                    }
                    result = task => {
                        match result {
                            Ok(Ok(())) => warn!("http server exited"),
                            Ok(Err(e)) => error!(error = %e, "http server failed"),
                            Err(e) => error!(error = %e, "http server task panicked"),
                        }
                        true
                    }
                }
            }
            None => {
                wait_for_shutdown_signal().await;
                info!("shutdown signal received");
                false
            }
        };
        if http_finished {
            http_task = None;
        }

        let _ = shutdown_tx.send(true);
        if let Some(task) = http_task {
            if tokio::time::timeout(Duration::from_secs(10), task).await.is_err() {
                warn!("http server did not stop in time");
            }
        }

        self.pipeline.shutdown().await;
        info!("service stopped");
        Ok(())
    }
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
