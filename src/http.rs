//! HTTP ingest surface: `POST /ingest` plus liveness, readiness, and stats
//! endpoints.
//!
//! The payload is archived before it is parsed, so a crash anywhere between
//! acceptance and enqueue still leaves a durable copy on disk. A 202 promises
//! exactly that: archived and queued, not yet processed.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::archive::ArchiveStore;
use crate::breaker::CircuitState;
use crate::dedup::DedupCache;
use crate::dlq::{DeadLetterQueue, DlqCategory};
use crate::pipeline::{EnqueueError, IngestionEvent, PipelineHandle};
use crate::writer::TsWriter;

const INGEST_TOPIC: &str = "http/ingest";

/// Shared state for the HTTP handlers.
pub struct HttpState {
    /// Bearer token; `None` disables authentication.
    pub auth_token: Option<String>,
    pub max_request_size: usize,
    pub archive: Option<ArchiveStore>,
    pub dlq: Option<Arc<DeadLetterQueue>>,
    pub dedup: Option<Arc<DedupCache>>,
    pub writer: Arc<TsWriter>,
    pub pipeline: PipelineHandle,
}

pub fn router(state: Arc<HttpState>) -> Router {
    Router::new()
        .route("/ingest", post(handle_ingest))
        .route("/health", get(handle_health))
        .route("/ready", get(handle_ready))
        .route("/stats", get(handle_stats))
        // Body size is enforced by the handler so the 413 carries our JSON shape.
        .layer(DefaultBodyLimit::disable())
        .with_state(state)
}

/// Serve until the shutdown signal flips.
pub async fn serve(
    state: Arc<HttpState>,
    host: &str,
    port: u16,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "http server started");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;

    info!("http server stopped");
    Ok(())
}

/// Compare the supplied bearer token against the configured one by SHA-256
/// digest, so the comparison cost does not depend on where they differ.
fn token_matches(expected: &str, headers: &HeaderMap) -> bool {
    let Some(supplied) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    else {
        return false;
    };
    Sha256::digest(supplied.as_bytes()) == Sha256::digest(expected.as_bytes())
}

fn json_response(status: StatusCode, body: Value) -> Response {
    (status, Json(body)).into_response()
}

fn too_large(max_bytes: usize) -> Response {
    json_response(
        StatusCode::PAYLOAD_TOO_LARGE,
        json!({"error": "Request body too large", "max_bytes": max_bytes}),
    )
}

async fn handle_ingest(State(state): State<Arc<HttpState>>, request: Request) -> Response {
    let headers = request.headers().clone();

    if let Some(token) = &state.auth_token {
        if !token_matches(token, &headers) {
            return json_response(StatusCode::UNAUTHORIZED, json!({"error": "Unauthorized"}));
        }
    }

    // Declared size first, so oversized uploads are refused before reading.
    let declared = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if declared.is_some_and(|len| len > state.max_request_size) {
        return too_large(state.max_request_size);
    }

    let body: Bytes = match axum::body::to_bytes(request.into_body(), state.max_request_size).await
    {
        Ok(body) => body,
        Err(_) => return too_large(state.max_request_size),
    };

    // Archive the raw payload before parsing anything.
    let mut archive_id: Option<String> = None;
    if let Some(archive) = &state.archive {
        match archive.store(INGEST_TOPIC, &body, Utc::now()).await {
            Ok(id) => archive_id = Some(id),
            Err(e) => error!(error = %e, "archive store failed"),
        }
    }

    let parsed = match std::str::from_utf8(&body) {
        Err(e) => Err((DlqCategory::UnicodeDecodeError, e.to_string())),
        Ok(text) => serde_json::from_str::<Value>(text)
            .map_err(|e| (DlqCategory::JsonParseError, e.to_string())),
    };

    let payload = match parsed {
        Ok(payload) => payload,
        Err((category, message)) => {
            warn!(
                category = %category,
                error = %message,
                archive_id = archive_id.as_deref().unwrap_or("-"),
                "payload parse error"
            );
            if let Some(dlq) = &state.dlq {
                if let Err(e) = dlq
                    .enqueue(category, INGEST_TOPIC, &body, &message, None, archive_id.as_deref())
                    .await
                {
                    error!(error = %e, "failed to dead-letter unparseable payload");
                }
            }
            return json_response(StatusCode::BAD_REQUEST, json!({"error": "Invalid JSON"}));
        }
    };

    let event = IngestionEvent::new(INGEST_TOPIC, payload, body.to_vec(), archive_id.clone());
    match state.pipeline.try_enqueue(event) {
        Ok(()) => {
            debug!(
                payload_size = body.len(),
                archive_id = archive_id.as_deref().unwrap_or("-"),
                "message accepted"
            );
            json_response(
                StatusCode::ACCEPTED,
                json!({"status": "accepted", "archive_id": archive_id}),
            )
        }
        Err(EnqueueError::Full) => json_response(
            StatusCode::TOO_MANY_REQUESTS,
            json!({"error": "Service overloaded, try again later"}),
        ),
        Err(EnqueueError::NotReady) => {
            json_response(StatusCode::SERVICE_UNAVAILABLE, json!({"error": "Service not ready"}))
        }
    }
}

async fn handle_health() -> Response {
    Json(json!({"status": "ok"})).into_response()
}

/// Readiness: degraded when the pipeline cannot accept work or the writer's
/// circuit breaker is open.
async fn handle_ready(State(state): State<Arc<HttpState>>) -> Response {
    let queue_ready = state.pipeline.is_ready();
    let breaker = state.writer.breaker_stats();
    let ready = queue_ready && breaker.state != CircuitState::Open;

    let body = json!({
        "status": if ready { "ok" } else { "degraded" },
        "components": {
            "queue": {
                "ready": queue_ready,
                "size": state.pipeline.queue_size(),
                "capacity": state.pipeline.queue_capacity(),
            },
            "writer": {
                "circuit_state": breaker.state.as_str(),
                "buffer_size": state.writer.buffer_size(),
                "dropped_points": state.writer.dropped_points(),
            },
        },
    });

    let status = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    json_response(status, body)
}

async fn handle_stats(State(state): State<Arc<HttpState>>) -> Response {
    let archive = match &state.archive {
        Some(archive) => archive.stats().await.map(|s| json!(s)).unwrap_or(Value::Null),
        None => Value::Null,
    };
    let dlq = match &state.dlq {
        Some(dlq) => dlq.stats().await.map(|s| json!(s)).unwrap_or(Value::Null),
        None => Value::Null,
    };
    let dedup = state.dedup.as_ref().map(|d| json!(d.stats())).unwrap_or(Value::Null);

    let body = json!({
        "pipeline": state.pipeline.stats(),
        "writer": {
            "buffer_size": state.writer.buffer_size(),
            "written_points": state.writer.written_points(),
            "dropped_points": state.writer.dropped_points(),
            "breaker": state.writer.breaker_stats(),
        },
        "archive": archive,
        "dedup": dedup,
        "dlq": dlq,
    });
    Json(body).into_response()
}
