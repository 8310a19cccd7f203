//! # vitalsink
//!
//! Durable ingestion and processing pipeline for personal health telemetry.
//! Clients push JSON payloads over HTTP; the pipeline normalizes them into
//! time-series points for a measurements database while guaranteeing that no
//! accepted payload is lost, identical points are never written twice, and
//! every failure mode has an operator workflow (inspect, replay, purge).
//!
//! ## Modules
//!
//! - `app` - Application composition and lifecycle
//! - `archive` - Append-only JSONL archive of raw payloads (first durability tier)
//! - `breaker` - Circuit breaker wrapping remote calls
//! - `cli` - Operator CLI: serve, archive replay, DLQ operations
//! - `config` - TOML configuration with validation
//! - `dedup` - Content-hash dedup cache with reservation semantics
//! - `dlq` - SQLite-backed dead-letter queue with replay support
//! - `http` - HTTP ingest surface (`/ingest`, `/health`, `/ready`, `/stats`)
//! - `pipeline` - Bounded queue, worker pool, and background tasks
//! - `point` - Time-series point model, fingerprinting, line protocol
//! - `transform` - Transformer registry for the accepted payload shapes
//! - `writer` - Batched, retrying writer for the measurements database

pub mod app;
pub mod archive;
pub mod breaker;
pub mod cli;
pub mod config;
pub mod dedup;
pub mod dlq;
pub mod http;
pub mod pipeline;
pub mod point;
pub mod transform;
pub mod writer;

#[cfg(test)]
mod property_tests;
