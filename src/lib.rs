//! # Sync Orchestrator
//!
//! A coordination engine for continuous synchronization of external data
//! sources (drive, messaging, wiki, CRM) into an indexing pipeline.
//!
//! The orchestrator owns scheduling, admission control, run supervision,
//! durable event queueing, embedding jobs, and webhook channel lifecycle.
//! It knows nothing about any concrete provider API: all provider logic
//! lives in out-of-process connector workers spoken to over a small HTTP
//! protocol, and workers report progress back through SDK callbacks.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐  /sync /cancel   ┌────────────┐
//! │ scheduler  │─────────────────▶│ connector  │
//! │ + sweeps   │                  │  workers   │
//! └─────┬──────┘                  └─────┬──────┘
//!       │                               │ /sdk/* callbacks
//!       ▼                               ▼
//! ┌─────────────────────────────────────────────┐
//! │              SQLite (single store)           │
//! │  sources · sync_runs · connector_events ·    │
//! │  embedding_jobs · webhook_channels           │
//! └─────┬───────────────────────────┬───────────┘
//!       │ event dispatcher          │ embedding pool
//!       ▼                           ▼
//!  indexing pipeline           embeddings table
//! ```
//!
//! All cross-task coordination happens through conditional row updates in
//! the store; there are no in-process locks guarding sync state, so
//! horizontal replicas sharing the database are safe by construction.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types and the event payload sum type |
//! | [`sources`] | Source registry and credential opening |
//! | [`scheduler`] | Due-source selection and admission |
//! | [`runs`] | Sync-run state machine and stale-sync sweep |
//! | [`protocol`] | Orchestrator→worker HTTP client |
//! | [`server`] | Worker SDK callbacks + operator HTTP API |
//! | [`events`] | Durable event queue with retry and dead-letter |
//! | [`content`] | Out-of-band content blob store |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`embed_queue`] | Embedding job queue and worker pool |
//! | [`webhook`] | Webhook channel registration and renewal |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod config;
pub mod content;
pub mod db;
pub mod embed_queue;
pub mod embedding;
pub mod events;
pub mod migrate;
pub mod models;
pub mod protocol;
pub mod runs;
pub mod scheduler;
pub mod server;
pub mod sources;
pub mod webhook;

#[cfg(test)]
pub(crate) mod testutil;
