//! # kb-sync
//!
//! Keeps a managed knowledge-base index in step with its content store.
//!
//! Producers report new content as sync requests. kb-sync queues them,
//! collapses duplicates, and turns them into backend sync jobs without ever
//! running two jobs on one index at once. A separate reindex workflow
//! rebuilds the whole index into a fresh one, resumable after any
//! interruption, and switches queries over with one compare-and-set.
//!
//! ## Architecture
//!
//! ```text
//! producers ──▶ ┌─────────┐   ┌────────┐   ┌─────────────┐   ┌─────────┐
//!               │  queue  │──▶│ worker │──▶│ coordinator │──▶│ backend │
//!               │ (SQLite)│   └────────┘   └─────────────┘   └────┬────┘
//!               └─────────┘                       ▲               │
//!                                                 │               ▼
//! kbctl reindex ──▶ ┌──────────────┐ start sync ──┘         ┌──────────┐
//!                   │ orchestrator │──── cutover ──────────▶│ pointer  │◀── search
//!                   └──────────────┘                        └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! kbctl init --index kb-main        # create database, serve kb-main
//! kbctl enqueue kb-main             # request a sync
//! kbctl worker --once               # process it
//! kbctl reindex start               # rebuild into a new index
//! kbctl search "deployment"
//! kbctl serve                       # HTTP API + background worker
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | Sync ledger, reindex jobs, index pointer |
//! | [`queue`] | Durable FIFO-per-index request queue |
//! | [`coordinator`] | One-sync-per-index coordination |
//! | [`worker`] | Queue consumer |
//! | [`reindex`] | Resumable rebuild and cutover |
//! | [`search`] | Multi-slice retrieval |
//! | [`backend_http`] | REST backend adapter |
//! | [`server`] | HTTP API |
//! | [`status`] | Operator overview |
//! | [`progress`] | Reindex progress reporting |
//! | [`app`] | Wiring for the CLI and server |

pub mod app;
pub mod backend_http;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod migrate;
pub mod progress;
pub mod queue;
pub mod reindex;
pub mod search;
pub mod server;
pub mod sqlite_store;
pub mod status;
pub mod worker;
