//! # Catalog Harvest
//!
//! Resumable, multi-source ingestion of records into a single deduplicated
//! SQLite catalog.
//!
//! The engine itself (rate limiting, circuit breaking, rank fusion,
//! deduplication, orchestration, checkpointed batches) lives in
//! [`harvest_core`]. This crate supplies the pieces that touch the outside
//! world: TOML configuration, the SQLite catalog/ledger store, the SQLite
//! search cache, progress reporters, and the `harvest` CLI.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌──────────────┐
//! │  Sources    │──▶│ Orchestrator │──▶│   SQLite     │
//! │ (adapters)  │   │ RRF + dedup  │   │ catalog +    │
//! └─────────────┘   └──────┬───────┘   │ ledger       │
//!                          │           └──────────────┘
//!                   ┌──────┴───────┐
//!                   │ BatchDriver  │  checkpoints, resume
//!                   └──────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`context`] | Wiring store, cache and registries from config |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`progress`] | Batch progress reporters |
//! | [`sqlite_cache`] | SQLite-backed search cache |
//! | [`sqlite_store`] | SQLite-backed catalog and ledger |

pub mod config;
pub mod context;
pub mod db;
pub mod migrate;
pub mod progress;
pub mod sqlite_cache;
pub mod sqlite_store;
