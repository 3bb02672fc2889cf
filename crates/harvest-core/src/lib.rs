//! # Harvest Core
//!
//! The ingestion orchestration engine behind Catalog Harvest: data models,
//! per-source rate limiting and circuit breaking, the search cache trait,
//! deduplication, reciprocal rank fusion, storage traits, the multi-source
//! orchestrator, and the checkpointed batch driver.
//!
//! This crate performs no database or filesystem I/O. Persistent storage is
//! reached through the [`store::CatalogStore`] and [`store::LedgerStore`]
//! traits; an in-memory implementation ships in [`store::memory`].

pub mod batch;
pub mod cache;
pub mod circuit;
pub mod dedup;
pub mod models;
pub mod orchestrator;
pub mod policy;
pub mod progress;
pub mod ranking;
pub mod rate_limit;
pub mod source;
pub mod store;
