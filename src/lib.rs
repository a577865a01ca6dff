//! # FAQ Digest
//!
//! A staged pipeline that distills a chat channel's message archive into
//! curated, navigable FAQ documentation.
//!
//! The corpus is append-only and sharded by calendar month. Each stage is
//! an independently re-runnable command whose on-disk output is the
//! contract with the next stage; staleness markers (content fingerprint +
//! logic version per partition and stage) make every re-run an idempotent
//! no-op unless its input actually changed.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────────────────┐   ┌───────────────────────┐
//! │  Source  │──▶│ Partition Store (SQLite) │──▶│ extract-facts         │
//! │ (export) │   │  messages by YYYY-MM     │   │ extract-questions     │ per
//! └──────────┘   └──────────────────────────┘   │ extract-cases         │ month
//!                                               └──────────┬────────────┘
//!                                                          ▼
//!                 aggregate-questions ─▶ categorize-questions ─▶
//!                 normalize-questions ─▶ render            (global passes)
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! fqd init                      # create database
//! fqd fetch                     # ingest the channel export
//! fqd extract-questions --max-months 2
//! fqd aggregate-questions
//! fqd categorize-questions
//! fqd normalize-questions
//! fqd render                    # emit markdown pages
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`partition`] | Calendar-month partition keys |
//! | [`store`] | Append-only message corpus |
//! | [`runner`] | Fingerprints, markers, bounded per-partition driver |
//! | [`source`] | Paginated corpus ingestion interface |
//! | [`provider`] | Text-understanding collaborator interface |
//! | [`extract`] | Per-month facts/questions/cases extraction |
//! | [`aggregate`] | Global question dedup and merge |
//! | [`categorize`] | Category labeling with reuse bias |
//! | [`normalize`] | Taxonomy compression to a bounded count |
//! | [`render`] | Deterministic markdown output |

pub mod aggregate;
pub mod categorize;
pub mod config;
pub mod db;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod migrate;
pub mod models;
pub mod normalize;
pub mod partition;
pub mod provider;
pub mod render;
pub mod runner;
pub mod similarity;
pub mod source;
pub mod status;
pub mod store;
