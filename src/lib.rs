//! # Rapport
//!
//! Workspace activity profiles and grounded reply drafts for Slack
//! administrators.
//!
//! Rapport ingests raw Slack events, builds an incrementally maintained
//! profile per user, indexes message text for semantic retrieval, and
//! assembles token-budgeted context bundles that a language model turns
//! into reply drafts. Drafts are for review only; nothing is posted.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ Slack events │──▶│ normalize +  │──▶│ per-key gate │
//! │ HTTP / JSONL │   │ event log    │   │   workers    │
//! └──────────────┘   └──────────────┘   └──────┬───────┘
//!                                              │ released
//!                          ┌───────────────────┤
//!                          ▼                   ▼
//!                    ┌──────────┐        ┌──────────┐
//!                    │ profiles │        │ indexer  │
//!                    └────┬─────┘        └────┬─────┘
//!                         └──────┬────────────┘
//!                                ▼
//!                       ┌─────────────────┐   ┌────────────┐
//!                       │ context bundle  │──▶│ LLM draft  │
//!                       └─────────────────┘   └────────────┘
//! ```
//!
//! Pure logic (normalization, gating, profile math, ranking, packing)
//! lives in the `rapport-core` crate. This crate supplies the async
//! runtime pieces, storage, providers, CLI, and HTTP server.
//!
//! ## Quick Start
//!
//! ```bash
//! rapport init
//! rapport import ./slack-export
//! rapport profile U024BE7LH
//! rapport draft U024BE7LH "thank them for the billing fix"
//! rapport serve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`pipeline`] | Wires the stages together |
//! | [`ordering`] | Per-key ordering workers |
//! | [`aggregator`] | Per-user profile updates and snapshots |
//! | [`indexer`] | Chunk, embed, and index queue |
//! | [`assembler`] | Context bundle assembly |
//! | [`generation`] | Reply draft generation |
//! | [`embedding`] | Embedding providers |
//! | [`sqlite_store`] | SQLite storage backend |
//! | [`import`] | Slack history import |
//! | [`documents`] | External document scanning |
//! | [`server`] | HTTP server |
//! | [`stats`] | Counters and the stats report |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod aggregator;
pub mod assembler;
pub mod commands;
pub mod config;
pub mod db;
pub mod documents;
pub mod embedding;
pub mod generation;
pub mod import;
pub mod indexer;
pub mod logging;
pub mod migrate;
pub mod ordering;
pub mod pipeline;
pub mod progress;
pub mod retry;
pub mod server;
pub mod sqlite_store;
pub mod stats;
