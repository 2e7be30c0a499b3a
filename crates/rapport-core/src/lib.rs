//! # Rapport Core
//!
//! Runtime-free logic for Rapport: the canonical event model, the Slack
//! event normalizer, the per-key dedup and ordering gate, idempotent
//! profile aggregation, chunking and chunk lineage, and context ranking
//! and packing.
//!
//! This crate contains no tokio, sqlx, network, or filesystem I/O. The
//! `rapport` app crate drives these pieces from async workers and supplies
//! the persistent stores and embedding providers.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`models`] | Canonical events, profiles, chunks, bundles |
//! | [`error`] | Error, warning, and degradation taxonomy |
//! | [`normalize`] | Raw Slack event → [`models::CanonicalEvent`] |
//! | [`gate`] | Per-(channel, user) dedup and reordering |
//! | [`topics`] | Pluggable topic extraction |
//! | [`signals`] | Sentiment, engagement, and keyword signals |
//! | [`persona`] | Persona classification from profile tallies |
//! | [`profile`] | Idempotent profile apply with a per-user ledger |
//! | [`chunk`] | Paragraph chunker with deterministic chunk ids |
//! | [`lineage`] | Supersession decisions for indexed chunks |
//! | [`embedding`] | Vector helpers and the offline hashing embedder |
//! | [`context`] | Ranking, near-duplicate removal, budget packing |
//! | [`store`] | Profile, vector index, and event log contracts |

pub mod chunk;
pub mod context;
pub mod embedding;
pub mod error;
pub mod gate;
pub mod lineage;
pub mod models;
pub mod normalize;
pub mod persona;
pub mod profile;
pub mod signals;
pub mod store;
pub mod topics;
