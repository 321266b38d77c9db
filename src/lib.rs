//! # Profile Fusion
//!
//! Multi-modal profile indexing, hybrid image+text search, and
//! rate-limited human vs brand account classification.
//!
//! Every profile (bio, profile picture, post captions, post images) is
//! embedded component by component, fused into one vector with a weight
//! per content kind, and stored in a vector index with its metadata.
//! Queries are embedded into the same space, and hybrid queries blend a
//! reference image with the query text using weights chosen per query.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────────┐   ┌──────────┐
//! │  Profiles   │──▶│  Indexer          │──▶│  Qdrant  │
//! │  (JSONL)    │   │ Embed+Aggregate  │   │ vectors  │
//! └─────────────┘   └──────────────────┘   └────┬─────┘
//!                                               │
//!                ┌──────────────────────────────┤
//!                ▼                              ▼
//!         ┌─────────────┐               ┌──────────────┐
//!         │  Search     │               │  Classifier  │
//!         │ text/hybrid │               │ centroid+LLM │
//!         └─────────────┘               └──────────────┘
//! ```
//!
//! The pure domain logic (aggregation, weighting, reconciliation, rate
//! budgets, the store contract) lives in `profile-fusion-core`; this crate
//! adds the network clients, the progress database, and the CLI.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`source`] | Profile JSONL reader |
//! | [`embedding`] | Embedding model implementations |
//! | [`images`] | Image fetching, validation, and cache |
//! | [`qdrant`] | Qdrant REST vector store |
//! | [`llm`] | Chat completion client |
//! | [`weight_analyzer`] | Hybrid query weighting |
//! | [`indexer`] | Indexing pipeline |
//! | [`classifier`] | Account classification pipeline |
//! | [`search`] | Text and hybrid search |
//! | [`batch`] | Bounded-concurrency batch runner |
//! | [`db`] | Progress database |
//! | [`migrate`] | Schema migrations |

pub mod app;
pub mod batch;
pub mod classifier;
pub mod commands;
pub mod config;
pub mod db;
pub mod embedding;
pub mod images;
pub mod indexer;
pub mod llm;
pub mod logging;
pub mod migrate;
pub mod progress;
pub mod qdrant;
pub mod retry;
pub mod search;
pub mod source;
pub mod weight_analyzer;
