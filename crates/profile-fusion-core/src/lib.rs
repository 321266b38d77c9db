//! # Profile Fusion Core
//!
//! Runtime-free logic for profile fusion: the data model, the error
//! taxonomy, weight tables and keyword weight scoring, weighted embedding
//! aggregation, the vector store trait with an in-memory backend, rate
//! budgets, retry policy, and human/brand vote reconciliation.
//!
//! This crate contains no tokio, HTTP, or filesystem I/O. Network-backed
//! capabilities (embedding models, language models, Qdrant) are implemented
//! in the `profile-fusion` app crate against the traits defined here.

pub mod aggregate;
pub mod classify;
pub mod embedding;
pub mod error;
pub mod models;
pub mod ratelimit;
pub mod retry;
pub mod store;
pub mod weights;

pub use error::{FusionError, Result};
