//! Vector store abstraction for profile fusion.
//!
//! The [`VectorStore`] trait defines every operation the indexing, search
//! and classification pipelines need, enabling pluggable backends (Qdrant
//! over REST in the app crate, in-memory here for tests).
//!
//! Implementations must be `Send + Sync` to work with async runtimes.
//!
//! # Ranking contract
//!
//! Results are ordered by descending score with ties broken by ascending
//! profile id, filters are applied before ranking, and a page request
//! returns exactly the window `[offset, offset + limit)` of that global
//! order. `has_more` is true iff at least one further match exists beyond
//! the window.

pub mod memory;

use std::cmp::Ordering;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;
use crate::models::{AccountLabel, FollowerTier, ProfileRecord};

/// Similarity metric of a collection. Profile vectors are compared by
/// cosine only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Distance {
    Cosine,
}

impl fmt::Display for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Distance::Cosine => "Cosine",
        };
        f.write_str(s)
    }
}

/// A single payload condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Condition {
    /// Field equals the given value.
    Match { key: String, value: Value },
    /// Numeric field within an inclusive range. Either bound may be open.
    Range {
        key: String,
        gte: Option<f64>,
        lte: Option<f64>,
    },
}

impl Condition {
    /// Evaluate against a JSON payload. A missing field never matches.
    pub fn matches(&self, payload: &Map<String, Value>) -> bool {
        match self {
            Condition::Match { key, value } => payload.get(key) == Some(value),
            Condition::Range { key, gte, lte } => {
                let Some(x) = payload.get(key).and_then(Value::as_f64) else {
                    return false;
                };
                gte.map_or(true, |lo| x >= lo) && lte.map_or(true, |hi| x <= hi)
            }
        }
    }
}

/// Conjunction of payload conditions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PayloadFilter {
    pub must: Vec<Condition>,
}

impl PayloadFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.must.is_empty()
    }

    pub fn matching(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.must.push(Condition::Match {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn range(mut self, key: impl Into<String>, gte: Option<f64>, lte: Option<f64>) -> Self {
        if gte.is_some() || lte.is_some() {
            self.must.push(Condition::Range {
                key: key.into(),
                gte,
                lte,
            });
        }
        self
    }

    pub fn account_type(self, label: AccountLabel) -> Self {
        self.matching("account_type", label.as_str())
    }

    pub fn category(self, tier: FollowerTier) -> Self {
        self.matching("category", tier.as_str())
    }

    pub fn private(self, is_private: bool) -> Self {
        self.matching("is_private", is_private)
    }

    pub fn followers(self, min: Option<u64>, max: Option<u64>) -> Self {
        self.range(
            "follower_count",
            min.map(|v| v as f64),
            max.map(|v| v as f64),
        )
    }

    pub fn matches(&self, payload: &Map<String, Value>) -> bool {
        self.must.iter().all(|c| c.matches(payload))
    }
}

/// Paging, filtering and score cutoff for one search.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchParams {
    pub limit: usize,
    pub offset: usize,
    pub filter: PayloadFilter,
    /// Drop hits scoring below this value.
    pub min_score: Option<f32>,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            limit: 10,
            offset: 0,
            filter: PayloadFilter::default(),
            min_score: None,
        }
    }
}

/// One ranked result.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub record: ProfileRecord,
    pub score: f32,
}

/// A window of ranked results.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchPage {
    pub hits: Vec<SearchHit>,
    pub has_more: bool,
}

/// Order hits by descending score, ties by ascending profile id.
pub fn rank_order(a: &SearchHit, b: &SearchHit) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.record.id.cmp(&b.record.id))
}

/// Sort `hits` globally and cut out the requested window.
///
/// Shared by every backend that has to rank client-side.
pub fn paginate(mut hits: Vec<SearchHit>, offset: usize, limit: usize) -> SearchPage {
    hits.sort_by(rank_order);
    let has_more = hits.len() > offset.saturating_add(limit);
    let hits = hits.into_iter().skip(offset).take(limit).collect();
    SearchPage { hits, has_more }
}

/// Abstract vector index of profile records.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`ensure_collection`](VectorStore::ensure_collection) | Create the collection, or check an existing one |
/// | [`exists`](VectorStore::exists) | Whether a profile is indexed |
/// | [`get`](VectorStore::get) | Fetch a stored record |
/// | [`upsert`](VectorStore::upsert) | Insert or overwrite a record |
/// | [`set_payload`](VectorStore::set_payload) | Merge fields into a stored payload |
/// | [`search`](VectorStore::search) | Filtered, paginated similarity search |
/// | [`count`](VectorStore::count) | Number of stored records |
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Idempotent. Fails with `DimensionMismatch` if the collection exists
    /// with a different vector size.
    async fn ensure_collection(&self, dimension: usize, distance: Distance) -> Result<()>;

    async fn exists(&self, profile_id: &str) -> Result<bool>;

    async fn get(&self, profile_id: &str) -> Result<Option<ProfileRecord>>;

    /// Overwrite by id; the last write wins.
    async fn upsert(&self, record: ProfileRecord) -> Result<()>;

    /// Merge `fields` into the payload of an existing record. Returns
    /// `false` when the profile is not stored.
    async fn set_payload(&self, profile_id: &str, fields: Map<String, Value>) -> Result<bool>;

    async fn search(&self, query: &[f32], params: &SearchParams) -> Result<SearchPage>;

    async fn count(&self) -> Result<usize>;
}
