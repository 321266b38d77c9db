//! In-memory [`VectorStore`] implementation for tests and offline runs.
//!
//! Uses a `HashMap` behind `std::sync::RwLock` for thread safety.
//! Search is brute-force cosine similarity over every stored vector, with
//! the payload filter applied before ranking.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::embedding::cosine_similarity;
use crate::error::{FusionError, Result};
use crate::models::ProfileRecord;

use super::{paginate, Distance, SearchHit, SearchPage, SearchParams, VectorStore};

/// In-memory store for tests.
pub struct InMemoryStore {
    dimension: RwLock<Option<usize>>,
    records: RwLock<HashMap<String, ProfileRecord>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            dimension: RwLock::new(None),
            records: RwLock::new(HashMap::new()),
        }
    }

    fn poisoned() -> FusionError {
        FusionError::external("memory store", "lock poisoned", false)
    }

    fn check_dims(&self, actual: usize) -> Result<()> {
        let dim = self.dimension.read().map_err(|_| Self::poisoned())?;
        match *dim {
            Some(expected) if expected != actual => {
                Err(FusionError::DimensionMismatch { expected, actual })
            }
            _ => Ok(()),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VectorStore for InMemoryStore {
    async fn ensure_collection(&self, dimension: usize, _distance: Distance) -> Result<()> {
        let mut dim = self.dimension.write().map_err(|_| Self::poisoned())?;
        match *dim {
            Some(existing) if existing != dimension => Err(FusionError::DimensionMismatch {
                expected: existing,
                actual: dimension,
            }),
            Some(_) => Ok(()),
            None => {
                *dim = Some(dimension);
                Ok(())
            }
        }
    }

    async fn exists(&self, profile_id: &str) -> Result<bool> {
        let records = self.records.read().map_err(|_| Self::poisoned())?;
        Ok(records.contains_key(profile_id))
    }

    async fn get(&self, profile_id: &str) -> Result<Option<ProfileRecord>> {
        let records = self.records.read().map_err(|_| Self::poisoned())?;
        Ok(records.get(profile_id).cloned())
    }

    async fn upsert(&self, record: ProfileRecord) -> Result<()> {
        self.check_dims(record.vector.len())?;
        let mut records = self.records.write().map_err(|_| Self::poisoned())?;
        records.insert(record.id.clone(), record);
        Ok(())
    }

    async fn set_payload(&self, profile_id: &str, fields: Map<String, Value>) -> Result<bool> {
        let mut records = self.records.write().map_err(|_| Self::poisoned())?;
        match records.get_mut(profile_id) {
            Some(record) => {
                record.payload.merge(&fields);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn search(&self, query: &[f32], params: &SearchParams) -> Result<SearchPage> {
        self.check_dims(query.len())?;
        let records = self.records.read().map_err(|_| Self::poisoned())?;

        let hits: Vec<SearchHit> = records
            .values()
            .filter(|r| params.filter.is_empty() || params.filter.matches(&r.payload.to_json()))
            .map(|r| SearchHit {
                score: cosine_similarity(query, &r.vector),
                record: r.clone(),
            })
            .filter(|h| params.min_score.map_or(true, |min| h.score >= min))
            .collect();

        Ok(paginate(hits, params.offset, params.limit))
    }

    async fn count(&self) -> Result<usize> {
        let records = self.records.read().map_err(|_| Self::poisoned())?;
        Ok(records.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AccountLabel, ProfilePayload};
    use crate::store::PayloadFilter;

    fn record(id: &str, vector: Vec<f32>) -> ProfileRecord {
        ProfileRecord {
            id: id.to_string(),
            vector,
            payload: ProfilePayload {
                username: Some(format!("user_{}", id)),
                ..Default::default()
            },
        }
    }

    async fn seeded_store() -> InMemoryStore {
        let store = InMemoryStore::new();
        store.ensure_collection(2, Distance::Cosine).await.unwrap();
        for i in 0..10u32 {
            let angle = i as f32 * 0.1;
            store
                .upsert(record(&format!("p{:02}", i), vec![angle.cos(), angle.sin()]))
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_upsert_then_search_top_hit() {
        let store = InMemoryStore::new();
        store.ensure_collection(3, Distance::Cosine).await.unwrap();
        store.upsert(record("a", vec![1.0, 0.0, 0.0])).await.unwrap();
        store.upsert(record("b", vec![0.0, 1.0, 0.0])).await.unwrap();

        let page = store
            .search(&[0.0, 1.0, 0.0], &SearchParams::default())
            .await
            .unwrap();
        assert_eq!(page.hits[0].record.id, "b");
        assert!((page.hits[0].score - 1.0).abs() < 1e-6);
        assert!(!page.has_more);
    }

    #[tokio::test]
    async fn test_upsert_overwrites() {
        let store = InMemoryStore::new();
        store.upsert(record("a", vec![1.0, 0.0])).await.unwrap();
        store.upsert(record("a", vec![0.0, 1.0])).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 1);
        let got = store.get("a").await.unwrap().unwrap();
        assert_eq!(got.vector, vec![0.0, 1.0]);
    }

    #[tokio::test]
    async fn test_pagination_matches_global_ranking() {
        let store = seeded_store().await;
        let query = [1.0, 0.0];

        let all = store
            .search(
                &query,
                &SearchParams {
                    limit: 100,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(all.hits.len(), 10);

        for (offset, limit) in [(0, 3), (3, 3), (8, 5), (10, 2)] {
            let page = store
                .search(
                    &query,
                    &SearchParams {
                        limit,
                        offset,
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
            let expected: Vec<&str> = all
                .hits
                .iter()
                .skip(offset)
                .take(limit)
                .map(|h| h.record.id.as_str())
                .collect();
            let got: Vec<&str> = page.hits.iter().map(|h| h.record.id.as_str()).collect();
            assert_eq!(got, expected, "window offset={} limit={}", offset, limit);
            assert_eq!(page.has_more, offset + limit < 10);
        }
    }

    #[tokio::test]
    async fn test_ties_break_by_id() {
        let store = InMemoryStore::new();
        for id in ["c", "a", "b"] {
            store.upsert(record(id, vec![1.0, 0.0])).await.unwrap();
        }
        let page = store
            .search(&[1.0, 0.0], &SearchParams::default())
            .await
            .unwrap();
        let ids: Vec<&str> = page.hits.iter().map(|h| h.record.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_filter_applies_before_ranking() {
        let store = seeded_store().await;
        store
            .set_payload(
                "p09",
                serde_json::json!({"account_type": "brand"})
                    .as_object()
                    .cloned()
                    .unwrap(),
            )
            .await
            .unwrap();

        let page = store
            .search(
                &[1.0, 0.0],
                &SearchParams {
                    limit: 1,
                    filter: PayloadFilter::new().account_type(AccountLabel::Brand),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        // The least similar profile is still returned: filtering happens first.
        assert_eq!(page.hits.len(), 1);
        assert_eq!(page.hits[0].record.id, "p09");
        assert!(!page.has_more);
    }

    #[tokio::test]
    async fn test_min_score_cutoff() {
        let store = seeded_store().await;
        let page = store
            .search(
                &[1.0, 0.0],
                &SearchParams {
                    limit: 100,
                    min_score: Some(0.99),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(page.hits.iter().all(|h| h.score >= 0.99));
        assert!(page.hits.len() < 10);
    }

    #[tokio::test]
    async fn test_dimension_checks() {
        let store = InMemoryStore::new();
        store.ensure_collection(2, Distance::Cosine).await.unwrap();
        store.ensure_collection(2, Distance::Cosine).await.unwrap();
        assert!(matches!(
            store.ensure_collection(3, Distance::Cosine).await,
            Err(FusionError::DimensionMismatch { .. })
        ));
        assert!(matches!(
            store.upsert(record("x", vec![1.0, 0.0, 0.0])).await,
            Err(FusionError::DimensionMismatch { .. })
        ));
        assert!(!store.exists("x").await.unwrap());
    }

    #[tokio::test]
    async fn test_set_payload_missing_profile() {
        let store = InMemoryStore::new();
        assert!(!store.set_payload("nobody", Map::new()).await.unwrap());
    }
}
