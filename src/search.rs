//! Text and hybrid image+text profile search.
//!
//! Both modes build a query vector in the same space as the stored profile
//! vectors (same model, same reducer) and hand it to the vector store with
//! the payload filter and paging parameters.
//!
//! Hybrid search asks the [`WeightAnalyzer`] how much the query is about
//! the reference image versus the text, then blends the two embeddings
//! with that split. A reference image that cannot be resolved degrades the
//! search to text only; the reason is reported in `degraded`.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use profile_fusion_core::aggregate::EmbeddingAggregator;
use profile_fusion_core::embedding::EmbeddingModel;
use profile_fusion_core::models::{AccountLabel, FollowerTier, HybridQuery};
use profile_fusion_core::retry::RetryPolicy;
use profile_fusion_core::store::{PayloadFilter, SearchHit, SearchParams, VectorStore};
use profile_fusion_core::weights::HybridWeights;
use profile_fusion_core::FusionError;

use crate::images::ImageProcessor;
use crate::retry::retry;
use crate::weight_analyzer::{WeightAnalyzer, WeightSource};

/// Payload filters exposed on the command line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchFilters {
    pub account_type: Option<AccountLabel>,
    pub category: Option<FollowerTier>,
    pub min_followers: Option<u64>,
    pub max_followers: Option<u64>,
    pub is_private: Option<bool>,
}

impl SearchFilters {
    pub fn to_filter(&self) -> PayloadFilter {
        let mut f = PayloadFilter::new();
        if let Some(label) = self.account_type {
            f = f.account_type(label);
        }
        if let Some(tier) = self.category {
            f = f.category(tier);
        }
        if let Some(private) = self.is_private {
            f = f.private(private);
        }
        f.followers(self.min_followers, self.max_followers)
    }
}

/// One result row.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SearchResultItem {
    pub profile_id: String,
    pub score: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bio: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub follower_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<FollowerTier>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_type: Option<AccountLabel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub influencer_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_private: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_pic_url: Option<String>,
}

impl From<SearchHit> for SearchResultItem {
    fn from(hit: SearchHit) -> Self {
        let p = hit.record.payload;
        Self {
            profile_id: hit.record.id,
            score: hit.score,
            username: p.username,
            full_name: p.full_name,
            bio: p.bio,
            follower_count: p.follower_count,
            category: p.category,
            account_type: p.account_type,
            influencer_type: p.influencer_type,
            is_private: p.is_private,
            profile_pic_url: p.profile_pic_url,
        }
    }
}

/// Search output, shaped like `{query, results, total, has_more, weights?, degraded?}`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SearchResponse {
    pub query: String,
    pub results: Vec<SearchResultItem>,
    pub total: usize,
    pub has_more: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weights: Option<HybridWeights>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight_source: Option<WeightSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degraded: Option<String>,
}

pub struct Searcher {
    pub model: Arc<dyn EmbeddingModel>,
    pub store: Arc<dyn VectorStore>,
    pub images: Arc<ImageProcessor>,
    pub aggregator: Arc<EmbeddingAggregator>,
    pub analyzer: WeightAnalyzer,
    pub policy: RetryPolicy,
    pub timeout: Duration,
}

impl Searcher {
    async fn embed_text(&self, text: &str) -> Result<Vec<f32>, FusionError> {
        let model = self.model.as_ref();
        retry(&self.policy, "embed query", self.timeout, move || {
            model.embed_text(text)
        })
        .await
    }

    async fn embed_image(&self, bytes: &[u8]) -> Result<Vec<f32>, FusionError> {
        let model = self.model.as_ref();
        retry(&self.policy, "embed query image", self.timeout, move || {
            model.embed_image(bytes)
        })
        .await
    }

    /// Text-only similarity search.
    pub async fn search_text(
        &self,
        query: &str,
        params: &SearchParams,
    ) -> Result<SearchResponse, FusionError> {
        if query.trim().is_empty() {
            return Err(FusionError::InsufficientData("empty query".to_string()));
        }
        let raw = self.embed_text(query).await?;
        let vector = self.aggregator.project(&raw)?;
        let page = self.store.search(vector.as_slice(), params).await?;
        Ok(SearchResponse {
            query: query.to_string(),
            total: page.hits.len(),
            has_more: page.has_more,
            results: page.hits.into_iter().map(SearchResultItem::from).collect(),
            weights: None,
            weight_source: None,
            degraded: None,
        })
    }

    /// Hybrid search against a reference image.
    pub async fn search_hybrid(
        &self,
        query: &str,
        image_url: &str,
        params: &SearchParams,
    ) -> Result<SearchResponse, FusionError> {
        let analysis = self.analyzer.analyze(query).await;
        let hybrid = HybridQuery {
            raw_text: query.to_string(),
            image_reference: Some(image_url.to_string()),
            weights: analysis.weights,
        };
        let mut degraded = analysis.degraded.clone();

        let image = match self.images.resolve(image_url).await {
            Ok(bytes) => Some(self.embed_image(&bytes).await?),
            Err(e) => {
                tracing::warn!(url = image_url, error = %e, "reference image unusable; searching text only");
                degraded = Some(match degraded {
                    Some(prev) => format!("{}; reference image unusable: {}", prev, e),
                    None => format!("reference image unusable: {}", e),
                });
                None
            }
        };

        let (vector, weights) = match (image, hybrid.raw_text.trim().is_empty()) {
            (None, true) => {
                return Err(FusionError::InsufficientData(
                    "empty query and no usable reference image".to_string(),
                ))
            }
            (None, false) => {
                let text = self.embed_text(&hybrid.raw_text).await?;
                (self.aggregator.aggregate_query(None, &text, hybrid.weights)?, HybridWeights::text_only())
            }
            // Blank text: the image alone decides.
            (Some(image), true) => (
                self.aggregator.aggregate_query(Some(&image), &image, hybrid.weights)?,
                HybridWeights::from_image(1.0),
            ),
            (Some(image), false) => {
                let text = self.embed_text(&hybrid.raw_text).await?;
                (
                    self.aggregator.aggregate_query(Some(&image), &text, hybrid.weights)?,
                    hybrid.weights,
                )
            }
        };

        tracing::info!(
            image = weights.image,
            text = weights.text,
            source = ?analysis.source,
            "hybrid weights"
        );
        let page = self.store.search(vector.as_slice(), params).await?;
        Ok(SearchResponse {
            query: hybrid.raw_text,
            total: page.hits.len(),
            has_more: page.has_more,
            results: page.hits.into_iter().map(SearchResultItem::from).collect(),
            weights: Some(weights),
            weight_source: Some(analysis.source),
            degraded,
        })
    }
}

/// Print results for humans.
pub fn print_response(response: &SearchResponse) {
    if let Some(w) = response.weights {
        println!("weights: image {:.1} / text {:.1}", w.image, w.text);
    }
    if let Some(reason) = &response.degraded {
        println!("degraded: {}", reason);
    }
    if response.results.is_empty() {
        println!("No results.");
        return;
    }
    for (i, r) in response.results.iter().enumerate() {
        println!(
            "{}. [{:.3}] {}",
            i + 1,
            r.score,
            r.username.as_deref().unwrap_or(&r.profile_id)
        );
        if let Some(name) = &r.full_name {
            println!("    name: {}", name);
        }
        if let Some(count) = r.follower_count {
            let tier = r.category.map(|t| t.to_string()).unwrap_or_default();
            println!("    followers: {} {}", count, tier);
        }
        if let Some(label) = r.account_type {
            println!("    account: {}", label);
        }
        if let Some(bio) = &r.bio {
            println!("    bio: \"{}\"", bio.replace('\n', " ").trim());
        }
        println!("    id: {}", r.profile_id);
        println!();
    }
    if response.has_more {
        println!("More results available (use --offset).");
    }
}
