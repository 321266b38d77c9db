//! Wiring from configuration to the concrete components.

use std::sync::Arc;

use anyhow::{bail, Context, Result};

use profile_fusion_core::aggregate::{EmbeddingAggregator, Reducer};
use profile_fusion_core::embedding::EmbeddingModel;
use profile_fusion_core::ratelimit::RateLimiter;
use profile_fusion_core::store::VectorStore;

use crate::classifier::{AccountJudge, LlmAccountJudge};
use crate::config::Config;
use crate::embedding::create_model;
use crate::images::{HttpImageFetcher, ImageProcessor};
use crate::llm::ChatClient;
use crate::qdrant::QdrantStore;
use crate::weight_analyzer::{IntentClassifier, LlmIntentClassifier, WeightAnalyzer};

/// Embedding model, failing early when none is configured.
pub fn model(config: &Config) -> Result<Arc<dyn EmbeddingModel>> {
    if !config.embedding.is_enabled() {
        bail!("No embedding provider configured. Set [embedding] provider in config.");
    }
    create_model(&config.embedding)
}

/// Aggregator matching the model's raw dimensionality.
pub fn aggregator(config: &Config, model: &dyn EmbeddingModel) -> Result<EmbeddingAggregator> {
    let raw = model.dims();
    if let Some(configured) = config.embedding.dims {
        if configured != raw {
            bail!(
                "embedding.dims ({}) does not match model {} ({})",
                configured,
                model.model_name(),
                raw
            );
        }
    }
    let reducer = Reducer::new(raw, config.embedding.output_dims, config.embedding.reduction())
        .context("invalid embedding reduction")?;
    Ok(EmbeddingAggregator::new(
        config.weights,
        reducer,
        config.embedding.normalize,
    )?)
}

pub fn store(config: &Config) -> Result<Arc<dyn VectorStore>> {
    Ok(Arc::new(QdrantStore::new(
        &config.store,
        config.retry.policy(),
    )?))
}

pub fn images(config: &Config) -> ImageProcessor {
    ImageProcessor::new(
        Arc::new(HttpImageFetcher::new(config.images.max_bytes)),
        config.images.cache_dir.clone(),
        config.retry.policy(),
        std::time::Duration::from_secs(config.images.timeout_secs),
    )
}

/// Weight analyzer; keyword-only when `[intent]` is disabled.
pub fn analyzer(config: &Config) -> Result<WeightAnalyzer> {
    if !config.intent.is_enabled() {
        return Ok(WeightAnalyzer::offline());
    }
    let client = ChatClient::from_config(&config.intent)?;
    let classifier: Arc<dyn IntentClassifier> = Arc::new(LlmIntentClassifier::new(client));
    Ok(WeightAnalyzer::new(
        Some(classifier),
        config.retry.policy(),
        config.intent.timeout(),
    ))
}

/// Account judge, or `None` when `[classifier]` has no language model.
pub fn judge(config: &Config) -> Result<Option<Arc<dyn AccountJudge>>> {
    if !config.classifier.llm.is_enabled() {
        return Ok(None);
    }
    let client = ChatClient::from_config(&config.classifier.llm)?;
    Ok(Some(Arc::new(LlmAccountJudge::new(client))))
}

pub fn limiter(config: &Config) -> RateLimiter {
    RateLimiter::with_system_clock(config.classifier.rate_limits())
}
