//! Indexing pipeline: profiles → component embeddings → fused vector → store.
//!
//! For each profile:
//!
//! 1. Skip it when its content hash matches the last indexed one and the
//!    store still has it (or when the store has it and no hash is known).
//! 2. Embed the bio and each caption as text, and every image that
//!    resolves as an image. An image that fails validation only drops that
//!    component.
//! 3. Fuse the components with the [`EmbeddingAggregator`].
//! 4. Upsert into the vector store, then record the content hash.
//!
//! Cancellation is checked right before the upsert, so an interrupted
//! profile is neither stored nor recorded.

use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;

use profile_fusion_core::aggregate::EmbeddingAggregator;
use profile_fusion_core::embedding::EmbeddingModel;
use profile_fusion_core::models::{ComponentVector, ProfileRecord, SourceKind};
use profile_fusion_core::retry::RetryPolicy;
use profile_fusion_core::store::VectorStore;
use profile_fusion_core::FusionError;

use crate::batch::{run_batch, BatchReport, CancelFlag, ProfileOutcome};
use crate::db;
use crate::images::ImageProcessor;
use crate::progress::ProgressReporter;
use crate::retry::retry;
use crate::source::ProfileInput;

pub struct Indexer {
    pub model: Arc<dyn EmbeddingModel>,
    pub store: Arc<dyn VectorStore>,
    pub images: Arc<ImageProcessor>,
    pub aggregator: Arc<EmbeddingAggregator>,
    pub pool: SqlitePool,
    pub policy: RetryPolicy,
    pub timeout: Duration,
    pub skip_existing: bool,
}

/// Turn a failure into a per-profile outcome, or escalate it.
///
/// A transient error that survived every retry means the dependency is
/// down; that halts the batch instead of failing every remaining profile.
fn classify_failure(e: FusionError) -> Result<ProfileOutcome, FusionError> {
    if e.is_retryable() {
        Err(e)
    } else {
        Ok(ProfileOutcome::Failed(e.to_string()))
    }
}

impl Indexer {
    /// Index every profile with at most `concurrency` in flight.
    pub async fn run(
        self: &Arc<Self>,
        profiles: Vec<ProfileInput>,
        concurrency: usize,
        cancel: &CancelFlag,
        progress: &dyn ProgressReporter,
    ) -> BatchReport {
        let this = self.clone();
        run_batch(
            "index",
            profiles,
            |p: &ProfileInput| p.id.clone(),
            concurrency,
            cancel,
            progress,
            move |profile, halt| {
                let this = this.clone();
                async move { this.index_one(&profile, &halt).await }
            },
        )
        .await
    }

    /// Index a single profile. `Err` is reserved for batch-halting failures.
    pub async fn index_one(
        &self,
        profile: &ProfileInput,
        cancel: &CancelFlag,
    ) -> Result<ProfileOutcome, FusionError> {
        if cancel.is_cancelled() {
            return Ok(ProfileOutcome::Cancelled);
        }

        let hash = profile.content_hash();
        if self.skip_existing {
            let recorded = db::indexed_hash(&self.pool, &profile.id)
                .await
                .map_err(|e| FusionError::external("progress db", e.to_string(), false))?;
            if recorded.as_deref().map_or(true, |h| h == hash) {
                let stored = match self.store.exists(&profile.id).await {
                    Ok(stored) => stored,
                    Err(e) => return classify_failure(e),
                };
                if stored && recorded.is_some() {
                    return Ok(ProfileOutcome::Skipped("unchanged".to_string()));
                }
                if stored {
                    self.record(&profile.id, &hash).await?;
                    return Ok(ProfileOutcome::Skipped("already stored".to_string()));
                }
            }
        }

        let components = match self.embed_components(profile).await {
            Ok(c) => c,
            Err(e) => return classify_failure(e),
        };
        let vector = match self.aggregator.aggregate(&components) {
            Ok(v) => v,
            Err(e) => return Ok(ProfileOutcome::Failed(e.to_string())),
        };

        if cancel.is_cancelled() {
            return Ok(ProfileOutcome::Cancelled);
        }

        let mut payload = profile.payload();
        match self.store.get(&profile.id).await {
            Ok(Some(previous)) => payload.carry_classification(&previous.payload),
            Ok(None) => {}
            Err(e) => return classify_failure(e),
        }
        let record = ProfileRecord {
            id: profile.id.clone(),
            vector: vector.into_inner(),
            payload,
        };
        if let Err(e) = self.store.upsert(record).await {
            return classify_failure(e);
        }
        self.record(&profile.id, &hash).await?;

        tracing::debug!(profile_id = %profile.id, components = components.len(), "indexed");
        Ok(ProfileOutcome::Done(format!(
            "indexed ({} components)",
            components.len()
        )))
    }

    async fn record(&self, profile_id: &str, hash: &str) -> Result<(), FusionError> {
        db::record_indexed(&self.pool, profile_id, hash)
            .await
            .map_err(|e| FusionError::external("progress db", e.to_string(), false))
    }

    async fn embed_text(&self, text: &str) -> Result<Vec<f32>, FusionError> {
        let model = self.model.as_ref();
        retry(&self.policy, "embed text", self.timeout, move || {
            model.embed_text(text)
        })
        .await
    }

    async fn embed_image_url(&self, profile_id: &str, url: &str) -> Result<Option<Vec<f32>>, FusionError> {
        let bytes = match self.images.resolve(url).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(profile_id, url, error = %e, "skipping image");
                return Ok(None);
            }
        };
        let model = self.model.as_ref();
        let bytes = bytes.as_slice();
        let vector = retry(&self.policy, "embed image", self.timeout, move || {
            model.embed_image(bytes)
        })
        .await?;
        Ok(Some(vector))
    }

    /// Collect every component vector the profile yields.
    pub async fn embed_components(
        &self,
        profile: &ProfileInput,
    ) -> Result<Vec<ComponentVector>, FusionError> {
        let mut components = Vec::new();

        if let Some(bio) = profile.bio.as_deref().filter(|b| !b.trim().is_empty()) {
            components.push(ComponentVector::new(SourceKind::Bio, self.embed_text(bio).await?));
        }
        if let Some(url) = profile.profile_pic_url.as_deref() {
            if let Some(v) = self.embed_image_url(&profile.id, url).await? {
                components.push(ComponentVector::new(SourceKind::ProfilePic, v));
            }
        }
        for (i, caption) in profile.captions().enumerate() {
            components.push(ComponentVector::indexed(
                SourceKind::Caption,
                i,
                self.embed_text(caption).await?,
            ));
        }
        for (i, url) in profile.post_image_urls().enumerate() {
            if let Some(v) = self.embed_image_url(&profile.id, url).await? {
                components.push(ComponentVector::indexed(SourceKind::PostImage, i, v));
            }
        }
        Ok(components)
    }
}
