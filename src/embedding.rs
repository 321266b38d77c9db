//! Embedding model implementations.
//!
//! Implements the core [`EmbeddingModel`] trait for:
//! - **[`DisabledModel`]**: returns errors; used when embeddings are not configured.
//! - **[`HttpEmbeddingModel`]**: a multimodal embeddings endpoint (Jina CLIP
//!   style) that accepts `{"text": ...}` and `{"image": <base64>}` inputs.
//! - **[`LocalClipModel`]**: CLIP ViT-B/32 text and vision encoders run
//!   locally via fastembed; no network calls after the model download.
//!
//! Each call is a single attempt. The pipelines wrap calls in the shared
//! retry executor, so transient errors are reported as retryable:
//! - HTTP 429 (rate limited) and 5xx (server error) → retryable
//! - HTTP 4xx (client error, not 429) → fatal
//! - Network errors → retryable

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;

use profile_fusion_core::embedding::EmbeddingModel;
use profile_fusion_core::FusionError;

use crate::config::{api_key_from_env, EmbeddingConfig};

// ============ Disabled Model ============

/// A no-op model that always returns errors.
pub struct DisabledModel;

#[async_trait]
impl EmbeddingModel for DisabledModel {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn embed_text(&self, _text: &str) -> Result<Vec<f32>, FusionError> {
        Err(FusionError::Config(
            "embedding provider is disabled".to_string(),
        ))
    }
    async fn embed_image(&self, _image: &[u8]) -> Result<Vec<f32>, FusionError> {
        Err(FusionError::Config(
            "embedding provider is disabled".to_string(),
        ))
    }
}

// ============ HTTP Model ============

/// Embedding model behind an HTTP endpoint.
pub struct HttpEmbeddingModel {
    http: Client,
    url: String,
    model: String,
    api_key: Option<String>,
    dims: usize,
}

impl HttpEmbeddingModel {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let url = config
            .url
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.url required for http provider"))?;
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for http provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for http provider"))?;
        let api_key = match &config.api_key_env {
            Some(var) => Some(api_key_from_env(var)?),
            None => None,
        };
        Ok(Self {
            http: Client::new(),
            url,
            model,
            api_key,
            dims,
        })
    }

    async fn embed_input(&self, input: serde_json::Value) -> Result<Vec<f32>, FusionError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": [input],
        });

        let mut request = self.http.post(&self.url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| FusionError::external("embedding", e.to_string(), true))?;

        let status = response.status();
        if !status.is_success() {
            let retryable = status.as_u16() == 429 || status.is_server_error();
            let text = response.text().await.unwrap_or_default();
            return Err(FusionError::external(
                "embedding",
                format!("HTTP {}: {}", status, text),
                retryable,
            ));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| FusionError::external("embedding", e.to_string(), true))?;
        let mut vectors = parse_embedding_response(&json)?;
        let vector = vectors
            .pop()
            .ok_or_else(|| FusionError::external("embedding", "empty data array", false))?;
        check_dims(self.dims, vector)
    }
}

#[async_trait]
impl EmbeddingModel for HttpEmbeddingModel {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed_text(&self, text: &str) -> Result<Vec<f32>, FusionError> {
        self.embed_input(serde_json::json!({ "text": text })).await
    }
    async fn embed_image(&self, image: &[u8]) -> Result<Vec<f32>, FusionError> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(image);
        self.embed_input(serde_json::json!({ "image": encoded })).await
    }
}

/// Parse an embeddings API response.
///
/// Extracts the `data[].embedding` arrays, ordered by `data[].index` when
/// present.
pub fn parse_embedding_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, FusionError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| FusionError::external("embedding", "response missing data array", false))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| FusionError::external("embedding", "response missing embedding", false))?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(pos);
        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        indexed.push((index, vec));
    }
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

fn check_dims(expected: usize, vector: Vec<f32>) -> Result<Vec<f32>, FusionError> {
    if vector.len() != expected {
        return Err(FusionError::DimensionMismatch {
            expected,
            actual: vector.len(),
        });
    }
    Ok(vector)
}

// ============ Local CLIP Model (fastembed) ============

/// CLIP ViT-B/32 text and vision encoders via fastembed.
///
/// Both encoders are loaded lazily on first use and kept for the life of
/// the process. Inference runs on the blocking thread pool.
#[cfg(feature = "local-embeddings-fastembed")]
pub struct LocalClipModel {
    text: Arc<std::sync::Mutex<Option<fastembed::TextEmbedding>>>,
    image: Arc<std::sync::Mutex<Option<fastembed::ImageEmbedding>>>,
    dims: usize,
}

#[cfg(feature = "local-embeddings-fastembed")]
impl LocalClipModel {
    /// CLIP ViT-B/32 embeds into 512 dimensions.
    pub const DIMS: usize = 512;

    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config.model.as_deref().unwrap_or("clip-vit-b-32");
        if model != "clip-vit-b-32" {
            bail!(
                "Unknown local embedding model: '{}'. Supported: clip-vit-b-32",
                model
            );
        }
        let dims = config.dims.unwrap_or(Self::DIMS);
        if dims != Self::DIMS {
            bail!("embedding.dims must be {} for clip-vit-b-32", Self::DIMS);
        }
        Ok(Self {
            text: Arc::new(std::sync::Mutex::new(None)),
            image: Arc::new(std::sync::Mutex::new(None)),
            dims,
        })
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
fn local_err(e: impl std::fmt::Display) -> FusionError {
    FusionError::external("local embedding", e.to_string(), false)
}

#[cfg(feature = "local-embeddings-fastembed")]
#[async_trait]
impl EmbeddingModel for LocalClipModel {
    fn model_name(&self) -> &str {
        "clip-vit-b-32"
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_text(&self, text: &str) -> Result<Vec<f32>, FusionError> {
        let slot = self.text.clone();
        let text = text.to_string();
        let dims = self.dims;
        tokio::task::spawn_blocking(move || {
            let mut guard = slot.lock().map_err(local_err)?;
            if guard.is_none() {
                let model = fastembed::TextEmbedding::try_new(
                    fastembed::InitOptions::new(fastembed::EmbeddingModel::ClipVitB32)
                        .with_show_download_progress(true),
                )
                .map_err(local_err)?;
                *guard = Some(model);
            }
            let model = guard
                .as_mut()
                .ok_or_else(|| local_err("text encoder not loaded"))?;
            let mut out = model.embed(vec![text], None).map_err(local_err)?;
            let vector = out.pop().ok_or_else(|| local_err("no embedding returned"))?;
            check_dims(dims, vector)
        })
        .await
        .map_err(local_err)?
    }

    async fn embed_image(&self, image: &[u8]) -> Result<Vec<f32>, FusionError> {
        let slot = self.image.clone();
        let bytes = image.to_vec();
        let dims = self.dims;
        tokio::task::spawn_blocking(move || {
            let mut guard = slot.lock().map_err(local_err)?;
            if guard.is_none() {
                let model = fastembed::ImageEmbedding::try_new(
                    fastembed::ImageInitOptions::new(fastembed::ImageEmbeddingModel::ClipVitB32)
                        .with_show_download_progress(true),
                )
                .map_err(local_err)?;
                *guard = Some(model);
            }
            let model = guard
                .as_mut()
                .ok_or_else(|| local_err("image encoder not loaded"))?;
            let mut out = model
                .embed_bytes(&[bytes.as_slice()], None)
                .map_err(local_err)?;
            let vector = out.pop().ok_or_else(|| local_err("no embedding returned"))?;
            check_dims(dims, vector)
        })
        .await
        .map_err(local_err)?
    }
}

/// Create the [`EmbeddingModel`] named by the configuration.
///
/// | Config Value | Model |
/// |-------------|-------|
/// | `"disabled"` | [`DisabledModel`] |
/// | `"http"` | [`HttpEmbeddingModel`] |
/// | `"local"` | `LocalClipModel` (feature `local-embeddings-fastembed`) |
pub fn create_model(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingModel>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledModel)),
        "http" => Ok(Arc::new(HttpEmbeddingModel::new(config)?)),
        #[cfg(feature = "local-embeddings-fastembed")]
        "local" => Ok(Arc::new(LocalClipModel::new(config)?)),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "local" => bail!("Local embedding provider requires --features local-embeddings-fastembed"),
        other => bail!("Unknown embedding provider: {}", other),
    }
}
