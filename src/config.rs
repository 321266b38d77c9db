//! TOML configuration.
//!
//! Every section except `[db]` is optional and falls back to defaults, so a
//! minimal file only names the progress database. API keys are never read
//! from the file itself: sections name the environment variable that holds
//! them.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use profile_fusion_core::aggregate::Reduction;
use profile_fusion_core::classify::{DEFAULT_MARGIN_SCALE, DEFAULT_THRESHOLD};
use profile_fusion_core::ratelimit::RateLimits;
use profile_fusion_core::retry::RetryPolicy;
use profile_fusion_core::weights::WeightTable;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub weights: WeightTable,
    #[serde(default)]
    pub intent: LlmConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub images: ImagesConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SourceConfig {
    /// JSON-lines file with one profile per line.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default = "default_store_url")]
    pub url: String,
    #[serde(default = "default_collection")]
    pub collection: String,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub exact_search: bool,
    #[serde(default = "default_hnsw_ef")]
    pub hnsw_ef: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_store_url(),
            collection: default_collection(),
            api_key_env: None,
            timeout_secs: default_timeout_secs(),
            exact_search: false,
            hnsw_ef: default_hnsw_ef(),
        }
    }
}

fn default_store_url() -> String {
    "http://localhost:6333".to_string()
}
fn default_collection() -> String {
    "instagram_profiles".to_string()
}
fn default_hnsw_ef() -> usize {
    128
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `disabled`, `http`, or `local`.
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Endpoint for the `http` provider.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Raw model dimensionality.
    #[serde(default)]
    pub dims: Option<usize>,
    /// Dimensionality of stored and query vectors.
    #[serde(default = "default_output_dims")]
    pub output_dims: usize,
    /// `truncate` or `projection`.
    #[serde(default = "default_reduction")]
    pub reduction: String,
    #[serde(default = "default_projection_seed")]
    pub projection_seed: u64,
    #[serde(default = "default_true")]
    pub normalize: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            url: None,
            api_key_env: None,
            dims: None,
            output_dims: default_output_dims(),
            reduction: default_reduction(),
            projection_seed: default_projection_seed(),
            normalize: true,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    pub fn reduction(&self) -> Reduction {
        match self.reduction.as_str() {
            "projection" => Reduction::Projection {
                seed: self.projection_seed,
            },
            _ => Reduction::Truncate,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_output_dims() -> usize {
    128
}
fn default_reduction() -> String {
    "truncate".to_string()
}
fn default_projection_seed() -> u64 {
    42
}

/// An OpenAI-compatible chat completion endpoint.
#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    /// `disabled` or `openai`.
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default = "default_chat_url")]
    pub url: String,
    #[serde(default = "default_chat_model")]
    pub model: String,
    #[serde(default = "default_llm_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            url: default_chat_url(),
            model: default_chat_model(),
            api_key_env: default_llm_key_env(),
            timeout_secs: default_llm_timeout_secs(),
            max_tokens: default_max_tokens(),
        }
    }
}

impl LlmConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_chat_url() -> String {
    "https://api.openai.com/v1/chat/completions".to_string()
}
fn default_chat_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_llm_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_llm_timeout_secs() -> u64 {
    20
}
fn default_max_tokens() -> u32 {
    150
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClassifierConfig {
    #[serde(flatten)]
    pub llm: LlmConfig,
    #[serde(default = "default_threshold")]
    pub threshold: f32,
    #[serde(default = "default_margin_scale")]
    pub margin_scale: f32,
    #[serde(default = "default_rpm")]
    pub requests_per_minute: Option<u32>,
    #[serde(default)]
    pub tokens_per_minute: Option<u64>,
    #[serde(default = "default_rpd")]
    pub requests_per_day: Option<u32>,
    /// Longest wait for a per-minute window to reset before the language
    /// model vote is given up as unavailable.
    #[serde(default = "default_max_budget_wait_secs")]
    pub max_budget_wait_secs: u64,
    #[serde(default = "default_max_captions")]
    pub max_captions: usize,
    #[serde(default = "default_human_exemplars")]
    pub human_exemplars: Vec<String>,
    #[serde(default = "default_brand_exemplars")]
    pub brand_exemplars: Vec<String>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            llm: LlmConfig::default(),
            threshold: default_threshold(),
            margin_scale: default_margin_scale(),
            requests_per_minute: default_rpm(),
            tokens_per_minute: None,
            requests_per_day: default_rpd(),
            max_budget_wait_secs: default_max_budget_wait_secs(),
            max_captions: default_max_captions(),
            human_exemplars: default_human_exemplars(),
            brand_exemplars: default_brand_exemplars(),
        }
    }
}

impl ClassifierConfig {
    pub fn rate_limits(&self) -> RateLimits {
        RateLimits {
            requests_per_minute: self.requests_per_minute,
            tokens_per_minute: self.tokens_per_minute,
            requests_per_day: self.requests_per_day,
        }
    }
}

fn default_threshold() -> f32 {
    DEFAULT_THRESHOLD
}
fn default_margin_scale() -> f32 {
    DEFAULT_MARGIN_SCALE
}
fn default_rpm() -> Option<u32> {
    Some(10)
}
fn default_rpd() -> Option<u32> {
    Some(1000)
}
fn default_max_budget_wait_secs() -> u64 {
    60
}
fn default_max_captions() -> usize {
    5
}
fn default_human_exemplars() -> Vec<String> {
    [
        "this is a personal account",
        "individual profile",
        "human user account",
        "personal instagram profile",
        "real person's account",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_brand_exemplars() -> Vec<String> {
    [
        "this is a business account",
        "company profile page",
        "brand account",
        "official business profile",
        "corporate instagram account",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ImagesConfig {
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    #[serde(default = "default_image_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,
}

impl Default for ImagesConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            timeout_secs: default_image_timeout_secs(),
            max_bytes: default_max_bytes(),
        }
    }
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("./data/images")
}
fn default_image_timeout_secs() -> u64 {
    15
}
fn default_max_bytes() -> usize {
    10 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_true")]
    pub skip_existing: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            skip_existing: true,
        }
    }
}

fn default_batch_size() -> usize {
    8
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

fn default_max_attempts() -> u32 {
    4
}
fn default_base_delay_ms() -> u64 {
    1_000
}
fn default_max_delay_ms() -> u64 {
    32_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_disabled() -> String {
    "disabled".to_string()
}
fn default_true() -> bool {
    true
}
fn default_timeout_secs() -> u64 {
    30
}

/// Read an API key from the named environment variable.
pub fn api_key_from_env(var: &str) -> Result<String> {
    std::env::var(var).with_context(|| format!("{} environment variable not set", var))
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    // Validate embedding
    match config.embedding.provider.as_str() {
        "disabled" | "http" | "local" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, http, or local.",
            other
        ),
    }
    match config.embedding.reduction.as_str() {
        "truncate" | "projection" => {}
        other => bail!(
            "Unknown embedding.reduction: '{}'. Must be truncate or projection.",
            other
        ),
    }
    if config.embedding.output_dims == 0 {
        bail!("embedding.output_dims must be > 0");
    }
    if config.embedding.is_enabled() {
        let Some(dims) = config.embedding.dims.filter(|d| *d > 0) else {
            bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        };
        if config.embedding.output_dims > dims {
            bail!(
                "embedding.output_dims ({}) must not exceed embedding.dims ({})",
                config.embedding.output_dims,
                dims
            );
        }
        if config.embedding.provider == "http" && config.embedding.url.is_none() {
            bail!("embedding.url must be specified when provider is 'http'");
        }
    }

    // Validate weights
    config
        .weights
        .validate()
        .map_err(|e| anyhow::anyhow!("weights: {}", e))?;

    // Validate language model sections
    for (section, llm) in [("intent", &config.intent), ("classifier", &config.classifier.llm)] {
        match llm.provider.as_str() {
            "disabled" | "openai" => {}
            other => bail!(
                "Unknown {}.provider: '{}'. Must be disabled or openai.",
                section,
                other
            ),
        }
    }

    // Validate classifier
    if !(0.0..=1.0).contains(&config.classifier.threshold) {
        bail!("classifier.threshold must be in [0.0, 1.0]");
    }
    if !(config.classifier.margin_scale > 0.0) {
        bail!("classifier.margin_scale must be > 0");
    }
    if config.classifier.human_exemplars.is_empty() || config.classifier.brand_exemplars.is_empty()
    {
        bail!("classifier.human_exemplars and classifier.brand_exemplars must not be empty");
    }

    if config.pipeline.batch_size == 0 {
        bail!("pipeline.batch_size must be >= 1");
    }
    if config.retry.max_attempts == 0 {
        bail!("retry.max_attempts must be >= 1");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_str: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_str)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn test_minimal_config_defaults() {
        let cfg = parse("[db]\npath = \"./data/pfx.sqlite\"\n").unwrap();
        assert_eq!(cfg.store.collection, "instagram_profiles");
        assert_eq!(cfg.embedding.output_dims, 128);
        assert_eq!(cfg.weights, WeightTable::default());
        assert_eq!(cfg.classifier.threshold, 0.7);
        assert_eq!(cfg.classifier.requests_per_minute, Some(10));
        assert_eq!(cfg.classifier.requests_per_day, Some(1000));
        assert_eq!(cfg.classifier.brand_exemplars.len(), 5);
        assert!(!cfg.intent.is_enabled());
    }

    #[test]
    fn test_classifier_flattened_llm_fields() {
        let cfg = parse(
            r#"
[db]
path = "x.sqlite"

[classifier]
provider = "openai"
model = "gpt-4o"
threshold = 0.8
requests_per_minute = 60
"#,
        )
        .unwrap();
        assert!(cfg.classifier.llm.is_enabled());
        assert_eq!(cfg.classifier.llm.model, "gpt-4o");
        assert_eq!(cfg.classifier.threshold, 0.8);
        assert_eq!(cfg.classifier.rate_limits().requests_per_minute, Some(60));
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(parse("[db]\npath = \"x\"\n[weights]\nbio = -1.0\n").is_err());
        assert!(parse("[db]\npath = \"x\"\n[classifier]\nthreshold = 1.5\n").is_err());
        assert!(parse("[db]\npath = \"x\"\n[embedding]\nprovider = \"local\"\n").is_err());
        assert!(parse(
            "[db]\npath = \"x\"\n[embedding]\nprovider = \"local\"\ndims = 64\noutput_dims = 128\n"
        )
        .is_err());
        assert!(parse("[db]\npath = \"x\"\n[embedding]\nreduction = \"pca\"\n").is_err());
    }

    #[test]
    fn test_projection_reduction() {
        let cfg = parse(
            "[db]\npath = \"x\"\n[embedding]\nprovider = \"local\"\ndims = 512\nreduction = \"projection\"\nprojection_seed = 9\n",
        )
        .unwrap();
        assert_eq!(cfg.embedding.reduction(), Reduction::Projection { seed: 9 });
    }
}
