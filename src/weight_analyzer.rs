//! Image vs text weighting for hybrid queries.
//!
//! [`WeightAnalyzer::analyze`] never fails. It tries, in order:
//!
//! 1. A strong image-intent phrase ("looks like this", ...) → 0.9 / 0.1,
//!    without spending an intent-model call.
//! 2. The [`IntentClassifier`] (a language model asked for
//!    `image_weight: X.X, text_weight: Y.Y`).
//! 3. Deterministic keyword scoring.
//! 4. The neutral 0.5 / 0.5 split.
//!
//! Whenever step 2 was skipped or failed, the result carries a `degraded`
//! reason so callers and logs can tell.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use profile_fusion_core::retry::RetryPolicy;
use profile_fusion_core::weights::{keyword_weights, parse_weight_response, phrase_override, HybridWeights};
use profile_fusion_core::FusionError;

use crate::llm::{ChatClient, ChatMessage};
use crate::retry::retry;

const INTENT_INSTRUCTION: &str = "You weight hybrid image+text searches over social media profiles. \
Given a search query that comes with a reference image, decide how much the results should \
resemble the image (visual similarity) versus match the text (descriptive criteria). \
Queries about appearance, style or looking similar lean towards the image; queries naming \
professions, places, topics or audience lean towards the text. \
Respond with exactly one line in the form: image_weight: X.X, text_weight: Y.Y \
where both values are between 0 and 1 and sum to 1.";

/// Anything that can turn a query into a raw weight response.
#[async_trait]
pub trait IntentClassifier: Send + Sync {
    async fn classify(&self, query: &str) -> Result<String, FusionError>;
}

/// Intent classification through a chat model.
pub struct LlmIntentClassifier {
    client: ChatClient,
}

impl LlmIntentClassifier {
    pub fn new(client: ChatClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl IntentClassifier for LlmIntentClassifier {
    async fn classify(&self, query: &str) -> Result<String, FusionError> {
        let messages = [
            ChatMessage::system(INTENT_INSTRUCTION),
            ChatMessage::user(format!("Query: \"{}\"", query)),
        ];
        Ok(self.client.complete(&messages).await?.content)
    }
}

/// Where a weight split came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightSource {
    PhraseOverride,
    Model,
    KeywordFallback,
    Default,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeightAnalysis {
    pub weights: HybridWeights,
    pub source: WeightSource,
    /// Why the intent model was not used, when it was not.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degraded: Option<String>,
}

pub struct WeightAnalyzer {
    classifier: Option<Arc<dyn IntentClassifier>>,
    policy: RetryPolicy,
    timeout: Duration,
}

impl WeightAnalyzer {
    pub fn new(
        classifier: Option<Arc<dyn IntentClassifier>>,
        policy: RetryPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            classifier,
            policy,
            timeout,
        }
    }

    /// Keyword scoring only.
    pub fn offline() -> Self {
        Self::new(None, RetryPolicy::none(), Duration::from_secs(1))
    }

    pub async fn analyze(&self, query: &str) -> WeightAnalysis {
        if let Some(weights) = phrase_override(query) {
            return WeightAnalysis {
                weights,
                source: WeightSource::PhraseOverride,
                degraded: None,
            };
        }

        let reason = match &self.classifier {
            None => "intent classifier disabled".to_string(),
            Some(_) if query.trim().is_empty() => "empty query".to_string(),
            Some(classifier) => {
                let classifier = classifier.as_ref();
                let outcome = retry(&self.policy, "intent classification", self.timeout, move || {
                    classifier.classify(query)
                })
                .await;
                match outcome {
                    Ok(text) => match parse_weight_response(&text) {
                        Some(weights) => {
                            tracing::debug!(image = weights.image, text = weights.text, "intent weights");
                            return WeightAnalysis {
                                weights,
                                source: WeightSource::Model,
                                degraded: None,
                            };
                        }
                        None => format!("malformed intent response: {:?}", text),
                    },
                    Err(e) => e.to_string(),
                }
            }
        };

        let analysis = match keyword_weights(query) {
            Some(weights) => WeightAnalysis {
                weights,
                source: WeightSource::KeywordFallback,
                degraded: Some(reason),
            },
            None => WeightAnalysis {
                weights: HybridWeights::neutral(),
                source: WeightSource::Default,
                degraded: Some(reason),
            },
        };
        if self.classifier.is_some() {
            tracing::warn!(
                degraded = analysis.degraded.as_deref().unwrap_or_default(),
                image = analysis.weights.image,
                "weight analysis fell back"
            );
        }
        analysis
    }
}
