//! Human vs brand classification: the embedding-space vote, the per-profile
//! state machine, and the reconciliation of two independent votes.
//!
//! # Reconciliation
//!
//! | embedding | language model | final | confidence |
//! |-----------|----------------|-------|------------|
//! | A (e) | A (l) | A | max(e, l) |
//! | A (e) | B (l), l > t | B | l |
//! | A (e) | B (l), l ≤ t, e > t | A | e |
//! | A (e) | B (l), l ≤ t, e ≤ t | A | e, flagged ambiguous |
//! | A (e) | unavailable | A | e × [`UNAVAILABLE_PENALTY`] |
//!
//! `t` is the configured confidence threshold (0.7 by default).

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::embedding::{cosine_similarity, l2_normalize, mean};
use crate::error::{FusionError, Result};
use crate::models::AccountLabel;

/// Default threshold above which a dissenting language-model vote wins.
pub const DEFAULT_THRESHOLD: f32 = 0.7;

/// Confidence multiplier when only the embedding vote is available.
pub const UNAVAILABLE_PENALTY: f32 = 0.5;

/// Default scale from similarity margin to confidence.
pub const DEFAULT_MARGIN_SCALE: f32 = 5.0;

/// A single classifier's opinion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vote {
    pub label: AccountLabel,
    /// In `[0, 1]`.
    pub confidence: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

impl Vote {
    pub fn new(label: AccountLabel, confidence: f32) -> Self {
        Self {
            label,
            confidence: confidence.clamp(0.0, 1.0),
            reasoning: None,
        }
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }
}

/// Outcome of the language-model path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum LlmOutcome {
    Voted(Vote),
    Unavailable { reason: String },
}

impl LlmOutcome {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        LlmOutcome::Unavailable {
            reason: reason.into(),
        }
    }

    pub fn vote(&self) -> Option<&Vote> {
        match self {
            LlmOutcome::Voted(v) => Some(v),
            LlmOutcome::Unavailable { .. } => None,
        }
    }
}

/// The reconciled decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reconciliation {
    pub label: AccountLabel,
    pub confidence: f32,
    pub reason: String,
    pub ambiguous: bool,
}

/// Combine the two votes. Pure; see the module docs for the table.
pub fn reconcile(embedding: &Vote, llm: &LlmOutcome, threshold: f32) -> Reconciliation {
    let llm = match llm {
        LlmOutcome::Voted(v) => v,
        LlmOutcome::Unavailable { reason } => {
            return Reconciliation {
                label: embedding.label,
                confidence: embedding.confidence * UNAVAILABLE_PENALTY,
                reason: format!("language model unavailable ({}); embedding vote only", reason),
                ambiguous: false,
            };
        }
    };

    if llm.label == embedding.label {
        return Reconciliation {
            label: llm.label,
            confidence: embedding.confidence.max(llm.confidence),
            reason: format!("both classifiers agree on {}", llm.label),
            ambiguous: false,
        };
    }

    if llm.confidence > threshold {
        return Reconciliation {
            label: llm.label,
            confidence: llm.confidence,
            reason: keep_reasoning(
                format!(
                    "language model {} ({:.2}) overrides embedding {} ({:.2})",
                    llm.label, llm.confidence, embedding.label, embedding.confidence
                ),
                "embedding",
                embedding,
            ),
            ambiguous: false,
        };
    }

    let ambiguous = embedding.confidence <= threshold;
    let reason = if ambiguous {
        format!(
            "classifiers disagree below threshold {:.2}: embedding {} ({:.2}), language model {} ({:.2})",
            threshold, embedding.label, embedding.confidence, llm.label, llm.confidence
        )
    } else {
        format!(
            "embedding {} ({:.2}) kept over low-confidence language model {} ({:.2})",
            embedding.label, embedding.confidence, llm.label, llm.confidence
        )
    };
    Reconciliation {
        label: embedding.label,
        confidence: embedding.confidence,
        reason: keep_reasoning(reason, "language model", llm),
        ambiguous,
    }
}

/// Append the overruled vote's own reasoning, when it gave any.
fn keep_reasoning(reason: String, who: &str, loser: &Vote) -> String {
    match loser.reasoning.as_deref().map(str::trim).filter(|r| !r.is_empty()) {
        Some(why) => format!("{}; {} reasoning: {}", reason, who, why),
        None => reason,
    }
}

/// Per-profile classification progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClassificationState {
    Pending,
    EmbeddingScored,
    LlmScored,
    Reconciled,
    Failed,
}

impl ClassificationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClassificationState::Pending => "PENDING",
            ClassificationState::EmbeddingScored => "EMBEDDING_SCORED",
            ClassificationState::LlmScored => "LLM_SCORED",
            ClassificationState::Reconciled => "RECONCILED",
            ClassificationState::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(ClassificationState::Pending),
            "EMBEDDING_SCORED" => Some(ClassificationState::EmbeddingScored),
            "LLM_SCORED" => Some(ClassificationState::LlmScored),
            "RECONCILED" => Some(ClassificationState::Reconciled),
            "FAILED" => Some(ClassificationState::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ClassificationState::Reconciled | ClassificationState::Failed
        )
    }

    /// Move to `next`, rejecting anything off the linear path. `Failed` is
    /// reachable from every non-terminal state; a failed profile may be
    /// reset to `Pending` for another run.
    pub fn advance(self, next: ClassificationState) -> Result<ClassificationState> {
        use ClassificationState::*;
        let ok = matches!(
            (self, next),
            (Pending, EmbeddingScored)
                | (EmbeddingScored, LlmScored)
                | (LlmScored, Reconciled)
                | (Pending | EmbeddingScored | LlmScored, Failed)
                | (Failed, Pending)
        );
        if ok {
            Ok(next)
        } else {
            Err(FusionError::InvalidTransition {
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }
}

impl fmt::Display for ClassificationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final record for one profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub profile_id: String,
    pub embedding_vote: Vote,
    pub llm_vote: LlmOutcome,
    pub final_label: AccountLabel,
    pub confidence: f32,
    pub reconciliation_reason: String,
    pub ambiguous: bool,
}

impl ClassificationResult {
    pub fn reconciled(
        profile_id: impl Into<String>,
        embedding_vote: Vote,
        llm_vote: LlmOutcome,
        threshold: f32,
    ) -> Self {
        let r = reconcile(&embedding_vote, &llm_vote, threshold);
        Self {
            profile_id: profile_id.into(),
            embedding_vote,
            llm_vote,
            final_label: r.label,
            confidence: r.confidence,
            reconciliation_reason: r.reason,
            ambiguous: r.ambiguous,
        }
    }
}

/// Nearest-centroid vote between "human" and "brand" regions of the
/// embedding space.
#[derive(Debug, Clone)]
pub struct CentroidClassifier {
    human: Vec<f32>,
    brand: Vec<f32>,
    margin_scale: f32,
}

impl CentroidClassifier {
    /// Build centroids by averaging exemplar vectors of each class.
    pub fn from_exemplars(
        human: &[Vec<f32>],
        brand: &[Vec<f32>],
        margin_scale: f32,
    ) -> Result<Self> {
        let human = centroid(human, "human")?;
        let brand = centroid(brand, "brand")?;
        if human.len() != brand.len() {
            return Err(FusionError::DimensionMismatch {
                expected: human.len(),
                actual: brand.len(),
            });
        }
        Ok(Self {
            human,
            brand,
            margin_scale,
        })
    }

    pub fn dims(&self) -> usize {
        self.human.len()
    }

    /// Vote for the closer centroid. Confidence grows linearly with the
    /// similarity margin and saturates at 1.
    pub fn vote(&self, profile: &[f32]) -> Result<Vote> {
        if profile.len() != self.human.len() {
            return Err(FusionError::DimensionMismatch {
                expected: self.human.len(),
                actual: profile.len(),
            });
        }
        let h = cosine_similarity(profile, &self.human);
        let b = cosine_similarity(profile, &self.brand);
        let margin = h - b;
        let label = if margin >= 0.0 {
            AccountLabel::Human
        } else {
            AccountLabel::Brand
        };
        let confidence = (margin.abs() * self.margin_scale).clamp(0.0, 1.0);
        Ok(Vote::new(label, confidence).with_reasoning(format!(
            "human similarity {:.3}, brand similarity {:.3}",
            h, b
        )))
    }
}

fn centroid(vectors: &[Vec<f32>], class: &str) -> Result<Vec<f32>> {
    let dims = vectors.first().map(Vec::len).unwrap_or(0);
    if let Some(bad) = vectors.iter().find(|v| v.len() != dims) {
        return Err(FusionError::DimensionMismatch {
            expected: dims,
            actual: bad.len(),
        });
    }
    let refs: Vec<&[f32]> = vectors.iter().map(Vec::as_slice).collect();
    let mut c = mean(&refs)
        .filter(|c| !c.is_empty())
        .ok_or_else(|| FusionError::InsufficientData(format!("no {} exemplars", class)))?;
    if !l2_normalize(&mut c) {
        return Err(FusionError::InsufficientData(format!(
            "{} exemplars average to the zero vector",
            class
        )));
    }
    Ok(c)
}
