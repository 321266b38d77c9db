//! Human vs brand account classification.
//!
//! Each profile gets two independent votes, computed concurrently:
//!
//! - **Embedding vote**: the stored profile vector against "human" and
//!   "brand" centroids built from exemplar descriptions, embedded with the
//!   same model and reducer as the profiles.
//! - **Language-model vote**: an [`AccountJudge`] shown the username, full
//!   name, bio and a few captions. Calls are gated by a [`RateLimiter`];
//!   when a per-minute window is exhausted the call waits for the reset,
//!   up to `max_budget_wait`. An exhausted daily budget, a failed call or
//!   an unparseable answer makes the vote unavailable rather than failing
//!   the profile.
//!
//! The votes are reconciled by [`reconcile`](profile_fusion_core::classify::reconcile),
//! written into the vector-store payload, and persisted. Only terminal
//! states reach the progress database: a rerun skips `RECONCILED`
//! profiles and retries `FAILED` ones.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map};
use sqlx::SqlitePool;

use profile_fusion_core::aggregate::EmbeddingAggregator;
use profile_fusion_core::classify::{
    CentroidClassifier, ClassificationResult, ClassificationState, LlmOutcome, Vote,
};
use profile_fusion_core::embedding::EmbeddingModel;
use profile_fusion_core::error::RateWindow;
use profile_fusion_core::models::{AccountLabel, CLASSIFICATION_KEYS};
use profile_fusion_core::ratelimit::{Permit, RateLimiter};
use profile_fusion_core::retry::RetryPolicy;
use profile_fusion_core::store::VectorStore;
use profile_fusion_core::FusionError;

use crate::batch::{run_batch, BatchReport, CancelFlag, ProfileOutcome};
use crate::db;
use crate::llm::{estimate_tokens, ChatClient, ChatMessage};
use crate::progress::ProgressReporter;
use crate::retry::{retry, retry_with_backoff};
use crate::source::ProfileInput;

const JUDGE_INSTRUCTION: &str = "You classify Instagram accounts as run by an individual person \
(human) or by a company, brand or organisation (brand). Creators, influencers and personal \
trainers who post as themselves are human; shops, products, agencies and venues are brand. \
Respond with only a JSON object: \
{\"classification\": \"human\" or \"brand\", \"confidence\": 0-100, \"reasoning\": \"one sentence\"}";

/// What the language model is shown about a profile.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JudgeRequest {
    pub profile_id: String,
    pub username: Option<String>,
    pub full_name: Option<String>,
    pub bio: Option<String>,
    pub captions: Vec<String>,
}

impl JudgeRequest {
    pub fn from_profile(profile: &ProfileInput, max_captions: usize) -> Self {
        Self {
            profile_id: profile.id.clone(),
            username: profile.username.clone(),
            full_name: profile.full_name.clone(),
            bio: profile.bio.clone(),
            captions: profile
                .captions()
                .take(max_captions)
                .map(str::to_string)
                .collect(),
        }
    }

    fn prompt(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "Username: {}\n",
            self.username.as_deref().unwrap_or(&self.profile_id)
        ));
        if let Some(name) = &self.full_name {
            out.push_str(&format!("Full name: {}\n", name));
        }
        out.push_str(&format!("Bio: {}\n", self.bio.as_deref().unwrap_or("(none)")));
        if !self.captions.is_empty() {
            out.push_str("Recent captions:\n");
            for caption in &self.captions {
                out.push_str(&format!("- {}\n", caption));
            }
        }
        out
    }
}

/// A vote and the tokens it cost, if the provider reported them.
#[derive(Debug, Clone, PartialEq)]
pub struct Judgement {
    pub vote: Vote,
    pub tokens_used: Option<u64>,
}

/// Anything that can judge a profile human or brand.
#[async_trait]
pub trait AccountJudge: Send + Sync {
    /// Tokens to reserve from the budget before calling.
    fn estimated_tokens(&self, request: &JudgeRequest) -> u64;

    async fn judge(&self, request: &JudgeRequest) -> Result<Judgement, FusionError>;
}

pub struct LlmAccountJudge {
    client: ChatClient,
}

impl LlmAccountJudge {
    pub fn new(client: ChatClient) -> Self {
        Self { client }
    }

    fn messages(request: &JudgeRequest) -> [ChatMessage; 2] {
        [
            ChatMessage::system(JUDGE_INSTRUCTION),
            ChatMessage::user(request.prompt()),
        ]
    }
}

#[async_trait]
impl AccountJudge for LlmAccountJudge {
    fn estimated_tokens(&self, request: &JudgeRequest) -> u64 {
        estimate_tokens(&Self::messages(request), self.client.max_tokens())
    }

    async fn judge(&self, request: &JudgeRequest) -> Result<Judgement, FusionError> {
        let completion = self.client.complete(&Self::messages(request)).await?;
        Ok(Judgement {
            vote: parse_judgement(&completion.content)?,
            tokens_used: completion.total_tokens,
        })
    }
}

#[derive(Deserialize)]
struct RawJudgement {
    classification: String,
    confidence: f64,
    #[serde(default)]
    reasoning: Option<String>,
}

/// Parse `{"classification", "confidence", "reasoning"}` out of a reply.
///
/// Tolerates prose or code fences around the object. Confidence above 1
/// is read as a percentage.
pub fn parse_judgement(content: &str) -> Result<Vote, FusionError> {
    let malformed = |why: &str| {
        FusionError::external(
            "account judge",
            format!("{}: {:?}", why, content.chars().take(200).collect::<String>()),
            false,
        )
    };
    let start = content.find('{').ok_or_else(|| malformed("no JSON object"))?;
    let end = content.rfind('}').ok_or_else(|| malformed("no JSON object"))?;
    if end < start {
        return Err(malformed("no JSON object"));
    }
    let raw: RawJudgement =
        serde_json::from_str(&content[start..=end]).map_err(|_| malformed("malformed judgement"))?;

    let label: AccountLabel = raw
        .classification
        .parse()
        .map_err(|_| malformed("unknown classification"))?;
    if !raw.confidence.is_finite() || raw.confidence < 0.0 || raw.confidence > 100.0 {
        return Err(malformed("confidence out of range"));
    }
    let confidence = if raw.confidence > 1.0 {
        raw.confidence / 100.0
    } else {
        raw.confidence
    };

    let vote = Vote::new(label, confidence as f32);
    Ok(match raw.reasoning {
        Some(r) if !r.trim().is_empty() => vote.with_reasoning(r.trim()),
        _ => vote,
    })
}

/// Tunables for [`AccountClassifier`].
#[derive(Debug, Clone)]
pub struct ClassifierSettings {
    pub threshold: f32,
    pub max_captions: usize,
    pub max_budget_wait: Duration,
    pub policy: RetryPolicy,
    pub llm_timeout: Duration,
}

pub struct AccountClassifier {
    store: Arc<dyn VectorStore>,
    judge: Option<Arc<dyn AccountJudge>>,
    limiter: Arc<RateLimiter>,
    centroids: CentroidClassifier,
    pool: SqlitePool,
    settings: ClassifierSettings,
}

impl AccountClassifier {
    pub fn new(
        store: Arc<dyn VectorStore>,
        judge: Option<Arc<dyn AccountJudge>>,
        limiter: Arc<RateLimiter>,
        centroids: CentroidClassifier,
        pool: SqlitePool,
        settings: ClassifierSettings,
    ) -> Self {
        Self {
            store,
            judge,
            limiter,
            centroids,
            pool,
            settings,
        }
    }

    /// Classify every profile with at most `concurrency` in flight.
    pub async fn run(
        self: &Arc<Self>,
        profiles: Vec<ProfileInput>,
        concurrency: usize,
        cancel: &CancelFlag,
        progress: &dyn ProgressReporter,
    ) -> BatchReport {
        let this = self.clone();
        run_batch(
            "classify",
            profiles,
            |p: &ProfileInput| p.id.clone(),
            concurrency,
            cancel,
            progress,
            move |profile, halt| {
                let this = this.clone();
                async move { this.classify_one(&profile, &halt).await }
            },
        )
        .await
    }

    /// Classify one profile. `Err` is reserved for batch-halting failures.
    pub async fn classify_one(
        &self,
        profile: &ProfileInput,
        cancel: &CancelFlag,
    ) -> Result<ProfileOutcome, FusionError> {
        if cancel.is_cancelled() {
            return Ok(ProfileOutcome::Cancelled);
        }
        let state = db::classification_state(&self.pool, &profile.id)
            .await
            .map_err(db_error)?;
        if state == Some(ClassificationState::Reconciled) {
            return Ok(ProfileOutcome::Skipped("already reconciled".to_string()));
        }
        let mut state = match state {
            Some(ClassificationState::Failed) => {
                ClassificationState::Failed.advance(ClassificationState::Pending)?
            }
            _ => ClassificationState::Pending,
        };

        let request = JudgeRequest::from_profile(profile, self.settings.max_captions);
        let (embedding, llm) = tokio::join!(self.embedding_vote(&profile.id), self.llm_vote(&request));

        let embedding = match embedding {
            Ok(vote) => vote,
            Err(e) if e.is_retryable() => return Err(e),
            Err(e) => {
                if cancel.is_cancelled() {
                    return Ok(ProfileOutcome::Cancelled);
                }
                let _ = state.advance(ClassificationState::Failed)?;
                return self.fail(&profile.id, &e.to_string()).await;
            }
        };
        state = state.advance(ClassificationState::EmbeddingScored)?;
        state = state.advance(ClassificationState::LlmScored)?;
        tracing::debug!(profile_id = %profile.id, %state, llm_available = llm.vote().is_some(), "votes collected");

        let result = ClassificationResult::reconciled(
            profile.id.clone(),
            embedding,
            llm,
            self.settings.threshold,
        );

        if cancel.is_cancelled() {
            return Ok(ProfileOutcome::Cancelled);
        }

        let [label_key, confidence_key, ambiguous_key] = CLASSIFICATION_KEYS;
        let mut fields = Map::new();
        fields.insert(label_key.into(), json!(result.final_label.as_str()));
        fields.insert(confidence_key.into(), json!(result.confidence));
        fields.insert(ambiguous_key.into(), json!(result.ambiguous));
        match self.store.set_payload(&profile.id, fields).await {
            Ok(true) => {}
            Ok(false) => return self.fail(&profile.id, "profile is not in the vector store").await,
            Err(e) if e.is_retryable() => return Err(e),
            Err(e) => return self.fail(&profile.id, &e.to_string()).await,
        }

        let _ = state.advance(ClassificationState::Reconciled)?;
        db::save_result(&self.pool, &result).await.map_err(db_error)?;

        if result.ambiguous {
            tracing::warn!(profile_id = %profile.id, reason = %result.reconciliation_reason, "ambiguous classification");
        }
        Ok(ProfileOutcome::Done(format!(
            "{} ({:.2}){}",
            result.final_label,
            result.confidence,
            if result.ambiguous { " ambiguous" } else { "" }
        )))
    }

    async fn fail(&self, profile_id: &str, error: &str) -> Result<ProfileOutcome, FusionError> {
        tracing::warn!(profile_id, error, "classification failed");
        db::save_failure(&self.pool, profile_id, error)
            .await
            .map_err(db_error)?;
        Ok(ProfileOutcome::Failed(error.to_string()))
    }

    async fn embedding_vote(&self, profile_id: &str) -> Result<Vote, FusionError> {
        let record = self
            .store
            .get(profile_id)
            .await?
            .ok_or_else(|| FusionError::InsufficientData("profile is not in the vector store".to_string()))?;
        self.centroids.vote(&record.vector)
    }

    async fn llm_vote(&self, request: &JudgeRequest) -> LlmOutcome {
        let Some(judge) = self.judge.as_deref() else {
            return LlmOutcome::unavailable("language model disabled");
        };
        let estimate = judge.estimated_tokens(request);
        // Budget waits happen inside an attempt; the call itself gets its own timeout.
        let outer = self.settings.llm_timeout + self.settings.max_budget_wait;
        let outcome = retry_with_backoff(
            &self.settings.policy,
            "account judge",
            outer,
            FusionError::is_retryable,
            move || async move {
                let permit = self.acquire(estimate).await?;
                let judged = match tokio::time::timeout(self.settings.llm_timeout, judge.judge(request)).await {
                    Ok(r) => r,
                    Err(_) => Err(FusionError::ExternalCallTimeout {
                        operation: "account judge".to_string(),
                        after: self.settings.llm_timeout,
                    }),
                };
                let used = match &judged {
                    Ok(j) => j.tokens_used.unwrap_or(estimate),
                    Err(_) => estimate,
                };
                self.limiter.settle(permit, used);
                judged.map(|j| j.vote)
            },
        )
        .await;

        match outcome {
            Ok(vote) => LlmOutcome::Voted(vote),
            Err(e) => {
                tracing::warn!(profile_id = %request.profile_id, error = %e, "language model vote unavailable");
                LlmOutcome::unavailable(e.to_string())
            }
        }
    }

    /// Reserve budget, waiting for per-minute windows to reset when that
    /// fits within `max_budget_wait`.
    async fn acquire(&self, estimate: u64) -> Result<Permit, FusionError> {
        let deadline = Instant::now() + self.settings.max_budget_wait;
        loop {
            match self.limiter.try_acquire(estimate) {
                Ok(permit) => return Ok(permit),
                Err(FusionError::RateBudgetExhausted { window, retry_after })
                    if window != RateWindow::RequestsPerDay
                        && !retry_after.is_zero()
                        && Instant::now() + retry_after <= deadline =>
                {
                    tracing::debug!(%window, ?retry_after, "waiting for rate window");
                    tokio::time::sleep(retry_after).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn db_error(e: anyhow::Error) -> FusionError {
    FusionError::external("progress db", e.to_string(), false)
}

/// Build the human/brand centroids from exemplar phrases.
pub async fn build_centroids(
    model: &dyn EmbeddingModel,
    aggregator: &EmbeddingAggregator,
    human: &[String],
    brand: &[String],
    margin_scale: f32,
    policy: &RetryPolicy,
    timeout: Duration,
) -> Result<CentroidClassifier, FusionError> {
    async fn embed_all(
        model: &dyn EmbeddingModel,
        aggregator: &EmbeddingAggregator,
        phrases: &[String],
        policy: &RetryPolicy,
        timeout: Duration,
    ) -> Result<Vec<Vec<f32>>, FusionError> {
        let mut out = Vec::with_capacity(phrases.len());
        for phrase in phrases {
            let phrase = phrase.as_str();
            let raw = retry(policy, "embed exemplar", timeout, move || model.embed_text(phrase)).await?;
            out.push(aggregator.project(&raw)?.into_inner());
        }
        Ok(out)
    }

    let human = embed_all(model, aggregator, human, policy, timeout).await?;
    let brand = embed_all(model, aggregator, brand, policy, timeout).await?;
    CentroidClassifier::from_exemplars(&human, &brand, margin_scale)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_judgement_percent() {
        let v = parse_judgement(
            "```json\n{\"classification\": \"brand\", \"confidence\": 85, \"reasoning\": \"Sells products\"}\n```",
        )
        .unwrap();
        assert_eq!(v.label, AccountLabel::Brand);
        assert!((v.confidence - 0.85).abs() < 1e-6);
        assert_eq!(v.reasoning.as_deref(), Some("Sells products"));
    }

    #[test]
    fn test_parse_judgement_fraction_and_synonym() {
        let v = parse_judgement("{\"classification\": \"personal\", \"confidence\": 0.9}").unwrap();
        assert_eq!(v.label, AccountLabel::Human);
        assert!((v.confidence - 0.9).abs() < 1e-6);
        assert!(v.reasoning.is_none());
    }

    #[test]
    fn test_parse_judgement_rejects_garbage() {
        assert!(parse_judgement("I think it's a brand").is_err());
        assert!(parse_judgement("{\"classification\": \"robot\", \"confidence\": 50}").is_err());
        assert!(parse_judgement("{\"classification\": \"human\", \"confidence\": 150}").is_err());
        assert!(parse_judgement("} {").is_err());
    }

    #[test]
    fn test_prompt_includes_captions() {
        let req = JudgeRequest {
            profile_id: "1".into(),
            username: Some("sydneypt".into()),
            full_name: None,
            bio: Some("PT in Sydney".into()),
            captions: vec!["Leg day".into()],
        };
        let p = req.prompt();
        assert!(p.contains("Username: sydneypt"));
        assert!(p.contains("- Leg day"));
        assert!(!p.contains("Full name"));
    }
}
