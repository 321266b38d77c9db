//! End-to-end tests for the indexing and classification pipelines.
//!
//! Network dependencies are replaced by in-process fakes: a keyword
//! embedding model, a static image fetcher, a scripted account judge and
//! the core crate's in-memory vector store. The progress database is a
//! real SQLite file in a temp directory.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::SqlitePool;
use tempfile::TempDir;

use profile_fusion::batch::{BatchReport, CancelFlag};
use profile_fusion::classifier::{
    AccountClassifier, AccountJudge, ClassifierSettings, JudgeRequest, Judgement,
};
use profile_fusion::db;
use profile_fusion::images::{FetchedImage, ImageFetcher, ImageProcessor};
use profile_fusion::indexer::Indexer;
use profile_fusion::migrate;
use profile_fusion::progress::NoProgress;
use profile_fusion::search::SearchFilters;
use profile_fusion::source::{PostInput, ProfileInput};
use profile_fusion_core::aggregate::{EmbeddingAggregator, Reducer, Reduction};
use profile_fusion_core::classify::{
    CentroidClassifier, ClassificationState, LlmOutcome, Vote, UNAVAILABLE_PENALTY,
};
use profile_fusion_core::embedding::EmbeddingModel;
use profile_fusion_core::error::ImageRejection;
use profile_fusion_core::models::{AccountLabel, ProfileRecord};
use profile_fusion_core::ratelimit::{Clock, ManualClock, RateLimiter, RateLimits};
use profile_fusion_core::retry::RetryPolicy;
use profile_fusion_core::store::memory::InMemoryStore;
use profile_fusion_core::store::{Distance, SearchPage, SearchParams, VectorStore};
use profile_fusion_core::{FusionError, Result};

const DIMS: usize = 4;
const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];

// ─── Fakes ──────────────────────────────────────────────────────────

/// Text maps to `[human words, brand words, 0, 1]`; every image to `[0, 0, 1, 0]`.
struct KeywordModel;

const HUMAN_WORDS: &[&str] = &["personal", "trainer", "mum", "life"];
const BRAND_WORDS: &[&str] = &["official", "brand", "shop", "store", "company"];

#[async_trait]
impl EmbeddingModel for KeywordModel {
    fn model_name(&self) -> &str {
        "keyword-test"
    }

    fn dims(&self) -> usize {
        DIMS
    }

    async fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        let lower = text.to_lowercase();
        let count = |words: &[&str]| words.iter().filter(|w| lower.contains(*w)).count() as f32;
        Ok(vec![count(HUMAN_WORDS), count(BRAND_WORDS), 0.0, 1.0])
    }

    async fn embed_image(&self, _image: &[u8]) -> Result<Vec<f32>> {
        Ok(vec![0.0, 0.0, 1.0, 0.0])
    }
}

/// Serves a PNG for every URL except those containing `missing`.
struct StaticFetcher;

#[async_trait]
impl ImageFetcher for StaticFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedImage> {
        if url.contains("missing") {
            return Err(FusionError::InvalidImageUrl {
                url: url.to_string(),
                reason: ImageRejection::HttpStatus(404),
            });
        }
        Ok(FetchedImage {
            content_type: Some("image/png".to_string()),
            bytes: PNG.to_vec(),
        })
    }
}

/// In-memory store that counts writes and can be switched into an outage.
struct CountingStore {
    inner: InMemoryStore,
    upserts: AtomicUsize,
    down: bool,
}

impl CountingStore {
    fn new() -> Self {
        Self {
            inner: InMemoryStore::new(),
            upserts: AtomicUsize::new(0),
            down: false,
        }
    }

    fn down() -> Self {
        Self {
            down: true,
            ..Self::new()
        }
    }

    fn upserts(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VectorStore for CountingStore {
    async fn ensure_collection(&self, dimension: usize, distance: Distance) -> Result<()> {
        self.inner.ensure_collection(dimension, distance).await
    }

    async fn exists(&self, profile_id: &str) -> Result<bool> {
        self.inner.exists(profile_id).await
    }

    async fn get(&self, profile_id: &str) -> Result<Option<ProfileRecord>> {
        self.inner.get(profile_id).await
    }

    async fn upsert(&self, record: ProfileRecord) -> Result<()> {
        if self.down {
            return Err(FusionError::external("vector store", "connection refused", true));
        }
        self.upserts.fetch_add(1, Ordering::SeqCst);
        self.inner.upsert(record).await
    }

    async fn set_payload(&self, profile_id: &str, fields: Map<String, Value>) -> Result<bool> {
        self.inner.set_payload(profile_id, fields).await
    }

    async fn search(&self, query: &[f32], params: &SearchParams) -> Result<SearchPage> {
        self.inner.search(query, params).await
    }

    async fn count(&self) -> Result<usize> {
        self.inner.count().await
    }
}

/// Returns a fixed vote per profile id and counts calls.
struct ScriptedJudge {
    votes: HashMap<String, Vote>,
    calls: AtomicUsize,
}

impl ScriptedJudge {
    fn new(votes: &[(&str, AccountLabel, f32)]) -> Arc<Self> {
        Arc::new(Self {
            votes: votes
                .iter()
                .map(|(id, label, conf)| (id.to_string(), Vote::new(*label, *conf)))
                .collect(),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AccountJudge for ScriptedJudge {
    fn estimated_tokens(&self, _request: &JudgeRequest) -> u64 {
        100
    }

    async fn judge(&self, request: &JudgeRequest) -> Result<Judgement> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let vote = self
            .votes
            .get(&request.profile_id)
            .cloned()
            .ok_or_else(|| FusionError::external("account judge", "no script", false))?;
        Ok(Judgement {
            vote,
            tokens_used: Some(80),
        })
    }
}

/// Real time shifted so the first minute window ends shortly after start.
struct NearMinuteClock {
    start: Instant,
    offset: Duration,
}

impl NearMinuteClock {
    fn ending_in(remaining: Duration) -> Self {
        Self {
            start: Instant::now(),
            offset: Duration::from_secs(60) - remaining,
        }
    }
}

impl Clock for NearMinuteClock {
    fn now(&self) -> Duration {
        self.offset + self.start.elapsed()
    }
}

// ─── Fixtures ───────────────────────────────────────────────────────

struct Env {
    _tmp: TempDir,
    pool: SqlitePool,
    store: Arc<CountingStore>,
    indexer: Arc<Indexer>,
}

async fn setup_with(store: CountingStore, normalize: bool) -> Env {
    let tmp = TempDir::new().unwrap();
    let pool = db::connect_path(&tmp.path().join("pfx.sqlite")).await.unwrap();
    migrate::migrate(&pool).await.unwrap();

    let store = Arc::new(store);
    store.ensure_collection(DIMS, Distance::Cosine).await.unwrap();

    let reducer = Reducer::new(DIMS, DIMS, Reduction::Truncate).unwrap();
    let aggregator = EmbeddingAggregator::new(Default::default(), reducer, normalize).unwrap();
    let images = ImageProcessor::new(
        Arc::new(StaticFetcher),
        tmp.path().join("images"),
        RetryPolicy::none(),
        Duration::from_secs(5),
    );

    let indexer = Arc::new(Indexer {
        model: Arc::new(KeywordModel),
        store: store.clone(),
        images: Arc::new(images),
        aggregator: Arc::new(aggregator),
        pool: pool.clone(),
        policy: RetryPolicy::none(),
        timeout: Duration::from_secs(5),
        skip_existing: true,
    });

    Env {
        _tmp: tmp,
        pool,
        store,
        indexer,
    }
}

async fn setup() -> Env {
    setup_with(CountingStore::new(), true).await
}

fn profile(id: &str, bio: &str) -> ProfileInput {
    ProfileInput {
        id: id.to_string(),
        username: Some(format!("user_{}", id)),
        bio: Some(bio.to_string()),
        profile_pic_url: Some(format!("https://img.test/{}.png", id)),
        follower_count: Some(12_000),
        ..Default::default()
    }
}

fn fixtures() -> Vec<ProfileInput> {
    let mut trainer = profile("1", "Sydney personal trainer");
    trainer.posts = vec![PostInput {
        image_url: Some("https://img.test/post-1.png".to_string()),
        caption: Some("leg day with a client".to_string()),
    }];
    vec![trainer, profile("2", "Official brand shop for running gear")]
}

async fn index(env: &Env, profiles: Vec<ProfileInput>) -> BatchReport {
    env.indexer
        .run(profiles, 2, &CancelFlag::new(), &NoProgress)
        .await
}

fn classifier(
    env: &Env,
    judge: Option<Arc<dyn AccountJudge>>,
    limits: RateLimits,
) -> Arc<AccountClassifier> {
    let limiter = RateLimiter::new(limits, Arc::new(ManualClock::new()));
    classifier_with(env, judge, limiter, Duration::ZERO)
}

fn classifier_with(
    env: &Env,
    judge: Option<Arc<dyn AccountJudge>>,
    limiter: RateLimiter,
    max_budget_wait: Duration,
) -> Arc<AccountClassifier> {
    let centroids = CentroidClassifier::from_exemplars(
        &[vec![1.0, 0.0, 0.0, 0.0]],
        &[vec![0.0, 1.0, 0.0, 0.0]],
        2.0,
    )
    .unwrap();
    Arc::new(AccountClassifier::new(
        env.store.clone(),
        judge,
        Arc::new(limiter),
        centroids,
        env.pool.clone(),
        ClassifierSettings {
            threshold: 0.7,
            max_captions: 5,
            max_budget_wait,
            policy: RetryPolicy::none(),
            llm_timeout: Duration::from_secs(5),
        },
    ))
}

fn open_limits() -> RateLimits {
    RateLimits {
        requests_per_minute: None,
        tokens_per_minute: None,
        requests_per_day: None,
    }
}

// ─── Indexing ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_sydney_profile_aggregates_only_present_components() {
    let env = setup_with(CountingStore::new(), false).await;
    let report = index(&env, vec![profile("syd", "Sydney personal trainer")]).await;
    assert_eq!(report.done, 1);

    let record = env.store.get("syd").await.unwrap().unwrap();
    // bio [2,0,0,1] × 3 + profile pic [0,0,1,0] × 2, over 3 + 2.
    let expected = [1.2, 0.0, 0.4, 0.6];
    for (got, want) in record.vector.iter().zip(expected) {
        assert!((got - want).abs() < 1e-5, "{:?} != {:?}", record.vector, expected);
    }
}

#[tokio::test]
async fn test_second_run_upserts_nothing() {
    let env = setup().await;

    let first = index(&env, fixtures()).await;
    assert_eq!(first.done, 2);
    assert_eq!(env.store.upserts(), 2);
    assert_eq!(db::count_indexed(&env.pool).await.unwrap(), 2);

    let second = index(&env, fixtures()).await;
    assert_eq!(second.done, 0);
    assert_eq!(second.skipped, 2);
    assert_eq!(env.store.upserts(), 2);
}

#[tokio::test]
async fn test_changed_profile_is_reindexed() {
    let env = setup().await;
    index(&env, fixtures()).await;

    let mut changed = fixtures();
    changed[1].bio = Some("Official store, new season out now".to_string());
    let report = index(&env, changed).await;
    assert_eq!(report.done, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(env.store.upserts(), 3);
}

#[tokio::test]
async fn test_reindex_keeps_classification_label() {
    let env = setup().await;
    index(&env, fixtures()).await;

    let judge = ScriptedJudge::new(&[
        ("1", AccountLabel::Human, 0.9),
        ("2", AccountLabel::Brand, 0.8),
    ]);
    let classifier = classifier(&env, Some(judge.clone()), open_limits());
    classifier
        .run(fixtures(), 2, &CancelFlag::new(), &NoProgress)
        .await;

    let mut changed = fixtures();
    changed[1].follower_count = Some(13_000);
    let report = index(&env, changed.clone()).await;
    assert_eq!(report.done, 1);

    let brand = env.store.get("2").await.unwrap().unwrap();
    assert_eq!(brand.payload.follower_count, Some(13_000));
    assert_eq!(brand.payload.account_type, Some(AccountLabel::Brand));
    assert_eq!(brand.payload.extra["account_type_ambiguous"], false);
    assert!(brand.payload.extra.contains_key("account_type_confidence"));

    let rerun = classifier
        .run(changed, 2, &CancelFlag::new(), &NoProgress)
        .await;
    assert_eq!(rerun.skipped, 2);
    assert_eq!(judge.calls(), 2);

    let hits = env
        .store
        .search(
            &[0.0, 1.0, 0.0, 0.0],
            &SearchParams {
                filter: SearchFilters {
                    account_type: Some(AccountLabel::Brand),
                    ..Default::default()
                }
                .to_filter(),
                ..SearchParams::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(hits.hits.len(), 1);
    assert_eq!(hits.hits[0].record.id, "2");
}

#[tokio::test]
async fn test_payload_written_with_vector() {
    let env = setup().await;
    index(&env, fixtures()).await;

    let record = env.store.get("1").await.unwrap().unwrap();
    assert_eq!(record.payload.username.as_deref(), Some("user_1"));
    assert_eq!(record.payload.follower_count, Some(12_000));
    assert!(record.payload.category.is_some());
    assert_eq!(record.vector.len(), DIMS);
}

#[tokio::test]
async fn test_unusable_image_only_drops_that_component() {
    let env = setup_with(CountingStore::new(), false).await;
    let mut p = profile("3", "personal trainer");
    p.profile_pic_url = Some("https://img.test/missing.png".to_string());

    let report = index(&env, vec![p]).await;
    assert_eq!(report.done, 1);
    assert!(report.failed.is_empty());

    // Bio alone: [2, 0, 0, 1].
    let record = env.store.get("3").await.unwrap().unwrap();
    assert_eq!(record.vector, vec![2.0, 0.0, 0.0, 1.0]);
}

#[tokio::test]
async fn test_profile_without_content_fails_alone() {
    let env = setup().await;
    let empty = ProfileInput {
        id: "empty".to_string(),
        ..Default::default()
    };
    let mut profiles = fixtures();
    profiles.push(empty);

    let report = index(&env, profiles).await;
    assert_eq!(report.done, 2);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "empty");
    assert!(report.aborted.is_none());
}

#[tokio::test]
async fn test_store_outage_halts_batch_without_recording() {
    let env = setup_with(CountingStore::down(), true).await;
    let report = index(&env, fixtures()).await;

    assert!(report.aborted.is_some());
    assert_eq!(report.done, 0);
    assert_eq!(db::count_indexed(&env.pool).await.unwrap(), 0);
}

#[tokio::test]
async fn test_cancelled_run_stores_nothing() {
    let env = setup().await;
    let cancel = CancelFlag::new();
    cancel.cancel();

    let report = env
        .indexer
        .run(fixtures(), 2, &cancel, &NoProgress)
        .await;
    assert_eq!(report.cancelled, 2);
    assert_eq!(env.store.upserts(), 0);
    assert_eq!(db::count_indexed(&env.pool).await.unwrap(), 0);
}

// ─── Search ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_indexed_profiles_are_searchable_by_text() {
    let env = setup().await;
    index(&env, fixtures()).await;

    let query = KeywordModel.embed_text("official shop").await.unwrap();
    let query = env.indexer.aggregator.project(&query).unwrap();
    let page = env
        .store
        .search(
            query.as_slice(),
            &SearchParams {
                limit: 1,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(page.hits[0].record.id, "2");
    assert!(page.has_more);
}

// ─── Classification ─────────────────────────────────────────────────

#[tokio::test]
async fn test_classification_writes_labels_and_resumes() {
    let env = setup().await;
    index(&env, fixtures()).await;

    let judge = ScriptedJudge::new(&[
        ("1", AccountLabel::Human, 0.9),
        ("2", AccountLabel::Brand, 0.8),
    ]);
    let classifier = classifier(&env, Some(judge.clone()), open_limits());

    let report = classifier
        .run(fixtures(), 2, &CancelFlag::new(), &NoProgress)
        .await;
    assert_eq!(report.done, 2);
    assert_eq!(judge.calls(), 2);

    let human = env.store.get("1").await.unwrap().unwrap();
    assert_eq!(human.payload.account_type, Some(AccountLabel::Human));
    let brand = env.store.get("2").await.unwrap().unwrap();
    assert_eq!(brand.payload.account_type, Some(AccountLabel::Brand));

    let saved = db::load_result(&env.pool, "2").await.unwrap().unwrap();
    assert_eq!(saved.final_label, AccountLabel::Brand);
    assert!(!saved.ambiguous);

    // Rerun: everything reconciled, no new model calls.
    let again = classifier
        .run(fixtures(), 2, &CancelFlag::new(), &NoProgress)
        .await;
    assert_eq!(again.skipped, 2);
    assert_eq!(judge.calls(), 2);
}

#[tokio::test]
async fn test_failed_profile_is_retried_on_rerun() {
    let env = setup().await;
    let all = fixtures();
    // Only the first profile is in the store.
    index(&env, vec![all[0].clone()]).await;

    let classifier = classifier(&env, None, open_limits());
    let report = classifier
        .run(all.clone(), 2, &CancelFlag::new(), &NoProgress)
        .await;
    assert_eq!(report.done, 1);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(
        db::classification_state(&env.pool, "2").await.unwrap(),
        Some(ClassificationState::Failed)
    );

    index(&env, all.clone()).await;
    let rerun = classifier
        .run(all, 2, &CancelFlag::new(), &NoProgress)
        .await;
    assert_eq!(rerun.skipped, 1);
    assert_eq!(rerun.done, 1);
    assert_eq!(
        db::classification_state(&env.pool, "2").await.unwrap(),
        Some(ClassificationState::Reconciled)
    );
}

#[tokio::test]
async fn test_exhausted_daily_budget_falls_back_to_embedding_vote() {
    let env = setup().await;
    index(&env, fixtures()).await;

    let judge = ScriptedJudge::new(&[("1", AccountLabel::Brand, 0.99)]);
    let limits = RateLimits {
        requests_per_day: Some(0),
        ..open_limits()
    };
    let classifier = classifier(&env, Some(judge.clone()), limits);

    let report = classifier
        .run(vec![fixtures().remove(0)], 1, &CancelFlag::new(), &NoProgress)
        .await;
    assert_eq!(report.done, 1);
    assert_eq!(judge.calls(), 0);

    let saved = db::load_result(&env.pool, "1").await.unwrap().unwrap();
    assert!(matches!(saved.llm_vote, LlmOutcome::Unavailable { .. }));
    assert_eq!(saved.final_label, AccountLabel::Human);
    assert!(
        (saved.confidence - saved.embedding_vote.confidence * UNAVAILABLE_PENALTY).abs() < 1e-6
    );
}

#[tokio::test]
async fn test_confident_language_model_overrides_embedding() {
    let env = setup().await;
    index(&env, fixtures()).await;

    let judge = ScriptedJudge::new(&[("1", AccountLabel::Brand, 0.95)]);
    let classifier = classifier(&env, Some(judge), open_limits());
    classifier
        .run(vec![fixtures().remove(0)], 1, &CancelFlag::new(), &NoProgress)
        .await;

    let saved = db::load_result(&env.pool, "1").await.unwrap().unwrap();
    assert_eq!(saved.embedding_vote.label, AccountLabel::Human);
    assert_eq!(saved.final_label, AccountLabel::Brand);
}

#[tokio::test]
async fn test_cancelled_classification_writes_nothing() {
    let env = setup().await;
    index(&env, fixtures()).await;

    let judge = ScriptedJudge::new(&[]);
    let classifier = classifier(&env, Some(judge), open_limits());
    let cancel = CancelFlag::new();
    cancel.cancel();

    let report = classifier.run(fixtures(), 2, &cancel, &NoProgress).await;
    assert_eq!(report.cancelled, 2);
    assert_eq!(db::classification_state(&env.pool, "1").await.unwrap(), None);
    let record = env.store.get("1").await.unwrap().unwrap();
    assert!(record.payload.account_type.is_none());
}

#[tokio::test]
async fn test_minute_budget_without_room_to_wait_skips_language_model() {
    let env = setup().await;
    index(&env, fixtures()).await;

    let judge = ScriptedJudge::new(&[
        ("1", AccountLabel::Human, 0.9),
        ("2", AccountLabel::Brand, 0.8),
    ]);
    let limits = RateLimits {
        requests_per_minute: Some(1),
        ..open_limits()
    };
    let limiter = RateLimiter::new(limits, Arc::new(ManualClock::new()));
    let classifier = classifier_with(&env, Some(judge.clone()), limiter, Duration::from_millis(50));

    let report = classifier
        .run(fixtures(), 1, &CancelFlag::new(), &NoProgress)
        .await;
    assert_eq!(report.done, 2);
    assert_eq!(judge.calls(), 1);

    let mut unavailable = 0;
    for id in ["1", "2"] {
        let saved = db::load_result(&env.pool, id).await.unwrap().unwrap();
        if let LlmOutcome::Unavailable { reason } = &saved.llm_vote {
            assert!(reason.contains("requests per minute"), "{}", reason);
            unavailable += 1;
        }
    }
    assert_eq!(unavailable, 1);
}

#[tokio::test]
async fn test_minute_budget_waits_for_window_rollover() {
    let env = setup().await;
    index(&env, fixtures()).await;

    let judge = ScriptedJudge::new(&[
        ("1", AccountLabel::Human, 0.9),
        ("2", AccountLabel::Brand, 0.8),
    ]);
    let limits = RateLimits {
        requests_per_minute: Some(1),
        ..open_limits()
    };
    let clock = NearMinuteClock::ending_in(Duration::from_secs(2));
    let limiter = RateLimiter::new(limits, Arc::new(clock));
    let classifier = classifier_with(&env, Some(judge.clone()), limiter, Duration::from_secs(5));

    let report = classifier
        .run(fixtures(), 1, &CancelFlag::new(), &NoProgress)
        .await;
    assert_eq!(report.done, 2);
    assert_eq!(judge.calls(), 2);

    for id in ["1", "2"] {
        let saved = db::load_result(&env.pool, id).await.unwrap().unwrap();
        assert!(matches!(saved.llm_vote, LlmOutcome::Voted(_)), "{}: {:?}", id, saved.llm_vote);
    }
}
