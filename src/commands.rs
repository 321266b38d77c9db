//! CLI command implementations.
//!
//! Each `run_*` function loads what it needs from the configuration,
//! prints results to stdout, and leaves progress and logs on stderr.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};

use profile_fusion_core::retry::RetryPolicy;
use profile_fusion_core::store::{Distance, SearchParams, VectorStore};

use crate::app;
use crate::batch::{BatchReport, CancelFlag};
use crate::classifier::{build_centroids, AccountClassifier, ClassifierSettings};
use crate::config::Config;
use crate::db;
use crate::indexer::Indexer;
use crate::migrate;
use crate::progress::ProgressMode;
use crate::qdrant::QdrantStore;
use crate::search::{print_response, SearchFilters, SearchResponse, Searcher};
use crate::source::{load_profiles, ProfileInput};

/// Trip `cancel` on Ctrl-C.
pub fn cancel_on_ctrl_c() -> CancelFlag {
    let cancel = CancelFlag::new();
    let flag = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupted; finishing in-flight profiles...");
            flag.cancel();
        }
    });
    cancel
}

fn source_profiles(config: &Config, limit: Option<usize>) -> Result<Vec<ProfileInput>> {
    let Some(path) = &config.source.path else {
        bail!("No profile source configured. Set [source] path in config.");
    };
    let mut profiles = load_profiles(path)?;
    if let Some(limit) = limit {
        profiles.truncate(limit);
    }
    Ok(profiles)
}

fn print_report(pipeline: &str, report: &BatchReport) -> Result<()> {
    println!("{} complete", pipeline);
    println!("  profiles:  {}", report.total);
    println!("  done:      {}", report.done);
    println!("  skipped:   {}", report.skipped);
    println!("  cancelled: {}", report.cancelled);
    println!("  failed:    {}", report.failed.len());
    for (id, why) in report.failed.iter().take(20) {
        println!("    {}: {}", id, why);
    }
    if let Some(reason) = &report.aborted {
        bail!("{} halted: {}", pipeline, reason);
    }
    Ok(())
}

/// Create the progress database and ensure the vector collection.
pub async fn run_init(config: &Config) -> Result<()> {
    migrate::run_migrations(config).await?;
    println!("Database initialized at {}", config.db.path.display());

    if config.embedding.is_enabled() {
        let model = app::model(config)?;
        let aggregator = app::aggregator(config, model.as_ref())?;
        let store = app::store(config)?;
        store
            .ensure_collection(aggregator.output_dims(), Distance::Cosine)
            .await
            .context("failed to prepare vector collection")?;
        println!(
            "Collection '{}' ready ({} dims)",
            config.store.collection,
            aggregator.output_dims()
        );
    } else {
        println!("Embedding provider disabled; skipping vector collection.");
    }
    Ok(())
}

pub async fn run_index(
    config: &Config,
    limit: Option<usize>,
    batch_size: Option<usize>,
    no_skip_existing: bool,
    dry_run: bool,
    progress: Option<ProgressMode>,
) -> Result<()> {
    let profiles = source_profiles(config, limit)?;
    if dry_run {
        let posts: usize = profiles.iter().map(|p| p.posts.len()).sum();
        println!("Dry run: {} profiles, {} posts", profiles.len(), posts);
        return Ok(());
    }

    let model = app::model(config)?;
    let aggregator = app::aggregator(config, model.as_ref())?;
    let store = app::store(config)?;
    store
        .ensure_collection(aggregator.output_dims(), Distance::Cosine)
        .await?;
    let pool = db::connect(config).await?;
    migrate::migrate(&pool).await?;

    let indexer = Arc::new(Indexer {
        model,
        store,
        images: Arc::new(app::images(config)),
        aggregator: Arc::new(aggregator),
        pool: pool.clone(),
        policy: config.retry.policy(),
        timeout: config.embedding.timeout(),
        skip_existing: config.pipeline.skip_existing && !no_skip_existing,
    });

    let cancel = cancel_on_ctrl_c();
    let progress = progress.unwrap_or_else(ProgressMode::default_for_tty).reporter();
    let report = indexer
        .run(
            profiles,
            batch_size.unwrap_or(config.pipeline.batch_size),
            &cancel,
            progress.as_ref(),
        )
        .await;
    pool.close().await;
    print_report("index", &report)
}

async fn searcher(config: &Config) -> Result<Searcher> {
    let model = app::model(config)?;
    let aggregator = app::aggregator(config, model.as_ref())?;
    Ok(Searcher {
        model,
        store: app::store(config)?,
        images: Arc::new(app::images(config)),
        aggregator: Arc::new(aggregator),
        analyzer: app::analyzer(config)?,
        policy: config.retry.policy(),
        timeout: config.embedding.timeout(),
    })
}

fn emit(response: &SearchResponse, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(response)?);
    } else {
        print_response(response);
    }
    Ok(())
}

pub async fn run_search(
    config: &Config,
    query: &str,
    filters: &SearchFilters,
    params: SearchParams,
    json: bool,
) -> Result<()> {
    let searcher = searcher(config).await?;
    let params = SearchParams {
        filter: filters.to_filter(),
        ..params
    };
    let response = searcher.search_text(query, &params).await?;
    emit(&response, json)
}

pub async fn run_hybrid(
    config: &Config,
    query: &str,
    image_url: &str,
    filters: &SearchFilters,
    params: SearchParams,
    json: bool,
) -> Result<()> {
    let searcher = searcher(config).await?;
    let params = SearchParams {
        filter: filters.to_filter(),
        ..params
    };
    let response = searcher.search_hybrid(query, image_url, &params).await?;
    emit(&response, json)
}

/// Show the image/text split a hybrid query would use.
pub async fn run_weights(config: &Config, query: &str, json: bool) -> Result<()> {
    let analysis = app::analyzer(config)?.analyze(query).await;
    if json {
        println!("{}", serde_json::to_string_pretty(&analysis)?);
    } else {
        println!("image_weight: {:.1}", analysis.weights.image);
        println!("text_weight:  {:.1}", analysis.weights.text);
        println!("source:       {:?}", analysis.source);
        if let Some(reason) = &analysis.degraded {
            println!("degraded:     {}", reason);
        }
    }
    Ok(())
}

pub async fn run_classify(
    config: &Config,
    limit: Option<usize>,
    batch_size: Option<usize>,
    progress: Option<ProgressMode>,
) -> Result<()> {
    let profiles = source_profiles(config, limit)?;
    let model = app::model(config)?;
    let aggregator = app::aggregator(config, model.as_ref())?;
    let store = app::store(config)?;
    store
        .ensure_collection(aggregator.output_dims(), Distance::Cosine)
        .await?;
    let pool = db::connect(config).await?;
    migrate::migrate(&pool).await?;

    let policy = config.retry.policy();
    let centroids = build_centroids(
        model.as_ref(),
        &aggregator,
        &config.classifier.human_exemplars,
        &config.classifier.brand_exemplars,
        config.classifier.margin_scale,
        &policy,
        config.embedding.timeout(),
    )
    .await
    .context("failed to embed classifier exemplars")?;

    let judge = app::judge(config)?;
    if judge.is_none() {
        tracing::warn!("classifier language model disabled; using embedding votes only");
    }
    let classifier = Arc::new(AccountClassifier::new(
        store,
        judge,
        Arc::new(app::limiter(config)),
        centroids,
        pool.clone(),
        ClassifierSettings {
            threshold: config.classifier.threshold,
            max_captions: config.classifier.max_captions,
            max_budget_wait: std::time::Duration::from_secs(config.classifier.max_budget_wait_secs),
            policy,
            llm_timeout: config.classifier.llm.timeout(),
        },
    ));

    let cancel = cancel_on_ctrl_c();
    let progress = progress.unwrap_or_else(ProgressMode::default_for_tty).reporter();
    let report = classifier
        .run(
            profiles,
            batch_size.unwrap_or(config.pipeline.batch_size),
            &cancel,
            progress.as_ref(),
        )
        .await;
    pool.close().await;
    print_report("classify", &report)
}

pub async fn run_image_validate(config: &Config, url: &str) -> Result<()> {
    let images = app::images(config);
    match images.resolve(url).await {
        Ok(bytes) => {
            println!("valid: {} bytes", bytes.len());
            println!("cached: {}", images.cache_path(url).display());
            Ok(())
        }
        Err(e) => bail!("invalid: {}", e),
    }
}

pub async fn run_image_evict(config: &Config, url: Option<&str>, all: bool) -> Result<()> {
    let images = app::images(config);
    if all {
        let n = images.clear().await?;
        println!("Removed {} cached images", n);
        return Ok(());
    }
    let Some(url) = url else {
        bail!("Pass a URL or --all");
    };
    if images.evict(url).await? {
        println!("Evicted {}", url);
    } else {
        println!("Not cached: {}", url);
    }
    Ok(())
}

pub async fn run_status(config: &Config) -> Result<()> {
    println!("Profile Fusion Status");
    println!("=====================");
    println!();
    println!("  Database:   {}", config.db.path.display());

    if Path::new(&config.db.path).exists() {
        let pool = db::connect(config).await?;
        migrate::migrate(&pool).await?;
        println!("  Indexed:    {}", db::count_indexed(&pool).await?);
        for (state, n) in db::count_by_state(&pool).await? {
            println!("  {:<11} {}", format!("{}:", state.to_lowercase()), n);
        }
        pool.close().await;
    } else {
        println!("  (not initialized; run `pfx init`)");
    }

    println!();
    println!("  Collection: {} at {}", config.store.collection, config.store.url);
    // One attempt: status should not sit through backoff for a down server.
    match QdrantStore::new(&config.store, RetryPolicy::none()) {
        Ok(store) => match store.count().await {
            Ok(n) => println!("  Points:     {}", n),
            Err(e) => println!("  Points:     unavailable ({})", e),
        },
        Err(e) => println!("  Points:     unavailable ({})", e),
    }
    Ok(())
}
