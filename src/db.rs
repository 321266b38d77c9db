//! SQLite progress store.
//!
//! Holds what the vector store cannot answer cheaply: which content hash
//! each profile was indexed with, and where each profile is in the
//! classification state machine. Both tables are written only after the
//! corresponding vector-store write succeeded, so a crash or cancellation
//! never records progress that did not happen.

use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use profile_fusion_core::classify::{ClassificationResult, ClassificationState, LlmOutcome, Vote};

use crate::config::Config;

pub async fn connect(config: &Config) -> Result<SqlitePool> {
    connect_path(&config.db.path).await
}

pub async fn connect_path(db_path: &Path) -> Result<SqlitePool> {
    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    Ok(pool)
}

// ============ Indexing progress ============

/// Content hash the profile was last indexed with.
pub async fn indexed_hash(pool: &SqlitePool, profile_id: &str) -> Result<Option<String>> {
    let hash: Option<String> =
        sqlx::query_scalar("SELECT content_hash FROM indexed_profiles WHERE profile_id = ?")
            .bind(profile_id)
            .fetch_optional(pool)
            .await?;
    Ok(hash)
}

pub async fn record_indexed(pool: &SqlitePool, profile_id: &str, content_hash: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO indexed_profiles (profile_id, content_hash, indexed_at)
        VALUES (?, ?, ?)
        ON CONFLICT(profile_id) DO UPDATE SET
            content_hash = excluded.content_hash,
            indexed_at = excluded.indexed_at
        "#,
    )
    .bind(profile_id)
    .bind(content_hash)
    .bind(chrono::Utc::now().timestamp())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn count_indexed(pool: &SqlitePool) -> Result<i64> {
    let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM indexed_profiles")
        .fetch_one(pool)
        .await?;
    Ok(n)
}

// ============ Classification progress ============

pub async fn classification_state(
    pool: &SqlitePool,
    profile_id: &str,
) -> Result<Option<ClassificationState>> {
    let state: Option<String> =
        sqlx::query_scalar("SELECT state FROM classification_progress WHERE profile_id = ?")
            .bind(profile_id)
            .fetch_optional(pool)
            .await?;
    Ok(state.and_then(|s| ClassificationState::parse(&s)))
}

/// Persist a reconciled result.
pub async fn save_result(pool: &SqlitePool, result: &ClassificationResult) -> Result<()> {
    let embedding_vote = serde_json::to_string(&result.embedding_vote)?;
    let llm_vote = serde_json::to_string(&result.llm_vote)?;
    sqlx::query(
        r#"
        INSERT INTO classification_progress
            (profile_id, state, embedding_vote, llm_vote, final_label, confidence, reason, ambiguous, error, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, NULL, ?)
        ON CONFLICT(profile_id) DO UPDATE SET
            state = excluded.state,
            embedding_vote = excluded.embedding_vote,
            llm_vote = excluded.llm_vote,
            final_label = excluded.final_label,
            confidence = excluded.confidence,
            reason = excluded.reason,
            ambiguous = excluded.ambiguous,
            error = NULL,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&result.profile_id)
    .bind(ClassificationState::Reconciled.as_str())
    .bind(embedding_vote)
    .bind(llm_vote)
    .bind(result.final_label.as_str())
    .bind(f64::from(result.confidence))
    .bind(&result.reconciliation_reason)
    .bind(result.ambiguous)
    .bind(chrono::Utc::now().timestamp())
    .execute(pool)
    .await?;
    Ok(())
}

/// Persist a failure. Earlier votes for the profile are cleared.
pub async fn save_failure(pool: &SqlitePool, profile_id: &str, error: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO classification_progress (profile_id, state, error, updated_at)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(profile_id) DO UPDATE SET
            state = excluded.state,
            embedding_vote = NULL,
            llm_vote = NULL,
            final_label = NULL,
            confidence = NULL,
            reason = NULL,
            ambiguous = 0,
            error = excluded.error,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(profile_id)
    .bind(ClassificationState::Failed.as_str())
    .bind(error)
    .bind(chrono::Utc::now().timestamp())
    .execute(pool)
    .await?;
    Ok(())
}

/// Load a reconciled result, if the profile has one.
pub async fn load_result(pool: &SqlitePool, profile_id: &str) -> Result<Option<ClassificationResult>> {
    let row = sqlx::query(
        r#"
        SELECT embedding_vote, llm_vote, final_label, confidence, reason, ambiguous
        FROM classification_progress
        WHERE profile_id = ? AND state = 'RECONCILED'
        "#,
    )
    .bind(profile_id)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    let embedding_vote: Vote = serde_json::from_str(&row.try_get::<String, _>("embedding_vote")?)
        .context("corrupt embedding_vote")?;
    let llm_vote: LlmOutcome = serde_json::from_str(&row.try_get::<String, _>("llm_vote")?)
        .context("corrupt llm_vote")?;
    let label: String = row.try_get("final_label")?;
    let confidence: f64 = row.try_get("confidence")?;

    Ok(Some(ClassificationResult {
        profile_id: profile_id.to_string(),
        embedding_vote,
        llm_vote,
        final_label: label.parse().map_err(anyhow::Error::msg)?,
        confidence: confidence as f32,
        reconciliation_reason: row.try_get("reason")?,
        ambiguous: row.try_get("ambiguous")?,
    }))
}

/// Number of profiles per classification state.
pub async fn count_by_state(pool: &SqlitePool) -> Result<Vec<(String, i64)>> {
    let rows = sqlx::query(
        "SELECT state, COUNT(*) AS n FROM classification_progress GROUP BY state ORDER BY state",
    )
    .fetch_all(pool)
    .await?;
    let mut counts = Vec::with_capacity(rows.len());
    for row in rows {
        counts.push((row.try_get("state")?, row.try_get("n")?));
    }
    Ok(counts)
}
