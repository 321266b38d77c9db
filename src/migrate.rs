use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create the progress tables. Idempotent.
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    // Indexing progress: one row per profile upserted into the vector store
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS indexed_profiles (
            profile_id TEXT PRIMARY KEY,
            content_hash TEXT NOT NULL,
            indexed_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Classification progress: terminal states only
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS classification_progress (
            profile_id TEXT PRIMARY KEY,
            state TEXT NOT NULL,
            embedding_vote TEXT,
            llm_vote TEXT,
            final_label TEXT,
            confidence REAL,
            reason TEXT,
            ambiguous INTEGER NOT NULL DEFAULT 0,
            error TEXT,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_classification_state ON classification_progress(state)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
