//! Schema creation for the digest store.
//!
//! `fqd init` runs these statements; all are idempotent. Layout follows the
//! persisted contract: message and extraction tables are addressed by
//! partition key (`YYYY-MM`), the aggregated/category tables are global, and
//! `stage_markers` records one fingerprint per (partition, stage) pair.

use anyhow::Result;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;

    // Raw corpus, append-only. The (partition, id) key is what makes
    // duplicate ingestion detectable.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            partition TEXT NOT NULL,
            id INTEGER NOT NULL,
            ts INTEGER NOT NULL,
            author TEXT NOT NULL,
            body TEXT NOT NULL,
            reply_to INTEGER,
            PRIMARY KEY (partition, id)
        )
        "#,
    )
    .execute(&pool)
    .await?;

    // Per-partition extraction outputs. Each table is owned by exactly one
    // stage, which replaces a partition's rows wholesale.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS facts (
            partition TEXT NOT NULL,
            seq INTEGER NOT NULL,
            text TEXT NOT NULL,
            message_ids TEXT NOT NULL,
            PRIMARY KEY (partition, seq)
        )
        "#,
    )
    .execute(&pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS questions (
            partition TEXT NOT NULL,
            seq INTEGER NOT NULL,
            question TEXT NOT NULL,
            answers TEXT NOT NULL,
            PRIMARY KEY (partition, seq)
        )
        "#,
    )
    .execute(&pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS cases (
            partition TEXT NOT NULL,
            seq INTEGER NOT NULL,
            approved INTEGER NOT NULL,
            text TEXT NOT NULL,
            message_ids TEXT NOT NULL,
            PRIMARY KEY (partition, seq)
        )
        "#,
    )
    .execute(&pool)
    .await?;

    // Global aggregated question set, keyed by normalized text.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS agg_questions (
            normalized TEXT PRIMARY KEY,
            canonical TEXT NOT NULL,
            answers TEXT NOT NULL,
            partitions TEXT NOT NULL,
            message_ids TEXT NOT NULL
        )
        "#,
    )
    .execute(&pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS categories (
            label TEXT PRIMARY KEY,
            description TEXT NOT NULL DEFAULT ''
        )
        "#,
    )
    .execute(&pool)
    .await?;

    // Assignment of aggregated questions to categories. Kept separate from
    // agg_questions so re-aggregation does not erase labels; the
    // categorization stage reuses surviving assignments for stability.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS question_categories (
            normalized TEXT PRIMARY KEY,
            category TEXT NOT NULL
        )
        "#,
    )
    .execute(&pool)
    .await?;

    // Staleness markers: one fingerprint per (partition, stage). Global
    // stages record theirs under the reserved partition key 'all'.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS stage_markers (
            partition TEXT NOT NULL,
            stage TEXT NOT NULL,
            fingerprint TEXT NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (partition, stage)
        )
        "#,
    )
    .execute(&pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_ts ON messages(partition, ts, id)")
        .execute(&pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_question_categories_category \
         ON question_categories(category)",
    )
    .execute(&pool)
    .await?;

    pool.close().await;
    Ok(())
}
