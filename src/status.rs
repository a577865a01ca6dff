//! Pipeline status overview.
//!
//! `fqd status` summarizes what is stored and how fresh each stage's
//! output is per partition, so a run of the pipeline can be sequenced (or
//! skipped) with confidence. Freshness is decided the same way the stage
//! runner decides it: by comparing stored markers against the current
//! input fingerprints, never by file timestamps.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::extract::{
    CASES_LOGIC_VERSION, CASES_STAGE, FACTS_LOGIC_VERSION, FACTS_STAGE, QUESTIONS_LOGIC_VERSION,
    QUESTIONS_STAGE,
};
use crate::runner::get_marker;
use crate::store;
use crate::{aggregate, categorize, normalize, runner};

/// Freshness of one (partition, stage) pair.
fn freshness(marker: Option<String>, current: &str) -> &'static str {
    match marker {
        None => "missing",
        Some(fp) if fp == current => "fresh",
        Some(_) => "stale",
    }
}

pub async fn run_status(pool: &SqlitePool) -> Result<()> {
    let partitions = store::list_partitions(pool, None).await?;

    let total_messages: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages")
        .fetch_one(pool)
        .await?;
    let total_agg: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM agg_questions")
        .fetch_one(pool)
        .await?;
    let total_categories: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM categories")
        .fetch_one(pool)
        .await?;

    println!("faq-digest — pipeline status");
    println!("============================");
    println!();
    println!("  Messages:             {}", total_messages);
    println!("  Partitions:           {}", partitions.len());
    println!("  Aggregated questions: {}", total_agg);
    println!("  Categories:           {}", total_categories);

    if !partitions.is_empty() {
        println!();
        println!(
            "  {:<10} {:>9}   {:<10} {:<12} {:<10}",
            "PARTITION", "MESSAGES", "FACTS", "QUESTIONS", "CASES"
        );
        println!("  {}", "-".repeat(58));

        for month in &partitions {
            let key = month.key();
            let count: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE partition = ?")
                    .bind(&key)
                    .fetch_one(pool)
                    .await?;
            let messages = store::read_messages(pool, month).await?;

            let mut cells: Vec<&'static str> = Vec::with_capacity(3);
            for (stage, version) in [
                (FACTS_STAGE, FACTS_LOGIC_VERSION),
                (QUESTIONS_STAGE, QUESTIONS_LOGIC_VERSION),
                (CASES_STAGE, CASES_LOGIC_VERSION),
            ] {
                let current = runner::messages_fingerprint(&messages, version);
                let marker = get_marker(pool, &key, stage).await?;
                cells.push(freshness(marker, &current));
            }

            println!(
                "  {:<10} {:>9}   {:<10} {:<12} {:<10}",
                key, count, cells[0], cells[1], cells[2]
            );
        }
    }

    // Global stages only report marker presence; recomputing their input
    // fingerprints here would mean re-reading every upstream table.
    println!();
    for stage in [aggregate::STAGE, categorize::STAGE, normalize::STAGE] {
        let marker = get_marker(pool, runner::GLOBAL_PARTITION, stage).await?;
        let state = if marker.is_some() { "recorded" } else { "never run" };
        println!("  {:<22} {}", stage, state);
    }
    println!();

    Ok(())
}
