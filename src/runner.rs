//! Stage execution: staleness fingerprints, markers, and the bounded
//! per-partition driver.
//!
//! A stage run over a partition is skipped when the stored marker equals
//! the fingerprint of the partition's current input plus the stage's logic
//! version. Stages persist output and marker in one transaction, so a crash
//! mid-partition leaves the old marker behind and the next run safely
//! recomputes exactly that partition. Partition failures are isolated: they
//! are logged, counted, and do not stop the other partitions.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::error::PipelineError;
use crate::models::Message;
use crate::partition::Month;
use crate::store;

/// Marker partition key used by whole-corpus stages (aggregation,
/// categorization, normalization).
pub const GLOBAL_PARTITION: &str = "all";

/// Fingerprint of a partition's messages under a stage's logic version.
pub fn messages_fingerprint(messages: &[Message], logic_version: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(logic_version.as_bytes());
    for msg in messages {
        hasher.update(msg.id.to_le_bytes());
        hasher.update(msg.body.as_bytes());
        hasher.update(b"\x1f");
    }
    format!("{:x}", hasher.finalize())
}

/// Fingerprint of arbitrary stage input parts under a logic version. Used
/// by the global stages, whose input is upstream table content rather than
/// raw messages.
pub fn content_fingerprint(parts: &[&str], logic_version: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(logic_version.as_bytes());
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update(b"\x1f");
    }
    format!("{:x}", hasher.finalize())
}

/// Stored fingerprint for (partition, stage), if any.
pub async fn get_marker(
    pool: &SqlitePool,
    partition: &str,
    stage: &str,
) -> Result<Option<String>, PipelineError> {
    let fp: Option<String> = sqlx::query_scalar(
        "SELECT fingerprint FROM stage_markers WHERE partition = ? AND stage = ?",
    )
    .bind(partition)
    .bind(stage)
    .fetch_optional(pool)
    .await?;
    Ok(fp)
}

/// Record a successful stage run. Always called inside the same
/// transaction that writes the stage's output, never on its own.
pub async fn set_marker(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    partition: &str,
    stage: &str,
    fingerprint: &str,
) -> Result<(), PipelineError> {
    let now = chrono::Utc::now().timestamp();
    sqlx::query(
        r#"
        INSERT INTO stage_markers (partition, stage, fingerprint, updated_at)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(partition, stage) DO UPDATE SET
            fingerprint = excluded.fingerprint,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(partition)
    .bind(stage)
    .bind(fingerprint)
    .bind(now)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// A transformation that runs once per stale partition.
#[async_trait]
pub trait PartitionStage: Send + Sync {
    /// Stage name as used in markers and the CLI.
    fn name(&self) -> &'static str;

    /// Bumping this forces re-processing of every partition.
    fn logic_version(&self) -> &'static str;

    /// Transform one partition's messages and persist output plus the
    /// given marker fingerprint in a single transaction.
    async fn process(
        &self,
        pool: &SqlitePool,
        month: &Month,
        messages: &[Message],
        fingerprint: &str,
    ) -> Result<(), PipelineError>;
}

/// Outcome counts for one stage run.
#[derive(Debug, Default)]
pub struct RunReport {
    pub considered: usize,
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl RunReport {
    /// Print the teacher-facing summary and convert failures into a
    /// non-zero exit.
    pub fn finish(self, stage: &str) -> Result<()> {
        println!("{}", stage);
        println!("  partitions considered: {}", self.considered);
        println!("  processed: {}", self.processed);
        println!("  skipped (fresh): {}", self.skipped);
        println!("  failed: {}", self.failed);
        if self.failed > 0 {
            anyhow::bail!("{} partition(s) failed", self.failed);
        }
        println!("ok");
        Ok(())
    }
}

/// Run a partition stage over the `max_months` most recent partitions.
///
/// Partitions are independent, so they run concurrently on a pool bounded
/// by `max_concurrent` (the collaborator rate-limit control). Ordering
/// across partitions is not significant; each partition's read-then-write
/// is atomic inside [`PartitionStage::process`].
pub async fn run_partition_stage(
    pool: &SqlitePool,
    stage: Arc<dyn PartitionStage>,
    max_months: usize,
    max_concurrent: usize,
) -> Result<RunReport> {
    let months = store::list_partitions(pool, Some(max_months)).await?;
    let mut report = RunReport {
        considered: months.len(),
        ..RunReport::default()
    };

    let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));
    let mut tasks: JoinSet<(Month, Result<bool, PipelineError>)> = JoinSet::new();

    for month in months {
        let pool = pool.clone();
        let stage = Arc::clone(&stage);
        let semaphore = Arc::clone(&semaphore);
        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
            let outcome = process_partition(&pool, stage.as_ref(), &month).await;
            (month, outcome)
        });
    }

    while let Some(joined) = tasks.join_next().await {
        let (month, outcome) = joined?;
        match outcome {
            Ok(true) => {
                info!(partition = %month, stage = stage.name(), "processed");
                report.processed += 1;
            }
            Ok(false) => {
                info!(partition = %month, stage = stage.name(), "up to date, skipped");
                report.skipped += 1;
            }
            Err(err) => {
                warn!(partition = %month, stage = stage.name(), error = %err, "partition failed");
                report.failed += 1;
            }
        }
    }

    Ok(report)
}

/// Returns `Ok(true)` when the partition was (re)processed, `Ok(false)`
/// when its marker was fresh or it holds no messages.
async fn process_partition(
    pool: &SqlitePool,
    stage: &dyn PartitionStage,
    month: &Month,
) -> Result<bool, PipelineError> {
    let messages = store::read_messages(pool, month).await?;
    if messages.is_empty() {
        return Ok(false);
    }

    let fingerprint = messages_fingerprint(&messages, stage.logic_version());
    let marker = get_marker(pool, &month.key(), stage.name()).await?;
    if marker.as_deref() == Some(fingerprint.as_str()) {
        return Ok(false);
    }

    stage.process(pool, month, &messages, &fingerprint).await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn msg(id: i64, body: &str) -> Message {
        Message {
            id,
            timestamp: Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap(),
            author: "a".into(),
            body: body.into(),
            reply_to: None,
        }
    }

    #[test]
    fn fingerprint_changes_with_content() {
        let a = messages_fingerprint(&[msg(1, "hello")], "v1");
        let b = messages_fingerprint(&[msg(1, "hello!")], "v1");
        assert_ne!(a, b);
    }

    #[test]
    fn fingerprint_changes_with_logic_version() {
        let a = messages_fingerprint(&[msg(1, "hello")], "v1");
        let b = messages_fingerprint(&[msg(1, "hello")], "v2");
        assert_ne!(a, b);
    }

    #[test]
    fn fingerprint_stable_for_same_input() {
        let a = messages_fingerprint(&[msg(1, "hello"), msg(2, "world")], "v1");
        let b = messages_fingerprint(&[msg(1, "hello"), msg(2, "world")], "v1");
        assert_eq!(a, b);
    }

    #[test]
    fn content_fingerprint_separates_parts() {
        // "ab" + "c" must not collide with "a" + "bc".
        let a = content_fingerprint(&["ab", "c"], "v1");
        let b = content_fingerprint(&["a", "bc"], "v1");
        assert_ne!(a, b);
    }
}
