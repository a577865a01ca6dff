//! Corpus ingestion: pull new messages from the source into the partition
//! store.
//!
//! The cursor is the highest message id already stored, so re-fetching an
//! overlapping export is harmless: duplicates are skipped as recoverable,
//! never overwritten. Fetch appends only — it never rewrites a partition.

use std::collections::BTreeSet;

use anyhow::Result;
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::error::PipelineError;
use crate::source::CorpusSource;
use crate::store;

pub async fn run_fetch(pool: &SqlitePool, source: &dyn CorpusSource) -> Result<()> {
    let mut cursor = store::last_message_id(pool).await?;
    info!(?cursor, "fetching messages");

    let mut fetched = 0usize;
    let mut appended = 0usize;
    let mut duplicates = 0usize;
    let mut touched: BTreeSet<String> = BTreeSet::new();

    loop {
        let (batch, next) = source.fetch_since(cursor).await?;
        if batch.is_empty() {
            break;
        }
        fetched += batch.len();

        for msg in &batch {
            match store::append_message(pool, msg).await {
                Ok(month) => {
                    debug!(id = msg.id, partition = %month, "stored message");
                    touched.insert(month.key());
                    appended += 1;
                }
                Err(PipelineError::DuplicateMessage { partition, message_id }) => {
                    debug!(id = message_id, partition = %partition, "duplicate, skipped");
                    duplicates += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }

        cursor = next;
    }

    println!("fetch");
    println!("  fetched: {} messages", fetched);
    println!("  appended: {}", appended);
    println!("  duplicates skipped: {}", duplicates);
    println!(
        "  partitions touched: {}",
        if touched.is_empty() {
            "none".to_string()
        } else {
            touched.into_iter().collect::<Vec<_>>().join(", ")
        }
    );
    println!("ok");
    Ok(())
}
