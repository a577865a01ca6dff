//! The partition store: the append-only message corpus, sharded by month.
//!
//! This module exclusively owns `messages` and the partition boundaries.
//! Writes are INSERT-only; historical messages are never mutated, which
//! keeps every extracted record auditable back to its source. Downstream
//! stages read partitions through here and own their output tables
//! themselves.

use sqlx::{Row, SqlitePool};

use crate::error::PipelineError;
use crate::models::Message;
use crate::partition::Month;

/// Append a message to the partition matching its timestamp.
///
/// Returns the partition it was routed to, or
/// [`PipelineError::DuplicateMessage`] if that partition already holds the
/// id. Duplicates are expected on overlapping fetches; callers skip them.
pub async fn append_message(pool: &SqlitePool, msg: &Message) -> Result<Month, PipelineError> {
    let month = Month::from_timestamp(&msg.timestamp);
    let partition = month.key();

    let exists: Option<i64> =
        sqlx::query_scalar("SELECT id FROM messages WHERE partition = ? AND id = ?")
            .bind(&partition)
            .bind(msg.id)
            .fetch_optional(pool)
            .await?;

    if exists.is_some() {
        return Err(PipelineError::DuplicateMessage {
            partition,
            message_id: msg.id,
        });
    }

    sqlx::query(
        "INSERT INTO messages (partition, id, ts, author, body, reply_to) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&partition)
    .bind(msg.id)
    .bind(msg.timestamp.timestamp())
    .bind(&msg.author)
    .bind(&msg.body)
    .bind(msg.reply_to)
    .execute(pool)
    .await?;

    Ok(month)
}

/// The `max` most recent partitions, newest first.
pub async fn list_partitions(
    pool: &SqlitePool,
    max: Option<usize>,
) -> Result<Vec<Month>, PipelineError> {
    let limit = max.map(|m| m as i64).unwrap_or(-1);
    let rows = sqlx::query(
        "SELECT DISTINCT partition FROM messages ORDER BY partition DESC LIMIT ?",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    let mut months = Vec::with_capacity(rows.len());
    for row in rows {
        let key: String = row.get("partition");
        let month = Month::from_key(&key).map_err(|e| {
            PipelineError::InvariantViolation(format!("corrupt partition key '{}': {}", key, e))
        })?;
        months.push(month);
    }
    Ok(months)
}

/// All messages of one partition in stable (timestamp, id) order.
pub async fn read_messages(
    pool: &SqlitePool,
    month: &Month,
) -> Result<Vec<Message>, PipelineError> {
    let rows = sqlx::query(
        "SELECT id, ts, author, body, reply_to FROM messages \
         WHERE partition = ? ORDER BY ts, id",
    )
    .bind(month.key())
    .fetch_all(pool)
    .await?;

    let mut messages = Vec::with_capacity(rows.len());
    for row in rows {
        let ts: i64 = row.get("ts");
        let timestamp = chrono::DateTime::from_timestamp(ts, 0).ok_or_else(|| {
            PipelineError::InvariantViolation(format!("corrupt timestamp {} in store", ts))
        })?;
        messages.push(Message {
            id: row.get("id"),
            timestamp,
            author: row.get("author"),
            body: row.get("body"),
            reply_to: row.get("reply_to"),
        });
    }
    Ok(messages)
}

/// Highest stored message id across all partitions; the fetch cursor.
pub async fn last_message_id(pool: &SqlitePool) -> Result<Option<i64>, PipelineError> {
    let id: Option<i64> = sqlx::query_scalar("SELECT MAX(id) FROM messages")
        .fetch_one(pool)
        .await?;
    Ok(id)
}
