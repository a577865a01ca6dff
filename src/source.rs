//! Corpus sources: paginated access to the channel's message history.
//!
//! The transport and authentication against the originating chat service
//! are outside this tool; the pipeline only needs
//! [`CorpusSource::fetch_since`]. The built-in [`JsonExportSource`] serves
//! pages from a JSON export file produced by whatever client talks to the
//! channel.

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::models::Message;

/// Read-only, paginated access to historical messages.
#[async_trait]
pub trait CorpusSource: Send + Sync {
    /// Messages with ids strictly greater than `cursor`, oldest first,
    /// plus the cursor to pass on the next call. An empty batch means the
    /// source is drained.
    async fn fetch_since(&self, cursor: Option<i64>) -> Result<(Vec<Message>, Option<i64>)>;
}

/// A corpus source backed by a JSON export file.
///
/// The export is a JSON array of message objects in the shape of
/// [`Message`]. The file is loaded once and served in id order in pages of
/// `page_size`.
pub struct JsonExportSource {
    messages: Vec<Message>,
    page_size: usize,
}

impl JsonExportSource {
    pub fn open(path: &Path, page_size: usize) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read export file: {}", path.display()))?;
        let mut messages: Vec<Message> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse export file: {}", path.display()))?;
        messages.sort_by_key(|m| m.id);
        messages.dedup_by_key(|m| m.id);
        Ok(Self {
            messages,
            page_size: page_size.max(1),
        })
    }
}

#[async_trait]
impl CorpusSource for JsonExportSource {
    async fn fetch_since(&self, cursor: Option<i64>) -> Result<(Vec<Message>, Option<i64>)> {
        let start = cursor.unwrap_or(i64::MIN);
        let batch: Vec<Message> = self
            .messages
            .iter()
            .filter(|m| m.id > start)
            .take(self.page_size)
            .cloned()
            .collect();
        let next = batch.last().map(|m| m.id).or(cursor);
        Ok((batch, next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono::Utc;

    fn export_json() -> String {
        let mk = |id: i64, day: u32| {
            serde_json::json!({
                "id": id,
                "timestamp": Utc.with_ymd_and_hms(2023, 1, day, 12, 0, 0).unwrap(),
                "author": "alice",
                "body": format!("message {}", id),
            })
        };
        serde_json::to_string(&vec![mk(3, 3), mk(1, 1), mk(2, 2)]).unwrap()
    }

    #[tokio::test]
    async fn serves_pages_in_id_order() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("export.json");
        std::fs::write(&path, export_json()).unwrap();

        let source = JsonExportSource::open(&path, 2).unwrap();
        let (batch, next) = source.fetch_since(None).await.unwrap();
        assert_eq!(batch.iter().map(|m| m.id).collect::<Vec<_>>(), vec![1, 2]);

        let (batch, _) = source.fetch_since(next).await.unwrap();
        assert_eq!(batch.iter().map(|m| m.id).collect::<Vec<_>>(), vec![3]);
    }

    #[tokio::test]
    async fn cursor_skips_already_fetched() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("export.json");
        std::fs::write(&path, export_json()).unwrap();

        let source = JsonExportSource::open(&path, 10).unwrap();
        let (batch, _) = source.fetch_since(Some(2)).await.unwrap();
        assert_eq!(batch.iter().map(|m| m.id).collect::<Vec<_>>(), vec![3]);

        let (batch, _) = source.fetch_since(Some(3)).await.unwrap();
        assert!(batch.is_empty());
    }
}
