//! Per-partition extraction stages: facts, questions, cases.
//!
//! Each stage sends one collaborator call per stale partition and persists
//! the typed records wholesale for that partition. A collaborator failure
//! surfaces as `ExtractionFailed(partition)` and leaves the partition's
//! previous records and marker untouched — degradation, never corruption.
//! Every record keeps the originating message ids so it can be traced back
//! to the raw corpus by a reader or a test.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use sqlx::SqlitePool;

use crate::error::PipelineError;
use crate::models::{CasesResponse, FactsResponse, Message, QuestionsResponse};
use crate::partition::Month;
use crate::provider::{format_json, ExtractKind, Provider};
use crate::runner::{set_marker, PartitionStage};

pub const FACTS_STAGE: &str = "extract-facts";
pub const QUESTIONS_STAGE: &str = "extract-questions";
pub const CASES_STAGE: &str = "extract-cases";

pub const FACTS_LOGIC_VERSION: &str = "facts-v1";
pub const QUESTIONS_LOGIC_VERSION: &str = "questions-v1";
pub const CASES_LOGIC_VERSION: &str = "cases-v1";

/// Message fields sent to the collaborator; storage metadata stays home.
#[derive(Serialize)]
struct MessagePayload<'a> {
    id: i64,
    author: &'a str,
    body: &'a str,
}

#[derive(Serialize)]
struct PartitionPayload<'a> {
    month: String,
    messages: Vec<MessagePayload<'a>>,
}

fn build_prompt(month: &Month, messages: &[Message]) -> Result<String, PipelineError> {
    let payload = PartitionPayload {
        month: month.key(),
        messages: messages
            .iter()
            .map(|m| MessagePayload {
                id: m.id,
                author: &m.author,
                body: &m.body,
            })
            .collect(),
    };
    format_json("Messages", &payload)
}

/// One of the three extraction stages, parameterized by kind.
pub struct ExtractionStage {
    kind: ExtractKind,
    provider: Arc<dyn Provider>,
}

impl ExtractionStage {
    pub fn facts(provider: Arc<dyn Provider>) -> Self {
        Self {
            kind: ExtractKind::Facts,
            provider,
        }
    }

    pub fn questions(provider: Arc<dyn Provider>) -> Self {
        Self {
            kind: ExtractKind::Questions,
            provider,
        }
    }

    pub fn cases(provider: Arc<dyn Provider>) -> Self {
        Self {
            kind: ExtractKind::Cases,
            provider,
        }
    }
}

#[async_trait]
impl PartitionStage for ExtractionStage {
    fn name(&self) -> &'static str {
        match self.kind {
            ExtractKind::Facts => FACTS_STAGE,
            ExtractKind::Questions => QUESTIONS_STAGE,
            ExtractKind::Cases => CASES_STAGE,
            _ => unreachable!("not a per-partition extraction kind"),
        }
    }

    fn logic_version(&self) -> &'static str {
        match self.kind {
            ExtractKind::Facts => FACTS_LOGIC_VERSION,
            ExtractKind::Questions => QUESTIONS_LOGIC_VERSION,
            ExtractKind::Cases => CASES_LOGIC_VERSION,
            _ => unreachable!("not a per-partition extraction kind"),
        }
    }

    async fn process(
        &self,
        pool: &SqlitePool,
        month: &Month,
        messages: &[Message],
        fingerprint: &str,
    ) -> Result<(), PipelineError> {
        let prompt = build_prompt(month, messages)?;

        // Nothing is written until the collaborator call has succeeded and
        // parsed, so a failing call cannot drop the prior output.
        let response = self
            .provider
            .request(self.kind, &prompt)
            .await
            .map_err(|e| PipelineError::extraction(&month.key(), e))?;

        let partition = month.key();
        match self.kind {
            ExtractKind::Facts => {
                let parsed: FactsResponse = serde_json::from_value(response)
                    .map_err(|e| PipelineError::extraction(&partition, e))?;
                let mut tx = pool.begin().await?;
                sqlx::query("DELETE FROM facts WHERE partition = ?")
                    .bind(&partition)
                    .execute(&mut *tx)
                    .await?;
                for (seq, fact) in parsed.facts.iter().enumerate() {
                    sqlx::query(
                        "INSERT INTO facts (partition, seq, text, message_ids) VALUES (?, ?, ?, ?)",
                    )
                    .bind(&partition)
                    .bind(seq as i64)
                    .bind(&fact.text)
                    .bind(serde_json::to_string(&fact.message_ids)?)
                    .execute(&mut *tx)
                    .await?;
                }
                set_marker(&mut tx, &partition, self.name(), fingerprint).await?;
                tx.commit().await?;
            }
            ExtractKind::Questions => {
                let parsed: QuestionsResponse = serde_json::from_value(response)
                    .map_err(|e| PipelineError::extraction(&partition, e))?;
                let mut tx = pool.begin().await?;
                sqlx::query("DELETE FROM questions WHERE partition = ?")
                    .bind(&partition)
                    .execute(&mut *tx)
                    .await?;
                for (seq, q) in parsed.questions.iter().enumerate() {
                    sqlx::query(
                        "INSERT INTO questions (partition, seq, question, answers) \
                         VALUES (?, ?, ?, ?)",
                    )
                    .bind(&partition)
                    .bind(seq as i64)
                    .bind(&q.question)
                    .bind(serde_json::to_string(&q.answers)?)
                    .execute(&mut *tx)
                    .await?;
                }
                set_marker(&mut tx, &partition, self.name(), fingerprint).await?;
                tx.commit().await?;
            }
            ExtractKind::Cases => {
                let parsed: CasesResponse = serde_json::from_value(response)
                    .map_err(|e| PipelineError::extraction(&partition, e))?;
                let mut tx = pool.begin().await?;
                sqlx::query("DELETE FROM cases WHERE partition = ?")
                    .bind(&partition)
                    .execute(&mut *tx)
                    .await?;
                for (seq, case) in parsed.cases.iter().enumerate() {
                    sqlx::query(
                        "INSERT INTO cases (partition, seq, approved, text, message_ids) \
                         VALUES (?, ?, ?, ?, ?)",
                    )
                    .bind(&partition)
                    .bind(seq as i64)
                    .bind(case.approved)
                    .bind(&case.summary.text)
                    .bind(serde_json::to_string(&case.summary.message_ids)?)
                    .execute(&mut *tx)
                    .await?;
                }
                set_marker(&mut tx, &partition, self.name(), fingerprint).await?;
                tx.commit().await?;
            }
            _ => unreachable!("not a per-partition extraction kind"),
        }

        Ok(())
    }
}
