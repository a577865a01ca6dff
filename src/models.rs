//! Core data models used throughout the digest pipeline.
//!
//! These types represent the messages, per-partition extraction records, and
//! globally aggregated entities that flow through the stages. Everything that
//! crosses a stage boundary is (de)serializable, since on-disk state between
//! stages is the contract.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single chat message. Immutable once stored; owned by the partition
/// store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub author: String,
    pub body: String,
    /// Weak back-reference to the message this one replies to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<i64>,
}

/// A piece of extracted text with its originating message ids. The message
/// ids are the provenance chain back into the raw corpus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub text: String,
    pub message_ids: Vec<i64>,
}

/// One extracted question and the answers observed for it within a single
/// partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionRecord {
    pub question: String,
    pub answers: Vec<Summary>,
}

/// One extracted case (a concrete user story with an outcome) within a
/// single partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseRecord {
    pub approved: bool,
    pub summary: Summary,
}

/// Collaborator response for facts extraction.
#[derive(Debug, Deserialize)]
pub struct FactsResponse {
    pub facts: Vec<Summary>,
}

/// Collaborator response for questions extraction.
#[derive(Debug, Deserialize)]
pub struct QuestionsResponse {
    pub questions: Vec<QuestionRecord>,
}

/// Collaborator response for cases extraction.
#[derive(Debug, Deserialize)]
pub struct CasesResponse {
    pub cases: Vec<CaseRecord>,
}

/// A deduplicated question merged from one or more per-partition records.
/// Carries the union of provenance across everything that was merged in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatedQuestion {
    /// Phrasing of the earliest-provenance merged record.
    pub canonical: String,
    /// Case-folded, punctuation-stripped, whitespace-collapsed form; the
    /// identity of the question within the aggregated set.
    pub normalized: String,
    pub answers: Vec<Summary>,
    /// Partitions that contributed at least one merged record, sorted.
    pub partitions: Vec<String>,
    /// Union of originating message ids, sorted.
    pub message_ids: Vec<i64>,
}

/// A category of the final taxonomy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub label: String,
    #[serde(default)]
    pub description: String,
}

/// One assignment row returned by the categorization collaborator. Indices
/// are 1-based into the question and category lists sent with the request.
#[derive(Debug, Deserialize)]
pub struct RawAssignment {
    pub question_id: usize,
    #[serde(default)]
    pub category_id: Option<usize>,
    #[serde(default)]
    pub new_label: Option<String>,
    #[serde(default)]
    pub new_description: Option<String>,
}

/// Collaborator response for question categorization.
#[derive(Debug, Deserialize)]
pub struct CategorizationResponse {
    pub assignments: Vec<RawAssignment>,
}

/// Collaborator response for category description polish.
#[derive(Debug, Deserialize)]
pub struct DescriptionsResponse {
    pub descriptions: Vec<Category>,
}
