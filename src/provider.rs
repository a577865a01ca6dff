//! Text-understanding collaborator abstraction and implementations.
//!
//! The pipeline treats the collaborator as an opaque, possibly-failing,
//! possibly-nondeterministic function from a prompt to structured JSON.
//! Core stages carry no retry logic of their own; retries and backoff live
//! in the provider adapter.
//!
//! Implementations:
//! - **[`DisabledProvider`]** — always fails; used when no collaborator is
//!   configured so that pure stages remain runnable.
//! - **[`OpenAiProvider`]** — OpenAI-compatible chat completions with JSON
//!   response format, retry, and backoff.
//!
//! # Retry strategy (OpenAI adapter)
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::config::CollaboratorConfig;
use crate::error::PipelineError;

/// Which transformation the collaborator is asked to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractKind {
    Facts,
    Questions,
    Cases,
    Categorize,
    Normalize,
}

impl ExtractKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractKind::Facts => "facts",
            ExtractKind::Questions => "questions",
            ExtractKind::Cases => "cases",
            ExtractKind::Categorize => "categorize",
            ExtractKind::Normalize => "normalize",
        }
    }
}

/// A text-understanding collaborator.
///
/// `request` sends a prompt for the given extraction kind and returns the
/// parsed JSON object from the response. Callers deserialize it into their
/// typed response models and validate the result themselves.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    async fn request(
        &self,
        kind: ExtractKind,
        prompt: &str,
    ) -> Result<serde_json::Value, PipelineError>;
}

/// Instantiate the provider named in the configuration.
pub fn create_provider(config: &CollaboratorConfig) -> Result<Arc<dyn Provider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledProvider)),
        "openai" => Ok(Arc::new(OpenAiProvider::new(config)?)),
        other => anyhow::bail!("Unknown collaborator provider: {}", other),
    }
}

/// Render a titled JSON block for a prompt section.
///
/// Every payload handed to the collaborator goes through here so prompts
/// stay machine-checkable and stable across stages.
pub fn format_json<T: Serialize>(title: &str, value: &T) -> Result<String, PipelineError> {
    let json = serde_json::to_string(value)?;
    Ok(format!("{}:\n```json\n{}\n```\n", title, json))
}

// ============ Disabled Provider ============

/// A collaborator that always reports itself unavailable.
pub struct DisabledProvider;

#[async_trait]
impl Provider for DisabledProvider {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn request(
        &self,
        kind: ExtractKind,
        _prompt: &str,
    ) -> Result<serde_json::Value, PipelineError> {
        Err(PipelineError::CollaboratorUnavailable(format!(
            "collaborator provider is disabled (requested kind: {})",
            kind.as_str()
        )))
    }
}

// ============ OpenAI Provider ============

/// Collaborator backed by an OpenAI-compatible chat completions API.
///
/// Requires the `OPENAI_API_KEY` environment variable. Requests pin
/// `temperature` to 0 and ask for a JSON object response; the model still
/// is not deterministic, which is why the stages bias toward reusing
/// previously produced labels and phrasings.
pub struct OpenAiProvider {
    model: String,
    timeout_secs: u64,
    max_retries: u32,
}

impl OpenAiProvider {
    pub fn new(config: &CollaboratorConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("collaborator.model required for OpenAI provider"))?;

        if std::env::var("OPENAI_API_KEY").is_err() {
            anyhow::bail!("OPENAI_API_KEY environment variable not set");
        }

        Ok(Self {
            model,
            timeout_secs: config.timeout_secs,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.model
    }

    async fn request(
        &self,
        kind: ExtractKind,
        prompt: &str,
    ) -> Result<serde_json::Value, PipelineError> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| PipelineError::CollaboratorUnavailable("OPENAI_API_KEY not set".into()))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .build()
            .map_err(|e| PipelineError::CollaboratorUnavailable(e.to_string()))?;

        let body = serde_json::json!({
            "model": self.model,
            "temperature": 0,
            "response_format": {"type": "json_object"},
            "messages": [
                {"role": "system", "content": system_prompt(kind)},
                {"role": "user", "content": prompt},
            ],
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = client
                .post("https://api.openai.com/v1/chat/completions")
                .header("Authorization", format!("Bearer {}", api_key))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response.json().await.map_err(|e| {
                            PipelineError::CollaboratorUnavailable(e.to_string())
                        })?;
                        return parse_completion(&json);
                    }

                    // Rate limited or server error — retry
                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(format!("API error {}: {}", status, body_text));
                        continue;
                    }

                    // Client error (not 429) — don't retry
                    let body_text = response.text().await.unwrap_or_default();
                    return Err(PipelineError::CollaboratorUnavailable(format!(
                        "API error {}: {}",
                        status, body_text
                    )));
                }
                Err(e) => {
                    last_err = Some(e.to_string());
                    continue;
                }
            }
        }

        Err(PipelineError::CollaboratorUnavailable(
            last_err.unwrap_or_else(|| "request failed after retries".to_string()),
        ))
    }
}

/// Extract and parse the JSON object from a chat completion response.
fn parse_completion(json: &serde_json::Value) -> Result<serde_json::Value, PipelineError> {
    let content = json
        .pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .ok_or_else(|| {
            PipelineError::CollaboratorUnavailable(
                "invalid completion response: missing message content".to_string(),
            )
        })?;

    serde_json::from_str(content).map_err(|e| {
        PipelineError::CollaboratorUnavailable(format!(
            "completion content is not valid JSON: {}",
            e
        ))
    })
}

/// Instruction preamble per extraction kind. The detailed prompt content is
/// a collaborator concern; these set the task and the response envelope.
fn system_prompt(kind: ExtractKind) -> &'static str {
    match kind {
        ExtractKind::Facts => {
            "You distill chat messages into standalone facts. Respond with a JSON object \
             {\"facts\": [{\"text\": ..., \"message_ids\": [...]}]}."
        }
        ExtractKind::Questions => {
            "You distill chat messages into questions with their answers, for a future FAQ. \
             Respond with a JSON object {\"questions\": [{\"question\": ..., \"answers\": \
             [{\"text\": ..., \"message_ids\": [...]}]}]}."
        }
        ExtractKind::Cases => {
            "You extract concrete user cases with outcomes from chat messages. Respond with a \
             JSON object {\"cases\": [{\"approved\": true|false, \"summary\": {\"text\": ..., \
             \"message_ids\": [...]}}]}."
        }
        ExtractKind::Categorize => {
            "You assign each numbered question to one of the numbered categories, or propose a \
             new label when none fits. Respond with a JSON object {\"assignments\": \
             [{\"question_id\": N, \"category_id\": M}]} using {\"question_id\": N, \
             \"new_label\": ..., \"new_description\": ...} for new categories."
        }
        ExtractKind::Normalize => {
            "You write one-line descriptions for FAQ categories. Respond with a JSON object \
             {\"descriptions\": [{\"label\": ..., \"description\": ...}]}."
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_provider_fails_with_unavailable() {
        let provider = DisabledProvider;
        let err = provider
            .request(ExtractKind::Questions, "prompt")
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::CollaboratorUnavailable(_)));
    }

    #[test]
    fn format_json_wraps_payload() {
        let block = format_json("Messages", &serde_json::json!({"a": 1})).unwrap();
        assert!(block.starts_with("Messages:\n```json\n"));
        assert!(block.contains("{\"a\":1}"));
    }

    #[test]
    fn parse_completion_unwraps_content() {
        let resp = serde_json::json!({
            "choices": [{"message": {"content": "{\"facts\": []}"}}]
        });
        let value = parse_completion(&resp).unwrap();
        assert!(value.get("facts").is_some());
    }

    #[test]
    fn parse_completion_rejects_non_json_content() {
        let resp = serde_json::json!({
            "choices": [{"message": {"content": "not json"}}]
        });
        assert!(parse_completion(&resp).is_err());
    }
}
