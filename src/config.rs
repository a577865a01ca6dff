use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::models::Category;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub channel: ChannelConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub collaborator: CollaboratorConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub categorize: CategorizeConfig,
    pub normalize: NormalizeConfig,
    #[serde(default)]
    pub render: RenderConfig,
    /// Seed categories offered to the categorizer before any are minted.
    #[serde(default)]
    pub categories: Vec<Category>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChannelConfig {
    /// Directory name used for rendered output.
    pub slug: String,
    pub title: String,
    /// Base URL a message id is appended to when rendering provenance links.
    pub url: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SourceConfig {
    /// Path to a JSON export of the channel history. The transport client
    /// that produces the export is outside this tool.
    pub export_path: Option<PathBuf>,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

fn default_page_size() -> usize {
    500
}

#[derive(Debug, Deserialize, Clone)]
pub struct CollaboratorConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Upper bound on concurrent collaborator calls during extraction.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

impl Default for CollaboratorConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            max_retries: 5,
            timeout_secs: 600,
            max_concurrent: 2,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    600
}
fn default_max_concurrent() -> usize {
    2
}

#[derive(Debug, Deserialize, Clone)]
pub struct DedupConfig {
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: default_similarity_threshold(),
        }
    }
}

fn default_similarity_threshold() -> f64 {
    0.85
}

#[derive(Debug, Deserialize, Clone)]
pub struct CategorizeConfig {
    /// A proposed new label at least this similar to an existing one is
    /// folded into the existing label instead of minting a duplicate.
    #[serde(default = "default_reuse_threshold")]
    pub reuse_threshold: f64,
}

impl Default for CategorizeConfig {
    fn default() -> Self {
        Self {
            reuse_threshold: default_reuse_threshold(),
        }
    }
}

fn default_reuse_threshold() -> f64 {
    0.55
}

#[derive(Debug, Deserialize, Clone)]
pub struct NormalizeConfig {
    /// Target upper bound on the final category count.
    pub max_categories: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RenderConfig {
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
        }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("docs")
}

impl CollaboratorConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.channel.slug.is_empty() {
        anyhow::bail!("channel.slug must not be empty");
    }

    if !(0.0..=1.0).contains(&config.dedup.similarity_threshold) {
        anyhow::bail!("dedup.similarity_threshold must be in [0.0, 1.0]");
    }

    if !(0.0..=1.0).contains(&config.categorize.reuse_threshold) {
        anyhow::bail!("categorize.reuse_threshold must be in [0.0, 1.0]");
    }

    if config.normalize.max_categories == 0 {
        anyhow::bail!("normalize.max_categories must be >= 1");
    }

    if config.collaborator.max_concurrent == 0 {
        anyhow::bail!("collaborator.max_concurrent must be >= 1");
    }

    if config.collaborator.is_enabled() && config.collaborator.model.is_none() {
        anyhow::bail!(
            "collaborator.model must be specified when provider is '{}'",
            config.collaborator.provider
        );
    }

    match config.collaborator.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown collaborator provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    Ok(config)
}
