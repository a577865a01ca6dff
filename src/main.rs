//! # FAQ Digest CLI (`fqd`)
//!
//! The `fqd` binary drives the digest pipeline. Each stage is its own
//! subcommand; state on disk between stages is the contract, so stages can
//! be re-run individually and out of band (e.g. from a Makefile). A stage
//! exits 0 when every partition succeeded or was skipped as fresh, and
//! non-zero when at least one partition failed — partial progress is kept
//! either way.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `fqd init` | Create the SQLite database and run schema migrations |
//! | `fqd fetch` | Append new messages from the channel export |
//! | `fqd extract-facts` | Distill per-month facts via the collaborator |
//! | `fqd extract-questions` | Distill per-month questions and answers |
//! | `fqd extract-cases` | Distill per-month cases with outcomes |
//! | `fqd aggregate-questions` | Merge and dedup questions across months |
//! | `fqd categorize-questions` | Label aggregated questions |
//! | `fqd normalize-questions` | Bound the category count by merging |
//! | `fqd render` | Emit deterministic markdown documentation |
//! | `fqd status` | Show partition and stage freshness |

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use faq_digest::{
    aggregate, categorize, config, db, extract, fetch, migrate, normalize, provider, render,
    runner, source, status,
};

/// FAQ Digest — distill a chat archive into curated FAQ documentation.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/fqd.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "fqd",
    about = "FAQ Digest — distill a chat archive into curated FAQ documentation",
    version,
    long_about = "FAQ Digest partitions an append-only chat archive by calendar month, distills \
    each month into facts, questions, and cases via a text-understanding collaborator, merges \
    and deduplicates questions globally, compresses the category taxonomy, and renders \
    deterministic markdown documentation."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/fqd.toml")]
    config: PathBuf,

    /// Enable debug logging (RUST_LOG overrides).
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands, one per pipeline stage.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database and all tables (messages, per-stage
    /// outputs, staleness markers). Idempotent.
    Init,

    /// Append new messages from the configured channel export.
    ///
    /// Resumes from the highest stored message id; messages already in
    /// their partition are skipped, never overwritten.
    Fetch,

    /// Extract facts for stale partitions.
    ExtractFacts {
        /// Most recent months to consider.
        #[arg(long, default_value_t = 1)]
        max_months: usize,
    },

    /// Extract questions and answers for stale partitions.
    ExtractQuestions {
        /// Most recent months to consider.
        #[arg(long, default_value_t = 1)]
        max_months: usize,
    },

    /// Extract cases for stale partitions.
    ExtractCases {
        /// Most recent months to consider.
        #[arg(long, default_value_t = 1)]
        max_months: usize,
    },

    /// Merge all months' question records into the deduplicated global set.
    AggregateQuestions,

    /// Assign every aggregated question a category label.
    CategorizeQuestions,

    /// Merge categories down to the configured maximum count.
    NormalizeQuestions,

    /// Render FAQ and cases markdown from the stored data.
    Render,

    /// Show stored partitions and per-stage freshness.
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Fetch => {
            let export_path = cfg.source.export_path.clone().ok_or_else(|| {
                anyhow::anyhow!("source.export_path must be configured for fetch")
            })?;
            let source = source::JsonExportSource::open(&export_path, cfg.source.page_size)?;
            let pool = db::connect(&cfg).await?;
            fetch::run_fetch(&pool, &source).await?;
            pool.close().await;
        }
        Commands::ExtractFacts { max_months } => {
            run_extraction(&cfg, ExtractionKind::Facts, max_months).await?;
        }
        Commands::ExtractQuestions { max_months } => {
            run_extraction(&cfg, ExtractionKind::Questions, max_months).await?;
        }
        Commands::ExtractCases { max_months } => {
            run_extraction(&cfg, ExtractionKind::Cases, max_months).await?;
        }
        Commands::AggregateQuestions => {
            let pool = db::connect(&cfg).await?;
            let result = aggregate::run_aggregate(&pool, cfg.dedup.similarity_threshold).await;
            pool.close().await;
            result?;
        }
        Commands::CategorizeQuestions => {
            let provider = provider::create_provider(&cfg.collaborator)?;
            let pool = db::connect(&cfg).await?;
            let result = categorize::run_categorize(
                &pool,
                &cfg.categories,
                provider.as_ref(),
                cfg.categorize.reuse_threshold,
            )
            .await;
            pool.close().await;
            result?;
        }
        Commands::NormalizeQuestions => {
            let provider = provider::create_provider(&cfg.collaborator)?;
            let pool = db::connect(&cfg).await?;
            let result = normalize::run_normalize(
                &pool,
                cfg.normalize.max_categories,
                provider.as_ref(),
                cfg.collaborator.is_enabled(),
            )
            .await;
            pool.close().await;
            result?;
        }
        Commands::Render => {
            let pool = db::connect(&cfg).await?;
            let result = render::run_render(&pool, &cfg).await;
            pool.close().await;
            result?;
        }
        Commands::Status => {
            let pool = db::connect(&cfg).await?;
            let result = status::run_status(&pool).await;
            pool.close().await;
            result?;
        }
    }

    Ok(())
}

enum ExtractionKind {
    Facts,
    Questions,
    Cases,
}

async fn run_extraction(
    cfg: &config::Config,
    kind: ExtractionKind,
    max_months: usize,
) -> anyhow::Result<()> {
    let provider = provider::create_provider(&cfg.collaborator)?;
    let stage: std::sync::Arc<dyn runner::PartitionStage> = match kind {
        ExtractionKind::Facts => std::sync::Arc::new(extract::ExtractionStage::facts(provider)),
        ExtractionKind::Questions => {
            std::sync::Arc::new(extract::ExtractionStage::questions(provider))
        }
        ExtractionKind::Cases => std::sync::Arc::new(extract::ExtractionStage::cases(provider)),
    };
    let stage_name = stage.name();

    let pool = db::connect(cfg).await?;
    let report = runner::run_partition_stage(
        &pool,
        stage,
        max_months,
        cfg.collaborator.max_concurrent,
    )
    .await;
    pool.close().await;
    report?.finish(stage_name)
}
