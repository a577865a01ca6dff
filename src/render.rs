//! Render the final structured data as static markdown documentation.
//!
//! Output is a pure function of the stored categories, questions, and
//! cases: stable sort by category label then by question canonical text, no
//! timestamps, no randomness. Re-rendering unchanged data produces
//! byte-identical files, which keeps published-site diffs reviewable.
//!
//! Refuses to render while any aggregated question lacks a category
//! assignment — an incomplete categorization must be fixed upstream, not
//! papered over here.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use sqlx::{Row, SqlitePool};
use tracing::info;

use crate::aggregate::load_aggregated;
use crate::categorize::load_assignments;
use crate::config::Config;
use crate::error::PipelineError;
use crate::models::{AggregatedQuestion, CaseRecord, Category, Summary};
use crate::partition::Month;

/// Turn a category label into a filename slug. Unicode letters survive;
/// everything else collapses to single dashes.
pub fn slugify(label: &str) -> String {
    let mut out = String::with_capacity(label.len());
    let mut pending_dash = false;
    for ch in label.chars() {
        if ch.is_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            for lower in ch.to_lowercase() {
                out.push(lower);
            }
        } else {
            pending_dash = true;
        }
    }
    if out.is_empty() {
        "category".to_string()
    } else {
        out
    }
}

fn message_link(base_url: &str, id: i64) -> String {
    format!("[#{}]({}/{})", id, base_url.trim_end_matches('/'), id)
}

fn provenance_links(base_url: &str, ids: &[i64]) -> String {
    ids.iter()
        .map(|id| message_link(base_url, *id))
        .collect::<Vec<_>>()
        .join(", ")
}

/// One category page: every question with its answers and source links.
pub fn render_category_page(
    category: &Category,
    questions: &[&AggregatedQuestion],
    base_url: &str,
) -> String {
    let mut out = String::new();
    out.push_str(&format!("# {}\n", category.label));
    if !category.description.is_empty() {
        out.push_str(&format!("\n{}\n", category.description));
    }
    for q in questions {
        out.push_str(&format!("\n## {}\n\n", q.canonical));
        for answer in &q.answers {
            out.push_str(&format!(
                "- {} ({})\n",
                answer.text,
                provenance_links(base_url, &answer.message_ids)
            ));
        }
    }
    out
}

/// The FAQ index: one entry per category with its question count.
pub fn render_faq_index(title: &str, entries: &[(Category, usize)]) -> String {
    let mut out = String::new();
    out.push_str(&format!("# {} — FAQ\n\n", title));
    for (category, count) in entries {
        let line = if category.description.is_empty() {
            format!(
                "- [{}]({}.md) ({} questions)\n",
                category.label,
                slugify(&category.label),
                count
            )
        } else {
            format!(
                "- [{}]({}.md) — {} ({} questions)\n",
                category.label,
                slugify(&category.label),
                category.description,
                count
            )
        };
        out.push_str(&line);
    }
    out
}

/// One year of cases, grouped by month in chronological order.
pub fn render_cases_year(
    year: i32,
    months: &[(Month, Vec<CaseRecord>)],
    base_url: &str,
) -> String {
    let mut out = String::new();
    out.push_str(&format!("# Cases — {}\n", year));
    for (month, cases) in months {
        out.push_str(&format!("\n## {}\n\n", month));
        for case in cases {
            let mark = if case.approved { "✅" } else { "❌" };
            out.push_str(&format!(
                "- {} {} ({})\n",
                mark,
                case.summary.text,
                provenance_links(base_url, &case.summary.message_ids)
            ));
        }
    }
    out
}

/// The cases index: per-year approved/rejected tallies, newest first.
pub fn render_cases_index(years: &[(i32, usize, usize)]) -> String {
    let mut out = String::new();
    out.push_str("# Cases\n\n");
    for (year, approved, rejected) in years {
        out.push_str(&format!(
            "- [{}]({}.md): {} approved, {} rejected\n",
            year, year, approved, rejected
        ));
    }
    out
}

async fn load_cases(pool: &SqlitePool) -> Result<Vec<(Month, CaseRecord)>, PipelineError> {
    let rows = sqlx::query(
        "SELECT partition, approved, text, message_ids FROM cases ORDER BY partition, seq",
    )
    .fetch_all(pool)
    .await?;

    let mut cases = Vec::with_capacity(rows.len());
    for row in rows {
        let partition: String = row.get("partition");
        let month = Month::from_key(&partition).map_err(|e| {
            PipelineError::InvariantViolation(format!("corrupt partition key '{}': {}", partition, e))
        })?;
        let message_ids: String = row.get("message_ids");
        cases.push((
            month,
            CaseRecord {
                approved: row.get("approved"),
                summary: Summary {
                    text: row.get("text"),
                    message_ids: serde_json::from_str(&message_ids)?,
                },
            },
        ));
    }
    Ok(cases)
}

fn save(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content)?;
    Ok(())
}

/// Run the renderer: emit the FAQ and cases trees under the output dir.
pub async fn run_render(pool: &SqlitePool, config: &Config) -> Result<()> {
    let questions = load_aggregated(pool).await?;
    let assignments = load_assignments(pool).await?;

    let rows = sqlx::query("SELECT label, description FROM categories ORDER BY label")
        .fetch_all(pool)
        .await?;
    let categories: Vec<Category> = rows
        .into_iter()
        .map(|row| Category {
            label: row.get("label"),
            description: row.get("description"),
        })
        .collect();

    // Same guard as the upstream stages, because render may be invoked on
    // a store whose categorization was never completed.
    let mut by_category: BTreeMap<&str, Vec<&AggregatedQuestion>> = BTreeMap::new();
    for q in &questions {
        let label = assignments.get(&q.normalized).ok_or_else(|| {
            PipelineError::InvariantViolation(format!(
                "aggregated question '{}' has no category; run categorize-questions",
                q.canonical
            ))
        })?;
        if !categories.iter().any(|c| &c.label == label) {
            return Err(PipelineError::InvariantViolation(format!(
                "assignment points at unknown category '{}'",
                label
            ))
            .into());
        }
        by_category.entry(label.as_str()).or_default().push(q);
    }

    let base = config.render.output_dir.join(&config.channel.slug);
    let base_url = &config.channel.url;
    let mut written: Vec<PathBuf> = Vec::new();

    // FAQ tree: index plus one page per non-empty category, both already
    // in label order.
    let entries: Vec<(Category, usize)> = categories
        .iter()
        .map(|c| {
            let count = by_category.get(c.label.as_str()).map_or(0, Vec::len);
            (c.clone(), count)
        })
        .collect();
    let index_path = base.join("faq").join("_index.md");
    save(&index_path, &render_faq_index(&config.channel.title, &entries))?;
    written.push(index_path);

    for category in &categories {
        let Some(qs) = by_category.get(category.label.as_str()) else {
            continue;
        };
        // Questions arrive sorted by normalized key; pages sort by
        // canonical text per the rendering contract.
        let mut qs = qs.clone();
        qs.sort_by(|a, b| a.canonical.cmp(&b.canonical));
        let path = base
            .join("faq")
            .join(format!("{}.md", slugify(&category.label)));
        save(&path, &render_category_page(category, &qs, base_url))?;
        written.push(path);
    }

    // Cases tree, when any were extracted.
    let cases = load_cases(pool).await?;
    if !cases.is_empty() {
        let mut by_year: BTreeMap<i32, BTreeMap<Month, Vec<CaseRecord>>> = BTreeMap::new();
        for (month, case) in cases {
            by_year
                .entry(month.year)
                .or_default()
                .entry(month)
                .or_default()
                .push(case);
        }

        let mut year_stats: Vec<(i32, usize, usize)> = Vec::new();
        for (year, months) in by_year.iter().rev() {
            let mut approved = 0;
            let mut rejected = 0;
            let month_list: Vec<(Month, Vec<CaseRecord>)> = months
                .iter()
                .map(|(m, cs)| (*m, cs.clone()))
                .collect();
            for (_, cs) in &month_list {
                approved += cs.iter().filter(|c| c.approved).count();
                rejected += cs.iter().filter(|c| !c.approved).count();
            }
            year_stats.push((*year, approved, rejected));

            let path = base.join("cases").join(format!("{}.md", year));
            save(&path, &render_cases_year(*year, &month_list, base_url))?;
            written.push(path);
        }

        let path = base.join("cases").join("_index.md");
        save(&path, &render_cases_index(&year_stats))?;
        written.push(path);
    }

    info!(files = written.len(), dir = %base.display(), "rendered documentation");
    println!("render");
    println!("  categories: {}", categories.len());
    println!("  questions: {}", questions.len());
    println!("  files written: {}", written.len());
    println!("ok");
    Ok(())
}
