//! Normalization: bound the category count by merging.
//!
//! Deterministic pairwise merging until the taxonomy fits the configured
//! maximum: the most label-similar pair merges first; ties prefer the two
//! smallest categories so large, established ones stay undisturbed; the
//! surviving label is the larger group's (majority rule). Post-merge
//! invariants are checked and a violation aborts the run — a question
//! without a category after this stage is a logic bug, not data to repair.
//!
//! As a best-effort extra, merged categories that end up without a
//! description can get one from the collaborator; failure there only logs.

use std::collections::BTreeMap;

use anyhow::Result;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use tracing::{info, warn};

use crate::aggregate::load_aggregated;
use crate::categorize::load_assignments;
use crate::error::PipelineError;
use crate::models::{Category, DescriptionsResponse};
use crate::provider::{format_json, ExtractKind, Provider};
use crate::runner::{content_fingerprint, get_marker, set_marker, GLOBAL_PARTITION};
use crate::similarity::similarity;

pub const STAGE: &str = "normalize-questions";
const LOGIC_VERSION: &str = "normalize-v1";

/// A category with the normalized keys of its member questions.
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryGroup {
    pub category: Category,
    pub members: Vec<String>,
}

/// Merge category groups pairwise until at most `max` remain. Pure and
/// deterministic; input order does not matter.
pub fn normalize_taxonomy(groups: Vec<CategoryGroup>, max: usize) -> Vec<CategoryGroup> {
    let mut groups = groups;
    groups.sort_by(|a, b| a.category.label.cmp(&b.category.label));

    while groups.len() > max.max(1) {
        let (i, j) = best_merge_pair(&groups);
        let absorbed = groups.remove(j);
        let survivor = &mut groups[i];

        // Majority-rule naming: the larger side keeps its label. On a size
        // tie the lexicographically smaller label survives, which the sort
        // above already guarantees (i < j).
        if absorbed.members.len() > survivor.members.len() {
            let fallback = std::mem::take(&mut survivor.category.description);
            survivor.category.label = absorbed.category.label.clone();
            survivor.category.description = if absorbed.category.description.is_empty() {
                fallback
            } else {
                absorbed.category.description.clone()
            };
        } else if survivor.category.description.is_empty() {
            survivor.category.description = absorbed.category.description.clone();
        }
        survivor.members.extend(absorbed.members);
        survivor.members.sort();
        survivor.members.dedup();

        groups.sort_by(|a, b| a.category.label.cmp(&b.category.label));
    }

    groups
}

/// The pair of indices to merge next: most similar labels, ties broken by
/// smallest combined population, then by label pair.
fn best_merge_pair(groups: &[CategoryGroup]) -> (usize, usize) {
    let mut best: Option<(usize, usize)> = None;
    let mut best_key = (f64::MIN, usize::MAX);

    for i in 0..groups.len() {
        for j in (i + 1)..groups.len() {
            let score = similarity(&groups[i].category.label, &groups[j].category.label);
            let population = groups[i].members.len() + groups[j].members.len();
            let better = match best {
                None => true,
                Some(_) => {
                    score > best_key.0
                        || (score == best_key.0 && population < best_key.1)
                }
            };
            if better {
                best = Some((i, j));
                best_key = (score, population);
            }
        }
    }

    best.expect("best_merge_pair called with fewer than two groups")
}

#[derive(Serialize)]
struct DescriptionRequest<'a> {
    label: &'a str,
    sample_questions: Vec<&'a str>,
}

/// Run the normalization stage as a whole-corpus pass.
pub async fn run_normalize(
    pool: &SqlitePool,
    max_categories: usize,
    provider: &dyn Provider,
    collaborator_enabled: bool,
) -> Result<()> {
    let questions = load_aggregated(pool).await?;
    let assignments = load_assignments(pool).await?;

    let rows = sqlx::query("SELECT label, description FROM categories ORDER BY label")
        .fetch_all(pool)
        .await?;
    let mut groups: Vec<CategoryGroup> = rows
        .into_iter()
        .map(|row| CategoryGroup {
            category: Category {
                label: row.get("label"),
                description: row.get("description"),
            },
            members: Vec::new(),
        })
        .collect();

    // Settled categorization is a precondition; holes here mean a logic
    // bug upstream, not data to repair.
    for q in &questions {
        let label = assignments.get(&q.normalized).ok_or_else(|| {
            PipelineError::InvariantViolation(format!(
                "aggregated question '{}' has no category assignment",
                q.canonical
            ))
        })?;
        let group = groups
            .iter_mut()
            .find(|g| &g.category.label == label)
            .ok_or_else(|| {
                PipelineError::InvariantViolation(format!(
                    "assignment points at unknown category '{}'",
                    label
                ))
            })?;
        group.members.push(q.normalized.clone());
    }

    let mut parts: Vec<String> = vec![max_categories.to_string()];
    for g in &groups {
        parts.push(format!(
            "{}\u{1f}{}\u{1f}{}",
            g.category.label,
            g.category.description,
            g.members.join(",")
        ));
    }
    let part_refs: Vec<&str> = parts.iter().map(String::as_str).collect();
    let fingerprint = content_fingerprint(&part_refs, LOGIC_VERSION);

    if get_marker(pool, GLOBAL_PARTITION, STAGE).await?.as_deref() == Some(fingerprint.as_str()) {
        println!("{}", STAGE);
        println!("  skipped (fresh)");
        println!("ok");
        return Ok(());
    }

    let before = groups.len();
    let mut normalized = normalize_taxonomy(groups, max_categories);

    verify_taxonomy(&normalized, questions.len(), max_categories)?;

    if collaborator_enabled {
        polish_descriptions(&mut normalized, provider).await;
    }

    info!(
        before,
        after = normalized.len(),
        "normalized category taxonomy"
    );

    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM categories").execute(&mut *tx).await?;
    sqlx::query("DELETE FROM question_categories")
        .execute(&mut *tx)
        .await?;
    for group in &normalized {
        sqlx::query("INSERT INTO categories (label, description) VALUES (?, ?)")
            .bind(&group.category.label)
            .bind(&group.category.description)
            .execute(&mut *tx)
            .await?;
        for member in &group.members {
            sqlx::query(
                "INSERT INTO question_categories (normalized, category) VALUES (?, ?)",
            )
            .bind(member)
            .bind(&group.category.label)
            .execute(&mut *tx)
            .await?;
        }
    }
    set_marker(&mut tx, GLOBAL_PARTITION, STAGE, &fingerprint).await?;
    tx.commit().await?;

    println!("{}", STAGE);
    println!("  categories before: {}", before);
    println!("  categories after: {}", normalized.len());
    println!("  merges: {}", before - normalized.len());
    println!("ok");
    Ok(())
}

/// Structural checks after merging. Violations are fatal by design.
fn verify_taxonomy(
    groups: &[CategoryGroup],
    question_count: usize,
    max_categories: usize,
) -> Result<(), PipelineError> {
    if groups.len() > max_categories {
        return Err(PipelineError::InvariantViolation(format!(
            "normalization left {} categories, target is {}",
            groups.len(),
            max_categories
        )));
    }

    let mut owner: BTreeMap<&str, &str> = BTreeMap::new();
    for group in groups {
        for member in &group.members {
            if let Some(other) = owner.insert(member, &group.category.label) {
                return Err(PipelineError::InvariantViolation(format!(
                    "question '{}' belongs to both '{}' and '{}'",
                    member, other, group.category.label
                )));
            }
        }
    }
    if owner.len() != question_count {
        return Err(PipelineError::InvariantViolation(format!(
            "{} questions assigned, {} aggregated",
            owner.len(),
            question_count
        )));
    }
    Ok(())
}

/// Ask the collaborator for one-line descriptions of categories that lost
/// theirs during merging. Best effort: a failure logs and moves on.
async fn polish_descriptions(groups: &mut [CategoryGroup], provider: &dyn Provider) {
    let needing: Vec<DescriptionRequest> = groups
        .iter()
        .filter(|g| g.category.description.is_empty())
        .map(|g| DescriptionRequest {
            label: &g.category.label,
            sample_questions: g.members.iter().take(5).map(String::as_str).collect(),
        })
        .collect();
    if needing.is_empty() {
        return;
    }

    let prompt = match format_json("Categories", &needing) {
        Ok(p) => p,
        Err(err) => {
            warn!(error = %err, "failed to build description prompt");
            return;
        }
    };

    match provider.request(ExtractKind::Normalize, &prompt).await {
        Ok(value) => match serde_json::from_value::<DescriptionsResponse>(value) {
            Ok(parsed) => {
                for desc in parsed.descriptions {
                    if let Some(group) = groups
                        .iter_mut()
                        .find(|g| g.category.label == desc.label)
                    {
                        if group.category.description.is_empty() {
                            group.category.description = desc.description;
                        }
                    }
                }
            }
            Err(err) => warn!(error = %err, "unusable description response"),
        },
        Err(err) => warn!(error = %err, "description polish failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(label: &str, members: &[&str]) -> CategoryGroup {
        CategoryGroup {
            category: Category {
                label: label.to_string(),
                description: String::new(),
            },
            members: members.iter().map(|m| m.to_string()).collect(),
        }
    }

    #[test]
    fn merges_down_to_target() {
        let groups = vec![
            group("Visa processing", &["q1", "q2", "q3"]),
            group("Visa processing times", &["q4"]),
            group("Housing", &["q5", "q6"]),
            group("Appointments", &["q7"]),
        ];
        let result = normalize_taxonomy(groups, 2);
        assert_eq!(result.len(), 2);
        let total: usize = result.iter().map(|g| g.members.len()).sum();
        assert_eq!(total, 7);
    }

    #[test]
    fn no_merge_needed_when_under_target() {
        let groups = vec![group("A", &["q1"]), group("B", &["q2"])];
        let result = normalize_taxonomy(groups.clone(), 5);
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn similar_labels_merge_first_with_majority_naming() {
        let groups = vec![
            group("Visa processing", &["q1", "q2", "q3"]),
            group("Visa processing time", &["q4"]),
            group("Housing", &["q5", "q6"]),
        ];
        let result = normalize_taxonomy(groups, 2);
        let labels: Vec<&str> = result.iter().map(|g| g.category.label.as_str()).collect();
        // The two visa groups are the most similar pair; the bigger one
        // keeps its name.
        assert!(labels.contains(&"Visa processing"));
        assert!(labels.contains(&"Housing"));
        let visa = result
            .iter()
            .find(|g| g.category.label == "Visa processing")
            .unwrap();
        assert_eq!(visa.members, vec!["q1", "q2", "q3", "q4"]);
    }

    #[test]
    fn tie_on_similarity_merges_smallest_pair() {
        // All labels pairwise dissimilar (score ~0): the two singletons
        // should merge, leaving the large group untouched.
        let groups = vec![
            group("Alpha topics", &["q1", "q2", "q3", "q4"]),
            group("Beta", &["q5"]),
            group("Gamma", &["q6"]),
        ];
        let result = normalize_taxonomy(groups, 2);
        let alpha = result
            .iter()
            .find(|g| g.category.label == "Alpha topics")
            .unwrap();
        assert_eq!(alpha.members.len(), 4);
    }

    #[test]
    fn members_never_orphaned() {
        let groups = vec![
            group("A", &["q1"]),
            group("B", &["q2"]),
            group("C", &["q3"]),
            group("D", &["q4"]),
        ];
        let result = normalize_taxonomy(groups, 1);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].members, vec!["q1", "q2", "q3", "q4"]);
    }

    #[test]
    fn deterministic_regardless_of_input_order() {
        let a = vec![
            group("Visa processing", &["q1", "q2"]),
            group("Visa processing time", &["q3"]),
            group("Housing", &["q4"]),
        ];
        let mut b = a.clone();
        b.reverse();
        assert_eq!(normalize_taxonomy(a, 2), normalize_taxonomy(b, 2));
    }

    #[test]
    fn verify_rejects_double_membership() {
        let groups = vec![group("A", &["q1"]), group("B", &["q1"])];
        let err = verify_taxonomy(&groups, 1, 5).unwrap_err();
        assert!(matches!(err, PipelineError::InvariantViolation(_)));
    }

    #[test]
    fn verify_rejects_over_target() {
        let groups = vec![group("A", &["q1"]), group("B", &["q2"])];
        let err = verify_taxonomy(&groups, 2, 1).unwrap_err();
        assert!(matches!(err, PipelineError::InvariantViolation(_)));
    }
}
