//! Aggregation: fold per-partition question records into one global,
//! deduplicated set.
//!
//! Two records merge when their normalized text matches exactly or their
//! similarity clears the configured threshold. Conflicting merge chains
//! (A~B, B~C but A not ~C) are resolved by union-find: similarity edges are
//! transitive for merging purposes. The fold is order-independent — records
//! are sorted by provenance before merging, so any arrival order of
//! partitions produces the same set, and re-aggregating after one partition
//! was re-extracted replaces its records rather than duplicating them.

use anyhow::Result;
use sqlx::{Row, SqlitePool};
use tracing::info;

use crate::error::PipelineError;
use crate::models::{AggregatedQuestion, QuestionRecord, Summary};
use crate::runner::{content_fingerprint, get_marker, set_marker, GLOBAL_PARTITION};
use crate::similarity::{normalize_text, similarity};

pub const STAGE: &str = "aggregate-questions";
const LOGIC_VERSION: &str = "aggregate-v1";

/// Merge question records into the aggregated set. Pure and deterministic:
/// same multiset of records in, same set out, regardless of input order.
///
/// Records with no answers carry nothing a FAQ can show and are dropped.
pub fn aggregate_records(
    records: &[(String, QuestionRecord)],
    threshold: f64,
) -> Vec<AggregatedQuestion> {
    // Provenance order: earliest partition, then earliest message id, then
    // text. Sorting first makes the canonical-phrasing choice (and the
    // whole fold) independent of arrival order.
    let mut sorted: Vec<&(String, QuestionRecord)> = records
        .iter()
        .filter(|(_, r)| !r.answers.is_empty())
        .collect();
    sorted.sort_by_key(|(partition, record)| {
        (
            partition.clone(),
            min_message_id(record),
            record.question.clone(),
        )
    });

    let normalized: Vec<String> = sorted
        .iter()
        .map(|(_, r)| normalize_text(&r.question))
        .collect();

    let mut dsu = DisjointSet::new(sorted.len());
    for i in 0..sorted.len() {
        for j in (i + 1)..sorted.len() {
            if normalized[i] == normalized[j]
                || similarity(&sorted[i].1.question, &sorted[j].1.question) >= threshold
            {
                dsu.union(i, j);
            }
        }
    }

    let mut groups: std::collections::BTreeMap<usize, Vec<usize>> = Default::default();
    for i in 0..sorted.len() {
        groups.entry(dsu.find(i)).or_default().push(i);
    }

    let mut out: Vec<AggregatedQuestion> = groups
        .into_values()
        .map(|mut members| {
            members.sort();
            // Roots track the minimum index, so members[0] is the
            // earliest-provenance record: its phrasing wins.
            let canonical = sorted[members[0]].1.question.clone();

            let mut answers: Vec<Summary> = Vec::new();
            let mut partitions: Vec<String> = Vec::new();
            let mut message_ids: Vec<i64> = Vec::new();
            for &idx in &members {
                let (partition, record) = sorted[idx];
                partitions.push(partition.clone());
                for answer in &record.answers {
                    message_ids.extend(&answer.message_ids);
                    if !answers.iter().any(|a| a.text == answer.text) {
                        answers.push(answer.clone());
                    }
                }
            }
            answers.sort_by_key(|a| {
                (
                    a.message_ids.iter().min().copied().unwrap_or(i64::MAX),
                    a.text.clone(),
                )
            });
            partitions.sort();
            partitions.dedup();
            message_ids.sort_unstable();
            message_ids.dedup();

            AggregatedQuestion {
                normalized: normalize_text(&canonical),
                canonical,
                answers,
                partitions,
                message_ids,
            }
        })
        .collect();

    out.sort_by(|a, b| a.normalized.cmp(&b.normalized));
    out
}

fn min_message_id(record: &QuestionRecord) -> i64 {
    record
        .answers
        .iter()
        .flat_map(|a| a.message_ids.iter().copied())
        .min()
        .unwrap_or(i64::MAX)
}

/// Union-find keeping the minimum member as the root, so the root is the
/// earliest-provenance record of its component.
struct DisjointSet {
    parent: Vec<usize>,
}

impl DisjointSet {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, i: usize) -> usize {
        if self.parent[i] != i {
            let root = self.find(self.parent[i]);
            self.parent[i] = root;
        }
        self.parent[i]
    }

    fn union(&mut self, a: usize, b: usize) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra == rb {
            return;
        }
        let (low, high) = if ra < rb { (ra, rb) } else { (rb, ra) };
        self.parent[high] = low;
    }
}

/// Load every partition's question records, in partition order.
pub async fn load_question_records(
    pool: &SqlitePool,
) -> Result<Vec<(String, QuestionRecord)>, PipelineError> {
    let rows = sqlx::query(
        "SELECT partition, question, answers FROM questions ORDER BY partition, seq",
    )
    .fetch_all(pool)
    .await?;

    let mut records = Vec::with_capacity(rows.len());
    for row in rows {
        let partition: String = row.get("partition");
        let question: String = row.get("question");
        let answers: String = row.get("answers");
        records.push((
            partition,
            QuestionRecord {
                question,
                answers: serde_json::from_str(&answers)?,
            },
        ));
    }
    Ok(records)
}

/// Run the aggregation stage as a whole-corpus pass.
pub async fn run_aggregate(pool: &SqlitePool, threshold: f64) -> Result<()> {
    let records = load_question_records(pool).await?;

    let threshold_part = format!("{:.4}", threshold);
    let mut parts: Vec<String> = vec![threshold_part];
    for (partition, record) in &records {
        parts.push(format!(
            "{}\u{1f}{}\u{1f}{}",
            partition,
            record.question,
            serde_json::to_string(&record.answers)?
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

    let aggregated = aggregate_records(&records, threshold);
    info!(
        records = records.len(),
        aggregated = aggregated.len(),
        "aggregated question records"
    );

    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM agg_questions").execute(&mut *tx).await?;
    for q in &aggregated {
        sqlx::query(
            "INSERT INTO agg_questions (normalized, canonical, answers, partitions, message_ids) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&q.normalized)
        .bind(&q.canonical)
        .bind(serde_json::to_string(&q.answers)?)
        .bind(serde_json::to_string(&q.partitions)?)
        .bind(serde_json::to_string(&q.message_ids)?)
        .execute(&mut *tx)
        .await?;
    }
    set_marker(&mut tx, GLOBAL_PARTITION, STAGE, &fingerprint).await?;
    tx.commit().await?;

    println!("{}", STAGE);
    println!("  question records: {}", records.len());
    println!("  aggregated questions: {}", aggregated.len());
    println!("ok");
    Ok(())
}

/// Load the aggregated set back out of the store, in normalized order.
pub async fn load_aggregated(pool: &SqlitePool) -> Result<Vec<AggregatedQuestion>, PipelineError> {
    let rows = sqlx::query(
        "SELECT normalized, canonical, answers, partitions, message_ids \
         FROM agg_questions ORDER BY normalized",
    )
    .fetch_all(pool)
    .await?;

    let mut questions = Vec::with_capacity(rows.len());
    for row in rows {
        let answers: String = row.get("answers");
        let partitions: String = row.get("partitions");
        let message_ids: String = row.get("message_ids");
        questions.push(AggregatedQuestion {
            normalized: row.get("normalized"),
            canonical: row.get("canonical"),
            answers: serde_json::from_str(&answers)?,
            partitions: serde_json::from_str(&partitions)?,
            message_ids: serde_json::from_str(&message_ids)?,
        });
    }
    Ok(questions)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(question: &str, answer: &str, ids: &[i64]) -> QuestionRecord {
        QuestionRecord {
            question: question.to_string(),
            answers: vec![Summary {
                text: answer.to_string(),
                message_ids: ids.to_vec(),
            }],
        }
    }

    #[test]
    fn identical_normalized_text_merges_with_provenance_union() {
        let records = vec![
            (
                "2023-01".to_string(),
                record("How to renew a visa?", "At the consulate.", &[10]),
            ),
            (
                "2023-02".to_string(),
                record("how to renew a visa", "Online since spring.", &[40]),
            ),
        ];
        let agg = aggregate_records(&records, 0.85);
        assert_eq!(agg.len(), 1);
        assert_eq!(agg[0].canonical, "How to renew a visa?");
        assert_eq!(agg[0].partitions, vec!["2023-01", "2023-02"]);
        assert_eq!(agg[0].message_ids, vec![10, 40]);
        assert_eq!(agg[0].answers.len(), 2);
    }

    #[test]
    fn earliest_provenance_phrasing_wins() {
        let records = vec![
            (
                "2023-02".to_string(),
                record("HOW TO RENEW A VISA??", "Later phrasing.", &[40]),
            ),
            (
                "2023-01".to_string(),
                record("How to renew a visa?", "Earlier phrasing.", &[10]),
            ),
        ];
        let agg = aggregate_records(&records, 0.85);
        assert_eq!(agg.len(), 1);
        assert_eq!(agg[0].canonical, "How to renew a visa?");
    }

    #[test]
    fn order_independent() {
        let a = (
            "2023-01".to_string(),
            record("Where is the consulate?", "Main street 1.", &[1]),
        );
        let b = (
            "2023-02".to_string(),
            record("where is the consulate", "Moved to the square.", &[20]),
        );
        let c = (
            "2023-03".to_string(),
            record("What documents are needed?", "Passport and form.", &[30]),
        );

        let orders = vec![
            vec![a.clone(), b.clone(), c.clone()],
            vec![c.clone(), b.clone(), a.clone()],
            vec![b.clone(), c.clone(), a.clone()],
        ];
        let results: Vec<_> = orders
            .into_iter()
            .map(|o| aggregate_records(&o, 0.85))
            .collect();
        assert_eq!(results[0], results[1]);
        assert_eq!(results[1], results[2]);
    }

    #[test]
    fn transitive_chains_merge_into_one() {
        // a~b and b~c may hold while a~c falls below the threshold; the
        // documented policy merges the whole chain.
        let a = record("how long does visa processing take", "Two weeks.", &[1]);
        let b = record("how long does the visa processing take", "Two weeks.", &[2]);
        let c = record("how long does the visa processing usually take", "Varies.", &[3]);
        let records = vec![
            ("2023-01".to_string(), a),
            ("2023-01".to_string(), b),
            ("2023-01".to_string(), c),
        ];
        let agg = aggregate_records(&records, 0.75);
        assert_eq!(agg.len(), 1);
        assert_eq!(agg[0].message_ids, vec![1, 2, 3]);
    }

    #[test]
    fn dissimilar_questions_stay_separate() {
        let records = vec![
            (
                "2023-01".to_string(),
                record("Where is the consulate?", "Main street.", &[1]),
            ),
            (
                "2023-01".to_string(),
                record("How much does the fee cost?", "80 euros.", &[2]),
            ),
        ];
        let agg = aggregate_records(&records, 0.85);
        assert_eq!(agg.len(), 2);
    }

    #[test]
    fn answerless_records_are_dropped() {
        let records = vec![(
            "2023-01".to_string(),
            QuestionRecord {
                question: "Anyone knows?".to_string(),
                answers: vec![],
            },
        )];
        assert!(aggregate_records(&records, 0.85).is_empty());
    }

    #[test]
    fn idempotent_over_own_output_shape() {
        let records = vec![
            (
                "2023-01".to_string(),
                record("How to renew a visa?", "At the consulate.", &[10]),
            ),
            (
                "2023-02".to_string(),
                record("How to renew a visa", "Online.", &[40]),
            ),
        ];
        let once = aggregate_records(&records, 0.85);
        let twice = aggregate_records(&records, 0.85);
        assert_eq!(once, twice);
    }
}
