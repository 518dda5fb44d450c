//! Free-text rank parsing and consensus aggregation.
//!
//! Stage-2 rankers answer in natural language; nothing about the output
//! format can be trusted. The parser extracts label tokens in order of first
//! appearance and completes the result into a total order so that
//! aggregation never has to reason about partial rankings.

use std::cmp::Ordering;
use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;

use super::types::{AggregateRankingEntry, LabelAssignment, RankingSubmission};

/// Matches label mentions like "Response 2", "response #3", "RESPONSE 1".
static LABEL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bresponse\s*#?\s*(\d+)\b").expect("static regex"));

/// A ranker's output reduced to an ordered label list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRanking {
    /// Total order over every label in the assignment, best first.
    pub ordered_labels: Vec<String>,
    /// How many leading entries the ranker actually named; the rest were
    /// appended by the completion rule.
    pub explicit_len: usize,
}

/// Extract a total order of labels from a free-text ranking.
///
/// - labels are taken in order of first appearance; repeats keep only the
///   first occurrence
/// - mentions outside the assignment ("Response 9") are ignored
/// - labels the ranker never mentioned are appended at the end in their
///   original Stage-1 order, so every parse yields a total order
///
/// Returns `None` when not a single valid label appears - the ranker is
/// treated as having abstained.
pub fn parse_ranked_labels(raw: &str, assignment: &LabelAssignment) -> Option<ParsedRanking> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut ordered: Vec<String> = Vec::with_capacity(assignment.len());

    for caps in LABEL_RE.captures_iter(raw) {
        let index: usize = match caps[1].parse() {
            Ok(i) => i,
            Err(_) => continue,
        };
        let Some(label) = assignment.label_for_index(index) else {
            continue;
        };
        if seen.insert(label) {
            ordered.push(label.to_string());
        }
    }

    if ordered.is_empty() {
        return None;
    }

    let explicit_len = ordered.len();
    for label in assignment.labels() {
        if !seen.contains(label) {
            ordered.push(label.to_string());
        }
    }

    Some(ParsedRanking {
        ordered_labels: ordered,
        explicit_len,
    })
}

/// Aggregate per-model rankings into one consensus ordering.
///
/// A model's rank in a submission is its 1-based position in that
/// submission's completed label order. `mean_rank` averages those positions
/// across submissions; a model covered by no submission at all gets the
/// worst possible rank. Ties break by Stage-1 dispatch order, so identical
/// inputs always produce identical output.
pub fn aggregate_rankings(
    submissions: &[RankingSubmission],
    assignment: &LabelAssignment,
) -> Vec<AggregateRankingEntry> {
    let worst_rank = assignment.len() as f64;

    // Built in dispatch order; the stable sort below preserves that order
    // for equal mean ranks.
    let mut entries: Vec<AggregateRankingEntry> = assignment
        .iter()
        .map(|(label, model_id)| {
            let mut position_sum = 0usize;
            let mut position_count = 0usize;
            let mut vote_count = 0usize;

            for submission in submissions {
                if let Some(pos) = submission
                    .ordered_labels
                    .iter()
                    .position(|l| l == label)
                {
                    position_sum += pos + 1;
                    position_count += 1;
                    if pos < submission.explicit_len {
                        vote_count += 1;
                    }
                }
            }

            let mean_rank = if position_count == 0 {
                worst_rank
            } else {
                position_sum as f64 / position_count as f64
            };

            AggregateRankingEntry {
                model_id: model_id.to_string(),
                mean_rank,
                vote_count,
            }
        })
        .collect();

    entries.sort_by(|a, b| {
        a.mean_rank
            .partial_cmp(&b.mean_rank)
            .unwrap_or(Ordering::Equal)
    });

    entries
}
