//! Data model for the three-stage council pipeline.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// STAGE 1
// =============================================================================

/// One council member's Stage-1 answer. Absent entirely when the member
/// failed; failures are data at this layer, not errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelResponse {
    pub model_id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

// =============================================================================
// STAGE 2
// =============================================================================

/// Bijection between anonymous labels and model identities, established once
/// per request and shared by every Stage-2 call so aggregation is
/// well-defined.
///
/// Labels are sequential opaque tokens ("Response 1", "Response 2", ...)
/// bound to surviving Stage-1 models in dispatch order; they never derive
/// from model names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelAssignment {
    /// (label, model_id), in Stage-1 dispatch order.
    ordered: Vec<(String, String)>,
}

impl LabelAssignment {
    /// Enumerate `model_ids` (already deduplicated, in dispatch order) and
    /// bind each to a sequential label.
    pub fn new<I, S>(model_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ordered = model_ids
            .into_iter()
            .enumerate()
            .map(|(i, model_id)| (format!("Response {}", i + 1), model_id.into()))
            .collect();
        Self { ordered }
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    pub fn model_for(&self, label: &str) -> Option<&str> {
        self.ordered
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, m)| m.as_str())
    }

    pub fn label_for(&self, model_id: &str) -> Option<&str> {
        self.ordered
            .iter()
            .find(|(_, m)| m == model_id)
            .map(|(l, _)| l.as_str())
    }

    /// Label for the 1-based enumeration index, if in range.
    pub fn label_for_index(&self, index: usize) -> Option<&str> {
        index
            .checked_sub(1)
            .and_then(|i| self.ordered.get(i))
            .map(|(l, _)| l.as_str())
    }

    /// (label, model_id) pairs in Stage-1 dispatch order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.ordered.iter().map(|(l, m)| (l.as_str(), m.as_str()))
    }

    /// Labels in Stage-1 dispatch order.
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.ordered.iter().map(|(l, _)| l.as_str())
    }

    /// Flat label → model map for result metadata and events.
    pub fn to_map(&self) -> BTreeMap<String, String> {
        self.ordered.iter().cloned().collect()
    }
}

/// One council member's Stage-2 ranking of the anonymized answers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankingSubmission {
    pub ranker_model_id: String,
    /// Total order over every surviving label, best first. The first
    /// `explicit_len` entries were named by the ranker; the rest were
    /// appended in Stage-1 order by the completion rule.
    pub ordered_labels: Vec<String>,
    pub explicit_len: usize,
    /// The ranker's free-text output, kept for display alongside the
    /// parsed order.
    pub raw_text: String,
}

/// One row of the consensus ordering, ascending by `mean_rank`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateRankingEntry {
    pub model_id: String,
    pub mean_rank: f64,
    /// Number of submissions that explicitly named this model's label.
    pub vote_count: usize,
}

// =============================================================================
// STAGE 3
// =============================================================================

/// The chairman's final answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisResult {
    pub chairman_model_id: String,
    pub content: String,
}

// =============================================================================
// REQUEST / RESULT
// =============================================================================

/// Input to a full council run.
#[derive(Debug, Clone)]
pub struct CouncilRequest {
    /// The normalized prompt (see [`crate::input`]).
    pub prompt: String,
    /// Council members, in dispatch order. Duplicates are removed
    /// preserving first occurrence.
    pub members: Vec<String>,
    /// Chairman override; falls back to the configured default.
    pub chairman: Option<String>,
    /// Per-member call timeout override.
    pub member_timeout: Option<Duration>,
}

impl CouncilRequest {
    pub fn new(prompt: impl Into<String>, members: Vec<String>) -> Self {
        Self {
            prompt: prompt.into(),
            members,
            chairman: None,
            member_timeout: None,
        }
    }

    pub fn chairman(mut self, model_id: impl Into<String>) -> Self {
        self.chairman = Some(model_id.into());
        self
    }

    pub fn member_timeout(mut self, timeout: Duration) -> Self {
        self.member_timeout = Some(timeout);
        self
    }
}

/// Metadata accompanying a council result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouncilMetadata {
    pub request_id: Uuid,
    pub label_to_model: BTreeMap<String, String>,
    pub aggregate_ranking: Vec<AggregateRankingEntry>,
    pub duration_ms: u64,
}

/// The full output of one orchestration run; immutable once returned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouncilResult {
    pub stage1: Vec<ModelResponse>,
    pub stage2: Vec<RankingSubmission>,
    pub stage3: SynthesisResult,
    pub metadata: CouncilMetadata,
}
