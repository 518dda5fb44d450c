//! Three-stage council orchestration.
//!
//! 1. **Dispatch** — fan the prompt out to every council member concurrently
//! 2. **Peer ranking** — each survivor blind-ranks the others' anonymized answers
//! 3. **Synthesis** — the chairman merges everything into one final answer
//!
//! Member failures in stages 1 and 2 are absorbed (the member is dropped,
//! not the request); only zero Stage-1 survivors or a chairman failure is
//! fatal. The title generator runs off the critical path.

pub mod ranking;
pub mod stream;
pub mod types;

use std::collections::HashSet;
use std::time::{Duration, Instant};

use futures::stream::{self as futures_stream, StreamExt};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::gateway::{Attribution, ChatGateway, ChatModel, ChatRequest, Message, ProviderError};
use crate::prompts::{self, RankedLabel};

pub use ranking::{aggregate_rankings, parse_ranked_labels, ParsedRanking};
pub use stream::{run_council_streaming, CouncilEvent};
pub use types::{
    AggregateRankingEntry, CouncilMetadata, CouncilRequest, CouncilResult, LabelAssignment,
    ModelResponse, RankingSubmission, SynthesisResult,
};

// =============================================================================
// Defaults
// =============================================================================

/// Council members used when the caller does not pick their own.
pub const DEFAULT_COUNCIL_MODELS: &[&str] = &[
    "openai/gpt-oss-20b:free",
    "google/gemma-3-27b-it:free",
    "tngtech/deepseek-r1t2-chimera:free",
    "x-ai/grok-4.1-fast:free",
];

/// Chairman used when the caller does not specify one.
pub const DEFAULT_CHAIRMAN_MODEL: &str = "arcee-ai/trinity-mini:free";

/// Per-member call timeout in stages 1 and 2.
pub(crate) const DEFAULT_MEMBER_TIMEOUT: Duration = Duration::from_secs(120);

/// The title call is short; no reason to let it linger.
const TITLE_TIMEOUT: Duration = Duration::from_secs(30);

const TITLE_MAX_CHARS: usize = 50;

// =============================================================================
// Errors
// =============================================================================

/// Request-fatal council errors. Everything else (individual member
/// failures, unparseable rankings) is absorbed as data.
#[derive(Debug, Error)]
pub enum CouncilError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// No council member produced a Stage-1 answer.
    #[error("no council member responded")]
    ZeroQuorum,

    /// The chairman call failed. Stage 3 has no redundancy to fall back on.
    #[error("synthesis failed: {0}")]
    Synthesis(#[source] ProviderError),

    /// Every vision candidate model failed.
    #[error("vision extraction failed after trying {attempts} models")]
    VisionExhausted {
        attempts: usize,
        #[source]
        last_error: Option<ProviderError>,
    },
}

impl CouncilError {
    /// Machine-readable error kind for events and API payloads.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::ZeroQuorum => "zero_quorum",
            Self::Synthesis(_) => "synthesis_failed",
            Self::VisionExhausted { .. } => "vision_failed",
        }
    }
}

// =============================================================================
// Stage 1: dispatch
// =============================================================================

/// Fan the prompt out to every member concurrently. Failures yield no entry;
/// the output preserves dispatch order. An empty result is a valid outcome
/// here - quorum policy belongs to the caller.
pub async fn stage1_dispatch(
    gateway: &dyn ChatGateway,
    prompt: &str,
    members: &[String],
    timeout: Duration,
) -> Vec<ModelResponse> {
    let tasks = members.iter().map(|model_id| {
        let req = ChatRequest::new(
            ChatModel::openrouter(model_id),
            vec![Message::user(prompt)],
            Attribution::new("council::stage1"),
        )
        .timeout(timeout);
        dispatch_one(gateway, req, model_id.clone())
    });
    // Collect eagerly so the stream owns a `Vec` of futures rather than the
    // `map` closure; the latter would force a spurious higher-ranked bound
    // that breaks `tokio::spawn` in the streaming driver.
    let tasks: Vec<_> = tasks.collect();

    // All calls in flight at once; `buffered` (not `buffer_unordered`) keeps
    // results in dispatch order without cancelling stragglers.
    futures_stream::iter(tasks)
        .buffered(members.len().max(1))
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .flatten()
        .collect()
}

/// Dispatch a single Stage-1 member call. Extracted into a free `async fn` so
/// its future is properly higher-ranked over the borrow of `gateway`, which
/// lets the streaming driver be `tokio::spawn`ed.
async fn dispatch_one(
    gateway: &dyn ChatGateway,
    req: ChatRequest,
    model_id: String,
) -> Option<ModelResponse> {
    match gateway.chat(req).await {
        Ok(resp) => Some(ModelResponse {
            model_id,
            content: resp.content,
            reasoning: resp.reasoning,
        }),
        Err(err) => {
            warn!(model = %model_id, error = %err, "council member dropped in stage 1");
            None
        }
    }
}

// =============================================================================
// Stage 2: peer ranking
// =============================================================================

/// Anonymize the Stage-1 answers and have every survivor rank its peers.
///
/// The label assignment is computed once here and shared by every call, so
/// concurrent rankers can never disagree on what a label means. Each
/// ranker's own answer is excluded from its prompt; the completion rule in
/// [`ranking::parse_ranked_labels`] re-inserts the missing labels so every
/// submission is a total order.
pub async fn stage2_collect_rankings(
    gateway: &dyn ChatGateway,
    prompt: &str,
    stage1: &[ModelResponse],
    timeout: Duration,
) -> (Vec<RankingSubmission>, LabelAssignment) {
    let assignment = LabelAssignment::new(stage1.iter().map(|r| r.model_id.clone()));
    let assignment_ref = &assignment;

    let tasks = stage1.iter().map(|ranker| {
        let peers: Vec<(&str, &str)> = stage1
            .iter()
            .filter(|r| r.model_id != ranker.model_id)
            .filter_map(|r| {
                assignment_ref
                    .label_for(&r.model_id)
                    .map(|label| (label, r.content.as_str()))
            })
            .collect();
        let has_peers = !peers.is_empty();

        let req = ChatRequest::new(
            ChatModel::openrouter(&ranker.model_id),
            prompts::render_ranking_prompt(prompt, &peers),
            Attribution::new("council::stage2"),
        )
        .timeout(timeout);
        let ranker_id = ranker.model_id.clone();

        rank_one(gateway, req, ranker_id, has_peers, assignment_ref)
    });
    // See `stage1_dispatch`: collect eagerly so the stream owns the futures,
    // not the `map` closure, keeping the streaming driver spawnable.
    let tasks: Vec<_> = tasks.collect();

    let submissions: Vec<RankingSubmission> = futures_stream::iter(tasks)
        .buffered(stage1.len().max(1))
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .flatten()
        .collect();

    (submissions, assignment)
}

/// Run a single Stage-2 ranker call. Extracted into a free `async fn` for the
/// same higher-ranked-lifetime reason as [`dispatch_one`].
async fn rank_one(
    gateway: &dyn ChatGateway,
    req: ChatRequest,
    ranker_id: String,
    has_peers: bool,
    assignment: &LabelAssignment,
) -> Option<RankingSubmission> {
    if !has_peers {
        // Single survivor: nothing to judge.
        return None;
    }
    match gateway.chat(req).await {
        Ok(resp) => match parse_ranked_labels(&resp.content, assignment) {
            Some(parsed) => Some(RankingSubmission {
                ranker_model_id: ranker_id,
                ordered_labels: parsed.ordered_labels,
                explicit_len: parsed.explicit_len,
                raw_text: resp.content,
            }),
            None => {
                warn!(model = %ranker_id, "ranking had no parseable labels, treating as abstention");
                None
            }
        },
        Err(err) => {
            warn!(model = %ranker_id, error = %err, "ranker dropped in stage 2");
            None
        }
    }
}

// =============================================================================
// Stage 3: synthesis
// =============================================================================

/// One chairman call over the full council record. No fallback chairman: a
/// failure here fails the request.
pub async fn stage3_synthesize(
    gateway: &dyn ChatGateway,
    prompt: &str,
    stage1: &[ModelResponse],
    aggregate: &[AggregateRankingEntry],
    assignment: &LabelAssignment,
    chairman: &str,
) -> Result<SynthesisResult, CouncilError> {
    let answers: Vec<(&str, &str)> = assignment
        .iter()
        .filter_map(|(label, model_id)| {
            stage1
                .iter()
                .find(|r| r.model_id == model_id)
                .map(|r| (label, r.content.as_str()))
        })
        .collect();

    let consensus: Vec<RankedLabel<'_>> = aggregate
        .iter()
        .filter_map(|entry| {
            assignment.label_for(&entry.model_id).map(|label| RankedLabel {
                label,
                mean_rank: entry.mean_rank,
                vote_count: entry.vote_count,
            })
        })
        .collect();

    let req = ChatRequest::new(
        ChatModel::openrouter(chairman),
        prompts::render_synthesis_prompt(prompt, &answers, &consensus),
        Attribution::new("council::stage3"),
    );

    let resp = gateway.chat(req).await.map_err(CouncilError::Synthesis)?;

    Ok(SynthesisResult {
        chairman_model_id: chairman.to_string(),
        content: resp.content,
    })
}

// =============================================================================
// Full pipeline
// =============================================================================

/// Run dispatch → peer ranking → synthesis and return the full record.
pub async fn run_full_council(
    gateway: &dyn ChatGateway,
    req: &CouncilRequest,
) -> Result<CouncilResult, CouncilError> {
    let started = Instant::now();

    if req.prompt.trim().is_empty() {
        return Err(CouncilError::InvalidRequest(
            "prompt must not be empty".into(),
        ));
    }
    let members = dedup_members(&req.members);
    if members.is_empty() {
        return Err(CouncilError::InvalidRequest(
            "council requires at least one member".into(),
        ));
    }
    let timeout = req.member_timeout.unwrap_or(DEFAULT_MEMBER_TIMEOUT);
    let request_id = Uuid::new_v4();

    debug!(%request_id, members = members.len(), "stage 1: dispatching to council");
    let stage1 = stage1_dispatch(gateway, &req.prompt, &members, timeout).await;
    if stage1.is_empty() {
        return Err(CouncilError::ZeroQuorum);
    }

    debug!(survivors = stage1.len(), "stage 2: collecting peer rankings");
    let (stage2, assignment) =
        stage2_collect_rankings(gateway, &req.prompt, &stage1, timeout).await;
    let aggregate = aggregate_rankings(&stage2, &assignment);

    let chairman = req.chairman.as_deref().unwrap_or(DEFAULT_CHAIRMAN_MODEL);
    debug!(chairman, "stage 3: synthesizing final answer");
    let stage3 =
        stage3_synthesize(gateway, &req.prompt, &stage1, &aggregate, &assignment, chairman)
            .await?;

    Ok(CouncilResult {
        stage1,
        stage2,
        stage3,
        metadata: CouncilMetadata {
            request_id,
            label_to_model: assignment.to_map(),
            aggregate_ranking: aggregate,
            duration_ms: started.elapsed().as_millis() as u64,
        },
    })
}

/// Remove duplicate members preserving first occurrence.
pub(crate) fn dedup_members(members: &[String]) -> Vec<String> {
    let mut seen: HashSet<&str> = HashSet::new();
    members
        .iter()
        .filter(|m| seen.insert(m.as_str()))
        .cloned()
        .collect()
}

// =============================================================================
// Title generation
// =============================================================================

/// Best-effort conversation title. Never fails: any error falls back to a
/// truncated prompt prefix.
pub async fn generate_title(gateway: &dyn ChatGateway, prompt: &str) -> String {
    let req = ChatRequest::new(
        ChatModel::openrouter(DEFAULT_CHAIRMAN_MODEL),
        prompts::render_title_prompt(prompt),
        Attribution::new("council::title"),
    )
    .timeout(TITLE_TIMEOUT)
    .max_tokens(32);

    match gateway.chat(req).await {
        Ok(resp) => sanitize_title(&resp.content, prompt),
        Err(err) => {
            warn!(error = %err, "title generation failed, using prompt prefix");
            fallback_title(prompt)
        }
    }
}

fn sanitize_title(raw: &str, prompt: &str) -> String {
    let first_line = raw.trim().lines().next().unwrap_or("");
    let title = first_line
        .trim()
        .trim_matches(|c| c == '"' || c == '\'' || c == '`')
        .trim();
    if title.is_empty() {
        return fallback_title(prompt);
    }
    truncate_chars(title, TITLE_MAX_CHARS)
}

pub(crate) fn fallback_title(prompt: &str) -> String {
    truncate_chars(prompt.trim(), TITLE_MAX_CHARS)
}

fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        s.chars().take(max_chars).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_preserves_first_occurrence() {
        let members = vec![
            "m/a".to_string(),
            "m/b".to_string(),
            "m/a".to_string(),
            "m/c".to_string(),
            "m/b".to_string(),
        ];
        assert_eq!(dedup_members(&members), vec!["m/a", "m/b", "m/c"]);
    }

    #[test]
    fn title_sanitization_strips_quotes_and_extra_lines() {
        assert_eq!(
            sanitize_title("\"Rust Borrow Checker Basics\"\nextra", "prompt"),
            "Rust Borrow Checker Basics"
        );
    }

    #[test]
    fn empty_title_falls_back_to_prompt_prefix() {
        assert_eq!(sanitize_title("\"\"", "What is Rust?"), "What is Rust?");
    }

    #[test]
    fn long_titles_are_truncated() {
        let long = "word ".repeat(30);
        assert_eq!(sanitize_title(&long, "p").chars().count(), TITLE_MAX_CHARS);
    }

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(CouncilError::ZeroQuorum.code(), "zero_quorum");
        assert_eq!(
            CouncilError::InvalidRequest("x".into()).code(),
            "invalid_request"
        );
        assert_eq!(
            CouncilError::VisionExhausted {
                attempts: 3,
                last_error: None
            }
            .code(),
            "vision_failed"
        );
    }
}
