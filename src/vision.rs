//! Vision extraction: image bytes → bounded textual context.
//!
//! The council only ever reasons over text, so an uploaded image is first
//! reduced to a [`VisionContext`] by a vision-capable model. Free vision
//! models are unreliable; the extractor walks an ordered candidate list
//! sequentially until one returns a non-empty response. Attempts are not
//! concurrent: each candidate is a substitute for the previous one, and
//! querying several providers for the same image just multiplies noise.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::council::CouncilError;
use crate::gateway::{Attribution, ChatGateway, ChatModel, ChatRequest};
use crate::prompts;

// =============================================================================
// Candidate models
// =============================================================================

/// Default vision model (free tier, good balance of quality and speed).
pub const DEFAULT_VISION_MODEL: &str = "google/gemma-3-27b-it:free";

/// Fallback vision models in order of preference.
pub const FALLBACK_VISION_MODELS: &[&str] = &[
    "nvidia/nemotron-nano-12b-2-vl:free",
    "meta-llama/llama-3.2-11b-vision-instruct:free",
    "google/gemma-3-4b-it:free",
];

const VISION_TIMEOUT: Duration = Duration::from_secs(90);
const VISION_MAX_TOKENS: u32 = 4096;

/// Raw image payloads larger than this are rejected up front.
const MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;

/// Confidence when the model's CONFIDENCE section is missing or unreadable.
const DEFAULT_CONFIDENCE: f64 = 0.7;

/// Confidence when the whole response failed to parse into sections.
const UNPARSEABLE_CONFIDENCE: f64 = 0.5;

static FIRST_INT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").expect("static regex"));

// =============================================================================
// Types
// =============================================================================

/// A table kept as a raw markdown block; no structural re-parsing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableBlock {
    pub raw: String,
}

/// Structured context extracted from an image, consumed once by the input
/// normalizer and then discarded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisionContext {
    /// Always "image".
    pub source: String,
    pub extracted_text: String,
    pub entities: Vec<String>,
    pub tables: Vec<TableBlock>,
    /// Always populated, in [0, 1].
    pub confidence: f64,
    pub warnings: Vec<String>,
    pub model_used: String,
}

// =============================================================================
// Extraction
// =============================================================================

/// Ordered candidate list: preferred model (if any), then the default, then
/// the fallback sequence, deduplicated preserving first occurrence.
pub fn candidate_models(preferred: Option<&str>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    {
        let mut push = |model: &str| {
            if !out.iter().any(|existing| existing == model) {
                out.push(model.to_string());
            }
        };
        if let Some(model) = preferred {
            push(model);
        }
        push(DEFAULT_VISION_MODEL);
        for model in FALLBACK_VISION_MODELS {
            push(model);
        }
    }
    out
}

/// Try each candidate model until one returns a non-empty response, then
/// parse it. Exhausting every candidate is request-fatal and distinct from
/// a generic provider error, so callers can report "image processing
/// failed" specifically.
pub async fn extract_vision_context(
    gateway: &dyn ChatGateway,
    image_bytes: &[u8],
    mime_type: &str,
    preferred_model: Option<&str>,
) -> Result<VisionContext, CouncilError> {
    if image_bytes.is_empty() {
        return Err(CouncilError::InvalidRequest(
            "image payload is empty".into(),
        ));
    }
    if image_bytes.len() > MAX_IMAGE_BYTES {
        return Err(CouncilError::InvalidRequest(format!(
            "image payload too large: {} bytes (max {MAX_IMAGE_BYTES})",
            image_bytes.len()
        )));
    }

    let data_url = format!("data:{mime_type};base64,{}", BASE64.encode(image_bytes));
    let candidates = candidate_models(preferred_model);

    let mut attempts = 0;
    let mut last_error = None;
    for model in &candidates {
        attempts += 1;

        let req = ChatRequest::new(
            ChatModel::openrouter(model),
            prompts::render_vision_messages(&data_url),
            Attribution::new("vision::extract"),
        )
        .timeout(VISION_TIMEOUT)
        .max_tokens(VISION_MAX_TOKENS);

        match gateway.chat(req).await {
            Ok(resp) => {
                // A non-empty response terminates the chain regardless of
                // how well it parses.
                debug!(model, "vision extraction succeeded");
                return Ok(parse_vision_response(&resp.content, model));
            }
            Err(err) => {
                warn!(model, error = %err, "vision model failed, advancing to next candidate");
                last_error = Some(err);
            }
        }
    }

    Err(CouncilError::VisionExhausted {
        attempts,
        last_error,
    })
}

// =============================================================================
// Parsing
// =============================================================================

/// Parse the five-section response format into a [`VisionContext`].
///
/// Sections are matched case-insensitively by header keyword. A response
/// with no recognizable extracted-text section degrades to the whole raw
/// output with reduced confidence rather than failing.
pub fn parse_vision_response(raw_response: &str, model_used: &str) -> VisionContext {
    let mut extracted_text = String::new();
    let mut entities = Vec::new();
    let mut tables = Vec::new();
    let mut confidence = DEFAULT_CONFIDENCE;
    let mut warnings = Vec::new();

    for section in raw_response.split("##") {
        let section = section.trim();
        if section.is_empty() {
            continue;
        }

        let (header, content) = match section.split_once('\n') {
            Some((h, c)) => (h.trim().to_uppercase(), c.trim()),
            None => (section.to_uppercase(), ""),
        };

        if header.contains("EXTRACTED TEXT") {
            extracted_text = content.to_string();
        } else if header.contains("ENTITIES") {
            entities.extend(list_items(content));
        } else if header.contains("TABLE") || header.contains("STRUCTURED") {
            if !content.is_empty() {
                tables.push(TableBlock {
                    raw: content.to_string(),
                });
            }
        } else if header.contains("CONFIDENCE") {
            if let Some(m) = FIRST_INT_RE.find(content) {
                if let Ok(value) = m.as_str().parse::<u32>() {
                    confidence = value.min(100) as f64 / 100.0;
                }
            }
        } else if header.contains("WARNING") {
            warnings.extend(list_items(content));
        }
    }

    if extracted_text.is_empty() {
        extracted_text = raw_response.to_string();
        warnings.push("Could not parse structured response; using raw output".to_string());
        confidence = UNPARSEABLE_CONFIDENCE;
    }

    VisionContext {
        source: "image".to_string(),
        extracted_text,
        entities,
        tables,
        confidence,
        warnings,
        model_used: model_used.to_string(),
    }
}

/// One item per non-empty line, stripped of leading bullet markers.
fn list_items(content: &str) -> Vec<String> {
    content
        .lines()
        .map(|line| {
            line.trim()
                .trim_start_matches(|c| matches!(c, '-' | '•' | '*'))
                .trim()
        })
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}
