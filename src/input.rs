//! Input normalization: merge optional text and optional image-derived
//! context into the single prompt string handed to the council.
//!
//! Pure text assembly, no network calls. Vision extraction has already
//! happened by the time this runs.

use crate::council::CouncilError;
use crate::vision::VisionContext;

/// Entities beyond this are dropped to avoid prompt bloat.
const MAX_ENTITIES: usize = 10;
const MAX_TABLES: usize = 3;
const MAX_WARNINGS: usize = 5;

/// Below this, the rendered prompt carries a low-confidence banner.
const LOW_CONFIDENCE_THRESHOLD: f64 = 0.6;

/// Normalize user input into one textual prompt.
///
/// - text only: passes through unchanged
/// - image context present: rendered through the markdown template, with
///   the text (if any) as the user's caption
/// - neither: invalid request
pub fn normalize_input(
    text: Option<&str>,
    vision: Option<&VisionContext>,
) -> Result<String, CouncilError> {
    let text = text.map(str::trim).filter(|t| !t.is_empty());

    match (text, vision) {
        (Some(t), None) => Ok(t.to_string()),
        (caption, Some(ctx)) => Ok(render_context_as_prompt(ctx, caption)),
        (None, None) => Err(CouncilError::InvalidRequest(
            "at least one of text or image must be provided".into(),
        )),
    }
}

/// Render vision context into a textual prompt for the council.
pub fn render_context_as_prompt(ctx: &VisionContext, caption: Option<&str>) -> String {
    let mut parts: Vec<String> = Vec::new();

    parts.push("## Image Context".into());
    parts.push("The following information was extracted from an uploaded image.".into());
    parts.push(String::new());

    if ctx.confidence < LOW_CONFIDENCE_THRESHOLD {
        parts.push(
            "> ⚠️ **Low Confidence Extraction**: The image quality or content made extraction \
             difficult. Results may be incomplete."
                .into(),
        );
        parts.push(String::new());
    }

    if !ctx.extracted_text.is_empty() {
        parts.push("### Extracted Content".into());
        parts.push(ctx.extracted_text.clone());
        parts.push(String::new());
    }

    if !ctx.entities.is_empty() {
        parts.push("### Key Entities Identified".into());
        for entity in ctx.entities.iter().take(MAX_ENTITIES) {
            parts.push(format!("- {entity}"));
        }
        parts.push(String::new());
    }

    if !ctx.tables.is_empty() {
        parts.push("### Structured Data".into());
        for table in ctx.tables.iter().take(MAX_TABLES) {
            parts.push(table.raw.clone());
        }
        parts.push(String::new());
    }

    if !ctx.warnings.is_empty() {
        parts.push("### Extraction Notes".into());
        for warning in ctx.warnings.iter().take(MAX_WARNINGS) {
            parts.push(format!("- ⚠️ {warning}"));
        }
        parts.push(String::new());
    }

    parts.push("---".into());
    match caption {
        Some(caption) => {
            parts.push("### User Question".into());
            parts.push(caption.to_string());
        }
        None => {
            parts.push("### User Request".into());
            parts.push(
                "Please analyze and respond based on the extracted image content above.".into(),
            );
        }
    }

    parts.push(String::new());
    parts.push("---".into());
    parts.push(
        "*Note: Base your response ONLY on the extracted content above. The original image is \
         not available to you.*"
            .into(),
    );

    parts.join("\n")
}
