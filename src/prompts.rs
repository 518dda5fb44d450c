//! Prompt templates for the council pipeline.
//!
//! Domain logic for rendering stage prompts. Provider-agnostic: everything
//! here is pure string assembly over labels and answer text.

use crate::gateway::Message;

// =============================================================================
// Stage 2: peer ranking
// =============================================================================

pub const RANKING_SYSTEM: &str = "You are an impartial evaluator on a council of AI assistants. \
You are shown a user's question and several candidate responses to it, identified only by \
anonymous labels. Judge them on accuracy, depth, clarity, and how directly they answer the \
question. You do not know which model wrote which response, and you must not try to guess.";

/// Render the Stage-2 ranking prompt for one council member.
///
/// `answers` is the anonymized (label, content) list this ranker is allowed
/// to see; the caller has already excluded the ranker's own answer.
pub fn render_ranking_prompt(original_prompt: &str, answers: &[(&str, &str)]) -> Vec<Message> {
    let mut user = String::new();
    user.push_str("## Original Question\n\n");
    user.push_str(original_prompt.trim());
    user.push_str("\n\n## Candidate Responses\n");

    for (label, content) in answers {
        user.push_str(&format!("\n### {label}\n{}\n", content.trim()));
    }

    let labels: Vec<&str> = answers.iter().map(|(label, _)| *label).collect();
    user.push_str(&format!(
        "\n## Instructions\n\n\
         Rank ALL of the responses above from best to worst. Refer to each response ONLY by \
         its label ({}). Output a numbered list, one response per line, best first, with one \
         short justification after each label. Do not skip any label and do not invent new \
         ones.",
        labels.join(", ")
    ));

    vec![Message::system(RANKING_SYSTEM), Message::user(user)]
}

// =============================================================================
// Stage 3: chairman synthesis
// =============================================================================

pub const SYNTHESIS_SYSTEM: &str = "You are the chairman of a council of AI assistants. \
Several council members have answered the same question, and the council has blind-ranked \
the answers. Your job: produce one final, authoritative answer that takes the strongest \
elements from each response, resolves contradictions (favoring consensus-preferred sources), \
and adds anything important the individual answers missed. Answer the user directly; do not \
describe the council process.";

/// One row of the consensus ordering as shown to the chairman.
pub struct RankedLabel<'a> {
    pub label: &'a str,
    pub mean_rank: f64,
    pub vote_count: usize,
}

/// Render the Stage-3 synthesis prompt.
///
/// The chairman sees the anonymized answers and the consensus ordering, not
/// the model identities; keeping the blind here avoids brand-name bias in
/// the final synthesis too.
pub fn render_synthesis_prompt(
    original_prompt: &str,
    answers: &[(&str, &str)],
    consensus: &[RankedLabel<'_>],
) -> Vec<Message> {
    let mut user = String::new();
    user.push_str("## Original Question\n\n");
    user.push_str(original_prompt.trim());
    user.push_str("\n\n## Council Responses\n");

    for (label, content) in answers {
        user.push_str(&format!("\n### {label}\n{}\n", content.trim()));
    }

    user.push_str("\n## Consensus Ranking (best first)\n\n");
    for (position, row) in consensus.iter().enumerate() {
        user.push_str(&format!(
            "{}. {} (mean rank {:.2}, ranked by {} member{})\n",
            position + 1,
            row.label,
            row.mean_rank,
            row.vote_count,
            if row.vote_count == 1 { "" } else { "s" },
        ));
    }

    user.push_str(
        "\n## Instructions\n\n\
         Synthesize the best possible answer to the original question from the responses \
         above, giving more weight to higher-ranked responses. Produce ONLY the final \
         answer.",
    );

    vec![Message::system(SYNTHESIS_SYSTEM), Message::user(user)]
}

// =============================================================================
// Title generation
// =============================================================================

pub const TITLE_SYSTEM: &str = "You generate short titles for conversations. Given the user's \
opening message, respond with a title of at most 6 words that captures its topic. Respond \
with the title only: no quotes, no punctuation at the end, no commentary.";

/// How much of the opening message the title model gets to see.
const TITLE_PROMPT_MAX_CHARS: usize = 500;

pub fn render_title_prompt(original_prompt: &str) -> Vec<Message> {
    let mut excerpt = original_prompt.trim();
    if excerpt.len() > TITLE_PROMPT_MAX_CHARS {
        let mut end = TITLE_PROMPT_MAX_CHARS;
        while !excerpt.is_char_boundary(end) {
            end -= 1;
        }
        excerpt = &excerpt[..end];
    }
    vec![Message::system(TITLE_SYSTEM), Message::user(excerpt)]
}

// =============================================================================
// Vision extraction
// =============================================================================

pub const VISION_SYSTEM: &str = "You are an expert at extracting information from images.
Analyze the provided image and extract ALL textual and visual information.

Your response MUST follow this exact format:

## EXTRACTED TEXT
[All text visible in the image, preserving structure]

## KEY ENTITIES
[List of important entities: names, dates, numbers, organizations, etc.]

## TABLES/STRUCTURED DATA
[If any tables or structured data, represent as markdown tables]

## CONFIDENCE
[Rate 0-100 how confident you are in your extraction]

## WARNINGS
[Any issues: blur, partial visibility, unclear text, etc.]

Be thorough and accurate. If text is unclear, note it in warnings but attempt extraction anyway.";

pub const VISION_USER_INSTRUCTION: &str =
    "Please analyze this image and extract all information following the specified format.";

pub fn render_vision_messages(image_data_url: &str) -> Vec<Message> {
    vec![
        Message::system(VISION_SYSTEM),
        Message::user_with_image(VISION_USER_INSTRUCTION, image_data_url),
    ]
}

// =============================================================================
// TESTS
// =============================================================================
