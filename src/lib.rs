#![forbid(unsafe_code)]

//! # council-harness
//!
//! Orchestrates multiple independent language-model backends into a single
//! deliberative answer. A user prompt is fanned out to N "council" models,
//! each surviving member anonymously ranks the others' answers, the
//! rankings are aggregated into a consensus ordering, and a designated
//! "chairman" model synthesizes a final answer informed by all of the
//! above. A side pipeline reduces an uploaded image to a bounded textual
//! context so the council only ever reasons over text.
//!
//! Partial failure is the normal case, not the exception: individual
//! member failures in stages 1 and 2 are absorbed as missing data, and the
//! request fails only on zero Stage-1 survivors or a chairman failure.

pub mod council;
pub mod gateway;
pub mod input;
pub mod prompts;
pub mod vision;

pub use council::{
    generate_title, run_council_streaming, run_full_council, AggregateRankingEntry, CouncilError,
    CouncilEvent, CouncilRequest, CouncilResult, LabelAssignment, ModelResponse,
    RankingSubmission, SynthesisResult, DEFAULT_CHAIRMAN_MODEL, DEFAULT_COUNCIL_MODELS,
};
pub use gateway::{ChatGateway, ModelCatalog, NoopUsageSink, ProviderGateway, UsageSink};
pub use input::normalize_input;
pub use vision::{extract_vision_context, VisionContext, DEFAULT_VISION_MODEL};
