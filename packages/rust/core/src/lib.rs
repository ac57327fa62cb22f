//! Pipeline orchestration for oppscout.
//!
//! This crate ties the source runner, the dedup store, and the scoring
//! capability into one run ([`Pipeline::run`]) and provides the pre-flight
//! checks behind `oppscout diagnose`.

pub mod diagnostics;
pub mod json_repair;
pub mod llm;
pub mod matchmaking;
pub mod pipeline;
pub mod scoring;

pub use diagnostics::{CheckStatus, DiagnosticCheck, any_failed, run_diagnostics};
pub use json_repair::{JsonObject, Strategy, extract_json_object, extract_with_strategy};
pub use llm::{OpenRouterScorer, ScoringCapability};
pub use matchmaking::{Matchmaker, PartnerMatch, SuggestedPartner};
pub use pipeline::{
    Pipeline, PipelineConfig, PipelineOutput, PipelineStage, PipelineStats, load_knowledge,
};
pub use scoring::{Analysis, RelevanceScorer, ScoringOutcome, ScoringStats, partition};
