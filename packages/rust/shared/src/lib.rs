//! Shared types, error model, configuration, and progress log for oppscout.
//!
//! This crate is the foundation depended on by all other oppscout crates.
//! It provides:
//! - [`ScoutError`]: the unified error type
//! - Domain types ([`Opportunity`], [`RawOpportunity`], [`SeenEntry`], [`RunId`])
//! - Configuration ([`AppConfig`], [`RunnerConfig`], [`ScoringConfig`], config loading)
//! - [`ProgressLog`]: the append-only structured log polled by external consumers

pub mod config;
pub mod error;
pub mod progress;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, OpenRouterConfig, PipelineSection, RunnerConfig, ScoringConfig, ScoringSection,
    config_dir, config_file_path, expand_home, init_config, load_config, load_config_from,
    validate_api_key,
};
pub use error::{Result, ScoutError};
pub use progress::{LogEntry, LogLevel, LogSink, ProgressLog};
pub use types::{NOT_AVAILABLE, Opportunity, RawOpportunity, RunId, SeenEntry};
