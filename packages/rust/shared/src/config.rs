//! Application configuration for oppscout.
//!
//! User config lives at `~/.oppscout/oppscout.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ScoutError};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "oppscout.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".oppscout";

// ---------------------------------------------------------------------------
// Config structs (matching oppscout.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Orchestrator and scraper settings.
    #[serde(default)]
    pub pipeline: PipelineSection,

    /// Relevance scoring settings.
    #[serde(default)]
    pub scoring: ScoringSection,

    /// OpenRouter settings.
    #[serde(default)]
    pub openrouter: OpenRouterConfig,
}

/// `[pipeline]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSection {
    /// Organization capability profile used as scoring context.
    #[serde(default = "default_knowledge_file")]
    pub knowledge_file: String,

    /// Source descriptor list (`.toml` or `.json`).
    #[serde(default = "default_sources_file")]
    pub sources_file: String,

    /// Dedup ledger database file.
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Upper bound on concurrently running fetch tasks.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Per-task time budget in seconds.
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,

    /// Name of the reserved multi-phase source that runs first.
    #[serde(default = "default_partnership_source")]
    pub partnership_source: String,

    #[serde(default)]
    pub testing_mode: bool,

    /// Candidates scored when `testing_mode` is on.
    #[serde(default = "default_testing_limit")]
    pub testing_limit: usize,

    /// Dedup entries older than this are swept.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    #[serde(default = "default_true")]
    pub sweep_on_run: bool,

    /// Run partner matchmaking after scoring.
    #[serde(default = "default_true")]
    pub matchmaking: bool,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            knowledge_file: default_knowledge_file(),
            sources_file: default_sources_file(),
            database_path: default_database_path(),
            max_workers: default_max_workers(),
            task_timeout_secs: default_task_timeout_secs(),
            partnership_source: default_partnership_source(),
            testing_mode: false,
            testing_limit: default_testing_limit(),
            retention_days: default_retention_days(),
            sweep_on_run: true,
            matchmaking: true,
        }
    }
}

fn default_knowledge_file() -> String {
    "~/.oppscout/knowledge.txt".into()
}
fn default_sources_file() -> String {
    "~/.oppscout/sources.toml".into()
}
fn default_database_path() -> String {
    "~/.oppscout/seen.db".into()
}
fn default_max_workers() -> usize {
    8
}
fn default_task_timeout_secs() -> u64 {
    300
}
fn default_partnership_source() -> String {
    "SBIR Partnerships".into()
}
fn default_testing_limit() -> usize {
    5
}
fn default_retention_days() -> u32 {
    30
}
fn default_true() -> bool {
    true
}

/// `[scoring]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringSection {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Total attempts per scoring call.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Pause between batches in ms.
    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,

    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,

    /// Backoff unit; attempt `n` waits `backoff_base_ms * 2^n`.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Minimum score for inclusion in the relevant set.
    #[serde(default = "default_relevance_threshold")]
    pub relevance_threshold: f64,

    #[serde(default = "default_knowledge_max_chars")]
    pub knowledge_max_chars: usize,

    #[serde(default = "default_title_max_chars")]
    pub title_max_chars: usize,

    #[serde(default = "default_description_max_chars")]
    pub description_max_chars: usize,

    /// Display name used in prompts.
    #[serde(default = "default_organization")]
    pub organization: String,
}

impl Default for ScoringSection {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            batch_delay_ms: default_batch_delay_ms(),
            call_timeout_secs: default_call_timeout_secs(),
            backoff_base_ms: default_backoff_base_ms(),
            relevance_threshold: default_relevance_threshold(),
            knowledge_max_chars: default_knowledge_max_chars(),
            title_max_chars: default_title_max_chars(),
            description_max_chars: default_description_max_chars(),
            organization: default_organization(),
        }
    }
}

fn default_batch_size() -> usize {
    5
}
fn default_max_retries() -> u32 {
    3
}
fn default_batch_delay_ms() -> u64 {
    1000
}
fn default_call_timeout_secs() -> u64 {
    30
}
fn default_backoff_base_ms() -> u64 {
    1000
}
fn default_relevance_threshold() -> f64 {
    0.7
}
fn default_knowledge_max_chars() -> usize {
    12_000
}
fn default_title_max_chars() -> usize {
    500
}
fn default_description_max_chars() -> usize {
    4_000
}
fn default_organization() -> String {
    "our organization".into()
}

/// `[openrouter]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenRouterConfig {
    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Model used for scoring and matchmaking.
    #[serde(default = "default_model")]
    pub default_model: String,

    #[serde(default = "default_base_url")]
    pub base_url: String,
}

impl Default for OpenRouterConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_api_key_env(),
            default_model: default_model(),
            base_url: default_base_url(),
        }
    }
}

fn default_api_key_env() -> String {
    "OPENROUTER_API_KEY".into()
}
fn default_model() -> String {
    "google/gemini-2.5-flash".into()
}
fn default_base_url() -> String {
    "https://openrouter.ai/api/v1".into()
}

// ---------------------------------------------------------------------------
// Runtime configs (merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime scraper configuration.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub max_workers: usize,
    pub task_timeout: Duration,
    /// Reserved source executed first and synchronously.
    pub partnership_source: String,
    pub testing_mode: bool,
}

impl From<&AppConfig> for RunnerConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            max_workers: config.pipeline.max_workers.max(1),
            task_timeout: Duration::from_secs(config.pipeline.task_timeout_secs),
            partnership_source: config.pipeline.partnership_source.clone(),
            testing_mode: config.pipeline.testing_mode,
        }
    }
}

/// Runtime relevance-scoring configuration.
#[derive(Debug, Clone)]
pub struct ScoringConfig {
    pub batch_size: usize,
    pub max_retries: u32,
    pub batch_delay: Duration,
    pub call_timeout: Duration,
    pub backoff_base: Duration,
    pub threshold: f64,
    pub knowledge_max_chars: usize,
    pub title_max_chars: usize,
    pub description_max_chars: usize,
    pub organization: String,
}

impl ScoringConfig {
    /// Deadline for one whole batch: `call_timeout * batch_size * 2`.
    ///
    /// Uses the configured size, so a short final batch keeps the full budget.
    pub fn batch_timeout(&self) -> Duration {
        self.call_timeout
            .saturating_mul(u32::try_from(self.batch_size.max(1)).unwrap_or(u32::MAX))
            .saturating_mul(2)
    }
}

impl From<&AppConfig> for ScoringConfig {
    fn from(config: &AppConfig) -> Self {
        let s = &config.scoring;
        Self {
            batch_size: s.batch_size.max(1),
            max_retries: s.max_retries.max(1),
            batch_delay: Duration::from_millis(s.batch_delay_ms),
            call_timeout: Duration::from_secs(s.call_timeout_secs),
            backoff_base: Duration::from_millis(s.backoff_base_ms),
            threshold: s.relevance_threshold,
            knowledge_max_chars: s.knowledge_max_chars,
            title_max_chars: s.title_max_chars,
            description_max_chars: s.description_max_chars,
            organization: s.organization.clone(),
        }
    }
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.oppscout/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| ScoutError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.oppscout/oppscout.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Expand a leading `~/` against the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| ScoutError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| ScoutError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| ScoutError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| ScoutError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| ScoutError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Check that the OpenRouter API key env var is set and non-empty.
pub fn validate_api_key(config: &AppConfig) -> Result<String> {
    let var_name = &config.openrouter.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.trim().is_empty() => Ok(val),
        _ => Err(ScoutError::config(format!(
            "OpenRouter API key not found. Set the {var_name} environment variable.\n\
             Get a key at https://openrouter.ai/keys"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("sources_file"));
        assert!(toml_str.contains("OPENROUTER_API_KEY"));
        assert!(toml_str.contains("SBIR Partnerships"));
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let toml_str = r#"
[pipeline]
max_workers = 2
testing_mode = true

[scoring]
relevance_threshold = 0.5
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.pipeline.max_workers, 2);
        assert!(config.pipeline.testing_mode);
        assert_eq!(config.pipeline.retention_days, 30);
        assert_eq!(config.scoring.batch_size, 5);
        assert!((config.scoring.relevance_threshold - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn runtime_configs_from_app_config() {
        let app = AppConfig::default();
        let runner = RunnerConfig::from(&app);
        assert_eq!(runner.max_workers, 8);
        assert_eq!(runner.task_timeout, Duration::from_secs(300));

        let scoring = ScoringConfig::from(&app);
        assert_eq!(scoring.batch_size, 5);
        assert_eq!(scoring.max_retries, 3);
        assert_eq!(scoring.call_timeout, Duration::from_secs(30));
        assert_eq!(scoring.batch_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn zero_workers_is_clamped() {
        let mut app = AppConfig::default();
        app.pipeline.max_workers = 0;
        app.scoring.batch_size = 0;
        assert_eq!(RunnerConfig::from(&app).max_workers, 1);
        assert_eq!(ScoringConfig::from(&app).batch_size, 1);
    }

    #[test]
    fn expand_home_only_touches_tilde_prefix() {
        assert_eq!(expand_home("/tmp/x.db"), PathBuf::from("/tmp/x.db"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_home("~/a/b"), home.join("a/b"));
        }
    }

    #[test]
    fn api_key_validation() {
        let mut config = AppConfig::default();
        // Use a unique env var name to avoid interfering with other tests
        config.openrouter.api_key_env = "OPPSCOUT_TEST_NONEXISTENT_KEY_12345".into();
        let result = validate_api_key(&config);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("API key not found"));
    }
}
