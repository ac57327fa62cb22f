//! Pre-flight checks, one [`DiagnosticCheck`] per collaborator.

use std::sync::Arc;

use oppscout_shared::{AppConfig, ProgressLog, ScoutError, validate_api_key};
use oppscout_sources::{CapabilityRegistry, SourceRegistry};
use oppscout_storage::DedupStore;
use serde::Serialize;
use tracing::instrument;

use crate::json_repair::extract_json_object;
use crate::llm::ScoringCapability;
use crate::pipeline::{PipelineConfig, load_knowledge};

/// Knowledge shorter than this is suspicious.
pub const MIN_KNOWLEDGE_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pass,
    Warning,
    Fail,
}

impl std::fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(match self {
            Self::Pass => "PASS",
            Self::Warning => "WARN",
            Self::Fail => "FAIL",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiagnosticCheck {
    pub name: &'static str,
    pub status: CheckStatus,
    pub detail: String,
}

impl DiagnosticCheck {
    fn new(name: &'static str, status: CheckStatus, detail: impl Into<String>) -> Self {
        Self {
            name,
            status,
            detail: detail.into(),
        }
    }
}

/// True when any check failed.
pub fn any_failed(checks: &[DiagnosticCheck]) -> bool {
    checks.iter().any(|c| c.status == CheckStatus::Fail)
}

fn check_configuration(app: &AppConfig, config: &PipelineConfig) -> DiagnosticCheck {
    const NAME: &str = "configuration";

    if let Err(e) = validate_api_key(app) {
        return DiagnosticCheck::new(NAME, CheckStatus::Fail, e.to_string());
    }

    let scoring = &config.scoring;
    let mut problems = Vec::new();
    if !(0.0..=1.0).contains(&scoring.threshold) {
        problems.push(format!("relevance_threshold {} outside [0, 1]", scoring.threshold));
    }
    if scoring.call_timeout.is_zero() {
        problems.push("call_timeout_secs must be positive".to_string());
    }
    if config.runner.task_timeout.is_zero() {
        problems.push("task_timeout_secs must be positive".to_string());
    }

    if problems.is_empty() {
        DiagnosticCheck::new(
            NAME,
            CheckStatus::Pass,
            format!(
                "model {}, batch size {}, threshold {}",
                app.openrouter.default_model, scoring.batch_size, scoring.threshold
            ),
        )
    } else {
        DiagnosticCheck::new(NAME, CheckStatus::Fail, problems.join("; "))
    }
}

async fn check_storage(config: &PipelineConfig) -> DiagnosticCheck {
    const NAME: &str = "storage";
    let store = match DedupStore::open(&config.database_path).await {
        Ok(store) => store,
        Err(e) => return DiagnosticCheck::new(NAME, CheckStatus::Fail, e.to_string()),
    };
    match store.count().await {
        Ok(count) => DiagnosticCheck::new(
            NAME,
            CheckStatus::Pass,
            format!("{} ({count} seen entries)", config.database_path.display()),
        ),
        Err(e) => DiagnosticCheck::new(NAME, CheckStatus::Fail, e.to_string()),
    }
}

fn check_knowledge(config: &PipelineConfig) -> DiagnosticCheck {
    const NAME: &str = "knowledge";
    match load_knowledge(&config.knowledge_file) {
        Ok(text) => {
            let chars = text.chars().count();
            if chars < MIN_KNOWLEDGE_CHARS {
                DiagnosticCheck::new(
                    NAME,
                    CheckStatus::Warning,
                    format!("only {chars} chars; scoring will have little context"),
                )
            } else {
                DiagnosticCheck::new(NAME, CheckStatus::Pass, format!("{chars} chars"))
            }
        }
        Err(e) => DiagnosticCheck::new(NAME, CheckStatus::Fail, e.to_string()),
    }
}

fn check_sources(config: &PipelineConfig, capabilities: &CapabilityRegistry) -> DiagnosticCheck {
    const NAME: &str = "sources";
    // Registry warnings belong to this check, not the caller's run log.
    let scratch = ProgressLog::new();
    match SourceRegistry::load_config(&config.sources_file, capabilities, &config.runner, &scratch)
    {
        Ok(registry) => {
            let enabled = registry.enabled().count();
            let invalid = registry.invalid();
            if enabled == 0 {
                DiagnosticCheck::new(NAME, CheckStatus::Fail, "no valid enabled sources")
            } else if !invalid.is_empty() {
                let names: Vec<&str> = invalid.iter().map(|i| i.name.as_str()).collect();
                DiagnosticCheck::new(
                    NAME,
                    CheckStatus::Warning,
                    format!("{enabled} enabled, invalid: {}", names.join(", ")),
                )
            } else {
                DiagnosticCheck::new(NAME, CheckStatus::Pass, format!("{enabled} enabled"))
            }
        }
        Err(e) => DiagnosticCheck::new(NAME, CheckStatus::Fail, e.to_string()),
    }
}

async fn check_scoring(
    scorer: Option<&Arc<dyn ScoringCapability>>,
    config: &PipelineConfig,
) -> DiagnosticCheck {
    const NAME: &str = "scoring";
    let Some(scorer) = scorer else {
        return DiagnosticCheck::new(NAME, CheckStatus::Fail, "scoring capability not configured");
    };

    let probe = scorer.complete(
        "You are a health check. Answer with JSON only.",
        r#"Reply with exactly {"status": "ok"}"#,
    );
    match tokio::time::timeout(config.scoring.call_timeout, probe).await {
        Ok(Ok(text)) => match extract_json_object(&text) {
            Some(_) => DiagnosticCheck::new(
                NAME,
                CheckStatus::Pass,
                format!("{} answered", scorer.model()),
            ),
            None => DiagnosticCheck::new(
                NAME,
                CheckStatus::Warning,
                format!("{} answered without JSON", scorer.model()),
            ),
        },
        Ok(Err(e)) => DiagnosticCheck::new(NAME, CheckStatus::Fail, e.to_string()),
        Err(_) => DiagnosticCheck::new(
            NAME,
            CheckStatus::Fail,
            ScoutError::Timeout(format!(
                "probe exceeded {}s",
                config.scoring.call_timeout.as_secs_f64()
            ))
            .to_string(),
        ),
    }
}

/// Run every check. Never fails; problems are reported as check results.
#[instrument(skip_all)]
pub async fn run_diagnostics(
    app: &AppConfig,
    capabilities: &CapabilityRegistry,
    scorer: Option<Arc<dyn ScoringCapability>>,
) -> Vec<DiagnosticCheck> {
    let config = PipelineConfig::from(app);
    vec![
        check_configuration(app, &config),
        check_storage(&config).await,
        check_knowledge(&config),
        check_sources(&config, capabilities),
        check_scoring(scorer.as_ref(), &config).await,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use oppscout_shared::Result;
    use std::path::PathBuf;
    use uuid::Uuid;

    struct Echo(&'static str);

    #[async_trait]
    impl ScoringCapability for Echo {
        fn model(&self) -> &str {
            "echo"
        }
        async fn complete(&self, _s: &str, _u: &str) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("oppscout_diag_{}", Uuid::now_v7()));
        std::fs::create_dir_all(&dir).expect("mkdir");
        dir
    }

    fn app_for(dir: &std::path::Path) -> AppConfig {
        let mut app = AppConfig::default();
        // Any variable that is always set stands in for the API key.
        app.openrouter.api_key_env = "PATH".into();
        app.pipeline.knowledge_file = dir.join("knowledge.txt").to_string_lossy().into_owned();
        app.pipeline.sources_file = dir.join("sources.toml").to_string_lossy().into_owned();
        app.pipeline.database_path = dir.join("seen.db").to_string_lossy().into_owned();
        app
    }

    fn status_of(checks: &[DiagnosticCheck], name: &str) -> CheckStatus {
        checks
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.status)
            .expect("check present")
    }

    #[tokio::test]
    async fn healthy_setup_passes() {
        let dir = temp_dir();
        std::fs::write(dir.join("knowledge.txt"), "capabilities ".repeat(40)).expect("write");
        std::fs::write(
            dir.join("sources.toml"),
            "[[sources]]\nname = \"Partners\"\nfunction = \"partner_dossiers\"\nargs = { dossier_dir = \"/tmp\" }\n",
        )
        .expect("write");

        let checks = run_diagnostics(
            &app_for(&dir),
            &CapabilityRegistry::builtin().expect("builtin"),
            Some(Arc::new(Echo(r#"{"status": "ok"}"#))),
        )
        .await;

        assert_eq!(checks.len(), 5);
        assert!(!any_failed(&checks), "{checks:?}");
        assert_eq!(status_of(&checks, "knowledge"), CheckStatus::Pass);
        assert_eq!(status_of(&checks, "scoring"), CheckStatus::Pass);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn problems_are_reported_per_check() {
        let dir = temp_dir();
        std::fs::write(dir.join("knowledge.txt"), "tiny").expect("write");
        std::fs::write(
            dir.join("sources.toml"),
            "[[sources]]\nname = \"Ghost\"\nfunction = \"nope\"\n",
        )
        .expect("write");

        let mut app = app_for(&dir);
        app.scoring.relevance_threshold = 1.5;

        let checks = run_diagnostics(
            &app,
            &CapabilityRegistry::builtin().expect("builtin"),
            Some(Arc::new(Echo("I am fine, thanks."))),
        )
        .await;

        assert!(any_failed(&checks));
        assert_eq!(status_of(&checks, "configuration"), CheckStatus::Fail);
        assert_eq!(status_of(&checks, "storage"), CheckStatus::Pass);
        assert_eq!(status_of(&checks, "knowledge"), CheckStatus::Warning);
        assert_eq!(status_of(&checks, "sources"), CheckStatus::Fail);
        assert_eq!(status_of(&checks, "scoring"), CheckStatus::Warning);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn missing_scorer_fails() {
        let dir = temp_dir();
        let checks = run_diagnostics(
            &app_for(&dir),
            &CapabilityRegistry::builtin().expect("builtin"),
            None,
        )
        .await;
        assert_eq!(status_of(&checks, "scoring"), CheckStatus::Fail);
        assert_eq!(status_of(&checks, "knowledge"), CheckStatus::Fail);
        let _ = std::fs::remove_dir_all(dir);
    }
}
