//! Source registry: validated source descriptors loaded from configuration.
//!
//! Each configured entry names a fetch capability. Entries that reference
//! an unknown capability, miss a function name, repeat an earlier name, or
//! fail the capability's parameter check are excluded with a warning.
//! Nothing here is fatal except an unreadable or unparseable file.

use std::path::Path;
use std::sync::Arc;

use oppscout_shared::{ProgressLog, Result, RunnerConfig, ScoutError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, instrument};

use crate::capabilities::{CapabilityRegistry, FetchCapability, SourceParams, TESTING_MODE_PARAM};

/// One entry as written in the sources file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceEntry {
    #[serde(default)]
    pub name: Option<String>,
    /// Capability id.
    #[serde(default)]
    pub function: Option<String>,
    #[serde(default)]
    pub args: Map<String, Value>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct SourcesFile {
    #[serde(default, alias = "scrapers")]
    sources: Vec<SourceEntry>,
}

/// A validated source, immutable for the run.
#[derive(Clone)]
pub struct SourceDescriptor {
    pub name: String,
    pub capability: Arc<dyn FetchCapability>,
    pub enabled: bool,
    /// Arguments already filtered to `capability.accepted_params()`.
    pub params: SourceParams,
}

impl std::fmt::Debug for SourceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceDescriptor")
            .field("name", &self.name)
            .field("capability", &self.capability.id())
            .field("enabled", &self.enabled)
            .field("params", &self.params)
            .finish()
    }
}

impl SourceDescriptor {
    pub fn accepted_params(&self) -> &'static [&'static str] {
        self.capability.accepted_params()
    }
}

/// An entry that was excluded at load time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvalidSource {
    pub name: String,
    pub reason: String,
}

/// The validated source set.
#[derive(Debug, Clone, Default)]
pub struct SourceRegistry {
    descriptors: Vec<SourceDescriptor>,
    invalid: Vec<InvalidSource>,
}

impl SourceRegistry {
    /// Read and validate the sources file at `path` (`.json` or TOML).
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn load_config(
        path: &Path,
        capabilities: &CapabilityRegistry,
        runner: &RunnerConfig,
        log: &ProgressLog,
    ) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ScoutError::config(format!("cannot read sources file {}: {e}", path.display()))
        })?;

        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));

        let file: SourcesFile = if is_json {
            serde_json::from_str(&content).map_err(|e| {
                ScoutError::config(format!("failed to parse {}: {e}", path.display()))
            })?
        } else {
            toml::from_str(&content).map_err(|e| {
                ScoutError::config(format!("failed to parse {}: {e}", path.display()))
            })?
        };

        Ok(Self::from_entries(file.sources, capabilities, runner, log))
    }

    /// Validate already-parsed entries.
    pub fn from_entries(
        entries: Vec<SourceEntry>,
        capabilities: &CapabilityRegistry,
        runner: &RunnerConfig,
        log: &ProgressLog,
    ) -> Self {
        let mut registry = Self::default();

        for (index, entry) in entries.into_iter().enumerate() {
            let name = match entry.name.as_deref().map(str::trim) {
                Some(n) if !n.is_empty() => n.to_string(),
                _ => {
                    registry.reject(format!("entry #{}", index + 1), "missing name", log);
                    continue;
                }
            };

            if registry.descriptors.iter().any(|d| d.name == name) {
                registry.reject(name, "duplicate source name", log);
                continue;
            }

            let Some(function) = entry.function.as_deref().map(str::trim).filter(|f| !f.is_empty())
            else {
                registry.reject(name, "missing function name", log);
                continue;
            };

            let Some(capability) = capabilities.get(function) else {
                registry.reject(name, format!("unknown function '{function}'"), log);
                continue;
            };

            let mut params = SourceParams::new(entry.args);
            let dropped = params.retain_accepted(capability.accepted_params());
            if !dropped.is_empty() {
                tracing::warn!(source = %name, ?dropped, "dropping unsupported arguments");
            }

            if name == runner.partnership_source
                && capability.accepted_params().contains(&TESTING_MODE_PARAM)
            {
                params.insert(TESTING_MODE_PARAM, Value::Bool(runner.testing_mode));
            }

            if let Err(e) = capability.validate(&params) {
                registry.reject(name, e.to_string(), log);
                continue;
            }

            debug!(source = %name, capability = capability.id(), enabled = entry.enabled, "source registered");
            registry.descriptors.push(SourceDescriptor {
                name,
                capability,
                enabled: entry.enabled,
                params,
            });
        }

        if registry.enabled().next().is_none() {
            log.warn("No valid enabled sources configured");
        } else {
            log.info(format!(
                "Loaded {} source(s), {} invalid",
                registry.descriptors.len(),
                registry.invalid.len()
            ));
        }

        registry
    }

    fn reject(&mut self, name: String, reason: impl Into<String>, log: &ProgressLog) {
        let reason = reason.into();
        log.warn(format!("Skipping source '{name}': {reason}"));
        self.invalid.push(InvalidSource { name, reason });
    }

    /// Every valid descriptor, enabled or not, in file order.
    pub fn descriptors(&self) -> &[SourceDescriptor] {
        &self.descriptors
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceDescriptor> {
        self.descriptors.iter().filter(|d| d.enabled)
    }

    pub fn invalid(&self) -> &[InvalidSource] {
        &self.invalid
    }

    pub fn get(&self, name: &str) -> Option<&SourceDescriptor> {
        self.descriptors.iter().find(|d| d.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}
