//! Fetch capability trait and built-in capabilities.
//!
//! A capability is a named operation that turns a parameter map into a list
//! of raw opportunity records. Each one declares the parameter names it
//! accepts; the source registry filters configured arguments down to that
//! set and asks the capability to validate them before any run starts.

mod command;
mod html_listing;
mod partner_dossiers;
mod sam_gov;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use oppscout_shared::{RawOpportunity, Result, ScoutError};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

pub use command::CommandCapability;
pub use html_listing::{HtmlListingCapability, ListingSelectors, parse_listing};
pub use partner_dossiers::{PartnerDossiersCapability, parse_dossier};
pub use sam_gov::SamGovCapability;

/// User-Agent string for outbound requests.
pub(crate) const USER_AGENT: &str = concat!("oppscout/", env!("CARGO_PKG_VERSION"));

/// Name of the flag injected into the partnership source.
pub const TESTING_MODE_PARAM: &str = "testing_mode";

// ---------------------------------------------------------------------------
// Parameters and payloads
// ---------------------------------------------------------------------------

/// Named arguments handed to a capability.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceParams(Map<String, Value>);

impl SourceParams {
    pub fn new(map: Map<String, Value>) -> Self {
        Self(map)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Keep only the keys in `accepted`; returns the names that were dropped.
    pub fn retain_accepted(&mut self, accepted: &[&str]) -> Vec<String> {
        let dropped: Vec<String> = self
            .0
            .keys()
            .filter(|k| !accepted.contains(&k.as_str()))
            .cloned()
            .collect();
        for key in &dropped {
            self.0.remove(key);
        }
        dropped
    }

    /// Deserialize into a capability's typed parameter struct.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(Value::Object(self.0.clone()))
            .map_err(|e| ScoutError::validation(format!("invalid parameters: {e}")))
    }
}

impl From<Map<String, Value>> for SourceParams {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// What a capability hands back.
#[derive(Debug, Clone)]
pub enum FetchPayload {
    /// Records already shaped by the capability.
    Records(Vec<RawOpportunity>),
    /// An untyped JSON document; the runner expects an array of objects.
    Json(Value),
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// A registered fetch operation.
#[async_trait]
pub trait FetchCapability: Send + Sync {
    /// Registry key referenced by `function` in the sources file.
    fn id(&self) -> &'static str;

    /// Parameter names this capability understands.
    fn accepted_params(&self) -> &'static [&'static str];

    /// Check already-filtered parameters before the run.
    fn validate(&self, _params: &SourceParams) -> Result<()> {
        Ok(())
    }

    async fn fetch(&self, params: &SourceParams) -> Result<FetchPayload>;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Known capabilities, keyed by id.
#[derive(Clone, Default)]
pub struct CapabilityRegistry {
    capabilities: BTreeMap<&'static str, Arc<dyn FetchCapability>>,
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.capabilities.keys()).finish()
    }
}

impl CapabilityRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every built-in capability.
    pub fn builtin() -> Result<Self> {
        let client = http_client()?;
        let mut registry = Self::new();
        registry.register(Arc::new(SamGovCapability::new(client.clone())));
        registry.register(Arc::new(HtmlListingCapability::new(client)));
        registry.register(Arc::new(CommandCapability));
        registry.register(Arc::new(PartnerDossiersCapability));
        Ok(registry)
    }

    /// Add or replace a capability.
    pub fn register(&mut self, capability: Arc<dyn FetchCapability>) {
        self.capabilities.insert(capability.id(), capability);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn FetchCapability>> {
        self.capabilities.get(id).cloned()
    }

    pub fn ids(&self) -> Vec<&'static str> {
        self.capabilities.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }
}

/// Shared HTTP client for the built-in web capabilities.
pub fn http_client() -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .redirect(reqwest::redirect::Policy::limited(5))
        .timeout(Duration::from_secs(45))
        .build()
        .map_err(|e| ScoutError::Network(format!("failed to build HTTP client: {e}")))
}

/// Truncate to at most `max` chars on a char boundary.
pub(crate) fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}
