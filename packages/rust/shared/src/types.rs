//! Core domain types for oppscout.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

/// Sentinel used for dates a source did not provide.
pub const NOT_AVAILABLE: &str = "N/A";

// ---------------------------------------------------------------------------
// RunId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper identifying one pipeline run (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Generate a new time-sortable run identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// RawOpportunity
// ---------------------------------------------------------------------------

/// A record exactly as a fetch capability produced it.
///
/// Every field is optional; text fields accept strings, numbers, or booleans
/// so that loosely-typed out-of-process sources still normalise. Keys that
/// are not recognised are kept in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawOpportunity {
    #[serde(
        rename = "Source",
        alias = "source",
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub source: Option<String>,

    #[serde(
        rename = "Title",
        alias = "title",
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub title: Option<String>,

    #[serde(
        rename = "Description",
        alias = "description",
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub description: Option<String>,

    #[serde(
        rename = "URL",
        alias = "url",
        alias = "Url",
        alias = "link",
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub url: Option<String>,

    #[serde(
        rename = "OpenDate",
        alias = "Open Date",
        alias = "open_date",
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub open_date: Option<String>,

    #[serde(
        rename = "CloseDate",
        alias = "Close Date",
        alias = "close_date",
        alias = "closeDate",
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub close_date: Option<String>,

    #[serde(
        rename = "ScrapedDate",
        alias = "scraped_date",
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub scraped_date: Option<String>,

    /// Capability-specific fields (e.g. `company_name` for partner dossiers).
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Accept a string, number, or bool as text; `null` and absence become `None`.
fn lenient_string<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        Some(serde_json::Value::Bool(b)) => Some(b.to_string()),
        Some(other) => Some(other.to_string()),
    })
}

// ---------------------------------------------------------------------------
// Opportunity
// ---------------------------------------------------------------------------

/// One discovered funding/contract listing, normalised.
///
/// The analysis fields are only populated by the scoring pipeline; the
/// dedup store sets nothing here except through `is_new`, which the
/// orchestrator computes from the store's snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    /// Name of the source descriptor that produced this record.
    #[serde(rename = "Source")]
    pub source: String,
    #[serde(rename = "Title")]
    pub title: String,
    #[serde(rename = "Description")]
    pub description: String,
    /// Natural key used by the dedup store. May be empty.
    #[serde(rename = "URL")]
    pub url: String,
    /// ISO date or [`NOT_AVAILABLE`].
    #[serde(rename = "OpenDate")]
    pub open_date: String,
    /// ISO date or [`NOT_AVAILABLE`].
    #[serde(rename = "CloseDate")]
    pub close_date: String,
    #[serde(rename = "ScrapedDate")]
    pub scraped_date: DateTime<Utc>,

    /// Relevance in `[0, 1]`.
    #[serde(rename = "RelevanceScore", default, skip_serializing_if = "Option::is_none")]
    pub relevance_score: Option<f64>,
    #[serde(rename = "Justification", default, skip_serializing_if = "Option::is_none")]
    pub justification: Option<String>,
    #[serde(rename = "RelatedExperience", default, skip_serializing_if = "Option::is_none")]
    pub related_experience: Option<String>,
    #[serde(rename = "FundingAssessment", default, skip_serializing_if = "Option::is_none")]
    pub funding_assessment: Option<String>,
    #[serde(
        rename = "SuggestedInternalLead",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub suggested_internal_lead: Option<String>,
    #[serde(rename = "IsNew", default)]
    pub is_new: bool,

    #[serde(flatten, default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Opportunity {
    /// Normalise a raw record, stamping it with `source`.
    ///
    /// Missing title becomes [`NOT_AVAILABLE`], missing dates become
    /// [`NOT_AVAILABLE`], a missing or unparseable scrape timestamp becomes now.
    pub fn from_raw(raw: RawOpportunity, source: &str) -> Self {
        let scraped_date = raw
            .scraped_date
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s.trim()).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        Self {
            source: source.to_string(),
            title: non_blank(raw.title).unwrap_or_else(|| NOT_AVAILABLE.to_string()),
            description: raw.description.unwrap_or_default().trim().to_string(),
            url: raw.url.unwrap_or_default().trim().to_string(),
            open_date: non_blank(raw.open_date).unwrap_or_else(|| NOT_AVAILABLE.to_string()),
            close_date: non_blank(raw.close_date).unwrap_or_else(|| NOT_AVAILABLE.to_string()),
            scraped_date,
            relevance_score: None,
            justification: None,
            related_experience: None,
            funding_assessment: None,
            suggested_internal_lead: None,
            is_new: false,
            extra: raw.extra,
        }
    }

    /// Whether this record can enter the dedup store.
    pub fn has_identifier(&self) -> bool {
        !self.url.trim().is_empty()
    }

    /// Read a capability-specific string field.
    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(|v| v.as_str())
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

// ---------------------------------------------------------------------------
// SeenEntry
// ---------------------------------------------------------------------------

/// One row of the persisted dedup ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeenEntry {
    /// Primary key.
    pub url: String,
    /// Set once, on first observation.
    pub first_seen: DateTime<Utc>,
    pub source: String,
    /// Refreshed on every re-sighting.
    pub last_updated: DateTime<Utc>,
}
