//! SAM.gov contract opportunities search API.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use oppscout_shared::{RawOpportunity, Result, ScoutError};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{FetchCapability, FetchPayload, SourceParams, truncate_chars};

const NOTICE_TYPES: &str = "Combined Synopsis/Solicitation,Solicitation,Presolicitation,Special Notice";
const DESCRIPTION_MAX_CHARS: usize = 2000;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct SamGovParams {
    api_key_env: String,
    base_url: String,
    days_back: i64,
    page_size: usize,
    max_records: usize,
    page_delay_ms: u64,
}

impl Default for SamGovParams {
    fn default() -> Self {
        Self {
            api_key_env: "SAM_GOV_API_KEY".into(),
            base_url: "https://api.sam.gov/prod/opportunities/v1/search".into(),
            days_back: 14,
            page_size: 100,
            max_records: 500,
            page_delay_ms: 5000,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SearchPage {
    #[serde(default, rename = "opportunitiesData")]
    opportunities_data: Vec<Notice>,
    #[serde(default, rename = "totalRecords")]
    total_records: usize,
}

#[derive(Debug, Deserialize)]
struct Notice {
    title: Option<String>,
    description: Option<Value>,
    #[serde(rename = "uiLink")]
    ui_link: Option<String>,
    #[serde(rename = "solicitationNumber")]
    solicitation_number: Option<String>,
    #[serde(rename = "responseDeadLine")]
    response_deadline: Option<String>,
    #[serde(rename = "postedDate")]
    posted_date: Option<String>,
}

impl Notice {
    fn into_raw(self) -> RawOpportunity {
        let description = match self.description {
            Some(Value::String(s)) => s,
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        };
        let url = self.ui_link.filter(|l| !l.trim().is_empty()).or_else(|| {
            self.solicitation_number
                .as_deref()
                .map(|sol| format!("https://sam.gov/opp/{sol}/view"))
        });

        RawOpportunity {
            title: self.title.map(|t| t.trim().to_string()),
            description: Some(truncate_chars(description.trim(), DESCRIPTION_MAX_CHARS)),
            url,
            open_date: self.posted_date,
            close_date: self.response_deadline,
            ..Default::default()
        }
    }
}

/// Paginated search against the SAM.gov opportunities API.
pub struct SamGovCapability {
    client: Client,
    api_key: Option<String>,
}

impl SamGovCapability {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            api_key: None,
        }
    }

    /// Use `key` instead of reading `api_key_env`.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    fn resolve_key(&self, params: &SamGovParams) -> Option<String> {
        self.api_key.clone().or_else(|| {
            std::env::var(&params.api_key_env)
                .ok()
                .filter(|k| !k.trim().is_empty())
        })
    }

    async fn fetch_page(
        &self,
        params: &SamGovParams,
        api_key: &str,
        posted_from: &str,
        offset: usize,
    ) -> Result<SearchPage> {
        debug!(offset, limit = params.page_size, "querying SAM.gov");
        let limit = params.page_size.to_string();
        let offset_str = offset.to_string();

        let response = self
            .client
            .get(&params.base_url)
            .query(&[
                ("api_key", api_key),
                ("noticeType", NOTICE_TYPES),
                ("sort", "-modifiedDate"),
                ("limit", limit.as_str()),
                ("postedFrom", posted_from),
                ("offset", offset_str.as_str()),
            ])
            .send()
            .await
            .map_err(|e| ScoutError::Network(format!("SAM.gov: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ScoutError::Network(format!("SAM.gov: HTTP {status}")));
        }

        response
            .json::<SearchPage>()
            .await
            .map_err(|e| ScoutError::parse(format!("SAM.gov response: {e}")))
    }
}

#[async_trait]
impl FetchCapability for SamGovCapability {
    fn id(&self) -> &'static str {
        "sam_gov_api"
    }

    fn accepted_params(&self) -> &'static [&'static str] {
        &[
            "api_key_env",
            "base_url",
            "days_back",
            "page_size",
            "max_records",
            "page_delay_ms",
        ]
    }

    fn validate(&self, params: &SourceParams) -> Result<()> {
        let p: SamGovParams = params.parse()?;
        if p.page_size == 0 {
            return Err(ScoutError::validation("page_size must be positive"));
        }
        Ok(())
    }

    async fn fetch(&self, params: &SourceParams) -> Result<FetchPayload> {
        let p: SamGovParams = params.parse()?;

        let Some(api_key) = self.resolve_key(&p) else {
            warn!(env = %p.api_key_env, "SAM.gov API key not set, skipping");
            return Ok(FetchPayload::Records(Vec::new()));
        };

        let posted_from = (Utc::now() - chrono::Duration::days(p.days_back))
            .format("%Y-%m-%d")
            .to_string();
        info!(%posted_from, max_records = p.max_records, "fetching SAM.gov opportunities");

        let mut records: Vec<RawOpportunity> = Vec::new();
        let mut offset = 0usize;

        while records.len() < p.max_records {
            let page = match self.fetch_page(&p, &api_key, &posted_from, offset).await {
                Ok(page) => page,
                Err(e) if offset == 0 => return Err(e),
                Err(e) => {
                    warn!(offset, error = %e, "SAM.gov page failed, keeping earlier pages");
                    break;
                }
            };

            if page.opportunities_data.is_empty() {
                break;
            }

            let received = page.opportunities_data.len();
            let room = p.max_records - records.len();
            records.extend(
                page.opportunities_data
                    .into_iter()
                    .take(room)
                    .map(Notice::into_raw),
            );

            offset += received;
            if offset >= page.total_records || records.len() >= p.max_records {
                break;
            }

            if p.page_delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(p.page_delay_ms)).await;
            }
        }

        info!(count = records.len(), "SAM.gov fetch finished");
        Ok(FetchPayload::Records(records))
    }
}
