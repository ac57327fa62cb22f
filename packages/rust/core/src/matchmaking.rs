//! Strategic partner matchmaking.
//!
//! Each relevant opportunity is offered to the scoring capability together
//! with the partner roster built from the partnership source. Calls run one
//! at a time; a failed call skips that opportunity.

use std::sync::Arc;

use oppscout_shared::{Opportunity, ProgressLog, ScoringConfig};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::json_repair::JsonObject;
use crate::llm::ScoringCapability;
use crate::scoring::{CallPolicy, call_for_json, sanitize};

/// Upper bound on suggestions kept per opportunity.
pub const MAX_SUGGESTED_PARTNERS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuggestedPartner {
    pub partner_company: String,
    pub reasoning: String,
}

/// One matchmaking output row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartnerMatch {
    #[serde(rename = "DirectOpportunityTitle")]
    pub opportunity_title: String,
    #[serde(rename = "DirectOpportunityURL")]
    pub opportunity_url: String,
    #[serde(rename = "SuggestedPartners")]
    pub suggested_partners: Vec<SuggestedPartner>,
}

/// Company name for a partnership record: `company_name`, else the title.
pub fn partner_name(partner: &Opportunity) -> &str {
    partner
        .extra_str("company_name")
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(&partner.title)
}

/// One line per partner: `- Company: X, Project: Y`.
pub fn partner_roster(partners: &[Opportunity]) -> String {
    partners
        .iter()
        .map(|p| format!("- Company: {}, Project: {}", partner_name(p), p.title))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Read `suggested_partners`, skipping malformed entries and capping at three.
pub fn parse_suggestions(obj: &JsonObject) -> Vec<SuggestedPartner> {
    let Some(Value::Array(items)) = obj.get("suggested_partners") else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| {
            let company = item.get("partner_company")?.as_str()?.trim();
            if company.is_empty() {
                return None;
            }
            let reasoning = item
                .get("reasoning")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .trim();
            Some(SuggestedPartner {
                partner_company: company.to_string(),
                reasoning: reasoning.to_string(),
            })
        })
        .take(MAX_SUGGESTED_PARTNERS)
        .collect()
}

fn system_prompt(config: &ScoringConfig) -> String {
    format!(
        "You are a strategic partnership analyst for {}. \
         You pair funding opportunities with companies from a partner roster \
         and answer with a single JSON object and nothing else.",
        config.organization
    )
}

fn user_prompt(opp: &Opportunity, roster: &str, config: &ScoringConfig) -> String {
    format!(
        "OPPORTUNITY:\n---\nTitle: {title}\nDescription: {description}\n---\n\n\
         PARTNER ROSTER:\n---\n{roster}\n---\n\n\
         Identify up to {MAX_SUGGESTED_PARTNERS} partners from the roster best suited to pursue this \
         opportunity with us. Respond with ONLY a JSON object of the form \
         {{\"suggested_partners\": [{{\"partner_company\": \"...\", \"reasoning\": \"...\"}}]}}. \
         Return an empty list when nobody fits.",
        title = sanitize(&opp.title, config.title_max_chars),
        description = sanitize(&opp.description, config.description_max_chars),
    )
}

pub struct Matchmaker {
    scorer: Arc<dyn ScoringCapability>,
    config: ScoringConfig,
}

impl Matchmaker {
    pub fn new(scorer: Arc<dyn ScoringCapability>, config: ScoringConfig) -> Self {
        Self { scorer, config }
    }

    /// Suggest partners for each relevant opportunity.
    ///
    /// Returns nothing when either input is empty. Opportunities for which
    /// the model suggested nobody produce no row.
    #[instrument(skip_all, fields(relevant = relevant.len(), partners = partners.len()))]
    pub async fn match_all(
        &self,
        relevant: &[Opportunity],
        partners: &[Opportunity],
        log: &ProgressLog,
    ) -> Vec<PartnerMatch> {
        if relevant.is_empty() || partners.is_empty() {
            debug!("matchmaking skipped, nothing to pair");
            return Vec::new();
        }

        log.info(format!(
            "Matching {} relevant opportunities against {} partners",
            relevant.len(),
            partners.len()
        ));

        let roster = partner_roster(partners);
        let system = system_prompt(&self.config);
        let policy = CallPolicy::from(&self.config);
        let mut matches = Vec::new();

        for opp in relevant {
            let user = user_prompt(opp, &roster, &self.config);
            match call_for_json(self.scorer.as_ref(), &system, &user, policy).await {
                Ok(obj) => {
                    let suggested = parse_suggestions(&obj);
                    if suggested.is_empty() {
                        debug!(title = %opp.title, "no partners suggested");
                        continue;
                    }
                    matches.push(PartnerMatch {
                        opportunity_title: opp.title.clone(),
                        opportunity_url: opp.url.clone(),
                        suggested_partners: suggested,
                    });
                }
                Err(e) => {
                    log.warn(format!("Matchmaking failed for '{}': {e}", opp.title));
                }
            }
        }

        log.info(format!(
            "Matchmaking complete: {} opportunities paired",
            matches.len()
        ));
        matches
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use oppscout_shared::{RawOpportunity, Result, ScoutError};
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    struct RosterScorer {
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ScoringCapability for RosterScorer {
        fn model(&self) -> &str {
            "roster"
        }

        async fn complete(&self, _system: &str, user: &str) -> Result<String> {
            self.prompts.lock().expect("lock").push(user.to_string());
            if user.contains("Title: Broken") {
                return Err(ScoutError::Network("unreachable".into()));
            }
            if user.contains("Title: Lonely") {
                return Ok(r#"{"suggested_partners": []}"#.into());
            }
            Ok(r#"Sure! {"suggested_partners": [
                {"partner_company": "Acme Robotics", "reasoning": "autonomy stack"},
                {"partner_company": "Borealis", "reasoning": "materials"},
                {"reasoning": "no name"},
                {"partner_company": "Third", "reasoning": ""},
                {"partner_company": "Fourth", "reasoning": "over the cap"}
            ]}"#
            .into())
        }
    }

    fn record(title: &str, url: &str, company: Option<&str>) -> Opportunity {
        let mut raw = RawOpportunity {
            title: Some(title.into()),
            url: Some(url.into()),
            ..Default::default()
        };
        if let Some(company) = company {
            raw.extra.insert("company_name".into(), json!(company));
        }
        Opportunity::from_raw(raw, "test")
    }

    fn config() -> ScoringConfig {
        let mut config = ScoringConfig::default();
        config.max_retries = 1;
        config.call_timeout = Duration::from_secs(2);
        config
    }

    #[test]
    fn roster_uses_company_name_then_title() {
        let partners = vec![
            record("Swarm Autonomy", "", Some("Acme Robotics")),
            record("Solo Project", "", None),
        ];
        assert_eq!(
            partner_roster(&partners),
            "- Company: Acme Robotics, Project: Swarm Autonomy\n- Company: Solo Project, Project: Solo Project"
        );
    }

    #[test]
    fn suggestions_skip_malformed_and_cap_at_three() {
        let obj = json!({"suggested_partners": [
            {"partner_company": "A", "reasoning": "x"},
            {"partner_company": "  "},
            {"partner_company": "B"},
            {"partner_company": "C", "reasoning": "z"},
            {"partner_company": "D", "reasoning": "w"}
        ]});
        let names: Vec<_> = parse_suggestions(obj.as_object().expect("object"))
            .into_iter()
            .map(|s| s.partner_company)
            .collect();
        assert_eq!(names, vec!["A", "B", "C"]);

        let obj = json!({"suggested_partners": "none"});
        assert!(parse_suggestions(obj.as_object().expect("object")).is_empty());
    }

    #[tokio::test]
    async fn pairs_each_relevant_opportunity() {
        let scorer = Arc::new(RosterScorer {
            prompts: Mutex::new(Vec::new()),
        });
        let matchmaker = Matchmaker::new(scorer.clone(), config());
        let log = ProgressLog::new();

        let relevant = vec![
            record("Sensors", "https://x/1", None),
            record("Broken", "https://x/2", None),
            record("Lonely", "https://x/3", None),
        ];
        let partners = vec![record("Swarm", "", Some("Acme Robotics"))];

        let matches = matchmaker.match_all(&relevant, &partners, &log).await;
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].opportunity_url, "https://x/1");
        assert_eq!(matches[0].suggested_partners.len(), 3);
        assert_eq!(matches[0].suggested_partners[0].partner_company, "Acme Robotics");

        let prompts = scorer.prompts.lock().expect("lock");
        assert_eq!(prompts.len(), 3);
        assert!(prompts[0].contains("- Company: Acme Robotics, Project: Swarm"));
        assert!(log.entries().iter().any(|e| e.message.contains("Broken")));
    }

    #[tokio::test]
    async fn empty_inputs_make_no_calls() {
        let scorer = Arc::new(RosterScorer {
            prompts: Mutex::new(Vec::new()),
        });
        let matchmaker = Matchmaker::new(scorer.clone(), config());
        let log = ProgressLog::new();

        let one = vec![record("Sensors", "u", None)];
        assert!(matchmaker.match_all(&one, &[], &log).await.is_empty());
        assert!(matchmaker.match_all(&[], &one, &log).await.is_empty());
        assert!(scorer.prompts.lock().expect("lock").is_empty());
    }

    #[test]
    fn match_serializes_with_output_keys() {
        let row = PartnerMatch {
            opportunity_title: "T".into(),
            opportunity_url: "u".into(),
            suggested_partners: vec![SuggestedPartner {
                partner_company: "A".into(),
                reasoning: "r".into(),
            }],
        };
        let json = serde_json::to_value(&row).expect("serialize");
        assert_eq!(json["DirectOpportunityURL"], "u");
        assert_eq!(json["SuggestedPartners"][0]["partner_company"], "A");
    }
}
