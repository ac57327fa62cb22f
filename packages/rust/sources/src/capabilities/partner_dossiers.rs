//! Partner dossier reader, the multi-phase partnership source.
//!
//! Dossiers are plain-text or Markdown files produced by an upstream
//! research pipeline. Each becomes one record: the project title is the
//! `Title`, the whole text is the `Description`, and the company name is
//! kept in `extra["company_name"]` for matchmaking.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use oppscout_shared::{RawOpportunity, Result, ScoutError, expand_home};
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};

use super::{FetchCapability, FetchPayload, SourceParams, TESTING_MODE_PARAM};

/// Dossiers read when `testing_mode` is set.
const TESTING_LIMIT: usize = 5;
const UNKNOWN_COMPANY: &str = "Unknown Company";

#[derive(Debug, Clone, Deserialize)]
struct DossierParams {
    dossier_dir: String,
    #[serde(default)]
    testing_mode: bool,
}

/// Build a record from one dossier's text.
///
/// `Company Name:` and `Project Title:` lines are matched case-insensitively;
/// the file stem stands in for a missing project title.
pub fn parse_dossier(file_stem: &str, text: &str) -> RawOpportunity {
    let mut company = None;
    let mut project = None;

    for line in text.lines() {
        let trimmed = line.trim();
        let Some((key, value)) = trimmed.split_once(':') else {
            continue;
        };
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        match key.trim().to_ascii_lowercase().as_str() {
            "company name" => company = Some(value.to_string()),
            "project title" => project = Some(value.to_string()),
            _ => {}
        }
    }

    let mut raw = RawOpportunity {
        title: Some(project.unwrap_or_else(|| file_stem.to_string())),
        description: Some(text.trim().to_string()),
        ..Default::default()
    };
    raw.extra.insert(
        "company_name".into(),
        Value::String(company.unwrap_or_else(|| UNKNOWN_COMPANY.to_string())),
    );
    raw
}

fn is_dossier(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("txt") | Some("md")
    )
}

async fn list_dossiers(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| ScoutError::io(dir, e))?;

    let mut files = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| ScoutError::io(dir, e))?
    {
        let path = entry.path();
        if is_dossier(&path) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Reads partner dossiers from a directory.
pub struct PartnerDossiersCapability;

#[async_trait]
impl FetchCapability for PartnerDossiersCapability {
    fn id(&self) -> &'static str {
        "partner_dossiers"
    }

    fn accepted_params(&self) -> &'static [&'static str] {
        &["dossier_dir", TESTING_MODE_PARAM]
    }

    fn validate(&self, params: &SourceParams) -> Result<()> {
        params.parse::<DossierParams>().map(|_| ())
    }

    async fn fetch(&self, params: &SourceParams) -> Result<FetchPayload> {
        let p: DossierParams = params.parse()?;
        let dir = expand_home(&p.dossier_dir);

        let mut files = list_dossiers(&dir).await?;
        if p.testing_mode && files.len() > TESTING_LIMIT {
            info!(total = files.len(), limit = TESTING_LIMIT, "testing mode, limiting dossiers");
            files.truncate(TESTING_LIMIT);
        }

        let mut records = Vec::with_capacity(files.len());
        for path in files {
            match tokio::fs::read_to_string(&path).await {
                Ok(text) => {
                    let stem = path
                        .file_stem()
                        .and_then(|s| s.to_str())
                        .unwrap_or_default();
                    let mut raw = parse_dossier(stem, &text);
                    raw.extra.insert(
                        "dossier_file".into(),
                        Value::String(path.display().to_string()),
                    );
                    records.push(raw);
                }
                Err(e) => warn!(path = %path.display(), error = %e, "could not read dossier"),
            }
        }

        info!(count = records.len(), dir = %dir.display(), "parsed partner dossiers");
        Ok(FetchPayload::Records(records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn params(dir: &Path, testing: bool) -> SourceParams {
        SourceParams::new(
            json!({"dossier_dir": dir.display().to_string(), "testing_mode": testing})
                .as_object()
                .cloned()
                .unwrap_or_default(),
        )
    }

    fn temp_dir_with(files: usize) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("oppscout-dossiers-{}", Uuid::now_v7()));
        std::fs::create_dir_all(&dir).expect("mkdir");
        for i in 0..files {
            std::fs::write(
                dir.join(format!("partner-{i:02}.txt")),
                format!("Company Name: Partner {i}\nProject Title: Project {i}\nSummary text."),
            )
            .expect("write");
        }
        std::fs::write(dir.join("ignore.docx"), "binary").expect("write");
        dir
    }

    #[test]
    fn parses_company_and_title_lines() {
        let raw = parse_dossier(
            "acme",
            "Dossier\n  company name:  Acme Robotics \nProject Title: Swarm Navigation\n",
        );
        assert_eq!(raw.title.as_deref(), Some("Swarm Navigation"));
        assert_eq!(
            raw.extra.get("company_name").and_then(|v| v.as_str()),
            Some("Acme Robotics")
        );
    }

    #[test]
    fn falls_back_to_file_stem_and_unknown_company() {
        let raw = parse_dossier("orphan", "No structured lines here.");
        assert_eq!(raw.title.as_deref(), Some("orphan"));
        assert_eq!(
            raw.extra.get("company_name").and_then(|v| v.as_str()),
            Some(UNKNOWN_COMPANY)
        );
    }

    #[tokio::test]
    async fn reads_fixture_dossiers() {
        let dir = PathBuf::from("../../../fixtures/dossiers");
        let payload = PartnerDossiersCapability
            .fetch(&params(&dir, false))
            .await
            .expect("fetch");
        let FetchPayload::Records(records) = payload else {
            panic!("expected records");
        };
        assert_eq!(records.len(), 2);
        assert_eq!(
            records[0].extra.get("company_name").and_then(|v| v.as_str()),
            Some("Acme Robotics")
        );
    }

    #[tokio::test]
    async fn testing_mode_limits_dossiers() {
        let dir = temp_dir_with(7);

        let FetchPayload::Records(all) = PartnerDossiersCapability
            .fetch(&params(&dir, false))
            .await
            .expect("fetch")
        else {
            panic!("expected records");
        };
        assert_eq!(all.len(), 7);

        let FetchPayload::Records(limited) = PartnerDossiersCapability
            .fetch(&params(&dir, true))
            .await
            .expect("fetch")
        else {
            panic!("expected records");
        };
        assert_eq!(limited.len(), TESTING_LIMIT);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn missing_directory_is_an_error() {
        let dir = std::env::temp_dir().join(format!("oppscout-missing-{}", Uuid::now_v7()));
        assert!(
            PartnerDossiersCapability
                .fetch(&params(&dir, false))
                .await
                .is_err()
        );
    }
}
