//! End-to-end run: validate → scrape → score → persist → matchmake.
//!
//! Only the validation stage can fail the run. Every later stage degrades:
//! failed sources shrink the candidate list, failed scoring calls shrink the
//! relevant set, store errors leave the ledger stale. The caller always gets
//! a [`PipelineOutput`] plus whatever was appended to its [`ProgressLog`].

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use oppscout_shared::{
    AppConfig, Opportunity, ProgressLog, Result, RunId, RunnerConfig, ScoringConfig, ScoutError,
    expand_home,
};
use oppscout_sources::{CapabilityRegistry, SourceRegistry, SourceTiming, TaskRunner};
use oppscout_storage::DedupStore;
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::llm::ScoringCapability;
use crate::matchmaking::{Matchmaker, PartnerMatch};
use crate::scoring::RelevanceScorer;

/// Orchestrator states, in order. `Failed` is only reachable from `Validating`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PipelineStage {
    Validating,
    RunPartnershipSource,
    ScrapeParallel,
    ScoreRelevance,
    Persist,
    Completed,
    Failed,
}

impl std::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Validating => "validating",
            Self::RunPartnershipSource => "partnership source",
            Self::ScrapeParallel => "scraping",
            Self::ScoreRelevance => "scoring",
            Self::Persist => "persisting",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Everything a run needs besides its collaborators.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub knowledge_file: PathBuf,
    pub sources_file: PathBuf,
    pub database_path: PathBuf,
    pub runner: RunnerConfig,
    pub scoring: ScoringConfig,
    /// Candidates scored in testing mode.
    pub testing_limit: usize,
    pub retention_days: u32,
    pub sweep_on_run: bool,
    pub matchmaking: bool,
}

impl From<&AppConfig> for PipelineConfig {
    fn from(config: &AppConfig) -> Self {
        let p = &config.pipeline;
        Self {
            knowledge_file: expand_home(&p.knowledge_file),
            sources_file: expand_home(&p.sources_file),
            database_path: expand_home(&p.database_path),
            runner: RunnerConfig::from(config),
            scoring: ScoringConfig::from(config),
            testing_limit: p.testing_limit.max(1),
            retention_days: p.retention_days,
            sweep_on_run: p.sweep_on_run,
            matchmaking: p.matchmaking,
        }
    }
}

/// Counters reported alongside the results.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineStats {
    /// Records returned by non-partnership sources.
    pub candidates: usize,
    /// Candidates actually sent for scoring (fewer in testing mode).
    pub scored: usize,
    pub analyzed: usize,
    pub relevant: usize,
    pub dropped: usize,
    pub batch_timeouts: usize,
    pub new_records: usize,
    pub persisted: usize,
    pub persist_failures: usize,
    /// Rows removed by the retention sweep, when it ran and succeeded.
    pub swept: Option<u64>,
    pub elapsed_seconds: f64,
}

/// Final result of [`Pipeline::run`].
#[derive(Debug, Serialize)]
pub struct PipelineOutput {
    pub run_id: RunId,
    pub relevant: Vec<Opportunity>,
    pub partnership: Vec<Opportunity>,
    pub matchmaking: Vec<PartnerMatch>,
    pub failed_sources: Vec<String>,
    pub timings: Vec<SourceTiming>,
    pub stats: PipelineStats,
}

/// Inputs that passed validation.
struct Validated {
    knowledge: String,
    registry: SourceRegistry,
    store: DedupStore,
}

/// Read the capability profile; missing or blank is a configuration error.
pub fn load_knowledge(path: &Path) -> Result<String> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        ScoutError::config(format!("cannot read knowledge file {}: {e}", path.display()))
    })?;
    if text.trim().is_empty() {
        return Err(ScoutError::config(format!(
            "knowledge file {} is empty",
            path.display()
        )));
    }
    Ok(text)
}

/// The pipeline orchestrator.
pub struct Pipeline {
    config: PipelineConfig,
    capabilities: CapabilityRegistry,
    scorer: Arc<dyn ScoringCapability>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        capabilities: CapabilityRegistry,
        scorer: Arc<dyn ScoringCapability>,
    ) -> Self {
        Self {
            config,
            capabilities,
            scorer,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn enter(&self, stage: PipelineStage, log: &ProgressLog, percent: u8) {
        info!(%stage, "pipeline stage");
        log.progress(format!("Stage: {stage}"), percent);
    }

    async fn validate(&self, log: &ProgressLog) -> Result<Validated> {
        let knowledge = load_knowledge(&self.config.knowledge_file)?;
        log.info(format!(
            "Loaded knowledge context ({} chars)",
            knowledge.chars().count()
        ));

        let registry = SourceRegistry::load_config(
            &self.config.sources_file,
            &self.capabilities,
            &self.config.runner,
            log,
        )?;
        if registry.enabled().next().is_none() {
            return Err(ScoutError::config(format!(
                "no valid enabled sources in {}",
                self.config.sources_file.display()
            )));
        }

        let store = DedupStore::open(&self.config.database_path).await?;

        Ok(Validated {
            knowledge,
            registry,
            store,
        })
    }

    /// Run every stage once.
    ///
    /// Returns `Err` only when validation fails.
    #[instrument(skip_all, fields(sources = %self.config.sources_file.display()))]
    pub async fn run(&self, log: &ProgressLog) -> Result<PipelineOutput> {
        let started = Instant::now();
        let run_id = RunId::new();
        info!(%run_id, "starting pipeline run");

        self.enter(PipelineStage::Validating, log, 0);
        let Validated {
            knowledge,
            registry,
            store,
        } = match self.validate(log).await {
            Ok(v) => v,
            Err(e) => {
                self.enter(PipelineStage::Failed, log, 100);
                log.error(format!("Pipeline aborted: {e}"));
                return Err(e);
            }
        };

        // One bulk read, before any scraping.
        let seen: HashSet<String> = match store.try_load_seen_urls().await {
            Ok(urls) => urls,
            Err(e) => {
                log.warn(format!("Dedup ledger unreadable, treating all results as new: {e}"));
                HashSet::new()
            }
        };

        let runner = TaskRunner::new(self.config.runner.clone()).with_progress_span(10, 50);
        if registry
            .get(&self.config.runner.partnership_source)
            .is_some_and(|d| d.enabled)
        {
            self.enter(PipelineStage::RunPartnershipSource, log, 5);
        }
        let partnership = runner.run_partnership(registry.descriptors(), log).await;

        self.enter(PipelineStage::ScrapeParallel, log, 10);
        let scraped = runner
            .run_scrapers(registry.descriptors(), partnership, log)
            .await;
        if !scraped.failed.is_empty() {
            log.warn(format!(
                "{} source(s) failed: {}",
                scraped.failed.len(),
                scraped.failed.join(", ")
            ));
        }

        let mut stats = PipelineStats {
            candidates: scraped.candidates.len(),
            ..Default::default()
        };

        let mut candidates = scraped.candidates;
        if self.config.runner.testing_mode && candidates.len() > self.config.testing_limit {
            let skipped = candidates.len() - self.config.testing_limit;
            candidates.truncate(self.config.testing_limit);
            log.warn(format!(
                "Testing mode: scoring {} candidates, skipping {skipped}",
                candidates.len()
            ));
        }
        stats.scored = candidates.len();

        self.enter(PipelineStage::ScoreRelevance, log, 50);
        let scoring = RelevanceScorer::new(Arc::clone(&self.scorer), self.config.scoring.clone())
            .with_progress_span(50, 85)
            .score_all(candidates, &knowledge, log)
            .await;
        stats.analyzed = scoring.stats.analyzed;
        stats.relevant = scoring.stats.relevant;
        stats.dropped = scoring.stats.dropped;
        stats.batch_timeouts = scoring.stats.batch_timeouts;

        let mut relevant = scoring.relevant;
        for opp in &mut relevant {
            opp.is_new = !opp.has_identifier() || !seen.contains(&opp.url);
        }
        stats.new_records = relevant.iter().filter(|o| o.is_new).count();

        self.enter(PipelineStage::Persist, log, 85);
        self.persist(&store, &relevant, &mut stats, log).await;

        let matchmaking = if self.config.matchmaking {
            Matchmaker::new(Arc::clone(&self.scorer), self.config.scoring.clone())
                .match_all(&relevant, &scraped.partnership, log)
                .await
        } else {
            Vec::new()
        };

        stats.elapsed_seconds = started.elapsed().as_secs_f64();
        self.enter(PipelineStage::Completed, log, 100);
        log.progress(
            format!(
                "Pipeline complete in {:.1}s: {} relevant ({} new), {} partnership record(s), {} failed source(s)",
                stats.elapsed_seconds,
                relevant.len(),
                stats.new_records,
                scraped.partnership.len(),
                scraped.failed.len()
            ),
            100,
        );

        Ok(PipelineOutput {
            run_id,
            relevant,
            partnership: scraped.partnership,
            matchmaking,
            failed_sources: scraped.failed,
            timings: scraped.timings,
            stats,
        })
    }

    /// One bulk write after scoring, then the optional retention sweep.
    async fn persist(
        &self,
        store: &DedupStore,
        relevant: &[Opportunity],
        stats: &mut PipelineStats,
        log: &ProgressLog,
    ) {
        let written = store.upsert_new(relevant).await;
        let refreshed = store.refresh_resighted(relevant).await;
        stats.persisted = written.written;
        stats.persist_failures = written.failed + refreshed.failed;

        if stats.persist_failures > 0 {
            log.warn(format!(
                "{} dedup ledger write(s) failed; they will look new next run",
                stats.persist_failures
            ));
        }
        log.info(format!(
            "Recorded {} new and refreshed {} known opportunities",
            written.written, refreshed.written
        ));

        if self.config.sweep_on_run {
            match store.cleanup(self.config.retention_days).await {
                Ok(deleted) => {
                    stats.swept = Some(deleted);
                    if deleted > 0 {
                        log.info(format!(
                            "Removed {deleted} ledger entries older than {} days",
                            self.config.retention_days
                        ));
                    }
                }
                Err(e) => {
                    warn!(error = %e, "retention sweep failed");
                    log.warn(format!("Retention sweep failed: {e}"));
                }
            }
        }
    }
}
