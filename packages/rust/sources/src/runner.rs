//! Scraper task runner.
//!
//! Every capability call runs in its own tokio task, so a panic or error
//! inside one source is caught at the task boundary and reported as that
//! source's failure. The reserved partnership source runs first and alone;
//! the rest run under a semaphore of `max_workers` permits. A task that
//! exceeds its timeout is aborted and marked failed while its siblings
//! keep running.

use std::sync::Arc;
use std::time::{Duration, Instant};

use oppscout_shared::{
    LogLevel, Opportunity, ProgressLog, RawOpportunity, Result, RunnerConfig, ScoutError,
};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, instrument, warn};

use crate::capabilities::FetchPayload;
use crate::registry::SourceDescriptor;

/// Per-source timing, kept for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct SourceTiming {
    pub name: String,
    pub elapsed_ms: u64,
    pub records: usize,
    pub ok: bool,
}

/// Result of one capability invocation.
#[derive(Debug)]
pub struct TaskReport {
    pub name: String,
    pub result: Result<Vec<Opportunity>>,
    pub elapsed: Duration,
}

impl TaskReport {
    fn timing(&self) -> SourceTiming {
        SourceTiming {
            name: self.name.clone(),
            elapsed_ms: u64::try_from(self.elapsed.as_millis()).unwrap_or(u64::MAX),
            records: self.result.as_ref().map(Vec::len).unwrap_or(0),
            ok: self.result.is_ok(),
        }
    }
}

/// Aggregate of a whole scraping phase.
#[derive(Debug, Default)]
pub struct RunAllOutcome {
    /// Records from the partnership source, kept apart from candidates.
    pub partnership: Vec<Opportunity>,
    /// Records from every other source, in completion order.
    pub candidates: Vec<Opportunity>,
    /// Names of sources that errored, panicked, or timed out.
    pub failed: Vec<String>,
    pub timings: Vec<SourceTiming>,
}

/// A capability call that has finished but not yet been normalised.
struct Fetched {
    name: String,
    payload: Result<FetchPayload>,
    elapsed: Duration,
}

/// Run the capability in its own task, bounded by `timeout`.
async fn execute(desc: SourceDescriptor, timeout: Duration) -> Fetched {
    let started = Instant::now();
    let capability = Arc::clone(&desc.capability);
    let params = desc.params.clone();

    let mut handle = tokio::spawn(async move { capability.fetch(&params).await });

    let payload = match tokio::time::timeout(timeout, &mut handle).await {
        Ok(Ok(Ok(payload))) => Ok(payload),
        Ok(Ok(Err(e))) => Err(ScoutError::source(&desc.name, e.to_string())),
        Ok(Err(join_err)) if join_err.is_panic() => {
            Err(ScoutError::source(&desc.name, "capability panicked"))
        }
        Ok(Err(join_err)) => Err(ScoutError::source(&desc.name, join_err.to_string())),
        Err(_) => {
            // Abandon: the task is aborted at its next await point and never joined.
            handle.abort();
            Err(ScoutError::Timeout(format!(
                "source '{}' exceeded {}s",
                desc.name,
                timeout.as_secs_f64()
            )))
        }
    };

    Fetched {
        name: desc.name,
        payload,
        elapsed: started.elapsed(),
    }
}

/// Turn a payload into records stamped with `source`.
///
/// A JSON payload that is not an array becomes an empty list; array
/// elements that are not objects are skipped. Both cases are logged.
pub fn normalize_payload(payload: FetchPayload, source: &str, log: &ProgressLog) -> Vec<Opportunity> {
    match payload {
        FetchPayload::Records(records) => records
            .into_iter()
            .map(|raw| Opportunity::from_raw(raw, source))
            .collect(),
        FetchPayload::Json(Value::Array(items)) => {
            let mut out = Vec::with_capacity(items.len());
            let mut skipped = 0usize;
            for item in items {
                if !item.is_object() {
                    skipped += 1;
                    continue;
                }
                match serde_json::from_value::<RawOpportunity>(item) {
                    Ok(raw) => out.push(Opportunity::from_raw(raw, source)),
                    Err(e) => {
                        debug!(source, error = %e, "unreadable record");
                        skipped += 1;
                    }
                }
            }
            if skipped > 0 {
                log.warn(format!("Source '{source}': skipped {skipped} malformed record(s)"));
            }
            out
        }
        FetchPayload::Json(other) => {
            log.warn(format!(
                "Source '{source}' returned {} instead of a list, ignoring",
                json_kind(&other)
            ));
            Vec::new()
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
    }
}

fn finish(fetched: Fetched, log: &ProgressLog) -> TaskReport {
    let result = fetched
        .payload
        .map(|payload| normalize_payload(payload, &fetched.name, log));
    TaskReport {
        name: fetched.name,
        result,
        elapsed: fetched.elapsed,
    }
}

/// Run one source with isolation and a timeout. Never panics or propagates.
pub async fn run_one(desc: &SourceDescriptor, timeout: Duration, log: &ProgressLog) -> TaskReport {
    let fetched = execute(desc.clone(), timeout).await;
    finish(fetched, log)
}

/// Runs a set of sources under the worker and timeout limits.
#[derive(Debug, Clone)]
pub struct TaskRunner {
    config: RunnerConfig,
    progress_span: (u8, u8),
}

impl TaskRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self {
            config,
            progress_span: (0, 100),
        }
    }

    /// Map completion onto `[start, end]` of the overall progress bar.
    pub fn with_progress_span(mut self, start: u8, end: u8) -> Self {
        self.progress_span = (start.min(end), end.max(start));
        self
    }

    fn percent(&self, done: usize, total: usize) -> u8 {
        let (start, end) = self.progress_span;
        if total == 0 {
            return end;
        }
        let span = usize::from(end - start);
        let pct = usize::from(start) + span * done / total;
        u8::try_from(pct).unwrap_or(end)
    }

    fn record(report: &TaskReport, outcome: &mut RunAllOutcome, log: &ProgressLog) {
        outcome.timings.push(report.timing());
        match &report.result {
            Ok(records) => debug!(
                source = %report.name,
                count = records.len(),
                elapsed_ms = report.elapsed.as_millis() as u64,
                "source finished"
            ),
            Err(e) => {
                log.error(format!("Source '{}' failed: {e}", report.name));
                outcome.failed.push(report.name.clone());
            }
        }
    }

    /// Run every enabled descriptor and collect all outcomes.
    ///
    /// Never returns early: each source's failure is isolated to its entry
    /// in `failed`.
    pub async fn run_all(&self, descriptors: &[SourceDescriptor], log: &ProgressLog) -> RunAllOutcome {
        let outcome = self.run_partnership(descriptors, log).await;
        self.run_scrapers(descriptors, outcome, log).await
    }

    /// Run the reserved partnership source alone, if it is enabled.
    #[instrument(skip_all, fields(source = %self.config.partnership_source))]
    pub async fn run_partnership(
        &self,
        descriptors: &[SourceDescriptor],
        log: &ProgressLog,
    ) -> RunAllOutcome {
        let mut outcome = RunAllOutcome::default();
        let Some(desc) = descriptors
            .iter()
            .find(|d| d.enabled && d.name == self.config.partnership_source)
        else {
            return outcome;
        };

        log.info(format!("Running partnership source '{}'", desc.name));
        let report = run_one(desc, self.config.task_timeout, log).await;
        Self::record(&report, &mut outcome, log);
        if let Ok(records) = report.result {
            log.info(format!(
                "Partnership source produced {} record(s)",
                records.len()
            ));
            outcome.partnership = records;
        }
        outcome
    }

    /// Run every other enabled descriptor concurrently, adding to `outcome`.
    #[instrument(skip_all, fields(sources = descriptors.len(), max_workers = self.config.max_workers))]
    pub async fn run_scrapers(
        &self,
        descriptors: &[SourceDescriptor],
        mut outcome: RunAllOutcome,
        log: &ProgressLog,
    ) -> RunAllOutcome {
        let timeout = self.config.task_timeout;
        let rest: Vec<&SourceDescriptor> = descriptors
            .iter()
            .filter(|d| d.enabled && d.name != self.config.partnership_source)
            .collect();

        let total = rest.len();
        if total == 0 {
            return outcome;
        }
        log.log(
            format!("Starting {total} scraper(s) with up to {} workers", self.config.max_workers),
            LogLevel::Info,
            Some(self.percent(0, total)),
        );

        let semaphore = Arc::new(Semaphore::new(self.config.max_workers.max(1)));
        let mut tasks = JoinSet::new();
        let mut pending: Vec<String> = Vec::with_capacity(total);

        for desc in rest {
            let desc = desc.clone();
            let sem = Arc::clone(&semaphore);
            pending.push(desc.name.clone());
            tasks.spawn(async move {
                let Ok(_permit) = sem.acquire_owned().await else {
                    let payload = Err(ScoutError::source(&desc.name, "worker pool closed"));
                    return Fetched {
                        name: desc.name,
                        payload,
                        elapsed: Duration::ZERO,
                    };
                };
                execute(desc, timeout).await
            });
        }

        let mut done = 0usize;
        while let Some(joined) = tasks.join_next().await {
            done += 1;
            match joined {
                Ok(fetched) => {
                    if let Some(pos) = pending.iter().position(|n| *n == fetched.name) {
                        pending.swap_remove(pos);
                    }
                    let report = finish(fetched, log);
                    Self::record(&report, &mut outcome, log);
                    if let Ok(records) = report.result {
                        outcome.candidates.extend(records);
                    }
                }
                Err(join_err) => {
                    warn!(error = %join_err, "scraper task did not complete");
                }
            }
            log.log(
                format!("{done} of {total} scrapers completed"),
                LogLevel::Info,
                Some(self.percent(done, total)),
            );
        }

        // Anything still pending lost its task before reporting.
        for name in pending {
            log.error(format!("Source '{name}' failed: task aborted"));
            outcome.failed.push(name);
        }

        log.info(format!(
            "Scraping finished: {} candidate(s), {} failed source(s)",
            outcome.candidates.len(),
            outcome.failed.len()
        ));
        outcome
    }
}
