//! Relevance scoring pipeline.
//!
//! Candidates are split into fixed-size batches. Batches run strictly one
//! after another; the calls inside a batch run concurrently. Each call is
//! retried with exponential backoff, and a whole batch is bounded by a
//! deadline of `call_timeout * batch_size * 2`. Items that cannot be scored
//! are dropped and logged, never fatal.

use std::sync::Arc;
use std::time::Duration;

use oppscout_shared::{LogLevel, Opportunity, ProgressLog, Result, ScoringConfig, ScoutError};
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinSet;
use tracing::{debug, instrument, warn};

use crate::json_repair::{JsonObject, extract_with_strategy};
use crate::llm::ScoringCapability;

/// Keys the scoring reply is expected to carry.
pub const ANALYSIS_FIELDS: [&str; 5] = [
    "relevance_score",
    "justification",
    "related_experience",
    "funding_assessment",
    "suggested_internal_lead",
];

// ---------------------------------------------------------------------------
// Analysis
// ---------------------------------------------------------------------------

/// A validated scoring reply.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Analysis {
    /// Always within `[0, 1]`.
    pub relevance_score: f64,
    pub justification: Option<String>,
    pub related_experience: Option<String>,
    pub funding_assessment: Option<String>,
    pub suggested_internal_lead: Option<String>,
    /// The raw score when it had to be clamped.
    #[serde(skip)]
    pub clamped_from: Option<f64>,
}

fn text_field(obj: &JsonObject, key: &str) -> Option<String> {
    match obj.get(key) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        Some(other) => Some(other.to_string()),
    }
}

fn score_field(obj: &JsonObject) -> f64 {
    let raw = match obj.get("relevance_score") {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    raw.filter(|v| v.is_finite()).unwrap_or(0.0)
}

impl Analysis {
    /// Read the five expected fields; missing ones become `None` (score 0).
    pub fn from_json(obj: &JsonObject) -> Self {
        let raw = score_field(obj);
        let score = raw.clamp(0.0, 1.0);
        Self {
            relevance_score: score,
            justification: text_field(obj, "justification"),
            related_experience: text_field(obj, "related_experience"),
            funding_assessment: text_field(obj, "funding_assessment"),
            suggested_internal_lead: text_field(obj, "suggested_internal_lead"),
            clamped_from: (raw != score).then_some(raw),
        }
    }

    /// Copy the analysis fields onto `opp`.
    pub fn apply_to(&self, opp: &mut Opportunity) {
        opp.relevance_score = Some(self.relevance_score);
        opp.justification = self.justification.clone();
        opp.related_experience = self.related_experience.clone();
        opp.funding_assessment = self.funding_assessment.clone();
        opp.suggested_internal_lead = self.suggested_internal_lead.clone();
    }
}

// ---------------------------------------------------------------------------
// Prompt building
// ---------------------------------------------------------------------------

/// Strip control characters, cap to `max_chars`, and HTML-escape.
pub fn sanitize(text: &str, max_chars: usize) -> String {
    let cleaned: String = text
        .chars()
        .filter(|c| !c.is_control() || matches!(c, '\n' | '\t'))
        .take(max_chars)
        .collect();
    html_escape::encode_text(cleaned.trim()).into_owned()
}

fn cap_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

pub(crate) fn system_prompt(config: &ScoringConfig) -> String {
    format!(
        "You are a specialized business development analyst for {}. \
         You evaluate funding and contract opportunities against the organization's capabilities \
         and answer with a single JSON object and nothing else.",
        config.organization
    )
}

pub(crate) fn user_prompt(opp: &Opportunity, knowledge: &str, config: &ScoringConfig) -> String {
    format!(
        "COMPANY CAPABILITIES:\n---\n{knowledge}\n---\n\n\
         OPPORTUNITY:\n---\nSource: {source}\nTitle: {title}\nClose date: {close}\nDescription: {description}\n---\n\n\
         Analyze the opportunity against our portfolio. Respond with ONLY a valid JSON object with keys \
         \"relevance_score\" (number between 0 and 1), \"justification\", \"related_experience\", \
         \"funding_assessment\", \"suggested_internal_lead\".",
        knowledge = cap_chars(knowledge, config.knowledge_max_chars),
        source = sanitize(&opp.source, 200),
        title = sanitize(&opp.title, config.title_max_chars),
        close = sanitize(&opp.close_date, 100),
        description = sanitize(&opp.description, config.description_max_chars),
    )
}

// ---------------------------------------------------------------------------
// Calls with retry
// ---------------------------------------------------------------------------

/// Retry policy for one logical call.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CallPolicy {
    pub call_timeout: Duration,
    /// Total attempts.
    pub attempts: u32,
    pub backoff_base: Duration,
}

impl From<&ScoringConfig> for CallPolicy {
    fn from(config: &ScoringConfig) -> Self {
        Self {
            call_timeout: config.call_timeout,
            attempts: config.max_retries.max(1),
            backoff_base: config.backoff_base,
        }
    }
}

impl CallPolicy {
    /// Wait before retry number `attempt + 1`: `backoff_base * 2^attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_base.saturating_mul(1u32 << attempt.min(16))
    }
}

/// Ask the scorer and extract a JSON object, retrying on any failure.
pub(crate) async fn call_for_json(
    scorer: &dyn ScoringCapability,
    system: &str,
    user: &str,
    policy: CallPolicy,
) -> Result<JsonObject> {
    let mut last_err = ScoutError::Scoring("no attempt made".into());

    for attempt in 0..policy.attempts {
        match tokio::time::timeout(policy.call_timeout, scorer.complete(system, user)).await {
            Ok(Ok(text)) => match extract_with_strategy(&text) {
                Some((strategy, obj)) => {
                    debug!(?strategy, attempt, "scoring reply parsed");
                    return Ok(obj);
                }
                None => {
                    last_err = ScoutError::Scoring("reply contained no JSON object".into());
                }
            },
            Ok(Err(e)) => last_err = e,
            Err(_) => {
                last_err = ScoutError::Timeout(format!(
                    "scoring call exceeded {}s",
                    policy.call_timeout.as_secs_f64()
                ));
            }
        }

        if attempt + 1 < policy.attempts {
            let delay = policy.backoff(attempt);
            warn!(attempt = attempt + 1, delay_ms = delay.as_millis() as u64, error = %last_err, "scoring call failed, retrying");
            tokio::time::sleep(delay).await;
        }
    }

    Err(last_err)
}

// ---------------------------------------------------------------------------
// Batching
// ---------------------------------------------------------------------------

/// Split into consecutive chunks of `size`; the last may be shorter.
pub fn partition<T>(items: Vec<T>, size: usize) -> Vec<Vec<T>> {
    let size = size.max(1);
    let mut batches = Vec::with_capacity(items.len().div_ceil(size));
    let mut iter = items.into_iter().peekable();
    while iter.peek().is_some() {
        batches.push(iter.by_ref().take(size).collect());
    }
    batches
}

/// Counters for one scoring run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScoringStats {
    pub candidates: usize,
    pub batches: usize,
    /// Items that got a valid analysis, relevant or not.
    pub analyzed: usize,
    pub relevant: usize,
    /// Items abandoned after exhausting retries or by a batch timeout.
    pub dropped: usize,
    pub batch_timeouts: usize,
    pub clamped: usize,
}

#[derive(Debug, Default)]
pub struct ScoringOutcome {
    pub relevant: Vec<Opportunity>,
    pub stats: ScoringStats,
}

/// Batches candidates through a [`ScoringCapability`].
pub struct RelevanceScorer {
    scorer: Arc<dyn ScoringCapability>,
    config: ScoringConfig,
    progress_span: (u8, u8),
}

impl RelevanceScorer {
    pub fn new(scorer: Arc<dyn ScoringCapability>, config: ScoringConfig) -> Self {
        Self {
            scorer,
            config,
            progress_span: (0, 100),
        }
    }

    pub fn with_progress_span(mut self, start: u8, end: u8) -> Self {
        self.progress_span = (start.min(end), end.max(start));
        self
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    fn percent(&self, done: usize, total: usize) -> u8 {
        let (start, end) = self.progress_span;
        if total == 0 {
            return end;
        }
        let pct = usize::from(start) + usize::from(end - start) * done / total;
        u8::try_from(pct).unwrap_or(end)
    }

    /// Score every candidate and keep those at or above the threshold.
    #[instrument(skip_all, fields(candidates = candidates.len(), batch_size = self.config.batch_size))]
    pub async fn score_all(
        &self,
        candidates: Vec<Opportunity>,
        knowledge: &str,
        log: &ProgressLog,
    ) -> ScoringOutcome {
        let mut outcome = ScoringOutcome::default();
        outcome.stats.candidates = candidates.len();
        if candidates.is_empty() {
            log.info("No candidates to analyze");
            return outcome;
        }

        let system: Arc<str> = Arc::from(system_prompt(&self.config));
        let policy = CallPolicy::from(&self.config);
        let batches = partition(candidates, self.config.batch_size);
        let batch_count = batches.len();
        outcome.stats.batches = batch_count;
        let total = outcome.stats.candidates;
        let mut processed = 0usize;

        log.info(format!(
            "Analyzing {total} opportunities in {batch_count} batch(es) of up to {}",
            self.config.batch_size
        ));

        for (index, batch) in batches.into_iter().enumerate() {
            let batch_no = index + 1;
            let batch_len = batch.len();
            self.score_batch(batch, knowledge, &system, policy, batch_no, &mut outcome, log)
                .await;
            processed += batch_len;

            log.log(
                format!(
                    "Batch {batch_no}/{batch_count} done: {} analyzed, {} relevant so far",
                    outcome.stats.analyzed, outcome.stats.relevant
                ),
                LogLevel::Info,
                Some(self.percent(processed, total)),
            );

            if batch_no < batch_count && !self.config.batch_delay.is_zero() {
                tokio::time::sleep(self.config.batch_delay).await;
            }
        }

        log.info(format!(
            "Analysis complete: {} of {} analyzed, {} relevant, {} dropped",
            outcome.stats.analyzed, total, outcome.stats.relevant, outcome.stats.dropped
        ));
        outcome
    }

    #[allow(clippy::too_many_arguments)]
    async fn score_batch(
        &self,
        batch: Vec<Opportunity>,
        knowledge: &str,
        system: &Arc<str>,
        policy: CallPolicy,
        batch_no: usize,
        outcome: &mut ScoringOutcome,
        log: &ProgressLog,
    ) {
        let budget = self.config.batch_timeout();
        let deadline = tokio::time::Instant::now() + budget;
        let mut slots: Vec<Option<Opportunity>> = batch.into_iter().map(Some).collect();
        let mut tasks = JoinSet::new();

        for (slot, opp) in slots.iter().enumerate() {
            let Some(opp) = opp else { continue };
            let user = user_prompt(opp, knowledge, &self.config);
            let scorer = Arc::clone(&self.scorer);
            let system = Arc::clone(system);
            tasks.spawn(async move {
                let result = call_for_json(scorer.as_ref(), &system, &user, policy).await;
                (slot, result)
            });
        }

        loop {
            match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(Ok((slot, result)))) => {
                    let Some(mut opp) = slots.get_mut(slot).and_then(Option::take) else {
                        continue;
                    };
                    match result {
                        Ok(obj) => self.accept(&obj, &mut opp, outcome, log),
                        Err(e) => {
                            outcome.stats.dropped += 1;
                            log.warn(format!(
                                "Dropped '{}' after {} attempt(s): {e}",
                                opp.title, policy.attempts
                            ));
                        }
                    }
                    if opp.relevance_score.is_some_and(|s| s >= self.config.threshold) {
                        outcome.relevant.push(opp);
                    }
                }
                Ok(Some(Err(join_err))) => {
                    outcome.stats.dropped += 1;
                    warn!(batch = batch_no, error = %join_err, "scoring task failed");
                }
                Ok(None) => break,
                Err(_) => {
                    let unresolved = tasks.len();
                    tasks.abort_all();
                    outcome.stats.batch_timeouts += 1;
                    outcome.stats.dropped += unresolved;
                    log.error(format!(
                        "Batch {batch_no} timed out after {}s, abandoning {unresolved} unresolved item(s)",
                        budget.as_secs_f64()
                    ));
                    break;
                }
            }
        }
    }

    fn accept(
        &self,
        obj: &JsonObject,
        opp: &mut Opportunity,
        outcome: &mut ScoringOutcome,
        log: &ProgressLog,
    ) {
        let missing: Vec<&str> = ANALYSIS_FIELDS
            .iter()
            .copied()
            .filter(|k| !obj.contains_key(*k))
            .collect();
        if !missing.is_empty() {
            debug!(title = %opp.title, ?missing, "analysis missing fields, defaulting to null");
        }

        let analysis = Analysis::from_json(obj);
        if let Some(raw) = analysis.clamped_from {
            outcome.stats.clamped += 1;
            log.warn(format!(
                "Relevance score {raw} for '{}' out of range, clamped to {}",
                opp.title, analysis.relevance_score
            ));
        }

        outcome.stats.analyzed += 1;
        if analysis.relevance_score >= self.config.threshold {
            analysis.apply_to(opp);
            outcome.stats.relevant += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use oppscout_shared::{AppConfig, RawOpportunity};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Reply = Box<dyn Fn(&str, usize) -> Result<String> + Send + Sync>;

    /// Answers by calling `reply(user_prompt, call_number_for_that_prompt)`.
    struct ScriptedScorer {
        reply: Reply,
        delay: Duration,
        /// Calls numbered up to this (per prompt) never answer.
        hangs: usize,
        calls: Mutex<HashMap<String, usize>>,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl ScriptedScorer {
        fn new(reply: impl Fn(&str, usize) -> Result<String> + Send + Sync + 'static) -> Self {
            Self {
                reply: Box::new(reply),
                delay: Duration::ZERO,
                hangs: 0,
                calls: Mutex::new(HashMap::new()),
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn hanging_first(mut self, calls: usize) -> Self {
            self.hangs = calls;
            self
        }
    }

    #[async_trait]
    impl ScoringCapability for ScriptedScorer {
        fn model(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, _system: &str, user: &str) -> Result<String> {
            let n = {
                let mut calls = self.calls.lock().expect("lock");
                let entry = calls.entry(user.to_string()).or_insert(0);
                *entry += 1;
                *entry
            };
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            if user.contains("SLOW") || n <= self.hangs {
                tokio::time::sleep(Duration::from_secs(30)).await;
            } else if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            (self.reply)(user, n)
        }
    }

    fn opp(title: &str, url: &str) -> Opportunity {
        Opportunity::from_raw(
            RawOpportunity {
                title: Some(title.into()),
                url: Some(url.into()),
                description: Some(format!("{title} description")),
                ..Default::default()
            },
            "test",
        )
    }

    fn fast_config() -> ScoringConfig {
        let mut config = ScoringConfig::from(&AppConfig::default());
        config.batch_delay = Duration::ZERO;
        config.backoff_base = Duration::from_millis(1);
        config.call_timeout = Duration::from_secs(2);
        config
    }

    fn score_reply(score: f64) -> String {
        format!(
            r#"{{"relevance_score": {score}, "justification": "fits", "related_experience": "prior work", "funding_assessment": "$1M", "suggested_internal_lead": "J. Doe"}}"#
        )
    }

    #[test]
    fn partition_twelve_by_five() {
        let sizes: Vec<usize> = partition((0..12).collect::<Vec<_>>(), 5)
            .iter()
            .map(Vec::len)
            .collect();
        assert_eq!(sizes, vec![5, 5, 2]);
        assert!(partition(Vec::<u8>::new(), 5).is_empty());
    }

    #[test]
    fn analysis_clamps_and_defaults() {
        let obj = json!({"relevance_score": 1.4, "justification": "great"});
        let analysis = Analysis::from_json(obj.as_object().expect("object"));
        assert_eq!(analysis.relevance_score, 1.0);
        assert_eq!(analysis.clamped_from, Some(1.4));
        assert_eq!(analysis.justification.as_deref(), Some("great"));
        assert!(analysis.funding_assessment.is_none());

        let obj = json!({"relevance_score": "0.75"});
        let analysis = Analysis::from_json(obj.as_object().expect("object"));
        assert_eq!(analysis.relevance_score, 0.75);
        assert!(analysis.clamped_from.is_none());

        let obj = json!({"relevance_score": -3});
        assert_eq!(Analysis::from_json(obj.as_object().expect("object")).relevance_score, 0.0);
    }

    #[test]
    fn sanitize_strips_controls_caps_and_escapes() {
        let out = sanitize("<b>Bold\u{0007}</b> & more", 10);
        assert_eq!(out, "&lt;b&gt;Bold&lt;/b");
        assert_eq!(sanitize("line1\nline2", 100), "line1\nline2");
    }

    #[test]
    fn backoff_doubles_each_attempt() {
        let policy = CallPolicy {
            call_timeout: Duration::from_secs(1),
            attempts: 3,
            backoff_base: Duration::from_secs(1),
        };
        assert_eq!(policy.backoff(0), Duration::from_secs(1));
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(2), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn keeps_items_at_or_above_threshold() {
        let scorer = ScriptedScorer::new(|user, _| {
            Ok(if user.contains("Title: T1") {
                score_reply(0.9)
            } else {
                score_reply(0.5)
            })
        });
        let relevance = RelevanceScorer::new(Arc::new(scorer), fast_config());
        let log = ProgressLog::new();

        let outcome = relevance
            .score_all(vec![opp("T1", "a"), opp("T2", "b")], "We build sensors.", &log)
            .await;

        assert_eq!(outcome.relevant.len(), 1);
        let kept = &outcome.relevant[0];
        assert_eq!(kept.url, "a");
        assert_eq!(kept.relevance_score, Some(0.9));
        assert_eq!(kept.suggested_internal_lead.as_deref(), Some("J. Doe"));
        assert_eq!(outcome.stats.analyzed, 2);
        assert_eq!(outcome.stats.relevant, 1);
    }

    #[tokio::test]
    async fn out_of_range_score_is_clamped_and_logged() {
        let scorer = ScriptedScorer::new(|_, _| Ok(score_reply(1.4)));
        let relevance = RelevanceScorer::new(Arc::new(scorer), fast_config());
        let log = ProgressLog::new();

        let outcome = relevance.score_all(vec![opp("Hot", "h")], "", &log).await;
        assert_eq!(outcome.relevant[0].relevance_score, Some(1.0));
        assert_eq!(outcome.stats.clamped, 1);
        assert!(log.entries().iter().any(|e| e.message.contains("clamped")));
    }

    #[tokio::test]
    async fn retries_until_reply_parses() {
        let scorer = Arc::new(ScriptedScorer::new(|_, n| {
            if n < 3 {
                Ok("Let me think about this...".into())
            } else {
                Ok(r#"{"relevance_score": 0.8, "justification": "ok",}"#.into())
            }
        }));
        let relevance = RelevanceScorer::new(scorer.clone(), fast_config());
        let log = ProgressLog::new();

        let outcome = relevance.score_all(vec![opp("Retry", "r")], "", &log).await;
        assert_eq!(outcome.relevant.len(), 1);
        assert_eq!(outcome.stats.dropped, 0);
        let calls: usize = scorer.calls.lock().expect("lock").values().sum();
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn exhausted_retries_drop_the_item() {
        let scorer = Arc::new(ScriptedScorer::new(|_, _| {
            Err(ScoutError::Network("connection reset".into()))
        }));
        let relevance = RelevanceScorer::new(scorer.clone(), fast_config());
        let log = ProgressLog::new();

        let outcome = relevance
            .score_all(vec![opp("Doomed", "d"), opp("Also", "e")], "", &log)
            .await;
        assert!(outcome.relevant.is_empty());
        assert_eq!(outcome.stats.dropped, 2);
        assert_eq!(outcome.stats.analyzed, 0);
        let calls: usize = scorer.calls.lock().expect("lock").values().sum();
        assert_eq!(calls, 6);
    }

    #[tokio::test]
    async fn batch_timeout_abandons_batch_and_moves_on() {
        let scorer = ScriptedScorer::new(|_, _| Ok(score_reply(0.95)));
        let mut config = fast_config();
        config.batch_size = 1;
        // One-item batch deadline is 100ms; retry backoff keeps the slow
        // item alive well past it.
        config.call_timeout = Duration::from_millis(50);
        config.max_retries = 5;
        config.backoff_base = Duration::from_millis(200);
        let relevance = RelevanceScorer::new(Arc::new(scorer), config);
        let log = ProgressLog::new();

        let outcome = relevance
            .score_all(vec![opp("SLOW one", "s"), opp("Quick", "q")], "", &log)
            .await;

        assert_eq!(outcome.stats.batch_timeouts, 1);
        assert_eq!(outcome.stats.dropped, 1);
        assert_eq!(outcome.relevant.len(), 1);
        assert_eq!(outcome.relevant[0].url, "q");
        assert!(log.entries().iter().any(|e| e.message.contains("timed out")));
    }

    #[tokio::test]
    async fn short_final_batch_keeps_full_retry_budget() {
        let scorer = Arc::new(ScriptedScorer::new(|_, _| Ok(score_reply(0.9))).hanging_first(2));
        let mut config = fast_config();
        config.batch_size = 5;
        config.max_retries = 3;
        // Deadline is 100ms * 5 * 2 = 1s; the third attempt lands near 200ms.
        config.call_timeout = Duration::from_millis(100);
        let relevance = RelevanceScorer::new(scorer.clone(), config);
        let log = ProgressLog::new();

        let outcome = relevance.score_all(vec![opp("Lonely", "l")], "", &log).await;

        assert_eq!(outcome.stats.batch_timeouts, 0);
        assert_eq!(outcome.stats.dropped, 0);
        assert_eq!(outcome.stats.analyzed, 1);
        assert_eq!(outcome.relevant.len(), 1);
        let calls: usize = scorer.calls.lock().expect("lock").values().sum();
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn calls_within_batch_are_concurrent_but_bounded() {
        let scorer = Arc::new(
            ScriptedScorer::new(|_, _| Ok(score_reply(0.1))).with_delay(Duration::from_millis(40)),
        );
        let mut config = fast_config();
        config.batch_size = 2;
        let relevance = RelevanceScorer::new(scorer.clone(), config);
        let log = ProgressLog::new();

        let candidates: Vec<_> = (0..5).map(|i| opp(&format!("Item {i}"), &format!("u{i}"))).collect();
        let outcome = relevance.score_all(candidates, "", &log).await;

        assert_eq!(outcome.stats.batches, 3);
        assert_eq!(outcome.stats.analyzed, 5);
        assert_eq!(scorer.peak.load(Ordering::SeqCst), 2);
    }
}
