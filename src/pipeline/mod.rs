// src/pipeline/mod.rs
// Escalation controller: the per-record state machine and the concurrent
// batch runner around it.
//
// Lookup → PatternMatch → FastAnalysis → Validate1 → {Accept | DeepAnalysis}
// → Validate2 → Finalize, with Aborted as the only other terminal state.
// Callers never see raw backend errors; every record resolves to a
// finalized issue or an abort with a reason code.

use chrono::{Duration, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::analyzer::AnalyzerGateway;
use crate::config::SleuthConfig;
use crate::error::{Result, SleuthError};
use crate::patterns::{PatternLibrary, PatternMatch};
use crate::signature::{self, Signature};
use crate::store::{FeedbackOutcome, Issue, IssueStore};
use crate::types::{AnalysisResult, AnalysisSource, AnalysisStatus, BuildPhase, FailureRecord, Tier};
use crate::validation::{Decision, IssueHistory, ValidationEngine, ValidationFlag};

/// Why a record ended in `Aborted` instead of `Finalize`
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    /// Both tiers (or the only remaining tier) stayed unreachable through
    /// the retry budget
    BackendUnavailable,
    /// The deep tier answered outside its contract and no further tier
    /// exists to recover with
    MalformedDeepResponse,
    BudgetExhausted,
    Cancelled,
    /// Storage or other infrastructure failure
    Internal,
}

/// Terminal result for one record
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Finalized {
        issue: Issue,
        /// Served from the issue store without analyzer cost
        cached: bool,
    },
    Aborted {
        reason: AbortReason,
        /// Best result available when the run stopped, if any
        partial: Option<AnalysisResult>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordReport {
    pub job_name: String,
    pub signature: Signature,
    #[serde(flatten)]
    pub outcome: Outcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub run_id: String,
    pub started_at: chrono::DateTime<Utc>,
    pub finished_at: chrono::DateTime<Utc>,
    pub cost_usd: f64,
    pub reports: Vec<RecordReport>,
}

/// Controller tunables; every threshold here is configuration, not contract
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub staleness: Duration,
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    /// Pattern matches at or above this confidence, with healthy
    /// reliability, short-circuit straight to finalization
    pub shortcircuit_confidence: u8,
    pub signature_window_lines: usize,
    pub worker_count: usize,
    pub deep_call_estimate_usd: f64,
    pub reliability_smoothing: f64,
}

impl From<&SleuthConfig> for PipelineConfig {
    fn from(config: &SleuthConfig) -> Self {
        Self {
            staleness: Duration::hours(config.staleness_hours),
            retry_attempts: config.retry_attempts,
            retry_base_delay_ms: config.retry_base_delay_ms,
            shortcircuit_confidence: config.shortcircuit_confidence,
            signature_window_lines: config.signature_window_lines,
            worker_count: config.worker_count,
            deep_call_estimate_usd: config.deep_call_estimate_usd,
            reliability_smoothing: config.reliability_smoothing,
        }
    }
}

/// Per-record machine states. Explicit so escalation stays a visible
/// control-flow branch instead of nested conditionals.
enum State {
    Lookup,
    PatternMatch,
    FastAnalysis {
        hint: Option<PatternMatch>,
    },
    Validate1 {
        result: AnalysisResult,
        hint: Option<PatternMatch>,
    },
    DeepAnalysis {
        fast: Option<(AnalysisResult, Vec<ValidationFlag>)>,
        hint: Option<PatternMatch>,
    },
    Validate2 {
        result: AnalysisResult,
        hint: Option<PatternMatch>,
    },
    Finalize {
        result: AnalysisResult,
        flags: Vec<ValidationFlag>,
    },
}

pub struct Pipeline {
    store: IssueStore,
    patterns: Arc<PatternLibrary>,
    gateway: AnalyzerGateway,
    validator: ValidationEngine,
    config: PipelineConfig,
    /// Per-signature mutual exclusion: a second worker hitting the same
    /// signature waits for the first and then reuses its cached result
    /// instead of duplicating backend cost.
    inflight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Pipeline {
    pub fn new(
        store: IssueStore,
        patterns: Arc<PatternLibrary>,
        gateway: AnalyzerGateway,
        validator: ValidationEngine,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            patterns,
            gateway,
            validator,
            config,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &IssueStore {
        &self.store
    }

    /// Pull persisted reliability scores into the in-memory library.
    /// Called once at startup.
    pub async fn load_reliability(&self) -> Result<()> {
        let scores = self.store.pattern_reliability().await?;
        self.patterns.load_reliability(&scores);
        Ok(())
    }

    /// Process a batch concurrently, bounded by the configured worker
    /// count. Completion order is unspecified; each record's machine runs
    /// independently.
    pub async fn run_batch(
        &self,
        records: Vec<FailureRecord>,
        cancel: CancellationToken,
    ) -> BatchReport {
        let run_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        info!(run_id, records = records.len(), "starting analysis batch");

        let reports: Vec<RecordReport> = stream::iter(records)
            .map(|record| {
                let cancel = cancel.clone();
                async move {
                    let job_name = record.job_name.clone();
                    let sig = signature::signature(&record, self.config.signature_window_lines);
                    let outcome = match self.process(&record, &sig, &cancel).await {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            warn!(signature = %sig, error = %e, "record aborted on internal error");
                            Outcome::Aborted {
                                reason: AbortReason::Internal,
                                partial: None,
                            }
                        }
                    };
                    RecordReport {
                        job_name,
                        signature: sig,
                        outcome,
                    }
                }
            })
            .buffer_unordered(self.config.worker_count.max(1))
            .collect()
            .await;

        let finished_at = Utc::now();
        let cost_usd = self.gateway.ledger().run_spent_usd();
        info!(run_id, cost_usd, "analysis batch finished");
        BatchReport {
            run_id,
            started_at,
            finished_at,
            cost_usd,
            reports,
        }
    }

    /// Record fix feedback and propagate the reliability update into the
    /// live pattern library.
    pub async fn record_feedback(
        &self,
        signature: &Signature,
        outcome: FeedbackOutcome,
    ) -> Result<()> {
        if let Some((rule_id, reliability)) = self
            .store
            .record_feedback(signature, outcome, self.config.reliability_smoothing)
            .await?
        {
            self.patterns.set_reliability(&rule_id, reliability);
        }
        Ok(())
    }

    /// Drive one record through the state machine.
    async fn process(
        &self,
        record: &FailureRecord,
        sig: &Signature,
        cancel: &CancellationToken,
    ) -> Result<Outcome> {
        let guard = self.signature_guard(sig).await;
        let _inflight = guard.lock().await;

        let mut prior: Option<Issue> = None;
        let mut state = State::Lookup;

        loop {
            if cancel.is_cancelled() {
                return Ok(Outcome::Aborted {
                    reason: AbortReason::Cancelled,
                    partial: None,
                });
            }

            state = match state {
                State::Lookup => {
                    match self.store.lookup(sig).await? {
                        Some(issue) if Utc::now() - issue.analyzed_at <= self.config.staleness => {
                            debug!(signature = %sig, "fresh cache hit");
                            let issue = self
                                .store
                                .touch(sig)
                                .await?
                                .unwrap_or(issue);
                            return Ok(Outcome::Finalized {
                                issue,
                                cached: true,
                            });
                        }
                        stale => {
                            prior = stale;
                            State::PatternMatch
                        }
                    }
                }

                State::PatternMatch => {
                    let scrubbed = signature::scrub(&record.log);
                    match self.patterns.find(&scrubbed) {
                        Some(m)
                            if !m.low_reliability
                                && m.confidence >= self.config.shortcircuit_confidence =>
                        {
                            debug!(rule_id = %m.rule_id, "pattern short-circuit");
                            State::Finalize {
                                result: m.to_result(record),
                                flags: Vec::new(),
                            }
                        }
                        hint => State::FastAnalysis { hint },
                    }
                }

                State::FastAnalysis { hint } => {
                    match self
                        .analyze_with_retries(record, Tier::Fast, hint.as_ref(), cancel)
                        .await
                    {
                        Ok(result) => State::Validate1 { result, hint },
                        Err(SleuthError::BackendUnavailable(msg)) => {
                            // Fast-tier outage is an automatic escalation
                            // trigger, not a failure of the record.
                            warn!(signature = %sig, msg, "fast tier unavailable, escalating");
                            State::DeepAnalysis { fast: None, hint }
                        }
                        Err(SleuthError::MalformedResponse(msg)) => {
                            warn!(signature = %sig, msg, "fast tier malformed, escalating");
                            State::DeepAnalysis { fast: None, hint }
                        }
                        Err(SleuthError::BudgetExceeded(_)) => {
                            let partial = hint.map(|m| m.to_result(record));
                            return self
                                .abort(record, sig, AbortReason::BudgetExhausted, partial)
                                .await;
                        }
                        Err(SleuthError::Cancelled) => {
                            return Ok(Outcome::Aborted {
                                reason: AbortReason::Cancelled,
                                partial: None,
                            });
                        }
                        Err(e) => return Err(e),
                    }
                }

                State::Validate1 { result, hint } => {
                    let history = self.history_for(&prior, hint.as_ref());
                    let verdict = self.validator.validate(&result, record, &history, Tier::Fast);
                    match verdict.decision {
                        Decision::Accept | Decision::AcceptWithFlags => State::Finalize {
                            result,
                            flags: verdict.flags,
                        },
                        Decision::Escalate | Decision::Reject => {
                            if !self
                                .gateway
                                .ledger()
                                .can_afford(self.config.deep_call_estimate_usd)
                            {
                                info!(signature = %sig, "deep tier skipped, budget exhausted");
                                let mut flags = verdict.flags;
                                flags.push(ValidationFlag::UnvalidatedAtDepth);
                                self.store
                                    .upsert(sig, &result, &flags, self.config.staleness)
                                    .await?;
                                return Ok(Outcome::Aborted {
                                    reason: AbortReason::BudgetExhausted,
                                    partial: Some(result),
                                });
                            }
                            State::DeepAnalysis {
                                fast: Some((result, verdict.flags)),
                                hint,
                            }
                        }
                    }
                }

                State::DeepAnalysis { fast, hint } => {
                    match self
                        .analyze_with_retries(record, Tier::Deep, hint.as_ref(), cancel)
                        .await
                    {
                        Ok(result) => State::Validate2 { result, hint },
                        Err(SleuthError::Cancelled) => {
                            return Ok(Outcome::Aborted {
                                reason: AbortReason::Cancelled,
                                partial: fast.map(|(r, _)| r),
                            });
                        }
                        Err(e) => {
                            let reason = match &e {
                                SleuthError::BackendUnavailable(_) => AbortReason::BackendUnavailable,
                                SleuthError::MalformedResponse(_) => AbortReason::MalformedDeepResponse,
                                SleuthError::BudgetExceeded(_) => AbortReason::BudgetExhausted,
                                _ => return Err(e),
                            };
                            warn!(signature = %sig, error = %e, "deep tier failed");
                            match fast {
                                Some((result, mut flags)) => {
                                    flags.push(ValidationFlag::UnvalidatedAtDepth);
                                    self.store
                                        .upsert(sig, &result, &flags, self.config.staleness)
                                        .await?;
                                    return Ok(Outcome::Aborted {
                                        reason,
                                        partial: Some(result),
                                    });
                                }
                                None => return self.abort(record, sig, reason, None).await,
                            }
                        }
                    }
                }

                State::Validate2 { result, hint } => {
                    let history = self.history_for(&prior, hint.as_ref());
                    let verdict = self.validator.validate(&result, record, &history, Tier::Deep);
                    // Deep results are never escalated further; flags ride
                    // along for audit and feedback review.
                    State::Finalize {
                        result,
                        flags: verdict.flags,
                    }
                }

                State::Finalize { result, flags } => {
                    let issue = self
                        .store
                        .upsert(sig, &result, &flags, self.config.staleness)
                        .await?;
                    // Large occurrence counts on one signature can indicate
                    // a false merge; observable, never fatal.
                    if issue.occurrences > 0 && issue.occurrences % 500 == 0 {
                        warn!(signature = %sig, occurrences = issue.occurrences, "occurrence anomaly, possible signature collision");
                    }
                    return Ok(Outcome::Finalized {
                        issue,
                        cached: false,
                    });
                }
            };
        }
    }

    /// Settle an aborting record: persist a genuine partial result so the
    /// store keeps the best available diagnosis, or synthesize the manual-
    /// review fallback so the batch still reports something actionable.
    /// The fallback is never cached.
    async fn abort(
        &self,
        record: &FailureRecord,
        sig: &Signature,
        reason: AbortReason,
        partial: Option<AnalysisResult>,
    ) -> Result<Outcome> {
        let partial = match partial {
            Some(result) => {
                let flags = [ValidationFlag::UnvalidatedAtDepth];
                self.store
                    .upsert(sig, &result, &flags, self.config.staleness)
                    .await?;
                Some(result)
            }
            None if reason == AbortReason::Cancelled => None,
            None => Some(fallback_result(record)),
        };
        Ok(Outcome::Aborted { reason, partial })
    }

    fn history_for(&self, prior: &Option<Issue>, hint: Option<&PatternMatch>) -> IssueHistory {
        IssueHistory {
            pattern_reliability: hint.map(|m| m.reliability),
            prior_occurrences: prior.as_ref().map(|i| i.occurrences as u64).unwrap_or(0),
        }
    }

    /// Bounded exponential backoff around one tier's gateway call.
    /// Only transport-level unavailability is retried; contract violations
    /// and budget refusals surface immediately.
    async fn analyze_with_retries(
        &self,
        record: &FailureRecord,
        tier: Tier,
        hint: Option<&PatternMatch>,
        cancel: &CancellationToken,
    ) -> Result<AnalysisResult> {
        let attempts = self.config.retry_attempts.max(1);
        let mut delay = std::time::Duration::from_millis(self.config.retry_base_delay_ms);

        for attempt in 1..=attempts {
            if cancel.is_cancelled() {
                return Err(SleuthError::Cancelled);
            }
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(SleuthError::Cancelled),
                r = self.gateway.analyze(record, tier, hint) => r,
            };
            match result {
                Ok(result) => return Ok(result),
                Err(SleuthError::BackendUnavailable(msg)) if attempt < attempts => {
                    warn!(%tier, attempt, msg, "backend unavailable, backing off");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => return Err(e),
            }
        }
        unreachable!("retry loop returns on final attempt")
    }

    async fn signature_guard(&self, sig: &Signature) -> Arc<Mutex<()>> {
        let mut map = self.inflight.lock().await;
        map.entry(sig.as_str().to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Last-resort diagnosis when no analysis path produced anything.
fn fallback_result(record: &FailureRecord) -> AnalysisResult {
    AnalysisResult {
        status: AnalysisStatus::Partial,
        primary_error: format!("analysis unavailable for job {}", record.job_name),
        technology: record
            .technology_context
            .iter()
            .next()
            .cloned()
            .unwrap_or_else(|| "unknown".to_string()),
        category: "analysis_failure".to_string(),
        build_phase: record.build_phase_hint.unwrap_or(BuildPhase::Unknown),
        confidence: 3,
        blocking: false,
        suggested_action: "Manual review required; retry analysis once the backends recover"
            .to_string(),
        commands: vec!["gh run list --status failure --limit 5".to_string()],
        source: AnalysisSource::Fallback,
        log_truncated: record.log_truncated,
    }
}
