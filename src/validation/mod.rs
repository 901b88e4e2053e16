// src/validation/mod.rs
// Quantitative trust rules applied to candidate results before acceptance

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

use crate::types::{AnalysisResult, BuildPhase, FailureRecord, Tier};

/// A named reason a result is judged untrustworthy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationFlag {
    LowConfidence,
    SuspiciousPerfection,
    TechnologyMismatch,
    PhaseMismatch,
    GenericSolution,
    ComplexityUnderestimate,
    HistoricalUnreliability,
    /// Escalation was warranted but could not run (budget or outage);
    /// audit marker attached by the controller, never by the rules here.
    UnvalidatedAtDepth,
}

impl ValidationFlag {
    /// Whether this flag alone forces escalation. Suspicious perfection is
    /// verify-only; the depth marker is pure audit trail.
    pub fn escalates(&self) -> bool {
        !matches!(
            self,
            ValidationFlag::SuspiciousPerfection | ValidationFlag::UnvalidatedAtDepth
        )
    }
}

impl fmt::Display for ValidationFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ValidationFlag::LowConfidence => "low_confidence",
            ValidationFlag::SuspiciousPerfection => "suspicious_perfection",
            ValidationFlag::TechnologyMismatch => "technology_mismatch",
            ValidationFlag::PhaseMismatch => "phase_mismatch",
            ValidationFlag::GenericSolution => "generic_solution",
            ValidationFlag::ComplexityUnderestimate => "complexity_underestimate",
            ValidationFlag::HistoricalUnreliability => "historical_unreliability",
            ValidationFlag::UnvalidatedAtDepth => "unvalidated_at_depth",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Accept,
    /// Escalate-worthy flags present but no further tier exists; kept for
    /// audit and feedback-driven reliability updates.
    AcceptWithFlags,
    Escalate,
    /// Reserved for contract-violating results; the rule table never
    /// produces it (the gateway rejects malformed output upstream).
    Reject,
}

/// Derived, ephemeral verdict; folded into the stored issue's audit trail
#[derive(Debug, Clone)]
pub struct ValidationVerdict {
    pub decision: Decision,
    pub flags: Vec<ValidationFlag>,
}

/// Per-signature history supplied by the issue store
#[derive(Debug, Clone, Default)]
pub struct IssueHistory {
    /// Rolling reliability of the pattern that produced the result, when
    /// a pattern was involved
    pub pattern_reliability: Option<f64>,
    pub prior_occurrences: u64,
}

#[derive(Debug, Clone)]
pub struct ValidationConfig {
    /// Below this, a result cannot be accepted from the fast tier
    pub min_confidence: u8,
    /// Confidence claimed while the log shows more distinct error markers
    /// than this is suspicious
    pub complexity_marker_threshold: usize,
    pub complexity_confidence: u8,
    pub reliability_floor: f64,
    /// Non-actionable phrases that disqualify a suggested fix
    pub generic_phrases: Vec<String>,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            min_confidence: 7,
            complexity_marker_threshold: 3,
            complexity_confidence: 8,
            reliability_floor: 0.8,
            generic_phrases: vec![
                "check logs".to_string(),
                "check the logs".to_string(),
                "manual review".to_string(),
                "manual analysis needed".to_string(),
                "investigate".to_string(),
                "debug the issue".to_string(),
                "review individual job logs".to_string(),
            ],
        }
    }
}

/// Markers of failures that happen before the test phase. A "test" verdict
/// over a log carrying one of these is inconsistent.
const EARLIER_PHASE_MARKERS: &[&str] = &[
    "compilation error",
    "cannot find symbol",
    "package does not exist",
    "could not resolve dependencies",
    "failed to collect dependencies",
    "non-resolvable parent pom",
    "invalid target release",
];

/// Distinct error markers counted for the complexity rule
const COMPLEXITY_MARKERS: &[&str] = &[
    "error",
    "failed",
    "fatal:",
    "exception",
    "traceback",
    "cannot find symbol",
    "outofmemoryerror",
    "timed out",
    "exit code 1",
    "not found",
];

pub struct ValidationEngine {
    config: ValidationConfig,
}

impl ValidationEngine {
    pub fn new(config: ValidationConfig) -> Self {
        Self { config }
    }

    /// Deterministic, side-effect-free scoring of a candidate result.
    /// Rules run independently so every applicable flag is surfaced for
    /// audit, not just the first.
    pub fn validate(
        &self,
        result: &AnalysisResult,
        record: &FailureRecord,
        history: &IssueHistory,
        tier: Tier,
    ) -> ValidationVerdict {
        let mut flags = Vec::new();

        if result.confidence < self.config.min_confidence {
            flags.push(ValidationFlag::LowConfidence);
        }
        if result.confidence == 10 {
            flags.push(ValidationFlag::SuspiciousPerfection);
        }
        if self.technology_mismatch(result, record) {
            flags.push(ValidationFlag::TechnologyMismatch);
        }
        if self.phase_mismatch(result, record) {
            flags.push(ValidationFlag::PhaseMismatch);
        }
        if self.generic_solution(result) {
            flags.push(ValidationFlag::GenericSolution);
        }
        if self.complexity_underestimate(result, record) {
            flags.push(ValidationFlag::ComplexityUnderestimate);
        }
        if let Some(reliability) = history.pattern_reliability {
            if reliability < self.config.reliability_floor {
                flags.push(ValidationFlag::HistoricalUnreliability);
            }
        }

        let wants_escalation = flags.iter().any(|f| f.escalates());
        let decision = match (wants_escalation, tier) {
            (false, _) => Decision::Accept,
            (true, Tier::Fast) => Decision::Escalate,
            // No third tier exists; keep the flags for the audit trail.
            (true, Tier::Deep) => Decision::AcceptWithFlags,
        };

        debug!(?decision, ?flags, confidence = result.confidence, "validation verdict");
        ValidationVerdict { decision, flags }
    }

    fn technology_mismatch(&self, result: &AnalysisResult, record: &FailureRecord) -> bool {
        let declared: Vec<String> = if record.technology_context.is_empty() {
            // Nothing declared: fall back to what the log itself reveals.
            crate::patterns::detect_technologies(&record.log)
        } else {
            record.technology_context.iter().cloned().collect()
        };
        if declared.is_empty() {
            return false;
        }
        let tech = result.technology.to_lowercase();
        !declared.iter().any(|d| {
            let d = d.to_lowercase();
            d == tech || d.contains(&tech) || tech.contains(&d)
        })
    }

    fn phase_mismatch(&self, result: &AnalysisResult, record: &FailureRecord) -> bool {
        if result.build_phase != BuildPhase::Test {
            return false;
        }
        let log = record.log.to_lowercase();
        EARLIER_PHASE_MARKERS.iter().any(|m| log.contains(m))
    }

    fn generic_solution(&self, result: &AnalysisResult) -> bool {
        let action = result.suggested_action.to_lowercase();
        if action.trim().is_empty() {
            return true;
        }
        self.config
            .generic_phrases
            .iter()
            .any(|phrase| action.contains(&phrase.to_lowercase()))
    }

    fn complexity_underestimate(&self, result: &AnalysisResult, record: &FailureRecord) -> bool {
        if result.confidence <= self.config.complexity_confidence {
            return false;
        }
        let log = record.log.to_lowercase();
        let distinct = COMPLEXITY_MARKERS.iter().filter(|m| log.contains(**m)).count();
        distinct > self.config.complexity_marker_threshold
    }
}
