// src/types.rs
// Domain types shared across the analysis pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Raw failure as delivered by the log/metadata source. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub job_name: String,
    pub workflow_name: String,
    pub log: String,
    /// Languages / build tools declared for the project ("maven", "docker", ...)
    #[serde(default)]
    pub technology_context: BTreeSet<String>,
    #[serde(default)]
    pub build_phase_hint: Option<BuildPhase>,
    pub timestamp: DateTime<Utc>,
    /// Set by the log source when the fetched log was cut off
    #[serde(default)]
    pub log_truncated: bool,
}

impl FailureRecord {
    pub fn new(job_name: impl Into<String>, log: impl Into<String>) -> Self {
        Self {
            job_name: job_name.into(),
            workflow_name: String::new(),
            log: log.into(),
            technology_context: BTreeSet::new(),
            build_phase_hint: None,
            timestamp: Utc::now(),
            log_truncated: false,
        }
    }

    pub fn with_technology(mut self, tech: impl Into<String>) -> Self {
        self.technology_context.insert(tech.into());
        self
    }
}

/// Coarse position of a failure within the build lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildPhase {
    Setup,
    Compile,
    Test,
    Package,
    Deploy,
    Unknown,
}

impl BuildPhase {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "setup" | "checkout" | "install" => Some(BuildPhase::Setup),
            "compile" | "build" | "compilation" => Some(BuildPhase::Compile),
            "test" | "tests" | "verify" => Some(BuildPhase::Test),
            "package" | "assemble" => Some(BuildPhase::Package),
            "deploy" | "release" | "publish" => Some(BuildPhase::Deploy),
            "unknown" => Some(BuildPhase::Unknown),
            _ => None,
        }
    }
}

impl fmt::Display for BuildPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BuildPhase::Setup => "setup",
            BuildPhase::Compile => "compile",
            BuildPhase::Test => "test",
            BuildPhase::Package => "package",
            BuildPhase::Deploy => "deploy",
            BuildPhase::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// Overall outcome the analyzer assigned to the run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AnalysisStatus {
    Success,
    Failure,
    Partial,
}

impl AnalysisStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "SUCCESS" => Some(AnalysisStatus::Success),
            "FAILURE" => Some(AnalysisStatus::Failure),
            "PARTIAL" => Some(AnalysisStatus::Partial),
            _ => None,
        }
    }
}

/// Which component produced an AnalysisResult
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisSource {
    /// Matched by the zero-cost rule engine; carries the rule id
    Pattern(String),
    Fast,
    Deep,
    /// Synthesized when every analysis path failed; never cached
    Fallback,
}

impl fmt::Display for AnalysisSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnalysisSource::Pattern(id) => write!(f, "pattern:{id}"),
            AnalysisSource::Fast => write!(f, "fast"),
            AnalysisSource::Deep => write!(f, "deep"),
            AnalysisSource::Fallback => write!(f, "fallback"),
        }
    }
}

/// The two analysis backends, in increasing cost and presumed accuracy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Fast,
    Deep,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Fast => write!(f, "fast"),
            Tier::Deep => write!(f, "deep"),
        }
    }
}

/// Canonical diagnosis. Produced fresh per invocation and never mutated;
/// a re-analysis yields a new value, not a patch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub status: AnalysisStatus,
    pub primary_error: String,
    pub technology: String,
    pub category: String,
    pub build_phase: BuildPhase,
    /// 1-10; anything outside the range is a backend contract violation
    pub confidence: u8,
    /// Blocking failure vs. advisory warning
    pub blocking: bool,
    pub suggested_action: String,
    /// Follow-up commands for the developer, e.g. `gh run view <id> --log`
    #[serde(default)]
    pub commands: Vec<String>,
    pub source: AnalysisSource,
    pub log_truncated: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_phase_parse_aliases() {
        assert_eq!(BuildPhase::parse("Build"), Some(BuildPhase::Compile));
        assert_eq!(BuildPhase::parse("tests"), Some(BuildPhase::Test));
        assert_eq!(BuildPhase::parse("release"), Some(BuildPhase::Deploy));
        assert_eq!(BuildPhase::parse("nonsense"), None);
    }

    #[test]
    fn test_status_parse_case_insensitive() {
        assert_eq!(AnalysisStatus::parse("failure"), Some(AnalysisStatus::Failure));
        assert_eq!(AnalysisStatus::parse("PARTIAL"), Some(AnalysisStatus::Partial));
        assert_eq!(AnalysisStatus::parse("ok"), None);
    }

    #[test]
    fn test_source_display() {
        assert_eq!(AnalysisSource::Pattern("maven_compilation".into()).to_string(), "pattern:maven_compilation");
        assert_eq!(AnalysisSource::Deep.to_string(), "deep");
    }

    #[test]
    fn test_failure_record_defaults() {
        let json = r#"{"job_name":"test (21)","workflow_name":"ci","log":"BUILD FAILURE","timestamp":"2026-01-10T12:00:00Z"}"#;
        let record: FailureRecord = serde_json::from_str(json).unwrap();
        assert!(record.technology_context.is_empty());
        assert!(!record.log_truncated);
        assert!(record.build_phase_hint.is_none());
    }
}
