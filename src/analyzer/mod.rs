// src/analyzer/mod.rs
// Uniform gateway over the fast and deep analysis backends.
//
// The gateway normalizes backend request/response shapes into the canonical
// AnalysisResult and meters every invocation against the shared cost ledger.
// It performs no business judgment; accept/escalate decisions belong to the
// validation engine and the escalation controller.

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info};

use crate::budget::CostLedger;
use crate::error::{Result, SleuthError};
use crate::patterns::PatternMatch;
use crate::signature;
use crate::types::{AnalysisResult, AnalysisSource, AnalysisStatus, BuildPhase, FailureRecord, Tier};

pub mod http;

pub use http::HttpAnalyzer;

/// Raw, transport-normalized backend output. Parsing into the result
/// contract happens in the gateway so backend implementations stay thin.
#[derive(Debug, Clone)]
pub struct BackendReply {
    pub text: String,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub latency_ms: i64,
}

/// A single analysis backend. Implementations map transport failures to
/// `BackendUnavailable` and envelope failures to `MalformedResponse`.
#[async_trait]
pub trait AnalyzerBackend: Send + Sync {
    /// Backend name for logging
    fn name(&self) -> &str;

    async fn complete(&self, prompt: String) -> Result<BackendReply>;
}

/// Gateway tunables, injected by the caller
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Outbound logs are truncated to the same bounded window the
    /// signature engine hashes, keeping cost and identity consistent.
    pub window_lines: usize,
    pub fast_call_estimate_usd: f64,
    pub deep_call_estimate_usd: f64,
    pub fast_price_per_ktok_usd: f64,
    pub deep_price_per_ktok_usd: f64,
}

pub struct AnalyzerGateway {
    fast: Arc<dyn AnalyzerBackend>,
    deep: Arc<dyn AnalyzerBackend>,
    ledger: Arc<CostLedger>,
    config: GatewayConfig,
}

impl AnalyzerGateway {
    pub fn new(
        fast: Arc<dyn AnalyzerBackend>,
        deep: Arc<dyn AnalyzerBackend>,
        ledger: Arc<CostLedger>,
        config: GatewayConfig,
    ) -> Self {
        Self { fast, deep, ledger, config }
    }

    pub fn ledger(&self) -> &Arc<CostLedger> {
        &self.ledger
    }

    /// Run one analysis at the given tier. A pattern match, when present,
    /// is passed along as a prior, not a final answer.
    pub async fn analyze(
        &self,
        record: &FailureRecord,
        tier: Tier,
        hint: Option<&PatternMatch>,
    ) -> Result<AnalysisResult> {
        let backend = match tier {
            Tier::Fast => &self.fast,
            Tier::Deep => &self.deep,
        };
        let estimate = match tier {
            Tier::Fast => self.config.fast_call_estimate_usd,
            Tier::Deep => self.config.deep_call_estimate_usd,
        };

        let excerpt = signature::normalize(&record.log, self.config.window_lines);
        let truncated_by_window = excerpt.lines().count() < signature::scrub(&record.log).lines().count();
        let prompt = build_prompt(record, &excerpt, hint);

        let reservation = self.ledger.reserve(estimate)?;
        let reply = match backend.complete(prompt).await {
            Ok(reply) => reply,
            Err(e) => {
                self.ledger.release(reservation);
                return Err(e);
            }
        };

        let cost = self.invocation_cost(tier, &reply, estimate);
        self.ledger.commit(reservation, cost);
        info!(
            backend = backend.name(),
            %tier,
            latency_ms = reply.latency_ms,
            cost_usd = cost,
            "analyzer invocation metered"
        );

        parse_reply(&reply.text, tier, record.log_truncated || truncated_by_window)
    }

    fn invocation_cost(&self, tier: Tier, reply: &BackendReply, estimate: f64) -> f64 {
        let price = match tier {
            Tier::Fast => self.config.fast_price_per_ktok_usd,
            Tier::Deep => self.config.deep_price_per_ktok_usd,
        };
        match (reply.input_tokens, reply.output_tokens) {
            (Some(input), Some(output)) => (input + output) as f64 / 1000.0 * price,
            // No usage reported; fall back to the conservative estimate.
            _ => estimate,
        }
    }
}

#[derive(Debug, Deserialize)]
struct BackendPayload {
    status: String,
    primary_error: String,
    error_type: String,
    #[serde(default)]
    technology: Option<String>,
    #[serde(default)]
    build_phase: Option<String>,
    confidence: i64,
    #[serde(default)]
    blocking: Option<bool>,
    suggested_action: String,
    #[serde(default)]
    commands: Vec<String>,
}

fn build_prompt(record: &FailureRecord, excerpt: &str, hint: Option<&PatternMatch>) -> String {
    let context = if record.technology_context.is_empty() {
        "unknown".to_string()
    } else {
        record
            .technology_context
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join(", ")
    };

    let hint_line = match hint {
        Some(m) => format!(
            "\nA heuristic rule ({}) suggested: {}. Verify this before trusting it.",
            m.rule_id, m.suggested_action
        ),
        None => String::new(),
    };

    format!(
        "Analyze this CI/CD failure and identify the most likely root cause.\n\
        \n\
        Job: {job}\n\
        Workflow: {workflow}\n\
        Technology context: {context}{hint_line}\n\
        \n\
        Key log excerpt:\n{excerpt}\n\
        \n\
        Return ONLY this JSON structure:\n\
        {{\n\
          \"status\": \"FAILURE|PARTIAL|SUCCESS\",\n\
          \"primary_error\": \"Main blocking issue\",\n\
          \"error_type\": \"technology or technology_subtype, e.g. maven_test\",\n\
          \"build_phase\": \"setup|compile|test|package|deploy\",\n\
          \"confidence\": 7,\n\
          \"blocking\": true,\n\
          \"suggested_action\": \"Specific fix command or approach\",\n\
          \"commands\": [\"gh run view --log\"]\n\
        }}\n\
        \n\
        Focus on actionable solutions. Be concise.",
        job = record.job_name,
        workflow = record.workflow_name,
    )
}

/// Parse a backend reply into the canonical result shape. Everything the
/// contract requires must be present and in range; the gateway rejects
/// rather than trusts out-of-contract output.
fn parse_reply(text: &str, tier: Tier, log_truncated: bool) -> Result<AnalysisResult> {
    let json = extract_json_object(text)
        .ok_or_else(|| SleuthError::MalformedResponse("no JSON object in reply".to_string()))?;
    let payload: BackendPayload = serde_json::from_str(json)
        .map_err(|e| SleuthError::MalformedResponse(e.to_string()))?;

    let status = AnalysisStatus::parse(&payload.status).ok_or_else(|| {
        SleuthError::MalformedResponse(format!("unknown status {:?}", payload.status))
    })?;

    if !(1..=10).contains(&payload.confidence) {
        return Err(SleuthError::MalformedResponse(format!(
            "confidence {} outside 1-10",
            payload.confidence
        )));
    }

    if payload.error_type.trim().is_empty() {
        return Err(SleuthError::MalformedResponse("empty error_type".to_string()));
    }

    let build_phase = payload
        .build_phase
        .as_deref()
        .and_then(BuildPhase::parse)
        .unwrap_or(BuildPhase::Unknown);

    // "maven_test" style tags split into technology + category; a bare tag
    // serves as both.
    let (technology, category) = match payload.error_type.split_once('_') {
        Some((tech, sub)) if !sub.is_empty() => (tech.to_string(), sub.to_string()),
        _ => (payload.error_type.clone(), payload.error_type.clone()),
    };
    let technology = payload.technology.unwrap_or(technology);

    debug!(%tier, confidence = payload.confidence, %technology, "backend reply parsed");

    Ok(AnalysisResult {
        status,
        primary_error: payload.primary_error,
        technology,
        category,
        build_phase,
        confidence: payload.confidence as u8,
        blocking: payload.blocking.unwrap_or(true),
        suggested_action: payload.suggested_action,
        commands: payload.commands,
        source: match tier {
            Tier::Fast => AnalysisSource::Fast,
            Tier::Deep => AnalysisSource::Deep,
        },
        log_truncated,
    })
}

/// Models often wrap the JSON in prose or fences; take the outermost object.
fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end > start { Some(&text[start..=end]) } else { None }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOOD_REPLY: &str = r#"Here is the analysis:
    {
      "status": "FAILURE",
      "primary_error": "Maven surefire reported 3 failing tests",
      "error_type": "maven_test",
      "build_phase": "test",
      "confidence": 8,
      "blocking": true,
      "suggested_action": "Run mvn test -Dtest=OrderServiceTest locally",
      "commands": ["gh run view 123 --log"]
    }"#;

    #[test]
    fn test_parse_reply_splits_error_type() {
        let result = parse_reply(GOOD_REPLY, Tier::Fast, false).unwrap();
        assert_eq!(result.technology, "maven");
        assert_eq!(result.category, "test");
        assert_eq!(result.confidence, 8);
        assert_eq!(result.build_phase, BuildPhase::Test);
        assert_eq!(result.source, AnalysisSource::Fast);
    }

    #[test]
    fn test_parse_reply_bare_error_type() {
        let reply = r#"{"status":"PARTIAL","primary_error":"x","error_type":"docker","confidence":5,"suggested_action":"y"}"#;
        let result = parse_reply(reply, Tier::Deep, false).unwrap();
        assert_eq!(result.technology, "docker");
        assert_eq!(result.category, "docker");
        assert_eq!(result.source, AnalysisSource::Deep);
        // unspecified phase degrades to unknown, not an error
        assert_eq!(result.build_phase, BuildPhase::Unknown);
    }

    #[test]
    fn test_parse_reply_rejects_out_of_range_confidence() {
        let reply = r#"{"status":"FAILURE","primary_error":"x","error_type":"maven","confidence":11,"suggested_action":"y"}"#;
        let err = parse_reply(reply, Tier::Fast, false).unwrap_err();
        assert!(matches!(err, SleuthError::MalformedResponse(_)));
    }

    #[test]
    fn test_parse_reply_rejects_unknown_status() {
        let reply = r#"{"status":"MAYBE","primary_error":"x","error_type":"maven","confidence":5,"suggested_action":"y"}"#;
        assert!(matches!(
            parse_reply(reply, Tier::Fast, false),
            Err(SleuthError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_parse_reply_rejects_missing_fields() {
        let reply = r#"{"status":"FAILURE","confidence":5}"#;
        assert!(matches!(
            parse_reply(reply, Tier::Fast, false),
            Err(SleuthError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_parse_reply_rejects_prose_only() {
        assert!(matches!(
            parse_reply("The build failed because of tests.", Tier::Fast, false),
            Err(SleuthError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_truncation_flag_propagates() {
        let result = parse_reply(GOOD_REPLY, Tier::Fast, true).unwrap();
        assert!(result.log_truncated);
    }

    #[test]
    fn test_prompt_carries_hint_and_context() {
        let record = FailureRecord::new("test (21)", "BUILD FAILURE").with_technology("maven");
        let excerpt = "BUILD FAILURE";
        let hint = PatternMatch {
            rule_id: "maven_surefire_test".to_string(),
            technology: "maven".to_string(),
            category: "test".to_string(),
            build_phase: BuildPhase::Test,
            confidence: 4,
            suggested_action: "inspect surefire reports".to_string(),
            commands: vec![],
            reliability: 0.5,
            low_reliability: true,
        };
        let prompt = build_prompt(&record, excerpt, Some(&hint));
        assert!(prompt.contains("maven_surefire_test"));
        assert!(prompt.contains("Technology context: maven"));
        assert!(prompt.contains("Return ONLY this JSON"));
    }
}
