// src/patterns/mod.rs
// Zero-cost rule engine: ordered pattern library matched against normalized logs

use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{Result, SleuthError};
use crate::types::{AnalysisResult, AnalysisSource, AnalysisStatus, BuildPhase, FailureRecord};

/// A static matcher for a known failure class. Rules are immutable after
/// load; reliability is the only runtime-mutable state and lives in the
/// library's side table, fed by the Issue Store feedback loop.
#[derive(Debug)]
pub struct PatternRule {
    pub id: String,
    pub description: String,
    pub technology: String,
    pub category: String,
    pub build_phase: BuildPhase,
    /// Declared base confidence, 1-10
    pub base_confidence: u8,
    pub suggested_action: String,
    pub commands: Vec<String>,
    predicate: Regex,
}

impl PatternRule {
    pub fn matches(&self, normalized_log: &str) -> bool {
        self.predicate.is_match(normalized_log)
    }
}

/// Outcome of a successful rule match
#[derive(Debug, Clone)]
pub struct PatternMatch {
    pub rule_id: String,
    pub technology: String,
    pub category: String,
    pub build_phase: BuildPhase,
    /// base confidence scaled by reliability, clamped to [1,10]
    pub confidence: u8,
    pub suggested_action: String,
    pub commands: Vec<String>,
    pub reliability: f64,
    /// Reliability has fallen below the configured floor; downstream must
    /// treat this match as non-authoritative.
    pub low_reliability: bool,
}

impl PatternMatch {
    /// Fold the match into a canonical result for finalization.
    pub fn to_result(&self, record: &FailureRecord) -> AnalysisResult {
        AnalysisResult {
            status: AnalysisStatus::Failure,
            primary_error: self.suggested_primary_error(),
            technology: self.technology.clone(),
            category: self.category.clone(),
            build_phase: self.build_phase,
            confidence: self.confidence,
            blocking: true,
            suggested_action: self.suggested_action.clone(),
            commands: self.commands.clone(),
            source: AnalysisSource::Pattern(self.rule_id.clone()),
            log_truncated: record.log_truncated,
        }
    }

    fn suggested_primary_error(&self) -> String {
        format!("{} {} failure detected", self.technology, self.category)
    }
}

#[derive(Debug, Deserialize)]
struct RuleDef {
    id: String,
    #[serde(default)]
    description: String,
    pattern: String,
    technology: String,
    category: String,
    #[serde(default)]
    build_phase: Option<String>,
    base_confidence: u8,
    suggested_action: String,
    #[serde(default)]
    commands: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct LibraryFile {
    #[serde(default)]
    version: u32,
    #[serde(rename = "rule")]
    rules: Vec<RuleDef>,
}

/// Versioned, ordered list of immutable rule records, loaded once at
/// startup. Evaluation tries rules in declared order, most-specific first;
/// the first match wins.
pub struct PatternLibrary {
    pub version: u32,
    rules: Vec<PatternRule>,
    reliability: RwLock<HashMap<String, f64>>,
    reliability_floor: f64,
}

impl PatternLibrary {
    pub fn from_rules(version: u32, rules: Vec<PatternRule>, reliability_floor: f64) -> Self {
        Self {
            version,
            rules,
            reliability: RwLock::new(HashMap::new()),
            reliability_floor,
        }
    }

    /// Parse a TOML rule file. Rule order in the file is evaluation order.
    pub fn from_toml(text: &str, reliability_floor: f64) -> Result<Self> {
        let file: LibraryFile =
            toml::from_str(text).map_err(|e| SleuthError::Patterns(e.to_string()))?;

        let mut rules = Vec::with_capacity(file.rules.len());
        for rule in file.rules {
            if !(1..=10).contains(&rule.base_confidence) {
                return Err(SleuthError::Patterns(format!(
                    "rule {}: base_confidence {} outside 1-10",
                    rule.id, rule.base_confidence
                )));
            }
            let predicate = Regex::new(&rule.pattern)
                .map_err(|e| SleuthError::Patterns(format!("rule {}: {e}", rule.id)))?;
            let build_phase = match rule.build_phase.as_deref() {
                Some(s) => BuildPhase::parse(s).ok_or_else(|| {
                    SleuthError::Patterns(format!("rule {}: unknown build phase {s:?}", rule.id))
                })?,
                None => BuildPhase::Unknown,
            };
            rules.push(PatternRule {
                id: rule.id,
                description: rule.description,
                technology: rule.technology,
                category: rule.category,
                build_phase,
                base_confidence: rule.base_confidence,
                suggested_action: rule.suggested_action,
                commands: rule.commands,
                predicate,
            });
        }
        Ok(Self::from_rules(file.version, rules, reliability_floor))
    }

    pub fn from_file(path: &Path, reliability_floor: f64) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text, reliability_floor)
    }

    /// The default library shipped with the engine: Maven, Python/uv,
    /// Docker, cache and release-workflow failure families.
    pub fn builtin(reliability_floor: f64) -> Self {
        Self::from_toml(BUILTIN_RULES, reliability_floor)
            .expect("builtin pattern library must parse")
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rule(&self, id: &str) -> Option<&PatternRule> {
        self.rules.iter().find(|r| r.id == id)
    }

    pub fn reliability_of(&self, rule_id: &str) -> f64 {
        self.reliability
            .read()
            .expect("reliability lock")
            .get(rule_id)
            .copied()
            .unwrap_or(1.0)
    }

    /// Install reliability scores, e.g. the persisted values at startup or
    /// an updated value after feedback. Unknown rule ids are ignored with a
    /// warning since the store may carry stats for retired rules.
    pub fn set_reliability(&self, rule_id: &str, value: f64) {
        if self.rule(rule_id).is_none() {
            warn!(rule_id, "reliability update for unknown rule ignored");
            return;
        }
        self.reliability
            .write()
            .expect("reliability lock")
            .insert(rule_id.to_string(), value.clamp(0.0, 1.0));
    }

    pub fn load_reliability(&self, scores: &HashMap<String, f64>) {
        for (id, value) in scores {
            self.set_reliability(id, *value);
        }
    }

    /// Match a normalized log against the library. First matching rule
    /// wins; no scoring across overlapping rules. No match is `None`,
    /// never an error.
    pub fn find(&self, normalized_log: &str) -> Option<PatternMatch> {
        for rule in &self.rules {
            if !rule.matches(normalized_log) {
                continue;
            }
            let reliability = self.reliability_of(&rule.id);
            let confidence = scale_confidence(rule.base_confidence, reliability);
            let low_reliability = reliability < self.reliability_floor;
            debug!(
                rule_id = %rule.id,
                confidence,
                reliability,
                low_reliability,
                "pattern matched"
            );
            return Some(PatternMatch {
                rule_id: rule.id.clone(),
                technology: rule.technology.clone(),
                category: rule.category.clone(),
                build_phase: rule.build_phase,
                confidence,
                suggested_action: rule.suggested_action.clone(),
                commands: rule.commands.clone(),
                reliability,
                low_reliability,
            });
        }
        None
    }
}

fn scale_confidence(base: u8, reliability: f64) -> u8 {
    ((base as f64) * reliability).round().clamp(1.0, 10.0) as u8
}

/// Technologies recognizable from log content alone. Used as a fallback
/// context for validation when the record declares none.
pub fn detect_technologies(log: &str) -> Vec<String> {
    const DETECTORS: &[(&str, &[&str])] = &[
        ("maven", &["mvn ", "[INFO] BUILD", "pom.xml", "surefire"]),
        ("gradle", &["gradlew", "Task :", "build.gradle"]),
        ("python", &["pytest", "pip install", "Traceback", "ModuleNotFoundError"]),
        ("uv", &["uv sync", "uv run", "--extra dev"]),
        ("docker", &["Dockerfile", "docker build", "FROM ", "buildx"]),
        ("node", &["npm ", "yarn ", "package.json"]),
        ("rust", &["cargo ", "error[E"]),
    ];

    let mut found = Vec::new();
    for (tech, needles) in DETECTORS {
        if needles.iter().any(|n| log.contains(n)) {
            found.push((*tech).to_string());
        }
    }
    found
}

// Ordered most-specific first: compilation and dependency diagnostics carry
// more signal than the generic surefire / workflow catch-alls below them.
const BUILTIN_RULES: &str = r##"
version = 1

[[rule]]
id = "maven_compilation"
description = "javac compilation failure surfaced through Maven"
pattern = '(?i)COMPILATION ERROR|cannot find symbol|package [\w.]+ does not exist'
technology = "maven"
category = "compilation"
build_phase = "compile"
base_confidence = 9
suggested_action = "Run mvn clean compile locally; check imports and dependency versions for the missing symbol"
commands = ["mvn clean compile", "gh run view --log"]

[[rule]]
id = "maven_dependency_resolution"
description = "Maven cannot resolve artifacts or parent POM"
pattern = '(?i)Could not resolve dependencies|Failed to collect dependencies|ArtifactResolutionException|Non-resolvable parent POM'
technology = "maven"
category = "dependency"
build_phase = "setup"
base_confidence = 8
suggested_action = "Force-update snapshots with mvn clean install -U and verify repository configuration in pom.xml"
commands = ["mvn clean install -U", "mvn dependency:tree"]

[[rule]]
id = "maven_jdk_mismatch"
description = "JDK version incompatibility in multi-version builds"
pattern = '(?i)invalid target release|UnsupportedClassVersionError|class file version'
technology = "maven"
category = "jdk"
build_phase = "compile"
base_confidence = 8
suggested_action = "Align maven.compiler.source/target with the JDK the job runs on"
commands = ["java -version", "mvn -version"]

[[rule]]
id = "jvm_out_of_memory"
description = "JVM heap or metaspace exhaustion"
pattern = '(?i)OutOfMemoryError|Java heap space|Metaspace'
technology = "maven"
category = "memory"
build_phase = "test"
base_confidence = 7
suggested_action = "Raise the build JVM heap, e.g. MAVEN_OPTS=-Xmx2048m, and look for leaking tests"
commands = ["gh run view --log"]

[[rule]]
id = "maven_surefire_test"
description = "Surefire-reported test failures"
pattern = '(?i)There are test failures|Failed to execute goal.*surefire|Tests run: \d+, Failures: [1-9]'
technology = "maven"
category = "test"
build_phase = "test"
base_confidence = 8
suggested_action = "Re-run the failing class with mvn test -Dtest=<FailingTest> and inspect target/surefire-reports/"
commands = ["mvn clean test", "gh run view --log"]

[[rule]]
id = "python_pytest_missing"
description = "pytest not installed in the job environment"
pattern = '(?i)pytest: command not found|No module named .?pytest|pytest not available'
technology = "python"
category = "dependency"
build_phase = "setup"
base_confidence = 9
suggested_action = "Install dev dependencies before testing; with uv, run uv sync --extra dev"
commands = ["uv sync --extra dev"]

[[rule]]
id = "python_import_error"
description = "module resolution failure at import time"
pattern = '(?i)ImportError|ModuleNotFoundError'
technology = "python"
category = "import"
build_phase = "test"
base_confidence = 7
suggested_action = "Verify the package is declared in pyproject.toml and the source layout matches the import path"
commands = ["python -c 'import <module>'"]

[[rule]]
id = "docker_malformed_version_file"
description = "stray =X.Y.Z files produced by uv requirement parsing"
pattern = '=\d+\.\d+\.\d+'
technology = "docker"
category = "build"
build_phase = "package"
base_confidence = 6
suggested_action = "Remove malformed =X.Y.Z files from the build context and quote version specifiers in the Dockerfile"
commands = ["docker build --no-cache ."]

[[rule]]
id = "docker_build_failure"
description = "docker image build step failed"
pattern = '(?i)docker build.*failed|failed to solve|executor failed running'
technology = "docker"
category = "build"
build_phase = "package"
base_confidence = 7
suggested_action = "Re-run the failing layer locally with docker build and inspect the last RUN instruction"
commands = ["docker build .", "gh run view --log"]

[[rule]]
id = "cache_checksum_mismatch"
description = "dependency or layer cache integrity failure"
pattern = '(?i)cache.*(failed|corrupt)|checksum.*not found|checksum mismatch'
technology = "ci"
category = "cache"
build_phase = "setup"
base_confidence = 6
suggested_action = "Bust the dependency cache key and re-run the workflow"
commands = ["gh cache delete --all"]

[[rule]]
id = "release_workflow"
description = "semantic-release / versioning workflow failure"
pattern = '(?i)semantic-release|semantic-version.*(failed|error)'
technology = "ci"
category = "workflow"
build_phase = "deploy"
base_confidence = 6
suggested_action = "Review semantic-release configuration and recent commit message format"
commands = ["gh run view --log"]
"##;

#[cfg(test)]
mod tests {
    use super::*;

    fn library() -> PatternLibrary {
        PatternLibrary::builtin(0.8)
    }

    #[test]
    fn test_builtin_library_parses() {
        let lib = library();
        assert!(lib.len() >= 10);
        assert_eq!(lib.version, 1);
    }

    #[test]
    fn test_first_match_wins_over_later_rules() {
        // Log matches both the compilation rule and the surefire rule;
        // declared order decides.
        let lib = library();
        let log = "BUILD FAILURE\ncannot find symbol: class Example\nThere are test failures";
        let m = lib.find(log).unwrap();
        assert_eq!(m.rule_id, "maven_compilation");
        assert_eq!(m.confidence, 9);
        assert_eq!(m.category, "compilation");
    }

    #[test]
    fn test_no_match_returns_none() {
        let lib = library();
        assert!(lib.find("everything is fine here").is_none());
    }

    #[test]
    fn test_reliability_scales_confidence() {
        let lib = library();
        lib.set_reliability("maven_compilation", 0.5);
        let m = lib.find("COMPILATION ERROR").unwrap();
        // 9 * 0.5 rounds to 5 (actually 4.5 -> 5)
        assert_eq!(m.confidence, 5);
        assert!(m.low_reliability);
    }

    #[test]
    fn test_low_reliability_match_still_returned() {
        let lib = library();
        lib.set_reliability("python_pytest_missing", 0.3);
        let m = lib.find("pytest: command not found").unwrap();
        assert!(m.low_reliability);
        assert!(m.confidence >= 1);
    }

    #[test]
    fn test_confidence_never_leaves_range() {
        assert_eq!(scale_confidence(10, 1.0), 10);
        assert_eq!(scale_confidence(9, 0.01), 1);
        assert_eq!(scale_confidence(1, 0.0), 1);
    }

    #[test]
    fn test_unknown_rule_reliability_ignored() {
        let lib = library();
        lib.set_reliability("retired_rule", 0.1);
        assert_eq!(lib.reliability_of("retired_rule"), 1.0);
    }

    #[test]
    fn test_toml_rejects_out_of_range_confidence() {
        let bad = r#"
            [[rule]]
            id = "bad"
            pattern = "x"
            technology = "t"
            category = "c"
            base_confidence = 11
            suggested_action = "a"
        "#;
        assert!(PatternLibrary::from_toml(bad, 0.8).is_err());
    }

    #[test]
    fn test_toml_rejects_invalid_regex() {
        let bad = r#"
            [[rule]]
            id = "bad"
            pattern = "("
            technology = "t"
            category = "c"
            base_confidence = 5
            suggested_action = "a"
        "#;
        assert!(PatternLibrary::from_toml(bad, 0.8).is_err());
    }

    #[test]
    fn test_match_to_result_carries_truncation() {
        let lib = library();
        let mut record = FailureRecord::new("job", "COMPILATION ERROR");
        record.log_truncated = true;
        let result = lib.find(&record.log).unwrap().to_result(&record);
        assert!(result.log_truncated);
        assert!(matches!(result.source, AnalysisSource::Pattern(ref id) if id == "maven_compilation"));
    }

    #[test]
    fn test_detect_technologies_from_log() {
        let log = "Step 3: docker build . failed\nTraceback (most recent call last):";
        let techs = detect_technologies(log);
        assert!(techs.contains(&"python".to_string()));
        assert!(techs.contains(&"docker".to_string()));
        assert!(!techs.contains(&"maven".to_string()));
    }
}
