// src/signature/mod.rs
// Content-derived failure identity for caching and deduplication

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::types::FailureRecord;

/// Stable identity hash for a failure, derived from the normalized log.
/// Two records with equal signatures are treated as the same issue for
/// caching purposes. Treated as a hash, not a proof of identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature(String);

impl Signature {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Rehydrate a stored signature. Only the store uses this; fresh
    /// signatures always come from [`signature`].
    pub fn from_hex(hex: String) -> Self {
        Signature(hex)
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

static ANSI_ESCAPES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]").expect("ansi regex"));

// ISO-8601 with optional fraction and zone, or a bare 10-13 digit epoch.
static TIMESTAMPS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:?\d{2})?|\b\d{10,13}\b",
    )
    .expect("timestamp regex")
});

/// Lines containing one of these mark the start of the informative region.
const ERROR_MARKERS: &[&str] = &[
    "build failure",
    "compilation error",
    "error:",
    "error[",
    "[error]",
    "fatal:",
    "failed",
    "exception",
    "traceback",
    "cannot find symbol",
    "panicked at",
    "assertion",
];

/// Strip volatile content from a raw log: ANSI color codes, timestamps,
/// runs of blank lines. Pure text transformation, no windowing.
pub fn scrub(log: &str) -> String {
    let no_ansi = ANSI_ESCAPES.replace_all(log, "");
    let no_ts = TIMESTAMPS.replace_all(&no_ansi, "");

    let mut out = String::with_capacity(no_ts.len());
    let mut blank_run = 0usize;
    for line in no_ts.lines() {
        let trimmed = line.trim_end();
        if trimmed.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(trimmed);
        out.push('\n');
    }
    out
}

/// Normalize a log and truncate it to the bounded window around the first
/// recognized error marker, so log length stops affecting identity once the
/// informative region is stable. With no marker present, the trailing
/// 2*window+1 lines are kept since failures accumulate at the tail.
pub fn normalize(log: &str, window: usize) -> String {
    let scrubbed = scrub(log);
    let lines: Vec<&str> = scrubbed.lines().collect();

    let marker_idx = lines.iter().position(|line| {
        let lower = line.to_lowercase();
        ERROR_MARKERS.iter().any(|m| lower.contains(m))
    });

    let (start, end) = match marker_idx {
        Some(idx) => (idx.saturating_sub(window), (idx + window + 1).min(lines.len())),
        None => (lines.len().saturating_sub(2 * window + 1), lines.len()),
    };

    let mut out = String::new();
    for line in &lines[start..end] {
        out.push_str(line);
        out.push('\n');
    }
    out
}

/// Derive the signature for a failure record. Deterministic, pure: no
/// wall-clock, no random state, stable across repeated runs for
/// byte-identical normalized input.
pub fn signature(record: &FailureRecord, window: usize) -> Signature {
    let normalized = normalize(&record.log, window);
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    Signature(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(log: &str) -> FailureRecord {
        FailureRecord::new("job", log)
    }

    #[test]
    fn test_identical_normalized_logs_share_signature() {
        let a = record("step one\nERROR: cannot find symbol: class Example\nstep two");
        let b = record("step one\nERROR: cannot find symbol: class Example\nstep two");
        assert_eq!(signature(&a, 20), signature(&b, 20));
    }

    #[test]
    fn test_timestamps_do_not_affect_identity() {
        let a = record("2026-01-10T09:15:02Z ERROR: build failed");
        let b = record("2026-02-28T23:59:59Z ERROR: build failed");
        assert_eq!(signature(&a, 20), signature(&b, 20));
    }

    #[test]
    fn test_ansi_codes_do_not_affect_identity() {
        let a = record("\x1b[31mERROR: out of memory\x1b[0m");
        let b = record("ERROR: out of memory");
        assert_eq!(signature(&a, 20), signature(&b, 20));
    }

    #[test]
    fn test_preamble_outside_window_is_ignored() {
        let noise_a: String = (0..200).map(|i| format!("setup line variant-a {i}\n")).collect();
        let noise_b: String = (0..200).map(|i| format!("different preamble b {i}\n")).collect();
        let shared = "resolving deps\ncompiling module\nrunning javac\nERROR: cannot find symbol: class Example\n";
        let a = record(&format!("{noise_a}{shared}"));
        let b = record(&format!("{noise_b}{shared}"));
        assert_eq!(signature(&a, 3), signature(&b, 3));
    }

    #[test]
    fn test_distinct_errors_diverge() {
        let a = record("ERROR: cannot find symbol: class Example");
        let b = record("ERROR: OutOfMemoryError: Java heap space");
        assert_ne!(signature(&a, 20), signature(&b, 20));
    }

    #[test]
    fn test_blank_runs_collapse() {
        let a = record("ERROR: failed\n\n\n\nnext");
        let b = record("ERROR: failed\n\nnext");
        assert_eq!(signature(&a, 20), signature(&b, 20));
    }

    #[test]
    fn test_no_marker_keeps_tail() {
        let log: String = (0..100).map(|i| format!("line {i}\n")).collect();
        let normalized = normalize(&log, 5);
        assert!(normalized.contains("line 99"));
        assert!(!normalized.contains("line 0\n"));
    }
}
