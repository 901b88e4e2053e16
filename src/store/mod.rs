// src/store/mod.rs
// Durable mapping from failure signature to best-known diagnosis, with
// occurrence bookkeeping and the feedback loop that evolves pattern
// reliability.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::signature::Signature;
use crate::types::{AnalysisResult, AnalysisSource};
use crate::validation::ValidationFlag;

/// Resolution feedback reported by a developer after trying a suggested fix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackOutcome {
    Success,
    Failure,
}

impl FeedbackOutcome {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "success" | "fixed" | "worked" => Some(FeedbackOutcome::Success),
            "failure" | "failed" | "ineffective" => Some(FeedbackOutcome::Failure),
            _ => None,
        }
    }
}

impl fmt::Display for FeedbackOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeedbackOutcome::Success => write!(f, "success"),
            FeedbackOutcome::Failure => write!(f, "failure"),
        }
    }
}

/// Persistent aggregate keyed by signature. Never deleted by the core;
/// retention is the store operator's concern.
#[derive(Debug, Clone, Serialize)]
pub struct Issue {
    pub signature: Signature,
    pub result: AnalysisResult,
    pub flags: Vec<ValidationFlag>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// When the stored result was produced; staleness is measured here,
    /// not against last_seen, which moves on every cache hit.
    pub analyzed_at: DateTime<Utc>,
    pub occurrences: i64,
    pub fix_successes: i64,
    pub fix_failures: i64,
}

pub struct IssueStore {
    pool: SqlitePool,
}

impl IssueStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Pooled in-memory store for tests and ephemeral runs.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self::new(pool);
        store.init_schema().await?;
        Ok(store)
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS issues (
                signature      TEXT PRIMARY KEY,
                result         TEXT NOT NULL,
                confidence     INTEGER NOT NULL,
                technology     TEXT NOT NULL,
                category       TEXT NOT NULL,
                flags          TEXT NOT NULL DEFAULT '[]',
                first_seen     TEXT NOT NULL,
                last_seen      TEXT NOT NULL,
                analyzed_at    TEXT NOT NULL,
                occurrences    INTEGER NOT NULL DEFAULT 1,
                fix_successes  INTEGER NOT NULL DEFAULT 0,
                fix_failures   INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_issues_category_seen ON issues(category, last_seen)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pattern_stats (
                rule_id     TEXT PRIMARY KEY,
                reliability REAL NOT NULL,
                samples     INTEGER NOT NULL DEFAULT 0,
                updated_at  TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Append-only; the audit trail behind reliability updates.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feedback_log (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                signature   TEXT NOT NULL,
                outcome     TEXT NOT NULL,
                recorded_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("issue store schema ready");
        Ok(())
    }

    pub async fn lookup(&self, signature: &Signature) -> Result<Option<Issue>> {
        let row = sqlx::query("SELECT * FROM issues WHERE signature = ?")
            .bind(signature.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(issue_from_row).transpose()
    }

    /// Cache-hit bookkeeping: bump occurrences and last_seen without
    /// touching the stored result.
    pub async fn touch(&self, signature: &Signature) -> Result<Option<Issue>> {
        sqlx::query(
            "UPDATE issues SET occurrences = occurrences + 1, last_seen = ? WHERE signature = ?",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(signature.as_str())
        .execute(&self.pool)
        .await?;
        self.lookup(signature).await
    }

    /// Insert or refresh the issue for a signature. Occurrences always
    /// increment; the stored result is replaced only when the new one's
    /// confidence is >= the stored one's, or the stored analysis has gone
    /// stale. A lower-quality analysis never clobbers a validated
    /// higher-confidence one.
    pub async fn upsert(
        &self,
        signature: &Signature,
        result: &AnalysisResult,
        flags: &[ValidationFlag],
        staleness: Duration,
    ) -> Result<Issue> {
        let now = Utc::now();
        let result_json = serde_json::to_string(result)?;
        let flags_json = serde_json::to_string(flags)?;

        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query("SELECT confidence, analyzed_at FROM issues WHERE signature = ?")
            .bind(signature.as_str())
            .fetch_optional(&mut *tx)
            .await?;

        match existing {
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO issues
                        (signature, result, confidence, technology, category, flags,
                         first_seen, last_seen, analyzed_at, occurrences)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 1)
                    "#,
                )
                .bind(signature.as_str())
                .bind(&result_json)
                .bind(result.confidence as i64)
                .bind(&result.technology)
                .bind(&result.category)
                .bind(&flags_json)
                .bind(now.to_rfc3339())
                .bind(now.to_rfc3339())
                .bind(now.to_rfc3339())
                .execute(&mut *tx)
                .await?;
            }
            Some(row) => {
                let stored_confidence: i64 = row.try_get("confidence")?;
                let analyzed_at = parse_ts(row.try_get::<String, _>("analyzed_at")?.as_str());
                let stale = now - analyzed_at > staleness;
                let supersedes = result.confidence as i64 >= stored_confidence || stale;

                if supersedes {
                    sqlx::query(
                        r#"
                        UPDATE issues SET
                            result = ?, confidence = ?, technology = ?, category = ?,
                            flags = ?, analyzed_at = ?,
                            last_seen = ?, occurrences = occurrences + 1
                        WHERE signature = ?
                        "#,
                    )
                    .bind(&result_json)
                    .bind(result.confidence as i64)
                    .bind(&result.technology)
                    .bind(&result.category)
                    .bind(&flags_json)
                    .bind(now.to_rfc3339())
                    .bind(now.to_rfc3339())
                    .bind(signature.as_str())
                    .execute(&mut *tx)
                    .await?;
                } else {
                    debug!(
                        signature = %signature,
                        stored_confidence,
                        new_confidence = result.confidence,
                        "keeping higher-confidence stored result"
                    );
                    sqlx::query(
                        "UPDATE issues SET last_seen = ?, occurrences = occurrences + 1 WHERE signature = ?",
                    )
                    .bind(now.to_rfc3339())
                    .bind(signature.as_str())
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }

        tx.commit().await?;

        self.lookup(signature)
            .await?
            .ok_or_else(|| sqlx::Error::RowNotFound.into())
    }

    /// Record fix feedback for an issue. Appends to the feedback log,
    /// updates the effectiveness tally, and folds the outcome into the
    /// producing pattern's rolling reliability (simple moving average).
    /// Returns the updated (rule id, reliability) when a pattern produced
    /// the stored result; this is the only path by which rule reliability
    /// evolves at runtime.
    pub async fn record_feedback(
        &self,
        signature: &Signature,
        outcome: FeedbackOutcome,
        smoothing: f64,
    ) -> Result<Option<(String, f64)>> {
        let now = Utc::now().to_rfc3339();

        sqlx::query("INSERT INTO feedback_log (signature, outcome, recorded_at) VALUES (?, ?, ?)")
            .bind(signature.as_str())
            .bind(outcome.to_string())
            .bind(&now)
            .execute(&self.pool)
            .await?;

        let column = match outcome {
            FeedbackOutcome::Success => "fix_successes",
            FeedbackOutcome::Failure => "fix_failures",
        };
        sqlx::query(&format!(
            "UPDATE issues SET {column} = {column} + 1 WHERE signature = ?"
        ))
        .bind(signature.as_str())
        .execute(&self.pool)
        .await?;

        let Some(issue) = self.lookup(signature).await? else {
            warn!(signature = %signature, "feedback for unknown signature");
            return Ok(None);
        };

        let AnalysisSource::Pattern(rule_id) = &issue.result.source else {
            return Ok(None);
        };

        let current: Option<f64> =
            sqlx::query("SELECT reliability FROM pattern_stats WHERE rule_id = ?")
                .bind(rule_id)
                .fetch_optional(&self.pool)
                .await?
                .map(|row| row.try_get("reliability"))
                .transpose()?;

        let sample = match outcome {
            FeedbackOutcome::Success => 1.0,
            FeedbackOutcome::Failure => 0.0,
        };
        let updated = match current {
            Some(old) => old * (1.0 - smoothing) + sample * smoothing,
            None => 1.0 * (1.0 - smoothing) + sample * smoothing,
        };

        sqlx::query(
            r#"
            INSERT INTO pattern_stats (rule_id, reliability, samples, updated_at)
            VALUES (?, ?, 1, ?)
            ON CONFLICT(rule_id) DO UPDATE SET
                reliability = excluded.reliability,
                samples = samples + 1,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(rule_id)
        .bind(updated)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        info!(rule_id, reliability = updated, %outcome, "pattern reliability updated");
        Ok(Some((rule_id.clone(), updated)))
    }

    /// All persisted reliability scores, loaded into the pattern library
    /// at startup.
    pub async fn pattern_reliability(&self) -> Result<HashMap<String, f64>> {
        let rows = sqlx::query("SELECT rule_id, reliability FROM pattern_stats")
            .fetch_all(&self.pool)
            .await?;
        let mut scores = HashMap::with_capacity(rows.len());
        for row in rows {
            scores.insert(row.try_get("rule_id")?, row.try_get("reliability")?);
        }
        Ok(scores)
    }

    /// Issues in the same category seen since the cutoff; the similarity
    /// lookup backing occurrence-anomaly review.
    pub async fn similar_since(
        &self,
        category: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Issue>> {
        let rows = sqlx::query(
            "SELECT * FROM issues WHERE category = ? AND last_seen >= ? ORDER BY last_seen DESC",
        )
        .bind(category)
        .bind(since.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(issue_from_row).collect()
    }
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn issue_from_row(row: SqliteRow) -> Result<Issue> {
    let result_json: String = row.try_get("result")?;
    let flags_json: String = row.try_get("flags")?;
    let signature: String = row.try_get("signature")?;
    Ok(Issue {
        signature: Signature::from_hex(signature),
        result: serde_json::from_str(&result_json)?,
        flags: serde_json::from_str(&flags_json)?,
        first_seen: parse_ts(row.try_get::<String, _>("first_seen")?.as_str()),
        last_seen: parse_ts(row.try_get::<String, _>("last_seen")?.as_str()),
        analyzed_at: parse_ts(row.try_get::<String, _>("analyzed_at")?.as_str()),
        occurrences: row.try_get("occurrences")?,
        fix_successes: row.try_get("fix_successes")?,
        fix_failures: row.try_get("fix_failures")?,
    })
}
