// tests/issue_store.rs
// Upsert semantics, occurrence bookkeeping and the feedback-driven
// reliability loop, against an in-memory store.

use chrono::{Duration, Utc};

use sleuth::signature::Signature;
use sleuth::store::{FeedbackOutcome, IssueStore};
use sleuth::types::{AnalysisResult, AnalysisSource, AnalysisStatus, BuildPhase};
use sleuth::validation::ValidationFlag;

fn result(confidence: u8, source: AnalysisSource) -> AnalysisResult {
    AnalysisResult {
        status: AnalysisStatus::Failure,
        primary_error: "surefire reported failing tests".to_string(),
        technology: "maven".to_string(),
        category: "test".to_string(),
        build_phase: BuildPhase::Test,
        confidence,
        blocking: true,
        suggested_action: "Run mvn test -Dtest=OrderServiceTest".to_string(),
        commands: vec!["gh run view --log".to_string()],
        source,
        log_truncated: false,
    }
}

fn sig(tag: &str) -> Signature {
    Signature::from_hex(format!("deadbeef{tag}"))
}

#[tokio::test]
async fn test_upsert_creates_then_increments() {
    let store = IssueStore::in_memory().await.unwrap();
    let signature = sig("01");

    let issue = store
        .upsert(&signature, &result(7, AnalysisSource::Fast), &[], Duration::hours(2))
        .await
        .unwrap();
    assert_eq!(issue.occurrences, 1);
    assert_eq!(issue.fix_successes, 0);

    let issue = store
        .upsert(&signature, &result(8, AnalysisSource::Deep), &[], Duration::hours(2))
        .await
        .unwrap();
    assert_eq!(issue.occurrences, 2);
    assert_eq!(issue.result.confidence, 8);
    assert_eq!(issue.result.source, AnalysisSource::Deep);
}

#[tokio::test]
async fn test_lower_confidence_never_clobbers_stored_result() {
    let store = IssueStore::in_memory().await.unwrap();
    let signature = sig("02");

    store
        .upsert(&signature, &result(9, AnalysisSource::Deep), &[], Duration::hours(2))
        .await
        .unwrap();
    let issue = store
        .upsert(&signature, &result(4, AnalysisSource::Fast), &[], Duration::hours(2))
        .await
        .unwrap();

    // occurrence moved, result did not
    assert_eq!(issue.occurrences, 2);
    assert_eq!(issue.result.confidence, 9);
    assert_eq!(issue.result.source, AnalysisSource::Deep);
}

#[tokio::test]
async fn test_stale_entry_refreshes_even_at_lower_confidence() {
    let store = IssueStore::in_memory().await.unwrap();
    let signature = sig("03");

    store
        .upsert(&signature, &result(9, AnalysisSource::Deep), &[], Duration::hours(2))
        .await
        .unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    // zero staleness window: anything already stored counts as stale
    let issue = store
        .upsert(&signature, &result(5, AnalysisSource::Fast), &[], Duration::zero())
        .await
        .unwrap();
    assert_eq!(issue.result.confidence, 5);
    assert_eq!(issue.occurrences, 2);
}

#[tokio::test]
async fn test_touch_increments_without_touching_result() {
    let store = IssueStore::in_memory().await.unwrap();
    let signature = sig("04");

    store
        .upsert(&signature, &result(8, AnalysisSource::Fast), &[], Duration::hours(2))
        .await
        .unwrap();
    let issue = store.touch(&signature).await.unwrap().unwrap();
    assert_eq!(issue.occurrences, 2);
    assert_eq!(issue.result.confidence, 8);

    assert!(store.touch(&sig("missing")).await.unwrap().is_none());
}

#[tokio::test]
async fn test_flags_round_trip() {
    let store = IssueStore::in_memory().await.unwrap();
    let signature = sig("05");

    let flags = [
        ValidationFlag::LowConfidence,
        ValidationFlag::UnvalidatedAtDepth,
    ];
    store
        .upsert(&signature, &result(5, AnalysisSource::Fast), &flags, Duration::hours(2))
        .await
        .unwrap();

    let issue = store.lookup(&signature).await.unwrap().unwrap();
    assert_eq!(issue.flags, flags.to_vec());
}

#[tokio::test]
async fn test_feedback_updates_tally_and_pattern_reliability() {
    let store = IssueStore::in_memory().await.unwrap();
    let signature = sig("06");

    store
        .upsert(
            &signature,
            &result(9, AnalysisSource::Pattern("maven_compilation".to_string())),
            &[],
            Duration::hours(2),
        )
        .await
        .unwrap();

    let (rule, reliability) = store
        .record_feedback(&signature, FeedbackOutcome::Failure, 0.2)
        .await
        .unwrap()
        .expect("pattern-backed issue updates reliability");
    assert_eq!(rule, "maven_compilation");
    assert!((reliability - 0.8).abs() < 1e-9);

    let (_, reliability) = store
        .record_feedback(&signature, FeedbackOutcome::Failure, 0.2)
        .await
        .unwrap()
        .unwrap();
    assert!((reliability - 0.64).abs() < 1e-9);

    let issue = store.lookup(&signature).await.unwrap().unwrap();
    assert_eq!(issue.fix_failures, 2);
    assert_eq!(issue.fix_successes, 0);

    let scores = store.pattern_reliability().await.unwrap();
    assert!((scores["maven_compilation"] - 0.64).abs() < 1e-9);
}

#[tokio::test]
async fn test_feedback_success_pulls_reliability_back_up() {
    let store = IssueStore::in_memory().await.unwrap();
    let signature = sig("07");

    store
        .upsert(
            &signature,
            &result(9, AnalysisSource::Pattern("maven_surefire_test".to_string())),
            &[],
            Duration::hours(2),
        )
        .await
        .unwrap();

    store
        .record_feedback(&signature, FeedbackOutcome::Failure, 0.5)
        .await
        .unwrap();
    let (_, reliability) = store
        .record_feedback(&signature, FeedbackOutcome::Success, 0.5)
        .await
        .unwrap()
        .unwrap();
    assert!((reliability - 0.75).abs() < 1e-9);
}

#[tokio::test]
async fn test_feedback_on_backend_result_leaves_patterns_alone() {
    let store = IssueStore::in_memory().await.unwrap();
    let signature = sig("08");

    store
        .upsert(&signature, &result(8, AnalysisSource::Deep), &[], Duration::hours(2))
        .await
        .unwrap();
    let updated = store
        .record_feedback(&signature, FeedbackOutcome::Success, 0.2)
        .await
        .unwrap();
    assert!(updated.is_none());
    assert!(store.pattern_reliability().await.unwrap().is_empty());

    let issue = store.lookup(&signature).await.unwrap().unwrap();
    assert_eq!(issue.fix_successes, 1);
}

#[tokio::test]
async fn test_similar_since_filters_by_category_and_window() {
    let store = IssueStore::in_memory().await.unwrap();

    store
        .upsert(&sig("a1"), &result(8, AnalysisSource::Fast), &[], Duration::hours(2))
        .await
        .unwrap();
    let mut other = result(7, AnalysisSource::Fast);
    other.category = "dependency".to_string();
    store
        .upsert(&sig("a2"), &other, &[], Duration::hours(2))
        .await
        .unwrap();

    let recent = store
        .similar_since("test", Utc::now() - Duration::minutes(5))
        .await
        .unwrap();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].result.category, "test");

    let future_cutoff = store
        .similar_since("test", Utc::now() + Duration::minutes(5))
        .await
        .unwrap();
    assert!(future_cutoff.is_empty());
}
