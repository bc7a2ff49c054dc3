//! End-to-end: recording an episode with mixed evidence kinds drives it
//! through consolidation into admitted cards, and a repeat run of the same
//! episode is a no-op thanks to idempotent event appends.

use memory_archive::engine;
use memory_archive::test_util::{episode_payload, in_memory_engine, tool_output_artifact, tool_output_evidence, user_span_evidence};

#[tokio::test]
async fn record_episode_then_consolidate_admits_constraint_and_tactic_cards() {
    let engine = in_memory_engine().await;

    let mut payload = episode_payload(
        "You must always pin dependency versions in this repo.",
        "Understood, I will pin versions going forward.",
        "repo",
        "widgets",
    );
    payload.artifacts.push(tool_output_artifact("art_1", "Ran the deploy steps: build, test, publish."));
    payload.evidence_refs.push(user_span_evidence("You must always pin dependency versions in this repo."));
    payload.evidence_refs.push(tool_output_evidence("art_1", "Ran the deploy steps: build, test, publish."));

    let mut tx = engine.database().begin().await.unwrap();
    let ingested = engine::ingest::record_episode(&mut tx, std::path::Path::new(".memory/memory.db"), payload, "test").await.unwrap();
    assert_eq!(ingested.evidence_refs, 2);

    let summary = engine::consolidation::consolidate_episode(&mut tx, &ingested.episode_id, "test").await.unwrap();
    assert_eq!(summary.proposed, 2);
    assert_eq!(summary.admitted, 2);
    assert_eq!(summary.rejected, 0);
    tx.commit().await.unwrap();

    let mut tx = engine.database().begin().await.unwrap();
    let (card_count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM cards WHERE status = 'active'")
        .fetch_one(&mut *tx)
        .await
        .unwrap();
    assert_eq!(card_count, 2);

    let (kinds,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM cards WHERE kind = 'constraint'")
        .fetch_one(&mut *tx)
        .await
        .unwrap();
    assert_eq!(kinds, 1);
    tx.commit().await.unwrap();
}

#[tokio::test]
async fn consolidation_rejects_fact_candidate_with_no_anchor() {
    let engine = in_memory_engine().await;
    let payload = episode_payload("hello there", "hi", "repo", "widgets");

    let mut tx = engine.database().begin().await.unwrap();
    let ingested = engine::ingest::record_episode(&mut tx, std::path::Path::new(".memory/memory.db"), payload, "test").await.unwrap();
    let summary = engine::consolidation::consolidate_episode(&mut tx, &ingested.episode_id, "test").await.unwrap();
    tx.commit().await.unwrap();

    assert_eq!(summary.proposed, 0);
    assert_eq!(summary.admitted, 0);
}

#[tokio::test]
async fn duplicate_evidence_ref_recording_is_idempotent() {
    let engine = in_memory_engine().await;
    let mut payload = episode_payload(
        "Please always use tabs for indentation here.",
        "Got it.",
        "repo",
        "widgets",
    );
    let mut evidence = user_span_evidence("Please always use tabs for indentation here.");
    evidence.evidence_ref_id = Some("ev_fixed_retry_0001".to_string());
    payload.evidence_refs.push(evidence);

    let mut tx = engine.database().begin().await.unwrap();
    let first = engine::ingest::record_episode(&mut tx, std::path::Path::new(".memory/memory.db"), payload.clone(), "test")
        .await
        .unwrap();
    tx.commit().await.unwrap();

    payload.episode_id = Some(first.episode_id.clone());
    let mut tx = engine.database().begin().await.unwrap();
    let second = engine::ingest::record_episode(&mut tx, std::path::Path::new(".memory/memory.db"), payload, "test")
        .await
        .unwrap();
    tx.commit().await.unwrap();

    assert_eq!(first.episode_id, second.episode_id);

    let mut tx = engine.database().begin().await.unwrap();
    let (event_count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM memory_events WHERE episode_id = ?")
        .bind(&first.episode_id)
        .fetch_one(&mut *tx)
        .await
        .unwrap();
    tx.commit().await.unwrap();
    assert_eq!(event_count, 3);
}
