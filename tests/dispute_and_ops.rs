//! Dispute accumulation into `needs_recheck`, outcome-driven utility
//! projection, and the operational hardening surface (rebuild, idempotency
//! verification, gates, export).

use memory_archive::engine;
use memory_archive::test_util::{episode_payload, in_memory_engine, tool_output_artifact, tool_output_evidence, user_span_evidence};
use memory_archive::types::{Channel, OutcomeType};

async fn seed_constraint_card(engine: &memory_archive::Engine) -> (String, String) {
    let mut payload = episode_payload(
        "You must never commit secrets to this repo.",
        "Understood.",
        "repo",
        "widgets",
    );
    payload.evidence_refs.push(user_span_evidence("You must never commit secrets to this repo."));

    let mut tx = engine.database().begin().await.unwrap();
    let ingested = engine::ingest::record_episode(&mut tx, std::path::Path::new(".memory/memory.db"), payload, "test")
        .await
        .unwrap();
    engine::consolidation::consolidate_episode(&mut tx, &ingested.episode_id, "test").await.unwrap();
    tx.commit().await.unwrap();

    let mut tx = engine.database().begin().await.unwrap();
    let (card_id,): (String,) = sqlx::query_as("SELECT card_id FROM cards WHERE kind = 'constraint' LIMIT 1")
        .fetch_one(&mut *tx)
        .await
        .unwrap();
    let (evidence_ref_id,): (String,) = sqlx::query_as("SELECT evidence_ref_id FROM evidence_refs LIMIT 1")
        .fetch_one(&mut *tx)
        .await
        .unwrap();
    tx.commit().await.unwrap();

    (ingested.episode_id, format!("{card_id}|{evidence_ref_id}"))
}

#[tokio::test]
async fn repeated_disputes_push_card_into_needs_recheck() {
    let eng = in_memory_engine().await;
    let (episode_id, combo) = seed_constraint_card(&eng).await;
    let (card_id, evidence_ref_id) = combo.split_once('|').unwrap();

    // One dispute below the repo threshold of 2.0 (user_span weight 0.4) should not flip status.
    let mut tx = eng.database().begin().await.unwrap();
    let first = engine::dispute::record_dispute(&mut tx, &episode_id, card_id, evidence_ref_id, "test").await.unwrap();
    tx.commit().await.unwrap();
    assert!(!first.status_changed);

    // Record two further, distinctly-anchored tool_output disputes (weight 1.0
    // each) to cross the repo threshold of 2.0 -- each needs its own evidence
    // ref, since a dispute on the same (card_id, evidence_ref_id) pair is an
    // idempotent no-op.
    let mut tx = eng.database().begin().await.unwrap();
    let art_a = engine::ingest::record_episode(
        &mut tx,
        std::path::Path::new(".memory/memory.db"),
        {
            let mut p = episode_payload("irrelevant", "irrelevant", "repo", "widgets");
            p.artifacts.push(tool_output_artifact("art_x", "unrelated tool output a"));
            p.evidence_refs.push(tool_output_evidence("art_x", "unrelated tool output a"));
            p
        },
        "test",
    )
    .await
    .unwrap();
    let art_b = engine::ingest::record_episode(
        &mut tx,
        std::path::Path::new(".memory/memory.db"),
        {
            let mut p = episode_payload("irrelevant", "irrelevant", "repo", "widgets");
            p.artifacts.push(tool_output_artifact("art_y", "unrelated tool output b"));
            p.evidence_refs.push(tool_output_evidence("art_y", "unrelated tool output b"));
            p
        },
        "test",
    )
    .await
    .unwrap();
    tx.commit().await.unwrap();

    let mut tx = eng.database().begin().await.unwrap();
    let (evidence_a,): (String,) =
        sqlx::query_as("SELECT evidence_ref_id FROM evidence_refs WHERE episode_id = ? LIMIT 1")
            .bind(&art_a.episode_id)
            .fetch_one(&mut *tx)
            .await
            .unwrap();
    let (evidence_b,): (String,) =
        sqlx::query_as("SELECT evidence_ref_id FROM evidence_refs WHERE episode_id = ? LIMIT 1")
            .bind(&art_b.episode_id)
            .fetch_one(&mut *tx)
            .await
            .unwrap();
    let second = engine::dispute::record_dispute(&mut tx, &episode_id, card_id, &evidence_a, "test").await.unwrap();
    let third = engine::dispute::record_dispute(&mut tx, &episode_id, card_id, &evidence_b, "test").await.unwrap();
    tx.commit().await.unwrap();

    assert!(!second.status_changed);
    assert!(third.status_changed);

    let mut tx = eng.database().begin().await.unwrap();
    let (status,): (String,) = sqlx::query_as("SELECT status FROM cards WHERE card_id = ?")
        .bind(card_id)
        .fetch_one(&mut *tx)
        .await
        .unwrap();
    tx.commit().await.unwrap();
    assert_eq!(status, "needs_recheck");
}

#[tokio::test]
async fn recorded_outcomes_feed_utility_stats_for_exposed_tactic_cards() {
    let eng = in_memory_engine().await;

    let mut payload = episode_payload(
        "Please remember that.",
        "OK",
        "repo",
        "widgets",
    );
    payload.artifacts.push(tool_output_artifact("art_1", "Ran the deploy steps: build, test, publish."));
    payload.evidence_refs.push(tool_output_evidence("art_1", "Ran the deploy steps: build, test, publish."));

    let mut tx = eng.database().begin().await.unwrap();
    let ingested = engine::ingest::record_episode(&mut tx, std::path::Path::new(".memory/memory.db"), payload, "test")
        .await
        .unwrap();
    engine::consolidation::consolidate_episode(&mut tx, &ingested.episode_id, "test").await.unwrap();
    engine::retrieval::build_pack(&mut tx, &ingested.episode_id, "deploy", Channel::AutoPack, "test")
        .await
        .unwrap();
    engine::dispute::record_outcome(
        &mut tx,
        &ingested.episode_id,
        OutcomeType::ToolSuccess,
        &[],
        &serde_json::json!({}),
        "test",
    )
    .await
    .unwrap();
    tx.commit().await.unwrap();

    let mut tx = eng.database().begin().await.unwrap();
    let (wins,): (i64,) = sqlx::query_as("SELECT COALESCE(SUM(wins), 0) FROM utility_stats")
        .fetch_one(&mut *tx)
        .await
        .unwrap();
    tx.commit().await.unwrap();
    assert!(wins >= 1);
}

#[tokio::test]
async fn full_rebuild_preserves_projection_digest() {
    let eng = in_memory_engine().await;
    let (episode_id, _) = seed_constraint_card(&eng).await;
    let _ = episode_id;

    let mut tx = eng.database().begin().await.unwrap();
    let before_digest = engine::ops::projection_digest(&mut tx).await.unwrap();
    let result = engine::ops::full_rebuild(&mut tx, true).await.unwrap();
    let after_digest = engine::ops::projection_digest(&mut tx).await.unwrap();
    tx.commit().await.unwrap();

    assert_eq!(before_digest, after_digest);
    assert_eq!(result["verification"]["verified"], serde_json::json!(true));
}

#[tokio::test]
async fn verify_reducer_idempotency_reports_pass() {
    let eng = in_memory_engine().await;
    seed_constraint_card(&eng).await;

    let mut tx = eng.database().begin().await.unwrap();
    let report = engine::ops::verify_reducer_idempotency(&mut tx, 100).await.unwrap();
    tx.commit().await.unwrap();

    assert_eq!(report["pass"], serde_json::json!(true));
    assert_eq!(report["inserted_on_retry"], serde_json::json!(0));
}

#[tokio::test]
async fn check_store_health_reports_healthy_store() {
    let eng = in_memory_engine().await;
    seed_constraint_card(&eng).await;

    let mut tx = eng.database().begin().await.unwrap();
    let health = engine::ops::check_store_health(&mut tx).await.unwrap();
    tx.commit().await.unwrap();

    assert_eq!(health["healthy"], serde_json::json!(true));
}

#[tokio::test]
async fn export_episode_returns_events_in_seq_order() {
    let eng = in_memory_engine().await;
    let (episode_id, _) = seed_constraint_card(&eng).await;

    let mut tx = eng.database().begin().await.unwrap();
    let events = engine::ops::export_episode(&mut tx, &episode_id).await.unwrap();
    tx.commit().await.unwrap();

    assert!(!events.is_empty());
    let seqs: Vec<i64> = events.iter().map(|e| e["seq_no"].as_i64().unwrap()).collect();
    let mut sorted = seqs.clone();
    sorted.sort();
    assert_eq!(seqs, sorted);
}

#[tokio::test]
async fn evaluate_causal_gates_reports_not_ready_on_sparse_store() {
    let eng = in_memory_engine().await;
    seed_constraint_card(&eng).await;

    let mut tx = eng.database().begin().await.unwrap();
    let gates = engine::ops::evaluate_causal_gates(&mut tx, 30).await.unwrap();
    tx.commit().await.unwrap();

    assert_eq!(gates["ready_for_causal_instrumentation"], serde_json::json!(false));
}
