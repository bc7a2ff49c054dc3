//! Retrieval, pack assembly, and explain endpoints over a consolidated store.

use memory_archive::engine;
use memory_archive::test_util::{episode_payload, in_memory_engine, tool_output_artifact, tool_output_evidence, user_span_evidence};
use memory_archive::types::Channel;

async fn seed_one_constraint_and_one_tactic(engine: &memory_archive::Engine) -> String {
    let mut payload = episode_payload(
        "You must never commit secrets to this repo.",
        "Understood.",
        "repo",
        "widgets",
    );
    payload.artifacts.push(tool_output_artifact("art_1", "Ran the deploy steps: build, test, publish."));
    payload.evidence_refs.push(user_span_evidence("You must never commit secrets to this repo."));
    payload.evidence_refs.push(tool_output_evidence("art_1", "Ran the deploy steps: build, test, publish."));

    let mut tx = engine.database().begin().await.unwrap();
    let ingested = engine::ingest::record_episode(&mut tx, std::path::Path::new(".memory/memory.db"), payload, "test")
        .await
        .unwrap();
    engine::consolidation::consolidate_episode(&mut tx, &ingested.episode_id, "test").await.unwrap();
    tx.commit().await.unwrap();
    ingested.episode_id
}

#[tokio::test]
async fn retrieve_cards_ranks_matching_constraint_first() {
    let eng = in_memory_engine().await;
    let episode_id = seed_one_constraint_and_one_tactic(&eng).await;

    let mut tx = eng.database().begin().await.unwrap();
    let ranked = engine::retrieval::retrieve_cards(&mut tx, "secrets", Some(&episode_id), false, 10, Channel::AutoPack)
        .await
        .unwrap();
    tx.commit().await.unwrap();

    assert!(!ranked.is_empty());
    assert_eq!(ranked[0].kind, memory_archive::types::CardKind::Constraint);
}

#[tokio::test]
async fn build_pack_records_exposure_and_explain_pack_returns_it() {
    let eng = in_memory_engine().await;
    let episode_id = seed_one_constraint_and_one_tactic(&eng).await;

    let mut tx = eng.database().begin().await.unwrap();
    let pack = engine::retrieval::build_pack(&mut tx, &episode_id, "secrets", Channel::AutoPack, "test")
        .await
        .unwrap();
    tx.commit().await.unwrap();

    assert!(!pack.selected_cards.is_empty());

    let mut tx = eng.database().begin().await.unwrap();
    let explained = engine::retrieval::explain_pack(&mut tx, &episode_id, Some(&pack.pack_id)).await.unwrap();
    tx.commit().await.unwrap();

    assert_eq!(explained["pack_id"].as_str().unwrap(), pack.pack_id);
    assert!(explained["selected_cards"].as_array().unwrap().len() >= 1);
}

#[tokio::test]
async fn explain_consolidation_lists_admitted_and_candidate_proposed_decisions() {
    let eng = in_memory_engine().await;
    let episode_id = seed_one_constraint_and_one_tactic(&eng).await;

    let mut tx = eng.database().begin().await.unwrap();
    let decisions = engine::retrieval::explain_consolidation(&mut tx, &episode_id).await.unwrap();
    tx.commit().await.unwrap();

    let actions: Vec<&str> = decisions.iter().filter_map(|d| d["action"].as_str()).collect();
    assert!(actions.contains(&"candidate_proposed"));
    assert!(actions.contains(&"card_admitted"));
}
