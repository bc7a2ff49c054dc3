//! Reducer: pure(-ish, modulo the SQL projection tables) application of one
//! persisted event to the card/ledger/index projections. Every function here
//! takes the event's own `event_id`/`created_at` and never reads the clock,
//! so replaying the log reproduces identical state.

use serde_json::Value;
use sqlx::{Sqlite, Transaction};
use std::collections::HashSet;

use crate::error::Result;
use crate::text::{canonical_json, pseudo_embedding};
use crate::types::EventType;

pub(crate) async fn apply_event(
    tx: &mut Transaction<'_, Sqlite>,
    event_id: i64,
    episode_id: &str,
    event_type: EventType,
    payload: &Value,
    event_ts: &str,
) -> Result<()> {
    use EventType::*;
    match event_type {
        CandidateProposed | CardRejected | CardAdmitted | CardMerged | CardSuperseded
        | CardArchived => {
            apply_consolidation_event(tx, event_id, episode_id, event_type, payload, event_ts)
                .await?;
            crate::engine::consolidation::refresh_ledger(tx, episode_id).await?;

            if matches!(event_type, CardAdmitted | CardMerged | CardSuperseded | CardArchived) {
                let mut card_ids: Vec<String> = Vec::new();
                if let Some(cid) = payload.pointer("/card/card_id").and_then(Value::as_str) {
                    card_ids.push(cid.to_string());
                }
                for key in ["target_card_id", "old_card_id", "new_card_id", "card_id"] {
                    if let Some(cid) = payload.get(key).and_then(Value::as_str) {
                        card_ids.push(cid.to_string());
                    }
                }
                let unique: std::collections::BTreeSet<String> = card_ids.into_iter().collect();
                for cid in unique {
                    refresh_card_indices(tx, &cid, event_id).await?;
                }
            }
            Ok(())
        }
        CardStatusChanged => {
            let card_id = payload["card_id"].as_str().unwrap_or_default();
            let from_status = payload["from_status"].as_str().unwrap_or_default();
            let to_status = payload["to_status"].as_str().unwrap_or_default();
            let reason_code = payload.get("reason_code").and_then(Value::as_str).unwrap_or("status_change");

            sqlx::query("UPDATE cards SET status = ?, updated_event_id = ? WHERE card_id = ?")
                .bind(to_status)
                .bind(event_id)
                .bind(card_id)
                .execute(&mut *tx)
                .await?;
            insert_status_history(tx, card_id, event_id, from_status, to_status, reason_code, event_ts)
                .await?;
            refresh_card_indices(tx, card_id, event_id).await?;
            Ok(())
        }
        CardDeprecated => {
            let card_id = payload["card_id"].as_str().unwrap_or_default();
            let from_status = current_status(tx, card_id).await?.unwrap_or_else(|| "active".to_string());
            sqlx::query("UPDATE cards SET status = 'deprecated', updated_event_id = ? WHERE card_id = ?")
                .bind(event_id)
                .bind(card_id)
                .execute(&mut *tx)
                .await?;
            let reason_code = payload.get("reason_code").and_then(Value::as_str).unwrap_or("deprecated");
            insert_status_history(tx, card_id, event_id, &from_status, "deprecated", reason_code, event_ts)
                .await?;
            refresh_card_indices(tx, card_id, event_id).await?;
            Ok(())
        }
        DisputeRecorded => {
            sqlx::query(
                "INSERT OR REPLACE INTO disputes (dispute_id, card_id, evidence_ref_id, weight, event_id, created_at) \
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(payload["dispute_id"].as_str())
            .bind(payload["card_id"].as_str())
            .bind(payload["evidence_ref_id"].as_str())
            .bind(payload["weight"].as_f64())
            .bind(event_id)
            .bind(event_ts)
            .execute(&mut *tx)
            .await?;
            Ok(())
        }
        ExposureRecorded => {
            let snap = &payload["pack_snapshot"];
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO pack_snapshots (
                  pack_id, episode_id, channel, query_text, policy_version,
                  ranked_candidates_json, selected_cards_json, created_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(snap["pack_id"].as_str())
            .bind(episode_id)
            .bind(snap["channel"].as_str())
            .bind(snap.get("query_text").and_then(Value::as_str).unwrap_or(""))
            .bind(snap.get("policy_version").and_then(Value::as_str).unwrap_or(crate::rules::RULE_VERSION))
            .bind(canonical_json(&snap["ranked_candidates"]))
            .bind(canonical_json(&snap["selected_cards"]))
            .bind(event_ts)
            .execute(&mut *tx)
            .await?;

            if let Some(exposures) = payload.get("exposures").and_then(Value::as_array) {
                for exp in exposures {
                    sqlx::query(
                        r#"
                        INSERT OR REPLACE INTO exposures (
                          exposure_id, episode_id, pack_id, card_id, channel,
                          rank_position, score_total, source_event_id, created_at
                        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                        "#,
                    )
                    .bind(exp["exposure_id"].as_str())
                    .bind(episode_id)
                    .bind(snap["pack_id"].as_str())
                    .bind(exp["card_id"].as_str())
                    .bind(exp["channel"].as_str())
                    .bind(exp["rank_position"].as_i64())
                    .bind(exp["score_total"].as_f64())
                    .bind(event_id)
                    .bind(event_ts)
                    .execute(&mut *tx)
                    .await?;
                }
            }
            crate::engine::dispute::recompute_utility_projection(tx).await?;
            Ok(())
        }
        OutcomeRecorded => {
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO outcomes (
                  event_id, episode_id, outcome_type, evidence_ref_ids_json, metadata_json, created_at
                ) VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(event_id)
            .bind(episode_id)
            .bind(payload["outcome_type"].as_str())
            .bind(canonical_json(payload.get("evidence_ref_ids").unwrap_or(&Value::Array(vec![]))))
            .bind(canonical_json(payload.get("metadata_json").unwrap_or(&Value::Object(Default::default()))))
            .bind(event_ts)
            .execute(&mut *tx)
            .await?;
            crate::engine::dispute::recompute_utility_projection(tx).await?;
            Ok(())
        }
        // episode_recorded / artifact_recorded / evidence_ref_recorded / consolidation_triggered
        // are canonical facts already persisted by the ingest path; they have no projection effect.
        EpisodeRecorded | ArtifactRecorded | EvidenceRefRecorded | ConsolidationTriggered => Ok(()),
    }
}

async fn current_status(tx: &mut Transaction<'_, Sqlite>, card_id: &str) -> Result<Option<String>> {
    let row: Option<(String,)> = sqlx::query_as("SELECT status FROM cards WHERE card_id = ?")
        .bind(card_id)
        .fetch_optional(&mut *tx)
        .await?;
    Ok(row.map(|(s,)| s))
}

async fn insert_status_history(
    tx: &mut Transaction<'_, Sqlite>,
    card_id: &str,
    event_id: i64,
    from_status: &str,
    to_status: &str,
    reason_code: &str,
    event_ts: &str,
) -> Result<()> {
    sqlx::query(
        "INSERT OR REPLACE INTO card_status_history (card_id, event_id, from_status, to_status, reason_code, created_at) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(card_id)
    .bind(event_id)
    .bind(from_status)
    .bind(to_status)
    .bind(reason_code)
    .bind(event_ts)
    .execute(&mut *tx)
    .await?;
    Ok(())
}

async fn apply_consolidation_event(
    tx: &mut Transaction<'_, Sqlite>,
    event_id: i64,
    episode_id: &str,
    event_type: EventType,
    payload: &Value,
    event_ts: &str,
) -> Result<()> {
    let candidate_id = payload.get("candidate_id").and_then(Value::as_str);
    let reason_code = payload.get("reason_code").and_then(Value::as_str);

    sqlx::query(
        r#"
        INSERT INTO consolidation_decisions (
          event_id, episode_id, candidate_id, action, reason_code, details_json, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(event_id)
    .bind(episode_id)
    .bind(candidate_id)
    .bind(event_type.as_str())
    .bind(reason_code)
    .bind(canonical_json(payload))
    .bind(event_ts)
    .execute(&mut *tx)
    .await?;

    match event_type {
        EventType::CardAdmitted => {
            let card = &payload["card"];
            let card_id = card["card_id"].as_str().unwrap_or_default();
            let tags = canonical_json(card.get("tags").unwrap_or(&Value::Array(vec![])));
            let existing_created: Option<(i64,)> =
                sqlx::query_as("SELECT created_event_id FROM cards WHERE card_id = ?")
                    .bind(card_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            let created_event_id = existing_created.map(|(c,)| c).unwrap_or(event_id);

            sqlx::query(
                r#"
                INSERT OR REPLACE INTO cards (
                  card_id, kind, statement, scope_tier, scope_id, topic_key,
                  tags_json, status, supersedes_card_id, created_event_id,
                  updated_event_id, archived_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL)
                "#,
            )
            .bind(card_id)
            .bind(card["kind"].as_str())
            .bind(card["statement"].as_str())
            .bind(card["scope_tier"].as_str())
            .bind(card["scope_id"].as_str())
            .bind(card["topic_key"].as_str())
            .bind(tags)
            .bind(card.get("status").and_then(Value::as_str).unwrap_or("active"))
            .bind(card.get("supersedes_card_id").and_then(Value::as_str))
            .bind(created_event_id)
            .bind(event_id)
            .execute(&mut *tx)
            .await?;

            if let Some(ev_ids) = card.get("evidence_ref_ids").and_then(Value::as_array) {
                for ev_id in ev_ids {
                    if let Some(ev_id) = ev_id.as_str() {
                        sqlx::query(
                            "INSERT OR IGNORE INTO card_evidence_refs (card_id, evidence_ref_id) VALUES (?, ?)",
                        )
                        .bind(card_id)
                        .bind(ev_id)
                        .execute(&mut *tx)
                        .await?;
                    }
                }
            }
            Ok(())
        }
        EventType::CardMerged => {
            let target_card_id = payload["target_card_id"].as_str().unwrap_or_default();
            sqlx::query("UPDATE cards SET updated_event_id = ? WHERE card_id = ?")
                .bind(event_id)
                .bind(target_card_id)
                .execute(&mut *tx)
                .await?;
            if let Some(ev_ids) = payload.get("evidence_ref_ids").and_then(Value::as_array) {
                let seen: HashSet<&str> = ev_ids.iter().filter_map(Value::as_str).collect();
                for ev_id in seen {
                    sqlx::query(
                        "INSERT OR IGNORE INTO card_evidence_refs (card_id, evidence_ref_id) VALUES (?, ?)",
                    )
                    .bind(target_card_id)
                    .bind(ev_id)
                    .execute(&mut *tx)
                    .await?;
                }
            }
            Ok(())
        }
        EventType::CardSuperseded => {
            let old_card_id = payload["old_card_id"].as_str().unwrap_or_default();
            sqlx::query("UPDATE cards SET status = 'deprecated', updated_event_id = ? WHERE card_id = ?")
                .bind(event_id)
                .bind(old_card_id)
                .execute(&mut *tx)
                .await?;
            let from_status = payload.get("from_status").and_then(Value::as_str).unwrap_or("active");
            let reason = payload.get("reason_code").and_then(Value::as_str).unwrap_or("superseded");
            insert_status_history(tx, old_card_id, event_id, from_status, "deprecated", reason, event_ts).await?;
            Ok(())
        }
        EventType::CardArchived => {
            let card_id = payload["card_id"].as_str().unwrap_or_default();
            let from_status = current_status(tx, card_id).await?.unwrap_or_else(|| "active".to_string());
            sqlx::query(
                "UPDATE cards SET status = 'archived', archived_at = ?, updated_event_id = ? WHERE card_id = ?",
            )
            .bind(event_ts)
            .bind(event_id)
            .bind(card_id)
            .execute(&mut *tx)
            .await?;
            let reason = payload.get("reason_code").and_then(Value::as_str).unwrap_or("archived");
            insert_status_history(tx, card_id, event_id, &from_status, "archived", reason, event_ts).await?;
            Ok(())
        }
        _ => Ok(()),
    }
}

pub(crate) async fn refresh_card_indices(
    tx: &mut Transaction<'_, Sqlite>,
    card_id: &str,
    updated_event_id: i64,
) -> Result<()> {
    let row: Option<(String, String, String, String)> = sqlx::query_as(
        "SELECT card_id, statement, topic_key, tags_json FROM cards WHERE card_id = ?",
    )
    .bind(card_id)
    .fetch_optional(&mut *tx)
    .await?;
    let (card_id, statement, topic_key, tags_json) = match row {
        Some(r) => r,
        None => return Ok(()),
    };

    sqlx::query("DELETE FROM cards_fts WHERE card_id = ?")
        .bind(&card_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("INSERT INTO cards_fts (card_id, statement, topic_key, tags) VALUES (?, ?, ?, ?)")
        .bind(&card_id)
        .bind(&statement)
        .bind(&topic_key)
        .bind(&tags_json)
        .execute(&mut *tx)
        .await?;

    let model = crate::rules::PSEUDO_EMBEDDING_SALT;
    let vec = pseudo_embedding(&statement, crate::rules::PSEUDO_EMBEDDING_DIM, model);
    sqlx::query(
        "INSERT OR REPLACE INTO card_embeddings (card_id, embedding_model, embedding_vector, updated_event_id) \
         VALUES (?, ?, ?, ?)",
    )
    .bind(&card_id)
    .bind(model)
    .bind(canonical_json(&serde_json::to_value(vec).unwrap()))
    .bind(updated_event_id)
    .execute(&mut *tx)
    .await?;
    Ok(())
}
