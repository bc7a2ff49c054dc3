//! Operational hardening: projection health checks, trend/metrics reporting,
//! partial-write recovery, full rebuild/replay, reducer idempotency
//! verification, embedding migration, and the causal-instrumentation
//! readiness gates.

use std::path::Path;

use serde_json::json;
use sqlx::{Sqlite, Transaction};

use crate::error::Result;
use crate::rules;
use crate::text::{canonical_json, pseudo_embedding, sha256_text};
use crate::types::EventType;

use super::append_event;

pub async fn snapshot_projection_counts(
    tx: &mut Transaction<'_, Sqlite>,
) -> Result<std::collections::BTreeMap<String, i64>> {
    const TABLES: [&str; 12] = [
        "cards",
        "card_evidence_refs",
        "consolidation_decisions",
        "consolidation_ledger",
        "cards_fts",
        "card_embeddings",
        "pack_snapshots",
        "exposures",
        "disputes",
        "card_status_history",
        "outcomes",
        "utility_stats",
    ];
    let mut out = std::collections::BTreeMap::new();
    for table in TABLES {
        let (n,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&mut *tx)
            .await?;
        out.insert(table.to_string(), n);
    }
    Ok(out)
}

const PROJECTION_TABLES: [(&str, &str); 11] = [
    ("cards", "card_id"),
    ("card_evidence_refs", "card_id, evidence_ref_id"),
    ("consolidation_decisions", "decision_id"),
    ("consolidation_ledger", "episode_id"),
    ("card_embeddings", "card_id"),
    ("pack_snapshots", "pack_id"),
    ("exposures", "exposure_id"),
    ("disputes", "dispute_id"),
    ("card_status_history", "card_id, event_id"),
    ("outcomes", "event_id"),
    ("utility_stats", "card_id"),
];

/// SHA-256 over the canonical JSON of every projection table, each ordered
/// by its natural key, excluding `consolidation_decisions.decision_id`
/// (an autoincrement id, unstable across rebuilds).
pub async fn projection_digest(tx: &mut Transaction<'_, Sqlite>) -> Result<String> {
    let mut payload = serde_json::Map::new();
    for (table, order_by) in PROJECTION_TABLES {
        let rows: Vec<serde_json::Value> = fetch_table_rows(tx, table, order_by).await?;
        let cleaned: Vec<serde_json::Value> = rows
            .into_iter()
            .map(|mut row| {
                if table == "consolidation_decisions" {
                    if let Some(obj) = row.as_object_mut() {
                        obj.remove("decision_id");
                    }
                }
                row
            })
            .collect();
        payload.insert(table.to_string(), serde_json::Value::Array(cleaned));
    }
    Ok(sha256_text(&canonical_json(&serde_json::Value::Object(payload))))
}

/// Generic `SELECT * FROM {table} ORDER BY {order_by}` reader that maps each
/// row into a JSON object using the column names sqlite reports, since each
/// projection table has a different shape and we want one digest routine
/// rather than one `query_as` per table.
async fn fetch_table_rows(
    tx: &mut Transaction<'_, Sqlite>,
    table: &str,
    order_by: &str,
) -> Result<Vec<serde_json::Value>> {
    use sqlx::{Column, Row, TypeInfo};

    let rows = sqlx::query(&format!("SELECT * FROM {table} ORDER BY {order_by}"))
        .fetch_all(&mut *tx)
        .await?;
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let mut obj = serde_json::Map::new();
        for col in row.columns() {
            let name = col.name().to_string();
            let value = if col.type_info().name().eq_ignore_ascii_case("integer") {
                row.try_get::<Option<i64>, _>(col.ordinal())
                    .ok()
                    .flatten()
                    .map(serde_json::Value::from)
                    .unwrap_or(serde_json::Value::Null)
            } else if col.type_info().name().eq_ignore_ascii_case("real") {
                row.try_get::<Option<f64>, _>(col.ordinal())
                    .ok()
                    .flatten()
                    .map(serde_json::Value::from)
                    .unwrap_or(serde_json::Value::Null)
            } else {
                row.try_get::<Option<String>, _>(col.ordinal())
                    .ok()
                    .flatten()
                    .map(serde_json::Value::from)
                    .unwrap_or(serde_json::Value::Null)
            };
            obj.insert(name, value);
        }
        out.push(serde_json::Value::Object(obj));
    }
    Ok(out)
}

pub async fn seq_integrity_issues(tx: &mut Transaction<'_, Sqlite>) -> Result<Vec<serde_json::Value>> {
    let episodes: Vec<(String,)> = sqlx::query_as("SELECT episode_id FROM episodes").fetch_all(&mut *tx).await?;
    let mut issues = Vec::new();
    for (episode_id,) in episodes {
        let seqs: Vec<(i64,)> = sqlx::query_as(
            "SELECT seq_no FROM memory_events WHERE episode_id = ? ORDER BY seq_no",
        )
        .bind(&episode_id)
        .fetch_all(&mut *tx)
        .await?;
        let seqs: Vec<i64> = seqs.into_iter().map(|(s,)| s).collect();
        let expected: Vec<i64> = (1..=seqs.len() as i64).collect();
        if seqs != expected {
            issues.push(json!({
                "episode_id": episode_id,
                "expected_prefix": expected.iter().take(10).collect::<Vec<_>>(),
                "actual_prefix": seqs.iter().take(10).collect::<Vec<_>>(),
                "total_events": seqs.len(),
            }));
        }
    }
    Ok(issues)
}

pub async fn check_store_health(tx: &mut Transaction<'_, Sqlite>) -> Result<serde_json::Value> {
    let seq_issues = seq_integrity_issues(tx).await?;

    let (dup_idem,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM (SELECT idempotency_key, COUNT(*) AS c FROM memory_events \
         GROUP BY idempotency_key HAVING c > 1)",
    )
    .fetch_one(&mut *tx)
    .await?;
    let (cards_without_embedding,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM cards c LEFT JOIN card_embeddings ce ON ce.card_id = c.card_id \
         WHERE ce.card_id IS NULL",
    )
    .fetch_one(&mut *tx)
    .await?;
    let (exposures_without_pack,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM exposures WHERE pack_id IS NULL OR pack_id = ''",
    )
    .fetch_one(&mut *tx)
    .await?;
    let (outcomes_without_event,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM outcomes o LEFT JOIN memory_events me ON me.event_id = o.event_id \
         WHERE me.event_id IS NULL",
    )
    .fetch_one(&mut *tx)
    .await?;

    let mut issues = Vec::new();
    if !seq_issues.is_empty() {
        issues.push(json!({"type": "seq_integrity", "details": seq_issues}));
    }
    if dup_idem > 0 {
        issues.push(json!({"type": "duplicate_idempotency_keys", "count": dup_idem}));
    }
    if cards_without_embedding > 0 {
        issues.push(json!({"type": "cards_without_embedding", "count": cards_without_embedding}));
    }
    if exposures_without_pack > 0 {
        issues.push(json!({"type": "exposures_without_pack", "count": exposures_without_pack}));
    }
    if outcomes_without_event > 0 {
        issues.push(json!({"type": "outcomes_without_event", "count": outcomes_without_event}));
    }

    Ok(json!({
        "healthy": issues.is_empty(),
        "issue_count": issues.len(),
        "issues": issues,
    }))
}

pub async fn consolidation_trend(
    tx: &mut Transaction<'_, Sqlite>,
    days: i64,
) -> Result<Vec<serde_json::Value>> {
    let rows: Vec<(String, i64, i64, i64, i64, i64, i64)> = sqlx::query_as(
        r#"
        SELECT substr(created_at, 1, 10) AS day,
               SUM(CASE WHEN event_type = 'candidate_proposed' THEN 1 ELSE 0 END) AS proposed,
               SUM(CASE WHEN event_type = 'card_admitted' THEN 1 ELSE 0 END) AS admitted,
               SUM(CASE WHEN event_type = 'card_rejected' THEN 1 ELSE 0 END) AS rejected,
               SUM(CASE WHEN event_type = 'card_merged' THEN 1 ELSE 0 END) AS merged,
               SUM(CASE WHEN event_type = 'card_superseded' THEN 1 ELSE 0 END) AS superseded,
               SUM(CASE WHEN event_type = 'card_archived' THEN 1 ELSE 0 END) AS archived
        FROM memory_events
        WHERE event_type IN ('candidate_proposed', 'card_admitted', 'card_rejected',
                              'card_merged', 'card_superseded', 'card_archived')
          AND created_at >= datetime('now', ?)
        GROUP BY day
        ORDER BY day
        "#,
    )
    .bind(format!("-{days} days"))
    .fetch_all(&mut *tx)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(day, proposed, admitted, rejected, merged, superseded, archived)| {
            json!({
                "day": day,
                "proposed": proposed,
                "admitted": admitted,
                "rejected": rejected,
                "merged": merged,
                "superseded": superseded,
                "archived": archived,
                "acceptance_rate": if proposed > 0 { Some(round4(admitted as f64 / proposed as f64)) } else { None },
            })
        })
        .collect())
}

fn round4(v: f64) -> f64 {
    (v * 1e4).round() / 1e4
}

pub async fn retrieval_window_metrics(
    tx: &mut Transaction<'_, Sqlite>,
    days: i64,
) -> Result<serde_json::Value> {
    let window = format!("-{days} days");
    let episode_row: (i64, i64, i64, i64) = sqlx::query_as(
        r#"
        WITH auto_pack_eps AS (
          SELECT DISTINCT episode_id FROM exposures
          WHERE channel = 'auto_pack' AND created_at >= datetime('now', ?)
        ),
        outcomes_by_episode AS (
          SELECT episode_id,
                 MAX(CASE WHEN outcome_type IN ('tool_success','user_confirmed_helpful') THEN 1 ELSE 0 END) AS has_positive,
                 MAX(CASE WHEN outcome_type IN ('tool_failure','user_corrected') THEN 1 ELSE 0 END) AS has_negative
          FROM outcomes
          WHERE created_at >= datetime('now', ?)
          GROUP BY episode_id
        )
        SELECT COUNT(*) AS auto_pack_episodes,
               COALESCE(SUM(COALESCE(o.has_positive, 0)), 0) AS positive_episode_count,
               COALESCE(SUM(COALESCE(o.has_negative, 0)), 0) AS negative_episode_count,
               COALESCE(SUM(CASE WHEN o.has_positive = 1 OR o.has_negative = 1 THEN 1 ELSE 0 END), 0) AS episodes_with_terminal_outcomes
        FROM auto_pack_eps a
        LEFT JOIN outcomes_by_episode o ON o.episode_id = a.episode_id
        "#,
    )
    .bind(&window)
    .bind(&window)
    .fetch_one(&mut *tx)
    .await?;

    let outcomes_row: (i64, i64) = sqlx::query_as(
        r#"
        SELECT COUNT(*) AS terminal_outcomes,
               COALESCE(SUM(CASE WHEN outcome_type = 'user_corrected' THEN 1 ELSE 0 END), 0) AS user_corrected_events
        FROM outcomes
        WHERE created_at >= datetime('now', ?)
          AND outcome_type IN ('tool_success','tool_failure','user_confirmed_helpful','user_corrected')
        "#,
    )
    .bind(&window)
    .fetch_one(&mut *tx)
    .await?;

    let (auto_pack_eps, pos_eps, neg_eps, eval_eps) = episode_row;
    let (terminal_outcomes, corrected) = outcomes_row;

    Ok(json!({
        "window_days": days,
        "auto_pack_episodes": auto_pack_eps,
        "episodes_with_terminal_outcomes": eval_eps,
        "positive_episode_count": pos_eps,
        "negative_episode_count": neg_eps,
        "precision_proxy": if eval_eps > 0 { Some(round4(pos_eps as f64 / eval_eps as f64)) } else { None },
        "terminal_outcomes": terminal_outcomes,
        "user_corrected_events": corrected,
        "correction_rate": if terminal_outcomes > 0 { Some(round4(corrected as f64 / terminal_outcomes as f64)) } else { None },
    }))
}

pub async fn retrieval_daily_trend(
    tx: &mut Transaction<'_, Sqlite>,
    days: i64,
) -> Result<Vec<serde_json::Value>> {
    let window = format!("-{days} days");
    let rows: Vec<(String, i64, i64, i64, i64, i64)> = sqlx::query_as(
        r#"
        WITH auto_pack_daily AS (
          SELECT substr(created_at, 1, 10) AS day, episode_id
          FROM exposures
          WHERE channel = 'auto_pack' AND created_at >= datetime('now', ?)
          GROUP BY day, episode_id
        ),
        outcome_daily AS (
          SELECT substr(created_at, 1, 10) AS day, episode_id,
                 MAX(CASE WHEN outcome_type IN ('tool_success','user_confirmed_helpful') THEN 1 ELSE 0 END) AS has_positive,
                 MAX(CASE WHEN outcome_type IN ('tool_failure','user_corrected') THEN 1 ELSE 0 END) AS has_negative,
                 SUM(CASE WHEN outcome_type = 'user_corrected' THEN 1 ELSE 0 END) AS corrected,
                 COUNT(*) AS terminal_count
          FROM outcomes
          WHERE created_at >= datetime('now', ?)
            AND outcome_type IN ('tool_success','tool_failure','user_confirmed_helpful','user_corrected')
          GROUP BY day, episode_id
        )
        SELECT a.day AS day,
               COUNT(*) AS auto_pack_episodes,
               COALESCE(SUM(COALESCE(o.has_positive, 0)), 0) AS positive_episode_count,
               COALESCE(SUM(COALESCE(o.has_negative, 0)), 0) AS negative_episode_count,
               COALESCE(SUM(COALESCE(o.corrected, 0)), 0) AS corrected_events,
               COALESCE(SUM(COALESCE(o.terminal_count, 0)), 0) AS terminal_events
        FROM auto_pack_daily a
        LEFT JOIN outcome_daily o ON o.episode_id = a.episode_id AND o.day = a.day
        GROUP BY a.day
        ORDER BY a.day
        "#,
    )
    .bind(&window)
    .bind(&window)
    .fetch_all(&mut *tx)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(day, auto_pack_episodes, positive, negative, corrected, terminal)| {
            let evaluated = positive + negative;
            json!({
                "day": day,
                "auto_pack_episodes": auto_pack_episodes,
                "positive_episode_count": positive,
                "negative_episode_count": negative,
                "precision_proxy": if evaluated > 0 { Some(round4(positive as f64 / evaluated as f64)) } else { None },
                "terminal_events": terminal,
                "corrected_events": corrected,
                "correction_rate": if terminal > 0 { Some(round4(corrected as f64 / terminal as f64)) } else { None },
            })
        })
        .collect())
}

pub async fn utility_summary(tx: &mut Transaction<'_, Sqlite>) -> Result<serde_json::Value> {
    let (tactic_cards, wins, losses, reuse): (i64, i64, i64, i64) = sqlx::query_as(
        "SELECT COUNT(*), COALESCE(SUM(wins), 0), COALESCE(SUM(losses), 0), COALESCE(SUM(reuse), 0) \
         FROM utility_stats",
    )
    .fetch_one(&mut *tx)
    .await?;
    let total = wins + losses;
    Ok(json!({
        "tactic_cards": tactic_cards,
        "wins": wins,
        "losses": losses,
        "reuse": reuse,
        "win_rate": if total > 0 { Some(round4(wins as f64 / total as f64)) } else { None },
    }))
}

pub async fn status_report(
    tx: &mut Transaction<'_, Sqlite>,
    db_path: &Path,
    days: i64,
) -> Result<serde_json::Value> {
    const TABLE_NAMES: [&str; 10] = [
        "episodes",
        "artifacts",
        "evidence_refs",
        "memory_events",
        "cards",
        "exposures",
        "outcomes",
        "pack_snapshots",
        "disputes",
        "utility_stats",
    ];
    let mut counts = serde_json::Map::new();
    for table in TABLE_NAMES {
        let (n,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table}")).fetch_one(&mut *tx).await?;
        counts.insert(table.to_string(), json!(n));
    }

    let cards_by_kind: Vec<(String, i64)> =
        sqlx::query_as("SELECT kind, COUNT(*) AS count FROM cards GROUP BY kind ORDER BY kind")
            .fetch_all(&mut *tx)
            .await?;
    let cards_by_status: Vec<(String, i64)> =
        sqlx::query_as("SELECT status, COUNT(*) AS count FROM cards GROUP BY status ORDER BY status")
            .fetch_all(&mut *tx)
            .await?;
    let cards_by_scope: Vec<(String, i64)> = sqlx::query_as(
        "SELECT scope_tier, COUNT(*) AS count FROM cards GROUP BY scope_tier ORDER BY scope_tier",
    )
    .fetch_all(&mut *tx)
    .await?;

    Ok(json!({
        "db_path": db_path.to_string_lossy(),
        "generated_at": super::now_iso(),
        "projection_digest": projection_digest(tx).await?,
        "health": check_store_health(tx).await?,
        "counts": counts,
        "cards_breakdown": {
            "by_kind": cards_by_kind.into_iter().map(|(kind, count)| json!({"kind": kind, "count": count})).collect::<Vec<_>>(),
            "by_status": cards_by_status.into_iter().map(|(status, count)| json!({"status": status, "count": count})).collect::<Vec<_>>(),
            "by_scope_tier": cards_by_scope.into_iter().map(|(scope_tier, count)| json!({"scope_tier": scope_tier, "count": count})).collect::<Vec<_>>(),
        },
        "consolidation_trend": consolidation_trend(tx, days).await?,
        "retrieval_window": retrieval_window_metrics(tx, days).await?,
        "retrieval_daily": retrieval_daily_trend(tx, days).await?,
        "utility_summary": utility_summary(tx).await?,
    }))
}

pub async fn recover_partial_writes(
    tx: &mut Transaction<'_, Sqlite>,
    producer: &str,
    run_missing_consolidation: bool,
) -> Result<serde_json::Value> {
    let mut episode_recorded_events = 0i64;
    let mut artifact_recorded_events = 0i64;
    let mut evidence_ref_recorded_events = 0i64;
    let mut consolidation_triggered_events = 0i64;
    let mut consolidation_runs = 0i64;

    let ev_rows: Vec<(String, String, String)> = sqlx::query_as(
        "SELECT episode_id, event_type, payload_json FROM memory_events \
         WHERE event_type IN ('episode_recorded', 'artifact_recorded', 'evidence_ref_recorded', \
         'consolidation_triggered', 'candidate_proposed')",
    )
    .fetch_all(&mut *tx)
    .await?;

    let mut episode_recorded = std::collections::HashSet::new();
    let mut artifact_recorded = std::collections::HashSet::new();
    let mut evidence_recorded = std::collections::HashSet::new();
    let mut consolidation_triggered = std::collections::HashSet::new();
    let mut consolidated = std::collections::HashSet::new();

    for (episode_id, event_type, payload_json) in ev_rows {
        let payload: serde_json::Value = serde_json::from_str(&payload_json).unwrap_or(json!({}));
        match event_type.as_str() {
            "episode_recorded" => {
                episode_recorded.insert(episode_id);
            }
            "artifact_recorded" => {
                if let Some(aid) = payload.get("artifact_id").and_then(|v| v.as_str()) {
                    artifact_recorded.insert(aid.to_string());
                }
            }
            "evidence_ref_recorded" => {
                if let Some(eid) = payload.get("evidence_ref_id").and_then(|v| v.as_str()) {
                    evidence_recorded.insert(eid.to_string());
                }
            }
            "consolidation_triggered" => {
                consolidation_triggered.insert(episode_id);
            }
            "candidate_proposed" => {
                consolidated.insert(episode_id);
            }
            _ => {}
        }
    }

    let episodes: Vec<(String, String)> =
        sqlx::query_as("SELECT episode_id, payload_hash FROM episodes ORDER BY episode_id")
            .fetch_all(&mut *tx)
            .await?;

    for (episode_id, payload_hash) in &episodes {
        if !episode_recorded.contains(episode_id) {
            let res = append_event(
                tx,
                episode_id,
                EventType::EpisodeRecorded,
                &json!({
                    "schema_version": rules::SCHEMA_VERSION,
                    "episode_id": episode_id,
                    "payload_hash": payload_hash,
                }),
                &format!("episode_recorded:{episode_id}:{payload_hash}"),
                producer,
                rules::RULE_VERSION,
                true,
            )
            .await?;
            if res.inserted {
                episode_recorded_events += 1;
            }
        }

        if !consolidation_triggered.contains(episode_id) {
            let res = append_event(
                tx,
                episode_id,
                EventType::ConsolidationTriggered,
                &json!({
                    "schema_version": rules::SCHEMA_VERSION,
                    "episode_id": episode_id,
                    "trigger": "recovery_missing_trigger",
                }),
                &format!("consolidation_triggered:{episode_id}"),
                producer,
                rules::RULE_VERSION,
                true,
            )
            .await?;
            if res.inserted {
                consolidation_triggered_events += 1;
            }
        }
    }

    let artifacts: Vec<(String, String, String, String)> = sqlx::query_as(
        "SELECT artifact_id, episode_id, artifact_kind, content_hash FROM artifacts ORDER BY artifact_id",
    )
    .fetch_all(&mut *tx)
    .await?;
    for (artifact_id, episode_id, artifact_kind, content_hash) in artifacts {
        if artifact_recorded.contains(&artifact_id) {
            continue;
        }
        let res = append_event(
            tx,
            &episode_id,
            EventType::ArtifactRecorded,
            &json!({
                "schema_version": rules::SCHEMA_VERSION,
                "artifact_id": artifact_id,
                "artifact_kind": artifact_kind,
                "content_hash": content_hash,
            }),
            &format!("artifact_recorded:{episode_id}:{artifact_id}:{content_hash}"),
            producer,
            rules::RULE_VERSION,
            true,
        )
        .await?;
        if res.inserted {
            artifact_recorded_events += 1;
        }
    }

    let evidence: Vec<(String, String, String, String)> = sqlx::query_as(
        "SELECT evidence_ref_id, episode_id, ref_kind, ref_hash FROM evidence_refs ORDER BY evidence_ref_id",
    )
    .fetch_all(&mut *tx)
    .await?;
    for (evidence_ref_id, episode_id, ref_kind, ref_hash) in evidence {
        if evidence_recorded.contains(&evidence_ref_id) {
            continue;
        }
        let res = append_event(
            tx,
            &episode_id,
            EventType::EvidenceRefRecorded,
            &json!({
                "schema_version": rules::SCHEMA_VERSION,
                "evidence_ref_id": evidence_ref_id,
                "ref_kind": ref_kind,
                "ref_hash": ref_hash,
            }),
            &format!("evidence_ref_recorded:{episode_id}:{evidence_ref_id}:{ref_hash}"),
            producer,
            rules::RULE_VERSION,
            true,
        )
        .await?;
        if res.inserted {
            evidence_ref_recorded_events += 1;
        }
    }

    if run_missing_consolidation {
        for (episode_id, _) in &episodes {
            if consolidated.contains(episode_id) {
                continue;
            }
            let (ev_count,): (i64,) =
                sqlx::query_as("SELECT COUNT(*) FROM evidence_refs WHERE episode_id = ?")
                    .bind(episode_id)
                    .fetch_one(&mut *tx)
                    .await?;
            if ev_count == 0 {
                continue;
            }
            crate::engine::consolidation::consolidate_episode(tx, episode_id, producer).await?;
            consolidation_runs += 1;
        }
    }

    Ok(json!({
        "episode_recorded_events": episode_recorded_events,
        "artifact_recorded_events": artifact_recorded_events,
        "evidence_ref_recorded_events": evidence_ref_recorded_events,
        "consolidation_triggered_events": consolidation_triggered_events,
        "consolidation_runs": consolidation_runs,
    }))
}

/// Wipes every derived projection table and replays `memory_events` through
/// the reducer in `event_id` order. The canonical log itself is untouched.
pub async fn replay_reducers(tx: &mut Transaction<'_, Sqlite>) -> Result<serde_json::Value> {
    for table in [
        "exposures",
        "pack_snapshots",
        "disputes",
        "card_status_history",
        "utility_stats",
        "outcomes",
        "card_evidence_refs",
        "card_embeddings",
        "cards_fts",
        "consolidation_decisions",
        "consolidation_ledger",
        "cards",
    ] {
        sqlx::query(&format!("DELETE FROM {table}")).execute(&mut *tx).await?;
    }

    let rows: Vec<(i64, String, String, String, String)> = sqlx::query_as(
        "SELECT event_id, episode_id, event_type, payload_json, created_at \
         FROM memory_events ORDER BY event_id",
    )
    .fetch_all(&mut *tx)
    .await?;

    let replayed = rows.len();
    for (event_id, episode_id, event_type, payload_json, created_at) in rows {
        let payload: serde_json::Value = serde_json::from_str(&payload_json)?;
        let event_type: EventType = event_type.parse()?;
        crate::engine::reducer::apply_event(tx, event_id, &episode_id, event_type, &payload, &created_at).await?;
    }

    Ok(json!({ "events_replayed": replayed }))
}

pub async fn full_rebuild(tx: &mut Transaction<'_, Sqlite>, verify_stability: bool) -> Result<serde_json::Value> {
    let before_counts = snapshot_projection_counts(tx).await?;
    let before_digest = projection_digest(tx).await?;
    let replay_result = replay_reducers(tx).await?;
    let after_counts = snapshot_projection_counts(tx).await?;
    let after_digest = projection_digest(tx).await?;

    let verification = if verify_stability {
        replay_reducers(tx).await?;
        let second_digest = projection_digest(tx).await?;
        json!({
            "verified": second_digest == after_digest,
            "post_rebuild_digest": after_digest,
            "second_rebuild_digest": second_digest,
        })
    } else {
        json!({
            "verified": serde_json::Value::Null,
            "post_rebuild_digest": after_digest,
            "second_rebuild_digest": serde_json::Value::Null,
        })
    };

    Ok(json!({
        "replay": replay_result,
        "before_counts": before_counts,
        "after_counts": after_counts,
        "digest_changed": before_digest != after_digest,
        "verification": verification,
    }))
}

pub async fn verify_reducer_idempotency(
    tx: &mut Transaction<'_, Sqlite>,
    sample_events: i64,
) -> Result<serde_json::Value> {
    let initial_digest = projection_digest(tx).await?;
    replay_reducers(tx).await?;
    let first_digest = projection_digest(tx).await?;
    replay_reducers(tx).await?;
    let second_digest = projection_digest(tx).await?;

    let sample_rows: Vec<(String, String, String, String, String, String)> = sqlx::query_as(
        "SELECT episode_id, event_type, payload_json, idempotency_key, producer, rule_version \
         FROM memory_events ORDER BY event_id LIMIT ?",
    )
    .bind(sample_events)
    .fetch_all(&mut *tx)
    .await?;

    let mut inserted_on_retry = 0i64;
    let sampled = sample_rows.len();
    for (episode_id, event_type, payload_json, idempotency_key, producer, rule_version) in sample_rows {
        let payload: serde_json::Value = serde_json::from_str(&payload_json)?;
        let event_type: EventType = event_type.parse()?;
        let res = append_event(tx, &episode_id, event_type, &payload, &idempotency_key, &producer, &rule_version, false)
            .await?;
        if res.inserted {
            inserted_on_retry += 1;
        }
    }

    let seq_issues = seq_integrity_issues(tx).await?;
    let stable_after_replay = first_digest == second_digest;

    Ok(json!({
        "stable_after_replay": stable_after_replay,
        "initial_digest": initial_digest,
        "first_replay_digest": first_digest,
        "second_replay_digest": second_digest,
        "initial_projection_matched_replay": initial_digest == first_digest,
        "sampled_events": sampled,
        "inserted_on_retry": inserted_on_retry,
        "seq_integrity_issue_count": seq_issues.len(),
        "pass": stable_after_replay && inserted_on_retry == 0 && seq_issues.is_empty(),
    }))
}

pub async fn migrate_embeddings(
    tx: &mut Transaction<'_, Sqlite>,
    to_model: &str,
    dim: usize,
    from_model: Option<&str>,
) -> Result<serde_json::Value> {
    let rows: Vec<(String, String, i64)> = match from_model {
        Some(from) => {
            sqlx::query_as(
                "SELECT c.card_id, c.statement, c.updated_event_id FROM cards c \
                 LEFT JOIN card_embeddings ce ON ce.card_id = c.card_id \
                 WHERE COALESCE(ce.embedding_model, 'pseudo-v1') = ? ORDER BY c.card_id",
            )
            .bind(from)
            .fetch_all(&mut *tx)
            .await?
        }
        None => {
            sqlx::query_as("SELECT card_id, statement, updated_event_id FROM cards ORDER BY card_id")
                .fetch_all(&mut *tx)
                .await?
        }
    };

    let mut migrated = 0i64;
    for (card_id, statement, updated_event_id) in rows {
        let vec = pseudo_embedding(&statement, dim, to_model);
        sqlx::query(
            "INSERT OR REPLACE INTO card_embeddings (card_id, embedding_model, embedding_vector, updated_event_id) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(&card_id)
        .bind(to_model)
        .bind(canonical_json(&serde_json::to_value(vec).unwrap()))
        .bind(updated_event_id)
        .execute(&mut *tx)
        .await?;
        migrated += 1;
    }

    Ok(json!({
        "migrated_cards": migrated,
        "to_model": to_model,
        "from_model": from_model,
        "dim": dim,
    }))
}

async fn outcome_rate_window(
    tx: &mut Transaction<'_, Sqlite>,
    window_days: i64,
    offset_days: i64,
) -> Result<serde_json::Value> {
    let lower = format!("-{} days", window_days + offset_days);
    let upper = format!("-{offset_days} days");
    let (positive, total): (i64, i64) = sqlx::query_as(
        r#"
        SELECT COALESCE(SUM(CASE WHEN outcome_type IN ('tool_success','user_confirmed_helpful') THEN 1 ELSE 0 END), 0) AS positive,
               COUNT(*) AS total
        FROM outcomes
        WHERE created_at >= datetime('now', ?) AND created_at < datetime('now', ?)
          AND outcome_type IN ('tool_success','tool_failure','user_confirmed_helpful','user_corrected')
        "#,
    )
    .bind(&lower)
    .bind(&upper)
    .fetch_one(&mut *tx)
    .await?;

    Ok(json!({
        "window_days": window_days,
        "offset_days": offset_days,
        "total": total,
        "positive": positive,
        "success_rate": if total > 0 { Some(round4(positive as f64 / total as f64)) } else { None },
    }))
}

pub async fn evaluate_causal_gates(tx: &mut Transaction<'_, Sqlite>, days: i64) -> Result<serde_json::Value> {
    let retrieval = retrieval_window_metrics(tx, days).await?;
    let auto_pack_sample = retrieval["episodes_with_terminal_outcomes"].as_i64().unwrap_or(0);
    let precision = retrieval["precision_proxy"].as_f64();
    let correction = retrieval["correction_rate"].as_f64();

    let retrieval_stability = auto_pack_sample >= rules::GATE_MIN_SAMPLE_EPISODES
        && precision.map(|p| p >= rules::GATE_MIN_PRECISION_PROXY).unwrap_or(false)
        && correction.map(|c| c <= rules::GATE_MAX_CORRECTION_RATE).unwrap_or(false);

    let (active_cards,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM cards WHERE status IN ('active', 'needs_recheck')")
            .fetch_one(&mut *tx)
            .await?;
    let (admitted_7d,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM memory_events WHERE event_type = 'card_admitted' AND created_at >= datetime('now', '-7 days')",
    )
    .fetch_one(&mut *tx)
    .await?;
    let (retired_7d,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM memory_events WHERE event_type IN ('card_archived', 'card_deprecated', 'card_superseded') \
         AND created_at >= datetime('now', '-7 days')",
    )
    .fetch_one(&mut *tx)
    .await?;
    let net_growth_7d = admitted_7d - retired_7d;
    let allowed_growth = (active_cards as f64 * rules::GATE_MAX_BOUNDEDNESS_GROWTH_RATIO)
        .max(rules::GATE_MIN_BOUNDEDNESS_GROWTH_FLOOR) as i64;
    let store_boundedness = net_growth_7d <= allowed_growth;

    let half = (days / 2).max(1);
    let recent = outcome_rate_window(tx, half, 0).await?;
    let prior = outcome_rate_window(tx, half, half).await?;
    let improvement = match (recent["success_rate"].as_f64(), prior["success_rate"].as_f64()) {
        (Some(r), Some(p)) => Some(round4(r - p)),
        _ => None,
    };
    let utility_plateau = recent["total"].as_i64().unwrap_or(0) >= rules::GATE_MIN_SAMPLE_EPISODES
        && prior["total"].as_i64().unwrap_or(0) >= rules::GATE_MIN_SAMPLE_EPISODES
        && improvement.map(|i: f64| i.abs() <= rules::GATE_PLATEAU_DELTA).unwrap_or(false);

    let (events_7d,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM memory_events WHERE created_at >= datetime('now', '-7 days')",
    )
    .fetch_one(&mut *tx)
    .await?;
    let event_volume_sufficient = events_7d >= rules::GATE_MIN_EVENTS_7D;

    let ready = retrieval_stability && store_boundedness && utility_plateau && event_volume_sufficient;

    Ok(json!({
        "window_days": days,
        "retrieval_stability": retrieval_stability,
        "store_boundedness": store_boundedness,
        "utility_plateau": utility_plateau,
        "event_volume_sufficient": event_volume_sufficient,
        "ready_for_causal_instrumentation": ready,
        "metrics": {
            "retrieval": retrieval,
            "active_cards": active_cards,
            "admitted_7d": admitted_7d,
            "retired_7d": retired_7d,
            "net_growth_7d": net_growth_7d,
            "allowed_growth_7d": allowed_growth,
            "success_rate_recent": recent,
            "success_rate_prior": prior,
            "improvement": improvement,
            "events_7d": events_7d,
        },
        "thresholds": {
            "min_sample_episodes": rules::GATE_MIN_SAMPLE_EPISODES,
            "min_precision_proxy": rules::GATE_MIN_PRECISION_PROXY,
            "max_correction_rate": rules::GATE_MAX_CORRECTION_RATE,
            "max_boundedness_growth_ratio": rules::GATE_MAX_BOUNDEDNESS_GROWTH_RATIO,
            "plateau_delta": rules::GATE_PLATEAU_DELTA,
            "min_events_7d": rules::GATE_MIN_EVENTS_7D,
        },
    }))
}

pub async fn export_episode(tx: &mut Transaction<'_, Sqlite>, episode_id: &str) -> Result<Vec<serde_json::Value>> {
    let rows: Vec<(i64, i64, String, String, String)> = sqlx::query_as(
        "SELECT event_id, seq_no, event_type, payload_json, created_at \
         FROM memory_events WHERE episode_id = ? ORDER BY seq_no",
    )
    .bind(episode_id)
    .fetch_all(&mut *tx)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(event_id, seq_no, event_type, payload_json, created_at)| {
            json!({
                "event_id": event_id,
                "seq_no": seq_no,
                "event_type": event_type,
                "payload": serde_json::from_str::<serde_json::Value>(&payload_json).unwrap_or(json!({})),
                "created_at": created_at,
            })
        })
        .collect())
}
