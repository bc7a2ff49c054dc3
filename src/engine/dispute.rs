//! Dispute accumulation, terminal outcomes, and the utility projection that
//! the retrieval scorer reads back from on every call.

use serde_json::json;
use sqlx::{Sqlite, Transaction};
use std::collections::HashMap;

use crate::error::{ArchiveError, Result};
use crate::rules;
use crate::text::{canonical_json, deterministic_id, sha256_text};
use crate::types::{AppendResult, EventType, EvidenceRefKind, OutcomeType};

use super::append_event;

pub struct DisputeResult {
    pub dispute_id: String,
    pub status_changed: bool,
}

pub async fn record_dispute(
    tx: &mut Transaction<'_, Sqlite>,
    episode_id: &str,
    card_id: &str,
    evidence_ref_id: &str,
    producer: &str,
) -> Result<DisputeResult> {
    let ref_row: Option<(String,)> =
        sqlx::query_as("SELECT ref_kind FROM evidence_refs WHERE evidence_ref_id = ?")
            .bind(evidence_ref_id)
            .fetch_optional(&mut *tx)
            .await?;
    let ref_kind: EvidenceRefKind = ref_row
        .ok_or_else(|| ArchiveError::NotFound(format!("evidence ref {evidence_ref_id}")))?
        .0
        .parse()?;
    let weight = rules::dispute_weight(ref_kind);
    let dispute_id = deterministic_id("disp", &[card_id, evidence_ref_id], 16);

    append_event(
        tx,
        episode_id,
        EventType::DisputeRecorded,
        &json!({
            "schema_version": rules::SCHEMA_VERSION,
            "dispute_id": dispute_id,
            "card_id": card_id,
            "evidence_ref_id": evidence_ref_id,
            "weight": weight,
        }),
        &format!("dispute_recorded:{card_id}:{evidence_ref_id}"),
        producer,
        rules::RULE_VERSION,
        true,
    )
    .await?;

    let card: Option<(String, String)> =
        sqlx::query_as("SELECT scope_tier, status FROM cards WHERE card_id = ?")
            .bind(card_id)
            .fetch_optional(&mut *tx)
            .await?;
    let (scope_tier, status) = match card {
        Some(c) => c,
        None => return Ok(DisputeResult { dispute_id, status_changed: false }),
    };

    let (mass,): (f64,) =
        sqlx::query_as("SELECT COALESCE(SUM(weight), 0.0) FROM disputes WHERE card_id = ?")
            .bind(card_id)
            .fetch_one(&mut *tx)
            .await?;
    let threshold = rules::dispute_threshold(scope_tier.parse().unwrap_or(crate::types::ScopeTier::Global));

    let mut changed = false;
    if mass >= threshold && status == "active" {
        changed = true;
        append_event(
            tx,
            episode_id,
            EventType::CardStatusChanged,
            &json!({
                "schema_version": rules::SCHEMA_VERSION,
                "card_id": card_id,
                "from_status": "active",
                "to_status": "needs_recheck",
                "reason_code": "dispute_threshold_exceeded",
                "dispute_mass": mass,
                "threshold": threshold,
            }),
            &format!("card_status_changed:{card_id}:needs_recheck:{threshold}"),
            producer,
            rules::RULE_VERSION,
            true,
        )
        .await?;
    }

    Ok(DisputeResult { dispute_id, status_changed: changed })
}

pub async fn record_outcome(
    tx: &mut Transaction<'_, Sqlite>,
    episode_id: &str,
    outcome_type: OutcomeType,
    evidence_ref_ids: &[String],
    metadata: &serde_json::Value,
    producer: &str,
) -> Result<AppendResult> {
    let mut sorted_ids = evidence_ref_ids.to_vec();
    sorted_ids.sort();
    let key_payload = canonical_json(&json!({
        "episode_id": episode_id,
        "outcome_type": outcome_type.as_str(),
        "evidence_ref_ids": sorted_ids,
        "metadata": metadata,
    }));
    let idem = format!("outcome_recorded:{}", &sha256_text(&key_payload)[..24]);

    append_event(
        tx,
        episode_id,
        EventType::OutcomeRecorded,
        &json!({
            "schema_version": rules::SCHEMA_VERSION,
            "outcome_type": outcome_type.as_str(),
            "evidence_ref_ids": evidence_ref_ids,
            "metadata_json": metadata,
        }),
        &idem,
        producer,
        rules::RULE_VERSION,
        true,
    )
    .await
}

struct CardStat {
    wins: i64,
    losses: i64,
    reuse: i64,
}

/// Rebuilt from scratch on every exposure/outcome event: reuse counts come
/// straight from `tactic`-kind exposures, win/loss attribution walks each
/// episode's outcomes in `seq_no` order and credits up to the 2 most recent
/// `auto_pack` tactic-card exposures preceding the first terminal outcome.
pub(crate) async fn recompute_utility_projection(tx: &mut Transaction<'_, Sqlite>) -> Result<()> {
    sqlx::query("DELETE FROM utility_stats").execute(&mut *tx).await?;

    let reuse_rows: Vec<(String, i64, i64)> = sqlx::query_as(
        r#"
        SELECT e.card_id, COUNT(*) AS reuse, MAX(e.source_event_id) AS last_event
        FROM exposures e
        JOIN cards c ON c.card_id = e.card_id
        WHERE c.kind = 'tactic'
        GROUP BY e.card_id
        "#,
    )
    .fetch_all(&mut *tx)
    .await?;

    let mut stats: HashMap<String, CardStat> = HashMap::new();
    let mut updated_event: HashMap<String, i64> = HashMap::new();
    for (card_id, reuse, last_event) in reuse_rows {
        stats.insert(card_id.clone(), CardStat { wins: 0, losses: 0, reuse });
        updated_event.insert(card_id, last_event);
    }

    let episodes: Vec<(String,)> =
        sqlx::query_as("SELECT DISTINCT episode_id FROM outcomes").fetch_all(&mut *tx).await?;

    for (episode_id,) in episodes {
        let outcome_rows: Vec<(i64, String, String, i64)> = sqlx::query_as(
            r#"
            SELECT o.event_id, o.outcome_type, o.evidence_ref_ids_json, me.seq_no
            FROM outcomes o
            JOIN memory_events me ON me.event_id = o.event_id
            WHERE o.episode_id = ?
            ORDER BY me.seq_no ASC
            "#,
        )
        .bind(&episode_id)
        .fetch_all(&mut *tx)
        .await?;
        if outcome_rows.is_empty() {
            continue;
        }

        let mut anchored_present = false;
        let mut success_signal = false;
        let mut failure_signal = false;
        let mut first_terminal_seq: Option<i64> = None;
        let mut first_terminal_event = 0i64;

        for (event_id, outcome_type, evidence_ref_ids_json, seq_no) in &outcome_rows {
            let evidence_ids: Vec<String> = serde_json::from_str(evidence_ref_ids_json).unwrap_or_default();
            if !evidence_ids.is_empty() {
                anchored_present = true;
            }
            let ot: OutcomeType = outcome_type.parse().unwrap_or(OutcomeType::ToolSuccess);
            if ot.is_success() {
                success_signal = true;
            }
            if ot.is_failure() {
                failure_signal = true;
            }
            if first_terminal_seq.is_none() {
                first_terminal_seq = Some(*seq_no);
                first_terminal_event = *event_id;
            }
        }

        let first_terminal_seq = match (anchored_present, first_terminal_seq) {
            (true, Some(s)) => s,
            _ => continue,
        };

        let exp_rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT e.card_id
            FROM exposures e
            JOIN cards c ON c.card_id = e.card_id
            JOIN memory_events me ON me.event_id = e.source_event_id
            WHERE e.episode_id = ? AND e.channel = 'auto_pack' AND c.kind = 'tactic'
              AND me.seq_no < ?
            ORDER BY e.rank_position ASC, e.score_total DESC, e.card_id ASC
            "#,
        )
        .bind(&episode_id)
        .bind(first_terminal_seq)
        .fetch_all(&mut *tx)
        .await?;

        for (card_id,) in exp_rows.into_iter().take(2) {
            let entry = stats.entry(card_id.clone()).or_insert(CardStat { wins: 0, losses: 0, reuse: 0 });
            if success_signal {
                entry.wins += 1;
            }
            if failure_signal {
                entry.losses += 1;
            }
            let slot = updated_event.entry(card_id).or_insert(0);
            *slot = (*slot).max(first_terminal_event);
        }
    }

    for (card_id, stat) in &stats {
        sqlx::query(
            "INSERT OR REPLACE INTO utility_stats (card_id, wins, losses, reuse, updated_event_id) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(card_id)
        .bind(stat.wins)
        .bind(stat.losses)
        .bind(stat.reuse)
        .bind(updated_event.get(card_id).copied().unwrap_or(0))
        .execute(&mut *tx)
        .await?;
    }

    Ok(())
}
