//! Search, ranking, and pack assembly: the read side of the store. Nothing
//! here mutates except `build_pack`, which appends a single
//! `exposure_recorded` event capturing the ranked list and the selection it
//! made from it.

use std::collections::{HashMap, HashSet};

use serde_json::json;
use sqlx::{Sqlite, Transaction};
use uuid::Uuid;

use crate::error::{ArchiveError, Result};
use crate::rules;
use crate::text::{cosine_from_vectors, deterministic_id, jaccard_similarity, pseudo_embedding};
use crate::types::{AppendResult, CardKind, Channel, EventType, ScopeTier, ScoredCard};

use super::append_event;

pub async fn get_episode_scope(
    tx: &mut Transaction<'_, Sqlite>,
    episode_id: &str,
) -> Result<(ScopeTier, String)> {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT metadata_json FROM episodes WHERE episode_id = ?")
            .bind(episode_id)
            .fetch_optional(&mut *tx)
            .await?;
    let metadata_json = match row {
        Some((m,)) => m,
        None => return Ok((ScopeTier::Repo, "default".to_string())),
    };
    let metadata: serde_json::Value = serde_json::from_str(&metadata_json).unwrap_or(json!({}));
    let scope_tier = metadata
        .get("scope_tier")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse().ok())
        .unwrap_or(ScopeTier::Repo);
    let scope_id = metadata.get("scope_id").and_then(|v| v.as_str()).unwrap_or("default").to_string();
    Ok((scope_tier, scope_id))
}

pub async fn archive_hygiene_pass(
    tx: &mut Transaction<'_, Sqlite>,
    episode_id: &str,
    producer: &str,
) -> Result<usize> {
    let cutoff = (chrono::Utc::now() - chrono::Duration::days(rules::ARCHIVE_HYGIENE_STALE_DAYS))
        .to_rfc3339_opts(chrono::SecondsFormat::Secs, true);

    let rows: Vec<(String, i64, i64, i64, Option<String>, f64)> = sqlx::query_as(
        r#"
        SELECT c.card_id,
               COALESCE(u.wins, 0) AS wins,
               COALESCE(u.losses, 0) AS losses,
               COALESCE(u.reuse, 0) AS reuse,
               (SELECT MAX(e.created_at) FROM exposures e WHERE e.card_id = c.card_id) AS last_exposed,
               (SELECT COALESCE(SUM(d.weight), 0.0) FROM disputes d WHERE d.card_id = c.card_id) AS dispute_mass
        FROM cards c
        LEFT JOIN utility_stats u ON u.card_id = c.card_id
        WHERE c.status = 'active'
        "#,
    )
    .fetch_all(&mut *tx)
    .await?;

    let mut archived = 0usize;
    for (card_id, wins, losses, reuse, last_exposed, dispute_mass) in rows {
        let utility = (wins - losses) as f64 + 0.1 * reuse as f64;
        if dispute_mass > 0.0 || utility > 0.0 {
            continue;
        }
        let last_exposed = match last_exposed {
            Some(t) => t,
            None => continue,
        };
        if last_exposed.as_str() > cutoff.as_str() {
            continue;
        }
        append_event(
            tx,
            episode_id,
            EventType::CardArchived,
            &json!({
                "schema_version": rules::SCHEMA_VERSION,
                "card_id": card_id,
                "reason_code": "archive_hygiene_low_signal",
            }),
            &format!("archive_hygiene:{card_id}"),
            producer,
            rules::RULE_VERSION,
            true,
        )
        .await?;
        archived += 1;
    }
    Ok(archived)
}

pub fn scope_score(desired_tier: ScopeTier, desired_scope_id: &str, card_tier: ScopeTier, card_scope_id: &str) -> f64 {
    if desired_tier == card_tier && desired_scope_id == card_scope_id {
        return 1.0;
    }
    fn tier_rank(t: ScopeTier) -> u8 {
        match t {
            ScopeTier::Repo => 3,
            ScopeTier::Domain => 2,
            ScopeTier::Global => 1,
        }
    }
    if tier_rank(card_tier) > tier_rank(desired_tier) {
        return 0.2;
    }
    if card_tier == desired_tier {
        return 0.8;
    }
    match card_tier {
        ScopeTier::Global => 0.6,
        ScopeTier::Domain => 0.7,
        ScopeTier::Repo => 0.5,
    }
}

pub fn status_weight(status: &str, mode: Channel) -> f64 {
    if matches!(mode, Channel::AutoPack) {
        match status {
            "active" => 1.0,
            "needs_recheck" => 0.35,
            "deprecated" => 0.15,
            "archived" => 0.1,
            _ => 0.1,
        }
    } else {
        match status {
            "active" => 1.0,
            "needs_recheck" => 0.8,
            "deprecated" => 0.65,
            "archived" => 0.6,
            _ => 0.5,
        }
    }
}

pub async fn retrieve_cards(
    tx: &mut Transaction<'_, Sqlite>,
    query: &str,
    episode_id: Option<&str>,
    include_archived: bool,
    limit: usize,
    mode: Channel,
) -> Result<Vec<ScoredCard>> {
    let (scope_tier, scope_id) = match episode_id {
        Some(ep) => get_episode_scope(tx, ep).await?,
        None => (ScopeTier::Repo, "default".to_string()),
    };

    let status_clause = if include_archived || !matches!(mode, Channel::AutoPack) {
        "status IN ('active', 'needs_recheck', 'deprecated', 'archived')"
    } else {
        "status IN ('active', 'needs_recheck')"
    };

    let sql = format!(
        r#"
        SELECT c.card_id, c.kind, c.statement, c.scope_tier, c.scope_id, c.topic_key,
               c.status, c.updated_event_id,
               COALESCE(u.wins, 0) AS wins,
               COALESCE(u.losses, 0) AS losses,
               COALESCE(u.reuse, 0) AS reuse,
               COALESCE(ce.embedding_model, 'pseudo-v1') AS embedding_model,
               COALESCE(ce.embedding_vector, '[]') AS embedding_vector
        FROM cards c
        LEFT JOIN utility_stats u ON u.card_id = c.card_id
        LEFT JOIN card_embeddings ce ON ce.card_id = c.card_id
        WHERE {status_clause}
        "#
    );
    let rows: Vec<(String, String, String, String, String, String, String, i64, i64, i64, i64, String, String)> =
        sqlx::query_as(&sql).fetch_all(&mut *tx).await?;

    let (max_event_id,): (i64,) =
        sqlx::query_as("SELECT COALESCE(MAX(event_id), 1) FROM memory_events")
            .fetch_one(&mut *tx)
            .await?;

    let mut query_vec_cache: HashMap<String, Vec<f64>> = HashMap::new();
    let mut out = Vec::with_capacity(rows.len());

    for (card_id, kind, statement, card_scope_tier, card_scope_id, topic_key, status, updated_event_id, wins, losses, reuse, embedding_model, embedding_vector) in rows {
        let kind: CardKind = kind.parse()?;
        let card_tier: ScopeTier = card_scope_tier.parse()?;

        let lexical = jaccard_similarity(query, &statement);
        let emb: Vec<f64> = serde_json::from_str(&embedding_vector).unwrap_or_default();
        let query_vec = query_vec_cache
            .entry(embedding_model.clone())
            .or_insert_with(|| pseudo_embedding(query, rules::PSEUDO_EMBEDDING_DIM, &embedding_model));
        let semantic = cosine_from_vectors(query_vec, &emb);

        let scope = scope_score(scope_tier, &scope_id, card_tier, &card_scope_id);
        let kind_prior = rules::kind_prior(kind);
        let truth = status_weight(&status, mode);

        let utility = if matches!(kind, CardKind::Tactic) {
            let denom = (wins + losses).max(1) as f64;
            ((wins - losses) as f64 / denom) + (reuse as f64 / 10.0).min(1.0)
        } else {
            0.0
        };

        let recency = updated_event_id as f64 / max_event_id as f64;

        let mut score_total = rules::SCORE_WEIGHT_LEXICAL * lexical
            + rules::SCORE_WEIGHT_SEMANTIC * semantic
            + rules::SCORE_WEIGHT_SCOPE * scope
            + rules::SCORE_WEIGHT_KIND_PRIOR * kind_prior
            + rules::SCORE_WEIGHT_TRUTH * truth
            + rules::SCORE_WEIGHT_UTILITY * utility
            + rules::SCORE_WEIGHT_RECENCY * recency;

        if matches!(mode, Channel::AutoPack) && status == "needs_recheck" {
            score_total *= rules::NEEDS_RECHECK_DAMPENING;
        }

        out.push(ScoredCard {
            card_id,
            kind,
            statement,
            scope_tier: card_tier,
            scope_id: card_scope_id,
            status: status.parse()?,
            updated_event_id,
            lexical: round6(lexical),
            semantic: round6(semantic),
            scope: round6(scope),
            kind_prior: round6(kind_prior),
            truth: round6(truth),
            utility: round6(utility),
            recency: round6(recency),
            score_total: round6(score_total),
        });
        let _ = topic_key;
    }

    out.sort_by(|a, b| {
        b.score_total
            .partial_cmp(&a.score_total)
            .unwrap()
            .then_with(|| rules::kind_priority(a.kind).cmp(&rules::kind_priority(b.kind)))
            .then_with(|| b.updated_event_id.cmp(&a.updated_event_id))
            .then_with(|| a.card_id.cmp(&b.card_id))
    });
    out.truncate(limit);
    Ok(out)
}

fn round6(v: f64) -> f64 {
    (v * 1e6).round() / 1e6
}

pub async fn card_evidence_ids(tx: &mut Transaction<'_, Sqlite>, card_id: &str) -> Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT evidence_ref_id FROM card_evidence_refs WHERE card_id = ? ORDER BY evidence_ref_id",
    )
    .bind(card_id)
    .fetch_all(&mut *tx)
    .await?;
    Ok(rows.into_iter().map(|(e,)| e).collect())
}

pub async fn has_recent_failure(tx: &mut Transaction<'_, Sqlite>, episode_id: &str) -> Result<bool> {
    let row: Option<(i64,)> = sqlx::query_as(
        "SELECT 1 FROM outcomes WHERE episode_id = ? AND outcome_type = 'tool_failure' \
         ORDER BY event_id DESC LIMIT 1",
    )
    .bind(episode_id)
    .fetch_optional(&mut *tx)
    .await?;
    Ok(row.is_some())
}

pub struct PackResult {
    pub episode_id: String,
    pub pack_id: String,
    pub channel: Channel,
    pub event_id: i64,
    pub selected_cards: Vec<serde_json::Value>,
    pub slot_counts: HashMap<String, usize>,
}

fn group_for_kind(kind: CardKind) -> &'static str {
    rules::pack_slot(kind)
}

pub async fn build_pack(
    tx: &mut Transaction<'_, Sqlite>,
    episode_id: &str,
    query: &str,
    channel: Channel,
    producer: &str,
) -> Result<PackResult> {
    archive_hygiene_pass(tx, episode_id, producer).await?;

    let ranked = retrieve_cards(
        tx,
        query,
        Some(episode_id),
        !matches!(channel, Channel::AutoPack),
        200,
        channel,
    )
    .await?;

    let mut selected: Vec<ScoredCard> = Vec::new();
    let mut topic_counts: HashMap<String, usize> = HashMap::new();
    let mut slot_counts: HashMap<String, usize> = [
        ("constraints_commitments".to_string(), 0usize),
        ("negative_result".to_string(), 0),
        ("tactic".to_string(), 0),
        ("fact".to_string(), 0),
    ]
    .into_iter()
    .collect();

    let recent_failure = has_recent_failure(tx, episode_id).await?;
    if recent_failure {
        for cand in &ranked {
            let topic = topic_key_of(cand);
            if matches!(cand.kind, CardKind::NegativeResult)
                && *topic_counts.get(&topic).unwrap_or(&0) < rules::PACK_TOPIC_CAP
            {
                let group = "negative_result";
                if slot_counts[group] < rules::pack_slot_cap(group) {
                    selected.push(cand.clone());
                    *slot_counts.get_mut(group).unwrap() += 1;
                    *topic_counts.entry(topic).or_insert(0) += 1;
                    break;
                }
            }
        }
    }

    let selected_ids: HashSet<String> = selected.iter().map(|c| c.card_id.clone()).collect();
    let mut selected_ids = selected_ids;
    for cand in &ranked {
        if selected.len() >= rules::PACK_TOTAL_CAP {
            break;
        }
        if selected_ids.contains(&cand.card_id) {
            continue;
        }
        let topic = topic_key_of(cand);
        if *topic_counts.get(&topic).unwrap_or(&0) >= rules::PACK_TOPIC_CAP {
            continue;
        }
        let group = group_for_kind(cand.kind);
        if slot_counts[group] >= rules::pack_slot_cap(group) {
            continue;
        }
        selected.push(cand.clone());
        selected_ids.insert(cand.card_id.clone());
        *slot_counts.get_mut(group).unwrap() += 1;
        *topic_counts.entry(topic).or_insert(0) += 1;
    }
    selected.truncate(rules::PACK_TOTAL_CAP);

    let pack_id = format!("pack_{}", &Uuid::new_v4().simple().to_string()[..16]);

    let ranked_for_snapshot: Vec<serde_json::Value> = ranked
        .iter()
        .take(100)
        .enumerate()
        .map(|(idx, c)| {
            json!({
                "rank": idx + 1,
                "card_id": c.card_id,
                "kind": c.kind.as_str(),
                "score_total": c.score_total,
                "score_components": {
                    "lexical": c.lexical,
                    "semantic": c.semantic,
                    "scope": c.scope,
                    "kind_prior": c.kind_prior,
                    "truth": c.truth,
                    "utility": c.utility,
                    "recency": c.recency,
                },
                "status": c.status.as_str(),
                "topic_key": topic_key_of(c),
            })
        })
        .collect();

    let mut selected_for_snapshot = Vec::with_capacity(selected.len());
    for (idx, c) in selected.iter().enumerate() {
        let evidence_ref_ids = card_evidence_ids(tx, &c.card_id).await?;
        selected_for_snapshot.push(json!({
            "rank": idx + 1,
            "card_id": c.card_id,
            "kind": c.kind.as_str(),
            "score_total": c.score_total,
            "status": c.status.as_str(),
            "topic_key": topic_key_of(c),
            "evidence_ref_ids": evidence_ref_ids,
        }));
    }

    let exposures: Vec<serde_json::Value> = selected
        .iter()
        .enumerate()
        .map(|(idx, c)| {
            json!({
                "exposure_id": deterministic_id("exp", &[&pack_id, &c.card_id, &(idx + 1).to_string()], 16),
                "card_id": c.card_id,
                "channel": channel.as_str(),
                "rank_position": idx + 1,
                "score_total": c.score_total,
            })
        })
        .collect();

    let payload = json!({
        "schema_version": rules::SCHEMA_VERSION,
        "channel": channel.as_str(),
        "pack_snapshot": {
            "pack_id": pack_id,
            "channel": channel.as_str(),
            "query_text": query,
            "policy_version": rules::RULE_VERSION,
            "ranked_candidates": ranked_for_snapshot,
            "selected_cards": selected_for_snapshot,
        },
        "exposures": exposures,
    });

    let AppendResult { event_id, .. } = append_event(
        tx,
        episode_id,
        EventType::ExposureRecorded,
        &payload,
        &format!("exposure_recorded:{episode_id}:{pack_id}"),
        producer,
        rules::RULE_VERSION,
        true,
    )
    .await?;

    Ok(PackResult {
        episode_id: episode_id.to_string(),
        pack_id,
        channel,
        event_id,
        selected_cards: selected_for_snapshot,
        slot_counts,
    })
}

fn topic_key_of(card: &ScoredCard) -> String {
    crate::text::topic_key(&card.statement)
}

pub async fn explain_pack(
    tx: &mut Transaction<'_, Sqlite>,
    episode_id: &str,
    pack_id: Option<&str>,
) -> Result<serde_json::Value> {
    let row: Option<(String, String, String, Option<String>, String, String, String)> = match pack_id {
        Some(pid) => {
            sqlx::query_as(
                "SELECT pack_id, episode_id, channel, query_text, policy_version, \
                 ranked_candidates_json, selected_cards_json FROM pack_snapshots WHERE pack_id = ?",
            )
            .bind(pid)
            .fetch_optional(&mut *tx)
            .await?
        }
        None => {
            sqlx::query_as(
                "SELECT pack_id, episode_id, channel, query_text, policy_version, \
                 ranked_candidates_json, selected_cards_json FROM pack_snapshots \
                 WHERE episode_id = ? ORDER BY created_at DESC, pack_id DESC LIMIT 1",
            )
            .bind(episode_id)
            .fetch_optional(&mut *tx)
            .await?
        }
    };
    let (pack_id, episode_id, channel, query_text, policy_version, ranked_json, selected_json) =
        row.ok_or_else(|| ArchiveError::NotFound("pack snapshot".to_string()))?;

    Ok(json!({
        "pack_id": pack_id,
        "episode_id": episode_id,
        "channel": channel,
        "query_text": query_text,
        "policy_version": policy_version,
        "ranked_candidates": serde_json::from_str::<serde_json::Value>(&ranked_json).unwrap_or(json!([])),
        "selected_cards": serde_json::from_str::<serde_json::Value>(&selected_json).unwrap_or(json!([])),
    }))
}

pub async fn explain_consolidation(
    tx: &mut Transaction<'_, Sqlite>,
    episode_id: &str,
) -> Result<Vec<serde_json::Value>> {
    let rows: Vec<(String, Option<String>, String, String)> = sqlx::query_as(
        "SELECT action, reason_code, details_json, created_at FROM consolidation_decisions \
         WHERE episode_id = ? ORDER BY decision_id",
    )
    .bind(episode_id)
    .fetch_all(&mut *tx)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(action, reason_code, details_json, created_at)| {
            json!({
                "action": action,
                "reason_code": reason_code,
                "details": serde_json::from_str::<serde_json::Value>(&details_json).unwrap_or(json!({})),
                "created_at": created_at,
            })
        })
        .collect())
}
