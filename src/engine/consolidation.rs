//! Deterministic consolidation: turns the evidence refs attached to an
//! episode into candidates, then runs them through the gate pipeline
//! (evidence invariant -> duplicate -> novelty -> per-kind cap -> episode
//! soft cap -> scope/kind budget -> exact-statement merge -> normative
//! supersession).

use serde_json::json;
use sqlx::{Sqlite, Transaction};
use std::collections::{BTreeMap, HashMap};

use crate::error::Result;
use crate::rules;
use crate::text::{contains_failure_signal, deterministic_id, normalize_statement, topic_key};
use crate::types::{Candidate, CardKind, EventType, ScopeTier};

use super::append_event;

pub struct ConsolidationSummary {
    pub episode_id: String,
    pub proposed: usize,
    pub admitted: usize,
    pub rejected: usize,
    pub merged: usize,
    pub superseded: usize,
}

pub async fn consolidate_episode(
    tx: &mut Transaction<'_, Sqlite>,
    episode_id: &str,
    producer: &str,
) -> Result<ConsolidationSummary> {
    let episode: Option<(String,)> =
        sqlx::query_as("SELECT metadata_json FROM episodes WHERE episode_id = ?")
            .bind(episode_id)
            .fetch_optional(&mut *tx)
            .await?;
    let metadata_json = episode
        .ok_or_else(|| crate::error::ArchiveError::NotFound(format!("episode {episode_id}")))?
        .0;
    let metadata: serde_json::Value = serde_json::from_str(&metadata_json).unwrap_or(json!({}));
    let scope_tier_str = metadata.get("scope_tier").and_then(|v| v.as_str()).unwrap_or("repo");
    let scope_tier: ScopeTier = scope_tier_str.parse().unwrap_or(ScopeTier::Repo);
    let scope_id = metadata.get("scope_id").and_then(|v| v.as_str()).unwrap_or("default").to_string();

    let ev_rows: Vec<(String, String, Option<String>)> = sqlx::query_as(
        "SELECT evidence_ref_id, ref_kind, excerpt_text FROM evidence_refs WHERE episode_id = ? \
         ORDER BY created_at, evidence_ref_id",
    )
    .bind(episode_id)
    .fetch_all(&mut *tx)
    .await?;

    let mut candidates = generate_candidates(episode_id, scope_tier, &scope_id, &ev_rows);
    candidates.sort_by(|a, b| {
        let ka = rules::kind_priority(a.kind);
        let kb = rules::kind_priority(b.kind);
        ka.cmp(&kb)
            .then_with(|| {
                normalize_statement(&a.statement, rules::MAX_STATEMENT_LEN)
                    .to_lowercase()
                    .cmp(&normalize_statement(&b.statement, rules::MAX_STATEMENT_LEN).to_lowercase())
            })
            .then_with(|| a.scope_tier.as_str().cmp(b.scope_tier.as_str()))
            .then_with(|| a.scope_id.cmp(&b.scope_id))
            .then_with(|| a.candidate_id.cmp(&b.candidate_id))
    });

    let mut admitted = 0usize;
    let mut rejected = 0usize;
    let mut merged = 0usize;
    let mut superseded = 0usize;

    let mut admitted_by_kind = count_episode_admitted_by_kind(tx, episode_id).await?;
    let mut admitted_total: u32 = admitted_by_kind.values().sum();

    for cand in &candidates {
        append_event(
            tx,
            episode_id,
            EventType::CandidateProposed,
            &json!({
                "schema_version": rules::SCHEMA_VERSION,
                "candidate_id": cand.candidate_id,
                "kind": cand.kind.as_str(),
                "statement": cand.statement,
                "scope_tier": cand.scope_tier.as_str(),
                "scope_id": cand.scope_id,
                "topic_key": cand.topic_key,
                "evidence_ref_ids": cand.evidence_ref_ids,
            }),
            &format!("candidate_proposed:{episode_id}:{}", cand.candidate_id),
            producer,
            rules::RULE_VERSION,
            true,
        )
        .await?;

        if let Err(reason) = validate_evidence_invariant(tx, cand).await? {
            rejected += 1;
            append_reject(
                tx,
                episode_id,
                cand,
                "missing_required_evidence",
                json!({ "invariant_reason": reason }),
                producer,
            )
            .await?;
            continue;
        }

        let best_match = find_best_similarity_match(tx, cand).await?;
        if let Some(m) = &best_match {
            if m.lexical >= rules::DUPLICATE_LEX_THRESHOLD && m.cosine >= rules::DUPLICATE_COS_THRESHOLD {
                rejected += 1;
                append_reject(
                    tx,
                    episode_id,
                    cand,
                    "duplicate_of_existing_card",
                    json!({ "matched_card_id": m.card_id, "lexical": m.lexical, "cosine": m.cosine }),
                    producer,
                )
                .await?;
                continue;
            }
            if m.lexical >= rules::NOVELTY_LEX_THRESHOLD || m.cosine >= rules::NOVELTY_COS_THRESHOLD {
                rejected += 1;
                append_reject(
                    tx,
                    episode_id,
                    cand,
                    "novelty_below_threshold",
                    json!({ "matched_card_id": m.card_id, "lexical": m.lexical, "cosine": m.cosine }),
                    producer,
                )
                .await?;
                continue;
            }
        }

        let kind_cap = rules::episode_kind_cap(cand.kind);
        if *admitted_by_kind.get(&cand.kind).unwrap_or(&0) >= kind_cap {
            rejected += 1;
            append_reject(tx, episode_id, cand, "episode_kind_cap_exceeded", json!({ "kind_cap": kind_cap }), producer)
                .await?;
            continue;
        }

        if admitted_total >= rules::EPISODE_SOFT_CAP {
            rejected += 1;
            append_reject(
                tx,
                episode_id,
                cand,
                "episode_soft_cap_exceeded",
                json!({ "soft_cap": rules::EPISODE_SOFT_CAP }),
                producer,
            )
            .await?;
            continue;
        }

        let (active_scope_count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM cards WHERE scope_tier = ? AND kind = ? AND status IN ('active', 'needs_recheck')",
        )
        .bind(cand.scope_tier.as_str())
        .bind(cand.kind.as_str())
        .fetch_one(&mut *tx)
        .await?;
        let budget = rules::budget_cap(cand.scope_tier, cand.kind);
        if active_scope_count as u32 >= budget {
            rejected += 1;
            append_reject(tx, episode_id, cand, "scope_kind_budget_exceeded", json!({ "budget": budget }), producer)
                .await?;
            continue;
        }

        if let Some(merge_target) = find_exact_merge_target(tx, cand).await? {
            merged += 1;
            append_event(
                tx,
                episode_id,
                EventType::CardMerged,
                &json!({
                    "schema_version": rules::SCHEMA_VERSION,
                    "candidate_id": cand.candidate_id,
                    "target_card_id": merge_target,
                    "evidence_ref_ids": cand.evidence_ref_ids,
                    "reason_code": "exact_statement_match",
                }),
                &format!("card_merged:{episode_id}:{}:{merge_target}", cand.candidate_id),
                producer,
                rules::RULE_VERSION,
                true,
            )
            .await?;
            continue;
        }

        let supersede_target = find_supersede_target(tx, cand).await?;
        let card_id = deterministic_id(
            "card",
            &[
                cand.kind.as_str(),
                cand.scope_tier.as_str(),
                &cand.scope_id,
                &normalize_statement(&cand.statement, rules::MAX_STATEMENT_LEN).to_lowercase(),
            ],
            16,
        );

        append_event(
            tx,
            episode_id,
            EventType::CardAdmitted,
            &json!({
                "schema_version": rules::SCHEMA_VERSION,
                "candidate_id": cand.candidate_id,
                "reason_code": "admitted",
                "card": {
                    "card_id": card_id,
                    "kind": cand.kind.as_str(),
                    "statement": cand.statement,
                    "scope_tier": cand.scope_tier.as_str(),
                    "scope_id": cand.scope_id,
                    "topic_key": cand.topic_key,
                    "tags": Vec::<String>::new(),
                    "status": "active",
                    "supersedes_card_id": supersede_target,
                    "evidence_ref_ids": cand.evidence_ref_ids,
                },
            }),
            &format!("card_admitted:{episode_id}:{}:{card_id}", cand.candidate_id),
            producer,
            rules::RULE_VERSION,
            true,
        )
        .await?;

        admitted += 1;
        *admitted_by_kind.entry(cand.kind).or_insert(0) += 1;
        admitted_total += 1;

        if let Some(old_card_id) = &supersede_target {
            superseded += 1;
            let prev_status: Option<(String,)> =
                sqlx::query_as("SELECT status FROM cards WHERE card_id = ?")
                    .bind(old_card_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            let from_status = prev_status.map(|(s,)| s).unwrap_or_else(|| "active".to_string());
            append_event(
                tx,
                episode_id,
                EventType::CardSuperseded,
                &json!({
                    "schema_version": rules::SCHEMA_VERSION,
                    "candidate_id": cand.candidate_id,
                    "old_card_id": old_card_id,
                    "new_card_id": card_id,
                    "from_status": from_status,
                    "reason_code": "normative_user_supersession",
                }),
                &format!("card_superseded:{episode_id}:{old_card_id}:{card_id}"),
                producer,
                rules::RULE_VERSION,
                true,
            )
            .await?;
        }
    }

    refresh_ledger(tx, episode_id).await?;

    Ok(ConsolidationSummary {
        episode_id: episode_id.to_string(),
        proposed: candidates.len(),
        admitted,
        rejected,
        merged,
        superseded,
    })
}

fn classify(ref_kind: &str, text: &str) -> CardKind {
    let low = text.to_lowercase();
    match ref_kind {
        "user_span" => {
            if ["prefer", "i like", "please use", "verbosity"].iter().any(|k| low.contains(k)) {
                CardKind::Preference
            } else if ["must", "do not", "don't", "never", "always", "only"].iter().any(|k| low.contains(k)) {
                CardKind::Constraint
            } else if ["i will", "i'll", "we will", "plan to", "going to"].iter().any(|k| low.contains(k)) {
                CardKind::Commitment
            } else {
                CardKind::Fact
            }
        }
        "tool_output" => {
            if contains_failure_signal(text) {
                CardKind::NegativeResult
            } else if ["run ", "command", "steps", "procedure", "workflow"].iter().any(|k| low.contains(k)) {
                CardKind::Tactic
            } else {
                CardKind::Fact
            }
        }
        "doc_span" => {
            if ["run ", "steps", "procedure", "how to"].iter().any(|k| low.contains(k)) {
                CardKind::Tactic
            } else {
                CardKind::Fact
            }
        }
        _ => CardKind::Fact,
    }
}

fn generate_candidates(
    episode_id: &str,
    scope_tier: ScopeTier,
    scope_id: &str,
    ev_rows: &[(String, String, Option<String>)],
) -> Vec<Candidate> {
    let mut out = Vec::new();
    for (idx, (ref_id, ref_kind, excerpt)) in ev_rows.iter().enumerate() {
        let text = normalize_statement(excerpt.as_deref().unwrap_or(""), rules::MAX_STATEMENT_LEN);
        if text.is_empty() {
            continue;
        }
        let kind = classify(ref_kind, &text);
        let cand_id = deterministic_id(
            "cand",
            &[episode_id, &idx.to_string(), kind.as_str(), &normalize_statement(&text, rules::MAX_STATEMENT_LEN).to_lowercase()],
            16,
        );
        out.push(Candidate {
            candidate_id: cand_id,
            kind,
            statement: text.clone(),
            scope_tier,
            scope_id: scope_id.to_string(),
            topic_key: topic_key(&text),
            evidence_ref_ids: vec![ref_id.clone()],
        });
    }
    out
}

async fn validate_evidence_invariant(
    tx: &mut Transaction<'_, Sqlite>,
    cand: &Candidate,
) -> Result<std::result::Result<(), &'static str>> {
    if cand.evidence_ref_ids.is_empty() {
        return Ok(Err("missing_evidence"));
    }
    let placeholders = cand.evidence_ref_ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
    let sql = format!("SELECT ref_kind FROM evidence_refs WHERE evidence_ref_id IN ({placeholders})");
    let mut q = sqlx::query_as::<_, (String,)>(&sql);
    for id in &cand.evidence_ref_ids {
        q = q.bind(id);
    }
    let rows = q.fetch_all(&mut *tx).await?;
    let kinds: std::collections::HashSet<&str> = rows.iter().map(|(k,)| k.as_str()).collect();

    let ok = match cand.kind {
        CardKind::Preference | CardKind::Constraint | CardKind::Commitment => {
            if !kinds.contains("user_span") {
                return Ok(Err("normative_requires_user_span"));
            }
            true
        }
        CardKind::Tactic => {
            if !(kinds.contains("tool_output") || kinds.contains("doc_span")) {
                return Ok(Err("tactic_requires_tool_or_doc"));
            }
            true
        }
        CardKind::NegativeResult => {
            if !kinds.contains("tool_output") {
                return Ok(Err("negative_result_requires_tool_output"));
            }
            if !contains_failure_signal(&cand.statement.to_lowercase()) {
                return Ok(Err("negative_result_requires_failure_signal"));
            }
            true
        }
        CardKind::Fact => {
            if kinds.is_empty() {
                return Ok(Err("fact_requires_anchor"));
            }
            true
        }
    };
    Ok(if ok { Ok(()) } else { Err("invalid") })
}

struct SimilarityMatch {
    card_id: String,
    lexical: f64,
    cosine: f64,
}

async fn find_best_similarity_match(
    tx: &mut Transaction<'_, Sqlite>,
    cand: &Candidate,
) -> Result<Option<SimilarityMatch>> {
    let rows: Vec<(String, String)> = sqlx::query_as(
        "SELECT card_id, statement FROM cards WHERE kind = ? AND scope_tier = ? AND scope_id = ? \
         AND status IN ('active', 'needs_recheck')",
    )
    .bind(cand.kind.as_str())
    .bind(cand.scope_tier.as_str())
    .bind(&cand.scope_id)
    .fetch_all(&mut *tx)
    .await?;

    let mut best: Option<(SimilarityMatch, f64)> = None;
    for (card_id, statement) in rows {
        let lex = crate::text::jaccard_similarity(&cand.statement, &statement);
        let cos = crate::text::cosine_similarity_text(&cand.statement, &statement);
        let score = (lex + cos) / 2.0;
        if best.as_ref().map(|(_, s)| score > *s).unwrap_or(true) {
            best = Some((SimilarityMatch { card_id, lexical: lex, cosine: cos }, score));
        }
    }
    Ok(best.map(|(m, _)| m))
}

async fn find_exact_merge_target(
    tx: &mut Transaction<'_, Sqlite>,
    cand: &Candidate,
) -> Result<Option<String>> {
    let norm = normalize_statement(&cand.statement, rules::MAX_STATEMENT_LEN).to_lowercase();
    let rows: Vec<(String, String)> = sqlx::query_as(
        "SELECT card_id, statement FROM cards WHERE kind = ? AND scope_tier = ? AND scope_id = ? \
         AND status IN ('active', 'needs_recheck') ORDER BY updated_event_id DESC, card_id ASC",
    )
    .bind(cand.kind.as_str())
    .bind(cand.scope_tier.as_str())
    .bind(&cand.scope_id)
    .fetch_all(&mut *tx)
    .await?;
    for (card_id, statement) in rows {
        if normalize_statement(&statement, rules::MAX_STATEMENT_LEN).to_lowercase() == norm {
            return Ok(Some(card_id));
        }
    }
    Ok(None)
}

async fn find_supersede_target(
    tx: &mut Transaction<'_, Sqlite>,
    cand: &Candidate,
) -> Result<Option<String>> {
    if !rules::is_normative(cand.kind) {
        return Ok(None);
    }
    let row: Option<(String,)> = sqlx::query_as(
        "SELECT card_id FROM cards WHERE kind = ? AND scope_tier = ? AND scope_id = ? AND topic_key = ? \
         AND status IN ('active', 'needs_recheck') ORDER BY updated_event_id DESC, card_id ASC LIMIT 1",
    )
    .bind(cand.kind.as_str())
    .bind(cand.scope_tier.as_str())
    .bind(&cand.scope_id)
    .bind(&cand.topic_key)
    .fetch_optional(&mut *tx)
    .await?;
    Ok(row.map(|(c,)| c))
}

async fn append_reject(
    tx: &mut Transaction<'_, Sqlite>,
    episode_id: &str,
    cand: &Candidate,
    reason: &str,
    details: serde_json::Value,
    producer: &str,
) -> Result<()> {
    append_event(
        tx,
        episode_id,
        EventType::CardRejected,
        &json!({
            "schema_version": rules::SCHEMA_VERSION,
            "candidate_id": cand.candidate_id,
            "kind": cand.kind.as_str(),
            "statement": cand.statement,
            "reason_code": reason,
            "details": details,
        }),
        &format!("card_rejected:{episode_id}:{}:{reason}", cand.candidate_id),
        producer,
        rules::RULE_VERSION,
        true,
    )
    .await?;
    Ok(())
}

async fn count_episode_admitted_by_kind(
    tx: &mut Transaction<'_, Sqlite>,
    episode_id: &str,
) -> Result<HashMap<CardKind, u32>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT payload_json FROM memory_events WHERE episode_id = ? AND event_type = 'card_admitted'",
    )
    .bind(episode_id)
    .fetch_all(&mut *tx)
    .await?;
    let mut out: HashMap<CardKind, u32> = HashMap::new();
    for (payload_json,) in rows {
        let payload: serde_json::Value = serde_json::from_str(&payload_json).unwrap_or(json!({}));
        if let Some(kind_str) = payload.pointer("/card/kind").and_then(|v| v.as_str()) {
            if let Ok(kind) = kind_str.parse::<CardKind>() {
                *out.entry(kind).or_insert(0) += 1;
            }
        }
    }
    Ok(out)
}

pub async fn run_dedup_daily(tx: &mut Transaction<'_, Sqlite>, producer: &str) -> Result<usize> {
    let mut merged = 0usize;
    let groups: Vec<(String, String, String, i64)> = sqlx::query_as(
        "SELECT kind, scope_tier, scope_id, COUNT(*) AS n FROM cards WHERE status IN ('active', 'needs_recheck') \
         GROUP BY kind, scope_tier, scope_id HAVING n > 1",
    )
    .fetch_all(&mut *tx)
    .await?;

    for (kind, scope_tier, scope_id, _n) in groups {
        let rows: Vec<(String, String, i64, i64)> = sqlx::query_as(
            r#"
            SELECT c.card_id, c.statement, c.updated_event_id, COUNT(cer.evidence_ref_id) AS evidence_count
            FROM cards c
            LEFT JOIN card_evidence_refs cer ON cer.card_id = c.card_id
            WHERE c.kind = ? AND c.scope_tier = ? AND c.scope_id = ? AND c.status IN ('active', 'needs_recheck')
            GROUP BY c.card_id, c.statement, c.updated_event_id
            ORDER BY evidence_count DESC, updated_event_id DESC, card_id ASC
            "#,
        )
        .bind(&kind)
        .bind(&scope_tier)
        .bind(&scope_id)
        .fetch_all(&mut *tx)
        .await?;
        if rows.len() < 2 {
            continue;
        }
        let (winner_id, winner_statement, ..) = &rows[0];
        for (loser_id, loser_statement, ..) in &rows[1..] {
            let lex = crate::text::jaccard_similarity(winner_statement, loser_statement);
            let cos = crate::text::cosine_similarity_text(winner_statement, loser_statement);
            if lex >= rules::DUPLICATE_LEX_THRESHOLD && cos >= rules::DUPLICATE_COS_THRESHOLD {
                merged += 1;
                let episode_id = match latest_episode_for_card(tx, loser_id).await? {
                    Some(e) => e,
                    None => continue,
                };
                let ev_refs: Vec<String> = sqlx::query_as::<_, (String,)>(
                    "SELECT evidence_ref_id FROM card_evidence_refs WHERE card_id = ?",
                )
                .bind(loser_id)
                .fetch_all(&mut *tx)
                .await?
                .into_iter()
                .map(|(e,)| e)
                .collect();

                append_event(
                    tx,
                    &episode_id,
                    EventType::CardMerged,
                    &json!({
                        "schema_version": rules::SCHEMA_VERSION,
                        "candidate_id": deterministic_id("cand", &[loser_id, winner_id, "dedup"], 16),
                        "target_card_id": winner_id,
                        "evidence_ref_ids": ev_refs,
                        "reason_code": "daily_dedup_merge",
                    }),
                    &format!("daily_dedup_merge:{winner_id}:{loser_id}"),
                    producer,
                    rules::RULE_VERSION,
                    true,
                )
                .await?;
                append_event(
                    tx,
                    &episode_id,
                    EventType::CardArchived,
                    &json!({
                        "schema_version": rules::SCHEMA_VERSION,
                        "card_id": loser_id,
                        "reason_code": "daily_dedup_archived_duplicate",
                    }),
                    &format!("daily_dedup_archive:{loser_id}"),
                    producer,
                    rules::RULE_VERSION,
                    true,
                )
                .await?;
            }
        }
    }
    Ok(merged)
}

/// The reference implementation locates the episode to attribute a dedup
/// merge/archive pair to via a `details_json LIKE '%card_id%'` substring
/// scan over `consolidation_decisions` -- fragile because a card_id could
/// coincidentally match unrelated JSON. We resolve it from the structured
/// `candidate_id`/`card`/`card_id` fields a `card_admitted` decision actually
/// carries for this card, which is exact instead of textual.
async fn latest_episode_for_card(
    tx: &mut Transaction<'_, Sqlite>,
    card_id: &str,
) -> Result<Option<String>> {
    let rows: Vec<(String, String)> = sqlx::query_as(
        "SELECT me.episode_id, cd.details_json FROM consolidation_decisions cd \
         JOIN memory_events me ON me.event_id = cd.event_id \
         WHERE cd.action = 'card_admitted' ORDER BY cd.event_id DESC",
    )
    .fetch_all(&mut *tx)
    .await?;
    for (episode_id, details_json) in rows {
        let details: serde_json::Value = serde_json::from_str(&details_json).unwrap_or(json!({}));
        if details.pointer("/card/card_id").and_then(|v| v.as_str()) == Some(card_id) {
            return Ok(Some(episode_id));
        }
    }
    Ok(None)
}

pub(crate) async fn refresh_ledger(tx: &mut Transaction<'_, Sqlite>, episode_id: &str) -> Result<()> {
    let rows: Vec<(String, String)> = sqlx::query_as(
        "SELECT event_type, payload_json FROM memory_events WHERE episode_id = ? \
         AND event_type IN ('candidate_proposed', 'card_admitted', 'card_rejected', 'card_merged', \
         'card_superseded', 'card_archived') ORDER BY event_id",
    )
    .bind(episode_id)
    .fetch_all(&mut *tx)
    .await?;

    let mut counts: BTreeMap<&str, i64> = [
        ("candidate_proposed", 0),
        ("card_admitted", 0),
        ("card_rejected", 0),
        ("card_merged", 0),
        ("card_superseded", 0),
        ("card_archived", 0),
    ]
    .into_iter()
    .collect();
    let mut reasons: BTreeMap<String, i64> = BTreeMap::new();

    for (event_type, payload_json) in &rows {
        *counts.entry(event_type.as_str()).or_insert(0) += 1;
        let payload: serde_json::Value = serde_json::from_str(payload_json).unwrap_or(json!({}));
        if let Some(reason) = payload.get("reason_code").and_then(|v| v.as_str()) {
            *reasons.entry(reason.to_string()).or_insert(0) += 1;
        }
    }

    let latest: Option<(Option<String>,)> =
        sqlx::query_as("SELECT MAX(created_at) FROM memory_events WHERE episode_id = ?")
            .bind(episode_id)
            .fetch_optional(&mut *tx)
            .await?;
    let computed_at = latest.and_then(|(l,)| l).unwrap_or_else(super::now_iso);

    sqlx::query(
        r#"
        INSERT OR REPLACE INTO consolidation_ledger (
          episode_id, proposed_count, admitted_count, rejected_count,
          merged_count, superseded_count, archived_count, reason_breakdown_json, computed_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(episode_id)
    .bind(counts["candidate_proposed"])
    .bind(counts["card_admitted"])
    .bind(counts["card_rejected"])
    .bind(counts["card_merged"])
    .bind(counts["card_superseded"])
    .bind(counts["card_archived"])
    .bind(serde_json::to_string(&reasons).unwrap_or_else(|_| "{}".to_string()))
    .bind(computed_at)
    .execute(&mut *tx)
    .await?;
    Ok(())
}
