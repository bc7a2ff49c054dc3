//! Canonical log write path: turns a recorded episode (plus its artifacts and
//! evidence anchors) into `episode_recorded` / `artifact_recorded` /
//! `evidence_ref_recorded` / `consolidation_triggered` events, writing
//! artifact blobs to disk alongside the database the way the reference
//! implementation keeps them sibling to the sqlite file.

use std::path::Path;

use serde_json::json;
use sqlx::{Sqlite, Transaction};
use uuid::Uuid;

use crate::error::Result;
use crate::rules;
use crate::text::{canonical_json, sha256_text};
use crate::types::{EventType, RecordEpisodePayload};
use crate::util::artifacts_dir_for;

use super::append_event;

pub struct IngestSummary {
    pub episode_id: String,
    pub artifacts: usize,
    pub evidence_refs: usize,
}

pub async fn record_episode(
    tx: &mut Transaction<'_, Sqlite>,
    db_path: &Path,
    payload: RecordEpisodePayload,
    producer: &str,
) -> Result<IngestSummary> {
    let episode_id = payload
        .episode_id
        .unwrap_or_else(|| format!("ep_{}", &Uuid::new_v4().simple().to_string()[..16]));
    let started_at = payload.started_at.unwrap_or_else(super::now_iso);
    let ended_at = payload.ended_at.unwrap_or_else(super::now_iso);

    let canon = json!({
        "episode_id": episode_id,
        "user_text": payload.user_text,
        "assistant_text": payload.assistant_text,
        "model_name": payload.model_name,
        "metadata": payload.metadata,
        "started_at": started_at,
        "ended_at": ended_at,
    });
    let payload_hash = sha256_text(&canonical_json(&canon));

    sqlx::query(
        r#"
        INSERT OR IGNORE INTO episodes (
          episode_id, user_text, assistant_text, model_name, metadata_json,
          payload_hash, started_at, ended_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&episode_id)
    .bind(&payload.user_text)
    .bind(&payload.assistant_text)
    .bind(&payload.model_name)
    .bind(canonical_json(&payload.metadata))
    .bind(&payload_hash)
    .bind(&started_at)
    .bind(&ended_at)
    .execute(&mut *tx)
    .await?;

    append_event(
        tx,
        &episode_id,
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

    let artifacts_dir = artifacts_dir_for(db_path);

    for art in &payload.artifacts {
        let artifact_id = art
            .artifact_id
            .clone()
            .unwrap_or_else(|| format!("art_{}", &Uuid::new_v4().simple().to_string()[..16]));
        let artifact_kind = art.artifact_kind;
        let mime_type = art.mime_type.clone().unwrap_or_else(|| "text/plain".to_string());
        let art_meta = art.metadata.clone().unwrap_or_else(|| json!({}));
        let content = art.content.clone().unwrap_or_default();

        let content_path = match &art.content_path {
            Some(p) => p.clone(),
            None => {
                tokio::fs::create_dir_all(&artifacts_dir).await?;
                artifacts_dir.join(format!("{artifact_id}.txt")).to_string_lossy().to_string()
            }
        };
        if art.content_path.is_none() || (!content.is_empty() && !Path::new(&content_path).exists()) {
            if let Some(parent) = Path::new(&content_path).parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&content_path, &content).await?;
        }

        let content_hash = if !content.is_empty() {
            sha256_text(&content)
        } else if Path::new(&content_path).exists() {
            let existing = tokio::fs::read_to_string(&content_path).await?;
            sha256_text(&existing)
        } else {
            sha256_text("")
        };

        sqlx::query(
            r#"
            INSERT OR IGNORE INTO artifacts (
              artifact_id, episode_id, artifact_kind, content_path,
              content_hash, mime_type, metadata_json
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&artifact_id)
        .bind(&episode_id)
        .bind(artifact_kind.as_str())
        .bind(&content_path)
        .bind(&content_hash)
        .bind(&mime_type)
        .bind(canonical_json(&art_meta))
        .execute(&mut *tx)
        .await?;

        append_event(
            tx,
            &episode_id,
            EventType::ArtifactRecorded,
            &json!({
                "schema_version": rules::SCHEMA_VERSION,
                "artifact_id": artifact_id,
                "artifact_kind": artifact_kind.as_str(),
                "content_hash": content_hash,
            }),
            &format!("artifact_recorded:{episode_id}:{artifact_id}:{content_hash}"),
            producer,
            rules::RULE_VERSION,
            true,
        )
        .await?;
    }

    for ev in &payload.evidence_refs {
        let evidence_ref_id = ev
            .evidence_ref_id
            .clone()
            .unwrap_or_else(|| format!("ev_{}", &Uuid::new_v4().simple().to_string()[..16]));
        let ref_kind = ev.ref_kind;
        let target_id = ev
            .target_id
            .clone()
            .or_else(|| ev.artifact_id.clone())
            .unwrap_or_else(|| "episode".to_string());

        let excerpt_text = match &ev.excerpt_text {
            Some(t) if !t.is_empty() => t.clone(),
            _ => {
                extract_evidence_excerpt(
                    tx,
                    &episode_id,
                    ref_kind,
                    ev.artifact_id.as_deref(),
                    ev.start_offset,
                    ev.end_offset,
                    ev.line_start,
                    ev.line_end,
                )
                .await?
            }
        };
        let ref_hash = if !excerpt_text.is_empty() {
            sha256_text(&excerpt_text)
        } else {
            sha256_text(&format!(
                "{}:{}:{}:{}:{}",
                target_id,
                opt_i64_to_string(ev.start_offset),
                opt_i64_to_string(ev.end_offset),
                opt_i64_to_string(ev.line_start),
                opt_i64_to_string(ev.line_end),
            ))
        };

        sqlx::query(
            r#"
            INSERT OR IGNORE INTO evidence_refs (
              evidence_ref_id, episode_id, artifact_id, ref_kind, target_id,
              start_offset, end_offset, line_start, line_end, excerpt_text, ref_hash
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&evidence_ref_id)
        .bind(&episode_id)
        .bind(&ev.artifact_id)
        .bind(ref_kind.as_str())
        .bind(&target_id)
        .bind(ev.start_offset)
        .bind(ev.end_offset)
        .bind(ev.line_start)
        .bind(ev.line_end)
        .bind(&excerpt_text)
        .bind(&ref_hash)
        .execute(&mut *tx)
        .await?;

        append_event(
            tx,
            &episode_id,
            EventType::EvidenceRefRecorded,
            &json!({
                "schema_version": rules::SCHEMA_VERSION,
                "evidence_ref_id": evidence_ref_id,
                "ref_kind": ref_kind.as_str(),
                "ref_hash": ref_hash,
            }),
            &format!("evidence_ref_recorded:{episode_id}:{evidence_ref_id}:{ref_hash}"),
            producer,
            rules::RULE_VERSION,
            true,
        )
        .await?;
    }

    append_event(
        tx,
        &episode_id,
        EventType::ConsolidationTriggered,
        &json!({
            "schema_version": rules::SCHEMA_VERSION,
            "episode_id": episode_id,
            "trigger": "post_episode_record",
        }),
        &format!("consolidation_triggered:{episode_id}"),
        producer,
        rules::RULE_VERSION,
        true,
    )
    .await?;

    Ok(IngestSummary {
        artifacts: payload.artifacts.len(),
        evidence_refs: payload.evidence_refs.len(),
        episode_id,
    })
}

async fn extract_evidence_excerpt(
    tx: &mut Transaction<'_, Sqlite>,
    episode_id: &str,
    ref_kind: crate::types::EvidenceRefKind,
    artifact_id: Option<&str>,
    start_offset: Option<i64>,
    end_offset: Option<i64>,
    line_start: Option<i64>,
    line_end: Option<i64>,
) -> Result<String> {
    use crate::types::EvidenceRefKind;

    if matches!(ref_kind, EvidenceRefKind::UserSpan) {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT user_text FROM episodes WHERE episode_id = ?")
                .bind(episode_id)
                .fetch_optional(&mut *tx)
                .await?;
        let text = match row {
            Some((t,)) => t,
            None => return Ok(String::new()),
        };
        return Ok(match (start_offset, end_offset) {
            (Some(s), Some(e)) => slice_chars(&text, s, e),
            _ => slice_chars(&text, 0, rules::MAX_EXCERPT_LEN as i64),
        });
    }

    if let Some(artifact_id) = artifact_id {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT content_path FROM artifacts WHERE artifact_id = ?")
                .bind(artifact_id)
                .fetch_optional(&mut *tx)
                .await?;
        if let Some((content_path,)) = row {
            if Path::new(&content_path).exists() {
                let content = tokio::fs::read_to_string(&content_path).await?;
                if let (Some(s), Some(e)) = (line_start, line_end) {
                    let lines: Vec<&str> = content.lines().collect();
                    let s = (s.max(1)) as usize;
                    let e = (e.max(s as i64)) as usize;
                    let slice = lines
                        .iter()
                        .skip(s - 1)
                        .take(e.saturating_sub(s - 1))
                        .cloned()
                        .collect::<Vec<_>>()
                        .join("\n");
                    return Ok(slice_chars(&slice, 0, rules::MAX_EXCERPT_LEN as i64));
                }
                if let (Some(s), Some(e)) = (start_offset, end_offset) {
                    return Ok(slice_chars(&content, s, e));
                }
                return Ok(slice_chars(&content, 0, rules::MAX_EXCERPT_LEN as i64));
            }
        }
    }
    Ok(String::new())
}

/// Renders `Some(5)` as `"5"` and `None` as `"None"`, matching the reference
/// implementation's `f"{start_offset}"` formatting of an absent offset.
fn opt_i64_to_string(value: Option<i64>) -> String {
    match value {
        Some(v) => v.to_string(),
        None => "None".to_string(),
    }
}

fn slice_chars(text: &str, start: i64, end: i64) -> String {
    let chars: Vec<char> = text.chars().collect();
    let len = chars.len() as i64;
    let s = start.clamp(0, len) as usize;
    let e = end.clamp(0, len) as usize;
    if e <= s {
        return String::new();
    }
    chars[s..e].iter().collect()
}
