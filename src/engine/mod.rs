//! The event-sourced engine: one exclusive handle to the database, driving
//! every mutating operation through a single transaction per call.
//!
//! Submodules split by concern the way the reference implementation's
//! `MemoryEngine` methods are grouped, but here each group is its own file:
//! `ingest` (canonical log write path), `reducer` (event application),
//! `consolidation` (candidate generation and gates), `retrieval` (search,
//! packing, explain), `dispute` (dispute/outcome/utility), and `ops`
//! (health, replay, rebuild, migration, gates).

pub mod consolidation;
pub mod dispute;
pub mod ingest;
pub mod ops;
pub mod reducer;
pub mod retrieval;

use chrono::SecondsFormat;
use sqlx::{Sqlite, Transaction};

use crate::database::Database;
use crate::error::Result;
use crate::types::{AppendResult, EventType};

/// `now_iso()` equivalent: UTC, second precision, `Z` suffix. Never used by
/// the reducer to compute projection state — only to stamp new events.
pub fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub struct Engine {
    db: Database,
}

impl Engine {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    async fn begin(&self) -> Result<Transaction<'_, Sqlite>> {
        self.db.begin().await
    }
}

/// Append an event, enforcing idempotency on `idempotency_key`, assigning the
/// next gap-free `seq_no` for the episode, and optionally driving it through
/// the reducer in the same transaction.
pub async fn append_event(
    tx: &mut Transaction<'_, Sqlite>,
    episode_id: &str,
    event_type: EventType,
    payload: &serde_json::Value,
    idempotency_key: &str,
    producer: &str,
    rule_version: &str,
    apply: bool,
) -> Result<AppendResult> {
    let payload_json = crate::text::canonical_json(payload);
    let payload_hash = crate::text::sha256_text(&payload_json);

    let existing: Option<(i64, String, i64)> = sqlx::query_as(
        "SELECT event_id, episode_id, seq_no FROM memory_events WHERE idempotency_key = ?",
    )
    .bind(idempotency_key)
    .fetch_optional(&mut *tx)
    .await?;

    if let Some((event_id, episode_id, seq_no)) = existing {
        let _ = episode_id;
        return Ok(AppendResult { event_id, seq_no, inserted: false });
    }

    let (next_seq,): (i64,) = sqlx::query_as(
        "SELECT COALESCE(MAX(seq_no), 0) + 1 FROM memory_events WHERE episode_id = ?",
    )
    .bind(episode_id)
    .fetch_one(&mut *tx)
    .await?;

    let insert = sqlx::query(
        r#"
        INSERT INTO memory_events (
          episode_id, seq_no, event_type, payload_json, payload_hash,
          idempotency_key, producer, rule_version
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(episode_id)
    .bind(next_seq)
    .bind(event_type.as_str())
    .bind(&payload_json)
    .bind(&payload_hash)
    .bind(idempotency_key)
    .bind(producer)
    .bind(rule_version)
    .execute(&mut *tx)
    .await?;
    let event_id = insert.last_insert_rowid();

    let created_at: Option<(String,)> =
        sqlx::query_as("SELECT created_at FROM memory_events WHERE event_id = ?")
            .bind(event_id)
            .fetch_optional(&mut *tx)
            .await?;
    let created_at = created_at.map(|(c,)| c).unwrap_or_else(now_iso);

    if apply {
        reducer::apply_event(tx, event_id, episode_id, event_type, payload, &created_at).await?;
    }

    Ok(AppendResult { event_id, seq_no: next_seq, inserted: true })
}
