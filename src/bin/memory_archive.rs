// Copyright 2018-2019 Parity Technologies (UK) Ltd.
// This file is part of substrate-archive.

// substrate-archive is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// substrate-archive is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with substrate-archive.  If not, see <http://www.gnu.org/licenses/>.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde_json::{json, Value};

use memory_archive::config::Config;
use memory_archive::database::Database;
use memory_archive::engine::{self, Engine};
use memory_archive::error::Result;
use memory_archive::rules;
use memory_archive::types::{Channel, EventType, OutcomeType, RecordEpisodePayload};

#[derive(Parser)]
#[command(name = "memory-archive", about = "Local-first episodic memory store")]
struct Cli {
    /// SQLite path (default: .memory/memory.db)
    #[arg(long)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Initialize database schema
    Init,
    /// Record an episode JSON payload
    RecordEpisode {
        #[arg(long)]
        input: PathBuf,
    },
    /// Append a raw memory event
    AppendEvent {
        #[arg(long)]
        episode: String,
        #[arg(long = "type")]
        event_type: String,
        #[arg(long)]
        payload: PathBuf,
        #[arg(long)]
        idempotency_key: String,
        #[arg(long, default_value = "cli")]
        producer: String,
        #[arg(long, default_value = rules::RULE_VERSION)]
        rule_version: String,
    },
    /// Run deterministic consolidation
    Consolidate {
        #[arg(long)]
        episode: String,
    },
    /// Show consolidation ledger
    Ledger {
        #[arg(long)]
        episode: String,
    },
    /// Run daily dedup sweep
    Dedup,
    /// Store health, counts, and trend metrics
    Status {
        #[arg(long, default_value_t = rules::DEFAULT_TREND_DAYS)]
        days: i64,
    },
    /// Recover missing canonical events and optional consolidation
    Recover {
        #[arg(long)]
        no_consolidation: bool,
    },
    /// Replay/idempotency consistency checks
    VerifyIdempotency {
        #[arg(long, default_value_t = 100)]
        sample_events: i64,
    },
    /// Rebuild projections from memory_events
    FullRebuild {
        #[arg(long)]
        verify_stability: bool,
    },
    /// Recompute embedding vectors with a new model tag
    MigrateEmbeddings {
        #[arg(long)]
        to_model: String,
        #[arg(long)]
        from_model: Option<String>,
        #[arg(long, default_value_t = 64)]
        dim: usize,
    },
    /// Evaluate go/no-go gates for causal instrumentation
    Gates {
        #[arg(long, default_value_t = rules::DEFAULT_TREND_DAYS)]
        days: i64,
    },
    /// Search cards
    Search {
        #[arg(long)]
        query: String,
        #[arg(long)]
        episode: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
        #[arg(long)]
        include_archived: bool,
    },
    /// Build deterministic pack and record exposure
    Pack {
        #[arg(long)]
        episode: String,
        #[arg(long)]
        query: String,
        #[arg(long, default_value = "auto_pack")]
        channel: String,
    },
    /// Explain pack snapshot
    ExplainPack {
        #[arg(long)]
        episode: String,
        #[arg(long)]
        pack_id: Option<String>,
    },
    /// Explain consolidation decisions
    ExplainConsolidation {
        #[arg(long)]
        episode: String,
    },
    /// Record dispute evidence and status transition
    RecordDispute {
        #[arg(long)]
        episode: String,
        #[arg(long)]
        card_id: String,
        #[arg(long)]
        evidence_ref_id: String,
    },
    /// Record terminal outcome
    RecordOutcome {
        #[arg(long)]
        episode: String,
        #[arg(long = "type")]
        outcome_type: String,
        #[arg(long, default_value = "")]
        evidence_ref_ids: String,
        #[arg(long)]
        metadata: Option<PathBuf>,
    },
    /// Rebuild all projections from memory_events
    Replay,
    /// Export episode events as JSONL
    Export {
        #[arg(long)]
        episode: String,
    },
}

fn parse_json_file(path: &std::path::Path) -> Result<Value> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

fn print_json(value: &Value) {
    println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
}

#[tokio::main]
async fn main() {
    if let Err(err) = memory_archive::logger::init(log::LevelFilter::Info, log::LevelFilter::Debug) {
        eprintln!("failed to initialize logging: {err}");
    }

    match run().await {
        Ok(()) => {}
        Err(err) => {
            print_json(&json!({ "error": err.to_string() }));
            std::process::exit(1);
        }
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::with_db_path(cli.db);

    let db = Database::connect(&config.db_path).await?;
    let engine = Engine::new(db);

    if matches!(cli.cmd, Command::Init) {
        print_json(&json!({ "ok": true, "db": config.db_path.to_string_lossy() }));
        return Ok(());
    }

    match cli.cmd {
        Command::Init => unreachable!(),
        Command::RecordEpisode { input } => {
            let payload: RecordEpisodePayload = serde_json::from_value(parse_json_file(&input)?)?;
            let mut tx = engine.database().begin().await?;
            let summary = engine::ingest::record_episode(&mut tx, &config.db_path, payload, &config.producer).await?;
            engine::consolidation::consolidate_episode(&mut tx, &summary.episode_id, &config.producer).await?;
            tx.commit().await?;
            print_json(&json!({
                "episode_id": summary.episode_id,
                "artifacts": summary.artifacts,
                "evidence_refs": summary.evidence_refs,
            }));
        }
        Command::AppendEvent { episode, event_type, payload, idempotency_key, producer, rule_version } => {
            let payload = parse_json_file(&payload)?;
            let event_type: EventType = event_type.parse()?;
            let mut tx = engine.database().begin().await?;
            let result =
                engine::append_event(&mut tx, &episode, event_type, &payload, &idempotency_key, &producer, &rule_version, true)
                    .await?;
            tx.commit().await?;
            print_json(&json!({ "event_id": result.event_id, "seq_no": result.seq_no, "inserted": result.inserted }));
        }
        Command::Consolidate { episode } => {
            let mut tx = engine.database().begin().await?;
            let summary = engine::consolidation::consolidate_episode(&mut tx, &episode, &config.producer).await?;
            tx.commit().await?;
            print_json(&json!({
                "episode_id": summary.episode_id,
                "proposed": summary.proposed,
                "admitted": summary.admitted,
                "rejected": summary.rejected,
                "merged": summary.merged,
                "superseded": summary.superseded,
            }));
        }
        Command::Ledger { episode } => {
            let mut tx = engine.database().begin().await?;
            let row: Option<(String, i64, i64, i64, i64, i64, i64, String, String)> = sqlx::query_as(
                "SELECT episode_id, proposed_count, admitted_count, rejected_count, merged_count, \
                 superseded_count, archived_count, reason_breakdown_json, computed_at \
                 FROM consolidation_ledger WHERE episode_id = ?",
            )
            .bind(&episode)
            .fetch_optional(&mut *tx)
            .await?;
            tx.commit().await?;
            match row {
                Some((episode_id, proposed, admitted, rejected, merged, superseded, archived, reasons, computed_at)) => {
                    print_json(&json!({
                        "episode_id": episode_id,
                        "proposed_count": proposed,
                        "admitted_count": admitted,
                        "rejected_count": rejected,
                        "merged_count": merged,
                        "superseded_count": superseded,
                        "archived_count": archived,
                        "reason_breakdown": serde_json::from_str::<Value>(&reasons).unwrap_or(json!({})),
                        "computed_at": computed_at,
                    }));
                }
                None => print_json(&json!({})),
            }
        }
        Command::Dedup => {
            let mut tx = engine.database().begin().await?;
            let merged = engine::consolidation::run_dedup_daily(&mut tx, &config.producer).await?;
            tx.commit().await?;
            print_json(&json!({ "merged": merged }));
        }
        Command::Status { days } => {
            let mut tx = engine.database().begin().await?;
            let report = engine::ops::status_report(&mut tx, &config.db_path, days).await?;
            tx.commit().await?;
            print_json(&report);
        }
        Command::Recover { no_consolidation } => {
            let mut tx = engine.database().begin().await?;
            let out = engine::ops::recover_partial_writes(&mut tx, &config.producer, !no_consolidation).await?;
            tx.commit().await?;
            print_json(&out);
        }
        Command::VerifyIdempotency { sample_events } => {
            let mut tx = engine.database().begin().await?;
            let out = engine::ops::verify_reducer_idempotency(&mut tx, sample_events).await?;
            tx.commit().await?;
            print_json(&out);
        }
        Command::FullRebuild { verify_stability } => {
            let mut tx = engine.database().begin().await?;
            let out = engine::ops::full_rebuild(&mut tx, verify_stability).await?;
            tx.commit().await?;
            print_json(&out);
        }
        Command::MigrateEmbeddings { to_model, from_model, dim } => {
            let mut tx = engine.database().begin().await?;
            let out = engine::ops::migrate_embeddings(&mut tx, &to_model, dim, from_model.as_deref()).await?;
            tx.commit().await?;
            print_json(&out);
        }
        Command::Gates { days } => {
            let mut tx = engine.database().begin().await?;
            let out = engine::ops::evaluate_causal_gates(&mut tx, days).await?;
            tx.commit().await?;
            print_json(&out);
        }
        Command::Search { query, episode, limit, include_archived } => {
            let mut tx = engine.database().begin().await?;
            let results = engine::retrieval::retrieve_cards(
                &mut tx,
                &query,
                episode.as_deref(),
                include_archived,
                limit,
                Channel::Search,
            )
            .await?;
            tx.commit().await?;
            print_json(&json!({ "count": results.len(), "results": results }));
        }
        Command::Pack { episode, query, channel } => {
            let channel: Channel = channel.parse()?;
            let mut tx = engine.database().begin().await?;
            let result = engine::retrieval::build_pack(&mut tx, &episode, &query, channel, &config.producer).await?;
            tx.commit().await?;
            print_json(&json!({
                "episode_id": result.episode_id,
                "pack_id": result.pack_id,
                "channel": result.channel.as_str(),
                "event_id": result.event_id,
                "selected_cards": result.selected_cards,
                "slot_counts": result.slot_counts,
            }));
        }
        Command::ExplainPack { episode, pack_id } => {
            let mut tx = engine.database().begin().await?;
            let out = engine::retrieval::explain_pack(&mut tx, &episode, pack_id.as_deref()).await?;
            tx.commit().await?;
            print_json(&out);
        }
        Command::ExplainConsolidation { episode } => {
            let mut tx = engine.database().begin().await?;
            let out = engine::retrieval::explain_consolidation(&mut tx, &episode).await?;
            tx.commit().await?;
            print_json(&Value::Array(out));
        }
        Command::RecordDispute { episode, card_id, evidence_ref_id } => {
            let mut tx = engine.database().begin().await?;
            let out = engine::dispute::record_dispute(&mut tx, &episode, &card_id, &evidence_ref_id, &config.producer).await?;
            tx.commit().await?;
            print_json(&json!({ "dispute_id": out.dispute_id, "status_changed": out.status_changed }));
        }
        Command::RecordOutcome { episode, outcome_type, evidence_ref_ids, metadata } => {
            let outcome_type: OutcomeType = outcome_type.parse()?;
            let evidence_ref_ids: Vec<String> =
                evidence_ref_ids.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect();
            let metadata = match metadata {
                Some(path) => parse_json_file(&path)?,
                None => json!({}),
            };
            let mut tx = engine.database().begin().await?;
            let result =
                engine::dispute::record_outcome(&mut tx, &episode, outcome_type, &evidence_ref_ids, &metadata, &config.producer)
                    .await?;
            tx.commit().await?;
            print_json(&json!({ "event_id": result.event_id, "seq_no": result.seq_no, "inserted": result.inserted }));
        }
        Command::Replay => {
            let mut tx = engine.database().begin().await?;
            let out = engine::ops::replay_reducers(&mut tx).await?;
            tx.commit().await?;
            print_json(&out);
        }
        Command::Export { episode } => {
            let mut tx = engine.database().begin().await?;
            let events = engine::ops::export_episode(&mut tx, &episode).await?;
            tx.commit().await?;
            for event in events {
                println!("{}", serde_json::to_string(&event).unwrap_or_default());
            }
        }
    }

    Ok(())
}
