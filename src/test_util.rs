//! Shared test fixtures: an in-memory engine plus minimal episode/evidence
//! builders, used by the `engine::*` unit tests and the `tests/` integration
//! suite.

use serde_json::json;

use crate::database::Database;
use crate::engine::Engine;
use crate::types::{ArtifactInput, EvidenceRefInput, RecordEpisodePayload};

pub async fn in_memory_engine() -> Engine {
    let db = Database::connect_in_memory().await.expect("in-memory database");
    Engine::new(db)
}

pub fn episode_payload(
    user_text: &str,
    assistant_text: &str,
    scope_tier: &str,
    scope_id: &str,
) -> RecordEpisodePayload {
    RecordEpisodePayload {
        episode_id: None,
        user_text: user_text.to_string(),
        assistant_text: assistant_text.to_string(),
        model_name: Some("test-model".to_string()),
        started_at: None,
        ended_at: None,
        metadata: json!({ "scope_tier": scope_tier, "scope_id": scope_id }),
        artifacts: Vec::new(),
        evidence_refs: Vec::new(),
    }
}

pub fn user_span_evidence(excerpt_text: &str) -> EvidenceRefInput {
    EvidenceRefInput {
        evidence_ref_id: None,
        ref_kind: crate::types::EvidenceRefKind::UserSpan,
        artifact_id: None,
        target_id: None,
        start_offset: None,
        end_offset: None,
        line_start: None,
        line_end: None,
        excerpt_text: Some(excerpt_text.to_string()),
    }
}

pub fn tool_output_artifact(artifact_id: &str, content: &str) -> ArtifactInput {
    ArtifactInput {
        artifact_id: Some(artifact_id.to_string()),
        artifact_kind: crate::types::ArtifactKind::ToolOutput,
        mime_type: Some("text/plain".to_string()),
        content: Some(content.to_string()),
        content_path: None,
        metadata: None,
    }
}

pub fn tool_output_evidence(artifact_id: &str, excerpt_text: &str) -> EvidenceRefInput {
    EvidenceRefInput {
        evidence_ref_id: None,
        ref_kind: crate::types::EvidenceRefKind::ToolOutput,
        artifact_id: Some(artifact_id.to_string()),
        target_id: None,
        start_offset: None,
        end_offset: None,
        line_start: None,
        line_end: None,
        excerpt_text: Some(excerpt_text.to_string()),
    }
}
