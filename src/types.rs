//! Domain types for the episodic memory store.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{ArchiveError, Result};

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:expr),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ArchiveError;
            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($text => Ok(Self::$variant)),+,
                    other => Err(ArchiveError::InvalidInput(format!(
                        concat!("unknown ", stringify!($name), " '{}'"),
                        other
                    ))),
                }
            }
        }
    };
}

string_enum!(ScopeTier {
    Repo => "repo",
    Domain => "domain",
    Global => "global",
});

impl ScopeTier {
    /// Broadest to narrowest ordering used by the scope scoring component.
    pub fn breadth(&self) -> u8 {
        match self {
            ScopeTier::Global => 0,
            ScopeTier::Domain => 1,
            ScopeTier::Repo => 2,
        }
    }
}

string_enum!(ArtifactKind {
    ToolOutput => "tool_output",
    Doc => "doc",
});

string_enum!(EvidenceRefKind {
    UserSpan => "user_span",
    ToolOutput => "tool_output",
    DocSpan => "doc_span",
});

string_enum!(CardKind {
    Preference => "preference",
    Constraint => "constraint",
    Commitment => "commitment",
    Fact => "fact",
    Tactic => "tactic",
    NegativeResult => "negative_result",
});

string_enum!(CardStatus {
    Active => "active",
    NeedsRecheck => "needs_recheck",
    Deprecated => "deprecated",
    Archived => "archived",
});

string_enum!(Channel {
    AutoPack => "auto_pack",
    Search => "search",
    ExplicitRead => "explicit_read",
    Check => "check",
});

string_enum!(OutcomeType {
    ToolSuccess => "tool_success",
    ToolFailure => "tool_failure",
    UserConfirmedHelpful => "user_confirmed_helpful",
    UserCorrected => "user_corrected",
});

impl OutcomeType {
    pub fn is_success(&self) -> bool {
        matches!(self, OutcomeType::ToolSuccess | OutcomeType::UserConfirmedHelpful)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, OutcomeType::ToolFailure | OutcomeType::UserCorrected)
    }
}

string_enum!(EventType {
    EpisodeRecorded => "episode_recorded",
    ArtifactRecorded => "artifact_recorded",
    EvidenceRefRecorded => "evidence_ref_recorded",
    ConsolidationTriggered => "consolidation_triggered",
    CandidateProposed => "candidate_proposed",
    CardAdmitted => "card_admitted",
    CardRejected => "card_rejected",
    CardMerged => "card_merged",
    CardSuperseded => "card_superseded",
    CardArchived => "card_archived",
    CardStatusChanged => "card_status_changed",
    CardDeprecated => "card_deprecated",
    DisputeRecorded => "dispute_recorded",
    ExposureRecorded => "exposure_recorded",
    OutcomeRecorded => "outcome_recorded",
});

/// A conversational turn pair plus its scope metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    pub episode_id: String,
    pub user_text: String,
    pub assistant_text: String,
    pub model_name: Option<String>,
    pub metadata: serde_json::Value,
    pub started_at: String,
    pub ended_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactInput {
    pub artifact_id: Option<String>,
    pub artifact_kind: ArtifactKind,
    pub mime_type: Option<String>,
    pub content: Option<String>,
    pub content_path: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceRefInput {
    pub evidence_ref_id: Option<String>,
    pub ref_kind: EvidenceRefKind,
    pub artifact_id: Option<String>,
    pub target_id: Option<String>,
    pub start_offset: Option<i64>,
    pub end_offset: Option<i64>,
    pub line_start: Option<i64>,
    pub line_end: Option<i64>,
    pub excerpt_text: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordEpisodePayload {
    pub episode_id: Option<String>,
    pub user_text: String,
    pub assistant_text: String,
    pub model_name: Option<String>,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
    pub metadata: serde_json::Value,
    #[serde(default)]
    pub artifacts: Vec<ArtifactInput>,
    #[serde(default)]
    pub evidence_refs: Vec<EvidenceRefInput>,
}

/// One evidence anchor resolved and persisted for an episode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceRef {
    pub evidence_ref_id: String,
    pub episode_id: String,
    pub artifact_id: Option<String>,
    pub ref_kind: EvidenceRefKind,
    pub target_id: String,
    pub start_offset: Option<i64>,
    pub end_offset: Option<i64>,
    pub line_start: Option<i64>,
    pub line_end: Option<i64>,
    pub excerpt_text: String,
    pub ref_hash: String,
    pub created_at: String,
}

/// A distillation candidate, produced before any gate has run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub candidate_id: String,
    pub kind: CardKind,
    pub statement: String,
    pub scope_tier: ScopeTier,
    pub scope_id: String,
    pub topic_key: String,
    pub evidence_ref_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Card {
    pub card_id: String,
    pub kind: CardKind,
    pub statement: String,
    pub scope_tier: ScopeTier,
    pub scope_id: String,
    pub topic_key: String,
    pub tags: Vec<String>,
    pub status: CardStatus,
    pub supersedes_card_id: Option<String>,
    pub created_event_id: i64,
    pub updated_event_id: i64,
    pub archived_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredCard {
    pub card_id: String,
    pub kind: CardKind,
    pub statement: String,
    pub scope_tier: ScopeTier,
    pub scope_id: String,
    pub status: CardStatus,
    pub updated_event_id: i64,
    pub lexical: f64,
    pub semantic: f64,
    pub scope: f64,
    pub kind_prior: f64,
    pub truth: f64,
    pub utility: f64,
    pub recency: f64,
    pub score_total: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendResult {
    pub event_id: i64,
    pub seq_no: i64,
    pub inserted: bool,
}
