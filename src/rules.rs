//! Process-wide tunables, keyed to [`RULE_VERSION`].
//!
//! Nothing in this module reads configuration or the clock; every constant
//! here is a pure policy value referenced by the reducer, consolidation, and
//! retrieval stages. Bumping the scoring weights, budgets, or thresholds
//! means introducing a new `rule_version` rather than editing these in
//! place, so the event log stays interpretable.

use std::collections::HashSet;

use once_cell::sync::Lazy;

use crate::types::{CardKind, ScopeTier};

pub const RULE_VERSION: &str = "v1";
pub const SCHEMA_VERSION: i64 = 1;

pub const MAX_STATEMENT_LEN: usize = 280;
pub const MAX_EXCERPT_LEN: usize = 280;

pub static STOPWORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "from", "has", "have",
        "if", "in", "is", "it", "of", "on", "or", "that", "the", "to", "was", "were", "with",
        "you", "your", "i", "we", "this", "those", "these",
    ]
    .into_iter()
    .collect()
});

pub fn kind_priority(kind: CardKind) -> u8 {
    match kind {
        CardKind::Constraint => 0,
        CardKind::Commitment => 1,
        CardKind::Preference => 2,
        CardKind::NegativeResult => 3,
        CardKind::Tactic => 4,
        CardKind::Fact => 5,
    }
}

pub fn is_normative(kind: CardKind) -> bool {
    matches!(
        kind,
        CardKind::Preference | CardKind::Constraint | CardKind::Commitment
    )
}

pub fn episode_kind_cap(kind: CardKind) -> u32 {
    match kind {
        CardKind::Fact => 4,
        CardKind::Tactic => 2,
        CardKind::NegativeResult => 2,
        CardKind::Preference => 2,
        CardKind::Constraint => 1,
        CardKind::Commitment => 1,
    }
}

pub const EPISODE_SOFT_CAP: u32 = 12;

pub fn budget_cap(scope_tier: ScopeTier, kind: CardKind) -> u32 {
    use CardKind::*;
    use ScopeTier::*;
    match (scope_tier, kind) {
        (Repo, Preference) => 80,
        (Repo, Constraint) => 120,
        (Repo, Commitment) => 120,
        (Repo, Fact) => 300,
        (Repo, Tactic) => 120,
        (Repo, NegativeResult) => 120,
        (Domain, Preference) => 40,
        (Domain, Constraint) => 60,
        (Domain, Commitment) => 60,
        (Domain, Fact) => 180,
        (Domain, Tactic) => 80,
        (Domain, NegativeResult) => 80,
        (Global, Preference) => 20,
        (Global, Constraint) => 30,
        (Global, Commitment) => 30,
        (Global, Fact) => 100,
        (Global, Tactic) => 40,
        (Global, NegativeResult) => 40,
    }
}

pub fn dispute_weight(ref_kind: crate::types::EvidenceRefKind) -> f64 {
    use crate::types::EvidenceRefKind::*;
    match ref_kind {
        ToolOutput => 1.0,
        DocSpan => 0.7,
        UserSpan => 0.4,
    }
}

pub fn dispute_threshold(scope_tier: ScopeTier) -> f64 {
    match scope_tier {
        ScopeTier::Repo => 2.0,
        ScopeTier::Domain => 3.0,
        ScopeTier::Global => 4.0,
    }
}

pub const PACK_TOTAL_CAP: usize = 8;
pub const PACK_TOPIC_CAP: usize = 2;

pub fn pack_slot(kind: CardKind) -> &'static str {
    match kind {
        CardKind::Preference | CardKind::Constraint | CardKind::Commitment => {
            "constraints_commitments"
        }
        CardKind::NegativeResult => "negative_result",
        CardKind::Tactic => "tactic",
        CardKind::Fact => "fact",
    }
}

pub fn pack_slot_cap(slot: &str) -> usize {
    match slot {
        "constraints_commitments" => 3,
        "negative_result" => 2,
        "tactic" => 2,
        "fact" => 3,
        _ => 0,
    }
}

pub const SCORE_WEIGHT_LEXICAL: f64 = 0.35;
pub const SCORE_WEIGHT_SEMANTIC: f64 = 0.25;
pub const SCORE_WEIGHT_SCOPE: f64 = 0.15;
pub const SCORE_WEIGHT_KIND_PRIOR: f64 = 0.10;
pub const SCORE_WEIGHT_TRUTH: f64 = 0.10;
pub const SCORE_WEIGHT_UTILITY: f64 = 0.05;
pub const SCORE_WEIGHT_RECENCY: f64 = 0.02;
pub const NEEDS_RECHECK_DAMPENING: f64 = 0.35;

pub fn kind_prior(kind: CardKind) -> f64 {
    match kind {
        CardKind::Constraint => 1.0,
        CardKind::Commitment => 0.9,
        CardKind::NegativeResult => 0.85,
        CardKind::Preference => 0.8,
        CardKind::Tactic => 0.8,
        CardKind::Fact => 0.75,
    }
}

pub const DUPLICATE_LEX_THRESHOLD: f64 = 0.80;
pub const DUPLICATE_COS_THRESHOLD: f64 = 0.92;
pub const NOVELTY_LEX_THRESHOLD: f64 = 0.65;
pub const NOVELTY_COS_THRESHOLD: f64 = 0.78;

pub const ARCHIVE_HYGIENE_STALE_DAYS: i64 = 30;

pub const DEFAULT_TREND_DAYS: i64 = 30;
pub const GATE_MIN_SAMPLE_EPISODES: i64 = 10;
pub const GATE_MIN_EVENTS_7D: i64 = 100;
pub const GATE_MIN_PRECISION_PROXY: f64 = 0.65;
pub const GATE_MAX_CORRECTION_RATE: f64 = 0.30;
pub const GATE_MAX_BOUNDEDNESS_GROWTH_RATIO: f64 = 0.20;
pub const GATE_MIN_BOUNDEDNESS_GROWTH_FLOOR: f64 = 5.0;
pub const GATE_PLATEAU_DELTA: f64 = 0.05;

pub const PSEUDO_EMBEDDING_DIM: usize = 64;
pub const PSEUDO_EMBEDDING_SALT: &str = "pseudo-v1";
