// Copyright 2017-2021 Parity Technologies (UK) Ltd.
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

use std::{env, fmt, io};
use thiserror::Error;

pub type Result<T, E = ArchiveError> = std::result::Result<T, E>;

/// Memory Archive Error Enum
#[derive(Debug, Error)]
pub enum ArchiveError {
	#[error(transparent)]
	Io(#[from] io::Error),
	#[error(transparent)]
	Env(#[from] env::VarError),

	#[error(transparent)]
	Serialization(#[from] serde_json::Error),

	#[error(transparent)]
	Fmt(#[from] fmt::Error),
	#[error("sqlx error: {0}")]
	Sql(#[from] sqlx::Error),
	#[error("migration error: {0}")]
	Migration(#[from] sqlx::migrate::MigrateError),

	/// missing episode/evidence/pack/card
	#[error("not found: {0}")]
	NotFound(String),

	/// bad channel, bad outcome type, missing required argument
	#[error("invalid input: {0}")]
	InvalidInput(String),

	/// a consolidation gate rejected a candidate; carried internally and
	/// turned into a `card_rejected` event rather than surfaced as an error
	#[error("invariant violated: {reason_code}")]
	InvariantViolation { reason_code: String },

	/// orphan row or missing `*_recorded` event detected by `status`/`recover`
	#[error("recovery required: {0}")]
	RecoveryRequired(String),

	#[error("{0}")]
	General(String),
}

impl From<&str> for ArchiveError {
	fn from(e: &str) -> Self {
		ArchiveError::General(e.to_string())
	}
}

impl From<String> for ArchiveError {
	fn from(e: String) -> Self {
		ArchiveError::General(e)
	}
}
