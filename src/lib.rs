// Copyright 2018-2021 Parity Technologies (UK) Ltd.
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

#![forbid(unsafe_code)]

//! `memory_archive`: a local-first episodic memory store. Conversational
//! episodes are recorded into an append-only event log; a reducer projects
//! that log into durable, retrievable "cards" through a deterministic
//! consolidation, retrieval, and dispute pipeline.

pub mod config;
pub mod database;
pub mod engine;
pub mod error;
pub mod logger;
pub mod rules;
pub mod text;
pub mod types;
pub mod util;

pub use self::config::Config;
pub use self::engine::Engine;
pub use self::error::ArchiveError;
pub use self::util::memory_archive_dir;

pub mod test_util;
