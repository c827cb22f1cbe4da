// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//
use crate::error::EngineError;

/// Typed error for scope file failures so callers can tell a file that
/// failed to parse from one that names things that don't exist.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config load/parse error: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid duration {value:?}: {message}")]
    Duration { value: String, message: String },

    #[error("No sources configured")]
    NoSources,

    #[error("Unknown source: {0}")]
    UnknownSource(String),

    #[error("Duplicate source name: {0}")]
    DuplicateSource(String),

    #[error("Source {name}: {source}")]
    Engine {
        name: String,
        #[source]
        source: EngineError,
    },
}
