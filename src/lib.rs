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
//! Multi-rate sample streams sharing master-clocked ring buffers, readers
//! that walk them without blocking writers, and a triggered sweep time base.

pub mod config;
pub mod engine;
pub mod error;
pub mod group;
pub mod iterator;
pub mod lap;
pub mod rate;
pub mod scheduler;
pub mod signal;
pub mod source;
pub mod sweep;
#[cfg(test)]
mod testutil;

pub use engine::{Engine, EngineSettings, GroupId, Iter2Id, IterId, SourceId, SourceOptions};
pub use error::EngineError;
pub use source::{Generator, ReadStatus, Tick};
