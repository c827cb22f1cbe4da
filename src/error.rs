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
use crate::engine::SourceId;

/// Errors reported by the engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Source {0:?} does not exist")]
    NoSuchSource(SourceId),

    #[error("Group does not exist")]
    NoSuchGroup,

    #[error("Iterator does not exist")]
    NoSuchIterator,

    #[error("Invalid buffer size: {0} frames")]
    InvalidBufferSize(usize),

    #[error("Invalid channel count: {0}")]
    InvalidChannelCount(usize),

    #[error("Channel {channel} out of range for a source with {num_channels} channels")]
    ChannelOutOfRange { channel: usize, num_channels: usize },

    #[error("Invalid sweep period: {0}")]
    InvalidPeriod(f64),

    #[error("Sources do not share a group")]
    GroupMismatch,

    #[error("Cannot join a group of {actual} frames with a request for {requested} frames")]
    FrameCountMismatch { requested: usize, actual: usize },

    #[error("Incompatible sample rate types: source is {source_type}, group is {group_type}")]
    IncompatibleRates {
        source_type: &'static str,
        group_type: &'static str,
    },

    #[error("{count} consecutive underruns, the reader cannot keep up in real time")]
    Underrun { count: u32 },
}
