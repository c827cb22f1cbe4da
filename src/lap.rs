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
//! Lap counting for ring buffers.
//!
//! Every ring in a group counts how many times it has wrapped. The counters
//! are free to overflow: two counters are only ever compared through their
//! wrapping signed difference, which stays correct as long as the two laps
//! being compared are less than 2^31 apart.

use std::cmp::Ordering;
use std::fmt;

/// The number of times a ring buffer has wrapped.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct LapCount(u32);

impl LapCount {
    /// The lap before the first one. Rings start here so that their first
    /// write lands on lap zero.
    pub const BEFORE_START: LapCount = LapCount(u32::MAX);

    /// Creates a lap counter with the given raw value.
    pub const fn new(raw: u32) -> LapCount {
        LapCount(raw)
    }

    /// Returns the raw counter value.
    pub fn raw(self) -> u32 {
        self.0
    }

    /// Returns the following lap.
    pub fn next(self) -> LapCount {
        LapCount(self.0.wrapping_add(1))
    }

    /// Returns the preceding lap.
    pub fn prev(self) -> LapCount {
        LapCount(self.0.wrapping_sub(1))
    }

    /// How many laps `self` is ahead of `other`. Negative when behind.
    pub fn diff(self, other: LapCount) -> i32 {
        self.0.wrapping_sub(other.0) as i32
    }
}

impl fmt::Debug for LapCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lap {}", self.0 as i32)
    }
}

/// An absolute instant on a group's timeline: the lap of the shared time
/// array together with the time-index inside that lap.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Position {
    pub lap: LapCount,
    pub index: usize,
}

impl Position {
    /// Creates a position.
    pub fn new(lap: LapCount, index: usize) -> Position {
        Position { lap, index }
    }

    /// Number of instants from `other` to `self` on a timeline with
    /// `frames` instants per lap. Negative when `self` is earlier.
    pub fn distance(self, other: Position, frames: usize) -> i64 {
        self.lap.diff(other.lap) as i64 * frames as i64 + self.index as i64 - other.index as i64
    }

    /// The instant after this one.
    pub fn succ(self, frames: usize) -> Position {
        if self.index + 1 >= frames {
            Position::new(self.lap.next(), 0)
        } else {
            Position::new(self.lap, self.index + 1)
        }
    }
}

impl PartialOrd for Position {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Position {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.lap.diff(other.lap).cmp(&0) {
            Ordering::Equal => self.index.cmp(&other.index),
            ordering => ordering,
        }
    }
}
