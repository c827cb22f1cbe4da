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
use std::time::Duration;

use serde::Deserialize;

use super::{parse_duration, ConfigError};
use crate::sweep::{Slope, SweepParams};

const DEFAULT_PERIOD: Duration = Duration::from_secs(1);
const DEFAULT_HOLD_OFF: Duration = Duration::ZERO;

/// A YAML representation of a sweep.
#[derive(Deserialize, Clone, Debug)]
pub struct Sweep {
    name: String,

    /// The name of the source that triggers the sweep.
    input: String,

    /// The input channel to watch (default: 0).
    channel: Option<usize>,

    /// Length of one sweep as a duration string (default: 1s).
    period: Option<String>,

    /// Trigger level in input units (default: 0).
    level: Option<f32>,

    /// rising, falling or free (default: rising).
    slope: Option<Slope>,

    /// Wait after a sweep before arming again (default: 0s).
    hold_off: Option<String>,

    /// Seconds between trigger and sweep start. Negative values start the
    /// sweep before the trigger.
    delay: Option<f64>,
}

impl Sweep {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn input(&self) -> &str {
        &self.input
    }

    pub fn channel(&self) -> usize {
        self.channel.unwrap_or(0)
    }

    /// Returns the sweep parameters with defaults filled in.
    pub fn params(&self) -> Result<SweepParams, ConfigError> {
        let period = match &self.period {
            Some(period) => parse_duration(period)?,
            None => DEFAULT_PERIOD,
        };
        let hold_off = match &self.hold_off {
            Some(hold_off) => parse_duration(hold_off)?,
            None => DEFAULT_HOLD_OFF,
        };
        Ok(SweepParams {
            period: period.as_secs_f64(),
            level: self.level.unwrap_or(0.0),
            slope: self.slope.unwrap_or_default(),
            hold_off: hold_off.as_secs_f64(),
            delay: self.delay.unwrap_or(0.0),
        })
    }
}
