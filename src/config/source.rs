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
use serde::Deserialize;

use crate::engine::{Engine, SourceId, SourceOptions};
use crate::error::EngineError;
use crate::rate::SampleRates;
use crate::signal;

const DEFAULT_CHANNELS: usize = 1;
const DEFAULT_FRAMES: usize = 1024;
const DEFAULT_SAMPLE_RATE: f64 = 1000.0;
const DEFAULT_AMPLITUDE: f64 = 1.0;

fn default_amplitude() -> f64 {
    DEFAULT_AMPLITUDE
}

/// The waveform a configured source produces.
#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    Sine {
        frequency: f64,
        #[serde(default = "default_amplitude")]
        amplitude: f64,
        /// Radians.
        #[serde(default)]
        phase: f64,
    },
    Noise {
        #[serde(default = "default_amplitude")]
        amplitude: f64,
        /// Fixes the sequence when set.
        seed: Option<u64>,
    },
    Square {
        frequency: f64,
        #[serde(default = "default_amplitude")]
        amplitude: f64,
    },
}

/// The rate constraint a configured source brings to its group.
#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Rate {
    Fixed(f64),
    Selectable(Vec<f64>),
    /// Inclusive bounds, in either order.
    Variable([f64; 2]),
    Tolerant(f64),
    Custom,
}

impl Rate {
    /// Returns the constraint and the rate this source would like.
    fn declare(&self) -> (SampleRates, f64) {
        match self {
            Rate::Fixed(rate) => (SampleRates::Fixed(*rate), *rate),
            Rate::Selectable(rates) => {
                let wanted = rates.iter().copied().fold(0.0, f64::max);
                (SampleRates::selectable(rates.iter().copied()), wanted)
            }
            Rate::Variable([a, b]) => (SampleRates::variable(*a, *b), a.max(*b)),
            Rate::Tolerant(rate) => (SampleRates::tolerant(*rate), *rate),
            Rate::Custom => (SampleRates::Custom, 0.0),
        }
    }
}

/// A YAML representation of a signal source.
#[derive(Deserialize, Clone, Debug)]
pub struct Source {
    /// The name sweeps and plots refer to this source by.
    name: String,

    signal: Signal,

    /// Values per frame (default: 1).
    channels: Option<usize>,

    /// Ring size when this source is a master (default: 1024).
    frames: Option<usize>,

    /// The name of a source whose group this one joins. Without it the
    /// source becomes the master of a new group.
    group: Option<String>,

    /// Masters default to a fixed 1000 Hz; joiners default to no
    /// constraint.
    rate: Option<Rate>,
}

impl Source {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn signal(&self) -> &Signal {
        &self.signal
    }

    pub fn channels(&self) -> usize {
        self.channels.unwrap_or(DEFAULT_CHANNELS)
    }

    /// The group this source joins, by source name.
    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    /// Returns the layout and rate options for this source.
    pub fn options(&self) -> SourceOptions {
        let joins = self.group.is_some();
        let (rates, sample_rate) = match &self.rate {
            Some(rate) => rate.declare(),
            None if joins => (SampleRates::None, 0.0),
            None => (SampleRates::Fixed(DEFAULT_SAMPLE_RATE), DEFAULT_SAMPLE_RATE),
        };
        SourceOptions {
            num_channels: self.channels(),
            max_num_frames: match self.frames {
                Some(frames) => frames,
                None if joins => 0,
                None => DEFAULT_FRAMES,
            },
            rates,
            sample_rate,
        }
    }

    /// Creates the source in `engine`, joining the group of `group_source`
    /// when given.
    pub fn create(
        &self,
        engine: &mut Engine,
        group_source: Option<SourceId>,
    ) -> Result<SourceId, EngineError> {
        let options = self.options();
        match self.signal {
            Signal::Sine {
                frequency,
                amplitude,
                phase,
            } => engine.create_source(
                signal::Sine::new(frequency, amplitude).with_phase(phase),
                options,
                group_source,
            ),
            Signal::Noise { amplitude, seed } => engine.create_source(
                signal::Noise::new(amplitude as f32, seed),
                options,
                group_source,
            ),
            Signal::Square { frequency, amplitude } => engine.create_source(
                signal::Square::new(frequency, amplitude as f32),
                options,
                group_source,
            ),
        }
    }
}
