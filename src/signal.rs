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
//! Test signal generators. Each one works as a master, stamping the group's
//! times, or as a follower reusing them.

use std::any::Any;
use std::f64::consts::{FRAC_PI_2, TAU};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::engine::Engine;
use crate::source::{Generator, ReadStatus, Tick};

/// Writes every frame due this tick. `sample` gets the frame's time and a
/// channel number.
fn write_due(
    engine: &mut Engine,
    tick: &Tick,
    mut sample: impl FnMut(f64, usize) -> f32,
) -> ReadStatus {
    let mut written = 0;
    while written < tick.frame_count {
        let Some(mut run) = engine.set_frames(tick.source, tick.frame_count - written) else {
            break;
        };
        for k in 0..run.len() {
            let t = run.resolve_time(k, tick.prev_time + (written + k + 1) as f64 * tick.delta_t);
            for (channel, value) in run.frame_mut(k).iter_mut().enumerate() {
                *value = sample(t, channel);
            }
        }
        written += run.len();
    }

    if written > 0 {
        ReadStatus::Wrote
    } else {
        ReadStatus::Idle
    }
}

/// A sine wave. Every further channel lags the previous one by a quarter
/// turn, so two channels draw a circle.
pub struct Sine {
    frequency: f64,
    amplitude: f64,
    phase: f64,
}

impl Sine {
    pub fn new(frequency: f64, amplitude: f64) -> Sine {
        Sine {
            frequency,
            amplitude,
            phase: 0.0,
        }
    }

    /// Sets the phase of the first channel, in radians.
    pub fn with_phase(mut self, phase: f64) -> Sine {
        self.phase = phase;
        self
    }

    fn sample(&self, t: f64, channel: usize) -> f32 {
        let angle = TAU * self.frequency * t + self.phase - channel as f64 * FRAC_PI_2;
        (self.amplitude * angle.sin()) as f32
    }
}

impl Generator for Sine {
    fn read(&mut self, engine: &mut Engine, tick: &Tick) -> ReadStatus {
        write_due(engine, tick, |t, channel| self.sample(t, channel))
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Uniform noise in `[-amplitude, amplitude)`.
pub struct Noise {
    amplitude: f32,
    rng: StdRng,
}

impl Noise {
    /// Creates a noise source. A seed makes the sequence repeatable.
    pub fn new(amplitude: f32, seed: Option<u64>) -> Noise {
        Noise {
            amplitude,
            rng: match seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            },
        }
    }
}

impl Generator for Noise {
    fn read(&mut self, engine: &mut Engine, tick: &Tick) -> ReadStatus {
        let amplitude = self.amplitude;
        if amplitude <= 0.0 {
            return write_due(engine, tick, |_, _| 0.0);
        }
        let rng = &mut self.rng;
        write_due(engine, tick, |_, _| rng.gen_range(-amplitude..amplitude))
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A square wave. As a follower it lifts the pen at every edge and writes
/// the new level at the same instant, so edges are drawn as gaps instead of
/// slopes.
pub struct Square {
    frequency: f64,
    amplitude: f32,
    high: Option<bool>,
}

impl Square {
    pub fn new(frequency: f64, amplitude: f32) -> Square {
        Square {
            frequency,
            amplitude,
            high: None,
        }
    }
}

impl Generator for Square {
    fn read(&mut self, engine: &mut Engine, tick: &Tick) -> ReadStatus {
        let mut written = 0;
        while written < tick.frame_count {
            let Some(mut run) = engine.set_frames(tick.source, 1) else {
                break;
            };
            written += 1;
            let t = run.resolve_time(0, tick.prev_time + written as f64 * tick.delta_t);
            let high = (t * self.frequency).rem_euclid(1.0) < 0.5;
            let edge = self.high.is_some_and(|was| was != high);
            self.high = Some(high);
            let value = if high { self.amplitude } else { -self.amplitude };

            if edge && !run.stamps_time() {
                run.fill(f32::NAN);
                if let Some(mut extra) = engine.append_frame(tick.source) {
                    extra.fill(value);
                }
            } else {
                run.fill(value);
            }
        }

        if written > 0 {
            ReadStatus::Wrote
        } else {
            ReadStatus::Idle
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
