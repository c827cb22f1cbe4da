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
//! The triggered time base. A sweep reads one channel of another source and
//! writes a ramp from -0.5 to 0.5 that restarts whenever the input crosses a
//! level, the way an analog oscilloscope's X deflection does.

use std::any::Any;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::engine::{Engine, IterId, SourceId, SourceOptions};
use crate::error::EngineError;
use crate::iterator::Reading;
use crate::source::{Generator, ReadStatus, Tick};

/// The edge that triggers a sweep.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Slope {
    Falling,
    /// Trigger on every sample once armed.
    Free,
    #[default]
    Rising,
}

impl From<i32> for Slope {
    fn from(sign: i32) -> Self {
        match sign {
            s if s < 0 => Slope::Falling,
            0 => Slope::Free,
            _ => Slope::Rising,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SweepState {
    /// Waiting out the hold-off after a sweep.
    Held,
    /// Waiting for the trigger condition.
    Armed,
    /// Triggered, waiting for a positive delay to pass.
    Triggered,
    /// Writing the ramp.
    Run,
}

/// User settings of a sweep.
#[derive(Clone, Debug, PartialEq)]
pub struct SweepParams {
    /// Seconds per sweep.
    pub period: f64,
    /// Trigger level in input units.
    pub level: f32,
    pub slope: Slope,
    /// Seconds to wait after a sweep before arming again.
    pub hold_off: f64,
    /// Seconds between the trigger and the start of the sweep. Negative
    /// values start the sweep before the trigger, from buffered input.
    pub delay: f64,
}

impl Default for SweepParams {
    fn default() -> Self {
        SweepParams {
            period: 1.0,
            level: 0.0,
            slope: Slope::Rising,
            hold_off: 0.0,
            delay: 0.0,
        }
    }
}

/// The sweep generator. Create one with [`Sweep::create`] and reach it
/// afterwards through [`Engine::generator_mut`].
pub struct Sweep {
    params: SweepParams,
    /// Takes effect at the next trigger.
    new_delay: f64,
    state: SweepState,
    start_t: f64,
    prev_value_read: f32,
    prev_time_read: f64,
    prev_value_out: f32,
    last_time: f64,
    holdoff_until_t: f64,
    pen_lift_pending: bool,
    input: IterId,
    back: IterId,
}

impl Sweep {
    /// Creates a sweep source driven by one channel of `input`. The sweep
    /// joins the input's group and is destroyed together with the input.
    pub fn create(
        engine: &mut Engine,
        input: SourceId,
        channel: usize,
        params: SweepParams,
    ) -> Result<SourceId, EngineError> {
        if params.period.is_nan() || params.period <= 0.0 {
            return Err(EngineError::InvalidPeriod(params.period));
        }

        let forward = engine.create_iter(input, channel)?;
        let back = match engine.create_iter(input, channel) {
            Ok(back) => back,
            Err(e) => {
                engine.destroy_iter(forward);
                return Err(e);
            }
        };

        let sweep = Sweep {
            new_delay: params.delay,
            prev_value_read: rest_value(params.slope),
            params,
            state: SweepState::Held,
            start_t: 0.0,
            prev_time_read: 0.0,
            prev_value_out: f32::NAN,
            last_time: 0.0,
            holdoff_until_t: f64::NEG_INFINITY,
            pen_lift_pending: false,
            input: forward,
            back,
        };
        let id = match engine.create_source(sweep, SourceOptions::follower(1), Some(input)) {
            Ok(id) => id,
            Err(e) => {
                engine.destroy_iter(forward);
                engine.destroy_iter(back);
                return Err(e);
            }
        };
        engine.add_dependent(input, id)?;
        Ok(id)
    }

    pub fn params(&self) -> &SweepParams {
        &self.params
    }

    pub fn state(&self) -> SweepState {
        self.state
    }

    /// The time the current sweep started at.
    pub fn start_time(&self) -> f64 {
        self.start_t
    }

    /// The delay that takes effect at the next trigger.
    pub fn pending_delay(&self) -> f64 {
        self.new_delay
    }

    /// The last ramp value written, NaN outside of a sweep.
    pub fn last_output(&self) -> f32 {
        self.prev_value_out
    }

    /// Changes the period. A running sweep continues from its current value
    /// at the new speed.
    pub fn set_period(&mut self, period: f64) {
        if period.is_nan() || period <= 0.0 {
            warn!(period, "Ignoring invalid sweep period");
            return;
        }
        if self.state == SweepState::Run && self.prev_value_out.is_finite() {
            self.start_t = self.last_time - (self.prev_value_out as f64 + 0.5) * period;
        }
        self.params.period = period;
    }

    pub fn set_level(&mut self, level: f32) {
        self.params.level = level;
    }

    /// Changes the trigger slope. Switching into or out of free running
    /// lifts the pen.
    pub fn set_slope(&mut self, slope: Slope) {
        if (slope == Slope::Free) != (self.params.slope == Slope::Free) {
            self.pen_lift_pending = true;
        }
        self.params.slope = slope;
        self.prev_value_read = rest_value(slope);
    }

    /// Changes the hold-off. A pending hold-off moves by the difference.
    pub fn set_hold_off(&mut self, hold_off: f64) {
        if self.state == SweepState::Held {
            self.holdoff_until_t += hold_off - self.params.hold_off;
        }
        self.params.hold_off = hold_off;
    }

    /// Sets the delay used from the next trigger on.
    pub fn set_delay(&mut self, delay: f64) {
        self.new_delay = delay;
    }

    fn consume(&mut self, engine: &mut Engine, id: SourceId, reading: Reading) -> bool {
        let mut wrote = false;
        self.last_time = reading.time;

        if self.state == SweepState::Held && reading.time >= self.holdoff_until_t {
            self.state = SweepState::Armed;
            self.prev_value_read = rest_value(self.params.slope);
        }

        if self.state == SweepState::Armed {
            if let Some(crossing) = self.crossing(&reading) {
                self.params.delay = self.new_delay;
                self.start_t = crossing + self.params.delay;
                debug!(source = ?id, at = crossing, start = self.start_t, "Sweep triggered");
                if self.params.delay > 0.0 {
                    self.state = SweepState::Triggered;
                } else {
                    self.state = SweepState::Run;
                    if self.params.delay < 0.0 {
                        wrote |= self.replay(engine, id);
                    }
                }
            }
        }

        if self.state == SweepState::Triggered && reading.time >= self.start_t {
            self.state = SweepState::Run;
        }

        if self.state == SweepState::Run {
            wrote |= self.emit(engine, id, &reading);
        }

        self.prev_value_read = if reading.value.is_nan() {
            rest_value(self.params.slope)
        } else {
            reading.value
        };
        self.prev_time_read = reading.time;
        wrote
    }

    /// The time the input crossed the trigger level, if it did.
    fn crossing(&self, reading: &Reading) -> Option<f64> {
        let (p, v, level) = (self.prev_value_read, reading.value, self.params.level);
        if v.is_nan() {
            return None;
        }
        let fired = match self.params.slope {
            Slope::Rising => p <= level && level <= v && p < v,
            Slope::Falling => p >= level && level >= v && p > v,
            Slope::Free => true,
        };
        if !fired {
            return None;
        }
        if self.params.slope == Slope::Free || !p.is_finite() {
            return Some(reading.time);
        }
        let fraction = ((level - p) / (v - p)) as f64;
        Some(self.prev_time_read + fraction * (reading.time - self.prev_time_read))
    }

    fn emit(&mut self, engine: &mut Engine, id: SourceId, reading: &Reading) -> bool {
        let x = ((reading.time - self.start_t) / self.params.period).max(0.0);
        let value = (x - 0.5) as f32;
        // Phases within f32 rounding of the end still wrap.
        if x >= 1.0 || value >= 0.5 {
            // Wrapped: lift the pen and wait out the hold-off.
            self.prev_value_out = f32::NAN;
            self.state = SweepState::Held;
            self.holdoff_until_t = self.start_t + self.params.period + self.params.hold_off;
            return write(engine, id, reading, f32::NAN);
        }

        let mut wrote = false;
        if self.pen_lift_pending {
            self.pen_lift_pending = false;
            wrote |= write(engine, id, reading, f32::NAN);
        }
        self.prev_value_out = value;
        wrote | write(engine, id, reading, value)
    }

    /// Writes the buffered input between the sweep start and the current
    /// reading, for sweeps that start before their trigger.
    fn replay(&mut self, engine: &mut Engine, id: SourceId) -> bool {
        let Some(own) = engine.position(id) else {
            return false;
        };
        if engine.iter_copy_position(self.back, self.input).is_err() {
            return false;
        }

        let mut count = 0;
        loop {
            match engine.iter_get_back(self.back) {
                Some(prev) if prev.time >= self.start_t && prev.position > own => count += 1,
                Some(_) => {
                    engine.iter_reading(self.back);
                    break;
                }
                None => {
                    warn!(
                        source = ?id,
                        start = self.start_t,
                        "Not enough input history for the sweep delay"
                    );
                    break;
                }
            }
        }
        if count == 0 {
            return false;
        }

        let mut wrote = false;
        let mut reading = engine.iter_current(self.back);
        for _ in 0..count {
            let Some(current) = reading else {
                break;
            };
            if self.state != SweepState::Run {
                break;
            }
            wrote |= self.emit(engine, id, &current);
            reading = engine.iter_reading(self.back);
        }
        wrote
    }

    /// Keeps the sweep's own position close behind its input while it is not
    /// running, leaving room for a delayed start to write into.
    fn backfill(&mut self, engine: &mut Engine, id: SourceId) -> bool {
        let reach = self.params.delay.min(self.new_delay).min(0.0);
        let Some(current) = engine.iter_current(self.input) else {
            return false;
        };

        let target = if reach == 0.0 {
            current
        } else {
            if engine.iter_copy_position(self.back, self.input).is_err() {
                return false;
            }
            loop {
                match engine.iter_get_back(self.back) {
                    Some(prev) if prev.time >= current.time + reach => {}
                    Some(prev) => break prev,
                    None => return false,
                }
            }
        };

        match engine.position(id) {
            Some(own) if target.position > own => write(engine, id, &target, f32::NAN),
            _ => false,
        }
    }
}

/// A previous value that cannot complete a crossing for the slope.
fn rest_value(slope: Slope) -> f32 {
    match slope {
        Slope::Falling => f32::NEG_INFINITY,
        _ => f32::INFINITY,
    }
}

fn write(engine: &mut Engine, id: SourceId, reading: &Reading, value: f32) -> bool {
    match engine.write_frame_at(id, reading.position) {
        Some(mut run) => {
            run.fill(value);
            true
        }
        None => false,
    }
}

impl Generator for Sweep {
    fn read(&mut self, engine: &mut Engine, tick: &Tick) -> ReadStatus {
        let id = tick.source;
        let mut wrote = false;
        loop {
            let reading = engine.iter_reading(self.input);
            let reset = engine.iter_take_reset(self.input);
            if reset {
                debug!(source = ?id, "Sweep input was reset");
                self.prev_value_read = rest_value(self.params.slope);
                self.pen_lift_pending = true;
            }
            match reading {
                Some(reading) => wrote |= self.consume(engine, id, reading),
                None if reset => continue,
                None => break,
            }
        }

        if self.state != SweepState::Run {
            wrote |= self.backfill(engine, id);
        }

        if wrote {
            ReadStatus::Wrote
        } else {
            ReadStatus::Idle
        }
    }

    fn on_destroy(&mut self, engine: &mut Engine) {
        engine.destroy_iter(self.input);
        engine.destroy_iter(self.back);
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testutil::{drain, idle};

    const DT: f64 = 0.1;

    struct Bench {
        engine: Engine,
        input: SourceId,
        sweep: SourceId,
        output: IterId,
        t: usize,
    }

    impl Bench {
        fn new(params: SweepParams) -> Bench {
            let mut engine = Engine::new();
            let input = engine
                .create_source(idle(), SourceOptions::fixed(1, 256, 1.0 / DT), None)
                .unwrap();
            let sweep = Sweep::create(&mut engine, input, 0, params).unwrap();
            let output = engine.create_iter(sweep, 0).unwrap();
            Bench {
                engine,
                input,
                sweep,
                output,
                t: 0,
            }
        }

        /// Feeds one input sample per value and reads the sweep after each.
        fn feed(&mut self, values: impl IntoIterator<Item = f32>) {
            for value in values {
                let time = self.t as f64 * DT;
                let mut run = self.engine.set_frames(self.input, 1).unwrap();
                run.resolve_time(0, time);
                run.fill(value);
                self.t += 1;
                self.engine.read(self.sweep, time).unwrap();
            }
        }

        /// Feeds the input's own time as its value.
        fn feed_ramp(&mut self, count: usize) {
            let start = self.t;
            self.feed((start..start + count).map(|k| (k as f64 * DT) as f32));
        }

        fn sweep(&mut self) -> &mut Sweep {
            self.engine.generator_mut::<Sweep>(self.sweep).unwrap()
        }

        fn output(&mut self) -> Vec<(f32, f64)> {
            drain(&mut self.engine, self.output)
        }

        fn finite_output(&mut self) -> Vec<(f32, f64)> {
            self.output()
                .into_iter()
                .filter(|(value, _)| value.is_finite())
                .collect()
        }
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-5
    }

    fn assert_output(actual: &[(f32, f64)], expected: &[(f64, f64)]) {
        assert_eq!(actual.len(), expected.len(), "{actual:?}");
        for ((value, time), (want_value, want_time)) in actual.iter().zip(expected) {
            assert!(close(*value as f64, *want_value), "{actual:?}");
            assert!(close(*time, *want_time), "{actual:?}");
        }
    }

    #[test]
    fn test_slope_from_sign() {
        assert_eq!(Slope::from(-3), Slope::Falling);
        assert_eq!(Slope::from(0), Slope::Free);
        assert_eq!(Slope::from(1), Slope::Rising);
    }

    #[test]
    fn test_interpolated_trigger() {
        let mut bench = Bench::new(SweepParams {
            level: 0.45,
            ..Default::default()
        });
        bench.feed_ramp(5);
        assert_eq!(bench.sweep().state(), SweepState::Armed);

        bench.feed_ramp(1);
        assert_eq!(bench.sweep().state(), SweepState::Run);
        assert!(close(bench.sweep().start_time(), 0.45));
        assert_output(&bench.finite_output(), &[(0.05 - 0.5, 0.5)]);
    }

    #[test]
    fn test_falling_trigger() {
        let mut bench = Bench::new(SweepParams {
            level: -0.25,
            slope: Slope::Falling,
            ..Default::default()
        });
        bench.feed([0.0, 0.0, -0.5]);
        assert_eq!(bench.sweep().state(), SweepState::Run);
        assert!(close(bench.sweep().start_time(), 0.15));
    }

    #[test]
    fn test_no_trigger_on_first_sample() {
        let mut bench = Bench::new(SweepParams {
            level: 0.5,
            ..Default::default()
        });
        // Already above the level when armed: not a crossing.
        bench.feed([1.0, 1.0, 1.0]);
        assert_eq!(bench.sweep().state(), SweepState::Armed);
        bench.feed([0.0, 1.0]);
        assert_eq!(bench.sweep().state(), SweepState::Run);
    }

    #[test]
    fn test_pen_lift_in_input_resets_polarity() {
        let mut bench = Bench::new(SweepParams {
            level: 0.5,
            ..Default::default()
        });
        bench.feed([0.0, f32::NAN, 1.0]);
        assert_eq!(bench.sweep().state(), SweepState::Armed);
    }

    #[test]
    fn test_output_range_and_wrap_pen_lift() {
        let mut bench = Bench::new(SweepParams {
            period: 0.5,
            ..Default::default()
        });
        let mut output = Vec::new();
        for chunk in 0..6 {
            bench.feed((0..50).map(|k| {
                let cycles = (chunk * 50 + k) as f64 * 0.01;
                (cycles * std::f64::consts::TAU).sin() as f32 + 0.1
            }));
            output.extend(bench.output());
        }

        let finite: Vec<f32> = output
            .iter()
            .map(|(v, _)| *v)
            .filter(|v| v.is_finite())
            .collect();
        assert!(!finite.is_empty());
        assert!(finite.iter().all(|v| (-0.5..0.5).contains(v)));

        // Consecutive values only ever climb; every restart is preceded by a
        // pen-lift.
        for pair in output.windows(2) {
            let (a, b) = (pair[0].0, pair[1].0);
            if a.is_finite() && b.is_finite() {
                assert!(b > a, "{output:?}");
            }
        }
        let lifts = output.iter().filter(|(v, _)| v.is_nan()).count();
        assert!(lifts >= 2);
    }

    #[test]
    fn test_output_stays_below_half_off_grid() {
        let mut engine = Engine::new();
        let input = engine
            .create_source(idle(), SourceOptions::fixed(1, 256, 100.0), None)
            .unwrap();
        let sweep = Sweep::create(
            &mut engine,
            input,
            0,
            SweepParams {
                period: 0.07,
                slope: Slope::Free,
                ..Default::default()
            },
        )
        .unwrap();
        let output = engine.create_iter(sweep, 0).unwrap();

        let mut finite = Vec::new();
        for k in 0..4000 {
            let time = k as f64 * 0.01;
            let mut run = engine.set_frames(input, 1).unwrap();
            run.resolve_time(0, time);
            run.fill(0.0);
            engine.read(sweep, time).unwrap();
            finite.extend(
                drain(&mut engine, output)
                    .into_iter()
                    .filter(|(value, _)| value.is_finite()),
            );
        }

        assert!(finite.len() > 1000);
        let out_of_range: Vec<_> = finite
            .iter()
            .filter(|(value, _)| !(-0.5..0.5).contains(value))
            .collect();
        assert!(out_of_range.is_empty(), "{out_of_range:?}");
    }

    #[test]
    fn test_positive_delay() {
        let mut bench = Bench::new(SweepParams {
            level: 0.45,
            delay: 0.2,
            ..Default::default()
        });
        bench.feed_ramp(7);
        assert_eq!(bench.sweep().state(), SweepState::Triggered);
        assert!(close(bench.sweep().start_time(), 0.65));
        assert!(bench.finite_output().is_empty());

        bench.feed_ramp(1);
        assert_eq!(bench.sweep().state(), SweepState::Run);
        assert_output(&bench.finite_output(), &[(0.05 - 0.5, 0.7)]);
    }

    #[test]
    fn test_negative_delay_replays_history() {
        let mut bench = Bench::new(SweepParams {
            level: 0.45,
            delay: -0.22,
            ..Default::default()
        });
        bench.feed_ramp(5);
        let before = bench.output();
        assert!(before.iter().all(|(v, _)| v.is_nan()));

        bench.feed_ramp(1);
        assert!(close(bench.sweep().start_time(), 0.23));
        assert_output(
            &bench.finite_output(),
            &[(0.07 - 0.5, 0.3), (0.17 - 0.5, 0.4), (0.27 - 0.5, 0.5)],
        );
    }

    #[test]
    fn test_hold_off() {
        let mut bench = Bench::new(SweepParams {
            period: 0.2,
            slope: Slope::Free,
            hold_off: 0.45,
            ..Default::default()
        });
        bench.feed([0.0; 8]);
        assert_output(
            &bench.finite_output(),
            &[(-0.5, 0.0), (0.0, 0.1), (-0.5, 0.7)],
        );
    }

    #[test]
    fn test_set_hold_off_moves_deadline() {
        let mut bench = Bench::new(SweepParams {
            period: 0.2,
            slope: Slope::Free,
            hold_off: 0.45,
            ..Default::default()
        });
        bench.feed([0.0; 4]);
        assert_eq!(bench.sweep().state(), SweepState::Held);
        bench.sweep().set_hold_off(0.05);
        bench.feed([0.0]);
        assert_eq!(bench.sweep().state(), SweepState::Run);
        assert!(close(bench.sweep().start_time(), 0.4));
    }

    #[test]
    fn test_set_period_keeps_value() {
        let mut bench = Bench::new(SweepParams {
            period: 1.0,
            slope: Slope::Free,
            ..Default::default()
        });
        bench.feed([0.0; 4]);
        let value = bench.sweep().last_output();
        assert!(close(value as f64, -0.2));

        bench.sweep().set_period(2.0);
        assert!(close(bench.sweep().start_time(), 0.3 - 0.3 * 2.0));
        bench.feed([0.0]);
        let output = bench.finite_output();
        assert!(close(output.last().unwrap().0 as f64, -0.2 + 0.05));
    }

    #[test]
    fn test_set_slope_lifts_pen() {
        let mut bench = Bench::new(SweepParams {
            period: 10.0,
            level: 0.05,
            ..Default::default()
        });
        bench.feed_ramp(3);
        bench.output();

        bench.sweep().set_slope(Slope::Free);
        bench.feed_ramp(1);
        let output = bench.output();
        assert_eq!(output.len(), 2);
        assert!(output[0].0.is_nan());
        assert_eq!(output[0].1, output[1].1);
        assert!(output[1].0.is_finite());

        bench.sweep().set_slope(Slope::Falling);
        bench.feed_ramp(1);
        assert_eq!(bench.output().len(), 2);
    }

    #[test]
    fn test_delay_commits_at_trigger() {
        let mut bench = Bench::new(SweepParams {
            period: 0.2,
            slope: Slope::Free,
            ..Default::default()
        });
        bench.feed([0.0]);
        bench.sweep().set_delay(0.15);
        assert_eq!(bench.sweep().params().delay, 0.0);
        assert_eq!(bench.sweep().pending_delay(), 0.15);

        // Wraps at 0.2, re-arms and triggers at 0.3 with the new delay.
        bench.feed([0.0; 3]);
        assert_eq!(bench.sweep().params().delay, 0.15);
        assert_eq!(bench.sweep().state(), SweepState::Triggered);
        assert!(close(bench.sweep().start_time(), 0.45));
    }

    #[test]
    fn test_destroying_input_destroys_sweep() {
        let mut bench = Bench::new(SweepParams::default());
        let follower = bench
            .engine
            .create_source(idle(), SourceOptions::follower(1), Some(bench.input))
            .unwrap();
        let sweep = Sweep::create(&mut bench.engine, follower, 0, SweepParams::default()).unwrap();

        bench.engine.destroy_source(follower);
        assert!(!bench.engine.contains(sweep));
        assert!(bench.engine.contains(bench.sweep));
        assert_eq!(bench.engine.source(bench.input).unwrap().iters.len(), 2);
    }

    #[test]
    fn test_rejects_bad_period() {
        let mut engine = Engine::new();
        let input = engine
            .create_source(idle(), SourceOptions::fixed(1, 16, 10.0), None)
            .unwrap();
        assert!(matches!(
            Sweep::create(
                &mut engine,
                input,
                0,
                SweepParams {
                    period: 0.0,
                    ..Default::default()
                }
            ),
            Err(EngineError::InvalidPeriod(_))
        ));
        assert!(matches!(
            Sweep::create(&mut engine, input, 3, SweepParams::default()),
            Err(EngineError::ChannelOutOfRange { .. })
        ));
        assert!(engine.source(input).unwrap().iters.is_empty());
    }
}
