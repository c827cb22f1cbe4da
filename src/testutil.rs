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
use std::any::Any;

use crate::engine::{Engine, Iter2Id, IterId, SourceId};
use crate::source::{Generator, ReadStatus, Tick};

/// A generator whose value is the time of each frame.
pub fn ramp() -> impl Generator {
    |engine: &mut Engine, tick: &Tick| write_ramp(engine, tick)
}

/// A generator that never writes. Tests drive it with [`push_master`] and
/// [`push_follower`].
pub fn idle() -> impl Generator {
    |_: &mut Engine, _: &Tick| ReadStatus::Idle
}

/// Writes every due frame with the frame's time as its value.
pub fn write_ramp(engine: &mut Engine, tick: &Tick) -> ReadStatus {
    let mut written = 0;
    while written < tick.frame_count {
        let Some(mut run) = engine.set_frames(tick.source, tick.frame_count - written) else {
            break;
        };
        for k in 0..run.len() {
            let t = run.resolve_time(k, tick.prev_time + (written + k + 1) as f64 * tick.delta_t);
            run.frame_mut(k).fill(t as f32);
        }
        written += run.len();
    }
    if written > 0 {
        ReadStatus::Wrote
    } else {
        ReadStatus::Idle
    }
}

/// Writes one master frame per time, with the time as its value.
pub fn push_master(engine: &mut Engine, id: SourceId, times: &[f64]) {
    let mut rest = times;
    while !rest.is_empty() {
        let mut run = engine.set_frames(id, rest.len()).unwrap();
        let n = run.len();
        for (k, t) in rest[..n].iter().enumerate() {
            run.resolve_time(k, *t);
            run.frame_mut(k).fill(*t as f32);
        }
        rest = &rest[n..];
    }
}

/// Writes up to `count` follower frames, with the shared time as their
/// value. Returns how many were written.
pub fn push_follower(engine: &mut Engine, id: SourceId, count: usize) -> usize {
    let mut written = 0;
    while written < count {
        let Some(mut run) = engine.set_frames(id, count - written) else {
            break;
        };
        for k in 0..run.len() {
            let t = run.time(k);
            run.frame_mut(k).fill(t as f32);
        }
        written += run.len();
    }
    written
}

/// Reads everything currently buffered.
pub fn drain(engine: &mut Engine, id: IterId) -> Vec<(f32, f64)> {
    std::iter::from_fn(|| engine.iter_get(id)).collect()
}

/// Reads every pair currently buffered.
pub fn drain2(engine: &mut Engine, id: Iter2Id) -> Vec<(f32, f32, f64)> {
    std::iter::from_fn(|| engine.iter2_get(id)).collect()
}

/// A generator that only reports its own destruction.
pub struct OnDestroy<F> {
    on_destroy: F,
}

impl<F: FnMut() + 'static> OnDestroy<F> {
    pub fn new(on_destroy: F) -> OnDestroy<F> {
        OnDestroy { on_destroy }
    }
}

impl<F: FnMut() + 'static> Generator for OnDestroy<F> {
    fn read(&mut self, _: &mut Engine, _: &Tick) -> ReadStatus {
        ReadStatus::Idle
    }

    fn on_destroy(&mut self, _: &mut Engine) {
        (self.on_destroy)();
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
