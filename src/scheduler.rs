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

use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::engine::{Engine, SourceId};
use crate::error::EngineError;
use crate::source::ReadStatus;

/// Drives sources by reading them in a fixed order. Sources that read other
/// sources must be added after them.
#[derive(Default)]
pub struct Scheduler {
    sources: Vec<SourceId>,
}

impl Scheduler {
    pub fn new() -> Scheduler {
        Scheduler::default()
    }

    pub fn add(&mut self, id: SourceId) {
        if !self.sources.contains(&id) {
            self.sources.push(id);
        }
    }

    pub fn remove(&mut self, id: SourceId) {
        self.sources.retain(|source| *source != id);
    }

    pub fn sources(&self) -> &[SourceId] {
        &self.sources
    }

    /// Reads every source once at `time`. Sources asking to be destroyed are
    /// destroyed after the pass. The first read error is returned once the
    /// pass is complete.
    pub fn dispatch(&mut self, engine: &mut Engine, time: f64) -> Result<(), EngineError> {
        self.sources.retain(|id| engine.contains(*id));

        let mut doomed = Vec::new();
        let mut first_error = None;
        for id in &self.sources {
            match engine.read(*id, time) {
                Ok(ReadStatus::Destroy) => doomed.push(*id),
                Ok(_) => {}
                Err(e) => {
                    error!(source = ?id, err = %e, "Read failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        for id in doomed {
            debug!(source = ?id, "Destroying source on request");
            engine.destroy_source(id);
        }
        self.sources.retain(|id| engine.contains(*id));

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Dispatches at `start`, `start + step`, ... up to and including `end`
    /// without waiting. `after_tick` runs after every dispatch.
    pub fn run_simulated(
        &mut self,
        engine: &mut Engine,
        start: f64,
        end: f64,
        step: f64,
        mut after_tick: impl FnMut(&mut Engine, f64),
    ) -> Result<(), EngineError> {
        let mut tick = 0u64;
        loop {
            let time = start + tick as f64 * step;
            if time > end + step * 1e-9 {
                return Ok(());
            }
            self.dispatch(engine, time)?;
            after_tick(engine, time);
            tick += 1;
        }
    }

    /// Dispatches every `period` of wall clock time for `duration`, passing
    /// the seconds elapsed since the start as the time.
    pub async fn run_realtime(
        &mut self,
        engine: &mut Engine,
        period: Duration,
        duration: Duration,
        mut after_tick: impl FnMut(&mut Engine, f64),
    ) -> Result<(), EngineError> {
        let mut interval = time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(period = ?period, duration = ?duration, "Starting real time dispatch");

        // The first tick completes immediately.
        let start: Instant = interval.tick().await;
        let mut now = start;
        loop {
            let elapsed = now.saturating_duration_since(start);
            if elapsed > duration {
                return Ok(());
            }
            let time = elapsed.as_secs_f64();
            self.dispatch(engine, time)?;
            after_tick(engine, time);
            now = interval.tick().await;
        }
    }
}
