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
//! The engine context. It owns every group, source and iterator, and every
//! operation goes through it; there is no process-wide state.

use std::any::Any;

use slotmap::SlotMap;
use tracing::{debug, error, info, warn};

use crate::error::EngineError;
use crate::group::Group;
use crate::iterator::{Iter, Iter2};
use crate::lap::Position;
use crate::rate::{RateType, SampleRates};
use crate::source::{Generator, ReadStatus, Source, Tick};

slotmap::new_key_type! {
    /// Handle to a group.
    pub struct GroupId;
    /// Handle to a source.
    pub struct SourceId;
    /// Handle to a single channel iterator.
    pub struct IterId;
    /// Handle to a dual channel iterator.
    pub struct Iter2Id;
}

const DEFAULT_BUFFER_FACTOR: usize = 2;
const DEFAULT_BUFFER_EXTRA: usize = 4;
const DEFAULT_UNDERRUN_FRACTION: f64 = 2.0 / 3.0;
const DEFAULT_MAX_UNDERRUNS: u32 = 10;

/// Absorbs rounding when converting elapsed time into a frame count.
const FRAME_EPSILON: f64 = 1e-6;

/// Called after a source writes new frames. Returning false removes the
/// callback.
pub type ChangeCallback = Box<dyn FnMut(&Engine, SourceId) -> bool>;

/// A consumer that draws from a source after it writes new frames.
/// Returning false removes the consumer.
pub type DrawCallback = Box<dyn FnMut(&mut Engine, SourceId) -> bool>;

/// Tunables shared by every group in an engine.
#[derive(Clone, Debug, PartialEq)]
pub struct EngineSettings {
    /// How many slots per master frame a non-master ring holds.
    pub buffer_factor: usize,
    /// Extra slots added to every non-master ring.
    pub buffer_extra: usize,
    /// Fraction of the master ring one read may fill before it counts as an underrun.
    pub underrun_fraction: f64,
    /// Consecutive underruns tolerated before a read fails.
    pub max_underruns: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            buffer_factor: DEFAULT_BUFFER_FACTOR,
            buffer_extra: DEFAULT_BUFFER_EXTRA,
            underrun_fraction: DEFAULT_UNDERRUN_FRACTION,
            max_underruns: DEFAULT_MAX_UNDERRUNS,
        }
    }
}

/// How a new source is laid out and which rates it accepts.
#[derive(Clone, Debug)]
pub struct SourceOptions {
    /// Values per frame.
    pub num_channels: usize,
    /// Ring size for a master. Joiners pass zero or the group's size.
    pub max_num_frames: usize,
    /// The rate constraint this source brings to its group.
    pub rates: SampleRates,
    /// The rate this source would like the group to run at.
    pub sample_rate: f64,
}

impl SourceOptions {
    /// Options for a source with a fixed rate.
    pub fn fixed(num_channels: usize, max_num_frames: usize, rate: f64) -> SourceOptions {
        SourceOptions {
            num_channels,
            max_num_frames,
            rates: SampleRates::Fixed(rate),
            sample_rate: rate,
        }
    }

    /// Options for a source that follows whatever rate its group runs at.
    pub fn follower(num_channels: usize) -> SourceOptions {
        SourceOptions {
            num_channels,
            max_num_frames: 0,
            rates: SampleRates::None,
            sample_rate: 0.0,
        }
    }
}

/// The engine owns all groups, sources and iterators.
#[derive(Default)]
pub struct Engine {
    pub(crate) settings: EngineSettings,
    pub(crate) groups: SlotMap<GroupId, Group>,
    pub(crate) sources: SlotMap<SourceId, Source>,
    pub(crate) iters: SlotMap<IterId, Iter>,
    pub(crate) iters2: SlotMap<Iter2Id, Iter2>,
}

impl Engine {
    /// Creates an empty engine with default settings.
    pub fn new() -> Engine {
        Engine::default()
    }

    /// Creates an empty engine with the given settings.
    pub fn with_settings(settings: EngineSettings) -> Engine {
        Engine {
            settings,
            ..Default::default()
        }
    }

    /// The settings this engine was created with.
    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Creates a source. With no `group_source` the new source becomes the
    /// master of a new group; otherwise it joins that source's group.
    pub fn create_source(
        &mut self,
        generator: impl Generator,
        options: SourceOptions,
        group_source: Option<SourceId>,
    ) -> Result<SourceId, EngineError> {
        if options.num_channels == 0 {
            return Err(EngineError::InvalidChannelCount(options.num_channels));
        }

        let id = match group_source {
            None => self.create_master(Box::new(generator), &options)?,
            Some(peer) => self.create_follower(Box::new(generator), &options, peer)?,
        };

        let group = self.sources[id].group;
        if let Err(e) = self.check_types(group) {
            // The source stays attached; the group is inert until the
            // caller fixes the rate declarations.
            error!(err = %e, "Sample rate negotiation failed");
        }

        info!(
            source = ?id,
            channels = options.num_channels,
            master = group_source.is_none(),
            "Source created"
        );
        Ok(id)
    }

    fn create_master(
        &mut self,
        generator: Box<dyn Generator>,
        options: &SourceOptions,
    ) -> Result<SourceId, EngineError> {
        if options.max_num_frames < 2 {
            return Err(EngineError::InvalidBufferSize(options.max_num_frames));
        }

        let group = Group::new(options.max_num_frames, &self.settings);
        let group_id = self.groups.insert(group);
        let source = Source::master(group_id, generator, options);
        let id = self.sources.insert(source);

        let group = &mut self.groups[group_id];
        group.master = id;
        group.add_source(id);
        Ok(id)
    }

    fn create_follower(
        &mut self,
        generator: Box<dyn Generator>,
        options: &SourceOptions,
        peer: SourceId,
    ) -> Result<SourceId, EngineError> {
        let group_id = self
            .sources
            .get(peer)
            .ok_or(EngineError::NoSuchSource(peer))?
            .group;
        let group = &self.groups[group_id];
        if options.max_num_frames != 0 && options.max_num_frames != group.max_num_frames {
            return Err(EngineError::FrameCountMismatch {
                requested: options.max_num_frames,
                actual: group.max_num_frames,
            });
        }

        let master = &self.sources[group.master];
        let source = Source::follower(
            group_id,
            generator,
            options,
            group.buffer_length,
            master.position(),
        );
        let id = self.sources.insert(source);
        self.groups[group_id].add_source(id);
        Ok(id)
    }

    /// Destroys a source. Destroying a master first destroys every other
    /// source in its group, newest first, and then the group itself. Sources
    /// registered as dependents go with it, as do all iterators reading it.
    pub fn destroy_source(&mut self, id: SourceId) {
        let Some(source) = self.sources.get_mut(id) else {
            return;
        };
        if source.destroying {
            return;
        }
        source.destroying = true;

        let group_id = source.group;
        let is_master = source.is_master;
        let dependents = std::mem::take(&mut source.dependents);

        if is_master {
            let members: Vec<SourceId> = self.groups[group_id]
                .sources
                .iter()
                .rev()
                .copied()
                .filter(|member| *member != id)
                .collect();
            for member in members {
                self.destroy_source(member);
            }
        }

        for dependent in dependents {
            self.destroy_source(dependent);
        }

        let generator = self.sources[id].generator.take();
        if let Some(mut generator) = generator {
            generator.on_destroy(self);
        }

        let Some(source) = self.sources.remove(id) else {
            return;
        };
        for iter in source.iters {
            self.iters.remove(iter);
        }
        for iter2 in source.iters2 {
            self.detach_iter2(iter2);
        }
        for other in self.sources.values_mut() {
            other.dependents.retain(|dependent| *dependent != id);
        }

        if let Some(group) = self.groups.get_mut(group_id) {
            group.remove_source(id);
            if is_master {
                self.destroy_group(group_id);
            } else if let Err(e) = self.check_types(group_id) {
                error!(err = %e, "Sample rate negotiation failed");
            }
        }

        debug!(source = ?id, master = is_master, "Source destroyed");
    }

    fn destroy_group(&mut self, group_id: GroupId) {
        if let Some(group) = self.groups.get(group_id) {
            debug_assert!(group.sources.is_empty(), "destroying a group with members");
            if !group.sources.is_empty() {
                warn!(group = ?group_id, "Destroying a group that still has sources");
            }
        }
        self.groups.remove(group_id);
    }

    /// Ties the lifetime of `dependent` to `source`: destroying `source`
    /// destroys `dependent` too.
    pub fn add_dependent(
        &mut self,
        source: SourceId,
        dependent: SourceId,
    ) -> Result<(), EngineError> {
        self.sources
            .get_mut(source)
            .ok_or(EngineError::NoSuchSource(source))?
            .dependents
            .push(dependent);
        Ok(())
    }

    /// Whether the source is still alive.
    pub fn contains(&self, id: SourceId) -> bool {
        self.sources.contains_key(id)
    }

    /// Looks up a source.
    pub fn source(&self, id: SourceId) -> Option<&Source> {
        self.sources.get(id)
    }

    /// Looks up a group.
    pub fn group(&self, id: GroupId) -> Option<&Group> {
        self.groups.get(id)
    }

    /// The group a source belongs to.
    pub fn group_of(&self, id: SourceId) -> Option<GroupId> {
        self.sources.get(id).map(|source| source.group)
    }

    /// The last instant a source has written.
    pub fn position(&self, id: SourceId) -> Option<Position> {
        self.sources.get(id).map(Source::position)
    }

    /// The last instant the master of a group has written.
    pub fn master_position(&self, group: GroupId) -> Option<Position> {
        let group = self.groups.get(group)?;
        self.sources.get(group.master).map(Source::position)
    }

    /// Typed access to a source's generator. Returns `None` while the
    /// generator is running or when the type does not match.
    pub fn generator_mut<T: Generator>(&mut self, id: SourceId) -> Option<&mut T> {
        let generator = self.sources.get_mut(id)?.generator.as_mut()?;
        let any: &mut dyn Any = generator.as_any_mut();
        any.downcast_mut::<T>()
    }

    /// Registers a callback run after every successful read of the source.
    pub fn add_change_callback(
        &mut self,
        id: SourceId,
        callback: impl FnMut(&Engine, SourceId) -> bool + 'static,
    ) -> Result<(), EngineError> {
        self.sources
            .get_mut(id)
            .ok_or(EngineError::NoSuchSource(id))?
            .change_callbacks
            .push(Box::new(callback));
        Ok(())
    }

    /// Registers a drawing consumer run after every successful read of the
    /// source, after the change callbacks.
    pub fn add_draw_callback(
        &mut self,
        id: SourceId,
        callback: impl FnMut(&mut Engine, SourceId) -> bool + 'static,
    ) -> Result<(), EngineError> {
        self.sources
            .get_mut(id)
            .ok_or(EngineError::NoSuchSource(id))?
            .draw_callbacks
            .push(Box::new(callback));
        Ok(())
    }

    /// Runs one read of a source at the given time. This is what a scheduler
    /// calls on every tick, with non-decreasing times.
    ///
    /// A `ReadStatus::Destroy` result is only a request: the caller destroys
    /// the source once it is done iterating over its own source list.
    pub fn read(&mut self, id: SourceId, time: f64) -> Result<ReadStatus, EngineError> {
        let source = self.sources.get(id).ok_or(EngineError::NoSuchSource(id))?;
        if source.destroying {
            return Ok(ReadStatus::Idle);
        }
        let group = &self.groups[source.group];
        if group.negotiated.rates.rate_type() == RateType::None {
            return Ok(ReadStatus::Idle);
        }

        let is_master = source.is_master;
        let tick = if is_master {
            self.master_tick(id, time)?
        } else {
            self.follower_tick(id, time)
        };

        let Some(mut generator) = self.sources[id].generator.take() else {
            return Ok(ReadStatus::Idle);
        };
        let status = generator.read(self, &tick);
        match self.sources.get_mut(id) {
            Some(source) => source.generator = Some(generator),
            None => return Ok(status),
        }

        if status == ReadStatus::Wrote {
            if let Some(source) = self.sources.get_mut(id) {
                source.prev_time = Some(if source.is_master && tick.delta_t > 0.0 {
                    tick.prev_time + tick.frame_count as f64 * tick.delta_t
                } else {
                    time
                });
            }
            self.notify(id);
        }

        Ok(status)
    }

    fn master_tick(&mut self, id: SourceId, time: f64) -> Result<Tick, EngineError> {
        let settings = &self.settings;
        let source = &mut self.sources[id];
        let group = &mut self.groups[source.group];

        let prev_time = match source.prev_time {
            Some(prev_time) => prev_time,
            None => {
                source.start_time = time;
                source.prev_time = Some(time);
                time
            }
        };

        let rate = group.negotiated.rate;
        let delta_t = if rate > 0.0 { 1.0 / rate } else { 0.0 };
        let mut frame_count = if rate > 0.0 && time > prev_time {
            ((time - prev_time) * rate + FRAME_EPSILON).floor() as usize
        } else {
            0
        };

        let mut tick = Tick {
            source: id,
            time,
            prev_time,
            start_time: source.start_time,
            delta_t,
            frame_count,
            underrun: false,
        };

        let limit = ((group.max_num_frames as f64 * settings.underrun_fraction) as usize).max(1);
        if frame_count > limit {
            group.underrun_count += 1;
            if group.underrun_count > settings.max_underruns {
                error!(
                    count = group.underrun_count,
                    "Reads are not keeping up with the clock"
                );
                return Err(EngineError::Underrun {
                    count: group.underrun_count,
                });
            }

            // Back off harder the longer the underruns go on.
            let shrink = group.underrun_count.min(4) - 1;
            let clamped = (limit >> shrink).max(1);
            warn!(
                due = frame_count,
                clamped,
                consecutive = group.underrun_count,
                "Underrun, dropping frames"
            );
            frame_count = clamped;
            tick.frame_count = frame_count;
            tick.prev_time = time - frame_count as f64 * delta_t;
            tick.underrun = true;
        } else {
            group.underrun_count = 0;
        }

        Ok(tick)
    }

    fn follower_tick(&mut self, id: SourceId, time: f64) -> Tick {
        self.check_with_master(id);

        let source = &self.sources[id];
        let group = &self.groups[source.group];
        let master = &self.sources[group.master];

        let due = master
            .position()
            .distance(source.position(), group.max_num_frames)
            .max(0) as usize;
        let limit =
            ((group.max_num_frames as f64 * self.settings.underrun_fraction) as usize).max(1);
        let rate = group.negotiated.rate;

        Tick {
            source: id,
            time,
            prev_time: source.prev_time.unwrap_or(time),
            start_time: master.start_time,
            delta_t: if rate > 0.0 { 1.0 / rate } else { 0.0 },
            frame_count: due.min(limit),
            underrun: due > limit,
        }
    }

    fn notify(&mut self, id: SourceId) {
        let mut callbacks = std::mem::take(&mut self.sources[id].change_callbacks);
        callbacks.retain_mut(|callback| callback(self, id));
        if let Some(source) = self.sources.get_mut(id) {
            callbacks.append(&mut source.change_callbacks);
            source.change_callbacks = callbacks;
        }

        let Some(source) = self.sources.get_mut(id) else {
            return;
        };
        let mut callbacks = std::mem::take(&mut source.draw_callbacks);
        callbacks.retain_mut(|callback| callback(self, id));
        if let Some(source) = self.sources.get_mut(id) {
            callbacks.append(&mut source.draw_callbacks);
            source.draw_callbacks = callbacks;
        }
    }
}

#[cfg(test)]
mod test {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::testutil::{idle, ramp};

    #[test]
    fn test_create_master_and_follower() {
        let mut engine = Engine::new();
        let master = engine
            .create_source(ramp(), SourceOptions::fixed(1, 16, 100.0), None)
            .unwrap();
        let follower = engine
            .create_source(idle(), SourceOptions::follower(2), Some(master))
            .unwrap();

        let group = engine.group_of(master).unwrap();
        assert_eq!(engine.group_of(follower), Some(group));
        assert!(engine.source(master).unwrap().is_master());
        assert!(!engine.source(follower).unwrap().is_master());
        assert_eq!(engine.group(group).unwrap().sources(), &[master, follower]);
        assert_eq!(engine.group(group).unwrap().sample_rate(), 100.0);
    }

    #[test]
    fn test_create_rejects_bad_layouts() {
        let mut engine = Engine::new();
        assert!(matches!(
            engine.create_source(ramp(), SourceOptions::fixed(1, 1, 100.0), None),
            Err(EngineError::InvalidBufferSize(1))
        ));
        assert!(matches!(
            engine.create_source(ramp(), SourceOptions::fixed(0, 16, 100.0), None),
            Err(EngineError::InvalidChannelCount(0))
        ));

        let master = engine
            .create_source(ramp(), SourceOptions::fixed(1, 16, 100.0), None)
            .unwrap();
        assert!(matches!(
            engine.create_source(idle(), SourceOptions::fixed(1, 32, 100.0), Some(master)),
            Err(EngineError::FrameCountMismatch {
                requested: 32,
                actual: 16
            })
        ));
    }

    #[test]
    fn test_destroy_master_cascades_newest_first() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let mut engine = Engine::new();
        let master = engine
            .create_source(ramp(), SourceOptions::fixed(1, 16, 100.0), None)
            .unwrap();

        let mut followers = Vec::new();
        for n in 0..3 {
            let order = order.clone();
            let generator = crate::testutil::OnDestroy::new(move || order.borrow_mut().push(n));
            followers.push(
                engine
                    .create_source(generator, SourceOptions::follower(1), Some(master))
                    .unwrap(),
            );
        }
        let it = engine.create_iter(followers[0], 0).unwrap();
        let group = engine.group_of(master).unwrap();

        engine.destroy_source(master);

        assert_eq!(*order.borrow(), vec![2, 1, 0]);
        assert!(!engine.contains(master));
        assert!(followers.iter().all(|f| !engine.contains(*f)));
        assert!(engine.group(group).is_none());
        assert_eq!(engine.iter_get(it), None);
        assert!(engine.iters.is_empty());
    }

    #[test]
    fn test_destroy_follower_leaves_group() {
        let mut engine = Engine::new();
        let master = engine
            .create_source(ramp(), SourceOptions::fixed(1, 16, 100.0), None)
            .unwrap();
        let follower = engine
            .create_source(idle(), SourceOptions::follower(1), Some(master))
            .unwrap();
        let group = engine.group_of(master).unwrap();

        engine.destroy_source(follower);
        engine.destroy_source(follower);

        assert!(engine.contains(master));
        assert_eq!(engine.group(group).unwrap().sources(), &[master]);
    }

    #[test]
    fn test_dependents_are_destroyed() {
        let mut engine = Engine::new();
        let master = engine
            .create_source(ramp(), SourceOptions::fixed(1, 16, 100.0), None)
            .unwrap();
        let input = engine
            .create_source(idle(), SourceOptions::follower(1), Some(master))
            .unwrap();
        let derived = engine
            .create_source(idle(), SourceOptions::follower(1), Some(master))
            .unwrap();
        engine.add_dependent(input, derived).unwrap();

        engine.destroy_source(input);
        assert!(!engine.contains(derived));
        assert!(engine.contains(master));
    }

    #[test]
    fn test_read_runs_callbacks() {
        let mut engine = Engine::new();
        let master = engine
            .create_source(ramp(), SourceOptions::fixed(1, 64, 100.0), None)
            .unwrap();

        let changes = Rc::new(RefCell::new(0));
        let draws = Rc::new(RefCell::new(0));
        {
            let changes = changes.clone();
            engine
                .add_change_callback(master, move |_, _| {
                    *changes.borrow_mut() += 1;
                    // Only interested in the first change.
                    false
                })
                .unwrap();
        }
        {
            let draws = draws.clone();
            engine
                .add_draw_callback(master, move |_, _| {
                    *draws.borrow_mut() += 1;
                    true
                })
                .unwrap();
        }

        engine.read(master, 0.0).unwrap();
        assert_eq!(engine.read(master, 0.1).unwrap(), ReadStatus::Wrote);
        assert_eq!(engine.read(master, 0.2).unwrap(), ReadStatus::Wrote);

        assert_eq!(*changes.borrow(), 1);
        assert_eq!(*draws.borrow(), 2);
    }

    #[test]
    fn test_master_frame_count_from_elapsed_time() {
        let counts = Rc::new(RefCell::new(Vec::new()));
        let mut engine = Engine::new();
        let recorded = counts.clone();
        let master = engine
            .create_source(
                move |engine: &mut Engine, tick: &Tick| {
                    recorded.borrow_mut().push(tick.frame_count);
                    crate::testutil::write_ramp(engine, tick)
                },
                SourceOptions::fixed(1, 1000, 100.0),
                None,
            )
            .unwrap();

        engine.read(master, 1.0).unwrap();
        engine.read(master, 1.105).unwrap();
        engine.read(master, 1.2).unwrap();

        // The fractional frame left over after 1.105 carries into the next read.
        assert_eq!(*counts.borrow(), vec![0, 10, 10]);
    }

    #[test]
    fn test_underrun_clamps_then_fails() {
        let settings = EngineSettings {
            max_underruns: 2,
            ..Default::default()
        };
        let mut engine = Engine::with_settings(settings);
        let underruns = Rc::new(RefCell::new(Vec::new()));
        let recorded = underruns.clone();
        let master = engine
            .create_source(
                move |engine: &mut Engine, tick: &Tick| {
                    recorded.borrow_mut().push((tick.frame_count, tick.underrun));
                    crate::testutil::write_ramp(engine, tick)
                },
                SourceOptions::fixed(1, 30, 10.0),
                None,
            )
            .unwrap();

        engine.read(master, 0.0).unwrap();
        // 100 frames due against a 30 frame ring: clamp to 20.
        engine.read(master, 10.0).unwrap();
        // Second consecutive underrun shrinks the request further.
        engine.read(master, 20.0).unwrap();
        assert!(matches!(
            engine.read(master, 30.0),
            Err(EngineError::Underrun { count: 3 })
        ));

        assert_eq!(*underruns.borrow(), vec![(0, false), (20, true), (10, true)]);
    }

    #[test]
    fn test_underrun_count_resets() {
        let mut engine = Engine::new();
        let master = engine
            .create_source(ramp(), SourceOptions::fixed(1, 30, 10.0), None)
            .unwrap();
        let group = engine.group_of(master).unwrap();

        engine.read(master, 0.0).unwrap();
        engine.read(master, 10.0).unwrap();
        assert_eq!(engine.group(group).unwrap().underrun_count(), 1);
        engine.read(master, 10.5).unwrap();
        assert_eq!(engine.group(group).unwrap().underrun_count(), 0);
    }

    #[test]
    fn test_generator_mut_downcasts() {
        let mut engine = Engine::new();
        let master = engine
            .create_source(
                crate::signal::Sine::new(1.0, 1.0),
                SourceOptions::fixed(1, 16, 100.0),
                None,
            )
            .unwrap();
        assert!(engine.generator_mut::<crate::signal::Sine>(master).is_some());
        assert!(engine.generator_mut::<crate::signal::Noise>(master).is_none());
    }
}
