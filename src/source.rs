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
//! Sources: ring buffers of sample frames bound to a group's timeline.
//!
//! The master of a group owns a ring of `max_num_frames` slots whose slot
//! number is also the time-index. Every other source owns a longer ring and
//! records, for each slot, which time-index it belongs to. That lets a
//! follower write two values at one instant (a pen-lift followed by the next
//! value, say) or skip instants entirely, while still wrapping in step with
//! the master: a follower starts a new lap exactly when the time-index does.

use std::any::Any;
use std::cmp::Ordering;

use tracing::warn;

use crate::engine::{
    ChangeCallback, DrawCallback, Engine, GroupId, Iter2Id, IterId, SourceId, SourceOptions,
};
use crate::error::EngineError;
use crate::lap::{LapCount, Position};
use crate::rate::SampleRates;

/// What a generator reports after a read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadStatus {
    /// New frames were written.
    Wrote,
    /// Nothing to do this time. Not an error.
    Idle,
    /// The source asks to be destroyed once the current dispatch pass ends.
    Destroy,
}

/// Everything a generator needs to know about the read it is serving.
#[derive(Clone, Copy, Debug)]
pub struct Tick {
    /// The source being read.
    pub source: SourceId,
    /// The time this read was scheduled for.
    pub time: f64,
    /// The time the previous read covered up to. Master frames are due at
    /// `prev_time + k * delta_t` for `k` in `1..=frame_count`.
    pub prev_time: f64,
    /// The time of the master's first read.
    pub start_time: f64,
    /// Seconds between frames at the group rate, zero without a rate.
    pub delta_t: f64,
    /// How many frames are due.
    pub frame_count: usize,
    /// Set when fewer frames are due than time has elapsed for.
    pub underrun: bool,
}

/// A kind of source. The generator is called on every read and writes its
/// frames through the engine.
pub trait Generator: Any {
    /// Produces the frames due for this tick.
    fn read(&mut self, engine: &mut Engine, tick: &Tick) -> ReadStatus;

    /// Called while the source is being destroyed, after every source that
    /// depends on it is gone.
    fn on_destroy(&mut self, _engine: &mut Engine) {}

    /// Access to the concrete generator.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<F> Generator for F
where
    F: FnMut(&mut Engine, &Tick) -> ReadStatus + 'static,
{
    fn read(&mut self, engine: &mut Engine, tick: &Tick) -> ReadStatus {
        self(engine, tick)
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A slot in a ring together with the lap it was written in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Cursor {
    pub(crate) lap: LapCount,
    pub(crate) slot: usize,
}

impl Cursor {
    /// Orders two slots of the same ring by when they were written.
    pub(crate) fn order(self, other: Cursor) -> Ordering {
        match self.lap.diff(other.lap).cmp(&0) {
            Ordering::Equal => self.slot.cmp(&other.slot),
            ordering => ordering,
        }
    }
}

/// One channel group's ring buffer.
pub struct Source {
    pub(crate) group: GroupId,
    pub(crate) is_master: bool,
    pub(crate) num_channels: usize,
    /// `num_channels` values per slot.
    pub(crate) frames: Vec<f32>,
    /// The time-index each slot belongs to.
    pub(crate) time_index: Vec<usize>,
    /// The last written slot.
    pub(crate) i: usize,
    /// The last valid slot of the previous lap, or `i` when that is larger.
    pub(crate) i_max: usize,
    pub(crate) lap: LapCount,
    /// Slots at or before this one hold nothing worth reading.
    pub(crate) floor: Cursor,
    pub(crate) rates: SampleRates,
    pub(crate) sample_rate: f64,
    pub(crate) min_sample_rate: f64,
    pub(crate) iters: Vec<IterId>,
    pub(crate) iters2: Vec<Iter2Id>,
    /// Sources destroyed along with this one.
    pub(crate) dependents: Vec<SourceId>,
    pub(crate) change_callbacks: Vec<ChangeCallback>,
    pub(crate) draw_callbacks: Vec<DrawCallback>,
    pub(crate) generator: Option<Box<dyn Generator>>,
    pub(crate) prev_time: Option<f64>,
    pub(crate) start_time: f64,
    pub(crate) destroying: bool,
}

impl Source {
    pub(crate) fn master(
        group: GroupId,
        generator: Box<dyn Generator>,
        options: &SourceOptions,
    ) -> Source {
        let slots = options.max_num_frames;
        let lap = LapCount::BEFORE_START;
        Source::new(
            group,
            true,
            generator,
            options,
            (0..slots).collect(),
            Cursor {
                lap,
                slot: slots - 1,
            },
        )
    }

    pub(crate) fn follower(
        group: GroupId,
        generator: Box<dyn Generator>,
        options: &SourceOptions,
        buffer_length: usize,
        master_position: Position,
    ) -> Source {
        let mut time_index = vec![0; buffer_length];
        time_index[master_position.index] = master_position.index;
        Source::new(
            group,
            false,
            generator,
            options,
            time_index,
            Cursor {
                lap: master_position.lap,
                slot: master_position.index,
            },
        )
    }

    fn new(
        group: GroupId,
        is_master: bool,
        generator: Box<dyn Generator>,
        options: &SourceOptions,
        time_index: Vec<usize>,
        start: Cursor,
    ) -> Source {
        Source {
            group,
            is_master,
            num_channels: options.num_channels,
            frames: vec![0.0; time_index.len() * options.num_channels],
            time_index,
            i: start.slot,
            i_max: start.slot,
            lap: start.lap,
            floor: start,
            rates: options.rates.clone(),
            sample_rate: options.sample_rate,
            min_sample_rate: 0.0,
            iters: Vec::new(),
            iters2: Vec::new(),
            dependents: Vec::new(),
            change_callbacks: Vec::new(),
            draw_callbacks: Vec::new(),
            generator: Some(generator),
            prev_time: None,
            start_time: 0.0,
            destroying: false,
        }
    }

    /// The group this source belongs to.
    pub fn group(&self) -> GroupId {
        self.group
    }

    /// Whether this source paces its group.
    pub fn is_master(&self) -> bool {
        self.is_master
    }

    /// Values per frame.
    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    /// Slots in this source's ring.
    pub fn capacity(&self) -> usize {
        self.time_index.len()
    }

    /// The lap this source is writing.
    pub fn lap(&self) -> LapCount {
        self.lap
    }

    /// The last written slot.
    pub fn slot(&self) -> usize {
        self.i
    }

    /// The instant of the last written slot.
    pub fn position(&self) -> Position {
        Position::new(self.lap, self.time_index[self.i])
    }

    /// The rate constraint this source declared.
    pub fn rates(&self) -> &SampleRates {
        &self.rates
    }

    pub(crate) fn cursor(&self) -> Cursor {
        Cursor {
            lap: self.lap,
            slot: self.i,
        }
    }

    pub(crate) fn value(&self, slot: usize, channel: usize) -> f32 {
        self.frames[slot * self.num_channels + channel]
    }
}

/// Where a writable run's timestamps live.
pub enum TimeSlots<'a> {
    /// The master stamps the time of every frame it writes.
    Stamp(&'a mut [f64]),
    /// Other sources reuse the master's stamps.
    Shared(&'a [f64]),
}

/// A contiguous run of writable frames.
pub struct FrameRun<'a> {
    values: &'a mut [f32],
    times: TimeSlots<'a>,
    num_channels: usize,
    start: Position,
}

impl<'a> FrameRun<'a> {
    /// Number of frames in the run.
    pub fn len(&self) -> usize {
        self.values.len() / self.num_channels
    }

    /// Whether the run holds no frames.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The instant of the first frame.
    pub fn start(&self) -> Position {
        self.start
    }

    /// Whether the frames' times must be stamped by the writer.
    pub fn stamps_time(&self) -> bool {
        matches!(self.times, TimeSlots::Stamp(_))
    }

    /// Every value of the run, frame after frame.
    pub fn values_mut(&mut self) -> &mut [f32] {
        self.values
    }

    /// The values of one frame.
    pub fn frame_mut(&mut self, frame: usize) -> &mut [f32] {
        let n = self.num_channels;
        &mut self.values[frame * n..(frame + 1) * n]
    }

    /// Sets every value of the run.
    pub fn fill(&mut self, value: f32) {
        self.values.fill(value);
    }

    /// The time of one frame.
    pub fn time(&self, frame: usize) -> f64 {
        match &self.times {
            TimeSlots::Stamp(times) => times[frame],
            TimeSlots::Shared(times) => times[frame],
        }
    }

    /// Stamps `proposed` as the time of a master frame and returns it. For
    /// other sources the time is already set and is returned unchanged.
    pub fn resolve_time(&mut self, frame: usize, proposed: f64) -> f64 {
        match &mut self.times {
            TimeSlots::Stamp(times) => {
                times[frame] = proposed;
                proposed
            }
            TimeSlots::Shared(times) => times[frame],
        }
    }
}

impl Engine {
    /// Returns up to `count` contiguous writable frames following the last
    /// written one. A master advances freely and stamps the times itself;
    /// any other source stops at the master's position, at the end of a lap
    /// and at the end of its ring, so callers loop until they get `None`.
    pub fn set_frames(&mut self, id: SourceId, count: usize) -> Option<FrameRun<'_>> {
        if count == 0 {
            return None;
        }
        if !self.sources.get(id)?.is_master {
            self.check_with_master(id);
        }

        let Engine {
            sources, groups, ..
        } = self;
        let group = groups.get_mut(sources.get(id)?.group)?;
        let max = group.max_num_frames;
        let master_position = sources[group.master].position();
        let source = sources.get_mut(id)?;
        let num_channels = source.num_channels;

        if source.is_master {
            let start = if source.i + 1 >= max {
                source.lap = source.lap.next();
                0
            } else {
                source.i + 1
            };
            let n = count.min(max - start);
            source.i = start + n - 1;
            source.i_max = max - 1;

            return Some(FrameRun {
                values: &mut source.frames[start * num_channels..(start + n) * num_channels],
                times: TimeSlots::Stamp(&mut group.time[start..start + n]),
                num_channels,
                start: Position::new(source.lap, start),
            });
        }

        let own = source.position();
        let due = master_position.distance(own, max);
        if due <= 0 {
            return None;
        }

        let next = own.succ(max);
        let wraps = next.lap != source.lap;
        let start_slot = if wraps { 0 } else { source.i + 1 };
        let room = source.capacity().saturating_sub(start_slot);
        let wanted = count.min(due as usize).min(max - next.index);
        if room < wanted {
            warn!(
                source = ?id,
                wanted,
                room,
                "Ring buffer full for this lap, truncating write"
            );
        }
        let n = wanted.min(room);
        if n == 0 {
            return None;
        }

        if wraps {
            source.i_max = source.i;
            source.lap = next.lap;
        }
        for k in 0..n {
            source.time_index[start_slot + k] = next.index + k;
        }
        source.i = start_slot + n - 1;
        source.i_max = source.i_max.max(source.i);

        Some(FrameRun {
            values: &mut source.frames[start_slot * num_channels..(start_slot + n) * num_channels],
            times: TimeSlots::Shared(&group.time[next.index..next.index + n]),
            num_channels,
            start: next,
        })
    }

    /// Returns one more frame at the same instant as the last one written.
    /// For a master this is the last frame itself, to be rewritten together
    /// with its time.
    pub fn append_frame(&mut self, id: SourceId) -> Option<FrameRun<'_>> {
        if !self.sources.get(id)?.is_master {
            self.check_with_master(id);
        }

        let Engine {
            sources, groups, ..
        } = self;
        let group = groups.get_mut(sources.get(id)?.group)?;
        let max = group.max_num_frames;
        let master_position = sources[group.master].position();
        let source = sources.get_mut(id)?;
        let num_channels = source.num_channels;
        let own = source.position();

        // Nothing written yet, or the last instant is already gone.
        if master_position.lap == LapCount::BEFORE_START
            || master_position.distance(own, max) >= max as i64
        {
            return None;
        }

        if source.is_master {
            let slot = source.i;
            return Some(FrameRun {
                values: &mut source.frames[slot * num_channels..(slot + 1) * num_channels],
                times: TimeSlots::Stamp(&mut group.time[slot..slot + 1]),
                num_channels,
                start: own,
            });
        }

        let slot = source.i + 1;
        if slot >= source.capacity() {
            warn!(source = ?id, "Ring buffer full for this lap, dropping frame");
            return None;
        }
        source.time_index[slot] = own.index;
        source.i = slot;
        source.i_max = source.i_max.max(slot);

        Some(FrameRun {
            values: &mut source.frames[slot * num_channels..(slot + 1) * num_channels],
            times: TimeSlots::Shared(&group.time[own.index..own.index + 1]),
            num_channels,
            start: own,
        })
    }

    /// Writes a pen-lift: a frame of NaN at the last written instant, telling
    /// consumers not to connect across it.
    pub fn add_pen_lift(&mut self, id: SourceId) -> bool {
        match self.append_frame(id) {
            Some(mut run) => {
                run.fill(f32::NAN);
                true
            }
            None => false,
        }
    }

    /// Writes one frame of a non-master source at a given instant. Instants
    /// between the last written one and `position` are skipped; writing at
    /// the last written instant appends a second value there.
    pub fn write_frame_at(&mut self, id: SourceId, position: Position) -> Option<FrameRun<'_>> {
        if self.sources.get(id)?.is_master {
            return None;
        }
        self.check_with_master(id);

        let own = self.sources[id].position();
        match position.cmp(&own) {
            Ordering::Less => return None,
            Ordering::Equal => return self.append_frame(id),
            Ordering::Greater => {}
        }

        let Engine {
            sources, groups, ..
        } = self;
        let group = groups.get(sources[id].group)?;
        let max = group.max_num_frames;
        let master_position = sources[group.master].position();
        if position > master_position || master_position.distance(position, max) >= max as i64 {
            return None;
        }

        let source = sources.get_mut(id)?;
        let num_channels = source.num_channels;
        let wraps = match position.lap.diff(source.lap) {
            0 => false,
            1 => true,
            _ => return None,
        };
        let slot = if wraps { 0 } else { source.i + 1 };
        if slot >= source.capacity() {
            warn!(source = ?id, "Ring buffer full for this lap, dropping frame");
            return None;
        }

        if wraps {
            source.i_max = source.i;
            source.lap = position.lap;
        }
        source.time_index[slot] = position.index;
        source.i = slot;
        source.i_max = source.i_max.max(slot);

        Some(FrameRun {
            values: &mut source.frames[slot * num_channels..(slot + 1) * num_channels],
            times: TimeSlots::Shared(&group.time[position.index..position.index + 1]),
            num_channels,
            start: position,
        })
    }

    /// Keeps a non-master source within one lap of its master. A source that
    /// has fallen further behind is moved to exactly one lap behind the
    /// master's position, losing whatever it held, and every iterator
    /// reading it is told to start over. Returns whether that happened.
    pub fn check_with_master(&mut self, id: SourceId) -> bool {
        let Engine {
            sources,
            groups,
            iters,
            iters2,
            ..
        } = self;
        let Some(source) = sources.get(id) else {
            return false;
        };
        if source.is_master {
            return false;
        }

        let group = &groups[source.group];
        let max = group.max_num_frames;
        let master_position = sources[group.master].position();
        let behind = master_position.distance(source.position(), max);
        if (0..=max as i64).contains(&behind) {
            return false;
        }
        debug_assert!(behind > 0, "source is ahead of its master");

        let source = &mut sources[id];
        let slot = master_position.index;
        source.lap = master_position.lap.prev();
        source.i = slot;
        source.i_max = slot;
        source.time_index[slot] = master_position.index;
        source.floor = source.cursor();

        for iter in &source.iters {
            if let Some(iter) = iters.get_mut(*iter) {
                iter.reset_pending = true;
            }
        }
        for iter2 in &source.iters2 {
            if let Some(iter2) = iters2.get_mut(*iter2) {
                iter2.reset_pending = true;
            }
        }

        warn!(
            source = ?id,
            lost = behind - max as i64,
            "Source fell behind its master, dropping frames"
        );
        true
    }

    /// Checks that `channel` exists on the source.
    pub(crate) fn check_channel(&self, id: SourceId, channel: usize) -> Result<(), EngineError> {
        let source = self.sources.get(id).ok_or(EngineError::NoSuchSource(id))?;
        if channel >= source.num_channels {
            return Err(EngineError::ChannelOutOfRange {
                channel,
                num_channels: source.num_channels,
            });
        }
        Ok(())
    }
}
