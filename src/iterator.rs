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
//! Readers. An iterator owns a cursor into one source's ring and never
//! mutates the source; any number of them can read the same source at their
//! own pace. A dual iterator reads two sources of the same group and only
//! ever emits values that belong to the same instant.

use std::cmp::Ordering;

use tracing::{debug, warn};

use crate::engine::{Engine, Iter2Id, IterId, SourceId};
use crate::error::EngineError;
use crate::lap::Position;
use crate::source::{Cursor, Source};

/// One value read from a source.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Reading {
    pub value: f32,
    pub time: f64,
    /// The instant the value belongs to.
    pub position: Position,
}

/// A single channel reader.
pub(crate) struct Iter {
    pub(crate) source: SourceId,
    pub(crate) channel: usize,
    pub(crate) cursor: Cursor,
    /// Set by a catch-up snap of the source.
    pub(crate) reset_pending: bool,
    /// Set whenever the cursor had to be moved forward, losing data.
    pub(crate) was_reset: bool,
}

/// A dual channel reader.
pub(crate) struct Iter2 {
    pub(crate) sources: [SourceId; 2],
    pub(crate) channels: [usize; 2],
    pub(crate) cursors: [Cursor; 2],
    /// The instant of the last emitted pair, while more values at that
    /// instant may still follow on either side.
    pub(crate) paired: Option<Position>,
    pub(crate) last: [f32; 2],
    pub(crate) reset_pending: bool,
    pub(crate) was_reset: bool,
}

#[derive(Clone, Copy, Debug)]
struct Next {
    cursor: Cursor,
    position: Position,
}

#[derive(Clone, Copy, Debug)]
enum Peek {
    Ready(Next),
    /// The slot is there but the group no longer holds its timestamp.
    Stale(Next),
    Empty,
    Lost,
}

/// The slot following `cursor`, if it holds a readable value.
fn peek(cursor: Cursor, source: &Source, master: Position, max: usize) -> Peek {
    let next = match source.lap.diff(cursor.lap) {
        0 => match cursor.slot.cmp(&source.i) {
            Ordering::Less => Cursor {
                lap: cursor.lap,
                slot: cursor.slot + 1,
            },
            Ordering::Equal => return Peek::Empty,
            Ordering::Greater => return Peek::Lost,
        },
        // One lap behind: the rest of the previous lap, then the new one.
        1 if cursor.slot + 1 > source.i => {
            if cursor.slot < source.i_max {
                Cursor {
                    lap: cursor.lap,
                    slot: cursor.slot + 1,
                }
            } else {
                Cursor {
                    lap: source.lap,
                    slot: 0,
                }
            }
        }
        _ => return Peek::Lost,
    };

    let position = Position::new(next.lap, source.time_index[next.slot]);
    let next = Next {
        cursor: next,
        position,
    };
    match master.distance(position, max) {
        behind if behind < 0 => Peek::Lost,
        behind if behind >= max as i64 => Peek::Stale(next),
        _ => Peek::Ready(next),
    }
}

/// The instant of a slot whose timestamp is still held by the group.
fn instant(cursor: Cursor, source: &Source, master: Position, max: usize) -> Option<Position> {
    let position = Position::new(cursor.lap, source.time_index[cursor.slot]);
    let behind = master.distance(position, max);
    (0..max as i64).contains(&behind).then_some(position)
}

/// Whether `cursor` still denotes a written slot of `source`.
fn holds(cursor: Cursor, source: &Source) -> bool {
    if cursor.order(source.floor) != Ordering::Greater {
        return false;
    }
    match source.lap.diff(cursor.lap) {
        0 => cursor.slot <= source.i,
        1 => cursor.slot > source.i && cursor.slot <= source.i_max,
        _ => false,
    }
}

impl Engine {
    /// Creates a reader for one channel of a source. It starts at the
    /// source's last written frame and returns only what is written later.
    pub fn create_iter(&mut self, source: SourceId, channel: usize) -> Result<IterId, EngineError> {
        self.check_channel(source, channel)?;
        let cursor = self.sources[source].cursor();
        let id = self.iters.insert(Iter {
            source,
            channel,
            cursor,
            reset_pending: false,
            was_reset: false,
        });
        self.sources[source].iters.push(id);
        Ok(id)
    }

    /// Destroys a reader.
    pub fn destroy_iter(&mut self, id: IterId) {
        if let Some(iter) = self.iters.remove(id) {
            if let Some(source) = self.sources.get_mut(iter.source) {
                source.iters.retain(|other| *other != id);
            }
        }
    }

    /// The source a reader reads.
    pub fn iter_source(&self, id: IterId) -> Option<SourceId> {
        self.iters.get(id).map(|iter| iter.source)
    }

    /// Returns the next value and its time, or `None` when nothing new is
    /// buffered. Frames lost to a catch-up snap or to the writer lapping the
    /// reader are skipped; see [`Engine::iter_take_reset`].
    pub fn iter_get(&mut self, id: IterId) -> Option<(f32, f64)> {
        self.iter_reading(id)
            .map(|reading| (reading.value, reading.time))
    }

    /// Like [`Engine::iter_get`], with the instant of the value.
    pub fn iter_reading(&mut self, id: IterId) -> Option<Reading> {
        let source_id = self.iters.get(id)?.source;
        self.check_with_master(source_id);

        let Engine {
            sources,
            groups,
            iters,
            ..
        } = self;
        let iter = iters.get_mut(id)?;
        let source = sources.get(source_id)?;
        let group = groups.get(source.group)?;
        let master = sources[group.master].position();

        if iter.reset_pending {
            iter.reset_pending = false;
            iter.was_reset = true;
            // Resume with the first frame written after the snap.
            if source.floor.order(iter.cursor) == Ordering::Greater {
                iter.cursor = source.floor;
            }
        }

        loop {
            match peek(iter.cursor, source, master, group.max_num_frames) {
                Peek::Ready(next) => {
                    iter.cursor = next.cursor;
                    return Some(Reading {
                        value: source.value(next.cursor.slot, iter.channel),
                        time: group.time[next.position.index],
                        position: next.position,
                    });
                }
                Peek::Stale(next) => {
                    iter.was_reset = true;
                    iter.cursor = next.cursor;
                }
                Peek::Empty => return None,
                Peek::Lost => {
                    debug_assert!(
                        source.lap.diff(iter.cursor.lap) >= 0,
                        "iterator ahead of its source"
                    );
                    warn!(iter = ?id, source = ?source_id, "Reader was lapped, skipping ahead");
                    iter.was_reset = true;
                    iter.cursor = source.cursor();
                    return None;
                }
            }
        }
    }

    /// Returns and clears whether the reader lost data since the last call.
    pub fn iter_take_reset(&mut self, id: IterId) -> bool {
        match self.iters.get_mut(id) {
            Some(iter) => std::mem::take(&mut iter.was_reset),
            None => false,
        }
    }

    /// The value the reader returned last, if the source still holds it.
    pub fn iter_current(&self, id: IterId) -> Option<Reading> {
        let iter = self.iters.get(id)?;
        self.reading_at(iter.source, iter.channel, iter.cursor)
    }

    /// Steps the reader back by one value and returns it. Returns `None`,
    /// leaving the reader where it is, once the retained history is used up.
    pub fn iter_get_back(&mut self, id: IterId) -> Option<Reading> {
        let iter = self.iters.get(id)?;
        let source = self.sources.get(iter.source)?;
        let prev = if iter.cursor.slot > 0 {
            Cursor {
                lap: iter.cursor.lap,
                slot: iter.cursor.slot - 1,
            }
        } else {
            Cursor {
                lap: iter.cursor.lap.prev(),
                slot: source.i_max,
            }
        };

        let reading = self.reading_at(iter.source, iter.channel, prev)?;
        self.iters[id].cursor = prev;
        Some(reading)
    }

    /// Moves `dst` to where `src` is. Both must read the same source.
    pub fn iter_copy_position(&mut self, dst: IterId, src: IterId) -> Result<(), EngineError> {
        let from = self.iters.get(src).ok_or(EngineError::NoSuchIterator)?;
        let (source, cursor) = (from.source, from.cursor);
        let to = self.iters.get_mut(dst).ok_or(EngineError::NoSuchIterator)?;
        if to.source != source {
            return Err(EngineError::GroupMismatch);
        }
        to.cursor = cursor;
        Ok(())
    }

    fn reading_at(&self, source_id: SourceId, channel: usize, cursor: Cursor) -> Option<Reading> {
        let source = self.sources.get(source_id)?;
        let group = self.groups.get(source.group)?;
        if !holds(cursor, source) {
            return None;
        }
        let master = self.sources[group.master].position();
        let position = instant(cursor, source, master, group.max_num_frames)?;
        Some(Reading {
            value: source.value(cursor.slot, channel),
            time: group.time[position.index],
            position,
        })
    }

    /// Creates a reader that pairs channel `channel0` of `source0` with
    /// channel `channel1` of `source1`. Both sources must share a group.
    pub fn create_iter2(
        &mut self,
        source0: SourceId,
        channel0: usize,
        source1: SourceId,
        channel1: usize,
    ) -> Result<Iter2Id, EngineError> {
        self.check_channel(source0, channel0)?;
        self.check_channel(source1, channel1)?;
        if self.sources[source0].group != self.sources[source1].group {
            return Err(EngineError::GroupMismatch);
        }

        let id = self.iters2.insert(Iter2 {
            sources: [source0, source1],
            channels: [channel0, channel1],
            cursors: [self.sources[source0].cursor(), self.sources[source1].cursor()],
            paired: None,
            last: [f32::NAN; 2],
            reset_pending: false,
            was_reset: false,
        });
        self.sources[source0].iters2.push(id);
        if source1 != source0 {
            self.sources[source1].iters2.push(id);
        }
        Ok(id)
    }

    /// Destroys a dual reader.
    pub fn destroy_iter2(&mut self, id: Iter2Id) {
        self.detach_iter2(id);
    }

    pub(crate) fn detach_iter2(&mut self, id: Iter2Id) {
        let Some(iter) = self.iters2.remove(id) else {
            return;
        };
        for source in iter.sources {
            if let Some(source) = self.sources.get_mut(source) {
                source.iters2.retain(|other| *other != id);
            }
        }
    }

    /// Returns the next pair of values recorded at the same instant, with
    /// its time. When one source wrote several values at an instant and the
    /// other only one, each extra value is paired with the other side's
    /// value for that instant. Instants only one side wrote are skipped.
    pub fn iter2_get(&mut self, id: Iter2Id) -> Option<(f32, f32, f64)> {
        let [source0, source1] = self.iters2.get(id)?.sources;
        self.check_with_master(source0);
        self.check_with_master(source1);

        let Engine {
            sources,
            groups,
            iters2,
            ..
        } = self;
        let iter = iters2.get_mut(id)?;
        let sides = [sources.get(source0)?, sources.get(source1)?];
        let group = groups.get(sides[0].group)?;
        let master = sources[group.master].position();
        let max = group.max_num_frames;

        if iter.reset_pending {
            iter.reset_pending = false;
            resume2(iter, &sides);
        }

        'scan: loop {
            let mut next = [None; 2];
            for k in 0..2 {
                match peek(iter.cursors[k], sides[k], master, max) {
                    Peek::Ready(ready) => next[k] = Some(ready),
                    Peek::Stale(stale) => {
                        iter.cursors[k] = stale.cursor;
                        iter.paired = None;
                        iter.was_reset = true;
                        continue 'scan;
                    }
                    Peek::Empty => {}
                    Peek::Lost => {
                        warn!(iter2 = ?id, "Pair reader was lapped, skipping ahead");
                        reset2(iter, &sides);
                        return None;
                    }
                }
            }

            // More values at the instant just emitted.
            if let Some(at) = iter.paired {
                let mut advanced = false;
                for k in 0..2 {
                    if let Some(ready) = next[k].filter(|ready| ready.position == at) {
                        iter.cursors[k] = ready.cursor;
                        iter.last[k] = sides[k].value(ready.cursor.slot, iter.channels[k]);
                        advanced = true;
                    }
                }
                if advanced {
                    return Some((iter.last[0], iter.last[1], group.time[at.index]));
                }
            }

            let (Some(a), Some(b)) = (next[0], next[1]) else {
                return None;
            };
            match a.position.cmp(&b.position) {
                Ordering::Equal => {
                    for (k, ready) in [a, b].into_iter().enumerate() {
                        iter.cursors[k] = ready.cursor;
                        iter.last[k] = sides[k].value(ready.cursor.slot, iter.channels[k]);
                    }
                    iter.paired = Some(a.position);
                    return Some((iter.last[0], iter.last[1], group.time[a.position.index]));
                }
                // The side that is behind wrote an instant the other skipped.
                Ordering::Less => {
                    iter.cursors[0] = a.cursor;
                    iter.paired = None;
                }
                Ordering::Greater => {
                    iter.cursors[1] = b.cursor;
                    iter.paired = None;
                }
            }
        }
    }

    /// Returns and clears whether the dual reader lost data since the last
    /// call.
    pub fn iter2_take_reset(&mut self, id: Iter2Id) -> bool {
        match self.iters2.get_mut(id) {
            Some(iter) => std::mem::take(&mut iter.was_reset),
            None => false,
        }
    }
}

/// Moves every side that was snapped past its cursor to the first frame
/// written after the snap.
fn resume2(iter: &mut Iter2, sides: &[&Source; 2]) {
    for (cursor, side) in iter.cursors.iter_mut().zip(sides) {
        if side.floor.order(*cursor) == Ordering::Greater {
            *cursor = side.floor;
        }
    }
    iter.paired = None;
    iter.was_reset = true;
}

fn reset2(iter: &mut Iter2, sides: &[&Source; 2]) {
    debug!("Resetting pair reader");
    iter.cursors = [sides[0].cursor(), sides[1].cursor()];
    iter.paired = None;
    iter.was_reset = true;
}
