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
//! Groups: the timeline shared by every source that must stay in step.

use tracing::{debug, error};

use crate::engine::{Engine, EngineSettings, GroupId, SourceId};
use crate::error::EngineError;
use crate::rate::{self, Negotiated, RateType};

/// State shared by every source on one timeline.
pub struct Group {
    /// Members in creation order. The master is always first.
    pub(crate) sources: Vec<SourceId>,
    /// The source that paces the group and owns the time array.
    pub(crate) master: SourceId,
    /// Timestamp of every instant, indexed by time-index.
    pub(crate) time: Vec<f64>,
    /// Instants per lap, the size of the master's ring.
    pub(crate) max_num_frames: usize,
    /// Slots in every non-master ring.
    pub(crate) buffer_length: usize,
    /// The negotiated constraint and current rate.
    pub(crate) negotiated: Negotiated,
    /// Consecutive master reads that could not deliver everything due.
    pub(crate) underrun_count: u32,
}

impl Group {
    /// Creates an empty group whose master ring holds `max_num_frames` frames.
    pub(crate) fn new(max_num_frames: usize, settings: &EngineSettings) -> Group {
        Group {
            sources: Vec::new(),
            master: SourceId::default(),
            time: vec![0.0; max_num_frames],
            max_num_frames,
            buffer_length: (max_num_frames + 1) * settings.buffer_factor.max(1)
                + settings.buffer_extra.max(1),
            negotiated: Negotiated::none(),
            underrun_count: 0,
        }
    }

    pub(crate) fn add_source(&mut self, id: SourceId) {
        self.sources.push(id);
    }

    pub(crate) fn remove_source(&mut self, id: SourceId) {
        self.sources.retain(|source| *source != id);
    }

    /// Members in creation order.
    pub fn sources(&self) -> &[SourceId] {
        &self.sources
    }

    /// The master source.
    pub fn master(&self) -> SourceId {
        self.master
    }

    /// Instants per lap.
    pub fn max_num_frames(&self) -> usize {
        self.max_num_frames
    }

    /// Slots in every non-master ring.
    pub fn buffer_length(&self) -> usize {
        self.buffer_length
    }

    /// The negotiated rate type.
    pub fn rate_type(&self) -> RateType {
        self.negotiated.rates.rate_type()
    }

    /// The negotiated rate constraint and current rate.
    pub fn negotiated(&self) -> &Negotiated {
        &self.negotiated
    }

    /// The current rate in frames per second.
    pub fn sample_rate(&self) -> f64 {
        self.negotiated.rate
    }

    /// Consecutive underruns so far.
    pub fn underrun_count(&self) -> u32 {
        self.underrun_count
    }

    /// The timestamp stored for a time-index.
    pub fn time(&self, index: usize) -> f64 {
        self.time[index]
    }
}

impl Engine {
    /// Renegotiates a group's rate from scratch by folding in every
    /// member's declaration. On a conflict the group is left with no rate
    /// and no frames flow until the declarations change.
    pub fn check_types(&mut self, group_id: GroupId) -> Result<(), EngineError> {
        let result = {
            let group = self
                .groups
                .get(group_id)
                .ok_or(EngineError::NoSuchGroup)?;
            rate::negotiate(
                group
                    .sources
                    .iter()
                    .filter_map(|id| self.sources.get(*id))
                    .map(|source| (&source.rates, source.sample_rate.max(source.min_sample_rate))),
            )
        };

        let group = &mut self.groups[group_id];
        match result {
            Ok(negotiated) => {
                debug!(
                    group = ?group_id,
                    rate_type = %negotiated.rates.rate_type(),
                    rate = negotiated.rate,
                    "Negotiated group rate"
                );
                group.negotiated = negotiated;
                Ok(())
            }
            Err(conflict) => {
                group.negotiated = Negotiated::none();
                error!(
                    group = ?group_id,
                    group_type = %conflict.group_type,
                    source_type = %conflict.source_type,
                    "Incompatible sample rate types"
                );
                Err(EngineError::IncompatibleRates {
                    source_type: conflict.source_type.name(),
                    group_type: conflict.group_type.name(),
                })
            }
        }
    }

    /// Changes a source's rate declaration and renegotiates its group.
    pub fn set_source_rates(
        &mut self,
        id: SourceId,
        rates: rate::SampleRates,
        sample_rate: f64,
    ) -> Result<(), EngineError> {
        let source = self.sources.get_mut(id).ok_or(EngineError::NoSuchSource(id))?;
        source.rates = rates;
        source.sample_rate = sample_rate;
        let group = source.group;
        self.check_types(group)
    }

    /// Asks the group to run at `rate` or faster without renegotiating.
    /// Returns whether the group rate changed.
    pub fn set_min_sample_rate(&mut self, id: SourceId, rate: f64) -> bool {
        let Some(source) = self.sources.get_mut(id) else {
            return false;
        };
        source.min_sample_rate = rate;
        let group_id = source.group;
        let Some(group) = self.groups.get_mut(group_id) else {
            return false;
        };

        let current = group.negotiated.rate;
        if current >= rate {
            return false;
        }
        match group.negotiated.rates.raise(current, rate) {
            Some(raised) => {
                debug!(group = ?group_id, from = current, to = raised, "Raised group rate");
                group.negotiated.rate = raised;
                true
            }
            None => false,
        }
    }
}
