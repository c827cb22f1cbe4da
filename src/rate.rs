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
//! Sample rate declarations and the rules for folding them into one
//! negotiated group rate.

use std::fmt;

/// A sample rate constraint, declared by a source or negotiated for a group.
#[derive(Clone, Debug, PartialEq)]
pub enum SampleRates {
    /// No constraint has been established, or negotiation failed.
    None,
    /// Exactly one rate.
    Fixed(f64),
    /// A finite set of allowed rates, sorted ascending without duplicates.
    Selectable(Vec<f64>),
    /// Any rate in the closed range.
    Variable { min: f64, max: f64 },
    /// Any rate at all. The range only records what has been asked of it
    /// so far and grows to include every new request.
    Tolerant { min: f64, max: f64 },
    /// The source runs its own clock and ignores the group rate.
    Custom,
}

/// The type of a rate constraint, without its values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateType {
    None,
    Fixed,
    Selectable,
    Variable,
    Tolerant,
    Custom,
}

impl RateType {
    /// A short name for reports.
    pub fn name(self) -> &'static str {
        match self {
            RateType::None => "none",
            RateType::Fixed => "fixed",
            RateType::Selectable => "selectable",
            RateType::Variable => "variable",
            RateType::Tolerant => "tolerant",
            RateType::Custom => "custom",
        }
    }
}

impl fmt::Display for RateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A group's negotiated constraint together with the rate chosen inside it.
#[derive(Clone, Debug, PartialEq)]
pub struct Negotiated {
    pub rates: SampleRates,
    pub rate: f64,
}

impl Negotiated {
    /// The inert state of a group with no members or conflicting members.
    pub fn none() -> Negotiated {
        Negotiated {
            rates: SampleRates::None,
            rate: 0.0,
        }
    }
}

/// The two rate types that could not be reconciled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Conflict {
    pub group_type: RateType,
    pub source_type: RateType,
}

fn same_rate(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-9 * a.abs().max(b.abs()).max(1.0)
}

impl SampleRates {
    /// A selectable set from any list of rates.
    pub fn selectable(rates: impl IntoIterator<Item = f64>) -> SampleRates {
        let mut rates: Vec<f64> = rates.into_iter().filter(|r| *r > 0.0).collect();
        rates.sort_by(|a, b| a.total_cmp(b));
        rates.dedup_by(|a, b| same_rate(*a, *b));
        SampleRates::Selectable(rates)
    }

    /// A variable range; the bounds may be given in either order.
    pub fn variable(a: f64, b: f64) -> SampleRates {
        SampleRates::Variable {
            min: a.min(b),
            max: a.max(b),
        }
    }

    /// A tolerant constraint seeded with one rate.
    pub fn tolerant(rate: f64) -> SampleRates {
        SampleRates::Tolerant {
            min: rate,
            max: rate,
        }
    }

    /// The type of this constraint.
    pub fn rate_type(&self) -> RateType {
        match self {
            SampleRates::None => RateType::None,
            SampleRates::Fixed(_) => RateType::Fixed,
            SampleRates::Selectable(_) => RateType::Selectable,
            SampleRates::Variable { .. } => RateType::Variable,
            SampleRates::Tolerant { .. } => RateType::Tolerant,
            SampleRates::Custom => RateType::Custom,
        }
    }

    /// Whether the given rate satisfies this constraint.
    pub fn allows(&self, rate: f64) -> bool {
        match self {
            SampleRates::None | SampleRates::Custom => false,
            SampleRates::Fixed(r) => same_rate(*r, rate),
            SampleRates::Selectable(rates) => rates.iter().any(|r| same_rate(*r, rate)),
            SampleRates::Variable { min, max } => rate >= *min && rate <= *max,
            SampleRates::Tolerant { .. } => true,
        }
    }

    /// Combines this constraint with another one. Returns `None` when the
    /// two cannot be satisfied together.
    pub fn combine(&self, other: &SampleRates) -> Option<SampleRates> {
        use SampleRates::*;

        match (self, other) {
            (None, other) => Some(other.clone()),
            (this, None) => Some(this.clone()),
            (Custom, Custom) => Some(Custom),
            (Custom, _) | (_, Custom) => Option::None,
            (Tolerant { min: a, max: b }, Tolerant { min: c, max: d }) => Some(Tolerant {
                min: a.min(*c),
                max: b.max(*d),
            }),
            (Tolerant { .. }, other) => Some(other.clone()),
            (this, Tolerant { .. }) => Some(this.clone()),
            (Fixed(a), Fixed(b)) => same_rate(*a, *b).then(|| Fixed(*a)),
            (Fixed(r), constraint @ (Selectable(_) | Variable { .. }))
            | (constraint @ (Selectable(_) | Variable { .. }), Fixed(r)) => {
                constraint.allows(*r).then(|| Fixed(*r))
            }
            (Selectable(a), Selectable(b)) => {
                let common: Vec<f64> = a
                    .iter()
                    .copied()
                    .filter(|r| b.iter().any(|s| same_rate(*r, *s)))
                    .collect();
                (!common.is_empty()).then(|| Selectable(common))
            }
            (Selectable(rates), Variable { min, max })
            | (Variable { min, max }, Selectable(rates)) => {
                let inside: Vec<f64> = rates
                    .iter()
                    .copied()
                    .filter(|r| r >= min && r <= max)
                    .collect();
                (!inside.is_empty()).then(|| Selectable(inside))
            }
            (Variable { min: a, max: b }, Variable { min: c, max: d }) => {
                let min = a.max(*c);
                let max = b.min(*d);
                (min <= max).then_some(Variable { min, max })
            }
        }
    }

    /// Picks the rate this constraint would run at when `wanted` is asked
    /// for. Tolerant constraints grow to include the request.
    pub fn clamp(&mut self, wanted: f64) -> f64 {
        match self {
            SampleRates::None | SampleRates::Custom => 0.0,
            SampleRates::Fixed(r) => *r,
            SampleRates::Selectable(rates) => rates
                .iter()
                .copied()
                .min_by(|a, b| {
                    // Nearest rate wins; ties go to the larger rate.
                    (a - wanted)
                        .abs()
                        .total_cmp(&(b - wanted).abs())
                        .then(b.total_cmp(a))
                })
                .unwrap_or(0.0),
            SampleRates::Variable { min, max } => wanted.clamp(*min, *max),
            SampleRates::Tolerant { min, max } => {
                let rate = if wanted > 0.0 { wanted } else { *max };
                *min = min.min(rate);
                *max = max.max(rate);
                rate
            }
        }
    }

    /// The smallest rate at or above `wanted` this constraint can move to,
    /// if that is above `current`.
    pub fn raise(&mut self, current: f64, wanted: f64) -> Option<f64> {
        let candidate = match self {
            SampleRates::None | SampleRates::Custom | SampleRates::Fixed(_) => return None,
            SampleRates::Selectable(rates) => rates
                .iter()
                .copied()
                .find(|r| *r >= wanted)
                .or_else(|| rates.last().copied())?,
            SampleRates::Variable { max, .. } => wanted.min(*max),
            SampleRates::Tolerant { max, .. } => {
                *max = max.max(wanted);
                wanted
            }
        };
        (candidate > current && !same_rate(candidate, current)).then_some(candidate)
    }
}

/// Folds every member's constraint into a negotiated group constraint.
/// Each member is given as its constraint and the rate it would like to run
/// at. The chosen rate is the largest wish, clamped into the result.
pub fn negotiate<'a>(
    members: impl IntoIterator<Item = (&'a SampleRates, f64)>,
) -> Result<Negotiated, Conflict> {
    let mut rates = SampleRates::None;
    let mut wanted: f64 = 0.0;

    for (constraint, wish) in members {
        rates = match rates.combine(constraint) {
            Some(combined) => combined,
            None => {
                return Err(Conflict {
                    group_type: rates.rate_type(),
                    source_type: constraint.rate_type(),
                })
            }
        };
        wanted = wanted.max(wish);
    }

    let rate = rates.clamp(wanted);
    Ok(Negotiated { rates, rate })
}
