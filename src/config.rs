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
//! Scope files: YAML descriptions of sources, sweeps and a plot, and the
//! code that turns them into a running engine.

use std::path::Path;
use std::time::Duration;

use config::{Config, File, FileFormat};
use duration_string::DurationString;
use serde::Deserialize;
use tracing::{debug, info};

use crate::engine::{Engine, Iter2Id, SourceId};
use crate::scheduler::Scheduler;

mod engine;
mod error;
mod source;
mod sweep;

pub use self::engine::Engine as EngineConfig;
pub use self::error::ConfigError;
pub use self::source::{Rate, Signal, Source};
pub use self::sweep::Sweep;

const DEFAULT_TICK: Duration = Duration::from_millis(10);
const DEFAULT_DURATION: Duration = Duration::from_secs(1);

/// Parses a duration string such as `10ms` or `1s`.
pub(crate) fn parse_duration(value: &str) -> Result<Duration, ConfigError> {
    match DurationString::from_string(value.to_string()) {
        Ok(duration) => Ok(duration.into()),
        Err(e) => Err(ConfigError::Duration {
            value: value.to_string(),
            message: e.to_string(),
        }),
    }
}

/// Two channels drawn against each other.
#[derive(Deserialize, Clone, Debug)]
pub struct Plot {
    /// Horizontal source name.
    x: String,
    #[serde(default)]
    x_channel: usize,
    /// Vertical source name.
    y: String,
    #[serde(default)]
    y_channel: usize,
}

/// A YAML representation of a whole scope.
#[derive(Deserialize, Clone, Debug)]
pub struct Scope {
    #[serde(default)]
    engine: EngineConfig,

    /// Dispatch period (default: 10ms).
    tick: Option<String>,

    /// How long to run (default: 1s).
    duration: Option<String>,

    /// Sources in creation order. A source may only join the group of a
    /// source listed before it.
    #[serde(default)]
    sources: Vec<Source>,

    #[serde(default)]
    sweeps: Vec<Sweep>,

    plot: Option<Plot>,
}

/// An engine built from a scope file, ready to dispatch.
pub struct Instrument {
    pub engine: Engine,
    pub scheduler: Scheduler,
    /// Every source and sweep by name, in creation order.
    pub sources: Vec<(String, SourceId)>,
    pub plot: Option<Iter2Id>,
}

impl Instrument {
    /// Looks up a source or sweep by name.
    pub fn source(&self, name: &str) -> Option<SourceId> {
        lookup(&self.sources, name).ok()
    }
}

fn lookup(sources: &[(String, SourceId)], name: &str) -> Result<SourceId, ConfigError> {
    sources
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, id)| *id)
        .ok_or_else(|| ConfigError::UnknownSource(name.to_string()))
}

fn register(sources: &mut Vec<(String, SourceId)>, name: &str, id: SourceId) {
    sources.push((name.to_string(), id));
}

impl Scope {
    /// Reads a scope file. The format follows the file extension.
    pub fn load(path: &Path) -> Result<Scope, ConfigError> {
        Ok(Config::builder()
            .add_source(File::from(path))
            .build()?
            .try_deserialize::<Scope>()?)
    }

    /// Reads a scope from YAML text.
    pub fn from_yaml(yaml: &str) -> Result<Scope, ConfigError> {
        Ok(Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()?
            .try_deserialize::<Scope>()?)
    }

    pub fn tick(&self) -> Result<Duration, ConfigError> {
        match &self.tick {
            Some(tick) => parse_duration(tick),
            None => Ok(DEFAULT_TICK),
        }
    }

    pub fn duration(&self) -> Result<Duration, ConfigError> {
        match &self.duration {
            Some(duration) => parse_duration(duration),
            None => Ok(DEFAULT_DURATION),
        }
    }

    pub fn sources(&self) -> &[Source] {
        &self.sources
    }

    pub fn sweeps(&self) -> &[Sweep] {
        &self.sweeps
    }

    /// Creates every source, sweep and the plot reader. Sources are
    /// scheduled in file order with sweeps after them.
    pub fn build(&self) -> Result<Instrument, ConfigError> {
        if self.sources.is_empty() {
            return Err(ConfigError::NoSources);
        }

        let mut engine = Engine::with_settings(self.engine.settings());
        let mut scheduler = Scheduler::new();
        let mut sources: Vec<(String, SourceId)> = Vec::new();

        for source in &self.sources {
            if lookup(&sources, source.name()).is_ok() {
                return Err(ConfigError::DuplicateSource(source.name().to_string()));
            }
            let group_source = match source.group() {
                Some(peer) => Some(lookup(&sources, peer)?),
                None => None,
            };
            let id = source
                .create(&mut engine, group_source)
                .map_err(|e| ConfigError::Engine {
                    name: source.name().to_string(),
                    source: e,
                })?;
            debug!(name = source.name(), source = ?id, "Configured source");
            scheduler.add(id);
            register(&mut sources, source.name(), id);
        }

        for sweep in &self.sweeps {
            if lookup(&sources, sweep.name()).is_ok() {
                return Err(ConfigError::DuplicateSource(sweep.name().to_string()));
            }
            let input = lookup(&sources, sweep.input())?;
            let params = sweep.params()?;
            let id = crate::sweep::Sweep::create(&mut engine, input, sweep.channel(), params)
                .map_err(|e| ConfigError::Engine {
                    name: sweep.name().to_string(),
                    source: e,
                })?;
            debug!(name = sweep.name(), source = ?id, "Configured sweep");
            scheduler.add(id);
            register(&mut sources, sweep.name(), id);
        }

        let plot = match &self.plot {
            Some(plot) => {
                let x = lookup(&sources, &plot.x)?;
                let y = lookup(&sources, &plot.y)?;
                let id = engine
                    .create_iter2(x, plot.x_channel, y, plot.y_channel)
                    .map_err(|e| ConfigError::Engine {
                        name: format!("{}/{}", plot.x, plot.y),
                        source: e,
                    })?;
                Some(id)
            }
            None => None,
        };

        info!(sources = sources.len(), plot = plot.is_some(), "Scope built");
        Ok(Instrument {
            engine,
            scheduler,
            sources,
            plot,
        })
    }
}

#[cfg(test)]
mod test {
    use std::fs;

    use tempfile::tempdir;

    use super::*;
    use crate::error::EngineError;
    use crate::rate::RateType;

    const SCOPE: &str = r#"
        engine:
          buffer_factor: 3
        tick: 20ms
        duration: 2s
        sources:
          - name: probe
            frames: 256
            rate:
              fixed: 100
            signal:
              sine:
                frequency: 2
          - name: hiss
            group: probe
            signal:
              noise:
                amplitude: 0.1
                seed: 1
        sweeps:
          - name: timebase
            input: probe
            period: 250ms
            level: 0.0
        plot:
          x: timebase
          y: probe
    "#;

    #[test]
    fn test_scope_deserialize() {
        let scope = Scope::from_yaml(SCOPE).unwrap();
        assert_eq!(scope.tick().unwrap(), Duration::from_millis(20));
        assert_eq!(scope.duration().unwrap(), Duration::from_secs(2));
        assert_eq!(scope.sources().len(), 2);
        assert_eq!(scope.sweeps().len(), 1);
        assert_eq!(scope.engine.settings().buffer_factor, 3);
    }

    #[test]
    fn test_scope_defaults() {
        let scope = Scope::from_yaml(
            r#"
            sources:
              - name: probe
                signal:
                  sine:
                    frequency: 1
        "#,
        )
        .unwrap();
        assert_eq!(scope.tick().unwrap(), DEFAULT_TICK);
        assert_eq!(scope.duration().unwrap(), DEFAULT_DURATION);
        assert!(scope.sweeps().is_empty());
    }

    #[test]
    fn test_build_and_plot() {
        let mut instrument = Scope::from_yaml(SCOPE).unwrap().build().unwrap();
        let probe = instrument.source("probe").unwrap();
        let hiss = instrument.source("hiss").unwrap();
        let timebase = instrument.source("timebase").unwrap();
        assert_eq!(instrument.scheduler.sources(), &[probe, hiss, timebase]);

        let group_id = instrument.engine.group_of(probe).unwrap();
        assert_eq!(instrument.engine.group_of(timebase), Some(group_id));
        let group = instrument.engine.group(group_id).unwrap();
        assert_eq!(group.rate_type(), RateType::Fixed);
        assert_eq!(group.sample_rate(), 100.0);

        let plot = instrument.plot.unwrap();
        let mut pairs = Vec::new();
        let Instrument {
            engine, scheduler, ..
        } = &mut instrument;
        scheduler
            .run_simulated(engine, 0.0, 1.0, 0.02, |engine, _| {
                while let Some(pair) = engine.iter2_get(plot) {
                    pairs.push(pair);
                }
            })
            .unwrap();

        assert!(!pairs.is_empty());
        let drawn: Vec<_> = pairs.iter().filter(|(x, _, _)| !x.is_nan()).collect();
        assert!(!drawn.is_empty());
        assert!(drawn.iter().all(|(x, _, _)| (-0.5..0.5).contains(x)));
        assert!(drawn.windows(2).all(|pair| pair[1].2 >= pair[0].2));
    }

    #[test]
    fn test_unknown_names() {
        let scope = Scope::from_yaml(
            r#"
            sources:
              - name: probe
                signal:
                  sine:
                    frequency: 1
            sweeps:
              - name: timebase
                input: nowhere
        "#,
        )
        .unwrap();
        assert!(matches!(
            scope.build(),
            Err(ConfigError::UnknownSource(name)) if name == "nowhere"
        ));

        let scope = Scope::from_yaml(
            r#"
            sources:
              - name: probe
                group: later
                signal:
                  sine:
                    frequency: 1
        "#,
        )
        .unwrap();
        assert!(matches!(
            scope.build(),
            Err(ConfigError::UnknownSource(name)) if name == "later"
        ));
    }

    #[test]
    fn test_duplicate_names() {
        let scope = Scope::from_yaml(
            r#"
            sources:
              - name: probe
                signal:
                  sine:
                    frequency: 1
              - name: probe
                signal:
                  sine:
                    frequency: 2
        "#,
        )
        .unwrap();
        assert!(matches!(scope.build(), Err(ConfigError::DuplicateSource(_))));
    }

    #[test]
    fn test_engine_errors_name_the_source() {
        let scope = Scope::from_yaml(
            r#"
            sources:
              - name: probe
                channels: 0
                signal:
                  sine:
                    frequency: 1
        "#,
        )
        .unwrap();
        match scope.build() {
            Err(ConfigError::Engine { name, source }) => {
                assert_eq!(name, "probe");
                assert!(matches!(source, EngineError::InvalidChannelCount(0)));
            }
            _ => panic!("expected an engine error"),
        }
    }

    #[test]
    fn test_no_sources() {
        let scope = Scope::from_yaml("sources: []").unwrap();
        assert!(matches!(scope.build(), Err(ConfigError::NoSources)));
    }

    #[test]
    fn test_deserialize_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("scope.yaml");
        fs::write(&path, SCOPE).unwrap();

        let scope = Scope::load(&path).unwrap();
        assert_eq!(scope.sources()[0].name(), "probe");

        let missing = dir.path().join("missing.yaml");
        assert!(matches!(Scope::load(&missing), Err(ConfigError::Load(_))));
    }
}
