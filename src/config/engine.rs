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
use serde::Deserialize;

use crate::engine::EngineSettings;

/// A YAML representation of the engine tuning knobs. Anything left out
/// falls back to [`EngineSettings::default`].
#[derive(Deserialize, Clone, Debug, Default)]
pub struct Engine {
    /// Slots per master frame in a non-master ring.
    buffer_factor: Option<usize>,

    /// Extra slots added to every non-master ring.
    buffer_extra: Option<usize>,

    /// Fraction of the master ring one read may fill before it counts as an
    /// underrun.
    underrun_fraction: Option<f64>,

    /// Consecutive underruns tolerated before a read fails.
    max_underruns: Option<u32>,
}

impl Engine {
    /// Returns the engine settings with defaults filled in.
    pub fn settings(&self) -> EngineSettings {
        let defaults = EngineSettings::default();
        EngineSettings {
            buffer_factor: self.buffer_factor.unwrap_or(defaults.buffer_factor),
            buffer_extra: self.buffer_extra.unwrap_or(defaults.buffer_extra),
            underrun_fraction: self.underrun_fraction.unwrap_or(defaults.underrun_fraction),
            max_underruns: self.max_underruns.unwrap_or(defaults.max_underruns),
        }
    }
}

#[cfg(test)]
mod test {
    use config::{Config, File, FileFormat};

    use super::*;

    #[test]
    fn test_partial_engine_settings() {
        let yaml = r#"
            buffer_factor: 4
            max_underruns: 3
        "#;

        let engine: Engine = Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        let settings = engine.settings();
        let defaults = EngineSettings::default();
        assert_eq!(settings.buffer_factor, 4);
        assert_eq!(settings.max_underruns, 3);
        assert_eq!(settings.buffer_extra, defaults.buffer_extra);
        assert_eq!(settings.underrun_fraction, defaults.underrun_fraction);
    }
}
