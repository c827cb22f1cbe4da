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
use std::cell::Cell;
use std::error::Error;
use std::path::PathBuf;
use std::rc::Rc;

use clap::{crate_version, Parser, Subcommand};
use sweepscope::config::{Instrument, Scope};
use sweepscope::engine::{Engine, Iter2Id, SourceId};
use tracing::info;

#[derive(Parser)]
#[clap(
    author = "Michael Wilson",
    version = crate_version!(),
    about = "A triggered sweep oscilloscope engine."
)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Builds a scope file and prints the negotiated rate of every group.
    Check {
        /// The path to the scope file.
        path: String,
    },
    /// Runs a scope file in virtual time and prints the plot as x,y,t lines.
    /// Pen-lifts are printed as empty lines.
    Simulate {
        /// The path to the scope file.
        path: String,
    },
    /// Runs a scope file against the wall clock.
    Run {
        /// The path to the scope file.
        path: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Check { path } => {
            let instrument = Scope::load(&PathBuf::from(&path))?.build()?;
            println!("Groups in {}:", path);
            for (name, id) in &instrument.sources {
                let engine = &instrument.engine;
                let Some(group) = engine.group_of(*id).and_then(|group| engine.group(group)) else {
                    continue;
                };
                if group.master() != *id {
                    continue;
                }
                println!(
                    "- {}: {} at {} Hz, {} frames, {} sources",
                    name,
                    group.rate_type(),
                    group.sample_rate(),
                    group.max_num_frames(),
                    group.sources().len()
                );
            }
        }
        Commands::Simulate { path } => {
            let scope = Scope::load(&PathBuf::from(&path))?;
            let tick = scope.tick()?.as_secs_f64();
            let duration = scope.duration()?.as_secs_f64();
            let Instrument {
                mut engine,
                mut scheduler,
                plot,
                ..
            } = scope.build()?;
            let Some(plot) = plot else {
                return Err(format!("{} has no plot to print", path).into());
            };

            println!("x,y,t");
            scheduler.run_simulated(&mut engine, 0.0, duration, tick, |engine, _| {
                print_pairs(engine, plot);
            })?;
        }
        Commands::Run { path } => {
            let scope = Scope::load(&PathBuf::from(&path))?;
            let tick = scope.tick()?;
            let duration = scope.duration()?;
            let Instrument {
                mut engine,
                mut scheduler,
                sources,
                plot,
            } = scope.build()?;

            let mut counters = Vec::new();
            for (name, id) in &sources {
                counters.push((name.clone(), count_frames(&mut engine, *id)?));
            }

            let mut pairs = 0u64;
            scheduler
                .run_realtime(&mut engine, tick, duration, |engine, _| {
                    if let Some(plot) = plot {
                        while engine.iter2_get(plot).is_some() {
                            pairs += 1;
                        }
                    }
                })
                .await?;

            for (name, frames) in counters {
                info!(source = %name, frames = frames.get(), "Source finished");
            }
            if plot.is_some() {
                info!(pairs, "Plot finished");
            }
        }
    }

    Ok(())
}

/// Prints every buffered pair of the plot.
fn print_pairs(engine: &mut Engine, plot: Iter2Id) {
    while let Some((x, y, t)) = engine.iter2_get(plot) {
        if x.is_nan() || y.is_nan() {
            println!();
        } else {
            println!("{},{},{}", x, y, t);
        }
    }
}

/// Counts the instants a source moves forward by.
fn count_frames(engine: &mut Engine, id: SourceId) -> Result<Rc<Cell<i64>>, Box<dyn Error>> {
    let frames = Rc::new(Cell::new(0));
    let counted = frames.clone();
    let mut last = engine.position(id);
    engine.add_change_callback(id, move |engine, id| {
        let (Some(position), Some(group)) = (
            engine.position(id),
            engine.group_of(id).and_then(|group| engine.group(group)),
        ) else {
            return false;
        };
        if let Some(last) = last {
            counted.set(counted.get() + position.distance(last, group.max_num_frames()).max(0));
        }
        last = Some(position);
        true
    })?;
    Ok(frames)
}
