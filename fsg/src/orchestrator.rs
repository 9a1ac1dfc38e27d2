//! The outer growth and remodeling loop.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::adapter::{AbortHandle, Solvers};
use crate::config::CouplingConfig;
use crate::controller::{CouplingIterationController, StepResult, StepStatus};
use crate::growth::GrowthState;
use crate::interface::{Field, InterfaceState, InterfaceVector};
use crate::monitor::ResidualScale;
use crate::record::ConvergenceRecord;
use crate::timing::Timings;
use crate::Error;

pub const CHECKPOINT_FILE: &str = "checkpoint.json";
pub const RECORD_FILE: &str = "convergence.json";

/// Everything needed to continue a run after the last committed step.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// First step that has not been committed.
    pub next_step: usize,
    pub growth: GrowthState,
    pub num_nodes: usize,
    /// Converged interface of the last committed step.
    pub interface: BTreeMap<Field, Vec<f64>>,
    pub scale: ResidualScale,
    pub record: ConvergenceRecord,
}

impl Checkpoint {
    pub fn load(path: impl AsRef<Path>) -> Result<Checkpoint, Error> {
        let path = path.as_ref();
        let f = File::open(path)?;
        serde_json::from_reader(BufReader::new(f)).map_err(|source| Error::Checkpoint {
            path: path.to_path_buf(),
            source,
        })
    }

    fn interface_state(&self) -> Result<InterfaceState, Error> {
        let mut state = InterfaceState::new(self.num_nodes);
        for (&field, values) in self.interface.iter() {
            state.insert(field, InterfaceVector::from_column_slice(values))?;
        }
        Ok(state)
    }
}

/// Serializes `value` next to `path` and renames it into place.
fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), Error> {
    let tmp = path.with_extension("json.tmp");
    {
        let mut w = BufWriter::new(File::create(&tmp)?);
        serde_json::to_writer_pretty(&mut w, value).map_err(|source| Error::Checkpoint {
            path: tmp.clone(),
            source,
        })?;
        w.flush()?;
        w.get_ref().sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Runs the time steps of a coupled growth simulation.
///
/// The orchestrator owns the growth state and hands it to the controller by reference for
/// every step. It is the only place where the growth state changes.
pub struct TimeStepOrchestrator<'a> {
    config: &'a CouplingConfig,
    solvers: &'a Solvers,
    abort: AbortHandle,
    next_step: usize,
    growth: GrowthState,
    interface: InterfaceState,
    scale: ResidualScale,
    record: ConvergenceRecord,
    timings: Timings,
}

impl<'a> TimeStepOrchestrator<'a> {
    /// Starts a run from the cold-start interface, or from the checkpoint if `restart` is set
    /// in the configuration.
    pub fn new(
        config: &'a CouplingConfig,
        solvers: &'a Solvers,
        abort: AbortHandle,
    ) -> Result<Self, Error> {
        if config.restart {
            return Self::resume(config, solvers, abort);
        }
        Ok(Self::cold_start(config, solvers, abort))
    }

    fn cold_start(config: &'a CouplingConfig, solvers: &'a Solvers, abort: AbortHandle) -> Self {
        let num_nodes = config.interface.num_nodes;
        TimeStepOrchestrator {
            config,
            solvers,
            abort,
            next_step: 0,
            growth: GrowthState::new(num_nodes),
            interface: InterfaceState::cold_start(num_nodes, &config.interface.initial),
            scale: ResidualScale::default(),
            record: ConvergenceRecord::new(config),
            timings: Timings::default(),
        }
    }

    /// Continues from the checkpoint in the working directory.
    ///
    /// Without a checkpoint the run starts from scratch.
    pub fn resume(
        config: &'a CouplingConfig,
        solvers: &'a Solvers,
        abort: AbortHandle,
    ) -> Result<Self, Error> {
        let path = Self::checkpoint_path(config);
        if !path.is_file() {
            log::info!(
                "No checkpoint at {}, starting from the first step",
                path.display()
            );
            return Ok(Self::cold_start(config, solvers, abort));
        }
        let checkpoint = Checkpoint::load(&path)?;
        if checkpoint.num_nodes != config.interface.num_nodes {
            return Err(Error::IncompatibleCheckpoint {
                path,
                reason: format!(
                    "{} interface nodes, configuration has {}",
                    checkpoint.num_nodes, config.interface.num_nodes
                ),
            });
        }
        let growth = &checkpoint.growth;
        let growth_lengths = [
            ("mass fraction", Some(growth.mass_fraction.len())),
            ("stimulus", Some(growth.stimulus.len())),
            ("homeostatic stimulus", growth.homeostatic.as_ref().map(Vec::len)),
        ];
        for (name, len) in growth_lengths.iter() {
            match *len {
                Some(len) if len != checkpoint.num_nodes => {
                    return Err(Error::IncompatibleCheckpoint {
                        path,
                        reason: format!(
                            "growth {} has {} values for {} interface nodes",
                            name, len, checkpoint.num_nodes
                        ),
                    });
                }
                _ => {}
            }
        }
        let interface = checkpoint.interface_state()?.subset(&Field::ALL)?;
        log::info!(
            "Resuming from step {} (t = {})",
            checkpoint.next_step,
            checkpoint.growth.time
        );
        let mut record = checkpoint.record;
        record.configuration = ConvergenceRecord::new(config).configuration;
        Ok(TimeStepOrchestrator {
            config,
            solvers,
            abort,
            next_step: checkpoint.next_step,
            growth: checkpoint.growth,
            interface,
            scale: checkpoint.scale,
            record,
            timings: Timings::default(),
        })
    }

    pub fn checkpoint_path(config: &CouplingConfig) -> PathBuf {
        config.workdir.join(CHECKPOINT_FILE)
    }

    pub fn record_path(config: &CouplingConfig) -> PathBuf {
        config.workdir.join(RECORD_FILE)
    }

    pub fn growth(&self) -> &GrowthState {
        &self.growth
    }

    /// Converged interface of the last committed step, or the cold start.
    pub fn interface(&self) -> &InterfaceState {
        &self.interface
    }

    pub fn record(&self) -> &ConvergenceRecord {
        &self.record
    }

    pub fn next_step(&self) -> usize {
        self.next_step
    }

    /// Accumulated timings of the steps run by this orchestrator, failed attempts included.
    pub fn timings(&self) -> &Timings {
        &self.timings
    }

    pub fn run(&mut self) -> Result<(), Error> {
        self.run_with(|_| {})
    }

    /// Runs all remaining steps, calling `on_step` after every committed step.
    pub fn run_with<F: FnMut(&StepResult)>(&mut self, mut on_step: F) -> Result<(), Error> {
        let config = self.config;
        std::fs::create_dir_all(&config.workdir)?;
        let mut controller =
            CouplingIterationController::new(config, self.solvers, self.abort.clone());

        for step in self.next_step..config.nmax {
            if self.abort.is_aborted() {
                return Err(Error::Interrupted { step, iteration: 0 });
            }
            let result = self.advance(&mut controller, step)?;
            self.commit(&result)?;
            on_step(&result);
        }

        write_atomic(&Self::record_path(config), &self.record)?;
        log::info!(
            "Finished {} time steps",
            self.record.num_steps().unwrap_or(0)
        );
        log::debug!("{}", self.timings);
        Ok(())
    }

    /// Runs one step, retrying with a smaller increment if configured.
    fn advance(
        &mut self,
        controller: &mut CouplingIterationController<'_>,
        step: usize,
    ) -> Result<StepResult, Error> {
        let retry = self.config.step_retry;
        let mut dt = self.config.growth.dt;
        let mut attempt = 0;
        loop {
            self.growth.dt = dt;
            let failure = match controller.run_step(
                step,
                &self.interface,
                &self.growth,
                self.scale.clone(),
            ) {
                Ok(result) if result.is_converged() => {
                    self.timings += result.timings;
                    return Ok(result);
                }
                Ok(result) => {
                    self.timings += result.timings;
                    step_failure(&result)
                }
                Err(err) if err.is_step_failure() => err,
                Err(err) => return Err(err),
            };
            if attempt >= retry.max_retries {
                log::error!("{}", failure);
                return Err(failure);
            }
            attempt += 1;
            dt *= retry.reduction;
            log::warn!(
                "{}; retrying step {} with dt = {} (retry {} of {})",
                failure,
                step,
                dt,
                attempt,
                retry.max_retries
            );
        }
    }

    /// Evolves the growth state with a converged step and checkpoints the run.
    fn commit(&mut self, result: &StepResult) -> Result<(), Error> {
        let dt = self.growth.dt;
        self.growth
            .commit(&result.interface, &self.config.growth, dt)?;
        self.interface.overlay(&result.interface);
        self.scale = result.scale.clone();
        self.record.push_step(result);
        self.next_step = result.step + 1;

        let checkpoint = Checkpoint {
            next_step: self.next_step,
            growth: self.growth.clone(),
            num_nodes: self.interface.num_nodes(),
            interface: self
                .interface
                .iter()
                .map(|(field, values)| (field, values.iter().copied().collect()))
                .collect(),
            scale: self.scale.clone(),
            record: self.record.clone(),
        };
        write_atomic(&Self::checkpoint_path(self.config), &checkpoint)?;
        write_atomic(&Self::record_path(self.config), &self.record)?;
        log::debug!("Checkpoint written after step {}", result.step);
        Ok(())
    }
}

fn step_failure(result: &StepResult) -> Error {
    match result.status {
        StepStatus::Diverged => Error::DivergenceDetected {
            step: result.step,
            iterations: result.iterations,
            residuals: result.residuals[result.residuals.len().saturating_sub(3)..].to_vec(),
        },
        _ => Error::MaxIterationsExceeded {
            step: result.step,
            iterations: result.iterations,
            errors: result.final_errors(),
        },
    }
}
