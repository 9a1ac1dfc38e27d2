//! The inner fixed-point loop of one time step.
//!
//! Every sub-iteration runs the configured stages of solvers on the current interface guess,
//! checks the residual and asks the accelerator for the next guess.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use rayon::prelude::*;

use crate::accel::{new_accelerator, relax, AccelerationError, Accelerator};
use crate::adapter::{AbortHandle, SolverError, Solvers};
use crate::config::CouplingConfig;
use crate::exchange::ExchangeError;
use crate::growth::GrowthState;
use crate::interface::{Domain, Field, InterfaceState};
use crate::monitor::{ConvergenceMonitor, ResidualScale, Verdict};
use crate::timing::Timings;
use crate::Error;

/// States of the controller within one time step.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IterationState {
    Init,
    Exchange,
    Evaluate,
    Accelerate,
    Converged,
    Diverged,
    MaxIterations,
}

/// How a time step ended.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StepStatus {
    Converged,
    Diverged,
    MaxIterations,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StepResult {
    pub step: usize,
    pub status: StepStatus,
    /// Number of sub-iterations, one per solver exchange.
    pub iterations: usize,
    /// Solver outputs of the last sub-iteration.
    pub interface: InterfaceState,
    /// Relative error per domain for every sub-iteration.
    pub errors: BTreeMap<Domain, Vec<f64>>,
    /// Absolute residual norm for every sub-iteration.
    pub residuals: Vec<f64>,
    /// Residual scale to carry into the next step.
    pub scale: ResidualScale,
    /// Number of sub-iterations that fell back to relaxation after a singular solve.
    pub singular_fallbacks: usize,
    pub timings: Timings,
}

impl StepResult {
    pub fn is_converged(&self) -> bool {
        self.status == StepStatus::Converged
    }

    /// Errors of the last sub-iteration.
    pub fn final_errors(&self) -> BTreeMap<Domain, f64> {
        self.errors
            .iter()
            .filter_map(|(&d, e)| e.last().map(|&e| (d, e)))
            .collect()
    }
}

impl std::fmt::Display for StepResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Step {}: {:?}", self.step, self.status)?;
        writeln!(f, "  Sub-iterations:             {}", self.iterations)?;
        writeln!(
            f,
            "  Final residual:             {:.3e}",
            self.residuals.last().copied().unwrap_or(0.0)
        )?;
        for (domain, e) in self.final_errors() {
            writeln!(f, "  {:<28}{:.3e}", format!("{} error:", domain), e)?;
        }
        if self.singular_fallbacks > 0 {
            writeln!(
                f,
                "  Singular fallbacks:         {}",
                self.singular_fallbacks
            )?;
        }
        write!(f, "{}", self.timings)
    }
}

/// Drives the sub-iterations of successive time steps.
///
/// The accelerator lives as long as the controller so that history can be carried across steps
/// when configured.
pub struct CouplingIterationController<'a> {
    config: &'a CouplingConfig,
    solvers: &'a Solvers,
    abort: AbortHandle,
    accelerator: Box<dyn Accelerator>,
    state: IterationState,
}

impl<'a> CouplingIterationController<'a> {
    pub fn new(config: &'a CouplingConfig, solvers: &'a Solvers, abort: AbortHandle) -> Self {
        Self::with_accelerator(config, solvers, abort, new_accelerator(&config.coup))
    }

    /// Uses the given accelerator instead of the one selected by `coup.method`.
    pub fn with_accelerator(
        config: &'a CouplingConfig,
        solvers: &'a Solvers,
        abort: AbortHandle,
        accelerator: Box<dyn Accelerator>,
    ) -> Self {
        CouplingIterationController {
            config,
            solvers,
            abort,
            accelerator,
            state: IterationState::Init,
        }
    }

    pub fn state(&self) -> IterationState {
        self.state
    }

    /// Number of accelerator history columns in use.
    pub fn history_len(&self) -> usize {
        self.accelerator.history_len()
    }

    /// Iterates one time step to convergence, divergence or the iteration limit.
    ///
    /// `initial` seeds the first guess and must contain every interface field. Solver failures
    /// that persist after the configured number of relaunches are returned as errors.
    pub fn run_step(
        &mut self,
        step: usize,
        initial: &InterfaceState,
        growth: &GrowthState,
        scale: ResidualScale,
    ) -> Result<StepResult, Error> {
        let start = Instant::now();
        let config = self.config;
        let coup = &config.coup;
        let num_nodes = initial.num_nodes();

        self.state = IterationState::Init;
        self.accelerator.begin_step(step);
        let mut monitor = ConvergenceMonitor::new(coup, scale);
        let mut timings = Timings::default();
        let mut singular_fallbacks = 0;
        let mut guess = initial.subset(&Field::ALL)?;

        let status = loop {
            let iteration = monitor.iterations();
            if self.abort.is_aborted() {
                return Err(Error::Interrupted { step, iteration });
            }

            self.state = IterationState::Exchange;
            let output = self.exchange(step, iteration, &guess, growth, &mut timings)?;

            self.state = IterationState::Evaluate;
            let verdict = monitor.check(&guess, &output)?;
            log::info!(
                "Step {} sub-iteration {}: residual {:.3e}",
                step,
                iteration,
                monitor.residual_history().last().copied().unwrap_or(0.0)
            );
            match verdict {
                Verdict::Converged => break (StepStatus::Converged, output),
                Verdict::Diverged => break (StepStatus::Diverged, output),
                Verdict::Continue if monitor.iterations() >= coup.nmax as usize => {
                    break (StepStatus::MaxIterations, output)
                }
                Verdict::Continue => {}
            }

            self.state = IterationState::Accelerate;
            let accel_start = Instant::now();
            let x = guess.flatten(&Field::ALL)?;
            let y = output.flatten(&Field::ALL)?;
            let next = match self.accelerator.update(&x, &y) {
                Ok(next) => next,
                Err(AccelerationError::Singular) => {
                    log::warn!(
                        "Step {} sub-iteration {}: singular least-squares system, relaxing instead",
                        step,
                        iteration
                    );
                    singular_fallbacks += 1;
                    relax(&x, &y, coup.omega0)
                }
                Err(err) => return Err(err.into()),
            };
            timings.acceleration += accel_start.elapsed();
            guess = InterfaceState::unflatten(num_nodes, &Field::ALL, &next)?;
        };

        let (status, interface) = status;
        self.state = match status {
            StepStatus::Converged => IterationState::Converged,
            StepStatus::Diverged => IterationState::Diverged,
            StepStatus::MaxIterations => IterationState::MaxIterations,
        };
        timings.total = start.elapsed();

        let result = StepResult {
            step,
            status,
            iterations: monitor.iterations(),
            interface,
            errors: monitor.errors().clone(),
            residuals: monitor.residual_history().to_vec(),
            scale: monitor.scale().clone(),
            singular_fallbacks,
            timings,
        };
        if result.is_converged() {
            log::info!("Step {} converged in {} sub-iterations", step, result.iterations);
        } else {
            log::error!(
                "Step {} ended with {:?} after {} sub-iterations, last errors {:?}",
                step,
                status,
                result.iterations,
                result.final_errors()
            );
        }
        Ok(result)
    }

    /// Runs all stages on `guess` and collects the produced fields.
    ///
    /// Each domain reads the fields produced by earlier stages of this sub-iteration and the
    /// guess for everything else. Domains within a stage run concurrently, and the stage
    /// completes only when all of them have returned.
    fn exchange(
        &self,
        step: usize,
        iteration: usize,
        guess: &InterfaceState,
        growth: &GrowthState,
        timings: &mut Timings,
    ) -> Result<InterfaceState, Error> {
        let mut latest = guess.clone();
        let mut output = InterfaceState::new(guess.num_nodes());
        let root = iteration_dir(&self.config.workdir, step, iteration);
        let retries = self.config.solver.retries;
        let solvers = self.solvers;
        let abort = &self.abort;

        for stage in self.config.coup.order.iter() {
            let inputs = stage
                .iter()
                .map(|&domain| Ok((domain, latest.subset(domain.inputs())?)))
                .collect::<Result<Vec<_>, Error>>()?;

            let results: Vec<(Domain, Duration, Result<InterfaceState, SolverError>)> = inputs
                .par_iter()
                .map(|(domain, input)| {
                    let start = Instant::now();
                    let result = invoke(
                        solvers,
                        abort,
                        &root,
                        retries,
                        *domain,
                        input,
                        growth,
                    );
                    (*domain, start.elapsed(), result)
                })
                .collect();

            for (domain, elapsed, result) in results {
                *timings.domain_mut(domain) += elapsed;
                let produced = result.map_err(|source| match source {
                    SolverError::Interrupted { .. } => Error::Interrupted { step, iteration },
                    source => Error::Solver {
                        step,
                        iteration,
                        source,
                    },
                })?;
                latest.overlay(&produced);
                output.overlay(&produced);
            }
        }
        Ok(output)
    }
}

/// Directory holding all invocations of one sub-iteration.
pub fn iteration_dir(workdir: &Path, step: usize, iteration: usize) -> PathBuf {
    workdir
        .join(format!("step_{}", step))
        .join(format!("iter_{}", iteration))
}

/// Removes any leftovers of an earlier attempt and creates an empty directory.
fn fresh_dir(dir: &Path) -> std::io::Result<()> {
    if dir.exists() {
        std::fs::remove_dir_all(dir)?;
    }
    std::fs::create_dir_all(dir)
}

/// Runs one domain, relaunching it in a fresh directory up to `retries` times.
fn invoke(
    solvers: &Solvers,
    abort: &AbortHandle,
    root: &Path,
    retries: u32,
    domain: Domain,
    input: &InterfaceState,
    growth: &GrowthState,
) -> Result<InterfaceState, SolverError> {
    let adapter = solvers.get(domain)?;
    let mut attempt = 0;
    loop {
        if abort.is_aborted() {
            return Err(SolverError::Interrupted { domain });
        }
        let dir = root.join(format!("{}_{}", domain, attempt));
        fresh_dir(&dir).map_err(|source| SolverError::Prepare {
            domain,
            source: ExchangeError::IO {
                path: dir.clone(),
                source,
            },
        })?;

        let result = adapter
            .run(domain, input, growth, &dir)
            .and_then(|out| check_output(domain, input.num_nodes(), out, &dir));
        match result {
            Ok(out) => return Ok(out),
            Err(err) if err.is_retryable() && attempt < retries => {
                attempt += 1;
                log::warn!("{}, relaunching (attempt {} of {})", err, attempt, retries);
            }
            Err(err) => return Err(err),
        }
    }
}

/// Keeps only the fields `domain` is responsible for, checking that all of them are present.
fn check_output(
    domain: Domain,
    num_nodes: usize,
    output: InterfaceState,
    dir: &Path,
) -> Result<InterfaceState, SolverError> {
    let format_err = |reason: String| SolverError::OutputFormat {
        domain,
        source: ExchangeError::Schema {
            path: dir.to_path_buf(),
            reason,
        },
    };
    if output.num_nodes() != num_nodes {
        return Err(format_err(format!(
            "{} interface nodes, expected {}",
            output.num_nodes(),
            num_nodes
        )));
    }
    output
        .subset(domain.outputs())
        .map_err(|e| format_err(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;

    #[test]
    fn outputs_are_restricted_to_the_domain_contract() {
        let mut out = InterfaceState::cold_start(2, &Default::default());
        let dir = Path::new(".");
        let checked = check_output(Domain::Mesh, 2, out.clone(), dir).unwrap();
        assert_eq!(checked.fields().collect::<Vec<_>>(), vec![Field::MeshDisplacement]);

        assert!(check_output(Domain::Mesh, 3, out.clone(), dir).is_err());
        out = out.subset(&[Field::Traction]).unwrap();
        assert!(matches!(
            check_output(Domain::Fluid, 2, out, dir),
            Err(SolverError::OutputFormat {
                domain: Domain::Fluid,
                ..
            })
        ));
    }

    #[test]
    fn later_stages_see_fresh_outputs() {
        let workdir = tempfile::tempdir().unwrap();
        let config = synthetic_config(workdir.path(), 2, 1e-3);
        // Each domain reports what it has seen as its first input.
        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let recorder = {
            let seen = seen.clone();
            move |domain: Domain,
                  input: &InterfaceState,
                  growth: &GrowthState,
                  dir: &Path|
                  -> Result<InterfaceState, SolverError> {
                let first = input.get(domain.inputs()[0]).map(|v| v[0]);
                seen.lock().unwrap().push((domain, first));
                halving_solver(domain, input, growth, dir)
            }
        };
        let solvers = Solvers::shared(recorder);
        let mut controller =
            CouplingIterationController::new(&config, &solvers, AbortHandle::new());
        let initial = cold_start(&config);
        let growth = GrowthState::new(config.interface.num_nodes);
        controller
            .run_step(0, &initial, &growth, ResidualScale::default())
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], (Domain::Mesh, Some(1.0)));
        assert_eq!(seen[1], (Domain::Fluid, Some(0.5)));
        assert_eq!(seen[2], (Domain::Solid, Some(0.25)));
    }

    #[test]
    fn iteration_directories_are_fresh() {
        let workdir = tempfile::tempdir().unwrap();
        let config = synthetic_config(workdir.path(), 2, 1e-3);
        let stale = iteration_dir(&config.workdir, 0, 0).join("mesh_0");
        std::fs::create_dir_all(&stale).unwrap();
        std::fs::write(stale.join("mesh_displacement.out.json"), "stale").unwrap();

        let solvers = Solvers::shared(
            |domain: Domain,
             input: &InterfaceState,
             growth: &GrowthState,
             dir: &Path|
             -> Result<InterfaceState, SolverError> {
                assert_eq!(std::fs::read_dir(dir).unwrap().count(), 0);
                halving_solver(domain, input, growth, dir)
            },
        );
        let mut controller =
            CouplingIterationController::new(&config, &solvers, AbortHandle::new());
        let result = controller
            .run_step(
                0,
                &cold_start(&config),
                &GrowthState::new(2),
                ResidualScale::default(),
            )
            .unwrap();
        assert!(result.is_converged());
        assert_eq!(controller.state(), IterationState::Converged);
    }
}
