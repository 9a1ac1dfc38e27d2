//! Partitioned fluid-solid-growth coupling.
//!
//! Three external solvers (fluid, solid and mesh motion) are iterated to a converged interface
//! state at every growth step. The interface iteration is accelerated with IQN-ILS.

pub mod accel;
pub mod adapter;
pub mod config;
pub mod controller;
pub mod exchange;
pub mod growth;
pub mod interface;
pub mod monitor;
pub mod orchestrator;
pub mod record;
pub mod timing;

// Kept public so that integration tests and benches can build synthetic runs.
pub mod test_utils;

use std::collections::BTreeMap;
use std::path::PathBuf;

pub use accel::{AccelerationError, Accelerator, IqnIls};
pub use adapter::{AbortHandle, ProcessSolver, SolverAdapter, SolverError, Solvers};
pub use config::{ConfigError, CouplingConfig, CouplingMethod};
pub use controller::{CouplingIterationController, IterationState, StepResult, StepStatus};
pub use growth::GrowthState;
pub use interface::{Domain, Field, InterfaceError, InterfaceState, InterfaceVector};
pub use monitor::{ConvergenceMonitor, ResidualScale};
pub use orchestrator::TimeStepOrchestrator;
pub use record::{ConvergenceRecord, RecordError, Tolerances};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {source}")]
    ConfigurationError {
        #[from]
        source: ConfigError,
    },
    #[error("Step {step}, sub-iteration {iteration}: {source}")]
    Solver {
        step: usize,
        iteration: usize,
        #[source]
        source: SolverError,
    },
    #[error("Divergence detected at step {step} after {iterations} sub-iterations, last residuals {residuals:?}")]
    DivergenceDetected {
        step: usize,
        iterations: usize,
        residuals: Vec<f64>,
    },
    #[error("Step {step} did not converge in {iterations} sub-iterations, last errors {errors:?}")]
    MaxIterationsExceeded {
        step: usize,
        iterations: usize,
        errors: BTreeMap<Domain, f64>,
    },
    #[error("Interrupted at step {step}, sub-iteration {iteration}")]
    Interrupted { step: usize, iteration: usize },
    #[error("Interface error: {source}")]
    InterfaceError {
        #[from]
        source: InterfaceError,
    },
    #[error("Accelerator error: {source}")]
    AccelerationError {
        #[from]
        source: AccelerationError,
    },
    #[error("Convergence record error: {source}")]
    RecordError {
        #[from]
        source: RecordError,
    },
    #[error("Malformed checkpoint {}: {source}", .path.display())]
    Checkpoint {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Checkpoint {} does not match the configuration: {reason}", .path.display())]
    IncompatibleCheckpoint { path: PathBuf, reason: String },
    #[error("File I/O error: {source}")]
    FileIOError {
        #[from]
        source: std::io::Error,
    },
}

impl Error {
    /// Whether the error ends the current time step without compromising the run.
    ///
    /// These failures may be retried with a smaller time increment.
    pub fn is_step_failure(&self) -> bool {
        match self {
            Error::Solver { source, .. } => source.is_retryable(),
            Error::DivergenceDetected { .. } | Error::MaxIterationsExceeded { .. } => true,
            _ => false,
        }
    }
}

/// Runs all time steps of the configured simulation.
pub fn run(
    config: &CouplingConfig,
    solvers: &Solvers,
    abort: AbortHandle,
) -> Result<ConvergenceRecord, Error> {
    let mut orchestrator = TimeStepOrchestrator::new(config, solvers, abort)?;
    orchestrator.run()?;
    Ok(orchestrator.record().clone())
}
