//! Adapters that evaluate one physics domain for a given interface state.
//!
//! The controller only sees the [`SolverAdapter`] trait. External solvers are launched through
//! [`ProcessSolver`], while synthetic solvers can be plain closures.

mod process;

pub use process::*;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::exchange::ExchangeError;
use crate::growth::GrowthState;
use crate::interface::{Domain, InterfaceState};

#[derive(Debug, Error)]
pub enum SolverError {
    #[error("{domain} solver exited with status {code:?}")]
    ExecutionFailure { domain: Domain, code: Option<i32> },
    #[error("{domain} solver timed out after {after:?}")]
    Timeout { domain: Domain, after: Duration },
    #[error("{domain} solver output is invalid: {source}")]
    OutputFormat {
        domain: Domain,
        #[source]
        source: ExchangeError,
    },
    #[error("Failed to launch {domain} solver: {source}")]
    LaunchFailure {
        domain: Domain,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to prepare {domain} solver input: {source}")]
    Prepare {
        domain: Domain,
        #[source]
        source: ExchangeError,
    },
    #[error("No solver configured for {domain}")]
    NotConfigured { domain: Domain },
    #[error("{domain} solver was interrupted")]
    Interrupted { domain: Domain },
}

impl SolverError {
    pub fn domain(&self) -> Domain {
        match *self {
            SolverError::ExecutionFailure { domain, .. }
            | SolverError::Timeout { domain, .. }
            | SolverError::OutputFormat { domain, .. }
            | SolverError::LaunchFailure { domain, .. }
            | SolverError::Prepare { domain, .. }
            | SolverError::NotConfigured { domain }
            | SolverError::Interrupted { domain } => domain,
        }
    }

    /// Whether relaunching the solver may help.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            SolverError::Interrupted { .. } | SolverError::NotConfigured { .. }
        )
    }
}

/// Evaluates a single domain.
///
/// Implementations block until the domain has been solved. They must not retry on failure;
/// retries are decided by the controller, which also guarantees that `workdir` is a fresh empty
/// directory for every call.
pub trait SolverAdapter: Send + Sync {
    fn run(
        &self,
        domain: Domain,
        input: &InterfaceState,
        growth: &GrowthState,
        workdir: &Path,
    ) -> Result<InterfaceState, SolverError>;
}

impl<F> SolverAdapter for F
where
    F: Fn(Domain, &InterfaceState, &GrowthState, &Path) -> Result<InterfaceState, SolverError>
        + Send
        + Sync,
{
    fn run(
        &self,
        domain: Domain,
        input: &InterfaceState,
        growth: &GrowthState,
        workdir: &Path,
    ) -> Result<InterfaceState, SolverError> {
        self(domain, input, growth, workdir)
    }
}

/// The set of adapters used for one run, one per domain.
#[derive(Clone, Default)]
pub struct Solvers {
    adapters: BTreeMap<Domain, Arc<dyn SolverAdapter>>,
}

impl Solvers {
    pub fn new() -> Self {
        Solvers::default()
    }

    /// Uses the same adapter for every domain.
    pub fn shared(adapter: impl SolverAdapter + 'static) -> Self {
        let adapter: Arc<dyn SolverAdapter> = Arc::new(adapter);
        Solvers {
            adapters: Domain::ALL
                .iter()
                .map(|&d| (d, Arc::clone(&adapter)))
                .collect(),
        }
    }

    pub fn with(mut self, domain: Domain, adapter: impl SolverAdapter + 'static) -> Self {
        self.adapters.insert(domain, Arc::new(adapter));
        self
    }

    pub fn get(&self, domain: Domain) -> Result<&dyn SolverAdapter, SolverError> {
        self.adapters
            .get(&domain)
            .map(|a| a.as_ref())
            .ok_or(SolverError::NotConfigured { domain })
    }
}

/// Flag shared between the driver and running solvers to request cancellation.
#[derive(Clone, Debug, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn new() -> Self {
        AbortHandle::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::Field;

    #[test]
    fn closures_are_adapters() {
        let solvers = Solvers::new().with(
            Domain::Mesh,
            |_: Domain,
             input: &InterfaceState,
             _: &GrowthState,
             _: &Path|
             -> Result<InterfaceState, SolverError> {
                let mut out = InterfaceState::new(input.num_nodes());
                let d = input.get(Field::Displacement).unwrap().clone();
                out.insert(Field::MeshDisplacement, d).unwrap();
                Ok(out)
            },
        );
        let input = InterfaceState::cold_start(2, &Default::default());
        let out = solvers
            .get(Domain::Mesh)
            .unwrap()
            .run(Domain::Mesh, &input, &GrowthState::new(2), Path::new("."))
            .unwrap();
        assert!(out.contains(Field::MeshDisplacement));
        assert!(matches!(
            solvers.get(Domain::Fluid),
            Err(SolverError::NotConfigured {
                domain: Domain::Fluid
            })
        ));
    }

    #[test]
    fn abort_is_shared() {
        let handle = AbortHandle::new();
        let clone = handle.clone();
        assert!(!clone.is_aborted());
        handle.abort();
        assert!(clone.is_aborted());
    }
}
