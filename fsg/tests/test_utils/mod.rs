use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use fsg::accel::Accelerator;
pub use fsg::test_utils::*;
use fsg::{CouplingConfig, Domain, GrowthState, InterfaceState, InterfaceVector, SolverError};
use tempfile::TempDir;

pub fn init_logger() {
    let _ = env_logger::Builder::from_env("FSG_LOG")
        .is_test(true)
        .try_init();
}

/// A synthetic configuration working in a temporary directory that is removed on drop.
#[allow(dead_code)]
pub fn synthetic_run(num_nodes: usize, tol: f64) -> (TempDir, CouplingConfig) {
    let workdir = tempfile::tempdir().expect("temporary working directory");
    let config = synthetic_config(workdir.path(), num_nodes, tol);
    (workdir, config)
}

/// Number of updates `accel` needs to bring the residual of `map` below `tol` relative to the
/// initial residual, starting from zero. Returns `None` if `max_iter` is exceeded.
#[allow(dead_code)]
pub fn iterations_to_converge(
    accel: &mut dyn Accelerator,
    map: &LinearMap,
    tol: f64,
    max_iter: usize,
) -> Option<usize> {
    accel.begin_step(0);
    let mut x = InterfaceVector::zeros(map.b.len());
    let r0 = (map.apply(&x) - &x).norm();
    for k in 0..max_iter {
        let gx = map.apply(&x);
        if (&gx - &x).norm() <= tol * r0 {
            return Some(k + 1);
        }
        x = accel.update(&x, &gx).ok()?;
    }
    None
}

/// Wraps the halving stub and counts invocations per domain.
#[allow(dead_code)]
#[derive(Clone, Default)]
pub struct CountingSolver {
    pub calls: Arc<[AtomicUsize; 3]>,
}

#[allow(dead_code)]
impl CountingSolver {
    pub fn calls(&self, domain: Domain) -> usize {
        self.calls[domain as usize].load(Ordering::SeqCst)
    }
}

impl fsg::SolverAdapter for CountingSolver {
    fn run(
        &self,
        domain: Domain,
        input: &InterfaceState,
        growth: &GrowthState,
        workdir: &Path,
    ) -> Result<InterfaceState, SolverError> {
        self.calls[domain as usize].fetch_add(1, Ordering::SeqCst);
        halving_solver(domain, input, growth, workdir)
    }
}
