//! Synthetic configurations and solvers for tests and benchmarks.

use std::path::Path;

use crate::adapter::SolverError;
use crate::config::*;
use crate::exchange::ExchangeError;
use crate::growth::GrowthState;
use crate::interface::*;

/// A two step IQN-ILS configuration with a unit cold-start displacement working in `workdir`.
pub fn synthetic_config(workdir: &Path, num_nodes: usize, tol: f64) -> CouplingConfig {
    let mut initial = std::collections::BTreeMap::new();
    initial.insert(Field::Displacement, 1.0);
    CouplingConfig {
        nmax: 2,
        n_procs: ProcessCounts {
            fluid: 1,
            solid: 1,
            mesh: 1,
        },
        coup: CouplingParams {
            method: CouplingMethod::IqnIls,
            tol,
            nmax: 20,
            omega0: 0.5,
            iqn_ils_eps: 1e-2,
            iqn_ils_q: 0,
            divergence_window: 5,
            blowup_factor: 1e3,
            order: vec![vec![Domain::Mesh], vec![Domain::Fluid], vec![Domain::Solid]],
        },
        interface: InterfaceParams { num_nodes, initial },
        solver: SolverParams {
            launcher: Vec::new(),
            ..Default::default()
        },
        growth: GrowthParams::default(),
        step_retry: StepRetryParams::default(),
        workdir: workdir.to_path_buf(),
        restart: false,
    }
}

pub fn cold_start(config: &CouplingConfig) -> InterfaceState {
    InterfaceState::cold_start(config.interface.num_nodes, &config.interface.initial)
}

/// Output field `field` computed as `factor` times the first input of `domain`.
///
/// Components are taken modulo the component count of the input, so a scalar output picks the
/// first component of a vector input.
pub fn scaled_output(
    domain: Domain,
    input: &InterfaceState,
    field: Field,
    factor: f64,
) -> Result<InterfaceVector, InterfaceError> {
    let source = domain.inputs()[0];
    let values = input
        .get(source)
        .ok_or(InterfaceError::MissingField(source))?;
    let n = input.num_nodes();
    let (ci, co) = (source.components(), field.components());
    Ok(InterfaceVector::from_fn(n * co, |i, _| {
        let (node, c) = (i / co, i % co);
        factor * values[node * ci + c % ci]
    }))
}

/// A solver stub that returns half of its first input for every output field.
pub fn halving_solver(
    domain: Domain,
    input: &InterfaceState,
    _growth: &GrowthState,
    dir: &Path,
) -> Result<InterfaceState, SolverError> {
    let invalid = |e: InterfaceError| SolverError::OutputFormat {
        domain,
        source: ExchangeError::Schema {
            path: dir.to_path_buf(),
            reason: e.to_string(),
        },
    };
    let mut output = InterfaceState::new(input.num_nodes());
    for &field in domain.outputs() {
        let values = scaled_output(domain, input, field, 0.5).map_err(&invalid)?;
        output.insert(field, values).map_err(&invalid)?;
    }
    Ok(output)
}

/// Affine map `x -> A x + b` with a contraction factor of `rate` used to exercise accelerators.
pub struct LinearMap {
    pub a: na::DMatrix<f64>,
    pub b: InterfaceVector,
}

impl LinearMap {
    /// A symmetric map with eigenvalues spread over `[-rate, rate]`.
    pub fn contraction(dim: usize, rate: f64) -> LinearMap {
        let eig = na::DVector::from_fn(dim, |i, _| {
            let t = if dim > 1 { i as f64 / (dim - 1) as f64 } else { 1.0 };
            rate * (2.0 * t - 1.0)
        });
        // A fixed orthogonal basis from the QR decomposition of a deterministic matrix.
        let m = na::DMatrix::from_fn(dim, dim, |i, j| {
            let diag = if i == j { 2.0 } else { 0.0 };
            ((i * dim + j) as f64 * 0.7).sin() + diag
        });
        let q = m.qr().q();
        let a = &q * na::DMatrix::from_diagonal(&eig) * q.transpose();
        let b = InterfaceVector::from_fn(dim, |i, _| 1.0 + (i as f64 * 0.3).cos());
        LinearMap { a, b }
    }

    pub fn apply(&self, x: &InterfaceVector) -> InterfaceVector {
        &self.a * x + &self.b
    }

    pub fn fixed_point(&self) -> Option<InterfaceVector> {
        let n = self.b.len();
        (na::DMatrix::identity(n, n) - &self.a).lu().solve(&self.b)
    }
}
