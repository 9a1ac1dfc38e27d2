//! Fixed-point accelerators for the interface iteration.
//!
//! An accelerator receives the input `x` and output `G(x)` of every sub-iteration and proposes
//! the next input.

mod iqn_ils;
mod qr;
mod relaxation;

pub use iqn_ils::*;
pub use qr::*;
pub use relaxation::*;

use thiserror::Error;

use crate::config::{CouplingMethod, CouplingParams};
use crate::interface::InterfaceVector;

#[derive(Copy, Clone, Debug, PartialEq, Error)]
pub enum AccelerationError {
    #[error("Least-squares system is singular")]
    Singular,
    #[error("Interface vector has {actual} entries, expected {expected}")]
    SizeMismatch { expected: usize, actual: usize },
}

/// One sub-iteration: the input handed to the solvers and the output they returned.
#[derive(Clone, Debug, PartialEq)]
pub struct IterationRecord {
    pub input: InterfaceVector,
    pub output: InterfaceVector,
}

impl IterationRecord {
    pub fn residual(&self) -> InterfaceVector {
        &self.output - &self.input
    }
}

pub trait Accelerator: Send {
    /// Called once at the start of every time step before the first update.
    fn begin_step(&mut self, step: usize);
    /// Incorporates the latest sub-iteration and returns the next input.
    ///
    /// On error the internal history stays consistent and the caller may fall back to
    /// [`relax`] for this sub-iteration.
    fn update(
        &mut self,
        input: &InterfaceVector,
        output: &InterfaceVector,
    ) -> Result<InterfaceVector, AccelerationError>;
    /// Number of history columns currently used.
    fn history_len(&self) -> usize {
        0
    }
}

/// Constant under-relaxation `x + omega (G(x) - x)`.
pub fn relax(input: &InterfaceVector, output: &InterfaceVector, omega: f64) -> InterfaceVector {
    input * (1.0 - omega) + output * omega
}

/// Builds the accelerator selected by `coup.method`.
pub fn new_accelerator(params: &CouplingParams) -> Box<dyn Accelerator> {
    match params.method {
        CouplingMethod::IqnIls => Box::new(IqnIls::new(
            params.omega0,
            params.iqn_ils_eps,
            params.iqn_ils_q,
        )),
        CouplingMethod::Relax => Box::new(ConstantRelaxation::new(params.omega0)),
        CouplingMethod::Aitken => Box::new(Aitken::new(params.omega0)),
    }
}

fn check_sizes(
    input: &InterfaceVector,
    output: &InterfaceVector,
) -> Result<(), AccelerationError> {
    if input.len() != output.len() {
        return Err(AccelerationError::SizeMismatch {
            expected: input.len(),
            actual: output.len(),
        });
    }
    Ok(())
}
