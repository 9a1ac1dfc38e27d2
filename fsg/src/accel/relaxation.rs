use super::{check_sizes, relax, AccelerationError, Accelerator};
use crate::interface::InterfaceVector;

/// Fixed-point iteration with a constant relaxation factor.
#[derive(Clone, Debug)]
pub struct ConstantRelaxation {
    pub omega: f64,
}

impl ConstantRelaxation {
    pub fn new(omega: f64) -> Self {
        ConstantRelaxation { omega }
    }
}

impl Accelerator for ConstantRelaxation {
    fn begin_step(&mut self, _step: usize) {}

    fn update(
        &mut self,
        input: &InterfaceVector,
        output: &InterfaceVector,
    ) -> Result<InterfaceVector, AccelerationError> {
        check_sizes(input, output)?;
        Ok(relax(input, output, self.omega))
    }
}

/// Aitken's dynamic relaxation.
///
/// The factor is updated from consecutive residuals as
/// `omega_k = -omega_{k-1} r_{k-1}.(r_k - r_{k-1}) / |r_k - r_{k-1}|^2`
/// and restarts from `omega0` at every time step.
#[derive(Clone, Debug)]
pub struct Aitken {
    omega0: f64,
    omega: f64,
    prev_residual: Option<InterfaceVector>,
}

impl Aitken {
    pub fn new(omega0: f64) -> Self {
        Aitken {
            omega0,
            omega: omega0,
            prev_residual: None,
        }
    }

    /// Factor used for the last update.
    pub fn omega(&self) -> f64 {
        self.omega
    }
}

impl Accelerator for Aitken {
    fn begin_step(&mut self, _step: usize) {
        self.omega = self.omega0;
        self.prev_residual = None;
    }

    fn update(
        &mut self,
        input: &InterfaceVector,
        output: &InterfaceVector,
    ) -> Result<InterfaceVector, AccelerationError> {
        check_sizes(input, output)?;
        let r = output - input;
        if let Some(prev) = self.prev_residual.as_ref() {
            if prev.len() != r.len() {
                return Err(AccelerationError::SizeMismatch {
                    expected: prev.len(),
                    actual: r.len(),
                });
            }
            let dr = &r - prev;
            let denom = dr.norm_squared();
            if denom > 0.0 {
                let omega = -self.omega * prev.dot(&dr) / denom;
                if omega.is_finite() {
                    self.omega = omega;
                }
            }
        }
        log::trace!("Aitken factor {}", self.omega);
        let next = relax(input, output, self.omega);
        self.prev_residual = Some(r);
        Ok(next)
    }
}
