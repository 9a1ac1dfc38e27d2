//! Residual tracking and the convergence decision for one time step.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::CouplingParams;
use crate::interface::{Domain, Field, InterfaceError, InterfaceState};

/// Outcome of checking one sub-iteration.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    Continue,
    Converged,
    Diverged,
}

/// Residual scale per domain and field, carried from step to step.
///
/// The relative error divides a residual norm by the larger of the output norm and this scale.
/// The scale is the largest first residual seen so far in the run, which keeps the error
/// meaningful when the interface quantities vanish.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResidualScale {
    pub domains: BTreeMap<Domain, f64>,
    pub fields: BTreeMap<Field, f64>,
}

/// Relative residual of `output` against `input` over `fields`, and the two norms involved.
fn residual_norms(
    input: &InterfaceState,
    output: &InterfaceState,
    fields: &[Field],
) -> Result<(f64, f64), InterfaceError> {
    let x = input.flatten(fields)?;
    let y = output.flatten(fields)?;
    Ok(((y.clone() - x).norm(), y.norm()))
}

fn relative(residual: f64, output: f64, scale: f64) -> f64 {
    let denom = output.max(scale);
    if denom > 0.0 {
        residual / denom
    } else {
        residual
    }
}

/// Tracks residual norms per field and domain for every sub-iteration of a time step.
///
/// Convergence requires every field and every domain below tolerance at the same sub-iteration.
#[derive(Clone, Debug)]
pub struct ConvergenceMonitor {
    tol: f64,
    window: usize,
    blowup: f64,
    domains: Vec<Domain>,
    scale: ResidualScale,
    errors: BTreeMap<Domain, Vec<f64>>,
    field_errors: BTreeMap<Field, Vec<f64>>,
    totals: Vec<f64>,
}

impl ConvergenceMonitor {
    pub fn new(params: &CouplingParams, scale: ResidualScale) -> Self {
        let domains: Vec<Domain> = params.order.iter().flatten().copied().collect();
        ConvergenceMonitor {
            tol: params.tol,
            window: params.divergence_window,
            blowup: params.blowup_factor,
            errors: domains.iter().map(|&d| (d, Vec::new())).collect(),
            field_errors: BTreeMap::new(),
            domains,
            scale,
            totals: Vec::new(),
        }
    }

    /// Number of sub-iterations checked so far.
    pub fn iterations(&self) -> usize {
        self.totals.len()
    }

    /// Relative error of every domain for every sub-iteration.
    pub fn errors(&self) -> &BTreeMap<Domain, Vec<f64>> {
        &self.errors
    }

    /// Relative error of every field for every sub-iteration.
    pub fn field_errors(&self) -> &BTreeMap<Field, Vec<f64>> {
        &self.field_errors
    }

    /// Absolute norm of the full residual for every sub-iteration.
    pub fn residual_history(&self) -> &[f64] {
        &self.totals
    }

    /// Errors of the most recent sub-iteration.
    pub fn last_errors(&self) -> BTreeMap<Domain, f64> {
        self.errors
            .iter()
            .filter_map(|(&d, e)| e.last().map(|&e| (d, e)))
            .collect()
    }

    /// Residual scale to carry into the next time step.
    pub fn scale(&self) -> &ResidualScale {
        &self.scale
    }

    /// Records the residual of one sub-iteration and decides how to proceed.
    pub fn check(
        &mut self,
        input: &InterfaceState,
        output: &InterfaceState,
    ) -> Result<Verdict, InterfaceError> {
        let first = self.totals.is_empty();
        let mut converged = true;
        let mut total_sq = 0.0;

        for &domain in self.domains.iter() {
            for &field in domain.outputs() {
                let (r, y) = residual_norms(input, output, &[field])?;
                let scale = self.scale.fields.entry(field).or_insert(0.0);
                if first {
                    *scale = scale.max(r);
                }
                let e = relative(r, y, *scale);
                converged &= e < self.tol;
                total_sq += r * r;
                self.field_errors.entry(field).or_default().push(e);
            }

            let (r, y) = residual_norms(input, output, domain.outputs())?;
            let scale = self.scale.domains.entry(domain).or_insert(0.0);
            if first {
                *scale = scale.max(r);
            }
            let e = relative(r, y, *scale);
            converged &= e < self.tol;
            self.errors.entry(domain).or_default().push(e);
        }

        let total = total_sq.sqrt();
        self.totals.push(total);
        log::debug!(
            "Sub-iteration {}: residual {:.3e}, errors {:?}",
            self.totals.len(),
            total,
            self.last_errors()
        );

        if !total.is_finite() {
            return Ok(Verdict::Diverged);
        }
        if converged {
            return Ok(Verdict::Converged);
        }
        if self.is_diverging() {
            return Ok(Verdict::Diverged);
        }
        Ok(Verdict::Continue)
    }

    /// The residual grew strictly over the last `window` sub-iterations and is far above the
    /// smallest residual of the step.
    fn is_diverging(&self) -> bool {
        let n = self.totals.len();
        if n <= self.window {
            return false;
        }
        let recent = &self.totals[n - self.window - 1..];
        let growing = recent.windows(2).all(|w| w[1] > w[0]);
        let min = self.totals.iter().copied().fold(f64::INFINITY, f64::min);
        growing && self.totals[n - 1] > self.blowup * min
    }
}
