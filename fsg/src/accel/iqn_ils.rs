use super::{check_sizes, relax, AccelerationError, Accelerator, Admission, FilteredQr, IterationRecord};
use crate::interface::InterfaceVector;

/// A pair of history columns.
#[derive(Clone, Debug)]
struct HistoryColumn {
    /// Difference of consecutive residuals.
    dr: InterfaceVector,
    /// Difference of consecutive outputs.
    dout: InterfaceVector,
    /// Time step in which the pair was recorded.
    step: usize,
}

/// Counters for diagnostics.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FilterStats {
    pub admitted: usize,
    pub filtered: usize,
}

/// Interface quasi-Newton with an inverse Jacobian from a least-squares model.
///
/// With `V` holding residual differences and `W` the matching output differences, the next input
/// is `G(x) + W c` where `c` minimizes `|V c + r|`. Columns are admitted through a [`FilteredQr`]
/// of `V`, so nearly dependent directions never enter the least-squares problem.
///
/// The history is an arena that is cleared at every time step, unless `reuse` is positive, in
/// which case the columns of the last `reuse` time steps are kept and filtered again. Columns
/// recorded in the step being entered belong to an abandoned attempt and are always dropped.
#[derive(Clone, Debug)]
pub struct IqnIls {
    omega: f64,
    reuse: usize,
    step: usize,
    qr: FilteredQr,
    columns: Vec<HistoryColumn>,
    prev: Option<IterationRecord>,
    stats: FilterStats,
}

impl IqnIls {
    pub fn new(omega: f64, eps: f64, reuse: usize) -> Self {
        IqnIls {
            omega,
            reuse,
            step: 0,
            qr: FilteredQr::new(eps),
            columns: Vec::new(),
            prev: None,
            stats: FilterStats::default(),
        }
    }

    /// Rank of the filtered residual-difference matrix.
    pub fn rank(&self) -> usize {
        self.qr.rank()
    }

    pub fn stats(&self) -> FilterStats {
        self.stats
    }

    /// Orthonormal basis of the admitted residual differences.
    pub fn basis(&self) -> &[InterfaceVector] {
        self.qr.basis()
    }

    fn admit(&mut self, column: HistoryColumn) {
        match self.qr.push(&column.dr) {
            Admission::Admitted => {
                self.stats.admitted += 1;
                self.columns.push(column);
            }
            Admission::Filtered { ratio } => {
                self.stats.filtered += 1;
                log::debug!(
                    "IQN-ILS: filtered history column (orthogonal ratio {:.3e})",
                    ratio
                );
            }
        }
    }
}

impl Accelerator for IqnIls {
    fn begin_step(&mut self, step: usize) {
        self.step = step;
        self.prev = None;
        self.qr.clear();
        if self.reuse == 0 {
            self.columns.clear();
            return;
        }
        let oldest = step.saturating_sub(self.reuse);
        let retained: Vec<_> = self
            .columns
            .drain(..)
            .filter(|c| c.step >= oldest && c.step < step)
            .collect();
        for column in retained {
            self.admit(column);
        }
        log::debug!(
            "IQN-ILS: reusing {} history columns from previous time steps",
            self.columns.len()
        );
    }

    fn update(
        &mut self,
        input: &InterfaceVector,
        output: &InterfaceVector,
    ) -> Result<InterfaceVector, AccelerationError> {
        check_sizes(input, output)?;
        if let Some(col) = self.columns.first() {
            check_sizes(&col.dout, output)?;
        }

        let record = IterationRecord {
            input: input.clone(),
            output: output.clone(),
        };
        let r = record.residual();

        if let Some(prev) = self.prev.take() {
            let column = HistoryColumn {
                dr: &r - prev.residual(),
                dout: output - &prev.output,
                step: self.step,
            };
            self.admit(column);
        }
        self.prev = Some(record);

        if self.columns.is_empty() {
            return Ok(relax(input, output, self.omega));
        }

        let c = self.qr.solve(&(-&r))?;
        let mut next = output.clone();
        for (column, &cj) in self.columns.iter().zip(c.iter()) {
            next.axpy(cj, &column.dout, 1.0);
        }
        Ok(next)
    }

    fn history_len(&self) -> usize {
        self.columns.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Affine contraction `G(x) = A x + b` with a known fixed point.
    fn affine(x: &InterfaceVector) -> InterfaceVector {
        let a = na::DMatrix::from_row_slice(3, 3, &[0.5, 0.1, 0.0, 0.0, 0.3, 0.2, 0.1, 0.0, 0.6]);
        let b = InterfaceVector::from_vec(vec![1.0, -2.0, 0.5]);
        a * x + b
    }

    #[test]
    fn first_update_relaxes() {
        let mut iqn = IqnIls::new(0.4, 1e-2, 0);
        iqn.begin_step(0);
        let x = InterfaceVector::zeros(3);
        let gx = affine(&x);
        let next = iqn.update(&x, &gx).unwrap();
        assert_relative_eq!(next, &gx * 0.4, epsilon = 1e-14);
        assert_eq!(iqn.history_len(), 0);
    }

    #[test]
    fn linear_map_is_solved_after_dimension_updates() {
        let mut iqn = IqnIls::new(0.5, 1e-10, 0);
        iqn.begin_step(0);
        let mut x = InterfaceVector::zeros(3);
        for _ in 0..5 {
            let gx = affine(&x);
            x = iqn.update(&x, &gx).unwrap();
        }
        let r = affine(&x) - &x;
        assert!(r.norm() < 1e-10, "residual {}", r.norm());
        assert!(iqn.rank() <= 3);
    }

    #[test]
    fn history_resets_between_steps() {
        let mut iqn = IqnIls::new(0.5, 1e-10, 0);
        iqn.begin_step(0);
        let mut x = InterfaceVector::zeros(3);
        for _ in 0..3 {
            let gx = affine(&x);
            x = iqn.update(&x, &gx).unwrap();
        }
        assert_eq!(iqn.history_len(), 2);
        iqn.begin_step(1);
        assert_eq!(iqn.history_len(), 0);
        assert_eq!(iqn.rank(), 0);
    }

    #[test]
    fn history_is_reused_when_configured() {
        let mut iqn = IqnIls::new(0.5, 1e-10, 1);
        iqn.begin_step(0);
        let mut x = InterfaceVector::zeros(3);
        for _ in 0..3 {
            let gx = affine(&x);
            x = iqn.update(&x, &gx).unwrap();
        }
        iqn.begin_step(1);
        assert_eq!(iqn.history_len(), 2);
        // Columns older than one step are dropped.
        iqn.begin_step(3);
        assert_eq!(iqn.history_len(), 0);
    }

    #[test]
    fn collinear_history_does_not_break_the_solve() {
        let mut iqn = IqnIls::new(0.5, 1e-2, 0);
        iqn.begin_step(0);
        // Outputs are chosen such that consecutive residual differences are collinear.
        let inputs = [
            vec![0.0, 0.0, 0.0],
            vec![1.0, 1.0, 1.0],
            vec![2.0, 2.0, 2.0],
            vec![3.0, 3.0, 3.0 + 1e-12],
        ];
        for input in inputs.iter() {
            let x = InterfaceVector::from_vec(input.clone());
            let gx = &x * 0.5 + InterfaceVector::from_element(3, 1.0);
            let next = iqn.update(&x, &gx).unwrap();
            assert!(next.iter().all(|v| v.is_finite()));
        }
        assert_eq!(iqn.rank(), 1);
        assert_eq!(iqn.stats(), FilterStats { admitted: 1, filtered: 2 });
        // The surviving basis vector is along the first difference.
        let dir = InterfaceVector::from_element(3, 1.0).normalize();
        assert_relative_eq!(iqn.basis()[0].dot(&dir).abs(), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn retried_step_drops_its_own_history() {
        let mut iqn = IqnIls::new(0.5, 1e-6, 1);
        iqn.begin_step(4);
        let mut x = InterfaceVector::zeros(3);
        for _ in 0..4 {
            let gx = affine(&x);
            x = iqn.update(&x, &gx).unwrap();
        }
        assert!(iqn.history_len() > 0);

        // Entering the same step again starts without the columns of the failed attempt.
        iqn.begin_step(4);
        assert_eq!(iqn.history_len(), 0);
        assert_eq!(iqn.rank(), 0);
    }

    #[test]
    fn nearly_dependent_column_is_filtered_without_eps() {
        // Inputs stay at zero, so every output is its own residual.
        let residuals = [
            [1.0, 0.0, 0.0, 0.0],
            [2.0, 1.0, 0.0, 0.0],
            [3.0, 2.0, 1e-15, 0.0],
            [3.0, 2.0, 1.0 + 1e-15, 0.0],
            [3.0, 2.0, 1.0 + 1e-15, 1.0],
        ];
        let mut iqn = IqnIls::new(0.5, 0.0, 0);
        iqn.begin_step(0);
        let x = InterfaceVector::zeros(4);
        for (k, r) in residuals.iter().enumerate() {
            let gx = InterfaceVector::from_column_slice(r);
            let next = iqn.update(&x, &gx);
            assert!(next.is_ok(), "update {} failed: {:?}", k, next);
        }
        assert_eq!(iqn.rank(), 3);
        assert_eq!(iqn.stats(), FilterStats { admitted: 3, filtered: 1 });
    }
}
