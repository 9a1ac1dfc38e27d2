use super::AccelerationError;
use crate::interface::InterfaceVector;

/// Size of a diagonal entry of `R` relative to its column below which the solve is singular.
const SINGULAR_TOL: f64 = 1e-13;

/// Outcome of offering a column to [`FilteredQr::push`].
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Admission {
    Admitted,
    /// The column is numerically dependent on the current basis.
    ///
    /// `ratio` is the norm of its orthogonal component relative to its own norm.
    Filtered { ratio: f64 },
}

/// Thin QR decomposition built one column at a time.
///
/// Columns are orthogonalized with modified Gram-Schmidt and one re-orthogonalization pass.
/// A column whose orthogonal component is smaller than `eps` times its own norm is rejected,
/// so the factors never carry nearly dependent directions. Columns that would make the
/// triangular solve singular are rejected for any `eps`.
#[derive(Clone, Debug)]
pub struct FilteredQr {
    eps: f64,
    q: Vec<InterfaceVector>,
    /// Column `j` of the upper triangular factor, `j + 1` entries.
    r: Vec<Vec<f64>>,
}

impl FilteredQr {
    pub fn new(eps: f64) -> Self {
        FilteredQr {
            eps,
            q: Vec::new(),
            r: Vec::new(),
        }
    }

    pub fn clear(&mut self) {
        self.q.clear();
        self.r.clear();
    }

    /// Number of admitted columns.
    pub fn rank(&self) -> usize {
        self.q.len()
    }

    /// Orthonormal basis of the admitted columns.
    pub fn basis(&self) -> &[InterfaceVector] {
        &self.q
    }

    pub fn push(&mut self, v: &InterfaceVector) -> Admission {
        let norm = v.norm();
        if !(norm > 0.0) || !norm.is_finite() {
            return Admission::Filtered { ratio: 0.0 };
        }

        let mut w = v.clone();
        let mut coeffs = vec![0.0; self.q.len()];
        for _ in 0..2 {
            for (qj, c) in self.q.iter().zip(coeffs.iter_mut()) {
                let h = qj.dot(&w);
                w.axpy(-h, qj, 1.0);
                *c += h;
            }
        }

        let rho = w.norm();
        let ratio = rho / norm;
        // Never admit more columns than there are degrees of freedom.
        if ratio <= self.eps.max(SINGULAR_TOL) || self.q.len() >= v.len() || rho == 0.0 {
            return Admission::Filtered { ratio };
        }

        w /= rho;
        coeffs.push(rho);
        self.q.push(w);
        self.r.push(coeffs);
        Admission::Admitted
    }

    /// Solves `min ||Q R c - b||` for `c`.
    pub fn solve(&self, b: &InterfaceVector) -> Result<Vec<f64>, AccelerationError> {
        let m = self.q.len();
        if let Some(q0) = self.q.first() {
            if q0.len() != b.len() {
                return Err(AccelerationError::SizeMismatch {
                    expected: q0.len(),
                    actual: b.len(),
                });
            }
        }

        // c = R^-1 Q^T b by back substitution.
        let mut c: Vec<f64> = self.q.iter().map(|qj| qj.dot(b)).collect();
        for i in (0..m).rev() {
            let diag = self.r[i][i];
            // Column `i` of R has the norm of the original column.
            let col_norm = self.r[i].iter().map(|x| x * x).sum::<f64>().sqrt();
            if !(diag.abs() > SINGULAR_TOL * col_norm) {
                return Err(AccelerationError::Singular);
            }
            let mut s = c[i];
            for j in i + 1..m {
                s -= self.r[j][i] * c[j];
            }
            c[i] = s / diag;
        }
        if c.iter().any(|x| !x.is_finite()) {
            return Err(AccelerationError::Singular);
        }
        Ok(c)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn vector(values: &[f64]) -> InterfaceVector {
        InterfaceVector::from_column_slice(values)
    }

    #[test]
    fn solves_least_squares() {
        let mut qr = FilteredQr::new(1e-8);
        assert_eq!(qr.push(&vector(&[1.0, 0.0, 1.0])), Admission::Admitted);
        assert_eq!(qr.push(&vector(&[0.0, 1.0, 1.0])), Admission::Admitted);

        // b is in the column space: b = 2 a0 - a1.
        let c = qr.solve(&vector(&[2.0, -1.0, 1.0])).unwrap();
        assert_relative_eq!(c[0], 2.0, epsilon = 1e-12);
        assert_relative_eq!(c[1], -1.0, epsilon = 1e-12);

        // Least-squares solution of an inconsistent system.
        let c = qr.solve(&vector(&[1.0, 1.0, 0.0])).unwrap();
        assert_relative_eq!(c[0], 1.0 / 3.0, epsilon = 1e-12);
        assert_relative_eq!(c[1], 1.0 / 3.0, epsilon = 1e-12);
    }

    #[test]
    fn collinear_column_is_filtered() {
        let mut qr = FilteredQr::new(1e-3);
        let a = vector(&[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(qr.push(&a), Admission::Admitted);
        let nearly = vector(&[2.0, 4.0, 6.0, 8.0 + 1e-9]);
        assert!(matches!(qr.push(&nearly), Admission::Filtered { ratio } if ratio < 1e-3));
        assert_eq!(qr.rank(), 1);

        // The basis still spans only `a`.
        let q = &qr.basis()[0];
        assert_relative_eq!(q.dot(&a).abs(), a.norm(), epsilon = 1e-12);
        assert!(qr.solve(&vector(&[1.0, 1.0, 1.0, 1.0])).is_ok());
    }

    #[test]
    fn rank_never_exceeds_dimension() {
        let mut qr = FilteredQr::new(0.0);
        for i in 0..6 {
            let x = i as f64;
            qr.push(&vector(&[1.0 + x, x * x, (x * 0.7).sin()]));
        }
        assert!(qr.rank() <= 3);
    }

    #[test]
    fn zero_and_nan_columns_are_filtered() {
        let mut qr = FilteredQr::new(0.0);
        assert!(matches!(
            qr.push(&vector(&[0.0, 0.0])),
            Admission::Filtered { .. }
        ));
        assert!(matches!(
            qr.push(&vector(&[f64::NAN, 1.0])),
            Admission::Filtered { .. }
        ));
        assert_eq!(qr.rank(), 0);
    }

    #[test]
    fn singular_columns_are_filtered_without_eps() {
        let mut qr = FilteredQr::new(0.0);
        assert_eq!(qr.push(&vector(&[1.0, 1.0, 0.0])), Admission::Admitted);
        assert!(matches!(
            qr.push(&vector(&[1.0, 1.0, 1e-15])),
            Admission::Filtered { ratio } if ratio < SINGULAR_TOL
        ));
        assert_eq!(qr.rank(), 1);

        // The factors stay solvable and later independent columns are still admitted.
        assert!(qr.solve(&vector(&[1.0, 0.0, 0.0])).is_ok());
        assert_eq!(qr.push(&vector(&[0.0, 0.0, 1.0])), Admission::Admitted);
        let c = qr.solve(&vector(&[1.0, 1.0, 2.0])).unwrap();
        assert_relative_eq!(c[0], 1.0, epsilon = 1e-12);
        assert_relative_eq!(c[1], 2.0, epsilon = 1e-12);
    }
}
