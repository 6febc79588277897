//! Dense linear algebra glue between `ndarray` and `nalgebra` used by the block solver

use crate::error::FitError;

use nalgebra::{DMatrix, DVector, Dyn, LU};
use ndarray::{Array2, ArrayView1, ArrayView2, ArrayViewMut1};

/// Pivots smaller than this fraction of the largest matrix element are treated as zero
pub const SINGULAR_PIVOT_RATIO: f64 = 1e-15;

/// LU decomposition with partial pivoting of an `ndarray` matrix, factorized by `nalgebra`
#[derive(Clone, Debug)]
pub struct LuDecomposition {
    lu: LU<f64, Dyn, Dyn>,
    size: usize,
}

impl LuDecomposition {
    /// Factorizes a square matrix
    ///
    /// Fails with [FitError::Conditioning] if the matrix is numerically singular or contains
    /// non-finite values.
    pub fn new(a: ArrayView2<f64>) -> Result<Self, FitError> {
        let (n, m) = a.dim();
        if m != n {
            return Err(FitError::dimension("LU decomposition", n, m));
        }
        if a.iter().any(|x| !x.is_finite()) {
            return Err(FitError::Conditioning(
                "matrix contains non-finite values".into(),
            ));
        }
        let scale = a.iter().fold(0.0_f64, |acc, &x| acc.max(x.abs()));
        let lu = DMatrix::from_fn(n, n, |i, j| a[(i, j)]).lu();
        let u = lu.u();
        if let Some((k, pivot)) = u
            .diagonal()
            .iter()
            .map(|x| x.abs())
            .enumerate()
            .find(|&(_, x)| x <= SINGULAR_PIVOT_RATIO * scale)
        {
            return Err(FitError::Conditioning(format!(
                "(most probably) singular matrix, pivot {pivot:e} at column {k}"
            )));
        }
        Ok(Self { lu, size: n })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Solves `A x = b`, overwriting `b` with `x`
    pub fn solve_in_place(&self, mut b: ArrayViewMut1<f64>) -> Result<(), FitError> {
        if b.len() != self.size {
            return Err(FitError::dimension("LU right-hand side", self.size, b.len()));
        }
        let mut x = DVector::from_iterator(self.size, b.iter().copied());
        if !self.lu.solve_mut(&mut x) {
            return Err(FitError::Conditioning("singular matrix".into()));
        }
        b.iter_mut().zip(x.iter()).for_each(|(b, &x)| *b = x);
        Ok(())
    }

    /// Solves `A X = B` for all columns at once, overwriting `B` with `X`
    pub fn solve_matrix_in_place(&self, b: &mut Array2<f64>) -> Result<(), FitError> {
        if b.nrows() != self.size {
            return Err(FitError::dimension(
                "LU right-hand side rows",
                self.size,
                b.nrows(),
            ));
        }
        let mut x = DMatrix::from_fn(b.nrows(), b.ncols(), |i, j| b[(i, j)]);
        if !self.lu.solve_mut(&mut x) {
            return Err(FitError::Conditioning("singular matrix".into()));
        }
        for ((i, j), b) in b.indexed_iter_mut() {
            *b = x[(i, j)];
        }
        Ok(())
    }
}

/// `A^T A` for a dense matrix, filling the upper triangle and mirroring it
pub fn gram(a: ArrayView2<f64>) -> Array2<f64> {
    let n = a.ncols();
    let mut g = Array2::zeros((n, n));
    for j in 0..n {
        let cj = a.column(j);
        for k in j..n {
            let v = cj.dot(&a.column(k));
            g[(j, k)] = v;
            g[(k, j)] = v;
        }
    }
    g
}

/// Euclidean norm
pub fn norm2(v: ArrayView1<f64>) -> f64 {
    v.dot(&v).sqrt()
}

/// Maximum absolute value, zero for an empty vector
pub fn norm_inf(v: ArrayView1<f64>) -> f64 {
    v.iter().fold(0.0, |acc: f64, &x| acc.max(x.abs()))
}

#[cfg(test)]
mod tests {
    use super::*;

    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn solves_system_requiring_pivoting() {
        let a = array![[0.0, 2.0, 1.0], [1.0, 1.0, 0.0], [3.0, 0.0, 1.0]];
        let x_true = array![1.0, -2.0, 0.5];
        let mut b = a.dot(&x_true);
        let lu = LuDecomposition::new(a.view()).unwrap();
        lu.solve_in_place(b.view_mut()).unwrap();
        assert_abs_diff_eq!(b, x_true, epsilon = 1e-12);
    }

    #[test]
    fn singular_matrix_is_conditioning_failure() {
        let a = array![[1.0, 2.0], [2.0, 4.0]];
        let err = LuDecomposition::new(a.view()).unwrap_err();
        assert!(matches!(err, FitError::Conditioning(_)));
    }

    #[test]
    fn nearly_singular_matrix_is_conditioning_failure() {
        let a = array![[1.0, 1.0], [1.0, 1.0 + f64::EPSILON]];
        assert!(matches!(
            LuDecomposition::new(a.view()),
            Err(FitError::Conditioning(_))
        ));
    }

    #[test]
    fn non_finite_matrix_is_conditioning_failure() {
        let a = array![[1.0, f64::NAN], [0.0, 1.0]];
        assert!(matches!(
            LuDecomposition::new(a.view()),
            Err(FitError::Conditioning(_))
        ));
    }

    #[test]
    fn zero_matrix_is_singular() {
        assert!(LuDecomposition::new(Array2::<f64>::zeros((3, 3)).view()).is_err());
    }

    #[test]
    fn non_square_matrix() {
        assert!(matches!(
            LuDecomposition::new(Array2::<f64>::zeros((2, 3)).view()),
            Err(FitError::Dimension { .. })
        ));
    }

    #[test]
    fn solve_matrix_gives_inverse() {
        let a = array![[4.0, 1.0, 0.0], [1.0, 3.0, -1.0], [0.0, -1.0, 2.0]];
        let lu = LuDecomposition::new(a.view()).unwrap();
        let mut inv = Array2::<f64>::eye(3);
        lu.solve_matrix_in_place(&mut inv).unwrap();
        assert_abs_diff_eq!(a.dot(&inv), Array2::<f64>::eye(3), epsilon = 1e-12);
        assert!(matches!(
            lu.solve_matrix_in_place(&mut Array2::zeros((2, 2))),
            Err(FitError::Dimension { .. })
        ));
    }

    #[test]
    fn gram_matches_transposed_product() {
        let a = array![[1.0, 2.0], [3.0, -1.0], [0.5, 0.0]];
        assert_abs_diff_eq!(gram(a.view()), a.t().dot(&a), epsilon = 1e-14);
    }
}
