//! Cholesky factorization of the covariance matrix and solves against it.

use crate::errors::{GpError, Result};
use linfa::Float;
use linfa_linalg::{cholesky::*, triangular::*};
use ndarray::{Array1, Array2, ArrayBase, Axis, Data, Ix2};

/// Lower triangular factor `L` of a symmetric positive definite matrix `K = L.L^t`
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct CholeskyFactor<F: Float> {
    lower: Array2<F>,
}

impl<F: Float> CholeskyFactor<F> {
    /// Factorize `k`, fails when `k` is not positive definite
    pub fn factorize(k: &Array2<F>) -> Result<Self> {
        let lower = k.cholesky().map_err(GpError::FactorizationError)?;
        Ok(CholeskyFactor { lower })
    }

    #[cfg(test)]
    pub fn lower(&self) -> &Array2<F> {
        &self.lower
    }

    /// `log|K| = 2 sum_i log L_ii`
    pub fn log_det(&self) -> F {
        F::cast(2.) * self.lower.diag().mapv(|v| v.ln()).sum()
    }

    /// Overwrite `b` with `K^-1.b`
    pub fn solve_inplace(&self, b: &mut Array2<F>) -> Result<()> {
        self.lower
            .solve_triangular_inplace(b, UPLO::Lower)
            .map_err(GpError::SolveError)?;
        self.lower
            .t()
            .solve_triangular_inplace(b, UPLO::Upper)
            .map_err(GpError::SolveError)?;
        Ok(())
    }

    /// `K^-1.b`
    pub fn solve<S: Data<Elem = F>>(&self, b: &ArrayBase<S, Ix2>) -> Result<Array2<F>> {
        let rho = self
            .lower
            .solve_triangular(b, UPLO::Lower)
            .map_err(GpError::SolveError)?;
        self.lower
            .t()
            .solve_triangular_into(rho, UPLO::Upper)
            .map_err(GpError::SolveError)
    }

    /// `K^-1.y` for a single right hand side
    pub fn solve_vec(&self, y: &Array1<F>) -> Result<Array1<F>> {
        let rhs = y.to_owned().insert_axis(Axis(1));
        let sol = self.solve(&rhs)?;
        Ok(sol.remove_axis(Axis(1)))
    }
}
