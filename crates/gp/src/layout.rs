//! Layouts of the flat vectors exchanged with elemental model consumers
//! and of the gradient tensor slots.
//!
//! A flat parameter vector is either
//! * `[theta_simil..., theta_noise...]`, or
//! * `[theta_simil..., theta_noise..., x_0..., ..., x_{n-1}..., y_0, ..., y_{n-1}]`.

use crate::errors::{GpError, Result};
use linfa::Float;
use ndarray::{Array1, Array2, ArrayView1};

/// Sizes of the hyperparameters and location blocks
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ThetaLayout {
    pub n_simil: usize,
    pub n_noise: usize,
    pub ndim: usize,
}

/// Hyperparameters of both kernels
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Hyperparameters<F: Float> {
    pub simil: Array1<F>,
    pub noise: Array1<F>,
}

/// A decoded flat parameter vector
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Decoded<F: Float> {
    pub theta: Hyperparameters<F>,
    /// Training inputs and outputs when part of the flat vector
    pub data: Option<(Array2<F>, Array1<F>)>,
}

impl ThetaLayout {
    /// Number of hyperparameters
    pub fn n_hyper(&self) -> usize {
        self.n_simil + self.n_noise
    }

    /// Length of a flat vector holding hyperparameters and `n` training points
    pub fn len_with_data(&self, n: usize) -> usize {
        self.n_hyper() + n * (self.ndim + 1)
    }

    /// Decode a flat vector, hyperparameters are mapped through `to_linear`
    pub fn decode<F: Float>(&self, flat: &[F], to_linear: impl Fn(F) -> F) -> Result<Decoded<F>> {
        let n_hyper = self.n_hyper();
        if flat.len() < n_hyper {
            return Err(GpError::ShapeMismatchError(format!(
                "parameter vector of length {} is shorter than the {} hyperparameters",
                flat.len(),
                n_hyper
            )));
        }
        let theta = Hyperparameters {
            simil: flat[..self.n_simil].iter().map(|v| to_linear(*v)).collect(),
            noise: flat[self.n_simil..n_hyper]
                .iter()
                .map(|v| to_linear(*v))
                .collect(),
        };
        let rest = &flat[n_hyper..];
        if rest.is_empty() {
            return Ok(Decoded { theta, data: None });
        }
        if rest.len() % (self.ndim + 1) != 0 {
            return Err(GpError::ShapeMismatchError(format!(
                "{} values after hyperparameters cannot be split into points of dimension {} and outputs",
                rest.len(),
                self.ndim
            )));
        }
        let n = rest.len() / (self.ndim + 1);
        let (xs, ys) = rest.split_at(n * self.ndim);
        let x = Array2::from_shape_vec((n, self.ndim), xs.to_vec())
            .map_err(|e| GpError::ShapeMismatchError(e.to_string()))?;
        let y = Array1::from_vec(ys.to_vec());
        Ok(Decoded {
            theta,
            data: Some((x, y)),
        })
    }

    /// Encode hyperparameters (as is) and optionally training data into a flat vector
    pub fn encode<F: Float>(
        &self,
        theta: &Hyperparameters<F>,
        data: Option<(&Array2<F>, ArrayView1<F>)>,
    ) -> Vec<F> {
        let mut flat = Vec::with_capacity(self.n_hyper());
        flat.extend(theta.simil.iter());
        flat.extend(theta.noise.iter());
        if let Some((x, y)) = data {
            flat.reserve(self.len_with_data(y.len()) - self.n_hyper());
            flat.extend(x.iter());
            flat.extend(y.iter());
        }
        flat
    }
}

/// Indices of the scalar parameters in the gradient tensor of the covariance matrix:
/// similarity hyperparameters, noise hyperparameters, then `ndim` coordinates per
/// training point when gradients wrt inputs are requested.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct SlotLayout {
    pub theta: ThetaLayout,
    pub n_points: usize,
    pub inputs: bool,
}

impl SlotLayout {
    pub fn simil(&self, k: usize) -> usize {
        k
    }

    pub fn noise(&self, k: usize) -> usize {
        self.theta.n_simil + k
    }

    /// Slot of the `d`th coordinate of the `i`th training point
    pub fn coord(&self, i: usize, d: usize) -> usize {
        self.theta.n_hyper() + i * self.theta.ndim + d
    }

    pub fn len(&self) -> usize {
        if self.inputs {
            self.theta.n_hyper() + self.n_points * self.theta.ndim
        } else {
            self.theta.n_hyper()
        }
    }
}
