//! A module for noise kernels.
//!
//! A noise kernel adds variance to the diagonal of the covariance matrix.
//! It differs from a similarity kernel in that it accepts a single location:
//! its arguments are laid out as `[hyperparameters..., x...]`.
//!
//! When the GP is part of a larger model, noise may also be accounted for by treating
//! inputs and outputs as latent variables with priors (see [`crate::Posterior`]).
//! A [`ConstantNoise`] of zero then keeps the diagonal jitter only.

use crate::kernels::{Kernel, Tape};
use linfa::Float;
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};
use std::fmt;

/// Same fixed noise for all points given as a standard deviation, no hyperparameter
#[derive(Clone, Copy, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct ConstantNoise(pub f64);

impl<F: Float> Kernel<F> for ConstantNoise {
    fn ntheta(&self) -> usize {
        0
    }

    fn observe(&self, args: &[F], tape: &mut Tape<F>) -> F {
        tape.record(args.len(), |_| ());
        F::cast(self.0 * self.0)
    }
}

impl fmt::Display for ConstantNoise {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ConstantNoise({})", self.0)
    }
}

/// Same noise for all points learnt as a single standard deviation hyperparameter
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct UniformNoise;

impl<F: Float> Kernel<F> for UniformNoise {
    fn ntheta(&self) -> usize {
        1
    }

    fn observe(&self, args: &[F], tape: &mut Tape<F>) -> F {
        let std = args[0];
        tape.record(args.len(), |grad| grad[0] = F::cast(2.) * std);
        std * std
    }
}

impl fmt::Display for UniformNoise {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "UniformNoise")
    }
}
