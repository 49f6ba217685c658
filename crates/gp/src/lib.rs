//! This library implements exact [Gaussian Process](https://en.wikipedia.org/wiki/Gaussian_process)
//! regression whose log marginal likelihood is a differentiable function of the kernel
//! hyperparameters, and optionally of the training inputs and outputs themselves.
//!
//! The GP is built from two kernels reporting their own partial derivatives:
//! a similarity kernel (see [kernels]) and a noise kernel (see [noise_models]).
//!
//! GP regression is implemented by [GaussianProcess] parameterized by [GpParams].
//! Beside fit and predict, a GP is an [ElementalModel]: a log density over a flat
//! parameter vector with its gradient, which can be wrapped in [LogScale], combined with
//! priors in a [Posterior] and maximized with [optimize_params].
#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]
mod algorithm;
mod assembly;
mod errors;
pub mod kernels;
mod layout;
mod linalg;
mod logscale;
mod model;
pub mod noise_models;
mod pool;

mod parameters;

mod optimization;

pub use algorithm::*;
pub use errors::*;
pub use kernels::{Kernel, Tape};
pub use logscale::*;
pub use model::*;
pub use optimization::{optimize_params, LbfgsParams};
pub use parameters::*;
