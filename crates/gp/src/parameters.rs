use crate::errors::{GpError, Result};
use crate::kernels::Kernel;
use linfa::{Float, ParamGuard};
use ndarray::Array1;
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};

/// A set of validated GP parameters.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(bound(
        serialize = "F: Serialize, S: Serialize, N: Serialize",
        deserialize = "F: Deserialize<'de>, S: Deserialize<'de>, N: Deserialize<'de>"
    ))
)]
pub struct GpValidParams<F: Float, S: Kernel<F>, N: Kernel<F>> {
    /// Similarity kernel modelling the covariance between two distinct locations
    pub(crate) simil: S,
    /// Noise kernel modelling the variance added at a single location
    pub(crate) noise: N,
    /// Dimension of input locations
    pub(crate) ndim: usize,
    /// Hyperparameters of the similarity kernel (linear space), zeros when unset
    pub(crate) theta_simil: Option<Array1<F>>,
    /// Hyperparameters of the noise kernel (linear space), zeros when unset
    pub(crate) theta_noise: Option<Array1<F>>,
    /// Whether covariance computations are spread over rayon workers
    pub(crate) parallel: bool,
    /// Jitter added to the covariance diagonal to improve numerical stability
    pub(crate) nugget: F,
}

impl<F: Float, S: Kernel<F>, N: Kernel<F>> GpValidParams<F, S, N> {
    /// Get similarity kernel
    pub fn simil(&self) -> &S {
        &self.simil
    }

    /// Get noise kernel
    pub fn noise(&self) -> &N {
        &self.noise
    }

    /// Get input dimension
    pub fn ndim(&self) -> usize {
        self.ndim
    }

    /// Get similarity kernel hyperparameters, zeros if not set
    pub fn theta_simil(&self) -> Array1<F> {
        self.theta_simil
            .clone()
            .unwrap_or_else(|| Array1::zeros(self.simil.ntheta()))
    }

    /// Get noise kernel hyperparameters, zeros if not set
    pub fn theta_noise(&self) -> Array1<F> {
        self.theta_noise
            .clone()
            .unwrap_or_else(|| Array1::zeros(self.noise.ntheta()))
    }

    /// Whether parallel execution is requested
    pub fn parallel(&self) -> bool {
        self.parallel
    }

    /// Get nugget
    pub fn nugget(&self) -> F {
        self.nugget
    }
}

#[derive(Clone, Debug)]
/// The set of hyperparameters that can be specified for the execution of
/// the [GP algorithm](struct.GaussianProcess.html).
pub struct GpParams<F: Float, S: Kernel<F>, N: Kernel<F>>(GpValidParams<F, S, N>);

impl<F: Float, S: Kernel<F>, N: Kernel<F>> GpParams<F, S, N> {
    /// A constructor for GP parameters given similarity and noise kernels
    pub fn new(simil: S, noise: N) -> GpParams<F, S, N> {
        Self(GpValidParams {
            simil,
            noise,
            ndim: 1,
            theta_simil: None,
            theta_noise: None,
            parallel: false,
            nugget: F::cast(100.0) * F::epsilon(),
        })
    }

    /// Set dimension of input locations.
    pub fn ndim(mut self, ndim: usize) -> Self {
        self.0.ndim = ndim;
        self
    }

    /// Set similarity kernel hyperparameters given in linear space.
    pub fn theta_simil(mut self, theta: Array1<F>) -> Self {
        self.0.theta_simil = Some(theta);
        self
    }

    /// Set noise kernel hyperparameters given in linear space.
    pub fn theta_noise(mut self, theta: Array1<F>) -> Self {
        self.0.theta_noise = Some(theta);
        self
    }

    /// Set parallel covariance computation.
    ///
    /// Parallel execution is silently downgraded to sequential
    /// when one of the kernels is not reentrant.
    pub fn parallel(mut self, parallel: bool) -> Self {
        self.0.parallel = parallel;
        self
    }

    /// Set nugget.
    ///
    /// Nugget is used to improve numerical stability
    pub fn nugget(mut self, nugget: F) -> Self {
        self.0.nugget = nugget;
        self
    }
}

impl<F: Float, S: Kernel<F>, N: Kernel<F>> From<GpValidParams<F, S, N>> for GpParams<F, S, N> {
    fn from(valid: GpValidParams<F, S, N>) -> Self {
        GpParams(valid)
    }
}

fn check_theta<F: Float>(name: &str, theta: &Option<Array1<F>>, ntheta: usize) -> Result<()> {
    if let Some(theta) = theta {
        if theta.len() != ntheta {
            return Err(GpError::InvalidValueError(format!(
                "`{name}` should have {ntheta} components, got {}",
                theta.len()
            )));
        }
    }
    Ok(())
}

impl<F: Float, S: Kernel<F>, N: Kernel<F>> ParamGuard for GpParams<F, S, N> {
    type Checked = GpValidParams<F, S, N>;
    type Error = GpError;

    fn check_ref(&self) -> Result<&Self::Checked> {
        if self.0.ndim == 0 {
            return Err(GpError::InvalidValueError(
                "`ndim` cannot be 0!".to_string(),
            ));
        }
        check_theta("theta_simil", &self.0.theta_simil, self.0.simil.ntheta())?;
        check_theta("theta_noise", &self.0.theta_noise, self.0.noise.ntheta())?;
        if !self.0.nugget.is_finite() || self.0.nugget < F::zero() {
            return Err(GpError::InvalidValueError(format!(
                "`nugget` should be a finite positive value, got {}",
                self.0.nugget
            )));
        }
        Ok(&self.0)
    }

    fn check(self) -> Result<Self::Checked> {
        self.check_ref()?;
        Ok(self.0)
    }
}
