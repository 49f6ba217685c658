//! Elemental models: differentiable scalar functions of a flat parameter vector
//! which can be composed into a larger model or driven by a gradient based optimizer.

use crate::errors::{GpError, Result};
use linfa::Float;
use ndarray::{s, Array1, ArrayView1};
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};

/// A differentiable log density over a flat parameter vector.
///
/// [`ElementalModel::gradient`] returns the gradient at the parameters given to
/// the immediately preceding [`ElementalModel::observe`] call, with the same length.
pub trait ElementalModel<F: Float> {
    /// Evaluate the model at `params`
    fn observe(&mut self, params: &[F]) -> Result<F>;

    /// Gradient of the last observed value wrt its parameters
    fn gradient(&mut self) -> Result<Array1<F>>;

    /// Discard the pending gradient without computing it
    fn drop_gradient(&mut self) {}
}

impl<F: Float, M: ElementalModel<F> + ?Sized> ElementalModel<F> for &mut M {
    fn observe(&mut self, params: &[F]) -> Result<F> {
        (**self).observe(params)
    }

    fn gradient(&mut self) -> Result<Array1<F>> {
        (**self).gradient()
    }

    fn drop_gradient(&mut self) {
        (**self).drop_gradient()
    }
}

/// Sum of a likelihood and a prior over the same parameter vector.
///
/// The prior may cover only the leading parameters, its gradient is then
/// added to the leading components of the likelihood gradient.
pub struct Posterior<L, P> {
    /// Likelihood model
    pub likelihood: L,
    /// Prior model
    pub prior: P,
}

impl<L, P> Posterior<L, P> {
    /// Constructor
    pub fn new(likelihood: L, prior: P) -> Self {
        Posterior { likelihood, prior }
    }
}

impl<F: Float, L: ElementalModel<F>, P: ElementalModel<F>> ElementalModel<F> for Posterior<L, P> {
    fn observe(&mut self, params: &[F]) -> Result<F> {
        let ll = self.likelihood.observe(params)?;
        match self.prior.observe(params) {
            Ok(lp) => Ok(ll + lp),
            Err(err) => {
                self.likelihood.drop_gradient();
                Err(err)
            }
        }
    }

    fn gradient(&mut self) -> Result<Array1<F>> {
        let mut grad = self.likelihood.gradient()?;
        let prior = self.prior.gradient()?;
        if prior.len() > grad.len() {
            return Err(GpError::ShapeMismatchError(format!(
                "prior gradient of length {} exceeds likelihood gradient of length {}",
                prior.len(),
                grad.len()
            )));
        }
        let mut head = grad.slice_mut(s![..prior.len()]);
        head += &prior;
        Ok(grad)
    }

    fn drop_gradient(&mut self) {
        self.likelihood.drop_gradient();
        self.prior.drop_gradient();
    }
}

/// Independent normal log densities on the leading parameters
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct NormalPrior<F: Float> {
    mean: Array1<F>,
    std: Array1<F>,
    #[cfg_attr(feature = "serializable", serde(skip))]
    last: Option<Array1<F>>,
}

impl<F: Float> NormalPrior<F> {
    /// Constructor given the mean and standard deviation of each covered parameter
    pub fn new(mean: Array1<F>, std: Array1<F>) -> Result<Self> {
        if mean.len() != std.len() {
            return Err(GpError::ShapeMismatchError(format!(
                "prior mean of length {} and std of length {}",
                mean.len(),
                std.len()
            )));
        }
        if std.iter().any(|s| *s <= F::zero() || !s.is_finite()) {
            return Err(GpError::InvalidValueError(
                "prior standard deviations should be finite and positive".to_string(),
            ));
        }
        Ok(NormalPrior {
            mean,
            std,
            last: None,
        })
    }

    fn leading<'a>(&self, params: &'a [F]) -> Result<ArrayView1<'a, F>> {
        if params.len() < self.mean.len() {
            return Err(GpError::ShapeMismatchError(format!(
                "prior covers {} parameters, got {}",
                self.mean.len(),
                params.len()
            )));
        }
        Ok(ArrayView1::from(&params[..self.mean.len()]))
    }
}

impl<F: Float> ElementalModel<F> for NormalPrior<F> {
    fn observe(&mut self, params: &[F]) -> Result<F> {
        let x = self.leading(params)?;
        let half = F::cast(0.5);
        let log_norm = half * F::cast(2. * std::f64::consts::PI).ln();
        let logp = ndarray::Zip::from(&x)
            .and(&self.mean)
            .and(&self.std)
            .fold(F::zero(), |acc, x, m, s| {
                let z = (*x - *m) / *s;
                acc - half * z * z - s.ln() - log_norm
            });
        self.last = Some(x.to_owned());
        Ok(logp)
    }

    fn gradient(&mut self) -> Result<Array1<F>> {
        let x = self.last.take().ok_or_else(|| {
            GpError::InvalidStateError("prior gradient requested before observe".to_string())
        })?;
        Ok(ndarray::Zip::from(&x)
            .and(&self.mean)
            .and(&self.std)
            .map_collect(|x, m, s| -(*x - *m) / (*s * *s)))
    }

    fn drop_gradient(&mut self) {
        self.last = None;
    }
}
