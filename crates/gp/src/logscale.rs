use crate::algorithm::GaussianProcess;
use crate::errors::{GpError, Result};
use crate::kernels::Kernel;
use crate::model::ElementalModel;
use linfa::Float;
use ndarray::{s, Array1, ArrayView1};

/// An elemental model over the log of the hyperparameters of a GP,
/// training data staying fixed.
///
/// Observing `[log(theta_simil)..., log(theta_noise)...]` returns the
/// log marginal likelihood of the wrapped GP; the gradient is wrt the log values.
/// This is the form handed to unconstrained optimizers.
pub struct LogScale<'a, F: Float, S: Kernel<F>, N: Kernel<F>> {
    gp: &'a mut GaussianProcess<F, S, N>,
    /// Linear space hyperparameters of the last observe
    theta: Vec<F>,
}

impl<'a, F: Float, S: Kernel<F>, N: Kernel<F>> LogScale<'a, F, S, N> {
    /// Wrap a GP whose training data is already set
    pub fn new(gp: &'a mut GaussianProcess<F, S, N>) -> Self {
        let n_hyper = gp.layout().n_hyper();
        LogScale {
            gp,
            theta: Vec::with_capacity(n_hyper),
        }
    }

    /// Current log space hyperparameters of the wrapped GP
    pub fn log_theta(&self) -> Array1<F> {
        self.gp.log_params(false)
    }
}

impl<F: Float, S: Kernel<F>, N: Kernel<F>> ElementalModel<F> for LogScale<'_, F, S, N> {
    fn observe(&mut self, log_theta: &[F]) -> Result<F> {
        let n_hyper = self.gp.layout().n_hyper();
        if log_theta.len() != n_hyper {
            self.theta.clear();
            self.gp.drop_gradient();
            return Err(GpError::ShapeMismatchError(format!(
                "expected {} log hyperparameters, got {}",
                n_hyper,
                log_theta.len()
            )));
        }
        let mut theta = std::mem::take(&mut self.theta);
        theta.clear();
        theta.extend(log_theta.iter().map(|v| v.exp()));
        let res = self.gp.observe_linear(&theta);
        if res.is_err() {
            theta.clear();
        }
        self.theta = theta;
        res
    }

    fn gradient(&mut self) -> Result<Array1<F>> {
        let grad = self.gp.gradient()?;
        let theta = ArrayView1::from(&self.theta[..]);
        Ok(&grad.slice(s![..theta.len()]) * &theta)
    }

    fn drop_gradient(&mut self) {
        self.gp.drop_gradient();
    }
}
