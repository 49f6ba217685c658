use crate::assembly::{Assembler, GradientRequest, ThetaScale};
use crate::errors::{GpError, Result};
use crate::kernels::Kernel;
use crate::layout::{Hyperparameters, SlotLayout, ThetaLayout};
use crate::linalg::CholeskyFactor;
use crate::model::ElementalModel;
use crate::parameters::{GpParams, GpValidParams};
use crate::pool::ScratchPool;

use linfa::prelude::{DatasetBase, Fit, Float, PredictInplace};
use ndarray::{s, Array1, Array2, Array3, ArrayBase, ArrayView2, Axis, Data, Ix1, Ix2};

use log::{debug, warn};
use rayon::prelude::*;
use std::fmt;
use std::time::Instant;

/// State computed by a successful fit and used later on in prediction computations
#[derive(Clone, Debug)]
struct FitState<F: Float> {
    /// Cholesky decomposition of the covariance matrix K
    chol: CholeskyFactor<F>,
    /// Gaussian process weights: K^-1.y
    alpha: Array1<F>,
    /// Log marginal likelihood of the training data
    lml: F,
}

/// Gradient tensor of the last observe waiting to be consumed
#[derive(Debug)]
struct PendingGradient<F: Float> {
    dk: Array3<F>,
    slots: SlotLayout,
}

/// A GP regression models outputs as a zero mean Gaussian process
/// governed by a covariance kernel:
///
/// `k(x, x') = simil(theta_simil, x, x') + delta(x, x') noise(theta_noise, x)`
///
/// where:
/// * `simil` is the similarity kernel between two locations,
/// * `noise` is the noise kernel adding variance at a single location.
///
/// Fitting (aka absorbing) training data `(X, Y)` factorizes the covariance matrix
/// `K` of `X` and solves `K.alpha = Y`. Predicting (aka producing) at query points
/// `Z` gives the posterior mean and standard deviation.
///
/// The GP is also an [`ElementalModel`]: observing a flat vector
/// `[log(theta_simil)..., log(theta_noise)..., (X..., Y...)]` returns the
/// log marginal likelihood
///
/// `lml = -n/2 log(2 pi) - 1/2 log|K| - 1/2 Y^t.alpha`
///
/// and the following gradient call its derivatives wrt every component of
/// the observed vector computed with
///
/// `dlml/dtheta = 1/2 trace((alpha.alpha^t - K^-1).dK/dtheta)`
///
/// # Implementation
///
/// * Based on [ndarray](https://github.com/rust-ndarray/ndarray)
///   and [linfa](https://github.com/rust-ml/linfa)
/// * Kernels report their own partial derivatives through a [`Tape`](crate::Tape)
/// * Covariance matrix rows, and gradient terms, are computed by rayon workers
///   when parallel execution is enabled and both kernels are reentrant
///
/// # Example
///
/// ```no_run
/// use adgp::{kernels::SquaredExponential, noise_models::ConstantNoise, GaussianProcess};
/// use linfa::prelude::*;
/// use ndarray::{array, Array, Axis};
///
/// let xt = array![[0.0], [1.0], [2.5], [4.0]];
/// let yt = array![0.0, 0.8, 0.6, -0.7];
///
/// let gp = GaussianProcess::<f64, _, _>::params(SquaredExponential, ConstantNoise(0.01))
///     .theta_simil(array![1.0])
///     .fit(&Dataset::new(xt, yt))
///     .expect("GP fitted");
///
/// let xtest = Array::linspace(0., 4., 20).insert_axis(Axis(1));
/// let (mean, std) = gp.produce(&xtest).expect("GP prediction");
/// ```
pub struct GaussianProcess<F: Float, S: Kernel<F>, N: Kernel<F>> {
    params: GpValidParams<F, S, N>,
    theta: Hyperparameters<F>,
    /// Effective parallel execution
    parallel: bool,
    x: Array2<F>,
    y: Array1<F>,
    fit: Option<FitState<F>>,
    pending: Option<PendingGradient<F>>,
    scratch: ScratchPool<F, Ix2>,
}

impl<F: Float, S: Kernel<F>, N: Kernel<F>> fmt::Display for GaussianProcess<F, S, N> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "GP(simil={}, noise={}, theta_simil={}, theta_noise={}, likelihood={})",
            self.params.simil,
            self.params.noise,
            self.theta.simil,
            self.theta.noise,
            self.log_marginal_likelihood(),
        )
    }
}

impl<F: Float, S: Kernel<F>, N: Kernel<F>> GaussianProcess<F, S, N> {
    /// Gp parameters contructor
    pub fn params(simil: S, noise: N) -> GpParams<F, S, N> {
        GpParams::new(simil, noise)
    }

    /// A GP without training data from validated parameters
    pub fn new(params: GpValidParams<F, S, N>) -> Self {
        let parallel = params.parallel && params.simil.reentrant() && params.noise.reentrant();
        if params.parallel && !parallel {
            warn!(
                "Kernels {} and {} are not both reentrant, falling back to sequential execution",
                params.simil, params.noise
            );
        }
        let theta = Hyperparameters {
            simil: params.theta_simil(),
            noise: params.theta_noise(),
        };
        let ndim = params.ndim;
        GaussianProcess {
            params,
            theta,
            parallel,
            x: Array2::zeros((0, ndim)),
            y: Array1::zeros(0),
            fit: None,
            pending: None,
            scratch: ScratchPool::new(),
        }
    }

    /// Current similarity kernel hyperparameters in linear space
    pub fn theta_simil(&self) -> &Array1<F> {
        &self.theta.simil
    }

    /// Current noise kernel hyperparameters in linear space
    pub fn theta_noise(&self) -> &Array1<F> {
        &self.theta.noise
    }

    /// Training inputs and outputs
    pub fn training_data(&self) -> (&Array2<F>, &Array1<F>) {
        (&self.x, &self.y)
    }

    /// Whether covariance computations actually run in parallel
    pub fn is_parallel(&self) -> bool {
        self.parallel
    }

    /// Log marginal likelihood of the current fit, 0 without training data
    pub fn log_marginal_likelihood(&self) -> F {
        self.fit.as_ref().map_or(F::zero(), |fit| fit.lml)
    }

    /// Flat vector `[log(theta_simil)..., log(theta_noise)...]` of the current
    /// hyperparameters, followed by the training inputs and outputs when `with_data`.
    /// Observing it reproduces the current fit.
    pub fn log_params(&self, with_data: bool) -> Array1<F> {
        let log_theta = Hyperparameters {
            simil: self.theta.simil.mapv(|v| v.ln()),
            noise: self.theta.noise.mapv(|v| v.ln()),
        };
        let data = with_data.then(|| (&self.x, self.y.view()));
        Array1::from(self.layout().encode(&log_theta, data))
    }

    pub(crate) fn layout(&self) -> ThetaLayout {
        ThetaLayout {
            n_simil: self.params.simil.ntheta(),
            n_noise: self.params.noise.ntheta(),
            ndim: self.params.ndim,
        }
    }

    fn assembler<'a>(&'a self, theta: &'a Hyperparameters<F>) -> Assembler<'a, F, S, N> {
        Assembler {
            simil: &self.params.simil,
            noise: &self.params.noise,
            theta,
            nugget: self.params.nugget,
            parallel: self.parallel,
        }
    }

    fn check_inputs(&self, x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<()> {
        if x.ncols() != self.params.ndim {
            return Err(GpError::ShapeMismatchError(format!(
                "expected locations of dimension {}, got {}",
                self.params.ndim,
                x.ncols()
            )));
        }
        Ok(())
    }

    fn check_data(
        &self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        y: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> Result<()> {
        self.check_inputs(x)?;
        if x.nrows() != y.len() {
            return Err(GpError::ShapeMismatchError(format!(
                "{} training locations for {} outputs",
                x.nrows(),
                y.len()
            )));
        }
        Ok(())
    }

    /// Fit training data with given hyperparameters, nothing is stored.
    /// Returns `None` fit state without training data.
    #[allow(clippy::type_complexity)]
    fn compute_fit(
        &self,
        theta: &Hyperparameters<F>,
        x: ArrayView2<F>,
        y: &Array1<F>,
        request: Option<GradientRequest>,
    ) -> Result<(Option<FitState<F>>, Option<PendingGradient<F>>)> {
        if x.nrows() == 0 {
            let pending = request.map(|request| {
                let slots = SlotLayout {
                    theta: self.layout(),
                    n_points: 0,
                    inputs: request.inputs,
                };
                PendingGradient {
                    dk: Array3::zeros((0, 0, slots.len())),
                    slots,
                }
            });
            return Ok((None, pending));
        }

        let assembler = self.assembler(theta);
        let (k, pending) = match request {
            Some(request) => {
                let (k, dk, slots) = assembler.covariance_with_gradient(&x, request);
                (k, Some(PendingGradient { dk, slots }))
            }
            None => (assembler.covariance(&x), None),
        };

        let now = Instant::now();
        let chol = CholeskyFactor::factorize(&k)?;
        let alpha = chol.solve_vec(y)?;
        let half = F::cast(0.5);
        let n = F::cast(y.len());
        let lml = -half * n * F::cast(2. * std::f64::consts::PI).ln()
            - half * chol.log_det()
            - half * y.dot(&alpha);
        debug!(
            "Factorized {}x{} covariance in {:?}, lml = {}",
            k.nrows(),
            k.ncols(),
            now.elapsed(),
            lml
        );
        Ok((Some(FitState { chol, alpha, lml }), pending))
    }

    /// Fit the GP to training inputs `x` (n, ndim) and outputs `y` (n,)
    /// with the current hyperparameters.
    ///
    /// On failure, previously absorbed data and fit are left untouched.
    /// Empty training data is valid and clears the fit.
    pub fn absorb(
        &mut self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        y: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> Result<()> {
        self.check_data(x, y)?;
        let x = x.to_owned();
        let y = y.to_owned();
        let (fit, _) = self.compute_fit(&self.theta, x.view(), &y, None)?;
        self.x = x;
        self.y = y;
        self.fit = fit;
        self.pending = None;
        Ok(())
    }

    /// Set training data without fitting, for use by a hyperparameters only
    /// [`ElementalModel::observe`]. Predictions fail until the next fit.
    pub fn set_training_data(
        &mut self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        y: &ArrayBase<impl Data<Elem = F>, Ix1>,
    ) -> Result<()> {
        self.check_data(x, y)?;
        self.x = x.to_owned();
        self.y = y.to_owned();
        self.fit = None;
        self.pending = None;
        Ok(())
    }

    fn fit_state(&self) -> Result<Option<&FitState<F>>> {
        match &self.fit {
            None if self.x.nrows() > 0 => Err(GpError::InvalidStateError(
                "training data set but not fitted".to_string(),
            )),
            fit => Ok(fit.as_ref()),
        }
    }

    /// Posterior mean and variance at query points
    fn posterior(&self, z: &ArrayView2<F>) -> Result<(Array1<F>, Array1<F>)> {
        let assembler = self.assembler(&self.theta);
        let prior = assembler.prior_variance(z);
        match self.fit_state()? {
            None => Ok((Array1::zeros(z.nrows()), prior)),
            Some(fit) => {
                let kstar = assembler.cross_covariance(&self.x.view(), z);
                let mean = kstar.t().dot(&fit.alpha);
                let inv_kstar = fit.chol.solve(&kstar)?;
                let explained = (&kstar * &inv_kstar).sum_axis(Axis(0));
                Ok((mean, prior - explained))
            }
        }
    }

    /// Predict posterior mean and standard deviation at `z` query points (m, ndim).
    ///
    /// Standard deviations are clamped at zero when rounding makes the
    /// posterior variance slightly negative.
    pub fn produce(
        &self,
        z: &ArrayBase<impl Data<Elem = F>, Ix2>,
    ) -> Result<(Array1<F>, Array1<F>)> {
        self.check_inputs(z)?;
        let (mean, var) = self.posterior(&z.view())?;
        Ok((mean, var.mapv(|v| v.max(F::zero()).sqrt())))
    }

    /// Predict posterior mean at `z` query points (m, ndim)
    pub fn predict(&self, z: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<Array1<F>> {
        self.check_inputs(z)?;
        Ok(self.posterior(&z.view())?.0)
    }

    /// Predict posterior variance at `z` query points (m, ndim), clamped at zero
    pub fn predict_var(&self, z: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<Array1<F>> {
        self.check_inputs(z)?;
        let (_, var) = self.posterior(&z.view())?;
        Ok(var.mapv(|v| v.max(F::zero())))
    }

    /// Predict posterior covariance matrix `K** - K*^t.K^-1.K*` between `z` query points
    pub fn predict_cov(&self, z: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<Array2<F>> {
        self.check_inputs(z)?;
        let z = z.view();
        let assembler = self.assembler(&self.theta);
        let kzz = assembler.query_covariance(&z);
        match self.fit_state()? {
            None => Ok(kzz),
            Some(fit) => {
                let kstar = assembler.cross_covariance(&self.x.view(), &z);
                let inv_kstar = fit.chol.solve(&kstar)?;
                Ok(kzz - kstar.t().dot(&inv_kstar))
            }
        }
    }

    /// Covariance matrix of the training inputs with current hyperparameters
    pub fn covariance(&self) -> Array2<F> {
        self.assembler(&self.theta).covariance(&self.x.view())
    }

    /// Same as [`ElementalModel::observe`] except that hyperparameters are given
    /// in linear space: the following gradient is wrt linear space hyperparameters.
    pub fn observe_linear(&mut self, params: &[F]) -> Result<F> {
        self.observe_scaled(params, ThetaScale::Linear)
    }

    fn observe_scaled(&mut self, params: &[F], scale: ThetaScale) -> Result<F> {
        let to_linear: fn(F) -> F = match scale {
            ThetaScale::Log => |v: F| v.exp(),
            ThetaScale::Linear => |v: F| v,
        };
        self.pending = None;
        let decoded = self.layout().decode(params, to_linear)?;
        let request = GradientRequest {
            scale,
            inputs: decoded.data.is_some(),
        };
        let (fit, pending) = match &decoded.data {
            Some((x, y)) => self.compute_fit(&decoded.theta, x.view(), y, Some(request))?,
            None => self.compute_fit(&decoded.theta, self.x.view(), &self.y, Some(request))?,
        };
        if let Some((x, y)) = decoded.data {
            self.x = x;
            self.y = y;
        }
        self.theta = decoded.theta;
        self.fit = fit;
        self.pending = pending;
        Ok(self.log_marginal_likelihood())
    }

    /// `1/2 (alpha^t.dK.alpha - trace(K^-1.dK))` for slot `s` of the gradient tensor
    fn slot_gradient(&self, fit: &FitState<F>, dk: &Array3<F>, s: usize) -> Result<F> {
        let dks = dk.index_axis(Axis(2), s);
        let quad = fit.alpha.dot(&dks.dot(&fit.alpha));
        let mut inv_dk = self.scratch.checkout(dks.raw_dim());
        inv_dk.assign(&dks);
        let solved = fit.chol.solve_inplace(&mut inv_dk);
        let trace = inv_dk.diag().sum();
        self.scratch.give_back(inv_dk);
        solved?;
        Ok(F::cast(0.5) * (quad - trace))
    }
}

impl<F: Float, S: Kernel<F>, N: Kernel<F>> ElementalModel<F> for GaussianProcess<F, S, N> {
    /// Observe `[log(theta_simil)..., log(theta_noise)...]` using current training data,
    /// or `[log(theta_simil)..., log(theta_noise)..., x_0..., ..., x_n-1..., y_0, ..., y_n-1]`
    /// which replaces training data. Returns the log marginal likelihood.
    ///
    /// The caller's buffer is left unchanged.
    fn observe(&mut self, params: &[F]) -> Result<F> {
        self.observe_scaled(params, ThetaScale::Log)
    }

    /// Gradient of the log marginal likelihood wrt the last observed vector.
    /// The gradient tensor is released afterwards.
    fn gradient(&mut self) -> Result<Array1<F>> {
        let PendingGradient { dk, slots } = self.pending.take().ok_or_else(|| {
            GpError::InvalidStateError("gradient requested without a preceding observe".to_string())
        })?;
        let now = Instant::now();
        let (n, _, _) = dk.dim();
        self.scratch.retain_shape(&Ix2(n, n));
        let nslots = slots.len();
        let n_outputs = if slots.inputs { slots.n_points } else { 0 };
        let mut grad = Array1::zeros(nslots + n_outputs);
        if let Some(fit) = &self.fit {
            let values = if self.parallel {
                (0..nslots)
                    .into_par_iter()
                    .map(|s| self.slot_gradient(fit, &dk, s))
                    .collect::<Result<Vec<F>>>()?
            } else {
                (0..nslots)
                    .map(|s| self.slot_gradient(fit, &dk, s))
                    .collect::<Result<Vec<F>>>()?
            };
            grad.slice_mut(s![..nslots]).assign(&Array1::from(values));
            if slots.inputs {
                grad.slice_mut(s![nslots..])
                    .assign(&fit.alpha.mapv(|a| -a));
            }
        }
        debug!(
            "Gradient over {} slots computed in {:?}",
            nslots,
            now.elapsed()
        );
        Ok(grad)
    }

    fn drop_gradient(&mut self) {
        self.pending = None;
        self.scratch.clear();
    }
}

impl<F, D, S, N> PredictInplace<ArrayBase<D, Ix2>, Array1<F>> for GaussianProcess<F, S, N>
where
    F: Float,
    D: Data<Elem = F>,
    S: Kernel<F>,
    N: Kernel<F>,
{
    fn predict_inplace(&self, x: &ArrayBase<D, Ix2>, y: &mut Array1<F>) {
        assert_eq!(
            x.nrows(),
            y.len(),
            "The number of data points must match the number of output targets."
        );

        match self.predict(x) {
            Ok(values) => *y = values,
            Err(err) => {
                warn!("GP prediction failed: {err}");
                y.fill(F::nan());
            }
        }
    }

    fn default_target(&self, x: &ArrayBase<D, Ix2>) -> Array1<F> {
        Array1::zeros((x.nrows(),))
    }
}

impl<F, S, N, D> Fit<ArrayBase<D, Ix2>, ArrayBase<D, Ix1>, GpError> for GpValidParams<F, S, N>
where
    F: Float,
    S: Kernel<F> + Clone,
    N: Kernel<F> + Clone,
    D: Data<Elem = F>,
{
    type Object = GaussianProcess<F, S, N>;

    /// Fit GP with given hyperparameters
    fn fit(
        &self,
        dataset: &DatasetBase<ArrayBase<D, Ix2>, ArrayBase<D, Ix1>>,
    ) -> Result<Self::Object> {
        let mut gp = GaussianProcess::new(self.clone());
        gp.absorb(dataset.records(), dataset.targets())?;
        Ok(gp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::{FiniteDiffKernel, Linear, Matern52, Scaled, SquaredExponential};
    use crate::noise_models::{ConstantNoise, UniformNoise};
    use approx::{assert_abs_diff_eq, assert_relative_eq};
    use finitediff::FiniteDiff;
    use linfa::prelude::{Dataset, Predict};
    use linfa::ParamGuard;
    use ndarray::{array, Array, Zip};
    use ndarray_rand::rand::SeedableRng;
    use ndarray_rand::rand_distr::{Normal, Uniform};
    use ndarray_rand::RandomExt;
    use paste::paste;
    use rand_xoshiro::Xoshiro256Plus;
    use std::cell::RefCell;
    use std::sync::Arc;

    /// Standard deviation of each row of `x` samples
    fn sample_std(x: &Array2<f64>) -> Array1<f64> {
        let n = x.ncols() as f64;
        let mean = x.sum_axis(Axis(1)) / n;
        let mut var = Array1::zeros(x.nrows());
        Zip::from(&mut var)
            .and(x.rows())
            .and(&mean)
            .for_each(|v, row, m| *v = row.mapv(|r| (r - *m) * (r - *m)).sum() / n);
        var.mapv(f64::sqrt)
    }

    fn gp_se(noise: f64, parallel: bool) -> GaussianProcess<f64, SquaredExponential, ConstantNoise> {
        GaussianProcess::new(
            GaussianProcess::params(SquaredExponential, ConstantNoise(noise))
                .theta_simil(array![1.])
                .parallel(parallel)
                .check()
                .unwrap(),
        )
    }

    macro_rules! test_produce {
        ($name:ident, $noise:expr, $x:expr, $y:expr, $z:expr, $mu:expr, $sigma:expr) => {
            paste! {
                #[test]
                fn [<test_produce_ $name>]() {
                    for parallel in [false, true] {
                        let mut gp = gp_se($noise, parallel);
                        let x: Array2<f64> = $x;
                        gp.absorb(&x, &$y).expect("absorb");
                        let (mu, sigma) = gp.produce(&$z).expect("produce");
                        assert_abs_diff_eq!(mu, $mu, epsilon = 1e-6);
                        assert_abs_diff_eq!(sigma, $sigma, epsilon = 1e-6);
                    }
                }
            }
        };
    }

    test_produce!(
        prior,
        0.,
        Array2::zeros((0, 1)),
        Array1::<f64>::zeros(0),
        array![[0.]],
        array![0.],
        array![1.]
    );
    test_produce!(
        self_point,
        0.,
        array![[0.]],
        array![1.],
        array![[0.]],
        array![1.],
        array![0.]
    );
    test_produce!(
        next,
        0.,
        array![[0.]],
        array![0.],
        array![[1.]],
        array![0.],
        array![0.795060]
    );
    test_produce!(
        two_selves,
        0.,
        array![[0.], [1.]],
        array![1., -1.],
        array![[0.], [1.]],
        array![1., -1.],
        array![0., 0.]
    );
    test_produce!(
        inter,
        0.,
        array![[0.], [1.]],
        array![1., -1.],
        array![[0.5]],
        array![0.],
        array![0.174518]
    );
    test_produce!(
        extra,
        0.,
        array![[0.], [1.]],
        array![1., -1.],
        array![[-2.], [3.]],
        array![0.315720, -0.315720],
        array![0.986770, 0.986770]
    );
    test_produce!(
        noise,
        0.1,
        array![[0.], [1.]],
        array![1., -1.],
        array![[-2.], [3.]],
        array![0.307895, -0.307895],
        array![0.987037, 0.987037]
    );

    fn check_gradient<M: ElementalModel<f64>>(model: M, params: &[f64]) {
        let model = RefCell::new(model);
        model.borrow_mut().observe(params).expect("observe");
        let grad = model.borrow_mut().gradient().expect("gradient");
        assert_eq!(grad.len(), params.len());
        let fdiff = params
            .to_vec()
            .central_diff(&|p: &Vec<f64>| model.borrow_mut().observe(p).expect("observe"));
        for (i, (g, fd)) in grad.iter().zip(fdiff.iter()).enumerate() {
            println!("dlml/dp{i}: analytic = {g}, fdiff = {fd}");
            assert_relative_eq!(*g, *fd, max_relative = 1e-4, epsilon = 1e-6);
        }
    }

    macro_rules! test_lml {
        ($name:ident, $noise:expr, $params:expr, $lml:expr) => {
            paste! {
                #[test]
                fn [<test_lml_ $name>]() {
                    for parallel in [false, true] {
                        let mut gp = GaussianProcess::<f64, _, _>::new(
                            GaussianProcess::params(SquaredExponential, $noise)
                                .parallel(parallel)
                                .check()
                                .unwrap(),
                        );
                        let params: Vec<f64> = $params.to_vec();
                        let lml = gp.observe(&params).expect("observe");
                        assert_abs_diff_eq!(lml, $lml, epsilon = 1e-6);
                        assert_abs_diff_eq!(gp.log_marginal_likelihood(), $lml, epsilon = 1e-6);
                        let grad = gp.gradient().expect("gradient");
                        assert_eq!(grad.len(), params.len());
                        check_gradient(gp, &params);
                    }
                }
            }
        };
    }

    test_lml!(one_point, ConstantNoise(0.), [0., 0., 1.], -1.418939);
    test_lml!(two_points, ConstantNoise(0.), [0., 0., 1., 1., 0.], -2.399528);
    test_lml!(constant_noise, ConstantNoise(0.1), [1., -2., -1., 1., 0.], -4.321055);
    test_lml!(uniform_noise, UniformNoise, [1., 1., -1., -1., 1., 0.], -4.018110);

    #[test]
    fn test_lml_empty() {
        let mut gp = gp_se(0., false);
        assert_abs_diff_eq!(gp.observe(&[0.5]).unwrap(), 0.);
        assert_eq!(gp.gradient().unwrap(), array![0.]);
        assert_abs_diff_eq!(gp.observe(&[0.5]).unwrap(), 0.);
        assert_eq!(gp.produce(&array![[1.]]).unwrap().1, array![1.]);
    }

    #[test]
    fn test_observe_hyperparameters_only() {
        let mut rng = Xoshiro256Plus::seed_from_u64(42);
        let x = Array::random_using((10, 2), Uniform::new(-2., 2.), &mut rng);
        let y = Array::random_using(10, Normal::new(0., 1.).unwrap(), &mut rng);
        for parallel in [false, true] {
            let mut gp = GaussianProcess::<f64, _, _>::new(
                GaussianProcess::params(Scaled(Matern52), UniformNoise)
                    .ndim(2)
                    .parallel(parallel)
                    .check()
                    .unwrap(),
            );
            gp.set_training_data(&x, &y).unwrap();
            assert!(matches!(
                gp.produce(&array![[0., 0.]]),
                Err(GpError::InvalidStateError(_))
            ));
            let params = [0.2, -0.3, -1.];
            gp.observe(&params).unwrap();
            assert_abs_diff_eq!(
                gp.theta_simil(),
                &array![0.2f64.exp(), (-0.3f64).exp()],
                epsilon = 1e-12
            );
            assert!(gp.produce(&array![[0., 0.]]).is_ok());
            check_gradient(gp, &params);
        }
    }

    #[test]
    fn test_observe_keeps_params_unchanged() {
        let mut gp = gp_se(0.1, false);
        let params = vec![0.3, 0., 1., 1., -1.];
        let copy = params.clone();
        gp.observe(&params).unwrap();
        assert_eq!(params, copy);
        assert_eq!(gp.training_data().0, &array![[0.], [1.]]);
        assert_eq!(gp.training_data().1, &array![1., -1.]);
    }

    #[test]
    fn test_gradient_inputs_multi_dim() {
        let mut rng = Xoshiro256Plus::seed_from_u64(0);
        let x = Array::random_using((6, 2), Uniform::new(-1f64, 1.), &mut rng);
        let y = x.map_axis(Axis(1), |row| row[0].sin() + row[1]);
        let gp = GaussianProcess::<f64, _, _>::new(
            GaussianProcess::params(Scaled(SquaredExponential), UniformNoise)
                .ndim(2)
                .parallel(true)
                .check()
                .unwrap(),
        );
        let mut params = vec![0.1, -0.2, -1.5];
        params.extend(x.iter());
        params.extend(y.iter());
        check_gradient(gp, &params);
    }

    #[test]
    fn test_gradient_non_stationary_kernel() {
        let gp = GaussianProcess::<f64, _, _>::new(
            GaussianProcess::params(Linear, UniformNoise)
                .check()
                .unwrap(),
        );
        check_gradient(gp, &[0.2, -0.5, 0.3, -0.8, 1.4, 0.5, -0.2, 1.1]);
    }

    #[test]
    fn test_gradient_finite_diff_kernel() {
        let kernel = FiniteDiffKernel::new(1, |x: &[f64]| {
            let d = (x[1] - x[2]) / x[0];
            (-d * d / 2.).exp()
        })
        .non_reentrant();
        let mut gp = GaussianProcess::<f64, _, _>::new(
            GaussianProcess::params(kernel, ConstantNoise(0.1))
                .parallel(true)
                .check()
                .unwrap(),
        );
        assert!(!gp.is_parallel());
        let lml = gp.observe(&[1., -2., -1., 1., 0.]).unwrap();
        assert_abs_diff_eq!(lml, -4.321055, epsilon = 1e-6);
        let grad = gp.gradient().unwrap();

        let mut exact = gp_se(0.1, false);
        exact.observe(&[1., -2., -1., 1., 0.]).unwrap();
        assert_abs_diff_eq!(grad, exact.gradient().unwrap(), epsilon = 1e-5);
    }

    #[test]
    fn test_gradient_requires_observe() {
        let mut gp = gp_se(0., false);
        assert!(matches!(
            gp.gradient(),
            Err(GpError::InvalidStateError(_))
        ));
        gp.observe(&[0., 0., 1., 1., 0.]).unwrap();
        assert!(gp.gradient().is_ok());
        // gradient tensor is released once consumed
        assert!(gp.gradient().is_err());
        gp.observe(&[0., 0., 1., 1., 0.]).unwrap();
        gp.drop_gradient();
        assert!(gp.gradient().is_err());
    }

    #[test]
    fn test_observe_linear() {
        let mut gp = gp_se(0., false);
        let theta = 1.7f64;
        let lml = gp.observe_linear(&[theta, 0., 1., 1., 0.]).unwrap();
        let glin = gp.gradient().unwrap();
        let lml_log = gp.observe(&[theta.ln(), 0., 1., 1., 0.]).unwrap();
        let glog = gp.gradient().unwrap();
        assert_abs_diff_eq!(lml, lml_log, epsilon = 1e-12);
        assert_abs_diff_eq!(glin[0] * theta, glog[0], epsilon = 1e-10);
        assert_abs_diff_eq!(glin.slice(s![1..]), glog.slice(s![1..]), epsilon = 1e-10);
        assert_abs_diff_eq!(gp.theta_simil(), &array![theta], epsilon = 1e-12);
    }

    #[test]
    fn test_shape_mismatch() {
        let mut gp = gp_se(0., false);
        assert!(matches!(
            gp.observe(&[]),
            Err(GpError::ShapeMismatchError(_))
        ));
        assert!(matches!(
            gp.observe(&[0., 1., 2., 3.]),
            Err(GpError::ShapeMismatchError(_))
        ));
        assert!(matches!(
            gp.absorb(&array![[0., 1.]], &array![1.]),
            Err(GpError::ShapeMismatchError(_))
        ));
        assert!(matches!(
            gp.absorb(&array![[0.], [1.]], &array![1.]),
            Err(GpError::ShapeMismatchError(_))
        ));
        assert!(matches!(
            gp.produce(&array![[0., 1.]]),
            Err(GpError::ShapeMismatchError(_))
        ));
    }

    #[test]
    fn test_factorization_error_keeps_state() {
        // indefinite as soon as two distinct locations are given
        let kernel = FiniteDiffKernel::new(0, |x: &[f64]| if x[0] == x[1] { 1. } else { 2. });
        let mut gp = GaussianProcess::<f64, _, _>::new(
            GaussianProcess::params(kernel, ConstantNoise(0.))
                .nugget(0.)
                .check()
                .unwrap(),
        );
        gp.absorb(&array![[0.]], &array![1.]).unwrap();
        let before = gp.produce(&array![[0.5]]).unwrap();
        let res = gp.absorb(&array![[0.], [1.]], &array![1., 2.]);
        assert!(matches!(res, Err(GpError::FactorizationError(_))));
        assert_eq!(gp.training_data().1, &array![1.]);
        assert_eq!(gp.produce(&array![[0.5]]).unwrap(), before);

        let res = gp.observe(&[0., 1., 1., 2.]);
        assert!(matches!(res, Err(GpError::FactorizationError(_))));
        assert!(gp.gradient().is_err());
        assert_eq!(gp.produce(&array![[0.5]]).unwrap(), before);
    }

    #[test]
    fn test_failed_observe_drops_gradient() {
        let kernel = FiniteDiffKernel::new(0, |x: &[f64]| if x[0] == x[1] { 1. } else { 2. });
        let mut gp = GaussianProcess::<f64, _, _>::new(
            GaussianProcess::params(kernel, ConstantNoise(0.))
                .nugget(0.)
                .check()
                .unwrap(),
        );
        gp.observe(&[0., 1.]).unwrap();
        assert!(gp.observe(&[0., 1., 1., 2.]).is_err());
        assert!(matches!(gp.gradient(), Err(GpError::InvalidStateError(_))));

        gp.observe(&[0., 1.]).unwrap();
        assert!(gp.observe(&[0., 1., 2.]).is_err());
        assert!(matches!(gp.gradient(), Err(GpError::InvalidStateError(_))));
    }

    #[test]
    fn test_log_params() {
        let mut gp = gp_se(0.1, false);
        let params = array![0.3, 0., 2., 1., -1.];
        let lml = gp.observe(params.as_slice().unwrap()).unwrap();
        gp.drop_gradient();
        assert_abs_diff_eq!(gp.log_params(true), params, epsilon = 1e-12);
        assert_abs_diff_eq!(gp.log_params(false), array![0.3], epsilon = 1e-12);
        let flat = gp.log_params(true);
        let replayed = gp.observe(flat.as_slice().unwrap()).unwrap();
        assert_abs_diff_eq!(replayed, lml, epsilon = 1e-12);
    }

    #[test]
    fn test_variance_clamped_at_zero() {
        // zero noise posterior variance vanishes up to rounding at training points
        let mut gp = gp_se(0., false);
        let x = Array::linspace(0f64, 2., 5).insert_axis(Axis(1));
        let y = x.column(0).mapv(|v| v.cos());
        gp.absorb(&x, &y).unwrap();
        let z = Array::linspace(0f64, 2., 9).insert_axis(Axis(1));
        let (_, std) = gp.produce(&z).unwrap();
        let var = gp.predict_var(&z).unwrap();
        let cov = gp.predict_cov(&z).unwrap();
        assert!(std.iter().all(|s| s.is_finite() && *s >= 0. && *s <= 1.));
        for i in (0..9).step_by(2) {
            assert_abs_diff_eq!(std[i], 0., epsilon = 1e-6);
        }
        assert!(var.iter().all(|v| *v >= 0.));
        assert_abs_diff_eq!(var, cov.diag().mapv(|v| v.max(0.)), epsilon = 1e-15);
        assert_abs_diff_eq!(std, var.mapv(f64::sqrt), epsilon = 1e-15);
    }

    #[test]
    fn test_positive_definite_with_jitter() {
        let mut rng = Xoshiro256Plus::seed_from_u64(42);
        let x = Array::random_using((40, 3), Uniform::new(0., 1.), &mut rng);
        let y = Array::random_using(40, Uniform::new(0., 1.), &mut rng);
        let mut gp = GaussianProcess::<f64, _, _>::new(
            GaussianProcess::params(Scaled(SquaredExponential), ConstantNoise(1e-3))
                .ndim(3)
                .theta_simil(array![1., 2.])
                .parallel(true)
                .check()
                .unwrap(),
        );
        gp.absorb(&x, &y).expect("factorizable covariance");
        let k = gp.covariance();
        assert_abs_diff_eq!(k, k.t(), epsilon = 0.);
        let (mu, sigma) = gp.produce(&x).unwrap();
        assert!(mu.iter().all(|m| m.is_finite()));
        assert!(sigma.iter().all(|s| s.is_finite() && *s <= 1.));
    }

    #[test]
    fn test_produce_is_idempotent() {
        let mut gp = gp_se(0.1, true);
        gp.absorb(&array![[0.], [1.], [2.]], &array![1., -1., 0.5])
            .unwrap();
        let z = Array::linspace(-1., 3., 11).insert_axis(Axis(1));
        let first = gp.produce(&z).unwrap();
        let second = gp.produce(&z).unwrap();
        assert_eq!(first, second);
        assert_eq!(gp.predict(&z).unwrap(), first.0);
        assert_abs_diff_eq!(
            gp.predict_var(&z).unwrap().mapv(f64::sqrt),
            first.1,
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_predict_cov() {
        let mut gp = gp_se(0.1, false);
        let z = array![[-0.5], [0.5], [2.]];
        let prior = gp.predict_cov(&z).unwrap();
        assert_abs_diff_eq!(prior.diag(), array![1., 1., 1.], epsilon = 1e-12);
        gp.absorb(&array![[0.], [1.]], &array![1., -1.]).unwrap();
        let cov = gp.predict_cov(&z).unwrap();
        assert_abs_diff_eq!(cov, cov.t(), epsilon = 1e-12);
        assert_abs_diff_eq!(cov.diag(), gp.predict_var(&z).unwrap(), epsilon = 1e-12);

        // posterior samples have the predicted standard deviation
        let mut rng = Xoshiro256Plus::seed_from_u64(42);
        let jitter = Array2::<f64>::eye(3) * 1e-12;
        let chol = CholeskyFactor::factorize(&(&cov + &jitter)).unwrap();
        let normals = Array::random_using((3, 20000), Normal::new(0., 1.).unwrap(), &mut rng);
        let samples = chol.lower().dot(&normals);
        assert_abs_diff_eq!(
            sample_std(&samples),
            gp.produce(&z).unwrap().1,
            epsilon = 2e-2
        );
    }

    #[test]
    fn test_fit_dataset() {
        let xt = array![[0.0], [1.0], [2.0], [3.0], [4.0]];
        let yt = array![0.0, 1.0, 1.5, 0.9, 1.0];
        let gp = GaussianProcess::<f64, _, _>::params(SquaredExponential, ConstantNoise(0.))
            .theta_simil(array![1.])
            .fit(&Dataset::new(xt.clone(), yt.clone()))
            .expect("GP fit error");
        let yvals = gp.predict(&xt).expect("prediction error");
        assert_abs_diff_eq!(yvals, yt, epsilon = 1e-6);
        let ypred = Predict::<_, Array1<f64>>::predict(&gp, &xt);
        assert_abs_diff_eq!(ypred, yt, epsilon = 1e-6);
        println!("{gp}");
        assert!(format!("{gp}").starts_with("GP(simil=SquaredExponential, noise=ConstantNoise(0)"));
    }

    #[test]
    fn test_shared_kernels() {
        let simil: Arc<dyn Kernel<f64>> = Arc::new(SquaredExponential);
        let noise: Arc<dyn Kernel<f64>> = Arc::new(ConstantNoise(0.1));
        let make = |parallel| {
            GaussianProcess::new(
                GaussianProcess::params(Arc::clone(&simil), Arc::clone(&noise))
                    .theta_simil(array![1.])
                    .parallel(parallel)
                    .check()
                    .unwrap(),
            )
        };
        let (mut gp1, mut gp2) = (make(false), make(true));
        gp1.absorb(&array![[0.], [1.]], &array![1., -1.]).unwrap();
        gp2.absorb(&array![[0.], [1.]], &array![1., -1.]).unwrap();
        let z = array![[-2.], [3.]];
        assert_abs_diff_eq!(
            gp1.produce(&z).unwrap().0,
            gp2.produce(&z).unwrap().0,
            epsilon = 1e-12
        );
        assert_eq!(Arc::strong_count(&simil), 3);
    }
}
