//! Covariance matrix assembly and its gradient tensor.
//!
//! The gradient tensor `dK` is stored as an `(n, n, nslots)` array: `dK[[i, j, s]]`
//! is the partial derivative of `K[[i, j]]` wrt the scalar in slot `s`
//! (see [`SlotLayout`]). Each row `i` is computed by a single worker which fills
//! entries `j >= i`, the lower triangle is mirrored afterwards.

use crate::kernels::{Kernel, Tape};
use crate::layout::{Hyperparameters, SlotLayout, ThetaLayout};
use linfa::Float;
use log::debug;
use ndarray::{
    Array1, Array2, Array3, ArrayView1, ArrayView2, ArrayViewMut1, ArrayViewMut2, Zip,
};
use rayon::prelude::*;
use std::time::Instant;

/// How hyperparameter derivatives are reported in the gradient tensor
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ThetaScale {
    /// Derivatives wrt `log(theta)`: kernel derivatives are multiplied by `theta`
    Log,
    /// Derivatives wrt `theta` itself
    Linear,
}

impl ThetaScale {
    fn factor<F: Float>(&self, theta: F) -> F {
        match self {
            ThetaScale::Log => theta,
            ThetaScale::Linear => F::one(),
        }
    }
}

/// Which gradients to compute alongside the covariance matrix
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct GradientRequest {
    pub scale: ThetaScale,
    /// Whether derivatives wrt training inputs coordinates are requested
    pub inputs: bool,
}

/// Kernels and hyperparameters used to assemble covariance matrices
pub(crate) struct Assembler<'a, F: Float, S, N> {
    pub simil: &'a S,
    pub noise: &'a N,
    pub theta: &'a Hyperparameters<F>,
    /// Jitter added to every diagonal entry
    pub nugget: F,
    pub parallel: bool,
}

/// Per worker argument buffers reused across kernel calls
struct RowBuffers<F: Float> {
    simil_args: Vec<F>,
    noise_args: Vec<F>,
    simil_tape: Tape<F>,
    noise_tape: Tape<F>,
}

impl<'a, F, S, N> Assembler<'a, F, S, N>
where
    F: Float,
    S: Kernel<F>,
    N: Kernel<F>,
{
    fn layout(&self, ndim: usize) -> ThetaLayout {
        ThetaLayout {
            n_simil: self.theta.simil.len(),
            n_noise: self.theta.noise.len(),
            ndim,
        }
    }

    fn row_buffers(&self, ndim: usize, recording: bool) -> RowBuffers<F> {
        let tape = || {
            if recording {
                Tape::recording()
            } else {
                Tape::discarding()
            }
        };
        let mut simil_args = vec![F::zero(); self.theta.simil.len() + 2 * ndim];
        copy_row(&mut simil_args, &self.theta.simil.view());
        let mut noise_args = vec![F::zero(); self.theta.noise.len() + ndim];
        copy_row(&mut noise_args, &self.theta.noise.view());
        RowBuffers {
            simil_args,
            noise_args,
            simil_tape: tape(),
            noise_tape: tape(),
        }
    }

    /// Covariance matrix of the training inputs `x`
    pub fn covariance(&self, x: &ArrayView2<F>) -> Array2<F> {
        self.assemble(x, None).0
    }

    /// Covariance matrix of the training inputs `x` and its gradient tensor
    pub fn covariance_with_gradient(
        &self,
        x: &ArrayView2<F>,
        request: GradientRequest,
    ) -> (Array2<F>, Array3<F>, SlotLayout) {
        let slots = SlotLayout {
            theta: self.layout(x.ncols()),
            n_points: x.nrows(),
            inputs: request.inputs,
        };
        let (k, dk) = self.assemble(x, Some((slots, request.scale)));
        (k, dk, slots)
    }

    fn assemble(
        &self,
        x: &ArrayView2<F>,
        gradients: Option<(SlotLayout, ThetaScale)>,
    ) -> (Array2<F>, Array3<F>) {
        let now = Instant::now();
        let (n, ndim) = x.dim();
        let nslots = gradients.map_or(0, |(slots, _)| slots.len());
        let mut k = Array2::<F>::zeros((n, n));
        let mut dk = Array3::<F>::zeros((n, n, nslots));

        let rows = Zip::indexed(k.rows_mut()).and(dk.outer_iter_mut());
        if self.parallel {
            rows.into_par_iter().for_each_init(
                || self.row_buffers(ndim, gradients.is_some()),
                |buffers, (i, k_row, dk_row)| {
                    self.fill_row(x, i, k_row, dk_row, buffers, gradients)
                },
            );
        } else {
            let mut buffers = self.row_buffers(ndim, gradients.is_some());
            rows.for_each(|i, k_row, dk_row| {
                self.fill_row(x, i, k_row, dk_row, &mut buffers, gradients)
            });
        }
        mirror_upper(&mut k, &mut dk);
        debug!(
            "Covariance {}x{} with {} gradient slots assembled in {:?} (parallel={})",
            n,
            n,
            nslots,
            now.elapsed(),
            self.parallel
        );
        (k, dk)
    }

    /// Fill entries `j >= i` of row `i` of K and dK
    fn fill_row(
        &self,
        x: &ArrayView2<F>,
        i: usize,
        mut k_row: ArrayViewMut1<F>,
        mut dk_row: ArrayViewMut2<F>,
        buffers: &mut RowBuffers<F>,
        gradients: Option<(SlotLayout, ThetaScale)>,
    ) {
        let ndim = x.ncols();
        let n_simil = self.theta.simil.len();
        let n_noise = self.theta.noise.len();
        let xi = x.row(i);
        copy_row(&mut buffers.simil_args[n_simil..n_simil + ndim], &xi);

        for j in i..x.nrows() {
            copy_row(&mut buffers.simil_args[n_simil + ndim..], &x.row(j));
            let mut kij = self
                .simil
                .observe(&buffers.simil_args, &mut buffers.simil_tape);
            if let Some((slots, scale)) = gradients {
                let grad = buffers.simil_tape.gradient();
                let mut cell = dk_row.row_mut(j);
                for p in 0..n_simil {
                    cell[slots.simil(p)] += grad[p] * scale.factor(self.theta.simil[p]);
                }
                if slots.inputs {
                    for d in 0..ndim {
                        cell[slots.coord(i, d)] += grad[n_simil + d];
                        cell[slots.coord(j, d)] += grad[n_simil + ndim + d];
                    }
                }
            }

            if i == j {
                copy_row(&mut buffers.noise_args[n_noise..], &xi);
                kij += self
                    .noise
                    .observe(&buffers.noise_args, &mut buffers.noise_tape)
                    + self.nugget;
                if let Some((slots, scale)) = gradients {
                    let grad = buffers.noise_tape.gradient();
                    let mut cell = dk_row.row_mut(j);
                    for p in 0..n_noise {
                        cell[slots.noise(p)] += grad[p] * scale.factor(self.theta.noise[p]);
                    }
                    if slots.inputs {
                        for d in 0..ndim {
                            cell[slots.coord(i, d)] += grad[n_noise + d];
                        }
                    }
                }
            }
            k_row[j] = kij;
        }
    }

    /// Noise free covariance between training inputs `x` and query points `z`, shape `(n, m)`
    pub fn cross_covariance(&self, x: &ArrayView2<F>, z: &ArrayView2<F>) -> Array2<F> {
        let ndim = x.ncols();
        let n_simil = self.theta.simil.len();
        let mut kstar = Array2::<F>::zeros((x.nrows(), z.nrows()));
        let fill = |buffers: &mut RowBuffers<F>, mut col: ArrayViewMut1<F>, zc: ArrayView1<F>| {
            copy_row(&mut buffers.simil_args[n_simil + ndim..], &zc);
            for (i, xi) in x.rows().into_iter().enumerate() {
                copy_row(&mut buffers.simil_args[n_simil..n_simil + ndim], &xi);
                col[i] = self
                    .simil
                    .observe(&buffers.simil_args, &mut buffers.simil_tape);
            }
        };
        let cols = Zip::from(kstar.columns_mut()).and(z.rows());
        if self.parallel {
            cols.into_par_iter().for_each_init(
                || self.row_buffers(ndim, false),
                |buffers, (col, zc)| fill(buffers, col, zc),
            );
        } else {
            let mut buffers = self.row_buffers(ndim, false);
            cols.for_each(|col, zc| fill(&mut buffers, col, zc));
        }
        kstar
    }

    /// Noise free covariance matrix between query points, shape `(m, m)`
    pub fn query_covariance(&self, z: &ArrayView2<F>) -> Array2<F> {
        let noiseless = Assembler {
            simil: self.simil,
            noise: &ZeroNoise,
            theta: &Hyperparameters {
                simil: self.theta.simil.clone(),
                noise: Array1::zeros(0),
            },
            nugget: F::zero(),
            parallel: self.parallel,
        };
        noiseless.covariance(z)
    }

    /// Prior variance `k(z, z)` of each query point
    pub fn prior_variance(&self, z: &ArrayView2<F>) -> Array1<F> {
        let ndim = z.ncols();
        let n_simil = self.theta.simil.len();
        let mut var = Array1::<F>::zeros(z.nrows());
        let fill = |buffers: &mut RowBuffers<F>, v: &mut F, zc: ArrayView1<F>| {
            copy_row(&mut buffers.simil_args[n_simil..n_simil + ndim], &zc);
            copy_row(&mut buffers.simil_args[n_simil + ndim..], &zc);
            *v = self
                .simil
                .observe(&buffers.simil_args, &mut buffers.simil_tape);
        };
        let points = Zip::from(&mut var).and(z.rows());
        if self.parallel {
            points.into_par_iter().for_each_init(
                || self.row_buffers(ndim, false),
                |buffers, (v, zc)| fill(buffers, v, zc),
            );
        } else {
            let mut buffers = self.row_buffers(ndim, false);
            points.for_each(|v, zc| fill(&mut buffers, v, zc));
        }
        var
    }
}

/// Stand in noise kernel used for noise free covariances
struct ZeroNoise;

impl<F: Float> Kernel<F> for ZeroNoise {
    fn ntheta(&self) -> usize {
        0
    }

    fn observe(&self, args: &[F], tape: &mut Tape<F>) -> F {
        tape.record(args.len(), |_| ());
        F::zero()
    }
}

impl std::fmt::Display for ZeroNoise {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "ZeroNoise")
    }
}

fn copy_row<F: Float>(dst: &mut [F], src: &ArrayView1<F>) {
    dst.iter_mut().zip(src.iter()).for_each(|(d, s)| *d = *s);
}

/// Copy the upper triangle of K and of every dK slot onto the lower one
fn mirror_upper<F: Float>(k: &mut Array2<F>, dk: &mut Array3<F>) {
    let (n, _, nslots) = dk.dim();
    for i in 1..n {
        for j in 0..i {
            k[[i, j]] = k[[j, i]];
            for s in 0..nslots {
                dk[[i, j, s]] = dk[[j, i, s]];
            }
        }
    }
}
