//! A module for similarity kernels used to model the covariance between two locations.
//!
//! A kernel is a scalar function of a flat argument vector laid out as
//! `[hyperparameters..., xa..., xb...]` where `xa` and `xb` are the two locations.
//! Hyperparameters are given in linear space.
//!
//! Kernels report their partial derivatives with respect to every argument
//! on a [`Tape`] when the tape is recording. The following kernels are implemented:
//! * squared exponential,
//! * matern 3/2,
//! * matern 5/2,
//! * periodic,
//! * linear (non stationary),
//! * output scaling of any kernel,
//! * a finite-difference wrapper for kernels given as plain closures.

use finitediff::FiniteDiff;
use linfa::Float;
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// A recording context for kernel evaluations.
///
/// A recording tape retains the partial derivatives of the last kernel call
/// with respect to each of its arguments, a discarding tape lets kernels skip
/// the derivative computation altogether.
#[derive(Clone, Debug)]
pub struct Tape<F: Float> {
    recording: bool,
    grad: Vec<F>,
}

impl<F: Float> Tape<F> {
    /// A tape retaining the gradient of each kernel call
    pub fn recording() -> Self {
        Tape {
            recording: true,
            grad: Vec::new(),
        }
    }

    /// A tape ignoring gradients
    pub fn discarding() -> Self {
        Tape {
            recording: false,
            grad: Vec::new(),
        }
    }

    /// Whether kernels have to record their gradient
    pub fn is_recording(&self) -> bool {
        self.recording
    }

    /// Record a gradient of `len` components computed by `fill` from zeros.
    /// No-op on a discarding tape.
    pub fn record(&mut self, len: usize, fill: impl FnOnce(&mut [F])) {
        if self.recording {
            self.grad.clear();
            self.grad.resize(len, F::zero());
            fill(&mut self.grad);
        }
    }

    /// Scale the recorded gradient by `scale` and prepend the `head` component.
    /// Used by kernels wrapping another kernel with one extra leading parameter.
    pub fn rescale(&mut self, head: F, scale: F) {
        if self.recording {
            self.grad.iter_mut().for_each(|g| *g *= scale);
            self.grad.insert(0, head);
        }
    }

    /// Gradient of the last recorded call, same shape as its arguments
    pub fn gradient(&self) -> &[F] {
        &self.grad
    }

    /// Discard the recorded gradient without reading it
    pub fn drop_gradient(&mut self) {
        self.grad.clear();
    }
}

/// A trait for using a kernel in GP regression.
///
/// A similarity kernel is called with `[theta..., xa..., xb...]`, a noise kernel
/// with `[theta..., x...]`; both report `ntheta()` hyperparameters.
pub trait Kernel<F: Float>: fmt::Display + Send + Sync {
    /// Number of hyperparameters
    fn ntheta(&self) -> usize;

    /// Evaluate the kernel at `args`, recording partial derivatives wrt `args` on `tape`
    fn observe(&self, args: &[F], tape: &mut Tape<F>) -> F;

    /// Whether the kernel can be evaluated concurrently from several threads.
    /// When false, covariance computations fall back to sequential execution.
    fn reentrant(&self) -> bool {
        true
    }
}

impl<F: Float, K: Kernel<F> + ?Sized> Kernel<F> for Arc<K> {
    fn ntheta(&self) -> usize {
        (**self).ntheta()
    }

    fn observe(&self, args: &[F], tape: &mut Tape<F>) -> F {
        (**self).observe(args, tape)
    }

    fn reentrant(&self) -> bool {
        (**self).reentrant()
    }
}

impl<F: Float, K: Kernel<F> + ?Sized> Kernel<F> for &K {
    fn ntheta(&self) -> usize {
        (**self).ntheta()
    }

    fn observe(&self, args: &[F], tape: &mut Tape<F>) -> F {
        (**self).observe(args, tape)
    }

    fn reentrant(&self) -> bool {
        (**self).reentrant()
    }
}

/// Split similarity kernel arguments into (theta, xa, xb)
fn split_args<F>(args: &[F], ntheta: usize) -> (&[F], &[F], &[F]) {
    let (theta, x) = args.split_at(ntheta);
    let (xa, xb) = x.split_at(x.len() / 2);
    (theta, xa, xb)
}

fn sqdist<F: Float>(xa: &[F], xb: &[F]) -> F {
    xa.iter()
        .zip(xb)
        .fold(F::zero(), |acc, (a, b)| acc + (*a - *b) * (*a - *b))
}

/// Fill coordinate derivatives of a function of `d = xa - xb`:
/// `coord(d_k)` is the derivative wrt `xa_k`, its opposite the one wrt `xb_k`
fn fill_coords<F: Float>(
    grad: &mut [F],
    ntheta: usize,
    xa: &[F],
    xb: &[F],
    coord: impl Fn(F) -> F,
) {
    let ndim = xa.len();
    for k in 0..ndim {
        let g = coord(xa[k] - xb[k]);
        grad[ntheta + k] = g;
        grad[ntheta + ndim + k] = -g;
    }
}

/// Squared exponential kernel, a single length scale `l` hyperparameter
///
/// `exp(-|xa - xb|^2 / (2 l^2))`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct SquaredExponential;

impl<F: Float> Kernel<F> for SquaredExponential {
    fn ntheta(&self) -> usize {
        1
    }

    fn observe(&self, args: &[F], tape: &mut Tape<F>) -> F {
        let (theta, xa, xb) = split_args(args, 1);
        let l = theta[0];
        let r2 = sqdist(xa, xb) / (l * l);
        let k = F::exp(F::cast(-0.5) * r2);
        tape.record(args.len(), |grad| {
            grad[0] = k * r2 / l;
            let c = k / (l * l);
            fill_coords(grad, 1, xa, xb, |d| -c * d);
        });
        k
    }
}

impl fmt::Display for SquaredExponential {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SquaredExponential")
    }
}

/// Matern 3/2 kernel, a single length scale `l` hyperparameter
///
/// `(1 + sqrt(3) r) exp(-sqrt(3) r)` with `r = |xa - xb| / l`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct Matern32;

impl<F: Float> Kernel<F> for Matern32 {
    fn ntheta(&self) -> usize {
        1
    }

    fn observe(&self, args: &[F], tape: &mut Tape<F>) -> F {
        let (theta, xa, xb) = split_args(args, 1);
        let l = theta[0];
        let sqrt3 = F::cast(3.).sqrt();
        let r = sqdist(xa, xb).sqrt() / l;
        let e = F::exp(-sqrt3 * r);
        let k = (F::one() + sqrt3 * r) * e;
        tape.record(args.len(), |grad| {
            let three = F::cast(3.);
            grad[0] = three * r * r * e / l;
            let c = three * e / (l * l);
            fill_coords(grad, 1, xa, xb, |d| -c * d);
        });
        k
    }
}

impl fmt::Display for Matern32 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Matern32")
    }
}

/// Matern 5/2 kernel, a single length scale `l` hyperparameter
///
/// `(1 + sqrt(5) r + 5 r^2 / 3) exp(-sqrt(5) r)` with `r = |xa - xb| / l`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct Matern52;

impl<F: Float> Kernel<F> for Matern52 {
    fn ntheta(&self) -> usize {
        1
    }

    fn observe(&self, args: &[F], tape: &mut Tape<F>) -> F {
        let (theta, xa, xb) = split_args(args, 1);
        let l = theta[0];
        let sqrt5 = F::cast(5.).sqrt();
        let five_thirds = F::cast(5. / 3.);
        let r = sqdist(xa, xb).sqrt() / l;
        let e = F::exp(-sqrt5 * r);
        let k = (F::one() + sqrt5 * r + five_thirds * r * r) * e;
        tape.record(args.len(), |grad| {
            let a = five_thirds * (F::one() + sqrt5 * r) * e;
            grad[0] = a * r * r / l;
            let c = a / (l * l);
            fill_coords(grad, 1, xa, xb, |d| -c * d);
        });
        k
    }
}

impl fmt::Display for Matern52 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Matern52")
    }
}

/// Exponential periodic kernel, length scale `l` and period `p` hyperparameters
///
/// `exp(-2 sum_k sin^2(pi (xa_k - xb_k) / p) / l^2)`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct Periodic;

impl<F: Float> Kernel<F> for Periodic {
    fn ntheta(&self) -> usize {
        2
    }

    fn observe(&self, args: &[F], tape: &mut Tape<F>) -> F {
        let (theta, xa, xb) = split_args(args, 2);
        let (l, p) = (theta[0], theta[1]);
        let pi = F::cast(std::f64::consts::PI);
        let two = F::cast(2.);
        let s = xa.iter().zip(xb).fold(F::zero(), |acc, (a, b)| {
            let sn = (pi * (*a - *b) / p).sin();
            acc + sn * sn
        });
        let k = F::exp(-two * s / (l * l));
        tape.record(args.len(), |grad| {
            grad[0] = two * two * k * s / (l * l * l);
            let ds = xa.iter().zip(xb).fold(F::zero(), |acc, (a, b)| {
                let d = *a - *b;
                acc + d * (two * pi * d / p).sin()
            });
            grad[1] = two * pi * k * ds / (l * l * p * p);
            let c = two * pi * k / (l * l * p);
            fill_coords(grad, 2, xa, xb, |d| -c * (two * pi * d / p).sin());
        });
        k
    }
}

impl fmt::Display for Periodic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Periodic")
    }
}

/// Linear (dot product) kernel, a single variance `c` hyperparameter
///
/// `c * (xa . xb)`
///
/// The kernel is not stationary: it depends on the locations themselves,
/// not only on their difference.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct Linear;

impl<F: Float> Kernel<F> for Linear {
    fn ntheta(&self) -> usize {
        1
    }

    fn observe(&self, args: &[F], tape: &mut Tape<F>) -> F {
        let (theta, xa, xb) = split_args(args, 1);
        let c = theta[0];
        let dot = xa
            .iter()
            .zip(xb)
            .fold(F::zero(), |acc, (a, b)| acc + *a * *b);
        tape.record(args.len(), |grad| {
            let ndim = xa.len();
            grad[0] = dot;
            for k in 0..ndim {
                grad[1 + k] = c * xb[k];
                grad[1 + ndim + k] = c * xa[k];
            }
        });
        c * dot
    }
}

impl fmt::Display for Linear {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Linear")
    }
}

/// Output scaled kernel: `c * K(theta_K, xa, xb)`.
///
/// Hyperparameters are the output scale `c` followed by those of the inner kernel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct Scaled<K>(pub K);

impl<F: Float, K: Kernel<F>> Kernel<F> for Scaled<K> {
    fn ntheta(&self) -> usize {
        1 + self.0.ntheta()
    }

    fn observe(&self, args: &[F], tape: &mut Tape<F>) -> F {
        let c = args[0];
        let k = self.0.observe(&args[1..], tape);
        tape.rescale(k, c);
        c * k
    }

    fn reentrant(&self) -> bool {
        self.0.reentrant()
    }
}

impl<K: fmt::Display> fmt::Display for Scaled<K> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Scaled({})", self.0)
    }
}

/// A kernel given as a plain function of its flat arguments,
/// its gradient is estimated with central finite differences.
#[derive(Clone)]
pub struct FiniteDiffKernel<Fun> {
    ntheta: usize,
    fun: Fun,
    reentrant: bool,
}

impl<Fun> FiniteDiffKernel<Fun>
where
    Fun: Fn(&[f64]) -> f64 + Send + Sync,
{
    /// Constructor given the number of hyperparameters and the kernel function
    pub fn new(ntheta: usize, fun: Fun) -> Self {
        FiniteDiffKernel {
            ntheta,
            fun,
            reentrant: true,
        }
    }

    /// Declare the function as unsafe to call concurrently
    pub fn non_reentrant(mut self) -> Self {
        self.reentrant = false;
        self
    }
}

impl<Fun> Kernel<f64> for FiniteDiffKernel<Fun>
where
    Fun: Fn(&[f64]) -> f64 + Send + Sync,
{
    fn ntheta(&self) -> usize {
        self.ntheta
    }

    fn observe(&self, args: &[f64], tape: &mut Tape<f64>) -> f64 {
        tape.record(args.len(), |grad| {
            let x = args.to_vec();
            let g = x.central_diff(&|x: &Vec<f64>| (self.fun)(x));
            grad.copy_from_slice(&g);
        });
        (self.fun)(args)
    }

    fn reentrant(&self) -> bool {
        self.reentrant
    }
}

impl<Fun> fmt::Display for FiniteDiffKernel<Fun> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "FiniteDiff(ntheta={})", self.ntheta)
    }
}
