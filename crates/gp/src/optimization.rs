//! Maximization of an elemental model with argmin L-BFGS solver.

use crate::errors::{GpError, Result};
use crate::model::ElementalModel;

use argmin::core::{CostFunction, Executor, Gradient, State};
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::quasinewton::LBFGS;
use log::{debug, info};
use ndarray::Array1;
use std::cell::RefCell;
use std::time::Instant;

/// L-BFGS settings
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LbfgsParams {
    /// Maximum number of iterations
    pub max_iters: u64,
    /// Number of past updates kept to approximate the inverse hessian
    pub memory: usize,
}

impl Default for LbfgsParams {
    fn default() -> Self {
        LbfgsParams {
            max_iters: 100,
            memory: 7,
        }
    }
}

/// Negated model as an argmin problem to be minimized
struct Negated<'a, M> {
    model: RefCell<&'a mut M>,
    /// Parameters of the last observe whose gradient is still pending
    observed: RefCell<Option<Vec<f64>>>,
}

impl<M: ElementalModel<f64>> Negated<'_, M> {
    fn observe(&self, p: &[f64]) -> Result<f64> {
        let value = self.model.borrow_mut().observe(p)?;
        *self.observed.borrow_mut() = Some(p.to_vec());
        Ok(value)
    }
}

impl<M: ElementalModel<f64>> CostFunction for Negated<'_, M> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, p: &Self::Param) -> std::result::Result<Self::Output, argmin::core::Error> {
        Ok(-self.observe(p)?)
    }
}

impl<M: ElementalModel<f64>> Gradient for Negated<'_, M> {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(
        &self,
        p: &Self::Param,
    ) -> std::result::Result<Self::Gradient, argmin::core::Error> {
        let pending = self.observed.borrow_mut().take();
        if pending.as_ref() != Some(p) {
            self.observe(p)?;
            self.observed.borrow_mut().take();
        }
        let grad = self.model.borrow_mut().gradient()?;
        Ok(grad.iter().map(|g| -g).collect())
    }
}

/// Maximize `model` starting from `init` parameters with L-BFGS.
///
/// Returns the best value and its parameters.
pub fn optimize_params<M: ElementalModel<f64>>(
    model: &mut M,
    init: &Array1<f64>,
    params: LbfgsParams,
) -> Result<(f64, Array1<f64>)> {
    let now = Instant::now();
    let problem = Negated {
        model: RefCell::new(&mut *model),
        observed: RefCell::new(None),
    };
    let linesearch = MoreThuenteLineSearch::new();
    let solver = LBFGS::new(linesearch, params.memory);
    let res = Executor::new(problem, solver)
        .configure(|state| state.param(init.to_vec()).max_iters(params.max_iters))
        .run()?;

    let state = res.state();
    let best = state.get_best_param().cloned().ok_or_else(|| {
        GpError::InvalidStateError("optimizer returned no parameters".to_string())
    })?;
    let value = -state.get_best_cost();
    debug!(
        "L-BFGS {} iterations in {:?}",
        state.get_iter(),
        now.elapsed()
    );
    info!("Optimized value = {} at {:?}", value, best);
    drop(res);

    // leave the model observed at the best parameters
    model.observe(&best)?;
    model.drop_gradient();
    Ok((value, Array1::from(best)))
}
