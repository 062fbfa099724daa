//! Execution helpers that drive argmin solvers and normalize their result.

use crate::optim::{
    errors::OptResult,
    traits::{LogLikelihood, MleOptions, OptimOutcome},
    adapter::ArgMinAdapter,
    types::{Grad, LbfgsMoreThuente, MoreThuenteLS, SteihaugTR, TRUST_REGION_ROUND, Theta},
    validation::{validate_grad, validate_theta_hat},
};
use argmin::core::{Executor, State, TerminationStatus};
use argmin::solver::{
    linesearch::MoreThuenteLineSearch,
    quasinewton::LBFGS,
    trustregion::{Steihaug, TrustRegion},
};
use argmin_math::ArgminL2Norm;
use tracing::debug;

/// Build an L-BFGS solver with More–Thuente line search and the gradient
/// tolerance from `opts`.
pub fn build_lbfgs(opts: &MleOptions) -> OptResult<LbfgsMoreThuente> {
    let linesearch: MoreThuenteLS = MoreThuenteLineSearch::new();
    let solver = LBFGS::new(linesearch, opts.lbfgs_mem).with_tolerance_grad(opts.gtol)?;
    Ok(solver)
}

/// Run L-BFGS from `theta0` until argmin's gradient tolerance or
/// `opts.max_iter` stops it.
pub fn run_lbfgs<F: LogLikelihood>(
    f: &F,
    theta0: Theta,
    opts: &MleOptions,
) -> OptResult<OptimOutcome> {
    let solver = build_lbfgs(opts)?;
    let result = Executor::new(ArgMinAdapter::new(f), solver)
        .configure(|state| state.param(theta0).max_iters(opts.max_iter))
        .run()?;
    let state = result.state();
    let status = describe(state.get_termination_status());
    let theta_hat = validate_theta_hat(state.get_best_param().cloned())?;
    finish(f, theta_hat, state.get_iter(), status, opts)
}

/// Run the Steihaug trust-region method in rounds of
/// [`TRUST_REGION_ROUND`] iterations.
///
/// argmin's trust region has no gradient stopping rule of its own, so the
/// gradient norm is checked between rounds; the next round restarts from the
/// best parameter so far.
pub fn run_trust_region<F: LogLikelihood>(
    f: &F,
    theta0: Theta,
    opts: &MleOptions,
) -> OptResult<OptimOutcome> {
    let mut theta = theta0;
    let mut iterations = 0;
    let mut status = String::from("Not terminated");
    while iterations < opts.max_iter {
        if grad_norm(f, &theta)? <= opts.gtol {
            status = String::from("Gradient norm below tolerance");
            break;
        }
        let round = TRUST_REGION_ROUND.min(opts.max_iter - iterations);
        let solver: SteihaugTR = TrustRegion::new(Steihaug::new());
        let result = Executor::new(ArgMinAdapter::new(f), solver)
            .configure(|state| state.param(theta).max_iters(round))
            .run()?;
        let state = result.state();
        iterations += state.get_iter().max(1);
        status = describe(state.get_termination_status());
        theta = validate_theta_hat(state.get_best_param().cloned())?;
        debug!(
            iterations,
            cost = state.get_best_cost(),
            "trust-region round finished"
        );
    }
    finish(f, theta, iterations, status, opts)
}

fn grad_norm<F: LogLikelihood>(f: &F, theta: &Theta) -> OptResult<f64> {
    let g: Grad = f.grad(theta)?;
    validate_grad(&g, theta.len())?;
    Ok(g.l2_norm())
}

fn describe(status: &TerminationStatus) -> String {
    match status {
        TerminationStatus::NotTerminated => "Not terminated".to_string(),
        other => format!("{other:?}"),
    }
}

fn finish<F: LogLikelihood>(
    f: &F,
    theta_hat: Theta,
    iterations: u64,
    status: String,
    opts: &MleOptions,
) -> OptResult<OptimOutcome> {
    let value = f.value(&theta_hat)?;
    let grad_norm = grad_norm(f, &theta_hat)?;
    Ok(OptimOutcome {
        theta_hat,
        value,
        iterations,
        grad_norm,
        converged: grad_norm <= opts.gtol,
        status,
    })
}
