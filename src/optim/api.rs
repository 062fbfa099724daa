//! High-level entry point for maximizing a [`LogLikelihood`].

use crate::optim::{
    errors::OptResult,
    run::{run_lbfgs, run_trust_region},
    traits::{LogLikelihood, MleOptions, MleSolver, OptimOutcome},
    types::Theta,
};

/// Maximize `ℓ(θ)` starting from `theta0`.
///
/// # Behavior
/// - Validates the starting point via [`LogLikelihood::check`].
/// - Dispatches on `opts.solver` to the trust-region or L-BFGS runner.
/// - Never treats running out of iterations as an error: the returned
///   [`OptimOutcome::converged`] flag says whether `‖∇ℓ‖ <= gtol` was reached.
///
/// # Errors
/// - Propagates errors from `check`, `value` and `grad`.
/// - Propagates argmin failures (e.g. a line search that cannot find a
///   finite point) as [`OptError::Backend`](crate::optim::OptError::Backend).
///
/// # Example
/// ```
/// use occu::optim::{maximize, LogLikelihood, MleOptions, OptResult};
///
/// struct Bowl;
/// impl LogLikelihood for Bowl {
///     fn dim(&self) -> usize { 2 }
///     fn value(&self, t: &Vec<f64>) -> OptResult<f64> {
///         Ok(-(t[0] - 1.0).powi(2) - (t[1] + 2.0).powi(2))
///     }
///     fn grad(&self, t: &Vec<f64>) -> OptResult<Vec<f64>> {
///         Ok(vec![-2.0 * (t[0] - 1.0), -2.0 * (t[1] + 2.0)])
///     }
/// }
///
/// let out = maximize(&Bowl, vec![0.0, 0.0], &MleOptions::default())?;
/// assert!(out.converged);
/// assert!((out.theta_hat[0] - 1.0).abs() < 1e-3);
/// # Ok::<(), occu::optim::OptError>(())
/// ```
pub fn maximize<F: LogLikelihood>(
    f: &F,
    theta0: Theta,
    opts: &MleOptions,
) -> OptResult<OptimOutcome> {
    f.check(&theta0)?;
    match opts.solver {
        MleSolver::TrustRegion => run_trust_region(f, theta0, opts),
        MleSolver::Lbfgs => run_lbfgs(f, theta0, opts),
    }
}
