//! Public surface of the optimizer: the objective trait, options and outcome.
//!
//! Convention: callers *maximize* a log-likelihood `ℓ(θ)`; the argmin
//! adapter minimizes `c(θ) = −ℓ(θ)` and flips gradient signs itself.

use crate::optim::{
    errors::{OptError, OptResult},
    types::{DEFAULT_LBFGS_MEM, Grad, Theta},
    validation::verify_tol_grad,
};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Differentiable objective to maximize.
///
/// Required:
/// - `dim()`: length of θ.
/// - `value(&Theta) -> OptResult<f64>`: evaluate `ℓ(θ)`.
/// - `grad(&Theta) -> OptResult<Grad>`: analytic `∇ℓ(θ)`.
///
/// Optional:
/// - `check(&Theta)`: validation hook run once before optimization; the
///   default only checks the length.
pub trait LogLikelihood {
    fn dim(&self) -> usize;
    fn value(&self, theta: &Theta) -> OptResult<f64>;
    fn grad(&self, theta: &Theta) -> OptResult<Grad>;

    fn check(&self, theta: &Theta) -> OptResult<()> {
        if theta.len() != self.dim() {
            return Err(OptError::ThetaDimMismatch {
                expected: self.dim(),
                found: theta.len(),
            });
        }
        Ok(())
    }
}

/// Choice of solver.
///
/// Parsing is case-insensitive: `"trust-region"`, `"trust-ncg"`,
/// `"trustregion"` select [`MleSolver::TrustRegion`]; `"lbfgs"` and
/// `"l-bfgs"` select [`MleSolver::Lbfgs`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MleSolver {
    /// Trust region with a Steihaug conjugate-gradient subproblem.
    TrustRegion,
    /// L-BFGS with More–Thuente line search.
    Lbfgs,
}

impl FromStr for MleSolver {
    type Err = OptError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trust-region" | "trust-ncg" | "trustregion" => Ok(MleSolver::TrustRegion),
            "lbfgs" | "l-bfgs" => Ok(MleSolver::Lbfgs),
            _ => Err(OptError::InvalidSolver {
                name: s.to_string(),
                reason: "Valid options are 'trust-region' (alias 'trust-ncg') or 'lbfgs'.",
            }),
        }
    }
}

/// Optimizer configuration.
///
/// Default: `gtol = 1e-3`, `max_iter = 500`, `solver = TrustRegion`,
/// `lbfgs_mem = 7`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MleOptions {
    /// Converged once `‖∇ℓ(θ)‖₂ <= gtol`.
    pub gtol: f64,
    /// Hard cap on solver iterations.
    pub max_iter: u64,
    pub solver: MleSolver,
    pub lbfgs_mem: usize,
}

impl MleOptions {
    /// Build validated options.
    ///
    /// # Errors
    /// - [`OptError::InvalidTolGrad`] for non-finite or non-positive `gtol`.
    /// - [`OptError::InvalidMaxIter`] when `max_iter == 0`.
    /// - [`OptError::InvalidLbfgsMem`] when `lbfgs_mem == 0`.
    pub fn new(gtol: f64, max_iter: u64, solver: MleSolver, lbfgs_mem: usize) -> OptResult<Self> {
        verify_tol_grad(gtol)?;
        if max_iter == 0 {
            return Err(OptError::InvalidMaxIter {
                max_iter,
                reason: "Maximum iterations must be greater than zero.",
            });
        }
        if lbfgs_mem == 0 {
            return Err(OptError::InvalidLbfgsMem {
                mem: lbfgs_mem,
                reason: "L-BFGS memory must be greater than zero.",
            });
        }
        Ok(Self {
            gtol,
            max_iter,
            solver,
            lbfgs_mem,
        })
    }
}

impl Default for MleOptions {
    fn default() -> Self {
        Self {
            gtol: 1e-3,
            max_iter: 500,
            solver: MleSolver::TrustRegion,
            lbfgs_mem: DEFAULT_LBFGS_MEM,
        }
    }
}

/// Result returned by [`maximize`](crate::optim::maximize).
///
/// - `value` is the best log-likelihood `ℓ(θ̂)`, not the cost.
/// - `converged` is `grad_norm <= gtol`; a run that exhausts `max_iter`
///   is reported, not raised.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimOutcome {
    pub theta_hat: Theta,
    pub value: f64,
    pub iterations: u64,
    pub grad_norm: f64,
    pub converged: bool,
    pub status: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn solver_names_parse_case_insensitively() {
        assert_eq!("Trust-NCG".parse::<MleSolver>().unwrap(), MleSolver::TrustRegion);
        assert_eq!("LBFGS".parse::<MleSolver>().unwrap(), MleSolver::Lbfgs);
        assert!(matches!(
            "newton".parse::<MleSolver>(),
            Err(OptError::InvalidSolver { .. })
        ));
    }

    #[test]
    fn options_reject_bad_values() {
        assert!(MleOptions::new(0.0, 10, MleSolver::Lbfgs, 7).is_err());
        assert!(MleOptions::new(f64::NAN, 10, MleSolver::Lbfgs, 7).is_err());
        assert!(MleOptions::new(1e-3, 0, MleSolver::Lbfgs, 7).is_err());
        assert!(MleOptions::new(1e-3, 10, MleSolver::Lbfgs, 0).is_err());
        assert_eq!(
            MleOptions::new(1e-3, 500, MleSolver::TrustRegion, 7).unwrap(),
            MleOptions::default()
        );
    }
}
