//! Adapter that exposes a [`LogLikelihood`] as an `argmin` problem.
//!
//! Maximizing `ℓ(θ)` becomes minimizing `c(θ) = −ℓ(θ)`. Gradients are the
//! caller's analytic `∇ℓ` with the sign flipped. Hessians, needed by the
//! trust-region solver, are central finite differences of that analytic
//! gradient.

use crate::optim::{
    errors::OptError,
    traits::LogLikelihood,
    types::{Cost, Grad, Hessian as DenseHessian, Theta},
    validation::{validate_grad, validate_hessian},
};
use argmin::core::{CostFunction, Error, Gradient, Hessian};
use finitediff::FiniteDiff;
use std::cell::RefCell;

/// Bridges a [`LogLikelihood`] to argmin's `CostFunction`, `Gradient` and
/// `Hessian`.
#[derive(Debug)]
pub struct ArgMinAdapter<'a, F: LogLikelihood> {
    pub f: &'a F,
}

impl<F: LogLikelihood> Clone for ArgMinAdapter<'_, F> {
    fn clone(&self) -> Self {
        Self { f: self.f }
    }
}

impl<'a, F: LogLikelihood> ArgMinAdapter<'a, F> {
    pub fn new(f: &'a F) -> Self {
        Self { f }
    }
}

impl<F: LogLikelihood> CostFunction for ArgMinAdapter<'_, F> {
    type Param = Theta;
    type Output = Cost;

    /// Evaluate `c(θ) = −ℓ(θ)`.
    ///
    /// # Errors
    /// Returns [`OptError::NonFiniteCost`] if `ℓ(θ)` is not finite.
    fn cost(&self, theta: &Self::Param) -> Result<Self::Output, Error> {
        let output = self.f.value(theta)?;
        if !output.is_finite() {
            return Err(OptError::NonFiniteCost { value: output }.into());
        }
        Ok(-output)
    }
}

impl<F: LogLikelihood> Gradient for ArgMinAdapter<'_, F> {
    type Param = Theta;
    type Gradient = Grad;

    fn gradient(&self, theta: &Self::Param) -> Result<Self::Gradient, Error> {
        let g = self.f.grad(theta)?;
        validate_grad(&g, theta.len())?;
        Ok(g.into_iter().map(|v| -v).collect())
    }
}

impl<F: LogLikelihood> Hessian for ArgMinAdapter<'_, F> {
    type Param = Theta;
    type Hessian = DenseHessian;

    /// Central-difference Hessian of the cost, symmetrized.
    ///
    /// The finite-difference closure cannot return `Result`, so the first
    /// gradient error is parked in `closure_err` and surfaced afterwards.
    fn hessian(&self, theta: &Self::Param) -> Result<Self::Hessian, Error> {
        let dim = theta.len();
        let closure_err: RefCell<Option<Error>> = RefCell::new(None);
        let grad_fn = |t: &Theta| -> Theta {
            match self.gradient(t) {
                Ok(g) => g,
                Err(e) => {
                    let mut slot = closure_err.borrow_mut();
                    if slot.is_none() {
                        *slot = Some(e);
                    }
                    vec![f64::NAN; dim]
                }
            }
        };
        let mut hess = theta.central_hessian(&grad_fn);
        if let Some(err) = closure_err.take() {
            return Err(err);
        }
        for i in 0..dim {
            for j in (i + 1)..dim {
                let avg = 0.5 * (hess[i][j] + hess[j][i]);
                hess[i][j] = avg;
                hess[j][i] = avg;
            }
        }
        validate_hessian(&hess)?;
        Ok(hess)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optim::errors::OptResult;
    use approx::assert_abs_diff_eq;

    /// ℓ(θ) = −(θ₀ − 1)² − 2θ₁² − θ₀θ₁
    struct Quadratic;

    impl LogLikelihood for Quadratic {
        fn dim(&self) -> usize {
            2
        }
        fn value(&self, t: &Theta) -> OptResult<f64> {
            Ok(-(t[0] - 1.0).powi(2) - 2.0 * t[1] * t[1] - t[0] * t[1])
        }
        fn grad(&self, t: &Theta) -> OptResult<Grad> {
            Ok(vec![-2.0 * (t[0] - 1.0) - t[1], -4.0 * t[1] - t[0]])
        }
    }

    #[test]
    fn cost_and_gradient_flip_sign() {
        let adapter = ArgMinAdapter::new(&Quadratic);
        let theta = vec![0.5, -0.25];
        let ll = Quadratic.value(&theta).unwrap();
        assert_abs_diff_eq!(adapter.cost(&theta).unwrap(), -ll);
        let g = adapter.gradient(&theta).unwrap();
        let g_ll = Quadratic.grad(&theta).unwrap();
        assert_abs_diff_eq!(g[0], -g_ll[0]);
        assert_abs_diff_eq!(g[1], -g_ll[1]);
    }

    #[test]
    fn finite_difference_hessian_is_symmetric_and_accurate() {
        let adapter = ArgMinAdapter::new(&Quadratic);
        let h = adapter.hessian(&vec![0.3, 0.7]).unwrap();
        assert_abs_diff_eq!(h[0][0], 2.0, epsilon = 1e-5);
        assert_abs_diff_eq!(h[1][1], 4.0, epsilon = 1e-5);
        assert_abs_diff_eq!(h[0][1], 1.0, epsilon = 1e-5);
        assert_eq!(h[0][1], h[1][0]);
    }
}
