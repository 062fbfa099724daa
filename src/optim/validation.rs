//! Consistency checks shared by the optimizer layer.

use crate::optim::{
    errors::{OptError, OptResult},
    types::{Grad, Hessian, Theta},
};

/// Tolerances must be finite and strictly positive.
pub fn verify_tol_grad(tol: f64) -> OptResult<()> {
    if !tol.is_finite() {
        return Err(OptError::InvalidTolGrad {
            tol,
            reason: "Tolerance must be finite.",
        });
    }
    if tol <= 0.0 {
        return Err(OptError::InvalidTolGrad {
            tol,
            reason: "Tolerance must be positive.",
        });
    }
    Ok(())
}

/// Gradient must have length `dim` and finite entries.
pub fn validate_grad(grad: &Grad, dim: usize) -> OptResult<()> {
    if grad.len() != dim {
        return Err(OptError::GradientDimMismatch {
            expected: dim,
            found: grad.len(),
        });
    }
    if let Some((index, &value)) = grad.iter().enumerate().find(|(_, g)| !g.is_finite()) {
        return Err(OptError::InvalidGradient { index, value });
    }
    Ok(())
}

/// Hessian must be finite everywhere.
pub fn validate_hessian(hess: &Hessian) -> OptResult<()> {
    for (row, r) in hess.iter().enumerate() {
        if let Some((col, &value)) = r.iter().enumerate().find(|(_, h)| !h.is_finite()) {
            return Err(OptError::InvalidHessian { row, col, value });
        }
    }
    Ok(())
}

/// A best parameter must exist and be finite.
pub fn validate_theta_hat(theta_hat: Option<Theta>) -> OptResult<Theta> {
    let theta = theta_hat.ok_or(OptError::MissingThetaHat)?;
    if let Some((index, &value)) = theta.iter().enumerate().find(|(_, t)| !t.is_finite()) {
        return Err(OptError::InvalidThetaHat { index, value });
    }
    Ok(theta)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gradient_checks_length_and_finiteness() {
        assert!(validate_grad(&vec![1.0, 2.0], 2).is_ok());
        assert!(matches!(
            validate_grad(&vec![1.0], 2),
            Err(OptError::GradientDimMismatch { expected: 2, found: 1 })
        ));
        assert!(matches!(
            validate_grad(&vec![1.0, f64::NAN], 2),
            Err(OptError::InvalidGradient { index: 1, .. })
        ));
    }

    #[test]
    fn hessian_rejects_infinities() {
        let h = vec![vec![1.0, 0.0], vec![0.0, f64::INFINITY]];
        assert!(matches!(
            validate_hessian(&h),
            Err(OptError::InvalidHessian { row: 1, col: 1, .. })
        ));
    }
}
