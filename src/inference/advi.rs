//! Mean-field automatic differentiation variational inference.
//!
//! The approximation is `q(x) = Π_k N(x_k | μ_k, e^{2 ω_k})` over the
//! unconstrained parameters `x`. With a fixed set of `M` standard-normal
//! base draws `z_m`, the objective
//!
//! ```text
//! ELBO(μ, ω) = (1/M) Σ_m log p(T(μ + e^ω ⊙ z_m)) + log|J| + Σ_k ω_k
//! ```
//!
//! is deterministic and smooth, so it is handed to the L-BFGS optimizer as
//! an ordinary objective. Gradients follow the reparameterization
//! `∂/∂μ = mean g_m`, `∂/∂ω = mean (g_m ⊙ z_m ⊙ e^ω) + 1`.

use crate::errors::{OccuError, Result};
use crate::inference::{
    PosteriorDraws, PosteriorTarget, unconstrained_log_density, unconstrained_log_density_grad,
};
use crate::optim::{self, Grad, LogLikelihood, MleOptions, MleSolver, OptError, OptResult, Theta};
use ndarray::Array2;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
#[cfg(feature = "rayon")]
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use statrs::distribution::Normal;
use tracing::{debug, info, warn};

/// Settings for [`fit_advi`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdviOptions {
    /// Monte-Carlo draws per objective evaluation.
    pub m: usize,
    /// Posterior draws returned after fitting.
    pub n_draws: usize,
    pub seed: u64,
    /// Initial standard deviation of every variational factor.
    pub init_sd: f64,
    pub gtol: f64,
    pub max_iter: u64,
}

impl Default for AdviOptions {
    fn default() -> Self {
        Self {
            m: 20,
            n_draws: 1000,
            seed: 0,
            init_sd: 0.1,
            gtol: 1e-3,
            max_iter: 1000,
        }
    }
}

impl AdviOptions {
    pub fn validate(&self) -> Result<()> {
        if self.m == 0 {
            return Err(OccuError::InvalidOption {
                name: "m",
                reason: "need at least one Monte-Carlo draw".into(),
            });
        }
        if self.n_draws == 0 {
            return Err(OccuError::InvalidOption {
                name: "n_draws",
                reason: "need at least one posterior draw".into(),
            });
        }
        if !(self.init_sd > 0.0 && self.init_sd.is_finite()) {
            return Err(OccuError::InvalidOption {
                name: "init_sd",
                reason: format!("must be positive and finite, got {}", self.init_sd),
            });
        }
        MleOptions::new(self.gtol, self.max_iter, MleSolver::Lbfgs, 7)?;
        Ok(())
    }
}

/// Outcome of a variational fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdviDiagnostics {
    /// Final ELBO, unscaled.
    pub elbo: f64,
    pub iterations: u64,
    /// Gradient norm of the scaled objective at the optimum.
    pub grad_norm: f64,
    pub converged: bool,
    pub status: String,
    pub n_components: usize,
    pub n_draws: usize,
    /// Variational means, unconstrained scale.
    pub means: Vec<f64>,
    /// Variational standard deviations, unconstrained scale.
    pub sds: Vec<f64>,
}

/// Fit a mean-field Gaussian to `target` and draw from it.
///
/// Non-convergence is reported in [`AdviDiagnostics::converged`] and logged;
/// it is not an error.
///
/// # Errors
/// - [`OccuError::InvalidOption`] for bad options.
/// - [`OccuError::Optimizer`] if the objective becomes non-finite or the
///   line search fails.
pub fn fit_advi<T: PosteriorTarget>(
    target: &T,
    opts: &AdviOptions,
) -> Result<(PosteriorDraws, AdviDiagnostics)> {
    opts.validate()?;
    let layout = target.layout();
    let dim = layout.dim();
    let mut rng = ChaCha8Rng::seed_from_u64(opts.seed);
    let std_normal = standard_normal()?;

    let base = Array2::from_shape_fn((opts.m, dim), |_| rng.sample(&std_normal));
    let objective = ElboObjective {
        target,
        base,
        scale: target.n_observations().max(1) as f64,
    };

    let mut theta0 = vec![0.0; 2 * dim];
    theta0[dim..].fill(opts.init_sd.ln());
    let mle_opts = MleOptions::new(opts.gtol, opts.max_iter, MleSolver::Lbfgs, 7)?;
    info!(dim, m = opts.m, "fitting mean-field approximation");
    let outcome = optim::maximize(&objective, theta0, &mle_opts)?;

    let (means, log_sds) = outcome.theta_hat.split_at(dim);
    let sds: Vec<f64> = log_sds.iter().map(|w| w.exp()).collect();
    let elbo = outcome.value * objective.scale;
    if outcome.converged {
        info!(elbo, iterations = outcome.iterations, "variational fit converged");
    } else {
        warn!(
            elbo,
            grad_norm = outcome.grad_norm,
            status = %outcome.status,
            "variational fit did not converge"
        );
    }

    let mut values = Array2::zeros((opts.n_draws, dim));
    for mut row in values.rows_mut() {
        let x: Vec<f64> = means
            .iter()
            .zip(&sds)
            .map(|(mu, sd)| mu + sd * rng.sample(&std_normal))
            .collect();
        for (v, t) in row.iter_mut().zip(layout.constrain(&x)) {
            *v = t;
        }
    }
    debug!(n_draws = opts.n_draws, "drew from variational posterior");

    let diagnostics = AdviDiagnostics {
        elbo,
        iterations: outcome.iterations,
        grad_norm: outcome.grad_norm,
        converged: outcome.converged,
        status: outcome.status,
        n_components: opts.m,
        n_draws: opts.n_draws,
        means: means.to_vec(),
        sds,
    };
    Ok((PosteriorDraws::new(layout.clone(), values)?, diagnostics))
}

pub(crate) fn standard_normal() -> Result<Normal> {
    Normal::new(0.0, 1.0).map_err(|e| OccuError::Sampler(e.to_string()))
}

/// ELBO over `[μ, ω]`, divided by the number of observations.
struct ElboObjective<'a, T: PosteriorTarget> {
    target: &'a T,
    base: Array2<f64>,
    scale: f64,
}

impl<T: PosteriorTarget> ElboObjective<'_, T> {
    fn n_params(&self) -> usize {
        self.base.ncols()
    }

    fn draw(&self, theta: &Theta, m: usize) -> Vec<f64> {
        let (mu, omega) = theta.split_at(self.n_params());
        self.base
            .row(m)
            .iter()
            .zip(mu.iter().zip(omega))
            .map(|(z, (mu, w))| mu + w.exp() * z)
            .collect()
    }

    /// Evaluate `f` for every base draw, in parallel when `rayon` is on.
    fn over_draws<R, F>(&self, f: F) -> Vec<R>
    where
        R: Send,
        F: Fn(usize) -> R + Send + Sync,
    {
        #[cfg(feature = "rayon")]
        {
            (0..self.base.nrows()).into_par_iter().map(f).collect()
        }
        #[cfg(not(feature = "rayon"))]
        {
            (0..self.base.nrows()).map(f).collect()
        }
    }
}

impl<T: PosteriorTarget> LogLikelihood for ElboObjective<'_, T> {
    fn dim(&self) -> usize {
        2 * self.base.ncols()
    }

    fn value(&self, theta: &Theta) -> OptResult<f64> {
        let dim = self.n_params();
        let n = self.base.nrows() as f64;
        let draws =
            self.over_draws(|m| unconstrained_log_density(self.target, &self.draw(theta, m)));
        let entropy: f64 = theta[dim..].iter().sum();
        Ok((draws.iter().sum::<f64>() / n + entropy) / self.scale)
    }

    fn grad(&self, theta: &Theta) -> OptResult<Grad> {
        let dim = self.n_params();
        let n = self.base.nrows() as f64;
        let mut g = vec![0.0; 2 * dim];
        let per_draw = self.over_draws(|m| {
            unconstrained_log_density_grad(self.target, &self.draw(theta, m)).1
        });
        for (m, gx) in per_draw.into_iter().enumerate() {
            for k in 0..dim {
                if !gx[k].is_finite() {
                    return Err(OptError::InvalidGradient {
                        index: k,
                        value: gx[k],
                    });
                }
                g[k] += gx[k] / n;
                g[dim + k] += gx[k] * self.base[[m, k]] * theta[dim + k].exp() / n;
            }
        }
        for v in &mut g[dim..] {
            *v += 1.0;
        }
        for v in &mut g {
            *v /= self.scale;
        }
        Ok(g)
    }
}
