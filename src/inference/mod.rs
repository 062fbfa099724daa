//! Posterior inference over named parameter blocks.
//!
//! A model describes its parameters with a [`ParamLayout`] and exposes
//! prior and likelihood densities through [`PosteriorTarget`]. The two
//! engines in this module only ever see that contract:
//!
//! - [`advi::fit_advi`]: mean-field Gaussian variational approximation in
//!   unconstrained space, maximized with L-BFGS.
//! - [`mcmc::sample_posterior`]: slice-within-Gibbs sampling driven by
//!   `mini-mcmc`.
//!
//! Both return [`PosteriorDraws`] on the constrained scale.

pub mod advi;
pub mod mcmc;

pub use self::advi::{AdviDiagnostics, AdviOptions, fit_advi};
pub use self::mcmc::{ChainMethod, McmcOptions, McmcRun, sample_posterior};

use crate::errors::{OccuError, Result};
use ndarray::{Array2, ArrayView1, ArrayView2, s};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Support of a parameter block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Constraint {
    Real,
    /// Strictly positive; sampled as `log θ`.
    Positive,
}

/// One named block in a flat parameter vector, stored row-major.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamBlock {
    name: String,
    shape: Vec<usize>,
    constraint: Constraint,
    offset: usize,
}

impl ParamBlock {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn constraint(&self) -> Constraint {
        self.constraint
    }

    pub fn size(&self) -> usize {
        self.shape.iter().product()
    }

    /// Position of the block inside the flat vector.
    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.size()
    }
}

/// Ordered parameter schema.
///
/// ```
/// use occu::inference::{Constraint, ParamLayout};
///
/// let layout = ParamLayout::new()
///     .with_block("slopes", &[2, 3], Constraint::Real)?
///     .with_block("scale", &[2], Constraint::Positive)?;
/// assert_eq!(layout.dim(), 8);
/// assert_eq!(layout.block("scale").map(|b| b.range()), Some(6..8));
/// # Ok::<(), occu::OccuError>(())
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamLayout {
    blocks: Vec<ParamBlock>,
    dim: usize,
}

impl ParamLayout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a block after the existing ones.
    ///
    /// # Errors
    /// [`OccuError::InvalidLayout`] if the name is empty or already used.
    pub fn with_block(
        mut self,
        name: &str,
        shape: &[usize],
        constraint: Constraint,
    ) -> Result<Self> {
        if name.is_empty() {
            return Err(OccuError::InvalidLayout("empty block name".into()));
        }
        if self.block(name).is_some() {
            return Err(OccuError::InvalidLayout(format!("duplicate block `{name}`")));
        }
        let block = ParamBlock {
            name: name.to_string(),
            shape: shape.to_vec(),
            constraint,
            offset: self.dim,
        };
        self.dim += block.size();
        self.blocks.push(block);
        Ok(self)
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn blocks(&self) -> &[ParamBlock] {
        &self.blocks
    }

    pub fn block(&self, name: &str) -> Option<&ParamBlock> {
        self.blocks.iter().find(|b| b.name == name)
    }

    /// Like [`block`](Self::block) but missing names are an error.
    pub fn require(&self, name: &str) -> Result<&ParamBlock> {
        self.block(name)
            .ok_or_else(|| OccuError::InvalidLayout(format!("no block named `{name}`")))
    }

    /// Constraint of the coordinate at flat index `i`.
    pub fn constraint_at(&self, i: usize) -> Constraint {
        self.blocks
            .iter()
            .find(|b| b.range().contains(&i))
            .map_or(Constraint::Real, |b| b.constraint)
    }

    pub fn check_len(&self, len: usize) -> Result<()> {
        if len != self.dim {
            return Err(OccuError::ShapeMismatch {
                what: "flat parameter vector",
                expected: self.dim,
                found: len,
            });
        }
        Ok(())
    }

    fn positive_ranges(&self) -> impl Iterator<Item = Range<usize>> + '_ {
        self.blocks
            .iter()
            .filter(|b| b.constraint == Constraint::Positive)
            .map(ParamBlock::range)
    }

    /// Map an unconstrained vector to the constrained scale.
    pub fn constrain(&self, x: &[f64]) -> Vec<f64> {
        let mut theta = x.to_vec();
        for range in self.positive_ranges() {
            for v in &mut theta[range] {
                *v = v.exp();
            }
        }
        theta
    }

    /// Inverse of [`constrain`](Self::constrain).
    ///
    /// # Errors
    /// [`OccuError::InvalidLayout`] if a positive entry is not `> 0`.
    pub fn unconstrain(&self, theta: &[f64]) -> Result<Vec<f64>> {
        self.check_len(theta.len())?;
        let mut x = theta.to_vec();
        for range in self.positive_ranges() {
            for (i, v) in x[range.clone()].iter_mut().enumerate() {
                if !(*v > 0.0) {
                    return Err(OccuError::InvalidLayout(format!(
                        "positive parameter at index {} is {v}",
                        range.start + i
                    )));
                }
                *v = v.ln();
            }
        }
        Ok(x)
    }

    /// `log |det ∂θ/∂x|`, i.e. the sum of the unconstrained positive entries.
    pub fn log_det_jacobian(&self, x: &[f64]) -> f64 {
        self.positive_ranges().map(|r| x[r].iter().sum::<f64>()).sum()
    }

    /// Gradient of `log p(constrain(x)) + log_det_jacobian(x)` with respect
    /// to `x`, given `theta = constrain(x)` and `∇_θ log p(θ)`.
    pub fn unconstrained_grad(&self, theta: &[f64], grad_theta: &[f64]) -> Vec<f64> {
        let mut g = grad_theta.to_vec();
        for range in self.positive_ranges() {
            for i in range {
                g[i] = g[i] * theta[i] + 1.0;
            }
        }
        g
    }
}

/// Unnormalized posterior over constrained parameters.
///
/// Implementors evaluate densities at a flat vector laid out by
/// [`layout`](Self::layout). Values may be `-inf` outside the support but
/// never NaN for finite inputs.
pub trait PosteriorTarget: Send + Sync {
    fn layout(&self) -> &ParamLayout;
    fn log_prior(&self, theta: &[f64]) -> f64;
    fn log_likelihood(&self, theta: &[f64]) -> f64;
    fn log_prior_grad(&self, theta: &[f64]) -> Vec<f64>;
    fn log_likelihood_grad(&self, theta: &[f64]) -> Vec<f64>;

    /// Number of observations behind the likelihood; the variational
    /// objective is divided by it.
    fn n_observations(&self) -> usize;

    fn log_density(&self, theta: &[f64]) -> f64 {
        self.log_prior(theta) + self.log_likelihood(theta)
    }

    fn log_density_grad(&self, theta: &[f64]) -> Vec<f64> {
        let mut g = self.log_prior_grad(theta);
        for (a, b) in g.iter_mut().zip(self.log_likelihood_grad(theta)) {
            *a += b;
        }
        g
    }

    /// Log density up to terms that do not depend on coordinate `coord`.
    ///
    /// Coordinate-wise samplers call this once per proposal; models with
    /// separable structure override it to skip unrelated work.
    fn local_log_density(&self, theta: &[f64], coord: usize) -> f64 {
        let _ = coord;
        self.log_density(theta)
    }
}

/// Log density of the unconstrained vector `x`, Jacobian included.
pub fn unconstrained_log_density<T: PosteriorTarget + ?Sized>(target: &T, x: &[f64]) -> f64 {
    let layout = target.layout();
    let theta = layout.constrain(x);
    target.log_density(&theta) + layout.log_det_jacobian(x)
}

/// Value and gradient of [`unconstrained_log_density`].
pub fn unconstrained_log_density_grad<T: PosteriorTarget + ?Sized>(
    target: &T,
    x: &[f64],
) -> (f64, Vec<f64>) {
    let layout = target.layout();
    let theta = layout.constrain(x);
    let value = target.log_density(&theta) + layout.log_det_jacobian(x);
    let grad = layout.unconstrained_grad(&theta, &target.log_density_grad(&theta));
    (value, grad)
}

/// Posterior draws on the constrained scale, one row per draw.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PosteriorDraws {
    layout: ParamLayout,
    values: Array2<f64>,
}

impl PosteriorDraws {
    /// # Errors
    /// [`OccuError::ShapeMismatch`] if `values` does not have `layout.dim()`
    /// columns.
    pub fn new(layout: ParamLayout, values: Array2<f64>) -> Result<Self> {
        layout.check_len(values.ncols())?;
        Ok(Self { layout, values })
    }

    pub fn layout(&self) -> &ParamLayout {
        &self.layout
    }

    pub fn n_draws(&self) -> usize {
        self.values.nrows()
    }

    pub fn values(&self) -> ArrayView2<'_, f64> {
        self.values.view()
    }

    pub fn draw(&self, i: usize) -> ArrayView1<'_, f64> {
        self.values.row(i)
    }

    /// Columns of one block, `n_draws × block.size()`.
    pub fn block(&self, name: &str) -> Result<ArrayView2<'_, f64>> {
        let range = self.layout.require(name)?.range();
        Ok(self.values.slice(s![.., range]))
    }

    /// Posterior mean of every flat coordinate.
    pub fn mean(&self) -> Vec<f64> {
        self.values
            .mean_axis(ndarray::Axis(0))
            .map_or_else(|| vec![f64::NAN; self.layout.dim()], |m| m.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn layout() -> ParamLayout {
        ParamLayout::new()
            .with_block("a", &[2], Constraint::Real)
            .unwrap()
            .with_block("s", &[2], Constraint::Positive)
            .unwrap()
    }

    #[test]
    fn duplicate_block_names_are_rejected() {
        let err = layout().with_block("a", &[1], Constraint::Real).unwrap_err();
        assert!(matches!(err, OccuError::InvalidLayout(_)));
    }

    #[test]
    fn constrain_round_trips_positive_blocks() {
        let l = layout();
        let x = vec![0.3, -1.0, 0.5, -2.0];
        let theta = l.constrain(&x);
        assert_eq!(theta[..2], x[..2]);
        assert_abs_diff_eq!(theta[2], 0.5f64.exp());
        let back = l.unconstrain(&theta).unwrap();
        for (a, b) in back.iter().zip(&x) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-12);
        }
        assert_abs_diff_eq!(l.log_det_jacobian(&x), -1.5);
        assert!(l.unconstrain(&[0.0, 0.0, 1.0, 0.0]).is_err());
    }

    #[test]
    fn constraint_lookup_by_index() {
        let l = layout();
        assert_eq!(l.constraint_at(1), Constraint::Real);
        assert_eq!(l.constraint_at(3), Constraint::Positive);
    }

    /// θ_s ~ Exponential(1) on a single positive block, no likelihood.
    struct Exponential {
        layout: ParamLayout,
    }

    impl PosteriorTarget for Exponential {
        fn layout(&self) -> &ParamLayout {
            &self.layout
        }
        fn log_prior(&self, theta: &[f64]) -> f64 {
            -theta[0]
        }
        fn log_likelihood(&self, _: &[f64]) -> f64 {
            0.0
        }
        fn log_prior_grad(&self, _: &[f64]) -> Vec<f64> {
            vec![-1.0]
        }
        fn log_likelihood_grad(&self, _: &[f64]) -> Vec<f64> {
            vec![0.0]
        }
        fn n_observations(&self) -> usize {
            1
        }
    }

    #[test]
    fn unconstrained_gradient_includes_jacobian() {
        let target = Exponential {
            layout: ParamLayout::new()
                .with_block("rate", &[1], Constraint::Positive)
                .unwrap(),
        };
        let x = [0.4];
        let (v, g) = unconstrained_log_density_grad(&target, &x);
        assert_abs_diff_eq!(v, -(0.4f64.exp()) + 0.4);
        let h = 1e-6;
        let fd = (unconstrained_log_density(&target, &[0.4 + h])
            - unconstrained_log_density(&target, &[0.4 - h]))
            / (2.0 * h);
        assert_abs_diff_eq!(g[0], fd, epsilon = 1e-6);
    }

    #[test]
    fn draws_expose_blocks() {
        let values = array![[1.0, 2.0, 3.0, 4.0], [5.0, 6.0, 7.0, 8.0]];
        let draws = PosteriorDraws::new(layout(), values).unwrap();
        assert_eq!(draws.block("s").unwrap(), array![[3.0, 4.0], [7.0, 8.0]]);
        assert_eq!(draws.mean(), vec![3.0, 4.0, 5.0, 6.0]);
        assert!(draws.block("missing").is_err());
        assert!(PosteriorDraws::new(layout(), Array2::zeros((1, 3))).is_err());
    }
}
