//! Slice-within-Gibbs MCMC on top of `mini-mcmc`.
//!
//! Every sweep updates each unconstrained coordinate in turn with a
//! univariate slice sampler (stepping out, then shrinkage). The density for
//! coordinate `i` is [`PosteriorTarget::local_log_density`] plus the
//! log-Jacobian of that coordinate when it belongs to a positive block.

use crate::errors::{OccuError, Result};
use crate::inference::{Constraint, PosteriorDraws, PosteriorTarget};
use mini_mcmc::{core::ChainRunner, distributions::Conditional, gibbs::GibbsSampler};
use ndarray::{Array2, Array3, ArrayView1, Axis, s};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

/// How multiple chains are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainMethod {
    /// All chains share one runner.
    Vectorized,
    /// One runner per chain, run one after another with seeds `seed + c`.
    Sequential,
}

impl FromStr for ChainMethod {
    type Err = OccuError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "vectorized" | "parallel" => Ok(ChainMethod::Vectorized),
            "sequential" => Ok(ChainMethod::Sequential),
            _ => Err(OccuError::InvalidOption {
                name: "chain_method",
                reason: format!(
                    "unknown chain method `{s}`; expected 'vectorized' or 'sequential'"
                ),
            }),
        }
    }
}

/// Settings for [`sample_posterior`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McmcOptions {
    /// Draws kept per chain before thinning.
    pub n_draws: usize,
    /// Warm-up sweeps discarded per chain.
    pub n_tune: usize,
    pub thinning: usize,
    pub n_chains: usize,
    pub chain_method: ChainMethod,
    pub seed: u64,
    /// Initial bracket width of the slice sampler.
    pub slice_width: f64,
    /// Cap on stepping-out expansions per update.
    pub max_slice_steps: usize,
}

impl Default for McmcOptions {
    fn default() -> Self {
        Self {
            n_draws: 1000,
            n_tune: 1000,
            thinning: 1,
            n_chains: 4,
            chain_method: ChainMethod::Vectorized,
            seed: 0,
            slice_width: 1.0,
            max_slice_steps: 32,
        }
    }
}

impl McmcOptions {
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("n_draws", self.n_draws),
            ("thinning", self.thinning),
            ("n_chains", self.n_chains),
            ("max_slice_steps", self.max_slice_steps),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(OccuError::InvalidOption {
                    name,
                    reason: "must be at least 1".into(),
                });
            }
        }
        if !(self.slice_width > 0.0 && self.slice_width.is_finite()) {
            return Err(OccuError::InvalidOption {
                name: "slice_width",
                reason: format!("must be positive and finite, got {}", self.slice_width),
            });
        }
        Ok(())
    }
}

/// Pooled draws plus what the runner reported.
#[derive(Debug, Clone, PartialEq)]
pub struct McmcRun {
    /// Chains stacked one after another, constrained scale.
    pub draws: PosteriorDraws,
    pub n_chains: usize,
    pub draws_per_chain: usize,
    /// Runner statistics, one entry per runner.
    pub run_stats: Vec<String>,
}

/// Sample `target` with one slice-sampling Gibbs sweep per iteration.
///
/// Chains start from independent uniform(−2, 2) points on the unconstrained
/// scale. The first `n_tune` sweeps are discarded; of the following
/// `n_draws`, every `thinning`-th is kept.
///
/// # Errors
/// - [`OccuError::InvalidOption`] for bad options.
/// - [`OccuError::Sampler`] with the runner's own message if it fails.
pub fn sample_posterior<T: PosteriorTarget + 'static>(
    target: Arc<T>,
    opts: &McmcOptions,
) -> Result<McmcRun> {
    opts.validate()?;
    let layout = target.layout().clone();
    let dim = layout.dim();
    let mut init_rng = ChaCha8Rng::seed_from_u64(opts.seed);
    let inits: Vec<Vec<f64>> = (0..opts.n_chains)
        .map(|_| (0..dim).map(|_| init_rng.gen_range(-2.0..2.0)).collect())
        .collect();
    debug!(
        dim,
        n_chains = opts.n_chains,
        n_tune = opts.n_tune,
        n_draws = opts.n_draws,
        thinning = opts.thinning,
        chain_method = ?opts.chain_method,
        "starting slice-within-Gibbs sampler"
    );

    let (samples, run_stats) = match opts.chain_method {
        ChainMethod::Vectorized => {
            let cond = SliceConditional::new(Arc::clone(&target), opts, opts.seed);
            let mut gibbs = GibbsSampler::new(cond, inits).set_seed(opts.seed);
            let (samples, stats) = gibbs
                .run_progress(opts.n_draws, opts.n_tune)
                .map_err(|e| OccuError::Sampler(e.to_string()))?;
            (samples, vec![stats.to_string()])
        }
        ChainMethod::Sequential => {
            let mut chains: Vec<Array3<f64>> = Vec::with_capacity(opts.n_chains);
            let mut stats = Vec::with_capacity(opts.n_chains);
            for (c, init) in inits.into_iter().enumerate() {
                let seed = opts.seed.wrapping_add(c as u64);
                let cond = SliceConditional::new(Arc::clone(&target), opts, seed);
                let mut gibbs = GibbsSampler::new(cond, vec![init]).set_seed(seed);
                let (samples, chain_stats) = gibbs
                    .run_progress(opts.n_draws, opts.n_tune)
                    .map_err(|e| OccuError::Sampler(e.to_string()))?;
                debug!(chain = c, "chain finished");
                chains.push(samples);
                stats.push(chain_stats.to_string());
            }
            let views: Vec<_> = chains.iter().map(Array3::view).collect();
            let samples = ndarray::concatenate(Axis(0), &views)
                .map_err(|e| OccuError::Sampler(e.to_string()))?;
            (samples, stats)
        }
    };

    let thinned = samples.slice(s![.., ..;opts.thinning as isize, ..]);
    let (n_chains, draws_per_chain, _) = thinned.dim();
    let mut values = Array2::zeros((n_chains * draws_per_chain, dim));
    let mut row = 0;
    for chain in thinned.outer_iter() {
        for x in chain.outer_iter() {
            let theta = layout.constrain(&x.to_vec());
            values.row_mut(row).assign(&ArrayView1::from(&theta));
            row += 1;
        }
    }
    info!(n_chains, draws_per_chain, "sampling finished");

    Ok(McmcRun {
        draws: PosteriorDraws::new(layout, values)?,
        n_chains,
        draws_per_chain,
        run_stats,
    })
}

/// Univariate slice update for one coordinate of the joint.
struct SliceConditional<T: PosteriorTarget> {
    target: Arc<T>,
    width: f64,
    max_steps: usize,
    seed: u64,
    /// Seeded on first use from `seed` and the chain's starting point, so
    /// chains cloned from one conditional draw different streams.
    rng: Option<ChaCha8Rng>,
}

impl<T: PosteriorTarget> Clone for SliceConditional<T> {
    fn clone(&self) -> Self {
        Self {
            target: Arc::clone(&self.target),
            width: self.width,
            max_steps: self.max_steps,
            seed: self.seed,
            rng: self.rng.clone(),
        }
    }
}

impl<T: PosteriorTarget> SliceConditional<T> {
    fn new(target: Arc<T>, opts: &McmcOptions, seed: u64) -> Self {
        Self {
            target,
            width: opts.slice_width,
            max_steps: opts.max_slice_steps,
            seed,
            rng: None,
        }
    }
}

impl<T: PosteriorTarget> Conditional<f64> for SliceConditional<T> {
    fn sample(&mut self, i: usize, given: &[f64]) -> f64 {
        let mut rng = self
            .rng
            .take()
            .unwrap_or_else(|| ChaCha8Rng::seed_from_u64(mix_seed(self.seed, given)));
        let x = slice_update(&*self.target, given, i, self.width, self.max_steps, &mut rng);
        self.rng = Some(rng);
        x
    }
}

fn mix_seed(seed: u64, state: &[f64]) -> u64 {
    state.iter().fold(seed ^ 0x9E37_79B9_7F4A_7C15, |h, v| {
        (h.rotate_left(17) ^ v.to_bits()).wrapping_mul(0xBF58_476D_1CE4_E5B9)
    })
}

/// One stepping-out / shrinkage slice update of coordinate `i` (Neal, 2003).
pub(crate) fn slice_update<T: PosteriorTarget + ?Sized, R: Rng>(
    target: &T,
    given: &[f64],
    i: usize,
    width: f64,
    max_steps: usize,
    rng: &mut R,
) -> f64 {
    let layout = target.layout();
    let positive = layout.constraint_at(i) == Constraint::Positive;
    let mut x = given.to_vec();
    let x0 = x[i];
    let mut log_density = |v: f64| {
        x[i] = v;
        let theta = layout.constrain(&x);
        let lp = target.local_log_density(&theta, i) + if positive { v } else { 0.0 };
        if lp.is_nan() { f64::NEG_INFINITY } else { lp }
    };

    let level = log_density(x0) + (1.0 - rng.r#gen::<f64>()).ln();
    let mut left = x0 - width * rng.r#gen::<f64>();
    let mut right = left + width;
    let mut steps_left = (max_steps as f64 * rng.r#gen::<f64>()).floor() as usize;
    let mut steps_right = (max_steps - 1).saturating_sub(steps_left);
    while steps_left > 0 && log_density(left) > level {
        left -= width;
        steps_left -= 1;
    }
    while steps_right > 0 && log_density(right) > level {
        right += width;
        steps_right -= 1;
    }

    loop {
        let proposal = left + rng.r#gen::<f64>() * (right - left);
        if log_density(proposal) > level {
            return proposal;
        }
        if proposal < x0 {
            left = proposal;
        } else {
            right = proposal;
        }
        if right - left < 1e-12 {
            return x0;
        }
    }
}
