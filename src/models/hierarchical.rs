//! Hierarchical multi-species occupancy model.
//!
//! Every species `s` has its own occupancy intercept and slopes, and its own
//! detection coefficients. Detection coefficients are partially pooled: for
//! each detection column `j`, `obs_coefs[j, s] ~ N(mean_j, sd_j)` with the
//! population mean and sd learned from all species.
//!
//! ```text
//! env_intercepts[s]          ~ N(0, env_intercept_sd)
//! env_slopes[k, s]           ~ N(0, env_slope_sd)
//! obs_coef_prior_means[j]    ~ N(0, obs_mean_prior_sd)
//! obs_coef_prior_sds[j]      ~ HalfNormal(obs_sd_prior_scale)
//! obs_coefs[j, s]            ~ N(obs_coef_prior_means[j], obs_coef_prior_sds[j])
//! ```
//!
//! The likelihood of species `s` is the checklist kernel applied to
//! `env_logit = X_env · env_slopes[:, s] + env_intercepts[s]` and
//! `obs_logit = X_obs · obs_coefs[:, s]`, summed over species. The
//! environmental design drops its intercept column since intercepts have
//! their own block.

use crate::design::{
    CovariateTable, DesignMatrixProvider, DesignMetadata, DetectionTable, INTERCEPT,
};
use crate::errors::{OccuError, Result};
use crate::inference::{Constraint, ParamLayout, PosteriorDraws, PosteriorTarget};
use crate::kernel::{CellIndex, KernelWorkspace};
use crate::models::{
    SpeciesPredictions, average_probabilities, check_paired_rows, validate_fit_inputs,
};
use crate::persist::{
    self, DESIGN_INFO_ENV_FILE, DESIGN_INFO_FILE, DESIGN_INFO_OBS_FILE, ModelKind,
};
use ndarray::{Array1, Array2, ArrayView1, Axis, s};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use statrs::distribution::{Continuous, Normal};
use std::f64::consts::LN_2;
use std::path::Path;
use tracing::info;

pub const ENV_INTERCEPTS: &str = "env_intercepts";
pub const ENV_SLOPES: &str = "env_slopes";
pub const OBS_COEFS: &str = "obs_coefs";
pub const OBS_COEF_PRIOR_MEANS: &str = "obs_coef_prior_means";
pub const OBS_COEF_PRIOR_SDS: &str = "obs_coef_prior_sds";

/// Prior scales.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HierarchicalPriors {
    pub env_intercept_sd: f64,
    pub env_slope_sd: f64,
    pub obs_mean_prior_sd: f64,
    pub obs_sd_prior_scale: f64,
}

impl Default for HierarchicalPriors {
    fn default() -> Self {
        Self {
            env_intercept_sd: 10.0,
            env_slope_sd: 1.0,
            obs_mean_prior_sd: 1.0,
            obs_sd_prior_scale: 1.0,
        }
    }
}

impl HierarchicalPriors {
    pub fn validate(&self) -> Result<()> {
        let scales = [
            ("env_intercept_sd", self.env_intercept_sd),
            ("env_slope_sd", self.env_slope_sd),
            ("obs_mean_prior_sd", self.obs_mean_prior_sd),
            ("obs_sd_prior_scale", self.obs_sd_prior_scale),
        ];
        for (name, value) in scales {
            if !(value > 0.0 && value.is_finite()) {
                return Err(OccuError::InvalidOption {
                    name,
                    reason: format!("prior scale must be positive and finite, got {value}"),
                });
            }
        }
        Ok(())
    }
}

/// Structured view of one flat parameter vector.
#[derive(Debug, Clone, PartialEq)]
pub struct HierarchicalParams {
    /// `[S]`
    pub env_intercepts: Array1<f64>,
    /// `[K_env, S]`
    pub env_slopes: Array2<f64>,
    /// `[K_obs, S]`
    pub obs_coefs: Array2<f64>,
    /// `[K_obs]`
    pub obs_coef_prior_means: Array1<f64>,
    /// `[K_obs]`, positive.
    pub obs_coef_prior_sds: Array1<f64>,
}

impl HierarchicalParams {
    /// Parameter schema for `n_species` species, `k_env` environmental
    /// slopes and `k_obs` detection columns.
    pub fn layout(n_species: usize, k_env: usize, k_obs: usize) -> Result<ParamLayout> {
        ParamLayout::new()
            .with_block(ENV_INTERCEPTS, &[n_species], Constraint::Real)?
            .with_block(ENV_SLOPES, &[k_env, n_species], Constraint::Real)?
            .with_block(OBS_COEFS, &[k_obs, n_species], Constraint::Real)?
            .with_block(OBS_COEF_PRIOR_MEANS, &[k_obs], Constraint::Real)?
            .with_block(OBS_COEF_PRIOR_SDS, &[k_obs], Constraint::Positive)
    }

    pub fn from_flat(layout: &ParamLayout, theta: ArrayView1<f64>) -> Result<Self> {
        layout.check_len(theta.len())?;
        let vector = |name: &str| -> Result<Array1<f64>> {
            Ok(theta.slice(s![layout.require(name)?.range()]).to_owned())
        };
        let matrix = |name: &str| -> Result<Array2<f64>> {
            let block = layout.require(name)?;
            let (rows, cols) = match block.shape() {
                [r, c] => (*r, *c),
                other => {
                    return Err(OccuError::InvalidLayout(format!(
                        "block `{name}` has shape {other:?}, expected two axes"
                    )));
                }
            };
            theta
                .slice(s![block.range()])
                .to_owned()
                .into_shape_with_order((rows, cols))
                .map_err(|e| OccuError::InvalidLayout(e.to_string()))
        };
        Ok(Self {
            env_intercepts: vector(ENV_INTERCEPTS)?,
            env_slopes: matrix(ENV_SLOPES)?,
            obs_coefs: matrix(OBS_COEFS)?,
            obs_coef_prior_means: vector(OBS_COEF_PRIOR_MEANS)?,
            obs_coef_prior_sds: vector(OBS_COEF_PRIOR_SDS)?,
        })
    }

    /// `n_cells × S` occupancy logits.
    pub fn env_logits(&self, x_env: &Array2<f64>) -> Array2<f64> {
        x_env.dot(&self.env_slopes) + &self.env_intercepts
    }

    /// `n_checklists × S` detection logits.
    pub fn obs_logits(&self, x_obs: &Array2<f64>) -> Array2<f64> {
        x_obs.dot(&self.obs_coefs)
    }
}

/// Posterior density of the hierarchical model for one training set.
#[derive(Debug, Clone)]
pub struct HierarchicalOccuModel {
    layout: ParamLayout,
    priors: HierarchicalPriors,
    x_env: Array2<f64>,
    x_obs: Array2<f64>,
    not_detected: Array2<f64>,
    cells: CellIndex,
}

impl HierarchicalOccuModel {
    /// `x_env` must not contain an intercept column.
    pub fn new(
        x_env: Array2<f64>,
        x_obs: Array2<f64>,
        detections: &DetectionTable,
        cells: CellIndex,
        priors: HierarchicalPriors,
    ) -> Result<Self> {
        priors.validate()?;
        if x_env.nrows() != cells.n_cells() {
            return Err(OccuError::ShapeMismatch {
                what: "environment design rows vs cells",
                expected: cells.n_cells(),
                found: x_env.nrows(),
            });
        }
        if x_obs.nrows() != cells.n_checklists() {
            return Err(OccuError::ShapeMismatch {
                what: "detection design rows vs checklists",
                expected: cells.n_checklists(),
                found: x_obs.nrows(),
            });
        }
        let layout =
            HierarchicalParams::layout(detections.n_species(), x_env.ncols(), x_obs.ncols())?;
        Ok(Self {
            layout,
            priors,
            x_env,
            x_obs,
            not_detected: detections.not_detected_matrix(),
            cells,
        })
    }

    pub fn n_species(&self) -> usize {
        self.not_detected.ncols()
    }

    pub fn params(&self, theta: &[f64]) -> Result<HierarchicalParams> {
        HierarchicalParams::from_flat(&self.layout, ArrayView1::from(theta))
    }

    fn params_or_nan(&self, theta: &[f64]) -> Option<HierarchicalParams> {
        self.params(theta).ok()
    }

    fn species_log_likelihood(
        &self,
        p: &HierarchicalParams,
        s: usize,
        ws: &mut KernelWorkspace,
    ) -> f64 {
        let env_logit = self.x_env.dot(&p.env_slopes.column(s)) + p.env_intercepts[s];
        let obs_logit = self.x_obs.dot(&p.obs_coefs.column(s));
        ws.evaluate(
            env_logit.view(),
            obs_logit.view(),
            self.not_detected.column(s),
            &self.cells,
            false,
        )
    }

    /// Prior terms that involve species `s`.
    fn species_log_prior(&self, p: &HierarchicalParams, s: usize) -> f64 {
        let intercept = normal_ln_pdf(p.env_intercepts[s], 0.0, self.priors.env_intercept_sd);
        let slopes: f64 = p
            .env_slopes
            .column(s)
            .iter()
            .map(|&b| normal_ln_pdf(b, 0.0, self.priors.env_slope_sd))
            .sum();
        let obs: f64 = p
            .obs_coefs
            .column(s)
            .iter()
            .zip(p.obs_coef_prior_means.iter().zip(&p.obs_coef_prior_sds))
            .map(|(&o, (&mu, &sd))| normal_ln_pdf(o, mu, sd))
            .sum();
        intercept + slopes + obs
    }

    /// Prior terms that involve the pooled parameters of detection column `j`.
    fn pooled_log_prior(&self, p: &HierarchicalParams, j: usize) -> f64 {
        let (mu, sd) = (p.obs_coef_prior_means[j], p.obs_coef_prior_sds[j]);
        let members: f64 = p.obs_coefs.row(j).iter().map(|&o| normal_ln_pdf(o, mu, sd)).sum();
        members
            + normal_ln_pdf(mu, 0.0, self.priors.obs_mean_prior_sd)
            + half_normal_ln_pdf(sd, self.priors.obs_sd_prior_scale)
    }
}

impl PosteriorTarget for HierarchicalOccuModel {
    fn layout(&self) -> &ParamLayout {
        &self.layout
    }

    fn log_prior(&self, theta: &[f64]) -> f64 {
        let Some(p) = self.params_or_nan(theta) else {
            return f64::NAN;
        };
        let species: f64 = (0..self.n_species()).map(|s| self.species_log_prior(&p, s)).sum();
        let pooled: f64 = p
            .obs_coef_prior_means
            .iter()
            .zip(&p.obs_coef_prior_sds)
            .map(|(&mu, &sd)| {
                normal_ln_pdf(mu, 0.0, self.priors.obs_mean_prior_sd)
                    + half_normal_ln_pdf(sd, self.priors.obs_sd_prior_scale)
            })
            .sum();
        species + pooled
    }

    fn log_likelihood(&self, theta: &[f64]) -> f64 {
        let Some(p) = self.params_or_nan(theta) else {
            return f64::NAN;
        };
        let mut ws = KernelWorkspace::new(&self.cells);
        (0..self.n_species())
            .map(|s| self.species_log_likelihood(&p, s, &mut ws))
            .sum()
    }

    fn log_prior_grad(&self, theta: &[f64]) -> Vec<f64> {
        let Some(p) = self.params_or_nan(theta) else {
            return vec![f64::NAN; theta.len()];
        };
        let n_species = self.n_species();
        let pr = &self.priors;
        let mut g = vec![0.0; self.layout.dim()];
        let offset = |name: &str| self.layout.block(name).map_or(0, |b| b.range().start);
        let (o_int, o_slope, o_obs) =
            (offset(ENV_INTERCEPTS), offset(ENV_SLOPES), offset(OBS_COEFS));
        let (o_mu, o_sd) = (offset(OBS_COEF_PRIOR_MEANS), offset(OBS_COEF_PRIOR_SDS));

        for (s, &b) in p.env_intercepts.iter().enumerate() {
            g[o_int + s] = -b / pr.env_intercept_sd.powi(2);
        }
        for ((k, s), &b) in p.env_slopes.indexed_iter() {
            g[o_slope + k * n_species + s] = -b / pr.env_slope_sd.powi(2);
        }
        let population = p.obs_coef_prior_means.iter().zip(&p.obs_coef_prior_sds);
        for (j, (&mu, &sd)) in population.enumerate() {
            let var = sd * sd;
            let mut d_mu = -mu / pr.obs_mean_prior_sd.powi(2);
            let mut d_sd = -sd / pr.obs_sd_prior_scale.powi(2);
            for s in 0..n_species {
                let r = p.obs_coefs[[j, s]] - mu;
                g[o_obs + j * n_species + s] = -r / var;
                d_mu += r / var;
                d_sd += -1.0 / sd + r * r / (var * sd);
            }
            g[o_mu + j] = d_mu;
            g[o_sd + j] = d_sd;
        }
        g
    }

    fn log_likelihood_grad(&self, theta: &[f64]) -> Vec<f64> {
        let Some(p) = self.params_or_nan(theta) else {
            return vec![f64::NAN; theta.len()];
        };
        let n_species = self.n_species();
        let mut g = vec![0.0; self.layout.dim()];
        let offset = |name: &str| self.layout.block(name).map_or(0, |b| b.range().start);
        let (o_int, o_slope, o_obs) =
            (offset(ENV_INTERCEPTS), offset(ENV_SLOPES), offset(OBS_COEFS));

        let env_logits = p.env_logits(&self.x_env);
        let obs_logits = p.obs_logits(&self.x_obs);
        let mut ws = KernelWorkspace::new(&self.cells);
        for s in 0..n_species {
            ws.evaluate(
                env_logits.column(s),
                obs_logits.column(s),
                self.not_detected.column(s),
                &self.cells,
                true,
            );
            g[o_int + s] = ws.env_grad().sum();
            for (k, v) in self.x_env.t().dot(&ws.env_grad()).iter().enumerate() {
                g[o_slope + k * n_species + s] = *v;
            }
            for (j, v) in self.x_obs.t().dot(&ws.obs_grad()).iter().enumerate() {
                g[o_obs + j * n_species + s] = *v;
            }
        }
        g
    }

    fn n_observations(&self) -> usize {
        self.cells.n_checklists() * self.n_species()
    }

    fn local_log_density(&self, theta: &[f64], coord: usize) -> f64 {
        let Some(p) = self.params_or_nan(theta) else {
            return f64::NAN;
        };
        let n_species = self.n_species();
        let block = self
            .layout
            .blocks()
            .iter()
            .find(|b| b.range().contains(&coord));
        match block {
            Some(b) if [ENV_INTERCEPTS, ENV_SLOPES, OBS_COEFS].contains(&b.name()) => {
                let s = (coord - b.range().start) % n_species;
                let mut ws = KernelWorkspace::new(&self.cells);
                self.species_log_likelihood(&p, s, &mut ws) + self.species_log_prior(&p, s)
            }
            Some(b) => self.pooled_log_prior(&p, coord - b.range().start),
            None => self.log_density(theta),
        }
    }
}

pub(crate) fn normal_ln_pdf(x: f64, mean: f64, sd: f64) -> f64 {
    Normal::new(mean, sd).map_or(f64::NEG_INFINITY, |d| d.ln_pdf(x))
}

fn half_normal_ln_pdf(x: f64, scale: f64) -> f64 {
    if x < 0.0 {
        return f64::NEG_INFINITY;
    }
    LN_2 + normal_ln_pdf(x, 0.0, scale)
}

/// Column index of the intercept in a design, if it has one.
pub(crate) fn intercept_column<M: DesignMetadata>(design: &M) -> Option<usize> {
    design.column_names().iter().position(|n| n == INTERCEPT)
}

/// Remove column `column` from `x`, if given.
pub(crate) fn drop_column(x: Array2<f64>, column: Option<usize>) -> Array2<f64> {
    match column {
        Some(j) => {
            let keep: Vec<usize> = (0..x.ncols()).filter(|&c| c != j).collect();
            x.select(Axis(1), &keep)
        }
        None => x,
    }
}

/// Slope names of an environmental design (intercept removed).
pub(crate) fn env_slope_names<M: DesignMetadata>(design: &M) -> Vec<String> {
    design
        .column_names()
        .iter()
        .filter(|n| n.as_str() != INTERCEPT)
        .cloned()
        .collect()
}

/// Metadata stored next to posterior draws.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BayesianMetadata<D> {
    pub species_names: Vec<String>,
    pub env_coef_names: Vec<String>,
    pub obs_coef_names: Vec<String>,
    pub env_formula: String,
    pub obs_formula: String,
    pub priors: HierarchicalPriors,
    pub diagnostics: D,
}

/// Everything a fitted hierarchical model needs for prediction.
#[derive(Debug, Clone)]
pub struct BayesianFit<M> {
    pub env_design: M,
    pub obs_design: M,
    pub species_names: Vec<String>,
    pub draws: PosteriorDraws,
}

/// Build designs and the posterior target from raw tables.
#[allow(clippy::too_many_arguments)]
pub(crate) fn prepare_target<P: DesignMatrixProvider>(
    provider: &P,
    env_formula: &str,
    obs_formula: &str,
    priors: HierarchicalPriors,
    env: &CovariateTable,
    checklists: &CovariateTable,
    detections: &DetectionTable,
    cell_ids: &[usize],
) -> Result<(HierarchicalOccuModel, P::Metadata, P::Metadata)> {
    let cells = validate_fit_inputs(env, checklists, detections, cell_ids)?;
    let (x_env, env_design) = provider.build(env_formula, env)?;
    let (x_obs, obs_design) = provider.build(obs_formula, checklists)?;
    let x_env = drop_column(x_env, intercept_column(&env_design));
    info!(
        n_species = detections.n_species(),
        n_cells = cells.n_cells(),
        n_checklists = cells.n_checklists(),
        env_slopes = x_env.ncols(),
        obs_columns = x_obs.ncols(),
        "building hierarchical occupancy model"
    );
    let target = HierarchicalOccuModel::new(x_env, x_obs, detections, cells, priors)?;
    Ok((target, env_design, obs_design))
}

impl<M: DesignMetadata> BayesianFit<M> {
    fn env_matrix<P: DesignMatrixProvider<Metadata = M>>(
        &self,
        provider: &P,
        env: &CovariateTable,
    ) -> Result<Array2<f64>> {
        let x = provider.apply(&self.env_design, env)?;
        Ok(drop_column(x, intercept_column(&self.env_design)))
    }

    fn draw_params(&self, d: usize) -> Result<HierarchicalParams> {
        HierarchicalParams::from_flat(self.draws.layout(), self.draws.draw(d))
    }

    /// Decode every draw once so the averaging loop cannot fail.
    fn all_params(&self) -> Result<Vec<HierarchicalParams>> {
        (0..self.draws.n_draws()).map(|d| self.draw_params(d)).collect()
    }

    pub(crate) fn predict_direct<P: DesignMatrixProvider<Metadata = M>>(
        &self,
        provider: &P,
        env: &CovariateTable,
    ) -> Result<SpeciesPredictions> {
        let x_env = self.env_matrix(provider, env)?;
        let params = self.all_params()?;
        let shape = (x_env.nrows(), self.species_names.len());
        let probabilities =
            average_probabilities(params.len(), shape, |d| (params[d].env_logits(&x_env), None));
        Ok(SpeciesPredictions {
            species: self.species_names.clone(),
            probabilities,
        })
    }

    pub(crate) fn predict_obs<P: DesignMatrixProvider<Metadata = M>>(
        &self,
        provider: &P,
        env: &CovariateTable,
        checklists: &CovariateTable,
    ) -> Result<SpeciesPredictions> {
        check_paired_rows(env, checklists)?;
        let x_env = self.env_matrix(provider, env)?;
        let x_obs = provider.apply(&self.obs_design, checklists)?;
        let params = self.all_params()?;
        let shape = (x_env.nrows(), self.species_names.len());
        let probabilities = average_probabilities(params.len(), shape, |d| {
            (params[d].env_logits(&x_env), Some(params[d].obs_logits(&x_obs)))
        });
        Ok(SpeciesPredictions {
            species: self.species_names.clone(),
            probabilities,
        })
    }
}

impl<M: DesignMetadata + Serialize + DeserializeOwned> BayesianFit<M> {
    pub(crate) fn save<D: Serialize>(
        &self,
        dir: &Path,
        kind: ModelKind,
        draws_file: &str,
        priors: HierarchicalPriors,
        diagnostics: &D,
    ) -> Result<()> {
        persist::prepare_dir(dir)?;
        persist::save_json_safely(&self.draws, &dir.join(draws_file))?;
        let metadata = BayesianMetadata {
            species_names: self.species_names.clone(),
            env_coef_names: env_slope_names(&self.env_design),
            obs_coef_names: self.obs_design.column_names().to_vec(),
            env_formula: self.env_design.formula().to_string(),
            obs_formula: self.obs_design.formula().to_string(),
            priors,
            diagnostics,
        };
        persist::save_json_safely(&metadata, &dir.join(DESIGN_INFO_FILE))?;
        persist::save_json_safely(&self.env_design, &dir.join(DESIGN_INFO_ENV_FILE))?;
        persist::save_json_safely(&self.obs_design, &dir.join(DESIGN_INFO_OBS_FILE))?;
        persist::finish_dir(dir, kind, self.species_names.len())?;
        info!(path = %dir.display(), n_draws = self.draws.n_draws(), "saved posterior draws");
        Ok(())
    }

    /// Load and cross-check an artifact directory written by [`save`](Self::save).
    pub(crate) fn restore<D: DeserializeOwned>(
        dir: &Path,
        kind: ModelKind,
        draws_file: &str,
    ) -> Result<(Self, BayesianMetadata<D>)> {
        let manifest = persist::expect_kind(dir, kind)?;
        let metadata: BayesianMetadata<D> = persist::load_json(&dir.join(DESIGN_INFO_FILE))?;
        let env_design: M = persist::load_json(&dir.join(DESIGN_INFO_ENV_FILE))?;
        let obs_design: M = persist::load_json(&dir.join(DESIGN_INFO_OBS_FILE))?;
        let draws: PosteriorDraws = persist::load_json(&dir.join(draws_file))?;

        if metadata.species_names.is_empty() {
            return Err(OccuError::restore(dir, "no species recorded"));
        }
        if metadata.species_names.len() != manifest.n_species {
            return Err(OccuError::restore(
                dir,
                "species names disagree with the manifest species count",
            ));
        }
        if metadata.env_coef_names != env_slope_names(&env_design)
            || metadata.obs_coef_names != obs_design.column_names()
        {
            return Err(OccuError::restore(
                dir,
                "coefficient names do not match the stored designs",
            ));
        }
        let expected = HierarchicalParams::layout(
            metadata.species_names.len(),
            metadata.env_coef_names.len(),
            metadata.obs_coef_names.len(),
        )?;
        if *draws.layout() != expected {
            return Err(OccuError::restore(
                dir,
                "draw blocks do not match species count and design widths",
            ));
        }
        if draws.n_draws() == 0 {
            return Err(OccuError::restore(dir, "no posterior draws"));
        }
        let fit = Self {
            env_design,
            obs_design,
            species_names: metadata.species_names.clone(),
            draws,
        };
        Ok((fit, metadata))
    }
}
