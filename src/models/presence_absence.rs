//! Bayesian logistic regression for site-level presence/absence.
//!
//! One observation per site, no detection process:
//! `y_i ~ Bernoulli(σ(x_i · beta_env + intercept))` with
//! `beta_env ~ N(0, prior_sd)` and `intercept ~ N(0, intercept_prior_sd)`.
//! Fitted with the same variational engine as the occupancy models.

use crate::design::{CovariateTable, DesignMatrixProvider, DesignMetadata, FormulaDesign};
use crate::errors::{OccuError, Result};
use crate::inference::{
    AdviDiagnostics, AdviOptions, Constraint, ParamLayout, PosteriorDraws, PosteriorTarget,
    fit_advi,
};
use crate::link::{log_sigmoid, sigmoid};
use crate::models::average_probabilities;
use crate::models::hierarchical::{drop_column, env_slope_names, intercept_column, normal_ln_pdf};
use crate::persist::{self, DESIGN_INFO_ENV_FILE, DESIGN_INFO_FILE, DRAWS_FILE, ModelKind};
use ndarray::{Array1, Array2, ArrayView1, Axis, s};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

const BETA_ENV: &str = "beta_env";
const INTERCEPT: &str = "intercept";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct PresenceAbsenceMetadata {
    formula: String,
    coef_names: Vec<String>,
    prior_sd: f64,
    intercept_prior_sd: f64,
    diagnostics: AdviDiagnostics,
}

#[derive(Debug, Clone)]
struct PresenceAbsenceFit<M> {
    design: M,
    draws: PosteriorDraws,
    diagnostics: AdviDiagnostics,
}

/// Log posterior of the logistic presence/absence model.
#[derive(Debug, Clone)]
struct LogisticTarget {
    layout: ParamLayout,
    x: Array2<f64>,
    y: Array1<f64>,
    prior_sd: f64,
    intercept_prior_sd: f64,
}

impl LogisticTarget {
    fn logits(&self, theta: &[f64]) -> Array1<f64> {
        let k = self.x.ncols();
        self.x.dot(&ArrayView1::from(&theta[..k])) + theta[k]
    }
}

impl PosteriorTarget for LogisticTarget {
    fn layout(&self) -> &ParamLayout {
        &self.layout
    }

    fn log_prior(&self, theta: &[f64]) -> f64 {
        let (beta, intercept) = theta.split_at(self.x.ncols());
        beta.iter().map(|&b| normal_ln_pdf(b, 0.0, self.prior_sd)).sum::<f64>()
            + normal_ln_pdf(intercept[0], 0.0, self.intercept_prior_sd)
    }

    fn log_likelihood(&self, theta: &[f64]) -> f64 {
        self.logits(theta)
            .iter()
            .zip(&self.y)
            .map(|(&eta, &y)| y * log_sigmoid(eta) + (1.0 - y) * log_sigmoid(-eta))
            .sum()
    }

    fn log_prior_grad(&self, theta: &[f64]) -> Vec<f64> {
        let k = self.x.ncols();
        let mut g: Vec<f64> = theta[..k].iter().map(|b| -b / self.prior_sd.powi(2)).collect();
        g.push(-theta[k] / self.intercept_prior_sd.powi(2));
        g
    }

    fn log_likelihood_grad(&self, theta: &[f64]) -> Vec<f64> {
        let residual = &self.y - &self.logits(theta).mapv(sigmoid);
        let mut g = self.x.t().dot(&residual).to_vec();
        g.push(residual.sum());
        g
    }

    fn n_observations(&self) -> usize {
        self.y.len()
    }
}

/// Presence/absence model fitted with mean-field ADVI.
///
/// ```no_run
/// use occu::models::PresenceAbsenceAdvi;
/// # use occu::design::CovariateTable;
/// # fn sites() -> (CovariateTable, Vec<f64>) { unimplemented!() }
///
/// let (sites, present) = sites();
/// let mut model = PresenceAbsenceAdvi::new("~ scale(rainfall)");
/// model.fit(&sites, &present)?;
/// let p = model.predict(&sites)?;
/// # Ok::<(), occu::OccuError>(())
/// ```
#[derive(Debug, Clone)]
pub struct PresenceAbsenceAdvi<P: DesignMatrixProvider = FormulaDesign> {
    formula: String,
    prior_sd: f64,
    intercept_prior_sd: f64,
    options: AdviOptions,
    provider: P,
    fitted: Option<PresenceAbsenceFit<P::Metadata>>,
}

impl PresenceAbsenceAdvi<FormulaDesign> {
    pub fn new(formula: impl Into<String>) -> Self {
        Self::with_provider(formula, FormulaDesign)
    }
}

impl<P: DesignMatrixProvider> PresenceAbsenceAdvi<P> {
    pub fn with_provider(formula: impl Into<String>, provider: P) -> Self {
        Self {
            formula: formula.into(),
            prior_sd: 1.0,
            intercept_prior_sd: 10.0,
            options: AdviOptions {
                m: 100,
                ..AdviOptions::default()
            },
            provider,
            fitted: None,
        }
    }

    pub fn with_options(mut self, options: AdviOptions) -> Self {
        self.options = options;
        self
    }

    /// Prior scales of the slopes and of the intercept.
    pub fn with_prior_sds(mut self, prior_sd: f64, intercept_prior_sd: f64) -> Self {
        self.prior_sd = prior_sd;
        self.intercept_prior_sd = intercept_prior_sd;
        self
    }

    pub fn formula(&self) -> &str {
        &self.formula
    }

    pub fn draws(&self) -> Result<&PosteriorDraws> {
        Ok(&self.fitted()?.draws)
    }

    pub fn diagnostics(&self) -> Result<&AdviDiagnostics> {
        Ok(&self.fitted()?.diagnostics)
    }

    fn fitted(&self) -> Result<&PresenceAbsenceFit<P::Metadata>> {
        self.fitted.as_ref().ok_or(OccuError::NotFitted)
    }

    fn check_prior_sds(&self) -> Result<()> {
        let scales = [
            ("prior_sd", self.prior_sd),
            ("intercept_prior_sd", self.intercept_prior_sd),
        ];
        for (name, value) in scales {
            if !(value > 0.0 && value.is_finite()) {
                return Err(OccuError::InvalidOption {
                    name,
                    reason: format!("must be positive and finite, got {value}"),
                });
            }
        }
        Ok(())
    }

    fn slopes_matrix(&self, design: &P::Metadata, sites: &CovariateTable) -> Result<Array2<f64>> {
        let x = self.provider.apply(design, sites)?;
        Ok(drop_column(x, intercept_column(design)))
    }

    /// Fit to one 0/1 outcome per row of `sites`.
    pub fn fit(&mut self, sites: &CovariateTable, present: &[f64]) -> Result<()> {
        self.options.validate()?;
        self.check_prior_sds()?;
        if present.len() != sites.n_rows() {
            return Err(OccuError::ShapeMismatch {
                what: "presence outcomes vs site rows",
                expected: sites.n_rows(),
                found: present.len(),
            });
        }
        if let Some((checklist, &value)) = present
            .iter()
            .enumerate()
            .find(|&(_, &v)| v != 0.0 && v != 1.0)
        {
            return Err(OccuError::InvalidDetection {
                species: "presence".into(),
                checklist,
                value,
            });
        }

        let (x, design) = self.provider.build(&self.formula, sites)?;
        let x = drop_column(x, intercept_column(&design));
        let layout = presence_layout(x.ncols())?;
        info!(n_sites = x.nrows(), n_slopes = x.ncols(), "fitting presence/absence model");
        let target = LogisticTarget {
            layout,
            x,
            y: Array1::from(present.to_vec()),
            prior_sd: self.prior_sd,
            intercept_prior_sd: self.intercept_prior_sd,
        };
        let (draws, diagnostics) = fit_advi(&target, &self.options)?;
        self.fitted = Some(PresenceAbsenceFit {
            design,
            draws,
            diagnostics,
        });
        Ok(())
    }

    /// Posterior mean presence probability for every row of `sites`.
    pub fn predict(&self, sites: &CovariateTable) -> Result<Array1<f64>> {
        let fitted = self.fitted()?;
        let x = self.slopes_matrix(&fitted.design, sites)?;
        let beta = fitted.draws.block(BETA_ENV)?;
        let intercept = fitted.draws.block(INTERCEPT)?;
        let probabilities = average_probabilities(fitted.draws.n_draws(), (x.nrows(), 1), |d| {
            let logits = x.dot(&beta.row(d)) + intercept[[d, 0]];
            (logits.insert_axis(Axis(1)), None)
        });
        Ok(probabilities.slice_move(s![.., 0]))
    }

    pub fn save_model(&self, dir: &Path) -> Result<()> {
        let fitted = self.fitted()?;
        persist::prepare_dir(dir)?;
        persist::save_json_safely(&fitted.draws, &dir.join(DRAWS_FILE))?;
        let metadata = PresenceAbsenceMetadata {
            formula: self.formula.clone(),
            coef_names: env_slope_names(&fitted.design),
            prior_sd: self.prior_sd,
            intercept_prior_sd: self.intercept_prior_sd,
            diagnostics: fitted.diagnostics.clone(),
        };
        persist::save_json_safely(&metadata, &dir.join(DESIGN_INFO_FILE))?;
        persist::save_json_safely(&fitted.design, &dir.join(DESIGN_INFO_ENV_FILE))?;
        persist::finish_dir(dir, ModelKind::PresenceAbsence, 1)?;
        info!(path = %dir.display(), "saved presence/absence model");
        Ok(())
    }
}

impl<P: DesignMatrixProvider + Default> PresenceAbsenceAdvi<P> {
    pub fn restore_model(dir: &Path) -> Result<Self> {
        persist::expect_kind(dir, ModelKind::PresenceAbsence)?;
        let metadata: PresenceAbsenceMetadata = persist::load_json(&dir.join(DESIGN_INFO_FILE))?;
        let design: P::Metadata = persist::load_json(&dir.join(DESIGN_INFO_ENV_FILE))?;
        let draws: PosteriorDraws = persist::load_json(&dir.join(DRAWS_FILE))?;
        if metadata.coef_names != env_slope_names(&design) {
            return Err(OccuError::restore(dir, "slope names do not match the stored design"));
        }
        if *draws.layout() != presence_layout(metadata.coef_names.len())? {
            return Err(OccuError::restore(dir, "draw blocks do not match the design width"));
        }
        let options = AdviOptions {
            m: metadata.diagnostics.n_components,
            n_draws: draws.n_draws(),
            ..AdviOptions::default()
        };
        let mut model = Self::with_provider(design.formula().to_string(), P::default())
            .with_prior_sds(metadata.prior_sd, metadata.intercept_prior_sd)
            .with_options(options);
        model.fitted = Some(PresenceAbsenceFit {
            design,
            draws,
            diagnostics: metadata.diagnostics,
        });
        Ok(model)
    }
}

fn presence_layout(n_slopes: usize) -> Result<ParamLayout> {
    ParamLayout::new()
        .with_block(BETA_ENV, &[n_slopes], Constraint::Real)?
        .with_block(INTERCEPT, &[1], Constraint::Real)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::{unconstrained_log_density, unconstrained_log_density_grad};
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn sites() -> (CovariateTable, Vec<f64>) {
        let rain: Vec<f64> = (0..60).map(|i| i as f64 / 10.0 - 3.0).collect();
        let present = rain
            .iter()
            .enumerate()
            .map(|(i, &r)| f64::from(r + 0.7 * ((i * 7) % 5) as f64 - 1.4 > 0.0))
            .collect();
        (CovariateTable::with_rows(60).with_numeric("rain", rain).unwrap(), present)
    }

    #[test]
    fn logistic_gradient_matches_finite_differences() {
        let target = LogisticTarget {
            layout: presence_layout(2).unwrap(),
            x: array![[0.5, 1.0], [-1.0, 0.3], [2.0, -0.7]],
            y: array![1.0, 0.0, 1.0],
            prior_sd: 1.0,
            intercept_prior_sd: 10.0,
        };
        let x = vec![0.2, -0.4, 0.1];
        let (_, g) = unconstrained_log_density_grad(&target, &x);
        let h = 1e-6;
        for k in 0..x.len() {
            let (mut up, mut dn) = (x.clone(), x.clone());
            up[k] += h;
            dn[k] -= h;
            let fd = (unconstrained_log_density(&target, &up)
                - unconstrained_log_density(&target, &dn))
                / (2.0 * h);
            assert_abs_diff_eq!(g[k], fd, epsilon = 1e-6);
        }
    }

    #[test]
    fn presence_rises_with_rainfall() {
        let (sites, present) = sites();
        let mut model = PresenceAbsenceAdvi::new("~ rain").with_options(AdviOptions {
            m: 10,
            n_draws: 200,
            ..AdviOptions::default()
        });
        model.fit(&sites, &present).unwrap();
        let p = model.predict(&sites).unwrap();
        assert_eq!(p.len(), 60);
        assert!(p[59] > 0.8);
        assert!(p[0] < 0.2);
        assert_eq!(model.draws().unwrap().block(BETA_ENV).unwrap().ncols(), 1);
    }

    #[test]
    fn outcomes_must_be_binary_and_aligned() {
        let (sites, mut present) = sites();
        let mut model = PresenceAbsenceAdvi::new("~ rain");
        assert!(matches!(
            model.fit(&sites, &present[..10]),
            Err(OccuError::ShapeMismatch { .. })
        ));
        present[3] = 0.5;
        assert!(matches!(
            model.fit(&sites, &present),
            Err(OccuError::InvalidDetection { checklist: 3, .. })
        ));
    }

    #[test]
    fn save_and_restore_keep_predictions() {
        let (sites, present) = sites();
        let mut model = PresenceAbsenceAdvi::new("~ rain").with_options(AdviOptions {
            m: 5,
            n_draws: 50,
            ..AdviOptions::default()
        });
        model.fit(&sites, &present).unwrap();
        let dir = tempfile::tempdir().unwrap();
        model.save_model(dir.path()).unwrap();
        let restored = PresenceAbsenceAdvi::<FormulaDesign>::restore_model(dir.path()).unwrap();
        let (before, after) = (model.predict(&sites).unwrap(), restored.predict(&sites).unwrap());
        for (a, b) in before.iter().zip(&after) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-12);
        }
    }
}
