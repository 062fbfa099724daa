//! Hierarchical multi-species occupancy model fitted with mean-field ADVI.

use crate::design::{CovariateTable, DesignMatrixProvider, DetectionTable, FormulaDesign};
use crate::errors::{OccuError, Result};
use crate::inference::{AdviDiagnostics, AdviOptions, PosteriorDraws, fit_advi};
use crate::models::hierarchical::{BayesianFit, HierarchicalPriors, prepare_target};
use crate::models::{ChecklistModel, SpeciesPredictions};
use crate::persist::{DRAWS_FILE, ModelKind};
use std::path::Path;

#[derive(Debug, Clone)]
struct AdviFit<M> {
    fit: BayesianFit<M>,
    diagnostics: AdviDiagnostics,
}

/// Multi-species model with partially pooled detection coefficients and a
/// mean-field normal approximation to the posterior.
///
/// Predictions average over [`AdviOptions::n_draws`] draws from the fitted
/// approximation.
#[derive(Debug, Clone)]
pub struct MultiSpeciesOccuAdvi<P: DesignMatrixProvider = FormulaDesign> {
    env_formula: String,
    obs_formula: String,
    priors: HierarchicalPriors,
    options: AdviOptions,
    provider: P,
    fitted: Option<AdviFit<P::Metadata>>,
}

impl MultiSpeciesOccuAdvi<FormulaDesign> {
    pub fn new(env_formula: impl Into<String>, obs_formula: impl Into<String>) -> Self {
        Self::with_provider(env_formula, obs_formula, FormulaDesign)
    }
}

impl<P: DesignMatrixProvider> MultiSpeciesOccuAdvi<P> {
    pub fn with_provider(
        env_formula: impl Into<String>,
        obs_formula: impl Into<String>,
        provider: P,
    ) -> Self {
        Self {
            env_formula: env_formula.into(),
            obs_formula: obs_formula.into(),
            priors: HierarchicalPriors::default(),
            options: AdviOptions::default(),
            provider,
            fitted: None,
        }
    }

    pub fn with_options(mut self, options: AdviOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_priors(mut self, priors: HierarchicalPriors) -> Self {
        self.priors = priors;
        self
    }

    pub fn options(&self) -> &AdviOptions {
        &self.options
    }

    pub fn priors(&self) -> &HierarchicalPriors {
        &self.priors
    }

    /// Draws from the fitted approximation, constrained scale.
    pub fn draws(&self) -> Result<&PosteriorDraws> {
        Ok(&self.fitted()?.fit.draws)
    }

    pub fn diagnostics(&self) -> Result<&AdviDiagnostics> {
        Ok(&self.fitted()?.diagnostics)
    }

    fn fitted(&self) -> Result<&AdviFit<P::Metadata>> {
        self.fitted.as_ref().ok_or(OccuError::NotFitted)
    }
}

impl<P: DesignMatrixProvider + Default> ChecklistModel for MultiSpeciesOccuAdvi<P> {
    fn fit(
        &mut self,
        env: &CovariateTable,
        checklists: &CovariateTable,
        detections: &DetectionTable,
        cell_ids: &[usize],
    ) -> Result<()> {
        self.options.validate()?;
        let (target, env_design, obs_design) = prepare_target(
            &self.provider,
            &self.env_formula,
            &self.obs_formula,
            self.priors,
            env,
            checklists,
            detections,
            cell_ids,
        )?;
        let (draws, diagnostics) = fit_advi(&target, &self.options)?;
        self.fitted = Some(AdviFit {
            fit: BayesianFit {
                env_design,
                obs_design,
                species_names: detections.species().to_vec(),
                draws,
            },
            diagnostics,
        });
        Ok(())
    }

    fn predict_marginal_probabilities_direct(
        &self,
        env: &CovariateTable,
    ) -> Result<SpeciesPredictions> {
        self.fitted()?.fit.predict_direct(&self.provider, env)
    }

    fn predict_marginal_probabilities_obs(
        &self,
        env: &CovariateTable,
        checklists: &CovariateTable,
    ) -> Result<SpeciesPredictions> {
        self.fitted()?.fit.predict_obs(&self.provider, env, checklists)
    }

    fn save_model(&self, dir: &Path) -> Result<()> {
        let fitted = self.fitted()?;
        fitted.fit.save(
            dir,
            ModelKind::MeanFieldVariational,
            DRAWS_FILE,
            self.priors,
            &fitted.diagnostics,
        )
    }

    fn restore_model(dir: &Path) -> Result<Self> {
        let (fit, metadata) = BayesianFit::<P::Metadata>::restore::<AdviDiagnostics>(
            dir,
            ModelKind::MeanFieldVariational,
            DRAWS_FILE,
        )?;
        let options = AdviOptions {
            m: metadata.diagnostics.n_components,
            n_draws: fit.draws.n_draws(),
            ..AdviOptions::default()
        };
        let mut model =
            Self::with_provider(metadata.env_formula, metadata.obs_formula, P::default())
                .with_priors(metadata.priors)
            .with_options(options);
        model.fitted = Some(AdviFit {
            fit,
            diagnostics: metadata.diagnostics,
        });
        Ok(model)
    }

    fn species_names(&self) -> &[String] {
        match &self.fitted {
            Some(fitted) => &fitted.fit.species_names,
            None => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::design::Column;
    use ndarray::Array2;

    fn survey() -> (CovariateTable, CovariateTable, DetectionTable, Vec<usize>) {
        let n_cells = 12;
        let elevation: Vec<f64> = (0..n_cells).map(|c| c as f64 / 4.0 - 1.5).collect();
        let env = CovariateTable::with_rows(n_cells)
            .with_column("elevation", Column::Numeric(elevation))
            .unwrap();
        let cell_ids: Vec<usize> = (0..n_cells).flat_map(|c| [c, c]).collect();
        let duration: Vec<f64> = (0..cell_ids.len()).map(|i| (i % 3) as f64).collect();
        let checklists = CovariateTable::with_rows(cell_ids.len())
            .with_column("duration", Column::Numeric(duration))
            .unwrap();
        let mut y = Array2::zeros((cell_ids.len(), 2));
        for (i, &c) in cell_ids.iter().enumerate() {
            y[[i, 0]] = f64::from(c % 2 == 0 && i % 2 == 0);
            y[[i, 1]] = f64::from(c > 6);
        }
        let detections = DetectionTable::new(vec!["wren".into(), "robin".into()], y).unwrap();
        (env, checklists, detections, cell_ids)
    }

    fn small_options() -> AdviOptions {
        AdviOptions {
            m: 5,
            n_draws: 40,
            max_iter: 50,
            ..AdviOptions::default()
        }
    }

    #[test]
    fn predictions_need_a_fit() {
        let model = MultiSpeciesOccuAdvi::new("~ elevation", "~ duration");
        let (env, ..) = survey();
        assert!(matches!(
            model.predict_marginal_probabilities_direct(&env),
            Err(OccuError::NotFitted)
        ));
        assert!(model.species_names().is_empty());
    }

    #[test]
    fn fit_produces_probabilities_for_every_species() {
        let (env, checklists, detections, cell_ids) = survey();
        let mut model =
            MultiSpeciesOccuAdvi::new("~ elevation", "~ duration").with_options(small_options());
        model.fit(&env, &checklists, &detections, &cell_ids).unwrap();
        assert_eq!(model.species_names(), ["wren", "robin"]);
        assert_eq!(model.draws().unwrap().n_draws(), 40);

        let direct = model.predict_marginal_probabilities_direct(&env).unwrap();
        assert_eq!(direct.probabilities.dim(), (12, 2));
        assert!(direct.probabilities.iter().all(|p| (0.0..=1.0).contains(p)));

        let paired_env = env.select_rows(&cell_ids).unwrap();
        let obs = model
            .predict_marginal_probabilities_obs(&paired_env, &checklists)
            .unwrap();
        let direct_paired = model.predict_marginal_probabilities_direct(&paired_env).unwrap();
        for (o, d) in obs.probabilities.iter().zip(&direct_paired.probabilities) {
            assert!(*o <= d + 1e-12);
        }
    }

    #[test]
    fn restore_keeps_the_fitted_option_values() {
        let (env, checklists, detections, cell_ids) = survey();
        let mut model =
            MultiSpeciesOccuAdvi::new("~ elevation", "~ duration").with_options(small_options());
        model.fit(&env, &checklists, &detections, &cell_ids).unwrap();
        let dir = tempfile::tempdir().unwrap();
        model.save_model(dir.path()).unwrap();

        let restored = <MultiSpeciesOccuAdvi>::restore_model(dir.path()).unwrap();
        assert_eq!(restored.options().m, 5);
        assert_eq!(restored.options().n_draws, 40);
        assert_eq!(restored.diagnostics().unwrap().n_components, 5);
    }

    #[test]
    fn invalid_options_fail_before_fitting() {
        let (env, checklists, detections, cell_ids) = survey();
        let mut model =
            MultiSpeciesOccuAdvi::new("~ elevation", "~ duration").with_options(AdviOptions {
                m: 0,
                ..AdviOptions::default()
            });
        assert!(matches!(
            model.fit(&env, &checklists, &detections, &cell_ids),
            Err(OccuError::InvalidOption { name: "m", .. })
        ));
    }
}
