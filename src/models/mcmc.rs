//! Hierarchical multi-species occupancy model sampled with MCMC.

use crate::design::{CovariateTable, DesignMatrixProvider, DetectionTable, FormulaDesign};
use crate::errors::{OccuError, Result};
use crate::inference::{McmcOptions, PosteriorDraws, sample_posterior};
use crate::models::hierarchical::{BayesianFit, HierarchicalPriors, prepare_target};
use crate::models::{ChecklistModel, SpeciesPredictions};
use crate::persist::{MCMC_SAMPLES_FILE, ModelKind};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Sampler configuration and what the runner reported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McmcDiagnostics {
    pub options: McmcOptions,
    pub n_chains: usize,
    pub draws_per_chain: usize,
    pub run_stats: Vec<String>,
}

#[derive(Debug, Clone)]
struct McmcFit<M> {
    fit: BayesianFit<M>,
    diagnostics: McmcDiagnostics,
}

/// Multi-species model with partially pooled detection coefficients,
/// sampled with slice-within-Gibbs.
///
/// Draws from all chains are pooled for prediction.
#[derive(Debug, Clone)]
pub struct MultiSpeciesOccuMcmc<P: DesignMatrixProvider = FormulaDesign> {
    env_formula: String,
    obs_formula: String,
    priors: HierarchicalPriors,
    options: McmcOptions,
    provider: P,
    fitted: Option<McmcFit<P::Metadata>>,
}

impl MultiSpeciesOccuMcmc<FormulaDesign> {
    pub fn new(env_formula: impl Into<String>, obs_formula: impl Into<String>) -> Self {
        Self::with_provider(env_formula, obs_formula, FormulaDesign)
    }
}

impl<P: DesignMatrixProvider> MultiSpeciesOccuMcmc<P> {
    pub fn with_provider(
        env_formula: impl Into<String>,
        obs_formula: impl Into<String>,
        provider: P,
    ) -> Self {
        Self {
            env_formula: env_formula.into(),
            obs_formula: obs_formula.into(),
            priors: HierarchicalPriors::default(),
            options: McmcOptions::default(),
            provider,
            fitted: None,
        }
    }

    pub fn with_options(mut self, options: McmcOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_priors(mut self, priors: HierarchicalPriors) -> Self {
        self.priors = priors;
        self
    }

    pub fn options(&self) -> &McmcOptions {
        &self.options
    }

    /// Pooled draws, chains stacked one after another.
    pub fn draws(&self) -> Result<&PosteriorDraws> {
        Ok(&self.fitted()?.fit.draws)
    }

    pub fn diagnostics(&self) -> Result<&McmcDiagnostics> {
        Ok(&self.fitted()?.diagnostics)
    }

    fn fitted(&self) -> Result<&McmcFit<P::Metadata>> {
        self.fitted.as_ref().ok_or(OccuError::NotFitted)
    }
}

impl<P: DesignMatrixProvider + Default> ChecklistModel for MultiSpeciesOccuMcmc<P> {
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
        let run = sample_posterior(Arc::new(target), &self.options)?;
        info!(
            n_chains = run.n_chains,
            draws_per_chain = run.draws_per_chain,
            "posterior sampling finished"
        );
        self.fitted = Some(McmcFit {
            fit: BayesianFit {
                env_design,
                obs_design,
                species_names: detections.species().to_vec(),
                draws: run.draws,
            },
            diagnostics: McmcDiagnostics {
                options: self.options.clone(),
                n_chains: run.n_chains,
                draws_per_chain: run.draws_per_chain,
                run_stats: run.run_stats,
            },
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
            ModelKind::FullMcmc,
            MCMC_SAMPLES_FILE,
            self.priors,
            &fitted.diagnostics,
        )
    }

    fn restore_model(dir: &Path) -> Result<Self> {
        let (fit, metadata) = BayesianFit::<P::Metadata>::restore::<McmcDiagnostics>(
            dir,
            ModelKind::FullMcmc,
            MCMC_SAMPLES_FILE,
        )?;
        let d = &metadata.diagnostics;
        if d.n_chains * d.draws_per_chain != fit.draws.n_draws() {
            return Err(OccuError::restore(
                dir,
                format!(
                    "{} chains of {} draws recorded but {} draws stored",
                    d.n_chains,
                    d.draws_per_chain,
                    fit.draws.n_draws()
                ),
            ));
        }
        let mut model =
            Self::with_provider(metadata.env_formula, metadata.obs_formula, P::default())
                .with_priors(metadata.priors)
                .with_options(d.options.clone());
        model.fitted = Some(McmcFit {
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
    use crate::inference::ChainMethod;
    use crate::models::hierarchical::OBS_COEF_PRIOR_SDS;
    use ndarray::Array2;

    fn survey() -> (CovariateTable, CovariateTable, DetectionTable, Vec<usize>) {
        let n_cells = 10;
        let env = CovariateTable::with_rows(n_cells)
            .with_numeric("forest", (0..n_cells).map(|c| (c % 4) as f64 - 1.5).collect())
            .unwrap();
        let cell_ids: Vec<usize> = (0..n_cells).flat_map(|c| [c, c, c]).collect();
        let checklists = CovariateTable::with_rows(cell_ids.len());
        let y = Array2::from_shape_fn((cell_ids.len(), 2), |(i, s)| f64::from((i + s) % 4 == 0));
        let detections = DetectionTable::new(vec!["owl".into(), "jay".into()], y).unwrap();
        (env, checklists, detections, cell_ids)
    }

    fn small_options(chain_method: ChainMethod) -> McmcOptions {
        McmcOptions {
            n_draws: 20,
            n_tune: 10,
            thinning: 2,
            n_chains: 2,
            chain_method,
            ..McmcOptions::default()
        }
    }

    #[test]
    fn pooled_draws_respect_thinning_and_constraints() {
        let (env, checklists, detections, cell_ids) = survey();
        for method in [ChainMethod::Vectorized, ChainMethod::Sequential] {
            let mut model =
                MultiSpeciesOccuMcmc::new("~ forest", "~ 1").with_options(small_options(method));
            model.fit(&env, &checklists, &detections, &cell_ids).unwrap();
            let d = model.diagnostics().unwrap();
            assert_eq!(d.n_chains, 2);
            assert_eq!(d.draws_per_chain, 10);
            let draws = model.draws().unwrap();
            assert_eq!(draws.n_draws(), 20);
            assert!(draws.block(OBS_COEF_PRIOR_SDS).unwrap().iter().all(|&v| v > 0.0));

            let p = model.predict_marginal_probabilities_direct(&env).unwrap();
            assert_eq!(p.probabilities.dim(), (10, 2));
        }
    }

    #[test]
    fn bad_options_are_rejected() {
        let (env, checklists, detections, cell_ids) = survey();
        let mut model = MultiSpeciesOccuMcmc::new("~ forest", "~ 1").with_options(McmcOptions {
            thinning: 0,
            ..McmcOptions::default()
        });
        assert!(matches!(
            model.fit(&env, &checklists, &detections, &cell_ids),
            Err(OccuError::InvalidOption { name: "thinning", .. })
        ));
    }
}
