//! Point estimation, one species at a time.
//!
//! Each species gets its own maximum-likelihood fit of environmental and
//! detection coefficients, starting from zero. The design matrices are
//! built once and shared across species.

use crate::design::{
    CovariateTable, DesignMatrixProvider, DesignMetadata, DetectionTable, FormulaDesign,
};
use crate::errors::{OccuError, Result};
use crate::kernel::{CellIndex, KernelWorkspace};
use crate::models::{
    ChecklistModel, SpeciesPredictions, average_probabilities, check_paired_rows,
    validate_fit_inputs,
};
use crate::optim::{self, Grad, LogLikelihood, MleOptions, OptResult, Theta};
use crate::persist::{self, DESIGN_INFO_ENV_FILE, DESIGN_INFO_OBS_FILE, ModelKind};
use ndarray::{Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::fs;
use std::path::Path;
use tracing::{info, trace, warn};

/// Fitted coefficients and optimizer status for one species.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeciesFit {
    pub species: String,
    pub env_coef_names: Vec<String>,
    pub env_coefs: Vec<f64>,
    pub obs_coef_names: Vec<String>,
    pub obs_coefs: Vec<f64>,
    /// `‖∇ℓ‖ <= gtol` at the returned coefficients.
    pub successful: bool,
    pub env_formula: String,
    pub obs_formula: String,
    pub final_grad_norm: f64,
    pub iterations: u64,
    pub log_likelihood: f64,
}

#[derive(Debug, Clone)]
struct MaxLikFit<M> {
    env_design: M,
    obs_design: M,
    species_names: Vec<String>,
    fits: Vec<SpeciesFit>,
}

/// Independent per-species maximum-likelihood occupancy model.
///
/// ```no_run
/// use occu::models::{ChecklistModel, MaxLikOccu};
/// # use occu::design::{CovariateTable, DetectionTable};
/// # fn tables() -> (CovariateTable, CovariateTable, DetectionTable, Vec<usize>) {
/// #     unimplemented!()
/// # }
///
/// let (env, checklists, detections, cell_ids) = tables();
/// let mut model = MaxLikOccu::new("~ scale(elevation)", "~ log_duration");
/// model.fit(&env, &checklists, &detections, &cell_ids)?;
/// for fit in model.fits()? {
///     println!("{}: converged = {}", fit.species, fit.successful);
/// }
/// # Ok::<(), occu::OccuError>(())
/// ```
#[derive(Debug, Clone)]
pub struct MaxLikOccu<P: DesignMatrixProvider = FormulaDesign> {
    env_formula: String,
    obs_formula: String,
    options: MleOptions,
    provider: P,
    fitted: Option<MaxLikFit<P::Metadata>>,
}

impl MaxLikOccu<FormulaDesign> {
    pub fn new(env_formula: impl Into<String>, obs_formula: impl Into<String>) -> Self {
        Self::with_provider(env_formula, obs_formula, FormulaDesign)
    }
}

impl<P: DesignMatrixProvider> MaxLikOccu<P> {
    pub fn with_provider(
        env_formula: impl Into<String>,
        obs_formula: impl Into<String>,
        provider: P,
    ) -> Self {
        Self {
            env_formula: env_formula.into(),
            obs_formula: obs_formula.into(),
            options: MleOptions::default(),
            provider,
            fitted: None,
        }
    }

    pub fn with_options(mut self, options: MleOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &MleOptions {
        &self.options
    }

    pub fn env_formula(&self) -> &str {
        &self.env_formula
    }

    pub fn obs_formula(&self) -> &str {
        &self.obs_formula
    }

    /// Per-species results in species order.
    pub fn fits(&self) -> Result<&[SpeciesFit]> {
        Ok(&self.fitted()?.fits)
    }

    fn fitted(&self) -> Result<&MaxLikFit<P::Metadata>> {
        self.fitted.as_ref().ok_or(OccuError::NotFitted)
    }

    fn logits(
        &self,
        design: &P::Metadata,
        table: &CovariateTable,
        coefs: impl Fn(&SpeciesFit) -> &[f64],
    ) -> Result<Array2<f64>> {
        let fitted = self.fitted()?;
        let x = self.provider.apply(design, table)?;
        let mut logits = Array2::zeros((x.nrows(), fitted.fits.len()));
        for (mut column, fit) in logits.columns_mut().into_iter().zip(&fitted.fits) {
            column.assign(&x.dot(&ArrayView1::from(coefs(fit))));
        }
        Ok(logits)
    }
}

impl<P: DesignMatrixProvider + Default> ChecklistModel for MaxLikOccu<P> {
    fn fit(
        &mut self,
        env: &CovariateTable,
        checklists: &CovariateTable,
        detections: &DetectionTable,
        cell_ids: &[usize],
    ) -> Result<()> {
        let cells = validate_fit_inputs(env, checklists, detections, cell_ids)?;
        let (x_env, env_design) = self.provider.build(&self.env_formula, env)?;
        let (x_obs, obs_design) = self.provider.build(&self.obs_formula, checklists)?;
        info!(
            n_species = detections.n_species(),
            n_cells = cells.n_cells(),
            n_checklists = cells.n_checklists(),
            env_columns = x_env.ncols(),
            obs_columns = x_obs.ncols(),
            "fitting point-estimate occupancy model"
        );

        let mut fits = Vec::with_capacity(detections.n_species());
        for (s, species) in detections.species().iter().enumerate() {
            let not_detected = detections.not_detected(s);
            let outcome = {
                let workspace = FitWorkspace::acquire(species, &cells);
                let likelihood = SingleSpeciesLikelihood {
                    x_env: &x_env,
                    x_obs: &x_obs,
                    not_detected: not_detected.view(),
                    cells: &cells,
                    workspace: &workspace,
                };
                optim::maximize(&likelihood, vec![0.0; likelihood.dim()], &self.options)?
            };
            let (env_coefs, obs_coefs) = outcome.theta_hat.split_at(x_env.ncols());
            if outcome.converged {
                info!(
                    species = %species,
                    iterations = outcome.iterations,
                    log_likelihood = outcome.value,
                    "species fitted"
                );
            } else {
                warn!(
                    species = %species,
                    grad_norm = outcome.grad_norm,
                    status = %outcome.status,
                    "optimizer did not reach gtol"
                );
            }
            fits.push(SpeciesFit {
                species: species.clone(),
                env_coef_names: env_design.column_names().to_vec(),
                env_coefs: env_coefs.to_vec(),
                obs_coef_names: obs_design.column_names().to_vec(),
                obs_coefs: obs_coefs.to_vec(),
                successful: outcome.converged,
                env_formula: self.env_formula.clone(),
                obs_formula: self.obs_formula.clone(),
                final_grad_norm: outcome.grad_norm,
                iterations: outcome.iterations,
                log_likelihood: outcome.value,
            });
        }

        let n_failed = fits.iter().filter(|f| !f.successful).count();
        info!(n_species = fits.len(), n_failed, "point-estimate fit finished");
        self.fitted = Some(MaxLikFit {
            env_design,
            obs_design,
            species_names: detections.species().to_vec(),
            fits,
        });
        Ok(())
    }

    fn predict_marginal_probabilities_direct(
        &self,
        env: &CovariateTable,
    ) -> Result<SpeciesPredictions> {
        let fitted = self.fitted()?;
        let env_logits = self.logits(&fitted.env_design, env, |f| f.env_coefs.as_slice())?;
        let shape = env_logits.dim();
        Ok(SpeciesPredictions {
            species: fitted.species_names.clone(),
            probabilities: average_probabilities(1, shape, |_| (env_logits.clone(), None)),
        })
    }

    fn predict_marginal_probabilities_obs(
        &self,
        env: &CovariateTable,
        checklists: &CovariateTable,
    ) -> Result<SpeciesPredictions> {
        let fitted = self.fitted()?;
        check_paired_rows(env, checklists)?;
        let env_logits = self.logits(&fitted.env_design, env, |f| f.env_coefs.as_slice())?;
        let obs_logits = self.logits(&fitted.obs_design, checklists, |f| f.obs_coefs.as_slice())?;
        let shape = env_logits.dim();
        Ok(SpeciesPredictions {
            species: fitted.species_names.clone(),
            probabilities: average_probabilities(1, shape, |_| {
                (env_logits.clone(), Some(obs_logits.clone()))
            }),
        })
    }

    fn save_model(&self, dir: &Path) -> Result<()> {
        let fitted = self.fitted()?;
        persist::prepare_dir(dir)?;
        for (i, fit) in fitted.fits.iter().enumerate() {
            persist::save_json_safely(fit, &dir.join(persist::results_file(i)))?;
        }
        persist::save_json_safely(&fitted.env_design, &dir.join(DESIGN_INFO_ENV_FILE))?;
        persist::save_json_safely(&fitted.obs_design, &dir.join(DESIGN_INFO_OBS_FILE))?;
        persist::finish_dir(dir, ModelKind::PointEstimate, fitted.fits.len())?;
        info!(path = %dir.display(), n_species = fitted.fits.len(), "saved point-estimate model");
        Ok(())
    }

    fn restore_model(dir: &Path) -> Result<Self> {
        let manifest = persist::expect_kind(dir, ModelKind::PointEstimate)?;
        let env_design: P::Metadata = persist::load_json(&dir.join(DESIGN_INFO_ENV_FILE))?;
        let obs_design: P::Metadata = persist::load_json(&dir.join(DESIGN_INFO_OBS_FILE))?;

        let n_files = count_result_files(dir)?;
        if n_files != manifest.n_species {
            return Err(OccuError::restore(
                dir,
                format!(
                    "manifest lists {} species, found {n_files} result files",
                    manifest.n_species
                ),
            ));
        }
        let mut fits = Vec::with_capacity(n_files);
        for i in 0..n_files {
            let path = dir.join(persist::results_file(i));
            let fit: SpeciesFit = persist::load_json(&path)?;
            check_against_design(&path, &fit.env_coef_names, &fit.env_coefs, &env_design)?;
            check_against_design(&path, &fit.obs_coef_names, &fit.obs_coefs, &obs_design)?;
            fits.push(fit);
        }
        let species_names: Vec<String> = fits.iter().map(|f| f.species.clone()).collect();
        let mut model = Self::with_provider(
            env_design.formula(),
            obs_design.formula(),
            P::default(),
        );
        model.fitted = Some(MaxLikFit {
            env_design,
            obs_design,
            species_names,
            fits,
        });
        Ok(model)
    }

    fn species_names(&self) -> &[String] {
        match &self.fitted {
            Some(fitted) => &fitted.species_names,
            None => &[],
        }
    }
}

/// Number of `results_file_{i}.json` files; indices must run `0..n`.
fn count_result_files(dir: &Path) -> Result<usize> {
    let entries = fs::read_dir(dir).map_err(|source| OccuError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut indices = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| OccuError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        if let Some(i) = entry.file_name().to_str().and_then(persist::results_file_index) {
            indices.push(i);
        }
    }
    indices.sort_unstable();
    if indices.is_empty() {
        return Err(OccuError::restore(dir, "no species result files"));
    }
    if indices.iter().enumerate().any(|(expected, &i)| expected != i) {
        return Err(OccuError::restore(
            dir,
            format!("species result files are not numbered 0..{}", indices.len()),
        ));
    }
    Ok(indices.len())
}

fn check_against_design<M: DesignMetadata>(
    path: &Path,
    names: &[String],
    coefs: &[f64],
    design: &M,
) -> Result<()> {
    if names != design.column_names() || coefs.len() != names.len() {
        return Err(OccuError::restore(
            path,
            format!(
                "{} coefficients named {:?} do not match design columns {:?} of `{}`",
                coefs.len(),
                names,
                design.column_names(),
                design.formula()
            ),
        ));
    }
    Ok(())
}

/// Kernel buffers for one species' fit.
///
/// Acquired before the optimizer starts and dropped when the species'
/// block ends, whether the fit converged, stalled or returned an error, so
/// peak memory does not grow with the number of species.
struct FitWorkspace<'a> {
    species: &'a str,
    kernel: RefCell<KernelWorkspace>,
}

impl<'a> FitWorkspace<'a> {
    fn acquire(species: &'a str, cells: &CellIndex) -> Self {
        let kernel = KernelWorkspace::new(cells);
        trace!(species, slots = kernel.len(), "acquired fit workspace");
        Self {
            species,
            kernel: RefCell::new(kernel),
        }
    }
}

impl Drop for FitWorkspace<'_> {
    fn drop(&mut self) {
        trace!(species = self.species, "released fit workspace");
    }
}

/// `ℓ(β, α) = Σ_c log L_c` for one species, `θ = [β_env, α_obs]`.
struct SingleSpeciesLikelihood<'a> {
    x_env: &'a Array2<f64>,
    x_obs: &'a Array2<f64>,
    not_detected: ArrayView1<'a, f64>,
    cells: &'a CellIndex,
    workspace: &'a FitWorkspace<'a>,
}

impl SingleSpeciesLikelihood<'_> {
    fn logits(&self, theta: &Theta) -> (Array1<f64>, Array1<f64>) {
        let (beta, alpha) = theta.split_at(self.x_env.ncols());
        (
            self.x_env.dot(&ArrayView1::from(beta)),
            self.x_obs.dot(&ArrayView1::from(alpha)),
        )
    }
}

impl LogLikelihood for SingleSpeciesLikelihood<'_> {
    fn dim(&self) -> usize {
        self.x_env.ncols() + self.x_obs.ncols()
    }

    fn value(&self, theta: &Theta) -> OptResult<f64> {
        let (env_logit, obs_logit) = self.logits(theta);
        let mut ws = self.workspace.kernel.borrow_mut();
        Ok(ws.evaluate(env_logit.view(), obs_logit.view(), self.not_detected, self.cells, false))
    }

    fn grad(&self, theta: &Theta) -> OptResult<Grad> {
        let (env_logit, obs_logit) = self.logits(theta);
        let mut ws = self.workspace.kernel.borrow_mut();
        ws.evaluate(env_logit.view(), obs_logit.view(), self.not_detected, self.cells, true);
        let g_env = self.x_env.t().dot(&ws.env_grad());
        let g_obs = self.x_obs.t().dot(&ws.obs_grad());
        Ok(g_env.iter().chain(g_obs.iter()).copied().collect())
    }
}
