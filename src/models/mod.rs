//! Occupancy models sharing one fit / predict / save / restore contract.
//!
//! | variant | type | inference |
//! |---|---|---|
//! | point estimate | [`MaxLikOccu`] | per-species maximum likelihood |
//! | mean-field variational | [`MultiSpeciesOccuAdvi`] | hierarchical model, ADVI |
//! | full MCMC | [`MultiSpeciesOccuMcmc`] | hierarchical model, slice-within-Gibbs |
//!
//! [`OccupancyModel`] wraps the three behind one value so callers can pick a
//! variant at runtime, and restores whichever variant an artifact directory
//! holds.

pub mod advi;
pub mod hierarchical;
pub mod max_lik;
pub mod mcmc;
pub mod presence_absence;

pub use self::advi::MultiSpeciesOccuAdvi;
pub use self::hierarchical::{HierarchicalOccuModel, HierarchicalParams, HierarchicalPriors};
pub use self::max_lik::{MaxLikOccu, SpeciesFit};
pub use self::mcmc::MultiSpeciesOccuMcmc;
pub use self::presence_absence::PresenceAbsenceAdvi;

use crate::design::{CovariateTable, DetectionTable};
use crate::errors::{OccuError, Result};
use crate::kernel::CellIndex;
use crate::link::{log_sigmoid, sigmoid};
use crate::persist::{self, ModelKind};
use ndarray::{Array2, ArrayView1};
#[cfg(feature = "rayon")]
use rayon::prelude::*;
use std::path::Path;

/// Fit / predict / persist contract shared by every occupancy model.
///
/// `detections` has one column per species; its column order fixes the
/// species order of every prediction and of the saved artifact.
pub trait ChecklistModel: Sized {
    fn fit(
        &mut self,
        env: &CovariateTable,
        checklists: &CovariateTable,
        detections: &DetectionTable,
        cell_ids: &[usize],
    ) -> Result<()>;

    /// `E[σ(env_logit)]` for every row of `env` and every species.
    fn predict_marginal_probabilities_direct(
        &self,
        env: &CovariateTable,
    ) -> Result<SpeciesPredictions>;

    /// `E[σ(env_logit) · σ(obs_logit)]`, pairing row `i` of `env` with row
    /// `i` of `checklists`.
    fn predict_marginal_probabilities_obs(
        &self,
        env: &CovariateTable,
        checklists: &CovariateTable,
    ) -> Result<SpeciesPredictions>;

    fn save_model(&self, dir: &Path) -> Result<()>;
    fn restore_model(dir: &Path) -> Result<Self>;
    fn species_names(&self) -> &[String];
}

/// Probabilities indexed by `(row, species)`.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeciesPredictions {
    pub species: Vec<String>,
    pub probabilities: Array2<f64>,
}

impl SpeciesPredictions {
    pub fn n_rows(&self) -> usize {
        self.probabilities.nrows()
    }

    /// Column for one species, if it was fitted.
    pub fn species_column(&self, name: &str) -> Option<ArrayView1<'_, f64>> {
        self.species
            .iter()
            .position(|s| s == name)
            .map(|j| self.probabilities.column(j))
    }
}

/// The three checklist models behind one type.
#[derive(Debug)]
pub enum OccupancyModel {
    PointEstimate(MaxLikOccu),
    MeanFieldVariational(MultiSpeciesOccuAdvi),
    FullMcmc(MultiSpeciesOccuMcmc),
}

impl ChecklistModel for OccupancyModel {
    fn fit(
        &mut self,
        env: &CovariateTable,
        checklists: &CovariateTable,
        detections: &DetectionTable,
        cell_ids: &[usize],
    ) -> Result<()> {
        match self {
            OccupancyModel::PointEstimate(m) => m.fit(env, checklists, detections, cell_ids),
            OccupancyModel::MeanFieldVariational(m) => m.fit(env, checklists, detections, cell_ids),
            OccupancyModel::FullMcmc(m) => m.fit(env, checklists, detections, cell_ids),
        }
    }

    fn predict_marginal_probabilities_direct(
        &self,
        env: &CovariateTable,
    ) -> Result<SpeciesPredictions> {
        match self {
            OccupancyModel::PointEstimate(m) => m.predict_marginal_probabilities_direct(env),
            OccupancyModel::MeanFieldVariational(m) => {
                m.predict_marginal_probabilities_direct(env)
            }
            OccupancyModel::FullMcmc(m) => m.predict_marginal_probabilities_direct(env),
        }
    }

    fn predict_marginal_probabilities_obs(
        &self,
        env: &CovariateTable,
        checklists: &CovariateTable,
    ) -> Result<SpeciesPredictions> {
        match self {
            OccupancyModel::PointEstimate(m) => {
                m.predict_marginal_probabilities_obs(env, checklists)
            }
            OccupancyModel::MeanFieldVariational(m) => {
                m.predict_marginal_probabilities_obs(env, checklists)
            }
            OccupancyModel::FullMcmc(m) => m.predict_marginal_probabilities_obs(env, checklists),
        }
    }

    fn save_model(&self, dir: &Path) -> Result<()> {
        match self {
            OccupancyModel::PointEstimate(m) => m.save_model(dir),
            OccupancyModel::MeanFieldVariational(m) => m.save_model(dir),
            OccupancyModel::FullMcmc(m) => m.save_model(dir),
        }
    }

    /// Restore whichever variant the manifest in `dir` names.
    fn restore_model(dir: &Path) -> Result<Self> {
        match persist::read_manifest(dir)?.kind {
            ModelKind::PointEstimate => {
                MaxLikOccu::restore_model(dir).map(OccupancyModel::PointEstimate)
            }
            ModelKind::MeanFieldVariational => {
                MultiSpeciesOccuAdvi::restore_model(dir).map(OccupancyModel::MeanFieldVariational)
            }
            ModelKind::FullMcmc => {
                MultiSpeciesOccuMcmc::restore_model(dir).map(OccupancyModel::FullMcmc)
            }
            ModelKind::PresenceAbsence => Err(OccuError::restore(
                dir,
                "presence/absence artifacts are not checklist models",
            )),
        }
    }

    fn species_names(&self) -> &[String] {
        match self {
            OccupancyModel::PointEstimate(m) => m.species_names(),
            OccupancyModel::MeanFieldVariational(m) => m.species_names(),
            OccupancyModel::FullMcmc(m) => m.species_names(),
        }
    }
}

/// Check the fit inputs against each other before any design matrix,
/// optimizer or sampler is touched.
pub fn validate_fit_inputs(
    env: &CovariateTable,
    checklists: &CovariateTable,
    detections: &DetectionTable,
    cell_ids: &[usize],
) -> Result<CellIndex> {
    if cell_ids.len() != checklists.n_rows() {
        return Err(OccuError::ShapeMismatch {
            what: "checklist cell ids vs checklist rows",
            expected: checklists.n_rows(),
            found: cell_ids.len(),
        });
    }
    if detections.n_checklists() != checklists.n_rows() {
        return Err(OccuError::ShapeMismatch {
            what: "detection rows vs checklist rows",
            expected: checklists.n_rows(),
            found: detections.n_checklists(),
        });
    }
    CellIndex::new(cell_ids, env.n_rows())
}

pub(crate) fn check_paired_rows(env: &CovariateTable, checklists: &CovariateTable) -> Result<()> {
    if env.n_rows() != checklists.n_rows() {
        return Err(OccuError::ShapeMismatch {
            what: "environment rows vs checklist rows in prediction",
            expected: env.n_rows(),
            found: checklists.n_rows(),
        });
    }
    Ok(())
}

/// Monte-Carlo mean of `σ(env)` (or `σ(env)·σ(obs)` when observation logits
/// are given) over `n_draws` coefficient draws.
///
/// `logits(d)` returns the `rows × species` logit matrices for draw `d`.
pub(crate) fn average_probabilities<F>(
    n_draws: usize,
    shape: (usize, usize),
    logits: F,
) -> Array2<f64>
where
    F: Fn(usize) -> (Array2<f64>, Option<Array2<f64>>) + Send + Sync,
{
    let probabilities = |d: usize| {
        let (env, obs) = logits(d);
        match obs {
            None => env.mapv(sigmoid),
            Some(obs) => {
                let mut p = env.mapv(log_sigmoid);
                p.zip_mut_with(&obs, |e, &o| *e = (*e + log_sigmoid(o)).exp());
                p
            }
        }
    };
    #[cfg(feature = "rayon")]
    let total = (0..n_draws)
        .into_par_iter()
        .map(probabilities)
        .reduce(|| Array2::zeros(shape), |a, b| a + b);
    #[cfg(not(feature = "rayon"))]
    let total = (0..n_draws)
        .map(probabilities)
        .fold(Array2::zeros(shape), |a, b| a + b);
    total / n_draws.max(1) as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn inputs_are_checked_before_fitting() {
        let env = CovariateTable::with_rows(2);
        let checklists = CovariateTable::with_rows(3);
        let detections =
            DetectionTable::new(vec!["a".into()], array![[1.0], [0.0], [0.0]]).unwrap();
        assert!(validate_fit_inputs(&env, &checklists, &detections, &[0, 1, 1]).is_ok());
        assert!(matches!(
            validate_fit_inputs(&env, &checklists, &detections, &[0, 1]),
            Err(OccuError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            validate_fit_inputs(&env, &checklists, &detections, &[0, 1, 2]),
            Err(OccuError::CellIdOutOfRange { .. })
        ));
        let short = DetectionTable::new(vec!["a".into()], array![[1.0]]).unwrap();
        assert!(matches!(
            validate_fit_inputs(&env, &checklists, &short, &[0, 1, 1]),
            Err(OccuError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn averaging_over_draws() {
        let p = average_probabilities(2, (1, 1), |d| {
            let e = if d == 0 { 0.0 } else { 100.0 };
            (array![[e]], None)
        });
        assert_abs_diff_eq!(p[[0, 0]], 0.75, epsilon = 1e-12);

        let joint = average_probabilities(1, (1, 1), |_| (array![[0.0]], Some(array![[0.0]])));
        assert_abs_diff_eq!(joint[[0, 0]], 0.25, epsilon = 1e-12);
    }
}
