//! # Site-Occupancy Detection Models
//!
//! This crate fits multi-species site-occupancy models to checklist surveys.
//! Each cell (site) is occupied or not; each checklist visits one cell and
//! records, per species, whether it was detected. A species can only be
//! detected in an occupied cell, and even then only with some probability,
//! so a run of non-detections is evidence of absence only to the extent that
//! detection is likely.
//!
//! ## Features
//!
//! - **Checklist likelihood:** [`kernel`] marginalises the latent occupancy
//!   state per cell in log space and returns analytic gradients with respect
//!   to the occupancy and detection logits.
//! - **Models** (see [`models`]), behind one [`models::ChecklistModel`] contract:
//!   - [`models::MaxLikOccu`]: per-species maximum likelihood.
//!   - [`models::MultiSpeciesOccuAdvi`]: hierarchical model, mean-field ADVI.
//!   - [`models::MultiSpeciesOccuMcmc`]: hierarchical model, slice-within-Gibbs MCMC.
//!   - [`models::PresenceAbsenceAdvi`]: logistic presence/absence without a
//!     detection process.
//! - **Design matrices** from patsy-style formulas ([`design::FormulaDesign`]),
//!   with the encoding stored so prediction reproduces it exactly.
//! - **Persistence:** every fitted model saves to and restores from a
//!   directory of JSON files.
//!
//! ## Mathematical Background
//!
//! For cell `c` with occupancy probability `ψ_c = σ(η_c)` and checklists
//! `i ∈ c` with detection probabilities `p_i = σ(x_i)`:
//!
//! ```text
//! L_c = ψ_c Π_i p_i^{y_i} (1 − p_i)^{1 − y_i}  +  (1 − ψ_c) · 1[no detection in c]
//! ```
//!
//! - MacKenzie, D.I. et al. (2002). Estimating site occupancy rates when
//!   detection probabilities are less than one. *Ecology*, 83(8): 2248–2255.
//! - Kucukelbir, A. et al. (2017). Automatic Differentiation Variational
//!   Inference. *JMLR*, 18(14): 1–45.
//!
//! ## Usage Example
//!
//! ```no_run
//! use ndarray::array;
//! use occu::design::{CovariateTable, DetectionTable};
//! use occu::models::{ChecklistModel, MaxLikOccu};
//!
//! let env = CovariateTable::with_rows(3).with_numeric("forest", vec![0.1, 0.5, 0.9])?;
//! let minutes = vec![10.0, 30.0, 5.0, 60.0, 20.0, 15.0];
//! let checklists = CovariateTable::with_rows(6).with_numeric("minutes", minutes)?;
//! let cell_ids = [0, 0, 1, 1, 2, 2];
//! let detections = DetectionTable::new(
//!     vec!["wren".into()],
//!     array![[0.0], [0.0], [1.0], [0.0], [1.0], [1.0]],
//! )?;
//!
//! let mut model = MaxLikOccu::new("~ forest", "~ 1");
//! model.fit(&env, &checklists, &detections, &cell_ids)?;
//! let psi = model.predict_marginal_probabilities_direct(&env)?;
//! assert_eq!(psi.probabilities.dim(), (3, 1));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! The `demos` directory in the repository contains a runnable simulation.
//!
//! ## Logging
//! The crate emits [`tracing`] events and installs no subscriber.
//!
//! ## License
//! This crate is dual-licensed under the MIT OR Apache-2.0 licenses.

pub mod design;
pub mod errors;
pub mod inference;
pub mod kernel;
pub mod link;
pub mod models;
pub mod optim;
pub mod persist;

pub use errors::{OccuError, Result};
pub use models::{ChecklistModel, OccupancyModel, SpeciesPredictions};
