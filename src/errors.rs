//! Crate-wide error type.
//!
//! Correctness problems (shape mismatches, out-of-range cell ids, broken
//! artifact directories) surface as [`OccuError`]. Statistical-quality
//! problems such as optimizer non-convergence are recorded on the fitted
//! artifact instead and never show up here.

use crate::design::DesignError;
use crate::optim::OptError;
use std::path::PathBuf;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, OccuError>;

#[derive(Debug, Error)]
pub enum OccuError {
    /// Two inputs that must agree in length do not.
    #[error("shape mismatch for {what}: expected {expected}, found {found}")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    /// A checklist points at a cell outside `[0, n_cells)`.
    #[error("checklist {checklist} has cell id {cell_id}, but there are only {n_cells} cells")]
    CellIdOutOfRange {
        checklist: usize,
        cell_id: usize,
        n_cells: usize,
    },

    /// Detection values must be exactly 0 or 1.
    #[error("detection for species `{species}` on checklist {checklist} is {value}; expected 0 or 1")]
    InvalidDetection {
        species: String,
        checklist: usize,
        value: f64,
    },

    /// Species names must be unique and non-empty.
    #[error("invalid species list: {0}")]
    InvalidSpecies(String),

    /// Parameter schema problems (duplicate block names, bad flat length).
    #[error("invalid parameter layout: {0}")]
    InvalidLayout(String),

    /// Option values outside their domain.
    #[error("invalid option `{name}`: {reason}")]
    InvalidOption {
        name: &'static str,
        reason: String,
    },

    /// Prediction or save requested before `fit`.
    #[error("model has not been fitted")]
    NotFitted,

    /// The artifact directory is incomplete or inconsistent.
    #[error("cannot restore model from {path}: {reason}")]
    Restore { path: PathBuf, reason: String },

    /// Failure reported by the MCMC runner.
    #[error("sampler failed: {0}")]
    Sampler(String),

    #[error(transparent)]
    Design(#[from] DesignError),

    #[error(transparent)]
    Optimizer(#[from] OptError),

    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("json error in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl OccuError {
    pub(crate) fn restore(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        OccuError::Restore {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
