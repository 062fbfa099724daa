//! Design matrices from covariate tables.
//!
//! Models never parse formulas themselves; they go through a
//! [`DesignMatrixProvider`], which turns `(formula, table)` into a numeric
//! matrix plus metadata, and later re-applies that metadata to new tables so
//! prediction sees exactly the training-time encoding. [`FormulaDesign`] is
//! the provider used by default.

pub mod formula;
pub mod table;

pub use self::formula::{DesignInfo, EncodedTerm, FormulaDesign};
pub use self::table::{Column, CovariateTable, DetectionTable};

use ndarray::Array2;
use serde::{Serialize, de::DeserializeOwned};
use std::fmt::Debug;
use thiserror::Error;

/// Column name used for the intercept.
pub const INTERCEPT: &str = "Intercept";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DesignError {
    #[error("cannot parse formula `{formula}`: {reason}")]
    Parse { formula: String, reason: String },

    #[error("formula `{formula}` produces no columns")]
    EmptyDesign { formula: String },

    #[error("column `{column}` not found in covariate table")]
    MissingColumn { column: String },

    #[error("column `{column}` has level `{level}` that was not seen when the design was built")]
    UnknownLevel { column: String, level: String },

    #[error("column `{column}` must be {expected}")]
    KindMismatch {
        column: String,
        expected: &'static str,
    },

    #[error("column `{column}` has non-finite value at row {row}")]
    NonFinite { column: String, row: usize },

    #[error("column `{column}` is constant and cannot be scaled")]
    ConstantColumn { column: String },

    #[error("design produced {found} columns, expected {expected}")]
    ColumnCount { expected: usize, found: usize },

    #[error("column `{column}` has {found} rows, expected {expected}")]
    ColumnLength {
        column: String,
        expected: usize,
        found: usize,
    },

    #[error("column `{column}` is defined twice")]
    DuplicateColumn { column: String },

    #[error("row {row} out of range for table with {n_rows} rows")]
    RowOutOfRange { row: usize, n_rows: usize },
}

/// Read-only view of the metadata a provider stores at build time.
pub trait DesignMetadata {
    fn formula(&self) -> &str;
    fn column_names(&self) -> &[String];

    fn n_columns(&self) -> usize {
        self.column_names().len()
    }
}

/// Capability to build design matrices and re-apply their encoding.
///
/// `apply(build(f, t).1, t)` must reproduce the matrix returned by `build`.
/// Metadata is serializable so fitted models can persist it next to their
/// coefficients.
pub trait DesignMatrixProvider {
    type Metadata: DesignMetadata
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync;

    fn build(
        &self,
        formula: &str,
        table: &CovariateTable,
    ) -> Result<(Array2<f64>, Self::Metadata), DesignError>;

    fn apply(
        &self,
        metadata: &Self::Metadata,
        table: &CovariateTable,
    ) -> Result<Array2<f64>, DesignError>;
}
