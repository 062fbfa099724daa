//! Tabular inputs: covariate tables and per-species detection tables.

use crate::design::DesignError;
use crate::errors::{OccuError, Result};
use ndarray::{Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// One named covariate column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Column {
    Numeric(Vec<f64>),
    Categorical(Vec<String>),
}

impl Column {
    pub fn len(&self) -> usize {
        match self {
            Column::Numeric(v) => v.len(),
            Column::Categorical(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Ordered, named covariate columns of equal length.
///
/// A table may have no columns at all; its row count is then set
/// explicitly so intercept-only formulas still know how many rows to emit.
///
/// ```
/// use occu::design::CovariateTable;
///
/// let table = CovariateTable::with_rows(3)
///     .with_numeric("elevation", vec![120.0, 340.0, 95.0])?
///     .with_categorical("habitat", ["forest", "grass", "forest"])?;
/// assert_eq!(table.n_rows(), 3);
/// # Ok::<(), occu::design::DesignError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CovariateTable {
    n_rows: usize,
    columns: Vec<(String, Column)>,
}

impl CovariateTable {
    /// Empty table with `n_rows` rows and no columns.
    pub fn with_rows(n_rows: usize) -> Self {
        Self {
            n_rows,
            columns: Vec::new(),
        }
    }

    /// Append a column.
    ///
    /// # Errors
    /// - [`DesignError::DuplicateColumn`] if the name is taken.
    /// - [`DesignError::ColumnLength`] if the length differs from the row count.
    pub fn with_column(
        mut self,
        name: impl Into<String>,
        column: Column,
    ) -> std::result::Result<Self, DesignError> {
        let name = name.into();
        if self.columns.iter().any(|(n, _)| *n == name) {
            return Err(DesignError::DuplicateColumn { column: name });
        }
        if column.len() != self.n_rows {
            return Err(DesignError::ColumnLength {
                column: name,
                expected: self.n_rows,
                found: column.len(),
            });
        }
        self.columns.push((name, column));
        Ok(self)
    }

    pub fn with_numeric(
        self,
        name: impl Into<String>,
        values: Vec<f64>,
    ) -> std::result::Result<Self, DesignError> {
        self.with_column(name, Column::Numeric(values))
    }

    pub fn with_categorical<I, S>(
        self,
        name: impl Into<String>,
        values: I,
    ) -> std::result::Result<Self, DesignError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.with_column(
            name,
            Column::Categorical(values.into_iter().map(Into::into).collect()),
        )
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|(n, _)| n == name).map(|(_, c)| c)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(n, _)| n.as_str())
    }

    /// Rows `indices` of every column, in the given order.
    pub fn select_rows(&self, indices: &[usize]) -> std::result::Result<Self, DesignError> {
        if let Some(&row) = indices.iter().find(|&&i| i >= self.n_rows) {
            return Err(DesignError::RowOutOfRange {
                row,
                n_rows: self.n_rows,
            });
        }
        let columns = self
            .columns
            .iter()
            .map(|(name, col)| {
                let picked = match col {
                    Column::Numeric(v) => Column::Numeric(indices.iter().map(|&i| v[i]).collect()),
                    Column::Categorical(v) => {
                        Column::Categorical(indices.iter().map(|&i| v[i].clone()).collect())
                    }
                };
                (name.clone(), picked)
            })
            .collect();
        Ok(Self {
            n_rows: indices.len(),
            columns,
        })
    }
}

/// Observed detections: one 0/1 column per species, one row per checklist.
///
/// Column order defines species order everywhere downstream.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionTable {
    species: Vec<String>,
    detections: Array2<f64>,
}

impl DetectionTable {
    /// # Errors
    /// - [`OccuError::InvalidSpecies`] for an empty, blank or duplicated name.
    /// - [`OccuError::ShapeMismatch`] if the column count differs from the
    ///   number of species.
    /// - [`OccuError::InvalidDetection`] for any value other than 0 or 1.
    pub fn new(species: Vec<String>, detections: Array2<f64>) -> Result<Self> {
        if species.is_empty() {
            return Err(OccuError::InvalidSpecies("no species given".into()));
        }
        let mut seen = HashSet::new();
        for name in &species {
            if name.trim().is_empty() {
                return Err(OccuError::InvalidSpecies("blank species name".into()));
            }
            if !seen.insert(name.as_str()) {
                return Err(OccuError::InvalidSpecies(format!("duplicate species `{name}`")));
            }
        }
        if detections.ncols() != species.len() {
            return Err(OccuError::ShapeMismatch {
                what: "detection columns vs species names",
                expected: species.len(),
                found: detections.ncols(),
            });
        }
        for ((checklist, s), &value) in detections.indexed_iter() {
            if value != 0.0 && value != 1.0 {
                return Err(OccuError::InvalidDetection {
                    species: species[s].clone(),
                    checklist,
                    value,
                });
            }
        }
        Ok(Self {
            species,
            detections,
        })
    }

    pub fn species(&self) -> &[String] {
        &self.species
    }

    pub fn n_species(&self) -> usize {
        self.species.len()
    }

    pub fn n_checklists(&self) -> usize {
        self.detections.nrows()
    }

    /// Detection indicators `y` for one species.
    pub fn detections(&self, species: usize) -> ArrayView1<'_, f64> {
        self.detections.column(species)
    }

    /// Non-detection indicators `m = 1 − y` for one species.
    pub fn not_detected(&self, species: usize) -> Array1<f64> {
        self.detections(species).mapv(|y| 1.0 - y)
    }

    /// `1 − y` for all species, `n_checklists × n_species`.
    pub fn not_detected_matrix(&self) -> Array2<f64> {
        self.detections.mapv(|y| 1.0 - y)
    }
}
