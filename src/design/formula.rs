//! Patsy-style formulas with treatment coding.
//!
//! Supported right-hand sides, terms joined by `+`:
//!
//! | term | columns |
//! |---|---|
//! | `1`, `0`, `-1` | intercept on / off (on by default) |
//! | `x` (numeric) | `x` |
//! | `h` (categorical) | `h[T.level]` per non-reference level |
//! | `C(h)` | `C(h)[T.level]`, also for numeric `h` |
//! | `scale(x)` | `(x − mean) / sd`, population sd |
//! | `center(x)` | `x − mean` |
//! | `I(x ** k)`, `I(x ^ k)` | integer power |
//! | `a:b` | product of numeric columns |
//!
//! Levels are sorted when the design is built. With an intercept the first
//! level is the reference and gets no column; without one, the first
//! categorical term is fully coded (`C(h)[level]`) and later ones use
//! treatment coding again.

use crate::design::{
    Column, CovariateTable, DesignError, DesignMatrixProvider, DesignMetadata, INTERCEPT,
};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Default [`DesignMatrixProvider`]: parses formulas and encodes tables.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormulaDesign;

impl DesignMatrixProvider for FormulaDesign {
    type Metadata = DesignInfo;

    fn build(
        &self,
        formula: &str,
        table: &CovariateTable,
    ) -> Result<(Array2<f64>, DesignInfo), DesignError> {
        let parsed = parse(formula)?;
        let mut full_coding_pending = !parsed.intercept;
        let mut terms = Vec::with_capacity(parsed.terms.len());
        for term in parsed.terms {
            let encoded = match term {
                Term::Plain(column) => match lookup(table, &column)? {
                    Column::Numeric(_) => {
                        numeric(table, &column)?;
                        EncodedTerm::Numeric { column }
                    }
                    Column::Categorical(_) => {
                        let label = column.clone();
                        treatment(table, column, label, false, &mut full_coding_pending)?
                    }
                },
                Term::Categorical(column) => {
                    let label = format!("C({column})");
                    treatment(table, column, label, true, &mut full_coding_pending)?
                }
                Term::Scale(column) => {
                    let values = numeric(table, &column)?;
                    let (mean, sd) = moments(values);
                    if !(sd > 0.0 && sd.is_finite()) {
                        return Err(DesignError::ConstantColumn { column });
                    }
                    EncodedTerm::Scaled { column, mean, sd }
                }
                Term::Center(column) => {
                    let (mean, _) = moments(numeric(table, &column)?);
                    EncodedTerm::Centered { column, mean }
                }
                Term::Power(column, exponent) => {
                    numeric(table, &column)?;
                    EncodedTerm::Power { column, exponent }
                }
                Term::Interaction(columns) => {
                    for column in &columns {
                        numeric(table, column)?;
                    }
                    EncodedTerm::Product { columns }
                }
            };
            terms.push(encoded);
        }

        let info = DesignInfo::new(formula, parsed.intercept, terms);
        if info.column_names.is_empty() {
            return Err(DesignError::EmptyDesign {
                formula: formula.to_string(),
            });
        }
        let x = info.design(table)?;
        Ok((x, info))
    }

    fn apply(
        &self,
        metadata: &DesignInfo,
        table: &CovariateTable,
    ) -> Result<Array2<f64>, DesignError> {
        metadata.design(table)
    }
}

/// Encoding rules captured when a design was built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesignInfo {
    formula: String,
    intercept: bool,
    terms: Vec<EncodedTerm>,
    column_names: Vec<String>,
}

/// One formula term with its training-time statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EncodedTerm {
    Numeric {
        column: String,
    },
    Treatment {
        column: String,
        label: String,
        /// All levels seen at build time, sorted.
        levels: Vec<String>,
        /// Level without an indicator column, `None` when fully coded.
        reference: Option<String>,
        /// `C(..)` accepts numeric columns; a bare name must stay categorical.
        forced: bool,
    },
    Scaled {
        column: String,
        mean: f64,
        sd: f64,
    },
    Centered {
        column: String,
        mean: f64,
    },
    Power {
        column: String,
        exponent: i32,
    },
    Product {
        columns: Vec<String>,
    },
}

impl EncodedTerm {
    fn column_names(&self) -> Vec<String> {
        match self {
            EncodedTerm::Numeric { column } => vec![column.clone()],
            EncodedTerm::Treatment {
                label, reference, ..
            } => {
                let prefix = if reference.is_some() { "T." } else { "" };
                self.coded_levels()
                    .map(|level| format!("{label}[{prefix}{level}]"))
                    .collect()
            }
            EncodedTerm::Scaled { column, .. } => vec![format!("scale({column})")],
            EncodedTerm::Centered { column, .. } => vec![format!("center({column})")],
            EncodedTerm::Power { column, exponent } => vec![format!("I({column} ** {exponent})")],
            EncodedTerm::Product { columns } => vec![columns.join(":")],
        }
    }

    fn coded_levels(&self) -> impl Iterator<Item = &String> {
        let (levels, reference) = match self {
            EncodedTerm::Treatment {
                levels, reference, ..
            } => (levels.as_slice(), reference.as_ref()),
            _ => (&[][..], None),
        };
        levels.iter().filter(move |l| Some(*l) != reference)
    }

    fn append_columns(
        &self,
        table: &CovariateTable,
        out: &mut Vec<Vec<f64>>,
    ) -> Result<(), DesignError> {
        match self {
            EncodedTerm::Numeric { column } => out.push(numeric(table, column)?.to_vec()),
            EncodedTerm::Treatment {
                column,
                levels,
                forced,
                ..
            } => {
                if !forced && matches!(lookup(table, column)?, Column::Numeric(_)) {
                    return Err(DesignError::KindMismatch {
                        column: column.clone(),
                        expected: "categorical",
                    });
                }
                let values = level_values(table, column)?;
                if let Some(level) = values.iter().find(|v| !levels.contains(v)) {
                    return Err(DesignError::UnknownLevel {
                        column: column.clone(),
                        level: level.clone(),
                    });
                }
                for level in self.coded_levels() {
                    out.push(
                        values
                            .iter()
                            .map(|v| if v == level { 1.0 } else { 0.0 })
                            .collect(),
                    );
                }
            }
            EncodedTerm::Scaled { column, mean, sd } => {
                out.push(numeric(table, column)?.iter().map(|v| (v - mean) / sd).collect());
            }
            EncodedTerm::Centered { column, mean } => {
                out.push(numeric(table, column)?.iter().map(|v| v - mean).collect());
            }
            EncodedTerm::Power { column, exponent } => {
                out.push(numeric(table, column)?.iter().map(|v| v.powi(*exponent)).collect());
            }
            EncodedTerm::Product { columns } => {
                let mut product = vec![1.0; table.n_rows()];
                for column in columns {
                    for (p, v) in product.iter_mut().zip(numeric(table, column)?) {
                        *p *= v;
                    }
                }
                out.push(product);
            }
        }
        Ok(())
    }
}

impl DesignInfo {
    fn new(formula: &str, intercept: bool, terms: Vec<EncodedTerm>) -> Self {
        let mut column_names = Vec::new();
        if intercept {
            column_names.push(INTERCEPT.to_string());
        }
        for term in &terms {
            column_names.extend(term.column_names());
        }
        Self {
            formula: formula.to_string(),
            intercept,
            terms,
            column_names,
        }
    }

    /// Encode `table` with the stored rules.
    ///
    /// # Errors
    /// Fails on missing columns, unseen levels, kind changes, non-finite
    /// values, or if the produced width differs from the stored column names.
    pub fn design(&self, table: &CovariateTable) -> Result<Array2<f64>, DesignError> {
        let n_rows = table.n_rows();
        let mut columns: Vec<Vec<f64>> = Vec::with_capacity(self.column_names.len());
        if self.intercept {
            columns.push(vec![1.0; n_rows]);
        }
        for term in &self.terms {
            term.append_columns(table, &mut columns)?;
        }
        if columns.len() != self.column_names.len() {
            return Err(DesignError::ColumnCount {
                expected: self.column_names.len(),
                found: columns.len(),
            });
        }
        let mut x = Array2::zeros((n_rows, columns.len()));
        for (j, column) in columns.iter().enumerate() {
            for (i, &v) in column.iter().enumerate() {
                x[[i, j]] = v;
            }
        }
        Ok(x)
    }
}

impl DesignMetadata for DesignInfo {
    fn formula(&self) -> &str {
        &self.formula
    }

    fn column_names(&self) -> &[String] {
        &self.column_names
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Term {
    Plain(String),
    Categorical(String),
    Scale(String),
    Center(String),
    Power(String, i32),
    Interaction(Vec<String>),
}

impl Term {
    fn label(&self) -> String {
        match self {
            Term::Plain(c) => c.clone(),
            Term::Categorical(c) => format!("C({c})"),
            Term::Scale(c) => format!("scale({c})"),
            Term::Center(c) => format!("center({c})"),
            Term::Power(c, k) => format!("I({c} ** {k})"),
            Term::Interaction(cs) => cs.join(":"),
        }
    }
}

#[derive(Debug)]
struct ParsedFormula {
    intercept: bool,
    terms: Vec<Term>,
}

fn parse(formula: &str) -> Result<ParsedFormula, DesignError> {
    let fail = |reason: &str| DesignError::Parse {
        formula: formula.to_string(),
        reason: reason.to_string(),
    };
    let trimmed = formula.trim();
    let rhs = trimmed.strip_prefix('~').unwrap_or(trimmed);
    if rhs.contains('~') {
        return Err(fail("left-hand side variables are not supported"));
    }

    let mut pieces: Vec<(bool, String)> = Vec::new();
    let mut current = String::new();
    let mut negative = false;
    let mut depth = 0i32;
    for ch in rhs.chars() {
        match ch {
            '(' => {
                depth += 1;
                current.push(ch);
            }
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return Err(fail("unbalanced parentheses"));
                }
                current.push(ch);
            }
            '+' | '-' if depth == 0 => {
                pieces.push((negative, std::mem::take(&mut current)));
                negative = ch == '-';
            }
            _ => current.push(ch),
        }
    }
    if depth != 0 {
        return Err(fail("unbalanced parentheses"));
    }
    pieces.push((negative, current));

    let mut intercept = true;
    let mut terms: Vec<Term> = Vec::new();
    for (idx, (negative, raw)) in pieces.iter().enumerate() {
        let text = raw.trim();
        if text.is_empty() {
            if idx == 0 {
                continue;
            }
            return Err(fail("empty term"));
        }
        match text {
            "1" => intercept = !negative,
            "0" => intercept = *negative,
            _ if *negative => return Err(fail("only the intercept can be removed")),
            _ => {
                let term = parse_term(text).map_err(|reason| fail(&reason))?;
                if !terms.iter().any(|t| t.label() == term.label()) {
                    terms.push(term);
                }
            }
        }
    }
    Ok(ParsedFormula { intercept, terms })
}

fn parse_term(text: &str) -> Result<Term, String> {
    if text.contains(':') {
        let parts = text
            .split(':')
            .map(|p| identifier(p.trim()))
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(Term::Interaction(parts));
    }
    if let Some(inner) = call(text, "C") {
        return Ok(Term::Categorical(identifier(inner)?));
    }
    if let Some(inner) = call(text, "scale") {
        return Ok(Term::Scale(identifier(inner)?));
    }
    if let Some(inner) = call(text, "center") {
        return Ok(Term::Center(identifier(inner)?));
    }
    if let Some(inner) = call(text, "I") {
        let (base, exponent) = inner
            .split_once("**")
            .or_else(|| inner.split_once('^'))
            .ok_or_else(|| format!("`{text}`: only powers are supported inside I()"))?;
        let exponent = exponent
            .trim()
            .parse::<i32>()
            .map_err(|_| format!("`{text}`: exponent must be an integer"))?;
        return Ok(Term::Power(identifier(base.trim())?, exponent));
    }
    Ok(Term::Plain(identifier(text)?))
}

fn call<'a>(text: &'a str, name: &str) -> Option<&'a str> {
    text.strip_prefix(name)?
        .trim_start()
        .strip_prefix('(')?
        .strip_suffix(')')
        .map(str::trim)
}

fn identifier(text: &str) -> Result<String, String> {
    let valid = text
        .chars()
        .next()
        .is_some_and(|c| c.is_alphabetic() || c == '_')
        && text.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '.');
    if valid {
        Ok(text.to_string())
    } else {
        Err(format!("`{text}` is not a column name"))
    }
}

fn lookup<'t>(table: &'t CovariateTable, column: &str) -> Result<&'t Column, DesignError> {
    table.column(column).ok_or_else(|| DesignError::MissingColumn {
        column: column.to_string(),
    })
}

fn numeric<'t>(table: &'t CovariateTable, column: &str) -> Result<&'t [f64], DesignError> {
    match lookup(table, column)? {
        Column::Numeric(values) => {
            if let Some(row) = values.iter().position(|v| !v.is_finite()) {
                return Err(DesignError::NonFinite {
                    column: column.to_string(),
                    row,
                });
            }
            Ok(values)
        }
        Column::Categorical(_) => Err(DesignError::KindMismatch {
            column: column.to_string(),
            expected: "numeric",
        }),
    }
}

/// Level labels for every row; numeric values are formatted.
fn level_values(table: &CovariateTable, column: &str) -> Result<Vec<String>, DesignError> {
    match lookup(table, column)? {
        Column::Categorical(values) => Ok(values.clone()),
        Column::Numeric(_) => Ok(numeric(table, column)?
            .iter()
            .map(|v| format!("{v}"))
            .collect()),
    }
}

fn sorted_levels(table: &CovariateTable, column: &str) -> Result<Vec<String>, DesignError> {
    match lookup(table, column)? {
        Column::Categorical(values) => Ok(values
            .iter()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()),
        Column::Numeric(_) => {
            let mut values = numeric(table, column)?.to_vec();
            values.sort_by(f64::total_cmp);
            values.dedup();
            Ok(values.iter().map(|v| format!("{v}")).collect())
        }
    }
}

fn treatment(
    table: &CovariateTable,
    column: String,
    label: String,
    forced: bool,
    full_coding_pending: &mut bool,
) -> Result<EncodedTerm, DesignError> {
    let levels = sorted_levels(table, &column)?;
    let reference = if *full_coding_pending {
        *full_coding_pending = false;
        None
    } else {
        levels.first().cloned()
    };
    Ok(EncodedTerm::Treatment {
        column,
        label,
        levels,
        reference,
        forced,
    })
}

/// Mean and population standard deviation.
fn moments(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}
