//! # Fit input
//!
//! Validated containers for the observation×feature matrix, the two design
//! matrices and the optional offset and constraint matrices, plus loaders for
//! tab-separated tables.
//!
//! - Every input shares the observation axis; mismatches are rejected up front.
//! - Design columns keep their names so fitted coefficients can be reported
//!   against them.
//! - Failures are assumed to be user-input errors and carry the offending
//!   location.

use crate::model::Family;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DataError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to read tab-separated file: {0}")]
    Csv(#[from] csv::Error),

    #[error("The file '{0}' contains no data rows.")]
    EmptyTable(String),

    #[error("Could not parse '{value}' in '{path}' (line {line}, column '{column}') as a number.")]
    Parse {
        path: String,
        line: usize,
        column: String,
        value: String,
    },

    #[error("Line {line} of '{path}' has {found} fields, expected {expected}.")]
    RaggedRow {
        path: String,
        line: usize,
        expected: usize,
        found: usize,
    },

    #[error("{what} has {found} observations, but the count matrix has {expected}.")]
    ObservationCountMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("{what} has {found} column names for {expected} columns.")]
    NameCountMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("{what} contains a non-finite value at row {row}, column {column}.")]
    NonFinite {
        what: &'static str,
        row: usize,
        column: usize,
    },

    #[error(
        "The count matrix contains a negative value at observation {row}, feature {column}; negative-binomial models need non-negative counts."
    )]
    NegativeCount { row: usize, column: usize },

    #[error("{what} must have at least one column.")]
    NoColumns { what: &'static str },
}

/// A dense design matrix whose columns carry coefficient names.
#[derive(Clone, Debug, PartialEq)]
pub struct DesignMatrix {
    values: Array2<f64>,
    column_names: Vec<String>,
}

impl DesignMatrix {
    pub fn new(values: Array2<f64>, column_names: Vec<String>) -> Result<Self, DataError> {
        if values.ncols() == 0 {
            return Err(DataError::NoColumns {
                what: "Design matrix",
            });
        }
        if column_names.len() != values.ncols() {
            return Err(DataError::NameCountMismatch {
                what: "Design matrix",
                expected: values.ncols(),
                found: column_names.len(),
            });
        }
        check_finite("Design matrix", values.view())?;
        Ok(Self {
            values,
            column_names,
        })
    }

    /// Single column of ones named `intercept`.
    pub fn intercept(n_observations: usize) -> Self {
        Self {
            values: Array2::ones((n_observations, 1)),
            column_names: vec!["intercept".to_string()],
        }
    }

    /// Columns named `x0`, `x1`, ...
    pub fn unnamed(values: Array2<f64>) -> Result<Self, DataError> {
        let names = (0..values.ncols()).map(|j| format!("x{j}")).collect();
        Self::new(values, names)
    }

    pub fn nrows(&self) -> usize {
        self.values.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.values.ncols()
    }

    pub fn values(&self) -> ArrayView2<'_, f64> {
        self.values.view()
    }

    pub fn column_names(&self) -> &[String] {
        &self.column_names
    }
}

/// Everything a fit reads, validated against a shared observation axis.
#[derive(Clone, Debug)]
pub struct FitData {
    /// Observations × features.
    pub x: Array2<f64>,
    pub design_loc: DesignMatrix,
    pub design_scale: DesignMatrix,
    /// Additive offset on the location linear predictor (log size factors for
    /// the negative-binomial family).
    pub offset: Option<Array1<f64>>,
    pub constraints_loc: Option<Array2<f64>>,
    pub constraints_scale: Option<Array2<f64>>,
    pub feature_names: Vec<String>,
}

impl FitData {
    pub fn new(
        x: Array2<f64>,
        design_loc: DesignMatrix,
        design_scale: DesignMatrix,
    ) -> Result<Self, DataError> {
        check_finite("Count matrix", x.view())?;
        let n_obs = x.nrows();
        for (what, found) in [
            ("Location design", design_loc.nrows()),
            ("Scale design", design_scale.nrows()),
        ] {
            if found != n_obs {
                return Err(DataError::ObservationCountMismatch {
                    what,
                    expected: n_obs,
                    found,
                });
            }
        }
        let feature_names = (0..x.ncols()).map(|j| format!("feature_{j}")).collect();
        Ok(Self {
            x,
            design_loc,
            design_scale,
            offset: None,
            constraints_loc: None,
            constraints_scale: None,
            feature_names,
        })
    }

    pub fn with_offset(mut self, offset: Array1<f64>) -> Result<Self, DataError> {
        if offset.len() != self.n_observations() {
            return Err(DataError::ObservationCountMismatch {
                what: "Offset",
                expected: self.n_observations(),
                found: offset.len(),
            });
        }
        if let Some(row) = offset.iter().position(|v| !v.is_finite()) {
            return Err(DataError::NonFinite {
                what: "Offset",
                row,
                column: 0,
            });
        }
        self.offset = Some(offset);
        Ok(self)
    }

    /// Converts natural-scale size factors to the log offset.
    pub fn with_size_factors(self, size_factors: ArrayView1<f64>) -> Result<Self, DataError> {
        self.with_offset(size_factors.mapv(f64::ln))
    }

    pub fn with_constraints_loc(mut self, constraints: Array2<f64>) -> Self {
        self.constraints_loc = Some(constraints);
        self
    }

    pub fn with_constraints_scale(mut self, constraints: Array2<f64>) -> Self {
        self.constraints_scale = Some(constraints);
        self
    }

    pub fn with_feature_names(mut self, names: Vec<String>) -> Result<Self, DataError> {
        if names.len() != self.n_features() {
            return Err(DataError::NameCountMismatch {
                what: "Count matrix",
                expected: self.n_features(),
                found: names.len(),
            });
        }
        self.feature_names = names;
        Ok(self)
    }

    pub fn n_observations(&self) -> usize {
        self.x.nrows()
    }

    pub fn n_features(&self) -> usize {
        self.x.ncols()
    }

    /// Family-specific checks on the response values.
    pub fn validate_for(&self, family: Family) -> Result<(), DataError> {
        if matches!(family, Family::NegativeBinomial) {
            for ((row, column), &value) in self.x.indexed_iter() {
                if value < 0.0 {
                    return Err(DataError::NegativeCount { row, column });
                }
            }
        }
        Ok(())
    }
}

fn check_finite(what: &'static str, values: ArrayView2<f64>) -> Result<(), DataError> {
    match values.indexed_iter().find(|(_, v)| !v.is_finite()) {
        Some(((row, column), _)) => Err(DataError::NonFinite { what, row, column }),
        None => Ok(()),
    }
}

/// A numeric table read from disk: first column holds row identifiers, the
/// header names the remaining columns.
#[derive(Clone, Debug)]
pub struct Table {
    pub row_names: Vec<String>,
    pub column_names: Vec<String>,
    pub values: Array2<f64>,
}

/// Reads a tab-separated table with a header line and a leading identifier column.
pub fn load_table(path: &Path) -> Result<Table, DataError> {
    let display = path.display().to_string();
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .flexible(true)
        .from_path(path)?;

    let headers = reader.headers()?.clone();
    let column_names: Vec<String> = headers.iter().skip(1).map(str::to_string).collect();
    let n_cols = column_names.len();

    let mut row_names = Vec::new();
    let mut flat = Vec::new();
    for (index, record) in reader.records().enumerate() {
        let record = record?;
        let line = index + 2;
        if record.len() != n_cols + 1 {
            return Err(DataError::RaggedRow {
                path: display,
                line,
                expected: n_cols + 1,
                found: record.len(),
            });
        }
        row_names.push(record.get(0).unwrap_or_default().to_string());
        for (field, name) in record.iter().skip(1).zip(&column_names) {
            let value = field.trim().parse::<f64>().map_err(|_| DataError::Parse {
                path: display.clone(),
                line,
                column: name.clone(),
                value: field.to_string(),
            })?;
            flat.push(value);
        }
    }

    if row_names.is_empty() {
        return Err(DataError::EmptyTable(display));
    }
    let values = Array2::from_shape_vec((row_names.len(), n_cols), flat)
        .map_err(|_| DataError::EmptyTable(display))?;
    Ok(Table {
        row_names,
        column_names,
        values,
    })
}

/// Reads a design matrix table, keeping its column names.
pub fn load_design(path: &Path) -> Result<DesignMatrix, DataError> {
    let table = load_table(path)?;
    DesignMatrix::new(table.values, table.column_names)
}

/// Reads a one-value-per-row table such as size factors.
pub fn load_vector(path: &Path) -> Result<Array1<f64>, DataError> {
    let table = load_table(path)?;
    if table.values.ncols() != 1 {
        return Err(DataError::NameCountMismatch {
            what: "Vector table",
            expected: 1,
            found: table.values.ncols(),
        });
    }
    Ok(table.values.column(0).to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_tsv(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn loads_table_with_names() {
        let file = write_tsv("id\tgeneA\tgeneB\nobs1\t3\t0\nobs2\t5\t1.5\n");
        let table = load_table(file.path()).unwrap();
        assert_eq!(table.row_names, vec!["obs1", "obs2"]);
        assert_eq!(table.column_names, vec!["geneA", "geneB"]);
        assert_eq!(table.values, array![[3.0, 0.0], [5.0, 1.5]]);
    }

    #[test]
    fn parse_errors_name_the_cell() {
        let file = write_tsv("id\tintercept\nobs1\t1\nobs2\tabc\n");
        match load_design(file.path()) {
            Err(DataError::Parse {
                line, column, value, ..
            }) => {
                assert_eq!(line, 3);
                assert_eq!(column, "intercept");
                assert_eq!(value, "abc");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn ragged_rows_are_rejected() {
        let file = write_tsv("id\ta\tb\nobs1\t1\n");
        assert!(matches!(
            load_table(file.path()),
            Err(DataError::RaggedRow { line: 2, .. })
        ));
    }

    #[test]
    fn fit_data_checks_observation_axis() {
        let x = Array2::<f64>::zeros((4, 2));
        let result = FitData::new(
            x.clone(),
            DesignMatrix::intercept(3),
            DesignMatrix::intercept(4),
        );
        assert!(matches!(
            result,
            Err(DataError::ObservationCountMismatch {
                expected: 4,
                found: 3,
                ..
            })
        ));

        let data = FitData::new(x, DesignMatrix::intercept(4), DesignMatrix::intercept(4)).unwrap();
        assert!(data.clone().with_offset(Array1::zeros(5)).is_err());
        let data = data.with_size_factors(array![1.0, 1.0, 1.0, 1.0].view()).unwrap();
        assert_eq!(data.offset.unwrap(), Array1::<f64>::zeros(4));
    }

    #[test]
    fn negative_counts_fail_only_for_negative_binomial() {
        let x = array![[1.0], [-2.0]];
        let data = FitData::new(x, DesignMatrix::intercept(2), DesignMatrix::intercept(2)).unwrap();
        assert!(matches!(
            data.validate_for(Family::NegativeBinomial),
            Err(DataError::NegativeCount { row: 1, column: 0 })
        ));
        assert!(data.validate_for(Family::normal()).is_ok());
    }

    #[test]
    fn design_names_must_match_columns() {
        let values = array![[1.0, 0.0], [1.0, 1.0]];
        assert!(DesignMatrix::new(values.clone(), vec!["intercept".into()]).is_err());
        let design =
            DesignMatrix::new(values, vec!["intercept".into(), "condition".into()]).unwrap();
        assert_eq!(design.column_names()[1], "condition");
    }
}
