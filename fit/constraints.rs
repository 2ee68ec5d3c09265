//! Linear equality constraints on the coefficients of one design matrix.
//!
//! A constraint matrix has one row per constraint and one column per full
//! parameter. Each row carries exactly one `-1` marking the parameter it defines;
//! its other non-zero entries are weights on parameters that are already known.
//! The dependent parameter is the negative weighted sum of those, so that
//! `θ_dep + Σ C[i, c] θ_c = 0` holds for every row.

use ndarray::{Array1, Array2, ArrayView2, Axis, s};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConstraintError {
    #[error("Constraint row {row} has no entry equal to -1 marking its dependent parameter.")]
    MissingDependent { row: usize },

    #[error("Constraint row {row} has {count} entries equal to -1; exactly one is required.")]
    MultipleDependents { row: usize, count: usize },

    #[error("Parameter {column} is defined by both constraint rows {first} and {second}.")]
    DuplicateDependent {
        column: usize,
        first: usize,
        second: usize,
    },

    #[error(
        "Constraint row {row} references parameter {column}, which is only defined by a later constraint. Rows may depend on independent parameters or on earlier rows."
    )]
    StructuralIdentifiability { row: usize, column: usize },

    #[error("Constraint matrix has a non-finite entry at row {row}, column {column}.")]
    NonFinite { row: usize, column: usize },

    #[error("Parameter tensor has {found} rows but {expected} were expected.")]
    ShapeMismatch { expected: usize, found: usize },

    #[error(
        "Constraint matrix has {found} columns, but the design matrix it constrains has {expected}."
    )]
    DesignColumnMismatch { expected: usize, found: usize },

    #[error(
        "Initial location coefficients cover {loc} features, but the scale coefficients cover {scale}."
    )]
    FeatureCountMismatch { loc: usize, scale: usize },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

/// Splits a parameter vector into independent and dependent parts and rebuilds
/// the full vector from the independent part.
#[derive(Clone, Debug)]
pub struct ConstraintReducer {
    n_params: usize,
    independent: Vec<usize>,
    dependent: Vec<usize>,
    /// Per row: (position in the resolved list, weight) for every referenced parameter.
    terms: Vec<Vec<(usize, f64)>>,
    /// Row selection that restores design-column order from the resolved list.
    order: Vec<usize>,
}

impl ConstraintReducer {
    /// Validates `constraints` and precomputes the resolution order.
    pub fn new(constraints: ArrayView2<f64>) -> Result<Self, ConstraintError> {
        let (n_rows, n_params) = constraints.dim();

        let mut dependent = Vec::with_capacity(n_rows);
        let mut defining_row: Vec<Option<usize>> = vec![None; n_params];
        for (row, values) in constraints.axis_iter(Axis(0)).enumerate() {
            let mut marker = None;
            let mut count = 0;
            for (column, &value) in values.iter().enumerate() {
                if !value.is_finite() {
                    return Err(ConstraintError::NonFinite { row, column });
                }
                if value == -1.0 {
                    count += 1;
                    if marker.is_none() {
                        marker = Some(column);
                    }
                }
            }
            let column = match (marker, count) {
                (None, _) => return Err(ConstraintError::MissingDependent { row }),
                (Some(column), 1) => column,
                (Some(_), count) => return Err(ConstraintError::MultipleDependents { row, count }),
            };
            if let Some(first) = defining_row[column] {
                return Err(ConstraintError::DuplicateDependent {
                    column,
                    first,
                    second: row,
                });
            }
            defining_row[column] = Some(row);
            dependent.push(column);
        }

        let independent: Vec<usize> = (0..n_params)
            .filter(|&column| defining_row[column].is_none())
            .collect();
        let mut independent_position = vec![usize::MAX; n_params];
        for (position, &column) in independent.iter().enumerate() {
            independent_position[column] = position;
        }

        let n_independent = independent.len();
        let mut terms = Vec::with_capacity(n_rows);
        for (row, values) in constraints.axis_iter(Axis(0)).enumerate() {
            let mut row_terms = Vec::new();
            for (column, &weight) in values.iter().enumerate() {
                if weight == 0.0 || column == dependent[row] {
                    continue;
                }
                let position = match defining_row[column] {
                    None => independent_position[column],
                    Some(earlier) if earlier < row => n_independent + earlier,
                    Some(_) => {
                        return Err(ConstraintError::StructuralIdentifiability { row, column });
                    }
                };
                row_terms.push((position, weight));
            }
            terms.push(row_terms);
        }

        // argsort of (independent ++ dependent) maps design columns back to resolved rows.
        let resolved_columns: Vec<usize> = independent.iter().chain(&dependent).copied().collect();
        let mut order: Vec<usize> = (0..n_params).collect();
        order.sort_by_key(|&position| resolved_columns[position]);

        Ok(Self {
            n_params,
            independent,
            dependent,
            terms,
            order,
        })
    }

    /// Reducer for a design without constraints: every parameter is independent.
    pub fn unconstrained(n_params: usize) -> Self {
        Self {
            n_params,
            independent: (0..n_params).collect(),
            dependent: Vec::new(),
            terms: Vec::new(),
            order: (0..n_params).collect(),
        }
    }

    /// Builds a reducer from an optional constraint matrix for a design with `n_params` columns.
    pub fn from_optional(
        constraints: Option<ArrayView2<f64>>,
        n_params: usize,
    ) -> Result<Self, ConstraintError> {
        match constraints {
            None => Ok(Self::unconstrained(n_params)),
            Some(matrix) if matrix.ncols() != n_params => {
                Err(ConstraintError::DesignColumnMismatch {
                    expected: n_params,
                    found: matrix.ncols(),
                })
            }
            Some(matrix) => Self::new(matrix),
        }
    }

    pub fn n_params(&self) -> usize {
        self.n_params
    }

    pub fn n_independent(&self) -> usize {
        self.independent.len()
    }

    pub fn independent_indices(&self) -> &[usize] {
        &self.independent
    }

    /// Dependent column of each constraint row, in declaration order.
    pub fn dependent_indices(&self) -> &[usize] {
        &self.dependent
    }

    pub fn is_unconstrained(&self) -> bool {
        self.dependent.is_empty()
    }

    /// Rebuilds the full `n_params × features` tensor.
    ///
    /// Exactly one of `full` and `independent` must be given. When `full` is
    /// supplied only its independent rows are read; the dependent rows are
    /// recomputed from them.
    pub fn reconstruct(
        &self,
        full: Option<ArrayView2<f64>>,
        independent: Option<ArrayView2<f64>>,
    ) -> Result<Array2<f64>, ConstraintError> {
        match (full, independent) {
            (Some(_), Some(_)) => Err(ConstraintError::InvalidArgument(
                "supply either the full parameters or the independent parameters, not both"
                    .to_string(),
            )),
            (None, None) => Err(ConstraintError::InvalidArgument(
                "either the full parameters or the independent parameters must be supplied"
                    .to_string(),
            )),
            (Some(full), None) => {
                self.check_rows(full.nrows(), self.n_params)?;
                Ok(self.expand(self.independent_rows(full).view()))
            }
            (None, Some(independent)) => {
                self.check_rows(independent.nrows(), self.n_independent())?;
                Ok(self.expand(independent))
            }
        }
    }

    /// Selects the independent rows of a full parameter tensor.
    pub fn independent_rows(&self, full: ArrayView2<f64>) -> Array2<f64> {
        full.select(Axis(0), &self.independent)
    }

    /// Linear map `M` with `full = M · independent`.
    pub fn reconstruction_matrix(&self) -> Array2<f64> {
        let k = self.n_independent();
        self.expand(Array2::eye(k).view())
    }

    /// `θ_dep + Σ C[i, c] θ_c` per constraint row and feature; zero when satisfied.
    pub fn residuals(&self, full: ArrayView2<f64>) -> Array2<f64> {
        let resolved_columns: Vec<usize> = self
            .independent
            .iter()
            .chain(&self.dependent)
            .copied()
            .collect();
        let mut residuals = Array2::zeros((self.dependent.len(), full.ncols()));
        for (row, (terms, &target)) in self.terms.iter().zip(&self.dependent).enumerate() {
            let mut out = residuals.row_mut(row);
            out.assign(&full.row(target));
            for &(position, weight) in terms {
                out.scaled_add(weight, &full.row(resolved_columns[position]));
            }
        }
        residuals
    }

    fn check_rows(&self, found: usize, expected: usize) -> Result<(), ConstraintError> {
        if found != expected {
            return Err(ConstraintError::ShapeMismatch { expected, found });
        }
        Ok(())
    }

    fn expand(&self, independent: ArrayView2<f64>) -> Array2<f64> {
        let n_independent = self.n_independent();
        let n_features = independent.ncols();
        let mut resolved = Array2::<f64>::zeros((self.n_params, n_features));
        resolved
            .slice_mut(s![..n_independent, ..])
            .assign(&independent);

        for (row, terms) in self.terms.iter().enumerate() {
            let mut value = Array1::<f64>::zeros(n_features);
            for &(position, weight) in terms {
                value.scaled_add(-weight, &resolved.row(position));
            }
            resolved.row_mut(n_independent + row).assign(&value);
        }

        resolved.select(Axis(0), &self.order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_independent(rng: &mut StdRng, rows: usize, features: usize) -> Array2<f64> {
        Array2::from_shape_fn((rows, features), |_| rng.gen_range(-3.0..3.0))
    }

    #[test]
    fn sum_to_zero_constraint_defines_last_level() {
        // intercept, batch1, batch2, batch3 with batch effects summing to zero
        let c = array![[0.0, 1.0, 1.0, -1.0]];
        let reducer = ConstraintReducer::new(c.view()).unwrap();
        assert_eq!(reducer.independent_indices(), &[0, 1, 2]);
        assert_eq!(reducer.dependent_indices(), &[3]);

        let independent = array![[0.5], [1.0], [2.0]];
        let full = reducer.reconstruct(None, Some(independent.view())).unwrap();
        assert_eq!(full, array![[0.5], [1.0], [2.0], [-3.0]]);
    }

    #[test]
    fn chained_constraints_satisfy_every_row() {
        // column 4 depends on 0 and 1; column 2 depends on column 4 (an earlier row) and 3
        let c = array![
            [1.0, 1.0, 0.0, 0.0, -1.0, 0.0],
            [0.0, 0.0, -1.0, 2.0, 0.5, 0.0],
            [0.0, 0.0, 1.0, 0.0, 0.0, -1.0],
        ];
        let reducer = ConstraintReducer::new(c.view()).unwrap();
        assert_eq!(reducer.independent_indices(), &[0, 1, 3]);
        assert_eq!(reducer.n_independent() + reducer.dependent_indices().len(), 6);

        let mut rng = StdRng::seed_from_u64(3);
        let independent = random_independent(&mut rng, 3, 7);
        let full = reducer.reconstruct(None, Some(independent.view())).unwrap();

        for (row, dependent) in reducer.dependent_indices().iter().enumerate() {
            for feature in 0..full.ncols() {
                let mut combination = full[[*dependent, feature]];
                for column in 0..c.ncols() {
                    if column != *dependent {
                        combination += c[[row, column]] * full[[column, feature]];
                    }
                }
                assert_abs_diff_eq!(combination, 0.0, epsilon = 1e-12);
            }
        }
        assert!(reducer.residuals(full.view()).iter().all(|r| r.abs() < 1e-12));
        assert_eq!(reducer.independent_rows(full.view()), independent);
    }

    #[test]
    fn full_input_recomputes_dependent_rows() {
        let c = array![[0.0, 1.0, -1.0]];
        let reducer = ConstraintReducer::new(c.view()).unwrap();
        let inconsistent = array![[1.0, 2.0], [3.0, 4.0], [100.0, 100.0]];
        let full = reducer.reconstruct(Some(inconsistent.view()), None).unwrap();
        assert_eq!(full, array![[1.0, 2.0], [3.0, 4.0], [-3.0, -4.0]]);
    }

    #[test]
    fn reconstruction_matrix_is_linear_map() {
        let c = array![[1.0, 1.0, -1.0, 0.0], [0.0, 0.0, 1.0, -1.0]];
        let reducer = ConstraintReducer::new(c.view()).unwrap();
        let m = reducer.reconstruction_matrix();
        assert_eq!(m.dim(), (4, 2));

        let mut rng = StdRng::seed_from_u64(11);
        let independent = random_independent(&mut rng, 2, 5);
        let full = reducer.reconstruct(None, Some(independent.view())).unwrap();
        let mapped = m.dot(&independent);
        for (x, y) in full.iter().zip(mapped.iter()) {
            assert_abs_diff_eq!(*x, *y, epsilon = 1e-12);
        }
    }

    #[test]
    fn unconstrained_reducer_is_identity() {
        let reducer = ConstraintReducer::from_optional(None, 3).unwrap();
        assert!(reducer.is_unconstrained());
        let params = array![[1.0], [2.0], [3.0]];
        assert_eq!(reducer.reconstruct(None, Some(params.view())).unwrap(), params);
        assert_eq!(reducer.reconstruction_matrix(), Array2::<f64>::eye(3));
    }

    #[test]
    fn both_or_neither_arguments_are_rejected() {
        let reducer = ConstraintReducer::unconstrained(2);
        let params = array![[1.0], [2.0]];
        assert!(matches!(
            reducer.reconstruct(Some(params.view()), Some(params.view())),
            Err(ConstraintError::InvalidArgument(_))
        ));
        assert!(matches!(
            reducer.reconstruct(None, None),
            Err(ConstraintError::InvalidArgument(_))
        ));
    }

    #[test]
    fn malformed_constraints_fail_fast() {
        let missing = array![[1.0, 1.0, 0.0]];
        assert_eq!(
            ConstraintReducer::new(missing.view()).unwrap_err(),
            ConstraintError::MissingDependent { row: 0 }
        );

        let twice = array![[-1.0, 1.0, -1.0]];
        assert_eq!(
            ConstraintReducer::new(twice.view()).unwrap_err(),
            ConstraintError::MultipleDependents { row: 0, count: 2 }
        );

        let duplicate = array![[-1.0, 1.0, 0.0], [-1.0, 0.0, 1.0]];
        assert_eq!(
            ConstraintReducer::new(duplicate.view()).unwrap_err(),
            ConstraintError::DuplicateDependent {
                column: 0,
                first: 0,
                second: 1
            }
        );

        // row 0 reads column 3, which row 1 defines afterwards
        let backward = array![[1.0, 0.0, -1.0, 1.0], [1.0, 1.0, 0.0, -1.0]];
        assert_eq!(
            ConstraintReducer::new(backward.view()).unwrap_err(),
            ConstraintError::StructuralIdentifiability { row: 0, column: 3 }
        );
    }

    #[test]
    fn shape_mismatches_are_reported() {
        let c = array![[1.0, -1.0]];
        let reducer = ConstraintReducer::new(c.view()).unwrap();
        let wrong = array![[1.0], [2.0], [3.0]];
        assert_eq!(
            reducer.reconstruct(None, Some(wrong.view())).unwrap_err(),
            ConstraintError::ShapeMismatch {
                expected: 1,
                found: 3
            }
        );

        let err = ConstraintReducer::from_optional(Some(c.view()), 3).unwrap_err();
        assert_eq!(
            err,
            ConstraintError::DesignColumnMismatch {
                expected: 3,
                found: 2
            }
        );
        assert!(err.to_string().starts_with("Constraint matrix has 2 columns"));
    }
}
