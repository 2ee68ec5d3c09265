//! The trainable parameter block and the sub-views the optimizers work on.

use crate::bounds::{BoundedQuantity, ParamBounds};
use crate::constraints::{ConstraintError, ConstraintReducer};
use crate::data::FitData;
use crate::derivatives::AnalyticEngine;
use ndarray::{Array2, ArrayView2, Axis, concatenate, s};

/// How the trainable block maps onto the location and scale design matrices.
#[derive(Clone, Debug)]
pub struct ParameterLayout {
    pub loc: ConstraintReducer,
    pub scale: ConstraintReducer,
}

impl ParameterLayout {
    pub fn new(data: &FitData) -> Result<Self, ConstraintError> {
        Ok(Self {
            loc: ConstraintReducer::from_optional(
                data.constraints_loc.as_ref().map(|c| c.view()),
                data.design_loc.ncols(),
            )?,
            scale: ConstraintReducer::from_optional(
                data.constraints_scale.as_ref().map(|c| c.view()),
                data.design_scale.ncols(),
            )?,
        })
    }

    pub fn n_independent_loc(&self) -> usize {
        self.loc.n_independent()
    }

    pub fn n_independent(&self) -> usize {
        self.loc.n_independent() + self.scale.n_independent()
    }

    /// Splits a trainable block into its location and scale rows.
    pub fn split<'a>(
        &self,
        params: ArrayView2<'a, f64>,
    ) -> (ArrayView2<'a, f64>, ArrayView2<'a, f64>) {
        params.split_at(Axis(0), self.n_independent_loc())
    }

    /// Full `a` and `b` for a trainable block, clipped to the coefficient bounds.
    pub fn full_parameters(
        &self,
        params: ArrayView2<f64>,
        bounds: &ParamBounds,
    ) -> Result<(Array2<f64>, Array2<f64>), ConstraintError> {
        let (a_var, b_var) = self.split(params);
        let mut a = self.loc.reconstruct(None, Some(a_var))?;
        let mut b = self.scale.reconstruct(None, Some(b_var))?;
        bounds.clip_inplace(BoundedQuantity::LocationCoefficient, &mut a);
        bounds.clip_inplace(BoundedQuantity::ScaleCoefficient, &mut b);
        Ok((a, b))
    }

    /// Derivative engine over the constraint-reduced designs of `data`.
    pub fn engine(&self, data: &FitData) -> AnalyticEngine {
        AnalyticEngine::new(
            data.design_loc.values(),
            self.loc.reconstruction_matrix().view(),
            data.design_scale.values(),
            self.scale.reconstruction_matrix().view(),
        )
    }
}

/// Indices of the features still being optimized.
///
/// Rebuilt from the converged flags after every convergence update; the
/// optimizers gather copies of these columns and commit them back, so no view
/// aliases the parameter store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActiveSet {
    indices: Vec<usize>,
}

impl ActiveSet {
    pub fn all(n_features: usize) -> Self {
        Self {
            indices: (0..n_features).collect(),
        }
    }

    pub fn from_converged(converged: &[bool]) -> Self {
        Self {
            indices: converged
                .iter()
                .enumerate()
                .filter_map(|(feature, &done)| (!done).then_some(feature))
                .collect(),
        }
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Copies the active columns of `values`.
    pub fn gather(&self, values: ArrayView2<f64>) -> Array2<f64> {
        values.select(Axis(1), &self.indices)
    }

    /// Writes gathered columns back into their feature positions of `target`.
    pub fn scatter(&self, values: ArrayView2<f64>, target: &mut Array2<f64>) {
        for (column, &feature) in self.indices.iter().enumerate() {
            target.column_mut(feature).assign(&values.column(column));
        }
    }
}

/// Owns the trainable block: independent location rows followed by independent
/// scale rows, one column per feature.
#[derive(Clone, Debug)]
pub struct ModelVariables {
    params: Array2<f64>,
    layout: ParameterLayout,
    bounds: ParamBounds,
    converged: Vec<bool>,
}

impl ModelVariables {
    /// Seeds the block from full initial `a` and `b`; the initial values are
    /// clipped and only their independent rows are kept.
    pub fn new(
        layout: ParameterLayout,
        bounds: ParamBounds,
        init_a: ArrayView2<f64>,
        init_b: ArrayView2<f64>,
    ) -> Result<Self, ConstraintError> {
        if init_a.ncols() != init_b.ncols() {
            return Err(ConstraintError::FeatureCountMismatch {
                loc: init_a.ncols(),
                scale: init_b.ncols(),
            });
        }
        let mut a = layout.loc.reconstruct(Some(init_a), None)?;
        let mut b = layout.scale.reconstruct(Some(init_b), None)?;
        bounds.clip_inplace(BoundedQuantity::LocationCoefficient, &mut a);
        bounds.clip_inplace(BoundedQuantity::ScaleCoefficient, &mut b);

        let a_var = layout.loc.independent_rows(a.view());
        let b_var = layout.scale.independent_rows(b.view());
        let params = concatenate(Axis(0), &[a_var.view(), b_var.view()]).map_err(|_| {
            ConstraintError::FeatureCountMismatch {
                loc: a_var.ncols(),
                scale: b_var.ncols(),
            }
        })?;
        let n_features = params.ncols();
        Ok(Self {
            params,
            layout,
            bounds,
            converged: vec![false; n_features],
        })
    }

    pub fn layout(&self) -> &ParameterLayout {
        &self.layout
    }

    pub fn bounds(&self) -> &ParamBounds {
        &self.bounds
    }

    pub fn n_features(&self) -> usize {
        self.params.ncols()
    }

    pub fn params(&self) -> ArrayView2<'_, f64> {
        self.params.view()
    }

    pub fn a_var(&self) -> ArrayView2<'_, f64> {
        self.params.slice(s![..self.layout.n_independent_loc(), ..])
    }

    pub fn b_var(&self) -> ArrayView2<'_, f64> {
        self.params.slice(s![self.layout.n_independent_loc().., ..])
    }

    /// Full, clipped location coefficients.
    pub fn a(&self) -> Result<Array2<f64>, ConstraintError> {
        let mut a = self.layout.loc.reconstruct(None, Some(self.a_var()))?;
        self.bounds
            .clip_inplace(BoundedQuantity::LocationCoefficient, &mut a);
        Ok(a)
    }

    /// Full, clipped scale coefficients.
    pub fn b(&self) -> Result<Array2<f64>, ConstraintError> {
        let mut b = self.layout.scale.reconstruct(None, Some(self.b_var()))?;
        self.bounds.clip_inplace(BoundedQuantity::ScaleCoefficient, &mut b);
        Ok(b)
    }

    pub fn converged(&self) -> &[bool] {
        &self.converged
    }

    pub fn mark_converged(&mut self, feature: usize) {
        self.converged[feature] = true;
    }

    pub fn active_set(&self) -> ActiveSet {
        ActiveSet::from_converged(&self.converged)
    }

    /// Copies the trainable columns of the active features.
    pub fn gather(&self, active: &ActiveSet) -> Array2<f64> {
        active.gather(self.params.view())
    }

    /// Writes updated columns of the active features back into the store.
    pub fn commit(&mut self, active: &ActiveSet, values: ArrayView2<f64>) {
        active.scatter(values, &mut self.params);
    }
}
