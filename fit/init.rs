//! Closed-form starting values.
//!
//! Observations sharing a design row form a group. Per group and feature the
//! offset-normalized values give a mean and a variance; the linked group
//! statistics are then projected onto the constraint-reduced design by least
//! squares.

use crate::bounds::{BoundedQuantity, ParamBounds};
use crate::constraints::ConstraintReducer;
use crate::data::FitData;
use crate::estimate::EstimationError;
use crate::faer_ndarray::solve_symmetric;
use crate::model::{Family, ScaleLink};
use crate::variables::ParameterLayout;
use ahash::AHashMap;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Zip};

/// Dispersion used when a group shows no overdispersion.
const MAX_DISPERSION: f64 = 1e8;
const MIN_DISPERSION: f64 = 1e-8;

/// Full starting coefficients for a fit.
#[derive(Debug, Clone, PartialEq)]
pub struct InitialParameters {
    /// Location coefficients, design columns × features.
    pub a: Array2<f64>,
    /// Scale coefficients, design columns × features.
    pub b: Array2<f64>,
}

/// Source of starting values.
pub trait Initializer {
    fn initialize(
        &self,
        data: &FitData,
        family: Family,
        bounds: &ParamBounds,
    ) -> Result<InitialParameters, EstimationError>;
}

/// Least-squares fit of linked group statistics.
#[derive(Debug, Clone)]
pub struct ClosedFormEstimate {
    /// Per-group statistic before linking, groups × features.
    pub groupwise: Array2<f64>,
    /// Full coefficients, design columns × features.
    pub params: Array2<f64>,
    /// Root mean squared deviation of the fitted linked statistics, per feature.
    pub rmsd: Array1<f64>,
}

/// How a group statistic is mapped onto the linear predictor scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Link {
    Log,
    Identity,
}

impl Link {
    fn apply(self, value: f64, floor: f64) -> f64 {
        match self {
            Link::Log => value.max(floor).ln(),
            Link::Identity => value,
        }
    }

    /// Removes the per-observation offset from a value on the response scale.
    fn normalize(self, value: f64, offset: f64) -> f64 {
        match self {
            Link::Log => value * (-offset).exp(),
            Link::Identity => value - offset,
        }
    }
}

/// Groups observations by identical design rows.
#[derive(Debug, Clone)]
struct Groups {
    /// Group of every observation.
    membership: Vec<usize>,
    /// One representative design row per group.
    rows: Array2<f64>,
    sizes: Vec<usize>,
}

impl Groups {
    fn from_design(design: ArrayView2<f64>) -> Self {
        let mut lookup: AHashMap<Vec<u64>, usize> = AHashMap::new();
        let mut membership = Vec::with_capacity(design.nrows());
        let mut representatives = Vec::new();
        let mut sizes = Vec::new();
        for (obs, row) in design.axis_iter(Axis(0)).enumerate() {
            let key: Vec<u64> = row.iter().map(|v| v.to_bits()).collect();
            let next = lookup.len();
            let group = *lookup.entry(key).or_insert(next);
            if group == next {
                representatives.push(obs);
                sizes.push(0);
            }
            sizes[group] += 1;
            membership.push(group);
        }
        Self {
            membership,
            rows: design.select(Axis(0), &representatives),
            sizes,
        }
    }

    fn len(&self) -> usize {
        self.sizes.len()
    }

    /// Per-group mean and population variance of each feature.
    fn moments(&self, values: ArrayView2<f64>) -> (Array2<f64>, Array2<f64>) {
        let n_features = values.ncols();
        let mut sum = Array2::<f64>::zeros((self.len(), n_features));
        let mut sum_sq = Array2::<f64>::zeros((self.len(), n_features));
        for (row, &group) in values.axis_iter(Axis(0)).zip(&self.membership) {
            let mut s = sum.row_mut(group);
            s += &row;
            let mut sq = sum_sq.row_mut(group);
            sq.zip_mut_with(&row, |acc, &v| *acc += v * v);
        }
        let counts = Array1::from_iter(self.sizes.iter().map(|&n| n as f64)).insert_axis(Axis(1));
        let mean = &sum / &counts;
        let variance = (&sum_sq / &counts - &mean * &mean).mapv(|v| v.max(0.0));
        (mean, variance)
    }
}

fn normalized_values(
    x: ArrayView2<f64>,
    offset: Option<ArrayView1<f64>>,
    link: Link,
) -> Array2<f64> {
    match offset {
        Some(offset) => {
            let mut values = x.to_owned();
            for (mut row, &o) in values.axis_iter_mut(Axis(0)).zip(offset.iter()) {
                row.mapv_inplace(|v| link.normalize(v, o));
            }
            values
        }
        None => x.to_owned(),
    }
}

/// Fits `linked ≈ G · M · θ` by least squares and reports the full `M · θ`.
fn project(
    groups: &Groups,
    reducer: &ConstraintReducer,
    groupwise: Array2<f64>,
    linked: Array2<f64>,
) -> Result<ClosedFormEstimate, EstimationError> {
    if groups.rows.ncols() != reducer.n_params() {
        return Err(EstimationError::DimensionMismatch(format!(
            "design has {} columns but the constraints cover {} parameters",
            groups.rows.ncols(),
            reducer.n_params()
        )));
    }
    let reconstruction = reducer.reconstruction_matrix();
    let reduced = groups.rows.dot(&reconstruction);
    let gram = reduced.t().dot(&reduced);
    let rhs = reduced.t().dot(&linked);
    let solved = solve_symmetric(&gram, &rhs)?;
    if solved.regularized {
        log::debug!("Closed-form design is rank deficient; using a floored solve.");
    }
    let fitted = reduced.dot(&solved.solution);
    let residual = &fitted - &linked;
    let rmsd = residual
        .mapv(|r| r * r)
        .mean_axis(Axis(0))
        .map(|m| m.mapv(f64::sqrt))
        .unwrap_or_else(|| Array1::zeros(linked.ncols()));
    Ok(ClosedFormEstimate {
        groupwise,
        params: reconstruction.dot(&solved.solution),
        rmsd,
    })
}

/// Location coefficients from groupwise means.
pub fn closedform_location(
    x: ArrayView2<f64>,
    design: ArrayView2<f64>,
    reducer: &ConstraintReducer,
    offset: Option<ArrayView1<f64>>,
    link: Link,
    bounds: &ParamBounds,
) -> Result<ClosedFormEstimate, EstimationError> {
    let groups = Groups::from_design(design);
    let values = normalized_values(x, offset, link);
    let (mean, _) = groups.moments(values.view());
    let floor = bounds.bound(BoundedQuantity::Mean).min;
    let linked = mean.mapv(|m| link.apply(m, floor));
    project(&groups, reducer, mean, linked)
}

/// Scale coefficients from groupwise moments: the method-of-moments dispersion
/// for the negative binomial, the standard deviation for the normal family.
pub fn closedform_scale(
    x: ArrayView2<f64>,
    design: ArrayView2<f64>,
    reducer: &ConstraintReducer,
    offset: Option<ArrayView1<f64>>,
    family: Family,
    bounds: &ParamBounds,
) -> Result<ClosedFormEstimate, EstimationError> {
    let groups = Groups::from_design(design);
    let floor = bounds.bound(BoundedQuantity::Dispersion).min;
    let (statistic, link) = match family {
        Family::NegativeBinomial => {
            let values = normalized_values(x, offset, Link::Log);
            let (mean, variance) = groups.moments(values.view());
            let dispersion = Zip::from(&mean)
                .and(&variance)
                .map_collect(|&m, &v| moment_dispersion(m, v));
            (dispersion, Link::Log)
        }
        Family::Normal { scale_link } => {
            let values = normalized_values(x, offset, Link::Identity);
            let (_, variance) = groups.moments(values.view());
            let link = match scale_link {
                ScaleLink::Log => Link::Log,
                ScaleLink::Identity => Link::Identity,
            };
            (variance.mapv(f64::sqrt), link)
        }
    };
    let linked = statistic.mapv(|s| link.apply(s, floor));
    project(&groups, reducer, statistic, linked)
}

/// `r = mean² / (variance − mean)`, capped to a finite range.
fn moment_dispersion(mean: f64, variance: f64) -> f64 {
    let excess = variance - mean;
    if excess <= 0.0 || mean <= 0.0 {
        return MAX_DISPERSION;
    }
    let r = mean * mean / excess;
    if r.is_finite() {
        r.clamp(MIN_DISPERSION, MAX_DISPERSION)
    } else {
        MAX_DISPERSION
    }
}

/// Groupwise closed-form initializer for both coefficient blocks.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClosedFormInitializer;

impl Initializer for ClosedFormInitializer {
    fn initialize(
        &self,
        data: &FitData,
        family: Family,
        bounds: &ParamBounds,
    ) -> Result<InitialParameters, EstimationError> {
        let layout = ParameterLayout::new(data)?;
        let offset = data.offset.as_ref().map(|o| o.view());
        let link = match family {
            Family::NegativeBinomial => Link::Log,
            Family::Normal { .. } => Link::Identity,
        };
        let location = closedform_location(
            data.x.view(),
            data.design_loc.values(),
            &layout.loc,
            offset,
            link,
            bounds,
        )?;
        let scale = closedform_scale(
            data.x.view(),
            data.design_scale.values(),
            &layout.scale,
            offset,
            family,
            bounds,
        )?;
        log::debug!(
            "Closed-form initialization: max location rmsd {:.3e}, max scale rmsd {:.3e}.",
            location.rmsd.fold(0.0_f64, |acc, &v| acc.max(v)),
            scale.rmsd.fold(0.0_f64, |acc, &v| acc.max(v))
        );
        Ok(InitialParameters {
            a: location.params,
            b: scale.params,
        })
    }
}
