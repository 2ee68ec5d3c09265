//! Forward model: linear predictors, transformed parameters and log-likelihoods
//! for a block of features, evaluated as whole observation×feature matrices.

use crate::bounds::{BoundedQuantity, ParamBounds};
use crate::model::{Family, ScaleLink};
use crate::special::{ln_gamma_ratio, scaled_digamma_difference, scaled_trigamma_difference};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Zip};
use statrs::function::gamma::ln_gamma;

const HALF_LN_TWO_PI: f64 = 0.918_938_533_204_672_8;

/// Read-only inputs of a forward pass over a block of features.
#[derive(Clone, Copy)]
pub struct ForwardModel<'a> {
    family: Family,
    bounds: &'a ParamBounds,
    x: ArrayView2<'a, f64>,
    design_loc: ArrayView2<'a, f64>,
    design_scale: ArrayView2<'a, f64>,
    offset: Option<ArrayView1<'a, f64>>,
}

/// Per-observation model quantities for every feature in the block.
#[derive(Clone, Debug)]
pub struct ModelEvaluation {
    /// Clipped location predictor: `log_mu` for the negative binomial, the mean for the normal.
    pub eta_loc: Array2<f64>,
    pub mean: Array2<f64>,
    /// Clipped scale predictor: `log_r`, `log sd` or `sd` depending on family and link.
    pub eta_scale: Array2<f64>,
    /// Dispersion `r` or standard deviation `sd`.
    pub scale: Array2<f64>,
    pub log_probs: Array2<f64>,
}

impl ModelEvaluation {
    /// Log-likelihood per feature (sum over observations).
    pub fn log_likelihood(&self) -> Array1<f64> {
        self.log_probs.sum_axis(Axis(0))
    }

    /// Log-likelihood per feature averaged over observations.
    pub fn norm_log_likelihood(&self) -> Array1<f64> {
        let n = self.log_probs.nrows().max(1) as f64;
        self.log_likelihood() / n
    }

    /// Negative sum of the normalized log-likelihoods.
    pub fn loss(&self) -> f64 {
        -self.norm_log_likelihood().sum()
    }

    /// Observation variance implied by the family.
    pub fn variance(&self, family: Family) -> Array2<f64> {
        match family {
            Family::NegativeBinomial => {
                Zip::from(&self.mean)
                    .and(&self.scale)
                    .map_collect(|&mu, &r| mu + mu * mu * r)
            }
            Family::Normal { .. } => self.scale.mapv(|sd| sd * sd),
        }
    }

    /// Keeps only the given feature columns, in the given order.
    pub fn select_features(&self, columns: &[usize]) -> ModelEvaluation {
        ModelEvaluation {
            eta_loc: self.eta_loc.select(Axis(1), columns),
            mean: self.mean.select(Axis(1), columns),
            eta_scale: self.eta_scale.select(Axis(1), columns),
            scale: self.scale.select(Axis(1), columns),
            log_probs: self.log_probs.select(Axis(1), columns),
        }
    }

    /// Replaces the columns flagged in `take` with those of `other`.
    pub fn adopt_features(&mut self, other: &ModelEvaluation, take: &[bool]) {
        for (column, _) in take.iter().enumerate().filter(|(_, taken)| **taken) {
            self.eta_loc
                .column_mut(column)
                .assign(&other.eta_loc.column(column));
            self.mean.column_mut(column).assign(&other.mean.column(column));
            self.eta_scale
                .column_mut(column)
                .assign(&other.eta_scale.column(column));
            self.scale
                .column_mut(column)
                .assign(&other.scale.column(column));
            self.log_probs
                .column_mut(column)
                .assign(&other.log_probs.column(column));
        }
    }
}

/// Scalar inputs of one observation of one feature.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Observation {
    pub x: f64,
    pub eta_loc: f64,
    pub mean: f64,
    pub eta_scale: f64,
    pub scale: f64,
}

/// First and second derivatives of one observation's log-probability with
/// respect to the two linear predictors, plus expected-information weights.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub(crate) struct ObservationDerivatives {
    pub d_loc: f64,
    pub d_scale: f64,
    pub h_loc_loc: f64,
    pub h_loc_scale: f64,
    pub h_scale_scale: f64,
    pub fisher_loc: f64,
    pub fisher_scale: f64,
}

impl<'a> ForwardModel<'a> {
    pub fn new(
        family: Family,
        bounds: &'a ParamBounds,
        x: ArrayView2<'a, f64>,
        design_loc: ArrayView2<'a, f64>,
        design_scale: ArrayView2<'a, f64>,
        offset: Option<ArrayView1<'a, f64>>,
    ) -> Self {
        Self {
            family,
            bounds,
            x,
            design_loc,
            design_scale,
            offset,
        }
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn x(&self) -> ArrayView2<'a, f64> {
        self.x
    }

    pub fn design_loc(&self) -> ArrayView2<'a, f64> {
        self.design_loc
    }

    pub fn design_scale(&self) -> ArrayView2<'a, f64> {
        self.design_scale
    }

    pub fn n_observations(&self) -> usize {
        self.x.nrows()
    }

    /// Evaluates every observation of every feature for full parameters `a`, `b`.
    pub fn evaluate(&self, a: ArrayView2<f64>, b: ArrayView2<f64>) -> ModelEvaluation {
        let mut eta_loc = self.design_loc.dot(&a);
        if let Some(offset) = self.offset {
            eta_loc += &offset.insert_axis(Axis(1));
        }
        let eta_scale = self.design_scale.dot(&b);

        let (eta_loc, mean) = self.location(eta_loc);
        let (eta_scale, scale) = self.scale(eta_scale);

        let family = self.family;
        let bounds = self.bounds;
        let log_probs = Zip::from(&self.x)
            .and(&eta_loc)
            .and(&mean)
            .and(&eta_scale)
            .and(&scale)
            .par_map_collect(|&x, &eta_loc, &mean, &eta_scale, &scale| {
                log_prob(
                    family,
                    bounds,
                    Observation {
                        x,
                        eta_loc,
                        mean,
                        eta_scale,
                        scale,
                    },
                )
            });

        ModelEvaluation {
            eta_loc,
            mean,
            eta_scale,
            scale,
            log_probs,
        }
    }

    fn location(&self, mut eta: Array2<f64>) -> (Array2<f64>, Array2<f64>) {
        match self.family {
            Family::NegativeBinomial => {
                self.bounds.clip_inplace(BoundedQuantity::LogMean, &mut eta);
                let mean = eta.mapv(f64::exp);
                (eta, mean)
            }
            Family::Normal { .. } => {
                self.bounds
                    .clip_inplace(BoundedQuantity::LinearPredictor, &mut eta);
                let mean = eta.clone();
                (eta, mean)
            }
        }
    }

    fn scale(&self, mut eta: Array2<f64>) -> (Array2<f64>, Array2<f64>) {
        match self.family {
            Family::NegativeBinomial
            | Family::Normal {
                scale_link: ScaleLink::Log,
            } => {
                self.bounds
                    .clip_inplace(BoundedQuantity::LogDispersion, &mut eta);
                let scale = eta.mapv(f64::exp);
                (eta, scale)
            }
            Family::Normal {
                scale_link: ScaleLink::Identity,
            } => {
                self.bounds.clip_inplace(BoundedQuantity::Dispersion, &mut eta);
                let scale = eta.clone();
                (eta, scale)
            }
        }
    }
}

/// Clipped log-probability (or log-density) of one observation.
pub(crate) fn log_prob(family: Family, bounds: &ParamBounds, obs: Observation) -> f64 {
    match family {
        Family::NegativeBinomial => {
            let Observation {
                x,
                eta_loc: log_mu,
                mean: mu,
                scale: r,
                ..
            } = obs;
            let log_r_plus_mu = (r + mu).ln();
            // r·(log_r − log(r + mu)) written as −r·ln(1 + mu/r)
            let value = ln_gamma_ratio(r, x) - ln_gamma(x + 1.0) + x * (log_mu - log_r_plus_mu)
                - r * (mu / r).ln_1p();
            bounds.clip(BoundedQuantity::LogProbability, value)
        }
        Family::Normal { scale_link } => {
            let sd = obs.scale;
            let log_sd = match scale_link {
                ScaleLink::Log => obs.eta_scale,
                ScaleLink::Identity => sd.ln(),
            };
            let z = (obs.x - obs.mean) / sd;
            let value = -HALF_LN_TWO_PI - log_sd - 0.5 * z * z;
            bounds.clip(BoundedQuantity::LogDensity, value)
        }
    }
}

/// Analytic derivatives of one observation's log-probability.
pub(crate) fn observation_derivatives(family: Family, obs: Observation) -> ObservationDerivatives {
    match family {
        Family::NegativeBinomial => {
            let Observation {
                x,
                mean: mu,
                scale: r,
                ..
            } = obs;
            let denom = r + mu;
            let q = r / denom;
            let p = mu / denom;

            let d_scale = scaled_digamma_difference(r, x) - r * (mu / r).ln_1p() + q * (mu - x);
            let curvature_scale = scaled_trigamma_difference(r, x) + mu * q - q * q * (mu - x);
            let expected_scale = -(scaled_trigamma_difference(r, mu) + mu * q);

            ObservationDerivatives {
                d_loc: q * (x - mu),
                d_scale,
                h_loc_loc: -q * p * (r + x),
                h_loc_scale: q * p * (x - mu),
                h_scale_scale: d_scale + curvature_scale,
                fisher_loc: mu * q,
                fisher_scale: expected_scale.max(f64::MIN_POSITIVE),
            }
        }
        Family::Normal { scale_link } => {
            let sd = obs.scale;
            let precision = 1.0 / (sd * sd);
            let resid = obs.x - obs.mean;
            let z2 = resid * resid * precision;
            match scale_link {
                ScaleLink::Log => ObservationDerivatives {
                    d_loc: resid * precision,
                    d_scale: z2 - 1.0,
                    h_loc_loc: -precision,
                    h_loc_scale: -2.0 * resid * precision,
                    h_scale_scale: -2.0 * z2,
                    fisher_loc: precision,
                    fisher_scale: 2.0,
                },
                ScaleLink::Identity => ObservationDerivatives {
                    d_loc: resid * precision,
                    d_scale: (z2 - 1.0) / sd,
                    h_loc_loc: -precision,
                    h_loc_scale: -2.0 * resid * precision / sd,
                    h_scale_scale: (1.0 - 3.0 * z2) * precision,
                    fisher_loc: precision,
                    fisher_scale: 2.0 * precision,
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::{assert_abs_diff_eq, assert_relative_eq};
    use ndarray::array;

    fn nb_reference(x: f64, mu: f64, r: f64) -> f64 {
        ln_gamma(r + x) - ln_gamma(x + 1.0) - ln_gamma(r)
            + x * (mu.ln() - (r + mu).ln())
            + r * (r.ln() - (r + mu).ln())
    }

    fn evaluate_single(family: Family, x: f64, eta_loc: f64, eta_scale: f64) -> ModelEvaluation {
        let bounds = ParamBounds::default();
        let xs = array![[x]];
        let ones = array![[1.0]];
        let model = ForwardModel::new(family, &bounds, xs.view(), ones.view(), ones.view(), None);
        model.evaluate(array![[eta_loc]].view(), array![[eta_scale]].view())
    }

    #[test]
    fn negative_binomial_matches_reference_density() {
        let cases: [(f64, f64, f64); 4] = [(0.0, 3.0, 2.0), (7.0, 5.5, 0.7), (120.0, 80.0, 12.0), (2.5, 1.2, 4.0)];
        for &(x, mu, r) in &cases {
            let eval = evaluate_single(Family::NegativeBinomial, x, mu.ln(), r.ln());
            assert_relative_eq!(eval.mean[[0, 0]], mu, max_relative = 1e-12);
            assert_relative_eq!(eval.scale[[0, 0]], r, max_relative = 1e-12);
            assert_relative_eq!(
                eval.log_probs[[0, 0]],
                nb_reference(x, mu, r),
                max_relative = 1e-9
            );
        }
    }

    #[test]
    fn negative_binomial_probabilities_sum_to_one() {
        let bounds = ParamBounds::default();
        let counts = Array2::from_shape_fn((400, 1), |(i, _)| i as f64);
        let design = Array2::ones((400, 1));
        let model = ForwardModel::new(
            Family::NegativeBinomial,
            &bounds,
            counts.view(),
            design.view(),
            design.view(),
            None,
        );
        let eval = model.evaluate(array![[4.0f64.ln()]].view(), array![[1.5f64.ln()]].view());
        let total: f64 = eval.log_probs.iter().map(|lp| lp.exp()).sum();
        assert_abs_diff_eq!(total, 1.0, epsilon = 1e-10);
    }

    #[test]
    fn extreme_parameters_are_absorbed_by_clipping() {
        let eval = evaluate_single(Family::NegativeBinomial, 5.0, 1e6, 1e6);
        assert!(eval.mean[[0, 0]].is_finite());
        assert!(eval.scale[[0, 0]].is_finite());
        assert!(eval.log_probs[[0, 0]].is_finite());
        assert!(eval.log_probs[[0, 0]] <= 0.0);

        let eval = evaluate_single(Family::NegativeBinomial, 5.0, -1e6, -1e6);
        assert!(eval.mean[[0, 0]] > 0.0);
        assert!(eval.log_probs[[0, 0]].is_finite());
    }

    #[test]
    fn huge_dispersion_approaches_poisson() {
        let mu: f64 = 10.0;
        let x: f64 = 12.0;
        let eval = evaluate_single(Family::NegativeBinomial, x, mu.ln(), 200.0);
        let poisson = x * mu.ln() - mu - ln_gamma(x + 1.0);
        assert_abs_diff_eq!(eval.log_probs[[0, 0]], poisson, epsilon = 1e-9);
    }

    #[test]
    fn normal_density_for_both_scale_links() {
        let expected = -HALF_LN_TWO_PI - 2.0f64.ln() - 0.5 * (1.5f64 / 2.0).powi(2);
        let log_link = evaluate_single(Family::normal(), 4.5, 3.0, 2.0f64.ln());
        assert_relative_eq!(log_link.log_probs[[0, 0]], expected, max_relative = 1e-12);

        let identity = evaluate_single(
            Family::Normal {
                scale_link: ScaleLink::Identity,
            },
            4.5,
            3.0,
            2.0,
        );
        assert_relative_eq!(identity.log_probs[[0, 0]], expected, max_relative = 1e-12);
        assert_relative_eq!(
            identity.variance(Family::normal())[[0, 0]],
            4.0,
            max_relative = 1e-12
        );
    }

    #[test]
    fn offset_shifts_log_mean_and_aggregates_follow() {
        let bounds = ParamBounds::default();
        let x = array![[1.0, 4.0], [2.0, 0.0], [3.0, 9.0]];
        let design = Array2::ones((3, 1));
        let offset = array![0.0, 2.0f64.ln(), 0.5f64.ln()];
        let model = ForwardModel::new(
            Family::NegativeBinomial,
            &bounds,
            x.view(),
            design.view(),
            design.view(),
            Some(offset.view()),
        );
        let eval = model.evaluate(array![[0.0, 1.0]].view(), array![[0.0, 0.0]].view());
        assert_relative_eq!(eval.mean[[1, 0]], 2.0, max_relative = 1e-12);
        assert_relative_eq!(eval.mean[[2, 1]], 0.5 * 1f64.exp(), max_relative = 1e-12);

        let ll = eval.log_likelihood();
        let norm = eval.norm_log_likelihood();
        assert_relative_eq!(norm[0] * 3.0, ll[0], max_relative = 1e-12);
        assert_relative_eq!(eval.loss(), -(norm[0] + norm[1]), max_relative = 1e-12);

        let variance = eval.variance(Family::NegativeBinomial);
        assert_relative_eq!(variance[[1, 0]], 2.0 + 4.0, max_relative = 1e-12);
    }

    #[test]
    fn fisher_weights_are_positive() {
        for &(x, mu, r) in &[(0.0, 0.01, 1e-3), (3.0, 5.0, 1.0), (900.0, 800.0, 1e6)] {
            let d = observation_derivatives(
                Family::NegativeBinomial,
                Observation {
                    x,
                    eta_loc: f64::ln(mu),
                    mean: mu,
                    eta_scale: f64::ln(r),
                    scale: r,
                },
            );
            assert!(d.fisher_loc > 0.0);
            assert!(d.fisher_scale > 0.0);
            assert!(d.h_loc_loc < 0.0);
        }
    }

    #[test]
    fn feature_columns_can_be_selected_and_adopted() {
        let bounds = ParamBounds::default();
        let counts = array![[1.0, 4.0, 9.0], [2.0, 5.0, 7.0]];
        let design = Array2::ones((2, 1));
        let model = ForwardModel::new(
            Family::NegativeBinomial,
            &bounds,
            counts.view(),
            design.view(),
            design.view(),
            None,
        );
        let base = model.evaluate(array![[0.0, 1.0, 2.0]].view(), array![[0.0, 0.0, 0.0]].view());
        let moved = model.evaluate(array![[0.5, 1.5, 2.5]].view(), array![[0.0, 0.0, 0.0]].view());

        let subset = base.select_features(&[2, 0]);
        assert_eq!(subset.mean.column(0), base.mean.column(2));
        assert_eq!(subset.log_probs.column(1), base.log_probs.column(0));

        let mut merged = base.clone();
        merged.adopt_features(&moved, &[false, true, false]);
        assert_eq!(merged.mean.column(1), moved.mean.column(1));
        assert_eq!(merged.mean.column(0), base.mean.column(0));
        assert_eq!(merged.log_probs.column(2), base.log_probs.column(2));
    }
}
