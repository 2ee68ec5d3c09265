//! First and second derivatives of the normalized log-likelihood with respect
//! to the independent parameters, per feature.
//!
//! Derivatives are reported for the positive log-likelihood. Optimizers that
//! minimize the negative log-likelihood flip the signs themselves.

use crate::faer_ndarray::solve_symmetric;
use crate::likelihood::{
    ForwardModel, ModelEvaluation, Observation, ObservationDerivatives, observation_derivatives,
};
use ndarray::parallel::prelude::*;
use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2, Axis, Zip, s};

/// Which second-order information accompanies the Jacobian.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CurvatureKind {
    None,
    /// Observed Hessian.
    Hessian,
    /// Expected information, reported negated so it shares the Hessian's sign.
    Fisher,
}

/// Derivatives at the current point for a block of features.
#[derive(Clone, Debug)]
pub struct Derivatives {
    /// `k × features`, location block first.
    pub jacobian: Array2<f64>,
    /// `features × k × k` curvature of the normalized log-likelihood.
    pub curvature: Option<Array3<f64>>,
}

/// Source of derivative information for the optimizers.
pub trait DifferentialEngine: Sync {
    /// Gradient of the normalized log-likelihood, `k × features`.
    fn jacobian(&self, model: &ForwardModel<'_>, eval: &ModelEvaluation) -> Array2<f64>;

    /// Hessian of the normalized log-likelihood, `features × k × k`.
    fn hessian(&self, model: &ForwardModel<'_>, eval: &ModelEvaluation) -> Array3<f64>;

    /// Fisher information of the normalized log-likelihood (positive semi-definite).
    fn fisher_information(&self, model: &ForwardModel<'_>, eval: &ModelEvaluation)
    -> Array3<f64>;

    fn derivatives(
        &self,
        model: &ForwardModel<'_>,
        eval: &ModelEvaluation,
        kind: CurvatureKind,
    ) -> Derivatives {
        let curvature = match kind {
            CurvatureKind::None => None,
            CurvatureKind::Hessian => Some(self.hessian(model, eval)),
            CurvatureKind::Fisher => Some(-self.fisher_information(model, eval)),
        };
        Derivatives {
            jacobian: self.jacobian(model, eval),
            curvature,
        }
    }
}

/// Closed-form derivatives through the constraint-reduced design matrices.
///
/// With `full = M · independent`, the location predictor is `D · M · a_var`,
/// so derivatives with respect to the independent coefficients only need the
/// reduced designs `D · M`.
#[derive(Clone, Debug)]
pub struct AnalyticEngine {
    reduced_loc: Array2<f64>,
    reduced_scale: Array2<f64>,
}

/// Per-observation derivative weights, `observations × features` each.
struct Weights {
    d_loc: Array2<f64>,
    d_scale: Array2<f64>,
    loc_loc: Array2<f64>,
    loc_scale: Option<Array2<f64>>,
    scale_scale: Array2<f64>,
}

impl AnalyticEngine {
    pub fn new(
        design_loc: ArrayView2<f64>,
        reconstruction_loc: ArrayView2<f64>,
        design_scale: ArrayView2<f64>,
        reconstruction_scale: ArrayView2<f64>,
    ) -> Self {
        Self {
            reduced_loc: design_loc.dot(&reconstruction_loc),
            reduced_scale: design_scale.dot(&reconstruction_scale),
        }
    }

    pub fn n_independent_loc(&self) -> usize {
        self.reduced_loc.ncols()
    }

    pub fn n_independent(&self) -> usize {
        self.reduced_loc.ncols() + self.reduced_scale.ncols()
    }

    fn observation_terms(
        &self,
        model: &ForwardModel<'_>,
        eval: &ModelEvaluation,
    ) -> Array2<ObservationDerivatives> {
        let family = model.family();
        Zip::from(&model.x())
            .and(&eval.eta_loc)
            .and(&eval.mean)
            .and(&eval.eta_scale)
            .and(&eval.scale)
            .par_map_collect(|&x, &eta_loc, &mean, &eta_scale, &scale| {
                observation_derivatives(
                    family,
                    Observation {
                        x,
                        eta_loc,
                        mean,
                        eta_scale,
                        scale,
                    },
                )
            })
    }

    fn weights(&self, terms: &Array2<ObservationDerivatives>, kind: CurvatureKind) -> Weights {
        let pick = |f: fn(&ObservationDerivatives) -> f64| terms.map(f);
        let (loc_loc, loc_scale, scale_scale) = match kind {
            CurvatureKind::Fisher => (
                pick(|d| -d.fisher_loc),
                None,
                pick(|d| -d.fisher_scale),
            ),
            CurvatureKind::Hessian | CurvatureKind::None => (
                pick(|d| d.h_loc_loc),
                Some(pick(|d| d.h_loc_scale)),
                pick(|d| d.h_scale_scale),
            ),
        };
        Weights {
            d_loc: pick(|d| d.d_loc),
            d_scale: pick(|d| d.d_scale),
            loc_loc,
            loc_scale,
            scale_scale,
        }
    }

    fn jacobian_from(&self, weights: &Weights, n_obs: usize) -> Array2<f64> {
        let scale = 1.0 / n_obs.max(1) as f64;
        let k_loc = self.n_independent_loc();
        let mut jacobian = Array2::<f64>::zeros((self.n_independent(), weights.d_loc.ncols()));
        jacobian
            .slice_mut(s![..k_loc, ..])
            .assign(&(self.reduced_loc.t().dot(&weights.d_loc) * scale));
        jacobian
            .slice_mut(s![k_loc.., ..])
            .assign(&(self.reduced_scale.t().dot(&weights.d_scale) * scale));
        jacobian
    }

    fn curvature_from(&self, weights: &Weights, n_obs: usize) -> Array3<f64> {
        let k_loc = self.n_independent_loc();
        let k = self.n_independent();
        let n_features = weights.loc_loc.ncols();
        let scale = 1.0 / n_obs.max(1) as f64;
        let mut curvature = Array3::<f64>::zeros((n_features, k, k));

        curvature
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(feature, mut block)| {
                let ll = weighted_gram(
                    self.reduced_loc.view(),
                    weights.loc_loc.column(feature),
                    self.reduced_loc.view(),
                );
                let ss = weighted_gram(
                    self.reduced_scale.view(),
                    weights.scale_scale.column(feature),
                    self.reduced_scale.view(),
                );
                block.slice_mut(s![..k_loc, ..k_loc]).assign(&ll);
                block.slice_mut(s![k_loc.., k_loc..]).assign(&ss);
                if let Some(cross) = &weights.loc_scale {
                    let ls = weighted_gram(
                        self.reduced_loc.view(),
                        cross.column(feature),
                        self.reduced_scale.view(),
                    );
                    block.slice_mut(s![..k_loc, k_loc..]).assign(&ls);
                    block.slice_mut(s![k_loc.., ..k_loc]).assign(&ls.t());
                }
                block *= scale;
            });
        curvature
    }
}

/// `leftᵀ · diag(w) · right`.
fn weighted_gram(left: ArrayView2<f64>, w: ArrayView1<f64>, right: ArrayView2<f64>) -> Array2<f64> {
    let weighted = &right * &w.insert_axis(Axis(1));
    left.t().dot(&weighted)
}

impl DifferentialEngine for AnalyticEngine {
    fn jacobian(&self, model: &ForwardModel<'_>, eval: &ModelEvaluation) -> Array2<f64> {
        let terms = self.observation_terms(model, eval);
        self.jacobian_from(&self.weights(&terms, CurvatureKind::None), model.n_observations())
    }

    fn hessian(&self, model: &ForwardModel<'_>, eval: &ModelEvaluation) -> Array3<f64> {
        let terms = self.observation_terms(model, eval);
        self.curvature_from(
            &self.weights(&terms, CurvatureKind::Hessian),
            model.n_observations(),
        )
    }

    fn fisher_information(
        &self,
        model: &ForwardModel<'_>,
        eval: &ModelEvaluation,
    ) -> Array3<f64> {
        let terms = self.observation_terms(model, eval);
        -self.curvature_from(
            &self.weights(&terms, CurvatureKind::Fisher),
            model.n_observations(),
        )
    }

    fn derivatives(
        &self,
        model: &ForwardModel<'_>,
        eval: &ModelEvaluation,
        kind: CurvatureKind,
    ) -> Derivatives {
        let terms = self.observation_terms(model, eval);
        let weights = self.weights(&terms, kind);
        let n_obs = model.n_observations();
        let curvature = match kind {
            CurvatureKind::None => None,
            CurvatureKind::Hessian | CurvatureKind::Fisher => {
                Some(self.curvature_from(&weights, n_obs))
            }
        };
        Derivatives {
            jacobian: self.jacobian_from(&weights, n_obs),
            curvature,
        }
    }
}

/// Newton-type directions for minimizing the negative normalized log-likelihood.
#[derive(Clone, Debug)]
pub struct NewtonDirections {
    /// `k × features`; a step moves the parameters to `θ − s · Δ`.
    pub delta: Array2<f64>,
    /// `gᵀΔ` per feature, with `g` the gradient of the negative log-likelihood.
    /// Non-negative because the solve keeps the curvature positive definite.
    pub model_decrease: Array1<f64>,
    /// Features whose curvature needed eigenvalue flooring.
    pub regularized: usize,
}

impl NewtonDirections {
    /// Gain of the quadratic model for the step `θ − s · Δ`.
    pub fn predicted_gain(&self, feature: usize, step_scale: f64) -> f64 {
        self.model_decrease[feature] * (step_scale - 0.5 * step_scale * step_scale)
    }
}

/// Solves `(−H) Δ = −J` feature by feature.
///
/// Features whose curvature or gradient is not finite get a zero direction and
/// therefore a zero predicted gain.
pub fn newton_directions(derivatives: &Derivatives) -> Option<NewtonDirections> {
    let curvature = derivatives.curvature.as_ref()?;
    let (k, n_features) = derivatives.jacobian.dim();

    let solved: Vec<(Array1<f64>, f64, bool)> = (0..n_features)
        .into_par_iter()
        .map(|feature| {
            let gradient = derivatives.jacobian.column(feature).mapv(|v| -v);
            let hessian = curvature.index_axis(Axis(0), feature).mapv(|v| -v);
            let rhs = gradient.clone().insert_axis(Axis(1));
            match solve_symmetric(&hessian, &rhs) {
                Ok(solve) => {
                    let delta = solve.solution.column(0).to_owned();
                    let decrease = gradient.dot(&delta);
                    (delta, decrease.max(0.0), solve.regularized)
                }
                Err(err) => {
                    log::debug!("Feature {feature}: no Newton direction ({err}); holding still.");
                    (Array1::zeros(k), 0.0, false)
                }
            }
        })
        .collect();

    let mut delta = Array2::<f64>::zeros((k, n_features));
    let mut model_decrease = Array1::<f64>::zeros(n_features);
    let mut regularized = 0;
    for (feature, (direction, decrease, floored)) in solved.into_iter().enumerate() {
        delta.column_mut(feature).assign(&direction);
        model_decrease[feature] = decrease;
        regularized += usize::from(floored);
    }
    if regularized > 0 {
        log::debug!("{regularized} features needed curvature flooring for their Newton direction.");
    }
    Some(NewtonDirections {
        delta,
        model_decrease,
        regularized,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounds::ParamBounds;
    use crate::faer_ndarray::FaerEigh;
    use crate::model::{Family, ScaleLink};
    use approx::assert_abs_diff_eq;
    use faer::Side;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    struct Problem {
        x: Array2<f64>,
        design_loc: Array2<f64>,
        design_scale: Array2<f64>,
        offset: Array1<f64>,
        m_loc: Array2<f64>,
        m_scale: Array2<f64>,
    }

    fn problem(family: Family, seed: u64) -> Problem {
        let mut rng = StdRng::seed_from_u64(seed);
        let n = 40;
        let design_loc = Array2::from_shape_fn((n, 3), |(i, j)| match j {
            0 => 1.0,
            1 => (i % 2) as f64,
            _ => (i % 3 == 0) as u8 as f64,
        });
        let design_scale =
            Array2::from_shape_fn((n, 2), |(i, j)| if j == 0 { 1.0 } else { (i % 2) as f64 });
        let x = Array2::from_shape_fn((n, 2), |_| match family {
            Family::NegativeBinomial => rng.gen_range(0..30) as f64,
            Family::Normal { .. } => rng.gen_range(-2.0..5.0),
        });
        let offset = Array1::from_shape_fn(n, |_| rng.gen_range(-0.2..0.2));
        // third location coefficient is tied to the negative of the second
        let m_loc = array![[1.0, 0.0], [0.0, 1.0], [0.0, -1.0]];
        Problem {
            x,
            design_loc,
            design_scale,
            offset,
            m_loc,
            m_scale: Array2::eye(2),
        }
    }

    fn norm_ll(p: &Problem, family: Family, theta: &Array2<f64>) -> Array1<f64> {
        let bounds = ParamBounds::default();
        let model = ForwardModel::new(
            family,
            &bounds,
            p.x.view(),
            p.design_loc.view(),
            p.design_scale.view(),
            Some(p.offset.view()),
        );
        let a = p.m_loc.dot(&theta.slice(s![..2, ..]));
        let b = p.m_scale.dot(&theta.slice(s![2.., ..]));
        model.evaluate(a.view(), b.view()).norm_log_likelihood()
    }

    fn derivatives_at(
        p: &Problem,
        family: Family,
        theta: &Array2<f64>,
        kind: CurvatureKind,
    ) -> Derivatives {
        let bounds = ParamBounds::default();
        let model = ForwardModel::new(
            family,
            &bounds,
            p.x.view(),
            p.design_loc.view(),
            p.design_scale.view(),
            Some(p.offset.view()),
        );
        let a = p.m_loc.dot(&theta.slice(s![..2, ..]));
        let b = p.m_scale.dot(&theta.slice(s![2.., ..]));
        let eval = model.evaluate(a.view(), b.view());
        let engine = AnalyticEngine::new(
            p.design_loc.view(),
            p.m_loc.view(),
            p.design_scale.view(),
            p.m_scale.view(),
        );
        engine.derivatives(&model, &eval, kind)
    }

    fn starting_point(family: Family) -> Array2<f64> {
        match family {
            Family::NegativeBinomial => array![[2.3, 1.9], [0.3, -0.2], [0.4, 1.1], [-0.3, 0.2]],
            Family::Normal { .. } => array![[1.0, 1.4], [0.2, -0.4], [0.3, 0.5], [-0.1, 0.2]],
        }
    }

    fn check_against_finite_differences(family: Family) {
        let p = problem(family, 5);
        let theta = starting_point(family);
        let analytic = derivatives_at(&p, family, &theta, CurvatureKind::Hessian);
        let hessian = analytic.curvature.as_ref().unwrap();
        let h = 1e-6;
        for param in 0..theta.nrows() {
            let mut plus = theta.clone();
            let mut minus = theta.clone();
            plus.row_mut(param).mapv_inplace(|v| v + h);
            minus.row_mut(param).mapv_inplace(|v| v - h);

            let numeric = (norm_ll(&p, family, &plus) - norm_ll(&p, family, &minus)) / (2.0 * h);
            let jp = derivatives_at(&p, family, &plus, CurvatureKind::None).jacobian;
            let jm = derivatives_at(&p, family, &minus, CurvatureKind::None).jacobian;
            for feature in 0..theta.ncols() {
                assert_abs_diff_eq!(
                    analytic.jacobian[[param, feature]],
                    numeric[feature],
                    epsilon = 1e-5
                );
                for other in 0..theta.nrows() {
                    let second = (jp[[other, feature]] - jm[[other, feature]]) / (2.0 * h);
                    assert_abs_diff_eq!(hessian[[feature, other, param]], second, epsilon = 1e-4);
                }
            }
        }
    }

    #[test]
    fn negative_binomial_derivatives_match_finite_differences() {
        check_against_finite_differences(Family::NegativeBinomial);
    }

    #[test]
    fn normal_derivatives_match_finite_differences() {
        check_against_finite_differences(Family::normal());
        check_against_finite_differences(Family::Normal {
            scale_link: ScaleLink::Identity,
        });
    }

    #[test]
    fn jacobian_stacks_location_rows_above_scale_rows() {
        let family = Family::NegativeBinomial;
        let mut p = problem(family, 21);
        p.design_scale = Array2::ones((p.x.nrows(), 1));
        p.m_scale = Array2::eye(1);
        let theta = array![[2.1, 1.7], [0.2, -0.1], [0.5, 1.3]];

        let jacobian = derivatives_at(&p, family, &theta, CurvatureKind::None).jacobian;
        assert_eq!(jacobian.dim(), (3, 2));
        assert!(jacobian.iter().all(|v| v.is_finite()));

        let h = 1e-6;
        for param in 0..theta.nrows() {
            let mut plus = theta.clone();
            let mut minus = theta.clone();
            plus.row_mut(param).mapv_inplace(|v| v + h);
            minus.row_mut(param).mapv_inplace(|v| v - h);
            let numeric = (norm_ll(&p, family, &plus) - norm_ll(&p, family, &minus)) / (2.0 * h);
            for feature in 0..theta.ncols() {
                assert_abs_diff_eq!(jacobian[[param, feature]], numeric[feature], epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn fisher_information_is_symmetric_positive_definite_and_block_diagonal() {
        let family = Family::NegativeBinomial;
        let p = problem(family, 9);
        let theta = starting_point(family);
        let fisher = -derivatives_at(&p, family, &theta, CurvatureKind::Fisher)
            .curvature
            .unwrap();
        for block in fisher.axis_iter(Axis(0)) {
            for i in 0..4 {
                for j in 0..4 {
                    assert_abs_diff_eq!(block[[i, j]], block[[j, i]], epsilon = 1e-12);
                }
            }
            assert_eq!(block[[0, 2]], 0.0);
            assert_eq!(block[[1, 3]], 0.0);
            let (values, _) = block.to_owned().eigh(Side::Lower).unwrap();
            assert!(values.iter().all(|&v| v > 0.0), "{values}");
        }
    }

    #[test]
    fn newton_direction_solves_quadratic_model() {
        let family = Family::NegativeBinomial;
        let p = problem(family, 13);
        let theta = starting_point(family);
        let derivs = derivatives_at(&p, family, &theta, CurvatureKind::Fisher);
        let directions = newton_directions(&derivs).unwrap();
        let curvature = derivs.curvature.as_ref().unwrap();
        for feature in 0..theta.ncols() {
            let fisher = curvature.index_axis(Axis(0), feature).mapv(|v| -v);
            let lhs = fisher.dot(&directions.delta.column(feature));
            for (l, j) in lhs.iter().zip(derivs.jacobian.column(feature)) {
                assert_abs_diff_eq!(*l, -j, epsilon = 1e-9);
            }
            assert!(directions.model_decrease[feature] > 0.0);
            let full = directions.predicted_gain(feature, 1.0);
            assert_abs_diff_eq!(full, 0.5 * directions.model_decrease[feature], epsilon = 1e-15);
            assert!(directions.predicted_gain(feature, 0.25) < full);
        }
        let first_order = derivatives_at(&p, family, &theta, CurvatureKind::None);
        assert!(newton_directions(&first_order).is_none());
    }
}
