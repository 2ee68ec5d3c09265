//! Parameter update rules.
//!
//! Every rule works on the gathered columns of the active features and
//! minimizes the negative normalized log-likelihood. The trust-region rules
//! evaluate all candidate columns in one forward pass and then accept or
//! reject each feature on its own.

use crate::derivatives::{CurvatureKind, Derivatives, newton_directions};
use crate::estimate::EstimationError;
use crate::model::TrustRegionConfig;
use crate::variables::ActiveSet;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Zip};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const ADAM_BETA1: f64 = 0.9;
const ADAM_BETA2: f64 = 0.999;
const RMSPROP_DECAY: f64 = 0.9;
const ADAGRAD_INITIAL_ACCUMULATOR: f64 = 0.1;
const MOMENT_EPSILON: f64 = 1e-8;

/// Standard first-order update rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FirstOrderRule {
    GradientDescent,
    Adam,
    Adagrad,
    RmsProp,
}

/// Closed set of optimization strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Strategy {
    GradientFamily(FirstOrderRule),
    NewtonRaphson,
    NewtonRaphsonTrustRegion,
    /// Newton steps with the Fisher information in place of the Hessian.
    ///
    /// The dispersion information vanishes as `r` grows, so on data without
    /// overdispersion the scale coefficients creep toward their upper bound for
    /// many steps and may not converge within `max_steps`. The location
    /// coefficients are unaffected.
    Irls,
    IrlsTrustRegion,
}

impl Strategy {
    /// Canonical configuration name.
    pub fn name(&self) -> &'static str {
        match self {
            Strategy::GradientFamily(FirstOrderRule::GradientDescent) => "gd",
            Strategy::GradientFamily(FirstOrderRule::Adam) => "adam",
            Strategy::GradientFamily(FirstOrderRule::Adagrad) => "adagrad",
            Strategy::GradientFamily(FirstOrderRule::RmsProp) => "rmsprop",
            Strategy::NewtonRaphson => "nr",
            Strategy::NewtonRaphsonTrustRegion => "nr_tr",
            Strategy::Irls => "irls",
            Strategy::IrlsTrustRegion => "irls_tr",
        }
    }

    /// Second-order information the strategy consumes.
    pub fn curvature(&self) -> CurvatureKind {
        match self {
            Strategy::GradientFamily(_) => CurvatureKind::None,
            Strategy::NewtonRaphson | Strategy::NewtonRaphsonTrustRegion => CurvatureKind::Hessian,
            Strategy::Irls | Strategy::IrlsTrustRegion => CurvatureKind::Fisher,
        }
    }

    pub fn uses_trust_region(&self) -> bool {
        matches!(
            self,
            Strategy::NewtonRaphsonTrustRegion | Strategy::IrlsTrustRegion
        )
    }

    pub fn default_learning_rate(&self) -> f64 {
        match self {
            Strategy::GradientFamily(FirstOrderRule::GradientDescent) => 0.1,
            Strategy::GradientFamily(_) => 0.05,
            _ => 1.0,
        }
    }
}

impl FromStr for Strategy {
    type Err = EstimationError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        let strategy = match name.trim().to_ascii_lowercase().as_str() {
            "gd" | "gradient_descent" | "gradient-descent" | "sgd" => {
                Strategy::GradientFamily(FirstOrderRule::GradientDescent)
            }
            "adam" => Strategy::GradientFamily(FirstOrderRule::Adam),
            "adagrad" => Strategy::GradientFamily(FirstOrderRule::Adagrad),
            "rmsprop" => Strategy::GradientFamily(FirstOrderRule::RmsProp),
            "nr" | "newton" | "newton-raphson" | "newton_raphson" => Strategy::NewtonRaphson,
            "nr_tr" | "newton_tr" | "newton-trust-region" | "newton_trust_region"
            | "newton-raphson-trust-region" | "newton_raphson_trust_region" => {
                Strategy::NewtonRaphsonTrustRegion
            }
            "irls" | "iwls" => Strategy::Irls,
            "irls_tr" | "iwls_tr" | "irls_trust_region" | "iwls_trust_region"
            | "irls-trust-region" | "iwls-trust-region" => Strategy::IrlsTrustRegion,
            _ => return Err(EstimationError::UnsupportedOptimizer(name.to_string())),
        };
        Ok(strategy)
    }
}

impl TryFrom<String> for Strategy {
    type Error = EstimationError;

    fn try_from(name: String) -> Result<Self, Self::Error> {
        name.parse()
    }
}

impl From<Strategy> for String {
    fn from(strategy: Strategy) -> Self {
        strategy.name().to_string()
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Number of committed update calls in a fit.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StepCounter(usize);

impl StepCounter {
    pub fn get(&self) -> usize {
        self.0
    }

    pub(crate) fn increment(&mut self) {
        self.0 += 1;
    }
}

/// Per-feature trust-region radii.
#[derive(Debug, Clone)]
pub struct TrustRegionState {
    radius: Array1<f64>,
    config: TrustRegionConfig,
}

impl TrustRegionState {
    pub fn new(n_features: usize, config: TrustRegionConfig) -> Self {
        Self {
            radius: Array1::from_elem(n_features, config.initial_radius),
            config,
        }
    }

    pub fn radius(&self) -> ArrayView1<'_, f64> {
        self.radius.view()
    }

    /// Acceptance test for one feature.
    pub fn accepts(&self, actual_gain: f64, ratio: f64) -> bool {
        actual_gain > self.config.eta0 && ratio > self.config.eta1
    }

    /// Shrinks or grows one feature's radius from its gain ratio.
    pub fn adapt(&mut self, feature: usize, ratio: f64) {
        let radius = &mut self.radius[feature];
        if ratio < self.config.eta1 {
            *radius *= self.config.t1;
        } else if ratio > self.config.eta2 {
            *radius = (*radius * self.config.t2).min(self.config.upper_bound);
        }
    }
}

/// Observed over predicted gain; anything that is not a finite ratio of a
/// positive prediction counts as the worst possible agreement.
pub fn gain_ratio(actual_gain: f64, predicted_gain: f64) -> f64 {
    let ratio = actual_gain / predicted_gain;
    if predicted_gain > 0.0 && ratio.is_finite() {
        ratio
    } else {
        f64::NEG_INFINITY
    }
}

/// Moment buffers of the first-order rules, one column per feature.
#[derive(Debug, Clone)]
struct MomentBuffers {
    first: Array2<f64>,
    second: Array2<f64>,
    counts: Vec<u32>,
}

impl MomentBuffers {
    fn new(rule: FirstOrderRule, n_params: usize, n_features: usize) -> Self {
        let second_init = match rule {
            FirstOrderRule::Adagrad => ADAGRAD_INITIAL_ACCUMULATOR,
            _ => 0.0,
        };
        Self {
            first: Array2::zeros((n_params, n_features)),
            second: Array2::from_elem((n_params, n_features), second_init),
            counts: vec![0; n_features],
        }
    }

    /// Applies one step of `rule` to the active columns; `gradient` is the
    /// gradient of the objective being minimized.
    fn apply(
        &mut self,
        rule: FirstOrderRule,
        learning_rate: f64,
        active: &ActiveSet,
        params: &mut Array2<f64>,
        gradient: ArrayView2<f64>,
    ) {
        let mut first = active.gather(self.first.view());
        let mut second = active.gather(self.second.view());
        let mut corrections = Array2::<f64>::zeros((2, active.len()));
        for (column, &feature) in active.indices().iter().enumerate() {
            self.counts[feature] += 1;
            let t = self.counts[feature] as i32;
            corrections[[0, column]] = 1.0 - ADAM_BETA1.powi(t);
            corrections[[1, column]] = 1.0 - ADAM_BETA2.powi(t);
        }
        let (c1, c2) = corrections.view().split_at(Axis(0), 1);

        Zip::from(params)
            .and(&mut first)
            .and(&mut second)
            .and(&gradient)
            .and_broadcast(&c1)
            .and_broadcast(&c2)
            .for_each(|theta, m, v, &g, &c1, &c2| match rule {
                FirstOrderRule::GradientDescent => *theta -= learning_rate * g,
                FirstOrderRule::Adam => {
                    *m = ADAM_BETA1 * *m + (1.0 - ADAM_BETA1) * g;
                    *v = ADAM_BETA2 * *v + (1.0 - ADAM_BETA2) * g * g;
                    let m_hat = *m / c1;
                    let v_hat = *v / c2;
                    *theta -= learning_rate * m_hat / (v_hat.sqrt() + MOMENT_EPSILON);
                }
                FirstOrderRule::Adagrad => {
                    *v += g * g;
                    *theta -= learning_rate * g / (v.sqrt() + MOMENT_EPSILON);
                }
                FirstOrderRule::RmsProp => {
                    *v = RMSPROP_DECAY * *v + (1.0 - RMSPROP_DECAY) * g * g;
                    *theta -= learning_rate * g / (v.sqrt() + MOMENT_EPSILON);
                }
            });

        active.scatter(first.view(), &mut self.first);
        active.scatter(second.view(), &mut self.second);
    }
}

/// Result of one update call for the active features.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    /// Whether each active feature's parameters were changed.
    pub updated: Vec<bool>,
    /// Normalized log-likelihood after the step, when the rule already evaluated it.
    pub norm_ll_after: Option<Array1<f64>>,
}

/// Candidate evaluation used by the trust-region rules: normalized
/// log-likelihood of each active column of a trainable block.
pub type CandidateEvaluator<'a> =
    dyn FnMut(ArrayView2<f64>) -> Result<Array1<f64>, EstimationError> + 'a;

/// A strategy together with its per-feature state.
#[derive(Debug, Clone)]
pub struct Optimizer {
    strategy: Strategy,
    learning_rate: f64,
    trust_region: Option<TrustRegionState>,
    moments: Option<MomentBuffers>,
}

impl Optimizer {
    pub fn new(
        strategy: Strategy,
        learning_rate: f64,
        trust_region: &TrustRegionConfig,
        n_params: usize,
        n_features: usize,
    ) -> Self {
        let trust_region = strategy
            .uses_trust_region()
            .then(|| TrustRegionState::new(n_features, trust_region.clone()));
        let moments = match strategy {
            Strategy::GradientFamily(rule) => Some(MomentBuffers::new(rule, n_params, n_features)),
            _ => None,
        };
        Self {
            strategy,
            learning_rate,
            trust_region,
            moments,
        }
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn trust_region(&self) -> Option<&TrustRegionState> {
        self.trust_region.as_ref()
    }

    /// Applies one update to the gathered active block `params`.
    ///
    /// `norm_ll` holds the normalized log-likelihood of each active feature at
    /// `params`; `evaluate` recomputes it for a candidate block. Increments
    /// `steps` exactly once.
    pub fn update(
        &mut self,
        active: &ActiveSet,
        params: &mut Array2<f64>,
        derivatives: &Derivatives,
        norm_ll: ArrayView1<f64>,
        evaluate: &mut CandidateEvaluator<'_>,
        steps: &mut StepCounter,
    ) -> Result<StepOutcome, EstimationError> {
        let outcome = match self.strategy {
            Strategy::GradientFamily(rule) => {
                let gradient = derivatives.jacobian.mapv(|v| -v);
                let moments = self.moments.as_mut().ok_or_else(|| {
                    EstimationError::LayoutError("first-order state was not allocated".to_string())
                })?;
                moments.apply(rule, self.learning_rate, active, params, gradient.view());
                StepOutcome {
                    updated: vec![true; active.len()],
                    norm_ll_after: None,
                }
            }
            Strategy::NewtonRaphson | Strategy::Irls => {
                let directions = newton_directions(derivatives).ok_or_else(missing_curvature)?;
                params.scaled_add(-self.learning_rate, &directions.delta);
                StepOutcome {
                    updated: vec![true; active.len()],
                    norm_ll_after: None,
                }
            }
            Strategy::NewtonRaphsonTrustRegion | Strategy::IrlsTrustRegion => {
                self.trust_region_step(active, params, derivatives, norm_ll, evaluate)?
            }
        };
        steps.increment();
        Ok(outcome)
    }

    fn trust_region_step(
        &mut self,
        active: &ActiveSet,
        params: &mut Array2<f64>,
        derivatives: &Derivatives,
        norm_ll: ArrayView1<f64>,
        evaluate: &mut CandidateEvaluator<'_>,
    ) -> Result<StepOutcome, EstimationError> {
        let state = self.trust_region.as_mut().ok_or_else(|| {
            EstimationError::LayoutError("trust-region state was not allocated".to_string())
        })?;
        let directions = newton_directions(derivatives).ok_or_else(missing_curvature)?;

        let radii: Array1<f64> = active.indices().iter().map(|&f| state.radius[f]).collect();
        let candidate = &*params - &(&directions.delta * &radii.view().insert_axis(Axis(0)));
        let candidate_ll = evaluate(candidate.view())?;

        let mut updated = vec![false; active.len()];
        let mut ll_after = norm_ll.to_owned();
        let mut accepted = 0usize;
        for (column, &feature) in active.indices().iter().enumerate() {
            let actual_gain = candidate_ll[column] - norm_ll[column];
            let predicted_gain = directions.predicted_gain(column, radii[column]);
            let ratio = gain_ratio(actual_gain, predicted_gain);
            if state.accepts(actual_gain, ratio) {
                params.column_mut(column).assign(&candidate.column(column));
                ll_after[column] = candidate_ll[column];
                updated[column] = true;
                accepted += 1;
            }
            state.adapt(feature, ratio);
            log::trace!(
                "Feature {feature}: gain {actual_gain:.3e} (predicted {predicted_gain:.3e}, ratio {ratio:.3}), {} at radius {:.3e}",
                if updated[column] { "accepted" } else { "rejected" },
                state.radius[feature]
            );
        }
        log::debug!(
            "Trust region accepted {accepted} of {} candidate steps.",
            active.len()
        );

        Ok(StepOutcome {
            updated,
            norm_ll_after: Some(ll_after),
        })
    }
}

fn missing_curvature() -> EstimationError {
    EstimationError::LayoutError(
        "second-order strategy received derivatives without curvature".to_string(),
    )
}
