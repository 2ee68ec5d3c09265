//! Global and per-feature stopping rules.

use crate::model::ConvergenceConfig;
use crate::variables::ActiveSet;
use ndarray::{Array1, Array2, ArrayView1, Axis};

/// Windowed loss history deciding the global stop.
///
/// Losses are grouped into consecutive windows of fixed size. When a window
/// completes, its mean is compared with the previous window's mean, the first
/// window being compared with the loss at the starting point.
#[derive(Debug, Clone)]
pub struct LossMonitor {
    window: usize,
    threshold: f64,
    current: Vec<f64>,
    previous_mean: f64,
    loss_change: f64,
    completed_windows: usize,
}

impl LossMonitor {
    pub fn new(window: usize, threshold: f64, initial_loss: f64) -> Self {
        let window = window.max(1);
        Self {
            window,
            threshold,
            current: Vec::with_capacity(window),
            previous_mean: initial_loss,
            loss_change: f64::INFINITY,
            completed_windows: 0,
        }
    }

    pub fn from_config(config: &ConvergenceConfig, initial_loss: f64) -> Self {
        Self::new(config.loss_window, config.loss_threshold, initial_loss)
    }

    /// Records the loss of one step. Returns the new loss change when this
    /// step completed a window.
    pub fn record(&mut self, loss: f64) -> Option<f64> {
        self.current.push(loss);
        if self.current.len() < self.window {
            return None;
        }
        let mean = self.current.iter().sum::<f64>() / self.window as f64;
        self.loss_change = (mean - self.previous_mean).abs();
        self.previous_mean = mean;
        self.current.clear();
        self.completed_windows += 1;
        Some(self.loss_change)
    }

    /// Absolute change between the last two window means; infinite until the
    /// first window completes.
    pub fn loss_change(&self) -> f64 {
        self.loss_change
    }

    pub fn completed_windows(&self) -> usize {
        self.completed_windows
    }

    pub fn should_stop(&self) -> bool {
        self.loss_change < self.threshold
    }
}

/// Why a feature left the active set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureStop {
    SmallGradient,
    SmallChange,
    Stalled,
}

/// Per-feature convergence bookkeeping.
#[derive(Debug, Clone)]
pub struct FeatureConvergence {
    gradient_tolerance: f64,
    ll_tolerance: f64,
    max_stalled_steps: usize,
    stalled: Vec<usize>,
}

impl FeatureConvergence {
    pub fn new(config: &ConvergenceConfig, n_features: usize) -> Self {
        Self {
            gradient_tolerance: config.gradient_tolerance,
            ll_tolerance: config.ll_tolerance,
            max_stalled_steps: config.max_stalled_steps,
            stalled: vec![0; n_features],
        }
    }

    /// Consecutive non-updated steps of one feature.
    pub fn stalled_steps(&self, feature: usize) -> usize {
        self.stalled[feature]
    }

    /// Judges the active features after one step.
    ///
    /// `gradient_norms` are taken at the point the step started from, and
    /// `ll_before`/`ll_after` are normalized log-likelihoods around the step.
    /// Returns the features (as full indices) that converged.
    pub fn assess(
        &mut self,
        active: &ActiveSet,
        gradient_norms: ArrayView1<f64>,
        updated: &[bool],
        ll_before: ArrayView1<f64>,
        ll_after: ArrayView1<f64>,
    ) -> Vec<(usize, FeatureStop)> {
        let mut newly_converged = Vec::new();
        for (column, &feature) in active.indices().iter().enumerate() {
            if updated[column] {
                self.stalled[feature] = 0;
            } else {
                self.stalled[feature] += 1;
            }

            let stop = if gradient_norms[column] < self.gradient_tolerance {
                Some(FeatureStop::SmallGradient)
            } else if updated[column]
                && (ll_after[column] - ll_before[column]).abs() < self.ll_tolerance
            {
                Some(FeatureStop::SmallChange)
            } else if self.stalled[feature] >= self.max_stalled_steps {
                Some(FeatureStop::Stalled)
            } else {
                None
            };
            if let Some(reason) = stop {
                newly_converged.push((feature, reason));
            }
        }
        newly_converged
    }
}

/// Infinity norm of each column of a `k × features` gradient.
pub fn gradient_norms(jacobian: &Array2<f64>) -> Array1<f64> {
    jacobian.map_axis(Axis(0), |column| {
        column.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()))
    })
}
