//! Fit configuration: the noise model, the optimizer and its tuning constants,
//! loadable from and savable to TOML.

use crate::bounds::DEFAULT_BOUNDS_MARGIN;
use crate::optimizer::Strategy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

/// Link applied to the scale linear predictor of the normal family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleLink {
    /// `sd = exp(design_scale · b)`.
    Log,
    /// `sd = design_scale · b`, clipped to stay positive.
    Identity,
}

/// Noise model of the GLM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Family {
    /// Log-link mean and log-link dispersion (size) parameter.
    #[default]
    NegativeBinomial,
    /// Identity-link mean with a log or identity link on the standard deviation.
    Normal { scale_link: ScaleLink },
}

impl Family {
    /// Normal family with the log scale link.
    pub fn normal() -> Self {
        Family::Normal {
            scale_link: ScaleLink::Log,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Family::NegativeBinomial => "negative binomial",
            Family::Normal { .. } => "normal",
        }
    }
}

/// Step scales at or beyond this bound have no predicted gain under the quadratic model.
pub const MAX_TRUST_REGION_RADIUS: f64 = 2.0;

/// Acceptance thresholds and radius schedule shared by the trust-region strategies.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrustRegionConfig {
    /// Radius every feature starts with; the step taken is `radius · Δ`.
    pub initial_radius: f64,
    /// Largest radius; must stay below [`MAX_TRUST_REGION_RADIUS`].
    pub upper_bound: f64,
    /// Minimal actual gain for acceptance.
    pub eta0: f64,
    /// Minimal gain ratio for acceptance; ratios below it shrink the radius.
    pub eta1: f64,
    /// Ratios above it grow the radius.
    pub eta2: f64,
    /// Shrink factor.
    pub t1: f64,
    /// Growth factor.
    pub t2: f64,
}

impl Default for TrustRegionConfig {
    fn default() -> Self {
        Self {
            initial_radius: 1.0,
            upper_bound: 1.0,
            eta0: 0.0,
            eta1: 0.25,
            eta2: 0.75,
            t1: 0.25,
            t2: 2.0,
        }
    }
}

/// Global and per-feature stopping rules.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConvergenceConfig {
    /// Number of steps per loss window.
    pub loss_window: usize,
    /// Global stop once consecutive window means differ by less than this.
    pub loss_threshold: f64,
    /// A feature whose committed step changes its normalized log-likelihood by
    /// less than this is converged.
    pub ll_tolerance: f64,
    /// A feature whose gradient infinity norm falls below this is converged.
    pub gradient_tolerance: f64,
    /// Consecutive rejected trust-region steps after which a feature is converged.
    pub max_stalled_steps: usize,
}

impl Default for ConvergenceConfig {
    fn default() -> Self {
        Self {
            loss_window: 50,
            loss_threshold: 1e-8,
            ll_tolerance: 1e-10,
            gradient_tolerance: 1e-8,
            max_stalled_steps: 6,
        }
    }
}

/// The complete blueprint of a fit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FitConfig {
    pub optimizer: Strategy,
    /// Step scale for non-trust-region strategies; the strategy default applies when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub learning_rate: Option<f64>,
    pub max_steps: usize,
    /// Fraction of the floating point range used for parameter bounds.
    pub bounds_margin: f64,
    /// Queue a checkpoint snapshot every this many steps.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_every: Option<usize>,
    /// Worker threads draining the checkpoint queue.
    pub checkpoint_workers: usize,
    /// Evaluate the Jacobian, Hessian and Fisher information at the solution.
    pub compute_final_derivatives: bool,
    // Tables come last so the TOML output stays valid.
    pub family: Family,
    pub trust_region: TrustRegionConfig,
    pub convergence: ConvergenceConfig,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            family: Family::NegativeBinomial,
            optimizer: Strategy::NewtonRaphsonTrustRegion,
            learning_rate: None,
            max_steps: 100,
            trust_region: TrustRegionConfig::default(),
            convergence: ConvergenceConfig::default(),
            bounds_margin: DEFAULT_BOUNDS_MARGIN,
            checkpoint_every: None,
            checkpoint_workers: 1,
            compute_final_derivatives: false,
        }
    }
}

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Failed to read or write configuration file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize configuration to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl FitConfig {
    /// Learning rate in effect for the configured strategy.
    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
            .unwrap_or_else(|| self.optimizer.default_learning_rate())
    }

    /// Checks the tuning constants before any iteration runs.
    pub fn validate(&self) -> Result<(), ModelError> {
        let invalid = |message: String| Err(ModelError::InvalidConfig(message));

        let lr = self.learning_rate();
        if !(lr.is_finite() && lr > 0.0) {
            return invalid(format!("learning rate must be positive, got {lr}"));
        }
        if !(self.bounds_margin > 0.0 && self.bounds_margin < 1.0) {
            return invalid(format!(
                "bounds margin must lie in (0, 1), got {}",
                self.bounds_margin
            ));
        }
        if self.checkpoint_every == Some(0) {
            return invalid("checkpoint interval must be at least one step".to_string());
        }
        if self.checkpoint_workers == 0 {
            return invalid("at least one checkpoint worker is required".to_string());
        }

        let tr = &self.trust_region;
        if !(tr.initial_radius > 0.0 && tr.initial_radius <= tr.upper_bound) {
            return invalid(format!(
                "trust-region radius must satisfy 0 < initial ({}) <= upper bound ({})",
                tr.initial_radius, tr.upper_bound
            ));
        }
        if tr.upper_bound >= MAX_TRUST_REGION_RADIUS {
            return invalid(format!(
                "trust-region upper bound must be below {MAX_TRUST_REGION_RADIUS}, got {}",
                tr.upper_bound
            ));
        }
        if !(tr.eta0 >= 0.0 && tr.eta1 <= tr.eta2) {
            return invalid(format!(
                "trust-region thresholds must satisfy eta0 >= 0 and eta1 <= eta2, got {}, {}, {}",
                tr.eta0, tr.eta1, tr.eta2
            ));
        }
        if !(tr.t1 > 0.0 && tr.t1 < 1.0 && tr.t2 > 1.0) {
            return invalid(format!(
                "trust-region factors must satisfy 0 < t1 < 1 < t2, got {}, {}",
                tr.t1, tr.t2
            ));
        }

        let conv = &self.convergence;
        if conv.loss_window == 0 {
            return invalid("loss window must hold at least one step".to_string());
        }
        if conv.max_stalled_steps == 0 {
            return invalid("max_stalled_steps must be at least one".to_string());
        }
        Ok(())
    }

    /// Saves the configuration to a human-readable TOML file.
    pub fn save(&self, path: &Path) -> Result<(), ModelError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        Ok(())
    }

    /// Loads a configuration from a TOML file; absent fields take their defaults.
    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        let config: FitConfig = toml::from_str(&toml_string)?;
        config.validate()?;
        Ok(config)
    }
}
