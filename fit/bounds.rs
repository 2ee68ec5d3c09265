//! Numerically safe bounds for raw coefficients and the quantities derived from them.
//!
//! Every value that feeds an `exp` or `ln` in the forward model is clamped into a
//! range derived from the floating point type's limits, shrunk by a safety margin
//! so that exponentiating a bound never lands exactly on `f64::MAX` or zero.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Default fraction of the representable range used for the bounds.
pub const DEFAULT_BOUNDS_MARGIN: f64 = 0.98;

/// Representable range of a floating point type, widened to `f64`.
pub trait FloatLimits {
    /// Smallest positive value (subnormal included).
    const TINY: f64;
    /// Largest finite value.
    const MAX: f64;
}

impl FloatLimits for f64 {
    const TINY: f64 = 4.9406564584124654e-324;
    const MAX: f64 = f64::MAX;
}

impl FloatLimits for f32 {
    const TINY: f64 = 1.401298464324817e-45;
    const MAX: f64 = f32::MAX as f64;
}

/// Quantities that carry their own clipping range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BoundedQuantity {
    /// Raw location coefficient "a".
    LocationCoefficient,
    /// Raw scale coefficient "b".
    ScaleCoefficient,
    LogMean,
    LogDispersion,
    Mean,
    Dispersion,
    Probability,
    LogProbability,
    /// Identity-link linear predictor of the normal family.
    LinearPredictor,
    /// Gaussian log-density, which unlike a log-probability may exceed zero.
    LogDensity,
}

impl BoundedQuantity {
    pub const ALL: [BoundedQuantity; 10] = [
        BoundedQuantity::LocationCoefficient,
        BoundedQuantity::ScaleCoefficient,
        BoundedQuantity::LogMean,
        BoundedQuantity::LogDispersion,
        BoundedQuantity::Mean,
        BoundedQuantity::Dispersion,
        BoundedQuantity::Probability,
        BoundedQuantity::LogProbability,
        BoundedQuantity::LinearPredictor,
        BoundedQuantity::LogDensity,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::LocationCoefficient => "a",
            Self::ScaleCoefficient => "b",
            Self::LogMean => "log_mu",
            Self::LogDispersion => "log_r",
            Self::Mean => "mu",
            Self::Dispersion => "r",
            Self::Probability => "probs",
            Self::LogProbability => "log_probs",
            Self::LinearPredictor => "eta",
            Self::LogDensity => "log_density",
        }
    }
}

impl fmt::Display for BoundedQuantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Closed interval a quantity is clamped into.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bound {
    pub min: f64,
    pub max: f64,
}

impl Bound {
    #[inline]
    pub fn clip(&self, value: f64) -> f64 {
        value.clamp(self.min, self.max)
    }
}

/// Per-quantity bounds for one floating point type and safety margin.
#[derive(Clone, Debug, PartialEq)]
pub struct ParamBounds {
    margin: f64,
    log_scale: Bound,
    natural_positive: Bound,
    probability: Bound,
    log_probability: Bound,
    linear_predictor: Bound,
    log_density: Bound,
}

impl ParamBounds {
    /// Bounds for `f64` arithmetic.
    pub fn new(margin: f64) -> Self {
        Self::for_type::<f64>(margin)
    }

    pub fn for_type<T: FloatLimits>(margin: f64) -> Self {
        let ln_tiny = T::TINY.ln();
        let ln_max = T::MAX.ln();
        Self {
            margin,
            log_scale: Bound {
                min: ln_tiny * margin,
                max: ln_max * margin,
            },
            natural_positive: Bound {
                min: T::TINY,
                max: T::MAX * margin,
            },
            probability: Bound { min: 0.0, max: 1.0 },
            log_probability: Bound {
                min: ln_tiny,
                max: 0.0,
            },
            linear_predictor: Bound {
                min: -T::MAX * margin,
                max: T::MAX * margin,
            },
            log_density: Bound {
                min: ln_tiny,
                max: ln_max * margin,
            },
        }
    }

    pub fn margin(&self) -> f64 {
        self.margin
    }

    pub fn bound(&self, quantity: BoundedQuantity) -> Bound {
        match quantity {
            BoundedQuantity::LocationCoefficient
            | BoundedQuantity::ScaleCoefficient
            | BoundedQuantity::LogMean
            | BoundedQuantity::LogDispersion => self.log_scale,
            BoundedQuantity::Mean | BoundedQuantity::Dispersion => self.natural_positive,
            BoundedQuantity::Probability => self.probability,
            BoundedQuantity::LogProbability => self.log_probability,
            BoundedQuantity::LinearPredictor => self.linear_predictor,
            BoundedQuantity::LogDensity => self.log_density,
        }
    }

    #[inline]
    pub fn clip(&self, quantity: BoundedQuantity, value: f64) -> f64 {
        self.bound(quantity).clip(value)
    }

    /// Clamps every element of `values` in place.
    pub fn clip_inplace<S, D>(
        &self,
        quantity: BoundedQuantity,
        values: &mut ndarray::ArrayBase<S, D>,
    )
    where
        S: ndarray::DataMut<Elem = f64>,
        D: ndarray::Dimension,
    {
        let bound = self.bound(quantity);
        values.mapv_inplace(|v| bound.clip(v));
    }
}

impl Default for ParamBounds {
    fn default() -> Self {
        Self::new(DEFAULT_BOUNDS_MARGIN)
    }
}
