//! Entry point of a fit: validation, initialization, the session loop and the
//! assembly of the output.

use crate::bounds::ParamBounds;
use crate::constraints::ConstraintError;
use crate::data::{DataError, FitData};
use crate::derivatives::{CurvatureKind, DifferentialEngine};
use crate::faer_ndarray::FaerLinalgError;
use crate::init::{ClosedFormInitializer, InitialParameters, Initializer};
use crate::model::{FitConfig, ModelError};
use crate::progress::{FitProgressObserver, NoopFitProgress};
use crate::session::{CheckpointSink, FitSession, StopHandle, StopReason, forward_model};
use crate::variables::{ModelVariables, ParameterLayout};
use ndarray::{Array1, Array2, Array3};
use thiserror::Error;

/// A comprehensive error type for the model estimation process.
#[derive(Error, Debug)]
pub enum EstimationError {
    #[error("Constraint matrix is malformed: {0}")]
    Constraint(#[from] ConstraintError),

    #[error("Input data is invalid: {0}")]
    Data(#[from] DataError),

    #[error("Configuration error: {0}")]
    Config(#[from] ModelError),

    #[error("A linear system solve failed: {0}")]
    LinearSystemSolveFailed(#[from] FaerLinalgError),

    #[error("Unsupported optimizer '{0}'")]
    UnsupportedOptimizer(String),

    #[error("Invalid fit setup: {0}")]
    InvalidConfig(String),

    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("Checkpoint worker failed: {0}")]
    CheckpointWorker(String),

    #[error("An internal error occurred during model layout or coefficient mapping: {0}")]
    LayoutError(String),
}

/// Derivatives over all features at the solution, for downstream inference.
#[derive(Debug, Clone)]
pub struct FinalDerivatives {
    /// Gradient of the normalized log-likelihood, independent parameters × features.
    pub jacobian: Array2<f64>,
    /// Hessian of the normalized log-likelihood, features × k × k.
    pub hessian: Array3<f64>,
    /// Fisher information of the normalized log-likelihood, features × k × k.
    pub fisher: Array3<f64>,
}

/// Output of a fit.
#[derive(Debug, Clone)]
pub struct FitResult {
    pub feature_names: Vec<String>,
    pub loc_names: Vec<String>,
    pub scale_names: Vec<String>,
    pub converged: Vec<bool>,
    /// Independent location coefficients.
    pub a_var: Array2<f64>,
    /// Independent scale coefficients.
    pub b_var: Array2<f64>,
    /// Full, clipped location coefficients.
    pub a: Array2<f64>,
    /// Full, clipped scale coefficients.
    pub b: Array2<f64>,
    pub log_likelihood: Array1<f64>,
    pub norm_log_likelihood: Array1<f64>,
    pub loss: f64,
    pub iterations: usize,
    pub stop_reason: StopReason,
    /// Final trust-region radius per feature, for the trust-region strategies.
    pub trust_region_radius: Option<Array1<f64>>,
    pub final_derivatives: Option<FinalDerivatives>,
}

impl FitResult {
    pub fn n_converged(&self) -> usize {
        self.converged.iter().filter(|&&c| c).count()
    }

    pub fn all_converged(&self) -> bool {
        self.converged.iter().all(|&c| c)
    }
}

/// Optional collaborators of a fit.
#[derive(Default)]
pub struct FitHooks<'a> {
    /// Starting coefficients; the initializer runs when absent.
    pub initial: Option<InitialParameters>,
    /// Defaults to the closed-form initializer.
    pub initializer: Option<&'a dyn Initializer>,
    pub progress: Option<&'a mut dyn FitProgressObserver>,
    pub stop: Option<StopHandle>,
    /// Receives snapshots every `checkpoint_every` steps, off the fit loop.
    pub checkpoint: Option<&'a dyn CheckpointSink>,
}

/// Fits every feature of `data` with closed-form starting values.
pub fn fit_glm(data: &FitData, config: &FitConfig) -> Result<FitResult, EstimationError> {
    fit_glm_with(data, config, FitHooks::default())
}

/// Fits every feature of `data`, with caller-supplied collaborators.
pub fn fit_glm_with(
    data: &FitData,
    config: &FitConfig,
    hooks: FitHooks<'_>,
) -> Result<FitResult, EstimationError> {
    config.validate()?;
    data.validate_for(config.family)?;
    if hooks.checkpoint.is_some() && config.checkpoint_every.is_none() {
        return Err(EstimationError::InvalidConfig(
            "a checkpoint sink was supplied but checkpoint_every is not set".to_string(),
        ));
    }

    let bounds = ParamBounds::new(config.bounds_margin);
    let layout = ParameterLayout::new(data)?;
    let initial = match hooks.initial {
        Some(initial) => initial,
        None => {
            let initializer: &dyn Initializer = hooks.initializer.unwrap_or(&ClosedFormInitializer);
            initializer.initialize(data, config.family, &bounds)?
        }
    };
    check_initial_shape(data, &initial)?;

    log::info!(
        "Fitting a {} GLM with {} to {} features over {} observations ({} location, {} scale parameters).",
        config.family.name(),
        config.optimizer,
        data.n_features(),
        data.n_observations(),
        layout.loc.n_params(),
        layout.scale.n_params()
    );

    let variables = ModelVariables::new(layout, bounds, initial.a.view(), initial.b.view())?;
    let mut session = FitSession::new(
        data,
        config,
        variables,
        hooks.stop.unwrap_or_default(),
    )?;

    let mut noop = NoopFitProgress;
    let progress: &mut dyn FitProgressObserver = match hooks.progress {
        Some(progress) => progress,
        None => &mut noop,
    };
    let stop_reason = session.run(progress, hooks.checkpoint)?;

    let result = assemble_result(data, config, &session, stop_reason)?;
    log::info!(
        "Fit finished after {} steps ({stop_reason}): {} of {} features converged, loss {:.6e}.",
        result.iterations,
        result.n_converged(),
        data.n_features(),
        result.loss
    );
    Ok(result)
}

fn check_initial_shape(data: &FitData, initial: &InitialParameters) -> Result<(), EstimationError> {
    let expected_a = (data.design_loc.ncols(), data.n_features());
    let expected_b = (data.design_scale.ncols(), data.n_features());
    if initial.a.dim() != expected_a {
        return Err(EstimationError::DimensionMismatch(format!(
            "initial location coefficients are {:?}, expected {expected_a:?}",
            initial.a.dim()
        )));
    }
    if initial.b.dim() != expected_b {
        return Err(EstimationError::DimensionMismatch(format!(
            "initial scale coefficients are {:?}, expected {expected_b:?}",
            initial.b.dim()
        )));
    }
    Ok(())
}

fn assemble_result(
    data: &FitData,
    config: &FitConfig,
    session: &FitSession<'_>,
    stop_reason: StopReason,
) -> Result<FitResult, EstimationError> {
    let variables = session.variables();
    let a = variables.a()?;
    let b = variables.b()?;
    let norm_log_likelihood = session.norm_log_likelihood().clone();
    let log_likelihood = &norm_log_likelihood * data.n_observations() as f64;

    let final_derivatives = if config.compute_final_derivatives {
        let model = forward_model(data, config.family, variables.bounds(), data.x.view());
        let evaluation = model.evaluate(a.view(), b.view());
        let engine = session.engine();
        let derivatives = engine.derivatives(&model, &evaluation, CurvatureKind::Hessian);
        let hessian = derivatives.curvature.ok_or_else(|| {
            EstimationError::LayoutError("Hessian missing from final derivatives".to_string())
        })?;
        Some(FinalDerivatives {
            jacobian: derivatives.jacobian,
            hessian,
            fisher: engine.fisher_information(&model, &evaluation),
        })
    } else {
        None
    };

    Ok(FitResult {
        feature_names: data.feature_names.clone(),
        loc_names: data.design_loc.column_names().to_vec(),
        scale_names: data.design_scale.column_names().to_vec(),
        converged: variables.converged().to_vec(),
        a_var: variables.a_var().to_owned(),
        b_var: variables.b_var().to_owned(),
        a,
        b,
        log_likelihood,
        norm_log_likelihood,
        loss: session.loss(),
        iterations: session.steps(),
        stop_reason,
        trust_region_radius: session
            .optimizer()
            .trust_region()
            .map(|state| state.radius().to_owned()),
        final_derivatives,
    })
}
