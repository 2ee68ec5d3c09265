//! The coordinating fit loop.
//!
//! A `FitSession` owns every piece of state that survives an iteration: the
//! parameter store, the step counter, the loss history and the per-feature
//! convergence bookkeeping. Only the thread running the loop writes them.

use crate::bounds::ParamBounds;
use crate::convergence::{FeatureConvergence, LossMonitor, gradient_norms};
use crate::data::FitData;
use crate::derivatives::{AnalyticEngine, DifferentialEngine};
use crate::estimate::EstimationError;
use crate::likelihood::{ForwardModel, ModelEvaluation};
use crate::model::{Family, FitConfig};
use crate::optimizer::{Optimizer, StepCounter};
use crate::progress::FitProgressObserver;
use crate::variables::{ActiveSet, ModelVariables, ParameterLayout};
use crossbeam_channel::{Sender, unbounded};
use ndarray::{Array1, Array2, ArrayView2};
use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

/// Why the fit loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Every feature converged.
    AllConverged,
    /// The windowed loss stopped changing.
    LossPlateau,
    /// The step budget ran out; per-feature flags tell which features converged.
    MaxIterations,
    /// A stop was requested through a `StopHandle`.
    Cancelled,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StopReason::AllConverged => "all features converged",
            StopReason::LossPlateau => "loss plateau",
            StopReason::MaxIterations => "maximum iterations reached",
            StopReason::Cancelled => "cancelled",
        })
    }
}

/// Cooperative stop request, checked between iterations.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// State handed to checkpoint workers.
#[derive(Debug, Clone)]
pub struct FitSnapshot {
    pub step: usize,
    pub loss: f64,
    pub a: Array2<f64>,
    pub b: Array2<f64>,
    pub converged: Vec<bool>,
}

/// Side effect run off the fit loop for every queued snapshot.
pub trait CheckpointSink: Sync {
    fn write_checkpoint(&self, snapshot: &FitSnapshot) -> io::Result<()>;
}

impl<F> CheckpointSink for F
where
    F: Fn(&FitSnapshot) -> io::Result<()> + Sync,
{
    fn write_checkpoint(&self, snapshot: &FitSnapshot) -> io::Result<()> {
        self(snapshot)
    }
}

/// Builds the forward model for a block of feature columns.
pub(crate) fn forward_model<'b>(
    data: &'b FitData,
    family: Family,
    bounds: &'b ParamBounds,
    x: ArrayView2<'b, f64>,
) -> ForwardModel<'b> {
    ForwardModel::new(
        family,
        bounds,
        x,
        data.design_loc.values(),
        data.design_scale.values(),
        data.offset.as_ref().map(|offset| offset.view()),
    )
}

pub struct FitSession<'a> {
    data: &'a FitData,
    config: &'a FitConfig,
    layout: ParameterLayout,
    bounds: ParamBounds,
    engine: AnalyticEngine,
    variables: ModelVariables,
    optimizer: Optimizer,
    steps: StepCounter,
    monitor: LossMonitor,
    features: FeatureConvergence,
    /// Latest normalized log-likelihood of every feature.
    norm_ll: Array1<f64>,
    active: ActiveSet,
    x_active: Array2<f64>,
    /// Evaluation of the active columns at their committed parameters.
    current: ModelEvaluation,
    stop: StopHandle,
}

impl<'a> FitSession<'a> {
    /// Evaluates the starting point and seeds the loss history with it.
    pub fn new(
        data: &'a FitData,
        config: &'a FitConfig,
        variables: ModelVariables,
        stop: StopHandle,
    ) -> Result<Self, EstimationError> {
        let layout = variables.layout().clone();
        let bounds = variables.bounds().clone();
        let engine = layout.engine(data);
        let n_features = variables.n_features();
        let optimizer = Optimizer::new(
            config.optimizer,
            config.learning_rate(),
            &config.trust_region,
            layout.n_independent(),
            n_features,
        );

        let active = variables.active_set();
        let x_active = active.gather(data.x.view());
        let (a, b) = layout.full_parameters(variables.gather(&active).view(), &bounds)?;
        let current = forward_model(data, config.family, &bounds, x_active.view())
            .evaluate(a.view(), b.view());
        let norm_ll = current.norm_log_likelihood();
        let initial_loss = -norm_ll.sum();
        log::debug!("Initial loss {initial_loss:.6e} over {n_features} features.");

        Ok(Self {
            data,
            config,
            layout,
            bounds,
            engine,
            variables,
            optimizer,
            steps: StepCounter::default(),
            monitor: LossMonitor::from_config(&config.convergence, initial_loss),
            features: FeatureConvergence::new(&config.convergence, n_features),
            norm_ll,
            active,
            x_active,
            current,
            stop,
        })
    }

    pub fn variables(&self) -> &ModelVariables {
        &self.variables
    }

    pub fn optimizer(&self) -> &Optimizer {
        &self.optimizer
    }

    pub fn steps(&self) -> usize {
        self.steps.get()
    }

    pub fn norm_log_likelihood(&self) -> &Array1<f64> {
        &self.norm_ll
    }

    pub fn loss(&self) -> f64 {
        -self.norm_ll.sum()
    }

    pub fn engine(&self) -> &AnalyticEngine {
        &self.engine
    }

    /// Runs the loop to completion. Checkpoint snapshots are drained by a pool
    /// of workers that is joined before this returns.
    pub fn run(
        &mut self,
        progress: &mut dyn FitProgressObserver,
        checkpoint: Option<&dyn CheckpointSink>,
    ) -> Result<StopReason, EstimationError> {
        progress.on_fit_start(self.variables.n_features(), self.config.max_steps);

        let result = thread::scope(|scope| {
            let (sender, workers) = match checkpoint {
                Some(sink) => {
                    let (tx, rx) = unbounded::<FitSnapshot>();
                    let workers: Vec<_> = (0..self.config.checkpoint_workers.max(1))
                        .map(|worker| {
                            let rx = rx.clone();
                            scope.spawn(move || {
                                for snapshot in rx.iter() {
                                    if let Err(err) = sink.write_checkpoint(&snapshot) {
                                        log::warn!(
                                            "Checkpoint worker {worker} failed at step {}: {err}",
                                            snapshot.step
                                        );
                                    }
                                }
                            })
                        })
                        .collect();
                    (Some(tx), workers)
                }
                None => (None, Vec::new()),
            };

            let outcome = self.iterate(progress, sender.as_ref());
            // Closing the queue lets the workers finish the backlog and exit.
            drop(sender);

            let panicked = workers
                .into_iter()
                .map(|handle| handle.join())
                .filter(Result::is_err)
                .count();
            if panicked > 0 {
                return Err(EstimationError::CheckpointWorker(format!(
                    "{panicked} checkpoint worker(s) panicked"
                )));
            }
            outcome
        });

        if let Ok(reason) = &result {
            progress.on_fit_finish(reason);
        }
        result
    }

    fn iterate(
        &mut self,
        progress: &mut dyn FitProgressObserver,
        checkpoints: Option<&Sender<FitSnapshot>>,
    ) -> Result<StopReason, EstimationError> {
        let family = self.config.family;
        let curvature = self.config.optimizer.curvature();
        let data = self.data;

        loop {
            if self.active.is_empty() {
                return Ok(StopReason::AllConverged);
            }
            if self.stop.is_stop_requested() {
                log::info!("Stop requested after {} steps.", self.steps.get());
                return Ok(StopReason::Cancelled);
            }
            if self.steps.get() >= self.config.max_steps {
                return Ok(StopReason::MaxIterations);
            }

            let model = forward_model(data, family, &self.bounds, self.x_active.view());
            let derivatives = self.engine.derivatives(&model, &self.current, curvature);
            let norms = gradient_norms(&derivatives.jacobian);
            let ll_before = self.current.norm_log_likelihood();

            let mut block = self.variables.gather(&self.active);
            let mut candidate = None;
            let outcome = {
                let layout = &self.layout;
                let bounds = &self.bounds;
                let mut evaluate =
                    |params: ArrayView2<f64>| -> Result<Array1<f64>, EstimationError> {
                        let (a, b) = layout.full_parameters(params, bounds)?;
                        let evaluation = model.evaluate(a.view(), b.view());
                        let ll = evaluation.norm_log_likelihood();
                        candidate = Some(evaluation);
                        Ok(ll)
                    };
                self.optimizer.update(
                    &self.active,
                    &mut block,
                    &derivatives,
                    ll_before.view(),
                    &mut evaluate,
                    &mut self.steps,
                )?
            };
            self.variables.commit(&self.active, block.view());

            let evaluated = match candidate {
                Some(candidate) => {
                    let mut merged = self.current.clone();
                    merged.adopt_features(&candidate, &outcome.updated);
                    merged
                }
                None => {
                    let (a, b) = self.layout.full_parameters(block.view(), &self.bounds)?;
                    model.evaluate(a.view(), b.view())
                }
            };
            let ll_after = evaluated.norm_log_likelihood();
            for (column, &feature) in self.active.indices().iter().enumerate() {
                self.norm_ll[feature] = ll_after[column];
            }

            let step = self.steps.get();
            let loss = -self.norm_ll.sum();
            if let Some(change) = self.monitor.record(loss) {
                log::debug!("Step {step}: loss window change {change:.3e}.");
            }

            let newly_converged = self.features.assess(
                &self.active,
                norms.view(),
                &outcome.updated,
                ll_before.view(),
                ll_after.view(),
            );
            for &(feature, reason) in &newly_converged {
                log::trace!("Feature {feature} converged at step {step} ({reason:?}).");
                self.variables.mark_converged(feature);
            }
            let n_converged = self.variables.converged().iter().filter(|&&c| c).count();
            let n_updated = outcome.updated.iter().filter(|&&u| u).count();
            log::debug!(
                "Step {step}: loss {loss:.6e}, {n_updated}/{} active features updated, {n_converged} converged.",
                self.active.len()
            );
            progress.on_iteration(step, loss, n_converged);

            if let Some(tx) = checkpoints {
                let every = self.config.checkpoint_every.unwrap_or(0);
                if every > 0 && step % every == 0 {
                    let snapshot = FitSnapshot {
                        step,
                        loss,
                        a: self.variables.a()?,
                        b: self.variables.b()?,
                        converged: self.variables.converged().to_vec(),
                    };
                    if tx.send(snapshot).is_err() {
                        log::warn!("Checkpoint queue closed; dropping snapshot for step {step}.");
                    }
                }
            }

            if newly_converged.is_empty() {
                self.current = evaluated;
            } else {
                let next = self.variables.active_set();
                let kept: Vec<usize> = self
                    .active
                    .indices()
                    .iter()
                    .enumerate()
                    .filter(|&(_, &feature)| !self.variables.converged()[feature])
                    .map(|(column, _)| column)
                    .collect();
                self.current = evaluated.select_features(&kept);
                self.x_active = next.gather(data.x.view());
                self.active = next;
            }

            if self.monitor.should_stop() {
                return Ok(StopReason::LossPlateau);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::DesignMatrix;
    use crate::optimizer::{FirstOrderRule, Strategy};
    use crate::progress::NoopFitProgress;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    fn overdispersed_data() -> FitData {
        let counts = Array2::from_shape_fn((40, 3), |(i, j)| {
            let k = (i * 7 + j * 3) % 11;
            (k * k / 2 + j) as f64
        });
        FitData::new(counts, DesignMatrix::intercept(40), DesignMatrix::intercept(40)).unwrap()
    }

    fn session_for<'a>(
        data: &'a FitData,
        config: &'a FitConfig,
        stop: StopHandle,
    ) -> FitSession<'a> {
        let layout = ParameterLayout::new(data).unwrap();
        let bounds = ParamBounds::new(config.bounds_margin);
        let init_a = Array2::from_elem((1, 3), 1.0);
        let init_b = Array2::zeros((1, 3));
        let variables = ModelVariables::new(layout, bounds, init_a.view(), init_b.view()).unwrap();
        FitSession::new(data, config, variables, stop).unwrap()
    }

    struct Recorder {
        iterations: Vec<(usize, usize)>,
        finished: Option<StopReason>,
    }

    impl FitProgressObserver for Recorder {
        fn on_iteration(&mut self, step: usize, loss: f64, n_converged: usize) {
            assert!(loss.is_finite());
            self.iterations.push((step, n_converged));
        }
        fn on_fit_finish(&mut self, reason: &StopReason) {
            self.finished = Some(*reason);
        }
    }

    #[test]
    fn trust_region_session_converges_every_feature() {
        let data = overdispersed_data();
        let config = FitConfig {
            optimizer: Strategy::NewtonRaphsonTrustRegion,
            ..FitConfig::default()
        };
        let mut session = session_for(&data, &config, StopHandle::new());
        let start_loss = session.loss();
        let mut recorder = Recorder {
            iterations: Vec::new(),
            finished: None,
        };
        let reason = session.run(&mut recorder, None).unwrap();
        assert_eq!(reason, StopReason::AllConverged);
        assert_eq!(recorder.finished, Some(StopReason::AllConverged));
        assert!(session.variables().converged().iter().all(|&c| c));
        assert!(session.loss() < start_loss);
        assert_eq!(recorder.iterations.len(), session.steps());
        let steps: Vec<usize> = recorder.iterations.iter().map(|(s, _)| *s).collect();
        assert_eq!(steps, (1..=session.steps()).collect::<Vec<_>>());
    }

    #[test]
    fn step_budget_is_respected() {
        let data = overdispersed_data();
        let config = FitConfig {
            optimizer: Strategy::GradientFamily(FirstOrderRule::GradientDescent),
            max_steps: 3,
            ..FitConfig::default()
        };
        let mut session = session_for(&data, &config, StopHandle::new());
        let mut progress = NoopFitProgress;
        let reason = session.run(&mut progress, None).unwrap();
        assert_eq!(reason, StopReason::MaxIterations);
        assert_eq!(session.steps(), 3);
    }

    #[test]
    fn stop_request_ends_the_loop_before_the_first_step() {
        let data = overdispersed_data();
        let config = FitConfig::default();
        let stop = StopHandle::new();
        let mut session = session_for(&data, &config, stop.clone());
        stop.request_stop();
        let reason = session.run(&mut NoopFitProgress, None).unwrap();
        assert_eq!(reason, StopReason::Cancelled);
        assert_eq!(session.steps(), 0);
    }

    #[test]
    fn checkpoints_are_written_every_n_steps_and_joined() {
        let data = overdispersed_data();
        let config = FitConfig {
            optimizer: Strategy::GradientFamily(FirstOrderRule::Adam),
            max_steps: 10,
            checkpoint_every: Some(3),
            checkpoint_workers: 2,
            ..FitConfig::default()
        };
        let calls = AtomicUsize::new(0);
        let seen = Mutex::new(Vec::new());
        let sink = |snapshot: &FitSnapshot| -> io::Result<()> {
            calls.fetch_add(1, Ordering::SeqCst);
            seen.lock().unwrap().push(snapshot.step);
            assert_eq!(snapshot.a.dim(), (1, 3));
            Ok(())
        };
        let mut session = session_for(&data, &config, StopHandle::new());
        let reason = session.run(&mut NoopFitProgress, Some(&sink)).unwrap();
        assert_eq!(reason, StopReason::MaxIterations);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let mut steps = seen.into_inner().unwrap();
        steps.sort_unstable();
        assert_eq!(steps, vec![3, 6, 9]);
    }

    #[test]
    fn panicking_checkpoint_worker_is_reported() {
        let data = overdispersed_data();
        let config = FitConfig {
            max_steps: 2,
            checkpoint_every: Some(1),
            ..FitConfig::default()
        };
        let sink = |_: &FitSnapshot| -> io::Result<()> { panic!("disk on fire") };
        let mut session = session_for(&data, &config, StopHandle::new());
        let result = session.run(&mut NoopFitProgress, Some(&sink));
        assert!(matches!(result, Err(EstimationError::CheckpointWorker(_))));
    }
}
