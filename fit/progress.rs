use crate::session::StopReason;

/// Observer for reporting incremental progress while fitting.
pub trait FitProgressObserver {
    fn on_fit_start(&mut self, n_features: usize, max_steps: usize) {
        let _ = (n_features, max_steps);
    }
    fn on_iteration(&mut self, step: usize, loss: f64, n_converged: usize) {
        let _ = (step, loss, n_converged);
    }
    fn on_fit_finish(&mut self, reason: &StopReason) {
        let _ = reason;
    }
}

#[derive(Default)]
pub struct NoopFitProgress;

impl FitProgressObserver for NoopFitProgress {}
