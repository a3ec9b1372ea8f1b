/// Trait for reporting pipeline progress.
///
/// The CLI implements it with indicatif bars. All methods have default no-op
/// implementations.
pub trait ProgressReporter: Send + Sync {
    fn on_walk_start(&self) {}
    fn on_walk_complete(&self, _total_inputs: usize, _duration_secs: f64) {}
    fn on_input_complete(&self, _done: usize, _total: usize, _path: &str) {}
    fn on_run_complete(&self, _duration_secs: f64) {}
}

/// No-op progress reporter for silent operation.
pub struct SilentReporter;

impl ProgressReporter for SilentReporter {}
