use indicatif::{ProgressBar, ProgressStyle};
use romsmith_core::ProgressReporter;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

const TICK_CHARS: &str = "⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏";

/// CLI progress reporter using indicatif progress bars.
///
/// - Walk phase: spinner (input count unknown upfront)
/// - Input phase: progress bar over top-level inputs
#[derive(Default)]
pub struct CliReporter {
    bar: Mutex<Option<ProgressBar>>,
}

impl CliReporter {
    pub fn new() -> Self {
        Self {
            bar: Mutex::new(None),
        }
    }

    fn guard(&self) -> MutexGuard<'_, Option<ProgressBar>> {
        self.bar.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_bar(&self, pb: ProgressBar) {
        let mut guard = self.guard();
        if let Some(old) = guard.take() {
            old.finish_and_clear();
        }
        *guard = Some(pb);
    }

    fn finish_bar(&self) {
        if let Some(pb) = self.guard().take() {
            pb.finish_and_clear();
        }
    }
}

fn style(template: &str) -> ProgressStyle {
    ProgressStyle::with_template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("━╸─")
        .tick_chars(TICK_CHARS)
}

impl ProgressReporter for CliReporter {
    fn on_walk_start(&self) {
        let pb = ProgressBar::new_spinner();
        pb.set_style(style("{spinner:.cyan} {msg}"));
        pb.set_message("Collecting inputs...");
        pb.enable_steady_tick(Duration::from_millis(80));
        self.set_bar(pb);
    }

    fn on_walk_complete(&self, total_inputs: usize, duration_secs: f64) {
        self.finish_bar();
        eprintln!(
            "  \x1b[32m✓\x1b[0m Found {} inputs in {:.2}s",
            total_inputs, duration_secs
        );

        let pb = ProgressBar::new(total_inputs as u64);
        pb.set_style(style(
            "  {spinner:.cyan} Processing [{bar:30.cyan/dim}] {pos}/{len} inputs ({eta} remaining) {msg}",
        ));
        pb.enable_steady_tick(Duration::from_millis(80));
        self.set_bar(pb);
    }

    fn on_input_complete(&self, done: usize, _total: usize, path: &str) {
        if let Some(pb) = self.guard().as_ref() {
            pb.set_position(done as u64);
            let name = Path::new(path)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            pb.set_message(name);
        }
    }

    fn on_run_complete(&self, duration_secs: f64) {
        self.finish_bar();
        eprintln!("  \x1b[32m✓\x1b[0m Done in {:.2}s", duration_secs);
    }
}
