use indicatif::{ProgressBar, ProgressDrawTarget, ProgressState, ProgressStyle};
use std::sync::Arc;
use std::time::Duration;
use thermoflow::engine::progress::{Progress, ProgressCallback};

const SPINNER_TICK_MS: u64 = 80;

/// Renders engine progress on stderr: a spinner while a batch is being
/// scheduled, then a bar over its work items.
#[derive(Clone)]
pub struct CliProgressHandler {
    pb: ProgressBar,
}

impl CliProgressHandler {
    pub fn new() -> Self {
        Self::with_target(ProgressDrawTarget::stderr())
    }

    /// A handler that tracks state but never draws.
    pub fn hidden() -> Self {
        Self::with_target(ProgressDrawTarget::hidden())
    }

    fn with_target(target: ProgressDrawTarget) -> Self {
        let pb = ProgressBar::with_draw_target(Some(0), target).with_style(spinner_style());
        pb.finish_and_clear();
        Self { pb }
    }

    pub fn callback(&self) -> ProgressCallback {
        let pb = self.pb.clone();
        Arc::new(move |progress: Progress| match progress {
            Progress::PhaseStart { name } => {
                pb.reset();
                pb.set_length(0);
                pb.set_style(spinner_style());
                pb.set_message(name);
                pb.enable_steady_tick(Duration::from_millis(SPINNER_TICK_MS));
            }
            Progress::PhaseFinish => {
                pb.disable_steady_tick();
                pb.set_message("Scheduled");
            }
            Progress::TaskStart { total_steps } => {
                pb.disable_steady_tick();
                pb.reset();
                pb.set_length(total_steps);
                pb.set_position(0);
                pb.set_style(bar_style());
                pb.set_message("Computing");
            }
            Progress::TaskIncrement => pb.inc(1),
            Progress::TaskFinish => {
                let length = pb.length().unwrap_or(0);
                if pb.position() < length {
                    pb.set_position(length);
                }
                pb.finish_with_message("✓ Done");
            }
            Progress::Message(msg) => pb.println(format!("  {msg}")),
        })
    }

    /// Clears the bar before regular output is printed.
    pub fn clear(&self) {
        self.pb.finish_and_clear();
    }
}

impl Default for CliProgressHandler {
    fn default() -> Self {
        Self::new()
    }
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::with_template("{spinner:.green} {msg}").unwrap_or_else(|_| ProgressStyle::default_spinner())
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::with_template("{msg:<12} [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .with_key("eta", |state: &ProgressState, w: &mut dyn std::fmt::Write| {
            let _ = write!(w, "{:.1}s", state.eta().as_secs_f64());
        })
        .progress_chars("##-")
}
