use std::sync::Mutex;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

use crate::interfaces::ProgressListener;
use crate::models::{BuildProgress, BuildSummary, ExecutionMode};

const TEMPLATE: &str = "{spinner:.cyan} {prefix} [{bar:40.blue/black}] {pos}/{len} {wide_msg}";

/// Terminal progress bar for a build. Draws to stderr, so it interleaves with
/// the log output instead of the summary printed on stdout.
pub struct TerminalProgress {
    bar: Mutex<Option<ProgressBar>>,
    hidden: bool,
}

impl TerminalProgress {
    pub fn new() -> Self {
        Self {
            bar: Mutex::new(None),
            hidden: false,
        }
    }

    /// Track progress without drawing anything.
    pub fn hidden() -> Self {
        Self {
            bar: Mutex::new(None),
            hidden: true,
        }
    }

    fn current(&self) -> Option<ProgressBar> {
        self.bar.lock().ok().and_then(|slot| slot.clone())
    }

    /// Position of the active bar, if a build has started.
    pub fn position(&self) -> Option<u64> {
        self.current().map(|bar| bar.position())
    }
}

impl Default for TerminalProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressListener for TerminalProgress {
    fn on_start(&self, total: usize, mode: ExecutionMode, concurrency: usize) {
        let bar = ProgressBar::new(total as u64);
        if self.hidden {
            bar.set_draw_target(ProgressDrawTarget::hidden());
        } else {
            bar.enable_steady_tick(Duration::from_millis(120));
        }
        let style = ProgressStyle::with_template(TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▉▊▋▌▍▎▏ ")
            .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏");
        bar.set_style(style);
        bar.set_prefix(format!("{mode} x{concurrency}"));

        if let Ok(mut slot) = self.bar.lock() {
            if let Some(previous) = slot.replace(bar) {
                previous.finish_and_clear();
            }
        }
    }

    fn on_progress(&self, progress: &BuildProgress) {
        if let Some(bar) = self.current() {
            bar.set_position(progress.completed as u64);
            bar.set_message(progress.current_key.clone().unwrap_or_default());
        }
    }

    fn on_complete(&self, summary: &BuildSummary) {
        if let Some(bar) = self.current() {
            bar.finish_with_message(format!(
                "{} new, {} updated, {} failed",
                summary.new_count, summary.processed_count, summary.failed_count
            ));
        }
    }

    fn on_error(&self, error: &anyhow::Error) {
        if let Some(bar) = self.current() {
            bar.abandon_with_message(format!("build failed: {error}"));
        }
    }
}
