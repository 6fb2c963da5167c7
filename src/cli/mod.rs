//! Terminal front end for the `build` command.

pub mod progress;

use anstyle::{AnsiColor, Style};

use crate::models::BuildSummary;

pub use progress::TerminalProgress;

/// One-line human readable rendering of a finished build. Without `styled`
/// the line carries no escape codes, for output that is piped or redirected.
pub fn render_summary(summary: &BuildSummary, styled: bool) -> String {
    let paint = |style: Style| if styled { style } else { Style::new() };
    let bold = paint(Style::new().bold());
    let (state, color) = if summary.failed_count > 0 {
        ("completed with failures", AnsiColor::Yellow)
    } else if summary.has_updates {
        ("manifest updated", AnsiColor::Green)
    } else {
        ("manifest up to date", AnsiColor::BrightBlack)
    };
    let state_style = paint(Style::new().fg_color(Some(color.into())));

    format!(
        "{state_style}{state}{state_style:#}: {bold}{}{bold:#} photos ({} new, {} updated, {} skipped, {} failed, {} deleted)",
        summary.total_photos,
        summary.new_count,
        summary.processed_count,
        summary.skipped_count,
        summary.failed_count,
        summary.deleted_count,
    )
}
