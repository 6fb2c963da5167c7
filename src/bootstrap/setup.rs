//! Setup/initialization module - handles process startup tasks
//!
//! Includes:
//! - Logger initialization (shared by the orchestrator and worker processes)
//! - Output folder creation

use anstyle::{AnsiColor, Style};
use anyhow::{Context, Result};
use env_logger::{Builder, Env, Target, WriteStyle};
use log::kv::Key;
use std::io::Write;

use crate::config::BuilderConfig;

// ────────────────────────────────────────────────────────────────
// Folder Initialization
// ────────────────────────────────────────────────────────────────

/// Create the folders the manifest and thumbnails are written into
pub fn initialize_folder(config: &BuilderConfig) -> Result<()> {
    if let Some(parent) = config.manifest_path.parent() {
        std::fs::create_dir_all(parent)
            .context(format!("failed to create manifest directory {:?}", parent))?;
    }
    std::fs::create_dir_all(&config.thumbnail_dir).context(format!(
        "failed to create thumbnail directory {:?}",
        config.thumbnail_dir
    ))?;
    Ok(())
}

// ────────────────────────────────────────────────────────────────
// Logger Initialization
// ────────────────────────────────────────────────────────────────

/// Initialize the logger.
///
/// Worker processes pass their id so every line is tagged with its origin;
/// they always log to stderr because stdout carries the wire protocol.
pub fn initialize_logger(worker_id: Option<usize>) {
    let dim = Style::new().fg_color(Some(AnsiColor::BrightBlack.into()));
    let cyan = Style::new().fg_color(Some(AnsiColor::Cyan.into()));

    let result = Builder::from_env(Env::default().default_filter_or("info"))
        .write_style(WriteStyle::Auto)
        .target(Target::Stderr)
        .format(move |buf, record| {
            let ts = buf.timestamp();

            let level_style = buf.default_level_style(record.level());

            let origin = match worker_id {
                Some(id) => format!("worker-{id}"),
                None => record.target().to_string(),
            };

            // Extract raw duration and format to 2 decimal places
            let dur_raw = record
                .key_values()
                .get(Key::from("duration"))
                .map(|v| format_duration(&v.to_string()))
                .unwrap_or_default();

            // Right-align the duration field to width 10
            let dur = if dur_raw.is_empty() {
                " ".repeat(10)
            } else {
                format!("{cyan}{:>10}{cyan:#}", dur_raw)
            };

            writeln!(
                buf,
                "{dim}{ts}{dim:#} {level_style}{}{level_style:#} {dim}{origin}{dim:#}",
                record.level()
            )?;

            let message = format!("{}", record.args());
            let subsequent_indent = " ".repeat(11);
            let mut lines = message.lines();

            if let Some(first_line) = lines.next() {
                writeln!(buf, "{} {}", dur, first_line)?;
            }
            for line in lines {
                writeln!(buf, "{}{}", subsequent_indent, line)?;
            }

            Ok(())
        })
        .try_init();

    if let Err(e) = result {
        eprintln!("logger already initialized: {e}");
    }
}

/// `12.345678ms` -> `12.35 ms`
fn format_duration(raw: &str) -> String {
    if let Some(idx) = raw.find(|c: char| c.is_alphabetic() || c == 'µ') {
        let (num, unit) = (&raw[..idx], &raw[idx..]);
        if let Ok(val) = num.parse::<f32>() {
            return format!("{:.2} {}", val, unit);
        }
    }
    raw.to_string()
}
