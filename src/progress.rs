use std::io::{self, Write};
use std::time::Duration;

use crossterm::style::Stylize;
use indicatif::{ProgressBar, ProgressState, ProgressStyle};

/// A simple spinner for long-running stages.
pub struct Spinner {
    bar: ProgressBar,
}

impl Spinner {
    pub fn new(message: impl Into<String>) -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(spinner_style());
        bar.set_message(message.into());
        bar.enable_steady_tick(Duration::from_millis(80));
        Self { bar }
    }

    pub fn hidden() -> Self {
        Self {
            bar: ProgressBar::hidden(),
        }
    }

    pub fn set_message(&self, message: impl Into<String>) {
        self.bar.set_message(message.into());
    }

    /// Clear the spinner and print a `✔ message` line to stderr.
    pub fn finish(self, message: impl Into<String>) {
        let hidden = self.bar.is_hidden();
        self.bar.finish_and_clear();
        if !hidden {
            eprintln!("{} {}", "✔".green(), message.into());
        }
    }

    pub fn abandon(self) {
        self.bar.finish_and_clear();
    }
}

/// Per-stage feedback for a push. Disabled reporters draw nothing.
#[derive(Debug, Clone, Copy)]
pub struct Reporter {
    enabled: bool,
}

impl Reporter {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn disabled() -> Self {
        Self { enabled: false }
    }

    pub fn spinner(&self, message: impl Into<String>) -> Spinner {
        if self.enabled {
            Spinner::new(message)
        } else {
            Spinner::hidden()
        }
    }

    /// Print a completed step.
    pub fn done(&self, message: impl Into<String>) {
        if self.enabled {
            eprintln!("{} {}", "✔".green(), message.into());
        }
    }

    /// A byte-count bar sized to `total`.
    pub fn bytes(&self, total: u64, message: impl Into<String>) -> ProgressBar {
        if !self.enabled {
            return ProgressBar::hidden();
        }
        let bar = ProgressBar::new(total);
        bar.set_style(bytes_style());
        bar.set_message(message.into());
        bar
    }
}

/// Forwards nothing; advances a progress bar by every byte written.
pub struct ProgressWriter {
    bar: ProgressBar,
}

impl ProgressWriter {
    pub fn new(bar: ProgressBar) -> Self {
        Self { bar }
    }
}

impl Write for ProgressWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.bar.inc(buf.len() as u64);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("{spinner:.dim} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

fn bytes_style() -> ProgressStyle {
    ProgressStyle::with_template(
        "{spinner:.dim} {msg} [{bar:20}] {bytes}/{total_bytes} ({elapsed_precise:.>5})",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .with_key(
        "elapsed_precise",
        |state: &ProgressState, w: &mut dyn std::fmt::Write| {
            let _ = write!(w, "{}s", state.elapsed().as_secs());
        },
    )
    .progress_chars("━╸░")
}

/// Human-readable byte size (`1.5 MB`).
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    for unit in UNITS {
        if size < 1024.0 {
            return if size.fract() < 0.05 {
                format!("{:.0} {unit}", size)
            } else {
                format!("{:.1} {unit}", size)
            };
        }
        size /= 1024.0;
    }
    format!("{:.1} TB", size)
}
