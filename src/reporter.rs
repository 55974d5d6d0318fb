//! Progress Reporter - Renders engine events for the terminal
//!
//! Consumes the progress channel one event at a time, so output keeps pace
//! with the run rather than the other way round.

use std::io::Write;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::engine::{FileState, RepoFileStatus};
use crate::error::{GinError, Result};

/// Output format selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Human,
    Json,
}

impl OutputFormat {
    pub fn from_json_flag(json: bool) -> Self {
        if json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        }
    }
}

/// What the reporter saw on a drained channel
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportSummary {
    pub events: usize,
    /// Files that ended in `Failed`, with their error text
    pub failures: Vec<(String, String)>,
}

impl ReportSummary {
    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// Writes progress events to `out` as they arrive
pub struct ProgressReporter<W: Write> {
    out: W,
    format: OutputFormat,
}

impl<W: Write> ProgressReporter<W> {
    pub fn new(out: W, format: OutputFormat) -> Self {
        Self { out, format }
    }

    /// Render events until the channel closes
    pub async fn drain(&mut self, rx: &mut UnboundedReceiver<RepoFileStatus>) -> Result<ReportSummary> {
        let mut summary = ReportSummary::default();

        while let Some(event) = rx.recv().await {
            summary.events += 1;
            if event.state == FileState::Failed {
                summary.failures.push((
                    event.file_name.clone(),
                    event.err.clone().unwrap_or_default(),
                ));
            }
            self.report(&event)?;
        }

        if self.format == OutputFormat::Human && summary.has_failures() {
            writeln!(self.out, "\n\u{2717} {} file(s) failed:", summary.failures.len())
                .map_err(write_error)?;
            for (file, err) in &summary.failures {
                writeln!(self.out, "   {}: {}", file, err).map_err(write_error)?;
            }
        }
        self.out.flush().map_err(write_error)?;

        Ok(summary)
    }

    /// Render a single event
    pub fn report(&mut self, event: &RepoFileStatus) -> Result<()> {
        match self.format {
            OutputFormat::Json => {
                let line = serde_json::to_string(event).map_err(|e| {
                    GinError::io(
                        "Failed to encode progress event",
                        std::io::Error::new(std::io::ErrorKind::InvalidData, e),
                    )
                })?;
                writeln!(self.out, "{}", line).map_err(write_error)
            }
            OutputFormat::Human => {
                let line = human_line(event);
                writeln!(self.out, "{}", line).map_err(write_error)
            }
        }
    }
}

fn human_line(event: &RepoFileStatus) -> String {
    let mut line = match event.state {
        FileState::Summary => format!("\u{2713} {}: ", event.file_name),
        FileState::Failed => format!("{:>11}  {}", "\u{2717} failed", event.file_name),
        FileState::Done => format!("{:>11}  {}", "\u{2713} done", event.file_name),
        state => format!("{:>11}  {}", state, event.file_name),
    };

    match (&event.detail, &event.err) {
        (_, Some(err)) => line.push_str(&format!(" ({})", err)),
        (Some(detail), None) if event.state == FileState::Summary => line.push_str(detail),
        (Some(detail), None) => line.push_str(&format!(" [{}]", detail)),
        (None, None) => {}
    }
    line
}

fn write_error(e: std::io::Error) -> GinError {
    GinError::io("Failed to write progress output", e)
}
