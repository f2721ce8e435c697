use std::io::{self, Write};

use serde::Serialize;

use crate::pipeline::{ProgressEvent, ProgressSink, RestoreReport, UpdateReport};

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateOutcome {
    pub source: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<UpdateReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateSummary {
    pub updates: Vec<UpdateOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotList {
    pub source: String,
    pub backup_dir: String,
    pub snapshots: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub live_root: String,
    pub backup_root: String,
    pub sources: Vec<String>,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_update(result: &UpdateSummary) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_restore(result: &RestoreReport) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_snapshots(result: &SnapshotList) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_check(result: &CheckResult) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

/// Human readable output; progress goes to stderr so stdout stays clean.
pub struct TextOutput;

impl TextOutput {
    pub fn print_update(result: &UpdateSummary) -> io::Result<()> {
        let mut stdout = io::stdout();
        for outcome in &result.updates {
            match (&outcome.report, &outcome.error) {
                (Some(report), _) => {
                    writeln!(
                        stdout,
                        "{}: updated {} items ({} failed) in {:.1}s",
                        outcome.source,
                        report.succeeded.len(),
                        report.failed.len(),
                        report.elapsed_seconds
                    )?;
                    writeln!(stdout, "  live:     {}", report.live_dir)?;
                    writeln!(stdout, "  snapshot: {}", report.snapshot)?;
                    for name in &report.failed {
                        writeln!(stdout, "  failed optional item: {name}")?;
                    }
                    if !report.manifest_written {
                        writeln!(stdout, "  warning: manifest was not written")?;
                    }
                }
                (None, error) => {
                    writeln!(
                        stdout,
                        "{}: update failed: {}",
                        outcome.source,
                        error.as_deref().unwrap_or("unknown error")
                    )?;
                }
            }
        }
        Ok(())
    }

    pub fn print_restore(result: &RestoreReport) -> io::Result<()> {
        let mut stdout = io::stdout();
        writeln!(
            stdout,
            "{}: restored {} into {}",
            result.source, result.snapshot, result.destination
        )?;
        if !result.refetched.is_empty() {
            writeln!(stdout, "  refetched {} items", result.refetched.len())?;
        }
        Ok(())
    }

    pub fn print_snapshots(result: &SnapshotList) -> io::Result<()> {
        let mut stdout = io::stdout();
        if result.snapshots.is_empty() {
            writeln!(stdout, "{}: no snapshots in {}", result.source, result.backup_dir)?;
            return Ok(());
        }
        for date in &result.snapshots {
            writeln!(stdout, "{date}")?;
        }
        Ok(())
    }

    pub fn print_check(result: &CheckResult) -> io::Result<()> {
        let mut stdout = io::stdout();
        writeln!(stdout, "config ok")?;
        writeln!(stdout, "  live root:   {}", result.live_root)?;
        writeln!(stdout, "  backup root: {}", result.backup_root)?;
        writeln!(stdout, "  sources:     {}", result.sources.join(", "))?;
        Ok(())
    }
}

impl ProgressSink for TextOutput {
    fn event(&self, event: ProgressEvent) {
        let mut stderr = io::stderr();
        let _ = match event.elapsed {
            Some(elapsed) => writeln!(
                stderr,
                "{} ({:.1}s)",
                event.message,
                elapsed.as_secs_f64()
            ),
            None => writeln!(stderr, "{}", event.message),
        };
    }
}
