//! Provenance record written next to every promoted dataset.

use std::time::Duration;

use camino::Utf8Path;
use chrono::NaiveDateTime;

use crate::error::RdmError;
use crate::fs_util;

const HEADER: &str =
    "About: this is an automatically generated description file for the data located in this folder.";
const DOWNLOADED_ON: &str = "Downloaded on: ";
const DOWNLOADED_FROM: &str = "Downloaded from: ";
const DOWNLOAD_TIME: &str = "Download time: ";
const SUCCEEDED_HEADING: &str = "List of downloaded files:";
const FAILED_HEADING: &str = "List of files that failed to be downloaded:";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Header,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub comment: String,
    pub downloaded_on: NaiveDateTime,
    pub source: String,
    pub elapsed: Duration,
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
}

impl Manifest {
    pub fn render(&self) -> String {
        let mut lines = vec![HEADER.to_string()];
        let comment = self.comment.trim();
        if !comment.is_empty() {
            lines.push(comment.to_string());
        }
        lines.push(format!(
            "{DOWNLOADED_ON}{}",
            self.downloaded_on.format(TIMESTAMP_FORMAT)
        ));
        lines.push(format!("{DOWNLOADED_FROM}{}", self.source));
        lines.push(format!("{DOWNLOAD_TIME}{}", format_elapsed(self.elapsed)));
        lines.push(SUCCEEDED_HEADING.to_string());
        lines.extend(self.succeeded.iter().cloned());
        if !self.failed.is_empty() {
            lines.push(FAILED_HEADING.to_string());
            lines.extend(self.failed.iter().cloned());
        }
        let mut text = lines.join("\n");
        text.push('\n');
        text
    }

    pub fn parse(text: &str) -> Result<Self, RdmError> {
        let mut lines = text.lines();
        if lines.next().map(str::trim) != Some(HEADER) {
            return Err(RdmError::ManifestParse("missing header line".to_string()));
        }

        let mut comment = Vec::new();
        let mut downloaded_on = None;
        let mut source = None;
        let mut elapsed = None;
        let mut succeeded = Vec::new();
        let mut failed = Vec::new();
        let mut section = Section::Header;

        for line in lines {
            let line = line.trim_end();
            if line == SUCCEEDED_HEADING {
                section = Section::Succeeded;
            } else if line == FAILED_HEADING {
                section = Section::Failed;
            } else if section != Section::Header {
                if !line.trim().is_empty() {
                    let list = match section {
                        Section::Failed => &mut failed,
                        _ => &mut succeeded,
                    };
                    list.push(line.trim().to_string());
                }
            } else if let Some(value) = line.strip_prefix(DOWNLOADED_ON) {
                downloaded_on = Some(
                    NaiveDateTime::parse_from_str(value.trim(), TIMESTAMP_FORMAT)
                        .map_err(|err| RdmError::ManifestParse(format!("{value}: {err}")))?,
                );
            } else if let Some(value) = line.strip_prefix(DOWNLOADED_FROM) {
                source = Some(value.trim().to_string());
            } else if let Some(value) = line.strip_prefix(DOWNLOAD_TIME) {
                elapsed = Some(parse_elapsed(value.trim())?);
            } else if !line.is_empty() {
                comment.push(line.to_string());
            }
        }

        Ok(Self {
            comment: comment.join("\n"),
            downloaded_on: downloaded_on
                .ok_or_else(|| RdmError::ManifestParse("missing download date".to_string()))?,
            source: source
                .ok_or_else(|| RdmError::ManifestParse("missing source address".to_string()))?,
            elapsed: elapsed.unwrap_or_default(),
            succeeded,
            failed,
        })
    }
}

/// Writes `manifest` to `destination`, replacing any previous file.
pub fn write_manifest(destination: &Utf8Path, manifest: &Manifest) -> Result<(), RdmError> {
    fs_util::write_bytes_atomic(destination, manifest.render().as_bytes())
}

pub fn read_manifest(path: &Utf8Path) -> Result<Manifest, RdmError> {
    let text = std::fs::read_to_string(path.as_std_path())
        .map_err(|err| RdmError::ManifestParse(format!("{path}: {err}")))?;
    Manifest::parse(&text)
}

/// `H:MM:SS`, hours unbounded.
fn format_elapsed(elapsed: Duration) -> String {
    let total = elapsed.as_secs();
    format!("{}:{:02}:{:02}", total / 3600, (total / 60) % 60, total % 60)
}

fn parse_elapsed(value: &str) -> Result<Duration, RdmError> {
    let parts: Vec<&str> = value.split(':').collect();
    let [hours, minutes, seconds] = parts.as_slice() else {
        return Err(RdmError::ManifestParse(format!("bad duration: {value}")));
    };
    let number = |part: &str| {
        part.parse::<u64>()
            .map_err(|_| RdmError::ManifestParse(format!("bad duration: {value}")))
    };
    Ok(Duration::from_secs(
        number(*hours)? * 3600 + number(*minutes)? * 60 + number(*seconds)?,
    ))
}
