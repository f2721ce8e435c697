use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use directories::BaseDirs;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::domain::{
    ChecksumConvention, Credentials, DataSource, ItemEnumeration, ItemSpec, RestoreMode,
    validate_item_target, validate_target,
};
use crate::error::RdmError;
use crate::store::STAGING_DIR_NAME;

pub const DEFAULT_CONFIG_FILE: &str = "kira-rdm.json";
pub const DEFAULT_MANIFEST_FILE: &str = "MANIFEST.txt";

#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    pub live_root: String,
    pub backup_root: String,
    #[serde(default)]
    pub manifest_file: Option<String>,
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub timeouts: Option<Timeouts>,
    #[serde(default)]
    pub snapshot_policy: Option<SnapshotPolicy>,
    #[serde(default)]
    pub file_mode: Option<String>,
    #[serde(default)]
    pub folder_mode: Option<String>,
    #[serde(default)]
    pub sources: Vec<SourceEntry>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SourceEntry {
    pub name: String,
    pub base_url: String,
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default)]
    pub credentials: Option<Credentials>,
    #[serde(default)]
    pub items: Vec<ItemEntry>,
    #[serde(default)]
    pub listing: Option<ListingEntry>,
    #[serde(default)]
    pub checksum: Option<ChecksumConvention>,
    #[serde(default)]
    pub provenance: Vec<String>,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub unpack: bool,
    #[serde(default)]
    pub restore: Option<RestoreMode>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ItemEntry {
    Shorthand(String),
    Detailed(ItemEntryObject),
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ItemEntryObject {
    pub name: String,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub required: Option<bool>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ListingEntry {
    pub pattern: String,
    #[serde(default)]
    pub expected_count: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    #[default]
    Fixed,
    Incremental,
}

/// Bounds applied uniformly to connection establishment and per-item
/// transfer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_connection_attempts: u32,
    pub max_transfer_attempts: u32,
    pub backoff_delay_seconds: f64,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_connection_attempts: 3,
            max_transfer_attempts: 3,
            backoff_delay_seconds: 5.0,
            backoff: Backoff::Fixed,
        }
    }
}

impl RetryPolicy {
    /// A policy that never sleeps between attempts.
    pub fn immediate(max_transfer_attempts: u32) -> Self {
        Self {
            max_connection_attempts: 1,
            max_transfer_attempts,
            backoff_delay_seconds: 0.0,
            backoff: Backoff::Fixed,
        }
    }

    /// Pause after the given 1-based failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.backoff_delay_seconds;
        if !base.is_finite() || base <= 0.0 {
            return Duration::ZERO;
        }
        let seconds = match self.backoff {
            Backoff::Fixed => base,
            Backoff::Incremental => base * f64::from(attempt.max(1)),
        };
        Duration::from_secs_f64(seconds)
    }

    fn validate(&self) -> Result<(), RdmError> {
        if self.max_connection_attempts == 0 || self.max_transfer_attempts == 0 {
            return Err(RdmError::InvalidConfig(
                "retry attempts must be at least 1".to_string(),
            ));
        }
        if !self.backoff_delay_seconds.is_finite() || self.backoff_delay_seconds < 0.0 {
            return Err(RdmError::InvalidConfig(format!(
                "invalid backoff_delay_seconds: {}",
                self.backoff_delay_seconds
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub connect_seconds: u64,
    pub read_seconds: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect_seconds: 30,
            read_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SnapshotPolicy {
    #[default]
    ManifestOnly,
    FullCopy,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub live_root: Utf8PathBuf,
    pub backup_root: Utf8PathBuf,
    pub manifest_file: String,
    pub workers: usize,
    pub retry: RetryPolicy,
    pub timeouts: Timeouts,
    pub snapshot_policy: SnapshotPolicy,
    pub file_mode: Option<u32>,
    pub folder_mode: Option<u32>,
    pub sources: Vec<DataSource>,
}

impl ResolvedConfig {
    pub fn source(&self, name: &str) -> Result<&DataSource, RdmError> {
        self.sources
            .iter()
            .find(|source| source.name == name)
            .ok_or_else(|| RdmError::UnknownSource(name.to_string()))
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, RdmError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => Self::default_path().ok_or(RdmError::MissingConfig)?,
        };

        let content = fs::read_to_string(&config_path)
            .map_err(|_| RdmError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| RdmError::ConfigParse(err.to_string()))?;

        let absolute = std::path::absolute(&config_path)
            .map_err(|err| RdmError::Filesystem(err.to_string()))?;
        let base = absolute
            .parent()
            .map(|parent| parent.to_path_buf())
            .unwrap_or_default();
        let base = Utf8PathBuf::from_path_buf(base)
            .map_err(|_| RdmError::Filesystem("non-utf8 config path".to_string()))?;

        Self::resolve_config(config, &base)
    }

    fn default_path() -> Option<PathBuf> {
        let local = PathBuf::from(DEFAULT_CONFIG_FILE);
        if local.exists() {
            return Some(local);
        }
        BaseDirs::new()
            .map(|dirs| dirs.config_dir().join("kira-rdm").join(DEFAULT_CONFIG_FILE))
            .filter(|path| path.exists())
    }

    /// Resolves relative roots against `base`, normally the directory that
    /// holds the config file.
    pub fn resolve_config(config: Config, base: &Utf8Path) -> Result<ResolvedConfig, RdmError> {
        let schema_version = config.schema_version.unwrap_or(1);
        if schema_version != 1 {
            return Err(RdmError::InvalidConfig(format!(
                "unsupported schema_version {schema_version}"
            )));
        }

        let retry = config.retry.unwrap_or_default();
        retry.validate()?;

        let manifest_file = config
            .manifest_file
            .unwrap_or_else(|| DEFAULT_MANIFEST_FILE.to_string());
        if validate_target(&manifest_file).is_err()
            || Utf8Path::new(&manifest_file).starts_with(STAGING_DIR_NAME)
        {
            return Err(RdmError::InvalidConfig(format!(
                "invalid manifest_file: {manifest_file}"
            )));
        }

        let mut seen = HashSet::new();
        let sources = config
            .sources
            .into_iter()
            .map(|entry| {
                if !seen.insert(entry.name.clone()) {
                    return Err(RdmError::InvalidConfig(format!(
                        "duplicate source name: {}",
                        entry.name
                    )));
                }
                resolve_source(entry, base, &manifest_file)
            })
            .collect::<Result<Vec<_>, RdmError>>()?;

        Ok(ResolvedConfig {
            schema_version,
            live_root: absolutize(base, &config.live_root),
            backup_root: absolutize(base, &config.backup_root),
            manifest_file,
            workers: config.workers.unwrap_or(1).max(1),
            retry,
            timeouts: config.timeouts.unwrap_or_default(),
            snapshot_policy: config.snapshot_policy.unwrap_or_default(),
            file_mode: config.file_mode.as_deref().map(parse_mode).transpose()?,
            folder_mode: config.folder_mode.as_deref().map(parse_mode).transpose()?,
            sources,
        })
    }
}

fn resolve_source(
    entry: SourceEntry,
    base: &Utf8Path,
    manifest_file: &str,
) -> Result<DataSource, RdmError> {
    let items = match (entry.listing, entry.items.is_empty()) {
        (Some(listing), true) => {
            let pattern = Regex::new(&listing.pattern).map_err(|err| {
                RdmError::InvalidConfig(format!("source {}: {err}", entry.name))
            })?;
            ItemEnumeration::Listing {
                pattern,
                expected_count: listing.expected_count,
            }
        }
        (Some(_), false) => {
            return Err(RdmError::InvalidConfig(format!(
                "source {} declares both items and listing",
                entry.name
            )));
        }
        (None, true) => {
            return Err(RdmError::InvalidConfig(format!(
                "source {} declares no items",
                entry.name
            )));
        }
        (None, false) => ItemEnumeration::Explicit(
            entry
                .items
                .into_iter()
                .map(|item| match item {
                    ItemEntry::Shorthand(name) => ItemSpec::new(name),
                    ItemEntry::Detailed(obj) => ItemSpec {
                        target: obj.target.unwrap_or_else(|| obj.name.clone()),
                        name: obj.name,
                        required: obj.required.unwrap_or(true),
                    },
                })
                .collect(),
        ),
    };

    if let ItemEnumeration::Explicit(specs) = &items {
        for spec in specs {
            validate_item_target(&spec.target, Some(manifest_file))?;
        }
    }
    for name in &entry.provenance {
        validate_item_target(name, Some(manifest_file))?;
    }
    let destination = entry.destination.unwrap_or_else(|| entry.name.clone());
    validate_target(&destination)?;

    // Bare mirror paths are relative to the config file like the roots.
    let base_url = if entry.base_url.contains("://") {
        entry.base_url
    } else {
        absolutize(base, &entry.base_url).to_string()
    };

    Ok(DataSource {
        name: entry.name,
        base_url,
        destination,
        credentials: entry.credentials,
        items,
        checksum: entry.checksum.unwrap_or_default(),
        provenance: entry.provenance,
        comment: entry.comment.unwrap_or_default(),
        unpack: entry.unpack,
        restore: entry.restore.unwrap_or_default(),
    })
}

fn absolutize(base: &Utf8Path, value: &str) -> Utf8PathBuf {
    let path = Utf8Path::new(value);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

pub fn parse_mode(value: &str) -> Result<u32, RdmError> {
    u32::from_str_radix(value.trim().trim_start_matches("0o"), 8)
        .ok()
        .filter(|mode| *mode <= 0o7777)
        .ok_or_else(|| RdmError::InvalidConfig(format!("invalid permission mode: {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incremental_backoff_grows_per_attempt() {
        let policy = RetryPolicy {
            backoff_delay_seconds: 2.0,
            backoff: Backoff::Incremental,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(6));
        assert_eq!(RetryPolicy::immediate(3).delay_for(2), Duration::ZERO);
    }

    #[test]
    fn parse_octal_modes() {
        assert_eq!(parse_mode("755").unwrap(), 0o755);
        assert_eq!(parse_mode("0o644").unwrap(), 0o644);
        assert!(parse_mode("9").is_err());
    }
}
