use std::fmt;
use std::str::FromStr;

use camino::{Utf8Component, Utf8Path};
use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::RdmError;
use crate::store::STAGING_DIR_NAME;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub login_url: Option<String>,
}

/// Where the expected digest of an item comes from.
///
/// `None` is an explicit trust boundary: items of such a source are accepted
/// on a successful transfer alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumConvention {
    None,
    /// One sidecar per item, named `<item><suffix>`.
    Sidecar(String),
    /// One consolidated `digest  name` listing for the whole source.
    Listing(String),
}

impl Default for ChecksumConvention {
    fn default() -> Self {
        ChecksumConvention::Sidecar(".md5".to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestoreMode {
    #[default]
    ArtifactsOnly,
    Refetch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemSpec {
    pub name: String,
    pub target: String,
    pub required: bool,
}

impl ItemSpec {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            target: name.clone(),
            name,
            required: true,
        }
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }
}

#[derive(Debug, Clone)]
pub enum ItemEnumeration {
    Explicit(Vec<ItemSpec>),
    Listing {
        pattern: Regex,
        expected_count: Option<usize>,
    },
}

#[derive(Debug, Clone)]
pub struct DataSource {
    pub name: String,
    pub base_url: String,
    pub destination: String,
    pub credentials: Option<Credentials>,
    pub items: ItemEnumeration,
    pub checksum: ChecksumConvention,
    pub provenance: Vec<String>,
    pub comment: String,
    pub unpack: bool,
    pub restore: RestoreMode,
}

impl DataSource {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, items: Vec<ItemSpec>) -> Self {
        let name = name.into();
        Self {
            destination: name.clone(),
            name,
            base_url: base_url.into(),
            credentials: None,
            items: ItemEnumeration::Explicit(items),
            checksum: ChecksumConvention::default(),
            provenance: Vec::new(),
            comment: String::new(),
            unpack: false,
            restore: RestoreMode::default(),
        }
    }

    pub fn with_checksum(mut self, checksum: ChecksumConvention) -> Self {
        self.checksum = checksum;
        self
    }

    pub fn with_provenance(mut self, provenance: Vec<String>) -> Self {
        self.provenance = provenance;
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }

    pub fn trusts_unverified(&self) -> bool {
        matches!(self.checksum, ChecksumConvention::None)
    }

    pub fn remote_url(&self, name: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            name.trim_start_matches('/')
        )
    }

    /// Builds the transfer items for this source from an already discovered
    /// listing, or from the explicit item list when `discovered` is `None`.
    pub fn transfer_items(&self, discovered: Option<Vec<String>>) -> Vec<TransferItem> {
        let mut items = match (&self.items, discovered) {
            (ItemEnumeration::Explicit(specs), _) => {
                specs.iter().map(TransferItem::from_spec).collect::<Vec<_>>()
            }
            (ItemEnumeration::Listing { .. }, Some(names)) => names
                .into_iter()
                .map(|name| TransferItem::from_spec(&ItemSpec::new(name)))
                .collect(),
            (ItemEnumeration::Listing { .. }, None) => Vec::new(),
        };
        for name in &self.provenance {
            if !items.iter().any(|item| &item.remote == name) {
                let mut item = TransferItem::from_spec(&ItemSpec::new(name.clone()));
                item.checksummed = false;
                items.push(item);
            }
        }
        items
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransferStatus {
    Pending,
    InProgress,
    Verified,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferItem {
    pub remote: String,
    pub target: String,
    pub required: bool,
    pub expected_digest: Option<String>,
    /// Provider reference files carry no checksum of their own and are
    /// accepted on transfer alone.
    pub checksummed: bool,
    pub status: TransferStatus,
}

impl TransferItem {
    pub fn from_spec(spec: &ItemSpec) -> Self {
        Self {
            remote: spec.name.clone(),
            target: spec.target.clone(),
            required: spec.required,
            expected_digest: None,
            checksummed: true,
            status: TransferStatus::Pending,
        }
    }
}

/// Rejects targets that would land outside the staging area.
pub fn validate_target(target: &str) -> Result<(), RdmError> {
    let path = Utf8Path::new(target);
    let escapes = path.is_absolute()
        || path
            .components()
            .any(|component| !matches!(component, Utf8Component::Normal(_)));
    if target.trim().is_empty() || escapes {
        return Err(RdmError::InvalidSource(format!(
            "item target must be a relative path: {target}"
        )));
    }
    Ok(())
}

/// Checks an item target against the names the engine writes into the
/// staging area itself: the `temp` directory and the manifest file.
pub fn validate_item_target(target: &str, manifest_file: Option<&str>) -> Result<(), RdmError> {
    validate_target(target)?;
    let path = Utf8Path::new(target);
    if path.starts_with(STAGING_DIR_NAME) {
        return Err(RdmError::InvalidSource(format!(
            "item target uses the reserved staging name {STAGING_DIR_NAME}: {target}"
        )));
    }
    if let Some(manifest) = manifest_file.map(Utf8Path::new) {
        if path.starts_with(manifest) || manifest.starts_with(path) {
            return Err(RdmError::InvalidSource(format!(
                "item target collides with the manifest file {manifest}: {target}"
            )));
        }
    }
    Ok(())
}

/// A calendar day in strict `YYYY-MM-DD` form, as used for snapshot names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SnapshotDate(NaiveDate);

impl SnapshotDate {
    pub fn new(date: NaiveDate) -> Self {
        Self(date)
    }

    pub fn today() -> Self {
        Self(chrono::Local::now().date_naive())
    }

    pub fn date(&self) -> NaiveDate {
        self.0
    }

    /// Whole days from `earlier` to `self`; negative when `earlier` is later.
    pub fn days_since(&self, earlier: &SnapshotDate) -> i64 {
        self.0.signed_duration_since(earlier.0).num_days()
    }
}

impl fmt::Display for SnapshotDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d"))
    }
}

impl FromStr for SnapshotDate {
    type Err = RdmError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let shape_ok = value.len() == 10
            && value.char_indices().all(|(idx, ch)| match idx {
                4 | 7 => ch == '-',
                _ => ch.is_ascii_digit(),
            });
        if !shape_ok {
            return Err(RdmError::InvalidDate(value.to_string()));
        }
        NaiveDate::parse_from_str(value, "%Y-%m-%d")
            .map(Self)
            .map_err(|_| RdmError::InvalidDate(value.to_string()))
    }
}
