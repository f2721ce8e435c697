use std::fs;

use camino::{Utf8Path, Utf8PathBuf};

use crate::config::ResolvedConfig;
use crate::domain::{DataSource, SnapshotDate};
use crate::error::RdmError;

/// Name of the scratch directory created inside a source's live directory.
pub const STAGING_DIR_NAME: &str = "temp";

/// Filesystem layout shared by every operation:
/// `live_root/<destination>/...`, `live_root/<destination>/temp/...` while
/// staging, and `backup_root/<destination>/<YYYY-MM-DD>/...`.
#[derive(Debug, Clone)]
pub struct Store {
    live_root: Utf8PathBuf,
    backup_root: Utf8PathBuf,
}

impl Store {
    pub fn from_config(config: &ResolvedConfig) -> Self {
        Self::new_with_paths(config.live_root.clone(), config.backup_root.clone())
    }

    pub fn new_with_paths(live_root: Utf8PathBuf, backup_root: Utf8PathBuf) -> Self {
        Self {
            live_root,
            backup_root,
        }
    }

    pub fn live_root(&self) -> &Utf8Path {
        &self.live_root
    }

    pub fn backup_root(&self) -> &Utf8Path {
        &self.backup_root
    }

    pub fn live_dir(&self, source: &DataSource) -> Utf8PathBuf {
        self.live_root.join(&source.destination)
    }

    pub fn staging_dir(&self, source: &DataSource) -> Utf8PathBuf {
        self.live_dir(source).join(STAGING_DIR_NAME)
    }

    pub fn backup_dir(&self, source: &DataSource) -> Utf8PathBuf {
        self.backup_root.join(&source.destination)
    }

    pub fn snapshot_dir(&self, source: &DataSource, date: SnapshotDate) -> Utf8PathBuf {
        self.backup_dir(source).join(date.to_string())
    }

    pub fn ensure_live_dir(&self, source: &DataSource) -> Result<Utf8PathBuf, RdmError> {
        let dir = self.live_dir(source);
        fs::create_dir_all(dir.as_std_path())
            .map_err(|err| RdmError::StagingCreate(format!("{dir}: {err}")))?;
        Ok(dir)
    }

    pub fn ensure_backup_dir(&self, source: &DataSource) -> Result<Utf8PathBuf, RdmError> {
        let dir = self.backup_dir(source);
        fs::create_dir_all(dir.as_std_path())
            .map_err(|err| RdmError::BackupCreate(format!("{dir}: {err}")))?;
        Ok(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths() {
        let store = Store::new_with_paths(
            Utf8PathBuf::from("/data/reference"),
            Utf8PathBuf::from("/data/backup"),
        );
        let mut source = DataSource::new("taxonomy", "https://example.org", Vec::new());
        source.destination = "ncbi/taxonomy".to_string();
        let date: SnapshotDate = "2024-01-10".parse().unwrap();

        assert_eq!(store.live_dir(&source), "/data/reference/ncbi/taxonomy");
        assert_eq!(
            store.staging_dir(&source),
            "/data/reference/ncbi/taxonomy/temp"
        );
        assert_eq!(
            store.snapshot_dir(&source, date),
            "/data/backup/ncbi/taxonomy/2024-01-10"
        );
    }
}
