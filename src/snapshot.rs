use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, info, warn};

use crate::config::SnapshotPolicy;
use crate::domain::SnapshotDate;
use crate::error::RdmError;
use crate::fs_util;
use crate::store::STAGING_DIR_NAME;

/// Dated backups of one source: `backup_dir/<YYYY-MM-DD>/`.
#[derive(Debug, Clone)]
pub struct SnapshotManager {
    backup_dir: Utf8PathBuf,
    policy: SnapshotPolicy,
}

impl SnapshotManager {
    pub fn new(backup_dir: Utf8PathBuf, policy: SnapshotPolicy) -> Self {
        Self { backup_dir, policy }
    }

    pub fn backup_dir(&self) -> &Utf8Path {
        &self.backup_dir
    }

    /// Builds the snapshot for `day` from files under `from`. With
    /// `ManifestOnly` only `artifacts` (paths relative to `from`) are copied;
    /// `FullCopy` copies the whole tree. A snapshot already present for the
    /// same day is replaced, never merged.
    pub fn create_snapshot(
        &self,
        day: SnapshotDate,
        from: &Utf8Path,
        artifacts: &[String],
    ) -> Result<Utf8PathBuf, RdmError> {
        let pending = self.stage_snapshot(day, from, artifacts)?;
        let path = pending.path().to_path_buf();
        pending.commit();
        Ok(path)
    }

    /// Like [`create_snapshot`](Self::create_snapshot), but a replaced
    /// same-day snapshot is only parked. [`PendingSnapshot::commit`] deletes
    /// it; rolling back (or dropping) restores it.
    ///
    /// Content is assembled in a sibling temporary directory first, so a
    /// failed copy leaves the previous snapshot for that day in place.
    pub fn stage_snapshot(
        &self,
        day: SnapshotDate,
        from: &Utf8Path,
        artifacts: &[String],
    ) -> Result<PendingSnapshot, RdmError> {
        fs::create_dir_all(self.backup_dir.as_std_path())
            .map_err(|err| RdmError::BackupCreate(format!("{}: {err}", self.backup_dir)))?;
        let target = self.backup_dir.join(day.to_string());

        let temp_dir = tempfile::Builder::new()
            .prefix(".kira-rdm-snapshot")
            .tempdir_in(self.backup_dir.as_std_path())
            .map_err(|err| RdmError::BackupCreate(err.to_string()))?;
        let temp_path = Utf8PathBuf::from_path_buf(temp_dir.path().to_path_buf())
            .map_err(|_| RdmError::BackupCreate("non-utf8 temp dir".to_string()))?;

        match self.policy {
            SnapshotPolicy::FullCopy => {
                fs_util::copy_dir_recursive(from, &temp_path, &[STAGING_DIR_NAME])
                    .map_err(|err| RdmError::BackupCreate(err.to_string()))?;
            }
            SnapshotPolicy::ManifestOnly => {
                for artifact in artifacts {
                    let origin = from.join(artifact);
                    if !origin.is_file() {
                        warn!(artifact = %origin, "provenance artifact missing; not backed up");
                        continue;
                    }
                    fs_util::copy_file_atomic(&origin, &temp_path.join(artifact))
                        .map_err(|err| RdmError::BackupCreate(err.to_string()))?;
                }
            }
        }

        let previous = if target.is_dir() {
            let parked = self.backup_dir.join(format!(".{day}.previous"));
            fs_util::remove_dir_if_exists(&parked)
                .map_err(|err| RdmError::BackupCreate(err.to_string()))?;
            fs::rename(target.as_std_path(), parked.as_std_path())
                .map_err(|err| RdmError::BackupCreate(format!("park {target}: {err}")))?;
            debug!(snapshot = %target, "parked same-day snapshot");
            Some(parked)
        } else {
            None
        };

        let pending = PendingSnapshot {
            path: target,
            previous,
            settled: false,
        };
        fs::rename(temp_path.as_std_path(), pending.path.as_std_path())
            .map_err(|err| RdmError::BackupCreate(format!("{}: {err}", pending.path)))?;
        info!(snapshot = %pending.path, "snapshot created");
        Ok(pending)
    }

    pub fn resolve_snapshot(&self, requested: &str) -> Result<Utf8PathBuf, RdmError> {
        resolve_snapshot(&self.backup_dir, requested)
    }

    /// Valid snapshot dates, oldest first.
    pub fn list(&self) -> Result<Vec<SnapshotDate>, RdmError> {
        if !self.backup_dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut dates: Vec<SnapshotDate> = snapshot_dirs(&self.backup_dir)?
            .into_iter()
            .map(|(date, _)| date)
            .collect();
        dates.sort();
        Ok(dates)
    }
}

/// A snapshot written by [`SnapshotManager::stage_snapshot`] that may still
/// be withdrawn. Dropping it unsettled rolls it back.
#[derive(Debug)]
pub struct PendingSnapshot {
    path: Utf8PathBuf,
    previous: Option<Utf8PathBuf>,
    settled: bool,
}

impl PendingSnapshot {
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Keeps the new snapshot and deletes the one it replaced.
    pub fn commit(mut self) {
        self.settled = true;
        if let Some(previous) = &self.previous {
            if let Err(err) = fs_util::remove_dir_if_exists(previous) {
                warn!(snapshot = %previous, error = %err, "failed to delete replaced snapshot");
            }
        }
    }

    /// Removes the new snapshot and puts back the one it replaced.
    pub fn rollback(mut self) {
        self.undo();
    }

    fn undo(&mut self) {
        self.settled = true;
        if let Err(err) = fs_util::remove_dir_if_exists(&self.path) {
            warn!(snapshot = %self.path, error = %err, "failed to remove withdrawn snapshot");
            return;
        }
        if let Some(previous) = &self.previous {
            if let Err(err) = fs::rename(previous.as_std_path(), self.path.as_std_path()) {
                warn!(snapshot = %self.path, error = %err, "failed to restore replaced snapshot");
            }
        }
    }
}

impl Drop for PendingSnapshot {
    fn drop(&mut self) {
        if !self.settled {
            self.undo();
        }
    }
}

/// Picks the snapshot dated closest to, but not after, `requested`.
pub fn resolve_snapshot(backup_root: &Utf8Path, requested: &str) -> Result<Utf8PathBuf, RdmError> {
    let requested_date: SnapshotDate = requested.parse()?;
    let candidates = if backup_root.is_dir() {
        snapshot_dirs(backup_root)?
    } else {
        Vec::new()
    };

    let (_, path) = candidates
        .into_iter()
        .filter_map(|(date, path)| {
            let gap = requested_date.days_since(&date);
            (gap >= 0).then_some((gap, path))
        })
        .min_by_key(|(gap, _)| *gap)
        .ok_or_else(|| RdmError::SnapshotNotFound(requested.to_string()))?;

    if fs_util::is_empty_dir(&path)? {
        return Err(RdmError::SnapshotEmpty(path.into_std_path_buf()));
    }
    debug!(requested, snapshot = %path, "resolved snapshot");
    Ok(path)
}

fn snapshot_dirs(root: &Utf8Path) -> Result<Vec<(SnapshotDate, Utf8PathBuf)>, RdmError> {
    let entries = root
        .read_dir_utf8()
        .map_err(|err| RdmError::Filesystem(format!("read {root}: {err}")))?;
    let mut dirs = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| RdmError::Filesystem(err.to_string()))?;
        if !entry.path().is_dir() {
            continue;
        }
        if let Ok(date) = entry.file_name().parse::<SnapshotDate>() {
            dirs.push((date, entry.into_path()));
        }
    }
    Ok(dirs)
}
