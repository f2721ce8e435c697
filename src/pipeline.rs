use std::fs;
use std::time::{Duration, Instant};

use camino::Utf8Path;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::{DEFAULT_MANIFEST_FILE, ResolvedConfig, RetryPolicy, SnapshotPolicy};
use crate::domain::{
    DataSource, ItemEnumeration, ItemSpec, RestoreMode, SnapshotDate, TransferItem,
    validate_item_target,
};
use crate::error::RdmError;
use crate::fetcher::CancelToken;
use crate::fs_util;
use crate::manifest::{self, Manifest};
use crate::snapshot::{self, SnapshotManager};
use crate::staging::{StagingCoordinator, StagingOptions};
use crate::store::Store;
use crate::transfer::TransferClient;

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub retry: RetryPolicy,
    pub workers: usize,
    pub snapshot_policy: SnapshotPolicy,
    pub manifest_file: String,
    pub file_mode: Option<u32>,
    pub folder_mode: Option<u32>,
}

impl PipelineSettings {
    pub fn from_config(config: &ResolvedConfig) -> Self {
        Self {
            retry: config.retry,
            workers: config.workers,
            snapshot_policy: config.snapshot_policy,
            manifest_file: config.manifest_file.clone(),
            file_mode: config.file_mode,
            folder_mode: config.folder_mode,
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            workers: 1,
            snapshot_policy: SnapshotPolicy::default(),
            manifest_file: DEFAULT_MANIFEST_FILE.to_string(),
            file_mode: None,
            folder_mode: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateReport {
    pub source: String,
    pub live_dir: String,
    pub snapshot: String,
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
    pub unverified: Vec<String>,
    pub bytes_written: u64,
    pub manifest_written: bool,
    pub elapsed_seconds: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    pub source: String,
    pub requested: String,
    pub snapshot: String,
    pub destination: String,
    pub refetched: Vec<String>,
}

/// Update and restore for one data source.
pub struct Pipeline<C: TransferClient> {
    source: DataSource,
    store: Store,
    client: C,
    settings: PipelineSettings,
    cancel: CancelToken,
}

impl<C: TransferClient> Pipeline<C> {
    pub fn new(source: DataSource, store: Store, client: C, settings: PipelineSettings) -> Self {
        Self {
            source,
            store,
            client,
            settings,
            cancel: CancelToken::new(),
        }
    }

    pub fn source(&self) -> &DataSource {
        &self.source
    }

    /// Handle for aborting a running operation from another thread.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn snapshots(&self) -> SnapshotManager {
        SnapshotManager::new(
            self.store.backup_dir(&self.source),
            self.settings.snapshot_policy,
        )
    }

    pub fn update(&self, sink: &dyn ProgressSink) -> bool {
        match self.run_update(sink) {
            Ok(report) => {
                info!(
                    source = %report.source,
                    succeeded = report.succeeded.len(),
                    failed = report.failed.len(),
                    snapshot = %report.snapshot,
                    "update finished"
                );
                true
            }
            Err(err) => {
                error!(source = %self.source.name, error = %err, "update failed");
                false
            }
        }
    }

    pub fn restore(&self, date: &str, destination: &Utf8Path, sink: &dyn ProgressSink) -> bool {
        match self.run_restore(date, destination, sink) {
            Ok(report) => {
                info!(
                    source = %report.source,
                    snapshot = %report.snapshot,
                    destination = %report.destination,
                    "restore finished"
                );
                true
            }
            Err(err) => {
                error!(source = %self.source.name, error = %err, "restore failed");
                false
            }
        }
    }

    pub fn run_update(&self, sink: &dyn ProgressSink) -> Result<UpdateReport, RdmError> {
        let started = Instant::now();
        let downloaded_on = chrono::Local::now().naive_local();
        let source = &self.source;

        sink.event(ProgressEvent {
            message: format!("phase=Prepare; {}", source.name),
            elapsed: None,
        });
        let live_dir = self.store.ensure_live_dir(source)?;
        self.store.ensure_backup_dir(source)?;

        let coordinator = self.coordinator();
        sink.event(ProgressEvent {
            message: "phase=Resolve; enumerating items".to_string(),
            elapsed: None,
        });
        let items = coordinator.enumerate(source)?;

        sink.event(ProgressEvent {
            message: format!("phase=Stage; fetching {} items", items.len()),
            elapsed: None,
        });
        let run = coordinator.stage(source, &live_dir, items)?;
        let report = run.report().clone();
        sink.event(ProgressEvent {
            message: format!("phase=Verify; {} items verified", report.succeeded.len()),
            elapsed: Some(started.elapsed()),
        });

        let record = Manifest {
            comment: source.comment.clone(),
            downloaded_on,
            source: source.base_url.clone(),
            elapsed: started.elapsed(),
            succeeded: report.succeeded.clone(),
            failed: report.failed.clone(),
        };
        let manifest_path = run.staging_dir().join(&self.settings.manifest_file);
        let manifest_written = match manifest::write_manifest(&manifest_path, &record) {
            Ok(()) => true,
            Err(err) => {
                warn!(path = %manifest_path, error = %err, "manifest not written; dataset is still valid");
                false
            }
        };

        let mut artifacts = Vec::new();
        if manifest_written {
            artifacts.push(self.settings.manifest_file.clone());
        }
        artifacts.extend(
            source
                .provenance
                .iter()
                .filter(|name| report.succeeded.contains(*name))
                .cloned(),
        );

        sink.event(ProgressEvent {
            message: "phase=Backup; recording snapshot".to_string(),
            elapsed: None,
        });
        let pending = self
            .snapshots()
            .stage_snapshot(SnapshotDate::today(), run.staging_dir(), &artifacts)?;
        let snapshot = pending.path().to_path_buf();

        sink.event(ProgressEvent {
            message: format!("phase=Promote; {live_dir}"),
            elapsed: None,
        });
        if let Err(err) = run.promote() {
            warn!(snapshot = %snapshot, "promotion failed; withdrawing snapshot");
            pending.rollback();
            return Err(err);
        }
        pending.commit();

        let elapsed = started.elapsed();
        sink.event(ProgressEvent {
            message: "phase=Done; update complete".to_string(),
            elapsed: Some(elapsed),
        });
        Ok(UpdateReport {
            source: source.name.clone(),
            live_dir: live_dir.to_string(),
            snapshot: snapshot.to_string(),
            succeeded: report.succeeded,
            failed: report.failed,
            unverified: report.unverified,
            bytes_written: report.bytes_written,
            manifest_written,
            elapsed_seconds: elapsed.as_secs_f64(),
        })
    }

    /// Restores the snapshot nearest to `date` into `destination`, which must
    /// not exist yet. A failed restore leaves no destination behind.
    pub fn run_restore(
        &self,
        date: &str,
        destination: &Utf8Path,
        sink: &dyn ProgressSink,
    ) -> Result<RestoreReport, RdmError> {
        if destination.exists() {
            return Err(RdmError::RestoreDestinationExists(
                destination.to_path_buf().into_std_path_buf(),
            ));
        }
        sink.event(ProgressEvent {
            message: format!("phase=Resolve; snapshot for {date}"),
            elapsed: None,
        });
        let snapshot = snapshot::resolve_snapshot(&self.store.backup_dir(&self.source), date)?;

        sink.event(ProgressEvent {
            message: format!("phase=Restore; {snapshot} -> {destination}"),
            elapsed: None,
        });
        let refetched = match self.source.restore {
            RestoreMode::ArtifactsOnly => {
                fs_util::copy_dir_atomic(&snapshot, destination)?;
                Vec::new()
            }
            RestoreMode::Refetch => match self.refetch_into(&snapshot, destination) {
                Ok(refetched) => refetched,
                Err(err) => {
                    if let Err(cleanup) = fs_util::remove_dir_if_exists(destination) {
                        warn!(destination = %destination, error = %cleanup, "failed to remove partial restore");
                    }
                    return Err(err);
                }
            },
        };

        Ok(RestoreReport {
            source: self.source.name.clone(),
            requested: date.to_string(),
            snapshot: snapshot.to_string(),
            destination: destination.to_string(),
            refetched,
        })
    }

    /// Rebuilds the dataset recorded in a snapshot's manifest. The snapshot's
    /// own files are layered into the staging area before promotion.
    fn refetch_into(
        &self,
        snapshot: &Utf8Path,
        destination: &Utf8Path,
    ) -> Result<Vec<String>, RdmError> {
        let record = manifest::read_manifest(&snapshot.join(&self.settings.manifest_file))?;
        let items = record
            .succeeded
            .iter()
            .filter(|name| !snapshot.join(name.as_str()).is_file())
            .map(|name| self.item_for(name))
            .collect::<Result<Vec<_>, _>>()?;

        fs::create_dir_all(destination.as_std_path())
            .map_err(|err| RdmError::Filesystem(format!("{destination}: {err}")))?;
        let run = self.coordinator().stage(&self.source, destination, items)?;
        fs_util::copy_dir_recursive(snapshot, run.staging_dir(), &[])?;
        let report = run.promote()?;
        Ok(report.succeeded)
    }

    fn item_for(&self, name: &str) -> Result<TransferItem, RdmError> {
        let spec = match &self.source.items {
            ItemEnumeration::Explicit(specs) => specs.iter().find(|spec| spec.name == name).cloned(),
            ItemEnumeration::Listing { .. } => None,
        }
        .unwrap_or_else(|| ItemSpec::new(name));
        validate_item_target(&spec.target, Some(self.settings.manifest_file.as_str()))?;
        let mut item = TransferItem::from_spec(&spec);
        item.checksummed = !self.source.provenance.iter().any(|entry| entry == name);
        Ok(item)
    }

    fn coordinator(&self) -> StagingCoordinator<'_, C> {
        StagingCoordinator::new(
            &self.client,
            self.settings.retry,
            StagingOptions {
                workers: self.settings.workers,
                file_mode: self.settings.file_mode,
                folder_mode: self.settings.folder_mode,
                manifest_file: Some(self.settings.manifest_file.clone()),
            },
            self.cancel.clone(),
        )
    }
}
