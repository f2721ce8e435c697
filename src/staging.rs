use std::collections::HashMap;
use std::fs;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use rayon::ThreadPoolBuilder;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::RetryPolicy;
use crate::domain::{
    ChecksumConvention, DataSource, ItemEnumeration, TransferItem, validate_item_target,
};
use crate::error::RdmError;
use crate::fetcher::{CancelToken, FetchOutcome, RetryingFetcher};
use crate::fs_util;
use crate::store::STAGING_DIR_NAME;
use crate::transfer::TransferClient;
use crate::verify;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StagingState {
    Idle,
    Staging,
    AllVerified,
    Promoted,
    Aborted,
}

/// Per-run outcome. `succeeded` and `failed` together hold every item the
/// run was given, each exactly once, in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransferReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
    /// Items accepted without a checksum.
    pub unverified: Vec<String>,
    pub bytes_written: u64,
    #[serde(skip)]
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct StagingOptions {
    pub workers: usize,
    pub file_mode: Option<u32>,
    pub folder_mode: Option<u32>,
    /// Manifest name written next to the items; no item may claim it.
    pub manifest_file: Option<String>,
}

pub struct StagingCoordinator<'a, C: TransferClient> {
    client: &'a C,
    policy: RetryPolicy,
    options: StagingOptions,
    cancel: CancelToken,
}

impl<'a, C: TransferClient> StagingCoordinator<'a, C> {
    pub fn new(
        client: &'a C,
        policy: RetryPolicy,
        options: StagingOptions,
        cancel: CancelToken,
    ) -> Self {
        Self {
            client,
            policy,
            options,
            cancel,
        }
    }

    /// Resolves the items of `source`, listing the remote when the source
    /// enumerates by pattern.
    pub fn enumerate(&self, source: &DataSource) -> Result<Vec<TransferItem>, RdmError> {
        let ItemEnumeration::Listing {
            pattern,
            expected_count,
        } = &source.items
        else {
            return Ok(source.transfer_items(None));
        };

        let fetcher = self.fetcher(self.cancel.clone());
        fetcher.connect(source)?;
        let entries = fetcher.with_retries("listing", || self.client.list(source))?;
        let matched: Vec<String> = entries
            .into_iter()
            .filter(|name| pattern.is_match(name))
            .collect();
        info!(source = %source.name, count = matched.len(), "discovered items");
        for name in &matched {
            validate_item_target(name, self.options.manifest_file.as_deref())?;
        }

        if matched.is_empty() {
            return Err(RdmError::Listing(format!(
                "no entries of {} match {}",
                source.base_url,
                pattern.as_str()
            )));
        }
        if let Some(expected) = expected_count {
            if matched.len() < *expected {
                return Err(RdmError::Listing(format!(
                    "expected {expected} items, found {}",
                    matched.len()
                )));
            }
        }
        Ok(source.transfer_items(Some(matched)))
    }

    /// Creates a fresh staging area under `live_dir` and fills it. Any
    /// required item ending in failure aborts the run and removes the area.
    pub fn stage(
        &self,
        source: &DataSource,
        live_dir: &Utf8Path,
        mut items: Vec<TransferItem>,
    ) -> Result<StagingRun, RdmError> {
        let started = Instant::now();
        for item in &items {
            validate_item_target(&item.target, self.options.manifest_file.as_deref())?;
        }
        let staging_dir = live_dir.join(STAGING_DIR_NAME);
        fs_util::remove_dir_if_exists(&staging_dir)
            .map_err(|err| RdmError::StagingCreate(err.to_string()))?;
        fs::create_dir_all(staging_dir.as_std_path())
            .map_err(|err| RdmError::StagingCreate(format!("{staging_dir}: {err}")))?;

        let mut run = StagingRun {
            live_dir: live_dir.to_path_buf(),
            staging_dir,
            state: StagingState::Staging,
            report: TransferReport::default(),
            file_mode: self.options.file_mode,
            folder_mode: self.options.folder_mode,
        };
        debug!(source = %source.name, staging = %run.staging_dir, "staging");

        // The run token stops sibling workers after a required failure
        // without cancelling the caller's token.
        let run_cancel = self.cancel.child();
        if let ChecksumConvention::Listing(file) = &source.checksum {
            let digests = self.fetch_listing(source, file, &run.staging_dir, &run_cancel)?;
            for item in items.iter_mut().filter(|item| item.checksummed) {
                item.expected_digest = lookup_digest(&digests, &item.remote);
            }
        }

        let results = self.fetch_all(source, &mut items, &run.staging_dir, &run_cancel)?;

        let mut report = TransferReport::default();
        let mut required_failed = Vec::new();
        for (item, result) in items.iter().zip(results) {
            match result {
                Ok(outcome) => {
                    report.bytes_written += outcome.bytes_written;
                    if !outcome.verified {
                        report.unverified.push(item.remote.clone());
                    }
                    report.succeeded.push(item.remote.clone());
                }
                Err(err) => {
                    if item.required && !matches!(err, RdmError::Cancelled) {
                        required_failed.push(item.remote.clone());
                    } else {
                        warn!(item = %item.remote, error = %err, "optional item failed");
                    }
                    report.failed.push(item.remote.clone());
                }
            }
        }
        report.elapsed = started.elapsed();
        run.report = report;

        if self.cancel.is_cancelled() {
            warn!(source = %source.name, "cancelled; discarding staging area");
            run.abort();
            return Err(RdmError::Cancelled);
        }
        if !required_failed.is_empty() {
            warn!(source = %source.name, failed = ?required_failed, "aborting staging");
            run.abort();
            return Err(RdmError::StagingAborted {
                failed: required_failed,
            });
        }

        if source.unpack {
            match fs_util::unpack_archives(&run.staging_dir) {
                Ok(unpacked) => {
                    debug!(source = %source.name, count = unpacked.len(), "archives unpacked")
                }
                Err(err) => {
                    run.abort();
                    return Err(err);
                }
            }
        }

        run.state = StagingState::AllVerified;
        info!(
            source = %source.name,
            succeeded = run.report.succeeded.len(),
            failed = run.report.failed.len(),
            "all required items verified"
        );
        Ok(run)
    }

    /// Stages and promotes in one step.
    pub fn run_staged_update(
        &self,
        source: &DataSource,
        live_dir: &Utf8Path,
        items: Vec<TransferItem>,
    ) -> Result<TransferReport, RdmError> {
        self.stage(source, live_dir, items)?.promote()
    }

    fn fetcher(&self, cancel: CancelToken) -> RetryingFetcher<'a, C> {
        RetryingFetcher::new(self.client, self.policy, cancel)
    }

    fn fetch_all(
        &self,
        source: &DataSource,
        items: &mut [TransferItem],
        staging_dir: &Utf8Path,
        run_cancel: &CancelToken,
    ) -> Result<Vec<Result<FetchOutcome, RdmError>>, RdmError> {
        let fetcher = self.fetcher(run_cancel.clone());
        let fetch_one = |item: &mut TransferItem| {
            let result = fetcher.fetch_verified(source, item, staging_dir);
            if let Err(err) = &result {
                if item.required {
                    run_cancel.cancel();
                }
                warn!(item = %item.remote, error = %err, "item failed");
            }
            result
        };

        let workers = self.options.workers.max(1);
        if workers == 1 {
            return Ok(items.iter_mut().map(fetch_one).collect());
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .build()
            .map_err(|err| RdmError::StagingCreate(format!("worker pool: {err}")))?;
        Ok(pool.install(|| items.par_iter_mut().map(fetch_one).collect()))
    }

    fn fetch_listing(
        &self,
        source: &DataSource,
        file: &str,
        staging_dir: &Utf8Path,
        run_cancel: &CancelToken,
    ) -> Result<HashMap<String, String>, RdmError> {
        let fetcher = self.fetcher(run_cancel.clone());
        let local = staging_dir.join(format!(".{}", file.replace('/', "_")));
        fetcher.connect(source)?;
        fetcher.with_retries(file, || {
            fs_util::remove_file_if_exists(&local)?;
            self.client.fetch(source, file, local.as_std_path())
        })?;
        let content = fs::read_to_string(local.as_std_path())
            .map_err(|err| RdmError::Filesystem(format!("read {local}: {err}")));
        fs_util::remove_file_if_exists(&local)?;
        let digests = verify::parse_checksum_listing(&content?);
        debug!(source = %source.name, entries = digests.len(), "checksum listing parsed");
        Ok(digests)
    }
}

fn lookup_digest(digests: &HashMap<String, String>, remote: &str) -> Option<String> {
    digests.get(remote).cloned().or_else(|| {
        let name = remote.rsplit('/').next().unwrap_or(remote);
        digests.get(name).cloned()
    })
}

/// A staging area owned by one run. Dropping a run that was neither promoted
/// nor aborted removes the staging area.
#[derive(Debug)]
pub struct StagingRun {
    live_dir: Utf8PathBuf,
    staging_dir: Utf8PathBuf,
    state: StagingState,
    report: TransferReport,
    file_mode: Option<u32>,
    folder_mode: Option<u32>,
}

impl StagingRun {
    pub fn state(&self) -> StagingState {
        self.state
    }

    pub fn report(&self) -> &TransferReport {
        &self.report
    }

    pub fn staging_dir(&self) -> &Utf8Path {
        &self.staging_dir
    }

    pub fn live_dir(&self) -> &Utf8Path {
        &self.live_dir
    }

    /// Replaces the live directory's content with the staging area's and
    /// removes the staging directory. On failure the live directory keeps
    /// its previous content.
    pub fn promote(mut self) -> Result<TransferReport, RdmError> {
        if self.state != StagingState::AllVerified {
            return Err(RdmError::Promotion(format!(
                "staging run is {:?}, not verified",
                self.state
            )));
        }
        match self.swap_into_live() {
            Ok(()) => {
                self.state = StagingState::Promoted;
                info!(live = %self.live_dir, "promoted");
                Ok(self.report.clone())
            }
            Err(err) => {
                self.abort();
                Err(err)
            }
        }
    }

    pub fn abort(&mut self) {
        if let Err(err) = fs_util::remove_dir_if_exists(&self.staging_dir) {
            warn!(staging = %self.staging_dir, error = %err, "failed to remove staging area");
        }
        self.state = StagingState::Aborted;
    }

    /// Previous live entries are parked in a hidden directory inside the
    /// live directory and only deleted once every staged entry is in place.
    /// A failed move puts everything back where it was.
    fn swap_into_live(&self) -> Result<(), RdmError> {
        let promotion = |err: RdmError| RdmError::Promotion(err.to_string());
        fs_util::apply_modes(&self.staging_dir, self.file_mode, self.folder_mode)
            .map_err(promotion)?;

        let staged = list_entries(&self.staging_dir).map_err(promotion)?;
        if let Some(entry) = staged
            .iter()
            .find(|entry| entry.file_name() == Some(STAGING_DIR_NAME))
        {
            return Err(RdmError::Promotion(format!(
                "staged entry {entry} uses the reserved staging name"
            )));
        }
        let previous: Vec<Utf8PathBuf> = list_entries(&self.live_dir)
            .map_err(promotion)?
            .into_iter()
            .filter(|entry| entry.file_name() != Some(STAGING_DIR_NAME))
            .collect();

        let parked = tempfile::Builder::new()
            .prefix(".kira-rdm-previous")
            .tempdir_in(self.live_dir.as_std_path())
            .map_err(|err| RdmError::Promotion(format!("park live content: {err}")))?;
        let parked_dir = Utf8PathBuf::from_path_buf(parked.path().to_path_buf())
            .map_err(|_| RdmError::Promotion("non-utf8 live directory".to_string()))?;

        let mut set_aside = Vec::new();
        for entry in &previous {
            match move_into(entry, &parked_dir) {
                Ok(moved) => set_aside.push((entry.clone(), moved)),
                Err(err) => {
                    undo_moves(&set_aside);
                    return Err(err);
                }
            }
        }
        let mut moved_in = Vec::new();
        for entry in &staged {
            match move_into(entry, &self.live_dir) {
                Ok(moved) => moved_in.push((entry.clone(), moved)),
                Err(err) => {
                    undo_moves(&moved_in);
                    undo_moves(&set_aside);
                    return Err(err);
                }
            }
        }

        if let Err(err) = parked.close() {
            warn!(live = %self.live_dir, error = %err, "failed to delete previous live content");
        }
        fs::remove_dir(self.staging_dir.as_std_path())
            .map_err(|err| RdmError::Promotion(format!("remove {}: {err}", self.staging_dir)))
    }
}

impl Drop for StagingRun {
    fn drop(&mut self) {
        if matches!(self.state, StagingState::Staging | StagingState::AllVerified) {
            self.abort();
        }
    }
}

fn list_entries(dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>, RdmError> {
    let entries = dir
        .read_dir_utf8()
        .map_err(|err| RdmError::Filesystem(format!("read {dir}: {err}")))?;
    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| RdmError::Filesystem(err.to_string()))?;
        paths.push(entry.into_path());
    }
    paths.sort();
    Ok(paths)
}

fn move_into(entry: &Utf8Path, dir: &Utf8Path) -> Result<Utf8PathBuf, RdmError> {
    let name = entry
        .file_name()
        .ok_or_else(|| RdmError::Promotion(format!("unnamed entry {entry}")))?;
    let target = dir.join(name);
    fs::rename(entry.as_std_path(), target.as_std_path())
        .map_err(|err| RdmError::Promotion(format!("move {entry}: {err}")))?;
    Ok(target)
}

/// Reverses `(origin, moved)` renames, newest first.
fn undo_moves(moves: &[(Utf8PathBuf, Utf8PathBuf)]) {
    for (origin, moved) in moves.iter().rev() {
        if let Err(err) = fs::rename(moved.as_std_path(), origin.as_std_path()) {
            warn!(entry = %origin, error = %err, "failed to move entry back");
        }
    }
}
