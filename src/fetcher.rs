use std::fs;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, info, warn};

use crate::config::RetryPolicy;
use crate::domain::{ChecksumConvention, DataSource, TransferItem, TransferStatus};
use crate::error::RdmError;
use crate::transfer::{TransferClient, TransferResult};
use crate::verify;

const PAUSE_SLICE: Duration = Duration::from_millis(100);

/// Shared abort flag. Once set, no new connection or transfer attempt is
/// started; attempts already running finish on their own.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    parent: Option<Arc<AtomicBool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that is cancelled with `self` but can also be cancelled on its
    /// own without touching `self`.
    pub fn child(&self) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            parent: Some(Arc::clone(&self.flag)),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
            || self
                .parent
                .as_ref()
                .is_some_and(|parent| parent.load(Ordering::SeqCst))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchOutcome {
    pub attempts: u32,
    pub bytes_written: u64,
    /// `false` when the source declares no checksum and the item was accepted
    /// on transfer alone.
    pub verified: bool,
}

pub struct RetryingFetcher<'a, C: TransferClient> {
    client: &'a C,
    policy: RetryPolicy,
    cancel: CancelToken,
}

impl<'a, C: TransferClient> RetryingFetcher<'a, C> {
    pub fn new(client: &'a C, policy: RetryPolicy, cancel: CancelToken) -> Self {
        Self {
            client,
            policy,
            cancel,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Fetches `item` into `staging/<target>` and verifies it, retrying
    /// transient failures up to `max_transfer_attempts`. Fatal failures stop
    /// immediately.
    pub fn fetch_verified(
        &self,
        source: &DataSource,
        item: &mut TransferItem,
        staging: &Utf8Path,
    ) -> Result<FetchOutcome, RdmError> {
        item.status = TransferStatus::InProgress;
        let destination = staging.join(&item.target);
        let max_attempts = self.policy.max_transfer_attempts;
        let mut connected = false;
        let mut attempt = 0u32;
        let mut last_error = String::new();

        while attempt < max_attempts {
            if self.cancel.is_cancelled() {
                item.status = TransferStatus::Failed;
                return Err(RdmError::Cancelled);
            }
            attempt += 1;

            if !connected {
                if let Err(err) = self.connect(source) {
                    item.status = TransferStatus::Failed;
                    return Err(err);
                }
                connected = true;
            }

            match self.attempt(source, item, &destination) {
                Ok(result) => {
                    item.status = TransferStatus::Verified;
                    debug!(item = %item.remote, attempt, "item verified");
                    return Ok(FetchOutcome {
                        attempts: attempt,
                        bytes_written: result.bytes_written,
                        verified: item.checksummed && !source.trusts_unverified(),
                    });
                }
                Err(err) if err.is_transient() => {
                    warn!(item = %item.remote, attempt, error = %err, "attempt failed, retrying");
                    if matches!(err, RdmError::Connection(_) | RdmError::Transfer(_)) {
                        connected = false;
                    }
                    let pause = !matches!(err, RdmError::ChecksumMismatch { .. });
                    last_error = err.to_string();
                    if pause && attempt < max_attempts {
                        self.pause(self.policy.delay_for(attempt));
                    }
                }
                Err(err) => {
                    warn!(item = %item.remote, attempt, error = %err, "fatal failure");
                    item.status = TransferStatus::Failed;
                    return Err(err);
                }
            }
        }

        item.status = TransferStatus::Failed;
        Err(RdmError::RetriesExhausted {
            item: item.remote.clone(),
            attempts: attempt,
            message: last_error,
        })
    }

    /// Establishes the connection, retrying transient failures up to
    /// `max_connection_attempts`.
    pub fn connect(&self, source: &DataSource) -> Result<(), RdmError> {
        let max_attempts = self.policy.max_connection_attempts;
        let mut attempt = 0u32;
        loop {
            if self.cancel.is_cancelled() {
                return Err(RdmError::Cancelled);
            }
            attempt += 1;
            match self.client.connect(source) {
                Ok(()) => return Ok(()),
                Err(err) if err.is_transient() && attempt < max_attempts => {
                    warn!(source = %source.name, attempt, error = %err, "connection failed, retrying");
                    self.pause(self.policy.delay_for(attempt));
                }
                Err(err) if err.is_transient() => {
                    return Err(RdmError::ConnectionExhausted {
                        attempts: attempt,
                        message: err.to_string(),
                    });
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Runs a non-item remote operation (listing, consolidated checksum file)
    /// under the same retry rules.
    pub fn with_retries<T, F>(&self, what: &str, mut operation: F) -> Result<T, RdmError>
    where
        F: FnMut() -> Result<T, RdmError>,
    {
        let max_attempts = self.policy.max_transfer_attempts;
        let mut attempt = 0u32;
        loop {
            if self.cancel.is_cancelled() {
                return Err(RdmError::Cancelled);
            }
            attempt += 1;
            match operation() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < max_attempts => {
                    warn!(what, attempt, error = %err, "retrying");
                    self.pause(self.policy.delay_for(attempt));
                }
                Err(err) if err.is_transient() => {
                    return Err(RdmError::RetriesExhausted {
                        item: what.to_string(),
                        attempts: attempt,
                        message: err.to_string(),
                    });
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn attempt(
        &self,
        source: &DataSource,
        item: &mut TransferItem,
        destination: &Utf8Path,
    ) -> Result<TransferResult, RdmError> {
        let convention = if item.checksummed {
            &source.checksum
        } else {
            &ChecksumConvention::None
        };
        let expected = match convention {
            ChecksumConvention::None => None,
            ChecksumConvention::Sidecar(suffix) => {
                let digest = self.fetch_sidecar(source, item, suffix, destination)?;
                item.expected_digest = Some(digest.clone());
                Some(digest)
            }
            ChecksumConvention::Listing(file) => Some(item.expected_digest.clone().ok_or_else(
                || RdmError::ChecksumUnavailable {
                    item: item.remote.clone(),
                    message: format!("not listed in {file}"),
                },
            )?),
        };

        let result = self
            .client
            .fetch(source, &item.remote, destination.as_std_path())?;

        match expected {
            Some(expected) => {
                if !verify::verify(destination.as_std_path(), Some(&expected)) {
                    return Err(RdmError::ChecksumMismatch {
                        item: item.remote.clone(),
                    });
                }
            }
            None => {
                info!(
                    source = %source.name,
                    item = %item.remote,
                    "accepted without checksum; source declares none"
                );
            }
        }
        Ok(result)
    }

    fn fetch_sidecar(
        &self,
        source: &DataSource,
        item: &TransferItem,
        suffix: &str,
        destination: &Utf8Path,
    ) -> Result<String, RdmError> {
        let remote = format!("{}{}", item.remote, suffix);
        let local = Utf8PathBuf::from(format!("{destination}{suffix}"));
        remove_stale(&local)?;

        let unavailable = |message: String| RdmError::ChecksumUnavailable {
            item: item.remote.clone(),
            message,
        };
        match self.client.fetch(source, &remote, local.as_std_path()) {
            Ok(_) => {}
            Err(err @ RdmError::AuthenticationRejected(_)) | Err(err @ RdmError::LocalWrite(_)) => {
                return Err(err);
            }
            Err(err) => return Err(unavailable(err.to_string())),
        }
        let content = fs::read_to_string(local.as_std_path());
        remove_stale(&local)?;
        let content = content.map_err(|err| unavailable(err.to_string()))?;
        verify::parse_sidecar(&content).ok_or_else(|| unavailable(format!("unparseable {remote}")))
    }

    fn pause(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while !self.cancel.is_cancelled() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep((deadline - now).min(PAUSE_SLICE));
        }
    }
}

fn remove_stale(path: &Utf8Path) -> Result<(), RdmError> {
    match fs::remove_file(path.as_std_path()) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(RdmError::LocalWrite(format!("{path}: {err}"))),
    }
}
