use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Mutex;

use assert_matches::assert_matches;
use camino::Utf8Path;
use kira_refdata_manager::config::{Backoff, RetryPolicy};
use kira_refdata_manager::domain::{
    ChecksumConvention, DataSource, ItemSpec, TransferItem, TransferStatus,
};
use kira_refdata_manager::error::RdmError;
use kira_refdata_manager::fetcher::{CancelToken, RetryingFetcher};
use kira_refdata_manager::transfer::{TransferClient, TransferResult};
use md5::{Digest, Md5};

fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// Serves files from memory. The first `transient_failures` fetches fail
/// with a transient transfer error; `fatal` makes every fetch fail with it.
#[derive(Default)]
struct MemoryClient {
    files: HashMap<String, Vec<u8>>,
    transient_failures: Mutex<usize>,
    connect_failures: Mutex<usize>,
    fatal: Option<fn() -> RdmError>,
    fetches: Mutex<Vec<String>>,
    connects: Mutex<usize>,
}

impl MemoryClient {
    fn with_file(mut self, name: &str, data: &[u8]) -> Self {
        self.files.insert(name.to_string(), data.to_vec());
        self
    }

    fn with_sidecar(self, name: &str, data: &[u8]) -> Self {
        let sidecar = format!("{}  {name}\n", md5_hex(data));
        self.with_file(name, data)
            .with_file(&format!("{name}.md5"), sidecar.as_bytes())
    }

    fn fetches_of(&self, name: &str) -> usize {
        self.fetches
            .lock()
            .unwrap()
            .iter()
            .filter(|remote| remote.as_str() == name)
            .count()
    }
}

impl TransferClient for MemoryClient {
    fn connect(&self, _source: &DataSource) -> Result<(), RdmError> {
        *self.connects.lock().unwrap() += 1;
        let mut failures = self.connect_failures.lock().unwrap();
        if *failures > 0 {
            *failures -= 1;
            return Err(RdmError::Connection("refused".to_string()));
        }
        Ok(())
    }

    fn fetch(
        &self,
        _source: &DataSource,
        remote: &str,
        destination: &Path,
    ) -> Result<TransferResult, RdmError> {
        self.fetches.lock().unwrap().push(remote.to_string());
        if let Some(fatal) = self.fatal {
            return Err(fatal());
        }
        {
            let mut failures = self.transient_failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(RdmError::Transfer("connection reset".to_string()));
            }
        }
        let data = self
            .files
            .get(remote)
            .ok_or_else(|| RdmError::ItemNotFound(remote.to_string()))?;
        fs::create_dir_all(destination.parent().unwrap()).unwrap();
        fs::write(destination, data).unwrap();
        Ok(TransferResult {
            bytes_written: data.len() as u64,
            resumed: false,
        })
    }

    fn list(&self, _source: &DataSource) -> Result<Vec<String>, RdmError> {
        Ok(self.files.keys().cloned().collect())
    }
}

fn source() -> DataSource {
    DataSource::new("test", "https://example.org/data", vec![ItemSpec::new("a.dat")])
}

fn item(name: &str) -> TransferItem {
    TransferItem::from_spec(&ItemSpec::new(name))
}

fn policy(attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_connection_attempts: 3,
        max_transfer_attempts: attempts,
        backoff_delay_seconds: 0.0,
        backoff: Backoff::Fixed,
    }
}

#[test]
fn verified_on_first_attempt() {
    let temp = tempfile::tempdir().unwrap();
    let staging = Utf8Path::from_path(temp.path()).unwrap();
    let client = MemoryClient::default().with_sidecar("a.dat", b"alpha");
    let fetcher = RetryingFetcher::new(&client, policy(3), CancelToken::new());

    let mut item = item("a.dat");
    let outcome = fetcher.fetch_verified(&source(), &mut item, staging).unwrap();
    assert_eq!(outcome.attempts, 1);
    assert_eq!(outcome.bytes_written, 5);
    assert!(outcome.verified);
    assert_eq!(item.status, TransferStatus::Verified);
    assert_eq!(item.expected_digest.as_deref(), Some(md5_hex(b"alpha").as_str()));
    assert_eq!(fs::read(staging.join("a.dat")).unwrap(), b"alpha");
    assert!(!staging.join("a.dat.md5").exists());
}

#[test]
fn always_transient_makes_exactly_max_attempts() {
    let temp = tempfile::tempdir().unwrap();
    let staging = Utf8Path::from_path(temp.path()).unwrap();
    let client = MemoryClient {
        transient_failures: Mutex::new(usize::MAX),
        ..MemoryClient::default()
    };
    let source = source().with_checksum(ChecksumConvention::None);
    let fetcher = RetryingFetcher::new(&client, policy(4), CancelToken::new());

    let mut item = item("a.dat");
    let result = fetcher.fetch_verified(&source, &mut item, staging);
    assert_matches!(result, Err(RdmError::RetriesExhausted { attempts: 4, .. }));
    assert_eq!(client.fetches_of("a.dat"), 4);
    assert_eq!(item.status, TransferStatus::Failed);
}

#[test]
fn fatal_error_stops_immediately() {
    let temp = tempfile::tempdir().unwrap();
    let staging = Utf8Path::from_path(temp.path()).unwrap();
    let client = MemoryClient {
        fatal: Some(|| RdmError::AuthenticationRejected("401".to_string())),
        ..MemoryClient::default()
    };
    let fetcher = RetryingFetcher::new(&client, policy(5), CancelToken::new());

    let mut item = item("a.dat");
    let result = fetcher.fetch_verified(&source(), &mut item, staging);
    assert_matches!(result, Err(RdmError::AuthenticationRejected(_)));
    assert_eq!(client.fetches.lock().unwrap().len(), 1);
}

#[test]
fn missing_item_is_fatal() {
    let temp = tempfile::tempdir().unwrap();
    let staging = Utf8Path::from_path(temp.path()).unwrap();
    let client = MemoryClient::default();
    let source = source().with_checksum(ChecksumConvention::None);
    let fetcher = RetryingFetcher::new(&client, policy(5), CancelToken::new());

    let mut item = item("a.dat");
    assert_matches!(
        fetcher.fetch_verified(&source, &mut item, staging),
        Err(RdmError::ItemNotFound(_))
    );
    assert_eq!(client.fetches_of("a.dat"), 1);
}

#[test]
fn wrong_checksum_never_verifies() {
    let temp = tempfile::tempdir().unwrap();
    let staging = Utf8Path::from_path(temp.path()).unwrap();
    let client = MemoryClient::default()
        .with_file("a.dat", b"corrupted")
        .with_file("a.dat.md5", format!("{}  a.dat\n", md5_hex(b"alpha")).as_bytes());
    let fetcher = RetryingFetcher::new(&client, policy(3), CancelToken::new());

    let mut item = item("a.dat");
    let result = fetcher.fetch_verified(&source(), &mut item, staging);
    assert_matches!(result, Err(RdmError::RetriesExhausted { attempts: 3, .. }));
    assert_eq!(client.fetches_of("a.dat"), 3);
    assert_eq!(client.fetches_of("a.dat.md5"), 3);
    assert!(!staging.join("a.dat").exists());
}

#[test]
fn unparseable_sidecar_is_retried() {
    let temp = tempfile::tempdir().unwrap();
    let staging = Utf8Path::from_path(temp.path()).unwrap();
    let client = MemoryClient::default()
        .with_file("a.dat", b"alpha")
        .with_file("a.dat.md5", b"<html>not found</html>");
    let fetcher = RetryingFetcher::new(&client, policy(2), CancelToken::new());

    let mut item = item("a.dat");
    let result = fetcher.fetch_verified(&source(), &mut item, staging);
    assert_matches!(result, Err(RdmError::RetriesExhausted { attempts: 2, .. }));
    assert_eq!(client.fetches_of("a.dat"), 0);
}

#[test]
fn transient_failures_then_success() {
    let temp = tempfile::tempdir().unwrap();
    let staging = Utf8Path::from_path(temp.path()).unwrap();
    let client = MemoryClient {
        transient_failures: Mutex::new(2),
        ..MemoryClient::default()
    }
    .with_sidecar("a.dat", b"alpha");
    let fetcher = RetryingFetcher::new(&client, policy(3), CancelToken::new());

    let mut item = item("a.dat");
    let outcome = fetcher.fetch_verified(&source(), &mut item, staging).unwrap();
    assert_eq!(outcome.attempts, 3);
    assert!(outcome.verified);
    assert_eq!(client.fetches_of("a.dat"), 1);
}

#[test]
fn transfer_errors_reconnect() {
    let temp = tempfile::tempdir().unwrap();
    let staging = Utf8Path::from_path(temp.path()).unwrap();
    let client = MemoryClient {
        transient_failures: Mutex::new(2),
        ..MemoryClient::default()
    }
    .with_file("a.dat", b"alpha");
    let source = source().with_checksum(ChecksumConvention::None);
    let fetcher = RetryingFetcher::new(&client, policy(3), CancelToken::new());

    let mut item = item("a.dat");
    let outcome = fetcher.fetch_verified(&source, &mut item, staging).unwrap();
    assert_eq!(outcome.attempts, 3);
    assert_eq!(*client.connects.lock().unwrap(), 3);
}

#[test]
fn connection_attempts_are_bounded() {
    let temp = tempfile::tempdir().unwrap();
    let staging = Utf8Path::from_path(temp.path()).unwrap();
    let client = MemoryClient {
        connect_failures: Mutex::new(usize::MAX),
        ..MemoryClient::default()
    };
    let fetcher = RetryingFetcher::new(&client, policy(5), CancelToken::new());

    let mut item = item("a.dat");
    let result = fetcher.fetch_verified(&source(), &mut item, staging);
    assert_matches!(result, Err(RdmError::ConnectionExhausted { attempts: 3, .. }));
    assert_eq!(*client.connects.lock().unwrap(), 3);
    assert!(client.fetches.lock().unwrap().is_empty());
}

#[test]
fn unchecked_source_accepts_transfer() {
    let temp = tempfile::tempdir().unwrap();
    let staging = Utf8Path::from_path(temp.path()).unwrap();
    let client = MemoryClient::default().with_file("a.dat", b"alpha");
    let source = source().with_checksum(ChecksumConvention::None);
    let fetcher = RetryingFetcher::new(&client, policy(3), CancelToken::new());

    let mut item = item("a.dat");
    let outcome = fetcher.fetch_verified(&source, &mut item, staging).unwrap();
    assert!(!outcome.verified);
    assert_eq!(client.fetches_of("a.dat.md5"), 0);
}

#[test]
fn listing_digest_is_used() {
    let temp = tempfile::tempdir().unwrap();
    let staging = Utf8Path::from_path(temp.path()).unwrap();
    let client = MemoryClient::default().with_file("a.dat", b"alpha");
    let source = source().with_checksum(ChecksumConvention::Listing("MD5SUMS".to_string()));
    let fetcher = RetryingFetcher::new(&client, policy(2), CancelToken::new());

    let mut item = item("a.dat");
    item.expected_digest = Some(md5_hex(b"alpha"));
    assert!(fetcher.fetch_verified(&source, &mut item, staging).is_ok());

    let mut unlisted = self::item("a.dat");
    assert_matches!(
        fetcher.fetch_verified(&source, &mut unlisted, staging),
        Err(RdmError::RetriesExhausted { attempts: 2, .. })
    );
}

#[test]
fn cancelled_token_stops_before_any_attempt() {
    let temp = tempfile::tempdir().unwrap();
    let staging = Utf8Path::from_path(temp.path()).unwrap();
    let client = MemoryClient::default().with_sidecar("a.dat", b"alpha");
    let cancel = CancelToken::new();
    cancel.cancel();
    let fetcher = RetryingFetcher::new(&client, policy(3), cancel.child());

    let mut item = item("a.dat");
    assert_matches!(
        fetcher.fetch_verified(&source(), &mut item, staging),
        Err(RdmError::Cancelled)
    );
    assert!(client.fetches.lock().unwrap().is_empty());
    assert_eq!(item.status, TransferStatus::Failed);
}
