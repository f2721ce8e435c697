use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{HeaderMap, HeaderValue, RANGE, USER_AGENT};
use tracing::debug;

use crate::config::Timeouts;
use crate::domain::DataSource;
use crate::error::RdmError;

const COPY_BUFFER: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferResult {
    pub bytes_written: u64,
    pub resumed: bool,
}

/// One transfer attempt against a remote source. Implementations write or
/// overwrite exactly one local file per `fetch` call.
pub trait TransferClient: Send + Sync {
    fn connect(&self, source: &DataSource) -> Result<(), RdmError>;
    fn fetch(
        &self,
        source: &DataSource,
        remote: &str,
        destination: &Path,
    ) -> Result<TransferResult, RdmError>;
    /// Names of the entries available at the source's base address.
    fn list(&self, source: &DataSource) -> Result<Vec<String>, RdmError>;
}

#[derive(Clone)]
pub struct HttpTransferClient {
    client: Client,
}

impl HttpTransferClient {
    pub fn new(timeouts: Timeouts) -> Result<Self, RdmError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("kira-rdm/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| RdmError::InvalidConfig(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .cookie_store(true)
            .connect_timeout(Duration::from_secs(timeouts.connect_seconds))
            .timeout(Duration::from_secs(timeouts.read_seconds))
            .build()
            .map_err(|err| RdmError::InvalidConfig(err.to_string()))?;
        Ok(Self { client })
    }

    fn authorize(&self, source: &DataSource, request: RequestBuilder) -> RequestBuilder {
        match &source.credentials {
            Some(creds) if creds.login_url.is_none() => {
                request.basic_auth(&creds.username, Some(&creds.password))
            }
            _ => request,
        }
    }

    fn check_status(response: Response, what: &str) -> Result<Response, RdmError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response
            .text()
            .ok()
            .map(|body| body.trim().chars().take(200).collect::<String>())
            .filter(|body| !body.is_empty())
            .unwrap_or_else(|| what.to_string());
        Err(status_error(status, what, message))
    }
}

impl TransferClient for HttpTransferClient {
    fn connect(&self, source: &DataSource) -> Result<(), RdmError> {
        let Some(creds) = &source.credentials else {
            return Ok(());
        };
        let Some(login_url) = &creds.login_url else {
            return Ok(());
        };
        debug!(source = %source.name, url = %login_url, "logging in");
        let response = self
            .client
            .post(login_url)
            .form(&[
                ("username", creds.username.as_str()),
                ("password", creds.password.as_str()),
            ])
            .send()
            .map_err(|err| RdmError::Connection(err.to_string()))?;
        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(
                RdmError::AuthenticationRejected(format!("login to {login_url} rejected")),
            ),
            status if status.is_success() || status.is_redirection() => Ok(()),
            status => Err(RdmError::Connection(format!("login returned {status}"))),
        }
    }

    fn fetch(
        &self,
        source: &DataSource,
        remote: &str,
        destination: &Path,
    ) -> Result<TransferResult, RdmError> {
        let url = source.remote_url(remote);
        let existing = fs::metadata(destination)
            .map(|meta| meta.len())
            .unwrap_or(0);

        let mut request = self.authorize(source, self.client.get(&url));
        if existing > 0 {
            request = request.header(RANGE, format!("bytes={existing}-"));
        }
        let response = request.send().map_err(map_request_error)?;

        let resumed = match response.status() {
            StatusCode::PARTIAL_CONTENT => true,
            StatusCode::RANGE_NOT_SATISFIABLE if existing > 0 => {
                // Local copy already holds every byte; verification decides.
                return Ok(TransferResult {
                    bytes_written: 0,
                    resumed: true,
                });
            }
            _ => false,
        };
        let mut response = Self::check_status(response, remote)?;

        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| RdmError::LocalWrite(format!("{}: {err}", parent.display())))?;
        }
        let mut file = if resumed {
            OpenOptions::new().append(true).open(destination)
        } else {
            File::create(destination)
        }
        .map_err(|err| RdmError::LocalWrite(format!("{}: {err}", destination.display())))?;

        let bytes_written = copy_stream(&mut response, &mut file, destination)?;
        debug!(item = remote, bytes = bytes_written, resumed, "transfer finished");
        Ok(TransferResult {
            bytes_written,
            resumed,
        })
    }

    fn list(&self, source: &DataSource) -> Result<Vec<String>, RdmError> {
        let url = format!("{}/", source.base_url.trim_end_matches('/'));
        let response = self
            .authorize(source, self.client.get(&url))
            .send()
            .map_err(|err| RdmError::Listing(err.to_string()))?;
        let response = Self::check_status(response, &url)?;
        let body = response
            .text()
            .map_err(|err| RdmError::Listing(err.to_string()))?;
        Ok(parse_index_links(&body))
    }
}

/// Extracts entry names from an HTML directory index.
pub fn parse_index_links(html: &str) -> Vec<String> {
    let Ok(anchor) = Regex::new(r#"(?i)href\s*=\s*["']([^"'?#]+)["']"#) else {
        return Vec::new();
    };
    let mut names = Vec::new();
    for capture in anchor.captures_iter(html) {
        let href = &capture[1];
        if href.ends_with('/') || href.starts_with("..") {
            continue;
        }
        let Some(name) = href.rsplit('/').next().filter(|name| !name.is_empty()) else {
            continue;
        };
        if !names.iter().any(|seen| seen == name) {
            names.push(name.to_string());
        }
    }
    names
}

/// Filesystem mirror transport. Has no resume support: every fetch restarts
/// from zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalTransferClient;

impl LocalTransferClient {
    pub fn new() -> Self {
        Self
    }

    fn root(source: &DataSource) -> PathBuf {
        PathBuf::from(
            source
                .base_url
                .strip_prefix("file://")
                .unwrap_or(&source.base_url),
        )
    }
}

impl TransferClient for LocalTransferClient {
    fn connect(&self, source: &DataSource) -> Result<(), RdmError> {
        let root = Self::root(source);
        if root.is_dir() {
            Ok(())
        } else {
            Err(RdmError::Connection(format!(
                "mirror directory unavailable: {}",
                root.display()
            )))
        }
    }

    fn fetch(
        &self,
        source: &DataSource,
        remote: &str,
        destination: &Path,
    ) -> Result<TransferResult, RdmError> {
        let origin = Self::root(source).join(remote);
        let mut reader = File::open(&origin).map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => RdmError::ItemNotFound(origin.display().to_string()),
            io::ErrorKind::PermissionDenied => {
                RdmError::AuthenticationRejected(origin.display().to_string())
            }
            _ => RdmError::Transfer(format!("{}: {err}", origin.display())),
        })?;
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| RdmError::LocalWrite(format!("{}: {err}", parent.display())))?;
        }
        let mut file = File::create(destination)
            .map_err(|err| RdmError::LocalWrite(format!("{}: {err}", destination.display())))?;
        let bytes_written = copy_stream(&mut reader, &mut file, destination)?;
        Ok(TransferResult {
            bytes_written,
            resumed: false,
        })
    }

    fn list(&self, source: &DataSource) -> Result<Vec<String>, RdmError> {
        let root = Self::root(source);
        let entries = fs::read_dir(&root)
            .map_err(|err| RdmError::Listing(format!("{}: {err}", root.display())))?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| RdmError::Listing(err.to_string()))?;
            if entry.path().is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Transport picked from the source address: `file://` URLs and bare paths
/// use the local mirror client, everything else goes over HTTP.
#[derive(Clone)]
pub enum SourceClient {
    Http(HttpTransferClient),
    Local(LocalTransferClient),
}

impl SourceClient {
    pub fn for_source(source: &DataSource, timeouts: Timeouts) -> Result<Self, RdmError> {
        let base = source.base_url.as_str();
        if base.starts_with("http://") || base.starts_with("https://") {
            Ok(Self::Http(HttpTransferClient::new(timeouts)?))
        } else if base.starts_with("file://") || !base.contains("://") {
            Ok(Self::Local(LocalTransferClient::new()))
        } else {
            Err(RdmError::InvalidSource(format!(
                "unsupported address scheme: {base}"
            )))
        }
    }
}

impl TransferClient for SourceClient {
    fn connect(&self, source: &DataSource) -> Result<(), RdmError> {
        match self {
            Self::Http(client) => client.connect(source),
            Self::Local(client) => client.connect(source),
        }
    }

    fn fetch(
        &self,
        source: &DataSource,
        remote: &str,
        destination: &Path,
    ) -> Result<TransferResult, RdmError> {
        match self {
            Self::Http(client) => client.fetch(source, remote, destination),
            Self::Local(client) => client.fetch(source, remote, destination),
        }
    }

    fn list(&self, source: &DataSource) -> Result<Vec<String>, RdmError> {
        match self {
            Self::Http(client) => client.list(source),
            Self::Local(client) => client.list(source),
        }
    }
}

/// Read failures are transient (the remote side dropped); write failures are
/// local and fatal for the item.
fn copy_stream<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
    destination: &Path,
) -> Result<u64, RdmError> {
    let mut buffer = vec![0u8; COPY_BUFFER];
    let mut total = 0u64;
    loop {
        let read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(RdmError::Transfer(err.to_string())),
        };
        writer
            .write_all(&buffer[..read])
            .map_err(|err| RdmError::LocalWrite(format!("{}: {err}", destination.display())))?;
        total += read as u64;
    }
    writer
        .flush()
        .map_err(|err| RdmError::LocalWrite(format!("{}: {err}", destination.display())))?;
    Ok(total)
}

fn status_error(status: StatusCode, what: &str, message: String) -> RdmError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            RdmError::AuthenticationRejected(format!("{what}: {status}"))
        }
        StatusCode::NOT_FOUND | StatusCode::GONE => RdmError::ItemNotFound(what.to_string()),
        _ => RdmError::TransferStatus {
            status: status.as_u16(),
            message,
        },
    }
}

fn map_request_error(err: reqwest::Error) -> RdmError {
    if err.is_builder() {
        RdmError::InvalidSource(err.to_string())
    } else if err.is_connect() {
        RdmError::Connection(err.to_string())
    } else {
        RdmError::Transfer(err.to_string())
    }
}
