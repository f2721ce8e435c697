use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum RdmError {
    #[error("invalid date (expected YYYY-MM-DD): {0}")]
    InvalidDate(String),

    #[error("invalid data source: {0}")]
    InvalidSource(String),

    #[error("unknown data source: {0}")]
    UnknownSource(String),

    #[error("missing config file kira-rdm.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("connection failed after {attempts} attempts: {message}")]
    ConnectionExhausted { attempts: u32, message: String },

    #[error("transfer failed: {0}")]
    Transfer(String),

    #[error("remote returned status {status}: {message}")]
    TransferStatus { status: u16, message: String },

    #[error("authentication rejected: {0}")]
    AuthenticationRejected(String),

    #[error("remote item not found: {0}")]
    ItemNotFound(String),

    #[error("cannot write local file: {0}")]
    LocalWrite(String),

    #[error("checksum mismatch for {item}")]
    ChecksumMismatch { item: String },

    #[error("checksum unavailable for {item}: {message}")]
    ChecksumUnavailable { item: String, message: String },

    #[error("{item} failed after {attempts} attempts: {message}")]
    RetriesExhausted {
        item: String,
        attempts: u32,
        message: String,
    },

    #[error("remote listing failed: {0}")]
    Listing(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("cannot create staging area: {0}")]
    StagingCreate(String),

    #[error("staging aborted; failed items: {}", failed.join(", "))]
    StagingAborted { failed: Vec<String> },

    #[error("promotion into live dataset failed: {0}")]
    Promotion(String),

    #[error("cannot create backup directory: {0}")]
    BackupCreate(String),

    #[error("no snapshot on or before {0}")]
    SnapshotNotFound(String),

    #[error("snapshot directory is empty: {0}")]
    SnapshotEmpty(PathBuf),

    #[error("restore destination already exists: {0}")]
    RestoreDestinationExists(PathBuf),

    #[error("failed to parse manifest: {0}")]
    ManifestParse(String),

    #[error("archive error: {0}")]
    Archive(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

/// How a failure affects the retry loop and the enclosing operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Transient,
    FatalItem,
    FatalOperation,
}

impl RdmError {
    pub fn class(&self) -> FailureClass {
        match self {
            RdmError::Connection(_)
            | RdmError::Transfer(_)
            | RdmError::ChecksumMismatch { .. }
            | RdmError::ChecksumUnavailable { .. } => FailureClass::Transient,
            RdmError::TransferStatus { status, .. } if is_retryable_status(*status) => {
                FailureClass::Transient
            }
            RdmError::TransferStatus { .. }
            | RdmError::AuthenticationRejected(_)
            | RdmError::ItemNotFound(_)
            | RdmError::LocalWrite(_)
            | RdmError::ConnectionExhausted { .. }
            | RdmError::RetriesExhausted { .. } => FailureClass::FatalItem,
            _ => FailureClass::FatalOperation,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == FailureClass::Transient
    }
}

pub(crate) fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_transfer_failures() {
        assert_eq!(
            RdmError::Transfer("reset".to_string()).class(),
            FailureClass::Transient
        );
        assert_eq!(
            RdmError::TransferStatus {
                status: 503,
                message: String::new()
            }
            .class(),
            FailureClass::Transient
        );
        assert_eq!(
            RdmError::TransferStatus {
                status: 400,
                message: String::new()
            }
            .class(),
            FailureClass::FatalItem
        );
        assert_eq!(
            RdmError::AuthenticationRejected("401".to_string()).class(),
            FailureClass::FatalItem
        );
        assert_eq!(
            RdmError::StagingCreate("denied".to_string()).class(),
            FailureClass::FatalOperation
        );
    }
}
