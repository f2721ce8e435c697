//! Whole-file MD5 verification and checksum file parsing.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::Path;

use md5::{Digest, Md5};
use tracing::{error, warn};

use crate::error::RdmError;

const HASH_BUFFER: usize = 64 * 1024;

pub fn file_md5(path: &Path) -> Result<String, RdmError> {
    let mut file = File::open(path)
        .map_err(|err| RdmError::Filesystem(format!("open {}: {err}", path.display())))?;
    let mut hasher = Md5::new();
    let mut buffer = vec![0u8; HASH_BUFFER];
    loop {
        let read = match file.read(&mut buffer) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                return Err(RdmError::Filesystem(format!(
                    "read {}: {err}",
                    path.display()
                )));
            }
        };
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Returns `true` only when `expected` is present and equals the file's
/// digest. Every other outcome, including a missing expectation, removes the
/// local file so the next attempt starts clean.
pub fn verify(path: &Path, expected: Option<&str>) -> bool {
    let expected = expected.map(normalize_digest).unwrap_or_default();
    let verified = if expected.is_empty() {
        error!(path = %path.display(), "no expected digest; cannot verify");
        false
    } else {
        match file_md5(path) {
            Ok(actual) if actual == expected => true,
            Ok(actual) => {
                warn!(path = %path.display(), %expected, %actual, "md5 mismatch");
                false
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "md5 computation failed");
                false
            }
        }
    };
    if !verified {
        if let Err(err) = fs::remove_file(path) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %err, "failed to remove unverified file");
            }
        }
    }
    verified
}

fn normalize_digest(value: &str) -> String {
    value.trim().to_ascii_lowercase()
}

fn is_md5_hex(value: &str) -> bool {
    value.len() == 32 && value.chars().all(|ch| ch.is_ascii_hexdigit())
}

/// Parses a per-item sidecar: the digest is the first whitespace separated
/// token (`<digest>  <name>` or a bare digest).
pub fn parse_sidecar(content: &str) -> Option<String> {
    let token = content.split_whitespace().next()?;
    is_md5_hex(token).then(|| normalize_digest(token))
}

/// Parses a consolidated listing. Accepts GNU (`<digest>  <name>`,
/// `<digest> *<name>`) and BSD (`MD5 (<name>) = <digest>`) lines; leading
/// `./` is dropped from names.
pub fn parse_checksum_listing(content: &str) -> HashMap<String, String> {
    let mut digests = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("MD5 (") {
            if let Some((name, digest)) = rest.rsplit_once(") = ") {
                if is_md5_hex(digest.trim()) {
                    digests.insert(clean_name(name), normalize_digest(digest));
                }
            }
            continue;
        }
        let Some((digest, name)) = line.split_once(char::is_whitespace) else {
            continue;
        };
        if !is_md5_hex(digest) {
            continue;
        }
        let name = name.trim_start().trim_start_matches('*');
        if !name.is_empty() {
            digests.insert(clean_name(name), normalize_digest(digest));
        }
    }
    digests
}

fn clean_name(name: &str) -> String {
    name.trim().trim_start_matches("./").to_string()
}
