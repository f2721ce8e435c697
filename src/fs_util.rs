use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use camino::{Utf8Path, Utf8PathBuf};
use flate2::read::GzDecoder;
use tempfile::Builder;
use tracing::debug;
use zip::ZipArchive;

use crate::error::RdmError;

/// Decodes every entry of `zip_path` into a scratch directory under
/// `target_dir` and only then moves the results into `target_dir`. A corrupt
/// entry or an entry escaping the target leaves `target_dir` untouched.
pub fn extract_zip(zip_path: &Path, target_dir: &Path) -> Result<(), RdmError> {
    let archive_error =
        |detail: String| RdmError::Archive(format!("{}: {detail}", zip_path.display()));
    let file = fs::File::open(zip_path).map_err(|err| archive_error(format!("open: {err}")))?;
    let mut archive = ZipArchive::new(file).map_err(|err| archive_error(err.to_string()))?;
    let scratch = Builder::new()
        .prefix(".kira-rdm-unzip")
        .tempdir_in(target_dir)
        .map_err(|err| archive_error(err.to_string()))?;

    for idx in 0..archive.len() {
        let mut entry = archive
            .by_index(idx)
            .map_err(|err| archive_error(err.to_string()))?;
        let Some(relative) = entry.enclosed_name() else {
            return Err(archive_error(format!("unsafe entry name {}", entry.name())));
        };
        let entry_path = scratch.path().join(relative);
        if entry.is_dir() {
            fs::create_dir_all(&entry_path).map_err(|err| archive_error(err.to_string()))?;
            continue;
        }
        if let Some(parent) = entry_path.parent() {
            fs::create_dir_all(parent).map_err(|err| archive_error(err.to_string()))?;
        }
        let mut outfile =
            fs::File::create(&entry_path).map_err(|err| archive_error(err.to_string()))?;
        io::copy(&mut entry, &mut outfile)
            .map_err(|err| archive_error(format!("entry {}: {err}", entry.name())))?;
    }

    for entry in fs::read_dir(scratch.path()).map_err(|err| archive_error(err.to_string()))? {
        let entry = entry.map_err(|err| archive_error(err.to_string()))?;
        fs::rename(entry.path(), target_dir.join(entry.file_name()))
            .map_err(|err| archive_error(err.to_string()))?;
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    TarGz,
    Gz,
    Zip,
}

pub fn archive_kind(path: &Path) -> Option<ArchiveKind> {
    let name = path.file_name()?.to_str()?.to_ascii_lowercase();
    if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        Some(ArchiveKind::TarGz)
    } else if name.ends_with(".gz") {
        Some(ArchiveKind::Gz)
    } else if name.ends_with(".zip") {
        Some(ArchiveKind::Zip)
    } else {
        None
    }
}

/// Extracts every archive found under `root` in place and removes the
/// archive afterwards. Returns the archives that were unpacked.
pub fn unpack_archives(root: &Utf8Path) -> Result<Vec<Utf8PathBuf>, RdmError> {
    let mut unpacked = Vec::new();
    for path in walk_dir(root.as_std_path())? {
        if !path.is_file() {
            continue;
        }
        let Some(kind) = archive_kind(&path) else {
            continue;
        };
        let parent = path
            .parent()
            .ok_or_else(|| RdmError::Archive(format!("no parent for {}", path.display())))?;
        match kind {
            ArchiveKind::TarGz => extract_tar_gz(&path, parent)?,
            ArchiveKind::Gz => {
                gunzip(&path)?;
            }
            ArchiveKind::Zip => extract_zip(&path, parent)?,
        }
        fs::remove_file(&path).map_err(|err| RdmError::Filesystem(err.to_string()))?;
        debug!(archive = %path.display(), "unpacked archive");
        unpacked.push(
            Utf8PathBuf::from_path_buf(path)
                .map_err(|_| RdmError::Filesystem("non-utf8 archive path".to_string()))?,
        );
    }
    Ok(unpacked)
}

/// Writes `content` to a temporary sibling of `path` and persists it over
/// `path` in one rename.
pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), RdmError> {
    let parent = path
        .parent()
        .ok_or_else(|| RdmError::Filesystem(format!("no parent for {path}")))?;
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| RdmError::Filesystem(err.to_string()))?;
    let mut temp = Builder::new()
        .prefix(".kira-rdm-write")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| RdmError::Filesystem(err.to_string()))?;
    temp.write_all(content)
        .and_then(|()| temp.as_file().sync_all())
        .map_err(|err| RdmError::Filesystem(format!("write {path}: {err}")))?;
    temp.persist(path.as_std_path())
        .map_err(|err| RdmError::Filesystem(format!("persist {path}: {}", err.error)))?;
    Ok(())
}

pub fn copy_file_atomic(source: &Utf8Path, dest: &Utf8Path) -> Result<(), RdmError> {
    let parent = dest
        .parent()
        .ok_or_else(|| RdmError::Filesystem("invalid destination path".to_string()))?;
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| RdmError::Filesystem(err.to_string()))?;
    let temp = Builder::new()
        .prefix("kira-rdm-file")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| RdmError::Filesystem(err.to_string()))?;
    fs::copy(source.as_std_path(), temp.path())
        .map_err(|err| RdmError::Filesystem(format!("copy {source}: {err}")))?;
    temp.persist(dest.as_std_path())
        .map_err(|err| RdmError::Filesystem(err.to_string()))?;
    Ok(())
}

/// Copies the tree under `source` into `dest`, skipping top-level entries
/// named in `exclude`.
pub fn copy_dir_recursive(
    source: &Utf8Path,
    dest: &Utf8Path,
    exclude: &[&str],
) -> Result<(), RdmError> {
    fs::create_dir_all(dest.as_std_path())
        .map_err(|err| RdmError::Filesystem(err.to_string()))?;
    for entry in walk_dir(source.as_std_path())? {
        let relative = entry
            .strip_prefix(source.as_std_path())
            .map_err(|err| RdmError::Filesystem(err.to_string()))?;
        let skipped = relative
            .components()
            .next()
            .and_then(|first| first.as_os_str().to_str())
            .map(|first| exclude.contains(&first))
            .unwrap_or(false);
        if skipped {
            continue;
        }
        let target = dest.as_std_path().join(relative);
        if entry.is_dir() {
            fs::create_dir_all(&target).map_err(|err| RdmError::Filesystem(err.to_string()))?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|err| RdmError::Filesystem(err.to_string()))?;
            }
            fs::copy(&entry, &target).map_err(|err| RdmError::Filesystem(err.to_string()))?;
        }
    }
    Ok(())
}

/// Copies `source` into a sibling temporary directory and renames it to
/// `dest`, so `dest` is never observed half-populated. `dest` must not exist.
pub fn copy_dir_atomic(source: &Utf8Path, dest: &Utf8Path) -> Result<(), RdmError> {
    let parent = dest
        .parent()
        .ok_or_else(|| RdmError::Filesystem("invalid destination path".to_string()))?;
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| RdmError::Filesystem(err.to_string()))?;
    let temp_dir = Builder::new()
        .prefix("kira-rdm-copy")
        .tempdir_in(parent.as_std_path())
        .map_err(|err| RdmError::Filesystem(err.to_string()))?;
    let temp_path = Utf8PathBuf::from_path_buf(temp_dir.path().to_path_buf())
        .map_err(|_| RdmError::Filesystem("invalid temp dir".to_string()))?;
    copy_dir_recursive(source, &temp_path, &[])?;
    if dest.exists() {
        return Err(RdmError::Filesystem(format!("{dest} already exists")));
    }
    fs::rename(temp_path.as_std_path(), dest.as_std_path())
        .map_err(|err| RdmError::Filesystem(format!("rename into {dest}: {err}")))?;
    Ok(())
}

pub fn remove_dir_if_exists(path: &Utf8Path) -> Result<(), RdmError> {
    match fs::remove_dir_all(path.as_std_path()) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(RdmError::Filesystem(format!("remove {path}: {err}"))),
    }
}

pub fn remove_file_if_exists(path: &Utf8Path) -> Result<(), RdmError> {
    match fs::remove_file(path.as_std_path()) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(RdmError::Filesystem(format!("remove {path}: {err}"))),
    }
}

pub fn is_empty_dir(path: &Utf8Path) -> Result<bool, RdmError> {
    let mut entries =
        fs::read_dir(path.as_std_path()).map_err(|err| RdmError::Filesystem(err.to_string()))?;
    Ok(entries.next().is_none())
}

#[cfg(unix)]
pub fn apply_modes(
    root: &Utf8Path,
    file_mode: Option<u32>,
    folder_mode: Option<u32>,
) -> Result<(), RdmError> {
    use std::os::unix::fs::PermissionsExt;

    if file_mode.is_none() && folder_mode.is_none() {
        return Ok(());
    }
    for path in walk_dir(root.as_std_path())? {
        let mode = if path.is_dir() { folder_mode } else { file_mode };
        if let Some(mode) = mode {
            fs::set_permissions(&path, fs::Permissions::from_mode(mode))
                .map_err(|err| RdmError::Filesystem(format!("chmod {}: {err}", path.display())))?;
        }
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn apply_modes(
    _root: &Utf8Path,
    _file_mode: Option<u32>,
    _folder_mode: Option<u32>,
) -> Result<(), RdmError> {
    Ok(())
}

pub fn walk_dir(root: &Path) -> Result<Vec<PathBuf>, RdmError> {
    let mut items = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(path) = stack.pop() {
        let entries = fs::read_dir(&path).map_err(|err| RdmError::Filesystem(err.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|err| RdmError::Filesystem(err.to_string()))?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path.clone());
            }
            items.push(path);
        }
    }
    Ok(items)
}
