//! Placing file content into a version directory.
//!
//! Content is cloned when the filesystem supports it (FICLONE / clonefile
//! through `reflink-copy`) and copied otherwise. When consumption is enabled
//! and the caller owns the source, the file is moved instead: permissions are
//! reset, then the file is renamed, falling back to copy-and-delete when the
//! rename crosses devices.

use std::fs;
use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;

use relic_manifest::compute_checksum;
use tracing::debug;

use crate::{Result, WalkError};

/// Mode bits given to consumed files before they are moved.
pub const CONSUMED_FILE_MODE: u32 = 0o644;

/// How a file reached the version directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMethod {
    /// Copy-on-write clone
    Reflink,
    /// Full data copy
    Copy,
    /// Source renamed (or copied then removed) into place
    Move,
}

impl std::fmt::Display for TransferMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferMethod::Reflink => write!(f, "reflink"),
            TransferMethod::Copy => write!(f, "copy"),
            TransferMethod::Move => write!(f, "move"),
        }
    }
}

/// Clone `source` to `target`, or copy it when cloning is unsupported.
pub fn reflink_or_copy(source: &Path, target: &Path) -> io::Result<TransferMethod> {
    match reflink_copy::reflink(source, target) {
        Ok(()) => Ok(TransferMethod::Reflink),
        Err(_) => {
            fs::copy(source, target)?;
            Ok(TransferMethod::Copy)
        }
    }
}

/// Make `location` a symlink to `target`, replacing whatever is there.
///
/// The new link is created under a reserved `..` name next to `location`
/// and renamed over it, so readers never observe a missing entry.
pub fn place_symlink(target: &Path, location: &Path) -> io::Result<()> {
    let name = location
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "symlink location has no name"))?;
    let mut tmp_name = std::ffi::OsString::from("..relink-");
    tmp_name.push(name);
    let tmp = location.with_file_name(tmp_name);

    match fs::remove_file(&tmp) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    std::os::unix::fs::symlink(target, &tmp)?;
    fs::rename(&tmp, location).inspect_err(|_| {
        let _ = fs::remove_file(&tmp);
    })
}

/// True when the current effective user owns `path`.
fn owned_by_us(path: &Path) -> io::Result<bool> {
    let meta = fs::symlink_metadata(path)?;
    Ok(meta.uid() == nix::unistd::geteuid().as_raw())
}

fn consume(source: &Path, target: &Path) -> io::Result<TransferMethod> {
    fs::set_permissions(source, fs::Permissions::from_mode(CONSUMED_FILE_MODE))?;
    match fs::rename(source, target) {
        Ok(()) => Ok(TransferMethod::Move),
        Err(e) => {
            debug!(source = %source.display(), error = %e, "Rename failed, copying instead");
            fs::copy(source, target)?;
            fs::remove_file(source)?;
            Ok(TransferMethod::Move)
        }
    }
}

/// Materialize `source` at `target` and verify the bytes that landed.
///
/// `rel` names the file in errors; `expected` is the checksum computed from
/// the source during classification.
pub fn materialize_file(
    source: &Path,
    target: &Path,
    rel: &str,
    expected: &str,
    consume_source: bool,
) -> Result<TransferMethod> {
    let method = if consume_source && owned_by_us(source).map_err(|e| WalkError::io(source, e))? {
        consume(source, target)
    } else {
        reflink_or_copy(source, target)
    }
    .map_err(|e| WalkError::io(target, e))?;

    let (actual, _) = compute_checksum(target).map_err(|e| WalkError::io(target, e))?;
    if actual != expected {
        return Err(WalkError::ChecksumMismatch {
            path: rel.to_string(),
            expected: expected.to_string(),
            actual,
        });
    }

    debug!(path = rel, method = %method, "Materialized");
    Ok(method)
}
