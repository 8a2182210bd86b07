//! `..links` sidecar files and ancestor flattening.
//!
//! Each directory of a version that holds at least one linked file carries a
//! `..links` file mapping the base names of its linked files to their
//! [`LinkMetadata`]. Sidecars are derived data: [`prepare_link_files`]
//! rebuilds them from a manifest at any time.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::{read_json, write_json_atomic, LinkMetadata, Manifest, ManifestEntry, ManifestError, Result, LINKS_FILE};

/// Directory (version-relative, `""` for the root) → base name → link.
pub type LinkFiles = BTreeMap<String, BTreeMap<String, LinkMetadata>>;

/// Build the link entry for a file that points at `target`.
///
/// `target_entry` is the manifest entry of the target file. If the target is
/// itself a link, its oldest known file becomes the new entry's ancestor, so
/// stored chains never exceed two levels.
pub fn flatten(target: &LinkMetadata, target_entry: &ManifestEntry) -> LinkMetadata {
    let mut link = target.bare();
    link.ancestor = target_entry
        .link
        .as_ref()
        .map(|parent| Box::new(parent.oldest()));
    link
}

/// Split a version-relative path into its parent directory and base name.
pub fn split_path(path: &str) -> (&str, &str) {
    match path.rsplit_once('/') {
        Some((dir, base)) => (dir, base),
        None => ("", path),
    }
}

/// Group the linked entries of a manifest by their parent directory.
pub fn prepare_link_files(manifest: &Manifest) -> LinkFiles {
    let mut out = LinkFiles::new();
    for (path, entry) in manifest.iter() {
        if let Some(link) = &entry.link {
            let (dir, base) = split_path(path);
            out.entry(dir.to_string())
                .or_default()
                .insert(base.to_string(), link.clone());
        }
    }
    out
}

/// Location of the sidecar for a version-relative directory.
pub fn link_file_path(version_dir: &Path, dir: &str) -> PathBuf {
    let mut out = version_dir.to_path_buf();
    if !dir.is_empty() {
        for component in dir.split('/') {
            out.push(component);
        }
    }
    out.join(LINKS_FILE)
}

/// Read the sidecar of a directory, `None` if there is none.
pub fn read_link_file(
    version_dir: &Path,
    dir: &str,
) -> Result<Option<BTreeMap<String, LinkMetadata>>> {
    match read_json(&link_file_path(version_dir, dir)) {
        Ok(links) => Ok(Some(links)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

pub fn write_link_file(
    version_dir: &Path,
    dir: &str,
    links: &BTreeMap<String, LinkMetadata>,
) -> Result<()> {
    write_json_atomic(&link_file_path(version_dir, dir), links)
}

/// Delete the sidecar of a directory; a missing sidecar is not an error.
pub fn remove_link_file(version_dir: &Path, dir: &str) -> Result<()> {
    let path = link_file_path(version_dir, dir);
    match fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ManifestError::io(path, e)),
    }
}

/// Write every sidecar in `links`.
pub fn write_link_files(version_dir: &Path, links: &LinkFiles) -> Result<()> {
    for (dir, entries) in links {
        write_link_file(version_dir, dir, entries)?;
    }
    Ok(())
}
