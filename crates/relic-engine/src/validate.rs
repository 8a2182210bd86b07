//! Consistency checks for validate mode. Nothing here writes.

use std::fs;
use std::path::Path;

use relic_manifest::links::read_link_file;
use relic_manifest::{prepare_link_files, LinkMetadata, Manifest, VersionKey, LINKS_FILE};

use crate::resolver::symlink_target;
use crate::{Result, WalkError};

/// Compare a freshly computed manifest with everything stored for `key`.
pub(crate) fn check_version(
    registry: &Path,
    dest: &Path,
    key: &VersionKey,
    computed: &Manifest,
    dirs: &[String],
) -> Result<()> {
    check_symlinks(registry, dest, computed)?;

    let stored = Manifest::load_version(registry, key).map_err(|e| {
        WalkError::consistency(key.to_string(), format!("cannot read stored manifest: {}", e))
    })?;
    compare_manifests(&stored, computed)?;
    compare_link_files(dest, computed, dirs)
}

/// Every linked entry must be a relative symlink to its oldest file.
fn check_symlinks(registry: &Path, dest: &Path, computed: &Manifest) -> Result<()> {
    for (path, entry) in computed.iter() {
        let Some(link) = &entry.link else { continue };
        let location = dest.join(path);
        let existing = fs::read_link(&location)
            .map_err(|_| WalkError::consistency(path, "expected a symbolic link"))?;
        if existing.is_absolute() {
            return Err(WalkError::consistency(
                path,
                format!("symbolic link has absolute target '{}'", existing.display()),
            ));
        }
        let wanted = symlink_target(registry, &location, link);
        if existing != wanted {
            return Err(WalkError::consistency(
                path,
                format!(
                    "symbolic link points at '{}', expected '{}'",
                    existing.display(),
                    wanted.display()
                ),
            ));
        }
    }
    Ok(())
}

fn compare_manifests(stored: &Manifest, computed: &Manifest) -> Result<()> {
    for (path, entry) in stored.iter() {
        match computed.get(path) {
            None => {
                return Err(WalkError::consistency(
                    path,
                    "listed in the manifest but missing from the version",
                ))
            }
            Some(found) if found.size != entry.size => {
                return Err(WalkError::consistency(
                    path,
                    format!("size mismatch: manifest has {}, found {}", entry.size, found.size),
                ))
            }
            Some(found) if found.checksum != entry.checksum => {
                return Err(WalkError::consistency(
                    path,
                    format!(
                        "checksum mismatch: manifest has {}, found {}",
                        entry.checksum, found.checksum
                    ),
                ))
            }
            Some(found) if found.link != entry.link => {
                return Err(WalkError::consistency(
                    path,
                    format!(
                        "link mismatch: manifest has {}, found {}",
                        describe(entry.link.as_ref()),
                        describe(found.link.as_ref())
                    ),
                ))
            }
            Some(_) => {}
        }
    }
    if let Some(extra) = computed.paths().find(|path| !stored.contains(path)) {
        return Err(WalkError::consistency(
            extra,
            "present in the version but missing from the manifest",
        ));
    }
    Ok(())
}

fn describe(link: Option<&LinkMetadata>) -> String {
    match link {
        None => "no link".to_string(),
        Some(link) => match &link.ancestor {
            Some(ancestor) => format!("{} (ancestor {})", link.key(), ancestor.key()),
            None => link.key(),
        },
    }
}

fn sidecar_name(dir: &str) -> String {
    if dir.is_empty() {
        LINKS_FILE.to_string()
    } else {
        format!("{}/{}", dir, LINKS_FILE)
    }
}

/// Sidecars on disk must match the ones the manifest implies, both ways.
fn compare_link_files(dest: &Path, computed: &Manifest, dirs: &[String]) -> Result<()> {
    let expected = prepare_link_files(computed);

    for dir in dirs {
        let on_disk = read_link_file(dest, dir)?;
        let (found, wanted) = match (on_disk, expected.get(dir)) {
            (None, None) => continue,
            (Some(_), None) => {
                return Err(WalkError::consistency(sidecar_name(dir), "unexpected links file"))
            }
            (None, Some(_)) => {
                return Err(WalkError::consistency(sidecar_name(dir), "missing links file"))
            }
            (Some(found), Some(wanted)) => (found, wanted),
        };

        for (base, link) in wanted {
            match found.get(base) {
                None => {
                    return Err(WalkError::consistency(
                        sidecar_name(dir),
                        format!("missing entry for '{}'", base),
                    ))
                }
                Some(on_disk) if on_disk != link => {
                    return Err(WalkError::consistency(
                        sidecar_name(dir),
                        format!(
                            "entry for '{}' is {}, expected {}",
                            base,
                            describe(Some(on_disk)),
                            describe(Some(link))
                        ),
                    ))
                }
                Some(_) => {}
            }
        }
        if let Some(extra) = found.keys().find(|base| !wanted.contains_key(*base)) {
            return Err(WalkError::consistency(
                sidecar_name(dir),
                format!("unexpected entry for '{}'", extra),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use relic_manifest::ManifestEntry;

    fn link(version: &str, path: &str) -> LinkMetadata {
        VersionKey::new("pokemon", "ghost", version).link_to(path)
    }

    #[test]
    fn test_compare_manifests_reports_each_kind() {
        let mut stored = Manifest::new();
        stored.insert("a", ManifestEntry::file(1, "x"));
        stored.insert("b", ManifestEntry::linked(1, "y", link("1", "b")));

        assert!(compare_manifests(&stored, &stored.clone()).is_ok());

        let mut missing = stored.clone();
        missing.remove("a");
        let err = compare_manifests(&stored, &missing).unwrap_err();
        assert!(err.to_string().contains("missing from the version"));

        let mut extra = stored.clone();
        extra.insert("c", ManifestEntry::file(1, "z"));
        let err = compare_manifests(&stored, &extra).unwrap_err();
        assert!(err.to_string().contains("missing from the manifest"));

        let mut relinked = stored.clone();
        relinked.insert("b", ManifestEntry::linked(1, "y", link("2", "b")));
        let err = compare_manifests(&stored, &relinked).unwrap_err();
        assert!(err.to_string().contains("link mismatch"));

        let mut resized = stored.clone();
        resized.insert("a", ManifestEntry::file(2, "x"));
        assert!(compare_manifests(&stored, &resized).is_err());
    }
}
