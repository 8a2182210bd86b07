//! Symlink classification for the walker.
//!
//! A symlink found in a source tree is one of:
//!
//! - **local**: it resolves inside the source tree; the final target is
//!   looked up later, once every file of the tree is known
//! - **registry**: it resolves to `<project>/<asset>/<version>/<path>` of
//!   another version; the new entry links there with its ancestor flattened
//! - **whitelisted**: it resolves under a permitted external prefix; the
//!   symlink is kept verbatim and recorded as an ordinary file
//!
//! Anything else is rejected.

use std::fs;
use std::path::{Component, Path, PathBuf};

use relic_manifest::{compute_checksum, flatten, is_reserved_name, LinkMetadata, ManifestEntry, Summary, VersionKey};

use crate::cache::ManifestCache;
use crate::walker::WalkMode;
use crate::{Result, WalkError};

/// What a symlink in the source tree turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SymlinkClass {
    /// Points at another path of the tree, relative to the tree root.
    Local { target: String },
    /// Points into another version; `entry` is the finished linked entry.
    Registry { entry: ManifestEntry },
    /// Points under a whitelisted prefix and is kept as a literal symlink.
    Whitelisted {
        literal: PathBuf,
        size: u64,
        checksum: String,
    },
}

/// Everything classification needs to know about the walk in progress.
#[derive(Debug)]
pub struct ResolveContext<'a> {
    /// Absolute, normalized root of the tree being walked
    pub source: &'a Path,
    /// Absolute, normalized registry root
    pub registry: &'a Path,
    /// Version being produced
    pub target: &'a VersionKey,
    pub mode: WalkMode,
    pub whitelist: &'a [PathBuf],
    pub cache: &'a ManifestCache,
}

/// Lexically normalize an absolute path: drop `.` and fold `..`.
pub fn clean_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Path that leads from directory `from` to `to`. Both must be absolute and clean.
pub fn relative_to(from: &Path, to: &Path) -> PathBuf {
    let from: Vec<Component<'_>> = from.components().collect();
    let to: Vec<Component<'_>> = to.components().collect();
    let common = from
        .iter()
        .zip(to.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut out = PathBuf::new();
    for _ in common..from.len() {
        out.push("..");
    }
    for component in &to[common..] {
        out.push(component.as_os_str());
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

/// On-disk target for the symlink at `location` carrying `link`.
///
/// The symlink always points at the oldest file of the chain, relative to
/// its own directory.
pub fn symlink_target(registry: &Path, location: &Path, link: &LinkMetadata) -> PathBuf {
    let parent = location.parent().unwrap_or(registry);
    relative_to(parent, &link.oldest().registry_path(registry))
}

/// Slash-joined form of a relative path, rejecting non UTF-8 components.
pub fn slash_path(path: &Path) -> Option<String> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            _ => return None,
        }
    }
    Some(parts.join("/"))
}

/// Prefer a previously recorded link over a freshly computed one.
///
/// On disk only the oldest file of a chain is visible, so re-deriving a
/// link loses the intermediate version. `recorded` is kept when it still
/// ends at the same oldest file.
pub fn restore_parent(computed: LinkMetadata, recorded: Option<&LinkMetadata>) -> LinkMetadata {
    match recorded {
        Some(recorded)
            if !recorded.same_target(&computed) && recorded.oldest() == computed.oldest() =>
        {
            recorded.clone()
        }
        _ => computed,
    }
}

/// Classify the symlink at `location` (`rel` inside the source tree).
pub fn classify_symlink(ctx: &ResolveContext<'_>, location: &Path, rel: &str) -> Result<SymlinkClass> {
    let raw = fs::read_link(location).map_err(|e| WalkError::io(location, e))?;
    let resolved = if raw.is_absolute() {
        clean_path(&raw)
    } else {
        let parent = location.parent().unwrap_or(ctx.source);
        clean_path(&parent.join(&raw))
    };

    if let Ok(inside) = resolved.strip_prefix(ctx.source) {
        let target = slash_path(inside)
            .ok_or_else(|| WalkError::classify(rel, "link target is not a valid UTF-8 path"))?;
        if target.is_empty() {
            return Err(WalkError::classify(rel, "symbolic link to the root of the tree"));
        }
        return Ok(SymlinkClass::Local { target });
    }

    if let Ok(inside) = resolved.strip_prefix(ctx.registry) {
        let entry = resolve_registry_link(ctx, rel, inside)?;
        return Ok(SymlinkClass::Registry { entry });
    }

    if ctx.whitelist.iter().any(|prefix| resolved.starts_with(prefix)) {
        let meta = fs::metadata(location).map_err(|e| {
            WalkError::classify(rel, format!("cannot resolve '{}': {}", raw.display(), e))
        })?;
        if !meta.is_file() {
            return Err(WalkError::classify(
                rel,
                format!("symbolic link to '{}' is not a regular file", raw.display()),
            ));
        }
        let (checksum, size) = compute_checksum(location).map_err(|e| WalkError::io(location, e))?;
        return Ok(SymlinkClass::Whitelisted {
            literal: raw,
            size,
            checksum,
        });
    }

    Err(WalkError::classify(
        rel,
        format!(
            "symbolic link to '{}' leaves the tree, the registry and the link whitelist",
            raw.display()
        ),
    ))
}

fn resolve_registry_link(ctx: &ResolveContext<'_>, rel: &str, inside: &Path) -> Result<ManifestEntry> {
    let joined = slash_path(inside)
        .ok_or_else(|| WalkError::classify(rel, "link target is not a valid UTF-8 path"))?;
    let parts: Vec<&str> = joined.split('/').collect();
    if parts.len() < 4 {
        return Err(WalkError::classify(
            rel,
            format!("link into the registry must name project/asset/version/path, got '{}'", joined),
        ));
    }
    if parts.iter().any(|part| is_reserved_name(part)) {
        return Err(WalkError::classify(
            rel,
            format!("link into registry metadata '{}'", joined),
        ));
    }

    let key = VersionKey::new(parts[0], parts[1], parts[2]);
    let path = parts[3..].join("/");
    if ctx.mode == WalkMode::Transfer && key == *ctx.target {
        return Err(WalkError::LinkIntoSelf {
            path: rel.to_string(),
            target: joined,
        });
    }

    let summary = Summary::load(&key.dir(ctx.registry)).map_err(|e| {
        WalkError::classify(rel, format!("cannot read summary of {}: {}", key, e))
    })?;
    if summary.is_probational() {
        return Err(WalkError::Probation {
            path: rel.to_string(),
            target: key.to_string(),
        });
    }

    let manifest = ctx.cache.get(&key).map_err(|e| {
        WalkError::classify(rel, format!("cannot read manifest of {}: {}", key, e))
    })?;
    let entry = manifest.get(&path).ok_or_else(|| {
        WalkError::classify(rel, format!("'{}' is not a file of {}", path, key))
    })?;

    let link = flatten(&key.link_to(path.as_str()), entry);
    Ok(ManifestEntry::linked(entry.size, entry.checksum.clone(), link))
}
