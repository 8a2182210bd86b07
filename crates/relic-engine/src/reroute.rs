//! Link repair ahead of deletions.
//!
//! Before files disappear, every surviving version that links to them is
//! patched: a link whose target dies is re-pointed at the first surviving
//! file further down its chain, or turned into a real copy when the whole
//! chain dies. Ancestors are repaired the same way.
//!
//! All plans are computed against the registry as it is before any change,
//! then copies are made, then links are replaced.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use relic_manifest::links::split_path;
use relic_manifest::{
    is_reserved_name, prepare_link_files, remove_link_file, write_link_file, LinkMetadata,
    Manifest, ManifestError, Usage, VersionKey, MANIFEST_FILE,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::ManifestCache;
use crate::materialize::{place_symlink, reflink_or_copy};
use crate::resolver::symlink_target;

#[derive(Error, Debug)]
pub enum RerouteError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("link chain through {key} loops back on itself")]
    CyclicChain { key: String },
}

impl RerouteError {
    fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        RerouteError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, RerouteError>;

/// Files that are about to be deleted.
#[derive(Debug, Clone, Default)]
pub struct DeletionSet {
    versions: HashSet<VersionKey>,
    files: HashSet<String>,
}

impl DeletionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every file of `key` will be deleted.
    pub fn add_version(&mut self, key: VersionKey) {
        self.versions.insert(key);
    }

    /// A single file, as `project/asset/version/path`.
    pub fn add_file(&mut self, key: impl Into<String>) {
        self.files.insert(key.into());
    }

    pub fn contains(&self, link: &LinkMetadata) -> bool {
        self.versions.contains(&link.version_key()) || self.files.contains(&link.key())
    }

    /// Whole versions being deleted need no repair themselves.
    pub fn skips_version(&self, key: &VersionKey) -> bool {
        self.versions.contains(key)
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty() && self.files.is_empty()
    }
}

/// One planned change, reported by dry runs and real runs alike.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RerouteAction {
    /// `project/asset/version/path` of the file being patched
    pub path: String,
    /// True when the link becomes a real file
    pub is_copy: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Change {
    Copy,
    Relink(LinkMetadata),
}

#[derive(Debug)]
struct VersionPlan {
    key: VersionKey,
    changes: Vec<(String, Change)>,
}

/// Every version in the registry that has a manifest, in sorted order.
pub fn list_versions(registry: &Path) -> Result<Vec<VersionKey>> {
    let mut out = Vec::new();
    for project in subdirectories(registry)? {
        let project_dir = registry.join(&project);
        for asset in subdirectories(&project_dir)? {
            let asset_dir = project_dir.join(&asset);
            for version in subdirectories(&asset_dir)? {
                if asset_dir.join(&version).join(MANIFEST_FILE).is_file() {
                    out.push(VersionKey::new(project.as_str(), asset.as_str(), version));
                }
            }
        }
    }
    out.sort();
    Ok(out)
}

fn subdirectories(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    let entries = fs::read_dir(dir).map_err(|e| RerouteError::io(dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| RerouteError::io(dir, e))?;
        let file_type = entry.file_type().map_err(|e| RerouteError::io(entry.path(), e))?;
        if !file_type.is_dir() {
            continue;
        }
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if !is_reserved_name(&name) {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

/// Repair every link that would dangle once `deletion` is carried out.
///
/// With `dry_run` the actions are computed and returned without touching
/// the filesystem.
pub fn reroute_links(registry: &Path, deletion: &DeletionSet, dry_run: bool) -> Result<Vec<RerouteAction>> {
    let cache = ManifestCache::new(registry);
    let mut plans = Vec::new();
    for key in list_versions(registry)? {
        if deletion.skips_version(&key) {
            continue;
        }
        let plan = plan_version(&cache, deletion, key)?;
        if !plan.changes.is_empty() {
            plans.push(plan);
        }
    }

    let mut actions: Vec<RerouteAction> = plans
        .iter()
        .flat_map(|plan| {
            plan.changes.iter().map(move |(path, change)| RerouteAction {
                path: format!("{}/{}", plan.key, path),
                is_copy: *change == Change::Copy,
            })
        })
        .collect();
    actions.sort_by(|a, b| a.path.cmp(&b.path));

    if dry_run {
        info!(actions = actions.len(), "Reroute planned (dry run)");
        return Ok(actions);
    }

    // Copies first: they read through symlinks that relinking replaces.
    let mut copied_bytes: BTreeMap<String, u64> = BTreeMap::new();
    for plan in &plans {
        let dir = plan.key.dir(registry);
        let manifest = cache.get(&plan.key)?;
        for (path, change) in &plan.changes {
            if *change == Change::Copy {
                copy_in_place(&dir.join(path))?;
                let size = manifest.get(path).map(|entry| entry.size).unwrap_or(0);
                *copied_bytes.entry(plan.key.project.clone()).or_default() += size;
            }
        }
    }

    for plan in &plans {
        apply_plan(registry, &cache, plan)?;
    }

    for (project, bytes) in copied_bytes {
        let usage = Usage::adjust(&registry.join(&project), i64::try_from(bytes).unwrap_or(i64::MAX))?;
        debug!(project = %project, added = bytes, total = usage.total, "Usage adjusted for copies");
    }

    info!(
        versions = plans.len(),
        actions = actions.len(),
        copies = actions.iter().filter(|a| a.is_copy).count(),
        "Reroute complete"
    );
    Ok(actions)
}

fn plan_version(cache: &ManifestCache, deletion: &DeletionSet, key: VersionKey) -> Result<VersionPlan> {
    let manifest = cache.get(&key)?;
    let mut changes = Vec::new();

    for (path, entry) in manifest.iter() {
        let Some(link) = &entry.link else { continue };
        if deletion.contains(&key.link_to(path)) {
            continue;
        }
        let parent_lost = deletion.contains(link);
        let ancestor_lost = link.ancestor.as_deref().is_some_and(|a| deletion.contains(a));
        if !parent_lost && !ancestor_lost {
            continue;
        }

        let (living_parent, living_ancestor) = trace_chain(cache, deletion, link, parent_lost, ancestor_lost)?;
        let change = match living_parent {
            None => Change::Copy,
            Some(parent) => {
                let ancestor = if ancestor_lost {
                    living_ancestor
                } else {
                    link.ancestor.as_deref().map(LinkMetadata::bare)
                };
                let mut relinked = parent;
                relinked.ancestor = ancestor
                    .filter(|a| !a.same_target(&relinked))
                    .map(Box::new);
                Change::Relink(relinked)
            }
        };
        debug!(version = %key, path, change = ?change, "Planned reroute");
        changes.push((path.to_string(), change));
    }

    Ok(VersionPlan { key, changes })
}

/// Walk the chain that starts at `link` and find surviving replacements.
///
/// Returns the living parent (the original one if it survives) and, when
/// the ancestor is lost, the oldest survivor after the living parent. That
/// survivor has nothing alive below it, so it is never a link afterwards.
fn trace_chain(
    cache: &ManifestCache,
    deletion: &DeletionSet,
    link: &LinkMetadata,
    parent_lost: bool,
    ancestor_lost: bool,
) -> Result<(Option<LinkMetadata>, Option<LinkMetadata>)> {
    let mut living_parent = (!parent_lost).then(|| link.bare());
    let mut living_ancestor = None;
    let mut visited = HashSet::new();
    let mut current = if parent_lost {
        Some(link.bare())
    } else {
        next_in_chain(cache, &link.bare())
    };

    while let Some(node) = current {
        if living_parent.is_some() && !ancestor_lost {
            break;
        }
        if !visited.insert(node.key()) {
            return Err(RerouteError::CyclicChain { key: node.key() });
        }
        if !deletion.contains(&node) {
            if living_parent.is_none() {
                living_parent = Some(node.clone());
            } else {
                living_ancestor = Some(node.clone());
            }
        }
        current = next_in_chain(cache, &node);
    }
    Ok((living_parent, living_ancestor))
}

/// Immediate parent of `node`, if `node` is itself a link.
fn next_in_chain(cache: &ManifestCache, node: &LinkMetadata) -> Option<LinkMetadata> {
    let manifest = match cache.get(&node.version_key()) {
        Ok(manifest) => manifest,
        Err(e) => {
            warn!(version = %node.version_key(), error = %e, "Chain ends at unreadable manifest");
            return None;
        }
    };
    manifest
        .get(&node.path)
        .and_then(|entry| entry.link.as_ref())
        .map(LinkMetadata::bare)
}

/// Replace the symlink at `location` with a real copy of what it resolves to.
fn copy_in_place(location: &Path) -> Result<()> {
    let source = fs::canonicalize(location).map_err(|e| RerouteError::io(location, e))?;
    let name = location.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    let mut tmp_name = std::ffi::OsString::from("..reroute-");
    tmp_name.push(&name);
    let tmp = location.with_file_name(tmp_name);

    reflink_or_copy(&source, &tmp).map_err(|e| RerouteError::io(&tmp, e))?;
    fs::rename(&tmp, location).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        RerouteError::io(location, e)
    })?;
    debug!(path = %location.display(), "Link replaced by copy");
    Ok(())
}

fn apply_plan(registry: &Path, cache: &ManifestCache, plan: &VersionPlan) -> Result<()> {
    let dir = plan.key.dir(registry);
    let mut manifest: Manifest = cache.get(&plan.key)?.as_ref().clone();
    let mut touched_dirs = BTreeSet::new();

    for (path, change) in &plan.changes {
        let Some(entry) = manifest.get_mut(path) else { continue };
        match change {
            Change::Copy => entry.link = None,
            Change::Relink(link) => {
                let location = dir.join(path);
                let wanted = symlink_target(registry, &location, link);
                place_symlink(&wanted, &location).map_err(|e| RerouteError::io(&location, e))?;
                entry.link = Some(link.clone());
            }
        }
        touched_dirs.insert(split_path(path).0.to_string());
    }

    manifest.save_version(registry, &plan.key)?;
    let links = prepare_link_files(&manifest);
    for touched in &touched_dirs {
        match links.get(touched) {
            Some(entries) => write_link_file(&dir, touched, entries)?,
            None => remove_link_file(&dir, touched)?,
        }
    }
    cache.store(&plan.key, manifest);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use relic_manifest::ManifestEntry;
    use tempfile::TempDir;

    fn at(version: &str, path: &str) -> LinkMetadata {
        VersionKey::new("pokemon", "ghost", version).link_to(path)
    }

    fn save(registry: &Path, version: &str, entries: &[(&str, ManifestEntry)]) {
        let key = VersionKey::new("pokemon", "ghost", version);
        fs::create_dir_all(key.dir(registry)).unwrap();
        let mut manifest = Manifest::new();
        for (path, entry) in entries {
            manifest.insert(*path, entry.clone());
        }
        manifest.save_version(registry, &key).unwrap();
    }

    #[test]
    fn test_deletion_set_membership() {
        let mut deletion = DeletionSet::new();
        assert!(deletion.is_empty());
        deletion.add_version(VersionKey::new("pokemon", "ghost", "1"));
        deletion.add_file("pokemon/ghost/2/moves");

        assert!(deletion.contains(&at("1", "anything")));
        assert!(deletion.contains(&at("2", "moves")));
        assert!(!deletion.contains(&at("2", "types")));
        assert!(deletion.skips_version(&VersionKey::new("pokemon", "ghost", "1")));
        assert!(!deletion.skips_version(&VersionKey::new("pokemon", "ghost", "2")));
    }

    #[test]
    fn test_list_versions_needs_manifest() {
        let temp = TempDir::new().unwrap();
        save(temp.path(), "1", &[]);
        fs::create_dir_all(temp.path().join("pokemon/ghost/2")).unwrap();
        fs::write(temp.path().join("pokemon/..usage"), b"{}").unwrap();

        let versions = list_versions(temp.path()).unwrap();
        assert_eq!(versions, vec![VersionKey::new("pokemon", "ghost", "1")]);
    }

    #[test]
    fn test_trace_chain_skips_dead_nodes() {
        let temp = TempDir::new().unwrap();
        let registry = temp.path();
        save(registry, "1", &[("f", ManifestEntry::file(1, "x"))]);
        save(registry, "2", &[("f", ManifestEntry::linked(1, "x", at("1", "f")))]);
        let mut v3 = at("2", "f");
        v3.ancestor = Some(Box::new(at("1", "f")));
        save(registry, "3", &[("f", ManifestEntry::linked(1, "x", v3.clone()))]);

        let mut deletion = DeletionSet::new();
        deletion.add_version(VersionKey::new("pokemon", "ghost", "1"));
        deletion.add_version(VersionKey::new("pokemon", "ghost", "3"));

        let cache = ManifestCache::new(registry);
        let mut v4 = at("3", "f");
        v4.ancestor = Some(Box::new(at("1", "f")));
        let (parent, ancestor) = trace_chain(&cache, &deletion, &v4, true, true).unwrap();
        assert_eq!(parent, Some(at("2", "f")));
        assert_eq!(ancestor, None);
    }

    #[test]
    fn test_trace_chain_ancestor_is_oldest_survivor() {
        let temp = TempDir::new().unwrap();
        let registry = temp.path();
        save(registry, "1", &[("f", ManifestEntry::file(1, "x"))]);
        for version in 2..=4 {
            let mut link = at(&(version - 1).to_string(), "f");
            if version > 2 {
                link.ancestor = Some(Box::new(at("1", "f")));
            }
            save(registry, &version.to_string(), &[("f", ManifestEntry::linked(1, "x", link))]);
        }

        let mut deletion = DeletionSet::new();
        deletion.add_version(VersionKey::new("pokemon", "ghost", "1"));

        let cache = ManifestCache::new(registry);
        let mut v5 = at("4", "f");
        v5.ancestor = Some(Box::new(at("1", "f")));
        let (parent, ancestor) = trace_chain(&cache, &deletion, &v5, false, true).unwrap();
        assert_eq!(parent, Some(at("4", "f")));
        assert_eq!(ancestor, Some(at("2", "f")));
    }

    #[test]
    fn test_plan_skips_entries_that_are_deleted_too() {
        let temp = TempDir::new().unwrap();
        let registry = temp.path();
        save(registry, "1", &[("f", ManifestEntry::file(1, "x"))]);
        save(
            registry,
            "2",
            &[
                ("f", ManifestEntry::linked(1, "x", at("1", "f"))),
                ("g", ManifestEntry::linked(1, "x", at("1", "f"))),
            ],
        );

        let mut deletion = DeletionSet::new();
        deletion.add_file("pokemon/ghost/1/f");
        deletion.add_file("pokemon/ghost/2/f");

        let cache = ManifestCache::new(registry);
        let plan = plan_version(&cache, &deletion, VersionKey::new("pokemon", "ghost", "2")).unwrap();
        assert_eq!(plan.changes, vec![("g".to_string(), Change::Copy)]);
    }

    #[test]
    fn test_plan_drops_ancestor_equal_to_parent() {
        let temp = TempDir::new().unwrap();
        let registry = temp.path();
        save(registry, "1", &[("f", ManifestEntry::file(1, "x"))]);
        save(registry, "2", &[("f", ManifestEntry::linked(1, "x", at("1", "f")))]);
        let mut link = at("2", "f");
        link.ancestor = Some(Box::new(at("1", "f")));
        save(registry, "3", &[("f", ManifestEntry::linked(1, "x", link))]);

        let mut deletion = DeletionSet::new();
        deletion.add_version(VersionKey::new("pokemon", "ghost", "2"));

        let cache = ManifestCache::new(registry);
        let plan = plan_version(&cache, &deletion, VersionKey::new("pokemon", "ghost", "3")).unwrap();
        assert_eq!(plan.changes, vec![("f".to_string(), Change::Relink(at("1", "f")))]);
    }
}
