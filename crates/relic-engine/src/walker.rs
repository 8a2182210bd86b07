//! Three-pass directory walker.
//!
//! 1. **Classify** (parallel, throttled): hash regular files, dedup them
//!    against the previous version, classify symlinks.
//! 2. **Materialize** (parallel, throttled, transfer only): copy or move every
//!    file that was not deduplicated and verify its checksum.
//! 3. **Resolve local links** (sequential): follow symlinks that stay inside
//!    the tree to a real file, detecting cycles.
//!
//! Passes never overlap. The first error raised by any task wins; tasks that
//! start after it return immediately.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Instant;

use relic_manifest::{
    compute_checksum, flatten, is_reserved_name, prepare_link_files, remove_link_file,
    write_link_files, LinkMetadata, Manifest, ManifestEntry, VersionKey,
};
use tracing::{debug, info};
use walkdir::{DirEntry, WalkDir};

use crate::cache::ManifestCache;
use crate::cancel::Cancellation;
use crate::materialize::{materialize_file, place_symlink};
use crate::resolver::{
    classify_symlink, clean_path, restore_parent, slash_path, symlink_target, ResolveContext,
    SymlinkClass,
};
use crate::throttle::{create_thread_pool, Throttle};
use crate::validate;
use crate::{Result, WalkError};

/// What a walk does with the tree it visits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkMode {
    /// Copy or move content from a staging tree into a new version
    Transfer,
    /// Rebuild manifest, sidecars and symlinks of an existing version
    Reindex,
    /// Recompute everything and compare against what is stored; never writes
    Validate,
}

impl fmt::Display for WalkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WalkMode::Transfer => write!(f, "transfer"),
            WalkMode::Reindex => write!(f, "reindex"),
            WalkMode::Validate => write!(f, "validate"),
        }
    }
}

/// The version a walk produces or inspects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkTarget {
    pub registry: PathBuf,
    pub key: VersionKey,
}

impl WalkTarget {
    pub fn new(registry: impl Into<PathBuf>, key: VersionKey) -> Self {
        Self {
            registry: registry.into(),
            key,
        }
    }

    pub fn dir(&self) -> PathBuf {
        self.key.dir(&self.registry)
    }
}

/// Content of the previous version, keyed by `(size, checksum)`.
#[derive(Debug, Clone, Default)]
pub struct DedupIndex {
    by_content: HashMap<(u64, String), LinkMetadata>,
}

impl DedupIndex {
    /// Index every file of `manifest`. The first path (in manifest order)
    /// holding a given content is the one new files link to.
    pub fn from_manifest(key: &VersionKey, manifest: &Manifest) -> Self {
        let mut by_content = HashMap::new();
        for (path, entry) in manifest.iter() {
            by_content
                .entry((entry.size, entry.checksum.clone()))
                .or_insert_with(|| flatten(&key.link_to(path), entry));
        }
        Self { by_content }
    }

    pub fn load(registry: &Path, key: &VersionKey) -> Result<Self> {
        let manifest = Manifest::load_version(registry, key)?;
        Ok(Self::from_manifest(key, &manifest))
    }

    pub fn lookup(&self, size: u64, checksum: &str) -> Option<&LinkMetadata> {
        self.by_content.get(&(size, checksum.to_string()))
    }

    pub fn len(&self) -> usize {
        self.by_content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_content.is_empty()
    }
}

/// Knobs for a single walk
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// Previous version to deduplicate against (transfer only)
    pub last_version: Option<DedupIndex>,
    /// Links recorded by an earlier walk, keyed by version-relative path
    pub restore_link_parent: HashMap<String, LinkMetadata>,
    /// Skip names starting with a single `.`
    pub ignore_dot: bool,
    /// Absolute prefixes external symlinks may point under
    pub link_whitelist: Vec<PathBuf>,
    /// Move owned files out of the staging tree instead of copying
    pub consume: bool,
}

impl WalkOptions {
    /// Remember every link of `manifest` so a reindex can keep intermediate
    /// versions that are not visible on disk.
    pub fn restore_links_from(mut self, manifest: &Manifest) -> Self {
        self.restore_link_parent = manifest
            .iter()
            .filter_map(|(path, entry)| entry.link.clone().map(|link| (path.to_string(), link)))
            .collect();
        self
    }
}

/// State shared by the tasks of one walk. Each container has its own lock.
#[derive(Default)]
struct WalkState {
    manifest: Mutex<Manifest>,
    transferrable: Mutex<Vec<(String, String)>>,
    local_links: Mutex<BTreeMap<String, String>>,
    first_error: RwLock<Option<WalkError>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl WalkState {
    fn has_failed(&self) -> bool {
        self.first_error
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Record `err` unless an earlier error is already recorded.
    fn fail(&self, err: WalkError) {
        let mut slot = self.first_error.write().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            debug!(error = %err, "Walk failed");
            *slot = Some(err);
        }
    }

    fn take_error(&self) -> Option<WalkError> {
        self.first_error
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn insert(&self, path: &str, entry: ManifestEntry) {
        lock(&self.manifest).insert(path, entry);
    }

    fn queue_transfer(&self, path: &str, checksum: String) {
        lock(&self.transferrable).push((path.to_string(), checksum));
    }

    fn add_local_link(&self, path: &str, target: String) {
        lock(&self.local_links).insert(path.to_string(), target);
    }

    fn take_transferrable(&self) -> Vec<(String, String)> {
        std::mem::take(&mut *lock(&self.transferrable))
    }
}

/// Walk `source` and produce the manifest of `target` according to `mode`.
///
/// For reindex and validate, `source` is the version directory itself.
pub fn walk_directory(
    source: &Path,
    target: &WalkTarget,
    mode: WalkMode,
    cancel: &Cancellation,
    throttle: &Throttle,
    options: &WalkOptions,
) -> Result<Manifest> {
    let started = Instant::now();
    let source = fs::canonicalize(source).map_err(|e| WalkError::io(source, e))?;
    let registry =
        fs::canonicalize(&target.registry).map_err(|e| WalkError::io(&target.registry, e))?;
    let dest = target.key.dir(&registry);
    if mode == WalkMode::Transfer {
        fs::create_dir_all(&dest).map_err(|e| WalkError::io(&dest, e))?;
    }

    // Match prefixes both as written and with symlinks resolved.
    let mut whitelist: Vec<PathBuf> = Vec::new();
    for prefix in &options.link_whitelist {
        let cleaned = clean_path(prefix);
        if let Ok(canonical) = fs::canonicalize(&cleaned) {
            if canonical != cleaned {
                whitelist.push(canonical);
            }
        }
        whitelist.push(cleaned);
    }
    let cache = ManifestCache::new(&registry);
    let ctx = ResolveContext {
        source: &source,
        registry: &registry,
        target: &target.key,
        mode,
        whitelist: &whitelist,
        cache: &cache,
    };
    let state = WalkState::default();
    let pool = create_thread_pool(throttle.capacity())?;

    // Pass 1: classify
    let mut dirs = vec![String::new()];
    pool.in_place_scope(|scope| {
        let entries = WalkDir::new(&source)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !is_skipped(e, options.ignore_dot));

        for item in entries {
            if cancel.is_cancelled() {
                state.fail(WalkError::Cancelled);
                break;
            }
            if state.has_failed() {
                break;
            }

            let entry = match item {
                Ok(entry) => entry,
                Err(e) => {
                    let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| source.clone());
                    state.fail(WalkError::io(path, e.into()));
                    break;
                }
            };
            let Some(rel) = entry.path().strip_prefix(&source).ok().and_then(slash_path) else {
                state.fail(WalkError::classify(
                    entry.path().display().to_string(),
                    "not a valid UTF-8 path",
                ));
                break;
            };

            let file_type = entry.file_type();
            if file_type.is_dir() {
                if mode == WalkMode::Transfer {
                    let dir = dest.join(&rel);
                    if let Err(e) = fs::create_dir_all(&dir) {
                        state.fail(WalkError::io(dir, e));
                        break;
                    }
                }
                dirs.push(rel);
                continue;
            }
            if !file_type.is_file() && !file_type.is_symlink() {
                state.fail(WalkError::classify(rel, "not a regular file, directory or symbolic link"));
                break;
            }

            let token = throttle.acquire();
            let (state, ctx, dest) = (&state, &ctx, &dest);
            let location = entry.into_path();
            let is_symlink = file_type.is_symlink();
            scope.spawn(move |_| {
                let _permit = throttle.hold(token);
                if cancel.is_cancelled() {
                    state.fail(WalkError::Cancelled);
                    return;
                }
                if state.has_failed() {
                    return;
                }
                if let Err(e) = classify_entry(ctx, state, options, dest, &location, &rel, is_symlink) {
                    state.fail(e);
                }
            });
        }
    });
    if let Some(err) = state.take_error() {
        return Err(err);
    }
    cancel.check()?;
    debug!(mode = %mode, elapsed_ms = started.elapsed().as_millis() as u64, "Classification finished");

    // Pass 2: materialize
    if mode == WalkMode::Transfer {
        let queue = state.take_transferrable();
        let queued = queue.len();
        pool.in_place_scope(|scope| {
            for (rel, checksum) in queue {
                if cancel.is_cancelled() {
                    state.fail(WalkError::Cancelled);
                    break;
                }
                if state.has_failed() {
                    break;
                }

                let token = throttle.acquire();
                let (state, source, dest) = (&state, &source, &dest);
                scope.spawn(move |_| {
                    let _permit = throttle.hold(token);
                    if cancel.is_cancelled() {
                        state.fail(WalkError::Cancelled);
                        return;
                    }
                    if state.has_failed() {
                        return;
                    }
                    let from = source.join(&rel);
                    let to = dest.join(&rel);
                    if let Err(e) = materialize_file(&from, &to, &rel, &checksum, options.consume) {
                        state.fail(e);
                    }
                });
            }
        });
        if let Some(err) = state.take_error() {
            return Err(err);
        }
        cancel.check()?;
        debug!(files = queued, "Materialization finished");
    }

    // Pass 3: local links
    let WalkState {
        manifest,
        local_links,
        ..
    } = state;
    let mut manifest = manifest.into_inner().unwrap_or_else(PoisonError::into_inner);
    let local_links = local_links.into_inner().unwrap_or_else(PoisonError::into_inner);
    resolve_local_links(
        &mut manifest,
        &local_links,
        &target.key,
        &options.restore_link_parent,
        cancel,
    )?;

    if mode == WalkMode::Validate {
        validate::check_version(&registry, &dest, &target.key, &manifest, &dirs)?;
    } else {
        write_version(&registry, &dest, &target.key, mode, &manifest, &dirs, cancel)?;
    }

    let stats = manifest.stats();
    info!(
        version = %target.key,
        mode = %mode,
        files = stats.file_count,
        links = stats.link_count,
        stored_bytes = stats.stored_size,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Walk complete"
    );
    Ok(manifest)
}

/// Metadata names are never walked; dotfiles only when asked.
fn is_skipped(entry: &DirEntry, ignore_dot: bool) -> bool {
    let name = entry.file_name().to_string_lossy();
    is_reserved_name(&name) || (ignore_dot && name.starts_with('.'))
}

fn classify_entry(
    ctx: &ResolveContext<'_>,
    state: &WalkState,
    options: &WalkOptions,
    dest: &Path,
    location: &Path,
    rel: &str,
    is_symlink: bool,
) -> Result<()> {
    if is_symlink {
        match classify_symlink(ctx, location, rel)? {
            SymlinkClass::Local { target } => {
                debug!(path = rel, target = %target, "Local link");
                state.add_local_link(rel, target);
            }
            SymlinkClass::Registry { mut entry } => {
                entry.link = entry
                    .link
                    .take()
                    .map(|link| restore_parent(link, options.restore_link_parent.get(rel)));
                debug!(path = rel, "Registry link");
                state.insert(rel, entry);
            }
            SymlinkClass::Whitelisted {
                literal,
                size,
                checksum,
            } => {
                if ctx.mode == WalkMode::Transfer {
                    let at = dest.join(rel);
                    std::os::unix::fs::symlink(&literal, &at).map_err(|e| WalkError::io(at, e))?;
                }
                state.insert(rel, ManifestEntry::file(size, checksum));
            }
        }
        return Ok(());
    }

    let (checksum, size) = compute_checksum(location).map_err(|e| WalkError::io(location, e))?;
    if ctx.mode == WalkMode::Transfer {
        if let Some(link) = options
            .last_version
            .as_ref()
            .and_then(|index| index.lookup(size, &checksum))
        {
            debug!(path = rel, target = %link.key(), "Deduplicated");
            state.insert(rel, ManifestEntry::linked(size, checksum, link.clone()));
            return Ok(());
        }
        state.queue_transfer(rel, checksum.clone());
    }
    state.insert(rel, ManifestEntry::file(size, checksum));
    Ok(())
}

/// Resolve every local symlink to a file of `manifest`.
///
/// Chains of local links are followed iteratively with an explicit visited
/// set. Each link in a chain points at its immediate successor, so the result
/// does not depend on the order links are visited in.
fn resolve_local_links(
    manifest: &mut Manifest,
    pending: &BTreeMap<String, String>,
    key: &VersionKey,
    restore: &HashMap<String, LinkMetadata>,
    cancel: &Cancellation,
) -> Result<()> {
    for (path, first_target) in pending {
        cancel.check()?;
        if manifest.contains(path) {
            continue;
        }

        let mut chain = vec![path.as_str()];
        let mut visited: HashSet<&str> = HashSet::from([path.as_str()]);
        let mut current = first_target.as_str();
        while !manifest.contains(current) {
            if !visited.insert(current) {
                return Err(WalkError::CyclicLink { path: path.clone() });
            }
            match pending.get(current) {
                Some(next) => {
                    chain.push(current);
                    current = next;
                }
                None => {
                    return Err(WalkError::classify(
                        path.as_str(),
                        format!("link target '{}' is not a file of the tree", current),
                    ))
                }
            }
        }

        let mut target = current;
        for link_path in chain.into_iter().rev() {
            let target_entry = manifest.get(target).cloned().ok_or_else(|| {
                WalkError::classify(link_path, format!("link target '{}' vanished", target))
            })?;
            let link = restore_parent(
                flatten(&key.link_to(target), &target_entry),
                restore.get(link_path),
            );
            manifest.insert(
                link_path,
                ManifestEntry::linked(target_entry.size, target_entry.checksum, link),
            );
            target = link_path;
        }
    }
    Ok(())
}

/// Create symlinks, then persist the manifest and its sidecars.
fn write_version(
    registry: &Path,
    dest: &Path,
    key: &VersionKey,
    mode: WalkMode,
    manifest: &Manifest,
    dirs: &[String],
    cancel: &Cancellation,
) -> Result<()> {
    for (path, entry) in manifest.iter() {
        let Some(link) = &entry.link else { continue };
        cancel.check()?;

        let location = dest.join(path);
        let wanted = symlink_target(registry, &location, link);
        if mode == WalkMode::Reindex {
            if let Ok(existing) = fs::read_link(&location) {
                if existing == wanted {
                    continue;
                }
            }
        }
        place_symlink(&wanted, &location).map_err(|e| WalkError::io(&location, e))?;
    }

    manifest.save_version(registry, key)?;
    let links = prepare_link_files(manifest);
    write_link_files(dest, &links)?;
    if mode == WalkMode::Reindex {
        for dir in dirs.iter().filter(|dir| !links.contains_key(*dir)) {
            remove_link_file(dest, dir)?;
        }
    }
    Ok(())
}

/// Transfer `source` into a new version.
pub fn transfer_directory(
    source: &Path,
    target: &WalkTarget,
    cancel: &Cancellation,
    throttle: &Throttle,
    options: &WalkOptions,
) -> Result<Manifest> {
    walk_directory(source, target, WalkMode::Transfer, cancel, throttle, options)
}

/// Rebuild manifest, sidecars and symlinks of an existing version.
pub fn reindex_directory(
    target: &WalkTarget,
    cancel: &Cancellation,
    throttle: &Throttle,
    options: &WalkOptions,
) -> Result<Manifest> {
    walk_directory(&target.dir(), target, WalkMode::Reindex, cancel, throttle, options)
}

/// Check an existing version against its stored manifest and sidecars.
pub fn validate_directory(
    target: &WalkTarget,
    cancel: &Cancellation,
    throttle: &Throttle,
    options: &WalkOptions,
) -> Result<Manifest> {
    walk_directory(&target.dir(), target, WalkMode::Validate, cancel, throttle, options)
}
