//! # relic-manifest
//!
//! Persisted description of a version directory inside the relic registry.
//!
//! The registry lays out artifacts as `<root>/<project>/<asset>/<version>/...`.
//! Every version directory carries a `..manifest` mapping each version-relative
//! file path to its size, MD5 checksum and (optionally) the file it is linked
//! to. Linked files are materialized as relative symlinks; a `..links` sidecar
//! in each directory mirrors the linked subset of the manifest for cheap lookup.
//!
//! ## Reserved names
//!
//! Any name starting with `..` is registry metadata and is never part of a
//! manifest:
//!
//! ```text
//! <root>/<project>/..usage
//! <root>/<project>/<asset>/..latest
//! <root>/<project>/<asset>/<version>/..manifest
//! <root>/<project>/<asset>/<version>/..summary
//! <root>/<project>/<asset>/<version>/<dir>/..links
//! ```

pub mod checksum;
pub mod links;
pub mod metadata;

pub use checksum::{compute_checksum, md5_hex};
pub use links::{
    flatten, prepare_link_files, read_link_file, remove_link_file, write_link_file,
    write_link_files, LinkFiles,
};
pub use metadata::{Latest, Summary, Usage};

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MANIFEST_FILE: &str = "..manifest";
pub const LINKS_FILE: &str = "..links";
pub const SUMMARY_FILE: &str = "..summary";
pub const USAGE_FILE: &str = "..usage";
pub const LATEST_FILE: &str = "..latest";

/// Errors that can occur while reading or writing registry metadata
#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("JSON error at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl ManifestError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        ManifestError::Io {
            path: path.into(),
            source,
        }
    }

    /// True when the underlying cause is a missing file.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ManifestError::Io { source, .. } if source.kind() == io::ErrorKind::NotFound)
    }
}

pub type Result<T> = std::result::Result<T, ManifestError>;

/// Returns true for names reserved for registry metadata.
#[inline]
pub fn is_reserved_name(name: &str) -> bool {
    name.starts_with("..")
}

/// Identifies a single version directory in the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VersionKey {
    pub project: String,
    pub asset: String,
    pub version: String,
}

impl VersionKey {
    pub fn new(
        project: impl Into<String>,
        asset: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            asset: asset.into(),
            version: version.into(),
        }
    }

    /// `<root>/<project>/<asset>/<version>`
    pub fn dir(&self, registry: &Path) -> PathBuf {
        registry
            .join(&self.project)
            .join(&self.asset)
            .join(&self.version)
    }

    /// Link metadata for `path` inside this version.
    pub fn link_to(&self, path: impl Into<String>) -> LinkMetadata {
        LinkMetadata {
            project: self.project.clone(),
            asset: self.asset.clone(),
            version: self.version.clone(),
            path: path.into(),
            ancestor: None,
        }
    }
}

impl fmt::Display for VersionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.project, self.asset, self.version)
    }
}

/// Identifies the file a linked manifest entry points to.
///
/// `ancestor`, when present, is the oldest known file in the link chain and is
/// never itself carrying an ancestor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkMetadata {
    pub project: String,
    pub asset: String,
    pub version: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ancestor: Option<Box<LinkMetadata>>,
}

impl LinkMetadata {
    pub fn version_key(&self) -> VersionKey {
        VersionKey::new(&self.project, &self.asset, &self.version)
    }

    /// `project/asset/version/path`, the identity used by deletion sets.
    pub fn key(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.project, self.asset, self.version, self.path
        )
    }

    /// Same target without any ancestor attached.
    pub fn bare(&self) -> LinkMetadata {
        LinkMetadata {
            project: self.project.clone(),
            asset: self.asset.clone(),
            version: self.version.clone(),
            path: self.path.clone(),
            ancestor: None,
        }
    }

    /// The oldest file in the chain: the ancestor if known, else the link itself.
    pub fn oldest(&self) -> LinkMetadata {
        match &self.ancestor {
            Some(ancestor) => ancestor.bare(),
            None => self.bare(),
        }
    }

    /// Location of the target file inside the registry.
    pub fn registry_path(&self, registry: &Path) -> PathBuf {
        let mut out = self.version_key().dir(registry);
        for component in self.path.split('/') {
            out.push(component);
        }
        out
    }

    /// True when both point at the same file, ignoring ancestors.
    pub fn same_target(&self, other: &LinkMetadata) -> bool {
        self.project == other.project
            && self.asset == other.asset
            && self.version == other.version
            && self.path == other.path
    }
}

/// One file in a version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub size: u64,
    #[serde(rename = "md5sum")]
    pub checksum: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<LinkMetadata>,
}

impl ManifestEntry {
    pub fn file(size: u64, checksum: impl Into<String>) -> Self {
        Self {
            size,
            checksum: checksum.into(),
            link: None,
        }
    }

    pub fn linked(size: u64, checksum: impl Into<String>, link: LinkMetadata) -> Self {
        Self {
            size,
            checksum: checksum.into(),
            link: Some(link),
        }
    }

    pub fn is_link(&self) -> bool {
        self.link.is_some()
    }
}

/// Version-relative path → entry, kept ordered so serialization is stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest {
    entries: BTreeMap<String, ManifestEntry>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, entry: ManifestEntry) -> Option<ManifestEntry> {
        self.entries.insert(path.into(), entry)
    }

    pub fn get(&self, path: &str) -> Option<&ManifestEntry> {
        self.entries.get(path)
    }

    pub fn get_mut(&mut self, path: &str) -> Option<&mut ManifestEntry> {
        self.entries.get_mut(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    pub fn remove(&mut self, path: &str) -> Option<ManifestEntry> {
        self.entries.remove(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ManifestEntry)> {
        self.entries.iter().map(|(path, entry)| (path.as_str(), entry))
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(|s| s.as_str())
    }

    /// Load a manifest from a `..manifest` file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        read_json(path.as_ref())
    }

    /// Save the manifest using the write-rename pattern.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        write_json_atomic(path.as_ref(), self)
    }

    /// Load the manifest of a version directory.
    pub fn load_version(registry: &Path, key: &VersionKey) -> Result<Self> {
        Self::load(key.dir(registry).join(MANIFEST_FILE))
    }

    pub fn save_version(&self, registry: &Path, key: &VersionKey) -> Result<()> {
        self.save(key.dir(registry).join(MANIFEST_FILE))
    }

    /// Get manifest statistics
    pub fn stats(&self) -> ManifestStats {
        let mut stats = ManifestStats::default();
        for entry in self.entries.values() {
            stats.file_count += 1;
            stats.total_size += entry.size;
            if entry.is_link() {
                stats.link_count += 1;
            } else {
                stats.stored_size += entry.size;
            }
        }
        stats
    }
}

/// Statistics about a manifest
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestStats {
    pub file_count: u64,
    pub link_count: u64,
    /// Logical size of every file
    pub total_size: u64,
    /// Bytes actually held by this version (links excluded)
    pub stored_size: u64,
}

pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file = File::open(path).map_err(|e| ManifestError::io(path, e))?;
    let reader = BufReader::new(file);
    serde_json::from_reader(reader).map_err(|source| ManifestError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// Serialize to a sibling temp file, sync, then rename into place.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut tmp_name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);

    let file = File::create(&tmp_path).map_err(|e| ManifestError::io(&tmp_path, e))?;
    let mut writer = BufWriter::new(&file);
    serde_json::to_writer_pretty(&mut writer, value).map_err(|source| ManifestError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    writer.flush().map_err(|e| ManifestError::io(&tmp_path, e))?;
    drop(writer);
    file.sync_all().map_err(|e| ManifestError::io(&tmp_path, e))?;

    fs::rename(&tmp_path, path).map_err(|e| {
        let _ = fs::remove_file(&tmp_path);
        ManifestError::io(path, e)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn link(version: &str, path: &str) -> LinkMetadata {
        VersionKey::new("pokemon", "ghost", version).link_to(path)
    }

    #[test]
    fn test_manifest_save_load() {
        let temp = TempDir::new().unwrap();
        let manifest_path = temp.path().join(MANIFEST_FILE);

        let mut manifest = Manifest::new();
        manifest.insert("evolution", ManifestEntry::file(7, md5_hex(b"haunter")));
        manifest.insert(
            "moves/lick",
            ManifestEntry::linked(4, md5_hex(b"lick"), link("1", "moves/lick")),
        );
        manifest.save(&manifest_path).unwrap();

        let loaded = Manifest::load(&manifest_path).unwrap();
        assert_eq!(loaded, manifest);
        assert!(!temp.path().join("..manifest.tmp").exists());
    }

    #[test]
    fn test_manifest_json_shape() {
        let mut manifest = Manifest::new();
        let mut target = link("2", "types");
        target.ancestor = Some(Box::new(link("1", "types")));
        manifest.insert("types", ManifestEntry::linked(5, "abc", target));
        manifest.insert("name", ManifestEntry::file(6, "def"));

        let value = serde_json::to_value(&manifest).unwrap();
        assert_eq!(value["name"]["md5sum"], "def");
        assert!(value["name"].get("link").is_none());
        assert_eq!(value["types"]["link"]["version"], "2");
        assert_eq!(value["types"]["link"]["ancestor"]["version"], "1");
        assert!(value["types"]["link"]["ancestor"].get("ancestor").is_none());
    }

    #[test]
    fn test_save_is_byte_stable() {
        let temp = TempDir::new().unwrap();
        let a = temp.path().join("a");
        let b = temp.path().join("b");

        let mut manifest = Manifest::new();
        for name in ["zeta", "alpha", "mid/inner", "mid"] {
            manifest.insert(name, ManifestEntry::file(1, md5_hex(name.as_bytes())));
        }
        manifest.save(&a).unwrap();
        manifest.clone().save(&b).unwrap();
        assert_eq!(fs::read(&a).unwrap(), fs::read(&b).unwrap());
    }

    #[test]
    fn test_manifest_stats() {
        let mut manifest = Manifest::new();
        manifest.insert("a.txt", ManifestEntry::file(100, "x"));
        manifest.insert("b.txt", ManifestEntry::linked(200, "y", link("1", "b.txt")));

        let stats = manifest.stats();
        assert_eq!(stats.file_count, 2);
        assert_eq!(stats.link_count, 1);
        assert_eq!(stats.total_size, 300);
        assert_eq!(stats.stored_size, 100);
    }

    #[test]
    fn test_link_metadata_helpers() {
        let mut target = link("3", "dir/file");
        assert_eq!(target.key(), "pokemon/ghost/3/dir/file");
        assert_eq!(target.oldest(), link("3", "dir/file"));

        target.ancestor = Some(Box::new(link("1", "dir/file")));
        assert_eq!(target.oldest(), link("1", "dir/file"));
        assert!(target.same_target(&link("3", "dir/file")));

        let root = Path::new("/registry");
        assert_eq!(
            target.registry_path(root),
            PathBuf::from("/registry/pokemon/ghost/3/dir/file")
        );
    }

    #[test]
    fn test_reserved_names() {
        assert!(is_reserved_name("..manifest"));
        assert!(is_reserved_name("..links"));
        assert!(!is_reserved_name(".hidden"));
        assert!(!is_reserved_name("plain"));
    }

    #[test]
    fn test_missing_manifest_is_not_found() {
        let temp = TempDir::new().unwrap();
        let err = Manifest::load(temp.path().join("nope")).unwrap_err();
        assert!(err.is_not_found());
    }
}
