//! Shared, lazily populated cache of other versions' manifests.
//!
//! Both the walker (resolving registry links) and the rerouter (walking
//! ancestry chains) read the same few manifests many times over.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use relic_manifest::{Manifest, Result, VersionKey};
use tracing::debug;

#[derive(Debug)]
pub struct ManifestCache {
    registry: PathBuf,
    manifests: Mutex<HashMap<VersionKey, Arc<Manifest>>>,
}

impl ManifestCache {
    pub fn new(registry: impl Into<PathBuf>) -> Self {
        Self {
            registry: registry.into(),
            manifests: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Path {
        &self.registry
    }

    /// Load the manifest of `key`, reading it from disk on first use.
    ///
    /// The cache lock is not held while reading, so two threads may both
    /// load the same manifest; the first insert wins.
    pub fn get(&self, key: &VersionKey) -> Result<Arc<Manifest>> {
        if let Some(found) = self.lock().get(key) {
            return Ok(Arc::clone(found));
        }

        debug!(version = %key, "Loading manifest");
        let loaded = Arc::new(Manifest::load_version(&self.registry, key)?);
        let mut manifests = self.lock();
        let entry = manifests.entry(key.clone()).or_insert(loaded);
        Ok(Arc::clone(entry))
    }

    /// Replace the cached copy after the manifest was rewritten.
    pub fn store(&self, key: &VersionKey, manifest: Manifest) {
        self.lock().insert(key.clone(), Arc::new(manifest));
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<VersionKey, Arc<Manifest>>> {
        self.manifests.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relic_manifest::ManifestEntry;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_cache_loads_once() {
        let temp = TempDir::new().unwrap();
        let key = VersionKey::new("pokemon", "ghost", "1");
        fs::create_dir_all(key.dir(temp.path())).unwrap();

        let mut manifest = Manifest::new();
        manifest.insert("evolution", ManifestEntry::file(7, "abc"));
        manifest.save_version(temp.path(), &key).unwrap();

        let cache = ManifestCache::new(temp.path());
        let first = cache.get(&key).unwrap();
        assert_eq!(first.len(), 1);

        // Later reads come from memory even if the file disappears.
        fs::remove_dir_all(key.dir(temp.path())).unwrap();
        let second = cache.get(&key).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_missing_manifest_is_error() {
        let temp = TempDir::new().unwrap();
        let cache = ManifestCache::new(temp.path());
        assert!(cache.get(&VersionKey::new("a", "b", "c")).is_err());
        assert!(cache.is_empty());
    }
}
