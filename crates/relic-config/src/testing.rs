//! Test environment abstraction for isolated testing.
//!
//! Provides `TestEnvironment` to manage:
//! - A temporary registry root
//! - A staging directory to upload from
//! - Helpers that populate both
//!
//! # Usage
//!
//! ```ignore
//! use relic_config::testing::TestEnvironment;
//!
//! #[test]
//! fn test_something() {
//!     let env = TestEnvironment::new().unwrap();
//!     env.create_file("evolution", b"haunter").unwrap();
//!     // env.registry and env.staging are isolated per test
//! }
//! ```

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;

/// Atomic counter for unique test IDs
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Isolated registry and staging area
pub struct TestEnvironment {
    /// Temporary directory (dropped on cleanup)
    _temp_dir: TempDir,
    /// Absolute, canonical registry root
    pub registry: PathBuf,
    /// Staging directory that uploads read from
    pub staging: PathBuf,
    /// Scratch space outside both trees
    pub outside: PathBuf,
    /// Unique test ID
    pub test_id: u32,
}

impl TestEnvironment {
    /// Create a new isolated test environment
    pub fn new() -> anyhow::Result<Self> {
        let test_id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path().canonicalize()?;

        let registry = root.join("registry");
        let staging = root.join(format!("staging-{}", test_id));
        let outside = root.join("outside");

        std::fs::create_dir_all(&registry)?;
        std::fs::create_dir_all(&staging)?;
        std::fs::create_dir_all(&outside)?;

        Ok(Self {
            _temp_dir: temp_dir,
            registry,
            staging,
            outside,
            test_id,
        })
    }

    /// Create a file in the staging directory
    pub fn create_file(&self, relative_path: &str, content: &[u8]) -> anyhow::Result<PathBuf> {
        let path = self.staging.join(relative_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, content)?;
        Ok(path)
    }

    /// Create a directory in the staging directory
    pub fn create_dir(&self, relative_path: &str) -> anyhow::Result<PathBuf> {
        let path = self.staging.join(relative_path);
        std::fs::create_dir_all(&path)?;
        Ok(path)
    }

    /// Create a symlink in the staging directory pointing at `target`
    pub fn create_symlink(
        &self,
        relative_path: &str,
        target: impl AsRef<Path>,
    ) -> anyhow::Result<PathBuf> {
        let path = self.staging.join(relative_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::os::unix::fs::symlink(target, &path)?;
        Ok(path)
    }

    /// Empty the staging directory so the next upload starts clean
    pub fn reset_staging(&self) -> anyhow::Result<()> {
        std::fs::remove_dir_all(&self.staging)?;
        std::fs::create_dir_all(&self.staging)?;
        Ok(())
    }

    /// `<registry>/<project>/<asset>/<version>`
    pub fn version_dir(&self, project: &str, asset: &str, version: &str) -> PathBuf {
        self.registry.join(project).join(asset).join(version)
    }

    /// A config pointing at this environment's registry
    pub fn config(&self) -> crate::Config {
        let mut cfg = crate::Config::default();
        cfg.registry.root = self.registry.clone();
        cfg.walk.threads = Some(2);
        cfg.locks.timeout_secs = 2;
        cfg
    }
}

impl Default for TestEnvironment {
    fn default() -> Self {
        Self::new().expect("Failed to create test environment")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_creates_directories() {
        let env = TestEnvironment::new().unwrap();
        assert!(env.registry.is_dir());
        assert!(env.staging.is_dir());
        assert!(env.outside.is_dir());
    }

    #[test]
    fn test_environment_has_unique_staging() {
        let env1 = TestEnvironment::new().unwrap();
        let env2 = TestEnvironment::new().unwrap();
        assert_ne!(env1.test_id, env2.test_id);
        assert_ne!(env1.staging, env2.staging);
    }

    #[test]
    fn test_create_file_and_symlink() {
        let env = TestEnvironment::new().unwrap();
        let path = env.create_file("moves/lick", b"lick").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"lick");

        let link = env.create_symlink("alias", "moves/lick").unwrap();
        assert_eq!(std::fs::read(&link).unwrap(), b"lick");

        env.reset_staging().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_config_points_at_registry() {
        let env = TestEnvironment::new().unwrap();
        let cfg = env.config();
        assert_eq!(cfg.registry.root, env.registry);
        assert_eq!(cfg.walk.threads, Some(2));
    }
}
