//! # Registry handle
//!
//! Everything a command needs to touch the registry: the resolved root,
//! the walk settings from config, and project locking.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use relic_config::path::{check_component, project_lock_path, resolve_registry_root};
use relic_config::{log_lock_debug, Config};
use relic_engine::{default_thread_count, Throttle, WalkOptions, WalkTarget};
use relic_lock::{FileLock, PathLockGuard, PathLockRegistry};
use relic_manifest::VersionKey;

pub struct Registry {
    root: PathBuf,
    config: Config,
    locks: PathLockRegistry,
}

/// Exclusive hold on a project, both in this process and across processes.
///
/// Released when dropped.
pub struct ProjectLock<'a> {
    _file: FileLock,
    _mark: PathLockGuard<'a>,
}

impl Registry {
    /// Open the registry named by `root`, or the configured one.
    pub fn open(root: Option<&Path>, config: Config) -> Result<Self> {
        let root = match root {
            Some(root) => resolve_registry_root(root)?,
            None => resolve_registry_root(&config.registry.root)?,
        };
        Ok(Self {
            root,
            config,
            locks: PathLockRegistry::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn lock_timeout(&self) -> Duration {
        self.config.locks.timeout()
    }

    /// Validate the three components and build the version key.
    pub fn version_key(&self, project: &str, asset: &str, version: &str) -> Result<VersionKey> {
        check_component("project", project)?;
        check_component("asset", asset)?;
        check_component("version", version)?;
        Ok(VersionKey::new(project, asset, version))
    }

    pub fn target(&self, key: &VersionKey) -> WalkTarget {
        WalkTarget::new(&self.root, key.clone())
    }

    pub fn project_dir(&self, project: &str) -> PathBuf {
        self.root.join(project)
    }

    pub fn asset_dir(&self, key: &VersionKey) -> PathBuf {
        self.root.join(&key.project).join(&key.asset)
    }

    /// Walk options carrying the configured filters; dedup and restored
    /// links are filled in by the command.
    pub fn walk_options(&self) -> WalkOptions {
        WalkOptions {
            ignore_dot: self.config.walk.ignore_dot,
            link_whitelist: self.config.walk.link_whitelist.clone(),
            consume: self.config.walk.consume,
            ..Default::default()
        }
    }

    pub fn throttle(&self) -> Throttle {
        Throttle::new(self.config.walk.threads.unwrap_or_else(default_thread_count))
    }

    /// Take the project lock, creating the project directory if needed.
    pub fn lock_project(&self, project: &str) -> Result<ProjectLock<'_>> {
        let timeout = self.lock_timeout();
        let mark = self
            .locks
            .guard(project, timeout)
            .with_context(|| format!("Project '{}' is busy in this process", project))?;

        let project_dir = self.project_dir(project);
        fs::create_dir_all(&project_dir)
            .with_context(|| format!("Failed to create project directory: {}", project_dir.display()))?;
        let lock_path = project_lock_path(&self.root, project);
        let file = FileLock::acquire(&lock_path, timeout)
            .with_context(|| format!("Failed to lock project '{}'", project))?;
        log_lock_debug!("Project locked", project = project);

        Ok(ProjectLock {
            _file: file,
            _mark: mark,
        })
    }
}
