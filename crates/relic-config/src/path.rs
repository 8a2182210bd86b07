//! Path helpers for locating the registry and its lock files.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Name of the per-project advisory lock file
pub const PROJECT_LOCK_FILE: &str = "..LOCK";

/// Expand a leading `~/` to the home directory.
pub fn expand_home(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

/// Resolve the configured registry root to an absolute path.
///
/// The directory is created if it does not exist yet.
pub fn resolve_registry_root(path: impl AsRef<Path>) -> Result<PathBuf> {
    let expanded = expand_home(path);
    std::fs::create_dir_all(&expanded)
        .with_context(|| format!("Failed to create registry root: {}", expanded.display()))?;
    expanded
        .canonicalize()
        .with_context(|| format!("Failed to resolve registry root: {}", expanded.display()))
}

/// `<registry>/<project>/..LOCK`
pub fn project_lock_path(registry: &Path, project: &str) -> PathBuf {
    registry.join(project).join(PROJECT_LOCK_FILE)
}

/// Reject names that cannot be a single registry path component.
pub fn check_component(kind: &str, name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && !name.contains('/')
        && !name.contains('\0');
    anyhow::ensure!(valid, "invalid {} name '{}'", kind, name);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_expand_home() {
        assert_eq!(expand_home("/srv/relic"), PathBuf::from("/srv/relic"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_home("~/.relic"), home.join(".relic"));
        }
    }

    #[test]
    fn test_resolve_registry_root_creates_directory() {
        let temp = tempdir().unwrap();
        let root = resolve_registry_root(temp.path().join("nested/registry")).unwrap();
        assert!(root.is_absolute());
        assert!(root.is_dir());
    }

    #[test]
    fn test_project_lock_path() {
        assert_eq!(
            project_lock_path(Path::new("/r"), "pokemon"),
            PathBuf::from("/r/pokemon/..LOCK")
        );
    }

    #[test]
    fn test_check_component() {
        assert!(check_component("project", "pokemon").is_ok());
        assert!(check_component("project", "").is_err());
        assert!(check_component("asset", "..manifest").is_err());
        assert!(check_component("asset", ".hidden").is_err());
        assert!(check_component("version", "a/b").is_err());
    }
}
