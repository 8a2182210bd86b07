//! # Delete
//!
//! Remove a version after repairing every link that points into it.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, FixedOffset};
use clap::Args;
use std::fs;
use std::io;
use std::path::Path;

use relic_config::{log_cli_info, log_cli_warn, log_reroute_info};
use relic_engine::{reroute_links, DeletionSet};
use relic_manifest::{is_reserved_name, Latest, Manifest, Summary, Usage, LATEST_FILE};

use crate::registry::Registry;

#[derive(Args, Debug)]
pub struct DeleteArgs {
    pub project: String,
    pub asset: String,
    pub version: String,

    /// Print the link repairs as JSON without changing anything
    #[arg(long)]
    pub dry_run: bool,
}

pub fn run(registry: &Registry, args: DeleteArgs) -> Result<()> {
    let key = registry.version_key(&args.project, &args.asset, &args.version)?;
    let _lock = registry.lock_project(&key.project)?;

    let version_dir = key.dir(registry.root());
    if !version_dir.is_dir() {
        bail!("Version {} does not exist", key);
    }

    let mut deletion = DeletionSet::new();
    deletion.add_version(key.clone());
    let actions = reroute_links(registry.root(), &deletion, args.dry_run)
        .with_context(|| format!("Failed to reroute links into {}", key))?;
    log_reroute_info!(
        "Links repaired",
        actions = actions.len(),
        copies = actions.iter().filter(|action| action.is_copy).count(),
        dry_run = args.dry_run,
    );

    if args.dry_run {
        println!("{}", serde_json::to_string_pretty(&actions)?);
        return Ok(());
    }

    let stored = match Manifest::load_version(registry.root(), &key) {
        Ok(manifest) => manifest.stats().stored_size,
        Err(e) => {
            log_cli_warn!("Deleting version without a readable manifest", error = e.to_string());
            0
        }
    };

    fs::remove_dir_all(&version_dir)
        .with_context(|| format!("Failed to remove {}", version_dir.display()))?;

    let usage = Usage::adjust(
        &registry.project_dir(&key.project),
        -i64::try_from(stored).unwrap_or(i64::MAX),
    )
    .context("Failed to update project usage")?;

    let asset_dir = registry.asset_dir(&key);
    let latest = Latest::load(&asset_dir).context("Failed to read latest version")?;
    if latest.map_or(true, |latest| latest.version == key.version) {
        repoint_latest(&asset_dir)?;
    }

    log_cli_info!(
        "Delete complete",
        rerouted = actions.len(),
        freed = stored,
        usage = usage.total,
    );
    println!("Deleted {} ({} links repaired)", key, actions.len());
    Ok(())
}

/// Point `..latest` at the newest remaining release, or drop it.
fn repoint_latest(asset_dir: &Path) -> Result<()> {
    match newest_release(asset_dir)? {
        Some(version) => {
            log_cli_info!("Latest version moved", version = version.as_str());
            Latest { version }
                .save(asset_dir)
                .context("Failed to update latest version")?;
        }
        None => match fs::remove_file(asset_dir.join(LATEST_FILE)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).context("Failed to remove latest pointer"),
        },
    }
    Ok(())
}

/// Non-probational version with the latest upload finish time.
fn newest_release(asset_dir: &Path) -> Result<Option<String>> {
    let entries = match fs::read_dir(asset_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("Failed to list {}", asset_dir.display())),
    };

    let mut best: Option<(DateTime<FixedOffset>, String)> = None;
    for entry in entries {
        let entry = entry?;
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if is_reserved_name(&name) || !entry.file_type()?.is_dir() {
            continue;
        }
        let Ok(summary) = Summary::load(&entry.path()) else {
            continue;
        };
        if summary.is_probational() {
            continue;
        }
        let Ok(finish) = DateTime::parse_from_rfc3339(&summary.upload_finish) else {
            continue;
        };
        let candidate = (finish, name);
        if best.as_ref().map_or(true, |current| candidate > *current) {
            best = Some(candidate);
        }
    }
    Ok(best.map(|(_, version)| version))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn version(asset_dir: &Path, name: &str, finish: &str, probation: bool) {
        let dir = asset_dir.join(name);
        fs::create_dir_all(&dir).unwrap();
        Summary {
            upload_user_id: "gastly".to_string(),
            upload_start: "2024-01-01T00:00:00Z".to_string(),
            upload_finish: finish.to_string(),
            on_probation: probation.then_some(true),
        }
        .save(&dir)
        .unwrap();
    }

    #[test]
    fn test_newest_release_skips_probation() {
        let temp = TempDir::new().unwrap();
        version(temp.path(), "1", "2024-01-01T00:00:00Z", false);
        version(temp.path(), "2", "2024-03-01T00:00:00Z", false);
        version(temp.path(), "3", "2024-06-01T00:00:00Z", true);

        assert_eq!(newest_release(temp.path()).unwrap(), Some("2".to_string()));
    }

    #[test]
    fn test_newest_release_compares_times_not_names() {
        let temp = TempDir::new().unwrap();
        version(temp.path(), "10", "2024-01-01T00:00:00Z", false);
        version(temp.path(), "9", "2024-02-01T00:00:00+01:00", false);

        assert_eq!(newest_release(temp.path()).unwrap(), Some("9".to_string()));
    }

    #[test]
    fn test_repoint_latest_removes_pointer_when_nothing_left() {
        let temp = TempDir::new().unwrap();
        Latest {
            version: "1".to_string(),
        }
        .save(temp.path())
        .unwrap();
        version(temp.path(), "2", "2024-01-01T00:00:00Z", true);

        repoint_latest(temp.path()).unwrap();
        assert!(Latest::load(temp.path()).unwrap().is_none());
    }
}
