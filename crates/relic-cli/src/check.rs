//! Reindex and validate an existing version in place.

use anyhow::{bail, Context, Result};
use clap::Args;

use relic_config::{log_cli_warn, log_walk_debug, log_walk_info};
use relic_engine::{reindex_directory, validate_directory, Cancellation, WalkOptions};
use relic_manifest::{Manifest, VersionKey};

use crate::registry::Registry;

#[derive(Args, Debug)]
pub struct VersionArgs {
    pub project: String,
    pub asset: String,
    pub version: String,
}

pub fn reindex(registry: &Registry, args: VersionArgs) -> Result<()> {
    let key = existing_version(registry, &args)?;
    let _lock = registry.lock_project(&key.project)?;

    let options = restored_options(registry, &key);
    let manifest = reindex_directory(
        &registry.target(&key),
        &Cancellation::new(),
        &registry.throttle(),
        &options,
    )
    .with_context(|| format!("Failed to reindex {}", key))?;

    let stats = manifest.stats();
    log_walk_info!("Reindex complete", files = stats.file_count, links = stats.link_count);
    println!("Reindexed {}: {} files ({} linked)", key, stats.file_count, stats.link_count);
    Ok(())
}

pub fn validate(registry: &Registry, args: VersionArgs) -> Result<()> {
    let key = existing_version(registry, &args)?;

    let options = restored_options(registry, &key);
    let manifest = validate_directory(
        &registry.target(&key),
        &Cancellation::new(),
        &registry.throttle(),
        &options,
    )
    .with_context(|| format!("Validation of {} failed", key))?;

    log_walk_info!("Validation passed", files = manifest.len());
    println!("{} is valid ({} files)", key, manifest.len());
    Ok(())
}

fn existing_version(registry: &Registry, args: &VersionArgs) -> Result<VersionKey> {
    let key = registry.version_key(&args.project, &args.asset, &args.version)?;
    if !key.dir(registry.root()).is_dir() {
        bail!("Version {} does not exist", key);
    }
    Ok(key)
}

/// Walk options that keep the links recorded in the stored manifest.
fn restored_options(registry: &Registry, key: &VersionKey) -> WalkOptions {
    match Manifest::load_version(registry.root(), key) {
        Ok(stored) => {
            let options = registry.walk_options().restore_links_from(&stored);
            log_walk_debug!("Restoring recorded links", links = options.restore_link_parent.len());
            options
        }
        Err(e) => {
            log_cli_warn!("No stored manifest to restore links from", error = e.to_string());
            registry.walk_options()
        }
    }
}
