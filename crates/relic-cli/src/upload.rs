//! # Upload
//!
//! Turn a staging directory into a new version of an asset.

use anyhow::{bail, Context, Result};
use chrono::{SecondsFormat, Utc};
use clap::Args;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use nix::unistd::{Uid, User};
use relic_config::{log_cli_info, log_cli_warn};
use relic_engine::{transfer_directory, Cancellation, DedupIndex};
use relic_manifest::{Latest, Summary, Usage, VersionKey};

use crate::registry::Registry;

#[derive(Args, Debug)]
pub struct UploadArgs {
    pub project: String,
    pub asset: String,
    pub version: String,

    /// Directory to upload
    #[arg(value_name = "DIR")]
    pub source: PathBuf,

    /// Upload without promoting the version to latest
    #[arg(long)]
    pub probation: bool,

    /// Move files out of the source directory when we own them
    #[arg(long)]
    pub consume: bool,
}

pub fn run(registry: &Registry, args: UploadArgs) -> Result<()> {
    let key = registry.version_key(&args.project, &args.asset, &args.version)?;
    let source = args
        .source
        .canonicalize()
        .with_context(|| format!("Source directory not found: {}", args.source.display()))?;
    if !source.is_dir() {
        bail!("Source is not a directory: {}", source.display());
    }

    let _lock = registry.lock_project(&key.project)?;
    let version_dir = key.dir(registry.root());
    if version_dir.exists() {
        bail!("Version {} already exists", key);
    }

    let upload_start = now();
    let uploader = owner_of(&source)?;
    let asset_dir = registry.asset_dir(&key);

    let mut options = registry.walk_options();
    options.consume |= args.consume;
    options.last_version = dedup_index(registry, &key, &asset_dir);

    let manifest = match transfer_directory(
        &source,
        &registry.target(&key),
        &Cancellation::new(),
        &registry.throttle(),
        &options,
    ) {
        Ok(manifest) => manifest,
        Err(e) => {
            // Consumed files may only exist in the partial version now.
            if options.consume {
                log_cli_warn!("Partial upload left in place", version = key.to_string());
            } else if version_dir.exists() {
                if let Err(cleanup) = fs::remove_dir_all(&version_dir) {
                    log_cli_warn!("Failed to clean up partial upload", error = cleanup.to_string());
                }
            }
            return Err(e).with_context(|| format!("Failed to upload {}", key));
        }
    };

    Summary {
        upload_user_id: uploader,
        upload_start,
        upload_finish: now(),
        on_probation: args.probation.then_some(true),
    }
    .save(&version_dir)
    .context("Failed to write version summary")?;

    let stats = manifest.stats();
    let usage = Usage::adjust(
        &registry.project_dir(&key.project),
        i64::try_from(stats.stored_size).unwrap_or(i64::MAX),
    )
    .context("Failed to update project usage")?;

    if !args.probation {
        Latest {
            version: key.version.clone(),
        }
        .save(&asset_dir)
        .context("Failed to update latest version")?;
    }

    log_cli_info!(
        "Upload complete",
        files = stats.file_count,
        links = stats.link_count,
        stored = stats.stored_size,
        usage = usage.total,
    );
    println!(
        "Uploaded {}: {} files ({} linked), {} bytes stored",
        key, stats.file_count, stats.link_count, stats.stored_size
    );
    Ok(())
}

/// Dedup index from the asset's latest version, when there is a usable one.
fn dedup_index(registry: &Registry, key: &VersionKey, asset_dir: &Path) -> Option<DedupIndex> {
    let latest = match Latest::load(asset_dir) {
        Ok(latest) => latest?,
        Err(e) => {
            log_cli_warn!("Ignoring unreadable latest pointer", error = e.to_string());
            return None;
        }
    };
    let previous = VersionKey::new(key.project.as_str(), key.asset.as_str(), latest.version);
    match DedupIndex::load(registry.root(), &previous) {
        Ok(index) => {
            log_cli_info!("Deduplicating against previous version", entries = index.len());
            Some(index)
        }
        Err(e) => {
            log_cli_warn!("Previous version has no usable manifest", error = e.to_string());
            None
        }
    }
}

/// Name of the user owning `path`, or the numeric uid when it has none.
fn owner_of(path: &Path) -> Result<String> {
    let uid = fs::metadata(path)
        .with_context(|| format!("Failed to stat {}", path.display()))?
        .uid();
    Ok(match User::from_uid(Uid::from_raw(uid)) {
        Ok(Some(user)) => user.name,
        _ => uid.to_string(),
    })
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}
