//! Shared helpers for engine integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use relic_config::testing::TestEnvironment;
use relic_engine::{
    transfer_directory, Cancellation, DedupIndex, Throttle, WalkError, WalkOptions, WalkTarget,
};
use relic_manifest::{Manifest, Summary, VersionKey};

pub const PROJECT: &str = "pokemon";
pub const ASSET: &str = "ghost";

pub fn key(version: &str) -> VersionKey {
    VersionKey::new(PROJECT, ASSET, version)
}

pub fn target(env: &TestEnvironment, version: &str) -> WalkTarget {
    WalkTarget::new(&env.registry, key(version))
}

pub fn write_summary(env: &TestEnvironment, version: &str, probation: bool) {
    Summary {
        upload_user_id: "gastly".to_string(),
        upload_start: "2024-01-01T00:00:00Z".to_string(),
        upload_finish: "2024-01-01T00:00:01Z".to_string(),
        on_probation: probation.then_some(true),
    }
    .save(&key(version).dir(&env.registry))
    .unwrap();
}

/// Transfer the staging directory into `version`, deduplicating against
/// `last` when given, and record a summary like an uploader would.
pub fn upload(env: &TestEnvironment, version: &str, last: Option<&str>) -> Result<Manifest, WalkError> {
    let options = WalkOptions {
        last_version: last.map(|v| DedupIndex::load(&env.registry, &key(v)).unwrap()),
        ..Default::default()
    };
    let manifest = transfer_directory(
        &env.staging,
        &target(env, version),
        &Cancellation::new(),
        &Throttle::new(2),
        &options,
    )?;
    write_summary(env, version, false);
    Ok(manifest)
}

/// Upload `files` as a fresh staging tree.
pub fn upload_files(
    env: &TestEnvironment,
    version: &str,
    last: Option<&str>,
    files: &[(&str, &[u8])],
) -> Manifest {
    env.reset_staging().unwrap();
    for (path, content) in files {
        env.create_file(path, content).unwrap();
    }
    upload(env, version, last).unwrap()
}

/// Everything observable about a tree: file bytes and symlink targets.
pub fn snapshot(root: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
    let mut out = BTreeMap::new();
    for entry in walkdir::WalkDir::new(root).sort_by_file_name() {
        let entry = entry.unwrap();
        let path = entry.path().to_path_buf();
        let file_type = entry.file_type();
        let content = if file_type.is_symlink() {
            let mut bytes = b"link:".to_vec();
            bytes.extend(fs::read_link(&path).unwrap().to_string_lossy().as_bytes());
            bytes
        } else if file_type.is_file() {
            fs::read(&path).unwrap()
        } else {
            b"dir".to_vec()
        };
        out.insert(path, content);
    }
    out
}
