//! Per-version, per-asset and per-project bookkeeping files.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{read_json, write_json_atomic, Result, LATEST_FILE, SUMMARY_FILE, USAGE_FILE};

/// Upload provenance stored in `<version>/..summary`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub upload_user_id: String,
    /// RFC 3339 timestamp
    pub upload_start: String,
    /// RFC 3339 timestamp
    pub upload_finish: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_probation: Option<bool>,
}

impl Summary {
    /// Probational versions may not be linked into nor promoted to latest.
    pub fn is_probational(&self) -> bool {
        self.on_probation.unwrap_or(false)
    }

    pub fn load(version_dir: &Path) -> Result<Self> {
        read_json(&version_dir.join(SUMMARY_FILE))
    }

    pub fn save(&self, version_dir: &Path) -> Result<()> {
        write_json_atomic(&version_dir.join(SUMMARY_FILE), self)
    }
}

/// Running byte total of a project, stored in `<project>/..usage`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub total: u64,
}

impl Usage {
    /// Load the usage of a project; a project without one has used nothing.
    pub fn load(project_dir: &Path) -> Result<Self> {
        match read_json(&project_dir.join(USAGE_FILE)) {
            Ok(usage) => Ok(usage),
            Err(e) if e.is_not_found() => Ok(Self::default()),
            Err(e) => Err(e),
        }
    }

    pub fn save(&self, project_dir: &Path) -> Result<()> {
        write_json_atomic(&project_dir.join(USAGE_FILE), self)
    }

    /// Read-modify-write the usage file. Callers hold the project lock.
    pub fn adjust(project_dir: &Path, delta: i64) -> Result<Self> {
        let mut usage = Self::load(project_dir)?;
        usage.total = if delta >= 0 {
            usage.total.saturating_add(delta as u64)
        } else {
            usage.total.saturating_sub(delta.unsigned_abs())
        };
        usage.save(project_dir)?;
        Ok(usage)
    }
}

/// Pointer to the current version of an asset, stored in `<asset>/..latest`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Latest {
    pub version: String,
}

impl Latest {
    pub fn load(asset_dir: &Path) -> Result<Option<Self>> {
        match read_json(&asset_dir.join(LATEST_FILE)) {
            Ok(latest) => Ok(Some(latest)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn save(&self, asset_dir: &Path) -> Result<()> {
        write_json_atomic(&asset_dir.join(LATEST_FILE), self)
    }
}
