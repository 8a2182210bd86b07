//! # relic-engine
//!
//! Directory materialization and link-integrity engine for the relic registry.
//!
//! ## Components
//!
//! - [`Throttle`]: bounded token pool limiting concurrent per-file work
//! - [`walker`]: three-pass tree walk producing (transfer), reproducing
//!   (reindex) or checking (validate) a version manifest
//! - [`resolver`]: symlink classification and relative link targets
//! - [`reroute`]: repair of link chains before files are deleted
//!
//! ## Pass ordering
//!
//! ```text
//! classify (parallel) ─▶ materialize (parallel, transfer only) ─▶ resolve local links (sequential)
//! ```
//!
//! Dedup never hashes into a store: identical content is expressed as a
//! relative symlink to the older version's file, and the manifest records
//! the immediate target plus the oldest ancestor.

pub mod cache;
pub mod cancel;
pub mod materialize;
pub mod reroute;
pub mod resolver;
pub mod throttle;
mod validate;
pub mod walker;

pub use cache::ManifestCache;
pub use cancel::Cancellation;
pub use reroute::{list_versions, reroute_links, DeletionSet, RerouteAction, RerouteError};
pub use throttle::{default_thread_count, Throttle, ThrottlePermit, ThrottleToken};
pub use walker::{
    reindex_directory, transfer_directory, validate_directory, walk_directory, DedupIndex,
    WalkMode, WalkOptions, WalkTarget,
};

use std::io;
use std::path::PathBuf;

use relic_manifest::ManifestError;
use thiserror::Error;

/// Errors raised by a directory walk
#[derive(Error, Debug)]
pub enum WalkError {
    /// Disallowed or malformed entry in the source tree
    #[error("{path}: {reason}")]
    Classify { path: String, reason: String },

    #[error("{path}: cannot link to '{target}', which is on probation")]
    Probation { path: String, target: String },

    #[error("{path}: cyclic symbolic link")]
    CyclicLink { path: String },

    #[error("{path}: cannot link into the version being written ('{target}')")]
    LinkIntoSelf { path: String, target: String },

    /// On-disk state disagrees with the stored manifest or sidecars
    #[error("{path}: {reason}")]
    Consistency { path: String, reason: String },

    #[error("{path}: checksum mismatch after transfer (expected {expected}, got {actual})")]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("failed to build worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error("operation cancelled")]
    Cancelled,
}

impl WalkError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        WalkError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn classify(path: impl Into<String>, reason: impl Into<String>) -> Self {
        WalkError::Classify {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn consistency(path: impl Into<String>, reason: impl Into<String>) -> Self {
        WalkError::Consistency {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, WalkError>;
