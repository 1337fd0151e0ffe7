//! Error types of the placement engine.
//!
//! Errors caused by input data are reported as [`PlacementError`] and abandon only the operation
//! that raised them. Violated internal invariants are not errors: they abort through
//! [`invariant_violation`], because continuing would corrupt the shared tree for every later
//! placement.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlacementError {
    /// Sample records that cannot be staged (unsorted, overlapping, non one-hot alleles)
    #[error("malformed sample {sample}: {message}")]
    MalformedSample { sample: String, message: String },

    /// A sample or node identifier that is already present in the tree
    #[error("identifier {0} is already present in the tree")]
    DuplicateSample(String),

    /// A caller-supplied identifier that does not resolve to a node
    #[error("node {0} does not exist in the tree")]
    UnknownNode(String),

    /// A structural edit that was rejected before touching the tree
    #[error("invalid tree edit: {message}")]
    InvalidEdit { message: String },

    #[error("position {position} of sample {sample} lies outside the reference (length {reference_len})")]
    PositionOutOfRange {
        sample: String,
        position: u32,
        reference_len: usize,
    },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {message}")]
    Config { message: String },
}

pub type Result<T> = std::result::Result<T, PlacementError>;

impl PlacementError {
    pub fn malformed(sample: impl Into<String>, message: impl Into<String>) -> Self {
        Self::MalformedSample {
            sample: sample.into(),
            message: message.into(),
        }
    }

    pub fn invalid_edit(message: impl Into<String>) -> Self {
        Self::InvalidEdit {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Abort on a broken internal invariant of the tree or the placement bookkeeping.
#[cold]
#[track_caller]
pub fn invariant_violation(message: impl AsRef<str>) -> ! {
    let message = message.as_ref();
    tracing::error!(message, "internal invariant violated");
    panic!("internal invariant violated: {message}")
}
