use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{PlacementError, Result};

/// Settings of a [`crate::place::Placer`]. Every field has a default, so partial JSON documents
/// are accepted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlacementConfig {
    /// Size of the search thread pool, `0` uses one thread per core
    pub threads: usize,

    /// Run the consistency audit after every placement. Only effective if the crate is built with
    /// the `audit` feature.
    pub audit: bool,

    /// How many staged samples may wait for the tree writer during batch placement
    pub staging_capacity: usize,

    /// The search is split across threads only if the root has at least this many children
    pub parallel_search_min_children: usize,

    /// Skip subtrees that provably contain no optimal placement
    pub prune_search: bool,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            threads: 0,
            audit: false,
            staging_capacity: 64,
            parallel_search_min_children: 2,
            prune_search: true,
        }
    }
}

impl PlacementConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| PlacementError::io(path, e))?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.staging_capacity == 0 {
            return Err(PlacementError::config("staging_capacity must be positive"));
        }
        Ok(())
    }

    /// Enable auditing, for tests
    pub fn with_audit(mut self, audit: bool) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }
}
