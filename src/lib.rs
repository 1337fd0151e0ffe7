//! Incremental maximum-parsimony placement of samples into a mutation-annotated tree.
//!
//! A [`tree::Tree`] annotates every branch with the point mutations it carries relative to its
//! parent. [`place::Placer`] inserts new samples one at a time: the sample's mutations are staged,
//! every branch is scored by the number of additional mutations the sample would need there, and
//! the most parsimonious branch is split or extended to hold the new leaf.

use std::collections::{HashMap, HashSet};
use std::hash::BuildHasherDefault;
use twox_hash::XxHash64;

pub mod config;
pub mod dna;
pub mod error;
pub mod io;
pub mod mutations;
pub mod place;
pub mod tree;

pub use config::PlacementConfig;
pub use error::{PlacementError, Result};
pub use place::{PlacementReport, Placer, SampleInput};
pub use tree::{Node, NodeId, Tree};

/// Hash map used for position- and identifier-keyed lookups
pub type XxHashMap<K, V> = HashMap<K, V, BuildHasherDefault<XxHash64>>;

/// Hash set companion of [`XxHashMap`]
pub type XxHashSet<T> = HashSet<T, BuildHasherDefault<XxHash64>>;
