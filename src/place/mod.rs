//! Placement of new samples into a [`Tree`].
//!
//! A placement runs in three phases. The sample's mutations are validated and staged against the
//! reference, the tree is searched read-only for every most parsimonious target, and the first
//! target by the tie-break is spliced into the tree. Only the last phase writes, and a [`Placer`]
//! applies placements strictly one after the other, so every search sees the tree as left by all
//! previous placements.

use std::cell::RefCell;
use std::time::Instant;

use rayon::{ThreadPool, ThreadPoolBuilder};
use thread_local::ThreadLocal;
use tracing::{debug, info, info_span, warn};

use crate::config::PlacementConfig;
use crate::dna::ReferenceSequence;
use crate::error::{invariant_violation, PlacementError, Result};
use crate::mutations::{RawMutation, StagedMutations};
use crate::tree::{NodeId, Tree};
use crate::XxHashSet;

#[cfg(feature = "audit")]
pub mod audit;
mod discretize;
pub mod search;
pub mod splice;

pub use search::{PlacementTarget, SearchOptions, SearchResult, SearchWorkspace};
pub use splice::{Splice, SpliceKind};

/// A sample to place: its unique name and its records relative to the reference.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SampleInput {
    pub name: String,
    pub mutations: Vec<RawMutation>,
}

impl SampleInput {
    pub fn new(name: impl Into<String>, mutations: Vec<RawMutation>) -> Self {
        Self {
            name: name.into(),
            mutations,
        }
    }
}

/// A validated sample, ready for the search
#[derive(Clone, Debug)]
pub struct StagedSample {
    pub name: String,
    pub mutations: StagedMutations,
}

impl StagedSample {
    /// Validate a sample against the reference.
    pub fn stage(reference: &ReferenceSequence, sample: SampleInput) -> Result<Self> {
        let mutations = StagedMutations::stage(&sample.name, &sample.mutations, reference)?;
        Ok(Self {
            name: sample.name,
            mutations,
        })
    }
}

/// What a successful placement did
#[derive(Clone, Debug)]
pub struct PlacementReport {
    pub sample: String,
    /// The new leaf
    pub node: NodeId,
    /// Parent of the new leaf
    pub parent: NodeId,
    pub kind: SpliceKind,
    /// Substitutions the sample added to the tree
    pub parsimony: u32,
    /// Number of equally parsimonious targets the search found
    pub target_count: usize,
    /// Branch length of the new leaf. Equals `parsimony`.
    pub branch_length: u32,
}

/// Outcome of a batch: the placed samples in input order and the abandoned ones with their error.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub placed: Vec<PlacementReport>,
    pub abandoned: Vec<(String, PlacementError)>,
}

impl BatchReport {
    pub fn is_complete(&self) -> bool {
        self.abandoned.is_empty()
    }
}

/// Places samples into trees.
///
/// The placer owns the search thread pool and the per-thread search workspaces, which are reused
/// across placements.
pub struct Placer {
    config: PlacementConfig,
    pool: ThreadPool,
    workspaces: ThreadLocal<RefCell<SearchWorkspace>>,
    #[cfg(feature = "audit")]
    ledger: audit::SampleLedger,
}

impl Placer {
    pub fn new(config: PlacementConfig) -> Result<Self> {
        config.validate()?;
        let pool = ThreadPoolBuilder::new()
            .num_threads(config.threads)
            .thread_name(|i| format!("libmat-search-{i}"))
            .build()
            .map_err(|e| PlacementError::config(format!("cannot build search pool: {e}")))?;
        debug!(threads = pool.current_num_threads(), "placer ready");

        Ok(Self {
            config,
            pool,
            workspaces: ThreadLocal::new(),
            #[cfg(feature = "audit")]
            ledger: audit::SampleLedger::new(),
        })
    }

    pub fn config(&self) -> &PlacementConfig {
        &self.config
    }

    /// Expected states of the samples placed with auditing enabled
    #[cfg(feature = "audit")]
    pub fn ledger(&self) -> &audit::SampleLedger {
        &self.ledger
    }

    /// Mutable access to the ledger, for callers that edit placed samples directly on the tree
    #[cfg(feature = "audit")]
    pub fn ledger_mut(&mut self) -> &mut audit::SampleLedger {
        &mut self.ledger
    }

    /// Remove a node and its subtree, and stop auditing the samples that went with it.
    pub fn remove_sample(&mut self, tree: &mut Tree, identifier: &str) -> Result<()> {
        tree.remove_node(identifier)?;
        #[cfg(feature = "audit")]
        {
            let forgotten = self.ledger.retain_present(tree);
            debug!(identifier, forgotten, "removed sample");
        }
        Ok(())
    }

    /// Rename a node, and audit a placed sample under its new name.
    pub fn rename_sample(
        &mut self,
        tree: &mut Tree,
        identifier: &str,
        new_identifier: &str,
    ) -> Result<()> {
        tree.rename_node(identifier, new_identifier)?;
        #[cfg(feature = "audit")]
        self.ledger.rename(identifier, new_identifier);
        Ok(())
    }

    /// Search the tree for the most parsimonious targets of a staged sample without changing it.
    pub fn search(&self, tree: &Tree, sample: &StagedMutations) -> SearchResult {
        let options = SearchOptions {
            parallel_min_children: self.config.parallel_search_min_children,
            prune: self.config.prune_search,
        };
        self.pool
            .install(|| search::find_targets(tree, sample, &self.workspaces, options))
    }

    /// Place a single sample.
    ///
    /// # Errors
    /// Returns the staging errors of [`StagedMutations::stage`], and
    /// [`PlacementError::DuplicateSample`] if the name is already used in the tree. The tree is
    /// left unchanged in both cases.
    pub fn place_sample(&mut self, tree: &mut Tree, sample: SampleInput) -> Result<PlacementReport> {
        let staged = StagedSample::stage(tree.reference(), sample)?;
        self.place_staged(tree, staged)
    }

    /// Place an already staged sample.
    pub fn place_staged(&mut self, tree: &mut Tree, sample: StagedSample) -> Result<PlacementReport> {
        if tree.contains_identifier(&sample.name) {
            return Err(PlacementError::DuplicateSample(sample.name));
        }
        let start = Instant::now();

        let result = info_span!("search", sample = %sample.name)
            .in_scope(|| self.search(tree, &sample.mutations));
        let target_count = result.targets.len();
        let parsimony = result.parsimony;
        let Some(target) = result.targets.into_iter().next() else {
            invariant_violation(format!("search for {} returned no target", sample.name));
        };

        let splice = info_span!("splice", sample = %sample.name)
            .in_scope(|| splice::splice_sample(tree, target, sample.name.clone()));

        #[cfg(feature = "audit")]
        if self.config.audit {
            self.ledger.record(&sample.name, &sample.mutations);
            audit::check_placement(tree, &splice);
            audit::check_structure(tree);
            audit::check_samples(tree, &self.ledger);
        }

        let branch_length = tree[splice.sample].branch_length();
        if branch_length != parsimony {
            invariant_violation(format!(
                "sample {} received branch length {branch_length}, search scored {parsimony}",
                sample.name
            ));
        }

        info!(
            sample = %sample.name,
            parsimony,
            targets = target_count,
            kind = ?splice.kind,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "placed sample"
        );

        Ok(PlacementReport {
            sample: sample.name,
            node: splice.sample,
            parent: splice.parent,
            kind: splice.kind,
            parsimony,
            target_count,
            branch_length,
        })
    }

    /// Place samples in input order.
    ///
    /// Samples are staged on a separate thread while the tree is being edited, and handed to the
    /// writer through a bounded channel of `staging_capacity` entries. A sample that fails staging
    /// or placement is abandoned and reported; the remaining samples are still placed.
    pub fn place_batch(&mut self, tree: &mut Tree, samples: Vec<SampleInput>) -> BatchReport {
        let reference = tree.shared_reference();
        let (sender, receiver) = flume::bounded(self.config.staging_capacity);
        let mut report = BatchReport::default();
        let start = Instant::now();

        std::thread::scope(|scope| {
            scope.spawn(move || {
                let mut seen = XxHashSet::default();
                for sample in samples {
                    let staged = if !seen.insert(sample.name.clone()) {
                        Err((sample.name.clone(), PlacementError::DuplicateSample(sample.name)))
                    } else {
                        let name = sample.name.clone();
                        StagedSample::stage(&reference, sample).map_err(|e| (name, e))
                    };
                    if sender.send(staged).is_err() {
                        break;
                    }
                }
            });

            for staged in receiver.iter() {
                let placed = staged.and_then(|sample| {
                    let name = sample.name.clone();
                    self.place_staged(tree, sample).map_err(|e| (name, e))
                });
                match placed {
                    Ok(placement) => report.placed.push(placement),
                    Err((name, error)) => {
                        warn!(sample = %name, %error, "abandoned sample");
                        report.abandoned.push((name, error));
                    }
                }
            }
        });

        info!(
            placed = report.placed.len(),
            abandoned = report.abandoned.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "batch finished"
        );
        report
    }
}
