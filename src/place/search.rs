//! Read-only search for the most parsimonious placements of a sample.
//!
//! The search walks the tree depth-first and keeps, for the node it currently visits, the set of
//! positions at which the sample differs from the node's state. Entering a node applies the
//! mutations of its branch to this set, leaving it restores the previous state from an undo log,
//! so every node is scored in time proportional to its own mutations. The cost of a state is the
//! number of differences whose alleles are disjoint, i.e. the branch length the sample would get
//! if it were attached there.
//!
//! A difference whose sample allele does not occur among the descendant alleles of the mutation
//! that created it cannot be resolved anywhere below that mutation. These settled differences
//! bound the cost of every placement in the subtree, which is skipped once the bound exceeds the
//! best cost found so far.
//!
//! The root's subtrees are searched in parallel. Each worker thread keeps its scratch state in a
//! [`SearchWorkspace`] that is reused across samples.

use std::cell::RefCell;

use rayon::prelude::*;
use thread_local::ThreadLocal;
use tracing::debug;

use crate::dna::{Nucleotide, NUC_N};
use crate::error::invariant_violation;
use crate::mutations::{Mutation, SequencePosition, StagedMutation, StagedMutations};
use crate::tree::{Node, NodeId, Tree};
use crate::XxHashMap;

/// A placement the search considers optimal, with the partition of mutations the splice needs.
#[derive(Clone, Debug)]
pub struct PlacementTarget {
    /// The node whose branch is split, or that receives the sample as a new child
    pub target: NodeId,
    /// Parent of `target`, `None` for the root
    pub parent: Option<NodeId>,
    /// Level of `target` at search time
    pub level: u32,
    /// Mutations of the target branch that the sample shares. They move to the split node.
    pub shared_mutations: Vec<Mutation>,
    /// Mutations of the target branch that the sample does not share. They stay on the target.
    pub target_mutations: Vec<Mutation>,
    /// Mutations of the sample relative to the state its new parent will have
    pub sample_mutations: StagedMutations,
}

/// All globally optimal placements, ordered by the tie-break: shallowest target first, then
/// pre-order position of the target.
#[derive(Clone, Debug)]
pub struct SearchResult {
    pub targets: Vec<PlacementTarget>,
    /// Number of substitutions the sample adds to the tree at any of the targets
    pub parsimony: u32,
    /// Number of subtrees skipped because they could not contain an optimal placement
    pub pruned: usize,
}

/// Tuning of [`find_targets`]
#[derive(Copy, Clone, Debug)]
pub struct SearchOptions {
    /// Search the root's subtrees in parallel only if the root has at least this many children
    pub parallel_min_children: usize,
    /// Skip subtrees whose settled differences exceed the best cost found so far
    pub prune: bool,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            parallel_min_children: 2,
            prune: true,
        }
    }
}

/// How the sample is attached at a candidate node.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum Attachment {
    /// As a new child of the node
    Child,
    /// By splitting the branch into the node
    Split,
}

/// Pre-order position of a node, as (index of root subtree + 1, position within that subtree).
/// The root itself is `(0, 0)`. Ordering ranks matches a sequential pre-order traversal, no matter
/// how the subtrees were scheduled.
type Rank = (u32, u32);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct Candidate {
    cost: u32,
    level: u32,
    rank: Rank,
    target: NodeId,
    attachment: Attachment,
}

impl Candidate {
    fn sort_key(&self) -> (u32, u32, Rank, Attachment) {
        (self.cost, self.level, self.rank, self.attachment)
    }
}

/// Candidates of minimal cost seen so far
#[derive(Default)]
struct Candidates {
    best: Option<u32>,
    list: Vec<Candidate>,
    pruned: usize,
}

impl Candidates {
    /// No candidates yet, but none worse than `cost` is of interest
    fn bounded(cost: u32) -> Self {
        Self {
            best: Some(cost),
            ..Self::default()
        }
    }

    fn offer(&mut self, candidate: Candidate) {
        match self.best {
            Some(best) if candidate.cost > best => {}
            Some(best) if candidate.cost == best => self.list.push(candidate),
            _ => {
                self.best = Some(candidate.cost);
                self.list.clear();
                self.list.push(candidate);
            }
        }
    }

    fn merge(mut self, other: Candidates) -> Candidates {
        self.pruned += other.pruned;
        for candidate in other.list {
            self.offer(candidate);
        }
        self
    }

    fn finish(mut self) -> Vec<Candidate> {
        self.list.sort_by_key(Candidate::sort_key);
        self.list
            .dedup_by_key(|candidate| (candidate.target, candidate.attachment));
        self.list
    }
}

/// Difference between the sample and a node state at one position
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct Difference {
    chromosome: u8,
    node: Nucleotide,
    sample: Nucleotide,
    /// Counted, and stays counted in the whole subtree below the current node
    settled: bool,
}

impl Difference {
    /// Whether the difference costs a substitution
    #[inline]
    fn counts(&self) -> bool {
        self.node & self.sample == 0
    }
}

/// How a branch mutation relates to the sample
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Relation {
    /// The sample has no information at the position
    Missing,
    /// The sample carries the mutant allele
    Shared,
    /// The sample does not carry the mutant allele
    Private,
}

/// Summary of entering a node: what the branch has in common with the sample
struct BranchSummary {
    /// Counted differences that the shared mutations resolve
    resolved: u32,
    has_shared: bool,
    has_private: bool,
}

enum Visit {
    Enter { node: NodeId, parent_rank: Rank },
    Exit {
        undo_len: usize,
        cost: u32,
        settled: u32,
    },
}

/// Per-thread scratch state of the search
#[derive(Default)]
pub struct SearchWorkspace {
    differences: XxHashMap<SequencePosition, Difference>,
    undo: Vec<(SequencePosition, Option<Difference>)>,
    cost: u32,
    settled: u32,
    stack: Vec<Visit>,
}

impl SearchWorkspace {
    /// Start from the reference state
    fn reset(&mut self, sample: &StagedMutations) {
        self.differences.clear();
        self.undo.clear();
        self.stack.clear();
        self.cost = 0;
        self.settled = 0;
        for (chromosome, position, parent, mutant) in sample.substitutions() {
            self.set(
                position,
                Some(Difference {
                    chromosome,
                    node: parent,
                    sample: mutant,
                    settled: false,
                }),
            );
        }
        self.undo.clear();
    }

    fn snapshot(&self) -> Vec<(SequencePosition, Difference)> {
        self.differences.iter().map(|(&p, &d)| (p, d)).collect()
    }

    fn restore(&mut self, snapshot: &[(SequencePosition, Difference)], cost: u32) {
        self.differences.clear();
        self.differences.extend(snapshot.iter().copied());
        self.undo.clear();
        self.stack.clear();
        self.cost = cost;
        self.settled = snapshot.iter().filter(|(_, d)| d.settled).count() as u32;
    }

    fn set(&mut self, position: SequencePosition, difference: Option<Difference>) {
        let old = match difference {
            Some(difference) => self.differences.insert(position, difference),
            None => self.differences.remove(&position),
        };
        if old.is_some_and(|d| d.counts()) {
            self.cost -= 1;
        }
        if difference.is_some_and(|d| d.counts()) {
            self.cost += 1;
        }
        if old.is_some_and(|d| d.settled) {
            self.settled -= 1;
        }
        if difference.is_some_and(|d| d.settled) {
            self.settled += 1;
        }
        self.undo.push((position, old));
    }

    fn rollback(&mut self, undo_len: usize, cost: u32, settled: u32) {
        while self.undo.len() > undo_len {
            if let Some((position, old)) = self.undo.pop() {
                match old {
                    Some(difference) => self.differences.insert(position, difference),
                    None => self.differences.remove(&position),
                };
            }
        }
        self.cost = cost;
        self.settled = settled;
    }

    fn relation(&self, mutation: &Mutation, sample: &StagedMutations) -> Relation {
        if sample.is_missing(mutation.position()) {
            return Relation::Missing;
        }
        let allele = self.sample_allele(mutation);
        if mutation.mutant() != NUC_N && allele == mutation.mutant() {
            Relation::Shared
        } else {
            Relation::Private
        }
    }

    /// Sample allele at the position of a mutation, given the state above the mutation's branch
    fn sample_allele(&self, mutation: &Mutation) -> Nucleotide {
        self.differences
            .get(&mutation.position())
            .map(|d| d.sample)
            .unwrap_or(mutation.parent())
    }

    /// Move the state from a node's parent to the node.
    fn enter(&mut self, node: &Node, sample: &StagedMutations) -> BranchSummary {
        let mut summary = BranchSummary {
            resolved: 0,
            has_shared: false,
            has_private: false,
        };

        for mutation in node.mutations() {
            let position = mutation.position();
            match self.relation(mutation, sample) {
                Relation::Missing => summary.has_shared = true,
                Relation::Shared => {
                    summary.has_shared = true;
                    if let Some(difference) = self.differences.get(&position).copied() {
                        if difference.counts() {
                            summary.resolved += 1;
                        }
                        self.set(position, None);
                    }
                }
                Relation::Private => {
                    summary.has_private = true;
                    let allele = self.sample_allele(mutation);
                    let mut difference = Difference {
                        chromosome: mutation.chromosome(),
                        node: mutation.mutant(),
                        sample: allele,
                        settled: false,
                    };
                    difference.settled =
                        difference.counts() && mutation.descendant_alleles() & allele == 0;
                    self.set(position, Some(difference));
                }
            }
        }

        summary
    }

    /// Set the state to the one of `node` by applying every branch from the root down.
    fn move_to(&mut self, tree: &Tree, sample: &StagedMutations, node: NodeId) {
        self.reset(sample);
        let mut path: Vec<NodeId> = tree.ancestors(node, true).collect();
        path.reverse();
        for ancestor in path {
            self.enter(&tree[ancestor], sample);
        }
        self.undo.clear();
    }

    /// The sample's mutations relative to the current state, leaving out the given positions.
    fn staged_differences(
        &self,
        sample: &StagedMutations,
        excluded: &[SequencePosition],
    ) -> StagedMutations {
        let mut records: Vec<StagedMutation> = self
            .differences
            .iter()
            .filter(|(position, _)| excluded.binary_search(*position).is_err())
            .map(|(&position, difference)| StagedMutation::Substitution {
                chromosome: difference.chromosome,
                position,
                parent: difference.node,
                mutant: difference.sample,
            })
            .collect();
        records.extend(sample.missing_ranges().map(|(chromosome, start, end)| {
            StagedMutation::Missing {
                chromosome,
                start,
                end,
            }
        }));
        records.sort_by_key(|record| record.position());
        StagedMutations::from_sorted(records)
    }
}

/// Find every placement of minimal parsimony cost for a staged sample.
///
/// The tree is only read, and its descendant alleles must be up to date (see
/// [`Tree::recompute_descendant_alleles`]). If the root has at least
/// `options.parallel_min_children` children, its subtrees are searched on the current rayon pool.
pub fn find_targets(
    tree: &Tree,
    sample: &StagedMutations,
    workspaces: &ThreadLocal<RefCell<SearchWorkspace>>,
    options: SearchOptions,
) -> SearchResult {
    let root = tree.root();

    let (root_state, root_cost) = {
        let mut workspace = workspaces.get_or_default().borrow_mut();
        workspace.reset(sample);
        workspace.enter(&tree[root], sample);
        (workspace.snapshot(), workspace.cost)
    };

    let mut candidates = Candidates::default();
    candidates.offer(Candidate {
        cost: root_cost,
        level: 0,
        rank: (0, 0),
        target: root,
        attachment: Attachment::Child,
    });

    let search = |(branch, &child): (usize, &NodeId)| {
        let mut workspace = workspaces.get_or_default().borrow_mut();
        workspace.restore(&root_state, root_cost);
        let mut local = Candidates::bounded(root_cost);
        search_subtree(
            tree,
            sample,
            &mut workspace,
            child,
            branch as u32 + 1,
            options.prune,
            &mut local,
        );
        local
    };

    let children = tree[root].children();
    let subtrees = if children.len() >= options.parallel_min_children.max(1) {
        children
            .par_iter()
            .enumerate()
            .map(search)
            .reduce(Candidates::default, Candidates::merge)
    } else {
        children
            .iter()
            .enumerate()
            .map(search)
            .fold(Candidates::default(), Candidates::merge)
    };
    let candidates = candidates.merge(subtrees);

    let parsimony = candidates
        .best
        .unwrap_or_else(|| invariant_violation("search produced no candidate"));
    let pruned = candidates.pruned;
    let candidates = candidates.finish();
    debug!(parsimony, targets = candidates.len(), pruned, "search finished");

    let mut workspace = workspaces.get_or_default().borrow_mut();
    let targets = candidates
        .iter()
        .map(|candidate| annotate(tree, sample, candidate, &mut workspace))
        .collect();

    SearchResult {
        targets,
        parsimony,
        pruned,
    }
}

/// Score every node of the subtree rooted at `start`, whose parent state the workspace holds.
/// With `prune`, the children of a node are skipped if its settled differences exceed the best
/// cost in `candidates`.
fn search_subtree(
    tree: &Tree,
    sample: &StagedMutations,
    workspace: &mut SearchWorkspace,
    start: NodeId,
    branch: u32,
    prune: bool,
    candidates: &mut Candidates,
) {
    let mut counter = 0;
    workspace.stack.clear();
    workspace.stack.push(Visit::Enter {
        node: start,
        parent_rank: (0, 0),
    });

    while let Some(visit) = workspace.stack.pop() {
        let (id, parent_rank) = match visit {
            Visit::Exit {
                undo_len,
                cost,
                settled,
            } => {
                workspace.rollback(undo_len, cost, settled);
                continue;
            }
            Visit::Enter { node, parent_rank } => (node, parent_rank),
        };

        let rank = (branch, counter);
        counter += 1;

        let node = &tree[id];
        let Some(parent) = node.parent() else {
            invariant_violation(format!("non-root node {id} has no parent"));
        };
        let undo_len = workspace.undo.len();
        let parent_cost = workspace.cost;
        let parent_settled = workspace.settled;
        let summary = workspace.enter(node, sample);

        let candidate = if !summary.has_shared {
            // nothing to split off, equivalent to a new child of the parent
            Candidate {
                cost: parent_cost,
                level: node.level().saturating_sub(1),
                rank: parent_rank,
                target: parent,
                attachment: Attachment::Child,
            }
        } else if !summary.has_private && !node.is_leaf() {
            Candidate {
                cost: workspace.cost,
                level: node.level(),
                rank,
                target: id,
                attachment: Attachment::Child,
            }
        } else {
            Candidate {
                cost: parent_cost - summary.resolved,
                level: node.level(),
                rank,
                target: id,
                attachment: Attachment::Split,
            }
        };
        candidates.offer(candidate);

        workspace.stack.push(Visit::Exit {
            undo_len,
            cost: parent_cost,
            settled: parent_settled,
        });
        let bound = candidates.best.unwrap_or(u32::MAX);
        if prune && !node.is_leaf() && workspace.settled > bound {
            candidates.pruned += 1;
            continue;
        }
        workspace
            .stack
            .extend(node.children().iter().rev().map(|&child| Visit::Enter {
                node: child,
                parent_rank: rank,
            }));
    }
}

/// Compute the mutation partition for a candidate.
fn annotate(
    tree: &Tree,
    sample: &StagedMutations,
    candidate: &Candidate,
    workspace: &mut SearchWorkspace,
) -> PlacementTarget {
    let target = &tree[candidate.target];
    let target_result = match candidate.attachment {
        Attachment::Child => {
            workspace.move_to(tree, sample, candidate.target);
            PlacementTarget {
                target: candidate.target,
                parent: target.parent(),
                level: target.level(),
                shared_mutations: target.mutations().to_vec(),
                target_mutations: Vec::new(),
                sample_mutations: workspace.staged_differences(sample, &[]),
            }
        }
        Attachment::Split => {
            let Some(parent) = target.parent() else {
                invariant_violation("the root branch cannot be split");
            };
            workspace.move_to(tree, sample, parent);

            let (shared, private): (Vec<&Mutation>, Vec<&Mutation>) = target
                .mutations()
                .iter()
                .partition(|m| workspace.relation(m, sample) != Relation::Private);
            let excluded: Vec<SequencePosition> = shared.iter().map(|m| m.position()).collect();

            PlacementTarget {
                target: candidate.target,
                parent: Some(parent),
                level: target.level(),
                shared_mutations: shared.into_iter().cloned().collect(),
                target_mutations: private.into_iter().cloned().collect(),
                sample_mutations: workspace.staged_differences(sample, &excluded),
            }
        }
    };

    debug_assert_eq!(
        target_result
            .sample_mutations
            .substitutions()
            .filter(|&(_, _, parent, mutant)| parent & mutant == 0)
            .count() as u32,
        candidate.cost
    );
    target_result
}
