//! Consistency checks run after placements when auditing is enabled.
//!
//! Every check panics through [`invariant_violation`] on failure: a failed audit means the tree
//! was corrupted by this crate, not by its input.

use indexset::BTreeSet;
use tracing::{debug, instrument};

use crate::dna::{Nucleotide, NUC_N};
use crate::error::invariant_violation;
use crate::mutations::{count_substitutions, find_position, is_strictly_sorted, SequencePosition};
use crate::mutations::StagedMutations;
use crate::place::splice::Splice;
use crate::tree::{NodeId, Tree};
use crate::XxHashMap;

/// The expected root-to-leaf state of a sample: every position where its allele differs from the
/// reference, with [`NUC_N`] for positions without information.
pub type SampleTruth = BTreeSet<(SequencePosition, Nucleotide)>;

/// Expected states of all samples placed so far
#[derive(Default)]
pub struct SampleLedger {
    samples: XxHashMap<String, SampleTruth>,
}

impl SampleLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember the state of a sample as it was staged.
    pub fn record(&mut self, name: &str, staged: &StagedMutations) {
        let mut truth = SampleTruth::new();
        for (_, position, _, mutant) in staged.substitutions() {
            truth.insert((position, mutant));
        }
        for (_, start, end) in staged.missing_ranges() {
            for position in start.unwrap()..=end.unwrap() {
                truth.insert((position.into(), NUC_N));
            }
        }
        self.samples.insert(name.to_string(), truth);
    }

    /// Stop checking a sample, e.g. after it was removed from the tree
    pub fn forget(&mut self, name: &str) -> bool {
        self.samples.remove(name).is_some()
    }

    /// Follow a sample to a new name. Returns whether the sample was recorded.
    pub fn rename(&mut self, name: &str, new_name: &str) -> bool {
        match self.samples.remove(name) {
            Some(truth) => {
                self.samples.insert(new_name.to_string(), truth);
                true
            }
            None => false,
        }
    }

    /// Forget every sample that no longer resolves in the tree. Returns how many were dropped.
    pub fn retain_present(&mut self, tree: &Tree) -> usize {
        let before = self.samples.len();
        self.samples.retain(|name, _| tree.contains_identifier(name));
        before - self.samples.len()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&SampleTruth> {
        self.samples.get(name)
    }
}

/// Check the nodes an individual placement touched: the descendant alleles of the sample, its
/// parent, and the rebuilt target.
pub(crate) fn check_placement(tree: &Tree, splice: &Splice) {
    for node in [splice.sample, splice.parent, splice.target] {
        check_descendant_alleles(tree, node);
    }
}

/// Recompute the descendant alleles of a node's mutations from its subtree and compare them to
/// the stored ones.
pub fn check_descendant_alleles(tree: &Tree, node: NodeId) {
    let Some(checked) = tree.node(node) else {
        invariant_violation(format!("audited node {node} was retired"));
    };

    for mutation in checked.mutations() {
        let position = mutation.position();
        let expected = tree
            .preorder(node)
            .filter_map(|id| find_position(tree[id].mutations(), position))
            .fold(0, |alleles, m| alleles | m.mutant());

        if expected != mutation.descendant_alleles() {
            invariant_violation(format!(
                "descendant alleles of {mutation} on {} are {:#x}, subtree has {expected:#x}",
                checked.identifier(),
                mutation.descendant_alleles(),
            ));
        }
    }
}

/// Compare the root-to-leaf state of every recorded sample with its expected state.
#[instrument(skip_all, fields(samples = ledger.len()))]
pub fn check_samples(tree: &Tree, ledger: &SampleLedger) {
    for (name, truth) in &ledger.samples {
        let node = tree
            .get_node(name)
            .or_else(|| tree.condensed_group_of(name))
            .unwrap_or_else(|| invariant_violation(format!("placed sample {name} is not in the tree")));

        let mut state = SampleTruth::new();
        for entry in tree.path_alleles(node, true) {
            state.insert(entry);
        }
        let matches = state.len() == truth.len() && state.iter().zip(truth.iter()).all(|(a, b)| a == b);
        if !matches {
            let missing: Vec<_> = truth.iter().filter(|&entry| !state.contains(entry)).collect();
            let extra: Vec<_> = state.iter().filter(|&entry| !truth.contains(entry)).collect();
            invariant_violation(format!(
                "state of sample {name} diverged: missing {missing:?}, unexpected {extra:?}"
            ));
        }
    }
    debug!("sample states match");
}

/// Check the structural invariants of the whole tree: sorted mutation lists, branch lengths,
/// levels, parent and child links, the identifier index and the nesting of descendant alleles.
#[instrument(skip_all, fields(nodes = tree.len()))]
pub fn check_structure(tree: &Tree) {
    let mut reachable = 0;

    for id in tree.preorder(tree.root()) {
        reachable += 1;
        let node = &tree[id];

        if !is_strictly_sorted(node.mutations()) {
            invariant_violation(format!(
                "duplicate or unsorted position on the branch into {}",
                node.identifier()
            ));
        }
        if node.branch_length() != count_substitutions(node.mutations()) {
            invariant_violation(format!("stale branch length on {}", node.identifier()));
        }
        if tree.get_node(node.identifier()) != Some(id) {
            invariant_violation(format!("identifier {} is not indexed", node.identifier()));
        }

        match node.parent() {
            None if id != tree.root() => {
                invariant_violation(format!("non-root node {} has no parent", node.identifier()))
            }
            None => {}
            Some(parent) => {
                if node.level() != tree[parent].level() + 1 {
                    invariant_violation(format!("inconsistent level on {}", node.identifier()));
                }
            }
        }

        for &child in node.children() {
            if tree[child].parent() != Some(id) {
                invariant_violation(format!(
                    "child {} of {} points to another parent",
                    tree[child].identifier(),
                    node.identifier()
                ));
            }
            for mutation in tree[child].mutations() {
                let Some(above) = find_position(node.mutations(), mutation.position()) else {
                    continue;
                };
                let below = mutation.descendant_alleles();
                if above.descendant_alleles() & below != below {
                    invariant_violation(format!(
                        "descendant alleles of {above} on {} do not cover {mutation} below",
                        node.identifier()
                    ));
                }
            }
        }
    }

    if reachable != tree.len() {
        invariant_violation(format!(
            "{} live nodes but only {reachable} reachable from the root",
            tree.len()
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dna::{ReferenceSequence, NUC_A, NUC_C, NUC_G, NUC_T};
    use crate::mutations::{Mutation, RawMutation};

    fn tree() -> Tree {
        let mut tree = Tree::new("root", ReferenceSequence::parse(&"A".repeat(10)).unwrap());
        let a = tree.add_child_with_alleles(tree.root(), "a", &[(1, NUC_T)]).unwrap();
        tree.add_child_with_alleles(a, "b", &[(1, NUC_G), (2, NUC_C)]).unwrap();
        tree.recompute_descendant_alleles();
        tree
    }

    #[test]
    fn consistent_tree_passes() {
        let tree = tree();
        check_structure(&tree);
        for (id, _) in tree.live_nodes() {
            check_descendant_alleles(&tree, id);
        }
    }

    #[test]
    #[should_panic(expected = "descendant alleles")]
    fn stale_descendant_alleles_are_detected() {
        let mut tree = tree();
        let a = tree.get_node("a").unwrap();
        tree.node_mut(a).mutations_mut()[0].set_descendant_alleles(NUC_T);
        check_descendant_alleles(&tree, a);
    }

    #[test]
    fn recorded_sample_matches_its_leaf() {
        let tree = tree();
        let staged = StagedMutations::stage(
            "b",
            &[
                RawMutation::Substitution {
                    chromosome: 0,
                    position: 1.into(),
                    parent: NUC_A,
                    mutant: NUC_G,
                },
                RawMutation::Substitution {
                    chromosome: 0,
                    position: 2.into(),
                    parent: NUC_A,
                    mutant: NUC_C,
                },
            ],
            tree.reference(),
        )
        .unwrap();
        let mut ledger = SampleLedger::new();
        ledger.record("b", &staged);
        check_samples(&tree, &ledger);
        assert!(ledger.forget("b"));
        assert!(ledger.is_empty());
    }

    #[test]
    #[should_panic(expected = "diverged")]
    fn diverging_sample_is_detected() {
        let tree = tree();
        let staged = StagedMutations::from_sorted(vec![]);
        let mut ledger = SampleLedger::new();
        ledger.record("a", &staged);
        check_samples(&tree, &ledger);
    }

    #[test]
    #[should_panic(expected = "duplicate or unsorted")]
    fn duplicate_positions_are_detected() {
        let mut tree = tree();
        let a = tree.get_node("a").unwrap();
        tree.node_mut(a)
            .mutations_mut()
            .push(Mutation::new(0, 1.into(), NUC_A, NUC_T, NUC_C));
        check_structure(&tree);
    }
}
