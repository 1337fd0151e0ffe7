use tracing::{debug, trace};

use crate::dna::Nucleotide;
use crate::error::invariant_violation;
use crate::mutations::{is_strictly_sorted, Mutation, SequencePosition};
use crate::place::discretize::discretize_mutations;
use crate::place::search::PlacementTarget;
use crate::tree::{Node, NodeId, Tree};
use crate::XxHashMap;

/// The shape of the edit that inserted a sample
#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SpliceKind {
    /// The sample became a new child of the target
    Child,
    /// The sample became a new child of the target's parent
    Sibling,
    /// The target's branch was split by a new internal node holding the shared mutations
    Split,
}

/// Outcome of a splice
#[derive(Clone, Debug)]
pub struct Splice {
    pub kind: SpliceKind,
    /// The new leaf
    pub sample: NodeId,
    /// Parent of the new leaf
    pub parent: NodeId,
    /// The node standing for the target after the edit. Differs from the searched target only after
    /// a split.
    pub target: NodeId,
}

/// Insert a sample leaf at a search target.
///
/// The target must still be live and unchanged since the search; anything else is an internal
/// invariant violation and aborts.
pub(crate) fn splice_sample(tree: &mut Tree, target: PlacementTarget, identifier: String) -> Splice {
    let Some(target_node) = tree.node(target.target) else {
        invariant_violation(format!("placement target {} was retired", target.target));
    };
    if target_node.parent() != target.parent {
        invariant_violation(format!(
            "placement target {} changed its parent since the search",
            target_node.identifier()
        ));
    }
    let has_children = !target_node.is_leaf();
    let is_root = target_node.is_root();

    let splice = if target.target_mutations.is_empty() && (has_children || is_root) {
        let mutations = discretize_mutations(tree, &target.sample_mutations, &[], Some(target.target));
        let sample = attach_leaf(tree, target.target, identifier, mutations);
        Splice {
            kind: SpliceKind::Child,
            sample,
            parent: target.target,
            target: target.target,
        }
    } else if let (true, true, Some(parent)) =
        (target.shared_mutations.is_empty(), has_children, target.parent)
    {
        let mutations = discretize_mutations(tree, &target.sample_mutations, &[], Some(parent));
        let sample = attach_leaf(tree, parent, identifier, mutations);
        Splice {
            kind: SpliceKind::Sibling,
            sample,
            parent,
            target: target.target,
        }
    } else {
        split_branch(tree, target, identifier)
    };

    let mutations = tree[splice.sample].mutations().to_vec();
    let updated = propagate_descendant_alleles(tree, &mutations, splice.parent);
    trace!(updated, "propagated descendant alleles");
    debug!(
        sample = tree[splice.sample].identifier(),
        parent = tree[splice.parent].identifier(),
        kind = ?splice.kind,
        "spliced sample"
    );
    splice
}

fn attach_leaf(tree: &mut Tree, parent: NodeId, identifier: String, mutations: Vec<Mutation>) -> NodeId {
    check_sorted(&identifier, &mutations);
    let level = tree[parent].level() + 1;
    let sample = tree.insert_node(Node::new(identifier, mutations, level, Some(parent)));
    tree.node_mut(parent).children_mut().push(sample);
    sample
}

/// Replace the target by a new internal node carrying the shared mutations, with the rebuilt
/// target and the sample as its two children.
fn split_branch(tree: &mut Tree, target: PlacementTarget, identifier: String) -> Splice {
    let Some(parent) = target.parent else {
        invariant_violation("the root branch cannot be split");
    };
    if !tree[parent].children().contains(&target.target) {
        invariant_violation(format!(
            "node {} is not a child of its recorded parent {}",
            target.target, parent
        ));
    }
    let expected = tree[target.target].mutations().len();
    if target.shared_mutations.len() + target.target_mutations.len() != expected {
        invariant_violation(format!(
            "mutation partition of {} does not cover its branch",
            tree[target.target].identifier()
        ));
    }

    let sample_mutations =
        discretize_mutations(tree, &target.sample_mutations, &target.shared_mutations, Some(parent));
    check_sorted(&identifier, &sample_mutations);

    let level = tree[target.target].level();
    let split_identifier = tree.generate_internal_identifier();
    let target_identifier = tree[target.target].identifier().to_string();
    let condensed = tree.unregister_condensed(&target_identifier);
    let mut retired = tree.retire_node(target.target);

    let split = tree.insert_node(Node::new(
        split_identifier,
        target.shared_mutations,
        level,
        Some(parent),
    ));

    let replacement = tree.insert_node(Node::new(
        target_identifier.clone(),
        target.target_mutations,
        level + 1,
        Some(split),
    ));
    let children = retired.take_children();
    for &child in &children {
        tree.node_mut(child).set_parent(Some(replacement));
    }
    *tree.node_mut(replacement).children_mut() = children;
    tree.set_subtree_levels(replacement, level + 1);

    let sample = tree.insert_node(Node::new(identifier, sample_mutations, level + 1, Some(split)));
    *tree.node_mut(split).children_mut() = vec![replacement, sample];
    tree.replace_child(parent, target.target, split);

    if let Some(members) = condensed {
        tree.register_condensed(&target_identifier, members);
    }

    Splice {
        kind: SpliceKind::Split,
        sample,
        parent: split,
        target: replacement,
    }
}

fn check_sorted(identifier: &str, mutations: &[Mutation]) {
    if !is_strictly_sorted(mutations) {
        invariant_violation(format!(
            "mutations of new node {identifier} are not strictly sorted"
        ));
    }
}

/// Add the mutant alleles of a new leaf to the descendant alleles of the mutations at the same
/// positions on the path from `start` to the root. A position stops propagating at the first
/// ancestor whose descendant alleles already contain it. Returns the number of mutations changed.
pub(crate) fn propagate_descendant_alleles(
    tree: &mut Tree,
    mutations: &[Mutation],
    start: NodeId,
) -> usize {
    let mut pending: XxHashMap<SequencePosition, Nucleotide> = mutations
        .iter()
        .map(|m| (m.position(), m.mutant()))
        .collect();
    let mut updated = 0;

    let mut node = Some(start);
    while let Some(id) = node {
        if pending.is_empty() {
            break;
        }
        for mutation in tree.node_mut(id).mutations_mut() {
            let Some(&alleles) = pending.get(&mutation.position()) else {
                continue;
            };
            if mutation.descendant_alleles() & alleles == alleles {
                pending.remove(&mutation.position());
            } else {
                mutation.set_descendant_alleles(mutation.descendant_alleles() | alleles);
                updated += 1;
            }
        }
        node = tree[id].parent();
    }

    updated
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dna::{ReferenceSequence, NUC_A, NUC_C, NUC_G, NUC_T};
    use crate::mutations::{StagedMutation, StagedMutations};

    fn substitution(position: u32, parent: Nucleotide, mutant: Nucleotide) -> StagedMutation {
        StagedMutation::Substitution {
            chromosome: 0,
            position: position.into(),
            parent,
            mutant,
        }
    }

    /// root -> { a(1T, 2G) -> { a1(3C), a2(4C) } }
    fn tree() -> Tree {
        let mut tree = Tree::new("root", ReferenceSequence::parse(&"A".repeat(10)).unwrap());
        let a = tree.add_child_with_alleles(tree.root(), "a", &[(1, NUC_T), (2, NUC_G)]).unwrap();
        tree.add_child_with_alleles(a, "a1", &[(3, NUC_C)]).unwrap();
        tree.add_child_with_alleles(a, "a2", &[(4, NUC_C)]).unwrap();
        tree.recompute_descendant_alleles();
        tree
    }

    #[test]
    fn split_moves_shared_mutations_up() {
        let mut tree = tree();
        let a = tree.get_node("a").unwrap();
        let [shared, private]: [Mutation; 2] = tree[a].mutations().to_vec().try_into().unwrap();
        let target = PlacementTarget {
            target: a,
            parent: Some(tree.root()),
            level: 1,
            shared_mutations: vec![shared],
            target_mutations: vec![private],
            sample_mutations: StagedMutations::from_sorted(vec![substitution(5, NUC_A, NUC_G)]),
        };
        let splice = splice_sample(&mut tree, target, "s".to_string());

        assert_eq!(splice.kind, SpliceKind::Split);
        assert!(tree.node(a).is_none());
        let split = &tree[splice.parent];
        assert_eq!(split.identifier(), "node_1");
        assert_eq!(split.mutations().len(), 1);
        assert_eq!(split.level(), 1);
        assert_eq!(tree[tree.root()].children(), [splice.parent]);

        let replacement = tree.get_node("a").unwrap();
        assert_eq!(replacement, splice.target);
        assert_eq!(tree[replacement].level(), 2);
        assert_eq!(tree[replacement].mutations()[0].position().unwrap(), 2);
        assert_eq!(tree[replacement].children().len(), 2);
        let a1 = tree.get_node("a1").unwrap();
        assert_eq!(tree[a1].level(), 3);
        assert_eq!(tree[a1].parent(), Some(replacement));

        assert_eq!(tree[splice.sample].branch_length(), 1);
        assert_eq!(tree[splice.sample].level(), 2);
        // 1T is shared by both children now
        assert_eq!(split.mutations()[0].descendant_alleles(), NUC_T);
    }

    #[test]
    fn empty_target_mutations_append_child() {
        let mut tree = tree();
        let a = tree.get_node("a").unwrap();
        let target = PlacementTarget {
            target: a,
            parent: Some(tree.root()),
            level: 1,
            shared_mutations: tree[a].mutations().to_vec(),
            target_mutations: Vec::new(),
            sample_mutations: StagedMutations::from_sorted(vec![substitution(3, NUC_A, NUC_G)]),
        };
        let splice = splice_sample(&mut tree, target, "s".to_string());
        assert_eq!(splice.kind, SpliceKind::Child);
        assert_eq!(tree[a].children().len(), 3);
        assert_eq!(tree[splice.sample].level(), 2);

        // 3C on a1 is not an ancestor of s, so its alleles stay untouched
        let a1 = tree.get_node("a1").unwrap();
        assert_eq!(tree[a1].mutations()[0].descendant_alleles(), NUC_C);
    }

    #[test]
    fn no_shared_mutations_append_sibling() {
        let mut tree = tree();
        let a = tree.get_node("a").unwrap();
        let target = PlacementTarget {
            target: a,
            parent: Some(tree.root()),
            level: 1,
            shared_mutations: Vec::new(),
            target_mutations: tree[a].mutations().to_vec(),
            sample_mutations: StagedMutations::from_sorted(vec![substitution(9, NUC_A, NUC_C)]),
        };
        let splice = splice_sample(&mut tree, target, "s".to_string());
        assert_eq!(splice.kind, SpliceKind::Sibling);
        assert_eq!(splice.parent, tree.root());
        assert_eq!(tree[tree.root()].children().len(), 2);
    }

    #[test]
    fn propagation_stops_at_known_alleles() {
        let mut tree = tree();
        let a2 = tree.get_node("a2").unwrap();
        let a = tree.get_node("a").unwrap();
        let leaf = tree
            .add_child(a2, "leaf", vec![Mutation::new(0, 2.into(), NUC_A, NUC_G, NUC_C)])
            .unwrap();
        let mutations = tree[leaf].mutations().to_vec();

        assert_eq!(propagate_descendant_alleles(&mut tree, &mutations, a2), 1);
        assert_eq!(tree[a].mutations()[1].descendant_alleles(), NUC_G | NUC_C);
        assert_eq!(propagate_descendant_alleles(&mut tree, &mutations, a2), 0);
    }

    #[test]
    #[should_panic(expected = "internal invariant violated")]
    fn stale_target_aborts() {
        let mut tree = tree();
        let a1 = tree.get_node("a1").unwrap();
        let target = PlacementTarget {
            target: a1,
            parent: Some(tree.root()),
            level: 2,
            shared_mutations: Vec::new(),
            target_mutations: Vec::new(),
            sample_mutations: StagedMutations::from_sorted(Vec::new()),
        };
        splice_sample(&mut tree, target, "s".to_string());
    }
}
