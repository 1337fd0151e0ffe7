//! Read-only traversal primitives over a [`Tree`].
//!
//! All iterators borrow the tree immutably, are finite, and can be restarted by cloning them
//! before consumption or by requesting a new one.

use std::collections::VecDeque;

use crate::dna::Nucleotide;
use crate::mutations::{Mutation, SequencePosition};
use crate::tree::{NodeId, Tree};
use crate::XxHashMap;

/// Depth-first pre-order iterator. Children are visited in child-list order.
#[derive(Clone)]
pub struct PreOrder<'t> {
    tree: &'t Tree,
    stack: Vec<NodeId>,
}

impl Iterator for PreOrder<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        self.stack
            .extend(self.tree[node].children().iter().rev().copied());
        Some(node)
    }
}

/// Breadth-first (level-order) iterator.
#[derive(Clone)]
pub struct LevelOrder<'t> {
    tree: &'t Tree,
    queue: VecDeque<NodeId>,
}

impl Iterator for LevelOrder<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.queue.pop_front()?;
        self.queue.extend(self.tree[node].children().iter().copied());
        Some(node)
    }
}

/// Walks from a node up to the root (inclusive).
#[derive(Clone)]
pub struct Ancestors<'t> {
    tree: &'t Tree,
    next: Option<NodeId>,
}

impl Iterator for Ancestors<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.next?;
        self.next = self.tree[node].parent();
        Some(node)
    }
}

impl Tree {
    /// Pre-order traversal of the subtree rooted at `start`
    pub fn preorder(&self, start: NodeId) -> PreOrder<'_> {
        PreOrder {
            tree: self,
            stack: vec![start],
        }
    }

    /// Level-order traversal of the subtree rooted at `start`
    pub fn level_order(&self, start: NodeId) -> LevelOrder<'_> {
        LevelOrder {
            tree: self,
            queue: VecDeque::from([start]),
        }
    }

    /// The path from `start` to the root. `include_start` decides whether `start` itself is the
    /// first element.
    pub fn ancestors(&self, start: NodeId, include_start: bool) -> Ancestors<'_> {
        let next = if include_start {
            Some(start)
        } else {
            self[start].parent()
        };
        Ancestors { tree: self, next }
    }

    /// Lowest common ancestor of two nodes given by identifier. A node is its own ancestor, so the
    /// lowest common ancestor of a node and one of its descendants is the node itself.
    pub fn lca(&self, first: &str, second: &str) -> Option<NodeId> {
        let mut a = self.get_node(first)?;
        let mut b = self.get_node(second)?;

        while self[a].level() > self[b].level() {
            a = self[a].parent()?;
        }
        while self[b].level() > self[a].level() {
            b = self[b].parent()?;
        }
        while a != b {
            a = self[a].parent()?;
            b = self[b].parent()?;
        }
        Some(a)
    }

    /// Whether `ancestor` lies on the path from `node` to the root (a node is its own ancestor)
    pub fn is_ancestor(&self, ancestor: NodeId, node: NodeId) -> bool {
        self.ancestors(node, true).any(|n| n == ancestor)
    }

    /// Leaf nodes of the subtree rooted at `start`
    pub fn leaves(&self, start: NodeId) -> Vec<NodeId> {
        self.preorder(start)
            .filter(|&node| self[node].is_leaf())
            .collect()
    }

    /// Identifiers of the leaves below `start`. Condensed group representatives are expanded
    /// into their members.
    pub fn leaf_ids(&self, start: NodeId) -> Vec<String> {
        let mut ids = Vec::new();
        for leaf in self.leaves(start) {
            match self.condensed_members(leaf) {
                Some(members) => ids.extend(members.iter().cloned()),
                None => ids.push(self[leaf].identifier().to_string()),
            }
        }
        ids
    }

    /// Net allele changes between the reference and the state of a node: the final allele of every
    /// position that a mutation on the path touches, for positions where it differs from the
    /// reference. When `include_node` is false, the branch into the node itself is skipped.
    pub fn path_alleles(
        &self,
        node: NodeId,
        include_node: bool,
    ) -> XxHashMap<SequencePosition, Nucleotide> {
        let mut path: Vec<NodeId> = self.ancestors(node, include_node).collect();
        path.reverse();

        let mut alleles = XxHashMap::default();
        for ancestor in path {
            for mutation in self[ancestor].mutations() {
                alleles.insert(mutation.position(), mutation.mutant());
            }
        }
        alleles.retain(|&position, allele| self.reference().get(position) != Some(*allele));
        alleles
    }

    /// The mutations a node's state carries relative to the reference, sorted by position, with
    /// parent alleles set to the reference allele.
    pub fn path_mutations(&self, node: NodeId, include_node: bool) -> Vec<Mutation> {
        let mut mutations: Vec<Mutation> = self
            .path_alleles(node, include_node)
            .into_iter()
            .map(|(position, allele)| {
                let reference = self.reference().get_unchecked(position);
                Mutation::new(0, position, reference, reference, allele)
            })
            .collect();
        mutations.sort_by_key(|m| m.position());
        mutations
    }
}

#[cfg(test)]
mod tests {
    use crate::dna::{ReferenceSequence, NUC_A, NUC_C, NUC_G, NUC_T};
    use crate::tree::Tree;

    /// root -> { a(5T) -> { b(7G), c(5A) }, d(9C) }
    fn small_tree() -> Tree {
        let mut tree = Tree::new("root", ReferenceSequence::parse(&"A".repeat(20)).unwrap());
        let a = tree.add_child_with_alleles(tree.root(), "a", &[(5, NUC_T)]).unwrap();
        tree.add_child_with_alleles(a, "b", &[(7, NUC_G)]).unwrap();
        tree.add_child_with_alleles(a, "c", &[(5, NUC_A)]).unwrap();
        tree.add_child_with_alleles(tree.root(), "d", &[(9, NUC_C)]).unwrap();
        tree
    }

    fn names(tree: &Tree, ids: impl Iterator<Item = crate::tree::NodeId>) -> Vec<String> {
        ids.map(|id| tree[id].identifier().to_string()).collect()
    }

    #[test]
    fn preorder_and_level_order() {
        let tree = small_tree();
        assert_eq!(names(&tree, tree.preorder(tree.root())), ["root", "a", "b", "c", "d"]);
        assert_eq!(names(&tree, tree.level_order(tree.root())), ["root", "a", "d", "b", "c"]);

        let a = tree.get_node("a").unwrap();
        assert_eq!(names(&tree, tree.preorder(a)), ["a", "b", "c"]);
    }

    #[test]
    fn traversals_are_restartable() {
        let tree = small_tree();
        let iter = tree.preorder(tree.root());
        let first: Vec<_> = iter.clone().collect();
        let second: Vec<_> = iter.collect();
        assert_eq!(first, second);
    }

    #[test]
    fn ancestors_with_and_without_start() {
        let tree = small_tree();
        let b = tree.get_node("b").unwrap();
        assert_eq!(names(&tree, tree.ancestors(b, true)), ["b", "a", "root"]);
        assert_eq!(names(&tree, tree.ancestors(b, false)), ["a", "root"]);
    }

    #[test]
    fn lowest_common_ancestor() {
        let tree = small_tree();
        assert_eq!(tree.lca("b", "c"), tree.get_node("a"));
        assert_eq!(tree.lca("b", "d"), Some(tree.root()));
        assert_eq!(tree.lca("a", "b"), tree.get_node("a"));
        assert_eq!(tree.lca("b", "missing"), None);
    }

    #[test]
    fn leaves_of_subtree() {
        let tree = small_tree();
        assert_eq!(tree.leaf_ids(tree.root()), ["b", "c", "d"]);
        assert_eq!(tree.leaves(tree.get_node("d").unwrap()).len(), 1);
    }

    #[test]
    fn path_alleles_cancel_back_mutations() {
        let tree = small_tree();
        let c = tree.get_node("c").unwrap();
        assert!(tree.path_alleles(c, true).is_empty());
        assert_eq!(tree.path_alleles(c, false).get(&5.into()), Some(&NUC_T));

        let b = tree.get_node("b").unwrap();
        let muts = tree.path_mutations(b, true);
        assert_eq!(muts.len(), 2);
        assert_eq!(muts[0].parent(), NUC_A);
        assert_eq!(muts[1].mutant(), NUC_G);
    }
}
