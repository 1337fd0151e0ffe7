//! The mutation-annotated tree.
//!
//! Nodes live in an arena and reference each other through [`NodeId`] handles. Slots of retired
//! nodes are emptied and never reused, so a stale handle can always be detected. All nodes are
//! reachable through an identifier index, which every structural operation keeps in sync.

use std::ops::Index;
use std::sync::Arc;

use crate::dna::{Nucleotide, ReferenceSequence};
use crate::error::{invariant_violation, PlacementError, Result};
use crate::mutations::{is_strictly_sorted, Mutation, SequencePosition};
use crate::XxHashMap;

pub mod edit;
mod node;
pub mod traversal;

pub use node::{Node, NodeId};
pub use traversal::{Ancestors, LevelOrder, PreOrder};

#[derive(Clone, Debug)]
pub struct Tree {
    nodes: Vec<Option<Node>>,
    root: NodeId,
    index: XxHashMap<String, NodeId>,

    /// Members of condensed leaf groups, keyed by the identifier of the group representative
    condensed: XxHashMap<String, Vec<String>>,

    /// Reverse lookup of `condensed`: member identifier to representative identifier
    condensed_members: XxHashMap<String, String>,

    reference: Arc<ReferenceSequence>,

    /// Counter for generated internal node identifiers
    next_internal: usize,
}

impl Tree {
    /// Create a tree that consists of a single root node without mutations.
    pub fn new(root_identifier: impl Into<String>, reference: ReferenceSequence) -> Self {
        let root_identifier = root_identifier.into();
        let mut index = XxHashMap::default();
        index.insert(root_identifier.clone(), NodeId(0));
        Self {
            nodes: vec![Some(Node::new(root_identifier, Vec::new(), 0, None))],
            root: NodeId(0),
            index,
            condensed: XxHashMap::default(),
            condensed_members: XxHashMap::default(),
            reference: Arc::new(reference),
            next_internal: 1,
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn reference(&self) -> &ReferenceSequence {
        &self.reference
    }

    pub(crate) fn shared_reference(&self) -> Arc<ReferenceSequence> {
        Arc::clone(&self.reference)
    }

    /// Number of nodes currently in the tree
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Look up a node by its identifier. Members of condensed groups are not nodes of their own
    /// and are not found; see [`Tree::condensed_group_of`].
    pub fn get_node(&self, identifier: &str) -> Option<NodeId> {
        self.index.get(identifier).copied()
    }

    /// Resolve a handle, `None` if the node has been retired
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0).and_then(|slot| slot.as_ref())
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> &mut Node {
        match self.nodes.get_mut(id.0).and_then(|slot| slot.as_mut()) {
            Some(node) => node,
            None => invariant_violation(format!("node handle {id} does not resolve")),
        }
    }

    /// Whether the identifier names a node or a member of a condensed group
    pub fn contains_identifier(&self, identifier: &str) -> bool {
        self.index.contains_key(identifier) || self.condensed_members.contains_key(identifier)
    }

    /// The representative node of the condensed group the identifier belongs to
    pub fn condensed_group_of(&self, identifier: &str) -> Option<NodeId> {
        self.condensed_members
            .get(identifier)
            .and_then(|representative| self.get_node(representative))
    }

    /// Members of the condensed group represented by the node, if it represents one
    pub fn condensed_members(&self, id: NodeId) -> Option<&[String]> {
        self.node(id)
            .and_then(|node| self.condensed.get(node.identifier()))
            .map(|members| members.as_slice())
    }

    /// Number of condensed leaf groups
    pub fn condensed_group_count(&self) -> usize {
        self.condensed.len()
    }

    /// Attach a new node below `parent`. Used to build an existing tree; descendant alleles are
    /// not maintained, call [`Tree::recompute_descendant_alleles`] once the tree is complete.
    ///
    /// # Errors
    /// - [`PlacementError::UnknownNode`] if `parent` has been retired
    /// - [`PlacementError::DuplicateSample`] if the identifier is already in use
    /// - [`PlacementError::InvalidEdit`] if the mutations are not strictly sorted by position
    pub fn add_child(
        &mut self,
        parent: NodeId,
        identifier: impl Into<String>,
        mutations: Vec<Mutation>,
    ) -> Result<NodeId> {
        let identifier = identifier.into();
        let parent_level = self
            .node(parent)
            .ok_or_else(|| PlacementError::UnknownNode(format!("#{parent}")))?
            .level();
        if self.contains_identifier(&identifier) {
            return Err(PlacementError::DuplicateSample(identifier));
        }
        if !is_strictly_sorted(&mutations) {
            return Err(PlacementError::invalid_edit(format!(
                "mutations of {identifier} are not sorted by position"
            )));
        }

        let child = self.insert_node(Node::new(identifier, mutations, parent_level + 1, Some(parent)));
        self.node_mut(parent).children_mut().push(child);
        Ok(child)
    }

    /// Attach a new node below `parent` that carries the given `(position, allele)` changes. The
    /// parent allele of each mutation is inferred from the path above.
    pub fn add_child_with_alleles(
        &mut self,
        parent: NodeId,
        identifier: impl Into<String>,
        alleles: &[(u32, Nucleotide)],
    ) -> Result<NodeId> {
        if self.node(parent).is_none() {
            return Err(PlacementError::UnknownNode(format!("#{parent}")));
        }
        let mut mutations = alleles
            .iter()
            .map(|&(position, mutant)| {
                let position = SequencePosition::from(position);
                let reference = self.reference.get(position).ok_or_else(|| {
                    PlacementError::invalid_edit(format!("position {position} outside the reference"))
                })?;
                Ok(Mutation::new(
                    0,
                    position,
                    reference,
                    self.allele_at(parent, position),
                    mutant,
                ))
            })
            .collect::<Result<Vec<_>>>()?;
        mutations.sort_by_key(|m| m.position());
        self.add_child(parent, identifier, mutations)
    }

    /// Allele at a position in the state below the branch into `node`
    pub fn allele_at(&self, node: NodeId, position: SequencePosition) -> Nucleotide {
        self.ancestors(node, true)
            .find_map(|ancestor| {
                crate::mutations::find_position(self[ancestor].mutations(), position)
                    .map(|m| m.mutant())
            })
            .unwrap_or_else(|| self.reference.get_unchecked(position))
    }

    /// Recompute the descendant alleles of every mutation from scratch, bottom-up.
    pub fn recompute_descendant_alleles(&mut self) {
        let order: Vec<NodeId> = self.preorder(self.root).collect();
        let mut summaries: XxHashMap<NodeId, XxHashMap<SequencePosition, Nucleotide>> =
            XxHashMap::default();

        for &id in order.iter().rev() {
            let mut child_summaries = self[id]
                .children()
                .iter()
                .filter_map(|child| summaries.remove(child))
                .collect::<Vec<_>>();

            // merge the smaller summaries into the largest one
            child_summaries.sort_by_key(|summary| std::cmp::Reverse(summary.len()));
            let mut child_summaries = child_summaries.into_iter();
            let mut below = child_summaries.next().unwrap_or_default();
            for summary in child_summaries {
                for (position, alleles) in summary {
                    *below.entry(position).or_insert(0) |= alleles;
                }
            }

            let node = self.node_mut(id);
            for mutation in node.mutations_mut() {
                let alleles = mutation.mutant()
                    | below.get(&mutation.position()).copied().unwrap_or(0);
                mutation.set_descendant_alleles(alleles);
            }
            for mutation in node.mutations() {
                *below.entry(mutation.position()).or_insert(0) |= mutation.mutant();
            }
            summaries.insert(id, below);
        }
    }

    /// Iterate over every node handle in the arena that has not been retired
    pub(crate) fn live_nodes(&self) -> impl Iterator<Item = (NodeId, &Node)> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|node| (NodeId(i), node)))
    }

    pub(crate) fn condensed_groups(&self) -> impl Iterator<Item = (&str, &[String])> + '_ {
        self.condensed
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Put a node into a fresh arena slot and index its identifier.
    pub(crate) fn insert_node(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.nodes.len());
        if let Some(previous) = self.index.insert(node.identifier().to_string(), id) {
            invariant_violation(format!(
                "identifier {} already indexed for node {previous}",
                node.identifier()
            ));
        }
        self.nodes.push(Some(node));
        id
    }

    /// Empty the arena slot of a node and drop its identifier from the index. The caller is
    /// responsible for detaching it from its parent and children.
    pub(crate) fn retire_node(&mut self, id: NodeId) -> Node {
        let node = match self.nodes.get_mut(id.0).and_then(|slot| slot.take()) {
            Some(node) => node,
            None => invariant_violation(format!("node {id} retired twice")),
        };
        if self.index.get(node.identifier()) == Some(&id) {
            self.index.remove(node.identifier());
        }
        if let Some(members) = self.condensed.remove(node.identifier()) {
            for member in members {
                self.condensed_members.remove(&member);
            }
        }
        node
    }

    /// Change the identifier of a live node, keeping the index in sync.
    pub(crate) fn reindex(&mut self, id: NodeId, identifier: String) {
        let old = self[id].identifier().to_string();
        self.index.remove(&old);
        if let Some(members) = self.condensed.remove(&old) {
            for member in &members {
                self.condensed_members.insert(member.clone(), identifier.clone());
            }
            self.condensed.insert(identifier.clone(), members);
        }
        if let Some(previous) = self.index.insert(identifier.clone(), id) {
            invariant_violation(format!("identifier {identifier} already indexed for node {previous}"));
        }
        self.node_mut(id).set_identifier(identifier);
    }

    pub(crate) fn register_condensed(&mut self, representative: &str, members: Vec<String>) {
        for member in &members {
            self.condensed_members
                .insert(member.clone(), representative.to_string());
        }
        self.condensed.insert(representative.to_string(), members);
    }

    pub(crate) fn unregister_condensed(&mut self, representative: &str) -> Option<Vec<String>> {
        let members = self.condensed.remove(representative)?;
        for member in &members {
            self.condensed_members.remove(member);
        }
        Some(members)
    }

    /// A fresh identifier for a node created by the tree itself
    pub(crate) fn generate_internal_identifier(&mut self) -> String {
        loop {
            let identifier = format!("node_{}", self.next_internal);
            self.next_internal += 1;
            if !self.contains_identifier(&identifier) {
                return identifier;
            }
        }
    }

    /// Substitute `old` by `new` in the child list of `parent`, keeping its position.
    pub(crate) fn replace_child(&mut self, parent: NodeId, old: NodeId, new: NodeId) {
        let children = self.node_mut(parent).children_mut();
        match children.iter().position(|&c| c == old) {
            Some(i) => children[i] = new,
            None => invariant_violation(format!(
                "node {old} is not a child of its recorded parent {parent}"
            )),
        }
    }

    /// Remove `child` from the child list of `parent`.
    pub(crate) fn detach_child(&mut self, parent: NodeId, child: NodeId) {
        let children = self.node_mut(parent).children_mut();
        match children.iter().position(|&c| c == child) {
            Some(i) => {
                children.remove(i);
            }
            None => invariant_violation(format!(
                "node {child} is not a child of its recorded parent {parent}"
            )),
        }
    }

    /// Assign `level` to `id` and consistent levels to its whole subtree.
    pub(crate) fn set_subtree_levels(&mut self, id: NodeId, level: u32) {
        let mut stack = vec![(id, level)];
        while let Some((node, level)) = stack.pop() {
            let node = self.node_mut(node);
            node.set_level(level);
            stack.extend(node.children().iter().map(|&c| (c, level + 1)));
        }
    }

    pub(crate) fn set_next_internal(&mut self, next: usize) {
        self.next_internal = self.next_internal.max(next);
    }
}

impl Index<NodeId> for Tree {
    type Output = Node;

    fn index(&self, index: NodeId) -> &Self::Output {
        match self.node(index) {
            Some(node) => node,
            None => invariant_violation(format!("node handle {index} does not resolve")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dna::{NUC_A, NUC_C, NUC_G, NUC_T};

    fn reference() -> ReferenceSequence {
        ReferenceSequence::parse(&"A".repeat(50)).unwrap()
    }

    #[test]
    fn children_get_increasing_levels() {
        let mut tree = Tree::new("root", reference());
        let a = tree.add_child_with_alleles(tree.root(), "a", &[(10, NUC_T)]).unwrap();
        let b = tree.add_child_with_alleles(a, "b", &[(12, NUC_G), (3, NUC_C)]).unwrap();

        assert_eq!(tree[tree.root()].level(), 0);
        assert_eq!(tree[a].level(), 1);
        assert_eq!(tree[b].level(), 2);
        assert_eq!(tree[b].branch_length(), 2);
        assert_eq!(tree[b].mutations()[0].position().unwrap(), 3);
        assert_eq!(tree.get_node("b"), Some(b));
        assert_eq!(tree.len(), 3);
    }

    #[test]
    fn duplicate_identifiers_are_rejected() {
        let mut tree = Tree::new("root", reference());
        tree.add_child_with_alleles(tree.root(), "a", &[]).unwrap();
        let err = tree.add_child_with_alleles(tree.root(), "a", &[]).unwrap_err();
        assert!(matches!(err, PlacementError::DuplicateSample(_)));
    }

    #[test]
    fn alleles_are_inherited_along_the_path() {
        let mut tree = Tree::new("root", reference());
        let a = tree.add_child_with_alleles(tree.root(), "a", &[(10, NUC_T)]).unwrap();
        let b = tree.add_child_with_alleles(a, "b", &[(10, NUC_G)]).unwrap();

        assert_eq!(tree[b].mutations()[0].parent(), NUC_T);
        assert_eq!(tree.allele_at(b, 10.into()), NUC_G);
        assert_eq!(tree.allele_at(a, 10.into()), NUC_T);
        assert_eq!(tree.allele_at(a, 11.into()), NUC_A);
    }

    #[test]
    fn descendant_alleles_cover_the_subtree() {
        let mut tree = Tree::new("root", reference());
        let a = tree.add_child_with_alleles(tree.root(), "a", &[(10, NUC_T)]).unwrap();
        tree.add_child_with_alleles(a, "b", &[(10, NUC_G)]).unwrap();
        tree.add_child_with_alleles(a, "c", &[(10, NUC_C)]).unwrap();
        tree.add_child_with_alleles(a, "d", &[]).unwrap();
        tree.recompute_descendant_alleles();

        assert_eq!(tree[a].mutations()[0].descendant_alleles(), NUC_T | NUC_G | NUC_C);
    }

    #[test]
    fn generated_identifiers_skip_used_names() {
        let mut tree = Tree::new("root", reference());
        tree.add_child_with_alleles(tree.root(), "node_1", &[]).unwrap();
        assert_eq!(tree.generate_internal_identifier(), "node_2");
    }
}
