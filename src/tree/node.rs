use std::fmt::{Display, Formatter};

use crate::mutations::{count_substitutions, Mutation};

/// A handle into the node arena of a [`crate::tree::Tree`]. Handles stay valid until the node is
/// retired, they are never reused for another node.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    /// Raw arena index, mostly useful for diagnostics
    pub fn index(&self) -> usize {
        self.0
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// A tree node and the branch leading into it.
///
/// The node owns its position-sorted mutation list. Parent and children are arena handles; the
/// parent handle is `None` only for the root.
#[derive(Clone, Debug)]
pub struct Node {
    identifier: String,
    mutations: Vec<Mutation>,
    branch_length: u32,
    level: u32,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

impl Node {
    pub(crate) fn new(
        identifier: String,
        mutations: Vec<Mutation>,
        level: u32,
        parent: Option<NodeId>,
    ) -> Self {
        let branch_length = count_substitutions(&mutations);
        Self {
            identifier,
            mutations,
            branch_length,
            level,
            parent,
            children: Vec::new(),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Mutations on the branch into this node, sorted by position
    pub fn mutations(&self) -> &[Mutation] {
        &self.mutations
    }

    /// Number of substitutions on the branch into this node
    pub fn branch_length(&self) -> u32 {
        self.branch_length
    }

    /// Depth of the node, the root has level 0
    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub(crate) fn set_identifier(&mut self, identifier: String) {
        self.identifier = identifier;
    }

    pub(crate) fn mutations_mut(&mut self) -> &mut Vec<Mutation> {
        &mut self.mutations
    }

    /// Replace the mutation list and derive the branch length from it
    pub(crate) fn set_mutations(&mut self, mutations: Vec<Mutation>) {
        self.mutations = mutations;
        self.update_branch_length();
    }

    pub(crate) fn update_branch_length(&mut self) {
        self.branch_length = count_substitutions(&self.mutations);
    }

    pub(crate) fn set_level(&mut self, level: u32) {
        self.level = level;
    }

    pub(crate) fn set_parent(&mut self, parent: Option<NodeId>) {
        self.parent = parent;
    }

    pub(crate) fn children_mut(&mut self) -> &mut Vec<NodeId> {
        &mut self.children
    }

    pub(crate) fn take_children(&mut self) -> Vec<NodeId> {
        std::mem::take(&mut self.children)
    }
}
