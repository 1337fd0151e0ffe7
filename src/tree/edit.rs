//! Structural edits on an existing tree: renaming, moving, removing, collapsing and condensing.
//!
//! Every edit validates its arguments before changing anything, so a rejected edit leaves the tree
//! untouched. Edits that change the shape of the tree recompute the descendant alleles afterwards.

use tracing::debug;

use crate::error::{PlacementError, Result};
use crate::mutations::merge_branches;
use crate::tree::{Node, NodeId, Tree};

impl Tree {
    /// Give a node a new identifier.
    pub fn rename_node(&mut self, identifier: &str, new_identifier: &str) -> Result<()> {
        let id = self
            .get_node(identifier)
            .ok_or_else(|| PlacementError::UnknownNode(identifier.to_string()))?;
        if self.contains_identifier(new_identifier) {
            return Err(PlacementError::DuplicateSample(new_identifier.to_string()));
        }
        self.reindex(id, new_identifier.to_string());
        debug!(from = identifier, to = new_identifier, "renamed node");
        Ok(())
    }

    /// Re-parent the node `source` below `destination`. The caller is responsible for both
    /// placements implying the same mutations, see [`Tree::move_node_checked`]. A former parent
    /// that is left without children is removed.
    ///
    /// # Errors
    /// [`PlacementError::InvalidEdit`] if `source` is the root, `destination` is a leaf, the
    /// current parent, or lies inside the subtree of `source`.
    pub fn move_node(&mut self, source: &str, destination: &str) -> Result<()> {
        let (source_id, destination_id) = self.validate_move(source, destination)?;
        self.reparent(source_id, destination_id);
        self.recompute_descendant_alleles();
        debug!(source, destination, "moved node");
        Ok(())
    }

    /// Like [`Tree::move_node`], but only moves if the state above `source` equals the state of
    /// `destination`.
    pub fn move_node_checked(&mut self, source: &str, destination: &str) -> Result<()> {
        let (source_id, destination_id) = self.validate_move(source, destination)?;
        if self.path_alleles(source_id, false) != self.path_alleles(destination_id, true) {
            return Err(PlacementError::invalid_edit(format!(
                "paths to {source} and {destination} do not carry the same mutations"
            )));
        }
        self.move_node(source, destination)
    }

    fn validate_move(&self, source: &str, destination: &str) -> Result<(NodeId, NodeId)> {
        let source_id = self
            .get_node(source)
            .ok_or_else(|| PlacementError::UnknownNode(source.to_string()))?;
        let destination_id = self
            .get_node(destination)
            .ok_or_else(|| PlacementError::UnknownNode(destination.to_string()))?;

        if self[source_id].is_root() {
            return Err(PlacementError::invalid_edit("the root cannot be moved"));
        }
        if self[destination_id].is_leaf() {
            return Err(PlacementError::invalid_edit(format!(
                "{destination} is a leaf and cannot become a parent"
            )));
        }
        if self[source_id].parent() == Some(destination_id) {
            return Err(PlacementError::invalid_edit(format!(
                "{source} already is a child of {destination}"
            )));
        }
        if self.is_ancestor(source_id, destination_id) {
            return Err(PlacementError::invalid_edit(format!(
                "{destination} lies below {source}"
            )));
        }
        Ok((source_id, destination_id))
    }

    /// Move a subtree without any validation. Removes the former parent if it ends up childless.
    fn reparent(&mut self, source: NodeId, destination: NodeId) {
        let Some(old_parent) = self[source].parent() else {
            return;
        };
        self.detach_child(old_parent, source);
        self.node_mut(destination).children_mut().push(source);
        self.node_mut(source).set_parent(Some(destination));
        let level = self[destination].level() + 1;
        self.set_subtree_levels(source, level);

        self.prune_childless(old_parent);
    }

    /// Remove a childless non-root node, and repeat on its parent.
    fn prune_childless(&mut self, mut node: NodeId) {
        while self[node].is_leaf() {
            let Some(parent) = self[node].parent() else {
                break;
            };
            self.detach_child(parent, node);
            self.retire_node(node);
            node = parent;
        }
    }

    /// Remove the node with its whole subtree. The parent is cleaned up afterwards: removed if it
    /// has no children left, merged into its remaining child if it has exactly one.
    pub fn remove_node(&mut self, identifier: &str) -> Result<()> {
        let id = self
            .get_node(identifier)
            .ok_or_else(|| PlacementError::UnknownNode(identifier.to_string()))?;
        let Some(parent) = self[id].parent() else {
            return Err(PlacementError::invalid_edit("the root cannot be removed"));
        };

        let subtree: Vec<NodeId> = self.preorder(id).collect();
        self.detach_child(parent, id);
        for node in subtree {
            self.retire_node(node);
        }

        if self[parent].is_leaf() {
            self.prune_childless(parent);
        } else if self[parent].children().len() == 1 && !self[parent].is_root() {
            self.merge_into_only_child(parent);
        }

        self.recompute_descendant_alleles();
        debug!(identifier, "removed node");
        Ok(())
    }

    /// Replace a non-root node that has a single child by that child, moving the branch
    /// mutations down.
    fn merge_into_only_child(&mut self, node: NodeId) {
        let (Some(parent), &[child]) = (self[node].parent(), self[node].children()) else {
            return;
        };

        let merged = merge_branches(self[node].mutations(), self[child].mutations());
        let level = self[node].level();
        self.node_mut(child).set_mutations(merged);
        self.replace_child(parent, node, child);
        self.node_mut(child).set_parent(Some(parent));
        self.node_mut(node).take_children();
        self.retire_node(node);
        self.set_subtree_levels(child, level);
    }

    /// Remove internal nodes whose branch carries no mutations, and merge internal nodes that have
    /// a single child into that child. The root is kept.
    pub fn collapse_tree(&mut self) {
        let order: Vec<NodeId> = self.level_order(self.root()).skip(1).collect();
        let mut collapsed = 0usize;

        for id in order {
            let Some(node) = self.node(id) else {
                continue;
            };
            let Some(parent) = node.parent() else {
                continue;
            };
            if node.is_leaf() {
                continue;
            }

            if node.mutations().is_empty() {
                let children = node.children().to_vec();
                let level = node.level();
                let position = self[parent]
                    .children()
                    .iter()
                    .position(|&c| c == id)
                    .unwrap_or(0);
                for &child in &children {
                    self.node_mut(child).set_parent(Some(parent));
                    self.set_subtree_levels(child, level);
                }
                self.node_mut(id).take_children();
                self.detach_child(parent, id);
                self.node_mut(parent)
                    .children_mut()
                    .splice(position..position, children);
                self.retire_node(id);
                collapsed += 1;
            } else if node.children().len() == 1 {
                self.merge_into_only_child(id);
                collapsed += 1;
            }
        }

        self.recompute_descendant_alleles();
        debug!(collapsed, "collapsed tree");
    }

    /// Replace groups of at least two sibling leaves without mutations by a single representative
    /// leaf that records the group members. Returns the number of groups created.
    pub fn condense_leaves(&mut self) -> usize {
        let internal: Vec<NodeId> = self
            .preorder(self.root())
            .filter(|&id| !self[id].is_leaf())
            .collect();
        let mut groups = 0;

        for parent in internal {
            let members: Vec<NodeId> = self[parent]
                .children()
                .iter()
                .copied()
                .filter(|&child| {
                    self[child].is_leaf()
                        && self[child].mutations().is_empty()
                        && self.condensed_members(child).is_none()
                })
                .collect();
            if members.len() < 2 {
                continue;
            }

            let identifier = loop {
                let identifier = format!(
                    "{}_condensed_{}_leaves",
                    self.generate_internal_identifier(),
                    members.len()
                );
                if !self.contains_identifier(&identifier) {
                    break identifier;
                }
            };
            let position = self[parent]
                .children()
                .iter()
                .position(|&c| c == members[0])
                .unwrap_or(0);

            let mut names = Vec::with_capacity(members.len());
            for member in members {
                self.detach_child(parent, member);
                names.push(self.retire_node(member).identifier().to_string());
            }

            let level = self[parent].level() + 1;
            let representative =
                self.insert_node(Node::new(identifier.clone(), Vec::new(), level, Some(parent)));
            self.node_mut(parent)
                .children_mut()
                .insert(position, representative);
            self.register_condensed(&identifier, names);
            groups += 1;
        }

        debug!(groups, "condensed leaves");
        groups
    }

    /// Expand every condensed group back into one leaf per member. Members inherit the mutations
    /// of their representative.
    pub fn uncondense_leaves(&mut self) {
        let representatives: Vec<String> = self
            .condensed_groups()
            .map(|(representative, _)| representative.to_string())
            .collect();

        for representative in representatives {
            let Some(id) = self.get_node(&representative) else {
                continue;
            };
            let Some(parent) = self[id].parent() else {
                continue;
            };
            let Some(members) = self.unregister_condensed(&representative) else {
                continue;
            };

            let position = self[parent]
                .children()
                .iter()
                .position(|&c| c == id)
                .unwrap_or(0);
            self.detach_child(parent, id);
            let node = self.retire_node(id);
            let level = node.level();

            let leaves: Vec<NodeId> = members
                .into_iter()
                .map(|member| {
                    self.insert_node(Node::new(
                        member,
                        node.mutations().to_vec(),
                        level,
                        Some(parent),
                    ))
                })
                .collect();
            self.node_mut(parent)
                .children_mut()
                .splice(position..position, leaves);
        }

        self.recompute_descendant_alleles();
    }
}
