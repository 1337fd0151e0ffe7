//! JSON snapshots of a [`Tree`].
//!
//! A snapshot stores the reference, the nodes in pre-order with the rank of their parent, and the
//! condensed leaf groups. Levels, branch lengths, the identifier index and the descendant alleles
//! are derived data and rebuilt on load.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::dna::ReferenceSequence;
use crate::error::{PlacementError, Result};
use crate::mutations::{is_strictly_sorted, Mutation};
use crate::tree::{Node, NodeId, Tree};
use crate::{XxHashMap, XxHashSet};

#[derive(Serialize, Deserialize)]
struct TreeSnapshot {
    reference: ReferenceSequence,
    nodes: Vec<NodeRecord>,
    #[serde(default)]
    condensed: Vec<CondensedRecord>,
}

#[derive(Serialize, Deserialize)]
struct NodeRecord {
    identifier: String,
    /// Pre-order rank of the parent, absent for the root
    parent: Option<usize>,
    mutations: Vec<Mutation>,
}

#[derive(Serialize, Deserialize)]
struct CondensedRecord {
    representative: String,
    members: Vec<String>,
}

fn malformed(message: impl std::fmt::Display) -> PlacementError {
    PlacementError::Serialization(<serde_json::Error as serde::de::Error>::custom(message))
}

fn snapshot(tree: &Tree) -> TreeSnapshot {
    let mut ranks: XxHashMap<NodeId, usize> = XxHashMap::default();
    let mut nodes = Vec::with_capacity(tree.len());

    for (rank, id) in tree.preorder(tree.root()).enumerate() {
        ranks.insert(id, rank);
        let node = &tree[id];
        nodes.push(NodeRecord {
            identifier: node.identifier().to_string(),
            parent: node.parent().and_then(|parent| ranks.get(&parent).copied()),
            mutations: node.mutations().to_vec(),
        });
    }

    let mut condensed: Vec<CondensedRecord> = tree
        .condensed_groups()
        .map(|(representative, members)| CondensedRecord {
            representative: representative.to_string(),
            members: members.to_vec(),
        })
        .collect();
    condensed.sort_by(|a, b| a.representative.cmp(&b.representative));

    TreeSnapshot {
        reference: tree.reference().clone(),
        nodes,
        condensed,
    }
}

fn rebuild(snapshot: TreeSnapshot) -> Result<Tree> {
    let mut records = snapshot.nodes.into_iter();
    let root = records.next().ok_or_else(|| malformed("snapshot contains no nodes"))?;
    if root.parent.is_some() {
        return Err(malformed("first node of a snapshot must be the root"));
    }

    let mut tree = Tree::new(root.identifier.clone(), snapshot.reference);
    let mut ids = vec![tree.root()];
    check_mutations(&tree, &root.identifier, &root.mutations)?;
    tree.node_mut(tree.root()).set_mutations(root.mutations);
    let mut highest_internal = internal_number(&root.identifier);

    for (rank, record) in records.enumerate() {
        let rank = rank + 1;
        let parent = match record.parent {
            Some(parent) if parent < rank => ids[parent],
            _ => {
                return Err(malformed(format!(
                    "node {} does not reference an earlier parent",
                    record.identifier
                )))
            }
        };
        if tree.contains_identifier(&record.identifier) {
            return Err(malformed(format!("identifier {} appears twice", record.identifier)));
        }
        check_mutations(&tree, &record.identifier, &record.mutations)?;

        highest_internal = highest_internal.max(internal_number(&record.identifier));
        let level = tree[parent].level() + 1;
        let id = tree.insert_node(Node::new(record.identifier, record.mutations, level, Some(parent)));
        tree.node_mut(parent).children_mut().push(id);
        ids.push(id);
    }

    for group in snapshot.condensed {
        let Some(representative) = tree.get_node(&group.representative) else {
            return Err(malformed(format!(
                "condensed group {} has no representative node",
                group.representative
            )));
        };
        if !tree[representative].is_leaf() {
            return Err(malformed(format!(
                "condensed group {} is represented by an internal node",
                group.representative
            )));
        }
        let mut seen = XxHashSet::default();
        if let Some(member) = group
            .members
            .iter()
            .find(|m| tree.contains_identifier(m) || !seen.insert(m.as_str()))
        {
            return Err(malformed(format!("condensed member {member} appears twice")));
        }
        tree.register_condensed(&group.representative, group.members);
    }

    tree.set_next_internal(highest_internal + 1);
    tree.recompute_descendant_alleles();
    Ok(tree)
}

fn check_mutations(tree: &Tree, identifier: &str, mutations: &[Mutation]) -> Result<()> {
    if !is_strictly_sorted(mutations) {
        return Err(malformed(format!("mutations of {identifier} are not sorted")));
    }
    if let Some(outside) = mutations
        .iter()
        .find(|m| !tree.reference().contains(m.position()))
    {
        return Err(malformed(format!(
            "mutation {outside} of {identifier} lies outside the reference"
        )));
    }
    Ok(())
}

/// Number `n` of a generated identifier `node_<n>` or `node_<n>_condensed_<k>_leaves`
fn internal_number(identifier: &str) -> usize {
    identifier
        .strip_prefix("node_")
        .map(|rest| {
            let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
            rest[..digits].parse().unwrap_or(0)
        })
        .unwrap_or(0)
}

/// Serialize a tree to a JSON string.
pub fn to_json(tree: &Tree) -> Result<String> {
    Ok(serde_json::to_string(&snapshot(tree))?)
}

/// Rebuild a tree from a JSON string produced by [`to_json`] or [`save`].
pub fn from_json(json: &str) -> Result<Tree> {
    rebuild(serde_json::from_str(json)?)
}

/// Write a tree snapshot to a file.
pub fn save(tree: &Tree, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let file = File::create(path).map_err(|e| PlacementError::io(path, e))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer(&mut writer, &snapshot(tree))?;
    writer.flush().map_err(|e| PlacementError::io(path, e))?;
    info!(path = %path.display(), nodes = tree.len(), "saved tree");
    Ok(())
}

/// Load a tree snapshot from a file.
pub fn load(path: impl AsRef<Path>) -> Result<Tree> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| PlacementError::io(path, e))?;
    let snapshot: TreeSnapshot = serde_json::from_reader(BufReader::new(file))?;
    let tree = rebuild(snapshot)?;
    debug!(path = %path.display(), nodes = tree.len(), "loaded tree");
    Ok(tree)
}
