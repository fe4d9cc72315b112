//! Change extraction
//!
//! Flattens a change tree into the node lists a backend turns into
//! statements. `New` and `Dirty` nodes are collected pre-order so a parent row
//! exists before any child referencing its key; `Deleted` nodes post-order so
//! child rows go before the parent rows they reference.

use crate::node::{ChangeTree, NodeId, ObjectState};

/// Nodes of `tree` below `root` with the given state, in execution order.
///
/// Only leaves and object nodes are reported.
pub fn get_changes(tree: &ChangeTree<'_>, root: NodeId, state: ObjectState) -> Vec<NodeId> {
    let mut out = Vec::new();
    let post_order = state == ObjectState::Deleted;
    collect(tree, root, state, post_order, &mut out);
    out
}

fn collect(
    tree: &ChangeTree<'_>,
    id: NodeId,
    state: ObjectState,
    post_order: bool,
    out: &mut Vec<NodeId>,
) {
    let node = tree.node(id);
    let matches = (node.is_leaf() || node.is_object()) && tree.state(id) == state;
    if matches && !post_order {
        out.push(id);
    }
    for &child in node.nodes() {
        collect(tree, child, state, post_order, out);
    }
    if matches && post_order {
        out.push(id);
    }
}

/// Insert, update and delete candidates of one diff pass
#[derive(Debug)]
pub struct ChangeBatch<'t, 'a> {
    tree: &'t ChangeTree<'a>,
    /// New objects, parents first
    pub new: Vec<NodeId>,
    /// Dirty leaves and objects, parents first
    pub dirty: Vec<NodeId>,
    /// Deleted objects, children first
    pub deleted: Vec<NodeId>,
}

impl<'t, 'a> ChangeBatch<'t, 'a> {
    pub fn from_tree(tree: &'t ChangeTree<'a>) -> Self {
        let (new, dirty, deleted) = match tree.root() {
            Some(root) => (
                get_changes(tree, root, ObjectState::New),
                get_changes(tree, root, ObjectState::Dirty),
                get_changes(tree, root, ObjectState::Deleted),
            ),
            None => (Vec::new(), Vec::new(), Vec::new()),
        };
        Self {
            tree,
            new,
            dirty,
            deleted,
        }
    }

    pub fn tree(&self) -> &'t ChangeTree<'a> {
        self.tree
    }

    pub fn is_empty(&self) -> bool {
        self.new.is_empty() && self.dirty.is_empty() && self.deleted.is_empty()
    }

    pub fn len(&self) -> usize {
        self.new.len() + self.dirty.len() + self.deleted.len()
    }

    /// Dirty simple leaves grouped by the object owning them, in first
    /// appearance order
    pub fn dirty_columns(&self) -> Vec<(NodeId, Vec<NodeId>)> {
        let mut groups: Vec<(NodeId, Vec<NodeId>)> = Vec::new();
        for &id in &self.dirty {
            if !self.tree.node(id).is_simple_leaf() {
                continue;
            }
            let Some(owner) = self.tree.parent_object(id) else {
                continue;
            };
            match groups.iter_mut().find(|(o, _)| *o == owner) {
                Some((_, leaves)) => leaves.push(id),
                None => groups.push((owner, vec![id])),
            }
        }
        groups
    }
}
