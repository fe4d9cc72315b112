//! Graph differ
//!
//! Compares a current entity graph with its old image and produces a
//! classified [`ChangeTree`]. Simple properties are compared by value, nested
//! entities recursively, and entity lists by correlating items through a
//! [`ContentHash`].
//!
//! A changed primary key is never reported as a column update: the object is
//! flagged `DirtyPrimaryKey` and carries a `New` replacement for the current
//! image and a `Deleted` one for the old image.

use crate::error::{Result, TrackError};
use crate::hash::{ContentDigest, ContentHash};
use crate::metadata::{Entity, Field, PropertyDescriptor, PropertyKind, Value};
use crate::node::{ChangeNode, ChangeTree, NodeId, NodeType, ObjectState};
use std::collections::{HashMap, VecDeque};

/// Recursive structural comparison of two entity graphs
pub struct GraphDiffer<'h> {
    hasher: &'h dyn ContentHash,
    is_new: bool,
}

impl<'h> GraphDiffer<'h> {
    /// `is_new` marks a scope declared for a not-yet-persisted entity
    pub fn new(hasher: &'h dyn ContentHash, is_new: bool) -> Self {
        Self { hasher, is_new }
    }

    /// Diff two graphs into a fresh tree
    pub fn diff<'a>(
        &self,
        current: Option<&'a dyn Entity>,
        old: Option<&'a dyn Entity>,
    ) -> Result<ChangeTree<'a>> {
        let mut tree = ChangeTree::new();
        let root = self.compare_objects(&mut tree, current, old, None)?;
        tree.set_root(root);
        tracing::debug!(
            nodes = tree.len(),
            state = ?tree.state(root),
            "diffed {}",
            tree.node(root).entity().map_or("?", |e| e.descriptor().name)
        );
        Ok(tree)
    }

    /// Compare one object pair. The returned node is not attached; `parent`
    /// only tells whether this object is the root of the pass.
    pub fn compare_objects<'a>(
        &self,
        tree: &mut ChangeTree<'a>,
        current: Option<&'a dyn Entity>,
        old: Option<&'a dyn Entity>,
        parent: Option<NodeId>,
    ) -> Result<NodeId> {
        let is_root = parent.is_none();
        match (current, old) {
            (None, None) => Err(TrackError::InvalidUsage(
                "cannot compare two absent objects".to_string(),
            )),
            (Some(c), Some(o)) => {
                let node = tree.add(ChangeNode::object(NodeType::Object, c));
                self.compare_properties(tree, node, c, o)?;

                if tree.node(node).explicit_state().is_none() {
                    if is_root && self.is_new {
                        tree.node_mut(node).set_state(ObjectState::New);
                    } else if !is_root {
                        // column changes of a nested object live on its leaves
                        tree.node_mut(node).set_state(ObjectState::Clean);
                    }
                }
                Ok(node)
            }
            (Some(c), None) => self.whole_object(tree, c, ObjectState::New),
            (None, Some(o)) => self.whole_object(tree, o, ObjectState::Deleted),
        }
    }

    /// Scalar changes, including values appearing or being cleared, are
    /// `Dirty` leaves; once the key changed only relations are still diffed.
    fn compare_properties<'a>(
        &self,
        tree: &mut ChangeTree<'a>,
        node: NodeId,
        current: &'a dyn Entity,
        old: &'a dyn Entity,
    ) -> Result<()> {
        let mut removed_row = None;
        for property in current.descriptor().properties {
            let cur = current.field(property.name);
            let prev = old.field(property.name);
            if cur.is_none() && prev.is_none() {
                continue;
            }

            match property.kind {
                PropertyKind::Scalar | PropertyKind::ScalarList | PropertyKind::Binary => {
                    if removed_row.is_some() {
                        continue;
                    }
                    let cur = simple_value(cur);
                    let prev = simple_value(prev);
                    if cur == prev {
                        continue;
                    }
                    let leaf = tree.add(ChangeNode::property(
                        property,
                        cur,
                        prev,
                        ObjectState::Dirty,
                    ));
                    tree.attach(node, leaf);
                    if property.primary_key {
                        removed_row = Some(self.swap_primary_key(tree, node, current, old));
                    }
                }
                PropertyKind::Entity => {
                    tree.node_mut(node).record_object_property(property.name);
                    let cur = single_entity(cur);
                    let prev = single_entity(prev);
                    if cur.is_none() && prev.is_none() {
                        continue;
                    }
                    let sub = self.compare_objects(tree, cur, prev, Some(node))?;
                    if has_changes(tree, sub) {
                        tree.node_mut(sub).set_property_metadata(property);
                        tree.attach(node, sub);
                    }
                }
                PropertyKind::EntityList => {
                    tree.node_mut(node).record_list_property(property.name);
                    let cur = entity_list(cur);
                    let prev = entity_list(prev);
                    self.compare_lists(tree, &cur, &prev, node, property)?;
                }
            }
        }
        // the old row goes after deleted related rows in post-order
        if let Some(removed) = removed_row {
            tree.attach(node, removed);
        }
        Ok(())
    }

    /// Replace accumulated column updates by an insert of the current image.
    /// Returns the unattached `Deleted` replacement for the old image.
    fn swap_primary_key<'a>(
        &self,
        tree: &mut ChangeTree<'a>,
        node: NodeId,
        current: &'a dyn Entity,
        old: &'a dyn Entity,
    ) -> NodeId {
        tree.detach_where(node, |t, child| t.state(child) == ObjectState::Dirty);

        let mut inserted = ChangeNode::object(NodeType::Replacement, current);
        inserted.set_state(ObjectState::New);
        let inserted = tree.add(inserted);
        tree.attach(node, inserted);

        let mut removed = ChangeNode::object(NodeType::Replacement, old);
        removed.set_state(ObjectState::Deleted);
        let removed = tree.add(removed);

        tree.node_mut(node).set_state(ObjectState::DirtyPrimaryKey);
        tracing::debug!(
            entity = current.descriptor().name,
            "primary key changed, replacing row"
        );
        removed
    }

    /// An object present on one side only, with its related entities
    fn whole_object<'a>(
        &self,
        tree: &mut ChangeTree<'a>,
        entity: &'a dyn Entity,
        state: ObjectState,
    ) -> Result<NodeId> {
        let mut root = ChangeNode::object(NodeType::Object, entity);
        root.set_state(state);
        let node = tree.add(root);

        for property in entity.descriptor().relations() {
            let field = entity.field(property.name);
            match property.kind {
                PropertyKind::Entity => {
                    tree.node_mut(node).record_object_property(property.name);
                    if let Some(sub) = single_entity(field) {
                        let sub = self.whole_object(tree, sub, state)?;
                        tree.node_mut(sub).set_property_metadata(property);
                        tree.attach(node, sub);
                    }
                }
                PropertyKind::EntityList => {
                    tree.node_mut(node).record_list_property(property.name);
                    let items = entity_list(field);
                    let (cur, prev): (&[&dyn Entity], &[&dyn Entity]) = match state {
                        ObjectState::Deleted => (&[], &items),
                        _ => (&items, &[]),
                    };
                    self.compare_lists(tree, cur, prev, node, property)?;
                }
                _ => {}
            }
        }
        Ok(node)
    }

    /// Correlate two entity lists and attach the resulting item nodes to
    /// `parent`: modifications first, then additions, then deletions.
    pub fn compare_lists<'a>(
        &self,
        tree: &mut ChangeTree<'a>,
        current: &[&'a dyn Entity],
        old: &[&'a dyn Entity],
        parent: NodeId,
        property: &'static PropertyDescriptor,
    ) -> Result<Vec<NodeId>> {
        if current.is_empty() && old.is_empty() {
            return Ok(Vec::new());
        }

        // equal digests pair up in list order
        let mut old_by_digest: HashMap<ContentDigest, VecDeque<usize>> = HashMap::new();
        for (i, item) in old.iter().enumerate() {
            old_by_digest
                .entry(self.hasher.hash(*item)?)
                .or_default()
                .push_back(i);
        }

        let mut matched = vec![false; old.len()];
        let mut modified = Vec::new();
        let mut added = Vec::new();
        for (i, item) in current.iter().enumerate() {
            let digest = self.hasher.hash(*item)?;
            match old_by_digest.get_mut(&digest).and_then(|q| q.pop_front()) {
                Some(j) => {
                    matched[j] = true;
                    let sub = self.compare_objects(tree, Some(*item), Some(old[j]), Some(parent))?;
                    if has_changes(tree, sub) {
                        let n = tree.node_mut(sub);
                        if n.explicit_state() != Some(ObjectState::DirtyPrimaryKey) {
                            n.set_state(ObjectState::Dirty);
                        }
                        n.set_position(i);
                        modified.push(sub);
                    }
                }
                None => {
                    let sub = self.compare_objects(tree, Some(*item), None, Some(parent))?;
                    tree.node_mut(sub).set_position(i);
                    added.push(sub);
                }
            }
        }

        let mut deleted = Vec::new();
        for (j, item) in old.iter().enumerate() {
            if !matched[j] {
                let sub = self.compare_objects(tree, None, Some(*item), Some(parent))?;
                tree.node_mut(sub).set_position(j);
                deleted.push(sub);
            }
        }

        let emitted: Vec<NodeId> = modified.into_iter().chain(added).chain(deleted).collect();
        for (index, &id) in emitted.iter().enumerate() {
            let n = tree.node_mut(id);
            n.set_node_type(NodeType::ListItem);
            n.set_property_metadata(property);
            n.set_index(index);
            tree.attach(parent, id);
        }
        Ok(emitted)
    }
}

fn has_changes(tree: &ChangeTree<'_>, id: NodeId) -> bool {
    !tree.children(id).is_empty() || tree.state(id) != ObjectState::Clean
}

fn simple_value(field: Option<Field<'_>>) -> Option<Value> {
    match field {
        Some(Field::Value(v)) => Some(v),
        _ => None,
    }
}

fn single_entity(field: Option<Field<'_>>) -> Option<&dyn Entity> {
    match field {
        Some(Field::Entity(e)) => Some(e),
        _ => None,
    }
}

fn entity_list(field: Option<Field<'_>>) -> Vec<&dyn Entity> {
    match field {
        Some(Field::Entities(items)) => items,
        _ => Vec::new(),
    }
}
