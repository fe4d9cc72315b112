//! Change tree
//!
//! One diff pass produces a [`ChangeTree`]: an arena of [`ChangeNode`]s linked
//! by [`NodeId`]. Children are owned by the arena, the parent link is a plain
//! index. Object nodes borrow the entities they describe for the lifetime of
//! the pass.

use crate::metadata::{Entity, PropertyDescriptor, Value};
use serde::{Deserialize, Serialize};
use std::fmt::Write;

/// Index of a node inside its [`ChangeTree`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Change classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectState {
    Clean,
    New,
    Dirty,
    Deleted,
    /// The primary key changed. Carries one `New` and one `Deleted` child.
    DirtyPrimaryKey,
}

/// What a node stands for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    /// A whole entity, either the root or a single nested entity property
    Object,
    /// One simple property
    Property,
    /// One element of an entity list
    ListItem,
    /// Synthetic child of a `DirtyPrimaryKey` node
    Replacement,
}

/// Value carried by a node
#[derive(Debug, Clone)]
pub enum NodeValue<'a> {
    None,
    Scalar(Value),
    Object(&'a dyn Entity),
}

/// One step from an entity down to a related entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathStep {
    pub property: &'static str,
    /// Position inside an entity list
    pub position: Option<usize>,
}

/// One diffed property, list item or object
#[derive(Debug, Clone)]
pub struct ChangeNode<'a> {
    node_type: NodeType,
    property_name: Option<&'static str>,
    property: Option<&'static PropertyDescriptor>,
    value: NodeValue<'a>,
    previous: Option<Value>,
    index: Option<usize>,
    position: Option<usize>,
    state: Option<ObjectState>,
    nodes: Vec<NodeId>,
    parent: Option<NodeId>,
    object_properties: Vec<&'static str>,
    list_properties: Vec<&'static str>,
}

impl<'a> ChangeNode<'a> {
    fn empty(node_type: NodeType, value: NodeValue<'a>) -> Self {
        Self {
            node_type,
            property_name: None,
            property: None,
            value,
            previous: None,
            index: None,
            position: None,
            state: None,
            nodes: Vec::new(),
            parent: None,
            object_properties: Vec::new(),
            list_properties: Vec::new(),
        }
    }

    /// Node for a whole entity
    pub fn object(node_type: NodeType, entity: &'a dyn Entity) -> Self {
        Self::empty(node_type, NodeValue::Object(entity))
    }

    /// Leaf for a changed simple property
    pub fn property(
        property: &'static PropertyDescriptor,
        current: Option<Value>,
        previous: Option<Value>,
        state: ObjectState,
    ) -> Self {
        let value = match current {
            Some(v) => NodeValue::Scalar(v),
            None => NodeValue::None,
        };
        let mut node = Self::empty(NodeType::Property, value);
        node.property_name = Some(property.name);
        node.property = Some(property);
        node.previous = previous;
        node.state = Some(state);
        node
    }

    pub fn node_type(&self) -> NodeType {
        self.node_type
    }

    pub(crate) fn set_node_type(&mut self, node_type: NodeType) {
        self.node_type = node_type;
    }

    pub fn property_name(&self) -> Option<&'static str> {
        self.property_name
    }

    pub fn set_property_name(&mut self, name: &'static str) {
        self.property_name = Some(name);
    }

    pub fn property_metadata(&self) -> Option<&'static PropertyDescriptor> {
        self.property
    }

    pub fn set_property_metadata(&mut self, property: &'static PropertyDescriptor) {
        self.property_name = Some(property.name);
        self.property = Some(property);
    }

    pub fn value(&self) -> &NodeValue<'a> {
        &self.value
    }

    /// The entity carried by an object node
    pub fn entity(&self) -> Option<&'a dyn Entity> {
        match self.value {
            NodeValue::Object(e) => Some(e),
            _ => None,
        }
    }

    /// Current scalar value of a property leaf
    pub fn scalar(&self) -> Option<&Value> {
        match &self.value {
            NodeValue::Scalar(v) => Some(v),
            _ => None,
        }
    }

    /// Old scalar value of a property leaf
    pub fn previous(&self) -> Option<&Value> {
        self.previous.as_ref()
    }

    /// Emission order inside the parent list
    pub fn index(&self) -> Option<usize> {
        self.index
    }

    pub fn set_index(&mut self, index: usize) {
        self.index = Some(index);
    }

    /// Position of the item inside the list it was read from
    pub fn position(&self) -> Option<usize> {
        self.position
    }

    pub fn set_position(&mut self, position: usize) {
        self.position = Some(position);
    }

    /// Explicitly assigned state, `None` when the state is aggregated
    pub fn explicit_state(&self) -> Option<ObjectState> {
        self.state
    }

    pub fn set_state(&mut self, state: ObjectState) {
        self.state = Some(state);
    }

    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn is_leaf(&self) -> bool {
        self.parent.is_some() && self.nodes.is_empty()
    }

    pub fn is_object(&self) -> bool {
        matches!(self.value, NodeValue::Object(_))
    }

    pub fn is_simple_leaf(&self) -> bool {
        self.is_leaf() && !self.is_object()
    }

    /// Nested entity properties visited while diffing this object
    pub fn object_properties(&self) -> &[&'static str] {
        &self.object_properties
    }

    /// Entity-list properties visited while diffing this object
    pub fn list_properties(&self) -> &[&'static str] {
        &self.list_properties
    }

    pub(crate) fn record_object_property(&mut self, name: &'static str) {
        self.object_properties.push(name);
    }

    pub(crate) fn record_list_property(&mut self, name: &'static str) {
        self.list_properties.push(name);
    }
}

/// Arena holding one diff pass
#[derive(Debug, Default)]
pub struct ChangeTree<'a> {
    nodes: Vec<ChangeNode<'a>>,
    root: Option<NodeId>,
}

impl<'a> ChangeTree<'a> {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            root: None,
        }
    }

    /// Store a detached node
    pub fn add(&mut self, node: ChangeNode<'a>) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(node);
        id
    }

    /// Append `child` to `parent`'s children
    pub fn attach(&mut self, parent: NodeId, child: NodeId) {
        self.nodes[child.0].parent = Some(parent);
        self.nodes[parent.0].nodes.push(child);
    }

    /// Detach the children of `parent` matching `pred`
    pub fn detach_where<F>(&mut self, parent: NodeId, mut pred: F)
    where
        F: FnMut(&ChangeTree<'a>, NodeId) -> bool,
    {
        let children = std::mem::take(&mut self.nodes[parent.0].nodes);
        let mut kept = Vec::with_capacity(children.len());
        for child in children {
            if pred(self, child) {
                self.nodes[child.0].parent = None;
            } else {
                kept.push(child);
            }
        }
        self.nodes[parent.0].nodes = kept;
    }

    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    pub fn set_root(&mut self, root: NodeId) {
        self.root = Some(root);
    }

    pub fn node(&self, id: NodeId) -> &ChangeNode<'a> {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut ChangeNode<'a> {
        &mut self.nodes[id.0]
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id.0].nodes
    }

    /// State of a node, aggregated from its children when not assigned
    pub fn state(&self, id: NodeId) -> ObjectState {
        let node = self.node(id);
        if let Some(state) = node.state {
            return state;
        }
        if node.nodes.is_empty() {
            return ObjectState::Clean;
        }
        let mut distinct: Vec<ObjectState> = Vec::new();
        for &child in &node.nodes {
            let s = self.state(child);
            if !distinct.contains(&s) {
                distinct.push(s);
            }
        }
        // a clean child still counts when something below it changed
        let any_change = node
            .nodes
            .iter()
            .any(|&c| !self.children(c).is_empty() || self.state(c) != ObjectState::Clean);
        if distinct.len() > 1 || (node.is_root() && any_change) {
            ObjectState::Dirty
        } else {
            distinct[0]
        }
    }

    /// No value and nothing changed
    pub fn is_empty(&self, id: NodeId) -> bool {
        matches!(self.node(id).value, NodeValue::None) && self.state(id) == ObjectState::Clean
    }

    /// Nearest ancestor carrying an entity
    pub fn parent_object(&self, id: NodeId) -> Option<NodeId> {
        let mut cursor = self.node(id).parent;
        while let Some(p) = cursor {
            if self.node(p).is_object() {
                return Some(p);
            }
            cursor = self.node(p).parent;
        }
        None
    }

    /// Steps from the root entity down to the entity this node belongs to
    pub fn path(&self, id: NodeId) -> Vec<PathStep> {
        let mut steps = Vec::new();
        let mut cursor = Some(id);
        while let Some(c) = cursor {
            let node = self.node(c);
            match node.node_type {
                NodeType::Object | NodeType::ListItem if !node.is_root() => {
                    if let Some(property) = node.property_name {
                        steps.push(PathStep {
                            property,
                            position: node.position,
                        });
                    }
                }
                _ => {}
            }
            cursor = node.parent;
        }
        steps.reverse();
        steps
    }

    /// Nodes reachable from the root
    pub fn len(&self) -> usize {
        let mut count = 0;
        let mut stack: Vec<NodeId> = self.root.into_iter().collect();
        while let Some(id) = stack.pop() {
            count += 1;
            stack.extend_from_slice(self.children(id));
        }
        count
    }

    pub fn is_clean(&self) -> bool {
        self.root
            .map_or(true, |r| self.state(r) == ObjectState::Clean)
    }

    /// Indented dump of the reachable tree
    pub fn render(&self) -> String {
        let mut out = String::new();
        if let Some(root) = self.root {
            self.render_node(root, 0, &mut out);
        }
        out
    }

    fn render_node(&self, id: NodeId, depth: usize, out: &mut String) {
        let node = self.node(id);
        let label = match &node.value {
            NodeValue::Object(e) => e.descriptor().name.to_string(),
            NodeValue::Scalar(v) => v.to_string(),
            NodeValue::None => "null".to_string(),
        };
        let _ = writeln!(
            out,
            "{}{:?} {} {}{}",
            "  ".repeat(depth),
            self.state(id),
            node.property_name.unwrap_or("<root>"),
            label,
            node.index.map(|i| format!(" #{}", i)).unwrap_or_default(),
        );
        for &child in &node.nodes {
            self.render_node(child, depth + 1, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::PropertyKind;

    static NAME: PropertyDescriptor = PropertyDescriptor::new("Name", PropertyKind::Scalar);
    static CITY: PropertyDescriptor = PropertyDescriptor::new("City", PropertyKind::Scalar);

    fn leaf(p: &'static PropertyDescriptor, state: ObjectState) -> ChangeNode<'static> {
        ChangeNode::property(p, Some(Value::Int(1)), None, state)
    }

    #[test]
    fn test_state_aggregation() {
        let mut tree = ChangeTree::new();
        let root = tree.add(ChangeNode::empty(NodeType::Object, NodeValue::None));
        tree.set_root(root);
        assert_eq!(tree.state(root), ObjectState::Clean);
        assert!(tree.is_empty(root));

        let inner = tree.add(ChangeNode::empty(NodeType::Object, NodeValue::None));
        tree.attach(root, inner);
        let a = tree.add(leaf(&NAME, ObjectState::New));
        tree.attach(inner, a);
        // single distinct child state propagates on non-root nodes
        assert_eq!(tree.state(inner), ObjectState::New);
        // the root reports Dirty as soon as anything below changed
        assert_eq!(tree.state(root), ObjectState::Dirty);

        let b = tree.add(leaf(&CITY, ObjectState::Deleted));
        tree.attach(inner, b);
        assert_eq!(tree.state(inner), ObjectState::Dirty);
    }

    #[test]
    fn test_predicates_and_detach() {
        let mut tree = ChangeTree::new();
        let root = tree.add(ChangeNode::empty(NodeType::Object, NodeValue::None));
        tree.set_root(root);
        let a = tree.add(leaf(&NAME, ObjectState::Dirty));
        let b = tree.add(leaf(&CITY, ObjectState::Dirty));
        tree.attach(root, a);
        tree.attach(root, b);
        assert!(tree.node(root).is_root());
        assert!(tree.node(a).is_leaf());
        assert!(tree.node(a).is_simple_leaf());
        assert_eq!(tree.len(), 3);

        tree.detach_where(root, |t, id| t.node(id).property_name() == Some("Name"));
        assert_eq!(tree.children(root), &[b]);
        assert!(tree.node(a).parent().is_none());
        assert!(tree.render().contains("City"));
    }
}
