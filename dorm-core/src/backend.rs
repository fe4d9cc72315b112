//! Statement builder interface
//!
//! A [`Backend`] turns a [`ChangeBatch`] into dialect-specific statements and
//! executes them. The row plan shared by all backends lives here as well:
//! inserts in pre-order, one update per dirty object, deletes in post-order,
//! and the name-based inheritance of generated keys into child rows.

use crate::extract::ChangeBatch;
use crate::metadata::{PropertyDescriptor, Value};
use crate::node::{ChangeTree, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Isolation level requested for ambient transactions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum IsolationLevel {
    ReadUncommitted,
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatementKind {
    Insert,
    Update,
    Delete,
}

/// One rendered statement
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub kind: StatementKind,
    pub table: &'static str,
    pub sql: String,
    pub params: Vec<Option<Value>>,
    /// Node the statement was built from
    pub node: NodeId,
}

/// Key assigned by storage during an insert
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedKey {
    /// Position of the insert among executed statements
    pub statement: usize,
    pub node: NodeId,
    pub property: &'static str,
    pub value: Value,
}

/// Result of executing one batch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionReport {
    pub statements: usize,
    pub rows_affected: usize,
    pub generated_keys: Vec<GeneratedKey>,
}

/// Statement builder and dialect provider
pub trait Backend {
    type Connection;
    type Error: std::error::Error + Send + Sync + 'static;

    /// Open a new connection
    fn connect(&self) -> Result<Self::Connection, Self::Error>;

    /// Begin the ambient transaction on `conn`
    fn begin_ambient(
        &self,
        conn: &mut Self::Connection,
        isolation: IsolationLevel,
    ) -> Result<(), Self::Error>;

    /// Commit or roll back the ambient transaction on `conn`
    fn finish_ambient(&self, conn: &mut Self::Connection, commit: bool) -> Result<(), Self::Error>;

    /// Render the statements for a batch without executing them
    fn build(&self, batch: &ChangeBatch<'_, '_>) -> Result<Vec<Statement>, Self::Error>;

    /// Execute a batch inside a local transaction, rolled back on error
    fn execute(
        &self,
        conn: &mut Self::Connection,
        batch: &ChangeBatch<'_, '_>,
    ) -> Result<ExecutionReport, Self::Error>;
}

/// Column assignment of a planned row operation
pub type Assignment = (&'static PropertyDescriptor, Option<Value>);

/// Dialect-neutral row operation
#[derive(Debug, Clone)]
pub enum RowOp {
    Insert {
        node: NodeId,
        table: &'static str,
        columns: Vec<Assignment>,
        /// Key left for storage to assign
        generated: Option<&'static PropertyDescriptor>,
    },
    Update {
        node: NodeId,
        table: &'static str,
        set: Vec<Assignment>,
        keys: Vec<Assignment>,
    },
    Delete {
        node: NodeId,
        table: &'static str,
        keys: Vec<Assignment>,
    },
}

impl RowOp {
    pub fn kind(&self) -> StatementKind {
        match self {
            RowOp::Insert { .. } => StatementKind::Insert,
            RowOp::Update { .. } => StatementKind::Update,
            RowOp::Delete { .. } => StatementKind::Delete,
        }
    }

    pub fn node(&self) -> NodeId {
        match self {
            RowOp::Insert { node, .. } | RowOp::Update { node, .. } | RowOp::Delete { node, .. } => {
                *node
            }
        }
    }

    pub fn table(&self) -> &'static str {
        match self {
            RowOp::Insert { table, .. } | RowOp::Update { table, .. } | RowOp::Delete { table, .. } => {
                table
            }
        }
    }
}

/// Row operations for a batch: inserts, then updates, then deletes
pub fn plan(batch: &ChangeBatch<'_, '_>) -> Vec<RowOp> {
    let tree = batch.tree();
    let mut ops = Vec::new();

    for &id in &batch.new {
        let Some(entity) = tree.node(id).entity() else {
            continue;
        };
        let descriptor = entity.descriptor();
        let generated = descriptor
            .generated_key()
            .filter(|k| entity.value(k.name).map_or(true, |v| v.is_default()));
        let columns = descriptor
            .columns()
            .filter(|p| generated.map_or(true, |g| g.name != p.name))
            .map(|p| (p, entity.value(p.name)))
            .collect();
        ops.push(RowOp::Insert {
            node: id,
            table: descriptor.table,
            columns,
            generated,
        });
    }

    for (owner, leaves) in batch.dirty_columns() {
        let Some(entity) = tree.node(owner).entity() else {
            continue;
        };
        let set = leaves
            .iter()
            .filter_map(|&leaf| {
                let node = tree.node(leaf);
                node.property_metadata()
                    .map(|p| (p, node.scalar().cloned()))
            })
            .collect();
        ops.push(RowOp::Update {
            node: owner,
            table: entity.descriptor().table,
            set,
            keys: entity.key_values(),
        });
    }

    for &id in &batch.deleted {
        let Some(entity) = tree.node(id).entity() else {
            continue;
        };
        ops.push(RowOp::Delete {
            node: id,
            table: entity.descriptor().table,
            keys: entity.key_values(),
        });
    }
    ops
}

/// Generated keys of already inserted rows, inherited by name into the rows
/// inserted below them
#[derive(Debug, Default)]
pub struct InheritedKeys {
    assigned: HashMap<NodeId, Vec<(&'static str, Value)>>,
}

impl InheritedKeys {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the key generated for `node`
    pub fn record(&mut self, tree: &ChangeTree<'_>, node: NodeId, key: &'static str, value: Value) {
        let Some(entity) = tree.node(node).entity() else {
            return;
        };
        let mut targets: Vec<(&'static str, Value)> = Vec::new();
        for relation in entity.descriptor().relations() {
            let name = relation.foreign_key.unwrap_or(key);
            if !targets.iter().any(|(n, _)| *n == name) {
                targets.push((name, value.clone()));
            }
        }
        self.assigned.insert(node, targets);
    }

    /// Column overrides for `node`, nearest ancestor first
    pub fn overrides(&self, tree: &ChangeTree<'_>, node: NodeId) -> Vec<(&'static str, Value)> {
        let Some(entity) = tree.node(node).entity() else {
            return Vec::new();
        };
        let descriptor = entity.descriptor();
        let mut out: Vec<(&'static str, Value)> = Vec::new();
        let mut cursor = tree.parent_object(node);
        while let Some(ancestor) = cursor {
            if let Some(targets) = self.assigned.get(&ancestor) {
                for (name, value) in targets {
                    if descriptor.property(name).is_some() && !out.iter().any(|(n, _)| n == name) {
                        out.push((name, value.clone()));
                    }
                }
            }
            cursor = tree.parent_object(ancestor);
        }
        out
    }

    /// Apply inherited values to planned insert columns
    pub fn apply(&self, tree: &ChangeTree<'_>, node: NodeId, columns: &mut [Assignment]) {
        for (name, value) in self.overrides(tree, node) {
            if let Some(slot) = columns.iter_mut().find(|(p, _)| p.name == name) {
                slot.1 = Some(value);
            }
        }
    }
}
