//! In-memory backend
//!
//! Keeps tables as ordered maps keyed by the rendered primary key. Used by
//! tests and by `Debug` mode dry runs where no database is available. Local
//! and ambient transactions are whole-database copies restored on rollback.

use crate::backend::{
    plan, Assignment, Backend, ExecutionReport, GeneratedKey, InheritedKeys, IsolationLevel,
    RowOp, Statement,
};
use crate::differ::GraphDiffer;
use crate::error::TrackError;
use crate::extract::ChangeBatch;
use crate::hash::KeyedContentHash;
use crate::metadata::{Entity, Value};
use std::cell::{Ref, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;

/// Stored row: column name to value
pub type Row = BTreeMap<&'static str, Option<Value>>;

#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("Duplicate key {key} in table {table}")]
    DuplicateKey { table: &'static str, key: String },

    #[error("Row {key} not found in table {table}")]
    RowNotFound { table: &'static str, key: String },

    #[error("Missing primary key value for table {0}")]
    MissingKey(&'static str),

    #[error("Writes to table {0} are rejected")]
    Rejected(&'static str),

    #[error("No ambient transaction in progress")]
    NoTransaction,

    #[error("Cannot diff graph: {0}")]
    Diff(#[from] TrackError),
}

/// Table storage
#[derive(Debug, Clone, Default)]
pub struct MemoryDatabase {
    tables: BTreeMap<&'static str, BTreeMap<String, Row>>,
    sequences: BTreeMap<&'static str, i64>,
}

impl MemoryDatabase {
    /// Rows of `table` in key order
    pub fn rows(&self, table: &str) -> Vec<&Row> {
        self.tables
            .get(table)
            .map(|rows| rows.values().collect())
            .unwrap_or_default()
    }

    /// Row of `table` by primary key, composite keys joined with `|`
    pub fn get(&self, table: &str, key: &str) -> Option<&Row> {
        self.tables.get(table)?.get(key)
    }

    pub fn count(&self, table: &str) -> usize {
        self.tables.get(table).map_or(0, BTreeMap::len)
    }

    fn next_sequence(&mut self, table: &'static str) -> i64 {
        let seq = self.sequences.entry(table).or_insert(0);
        *seq += 1;
        *seq
    }

    fn observe_key(&mut self, table: &'static str, value: &Option<Value>) {
        if let Some(id) = value.as_ref().and_then(Value::as_int) {
            let seq = self.sequences.entry(table).or_insert(0);
            *seq = (*seq).max(id);
        }
    }
}

fn render_key(table: &'static str, keys: &[Option<Value>]) -> Result<String, MemoryError> {
    let mut parts = Vec::with_capacity(keys.len());
    for key in keys {
        match key {
            Some(Value::Text(s)) if !s.is_empty() => parts.push(s.clone()),
            Some(v) if !v.is_default() => parts.push(v.to_string()),
            _ => return Err(MemoryError::MissingKey(table)),
        }
    }
    Ok(parts.join("|"))
}

/// Connection to a [`MemoryBackend`] database
#[derive(Debug)]
pub struct MemoryConnection {
    db: Rc<RefCell<MemoryDatabase>>,
    ambient: Option<MemoryDatabase>,
}

impl MemoryConnection {
    pub fn in_transaction(&self) -> bool {
        self.ambient.is_some()
    }
}

/// Backend storing rows in process memory
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    db: Rc<RefCell<MemoryDatabase>>,
    rejected: Rc<RefCell<Vec<&'static str>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed state of the database
    pub fn database(&self) -> Ref<'_, MemoryDatabase> {
        self.db.borrow()
    }

    /// Make every later write to `table` fail
    pub fn reject(&self, table: &'static str) {
        self.rejected.borrow_mut().push(table);
    }

    /// Insert a whole entity graph outside any scope
    pub fn seed(&self, entity: &dyn Entity) -> Result<ExecutionReport, MemoryError> {
        let tree = GraphDiffer::new(&KeyedContentHash, true).diff(Some(entity), None)?;
        let batch = ChangeBatch::from_tree(&tree);
        let mut conn = self.connect()?;
        self.execute(&mut conn, &batch)
    }

    fn apply(
        &self,
        db: &mut MemoryDatabase,
        batch: &ChangeBatch<'_, '_>,
    ) -> Result<ExecutionReport, MemoryError> {
        let tree = batch.tree();
        let mut inherited = InheritedKeys::new();
        let mut report = ExecutionReport::default();

        for op in plan(batch) {
            let table = op.table();
            if self.rejected.borrow().contains(&table) {
                return Err(MemoryError::Rejected(table));
            }
            match op {
                RowOp::Insert {
                    node,
                    table,
                    mut columns,
                    generated,
                } => {
                    inherited.apply(tree, node, &mut columns);
                    let mut row: Row = columns.into_iter().map(|(p, v)| (p.column, v)).collect();
                    if let Some(key) = generated {
                        let value = Value::Int(db.next_sequence(table));
                        row.insert(key.column, Some(value.clone()));
                        inherited.record(tree, node, key.name, value.clone());
                        report.generated_keys.push(GeneratedKey {
                            statement: report.statements,
                            node,
                            property: key.name,
                            value,
                        });
                    }
                    let descriptor = tree
                        .node(node)
                        .entity()
                        .map(|e| e.descriptor())
                        .ok_or(MemoryError::MissingKey(table))?;
                    let keys: Vec<Option<Value>> = descriptor
                        .primary_keys()
                        .map(|p| row.get(p.column).cloned().flatten())
                        .collect();
                    for k in &keys {
                        db.observe_key(table, k);
                    }
                    let key = render_key(table, &keys)?;
                    let rows = db.tables.entry(table).or_default();
                    if rows.contains_key(&key) {
                        return Err(MemoryError::DuplicateKey { table, key });
                    }
                    rows.insert(key, row);
                }
                RowOp::Update {
                    table, set, keys, ..
                } => {
                    let key = render_key(table, &key_values(&keys))?;
                    let row = db
                        .tables
                        .get_mut(table)
                        .and_then(|rows| rows.get_mut(&key))
                        .ok_or(MemoryError::RowNotFound { table, key })?;
                    for (p, v) in set {
                        row.insert(p.column, v);
                    }
                }
                RowOp::Delete { table, keys, .. } => {
                    let key = render_key(table, &key_values(&keys))?;
                    db.tables
                        .get_mut(table)
                        .and_then(|rows| rows.remove(&key))
                        .ok_or(MemoryError::RowNotFound { table, key })?;
                }
            }
            report.statements += 1;
            report.rows_affected += 1;
        }
        Ok(report)
    }
}

fn key_values(keys: &[Assignment]) -> Vec<Option<Value>> {
    keys.iter().map(|(_, v)| v.clone()).collect()
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn assignments(columns: &[Assignment], separator: &str) -> String {
    columns
        .iter()
        .map(|(p, _)| format!("{} = ?", p.column))
        .collect::<Vec<_>>()
        .join(separator)
}

/// Render a row operation as plain SQL text
pub fn render(op: &RowOp) -> Statement {
    let (sql, params) = match op {
        RowOp::Insert { table, columns, .. } => {
            let names: Vec<&str> = columns.iter().map(|(p, _)| p.column).collect();
            (
                format!(
                    "INSERT INTO {} ({}) VALUES ({})",
                    table,
                    names.join(", "),
                    placeholders(names.len())
                ),
                key_values(columns),
            )
        }
        RowOp::Update {
            table, set, keys, ..
        } => (
            format!(
                "UPDATE {} SET {} WHERE {}",
                table,
                assignments(set, ", "),
                assignments(keys, " AND ")
            ),
            key_values(set).into_iter().chain(key_values(keys)).collect(),
        ),
        RowOp::Delete { table, keys, .. } => (
            format!("DELETE FROM {} WHERE {}", table, assignments(keys, " AND ")),
            key_values(keys),
        ),
    };
    Statement {
        kind: op.kind(),
        table: op.table(),
        sql,
        params,
        node: op.node(),
    }
}

impl Backend for MemoryBackend {
    type Connection = MemoryConnection;
    type Error = MemoryError;

    fn connect(&self) -> Result<MemoryConnection, MemoryError> {
        Ok(MemoryConnection {
            db: Rc::clone(&self.db),
            ambient: None,
        })
    }

    fn begin_ambient(
        &self,
        conn: &mut MemoryConnection,
        isolation: IsolationLevel,
    ) -> Result<(), MemoryError> {
        tracing::debug!(?isolation, "memory transaction started");
        conn.ambient = Some(conn.db.borrow().clone());
        Ok(())
    }

    fn finish_ambient(&self, conn: &mut MemoryConnection, commit: bool) -> Result<(), MemoryError> {
        let saved = conn.ambient.take().ok_or(MemoryError::NoTransaction)?;
        if !commit {
            *conn.db.borrow_mut() = saved;
        }
        Ok(())
    }

    fn build(&self, batch: &ChangeBatch<'_, '_>) -> Result<Vec<Statement>, MemoryError> {
        Ok(plan(batch).iter().map(render).collect())
    }

    fn execute(
        &self,
        conn: &mut MemoryConnection,
        batch: &ChangeBatch<'_, '_>,
    ) -> Result<ExecutionReport, MemoryError> {
        let mut working = conn.db.borrow().clone();
        let report = match self.apply(&mut working, batch) {
            Ok(report) => report,
            Err(e) => {
                tracing::warn!(error = %e, "memory batch rolled back");
                return Err(e);
            }
        };
        *conn.db.borrow_mut() = working;
        tracing::debug!(statements = report.statements, "memory batch applied");
        Ok(report)
    }
}
