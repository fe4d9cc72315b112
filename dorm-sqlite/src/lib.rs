//! SQLite backend for dorm
//!
//! Renders row operations as SQLite statements with quoted identifiers and
//! numbered parameters, and executes each batch inside a savepoint so a
//! failing statement leaves the surrounding transaction untouched. Connections
//! are opened in WAL mode with foreign keys enforced.

use dorm_core::{
    plan, Assignment, Backend, ChangeBatch, ExecutionReport, GeneratedKey, InheritedKeys,
    IsolationLevel, RowOp, Statement, Value,
};
use rusqlite::types::{ToSqlOutput, Value as SqlValue};
use rusqlite::{Connection, ToSql};
use std::path::{Path, PathBuf};
use std::time::Duration;

const SAVEPOINT: &str = "dorm_batch";

#[derive(Debug, thiserror::Error)]
pub enum SqliteError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Statement matched no rows: {0}")]
    NoRows(String),
}

pub type Result<T> = std::result::Result<T, SqliteError>;

/// Quote an identifier for SQLite
pub fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int(i) => serde_json::Value::from(*i),
        Value::Float(f) => serde_json::Value::from(*f),
        Value::Text(s) => serde_json::Value::String(s.clone()),
        Value::Bytes(b) => serde_json::Value::String(hex::encode(b)),
        Value::List(items) => serde_json::Value::Array(items.iter().map(to_json).collect()),
    }
}

/// Statement parameter. Lists are stored as JSON text, booleans as 0/1.
pub struct SqlParam<'v>(pub &'v Option<Value>);

impl ToSql for SqlParam<'_> {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self.0 {
            None => ToSqlOutput::Owned(SqlValue::Null),
            Some(Value::Bool(b)) => ToSqlOutput::Owned(SqlValue::Integer(i64::from(*b))),
            Some(Value::Int(i)) => ToSqlOutput::Owned(SqlValue::Integer(*i)),
            Some(Value::Float(f)) => ToSqlOutput::Owned(SqlValue::Real(*f)),
            Some(Value::Text(s)) => ToSqlOutput::from(s.as_str()),
            Some(Value::Bytes(b)) => ToSqlOutput::from(b.as_slice()),
            Some(list @ Value::List(_)) => {
                ToSqlOutput::Owned(SqlValue::Text(to_json(list).to_string()))
            }
        })
    }
}

fn values(columns: &[Assignment]) -> impl Iterator<Item = Option<Value>> + '_ {
    columns.iter().map(|(_, v)| v.clone())
}

fn conditions(keys: &[Assignment], first: usize) -> String {
    keys.iter()
        .enumerate()
        .map(|(i, (p, _))| format!("{} = ?{}", quote(p.column), first + i))
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// Render a row operation as a SQLite statement
pub fn render(op: &RowOp) -> Statement {
    let (sql, params): (String, Vec<Option<Value>>) = match op {
        RowOp::Insert { table, columns, .. } if columns.is_empty() => {
            (format!("INSERT INTO {} DEFAULT VALUES", quote(table)), Vec::new())
        }
        RowOp::Insert { table, columns, .. } => {
            let names: Vec<String> = columns.iter().map(|(p, _)| quote(p.column)).collect();
            let slots: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();
            (
                format!(
                    "INSERT INTO {} ({}) VALUES ({})",
                    quote(table),
                    names.join(", "),
                    slots.join(", ")
                ),
                values(columns).collect(),
            )
        }
        RowOp::Update {
            table, set, keys, ..
        } => {
            let assignments: Vec<String> = set
                .iter()
                .enumerate()
                .map(|(i, (p, _))| format!("{} = ?{}", quote(p.column), i + 1))
                .collect();
            (
                format!(
                    "UPDATE {} SET {} WHERE {}",
                    quote(table),
                    assignments.join(", "),
                    conditions(keys, set.len() + 1)
                ),
                values(set).chain(values(keys)).collect(),
            )
        }
        RowOp::Delete { table, keys, .. } => (
            format!("DELETE FROM {} WHERE {}", quote(table), conditions(keys, 1)),
            values(keys).collect(),
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

/// Backend writing to one SQLite database file
#[derive(Debug, Clone)]
pub struct SqliteBackend {
    path: PathBuf,
    busy_timeout: Duration,
}

impl SqliteBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            busy_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open a configured connection
    pub fn open(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "temp_store", "MEMORY")?;
        conn.busy_timeout(self.busy_timeout)?;
        Ok(conn)
    }

    /// Run schema DDL
    pub fn create_schema(&self, ddl: &str) -> Result<()> {
        let conn = self.open()?;
        conn.execute_batch(ddl)?;
        tracing::info!("Schema created in {:?}", self.path);
        Ok(())
    }

    fn apply(&self, conn: &Connection, batch: &ChangeBatch<'_, '_>) -> Result<ExecutionReport> {
        let tree = batch.tree();
        let mut inherited = InheritedKeys::new();
        let mut report = ExecutionReport::default();

        for mut op in plan(batch) {
            if let RowOp::Insert { node, columns, .. } = &mut op {
                inherited.apply(tree, *node, columns);
            }
            let statement = render(&op);
            tracing::debug!(params = ?statement.params, "execute: {}", statement.sql);
            let params: Vec<SqlParam<'_>> = statement.params.iter().map(SqlParam).collect();
            let affected = conn.execute(&statement.sql, rusqlite::params_from_iter(params.iter()))?;

            match &op {
                RowOp::Insert {
                    node,
                    generated: Some(key),
                    ..
                } => {
                    let value = Value::Int(conn.last_insert_rowid());
                    inherited.record(tree, *node, key.name, value.clone());
                    report.generated_keys.push(GeneratedKey {
                        statement: report.statements,
                        node: *node,
                        property: key.name,
                        value,
                    });
                }
                RowOp::Update { .. } | RowOp::Delete { .. } if affected == 0 => {
                    return Err(SqliteError::NoRows(statement.sql));
                }
                _ => {}
            }
            report.statements += 1;
            report.rows_affected += affected;
        }
        Ok(report)
    }
}

impl Backend for SqliteBackend {
    type Connection = Connection;
    type Error = SqliteError;

    fn connect(&self) -> Result<Connection> {
        self.open()
    }

    fn begin_ambient(&self, conn: &mut Connection, isolation: IsolationLevel) -> Result<()> {
        let begin = match isolation {
            IsolationLevel::ReadUncommitted => {
                conn.pragma_update(None, "read_uncommitted", true)?;
                "BEGIN DEFERRED"
            }
            IsolationLevel::ReadCommitted | IsolationLevel::RepeatableRead => "BEGIN DEFERRED",
            IsolationLevel::Serializable => "BEGIN IMMEDIATE",
        };
        conn.execute_batch(begin)?;
        tracing::debug!(?isolation, "{}", begin);
        Ok(())
    }

    fn finish_ambient(&self, conn: &mut Connection, commit: bool) -> Result<()> {
        if conn.is_autocommit() {
            tracing::warn!("no transaction open on connection");
            return Ok(());
        }
        conn.execute_batch(if commit { "COMMIT" } else { "ROLLBACK" })?;
        Ok(())
    }

    fn build(&self, batch: &ChangeBatch<'_, '_>) -> Result<Vec<Statement>> {
        Ok(plan(batch).iter().map(render).collect())
    }

    fn execute(&self, conn: &mut Connection, batch: &ChangeBatch<'_, '_>) -> Result<ExecutionReport> {
        conn.execute_batch(&format!("SAVEPOINT {}", SAVEPOINT))?;
        match self.apply(conn, batch) {
            Ok(report) => {
                conn.execute_batch(&format!("RELEASE {}", SAVEPOINT))?;
                tracing::info!(
                    statements = report.statements,
                    rows = report.rows_affected,
                    "batch executed"
                );
                Ok(report)
            }
            Err(e) => {
                tracing::warn!(error = %e, "batch failed, rolling back");
                conn.execute_batch(&format!("ROLLBACK TO {0}; RELEASE {0}", SAVEPOINT))?;
                Err(e)
            }
        }
    }
}
