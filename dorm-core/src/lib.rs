//! Dorm Core Library
//!
//! Change tracking for entity graphs:
//! - Static entity metadata and the `entity!` descriptor macro
//! - Graph differ producing a classified change tree
//! - Change extraction into insert/update/delete batches
//! - Generated-key cascading into related entities
//! - Nested unit-of-work scopes with snapshots and an ambient transaction
//! - Backend trait for statement builders, plus an in-memory backend

pub mod error;
pub mod metadata;
pub mod hash;
pub mod codec;
pub mod node;
pub mod differ;
pub mod extract;
pub mod cascade;
pub mod backend;
pub mod memory;
pub mod tracked;
pub mod transaction;
pub mod scope;
pub mod config;

#[cfg(test)]
mod fixtures;

pub use error::{BackendError, Result, TrackError};
pub use metadata::{
    Entity, EntityDescriptor, Field, FieldMut, PropertyDescriptor, PropertyKind, ScalarField, Value,
};
pub use hash::{ContentDigest, ContentHash, KeyedContentHash};
pub use codec::{Compression, SnapshotCodec};
pub use node::{ChangeNode, ChangeTree, NodeId, NodeType, NodeValue, ObjectState, PathStep};
pub use differ::GraphDiffer;
pub use extract::{get_changes, ChangeBatch};
pub use cascade::{cascade, locate_mut, propagate_key};
pub use backend::{
    plan, Assignment, Backend, ExecutionReport, GeneratedKey, InheritedKeys, IsolationLevel, RowOp,
    Statement, StatementKind,
};
pub use memory::{MemoryBackend, MemoryConnection, MemoryDatabase, MemoryError};
pub use tracked::Tracked;
pub use transaction::{AmbientTransaction, TransactionOutcome, Vote};
pub use scope::{
    ChangeTrackingMode, CommitOutcome, PendingChanges, Scope, ScopeInfo, ScopeOptions, ScopeState,
    Trackable, UnitOfWork,
};
pub use config::TrackerConfig;
