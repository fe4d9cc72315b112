//! Unit-of-work scopes
//!
//! A [`UnitOfWork`] owns a stack of scopes. Opening a scope snapshots the
//! tracked entity; committing diffs the live entity against that snapshot and
//! hands the extracted batches to the backend. Scopes nest: a successful inner
//! commit refreshes the snapshot of an outer scope tracking the same instance,
//! so the outer commit does not persist the same change twice.
//!
//! [`Scope`] is an RAII guard. Dropping it disposes the scope: with
//! auto-commit it commits, or rolls the entity back when the block failed,
//! then withdraws from the ambient transaction.

use crate::backend::{Backend, ExecutionReport, GeneratedKey, Statement};
use crate::cascade::{locate_mut, propagate_key};
use crate::codec::SnapshotCodec;
use crate::config::TrackerConfig;
use crate::differ::GraphDiffer;
use crate::error::{Result, TrackError};
use crate::extract::ChangeBatch;
use crate::hash::{ContentHash, KeyedContentHash};
use crate::metadata::{Entity, Value};
use crate::node::{ChangeTree, ObjectState, PathStep};
use crate::tracked::Tracked;
use crate::transaction::{AmbientTransaction, TransactionOutcome, Vote};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::any::{type_name, Any, TypeId};
use std::cell::{Cell, RefCell, RefMut};
use std::rc::Rc;

/// How a scope persists changes on commit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ChangeTrackingMode {
    /// Diff, build and execute statements
    #[default]
    Automatic,
    /// Diff and build statements without executing them
    Debug,
    /// No diffing; the caller persists changes itself
    Manual,
}

/// Entities that can be placed in a scope
pub trait Trackable: Entity + Serialize + DeserializeOwned + Clone {}

impl<T: Entity + Serialize + DeserializeOwned + Clone> Trackable for T {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeState {
    Open,
    Committed,
    RolledBack,
}

impl ScopeState {
    fn label(self) -> &'static str {
        match self {
            ScopeState::Open => "open",
            ScopeState::Committed => "committed",
            ScopeState::RolledBack => "rolled back",
        }
    }
}

/// What to track and how
pub struct ScopeOptions<T, C> {
    item: Option<Tracked<T>>,
    declared: bool,
    auto_commit: Option<bool>,
    mode: Option<ChangeTrackingMode>,
    connection: Option<Rc<RefCell<C>>>,
}

impl<T, C> Default for ScopeOptions<T, C> {
    fn default() -> Self {
        Self {
            item: None,
            declared: false,
            auto_commit: None,
            mode: None,
            connection: None,
        }
    }
}

impl<T, C> ScopeOptions<T, C> {
    /// Track an existing entity
    pub fn track(item: &Tracked<T>) -> Self {
        Self {
            item: Some(item.clone()),
            ..Self::default()
        }
    }

    /// Scope a not-yet-persisted entity of type `T`
    pub fn declare() -> Self {
        Self {
            declared: true,
            ..Self::default()
        }
    }

    pub fn auto_commit(mut self, auto_commit: bool) -> Self {
        self.auto_commit = Some(auto_commit);
        self
    }

    pub fn mode(mut self, mode: ChangeTrackingMode) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Use an already open connection. The scope starts no transaction of
    /// its own on it.
    pub fn connection(mut self, connection: Rc<RefCell<C>>) -> Self {
        self.connection = Some(connection);
        self
    }
}

/// Public view of a scope frame
#[derive(Debug, Clone, PartialEq)]
pub struct ScopeInfo {
    pub id: u64,
    pub depth: usize,
    pub item_type: &'static str,
    pub mode: ChangeTrackingMode,
    pub auto_commit: bool,
    pub is_new: bool,
    pub state: ScopeState,
    pub has_item: bool,
    pub has_snapshot: bool,
}

/// What a commit did
#[derive(Debug, Clone, Default)]
pub struct CommitOutcome {
    /// `None` when no scope was active
    pub mode: Option<ChangeTrackingMode>,
    pub success: bool,
    pub new: usize,
    pub dirty: usize,
    pub deleted: usize,
    /// Rendered statements, filled in `Debug` mode
    pub statements: Vec<Statement>,
    /// Statements executed by the backend
    pub executed: usize,
    pub rows_affected: usize,
    pub generated_keys: Vec<GeneratedKey>,
}

impl CommitOutcome {
    /// Number of extracted change nodes
    pub fn changes(&self) -> usize {
        self.new + self.dirty + self.deleted
    }
}

/// Pending changes of an entity against the current scope
#[derive(Debug, Clone, PartialEq)]
pub struct PendingChanges {
    pub state: ObjectState,
    pub new: usize,
    pub dirty: usize,
    pub deleted: usize,
    /// Indented dump of the change tree
    pub tree: String,
}

impl PendingChanges {
    pub fn is_empty(&self) -> bool {
        self.new + self.dirty + self.deleted == 0
    }
}

type ErasedOp<B> = fn(&UnitOfWork<B>, &Rc<dyn Any>) -> Result<bool>;

/// Type-erased tracked item with its typed commit and rollback entry points
struct TrackedItem<B: Backend> {
    item: Rc<dyn Any>,
    commit: ErasedOp<B>,
    rollback: ErasedOp<B>,
}

impl<B: Backend> Clone for TrackedItem<B> {
    fn clone(&self) -> Self {
        Self {
            item: Rc::clone(&self.item),
            commit: self.commit,
            rollback: self.rollback,
        }
    }
}

fn commit_erased<B: Backend, T: Trackable>(uow: &UnitOfWork<B>, item: &Rc<dyn Any>) -> Result<bool> {
    let tracked = Tracked::<T>::from_erased(item).ok_or_else(|| mismatch::<T>("erased item"))?;
    uow.commit(&tracked)
}

fn rollback_erased<B: Backend, T: Trackable>(
    uow: &UnitOfWork<B>,
    item: &Rc<dyn Any>,
) -> Result<bool> {
    let tracked = Tracked::<T>::from_erased(item).ok_or_else(|| mismatch::<T>("erased item"))?;
    uow.rollback(&tracked)
}

fn mismatch<T>(found: &'static str) -> TrackError {
    TrackError::TypeMismatch {
        expected: type_name::<T>(),
        found,
    }
}

struct Frame<B: Backend> {
    id: u64,
    tracked: Option<TrackedItem<B>>,
    item_type: TypeId,
    type_name: &'static str,
    snapshot: Option<Bytes>,
    original: Option<Box<dyn Any>>,
    is_new: bool,
    auto_commit: bool,
    mode: ChangeTrackingMode,
    state: ScopeState,
    vote: Option<Vote>,
    connection: Option<Rc<RefCell<B::Connection>>>,
}

impl<B: Backend> Frame<B> {
    fn clear(&mut self, state: ScopeState) {
        self.tracked = None;
        self.snapshot = None;
        self.original = None;
        self.state = state;
    }
}

/// Frame fields a commit needs after releasing the stack borrow
struct ActiveFrame<C> {
    id: u64,
    mode: ChangeTrackingMode,
    is_new: bool,
    connection: Option<Rc<RefCell<C>>>,
}

/// Change-tracking context holding the scope stack
pub struct UnitOfWork<B: Backend> {
    backend: B,
    config: TrackerConfig,
    codec: SnapshotCodec,
    hasher: Box<dyn ContentHash>,
    frames: RefCell<Vec<Frame<B>>>,
    ambient: RefCell<Option<AmbientTransaction<B::Connection>>>,
    next_id: Cell<u64>,
    last_transaction: Cell<Option<TransactionOutcome>>,
}

impl<B: Backend> UnitOfWork<B> {
    pub fn new(backend: B) -> Self {
        Self::with_config(backend, TrackerConfig::default())
    }

    pub fn with_config(backend: B, config: TrackerConfig) -> Self {
        Self {
            codec: config.codec(),
            backend,
            config,
            hasher: Box::new(KeyedContentHash),
            frames: RefCell::new(Vec::new()),
            ambient: RefCell::new(None),
            next_id: Cell::new(1),
            last_transaction: Cell::new(None),
        }
    }

    /// Replace the content hash used to correlate list items
    pub fn with_hasher<H: ContentHash + 'static>(mut self, hasher: H) -> Self {
        self.hasher = Box::new(hasher);
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Number of open scopes
    pub fn depth(&self) -> usize {
        self.frames.borrow().len()
    }

    /// Innermost scope, if any
    pub fn current(&self) -> Option<ScopeInfo> {
        let frames = self.frames.borrow();
        frames.last().map(|f| frame_info(f, frames.len()))
    }

    /// Whether an ambient transaction is in progress
    pub fn in_transaction(&self) -> bool {
        self.ambient.borrow().is_some()
    }

    /// Outcome of the most recently finished ambient transaction
    pub fn last_transaction(&self) -> Option<TransactionOutcome> {
        self.last_transaction.get()
    }

    /// Open a scope. It stays active until the returned guard is dropped.
    pub fn open<T: Trackable>(&self, options: ScopeOptions<T, B::Connection>) -> Result<Scope<'_, B>> {
        let ScopeOptions {
            item,
            declared,
            auto_commit,
            mode,
            connection,
        } = options;
        if item.is_none() && !declared {
            return Err(TrackError::InvalidUsage(
                "a scope needs an item or a declared type".to_string(),
            ));
        }

        let (tracked, snapshot) = match &item {
            Some(item) => {
                let entity = item
                    .0
                    .try_borrow()
                    .map_err(|_| borrowed::<T>())?;
                if entity.is_read_only() {
                    return Err(TrackError::ReadOnly(entity.descriptor().name));
                }
                let snapshot = self.codec.snapshot(&*entity)?;
                let tracked = TrackedItem {
                    item: item.erased(),
                    commit: commit_erased::<B, T>,
                    rollback: rollback_erased::<B, T>,
                };
                (Some(tracked), Some(snapshot))
            }
            None => (None, None),
        };

        let vote = if connection.is_none() && self.config.ambient_transactions {
            let mut ambient = self.ambient.borrow_mut();
            if ambient.is_none() {
                *ambient = Some(AmbientTransaction::begin(
                    &self.backend,
                    self.config.isolation_level,
                )?);
            }
            ambient.as_mut().map(|tx| tx.enlist())
        } else {
            None
        };

        let id = self.next_id.get();
        self.next_id.set(id + 1);
        let frame = Frame {
            id,
            is_new: tracked.is_none(),
            tracked,
            item_type: TypeId::of::<T>(),
            type_name: type_name::<T>(),
            snapshot,
            original: None,
            auto_commit: auto_commit.unwrap_or(self.config.auto_commit),
            mode: mode.unwrap_or(self.config.default_mode),
            state: ScopeState::Open,
            vote,
            connection,
        };
        let mut frames = self.frames.borrow_mut();
        tracing::info!(
            scope = id,
            depth = frames.len() + 1,
            mode = ?frame.mode,
            auto_commit = frame.auto_commit,
            "opened scope for {}",
            frame.type_name
        );
        frames.push(frame);
        Ok(Scope {
            uow: self,
            id,
            failed: Cell::new(false),
        })
    }

    /// Run `f` inside a scope. An `Err` from `f` marks the scope failed, so
    /// an auto-commit scope rolls back instead of committing.
    pub fn run<T, R, F>(&self, options: ScopeOptions<T, B::Connection>, f: F) -> Result<R>
    where
        T: Trackable,
        F: FnOnce(&Scope<'_, B>) -> Result<R>,
    {
        let scope = self.open(options)?;
        let result = f(&scope);
        if result.is_err() {
            scope.fail();
        }
        drop(scope);
        result
    }

    /// Baseline of the innermost scope, restored from its snapshot on first
    /// use. `None` without a scope or for a new entity.
    pub fn old<T: Trackable>(&self) -> Result<Option<T>> {
        let mut frames = self.frames.borrow_mut();
        let Some(top) = frames.last_mut() else {
            return Ok(None);
        };
        if top.item_type != TypeId::of::<T>() {
            return Err(mismatch::<T>(top.type_name));
        }
        if let Some(cached) = &top.original {
            return Ok(cached.downcast_ref::<T>().cloned());
        }
        let restored: T = match &top.snapshot {
            Some(snapshot) => self.codec.restore(snapshot)?,
            None => return Ok(None),
        };
        top.original = Some(Box::new(restored.clone()));
        Ok(Some(restored))
    }

    /// Diff `item` against the innermost scope without persisting anything
    pub fn pending<T: Trackable>(&self, item: &Tracked<T>) -> Result<Option<PendingChanges>> {
        let Some(is_new) = self.frames.borrow().last().map(|f| f.is_new) else {
            return Ok(None);
        };
        let old: Option<T> = self.old()?;
        let current = item.0.try_borrow().map_err(|_| borrowed::<T>())?;
        let current: &dyn Entity = &*current;
        let tree = GraphDiffer::new(&*self.hasher, is_new)
            .diff(Some(current), old.as_ref().map(|o| o as &dyn Entity))?;
        let batch = ChangeBatch::from_tree(&tree);
        Ok(Some(PendingChanges {
            state: tree.root().map_or(ObjectState::Clean, |r| tree.state(r)),
            new: batch.new.len(),
            dirty: batch.dirty.len(),
            deleted: batch.deleted.len(),
            tree: tree.render(),
        }))
    }

    /// Persist the changes made to `item` since the innermost scope opened.
    /// Returns `true` without a scope.
    pub fn commit<T: Trackable>(&self, item: &Tracked<T>) -> Result<bool> {
        Ok(self.commit_detailed(item)?.success)
    }

    pub fn commit_detailed<T: Trackable>(&self, item: &Tracked<T>) -> Result<CommitOutcome> {
        let Some(frame) = self.active_frame()? else {
            return Ok(CommitOutcome {
                success: true,
                ..CommitOutcome::default()
            });
        };
        let mut outcome = CommitOutcome {
            mode: Some(frame.mode),
            ..CommitOutcome::default()
        };

        match frame.mode {
            ChangeTrackingMode::Manual => outcome.success = true,
            ChangeTrackingMode::Automatic | ChangeTrackingMode::Debug => {
                let old: Option<T> = self.old()?;
                let keys = {
                    let current = item.0.try_borrow().map_err(|_| borrowed::<T>())?;
                    let current: &dyn Entity = &*current;
                    let tree = GraphDiffer::new(&*self.hasher, frame.is_new)
                        .diff(Some(current), old.as_ref().map(|o| o as &dyn Entity))?;
                    let batch = ChangeBatch::from_tree(&tree);
                    outcome.new = batch.new.len();
                    outcome.dirty = batch.dirty.len();
                    outcome.deleted = batch.deleted.len();

                    if frame.mode == ChangeTrackingMode::Debug {
                        outcome.statements =
                            self.backend.build(&batch).map_err(TrackError::backend)?;
                        for statement in &outcome.statements {
                            tracing::info!(
                                scope = frame.id,
                                params = ?statement.params,
                                "debug: {}",
                                statement.sql
                            );
                        }
                        Vec::new()
                    } else if batch.is_empty() {
                        outcome.success = true;
                        Vec::new()
                    } else {
                        let report = self.execute(frame.connection.clone(), &batch)?;
                        outcome.success = true;
                        key_paths(&tree, report, &mut outcome)
                    }
                };
                if !keys.is_empty() {
                    let mut live = item.0.try_borrow_mut().map_err(|_| borrowed::<T>())?;
                    for (path, property, value) in keys {
                        match locate_mut(&mut *live, &path) {
                            Some(target) => {
                                propagate_key(target, property, &value);
                            }
                            None => tracing::warn!(
                                scope = frame.id,
                                property,
                                "generated key has no target in the live graph"
                            ),
                        }
                    }
                }
            }
        }

        tracing::info!(
            scope = frame.id,
            mode = ?frame.mode,
            new = outcome.new,
            dirty = outcome.dirty,
            deleted = outcome.deleted,
            success = outcome.success,
            "commit"
        );

        if outcome.success {
            if self.depth() > 1 {
                self.update_outer_snapshot(item)?;
            }
            self.close_frame(frame.id, ScopeState::Committed);
        }
        Ok(outcome)
    }

    /// Restore `item` from the innermost scope's snapshot. Returns `false`
    /// without a scope.
    pub fn rollback<T: Trackable>(&self, item: &Tracked<T>) -> Result<bool> {
        let Some(frame) = self.active_frame()? else {
            return Ok(false);
        };
        if let Some(old) = self.old::<T>()? {
            let mut live = item.0.try_borrow_mut().map_err(|_| borrowed::<T>())?;
            *live = old;
        }
        self.close_frame(frame.id, ScopeState::RolledBack);
        tracing::info!(scope = frame.id, "rolled back {}", type_name::<T>());
        Ok(true)
    }

    fn active_frame(&self) -> Result<Option<ActiveFrame<B::Connection>>> {
        let frames = self.frames.borrow();
        let Some(top) = frames.last() else {
            return Ok(None);
        };
        if top.state != ScopeState::Open {
            return Err(TrackError::ScopeClosed(top.state.label()));
        }
        Ok(Some(ActiveFrame {
            id: top.id,
            mode: top.mode,
            is_new: top.is_new,
            connection: top.connection.clone(),
        }))
    }

    fn execute(
        &self,
        external: Option<Rc<RefCell<B::Connection>>>,
        batch: &ChangeBatch<'_, '_>,
    ) -> Result<ExecutionReport> {
        let shared = external.or_else(|| self.ambient.borrow().as_ref().map(|tx| tx.connection()));
        let report = match shared {
            Some(conn) => {
                let mut conn: RefMut<'_, B::Connection> = conn
                    .try_borrow_mut()
                    .map_err(|_| TrackError::InvalidUsage("connection is in use".to_string()))?;
                self.backend.execute(&mut conn, batch)
            }
            None => {
                let mut conn = self.backend.connect().map_err(TrackError::backend)?;
                self.backend.execute(&mut conn, batch)
            }
        };
        report.map_err(TrackError::backend)
    }

    /// Refresh the snapshot of the enclosing scope when it tracks the same
    /// instance as the innermost one
    fn update_outer_snapshot<T: Trackable>(&self, item: &Tracked<T>) -> Result<()> {
        let mut frames = self.frames.borrow_mut();
        let Some(outer_index) = frames.len().checked_sub(2) else {
            return Ok(());
        };
        let outer = &mut frames[outer_index];
        let same = outer
            .tracked
            .as_ref()
            .is_some_and(|t| item.same_instance(&t.item));
        if !same {
            return Ok(());
        }
        let current = item.0.try_borrow().map_err(|_| borrowed::<T>())?;
        outer.snapshot = Some(self.codec.snapshot(&*current)?);
        outer.original = None;
        tracing::debug!(scope = outer.id, "outer snapshot refreshed");
        Ok(())
    }

    fn close_frame(&self, id: u64, state: ScopeState) {
        let mut frames = self.frames.borrow_mut();
        if let Some(frame) = frames.iter_mut().rev().find(|f| f.id == id) {
            frame.clear(state);
            if state == ScopeState::Committed {
                if let Some(vote) = frame.vote.as_mut() {
                    vote.complete();
                }
            }
        }
    }

    fn dispose(&self, id: u64, failed: bool) {
        let auto = {
            let frames = self.frames.borrow();
            match frames.last() {
                Some(f) if f.id == id && f.auto_commit && f.state == ScopeState::Open => {
                    f.tracked.clone()
                }
                _ => None,
            }
        };
        if let Some(tracked) = auto {
            let committed = !failed
                && match (tracked.commit)(self, &tracked.item) {
                    Ok(ok) => ok,
                    Err(e) => {
                        tracing::error!(scope = id, error = %e, "auto-commit failed");
                        false
                    }
                };
            if !committed {
                if let Err(e) = (tracked.rollback)(self, &tracked.item) {
                    tracing::error!(scope = id, error = %e, "auto-rollback failed");
                }
            }
        }

        let frame = {
            let mut frames = self.frames.borrow_mut();
            let Some(pos) = frames.iter().rposition(|f| f.id == id) else {
                return;
            };
            if pos + 1 != frames.len() {
                tracing::warn!(scope = id, "scope disposed out of order");
            }
            frames.remove(pos)
        };
        tracing::debug!(scope = id, state = frame.state.label(), "scope closed");
        if let Some(vote) = frame.vote {
            self.leave_ambient(vote);
        }
    }

    fn leave_ambient(&self, vote: Vote) {
        let finished = {
            let mut ambient = self.ambient.borrow_mut();
            let last = match ambient.as_mut() {
                Some(tx) => tx.leave(vote),
                None => false,
            };
            if last { ambient.take() } else { None }
        };
        let Some(tx) = finished else {
            return;
        };
        match tx.finish(&self.backend) {
            Ok(outcome) => self.last_transaction.set(Some(outcome)),
            Err(e) => {
                tracing::error!(error = %e, "ambient transaction could not be finished");
                self.last_transaction.set(Some(TransactionOutcome::RolledBack));
            }
        }
    }
}

fn frame_info<B: Backend>(frame: &Frame<B>, depth: usize) -> ScopeInfo {
    ScopeInfo {
        id: frame.id,
        depth,
        item_type: frame.type_name,
        mode: frame.mode,
        auto_commit: frame.auto_commit,
        is_new: frame.is_new,
        state: frame.state,
        has_item: frame.tracked.is_some(),
        has_snapshot: frame.snapshot.is_some(),
    }
}

fn borrowed<T>() -> TrackError {
    TrackError::InvalidUsage(format!("{} is already borrowed", type_name::<T>()))
}

/// Resolve generated keys to owned paths so they survive the change tree
fn key_paths(
    tree: &ChangeTree<'_>,
    report: ExecutionReport,
    outcome: &mut CommitOutcome,
) -> Vec<(Vec<PathStep>, &'static str, Value)> {
    outcome.executed = report.statements;
    outcome.rows_affected = report.rows_affected;
    let keys = report
        .generated_keys
        .iter()
        .map(|k| (tree.path(k.node), k.property, k.value.clone()))
        .collect();
    outcome.generated_keys = report.generated_keys;
    keys
}

/// Guard for an open scope
pub struct Scope<'u, B: Backend> {
    uow: &'u UnitOfWork<B>,
    id: u64,
    failed: Cell<bool>,
}

impl<'u, B: Backend> Scope<'u, B> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn unit_of_work(&self) -> &'u UnitOfWork<B> {
        self.uow
    }

    /// Mark the protected block as failed
    pub fn fail(&self) {
        self.failed.set(true);
    }

    pub fn is_failed(&self) -> bool {
        self.failed.get()
    }

    pub fn info(&self) -> Option<ScopeInfo> {
        let frames = self.uow.frames.borrow();
        frames
            .iter()
            .position(|f| f.id == self.id)
            .map(|pos| frame_info(&frames[pos], pos + 1))
    }

    pub fn commit<T: Trackable>(&self, item: &Tracked<T>) -> Result<bool> {
        self.ensure_innermost()?;
        self.uow.commit(item)
    }

    pub fn commit_detailed<T: Trackable>(&self, item: &Tracked<T>) -> Result<CommitOutcome> {
        self.ensure_innermost()?;
        self.uow.commit_detailed(item)
    }

    pub fn rollback<T: Trackable>(&self, item: &Tracked<T>) -> Result<bool> {
        self.ensure_innermost()?;
        self.uow.rollback(item)
    }

    pub fn old<T: Trackable>(&self) -> Result<Option<T>> {
        self.ensure_innermost()?;
        self.uow.old()
    }

    pub fn pending<T: Trackable>(&self, item: &Tracked<T>) -> Result<Option<PendingChanges>> {
        self.ensure_innermost()?;
        self.uow.pending(item)
    }

    fn ensure_innermost(&self) -> Result<()> {
        match self.uow.frames.borrow().last() {
            Some(f) if f.id == self.id => Ok(()),
            _ => Err(TrackError::InvalidUsage(
                "scope is not the innermost open scope".to_string(),
            )),
        }
    }
}

impl<B: Backend> Drop for Scope<'_, B> {
    fn drop(&mut self) {
        let failed = self.failed.get() || std::thread::panicking();
        self.uow.dispose(self.id, failed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{alfki, order, Customer, Order};
    use crate::memory::MemoryBackend;

    fn seeded() -> UnitOfWork<MemoryBackend> {
        let backend = MemoryBackend::new();
        backend.seed(&alfki()).unwrap();
        UnitOfWork::new(backend)
    }

    fn city(uow: &UnitOfWork<MemoryBackend>) -> Option<Value> {
        uow.backend()
            .database()
            .get("Customers", "ALFKI")
            .and_then(|row| row.get("City").cloned().flatten())
    }

    #[test]
    fn test_open_requires_item_or_type() {
        let uow = UnitOfWork::new(MemoryBackend::new());
        let err = uow.open(ScopeOptions::<Customer, _>::default()).err().unwrap();
        assert!(matches!(err, TrackError::InvalidUsage(_)));
        assert_eq!(uow.depth(), 0);
    }

    #[test]
    fn test_no_scope_is_benign() {
        let uow = UnitOfWork::new(MemoryBackend::new());
        let item = Tracked::new(alfki());
        assert!(uow.commit(&item).unwrap());
        assert!(!uow.rollback(&item).unwrap());
        assert!(uow.old::<Customer>().unwrap().is_none());
        assert!(uow.pending(&item).unwrap().is_none());
        assert!(uow.current().is_none());
    }

    #[test]
    fn test_commit_persists_and_clears() {
        let uow = seeded();
        let item = Tracked::new(alfki());
        {
            let scope = uow.open(ScopeOptions::track(&item)).unwrap();
            item.borrow_mut().city = Some("Paris".into());
            let outcome = scope.commit_detailed(&item).unwrap();
            assert!(outcome.success);
            assert_eq!(outcome.executed, 1);
            let info = scope.info().unwrap();
            assert_eq!(info.state, ScopeState::Committed);
            assert!(!info.has_item);
            assert!(!info.has_snapshot);
            assert!(matches!(
                scope.commit(&item),
                Err(TrackError::ScopeClosed("committed"))
            ));
        }
        assert_eq!(uow.last_transaction(), Some(TransactionOutcome::Committed));
        assert_eq!(city(&uow), Some(Value::Text("Paris".into())));
    }

    #[test]
    fn test_generated_keys_flow_back() {
        let uow = seeded();
        let item = Tracked::new(alfki());
        let scope = uow.open(ScopeOptions::track(&item)).unwrap();
        item.borrow_mut().orders.push(order(0, "10115"));
        let outcome = scope.commit_detailed(&item).unwrap();
        assert_eq!(outcome.generated_keys.len(), 1);
        assert_eq!(item.borrow().orders[2].id, 3);
        drop(scope);
        let db = uow.backend().database();
        assert_eq!(db.count("Orders"), 3);
    }

    #[test]
    fn test_rollback_restores_entity() {
        let uow = seeded();
        let item = Tracked::new(alfki());
        let scope = uow.open(ScopeOptions::track(&item)).unwrap();
        item.borrow_mut().name = Some("Changed".into());
        item.borrow_mut().orders.clear();
        assert_eq!(scope.old::<Customer>().unwrap().unwrap(), alfki());
        assert!(scope.rollback(&item).unwrap());
        assert_eq!(*item.borrow(), alfki());
        drop(scope);
        assert_eq!(uow.last_transaction(), Some(TransactionOutcome::RolledBack));
    }

    #[test]
    fn test_old_type_mismatch() {
        let uow = seeded();
        let item = Tracked::new(alfki());
        let _scope = uow.open(ScopeOptions::track(&item)).unwrap();
        assert!(matches!(
            uow.old::<Order>(),
            Err(TrackError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_debug_mode_builds_without_executing() {
        let uow = seeded();
        let item = Tracked::new(alfki());
        let scope = uow
            .open(ScopeOptions::track(&item).mode(ChangeTrackingMode::Debug))
            .unwrap();
        item.borrow_mut().city = Some("Paris".into());
        let outcome = scope.commit_detailed(&item).unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.statements.len(), 1);
        assert!(outcome.statements[0].sql.starts_with("UPDATE Customers"));
        assert_eq!(scope.info().unwrap().state, ScopeState::Open);
        drop(scope);
        assert_eq!(city(&uow), Some(Value::Text("Berlin".into())));
    }

    #[test]
    fn test_manual_mode_skips_diff() {
        let uow = seeded();
        let item = Tracked::new(alfki());
        let scope = uow
            .open(ScopeOptions::track(&item).mode(ChangeTrackingMode::Manual))
            .unwrap();
        item.borrow_mut().city = Some("Paris".into());
        let outcome = scope.commit_detailed(&item).unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.changes(), 0);
        drop(scope);
        assert_eq!(uow.last_transaction(), Some(TransactionOutcome::Committed));
        assert_eq!(city(&uow), Some(Value::Text("Berlin".into())));
    }

    #[test]
    fn test_nested_commit_refreshes_outer_snapshot() {
        let uow = seeded();
        let item = Tracked::new(alfki());
        let outer = uow.open(ScopeOptions::track(&item)).unwrap();
        {
            let inner = uow.open(ScopeOptions::track(&item)).unwrap();
            item.borrow_mut().city = Some("Paris".into());
            assert!(inner.commit(&item).unwrap());
            assert!(outer.commit(&item).is_err());
        }
        let pending = outer.pending(&item).unwrap().unwrap();
        assert!(pending.is_empty());
        let outcome = outer.commit_detailed(&item).unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.changes(), 0);
        drop(outer);
        assert_eq!(uow.last_transaction(), Some(TransactionOutcome::Committed));
        assert_eq!(city(&uow), Some(Value::Text("Paris".into())));
    }

    #[test]
    fn test_inner_without_vote_dooms_transaction() {
        let uow = seeded();
        let item = Tracked::new(alfki());
        let outer = uow.open(ScopeOptions::track(&item)).unwrap();
        {
            let inner = uow.open(ScopeOptions::track(&item)).unwrap();
            item.borrow_mut().city = Some("Paris".into());
            assert!(inner.commit(&item).unwrap());
            assert!(uow.in_transaction());
        }
        {
            let _abandoned = uow.open(ScopeOptions::<Customer, _>::declare()).unwrap();
        }
        assert!(outer.commit(&item).unwrap());
        drop(outer);
        assert!(!uow.in_transaction());
        assert_eq!(uow.last_transaction(), Some(TransactionOutcome::RolledBack));
        assert_eq!(city(&uow), Some(Value::Text("Berlin".into())));
    }

    #[test]
    fn test_auto_commit_on_drop() {
        let uow = seeded();
        let item = Tracked::new(alfki());
        {
            let _scope = uow
                .open(ScopeOptions::track(&item).auto_commit(true))
                .unwrap();
            item.borrow_mut().city = Some("Lyon".into());
        }
        assert_eq!(city(&uow), Some(Value::Text("Lyon".into())));
        assert_eq!(item.borrow().city.as_deref(), Some("Lyon"));
    }

    #[test]
    fn test_primary_key_change_with_new_order() {
        let uow = seeded();
        let item = Tracked::new(alfki());
        let scope = uow.open(ScopeOptions::track(&item)).unwrap();
        item.borrow_mut().id = "ALFKJ".into();
        item.borrow_mut().orders.push(order(0, "99999"));
        let outcome = scope.commit_detailed(&item).unwrap();
        assert!(outcome.success);
        assert_eq!((outcome.new, outcome.dirty, outcome.deleted), (2, 0, 1));
        assert_eq!(item.borrow().orders[2].id, 3);
        drop(scope);

        let db = uow.backend().database();
        assert_eq!(db.count("Orders"), 3);
        assert!(db.get("Customers", "ALFKI").is_none());
        assert!(db.get("Customers", "ALFKJ").is_some());
    }

    #[test]
    fn test_auto_commit_backend_failure_rolls_back() {
        let uow = seeded();
        let item = Tracked::new(alfki());
        {
            let _scope = uow
                .open(ScopeOptions::track(&item).auto_commit(true))
                .unwrap();
            uow.backend().reject("Orders");
            item.borrow_mut().orders.clear();
        }
        assert_eq!(*item.borrow(), alfki());
        assert_eq!(uow.depth(), 0);
        assert_eq!(uow.last_transaction(), Some(TransactionOutcome::RolledBack));
        assert_eq!(uow.backend().database().count("Orders"), 2);
    }

    #[test]
    fn test_failed_run_rolls_back() {
        let uow = seeded();
        let item = Tracked::new(alfki());
        let result: Result<()> = uow.run(ScopeOptions::track(&item).auto_commit(true), |_| {
            item.borrow_mut().city = Some("Lyon".into());
            Err(TrackError::InvalidUsage("boom".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(item.borrow().city.as_deref(), Some("Berlin"));
        assert_eq!(city(&uow), Some(Value::Text("Berlin".into())));
        assert_eq!(uow.depth(), 0);
    }

    #[test]
    fn test_external_connection_skips_ambient() {
        let uow = seeded();
        let conn = Rc::new(RefCell::new(uow.backend().connect().unwrap()));
        let item = Tracked::new(alfki());
        let scope = uow
            .open(ScopeOptions::track(&item).connection(Rc::clone(&conn)))
            .unwrap();
        assert!(!uow.in_transaction());
        item.borrow_mut().city = Some("Paris".into());
        assert!(scope.commit(&item).unwrap());
        drop(scope);
        assert_eq!(uow.last_transaction(), None);
        assert_eq!(city(&uow), Some(Value::Text("Paris".into())));
    }

    #[test]
    fn test_declared_scope_inserts_new_entity() {
        let uow = UnitOfWork::new(MemoryBackend::new());
        let scope = uow.open(ScopeOptions::<Customer, _>::declare()).unwrap();
        assert!(scope.info().unwrap().is_new);
        let item = Tracked::new(alfki());
        let outcome = scope.commit_detailed(&item).unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.new, 3);
        drop(scope);
        assert_eq!(uow.backend().database().count("Orders"), 2);
    }
}
