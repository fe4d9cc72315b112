//! Ambient transaction
//!
//! Scopes that do not bring their own connection share one transaction per
//! [`UnitOfWork`](crate::UnitOfWork). Each participating scope holds a
//! [`Vote`]; the transaction commits only when every participant completed
//! its vote before leaving.

use crate::backend::{Backend, IsolationLevel};
use crate::error::{Result, TrackError};
use std::cell::RefCell;
use std::rc::Rc;
use uuid::Uuid;

/// How the ambient transaction ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionOutcome {
    Committed,
    RolledBack,
}

/// A participant's commit vote
#[derive(Debug)]
pub struct Vote {
    transaction: Uuid,
    completed: bool,
}

impl Vote {
    /// Vote for commit
    pub fn complete(&mut self) {
        self.completed = true;
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }
}

/// Transaction shared by nested scopes
pub struct AmbientTransaction<C> {
    id: Uuid,
    connection: Rc<RefCell<C>>,
    isolation: IsolationLevel,
    participants: usize,
    doomed: bool,
}

impl<C> AmbientTransaction<C> {
    /// Open a connection and begin the transaction on it
    pub fn begin<B>(backend: &B, isolation: IsolationLevel) -> Result<Self>
    where
        B: Backend<Connection = C>,
    {
        let mut conn = backend.connect().map_err(TrackError::backend)?;
        backend
            .begin_ambient(&mut conn, isolation)
            .map_err(TrackError::backend)?;
        let id = Uuid::new_v4();
        tracing::debug!(transaction = %id, ?isolation, "ambient transaction started");
        Ok(Self {
            id,
            connection: Rc::new(RefCell::new(conn)),
            isolation,
            participants: 0,
            doomed: false,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    pub fn connection(&self) -> Rc<RefCell<C>> {
        Rc::clone(&self.connection)
    }

    pub fn participants(&self) -> usize {
        self.participants
    }

    pub fn is_doomed(&self) -> bool {
        self.doomed
    }

    /// Register a participant
    pub fn enlist(&mut self) -> Vote {
        self.participants += 1;
        Vote {
            transaction: self.id,
            completed: false,
        }
    }

    /// Withdraw a participant. Returns `true` when it was the last one.
    pub fn leave(&mut self, vote: Vote) -> bool {
        if vote.transaction != self.id {
            tracing::warn!(transaction = %self.id, "vote from a different transaction ignored");
            return false;
        }
        if !vote.completed {
            self.doomed = true;
        }
        self.participants = self.participants.saturating_sub(1);
        self.participants == 0
    }

    /// Commit unless a participant left without voting
    pub fn finish<B>(self, backend: &B) -> Result<TransactionOutcome>
    where
        B: Backend<Connection = C>,
    {
        let commit = !self.doomed;
        let mut conn = self.connection.borrow_mut();
        backend
            .finish_ambient(&mut conn, commit)
            .map_err(TrackError::backend)?;
        let outcome = if commit {
            TransactionOutcome::Committed
        } else {
            TransactionOutcome::RolledBack
        };
        tracing::info!(transaction = %self.id, ?outcome, "ambient transaction finished");
        Ok(outcome)
    }
}
