//! Transactions and the registry of running ones.
//!
//! A [`Transaction`] records every slot lock taken on its behalf. Locks are
//! held until the transaction commits or rolls back, at which point the whole
//! touched list is released through the [`LockManager`].
use std::collections::HashSet;

use log::{debug, info, warn};
use parking_lot::Mutex;

use super::{
    CommitId, TxnId,
    catalog::{Catalog, CounterKind},
    error::StorageError,
    lock::{LockManager, LockMode, SlotId},
    record::LocationPair,
};

/// Id reserved for engine-internal work such as catalog maintenance.
pub const SYSTEM_TXN_ID: TxnId = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Pending,
    Started,
    Committed,
    Aborted,
}

/// A lock taken on behalf of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Touched {
    pub slot: SlotId,
    pub location: LocationPair,
    pub mode: LockMode,
}

#[derive(Debug)]
pub struct Transaction {
    id: TxnId,
    commit_id: CommitId,
    state: TxnState,
    autocommit: bool,
    touched: Vec<Touched>,
}

impl Transaction {
    pub fn new(id: TxnId, commit_id: CommitId, autocommit: bool) -> Self {
        Self {
            id,
            commit_id,
            state: TxnState::Pending,
            autocommit,
            touched: Vec::new(),
        }
    }

    /// Already-started transaction used for catalog bootstrap and checkpoints.
    pub fn system() -> Self {
        let mut txn = Self::new(SYSTEM_TXN_ID, 0, false);
        txn.state = TxnState::Started;
        txn
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn commit_id(&self) -> CommitId {
        self.commit_id
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    pub fn autocommit(&self) -> bool {
        self.autocommit
    }

    pub fn touched(&self) -> &[Touched] {
        &self.touched
    }

    pub fn is_active(&self) -> bool {
        self.state == TxnState::Started
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, TxnState::Committed | TxnState::Aborted)
    }

    pub fn begin(&mut self) -> Result<(), StorageError> {
        if self.state != TxnState::Pending {
            return Err(self.illegal("begin"));
        }
        self.state = TxnState::Started;
        Ok(())
    }

    pub(crate) fn ensure_active(&self) -> Result<(), StorageError> {
        if self.is_active() {
            Ok(())
        } else {
            Err(StorageError::Transaction {
                id: self.id,
                reason: format!("not started (state {:?})", self.state),
            })
        }
    }

    pub fn touch(&mut self, slot: SlotId, location: LocationPair, mode: LockMode) {
        self.touched.push(Touched {
            slot,
            location,
            mode,
        });
    }

    pub fn commit(&mut self, locks: &LockManager) -> Result<(), StorageError> {
        self.finish(TxnState::Committed, locks)
    }

    pub fn rollback(&mut self, locks: &LockManager) -> Result<(), StorageError> {
        self.finish(TxnState::Aborted, locks)
    }

    fn finish(&mut self, state: TxnState, locks: &LockManager) -> Result<(), StorageError> {
        if self.state != TxnState::Started {
            return Err(self.illegal(if state == TxnState::Committed {
                "commit"
            } else {
                "roll back"
            }));
        }
        self.state = state;
        self.release_all(locks);
        debug!("txn {} {:?}", self.id, state);
        Ok(())
    }

    /// Drains the touched list, releasing every entry.
    pub(crate) fn release_all(&mut self, locks: &LockManager) {
        for touched in self.touched.drain(..) {
            if !locks.release(self.id, touched.slot, touched.mode) {
                warn!(
                    "txn {} did not hold {:?} on {:?}",
                    self.id, touched.mode, touched.slot
                );
            }
        }
    }

    fn illegal(&self, action: &str) -> StorageError {
        StorageError::Transaction {
            id: self.id,
            reason: format!("cannot {action} from state {:?}", self.state),
        }
    }
}

#[derive(Debug, Default)]
struct Registry {
    active: HashSet<TxnId>,
    completed: HashSet<TxnId>,
}

#[derive(Debug, Default)]
pub struct TransactionManager {
    registry: Mutex<Registry>,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates fresh transaction and commit ids, begins the transaction and
    /// registers it as active.
    pub fn start_transaction(
        &self,
        catalog: &Catalog,
        autocommit: bool,
    ) -> Result<Transaction, StorageError> {
        let id = catalog.next(CounterKind::Transaction)?;
        let commit_id = catalog.next(CounterKind::Commit)?;

        let mut txn = Transaction::new(id, commit_id, autocommit);
        txn.begin()?;
        self.registry.lock().active.insert(id);
        info!("started txn {id} (commit {commit_id}, autocommit {autocommit})");
        Ok(txn)
    }

    /// Moves `txn` from the active to the completed set. Ending a transaction
    /// twice is a no-op.
    pub fn end_transaction(&self, txn: &Transaction) {
        let mut registry = self.registry.lock();
        if registry.active.remove(&txn.id()) {
            registry.completed.insert(txn.id());
            debug!("ended txn {}", txn.id());
        }
    }

    pub fn is_active(&self, id: TxnId) -> bool {
        self.registry.lock().active.contains(&id)
    }

    pub fn is_completed(&self, id: TxnId) -> bool {
        self.registry.lock().completed.contains(&id)
    }

    pub fn active_count(&self) -> usize {
        self.registry.lock().active.len()
    }
}
