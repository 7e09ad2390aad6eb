//! Slot-level reader/writer locks.
//!
//! Every record slot of every block has its own lock, keyed by [`SlotId`] so
//! it outlives whatever record currently occupies the slot. Locks are held on
//! behalf of a transaction and only released by that transaction's unlock
//! sweep. Acquisition blocks without timeout and there is no deadlock
//! detection; callers lock slots in index order.
use std::{collections::HashMap, sync::Arc};

use log::trace;
use parking_lot::{Condvar, Mutex};

use super::{BlockId, TableId, TxnId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId {
    pub table: TableId,
    pub block: BlockId,
    pub slot: usize,
}

impl SlotId {
    pub fn new(table: TableId, block: BlockId, slot: usize) -> Self {
        Self { table, block, slot }
    }
}

#[derive(Debug, Default)]
struct Holders {
    shared: HashMap<TxnId, usize>,
    exclusive: Option<(TxnId, usize)>,
}

impl Holders {
    fn grantable(&self, txn: TxnId, mode: LockMode) -> bool {
        let exclusive_ok = self.exclusive.is_none_or(|(owner, _)| owner == txn);
        match mode {
            LockMode::Shared => exclusive_ok,
            LockMode::Exclusive => exclusive_ok && self.shared.keys().all(|owner| *owner == txn),
        }
    }

    fn grant(&mut self, txn: TxnId, mode: LockMode) {
        match mode {
            LockMode::Shared => *self.shared.entry(txn).or_default() += 1,
            LockMode::Exclusive => {
                let count = self.exclusive.map_or(0, |(_, count)| count);
                self.exclusive = Some((txn, count + 1));
            }
        }
    }

    fn release(&mut self, txn: TxnId, mode: LockMode) -> bool {
        match mode {
            LockMode::Shared => match self.shared.get_mut(&txn) {
                Some(count) => {
                    *count -= 1;
                    if *count == 0 {
                        self.shared.remove(&txn);
                    }
                    true
                }
                None => false,
            },
            LockMode::Exclusive => match self.exclusive {
                Some((owner, count)) if owner == txn => {
                    self.exclusive = (count > 1).then_some((owner, count - 1));
                    true
                }
                _ => false,
            },
        }
    }
}

/// Reader/writer lock guarding one slot. Shared holds are counted per
/// transaction; a transaction that is the only reader may also take the
/// exclusive hold.
#[derive(Debug, Default)]
pub struct SlotLock {
    holders: Mutex<Holders>,
    released: Condvar,
}

impl SlotLock {
    pub fn acquire(&self, txn: TxnId, mode: LockMode) {
        let mut holders = self.holders.lock();
        while !holders.grantable(txn, mode) {
            self.released.wait(&mut holders);
        }
        holders.grant(txn, mode);
    }

    pub fn try_acquire(&self, txn: TxnId, mode: LockMode) -> bool {
        let mut holders = self.holders.lock();
        if holders.grantable(txn, mode) {
            holders.grant(txn, mode);
            true
        } else {
            false
        }
    }

    /// Drops one hold of `mode`. Returns `false` if `txn` held none.
    pub fn release(&self, txn: TxnId, mode: LockMode) -> bool {
        let released = self.holders.lock().release(txn, mode);
        if released {
            self.released.notify_all();
        }
        released
    }

    pub fn is_free(&self) -> bool {
        let holders = self.holders.lock();
        holders.exclusive.is_none() && holders.shared.is_empty()
    }

    /// Strongest mode `txn` currently holds.
    pub fn held_by(&self, txn: TxnId) -> Option<LockMode> {
        let holders = self.holders.lock();
        if holders.exclusive.is_some_and(|(owner, _)| owner == txn) {
            Some(LockMode::Exclusive)
        } else if holders.shared.contains_key(&txn) {
            Some(LockMode::Shared)
        } else {
            None
        }
    }
}

#[derive(Debug, Default)]
pub struct LockManager {
    slots: Mutex<HashMap<SlotId, Arc<SlotLock>>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock object of `slot`, created on first use.
    pub fn slot(&self, slot: SlotId) -> Arc<SlotLock> {
        Arc::clone(self.slots.lock().entry(slot).or_default())
    }

    /// Blocks until `txn` holds `slot` in `mode`. The manager's table is not
    /// held while waiting.
    pub fn acquire(&self, txn: TxnId, slot: SlotId, mode: LockMode) {
        trace!("txn {txn} acquiring {mode:?} on {slot:?}");
        self.slot(slot).acquire(txn, mode);
    }

    pub fn try_acquire(&self, txn: TxnId, slot: SlotId, mode: LockMode) -> bool {
        self.slot(slot).try_acquire(txn, mode)
    }

    pub fn release(&self, txn: TxnId, slot: SlotId, mode: LockMode) -> bool {
        let lock = self.slots.lock().get(&slot).cloned();
        match lock {
            Some(lock) => {
                trace!("txn {txn} releasing {mode:?} on {slot:?}");
                lock.release(txn, mode)
            }
            None => false,
        }
    }

    pub fn is_locked(&self, slot: SlotId) -> bool {
        let lock = self.slots.lock().get(&slot).cloned();
        lock.is_some_and(|l| !l.is_free())
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::mpsc, thread, time::Duration};

    use super::*;

    const SLOT: SlotId = SlotId {
        table: 1,
        block: 1,
        slot: 0,
    };

    #[test]
    fn shared_is_reentrant() {
        let locks = LockManager::new();
        locks.acquire(1, SLOT, LockMode::Shared);
        locks.acquire(1, SLOT, LockMode::Shared);
        locks.acquire(2, SLOT, LockMode::Shared);

        assert!(locks.release(1, SLOT, LockMode::Shared));
        assert!(locks.is_locked(SLOT));
        assert!(locks.release(1, SLOT, LockMode::Shared));
        assert!(locks.release(2, SLOT, LockMode::Shared));
        assert!(!locks.is_locked(SLOT));
    }

    #[test]
    fn exclusive_blocks_everyone_else() {
        let locks = LockManager::new();
        locks.acquire(1, SLOT, LockMode::Exclusive);

        assert!(!locks.try_acquire(2, SLOT, LockMode::Shared));
        assert!(!locks.try_acquire(2, SLOT, LockMode::Exclusive));
        assert!(locks.try_acquire(1, SLOT, LockMode::Shared));

        locks.release(1, SLOT, LockMode::Shared);
        locks.release(1, SLOT, LockMode::Exclusive);
        assert!(locks.try_acquire(2, SLOT, LockMode::Exclusive));
    }

    #[test]
    fn upgrade_only_as_sole_reader() {
        let locks = LockManager::new();
        locks.acquire(1, SLOT, LockMode::Shared);
        assert!(locks.try_acquire(1, SLOT, LockMode::Exclusive));
        assert_eq!(locks.slot(SLOT).held_by(1), Some(LockMode::Exclusive));

        let other = SlotId::new(1, 1, 1);
        locks.acquire(1, other, LockMode::Shared);
        locks.acquire(2, other, LockMode::Shared);
        assert!(!locks.try_acquire(1, other, LockMode::Exclusive));
    }

    #[test]
    fn release_without_hold() {
        let locks = LockManager::new();
        assert!(!locks.release(1, SLOT, LockMode::Shared));

        locks.acquire(1, SLOT, LockMode::Shared);
        assert!(!locks.release(2, SLOT, LockMode::Shared));
        assert!(!locks.release(1, SLOT, LockMode::Exclusive));
    }

    #[test]
    fn release_wakes_waiter() {
        let locks = Arc::new(LockManager::new());
        locks.acquire(1, SLOT, LockMode::Exclusive);

        let (tx, rx) = mpsc::channel();
        let waiter = {
            let locks = Arc::clone(&locks);
            thread::spawn(move || {
                locks.acquire(2, SLOT, LockMode::Exclusive);
                tx.send(()).unwrap();
            })
        };

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        locks.release(1, SLOT, LockMode::Exclusive);
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        waiter.join().unwrap();
        assert_eq!(locks.slot(SLOT).held_by(2), Some(LockMode::Exclusive));
    }
}
