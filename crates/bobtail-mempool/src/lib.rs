//! # Transaction memory pool
//!
//! An index-rich, concurrently readable transaction pool:
//!
//! 1. Entries live in an arena and reference each other through stable
//!    handles, forming the unconfirmed parent/child DAG.
//! 2. Three orderings are maintained at all times: ascending txid (the
//!    canonical order), single-transaction mining score, and ancestor
//!    score. Block assembly iterates the score indices directly.
//! 3. Each entry carries a running ancestor summary (count, size, fees,
//!    sig-ops including itself) so selection never has to re-walk the
//!    whole ancestor tree per candidate.
//!
//! Admission policy (standardness, script checks, fee floors) is the
//! responsibility of the validation layer; this crate records what that
//! layer established.

mod arena;
mod error;
mod inner;
mod types;

pub use self::arena::{AncestorScoreKey, MemPoolArena, MiningScoreKey, TxMemPoolEntry};
pub use self::error::MempoolError;
pub use self::inner::MemPoolInner;
pub use self::types::{EntryId, NewEntry};

use bitcoin::{SignedAmount, Txid};
use std::sync::{RwLock, RwLockReadGuard};

/// Thread-safe transaction pool.
///
/// Readers (block assembly in particular) take the read lock once and see a
/// single consistent snapshot for the duration of the guard.
pub struct MemPool {
    inner: RwLock<MemPoolInner>,
}

impl MemPool {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemPoolInner::new()),
        }
    }

    /// Lock the pool for shared read access.
    pub fn read(&self) -> RwLockReadGuard<'_, MemPoolInner> {
        self.inner.read().expect("MemPool lock poisoned")
    }

    /// Admit a validated transaction.
    pub fn add_unchecked(&self, new_entry: NewEntry) -> Result<Txid, MempoolError> {
        let txid = new_entry.tx.compute_txid();
        self.inner
            .write()
            .expect("MemPool lock poisoned")
            .add_entry(new_entry)?;
        Ok(txid)
    }

    /// Apply operator priority/fee overrides to a transaction.
    pub fn prioritise_transaction(&self, txid: Txid, priority_delta: f64, fee_delta: SignedAmount) {
        self.inner
            .write()
            .expect("MemPool lock poisoned")
            .prioritise(txid, priority_delta, fee_delta);
    }

    /// Drop transactions confirmed in a connected block.
    pub fn remove_for_block(&self, confirmed: &[Txid]) {
        self.inner
            .write()
            .expect("MemPool lock poisoned")
            .remove_for_block(confirmed);
    }

    pub fn contains(&self, txid: &Txid) -> bool {
        self.read().contains(txid)
    }

    pub fn size(&self) -> usize {
        self.read().size()
    }

    pub fn total_size(&self) -> u64 {
        self.read().total_size()
    }
}

impl Default for MemPool {
    fn default() -> Self {
        Self::new()
    }
}
