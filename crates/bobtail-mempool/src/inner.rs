//! Inner mempool state protected by the outer RwLock.

use crate::arena::{MemPoolArena, TxMemPoolEntry};
use crate::error::MempoolError;
use crate::types::{EntryId, NewEntry};
use bitcoin::{Amount, OutPoint, SignedAmount, Txid};
use std::collections::{HashMap, HashSet};

/// Mempool state: the entry arena plus the maps that tie entries to the
/// outpoints they spend and to operator overrides.
pub struct MemPoolInner {
    pub(crate) arena: MemPoolArena,

    /// Which mempool transaction spends each outpoint (conflict detection).
    map_next_tx: HashMap<OutPoint, Txid>,

    /// Operator overrides: per-txid priority and fee deltas. Kept for
    /// transactions that are not (yet) in the pool.
    map_deltas: HashMap<Txid, (f64, SignedAmount)>,

    total_tx_size: u64,
    total_fee: Amount,
}

impl MemPoolInner {
    pub fn new() -> Self {
        Self {
            arena: MemPoolArena::new(),
            map_next_tx: HashMap::new(),
            map_deltas: HashMap::new(),
            total_tx_size: 0,
            total_fee: Amount::ZERO,
        }
    }

    pub fn get(&self, id: EntryId) -> Option<&TxMemPoolEntry> {
        self.arena.get(id)
    }

    pub fn get_by_txid(&self, txid: &Txid) -> Option<EntryId> {
        self.arena.get_by_txid(txid)
    }

    pub fn contains(&self, txid: &Txid) -> bool {
        self.arena.get_by_txid(txid).is_some()
    }

    /// Iterate in ascending txid order.
    pub fn iter(&self) -> impl Iterator<Item = (EntryId, &TxMemPoolEntry)> {
        self.arena.iter()
    }

    /// Iterate by single-transaction mining score, best first.
    pub fn iter_by_mining_score(&self) -> impl Iterator<Item = (EntryId, &TxMemPoolEntry)> {
        self.arena.iter_by_mining_score()
    }

    /// Iterate by ancestor score, best first.
    pub fn iter_by_ancestor_score(&self) -> impl Iterator<Item = (EntryId, &TxMemPoolEntry)> {
        self.arena.iter_by_ancestor_score()
    }

    /// The transaction currently spending `outpoint`, if any.
    pub fn get_conflict_tx(&self, outpoint: &OutPoint) -> Option<Txid> {
        self.map_next_tx.get(outpoint).copied()
    }

    /// Fold the operator overrides for `txid` into `priority` and `fee`.
    pub fn apply_deltas(&self, txid: &Txid, priority: &mut f64, fee: &mut SignedAmount) {
        if let Some((priority_delta, fee_delta)) = self.map_deltas.get(txid) {
            *priority += priority_delta;
            *fee = SignedAmount::from_sat(fee.to_sat() + fee_delta.to_sat());
        }
    }

    /// Record operator deltas for `txid` and, if the transaction is already
    /// pooled, push the fee delta through its entry and every descendant's
    /// ancestor summary.
    pub fn prioritise(&mut self, txid: Txid, priority_delta: f64, fee_delta: SignedAmount) {
        let slot = self.map_deltas.entry(txid).or_insert((0.0, SignedAmount::ZERO));
        slot.0 += priority_delta;
        slot.1 = SignedAmount::from_sat(slot.1.to_sat() + fee_delta.to_sat());

        if fee_delta == SignedAmount::ZERO {
            return;
        }
        if let Some(id) = self.arena.get_by_txid(&txid) {
            self.arena.adjust_modified_fee(id, fee_delta);

            let mut descendants = HashSet::new();
            self.calculate_descendants(id, &mut descendants);
            descendants.remove(&id);
            for descendant in descendants {
                self.arena.adjust_ancestor_fees(descendant, fee_delta);
            }
        }
        tracing::info!(%txid, fee_delta = fee_delta.to_sat(), "prioritised transaction");
    }

    /// Admit a transaction whose fee and sig-op count were established by
    /// validation. Links it to its in-pool parents and charges the full
    /// ancestor summary.
    pub fn add_entry(&mut self, new_entry: NewEntry) -> Result<EntryId, MempoolError> {
        let txid = new_entry.tx.compute_txid();
        if self.contains(&txid) {
            return Err(MempoolError::AlreadyInMempool);
        }
        for txin in &new_entry.tx.input {
            if let Some(spender) = self.get_conflict_tx(&txin.previous_output) {
                return Err(MempoolError::TxConflict(spender));
            }
        }

        let parents: HashSet<EntryId> = new_entry
            .tx
            .input
            .iter()
            .filter_map(|txin| self.arena.get_by_txid(&txin.previous_output.txid))
            .collect();

        let mut entry = TxMemPoolEntry::new(
            new_entry.tx.clone(),
            new_entry.fee,
            new_entry.sigops,
            new_entry.time_micros,
            new_entry.entry_height,
            new_entry.entry_priority,
            new_entry.in_chain_input_value,
        );
        entry.parents = parents.clone();

        let id = self.arena.insert(entry);

        // Pre-existing operator delta applies on entry, like any other fee.
        if let Some((_, fee_delta)) = self.map_deltas.get(&txid).copied() {
            if fee_delta != SignedAmount::ZERO {
                self.arena.adjust_modified_fee(id, fee_delta);
            }
        }

        for &parent in &parents {
            if let Some(parent_entry) = self.arena.get_mut(parent) {
                parent_entry.children.insert(id);
            }
        }

        self.recompute_ancestor_state(id);

        for txin in &new_entry.tx.input {
            self.map_next_tx.insert(txin.previous_output, txid);
        }

        let entry = self.arena.get(id).expect("entry just inserted");
        self.total_tx_size += entry.tx_size;
        self.total_fee = Amount::from_sat(self.total_fee.to_sat() + entry.fee.to_sat());

        Ok(id)
    }

    /// Collect the in-pool ancestors of `id` into `out`, not including `id`
    /// itself. The walk does not descend past entries in `stop`: an
    /// ancestor in the stop set is omitted along with everything above it
    /// on that path.
    pub fn calculate_mempool_ancestors(
        &self,
        id: EntryId,
        out: &mut HashSet<EntryId>,
        stop: &HashSet<EntryId>,
    ) {
        let Some(entry) = self.arena.get(id) else {
            return;
        };
        for &parent in &entry.parents {
            if stop.contains(&parent) || !out.insert(parent) {
                continue;
            }
            self.calculate_mempool_ancestors(parent, out, stop);
        }
    }

    /// Collect `id` and all of its descendants into `out`.
    pub fn calculate_descendants(&self, id: EntryId, out: &mut HashSet<EntryId>) {
        if !out.insert(id) {
            return;
        }
        if let Some(entry) = self.arena.get(id) {
            for &child in &entry.children {
                self.calculate_descendants(child, out);
            }
        }
    }

    /// Drop transactions confirmed in a block. Surviving descendants keep
    /// their links to each other and get their ancestor summaries rebuilt.
    pub fn remove_for_block(&mut self, confirmed: &[Txid]) {
        let removed: HashSet<EntryId> = confirmed
            .iter()
            .filter_map(|txid| self.arena.get_by_txid(txid))
            .collect();
        if removed.is_empty() {
            return;
        }

        // Survivors whose summaries reference a removed ancestor.
        let mut affected = HashSet::new();
        for &id in &removed {
            self.calculate_descendants(id, &mut affected);
        }
        for id in &removed {
            affected.remove(id);
        }

        for &id in &removed {
            let Some(entry) = self.arena.get(id) else {
                continue;
            };
            let parents: Vec<EntryId> = entry.parents.iter().copied().collect();
            let children: Vec<EntryId> = entry.children.iter().copied().collect();
            for parent in parents {
                if let Some(parent_entry) = self.arena.get_mut(parent) {
                    parent_entry.children.remove(&id);
                }
            }
            for child in children {
                if let Some(child_entry) = self.arena.get_mut(child) {
                    child_entry.parents.remove(&id);
                }
            }

            if let Some(entry) = self.arena.remove(id) {
                for txin in &entry.tx.input {
                    self.map_next_tx.remove(&txin.previous_output);
                }
                self.map_deltas.remove(&entry.txid());
                self.total_tx_size -= entry.tx_size;
                self.total_fee = Amount::from_sat(
                    self.total_fee.to_sat().saturating_sub(entry.fee.to_sat()),
                );
            }
        }

        for id in affected {
            self.recompute_ancestor_state(id);
        }
    }

    /// Rebuild the ancestor summary of `id` from a fresh walk.
    fn recompute_ancestor_state(&mut self, id: EntryId) {
        let mut ancestors = HashSet::new();
        self.calculate_mempool_ancestors(id, &mut ancestors, &HashSet::new());

        let own = self.arena.get(id).expect("summary target must exist");
        let mut size = own.tx_size;
        let mut fees = own.modified_fee;
        let mut sigops = own.sigops as u64;
        let count = 1 + ancestors.len() as u64;
        for ancestor in &ancestors {
            let entry = self.arena.get(*ancestor).expect("linked ancestor must exist");
            size += entry.tx_size;
            fees = Amount::from_sat(fees.to_sat() + entry.modified_fee.to_sat());
            sigops += entry.sigops as u64;
        }
        self.arena.set_ancestor_state(id, size, fees, sigops, count);
    }

    pub fn size(&self) -> usize {
        self.arena.len()
    }

    pub fn total_size(&self) -> u64 {
        self.total_tx_size
    }

    pub fn total_fees(&self) -> Amount {
        self.total_fee
    }
}

impl Default for MemPoolInner {
    fn default() -> Self {
        Self::new()
    }
}
