//! Arena-based mempool entry storage with multi-index support.
//!
//! Entries live in a SlotMap and reference each other through stable
//! handles, so the parent/child DAG never holds direct references. Index
//! keys are cached inside each entry: to reindex after a mutation the old
//! key must be captured first, removed, and the recomputed key reinserted.

use crate::types::EntryId;
use bitcoin::{Amount, SignedAmount, Transaction, Txid};
use slotmap::SlotMap;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

/// Comparable key for the mining-score index: the transaction's own
/// modified fee per byte, descending.
///
/// Rates are stored negated and as integer fractions (fee * 1_000_000 /
/// size) so the BTreeSet orders without floats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MiningScoreKey {
    neg_feerate: i64,
    txid: Txid,
}

/// Comparable key for the ancestor-score index: the best fee rate the
/// transaction can achieve together with its unconfirmed ancestors,
/// descending. Smaller ancestor sets win ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct AncestorScoreKey {
    neg_feerate_frac: (i64, i64),
    txid: Txid,
}

/// A mempool entry with its cached ancestor summary.
pub struct TxMemPoolEntry {
    /// Transaction data.
    pub tx: Arc<Transaction>,

    /// Base fee paid by the transaction.
    pub fee: Amount,

    /// Fee after operator deltas; this is what selection orders by.
    pub modified_fee: Amount,

    /// Cached serialized size in bytes.
    pub tx_size: u64,

    /// Signature operation count.
    pub sigops: u32,

    /// Arrival timestamp in microseconds.
    pub time_micros: i64,

    /// Chain height when the transaction entered the pool.
    pub entry_height: u32,

    /// Coin-age priority at entry time.
    entry_priority: f64,

    /// Confirmed input value backing the priority calculation.
    in_chain_input_value: Amount,

    /// Size with per-input overhead deducted; denominator of the priority.
    mod_size: u64,

    // === Ancestor summary (includes this entry) ===
    pub count_with_ancestors: u64,
    pub size_with_ancestors: u64,
    pub fees_with_ancestors: Amount,
    pub sigops_with_ancestors: u64,

    // === Graph links (handles only) ===
    pub parents: HashSet<EntryId>,
    pub children: HashSet<EntryId>,

    // === Cached index keys, updated together with the state above ===
    cached_mining_key: MiningScoreKey,
    cached_ancestor_key: AncestorScoreKey,
}

impl TxMemPoolEntry {
    pub fn new(
        tx: Arc<Transaction>,
        fee: Amount,
        sigops: u32,
        time_micros: i64,
        entry_height: u32,
        entry_priority: f64,
        in_chain_input_value: Amount,
    ) -> Self {
        let tx_size = tx.total_size() as u64;
        let mod_size = modified_size(&tx);
        let txid = tx.compute_txid();
        let mut entry = Self {
            tx,
            fee,
            modified_fee: fee,
            tx_size,
            sigops,
            time_micros,
            entry_height,
            entry_priority,
            in_chain_input_value,
            mod_size,
            count_with_ancestors: 1,
            size_with_ancestors: tx_size,
            fees_with_ancestors: fee,
            sigops_with_ancestors: sigops as u64,
            parents: HashSet::new(),
            children: HashSet::new(),
            cached_mining_key: MiningScoreKey {
                neg_feerate: 0,
                txid,
            },
            cached_ancestor_key: AncestorScoreKey {
                neg_feerate_frac: (0, 0),
                txid,
            },
        };
        entry.cached_mining_key = MemPoolArena::compute_mining_key(&entry);
        entry.cached_ancestor_key = MemPoolArena::compute_ancestor_key(&entry);
        entry
    }

    pub fn txid(&self) -> Txid {
        self.tx.compute_txid()
    }

    /// Modified fee per byte, as a scaled integer.
    pub fn feerate(&self) -> i64 {
        (self.modified_fee.to_sat() as i64).saturating_mul(1_000_000) / self.tx_size as i64
    }

    /// Ancestor-set fee per byte, as a scaled integer.
    pub fn ancestor_feerate(&self) -> i64 {
        (self.fees_with_ancestors.to_sat() as i64).saturating_mul(1_000_000)
            / self.size_with_ancestors as i64
    }

    /// Coin-age priority at `height`: the priority frozen at entry plus the
    /// value-weighted aging accrued since.
    pub fn priority(&self, height: u32) -> f64 {
        let aged = height.saturating_sub(self.entry_height) as f64
            * self.in_chain_input_value.to_sat() as f64
            / self.mod_size as f64;
        self.entry_priority + aged
    }
}

/// Size with per-input overhead backed out, so priority is not biased
/// against transactions with many small inputs.
fn modified_size(tx: &Transaction) -> u64 {
    let mut size = tx.total_size() as u64;
    for txin in &tx.input {
        let offset = 41 + txin.script_sig.len().min(110) as u64;
        if size > offset {
            size -= offset;
        }
    }
    size.max(1)
}

/// Arena holding all mempool entries plus the orderings selection needs:
/// txid-primary, mining score, and ancestor score.
pub struct MemPoolArena {
    entries: SlotMap<slotmap::DefaultKey, TxMemPoolEntry>,

    /// Primary index: sorted by txid, the canonical iteration order.
    by_txid: BTreeMap<Txid, EntryId>,

    /// Sorted by single-transaction mining score, best first.
    by_mining_score: BTreeSet<(MiningScoreKey, EntryId)>,

    /// Sorted by ancestor score, best first.
    by_ancestor_score: BTreeSet<(AncestorScoreKey, EntryId)>,
}

impl MemPoolArena {
    pub fn new() -> Self {
        Self {
            entries: SlotMap::new(),
            by_txid: BTreeMap::new(),
            by_mining_score: BTreeSet::new(),
            by_ancestor_score: BTreeSet::new(),
        }
    }

    /// Insert a new entry, computing and caching its index keys.
    pub fn insert(&mut self, mut entry: TxMemPoolEntry) -> EntryId {
        let mining_key = Self::compute_mining_key(&entry);
        let ancestor_key = Self::compute_ancestor_key(&entry);
        entry.cached_mining_key = mining_key;
        entry.cached_ancestor_key = ancestor_key;

        let txid = entry.txid();
        let id = EntryId(self.entries.insert(entry));

        self.by_txid.insert(txid, id);
        self.by_mining_score.insert((mining_key, id));
        self.by_ancestor_score.insert((ancestor_key, id));

        id
    }

    /// Remove an entry and drop it from every index.
    pub fn remove(&mut self, id: EntryId) -> Option<TxMemPoolEntry> {
        let entry = self.entries.remove(id.0)?;
        self.by_txid.remove(&entry.txid());
        self.by_mining_score.remove(&(entry.cached_mining_key, id));
        self.by_ancestor_score.remove(&(entry.cached_ancestor_key, id));
        Some(entry)
    }

    /// Overwrite the ancestor summary and reindex.
    pub fn set_ancestor_state(
        &mut self,
        id: EntryId,
        size: u64,
        fees: Amount,
        sigops: u64,
        count: u64,
    ) {
        let entry = &self.entries[id.0];
        let old_key = entry.cached_ancestor_key;
        self.by_ancestor_score.remove(&(old_key, id));

        let entry = &mut self.entries[id.0];
        entry.size_with_ancestors = size;
        entry.fees_with_ancestors = fees;
        entry.sigops_with_ancestors = sigops;
        entry.count_with_ancestors = count;

        let new_key = Self::compute_ancestor_key(entry);
        entry.cached_ancestor_key = new_key;
        self.by_ancestor_score.insert((new_key, id));
    }

    /// Apply a fee delta to the entry's modified fee and reindex both
    /// score orderings. The ancestor fee moves by the same delta since the
    /// summary includes the entry itself.
    pub fn adjust_modified_fee(&mut self, id: EntryId, delta: SignedAmount) {
        let entry = &self.entries[id.0];
        let old_mining = entry.cached_mining_key;
        let old_ancestor = entry.cached_ancestor_key;
        self.by_mining_score.remove(&(old_mining, id));
        self.by_ancestor_score.remove(&(old_ancestor, id));

        let entry = &mut self.entries[id.0];
        entry.modified_fee = add_signed(entry.modified_fee, delta);
        entry.fees_with_ancestors = add_signed(entry.fees_with_ancestors, delta);

        let new_mining = Self::compute_mining_key(entry);
        let new_ancestor = Self::compute_ancestor_key(entry);
        entry.cached_mining_key = new_mining;
        entry.cached_ancestor_key = new_ancestor;
        self.by_mining_score.insert((new_mining, id));
        self.by_ancestor_score.insert((new_ancestor, id));
    }

    /// Shift only the ancestor fee sum (used when a delta lands on one of
    /// this entry's ancestors) and reindex the ancestor ordering.
    pub fn adjust_ancestor_fees(&mut self, id: EntryId, delta: SignedAmount) {
        let entry = &self.entries[id.0];
        let old_key = entry.cached_ancestor_key;
        self.by_ancestor_score.remove(&(old_key, id));

        let entry = &mut self.entries[id.0];
        entry.fees_with_ancestors = add_signed(entry.fees_with_ancestors, delta);

        let new_key = Self::compute_ancestor_key(entry);
        entry.cached_ancestor_key = new_key;
        self.by_ancestor_score.insert((new_key, id));
    }

    fn compute_mining_key(entry: &TxMemPoolEntry) -> MiningScoreKey {
        MiningScoreKey {
            neg_feerate: -entry.feerate(),
            txid: entry.txid(),
        }
    }

    fn compute_ancestor_key(entry: &TxMemPoolEntry) -> AncestorScoreKey {
        let min_feerate = entry.feerate().min(entry.ancestor_feerate());
        AncestorScoreKey {
            neg_feerate_frac: (-min_feerate, entry.size_with_ancestors as i64),
            txid: entry.txid(),
        }
    }

    pub fn get(&self, id: EntryId) -> Option<&TxMemPoolEntry> {
        self.entries.get(id.0)
    }

    pub fn get_mut(&mut self, id: EntryId) -> Option<&mut TxMemPoolEntry> {
        self.entries.get_mut(id.0)
    }

    pub fn get_by_txid(&self, txid: &Txid) -> Option<EntryId> {
        self.by_txid.get(txid).copied()
    }

    /// Iterate in ascending txid order.
    pub fn iter(&self) -> impl Iterator<Item = (EntryId, &TxMemPoolEntry)> {
        self.by_txid.values().map(|id| (*id, &self.entries[id.0]))
    }

    /// Iterate by mining score, best first.
    pub fn iter_by_mining_score(&self) -> impl Iterator<Item = (EntryId, &TxMemPoolEntry)> {
        self.by_mining_score
            .iter()
            .map(|(_, id)| (*id, &self.entries[id.0]))
    }

    /// Iterate by ancestor score, best first.
    pub fn iter_by_ancestor_score(&self) -> impl Iterator<Item = (EntryId, &TxMemPoolEntry)> {
        self.by_ancestor_score
            .iter()
            .map(|(_, id)| (*id, &self.entries[id.0]))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for MemPoolArena {
    fn default() -> Self {
        Self::new()
    }
}

fn add_signed(amount: Amount, delta: SignedAmount) -> Amount {
    let sum = amount.to_sat() as i64 + delta.to_sat();
    Amount::from_sat(sum.max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::make_tx;
    use bitcoin::hashes::Hash;
    use bitcoin::OutPoint;

    fn entry(fee_sat: u64, seed: u8) -> TxMemPoolEntry {
        let tx = make_tx(
            vec![OutPoint::new(Txid::from_byte_array([seed; 32]), 0)],
            1,
            0,
        );
        TxMemPoolEntry::new(Arc::new(tx), Amount::from_sat(fee_sat), 1, 0, 0, 0.0, Amount::ZERO)
    }

    #[test]
    fn mining_score_orders_by_feerate_desc() {
        let mut arena = MemPoolArena::new();
        let low = arena.insert(entry(100, 1));
        let high = arena.insert(entry(10_000, 2));

        let order: Vec<EntryId> = arena.iter_by_mining_score().map(|(id, _)| id).collect();
        assert_eq!(order, vec![high, low]);
    }

    #[test]
    fn ancestor_key_tracks_min_of_own_and_ancestor_rate() {
        let mut arena = MemPoolArena::new();

        // A high-fee child dragged down by a zero-fee parent summary must
        // sort by the combined rate, not its own.
        let mut child = entry(50_000, 3);
        let size = child.tx_size;
        child.size_with_ancestors = size * 2;
        child.fees_with_ancestors = Amount::from_sat(50_000);
        child.count_with_ancestors = 2;
        let child_id = arena.insert(child);

        let lone = arena.insert(entry(40_000, 4));

        // Package rate of the child is 50_000 / (2 * size); the lone tx
        // pays 40_000 / size, which is better.
        let order: Vec<EntryId> = arena.iter_by_ancestor_score().map(|(id, _)| id).collect();
        assert_eq!(order, vec![lone, child_id]);
    }

    #[test]
    fn reindex_on_fee_adjustment() {
        let mut arena = MemPoolArena::new();
        let a = arena.insert(entry(1_000, 5));
        let b = arena.insert(entry(2_000, 6));

        arena.adjust_modified_fee(a, SignedAmount::from_sat(10_000));

        let order: Vec<EntryId> = arena.iter_by_mining_score().map(|(id, _)| id).collect();
        assert_eq!(order, vec![a, b]);
        assert_eq!(arena.get(a).unwrap().modified_fee, Amount::from_sat(11_000));
        // Base fee is untouched.
        assert_eq!(arena.get(a).unwrap().fee, Amount::from_sat(1_000));
    }

    #[test]
    fn remove_clears_every_index() {
        let mut arena = MemPoolArena::new();
        let a = arena.insert(entry(1_000, 7));
        let txid = arena.get(a).unwrap().txid();

        assert!(arena.remove(a).is_some());
        assert!(arena.get_by_txid(&txid).is_none());
        assert_eq!(arena.iter_by_mining_score().count(), 0);
        assert_eq!(arena.iter_by_ancestor_score().count(), 0);
        assert!(arena.is_empty());
    }
}
