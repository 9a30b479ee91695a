//! Running block capacity accounting.

use bitcoin::Amount;
use bobtail_mempool::{EntryId, TxMemPoolEntry};
use bobtail_primitives::{max_block_sigops, COINBASE_RESERVE_SIGOPS};
use std::collections::HashSet;

/// Outcome of an incremental admission probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityCheck {
    /// The transaction fits.
    Fits,
    /// The transaction does not fit; keep trying others.
    Reject,
    /// The transaction does not fit and the block is close enough to full
    /// that selection should stop.
    Finished,
}

/// Tracks block size, sig-ops, fee total and the near-full tail heuristics
/// while a sub-block is being filled. `commit` is the only mutator that
/// admits a transaction; everything else is a probe.
pub struct BlockCapacity {
    block_size: u64,
    block_sigops: u64,
    block_tx: u64,
    fees: Amount,
    /// Rejections seen since the block came within a kilobyte of full.
    last_few_txs: u32,
    block_finished: bool,
    block_max_size: u64,
    /// Fixed sig-check ceiling, or `None` for the legacy size-scaled rule.
    sig_checks_limit: Option<u64>,
    in_block: HashSet<EntryId>,
}

impl BlockCapacity {
    pub fn new(block_max_size: u64, sig_checks_limit: Option<u64>) -> Self {
        Self {
            block_size: 0,
            block_sigops: 0,
            block_tx: 0,
            fees: Amount::ZERO,
            last_few_txs: 0,
            block_finished: false,
            block_max_size,
            sig_checks_limit,
            in_block: HashSet::new(),
        }
    }

    /// Pre-charge the 80-byte header, a five-byte transaction-count varint
    /// and the proof-base, whichever of its measured size and the
    /// configured reserve is larger. 100 sig-ops are reserved for whatever
    /// the miner puts in its replacement proof-base.
    pub fn reserve_initial(&mut self, provisional_proof_base_size: u64, coinbase_reserve: u64) {
        self.block_size = 80 + 5 + provisional_proof_base_size.max(coinbase_reserve);
        self.block_sigops = COINBASE_RESERVE_SIGOPS;
    }

    fn sigop_ceiling(&self, at_size: u64) -> u64 {
        match self.sig_checks_limit {
            Some(limit) => limit,
            None => max_block_sigops(at_size),
        }
    }

    /// Would a transaction of `extra_size`/`extra_sigops` still fit?
    ///
    /// Near-full bookkeeping: once no more than 100 bytes remain, or after
    /// more than 50 failed attempts within the last kilobyte, the block is
    /// declared finished. A sig-op ceiling hit within two of the limit
    /// also finishes the block rather than backing transactions out.
    pub fn check_incremental(&mut self, extra_size: u64, extra_sigops: u64) -> CapacityCheck {
        if self.block_size + extra_size > self.block_max_size {
            if self.block_size > self.block_max_size - 100 || self.last_few_txs > 50 {
                self.block_finished = true;
                return CapacityCheck::Finished;
            }
            if self.block_size > self.block_max_size - 1_000 {
                self.last_few_txs += 1;
            }
            return CapacityCheck::Reject;
        }

        let ceiling = self.sigop_ceiling(self.block_size);
        if self.block_sigops + extra_sigops > ceiling {
            if self.block_sigops > ceiling.saturating_sub(2) {
                self.block_finished = true;
                return CapacityCheck::Finished;
            }
            return CapacityCheck::Reject;
        }

        CapacityCheck::Fits
    }

    /// Aggregate sig-op probe for a whole ancestor package. Under the
    /// fixed rule the limit is exclusive, so a block always carries one
    /// fewer sig-check than the ceiling would allow.
    pub fn check_package_sigops(&self, package_size: u64, package_sigops: u64) -> bool {
        let ceiling = self.sigop_ceiling(self.block_size + package_size);
        self.block_sigops + package_sigops < ceiling
    }

    /// Admit `entry` into the block and charge its size, sig-ops and fee.
    pub fn commit(&mut self, id: EntryId, entry: &TxMemPoolEntry) {
        self.block_size += entry.tx_size;
        self.block_sigops += entry.sigops as u64;
        self.block_tx += 1;
        self.fees = Amount::from_sat(self.fees.to_sat() + entry.fee.to_sat());
        self.in_block.insert(id);
    }

    pub fn contains(&self, id: &EntryId) -> bool {
        self.in_block.contains(id)
    }

    pub fn in_block(&self) -> &HashSet<EntryId> {
        &self.in_block
    }

    pub fn finished(&self) -> bool {
        self.block_finished
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn block_sigops(&self) -> u64 {
        self.block_sigops
    }

    pub fn block_tx(&self) -> u64 {
        self.block_tx
    }

    pub fn fees(&self) -> Amount {
        self.fees
    }

    pub fn last_few_txs(&self) -> u32 {
        self.last_few_txs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capacity(max: u64) -> BlockCapacity {
        BlockCapacity::new(max, None)
    }

    #[test]
    fn reserve_charges_header_and_proof_base() {
        let mut cap = capacity(10_000);
        cap.reserve_initial(150, 1_000);
        assert_eq!(cap.block_size(), 80 + 5 + 1_000);
        assert_eq!(cap.block_sigops(), COINBASE_RESERVE_SIGOPS);

        let mut cap = capacity(10_000);
        cap.reserve_initial(1_500, 1_000);
        assert_eq!(cap.block_size(), 80 + 5 + 1_500);
    }

    #[test]
    fn oversize_within_last_kilobyte_counts_tail_attempts() {
        let mut cap = capacity(2_000);
        cap.reserve_initial(0, 1_200);
        assert_eq!(cap.block_size(), 1_285);

        // Does not fit, block is inside the last kilobyte but not the last
        // hundred bytes: count the attempt and keep going.
        assert_eq!(cap.check_incremental(800, 0), CapacityCheck::Reject);
        assert_eq!(cap.last_few_txs(), 1);
        assert!(!cap.finished());
    }

    #[test]
    fn oversize_within_last_hundred_bytes_finishes() {
        let mut cap = capacity(2_000);
        cap.reserve_initial(0, 1_850);
        assert_eq!(cap.check_incremental(200, 0), CapacityCheck::Finished);
        assert!(cap.finished());
    }

    #[test]
    fn more_than_fifty_tail_attempts_finishes() {
        let mut cap = capacity(10_000);
        cap.reserve_initial(0, 9_100);
        for _ in 0..51 {
            assert_eq!(cap.check_incremental(5_000, 0), CapacityCheck::Reject);
        }
        assert_eq!(cap.check_incremental(5_000, 0), CapacityCheck::Finished);
    }

    #[test]
    fn legacy_sigop_ceiling_scales_with_size() {
        let mut cap = capacity(10_000_000);
        // 20_000 sig-ops allowed for the first megabyte.
        assert_eq!(cap.check_incremental(100, 19_000), CapacityCheck::Fits);
        assert_eq!(cap.check_incremental(100, 20_001), CapacityCheck::Reject);
        assert!(!cap.finished());
    }

    #[test]
    fn sigop_ceiling_hit_near_limit_finishes() {
        let mut cap = BlockCapacity::new(10_000_000, Some(100));
        cap.block_sigops = 99;
        assert_eq!(cap.check_incremental(100, 5), CapacityCheck::Finished);
        assert!(cap.finished());
    }

    #[test]
    fn package_sigop_probe_is_exclusive() {
        let cap = BlockCapacity::new(10_000_000, Some(100));
        assert!(cap.check_package_sigops(1_000, 99));
        assert!(!cap.check_package_sigops(1_000, 100));
    }
}
