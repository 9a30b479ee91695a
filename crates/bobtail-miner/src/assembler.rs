//! The sub-block assembler.
//!
//! Transactions in the pool often depend on other pooled transactions.
//! Selection therefore runs highest-value-first but defers any candidate
//! whose parents have not been placed yet, re-trying it the moment its last
//! blocker lands. The fee region is filled either by single-transaction
//! mining score or by ancestor-grouped packages, chosen by configuration.

use crate::capacity::{BlockCapacity, CapacityCheck};
use crate::config::{MinerConfig, SelectionStrategy};
use crate::error::AssemblerError;
use crate::proofbase::{build_proof_base, PROOFBASE_SIZING_HEIGHT};
use bitcoin::block::Header;
use bitcoin::hashes::Hash;
use bitcoin::{
    BlockHash, Script, ScriptBuf, SignedAmount, Transaction, TxMerkleNode, Txid,
};
use bobtail_mempool::{EntryId, MemPoolInner, TxMemPoolEntry};
use bobtail_primitives::{
    allow_free, is_final_tx, legacy_sigop_count, ChainTip, ChainView, NullRespendOracle,
    RespendOracle, StructuralValidator, SubBlock, SubBlockTemplate, SubBlockValidator,
    UpgradeFlags, MIN_TX_SIZE,
};
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Maximum number of failed attempts to insert a package into a block.
const MAX_PACKAGE_FAILURES: u32 = 5;

/// Assembles sub-block templates from the mempool.
pub struct SubBlockAssembler<C> {
    chain: Arc<C>,
    config: MinerConfig,
    respend: Arc<dyn RespendOracle>,
    validator: Arc<dyn SubBlockValidator>,
    coinbase_flags: ScriptBuf,

    // Cumulative microseconds spent in each fee-selection engine.
    total_score_micros: AtomicI64,
    total_package_micros: AtomicI64,

    // Stats of the most recent assembly.
    last_block_tx: AtomicU64,
    last_block_size: AtomicU64,
}

impl<C: ChainView> SubBlockAssembler<C> {
    pub fn new(chain: Arc<C>, config: MinerConfig) -> Self {
        Self {
            chain,
            config: config.sanitize(),
            respend: Arc::new(NullRespendOracle),
            validator: Arc::new(StructuralValidator),
            coinbase_flags: coinbase_flags("/bobtail/"),
            total_score_micros: AtomicI64::new(0),
            total_package_micros: AtomicI64::new(0),
            last_block_tx: AtomicU64::new(0),
            last_block_size: AtomicU64::new(0),
        }
    }

    pub fn with_respend_oracle(mut self, respend: Arc<dyn RespendOracle>) -> Self {
        self.respend = respend;
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn SubBlockValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_coinbase_message(mut self, message: &str) -> Self {
        self.coinbase_flags = coinbase_flags(message);
        self
    }

    /// Size and transaction count of the most recently assembled template.
    pub fn last_block_stats(&self) -> (u64, u64) {
        (
            self.last_block_size.load(Ordering::Relaxed),
            self.last_block_tx.load(Ordering::Relaxed),
        )
    }

    /// Cumulative time spent in the score and package engines, in µs.
    pub fn selection_micros(&self) -> (i64, i64) {
        (
            self.total_score_micros.load(Ordering::Relaxed),
            self.total_package_micros.load(Ordering::Relaxed),
        )
    }

    /// Assemble a template on top of the current tip.
    ///
    /// The caller holds the mempool read lock for the duration (`pool` is
    /// the guarded snapshot), so every read observes one consistent state.
    /// `coinbase_size` overrides the configured proof-base reservation.
    pub fn create_new_sub_block(
        &self,
        pool: &MemPoolInner,
        tips: &[BlockHash],
        script_pub_key: &Script,
        coinbase_size: Option<u64>,
    ) -> Result<SubBlockTemplate, AssemblerError> {
        let tip = self.chain.best_tip().ok_or(AssemblerError::MempoolUnavailable)?;
        let rules = self.chain.upgrade_flags(&tip);

        // Built once here for sizing and once more below with the real
        // height; the two are byte-compatible so the reservation holds.
        let provisional = build_proof_base(
            script_pub_key,
            PROOFBASE_SIZING_HEIGHT,
            tips,
            &self.coinbase_flags,
            &rules,
        );
        let sig_checks_limit = rules.sig_checks_active.then_some(self.config.max_sig_checks);
        let mut capacity = BlockCapacity::new(self.config.block_max_size, sig_checks_limit);
        capacity.reserve_initial(
            provisional.total_size() as u64,
            coinbase_size.unwrap_or(self.config.coinbase_reserve),
        );

        let height = tip.height + 1;
        let header_time = self.chain.adjusted_time();
        let version = match self.config.block_version {
            Some(version) => bitcoin::block::Version::from_consensus(version),
            None => self.chain.compute_block_version(&tip, header_time),
        };
        let lock_time_cutoff = if rules.mtp_locktime_active {
            tip.median_time_past
        } else {
            header_time
        };

        let mut run = AssemblyRun {
            pool,
            config: &self.config,
            respend: self.respend.as_ref(),
            rules,
            capacity,
            height,
            lock_time_cutoff,
            now_micros: self.chain.time_micros(),
            selected: Vec::new(),
        };

        run.add_priority_txs();
        match self.config.strategy() {
            SelectionStrategy::Package => {
                let start = Instant::now();
                run.add_package_txs();
                self.total_package_micros
                    .fetch_add(start.elapsed().as_micros() as i64, Ordering::Relaxed);
            }
            SelectionStrategy::Score => {
                let start = Instant::now();
                run.add_score_txs();
                self.total_score_micros
                    .fetch_add(start.elapsed().as_micros() as i64, Ordering::Relaxed);
            }
        }

        let AssemblyRun {
            capacity,
            mut selected,
            ..
        } = run;

        self.last_block_tx.store(capacity.block_tx(), Ordering::Relaxed);
        self.last_block_size.store(capacity.block_size(), Ordering::Relaxed);
        tracing::info!(
            "create_new_sub_block: total size {} txs: {} of {} fees: {} sigops {}",
            capacity.block_size(),
            capacity.block_tx(),
            pool.size(),
            capacity.fees(),
            capacity.block_sigops()
        );

        // Canonical ordering: ascending txid, proof-base prepended outside
        // the sort.
        selected.sort_by_key(|id| entry_of(pool, *id).txid());

        let proof_base = build_proof_base(
            script_pub_key,
            height,
            tips,
            &self.coinbase_flags,
            &rules,
        );
        debug_assert_eq!(proof_base.total_size(), provisional.total_size());

        let total_fees = capacity.fees();
        let mut txdata: Vec<Transaction> = Vec::with_capacity(selected.len() + 1);
        let mut tx_fees: Vec<SignedAmount> =
            vec![SignedAmount::from_sat(-(total_fees.to_sat() as i64))];
        let mut tx_sigops: Vec<u32> = vec![if rules.sig_checks_active {
            // No scripts execute in the proof-base under the sig-checks
            // rule.
            0
        } else {
            legacy_sigop_count(&proof_base) as u32
        }];
        txdata.push(proof_base);
        for id in selected {
            let entry = entry_of(pool, id);
            txdata.push((*entry.tx).clone());
            tx_fees.push(SignedAmount::from_sat(entry.fee.to_sat() as i64));
            tx_sigops.push(entry.sigops);
        }

        let mut header = Header {
            version,
            prev_blockhash: tip.hash,
            merkle_root: TxMerkleNode::all_zeros(),
            time: header_time,
            bits: self.chain.next_work_required(&tip, header_time),
            nonce: 0,
        };
        self.update_time(&mut header, &tip);

        let sub_block = SubBlock { header, txdata };
        self.validator
            .test_sub_block_validity(&sub_block, &tip)
            .map_err(AssemblerError::ValidityCheckFailed)?;

        Ok(SubBlockTemplate {
            sub_block,
            tx_fees,
            tx_sigops,
            expedited: self.config.expedited_validation,
        })
    }

    /// Move the header time to `max(mtp + 1, now)`, never backwards, and
    /// re-derive the target where min-difficulty rules make it depend on
    /// the timestamp.
    fn update_time(&self, header: &mut Header, tip: &ChainTip) {
        let new_time = (tip.median_time_past + 1).max(self.chain.adjusted_time());
        if header.time < new_time {
            header.time = new_time;
        }
        if self.config.pow_allow_min_difficulty {
            header.bits = self.chain.next_work_required(tip, header.time);
        }
    }
}

fn coinbase_flags(message: &str) -> ScriptBuf {
    let bytes = bitcoin::script::PushBytesBuf::try_from(message.as_bytes().to_vec())
        .expect("coinbase message is far below push limits");
    bitcoin::script::Builder::new().push_slice(bytes).into_script()
}

fn entry_of(pool: &MemPoolInner, id: EntryId) -> &TxMemPoolEntry {
    pool.get(id).expect("selected entry exists in the locked pool")
}

/// State for one assembly pass, split off the assembler so the selection
/// methods can borrow the pool snapshot and mutate capacity independently.
struct AssemblyRun<'a> {
    pool: &'a MemPoolInner,
    config: &'a MinerConfig,
    respend: &'a dyn RespendOracle,
    rules: UpgradeFlags,
    capacity: BlockCapacity,
    height: u32,
    lock_time_cutoff: u32,
    now_micros: i64,
    selected: Vec<EntryId>,
}

impl<'a> AssemblyRun<'a> {
    fn is_still_dependent(&self, entry: &TxMemPoolEntry) -> bool {
        entry.parents.iter().any(|parent| !self.capacity.contains(parent))
    }

    /// Per-transaction admission: capacity, finality, minimum size, the
    /// one-second age gate, and the double-spend oracle.
    fn test_for_block(&mut self, entry: &TxMemPoolEntry) -> bool {
        if self.capacity.check_incremental(entry.tx_size, entry.sigops as u64)
            != CapacityCheck::Fits
        {
            return false;
        }

        // Lock times must still hold at the height/cutoff we're mining at;
        // reorgs keep the pool consistent only for the old tip.
        if !is_final_tx(&entry.tx, self.height, self.lock_time_cutoff) {
            return false;
        }

        if self.rules.min_tx_size_active && entry.tx_size < MIN_TX_SIZE {
            return false;
        }

        // Freshly arrived transactions may not have propagated yet; give
        // them a second before mining them.
        if entry.time_micros + 1_000_000 > self.now_micros {
            return false;
        }

        // Best effort only: the oracle has a documented false-positive
        // rate, so this filters rather than proves.
        if entry
            .tx
            .input
            .iter()
            .any(|txin| self.respend.likely_known_respent(&txin.previous_output))
        {
            return false;
        }

        true
    }

    fn add_to_block(&mut self, id: EntryId) {
        let pool = self.pool;
        let entry = entry_of(pool, id);
        self.capacity.commit(id, entry);
        self.selected.push(id);

        if self.config.print_priority {
            let txid = entry.txid();
            let mut priority = entry.priority(self.height);
            let mut fee_delta = SignedAmount::ZERO;
            pool.apply_deltas(&txid, &mut priority, &mut fee_delta);
            tracing::info!(
                "priority {:.1} fee {} size {} txid {}",
                priority,
                entry.modified_fee,
                entry.tx_size,
                txid
            );
        }
    }

    /// Fill the priority-reserved region: highest coin-age priority first,
    /// regardless of fees, deferring entries with unplaced parents.
    fn add_priority_txs(&mut self) {
        let pool = self.pool;
        let priority_cap = self.config.block_priority_size.min(self.config.block_max_size);
        if priority_cap == 0 {
            return;
        }

        let mut heap: BinaryHeap<PriorityCandidate> = pool
            .iter()
            .map(|(id, entry)| {
                let txid = entry.txid();
                let mut priority = entry.priority(self.height);
                let mut fee_delta = SignedAmount::ZERO;
                pool.apply_deltas(&txid, &mut priority, &mut fee_delta);
                PriorityCandidate { priority, txid, id }
            })
            .collect();
        let mut waiting: HashMap<EntryId, f64> = HashMap::new();

        while !self.capacity.finished() {
            let Some(candidate) = heap.pop() else {
                break;
            };
            if self.capacity.contains(&candidate.id) {
                continue;
            }
            let entry = entry_of(pool, candidate.id);

            if self.is_still_dependent(entry) {
                waiting.insert(candidate.id, candidate.priority);
                continue;
            }

            if self.test_for_block(entry) {
                self.add_to_block(candidate.id);

                // Once past the reserved bytes, or once priorities drop
                // below the free threshold, the phase is over.
                if self.capacity.block_size() >= priority_cap || !allow_free(candidate.priority)
                {
                    return;
                }

                for &child in &entry.children {
                    if let Some(priority) = waiting.remove(&child) {
                        heap.push(PriorityCandidate {
                            priority,
                            txid: entry_of(pool, child).txid(),
                            id: child,
                        });
                    }
                }
            }
        }
    }

    /// Fill the fee region by single-transaction mining score.
    ///
    /// A deferred transaction whose last blocker just landed outranks
    /// everything still untried (the index is sorted), so cleared entries
    /// are retried before advancing the index.
    fn add_score_txs(&mut self) {
        let pool = self.pool;
        let mut index = pool.iter_by_mining_score();
        let mut cleared: BinaryHeap<ScoreCandidate> = BinaryHeap::new();
        let mut wait_set: HashSet<EntryId> = HashSet::new();
        let mut next_indexed = index.next();

        while !self.capacity.finished() {
            let id = if let Some(candidate) = cleared.pop() {
                candidate.id
            } else if let Some((id, _)) = next_indexed {
                next_indexed = index.next();
                id
            } else {
                break;
            };

            // Placed by the priority phase.
            if self.capacity.contains(&id) {
                continue;
            }
            let entry = entry_of(pool, id);

            if self.is_still_dependent(entry) {
                wait_set.insert(id);
                continue;
            }

            if self.test_for_block(entry) {
                self.add_to_block(id);

                for &child in &entry.children {
                    if wait_set.remove(&child) {
                        let child_entry = entry_of(pool, child);
                        cleared.push(ScoreCandidate {
                            feerate: child_entry.feerate(),
                            txid: child_entry.txid(),
                            id: child,
                        });
                    }
                }
            }
        }
    }

    /// Fill the fee region by ancestor score, admitting a transaction
    /// together with its unconfirmed ancestors as one unit.
    ///
    /// Treating the ancestor group as a single transaction sidesteps the
    /// descendant-state updates that make classic package mining
    /// expensive. The one pathological case is a child paying less per
    /// byte than its parent: it surfaces later in the index with a summary
    /// that still counts ancestors already placed, so its size and sig-ops
    /// are recomputed over the not-yet-placed remainder. The ancestor walk
    /// stops at the in-block frontier rather than visiting the full tree.
    fn add_package_txs(&mut self) {
        let pool = self.pool;
        let mut package_failures: u32 = 0;

        for (id, entry) in pool.iter_by_ancestor_score() {
            if self.capacity.contains(&id) {
                continue;
            }

            let mut package_size = entry.size_with_ancestors;
            let package_fees = entry.fees_with_ancestors;
            let mut package_sigops = entry.sigops_with_ancestors;

            let mut package = HashSet::new();
            pool.calculate_mempool_ancestors(id, &mut package, self.capacity.in_block());
            package.insert(id);

            // Some ancestors were already placed: charge only the rest.
            // Fees need no adjustment, the placed ancestors' fees are
            // already counted in the block.
            if entry.count_with_ancestors > package.len() as u64 {
                package_size = 0;
                package_sigops = 0;
                for &member in &package {
                    let member_entry = entry_of(pool, member);
                    package_size += member_entry.tx_size;
                    package_sigops += member_entry.sigops as u64;
                }
            }

            // The index is sorted by score: once a package pays below the
            // relay floor, nothing after it can pay more.
            if package_fees < self.config.min_relay_fee.fee_for(package_size)
                && self.capacity.block_size() >= self.config.block_min_size
            {
                return;
            }

            if self.capacity.block_size() + package_size > self.config.block_max_size {
                if self.capacity.block_size() > self.config.block_max_size / 2 {
                    package_failures += 1;
                }
                // Repeated failures this deep mean the block is nearly
                // full.
                if package_failures >= MAX_PACKAGE_FAILURES {
                    return;
                }
                continue;
            }

            if !self.capacity.check_package_sigops(package_size, package_sigops) {
                continue;
            }

            if !self.test_package_finality(&package) {
                continue;
            }

            // All or nothing from here.
            let mut members: Vec<EntryId> = package.into_iter().collect();
            members.sort_by_key(|member| entry_of(pool, *member).txid());
            for member in members {
                self.add_to_block(member);
            }
        }
    }

    /// Size and sig-ops were already probed; every member must also be
    /// final.
    fn test_package_finality(&self, package: &HashSet<EntryId>) -> bool {
        package.iter().all(|member| {
            is_final_tx(
                &entry_of(self.pool, *member).tx,
                self.height,
                self.lock_time_cutoff,
            )
        })
    }
}

/// Heap candidate for the priority phase: greatest priority first, ties
/// broken toward the smaller txid for determinism.
struct PriorityCandidate {
    priority: f64,
    txid: Txid,
    id: EntryId,
}

impl PartialEq for PriorityCandidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for PriorityCandidate {}

impl PartialOrd for PriorityCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for PriorityCandidate {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .total_cmp(&other.priority)
            .then_with(|| other.txid.cmp(&self.txid))
    }
}

/// Heap candidate for cleared score entries: greatest fee rate first, ties
/// broken toward the smaller txid.
#[derive(PartialEq, Eq)]
struct ScoreCandidate {
    feerate: i64,
    txid: Txid,
    id: EntryId,
}

impl PartialOrd for ScoreCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScoreCandidate {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.feerate
            .cmp(&other.feerate)
            .then_with(|| other.txid.cmp(&self.txid))
    }
}
