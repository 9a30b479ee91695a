//! End-to-end assembly scenarios against a synthetic chain and pool.

use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::script::Builder;
use bitcoin::{
    Amount, BlockHash, CompactTarget, OutPoint, ScriptBuf, Sequence, SignedAmount, Transaction,
    TxIn, TxOut, Txid, Witness,
};
use bobtail_mempool::{MemPool, NewEntry};
use bobtail_miner::{
    build_proof_base, AssemblerError, MinerConfig, SubBlockAssembler, PROOFBASE_SIZING_HEIGHT,
};
use bobtail_primitives::{ChainTip, ChainView, RespendOracle, UpgradeFlags};
use std::collections::HashSet;
use std::sync::Arc;

const NOW_SECS: u32 = 1_700_000_000;
const NOW_MICROS: i64 = 10_000_000;

struct TestChain {
    tip: Option<ChainTip>,
    rules: UpgradeFlags,
}

impl TestChain {
    fn new() -> Self {
        Self {
            tip: Some(ChainTip {
                hash: BlockHash::from_byte_array([0x11; 32]),
                height: 100,
                time: NOW_SECS - 600,
                bits: CompactTarget::from_consensus(0x207f_ffff),
                median_time_past: NOW_SECS - 3_000,
            }),
            rules: UpgradeFlags::default(),
        }
    }
}

impl ChainView for TestChain {
    fn best_tip(&self) -> Option<ChainTip> {
        self.tip
    }

    fn adjusted_time(&self) -> u32 {
        NOW_SECS
    }

    fn time_micros(&self) -> i64 {
        NOW_MICROS
    }

    fn next_work_required(&self, tip: &ChainTip, _header_time: u32) -> CompactTarget {
        tip.bits
    }

    fn upgrade_flags(&self, _tip: &ChainTip) -> UpgradeFlags {
        self.rules
    }
}

struct FlaggedOutpoints(HashSet<OutPoint>);

impl RespendOracle for FlaggedOutpoints {
    fn likely_known_respent(&self, outpoint: &OutPoint) -> bool {
        self.0.contains(outpoint)
    }
}

fn miner_script() -> ScriptBuf {
    ScriptBuf::new_p2pkh(&bitcoin::PubkeyHash::all_zeros())
}

fn make_tx(inputs: Vec<OutPoint>, n_outputs: usize, pad: usize) -> Transaction {
    let mut output: Vec<TxOut> = (0..n_outputs)
        .map(|i| TxOut {
            value: Amount::from_sat(546 + i as u64),
            script_pubkey: ScriptBuf::new_p2pkh(&bitcoin::PubkeyHash::all_zeros()),
        })
        .collect();
    if pad > 0 {
        let mut data = vec![0x6a, 0x4d];
        data.extend_from_slice(&(pad as u16).to_le_bytes());
        data.extend(std::iter::repeat(0u8).take(pad));
        output.push(TxOut {
            value: Amount::ZERO,
            script_pubkey: ScriptBuf::from_bytes(data),
        });
    }
    Transaction {
        version: bitcoin::transaction::Version::TWO,
        lock_time: LockTime::ZERO,
        input: inputs
            .into_iter()
            .map(|previous_output| TxIn {
                previous_output,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            })
            .collect(),
        output,
    }
}

fn confirmed_outpoint(seed: u8) -> OutPoint {
    OutPoint::new(Txid::from_byte_array([seed; 32]), 0)
}

fn add(pool: &MemPool, tx: Transaction, fee_sat: u64) -> Txid {
    add_with(pool, tx, fee_sat, 0, 0.0)
}

fn add_with(pool: &MemPool, tx: Transaction, fee_sat: u64, time_micros: i64, priority: f64) -> Txid {
    pool.add_unchecked(NewEntry {
        tx: Arc::new(tx),
        fee: Amount::from_sat(fee_sat),
        sigops: 1,
        time_micros,
        entry_height: 100,
        entry_priority: priority,
        in_chain_input_value: Amount::ZERO,
    })
    .expect("admission must succeed")
}

/// Reserve charged by `reserve_initial` for the given message and tips,
/// mirrored here so tests can pick exact block limits.
fn reserved_size(message: &str, tips: &[BlockHash]) -> u64 {
    let flags = Builder::new()
        .push_slice(
            bitcoin::script::PushBytesBuf::try_from(message.as_bytes().to_vec()).unwrap(),
        )
        .into_script();
    let pb = build_proof_base(
        &miner_script(),
        PROOFBASE_SIZING_HEIGHT,
        tips,
        &flags,
        &UpgradeFlags::default(),
    );
    80 + 5 + pb.total_size() as u64
}

fn assembler(config: MinerConfig) -> SubBlockAssembler<TestChain> {
    SubBlockAssembler::new(Arc::new(TestChain::new()), config).with_coinbase_message("/test/")
}

fn fee_only_config() -> MinerConfig {
    MinerConfig {
        block_priority_size: 0,
        coinbase_reserve: 0,
        ..Default::default()
    }
}

fn template_txids(template: &bobtail_primitives::SubBlockTemplate) -> Vec<Txid> {
    template.sub_block.txdata[1..]
        .iter()
        .map(|tx| tx.compute_txid())
        .collect()
}

#[test]
fn refuses_without_a_tip() {
    let chain = TestChain {
        tip: None,
        rules: UpgradeFlags::default(),
    };
    let assembler = SubBlockAssembler::new(Arc::new(chain), MinerConfig::default());
    let pool = MemPool::new();
    let result = assembler.create_new_sub_block(&pool.read(), &[], &miner_script(), None);
    assert!(matches!(result, Err(AssemblerError::MempoolUnavailable)));
}

#[test]
fn empty_pool_yields_proof_base_only() {
    let assembler = assembler(fee_only_config());
    let pool = MemPool::new();
    let template = assembler
        .create_new_sub_block(&pool.read(), &[], &miner_script(), None)
        .unwrap();

    assert_eq!(template.sub_block.txdata.len(), 1);
    assert_eq!(template.tx_fees, vec![SignedAmount::ZERO]);
    // Empty tips: the miner input plus one null placeholder.
    assert_eq!(template.sub_block.txdata[0].input.len(), 2);
    assert_eq!(template.sub_block.header.prev_blockhash, TestChain::new().tip.unwrap().hash);
    assert_eq!(template.sub_block.header.nonce, 0);
}

#[test]
fn dag_tips_become_proof_base_inputs() {
    let tips = [
        BlockHash::from_byte_array([0xaa; 32]),
        BlockHash::from_byte_array([0xbb; 32]),
    ];
    let assembler = assembler(fee_only_config());
    let pool = MemPool::new();
    let template = assembler
        .create_new_sub_block(&pool.read(), &tips, &miner_script(), None)
        .unwrap();

    let proof_base = &template.sub_block.txdata[0];
    assert_eq!(proof_base.input.len(), 3);
    for (txin, tip) in proof_base.input[1..].iter().zip(tips.iter()) {
        assert_eq!(txin.previous_output.txid.to_raw_hash(), tip.to_raw_hash());
        assert_eq!(txin.previous_output.vout, 0);
    }
}

#[test]
fn assembly_is_deterministic_on_a_fixed_snapshot() {
    let assembler = assembler(fee_only_config());
    let pool = MemPool::new();
    for seed in 1..6u8 {
        add(&pool, make_tx(vec![confirmed_outpoint(seed)], 1, 40), 5_000 + seed as u64);
    }

    let guard = pool.read();
    let first = assembler
        .create_new_sub_block(&guard, &[], &miner_script(), None)
        .unwrap();
    let second = assembler
        .create_new_sub_block(&guard, &[], &miner_script(), None)
        .unwrap();

    assert_eq!(
        bitcoin::consensus::serialize(&first.sub_block.header),
        bitcoin::consensus::serialize(&second.sub_block.header)
    );
    assert_eq!(first.sub_block.txdata, second.sub_block.txdata);
    assert_eq!(first.tx_fees, second.tx_fees);
    assert_eq!(first.tx_sigops, second.tx_sigops);
}

#[test]
fn emitted_transactions_are_sorted_by_txid_and_fees_balance() {
    let assembler = assembler(fee_only_config());
    let pool = MemPool::new();
    let mut total_fee = 0i64;
    for seed in 1..8u8 {
        let fee = 1_000 * seed as u64;
        total_fee += fee as i64;
        add(&pool, make_tx(vec![confirmed_outpoint(seed)], 1, 0), fee);
    }

    let template = assembler
        .create_new_sub_block(&pool.read(), &[], &miner_script(), None)
        .unwrap();

    let txids = template_txids(&template);
    assert_eq!(txids.len(), 7);
    let mut sorted = txids.clone();
    sorted.sort();
    assert_eq!(txids, sorted);

    assert_eq!(template.tx_fees[0], SignedAmount::from_sat(-total_fee));
    let sum: i64 = template.tx_fees[1..].iter().map(|fee| fee.to_sat()).sum();
    assert_eq!(template.tx_fees[0].to_sat(), -sum);
}

#[test]
fn tight_capacity_drops_the_tail() {
    let reserve = reserved_size("/test/", &[]);

    let large: Vec<Transaction> = (1..4u8)
        .map(|seed| make_tx(vec![confirmed_outpoint(seed)], 1, 670))
        .collect();
    let small = make_tx(vec![confirmed_outpoint(9)], 1, 200);
    let large_size = large[0].total_size() as u64;
    assert!(large.iter().all(|tx| tx.total_size() as u64 == large_size));

    // Room for exactly two of the large transactions, with the leftover
    // inside the last kilobyte but too small for anything else.
    let config = MinerConfig {
        block_max_size: reserve + 2 * large_size + 150,
        ..fee_only_config()
    };
    let assembler = assembler(config);

    let pool = MemPool::new();
    let large_txids: Vec<Txid> = large
        .into_iter()
        .map(|tx| add(&pool, tx, 100 * large_size))
        .collect();
    let small_txid = add(&pool, small, 2_000);

    let template = assembler
        .create_new_sub_block(&pool.read(), &[], &miner_script(), None)
        .unwrap();

    let placed = template_txids(&template);
    assert_eq!(placed.len(), 2);
    assert!(placed.iter().all(|txid| large_txids.contains(txid)));
    assert!(!placed.contains(&small_txid));
}

#[test]
fn score_selection_defers_children_until_parents_land() {
    let assembler = assembler(fee_only_config());
    let pool = MemPool::new();

    let parent = make_tx(vec![confirmed_outpoint(1)], 1, 0);
    let child = make_tx(vec![OutPoint::new(parent.compute_txid(), 0)], 1, 0);
    let parent_txid = add(&pool, parent, 500);
    let child_txid = add(&pool, child, 50_000);
    // An unrelated tx between the two scores.
    let middle_txid = add(&pool, make_tx(vec![confirmed_outpoint(2)], 1, 0), 5_000);

    let template = assembler
        .create_new_sub_block(&pool.read(), &[], &miner_script(), None)
        .unwrap();

    let placed = template_txids(&template);
    assert_eq!(placed.len(), 3);
    for txid in [parent_txid, child_txid, middle_txid] {
        assert!(placed.contains(&txid));
    }
    // No dangling dependencies: the parent is present wherever the child is.
    let mut sorted = placed.clone();
    sorted.sort();
    assert_eq!(placed, sorted);
}

#[test]
fn package_selection_admits_cpfp_groups_whole() {
    let config = MinerConfig {
        mining_cpfp: true,
        ..fee_only_config()
    };
    let assembler = assembler(config);
    let pool = MemPool::new();

    let parent = make_tx(vec![confirmed_outpoint(1)], 1, 0);
    let package_size =
        parent.total_size() as u64 + make_tx(vec![OutPoint::new(parent.compute_txid(), 0)], 1, 0).total_size() as u64;
    let child = make_tx(vec![OutPoint::new(parent.compute_txid(), 0)], 1, 0);

    // The parent pays nothing; the child pays for both.
    let parent_txid = add(&pool, parent, 0);
    let child_txid = add(&pool, child, 100 * package_size);

    let template = assembler
        .create_new_sub_block(&pool.read(), &[], &miner_script(), None)
        .unwrap();

    let placed = template_txids(&template);
    assert!(placed.contains(&parent_txid));
    assert!(placed.contains(&child_txid));
}

#[test]
fn package_selection_enforces_the_relay_floor_where_score_does_not() {
    let pool = MemPool::new();
    let free_txid = add(&pool, make_tx(vec![confirmed_outpoint(1)], 1, 0), 0);

    // Ancestor-score selection stops at the relay fee floor.
    let cpfp = assembler(MinerConfig {
        mining_cpfp: true,
        ..fee_only_config()
    });
    let template = cpfp
        .create_new_sub_block(&pool.read(), &[], &miner_script(), None)
        .unwrap();
    assert!(template_txids(&template).is_empty());

    // Plain score selection has no fee floor and takes it.
    let score = assembler(fee_only_config());
    let template = score
        .create_new_sub_block(&pool.read(), &[], &miner_script(), None)
        .unwrap();
    assert_eq!(template_txids(&template), vec![free_txid]);
}

#[test]
fn package_selection_bails_out_after_five_oversized_failures() {
    let reserve = reserved_size("/test/", &[]);
    let block_max_size = reserve + 10_000;

    let config = MinerConfig {
        block_max_size,
        mining_cpfp: true,
        ..fee_only_config()
    };
    let assembler = assembler(config);
    let pool = MemPool::new();

    // Fills well past half the block, top of the ancestor-score index.
    let big = make_tx(vec![confirmed_outpoint(1)], 1, 5_700);
    let big_size = big.total_size() as u64;
    let big_txid = add(&pool, big, 100 * big_size);

    // Five packages that can no longer fit.
    for seed in 2..7u8 {
        let oversized = make_tx(vec![confirmed_outpoint(seed)], 1, 4_800);
        let size = oversized.total_size() as u64;
        add(&pool, oversized, 50 * size);
    }

    // Would fit, but is sorted after the failures and must never be tried.
    let small = make_tx(vec![confirmed_outpoint(9)], 1, 0);
    let small_txid = add(&pool, small, 200);

    let template = assembler
        .create_new_sub_block(&pool.read(), &[], &miner_script(), None)
        .unwrap();

    let placed = template_txids(&template);
    assert_eq!(placed, vec![big_txid]);
    assert!(!placed.contains(&small_txid));
}

#[test]
fn flagged_respends_are_filtered_from_score_selection() {
    let flagged_input = confirmed_outpoint(1);
    let suspect = make_tx(vec![flagged_input], 1, 0);
    let suspect_txid = suspect.compute_txid();

    let assembler = assembler(fee_only_config()).with_respend_oracle(Arc::new(FlaggedOutpoints(
        [flagged_input].into_iter().collect(),
    )));

    let pool = MemPool::new();
    // Top of the score index by a wide margin.
    add(&pool, suspect, 1_000_000);
    let clean_txid = add(&pool, make_tx(vec![confirmed_outpoint(2)], 1, 0), 1_000);

    let template = assembler
        .create_new_sub_block(&pool.read(), &[], &miner_script(), None)
        .unwrap();

    let placed = template_txids(&template);
    assert_eq!(placed, vec![clean_txid]);
    assert!(!placed.contains(&suspect_txid));
}

#[test]
fn transactions_younger_than_a_second_wait_for_the_next_round() {
    let assembler = assembler(fee_only_config());
    let pool = MemPool::new();

    let fresh = make_tx(vec![confirmed_outpoint(1)], 1, 0);
    let fresh_txid = add_with(&pool, fresh, 100_000, NOW_MICROS - 500_000, 0.0);
    let settled_txid = add(&pool, make_tx(vec![confirmed_outpoint(2)], 1, 0), 1_000);

    let template = assembler
        .create_new_sub_block(&pool.read(), &[], &miner_script(), None)
        .unwrap();

    let placed = template_txids(&template);
    assert_eq!(placed, vec![settled_txid]);
    assert!(!placed.contains(&fresh_txid));
}

#[test]
fn priority_region_admits_free_but_aged_coins() {
    let pool = MemPool::new();
    let free = make_tx(vec![confirmed_outpoint(1)], 1, 0);
    // Far above the free threshold of COIN * 144 / 250.
    let free_txid = add_with(&pool, free, 0, 0, 1e12);

    // The package selector alone would drop it at the relay floor.
    let without_priority = assembler(MinerConfig {
        mining_cpfp: true,
        ..fee_only_config()
    });
    let template = without_priority
        .create_new_sub_block(&pool.read(), &[], &miner_script(), None)
        .unwrap();
    assert!(template_txids(&template).is_empty());

    // With a priority region reserved, coin age carries it in.
    let with_priority = assembler(MinerConfig {
        mining_cpfp: true,
        block_priority_size: 10_000,
        coinbase_reserve: 0,
        ..Default::default()
    });
    let template = with_priority
        .create_new_sub_block(&pool.read(), &[], &miner_script(), None)
        .unwrap();
    assert_eq!(template_txids(&template), vec![free_txid]);
}

#[test]
fn sig_checks_rule_zeroes_the_proof_base_sigop_entry() {
    let mut chain = TestChain::new();
    chain.rules = UpgradeFlags {
        sig_checks_active: true,
        ..Default::default()
    };
    let assembler = SubBlockAssembler::new(Arc::new(chain), fee_only_config())
        .with_coinbase_message("/test/");

    let pool = MemPool::new();
    let template = assembler
        .create_new_sub_block(&pool.read(), &[], &miner_script(), None)
        .unwrap();
    assert_eq!(template.tx_sigops[0], 0);

    // Under the legacy rule the miner output's CHECKSIG is counted.
    let legacy = assembler_with_default_chain();
    let template = legacy
        .create_new_sub_block(&MemPool::new().read(), &[], &miner_script(), None)
        .unwrap();
    assert_eq!(
        template.tx_sigops[0] as u64,
        bobtail_primitives::legacy_sigop_count(&template.sub_block.txdata[0])
    );
}

fn assembler_with_default_chain() -> SubBlockAssembler<TestChain> {
    assembler(fee_only_config())
}
