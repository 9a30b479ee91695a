//! Proof-base construction.
//!
//! The proof-base is the distinguished first transaction of a sub-block.
//! Its first input carries the miner's scriptSig; every further input is a
//! reference to a DAG tip, encoded as the outpoint `(tip_hash, 0)`. With no
//! tips a single extra null input is appended so the transaction still has
//! two pairwise-distinct outpoints and passes structural checks.

use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::script::PushBytesBuf;
use bitcoin::transaction::Version;
use bitcoin::{
    Amount, BlockHash, OutPoint, Script, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid,
    Witness,
};
use bobtail_primitives::{SubBlock, UpgradeFlags, MAX_COINBASE_SCRIPTSIG_SIZE, MIN_TX_SIZE};

/// Artificial height used when a proof-base is built purely to measure its
/// serialized size for the block-size reservation. Chosen above any
/// plausible real height so the sizing build can never come out smaller
/// than the final one.
pub const PROOFBASE_SIZING_HEIGHT: u32 = 400_000;

/// Build the proof-base paying `script_pub_key`, referencing `tips`.
///
/// The height is carried for parity between the sizing and the final
/// build; sub-block proof-bases do not serialize it, so the two builds are
/// byte-identical for any pair of heights. The output value is zero at
/// template time and filled in by the caller once fees are known.
///
/// Deterministic: identical inputs produce identical bytes.
pub fn build_proof_base(
    script_pub_key: &Script,
    _height: u32,
    tips: &[BlockHash],
    coinbase_flags: &Script,
    rules: &UpgradeFlags,
) -> Transaction {
    let mut tx = Transaction {
        version: Version::ONE,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::null(),
            script_sig: miner_script_sig(script_pub_key.as_bytes(), coinbase_flags),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::ZERO,
            script_pubkey: script_pub_key.to_owned(),
        }],
    };

    if tips.is_empty() {
        // The index of zero (vs. the u32::MAX of a null outpoint) keeps the
        // two outpoints distinct.
        tx.input.push(tip_input(OutPoint {
            txid: Txid::all_zeros(),
            vout: 0,
        }));
    } else {
        for tip in tips {
            tx.input.push(tip_input(OutPoint {
                txid: Txid::from_raw_hash(tip.to_raw_hash()),
                vout: 0,
            }));
        }
    }

    pad_to_min_tx_size(&mut tx, rules);
    tx
}

/// Roll the extra nonce in the proof-base scriptSig and refresh the merkle
/// root. The nonce restarts whenever assembly moves to a new previous
/// block; `last_prev_block` carries that state between calls.
pub fn increment_extra_nonce(
    sub_block: &mut SubBlock,
    coinbase_flags: &Script,
    rules: &UpgradeFlags,
    extra_nonce: &mut u32,
    last_prev_block: &mut BlockHash,
) {
    if *last_prev_block != sub_block.header.prev_blockhash {
        *extra_nonce = 0;
        *last_prev_block = sub_block.header.prev_blockhash;
    }
    *extra_nonce += 1;

    // Unlike a full block's coinbase, the height is not pushed here.
    let script = bitcoin::script::Builder::new()
        .push_int(*extra_nonce as i64)
        .into_script();

    let proof_base = &mut sub_block.txdata[0];
    proof_base.input[0].script_sig = miner_script_sig(script.as_bytes(), coinbase_flags);
    pad_to_min_tx_size(proof_base, rules);

    if let Some(root) = sub_block.compute_merkle_root() {
        sub_block.header.merkle_root = root;
    }
}

/// Miner script followed by the coinbase flags, with the flags truncated
/// first if the concatenation would exceed the scriptSig cap.
fn miner_script_sig(miner_script: &[u8], coinbase_flags: &Script) -> ScriptBuf {
    let mut flags = coinbase_flags.as_bytes();
    if miner_script.len() + flags.len() > MAX_COINBASE_SCRIPTSIG_SIZE {
        let keep = MAX_COINBASE_SCRIPTSIG_SIZE.saturating_sub(miner_script.len());
        flags = &flags[..keep];
    }
    let mut script_sig = Vec::with_capacity(miner_script.len() + flags.len());
    script_sig.extend_from_slice(miner_script);
    script_sig.extend_from_slice(flags);
    ScriptBuf::from_bytes(script_sig)
}

fn tip_input(previous_output: OutPoint) -> TxIn {
    TxIn {
        previous_output,
        script_sig: ScriptBuf::new(),
        sequence: Sequence::MAX,
        witness: Witness::new(),
    }
}

/// Grow the scriptSig with a zero-byte push so the serialized transaction
/// reaches the minimum size, once that rule is active.
fn pad_to_min_tx_size(tx: &mut Transaction, rules: &UpgradeFlags) {
    if !rules.min_tx_size_active {
        return;
    }
    let size = tx.total_size() as u64;
    if size >= MIN_TX_SIZE {
        return;
    }
    let shortfall = (MIN_TX_SIZE - size - 1) as usize;
    let padding =
        PushBytesBuf::try_from(vec![0u8; shortfall]).expect("padding is far below push limits");
    let mut script_sig = tx.input[0].script_sig.to_bytes();
    script_sig.extend_from_slice(
        bitcoin::script::Builder::new()
            .push_slice(padding)
            .into_script()
            .as_bytes(),
    );
    tx.input[0].script_sig = ScriptBuf::from_bytes(script_sig);
}
