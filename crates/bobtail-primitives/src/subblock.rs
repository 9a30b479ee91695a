//! Sub-block container types and structural checks.
//!
//! A sub-block is an ordinary 80-byte header plus a transaction list whose
//! first entry is the proof-base: a coinbase-shaped transaction that carries
//! one input per referenced DAG tip.

use crate::consensus::MAX_BLOCK_SIZE;
use bitcoin::block::Header;
use bitcoin::consensus::serialize;
use bitcoin::hashes::Hash;
use bitcoin::{BlockHash, SignedAmount, Transaction, TxMerkleNode, Txid};
use std::collections::HashSet;

/// A weak block: header plus transactions, proof-base first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubBlock {
    pub header: Header,
    pub txdata: Vec<Transaction>,
}

impl SubBlock {
    /// Hash of the serialized header.
    pub fn block_hash(&self) -> BlockHash {
        self.header.block_hash()
    }

    /// Merkle root over the transaction list, `None` when empty.
    pub fn compute_merkle_root(&self) -> Option<TxMerkleNode> {
        let hashes = self.txdata.iter().map(|tx| tx.compute_txid().to_raw_hash());
        bitcoin::merkle_tree::calculate_root(hashes).map(TxMerkleNode::from_raw_hash)
    }

    /// Serialized size of the whole sub-block in bytes.
    pub fn total_size(&self) -> u64 {
        let txs: u64 = self.txdata.iter().map(|tx| tx.total_size() as u64).sum();
        let count = bitcoin::consensus::encode::VarInt(self.txdata.len() as u64);
        80 + serialize(&count).len() as u64 + txs
    }
}

/// An assembled sub-block together with the per-transaction bookkeeping the
/// mining layer needs. Entry 0 of `tx_fees` is the negated fee total; entry
/// 0 of `tx_sigops` depends on the active sig-op rule.
#[derive(Debug, Clone)]
pub struct SubBlockTemplate {
    pub sub_block: SubBlock,
    pub tx_fees: Vec<SignedAmount>,
    pub tx_sigops: Vec<u32>,
    /// All transactions came straight from the mempool, so the template is
    /// eligible for expedited validation.
    pub expedited: bool,
}

/// Whether `tx` has the proof-base shape: a null first outpoint and at
/// least one tip-reference input after it.
pub fn is_proof_base(tx: &Transaction) -> bool {
    tx.input.len() >= 2 && tx.input[0].previous_output == bitcoin::OutPoint::null()
}

/// Structural defects detectable without chain context.
#[derive(Debug, thiserror::Error)]
pub enum SubBlockCheckError {
    #[error("sub-block has no transactions")]
    Empty,
    #[error("first transaction is not a proof-base")]
    ProofBaseMissing,
    #[error("proof-base input outpoints are not pairwise distinct")]
    ProofBaseDuplicateInputs,
    #[error("transaction {0} has a null input outpoint but is not the proof-base")]
    UnexpectedProofBase(usize),
    #[error("duplicate transaction {0}")]
    DuplicateTx(Txid),
    #[error("serialized size {got} exceeds limit {limit}")]
    SizeLimit { got: u64, limit: u64 },
    #[error("merkle root mismatch")]
    BadMerkleRoot,
}

/// Context-free sub-block validity: proof-base shape, uniqueness, size.
///
/// The merkle root is only compared when `check_merkle_root` is set; block
/// templates leave it zeroed for the miner to fill.
pub fn check_sub_block(
    sub_block: &SubBlock,
    check_merkle_root: bool,
) -> Result<(), SubBlockCheckError> {
    if sub_block.txdata.is_empty() {
        return Err(SubBlockCheckError::Empty);
    }

    let proof_base = &sub_block.txdata[0];
    if !is_proof_base(proof_base) {
        return Err(SubBlockCheckError::ProofBaseMissing);
    }
    let mut outpoints = HashSet::new();
    for txin in &proof_base.input {
        if !outpoints.insert(txin.previous_output) {
            return Err(SubBlockCheckError::ProofBaseDuplicateInputs);
        }
    }

    let mut seen = HashSet::new();
    for (index, tx) in sub_block.txdata.iter().enumerate() {
        if index > 0
            && tx.input
                .iter()
                .any(|txin| txin.previous_output.txid == Txid::all_zeros())
        {
            return Err(SubBlockCheckError::UnexpectedProofBase(index));
        }
        let txid = tx.compute_txid();
        if !seen.insert(txid) {
            return Err(SubBlockCheckError::DuplicateTx(txid));
        }
    }

    let size = sub_block.total_size();
    if size > MAX_BLOCK_SIZE {
        return Err(SubBlockCheckError::SizeLimit {
            got: size,
            limit: MAX_BLOCK_SIZE,
        });
    }

    if check_merkle_root {
        match sub_block.compute_merkle_root() {
            Some(root) if root == sub_block.header.merkle_root => {}
            _ => return Err(SubBlockCheckError::BadMerkleRoot),
        }
    }

    Ok(())
}
