//! Seams to the external collaborators of block assembly.
//!
//! The chain-state engine, the network-adjusted clock, the difficulty
//! engine, the double-spend detector and the post-assembly validity checker
//! all live outside this workspace; assembly reaches them through the traits
//! below so tests can substitute deterministic implementations.

use crate::consensus::UpgradeFlags;
use crate::subblock::{check_sub_block, SubBlock};
use bitcoin::block::Version;
use bitcoin::{BlockHash, CompactTarget, OutPoint};

/// Snapshot of the active chain tip taken under the chain-state lock.
#[derive(Debug, Clone, Copy)]
pub struct ChainTip {
    pub hash: BlockHash,
    pub height: u32,
    pub time: u32,
    pub bits: CompactTarget,
    /// Median time past of the last eleven blocks.
    pub median_time_past: u32,
}

/// Read access to chain state, clocks and the difficulty engine.
pub trait ChainView: Send + Sync {
    /// The current best tip, `None` before the genesis block is connected.
    fn best_tip(&self) -> Option<ChainTip>;

    /// Network-adjusted wall clock, unix seconds.
    fn adjusted_time(&self) -> u32;

    /// Wall clock in microseconds, used for transaction age gating.
    fn time_micros(&self) -> i64;

    /// Difficulty target for a block built on `tip` at `header_time`.
    fn next_work_required(&self, tip: &ChainTip, header_time: u32) -> CompactTarget;

    /// Upgrade activations in force for a block built on `tip`.
    fn upgrade_flags(&self, tip: &ChainTip) -> UpgradeFlags;

    /// Version field for a block built on `tip`.
    fn compute_block_version(&self, _tip: &ChainTip, _header_time: u32) -> Version {
        Version::from_consensus(0x2000_0000)
    }
}

/// Double-spend suspicion oracle. Probabilistic: roughly one percent of
/// flagged outpoints are false positives, so callers treat a hit as
/// best-effort exclusion rather than proof.
pub trait RespendOracle: Send + Sync {
    fn likely_known_respent(&self, outpoint: &OutPoint) -> bool;
}

/// Oracle that suspects nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullRespendOracle;

impl RespendOracle for NullRespendOracle {
    fn likely_known_respent(&self, _outpoint: &OutPoint) -> bool {
        false
    }
}

/// Post-assembly validity self-check. A failure here means the assembler
/// produced an inconsistent block and is surfaced as a fatal error.
pub trait SubBlockValidator: Send + Sync {
    fn test_sub_block_validity(&self, sub_block: &SubBlock, prev: &ChainTip) -> Result<(), String>;
}

/// Default validator: context-free structural checks only. Templates carry
/// a zeroed merkle root, so the root is not compared.
#[derive(Debug, Default, Clone, Copy)]
pub struct StructuralValidator;

impl SubBlockValidator for StructuralValidator {
    fn test_sub_block_validity(&self, sub_block: &SubBlock, _prev: &ChainTip) -> Result<(), String> {
        check_sub_block(sub_block, false).map_err(|err| err.to_string())
    }
}
