//! Shared types and consensus helpers for the bobtail sub-block node.
//!
//! Everything here is dependency-free with respect to the rest of the
//! workspace: the mempool, the miner and the token store all sit on top of
//! these definitions.

pub mod consensus;
pub mod subblock;
pub mod view;

pub use self::consensus::{
    allow_free, is_final_tx, legacy_sigop_count, max_block_sigops, FeeRate, UpgradeFlags,
    COINBASE_RESERVE_SIGOPS, MAX_BLOCK_SIGOPS_PER_MB, MAX_BLOCK_SIZE,
    MAX_COINBASE_SCRIPTSIG_SIZE, MIN_TX_SIZE, ONE_MEGABYTE,
};
pub use self::subblock::{check_sub_block, is_proof_base, SubBlock, SubBlockCheckError, SubBlockTemplate};
pub use self::view::{ChainTip, ChainView, NullRespendOracle, RespendOracle, StructuralValidator, SubBlockValidator};
