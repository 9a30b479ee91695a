//! # Sub-block assembly
//!
//! Builds weak-block (sub-block) templates from the live transaction pool:
//! a proof-base referencing the current DAG tips, an optional coin-age
//! priority region, and a fee region filled either by single-transaction
//! mining score or by ancestor-grouped packages (child pays for parent),
//! all under the consensus size and sig-op ceilings.
//!
//! Assembly runs single-threaded while the caller holds the chain-state
//! lock and the mempool read lock; it completes in one pass or fails with
//! an [`AssemblerError`].

mod assembler;
mod capacity;
mod config;
mod error;
mod proofbase;

pub use self::assembler::SubBlockAssembler;
pub use self::capacity::{BlockCapacity, CapacityCheck};
pub use self::config::{
    MinerConfig, SelectionStrategy, DEFAULT_BLOCK_MAX_SIZE, DEFAULT_BLOCK_PRIORITY_SIZE,
    DEFAULT_COINBASE_RESERVE, DEFAULT_MAX_SIG_CHECKS,
};
pub use self::error::AssemblerError;
pub use self::proofbase::{build_proof_base, increment_extra_nonce, PROOFBASE_SIZING_HEIGHT};
