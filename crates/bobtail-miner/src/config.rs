//! Assembler configuration.
//!
//! Every runtime tweak the assembler honors is carried in [`MinerConfig`]
//! and injected at construction; there are no process-wide mutable
//! settings. Out-of-range values are clamped, not rejected.

use bobtail_primitives::{FeeRate, MAX_BLOCK_SIZE};

/// Largest block the assembler is willing to create by default.
pub const DEFAULT_BLOCK_MAX_SIZE: u64 = 8_000_000;

/// Bytes reserved for coin-age priority transactions by default.
pub const DEFAULT_BLOCK_PRIORITY_SIZE: u64 = 50_000;

/// Default sig-check ceiling under the fixed-sig-checks rule: one check
/// per 141 bytes of the hard block cap.
pub const DEFAULT_MAX_SIG_CHECKS: u64 = MAX_BLOCK_SIZE / 141;

/// Default byte reservation for the miner's replacement proof-base.
pub const DEFAULT_COINBASE_RESERVE: u64 = 1_000;

/// Which engine fills the fee region of the block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionStrategy {
    /// Single-transaction mining score with dependency deferral.
    Score,
    /// Ancestor-grouped packages (child pays for parent).
    Package,
}

#[derive(Debug, Clone)]
pub struct MinerConfig {
    /// Cap on assembled block bytes; clamped to
    /// `[1000, MAX_BLOCK_SIZE - 1000]`.
    pub block_max_size: u64,

    /// Below this size the package selector keeps going even when the
    /// remaining candidates pay under the relay floor. Clamped to
    /// `[0, block_max_size]`.
    pub block_min_size: u64,

    /// Bytes reserved for the priority phase; zero disables it.
    pub block_priority_size: u64,

    /// Test-network override for the header version field.
    pub block_version: Option<i32>,

    /// Log a line per selected transaction with its priority and fee rate.
    pub print_priority: bool,

    /// Select the fee region by ancestor package instead of by score.
    pub mining_cpfp: bool,

    /// Mark emitted templates for expedited validation: every transaction
    /// came straight from the mempool.
    pub expedited_validation: bool,

    /// Bytes to reserve for the proof-base miners substitute for ours.
    pub coinbase_reserve: u64,

    /// Block sig-op ceiling once the fixed-sig-checks rule is active.
    pub max_sig_checks: u64,

    /// Relay fee floor used by the package selector's early-out.
    pub min_relay_fee: FeeRate,

    /// Re-derive the difficulty target after moving the header time
    /// (min-difficulty test networks).
    pub pow_allow_min_difficulty: bool,
}

impl Default for MinerConfig {
    fn default() -> Self {
        Self {
            block_max_size: DEFAULT_BLOCK_MAX_SIZE,
            block_min_size: 0,
            block_priority_size: DEFAULT_BLOCK_PRIORITY_SIZE,
            block_version: None,
            print_priority: false,
            mining_cpfp: false,
            expedited_validation: true,
            coinbase_reserve: DEFAULT_COINBASE_RESERVE,
            max_sig_checks: DEFAULT_MAX_SIG_CHECKS,
            min_relay_fee: FeeRate::from_sat_per_kb(1_000),
            pow_allow_min_difficulty: false,
        }
    }
}

impl MinerConfig {
    /// Clamp the size knobs into their legal ranges, logging anything that
    /// had to move.
    pub fn sanitize(mut self) -> Self {
        let max = self.block_max_size.clamp(1_000, MAX_BLOCK_SIZE - 1_000);
        if max != self.block_max_size {
            tracing::warn!(
                "blockmaxsize {} out of range, clamped to {max}",
                self.block_max_size
            );
            self.block_max_size = max;
        }
        if self.block_min_size > self.block_max_size {
            tracing::warn!(
                "blockminsize {} above blockmaxsize, clamped to {}",
                self.block_min_size,
                self.block_max_size
            );
            self.block_min_size = self.block_max_size;
        }
        if self.block_priority_size > self.block_max_size {
            tracing::warn!(
                "blockprioritysize {} above blockmaxsize, clamped to {}",
                self.block_priority_size,
                self.block_max_size
            );
            self.block_priority_size = self.block_max_size;
        }
        self
    }

    pub fn strategy(&self) -> SelectionStrategy {
        if self.mining_cpfp {
            SelectionStrategy::Package
        } else {
            SelectionStrategy::Score
        }
    }
}
