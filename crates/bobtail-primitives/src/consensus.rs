//! Consensus constants and the small rule helpers block assembly depends on.

use bitcoin::{Amount, Script, Sequence, Transaction};

/// Hard cap on the serialized size of any block, in bytes.
pub const MAX_BLOCK_SIZE: u64 = 32_000_000;

/// One megabyte, the granularity of the legacy sig-op ceiling.
pub const ONE_MEGABYTE: u64 = 1_000_000;

/// Legacy sig-op allowance per started megabyte of block size.
pub const MAX_BLOCK_SIGOPS_PER_MB: u64 = 20_000;

/// Minimum serialized transaction size once the min-tx-size rule is active.
pub const MIN_TX_SIZE: u64 = 100;

/// Upper bound on a coinbase/proof-base scriptSig.
pub const MAX_COINBASE_SCRIPTSIG_SIZE: usize = 100;

/// Sig-ops reserved up front for the proof-base transaction.
pub const COINBASE_RESERVE_SIGOPS: u64 = 100;

/// Lock-time values below this threshold are block heights, values at or
/// above it are unix timestamps.
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;

/// One coin in satoshis.
pub const COIN: u64 = 100_000_000;

/// Network upgrade activation switches, resolved against a chain tip by the
/// chain-state engine and passed into assembly as plain flags.
#[derive(Debug, Clone, Copy, Default)]
pub struct UpgradeFlags {
    /// Transactions (proof-base included) must serialize to at least
    /// [`MIN_TX_SIZE`] bytes.
    pub min_tx_size_active: bool,

    /// The block sig-op ceiling is a fixed configured sig-check count
    /// instead of a function of accumulated block size.
    pub sig_checks_active: bool,

    /// Time-based lock times are evaluated against the median time past of
    /// the last eleven blocks instead of the block timestamp.
    pub mtp_locktime_active: bool,
}

/// Legacy sig-op ceiling for a block of `block_size` serialized bytes:
/// 20k sig-ops per started megabyte.
pub fn max_block_sigops(block_size: u64) -> u64 {
    (block_size.saturating_sub(1) / ONE_MEGABYTE + 1) * MAX_BLOCK_SIGOPS_PER_MB
}

/// Whether `tx` is final at the given height and lock-time cutoff.
///
/// A transaction with a lock time in the future is still final if every
/// input opts out via a max sequence number.
pub fn is_final_tx(tx: &Transaction, height: u32, lock_time_cutoff: u32) -> bool {
    let lock_time = tx.lock_time.to_consensus_u32();
    if lock_time == 0 {
        return true;
    }
    let threshold = if lock_time < LOCKTIME_THRESHOLD {
        height
    } else {
        lock_time_cutoff
    };
    if lock_time < threshold {
        return true;
    }
    tx.input.iter().all(|txin| txin.sequence == Sequence::MAX)
}

/// Coin-age priority threshold above which a transaction may be mined for
/// free: one coin, confirmed for a day, per 250 bytes.
pub fn allow_free(priority: f64) -> bool {
    priority > COIN as f64 * 144.0 / 250.0
}

/// Count sig-ops in every scriptSig and scriptPubKey of `tx` under the
/// legacy (inaccurate) rule: CHECKMULTISIG always counts as twenty.
pub fn legacy_sigop_count(tx: &Transaction) -> u64 {
    tx.input
        .iter()
        .map(|txin| script_sigop_count(&txin.script_sig))
        .chain(tx.output.iter().map(|txout| script_sigop_count(&txout.script_pubkey)))
        .sum()
}

fn script_sigop_count(script: &Script) -> u64 {
    const OP_PUSHDATA1: u8 = 0x4c;
    const OP_PUSHDATA2: u8 = 0x4d;
    const OP_PUSHDATA4: u8 = 0x4e;
    const OP_CHECKSIG: u8 = 0xac;
    const OP_CHECKSIGVERIFY: u8 = 0xad;
    const OP_CHECKMULTISIG: u8 = 0xae;
    const OP_CHECKMULTISIGVERIFY: u8 = 0xaf;

    let bytes = script.as_bytes();
    let mut count = 0;
    let mut i = 0;
    while i < bytes.len() {
        let op = bytes[i];
        i += 1;
        match op {
            // Data pushes carry no sig-ops; skip over the payload.
            0x01..=0x4b => i += op as usize,
            OP_PUSHDATA1 => {
                if i >= bytes.len() {
                    break;
                }
                i += 1 + bytes[i] as usize;
            }
            OP_PUSHDATA2 => {
                if i + 2 > bytes.len() {
                    break;
                }
                let len = u16::from_le_bytes([bytes[i], bytes[i + 1]]) as usize;
                i += 2 + len;
            }
            OP_PUSHDATA4 => {
                if i + 4 > bytes.len() {
                    break;
                }
                let len =
                    u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]) as usize;
                i += 4 + len;
            }
            OP_CHECKSIG | OP_CHECKSIGVERIFY => count += 1,
            OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => count += 20,
            _ => {}
        }
    }
    count
}

/// Fee rate in satoshis per kilobyte of serialized transaction data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FeeRate(u64);

impl FeeRate {
    /// Create a fee rate from satoshis per byte.
    pub fn from_sat_per_b(sat_b: u64) -> Self {
        Self(sat_b.saturating_mul(1000))
    }

    /// Create a fee rate from satoshis per kilobyte.
    pub fn from_sat_per_kb(sat_kb: u64) -> Self {
        Self(sat_kb)
    }

    /// Fee owed by `size` serialized bytes at this rate.
    pub fn fee_for(&self, size: u64) -> Amount {
        Amount::from_sat(self.0.saturating_mul(size) / 1000)
    }

    /// The rate in satoshis per kilobyte.
    pub fn as_sat_per_kb(&self) -> u64 {
        self.0
    }
}
