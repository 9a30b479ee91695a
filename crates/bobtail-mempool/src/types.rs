//! Core mempool type definitions.

use bitcoin::{Amount, Transaction};
use slotmap::DefaultKey;
use std::sync::Arc;

/// Stable handle to an entry in the mempool arena (not an iterator).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId(pub(crate) DefaultKey);

/// Everything the admission path needs to know about a transaction that is
/// not derivable from its bytes. Fee, sig-op count and the coin-age inputs
/// come from validation against the UTXO set, which lives outside this
/// crate.
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub tx: Arc<Transaction>,
    pub fee: Amount,
    pub sigops: u32,
    /// Arrival timestamp in microseconds.
    pub time_micros: i64,
    /// Chain height at arrival.
    pub entry_height: u32,
    /// Coin-age priority at arrival.
    pub entry_priority: f64,
    /// Sum of confirmed input values, for priority aging.
    pub in_chain_input_value: Amount,
}
