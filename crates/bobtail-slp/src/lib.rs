//! # SLP token overlay
//!
//! Tracks Simple Ledger Protocol token outputs UTXO-style: a persistent
//! store keyed by outpoint and a flagged write-back cache on top, following
//! the same cache-over-database discipline as the main coin set. Validation
//! checks presence here the way it checks coins, rather than replaying the
//! full token history of every input.

mod cache;
mod db;
mod error;
mod token;

pub use self::cache::{
    add_tokens_for_tx, spend_tokens, TokenCache, TokenCacheEntry, TokenMap, DIRTY, FRESH,
};
pub use self::db::{TokenDb, DEFAULT_MAX_BATCH_BYTES};
pub use self::error::SlpStoreError;
pub use self::token::{SlpCodecError, SlpParseError, SlpToken, SlpTxType, SLP_LOKAD_ID};
