//! Layered token cache over the persistent store.
//!
//! The cache mirrors the UTXO-cache discipline: entries carry DIRTY (differs
//! from the store) and FRESH (the store does not have it) flags, reads fill
//! the cache through the store, and flushes push DIRTY entries down in
//! bounded batches.
//!
//! One reader-writer lock guards the map. Reads probe under the shared
//! lock; a miss releases it, loads from the store, then takes the exclusive
//! lock and re-probes before inserting, since another thread may have won
//! the race in between.

use crate::db::TokenDb;
use crate::error::SlpStoreError;
use crate::token::SlpToken;
use bitcoin::{BlockHash, OutPoint, Transaction};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// This cache entry is potentially different from the stored version.
pub const DIRTY: u8 = 1 << 0;
/// The store does not have this entry.
pub const FRESH: u8 = 1 << 1;

/// A cached token with its coherency flags.
#[derive(Debug, Clone)]
pub struct TokenCacheEntry {
    pub token: SlpToken,
    pub flags: u8,
}

impl TokenCacheEntry {
    pub fn new(token: SlpToken, flags: u8) -> Self {
        Self { token, flags }
    }

    pub fn dirty(token: SlpToken) -> Self {
        Self::new(token, DIRTY | FRESH)
    }

    pub fn is_dirty(&self) -> bool {
        self.flags & DIRTY != 0
    }

    pub fn is_fresh(&self) -> bool {
        self.flags & FRESH != 0
    }

    pub fn clear_flags(&mut self) {
        self.flags = 0;
    }
}

pub type TokenMap = HashMap<OutPoint, TokenCacheEntry>;

/// In-memory token view backed by a [`TokenDb`].
pub struct TokenCache {
    base: Arc<TokenDb>,
    tokens: RwLock<TokenMap>,
    best_block: RwLock<Option<BlockHash>>,
}

impl TokenCache {
    pub fn new(base: Arc<TokenDb>) -> Self {
        Self {
            base,
            tokens: RwLock::new(TokenMap::new()),
            best_block: RwLock::new(None),
        }
    }

    /// Look up the token at `outpoint`, reading through to the store on a
    /// cache miss.
    pub fn get(&self, outpoint: &OutPoint) -> Result<Option<SlpToken>, SlpStoreError> {
        {
            let tokens = self.tokens.read();
            if let Some(entry) = tokens.get(outpoint) {
                return Ok(Some(entry.token.clone()));
            }
        }

        // Miss: the shared lock is already released, hit the store before
        // taking the exclusive lock.
        let Some(token) = self.base.get(outpoint)? else {
            return Ok(None);
        };

        let mut tokens = self.tokens.write();
        // Another thread may have populated the slot while we were loading.
        let entry = tokens
            .entry(*outpoint)
            .or_insert_with(|| TokenCacheEntry::new(token, FRESH));
        Ok(Some(entry.token.clone()))
    }

    /// Whether `outpoint` is already cached, without touching the store.
    pub fn have_token_in_cache(&self, outpoint: &OutPoint) -> bool {
        self.tokens.read().contains_key(outpoint)
    }

    /// Insert or overwrite the token at `outpoint`.
    pub fn add(&self, outpoint: OutPoint, token: SlpToken) {
        let mut tokens = self.tokens.write();
        let entry = tokens.entry(outpoint).or_insert_with(|| TokenCacheEntry {
            token: token.clone(),
            flags: 0,
        });
        // FRESH only survives an overwrite if the previous version never
        // reached the store.
        let fresh = !entry.is_dirty();
        entry.token = token;
        entry.flags |= DIRTY | if fresh { FRESH } else { 0 };
    }

    /// Spend the token at `outpoint`. A FRESH entry disappears outright,
    /// since the store has nothing to erase; anything else is nulled and
    /// marked DIRTY so the flush removes it from the store.
    pub fn spend(&self, outpoint: &OutPoint) {
        let mut tokens = self.tokens.write();

        // Under the exclusive lock the read-through probe needs no
        // escalation dance.
        if !tokens.contains_key(outpoint) {
            match self.base.get(outpoint) {
                Ok(Some(token)) => {
                    tokens.insert(*outpoint, TokenCacheEntry::new(token, FRESH));
                }
                Ok(None) => return,
                Err(err) => {
                    tracing::warn!("token store read failed while spending: {err}");
                    return;
                }
            }
        }

        let is_fresh = match tokens.get(outpoint) {
            Some(entry) => entry.is_fresh(),
            None => return,
        };
        if is_fresh {
            tokens.remove(outpoint);
        } else if let Some(entry) = tokens.get_mut(outpoint) {
            entry.flags |= DIRTY;
            entry.token.spend();
        }
    }

    /// Push every DIRTY entry down to the store. With `chain_nearly_synced`
    /// set, flushed entries are also evicted to cap memory.
    pub fn flush(&self, chain_nearly_synced: bool) -> Result<(), SlpStoreError> {
        let mut tokens = self.tokens.write();
        let best_block = *self.best_block.read();
        self.base
            .batch_write(&mut tokens, best_block, chain_nearly_synced)
    }

    /// Forget the cached entry at `outpoint`, if it is unmodified.
    pub fn uncache(&self, outpoint: &OutPoint) {
        let mut tokens = self.tokens.write();
        if tokens.get(outpoint).is_some_and(|entry| !entry.is_dirty()) {
            tokens.remove(outpoint);
        }
    }

    /// Forget every unmodified entry created by `tx`'s outputs.
    pub fn uncache_tx(&self, tx: &Transaction) {
        let txid = tx.compute_txid();
        for vout in 0..tx.output.len() {
            self.uncache(&OutPoint::new(txid, vout as u32));
        }
    }

    /// Shrink the cache to at most `target` entries by dropping unmodified
    /// ones.
    pub fn trim(&self, target: usize) {
        let mut tokens = self.tokens.write();
        if tokens.len() <= target {
            return;
        }
        let excess = tokens.len() - target;
        let victims: Vec<OutPoint> = tokens
            .iter()
            .filter(|(_, entry)| !entry.is_dirty())
            .take(excess)
            .map(|(outpoint, _)| *outpoint)
            .collect();
        for outpoint in victims {
            tokens.remove(&outpoint);
        }
    }

    /// Drop every cached entry, modified or not.
    pub fn clear(&self) {
        self.tokens.write().clear();
    }

    pub fn cache_size(&self) -> usize {
        self.tokens.read().len()
    }

    pub fn set_best_block(&self, hash: BlockHash) {
        *self.best_block.write() = Some(hash);
    }

    pub fn best_block(&self) -> Option<BlockHash> {
        *self.best_block.read()
    }
}

/// Record every SLP output of `tx` in the cache. Non-SLP outputs are
/// skipped; tracking presence (not full history validity) matches how the
/// main UTXO set is maintained.
pub fn add_tokens_for_tx(cache: &TokenCache, tx: &Transaction, height: u32) {
    let txid = tx.compute_txid();
    for (vout, output) in tx.output.iter().enumerate() {
        let Ok(token) = SlpToken::parse(&output.script_pubkey, height) else {
            continue;
        };
        cache.add(OutPoint::new(txid, vout as u32), token);
    }
}

/// Spend the token view of every input of `tx`.
pub fn spend_tokens(cache: &TokenCache, tx: &Transaction) {
    for txin in &tx.input {
        cache.spend(&txin.previous_output);
    }
}
