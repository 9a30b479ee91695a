//! RocksDB-backed token store.
//!
//! Keys: `'T' || txid || varint(vout)` for tokens, the single byte `'B'`
//! for the best-block hash. Flushes arrive as whole cache maps and are
//! broken into size-bounded write batches so a large flush never spikes
//! memory.

use crate::cache::{TokenCacheEntry, TokenMap};
use crate::error::SlpStoreError;
use crate::token::SlpToken;
use bitcoin::consensus::encode::VarInt;
use bitcoin::hashes::Hash;
use bitcoin::{BlockHash, OutPoint};
use rocksdb::{Options, WriteBatch, DB};
use std::path::Path;

const DB_SLP_TOKEN: u8 = b'T';
const DB_BEST_SLP_BLOCK: u8 = b'B';

/// Default upper bound on a single write batch, in bytes.
pub const DEFAULT_MAX_BATCH_BYTES: usize = 16 * 1024 * 1024;

fn token_key(outpoint: &OutPoint) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + 32 + 5);
    key.push(DB_SLP_TOKEN);
    key.extend_from_slice(outpoint.txid.as_ref());
    key.extend_from_slice(&bitcoin::consensus::serialize(&VarInt(outpoint.vout as u64)));
    key
}

/// Persistent token store.
pub struct TokenDb {
    db: DB,
    max_batch_bytes: usize,
}

impl TokenDb {
    /// Open or create the store at `path`.
    pub fn open(path: &Path) -> Result<Self, SlpStoreError> {
        Self::open_with_batch_limit(path, DEFAULT_MAX_BATCH_BYTES)
    }

    pub fn open_with_batch_limit(
        path: &Path,
        max_batch_bytes: usize,
    ) -> Result<Self, SlpStoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let db = DB::open(&db_opts, path)?;
        Ok(Self { db, max_batch_bytes })
    }

    /// Read a token by outpoint.
    pub fn get(&self, outpoint: &OutPoint) -> Result<Option<SlpToken>, SlpStoreError> {
        match self.db.get(token_key(outpoint))? {
            Some(bytes) => Ok(Some(SlpToken::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn contains(&self, outpoint: &OutPoint) -> Result<bool, SlpStoreError> {
        Ok(self.db.get(token_key(outpoint))?.is_some())
    }

    /// Flush every DIRTY entry of `tokens` into the store.
    ///
    /// Spent entries are erased from both the store and the map. Written
    /// entries have their flags cleared; with `evict_flushed` set (chain
    /// near sync, flushed entries will come from the pool from now on)
    /// they leave the map entirely to cap memory. The batch is split into
    /// fragments of at most the configured byte size, and the best-block
    /// hash rides in the final fragment so it never advances ahead of the
    /// data.
    pub fn batch_write(
        &self,
        tokens: &mut TokenMap,
        best_block: Option<BlockHash>,
        evict_flushed: bool,
    ) -> Result<(), SlpStoreError> {
        let mut batch = WriteBatch::default();
        let mut evicted: Vec<OutPoint> = Vec::new();
        let mut changed = 0usize;
        let mut fragments = 0usize;

        for (outpoint, entry) in tokens.iter_mut() {
            if !entry.is_dirty() {
                continue;
            }
            let key = token_key(outpoint);
            if entry.token.is_spent() {
                batch.delete(key);
                evicted.push(*outpoint);
            } else {
                batch.put(key, entry.token.encode());
                if evict_flushed {
                    evicted.push(*outpoint);
                } else {
                    entry.clear_flags();
                }
            }
            changed += 1;

            if batch.size_in_bytes() > self.max_batch_bytes {
                self.db.write(std::mem::take(&mut batch))?;
                fragments += 1;
            }
        }

        if let Some(hash) = best_block {
            batch.put([DB_BEST_SLP_BLOCK], hash.to_byte_array());
        }
        self.db.write(batch)?;
        fragments += 1;

        for outpoint in evicted {
            tokens.remove(&outpoint);
        }

        tracing::debug!(
            "committed {changed} changed tokens to the token store in {fragments} batch writes"
        );
        Ok(())
    }

    /// The best-block hash recorded by the last flush, if any.
    pub fn best_block(&self) -> Result<Option<BlockHash>, SlpStoreError> {
        match self.db.get([DB_BEST_SLP_BLOCK])? {
            Some(bytes) if bytes.len() == 32 => {
                let mut hash = [0u8; 32];
                hash.copy_from_slice(&bytes);
                Ok(Some(BlockHash::from_byte_array(hash)))
            }
            _ => Ok(None),
        }
    }

    pub fn write_best_block(&self, hash: BlockHash) -> Result<(), SlpStoreError> {
        Ok(self.db.put([DB_BEST_SLP_BLOCK], hash.to_byte_array())?)
    }

    /// Estimated on-disk size of the store.
    pub fn estimate_size(&self) -> u64 {
        self.db
            .property_int_value(rocksdb::properties::ESTIMATE_LIVE_DATA_SIZE)
            .ok()
            .flatten()
            .unwrap_or(0)
    }
}
