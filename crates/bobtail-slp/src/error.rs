use crate::token::SlpCodecError;

/// Token store failures.
#[derive(Debug, thiserror::Error)]
pub enum SlpStoreError {
    #[error(transparent)]
    RocksDb(#[from] rocksdb::Error),

    #[error("corrupt token record: {0}")]
    Codec(#[from] SlpCodecError),
}
