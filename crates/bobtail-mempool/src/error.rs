use bitcoin::Txid;

/// Errors from mempool admission and maintenance.
#[derive(Debug, thiserror::Error)]
pub enum MempoolError {
    #[error("Transaction already in mempool")]
    AlreadyInMempool,

    #[error("Transaction conflicts with mempool transaction {0}")]
    TxConflict(Txid),

    #[error("Transaction not found in mempool")]
    NotFound,
}
