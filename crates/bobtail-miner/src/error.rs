/// Fatal assembly failures. Per-candidate rejections are not errors; they
/// simply exclude the candidate.
#[derive(Debug, thiserror::Error)]
pub enum AssemblerError {
    /// No chain tip yet; a sub-block cannot be built before genesis.
    #[error("cannot assemble a sub-block without a chain tip")]
    MempoolUnavailable,

    /// The post-assembly self-check rejected the block we just built,
    /// which means an assembler bug or a race on chain state.
    #[error("sub-block validity self-check failed: {0}")]
    ValidityCheckFailed(String),
}
