use thiserror::Error;

/// Failure taxonomy for the ledger core. Every variant leaves the persisted
/// chain in a state satisfying the linkage, hash, and difficulty invariants;
/// no partial block is ever written.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// A transaction record could not be canonically serialized. Rejected
    /// before mining starts; no chain state changes.
    #[error("invalid transaction payload: {0}")]
    InvalidTransactionPayload(String),

    /// An append lost the race for its index to a concurrent writer. The
    /// ledger service retries this internally against the new tip.
    #[error("append conflict at index {index}: another block won the race")]
    ChainConflict { index: u64 },

    /// Append retries exhausted under contention. Transient; safe to retry.
    #[error("ledger busy: gave up after {retries} append retries")]
    LedgerBusy { retries: u32 },

    /// Nonce attempt cap reached without satisfying the difficulty target.
    #[error("mining exhausted after {attempts} attempts")]
    MiningExhausted { attempts: u64 },

    /// Mining observed its cancellation flag and exited without appending.
    #[error("mining cancelled")]
    MiningCancelled,

    /// Storage backend fault; fatal for the single calling operation.
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}
