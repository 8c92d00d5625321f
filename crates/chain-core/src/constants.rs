pub const HASH_SIZE: usize = 32;
pub const HASH_HEX_SIZE: usize = HASH_SIZE * 2;

/// Leading zero hex characters required of every block hash.
pub const DIFFICULTY: usize = 2;

/// `previous_hash` of the genesis block, which has no real predecessor.
pub const GENESIS_PREVIOUS_HASH: &str = "0";

/// Default cap on nonce attempts per mining call. At difficulty 2 the
/// expected search is ~256 attempts, so hitting this cap is a fault.
pub const MAX_MINE_ATTEMPTS: u64 = 1_000_000;

/// Append retries before `append_block` gives up with `LedgerBusy`.
pub const MAX_APPEND_RETRIES: u32 = 5;

/// Mining checks its cancellation flag every this many attempts.
pub(crate) const CANCEL_CHECK_INTERVAL: u64 = 64;
