use crate::constants::{CANCEL_CHECK_INTERVAL, DIFFICULTY, MAX_MINE_ATTEMPTS};
use crate::{canonical_tx_json, hash_fields, Block, LedgerError, TxRecord};
use chrono::{SecondsFormat, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Mining parameters. `difficulty` is the number of leading `'0'` hex
/// characters required of the block hash; `max_attempts` bounds the nonce
/// search so a misconfigured target cannot block a worker forever.
#[derive(Clone, Copy, Debug)]
pub struct MineOptions {
    pub difficulty: usize,
    pub max_attempts: u64,
}

impl Default for MineOptions {
    fn default() -> Self {
        Self {
            difficulty: DIFFICULTY,
            max_attempts: MAX_MINE_ATTEMPTS,
        }
    }
}

/// True when `hash` starts with `difficulty` zero characters.
pub fn meets_difficulty(hash: &str, difficulty: usize) -> bool {
    hash.len() >= difficulty && hash.bytes().take(difficulty).all(|b| b == b'0')
}

/// Mine a block by linear nonce search.
///
/// The timestamp is captured once at call start and fixed thereafter; the
/// mined hash covers that exact value. Pure CPU work, no locks, no storage
/// access — the caller appends the result separately, which is why a mined
/// block can turn out stale (`ChainConflict`) by the time it is persisted.
///
/// `cancel` is checked periodically inside the loop; a set flag makes the
/// search return [`LedgerError::MiningCancelled`] with the chain untouched.
pub fn mine_block(
    index: u64,
    previous_hash: &str,
    transactions: Vec<TxRecord>,
    opts: MineOptions,
    cancel: &AtomicBool,
) -> Result<Block, LedgerError> {
    let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
    let target = "0".repeat(opts.difficulty);
    // The transaction encoding is invariant across the search; serialize once.
    let tx_json = canonical_tx_json(&transactions)?;

    let mut nonce: u64 = 0;
    let mut attempts: u64 = 0;
    loop {
        if attempts % CANCEL_CHECK_INTERVAL == 0 && cancel.load(Ordering::Relaxed) {
            return Err(LedgerError::MiningCancelled);
        }

        let hash = hash_fields(index, previous_hash, &timestamp, &tx_json, nonce);
        if hash.starts_with(&target) {
            debug!(index, nonce, %hash, "mined block");
            return Ok(Block {
                index,
                previous_hash: previous_hash.to_string(),
                timestamp,
                transactions,
                nonce,
                hash,
            });
        }

        attempts += 1;
        if attempts >= opts.max_attempts {
            return Err(LedgerError::MiningExhausted { attempts });
        }
        nonce += 1;
    }
}
