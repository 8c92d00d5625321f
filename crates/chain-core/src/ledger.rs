use crate::constants::{GENESIS_PREVIOUS_HASH, MAX_APPEND_RETRIES};
use crate::pow::{self, MineOptions};
use crate::{Block, LedgerError, TxRecord};
use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Durable, ordered collection of sealed blocks keyed by index.
///
/// `append` is the chain's single mutation gate: it must atomically enforce
/// that the new block extends the current tip (`index == tip.index + 1` and
/// `previous_hash == tip.hash`, or index 0 with the sentinel on an empty
/// store) and reject losers of a concurrent race with
/// [`LedgerError::ChainConflict`]. Persisted blocks are never mutated or
/// deleted.
///
/// This trait lives in chain-core so storage backends can depend on the
/// core without a circular dependency.
pub trait ChainStore: Send + Sync {
    fn append(&self, block: &Block) -> Result<(), LedgerError>;
    fn get_by_index(&self, index: u64) -> Result<Option<Block>, LedgerError>;
    /// Block with the highest index, or `None` when the chain is empty.
    fn tip(&self) -> Result<Option<Block>, LedgerError>;
    /// All blocks in ascending index order.
    fn list_all(&self) -> Result<Vec<Block>, LedgerError>;
    fn count(&self) -> Result<u64, LedgerError>;
}

/// Chain summary for the read side.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChainStats {
    pub total_blocks: u64,
    pub latest_block: Option<Block>,
}

/// One transaction record annotated with the block that seals it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TxView {
    pub block_index: u64,
    pub block_hash: String,
    #[serde(flatten)]
    pub record: TxRecord,
}

/// The single fixed marker record sealed into the genesis block.
pub fn genesis_record() -> TxRecord {
    let mut record = TxRecord::new();
    record.insert("type".to_string(), json!("genesis"));
    record.insert(
        "message".to_string(),
        json!("Genesis block for the credit ledger"),
    );
    record
}

/// Orchestrates genesis creation, block append, and read-side queries over
/// a [`ChainStore`]. Holds no chain state of its own — the store is the
/// only source of truth, and its `append` the only serialization point.
///
/// Mining runs without any lock, so a freshly mined block may be stale by
/// the time it is appended; `append_block` re-mines against the new tip on
/// [`LedgerError::ChainConflict`], a bounded number of times.
pub struct Ledger<S: ChainStore> {
    store: Arc<S>,
    opts: MineOptions,
    cancel: Arc<AtomicBool>,
}

impl<S: ChainStore> Ledger<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self::with_options(store, MineOptions::default())
    }

    pub fn with_options(store: Arc<S>, opts: MineOptions) -> Self {
        Self {
            store,
            opts,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Signal in-flight and future mining loops to exit without appending.
    pub fn shutdown(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    /// Create the genesis block if the store is empty. Idempotent: when a
    /// genesis already exists it is returned unchanged, never mined twice.
    pub fn ensure_genesis(&self) -> Result<Block, LedgerError> {
        if let Some(genesis) = self.store.get_by_index(0)? {
            return Ok(genesis);
        }
        let genesis = pow::mine_block(
            0,
            GENESIS_PREVIOUS_HASH,
            vec![genesis_record()],
            self.opts,
            &self.cancel,
        )?;
        match self.store.append(&genesis) {
            Ok(()) => {
                info!(hash = %genesis.hash, nonce = genesis.nonce, "genesis block created");
                Ok(genesis)
            }
            // A concurrent writer created genesis first; use theirs.
            Err(LedgerError::ChainConflict { .. }) => self
                .store
                .get_by_index(0)?
                .ok_or_else(|| anyhow!("genesis missing after append conflict").into()),
            Err(e) => Err(e),
        }
    }

    /// Seal a batch of transaction records into a new block at the tip.
    ///
    /// On a lost append race the tip is re-fetched and the block re-mined
    /// (the required `previous_hash` has changed), up to
    /// `MAX_APPEND_RETRIES` attempts before surfacing
    /// [`LedgerError::LedgerBusy`].
    pub fn append_block(&self, transactions: Vec<TxRecord>) -> Result<Block, LedgerError> {
        self.ensure_genesis()?;
        for attempt in 0..MAX_APPEND_RETRIES {
            let tip = self
                .store
                .tip()?
                .ok_or_else(|| anyhow!("chain has no tip after genesis"))?;
            let block = pow::mine_block(
                tip.index + 1,
                &tip.hash,
                transactions.clone(),
                self.opts,
                &self.cancel,
            )?;
            match self.store.append(&block) {
                Ok(()) => return Ok(block),
                Err(LedgerError::ChainConflict { index }) => {
                    warn!(index, attempt, "append lost the race, re-mining against new tip");
                }
                Err(e) => return Err(e),
            }
        }
        Err(LedgerError::LedgerBusy {
            retries: MAX_APPEND_RETRIES,
        })
    }

    /// Total block count and current tip, ensuring genesis first so an
    /// empty store reports a one-block chain.
    pub fn stats(&self) -> Result<ChainStats, LedgerError> {
        self.ensure_genesis()?;
        Ok(ChainStats {
            total_blocks: self.store.count()?,
            latest_block: self.store.tip()?,
        })
    }

    /// Full chain in ascending index order.
    pub fn list_blocks(&self) -> Result<Vec<Block>, LedgerError> {
        self.store.list_all()
    }

    /// Every sealed transaction record with its block provenance, ordered
    /// by descending block index then ascending in-block position (most
    /// recent block first).
    pub fn list_transactions(&self) -> Result<Vec<TxView>, LedgerError> {
        let blocks = self.store.list_all()?;
        let mut views = Vec::new();
        for block in blocks.iter().rev() {
            for record in &block.transactions {
                views.push(TxView {
                    block_index: block.index,
                    block_hash: block.hash.clone(),
                    record: record.clone(),
                });
            }
        }
        Ok(views)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::DIFFICULTY;
    use crate::tx_record;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;

    /// In-memory store used only by these tests; the sled-backed store in
    /// chain-storage is the production implementation.
    #[derive(Default)]
    struct MemStore {
        blocks: Mutex<Vec<Block>>,
    }

    impl ChainStore for MemStore {
        fn append(&self, block: &Block) -> Result<(), LedgerError> {
            let mut blocks = self.blocks.lock().unwrap();
            let (expected_index, expected_prev) = match blocks.last() {
                Some(tip) => (tip.index + 1, tip.hash.clone()),
                None => (0, GENESIS_PREVIOUS_HASH.to_string()),
            };
            if block.index != expected_index || block.previous_hash != expected_prev {
                return Err(LedgerError::ChainConflict { index: block.index });
            }
            blocks.push(block.clone());
            Ok(())
        }

        fn get_by_index(&self, index: u64) -> Result<Option<Block>, LedgerError> {
            Ok(self
                .blocks
                .lock()
                .unwrap()
                .iter()
                .find(|b| b.index == index)
                .cloned())
        }

        fn tip(&self) -> Result<Option<Block>, LedgerError> {
            Ok(self.blocks.lock().unwrap().last().cloned())
        }

        fn list_all(&self) -> Result<Vec<Block>, LedgerError> {
            Ok(self.blocks.lock().unwrap().clone())
        }

        fn count(&self) -> Result<u64, LedgerError> {
            Ok(self.blocks.lock().unwrap().len() as u64)
        }
    }

    /// Wrapper that makes the first `failures` appends lose the race, to
    /// exercise the re-mine-and-retry path without real contention.
    struct ConflictingStore {
        inner: MemStore,
        failures: AtomicU32,
    }

    impl ConflictingStore {
        fn new(failures: u32) -> Self {
            Self {
                inner: MemStore::default(),
                failures: AtomicU32::new(failures),
            }
        }
    }

    impl ChainStore for ConflictingStore {
        fn append(&self, block: &Block) -> Result<(), LedgerError> {
            // Let genesis through so append_block reaches the retry loop.
            if block.index > 0 {
                let remaining = self.failures.load(Ordering::SeqCst);
                if remaining > 0 {
                    self.failures.store(remaining - 1, Ordering::SeqCst);
                    return Err(LedgerError::ChainConflict { index: block.index });
                }
            }
            self.inner.append(block)
        }

        fn get_by_index(&self, index: u64) -> Result<Option<Block>, LedgerError> {
            self.inner.get_by_index(index)
        }

        fn tip(&self) -> Result<Option<Block>, LedgerError> {
            self.inner.tip()
        }

        fn list_all(&self) -> Result<Vec<Block>, LedgerError> {
            self.inner.list_all()
        }

        fn count(&self) -> Result<u64, LedgerError> {
            self.inner.count()
        }
    }

    fn ledger() -> Ledger<MemStore> {
        Ledger::new(Arc::new(MemStore::default()))
    }

    fn registration(username: &str) -> TxRecord {
        tx_record(json!({ "type": "user_registration", "username": username })).unwrap()
    }

    #[test]
    fn genesis_has_fixed_shape() {
        let ledger = ledger();
        let genesis = ledger.ensure_genesis().unwrap();
        assert_eq!(genesis.index, 0);
        assert_eq!(genesis.previous_hash, GENESIS_PREVIOUS_HASH);
        assert_eq!(genesis.transactions, vec![genesis_record()]);
        assert!(genesis.hash.starts_with("00"));
        assert!(genesis.is_valid(DIFFICULTY));
    }

    #[test]
    fn ensure_genesis_is_idempotent() {
        let ledger = ledger();
        let first = ledger.ensure_genesis().unwrap();
        let second = ledger.ensure_genesis().unwrap();
        assert_eq!(first, second);
        assert_eq!(ledger.store().count().unwrap(), 1);
    }

    #[test]
    fn append_block_links_to_tip() {
        let ledger = ledger();
        let genesis = ledger.ensure_genesis().unwrap();
        let block = ledger.append_block(vec![registration("alice")]).unwrap();
        assert_eq!(block.index, 1);
        assert_eq!(block.previous_hash, genesis.hash);
        assert_eq!(block.transactions, vec![registration("alice")]);
        assert!(block.hash.starts_with("00"));
    }

    #[test]
    fn append_block_creates_genesis_on_empty_store() {
        let ledger = ledger();
        let block = ledger.append_block(vec![registration("bob")]).unwrap();
        assert_eq!(block.index, 1);
        assert_eq!(ledger.store().count().unwrap(), 2);
        assert_eq!(ledger.store().get_by_index(0).unwrap().unwrap().index, 0);
    }

    #[test]
    fn chain_stays_linked_and_gapless() {
        let ledger = ledger();
        for i in 0..4 {
            ledger
                .append_block(vec![registration(&format!("user-{i}"))])
                .unwrap();
        }
        let blocks = ledger.list_blocks().unwrap();
        assert_eq!(blocks.len(), 5);
        for (i, block) in blocks.iter().enumerate() {
            assert_eq!(block.index, i as u64);
            assert!(block.is_valid(DIFFICULTY));
            if i > 0 {
                assert_eq!(block.previous_hash, blocks[i - 1].hash);
            }
        }
    }

    #[test]
    fn stats_reports_count_and_tip() {
        let ledger = ledger();
        let stats = ledger.stats().unwrap();
        assert_eq!(stats.total_blocks, 1);
        assert_eq!(stats.latest_block.as_ref().unwrap().index, 0);

        let block = ledger.append_block(vec![registration("carol")]).unwrap();
        let stats = ledger.stats().unwrap();
        assert_eq!(stats.total_blocks, 2);
        assert_eq!(stats.latest_block.unwrap().hash, block.hash);
    }

    #[test]
    fn list_transactions_most_recent_block_first() {
        let ledger = ledger();
        ledger.ensure_genesis().unwrap();
        let a = tx_record(json!({ "type": "credit_add", "amount": 100.0 })).unwrap();
        let b = tx_record(json!({ "type": "credit_transfer", "amount": 40.0 })).unwrap();
        let c = tx_record(json!({ "type": "certificate_issued" })).unwrap();
        let block1 = ledger.append_block(vec![a.clone(), b.clone()]).unwrap();
        let block2 = ledger.append_block(vec![c.clone()]).unwrap();

        let views = ledger.list_transactions().unwrap();
        assert_eq!(views.len(), 4); // genesis marker + a + b + c
        assert_eq!(views[0].block_index, block2.index);
        assert_eq!(views[0].block_hash, block2.hash);
        assert_eq!(views[0].record, c);
        // In-block order preserved within the older block.
        assert_eq!(views[1].record, a);
        assert_eq!(views[2].record, b);
        assert_eq!(views[1].block_index, block1.index);
        assert_eq!(views[3].record, genesis_record());
    }

    #[test]
    fn tx_view_flattens_record_fields() {
        let view = TxView {
            block_index: 3,
            block_hash: "00beef".to_string(),
            record: registration("dave"),
        };
        let value = serde_json::to_value(&view).unwrap();
        assert_eq!(value["block_index"], json!(3));
        assert_eq!(value["block_hash"], json!("00beef"));
        assert_eq!(value["username"], json!("dave"));
    }

    #[test]
    fn conflict_is_retried_until_append_wins() {
        let store = Arc::new(ConflictingStore::new(2));
        let ledger = Ledger::new(store.clone());
        let block = ledger.append_block(vec![registration("erin")]).unwrap();
        assert_eq!(block.index, 1);
        assert_eq!(store.count().unwrap(), 2);
    }

    #[test]
    fn exhausted_retries_surface_ledger_busy() {
        let store = Arc::new(ConflictingStore::new(u32::MAX));
        let ledger = Ledger::new(store.clone());
        let err = ledger.append_block(vec![registration("mallory")]).unwrap_err();
        assert!(matches!(err, LedgerError::LedgerBusy { retries: MAX_APPEND_RETRIES }));
        // Nothing beyond genesis was persisted.
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn store_rejects_non_linked_blocks() {
        let ledger = ledger();
        let genesis = ledger.ensure_genesis().unwrap();

        // Re-appending the same index loses to the existing block.
        let err = ledger.store().append(&genesis).unwrap_err();
        assert!(matches!(err, LedgerError::ChainConflict { index: 0 }));

        // A block that skips an index is rejected too.
        let cancel = AtomicBool::new(false);
        let orphan = pow::mine_block(
            5,
            &genesis.hash,
            vec![registration("frank")],
            MineOptions::default(),
            &cancel,
        )
        .unwrap();
        let err = ledger.store().append(&orphan).unwrap_err();
        assert!(matches!(err, LedgerError::ChainConflict { index: 5 }));
        assert_eq!(ledger.store().count().unwrap(), 1);
    }

    #[test]
    fn shutdown_cancels_in_flight_mining() {
        let ledger = ledger();
        ledger.ensure_genesis().unwrap();
        ledger.shutdown();
        let err = ledger.append_block(vec![registration("grace")]).unwrap_err();
        assert!(matches!(err, LedgerError::MiningCancelled));
        assert_eq!(ledger.store().count().unwrap(), 1);
    }
}
