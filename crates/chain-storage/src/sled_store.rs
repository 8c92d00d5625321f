use anyhow::Context;
use chain_core::constants::GENESIS_PREVIOUS_HASH;
use chain_core::ledger::ChainStore;
use chain_core::{Block, LedgerError};
use sled::transaction::{ConflictableTransactionError, TransactionError, Transactional};
use sled::{Db, IVec, Tree};
use std::path::Path;
use tracing::info;

const TREE_BLOCKS: &str = "blocks";
const TREE_META: &str = "meta";
const KEY_TIP_INDEX: &[u8] = b"tip_index";
const KEY_TIP_HASH: &[u8] = b"tip_hash";

/// Durable chain store on sled.
///
/// Blocks live in the `blocks` tree keyed by big-endian index, so tree
/// iteration order is ascending chain order. The `meta` tree carries the
/// tip index and tip hash; `append` updates both inside one sled
/// transaction that re-checks the tip, making the store the chain's single
/// serialization point under concurrent appenders.
#[derive(Clone)]
pub struct SledStore {
    db: Db,
    blocks: Tree,
    meta: Tree,
}

impl SledStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, LedgerError> {
        let db = sled::open(path).context("open sled database")?;
        let blocks = db.open_tree(TREE_BLOCKS).context("open blocks tree")?;
        let meta = db.open_tree(TREE_META).context("open meta tree")?;
        info!("sled store opened");
        Ok(Self { db, blocks, meta })
    }

    pub fn flush(&self) -> Result<(), LedgerError> {
        self.db.flush().context("flush sled database")?;
        Ok(())
    }

    /// Drop all chain data. Test helper; the ledger itself never deletes.
    pub fn clear(&self) -> Result<(), LedgerError> {
        self.blocks.clear().context("clear blocks tree")?;
        self.meta.clear().context("clear meta tree")?;
        self.flush()
    }

    fn decode_block(bytes: &IVec) -> Result<Block, LedgerError> {
        let block = serde_json::from_slice(bytes).context("decode stored block")?;
        Ok(block)
    }
}

fn decode_index(bytes: &IVec) -> u64 {
    let mut arr = [0u8; 8];
    arr.copy_from_slice(bytes);
    u64::from_be_bytes(arr)
}

impl ChainStore for SledStore {
    fn append(&self, block: &Block) -> Result<(), LedgerError> {
        let bytes = serde_json::to_vec(block).context("encode block")?;

        let result = (&self.blocks, &self.meta).transaction(|(blocks, meta)| {
            let tip_index = meta.get(KEY_TIP_INDEX)?.map(|v| decode_index(&v));
            let expected_index = tip_index.map_or(0, |i| i + 1);
            let expected_prev = match meta.get(KEY_TIP_HASH)? {
                Some(v) => String::from_utf8_lossy(&v).into_owned(),
                None => GENESIS_PREVIOUS_HASH.to_string(),
            };

            if block.index != expected_index || block.previous_hash != expected_prev {
                return Err(ConflictableTransactionError::Abort(
                    LedgerError::ChainConflict { index: block.index },
                ));
            }

            blocks.insert(&block.index.to_be_bytes(), bytes.as_slice())?;
            meta.insert(KEY_TIP_INDEX, &block.index.to_be_bytes())?;
            meta.insert(KEY_TIP_HASH, block.hash.as_bytes())?;
            Ok(())
        });

        match result {
            Ok(()) => {
                self.db.flush().context("flush after append")?;
                Ok(())
            }
            Err(TransactionError::Abort(e)) => Err(e),
            Err(TransactionError::Storage(e)) => {
                Err(anyhow::Error::new(e).context("sled transaction failed").into())
            }
        }
    }

    fn get_by_index(&self, index: u64) -> Result<Option<Block>, LedgerError> {
        let opt = self
            .blocks
            .get(index.to_be_bytes())
            .context("read block")?;
        opt.map(|ivec| Self::decode_block(&ivec)).transpose()
    }

    fn tip(&self) -> Result<Option<Block>, LedgerError> {
        match self.meta.get(KEY_TIP_INDEX).context("read tip index")? {
            Some(v) => self.get_by_index(decode_index(&v)),
            None => Ok(None),
        }
    }

    fn list_all(&self) -> Result<Vec<Block>, LedgerError> {
        let mut blocks = Vec::new();
        for entry in self.blocks.iter() {
            let (_, value) = entry.context("iterate blocks tree")?;
            blocks.push(Self::decode_block(&value)?);
        }
        Ok(blocks)
    }

    fn count(&self) -> Result<u64, LedgerError> {
        Ok(self.blocks.len() as u64)
    }
}
