use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub mod constants;
pub mod error;
pub mod ledger;
pub mod pow;

pub use error::LedgerError;

/// One opaque domain event sealed into a block: an open-ended JSON object.
/// The ledger never interprets it beyond canonical serialization.
///
/// `serde_json`'s default map keeps keys sorted, which is what makes the
/// hash preimage canonical (see [`compute_hash`]).
pub type TxRecord = serde_json::Map<String, serde_json::Value>;

/// Convert any serializable value into a [`TxRecord`].
///
/// Fails with [`LedgerError::InvalidTransactionPayload`] when the value
/// cannot be represented as a JSON object — a non-object value, a map with
/// non-string keys, or a `Serialize` impl that errors. This is the gate
/// that keeps unserializable payloads out of the chain before any mining
/// starts.
pub fn tx_record<T: Serialize>(value: T) -> Result<TxRecord, LedgerError> {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::Object(map)) => Ok(map),
        Ok(other) => Err(LedgerError::InvalidTransactionPayload(format!(
            "transaction record must be a JSON object, got: {other}"
        ))),
        Err(e) => Err(LedgerError::InvalidTransactionPayload(e.to_string())),
    }
}

/// A sealed, hash-linked unit of the chain.
///
/// `timestamp` is an RFC 3339 UTC string captured once before mining; the
/// mined hash covers this exact value. Once a block has been persisted it
/// is read-only forever.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub index: u64,
    pub previous_hash: String,
    pub timestamp: String,
    pub transactions: Vec<TxRecord>,
    pub nonce: u64,
    pub hash: String,
}

impl Block {
    /// Recompute this block's hash from its own fields.
    pub fn recompute_hash(&self) -> Result<String, LedgerError> {
        compute_hash(
            self.index,
            &self.previous_hash,
            &self.timestamp,
            &self.transactions,
            self.nonce,
        )
    }

    /// True when the stored hash matches the block's content and carries
    /// the required number of leading zero characters. Does not validate
    /// chain linkage.
    pub fn is_valid(&self, difficulty: usize) -> bool {
        match self.recompute_hash() {
            Ok(expected) => self.hash == expected && pow::meets_difficulty(&self.hash, difficulty),
            Err(_) => false,
        }
    }
}

/// Canonical serialization of a transaction sequence: compact JSON with
/// lexicographically sorted object keys at every nesting level. This string
/// is part of the hash contract — independent implementations must
/// reproduce it byte for byte.
pub fn canonical_tx_json(transactions: &[TxRecord]) -> Result<String, LedgerError> {
    serde_json::to_string(transactions)
        .map_err(|e| LedgerError::InvalidTransactionPayload(e.to_string()))
}

/// Hash contract: SHA-256 over the UTF-8 bytes of
/// `{index}{previous_hash}{timestamp}{tx_json}{nonce}`, hex-encoded
/// lowercase, where `tx_json` is [`canonical_tx_json`] of the transaction
/// sequence.
pub fn compute_hash(
    index: u64,
    previous_hash: &str,
    timestamp: &str,
    transactions: &[TxRecord],
    nonce: u64,
) -> Result<String, LedgerError> {
    let tx_json = canonical_tx_json(transactions)?;
    Ok(hash_fields(index, previous_hash, timestamp, &tx_json, nonce))
}

/// Inner digest step shared with the mining loop, which serializes the
/// transaction list once and reuses it across nonce attempts.
pub(crate) fn hash_fields(
    index: u64,
    previous_hash: &str,
    timestamp: &str,
    tx_json: &str,
    nonce: u64,
) -> String {
    let preimage = format!("{index}{previous_hash}{timestamp}{tx_json}{nonce}");
    let mut hasher = Sha256::new();
    hasher.update(preimage.as_bytes());
    hex::encode(hasher.finalize())
}
