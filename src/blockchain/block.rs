use chrono::Utc;
use log::info;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::pow::{ProofOfWork, ProofOfWorkError};
use super::transaction::Transaction;

/// Errors that can occur while building or decoding a block
#[derive(Debug, Error)]
pub enum BlockError {
    #[error("Proof of work error: {0}")]
    ProofOfWork(#[from] ProofOfWorkError),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Decoding error: {0}")]
    Decoding(String),
}

/// Represents a block in the blockchain
///
/// Blocks only come into existence through [`Block::mine`] or by decoding
/// stored bytes, so the hash always belongs to the contents it was mined for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Creation time in seconds since the Unix epoch
    timestamp: i64,

    /// Transactions in insertion order
    transactions: Vec<Transaction>,

    /// Hash of the previous block, empty for the genesis block
    prev_block_hash: Vec<u8>,

    /// Hash of this block
    hash: Vec<u8>,

    /// Proof of work nonce
    nonce: u64,
}

impl Block {
    /// Mines a new block on top of `prev_block_hash`
    ///
    /// # Arguments
    ///
    /// * `transactions` - The transactions to include, order preserved
    /// * `prev_block_hash` - The hash of the current tip, empty for genesis
    /// * `pow` - The proof-of-work parameters
    ///
    /// # Returns
    ///
    /// The mined block, or `MiningExhausted` if no nonce satisfies the target
    pub fn mine(
        transactions: Vec<Transaction>,
        prev_block_hash: Vec<u8>,
        pow: &ProofOfWork,
    ) -> Result<Self, BlockError> {
        let timestamp = Utc::now().timestamp();
        let tx_digest = hash_transactions(&transactions);

        let (nonce, hash) = pow.run(&prev_block_hash, &tx_digest, timestamp)?;

        info!(
            "Mined block {} with nonce {} ({} transactions)",
            hex::encode(&hash),
            nonce,
            transactions.len()
        );

        Ok(Block {
            timestamp,
            transactions,
            prev_block_hash,
            hash,
            nonce,
        })
    }

    /// Mines the first block of a chain around a single coinbase transaction
    pub fn genesis(coinbase: Transaction, pow: &ProofOfWork) -> Result<Self, BlockError> {
        Self::mine(vec![coinbase], Vec::new(), pow)
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    pub fn prev_block_hash(&self) -> &[u8] {
        &self.prev_block_hash
    }

    pub fn hash(&self) -> &[u8] {
        &self.hash
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn is_genesis(&self) -> bool {
        self.prev_block_hash.is_empty()
    }

    /// Digest of the transaction ids in block order
    pub fn hash_transactions(&self) -> Vec<u8> {
        hash_transactions(&self.transactions)
    }

    /// Encodes the block with its canonical binary encoding
    pub fn serialize(&self) -> Result<Vec<u8>, BlockError> {
        bincode::serialize(self).map_err(|e| BlockError::Encoding(e.to_string()))
    }

    /// Decodes a block previously produced by [`Block::serialize`]
    pub fn deserialize(bytes: &[u8]) -> Result<Self, BlockError> {
        bincode::deserialize(bytes).map_err(|e| BlockError::Decoding(e.to_string()))
    }
}

/// SHA-256 over the concatenation of each transaction id, in list order.
/// A flat hash, so reordering transactions changes the digest.
pub fn hash_transactions(transactions: &[Transaction]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    for transaction in transactions {
        hasher.update(&transaction.id);
    }
    hasher.finalize().to_vec()
}
