use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};

use log::{info, warn};
use thiserror::Error;

use super::block::{Block, BlockError};
use super::crypto::{Address, CryptoError, Wallet};
use super::pow::{block_digest, ProofOfWork, ProofOfWorkError, DEFAULT_DIFFICULTY_BITS};
use super::storage::{BlockchainStorage, StorageError};
use super::transaction::{Transaction, TransactionError, SUBSIDY};

/// Payload carried by the genesis coinbase input
pub const GENESIS_COINBASE_DATA: &str =
    "The Times 03/Jan/2009 Chancellor on brink of second bailout for banks";

/// Errors that can occur during blockchain operations
#[derive(Debug, Error)]
pub enum BlockchainError {
    #[error("Blockchain already exists")]
    AlreadyExists,

    #[error("No existing blockchain found. Create one first.")]
    NotFound,

    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),

    #[error("Transaction error: {0}")]
    TransactionError(#[from] TransactionError),

    #[error("Block error: {0}")]
    BlockError(#[from] BlockError),

    #[error("Proof of work error: {0}")]
    ProofOfWorkError(#[from] ProofOfWorkError),

    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),

    #[error("Crypto error: {0}")]
    CryptoError(#[from] CryptoError),
}

/// Tunables for mining and minting
#[derive(Debug, Clone)]
pub struct ChainConfig {
    /// Leading zero bits required in a block hash
    pub difficulty_bits: u32,

    /// Upper bound of the nonce search
    pub max_nonce: u64,

    /// Worker threads used by the nonce search
    pub mining_threads: usize,

    /// Value minted by the genesis coinbase
    pub subsidy: u64,
}

impl Default for ChainConfig {
    fn default() -> Self {
        ChainConfig {
            difficulty_bits: DEFAULT_DIFFICULTY_BITS,
            max_nonce: u64::MAX,
            mining_threads: 1,
            subsidy: SUBSIDY,
        }
    }
}

impl ChainConfig {
    pub fn proof_of_work(&self) -> Result<ProofOfWork, ProofOfWorkError> {
        Ok(ProofOfWork::new(self.difficulty_bits)?
            .with_max_nonce(self.max_nonce)
            .with_threads(self.mining_threads))
    }
}

/// Append-only chain of blocks over a persistent store
///
/// The tip lock is held for the whole read-tip/mine/write sequence, so
/// appends through one instance never interleave.
#[derive(Debug)]
pub struct Blockchain {
    /// Hash of the last appended block
    tip: Mutex<Vec<u8>>,

    /// Storage for blockchain data
    storage: BlockchainStorage,

    /// Proof of work parameters
    pow: ProofOfWork,

    config: ChainConfig,
}

impl Blockchain {
    /// Creates a new chain whose genesis coinbase pays `address`
    ///
    /// # Returns
    ///
    /// `AlreadyExists` if the store already holds a chain
    pub fn create(
        storage: BlockchainStorage,
        address: &Address,
        config: ChainConfig,
    ) -> Result<Self, BlockchainError> {
        if storage.is_initialized()? {
            return Err(BlockchainError::AlreadyExists);
        }

        let pow = config.proof_of_work()?;
        let coinbase = Transaction::new_coinbase(address, GENESIS_COINBASE_DATA, config.subsidy)?;
        let genesis = Block::genesis(coinbase, &pow)?;
        storage.write_genesis(&genesis, config.difficulty_bits)?;

        info!("Created blockchain with genesis block {}", hex::encode(genesis.hash()));

        Ok(Blockchain {
            tip: Mutex::new(genesis.hash().to_vec()),
            storage,
            pow,
            config,
        })
    }

    /// Opens an existing chain
    ///
    /// The difficulty recorded at creation overrides `config.difficulty_bits`.
    ///
    /// # Returns
    ///
    /// `NotFound` if the store holds no chain
    pub fn open(storage: BlockchainStorage, mut config: ChainConfig) -> Result<Self, BlockchainError> {
        let tip = storage.tip()?.ok_or(BlockchainError::NotFound)?;

        if let Some(stored_bits) = storage.difficulty_bits()? {
            if stored_bits != config.difficulty_bits {
                warn!(
                    "Configured difficulty {} differs from the chain's {}; using {}",
                    config.difficulty_bits, stored_bits, stored_bits
                );
                config.difficulty_bits = stored_bits;
            }
        }
        let pow = config.proof_of_work()?;

        info!("Opened blockchain at tip {}", hex::encode(&tip));

        Ok(Blockchain {
            tip: Mutex::new(tip),
            storage,
            pow,
            config,
        })
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    pub fn proof_of_work(&self) -> &ProofOfWork {
        &self.pow
    }

    /// Hash of the last appended block
    pub fn tip(&self) -> Vec<u8> {
        self.tip.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Mines `transactions` into a new block and appends it
    ///
    /// Under the tip lock, every transaction is verified against the current
    /// tip and its inputs must reference outputs that are unspent both in the
    /// chain and within `transactions`. Nothing is mined or written if one
    /// of them fails.
    pub fn mine_block(&self, transactions: Vec<Transaction>) -> Result<Block, BlockchainError> {
        let mut tip = self.tip.lock().unwrap_or_else(PoisonError::into_inner);
        let last_hash = tip.clone();

        let mut spent = self.spent_outputs_from(&last_hash)?;
        for transaction in &transactions {
            if !self.verify_transaction_from(&last_hash, transaction)? {
                warn!("Rejected transaction {}", transaction.id_hex());
                return Err(BlockchainError::InvalidTransaction(transaction.id_hex()));
            }
            if let Some(outpoint) = Self::claim_outputs(transaction, &mut spent) {
                warn!(
                    "Rejected transaction {}: output {} already spent",
                    transaction.id_hex(),
                    outpoint
                );
                return Err(BlockchainError::InvalidTransaction(format!(
                    "{} spends {} twice",
                    transaction.id_hex(),
                    outpoint
                )));
            }
        }

        let block = Block::mine(transactions, last_hash, &self.pow)?;
        self.storage.append_block(&block)?;
        *tip = block.hash().to_vec();

        info!("Appended block {}", hex::encode(block.hash()));
        Ok(block)
    }

    /// Walks the chain from the tip back to genesis
    ///
    /// The iterator is single-pass; call `iter` again to walk a second time.
    pub fn iter(&self) -> BlockchainIterator<'_> {
        self.blocks_from(self.tip())
    }

    /// Walks back from the block with hash `tip`
    pub(super) fn blocks_from(&self, tip: Vec<u8>) -> BlockchainIterator<'_> {
        BlockchainIterator {
            current_hash: Some(tip),
            storage: &self.storage,
        }
    }

    /// Number of blocks in the chain, genesis included
    pub fn height(&self) -> Result<usize, BlockchainError> {
        let mut height = 0;
        for block in self.iter() {
            block?;
            height += 1;
        }
        Ok(height)
    }

    /// Finds a transaction by id anywhere in the chain
    pub fn find_transaction(&self, id: &[u8]) -> Result<Transaction, BlockchainError> {
        self.find_transaction_from(&self.tip(), id)
    }

    fn find_transaction_from(&self, tip: &[u8], id: &[u8]) -> Result<Transaction, BlockchainError> {
        for block in self.blocks_from(tip.to_vec()) {
            if let Some(transaction) = block?.transactions().iter().find(|tx| tx.id == id) {
                return Ok(transaction.clone());
            }
        }

        Err(TransactionError::ReferenceNotFound(hex::encode(id)).into())
    }

    /// Transactions referenced by the inputs of `transaction`, keyed by hex id
    fn referenced_transactions(
        &self,
        tip: &[u8],
        transaction: &Transaction,
    ) -> Result<HashMap<String, Transaction>, BlockchainError> {
        let mut prev_txs = HashMap::new();
        if transaction.is_coinbase() {
            return Ok(prev_txs);
        }

        for input in &transaction.inputs {
            let key = hex::encode(&input.txid);
            if !prev_txs.contains_key(&key) {
                let prev_tx = self.find_transaction_from(tip, &input.txid)?;
                prev_txs.insert(key, prev_tx);
            }
        }

        Ok(prev_txs)
    }

    /// Signs `transaction` with `wallet`, resolving referenced transactions from the chain
    pub fn sign_transaction(
        &self,
        transaction: &mut Transaction,
        wallet: &Wallet,
    ) -> Result<(), BlockchainError> {
        let prev_txs = self.referenced_transactions(&self.tip(), transaction)?;
        transaction.sign(wallet, &prev_txs)?;
        Ok(())
    }

    /// Verifies `transaction` against the transactions it references in the chain
    pub fn verify_transaction(&self, transaction: &Transaction) -> Result<bool, BlockchainError> {
        self.verify_transaction_from(&self.tip(), transaction)
    }

    fn verify_transaction_from(
        &self,
        tip: &[u8],
        transaction: &Transaction,
    ) -> Result<bool, BlockchainError> {
        if transaction.is_coinbase() {
            return Ok(true);
        }

        let prev_txs = self.referenced_transactions(tip, transaction)?;
        Ok(transaction.verify(&prev_txs)?)
    }

    /// Marks every output spent by `transaction` in `spent`. Returns the
    /// first `txid:index` that was already marked, leaving `spent` partially
    /// updated in that case.
    fn claim_outputs(
        transaction: &Transaction,
        spent: &mut HashMap<Vec<u8>, HashSet<usize>>,
    ) -> Option<String> {
        if transaction.is_coinbase() {
            return None;
        }

        for input in &transaction.inputs {
            let Ok(index) = usize::try_from(input.output_index) else {
                continue;
            };
            if !spent.entry(input.txid.clone()).or_default().insert(index) {
                return Some(format!("{}:{}", hex::encode(&input.txid), index));
            }
        }
        None
    }

    /// Checks every block's proof of work, stored hash and back-link
    pub fn is_valid(&self) -> Result<bool, BlockchainError> {
        let mut expected_hash = Some(self.tip());

        for block in self.iter() {
            let block = block?;

            if expected_hash.as_deref() != Some(block.hash()) {
                warn!("Broken link at block {}", hex::encode(block.hash()));
                return Ok(false);
            }

            let digest = block_digest(
                block.prev_block_hash(),
                &block.hash_transactions(),
                block.timestamp(),
                block.nonce(),
            );
            if digest != block.hash() || !self.pow.validate(&block) {
                warn!("Invalid proof of work in block {}", hex::encode(block.hash()));
                return Ok(false);
            }

            expected_hash = Some(block.prev_block_hash().to_vec());
        }

        Ok(true)
    }
}

/// Backward iterator over a chain, tip first
///
/// Yields the genesis block last. A storage failure is yielded once and ends
/// the iteration.
pub struct BlockchainIterator<'a> {
    current_hash: Option<Vec<u8>>,
    storage: &'a BlockchainStorage,
}

impl<'a> Iterator for BlockchainIterator<'a> {
    type Item = Result<Block, BlockchainError>;

    fn next(&mut self) -> Option<Self::Item> {
        let hash = self.current_hash.take()?;

        match self.storage.get_block(&hash) {
            Ok(block) => {
                if !block.is_genesis() {
                    self.current_hash = Some(block.prev_block_hash().to_vec());
                }
                Some(Ok(block))
            }
            Err(err) => Some(Err(err.into())),
        }
    }
}
