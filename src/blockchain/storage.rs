use std::path::Path;

use log::debug;
use sled::{Batch, Db, Tree};
use thiserror::Error;

use super::block::{Block, BlockError};

/// Name of the tree holding serialized blocks and the tip pointer
const BLOCKS_TREE: &str = "blocks";

/// Reserved key holding the hash of the last appended block
const TIP_KEY: &[u8] = b"l";

/// Reserved key holding the difficulty the chain was created with (u32 BE)
const DIFFICULTY_KEY: &[u8] = b"difficulty";

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Item not found: {0}")]
    NotFound(String),
}

impl From<BlockError> for StorageError {
    fn from(err: BlockError) -> Self {
        match err {
            BlockError::Decoding(msg) => StorageError::DeserializationError(msg),
            other => StorageError::SerializationError(other.to_string()),
        }
    }
}

/// Persistent block store: block hash -> serialized block, plus the tip key
pub struct BlockchainStorage {
    /// The database instance
    db: Db,

    /// Tree for blocks and the tip pointer
    blocks: Tree,
}

impl std::fmt::Debug for BlockchainStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockchainStorage").finish()
    }
}

impl BlockchainStorage {
    /// Opens (or creates) the database at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        Self::from_db(sled::open(path)?)
    }

    /// Opens a database that is removed when dropped
    pub fn temporary() -> Result<Self, StorageError> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: Db) -> Result<Self, StorageError> {
        let blocks = db.open_tree(BLOCKS_TREE)?;
        Ok(Self { db, blocks })
    }

    /// Hash of the last appended block, if the chain has been created
    pub fn tip(&self) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.blocks.get(TIP_KEY)?.map(|value| value.to_vec()))
    }

    pub fn is_initialized(&self) -> Result<bool, StorageError> {
        Ok(self.blocks.contains_key(TIP_KEY)?)
    }

    /// Gets a block by its hash
    pub fn get_block(&self, hash: &[u8]) -> Result<Block, StorageError> {
        match self.blocks.get(hash)? {
            Some(value) => Ok(Block::deserialize(&value)?),
            None => Err(StorageError::NotFound(format!(
                "Block with hash {} not found",
                hex::encode(hash)
            ))),
        }
    }

    /// Difficulty recorded when the chain was created, if any
    pub fn difficulty_bits(&self) -> Result<Option<u32>, StorageError> {
        match self.blocks.get(DIFFICULTY_KEY)? {
            Some(value) => {
                let bytes = <[u8; 4]>::try_from(&value[..]).map_err(|_| {
                    StorageError::DeserializationError(format!(
                        "difficulty entry has {} bytes",
                        value.len()
                    ))
                })?;
                Ok(Some(u32::from_be_bytes(bytes)))
            }
            None => Ok(None),
        }
    }

    /// Writes the genesis block, the tip and the chain difficulty in one
    /// atomic batch, then flushes to disk
    pub fn write_genesis(&self, genesis: &Block, difficulty_bits: u32) -> Result<(), StorageError> {
        let mut batch = Self::block_batch(genesis)?;
        batch.insert(DIFFICULTY_KEY, &difficulty_bits.to_be_bytes()[..]);
        self.commit(batch, genesis)
    }

    /// Writes `block` under its hash and moves the tip to it in one atomic
    /// batch, then flushes to disk
    pub fn append_block(&self, block: &Block) -> Result<(), StorageError> {
        let batch = Self::block_batch(block)?;
        self.commit(batch, block)
    }

    fn block_batch(block: &Block) -> Result<Batch, StorageError> {
        let mut batch = Batch::default();
        batch.insert(block.hash(), block.serialize()?);
        batch.insert(TIP_KEY, block.hash());
        Ok(batch)
    }

    fn commit(&self, batch: Batch, block: &Block) -> Result<(), StorageError> {
        self.blocks.apply_batch(batch)?;

        self.flush()?;
        debug!("Stored block {} and moved tip", hex::encode(block.hash()));

        Ok(())
    }

    /// Flushes all pending writes to disk
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::crypto::Wallet;
    use crate::blockchain::pow::ProofOfWork;
    use crate::blockchain::transaction::Transaction;

    fn mined_block(prev: Vec<u8>) -> Block {
        let wallet = Wallet::new();
        let coinbase = Transaction::new_coinbase(wallet.address(), "", 10).unwrap();
        Block::mine(vec![coinbase], prev, &ProofOfWork::new(8).unwrap()).unwrap()
    }

    #[test]
    fn test_empty_storage() {
        let storage = BlockchainStorage::temporary().unwrap();

        assert!(!storage.is_initialized().unwrap());
        assert!(storage.tip().unwrap().is_none());
        assert!(matches!(
            storage.get_block(&[0; 32]),
            Err(StorageError::NotFound(_))
        ));
    }

    #[test]
    fn test_append_block_moves_tip() {
        let storage = BlockchainStorage::temporary().unwrap();
        let genesis = mined_block(Vec::new());
        storage.append_block(&genesis).unwrap();

        assert!(storage.is_initialized().unwrap());
        assert_eq!(storage.tip().unwrap().unwrap(), genesis.hash());

        let next = mined_block(genesis.hash().to_vec());
        storage.append_block(&next).unwrap();

        assert_eq!(storage.tip().unwrap().unwrap(), next.hash());
        assert_eq!(storage.get_block(genesis.hash()).unwrap(), genesis);
        assert_eq!(storage.get_block(next.hash()).unwrap(), next);
    }

    #[test]
    fn test_reopen_persists_blocks() {
        let dir = tempfile::TempDir::new().unwrap();
        let genesis = mined_block(Vec::new());

        {
            let storage = BlockchainStorage::open(dir.path()).unwrap();
            storage.append_block(&genesis).unwrap();
        }

        let storage = BlockchainStorage::open(dir.path()).unwrap();
        assert_eq!(storage.tip().unwrap().unwrap(), genesis.hash());
        assert_eq!(storage.get_block(genesis.hash()).unwrap().nonce(), genesis.nonce());
    }

    #[test]
    fn test_genesis_records_difficulty() {
        let dir = tempfile::TempDir::new().unwrap();
        let genesis = mined_block(Vec::new());

        {
            let storage = BlockchainStorage::open(dir.path()).unwrap();
            assert!(storage.difficulty_bits().unwrap().is_none());
            storage.write_genesis(&genesis, 8).unwrap();
        }

        let storage = BlockchainStorage::open(dir.path()).unwrap();
        assert_eq!(storage.difficulty_bits().unwrap(), Some(8));
        assert_eq!(storage.tip().unwrap().unwrap(), genesis.hash());

        let next = mined_block(genesis.hash().to_vec());
        storage.append_block(&next).unwrap();
        assert_eq!(storage.difficulty_bits().unwrap(), Some(8));
    }

    #[test]
    fn test_corrupt_block_bytes() {
        let storage = BlockchainStorage::temporary().unwrap();
        storage.blocks.insert(&b"bad"[..], vec![0xff, 0x01]).unwrap();

        assert!(matches!(
            storage.get_block(b"bad"),
            Err(StorageError::DeserializationError(_))
        ));
    }
}
