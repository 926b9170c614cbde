use std::path::PathBuf;

use clap::Args;

use crate::blockchain::pow::DEFAULT_DIFFICULTY_BITS;
use crate::blockchain::storage::{BlockchainStorage, StorageError};
use crate::blockchain::transaction::SUBSIDY;
use crate::blockchain::{Blockchain, BlockchainError, ChainConfig, WalletError, Wallets};

pub const DEFAULT_DATA_DIR: &str = "data/blockchain";
pub const DEFAULT_WALLET_FILE: &str = "data/wallet.dat";

/// Settings shared by every subcommand; each can also come from the environment
#[derive(Debug, Clone, Args)]
pub struct ConfigArgs {
    /// Directory of the block database
    #[arg(long, global = true, env = "LEDGER_DATA_DIR", default_value = DEFAULT_DATA_DIR)]
    pub data_dir: PathBuf,

    /// Wallet file path
    #[arg(long, global = true, env = "LEDGER_WALLET_FILE", default_value = DEFAULT_WALLET_FILE)]
    pub wallet_file: PathBuf,

    /// Leading zero bits required in block hashes
    #[arg(long, global = true, env = "LEDGER_DIFFICULTY", default_value_t = DEFAULT_DIFFICULTY_BITS)]
    pub difficulty: u32,

    /// Threads used for the nonce search
    #[arg(long, global = true, env = "LEDGER_MINING_THREADS", default_value_t = 1)]
    pub mining_threads: usize,

    /// Value minted by the genesis coinbase
    #[arg(long, global = true, env = "LEDGER_SUBSIDY", default_value_t = SUBSIDY)]
    pub subsidy: u64,
}

/// Resolved node configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub data_dir: PathBuf,
    pub wallet_file: PathBuf,
    pub chain: ChainConfig,
}

impl From<ConfigArgs> for NodeConfig {
    fn from(args: ConfigArgs) -> Self {
        NodeConfig {
            data_dir: args.data_dir,
            wallet_file: args.wallet_file,
            chain: ChainConfig {
                difficulty_bits: args.difficulty,
                mining_threads: args.mining_threads,
                subsidy: args.subsidy,
                ..ChainConfig::default()
            },
        }
    }
}

impl NodeConfig {
    /// Opens the block database, creating its directory if needed
    pub fn open_storage(&self) -> Result<BlockchainStorage, StorageError> {
        BlockchainStorage::open(&self.data_dir)
    }

    /// Opens the existing chain stored under `data_dir`
    pub fn open_chain(&self) -> Result<Blockchain, BlockchainError> {
        Blockchain::open(self.open_storage()?, self.chain.clone())
    }

    pub fn load_wallets(&self) -> Result<Wallets, WalletError> {
        Wallets::load(&self.wallet_file)
    }
}
