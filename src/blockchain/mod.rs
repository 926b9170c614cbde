// Blockchain module
//
// This module contains the core ledger implementation including:
// - Block structure and proof of work
// - Chain store and backward iteration
// - UTXO transactions with per-input signatures
// - Unspent output derivation
// - Addresses, keys and the wallet file

pub mod block;
pub mod chain;
pub mod crypto;
pub mod pow;
pub mod storage;
pub mod transaction;
pub mod utxo;
pub mod wallets;

// Re-export main components for easier access
pub use block::Block;
pub use chain::{Blockchain, BlockchainError, ChainConfig};
pub use crypto::{Address, Wallet};
pub use storage::BlockchainStorage;
pub use transaction::{Transaction, TxInput, TxOutput};
pub use wallets::{WalletError, Wallets};
