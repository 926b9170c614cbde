use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::info;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::crypto::{Address, CryptoError, Wallet};

/// Current wallet file format version
const WALLET_FILE_VERSION: u32 = 1;

/// Errors that can occur while loading or saving wallets
#[derive(Debug, Error)]
pub enum WalletError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt wallet file: {0}")]
    Corrupt(String),

    #[error("Unsupported wallet file version: {0}")]
    UnsupportedVersion(u32),

    #[error("Wallet not found for address {0}")]
    NotFound(String),

    #[error("Crypto error: {0}")]
    CryptoError(#[from] CryptoError),
}

/// On-disk layout: address -> secret key bytes
#[derive(Serialize, Deserialize)]
struct WalletFile {
    version: u32,
    keys: BTreeMap<String, Vec<u8>>,
}

/// Collection of wallets persisted to a single file
#[derive(Debug)]
pub struct Wallets {
    path: PathBuf,
    wallets: BTreeMap<Address, Wallet>,
}

impl Wallets {
    /// Loads the wallets stored at `path`; a missing file yields an empty collection
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, WalletError> {
        let path = path.as_ref().to_path_buf();
        let mut wallets = BTreeMap::new();

        if path.exists() {
            let bytes = fs::read(&path).map_err(|source| WalletError::Io {
                path: path.clone(),
                source,
            })?;
            let file: WalletFile =
                bincode::deserialize(&bytes).map_err(|e| WalletError::Corrupt(e.to_string()))?;
            if file.version != WALLET_FILE_VERSION {
                return Err(WalletError::UnsupportedVersion(file.version));
            }

            for (address, secret_key) in file.keys {
                let wallet = Wallet::from_secret_key(&secret_key)?;
                if wallet.address().0 != address {
                    return Err(WalletError::Corrupt(format!(
                        "key stored under {} belongs to {}",
                        address,
                        wallet.address()
                    )));
                }
                wallets.insert(wallet.address().clone(), wallet);
            }
        }

        Ok(Wallets { path, wallets })
    }

    /// Generates a new wallet and returns its address. Call [`Wallets::save`] to persist it.
    pub fn create_wallet(&mut self) -> Address {
        let wallet = Wallet::new();
        let address = wallet.address().clone();
        self.wallets.insert(address.clone(), wallet);
        address
    }

    pub fn get(&self, address: &Address) -> Result<&Wallet, WalletError> {
        self.wallets
            .get(address)
            .ok_or_else(|| WalletError::NotFound(address.to_string()))
    }

    /// Known addresses in sorted order
    pub fn addresses(&self) -> Vec<Address> {
        self.wallets.keys().cloned().collect()
    }

    /// Writes every wallet to the wallet file, creating parent directories
    pub fn save(&self) -> Result<(), WalletError> {
        let io_error = |source: std::io::Error| WalletError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(io_error)?;
            }
        }

        let file = WalletFile {
            version: WALLET_FILE_VERSION,
            keys: self
                .wallets
                .iter()
                .map(|(address, wallet)| (address.0.clone(), wallet.export_secret_key()))
                .collect(),
        };
        let bytes = bincode::serialize(&file).map_err(|e| WalletError::Corrupt(e.to_string()))?;
        fs::write(&self.path, bytes).map_err(io_error)?;

        info!("Saved {} wallets to {}", self.wallets.len(), self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let wallets = Wallets::load(temp_dir.path().join("wallet.dat")).unwrap();
        assert!(wallets.addresses().is_empty());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let wallet_path = temp_dir.path().join("nested").join("wallet.dat");

        let mut wallets = Wallets::load(&wallet_path).unwrap();
        let first = wallets.create_wallet();
        let second = wallets.create_wallet();
        wallets.save().unwrap();

        let loaded = Wallets::load(&wallet_path).unwrap();
        let mut expected = vec![first.clone(), second];
        expected.sort();
        assert_eq!(loaded.addresses(), expected);
        assert_eq!(
            loaded.get(&first).unwrap().export_secret_key(),
            wallets.get(&first).unwrap().export_secret_key()
        );
    }

    #[test]
    fn test_unknown_address() {
        let temp_dir = TempDir::new().unwrap();
        let wallets = Wallets::load(temp_dir.path().join("wallet.dat")).unwrap();
        let stranger = Wallet::new();

        assert!(matches!(
            wallets.get(stranger.address()),
            Err(WalletError::NotFound(_))
        ));
    }

    #[test]
    fn test_corrupt_file() {
        let temp_dir = TempDir::new().unwrap();
        let wallet_path = temp_dir.path().join("wallet.dat");
        fs::write(&wallet_path, b"garbage").unwrap();

        assert!(Wallets::load(&wallet_path).is_err());
    }
}
