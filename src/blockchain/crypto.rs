use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use ripemd::Ripemd160;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use std::fmt;
use std::str::FromStr;

/// Version byte prefixed to every address payload
pub const ADDRESS_VERSION: u8 = 0x00;

/// Number of checksum bytes appended to an address payload
pub const ADDRESS_CHECKSUM_LEN: usize = 4;

/// Length of a public key hash (RIPEMD-160 output)
pub const PUB_KEY_HASH_LEN: usize = 20;

/// Errors that can occur during cryptographic operations
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Invalid private key: {0}")]
    InvalidPrivateKey(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Address checksum mismatch: {0}")]
    ChecksumMismatch(String),

    #[error("Decoding error: {0}")]
    DecodingError(String),
}

/// Hashes a public key into the 20-byte locking hash: RIPEMD160(SHA256(pub_key))
pub fn hash_pub_key(pub_key: &[u8]) -> Vec<u8> {
    let sha = Sha256::digest(pub_key);
    Ripemd160::digest(sha).to_vec()
}

/// First four bytes of a double SHA-256 of the payload
pub fn checksum(payload: &[u8]) -> Vec<u8> {
    let first = Sha256::digest(payload);
    let second = Sha256::digest(first);
    second[..ADDRESS_CHECKSUM_LEN].to_vec()
}

/// Represents a wallet address: base58(version || pub_key_hash || checksum)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address(pub String);

impl Address {
    /// Builds the address that locks outputs to the given public key hash
    pub fn from_pub_key_hash(pub_key_hash: &[u8]) -> Self {
        let mut payload = Vec::with_capacity(1 + pub_key_hash.len() + ADDRESS_CHECKSUM_LEN);
        payload.push(ADDRESS_VERSION);
        payload.extend_from_slice(pub_key_hash);
        let check = checksum(&payload);
        payload.extend_from_slice(&check);

        Address(bs58::encode(payload).into_string())
    }

    /// Creates a new address from a public key
    pub fn from_public_key(public_key: &VerifyingKey) -> Self {
        Self::from_pub_key_hash(&hash_pub_key(public_key.as_bytes()))
    }

    /// Decodes the address and returns the public key hash it carries
    ///
    /// Fails when the text is not base58, the payload has the wrong length or
    /// version, or the checksum does not match.
    pub fn pub_key_hash(&self) -> Result<Vec<u8>, CryptoError> {
        let payload = bs58::decode(&self.0)
            .into_vec()
            .map_err(|e| CryptoError::DecodingError(e.to_string()))?;

        if payload.len() != 1 + PUB_KEY_HASH_LEN + ADDRESS_CHECKSUM_LEN {
            return Err(CryptoError::InvalidAddress(format!(
                "{}: unexpected payload length {}",
                self.0,
                payload.len()
            )));
        }

        if payload[0] != ADDRESS_VERSION {
            return Err(CryptoError::InvalidAddress(format!(
                "{}: unknown version {:#04x}",
                self.0, payload[0]
            )));
        }

        let (versioned, actual_checksum) = payload.split_at(payload.len() - ADDRESS_CHECKSUM_LEN);
        if checksum(versioned) != actual_checksum {
            return Err(CryptoError::ChecksumMismatch(self.0.clone()));
        }

        Ok(versioned[1..].to_vec())
    }

    /// Checks the address without exposing why it is invalid
    pub fn is_valid(&self) -> bool {
        self.pub_key_hash().is_ok()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Address {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let address = Address(s.to_string());
        address.pub_key_hash()?;
        Ok(address)
    }
}

/// Represents a wallet with a keypair
#[derive(Debug, Clone)]
pub struct Wallet {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
    address: Address,
}

impl Wallet {
    /// Creates a new wallet with a random keypair
    pub fn new() -> Self {
        let mut csprng = OsRng;
        let signing_key = SigningKey::generate(&mut csprng);
        Self::from_signing_key(signing_key)
    }

    /// Creates a wallet from an existing secret key
    pub fn from_secret_key(secret_key_bytes: &[u8]) -> Result<Self, CryptoError> {
        let bytes_array: [u8; 32] = secret_key_bytes.try_into().map_err(|_| {
            CryptoError::InvalidPrivateKey("Invalid private key length".to_string())
        })?;

        Ok(Self::from_signing_key(SigningKey::from_bytes(&bytes_array)))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let verifying_key = signing_key.verifying_key();
        let address = Address::from_public_key(&verifying_key);

        Wallet {
            signing_key,
            verifying_key,
            address,
        }
    }

    /// Gets the wallet's address
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Raw public key bytes, as carried by a spending input
    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.verifying_key.to_bytes().to_vec()
    }

    /// Locking hash of this wallet's public key
    pub fn pub_key_hash(&self) -> Vec<u8> {
        hash_pub_key(self.verifying_key.as_bytes())
    }

    /// Signs a message with the wallet's private key
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing_key.sign(message).to_bytes().to_vec()
    }

    /// Exports the wallet's secret key as bytes
    pub fn export_secret_key(&self) -> Vec<u8> {
        self.signing_key.to_bytes().to_vec()
    }
}

impl Default for Wallet {
    fn default() -> Self {
        Self::new()
    }
}

/// Verifies a signature against a message and raw public key bytes
///
/// Malformed keys or signatures simply fail verification.
pub fn verify_signature(message: &[u8], signature: &[u8], public_key: &[u8]) -> bool {
    let Ok(key_bytes) = <[u8; 32]>::try_from(public_key) else {
        return false;
    };
    let Ok(public_key) = VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };
    let Ok(signature_bytes) = <[u8; 64]>::try_from(signature) else {
        return false;
    };
    let signature = Signature::from_bytes(&signature_bytes);

    public_key.verify(message, &signature).is_ok()
}
