use ethereum_types::U256;
use log::debug;
use rayon::prelude::*;
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::block::Block;

/// Default number of leading zero bits a block hash must carry
pub const DEFAULT_DIFFICULTY_BITS: u32 = 16;

/// Errors that can occur while searching for or checking a proof of work
#[derive(Debug, Error)]
pub enum ProofOfWorkError {
    #[error("Invalid difficulty: {0} bits (expected 1..=255)")]
    InvalidDifficulty(u32),

    #[error("Mining exhausted: no valid nonce in 0..={max_nonce}")]
    MiningExhausted { max_nonce: u64 },

    #[error("Failed to build mining thread pool: {0}")]
    ThreadPool(String),
}

/// Computes the candidate block hash for a given nonce:
/// SHA256(prev_hash || tx_digest || timestamp || nonce), integers big-endian
pub fn block_digest(prev_hash: &[u8], tx_digest: &[u8], timestamp: i64, nonce: u64) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash);
    hasher.update(tx_digest);
    hasher.update(timestamp.to_be_bytes());
    hasher.update(nonce.to_be_bytes());
    hasher.finalize().to_vec()
}

/// Proof-of-work puzzle parameters: a hash is accepted when, read as a
/// big-endian integer, it is strictly below `2^(256 - difficulty_bits)`.
#[derive(Debug, Clone)]
pub struct ProofOfWork {
    difficulty_bits: u32,
    target: U256,
    max_nonce: u64,
    threads: usize,
}

impl ProofOfWork {
    pub fn new(difficulty_bits: u32) -> Result<Self, ProofOfWorkError> {
        if difficulty_bits == 0 || difficulty_bits > 255 {
            return Err(ProofOfWorkError::InvalidDifficulty(difficulty_bits));
        }

        Ok(ProofOfWork {
            difficulty_bits,
            target: U256::one() << (256 - difficulty_bits as usize),
            max_nonce: u64::MAX,
            threads: 1,
        })
    }

    /// Bounds the nonce search to `0..=max_nonce`
    pub fn with_max_nonce(mut self, max_nonce: u64) -> Self {
        self.max_nonce = max_nonce;
        self
    }

    /// Splits the nonce search across `threads` workers; 0 and 1 are sequential
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    pub fn difficulty_bits(&self) -> u32 {
        self.difficulty_bits
    }

    pub fn target(&self) -> U256 {
        self.target
    }

    /// Checks a raw hash against the target. Hashes that are not 32 bytes never pass.
    pub fn meets_target(&self, hash: &[u8]) -> bool {
        if hash.len() != 32 {
            return false;
        }
        U256::from_big_endian(hash) < self.target
    }

    /// Searches nonces from 0 upward and returns the first accepted
    /// `(nonce, hash)`. With several threads any accepted nonce may win.
    pub fn run(
        &self,
        prev_hash: &[u8],
        tx_digest: &[u8],
        timestamp: i64,
    ) -> Result<(u64, Vec<u8>), ProofOfWorkError> {
        let found = if self.threads > 1 {
            self.run_parallel(prev_hash, tx_digest, timestamp)?
        } else {
            (0..=self.max_nonce).find_map(|nonce| self.try_nonce(prev_hash, tx_digest, timestamp, nonce))
        };

        match found {
            Some((nonce, hash)) => {
                debug!("Found nonce {} with hash {}", nonce, hex::encode(&hash));
                Ok((nonce, hash))
            }
            None => Err(ProofOfWorkError::MiningExhausted {
                max_nonce: self.max_nonce,
            }),
        }
    }

    fn run_parallel(
        &self,
        prev_hash: &[u8],
        tx_digest: &[u8],
        timestamp: i64,
    ) -> Result<Option<(u64, Vec<u8>)>, ProofOfWorkError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.threads)
            .build()
            .map_err(|e| ProofOfWorkError::ThreadPool(e.to_string()))?;

        Ok(pool.install(|| {
            (0..=self.max_nonce)
                .into_par_iter()
                .find_map_any(|nonce| self.try_nonce(prev_hash, tx_digest, timestamp, nonce))
        }))
    }

    fn try_nonce(
        &self,
        prev_hash: &[u8],
        tx_digest: &[u8],
        timestamp: i64,
        nonce: u64,
    ) -> Option<(u64, Vec<u8>)> {
        let hash = block_digest(prev_hash, tx_digest, timestamp, nonce);
        self.meets_target(&hash).then_some((nonce, hash))
    }

    /// Recomputes the block digest from its contents and checks it against the target
    pub fn validate(&self, block: &Block) -> bool {
        let hash = block_digest(
            block.prev_block_hash(),
            &block.hash_transactions(),
            block.timestamp(),
            block.nonce(),
        );
        self.meets_target(&hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_difficulty_bounds() {
        assert!(matches!(
            ProofOfWork::new(0),
            Err(ProofOfWorkError::InvalidDifficulty(0))
        ));
        assert!(ProofOfWork::new(256).is_err());
        assert!(ProofOfWork::new(1).is_ok());
        assert!(ProofOfWork::new(255).is_ok());
    }

    #[test]
    fn test_target_boundary() {
        let pow = ProofOfWork::new(8).unwrap();

        let mut below = [0xffu8; 32];
        below[0] = 0x00;
        assert!(pow.meets_target(&below));

        let mut at = [0u8; 32];
        at[0] = 0x01;
        assert!(!pow.meets_target(&at));

        assert!(!pow.meets_target(&[0u8; 31]));
    }

    #[test]
    fn test_run_finds_valid_nonce() {
        let pow = ProofOfWork::new(8).unwrap();
        let (nonce, hash) = pow.run(b"prev", b"txs", 1_700_000_000).unwrap();

        assert_eq!(hash[0], 0);
        assert_eq!(hash, block_digest(b"prev", b"txs", 1_700_000_000, nonce));
    }

    #[test]
    fn test_sequential_search_returns_lowest_nonce() {
        let pow = ProofOfWork::new(6).unwrap();
        let (nonce, _) = pow.run(b"", b"data", 42).unwrap();

        for earlier in 0..nonce {
            assert!(!pow.meets_target(&block_digest(b"", b"data", 42, earlier)));
        }
    }

    #[test]
    fn test_parallel_search_finds_valid_nonce() {
        let pow = ProofOfWork::new(10).unwrap().with_threads(4);
        let (nonce, hash) = pow.run(b"prev", b"txs", 7).unwrap();

        assert!(pow.meets_target(&hash));
        assert_eq!(hash, block_digest(b"prev", b"txs", 7, nonce));
    }

    #[test]
    fn test_mining_exhausted() {
        let pow = ProofOfWork::new(255).unwrap().with_max_nonce(100);
        let result = pow.run(b"prev", b"txs", 0);

        assert!(matches!(
            result,
            Err(ProofOfWorkError::MiningExhausted { max_nonce: 100 })
        ));

        let parallel = ProofOfWork::new(255).unwrap().with_max_nonce(100).with_threads(2);
        assert!(parallel.run(b"prev", b"txs", 0).is_err());
    }

    #[test]
    fn test_digest_is_deterministic() {
        let a = block_digest(b"prev", b"txs", 100, 5);
        let b = block_digest(b"prev", b"txs", 100, 5);
        let c = block_digest(b"prev", b"txs", 100, 6);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 32);
    }
}
