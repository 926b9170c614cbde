use std::collections::HashMap;

use log::debug;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::chain::{Blockchain, BlockchainError};
use super::crypto::{hash_pub_key, verify_signature, Address, CryptoError, Wallet};

/// Default value minted by a coinbase transaction
pub const SUBSIDY: u64 = 10;

/// Output index carried by the single input of a coinbase transaction
pub const COINBASE_OUTPUT_INDEX: i64 = -1;

/// Errors that can occur during transaction operations
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: u64, available: u64 },

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Referenced transaction not found: {0}")]
    ReferenceNotFound(String),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Crypto error: {0}")]
    CryptoError(#[from] CryptoError),
}

/// A value chunk locked to the hash of a public key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    /// Value in atomic units
    pub value: u64,

    /// Hash of the public key allowed to spend this output
    pub pub_key_hash: Vec<u8>,
}

impl TxOutput {
    /// Creates an output of `value` locked to `address`
    pub fn new(value: u64, address: &Address) -> Result<Self, CryptoError> {
        Ok(TxOutput {
            value,
            pub_key_hash: address.pub_key_hash()?,
        })
    }

    pub fn is_locked_with_key(&self, pub_key_hash: &[u8]) -> bool {
        self.pub_key_hash == pub_key_hash
    }
}

/// A reference to one output of an earlier transaction plus its unlocking proof
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    /// Id of the transaction holding the spent output, empty for coinbase
    pub txid: Vec<u8>,

    /// Index of the spent output, -1 for coinbase
    pub output_index: i64,

    /// Signature over the per-input signing digest
    pub signature: Vec<u8>,

    /// Spender's public key; free-form data for coinbase
    pub pub_key: Vec<u8>,
}

impl TxInput {
    /// Checks whether this input was unlocked by the key hashing to `pub_key_hash`
    pub fn uses_key(&self, pub_key_hash: &[u8]) -> bool {
        hash_pub_key(&self.pub_key) == pub_key_hash
    }
}

/// Represents a transaction in the blockchain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Hash of the transaction's encoding with this field empty
    pub id: Vec<u8>,

    pub inputs: Vec<TxInput>,

    pub outputs: Vec<TxOutput>,
}

impl Transaction {
    /// Creates a coinbase transaction minting `subsidy` to `to`
    ///
    /// # Arguments
    ///
    /// * `to` - The address receiving the subsidy
    /// * `data` - Free-form payload; defaults to a reward note when empty
    /// * `subsidy` - The minted value
    pub fn new_coinbase(to: &Address, data: &str, subsidy: u64) -> Result<Self, TransactionError> {
        let data = if data.is_empty() {
            format!("Reward to '{}'", to)
        } else {
            data.to_string()
        };

        let input = TxInput {
            txid: Vec::new(),
            output_index: COINBASE_OUTPUT_INDEX,
            signature: Vec::new(),
            pub_key: data.into_bytes(),
        };
        let output = TxOutput::new(subsidy, to)?;

        let mut transaction = Transaction {
            id: Vec::new(),
            inputs: vec![input],
            outputs: vec![output],
        };
        transaction.set_id()?;

        Ok(transaction)
    }

    /// Builds and signs a transfer of `amount` from `from` to `to`
    ///
    /// Spendable outputs of `from` are selected from the chain; any value left
    /// over comes back to `from` as a change output.
    pub fn new_transfer(
        from: &Wallet,
        to: &Address,
        amount: u64,
        chain: &Blockchain,
    ) -> Result<Self, BlockchainError> {
        if amount == 0 {
            return Err(TransactionError::InvalidAmount("Amount must be positive: 0".to_string()).into());
        }
        let recipient = TxOutput::new(amount, to).map_err(TransactionError::from)?;

        let (accumulated, selected) = chain.find_spendable_outputs(from.address(), amount)?;
        if accumulated < amount {
            return Err(TransactionError::InsufficientFunds {
                required: amount,
                available: accumulated,
            }
            .into());
        }

        let mut inputs = Vec::new();
        for (txid, output_indices) in &selected {
            let txid = hex::decode(txid).map_err(|e| TransactionError::Encoding(e.to_string()))?;
            for &index in output_indices {
                inputs.push(TxInput {
                    txid: txid.clone(),
                    output_index: index as i64,
                    signature: Vec::new(),
                    pub_key: from.public_key_bytes(),
                });
            }
        }

        let mut outputs = vec![recipient];
        if accumulated > amount {
            outputs.push(TxOutput::new(accumulated - amount, from.address()).map_err(TransactionError::from)?);
        }

        let mut transaction = Transaction {
            id: Vec::new(),
            inputs,
            outputs,
        };
        transaction.set_id()?;
        chain.sign_transaction(&mut transaction, from)?;

        debug!(
            "Built transfer {} of {} from {} to {} ({} inputs)",
            transaction.id_hex(),
            amount,
            from.address(),
            to,
            transaction.inputs.len()
        );

        Ok(transaction)
    }

    /// Checks if the transaction is a coinbase transaction
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1
            && self.inputs[0].txid.is_empty()
            && self.inputs[0].output_index == COINBASE_OUTPUT_INDEX
    }

    pub fn id_hex(&self) -> String {
        hex::encode(&self.id)
    }

    /// SHA-256 of the canonical encoding with the id field emptied
    pub fn hash(&self) -> Result<Vec<u8>, TransactionError> {
        let mut copy = self.clone();
        copy.id = Vec::new();

        let encoded = bincode::serialize(&copy).map_err(|e| TransactionError::Encoding(e.to_string()))?;
        Ok(Sha256::digest(encoded).to_vec())
    }

    fn set_id(&mut self) -> Result<(), TransactionError> {
        self.id = self.hash()?;
        Ok(())
    }

    /// Copy with every input's signature and public key blanked
    pub fn trimmed_copy(&self) -> Transaction {
        let inputs = self
            .inputs
            .iter()
            .map(|input| TxInput {
                txid: input.txid.clone(),
                output_index: input.output_index,
                signature: Vec::new(),
                pub_key: Vec::new(),
            })
            .collect();

        Transaction {
            id: self.id.clone(),
            inputs,
            outputs: self.outputs.clone(),
        }
    }

    /// Output referenced by `input`, looked up in `prev_txs`
    fn referenced_output<'a>(
        input: &TxInput,
        prev_txs: &'a HashMap<String, Transaction>,
    ) -> Result<&'a TxOutput, TransactionError> {
        let txid = hex::encode(&input.txid);
        let prev_tx = prev_txs
            .get(&txid)
            .ok_or_else(|| TransactionError::ReferenceNotFound(txid.clone()))?;

        usize::try_from(input.output_index)
            .ok()
            .and_then(|index| prev_tx.outputs.get(index))
            .ok_or_else(|| TransactionError::ReferenceNotFound(format!("{}:{}", txid, input.output_index)))
    }

    /// Digest signed by input `index`: a fresh trimmed copy in which only that
    /// input's key field holds the locking hash of the output it spends
    fn signing_digest(
        &self,
        index: usize,
        prev_txs: &HashMap<String, Transaction>,
    ) -> Result<Vec<u8>, TransactionError> {
        let referenced = Self::referenced_output(&self.inputs[index], prev_txs)?;

        let mut copy = self.trimmed_copy();
        copy.inputs[index].pub_key = referenced.pub_key_hash.clone();
        copy.hash()
    }

    /// Signs every input with `wallet`'s key. Coinbase transactions are left untouched.
    ///
    /// Fails with `ReferenceNotFound` before signing anything if an input
    /// references a transaction missing from `prev_txs`.
    pub fn sign(
        &mut self,
        wallet: &Wallet,
        prev_txs: &HashMap<String, Transaction>,
    ) -> Result<(), TransactionError> {
        if self.is_coinbase() {
            return Ok(());
        }

        for input in &self.inputs {
            Self::referenced_output(input, prev_txs)?;
        }

        for index in 0..self.inputs.len() {
            let digest = self.signing_digest(index, prev_txs)?;
            self.inputs[index].signature = wallet.sign(&digest);
        }

        Ok(())
    }

    /// Per-input verdicts: signature valid under the input's public key, and
    /// that key hashes to the locking hash of the referenced output
    pub fn verify_inputs(
        &self,
        prev_txs: &HashMap<String, Transaction>,
    ) -> Result<Vec<bool>, TransactionError> {
        let mut verdicts = Vec::with_capacity(self.inputs.len());

        for (index, input) in self.inputs.iter().enumerate() {
            let referenced = Self::referenced_output(input, prev_txs)?;
            let digest = self.signing_digest(index, prev_txs)?;

            let key_matches = input.uses_key(&referenced.pub_key_hash);
            let signature_valid = verify_signature(&digest, &input.signature, &input.pub_key);
            verdicts.push(key_matches && signature_valid);
        }

        Ok(verdicts)
    }

    /// Verifies all inputs and the value balance. Coinbase transactions verify trivially.
    pub fn verify(&self, prev_txs: &HashMap<String, Transaction>) -> Result<bool, TransactionError> {
        if self.is_coinbase() {
            return Ok(true);
        }

        if !self.verify_inputs(prev_txs)?.into_iter().all(|valid| valid) {
            return Ok(false);
        }

        let mut input_total: u64 = 0;
        for input in &self.inputs {
            input_total = input_total.saturating_add(Self::referenced_output(input, prev_txs)?.value);
        }
        let output_total = self
            .outputs
            .iter()
            .fold(0u64, |sum, output| sum.saturating_add(output.value));

        Ok(output_total <= input_total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prev_map(transactions: &[&Transaction]) -> HashMap<String, Transaction> {
        transactions
            .iter()
            .map(|tx| (tx.id_hex(), (*tx).clone()))
            .collect()
    }

    /// A signed transaction spending two coinbase outputs owned by `owner`
    fn two_input_spend(owner: &Wallet, to: &Address) -> (Transaction, HashMap<String, Transaction>) {
        let first = Transaction::new_coinbase(owner.address(), "first", 10).unwrap();
        let second = Transaction::new_coinbase(owner.address(), "second", 10).unwrap();

        let inputs = [&first, &second]
            .iter()
            .map(|prev| TxInput {
                txid: prev.id.clone(),
                output_index: 0,
                signature: Vec::new(),
                pub_key: owner.public_key_bytes(),
            })
            .collect();
        let mut transaction = Transaction {
            id: Vec::new(),
            inputs,
            outputs: vec![TxOutput::new(15, to).unwrap(), TxOutput::new(5, owner.address()).unwrap()],
        };
        transaction.set_id().unwrap();

        let prev_txs = prev_map(&[&first, &second]);
        transaction.sign(owner, &prev_txs).unwrap();
        (transaction, prev_txs)
    }

    #[test]
    fn test_coinbase_transaction() {
        let wallet = Wallet::new();
        let transaction = Transaction::new_coinbase(wallet.address(), "", SUBSIDY).unwrap();

        assert!(transaction.is_coinbase());
        assert_eq!(transaction.inputs[0].output_index, COINBASE_OUTPUT_INDEX);
        assert!(transaction.inputs[0].txid.is_empty());
        assert_eq!(
            transaction.inputs[0].pub_key,
            format!("Reward to '{}'", wallet.address()).into_bytes()
        );
        assert_eq!(transaction.outputs[0].value, SUBSIDY);
        assert!(transaction.outputs[0].is_locked_with_key(&wallet.pub_key_hash()));
        assert_eq!(transaction.id, transaction.hash().unwrap());
    }

    #[test]
    fn test_coinbase_sign_and_verify_are_trivial() {
        let wallet = Wallet::new();
        let mut transaction = Transaction::new_coinbase(wallet.address(), "data", SUBSIDY).unwrap();
        let before = transaction.clone();

        transaction.sign(&wallet, &HashMap::new()).unwrap();
        assert_eq!(transaction, before);
        assert!(transaction.verify(&HashMap::new()).unwrap());
    }

    #[test]
    fn test_sign_and_verify() {
        let owner = Wallet::new();
        let recipient = Wallet::new();
        let (transaction, prev_txs) = two_input_spend(&owner, recipient.address());

        assert!(transaction.inputs.iter().all(|input| !input.signature.is_empty()));
        assert_eq!(transaction.verify_inputs(&prev_txs).unwrap(), vec![true, true]);
        assert!(transaction.verify(&prev_txs).unwrap());
    }

    #[test]
    fn test_flipped_signature_byte_fails_only_that_input() {
        let owner = Wallet::new();
        let recipient = Wallet::new();
        let (mut transaction, prev_txs) = two_input_spend(&owner, recipient.address());

        transaction.inputs[1].signature[0] ^= 0x01;

        assert_eq!(transaction.verify_inputs(&prev_txs).unwrap(), vec![true, false]);
        assert!(!transaction.verify(&prev_txs).unwrap());
    }

    #[test]
    fn test_flipped_public_key_byte_fails_only_that_input() {
        let owner = Wallet::new();
        let recipient = Wallet::new();
        let (mut transaction, prev_txs) = two_input_spend(&owner, recipient.address());

        transaction.inputs[0].pub_key[3] ^= 0x80;

        assert_eq!(transaction.verify_inputs(&prev_txs).unwrap(), vec![false, true]);
        assert!(!transaction.verify(&prev_txs).unwrap());
    }

    #[test]
    fn test_wrong_signer_fails_verification() {
        let owner = Wallet::new();
        let thief = Wallet::new();
        let (mut transaction, prev_txs) = two_input_spend(&owner, thief.address());

        // The thief re-signs with their own key: signatures verify, key hashes do not match
        for input in transaction.inputs.iter_mut() {
            input.pub_key = thief.public_key_bytes();
        }
        transaction.sign(&thief, &prev_txs).unwrap();

        assert_eq!(transaction.verify_inputs(&prev_txs).unwrap(), vec![false, false]);
    }

    #[test]
    fn test_tampered_output_fails_verification() {
        let owner = Wallet::new();
        let recipient = Wallet::new();
        let (mut transaction, prev_txs) = two_input_spend(&owner, recipient.address());

        transaction.outputs[0].value = 20;
        assert!(!transaction.verify(&prev_txs).unwrap());
    }

    #[test]
    fn test_overspend_fails_verification() {
        let owner = Wallet::new();
        let first = Transaction::new_coinbase(owner.address(), "only", 10).unwrap();
        let mut transaction = Transaction {
            id: Vec::new(),
            inputs: vec![TxInput {
                txid: first.id.clone(),
                output_index: 0,
                signature: Vec::new(),
                pub_key: owner.public_key_bytes(),
            }],
            outputs: vec![TxOutput::new(11, owner.address()).unwrap()],
        };
        transaction.set_id().unwrap();
        let prev_txs = prev_map(&[&first]);
        transaction.sign(&owner, &prev_txs).unwrap();

        assert_eq!(transaction.verify_inputs(&prev_txs).unwrap(), vec![true]);
        assert!(!transaction.verify(&prev_txs).unwrap());
    }

    #[test]
    fn test_sign_missing_reference() {
        let owner = Wallet::new();
        let recipient = Wallet::new();
        let (mut transaction, mut prev_txs) = two_input_spend(&owner, recipient.address());
        let missing = transaction.inputs[1].txid.clone();
        prev_txs.remove(&hex::encode(&missing));

        let result = transaction.sign(&owner, &prev_txs);
        assert!(matches!(result, Err(TransactionError::ReferenceNotFound(_))));

        let result = transaction.verify(&prev_txs);
        assert!(matches!(result, Err(TransactionError::ReferenceNotFound(_))));
    }

    #[test]
    fn test_signing_does_not_change_id() {
        let owner = Wallet::new();
        let recipient = Wallet::new();
        let (transaction, _) = two_input_spend(&owner, recipient.address());

        let unsigned = Transaction {
            id: Vec::new(),
            inputs: transaction
                .inputs
                .iter()
                .map(|input| TxInput {
                    signature: Vec::new(),
                    ..input.clone()
                })
                .collect(),
            outputs: transaction.outputs.clone(),
        };
        assert_eq!(transaction.id, unsigned.hash().unwrap());
    }
}
