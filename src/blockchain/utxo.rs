use std::collections::{BTreeMap, HashMap, HashSet};

use log::debug;

use super::chain::{Blockchain, BlockchainError};
use super::crypto::Address;
use super::transaction::{Transaction, TxOutput};

impl Blockchain {
    /// Single tip-to-genesis pass collecting, for every transaction with
    /// unspent outputs locked to `pub_key_hash`, the indices of those outputs.
    ///
    /// Spending inputs are always seen before the outputs they spend because
    /// the walk goes newest to oldest.
    fn unspent_outputs(
        &self,
        pub_key_hash: &[u8],
    ) -> Result<Vec<(Transaction, Vec<usize>)>, BlockchainError> {
        let mut unspent = Vec::new();
        let mut spent: HashMap<Vec<u8>, HashSet<usize>> = HashMap::new();

        for block in self.iter() {
            let block = block?;

            for transaction in block.transactions() {
                let spent_here = spent.get(&transaction.id);
                let indices: Vec<usize> = transaction
                    .outputs
                    .iter()
                    .enumerate()
                    .filter(|(index, _)| !spent_here.map_or(false, |set| set.contains(index)))
                    .filter(|(_, output)| output.is_locked_with_key(pub_key_hash))
                    .map(|(index, _)| index)
                    .collect();

                if !indices.is_empty() {
                    unspent.push((transaction.clone(), indices));
                }

                if !transaction.is_coinbase() {
                    for input in &transaction.inputs {
                        if let Ok(index) = usize::try_from(input.output_index) {
                            spent.entry(input.txid.clone()).or_default().insert(index);
                        }
                    }
                }
            }
        }

        Ok(unspent)
    }

    /// Every output spent by some input in the chain ending at `tip`, as
    /// output indices keyed by transaction id
    pub(super) fn spent_outputs_from(
        &self,
        tip: &[u8],
    ) -> Result<HashMap<Vec<u8>, HashSet<usize>>, BlockchainError> {
        let mut spent: HashMap<Vec<u8>, HashSet<usize>> = HashMap::new();

        for block in self.blocks_from(tip.to_vec()) {
            for transaction in block?.transactions() {
                if transaction.is_coinbase() {
                    continue;
                }
                for input in &transaction.inputs {
                    if let Ok(index) = usize::try_from(input.output_index) {
                        spent.entry(input.txid.clone()).or_default().insert(index);
                    }
                }
            }
        }

        Ok(spent)
    }

    /// Transactions holding at least one unspent output locked to `address`
    ///
    /// Rescans the whole chain on every call.
    pub fn find_unspent_transactions(
        &self,
        address: &Address,
    ) -> Result<Vec<Transaction>, BlockchainError> {
        let pub_key_hash = address.pub_key_hash()?;
        Ok(self
            .unspent_outputs(&pub_key_hash)?
            .into_iter()
            .map(|(transaction, _)| transaction)
            .collect())
    }

    /// Greedily selects unspent outputs of `address`, in chain traversal
    /// order, until their total reaches `amount`
    ///
    /// # Returns
    ///
    /// The accumulated total (below `amount` when funds are short) and the
    /// selected output indices keyed by hex transaction id
    pub fn find_spendable_outputs(
        &self,
        address: &Address,
        amount: u64,
    ) -> Result<(u64, BTreeMap<String, Vec<usize>>), BlockchainError> {
        let pub_key_hash = address.pub_key_hash()?;
        let mut selected: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        let mut accumulated: u64 = 0;

        'work: for (transaction, indices) in self.unspent_outputs(&pub_key_hash)? {
            for index in indices {
                if accumulated >= amount {
                    break 'work;
                }
                accumulated = accumulated.saturating_add(transaction.outputs[index].value);
                selected.entry(transaction.id_hex()).or_default().push(index);
            }
        }

        debug!(
            "Selected {} of requested {} for {} from {} transactions",
            accumulated,
            amount,
            address,
            selected.len()
        );

        Ok((accumulated, selected))
    }

    /// All unspent outputs locked to `address`
    pub fn find_utxo(&self, address: &Address) -> Result<Vec<TxOutput>, BlockchainError> {
        let pub_key_hash = address.pub_key_hash()?;
        Ok(self
            .unspent_outputs(&pub_key_hash)?
            .into_iter()
            .flat_map(|(transaction, indices)| {
                indices
                    .into_iter()
                    .map(move |index| transaction.outputs[index].clone())
            })
            .collect())
    }

    /// Sum of the unspent outputs locked to `address`
    pub fn get_balance(&self, address: &Address) -> Result<u64, BlockchainError> {
        Ok(self
            .find_utxo(address)?
            .iter()
            .fold(0u64, |sum, output| sum.saturating_add(output.value)))
    }
}
