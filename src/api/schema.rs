use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::blockchain::pow::ProofOfWork;
use crate::blockchain::{Address, Block, Transaction, TxInput, TxOutput};

/// Formats a Unix timestamp (seconds) as RFC 3339, empty when out of range
pub fn format_timestamp(timestamp: i64) -> String {
    Utc.timestamp_opt(timestamp, 0)
        .single()
        .map(|time| time.to_rfc3339())
        .unwrap_or_default()
}

/// A block as exposed over the API, hashes hex encoded
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct BlockView {
    pub hash: String,

    /// Empty for the genesis block
    pub prev_block_hash: String,

    /// Seconds since the Unix epoch
    pub timestamp: i64,

    #[schema(example = "2023-01-01T12:00:00+00:00")]
    pub time: String,

    pub nonce: u64,

    /// Whether the block satisfies the proof-of-work target
    pub pow_valid: bool,

    pub transactions: Vec<TransactionView>,
}

impl BlockView {
    pub fn new(block: &Block, pow: &ProofOfWork) -> Self {
        BlockView {
            hash: hex::encode(block.hash()),
            prev_block_hash: hex::encode(block.prev_block_hash()),
            timestamp: block.timestamp(),
            time: format_timestamp(block.timestamp()),
            nonce: block.nonce(),
            pow_valid: pow.validate(block),
            transactions: block.transactions().iter().map(TransactionView::from).collect(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct TransactionView {
    pub id: String,
    pub coinbase: bool,
    pub inputs: Vec<InputView>,
    pub outputs: Vec<OutputView>,
}

impl From<&Transaction> for TransactionView {
    fn from(transaction: &Transaction) -> Self {
        TransactionView {
            id: transaction.id_hex(),
            coinbase: transaction.is_coinbase(),
            inputs: transaction.inputs.iter().map(InputView::from).collect(),
            outputs: transaction.outputs.iter().map(OutputView::from).collect(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct InputView {
    pub txid: String,
    pub output_index: i64,
    pub signature: String,

    /// Public key, or the coinbase payload
    pub pub_key: String,
}

impl From<&TxInput> for InputView {
    fn from(input: &TxInput) -> Self {
        InputView {
            txid: hex::encode(&input.txid),
            output_index: input.output_index,
            signature: hex::encode(&input.signature),
            pub_key: hex::encode(&input.pub_key),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct OutputView {
    pub value: u64,
    pub pub_key_hash: String,
    pub address: String,
}

impl From<&TxOutput> for OutputView {
    fn from(output: &TxOutput) -> Self {
        OutputView {
            value: output.value,
            pub_key_hash: hex::encode(&output.pub_key_hash),
            address: Address::from_pub_key_hash(&output.pub_key_hash).0,
        }
    }
}
