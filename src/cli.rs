use std::net::SocketAddr;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::info;

use crate::api::schema::format_timestamp;
use crate::blockchain::{Address, Blockchain, Transaction};
use crate::config::{ConfigArgs, NodeConfig};

/// Single-node proof-of-work ledger
#[derive(Parser)]
#[command(name = "utxo-ledger")]
#[command(about = "Single-node proof-of-work ledger with UTXO transactions")]
#[command(version)]
pub struct Cli {
    #[command(flatten)]
    pub config: ConfigArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Generate a new key pair and store it in the wallet file
    #[command(name = "createwallet")]
    CreateWallet,

    /// List the addresses held in the wallet file
    #[command(name = "listaddresses")]
    ListAddresses,

    /// Create a blockchain and send the genesis reward to ADDRESS
    #[command(name = "createblockchain")]
    CreateBlockchain {
        #[arg(long)]
        address: String,
    },

    /// Get the balance of ADDRESS
    #[command(name = "getbalance")]
    GetBalance {
        #[arg(long)]
        address: String,
    },

    /// Send AMOUNT of coins from FROM to TO
    Send {
        #[arg(long)]
        from: String,

        #[arg(long)]
        to: String,

        #[arg(long)]
        amount: u64,
    },

    /// Print all the blocks of the blockchain, newest first
    #[command(name = "printchain")]
    PrintChain,

    /// Serve the HTTP API
    Serve {
        #[arg(long, env = "LEDGER_BIND", default_value = "127.0.0.1:8080")]
        bind: SocketAddr,
    },
}

fn parse_address(raw: &str) -> Result<Address> {
    raw.parse::<Address>()
        .with_context(|| format!("ERROR: Address is not valid: {}", raw))
}

/// Runs one subcommand; the store is opened inside and released on return
pub fn run(cli: Cli) -> Result<()> {
    let config = NodeConfig::from(cli.config);

    match cli.command {
        Commands::CreateWallet => create_wallet(&config),
        Commands::ListAddresses => list_addresses(&config),
        Commands::CreateBlockchain { address } => create_blockchain(&config, &address),
        Commands::GetBalance { address } => get_balance(&config, &address),
        Commands::Send { from, to, amount } => send(&config, &from, &to, amount),
        Commands::PrintChain => print_chain(&config),
        Commands::Serve { bind } => {
            actix_web::rt::System::new()
                .block_on(crate::serve(config, bind))
                .context("HTTP server failed")
        }
    }
}

fn create_wallet(config: &NodeConfig) -> Result<()> {
    let mut wallets = config.load_wallets()?;
    let address = wallets.create_wallet();
    wallets.save()?;

    println!("Your new address: {}", address);
    Ok(())
}

fn list_addresses(config: &NodeConfig) -> Result<()> {
    let wallets = config.load_wallets()?;
    for address in wallets.addresses() {
        println!("{}", address);
    }
    Ok(())
}

fn create_blockchain(config: &NodeConfig, address: &str) -> Result<()> {
    let address = parse_address(address)?;
    let storage = config.open_storage().context("Failed to open block database")?;

    Blockchain::create(storage, &address, config.chain.clone())?;

    println!("Done!");
    Ok(())
}

fn get_balance(config: &NodeConfig, address: &str) -> Result<()> {
    let address = parse_address(address)?;
    let chain = config.open_chain()?;

    let balance = chain.get_balance(&address)?;
    println!("Balance of '{}': {}", address, balance);
    Ok(())
}

fn send(config: &NodeConfig, from: &str, to: &str, amount: u64) -> Result<()> {
    let from = parse_address(from)?;
    let to = parse_address(to)?;
    if amount == 0 {
        bail!("ERROR: Amount must be positive");
    }

    let wallets = config.load_wallets()?;
    let wallet = wallets.get(&from)?;
    let chain = config.open_chain()?;

    let transaction = Transaction::new_transfer(wallet, &to, amount, &chain)?;
    let block = chain.mine_block(vec![transaction])?;

    info!("Transfer included in block {}", hex::encode(block.hash()));
    println!("Success!");
    Ok(())
}

fn print_chain(config: &NodeConfig) -> Result<()> {
    let chain = config.open_chain()?;
    let pow = chain.proof_of_work();

    for block in chain.iter() {
        let block = block?;

        println!("============ Block {} ============", hex::encode(block.hash()));
        println!("Prev. hash: {}", hex::encode(block.prev_block_hash()));
        println!("Timestamp: {}", format_timestamp(block.timestamp()));
        println!("Nonce: {}", block.nonce());
        println!("PoW: {}", pow.validate(&block));

        for transaction in block.transactions() {
            println!("--- Transaction {}:", transaction.id_hex());
            for (index, input) in transaction.inputs.iter().enumerate() {
                if transaction.is_coinbase() {
                    println!(
                        "     Input {}: coinbase '{}'",
                        index,
                        String::from_utf8_lossy(&input.pub_key)
                    );
                } else {
                    println!(
                        "     Input {}: {}:{} signed by {}",
                        index,
                        hex::encode(&input.txid),
                        input.output_index,
                        hex::encode(&input.pub_key)
                    );
                }
            }
            for (index, output) in transaction.outputs.iter().enumerate() {
                println!(
                    "     Output {}: {} to {}",
                    index,
                    output.value,
                    Address::from_pub_key_hash(&output.pub_key_hash)
                );
            }
        }
        println!();
    }

    Ok(())
}
