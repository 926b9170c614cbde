use std::sync::{Mutex, PoisonError};

use actix_web::{web, HttpResponse, Responder};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::schema::{BlockView, OutputView};
use crate::blockchain::chain::BlockchainError;
use crate::blockchain::transaction::TransactionError;
use crate::blockchain::{Address, Block, Blockchain, Transaction, WalletError, Wallets};

/// Shared server state
pub struct AppState {
    pub blockchain: Blockchain,
    pub wallets: Mutex<Wallets>,
}

/// Data structure for the server state
pub type AppData = web::Data<AppState>;

/// Response for the chain endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct ChainResponse {
    /// The number of blocks in the chain
    pub length: usize,

    /// The blocks, newest first
    pub blocks: Vec<BlockView>,

    /// Whether the chain is valid
    pub is_valid: bool,
}

/// Response for the balance endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct BalanceResponse {
    pub address: String,

    /// Sum of the unspent outputs
    pub balance: u64,

    /// The unspent outputs locked to the address
    pub utxos: Vec<OutputView>,
}

/// Request for the send endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct SendRequest {
    /// Sender address; its key must be in the wallet file
    pub from: String,

    /// Recipient address
    pub to: String,

    /// Amount to transfer, in atomic units
    pub amount: u64,
}

/// Response for the send endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct SendResponse {
    pub message: String,

    /// The block holding the transfer
    pub block: BlockView,
}

/// Response for the create wallet endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct WalletResponse {
    /// The wallet's address
    pub address: String,
}

/// Maps a chain failure to 400 for caller mistakes and 500 otherwise
fn chain_error_response(err: &BlockchainError) -> HttpResponse {
    let body = serde_json::json!({ "error": err.to_string() });

    match err {
        BlockchainError::InvalidTransaction(_)
        | BlockchainError::CryptoError(_)
        | BlockchainError::TransactionError(
            TransactionError::InsufficientFunds { .. }
            | TransactionError::InvalidAmount(_)
            | TransactionError::ReferenceNotFound(_)
            | TransactionError::CryptoError(_),
        ) => HttpResponse::BadRequest().json(body),
        _ => HttpResponse::InternalServerError().json(body),
    }
}

fn parse_address(raw: &str) -> Result<Address, HttpResponse> {
    raw.parse::<Address>().map_err(|err| {
        HttpResponse::BadRequest().json(serde_json::json!({
            "error": format!("Invalid address {}: {}", raw, err)
        }))
    })
}

/// Get the full blockchain
///
/// Returns every block from the tip back to genesis and the chain's validity
#[utoipa::path(
    get,
    path = "/api/v1/chain",
    responses(
        (status = 200, description = "Blockchain retrieved successfully", body = ChainResponse),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn get_chain(state: AppData) -> impl Responder {
    let pow = state.blockchain.proof_of_work();

    let blocks: Result<Vec<Block>, BlockchainError> = state.blockchain.iter().collect();
    let blocks = match blocks {
        Ok(blocks) => blocks,
        Err(err) => return chain_error_response(&err),
    };

    let is_valid = match state.blockchain.is_valid() {
        Ok(is_valid) => is_valid,
        Err(err) => return chain_error_response(&err),
    };

    let response = ChainResponse {
        length: blocks.len(),
        blocks: blocks.iter().map(|block| BlockView::new(block, pow)).collect(),
        is_valid,
    };

    HttpResponse::Ok().json(response)
}

/// Check if the blockchain is valid
///
/// Validates proof of work and links of every block
#[utoipa::path(
    get,
    path = "/api/v1/validate",
    responses(
        (status = 200, description = "Blockchain validation status", body = bool),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn validate_chain(state: AppData) -> impl Responder {
    match state.blockchain.is_valid() {
        Ok(is_valid) => HttpResponse::Ok().json(is_valid),
        Err(err) => chain_error_response(&err),
    }
}

/// Get the balance of an address
///
/// Scans the chain for unspent outputs locked to the address
#[utoipa::path(
    get,
    path = "/api/v1/balance/{address}",
    params(
        ("address" = String, Path, description = "Base58 address")
    ),
    responses(
        (status = 200, description = "Balance retrieved successfully", body = BalanceResponse),
        (status = 400, description = "Invalid address"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn get_balance(state: AppData, address: web::Path<String>) -> impl Responder {
    let address = match parse_address(&address) {
        Ok(address) => address,
        Err(response) => return response,
    };

    match state.blockchain.find_utxo(&address) {
        Ok(utxos) => {
            let response = BalanceResponse {
                address: address.0,
                balance: utxos.iter().map(|output| output.value).sum(),
                utxos: utxos.iter().map(OutputView::from).collect(),
            };
            HttpResponse::Ok().json(response)
        }
        Err(err) => chain_error_response(&err),
    }
}

/// Send value between addresses
///
/// Builds and signs a transfer with the sender's stored key, then mines it into a new block
#[utoipa::path(
    post,
    path = "/api/v1/send",
    request_body = SendRequest,
    responses(
        (status = 201, description = "Transfer mined successfully", body = SendResponse),
        (status = 400, description = "Invalid transfer"),
        (status = 404, description = "Sender wallet not found"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn send(state: AppData, send_req: web::Json<SendRequest>) -> impl Responder {
    let from = match parse_address(&send_req.from) {
        Ok(address) => address,
        Err(response) => return response,
    };
    let to = match parse_address(&send_req.to) {
        Ok(address) => address,
        Err(response) => return response,
    };

    let wallet = {
        let wallets = state.wallets.lock().unwrap_or_else(PoisonError::into_inner);
        match wallets.get(&from) {
            Ok(wallet) => wallet.clone(),
            Err(err @ WalletError::NotFound(_)) => {
                return HttpResponse::NotFound().json(serde_json::json!({ "error": err.to_string() }));
            }
            Err(err) => {
                return HttpResponse::InternalServerError().json(serde_json::json!({ "error": err.to_string() }));
            }
        }
    };

    let amount = send_req.amount;
    let worker_state = state.clone();
    let mined = web::block(move || -> Result<Block, BlockchainError> {
        let transaction = Transaction::new_transfer(&wallet, &to, amount, &worker_state.blockchain)?;
        worker_state.blockchain.mine_block(vec![transaction])
    })
    .await;

    match mined {
        Ok(Ok(block)) => {
            info!("Sent {} from {} in block {}", amount, from, hex::encode(block.hash()));
            let response = SendResponse {
                message: "Success!".to_string(),
                block: BlockView::new(&block, state.blockchain.proof_of_work()),
            };
            HttpResponse::Created().json(response)
        }
        Ok(Err(err)) => {
            warn!("Send from {} failed: {}", from, err);
            chain_error_response(&err)
        }
        Err(err) => HttpResponse::InternalServerError().json(serde_json::json!({
            "error": format!("Mining task failed: {}", err)
        })),
    }
}

/// Create a new wallet
///
/// Generates a keypair and stores it in the wallet file
#[utoipa::path(
    post,
    path = "/api/v1/wallet/new",
    responses(
        (status = 201, description = "Wallet created successfully", body = WalletResponse),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn create_wallet(state: AppData) -> impl Responder {
    let mut wallets = state.wallets.lock().unwrap_or_else(PoisonError::into_inner);
    let address = wallets.create_wallet();

    match wallets.save() {
        Ok(()) => HttpResponse::Created().json(WalletResponse { address: address.0 }),
        Err(err) => HttpResponse::InternalServerError().json(serde_json::json!({
            "error": format!("Failed to save wallet: {}", err)
        })),
    }
}

/// List wallet addresses
///
/// Returns every address whose key is held in the wallet file
#[utoipa::path(
    get,
    path = "/api/v1/wallets",
    responses(
        (status = 200, description = "Addresses retrieved successfully", body = Vec<String>)
    )
)]
pub async fn list_wallets(state: AppData) -> impl Responder {
    let wallets = state.wallets.lock().unwrap_or_else(PoisonError::into_inner);
    let addresses: Vec<String> = wallets.addresses().into_iter().map(|address| address.0).collect();
    HttpResponse::Ok().json(addresses)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::configure_routes;
    use crate::blockchain::{BlockchainStorage, ChainConfig, Wallet};
    use actix_web::{http::StatusCode, test, App};

    fn test_state(dir: &tempfile::TempDir) -> (AppData, Address) {
        let mut wallets = Wallets::load(dir.path().join("wallet.dat")).unwrap();
        let owner = wallets.create_wallet();
        let config = ChainConfig {
            difficulty_bits: 8,
            ..ChainConfig::default()
        };
        let blockchain =
            Blockchain::create(BlockchainStorage::temporary().unwrap(), &owner, config).unwrap();

        let state = web::Data::new(AppState {
            blockchain,
            wallets: Mutex::new(wallets),
        });
        (state, owner)
    }

    #[actix_web::test]
    async fn test_get_chain() {
        let dir = tempfile::TempDir::new().unwrap();
        let (state, _) = test_state(&dir);
        let app = test::init_service(App::new().app_data(state).configure(configure_routes)).await;

        let req = test::TestRequest::get().uri("/api/v1/chain").to_request();
        let response: ChainResponse = test::call_and_read_body_json(&app, req).await;

        assert_eq!(response.length, 1);
        assert!(response.is_valid);
        assert!(response.blocks[0].prev_block_hash.is_empty());
    }

    #[actix_web::test]
    async fn test_send_and_balance() {
        let dir = tempfile::TempDir::new().unwrap();
        let (state, owner) = test_state(&dir);
        let recipient = Wallet::new();
        let app = test::init_service(App::new().app_data(state).configure(configure_routes)).await;

        let req = test::TestRequest::post()
            .uri("/api/v1/send")
            .set_json(SendRequest {
                from: owner.0.clone(),
                to: recipient.address().0.clone(),
                amount: 4,
            })
            .to_request();
        let response = test::call_service(&app, req).await;
        assert_eq!(response.status(), StatusCode::CREATED);

        let req = test::TestRequest::get()
            .uri(&format!("/api/v1/balance/{}", recipient.address()))
            .to_request();
        let balance: BalanceResponse = test::call_and_read_body_json(&app, req).await;
        assert_eq!(balance.balance, 4);

        let req = test::TestRequest::get()
            .uri(&format!("/api/v1/balance/{}", owner))
            .to_request();
        let balance: BalanceResponse = test::call_and_read_body_json(&app, req).await;
        assert_eq!(balance.balance, 6);
    }

    #[actix_web::test]
    async fn test_send_errors() {
        let dir = tempfile::TempDir::new().unwrap();
        let (state, owner) = test_state(&dir);
        let recipient = Wallet::new();
        let app = test::init_service(App::new().app_data(state).configure(configure_routes)).await;

        let too_much = test::TestRequest::post()
            .uri("/api/v1/send")
            .set_json(SendRequest {
                from: owner.0.clone(),
                to: recipient.address().0.clone(),
                amount: 1_000,
            })
            .to_request();
        assert_eq!(test::call_service(&app, too_much).await.status(), StatusCode::BAD_REQUEST);

        let unknown_sender = test::TestRequest::post()
            .uri("/api/v1/send")
            .set_json(SendRequest {
                from: recipient.address().0.clone(),
                to: owner.0.clone(),
                amount: 1,
            })
            .to_request();
        assert_eq!(test::call_service(&app, unknown_sender).await.status(), StatusCode::NOT_FOUND);

        let bad_address = test::TestRequest::get().uri("/api/v1/balance/nope").to_request();
        assert_eq!(test::call_service(&app, bad_address).await.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn test_create_and_list_wallets() {
        let dir = tempfile::TempDir::new().unwrap();
        let (state, _) = test_state(&dir);
        let app = test::init_service(App::new().app_data(state).configure(configure_routes)).await;

        let req = test::TestRequest::post().uri("/api/v1/wallet/new").to_request();
        let created: WalletResponse = test::call_and_read_body_json(&app, req).await;

        let req = test::TestRequest::get().uri("/api/v1/wallets").to_request();
        let addresses: Vec<String> = test::call_and_read_body_json(&app, req).await;
        assert_eq!(addresses.len(), 2);
        assert!(addresses.contains(&created.address));

        let reloaded = Wallets::load(dir.path().join("wallet.dat")).unwrap();
        assert_eq!(reloaded.addresses().len(), 2);
    }
}
