use std::net::SocketAddr;
use std::sync::Mutex;

use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
use clap::Parser;
use log::{error, info};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

mod api;
mod blockchain;
mod cli;
mod config;

use config::NodeConfig;

#[derive(OpenApi)]
#[openapi(
    paths(
        api::handlers::get_chain,
        api::handlers::validate_chain,
        api::handlers::get_balance,
        api::handlers::send,
        api::handlers::create_wallet,
        api::handlers::list_wallets
    ),
    components(
        schemas(
            api::schema::BlockView,
            api::schema::TransactionView,
            api::schema::InputView,
            api::schema::OutputView,
            api::handlers::ChainResponse,
            api::handlers::BalanceResponse,
            api::handlers::SendRequest,
            api::handlers::SendResponse,
            api::handlers::WalletResponse
        )
    ),
    tags(
        (name = "ledger", description = "Proof-of-work ledger endpoints")
    ),
    info(
        title = "UTXO Ledger API",
        version = "1.0.0",
        description = "A single-node proof-of-work ledger",
        license(
            name = "MIT",
            url = "https://opensource.org/licenses/MIT"
        )
    )
)]
struct ApiDoc;

/// Serves the HTTP API over an existing chain until the server stops
pub async fn serve(config: NodeConfig, bind: SocketAddr) -> anyhow::Result<()> {
    let blockchain = config
        .open_chain()
        .with_context(|| format!("Failed to open blockchain at {}", config.data_dir.display()))?;
    let wallets = config.load_wallets()?;

    let state = web::Data::new(api::AppState {
        blockchain,
        wallets: Mutex::new(wallets),
    });

    info!("Starting HTTP server at http://{}", bind);

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .wrap(middleware::Logger::default())
            .wrap(cors)
            .app_data(state.clone())
            .configure(api::configure_routes)
            .service(
                SwaggerUi::new("/swagger-ui/{_:.*}")
                    .url("/api-docs/openapi.json", ApiDoc::openapi())
            )
    })
    .bind(bind)?
    .run()
    .await?;

    Ok(())
}

fn main() {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = cli::Cli::parse();
    if let Err(err) = cli::run(cli) {
        error!("{:#}", err);
        eprintln!("Error: {:#}", err);
        std::process::exit(1);
    }
}
