// API module
//
// HTTP surface over the ledger: chain inspection, balances, transfers and wallets

pub mod handlers;
pub mod routes;
pub mod schema;

// Re-export main components for easier access
pub use handlers::AppState;
pub use routes::configure_routes;
