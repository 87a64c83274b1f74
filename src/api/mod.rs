// API module
//
// Thin HTTP surface over the ledger: transaction submission and
// read-only queries of the chain head, blocks, accounts, tokens and mempool

pub mod handlers;
pub mod routes;
pub mod schema;

// Re-export main components for easier access
pub use routes::configure_routes;
