use actix_web::web;

use super::handlers;

/// Configures the API routes
///
/// # Arguments
///
/// * `cfg` - The service configuration
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .route("/transactions", web::post().to(handlers::submit_transaction))
            .route("/state", web::get().to(handlers::get_state))
            .route("/blocks/{number}", web::get().to(handlers::get_block))
            .route("/accounts/{address}", web::get().to(handlers::get_account))
            .route("/tokens/{id}", web::get().to(handlers::get_token))
            .route("/mempool", web::get().to(handlers::get_mempool))
            .route("/validate", web::get().to(handlers::validate_chain)),
    );
}
