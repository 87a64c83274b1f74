use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
use log::{error, info, warn};
use tokio::sync::watch;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

mod api;
mod blockchain;
mod config;

use config::{IngestMode, NodeConfig};

#[derive(OpenApi)]
#[openapi(
    paths(
        api::handlers::submit_transaction,
        api::handlers::get_state,
        api::handlers::get_block,
        api::handlers::get_account,
        api::handlers::get_token,
        api::handlers::get_mempool,
        api::handlers::validate_chain
    ),
    components(
        schemas(
            api::schema::DateTimeUtc,
            api::schema::ErrorResponse,
            api::schema::TransactionRequest,
            api::schema::TransactionView,
            api::schema::BlockView,
            api::schema::StateView,
            api::schema::AccountView,
            api::schema::TokenView,
            api::schema::MempoolEntryView,
            api::schema::SubmissionResponse,
            api::schema::ValidationResponse
        )
    ),
    tags(
        (name = "ledger", description = "Proof-of-authority ledger endpoints")
    ),
    info(
        title = "PoA Ledger API",
        version = "0.1.0",
        description = "Submit signed coin and token transactions and query the chain",
        license(
            name = "MIT",
            url = "https://opensource.org/licenses/MIT"
        )
    )
)]
struct ApiDoc;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logger
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = NodeConfig::load().context("loading node configuration")?;
    let authority = config.authority_wallet()?;

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data directory {}", config.data_dir.display()))?;

    // Without its storage the chain cannot run; startup failures are fatal
    let ledger = blockchain::chain::Blockchain::with_storage(&config.data_dir, authority, config.chain_options())
        .await
        .context("opening ledger storage")?;
    info!(
        "Chain {} ready at {} with authority {}",
        ledger.chain_id(),
        config.data_dir.display(),
        ledger.authority_address()
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = match config.ingest {
        IngestMode::Mempool => {
            info!("Mempool ingest enabled; starting worker");
            Some(ledger.spawn_mempool_worker(shutdown_rx))
        }
        IngestMode::Direct => None,
    };

    // Follow published heads so block production shows up in the node log
    let mut heads = ledger.subscribe_state();
    let follower = tokio::spawn(async move {
        loop {
            match heads.next().await {
                Ok(Some(head)) => info!(
                    "Chain {} head is now block {} ({})",
                    head.chain_id, head.latest_block_number, head.latest_hash
                ),
                Ok(None) => break,
                Err(e) => {
                    warn!("Head subscription failed: {}", e);
                    break;
                }
            }
        }
    });

    let ledger_data = web::Data::new(ledger.clone());
    let ingest = web::Data::new(config.ingest);
    let bind = (config.http.host.clone(), config.http.port);

    info!("Starting HTTP server at http://{}:{}", bind.0, bind.1);

    // Start HTTP server
    let server = HttpServer::new(move || {
        // Configure CORS
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        // Configure OpenAPI documentation
        let openapi = ApiDoc::openapi();

        App::new()
            .wrap(middleware::Logger::default())
            .wrap(cors)
            .app_data(ledger_data.clone())
            .app_data(ingest.clone())
            // API routes
            .configure(api::configure_routes)
            // Swagger UI
            .service(SwaggerUi::new("/swagger-ui/{_:.*}").url("/api-docs/openapi.json", openapi.clone()))
    })
    .bind(bind)
    .context("binding HTTP listener")?
    .run();

    let served = server.await;

    if let Some(worker) = worker {
        if shutdown_tx.send(true).is_err() {
            warn!("Mempool worker exited before shutdown");
        }
        match worker.await {
            Ok(Ok(())) => info!("Mempool worker stopped"),
            Ok(Err(e)) => error!("Mempool worker failed: {}", e),
            Err(e) => error!("Mempool worker panicked: {}", e),
        }
    }

    follower.abort();
    if let Err(e) = ledger.flush() {
        error!("Failed to flush ledger storage: {}", e);
    }

    served.context("running HTTP server")
}
