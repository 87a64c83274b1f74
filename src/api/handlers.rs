use actix_web::{web, HttpResponse, Responder};
use log::error;

use super::schema::{
    AccountView, BlockView, ErrorResponse, MempoolEntryView, StateView, SubmissionResponse, TokenView,
    TransactionRequest, ValidationResponse,
};
use crate::blockchain::bignum::BigNum;
use crate::blockchain::chain::{Blockchain, BlockchainError};
use crate::blockchain::consensus::ConsensusError;
use crate::blockchain::crypto::Address;
use crate::blockchain::mempool::MempoolError;
use crate::config::IngestMode;

/// Data structure for the blockchain state
pub type BlockchainData = web::Data<Blockchain>;

/// How submitted transactions are routed
pub type IngestData = web::Data<IngestMode>;

fn internal_error(context: &str, err: impl std::fmt::Display) -> HttpResponse {
    error!("{}: {}", context, err);
    HttpResponse::InternalServerError().json(ErrorResponse::single("server", "internal server error"))
}

fn consensus_error_response(err: ConsensusError) -> HttpResponse {
    if let Some(errors) = err.field_errors() {
        return HttpResponse::BadRequest().json(ErrorResponse { errors });
    }
    match err {
        ConsensusError::SealTimeout(_) => {
            HttpResponse::ServiceUnavailable().json(ErrorResponse::single("block", err.to_string()))
        }
        ConsensusError::Consistency(_) => {
            HttpResponse::Conflict().json(ErrorResponse::single("block", err.to_string()))
        }
        other => internal_error("Block production failed", other),
    }
}

fn lookup_error(err: BlockchainError) -> HttpResponse {
    internal_error("Ledger lookup failed", err)
}

/// Submit a signed transaction
///
/// In direct mode the transaction is mined into a block before the
/// response is sent; in mempool mode it is queued for the worker.
#[utoipa::path(
    post,
    path = "/api/v1/transactions",
    request_body = TransactionRequest,
    responses(
        (status = 201, description = "Transaction committed in a new block", body = SubmissionResponse),
        (status = 202, description = "Transaction queued in the mempool", body = SubmissionResponse),
        (status = 400, description = "Invalid or unauthorized transaction", body = ErrorResponse),
        (status = 409, description = "Chain head moved; resync required", body = ErrorResponse),
        (status = 503, description = "Sealing timed out; retry later", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn submit_transaction(
    blockchain: BlockchainData,
    ingest: IngestData,
    request: web::Json<TransactionRequest>,
) -> impl Responder {
    let signed = match request.into_inner().into_signed() {
        Ok(signed) => signed,
        Err(errors) => return HttpResponse::BadRequest().json(ErrorResponse { errors }),
    };

    match *ingest.get_ref() {
        IngestMode::Direct => match blockchain.submit_transaction(signed).await {
            Ok(state) => HttpResponse::Created().json(SubmissionResponse {
                status: "committed".to_string(),
                state: Some(StateView::from(&state)),
                mempool_id: None,
            }),
            Err(err) => consensus_error_response(err),
        },
        IngestMode::Mempool => match blockchain.enqueue_transaction(signed) {
            Ok(entry) => HttpResponse::Accepted().json(SubmissionResponse {
                status: "queued".to_string(),
                state: None,
                mempool_id: Some(entry.id),
            }),
            Err(MempoolError::Validation(err)) => {
                HttpResponse::BadRequest().json(ErrorResponse::single(err.field(), err.to_string()))
            }
            Err(err) => internal_error("Failed to queue transaction", err),
        },
    }
}

/// Get the chain head
#[utoipa::path(
    get,
    path = "/api/v1/state",
    responses(
        (status = 200, description = "Current chain head", body = StateView),
        (status = 404, description = "Chain not bootstrapped", body = ErrorResponse)
    )
)]
pub async fn get_state(blockchain: BlockchainData) -> impl Responder {
    match blockchain.state() {
        Ok(Some(state)) => {
            let mut view = StateView::from(&state);
            view.stage = Some(format!("{:?}", blockchain.consensus_stage()).to_lowercase());
            HttpResponse::Ok().json(view)
        }
        Ok(None) => HttpResponse::NotFound().json(ErrorResponse::single("chain_id", "chain has no genesis block")),
        Err(err) => lookup_error(err),
    }
}

/// Get a block by number
#[utoipa::path(
    get,
    path = "/api/v1/blocks/{number}",
    params(("number" = u64, Path, description = "Block number")),
    responses(
        (status = 200, description = "Block found", body = BlockView),
        (status = 404, description = "No block at this number", body = ErrorResponse)
    )
)]
pub async fn get_block(blockchain: BlockchainData, number: web::Path<u64>) -> impl Responder {
    let number = number.into_inner();
    match blockchain.get_block(number) {
        Ok(Some(block)) => HttpResponse::Ok().json(BlockView::from(&block)),
        Ok(None) => HttpResponse::NotFound().json(ErrorResponse::single("number", format!("no block #{}", number))),
        Err(err) => lookup_error(err),
    }
}

/// Get an account by address
#[utoipa::path(
    get,
    path = "/api/v1/accounts/{address}",
    params(("address" = String, Path, description = "0x-prefixed account address")),
    responses(
        (status = 200, description = "Account found", body = AccountView),
        (status = 400, description = "Malformed address", body = ErrorResponse),
        (status = 404, description = "Unknown account", body = ErrorResponse)
    )
)]
pub async fn get_account(blockchain: BlockchainData, address: web::Path<String>) -> impl Responder {
    let address: Address = match address.parse() {
        Ok(address) => address,
        Err(err) => return HttpResponse::BadRequest().json(ErrorResponse::single("address", err.to_string())),
    };
    match blockchain.get_account(&address) {
        Ok(Some(account)) => HttpResponse::Ok().json(AccountView::from(&account)),
        Ok(None) => HttpResponse::NotFound().json(ErrorResponse::single("address", "unknown account")),
        Err(err) => lookup_error(err),
    }
}

/// Get a token by id
#[utoipa::path(
    get,
    path = "/api/v1/tokens/{id}",
    params(("id" = String, Path, description = "Token id, decimal or 0x hex")),
    responses(
        (status = 200, description = "Token found", body = TokenView),
        (status = 400, description = "Malformed id", body = ErrorResponse),
        (status = 404, description = "Unknown token", body = ErrorResponse)
    )
)]
pub async fn get_token(blockchain: BlockchainData, id: web::Path<String>) -> impl Responder {
    let id: BigNum = match id.parse() {
        Ok(id) => id,
        Err(err) => return HttpResponse::BadRequest().json(ErrorResponse::single("id", err.to_string())),
    };
    match blockchain.get_token(&id) {
        Ok(Some(token)) => HttpResponse::Ok().json(TokenView::from(&token)),
        Ok(None) => HttpResponse::NotFound().json(ErrorResponse::single("id", "unknown token")),
        Err(err) => lookup_error(err),
    }
}

/// List the pending mempool, oldest first
#[utoipa::path(
    get,
    path = "/api/v1/mempool",
    responses(
        (status = 200, description = "Pending transactions", body = Vec<MempoolEntryView>)
    )
)]
pub async fn get_mempool(blockchain: BlockchainData) -> impl Responder {
    match blockchain.pending_transactions() {
        Ok(entries) => {
            let views: Vec<MempoolEntryView> = entries.iter().map(MempoolEntryView::from).collect();
            HttpResponse::Ok().json(views)
        }
        Err(err) => lookup_error(err),
    }
}

/// Check if the blockchain is valid
///
/// Re-validates every stored block from genesis to head
#[utoipa::path(
    get,
    path = "/api/v1/validate",
    responses(
        (status = 200, description = "Blockchain validation status", body = ValidationResponse)
    )
)]
pub async fn validate_chain(blockchain: BlockchainData) -> impl Responder {
    let response = match blockchain.verify_chain() {
        Ok(blocks_checked) => ValidationResponse {
            valid: true,
            blocks_checked,
            error: None,
        },
        Err(err) => ValidationResponse {
            valid: false,
            blocks_checked: 0,
            error: Some(err.to_string()),
        },
    };
    HttpResponse::Ok().json(response)
}
