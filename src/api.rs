use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{delete, get},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::db::{Database, TransferFilter};
use crate::error::{StoreError, SupervisorError};
use crate::models::{normalize_address, ContractDescriptor, ContractRow, TransferRecord};
use crate::supervisor::Supervisor;

const DEFAULT_LIMIT: u32 = 10;
const MAX_LIMIT: u32 = 1000;

#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    /// Present when the API runs in the same process as the indexer, so new
    /// contracts start being monitored straight away.
    pub supervisor: Option<Arc<Supervisor>>,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Unavailable(String),

    #[error("storage error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::DuplicateContract(_) => ApiError::Conflict(e.to_string()),
            StoreError::UnknownContract(_) => ApiError::NotFound(e.to_string()),
            other => ApiError::Store(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Store(e) => {
                warn!(error = %e, "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct TransferQuery {
    pub contract: Option<String>,
    /// Matches sender or recipient.
    pub address: Option<String>,
    pub limit: Option<u32>, // defaults to 10
    pub offset: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct NewContract {
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub start_block: u64,
}

#[derive(Debug, Serialize)]
pub struct ContractView {
    #[serde(flatten)]
    pub contract: ContractRow,
    pub transfers: u64,
    /// Live monitor state, when this process runs the indexer.
    pub monitor: Option<String>,
}

fn normalize_param(raw: Option<String>) -> Result<Option<String>, ApiError> {
    raw.map(|a| normalize_address(&a).map_err(|e| ApiError::BadRequest(e.to_string())))
        .transpose()
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/transfers", get(list_transfers))
        .route("/transfers/:tx_hash", get(get_transfer))
        .route("/contracts", get(list_contracts).post(add_contract))
        .route("/contracts/:address", delete(remove_contract))
        .layer(cors)
        .with_state(state)
}

pub async fn serve(
    addr: SocketAddr,
    state: AppState,
    shutdown: CancellationToken,
) -> eyre::Result<()> {
    let app = router(state);

    info!("API listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("API stopped");
    Ok(())
}

async fn root() -> Json<Value> {
    Json(json!({
        "service": "coin-indexer",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "health": "GET /health",
            "transfers": "GET /transfers?contract=&address=&limit=&offset=",
            "transfer": "GET /transfers/:tx_hash",
            "contracts": "GET /contracts",
            "add_contract": "POST /contracts",
            "remove_contract": "DELETE /contracts/:address",
        }
    }))
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let indexer = state.supervisor.as_ref().map(|s| {
        if s.is_shutting_down() {
            "stopping"
        } else {
            "running"
        }
    });
    Json(json!({ "status": "healthy", "service": "coin-indexer", "indexer": indexer }))
}

pub async fn list_transfers(
    State(state): State<AppState>,
    Query(q): Query<TransferQuery>,
) -> Result<Json<Vec<TransferRecord>>, ApiError> {
    let filter = TransferFilter {
        contract: normalize_param(q.contract)?,
        address: normalize_param(q.address)?,
        limit: q.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT),
        offset: q.offset.unwrap_or(0),
    };
    Ok(Json(state.db.transfers(filter).await?))
}

pub async fn get_transfer(
    State(state): State<AppState>,
    Path(tx_hash): Path<String>,
) -> Result<Json<Vec<TransferRecord>>, ApiError> {
    let transfers = state.db.transfers_by_hash(tx_hash.to_lowercase()).await?;
    if transfers.is_empty() {
        return Err(ApiError::NotFound(format!(
            "no transfers in transaction {tx_hash}"
        )));
    }
    Ok(Json(transfers))
}

pub async fn list_contracts(
    State(state): State<AppState>,
) -> Result<Json<Vec<ContractView>>, ApiError> {
    let rows = state.db.contracts(false).await?;
    let live = state
        .supervisor
        .as_ref()
        .map(|s| s.statuses())
        .unwrap_or_default();

    let mut views = Vec::with_capacity(rows.len());
    for contract in rows {
        let transfers = state.db.count_transfers(contract.address.clone()).await?;
        let monitor = live
            .iter()
            .find(|s| s.address == contract.address)
            .map(|s| s.state.clone());
        views.push(ContractView {
            contract,
            transfers,
            monitor,
        });
    }
    Ok(Json(views))
}

pub async fn add_contract(
    State(state): State<AppState>,
    Json(req): Json<NewContract>,
) -> Result<(StatusCode, Json<ContractDescriptor>), ApiError> {
    let contract = ContractDescriptor::new(req.name, &req.address, req.start_block)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    if let Some(supervisor) = &state.supervisor {
        if supervisor.is_running(&contract.address) {
            let e = SupervisorError::AlreadyRegistered(contract.address);
            return Err(ApiError::Conflict(e.to_string()));
        }
    }

    state.db.register_contract(contract.clone()).await?;

    if let Some(supervisor) = &state.supervisor {
        if let Err(e) = supervisor.register(contract.clone()) {
            // no monitor will run it, so it must not stay active in the registry
            if let Err(undo) = state.db.deactivate_contract(contract.address.clone()).await {
                warn!(
                    address = %contract.address,
                    error = %undo,
                    "failed to roll back registration"
                );
            }
            return Err(match e {
                SupervisorError::AlreadyRegistered(_) => ApiError::Conflict(e.to_string()),
                _ => ApiError::Unavailable(e.to_string()),
            });
        }
    }

    info!(name = %contract.name, address = %contract.address, "contract registered");
    Ok((StatusCode::CREATED, Json(contract)))
}

pub async fn remove_contract(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Result<StatusCode, ApiError> {
    let address =
        normalize_address(&address).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    state.db.deactivate_contract(address.clone()).await?;

    if let Some(supervisor) = &state.supervisor {
        if let Err(e) = supervisor.deactivate(&address).await {
            // deactivated in the registry but never started in this process
            info!(%address, reason = %e, "no running monitor to stop");
        }
    }
    Ok(StatusCode::NO_CONTENT)
}
