use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, put},
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use ledgerd_core::{
    Account, AccountFilter, AccountUpdate, Entry, EntryFilter, NewAccount, NewEntry, Page, StorageBackend,
    StorageError, Transfer, TransferFilter,
};

use crate::executor::{CancelFlag, TransferError, TransferExecutor, TransferRequest, TransferResult};
use crate::store::LedgerStore;

#[derive(Clone)]
pub struct AppState {
    store: LedgerStore,
    executor: Arc<TransferExecutor>,
    metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            executor: Arc::new(TransferExecutor::new(backend.clone())),
            store: LedgerStore::new(backend),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(render_metrics))
        .route("/accounts", get(list_accounts).post(create_account))
        .route("/accounts/:id", get(get_account).put(update_account).delete(delete_account))
        .route("/accounts/:id/balance", put(add_account_balance))
        .route("/accounts/:id/entries", get(list_account_entries))
        .route("/accounts/:id/transfers/outbound", get(list_outbound_transfers))
        .route("/accounts/:id/transfers/inbound", get(list_inbound_transfers))
        .route("/entries", get(list_entries).post(create_entry))
        .route("/entries/:id", get(get_entry).put(update_entry).delete(delete_entry))
        .route("/transfers", get(list_transfers).post(create_transfer))
        .route("/transfers/:id", get(get_transfer).put(update_transfer).delete(delete_transfer))
        .with_state(state)
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error("request task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Storage(e) | ApiError::Transfer(TransferError::Storage(e)) => storage_status(e),
            ApiError::Transfer(TransferError::InvalidArgument(_)) => StatusCode::BAD_REQUEST,
            ApiError::Transfer(TransferError::Cancelled) => {
                StatusCode::from_u16(499).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            ApiError::Transfer(TransferError::RollbackFailed { .. }) | ApiError::Task(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

fn storage_status(e: &StorageError) -> StatusCode {
    match e {
        StorageError::NotFound { .. } => StatusCode::NOT_FOUND,
        StorageError::Constraint(_) => StatusCode::CONFLICT,
        StorageError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        StorageError::Other(_) | StorageError::NoActiveTransaction | StorageError::RollbackFailed { .. } => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        (status, Json(ErrorBody { error: self.to_string() })).into_response()
    }
}

/// Runs storage work off the async workers.
async fn blocking<T, E, F>(work: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: Into<ApiError> + Send + 'static,
{
    tokio::task::spawn_blocking(work).await?.map_err(Into::into)
}

/// Raises the flag unless disarmed, so a transfer whose request was
/// abandoned rolls back instead of committing.
struct CancelOnDrop(Option<CancelFlag>);

impl CancelOnDrop {
    fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(flag) = self.0.take() {
            tracing::debug!("Transfer request dropped, cancelling");
            flag.cancel();
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    page_number: Option<i64>,
    page_size: Option<i64>,
    owner: Option<String>,
    account_id: Option<i64>,
    transfer_id: Option<i64>,
}

impl ListParams {
    fn page(&self) -> Page {
        Page::number(self.page_number.unwrap_or(1), self.page_size.unwrap_or(Page::DEFAULT_SIZE))
    }
}

#[derive(Debug, Deserialize)]
pub struct AmountBody {
    amount: i64,
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "backend": state.store.backend().name() }))
}

async fn render_metrics(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

// Accounts

async fn list_accounts(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<Account>>, ApiError> {
    let filter = AccountFilter { owner: params.owner.clone() };
    blocking(move || state.store.list_accounts(&filter, params.page())).await.map(Json)
}

async fn create_account(
    State(state): State<AppState>,
    Json(account): Json<NewAccount>,
) -> Result<(StatusCode, Json<Account>), ApiError> {
    let created = blocking(move || state.store.create_account(&account)).await?;
    tracing::info!(account_id = created.id, "Account created");
    Ok((StatusCode::CREATED, Json(created)))
}

async fn get_account(State(state): State<AppState>, Path(id): Path<i64>) -> Result<Json<Account>, ApiError> {
    blocking(move || state.store.get_account(id)).await.map(Json)
}

async fn update_account(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(update): Json<AccountUpdate>,
) -> Result<Json<Account>, ApiError> {
    blocking(move || state.store.update_account(id, &update)).await.map(Json)
}

async fn add_account_balance(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<AmountBody>,
) -> Result<Json<Account>, ApiError> {
    blocking(move || state.store.add_account_balance(id, body.amount)).await.map(Json)
}

async fn delete_account(State(state): State<AppState>, Path(id): Path<i64>) -> Result<StatusCode, ApiError> {
    blocking(move || state.store.delete_account(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

// Entries

async fn list_entries(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<Entry>>, ApiError> {
    let filter = EntryFilter { account_id: params.account_id, transfer_id: params.transfer_id };
    blocking(move || state.store.list_entries(&filter, params.page())).await.map(Json)
}

async fn list_account_entries(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<Entry>>, ApiError> {
    blocking(move || state.store.list_entries(&EntryFilter::account(id), params.page())).await.map(Json)
}

async fn create_entry(
    State(state): State<AppState>,
    Json(entry): Json<NewEntry>,
) -> Result<(StatusCode, Json<Entry>), ApiError> {
    let created = blocking(move || state.store.create_entry(&entry)).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn get_entry(State(state): State<AppState>, Path(id): Path<i64>) -> Result<Json<Entry>, ApiError> {
    blocking(move || state.store.get_entry(id)).await.map(Json)
}

async fn update_entry(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<AmountBody>,
) -> Result<Json<Entry>, ApiError> {
    blocking(move || state.store.update_entry(id, body.amount)).await.map(Json)
}

async fn delete_entry(State(state): State<AppState>, Path(id): Path<i64>) -> Result<StatusCode, ApiError> {
    blocking(move || state.store.delete_entry(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

// Transfers

async fn list_transfers(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<Transfer>>, ApiError> {
    blocking(move || state.store.list_transfers(&TransferFilter::All, params.page())).await.map(Json)
}

async fn list_outbound_transfers(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<Transfer>>, ApiError> {
    blocking(move || state.store.list_transfers(&TransferFilter::Outbound(id), params.page())).await.map(Json)
}

async fn list_inbound_transfers(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<Transfer>>, ApiError> {
    blocking(move || state.store.list_transfers(&TransferFilter::Inbound(id), params.page())).await.map(Json)
}

async fn create_transfer(
    State(state): State<AppState>,
    Json(request): Json<TransferRequest>,
) -> Result<(StatusCode, Json<TransferResult>), ApiError> {
    let cancel = CancelFlag::new();
    let guard = CancelOnDrop(Some(cancel.clone()));
    let executor = state.executor.clone();
    let result = blocking(move || executor.execute_cancellable(&request, &cancel)).await;
    guard.disarm();
    result.map(|transfer| (StatusCode::CREATED, Json(transfer)))
}

async fn get_transfer(State(state): State<AppState>, Path(id): Path<i64>) -> Result<Json<Transfer>, ApiError> {
    blocking(move || state.store.get_transfer(id)).await.map(Json)
}

async fn update_transfer(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<AmountBody>,
) -> Result<Json<Transfer>, ApiError> {
    blocking(move || state.store.update_transfer(id, body.amount)).await.map(Json)
}

async fn delete_transfer(State(state): State<AppState>, Path(id): Path<i64>) -> Result<StatusCode, ApiError> {
    blocking(move || state.store.delete_transfer(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}
