//! Scriptdrop HTTP server
//!
//! Public routes (listing, download, delivery, balance reads and top-ups)
//! plus the admin surface behind the `X-Admin-Id` gate. Handlers are
//! pass-throughs into the stores and the pipeline; every failure maps to
//! a structured `{kind, message}` body and storage internals never leak.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::auth;
use crate::delivery::DeliveryPipeline;
use crate::error::{DeliveryError, StoreError};
use crate::pg_storage::PgStorage;
use crate::storage::{BalanceStore, NewScript, Script, ScriptStore, ScriptUpdate};

pub struct AppState {
    pub storage: Arc<PgStorage>,
    pub pipeline: Arc<DeliveryPipeline>,
    pub started_at: std::time::Instant,
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/scripts", get(list_scripts_handler))
        .route("/download/:script_id", get(download_handler))
        .route("/deliver", post(deliver_handler))
        .route("/user/register", post(register_handler))
        .route("/user/:id/coins", get(coins_handler))
        .route("/user/add-coins", post(add_coins_handler))
        .route("/user/:id/deduct-coins", post(deduct_coins_handler))
        .route("/admin/scripts", post(admin_create_script_handler))
        .route(
            "/admin/scripts/:id",
            put(admin_update_script_handler).delete(admin_delete_script_handler),
        )
        .route("/admin/scripts/:id/toggle", post(admin_toggle_script_handler))
        .route("/admin/add-coins", post(admin_add_coins_handler))
        .route("/admin/stats", get(admin_stats_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ============================================================================
// RESPONSE HELPERS
// ============================================================================

type ApiError = (StatusCode, Json<Value>);

fn error_body(kind: &str, message: impl Into<String>) -> Json<Value> {
    Json(json!({ "kind": kind, "message": message.into() }))
}

fn store_error_response(e: StoreError) -> ApiError {
    match &e {
        StoreError::InvalidAmount { .. } => (
            StatusCode::BAD_REQUEST,
            error_body("invalid_amount", e.to_string()),
        ),
        StoreError::InsufficientBalance { .. } => (
            StatusCode::PAYMENT_REQUIRED,
            error_body("insufficient_balance", e.to_string()),
        ),
        StoreError::NotFound { .. } => (
            StatusCode::NOT_FOUND,
            error_body("not_found", e.to_string()),
        ),
        StoreError::Database(_) => {
            error!("storage failure: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                error_body("storage_error", "storage unavailable"),
            )
        }
    }
}

fn delivery_status(e: &DeliveryError) -> StatusCode {
    match e {
        DeliveryError::NotAMember { .. } => StatusCode::FORBIDDEN,
        DeliveryError::InsufficientBalance { .. } => StatusCode::PAYMENT_REQUIRED,
        DeliveryError::ScriptNotFound { .. } => StatusCode::NOT_FOUND,
        DeliveryError::MembershipUnavailable { .. } | DeliveryError::DeliveryFailed { .. } => {
            StatusCode::BAD_GATEWAY
        }
        DeliveryError::StagingFailed { .. }
        | DeliveryError::Storage { .. }
        | DeliveryError::ReconciliationRequired { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// User-facing message for a failed delivery; storage details stay inside.
fn delivery_message(e: &DeliveryError) -> String {
    match e {
        DeliveryError::Storage { stage, .. } => {
            format!("storage failure during {}", stage.as_str())
        }
        DeliveryError::ReconciliationRequired { price, .. } => format!(
            "delivery failed and the {} coin refund could not be applied; flagged for reconciliation",
            price
        ),
        _ => e.to_string(),
    }
}

// ============================================================================
// PUBLIC ROUTES
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub uptime_secs: u64,
    pub version: String,
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        healthy: true,
        uptime_secs: state.started_at.elapsed().as_secs(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Listing entry: metadata only, the payload stays server-side until a
/// download or delivery.
#[derive(Debug, Serialize)]
pub struct ScriptSummary {
    pub id: Uuid,
    pub name: String,
    pub filename: String,
    pub description: String,
    pub enabled: bool,
    pub downloads: i64,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl From<&Script> for ScriptSummary {
    fn from(s: &Script) -> Self {
        Self {
            id: s.id,
            name: s.name.clone(),
            filename: s.filename.clone(),
            description: s.description.clone(),
            enabled: s.enabled,
            downloads: s.downloads,
            created_at: s.created_at,
        }
    }
}

async fn list_scripts_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    // Admins see disabled scripts too; everyone else gets the enabled set.
    let admin = match auth::caller_id(&headers) {
        Some(caller) => auth::is_authorized(state.storage.as_ref(), caller).await,
        None => false,
    };

    let scripts = state
        .storage
        .list_scripts(!admin)
        .await
        .map_err(store_error_response)?;

    let scripts: Vec<ScriptSummary> = scripts.iter().map(ScriptSummary::from).collect();
    Ok(Json(json!({ "scripts": scripts })))
}

async fn download_handler(
    State(state): State<Arc<AppState>>,
    Path(script_id): Path<Uuid>,
) -> Response {
    let script = match state.storage.get_script(script_id).await {
        Ok(Some(script)) if script.enabled => script,
        Ok(_) => {
            return (
                StatusCode::NOT_FOUND,
                error_body("not_found", format!("script not found: {}", script_id)),
            )
                .into_response()
        }
        Err(e) => return store_error_response(e).into_response(),
    };

    // Advisory counter; a failed bump does not block the download.
    if let Err(e) = state.storage.increment_downloads(script_id).await {
        warn!(script_id = %script_id, "download counter bump failed: {}", e);
    }

    (
        [
            (
                header::CONTENT_TYPE,
                "text/plain; charset=utf-8".to_string(),
            ),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", script.filename),
            ),
        ],
        script.content,
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
pub struct DeliverRequest {
    pub user_id: String,
    pub script_id: Uuid,
}

async fn deliver_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<DeliverRequest>,
) -> Response {
    match state
        .pipeline
        .deliver(&request.user_id, request.script_id)
        .await
    {
        Ok(receipt) => (
            StatusCode::OK,
            Json(json!({ "delivered": true, "receipt": receipt })),
        )
            .into_response(),
        Err(e) => {
            let status = delivery_status(&e);
            (
                status,
                Json(json!({
                    "delivered": false,
                    "kind": e.kind(),
                    "stage": e.stage().as_str(),
                    "refunded": e.refunded(),
                    "message": delivery_message(&e),
                })),
            )
                .into_response()
        }
    }
}

// ============================================================================
// BALANCE ROUTES
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub user_id: String,
}

async fn register_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RegisterRequest>,
) -> Result<Json<Value>, ApiError> {
    state
        .storage
        .register(&request.user_id)
        .await
        .map_err(store_error_response)?;

    info!("Registered user {}", request.user_id);
    Ok(Json(json!({ "registered": true, "user_id": request.user_id })))
}

async fn coins_handler(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let coins = state
        .storage
        .balance(&user_id)
        .await
        .map_err(store_error_response)?;

    Ok(Json(json!({ "user_id": user_id, "coins": coins })))
}

#[derive(Debug, Deserialize)]
pub struct AddCoinsRequest {
    pub user_id: String,
    pub amount: i64,
}

async fn add_coins_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<AddCoinsRequest>,
) -> Result<Json<Value>, ApiError> {
    let coins = state
        .storage
        .credit(&request.user_id, request.amount)
        .await
        .map_err(store_error_response)?;

    Ok(Json(json!({ "user_id": request.user_id, "coins": coins })))
}

#[derive(Debug, Deserialize)]
pub struct DeductCoinsRequest {
    pub amount: i64,
}

async fn deduct_coins_handler(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    Json(request): Json<DeductCoinsRequest>,
) -> Result<Json<Value>, ApiError> {
    let coins = state
        .storage
        .debit(&user_id, request.amount)
        .await
        .map_err(store_error_response)?;

    Ok(Json(json!({ "user_id": user_id, "coins": coins })))
}

// ============================================================================
// ADMIN ROUTES
// ============================================================================

/// Reject unknown callers before any store mutation happens.
async fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let caller = auth::caller_id(headers).ok_or_else(|| {
        (
            StatusCode::UNAUTHORIZED,
            error_body("unauthorized", "missing X-Admin-Id header"),
        )
    })?;

    if auth::is_authorized(state.storage.as_ref(), caller).await {
        Ok(())
    } else {
        Err((
            StatusCode::UNAUTHORIZED,
            error_body("unauthorized", "caller is not an admin"),
        ))
    }
}

async fn admin_create_script_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(new): Json<NewScript>,
) -> Result<(StatusCode, Json<Script>), ApiError> {
    require_admin(&state, &headers).await?;

    let script = state
        .storage
        .create_script(new)
        .await
        .map_err(store_error_response)?;

    Ok((StatusCode::CREATED, Json(script)))
}

async fn admin_update_script_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(update): Json<ScriptUpdate>,
) -> Result<Json<Script>, ApiError> {
    require_admin(&state, &headers).await?;

    let script = state
        .storage
        .update_script(id, update)
        .await
        .map_err(store_error_response)?;

    Ok(Json(script))
}

async fn admin_delete_script_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    require_admin(&state, &headers).await?;

    state
        .storage
        .delete_script(id)
        .await
        .map_err(store_error_response)?;

    Ok(Json(json!({ "deleted": true, "id": id })))
}

async fn admin_toggle_script_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<Script>, ApiError> {
    require_admin(&state, &headers).await?;

    let script = state
        .storage
        .toggle_enabled(id)
        .await
        .map_err(store_error_response)?;

    Ok(Json(script))
}

async fn admin_add_coins_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<AddCoinsRequest>,
) -> Result<Json<Value>, ApiError> {
    require_admin(&state, &headers).await?;

    let coins = state
        .storage
        .credit(&request.user_id, request.amount)
        .await
        .map_err(store_error_response)?;

    info!(
        "Admin credited {} coins to {}",
        request.amount, request.user_id
    );
    Ok(Json(json!({ "user_id": request.user_id, "coins": coins })))
}

async fn admin_stats_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    require_admin(&state, &headers).await?;

    let stats = state.storage.stats().await.map_err(store_error_response)?;
    Ok(Json(json!({ "stats": stats })))
}

// ============================================================================
// SERVER
// ============================================================================

/// Run the server
pub async fn run_server(
    host: &str,
    port: u16,
    storage: Arc<PgStorage>,
    pipeline: Arc<DeliveryPipeline>,
) -> anyhow::Result<()> {
    let state = Arc::new(AppState {
        storage,
        pipeline,
        started_at: std::time::Instant::now(),
    });

    let app = create_router(state);
    let addr = format!("{}:{}", host, port);

    info!("Starting Scriptdrop server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
