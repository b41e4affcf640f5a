//! Admin API for account management
//!
//! The operational surface of the daemon — the same operations the original
//! command front end exposed, as JSON over HTTP on a local listener:
//!
//! - GET    /health                      — daemon summary
//! - GET    /metrics                     — Prometheus exposition
//! - GET    /accounts                    — list accounts with status
//! - PUT    /accounts/{id}/credentials   — store (encrypt) a credential pair
//! - POST   /accounts/{id}/start         — start auto unlock
//! - POST   /accounts/{id}/stop          — stop auto unlock
//! - POST   /accounts/{id}/unlock        — manual one-shot attempt
//! - GET    /accounts/{id}/tokens        — last fetched token set
//! - DELETE /accounts/{id}               — stop + erase all account data
//!
//! Credential plaintext appears only in request bodies; it is never echoed
//! back and never logged.

use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post, put};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use tracing::info;

use provider::StatusNotifier;
use unlock_engine::{Error as EngineError, Registry, StartOutcome, StopOutcome};
use unlock_vault::{AccountStore, Error as VaultError};

/// Shared state for admin handlers.
#[derive(Clone)]
pub struct AdminState {
    pub registry: Arc<Registry>,
    pub store: Arc<AccountStore>,
    pub notifier: Arc<dyn StatusNotifier>,
    pub prometheus: PrometheusHandle,
    pub started_at: Instant,
}

/// Build the admin router with all endpoints.
pub fn build_router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/accounts", get(list_accounts))
        .route("/accounts/{id}/credentials", put(put_credentials))
        .route("/accounts/{id}/start", post(start_account))
        .route("/accounts/{id}/stop", post(stop_account))
        .route("/accounts/{id}/unlock", post(manual_unlock))
        .route("/accounts/{id}/tokens", get(last_tokens))
        .route("/accounts/{id}", delete(delete_account))
        .with_state(state)
}

fn json_response(status: StatusCode, body: serde_json::Value) -> impl IntoResponse {
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// GET /health — daemon summary.
async fn health(State(state): State<AdminState>) -> impl IntoResponse {
    let accounts_total = state.store.len().await;
    let engines_running = state.registry.running().await.len();
    json_response(
        StatusCode::OK,
        serde_json::json!({
            "status": "ok",
            "accounts_total": accounts_total,
            "engines_running": engines_running,
            "uptime_seconds": state.started_at.elapsed().as_secs(),
        }),
    )
}

/// GET /metrics — Prometheus text exposition.
async fn metrics_endpoint(State(state): State<AdminState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// GET /accounts — ids with persisted status and live engine flag.
async fn list_accounts(State(state): State<AdminState>) -> impl IntoResponse {
    let mut accounts = Vec::new();
    for (account, status) in state.store.entries().await {
        let running = state.registry.is_running(&account).await;
        accounts.push(serde_json::json!({
            "id": account,
            "status": status.label(),
            "running": running,
        }));
    }
    json_response(StatusCode::OK, serde_json::json!({ "accounts": accounts }))
}

/// Credential pair submitted by the operator.
#[derive(Deserialize)]
struct CredentialBody {
    login: String,
    secret: String,
}

/// PUT /accounts/{id}/credentials — encrypt and store the pair.
async fn put_credentials(
    State(state): State<AdminState>,
    Path(account): Path<String>,
    axum::Json(body): axum::Json<CredentialBody>,
) -> impl IntoResponse {
    if body.login.trim().is_empty() || body.secret.is_empty() {
        return json_response(
            StatusCode::BAD_REQUEST,
            serde_json::json!({ "error": "login and secret must be non-empty" }),
        );
    }

    match state
        .store
        .put_credential(&account, &body.login, &body.secret)
        .await
    {
        Ok(()) => {
            info!(account, "credentials stored");
            json_response(StatusCode::OK, serde_json::json!({ "stored": true }))
        }
        Err(e) => json_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            serde_json::json!({ "error": e.to_string() }),
        ),
    }
}

/// POST /accounts/{id}/start — spawn the account's engine.
async fn start_account(
    State(state): State<AdminState>,
    Path(account): Path<String>,
) -> impl IntoResponse {
    match state.registry.start(&account, state.notifier.clone()).await {
        Ok(StartOutcome::Started) => {
            json_response(StatusCode::OK, serde_json::json!({ "started": true }))
        }
        Ok(StartOutcome::AlreadyRunning) => json_response(
            StatusCode::CONFLICT,
            serde_json::json!({ "error": "auto unlock is already running" }),
        ),
        Err(EngineError::Vault(VaultError::NotFound(_)))
        | Err(EngineError::Vault(VaultError::CredentialCorrupt)) => json_response(
            StatusCode::NOT_FOUND,
            serde_json::json!({ "error": "credentials missing or unreadable, use PUT credentials first" }),
        ),
        Err(e) => json_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            serde_json::json!({ "error": e.to_string() }),
        ),
    }
}

/// POST /accounts/{id}/stop — cancel the account's engine.
async fn stop_account(
    State(state): State<AdminState>,
    Path(account): Path<String>,
) -> impl IntoResponse {
    match state.registry.stop(&account).await {
        Ok(StopOutcome::Stopped) => {
            json_response(StatusCode::OK, serde_json::json!({ "stopped": true }))
        }
        Ok(StopOutcome::NotRunning) => json_response(
            StatusCode::NOT_FOUND,
            serde_json::json!({ "error": "auto unlock is not running" }),
        ),
        Err(e) => json_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            serde_json::json!({ "error": e.to_string() }),
        ),
    }
}

/// POST /accounts/{id}/unlock — immediate one-shot attempt.
async fn manual_unlock(
    State(state): State<AdminState>,
    Path(account): Path<String>,
) -> impl IntoResponse {
    match state.registry.manual_unlock(&account, &state.notifier).await {
        Ok(outcome) => json_response(
            StatusCode::OK,
            serde_json::json!({
                "outcome": outcome.label(),
                "detail": outcome.describe(),
            }),
        ),
        Err(EngineError::Vault(VaultError::NotFound(_)))
        | Err(EngineError::Vault(VaultError::CredentialCorrupt)) => json_response(
            StatusCode::NOT_FOUND,
            serde_json::json!({ "error": "credentials missing or unreadable" }),
        ),
        Err(e @ (EngineError::TokenFetch(_)
        | EngineError::Transport(_)
        | EngineError::Parse(_))) => json_response(
            StatusCode::BAD_GATEWAY,
            serde_json::json!({ "error": e.to_string() }),
        ),
        Err(e) => json_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            serde_json::json!({ "error": e.to_string() }),
        ),
    }
}

/// GET /accounts/{id}/tokens — last fetched token set, for inspection.
async fn last_tokens(
    State(state): State<AdminState>,
    Path(account): Path<String>,
) -> impl IntoResponse {
    match state.store.last_tokens(&account).await {
        Some(tokens) => json_response(
            StatusCode::OK,
            serde_json::to_value(&tokens).unwrap_or_default(),
        ),
        None => json_response(
            StatusCode::NOT_FOUND,
            serde_json::json!({ "error": "no token set recorded for this account" }),
        ),
    }
}

/// DELETE /accounts/{id} — stop the engine if running and erase the record.
async fn delete_account(
    State(state): State<AdminState>,
    Path(account): Path<String>,
) -> impl IntoResponse {
    // Best effort: a NotRunning outcome is fine here.
    let _ = state.registry.stop(&account).await;

    match state.store.remove(&account).await {
        Ok(true) => {
            info!(account, "account data erased");
            json_response(StatusCode::OK, serde_json::json!({ "deleted": true }))
        }
        Ok(false) => json_response(
            StatusCode::NOT_FOUND,
            serde_json::json!({ "error": "no data stored for this account" }),
        ),
        Err(e) => json_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            serde_json::json!({ "error": e.to_string() }),
        ),
    }
}
