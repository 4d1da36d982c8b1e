//! Setup-flow HTTP API.
//!
//! | Route                              | Purpose                                   |
//! |------------------------------------|-------------------------------------------|
//! | `GET /auth/:provider/setup`        | start consent redirect or session capture |
//! | `GET /auth/:provider/callback`     | OAuth code exchange                       |
//! | `GET /auth/:provider/status`       | credential state, no provider call        |
//! | `POST /auth/:provider/report`      | collaborator saw an auth-class failure    |
//! | `GET /api/status`                  | every provider with its accounts          |
//!
//! All routes take `?account=` (default `"default"`) and only answer
//! loopback peers.

mod guard;
mod setup;
mod status;

pub use guard::require_loopback;

use crate::capture::CaptureJobs;
use crate::credentials::DEFAULT_ACCOUNT;
use crate::error::{BrokerError, ErrorCode};
use crate::facade::CredentialFacade;
use axum::{
    http::StatusCode,
    middleware,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Longest account name accepted on the API.
const MAX_ACCOUNT_LEN: usize = 128;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub facade: Arc<CredentialFacade>,
    pub jobs: Arc<CaptureJobs>,
}

/// Error response
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_code: Option<ErrorCode>,
}

/// Application error types for the setup API
#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    Forbidden(String),
    NotFound(String),
    ServerError(String),
    Broker(BrokerError),
}

impl From<BrokerError> for AppError {
    fn from(err: BrokerError) -> Self {
        AppError::Broker(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error, error_code) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg, None),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg, None),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg, None),
            AppError::ServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg, None),
            AppError::Broker(err) => {
                let status = match err.code() {
                    ErrorCode::AuthError => StatusCode::UNAUTHORIZED,
                    ErrorCode::RateLimit => StatusCode::TOO_MANY_REQUESTS,
                    ErrorCode::IntegrationError => StatusCode::BAD_GATEWAY,
                };
                (status, err.to_string(), Some(err.code()))
            }
        };

        (status, Json(ErrorResponse { error, error_code })).into_response()
    }
}

/// `?account=` query parameter
#[derive(Deserialize, Debug, Default)]
pub struct AccountQuery {
    #[serde(default)]
    pub account: Option<String>,
    /// Space- or comma-separated scope override for OAuth setup
    #[serde(default)]
    pub scopes: Option<String>,
}

impl AccountQuery {
    /// Account name, defaulting to the sentinel. Rejects names that cannot
    /// round-trip through a setup URL or a log line.
    pub fn account(&self) -> Result<String, AppError> {
        let account = match self.account.as_deref().map(str::trim) {
            None | Some("") => return Ok(DEFAULT_ACCOUNT.to_string()),
            Some(account) => account,
        };
        if account.len() > MAX_ACCOUNT_LEN || account.chars().any(char::is_control) {
            return Err(AppError::BadRequest(format!(
                "Invalid account name (at most {} printable characters)",
                MAX_ACCOUNT_LEN
            )));
        }
        Ok(account.to_string())
    }
}

/// Create the setup API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/auth/:provider/setup", get(setup::setup))
        .route("/auth/:provider/callback", get(setup::callback))
        .route("/auth/:provider/status", get(status::provider_status))
        .route("/auth/:provider/report", post(status::report))
        .route("/api/status", get(status::all_status))
        .layer(middleware::from_fn(require_loopback))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn unknown_provider(provider: &str) -> AppError {
    AppError::NotFound(format!("Provider '{}' not found", provider))
}
