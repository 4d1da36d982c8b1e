//! Setup and OAuth callback handlers.

use super::{unknown_provider, AccountQuery, AppError, AppState};
use crate::capture::{JobSnapshot, JobStart};
use crate::registry::AuthStrategy;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Redirect, Response},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// OAuth callback query parameters
#[derive(Deserialize)]
pub struct OAuthCallback {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

/// OAuth success response
#[derive(Serialize)]
pub struct OAuthSuccessResponse {
    success: bool,
    message: String,
    provider: String,
    account: String,
}

/// Session capture accepted
#[derive(Serialize)]
pub struct CaptureAccepted {
    provider: String,
    account: String,
    already_running: bool,
    capture: JobSnapshot,
    status_path: String,
}

/// GET /auth/:provider/setup
///
/// OAuth providers redirect to the consent page. Browser-session providers
/// start a capture job in the background and answer 202 immediately.
pub async fn setup(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(query): Query<AccountQuery>,
) -> Result<Response, AppError> {
    let account = query.account()?;
    debug!(provider = %provider, account = %account, "Setup requested");

    let strategy = state
        .facade
        .registry()
        .get(&provider)
        .ok_or_else(|| unknown_provider(&provider))?;

    match strategy {
        AuthStrategy::AuthorizationCode(oauth) | AuthStrategy::DirectExchange(oauth) => {
            // A missing client is an operator problem, not a provider fault
            oauth
                .client()
                .map_err(|e| AppError::ServerError(e.to_string()))?;
            let scopes = query.scopes.as_deref().map(|s| oauth.split_scopes(s));
            let scopes = scopes.as_deref().filter(|s| !s.is_empty());

            let url = match strategy {
                AuthStrategy::DirectExchange(_) => {
                    state.facade.direct().build_consent_url(oauth, scopes, &account)?
                }
                _ => state
                    .facade
                    .authorization_code()
                    .build_consent_url(oauth, scopes, &account)?,
            };

            info!(provider = %provider, account = %account, "Redirecting to OAuth provider");
            Ok(Redirect::temporary(&url).into_response())
        }
        AuthStrategy::BrowserSession(browser) => {
            if let Some(reason) = &browser.profile.unconfigured {
                return Err(AppError::ServerError(reason.clone()));
            }

            let (already_running, capture) =
                match state
                    .jobs
                    .start(browser.profile.clone(), &account, browser.login.clone())
                {
                    JobStart::Started(snapshot) => {
                        info!(provider = %provider, account = %account, "Session capture started");
                        (false, snapshot)
                    }
                    JobStart::AlreadyRunning(snapshot) => (true, snapshot),
                };

            let body = CaptureAccepted {
                status_path: format!(
                    "/auth/{}/status?account={}",
                    provider,
                    urlencoding::encode(&account)
                ),
                provider,
                account,
                already_running,
                capture,
            };
            Ok((StatusCode::ACCEPTED, Json(body)).into_response())
        }
    }
}

/// GET /auth/:provider/callback
///
/// Exchanges the authorization code and stores the credential under the key
/// recorded for `state`.
pub async fn callback(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(callback): Query<OAuthCallback>,
) -> Result<Json<OAuthSuccessResponse>, AppError> {
    debug!(provider = %provider, "OAuth callback received");

    // Check for OAuth errors
    if let Some(error) = callback.error {
        let description = callback
            .error_description
            .unwrap_or_else(|| "Unknown error".to_string());
        warn!(
            provider = %provider,
            error = %error,
            description = %description,
            "OAuth authorization failed"
        );
        return Err(AppError::BadRequest(format!(
            "OAuth authorization failed: {} - {}",
            error, description
        )));
    }

    let code = callback
        .code
        .ok_or_else(|| AppError::BadRequest("Missing 'code' parameter".to_string()))?;
    let csrf_state = callback
        .state
        .ok_or_else(|| AppError::BadRequest("Missing 'state' parameter".to_string()))?;

    let strategy = state
        .facade
        .registry()
        .get(&provider)
        .ok_or_else(|| unknown_provider(&provider))?;

    let key = match strategy {
        AuthStrategy::AuthorizationCode(oauth) => {
            state
                .facade
                .authorization_code()
                .exchange(oauth, &code, &csrf_state)
                .await?
        }
        AuthStrategy::DirectExchange(oauth) => {
            state
                .facade
                .direct()
                .exchange(oauth, &code, &csrf_state)
                .await?
        }
        AuthStrategy::BrowserSession(_) => {
            return Err(AppError::BadRequest(format!(
                "Provider '{}' does not use OAuth",
                provider
            )));
        }
    };

    state.facade.clear_report(&key);

    Ok(Json(OAuthSuccessResponse {
        success: true,
        message: format!("Successfully connected {} (account {})", key.provider, key.account),
        provider: key.provider,
        account: key.account,
    }))
}
