//! Status and failure-report handlers. None of these call a provider.

use super::{unknown_provider, AccountQuery, AppError, AppState};
use crate::capture::JobSnapshot;
use crate::credentials::CredentialKey;
use crate::facade::{CredentialStatus, ProviderStatus};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use serde::Serialize;

#[derive(Serialize)]
pub struct StatusResponse {
    #[serde(flatten)]
    credential: CredentialStatus,
    /// Latest session capture job for this key, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    capture: Option<JobSnapshot>,
}

#[derive(Serialize)]
pub struct AllStatusResponse {
    providers: Vec<ProviderStatus>,
}

#[derive(Serialize)]
pub struct ReportResponse {
    reported: bool,
    provider: String,
    account: String,
}

/// GET /auth/:provider/status
pub async fn provider_status(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(query): Query<AccountQuery>,
) -> Result<Json<StatusResponse>, AppError> {
    let account = query.account()?;
    if state.facade.registry().get(&provider).is_none() {
        return Err(unknown_provider(&provider));
    }

    let credential = state.facade.status(&provider, &account)?;
    let capture = state
        .jobs
        .snapshot(&CredentialKey::new(&provider, &account));

    Ok(Json(StatusResponse {
        credential,
        capture,
    }))
}

/// POST /auth/:provider/report
pub async fn report(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(query): Query<AccountQuery>,
) -> Result<(StatusCode, Json<ReportResponse>), AppError> {
    let account = query.account()?;
    if state.facade.registry().get(&provider).is_none() {
        return Err(unknown_provider(&provider));
    }

    state.facade.report_auth_failure(&provider, &account)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(ReportResponse {
            reported: true,
            provider,
            account,
        }),
    ))
}

/// GET /api/status
pub async fn all_status(State(state): State<AppState>) -> Json<AllStatusResponse> {
    Json(AllStatusResponse {
        providers: state.facade.provider_statuses(),
    })
}
