use super::AppError;
use axum::{
    extract::{ConnectInfo, Request},
    middleware::Next,
    response::Response,
};
use std::net::SocketAddr;
use tracing::warn;

/// Rejects non-loopback peers with 403.
///
/// Requests without connection info (in-process routers in tests) pass.
pub async fn require_loopback(request: Request, next: Next) -> Result<Response, AppError> {
    if let Some(ConnectInfo(peer)) = request.extensions().get::<ConnectInfo<SocketAddr>>() {
        if !peer.ip().to_canonical().is_loopback() {
            warn!(peer = %peer, path = %request.uri().path(), "Rejected non-loopback request");
            return Err(AppError::Forbidden(
                "The setup API only accepts requests from localhost".to_string(),
            ));
        }
    }
    Ok(next.run(request).await)
}
