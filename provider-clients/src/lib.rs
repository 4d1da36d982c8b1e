//! Authenticated HTTP clients for browser-session providers.
//!
//! A [`SessionClient`] replays a captured session (cookie jar plus client
//! token) against a provider's internal API. Each response's `Set-Cookie`
//! headers are merged back into the stored session, and failures are mapped
//! onto the broker's [`BrokerError`](authbroker::BrokerError) taxonomy.
//!
//! With the `impersonate` feature, providers that fingerprint TLS handshakes
//! are reached through a Chrome-emulating client.
//!
//! ```no_run
//! # async fn run(store: std::sync::Arc<authbroker::credentials::CredentialStore>) -> anyhow::Result<()> {
//! use provider_clients::{ApiRequest, ClientProfile, SessionClient};
//!
//! let config = authbroker::config::ClientConfig {
//!     max_retries: 3,
//!     backoff_base_ms: 500,
//!     request_timeout_seconds: 30,
//! };
//! let client = SessionClient::new(ClientProfile::linkedin(), store, &config)?;
//! let connections = client
//!     .fetch_all(ApiRequest::get("/relationships/connections"), "default", 10)
//!     .await?;
//! println!("{} connections", connections.items.len());
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod cookies;
pub mod pagination;
pub mod profile;
mod transport;

pub use client::{ApiRequest, ApiResponse, RetryPolicy, SessionClient};
pub use pagination::{Paged, Pagination};
pub use profile::ClientProfile;
