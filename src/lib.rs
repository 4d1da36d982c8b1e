// Shared error taxonomy
pub mod error;

// TOML configuration and environment secrets
pub mod config;

// Durable credential store
pub mod credentials;

// OAuth authorization-code and direct-exchange flows
pub mod oauth;

// Browser-automated session capture
pub mod capture;

// Provider -> authentication strategy
pub mod registry;

// Credential facade used by every capability
pub mod facade;

// Setup-flow HTTP API
pub mod api;

pub use error::BrokerError;
pub use facade::{Credential, CredentialFacade};
