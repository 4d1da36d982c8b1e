use anyhow::{Context, Result};
use authbroker::api::{create_router, AppState};
use authbroker::capture::{CaptureEngine, CaptureJobs, CaptureSettings, ChromiumDriver};
use authbroker::config::{self, secrets, EnvSource, ProcessEnv};
use authbroker::credentials::CredentialStore;
use authbroker::facade::CredentialFacade;
use authbroker::oauth::{
    run_state_cleanup, AuthorizationCodeManager, DirectExchangeManager, StateManager,
};
use authbroker::registry::ProviderRegistry;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "authbroker=info,provider_clients=info".into()),
        )
        .init();

    info!("Auth broker starting...");

    let env = ProcessEnv;
    let config_path =
        std::env::var("AUTHBROKER_CONFIG").unwrap_or_else(|_| "authbroker.toml".to_string());
    let config = config::load_or_default(&config_path)?;

    info!(
        config = %config_path,
        store = %config.store.path.display(),
        host = %config.server.host,
        port = config.server.port,
        headless = config.capture.headless,
        "Configuration loaded"
    );

    // Initialize credential store (encrypted when a key is configured)
    let store = Arc::new(match env.var(&secrets::encryption_key_var()) {
        Some(key) => CredentialStore::with_encryption(&config.store.path, &key)
            .context("Failed to initialize encrypted credential store")?,
        None => CredentialStore::new(&config.store.path),
    });
    info!(
        encrypted = store.is_encrypted(),
        accounts = store.list_all().len(),
        "Credential store initialized"
    );

    let registry = Arc::new(ProviderRegistry::from_config(&config, &env));
    let configured = registry.iter().filter(|(_, s)| s.is_configured()).count();
    info!(
        providers = registry.names().count(),
        configured = configured,
        "Provider registry loaded"
    );

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.client.request_timeout_seconds))
        .build()
        .context("Failed to build HTTP client")?;

    // One state map shared by both OAuth variants; the callback decides
    let states = StateManager::new(config.oauth.state_expiry_seconds);
    let callback_base_url = config.server.callback_base_url();
    let authorization_code = Arc::new(AuthorizationCodeManager::new(
        Arc::clone(&store),
        states.clone(),
        http.clone(),
        callback_base_url.clone(),
        config.oauth.refresh_skew_seconds,
    ));
    let direct = Arc::new(DirectExchangeManager::new(
        Arc::clone(&store),
        states.clone(),
        http,
        callback_base_url.clone(),
    ));
    let facade = Arc::new(CredentialFacade::new(
        registry,
        Arc::clone(&store),
        authorization_code,
        direct,
    ));

    let driver = Arc::new(ChromiumDriver::new(config.capture.chrome_executable.clone()));
    let engine = Arc::new(CaptureEngine::new(
        driver,
        Arc::clone(&store),
        CaptureSettings::from(&config.capture),
    ));
    let jobs = Arc::new(CaptureJobs::new(engine));

    let cleanup_handle = tokio::spawn(run_state_cleanup(
        states,
        config.oauth.state_cleanup_seconds,
    ));

    // Start HTTP API server
    let router = create_router(AppState { facade, jobs });
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!(addr = %addr, callback_base_url = %callback_base_url, "Setup API listening");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for ctrl_c signal");
        }
        info!("Shutdown signal received");
    })
    .await
    .context("Setup API server error")?;

    cleanup_handle.abort();
    info!("Auth broker stopped");

    Ok(())
}
