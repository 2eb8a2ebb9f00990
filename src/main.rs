use acctlink::api::{create_router, AppState, IdempotencyState, OAuthAppState};
use acctlink::cache::{run_cache_cleanup, MemoryCache, RedisCache, TransientCache};
use acctlink::config::AppConfig;
use acctlink::connections::ConnectionStore;
use acctlink::crypto::{Cipher, TokenSigner};
use acctlink::oauth::OAuthService;
use acctlink::providers::{AuthCodeClient, ClientCredentialsClient};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Seconds between sweeps of the in-process cache
const CACHE_CLEANUP_INTERVAL_SECONDS: u64 = 60;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "acctlink=info".into()),
        )
        .init();

    info!("acctlink starting...");

    let config_path = std::env::var("ACCTLINK_CONFIG").unwrap_or_else(|_| "acctlink.toml".to_string());
    let config = AppConfig::load(&config_path)?;

    // Transient cache
    let cache: Arc<dyn TransientCache> = match config.cache.redis_url.as_deref() {
        Some(url) => {
            let redis = RedisCache::connect(url).await?;
            info!("Using Redis transient cache");
            Arc::new(redis)
        }
        None => {
            warn!("No redis_url configured, using in-process cache (single instance only)");
            let memory = MemoryCache::new();
            tokio::spawn(run_cache_cleanup(memory.clone(), CACHE_CLEANUP_INTERVAL_SECONDS));
            Arc::new(memory)
        }
    };

    // Connection store
    let store = Arc::new(
        ConnectionStore::new(&config.store.database_path)
            .context("Failed to open connection store")?,
    );
    info!(path = %config.store.database_path, "Connection store ready");

    // Provider clients and orchestrator
    let timeout = Duration::from_secs(config.oauth.http_timeout_seconds);
    let provider_a = ClientCredentialsClient::new(&config.provider_a, timeout)?;
    let provider_b = AuthCodeClient::new(&config.provider_b, timeout)?;
    let cipher = Cipher::new(&config.security.encryption_key)?;

    let service = Arc::new(OAuthService::new(
        Arc::clone(&cache),
        store,
        cipher,
        provider_a,
        provider_b,
        config.oauth.state_ttl_seconds,
    ));

    let token_signer = config
        .security
        .token_secret
        .as_ref()
        .map(|secret| Arc::new(TokenSigner::new(secret.as_bytes())));
    if token_signer.is_none() {
        warn!("No token_secret configured, trusting userId parameters");
    }

    let app = create_router(AppState {
        oauth: OAuthAppState {
            service,
            token_signer,
            frontend_url: config.server.frontend_url.trim_end_matches('/').to_string(),
        },
        idempotency: IdempotencyState {
            cache,
            ttl_seconds: config.idempotency.ttl_seconds,
            max_body_bytes: config.idempotency.max_body_bytes,
        },
        api_base_path: config.server.api_base_path.clone(),
        cors_origins: config.server.cors_origins.clone(),
    });

    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind_addr))?;
    info!(addr = %config.server.bind_addr, base_path = %config.server.api_base_path, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    info!("acctlink stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
