use form_collab::config::Config;
use form_collab::routes::create_app;
use form_collab::services::auth_service::JwtVerifier;
use form_collab::store::open_store;
use form_collab::ws::hub::CollabHub;
use std::panic;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() {

    // Set panic hook for better error messages
    panic::set_hook(Box::new(|info| {
        eprintln!("PANIC: {info}");
    }));

    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            // Default to info level, but allow debug for our app
            "form_collab=debug,tower_http=debug,axum::rejection=trace,info".into()
        }))
        .init();

    info!("Starting server...");

    // Load configuration
    let config = Config::load().unwrap_or_else(|e| {
        error!("Failed to load configuration: {}", e);
        warn!("Using default configuration");
        Config::default()
    });

    if config.auth_jwt_secret.is_none() {
        warn!("No JWT secret configured - every connection will be refused");
    }

    // Connect the shared state store, an unreachable Redis is fatal
    let store = match open_store(&config).await {
        Ok(store) => store,
        Err(e) => {
            error!("Failed to open the state store: {}", e);
            std::process::exit(1);
        }
    };

    // Build the hub and its background tasks
    let verifier = Arc::new(JwtVerifier::new(
        config.auth_jwt_secret.as_deref(),
        Duration::from_secs(config.auth_cache_ttl_secs),
    ));
    let address = config.server_address();
    let drain = config.shutdown_drain();
    let hub = CollabHub::new(config, store, verifier);
    let relay = hub.spawn_relay().await;
    let sweeper = hub.spawn_sweeper();

    // Start the HTTP server
    let listener = match tokio::net::TcpListener::bind(&address).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to {}: {}", address, e);
            return;
        }
    };

    info!("🚀 Server running on http://{}", address);
    info!("📡 WebSocket available at ws://{}/ws", address);
    info!("🆔 Instance id: {}", hub.instance_id());

    let app = create_app(hub.clone());
    let shutdown_hub = hub.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            shutdown_hub.shutdown();
        })
        .await;
    if let Err(e) = served {
        error!("Server error: {}", e);
    }

    // Let open sockets flush their queues and run their cleanup
    if !hub.wait_for_drain(drain + Duration::from_secs(1)).await {
        warn!("Shutting down with connections still open");
    }
    relay.abort();
    sweeper.abort();
    info!("👋 Server stopped");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
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
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
