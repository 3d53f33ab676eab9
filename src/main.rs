use clap::Parser;
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

use user_api_server::config::Args;
use user_api_server::rate_limit::{SlidingWindowLimiter, spawn_sweeper};
use user_api_server::routes::create_router;
use user_api_server::state::AppState;
use user_api_server::store::InMemoryUserStore;

#[tokio::main]
async fn main() -> ExitCode {
    // parse cli arguments (env variables fill in whatever is not passed)
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let settings = match args.validate() {
        Ok(settings) => settings,
        Err(e) => {
            error!("invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let limiter = match SlidingWindowLimiter::new(settings.rate_limit) {
        Ok(limiter) => Arc::new(limiter),
        Err(e) => {
            error!("invalid rate limit configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    // document store comes up on its own, the limiter never consults it
    let users = Arc::new(InMemoryUserStore::new());
    info!("user store initialized");

    let state = Arc::new(AppState {
        limiter: limiter.clone(),
        users,
        trusted_client_header: settings.trusted_client_header.clone(),
    });

    // spawn the idle-client sweeper
    spawn_sweeper(limiter, settings.sweep_interval);

    let app = create_router(state, settings.cors_origin.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("failed to bind {addr}: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!("Server is running on port {}", settings.port);
    info!(origin = ?settings.cors_origin, "CORS origin");
    info!(
        window_ms = settings.rate_limit.window_ms,
        max_requests = settings.rate_limit.max_requests,
        trusted_header = ?settings.trusted_client_header,
        "rate limiting enabled"
    );

    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await;

    match served {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("server error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}
