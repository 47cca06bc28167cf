//! Read-only distribution API over the build coordinator.

pub mod errors;
pub mod handlers;
pub mod range;

use std::future::Future;
use std::net::TcpListener;
use std::sync::Arc;

use anyhow::Result;
use axum::routing::{any, get};
use axum::Router;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::{ServeArgs, Settings};
use crate::coordinator::BuildCoordinator;

pub struct AppState {
    pub coordinator: BuildCoordinator,
}

impl AppState {
    pub fn new(coordinator: BuildCoordinator) -> Arc<Self> {
        Arc::new(Self { coordinator })
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v2", get(handlers::api_version_check))
        .route("/v2/", get(handlers::api_version_check))
        .route("/v2/_catalog", get(handlers::catalog))
        .route("/v2/*path", any(handlers::dispatch))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve on an already bound listener until `shutdown` resolves.
pub async fn run(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    listener.set_nonblocking(true)?;
    axum::Server::from_tcp(listener)?
        .serve(router(state).into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

pub async fn start_server(settings: &Settings, args: &ServeArgs) -> Result<()> {
    let coordinator = settings.coordinator()?;
    let addr = args.addr();
    let listener = TcpListener::bind(addr)?;
    info!(
        %addr,
        host_root = %settings.host_root.display(),
        layer_mode = ?settings.layer_mode,
        "Registry listening"
    );

    run(listener, AppState::new(coordinator.clone()), shutdown_signal()).await?;

    let stats = coordinator.stats();
    info!(
        builds = stats.builds_started,
        failed = stats.builds_failed,
        hit_rate = stats.hit_rate(),
        "Registry stopped"
    );
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to listen for SIGTERM");
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

    info!("Shutdown signal received, starting graceful shutdown");
}
