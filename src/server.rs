//! Application state assembly and the top-level serve/shutdown sequence:
//! an `AppState` struct plus a `start_server`/`shutdown_signal` split,
//! holding the session manager, registry, hub, and message store this
//! system needs.

use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::api::routes::create_router;
use crate::config::AppConfig;
use crate::hub::Hub;
use crate::registry::Registry;
use crate::router::Router;
use crate::session_manager::SessionManager;
use crate::storage::{SqliteStore, Store};

const SHUTDOWN_BOUND: Duration = Duration::from_secs(30);
const RATE_LIMITER_PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// Process-lifetime singletons, constructed in dependency order and
/// shared behind `Arc` with every HTTP handler and websocket session
/// task.
pub struct AppState {
    pub config: AppConfig,
    pub store: Arc<dyn Store>,
    pub session_manager: Arc<SessionManager>,
    pub hub: Hub,
}

/// Background tasks spawned alongside [`AppState`] that the bootstrap
/// binary must join during shutdown: the hub's drain task and the rate
/// limiter's periodic pruner.
pub struct Runtime {
    hub_drain: JoinHandle<()>,
    pruner_shutdown: CancellationToken,
    pruner_handle: JoinHandle<()>,
}

impl Runtime {
    /// Stops the pruner, then hands `hub` (any clone of the one in
    /// `AppState`) to [`Hub::stop`], bounded by the 30s total shutdown
    /// deadline.
    pub async fn shutdown(self, hub: Hub) {
        self.pruner_shutdown.cancel();
        let _ = self.pruner_handle.await;
        let _ = tokio::time::timeout(SHUTDOWN_BOUND, hub.stop(self.hub_drain)).await;
    }
}

/// Builds every singleton in dependency order: store, session manager
/// (which loads active sessions from the store), registry, router, hub.
pub async fn build_app_state(config: AppConfig) -> eyre::Result<(Arc<AppState>, Runtime)> {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::open(
        &config.database.path,
        Duration::from_secs(config.database.timeout),
    )?);

    let session_manager = Arc::new(SessionManager::load(store.clone()).await?);
    let registry = Arc::new(Registry::new());
    let router = Arc::new(Router::new(store.clone(), registry.clone()));
    let (hub, hub_drain) = Hub::start(router.clone(), registry);

    let pruner_shutdown = CancellationToken::new();
    let pruner_handle = tokio::spawn(prune_rate_limiter_periodically(
        router,
        pruner_shutdown.clone(),
    ));

    let state = Arc::new(AppState {
        config,
        store,
        session_manager,
        hub,
    });
    let runtime = Runtime {
        hub_drain,
        pruner_shutdown,
        pruner_handle,
    };

    Ok((state, runtime))
}

async fn prune_rate_limiter_periodically(router: Arc<Router>, shutdown: CancellationToken) {
    let mut tick = tokio::time::interval(RATE_LIMITER_PRUNE_INTERVAL);
    loop {
        tokio::select! {
            _ = tick.tick() => router.prune_rate_limiter(),
            _ = shutdown.cancelled() => break,
        }
    }
}

/// Binds the listener and serves HTTP/WS traffic until either the server
/// errors or `shutdown` is cancelled, then stops accepting new
/// connections and closes the store.
pub async fn start_server(state: Arc<AppState>, shutdown: CancellationToken) -> eyre::Result<()> {
    let addr = state.config.listen_addr()?;
    let app = create_router(state.clone());

    info!(%addr, "switchboard listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let serve_shutdown = shutdown.clone();
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move { serve_shutdown.cancelled().await })
        .await?;

    info!("http listener stopped, closing active connections");
    for conn in state.hub.registry().all_connections() {
        conn.close();
    }

    info!("closing store");
    let _ = tokio::time::timeout(SHUTDOWN_BOUND, state.store.close()).await;

    Ok(())
}

/// Resolves once either a ctrl-c or (on unix) SIGTERM is observed.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
}
