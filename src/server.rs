use crate::config::Config;
use crate::handlers::{
    delete_bucket, get_bucket, get_config, get_metrics, health_check, passthrough,
    readiness_check, reload_config, update_config, AppState, SharedState,
};
use crate::health::HealthChecker;
use crate::middleware::{admin_auth_middleware, logging_middleware, rate_limit_middleware};
use crate::throttler::Throttler;
use axum::routing::{get, post};
use axum::{middleware, Router};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Build the router: health endpoints, the token-guarded `/admin` API and a
/// pass-through fallback, all behind admission control.
pub fn create_app(state: SharedState) -> Router {
    let throttler = state.throttler.clone();
    HealthChecker::mark_started();

    let admin = Router::new()
        .route("/metrics", get(get_metrics))
        .route("/config", get(get_config).put(update_config))
        .route("/config/reload", post(reload_config))
        .route("/buckets/:key", get(get_bucket).delete(delete_bucket))
        .route_layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware));

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .nest("/admin", admin)
        .fallback(passthrough)
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(middleware::from_fn(logging_middleware))
                .layer(middleware::from_fn_with_state(throttler, rate_limit_middleware)),
        )
}

pub struct Server {
    app: Router,
    bind_addr: SocketAddr,
}

impl Server {
    pub fn new(config: &Config, throttler: Arc<Throttler>, rules_file: Option<PathBuf>) -> Self {
        let mut state = AppState::new(throttler, rules_file);
        if let Some(token) = &config.admin_token {
            state = state.with_admin_token(token.clone());
        }
        let state = Arc::new(state);
        Self {
            app: create_app(state),
            bind_addr: config.bind_addr,
        }
    }

    pub async fn run(self) -> std::io::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.bind_addr).await?;

        tracing::info!("Gatekeeper listening on {}", self.bind_addr);
        tracing::info!("Health check available at /health");
        tracing::info!("Admin API available under /admin");

        axum::serve(
            listener,
            self.app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
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
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        },
    }
}
