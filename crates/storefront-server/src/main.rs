//! Development server for the storefront gateway
//!
//! Mounts the gateway routes on top of an in-memory message store. The
//! `X-User-Id` header stands in for the session layer of the real backend:
//! requests carrying it are treated as authenticated as that user.

use axum::{
    Json, Router,
    extract::{Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::post,
};
use clap::Parser;
use std::{io, net::SocketAddr, sync::Arc};
use storefront_gateway::{
    AuthenticatedUser, ConfigError, ExtensionIdentity, GatewayConfig, GatewayManager,
    InMemoryMessageStore, ProductStockDelta, UserId, gateway_routes,
};
use tokio::{net::TcpListener, signal};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Header carrying the caller's user id in development
const USER_ID_HEADER: &str = "x-user-id";

const DEFAULT_LOG_FILTER: &str = "storefront_gateway=info,storefront_server=info";

#[derive(Parser, Debug)]
#[command(name = "storefront-server", version)]
#[command(about = "Storefront real-time gateway - development server")]
struct Cli {
    /// Address to listen on
    #[arg(long, env = "STOREFRONT_BIND_ADDR", default_value = "127.0.0.1:8080")]
    bind: SocketAddr,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[derive(Debug, thiserror::Error)]
enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to bind {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },

    #[error("server error: {0}")]
    Serve(#[from] io::Error),
}

#[tokio::main]
async fn main() -> Result<(), ServerError> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = GatewayConfig::from_env()?;
    let manager = GatewayManager::start(
        config,
        Arc::new(InMemoryMessageStore::new()),
        Arc::new(ExtensionIdentity),
    );

    let listener = TcpListener::bind(cli.bind)
        .await
        .map_err(|source| ServerError::Bind {
            addr: cli.bind,
            source,
        })?;
    info!(addr = %cli.bind, "storefront server listening");

    let shutdown_manager = Arc::clone(&manager);
    axum::serve(listener, app(manager))
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            shutdown_manager.shutdown().await;
        })
        .await?;

    info!("storefront server stopped");
    Ok(())
}

fn init_tracing(json: bool) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let builder = tracing_subscriber::fmt().with_env_filter(env_filter);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

fn app(manager: Arc<GatewayManager>) -> Router {
    let dev_routes = Router::new()
        .route("/dev/stock-update", post(stock_update))
        .with_state(Arc::clone(&manager));

    Router::new()
        .merge(gateway_routes(manager))
        .merge(dev_routes)
        .layer(middleware::from_fn(dev_identity))
        .layer(TraceLayer::new_for_http())
}

/// Map `X-User-Id` to the identity extension the gateway reads
async fn dev_identity(mut request: Request, next: Next) -> Response {
    let user_id = request
        .headers()
        .get(USER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().parse::<u64>());

    match user_id {
        Some(Ok(id)) => {
            request
                .extensions_mut()
                .insert(AuthenticatedUser(UserId(id)));
        }
        Some(Err(e)) => warn!(error = %e, "ignoring malformed {USER_ID_HEADER} header"),
        None => {}
    }

    next.run(request).await
}

/// Simulate an order fulfilment announcing stock changes
async fn stock_update(
    State(manager): State<Arc<GatewayManager>>,
    Json(deltas): Json<Vec<ProductStockDelta>>,
) -> Response {
    let outcome = manager.broadcast_stock_update(&deltas).await;
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "delivered": outcome.delivered,
            "pruned": outcome.pruned,
        })),
    )
        .into_response()
}

/// Resolve on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
        },
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        },
    }
}
