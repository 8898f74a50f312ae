//! HTTP routes of the gateway
//!
//! - `GET /ws?otp=<key>` upgrades to a WebSocket. A missing or invalid OTP
//!   does not reject the upgrade; the connection becomes a read-only guest.
//! - `POST /ws/otp` issues a one-time pass to an authenticated caller.
//! - `GET /ws/stats` reports connection and OTP counts.

use crate::manager::GatewayManager;
use axum::{
    Json, Router,
    extract::{Query, State, ws::WebSocketUpgrade},
    http::{Extensions, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// WebSocket upgrade query parameters
#[derive(Debug, Deserialize)]
pub struct WsUpgradeQuery {
    /// One-time pass from `POST /ws/otp`
    pub otp: Option<String>,
}

/// Response of `POST /ws/otp`
#[derive(Debug, Serialize, Deserialize)]
pub struct OtpResponse {
    pub otp: String,
}

/// Routes served by the gateway, ready to be merged into the host router
pub fn gateway_routes(manager: Arc<GatewayManager>) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade_handler))
        .route("/ws/otp", post(issue_otp_handler))
        .route("/ws/stats", get(stats_handler))
        .with_state(manager)
}

/// Classify the caller, then upgrade
///
/// Extraction of the upgrade happens before classification, so a request
/// that cannot be upgraded leaves its OTP unconsumed.
async fn ws_upgrade_handler(
    State(manager): State<Arc<GatewayManager>>,
    Query(query): Query<WsUpgradeQuery>,
    headers: HeaderMap,
    extensions: Extensions,
    ws: WebSocketUpgrade,
) -> Response {
    let identity = manager.resolve_identity(&headers, &extensions);
    let classification = manager.classify(query.otp.as_deref(), identity).await;
    debug!(classification = %classification, "upgrading connection");

    ws.on_failed_upgrade(|e| warn!(error = %e, "websocket upgrade failed"))
        .on_upgrade(move |socket| async move {
            let (sink, stream) = socket.split();
            manager.attach(sink, stream, classification).await;
        })
}

async fn issue_otp_handler(
    State(manager): State<Arc<GatewayManager>>,
    headers: HeaderMap,
    extensions: Extensions,
) -> Response {
    let Some(user_id) = manager.resolve_identity(&headers, &extensions) else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"error": "authentication required"})),
        )
            .into_response();
    };

    match manager.issue_otp().await {
        Ok(otp) => {
            debug!(user_id = %user_id, "issued OTP");
            (StatusCode::CREATED, Json(OtpResponse { otp: otp.key })).into_response()
        }
        Err(e) => {
            error!(user_id = %user_id, error = %e, "failed to issue OTP");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "could not issue one-time pass"})),
            )
                .into_response()
        }
    }
}

async fn stats_handler(State(manager): State<Arc<GatewayManager>>) -> Response {
    Json(manager.stats().await).into_response()
}
